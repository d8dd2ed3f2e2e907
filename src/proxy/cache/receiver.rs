use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use http::Method;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::io_util::send_all;
use crate::proxy::forward_error::classify_forward_error;
use crate::proxy::http::{
    ChunkKind, ChunkReader, parse_content_length, parse_status_code, response_body_length,
};
use crate::proxy::upstream::connect_origin;

use super::entry::CacheEntry;

#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_header_size: usize,
    pub chunk_size: usize,
    /// Responses larger than this are relayed but not kept.
    pub max_entry_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchEnd {
    Complete,
    Aborted,
}

/// Producer side of a shared fetch: pulls the origin response into a [`CacheEntry`].
pub struct Receiver {
    entry: Arc<CacheEntry>,
    host: String,
    port: u16,
    request: Vec<u8>,
    limits: FetchLimits,
}

impl Receiver {
    pub fn new(
        entry: Arc<CacheEntry>,
        host: impl Into<String>,
        port: u16,
        request: Vec<u8>,
        limits: FetchLimits,
    ) -> Self {
        Self {
            entry,
            host: host.into(),
            port,
            request,
            limits,
        }
    }

    /// Runs the fetch on its own task. Its outcome is only observable through the entry.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        match self.fetch().await {
            Ok(FetchEnd::Complete) => {
                self.entry.finish();
                let state = self.entry.state();
                crate::metrics::record_origin_fetch(state.label());
                debug!(key = %self.entry.key(), state = state.label(), "origin fetch finished");
            }
            Ok(FetchEnd::Aborted) => {
                let released = self.entry.fail();
                crate::metrics::record_origin_fetch("aborted");
                debug!(
                    key = %self.entry.key(),
                    released,
                    "origin fetch abandoned without readers"
                );
            }
            Err(err) => {
                let released = self.entry.fail();
                let kind = classify_forward_error(&err);
                crate::metrics::record_origin_fetch("failed");
                crate::metrics::record_upstream_error(kind.label());
                warn!(
                    key = %self.entry.key(),
                    released,
                    error = format!("{err:#}"),
                    "origin fetch failed"
                );
            }
        }
    }

    async fn fetch(&self) -> Result<FetchEnd> {
        let limits = self.limits;
        let (stream, addr) =
            connect_origin(&self.host, self.port, limits.connect_timeout).await?;
        let origin = addr.to_string();
        let (read_half, mut write_half) = stream.into_split();
        send_all(
            &mut write_half,
            &self.request,
            limits.io_timeout,
            &format!("sending request to {origin}"),
        )
        .await?;

        let mut reader = ChunkReader::new(
            read_half,
            limits.chunk_size,
            limits.max_header_size,
            limits.io_timeout,
            origin,
        );
        let mut status = None;
        let mut content_length = None;
        let mut body_length = None;
        let mut received = 0u64;
        loop {
            if self.entry.is_aborted() {
                return Ok(FetchEnd::Aborted);
            }
            let Some(chunk) = reader.next(body_length).await? else {
                break;
            };
            match chunk.kind {
                ChunkKind::Header if status.is_none() => {
                    status = parse_status_code(&chunk.data);
                }
                ChunkKind::Header => {
                    if let Some(length) = parse_content_length(&chunk.data)? {
                        content_length = Some(length);
                    }
                }
                ChunkKind::HeadEnd => {
                    // Only GETs are fetched into the cache.
                    body_length = response_body_length(&Method::GET, status, content_length);
                    if let Some(length) = body_length
                        && length > limits.max_entry_size
                    {
                        self.demote("content length exceeds entry cap", length);
                    }
                }
                ChunkKind::Body => {}
            }

            if self.entry.append(&chunk.data)?.is_none() {
                return Ok(FetchEnd::Aborted);
            }
            received += chunk.data.len() as u64;
            if received > limits.max_entry_size {
                self.demote("response exceeds entry cap", received);
            }
        }
        Ok(FetchEnd::Complete)
    }

    fn demote(&self, reason: &'static str, size: u64) {
        if self.entry.demote_to_passthrough() {
            crate::metrics::record_cache_passthrough();
            info!(
                key = %self.entry.key(),
                size,
                cap = self.limits.max_entry_size,
                reason,
                "cache entry switched to passthrough"
            );
        }
    }
}
