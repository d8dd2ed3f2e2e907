use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::util::timeout_with_context;

use super::line::read_raw_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Status line or header line, terminator included.
    Header,
    /// The blank line that ends the response head.
    HeadEnd,
    Body,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub data: Bytes,
}

impl Chunk {
    pub fn is_header_line(&self) -> bool {
        self.kind != ChunkKind::Body
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Head { lines: usize },
    Body { read: u64 },
    Finished,
}

/// Splits an HTTP/1 response into head lines and bounded body chunks as they arrive.
///
/// Bytes are yielded exactly as received; chunked transfer coding is not decoded, so a
/// response without `Content-Length` is read until the origin closes.
pub struct ChunkReader<S> {
    reader: BufReader<S>,
    phase: Phase,
    chunk_size: usize,
    max_line: usize,
    idle_timeout: Duration,
    origin: String,
}

impl<S> ChunkReader<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(
        stream: S,
        chunk_size: usize,
        max_line: usize,
        idle_timeout: Duration,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            reader: BufReader::new(stream),
            phase: Phase::Head { lines: 0 },
            chunk_size: chunk_size.max(1),
            max_line,
            idle_timeout,
            origin: origin.into(),
        }
    }

    /// Returns the next piece of the response, or `None` once it has ended. `content_length`
    /// bounds the body when known; a body cut short of it is an error.
    pub async fn next(&mut self, content_length: Option<u64>) -> Result<Option<Chunk>> {
        match self.phase {
            Phase::Head { lines } => self.next_head_line(lines).await.map(Some),
            Phase::Body { read } => self.next_body_chunk(read, content_length).await,
            Phase::Finished => Ok(None),
        }
    }

    async fn next_head_line(&mut self, lines: usize) -> Result<Chunk> {
        let context = format!("reading response head from {}", self.origin);
        let line = read_raw_line(&mut self.reader, self.idle_timeout, self.max_line, &context)
            .await?;
        if line.is_empty() {
            self.phase = Phase::Finished;
            if lines == 0 {
                bail!("{} closed the connection without a response", self.origin);
            }
            bail!("{} closed the connection inside the response head", self.origin);
        }
        if lines == 0 {
            ensure!(
                line.starts_with(b"HTTP/"),
                "malformed status line from {}",
                self.origin
            );
        }
        let kind = if line == b"\r\n" || line == b"\n" {
            self.phase = Phase::Body { read: 0 };
            ChunkKind::HeadEnd
        } else {
            self.phase = Phase::Head { lines: lines + 1 };
            ChunkKind::Header
        };
        Ok(Chunk {
            kind,
            data: Bytes::from(line),
        })
    }

    async fn next_body_chunk(
        &mut self,
        read: u64,
        content_length: Option<u64>,
    ) -> Result<Option<Chunk>> {
        let want = match content_length {
            Some(total) if read >= total => {
                self.phase = Phase::Finished;
                return Ok(None);
            }
            Some(total) => usize::try_from(total - read)
                .unwrap_or(usize::MAX)
                .min(self.chunk_size),
            None => self.chunk_size,
        };

        let mut buf = vec![0u8; want];
        let n = timeout_with_context(
            self.idle_timeout,
            self.reader.read(&mut buf),
            format!("reading response body from {}", self.origin),
        )
        .await?;
        if n == 0 {
            self.phase = Phase::Finished;
            if let Some(total) = content_length {
                bail!(
                    "{} closed the connection after {read} of {total} body bytes",
                    self.origin
                );
            }
            return Ok(None);
        }
        buf.truncate(n);
        self.phase = Phase::Body {
            read: read + n as u64,
        };
        Ok(Some(Chunk {
            kind: ChunkKind::Body,
            data: Bytes::from(buf),
        }))
    }
}

/// Parses a `Content-Length` header line (name matched case-insensitively). Other header lines
/// yield `Ok(None)`.
pub fn parse_content_length(line: &[u8]) -> Result<Option<u64>> {
    let Some(colon) = line.iter().position(|byte| *byte == b':') else {
        return Ok(None);
    };
    let (name, value) = line.split_at(colon);
    if !name.trim_ascii().eq_ignore_ascii_case(b"content-length") {
        return Ok(None);
    }
    let value = std::str::from_utf8(value[1..].trim_ascii())
        .context("Content-Length value is not valid UTF-8")?;
    let length = value
        .parse::<u64>()
        .with_context(|| format!("invalid Content-Length value '{value}'"))?;
    Ok(Some(length))
}

/// Extracts the status code from a response status line.
pub fn parse_status_code(line: &[u8]) -> Option<StatusCode> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    StatusCode::from_bytes(parts.next()?.as_bytes()).ok()
}

/// Body framing of a response. `Some(0)` ends the exchange at the head; `None` reads until
/// the origin closes, which also carries any final response after an interim `1xx`.
pub fn response_body_length(
    method: &Method,
    status: Option<StatusCode>,
    content_length: Option<u64>,
) -> Option<u64> {
    if *method == Method::HEAD {
        return Some(0);
    }
    match status {
        Some(status) if status.is_informational() => None,
        Some(StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED) => Some(0),
        _ => content_length,
    }
}
