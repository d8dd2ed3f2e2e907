use std::io;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proxy::http::parse_status_code;

use super::entry::{ReadOutcome, Reader};

// Longest status line the streamer inspects for the access log.
const STATUS_LINE_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("origin fetch failed after {sent} bytes reached the client")]
    OriginFailed { sent: u64 },
    #[error("client write failed after {sent} bytes")]
    ClientWrite {
        sent: u64,
        #[source]
        source: io::Error,
    },
    #[error("client write timed out after {sent} bytes")]
    ClientTimeout { sent: u64 },
    #[error("reader at offset {offset} fell behind the buffered window starting at {base_offset}")]
    FellBehind {
        offset: u64,
        base_offset: u64,
        sent: u64,
    },
}

impl StreamError {
    pub fn bytes_sent(&self) -> u64 {
        match self {
            StreamError::OriginFailed { sent }
            | StreamError::ClientWrite { sent, .. }
            | StreamError::ClientTimeout { sent }
            | StreamError::FellBehind { sent, .. } => *sent,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StreamError::OriginFailed { .. } => "origin_failed",
            StreamError::ClientWrite { .. } => "client_write",
            StreamError::ClientTimeout { .. } => "client_timeout",
            StreamError::FellBehind { .. } => "fell_behind",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub bytes: u64,
    pub status: Option<StatusCode>,
}

/// Collects the first response line as it streams past.
#[derive(Debug, Default)]
struct StatusSniffer {
    line: Vec<u8>,
    done: bool,
}

impl StatusSniffer {
    fn observe(&mut self, bytes: &[u8]) -> Option<StatusCode> {
        if self.done {
            return None;
        }
        let end = bytes.iter().position(|byte| *byte == b'\n');
        let take = end.map_or(bytes.len(), |idx| idx + 1);
        self.line.extend_from_slice(&bytes[..take]);
        if end.is_none() && self.line.len() < STATUS_LINE_LIMIT {
            return None;
        }
        self.done = true;
        parse_status_code(&self.line)
    }
}

impl Reader {
    /// Copies the entry's bytes to `writer` from this reader's offset until the fetch ends.
    ///
    /// Every chunk is written outside the entry lock. A failed or timed out write marks the
    /// reader dead so it no longer holds back trimming; the entry itself is left untouched and
    /// other readers carry on.
    pub async fn stream_to<W>(
        &mut self,
        writer: &mut W,
        chunk_size: usize,
        write_timeout: Duration,
    ) -> Result<StreamSummary, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let chunk_size = chunk_size.max(1);
        let mut offset = self.offset();
        let mut summary = StreamSummary::default();
        let mut sniffer = StatusSniffer::default();

        loop {
            match self.entry.read_from(offset, chunk_size).await {
                ReadOutcome::Data(bytes) => {
                    if let Some(status) = sniffer.observe(&bytes) {
                        summary.status = Some(status);
                    }
                    match timeout(write_timeout, writer.write_all(&bytes)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(source)) => {
                            return Err(self.give_up(StreamError::ClientWrite {
                                sent: summary.bytes,
                                source,
                            }));
                        }
                        Err(_) => {
                            return Err(self.give_up(StreamError::ClientTimeout {
                                sent: summary.bytes,
                            }));
                        }
                    }
                    offset += bytes.len() as u64;
                    summary.bytes += bytes.len() as u64;
                    self.entry.advance_reader(self.id, offset);
                }
                ReadOutcome::Eof => {
                    return match timeout(write_timeout, writer.flush()).await {
                        Ok(Ok(())) => Ok(summary),
                        Ok(Err(source)) => Err(self.give_up(StreamError::ClientWrite {
                            sent: summary.bytes,
                            source,
                        })),
                        Err(_) => Err(self.give_up(StreamError::ClientTimeout {
                            sent: summary.bytes,
                        })),
                    };
                }
                ReadOutcome::Failed => {
                    return Err(self.give_up(StreamError::OriginFailed {
                        sent: summary.bytes,
                    }));
                }
                ReadOutcome::Behind {
                    offset,
                    base_offset,
                } => {
                    return Err(self.give_up(StreamError::FellBehind {
                        offset,
                        base_offset,
                        sent: summary.bytes,
                    }));
                }
            }
        }
    }

    fn give_up(&self, err: StreamError) -> StreamError {
        self.entry.mark_reader_dead(self.id);
        crate::metrics::record_reader_failure(err.reason());
        match &err {
            StreamError::FellBehind { .. } => warn!(
                key = %self.entry.key(),
                peer = ?self.peer,
                error = %err,
                "cache reader fell behind"
            ),
            _ => debug!(
                key = %self.entry.key(),
                peer = ?self.peer,
                error = %err,
                "cache reader stopped"
            ),
        }
        err
    }
}
