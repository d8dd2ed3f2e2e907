use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// Reads one line, terminator included, waiting at most `next_wait()` for each read.
/// Returns an empty vector when the stream ends before any byte of the line.
async fn collect_line<S, F>(
    reader: &mut BufReader<S>,
    max_len: usize,
    context: &str,
    mut next_wait: F,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
    F: FnMut() -> Result<Duration>,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    let mut collected = Vec::new();

    loop {
        let wait = next_wait()?;
        let available = timeout_with_context(wait, reader.fill_buf(), context).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(collected);
            }
            bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow while {context}"))?
            > max_len
        {
            bail!("line exceeds configured limit of {max_len} bytes while {context}");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            return Ok(collected);
        }
    }
}

/// Reads a raw line (terminator included) with a per-read idle timeout.
pub(crate) async fn read_raw_line<S>(
    reader: &mut BufReader<S>,
    idle_timeout: Duration,
    max_len: usize,
    context: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    collect_line(reader, max_len, context, || Ok(idle_timeout)).await
}

/// Reads a UTF-8 line that must complete before `deadline`.
pub(super) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let context = format!("reading line from {peer}");
    let collected = collect_line(reader, max_len, &context, || {
        remaining_deadline(deadline, &context)
    })
    .await?;
    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

pub(super) fn remaining_deadline(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
        .ok_or_else(|| anyhow!("timed out {context}"))
}
