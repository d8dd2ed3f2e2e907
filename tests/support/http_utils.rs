use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Reads until the peer closes. Bounded so a stuck proxy fails the test instead of hanging it.
pub async fn read_http_response<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    timeout(StdDuration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .context("timed out waiting for the proxy to close the response")??;
    Ok(buf)
}

pub async fn read_response_text<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let raw = read_http_response(stream).await?;
    Ok(String::from_utf8_lossy(&raw).to_string())
}

pub fn response_status(response: &str) -> Result<u16> {
    response
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in response: {response:?}"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).context("invalid UTF-8 request head")
}

pub fn get_request(port: u16, path: &str) -> String {
    format!("GET http://127.0.0.1:{port}{path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n")
}
