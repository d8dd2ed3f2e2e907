use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::io_util::send_all;
use crate::proxy::cache::StreamError;
use crate::proxy::request::ParsedRequest;
use crate::proxy::upstream::connect_origin;
use crate::util::timeout_with_context;

use super::codec::{
    ChunkKind, ChunkReader, Http1RequestHead, parse_content_length, parse_status_code,
    response_body_length, serialize_request,
};

const REQUEST_BODY_BUFFER: usize = 8192;

#[derive(Debug, Clone, Copy)]
pub(super) struct DirectTimeouts {
    pub connect: Duration,
    pub upstream_io: Duration,
    pub client_io: Duration,
}

/// What a direct relay got through before it finished or failed.
#[derive(Debug, Default)]
pub(super) struct RelayProgress {
    pub upstream_addr: Option<SocketAddr>,
    pub request_body_bytes: u64,
    pub bytes_out: u64,
    pub status: Option<StatusCode>,
}

/// Forwards one request straight to the origin and copies the response back chunk by chunk.
///
/// `progress` is updated as the exchange advances so the caller can still tell, after an
/// error, whether any response bytes reached the client.
pub(super) async fn forward_direct<S>(
    client: &mut BufReader<S>,
    head: &Http1RequestHead,
    request: &ParsedRequest,
    chunk_size: usize,
    max_header_size: usize,
    timeouts: DirectTimeouts,
    progress: &mut RelayProgress,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (stream, addr) = connect_origin(&request.host, request.port, timeouts.connect).await?;
    progress.upstream_addr = Some(addr);
    let origin = addr.to_string();
    let (read_half, mut write_half) = stream.into_split();

    let upstream_request = serialize_request(head, request);
    send_all(
        &mut write_half,
        &upstream_request,
        timeouts.upstream_io,
        &format!("sending request to {origin}"),
    )
    .await?;
    if let Some(length) = head.headers.content_length()
        && length > 0
    {
        progress.request_body_bytes =
            relay_request_body(client, &mut write_half, length, timeouts).await?;
        timeout_with_context(
            timeouts.upstream_io,
            write_half.flush(),
            format!("flushing request body to {origin}"),
        )
        .await?;
    }

    let mut reader = ChunkReader::new(
        read_half,
        chunk_size,
        max_header_size,
        timeouts.upstream_io,
        origin,
    );
    let client_stream = client.get_mut();
    let mut content_length = None;
    let mut body_length = None;
    while let Some(chunk) = reader.next(body_length).await? {
        match chunk.kind {
            ChunkKind::Header if progress.status.is_none() => {
                progress.status = parse_status_code(&chunk.data);
            }
            ChunkKind::Header => {
                if let Some(length) = parse_content_length(&chunk.data)? {
                    content_length = Some(length);
                }
            }
            ChunkKind::HeadEnd => {
                body_length =
                    response_body_length(&request.method, progress.status, content_length);
            }
            ChunkKind::Body => {}
        }
        write_to_client(client_stream, &chunk.data, timeouts.client_io, progress).await?;
    }
    match timeout(timeouts.client_io, client_stream.flush()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(StreamError::ClientWrite {
            sent: progress.bytes_out,
            source,
        }
        .into()),
        Err(_) => Err(StreamError::ClientTimeout {
            sent: progress.bytes_out,
        }
        .into()),
    }
}

async fn write_to_client<W>(
    client: &mut W,
    bytes: &[u8],
    write_timeout: Duration,
    progress: &mut RelayProgress,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(write_timeout, client.write_all(bytes)).await {
        Ok(Ok(())) => {
            progress.bytes_out += bytes.len() as u64;
            Ok(())
        }
        Ok(Err(source)) => Err(StreamError::ClientWrite {
            sent: progress.bytes_out,
            source,
        }
        .into()),
        Err(_) => Err(StreamError::ClientTimeout {
            sent: progress.bytes_out,
        }
        .into()),
    }
}

async fn relay_request_body<S, U>(
    reader: &mut BufReader<S>,
    upstream: &mut U,
    length: u64,
    timeouts: DirectTimeouts,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut transferred = 0u64;
    let mut buffer = [0u8; REQUEST_BODY_BUFFER];
    while remaining > 0 {
        let to_read = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(buffer.len());
        let read = timeout_with_context(
            timeouts.client_io,
            reader.read(&mut buffer[..to_read]),
            "reading request body from client",
        )
        .await?;
        if read == 0 {
            bail!("client closed the connection after {transferred} of {length} request body bytes");
        }
        remaining -= read as u64;
        timeout_with_context(
            timeouts.upstream_io,
            upstream.write_all(&buffer[..read]),
            "writing request body to upstream",
        )
        .await?;
        transferred += read as u64;
    }
    Ok(transferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http::codec::read_http1_request_head;
    use crate::proxy::request::parse_http1_request;
    use tokio::net::TcpListener;

    fn timeouts() -> DirectTimeouts {
        DirectTimeouts {
            connect: Duration::from_secs(1),
            upstream_io: Duration::from_secs(1),
            client_io: Duration::from_secs(1),
        }
    }

    /// Origin that reads a request head plus `body_len` bytes, answers with `response` and
    /// hands back what it read.
    async fn origin(
        body_len: usize,
        response: &'static [u8],
    ) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            let mut body = vec![0u8; body_len];
            stream.read_exact(&mut body).await.unwrap();
            request.extend_from_slice(&body);
            stream.write_all(response).await.ok();
            stream.shutdown().await.ok();
            request
        });
        (port, handle)
    }

    async fn relay(
        raw_request: &str,
        body_len: usize,
        response: &'static [u8],
    ) -> (Vec<u8>, Vec<u8>, RelayProgress) {
        let (port, origin) = origin(body_len, response).await;
        let raw_request = raw_request.replace("{authority}", &format!("127.0.0.1:{port}"));
        let (mut client, proxy_side) = tokio::io::duplex(8192);
        client.write_all(raw_request.as_bytes()).await.unwrap();

        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut reader = BufReader::new(proxy_side);
        let head = read_http1_request_head(
            &mut reader,
            peer,
            Duration::from_secs(1),
            Duration::from_secs(1),
            4096,
        )
        .await
        .unwrap()
        .unwrap();
        let parsed =
            parse_http1_request(head.method.clone(), &head.target, head.headers.host()).unwrap();
        let mut progress = RelayProgress::default();
        forward_direct(&mut reader, &head, &parsed, 4, 4096, timeouts(), &mut progress)
            .await
            .unwrap();
        drop(reader);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        (origin.await.unwrap(), received, progress)
    }

    #[tokio::test]
    async fn relays_post_body_and_response() {
        let response: &'static [u8] = b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
        let (upstream_request, received, progress) = relay(
            "POST http://{authority}/submit HTTP/1.1\r\nHost: {authority}\r\nContent-Length: 3\r\n\r\nabc",
            3,
            response,
        )
        .await;

        let upstream_request = String::from_utf8(upstream_request).unwrap();
        assert!(upstream_request.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(upstream_request.ends_with("Connection: close\r\n\r\nabc"));
        assert_eq!(received, response);
        assert_eq!(progress.status, Some(StatusCode::CREATED));
        assert_eq!(progress.request_body_bytes, 3);
        assert_eq!(progress.bytes_out, response.len() as u64);
    }

    #[tokio::test]
    async fn head_response_ends_after_headers() {
        let response: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let (_, received, progress) = relay(
            "HEAD / HTTP/1.1\r\nHost: {authority}\r\n\r\n",
            0,
            response,
        )
        .await;
        assert_eq!(received, response);
        assert_eq!(progress.status, Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn unreachable_origin_reports_no_progress() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let raw = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\n\r\n");
        let (mut client, proxy_side) = tokio::io::duplex(1024);
        client.write_all(raw.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(proxy_side);
        let head = read_http1_request_head(
            &mut reader,
            "127.0.0.1:40000".parse().unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            4096,
        )
        .await
        .unwrap()
        .unwrap();
        let parsed = parse_http1_request(head.method.clone(), &head.target, None).unwrap();
        let mut progress = RelayProgress::default();
        let err = forward_direct(&mut reader, &head, &parsed, 4096, 4096, timeouts(), &mut progress)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<crate::proxy::forward_error::OriginError>().is_some());
        assert_eq!(progress.bytes_out, 0);
        assert!(progress.upstream_addr.is_none());
    }
}
