mod codec;
mod forward;
mod pipeline;
mod respond;

pub use codec::{
    Chunk, ChunkKind, ChunkReader, parse_content_length, parse_status_code, response_body_length,
};
pub use pipeline::{CacheOutcome, handle_http};
pub use respond::{respond_with_access_log, send_response, shutdown_stream};

#[cfg(feature = "fuzzing")]
pub mod fuzzing {
    use std::net::SocketAddr;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::io::{AsyncRead, BufReader};

    /// Parses a request head and resolves its target the way the connection pipeline does.
    pub async fn parse_http1_request_head<S>(
        reader: &mut BufReader<S>,
        peer: SocketAddr,
        timeout: Duration,
        max_header_bytes: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        if let Some(head) =
            super::codec::read_http1_request_head(reader, peer, timeout, timeout, max_header_bytes)
                .await?
        {
            let request = crate::proxy::request::parse_http1_request(
                head.method.clone(),
                &head.target,
                head.headers.host(),
            );
            if let Ok(request) = request {
                let _ = super::codec::serialize_request(&head, &request);
            }
            let _ = head.headers.content_length();
        }
        Ok(())
    }

    /// Drains a response through the chunk reader, honouring any `Content-Length` it sees.
    pub async fn read_response_chunks<S>(
        stream: S,
        chunk_size: usize,
        max_line: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let mut reader = super::ChunkReader::new(
            stream,
            chunk_size,
            max_line,
            Duration::from_millis(100),
            "fuzz",
        );
        let mut content_length = None;
        while let Some(chunk) = reader.next(content_length).await? {
            if chunk.kind == super::ChunkKind::Header
                && let Some(length) = super::parse_content_length(&chunk.data)?
            {
                content_length = Some(length);
            }
        }
        Ok(())
    }
}
