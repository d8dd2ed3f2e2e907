mod chunk;
mod headers;
mod line;
mod request;
mod serialize;

pub use chunk::{
    Chunk, ChunkKind, ChunkReader, parse_content_length, parse_status_code, response_body_length,
};
pub(crate) use request::{Http1RequestHead, read_http1_request_head};
pub(crate) use serialize::serialize_request;
