use std::fmt::Write as _;

use crate::proxy::request::ParsedRequest;

use super::request::{Http1RequestHead, version_str};

/// Builds the origin-form request sent upstream. Hop-by-hop headers were already dropped while
/// the head was parsed; the connection is always closed after one exchange.
pub(crate) fn serialize_request(head: &Http1RequestHead, request: &ParsedRequest) -> Vec<u8> {
    let mut out = String::with_capacity(head.headers.total_bytes() + request.path.len() + 64);
    let _ = write!(
        out,
        "{} {} {}\r\n",
        head.method,
        request.path,
        version_str(head.version)
    );
    if head.headers.host().is_none() {
        let _ = write!(out, "Host: {}\r\n", request.authority());
    }
    for header in head.headers.forward_headers() {
        let _ = write!(out, "{}: {}\r\n", header.name, header.value);
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}
