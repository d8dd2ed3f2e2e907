use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Uri};

use crate::logging::AccessLogBuilder;
use crate::proxy::cache::key::origin_path;

pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Origin target of a proxied request, resolved from the request line and `Host` header.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub host: String,
    pub port: u16,
    /// Origin-form path and query, byte-for-byte as the client sent it.
    pub path: String,
}

/// Resolves an absolute-form (`http://host[:port]/path`) or origin-form request target.
/// Only plain `http` is proxied.
pub fn parse_http1_request(
    method: Method,
    target: &str,
    host_header: Option<&str>,
) -> Result<ParsedRequest> {
    if target.starts_with('/') {
        let host_header = host_header.ok_or_else(|| {
            anyhow!("request missing Host header required for origin-form request")
        })?;
        let (host, port) = parse_host_header(host_header)?;
        return Ok(ParsedRequest {
            method,
            host,
            port: port.unwrap_or(DEFAULT_HTTP_PORT),
            path: target.to_string(),
        });
    }

    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        Some(other) => bail!("unsupported scheme '{other}'"),
        None => bail!("request target must be absolute-form or origin-form"),
    }
    let authority = uri
        .authority()
        .map(|auth| auth.as_str())
        .ok_or_else(|| anyhow!("request missing authority"))?;
    let (host, port) = parse_host_header(authority)?;

    Ok(ParsedRequest {
        method,
        host,
        port: port.unwrap_or(DEFAULT_HTTP_PORT),
        path: origin_path(target).to_string(),
    })
}

/// Splits a Host / authority value into host and optional port. The host keeps its case.
pub fn parse_host_header(value: &str) -> Result<(String, Option<u16>)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty Host header");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("authority must not contain whitespace");
    }
    if trimmed.contains('@') {
        bail!("authority must not contain userinfo");
    }
    if trimmed.contains(['/', '?', '#', '\\']) {
        bail!("authority must not contain path or query");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid Host header '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("Host header missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        bail!("Host header missing hostname");
    }
    Ok((host, uri.port_u16()))
}

impl ParsedRequest {
    pub fn access_log_builder(&self, peer: SocketAddr) -> AccessLogBuilder {
        AccessLogBuilder::new(peer)
            .method(self.method.as_str())
            .host(self.host.clone())
            .path(self.path.clone())
    }

    /// Value for a synthesized `Host` header.
    pub fn authority(&self) -> String {
        let mut authority = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port != DEFAULT_HTTP_PORT {
            authority.push(':');
            authority.push_str(&self.port.to_string());
        }
        authority
    }

    /// `host:port` as used in log fields and error messages.
    pub fn origin_label(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_fills_default_port() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "/resource", Some("example.com"))?;
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/resource");
        Ok(())
    }

    #[test]
    fn absolute_form_keeps_host_case_and_port() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "http://Example.COM:8080/a?b", None)?;
        assert_eq!(parsed.host, "Example.COM");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.path, "/a?b");
        assert_eq!(parsed.authority(), "Example.COM:8080");
        Ok(())
    }

    #[test]
    fn absolute_form_without_path_maps_to_root() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "http://example.com", None)?;
        assert_eq!(parsed.path, "/");
        Ok(())
    }

    #[test]
    fn ipv6_literal_is_unbracketed() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "http://[2001:db8::10]/resource", None)?;
        assert_eq!(parsed.host, "2001:db8::10");
        assert_eq!(parsed.authority(), "[2001:db8::10]");
        assert_eq!(parsed.origin_label(), "[2001:db8::10]:80");
        Ok(())
    }

    #[test]
    fn rejects_https_scheme() {
        let err = parse_http1_request(Method::GET, "https://example.com/", None).unwrap_err();
        assert!(
            err.to_string().contains("unsupported scheme"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn origin_form_requires_host() {
        let err = parse_http1_request(Method::GET, "/", None).unwrap_err();
        assert!(
            err.to_string().contains("missing Host header"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn rejects_authority_form() {
        assert!(parse_http1_request(Method::GET, "example.com:80", Some("example.com")).is_err());
    }

    #[test]
    fn parse_host_header_rejects_userinfo() {
        let err = parse_host_header("user@example.com").unwrap_err();
        assert!(
            err.to_string().contains("userinfo"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn parse_host_header_rejects_path() {
        let err = parse_host_header("example.com/path").unwrap_err();
        assert!(
            err.to_string().contains("path or query"),
            "unexpected error: {err:?}"
        );
    }
}
