use std::net::SocketAddr;

use anyhow::Error;
use thiserror::Error;
use tracing::{debug, warn};

use crate::proxy::cache::StreamError;

/// Failure to reach the origin at all, before any request byte was sent.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("failed to resolve origin {origin}")]
    Resolve {
        origin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("origin {origin} resolved to no addresses")]
    NoAddresses { origin: String },
    #[error("failed to connect to origin {origin}: {reason}")]
    Connect { origin: String, reason: String },
}

/// Normalized classification of forwarding failures.
pub enum ForwardErrorKind<'a> {
    Origin(&'a OriginError),
    Stream(&'a StreamError),
    Other,
}

impl ForwardErrorKind<'_> {
    /// Label used for the upstream error metric and the access log reason.
    pub fn label(&self) -> &'static str {
        match self {
            ForwardErrorKind::Origin(OriginError::Resolve { .. } | OriginError::NoAddresses { .. }) => {
                "resolve"
            }
            ForwardErrorKind::Origin(OriginError::Connect { .. }) => "connect",
            ForwardErrorKind::Stream(stream) => stream.reason(),
            ForwardErrorKind::Other => "io",
        }
    }

    /// The client stopped accepting bytes; nothing went wrong on the origin side.
    pub fn is_client_side(&self) -> bool {
        matches!(
            self,
            ForwardErrorKind::Stream(StreamError::ClientWrite { .. } | StreamError::ClientTimeout { .. })
        )
    }

    /// Whether the client may still receive a `502 Bad Gateway`. Once response bytes went out
    /// the connection can only be dropped; a client that stopped reading gets nothing.
    pub fn wants_gateway_response(&self, bytes_sent: u64) -> bool {
        bytes_sent == 0 && !self.is_client_side()
    }
}

pub fn classify_forward_error(err: &Error) -> ForwardErrorKind<'_> {
    if let Some(origin) = err.downcast_ref::<OriginError>() {
        ForwardErrorKind::Origin(origin)
    } else if let Some(stream) = err.downcast_ref::<StreamError>() {
        ForwardErrorKind::Stream(stream)
    } else {
        ForwardErrorKind::Other
    }
}

pub fn log_forward_error(kind: &ForwardErrorKind<'_>, peer: SocketAddr, host: &str, err: &Error) {
    match kind {
        ForwardErrorKind::Origin(origin) => warn!(
            peer = %peer,
            host,
            error = %origin,
            "origin unreachable"
        ),
        ForwardErrorKind::Stream(
            stream @ (StreamError::ClientWrite { .. } | StreamError::ClientTimeout { .. }),
        ) => debug!(
            peer = %peer,
            host,
            error = %stream,
            "client stopped receiving response"
        ),
        ForwardErrorKind::Stream(stream) => warn!(
            peer = %peer,
            host,
            error = %stream,
            "cached stream failed"
        ),
        ForwardErrorKind::Other => warn!(
            peer = %peer,
            host,
            error = format!("{err:#}"),
            "upstream request failed"
        ),
    }
}
