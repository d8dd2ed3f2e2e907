use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use super::forward_error::OriginError;

/// Resolves `host` and connects to the first address that answers within `connect_timeout`.
/// Failures carry an [`OriginError`] so callers can tell them apart from later I/O errors.
pub async fn connect_origin(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let origin = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = match timeout(connect_timeout, lookup_host((host, port))).await
    {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(source)) => return Err(OriginError::Resolve { origin, source }.into()),
        Err(_) => {
            return Err(OriginError::Connect {
                origin,
                reason: "name resolution timed out".to_string(),
            }
            .into());
        }
    };
    if addrs.is_empty() {
        return Err(OriginError::NoAddresses { origin }.into());
    }
    connect_to_addrs(&addrs, connect_timeout)
        .await
        .map_err(|err| {
            OriginError::Connect {
                origin,
                reason: format!("{err:#}"),
            }
            .into()
        })
}

/// Attempt to connect to the supplied socket addresses without performing name resolution.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow::Error::new(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listening_origin() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (stream, connected) = connect_origin("127.0.0.1", addr.port(), Duration::from_secs(1)).await?;
        assert_eq!(connected, addr);
        drop(stream);
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_an_origin_error() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let err = connect_origin("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OriginError>(),
            Some(OriginError::Connect { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn empty_address_list_is_rejected() {
        let err = connect_to_addrs(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(
            err.to_string().contains("no addresses"),
            "unexpected error: {err}"
        );
    }
}
