use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_names_the_operation() {
        let err = timeout_with_context(
            Duration::from_millis(10),
            std::future::pending::<Result<(), std::io::Error>>(),
            "waiting for origin",
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "timed out waiting for origin");
    }

    #[tokio::test]
    async fn inner_error_keeps_context() {
        let err = timeout_with_context(
            Duration::from_secs(1),
            async { Err::<(), _>(std::io::Error::other("boom")) },
            "reading body",
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "failed while reading body");
        assert_eq!(err.root_cause().to_string(), "boom");
    }
}
