//! Error taxonomy for the relay protocol layers.
//!
//! The signing, bus, negotiation and tunnel layers all return
//! [`RelayError`]. Application-level code (config, cloud HTTP calls, CLI)
//! uses `anyhow` and converts at the boundary.
//!
//! # Propagation
//!
//! - [`RelayError::Protocol`] / [`RelayError::Transport`]: fatal for the bus
//!   session. Every pending waiter sees the error itself; later calls see
//!   [`RelayError::ConnectionClosed`].
//! - [`RelayError::Correlation`]: surfaced to the single caller waiting for
//!   that response; only the affected API channel is closed.
//! - [`RelayError::InvalidInput`]: raised before any network I/O.
//! - [`RelayError::Negotiation`]: surfaced once to the in-flight negotiation.

/// Errors produced by the relay protocol stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed or out-of-spec bus or tunnel frame.
    Protocol(String),
    /// Response id or status did not match the request.
    Correlation(String),
    /// Invalid caller input (bad path, missing credential field).
    InvalidInput(String),
    /// The peer connection could not be established.
    Negotiation(String),
    /// The underlying byte transport failed.
    Transport(String),
    /// Deflate encode/decode failure.
    Compression(String),
    /// JSON encode/decode failure.
    Json(String),
    /// The connection was torn down while the operation was pending.
    ConnectionClosed,
    /// The operation did not complete within its deadline.
    Timeout(String),
}

impl RelayError {
    /// Whether this error tears down the bus session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Transport(_) | Self::ConnectionClosed)
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Correlation(msg) => write!(f, "Correlation error: {msg}"),
            Self::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            Self::Negotiation(msg) => write!(f, "Negotiation failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Compression(msg) => write!(f, "Compression error: {msg}"),
            Self::Json(msg) => write!(f, "JSON error: {msg}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout(what) => write!(f, "Timed out waiting for {what}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Result alias for the protocol layers.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Await `fut` for at most `deadline`, mapping expiry to [`RelayError::Timeout`].
pub(crate) async fn with_deadline<T, F>(
    deadline: std::time::Duration,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(what.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fatal_classification() {
        assert!(RelayError::Protocol("bad".into()).is_fatal());
        assert!(RelayError::ConnectionClosed.is_fatal());
        assert!(!RelayError::Correlation("id".into()).is_fatal());
        assert!(!RelayError::Timeout("ack".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RelayError::Timeout("SUBACK #7".into());
        assert_eq!(err.to_string(), "Timed out waiting for SUBACK #7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline(Duration::from_millis(50), "nothing", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(RelayError::Timeout("nothing".into())));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let result = with_deadline(Duration::from_secs(1), "value", async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }
}
