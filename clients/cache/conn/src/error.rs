//! Connection error types.

use thiserror::Error;

/// Errors surfaced by connection operations
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// An operation did not complete within its time budget
    #[error("timed out {0}")]
    Timeout(&'static str),

    /// Socket-level failure
    #[error("connection failure: {0}")]
    Io(String),

    /// Server refused the handshake or considered it invalid
    #[error("handshake rejected by server: {0}")]
    HandshakeRejected(String),

    /// Server rejected the supplied credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server requires authentication and none was supplied
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    /// A durable client with the same id is already connected
    #[error("duplicate durable client: {0}")]
    DuplicateDurableClient(String),

    /// Server answered with a code this client does not recognize
    #[error("unknown server response code {code}: {reason}")]
    UnknownServerError {
        /// Raw response byte
        code: u8,
        /// Reason text the server attached, if any
        reason: String,
    },
}

impl ConnectionError {
    /// Whether retrying the operation on another connection makes sense.
    ///
    /// Only timeouts are retryable; every other variant reflects a state
    /// that will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ConnectionError::Timeout("in reply wait").is_retryable());
        assert!(!ConnectionError::Io("reset".into()).is_retryable());
        assert!(!ConnectionError::HandshakeRejected("bad version".into()).is_retryable());
        assert!(!ConnectionError::UnknownServerError {
            code: 99,
            reason: String::new()
        }
        .is_retryable());
    }
}
