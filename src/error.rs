//! Error types for the phantom protocol.

use thiserror::Error;

/// Result type alias for phantom operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during phantom operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire layout violated: short buffer, length mismatch, unknown tag
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Envelope open failed: wrong identity, stale timestamp, replay, or tag mismatch
    #[error("authentication failed")]
    AuthFail,

    /// Operation against a terminated connection or session
    #[error("connection closed")]
    Closed,

    /// Retransmit cap reached, liveness idle exceeded, or deadline expiry
    #[error("connection timeout")]
    Timeout,

    /// Outbound send window saturated
    #[error("send buffer full")]
    BufferFull,

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new malformed-data error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Create a new cryptographic error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error indicates authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::AuthFail)
    }

    /// Check if this error is a terminal connection state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Closed | Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::AuthFail;
        assert_eq!(err.to_string(), "authentication failed");

        let err = Error::malformed("frame too short");
        assert_eq!(err.to_string(), "malformed data: frame too short");
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::AuthFail.is_auth_failure());
        assert!(!Error::Closed.is_auth_failure());

        assert!(Error::Closed.is_terminal());
        assert!(Error::Timeout.is_terminal());
        assert!(!Error::BufferFull.is_terminal());
    }
}
