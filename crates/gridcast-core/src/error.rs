//! Error types for gridcast-core.

use thiserror::Error;

/// Main error type for gridcast operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed frame.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Invalid node identity (wrong length or character set).
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    /// Interface discovery found no usable address.
    #[error("interface discovery failed")]
    DiscoveryFailed,

    /// Remote peer reported an error for a transfer command.
    #[error("transfer rejected by peer: {message}")]
    TransferRejected { message: String },

    /// File transfer failed locally.
    #[error("file transfer error: {message}")]
    Transfer { message: String },

    /// A relative path tried to escape the shared root.
    #[error("path escapes shared root: {path}")]
    PathEscape { path: String },

    /// The cached session to a peer is no longer usable.
    #[error("session expired")]
    SessionExpired,

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if this error is transient and the next sync cycle may
    /// succeed without intervention.
    ///
    /// Transient errors cover network failures where the peer is likely
    /// still alive: the sync engine marks the peer not-converged and
    /// retries on its next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout
                | Error::ConnectionClosed
                | Error::SessionExpired
                | Error::Transfer { .. }
        )
    }

    /// Returns true if this error indicates a local, non-retryable problem.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidNodeId(_) | Error::Protocol { .. } | Error::PathEscape { .. }
        )
    }
}

/// Convenience result type for gridcast operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::Protocol {
            message: "bad magic".into(),
        };
        assert_eq!(err.to_string(), "protocol error: bad magic");
    }

    #[test]
    fn error_display_path_escape() {
        let err = Error::PathEscape {
            path: "../etc/passwd".into(),
        };
        assert_eq!(err.to_string(), "path escapes shared root: ../etc/passwd");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn transient_errors() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::ConnectionClosed.is_transient());
        assert!(Error::SessionExpired.is_transient());
        assert!(Error::Transfer {
            message: "short read".into()
        }
        .is_transient());

        assert!(!Error::PathEscape {
            path: "../x".into()
        }
        .is_transient());
        assert!(!Error::InvalidNodeId("short".into()).is_transient());
    }

    #[test]
    fn fatal_errors() {
        assert!(Error::InvalidNodeId("bad".into()).is_fatal());
        assert!(Error::Protocol {
            message: "bad".into()
        }
        .is_fatal());

        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::ConnectionClosed.is_fatal());
    }
}
