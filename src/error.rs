//! Error types for rangecache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading byte ranges
///
/// The enum is `Clone` so that a single in-flight block fetch can hand the
/// same outcome to every caller that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Bad offset or size
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested range lies past the end of the source
    #[error("Requested range ({offset}:{end}) exceeds source size ({len})", end = .offset + .size)]
    OutOfRange { offset: u64, size: u64, len: u64 },

    /// Operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Origin Errors (never retried)
    // =========================================================================
    /// Origin answered 404
    #[error("Not found: {url}")]
    NotFound { url: String },

    /// Origin answered 412/416 - the object changed under a validated read
    #[error("Precondition failed ({status}) for {url} - origin may have been modified")]
    PreconditionFailed { status: u16, url: String },

    /// Any other client error status
    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    /// Payload length differs from what was requested
    #[error("Integrity check failed: received {actual} bytes, expected {expected}")]
    Integrity { expected: u64, actual: u64 },

    /// Missing or malformed protocol headers
    #[error("Protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Retryable Errors
    // =========================================================================
    /// Origin answered 5xx
    #[error("Server error {status} for URL: {url}")]
    ServerError { status: u16, url: String },

    /// A single attempt ran past its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Network failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Retries used up; wraps the last retryable failure
    #[error("Request failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: Box<Error> },

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Persistent store holds an unreadable record
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Creates an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Maps a non-success HTTP status onto the error taxonomy
    pub fn from_status(status: u16, url: impl Into<String>) -> Self {
        let url = url.into();
        match status {
            404 => Self::NotFound { url },
            412 | 416 => Self::PreconditionFailed { status, url },
            500..=599 => Self::ServerError { status, url },
            _ => Self::HttpStatus { status, url },
        }
    }

    /// Whether the retry policy may try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Transport(_) | Error::ServerError { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(format!("invalid record metadata: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not report the configured deadline
            Error::Timeout(Duration::ZERO)
        } else if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            Error::from_status(status.as_u16(), url)
        } else {
            Error::Transport(err.to_string())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::from_status(404, "u"),
            Error::NotFound { url: "u".into() }
        );
        assert!(matches!(
            Error::from_status(412, "u"),
            Error::PreconditionFailed { status: 412, .. }
        ));
        assert!(matches!(
            Error::from_status(416, "u"),
            Error::PreconditionFailed { status: 416, .. }
        ));
        assert!(matches!(
            Error::from_status(503, "u"),
            Error::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            Error::from_status(403, "u"),
            Error::HttpStatus { status: 403, .. }
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(Error::from_status(500, "u").is_retryable());

        assert!(!Error::from_status(404, "u").is_retryable());
        assert!(!Error::from_status(412, "u").is_retryable());
        assert!(!Error::Integrity { expected: 4, actual: 3 }.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Exhausted {
            attempts: 3,
            source: Box::new(Error::Transport("x".into())),
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::OutOfRange {
            offset: 10,
            size: 5,
            len: 12,
        };
        assert_eq!(
            err.to_string(),
            "Requested range (10:15) exceeds source size (12)"
        );

        let err = Error::Integrity {
            expected: 8,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Integrity check failed: received 3 bytes, expected 8"
        );
    }
}
