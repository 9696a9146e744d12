//! Error types for the adapter

use std::fmt;

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the adapter
#[derive(Debug)]
pub enum Error {
    /// HTTP transport errors talking to the store
    Http(reqwest::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// A store operation exceeded its deadline
    Timeout { operation: &'static str },
    /// Store temporarily unavailable (429, 5xx, connection refused)
    Unavailable(String),
    /// Store rejected the request outright
    Store { status: u16, reason: String },
    /// Sample failed validation
    InvalidSample(String),
    /// Series without a `__name__` label
    MissingMetricName,
    /// Read query could not be translated
    InvalidQuery(String),
    /// Remote read/write payload could not be decoded
    Decode(String),
    /// Alias does not resolve to any index
    AliasNotFound(String),
    /// Index exists with settings that differ from the requested ones
    IndexConflict(String),
    /// Startup provisioning failed
    Startup(String),
    /// A rollover step failed
    Lifecycle(String),
    /// Intake queue is full
    BufferFull,
    /// The write path no longer accepts samples
    ShuttingDown,
    /// Batches left undrained when the shutdown deadline expired
    ShutdownLoss { batches: u64, samples: u64 },
    /// Internal error
    Internal(String),
}

/// Error taxonomy used to pick a recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried locally with bounded backoff
    Transient,
    /// A single document was rejected for its content; counted, not retried
    PartialDocument,
    /// Provisioning failed at process start; the process must not serve writes
    FatalStartup,
    /// Rollover step failed; the old index stays active and the step is retried next tick
    LifecycleTransient,
    /// Data left undrained at shutdown
    ShutdownLoss,
    /// Caller supplied a bad request
    Request,
    /// Anything else
    Internal,
}

impl Error {
    /// Classify this error into the recovery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Internal
                }
            }
            Error::Io(_) | Error::Timeout { .. } | Error::Unavailable(_) | Error::BufferFull => {
                ErrorKind::Transient
            }
            Error::Store { status, .. } => {
                if is_retryable_status(*status) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Internal
                }
            }
            Error::InvalidSample(_)
            | Error::MissingMetricName
            | Error::InvalidQuery(_)
            | Error::Decode(_) => ErrorKind::Request,
            Error::Startup(_) | Error::Config(_) => ErrorKind::FatalStartup,
            Error::Lifecycle(_) | Error::AliasNotFound(_) | Error::IndexConflict(_) => {
                ErrorKind::LifecycleTransient
            }
            Error::ShutdownLoss { .. } => ErrorKind::ShutdownLoss,
            Error::ShuttingDown | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// HTTP statuses the store uses for back-off-and-retry conditions.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 502 | 503 | 504)
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Timeout { operation } => write!(f, "Store operation '{}' timed out", operation),
            Error::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            Error::Store { status, reason } => {
                write!(f, "Store rejected request ({}): {}", status, reason)
            }
            Error::InvalidSample(msg) => write!(f, "Invalid sample: {}", msg),
            Error::MissingMetricName => write!(f, "Missing metric name"),
            Error::InvalidQuery(msg) => write!(f, "Invalid query: {}", msg),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::AliasNotFound(alias) => write!(f, "Alias not found: {}", alias),
            Error::IndexConflict(index) => {
                write!(f, "Index {} exists with different settings", index)
            }
            Error::Startup(msg) => write!(f, "Startup failed: {}", msg),
            Error::Lifecycle(msg) => write!(f, "Index lifecycle error: {}", msg),
            Error::BufferFull => write!(f, "Write intake queue is full"),
            Error::ShuttingDown => write!(f, "Write service is shutting down"),
            Error::ShutdownLoss { batches, samples } => write!(
                f,
                "Shutdown deadline expired with {} batches ({} samples) undrained",
                batches, samples
            ),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<snap::Error> for Error {
    fn from(e: snap::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_status_classification() {
        let throttled = Error::Store {
            status: 429,
            reason: "es_rejected_execution_exception".to_string(),
        };
        assert!(throttled.is_transient());

        let bad_request = Error::Store {
            status: 400,
            reason: "illegal_argument_exception".to_string(),
        };
        assert!(!bad_request.is_transient());
        assert_eq!(bad_request.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_taxonomy() {
        assert_eq!(Error::Timeout { operation: "bulk" }.kind(), ErrorKind::Transient);
        assert_eq!(Error::Startup("x".into()).kind(), ErrorKind::FatalStartup);
        assert_eq!(Error::Lifecycle("x".into()).kind(), ErrorKind::LifecycleTransient);
        assert_eq!(
            Error::ShutdownLoss { batches: 1, samples: 3 }.kind(),
            ErrorKind::ShutdownLoss
        );
        assert_eq!(Error::MissingMetricName.kind(), ErrorKind::Request);
    }
}
