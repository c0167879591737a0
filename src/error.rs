//! Error types for the forensics engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the forensics engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Caller errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    // Normalization errors (absorbed by the normalizer, never fatal to a batch)
    #[error("Partial data: {0}")]
    PartialData(String),

    // Ledger / indexer errors
    #[error("Upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("Upstream timeout after {0}ms")]
    UpstreamTimeout(u64),

    #[error("Upstream rejected request ({status}): {body}")]
    UpstreamRejected { status: u16, body: String },

    // Analysis lifecycle
    #[error("Analysis for {address} superseded by a newer request")]
    Superseded { address: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable (transient)
    ///
    /// Only the ledger collaborator retries; the analytical core never does.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UpstreamFetch(_) | Error::UpstreamTimeout(_) => true,
            Error::UpstreamRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Check if this error means the result should be silently discarded
    pub fn is_superseded(&self) -> bool {
        matches!(self, Error::Superseded { .. })
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::UpstreamFetch("reset".to_string()).is_retryable());
        assert!(Error::UpstreamTimeout(5000).is_retryable());
        assert!(Error::UpstreamRejected {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::UpstreamRejected {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::InvalidInput("depth".to_string()).is_retryable());
    }

    #[test]
    fn test_superseded_errors() {
        assert!(Error::Superseded {
            address: "A".to_string()
        }
        .is_superseded());
        assert!(!Error::UpstreamTimeout(10).is_superseded());
        assert!(!Error::InvalidAddress(String::new()).is_superseded());
    }
}
