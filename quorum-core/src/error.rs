//! Core error types for quorum

use thiserror::Error;

/// Top-level error type for quorum operations
#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Consensus error: {source}")]
    Consensus {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Snapshot error: {source}")]
    Snapshot {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Restore error: {source}")]
    Restore {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QuorumError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn storage<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Storage { source: Box::new(error) }
    }

    pub fn consensus<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Consensus { source: Box::new(error) }
    }

    pub fn snapshot<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Snapshot { source: Box::new(error) }
    }

    pub fn restore<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Restore { source: Box::new(error) }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }
}

/// Result type alias for quorum operations
pub type Result<T> = std::result::Result<T, QuorumError>;

impl From<std::io::Error> for QuorumError {
    fn from(error: std::io::Error) -> Self {
        QuorumError::storage(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QuorumError::config("missing node id");
        assert_eq!(err.to_string(), "Configuration error: missing node id");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: QuorumError = io.into();
        assert!(err.to_string().starts_with("Storage error"));
    }
}
