//! Error Handling Module
//!
//! Defines the error type shared by the trainers, loss terms and data sources.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for domain adaptation training
#[derive(Error, Debug)]
pub enum UdaError {
    /// Invalid configuration: granularity mismatch, out-of-range choice,
    /// incompatible student/teacher structure
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor shapes inconsistent with what the model or a loss expects
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Batch tensors not co-located with the model
    #[error("Device error: {0}")]
    Device(String),

    /// Error with dataset or batch source operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Failed to save or restore model weights
    #[error("Checkpoint error at '{0}': {1}")]
    Checkpoint(PathBuf, String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for UdaError {
    fn from(err: serde_json::Error) -> Self {
        UdaError::Serialization(err.to_string())
    }
}

/// Convenience Result type for training operations
pub type Result<T> = std::result::Result<T, UdaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UdaError::Config("chosen granularity 3 out of range".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: chosen granularity 3 out of range"
        );
    }

    #[test]
    fn test_checkpoint_error_mentions_path() {
        let err = UdaError::Checkpoint(PathBuf::from("/tmp/student.mpk"), "missing".to_string());
        assert!(format!("{}", err).contains("student.mpk"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: UdaError = io_err.into();
        assert!(matches!(err, UdaError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<u32, _> = serde_json::from_str::<u32>("not json");
        let err: UdaError = parse.unwrap_err().into();
        assert!(matches!(err, UdaError::Serialization(_)));
    }
}
