//! Error types for arca
//!
//! Errors carry enough context for an operator to tell a broken bag from a
//! broken network from a broken deployment.

use thiserror::Error;

/// Result type alias for arca operations
pub type Result<T> = std::result::Result<T, ArcaError>;

/// Main error type for arca
#[derive(Error, Debug)]
pub enum ArcaError {
    /// File system operations failed (read, write, create directory, etc.)
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("Failed to process JSON data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A computed digest does not match the digest the bag's manifest declares
    #[error("{algorithm} digest for '{file}': manifest says '{expected}', file digest is '{actual}'")]
    ChecksumMismatch {
        file: String,
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// Configuration is missing or invalid
    #[error("Configuration error: {message}. {suggestion}")]
    Config { message: String, suggestion: String },

    /// Network request failed
    #[error("Network request to '{url}' failed: {reason}")]
    Network { url: String, reason: String },

    /// The registry rejected or failed a request
    #[error("Registry error during {operation}: {reason}")]
    Registry { operation: String, reason: String },

    /// The object store rejected or failed a request
    #[error("Storage error during {operation}: {reason}")]
    Storage { operation: String, reason: String },

    /// Failed to parse input data
    #[error("Failed to parse {data_type}: {reason}")]
    Parse { data_type: String, reason: String },
}

impl ArcaError {
    /// Create a checksum mismatch error
    pub fn checksum_mismatch(
        file: impl Into<String>,
        algorithm: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            file: file.into(),
            algorithm: algorithm.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a configuration error with suggestion
    pub fn config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a registry error
    pub fn registry(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Registry {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(data_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            data_type: data_type.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry has any chance of succeeding. Network and storage
    /// failures are transient; everything else requires a changed input or
    /// a changed deployment.
    pub fn is_transient(&self) -> bool {
        matches!(self, ArcaError::Network { .. } | ArcaError::Storage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_message() {
        let err = ArcaError::checksum_mismatch("data/hello.txt", "Sha256", "aaa", "bbb");
        assert_eq!(
            err.to_string(),
            "Sha256 digest for 'data/hello.txt': manifest says 'aaa', file digest is 'bbb'"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ArcaError::network("https://x", "timeout").is_transient());
        assert!(ArcaError::storage("upload", "503").is_transient());
        assert!(!ArcaError::config("missing TarDirectory", "set it").is_transient());
        assert!(!ArcaError::checksum_mismatch("f", "Md5", "a", "b").is_transient());
    }
}
