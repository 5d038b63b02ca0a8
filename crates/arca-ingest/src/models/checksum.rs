//! Checksum records, one per (file, algorithm)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A digest recorded for a generic file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checksum {
    /// Registry id. Zero until recorded.
    #[serde(default)]
    pub id: i64,

    #[serde(default)]
    pub generic_file_id: i64,

    /// "md5" or "sha256"
    pub algorithm: String,

    /// Hex digest.
    pub digest: String,

    /// When the pipeline computed this digest.
    pub datetime: DateTime<Utc>,

    /// When the digest was last verified against the manifest, if ever.
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

impl Checksum {
    pub fn new(algorithm: impl Into<String>, digest: impl Into<String>, datetime: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            generic_file_id: 0,
            algorithm: algorithm.into(),
            digest: digest.into(),
            datetime,
            verified_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checksum() {
        let checksum = Checksum::new("sha256", "abc123", Utc::now());
        assert_eq!(checksum.id, 0);
        assert_eq!(checksum.algorithm, "sha256");
        assert_eq!(checksum.digest, "abc123");
        assert!(checksum.verified_at.is_none());
    }
}
