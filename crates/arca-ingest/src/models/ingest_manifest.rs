//! In-memory per-item pipeline state

use crate::models::WorkSummary;
use serde::{Deserialize, Serialize};

/// Everything a worker needs to know about one in-flight ingest, with a
/// `WorkSummary` per stage. Serialized as JSON into the work item's state
/// field after every stage so the next worker (or the same worker after a
/// crash) can resume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestManifest {
    pub work_item_id: i64,

    /// Receiving bucket and key the bag came from.
    pub s3_bucket: String,
    pub s3_key: String,
    pub etag: String,

    /// `<institution>/<bag-name>`, known once the validator has run.
    #[serde(default)]
    pub object_identifier: String,

    /// Local path of the downloaded tar.
    #[serde(default)]
    pub bag_path: String,

    /// Local path of the extracted bag.
    #[serde(default)]
    pub untarred_path: String,

    /// Local path of the staging database.
    #[serde(default)]
    pub db_path: String,

    pub fetch_result: WorkSummary,
    pub untar_result: WorkSummary,
    pub validate_result: WorkSummary,
    pub store_result: WorkSummary,
    pub record_result: WorkSummary,
    pub cleanup_result: WorkSummary,
}

impl IngestManifest {
    pub fn new(work_item_id: i64, bucket: &str, key: &str, etag: &str) -> Self {
        Self {
            work_item_id,
            s3_bucket: bucket.to_string(),
            s3_key: key.to_string(),
            etag: etag.to_string(),
            fetch_result: WorkSummary::new(),
            untar_result: WorkSummary::new(),
            validate_result: WorkSummary::new(),
            store_result: WorkSummary::new(),
            record_result: WorkSummary::new(),
            cleanup_result: WorkSummary::new(),
            ..Self::default()
        }
    }

    pub fn all_summaries(&self) -> [&WorkSummary; 6] {
        [
            &self.fetch_result,
            &self.untar_result,
            &self.validate_result,
            &self.store_result,
            &self.record_result,
            &self.cleanup_result,
        ]
    }

    pub fn has_errors(&self) -> bool {
        self.all_summaries().iter().any(|s| s.has_errors())
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.all_summaries().iter().any(|s| s.error_is_fatal)
    }

    pub fn all_errors_as_string(&self) -> String {
        let errors: Vec<String> = self
            .all_summaries()
            .iter()
            .flat_map(|s| s.errors.iter().cloned())
            .collect();
        errors.join("\n")
    }

    /// Serialize for the work item's state field.
    pub fn to_state_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_state_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_aggregation() {
        let mut manifest = IngestManifest::new(1, "bucket", "key.tar", "etag");
        assert!(!manifest.has_errors());
        manifest.validate_result.add_error("bad digest");
        assert!(manifest.has_errors());
        assert!(!manifest.has_fatal_errors());
        manifest.store_result.add_fatal_error("no uuid");
        assert!(manifest.has_fatal_errors());
        assert_eq!(manifest.all_errors_as_string(), "bad digest\nno uuid");
    }

    #[test]
    fn test_state_round_trip() {
        let mut manifest = IngestManifest::new(9, "bucket", "inst.edu.bag.tar", "e1");
        manifest.fetch_result.start();
        manifest.fetch_result.finish();
        manifest.object_identifier = "inst.edu/bag".to_string();

        let json = manifest.to_state_json().unwrap();
        let back = IngestManifest::from_state_json(&json).unwrap();
        assert_eq!(back.work_item_id, 9);
        assert_eq!(back.object_identifier, "inst.edu/bag");
        assert!(back.fetch_result.succeeded());
        assert!(!back.store_result.attempted);
    }
}
