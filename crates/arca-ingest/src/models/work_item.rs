//! The registry's durable record of one unit of pipeline work

use crate::constants::{Action, Stage, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of pipeline work on one object, as stored in the registry.
///
/// Depositors watch these records to see which of their bags processed
/// successfully and why failed bags failed. Workers claim an item by
/// writing their node + pid with status Started; any item whose node/pid
/// belongs to another process is off limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Registry id. Zero until the registry has assigned one.
    #[serde(default)]
    pub id: i64,

    /// Tar file name in the receiving bucket, e.g. "inst.edu.photos.tar"
    pub name: String,

    pub bucket: String,
    pub etag: String,
    pub size: i64,

    /// Last-modified time of the upload in the receiving bucket.
    #[serde(default)]
    pub bag_date: Option<DateTime<Utc>>,

    /// Domain of the owning institution, e.g. "inst.edu"
    pub institution: String,

    /// Set once the validator has derived it from the bag.
    #[serde(default)]
    pub object_identifier: String,

    #[serde(default)]
    pub generic_file_identifier: String,

    pub action: Action,
    pub stage: Stage,
    pub status: Status,

    /// Free text describing the latest state change or failure.
    #[serde(default)]
    pub note: String,

    #[serde(default)]
    pub outcome: String,

    pub retry: bool,

    /// Hostname of the worker currently processing this item, if any.
    #[serde(default)]
    pub node: String,

    /// Pid of the worker currently processing this item, if any.
    #[serde(default)]
    pub pid: u32,

    /// Set when the item has exceeded its retry budget without success and
    /// someone needs to look at it.
    #[serde(default)]
    pub needs_admin_review: bool,

    /// Serialized IngestManifest, written back after every stage so any
    /// worker can resume this item after a crash.
    #[serde(default)]
    pub state: Option<String>,

    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stage_started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// A new ingest work item for a tar file discovered in a receiving
    /// bucket.
    pub fn new_ingest(
        name: impl Into<String>,
        bucket: impl Into<String>,
        etag: impl Into<String>,
        size: i64,
        institution: impl Into<String>,
        bag_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            bucket: bucket.into(),
            etag: etag.into(),
            size,
            bag_date,
            institution: institution.into(),
            object_identifier: String::new(),
            generic_file_identifier: String::new(),
            action: Action::Ingest,
            stage: Stage::Receive,
            status: Status::Pending,
            note: "Bag is in receiving bucket".to_string(),
            outcome: String::new(),
            retry: true,
            node: String::new(),
            pid: 0,
            needs_admin_review: false,
            state: None,
            queued_at: None,
            stage_started_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Record this process as the item's owner.
    pub fn set_node_and_pid(&mut self) {
        self.node = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        self.pid = std::process::id();
    }

    /// Release the claim after terminal processing.
    pub fn clear_node_and_pid(&mut self) {
        self.node = String::new();
        self.pid = 0;
    }

    /// True when another live process has claimed this item. An empty node
    /// means nobody owns it.
    pub fn belongs_to_another_worker(&self) -> bool {
        if self.node.is_empty() {
            return false;
        }
        let this_host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        self.node != this_host || self.pid != std::process::id()
    }

    /// True when a worker somewhere has started this item and not yet
    /// released it.
    pub fn is_in_progress(&self) -> bool {
        !self.node.is_empty() && self.status == Status::Started
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == Status::Cancelled
    }

    /// True when the object's files made it to preservation storage.
    pub fn has_been_stored(&self) -> bool {
        if self.action != Action::Ingest {
            return true;
        }
        matches!(self.stage, Stage::Record | Stage::Cleanup | Stage::Resolve)
            || (self.stage == Stage::Store && self.status == Status::Pending)
    }

    /// The body a registry create/update call wants: everything except the
    /// server-managed fields.
    pub fn for_registry(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "bucket": self.bucket,
            "etag": self.etag,
            "size": self.size,
            "bag_date": self.bag_date,
            "institution": self.institution,
            "object_identifier": self.object_identifier,
            "generic_file_identifier": self.generic_file_identifier,
            "action": self.action,
            "stage": self.stage,
            "status": self.status,
            "note": self.note,
            "outcome": self.outcome,
            "retry": self.retry,
            "node": self.node,
            "pid": self.pid,
            "needs_admin_review": self.needs_admin_review,
            "state": self.state,
            "queued_at": self.queued_at,
            "stage_started_at": self.stage_started_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new_ingest(
            "inst.edu.photos.tar",
            "arca.receiving.inst.edu",
            "abc123",
            1024,
            "inst.edu",
            None,
        )
    }

    #[test]
    fn test_new_ingest_defaults() {
        let item = item();
        assert_eq!(item.id, 0);
        assert_eq!(item.action, Action::Ingest);
        assert_eq!(item.stage, Stage::Receive);
        assert_eq!(item.status, Status::Pending);
        assert!(item.retry);
        assert!(!item.needs_admin_review);
    }

    #[test]
    fn test_claim_and_release() {
        let mut item = item();
        assert!(!item.belongs_to_another_worker());
        assert!(!item.is_in_progress());

        item.set_node_and_pid();
        item.status = Status::Started;
        assert!(!item.belongs_to_another_worker());
        assert!(item.is_in_progress());

        item.pid = item.pid.wrapping_add(1);
        assert!(item.belongs_to_another_worker());

        item.clear_node_and_pid();
        assert!(!item.belongs_to_another_worker());
        assert!(!item.is_in_progress());
    }

    #[test]
    fn test_has_been_stored() {
        let mut item = item();
        assert!(!item.has_been_stored());
        item.stage = Stage::Store;
        item.status = Status::Started;
        assert!(!item.has_been_stored());
        item.status = Status::Pending;
        assert!(item.has_been_stored());
        item.stage = Stage::Record;
        assert!(item.has_been_stored());
    }

    #[test]
    fn test_registry_body_excludes_id() {
        let item = item();
        let body = item.for_registry();
        assert!(body.get("id").is_none());
        assert_eq!(body["action"], "Ingest");
        assert_eq!(body["stage"], "Receive");
    }
}
