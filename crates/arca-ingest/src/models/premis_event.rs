//! PREMIS audit events
//!
//! Events are immutable once created. Every constructor assigns the event's
//! UUID identifier at construction time, not at persistence time, so that a
//! retry after a partially-failed registry save can diff by identifier
//! instead of inserting duplicates.

use crate::constants::{event, ID_TYPE_STORAGE_URL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const AGENT_URL: &str = "https://github.com/arca-preservation/arca";

/// One immutable audit record in the PREMIS vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremisEvent {
    /// Registry id. Zero until recorded.
    #[serde(default)]
    pub id: i64,

    /// UUID string, assigned when the event is constructed.
    pub identifier: String,

    #[serde(rename = "type")]
    pub event_type: String,

    pub date_time: DateTime<Utc>,

    /// Brief description of the event.
    pub detail: String,

    /// "Success" or "Failed"
    pub outcome: String,

    /// The digest for fixity events, the identifier for assignment events.
    pub outcome_detail: String,

    /// What generated the outcome.
    pub object: String,

    /// Where to find more about `object`.
    pub agent: String,

    /// Error text when outcome is Failed.
    #[serde(default)]
    pub outcome_information: String,

    #[serde(default)]
    pub intellectual_object_id: i64,
    #[serde(default)]
    pub generic_file_id: i64,
}

impl PremisEvent {
    fn base(event_type: &str, date_time: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            identifier: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            date_time,
            detail: String::new(),
            outcome: "Success".to_string(),
            outcome_detail: String::new(),
            object: "arca ingest processor".to_string(),
            agent: AGENT_URL.to_string(),
            outcome_information: String::new(),
            intellectual_object_id: 0,
            generic_file_id: 0,
        }
    }

    /// Object-level ingest: all files copied to the preservation bucket.
    pub fn object_ingest(number_of_files: usize) -> Self {
        let mut event = Self::base(event::INGESTION, Utc::now());
        event.detail = "Copied all files to preservation bucket".to_string();
        event.outcome_detail = format!("{} files copied", number_of_files);
        event.object = "arca store worker + S3 client".to_string();
        event.outcome_information = "Multipart put using md5 checksum".to_string();
        event
    }

    /// Object-level identifier assignment: institution domain + bag name.
    pub fn object_identifier_assignment(object_identifier: &str) -> Self {
        let mut event = Self::base(event::IDENTIFIER_ASSIGNMENT, Utc::now());
        event.detail = "Assigned bag identifier".to_string();
        event.outcome_detail = object_identifier.to_string();
        event.outcome_information = "Institution domain + tar file name".to_string();
        event
    }

    /// Object-level access assignment.
    pub fn object_access_assignment(access: &str) -> Self {
        let mut event = Self::base(event::ACCESS_ASSIGNMENT, Utc::now());
        event.detail = "Assigned bag access rights".to_string();
        event.outcome_detail = access.to_string();
        event.outcome_information = format!("Set access to {}", access);
        event
    }

    /// File-level ingest into primary long-term storage.
    pub fn file_ingest(stored_at: DateTime<Utc>, md5_digest: &str) -> Self {
        let mut event = Self::base(event::INGESTION, stored_at);
        event.detail = "Completed copy to preservation storage".to_string();
        event.outcome_detail = format!("md5:{}", md5_digest);
        event.object = "arca store worker + S3 client".to_string();
        event.outcome_information = "Put using md5 checksum".to_string();
        event
    }

    /// File-level fixity check against the digest the bag's manifest
    /// declared. A failed check means the bag never gets this far, but the
    /// failed form exists for the audit trail.
    pub fn file_fixity_check(
        verified_at: DateTime<Utc>,
        algorithm: &str,
        digest: &str,
        fixity_matched: bool,
    ) -> Self {
        let mut event = Self::base(event::FIXITY_CHECK, verified_at);
        event.detail = "Fixity check against registered hash".to_string();
        event.outcome_detail = format!("{}:{}", algorithm, digest);
        event.object = digest_object(algorithm).to_string();
        event.agent = digest_agent(algorithm).to_string();
        if fixity_matched {
            event.outcome_information = "Fixity matches".to_string();
        } else {
            event.outcome = "Failed".to_string();
            event.outcome_information = "Fixity did not match".to_string();
        }
        event
    }

    /// File-level digest computation.
    pub fn file_fixity_generation(
        generated_at: DateTime<Utc>,
        algorithm: &str,
        digest: &str,
    ) -> Self {
        let mut event = Self::base(event::FIXITY_GENERATION, generated_at);
        event.detail = "Calculated new fixity value".to_string();
        event.outcome_detail = format!("{}:{}", algorithm, digest);
        event.object = digest_object(algorithm).to_string();
        event.agent = digest_agent(algorithm).to_string();
        event
    }

    /// File-level identifier assignment: either the bag-path identifier or
    /// the storage URL.
    pub fn file_identifier_assignment(
        assigned_at: DateTime<Utc>,
        identifier_type: &str,
        identifier: &str,
    ) -> Self {
        let mut event = Self::base(event::IDENTIFIER_ASSIGNMENT, assigned_at);
        if identifier_type == ID_TYPE_STORAGE_URL {
            event.detail = "Assigned new storage URL identifier".to_string();
            event.object = "uuid crate + S3 client".to_string();
        } else {
            event.detail = "Assigned new institution.bag/path identifier".to_string();
        }
        event.outcome_detail = identifier.to_string();
        event
    }

    /// File-level copy to the replication bucket.
    pub fn file_replication(replicated_at: DateTime<Utc>, replication_url: &str) -> Self {
        let mut event = Self::base(event::REPLICATION, replicated_at);
        event.detail =
            "Copied to replication storage and assigned replication URL identifier".to_string();
        event.outcome_detail = replication_url.to_string();
        event.object = "uuid crate + S3 client".to_string();
        event
    }

    pub fn event_type_valid(&self) -> bool {
        event::ALL.contains(&self.event_type.to_lowercase().as_str())
    }

    /// Absorb registry-assigned attributes after a save.
    pub fn merge_attributes(&mut self, saved: &PremisEvent) {
        self.id = saved.id;
    }
}

fn digest_object(algorithm: &str) -> &'static str {
    match algorithm {
        "sha256" => "Rust sha2 crate",
        _ => "Rust md5 crate",
    }
}

fn digest_agent(algorithm: &str) -> &'static str {
    match algorithm {
        "sha256" => "https://crates.io/crates/sha2",
        _ => "https://crates.io/crates/md5",
    }
}
