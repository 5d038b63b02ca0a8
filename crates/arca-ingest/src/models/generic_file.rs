//! One member file of an intellectual object

use crate::constants::{
    event, ALG_MD5, ALG_SHA256, ID_TYPE_BAG_AND_PATH, ID_TYPE_STORAGE_URL, UUID_PATTERN,
};
use crate::models::{Checksum, PremisEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single file inside a bag, tracked from tar entry to preservation
/// storage to registry row.
///
/// The identifier is `<institution>/<bag>/<path-within-bag>`. The storage
/// UUID is the object-store key; it stays stable across re-ingests so that a
/// changed file overwrites its prior version instead of orphaning it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericFile {
    /// Registry id. Zero until recorded.
    #[serde(default)]
    pub id: i64,

    pub identifier: String,

    pub intellectual_object_identifier: String,

    #[serde(default)]
    pub intellectual_object_id: i64,

    pub size: i64,

    /// MIME type guessed from the file name.
    pub file_format: String,

    /// Modification time from the tar header.
    #[serde(default)]
    pub file_modified: Option<DateTime<Utc>>,

    /// Primary storage URL as recorded in the registry.
    #[serde(default)]
    pub uri: String,

    // ---- ingest-only attributes, persisted in the staging DB ----
    /// Absolute path of the extracted copy under the staging directory.
    #[serde(default)]
    pub ingest_local_path: String,

    /// The object-store key for both the primary and replica copies.
    #[serde(default)]
    pub ingest_uuid: String,

    #[serde(default)]
    pub ingest_uuid_generated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ingest_storage_url: String,
    #[serde(default)]
    pub ingest_stored_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ingest_replication_url: String,
    #[serde(default)]
    pub ingest_replicated_at: Option<DateTime<Utc>>,

    /// Digests computed by the validator while streaming the tar.
    #[serde(default)]
    pub ingest_md5: String,
    #[serde(default)]
    pub ingest_sha256: String,
    #[serde(default)]
    pub ingest_sha256_generated_at: Option<DateTime<Utc>>,

    /// Digests the bag's manifests claim.
    #[serde(default)]
    pub ingest_manifest_md5: String,
    #[serde(default)]
    pub ingest_manifest_sha256: String,

    #[serde(default)]
    pub ingest_md5_verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ingest_sha256_verified_at: Option<DateTime<Utc>>,

    /// False for bagit.txt and manifests, and for files whose prior version
    /// in the registry has the same sha256.
    #[serde(default = "default_true")]
    pub ingest_needs_save: bool,

    #[serde(default)]
    pub ingest_previous_version_exists: bool,

    #[serde(default)]
    pub ingest_error_message: String,

    /// Ownership from the tar header, kept for the audit trail.
    #[serde(default)]
    pub ingest_file_uid: i64,
    #[serde(default)]
    pub ingest_file_gid: i64,
    #[serde(default)]
    pub ingest_file_uname: String,
    #[serde(default)]
    pub ingest_file_gname: String,

    #[serde(default)]
    pub checksums: Vec<Checksum>,

    #[serde(default)]
    pub premis_events: Vec<PremisEvent>,
}

fn default_true() -> bool {
    true
}

impl GenericFile {
    pub fn new(object_identifier: &str, bag_relative_path: &str) -> Self {
        Self {
            id: 0,
            identifier: format!("{}/{}", object_identifier, bag_relative_path),
            intellectual_object_identifier: object_identifier.to_string(),
            intellectual_object_id: 0,
            size: 0,
            file_format: "application/binary".to_string(),
            file_modified: None,
            uri: String::new(),
            ingest_local_path: String::new(),
            ingest_uuid: Uuid::new_v4().to_string(),
            ingest_uuid_generated_at: Some(Utc::now()),
            ingest_storage_url: String::new(),
            ingest_stored_at: None,
            ingest_replication_url: String::new(),
            ingest_replicated_at: None,
            ingest_md5: String::new(),
            ingest_sha256: String::new(),
            ingest_sha256_generated_at: None,
            ingest_manifest_md5: String::new(),
            ingest_manifest_sha256: String::new(),
            ingest_md5_verified_at: None,
            ingest_sha256_verified_at: None,
            ingest_needs_save: true,
            ingest_previous_version_exists: false,
            ingest_error_message: String::new(),
            ingest_file_uid: 0,
            ingest_file_gid: 0,
            ingest_file_uname: String::new(),
            ingest_file_gname: String::new(),
            checksums: Vec::new(),
            premis_events: Vec::new(),
        }
    }

    /// Bag-relative path: the identifier minus "<institution>/<bag>/".
    pub fn original_path(&self) -> &str {
        self.identifier
            .strip_prefix(&self.intellectual_object_identifier)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(&self.identifier)
    }

    /// Path of this file inside the tar archive: "<bag>/<original path>".
    pub fn original_path_with_bag_name(&self) -> Option<String> {
        let bag_name = self.intellectual_object_identifier.split('/').nth(1)?;
        Some(format!("{}/{}", bag_name, self.original_path()))
    }

    /// Domain of the owning institution, the first identifier segment.
    pub fn institution_identifier(&self) -> Option<&str> {
        self.identifier.split('/').next()
    }

    /// True once both copies exist and the computed sha256 matches what the
    /// manifest claimed; the staging copy is then safe to delete.
    pub fn is_durable(&self) -> bool {
        self.ingest_stored_at.is_some()
            && self.ingest_replicated_at.is_some()
            && !self.ingest_sha256.is_empty()
            && (self.ingest_manifest_sha256.is_empty()
                || self.ingest_sha256 == self.ingest_manifest_sha256)
    }

    /// Build the md5 and sha256 checksum records. Idempotent: existing
    /// entries are left alone so a re-run after a partial registry save
    /// doesn't duplicate them.
    pub fn build_ingest_checksums(&mut self) {
        let generated_at = self.ingest_sha256_generated_at.unwrap_or_else(Utc::now);
        if !self.has_checksum(ALG_MD5) {
            let mut checksum = Checksum::new(ALG_MD5, self.ingest_md5.clone(), generated_at);
            checksum.verified_at = self.ingest_md5_verified_at;
            self.checksums.push(checksum);
        }
        if !self.has_checksum(ALG_SHA256) {
            let mut checksum = Checksum::new(ALG_SHA256, self.ingest_sha256.clone(), generated_at);
            checksum.verified_at = self.ingest_sha256_verified_at;
            self.checksums.push(checksum);
        }
    }

    fn has_checksum(&self, algorithm: &str) -> bool {
        self.checksums.iter().any(|c| c.algorithm == algorithm)
    }

    /// Build the seven per-file ingest events, each with its UUID fixed at
    /// construction. Idempotent across retries.
    pub fn build_ingest_events(&mut self) {
        let now = Utc::now();
        let stored_at = self.ingest_stored_at.unwrap_or(now);
        let generated_at = self.ingest_sha256_generated_at.unwrap_or(now);
        let verified_at = self.ingest_md5_verified_at.unwrap_or(now);

        if self.find_events_by_type(event::INGESTION).is_empty() {
            self.premis_events
                .push(PremisEvent::file_ingest(stored_at, &self.ingest_md5));
        }
        if self.find_events_by_type(event::FIXITY_CHECK).is_empty() {
            let matched = self.ingest_manifest_md5.is_empty()
                || self.ingest_manifest_md5 == self.ingest_md5;
            self.premis_events.push(PremisEvent::file_fixity_check(
                verified_at,
                ALG_MD5,
                &self.ingest_md5,
                matched,
            ));
        }
        if self.find_events_by_type(event::FIXITY_GENERATION).is_empty() {
            self.premis_events.push(PremisEvent::file_fixity_generation(
                generated_at,
                ALG_MD5,
                &self.ingest_md5,
            ));
            self.premis_events.push(PremisEvent::file_fixity_generation(
                generated_at,
                ALG_SHA256,
                &self.ingest_sha256,
            ));
        }
        if self
            .find_events_by_type(event::IDENTIFIER_ASSIGNMENT)
            .is_empty()
        {
            let assigned_at = self.ingest_uuid_generated_at.unwrap_or(now);
            self.premis_events.push(PremisEvent::file_identifier_assignment(
                assigned_at,
                ID_TYPE_BAG_AND_PATH,
                &self.identifier,
            ));
            self.premis_events.push(PremisEvent::file_identifier_assignment(
                stored_at,
                ID_TYPE_STORAGE_URL,
                &self.ingest_storage_url,
            ));
        }
        if self.find_events_by_type(event::REPLICATION).is_empty() {
            self.premis_events.push(PremisEvent::file_replication(
                self.ingest_replicated_at.unwrap_or(now),
                &self.ingest_replication_url,
            ));
        }
    }

    pub fn find_events_by_type(&self, event_type: &str) -> Vec<&PremisEvent> {
        self.premis_events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Absorb registry-assigned ids after a save: the file's own id, then
    /// each child checksum and event matched by algorithm / identifier.
    pub fn merge_attributes(&mut self, saved: &GenericFile) -> Vec<String> {
        let mut errors = Vec::new();
        self.id = saved.id;
        self.intellectual_object_id = saved.intellectual_object_id;

        for checksum in &mut self.checksums {
            checksum.generic_file_id = saved.id;
            match saved
                .checksums
                .iter()
                .find(|c| c.algorithm == checksum.algorithm)
            {
                Some(saved_checksum) => checksum.id = saved_checksum.id,
                None => errors.push(format!(
                    "Registry record for '{}' is missing the {} checksum",
                    self.identifier, checksum.algorithm
                )),
            }
        }
        for event in &mut self.premis_events {
            event.generic_file_id = saved.id;
            event.intellectual_object_id = saved.intellectual_object_id;
            match saved
                .premis_events
                .iter()
                .find(|e| e.identifier == event.identifier)
            {
                Some(saved_event) => event.merge_attributes(saved_event),
                None => errors.push(format!(
                    "Registry record for '{}' is missing event {}",
                    self.identifier, event.identifier
                )),
            }
        }
        errors
    }

    /// Propagate this file's ids down to its children, for files whose id
    /// was already known before the save.
    pub fn propagate_ids_to_children(&mut self) {
        for checksum in &mut self.checksums {
            checksum.generic_file_id = self.id;
        }
        for event in &mut self.premis_events {
            event.generic_file_id = self.id;
            event.intellectual_object_id = self.intellectual_object_id;
        }
    }
}

/// Pull the storage UUID out of an existing storage URL. The UUID is always
/// the last path component; anything else means the URL was not written by
/// this pipeline and overwriting blind would risk an orphan object.
pub fn uuid_from_storage_url(url: &str) -> Option<String> {
    let last = url.trim_end_matches('/').rsplit('/').next()?;
    if UUID_PATTERN.is_match(last) {
        Some(last.to_string())
    } else {
        None
    }
}
