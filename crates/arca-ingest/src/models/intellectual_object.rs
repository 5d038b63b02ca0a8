//! The logical unit of preservation

use crate::constants::{event, Access};
use crate::models::{GenericFile, PremisEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tag parsed from one of the bag's tag files, e.g. "Title: Photos 2024"
/// from bag-info.txt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Which tag file the tag came from, bag-relative.
    pub source_file: String,
    pub label: String,
    pub value: String,
}

/// One deposited bag as a logical object: identifier, access level, member
/// files, tags and object-level events.
///
/// Constructed by the validator, mutated by the store worker, finalised by
/// the record worker, retained in the registry indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntellectualObject {
    /// Registry id. Zero until recorded.
    #[serde(default)]
    pub id: i64,

    /// `<institution>/<bag-name>`
    pub identifier: String,

    /// Domain of the owning institution.
    pub institution: String,

    #[serde(default)]
    pub institution_id: i64,

    /// Tar base name minus ".tar" and any multipart suffix.
    pub bag_name: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    pub access: Access,

    #[serde(default)]
    pub generic_files: Vec<GenericFile>,

    #[serde(default)]
    pub premis_events: Vec<PremisEvent>,

    #[serde(default)]
    pub ingest_tags: Vec<Tag>,

    // ---- ingest-only attributes, persisted in the staging DB ----
    #[serde(default)]
    pub ingest_tar_file_path: String,
    #[serde(default)]
    pub ingest_untarred_path: String,
    #[serde(default)]
    pub ingest_staging_db_path: String,

    /// Tar entries that were neither regular files nor directories
    /// (symlinks, devices). Noted, not fatal.
    #[serde(default)]
    pub ingest_files_ignored: Vec<String>,

    #[serde(default)]
    pub ingest_error_message: String,

    #[serde(default)]
    pub ingest_downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ingest_validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ingest_stored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ingest_recorded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ingest_deleted_from_receiving_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IntellectualObject {
    pub fn new(institution: &str, bag_name: &str) -> Self {
        Self {
            id: 0,
            identifier: format!("{}/{}", institution, bag_name),
            institution: institution.to_string(),
            institution_id: 0,
            bag_name: bag_name.to_string(),
            title: bag_name.to_string(),
            description: String::new(),
            access: Access::default(),
            generic_files: Vec::new(),
            premis_events: Vec::new(),
            ingest_tags: Vec::new(),
            ingest_tar_file_path: String::new(),
            ingest_untarred_path: String::new(),
            ingest_staging_db_path: String::new(),
            ingest_files_ignored: Vec::new(),
            ingest_error_message: String::new(),
            ingest_downloaded_at: None,
            ingest_validated_at: None,
            ingest_stored_at: None,
            ingest_recorded_at: None,
            ingest_deleted_from_receiving_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// All tags with the given label, compared case-insensitively.
    pub fn find_tags(&self, label: &str) -> Vec<&Tag> {
        self.ingest_tags
            .iter()
            .filter(|t| t.label.eq_ignore_ascii_case(label))
            .collect()
    }

    /// Find a member file by its bag-relative path.
    pub fn find_file(&self, bag_relative_path: &str) -> Option<&GenericFile> {
        self.generic_files
            .iter()
            .find(|gf| gf.original_path() == bag_relative_path)
    }

    /// Only files under data/ count as payload.
    pub fn payload_file_count(&self) -> usize {
        self.generic_files
            .iter()
            .filter(|gf| gf.original_path().starts_with("data/"))
            .count()
    }

    /// True when every file that needed saving has both copies.
    pub fn all_files_saved(&self) -> bool {
        self.generic_files.iter().all(|gf| {
            !gf.ingest_needs_save
                || (gf.ingest_stored_at.is_some() && gf.ingest_replicated_at.is_some())
        })
    }

    /// Build the three object-level events (ingest, identifier assignment,
    /// access assignment), each with its UUID fixed at construction.
    /// Idempotent across retries.
    pub fn build_ingest_events(&mut self, file_count: usize) {
        if self.find_events_by_type(event::INGESTION).is_empty() {
            self.premis_events.push(PremisEvent::object_ingest(file_count));
        }
        if self
            .find_events_by_type(event::IDENTIFIER_ASSIGNMENT)
            .is_empty()
        {
            self.premis_events
                .push(PremisEvent::object_identifier_assignment(&self.identifier));
        }
        if self.find_events_by_type(event::ACCESS_ASSIGNMENT).is_empty() {
            self.premis_events
                .push(PremisEvent::object_access_assignment(self.access.as_str()));
        }
    }

    pub fn find_events_by_type(&self, event_type: &str) -> Vec<&PremisEvent> {
        self.premis_events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// The body a registry create/update call wants. Files are sent
    /// separately in batches; events are sent individually.
    pub fn for_registry(&self) -> serde_json::Value {
        serde_json::json!({
            "identifier": self.identifier,
            "institution": self.institution,
            "institution_id": self.institution_id,
            "bag_name": self.bag_name,
            "title": self.title,
            "description": self.description,
            "access": self.access,
            "ingest_error_message": self.ingest_error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_with_files() -> IntellectualObject {
        let mut obj = IntellectualObject::new("inst.edu", "photos");
        obj.generic_files
            .push(GenericFile::new("inst.edu/photos", "data/image.jpg"));
        obj.generic_files
            .push(GenericFile::new("inst.edu/photos", "bag-info.txt"));
        obj
    }

    #[test]
    fn test_identifier() {
        let obj = IntellectualObject::new("inst.edu", "photos");
        assert_eq!(obj.identifier, "inst.edu/photos");
        assert_eq!(obj.access, Access::Institution);
    }

    #[test]
    fn test_find_file_and_payload_count() {
        let obj = object_with_files();
        assert!(obj.find_file("data/image.jpg").is_some());
        assert!(obj.find_file("data/missing.jpg").is_none());
        assert_eq!(obj.payload_file_count(), 1);
    }

    #[test]
    fn test_find_tags_case_insensitive() {
        let mut obj = object_with_files();
        obj.ingest_tags.push(Tag {
            source_file: "bag-info.txt".to_string(),
            label: "Source-Organization".to_string(),
            value: "Inst".to_string(),
        });
        assert_eq!(obj.find_tags("source-organization").len(), 1);
        assert!(obj.find_tags("Title").is_empty());
    }

    #[test]
    fn test_all_files_saved() {
        let mut obj = object_with_files();
        obj.generic_files[1].ingest_needs_save = false;
        assert!(!obj.all_files_saved());
        obj.generic_files[0].ingest_stored_at = Some(Utc::now());
        obj.generic_files[0].ingest_replicated_at = Some(Utc::now());
        assert!(obj.all_files_saved());
    }

    #[test]
    fn test_build_ingest_events_idempotent() {
        let mut obj = object_with_files();
        obj.build_ingest_events(2);
        assert_eq!(obj.premis_events.len(), 3);
        obj.build_ingest_events(2);
        assert_eq!(obj.premis_events.len(), 3);

        let identifiers: std::collections::HashSet<_> =
            obj.premis_events.iter().map(|e| e.identifier.clone()).collect();
        assert_eq!(identifiers.len(), 3);
    }
}
