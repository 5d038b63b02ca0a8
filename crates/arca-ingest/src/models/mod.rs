//! Domain models shared by every pipeline stage
//!
//! These types cross three boundaries: the registry's JSON API, the local
//! staging database, and the work item's serialized state blob. They are all
//! plain serde structs; relationships are identifier lookups, not object
//! graphs.

mod checksum;
mod generic_file;
mod ingest_manifest;
mod institution;
mod intellectual_object;
mod premis_event;
mod work_item;
mod work_summary;

pub use checksum::Checksum;
pub use generic_file::{uuid_from_storage_url, GenericFile};
pub use ingest_manifest::IngestManifest;
pub use institution::Institution;
pub use intellectual_object::{IntellectualObject, Tag};
pub use premis_event::PremisEvent;
pub use work_item::WorkItem;
pub use work_summary::WorkSummary;
