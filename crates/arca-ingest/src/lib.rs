//! Arca ingest pipeline
//!
//! The core of the arca preservation repository: a sequence of queue-driven
//! workers that discover depositor uploads, validate them as BagIt bags,
//! store every payload file redundantly in two object-store regions, and
//! record objects, files, checksums and PREMIS events in the registry.
//! The same crate carries the federation side: pulling bags from peer
//! nodes and initiating cold-tier restores.
//!
//! Module map:
//!
//! - [`models`]: work items, intellectual objects, generic files, events
//! - [`bag`]: streaming tar reader and BagIt validation
//! - [`staging`]: per-bag SQLite staging database
//! - [`registry`]: HTTP client for the registry service
//! - [`storage`]: object-store targets (primary, replica, archival)
//! - [`queue`]: work queue abstraction with heartbeats and redelivery
//! - [`volume`]: disk space reservations for incoming transfers
//! - [`workers`]: the ingest pipeline stages
//! - [`federation`]: peer replication and cold-tier restore

pub mod bag;
pub mod config;
pub mod constants;
pub mod context;
pub mod federation;
pub mod models;
pub mod queue;
pub mod registry;
pub mod staging;
pub mod storage;
pub mod volume;
pub mod workers;
