//! HTTP client for the registry service
//!
//! The registry is the durable system of record: institutions, work items,
//! intellectual objects, generic files, checksums and PREMIS events all live
//! there, behind a versioned JSON API.

mod client;

pub use client::{RegistryClient, WorkItemQuery, ENV_REGISTRY_KEY, ENV_REGISTRY_USER};
