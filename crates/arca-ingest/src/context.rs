//! Shared worker context
//!
//! Config, registry client and process identity are read once at startup
//! and passed explicitly to every worker constructor. Nothing here is a
//! process-wide global.

use crate::config::Config;
use crate::registry::RegistryClient;
use anyhow::Result;
use std::sync::Arc;

/// Everything a worker needs that outlives a single message.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub registry: RegistryClient,
    /// Hostname, read once at startup.
    pub node: String,
    /// Process id, read once at startup.
    pub pid: u32,
}

impl Context {
    pub fn new(config: Config) -> Result<Self> {
        let registry = RegistryClient::new(&config.registry_url, &config.registry_api_version)?;
        Ok(Self::with_registry(config, registry))
    }

    /// Build a context around an existing registry client. Tests use this
    /// to point at a stub server.
    pub fn with_registry(config: Config, registry: RegistryClient) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            node: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-host".to_string()),
            pid: std::process::id(),
        }
    }
}
