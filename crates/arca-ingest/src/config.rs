//! Runtime configuration
//!
//! One JSON file per deployment, passed to every worker binary via
//! `--config`. Paths are created at load time; registry and object-store
//! credentials come from the environment, never from this file.

use crate::storage::StorageTarget;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings one worker binary needs to talk to its queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkerConfig {
    /// How often to ping the queue while idle, e.g. "30s".
    pub heartbeat_interval: String,

    /// Retry budget for transient failures. Fatal errors never retry.
    pub max_attempts: u32,

    /// Messages the worker will hold unacknowledged at once. Long-running
    /// stages keep this low so messages don't time out while parked.
    pub max_in_flight: usize,

    /// Redelivery timeout per message, e.g. "180m" for the store stage.
    /// Workers touch the message during long operations to reset it.
    pub message_timeout: String,

    /// Concurrent network operations (uploads, registry calls).
    pub network_connections: usize,

    /// How often the worker polls the registry for claimable items in its
    /// stage, e.g. "60s". This is the stage hand-off path between worker
    /// processes, so it is the floor on stage-to-stage latency.
    pub poll_interval: String,

    pub queue_topic: String,
    pub queue_channel: String,

    pub read_timeout: String,
    pub write_timeout: String,

    /// Concurrent processing tasks other than network I/O.
    pub workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: "30s".to_string(),
            max_attempts: 3,
            max_in_flight: 20,
            message_timeout: "30m".to_string(),
            network_connections: 4,
            poll_interval: "60s".to_string(),
            queue_topic: String::new(),
            queue_channel: String::new(),
            read_timeout: "60s".to_string(),
            write_timeout: "10s".to_string(),
            workers: 2,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat(&self) -> Result<Duration> {
        parse_duration(&self.heartbeat_interval)
    }

    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(&self.message_timeout)
    }

    pub fn poll(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
    }
}

/// Connection settings for our own federation REST service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct FederationRestClientConfig {
    #[serde(rename = "LocalServiceURL")]
    pub local_service_url: String,
    #[serde(rename = "LocalAPIRoot")]
    pub local_api_root: String,
    pub local_auth_token: String,
}

/// Settings for the federation side: peer replication and cold-tier
/// restores.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct FederationConfig {
    /// Namespace of the node this process runs on, e.g. "arca".
    pub local_node: String,

    pub replicate_to_num_nodes: usize,

    /// Where bags copied from peers land before validation and storage.
    pub staging_directory: String,

    /// Prefix of peer home directories for rsync-over-ssh sources. "/home"
    /// in production.
    pub remote_node_home_directory: String,

    #[serde(rename = "UseSSHWithRsync")]
    pub use_ssh_with_rsync: bool,

    pub rest_client: FederationRestClientConfig,

    /// Bearer tokens per peer namespace.
    pub remote_node_tokens: HashMap<String, String>,

    /// Peer URL overrides; normally peer URLs come from our own node
    /// registry.
    #[serde(rename = "RemoteNodeURLs")]
    pub remote_node_urls: HashMap<String, String>,

    /// Accept self-signed certs. Test clusters only.
    #[serde(rename = "AcceptInvalidSSLCerts")]
    pub accept_invalid_ssl_certs: bool,

    /// The archival-tier bucket federation bags live in.
    pub preservation_bucket: String,
    pub archival_region: String,

    pub copy_worker: WorkerConfig,
    pub validate_worker: WorkerConfig,
    pub store_worker: WorkerConfig,
    pub restore_worker: WorkerConfig,
}

/// The full runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Path of the file this config was loaded from.
    #[serde(skip)]
    pub active_config: String,

    /// Where tars are downloaded and unpacked. Needs generous free space.
    pub tar_directory: String,

    pub log_directory: String,
    pub restore_directory: String,
    pub replication_directory: String,

    /// Receiving buckets to poll for new uploads.
    pub receiving_buckets: Vec<String>,

    pub preservation_bucket: String,
    pub replication_bucket: String,

    /// Region of the primary preservation bucket.
    pub primary_region: String,
    /// Region of the replication bucket; a different geography by policy.
    pub replication_region: String,

    /// Custom S3 endpoint for local test stacks.
    #[serde(rename = "CustomS3Endpoint")]
    pub custom_s3_endpoint: Option<String>,

    #[serde(rename = "RegistryURL")]
    pub registry_url: String,
    #[serde(rename = "RegistryAPIVersion")]
    pub registry_api_version: String,

    pub max_days_since_fixity_check: u32,

    /// Largest tar we are willing to ingest. Zero means no limit.
    pub max_file_size: i64,

    /// Whether to delete the original upload after a successful ingest.
    /// False in dev/test environments.
    pub delete_on_success: bool,

    /// Whether the bucket reader should skip items already processed.
    /// Almost always true; false only to deliberately reprocess.
    pub skip_already_processed: bool,

    pub restore_to_test_buckets: bool,
    pub custom_restore_bucket: String,

    /// Path of the declarative bag validation profile the validator loads.
    pub bag_validation_config_file: String,

    pub fetch_worker: WorkerConfig,
    pub validate_worker: WorkerConfig,
    pub store_worker: WorkerConfig,
    pub record_worker: WorkerConfig,
    pub fixity_worker: WorkerConfig,
    pub restore_worker: WorkerConfig,

    pub federation: FederationConfig,
}

impl Config {
    /// Load from a JSON file, expand `~`, and create the working
    /// directories.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Error reading config file '{}'", path.display()))?;
        let mut config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Error parsing JSON from config file '{}'", path.display()))?;
        config.active_config = path.to_string_lossy().to_string();
        config.expand_file_paths();
        config.create_directories()?;
        Ok(config)
    }

    fn expand_file_paths(&mut self) {
        for dir in [
            &mut self.tar_directory,
            &mut self.log_directory,
            &mut self.restore_directory,
            &mut self.replication_directory,
            &mut self.federation.staging_directory,
        ] {
            if let Some(expanded) = expand_tilde(dir) {
                *dir = expanded;
            }
        }
    }

    fn create_directories(&self) -> Result<()> {
        for (name, dir) in [
            ("TarDirectory", &self.tar_directory),
            ("LogDirectory", &self.log_directory),
            ("RestoreDirectory", &self.restore_directory),
            ("ReplicationDirectory", &self.replication_directory),
        ] {
            if dir.is_empty() {
                return Err(anyhow!("You must define config.{}", name));
            }
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {} at {}", name, dir))?;
        }
        if !self.federation.staging_directory.is_empty() {
            std::fs::create_dir_all(&self.federation.staging_directory)
                .context("Cannot create Federation.StagingDirectory")?;
        }
        Ok(())
    }

    pub fn tar_directory_path(&self) -> PathBuf {
        PathBuf::from(&self.tar_directory)
    }

    /// Where a bag's downloaded tar lives.
    pub fn tar_path(&self, bag_name: &str) -> PathBuf {
        self.tar_directory_path().join(format!("{}.tar", bag_name))
    }

    /// Where a bag's staging database lives.
    pub fn staging_db_path(&self, bag_name: &str) -> PathBuf {
        self.tar_directory_path().join(format!("{}.valdb", bag_name))
    }

    /// Where large-file upload temps live.
    pub fn upload_temp_path(&self, uuid: &str) -> PathBuf {
        self.tar_directory_path().join("tmp").join(uuid)
    }

    pub fn primary_target(&self) -> StorageTarget {
        StorageTarget {
            name: "primary".to_string(),
            region: self.primary_region.clone(),
            bucket: self.preservation_bucket.clone(),
            endpoint: self.custom_s3_endpoint.clone(),
            path_style: self.custom_s3_endpoint.is_some(),
        }
    }

    pub fn replica_target(&self) -> StorageTarget {
        StorageTarget {
            name: "replica".to_string(),
            region: self.replication_region.clone(),
            bucket: self.replication_bucket.clone(),
            endpoint: self.custom_s3_endpoint.clone(),
            path_style: self.custom_s3_endpoint.is_some(),
        }
    }

    pub fn receiving_target(&self, bucket: &str) -> StorageTarget {
        StorageTarget {
            name: "receiving".to_string(),
            region: self.primary_region.clone(),
            bucket: bucket.to_string(),
            endpoint: self.custom_s3_endpoint.clone(),
            path_style: self.custom_s3_endpoint.is_some(),
        }
    }

    pub fn archival_target(&self) -> StorageTarget {
        StorageTarget {
            name: "archival".to_string(),
            region: self.federation.archival_region.clone(),
            bucket: self.federation.preservation_bucket.clone(),
            endpoint: self.custom_s3_endpoint.clone(),
            path_style: self.custom_s3_endpoint.is_some(),
        }
    }
}

/// Parse "800ms", "10s", "30m", "3h" into a Duration.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("Duration '{}' has no unit", value))?;
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .with_context(|| format!("Bad duration '{}'", value))?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        _ => Err(anyhow!("Unknown duration unit '{}' in '{}'", unit, value)),
    }
}

fn expand_tilde(path: &str) -> Option<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").ok()?;
        return Some(format!("{}/{}", home.trim_end_matches('/'), rest));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("800ms").unwrap(), Duration::from_millis(800));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("3h").unwrap(), Duration::from_secs(10800));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().to_string();
        let json = format!(
            r#"{{
                "TarDirectory": "{base}/tar",
                "LogDirectory": "{base}/logs",
                "RestoreDirectory": "{base}/restore",
                "ReplicationDirectory": "{base}/replication",
                "ReceivingBuckets": ["arca.receiving.inst.edu"],
                "PreservationBucket": "arca-preservation",
                "ReplicationBucket": "arca-replication",
                "PrimaryRegion": "us-east-1",
                "ReplicationRegion": "us-west-2",
                "RegistryURL": "https://registry.example.org",
                "RegistryAPIVersion": "v2",
                "MaxFileSize": 5368709120,
                "DeleteOnSuccess": true,
                "SkipAlreadyProcessed": true,
                "StoreWorker": {{
                    "MaxAttempts": 5,
                    "MessageTimeout": "180m",
                    "NetworkConnections": 10,
                    "PollInterval": "15s",
                    "QueueTopic": "store",
                    "QueueChannel": "store-workers"
                }},
                "Federation": {{
                    "LocalNode": "arca",
                    "UseSSHWithRsync": true,
                    "PreservationBucket": "arca-archival",
                    "ArchivalRegion": "us-west-2",
                    "RemoteNodeTokens": {{"peer1": "token-1"}}
                }}
            }}"#
        );
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, json).unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.receiving_buckets.len(), 1);
        assert_eq!(config.store_worker.max_attempts, 5);
        assert_eq!(config.store_worker.network_connections, 10);
        assert_eq!(config.store_worker.timeout().unwrap(), Duration::from_secs(10800));
        assert_eq!(config.store_worker.poll().unwrap(), Duration::from_secs(15));
        // Unspecified workers fall back to defaults.
        assert_eq!(config.fetch_worker.max_attempts, 3);
        assert_eq!(config.fetch_worker.poll().unwrap(), Duration::from_secs(60));
        assert_eq!(config.federation.remote_node_tokens["peer1"], "token-1");
        assert!(config.federation.use_ssh_with_rsync);
        assert!(dir.path().join("tar").is_dir());
        assert!(dir.path().join("logs").is_dir());

        assert_eq!(config.tar_path("photos"), dir.path().join("tar/photos.tar"));
        assert_eq!(
            config.staging_db_path("photos"),
            dir.path().join("tar/photos.valdb")
        );
        assert_eq!(
            config.upload_temp_path("abc-uuid"),
            dir.path().join("tar/tmp/abc-uuid")
        );

        let primary = config.primary_target();
        assert_eq!(primary.bucket, "arca-preservation");
        assert_eq!(primary.region, "us-east-1");
        let replica = config.replica_target();
        assert_eq!(replica.bucket, "arca-replication");
        assert_eq!(replica.region, "us-west-2");
        assert_eq!(config.archival_target().bucket, "arca-archival");
    }
}
