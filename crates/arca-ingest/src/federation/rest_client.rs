//! REST client for federation peer nodes

use arca_common::{ArcaError, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// A bag as a peer node describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationBag {
    pub uuid: String,
    #[serde(default)]
    pub local_id: String,
    pub size: i64,
    #[serde(default)]
    pub member: String,
    #[serde(default)]
    pub ingest_node: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// One replication request from a peer: copy this bag, report the
/// tag-manifest digest, store it if the peer approves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTransfer {
    pub replication_id: String,

    pub from_node: String,
    pub to_node: String,

    /// UUID of the bag being replicated.
    pub bag: String,

    /// Rsync source, e.g. "peer@peer.example.org:outbound/<uuid>.tar"
    pub link: String,

    #[serde(default)]
    pub fixity_algorithm: String,

    /// The digest of the bag's tag manifest, filled in by the receiving
    /// node after the copy.
    #[serde(default)]
    pub fixity_value: Option<String>,

    /// Set true by the sending node once the reported digest matches.
    #[serde(default)]
    pub store_requested: bool,

    #[serde(default)]
    pub stored: bool,

    #[serde(default)]
    pub cancelled: bool,

    #[serde(default)]
    pub cancel_reason: Option<String>,
}

impl ReplicationTransfer {
    /// No work remains once a transfer is stored or cancelled.
    pub fn is_settled(&self) -> bool {
        self.stored || self.cancelled
    }
}

/// Client for one node's federation REST API, ours or a peer's.
#[derive(Clone)]
pub struct FederationClient {
    client: Client,
    base_url: String,
    token: String,
    /// Namespace of the node this client talks to.
    pub node: String,
}

impl FederationClient {
    pub fn new(
        service_url: &str,
        api_root: &str,
        token: impl Into<String>,
        node: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| ArcaError::network(service_url, e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/{}",
                service_url.trim_end_matches('/'),
                api_root.trim_matches('/')
            ),
            token: token.into(),
            node: node.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ArcaError::network(&url, e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ArcaError::network(
                &url,
                format!("peer returned {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| ArcaError::network(&url, e.to_string()))
    }

    pub async fn get_bag(&self, uuid: &str) -> Result<Option<FederationBag>> {
        self.get_json(&format!("bags/{}", uuid)).await
    }

    pub async fn get_transfer(&self, replication_id: &str) -> Result<Option<ReplicationTransfer>> {
        self.get_json(&format!("replications/{}", replication_id))
            .await
    }

    /// Report the copied bag's tag-manifest digest. The response is the
    /// peer's updated view of the transfer; `store_requested` tells us
    /// whether to proceed to storage or discard the copy.
    pub async fn update_transfer(
        &self,
        transfer: &ReplicationTransfer,
    ) -> Result<ReplicationTransfer> {
        let url = self.url(&format!("replications/{}", transfer.replication_id));
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(transfer)
            .send()
            .await
            .map_err(|e| ArcaError::network(&url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(ArcaError::network(
                &url,
                format!("peer returned {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| ArcaError::network(&url, e.to_string()))
    }
}
