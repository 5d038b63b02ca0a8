//! Registry API client

use crate::models::{Checksum, GenericFile, Institution, IntellectualObject, PremisEvent, WorkItem};
use arca_common::{ArcaError, Result};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable holding the registry API user.
pub const ENV_REGISTRY_USER: &str = "REGISTRY_API_USER";
/// Environment variable holding the registry API key.
pub const ENV_REGISTRY_KEY: &str = "REGISTRY_API_KEY";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Paged list envelope the registry wraps all list responses in.
#[derive(Debug, Deserialize)]
struct Paged<T> {
    #[allow(dead_code)]
    count: i64,
    results: Vec<T>,
}

/// Filters for listing work items.
#[derive(Debug, Clone, Default)]
pub struct WorkItemQuery {
    pub name: Option<String>,
    pub etag: Option<String>,
    pub bucket: Option<String>,
    pub item_action: Option<String>,
    pub stage: Option<String>,
    pub status: Option<String>,
    pub retry: Option<bool>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl WorkItemQuery {
    fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(v) = &self.name {
            params.push(("name", v.clone()));
        }
        if let Some(v) = &self.etag {
            params.push(("etag", v.clone()));
        }
        if let Some(v) = &self.bucket {
            params.push(("bucket", v.clone()));
        }
        if let Some(v) = &self.item_action {
            params.push(("item_action", v.clone()));
        }
        if let Some(v) = &self.stage {
            params.push(("stage", v.clone()));
        }
        if let Some(v) = &self.status {
            params.push(("status", v.clone()));
        }
        if let Some(v) = self.retry {
            params.push(("retry", v.to_string()));
        }
        if let Some(v) = self.page {
            params.push(("page", v.to_string()));
        }
        if let Some(v) = self.per_page {
            params.push(("per_page", v.to_string()));
        }
        params
    }
}

/// Connection-pooled client for the registry's JSON API. Credentials ride
/// along as headers on every request; they come from the environment, never
/// from config files.
#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    base_url: String,
    api_user: String,
    api_key: String,
}

impl RegistryClient {
    /// Build a client for `<base_url>/api/<api_version>`.
    pub fn new(base_url: &str, api_version: &str) -> Result<Self> {
        let api_user = std::env::var(ENV_REGISTRY_USER).map_err(|_| {
            ArcaError::config(
                format!("Environment variable {} is not set", ENV_REGISTRY_USER),
                "Export the registry API user before starting any worker",
            )
        })?;
        let api_key = std::env::var(ENV_REGISTRY_KEY).map_err(|_| {
            ArcaError::config(
                format!("Environment variable {} is not set", ENV_REGISTRY_KEY),
                "Export the registry API key before starting any worker",
            )
        })?;
        Self::with_credentials(base_url, api_version, api_user, api_key)
    }

    /// Build a client with explicit credentials. Tests use this.
    pub fn with_credentials(
        base_url: &str,
        api_version: &str,
        api_user: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ArcaError::network(base_url, e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/api/{}",
                base_url.trim_end_matches('/'),
                api_version.trim_matches('/')
            ),
            api_user: api_user.into(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Identifiers contain slashes; they travel percent-encoded in paths.
    fn escape_identifier(identifier: &str) -> String {
        identifier.replace('%', "%25").replace('/', "%2F")
    }

    /// Send with credentials attached, without judging the status.
    async fn send_raw(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Response> {
        request
            .header("X-Registry-User", &self.api_user)
            .header("X-Registry-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| ArcaError::network(url, e.to_string()))
    }

    /// Send with credentials; 5xx surfaces as a transient network error.
    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Response> {
        let response = self.send_raw(request, url).await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ArcaError::network(url, format!("registry returned {}", status)));
        }
        Ok(response)
    }

    async fn json_or_error<T: DeserializeOwned>(response: Response, operation: &str) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArcaError::registry(
                operation,
                format!("{}: {}", status, truncate(&body, 500)),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ArcaError::registry(operation, e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| {
            ArcaError::registry(operation, format!("bad response body: {} ({})", e, truncate(&body, 200)))
        })
    }

    // ---- institutions ----

    pub async fn institutions(&self) -> Result<Vec<Institution>> {
        let url = self.url("institutions?per_page=100");
        let response = self.send(self.client.get(&url), &url).await?;
        let paged: Paged<Institution> = Self::json_or_error(response, "institutions list").await?;
        Ok(paged.results)
    }

    pub async fn institution_get(&self, identifier: &str) -> Result<Option<Institution>> {
        let url = self.url(&format!(
            "institutions/{}",
            Self::escape_identifier(identifier)
        ));
        let response = self.send(self.client.get(&url), &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            Self::json_or_error(response, "institution get").await?,
        ))
    }

    // ---- work items ----

    pub async fn work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>> {
        let url = self.url("items");
        let response = self
            .send(self.client.get(&url).query(&query.to_params()), &url)
            .await?;
        let paged: Paged<WorkItem> = Self::json_or_error(response, "work item list").await?;
        Ok(paged.results)
    }

    pub async fn work_item_get(&self, id: i64) -> Result<Option<WorkItem>> {
        let url = self.url(&format!("items/{}", id));
        let response = self.send(self.client.get(&url), &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::json_or_error(response, "work item get").await?))
    }

    pub async fn work_item_create(&self, item: &WorkItem) -> Result<WorkItem> {
        let url = self.url("items");
        let response = self
            .send(self.client.post(&url).json(&item.for_registry()), &url)
            .await?;
        Self::json_or_error(response, "work item create").await
    }

    pub async fn work_item_save(&self, item: &WorkItem) -> Result<WorkItem> {
        if item.id == 0 {
            return self.work_item_create(item).await;
        }
        let url = self.url(&format!("items/{}", item.id));
        let response = self
            .send(self.client.put(&url).json(&item.for_registry()), &url)
            .await?;
        Self::json_or_error(response, "work item update").await
    }

    // ---- intellectual objects ----

    /// 404 means the object has never been ingested, which is the normal
    /// case; it surfaces as None, not as an error.
    pub async fn intellectual_object_get(
        &self,
        identifier: &str,
    ) -> Result<Option<IntellectualObject>> {
        let url = self.url(&format!(
            "objects/{}",
            Self::escape_identifier(identifier)
        ));
        let response = self.send(self.client.get(&url), &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::json_or_error(response, "object get").await?))
    }

    pub async fn intellectual_object_save(
        &self,
        object: &IntellectualObject,
    ) -> Result<IntellectualObject> {
        if object.id == 0 {
            let url = self.url("objects");
            let response = self
                .send(self.client.post(&url).json(&object.for_registry()), &url)
                .await?;
            Self::json_or_error(response, "object create").await
        } else {
            let url = self.url(&format!("objects/{}", object.id));
            let response = self
                .send(self.client.put(&url).json(&object.for_registry()), &url)
                .await?;
            Self::json_or_error(response, "object update").await
        }
    }

    // ---- generic files ----

    pub async fn generic_file_get(&self, identifier: &str) -> Result<Option<GenericFile>> {
        let url = self.url(&format!("files/{}", Self::escape_identifier(identifier)));
        let response = self.send(self.client.get(&url), &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::json_or_error(response, "file get").await?))
    }

    /// Create a batch of new files in one POST. The response carries each
    /// created file with its registry-assigned id and the ids of its child
    /// checksums and events. On partial failure the registry still returns
    /// whatever it managed to create.
    pub async fn generic_file_save_batch(
        &self,
        files: &[GenericFile],
    ) -> Result<Vec<GenericFile>> {
        let url = self.url("files/batch");
        let body = serde_json::json!({ "generic_files": files });
        let response = self
            .send_raw(self.client.post(&url).json(&body), &url)
            .await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ArcaError::registry("file batch create", e.to_string()))?;
        // Even an error response may carry created rows; parse first,
        // then report.
        let saved: Vec<GenericFile> = serde_json::from_str::<Paged<GenericFile>>(&text)
            .map(|p| p.results)
            .or_else(|_| serde_json::from_str::<Vec<GenericFile>>(&text))
            .unwrap_or_default();
        if !status.is_success() {
            if saved.is_empty() {
                return Err(ArcaError::registry(
                    "file batch create",
                    format!("{}: {}", status, truncate(&text, 500)),
                ));
            }
            // Partial success: callers merge what exists and retry the rest.
            return Ok(saved);
        }
        Ok(saved)
    }

    pub async fn generic_file_save(&self, file: &GenericFile) -> Result<GenericFile> {
        if file.id == 0 {
            let url = self.url("files");
            let response = self.send(self.client.post(&url).json(file), &url).await?;
            Self::json_or_error(response, "file create").await
        } else {
            let url = self.url(&format!("files/{}", file.id));
            let response = self.send(self.client.put(&url).json(file), &url).await?;
            Self::json_or_error(response, "file update").await
        }
    }

    // ---- checksums ----

    /// Checksums for one file + algorithm, newest first. The store worker
    /// uses the head of this list to decide whether a file changed since
    /// its last ingest.
    pub async fn checksum_list(
        &self,
        generic_file_identifier: &str,
        algorithm: &str,
    ) -> Result<Vec<Checksum>> {
        let url = self.url("checksums");
        let response = self
            .send(
                self.client.get(&url).query(&[
                    ("generic_file_identifier", generic_file_identifier),
                    ("algorithm", algorithm),
                    ("sort", "datetime DESC"),
                ]),
                &url,
            )
            .await?;
        let paged: Paged<Checksum> = Self::json_or_error(response, "checksum list").await?;
        Ok(paged.results)
    }

    // ---- premis events ----

    pub async fn premis_event_save(&self, event: &PremisEvent) -> Result<PremisEvent> {
        let url = self.url("events");
        let response = self.send(self.client.post(&url).json(event), &url).await?;
        Self::json_or_error(response, "event create").await
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_identifier() {
        assert_eq!(
            RegistryClient::escape_identifier("inst.edu/bag/data/file.txt"),
            "inst.edu%2Fbag%2Fdata%2Ffile.txt"
        );
        assert_eq!(
            RegistryClient::escape_identifier("file%20name/x"),
            "file%2520name%2Fx"
        );
    }

    #[test]
    fn test_query_params() {
        let query = WorkItemQuery {
            name: Some("inst.edu.bag.tar".to_string()),
            etag: Some("abc".to_string()),
            retry: Some(true),
            per_page: Some(50),
            ..Default::default()
        };
        let params = query.to_params();
        assert!(params.contains(&("name", "inst.edu.bag.tar".to_string())));
        assert!(params.contains(&("etag", "abc".to_string())));
        assert!(params.contains(&("retry", "true".to_string())));
        assert!(params.contains(&("per_page", "50".to_string())));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_base_url_normalization() {
        let client =
            RegistryClient::with_credentials("https://registry.example/", "v2", "u", "k").unwrap();
        assert_eq!(client.url("items"), "https://registry.example/api/v2/items");
    }
}
