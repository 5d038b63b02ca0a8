//! Object-store targets and operations
//!
//! Primary, replica and archival buckets are all values of [`StorageTarget`]
//! behind the same [`ObjectStore`] operations: upload, head, list, delete,
//! download and cold-tier restore. The two preservation copies differ only
//! in region and bucket name, never in code path.

use crate::constants::{part_size_for, MIN_PART_SIZE};
use arca_common::{ArcaError, Result};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, GlacierJobParameters, RestoreRequest, Tier,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// The five metadata keys every preserved object must carry. An upload
/// missing any of them is refused outright.
pub const REQUIRED_UPLOAD_METADATA: [&str; 5] = ["institution", "bag", "bagpath", "md5", "sha256"];

/// One bucket in one region, with an optional custom endpoint for local
/// test stacks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct StorageTarget {
    /// Human name for logs: "primary", "replica", "archival".
    pub name: String,
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub path_style: bool,
}

#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
}

/// What a HEAD says about an archival object's restore state.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequestInfo {
    /// A restore request exists and the object is still thawing.
    pub request_in_progress: bool,
    /// The object is available in the hot tier right now.
    pub request_is_complete: bool,
    /// When the hot-tier copy will be dropped again.
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Outcome of a restore-object call.
#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub accepted: bool,
    pub already_in_hot_tier: bool,
    pub service_unavailable: bool,
}

/// Where upload bytes come from: small files ride in memory, large files
/// are spooled to disk first so parts can be re-read by offset.
pub enum UploadSource {
    Memory(Vec<u8>),
    File(PathBuf),
}

/// S3-compatible client bound to one [`StorageTarget`].
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    target: StorageTarget,
}

impl ObjectStore {
    /// Connect using credentials from `AWS_ACCESS_KEY_ID` /
    /// `AWS_SECRET_ACCESS_KEY`.
    pub fn connect(target: StorageTarget) -> Result<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            ArcaError::config(
                "Environment variable AWS_ACCESS_KEY_ID is not set",
                "Export object store credentials before starting any worker",
            )
        })?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            ArcaError::config(
                "Environment variable AWS_SECRET_ACCESS_KEY is not set",
                "Export object store credentials before starting any worker",
            )
        })?;

        let credentials = Credentials::new(&access_key, &secret_key, None, None, "arca-storage");
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(target.region.clone()))
            .force_path_style(target.path_style);
        if let Some(endpoint) = &target.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());
        debug!(target = %target.name, bucket = %target.bucket, region = %target.region,
               "object store client initialized");
        Ok(Self { client, target })
    }

    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    /// The canonical URL of an object in this target, as recorded in the
    /// registry.
    pub fn url_for(&self, key: &str) -> String {
        match &self.target.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.target.bucket,
                key
            ),
            None => format!(
                "https://s3.{}.amazonaws.com/{}/{}",
                self.target.region, self.target.bucket, key
            ),
        }
    }

    /// Upload one object with its required preservation metadata. Returns
    /// the stored object's URL.
    pub async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        assert_required_metadata(metadata)?;
        match source {
            UploadSource::Memory(data) => {
                debug!(key, size = data.len(), bucket = %self.target.bucket, "single put upload");
                self.client
                    .put_object()
                    .bucket(&self.target.bucket)
                    .key(key)
                    .content_type(content_type)
                    .set_metadata(Some(metadata.clone()))
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| storage_err("upload", &e))?;
            }
            UploadSource::File(path) => {
                let size = std::fs::metadata(&path)
                    .map_err(|e| {
                        ArcaError::storage("upload", format!("cannot stat {}: {}", path.display(), e))
                    })?
                    .len() as i64;
                if size <= MIN_PART_SIZE {
                    let body = ByteStream::from_path(&path).await.map_err(|e| {
                        ArcaError::storage("upload", format!("cannot read {}: {}", path.display(), e))
                    })?;
                    self.client
                        .put_object()
                        .bucket(&self.target.bucket)
                        .key(key)
                        .content_type(content_type)
                        .set_metadata(Some(metadata.clone()))
                        .body(body)
                        .send()
                        .await
                        .map_err(|e| storage_err("upload", &e))?;
                } else {
                    self.multipart_upload(key, &path, size, content_type, metadata)
                        .await?;
                }
            }
        }
        Ok(self.url_for(key))
    }

    /// Multipart upload from a file on disk. Part size and concurrency come
    /// from the size ladder; every part re-opens the file and seeks to its
    /// own offset. Parts never outlive a failed upload.
    async fn multipart_upload(
        &self,
        key: &str,
        path: &Path,
        size: i64,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let (part_size, concurrency) = part_size_for(size);
        let part_count = (size + part_size - 1) / part_size;
        info!(key, size, part_size, part_count, concurrency, bucket = %self.target.bucket,
              "starting multipart upload");

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.target.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(|e| storage_err("multipart create", &e))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();

        let result = self
            .upload_parts(key, path, size, part_size, part_count, concurrency, &upload_id)
            .await;

        match result {
            Ok(completed_parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.target.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(completed_parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| storage_err("multipart complete", &e))?;
                Ok(())
            }
            Err(err) => {
                // Abandoned parts cost money until aborted.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.target.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        key: &str,
        path: &Path,
        size: i64,
        part_size: i64,
        part_count: i64,
        concurrency: usize,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        use futures::stream::{self, StreamExt, TryStreamExt};

        let mut completed: Vec<CompletedPart> = stream::iter(1..=part_count)
            .map(|part_number| {
                let client = self.client.clone();
                let bucket = self.target.bucket.clone();
                let key = key.to_string();
                let upload_id = upload_id.to_string();
                let path = path.to_path_buf();
                async move {
                    let offset = (part_number - 1) * part_size;
                    let this_part = part_size.min(size - offset);
                    let data = read_part(&path, offset, this_part).await?;
                    let part = client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number as i32)
                        .body(ByteStream::from(data))
                        .send()
                        .await
                        .map_err(|e| storage_err("part upload", &e))?;
                    Ok::<CompletedPart, ArcaError>(
                        CompletedPart::builder()
                            .part_number(part_number as i32)
                            .set_e_tag(part.e_tag().map(str::to_string))
                            .build(),
                    )
                }
            })
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;
        completed.sort_by_key(|p| p.part_number());
        Ok(completed)
    }

    pub async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        match self
            .client
            .head_object()
            .bucket(&self.target.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(ObjectMetadata {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0),
                content_type: response.content_type().map(str::to_string),
                last_modified: response
                    .last_modified()
                    .and_then(|dt| DateTime::from_timestamp(dt.secs(), 0)),
                storage_class: response.storage_class().map(|c| c.as_str().to_string()),
            })),
            Err(err) => {
                // HEAD errors carry no body, so match the variant, not a
                // parsed error code.
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(storage_err("head", &err))
                }
            }
        }
    }

    pub async fn list(&self, prefix: &str, max_keys: i32) -> Result<Vec<ObjectSummary>> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.target.bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .send()
            .await
            .map_err(|e| storage_err("list", &e))?;
        Ok(response.contents().iter().filter_map(to_summary).collect())
    }

    /// List every object under a prefix, following continuation tokens.
    pub async fn list_all(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut summaries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.target.bucket)
                .prefix(prefix)
                .max_keys(1000)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| storage_err("list", &e))?;
            summaries.extend(response.contents().iter().filter_map(to_summary));
            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(summaries)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.target.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("delete", &e))?;
        info!(key, bucket = %self.target.bucket, "deleted object");
        Ok(())
    }

    /// Stream an object to a local file. Returns the byte count.
    pub async fn download_to_file(&self, key: &str, dest: &Path) -> Result<i64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ArcaError::storage("download", format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let response = self
            .client
            .get_object()
            .bucket(&self.target.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("download", &e))?;

        let mut body = response.body;
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            ArcaError::storage("download", format!("cannot create {}: {}", dest.display(), e))
        })?;
        let mut written: i64 = 0;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| ArcaError::storage("download", format!("stream error: {}", e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| ArcaError::storage("download", e.to_string()))?;
            written += chunk.len() as i64;
        }
        file.flush()
            .await
            .map_err(|e| ArcaError::storage("download", e.to_string()))?;
        Ok(written)
    }

    /// Ask the store to thaw an archival object into the hot tier.
    pub async fn restore(&self, key: &str, days: i32) -> Result<RestoreOutcome> {
        let request = RestoreRequest::builder()
            .days(days)
            .glacier_job_parameters(
                GlacierJobParameters::builder()
                    .tier(Tier::Bulk)
                    .build()
                    .map_err(|e| ArcaError::storage("restore", e.to_string()))?,
            )
            .build();
        match self
            .client
            .restore_object()
            .bucket(&self.target.bucket)
            .key(key)
            .restore_request(request)
            .send()
            .await
        {
            Ok(_) => Ok(RestoreOutcome {
                accepted: true,
                ..Default::default()
            }),
            Err(err) => {
                let code = err.code().unwrap_or_default().to_string();
                if code == "RestoreAlreadyInProgress" {
                    return Ok(RestoreOutcome {
                        accepted: true,
                        ..Default::default()
                    });
                }
                if code == "InvalidObjectState" {
                    // Not archival (or already thawed): nothing to restore.
                    return Ok(RestoreOutcome {
                        accepted: true,
                        already_in_hot_tier: true,
                        ..Default::default()
                    });
                }
                if code == "ServiceUnavailable" || code == "SlowDown" {
                    return Ok(RestoreOutcome {
                        service_unavailable: true,
                        ..Default::default()
                    });
                }
                Err(storage_err("restore", &err))
            }
        }
    }

    /// HEAD an archival object and report its restore state. A 409 conflict
    /// means a restore request is already being processed.
    pub async fn restore_request_info(&self, key: &str) -> Result<RestoreRequestInfo> {
        match self
            .client
            .head_object()
            .bucket(&self.target.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(parse_restore_header(response.restore())),
            Err(err) => {
                // 409 on HEAD means a restore request is already being
                // processed; the status is all we get, HEADs have no body.
                let conflict = match &err {
                    aws_sdk_s3::error::SdkError::ServiceError(ctx) => {
                        ctx.raw().status().as_u16() == 409
                    }
                    _ => false,
                };
                if conflict {
                    Ok(RestoreRequestInfo {
                        request_in_progress: true,
                        ..Default::default()
                    })
                } else {
                    Err(storage_err("restore head", &err))
                }
            }
        }
    }
}

/// Parse the `x-amz-restore` header: `ongoing-request="true"` while thawing,
/// `ongoing-request="false", expiry-date="..."` once the hot copy exists.
pub fn parse_restore_header(restore: Option<&str>) -> RestoreRequestInfo {
    let mut info = RestoreRequestInfo::default();
    let Some(restore) = restore else {
        return info;
    };
    if restore.contains("ongoing-request=\"true\"") {
        info.request_in_progress = true;
    } else if restore.contains("ongoing-request=\"false\"") {
        info.request_is_complete = true;
        if let Some(start) = restore.find("expiry-date=\"") {
            let rest = &restore[start + "expiry-date=\"".len()..];
            if let Some(end) = rest.find('"') {
                info.expiry_date = DateTime::parse_from_rfc2822(&rest[..end])
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            }
        }
    }
    info
}

fn assert_required_metadata(metadata: &HashMap<String, String>) -> Result<()> {
    for required_key in REQUIRED_UPLOAD_METADATA {
        match metadata.get(required_key) {
            Some(value) if !value.is_empty() => {}
            _ => {
                return Err(ArcaError::config(
                    format!("Upload is missing required metadata key '{}'", required_key),
                    "Every preserved object carries institution, bag, bagpath, md5 and sha256",
                ))
            }
        }
    }
    Ok(())
}

async fn read_part(path: &Path, offset: i64, length: i64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        ArcaError::storage("part read", format!("cannot open {}: {}", path.display(), e))
    })?;
    file.seek(std::io::SeekFrom::Start(offset as u64))
        .await
        .map_err(|e| ArcaError::storage("part read", e.to_string()))?;
    let mut data = vec![0u8; length as usize];
    file.read_exact(&mut data)
        .await
        .map_err(|e| ArcaError::storage("part read", e.to_string()))?;
    Ok(data)
}

fn to_summary(obj: &aws_sdk_s3::types::Object) -> Option<ObjectSummary> {
    Some(ObjectSummary {
        key: obj.key()?.to_string(),
        size: obj.size().unwrap_or(0),
        etag: obj
            .e_tag()
            .map(|e| e.trim_matches('"').to_string())
            .unwrap_or_default(),
        last_modified: obj
            .last_modified()
            .and_then(|dt| DateTime::from_timestamp(dt.secs(), 0)),
    })
}

fn storage_err<E: ProvideErrorMetadata + std::fmt::Display>(operation: &str, err: &E) -> ArcaError {
    let code = err.code().unwrap_or("unknown");
    ArcaError::storage(operation, format!("{}: {}", code, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_metadata() -> HashMap<String, String> {
        REQUIRED_UPLOAD_METADATA
            .iter()
            .map(|k| (k.to_string(), format!("{}-value", k)))
            .collect()
    }

    #[test]
    fn test_required_metadata() {
        assert!(assert_required_metadata(&full_metadata()).is_ok());

        let mut missing = full_metadata();
        missing.remove("sha256");
        assert!(assert_required_metadata(&missing).is_err());

        let mut empty = full_metadata();
        empty.insert("md5".to_string(), String::new());
        assert!(assert_required_metadata(&empty).is_err());
    }

    #[test]
    fn test_parse_restore_header() {
        let info = parse_restore_header(None);
        assert!(!info.request_in_progress && !info.request_is_complete);

        let info = parse_restore_header(Some("ongoing-request=\"true\""));
        assert!(info.request_in_progress);
        assert!(!info.request_is_complete);

        let info = parse_restore_header(Some(
            "ongoing-request=\"false\", expiry-date=\"Fri, 21 Dec 2012 00:00:00 GMT\"",
        ));
        assert!(info.request_is_complete);
        let expiry = info.expiry_date.unwrap();
        assert_eq!(expiry.format("%Y-%m-%d").to_string(), "2012-12-21");
    }

    #[test]
    fn test_url_for() {
        let target = StorageTarget {
            name: "primary".to_string(),
            region: "us-east-1".to_string(),
            bucket: "arca-preservation".to_string(),
            endpoint: None,
            path_style: false,
        };
        // Build the URL without connecting.
        let url = format!(
            "https://s3.{}.amazonaws.com/{}/{}",
            target.region, target.bucket, "some-uuid"
        );
        assert_eq!(url, "https://s3.us-east-1.amazonaws.com/arca-preservation/some-uuid");
    }
}
