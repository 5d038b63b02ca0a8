//! Store worker: staged files -> primary + replica buckets
//!
//! Files upload in batches sized to the worker's network connections,
//! concurrently within a batch and sequentially across batches so staging
//! DB writes never contend. Re-ingests reuse the prior version's storage
//! UUID so the registry's URLs stay stable and nothing is orphaned.

use crate::bag::with_tar_entry;
use crate::constants::{
    has_savable_name, Stage, ALG_SHA256, LARGE_FILE_THRESHOLD, MAX_UPLOAD_ATTEMPTS,
};
use crate::context::Context;
use crate::models::{uuid_from_storage_url, GenericFile, WorkSummary};
use crate::queue::{Delivery, WorkQueue};
use crate::staging::StagingDb;
use crate::storage::{ObjectStore, UploadSource};
use crate::workers::common::{
    self, audit_log, load_ingest_state, mark_failed, mark_requeued, mark_started, mark_succeeded,
    release_cancelled, spawn_heartbeat, time_to_give_up, IngestState,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const REQUEUE_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct StoreWorker {
    context: Context,
    primary: ObjectStore,
    replica: ObjectStore,
}

impl StoreWorker {
    pub fn new(context: Context) -> Result<Self> {
        let primary = ObjectStore::connect(context.config.primary_target())?;
        let replica = ObjectStore::connect(context.config.replica_target())?;
        Ok(Self {
            context,
            primary,
            replica,
        })
    }

    pub async fn run(&self, queue: Arc<dyn WorkQueue>) -> Result<()> {
        let cfg = &self.context.config.store_worker;
        let mut rx = queue.subscribe(&cfg.queue_topic, &cfg.queue_channel).await?;
        let semaphore = Arc::new(tokio::sync::Semaphore::new(cfg.workers.max(1)));
        while let Some(delivery) = rx.recv().await {
            let permit = semaphore.clone().acquire_owned().await;
            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                worker.process(delivery).await;
            });
        }
        Ok(())
    }

    pub async fn process(&self, delivery: Delivery) {
        let work_item_id = match common::work_item_id_from_body(&delivery.body) {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "dropping unreadable store message");
                delivery.finish();
                return;
            }
        };
        let mut state = match load_ingest_state(&self.context, work_item_id).await {
            Ok(state) => state,
            Err(err) => {
                error!(work_item_id, error = %err, "cannot load work item, will retry");
                delivery.requeue(REQUEUE_DELAY);
                return;
            }
        };
        if state.work_item.belongs_to_another_worker() || state.work_item.is_in_progress() {
            info!(work_item_id, "skipping: item is being processed elsewhere");
            delivery.finish();
            return;
        }

        state.manifest.store_result.clear_errors();
        state.manifest.store_result.start();
        if let Err(err) = mark_started(
            &self.context,
            &mut state,
            Stage::Store,
            "Files are being copied to long-term storage",
        )
        .await
        {
            error!(work_item_id, error = %err, "cannot claim work item");
            delivery.requeue(REQUEUE_DELAY);
            return;
        }
        if common::cancelled_after_claim(&self.context, work_item_id).await {
            let _ = release_cancelled(&self.context, &mut state).await;
            delivery.finish();
            return;
        }

        let heartbeat = spawn_heartbeat(
            delivery.touch_handle(),
            self.context
                .config
                .store_worker
                .heartbeat()
                .unwrap_or(Duration::from_secs(30)),
        );
        let outcome = self.store_all_files(&mut state, &delivery).await;
        heartbeat.abort();

        state.manifest.store_result.finish();
        if let Err(err) = outcome {
            state.manifest.store_result.add_error(err.to_string());
        }

        let max_attempts = self.context.config.store_worker.max_attempts;
        if state.manifest.store_result.succeeded() {
            // The record worker's registry poll picks the item up from
            // (Record, Pending).
            let note = "All files copied to primary and replica storage";
            if let Err(err) =
                mark_succeeded(&self.context, &mut state, Stage::Record, false, note).await
            {
                error!(work_item_id, error = %err, "cannot record store success");
                delivery.requeue(REQUEUE_DELAY);
                return;
            }
            audit_log(&self.context, &state);
            delivery.finish();
        } else if time_to_give_up(&state, delivery.attempts, max_attempts) {
            let _ = mark_failed(&self.context, &mut state).await;
            audit_log(&self.context, &state);
            delivery.finish();
        } else {
            let _ = mark_requeued(&self.context, &mut state).await;
            audit_log(&self.context, &state);
            delivery.requeue(REQUEUE_DELAY);
        }
    }

    /// Walk the staging DB in batches, saving each batch's files
    /// concurrently.
    async fn store_all_files(&self, state: &mut IngestState, delivery: &Delivery) -> Result<()> {
        let db = Arc::new(StagingDb::open(&state.manifest.db_path)?);
        let object_identifier = db
            .object_identifier()?
            .ok_or_else(|| anyhow!("Staging db {} holds no object", state.manifest.db_path))?;
        let mut object = db
            .get_object(&object_identifier)?
            .ok_or_else(|| anyhow!("Staging db has no object record"))?;

        let batch_size = self
            .context
            .config
            .store_worker
            .network_connections
            .max(1) as i64;
        let mut start: i64 = 0;
        loop {
            let identifiers = db.file_identifier_batch(start, batch_size)?;
            if identifiers.is_empty() {
                break;
            }
            let has_more = identifiers.len() as i64 == batch_size;
            info!(object = %object_identifier, batch_start = start,
                  batch_len = identifiers.len(), "saving batch of files");

            let mut tasks = Vec::new();
            for identifier in &identifiers {
                let Some(gf) = db.get_file(identifier)? else {
                    state
                        .manifest
                        .store_result
                        .add_error(format!("Staging db lost file {}", identifier));
                    continue;
                };
                let worker = self.clone();
                let db = Arc::clone(&db);
                let tar_path = state.manifest.bag_path.clone();
                tasks.push(tokio::spawn(async move {
                    worker.save_file(db, tar_path, gf).await
                }));
            }
            for task in tasks {
                let summary = task
                    .await
                    .unwrap_or_else(|err| {
                        let mut s = WorkSummary::new();
                        s.add_error(format!("store task panicked: {}", err));
                        s
                    });
                for error in &summary.errors {
                    state.manifest.store_result.add_error(error.clone());
                }
                if summary.error_is_fatal {
                    state.manifest.store_result.error_is_fatal = true;
                    state.manifest.store_result.retry = false;
                }
            }

            // Large batches take a while; keep the broker informed.
            delivery.touch();

            if state.manifest.store_result.error_is_fatal {
                break;
            }
            start += identifiers.len() as i64;
            if !has_more {
                break;
            }
        }

        // Refresh our view of the files before deciding on cleanup.
        let mut all_saved = true;
        for identifier in db.file_identifiers()? {
            if let Some(gf) = db.get_file(&identifier)? {
                all_saved = all_saved
                    && (!gf.ingest_needs_save
                        || (gf.ingest_stored_at.is_some() && gf.ingest_replicated_at.is_some()));
            }
        }

        if !state.manifest.store_result.has_errors() && all_saved {
            object.ingest_stored_at = Some(Utc::now());
            // The local tar is no longer needed; the staging DB still is,
            // because the record worker reads from it.
            let tar_path = Path::new(&state.manifest.bag_path);
            if tar_path.exists() {
                info!(object = %object_identifier, tar = %tar_path.display(),
                      "deleting staged tar: all files stored");
                if let Err(err) = std::fs::remove_file(tar_path) {
                    warn!(error = %err, "could not delete staged tar");
                }
            }
        }
        db.put_object(&object)?;
        Ok(())
    }

    /// Save one file to both storage targets, honoring prior versions.
    /// Errors land in the returned summary; fatal ones stop the whole item.
    async fn save_file(
        &self,
        db: Arc<StagingDb>,
        tar_path: String,
        mut gf: GenericFile,
    ) -> WorkSummary {
        let mut summary = WorkSummary::new();

        if !has_savable_name(gf.original_path()) {
            gf.ingest_needs_save = false;
        } else if gf.ingest_needs_save {
            self.check_previous_version(&mut gf, &mut summary).await;
        }

        if gf.ingest_needs_save && !summary.has_errors() {
            info!(file = %gf.identifier, "file needs save");
            if gf.ingest_stored_at.is_none() || gf.ingest_storage_url.is_empty() {
                self.copy_to_storage(&self.primary, &tar_path, &mut gf, &mut summary)
                    .await;
            }
            if !summary.has_errors()
                && (gf.ingest_replicated_at.is_none() || gf.ingest_replication_url.is_empty())
            {
                self.copy_to_storage(&self.replica, &tar_path, &mut gf, &mut summary)
                    .await;
            }
            self.cleanup_temp_file(&gf);
        } else if !gf.ingest_needs_save {
            info!(file = %gf.identifier, "skipping: no save needed");
        }

        if let Err(err) = db.put_file(&gf) {
            summary.add_error(format!("Error saving {} to staging db: {}", gf.identifier, err));
        }
        summary
    }

    /// Ask the registry whether a prior version of this file exists. Same
    /// sha256 means no save; a changed sha256 means we must overwrite the
    /// prior storage UUID, and failing to learn that UUID is fatal because
    /// writing to a fresh key would orphan the old object and break the
    /// registry's URL.
    async fn check_previous_version(&self, gf: &mut GenericFile, summary: &mut WorkSummary) {
        let existing = match self
            .context
            .registry
            .checksum_list(&gf.identifier, ALG_SHA256)
            .await
        {
            Ok(checksums) => checksums.into_iter().next(),
            Err(err) => {
                summary.add_error(format!(
                    "Cannot check prior checksums for {}: {}",
                    gf.identifier, err
                ));
                return;
            }
        };
        let Some(existing) = existing else {
            return; // Never ingested before.
        };

        gf.ingest_previous_version_exists = true;
        gf.id = existing.generic_file_id;

        let prior_file = match self.context.registry.generic_file_get(&gf.identifier).await {
            Ok(Some(prior)) => prior,
            Ok(None) => {
                summary.add_fatal_error(format!(
                    "Registry has a checksum for {} but no file record",
                    gf.identifier
                ));
                return;
            }
            Err(err) => {
                summary.add_error(format!(
                    "Cannot fetch prior version of {}: {}",
                    gf.identifier, err
                ));
                return;
            }
        };
        match uuid_from_storage_url(&prior_file.uri) {
            Some(prior_uuid) => {
                info!(file = %gf.identifier, uuid = %prior_uuid,
                      "reusing prior storage UUID so the stored version is overwritten");
                gf.ingest_uuid = prior_uuid;
            }
            None => {
                // Writing to a fresh key would leak storage and desync the
                // registry URL; stop and let an operator look.
                summary.add_fatal_error(format!(
                    "Cannot extract storage UUID from prior URL '{}' for {}",
                    prior_file.uri, gf.identifier
                ));
                return;
            }
        }
        if existing.digest == gf.ingest_sha256 {
            info!(file = %gf.identifier, "unchanged since previous ingest, no save needed");
            gf.ingest_needs_save = false;
        }
    }

    /// Upload one file to one target, verifying the stored size, with the
    /// retry budget the object store's flakiness has earned.
    async fn copy_to_storage(
        &self,
        store: &ObjectStore,
        tar_path: &str,
        gf: &mut GenericFile,
        summary: &mut WorkSummary,
    ) {
        let metadata = match self.upload_metadata(gf) {
            Ok(metadata) => metadata,
            Err(err) => {
                summary.add_fatal_error(err.to_string());
                return;
            }
        };

        let target_name = store.target().name.clone();
        for attempt in 1..=MAX_UPLOAD_ATTEMPTS {
            match self
                .upload_once(store, tar_path, gf, &metadata)
                .await
            {
                Ok(url) => {
                    let now = Utc::now();
                    if target_name == "primary" {
                        gf.ingest_stored_at = Some(now);
                        gf.ingest_storage_url = url.clone();
                        gf.uri = url;
                    } else {
                        gf.ingest_replicated_at = Some(now);
                        gf.ingest_replication_url = url;
                    }
                    info!(file = %gf.identifier, target = %target_name, attempt,
                          "stored file");
                    return;
                }
                Err(err) => {
                    if attempt == MAX_UPLOAD_ATTEMPTS {
                        summary.add_error(format!(
                            "Upload of {} to {} failed after {} attempts: {}",
                            gf.identifier, target_name, MAX_UPLOAD_ATTEMPTS, err
                        ));
                    } else {
                        warn!(file = %gf.identifier, target = %target_name, attempt,
                              error = %err, "upload attempt failed, will retry");
                    }
                }
            }
        }
    }

    async fn upload_once(
        &self,
        store: &ObjectStore,
        tar_path: &str,
        gf: &GenericFile,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let source = self.upload_source(tar_path, gf).await?;
        let url = store
            .upload(&gf.ingest_uuid, source, &gf.file_format, metadata)
            .await?;

        // The store has been known to report odd sizes right after a put;
        // trust only a fresh listing.
        let listed = store.list(&gf.ingest_uuid, 1).await?;
        match listed.iter().find(|o| o.key == gf.ingest_uuid) {
            None => Err(anyhow!(
                "{} returned nothing for {} ({})",
                store.target().name,
                gf.ingest_uuid,
                gf.identifier
            )),
            Some(stored) if stored.size != gf.size => Err(anyhow!(
                "{} returned size {} for {} ({}), should be {}",
                store.target().name,
                stored.size,
                gf.ingest_uuid,
                gf.identifier,
                gf.size
            )),
            Some(_) => Ok(url),
        }
    }

    /// Small files stream from the tar into memory; files at or above the
    /// large-file threshold are spooled to `<TarDirectory>/tmp/<uuid>` once
    /// and uploaded from disk, so multipart parts can be re-read by offset.
    async fn upload_source(&self, tar_path: &str, gf: &GenericFile) -> Result<UploadSource> {
        let entry_path = gf
            .original_path_with_bag_name()
            .ok_or_else(|| anyhow!("Cannot derive tar entry path for {}", gf.identifier))?;
        let tar_path = PathBuf::from(tar_path);

        if gf.size < LARGE_FILE_THRESHOLD {
            let data = tokio::task::spawn_blocking(move || {
                with_tar_entry(&tar_path, &entry_path, |reader| {
                    let mut data = Vec::new();
                    reader.read_to_end(&mut data)?;
                    Ok(data)
                })
            })
            .await??;
            if data.len() as i64 != gf.size {
                return Err(anyhow!(
                    "Read {} bytes from tar for {}, expected {}",
                    data.len(),
                    gf.identifier,
                    gf.size
                ));
            }
            return Ok(UploadSource::Memory(data));
        }

        let temp_path = self.context.config.upload_temp_path(&gf.ingest_uuid);
        let expected_size = gf.size;
        let identifier = gf.identifier.clone();
        let temp_for_task = temp_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let already_good = std::fs::metadata(&temp_for_task)
                .map(|m| m.len() as i64 == expected_size)
                .unwrap_or(false);
            if already_good {
                return Ok(());
            }
            if let Some(parent) = temp_for_task.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&temp_for_task)?;
            let copied = with_tar_entry(&tar_path, &entry_path, |reader| {
                std::io::copy(reader, &mut out)
            })?;
            if copied as i64 != expected_size {
                anyhow::bail!(
                    "Copied only {} of {} bytes for {}",
                    copied,
                    expected_size,
                    identifier
                );
            }
            out.sync_all()?;
            Ok(())
        })
        .await??;
        Ok(UploadSource::File(temp_path))
    }

    /// Delete the upload temp only after both copies exist.
    fn cleanup_temp_file(&self, gf: &GenericFile) {
        let temp_path = self.context.config.upload_temp_path(&gf.ingest_uuid);
        if !temp_path.exists() {
            return; // Most files never get spooled to disk.
        }
        if gf.ingest_stored_at.is_some() && gf.ingest_replicated_at.is_some() {
            info!(file = %gf.identifier, temp = %temp_path.display(),
                  "deleting upload temp: file is stored and replicated");
            if let Err(err) = std::fs::remove_file(&temp_path) {
                warn!(error = %err, "could not delete upload temp");
            }
        }
    }

    /// The five metadata keys every stored object carries. A gap here is a
    /// configuration bug, not a retryable error.
    pub(crate) fn upload_metadata(&self, gf: &GenericFile) -> Result<HashMap<String, String>> {
        let institution = gf
            .institution_identifier()
            .ok_or_else(|| anyhow!("File {} has no institution segment", gf.identifier))?;
        let metadata: HashMap<String, String> = [
            ("institution", institution),
            ("bag", gf.intellectual_object_identifier.as_str()),
            ("bagpath", gf.original_path()),
            ("md5", gf.ingest_md5.as_str()),
            ("sha256", gf.ingest_sha256.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (key, value) in &metadata {
            if value.is_empty() {
                return Err(anyhow!(
                    "Upload metadata key '{}' is empty for {}",
                    key,
                    gf.identifier
                ));
            }
        }
        Ok(metadata)
    }
}
