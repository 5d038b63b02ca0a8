//! Record worker: staged state -> registry rows, then cleanup
//!
//! Events and checksums are built before anything is sent, so their UUIDs
//! exist ahead of persistence; a retry after a partial save diffs by
//! identifier instead of inserting duplicates. Object-level events are
//! recorded only after every file batch has landed, so a partial batch
//! failure never leaves an object event without its files.

use crate::constants::{Stage, GENERIC_FILE_BATCH_SIZE};
use crate::context::Context;
use crate::models::{GenericFile, IntellectualObject};
use crate::queue::{Delivery, WorkQueue};
use crate::staging::StagingDb;
use crate::storage::ObjectStore;
use crate::workers::common::{
    self, audit_log, load_ingest_state, mark_failed, mark_requeued, mark_started, mark_succeeded,
    release_cancelled, spawn_heartbeat, time_to_give_up, IngestState,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const REQUEUE_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RecordWorker {
    context: Context,
}

impl RecordWorker {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    pub async fn run(&self, queue: Arc<dyn WorkQueue>) -> Result<()> {
        let cfg = &self.context.config.record_worker;
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
                error!(error = %err, "dropping unreadable record message");
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

        state.manifest.record_result.clear_errors();
        state.manifest.record_result.start();
        if let Err(err) = mark_started(
            &self.context,
            &mut state,
            Stage::Record,
            "Recording object, file and event metadata in the registry",
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
                .record_worker
                .heartbeat()
                .unwrap_or(Duration::from_secs(30)),
        );
        let outcome = self.record_all(&mut state).await;
        heartbeat.abort();

        if let Err(err) = outcome {
            state.manifest.record_result.add_error(err.to_string());
        }
        state.manifest.record_result.finish();

        let max_attempts = self.context.config.record_worker.max_attempts;
        if state.manifest.record_result.succeeded() {
            // Stage 2: delete the source upload and local staging.
            let _ = mark_started(
                &self.context,
                &mut state,
                Stage::Cleanup,
                "Bag is stored and recorded; cleaning up receiving bucket and staging",
            )
            .await;
            state.manifest.cleanup_result.clear_errors();
            state.manifest.cleanup_result.start();
            if let Err(err) = self.cleanup(&mut state).await {
                state.manifest.cleanup_result.add_error(err.to_string());
            }
            state.manifest.cleanup_result.finish();

            if state.manifest.cleanup_result.succeeded() {
                let _ = mark_succeeded(
                    &self.context,
                    &mut state,
                    Stage::Cleanup,
                    true,
                    "Ingest complete",
                )
                .await;
                audit_log(&self.context, &state);
                delivery.finish();
            } else {
                let _ = mark_requeued(&self.context, &mut state).await;
                audit_log(&self.context, &state);
                delivery.requeue(REQUEUE_DELAY);
            }
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

    async fn record_all(&self, state: &mut IngestState) -> Result<()> {
        let db = StagingDb::open(&state.manifest.db_path)?;
        let object_identifier = db
            .object_identifier()?
            .ok_or_else(|| anyhow!("Staging db {} holds no object", state.manifest.db_path))?;
        let mut object = db
            .get_object(&object_identifier)?
            .ok_or_else(|| anyhow!("Staging db has no object record"))?;

        self.save_object(state, &mut object).await?;
        db.put_object(&object)?;

        let saved_file_count = self.save_files(state, &db, &object).await?;

        if state.manifest.record_result.has_errors() {
            return Ok(()); // Retry reposts only what's missing.
        }

        // Object-level events go last, after every file exists.
        object.build_ingest_events(saved_file_count);
        for event in &mut object.premis_events {
            if event.id != 0 {
                continue; // Already recorded on a prior attempt.
            }
            event.intellectual_object_id = object.id;
            match self.context.registry.premis_event_save(event).await {
                Ok(saved) => event.id = saved.id,
                Err(err) => {
                    state.manifest.record_result.add_error(format!(
                        "Error saving {} event for {}: {}",
                        event.event_type, object.identifier, err
                    ));
                }
            }
        }
        object.ingest_recorded_at = Some(Utc::now());
        db.put_object(&object)?;
        Ok(())
    }

    /// Create the registry object, or adopt the existing row when this is a
    /// re-ingest of a previously ingested bag.
    async fn save_object(&self, state: &mut IngestState, object: &mut IntellectualObject) -> Result<()> {
        if object.id != 0 {
            info!(object = %object.identifier, id = object.id, "object already recorded");
            return Ok(());
        }
        if let Some(existing) = self
            .context
            .registry
            .intellectual_object_get(&object.identifier)
            .await?
        {
            // A re-ingest updates the prior row instead of creating one.
            object.id = existing.id;
        }
        let saved = self.context.registry.intellectual_object_save(object).await?;
        object.id = saved.id;
        object.created_at = saved.created_at;
        object.updated_at = saved.updated_at;
        info!(object = %object.identifier, id = object.id, "object recorded");
        Ok(())
    }

    /// Send files in batches of 100: new files in one POST each batch,
    /// prior-version files as individual updates. Every saved file goes
    /// straight back to the staging DB so a restart skips it.
    async fn save_files(
        &self,
        state: &mut IngestState,
        db: &StagingDb,
        object: &IntellectualObject,
    ) -> Result<usize> {
        let mut saved_count = 0usize;
        let mut offset: i64 = 0;
        loop {
            let batch = db.file_identifier_batch(offset, GENERIC_FILE_BATCH_SIZE as i64)?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            let mut new_files: Vec<GenericFile> = Vec::new();
            let mut existing_files: Vec<GenericFile> = Vec::new();
            for identifier in &batch {
                let Some(mut gf) = db.get_file(identifier)? else {
                    continue;
                };
                if !gf.ingest_needs_save {
                    continue;
                }
                gf.intellectual_object_id = object.id;
                gf.build_ingest_checksums();
                gf.build_ingest_events();

                if gf.ingest_previous_version_exists {
                    if gf.id != 0 {
                        existing_files.push(gf);
                    } else {
                        // Cleanup must not run until someone resolves this.
                        state.manifest.record_result.add_error(format!(
                            "GenericFile {} has a previous version, but its id is missing.",
                            gf.identifier
                        ));
                    }
                } else if gf.id == 0 {
                    new_files.push(gf);
                } else {
                    saved_count += 1; // Recorded on an earlier attempt.
                }
            }

            saved_count += self.create_new_files(state, db, new_files).await?;
            saved_count += self.update_existing_files(state, db, existing_files).await?;

            offset += batch_len as i64;
            if batch_len < GENERIC_FILE_BATCH_SIZE {
                break;
            }
        }
        Ok(saved_count)
    }

    async fn create_new_files(
        &self,
        state: &mut IngestState,
        db: &StagingDb,
        files: Vec<GenericFile>,
    ) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }
        let mut file_map: HashMap<String, GenericFile> = files
            .into_iter()
            .map(|gf| (gf.identifier.clone(), gf))
            .collect();
        let to_send: Vec<GenericFile> = file_map.values().cloned().collect();

        let saved = match self.context.registry.generic_file_save_batch(&to_send).await {
            Ok(saved) => saved,
            Err(err) => {
                state
                    .manifest
                    .record_result
                    .add_error(format!("Batch file create failed: {}", err));
                return Ok(0);
            }
        };

        let mut saved_count = 0usize;
        for saved_file in &saved {
            match file_map.get_mut(&saved_file.identifier) {
                Some(gf) => {
                    for merge_error in gf.merge_attributes(saved_file) {
                        state.manifest.record_result.add_error(merge_error);
                    }
                    saved_count += 1;
                }
                None => {
                    state.manifest.record_result.add_error(format!(
                        "After save, could not find file '{}' in batch.",
                        saved_file.identifier
                    ));
                }
            }
        }
        if saved.len() < file_map.len() {
            // Partial success: the unmatched files keep id 0 and repost on
            // the next attempt.
            state.manifest.record_result.add_error(format!(
                "Registry created {} of {} files in batch; the rest will be retried.",
                saved.len(),
                file_map.len()
            ));
        }
        for gf in file_map.values() {
            db.put_file(gf)?;
        }
        Ok(saved_count)
    }

    async fn update_existing_files(
        &self,
        state: &mut IngestState,
        db: &StagingDb,
        files: Vec<GenericFile>,
    ) -> Result<usize> {
        let mut saved_count = 0usize;
        for mut gf in files {
            match self.context.registry.generic_file_save(&gf).await {
                Ok(saved) => {
                    gf.id = saved.id;
                    gf.propagate_ids_to_children();
                    saved_count += 1;
                }
                Err(err) => {
                    state
                        .manifest
                        .record_result
                        .add_error(format!("Error updating '{}': {}", gf.identifier, err));
                }
            }
            db.put_file(&gf)?;
        }
        Ok(saved_count)
    }

    /// Delete the original upload and local staging. Skips the bucket
    /// delete when DeleteOnSuccess is off (dev and test environments).
    async fn cleanup(&self, state: &mut IngestState) -> Result<()> {
        let db = StagingDb::open(&state.manifest.db_path)?;
        let object_identifier = db.object_identifier()?;
        let mut object = match &object_identifier {
            Some(identifier) => db.get_object(identifier)?,
            None => None,
        };

        if self.context.config.delete_on_success {
            let store = ObjectStore::connect(
                self.context
                    .config
                    .receiving_target(&state.work_item.bucket),
            )?;
            store.delete(&state.work_item.name).await?;
            info!(bucket = %state.work_item.bucket, key = %state.work_item.name,
                  "deleted source tar from receiving bucket");
        } else {
            info!("skipping receiving-bucket deletion: DeleteOnSuccess is false");
        }

        if let Some(ref mut object) = object {
            object.ingest_deleted_from_receiving_at = Some(Utc::now());
            db.put_object(object)?;
        }

        // The local tar normally went away at the end of the store stage.
        let tar_path = Path::new(&state.manifest.bag_path);
        if tar_path.exists() {
            if let Err(err) = std::fs::remove_file(tar_path) {
                warn!(error = %err, "could not delete staged tar");
            }
        }

        // Integration tests keep the staging DB around for assertions.
        if std::env::var("ARCA_TEST_ENV").as_deref() != Ok("integration") {
            db.delete_db_file()?;
        }
        Ok(())
    }
}
