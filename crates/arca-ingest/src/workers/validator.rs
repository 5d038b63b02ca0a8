//! Validate worker: tar -> checked object in the staging DB

use crate::bag::{BagValidationConfig, BagValidator};
use crate::constants::Stage;
use crate::context::Context;
use crate::queue::{Delivery, WorkQueue};
use crate::staging::StagingDb;
use crate::workers::common::{
    self, audit_log, bag_name_from_key, load_ingest_state, mark_failed, mark_requeued,
    mark_started, mark_succeeded, release_cancelled, spawn_heartbeat, time_to_give_up, IngestState,
};
use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Runs the bag validator over a downloaded tar and persists the parsed
/// object and files into the bag's staging database.
#[derive(Clone)]
pub struct ValidateWorker {
    context: Context,
    validation_config: BagValidationConfig,
}

impl ValidateWorker {
    pub fn new(context: Context) -> Result<Self> {
        let validation_config =
            BagValidationConfig::load(&context.config.bag_validation_config_file)
                .context("Cannot load bag validation config")?;
        Ok(Self {
            context,
            validation_config,
        })
    }

    pub async fn run(&self, queue: Arc<dyn WorkQueue>) -> Result<()> {
        let cfg = &self.context.config.validate_worker;
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
                error!(error = %err, "dropping unreadable validate message");
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

        state.manifest.untar_result.clear_errors();
        state.manifest.validate_result.clear_errors();
        state.manifest.untar_result.start();
        state.manifest.validate_result.start();
        if let Err(err) = mark_started(
            &self.context,
            &mut state,
            Stage::Validate,
            "Unpacking and validating bag",
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
                .validate_worker
                .heartbeat()
                .unwrap_or(Duration::from_secs(30)),
        );
        let outcome = self.validate_bag(&mut state).await;
        heartbeat.abort();

        state.manifest.untar_result.finish();
        state.manifest.validate_result.finish();
        if let Err(err) = outcome {
            state.manifest.validate_result.add_error(err.to_string());
        }

        let max_attempts = self.context.config.validate_worker.max_attempts;
        if !state.manifest.untar_result.has_errors()
            && !state.manifest.validate_result.has_errors()
        {
            // The store worker's registry poll picks the item up from
            // (Store, Pending).
            let note = "Bag is valid; awaiting storage";
            if let Err(err) =
                mark_succeeded(&self.context, &mut state, Stage::Store, false, note).await
            {
                error!(work_item_id, error = %err, "cannot record validate success");
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

    /// Validate on a blocking thread (tar streaming and hashing are CPU and
    /// disk bound), then persist the result to the staging DB.
    async fn validate_bag(&self, state: &mut IngestState) -> Result<()> {
        let work_item_id = state.work_item.id;
        let key = state.work_item.name.clone();
        let institution = state.work_item.institution.clone();
        let bag_name = bag_name_from_key(&key, &institution)
            .ok_or_else(|| anyhow::anyhow!("Key '{}' does not parse as a tar upload", key))?;
        let tar_path = self.context.config.tar_path(&bag_name);
        let validation_config = self.validation_config.clone();

        let result = tokio::task::spawn_blocking(move || {
            let validator = BagValidator::new(tar_path, institution, validation_config)?;
            Ok::<_, anyhow::Error>(validator.validate())
        })
        .await
        .context("validator task panicked")??;

        // Carry the two summaries into the manifest verbatim.
        state.manifest.untar_result = result.parse_summary.clone();
        state.manifest.validate_result = result.validation_summary.clone();

        let mut object = result.object;
        object.ingest_downloaded_at = state
            .manifest
            .fetch_result
            .finished_at
            .or(Some(Utc::now()));

        if result.parse_summary.has_errors() || result.validation_summary.has_errors() {
            // Invalid bag: the error text travels on the work item; there
            // is nothing to stage.
            info!(work_item_id, bag = %bag_name, "bag is not valid");
            return Ok(());
        }

        object.ingest_validated_at = Some(Utc::now());
        let db_path = self.context.config.staging_db_path(&bag_name);
        object.ingest_staging_db_path = db_path.to_string_lossy().to_string();

        let db = StagingDb::open(&db_path)?;
        for gf in object.generic_files.drain(..).collect::<Vec<_>>() {
            db.put_file(&gf)?;
        }
        db.put_object(&object)?;

        state.manifest.object_identifier = object.identifier.clone();
        state.manifest.untarred_path = object.ingest_untarred_path.clone();
        state.manifest.db_path = db_path.to_string_lossy().to_string();
        state.work_item.object_identifier = object.identifier.clone();

        info!(work_item_id, object = %object.identifier,
              files = db.file_count()?, "bag validated and staged");
        Ok(())
    }
}
