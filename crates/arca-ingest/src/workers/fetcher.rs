//! Fetch worker: receiving bucket -> local staging

use crate::constants::Stage;
use crate::context::Context;
use crate::queue::{Delivery, WorkQueue};
use crate::storage::ObjectStore;
use crate::workers::common::{
    self, audit_log, bag_name_from_key, load_ingest_state, mark_failed, mark_requeued,
    mark_started, mark_succeeded, release_cancelled, spawn_heartbeat, time_to_give_up,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Downloads the uploaded tar into `<TarDirectory>/<bag>.tar` and hands the
/// item to the validator.
#[derive(Clone)]
pub struct FetchWorker {
    context: Context,
}

impl FetchWorker {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    /// Consume the fetch topic until the queue closes.
    pub async fn run(&self, queue: Arc<dyn WorkQueue>) -> Result<()> {
        let cfg = &self.context.config.fetch_worker;
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
                error!(error = %err, "dropping unreadable fetch message");
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
            info!(work_item_id, node = %state.work_item.node, pid = state.work_item.pid,
                  "skipping: item is being processed elsewhere");
            delivery.finish();
            return;
        }

        state.manifest.fetch_result.clear_errors();
        state.manifest.fetch_result.start();
        if let Err(err) = mark_started(
            &self.context,
            &mut state,
            Stage::Fetch,
            "Downloading tar file from receiving bucket",
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
                .fetch_worker
                .heartbeat()
                .unwrap_or(Duration::from_secs(30)),
        );
        let fetch_outcome = self.fetch_tar(&mut state).await;
        heartbeat.abort();

        state.manifest.fetch_result.finish();
        if let Err(err) = fetch_outcome {
            state.manifest.fetch_result.add_error(err.to_string());
        }

        let max_attempts = self.context.config.fetch_worker.max_attempts;
        if state.manifest.fetch_result.succeeded() {
            // The validate worker's registry poll picks the item up from
            // (Validate, Pending); nothing else crosses the process gap.
            let note = "Tar file downloaded; awaiting validation";
            if let Err(err) =
                mark_succeeded(&self.context, &mut state, Stage::Validate, false, note).await
            {
                error!(work_item_id, error = %err, "cannot record fetch success");
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

    /// Stream the tar to local disk and confirm the byte count.
    async fn fetch_tar(&self, state: &mut common::IngestState) -> Result<()> {
        let item = &state.work_item;
        let bag_name = bag_name_from_key(&item.name, &item.institution).ok_or_else(|| {
            anyhow::anyhow!(
                "Key '{}' does not parse as a tar upload for {}",
                item.name,
                item.institution
            )
        })?;
        let tar_path = self.context.config.tar_path(&bag_name);

        let store = ObjectStore::connect(self.context.config.receiving_target(&item.bucket))?;
        let written = store.download_to_file(&item.name, &tar_path).await?;
        if written != item.size {
            // A short read means the object changed or the stream broke;
            // either way the next attempt starts over.
            let _ = std::fs::remove_file(&tar_path);
            anyhow::bail!(
                "Downloaded {} bytes for {}, expected {}",
                written,
                item.name,
                item.size
            );
        }

        info!(work_item_id = item.id, bag = %bag_name, bytes = written, "tar downloaded");
        state.manifest.bag_path = tar_path.to_string_lossy().to_string();
        Ok(())
    }
}
