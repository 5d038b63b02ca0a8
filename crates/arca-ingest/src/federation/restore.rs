//! Cold-tier restore initiator
//!
//! Bags in archival storage are invisible to fixity checks and restores
//! until the store thaws them into the hot tier. This worker issues the
//! retrieval request using the cheap bulk tier (nothing downstream is
//! waiting interactively), keeps the thawed copy around for sixty days so
//! repeated attempts don't pay for retrieval twice, and polls every few
//! hours until the object is available.

use crate::constants::{
    Stage, Status, DAYS_TO_KEEP_IN_HOT_TIER, HOURS_BETWEEN_RESTORE_CHECKS,
};
use crate::context::Context;
use crate::queue::{Delivery, WorkQueue};
use crate::storage::ObjectStore;
use crate::workers::common::{self, load_ingest_state, IngestState};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Where a restore stands. AvailableInHotTier hands off to the download
/// worker; Downloaded is recorded by that sibling, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RestorePhase {
    #[default]
    NotYetRequested,
    Requested,
    AvailableInHotTier,
    Downloaded,
}

/// Serialized into the work item's state field after every check.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RestoreState {
    pub phase: RestorePhase,
    pub bucket: String,
    pub key: String,
    pub request_accepted: bool,
    pub requested_at: Option<DateTime<Utc>>,
    pub estimated_deletion_from_hot_tier: Option<DateTime<Utc>>,
    pub error_message: String,
}

impl RestoreState {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Clone)]
pub struct RestoreInitiator {
    context: Context,
    store: ObjectStore,
}

impl RestoreInitiator {
    pub fn new(context: Context) -> Result<Self> {
        let store = ObjectStore::connect(context.config.archival_target())?;
        Ok(Self { context, store })
    }

    pub async fn run(&self, queue: Arc<dyn WorkQueue>) -> Result<()> {
        let cfg = &self.context.config.federation.restore_worker;
        let mut rx = queue.subscribe(&cfg.queue_topic, &cfg.queue_channel).await?;
        while let Some(delivery) = rx.recv().await {
            self.process(delivery).await;
        }
        Ok(())
    }

    pub async fn process(&self, delivery: Delivery) {
        let work_item_id = match common::work_item_id_from_body(&delivery.body) {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "dropping unreadable restore message");
                delivery.finish();
                return;
            }
        };
        let mut state = match load_ingest_state(&self.context, work_item_id).await {
            Ok(state) => state,
            Err(err) => {
                error!(work_item_id, error = %err, "cannot load restore work item");
                delivery.requeue(TRANSIENT_RETRY_DELAY);
                return;
            }
        };
        if state.work_item.is_cancelled() {
            info!(work_item_id, "restore work item is cancelled");
            delivery.finish();
            return;
        }

        // The state blob may hold a prior check's restore state rather than
        // an ingest manifest.
        let mut restore_state = state
            .work_item
            .state
            .as_deref()
            .and_then(|json| RestoreState::from_json(json).ok())
            .unwrap_or_default();
        restore_state.bucket = self.store.target().bucket.clone();
        if restore_state.key.is_empty() {
            restore_state.key = state.work_item.object_identifier.clone();
        }
        if restore_state.key.is_empty() {
            restore_state.error_message =
                format!("Work item {} names no archival key to restore", work_item_id);
            let _ = self
                .finish_with_error(&mut state, &restore_state, true)
                .await;
            delivery.finish();
            return;
        }

        state.work_item.status = Status::Started;
        state.work_item.set_node_and_pid();
        let _ = self.context.registry.work_item_save(&state.work_item).await;

        match self.check_and_request(&mut restore_state).await {
            Ok(RestoreStep::Available) => {
                // Hand-off to the sibling download worker: its registry
                // poll collects restore items from (Fetch, Pending).
                restore_state.phase = RestorePhase::AvailableInHotTier;
                state.work_item.note = "Object is available in the hot tier for download".to_string();
                state.work_item.stage = Stage::Fetch;
                state.work_item.status = Status::Pending;
                state.work_item.retry = true;
                state.work_item.clear_node_and_pid();
                state.work_item.state = restore_state.to_json().ok();
                let _ = self.context.registry.work_item_save(&state.work_item).await;
                delivery.finish();
            }
            Ok(RestoreStep::Waiting) => {
                restore_state.phase = RestorePhase::Requested;
                state.work_item.note = format!(
                    "Restore initiated; will check availability every {} hours",
                    HOURS_BETWEEN_RESTORE_CHECKS
                );
                state.work_item.status = Status::Pending;
                state.work_item.retry = true;
                state.work_item.clear_node_and_pid();
                state.work_item.state = restore_state.to_json().ok();
                let _ = self.context.registry.work_item_save(&state.work_item).await;
                info!(work_item_id, key = %restore_state.key, "restore pending, will re-check");
                delivery.requeue(Duration::from_secs(
                    HOURS_BETWEEN_RESTORE_CHECKS as u64 * 3600,
                ));
            }
            Ok(RestoreStep::ServiceUnavailable) => {
                restore_state.error_message =
                    "Archival retrieval service is temporarily unavailable".to_string();
                let max_attempts = self.context.config.federation.restore_worker.max_attempts;
                let fatal = delivery.attempts >= max_attempts;
                let _ = self
                    .finish_with_error(&mut state, &restore_state, fatal)
                    .await;
                if fatal {
                    delivery.finish();
                } else {
                    warn!(work_item_id, "retrieval service unavailable, will retry");
                    delivery.requeue(TRANSIENT_RETRY_DELAY);
                }
            }
            Err(err) => {
                restore_state.error_message =
                    format!("Error checking restore state for {}: {}", restore_state.key, err);
                let max_attempts = self.context.config.federation.restore_worker.max_attempts;
                let fatal = delivery.attempts >= max_attempts;
                let _ = self
                    .finish_with_error(&mut state, &restore_state, fatal)
                    .await;
                if fatal {
                    delivery.finish();
                } else {
                    delivery.requeue(TRANSIENT_RETRY_DELAY);
                }
            }
        }
    }

    /// HEAD first: a conflict or an in-progress restore means the request
    /// already exists; a completed restore means we're done; otherwise
    /// issue the retrieval request.
    async fn check_and_request(&self, restore_state: &mut RestoreState) -> Result<RestoreStep> {
        let info = self.store.restore_request_info(&restore_state.key).await?;

        if info.request_in_progress {
            info!(key = %restore_state.key, "restore already in progress");
            restore_state.request_accepted = true;
            if restore_state.requested_at.is_none() {
                restore_state.requested_at = Some(Utc::now());
            }
            return Ok(RestoreStep::Waiting);
        }
        if info.request_is_complete {
            restore_state.request_accepted = true;
            restore_state.estimated_deletion_from_hot_tier = info.expiry_date;
            info!(key = %restore_state.key, expiry = ?info.expiry_date,
                  "object is already in the hot tier");
            return Ok(RestoreStep::Available);
        }

        info!(key = %restore_state.key, days = DAYS_TO_KEEP_IN_HOT_TIER,
              "issuing bulk retrieval request");
        let outcome = self
            .store
            .restore(&restore_state.key, DAYS_TO_KEEP_IN_HOT_TIER)
            .await?;
        if outcome.service_unavailable {
            return Ok(RestoreStep::ServiceUnavailable);
        }
        restore_state.request_accepted = outcome.accepted;
        restore_state.requested_at = Some(Utc::now());
        restore_state.estimated_deletion_from_hot_tier =
            Some(Utc::now() + ChronoDuration::days(DAYS_TO_KEEP_IN_HOT_TIER as i64));
        if outcome.already_in_hot_tier {
            return Ok(RestoreStep::Available);
        }
        Ok(RestoreStep::Waiting)
    }

    async fn finish_with_error(
        &self,
        state: &mut IngestState,
        restore_state: &RestoreState,
        fatal: bool,
    ) -> Result<()> {
        error!(work_item_id = state.work_item.id, error = %restore_state.error_message,
               fatal, "restore check failed");
        state.work_item.note = restore_state.error_message.clone();
        state.work_item.state = restore_state.to_json().ok();
        state.work_item.clear_node_and_pid();
        if fatal {
            state.work_item.status = Status::Failed;
            state.work_item.retry = false;
            state.work_item.needs_admin_review = true;
        } else {
            state.work_item.status = Status::Pending;
        }
        self.context.registry.work_item_save(&state.work_item).await?;
        Ok(())
    }
}

enum RestoreStep {
    Available,
    Waiting,
    ServiceUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_state_round_trip() {
        let state = RestoreState {
            phase: RestorePhase::Requested,
            bucket: "arca-archival".to_string(),
            key: "bag-uuid".to_string(),
            request_accepted: true,
            requested_at: Some(Utc::now()),
            estimated_deletion_from_hot_tier: Some(Utc::now() + ChronoDuration::days(60)),
            error_message: String::new(),
        };
        let json = state.to_json().unwrap();
        let back = RestoreState::from_json(&json).unwrap();
        assert_eq!(back.phase, RestorePhase::Requested);
        assert_eq!(back.key, "bag-uuid");
        assert!(back.request_accepted);
    }

    #[test]
    fn test_default_phase() {
        assert_eq!(RestoreState::default().phase, RestorePhase::NotYetRequested);
    }
}
