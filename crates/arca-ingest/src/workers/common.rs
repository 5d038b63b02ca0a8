//! Shared plumbing for pipeline workers
//!
//! Claiming, releasing, state persistence and the audit log work the same
//! way in every stage, so they live here.

use crate::constants::{Action, Stage, Status, MULTIPART_SUFFIX};
use crate::context::Context;
use crate::models::{IngestManifest, WorkItem};
use crate::queue::{TouchHandle, WorkQueue};
use crate::registry::WorkItemQuery;
use anyhow::{anyhow, Context as AnyhowContext, Result};
use chrono::Utc;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// One work item plus its resumable manifest state.
#[derive(Debug, Clone)]
pub struct IngestState {
    pub work_item: WorkItem,
    pub manifest: IngestManifest,
}

impl IngestState {
    /// Serialize the manifest into the work item's state blob.
    pub fn sync_state(&mut self) -> Result<()> {
        self.work_item.state = Some(self.manifest.to_state_json()?);
        Ok(())
    }
}

/// Derive the local bag name from a receiving-bucket key: strip the
/// institution prefix, ".tar", and any multipart suffix.
/// "inst.edu.photos.b01.of04.tar" -> "photos".
pub fn bag_name_from_key(key: &str, institution: &str) -> Option<String> {
    let rest = key.strip_prefix(institution)?.strip_prefix('.')?;
    let stem = rest.strip_suffix(".tar")?;
    let stem = MULTIPART_SUFFIX.replace(stem, "");
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Fetch a work item and rebuild its manifest from the state blob, or start
/// a fresh manifest when there is none yet.
pub async fn load_ingest_state(context: &Context, work_item_id: i64) -> Result<IngestState> {
    let work_item = context
        .registry
        .work_item_get(work_item_id)
        .await?
        .ok_or_else(|| anyhow!("Registry has no work item {}", work_item_id))?;

    let manifest = match work_item.state.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(state) => IngestManifest::from_state_json(state).unwrap_or_else(|err| {
            warn!(work_item_id, error = %err, "unreadable state blob, starting fresh manifest");
            IngestManifest::new(work_item_id, &work_item.bucket, &work_item.name, &work_item.etag)
        }),
        None => {
            IngestManifest::new(work_item_id, &work_item.bucket, &work_item.name, &work_item.etag)
        }
    };
    Ok(IngestState { work_item, manifest })
}

/// Claim a work item for this stage: node + pid + Started. Refuses nothing;
/// call `belongs_to_another_worker` before this.
pub async fn mark_started(
    context: &Context,
    state: &mut IngestState,
    stage: Stage,
    note: &str,
) -> Result<()> {
    state.work_item.stage = stage;
    state.work_item.status = Status::Started;
    state.work_item.note = note.to_string();
    state.work_item.stage_started_at = Some(Utc::now());
    state.work_item.set_node_and_pid();
    state.sync_state()?;
    let saved = context.registry.work_item_save(&state.work_item).await?;
    state.work_item.id = saved.id;
    info!(work_item_id = state.work_item.id, stage = %stage, bag = %state.work_item.name,
          "claimed work item");
    Ok(())
}

/// Hand the item to the next stage: (stage = next, status = Pending) is
/// where that stage's registry poll finds it. With `terminal`, mark it
/// Success instead.
pub async fn mark_succeeded(
    context: &Context,
    state: &mut IngestState,
    next_stage: Stage,
    terminal: bool,
    note: &str,
) -> Result<()> {
    state.work_item.stage = next_stage;
    state.work_item.status = if terminal { Status::Success } else { Status::Pending };
    state.work_item.note = note.to_string();
    state.work_item.retry = true;
    state.work_item.clear_node_and_pid();
    state.sync_state()?;
    context.registry.work_item_save(&state.work_item).await?;
    Ok(())
}

/// Terminal failure: no more retries, an operator needs to look.
pub async fn mark_failed(context: &Context, state: &mut IngestState) -> Result<()> {
    state.work_item.status = Status::Failed;
    state.work_item.retry = false;
    state.work_item.needs_admin_review = true;
    state.work_item.note = first_nonempty(
        &state.manifest.all_errors_as_string(),
        "Processing failed with no recorded error",
    );
    state.work_item.outcome = "Failed".to_string();
    state.work_item.clear_node_and_pid();
    state.sync_state()?;
    context.registry.work_item_save(&state.work_item).await?;
    error!(work_item_id = state.work_item.id, bag = %state.work_item.name,
           errors = %state.work_item.note, "work item failed");
    Ok(())
}

/// Transient failure: release the claim so the requeued message finds the
/// item claimable.
pub async fn mark_requeued(context: &Context, state: &mut IngestState) -> Result<()> {
    state.work_item.status = Status::Pending;
    state.work_item.note = format!(
        "Requeued after transient error: {}",
        first_nonempty(&state.manifest.all_errors_as_string(), "unknown")
    );
    state.work_item.clear_node_and_pid();
    state.sync_state()?;
    context.registry.work_item_save(&state.work_item).await?;
    info!(work_item_id = state.work_item.id, bag = %state.work_item.name, "work item requeued");
    Ok(())
}

/// Cancellation is cooperative: after claiming, re-read the registry's copy
/// of the item, because an operator may have cancelled it between our read
/// and our claim.
pub async fn cancelled_after_claim(context: &Context, work_item_id: i64) -> bool {
    match context.registry.work_item_get(work_item_id).await {
        Ok(Some(item)) => item.status == Status::Cancelled,
        _ => false,
    }
}

/// A worker observing a cancelled item must abandon it and release the
/// claim.
pub async fn release_cancelled(context: &Context, state: &mut IngestState) -> Result<()> {
    state.work_item.clear_node_and_pid();
    state.sync_state()?;
    context.registry.work_item_save(&state.work_item).await?;
    info!(work_item_id = state.work_item.id, "abandoned cancelled work item");
    Ok(())
}

/// Whether this attempt exhausts the retry budget.
pub fn time_to_give_up(state: &IngestState, attempt_number: u32, max_attempts: u32) -> bool {
    state.manifest.has_fatal_errors()
        || (state.manifest.has_errors() && attempt_number >= max_attempts)
}

/// Append one JSON line describing the item's current manifest to the
/// audit log.
pub fn audit_log(context: &Context, state: &IngestState) {
    let line = serde_json::json!({
        "timestamp": Utc::now(),
        "work_item_id": state.work_item.id,
        "name": state.work_item.name,
        "stage": state.work_item.stage,
        "status": state.work_item.status,
        "object_identifier": state.manifest.object_identifier,
        "manifest": state.manifest,
    });
    let path = std::path::Path::new(&context.config.log_directory).join("ingest_audit.json");
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "could not write audit log line");
    }
}

/// Spawn a heartbeat that touches the queue message until aborted.
/// Long copies and hashes run under one of these so the broker never
/// redelivers a live item.
pub fn spawn_heartbeat(handle: TouchHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            handle.touch();
        }
    })
}

/// Poll the registry for claimable work in the given (action, stage) pairs
/// and feed the ids onto this process's topic. This poll IS the hand-off
/// between pipeline stages: the previous stage's worker leaves the item at
/// (stage = ours, status = Pending), and nothing else moves it across the
/// process boundary. The interval comes from the worker's PollInterval
/// setting and is the floor on stage-to-stage latency.
pub async fn run_registry_feed(
    context: Context,
    queue: Arc<dyn WorkQueue>,
    topic: String,
    feeds: Vec<(Action, Stage)>,
    poll_interval: Duration,
) {
    let mut queued: std::collections::HashMap<i64, std::time::Instant> =
        std::collections::HashMap::new();
    loop {
        for (action, stage) in &feeds {
            let query = WorkItemQuery {
                item_action: Some(action.as_str().to_string()),
                stage: Some(stage.as_str().to_string()),
                status: Some(Status::Pending.as_str().to_string()),
                retry: Some(true),
                per_page: Some(100),
                ..Default::default()
            };
            match context.registry.work_items(&query).await {
                Ok(items) => {
                    for item in items {
                        // Don't re-publish an id we pushed moments ago; the
                        // claim check makes duplicates harmless, just noisy.
                        let recently = queued
                            .get(&item.id)
                            .is_some_and(|t| t.elapsed() < poll_interval * 4);
                        if recently || item.id == 0 {
                            continue;
                        }
                        if let Err(err) = queue.publish(&topic, &item.id.to_string()).await {
                            warn!(error = %err, "could not publish to {}", topic);
                            continue;
                        }
                        queued.insert(item.id, std::time::Instant::now());
                    }
                }
                Err(err) => warn!(error = %err, "registry poll failed"),
            }
        }
        queued.retain(|_, t| t.elapsed() < poll_interval * 8);
        tokio::time::sleep(poll_interval).await;
    }
}

fn first_nonempty(s: &str, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}

/// Parse the decimal work item id a queue message carries.
pub fn work_item_id_from_body(body: &str) -> Result<i64> {
    body.trim()
        .parse::<i64>()
        .with_context(|| format!("Queue message body '{}' is not a work item id", body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bag_name_from_key() {
        assert_eq!(
            bag_name_from_key("inst.edu.photos.tar", "inst.edu").unwrap(),
            "photos"
        );
        assert_eq!(
            bag_name_from_key("inst.edu.photos.b01.of04.tar", "inst.edu").unwrap(),
            "photos"
        );
        // Bag names may themselves contain dots.
        assert_eq!(
            bag_name_from_key("inst.edu.my.bag.v2.tar", "inst.edu").unwrap(),
            "my.bag.v2"
        );
        assert!(bag_name_from_key("other.edu.photos.tar", "inst.edu").is_none());
        assert!(bag_name_from_key("inst.edu.photos.zip", "inst.edu").is_none());
        assert!(bag_name_from_key("inst.edu..tar", "inst.edu").is_none());
    }

    #[test]
    fn test_work_item_id_from_body() {
        assert_eq!(work_item_id_from_body(" 42\n").unwrap(), 42);
        assert!(work_item_id_from_body("not-a-number").is_err());
    }

    #[test]
    fn test_time_to_give_up() {
        let mut state = IngestState {
            work_item: WorkItem::new_ingest("n", "b", "e", 1, "inst.edu", None),
            manifest: IngestManifest::new(1, "b", "n", "e"),
        };
        assert!(!time_to_give_up(&state, 1, 3));

        state.manifest.fetch_result.add_error("transient");
        assert!(!time_to_give_up(&state, 1, 3));
        assert!(time_to_give_up(&state, 3, 3));

        state.manifest.validate_result.add_fatal_error("bad bag");
        assert!(time_to_give_up(&state, 1, 3));
    }
}
