//! Federation copier: pull peer bags via rsync, verify, hand off
//!
//! The copy itself runs over rsync (optionally through ssh) in inplace
//! mode, so an interrupted transfer resumes instead of restarting. After
//! the copy we hash the bag's tag manifest and report the digest to the
//! sending node; the peer's answer decides whether the bag proceeds to
//! local storage or gets discarded.

use crate::bag::with_tar_entry;
use crate::constants::{Stage, Status};
use crate::context::Context;
use crate::federation::rest_client::{FederationClient, ReplicationTransfer};
use crate::queue::{Delivery, WorkQueue};
use crate::volume::VolumeService;
use crate::workers::common::{self, load_ingest_state, spawn_heartbeat};
use anyhow::{anyhow, Context as AnyhowContext, Result};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

const SPACE_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Build the rsync command for one transfer. `copy_from` is an scp-style
/// source like `peer@host:/home/peer.tdr/outbound/bag.tar`; `copy_to` is a
/// local path. Inplace mode lets an interrupted copy pick up where it
/// stopped.
pub fn rsync_command(copy_from: &str, copy_to: &Path, use_ssh: bool) -> Command {
    let mut command = Command::new("rsync");
    if use_ssh {
        command.args(["-avzW", "-e", "ssh"]);
    } else {
        command.arg("-avzW");
    }
    command.arg(copy_from).arg(copy_to).arg("--inplace");
    command
}

#[derive(Clone)]
pub struct FederationCopier {
    context: Context,
    volume: VolumeService,
    remote_clients: HashMap<String, FederationClient>,
}

impl FederationCopier {
    pub fn new(context: Context) -> Result<Self> {
        let federation = &context.config.federation;
        let volume = VolumeService::new(&federation.staging_directory)?;
        let mut remote_clients = HashMap::new();
        for (node, url) in &federation.remote_node_urls {
            let token = federation
                .remote_node_tokens
                .get(node)
                .cloned()
                .unwrap_or_default();
            remote_clients.insert(
                node.clone(),
                FederationClient::new(
                    url,
                    &federation.rest_client.local_api_root,
                    token,
                    node.clone(),
                    federation.accept_invalid_ssl_certs,
                )?,
            );
        }
        Ok(Self {
            context,
            volume,
            remote_clients,
        })
    }

    pub async fn run(&self, queue: Arc<dyn WorkQueue>) -> Result<()> {
        let cfg = &self.context.config.federation.copy_worker;
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

    /// The message body is a federation work item id; the item's name holds
    /// the transfer id and its object identifier the bag uuid.
    pub async fn process(&self, delivery: Delivery) {
        let work_item_id = match common::work_item_id_from_body(&delivery.body) {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "dropping unreadable federation message");
                delivery.finish();
                return;
            }
        };
        let mut state = match load_ingest_state(&self.context, work_item_id).await {
            Ok(state) => state,
            Err(err) => {
                error!(work_item_id, error = %err, "cannot load federation work item");
                delivery.requeue(TRANSIENT_RETRY_DELAY);
                return;
            }
        };
        if state.work_item.belongs_to_another_worker() || state.work_item.is_in_progress() {
            info!(work_item_id, "skipping: transfer is being processed elsewhere");
            delivery.finish();
            return;
        }
        state.work_item.status = Status::Started;
        state.work_item.set_node_and_pid();
        if let Err(err) = self.context.registry.work_item_save(&state.work_item).await {
            error!(work_item_id, error = %err, "cannot claim federation work item");
            delivery.requeue(TRANSIENT_RETRY_DELAY);
            return;
        }

        let heartbeat = spawn_heartbeat(
            delivery.touch_handle(),
            self.context
                .config
                .federation
                .copy_worker
                .heartbeat()
                .unwrap_or(Duration::from_secs(30)),
        );
        let outcome = self.copy_and_verify(&mut state, &delivery).await;
        heartbeat.abort();

        match outcome {
            Ok(CopyOutcome::StoreRequested) => {
                // The federation validate worker's registry poll picks the
                // item up from (Validate, Pending).
                state.work_item.stage = Stage::Validate;
                state.work_item.status = Status::Pending;
                state.work_item.note =
                    "Tag manifest digest accepted; bag queued for validation".to_string();
                state.work_item.clear_node_and_pid();
                let _ = self.context.registry.work_item_save(&state.work_item).await;
                delivery.finish();
            }
            Ok(CopyOutcome::Discarded(reason)) => {
                state.work_item.status = Status::Cancelled;
                state.work_item.retry = false;
                state.work_item.note = reason;
                state.work_item.clear_node_and_pid();
                let _ = self.context.registry.work_item_save(&state.work_item).await;
                delivery.finish();
            }
            Ok(CopyOutcome::NoSpace) => {
                state.work_item.status = Status::Pending;
                state.work_item.note =
                    "Not enough staging disk space; transfer will retry".to_string();
                state.work_item.clear_node_and_pid();
                let _ = self.context.registry.work_item_save(&state.work_item).await;
                warn!(work_item_id, "requeueing transfer: insufficient staging space");
                delivery.requeue(SPACE_RETRY_DELAY);
            }
            Err(err) => {
                let max_attempts = self.context.config.federation.copy_worker.max_attempts;
                state.work_item.note = format!("Copy failed: {}", err);
                state.work_item.clear_node_and_pid();
                if delivery.attempts >= max_attempts {
                    state.work_item.status = Status::Failed;
                    state.work_item.retry = false;
                    state.work_item.needs_admin_review = true;
                    let _ = self.context.registry.work_item_save(&state.work_item).await;
                    error!(work_item_id, error = %err, "transfer failed permanently");
                    delivery.finish();
                } else {
                    state.work_item.status = Status::Pending;
                    let _ = self.context.registry.work_item_save(&state.work_item).await;
                    warn!(work_item_id, error = %err, "transfer failed, will retry");
                    delivery.requeue(TRANSIENT_RETRY_DELAY);
                }
            }
        }
    }

    async fn copy_and_verify(
        &self,
        state: &mut common::IngestState,
        delivery: &Delivery,
    ) -> Result<CopyOutcome> {
        let transfer_id = state.work_item.name.clone();
        let bag_uuid = state.work_item.object_identifier.clone();

        let from_node = &state.work_item.institution;
        let client = self
            .remote_clients
            .get(from_node)
            .ok_or_else(|| anyhow!("No REST client for peer node '{}'", from_node))?;

        let transfer = client
            .get_transfer(&transfer_id)
            .await?
            .ok_or_else(|| anyhow!("Peer {} has no transfer {}", from_node, transfer_id))?;
        if transfer.is_settled() {
            return Ok(CopyOutcome::Discarded(format!(
                "Transfer {} is already settled on {}",
                transfer_id, from_node
            )));
        }
        let bag = client
            .get_bag(&transfer.bag)
            .await?
            .ok_or_else(|| anyhow!("Peer {} has no bag {}", from_node, transfer.bag))?;

        let local_path = PathBuf::from(&self.context.config.federation.staging_directory)
            .join(format!("{}.tar", bag_uuid));

        // Reserve before copying; a full staging volume mid-copy helps
        // nobody.
        if self.volume.reserve(&local_path, bag.size as u64).is_err() {
            return Ok(CopyOutcome::NoSpace);
        }

        let copy_result = async {
            self.run_rsync(&transfer, &local_path, delivery).await?;
            self.report_fixity(client, transfer, &local_path, &bag_uuid)
                .await
        }
        .await;

        let updated = match copy_result {
            Ok(updated) => updated,
            Err(err) => {
                self.volume.release(&local_path).ok();
                return Err(err);
            }
        };

        if updated.store_requested {
            // The next stage owns the staged file now; the reservation is
            // released once the bag is stored or discarded there.
            info!(transfer = %updated.replication_id, bag = %bag_uuid,
                  "peer requested store");
            Ok(CopyOutcome::StoreRequested)
        } else {
            info!(transfer = %updated.replication_id, bag = %bag_uuid,
                  "peer declined store; deleting local copy");
            if let Err(err) = std::fs::remove_file(&local_path) {
                warn!(error = %err, "could not delete declined copy");
            }
            self.volume.release(&local_path).ok();
            Ok(CopyOutcome::Discarded(format!(
                "Peer {} declined storage for transfer {}",
                updated.from_node, updated.replication_id
            )))
        }
    }

    async fn run_rsync(
        &self,
        transfer: &ReplicationTransfer,
        local_path: &Path,
        delivery: &Delivery,
    ) -> Result<()> {
        let use_ssh = self.context.config.federation.use_ssh_with_rsync;
        let mut command = rsync_command(&transfer.link, local_path, use_ssh);

        // Touch on both sides of the copy; rsync can run for hours.
        delivery.touch();
        let output = command
            .output()
            .await
            .context("Could not run rsync; is it installed?")?;
        delivery.touch();

        info!(transfer = %transfer.replication_id,
              stdout = %String::from_utf8_lossy(&output.stdout).trim(),
              "rsync finished");
        if !output.status.success() {
            anyhow::bail!(
                "rsync exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Hash the tag manifest inside the copied bag and send the digest to
    /// the peer. The updated transfer comes back with the peer's verdict.
    async fn report_fixity(
        &self,
        client: &FederationClient,
        mut transfer: ReplicationTransfer,
        local_path: &Path,
        bag_uuid: &str,
    ) -> Result<ReplicationTransfer> {
        let manifest_path = format!("{}/tagmanifest-sha256.txt", bag_uuid);
        let tar_path = local_path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || {
            with_tar_entry(&tar_path, &manifest_path, |reader| {
                let mut content = Vec::new();
                reader.read_to_end(&mut content)?;
                arca_common::checksum::compute_sha256(&mut content.as_slice())
            })
        })
        .await??;

        transfer.fixity_value = Some(digest);
        client.update_transfer(&transfer).await.map_err(Into::into)
    }
}

enum CopyOutcome {
    StoreRequested,
    Discarded(String),
    NoSpace,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_rsync_command_with_ssh() {
        let command = rsync_command(
            "peer@peer.example.org:outbound/bag.tar",
            Path::new("/staging/bag.tar"),
            true,
        );
        assert_eq!(command.as_std().get_program(), "rsync");
        assert_eq!(
            args_of(&command),
            vec![
                "-avzW",
                "-e",
                "ssh",
                "peer@peer.example.org:outbound/bag.tar",
                "/staging/bag.tar",
                "--inplace",
            ]
        );
    }

    #[test]
    fn test_rsync_command_plain() {
        let command = rsync_command("peer@host:bag.tar", Path::new("/staging/bag.tar"), false);
        assert_eq!(
            args_of(&command),
            vec!["-avzW", "peer@host:bag.tar", "/staging/bag.tar", "--inplace"]
        );
    }
}
