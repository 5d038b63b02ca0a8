//! Receiving-bucket reader
//!
//! Polls each institution's receiving bucket and creates a work item for
//! every new tar upload, stamped queued_at at (Receive, Pending), which is
//! where the fetch worker's registry poll collects it. Safe to run on a
//! tight schedule: an upload already known to the registry by
//! (name, etag, size) is never duplicated.

use crate::constants::Status;
use crate::context::Context;
use crate::models::{Institution, WorkItem};
use crate::registry::WorkItemQuery;
use crate::storage::{ObjectStore, ObjectSummary};
use crate::workers::common::bag_name_from_key;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use tracing::info;

/// What one polling run did, for the audit log.
#[derive(Debug, Default, serde::Serialize)]
pub struct BucketReaderStats {
    pub institutions_cached: usize,
    pub work_items_cached: usize,
    pub keys_seen: usize,
    pub work_items_created: Vec<i64>,
    pub work_items_queued: Vec<i64>,
    pub keys_skipped: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// What to do with one bucket key, given what the registry already knows.
#[derive(Debug, PartialEq, Eq)]
pub enum KeyDisposition {
    /// Nothing matches: create a work item and queue it.
    CreateNew,
    /// A matching item exists but was never queued: queue it.
    QueueExisting(i64),
    /// A matching item exists and is queued, in progress, or done.
    Skip,
}

/// Decide what to do with a bucket key based on the registry's matching
/// work item, if any. Matching means same name, etag and size.
pub fn disposition_for(existing: Option<&WorkItem>, skip_already_processed: bool) -> KeyDisposition {
    match existing {
        None => KeyDisposition::CreateNew,
        Some(item) => {
            if item.queued_at.is_none() && item.status == Status::Pending {
                KeyDisposition::QueueExisting(item.id)
            } else if !skip_already_processed && item.status == Status::Failed && item.retry {
                KeyDisposition::QueueExisting(item.id)
            } else {
                KeyDisposition::Skip
            }
        }
    }
}

/// Find the institution whose identifier prefixes this key. Institution
/// identifiers contain dots, so the longest match wins.
pub fn institution_for_key<'a>(
    key: &str,
    institutions: &'a [Institution],
) -> Option<&'a Institution> {
    institutions
        .iter()
        .filter(|inst| key.starts_with(&format!("{}.", inst.identifier)))
        .max_by_key(|inst| inst.identifier.len())
}

pub struct BucketReader {
    context: Context,
}

impl BucketReader {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    /// One polling pass over every receiving bucket.
    pub async fn run(&self) -> Result<BucketReaderStats> {
        let mut stats = BucketReaderStats::default();

        let institutions = self.context.registry.institutions().await?;
        stats.institutions_cached = institutions.len();

        // One registry round trip caches the recent ingest items; keys not
        // found here get an individual lookup below.
        let cached_items = self
            .context
            .registry
            .work_items(&WorkItemQuery {
                item_action: Some("Ingest".to_string()),
                per_page: Some(1000),
                ..Default::default()
            })
            .await?;
        let mut cache: HashMap<(String, String), WorkItem> = cached_items
            .into_iter()
            .map(|item| ((item.name.clone(), item.etag.clone()), item))
            .collect();
        stats.work_items_cached = cache.len();

        for bucket in self.context.config.receiving_buckets.clone() {
            let store = ObjectStore::connect(self.context.config.receiving_target(&bucket))?;
            let summaries = match store.list_all("").await {
                Ok(summaries) => summaries,
                Err(err) => {
                    stats.errors.push(format!("Cannot list {}: {}", bucket, err));
                    continue;
                }
            };
            for summary in summaries {
                stats.keys_seen += 1;
                if let Err(err) = self
                    .process_key(&bucket, &summary, &institutions, &mut cache, &mut stats)
                    .await
                {
                    stats
                        .errors
                        .push(format!("{}/{}: {}", bucket, summary.key, err));
                }
            }
        }

        info!(
            keys_seen = stats.keys_seen,
            created = stats.work_items_created.len(),
            queued = stats.work_items_queued.len(),
            skipped = stats.keys_skipped,
            errors = stats.errors.len(),
            "bucket reader pass complete"
        );
        Ok(stats)
    }

    async fn process_key(
        &self,
        bucket: &str,
        summary: &ObjectSummary,
        institutions: &[Institution],
        cache: &mut HashMap<(String, String), WorkItem>,
        stats: &mut BucketReaderStats,
    ) -> Result<()> {
        let Some(institution) = institution_for_key(&summary.key, institutions) else {
            stats.warnings.push(format!(
                "Key '{}' in {} matches no institution",
                summary.key, bucket
            ));
            stats.keys_skipped += 1;
            return Ok(());
        };
        if bag_name_from_key(&summary.key, &institution.identifier).is_none() {
            stats
                .warnings
                .push(format!("Key '{}' is not a tar upload", summary.key));
            stats.keys_skipped += 1;
            return Ok(());
        }
        let max_file_size = self.context.config.max_file_size;
        if max_file_size > 0 && summary.size > max_file_size {
            stats.warnings.push(format!(
                "Key '{}' is {} bytes, over the {} byte limit",
                summary.key, summary.size, max_file_size
            ));
            stats.keys_skipped += 1;
            return Ok(());
        }

        // Cache first, then an individual registry lookup.
        let cache_key = (summary.key.clone(), summary.etag.clone());
        let existing = match cache.get(&cache_key) {
            Some(item) if item.size == summary.size => Some(item.clone()),
            _ => {
                let found = self
                    .context
                    .registry
                    .work_items(&WorkItemQuery {
                        name: Some(summary.key.clone()),
                        etag: Some(summary.etag.clone()),
                        ..Default::default()
                    })
                    .await?
                    .into_iter()
                    .find(|item| item.size == summary.size);
                if let Some(ref item) = found {
                    cache.insert(cache_key.clone(), item.clone());
                }
                found
            }
        };

        match disposition_for(existing.as_ref(), self.context.config.skip_already_processed) {
            KeyDisposition::Skip => {
                stats.keys_skipped += 1;
                Ok(())
            }
            KeyDisposition::QueueExisting(id) => {
                // Stamping queued_at at (Receive, Pending) is the queueing:
                // the fetch worker's registry poll collects it from there.
                if let Some(mut item) = existing {
                    item.queued_at = Some(Utc::now());
                    self.context.registry.work_item_save(&item).await?;
                    cache.insert(cache_key, item);
                }
                stats.work_items_queued.push(id);
                Ok(())
            }
            KeyDisposition::CreateNew => {
                let item = WorkItem::new_ingest(
                    &summary.key,
                    bucket,
                    &summary.etag,
                    summary.size,
                    &institution.identifier,
                    summary.last_modified,
                );
                let mut created = self.context.registry.work_item_create(&item).await?;
                created.queued_at = Some(Utc::now());
                self.context.registry.work_item_save(&created).await?;
                info!(work_item_id = created.id, key = %summary.key, bucket = %bucket,
                      "created and queued work item");
                stats.work_items_created.push(created.id);
                cache.insert(cache_key, created);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, queued: bool, status: Status) -> WorkItem {
        let mut item = WorkItem::new_ingest(
            "inst.edu.photos.tar",
            "arca.receiving.inst.edu",
            "etag1",
            100,
            "inst.edu",
            None,
        );
        item.id = id;
        item.status = status;
        if queued {
            item.queued_at = Some(Utc::now());
        }
        item
    }

    #[test]
    fn test_disposition_new_key() {
        assert_eq!(disposition_for(None, true), KeyDisposition::CreateNew);
    }

    #[test]
    fn test_disposition_unqueued_pending_item() {
        let existing = item(7, false, Status::Pending);
        assert_eq!(
            disposition_for(Some(&existing), true),
            KeyDisposition::QueueExisting(7)
        );
    }

    #[test]
    fn test_disposition_skips_queued_and_finished() {
        let queued = item(7, true, Status::Pending);
        assert_eq!(disposition_for(Some(&queued), true), KeyDisposition::Skip);

        let started = item(8, true, Status::Started);
        assert_eq!(disposition_for(Some(&started), true), KeyDisposition::Skip);

        let done = item(9, true, Status::Success);
        assert_eq!(disposition_for(Some(&done), true), KeyDisposition::Skip);
    }

    #[test]
    fn test_disposition_reprocess_failed_when_configured() {
        let mut failed = item(3, true, Status::Failed);
        failed.retry = true;
        assert_eq!(disposition_for(Some(&failed), true), KeyDisposition::Skip);
        assert_eq!(
            disposition_for(Some(&failed), false),
            KeyDisposition::QueueExisting(3)
        );
    }

    #[test]
    fn test_institution_for_key_longest_match() {
        let institutions = vec![
            Institution {
                id: 1,
                identifier: "inst.edu".to_string(),
                name: "Inst".to_string(),
                receiving_bucket: String::new(),
                restore_bucket: String::new(),
            },
            Institution {
                id: 2,
                identifier: "branch.inst.edu".to_string(),
                name: "Branch".to_string(),
                receiving_bucket: String::new(),
                restore_bucket: String::new(),
            },
        ];
        assert_eq!(
            institution_for_key("inst.edu.photos.tar", &institutions)
                .unwrap()
                .id,
            1
        );
        assert_eq!(
            institution_for_key("branch.inst.edu.photos.tar", &institutions)
                .unwrap()
                .id,
            2
        );
        assert!(institution_for_key("other.org.photos.tar", &institutions).is_none());
    }
}
