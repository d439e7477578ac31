//! Daily batching of uploads under global and per-day caps.
//!
//! Walks dates from the oldest incomplete day to today, skipping the
//! blocklist, and queues at most `daily_limit` files per day while keeping
//! the total in-flight work under the global simultaneous-upload cap.
//! A day with nothing pending marks its item complete.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use log::{info, warn};

use crate::configuration::types::ReplicationConfig;
use crate::error_handling::types::ReplicationError;
use crate::models::archive::daily_identifier;
use crate::storage::LinkStore;

use super::budgets::RetryCounters;
use super::queues::{ReplicationQueues, ReplicationTask};

pub struct DailyBatchScheduler {
    config: ReplicationConfig,
    store: Arc<dyn LinkStore>,
    queues: ReplicationQueues,
}

impl DailyBatchScheduler {
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn LinkStore>,
        queues: ReplicationQueues,
    ) -> Self {
        Self {
            config,
            store,
            queues,
        }
    }

    fn date_blocklisted(&self, date: NaiveDate) -> bool {
        let formatted = date.format("%Y-%m-%d").to_string();
        self.config.date_blocklist.contains(&formatted)
    }

    /// Queue upload tasks for one day, up to `limit`. Returns how many
    /// were queued; zero marks the day's item complete.
    async fn queue_uploads_for_date(
        &self,
        date: NaiveDate,
        limit: u64,
    ) -> Result<u64, ReplicationError> {
        let pending = self
            .store
            .links_pending_upload(&self.config.daily_identifier_prefix, date, limit)
            .await?;

        if pending.is_empty() {
            let identifier = daily_identifier(&self.config.daily_identifier_prefix, date);
            if self.store.get_item(&identifier).await?.is_some() {
                self.store.mark_item_complete(&identifier).await?;
                info!("Found no pending links: marked IA Item {} complete.", identifier);
            } else {
                info!("Found no pending links for {}.", date);
            }
            return Ok(0);
        }

        let queued = pending.len() as u64;
        for guid in pending {
            self.queues.push_write(ReplicationTask::Upload {
                link_guid: guid,
                counters: RetryCounters::default(),
            });
        }
        info!("Queued {} link(s) for upload on {}.", queued, date);
        Ok(queued)
    }

    /// One scheduling pass over the backlog.
    pub async fn queue_uploads(&self) -> Result<(), ReplicationError> {
        let depth = self.queues.write_depth();
        if depth > 0 {
            info!(
                "Skipped the queuing of file upload tasks: {} task(s) in the write queue.",
                depth
            );
            return Ok(());
        }

        let start = match self.store.oldest_incomplete_item_date().await? {
            Some(date) => date,
            None => Utc::now().date_naive(),
        };
        let end = Utc::now().date_naive();
        if start > end {
            warn!("Invalid range: start={} end={}.", start, end);
            return Ok(());
        }

        let tasks_in_flight = self.store.total_tasks_in_progress().await?;
        let max_to_queue =
            (self.config.max_simultaneous_uploads as i64 - tasks_in_flight).max(0) as u64;
        if max_to_queue == 0 {
            info!("Skipped the queuing of file upload tasks: max tasks already in progress.");
            return Ok(());
        }

        let mut total_queued = 0u64;
        let mut days: Vec<String> = Vec::new();
        let mut day = start;
        while day <= end && total_queued < max_to_queue {
            if self.date_blocklisted(day) {
                let Some(next) = day.succ_opt() else { break };
                day = next;
                continue;
            }
            let identifier = daily_identifier(&self.config.daily_identifier_prefix, day);
            let in_flight_for_day = self
                .store
                .get_item(&identifier)
                .await?
                .map(|item| item.tasks_in_progress)
                .unwrap_or(0);
            let bucket_limit = (self.config.daily_limit as u64)
                .min(max_to_queue - total_queued) as i64
                - in_flight_for_day;
            if bucket_limit > 0 {
                let queued = self.queue_uploads_for_date(day, bucket_limit as u64).await?;
                if queued > 0 {
                    total_queued += queued;
                    days.push(format!("{} ({})", day, queued));
                }
            }
            let Some(next) = day.succ_opt() else { break };
            day = next;
        }

        info!(
            "Prepared to upload {} link(s) to the external archive across {} day(s): {}.",
            total_queued,
            days.len(),
            days.join(", ")
        );
        Ok(())
    }

    /// Queue deletion tasks for links that became ineligible after their
    /// daily item was created.
    pub async fn queue_deletions(&self, limit: u64) -> Result<(), ReplicationError> {
        let guids = self.store.links_pending_deletion(limit).await?;
        let queued = guids.len();
        for guid in guids {
            self.queues.push_write(ReplicationTask::Delete {
                link_guid: guid,
                counters: RetryCounters::default(),
            });
        }
        info!("Queued {} link(s) for deletion.", queued);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Capture, CaptureRole, CaptureStatus, InternetArchiveItem, Link,
    };
    use crate::storage::DbLinkStore;

    struct Rig {
        scheduler: DailyBatchScheduler,
        store: Arc<DbLinkStore>,
        queues: ReplicationQueues,
    }

    async fn rig(config: ReplicationConfig) -> Rig {
        let store = Arc::new(DbLinkStore::new_in_memory().await.unwrap());
        let (queues, _receivers) = super::super::queues::replication_queues();
        // receivers leak; tests only inspect depths
        std::mem::forget(_receivers);
        let scheduler = DailyBatchScheduler::new(config, store.clone(), queues.clone());
        Rig {
            scheduler,
            store,
            queues,
        }
    }

    async fn seed_uploadable(store: &DbLinkStore) -> Link {
        let link = Link::new("http://example.test/");
        store.create_link(&link).await.unwrap();
        store
            .create_capture(&Capture {
                link_guid: link.guid,
                role: CaptureRole::Primary,
                status: CaptureStatus::Success,
                record_type: "response".to_string(),
                url: link.submitted_url.clone(),
                content_type: "text/html".to_string(),
            })
            .await
            .unwrap();
        link
    }

    #[tokio::test]
    async fn queues_pending_links_for_today() {
        let rig = rig(ReplicationConfig::default()).await;
        seed_uploadable(&rig.store).await;
        seed_uploadable(&rig.store).await;

        rig.scheduler.queue_uploads().await.unwrap();
        assert_eq!(rig.queues.write_depth(), 2);
    }

    #[tokio::test]
    async fn respects_the_global_in_flight_cap() {
        let mut config = ReplicationConfig::default();
        config.max_simultaneous_uploads = 3;
        let rig = rig(config).await;
        seed_uploadable(&rig.store).await;

        // another item already has 3 tasks in flight
        let other = InternetArchiveItem::for_date(
            "daily_perma_cc",
            chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        );
        rig.store.get_or_create_item(&other).await.unwrap();
        rig.store
            .adjust_tasks_in_progress(&other.identifier, 3, false)
            .await
            .unwrap();
        // keep the walk starting today, not in 2020
        rig.store.mark_item_complete(&other.identifier).await.unwrap();

        rig.scheduler.queue_uploads().await.unwrap();
        assert_eq!(rig.queues.write_depth(), 0, "cap already consumed");
    }

    #[tokio::test]
    async fn empty_day_marks_its_item_complete() {
        let rig = rig(ReplicationConfig::default()).await;
        let today = Utc::now().date_naive();
        let item = InternetArchiveItem::for_date("daily_perma_cc", today);
        rig.store.get_or_create_item(&item).await.unwrap();

        rig.scheduler.queue_uploads().await.unwrap();
        let item = rig.store.get_item(&item.identifier).await.unwrap().unwrap();
        assert!(item.complete);
    }

    #[tokio::test]
    async fn blocklisted_days_are_skipped() {
        let today = Utc::now().date_naive();
        let mut config = ReplicationConfig::default();
        config.date_blocklist = vec![today.format("%Y-%m-%d").to_string()];
        let rig = rig(config).await;
        seed_uploadable(&rig.store).await;

        rig.scheduler.queue_uploads().await.unwrap();
        assert_eq!(rig.queues.write_depth(), 0);
    }

    #[tokio::test]
    async fn busy_write_queue_defers_scheduling() {
        let rig = rig(ReplicationConfig::default()).await;
        seed_uploadable(&rig.store).await;
        rig.queues.push_write(ReplicationTask::Upload {
            link_guid: uuid::Uuid::new_v4(),
            counters: RetryCounters::default(),
        });

        rig.scheduler.queue_uploads().await.unwrap();
        assert_eq!(rig.queues.write_depth(), 1, "nothing added");
    }

    #[tokio::test]
    async fn ineligible_links_are_queued_for_deletion() {
        let rig = rig(ReplicationConfig::default()).await;
        let link = seed_uploadable(&rig.store).await;
        let date = link.created_at.date_naive();
        let item = InternetArchiveItem::for_date("daily_perma_cc", date);
        rig.store.get_or_create_item(&item).await.unwrap();
        rig.store
            .create_file(&crate::models::InternetArchiveFile::new(
                item.identifier.clone(),
                link.guid,
                crate::models::FileStatus::ConfirmedPresent,
            ))
            .await
            .unwrap();
        rig.store
            .set_link_private(link.guid, crate::models::PrivateReason::User)
            .await
            .unwrap();

        rig.scheduler.queue_deletions(100).await.unwrap();
        assert_eq!(rig.queues.write_depth(), 1);
    }
}
