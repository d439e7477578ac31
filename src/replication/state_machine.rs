//! Per-file replication lifecycle: uploads and their mirror-image
//! deletions against the external archive.
//!
//! A task makes one attempt, then either records the submitted status or
//! re-queues itself with updated counters. Rate-limit, timeout and error
//! classes each draw on their own budget; connection failures and
//! concurrent-creation races retry for free. `tasks_in_progress` is
//! incremented when an attempt starts tracking an item and decremented on
//! every re-queue, so the daily scheduler sees exactly the in-flight work.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use uuid::Uuid;

use crate::configuration::types::ReplicationConfig;
use crate::error_handling::types::{ArchiveErrorClass, ReplicationError};
use crate::models::archive::{
    daily_identifier, standard_file_metadata, standard_item_metadata, warc_filename,
};
use crate::models::{CaptureRole, CaptureStatus, FileStatus, InternetArchiveFile, InternetArchiveItem, Link};
use crate::storage::{BlobStore, LinkStore};

use super::budgets::{RetryBudgets, RetryCounters};
use super::client::ArchiveSession;
use super::queues::{ReplicationQueues, ReplicationTask};

pub struct ReplicationEngine {
    config: ReplicationConfig,
    budgets: RetryBudgets,
    store: Arc<dyn LinkStore>,
    blobs: Arc<dyn BlobStore>,
    client: ArchiveSession,
    queues: ReplicationQueues,
}

impl ReplicationEngine {
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn LinkStore>,
        blobs: Arc<dyn BlobStore>,
        client: ArchiveSession,
        queues: ReplicationQueues,
    ) -> Self {
        Self {
            budgets: RetryBudgets::from_config(&config),
            config,
            store,
            blobs,
            client,
            queues,
        }
    }

    async fn link_eligible_for_upload(&self, link: &Link) -> Result<bool, ReplicationError> {
        if link.user_deleted || link.is_private {
            return Ok(false);
        }
        let primary = self.store.get_capture(link.guid, CaptureRole::Primary).await?;
        Ok(matches!(primary, Some(capture) if capture.status == CaptureStatus::Success))
    }

    /// Stop tracking the item for this attempt and queue another try.
    async fn requeue_upload(
        &self,
        identifier: &str,
        link_guid: Uuid,
        counters: RetryCounters,
    ) -> Result<(), ReplicationError> {
        self.store
            .adjust_tasks_in_progress(identifier, -1, false)
            .await?;
        self.queues.push_write(ReplicationTask::Upload {
            link_guid,
            counters,
        });
        Ok(())
    }

    async fn requeue_delete(
        &self,
        identifier: &str,
        link_guid: Uuid,
        counters: RetryCounters,
    ) -> Result<(), ReplicationError> {
        self.store
            .adjust_tasks_in_progress(identifier, -1, false)
            .await?;
        self.queues.push_write(ReplicationTask::Delete {
            link_guid,
            counters,
        });
        Ok(())
    }

    /// Add one link's WARC and metadata to its daily item.
    pub async fn upload_link(
        &self,
        link_guid: Uuid,
        counters: RetryCounters,
    ) -> Result<(), ReplicationError> {
        let link = self.store.get_link(link_guid).await?;
        if !self.link_eligible_for_upload(&link).await? {
            info!("Queued link {} no longer eligible for upload.", link_guid);
            return Ok(());
        }

        let date = link.created_at.date_naive();
        let identifier = daily_identifier(&self.config.daily_identifier_prefix, date);
        self.store
            .get_or_create_item(&InternetArchiveItem::for_date(
                &self.config.daily_identifier_prefix,
                date,
            ))
            .await?;

        let file = match self.store.get_file(&identifier, link_guid).await? {
            Some(file) => match file.status {
                FileStatus::ConfirmedPresent => {
                    info!(
                        "Not uploading {} to {}: our records indicate it is already present.",
                        link_guid, identifier
                    );
                    return Ok(());
                }
                FileStatus::DeletionAttempted | FileStatus::DeletionSubmitted => {
                    // something has gotten very mixed up indeed; a human
                    // needs to look
                    error!(
                        "Please investigate the status of {}: our records indicate a deletion \
                         attempt is in progress, but an upload was attempted in the meantime.",
                        link_guid
                    );
                    return Ok(());
                }
                FileStatus::UploadAttempted | FileStatus::UploadSubmitted => {
                    info!(
                        "Potentially redundant attempt to upload {} to {}: if this message \
                         recurs, please look into its status.",
                        link_guid, identifier
                    );
                    file
                }
                FileStatus::ConfirmedAbsent => {
                    info!("Uploading {} (previously deleted) to {}.", link_guid, identifier);
                    file
                }
            },
            None => {
                let file = self
                    .store
                    .create_file(&InternetArchiveFile::new(
                        identifier.clone(),
                        link_guid,
                        FileStatus::UploadAttempted,
                    ))
                    .await?;
                info!("Uploading {} to {}.", link_guid, identifier);
                file
            }
        };

        // track this item until the attempt resolves
        self.store
            .adjust_tasks_in_progress(&identifier, 1, false)
            .await?;
        self.store
            .set_file_status(file.id, FileStatus::UploadAttempted)
            .await?;

        // make sure we aren't exceeding rate limits
        let load = match self.client.get_s3_load_info(&identifier).await {
            Ok(load) => load,
            Err(_) => {
                info!(
                    "Re-queued upload for {} after a load-info connection error.",
                    link_guid
                );
                return self.requeue_upload(&identifier, link_guid, counters).await;
            }
        };
        if load.overloaded
            || load.perma_task_limit_approaching()
            || load.global_task_limit_approaching()
            || load.bucket_task_limit_approaching()
        {
            warn!(
                "Skipped IA upload task for {} (IA Item {}) due to rate limit.",
                link_guid, identifier
            );
            if self.budgets.allows_rate_limit_retry(counters.attempts) {
                self.requeue_upload(&identifier, link_guid, counters.another_attempt())
                    .await?;
            } else {
                self.budgets.log_exhausted(&format!(
                    "Not retrying IA upload task for {} (IA Item {}): rate limit retry maximum reached.",
                    link_guid, identifier
                ));
            }
            return Ok(());
        }

        // metadata reads sometimes time out; retry later without counting
        // this as a failed attempt
        if let Err(e) = self.client.get_item(&identifier).await {
            if e.class == ArchiveErrorClass::Connection {
                info!("Re-queued upload for {} after a connection error.", link_guid);
                return self.requeue_upload(&identifier, link_guid, counters).await;
            }
            warn!("Item metadata fetch for {} failed: {}", identifier, e);
            if self.budgets.allows_error_retry(counters.attempts) {
                self.requeue_upload(&identifier, link_guid, counters.another_attempt())
                    .await?;
            } else {
                self.budgets.log_exhausted(&format!(
                    "Not retrying IA upload task for {} (IA Item {}): error retry maximum reached.",
                    link_guid, identifier
                ));
            }
            return Ok(());
        }

        // copy the warc to local disk for upload: more robust against
        // network conditions than streaming straight from the blob store
        info!("Downloading {} from the blob store.", link.warc_storage_file());
        let warc_bytes = self.blobs.open(&link.warc_storage_file()).await?;
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(&warc_bytes)?;
        staged.flush()?;
        let body = tokio::fs::File::open(staged.path()).await?;

        let warc_filename = warc_filename(link_guid);
        let item_metadata = standard_item_metadata(&self.config.daily_identifier_prefix, date);
        let file_metadata = standard_file_metadata(&link);
        let upload = self.client.upload_file(
            &identifier,
            &warc_filename,
            body,
            &item_metadata,
            &file_metadata,
        );
        let soft_limit = Duration::from_secs(self.config.task_soft_time_limit);
        match tokio::time::timeout(soft_limit, upload).await {
            Err(_) => {
                if self.budgets.allows_timeout_retry(counters.timeouts) {
                    info!("Re-queued upload for {} after the soft time limit.", link_guid);
                    self.requeue_upload(&identifier, link_guid, counters.another_timeout())
                        .await?;
                } else {
                    self.budgets.log_exhausted(&format!(
                        "Not retrying IA upload task for {} (IA Item {}): timeout retry maximum reached.",
                        link_guid, identifier
                    ));
                }
                return Ok(());
            }
            Ok(Err(e)) => {
                match e.class {
                    ArchiveErrorClass::Connection => {
                        info!("Re-queued upload for {} after a connection error.", link_guid);
                        self.requeue_upload(&identifier, link_guid, counters).await?;
                    }
                    ArchiveErrorClass::RateLimited => {
                        warn!(
                            "Upload task for {} (IA Item {}) prevented by rate-limiting. Will retry if allowed.",
                            link_guid, identifier
                        );
                        if self.budgets.allows_rate_limit_retry(counters.attempts) {
                            self.requeue_upload(&identifier, link_guid, counters.another_attempt())
                                .await?;
                        } else {
                            self.budgets.log_exhausted(&format!(
                                "Not retrying IA upload task for {} (IA Item {}): rate limit retry maximum reached.",
                                link_guid, identifier
                            ));
                        }
                    }
                    ArchiveErrorClass::ConcurrentCreation => {
                        // concurrent uploads racing to create a new item
                        // trip the service's consistency guards; re-queue
                        // without considering it a failed attempt
                        self.requeue_upload(&identifier, link_guid, counters).await?;
                    }
                    ArchiveErrorClass::Http => {
                        warn!(
                            "Upload task for {} (IA Item {}) encountered an unexpected error ({}). Will retry if allowed.",
                            link_guid,
                            identifier,
                            e.message.trim()
                        );
                        if self.budgets.allows_error_retry(counters.attempts) {
                            self.requeue_upload(&identifier, link_guid, counters.another_attempt())
                                .await?;
                        } else {
                            self.budgets.log_exhausted(&format!(
                                "Not retrying IA upload task for {} (IA Item {}): error retry maximum reached.",
                                link_guid, identifier
                            ));
                        }
                    }
                }
                return Ok(());
            }
            Ok(Ok(())) => {}
        }

        self.store
            .set_file_status(file.id, FileStatus::UploadSubmitted)
            .await?;
        info!("Uploaded {} to {}: confirmation pending.", link_guid, identifier);
        Ok(())
    }

    /// Remove a link's WARC from its daily item; statuses mirror uploads.
    pub async fn delete_link(
        &self,
        link_guid: Uuid,
        counters: RetryCounters,
    ) -> Result<(), ReplicationError> {
        let Some(file) = self.store.get_file_for_link(link_guid).await? else {
            info!("No archive file recorded for {}; nothing to delete.", link_guid);
            return Ok(());
        };
        let identifier = file.item_id.clone();

        match file.status {
            FileStatus::ConfirmedAbsent => {
                info!(
                    "The daily archive file for {} is already confirmed absent from {}.",
                    link_guid, identifier
                );
                return Ok(());
            }
            FileStatus::UploadAttempted | FileStatus::UploadSubmitted => {
                error!(
                    "Please investigate the status of {}: our records indicate an upload \
                     attempt is in progress, but a deletion was attempted in the meantime.",
                    link_guid
                );
                return Ok(());
            }
            FileStatus::DeletionAttempted | FileStatus::DeletionSubmitted => {
                info!(
                    "Potentially redundant attempt to delete {} from {}: if this message \
                     recurs, please look into its status.",
                    link_guid, identifier
                );
            }
            FileStatus::ConfirmedPresent => {
                info!("Deleting {} from {}.", link_guid, identifier);
            }
        }

        self.store
            .set_file_status(file.id, FileStatus::DeletionAttempted)
            .await?;
        self.store
            .adjust_tasks_in_progress(&identifier, 1, false)
            .await?;

        let load = match self.client.get_s3_load_info(&identifier).await {
            Ok(load) => load,
            Err(_) => {
                info!(
                    "Re-queued deletion for {} after a load-info connection error.",
                    link_guid
                );
                return self.requeue_delete(&identifier, link_guid, counters).await;
            }
        };
        // deletions check our share and the global load, not the bucket's
        if load.overloaded
            || load.perma_task_limit_approaching()
            || load.global_task_limit_approaching()
        {
            warn!(
                "Skipped IA deletion task for {} (IA Item {}) due to rate limit.",
                link_guid, identifier
            );
            if self.budgets.allows_rate_limit_retry(counters.attempts) {
                self.requeue_delete(&identifier, link_guid, counters.another_attempt())
                    .await?;
            } else {
                self.budgets.log_exhausted(&format!(
                    "Not retrying IA deletion task for {} (IA Item {}): rate limit retry maximum reached.",
                    link_guid, identifier
                ));
            }
            return Ok(());
        }

        if let Err(e) = self.client.get_item(&identifier).await {
            if e.class == ArchiveErrorClass::Connection {
                info!("Re-queued deletion for {} after a connection error.", link_guid);
                return self.requeue_delete(&identifier, link_guid, counters).await;
            }
            warn!("Item metadata fetch for {} failed: {}", identifier, e);
            if self.budgets.allows_error_retry(counters.attempts) {
                self.requeue_delete(&identifier, link_guid, counters.another_attempt())
                    .await?;
            } else {
                self.budgets.log_exhausted(&format!(
                    "Not retrying IA deletion task for {} (IA Item {}): error retry maximum reached.",
                    link_guid, identifier
                ));
            }
            return Ok(());
        }

        if let Err(e) = self
            .client
            .delete_file(&identifier, &warc_filename(link_guid))
            .await
        {
            match e.class {
                ArchiveErrorClass::RateLimited => {
                    warn!(
                        "Deletion task for {} (IA Item {}) prevented by rate-limiting. Will retry if allowed.",
                        link_guid, identifier
                    );
                    if self.budgets.allows_rate_limit_retry(counters.attempts) {
                        self.requeue_delete(&identifier, link_guid, counters.another_attempt())
                            .await?;
                    } else {
                        self.budgets.log_exhausted(&format!(
                            "Not retrying IA deletion task for {} (IA Item {}): rate limit retry maximum reached.",
                            link_guid, identifier
                        ));
                    }
                }
                // every other failure class of the delete call itself
                // draws on the error budget
                _ => {
                    warn!(
                        "Deletion task for {} (IA Item {}) encountered an unexpected error ({}). Will retry if allowed.",
                        link_guid,
                        identifier,
                        e.message.trim()
                    );
                    if self.budgets.allows_error_retry(counters.attempts) {
                        self.requeue_delete(&identifier, link_guid, counters.another_attempt())
                            .await?;
                    } else {
                        self.budgets.log_exhausted(&format!(
                            "Not retrying IA deletion task for {} (IA Item {}): error retry maximum reached.",
                            link_guid, identifier
                        ));
                    }
                }
            }
            return Ok(());
        }

        self.store
            .set_file_status(file.id, FileStatus::DeletionSubmitted)
            .await?;
        info!(
            "Requested deletion of {} from {}: confirmation pending.",
            link_guid, identifier
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Capture;
    use crate::storage::{DbLinkStore, FileBlobStore};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Rig {
        engine: ReplicationEngine,
        store: Arc<DbLinkStore>,
        queues: ReplicationQueues,
        receivers: super::super::queues::ReplicationQueueReceivers,
        _blob_dir: tempfile::TempDir,
    }

    async fn rig(server: &MockServer, mut config: ReplicationConfig) -> Rig {
        let _ = env_logger::builder().is_test(true).try_init();
        config.endpoint = server.uri();
        config.metadata_endpoint = format!("{}/metadata", server.uri());
        config.access_key = "ak".to_string();
        config.secret_key = "sk".to_string();

        let blob_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DbLinkStore::new_in_memory().await.unwrap());
        let blobs = Arc::new(FileBlobStore::new(blob_dir.path()).unwrap());
        let client = ArchiveSession::new(
            &config.endpoint,
            &config.metadata_endpoint,
            &config.access_key,
            &config.secret_key,
        )
        .unwrap();
        let (queues, receivers) = super::super::queues::replication_queues();
        let engine = ReplicationEngine::new(
            config,
            store.clone(),
            blobs.clone(),
            client,
            queues.clone(),
        );

        Rig {
            engine,
            store,
            queues,
            receivers,
            _blob_dir: blob_dir,
        }
    }

    async fn seed_uploadable_link(rig: &Rig) -> Link {
        let link = Link::new("http://example.test/");
        rig.store.create_link(&link).await.unwrap();
        rig.store
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
        // the blob store holds the finished warc
        let blobs = FileBlobStore::new(rig._blob_dir.path()).unwrap();
        blobs
            .write(&link.warc_storage_file(), b"warc bytes")
            .await
            .unwrap();
        link
    }

    fn mock_quiet_load_info(server: &MockServer) -> impl std::future::Future<Output = ()> + '_ {
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("check_limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "over_limit": 0,
                "detail": {}
            })))
            .mount(server)
    }

    fn mock_empty_item<'a>(server: &'a MockServer, identifier: &'a str) -> impl std::future::Future<Output = ()> + 'a {
        Mock::given(method("GET"))
            .and(path(format!("/metadata/{}", identifier)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(server)
    }

    /// Drain one re-queued upload task and return its counters.
    fn pop_upload(rig: &mut Rig) -> Option<RetryCounters> {
        match rig.receivers.write_rx.try_recv().ok()? {
            ReplicationTask::Upload { counters, .. } => {
                rig.receivers.task_done_write();
                Some(counters)
            }
            other => panic!("unexpected task {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limited_uploads_retry_until_success() {
        let server = MockServer::start().await;
        let mut rig = rig(&server, ReplicationConfig::default()).await;
        let link = seed_uploadable_link(&rig).await;
        let date = link.created_at.date_naive();
        let identifier = daily_identifier("daily_perma_cc", date);

        mock_quiet_load_info(&server).await;
        mock_empty_item(&server, &identifier).await;
        // three rate-limited attempts, then success
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(503).set_body_string("Please reduce your request rate."),
            )
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut counters = RetryCounters::default();
        for round in 0..4 {
            rig.engine.upload_link(link.guid, counters).await.unwrap();
            match pop_upload(&mut rig) {
                Some(next) => counters = next,
                None => {
                    assert_eq!(round, 3, "success only on the fourth attempt");
                    break;
                }
            }
        }
        assert_eq!(counters.attempts, 3);

        let file = rig
            .store
            .get_file(&identifier, link.guid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status, FileStatus::UploadSubmitted);

        // increment/decrement paired across the three re-queues; the
        // final successful attempt stays tracked for confirmation
        let item = rig.store.get_item(&identifier).await.unwrap().unwrap();
        assert_eq!(item.tasks_in_progress, 1);
    }

    #[tokio::test]
    async fn concurrent_creation_race_retries_without_spending_budget() {
        let server = MockServer::start().await;
        let mut rig = rig(&server, ReplicationConfig::default()).await;
        let link = seed_uploadable_link(&rig).await;
        let identifier = daily_identifier("daily_perma_cc", link.created_at.date_naive());

        mock_quiet_load_info(&server).await;
        mock_empty_item(&server, &identifier).await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("The bucket namespace is shared"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        rig.engine
            .upload_link(link.guid, RetryCounters::default())
            .await
            .unwrap();
        let counters = pop_upload(&mut rig).expect("race re-queues the task");
        assert_eq!(counters.attempts, 0, "no budget consumed");

        rig.engine.upload_link(link.guid, counters).await.unwrap();
        assert!(pop_upload(&mut rig).is_none());
        let file = rig
            .store
            .get_file(&identifier, link.guid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status, FileStatus::UploadSubmitted);
    }

    #[tokio::test]
    async fn exhausted_rate_budget_leaves_status_in_place() {
        let server = MockServer::start().await;
        let mut config = ReplicationConfig::default();
        config.retry_for_ratelimiting_limit = 2;
        let mut rig = rig(&server, config).await;
        let link = seed_uploadable_link(&rig).await;
        let identifier = daily_identifier("daily_perma_cc", link.created_at.date_naive());

        mock_quiet_load_info(&server).await;
        mock_empty_item(&server, &identifier).await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(503).set_body_string("Please reduce your request rate."),
            )
            .mount(&server)
            .await;

        let mut counters = RetryCounters::default();
        rig.engine.upload_link(link.guid, counters).await.unwrap();
        counters = pop_upload(&mut rig).unwrap();
        rig.engine.upload_link(link.guid, counters).await.unwrap();
        // budget (2) exhausted: nothing re-queued, status stays attempted
        assert!(pop_upload(&mut rig).is_none());
        let file = rig
            .store
            .get_file(&identifier, link.guid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status, FileStatus::UploadAttempted);
    }

    #[tokio::test]
    async fn deletion_attempt_during_upload_needs_a_human() {
        let server = MockServer::start().await;
        let rig = rig(&server, ReplicationConfig::default()).await;
        let link = seed_uploadable_link(&rig).await;
        let date = link.created_at.date_naive();
        let identifier = daily_identifier("daily_perma_cc", date);
        rig.store
            .get_or_create_item(&InternetArchiveItem::for_date("daily_perma_cc", date))
            .await
            .unwrap();
        rig.store
            .create_file(&InternetArchiveFile::new(
                identifier.clone(),
                link.guid,
                FileStatus::DeletionSubmitted,
            ))
            .await
            .unwrap();

        rig.engine
            .upload_link(link.guid, RetryCounters::default())
            .await
            .unwrap();

        // skipped entirely: no tracking, no status change
        let file = rig
            .store
            .get_file(&identifier, link.guid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status, FileStatus::DeletionSubmitted);
        let item = rig.store.get_item(&identifier).await.unwrap().unwrap();
        assert_eq!(item.tasks_in_progress, 0);
    }

    #[tokio::test]
    async fn delete_transitions_to_deletion_submitted() {
        let server = MockServer::start().await;
        let mut rig = rig(&server, ReplicationConfig::default()).await;
        let link = seed_uploadable_link(&rig).await;
        let date = link.created_at.date_naive();
        let identifier = daily_identifier("daily_perma_cc", date);
        rig.store
            .get_or_create_item(&InternetArchiveItem::for_date("daily_perma_cc", date))
            .await
            .unwrap();
        rig.store
            .create_file(&InternetArchiveFile::new(
                identifier.clone(),
                link.guid,
                FileStatus::ConfirmedPresent,
            ))
            .await
            .unwrap();

        mock_quiet_load_info(&server).await;
        mock_empty_item(&server, &identifier).await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        rig.engine
            .delete_link(link.guid, RetryCounters::default())
            .await
            .unwrap();

        let file = rig
            .store
            .get_file(&identifier, link.guid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status, FileStatus::DeletionSubmitted);
        // still tracked until the confirmation poller closes the loop
        let item = rig.store.get_item(&identifier).await.unwrap().unwrap();
        assert_eq!(item.tasks_in_progress, 1);
        assert!(rig.queues.write_depth() == 0);
    }

    #[tokio::test]
    async fn ineligible_link_is_skipped_before_any_tracking() {
        let server = MockServer::start().await;
        let rig = rig(&server, ReplicationConfig::default()).await;
        let mut link = Link::new("http://example.test/");
        link.is_private = true;
        rig.store.create_link(&link).await.unwrap();

        rig.engine
            .upload_link(link.guid, RetryCounters::default())
            .await
            .unwrap();
        assert_eq!(rig.store.total_tasks_in_progress().await.unwrap(), 0);
    }
}
