//! Confirmation of uploads and deletions against external metadata.
//!
//! The external service processes writes asynchronously: a success code
//! from the S3-like API only means "submitted". These polls compare the
//! item's reported metadata with what we expect and flip files to their
//! confirmed states, closing the `tasks_in_progress` loop opened by the
//! state machine.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{info, warn};

use crate::configuration::types::ReplicationConfig;
use crate::error_handling::types::{ArchiveErrorClass, ReplicationError};
use crate::models::archive::{daily_identifier, remove_whitespace, standard_file_metadata, warc_filename};
use crate::models::FileStatus;
use crate::storage::LinkStore;

use super::budgets::{RetryBudgets, RetryCounters};
use super::client::{ArchiveSession, RemoteItem};
use super::queues::{ReplicationQueues, ReplicationTask};

pub struct ConfirmationPoller {
    config: ReplicationConfig,
    budgets: RetryBudgets,
    store: Arc<dyn LinkStore>,
    client: ArchiveSession,
    queues: ReplicationQueues,
}

fn parse_external_datetime(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc)))
}

impl ConfirmationPoller {
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn LinkStore>,
        client: ArchiveSession,
        queues: ReplicationQueues,
    ) -> Self {
        Self {
            budgets: RetryBudgets::from_config(&config),
            config,
            store,
            client,
            queues,
        }
    }

    fn blocklisted_identifiers(&self) -> Vec<String> {
        self.config
            .date_blocklist
            .iter()
            .filter_map(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .map(|d| daily_identifier(&self.config.daily_identifier_prefix, d))
            .collect()
    }

    /// Queue a confirmation poll for every file whose upload has been
    /// submitted but not verified. Runs only when the read-only queue is
    /// idle, to avoid starving writes and hammering the metadata API.
    pub async fn queue_upload_confirmations(&self, limit: u64) -> Result<(), ReplicationError> {
        let depth = self.queues.readonly_depth();
        if depth > 0 {
            info!(
                "Skipped the queuing of file upload confirmation tasks: {} task(s) in the read-only queue.",
                depth
            );
            return Ok(());
        }
        let files = self
            .store
            .files_with_status(FileStatus::UploadSubmitted, &self.blocklisted_identifiers(), limit)
            .await?;
        let queued = files.len();
        for file in files {
            self.queues.push_readonly(ReplicationTask::ConfirmUpload {
                file_id: file.id,
                counters: RetryCounters::default(),
            });
        }
        info!("Queued the file upload confirmation task for {} archive file(s).", queued);
        Ok(())
    }

    pub async fn queue_delete_confirmations(&self, limit: u64) -> Result<(), ReplicationError> {
        let depth = self.queues.readonly_depth();
        if depth > 0 {
            info!(
                "Skipped the queuing of file deleted confirmation tasks: {} task(s) in the read-only queue.",
                depth
            );
            return Ok(());
        }
        let files = self
            .store
            .files_with_status(FileStatus::DeletionSubmitted, &self.blocklisted_identifiers(), limit)
            .await?;
        let queued = files.len();
        for file in files {
            self.queues.push_readonly(ReplicationTask::ConfirmDelete {
                file_id: file.id,
                counters: RetryCounters::default(),
            });
        }
        info!("Queued the file deleted confirmation task for {} archive file(s).", queued);
        Ok(())
    }

    async fn fetch_item(
        &self,
        identifier: &str,
    ) -> Result<Option<RemoteItem>, ReplicationError> {
        match self.client.get_item(identifier).await {
            Ok(item) => Ok(Some(item)),
            Err(e) if e.class == ArchiveErrorClass::Connection => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Has the submitted upload landed, with every expected metadata key
    /// visible on the external side?
    pub async fn confirm_upload(
        &self,
        file_id: i64,
        counters: RetryCounters,
    ) -> Result<(), ReplicationError> {
        let mut file = self.store.get_file_by_id(file_id).await?;
        if file.status == FileStatus::ConfirmedPresent {
            info!(
                "Archive file {} ({}) already confirmed to be uploaded to {}.",
                file_id, file.link_guid, file.item_id
            );
            return Ok(());
        }
        let link = self.store.get_link(file.link_guid).await?;

        let Some(remote_item) = self.fetch_item(&file.item_id).await? else {
            if self.budgets.allows_connection_retry(counters.connection_errors) {
                self.queues.push_readonly(ReplicationTask::ConfirmUpload {
                    file_id,
                    counters: counters.another_connection_error(),
                });
                info!(
                    "Re-queued upload confirmation for archive file {} ({}) after a connection error.",
                    file_id, file.link_guid
                );
            }
            return Ok(());
        };

        let key = warc_filename(file.link_guid);
        let Some(remote_file) = remote_item.get_file(&key) else {
            // the service's tasks take a while; check again on the next
            // scheduled poll
            info!(
                "Submitted upload of {} to IA Item {} not yet confirmed.",
                file.link_guid, file.item_id
            );
            return Ok(());
        };

        let expected = standard_file_metadata(&link);
        for (k, v) in &expected {
            let reported = remote_file
                .metadata
                .get(k)
                .and_then(|x| x.as_str())
                .unwrap_or("");
            if remove_whitespace(reported) != remove_whitespace(v) {
                info!(
                    "Submitted upload of {} to IA Item {} not yet confirmed (expected {}: {}, got {}).",
                    file.link_guid, file.item_id, k, v, reported
                );
                return Ok(());
            }
        }

        // transition and the paired accounting commit together
        file.update_from_metadata(&remote_file.metadata);
        file.status = FileStatus::ConfirmedPresent;
        file.cached_size = remote_file.size;
        self.store.transition_file(&file, -1, true).await?;

        let Some(mut item) = self.store.get_item(&file.item_id).await? else {
            warn!("item row for {} vanished during confirmation", file.item_id);
            return Ok(());
        };
        // first confirmed upload: cache the item's own metadata locally
        if !item.confirmed_exists {
            item.confirmed_exists = true;
            item.added_date = remote_item
                .metadata
                .get("addeddate")
                .and_then(|v| v.as_str())
                .and_then(parse_external_datetime);
            item.cached_title = remote_item
                .metadata
                .get("title")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            item.cached_description = remote_item
                .metadata
                .get("description")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
        item.derive_required = true;
        item.cached_file_count = Some(remote_item.files_count);
        self.store.update_item(&item).await?;

        info!("Confirmed upload of {} to {}.", file.link_guid, file.item_id);
        Ok(())
    }

    /// Is the file really gone? Continued presence retries under the error
    /// budget; a confirmed absence zeroes the cache and needs no retries.
    pub async fn confirm_delete(
        &self,
        file_id: i64,
        counters: RetryCounters,
    ) -> Result<(), ReplicationError> {
        let mut file = self.store.get_file_by_id(file_id).await?;
        if file.status == FileStatus::ConfirmedAbsent {
            info!(
                "Archive file {} ({}) already confirmed absent from {}.",
                file_id, file.link_guid, file.item_id
            );
            return Ok(());
        }

        let Some(remote_item) = self.fetch_item(&file.item_id).await? else {
            if self.budgets.allows_connection_retry(counters.connection_errors) {
                self.queues.push_readonly(ReplicationTask::ConfirmDelete {
                    file_id,
                    counters: counters.another_connection_error(),
                });
                info!(
                    "Re-queued delete confirmation for archive file {} ({}) after a connection error.",
                    file_id, file.link_guid
                );
            }
            return Ok(());
        };

        let key = warc_filename(file.link_guid);
        if remote_item.get_file(&key).is_some() {
            // the deletion has not landed yet
            if self.budgets.allows_error_retry(counters.attempts) {
                self.queues.push_readonly(ReplicationTask::ConfirmDelete {
                    file_id,
                    counters: counters.another_attempt(),
                });
                info!(
                    "Re-queued delete confirmation for archive file {} ({}).",
                    file_id, file.link_guid
                );
            } else {
                self.budgets.log_exhausted(&format!(
                    "Not retrying delete confirmation for {} (IA Item {}, File {}): error retry maximum reached.",
                    file_id, file.item_id, file.link_guid
                ));
            }
            return Ok(());
        }

        file.zero_cached_metadata();
        file.status = FileStatus::ConfirmedAbsent;
        self.store.transition_file(&file, -1, true).await?;

        if let Some(mut item) = self.store.get_item(&file.item_id).await? {
            item.derive_required = true;
            item.cached_file_count = Some(remote_item.files_count);
            self.store.update_item(&item).await?;
        }

        info!("Confirmed deletion of {} from {}.", file.link_guid, file.item_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capture, CaptureRole, CaptureStatus, InternetArchiveFile, InternetArchiveItem, Link};
    use crate::storage::DbLinkStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Rig {
        poller: ConfirmationPoller,
        store: Arc<DbLinkStore>,
        queues: ReplicationQueues,
        receivers: super::super::queues::ReplicationQueueReceivers,
    }

    async fn rig(server: &MockServer) -> Rig {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = ReplicationConfig::default();
        config.endpoint = server.uri();
        config.metadata_endpoint = format!("{}/metadata", server.uri());
        let store = Arc::new(DbLinkStore::new_in_memory().await.unwrap());
        let client =
            ArchiveSession::new(&config.endpoint, &config.metadata_endpoint, "ak", "sk").unwrap();
        let (queues, receivers) = super::super::queues::replication_queues();
        let poller = ConfirmationPoller::new(config, store.clone(), client, queues.clone());
        Rig {
            poller,
            store,
            queues,
            receivers,
        }
    }

    async fn seed_submitted_file(rig: &Rig, status: FileStatus) -> (Link, InternetArchiveFile) {
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
        let date = link.created_at.date_naive();
        let item = InternetArchiveItem::for_date("daily_perma_cc", date);
        rig.store.get_or_create_item(&item).await.unwrap();
        // the state machine left the attempt tracked
        rig.store
            .adjust_tasks_in_progress(&item.identifier, 1, false)
            .await
            .unwrap();
        let file = rig
            .store
            .create_file(&InternetArchiveFile::new(
                item.identifier.clone(),
                link.guid,
                status,
            ))
            .await
            .unwrap();
        (link, file)
    }

    fn remote_metadata_body(link: &Link, extra_whitespace: bool) -> serde_json::Value {
        let expected = standard_file_metadata(link);
        let mut file = serde_json::Map::new();
        file.insert(
            "name".to_string(),
            serde_json::Value::String(warc_filename(link.guid)),
        );
        file.insert("size".to_string(), serde_json::json!(4096));
        for (k, v) in expected {
            let v = if extra_whitespace {
                format!(" {} ", v.replace(' ', "  "))
            } else {
                v
            };
            file.insert(k, serde_json::Value::String(v));
        }
        serde_json::json!({
            "metadata": {
                "addeddate": "2024-03-07 10:11:12",
                "title": "Perma.cc archives",
                "description": "captured pages"
            },
            "files": [file],
            "files_count": 1
        })
    }

    #[tokio::test]
    async fn upload_confirmation_caches_metadata_and_settles_accounting() {
        let server = MockServer::start().await;
        let rig = rig(&server).await;
        let (link, file) = seed_submitted_file(&rig, FileStatus::UploadSubmitted).await;

        // whitespace differences are ignored during comparison
        Mock::given(method("GET"))
            .and(path(format!("/metadata/{}", file.item_id)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(remote_metadata_body(&link, true)),
            )
            .mount(&server)
            .await;

        rig.poller
            .confirm_upload(file.id, RetryCounters::default())
            .await
            .unwrap();

        let confirmed = rig.store.get_file_by_id(file.id).await.unwrap();
        assert_eq!(confirmed.status, FileStatus::ConfirmedPresent);
        assert_eq!(confirmed.cached_size, Some(4096));
        assert!(confirmed.cached_external_identifier.is_some());

        let item = rig.store.get_item(&file.item_id).await.unwrap().unwrap();
        assert!(item.confirmed_exists);
        assert!(item.derive_required);
        assert_eq!(item.cached_file_count, Some(1));
        assert!(item.added_date.is_some());
        assert_eq!(item.tasks_in_progress, 0);
    }

    #[tokio::test]
    async fn missing_file_leaves_status_for_the_next_poll() {
        let server = MockServer::start().await;
        let rig = rig(&server).await;
        let (_link, file) = seed_submitted_file(&rig, FileStatus::UploadSubmitted).await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {}, "files": [], "files_count": 0
            })))
            .mount(&server)
            .await;

        rig.poller
            .confirm_upload(file.id, RetryCounters::default())
            .await
            .unwrap();

        let unchanged = rig.store.get_file_by_id(file.id).await.unwrap();
        assert_eq!(unchanged.status, FileStatus::UploadSubmitted);
        // no re-queue: the next scheduled poll will find it
        assert_eq!(rig.queues.readonly_depth(), 0);
        // the tracked task stays open
        let item = rig.store.get_item(&file.item_id).await.unwrap().unwrap();
        assert_eq!(item.tasks_in_progress, 1);
    }

    #[tokio::test]
    async fn connection_errors_requeue_under_their_own_budget() {
        let server = MockServer::start().await;
        let mut rig = rig(&server).await;
        let (_link, file) = seed_submitted_file(&rig, FileStatus::UploadSubmitted).await;
        // point the poller at a dead endpoint
        drop(server);

        rig.poller
            .confirm_upload(file.id, RetryCounters::default())
            .await
            .unwrap();

        match rig.receivers.readonly_rx.try_recv().unwrap() {
            ReplicationTask::ConfirmUpload { counters, .. } => {
                assert_eq!(counters.connection_errors, 1);
            }
            other => panic!("unexpected task {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_confirmation_zeroes_cache_when_file_is_gone() {
        let server = MockServer::start().await;
        let rig = rig(&server).await;
        let (_link, mut file) = seed_submitted_file(&rig, FileStatus::DeletionSubmitted).await;
        file.cached_size = Some(4096);
        file.cached_title = Some("old".to_string());
        rig.store.transition_file(&file, 0, false).await.unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {}, "files": [], "files_count": 0
            })))
            .mount(&server)
            .await;

        rig.poller
            .confirm_delete(file.id, RetryCounters::default())
            .await
            .unwrap();

        let confirmed = rig.store.get_file_by_id(file.id).await.unwrap();
        assert_eq!(confirmed.status, FileStatus::ConfirmedAbsent);
        assert!(confirmed.cached_size.is_none());
        assert!(confirmed.cached_title.is_none());
        let item = rig.store.get_item(&file.item_id).await.unwrap().unwrap();
        assert_eq!(item.tasks_in_progress, 0);
        assert!(item.derive_required);
    }

    #[tokio::test]
    async fn lingering_file_retries_deletion_confirmation_under_error_budget() {
        let server = MockServer::start().await;
        let mut rig = rig(&server).await;
        let (link, file) = seed_submitted_file(&rig, FileStatus::DeletionSubmitted).await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(remote_metadata_body(&link, false)),
            )
            .mount(&server)
            .await;

        rig.poller
            .confirm_delete(file.id, RetryCounters::default())
            .await
            .unwrap();

        match rig.receivers.readonly_rx.try_recv().unwrap() {
            ReplicationTask::ConfirmDelete { counters, .. } => {
                assert_eq!(counters.attempts, 1);
            }
            other => panic!("unexpected task {:?}", other),
        }
        let unchanged = rig.store.get_file_by_id(file.id).await.unwrap();
        assert_eq!(unchanged.status, FileStatus::DeletionSubmitted);
    }

    #[tokio::test]
    async fn confirmation_queuing_waits_for_an_idle_readonly_queue() {
        let server = MockServer::start().await;
        let rig = rig(&server).await;
        let (_link, _file) = seed_submitted_file(&rig, FileStatus::UploadSubmitted).await;

        // something is already queued: do not pile on
        rig.queues.push_readonly(ReplicationTask::ConfirmUpload {
            file_id: 999,
            counters: RetryCounters::default(),
        });
        rig.poller.queue_upload_confirmations(100).await.unwrap();
        assert_eq!(rig.queues.readonly_depth(), 1);
    }
}
