//! The LinkStore trait: everything the capture and replication engines need
//! from the database, and nothing else.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error_handling::types::StorageError;
use crate::models::{
    Capture, CaptureJob, CaptureRole, CaptureStatus, FileStatus, InternetArchiveFile,
    InternetArchiveItem, Link, PrivateReason,
};

/// Database contract shared by the capture orchestrator, the replication
/// state machine and the schedulers.
///
/// Mutators update only the named columns so concurrent writers touching
/// other fields of the same row are not stepped on.
#[async_trait]
pub trait LinkStore: Send + Sync {
    // -- links -----------------------------------------------------------

    async fn create_link(&self, link: &Link) -> Result<(), StorageError>;

    async fn get_link(&self, guid: Uuid) -> Result<Link, StorageError>;

    async fn set_link_private(
        &self,
        guid: Uuid,
        reason: PrivateReason,
    ) -> Result<(), StorageError>;

    async fn set_link_title(&self, guid: Uuid, title: &str) -> Result<(), StorageError>;

    async fn set_link_description(&self, guid: Uuid, description: &str)
        -> Result<(), StorageError>;

    async fn set_link_warc_size(&self, guid: Uuid, size: u64) -> Result<(), StorageError>;

    async fn add_link_tag(&self, guid: Uuid, tag: &str) -> Result<(), StorageError>;

    // -- captures --------------------------------------------------------

    async fn create_capture(&self, capture: &Capture) -> Result<(), StorageError>;

    async fn get_capture(
        &self,
        guid: Uuid,
        role: CaptureRole,
    ) -> Result<Option<Capture>, StorageError>;

    async fn set_capture_status(
        &self,
        guid: Uuid,
        role: CaptureRole,
        status: CaptureStatus,
    ) -> Result<(), StorageError>;

    async fn set_capture_content_type(
        &self,
        guid: Uuid,
        role: CaptureRole,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Flip every still-pending capture of the link to failed.
    async fn mark_pending_captures_failed(&self, guid: Uuid) -> Result<u64, StorageError>;

    // -- capture jobs ----------------------------------------------------

    async fn create_job(&self, link_guid: Uuid) -> Result<CaptureJob, StorageError>;

    /// Mark in-progress jobs started before `stale_before` as failed, along
    /// with their links' pending captures, tagging each link
    /// `hard-timeout-failure`. Returns how many jobs were reclaimed.
    async fn reclaim_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// Atomically reserve the next pending job: flip it to in-progress and
    /// stamp its start time.
    async fn reserve_next_job(&self) -> Result<Option<CaptureJob>, StorageError>;

    async fn update_job_progress(
        &self,
        job_id: i64,
        step_count: f32,
        step_description: &str,
    ) -> Result<(), StorageError>;

    async fn set_job_attempt(&self, job_id: i64, attempt: u32) -> Result<(), StorageError>;

    async fn set_job_status(&self, job_id: i64, status: crate::models::JobStatus)
        -> Result<(), StorageError>;

    async fn get_job(&self, job_id: i64) -> Result<CaptureJob, StorageError>;

    // -- archive items ---------------------------------------------------

    async fn get_or_create_item(
        &self,
        item: &InternetArchiveItem,
    ) -> Result<InternetArchiveItem, StorageError>;

    async fn get_item(
        &self,
        identifier: &str,
    ) -> Result<Option<InternetArchiveItem>, StorageError>;

    async fn update_item(&self, item: &InternetArchiveItem) -> Result<(), StorageError>;

    /// Apply a delta to `tasks_in_progress`; negative deltas are floored at
    /// zero when `floored` is set.
    async fn adjust_tasks_in_progress(
        &self,
        identifier: &str,
        delta: i64,
        floored: bool,
    ) -> Result<(), StorageError>;

    /// Sum of `tasks_in_progress` over every item.
    async fn total_tasks_in_progress(&self) -> Result<i64, StorageError>;

    async fn mark_item_complete(&self, identifier: &str) -> Result<(), StorageError>;

    /// Span-start date of the oldest item not yet marked complete.
    async fn oldest_incomplete_item_date(&self) -> Result<Option<NaiveDate>, StorageError>;

    // -- archive files ---------------------------------------------------

    async fn create_file(
        &self,
        file: &InternetArchiveFile,
    ) -> Result<InternetArchiveFile, StorageError>;

    async fn get_file(
        &self,
        item_id: &str,
        link_guid: Uuid,
    ) -> Result<Option<InternetArchiveFile>, StorageError>;

    /// The link's file row regardless of item (a link lives in exactly one
    /// daily item).
    async fn get_file_for_link(
        &self,
        link_guid: Uuid,
    ) -> Result<Option<InternetArchiveFile>, StorageError>;

    async fn get_file_by_id(&self, id: i64) -> Result<InternetArchiveFile, StorageError>;

    async fn set_file_status(&self, id: i64, status: FileStatus) -> Result<(), StorageError>;

    /// Persist a status transition together with its paired
    /// `tasks_in_progress` delta, in one transaction, so the transition is
    /// never observable without the accounting.
    async fn transition_file(
        &self,
        file: &InternetArchiveFile,
        tasks_delta: i64,
        floored: bool,
    ) -> Result<(), StorageError>;

    /// Files sitting in `status`, excluding the given item identifiers.
    async fn files_with_status(
        &self,
        status: FileStatus,
        exclude_items: &[String],
        limit: u64,
    ) -> Result<Vec<InternetArchiveFile>, StorageError>;

    // -- scheduler queries -----------------------------------------------

    /// Links created on `date` that are eligible for upload and have no
    /// file row in the day's item yet.
    async fn links_pending_upload(
        &self,
        prefix: &str,
        date: NaiveDate,
        limit: u64,
    ) -> Result<Vec<Uuid>, StorageError>;

    /// Links no longer eligible for the external archive whose file is
    /// still (or about to be) present there.
    async fn links_pending_deletion(&self, limit: u64) -> Result<Vec<Uuid>, StorageError>;
}
