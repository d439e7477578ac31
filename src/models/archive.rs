//! Daily-item bookkeeping for the external archive.
//!
//! A daily item is the bucket holding every WARC for links created on one
//! UTC day. Files track each link's presence in its item through a pair of
//! monotonic status paths (upload and deletion) that only alternate through
//! confirmed terminal states.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::link::Link;

/// `{prefix}_{YYYY-MM-DD}`
pub fn daily_identifier(prefix: &str, date: NaiveDate) -> String {
    format!("{}_{}", prefix, date.format("%Y-%m-%d"))
}

/// Key of a link's archive file inside its item.
pub fn warc_filename(guid: Uuid) -> String {
    format!("archive-{}.warc.gz", guid)
}

/// The external side normalizes whitespace idiosyncratically; comparisons
/// of expected vs. reported metadata ignore it entirely.
pub fn remove_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Item-level metadata sent with the first upload that creates the bucket.
pub fn standard_item_metadata(prefix: &str, date: NaiveDate) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("collection".to_string(), prefix.to_string());
    metadata.insert("mediatype".to_string(), "web".to_string());
    metadata.insert("date".to_string(), date.format("%Y-%m-%d").to_string());
    metadata.insert(
        "title".to_string(),
        format!("Perma.cc archives created on {}", date.format("%Y-%m-%d")),
    );
    metadata
}

/// File-level metadata for one link, also the dictionary checked key-by-key
/// during upload confirmation.
pub fn standard_file_metadata(link: &Link) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("title".to_string(), link.submitted_title.clone());
    metadata.insert("submitted-url".to_string(), link.submitted_url.clone());
    metadata.insert(
        "perma-url".to_string(),
        format!("https://perma.cc/{}", link.guid),
    );
    metadata.insert(
        "external-identifier".to_string(),
        format!("urn:X-perma:{}", link.guid),
    );
    metadata.insert("format".to_string(), "Web ARChive GZ".to_string());
    metadata
}

/// A daily bucket in the external archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternetArchiveItem {
    pub identifier: String,
    pub span_start: DateTime<Utc>,
    pub span_end: DateTime<Utc>,
    /// Set once the first file upload has been confirmed.
    pub confirmed_exists: bool,
    /// The external service must re-derive this item because its contents
    /// changed since the last derive.
    pub derive_required: bool,
    /// Every eligible link of this day has been scheduled; nothing pending.
    pub complete: bool,
    /// In-flight upload/delete/confirm tasks touching this item.
    pub tasks_in_progress: i64,
    pub added_date: Option<DateTime<Utc>>,
    pub cached_title: Option<String>,
    pub cached_description: Option<String>,
    pub cached_file_count: Option<i64>,
}

impl InternetArchiveItem {
    pub fn for_date(prefix: &str, date: NaiveDate) -> Self {
        let span_start = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists")
            .and_utc();
        let span_end = span_start + chrono::Duration::days(1);
        Self {
            identifier: daily_identifier(prefix, date),
            span_start,
            span_end,
            confirmed_exists: false,
            derive_required: false,
            complete: false,
            tasks_in_progress: 0,
            added_date: None,
            cached_title: None,
            cached_description: None,
            cached_file_count: None,
        }
    }
}

/// One link's presence in one daily item.
///
/// Transitions walk the upload path (`UploadAttempted → UploadSubmitted →
/// ConfirmedPresent`) or the deletion path (`DeletionAttempted →
/// DeletionSubmitted → ConfirmedAbsent`); crossing from one path to the
/// other is only legal from a confirmed terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    UploadAttempted,
    UploadSubmitted,
    ConfirmedPresent,
    DeletionAttempted,
    DeletionSubmitted,
    ConfirmedAbsent,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::UploadAttempted => "upload_attempted",
            FileStatus::UploadSubmitted => "upload_submitted",
            FileStatus::ConfirmedPresent => "confirmed_present",
            FileStatus::DeletionAttempted => "deletion_attempted",
            FileStatus::DeletionSubmitted => "deletion_submitted",
            FileStatus::ConfirmedAbsent => "confirmed_absent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "upload_attempted" => Some(FileStatus::UploadAttempted),
            "upload_submitted" => Some(FileStatus::UploadSubmitted),
            "confirmed_present" => Some(FileStatus::ConfirmedPresent),
            "deletion_attempted" => Some(FileStatus::DeletionAttempted),
            "deletion_submitted" => Some(FileStatus::DeletionSubmitted),
            "confirmed_absent" => Some(FileStatus::ConfirmedAbsent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternetArchiveFile {
    pub id: i64,
    pub item_id: String,
    pub link_guid: Uuid,
    pub status: FileStatus,
    pub cached_size: Option<i64>,
    pub cached_title: Option<String>,
    pub cached_comments: Option<String>,
    pub cached_external_identifier: Option<String>,
    pub cached_external_identifier_match_date: Option<DateTime<Utc>>,
    pub cached_format: Option<String>,
    pub cached_submitted_url: Option<String>,
    pub cached_perma_url: Option<String>,
}

impl InternetArchiveFile {
    pub fn new(item_id: String, link_guid: Uuid, status: FileStatus) -> Self {
        Self {
            id: 0,
            item_id,
            link_guid,
            status,
            cached_size: None,
            cached_title: None,
            cached_comments: None,
            cached_external_identifier: None,
            cached_external_identifier_match_date: None,
            cached_format: None,
            cached_submitted_url: None,
            cached_perma_url: None,
        }
    }

    /// Absorb the metadata the external service reports for this file.
    pub fn update_from_metadata(&mut self, metadata: &BTreeMap<String, Value>) {
        let text = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        self.cached_title = text("title");
        self.cached_comments = text("comments");
        self.cached_external_identifier = text("external-identifier");
        self.cached_format = text("format");
        self.cached_submitted_url = text("submitted-url");
        self.cached_perma_url = text("perma-url");
        if self.cached_external_identifier.is_some() {
            self.cached_external_identifier_match_date = Some(Utc::now());
        }
    }

    /// Forget everything cached from the external side (deletion confirmed).
    pub fn zero_cached_metadata(&mut self) {
        self.cached_size = None;
        self.cached_title = None;
        self.cached_comments = None;
        self.cached_external_identifier = None;
        self.cached_external_identifier_match_date = None;
        self.cached_format = None;
        self.cached_submitted_url = None;
        self.cached_perma_url = None;
    }
}
