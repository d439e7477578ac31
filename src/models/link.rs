use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a link was flipped to private.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivateReason {
    /// robots.txt, x-robots-tag or a meta tag forbids archiving.
    Policy,
    /// Metadata analysis failed and the deployment is configured to hide
    /// such links.
    Failure,
    /// The owner asked for it.
    User,
}

impl PrivateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivateReason::Policy => "policy",
            PrivateReason::Failure => "failure",
            PrivateReason::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "policy" => Some(PrivateReason::Policy),
            "failure" => Some(PrivateReason::Failure),
            "user" => Some(PrivateReason::User),
            _ => None,
        }
    }
}

/// One archival request. At most one primary capture per link; the
/// screenshot and favicon captures are optional companions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub guid: Uuid,
    pub submitted_url: String,
    pub created_at: DateTime<Utc>,
    pub submitted_title: String,
    pub submitted_description: String,
    pub is_private: bool,
    pub private_reason: Option<PrivateReason>,
    pub warc_size: Option<u64>,
    pub cached_can_play_back: Option<bool>,
    pub user_deleted: bool,
    pub tags: Vec<String>,
}

impl Link {
    pub fn new(submitted_url: impl Into<String>) -> Self {
        let submitted_url = submitted_url.into();
        Self {
            guid: Uuid::new_v4(),
            submitted_title: submitted_url.clone(),
            submitted_description: String::new(),
            submitted_url,
            created_at: Utc::now(),
            is_private: false,
            private_reason: None,
            warc_size: None,
            cached_can_play_back: None,
            user_deleted: false,
            tags: Vec::new(),
        }
    }

    /// Title assigned at submission time when the user supplied none.
    /// A differing title was user-chosen and must survive the capture.
    pub fn default_title(&self) -> String {
        self.submitted_url.clone()
    }

    /// Blob-store path of the finished archive.
    pub fn warc_storage_file(&self) -> String {
        format!("warcs/{}.warc.gz", self.guid)
    }

    /// Host portion of the submitted URL, for user-agent and upstream-proxy
    /// decisions.
    pub fn netloc(&self) -> String {
        url::Url::parse(&self.submitted_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureRole {
    Primary,
    Screenshot,
    Favicon,
}

impl CaptureRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureRole::Primary => "primary",
            CaptureRole::Screenshot => "screenshot",
            CaptureRole::Favicon => "favicon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureStatus {
    Pending,
    Success,
    Failed,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Success => "success",
            CaptureStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CaptureStatus::Pending),
            "success" => Some(CaptureStatus::Success),
            "failed" => Some(CaptureStatus::Failed),
            _ => None,
        }
    }
}

/// One artifact recorded for a link (the page itself, its screenshot, or
/// its favicon).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub link_guid: Uuid,
    pub role: CaptureRole,
    pub status: CaptureStatus,
    /// `response` for proxied traffic, `resource` for synthesized records.
    pub record_type: String,
    pub url: String,
    pub content_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_link_title_defaults_to_url() {
        let link = Link::new("http://example.test/page");
        assert_eq!(link.submitted_title, link.default_title());
        assert!(!link.is_private);
    }

    #[test]
    fn warc_storage_path_uses_guid() {
        let link = Link::new("http://example.test/");
        assert_eq!(
            link.warc_storage_file(),
            format!("warcs/{}.warc.gz", link.guid)
        );
    }

    #[test]
    fn netloc_extracts_host() {
        let link = Link::new("https://www.example.test:8443/a/b?c=d");
        assert_eq!(link.netloc(), "www.example.test");
    }
}
