use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    /// The link was deleted by its owner before the job ran.
    Deleted,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Deleted => "deleted",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "deleted" => Some(JobStatus::Deleted),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Queue entry for one link capture. Progress is a free-running step
/// counter plus a human-readable description, surfaced to the user while
/// the capture runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureJob {
    pub id: i64,
    pub link_guid: Uuid,
    pub status: JobStatus,
    pub attempt: u32,
    pub capture_start_time: Option<DateTime<Utc>>,
    pub step_count: f32,
    pub step_description: String,
}

impl CaptureJob {
    pub fn new(link_guid: Uuid) -> Self {
        Self {
            id: 0,
            link_guid,
            status: JobStatus::Pending,
            attempt: 0,
            capture_start_time: None,
            step_count: 0.0,
            step_description: String::new(),
        }
    }

    /// Advance the progress counter and replace the description.
    pub fn inc_progress(&mut self, inc: f32, description: &str) {
        self.step_count += inc;
        self.step_description = description.to_string();
    }
}
