//! Types used by the job store.

use serde::{Deserialize, Serialize};

/// Job identifier.
pub type JobId = i64;

/// High-level job status stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }

    /// Terminal statuses make up the "finished" listing section.
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Encoder invocation stored on the job row as opaque JSON.
///
/// `args` is the caller-supplied argv between the input and output paths; the
/// argument grammar itself is not interpreted here. `duration_seconds` is an
/// optional hint from the probing layer, used for time-based progress when the
/// total frame count is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderCommand {
    pub args: Vec<String>,
    pub input_path: String,
    pub output_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Full job row. Timestamps are ISO-8601 UTC (normalized at the read boundary).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub input_file: String,
    pub output_file: Option<String>,
    pub ffmpeg_command: EncoderCommand,
    pub status: JobStatus,
    pub progress: f64,
    pub queue_position: Option<i64>,
    pub total_frames: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub config_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_json: Option<serde_json::Value>,
    pub retried: bool,
    pub cleared: bool,
    pub assigned_worker: Option<String>,
    pub worker_last_seen: Option<String>,
}

/// Fields for inserting a new pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub input_file: String,
    pub output_file: Option<String>,
    pub command: EncoderCommand,
    pub queue_position: Option<i64>,
    pub total_frames: Option<i64>,
    pub config_key: Option<String>,
    pub config_json: Option<serde_json::Value>,
}

/// Partial update. Outer `Option` means "leave unchanged"; inner `Option`
/// (where present) writes NULL. `updated_at` is always bumped.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub output_file: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub started_at: Option<Option<String>>,
    pub ended_at: Option<Option<String>>,
    pub total_frames: Option<Option<i64>>,
    pub queue_position: Option<Option<i64>>,
    pub assigned_worker: Option<Option<String>>,
    pub worker_last_seen: Option<Option<String>>,
    pub retried: Option<bool>,
    pub cleared: Option<bool>,
}

/// Per-status totals for the dashboard badge row (cleared rows excluded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// One page of the default listing.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub has_more: bool,
    pub next_cursor: Option<crate::cursor::Cursor>,
}

/// Content-addressed configuration snapshot referenced by jobs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBlob {
    pub key: String,
    pub file_paths: Vec<String>,
    pub config_json: serde_json::Value,
    pub picker_state: Option<serde_json::Value>,
    pub created_at: String,
}

/// Bookkeeping for a multi-file submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreationBatch {
    pub id: i64,
    pub total_files: i64,
    pub created_count: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub config_key: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Convert a stored `YYYY-MM-DD HH:MM:SS` timestamp to ISO-8601 UTC.
/// Already-normalized input passes through unchanged.
pub fn normalize_timestamp(s: &str) -> String {
    let mut out = s.replacen(' ', "T", 1);
    if !out.ends_with('Z') {
        out.push('Z');
    }
    out
}

/// Inverse of [`normalize_timestamp`], for binding cursor values back into SQL.
pub fn denormalize_timestamp(s: &str) -> String {
    s.trim_end_matches('Z').replacen('T', " ", 1)
}

#[cfg(test)]
mod timestamp_tests {
    use super::*;

    #[test]
    fn normalize_roundtrip() {
        let raw = "2024-06-01 12:30:00";
        let iso = normalize_timestamp(raw);
        assert_eq!(iso, "2024-06-01T12:30:00Z");
        assert_eq!(denormalize_timestamp(&iso), raw);
        // Idempotent on already-normalized input.
        assert_eq!(normalize_timestamp(&iso), iso);
    }
}
