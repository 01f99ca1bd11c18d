//! Leader↔follower wire protocol bodies (JSON over HTTP, auth header on every call).

use serde::{Deserialize, Serialize};

use crate::store::types::{EncoderCommand, JobId};

/// `POST /worker/execute` request (leader → follower).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerExecuteRequest {
    pub job_id: JobId,
    pub job_name: String,
    pub input_file: String,
    pub output_file: String,
    pub ffmpeg_command: EncoderCommand,
}

/// `POST /worker/execute` response, sent when the encode finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerExecuteResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_stderr: Option<String>,
}

/// `POST /worker/cancel/:jobId` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCancelResponse {
    pub cancelled: bool,
}

/// One in-flight job as reported by `GET /worker/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub job_id: JobId,
    pub progress: f64,
}

/// `GET /worker/status` response (follower → leader).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusResponse {
    pub worker_id: String,
    pub busy: bool,
    pub active_jobs: Vec<ActiveJob>,
}

/// Acknowledgement for the progress callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}
