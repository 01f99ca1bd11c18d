//! Executor contract: run one job, stream progress, be killable.
//!
//! Two implementations share the contract: [`local::LocalExecutor`] drives the
//! encoder subprocess on this node, [`remote::RemoteExecutor`] dispatches to a
//! follower over HTTP. The node runtime picks one at construction and the
//! processor is generic over it.

pub mod local;
pub mod remote;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::store::types::{Job, JobId};

/// One progress sample from an executor. Also the follower→leader callback body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub progress: f64,
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Terminal result of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failed,
    Cancelled,
    /// Leader-only: no follower was free to take the job. The processor
    /// returns the row to the queue instead of failing it.
    NoWorkerAvailable,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub output_file: Option<String>,
    pub error: Option<String>,
    pub stderr_tail: Option<String>,
    pub total_frames: Option<i64>,
    pub final_progress: Option<f64>,
}

impl ExecutionOutcome {
    pub fn success(output_file: String, total_frames: Option<i64>, final_progress: f64) -> Self {
        Self {
            status: OutcomeStatus::Success,
            output_file: Some(output_file),
            error: None,
            stderr_tail: None,
            total_frames,
            final_progress: Some(final_progress),
        }
    }

    pub fn failed(error: impl Into<String>, stderr_tail: Option<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            output_file: None,
            error: Some(error.into()),
            stderr_tail,
            total_frames: None,
            final_progress: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: OutcomeStatus::Cancelled,
            output_file: None,
            error: Some("cancelled".to_string()),
            stderr_tail: None,
            total_frames: None,
            final_progress: None,
        }
    }

    pub fn no_worker_available() -> Self {
        Self {
            status: OutcomeStatus::NoWorkerAvailable,
            output_file: None,
            error: Some("no available followers".to_string()),
            stderr_tail: None,
            total_frames: None,
            final_progress: None,
        }
    }
}

/// Run-one-job contract. `execute` publishes zero or more progress events on
/// the channel before returning; `kill` is fire-and-forget and a killed
/// execution returns promptly with a cancelled outcome.
pub trait JobExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        job: &Job,
        progress: ProgressSender,
    ) -> impl Future<Output = ExecutionOutcome> + Send;

    fn kill(&self, job_id: JobId) -> impl Future<Output = ()> + Send;
}

/// Basename prefix for in-flight encoder output.
pub const TEMP_PREFIX: &str = ".fsvtemp.";

/// Temp sibling the encoder writes to until the final rename.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{TEMP_PREFIX}{name}"))
}

/// Walk `root` and delete crash remnants (files whose basename carries
/// [`TEMP_PREFIX`]). Called once at startup by the node runtime, never by the
/// executor itself. Returns the number of files removed.
pub async fn sweep_temp_files(root: &Path) -> u64 {
    let mut removed = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), "temp sweep skipped dir: {}", e);
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() => {
                    let is_temp = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(TEMP_PREFIX));
                    if is_temp {
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => {
                                removed += 1;
                                tracing::info!(path = %path.display(), "removed stale temp file");
                            }
                            Err(e) => {
                                tracing::warn!(path = %path.display(), "temp sweep remove: {}", e)
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_sibling_prefixes_basename() {
        let p = temp_sibling(Path::new("/media/out/movie.mp4"));
        assert_eq!(p, Path::new("/media/out/.fsvtemp.movie.mp4"));
    }

    #[tokio::test]
    async fn sweep_removes_only_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub");
        tokio::fs::create_dir(&nested).await.unwrap();
        tokio::fs::write(dir.path().join(".fsvtemp.a.mp4"), b"x").await.unwrap();
        tokio::fs::write(nested.join(".fsvtemp.b.mp4"), b"x").await.unwrap();
        tokio::fs::write(nested.join("keep.mp4"), b"x").await.unwrap();

        let removed = sweep_temp_files(dir.path()).await;
        assert_eq!(removed, 2);
        assert!(!dir.path().join(".fsvtemp.a.mp4").exists());
        assert!(!nested.join(".fsvtemp.b.mp4").exists());
        assert!(nested.join("keep.mp4").exists());
    }
}
