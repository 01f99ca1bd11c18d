//! Follower-side dispatch: persist leader-dispatched jobs locally, run them
//! through the standard claim/processor path, forward progress to the leader's
//! callback endpoint, and answer the outstanding execute request with the
//! outcome.
//!
//! The dispatch table maps the local row to the leader's job id. It is
//! in-memory: if the follower restarts mid-job the table is gone, the local
//! row is recovered by the normal startup reset, and the leader sees the
//! severed dispatch call fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::auth;
use crate::events::{Event, EventBus};
use crate::executor::{OutcomeStatus, ProgressEvent};
use crate::processor::ProcessorHandle;
use crate::store::types::{JobId, JobStatus, NewJob};
use crate::store::Store;
use crate::wire::{ActiveJob, WorkerExecuteRequest, WorkerExecuteResponse};

/// Timeout for a single progress callback POST.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct DispatchEntry {
    remote_id: JobId,
    progress: f64,
}

/// Local-row ↔ leader-job mapping for in-flight dispatches.
#[derive(Default)]
struct DispatchTable {
    inner: Mutex<HashMap<JobId, DispatchEntry>>,
}

impl DispatchTable {
    fn register(&self, local_id: JobId, remote_id: JobId) {
        self.inner
            .lock()
            .unwrap()
            .insert(local_id, DispatchEntry { remote_id, progress: 0.0 });
    }

    fn remove(&self, local_id: JobId) {
        self.inner.lock().unwrap().remove(&local_id);
    }

    fn update_progress(&self, local_id: JobId, progress: f64) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(&local_id) {
            entry.progress = progress;
        }
    }

    fn local_for_remote(&self, remote_id: JobId) -> Option<JobId> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|(_, entry)| entry.remote_id == remote_id)
            .map(|(local, _)| *local)
    }

    fn active_jobs(&self) -> Vec<ActiveJob> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|entry| ActiveJob { job_id: entry.remote_id, progress: entry.progress })
            .collect()
    }

    fn is_busy(&self) -> bool {
        !self.inner.lock().unwrap().is_empty()
    }
}

/// The follower's view of one leader-authenticated dispatch surface.
pub struct FollowerWorker {
    store: Store,
    bus: Arc<EventBus>,
    processor: ProcessorHandle,
    table: DispatchTable,
    client: reqwest::Client,
    worker_id: String,
    leader_url: Option<String>,
    token: String,
}

impl FollowerWorker {
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        processor: ProcessorHandle,
        worker_id: String,
        leader_url: Option<String>,
        token: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            processor,
            table: DispatchTable::default(),
            client: reqwest::Client::new(),
            worker_id,
            leader_url,
            token,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn busy(&self) -> bool {
        self.table.is_busy()
    }

    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.table.active_jobs()
    }

    /// Run one dispatched job to completion. Blocks until the encode ends;
    /// the leader's execute call stays open on this future.
    pub async fn execute_dispatch(self: &Arc<Self>, request: WorkerExecuteRequest) -> WorkerExecuteResponse {
        let remote_id = request.job_id;
        let position = match self.store.get_max_queue_position().await {
            Ok(max) => max.map_or(0, |m| m + 1),
            Err(e) => {
                return dispatch_error(format!("queue position lookup: {e:#}"));
            }
        };

        let new = NewJob {
            name: request.job_name.clone(),
            input_file: request.input_file.clone(),
            output_file: Some(request.output_file.clone()),
            command: request.ffmpeg_command.clone(),
            queue_position: Some(position),
            total_frames: None,
            config_key: None,
            config_json: None,
        };
        let local_id = match self.store.create_job(&new).await {
            Ok(id) => id,
            Err(e) => return dispatch_error(format!("persist dispatched job: {e:#}")),
        };
        tracing::info!(remote_id, local_id, name = %request.job_name, "accepted dispatched job");

        let completion = self.processor.watch_completion(local_id);
        self.table.register(local_id, remote_id);

        // The periodic tick may have raced the row to a terminal state before
        // the hook existed; answer from the row instead of waiting forever.
        if let Ok(Some(job)) = self.store.get_job(local_id).await {
            if job.status.is_finished() {
                self.processor.drop_completion_watch(local_id);
                self.table.remove(local_id);
                return self.response_from_row(local_id).await;
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let forwarder = tokio::spawn(Arc::clone(self).forward_progress(local_id, remote_id, stop_rx));

        self.processor.trigger();

        let outcome = match completion.await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Processor dropped the hook without firing; read the row.
                self.table.remove(local_id);
                let _ = stop_tx.send(());
                let _ = forwarder.await;
                return self.response_from_row(local_id).await;
            }
        };

        let _ = stop_tx.send(());
        let _ = forwarder.await;
        self.table.remove(local_id);

        match outcome.status {
            OutcomeStatus::Success => {
                // A final full-progress callback lets a restarted leader (whose
                // execute connection died) settle the job.
                self.post_progress(
                    remote_id,
                    ProgressEvent { frame: outcome.total_frames, fps: None, speed: None, progress: 100.0 },
                )
                .await;
                WorkerExecuteResponse {
                    success: true,
                    output_file: outcome.output_file,
                    error_message: None,
                    total_frames: outcome.total_frames,
                    ffmpeg_stderr: None,
                }
            }
            OutcomeStatus::Cancelled => WorkerExecuteResponse {
                success: false,
                output_file: None,
                error_message: Some("cancelled".to_string()),
                total_frames: None,
                ffmpeg_stderr: None,
            },
            OutcomeStatus::Failed | OutcomeStatus::NoWorkerAvailable => WorkerExecuteResponse {
                success: false,
                output_file: None,
                error_message: outcome.error,
                total_frames: None,
                ffmpeg_stderr: outcome.stderr_tail,
            },
        }
    }

    /// Cancel a dispatched job by the leader's id. Routes to the processor for
    /// an in-flight job, or settles a still-queued row directly.
    pub async fn cancel_dispatch(&self, remote_id: JobId) -> bool {
        let Some(local_id) = self.table.local_for_remote(remote_id) else {
            return false;
        };
        if self.processor.cancel_job(local_id) {
            return true;
        }
        match self.store.get_job(local_id).await {
            Ok(Some(job)) if job.status == JobStatus::Pending => {
                if self.store.cancel_job(local_id, "cancelled by user").await.is_err() {
                    return false;
                }
                if let Ok(Some(fresh)) = self.store.get_job(local_id).await {
                    self.bus.publish(Event::JobUpdated(fresh));
                }
                true
            }
            _ => false,
        }
    }

    /// Relay progress events for one dispatch to the leader until it settles.
    async fn forward_progress(
        self: Arc<Self>,
        local_id: JobId,
        remote_id: JobId,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut sub = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = &mut stop => return,
                event = sub.rx.recv() => {
                    match event {
                        Some(Event::JobProgress { job_id, progress, frame, fps }) if job_id == local_id => {
                            self.table.update_progress(local_id, progress);
                            self.post_progress(
                                remote_id,
                                ProgressEvent { frame, fps, speed: None, progress },
                            )
                            .await;
                        }
                        Some(_) => {}
                        None => return,
                    }
                }
            }
        }
    }

    async fn post_progress(&self, remote_id: JobId, event: ProgressEvent) {
        let Some(leader_url) = self.leader_url.as_deref() else {
            return;
        };
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(_) => return,
        };
        let result = self
            .client
            .post(format!("{leader_url}/api/jobs/{remote_id}/progress"))
            .header(auth::AUTH_HEADER, auth::generate(&body, &self.token))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(CALLBACK_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(remote_id, "progress callback failed: {}", e);
        }
    }

    /// Fallback response when the completion hook is lost: report whatever
    /// terminal state the row reached.
    async fn response_from_row(&self, local_id: JobId) -> WorkerExecuteResponse {
        match self.store.get_job(local_id).await {
            Ok(Some(job)) if job.status == JobStatus::Completed => WorkerExecuteResponse {
                success: true,
                output_file: job.output_file,
                error_message: None,
                total_frames: job.total_frames,
                ffmpeg_stderr: None,
            },
            Ok(Some(job)) => WorkerExecuteResponse {
                success: false,
                output_file: None,
                error_message: job
                    .error_message
                    .or_else(|| Some("dispatch interrupted".to_string())),
                total_frames: None,
                ffmpeg_stderr: None,
            },
            _ => dispatch_error("dispatched job disappeared".to_string()),
        }
    }
}

fn dispatch_error(message: String) -> WorkerExecuteResponse {
    WorkerExecuteResponse {
        success: false,
        output_file: None,
        error_message: Some(message),
        total_frames: None,
        ffmpeg_stderr: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_maps_both_directions() {
        let table = DispatchTable::default();
        table.register(3, 41);
        assert!(table.is_busy());
        assert_eq!(table.local_for_remote(41), Some(3));
        assert_eq!(table.local_for_remote(99), None);

        table.update_progress(3, 62.5);
        let active = table.active_jobs();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_id, 41);
        assert_eq!(active[0].progress, 62.5);

        table.remove(3);
        assert!(!table.is_busy());
        assert!(table.active_jobs().is_empty());
    }
}
