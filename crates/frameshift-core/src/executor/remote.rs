//! Remote executor: leader-side dispatch of one job to a follower.
//!
//! The dispatch POST stays open for the whole encode; progress flows through
//! the follower's callback endpoint into the distributor, which routes it to
//! the channel registered here. No registry lock is held across the call.

use std::sync::Arc;

use crate::auth;
use crate::distributor::{Distributor, Follower};
use crate::store::types::{Job, JobId};
use crate::wire::{WorkerExecuteRequest, WorkerExecuteResponse};

use super::{ExecutionOutcome, JobExecutor, ProgressSender};

pub struct RemoteExecutor {
    distributor: Arc<Distributor>,
}

impl RemoteExecutor {
    pub fn new(distributor: Arc<Distributor>) -> Self {
        Self { distributor }
    }

    async fn dispatch(&self, job: &Job, follower: &Follower) -> ExecutionOutcome {
        if let Err(e) = self.distributor.record_dispatch(job.id, follower).await {
            return ExecutionOutcome::failed(format!("record dispatch: {e:#}"), None);
        }

        let request = WorkerExecuteRequest {
            job_id: job.id,
            job_name: job.name.clone(),
            input_file: job.input_file.clone(),
            output_file: job
                .output_file
                .clone()
                .unwrap_or_else(|| job.ffmpeg_command.output_path.clone()),
            ffmpeg_command: job.ffmpeg_command.clone(),
        };
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => return ExecutionOutcome::failed(format!("encode dispatch body: {e}"), None),
        };

        // The response arrives when the follower finishes the encode, so this
        // call carries no timeout.
        let response = self
            .distributor
            .http()
            .post(format!("{}/worker/execute", follower.url))
            .header(auth::AUTH_HEADER, self.distributor.auth_header(&body))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                return ExecutionOutcome::failed(
                    format!("follower {} rejected dispatch: {}", follower.id, resp.status()),
                    None,
                );
            }
            Err(e) => {
                // A single transport failure fails the job but does not mark
                // the follower dead; the periodic probes decide that.
                return ExecutionOutcome::failed(
                    format!("follower {} dispatch failed: {e}", follower.id),
                    None,
                );
            }
        };

        let payload = match response.json::<WorkerExecuteResponse>().await {
            Ok(payload) => payload,
            Err(e) => {
                return ExecutionOutcome::failed(
                    format!("follower {} response decode: {e}", follower.id),
                    None,
                );
            }
        };

        if payload.success {
            ExecutionOutcome::success(
                payload
                    .output_file
                    .unwrap_or_else(|| request.output_file.clone()),
                payload.total_frames,
                100.0,
            )
        } else if payload.error_message.as_deref() == Some("cancelled") {
            ExecutionOutcome::cancelled()
        } else {
            ExecutionOutcome::failed(
                payload
                    .error_message
                    .unwrap_or_else(|| "follower reported failure".to_string()),
                payload.ffmpeg_stderr,
            )
        }
    }
}

impl JobExecutor for RemoteExecutor {
    async fn execute(&self, job: &Job, progress: ProgressSender) -> ExecutionOutcome {
        let Some(follower) = self.distributor.acquire(job.id) else {
            return ExecutionOutcome::no_worker_available();
        };
        tracing::info!(job_id = job.id, follower = %follower.id, "dispatching job");
        self.distributor.register_progress(job.id, progress);

        let outcome = self.dispatch(job, &follower).await;

        self.distributor.release(job.id);
        outcome
    }

    async fn kill(&self, job_id: JobId) {
        // Fire-and-forget toward the follower; the outstanding dispatch
        // response carries the cancelled outcome back.
        self.distributor.cancel_job_on_follower(job_id).await;
    }
}
