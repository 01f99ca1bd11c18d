//! Single-consumer job processor: claims the next pending row, drives an
//! executor, persists progress and outcomes, and publishes lifecycle events.
//!
//! One instance per node process; at most one job is in flight at a time. The
//! loop wakes on a periodic ticker or an explicit trigger and then drains the
//! queue back-to-back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::events::{Event, EventBus};
use crate::executor::{ExecutionOutcome, JobExecutor, OutcomeStatus, ProgressEvent};
use crate::store::types::{Job, JobId};
use crate::store::Store;

/// How the processor claims work from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Claim with this node's worker id (standalone and follower nodes).
    /// Startup recovery resets stranded processing rows.
    Worker,
    /// Leader variant: claim without an assignment; the remote executor
    /// records the follower once one is acquired. No local startup reset;
    /// the distributor reconciles from follower status instead.
    Dispatch,
}

/// State shared between the running loop and its handles.
pub struct ProcessorShared {
    current_job: Mutex<Option<JobId>>,
    completion_hooks: Mutex<HashMap<JobId, oneshot::Sender<ExecutionOutcome>>>,
}

/// Cloneable control surface for a running processor.
#[derive(Clone)]
pub struct ProcessorHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shared: Arc<ProcessorShared>,
    kill: Arc<dyn Fn(JobId) + Send + Sync>,
}

impl ProcessorHandle {
    /// Poke the loop to look for work now instead of at the next tick.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// A sender other components can hold to poke the loop.
    pub fn trigger_sender(&self) -> mpsc::Sender<()> {
        self.trigger_tx.clone()
    }

    pub fn current_job(&self) -> Option<JobId> {
        *self.shared.current_job.lock().unwrap()
    }

    pub fn is_busy(&self) -> bool {
        self.current_job().is_some()
    }

    /// Kill the executor if `job_id` is the in-flight job. Fire-and-forget;
    /// the loop observes the executor's cancelled return and records the
    /// terminal state. Returns false when the job is not running here.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        if self.current_job() == Some(job_id) {
            (self.kill)(job_id);
            true
        } else {
            false
        }
    }

    /// Register for the execution outcome of a job before it runs. Used by
    /// the follower dispatch handler to answer the leader's outstanding call.
    pub fn watch_completion(&self, job_id: JobId) -> oneshot::Receiver<ExecutionOutcome> {
        let (tx, rx) = oneshot::channel();
        self.shared.completion_hooks.lock().unwrap().insert(job_id, tx);
        rx
    }

    pub fn drop_completion_watch(&self, job_id: JobId) {
        self.shared.completion_hooks.lock().unwrap().remove(&job_id);
    }

    /// Begin shutdown: no new work is accepted and any in-flight job is
    /// killed. The caller awaits the loop's join handle for completion.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(job_id) = self.current_job() {
            (self.kill)(job_id);
        }
    }
}

pub struct Processor<E: JobExecutor> {
    store: Store,
    bus: Arc<EventBus>,
    executor: Arc<E>,
    worker_id: String,
    claim_mode: ClaimMode,
    check_interval: Duration,
    shared: Arc<ProcessorShared>,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E: JobExecutor> Processor<E> {
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        executor: Arc<E>,
        worker_id: impl Into<String>,
        claim_mode: ClaimMode,
        check_interval: Duration,
    ) -> (Self, ProcessorHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(ProcessorShared {
            current_job: Mutex::new(None),
            completion_hooks: Mutex::new(HashMap::new()),
        });

        let kill: Arc<dyn Fn(JobId) + Send + Sync> = {
            let executor = Arc::clone(&executor);
            Arc::new(move |job_id| {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move { executor.kill(job_id).await });
            })
        };

        let handle = ProcessorHandle {
            trigger_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shared: Arc::clone(&shared),
            kill,
        };

        let processor = Processor {
            store,
            bus,
            executor,
            worker_id: worker_id.into(),
            claim_mode,
            check_interval,
            shared,
            trigger_rx,
            shutdown_rx,
        };
        (processor, handle)
    }

    /// Run until shutdown. Intended to be spawned by the node runtime.
    pub async fn run(mut self) {
        if self.claim_mode == ClaimMode::Worker {
            match self.store.reset_processing_jobs().await {
                Ok(n) if n > 0 => tracing::info!("recovered {} job(s) from previous run", n),
                Ok(_) => {}
                Err(e) => tracing::error!("startup recovery failed: {:#}", e),
            }
        }

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {}
                _ = ticker.tick() => {}
                // Disabled (rather than spinning) once every handle is gone.
                Some(_) = self.trigger_rx.recv() => {}
            }
            if *self.shutdown_rx.borrow() {
                break;
            }
            self.drain_queue().await;
            if *self.shutdown_rx.borrow() {
                break;
            }
        }
        tracing::info!(worker = %self.worker_id, "processor stopped");
    }

    /// Claim and run jobs back-to-back until the queue is empty, shutdown
    /// begins, or dispatch capacity runs out.
    async fn drain_queue(&mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                return;
            }
            let claimed = match self.claim_mode {
                ClaimMode::Worker => self.store.claim_next(&self.worker_id).await,
                ClaimMode::Dispatch => self.store.claim_next_unassigned().await,
            };
            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("claim failed: {:#}", e);
                    return;
                }
            };
            let backoff = self.process_job(job).await;
            if backoff {
                return;
            }
        }
    }

    async fn handle_progress(&self, job_id: JobId, event: ProgressEvent) {
        // One store write per progress message; this also carries the
        // worker heartbeat.
        if let Err(e) = self.store.update_progress(job_id, event.progress).await {
            tracing::warn!(job_id, "progress write failed: {:#}", e);
        }
        self.bus.publish(Event::JobProgress {
            job_id,
            progress: event.progress,
            frame: event.frame,
            fps: event.fps,
        });
    }

    /// Drive one claimed job to a terminal state. Returns true when the loop
    /// should stop draining (no dispatch capacity).
    async fn process_job(&mut self, job: Job) -> bool {
        tracing::info!(job_id = job.id, name = %job.name, "job started");
        *self.shared.current_job.lock().unwrap() = Some(job.id);
        self.bus.publish(Event::JobUpdated(job.clone()));
        self.publish_counts().await;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let executor = Arc::clone(&self.executor);
        let exec_fut = executor.execute(&job, progress_tx);
        tokio::pin!(exec_fut);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = progress_rx.recv() => {
                    self.handle_progress(job.id, event).await;
                }
                outcome = &mut exec_fut => break outcome,
            }
        };
        // Events emitted in the executor's final poll are still in the channel.
        while let Ok(event) = progress_rx.try_recv() {
            self.handle_progress(job.id, event).await;
        }

        let mut backoff = false;
        match outcome.status {
            OutcomeStatus::Success => {
                let output = outcome
                    .output_file
                    .clone()
                    .or_else(|| job.output_file.clone())
                    .unwrap_or_else(|| job.ffmpeg_command.output_path.clone());
                if let Err(e) = self.store.complete_job(job.id, &output, outcome.total_frames).await {
                    tracing::error!(job_id = job.id, "completion write failed: {:#}", e);
                }
                tracing::info!(job_id = job.id, "job completed");
            }
            OutcomeStatus::Failed => {
                let message = match (&outcome.error, &outcome.stderr_tail) {
                    (Some(error), Some(tail)) if !tail.trim().is_empty() => {
                        format!("{error}\n{tail}")
                    }
                    (Some(error), _) => error.clone(),
                    (None, _) => "encoder failed".to_string(),
                };
                if let Err(e) = self.store.fail_job(job.id, &message).await {
                    tracing::error!(job_id = job.id, "failure write failed: {:#}", e);
                }
                tracing::warn!(job_id = job.id, "job failed: {}", outcome.error.as_deref().unwrap_or(""));
            }
            OutcomeStatus::Cancelled => {
                if let Err(e) = self.store.cancel_job(job.id, "cancelled by user").await {
                    tracing::error!(job_id = job.id, "cancel write failed: {:#}", e);
                }
                tracing::info!(job_id = job.id, "job cancelled");
            }
            OutcomeStatus::NoWorkerAvailable => {
                // Not a job failure: return the row to the queue and wait for
                // a follower to free up (the distributor pokes the trigger).
                if let Err(e) = self.store.revert_to_pending(job.id).await {
                    tracing::error!(job_id = job.id, "revert write failed: {:#}", e);
                }
                tracing::debug!(job_id = job.id, "no follower available, job re-queued");
                backoff = true;
            }
        }

        if let Some(hook) = self.shared.completion_hooks.lock().unwrap().remove(&job.id) {
            let _ = hook.send(outcome.clone());
        }

        if let Ok(Some(fresh)) = self.store.get_job(job.id).await {
            self.bus.publish(Event::JobUpdated(fresh));
        }
        self.publish_counts().await;
        *self.shared.current_job.lock().unwrap() = None;
        backoff
    }

    async fn publish_counts(&self) {
        match self.store.get_status_counts().await {
            Ok(counts) => self.bus.publish(Event::StatusCounts(counts)),
            Err(e) => tracing::warn!("status counts: {:#}", e),
        }
    }
}
