//! Leader-side dispatch bookkeeping: follower registry, liveness tracking,
//! periodic reconciliation, and progress routing.
//!
//! The registry is in-memory and mutated only through its transactional
//! operations; the store stays the source of truth for job state. No lock is
//! ever held across an HTTP round-trip.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth;
use crate::events::{Event, EventBus};
use crate::executor::{ProgressEvent, ProgressSender};
use crate::store::types::{JobId, JobStatus};
use crate::store::Store;
use crate::wire::{WorkerCancelResponse, WorkerStatusResponse};

/// Probe attempts per follower during a full sync.
const SYNC_ATTEMPTS: u32 = 3;
/// Linear backoff step between probe attempts.
const SYNC_BACKOFF: Duration = Duration::from_secs(2);
/// Per-probe HTTP timeout (status and cancel calls only; dispatch is unbounded).
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Full reconcile cadence.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
/// Fast recovery probe cadence for dead followers.
pub const DEAD_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct FollowerState {
    id: String,
    url: String,
    busy: bool,
    dead: bool,
    current_job: Option<JobId>,
}

/// Registry view published on the event bus and the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowerSnapshot {
    pub id: String,
    pub url: String,
    pub busy: bool,
    pub dead: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job: Option<JobId>,
}

/// A follower acquired for dispatch.
#[derive(Debug, Clone)]
pub struct Follower {
    pub id: String,
    pub url: String,
}

/// Ordered follower list with busy/dead flags and the job each one holds.
/// At most one job per follower; a job appears in at most one follower.
struct FollowerRegistry {
    inner: Mutex<Vec<FollowerState>>,
}

impl FollowerRegistry {
    fn new(urls: &[String]) -> Self {
        let followers = urls
            .iter()
            .enumerate()
            .map(|(index, url)| FollowerState {
                id: format!("follower-{index}"),
                url: url.clone(),
                busy: false,
                dead: false,
                current_job: None,
            })
            .collect();
        Self { inner: Mutex::new(followers) }
    }

    /// First follower in list order that is neither busy nor dead; marks it
    /// busy and records the job mapping atomically.
    fn acquire_first_available(&self, job_id: JobId) -> Option<Follower> {
        let mut followers = self.inner.lock().unwrap();
        let state = followers.iter_mut().find(|f| !f.busy && !f.dead)?;
        state.busy = true;
        state.current_job = Some(job_id);
        Some(Follower { id: state.id.clone(), url: state.url.clone() })
    }

    /// Clear the mapping for a finished/abandoned job. Returns the follower id.
    fn release_job(&self, job_id: JobId) -> Option<String> {
        let mut followers = self.inner.lock().unwrap();
        let state = followers.iter_mut().find(|f| f.current_job == Some(job_id))?;
        state.busy = false;
        state.current_job = None;
        Some(state.id.clone())
    }

    fn follower_for_job(&self, job_id: JobId) -> Option<Follower> {
        let followers = self.inner.lock().unwrap();
        followers
            .iter()
            .find(|f| f.current_job == Some(job_id))
            .map(|f| Follower { id: f.id.clone(), url: f.url.clone() })
    }

    fn set_dead(&self, id: &str, dead: bool) {
        let mut followers = self.inner.lock().unwrap();
        if let Some(state) = followers.iter_mut().find(|f| f.id == id) {
            state.dead = dead;
        }
    }

    /// Overwrite a follower's assignment from observed status (reconcile).
    fn set_assignment(&self, id: &str, job: Option<JobId>) {
        let mut followers = self.inner.lock().unwrap();
        if let Some(state) = followers.iter_mut().find(|f| f.id == id) {
            state.busy = job.is_some();
            state.current_job = job;
        }
    }

    fn current_job_of(&self, id: &str) -> Option<JobId> {
        let followers = self.inner.lock().unwrap();
        followers.iter().find(|f| f.id == id).and_then(|f| f.current_job)
    }

    fn available_count(&self) -> usize {
        let followers = self.inner.lock().unwrap();
        followers.iter().filter(|f| !f.busy && !f.dead).count()
    }

    fn all(&self) -> Vec<Follower> {
        let followers = self.inner.lock().unwrap();
        followers
            .iter()
            .map(|f| Follower { id: f.id.clone(), url: f.url.clone() })
            .collect()
    }

    fn dead(&self) -> Vec<Follower> {
        let followers = self.inner.lock().unwrap();
        followers
            .iter()
            .filter(|f| f.dead)
            .map(|f| Follower { id: f.id.clone(), url: f.url.clone() })
            .collect()
    }

    fn snapshot(&self) -> Vec<FollowerSnapshot> {
        let followers = self.inner.lock().unwrap();
        followers
            .iter()
            .map(|f| FollowerSnapshot {
                id: f.id.clone(),
                url: f.url.clone(),
                busy: f.busy,
                dead: f.dead,
                current_job: f.current_job,
            })
            .collect()
    }
}

/// Leader-only coordinator owning the follower registry.
pub struct Distributor {
    registry: FollowerRegistry,
    store: Store,
    bus: Arc<EventBus>,
    client: reqwest::Client,
    token: String,
    /// Routes follower progress callbacks to the executor driving that job.
    progress_router: Mutex<HashMap<JobId, ProgressSender>>,
    /// Pokes the processor when dispatch capacity frees up.
    processor_trigger: Mutex<Option<mpsc::Sender<()>>>,
}

impl Distributor {
    pub fn new(store: Store, bus: Arc<EventBus>, follower_urls: &[String], token: String) -> Arc<Self> {
        Arc::new(Self {
            registry: FollowerRegistry::new(follower_urls),
            store,
            bus,
            client: reqwest::Client::new(),
            token,
            progress_router: Mutex::new(HashMap::new()),
            processor_trigger: Mutex::new(None),
        })
    }

    /// Wire the processor trigger once the processor exists.
    pub fn set_processor_trigger(&self, trigger: mpsc::Sender<()>) {
        *self.processor_trigger.lock().unwrap() = Some(trigger);
    }

    fn poke_processor(&self) {
        if let Some(trigger) = self.processor_trigger.lock().unwrap().as_ref() {
            let _ = trigger.try_send(());
        }
    }

    pub fn snapshot(&self) -> Vec<FollowerSnapshot> {
        self.registry.snapshot()
    }

    pub fn available_count(&self) -> usize {
        self.registry.available_count()
    }

    fn publish_followers_status(&self) {
        self.bus.publish(Event::FollowersStatus { followers: self.registry.snapshot() });
    }

    pub(crate) fn acquire(&self, job_id: JobId) -> Option<Follower> {
        let follower = self.registry.acquire_first_available(job_id);
        if follower.is_some() {
            self.publish_followers_status();
        }
        follower
    }

    /// Persist which follower a dispatched job landed on.
    pub(crate) async fn record_dispatch(&self, job_id: JobId, follower: &Follower) -> Result<()> {
        self.store.assign_worker(job_id, &follower.id).await
    }

    pub(crate) fn register_progress(&self, job_id: JobId, sender: ProgressSender) {
        self.progress_router.lock().unwrap().insert(job_id, sender);
    }

    fn has_live_dispatch(&self, job_id: JobId) -> bool {
        self.progress_router.lock().unwrap().contains_key(&job_id)
    }

    /// Drop all executor-side state for a job and free its follower.
    pub(crate) fn release(&self, job_id: JobId) {
        self.progress_router.lock().unwrap().remove(&job_id);
        if let Some(follower_id) = self.registry.release_job(job_id) {
            tracing::debug!(job_id, follower = %follower_id, "follower released");
        }
        self.publish_followers_status();
        self.poke_processor();
    }

    pub(crate) fn auth_header(&self, payload: &[u8]) -> String {
        auth::generate(payload, &self.token)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Progress callback from a follower. Routed to the live executor when one
    /// exists; otherwise (a job re-attached after leader restart) persisted
    /// directly, completing the job on a terminal 100% report. Returns false
    /// when the job id is unknown.
    pub async fn handle_progress(&self, job_id: JobId, event: ProgressEvent) -> Result<bool> {
        let sender = self.progress_router.lock().unwrap().get(&job_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event);
            return Ok(true);
        }

        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing {
            // Late callback for a job already terminal; nothing to record.
            return Ok(true);
        }

        if event.progress >= 100.0 {
            let output = job.output_file.clone().unwrap_or_default();
            self.store.complete_job(job_id, &output, event.frame).await?;
            self.release(job_id);
            if let Some(fresh) = self.store.get_job(job_id).await? {
                self.bus.publish(Event::JobUpdated(fresh));
            }
            if let Ok(counts) = self.store.get_status_counts().await {
                self.bus.publish(Event::StatusCounts(counts));
            }
            tracing::info!(job_id, "re-attached job completed via progress callback");
        } else {
            self.store.update_progress(job_id, event.progress).await?;
            self.bus.publish(Event::JobProgress {
                job_id,
                progress: event.progress,
                frame: event.frame,
                fps: event.fps,
            });
        }
        Ok(true)
    }

    /// Ask the follower holding `job_id` to cancel it. On acknowledgement the
    /// mapping is cleared and the follower freed; the outstanding dispatch
    /// response still arrives and settles the job row (its own release is a
    /// no-op by then).
    pub async fn cancel_job_on_follower(&self, job_id: JobId) -> bool {
        let Some(follower) = self.registry.follower_for_job(job_id) else {
            tracing::debug!(job_id, "cancel requested for job not on any follower");
            return false;
        };

        let body = serde_json::json!({ "jobId": job_id }).to_string();
        let result = self
            .client
            .post(format!("{}/worker/cancel/{}", follower.url, job_id))
            .header(auth::AUTH_HEADER, self.auth_header(body.as_bytes()))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<WorkerCancelResponse>().await {
                    Ok(ack) if ack.cancelled => {
                        tracing::info!(job_id, follower = %follower.id, "follower acknowledged cancel");
                        self.release(job_id);
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        tracing::warn!(job_id, "cancel response decode: {}", e);
                        false
                    }
                }
            }
            Ok(resp) => {
                tracing::warn!(job_id, status = %resp.status(), "follower rejected cancel");
                false
            }
            Err(e) => {
                tracing::warn!(job_id, "cancel request failed: {}", e);
                false
            }
        }
    }

    async fn probe_follower(&self, url: &str) -> Result<WorkerStatusResponse> {
        let resp = self
            .client
            .get(format!("{url}/worker/status"))
            .header(auth::AUTH_HEADER, self.auth_header(b""))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .context("status probe request")?
            .error_for_status()
            .context("status probe response")?;
        resp.json::<WorkerStatusResponse>()
            .await
            .context("status probe body")
    }

    async fn probe_with_retry(&self, follower: &Follower) -> Result<WorkerStatusResponse> {
        let mut last_err = None;
        for attempt in 1..=SYNC_ATTEMPTS {
            match self.probe_follower(&follower.url).await {
                Ok(status) => return Ok(status),
                Err(e) => {
                    tracing::warn!(
                        follower = %follower.id,
                        attempt,
                        "status probe failed: {:#}",
                        e
                    );
                    last_err = Some(e);
                    if attempt < SYNC_ATTEMPTS {
                        tokio::time::sleep(SYNC_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("status probe failed")))
    }

    /// Fold one follower's reported state into the registry and the store.
    async fn reconcile_follower(&self, follower: &Follower, status: &WorkerStatusResponse) {
        self.registry.set_dead(&follower.id, false);

        if let Some(active) = status.active_jobs.first() {
            self.registry.set_assignment(&follower.id, Some(active.job_id));

            match self.store.get_job(active.job_id).await {
                Ok(Some(job)) => {
                    if job.status != JobStatus::Processing {
                        // Active on the follower but not processing here:
                        // re-attach rather than restart or duplicate.
                        let patch = crate::store::types::JobPatch {
                            status: Some(JobStatus::Processing),
                            ..Default::default()
                        };
                        if let Err(e) = self.store.update_job(job.id, &patch).await {
                            tracing::warn!(job_id = job.id, "reconcile status update: {:#}", e);
                        }
                    }
                    if let Err(e) = self.store.assign_worker(job.id, &follower.id).await {
                        tracing::warn!(job_id = job.id, "reconcile worker assignment: {:#}", e);
                    }
                    if let Err(e) = self.store.update_progress(job.id, active.progress).await {
                        tracing::warn!(job_id = job.id, "reconcile progress restore: {:#}", e);
                    }
                    self.bus.publish(Event::JobProgress {
                        job_id: job.id,
                        progress: active.progress,
                        frame: None,
                        fps: None,
                    });
                    tracing::info!(
                        job_id = job.id,
                        follower = %follower.id,
                        progress = active.progress,
                        "restored in-flight job from follower status"
                    );
                }
                Ok(None) => {
                    tracing::warn!(
                        follower = %follower.id,
                        job_id = active.job_id,
                        "follower reports unknown job"
                    );
                }
                Err(e) => tracing::warn!(job_id = active.job_id, "reconcile lookup: {:#}", e),
            }
        } else if let Some(mapped) = self.registry.current_job_of(&follower.id) {
            // Registry thinks this follower is busy but it reports idle. Leave
            // a live dispatch alone (its POST may not have landed yet).
            if !self.has_live_dispatch(mapped) {
                self.registry.set_assignment(&follower.id, None);
            }
        } else {
            self.registry.set_assignment(&follower.id, None);
        }
    }

    /// Probe every follower (with retries) and reconcile registry and store
    /// against what each one reports. Returns all observed active job ids.
    pub async fn sync_with_followers(&self) -> Vec<JobId> {
        let mut active_ids: Vec<JobId> = Vec::new();
        let mut responded: HashSet<String> = HashSet::new();

        for follower in self.registry.all() {
            match self.probe_with_retry(&follower).await {
                Ok(status) => {
                    responded.insert(follower.id.clone());
                    active_ids.extend(status.active_jobs.iter().map(|a| a.job_id));
                    self.reconcile_follower(&follower, &status).await;
                }
                Err(e) => {
                    tracing::warn!(follower = %follower.id, "marking follower dead: {:#}", e);
                    self.registry.set_dead(&follower.id, true);
                }
            }
        }

        // A processing row assigned to a follower that answered but did not
        // report it has been lost on that worker.
        match self.store.get_jobs_by_status(JobStatus::Processing).await {
            Ok(rows) => {
                for job in rows {
                    let Some(worker) = job.assigned_worker.clone() else { continue };
                    if !responded.contains(&worker) {
                        continue;
                    }
                    if active_ids.contains(&job.id) || self.has_live_dispatch(job.id) {
                        continue;
                    }
                    tracing::warn!(job_id = job.id, follower = %worker, "worker no longer reports job");
                    if let Err(e) = self.store.fail_job(job.id, "worker no longer reports job").await {
                        tracing::warn!(job_id = job.id, "orphan fail: {:#}", e);
                    }
                    self.registry.release_job(job.id);
                    if let Ok(Some(fresh)) = self.store.get_job(job.id).await {
                        self.bus.publish(Event::JobUpdated(fresh));
                    }
                }
            }
            Err(e) => tracing::warn!("orphan scan: {:#}", e),
        }

        self.publish_followers_status();
        self.poke_processor();
        active_ids
    }

    /// Cheap health probe over only the dead set; a recovered follower is
    /// reconciled exactly as in the full sync.
    pub async fn check_dead_followers(&self) {
        let dead = self.registry.dead();
        if dead.is_empty() {
            return;
        }
        let mut recovered = false;
        for follower in dead {
            match self.probe_follower(&follower.url).await {
                Ok(status) => {
                    tracing::info!(follower = %follower.id, "follower recovered");
                    self.reconcile_follower(&follower, &status).await;
                    recovered = true;
                }
                Err(e) => tracing::debug!(follower = %follower.id, "still dead: {:#}", e),
            }
        }
        if recovered {
            self.publish_followers_status();
            self.poke_processor();
        }
    }

    /// Leader restart recovery, run before accepting submissions: reconcile
    /// from follower status, then fail any processing row nothing accounts
    /// for. Jobs are never blind-restarted.
    pub async fn startup_recovery(&self) -> Result<()> {
        let active = self.sync_with_followers().await;

        let rows = self.store.get_jobs_by_status(JobStatus::Processing).await?;
        for job in rows {
            if active.contains(&job.id) {
                continue;
            }
            tracing::warn!(job_id = job.id, "processing row not accounted for after restart");
            self.store
                .fail_job(job.id, "interrupted by leader restart")
                .await?;
            if let Some(fresh) = self.store.get_job(job.id).await? {
                self.bus.publish(Event::JobUpdated(fresh));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FollowerRegistry {
        FollowerRegistry::new(&[
            "http://a:3001".to_string(),
            "http://b:3002".to_string(),
        ])
    }

    #[test]
    fn acquire_prefers_list_order_and_marks_busy() {
        let reg = registry();
        let first = reg.acquire_first_available(1).unwrap();
        assert_eq!(first.id, "follower-0");
        let second = reg.acquire_first_available(2).unwrap();
        assert_eq!(second.id, "follower-1");
        assert!(reg.acquire_first_available(3).is_none());
        assert_eq!(reg.available_count(), 0);
    }

    #[test]
    fn release_frees_follower_for_reuse() {
        let reg = registry();
        reg.acquire_first_available(1).unwrap();
        assert_eq!(reg.release_job(1).as_deref(), Some("follower-0"));
        assert_eq!(reg.release_job(1), None, "release is idempotent");
        let again = reg.acquire_first_available(2).unwrap();
        assert_eq!(again.id, "follower-0");
    }

    #[test]
    fn dead_followers_are_skipped() {
        let reg = registry();
        reg.set_dead("follower-0", true);
        let follower = reg.acquire_first_available(1).unwrap();
        assert_eq!(follower.id, "follower-1");
        assert_eq!(reg.dead().len(), 1);

        reg.set_dead("follower-0", false);
        assert!(reg.dead().is_empty());
        assert_eq!(reg.available_count(), 1);
    }

    #[test]
    fn job_maps_to_at_most_one_follower() {
        let reg = registry();
        reg.acquire_first_available(7).unwrap();
        let found = reg.follower_for_job(7).unwrap();
        assert_eq!(found.id, "follower-0");
        assert!(reg.follower_for_job(8).is_none());

        let snapshot = reg.snapshot();
        let holders: Vec<_> = snapshot.iter().filter(|f| f.current_job == Some(7)).collect();
        assert_eq!(holders.len(), 1);
    }

    #[test]
    fn reconcile_assignment_overwrites_state() {
        let reg = registry();
        reg.set_assignment("follower-1", Some(42));
        let snap = reg.snapshot();
        assert!(snap[1].busy);
        assert_eq!(snap[1].current_job, Some(42));
        assert_eq!(reg.current_job_of("follower-1"), Some(42));

        reg.set_assignment("follower-1", None);
        assert!(!reg.snapshot()[1].busy);
    }
}
