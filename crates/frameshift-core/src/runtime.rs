//! Node runtime: binds the instance mode to the right executor, owns the
//! processor lifecycle, runs startup recovery, and schedules periodic tasks
//! (stale-worker release, follower sync, blob GC).

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{InstanceType, NodeConfig};
use crate::distributor::{Distributor, DEAD_CHECK_INTERVAL, SYNC_INTERVAL};
use crate::events::{Event, EventBus};
use crate::executor::local::LocalExecutor;
use crate::executor::remote::RemoteExecutor;
use crate::executor::sweep_temp_files;
use crate::follower::FollowerWorker;
use crate::processor::{ClaimMode, Processor, ProcessorHandle};
use crate::store::Store;

/// Cadence for the stale-worker release scan on encoding nodes.
const STALE_SCAN_INTERVAL: Duration = Duration::from_secs(60);
/// Configuration snapshots older than this (and unreferenced) are collected.
const BLOB_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const BLOB_GC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// A started node: the store, the bus, the processor handle, and whichever
/// cluster components the mode requires.
pub struct NodeRuntime {
    pub config: NodeConfig,
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub processor: ProcessorHandle,
    pub distributor: Option<Arc<Distributor>>,
    pub follower: Option<Arc<FollowerWorker>>,
    processor_task: JoinHandle<()>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    /// Open the store, wire the mode's executor into a processor, run startup
    /// recovery, and start the periodic tasks. The HTTP surface is layered on
    /// top by the server binary.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let store = Store::open(&config.db_path()).await?;
        let bus = Arc::new(EventBus::new());
        let mut background_tasks = Vec::new();

        tracing::info!(
            mode = config.instance_type.as_str(),
            port = config.port,
            "starting node"
        );

        let (processor, distributor, follower, processor_task) = match config.instance_type {
            InstanceType::Standalone | InstanceType::Follower => {
                sweep_encoder_temps(&config).await;

                let executor = Arc::new(LocalExecutor::new("ffmpeg", config.ffmpeg_threads));
                let (processor, handle) = Processor::new(
                    store.clone(),
                    Arc::clone(&bus),
                    executor,
                    config.worker_id(),
                    ClaimMode::Worker,
                    config.check_interval,
                );
                let processor_task = tokio::spawn(processor.run());

                background_tasks.push(spawn_stale_scan(
                    store.clone(),
                    Arc::clone(&bus),
                    config.stale_worker_timeout,
                ));

                let follower = match config.instance_type {
                    InstanceType::Follower => Some(FollowerWorker::new(
                        store.clone(),
                        Arc::clone(&bus),
                        handle.clone(),
                        config.worker_id(),
                        config.leader_url.clone(),
                        config.shared_token.clone().unwrap_or_default(),
                    )),
                    _ => None,
                };
                (handle, None, follower, processor_task)
            }
            InstanceType::Leader => {
                let token = config.shared_token.clone().unwrap_or_default();
                let distributor = Distributor::new(
                    store.clone(),
                    Arc::clone(&bus),
                    &config.follower_urls,
                    token,
                );
                let executor = Arc::new(RemoteExecutor::new(Arc::clone(&distributor)));
                let (processor, handle) = Processor::new(
                    store.clone(),
                    Arc::clone(&bus),
                    executor,
                    config.worker_id(),
                    ClaimMode::Dispatch,
                    config.check_interval,
                );
                distributor.set_processor_trigger(handle.trigger_sender());

                // Reconcile against follower state before accepting work.
                distributor.startup_recovery().await?;

                let processor_task = tokio::spawn(processor.run());
                background_tasks.push(spawn_follower_sync(Arc::clone(&distributor)));
                background_tasks.push(spawn_dead_check(Arc::clone(&distributor)));

                (handle, Some(distributor), None, processor_task)
            }
        };

        background_tasks.push(spawn_blob_gc(store.clone()));

        Ok(NodeRuntime {
            config,
            store,
            bus,
            processor,
            distributor,
            follower,
            processor_task,
            background_tasks,
        })
    }

    /// Graceful shutdown: stop the processor (killing any in-flight job),
    /// wait for the loop to exit, stop periodic tasks, close the store.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.processor.stop();
        if let Err(e) = self.processor_task.await {
            tracing::warn!("processor task join: {}", e);
        }
        for task in self.background_tasks {
            task.abort();
        }
        self.store.close().await;
    }
}

/// Delete crash-remnant temp files under the media and output roots.
async fn sweep_encoder_temps(config: &NodeConfig) {
    let mut roots = vec![config.media_root.clone()];
    if !config.output_dir.starts_with(&config.media_root) {
        roots.push(config.output_dir.clone());
    }
    for root in roots {
        let removed = sweep_temp_files(&root).await;
        if removed > 0 {
            tracing::info!(root = %root.display(), "removed {} stale temp file(s)", removed);
        }
    }
}

fn spawn_stale_scan(store: Store, bus: Arc<EventBus>, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STALE_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.release_stale_jobs(timeout).await {
                Ok(0) => {}
                Ok(n) => {
                    tracing::warn!("released {} stale job(s)", n);
                    if let Ok(counts) = store.get_status_counts().await {
                        bus.publish(Event::StatusCounts(counts));
                    }
                }
                Err(e) => tracing::warn!("stale job scan: {:#}", e),
            }
        }
    })
}

fn spawn_follower_sync(distributor: Arc<Distributor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; startup recovery already synced.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let active = distributor.sync_with_followers().await;
            tracing::debug!("follower sync complete, {} active job(s)", active.len());
        }
    })
}

fn spawn_dead_check(distributor: Arc<Distributor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEAD_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            distributor.check_dead_followers().await;
        }
    })
}

fn spawn_blob_gc(store: Store) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BLOB_GC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.gc_config_blobs(BLOB_RETENTION).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("collected {} expired config snapshot(s)", n),
                Err(e) => tracing::warn!("config snapshot gc: {:#}", e),
            }
        }
    })
}
