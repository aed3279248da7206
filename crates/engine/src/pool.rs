//! Worker pool — spawns and supervises N step workers per node.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use waypoint_core::config::EngineConfig;
use waypoint_scheduler::WorkQueue;

use crate::retry::RetryManager;
use crate::worker::{StepOutcome, StepWorker};

/// Manages the lifecycle of the step workers and the lease janitor.
pub struct WorkerPool {
    config: EngineConfig,
    node_id: String,
    queue: Arc<WorkQueue>,
    worker: Arc<StepWorker>,
    retry: Arc<RetryManager>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        config: EngineConfig,
        node_id: String,
        queue: Arc<WorkQueue>,
        worker: Arc<StepWorker>,
        retry: Arc<RetryManager>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            node_id,
            queue,
            worker,
            retry,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn all worker loops and the lease expiry tick.
    pub fn start(&mut self) {
        for i in 0..self.config.worker_count {
            let worker_id = format!("{}-worker-{:02}", self.node_id, i);
            let handle = spawn_worker_loop(
                worker_id.clone(),
                self.config.clone(),
                self.queue.clone(),
                self.worker.clone(),
                self.retry.clone(),
                self.shutdown.subscribe(),
            );
            self.handles.push(handle);
            info!(worker_id = %worker_id, "Worker spawned");
        }

        self.handles.push(spawn_lease_tick(
            self.config.clone(),
            self.queue.clone(),
            self.shutdown.subscribe(),
        ));

        info!(
            count = self.config.worker_count,
            node = %self.node_id,
            "Worker pool started"
        );
    }

    /// Signal all loops to stop and wait for them to drain.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

fn spawn_worker_loop(
    worker_id: String,
    config: EngineConfig,
    queue: Arc<WorkQueue>,
    worker: Arc<StepWorker>,
    retry: Arc<RetryManager>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let poll = std::time::Duration::from_millis(config.poll_interval_ms);
        loop {
            let items = queue.dequeue(config.dequeue_batch_size, &worker_id, chrono::Utc::now());
            if items.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    debug!(worker_id = %worker_id, "Worker loop stopping");
                    return;
                }
                continue;
            }

            for item in items {
                match worker.run_step(&item).await {
                    Ok(StepOutcome::Discarded) => queue.discard(&item),
                    Ok(_) => queue.ack(&item),
                    Err(e) => {
                        retry.on_failure(&item, &e);
                    }
                }
            }

            if *shutdown.borrow() {
                debug!(worker_id = %worker_id, "Worker loop stopping");
                return;
            }
        }
    })
}

/// Requeues items whose lease expired (worker crash or stall).
fn spawn_lease_tick(
    config: EngineConfig,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(config.lease_tick_secs));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let reclaimed = queue.tick(chrono::Utc::now());
                    if reclaimed > 0 {
                        info!(reclaimed, "Requeued items from expired leases");
                        metrics::counter!("pool.leases_reclaimed").increment(reclaimed as u64);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}
