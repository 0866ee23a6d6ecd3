//! Replication Controller
//!
//! Drives reconciles: moves claim keys from the ingestion channel into the
//! work queue, re-enqueues every cached claim on a fixed interval and runs
//! the reconcile workers until shutdown.

use crate::config::ReplicatorConfig;
use crate::domain::key::ClaimKey;
use crate::domain::ports::ResourceCacheRef;
use crate::error::ErrorAction;
use crate::replicator::metrics::ReplicatorMetrics;
use crate::replicator::queue::WorkQueue;
use crate::replicator::reconciler::Reconciler;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Controller {
    reconciler: Arc<Reconciler>,
    cache: ResourceCacheRef,
    queue: Arc<WorkQueue<ClaimKey>>,
    metrics: ReplicatorMetrics,
    workers: usize,
    /// Zero disables the periodic resync
    resync_interval: Duration,
}

impl Controller {
    pub fn new(
        reconciler: Reconciler,
        cache: ResourceCacheRef,
        config: &ReplicatorConfig,
        metrics: ReplicatorMetrics,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            cache,
            queue: Arc::new(WorkQueue::new()),
            metrics,
            workers: config.workers.max(1),
            resync_interval: config.resync_interval,
        }
    }

    /// Run until `shutdown` is cancelled or the ingestion channel closes.
    ///
    /// Workers finish the reconcile they are running before this returns.
    pub async fn run(self, mut keys: mpsc::UnboundedReceiver<ClaimKey>, shutdown: CancellationToken) {
        if self.resync_interval.is_zero() {
            info!(
                "Starting replication controller with {} worker(s), periodic resync disabled",
                self.workers
            );
        } else {
            info!(
                "Starting replication controller with {} worker(s), resync every {:?}",
                self.workers, self.resync_interval
            );
        }

        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&self.reconciler),
                    Arc::clone(&self.queue),
                    self.metrics.clone(),
                ))
            })
            .collect();

        let mut resync = (!self.resync_interval.is_zero()).then(|| {
            let start = tokio::time::Instant::now() + self.resync_interval;
            tokio::time::interval_at(start, self.resync_interval)
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                key = keys.recv() => match key {
                    Some(key) => {
                        self.metrics.events.inc();
                        self.queue.add(key);
                        self.metrics.queue_depth.set(self.queue.len() as i64);
                    }
                    None => {
                        warn!("Ingestion channel closed, stopping controller");
                        break;
                    }
                },
                _ = next_resync(resync.as_mut()) => {
                    let claims = self.cache.claim_keys();
                    debug!("Resyncing {} claim(s)", claims.len());
                    for key in claims {
                        self.queue.add(key);
                    }
                    self.metrics.queue_depth.set(self.queue.len() as i64);
                }
            }
        }

        info!("Stopping replication controller, waiting for in-flight reconciles");
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Reconcile worker ended abnormally: {}", e);
            }
        }
        info!("Replication controller stopped");
    }
}

async fn next_resync(resync: Option<&mut Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<ClaimKey>>,
    metrics: ReplicatorMetrics,
) {
    debug!("Reconcile worker {} started", id);

    while let Some(key) = queue.get().await {
        metrics.queue_depth.set(queue.len() as i64);
        let started = Instant::now();

        match reconciler.reconcile(&key).await {
            Ok(outcome) => {
                metrics.record_success(outcome.label(), started.elapsed());
                queue.forget(&key);
            }
            Err(e) => {
                metrics.record_failure(started.elapsed());
                match e.action() {
                    ErrorAction::RequeueWithBackoff => {
                        warn!(
                            "Reconcile of {} failed, retry #{}: {}",
                            key,
                            queue.num_requeues(&key) + 1,
                            e
                        );
                        queue.add_rate_limited(key.clone());
                    }
                    ErrorAction::RequeueAfter(delay) => {
                        warn!("Reconcile of {} failed, retrying in {:?}: {}", key, delay, e);
                        queue.add_after(key.clone(), delay);
                    }
                    ErrorAction::NoRequeue => {
                        warn!("Reconcile of {} failed, not retrying: {}", key, e);
                        queue.forget(&key);
                    }
                }
            }
        }

        queue.done(&key);
    }

    debug!("Reconcile worker {} stopped", id);
}
