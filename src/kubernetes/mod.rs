//! Kubernetes adapters
//!
//! Implementations of the domain ports against the API server, the watch
//! caches feeding the event classifier and Lease-based leader election.

pub mod client;
pub mod cluster;
pub mod informer;
pub mod lease;

pub use client::KubeReplicationApi;
pub use cluster::ClusterCache;
pub use informer::Informer;
pub use lease::{evaluate, KubeLeaseApi, LeaderElector, LeaseAction};

use crate::config::ReplicatorConfig;
use crate::domain::ports::ResourceCacheRef;
use crate::error::Result;
use crate::replicator::{
    Controller, EventClassifier, ExclusionFilter, PolicyResolver, Reconciler, ReplicatorMetrics,
};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wire the caches, classifier and controller together and run until
/// `shutdown` is cancelled. `ready` is set while caches are synced and the
/// controller is running.
pub async fn run_replicator(
    client: Client,
    config: ReplicatorConfig,
    metrics: ReplicatorMetrics,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<()> {
    let keys = Arc::new(config.keys.clone());
    let exclusion = Arc::new(ExclusionFilter::new(&config.exclusion_regex));
    let api = Arc::new(KubeReplicationApi::new(client.clone()));

    let cluster = ClusterCache::new();
    let cache: ResourceCacheRef = Arc::new(cluster.clone());

    let (tx, rx) = mpsc::unbounded_channel();
    let classifier = Arc::new(EventClassifier::new(
        Arc::clone(&cache),
        Arc::clone(&keys),
        Arc::clone(&exclusion),
        tx,
    ));
    let watchers = cluster.spawn_watchers(client, classifier, shutdown.clone());

    tokio::select! {
        synced = cluster.wait_for_sync() => synced?,
        _ = shutdown.cancelled() => {
            info!("Shutdown requested before caches synced");
            return Ok(());
        }
    }

    let resolver = PolicyResolver::new(Arc::clone(&cache), api.clone(), Arc::clone(&keys));
    let reconciler = Reconciler::new(Arc::clone(&cache), api, resolver, exclusion, keys);
    let controller = Controller::new(reconciler, Arc::clone(&cache), &config, metrics);

    ready.store(true, Ordering::SeqCst);
    controller.run(rx, shutdown.clone()).await;
    ready.store(false, Ordering::SeqCst);

    shutdown.cancel();
    for watcher in watchers {
        if let Err(e) = watcher.await {
            warn!("Watcher task ended abnormally: {}", e);
        }
    }
    Ok(())
}
