//! Cluster cache
//!
//! Watches claims, namespaces and VolumeReplications across the cluster,
//! serves claim and namespace reads to the reconciler and forwards every
//! change to the event classifier.

use crate::crd::VolumeReplication;
use crate::domain::key::ClaimKey;
use crate::domain::ports::ResourceCache;
use crate::error::Result;
use crate::kubernetes::informer::Informer;
use crate::replicator::classifier::EventClassifier;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone, Default)]
pub struct ClusterCache {
    claims: Arc<Informer<PersistentVolumeClaim>>,
    namespaces: Arc<Informer<Namespace>>,
    replications: Arc<Informer<VolumeReplication>>,
}

impl ClusterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start one watcher per resource type, each feeding `classifier`
    pub fn spawn_watchers(
        &self,
        client: Client,
        classifier: Arc<EventClassifier>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let claims = {
            let classifier = Arc::clone(&classifier);
            tokio::spawn(Arc::clone(&self.claims).run(
                Api::all(client.clone()),
                move |change| classifier.claim_changed(change),
                shutdown.clone(),
            ))
        };
        let namespaces = {
            let classifier = Arc::clone(&classifier);
            tokio::spawn(Arc::clone(&self.namespaces).run(
                Api::all(client.clone()),
                move |change| classifier.namespace_changed(change),
                shutdown.clone(),
            ))
        };
        let replications = tokio::spawn(Arc::clone(&self.replications).run(
            Api::all(client),
            move |change| classifier.replication_changed(change),
            shutdown,
        ));

        vec![claims, namespaces, replications]
    }

    /// Wait until every watcher has applied its initial listing
    pub async fn wait_for_sync(&self) -> Result<()> {
        self.claims.wait_synced().await?;
        self.namespaces.wait_synced().await?;
        self.replications.wait_synced().await?;
        info!(
            "Caches synced: {} claim(s), {} namespace(s), {} VolumeReplication(s)",
            self.claims.len(),
            self.namespaces.len(),
            self.replications.len()
        );
        Ok(())
    }
}

impl ResourceCache for ClusterCache {
    fn claim(&self, key: &ClaimKey) -> Option<PersistentVolumeClaim> {
        self.claims.get(key)
    }

    fn namespace(&self, name: &str) -> Option<Namespace> {
        self.namespaces.get(&ClaimKey::new("", name))
    }

    fn claims_in_namespace(&self, namespace: &str) -> Vec<ClaimKey> {
        self.claims
            .keys()
            .into_iter()
            .filter(|key| key.namespace == namespace)
            .collect()
    }

    fn claim_keys(&self) -> Vec<ClaimKey> {
        self.claims.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use kube::runtime::watcher::Event;

    fn claim(namespace: &str, name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_reads_from_informers() {
        let cache = ClusterCache::new();
        cache.claims.apply(Event::Restarted(vec![
            claim("apps", "data-1"),
            claim("apps", "data-2"),
            claim("db", "data-1"),
        ]));
        cache.namespaces.apply(Event::Applied(Namespace {
            metadata: ObjectMeta {
                name: Some("apps".into()),
                ..Default::default()
            },
            ..Default::default()
        }));

        assert!(cache.claim(&ClaimKey::new("db", "data-1")).is_some());
        assert!(cache.claim(&ClaimKey::new("db", "data-2")).is_none());
        assert!(cache.namespace("apps").is_some());
        assert!(cache.namespace("db").is_none());

        let mut keys = cache.claims_in_namespace("apps");
        keys.sort();
        assert_eq!(
            keys,
            vec![ClaimKey::new("apps", "data-1"), ClaimKey::new("apps", "data-2")]
        );
        assert_eq!(cache.claim_keys().len(), 3);
    }
}
