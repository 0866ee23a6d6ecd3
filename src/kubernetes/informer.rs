//! Watch-backed object cache
//!
//! Keeps the latest version of every watched object and turns the raw
//! watcher stream into [`ResourceChange`]s carrying the previous version.

use crate::domain::events::ResourceChange;
use crate::domain::key::ClaimKey;
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cache of one resource type, fed by a watcher.
///
/// Objects are keyed by namespace and name; the namespace is empty for
/// cluster-scoped kinds.
pub struct Informer<K> {
    store: DashMap<ClaimKey, K>,
    synced: watch::Sender<bool>,
    kind: String,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store: DashMap::new(),
            synced,
            kind: K::kind(&K::DynamicType::default()).to_string(),
        }
    }

    pub fn get(&self, key: &ClaimKey) -> Option<K> {
        self.store.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<ClaimKey> {
        self.store.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial list has been applied
    pub async fn wait_synced(&self) -> Result<()> {
        let mut rx = self.synced.subscribe();
        rx.wait_for(|synced| *synced)
            .await
            .map(|_| ())
            .map_err(|_| Error::CacheSync {
                kind: self.kind.clone(),
            })
    }

    /// Apply a watcher event to the store and return the resulting changes
    pub fn apply(&self, event: Event<K>) -> Vec<ResourceChange<K>> {
        match event {
            Event::Applied(obj) => {
                let key = ClaimKey::of(&obj);
                match self.store.insert(key, obj.clone()) {
                    Some(old) => vec![ResourceChange::Updated { old, new: obj }],
                    None => vec![ResourceChange::Added(obj)],
                }
            }
            Event::Deleted(obj) => {
                self.store.remove(&ClaimKey::of(&obj));
                vec![ResourceChange::Deleted(obj)]
            }
            Event::Restarted(objs) => {
                let changes = self.replace(objs);
                if !self.is_synced() {
                    info!("{} cache synced with {} object(s)", self.kind, self.store.len());
                }
                self.synced.send_replace(true);
                changes
            }
        }
    }

    /// Replace the store with a fresh listing. Objects whose resource version
    /// didn't change produce no notification.
    fn replace(&self, objs: Vec<K>) -> Vec<ResourceChange<K>> {
        let mut changes = Vec::new();
        let mut seen = HashSet::with_capacity(objs.len());

        for obj in objs {
            let key = ClaimKey::of(&obj);
            seen.insert(key.clone());
            match self.store.insert(key, obj.clone()) {
                Some(old) if old.resource_version() == obj.resource_version() => {}
                Some(old) => changes.push(ResourceChange::Updated { old, new: obj }),
                None => changes.push(ResourceChange::Added(obj)),
            }
        }

        let stale: Vec<ClaimKey> = self
            .store
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            if let Some((_, old)) = self.store.remove(&key) {
                changes.push(ResourceChange::Deleted(old));
            }
        }

        changes
    }

    /// Watch `api` until cancelled, passing every change to `handler`
    pub async fn run<F>(self: Arc<Self>, api: Api<K>, handler: F, shutdown: CancellationToken)
    where
        F: Fn(ResourceChange<K>) + Send,
    {
        info!("Starting {} watcher", self.kind);
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        for change in self.apply(event) {
                            handler(change);
                        }
                    }
                    Some(Err(e)) => warn!("{} watch error: {}", self.kind, e),
                    None => {
                        warn!("{} watch stream ended", self.kind);
                        break;
                    }
                },
            }
        }

        debug!("{} watcher stopped", self.kind);
    }
}

impl<K> Default for Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn default() -> Self {
        Self::new()
    }
}
