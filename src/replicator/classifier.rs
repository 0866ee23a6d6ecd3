//! Event Classifier
//!
//! Turns watch notifications for claims, namespaces and VolumeReplications
//! into claim keys on the ingestion channel. Notifications that cannot change
//! the outcome of a reconcile are dropped here:
//!
//! - namespace updates only matter when the class annotation changed value
//! - VolumeReplication updates only matter for our objects, and only when
//!   their spec changed
//! - excluded claims are never enqueued

use crate::config::ReplicationKeys;
use crate::crd::VolumeReplication;
use crate::domain::events::ResourceChange;
use crate::domain::key::ClaimKey;
use crate::domain::ports::ResourceCacheRef;
use crate::error::Error;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim};
use kube::ResourceExt;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// Exclusion Filter
// =============================================================================

/// Claim names matching this pattern are kept out of replication
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    pattern: Option<Regex>,
}

impl ExclusionFilter {
    /// Compile the pattern. An empty or invalid pattern excludes nothing.
    pub fn new(pattern: &str) -> Self {
        if pattern.is_empty() {
            return Self::default();
        }

        match Regex::new(pattern) {
            Ok(regex) => {
                info!("Excluding claims matching {:?} from replication", pattern);
                Self {
                    pattern: Some(regex),
                }
            }
            Err(e) => {
                let err = Error::MalformedExclusionPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                };
                warn!("{}, no claim will be excluded", err);
                Self::default()
            }
        }
    }

    pub fn is_excluded(&self, claim_name: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|regex| regex.is_match(claim_name))
    }

    pub fn is_active(&self) -> bool {
        self.pattern.is_some()
    }
}

// =============================================================================
// Event Classifier
// =============================================================================

/// Maps watch notifications to the claim keys needing a reconcile
pub struct EventClassifier {
    cache: ResourceCacheRef,
    keys: Arc<ReplicationKeys>,
    exclusion: Arc<ExclusionFilter>,
    sink: mpsc::UnboundedSender<ClaimKey>,
}

impl EventClassifier {
    pub fn new(
        cache: ResourceCacheRef,
        keys: Arc<ReplicationKeys>,
        exclusion: Arc<ExclusionFilter>,
        sink: mpsc::UnboundedSender<ClaimKey>,
    ) -> Self {
        Self {
            cache,
            keys,
            exclusion,
            sink,
        }
    }

    /// Every claim change is reconciled; the reconciler recomputes everything
    pub fn classify_claim(&self, change: &ResourceChange<PersistentVolumeClaim>) -> Vec<ClaimKey> {
        let key = ClaimKey::of(change.object());
        debug!("Detected claim {} {}", change.verb(), key);
        self.admit(vec![key])
    }

    /// Namespace updates fan out to the namespace's claims when the class
    /// annotation changed value
    pub fn classify_namespace(&self, change: &ResourceChange<Namespace>) -> Vec<ClaimKey> {
        let ResourceChange::Updated { old, new } = change else {
            return Vec::new();
        };

        let annotation = &self.keys.policy_value_annotation;
        let value = |ns: &Namespace| -> String {
            ns.annotations().get(annotation).cloned().unwrap_or_default()
        };
        if value(old) == value(new) {
            return Vec::new();
        }

        let name = new.name_any();
        info!("Detected VolumeReplicationClass update for namespace {}", name);
        self.admit(self.cache.claims_in_namespace(&name))
    }

    /// VolumeReplication creations and deletions always map back to their
    /// claim; updates only when the object is ours and its spec changed
    pub fn classify_replication(&self, change: &ResourceChange<VolumeReplication>) -> Vec<ClaimKey> {
        let key = ClaimKey::of(change.object());

        if let ResourceChange::Updated { old, new } = change {
            if !new.is_owned(&self.keys.parent_label) {
                debug!("Ignoring update to VolumeReplication {} as it isn't controlled by us", key);
                return Vec::new();
            }
            if old.spec == new.spec {
                return Vec::new();
            }
        }

        info!("Detected VolumeReplication {} {}", change.verb(), key);
        self.admit(vec![key])
    }

    pub fn claim_changed(&self, change: ResourceChange<PersistentVolumeClaim>) {
        self.dispatch(self.classify_claim(&change));
    }

    pub fn namespace_changed(&self, change: ResourceChange<Namespace>) {
        self.dispatch(self.classify_namespace(&change));
    }

    pub fn replication_changed(&self, change: ResourceChange<VolumeReplication>) {
        self.dispatch(self.classify_replication(&change));
    }

    /// Drop excluded claims
    fn admit(&self, keys: Vec<ClaimKey>) -> Vec<ClaimKey> {
        keys.into_iter()
            .filter(|key| {
                let excluded = self.exclusion.is_excluded(&key.name);
                if excluded {
                    debug!("Claim {} is excluded from replication", key);
                }
                !excluded
            })
            .collect()
    }

    fn dispatch(&self, keys: Vec<ClaimKey>) {
        for key in keys {
            if self.sink.send(key).is_err() {
                debug!("Ingestion channel closed, dropping remaining keys");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PARENT_LABEL, POLICY_VALUE_ANNOTATION};
    use crate::crd::DataSourceReference;
    use crate::replicator::testing::*;

    fn classifier(
        cluster: &Arc<FakeCluster>,
        exclusion: &str,
    ) -> (EventClassifier, mpsc::UnboundedReceiver<ClaimKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let classifier = EventClassifier::new(
            cluster.clone(),
            Arc::new(ReplicationKeys::default()),
            Arc::new(ExclusionFilter::new(exclusion)),
            tx,
        );
        (classifier, rx)
    }

    #[test]
    fn test_exclusion_filter() {
        let filter = ExclusionFilter::new("^tmp-");
        assert!(filter.is_active());
        assert!(filter.is_excluded("tmp-cache"));
        assert!(!filter.is_excluded("data-1"));

        let empty = ExclusionFilter::new("");
        assert!(!empty.is_active());
        assert!(!empty.is_excluded("tmp-cache"));
    }

    #[test]
    fn test_malformed_exclusion_excludes_nothing() {
        let filter = ExclusionFilter::new("(unclosed");
        assert!(!filter.is_active());
        assert!(!filter.is_excluded("(unclosed"));
    }

    #[test]
    fn test_claim_changes_always_enqueue() {
        let cluster = Arc::new(FakeCluster::new());
        let (classifier, _rx) = classifier(&cluster, "");
        let pvc = claim("apps", "data-1", &[]);
        let expected = vec![ClaimKey::new("apps", "data-1")];

        assert_eq!(classifier.classify_claim(&ResourceChange::Added(pvc.clone())), expected);
        assert_eq!(
            classifier.classify_claim(&ResourceChange::Updated {
                old: pvc.clone(),
                new: pvc.clone(),
            }),
            expected
        );
        assert_eq!(classifier.classify_claim(&ResourceChange::Deleted(pvc)), expected);
    }

    #[test]
    fn test_excluded_claims_are_dropped() {
        let cluster = Arc::new(FakeCluster::new());
        let (classifier, _rx) = classifier(&cluster, "^scratch-");

        let pvc = claim("apps", "scratch-1", &[]);
        assert!(classifier.classify_claim(&ResourceChange::Added(pvc)).is_empty());

        let vr = owned_replication("apps", "scratch-1", "gold");
        assert!(classifier
            .classify_replication(&ResourceChange::Deleted(vr))
            .is_empty());
    }

    #[test]
    fn test_namespace_update_fans_out_on_value_change() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_claim(claim("apps", "data-1", &[]));
        cluster.put_claim(claim("apps", "data-2", &[]));
        cluster.put_claim(claim("other", "data-3", &[]));
        let (classifier, _rx) = classifier(&cluster, "");

        let change = ResourceChange::Updated {
            old: namespace("apps", &[(POLICY_VALUE_ANNOTATION, "gold")]),
            new: namespace("apps", &[(POLICY_VALUE_ANNOTATION, "silver")]),
        };
        let mut keys = classifier.classify_namespace(&change);
        keys.sort();
        assert_eq!(
            keys,
            vec![ClaimKey::new("apps", "data-1"), ClaimKey::new("apps", "data-2")]
        );
    }

    #[test]
    fn test_namespace_update_compares_values() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_claim(claim("apps", "data-1", &[]));
        let (classifier, _rx) = classifier(&cluster, "");

        let unchanged = ResourceChange::Updated {
            old: namespace("apps", &[(POLICY_VALUE_ANNOTATION, "gold"), ("team", "a")]),
            new: namespace("apps", &[(POLICY_VALUE_ANNOTATION, "gold"), ("team", "b")]),
        };
        assert!(classifier.classify_namespace(&unchanged).is_empty());

        let empty_to_missing = ResourceChange::Updated {
            old: namespace("apps", &[(POLICY_VALUE_ANNOTATION, "")]),
            new: namespace("apps", &[]),
        };
        assert!(classifier.classify_namespace(&empty_to_missing).is_empty());

        let removed = ResourceChange::Updated {
            old: namespace("apps", &[(POLICY_VALUE_ANNOTATION, "gold")]),
            new: namespace("apps", &[]),
        };
        assert_eq!(classifier.classify_namespace(&removed).len(), 1);
    }

    #[test]
    fn test_namespace_add_and_delete_are_ignored() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_claim(claim("apps", "data-1", &[]));
        let (classifier, _rx) = classifier(&cluster, "");
        let ns = namespace("apps", &[(POLICY_VALUE_ANNOTATION, "gold")]);

        assert!(classifier
            .classify_namespace(&ResourceChange::Added(ns.clone()))
            .is_empty());
        assert!(classifier
            .classify_namespace(&ResourceChange::Deleted(ns))
            .is_empty());
    }

    #[test]
    fn test_replication_add_and_delete_enqueue_claim() {
        let cluster = Arc::new(FakeCluster::new());
        let (classifier, _rx) = classifier(&cluster, "");
        let expected = vec![ClaimKey::new("apps", "data-1")];

        let unowned = unowned_replication("apps", "data-1", "gold");
        assert_eq!(
            classifier.classify_replication(&ResourceChange::Added(unowned)),
            expected
        );
        let owned = owned_replication("apps", "data-1", "gold");
        assert_eq!(
            classifier.classify_replication(&ResourceChange::Deleted(owned)),
            expected
        );
    }

    #[test]
    fn test_replication_update_requires_ownership_and_spec_change() {
        let cluster = Arc::new(FakeCluster::new());
        let (classifier, _rx) = classifier(&cluster, "");

        let old = owned_replication("apps", "data-1", "gold");
        let mut relabelled = old.clone();
        relabelled
            .labels_mut()
            .insert("team".to_string(), "storage".to_string());
        assert!(classifier
            .classify_replication(&ResourceChange::Updated {
                old: old.clone(),
                new: relabelled,
            })
            .is_empty());

        let mut retargeted = old.clone();
        retargeted.spec.data_source = DataSourceReference::claim("data-2");
        assert_eq!(
            classifier.classify_replication(&ResourceChange::Updated {
                old: old.clone(),
                new: retargeted.clone(),
            }),
            vec![ClaimKey::new("apps", "data-1")]
        );

        let mut disowned = retargeted;
        disowned.labels_mut().remove(PARENT_LABEL);
        assert!(classifier
            .classify_replication(&ResourceChange::Updated { old, new: disowned })
            .is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_sends_to_channel() {
        let cluster = Arc::new(FakeCluster::new());
        let (classifier, mut rx) = classifier(&cluster, "");

        classifier.claim_changed(ResourceChange::Added(claim("apps", "data-1", &[])));
        assert_eq!(rx.recv().await, Some(ClaimKey::new("apps", "data-1")));
    }
}
