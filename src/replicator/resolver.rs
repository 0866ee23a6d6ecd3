//! Replication Policy Resolver
//!
//! Works out which VolumeReplicationClass applies to a claim. A class is
//! either named directly through an annotation, or selected through the
//! claim's StorageClass group plus a selector annotation:
//!
//! ```text
//! claim annotation ──► namespace annotation ──► selector lookup
//!   (class value)        (class value)            │
//!                                                 ├─ selector (claim, then namespace)
//!                                                 ├─ StorageClass group label
//!                                                 ├─ classes labelled {group, selector}
//!                                                 └─ same provisioner as the claim
//! ```
//!
//! Every lookup failure degrades to "no class"; nothing is returned to the
//! caller as an error.

use crate::config::ReplicationKeys;
use crate::domain::key::ClaimKey;
use crate::domain::ports::{PolicySourceRef, ResourceCacheRef};
use crate::error::Error;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Resolves the VolumeReplicationClass name for a claim
#[derive(Clone)]
pub struct PolicyResolver {
    cache: ResourceCacheRef,
    policies: PolicySourceRef,
    keys: Arc<ReplicationKeys>,
}

impl PolicyResolver {
    pub fn new(cache: ResourceCacheRef, policies: PolicySourceRef, keys: Arc<ReplicationKeys>) -> Self {
        Self {
            cache,
            policies,
            keys,
        }
    }

    /// Resolve the class for a claim, `None` when no class applies
    pub async fn resolve(&self, claim: &PersistentVolumeClaim) -> Option<String> {
        let key = ClaimKey::of(claim);
        if let Some(value) = annotation_value(claim, None, &self.keys.policy_value_annotation) {
            return Some(value);
        }

        let namespace = self.cache.namespace(&key.namespace);
        if namespace.is_none() {
            warn!("Failed to retrieve parent namespace for claim {}", key);
        }
        if let Some(value) = annotation_value(
            claim,
            namespace.as_ref(),
            &self.keys.policy_value_annotation,
        ) {
            return Some(value);
        }

        self.resolve_from_selector(&key, claim, namespace.as_ref())
            .await
    }

    /// Find the single class matching the claim's group, selector and provisioner
    async fn resolve_from_selector(
        &self,
        key: &ClaimKey,
        claim: &PersistentVolumeClaim,
        namespace: Option<&Namespace>,
    ) -> Option<String> {
        let selector = annotation_value(claim, namespace, &self.keys.policy_selector_annotation)?;

        let storage_class = claim
            .spec
            .as_ref()
            .and_then(|spec| spec.storage_class_name.as_deref())
            .filter(|name| !name.is_empty());
        let Some(storage_class) = storage_class else {
            debug!("Claim {} has no StorageClass, cannot apply selector", key);
            return None;
        };

        let group = match self.policies.storage_class(storage_class).await {
            Ok(Some(class)) => class
                .labels()
                .get(&self.keys.storage_class_group_label)
                .filter(|group| !group.is_empty())
                .cloned(),
            Ok(None) => {
                warn!("StorageClass {} of claim {} not found", storage_class, key);
                return None;
            }
            Err(e) => {
                error!("Failed to get StorageClass group for claim {}: {}", key, e);
                return None;
            }
        };
        let Some(group) = group else {
            info!("No StorageClass group on claim {}", key);
            return None;
        };

        let labels = BTreeMap::from([
            (self.keys.storage_class_group_label.clone(), group),
            (self.keys.policy_selector_annotation.clone(), selector),
        ]);
        let classes = match self.policies.policies_matching(&labels).await {
            Ok(classes) => classes,
            Err(e) => {
                error!("Failed to filter VolumeReplicationClasses for claim {}: {}", key, e);
                return None;
            }
        };

        let provisioner = self.claim_provisioner(claim);
        let mut candidates: Vec<String> = classes
            .into_iter()
            .filter(|class| {
                // Some CSI drivers never annotate the provisioner
                let matches = provisioner.is_empty() || class.spec.provisioner == provisioner;
                if !matches {
                    debug!(
                        "Discarded VolumeReplicationClass {}: provisioner {}, expected {}",
                        class.name_any(),
                        class.spec.provisioner,
                        provisioner
                    );
                }
                matches
            })
            .map(|class| class.name_any())
            .collect();

        match candidates.len() {
            1 => candidates.pop(),
            0 => {
                debug!("No VolumeReplicationClass matches claim {}", key);
                None
            }
            _ => {
                let err = Error::AmbiguousPolicyMatch {
                    claim: key.to_string(),
                    candidates,
                };
                error!("{}", err);
                None
            }
        }
    }

    /// Provisioner recorded on the claim, empty when unknown
    fn claim_provisioner<'a>(&self, claim: &'a PersistentVolumeClaim) -> &'a str {
        let annotations = claim.annotations();
        [
            &self.keys.provisioner_annotation,
            &self.keys.deprecated_provisioner_annotation,
        ]
        .into_iter()
        .filter_map(|annotation| annotations.get(annotation))
        .map(String::as_str)
        .find(|value| !value.is_empty())
        .unwrap_or_default()
    }
}

/// Non-empty annotation from the claim, falling back to its namespace
fn annotation_value(
    claim: &PersistentVolumeClaim,
    namespace: Option<&Namespace>,
    annotation: &str,
) -> Option<String> {
    claim
        .annotations()
        .get(annotation)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            namespace
                .and_then(|ns| ns.metadata.annotations.as_ref())
                .and_then(|annotations| annotations.get(annotation))
                .filter(|value| !value.is_empty())
        })
        .cloned()
}
