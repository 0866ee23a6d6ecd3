//! VolumeReplication Reconciler
//!
//! For one claim key, decides whether its VolumeReplication must be created,
//! deleted or left alone, and performs at most one mutating call:
//!
//! | VolumeReplication | Claim                   | Class resolved | Action          |
//! |-------------------|-------------------------|----------------|-----------------|
//! | not ours          | any                     | -              | none            |
//! | ours              | absent / terminating    | -              | delete          |
//! | ours              | active                  | none           | delete          |
//! | ours              | active                  | differs        | delete (drift)  |
//! | ours              | active                  | matches        | none            |
//! | missing           | active                  | some           | create          |
//! | missing           | any other               | -              | none            |
//!
//! VolumeReplications are never updated in place. A drifted object is
//! deleted and the deletion event brings the claim back through the queue,
//! where the next pass creates it with the current class.

use crate::config::ReplicationKeys;
use crate::crd::{DataSourceReference, ReplicationState, VolumeReplication, VolumeReplicationSpec};
use crate::domain::key::ClaimKey;
use crate::domain::ports::{ReplicationStoreRef, ResourceCacheRef};
use crate::error::Result;
use crate::replicator::classifier::ExclusionFilter;
use crate::replicator::resolver::PolicyResolver;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, info};

// =============================================================================
// Claim State
// =============================================================================

/// Lifecycle state of a claim, derived from the cache on every pass
#[derive(Debug, Clone, Copy)]
pub enum ClaimState<'a> {
    Absent,
    MarkedForDeletion,
    Active(&'a PersistentVolumeClaim),
}

impl<'a> ClaimState<'a> {
    pub fn of(claim: Option<&'a PersistentVolumeClaim>) -> Self {
        match claim {
            None => ClaimState::Absent,
            Some(claim) if claim.metadata.deletion_timestamp.is_some() => {
                ClaimState::MarkedForDeletion
            }
            Some(claim) => ClaimState::Active(claim),
        }
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Why a pass left the VolumeReplication alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The claim name matches the exclusion pattern
    Excluded,
    /// The VolumeReplication exists without our parent label
    Unmanaged,
    /// No VolumeReplication exists and none is wanted
    NotReplicated,
    /// The VolumeReplication matches the claim
    UpToDate,
}

/// Why a VolumeReplication is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    ClaimAbsent,
    ClaimTerminating,
    PolicyRemoved,
    Drift,
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteReason::ClaimAbsent => write!(f, "its claim doesn't exist anymore"),
            DeleteReason::ClaimTerminating => write!(f, "its claim is being deleted"),
            DeleteReason::PolicyRemoved => write!(f, "no VolumeReplicationClass applies anymore"),
            DeleteReason::Drift => write!(f, "it doesn't conform to its claim anymore"),
        }
    }
}

/// What a pass should do
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    Create(VolumeReplication),
    Delete(DeleteReason),
}

/// What a pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged(SkipReason),
    Created { policy: String },
    Deleted(DeleteReason),
}

impl ReconcileOutcome {
    /// Metric label for this outcome
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Unchanged(_) => "unchanged",
            ReconcileOutcome::Created { .. } => "created",
            ReconcileOutcome::Deleted(_) => "deleted",
        }
    }
}

/// Decide the action for a claim given its current VolumeReplication and the
/// class resolved for it. `policy` is only consulted for active claims.
pub fn decide(
    state: ClaimState<'_>,
    existing: Option<&VolumeReplication>,
    policy: Option<&str>,
    parent_label: &str,
) -> Decision {
    if existing.is_some_and(|vr| !vr.is_owned(parent_label)) {
        return Decision::Skip(SkipReason::Unmanaged);
    }

    let claim = match state {
        ClaimState::Absent if existing.is_some() => {
            return Decision::Delete(DeleteReason::ClaimAbsent)
        }
        ClaimState::MarkedForDeletion if existing.is_some() => {
            return Decision::Delete(DeleteReason::ClaimTerminating)
        }
        ClaimState::Absent | ClaimState::MarkedForDeletion => {
            return Decision::Skip(SkipReason::NotReplicated)
        }
        ClaimState::Active(claim) => claim,
    };

    match (existing, policy) {
        (Some(_), None) => Decision::Delete(DeleteReason::PolicyRemoved),
        (Some(vr), Some(policy)) if is_replication_correct(claim, vr, policy) => {
            Decision::Skip(SkipReason::UpToDate)
        }
        (Some(_), Some(_)) => Decision::Delete(DeleteReason::Drift),
        (None, Some(policy)) => {
            Decision::Create(build_volume_replication(claim, policy, parent_label))
        }
        (None, None) => Decision::Skip(SkipReason::NotReplicated),
    }
}

/// Whether a VolumeReplication carries the resolved class and points at its claim
pub fn is_replication_correct(
    claim: &PersistentVolumeClaim,
    replication: &VolumeReplication,
    policy: &str,
) -> bool {
    let key = ClaimKey::of(replication);

    if replication.spec.volume_replication_class != policy {
        info!(
            "VolumeReplication {} has a replication class mismatch with its claim (got {}, expected {})",
            key, replication.spec.volume_replication_class, policy
        );
        return false;
    }

    if !replication.spec.data_source.is_claim(&claim.name_any()) {
        info!("VolumeReplication {} has a data source mismatch with its claim", key);
        return false;
    }

    true
}

/// VolumeReplication mirroring a claim: same name, namespace, annotations and
/// labels, plus the parent label
pub fn build_volume_replication(
    claim: &PersistentVolumeClaim,
    policy: &str,
    parent_label: &str,
) -> VolumeReplication {
    let name = claim.name_any();
    let mut labels = claim.metadata.labels.clone().unwrap_or_default();
    labels.insert(parent_label.to_string(), name.clone());

    VolumeReplication {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: claim.namespace(),
            annotations: claim.metadata.annotations.clone(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: VolumeReplicationSpec {
            volume_replication_class: policy.to_string(),
            replication_state: ReplicationState::Primary,
            data_source: DataSourceReference::claim(name),
            auto_resync: None,
        },
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles the VolumeReplication of one claim per call
pub struct Reconciler {
    cache: ResourceCacheRef,
    replications: ReplicationStoreRef,
    resolver: PolicyResolver,
    exclusion: Arc<ExclusionFilter>,
    keys: Arc<ReplicationKeys>,
}

impl Reconciler {
    pub fn new(
        cache: ResourceCacheRef,
        replications: ReplicationStoreRef,
        resolver: PolicyResolver,
        exclusion: Arc<ExclusionFilter>,
        keys: Arc<ReplicationKeys>,
    ) -> Self {
        Self {
            cache,
            replications,
            resolver,
            exclusion,
            keys,
        }
    }

    /// Bring the VolumeReplication of `key` in line with its claim.
    ///
    /// Errors are logged here and returned so the caller can schedule a retry.
    pub async fn reconcile(&self, key: &ClaimKey) -> Result<ReconcileOutcome> {
        if self.exclusion.is_excluded(&key.name) {
            debug!("Claim {} is excluded from replication", key);
            return Ok(ReconcileOutcome::Unchanged(SkipReason::Excluded));
        }

        info!("Reconciling VolumeReplication for claim {}", key);
        let claim = self.cache.claim(key);

        let existing = self.replications.get(key).await.map_err(|e| {
            error!("Couldn't get VolumeReplication for claim {}: {}", key, e);
            e
        })?;

        let state = ClaimState::of(claim.as_ref());
        let policy = match state {
            ClaimState::Active(claim) => self.resolver.resolve(claim).await,
            _ => None,
        };
        if let Some(policy) = &policy {
            info!("Found VolumeReplicationClass {} for claim {}", policy, key);
        }

        match decide(
            state,
            existing.as_ref(),
            policy.as_deref(),
            &self.keys.parent_label,
        ) {
            Decision::Skip(SkipReason::Unmanaged) => {
                info!("VolumeReplication {} isn't owned by us, skipping", key);
                Ok(ReconcileOutcome::Unchanged(SkipReason::Unmanaged))
            }
            Decision::Skip(reason) => {
                debug!("Nothing to do for claim {} ({:?})", key, reason);
                Ok(ReconcileOutcome::Unchanged(reason))
            }
            Decision::Delete(reason) => {
                info!("Deleting VolumeReplication {} as {}", key, reason);
                self.replications.delete(key).await.map_err(|e| {
                    error!("Couldn't delete VolumeReplication {}: {}", key, e);
                    e
                })?;
                Ok(ReconcileOutcome::Deleted(reason))
            }
            Decision::Create(replication) => {
                info!("Creating VolumeReplication for claim {}", key);
                self.replications.create(&replication).await.map_err(|e| {
                    error!("Failed to create VolumeReplication for claim {}: {}", key, e);
                    e
                })?;
                Ok(ReconcileOutcome::Created {
                    policy: replication.spec.volume_replication_class,
                })
            }
        }
    }
}
