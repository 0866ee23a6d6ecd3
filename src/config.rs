//! Replicator configuration
//!
//! Annotation and label keys the reconciliation core reads, plus the runtime
//! knobs of the controller and the leader election loop.

use std::time::Duration;

// =============================================================================
// Well-known keys
// =============================================================================

/// Annotation naming the VolumeReplicationClass directly (claim or namespace)
pub const POLICY_VALUE_ANNOTATION: &str = "replication.superphenix.net/class";

/// Annotation selecting a VolumeReplicationClass by label (claim or namespace).
/// The same key is the selector label carried by VolumeReplicationClasses.
pub const POLICY_SELECTOR_ANNOTATION: &str = "replication.superphenix.net/classSelector";

/// Label grouping StorageClasses with their VolumeReplicationClasses
pub const STORAGE_CLASS_GROUP_LABEL: &str = "replication.superphenix.net/storageClassGroup";

/// Label marking a VolumeReplication as managed by this controller
pub const PARENT_LABEL: &str = "replication.superphenix.net/parent";

/// Provisioner annotation set on claims by the external provisioner
pub const PROVISIONER_ANNOTATION: &str = "volume.kubernetes.io/storage-provisioner";

/// Pre-1.23 provisioner annotation, still set by some CSI drivers
pub const DEPRECATED_PROVISIONER_ANNOTATION: &str =
    "volume.beta.kubernetes.io/storage-provisioner";

/// Name of the Lease used for leader election
pub const LEASE_NAME: &str = "spx-volume-replicator-leader-election";

// =============================================================================
// Replication Keys
// =============================================================================

/// Annotation and label keys consumed by the resolver, reconciler and classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationKeys {
    pub policy_value_annotation: String,
    pub policy_selector_annotation: String,
    pub storage_class_group_label: String,
    pub provisioner_annotation: String,
    pub deprecated_provisioner_annotation: String,
    pub parent_label: String,
}

impl Default for ReplicationKeys {
    fn default() -> Self {
        Self {
            policy_value_annotation: POLICY_VALUE_ANNOTATION.to_string(),
            policy_selector_annotation: POLICY_SELECTOR_ANNOTATION.to_string(),
            storage_class_group_label: STORAGE_CLASS_GROUP_LABEL.to_string(),
            provisioner_annotation: PROVISIONER_ANNOTATION.to_string(),
            deprecated_provisioner_annotation: DEPRECATED_PROVISIONER_ANNOTATION.to_string(),
            parent_label: PARENT_LABEL.to_string(),
        }
    }
}

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the replication controller
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Keys read from claims, namespaces and classes
    pub keys: ReplicationKeys,
    /// Claims whose name matches this pattern are never replicated
    pub exclusion_regex: String,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Interval at which every cached claim is reconciled again
    pub resync_interval: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            keys: ReplicationKeys::default(),
            exclusion_regex: String::new(),
            workers: 1,
            resync_interval: Duration::from_secs(30 * 60),
        }
    }
}

// =============================================================================
// Leader Election Configuration
// =============================================================================

/// Configuration for Lease-based leader election
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Lease name
    pub lease_name: String,
    /// Namespace the controller is deployed in
    pub namespace: String,
    /// Identity written into the lease (usually the pod name)
    pub identity: String,
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps retrying renewals before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    pub retry_period: Duration,
    /// Clear the holder on shutdown so another instance takes over immediately
    pub release_on_cancel: bool,
}

impl LeaderElectionConfig {
    pub fn new(namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            lease_name: LEASE_NAME.to_string(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            release_on_cancel: true,
        }
    }
}
