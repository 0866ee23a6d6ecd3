//! Domain Ports - Boundaries between the reconciliation core and the cluster
//!
//! The resolver and reconciler only see these traits. The Kubernetes adapters
//! in [`crate::kubernetes`] implement them against the API server; tests
//! substitute in-memory versions.

use crate::crd::{VolumeReplication, VolumeReplicationClass};
use crate::domain::key::ClaimKey;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Resource Cache Port
// =============================================================================

/// Locally cached, eventually consistent view of claims and namespaces.
///
/// Lookups never fail: a missing object is reported as `None`.
pub trait ResourceCache: Send + Sync {
    /// Get a cached claim
    fn claim(&self, key: &ClaimKey) -> Option<PersistentVolumeClaim>;

    /// Get a cached namespace
    fn namespace(&self, name: &str) -> Option<Namespace>;

    /// Keys of every cached claim in a namespace
    fn claims_in_namespace(&self, namespace: &str) -> Vec<ClaimKey>;

    /// Keys of every cached claim
    fn claim_keys(&self) -> Vec<ClaimKey>;
}

// =============================================================================
// Policy Source Port
// =============================================================================

/// Read access to StorageClasses and VolumeReplicationClasses
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Get a StorageClass by name, `None` if it does not exist
    async fn storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    /// List the VolumeReplicationClasses carrying all of the given labels
    async fn policies_matching(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeReplicationClass>>;
}

// =============================================================================
// Replication Store Port
// =============================================================================

/// CRUD access to VolumeReplications
#[async_trait]
pub trait ReplicationStore: Send + Sync {
    /// Get the VolumeReplication with the claim's namespace and name
    async fn get(&self, key: &ClaimKey) -> Result<Option<VolumeReplication>>;

    /// Create a VolumeReplication
    async fn create(&self, replication: &VolumeReplication) -> Result<()>;

    /// Delete a VolumeReplication. Deleting a missing object succeeds.
    async fn delete(&self, key: &ClaimKey) -> Result<()>;
}

// =============================================================================
// Lease Store Port
// =============================================================================

/// Access to the leader election Lease objects of one namespace.
///
/// Writes are conditional on the resource version of the object passed in;
/// a stale write fails with a conflict.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Get a Lease by name, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Lease>>;

    /// Create a Lease
    async fn create(&self, lease: &Lease) -> Result<()>;

    /// Replace a Lease previously read with `get`
    async fn replace(&self, lease: &Lease) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceCacheRef = Arc<dyn ResourceCache>;
pub type PolicySourceRef = Arc<dyn PolicySource>;
pub type ReplicationStoreRef = Arc<dyn ReplicationStore>;
pub type LeaseStoreRef = Arc<dyn LeaseStore>;

/// Render a label map as an equality-based label selector
pub fn format_label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}
