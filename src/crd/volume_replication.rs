//! VolumeReplication CRD
//!
//! The csi-addons resource mirrored for every replicated claim. Only the
//! fields this controller writes or compares are modelled.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// VolumeReplication CRD
// =============================================================================

/// VolumeReplication enables replication of the data behind a
/// PersistentVolumeClaim using the referenced VolumeReplicationClass.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "replication.storage.openshift.io",
    version = "v1alpha1",
    kind = "VolumeReplication",
    plural = "volumereplications",
    shortname = "vr",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.volumeReplicationClass"}"#,
    printcolumn = r#"{"name": "PVC", "type": "string", "jsonPath": ".spec.dataSource.name"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".spec.replicationState"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationSpec {
    /// Name of the VolumeReplicationClass driving the replication
    pub volume_replication_class: String,

    /// Desired replication role of the volume
    pub replication_state: ReplicationState,

    /// Object whose data is replicated
    pub data_source: DataSourceReference,

    /// Resync automatically after a split-brain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resync: Option<bool>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Replication role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    Primary,
    Secondary,
    Resync,
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationState::Primary => write!(f, "primary"),
            ReplicationState::Secondary => write!(f, "secondary"),
            ReplicationState::Resync => write!(f, "resync"),
        }
    }
}

/// Typed reference to the replicated object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

/// API group recorded in data source references to claims
pub const CLAIM_API_GROUP: &str = "v1";

/// Kind recorded in data source references to claims
pub const CLAIM_KIND: &str = "PersistentVolumeClaim";

impl DataSourceReference {
    /// Reference to the claim with the given name
    pub fn claim(name: impl Into<String>) -> Self {
        Self {
            api_group: Some(CLAIM_API_GROUP.to_string()),
            kind: CLAIM_KIND.to_string(),
            name: name.into(),
        }
    }

    /// Whether this reference points at exactly the named claim
    pub fn is_claim(&self, name: &str) -> bool {
        self.api_group.as_deref() == Some(CLAIM_API_GROUP)
            && self.kind == CLAIM_KIND
            && self.name == name
    }
}

impl VolumeReplication {
    /// Whether the object carries a non-empty parent label, i.e. was created
    /// by this controller
    pub fn is_owned(&self, parent_label: &str) -> bool {
        self.labels()
            .get(parent_label)
            .is_some_and(|parent| !parent.is_empty())
    }
}
