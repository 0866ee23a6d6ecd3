//! VolumeReplicationClass CRD
//!
//! Cluster-scoped replication policy. Classes are selected either by name
//! or through their group and selector labels.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// VolumeReplicationClass describes how volumes of one provisioner are
/// replicated (schedule, destination, ...).
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "replication.storage.openshift.io",
    version = "v1alpha1",
    kind = "VolumeReplicationClass",
    plural = "volumereplicationclasses",
    shortname = "vrc",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Provisioner", "type": "string", "jsonPath": ".spec.provisioner"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationClassSpec {
    /// CSI driver handling volumes replicated with this class
    pub provisioner: String,

    /// Driver-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}
