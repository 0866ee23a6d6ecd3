//! Custom Resource Definitions used by the replicator
//!
//! This module contains the csi-addons replication types:
//! - VolumeReplication: per-claim replication object managed by the controller
//! - VolumeReplicationClass: replication policy selected for a claim

pub mod volume_replication;
pub mod volume_replication_class;

pub use volume_replication::*;
pub use volume_replication_class::*;
