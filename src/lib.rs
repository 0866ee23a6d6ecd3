//! Volume Replicator
//!
//! A Kubernetes controller keeping one VolumeReplication per
//! PersistentVolumeClaim whose resolved VolumeReplicationClass is non-empty,
//! and removing the VolumeReplications it created once that no longer holds.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Kubernetes API server                         │
//! └───────┬──────────────────────┬───────────────────────────▲───────────┘
//!         │ watch                │ get / list                │ create / delete
//! ┌───────▼────────┐   ┌─────────┴─────────┐   ┌─────────────┴──────────┐
//! │  ClusterCache  │   │  PolicySource     │   │  ReplicationStore      │
//! │  (informers)   │   │  (StorageClasses, │   │  (VolumeReplications)  │
//! └───────┬────────┘   │   VRClasses)      │   └─────────────▲──────────┘
//!         │            └─────────▲─────────┘                 │
//! ┌───────▼────────┐   ┌─────────┴─────────┐   ┌─────────────┴──────────┐
//! │ EventClassifier├──►│ Controller +      ├──►│  Reconciler            │
//! │                │   │ WorkQueue         │   │  (+ PolicyResolver)    │
//! └────────────────┘   └───────────────────┘   └────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`replicator`]: Policy resolution, reconciliation, event classification
//!   and the work queue
//! - [`kubernetes`]: Watch caches, API adapters and leader election
//! - [`crd`]: VolumeReplication and VolumeReplicationClass resources
//! - [`domain`]: Claim keys, change notifications and port traits
//! - [`config`]: Annotation keys and controller settings
//! - [`error`]: Error types and retry policy

pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod kubernetes;
pub mod replicator;

// Re-export commonly used types
pub use config::{LeaderElectionConfig, ReplicationKeys, ReplicatorConfig};

pub use crd::{
    DataSourceReference, ReplicationState, VolumeReplication, VolumeReplicationClass,
    VolumeReplicationClassSpec, VolumeReplicationSpec,
};

pub use domain::ports::{LeaseStore, PolicySource, ReplicationStore, ResourceCache};
pub use domain::{ClaimKey, ResourceChange};

pub use error::{Error, ErrorAction, Result};

pub use kubernetes::{
    run_replicator, ClusterCache, KubeLeaseApi, KubeReplicationApi, LeaderElector,
};

pub use replicator::{
    Controller, EventClassifier, ExclusionFilter, PolicyResolver, ReconcileOutcome, Reconciler,
    ReplicatorMetrics, WorkQueue,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
