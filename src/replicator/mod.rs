//! Replication Engine
//!
//! Everything deciding which VolumeReplication a claim should have, independent
//! of how claims and replications are stored:
//!
//! ```text
//! watch events ──► EventClassifier ──► mpsc ──► Controller ──► WorkQueue
//!                                                                  │
//!                        PolicyResolver ◄── Reconciler ◄── workers ┘
//! ```

pub mod classifier;
pub mod controller;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{EventClassifier, ExclusionFilter};
pub use controller::Controller;
pub use metrics::ReplicatorMetrics;
pub use queue::WorkQueue;
pub use reconciler::{Decision, ReconcileOutcome, Reconciler};
pub use resolver::PolicyResolver;
