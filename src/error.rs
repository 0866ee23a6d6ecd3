//! Error types for the volume replicator
//!
//! Provides structured error types for the reconciliation core, the
//! Kubernetes adapters and the process shell, together with the retry policy
//! the controller applies to each of them.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the replicator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch cache for {kind} closed before it synced")]
    CacheSync { kind: String },

    #[error("Leader election error: {0}")]
    LeaderElection(String),

    // =========================================================================
    // Replication Policy Errors
    // =========================================================================
    #[error("Found {} VolumeReplicationClasses matching claim {claim}, expected 1: {}", .candidates.len(), .candidates.join(", "))]
    AmbiguousPolicyMatch {
        claim: String,
        candidates: Vec<String>,
    },

    #[error("Invalid exclusion pattern {pattern:?}: {reason}")]
    MalformedExclusionPattern { pattern: String, reason: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // The cache will deliver the object again once it syncs
            Error::CacheSync { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Configuration problems - wait for changes
            Error::Configuration(_)
            | Error::AmbiguousPolicyMatch { .. }
            | Error::MalformedExclusionPattern { .. }
            | Error::Metrics(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Io(_))
    }

    /// Check if this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Check if this error reports a write against a stale resource version
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }
}

/// Result type alias for the replicator
pub type Result<T> = std::result::Result<T, Error>;
