//! Resource change notifications
//!
//! Emitted by the watch caches for every observed transition of a watched
//! object, with the previous version attached to updates.

/// A change observed on a watched object
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceChange<K> {
    /// The object appeared in the cache
    Added(K),

    /// A new version of a cached object was observed
    Updated { old: K, new: K },

    /// The object disappeared from the cache
    Deleted(K),
}

impl<K> ResourceChange<K> {
    /// The most recent version of the object
    pub fn object(&self) -> &K {
        match self {
            ResourceChange::Added(obj) => obj,
            ResourceChange::Updated { new, .. } => new,
            ResourceChange::Deleted(obj) => obj,
        }
    }

    /// Short name of the transition, used in logs and metrics
    pub fn verb(&self) -> &'static str {
        match self {
            ResourceChange::Added(_) => "added",
            ResourceChange::Updated { .. } => "updated",
            ResourceChange::Deleted(_) => "deleted",
        }
    }
}
