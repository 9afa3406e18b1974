//! The set of live log indexes.
//!
//! A log index is live while its message is in `messages`, `returns`,
//! any consumer's checked-out set, or the dead-letter sidecar. The
//! smallest live index gates release-cursor emission: the substrate may
//! truncate its log strictly below it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::LogIndex;

/// Ordered set of live log indexes.
///
/// Insert, remove and smallest are all O(log n).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveIndexes {
    set: BTreeSet<LogIndex>,
}

impl LiveIndexes {
    /// Create an empty index set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an index as live. Returns false if it was already present.
    pub fn insert(&mut self, index: LogIndex) -> bool {
        self.set.insert(index)
    }

    /// Drop an index. Returns false if it was not present.
    pub fn remove(&mut self, index: LogIndex) -> bool {
        self.set.remove(&index)
    }

    /// The smallest live index, if any.
    pub fn smallest(&self) -> Option<LogIndex> {
        self.set.first().copied()
    }

    /// Whether `index` is live.
    pub fn contains(&self, index: LogIndex) -> bool {
        self.set.contains(&index)
    }

    /// Number of live indexes.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether no index is live.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Iterate live indexes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.set.iter().copied()
    }

    /// Drop every index.
    pub fn clear(&mut self) {
        self.set.clear();
    }
}
