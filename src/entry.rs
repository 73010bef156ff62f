use std::time::Duration;

use crate::clock::Instant;

/// A stored value together with the moment it was written.
///
/// Entries are never updated in place. Every accepted write builds a new
/// entry, so a reader holding a clone always sees a value and the timestamp
/// that belongs to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    value: V,
    timestamp: Instant,
}

impl<V> Entry<V> {
    /// Stamps `value` with the current instant.
    pub fn new(value: V) -> Self {
        Self::at(value, Instant::now())
    }

    pub(crate) fn at(value: V, timestamp: Instant) -> Self {
        Entry { value, timestamp }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Time since this entry was written. Never negative.
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.timestamp)
    }
}
