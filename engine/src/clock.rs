//! Logical clocks and replica identity.
//!
//! Every replica keeps a Lamport counter. Local mutations tick it; remote
//! entries are observed so that a later local edit always carries a clock
//! strictly greater than anything the replica has already seen. A [`Stamp`]
//! pairs a clock value with the replica that produced it and gives a total
//! order used for deterministic tie-breaking.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Stable identity of a replica (one running instance of the application).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Wrap an identifier. Generation is the caller's concern.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Largest clock an entry may carry. The server stores clocks as `BIGINT`.
pub const MAX_CLOCK: u64 = i64::MAX as u64;

/// Per-replica Lamport counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalClock {
    counter: u64,
}

impl LogicalClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock with a specific counter value.
    pub fn with_counter(counter: u64) -> Self {
        Self { counter }
    }

    /// Current counter value.
    pub fn now(&self) -> u64 {
        self.counter
    }

    /// Increment the clock and return the new value.
    ///
    /// Past [`MAX_CLOCK`] the value stops growing and every entry built
    /// from it fails validation.
    pub fn tick(&mut self) -> u64 {
        self.counter = self.counter.saturating_add(1);
        self.counter
    }

    /// Move the clock forward so it is at least `seen`.
    /// Used when merging remote entries.
    pub fn observe(&mut self, seen: u64) {
        self.counter = self.counter.max(seen.min(MAX_CLOCK));
    }

    /// Undo the most recent tick. Only valid right after `tick`.
    pub(crate) fn rewind(&mut self, to: u64) {
        debug_assert!(to <= self.counter);
        self.counter = to;
    }
}

/// A clock value tagged with the replica that produced it.
///
/// Ordering rules:
/// 1. Higher clock wins
/// 2. If clocks are equal, lexicographically higher origin wins
///
/// The origin comparison only breaks ties; it never expresses priority
/// between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamp {
    pub clock: u64,
    pub origin_id: ReplicaId,
}

impl Stamp {
    pub fn new(clock: u64, origin_id: impl Into<ReplicaId>) -> Self {
        Self {
            clock,
            origin_id: origin_id.into(),
        }
    }

    /// True if this stamp's clock is strictly below the other's.
    pub fn happened_before(&self, other: &Stamp) -> bool {
        self.clock < other.clock
    }

    /// Equal clocks from different replicas: neither one observed the other.
    pub fn is_concurrent_with(&self, other: &Stamp) -> bool {
        self.clock == other.clock && self.origin_id != other.origin_id
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.clock.cmp(&other.clock) {
            Ordering::Equal => self.origin_id.cmp(&other.origin_id),
            other => other,
        }
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.origin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = LogicalClock::new();
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn tick_increments_counter() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
    }

    #[test]
    fn observe_takes_max() {
        let mut clock = LogicalClock::with_counter(3);
        clock.observe(7);
        assert_eq!(clock.now(), 7);
        clock.observe(5);
        assert_eq!(clock.now(), 7);
        assert_eq!(clock.tick(), 8);
    }

    #[test]
    fn clock_never_wraps() {
        let mut clock = LogicalClock::new();
        clock.observe(u64::MAX);
        assert_eq!(clock.now(), MAX_CLOCK);
        assert_eq!(clock.tick(), MAX_CLOCK + 1);

        let mut clock = LogicalClock::with_counter(u64::MAX);
        assert_eq!(clock.tick(), u64::MAX);
    }

    #[test]
    fn stamp_ordering_by_clock() {
        let a = Stamp::new(1, "replica-b");
        let b = Stamp::new(2, "replica-a");
        assert!(a < b);
        assert!(a.happened_before(&b));
    }

    #[test]
    fn stamp_ordering_by_origin_when_clock_equal() {
        let a = Stamp::new(5, "replica-a");
        let b = Stamp::new(5, "replica-b");
        assert!(a < b);
        assert!(a.is_concurrent_with(&b));
        assert!(!a.happened_before(&b));
    }

    #[test]
    fn same_origin_is_not_concurrent() {
        let a = Stamp::new(5, "replica-a");
        assert!(!a.is_concurrent_with(&a.clone()));
    }

    #[test]
    fn serialization_format() {
        let stamp = Stamp::new(10, "replica-1");
        let json = serde_json::to_string(&stamp).unwrap();
        assert_eq!(json, r#"{"clock":10,"originId":"replica-1"}"#);

        let clock: LogicalClock = serde_json::from_str("42").unwrap();
        assert_eq!(clock.now(), 42);
    }
}
