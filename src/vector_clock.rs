//! Vector-clock causality primitive (spec §4.1).

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Concurrent,
    Equal,
}

/// Map from replica id to a monotonically-increasing counter. Missing
/// keys read as zero. `serde(transparent)` so it serializes on the wire
/// as the bare `{userId: count}` map spec §6 calls `VectorClockMap`,
/// with no `counters` wrapper field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: HashMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// counter <- counter + 1 for `user_id`.
    pub fn increment(&mut self, user_id: &str) -> u64 {
        let entry = self.counters.entry(user_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn get(&self, user_id: &str) -> u64 {
        self.counters.get(user_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, user_id: &str, value: u64) {
        self.counters.insert(user_id.to_string(), value);
    }

    /// For every id in either map, set local value to max(local, other).
    pub fn merge(&mut self, other: &VectorClock) {
        for (id, &count) in &other.counters {
            let entry = self.counters.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Four-way comparison over the union of ids.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let ids = self.counters.keys().chain(other.counters.keys());
        let mut self_dominates = false;
        let mut other_dominates = false;

        let mut seen = std::collections::HashSet::new();
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.get(id).cmp(&other.get(id)) {
                CmpOrdering::Greater => self_dominates = true,
                CmpOrdering::Less => other_dominates = true,
                CmpOrdering::Equal => {}
            }
        }

        match (self_dominates, other_dominates) {
            (true, true) => ClockOrdering::Concurrent,
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|&c| c == 0)
    }

    pub fn max_timestamp(&self) -> u64 {
        self.counters.values().copied().max().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_get() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.get("u1"), 0);
        clock.increment("u1");
        clock.increment("u1");
        assert_eq!(clock.get("u1"), 2);
    }

    #[test]
    fn merge_takes_max() {
        let mut a = VectorClock::new();
        a.set("u1", 3);
        a.set("u2", 1);

        let mut b = VectorClock::new();
        b.set("u1", 2);
        b.set("u2", 5);
        b.set("u3", 1);

        a.merge(&b);
        assert_eq!(a.get("u1"), 3);
        assert_eq!(a.get("u2"), 5);
        assert_eq!(a.get("u3"), 1);
    }

    /// S4: {u1:3, u2:2} vs {u1:2, u2:3} must compare as concurrent.
    #[test]
    fn concurrent_clocks() {
        let mut a = VectorClock::new();
        a.set("u1", 3);
        a.set("u2", 2);

        let mut b = VectorClock::new();
        b.set("u1", 2);
        b.set("u2", 3);

        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    /// S4: {u1:3, u2:2} vs {u1:4, u2:2} must compare as before.
    #[test]
    fn before_after_clocks() {
        let mut a = VectorClock::new();
        a.set("u1", 3);
        a.set("u2", 2);

        let mut b = VectorClock::new();
        b.set("u1", 4);
        b.set("u2", 2);

        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn equal_clocks() {
        let mut a = VectorClock::new();
        a.set("u1", 1);
        let b = a.clone();
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
    }

    #[test]
    fn empty_clock_reads_zero_for_missing_keys() {
        let clock = VectorClock::new();
        assert!(clock.is_empty());
        assert_eq!(clock.get("anyone"), 0);
    }

    #[test]
    fn json_round_trip() {
        let mut clock = VectorClock::new();
        clock.set("u1", 7);
        let json = clock.to_json().unwrap();
        let restored = VectorClock::from_json(&json).unwrap();
        assert_eq!(clock, restored);
    }
}
