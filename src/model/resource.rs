//! Resource descriptor sidecar: per-device time bounds and ancestor set.

use super::timestamp::{TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// `<file>.resource`: device → (minTime, maxTime) plus the set of ancestor
/// generations (§3, §6). Ancestor sets only grow (§8 "ancestor
/// monotonicity").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    device_ranges: BTreeMap<String, TimeRange>,
    ancestor_generations: BTreeSet<u64>,
}

impl ResourceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, device: &str, timestamp: Timestamp) {
        self.device_ranges
            .entry(device.to_string())
            .and_modify(|r| {
                r.start = r.start.min(timestamp);
                r.end = r.end.max(timestamp);
            })
            .or_insert_with(|| TimeRange::new(timestamp, timestamp));
    }

    pub fn device_range(&self, device: &str) -> Option<TimeRange> {
        self.device_ranges.get(device).copied()
    }

    pub fn devices(&self) -> impl Iterator<Item = &String> {
        self.device_ranges.keys()
    }

    pub fn max_end_time(&self) -> Option<Timestamp> {
        self.device_ranges.values().map(|r| r.end).max()
    }

    pub fn ancestor_generations(&self) -> &BTreeSet<u64> {
        &self.ancestor_generations
    }

    /// Grow the ancestor set with another segment's ancestors (including
    /// its own generation). Monotonic by construction: `BTreeSet::extend`
    /// never removes entries.
    pub fn merge_ancestors(&mut self, own_generation: u64, other: &ResourceDescriptor) {
        self.ancestor_generations.insert(own_generation);
        self.ancestor_generations
            .extend(other.ancestor_generations.iter().copied());
    }

    /// Union two descriptors' device ranges (used when back-patching /
    /// squeezing so the merged file's resource sidecar covers every input).
    pub fn union(&mut self, other: &ResourceDescriptor) {
        for (device, range) in &other.device_ranges {
            self.device_ranges
                .entry(device.clone())
                .and_modify(|r| *r = r.union(range))
                .or_insert(*range);
        }
    }

    pub fn overlaps_range(&self, device: &str, range: &TimeRange) -> bool {
        self.device_ranges
            .get(device)
            .map(|r| r.overlaps(range))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_set_only_grows() {
        let mut a = ResourceDescriptor::new();
        a.merge_ancestors(1, &ResourceDescriptor::new());
        assert_eq!(a.ancestor_generations().len(), 1);

        let mut b = ResourceDescriptor::new();
        b.merge_ancestors(2, &ResourceDescriptor::new());

        a.merge_ancestors(3, &b);
        assert!(a.ancestor_generations().contains(&1));
        assert!(a.ancestor_generations().contains(&2));
        assert!(a.ancestor_generations().contains(&3));
        assert_eq!(a.ancestor_generations().len(), 3);
    }

    #[test]
    fn record_widens_device_range() {
        let mut d = ResourceDescriptor::new();
        d.record("dev1", Timestamp::from_secs(10));
        d.record("dev1", Timestamp::from_secs(5));
        d.record("dev1", Timestamp::from_secs(20));
        let r = d.device_range("dev1").unwrap();
        assert_eq!(r.start, Timestamp::from_secs(5));
        assert_eq!(r.end, Timestamp::from_secs(20));
    }
}
