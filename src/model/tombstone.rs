//! Deletion tombstones and the per-(segment, series) tombstone cache.

use super::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A `(series, endTime, version)` triple: "points at or before `end_time`
/// were deleted at `version`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub series_path: String,
    pub end_time: Timestamp,
    pub version: u64,
}

impl Tombstone {
    pub fn applies_to(&self, series_path: &str) -> bool {
        self.series_path == series_path
    }

    pub fn drops(&self, timestamp: Timestamp) -> bool {
        self.end_time >= timestamp
    }
}

/// Per-(segment, series) cache of tombstones, consumed monotonically: a
/// series is visited at most once per merge (§4.1 `modifications`), so the
/// cache removes an entry the moment it is handed out.
#[derive(Debug, Default)]
pub struct TombstoneCache {
    by_series: HashMap<String, Vec<Tombstone>>,
}

impl TombstoneCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(tombstones: Vec<Tombstone>) -> Self {
        let mut by_series: HashMap<String, Vec<Tombstone>> = HashMap::new();
        for t in tombstones {
            by_series.entry(t.series_path.clone()).or_default().push(t);
        }
        Self { by_series }
    }

    /// Destructively take the tombstones for `series_path`. A second call
    /// for the same series returns an empty list, per §4.1's "programming
    /// error" note — we choose to return empty rather than panic, since the
    /// cache has no way to distinguish "never had any" from "already taken".
    pub fn take(&mut self, series_path: &str) -> Vec<Tombstone> {
        self.by_series.remove(series_path).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tombstone(series: &str, end: i64, version: u64) -> Tombstone {
        Tombstone {
            series_path: series.to_string(),
            end_time: Timestamp::from_secs(end),
            version,
        }
    }

    #[test]
    fn take_is_destructive() {
        let mut cache = TombstoneCache::load(vec![tombstone("d1.m1", 50, 1)]);
        let first = cache.take("d1.m1");
        assert_eq!(first.len(), 1);
        let second = cache.take("d1.m1");
        assert!(second.is_empty());
    }

    #[test]
    fn drops_point_at_or_before_end_time() {
        let t = tombstone("d1.m1", 50, 1);
        assert!(t.drops(Timestamp::from_secs(50)));
        assert!(t.drops(Timestamp::from_secs(10)));
        assert!(!t.drops(Timestamp::from_secs(51)));
    }
}
