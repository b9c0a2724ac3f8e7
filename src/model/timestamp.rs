//! Timestamps used across segments, chunks and tombstones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanosecond-precision point in time used for all time-range comparisons
/// in the merge engine (segment bounds, chunk bounds, tombstone end times).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Current wall-clock time, used for squeeze output filenames (§4.6).
    pub fn now() -> Self {
        let now = Utc::now();
        Self(now.timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    pub fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.as_secs(), (self.0.rem_euclid(1_000_000_000)) as u32)
            .unwrap_or_else(Utc::now)
    }

    pub fn saturating_add(&self, nanos: i64) -> Self {
        Self(self.0.saturating_add(nanos))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A closed `[start, end]` time interval, used for segment and device
/// min/max ranges in the resource descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start <= end, "time range start must not exceed end");
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_detection() {
        let a = TimeRange::new(Timestamp::from_secs(0), Timestamp::from_secs(10));
        let b = TimeRange::new(Timestamp::from_secs(10), Timestamp::from_secs(20));
        let c = TimeRange::new(Timestamp::from_secs(11), Timestamp::from_secs(20));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn ordering_is_total() {
        let mut ts: Vec<Timestamp> = vec![
            Timestamp::from_secs(5),
            Timestamp::from_secs(1),
            Timestamp::from_secs(3),
        ];
        ts.sort();
        assert_eq!(
            ts,
            vec![
                Timestamp::from_secs(1),
                Timestamp::from_secs(3),
                Timestamp::from_secs(5)
            ]
        );
    }
}
