//! C2: UnseqPointReader — the union of unsequence chunks for one series,
//! presented as an ordered-by-timestamp point stream.

use super::resource::MergeResource;
use crate::error::{Error, Result};
use crate::model::{Segment, TimeValuePair, Timestamp};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

struct Cursor {
    points: Vec<TimeValuePair>,
    next: usize,
    version: u64,
    /// Later-constructed segments get a higher order, so later-inserted
    /// wins a tie per the spec's tie-break policy.
    insertion_order: u64,
}

impl Cursor {
    fn peek(&self) -> Option<&TimeValuePair> {
        self.points.get(self.next)
    }

    fn advance(&mut self) {
        self.next += 1;
    }
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    timestamp: Timestamp,
    cursor_index: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the smallest timestamp first.
        other.timestamp.cmp(&self.timestamp)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Finite stream over the union of unsequence chunks touching one series.
/// Restartable only by constructing a fresh instance.
pub struct UnseqPointReader {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<HeapEntry>,
}

impl UnseqPointReader {
    pub fn build(resource: &MergeResource, series: &str, segments: &[Segment]) -> Result<Self> {
        let mut cursors = Vec::new();
        let mut heap = BinaryHeap::new();

        for (insertion_order, segment) in segments.iter().enumerate() {
            let chunks = resource.chunk_metadata(series, segment)?;
            if chunks.is_empty() {
                continue;
            }
            let tombstones = resource.modifications(segment, series)?;
            let reader = resource.reader(segment)?;

            for chunk in chunks {
                let mut deleted_at = None;
                for t in &tombstones {
                    if t.applies_to(series) {
                        deleted_at = Some(match deleted_at {
                            Some(existing) => std::cmp::max(existing, t.end_time),
                            None => t.end_time,
                        });
                    }
                }

                let raw_points = {
                    let mut guard = reader.lock().map_err(|_| {
                        Error::Inconsistent(format!("reader lock poisoned for {}", segment.id()))
                    })?;
                    match guard.read_chunk(&chunk) {
                        Ok(points) => points,
                        Err(e) if e.is_corrupt_input() => {
                            tracing::warn!(series, segment = %segment.id(), chunk_offset = chunk.offset, error = %e, "skipping corrupt unsequence chunk");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                };

                let points: Vec<TimeValuePair> = match deleted_at {
                    Some(end) => raw_points.into_iter().filter(|p| p.timestamp > end).collect(),
                    None => raw_points,
                };
                if points.is_empty() {
                    continue;
                }

                let cursor_index = cursors.len();
                let timestamp = points[0].timestamp;
                cursors.push(Cursor {
                    points,
                    next: 0,
                    version: chunk.version,
                    insertion_order: insertion_order as u64,
                });
                heap.push(HeapEntry {
                    timestamp,
                    cursor_index,
                });
            }
        }

        Ok(Self { cursors, heap })
    }

    /// Pops the next point in timestamp order, resolving ties by
    /// higher-version-wins, then later-inserted-wins.
    pub fn next_point(&mut self) -> Option<TimeValuePair> {
        let first = self.heap.pop()?;
        let min_timestamp = first.timestamp;
        let mut tied = vec![first.cursor_index];

        while let Some(top) = self.heap.peek() {
            if top.timestamp == min_timestamp {
                tied.push(self.heap.pop().unwrap().cursor_index);
            } else {
                break;
            }
        }

        let winner_index = pick_tie_winner(&tied, &self.cursors);

        let winner_point = self.cursors[winner_index].peek().cloned().expect("cursor has a point");

        for idx in tied {
            let cursor = &mut self.cursors[idx];
            cursor.advance();
            if let Some(p) = cursor.peek() {
                self.heap.push(HeapEntry {
                    timestamp: p.timestamp,
                    cursor_index: idx,
                });
            }
        }

        Some(winner_point)
    }
}

impl Iterator for UnseqPointReader {
    type Item = TimeValuePair;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_point()
    }
}

/// Picks the tie-break winner among cursor indices that share the minimum
/// timestamp: higher version wins, then later insertion order.
fn pick_tie_winner(tied: &[usize], cursors: &[Cursor]) -> usize {
    *tied
        .iter()
        .max_by_key(|&&idx| (cursors[idx].version, cursors[idx].insertion_order))
        .expect("tied is never empty")
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::model::ScalarValue;
    use proptest::prelude::*;

    fn cursor_with(version: u64, insertion_order: u64) -> Cursor {
        Cursor {
            points: vec![TimeValuePair::new(Timestamp::from_secs(0), ScalarValue::Int64(0))],
            next: 0,
            version,
            insertion_order,
        }
    }

    proptest! {
        #[test]
        fn tie_winner_always_has_the_max_version_then_insertion_order(
            pairs in proptest::collection::vec((0u64..50, 0u64..50), 1..12)
        ) {
            let cursors: Vec<Cursor> = pairs.iter().map(|&(v, o)| cursor_with(v, o)).collect();
            let tied: Vec<usize> = (0..cursors.len()).collect();
            let winner = pick_tie_winner(&tied, &cursors);
            let winner_key = (cursors[winner].version, cursors[winner].insertion_order);
            for &idx in &tied {
                let key = (cursors[idx].version, cursors[idx].insertion_order);
                prop_assert!(winner_key >= key);
            }
        }
    }
}
