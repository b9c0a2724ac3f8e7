//! Shared chunk provider (§9 design note): sub-workers fetch chunk bytes
//! through here so the same chunk is never read twice per segment even
//! when two series sharing that segment land on different sub-workers.

use super::resource::MergeResource;
use crate::error::{Error, Result};
use crate::model::{ChunkMetadata, Segment, SegmentId, TimeValuePair};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

enum Slot {
    InFlight,
    Ready(Arc<Vec<TimeValuePair>>),
}

/// One in-flight/ready chunk fetch, plus the count of callers currently
/// blocked on it. The entry is only dropped from the map once every
/// registered waiter has collected the result, so a waiter woken by
/// `notify_all` can never find its slot already gone.
struct Entry {
    slot: Slot,
    waiters: usize,
}

/// Dedup key: a chunk offset is only unique within the segment it came
/// from, so two different segments whose temp writers happen to land the
/// same offset must never collide in the in-flight map.
type ChunkKey = (SegmentId, u64);

/// Bounded in-flight set keyed by `(segment, chunk offset)`. Chunks are
/// never cached once delivered: an entry is removed the instant its value
/// has been handed to every waiter that was already queued on it.
pub struct ChunkProvider {
    inflight: Mutex<HashMap<ChunkKey, Entry, ahash::RandomState>>,
    condvar: Condvar,
}

impl ChunkProvider {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::with_hasher(ahash::RandomState::default())),
            condvar: Condvar::new(),
        }
    }

    /// Fetches `chunk`'s decoded points from `segment` via `resource`,
    /// deduplicating concurrent requests for the same chunk.
    pub fn require(
        &self,
        resource: &MergeResource,
        segment: &Segment,
        chunk: &ChunkMetadata,
    ) -> Result<Arc<Vec<TimeValuePair>>> {
        let key: ChunkKey = (segment.id(), chunk.offset);
        loop {
            let mut guard = self
                .inflight
                .lock()
                .map_err(|_| Error::Inconsistent("chunk provider lock poisoned".to_string()))?;

            match guard.get_mut(&key) {
                Some(entry) => match &entry.slot {
                    Slot::Ready(points) => {
                        let result = points.clone();
                        entry.waiters = entry.waiters.saturating_sub(1);
                        if entry.waiters == 0 {
                            guard.remove(&key);
                        }
                        return Ok(result);
                    }
                    Slot::InFlight => {
                        entry.waiters += 1;
                        guard = self.condvar.wait(guard).map_err(|_| {
                            Error::Inconsistent("chunk provider lock poisoned".to_string())
                        })?;
                        drop(guard);
                        continue;
                    }
                },
                None => {
                    guard.insert(key, Entry { slot: Slot::InFlight, waiters: 0 });
                    drop(guard);
                    break;
                }
            }
        }

        let fetched = self.fetch(resource, segment, chunk);

        let mut guard = self
            .inflight
            .lock()
            .map_err(|_| Error::Inconsistent("chunk provider lock poisoned".to_string()))?;
        match fetched {
            Ok(points) => {
                let waiters = guard
                    .get_mut(&key)
                    .map(|entry| {
                        entry.slot = Slot::Ready(points.clone());
                        entry.waiters
                    })
                    .unwrap_or(0);
                self.condvar.notify_all();
                if waiters == 0 {
                    guard.remove(&key);
                }
                Ok(points)
            }
            Err(e) => {
                // Leave no trace of a failed fetch: other waiters retry
                // independently rather than inheriting this error.
                guard.remove(&key);
                self.condvar.notify_all();
                Err(e)
            }
        }
    }

    fn fetch(
        &self,
        resource: &MergeResource,
        segment: &Segment,
        chunk: &ChunkMetadata,
    ) -> Result<Arc<Vec<TimeValuePair>>> {
        let reader = resource.reader(segment)?;
        let mut guard = reader
            .lock()
            .map_err(|_| Error::Inconsistent(format!("reader lock poisoned for {}", segment.id())))?;
        Ok(Arc::new(guard.read_chunk(chunk)?))
    }
}

impl Default for ChunkProvider {
    fn default() -> Self {
        Self::new()
    }
}
