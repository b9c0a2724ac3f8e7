//! Segment identity, population and the merging-reservation state machine.

use super::filename::SegmentId;
use super::resource::ResourceDescriptor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Which population a segment belongs to (§1, §3). Sequence segments never
/// overlap their neighbours in time; unsequence segments may overlap
/// anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Sequence,
    Unsequence,
}

/// Reservation state of a segment (§4 "State machines"):
/// `IDLE → MERGING → (IDLE on abort) | (RETIRED on commit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReservationState {
    Idle = 0,
    Merging = 1,
    Retired = 2,
}

/// A sealed segment file, known to a level index. Cheap to clone (an
/// `Arc` around the shared identity/metadata); the merging reservation is
/// a capability borrowed from whichever level index owns the segment.
#[derive(Clone)]
pub struct Segment {
    inner: Arc<SegmentInner>,
}

struct SegmentInner {
    id: SegmentId,
    kind: SegmentKind,
    path: PathBuf,
    sealed: bool,
    deleted: std::sync::atomic::AtomicBool,
    resource: std::sync::RwLock<ResourceDescriptor>,
    reservation: AtomicU8,
    max_tombstone_version: std::sync::atomic::AtomicU64,
}

impl Segment {
    pub fn new(id: SegmentId, kind: SegmentKind, path: PathBuf, resource: ResourceDescriptor) -> Self {
        Self {
            inner: Arc::new(SegmentInner {
                id,
                kind,
                path,
                sealed: true,
                deleted: std::sync::atomic::AtomicBool::new(false),
                resource: std::sync::RwLock::new(resource),
                reservation: AtomicU8::new(ReservationState::Idle as u8),
                max_tombstone_version: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.inner.id
    }

    pub fn kind(&self) -> SegmentKind {
        self.inner.kind
    }

    pub fn path(&self) -> &std::path::Path {
        &self.inner.path
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.inner.deleted.store(true, Ordering::Release);
    }

    pub fn resource(&self) -> ResourceDescriptor {
        self.inner.resource.read().expect("resource lock poisoned").clone()
    }

    pub fn replace_resource(&self, descriptor: ResourceDescriptor) {
        *self.inner.resource.write().expect("resource lock poisoned") = descriptor;
    }

    pub fn max_tombstone_version(&self) -> u64 {
        self.inner.max_tombstone_version.load(Ordering::Acquire)
    }

    pub fn bump_max_tombstone_version(&self, version: u64) {
        self.inner
            .max_tombstone_version
            .fetch_max(version, Ordering::AcqRel);
    }

    /// `IDLE -> MERGING`. Returns `false` if the segment was not idle
    /// (already reserved by another task, or retired).
    pub fn try_reserve(&self) -> bool {
        self.inner
            .reservation
            .compare_exchange(
                ReservationState::Idle as u8,
                ReservationState::Merging as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `MERGING -> IDLE`, for an aborted or cancelled task.
    pub fn release_reservation(&self) {
        self.inner.reservation.store(ReservationState::Idle as u8, Ordering::Release);
    }

    /// `MERGING -> RETIRED`, for a committed task. A retired segment is
    /// never reserved again; its file is deleted once durable.
    pub fn retire(&self) {
        self.inner
            .reservation
            .store(ReservationState::Retired as u8, Ordering::Release);
        self.mark_deleted();
    }

    /// Removes this segment's file and its `.resource`/`.mods` sidecars
    /// from disk. Call only after the output that supersedes it has been
    /// journaled durable (§3 Lifecycle); a missing file is not an error.
    pub fn delete_files(&self) -> std::io::Result<()> {
        let path = self.path();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        for ext in ["resource", "mods"] {
            let sidecar = path.with_extension(ext);
            match std::fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn reservation_state(&self) -> ReservationState {
        match self.inner.reservation.load(Ordering::Acquire) {
            0 => ReservationState::Idle,
            1 => ReservationState::Merging,
            _ => ReservationState::Retired,
        }
    }

    /// Filtering rule at `MergeResource` construction (§4.1): sealed, not
    /// deleted, and has at least one device ending after `time_lower_bound`.
    pub fn eligible_for_merge(&self, time_lower_bound: super::timestamp::Timestamp) -> bool {
        self.is_sealed()
            && !self.is_deleted()
            && self
                .resource()
                .max_end_time()
                .map(|end| end > time_lower_bound)
                .unwrap_or(false)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("path", &self.inner.path)
            .field("state", &self.reservation_state())
            .finish()
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Segment {}

impl std::hash::Hash for Segment {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::filename::SegmentId;
    use std::path::PathBuf;

    fn seg() -> Segment {
        Segment::new(
            SegmentId::new(1, 0, 0),
            SegmentKind::Sequence,
            PathBuf::from("/data/1-0-0.seg"),
            ResourceDescriptor::new(),
        )
    }

    #[test]
    fn reservation_state_machine() {
        let s = seg();
        assert_eq!(s.reservation_state(), ReservationState::Idle);
        assert!(s.try_reserve());
        assert_eq!(s.reservation_state(), ReservationState::Merging);
        // Cannot reserve twice.
        assert!(!s.try_reserve());
        s.retire();
        assert_eq!(s.reservation_state(), ReservationState::Retired);
        assert!(s.is_deleted());
    }

    #[test]
    fn abort_returns_to_idle() {
        let s = seg();
        assert!(s.try_reserve());
        s.release_reservation();
        assert_eq!(s.reservation_state(), ReservationState::Idle);
        assert!(s.try_reserve());
    }
}
