//! Data model: timestamps, scalar values, segment identity and the sidecar
//! metadata (resource descriptors, tombstones) that drive the merge engine.

pub mod chunk;
pub mod filename;
pub mod resource;
pub mod segment;
pub mod timestamp;
pub mod tombstone;
pub mod value;

pub use chunk::ChunkMetadata;
pub use filename::SegmentId;
pub use resource::ResourceDescriptor;
pub use segment::{ReservationState, Segment, SegmentKind};
pub use timestamp::{TimeRange, Timestamp};
pub use tombstone::{Tombstone, TombstoneCache};
pub use value::{DataType, ScalarValue, TimeValuePair};
