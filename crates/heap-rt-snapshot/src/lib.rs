//! # Heap snapshot writer & memory-usage walker
//!
//! Two read-only consumers of `heap-rt-gc`'s tracer/registry contracts:
//!
//! - [`snapshot`]: traverses the reachable object graph and serializes
//!   it as a browser-inspector-compatible `.heapsnapshot` JSON document
//!   ([`snapshot::dump_heap_snapshot`]).
//! - [`memory`]: estimates per-category counts and byte totals across
//!   the live heap ([`memory::compute_memory_usage`]).
//!
//! Neither module mutates heap state — both ride [`heap_rt_gc::walk`]'s
//! guarantee that enumerating the registry never changes a ref count,
//! a mark bit, or list membership.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod snapshot;

pub use error::{SnapshotError, SnapshotResult};
pub use memory::{compute_memory_usage, dump_memory_usage, MemoryUsage};
pub use snapshot::{dump_heap_snapshot, write_heap_snapshot, HeapSnapshotWriter};
