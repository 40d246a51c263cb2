//! Error types for the allocator and collector.

use thiserror::Error;

/// Errors surfaced by the allocator and registry.
///
/// Internal GC invariant violations are programmer-fatal and assert/panic
/// in debug builds — they do not appear here.
#[derive(Debug, Error)]
pub enum GcError {
    /// An allocation request could not be satisfied, even after a retry
    /// collection was attempted.
    #[error("out of memory: requested {requested} bytes (limit {limit} bytes)")]
    OutOfMemory {
        /// Bytes requested by the failing call.
        requested: usize,
        /// The configured memory limit at the time of failure.
        limit: usize,
    },

    /// A capacity computation overflowed `usize` (e.g. `realloc_array`
    /// growth on a pathologically large existing capacity).
    #[error("allocation size overflow computing capacity for {elem_size} byte elements")]
    CapacityOverflow {
        /// Size in bytes of a single element in the array being grown.
        elem_size: usize,
    },
}

/// Result alias for allocator-surfaced operations.
pub type GcResult<T> = std::result::Result<T, GcError>;
