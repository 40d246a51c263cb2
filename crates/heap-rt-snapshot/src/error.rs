//! Error types for snapshot I/O and memory-report generation.

use thiserror::Error;

/// Errors surfaced by the snapshot writer and memory-usage report. A
/// failure here is a plain failure return — partial output files are
/// not guaranteed to be cleaned up.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The output file could not be created, written, or flushed.
    #[error("heap snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The in-memory document failed to serialize to JSON — should only
    /// happen if a host-supplied display name contains invalid UTF-8
    /// surrogate data that `serde_json` rejects.
    #[error("heap snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The runtime has no root context set; there is nothing to anchor
    /// node 0 of the snapshot to.
    #[error("cannot take a heap snapshot: no root context is set")]
    NoRootContext,
}

/// Result alias for snapshot-surfaced operations.
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;
