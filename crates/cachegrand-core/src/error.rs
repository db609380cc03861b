//! Typed errors for recoverable conditions (see SPEC_FULL.md §7).
//!
//! Fatal conditions — a null completion tag, switching to a terminated
//! fiber, a counter saturating at a value that indicates corruption — are
//! never represented here. They go through [`fatal`] and abort the process,
//! because by definition nothing downstream can be trusted to handle them.

use std::fmt;

/// Recoverable error conditions the core reports to its callers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("allocation failed")]
    AllocationFailed,

    #[error("lock acquisition failed, caller should retry")]
    LockContention,

    #[error("hash table has no free slot within the probe bound")]
    TableFull,

    #[error("key not found")]
    NotFound,

    #[error("key length {0} outside the allowed range 1..2^24-1")]
    InvalidKeyLength(usize),

    #[error("snapshot serialization error: {0}")]
    Snapshot(#[from] crate::snapshot::rdb::SerializeError),

    #[error("peer disconnected")]
    Disconnected,

    #[error("worker is shutting down")]
    ShuttingDown,

    #[error("operation timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Log and abort. Used for invariant violations that cannot be recovered
/// from — the hash table or entry-index lifecycle has already torn.
#[track_caller]
pub fn fatal(msg: impl fmt::Display) -> ! {
    tracing::error!(location = %std::panic::Location::caller(), "fatal: {msg}");
    std::process::abort();
}
