//! Transaction handle (spec.md §3 "Transaction").
//!
//! The original design threads a thread-local handle through every
//! operation that records which spinlock slots it holds, releasing them in
//! reverse order on `release`. In this crate the chunk locks themselves are
//! RAII guards (`parking_lot` `RwLock`/`Mutex` guards held by
//! [`super::RmwHandle`] and released on `Drop`), so a `Transaction` here is
//! a lightweight identity + tracing object threaded through storage-DB
//! calls rather than a manual lock ledger — the ledger is the Rust borrow
//! checker and the guards' drop order.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRANSACTION_INDEX: AtomicU64 = AtomicU64::new(0);

/// A `(worker_index, transaction_index)` pair identifying one logical
/// operation for tracing and for the monotonic ordering invariant within a
/// single key's RMW chain (spec.md §5 "Ordering").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub worker_index: u32,
    pub transaction_index: u64,
}

impl Transaction {
    /// Begin a new transaction on the calling worker.
    pub fn acquire(worker_index: u32) -> Self {
        let transaction_index = NEXT_TRANSACTION_INDEX.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(worker_index, transaction_index, "transaction acquired");
        Self { worker_index, transaction_index }
    }

    /// Explicit release point. A no-op beyond tracing — every lock taken
    /// during the transaction's lifetime is already released by the time
    /// its guard (owned by the caller's RMW handle or dropped internally by
    /// a single-shot hash-table op) goes out of scope.
    pub fn release(self) {
        tracing::trace!(
            worker_index = self.worker_index,
            transaction_index = self.transaction_index,
            "transaction released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_indices_are_monotonic() {
        let a = Transaction::acquire(0);
        let b = Transaction::acquire(0);
        assert!(b.transaction_index > a.transaction_index);
    }
}
