//! Storage-DB counters: per-worker, per-database keys/data statistics
//! (spec.md §3 "Counters", §4.5).
//!
//! Every worker keeps its own slice of counters so hot-path updates never
//! contend across workers; a database's totals are the sum across all
//! worker slices. Each worker additionally keeps one "global" slice (all
//! databases combined) and one slice per database it has touched, assigned
//! lazily on first use — mirroring the bitmap-indexed slot assignment the
//! original design used to avoid a fixed per-database allocation up front.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI64, Ordering};

/// One slice of counters: either the worker-global totals or one
/// worker/database pair.
#[derive(Default)]
pub struct CounterSlice {
    pub keys_count: AtomicI64,
    pub data_size: AtomicI64,
    pub keys_changed: AtomicI64,
    pub data_changed: AtomicI64,
}

impl CounterSlice {
    fn apply(&self, delta: &CounterDelta) {
        if delta.keys_count != 0 {
            self.keys_count.fetch_add(delta.keys_count, Ordering::Relaxed);
        }
        if delta.data_size != 0 {
            self.data_size.fetch_add(delta.data_size, Ordering::Relaxed);
        }
        if delta.keys_changed != 0 {
            self.keys_changed.fetch_add(delta.keys_changed, Ordering::Relaxed);
        }
        if delta.data_changed != 0 {
            self.data_changed.fetch_add(delta.data_changed, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CounterDelta {
        CounterDelta {
            keys_count: self.keys_count.load(Ordering::Relaxed),
            data_size: self.data_size.load(Ordering::Relaxed),
            keys_changed: self.keys_changed.load(Ordering::Relaxed),
            data_changed: self.data_changed.load(Ordering::Relaxed),
        }
    }
}

/// A relative adjustment applied to both the global slice and a database's
/// slice in one call, so call sites never update one without the other —
/// the bug class the original macro-based approach was prone to.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDelta {
    pub keys_count: i64,
    pub data_size: i64,
    pub keys_changed: i64,
    pub data_changed: i64,
}

impl CounterDelta {
    pub fn key_inserted(data_size: i64) -> Self {
        Self { keys_count: 1, data_size, keys_changed: 1, data_changed: 1 }
    }

    pub fn key_removed(data_size: i64) -> Self {
        Self { keys_count: -1, data_size: -data_size, keys_changed: 1, data_changed: 1 }
    }

    pub fn value_replaced(data_size_delta: i64) -> Self {
        Self { keys_count: 0, data_size: data_size_delta, keys_changed: 0, data_changed: 1 }
    }
}

/// Per-worker counter state: one global slice plus a sparse, lazily
/// populated per-database table.
pub struct WorkerCounters {
    global: CounterSlice,
    per_database: RefCell<Vec<Option<Box<CounterSlice>>>>,
}

impl Default for WorkerCounters {
    fn default() -> Self {
        Self { global: CounterSlice::default(), per_database: RefCell::new(Vec::new()) }
    }
}

impl WorkerCounters {
    /// Apply `delta` to the worker-global slice and to `database_number`'s
    /// slice, allocating the per-database slot lazily on first touch
    /// (spec.md §4.5 "counters are updated twice per operation: once for
    /// the database, once for the global total").
    pub fn update(&self, database_number: u8, delta: CounterDelta) {
        self.global.apply(&delta);

        let mut slots = self.per_database.borrow_mut();
        let index = database_number as usize;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        let slot = slots[index].get_or_insert_with(|| Box::new(CounterSlice::default()));
        slot.apply(&delta);
    }

    pub fn global_snapshot(&self) -> CounterDelta {
        self.global.snapshot()
    }

    pub fn database_snapshot(&self, database_number: u8) -> CounterDelta {
        let slots = self.per_database.borrow();
        slots
            .get(database_number as usize)
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.snapshot())
            .unwrap_or_default()
    }
}

thread_local! {
    static WORKER_COUNTERS: WorkerCounters = WorkerCounters::default();
}

/// Apply a counter delta for the calling worker (spec.md §4.5). Call sites
/// in the storage DB facade invoke this once per mutating operation; this
/// function is the single place both the global and per-database slices
/// get touched, so the two can never drift apart.
pub fn update(database_number: u8, delta: CounterDelta) {
    WORKER_COUNTERS.with(|counters| counters.update(database_number, delta));
}

pub fn global_snapshot() -> CounterDelta {
    WORKER_COUNTERS.with(|counters| counters.global_snapshot())
}

pub fn database_snapshot(database_number: u8) -> CounterDelta {
    WORKER_COUNTERS.with(|counters| counters.database_snapshot(database_number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_inserted_updates_both_global_and_database_slices() {
        let counters = WorkerCounters::default();
        counters.update(3, CounterDelta::key_inserted(10));

        let global = counters.global_snapshot();
        assert_eq!(global.keys_count, 1);
        assert_eq!(global.data_size, 10);

        let db = counters.database_snapshot(3);
        assert_eq!(db.keys_count, 1);
        assert_eq!(db.data_size, 10);
    }

    #[test]
    fn untouched_database_reads_as_zeroed_snapshot() {
        let counters = WorkerCounters::default();
        let db = counters.database_snapshot(7);
        assert_eq!(db.keys_count, 0);
        assert_eq!(db.data_size, 0);
    }

    #[test]
    fn key_removed_decrements_counts() {
        let counters = WorkerCounters::default();
        counters.update(0, CounterDelta::key_inserted(20));
        counters.update(0, CounterDelta::key_removed(20));
        let db = counters.database_snapshot(0);
        assert_eq!(db.keys_count, 0);
        assert_eq!(db.data_size, 0);
        assert_eq!(db.keys_changed, 2);
    }

    #[test]
    fn databases_are_tracked_independently() {
        let counters = WorkerCounters::default();
        counters.update(0, CounterDelta::key_inserted(5));
        counters.update(1, CounterDelta::key_inserted(9));
        assert_eq!(counters.database_snapshot(0).data_size, 5);
        assert_eq!(counters.database_snapshot(1).data_size, 9);
        assert_eq!(counters.global_snapshot().data_size, 14);
    }
}
