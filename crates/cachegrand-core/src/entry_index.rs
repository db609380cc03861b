//! Entry index lifecycle: the per-value record, its atomic status word, and
//! reader-counted, deletion-deferred reclamation (spec.md §3, §4.4).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::chunk::ChunkSequence;

/// High bit of [`EntryStatus`]'s word: set once the entry has been
/// logically deleted (superseded in the hash table, or explicitly removed).
const DELETED_BIT: u32 = 0x8000_0000;
/// Remaining 31 bits: count of readers currently holding a reference.
const READERS_MASK: u32 = 0x7FFF_FFFF;

/// The single atomically-mutated status word described in spec.md §3:
/// high bit = deleted, low 31 bits = readers counter.
#[derive(Debug, Default)]
pub struct EntryStatus(AtomicU32);

/// Outcome of attempting to acquire a read reference.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The reader was admitted; readers_counter was incremented.
    Acquired,
    /// The entry was already marked deleted; no reader is admitted.
    AlreadyDeleted,
}

impl EntryStatus {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Attempt to acquire a read reference. A reader may hold a reference
    /// only while `deleted == 0`; once `deleted == 1`, no new readers may
    /// be admitted (spec.md §3 invariant).
    pub fn try_acquire_reader(&self) -> AcquireOutcome {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & DELETED_BIT != 0 {
                return AcquireOutcome::AlreadyDeleted;
            }
            let next = current + 1;
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return AcquireOutcome::Acquired,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a previously-acquired read reference.
    pub fn release_reader(&self) {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & READERS_MASK != 0, "released reader with no readers outstanding");
    }

    /// Mark the entry deleted. Idempotent-safe to call once; the caller
    /// (the publication path) is responsible for calling this exactly once
    /// per entry, immediately after it is swapped out of the hash table.
    pub fn mark_deleted(&self) {
        self.0.fetch_or(DELETED_BIT, Ordering::AcqRel);
    }

    pub fn is_deleted(&self) -> bool {
        self.0.load(Ordering::Acquire) & DELETED_BIT != 0
    }

    pub fn readers_count(&self) -> u32 {
        self.0.load(Ordering::Acquire) & READERS_MASK
    }
}

/// A read reference to a live [`EntryIndex`]. Dropping it releases the
/// reader count (RAII, as spec.md §3 describes).
pub struct EntryRef {
    entry: Arc<EntryIndex>,
}

impl EntryRef {
    fn new(entry: Arc<EntryIndex>) -> Self {
        Self { entry }
    }
}

impl std::ops::Deref for EntryRef {
    type Target = EntryIndex;
    fn deref(&self) -> &EntryIndex {
        &self.entry
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.entry.status.release_reader();
    }
}

/// Value type tag. Only `String` exists today; the RDB value-type opcode
/// (spec.md §6) leaves room for more without a format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
}

impl ValueType {
    pub fn rdb_opcode(self) -> u8 {
        match self {
            ValueType::String => 0x00,
        }
    }
}

/// The accesses counter backing LFU eviction. Saturating, monotonic
/// (spec.md §3 invariant).
#[derive(Debug, Default)]
pub struct AccessesCounter(AtomicU32);

impl AccessesCounter {
    pub fn bump(&self) -> u32 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == u32::MAX {
                return current;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current + 1,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The per-value record (spec.md §3 "Entry Index").
#[derive(Debug)]
pub struct EntryIndex {
    pub database_number: u8,
    /// Value bytes. `key` is unused in the memory backend (the key lives
    /// only in the hash table's key-values array); populated for the file
    /// backend so keys can be recovered from a shard independent of the
    /// hash table.
    pub key: ChunkSequence,
    pub value: ChunkSequence,
    pub value_type: ValueType,
    pub created_time_ms: std::sync::atomic::AtomicU64,
    pub last_access_time_ms: std::sync::atomic::AtomicU64,
    pub expiry_time_ms: std::sync::atomic::AtomicU64,
    pub snapshot_time_ms: std::sync::atomic::AtomicU64,
    pub status: EntryStatus,
    pub accesses: AccessesCounter,
}

impl EntryIndex {
    /// Allocate and populate a fresh entry index. Reclamation-ring reuse is
    /// handled one layer up by [`EntryIndexPool`]; this constructor always
    /// zeroes the lifecycle fields.
    pub fn new(
        database_number: u8,
        value: ChunkSequence,
        value_type: ValueType,
        now_ms: u64,
        expiry_time_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            database_number,
            key: ChunkSequence::new(),
            value,
            value_type,
            created_time_ms: std::sync::atomic::AtomicU64::new(now_ms),
            last_access_time_ms: std::sync::atomic::AtomicU64::new(now_ms),
            expiry_time_ms: std::sync::atomic::AtomicU64::new(expiry_time_ms),
            snapshot_time_ms: std::sync::atomic::AtomicU64::new(0),
            status: EntryStatus::new(),
            accesses: AccessesCounter::default(),
        })
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        let expiry = self.expiry_time_ms.load(Ordering::Relaxed);
        expiry != 0 && now_ms > expiry
    }

    pub fn touch_access(&self, now_ms: u64) {
        self.last_access_time_ms.store(now_ms, Ordering::Relaxed);
        self.accesses.bump();
    }

    /// Acquire a read reference, honoring the deleted/expiry rules. Returns
    /// `None` if the entry is deleted or expired — the caller (storage DB)
    /// is responsible for deciding whether an expired-but-not-yet-reclaimed
    /// entry should be torn down opportunistically.
    pub fn acquire_read(self: &Arc<Self>, now_ms: u64) -> Option<EntryRef> {
        match self.status.try_acquire_reader() {
            AcquireOutcome::AlreadyDeleted => None,
            AcquireOutcome::Acquired => {
                if self.is_expired(now_ms) {
                    self.status.release_reader();
                    return None;
                }
                self.touch_access(now_ms);
                Some(EntryRef::new(self.clone()))
            }
        }
    }
}

/// Per-worker fixed-capacity ring buffer of zeroed, reusable entry-index
/// allocations (spec.md §4.4 "reclaimed-entry ring"). Single-producer
/// single-consumer by construction: only the owning worker pushes
/// (reclamation) or pops (allocation) from it.
pub struct ReclaimedEntryRing {
    capacity: usize,
    ring: std::collections::VecDeque<Arc<EntryIndex>>,
}

impl ReclaimedEntryRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, ring: std::collections::VecDeque::with_capacity(capacity) }
    }

    /// Push a freed entry into the ring. If the ring is already at
    /// capacity, the oldest entry is dropped to make room — it has been
    /// sitting in the ring long enough that no live reader can still
    /// reference it (spec.md §4.4).
    pub fn push(&mut self, entry: Arc<EntryIndex>) {
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(entry);
    }

    /// Pop a reusable entry. The caller amortizes allocation by reusing
    /// this one instead of calling [`EntryIndex::new`] directly. Returns
    /// `None` if the ring is empty — a fresh allocation is required.
    pub fn pop(&mut self) -> Option<Arc<EntryIndex>> {
        self.ring.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Per-worker list of marked-deleted entries whose readers have not all
/// released yet (spec.md §4.4 "deferred-deletion list"). Drained by the
/// reclamation fiber.
#[derive(Default)]
pub struct DeferredDeletionList {
    entries: Vec<Arc<EntryIndex>>,
}

impl DeferredDeletionList {
    pub fn push(&mut self, entry: Arc<EntryIndex>) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Walk the list, bounded per iteration at `max(1000, 4% of len)`
    /// (spec.md §4.4), and drain out every entry whose readers count has
    /// dropped to zero. Returns the drained entries for the caller to push
    /// into the reclaimed-entry ring.
    pub fn sweep(&mut self) -> Vec<Arc<EntryIndex>> {
        let bound = std::cmp::max(1000, self.entries.len() * 4 / 100);
        let scan_len = std::cmp::min(bound, self.entries.len());

        let mut drained = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());

        for entry in self.entries.drain(..scan_len) {
            if entry.status.readers_count() == 0 {
                drained.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        // Anything beyond the scan bound is untouched this sweep.
        remaining.extend(self.entries.drain(..));
        self.entries = remaining;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkSequence;

    fn sample_entry() -> Arc<EntryIndex> {
        EntryIndex::new(0, ChunkSequence::from_bytes_memory(bytes::Bytes::from_static(b"v")), ValueType::String, 1, 0)
    }

    #[test]
    fn deleted_entry_rejects_new_readers() {
        let entry = sample_entry();
        entry.status.mark_deleted();
        assert_eq!(entry.status.try_acquire_reader(), AcquireOutcome::AlreadyDeleted);
    }

    #[test]
    fn reader_count_round_trips() {
        let entry = sample_entry();
        assert_eq!(entry.status.try_acquire_reader(), AcquireOutcome::Acquired);
        assert_eq!(entry.status.readers_count(), 1);
        entry.status.release_reader();
        assert_eq!(entry.status.readers_count(), 0);
    }

    #[test]
    fn acquire_read_rejects_expired_entry() {
        let entry = EntryIndex::new(0, ChunkSequence::new(), ValueType::String, 1000, 500);
        assert!(entry.acquire_read(2000).is_none());
        // Expired acquisition must not leak a reader count.
        assert_eq!(entry.status.readers_count(), 0);
    }

    #[test]
    fn accesses_counter_saturates() {
        let counter = AccessesCounter(AtomicU32::new(u32::MAX - 1));
        assert_eq!(counter.bump(), u32::MAX);
        assert_eq!(counter.bump(), u32::MAX);
    }

    #[test]
    fn ring_buffer_evicts_oldest_when_full() {
        let mut ring = ReclaimedEntryRing::new(2);
        let a = sample_entry();
        let b = sample_entry();
        let c = sample_entry();
        ring.push(a.clone());
        ring.push(b.clone());
        ring.push(c.clone());
        assert_eq!(ring.len(), 2);
        // `a` should have been evicted; `b` and `c` remain, in order.
        assert!(Arc::ptr_eq(&ring.pop().unwrap(), &b));
        assert!(Arc::ptr_eq(&ring.pop().unwrap(), &c));
    }

    #[test]
    fn deferred_list_sweeps_only_zero_reader_entries() {
        let mut list = DeferredDeletionList::default();
        let still_read = sample_entry();
        assert_eq!(still_read.status.try_acquire_reader(), AcquireOutcome::Acquired);
        let free = sample_entry();

        list.push(still_read.clone());
        list.push(free.clone());

        let drained = list.sweep();
        assert_eq!(drained.len(), 1);
        assert!(Arc::ptr_eq(&drained[0], &free));
        assert_eq!(list.len(), 1);
    }
}
