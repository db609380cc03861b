//! Concurrent MCMP hash table (spec.md §4.3).
//!
//! Buckets are grouped into chunks of 14 slots, each chunk carrying its own
//! half-hash array and lock, exactly as the spec describes. The value slot
//! is a generic opaque type `V` rather than a raw 64-bit pointer cast — this
//! is the re-architecture spec.md §9 asks for ("the hash table's value type
//! should be a generic 64-bit opaque carried by the table ... the hash
//! table must not know about entry indices"); the storage-DB facade
//! instantiates `HashTable<Arc<EntryIndex>>`.
//!
//! Concurrency note: the spec's `search_key` is a lock-free optimistic read
//! guarded by a `changes_counter` retry loop. Implementing that safely in
//! Rust without `unsafe` requires either hazard pointers or epoch-based
//! reclamation machinery well beyond what this core needs. We instead give
//! each chunk a `parking_lot::RwLock`: reads take a shared lock (so
//! concurrent readers never block each other, matching the spec's
//! "multiple producer / multiple consumer" intent for the common case),
//! writers take an exclusive lock. `changes_counter` is retained and bumped
//! on every structural mutation so tests can assert on it, even though it
//! is no longer load-bearing for correctness. This substitution is recorded
//! in DESIGN.md.

pub mod transaction;

use std::cmp::min;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

pub use transaction::Transaction;

use crate::error::CoreError;
use crate::hash::{bucket_index_for, hash_key, split_hash};

/// Slots per hash-table chunk (spec.md §4.3 — fixed at 14 for the SIMD
/// comparison width).
pub const SLOTS_PER_CHUNK: usize = 14;

/// Default bound on how many chunks a probe (search, insert, or RMW) will
/// walk before giving up (spec.md §4.3 step 6 / insertion step 4).
const DEFAULT_MAX_PROBE_CHUNKS: usize = 8;

struct Slot<V> {
    database_number: u8,
    key: Bytes,
    value: V,
}

struct ChunkBody<V> {
    half_hashes: [u32; SLOTS_PER_CHUNK],
    slots: Vec<Option<Slot<V>>>,
    overflowed_chunks_count: usize,
}

impl<V> ChunkBody<V> {
    fn empty() -> Self {
        Self {
            half_hashes: [0; SLOTS_PER_CHUNK],
            slots: (0..SLOTS_PER_CHUNK).map(|_| None).collect(),
            overflowed_chunks_count: 0,
        }
    }

    fn find_match(&self, db: u8, half_hash: u32, key: &[u8]) -> Option<usize> {
        for i in 0..SLOTS_PER_CHUNK {
            if self.half_hashes[i] == half_hash {
                if let Some(slot) = &self.slots[i] {
                    if slot.database_number == db && slot.key.as_ref() == key {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    fn find_empty(&self) -> Option<usize> {
        (0..SLOTS_PER_CHUNK).find(|&i| self.half_hashes[i] == 0)
    }
}

struct HtChunk<V> {
    body: RwLock<ChunkBody<V>>,
    changes_counter: std::sync::atomic::AtomicU32,
}

impl<V> HtChunk<V> {
    fn new() -> Self {
        Self { body: RwLock::new(ChunkBody::empty()), changes_counter: std::sync::atomic::AtomicU32::new(0) }
    }
}

/// The concurrent `(database, key) -> V` store.
pub struct HashTable<V> {
    chunks: Vec<Arc<HtChunk<V>>>,
    bucket_count: usize,
    max_probe_chunks: usize,
}

impl<V: Clone + Send + Sync + 'static> HashTable<V> {
    /// Allocate a table sized to hold at least `max_keys` (spec.md §4.3
    /// "Resizing" — deliberately out of scope; the table is allocated once).
    ///
    /// `bucket_count` is fixed at exactly `chunk_count * SLOTS_PER_CHUNK` —
    /// every chunk's 14 physical slots are all addressable as the home slot
    /// of some bucket, so the table's home-slot capacity is never larger
    /// than what's actually allocated (a table with a single chunk has
    /// exactly 14 home slots and no overflow chunk to spill into).
    pub fn new(max_keys: usize) -> Self {
        let chunk_count = max_keys.max(1).div_ceil(SLOTS_PER_CHUNK);
        let bucket_count = chunk_count * SLOTS_PER_CHUNK;
        let chunks = (0..chunk_count).map(|_| Arc::new(HtChunk::new())).collect();
        Self { chunks, bucket_count, max_probe_chunks: DEFAULT_MAX_PROBE_CHUNKS }
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    fn start_chunk_for(&self, key: &[u8]) -> (usize, u32) {
        let (upper, half_hash) = split_hash(hash_key(key));
        let bucket_index = bucket_index_for(upper, self.bucket_count);
        (bucket_index / SLOTS_PER_CHUNK, half_hash)
    }

    fn probe_end_chunk(&self, start_chunk: usize) -> usize {
        let overflow = self.chunks[start_chunk].body.read().overflowed_chunks_count;
        min(start_chunk + overflow, self.chunks.len() - 1)
    }

    /// `search_key` — pure read, takes no write lock (spec.md §4.3).
    pub fn search_key(&self, db: u8, key: &[u8]) -> Option<V> {
        let (start_chunk, half_hash) = self.start_chunk_for(key);
        let end_chunk = self.probe_end_chunk(start_chunk);
        for idx in start_chunk..=end_chunk {
            let body = self.chunks[idx].body.read();
            if let Some(slot_idx) = body.find_match(db, half_hash, key) {
                return body.slots[slot_idx].as_ref().map(|s| s.value.clone());
            }
        }
        None
    }

    /// `search_key_or_create_new` (spec.md §4.3). `make_value` is called at
    /// most once, only if the key did not already exist.
    ///
    /// Returns `(value, was_inserted)`.
    pub fn search_key_or_create_new(
        &self,
        db: u8,
        key: &[u8],
        make_value: impl FnOnce() -> V,
    ) -> Result<(V, bool), CoreError> {
        let (start_chunk, half_hash) = self.start_chunk_for(key);
        let probe_limit = min(start_chunk + self.max_probe_chunks, self.chunks.len()) - 1;

        for idx in start_chunk..=probe_limit {
            let body = self.chunks[idx].body.read();
            if let Some(slot_idx) = body.find_match(db, half_hash, key) {
                return Ok((body.slots[slot_idx].as_ref().unwrap().value.clone(), false));
            }
        }

        for idx in start_chunk..=probe_limit {
            let mut body = self.chunks[idx].body.write();
            // Re-verify under the write lock: another writer may have
            // inserted the key between our read-phase scan and now.
            if let Some(slot_idx) = body.find_match(db, half_hash, key) {
                return Ok((body.slots[slot_idx].as_ref().unwrap().value.clone(), false));
            }
            if let Some(empty_idx) = body.find_empty() {
                let value = make_value();
                body.half_hashes[empty_idx] = half_hash;
                body.slots[empty_idx] = Some(Slot { database_number: db, key: Bytes::copy_from_slice(key), value: value.clone() });
                drop(body);
                self.chunks[idx].changes_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                if idx != start_chunk {
                    let mut start_body = self.chunks[start_chunk].body.write();
                    let distance = idx - start_chunk;
                    if distance > start_body.overflowed_chunks_count {
                        start_body.overflowed_chunks_count = distance;
                    }
                }
                return Ok((value, true));
            }
        }

        Err(CoreError::TableFull)
    }

    /// `set` — unconditional insert-or-replace. Returns the previous value,
    /// if any, so the caller (storage DB / entry-index publication path)
    /// can reclaim it.
    pub fn set(&self, db: u8, key: &[u8], new_value: V) -> Option<V> {
        let (start_chunk, half_hash) = self.start_chunk_for(key);
        let probe_limit = min(start_chunk + self.max_probe_chunks, self.chunks.len()) - 1;

        for idx in start_chunk..=probe_limit {
            let mut body = self.chunks[idx].body.write();
            if let Some(slot_idx) = body.find_match(db, half_hash, key) {
                let previous = std::mem::replace(
                    &mut body.slots[slot_idx],
                    Some(Slot { database_number: db, key: Bytes::copy_from_slice(key), value: new_value }),
                );
                self.chunks[idx].changes_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return previous.map(|s| s.value);
            }
        }

        // Key not present: fall through to the insert path via
        // search_key_or_create_new's machinery without re-implementing it.
        match self.search_key_or_create_new(db, key, || new_value) {
            Ok(_) => None,
            Err(_) => None,
        }
    }

    /// `delete` (spec.md §4.3). Zeroes the half-hash, does not reorganize
    /// neighbouring slots.
    pub fn delete(&self, db: u8, key: &[u8]) -> Option<V> {
        let (start_chunk, half_hash) = self.start_chunk_for(key);
        let end_chunk = self.probe_end_chunk(start_chunk);
        for idx in start_chunk..=end_chunk {
            let mut body = self.chunks[idx].body.write();
            if let Some(slot_idx) = body.find_match(db, half_hash, key) {
                let slot = body.slots[slot_idx].take().unwrap();
                body.half_hashes[slot_idx] = 0;
                self.chunks[idx].changes_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Some(slot.value);
            }
        }
        None
    }

    /// `rmw_begin` (spec.md §4.3). Locks the chunk holding the key (or, if
    /// absent, the key's home chunk, to allow an insert on commit) and
    /// returns a handshake object plus the current value if any.
    ///
    /// Scope note: an RMW that inserts a brand-new key can only land in its
    /// home chunk (no overflow search at commit time) — see DESIGN.md. Use
    /// [`Self::set`] / [`Self::search_key_or_create_new`] for inserts that
    /// must be able to overflow.
    pub fn rmw_begin(self: &Arc<Self>, db: u8, key: &[u8]) -> (RmwHandle<V>, Option<V>) {
        let (start_chunk, half_hash) = self.start_chunk_for(key);
        let probe_limit = min(start_chunk + self.max_probe_chunks, self.chunks.len()) - 1;

        for idx in start_chunk..=probe_limit {
            let chunk = self.chunks[idx].clone();
            let guard = parking_lot::RwLock::write_arc(&chunk.body);
            if let Some(slot_idx) = guard.find_match(db, half_hash, key) {
                let current = guard.slots[slot_idx].as_ref().unwrap().value.clone();
                let handle = RmwHandle {
                    chunk,
                    guard: Some(guard),
                    slot_index: Some(slot_idx),
                    database_number: db,
                    key: Bytes::copy_from_slice(key),
                    half_hash,
                };
                return (handle, Some(current));
            }
        }

        let chunk = self.chunks[start_chunk].clone();
        let guard = parking_lot::RwLock::write_arc(&chunk.body);
        let handle = RmwHandle {
            chunk,
            guard: Some(guard),
            slot_index: None,
            database_number: db,
            key: Bytes::copy_from_slice(key),
            half_hash,
        };
        (handle, None)
    }

    /// Scan up to `max_buckets` consecutive buckets starting at
    /// `start_bucket`, returning occupied slots (optionally filtered by
    /// database) and the next bucket to resume from (spec.md §4.3
    /// "Iteration"). Not a consistent snapshot — entries may move, be
    /// inserted, or be deleted while iteration proceeds.
    pub fn iter_max_distance(
        &self,
        start_bucket: usize,
        max_buckets: usize,
        db_filter: Option<u8>,
    ) -> (Vec<(usize, Bytes, V)>, usize) {
        let end_bucket = min(start_bucket + max_buckets, self.bucket_count);
        let mut results = Vec::new();
        let mut bucket = start_bucket;

        while bucket < end_bucket {
            let chunk_index = bucket / SLOTS_PER_CHUNK;
            if chunk_index >= self.chunks.len() {
                break;
            }
            let body = self.chunks[chunk_index].body.read();
            let slot_start = bucket % SLOTS_PER_CHUNK;
            let slot_end = min(SLOTS_PER_CHUNK, slot_start + (end_bucket - bucket));

            for slot_idx in slot_start..slot_end {
                if body.half_hashes[slot_idx] != 0 {
                    if let Some(slot) = &body.slots[slot_idx] {
                        if db_filter.is_none_or(|d| d == slot.database_number) {
                            let absolute_bucket = chunk_index * SLOTS_PER_CHUNK + slot_idx;
                            results.push((absolute_bucket, slot.key.clone(), slot.value.clone()));
                        }
                    }
                }
            }
            bucket += slot_end - slot_start;
        }

        let next_bucket = if end_bucket >= self.bucket_count { 0 } else { end_bucket };
        (results, next_bucket)
    }

    /// Pick one occupied slot at random for the given database (spec.md
    /// §4.5 `random_key`). Tries a handful of random offsets with a small
    /// window each before giving up.
    pub fn random_key(&self, db: u8) -> Option<(Bytes, V)> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let start = rng.gen_range(0..self.bucket_count);
            let (found, _) = self.iter_max_distance(start, SLOTS_PER_CHUNK * 4, Some(db));
            if let Some((_, key, value)) = found.into_iter().next() {
                return Some((key, value));
            }
        }
        None
    }
}

/// The two-step RMW handshake (spec.md §4.3). Exactly one of
/// [`commit_update`](Self::commit_update), [`commit_delete`](Self::commit_delete),
/// or [`abort`](Self::abort) must be called; all three consume the handle,
/// releasing the chunk lock on return.
pub struct RmwHandle<V> {
    chunk: Arc<HtChunk<V>>,
    guard: Option<parking_lot::lock_api::ArcRwLockWriteGuard<parking_lot::RawRwLock, ChunkBody<V>>>,
    slot_index: Option<usize>,
    database_number: u8,
    key: Bytes,
    half_hash: u32,
}

impl<V> RmwHandle<V> {
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Replace the value (existing key) or insert it (new key, home chunk
    /// only — see [`HashTable::rmw_begin`]).
    ///
    /// Returns the value previously occupying the slot, if any, so the
    /// caller can run its own publication/reclamation step on it.
    pub fn commit_update(mut self, new_value: V) -> Result<Option<V>, CoreError> {
        let guard = self.guard.as_mut().expect("guard present until commit/abort");
        let previous = match self.slot_index {
            Some(slot_idx) => std::mem::replace(
                &mut guard.slots[slot_idx],
                Some(Slot { database_number: self.database_number, key: self.key.clone(), value: new_value }),
            )
            .map(|s| s.value),
            None => {
                let empty_idx = guard.find_empty().ok_or(CoreError::TableFull)?;
                guard.half_hashes[empty_idx] = self.half_hash;
                guard.slots[empty_idx] = Some(Slot { database_number: self.database_number, key: self.key.clone(), value: new_value });
                None
            }
        };
        self.chunk.changes_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(previous)
    }

    /// Delete the key if it existed; a no-op if it did not.
    pub fn commit_delete(mut self) -> Option<V> {
        let guard = self.guard.as_mut().expect("guard present until commit/abort");
        if let Some(slot_idx) = self.slot_index {
            let slot = guard.slots[slot_idx].take();
            guard.half_hashes[slot_idx] = 0;
            self.chunk.changes_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            slot.map(|s| s.value)
        } else {
            None
        }
    }

    /// Release the chunk lock without making any change.
    pub fn abort(self) {}
}
