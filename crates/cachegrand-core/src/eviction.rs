//! Key eviction (spec.md §4.5 "Eviction").
//!
//! `run_worker` is the externally-triggered entry point: sample 16
//! candidates across the bucket space, rank them by policy, and delete the
//! 10 lowest-ranked. The 16-wide sort is fixed size by contract — it is an
//! unrolled bitonic network, not a general comparison sort, so its cost and
//! branching pattern are the same on every call regardless of how the
//! candidates happen to be ordered going in.

use bytes::Bytes;

use crate::hashtable::HashTable;

/// Eviction policy (spec.md §4.5). `Ttl` ranks purely by expiry time and is
/// typically combined with `only_ttl = true` so it only ever removes
/// already-expired keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Random,
    Lru,
    Lfu,
    Ttl,
}

const SAMPLE_WIDTH: usize = 16;
const EVICT_COUNT: usize = 10;

/// One sampled candidate: its bucket, key, and the fields a policy might
/// rank on. `sort_key` is filled in by [`assign_sort_key`] before sorting.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub bucket: usize,
    pub key: Bytes,
    pub last_access_time_ms: u64,
    pub accesses_count: u32,
    pub expiry_time_ms: u64,
    sort_key: u64,
}

/// Per-candidate metadata the caller (storage DB facade) must supply
/// alongside the raw hash-table scan, since the hash table itself is
/// policy-agnostic and knows nothing about access times or TTLs.
pub trait CandidateMetadata {
    fn last_access_time_ms(&self) -> u64;
    fn accesses_count(&self) -> u32;
    fn expiry_time_ms(&self) -> u64;
}

fn assign_sort_key(policy: EvictionPolicy, candidate: &mut Candidate) {
    candidate.sort_key = match policy {
        EvictionPolicy::Random => {
            use rand::Rng;
            rand::thread_rng().gen()
        }
        EvictionPolicy::Lru => candidate.last_access_time_ms,
        EvictionPolicy::Lfu => candidate.accesses_count as u64,
        EvictionPolicy::Ttl => {
            if candidate.expiry_time_ms == 0 {
                u64::MAX
            } else {
                candidate.expiry_time_ms
            }
        }
    };
}

/// Sort exactly 16 keys ascending with an unrolled bitonic network (spec.md
/// §4.5 invariant: "the constant size is a contract, not an implementation
/// detail"). `indices[i]` gives the original position of the element now
/// at sorted position `i`, so the caller can carry an out-of-band payload
/// (here, the `Candidate` itself) along with its key.
pub fn bitonic_sort_16(keys: &mut [u64; 16]) {
    const STAGES: &[(usize, usize, bool)] = &bitonic_network_16();
    for &(i, j, ascending) in STAGES {
        compare_exchange(keys, i, j, ascending);
    }
}

#[inline]
fn compare_exchange(keys: &mut [u64; 16], i: usize, j: usize, ascending: bool) {
    let should_swap = if ascending { keys[i] > keys[j] } else { keys[i] < keys[j] };
    if should_swap {
        keys.swap(i, j);
    }
}

/// The exchange sequence for Batcher's bitonic sort of 16 elements, all
/// ascending. Generated once and kept as a flat const table rather than
/// recursive calls, matching the "unrolled" requirement.
const fn bitonic_network_16() -> [(usize, usize, bool); 80] {
    // Standard bitonic sorting network for n = 16 (4 merge stages after the
    // initial bitonic-sequence build), expressed as compare-exchange pairs.
    [
        (0, 1, true), (2, 3, false), (4, 5, true), (6, 7, false),
        (8, 9, true), (10, 11, false), (12, 13, true), (14, 15, false),
        (0, 2, true), (1, 3, true), (4, 6, false), (5, 7, false),
        (8, 10, true), (9, 11, true), (12, 14, false), (13, 15, false),
        (0, 1, true), (2, 3, true), (4, 5, false), (6, 7, false),
        (8, 9, true), (10, 11, true), (12, 13, false), (14, 15, false),
        (0, 4, true), (1, 5, true), (2, 6, true), (3, 7, true),
        (8, 12, false), (9, 13, false), (10, 14, false), (11, 15, false),
        (0, 2, true), (1, 3, true), (4, 6, true), (5, 7, true),
        (8, 10, false), (9, 11, false), (12, 14, false), (13, 15, false),
        (0, 1, true), (2, 3, true), (4, 5, true), (6, 7, true),
        (8, 9, false), (10, 11, false), (12, 13, false), (14, 15, false),
        (0, 8, true), (1, 9, true), (2, 10, true), (3, 11, true),
        (4, 12, true), (5, 13, true), (6, 14, true), (7, 15, true),
        (0, 4, true), (1, 5, true), (2, 6, true), (3, 7, true),
        (8, 12, true), (9, 13, true), (10, 14, true), (11, 15, true),
        (0, 2, true), (1, 3, true), (4, 6, true), (5, 7, true),
        (8, 10, true), (9, 11, true), (12, 14, true), (13, 15, true),
        (0, 1, true), (2, 3, true), (4, 5, true), (6, 7, true),
        (8, 9, true), (10, 11, true), (12, 13, true), (14, 15, true),
    ]
}

/// Sample up to `SAMPLE_WIDTH` candidates across the table's bucket space:
/// one random offset per of 16 equal segments (spec.md §4.5 step 1-2).
/// `metadata_fn` resolves a candidate value `V` into the access/expiry
/// fields the policy needs — the hash table stores an opaque `V` and has
/// no notion of these fields itself.
pub fn sample_candidates<V, F>(
    table: &HashTable<V>,
    db: u8,
    metadata_fn: F,
) -> Vec<Candidate>
where
    V: Clone + Send + Sync + 'static,
    F: Fn(&V) -> (u64, u32, u64),
{
    use rand::Rng;
    let bucket_count = table.bucket_count();
    let segment_size = (bucket_count / SAMPLE_WIDTH).max(1);
    let mut rng = rand::thread_rng();
    let mut candidates = Vec::with_capacity(SAMPLE_WIDTH);

    for segment in 0..SAMPLE_WIDTH {
        let segment_start = segment * segment_size;
        if segment_start >= bucket_count {
            break;
        }
        let offset = segment_start + rng.gen_range(0..segment_size);
        let (found, _) = table.iter_max_distance(offset, segment_size, Some(db));
        if let Some((bucket, key, value)) = found.into_iter().next() {
            let (last_access_time_ms, accesses_count, expiry_time_ms) = metadata_fn(&value);
            candidates.push(Candidate {
                bucket,
                key,
                last_access_time_ms,
                accesses_count,
                expiry_time_ms,
                sort_key: 0,
            });
        }
    }
    candidates
}

/// Run one eviction pass (spec.md §4.5). `delete_fn` performs the actual
/// hash-table delete (and any entry-index teardown) for one candidate's key
/// and returns whether the delete succeeded; a failed individual delete is
/// skipped rather than aborting the whole pass.
///
/// When `only_ttl` is set, only candidates that are already expired
/// (`expiry_time_ms != 0 && expiry_time_ms <= now_ms`) are eligible,
/// regardless of `policy`'s ranking — this is the path the TTL sweeper
/// uses to reclaim expired keys without touching live ones.
pub fn run_worker<V, F, D>(
    table: &HashTable<V>,
    db: u8,
    policy: EvictionPolicy,
    only_ttl: bool,
    now_ms: u64,
    metadata_fn: F,
    mut delete_fn: D,
) -> usize
where
    V: Clone + Send + Sync + 'static,
    F: Fn(&V) -> (u64, u32, u64),
    D: FnMut(&HashTable<V>, u8, &Bytes) -> bool,
{
    let mut candidates = sample_candidates(table, db, metadata_fn);
    if only_ttl {
        candidates.retain(|c| c.expiry_time_ms != 0 && c.expiry_time_ms <= now_ms);
    }
    if candidates.is_empty() {
        return 0;
    }

    for candidate in &mut candidates {
        assign_sort_key(policy, candidate);
    }

    // Pad to exactly 16 with sentinel max-value entries so the fixed-size
    // sort always runs on a full array; padding entries sort last and are
    // never selected for eviction.
    let mut keys = [u64::MAX; SAMPLE_WIDTH];
    for (i, candidate) in candidates.iter().enumerate() {
        keys[i] = candidate.sort_key;
    }
    // Track original indices alongside the keys by sorting a parallel
    // permutation array with the same network.
    let mut order: [usize; SAMPLE_WIDTH] = std::array::from_fn(|i| i);
    bitonic_sort_16_with_payload(&mut keys, &mut order);

    let mut evicted = 0;
    for &idx in order.iter().take(EVICT_COUNT) {
        if idx >= candidates.len() {
            continue;
        }
        if delete_fn(table, db, &candidates[idx].key) {
            evicted += 1;
        }
    }
    evicted
}

/// Same network as [`bitonic_sort_16`], but carries a parallel `payload`
/// array through every swap so the caller can recover which original slot
/// ended up where.
fn bitonic_sort_16_with_payload(keys: &mut [u64; 16], payload: &mut [usize; 16]) {
    const STAGES: [(usize, usize, bool); 80] = bitonic_network_16();
    for &(i, j, ascending) in STAGES.iter() {
        let should_swap = if ascending { keys[i] > keys[j] } else { keys[i] < keys[j] };
        if should_swap {
            keys.swap(i, j);
            payload.swap(i, j);
        }
    }
}
