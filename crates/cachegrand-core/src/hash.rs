//! Key hashing.
//!
//! The spec allows any process-wide-consistent 64-bit hash (t1ha2, xxh3, or
//! hardware CRC32C are all named as acceptable). We use BLAKE3, already the
//! hash the rest of the pack reaches for (content-addressed chunk caching,
//! service identifiers) — truncated to 64 bits. It is not the fastest choice
//! for a hot lookup path, but it is the one already in this workspace's
//! dependency graph, it's SIMD-accelerated internally, and it gives us a
//! hash with no known clustering pathology to worry about.

/// The bucket-selecting, SIMD-filterable half of a key hash.
pub type HalfHash = u32;

/// Full 64-bit hash of a key. The upper bits select the bucket; the lower
/// 32 bits are the half-hash used for SIMD-style candidate filtering.
pub type FullHash = u64;

/// Half-hash value reserved to mean "slot empty". The spec requires the
/// all-zero half-hash to be remapped to a fixed non-zero sentinel so that
/// zero can serve as the empty marker.
pub const HALF_HASH_EMPTY_SENTINEL: HalfHash = 0;

/// Half-hash substituted whenever the natural half-hash of a key happens to
/// be zero, so the hash table can keep using zero to mean "no key here".
const HALF_HASH_ZERO_REPLACEMENT: HalfHash = 0x8000_0001;

/// Hash a key's raw bytes into the process-wide 64-bit key hash.
pub fn hash_key(key: &[u8]) -> FullHash {
    let digest = blake3::hash(key);
    let bytes: [u8; 8] = digest.as_bytes()[0..8].try_into().unwrap();
    u64::from_le_bytes(bytes)
}

/// Split a full hash into `(bucket selector bits, half-hash)`.
///
/// The half-hash is never allowed to be the empty sentinel — a natural
/// zero is remapped to [`HALF_HASH_ZERO_REPLACEMENT`], matching the spec's
/// "all-zero half-hash mapped to a fixed non-zero sentinel" rule.
pub fn split_hash(full_hash: FullHash) -> (u64, HalfHash) {
    let upper_bits = full_hash >> 32;
    let mut half_hash = (full_hash & 0xFFFF_FFFF) as HalfHash;
    if half_hash == HALF_HASH_EMPTY_SENTINEL {
        half_hash = HALF_HASH_ZERO_REPLACEMENT;
    }
    (upper_bits, half_hash)
}

/// Map the bucket selector bits onto a concrete bucket index for a table of
/// `bucket_count` buckets. `bucket_count` is always an exact multiple of
/// [`crate::hashtable::SLOTS_PER_CHUNK`] (see `HashTable::new`), so plain
/// modulo is used rather than a power-of-two mask.
pub fn bucket_index_for(upper_bits: u64, bucket_count: usize) -> usize {
    (upper_bits as usize) % bucket_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key(b"hello"), hash_key(b"hello"));
        assert_ne!(hash_key(b"hello"), hash_key(b"world"));
    }

    #[test]
    fn half_hash_never_empty_sentinel() {
        // Searching for a preimage whose low 32 bits are zero would take
        // forever; instead exercise the remapping function directly.
        let (_, half_hash) = split_hash(0xDEAD_BEEF_0000_0000);
        assert_ne!(half_hash, HALF_HASH_EMPTY_SENTINEL);
        assert_eq!(half_hash, HALF_HASH_ZERO_REPLACEMENT);
    }

    #[test]
    fn bucket_index_wraps_with_mask() {
        assert_eq!(bucket_index_for(0, 16), 0);
        assert_eq!(bucket_index_for(17, 16), 1);
        assert_eq!(bucket_index_for(u64::MAX, 1024), 1023);
    }
}
