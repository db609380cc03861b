//! Value chunks and chunk sequences (spec.md §3, "Chunk" / "Chunk Sequence").
//!
//! A logical value is stored as an ordered sequence of bounded chunks. In
//! the memory backend a chunk owns its bytes (`bytes::Bytes`, cheap to
//! clone and share with readers); in the file backend a chunk is an offset
//! into a pre-allocated shard file (see [`FileShard`]).

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CoreError;

/// Maximum bytes held by a single chunk. Values longer than this are split
/// across multiple chunks in a [`ChunkSequence`].
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// One bounded region of a logical value.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Owned heap allocation — the memory backend.
    Memory(Bytes),
    /// Offset into a pre-allocated file shard — the file backend.
    File { shard: Arc<FileShard>, offset: u64, length: u32 },
}

impl Chunk {
    pub fn len(&self) -> usize {
        match self {
            Chunk::Memory(bytes) => bytes.len(),
            Chunk::File { length, .. } => *length as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize this chunk's bytes. For the memory backend this is a
    /// cheap refcount bump; for the file backend this reads through the
    /// shard's mmap.
    pub fn bytes(&self) -> Result<Bytes, CoreError> {
        match self {
            Chunk::Memory(bytes) => Ok(bytes.clone()),
            Chunk::File { shard, offset, length } => {
                shard.read(*offset, *length as usize)
            }
        }
    }
}

/// An ordered collection of chunks whose concatenation is the logical
/// value. Invariants (spec.md §3): total length equals the sum of chunk
/// lengths; the count equals `ceil(length / MAX_CHUNK_SIZE)`; every chunk
/// except possibly the last is full.
#[derive(Debug, Clone, Default)]
pub struct ChunkSequence {
    chunks: Vec<Chunk>,
    total_len: usize,
}

impl ChunkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chunk sequence from raw bytes using the memory backend,
    /// splitting at `MAX_CHUNK_SIZE` boundaries.
    pub fn from_bytes_memory(data: Bytes) -> Self {
        if data.is_empty() {
            return Self::default();
        }
        let total_len = data.len();
        let mut chunks = Vec::with_capacity(total_len.div_ceil(MAX_CHUNK_SIZE));
        let mut offset = 0;
        while offset < total_len {
            let end = (offset + MAX_CHUNK_SIZE).min(total_len);
            chunks.push(Chunk::Memory(data.slice(offset..end)));
            offset = end;
        }
        Self { chunks, total_len }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate every chunk into a single contiguous buffer. Used by
    /// callers (RESP replies, RDB plain-string encoding) that need the
    /// whole value at once.
    pub fn to_contiguous_bytes(&self) -> Result<Bytes, CoreError> {
        if self.chunks.len() == 1 {
            return self.chunks[0].bytes();
        }
        let mut buf = Vec::with_capacity(self.total_len);
        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.bytes()?);
        }
        Ok(Bytes::from(buf))
    }

    /// Verify the invariants from spec.md §3. Used by tests and by the
    /// debug-assertion paths in the storage DB.
    pub fn check_invariants(&self) -> bool {
        let sum: usize = self.chunks.iter().map(Chunk::len).sum();
        if sum != self.total_len {
            return false;
        }
        let expected_count = if self.total_len == 0 {
            0
        } else {
            self.total_len.div_ceil(MAX_CHUNK_SIZE)
        };
        if self.chunks.len() != expected_count {
            return false;
        }
        for chunk in self.chunks.iter().rev().skip(1) {
            if chunk.len() != MAX_CHUNK_SIZE {
                return false;
            }
        }
        true
    }
}

/// A fixed-size file region into which value chunks are appended
/// monotonically by a single owning worker (spec.md §3 "Shard"). Never
/// rewritten in place; garbage collection of superseded data is explicitly
/// out of scope (spec.md §9 Open Questions).
#[derive(Debug)]
pub struct FileShard {
    path: PathBuf,
    mmap: memmap2::Mmap,
    cursor: std::sync::atomic::AtomicU64,
    capacity: u64,
}

impl FileShard {
    /// Open (or create and pre-allocate) a shard file of `capacity` bytes.
    pub fn open(path: impl AsRef<Path>, capacity: u64) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(capacity)?;
        // Safety: the file is owned exclusively by this shard for its
        // lifetime; writes to the backing file happen through `write_at`,
        // not through this mapping, so there is no aliasing mutation of
        // mapped memory while readers hold `Bytes` slices into it.
        let mmap = unsafe { memmap2::MmapOptions::new().len(capacity as usize).map(&file)? };
        Ok(Self {
            path,
            mmap,
            cursor: std::sync::atomic::AtomicU64::new(0),
            capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserve `length` bytes at the shard's current append cursor,
    /// returning the offset to write at. Returns `None` once the shard is
    /// full — the caller (storage DB) rotates to a fresh shard.
    pub fn reserve(&self, length: u32) -> Option<u64> {
        use std::sync::atomic::Ordering;
        let length = length as u64;
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            if current + length > self.capacity {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                current + length,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), CoreError> {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
        file.write_all_at(data, offset)?;
        Ok(())
    }

    fn read(&self, offset: u64, length: usize) -> Result<Bytes, CoreError> {
        let start = offset as usize;
        let end = start + length;
        if end > self.mmap.len() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "chunk read past shard end",
            )));
        }
        Ok(Bytes::copy_from_slice(&self.mmap[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_value_has_no_chunks() {
        let seq = ChunkSequence::from_bytes_memory(Bytes::new());
        assert_eq!(seq.chunk_count(), 0);
        assert_eq!(seq.len(), 0);
        assert!(seq.check_invariants());
    }

    #[test]
    fn single_chunk_round_trip() {
        let data = Bytes::from_static(b"hello world");
        let seq = ChunkSequence::from_bytes_memory(data.clone());
        assert_eq!(seq.chunk_count(), 1);
        assert!(seq.check_invariants());
        assert_eq!(seq.to_contiguous_bytes().unwrap(), data);
    }

    #[test]
    fn value_straddling_chunk_boundary_splits_correctly() {
        let data = Bytes::from(vec![0xAB; MAX_CHUNK_SIZE + 1]);
        let seq = ChunkSequence::from_bytes_memory(data.clone());
        assert_eq!(seq.chunk_count(), 2);
        assert_eq!(seq.chunks()[0].len(), MAX_CHUNK_SIZE);
        assert_eq!(seq.chunks()[1].len(), 1);
        assert!(seq.check_invariants());
        assert_eq!(seq.to_contiguous_bytes().unwrap(), data);
    }

    #[test]
    fn value_exactly_one_chunk_size() {
        let data = Bytes::from(vec![0x01; MAX_CHUNK_SIZE]);
        let seq = ChunkSequence::from_bytes_memory(data);
        assert_eq!(seq.chunk_count(), 1);
        assert!(seq.check_invariants());
    }

    #[test]
    fn file_shard_reserves_monotonically() {
        let dir = std::env::temp_dir().join(format!("cachegrand-shard-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("db-0.shard");
        let shard = FileShard::open(&path, 4096).unwrap();

        let a = shard.reserve(100).unwrap();
        let b = shard.reserve(200).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 100);

        // Exhaust the shard.
        assert!(shard.reserve(4096).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_shard_write_and_read_back() {
        let dir = std::env::temp_dir().join(format!("cachegrand-shard-rw-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("db-0.shard");
        let shard = Arc::new(FileShard::open(&path, 4096).unwrap());

        let offset = shard.reserve(5).unwrap();
        shard.write_at(offset, b"hello").unwrap();

        // Re-open to get a fresh mmap reflecting the write.
        let shard2 = Arc::new(FileShard::open(&path, 4096).unwrap());
        let chunk = Chunk::File { shard: shard2, offset, length: 5 };
        assert_eq!(&chunk.bytes().unwrap()[..], b"hello");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
