//! Snapshot engine (spec.md §4.6): a background RDB producer that
//! serializes a logical, start-time-consistent view of the store while
//! mutations continue.

pub mod rdb;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::entry_index::EntryIndex;

/// Snapshot lifecycle state (spec.md §4.6 "States"). Stored as a `u8` so it
/// can be CAS'd directly; [`SnapshotState::try_from`] recovers the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotState {
    None = 0,
    InPreparation = 1,
    InProgress = 2,
    BeingFinalized = 3,
    Completed = 4,
    FailedDuringPreparation = 5,
    Failed = 6,
}

impl TryFrom<u8> for SnapshotState {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, ()> {
        Ok(match value {
            0 => SnapshotState::None,
            1 => SnapshotState::InPreparation,
            2 => SnapshotState::InProgress,
            3 => SnapshotState::BeingFinalized,
            4 => SnapshotState::Completed,
            5 => SnapshotState::FailedDuringPreparation,
            6 => SnapshotState::Failed,
            _ => return Err(()),
        })
    }
}

/// An entry pushed to the shadow queue when it is displaced from the table
/// before the snapshotter's bucket walk has reached its block (spec.md
/// §4.6 "Write-path shadow").
pub struct ShadowedEntry {
    pub database_number: u8,
    pub key: Bytes,
    pub entry: Arc<EntryIndex>,
}

/// Coordinates one snapshot run: the CAS'd state word, the block cursor
/// workers draw from, and the shadow queue draining displaced entries.
pub struct SnapshotRun {
    state: AtomicU8,
    start_time_ms: AtomicU64,
    next_block: AtomicU64,
    block_size_buckets: usize,
    total_blocks: u64,
    shadow_queue: Mutex<Vec<ShadowedEntry>>,
    final_path: PathBuf,
    temp_path: PathBuf,
    rotation_max_files: u32,
}

impl SnapshotRun {
    const DEFAULT_BLOCK_SIZE: usize = 64;

    /// Attempt to transition `NONE -> IN_PREPARATION`. Returns `None` if a
    /// snapshot is already in flight — the caller is the "loser" and should
    /// wait on the winner rather than start a second run (spec.md §4.6).
    pub fn try_begin(final_path: impl AsRef<Path>, bucket_count: usize, rotation_max_files: u32) -> Option<Arc<Self>> {
        Self::try_begin_with_block_size(final_path, bucket_count, rotation_max_files, Self::DEFAULT_BLOCK_SIZE)
    }

    /// Same as [`Self::try_begin`], but with the block-walk granularity
    /// (spec.md §4.6 "Block-parallel body") set by the caller instead of
    /// [`Self::DEFAULT_BLOCK_SIZE`] — `cachegrandd`'s `SnapshotConfig`
    /// exposes this as `block_size_buckets`.
    pub fn try_begin_with_block_size(
        final_path: impl AsRef<Path>,
        bucket_count: usize,
        rotation_max_files: u32,
        block_size_buckets: usize,
    ) -> Option<Arc<Self>> {
        let block_size_buckets = block_size_buckets.max(1);
        let run = Arc::new(Self {
            state: AtomicU8::new(SnapshotState::None as u8),
            start_time_ms: AtomicU64::new(0),
            next_block: AtomicU64::new(0),
            block_size_buckets,
            total_blocks: bucket_count.div_ceil(block_size_buckets) as u64,
            shadow_queue: Mutex::new(Vec::new()),
            final_path: final_path.as_ref().to_path_buf(),
            temp_path: Self::temp_path_for(final_path.as_ref()),
            rotation_max_files,
        });
        match run.state.compare_exchange(
            SnapshotState::None as u8,
            SnapshotState::InPreparation as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(run),
            Err(_) => None,
        }
    }

    fn temp_path_for(final_path: &Path) -> PathBuf {
        let suffix = format!(".{}.tmp", std::process::id());
        let mut name = final_path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn state(&self) -> SnapshotState {
        SnapshotState::try_from(self.state.load(Ordering::Acquire)).expect("valid snapshot state")
    }

    fn set_state(&self, state: SnapshotState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms.load(Ordering::Relaxed)
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn block_size_buckets(&self) -> usize {
        self.block_size_buckets
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Mark preparation complete and record the logical start time (spec.md
    /// §4.6 "Preparation"). Entries created at or after this time are
    /// treated as post-dating the snapshot and are skipped during the walk.
    pub fn begin_progress(&self, start_time_ms: u64) {
        self.start_time_ms.store(start_time_ms, Ordering::Relaxed);
        self.set_state(SnapshotState::InProgress);
    }

    /// Draw the next block index to process, or `None` once every block has
    /// been claimed (spec.md §4.6 "Block-parallel body").
    pub fn claim_next_block(&self) -> Option<u64> {
        let block = self.next_block.fetch_add(1, Ordering::AcqRel);
        if block < self.total_blocks {
            Some(block)
        } else {
            None
        }
    }

    /// Push a displaced entry that predates the snapshot and whose block
    /// has not yet been processed (spec.md §4.6 "Write-path shadow").
    pub fn push_shadow(&self, entry: ShadowedEntry) {
        self.shadow_queue.lock().push(entry);
    }

    /// Whether `bucket`'s containing block has already been claimed by a
    /// worker (used by callers deciding whether to shadow a displaced
    /// entry instead of relying on the live walk to see it).
    pub fn block_already_processed(&self, bucket: usize) -> bool {
        let block_index = (bucket / self.block_size_buckets) as u64;
        block_index < self.next_block.load(Ordering::Acquire)
    }

    /// Drain every shadowed entry collected so far.
    pub fn drain_shadow_queue(&self) -> Vec<ShadowedEntry> {
        std::mem::take(&mut self.shadow_queue.lock())
    }

    pub fn begin_finalizing(&self) {
        self.set_state(SnapshotState::BeingFinalized);
    }

    pub fn complete(&self) {
        self.set_state(SnapshotState::Completed);
    }

    pub fn fail(&self, during_preparation: bool) {
        self.set_state(if during_preparation {
            SnapshotState::FailedDuringPreparation
        } else {
            SnapshotState::Failed
        });
    }

    pub fn rotation_max_files(&self) -> u32 {
        self.rotation_max_files
    }
}

/// Drive one full snapshot to completion against `table`, serializing it to
/// `final_path` (spec.md §4.6). Simplified relative to the fully
/// block-parallel design the spec allows multiple workers to contribute
/// to: all blocks are processed on the calling worker, which is the "an
/// implementer may serialize all block processing on one worker — simpler"
/// option the spec explicitly names as equivalent from the outside.
///
/// `entry_metadata` resolves an `Arc<EntryIndex>` into
/// `(created_time_ms, expiry_time_ms, database_number)` for the skip/opcode
/// decisions, and `value_bytes` materializes its value chunk sequence.
pub fn run_snapshot<V, F>(
    table: &crate::hashtable::HashTable<V>,
    run: &SnapshotRun,
    start_time_ms: u64,
    resolve: F,
) -> Result<(), SnapshotError>
where
    V: Clone + Send + Sync + 'static,
    F: Fn(&V) -> Option<SnapshotRecord>,
{
    use std::io::Write;

    run.begin_progress(start_time_ms);

    let file = std::fs::File::create(run.temp_path()).map_err(SnapshotError::Io)?;
    let mut writer = std::io::BufWriter::new(file);
    let mut checksum = rdb::Crc64::new();
    checksum.update(rdb::RDB_HEADER);
    writer.write_all(rdb::RDB_HEADER).map_err(SnapshotError::Io)?;

    let mut last_db_written: Option<u8> = None;
    let mut scratch = BytesMut::new();

    while let Some(block) = run.claim_next_block() {
        let start_bucket = block as usize * run.block_size_buckets();
        let (found, _) = table.iter_max_distance(start_bucket, run.block_size_buckets(), None);
        for (bucket, key, value) in found {
            let Some(record) = resolve(&value) else { continue };
            if record.created_time_ms >= start_time_ms {
                continue;
            }
            let _ = bucket;
            write_record(&mut writer, &mut checksum, &mut scratch, &mut last_db_written, &key, &record)?;
        }

        for shadowed in run.drain_shadow_queue() {
            if let Some(record) = resolve_shadowed(&shadowed) {
                write_record(&mut writer, &mut checksum, &mut scratch, &mut last_db_written, &shadowed.key, &record)?;
            }
        }
    }

    run.begin_finalizing();

    checksum.update(&[rdb::OPCODE_EOF]);
    writer.write_all(&[rdb::OPCODE_EOF]).map_err(SnapshotError::Io)?;
    // The checksum trailer covers everything written above it — header,
    // every record, and the EOF opcode — but not itself.
    writer.write_all(&checksum.finish().to_le_bytes()).map_err(SnapshotError::Io)?;
    writer.flush().map_err(SnapshotError::Io)?;
    writer.get_ref().sync_all().map_err(SnapshotError::Io)?;
    drop(writer);

    rotate_existing_snapshots(run.final_path(), run.rotation_max_files()).map_err(SnapshotError::Io)?;
    std::fs::rename(run.temp_path(), run.final_path()).map_err(SnapshotError::Io)?;
    if let Some(parent) = run.final_path().parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    run.complete();
    Ok(())
}

fn resolve_shadowed(shadowed: &ShadowedEntry) -> Option<SnapshotRecord> {
    Some(SnapshotRecord {
        database_number: shadowed.database_number,
        created_time_ms: 0,
        expiry_time_ms: shadowed.entry.expiry_time_ms.load(Ordering::Relaxed),
        value: shadowed.entry.value.to_contiguous_bytes().ok()?,
    })
}

fn write_record(
    writer: &mut impl std::io::Write,
    checksum: &mut rdb::Crc64,
    scratch: &mut BytesMut,
    last_db_written: &mut Option<u8>,
    key: &Bytes,
    record: &SnapshotRecord,
) -> Result<(), SnapshotError> {
    scratch.clear();

    if *last_db_written != Some(record.database_number) {
        scratch.put_u8(rdb::OPCODE_DB_NUMBER);
        rdb::write_length(scratch, record.database_number as u64)?;
        *last_db_written = Some(record.database_number);
    }

    if record.expiry_time_ms != 0 {
        scratch.put_u8(rdb::OPCODE_EXPIRE_TIME_MS);
        scratch.put_u64_le(record.expiry_time_ms);
    }

    scratch.put_u8(0x00); // value-type: string
    rdb::encode_string(scratch, key)?;
    rdb::encode_string(scratch, &record.value)?;

    checksum.update(scratch);
    writer.write_all(scratch).map_err(SnapshotError::Io)
}

fn rotate_existing_snapshots(final_path: &Path, rotation_max_files: u32) -> std::io::Result<()> {
    if rotation_max_files <= 1 {
        return Ok(());
    }
    for generation in (0..rotation_max_files - 1).rev() {
        let from = numbered_path(final_path, generation);
        let to = numbered_path(final_path, generation + 1);
        if from.exists() {
            std::fs::rename(from, to)?;
        }
    }
    if final_path.exists() {
        std::fs::rename(final_path, numbered_path(final_path, 0))?;
    }
    Ok(())
}

fn numbered_path(final_path: &Path, generation: u32) -> PathBuf {
    if generation == 0 {
        final_path.to_path_buf()
    } else {
        let mut name = final_path.as_os_str().to_owned();
        name.push(format!(".{generation}"));
        PathBuf::from(name)
    }
}

/// The fields [`run_snapshot`] needs about one live value, independent of
/// how the caller's storage layer represents it.
pub struct SnapshotRecord {
    pub database_number: u8,
    pub created_time_ms: u64,
    pub expiry_time_ms: u64,
    pub value: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error during snapshot: {0}")]
    Io(std::io::Error),
    #[error(transparent)]
    Serialize(#[from] rdb::SerializeError),
    #[error("a snapshot is already in progress")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_begin_succeeds_once_and_rejects_concurrent_second_attempt() {
        let run = SnapshotRun::try_begin("/tmp/does-not-matter.rdb", 1024, 2).unwrap();
        assert_eq!(run.state(), SnapshotState::InPreparation);

        // A second SnapshotRun over the same logical slot would be
        // constructed by the caller's coordinator checking a shared atomic
        // before calling try_begin again; here we simulate the loser by
        // attempting the CAS directly on an already-InPreparation run.
        let result = run.state.compare_exchange(
            SnapshotState::None as u8,
            SnapshotState::InPreparation as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(result.is_err());
    }

    #[test]
    fn claim_next_block_exhausts_after_total_blocks() {
        let run = SnapshotRun::try_begin("/tmp/does-not-matter.rdb", 128, 1).unwrap();
        assert_eq!(run.total_blocks(), 2);
        assert_eq!(run.claim_next_block(), Some(0));
        assert_eq!(run.claim_next_block(), Some(1));
        assert_eq!(run.claim_next_block(), None);
    }

    #[test]
    fn block_already_processed_tracks_claimed_blocks() {
        let run = SnapshotRun::try_begin("/tmp/does-not-matter.rdb", 128, 1).unwrap();
        assert!(!run.block_already_processed(0));
        run.claim_next_block();
        assert!(run.block_already_processed(0));
        assert!(!run.block_already_processed(64));
    }

    #[test]
    fn checksum_trailer_changes_when_a_record_is_added() {
        use crate::hashtable::HashTable;

        let dir = std::env::temp_dir().join(format!("cachegrand-rdb-checksum-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let table: HashTable<Bytes> = HashTable::new(64);
        let _ = table.set(0, b"k1", Bytes::from_static(b"v1"));
        let resolve = |value: &Bytes| {
            Some(SnapshotRecord { database_number: 0, created_time_ms: 0, expiry_time_ms: 0, value: value.clone() })
        };

        let path_a = dir.join("a.rdb");
        let run_a = SnapshotRun::try_begin(&path_a, table.bucket_count(), 1).unwrap();
        run_snapshot(&table, &run_a, 1000, resolve).unwrap();
        let bytes_a = std::fs::read(&path_a).unwrap();

        let _ = table.set(0, b"k2", Bytes::from_static(b"v2"));
        let path_b = dir.join("b.rdb");
        let run_b = SnapshotRun::try_begin(&path_b, table.bucket_count(), 1).unwrap();
        run_snapshot(&table, &run_b, 1000, resolve).unwrap();
        let bytes_b = std::fs::read(&path_b).unwrap();

        // Same trailing 8 checksum bytes would mean the accumulator isn't
        // actually seeing the record bytes written above it.
        let checksum_a = &bytes_a[bytes_a.len() - 8..];
        let checksum_b = &bytes_b[bytes_b.len() - 8..];
        assert_ne!(checksum_a, checksum_b);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
