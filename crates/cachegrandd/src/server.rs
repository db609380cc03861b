//! TCP server loop wiring the fiber scheduler, I/O completion adapter, and
//! storage DB facade together (spec.md §4.1/§4.2/§6). One fiber per
//! connection; the dispatcher below is the "out-of-scope command
//! dispatcher" spec.md §6 hands parsed key bytes to.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use cachegrand_core::fiber;
use cachegrand_core::io_adapter::{IoCompletionAdapter, TokioUringAdapter};
use cachegrand_core::storage_db::StorageDb;
use tokio_uring::net::{TcpListener, TcpStream};

use crate::config::SnapshotConfig;
use crate::resp::{self, RespReply};

/// Tracks connections currently being served by this worker so the "worker
/// `active_connections` returns to zero" testable property (spec.md §8
/// scenario 1) can be observed from outside the process.
#[derive(Default)]
pub struct ActiveConnections(AtomicU64);

impl ActiveConnections {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

const DEFAULT_DB: u8 = 0;
const READ_CHUNK_SIZE: usize = 4096;
const RECLAMATION_TICK: std::time::Duration = std::time::Duration::from_millis(5);

/// Runs the accept loop on the current thread's `tokio-uring` runtime until
/// the listener errors out. One [`fiber::new_fiber`] per accepted
/// connection, matching the "fiber per request" model spec.md §4.1
/// describes.
pub async fn run(
    addr: SocketAddr,
    storage: Arc<StorageDb>,
    active_connections: Arc<ActiveConnections>,
    snapshot_config: SnapshotConfig,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    tracing::info!(%addr, "cachegrandd listening");
    let adapter = Arc::new(TokioUringAdapter::new());

    fiber::new_fiber(run_reclamation_loop(adapter.clone(), storage.clone()));
    if snapshot_config.interval_ms > 0 {
        fiber::new_fiber(run_snapshot_loop(adapter.clone(), storage.clone(), snapshot_config));
    }

    loop {
        let stream = match adapter.accept(&listener).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(?err, "accept failed");
                continue;
            }
        };

        let storage = storage.clone();
        let active_connections = active_connections.clone();
        let adapter = adapter.clone();
        fiber::new_fiber(async move {
            handle_connection(&adapter, stream, storage, active_connections).await;
        });
    }
}

/// The reclamation fiber spec.md §4.4 calls for, "ticks every ~5ms": drains
/// this worker's deferred-deletion list into its reclaimed-entry ring for
/// as long as the server is running.
async fn run_reclamation_loop(adapter: Arc<TokioUringAdapter>, storage: Arc<StorageDb>) {
    loop {
        adapter.timeout(RECLAMATION_TICK).await;
        storage.run_reclamation();
    }
}

/// Background snapshot fiber (spec.md §4.6, §8 scenario 5): every
/// `snapshot_config.interval_ms`, write a fresh RDB file to
/// `snapshot_config.file_path()`. A run already in progress (from a prior
/// tick that's still walking a very large table) makes the next tick's
/// `run_snapshot` call a no-op rather than piling up concurrent runs.
async fn run_snapshot_loop(adapter: Arc<TokioUringAdapter>, storage: Arc<StorageDb>, snapshot_config: SnapshotConfig) {
    let interval = std::time::Duration::from_millis(snapshot_config.interval_ms);
    if let Err(err) = std::fs::create_dir_all(&snapshot_config.directory) {
        tracing::error!(?err, directory = %snapshot_config.directory.display(), "snapshot directory unavailable, disabling periodic snapshots");
        return;
    }

    loop {
        adapter.timeout(interval).await;
        let result = storage.run_snapshot(
            snapshot_config.file_path(),
            snapshot_config.rotation_max_files as u32,
            snapshot_config.block_size_buckets,
            now_ms(),
        );
        match result {
            Ok(()) => tracing::info!(path = %snapshot_config.file_path().display(), "snapshot written"),
            Err(cachegrand_core::snapshot::SnapshotError::AlreadyRunning) => {
                tracing::debug!("skipping snapshot tick, previous run still in progress")
            }
            Err(err) => tracing::warn!(?err, "snapshot run failed"),
        }
    }
}

async fn handle_connection(
    adapter: &TokioUringAdapter,
    stream: TcpStream,
    storage: Arc<StorageDb>,
    active_connections: Arc<ActiveConnections>,
) {
    active_connections.increment();
    let mut pending = BytesMut::new();
    let mut read_buf = vec![0u8; READ_CHUNK_SIZE];

    'connection: loop {
        let (result, buf) = adapter.recv(&stream, read_buf).await;
        read_buf = buf;
        let bytes_read = match result {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&read_buf[..bytes_read]);
        read_buf.resize(READ_CHUNK_SIZE, 0);

        loop {
            let command = match resp::parse_command(&mut pending) {
                Ok(Some(parts)) => parts,
                Ok(None) => break,
                Err(_) => break 'connection,
            };

            let reply = dispatch(&command, &storage);
            let mut out = BytesMut::new();
            resp::encode_reply(&mut out, &reply);
            let (send_result, _buf) = adapter.send(&stream, out.to_vec()).await;
            if send_result.is_err() {
                break 'connection;
            }
        }
    }

    let _ = adapter.close(stream).await;
    active_connections.decrement();
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The RESP command dispatcher spec.md §6 scopes out of `cachegrand-core`:
/// PING, GET, SET (with an optional `PX <milliseconds>` expiry), DEL.
fn dispatch(command: &[Bytes], storage: &StorageDb) -> RespReply {
    let Some(name) = command.first() else {
        return RespReply::Error("ERR empty command".to_string());
    };
    let name = name.to_ascii_uppercase();

    match name.as_slice() {
        b"PING" => match command.get(1) {
            Some(message) => RespReply::Bulk(message.clone()),
            None => RespReply::Simple("PONG"),
        },
        b"GET" => {
            let Some(key) = command.get(1) else {
                return RespReply::Error("ERR wrong number of arguments for 'get'".to_string());
            };
            match storage.get(DEFAULT_DB, key, now_ms()) {
                Some(entry) => match entry.value.to_contiguous_bytes() {
                    Ok(value) => RespReply::Bulk(value),
                    Err(_) => RespReply::Error("ERR value retrieval failed".to_string()),
                },
                None => RespReply::Nil,
            }
        }
        b"SET" => {
            let (Some(key), Some(value)) = (command.get(1), command.get(2)) else {
                return RespReply::Error("ERR wrong number of arguments for 'set'".to_string());
            };
            let expiry_ms = match parse_px_option(command) {
                Ok(expiry) => expiry,
                Err(message) => return RespReply::Error(message),
            };
            match storage.set(DEFAULT_DB, key, value.clone(), expiry_ms, now_ms()) {
                Ok(()) => RespReply::Simple("OK"),
                Err(err) => RespReply::Error(format!("ERR {err}")),
            }
        }
        b"DEL" => {
            let now = now_ms();
            let deleted = command[1..].iter().filter(|key| storage.delete(DEFAULT_DB, key, now)).count();
            RespReply::Integer(deleted as i64)
        }
        _ => RespReply::Error(format!("ERR unknown command '{}'", String::from_utf8_lossy(&name))),
    }
}

/// `SET key value PX <milliseconds>` turns the relative expiry into an
/// absolute `now + px` in `now_ms`, matching [`StorageDb::set`]'s
/// `requested_expiry_ms` contract (`0` = none).
fn parse_px_option(command: &[Bytes]) -> Result<u64, String> {
    match command.get(3) {
        None => Ok(0),
        Some(option) if option.eq_ignore_ascii_case(b"PX") => {
            let Some(value) = command.get(4) else {
                return Err("ERR PX requires a value".to_string());
            };
            let millis: u64 = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| "ERR PX value is not an integer".to_string())?;
            Ok(now_ms() + millis)
        }
        Some(_) => Err("ERR syntax error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachegrand_core::storage_db::TtlPolicy;

    fn db() -> StorageDb {
        StorageDb::new(1024, TtlPolicy::default())
    }

    #[test]
    fn ping_without_argument_returns_simple_pong() {
        let store = db();
        match dispatch(&[Bytes::from_static(b"PING")], &store) {
            RespReply::Simple(s) => assert_eq!(s, "PONG"),
            _ => panic!("expected simple reply"),
        }
    }

    #[test]
    fn set_then_get_round_trips_through_dispatch() {
        let store = db();
        dispatch(&[Bytes::from_static(b"SET"), Bytes::from_static(b"foo"), Bytes::from_static(b"bar")], &store);
        match dispatch(&[Bytes::from_static(b"GET"), Bytes::from_static(b"foo")], &store) {
            RespReply::Bulk(value) => assert_eq!(value, Bytes::from_static(b"bar")),
            _ => panic!("expected bulk reply"),
        }
    }

    #[test]
    fn del_counts_only_existing_keys() {
        let store = db();
        for key in [b"a".as_slice(), b"b", b"c"] {
            dispatch(&[Bytes::from_static(b"SET"), Bytes::copy_from_slice(key), Bytes::from_static(b"bar")], &store);
        }
        let reply = dispatch(
            &[
                Bytes::from_static(b"DEL"),
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"z"),
            ],
            &store,
        );
        match reply {
            RespReply::Integer(n) => assert_eq!(n, 2),
            _ => panic!("expected integer reply"),
        }
        match dispatch(&[Bytes::from_static(b"GET"), Bytes::from_static(b"c")], &store) {
            RespReply::Bulk(value) => assert_eq!(value, Bytes::from_static(b"bar")),
            _ => panic!("expected bulk reply"),
        }
    }

    #[test]
    fn get_on_missing_key_returns_nil() {
        let store = db();
        match dispatch(&[Bytes::from_static(b"GET"), Bytes::from_static(b"missing")], &store) {
            RespReply::Nil => {}
            _ => panic!("expected nil reply"),
        }
    }

    #[test]
    fn unknown_command_returns_error() {
        let store = db();
        match dispatch(&[Bytes::from_static(b"FROB")], &store) {
            RespReply::Error(message) => assert!(message.contains("unknown command")),
            _ => panic!("expected error reply"),
        }
    }

    #[test]
    fn active_connections_counter_round_trips() {
        let counter = ActiveConnections::default();
        assert_eq!(counter.get(), 0);
        counter.increment();
        assert_eq!(counter.get(), 1);
        counter.decrement();
        assert_eq!(counter.get(), 0);
    }
}
