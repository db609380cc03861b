//! cachegrand-core — the data plane of an in-memory, optionally disk-backed,
//! multi-worker key-value cache engine compatible with the Redis wire
//! protocol and RDB snapshot format.
//!
//! This crate is the core described in the design document: a concurrent
//! fingerprint-indexed hash table, an entry-index lifecycle with
//! reader-counted reclamation, a fiber-scheduler contract for cooperative
//! per-worker I/O, a storage-DB facade combining the above into a logical
//! multi-database store, and a snapshot engine that serializes a consistent
//! RDB file concurrently with live mutation.
//!
//! Out of scope, by design (see SPEC_FULL.md §1): the Redis command
//! dispatch layer, CLI/config-file parsing as a binary concern, TLS, and
//! platform capability probing. `cachegrandd` wires those in as a thin
//! consumer of this crate.

pub mod chunk;
pub mod counters;
pub mod entry_index;
pub mod error;
pub mod eviction;
pub mod fiber;
pub mod hash;
pub mod hashtable;
pub mod io_adapter;
pub mod snapshot;
pub mod storage_db;

pub use error::CoreError;
