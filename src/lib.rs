//! kilndb: an embedded, log-structured key-value store built around a
//! write-batch commit engine.
//!
//! # Architecture
//!
//! Mutations flow through three stages:
//!
//! ```text
//! ┌───────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  Batch buffer │     │      Memdb      │     │ Persistent store │
//! │ (byte arena + │────▶│ (bucket hash,   │────▶│ (bucket table +  │
//! │  record index)│write│  seq-stamped)   │commit│  data region)   │
//! └───────────────┘     └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Write path
//! 1. **Buffer**: `Batch::put`/`delete` append records to a private
//!    arena; nothing is validated or visible yet.
//! 2. **Stage**: `Batch::write` deduplicates by key hash (latest wins),
//!    takes the single writer slot, and inserts the survivors into the
//!    shared memdb under fresh sequence numbers.
//! 3. **Commit**: `Batch::commit` walks the memdb in bucket order under
//!    the main mutex and applies each staged entry to the on-disk
//!    bucket table and data region — slot by slot, each bucket
//!    persisted immediately after it changes.
//!
//! ## Read path
//! Point reads hash the key, consult the presence filter, then walk the
//! bucket chain and compare stored keys byte-wise. Readers share the
//! main mutex with commit, so they observe each bucket either before or
//! after a commit touched it, never mid-write.
//!
//! # Concurrency and durability
//!
//! - A one-slot writer gate serializes batch write/commit/abort cycles.
//! - The main mutex covers the bucket table, data region, presence
//!   filter and live count.
//! - With `sync_writes` enabled every commit ends in an fsync; the meta
//!   snapshot (count, free list, filter) is persisted on sync and
//!   close, and rebuilt by scanning the bucket table when missing.

pub mod batch;
pub mod bucket;
pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod filter;
pub mod flock;
pub mod fs;
pub mod hash;
pub mod ikey;
pub mod index;
pub mod memdb;
pub mod meta;
pub mod metrics;
#[cfg(test)]
pub mod tmpfs;

pub use batch::Batch;
pub use config::Options;
pub use db::{Db, ItemIterator};
pub use error::{Error, Result};
pub use metrics::Metrics;
