//! Database handle: open/close, point reads, iteration, and the
//! shared state the batch commit path mutates.
//!
//! # Locking
//!
//! Two gates serialize access:
//!
//! - the **writer gate**, a one-slot channel. `Batch::write` blocks
//!   sending into it and `Batch::abort` drains it, so exactly one
//!   write/commit/abort sequence is in flight at a time.
//! - `Db::inner`, a mutex over the persistent structures (bucket index,
//!   data region, presence filter, live count). Point reads and the
//!   whole commit walk run under it, so a reader can never observe a
//!   half-written slot.
//!
//! The memdb is shared across batches through an `Arc` plus an explicit
//! reference count; a fresh one is swapped in whenever the previous
//! generation has been fully released.

use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::batch::Batch;
use crate::bucket::{Bucket, BucketHandle, SLOTS_PER_BUCKET};
use crate::config::Options;
use crate::data::DataFile;
use crate::error::Result;
use crate::filter::Filter;
use crate::flock::FileLock;
use crate::hash::key_hash;
use crate::index::IndexFile;
use crate::memdb::MemDb;
use crate::meta::Meta;
use crate::metrics::Metrics;
use crate::Error;

const LOCK_FILE: &str = "kiln.lock";
const INDEX_FILE: &str = "kiln.index";
const DATA_FILE: &str = "kiln.data";
const META_FILE: &str = "kiln.meta";

/// An open kilndb store.
pub struct Db {
    pub(crate) opts: Options,
    _lock: FileLock,
    meta_path: PathBuf,
    pub(crate) inner: Mutex<DbInner>,
    pub(crate) mem: Mutex<Arc<MemDb>>,
    write_gate: SyncSender<()>,
    write_gate_release: Mutex<Receiver<()>>,
    pub(crate) metrics: Metrics,
}

/// Persistent structures guarded by the main mutex.
pub(crate) struct DbInner {
    pub index: IndexFile,
    pub data: DataFile,
    pub filter: Filter,
    pub count: u64,
}

impl DbInner {
    /// Walks the bucket chain for `hash` looking for `ukey`. Returns
    /// the containing bucket and slot position on a byte-equal match.
    pub fn find_slot(&self, hash: u32, ukey: &[u8]) -> Result<Option<(BucketHandle, usize)>> {
        let mut offset = self
            .index
            .bucket_offset(u64::from(self.index.bucket_index(hash)));
        loop {
            let bucket = self.index.read_bucket(offset)?;
            for i in 0..SLOTS_PER_BUCKET {
                let sl = bucket.slots[i];
                if sl.is_empty() {
                    break;
                }
                if sl.hash == hash && usize::from(sl.key_size) == ukey.len() {
                    let stored = self.data.read_key(&sl)?;
                    if stored == ukey {
                        return Ok(Some((BucketHandle { bucket, offset }, i)));
                    }
                }
            }
            if bucket.next == 0 {
                return Ok(None);
            }
            offset = bucket.next;
        }
    }

    /// Fsync both persistent files. Meta is written separately.
    pub fn sync_files(&self) -> Result<()> {
        self.data.sync()?;
        self.index.sync()
    }
}

impl Db {
    /// Opens a store in `dir` with default options.
    pub fn open(dir: &str) -> Result<Self> {
        Self::open_with_options(Options::new(dir))
    }

    /// Opens a store with custom options, creating the directory, the
    /// bucket table and the data file as needed. Holds an exclusive
    /// file lock for the lifetime of the handle.
    pub fn open_with_options(opts: Options) -> Result<Self> {
        std::fs::create_dir_all(&opts.dir)?;
        let lock = FileLock::lock(opts.dir.join(LOCK_FILE))?;

        let index = IndexFile::open(opts.dir.join(INDEX_FILE), opts.initial_buckets)?;
        let mut data = DataFile::open(opts.dir.join(DATA_FILE))?;
        let meta_path = opts.dir.join(META_FILE);

        let (count, filter) = match Meta::load(&meta_path) {
            Ok(Some(meta)) => match Filter::from_bits(meta.filter_bits) {
                Ok(filter) => {
                    data.free = meta.free;
                    (meta.count, filter)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "meta filter unreadable, rescanning index");
                    Self::rescan(&index, opts.filter_bits)?
                }
            },
            Ok(None) => Self::rescan(&index, opts.filter_bits)?,
            Err(e) => {
                tracing::warn!(error = %e, "meta snapshot unreadable, rescanning index");
                Self::rescan(&index, opts.filter_bits)?
            }
        };

        tracing::info!(dir = %opts.dir.display(), count, "opened database");

        let (write_gate, release) = sync_channel(1);
        Ok(Self {
            opts,
            _lock: lock,
            meta_path,
            inner: Mutex::new(DbInner {
                index,
                data,
                filter,
                count,
            }),
            mem: Mutex::new(Arc::new(MemDb::new())),
            write_gate,
            write_gate_release: Mutex::new(release),
            metrics: Metrics::default(),
        })
    }

    /// Rebuilds the live count and presence filter from the bucket
    /// table. Used when no meta snapshot survives; the free list cannot
    /// be recovered this way, so freed spans stay unused until
    /// overwritten.
    fn rescan(index: &IndexFile, filter_bits: usize) -> Result<(u64, Filter)> {
        let mut count = 0u64;
        let mut filter = Filter::new(filter_bits);
        // Overflow buckets sit in the same file after the primaries, so
        // a linear pass covers every chain without following links.
        for idx in 0..index.bucket_count() {
            let bucket = index.read_bucket(index.bucket_offset(idx))?;
            for sl in bucket.slots.iter().filter(|s| !s.is_empty()) {
                count += 1;
                filter.append(u64::from(sl.hash));
            }
        }
        if count > 0 {
            tracing::info!(count, "rebuilt index state from bucket scan");
        }
        Ok((count, filter))
    }

    /// Creates a new batch bound to this store.
    pub fn batch(&self) -> Result<Batch<'_>> {
        Batch::new(self)
    }

    /// Runs `f` against a managed batch, then writes and commits it.
    /// The batch is aborted (releasing the writer gate) on every path.
    /// Managed batches may not be committed or aborted by `f`.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> Result<()>,
    {
        let mut batch = Batch::new_managed(self)?;
        let result = f(&mut batch)
            .and_then(|()| batch.write())
            .and_then(|()| batch.commit_unchecked());
        batch.abort_unchecked();
        result
    }

    /// Looks up `key`, returning its value if present and unexpired.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.metrics.add_gets(1);
        let hash = key_hash(key);
        let inner = self.inner.lock().unwrap();
        if !inner.filter.test(u64::from(hash)) {
            return Ok(None);
        }
        match inner.find_slot(hash, key)? {
            Some((bh, i)) => match inner.data.read_key_value(&bh.bucket.slots[i]) {
                Ok((_, value)) => Ok(Some(value)),
                Err(Error::KeyExpired) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    /// Whether `key` is present and unexpired.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of live keys.
    pub fn count(&self) -> u64 {
        self.inner.lock().unwrap().count
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Iterates all live, unexpired items in bucket order. Holds the
    /// main mutex until the iterator is dropped.
    pub fn items(&self) -> ItemIterator<'_> {
        ItemIterator {
            inner: self.inner.lock().unwrap(),
            bucket_idx: 0,
            current: None,
            slot_idx: 0,
        }
    }

    /// Fsync the persistent files and write the meta snapshot.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.sync_files()?;
        self.write_meta(&inner)?;
        self.metrics.add_syncs(1);
        Ok(())
    }

    fn write_meta(&self, inner: &DbInner) -> Result<()> {
        Meta::new(
            inner.count,
            inner.data.free.clone(),
            inner.filter.bits().to_vec(),
        )
        .write(&self.meta_path)
    }

    /// Blocks until the writer slot is free, then occupies it.
    pub(crate) fn acquire_write_gate(&self) {
        self.write_gate
            .send(())
            .expect("writer gate receiver dropped");
    }

    /// Vacates the writer slot, unblocking the next writer.
    pub(crate) fn release_write_gate(&self) {
        self.write_gate_release
            .lock()
            .unwrap()
            .recv()
            .expect("writer gate sender dropped");
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap();
        if let Err(e) = self.write_meta(&inner) {
            tracing::warn!(error = %e, "failed to persist meta snapshot on close");
        }
    }
}

/// Iterator over all live items, in (bucket, slot) order. Expired
/// entries are skipped.
pub struct ItemIterator<'a> {
    inner: MutexGuard<'a, DbInner>,
    bucket_idx: u64,
    current: Option<Bucket>,
    slot_idx: usize,
}

impl Iterator for ItemIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let bucket = match self.current {
                Some(b) => b,
                None => {
                    if self.bucket_idx >= u64::from(self.inner.index.n_buckets()) {
                        return None;
                    }
                    let offset = self.inner.index.bucket_offset(self.bucket_idx);
                    self.bucket_idx += 1;
                    self.slot_idx = 0;
                    match self.inner.index.read_bucket(offset) {
                        Ok(b) => {
                            self.current = Some(b);
                            b
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }
            };

            if self.slot_idx >= SLOTS_PER_BUCKET {
                if let Err(e) = self.follow_chain(&bucket) {
                    return Some(Err(e));
                }
                continue;
            }

            let sl = bucket.slots[self.slot_idx];
            self.slot_idx += 1;
            if sl.is_empty() {
                // Occupied slots are contiguous; jump to the chained
                // bucket, or to the next primary if the chain ends.
                if let Err(e) = self.follow_chain(&bucket) {
                    return Some(Err(e));
                }
                continue;
            }

            match self.inner.data.read_key_value(&sl) {
                Ok(kv) => return Some(Ok(kv)),
                Err(Error::KeyExpired) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl ItemIterator<'_> {
    fn follow_chain(&mut self, bucket: &Bucket) -> Result<()> {
        if bucket.next == 0 {
            self.current = None;
        } else {
            self.current = Some(self.inner.index.read_bucket(bucket.next)?);
            self.slot_idx = 0;
        }
        Ok(())
    }
}
