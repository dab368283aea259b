//! Write batches: buffered mutations, deduplication, memdb staging and
//! the persistent commit walk.
//!
//! A batch buffers put/delete records in a private byte arena. `write`
//! collapses duplicates (latest occurrence of each key hash wins),
//! stages the survivors into the shared memdb under fresh sequence
//! numbers, and occupies the single writer slot. `commit` replays the
//! staged entries against the bucket table and data region under the
//! main mutex; `abort` drops the staged work and vacates the writer
//! slot. Every bucket is rewritten immediately after its slot changes,
//! so readers observe either the old or the new entry, never a torn
//! one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bucket::{BucketHandle, Slot, SLOTS_PER_BUCKET};
use crate::config::Options;
use crate::data::now_secs;
use crate::db::Db;
use crate::error::Result;
use crate::hash::key_hash;
use crate::ikey;
use crate::memdb::MemState;
use crate::Error;

/// Record count past which the buffer growth rate starts tapering.
const GROW_RECORDS: usize = 3000;

/// Descriptor of one buffered mutation. Key and value bytes live in the
/// batch arena; extraction is offset arithmetic, no copies.
#[derive(Debug, Clone, Copy)]
struct BatchIndex {
    del_flag: bool,
    hash: u32,
    key_size: u16,
    value_size: u32,
    expires_at: u32,
    kv_offset: usize,
}

impl BatchIndex {
    fn kv_size(&self) -> usize {
        usize::from(self.key_size) + self.value_size as usize
    }

    fn kv<'a>(&self, data: &'a [u8]) -> (&'a [u8], &'a [u8]) {
        let kv = &data[self.kv_offset..self.kv_offset + self.kv_size()];
        kv.split_at(usize::from(self.key_size))
    }
}

/// An ordered set of put/delete mutations applied as a unit.
pub struct Batch<'a> {
    db: &'a Db,
    managed: bool,
    holds_gate: bool,
    batch_seq: u64,
    data: Vec<u8>,
    index: Vec<BatchIndex>,
    first_key_hash: u32,
    mem: Option<Arc<crate::memdb::MemDb>>,
    internal_len: u32,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a Db) -> Result<Self> {
        let mut batch = Self {
            db,
            managed: false,
            holds_gate: false,
            batch_seq: 0,
            data: Vec::new(),
            index: Vec::new(),
            first_key_hash: 0,
            mem: None,
            internal_len: 0,
        };
        batch.init()?;
        Ok(batch)
    }

    pub(crate) fn new_managed(db: &'a Db) -> Result<Self> {
        let mut batch = Self::new(db)?;
        batch.managed = true;
        Ok(batch)
    }

    /// Binds the batch to the store's shared memdb, replacing it with a
    /// fresh instance when the previous generation is fully released.
    fn init(&mut self) -> Result<()> {
        if self.mem.is_some() {
            return Err(Error::BatchInProgress);
        }
        let mut shared = self.db.mem.lock().unwrap();
        if shared.getref() == 0 {
            *shared = Arc::new(crate::memdb::MemDb::new());
        }
        shared.incref();
        self.mem = Some(Arc::clone(&shared));
        Ok(())
    }

    /// Appends a put record. Key and value are validated at `write`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.put_with_ttl(key, value, Duration::ZERO);
    }

    /// Appends a put record that expires `ttl` from now. A zero `ttl`
    /// never expires.
    pub fn put_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            0
        } else {
            now_secs().saturating_add(ttl.as_secs().min(u64::from(u32::MAX)) as u32)
        };
        self.append_rec(false, expires_at, key, value);
    }

    /// Appends a delete record.
    pub fn delete(&mut self, key: &[u8]) {
        self.append_rec(true, 0, key, &[]);
    }

    /// Number of buffered records, before deduplication.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Clears the buffered records. Leaves the memdb binding intact.
    pub fn reset(&mut self) {
        self.data.clear();
        self.index.clear();
        self.internal_len = 0;
    }

    /// Ensures capacity for `n` more bytes. Growth headroom shrinks as
    /// the record count climbs, trading amortized append cost for a
    /// smaller peak footprint on huge batches.
    fn grow(&mut self, n: usize) {
        let o = self.data.len();
        if self.data.capacity() - o < n {
            let mut div = 1;
            if self.index.len() > GROW_RECORDS {
                div = self.index.len() / GROW_RECORDS;
            }
            self.data.reserve_exact(n + o / div);
        }
    }

    fn append_rec(&mut self, del_flag: bool, expires_at: u32, key: &[u8], value: &[u8]) {
        let n = 1 + key.len() + if del_flag { 0 } else { value.len() };
        self.grow(n);

        let hash = key_hash(key);
        self.data.push(u8::from(del_flag));
        let kv_offset = self.data.len();
        self.data.extend_from_slice(key);
        let mut value_size = 0u32;
        if !del_flag {
            value_size = value.len() as u32;
            self.data.extend_from_slice(value);
        }

        self.index.push(BatchIndex {
            del_flag,
            hash,
            key_size: key.len() as u16,
            value_size,
            expires_at,
            kv_offset,
        });
        if self.first_key_hash == 0 {
            self.first_key_hash = hash;
        }
        self.internal_len += key.len() as u32 + value_size + 8;
    }

    /// The subset of records to stage: one survivor per key hash, the
    /// last appended, kept at the position of its latest occurrence.
    ///
    /// Hash equality stands in for key equality here, exactly as the
    /// on-disk table treats it: two distinct keys colliding on the full
    /// 32-bit hash within one batch will be merged.
    fn uniq(&self) -> Vec<BatchIndex> {
        let mut latest: HashMap<u32, (usize, BatchIndex)> = HashMap::with_capacity(self.index.len());
        let mut i = 0;
        for entry in self.index.iter().rev() {
            if !latest.contains_key(&entry.hash) {
                latest.insert(entry.hash, (i, *entry));
                i += 1;
            }
        }

        let n = latest.len();
        let mut pending: Vec<Option<BatchIndex>> = vec![None; n];
        for (pos, entry) in latest.into_values() {
            pending[n - pos - 1] = Some(entry);
        }
        pending.into_iter().flatten().collect()
    }

    /// Deduplicates the buffered records and stages the survivors into
    /// the memdb under fresh sequence numbers. Blocks until the writer
    /// slot is free and keeps holding it; `abort` releases it.
    pub fn write(&mut self) -> Result<()> {
        let Some(mem) = self.mem.as_ref().map(Arc::clone) else {
            return Ok(());
        };
        if !self.holds_gate {
            self.db.acquire_write_gate();
            self.holds_gate = true;
        }

        let start = Instant::now();
        let mut m = mem.lock();
        self.batch_seq = m.seq;

        for entry in self.uniq() {
            let (key, value) = entry.kv(&self.data);
            Self::mput(
                &self.db.opts,
                &mut m,
                entry.del_flag,
                entry.hash,
                entry.expires_at,
                key,
                value,
            )?;
        }
        drop(m);

        tracing::debug!(records = self.len(), elapsed = ?start.elapsed(), "batch write");
        Ok(())
    }

    /// Stages one record: validate, build the internal key under the
    /// next sequence number, insert, split the memdb past the load
    /// factor, then advance the sequence.
    fn mput(
        opts: &Options,
        m: &mut MemState,
        del_flag: bool,
        hash: u32,
        expires_at: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        if key.len() > opts.max_key_length {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > opts.max_value_length {
            return Err(Error::ValueTooLarge);
        }

        let ik = ikey::encode(key, m.seq + 1, del_flag, expires_at);
        m.put(hash, &ik, value, expires_at)?;
        if m.load() > opts.load_factor {
            m.split();
        }
        m.seq += 1;
        Ok(())
    }

    /// Applies the staged entries to the persistent store.
    ///
    /// Panics if the batch is managed; `Db::update` owns the lifecycle
    /// of managed batches.
    pub fn commit(&mut self) -> Result<()> {
        assert!(!self.managed, "managed batch commit not allowed");
        self.commit_unchecked()
    }

    pub(crate) fn commit_unchecked(&mut self) -> Result<()> {
        match self.mem.as_ref() {
            Some(mem) if mem.getref() > 0 => self.apply(),
            _ => Ok(()),
        }
    }

    /// The commit walk: scan every memdb bucket in order, and for each
    /// entry staged by this batch, apply it to the bucket table and
    /// data region. Runs entirely under the main mutex.
    fn apply(&mut self) -> Result<()> {
        let mem = Arc::clone(self.mem.as_ref().expect("batch not bound"));
        let mut del_count = 0u64;
        let mut put_count = 0u64;
        // Spans superseded by updates stay allocated until the walk
        // completes; a torn run must never have handed them out again.
        let mut pending_frees: Vec<(u32, u64)> = Vec::new();

        let mut inner = self.db.inner.lock().unwrap();
        let m = mem.lock();

        // Staged entries scatter across the whole bucket range (the
        // hash decides each one's bucket, and splits relocate them
        // besides), so the walk must cover every bucket. The sequence
        // bound below still ends it early once this batch's entries
        // are exhausted.
        let batch_len = self.len() as u64;

        'walk: for bucket_idx in 0..m.n_buckets() {
            let mut memb = *m.bucket(bucket_idx);
            loop {
                for memsl in memb.slots.iter() {
                    if memsl.is_empty() {
                        break;
                    }
                    let (mem_key, value) = match m.read_key_value(memsl) {
                        Ok(kv) => kv,
                        Err(Error::KeyExpired) => continue,
                        Err(e) => return Err(e),
                    };
                    let parsed = ikey::parse(mem_key)?;
                    if parsed.seq <= self.batch_seq {
                        // Staged by an earlier batch generation.
                        continue;
                    }
                    if parsed.seq > self.batch_seq + batch_len {
                        // Every entry of this batch has been applied.
                        break 'walk;
                    }
                    let hash = key_hash(parsed.ukey);

                    if parsed.deleted {
                        if !inner.filter.test(u64::from(hash)) {
                            // The key was never written; skip to the
                            // next chained bucket.
                            break;
                        }
                        del_count += 1;
                        if let Some((mut bh, i)) = inner.find_slot(hash, parsed.ukey)? {
                            let sl = bh.bucket.slots[i];
                            bh.bucket.remove(i);
                            inner.index.write_bucket(&bh.bucket, bh.offset)?;
                            inner.data.free(sl.kv_size(), sl.kv_offset);
                            inner.count -= 1;
                        }
                        // Not found: the filter reported a false
                        // positive.
                    } else {
                        put_count += 1;
                        Self::apply_put(
                            &mut inner,
                            &mut pending_frees,
                            self.db.opts.max_keys,
                            hash,
                            parsed.ukey,
                            value,
                            parsed.expires_at,
                        )?;
                    }
                }
                if memb.next == 0 {
                    break;
                }
                memb = *m.overflow_bucket(memb.next);
            }
        }
        drop(m);

        for (size, offset) in pending_frees {
            inner.data.free(size, offset);
        }
        self.db.metrics.add_dels(del_count);
        self.db.metrics.add_puts(put_count);
        tracing::debug!(puts = put_count, dels = del_count, "batch commit");

        if self.db.opts.sync_writes {
            inner.sync_files()?;
        }
        Ok(())
    }

    /// Inserts or updates one key in the bucket table: find the first
    /// empty slot or the existing entry along the chain, allocating and
    /// linking an overflow bucket when the chain is saturated.
    fn apply_put(
        inner: &mut crate::db::DbInner,
        pending_frees: &mut Vec<(u32, u64)>,
        max_keys: u64,
        hash: u32,
        ukey: &[u8],
        value: &[u8],
        expires_at: u32,
    ) -> Result<()> {
        let mut offset = inner
            .index
            .bucket_offset(u64::from(inner.index.bucket_index(hash)));
        let mut dest: Option<(BucketHandle, usize, bool)> = None;
        let mut original: Option<BucketHandle> = None;

        loop {
            let bucket = inner.index.read_bucket(offset)?;
            for i in 0..SLOTS_PER_BUCKET {
                let sl = bucket.slots[i];
                if sl.is_empty() {
                    dest = Some((BucketHandle { bucket, offset }, i, false));
                    break;
                }
                if sl.hash == hash && usize::from(sl.key_size) == ukey.len() {
                    let stored = inner.data.read_key(&sl)?;
                    if stored == ukey {
                        dest = Some((BucketHandle { bucket, offset }, i, true));
                        break;
                    }
                }
            }
            if dest.is_some() {
                break;
            }
            if bucket.next == 0 {
                // Chain saturated: grow it with a fresh overflow bucket
                // and take its first slot.
                let fresh = inner.index.create_overflow_bucket()?;
                let mut prev = BucketHandle { bucket, offset };
                prev.bucket.next = fresh.offset;
                original = Some(prev);
                dest = Some((fresh, 0, false));
                break;
            }
            offset = bucket.next;
        }

        let (mut bh, entry_idx, existing) = dest.expect("chain walk found no destination");
        if existing {
            let old = bh.bucket.slots[entry_idx];
            pending_frees.push((old.kv_size(), old.kv_offset));
        } else {
            if inner.count == max_keys {
                return Err(Error::Full);
            }
            inner.count += 1;
        }

        let kv_offset = inner.data.write_key_value(ukey, value)?;
        bh.bucket.slots[entry_idx] = Slot {
            hash,
            key_size: ukey.len() as u16,
            value_size: value.len() as u32,
            expires_at,
            kv_offset,
        };
        inner.index.write_bucket(&bh.bucket, bh.offset)?;
        if let Some(orig) = original {
            inner.index.write_bucket(&orig.bucket, orig.offset)?;
        }
        inner.filter.append(u64::from(hash));
        Ok(())
    }

    /// Drops the staged work, unbinds the memdb and vacates the writer
    /// slot.
    ///
    /// Panics if the batch is managed.
    pub fn abort(&mut self) {
        assert!(!self.managed, "managed batch abort not allowed");
        self.abort_unchecked();
    }

    pub(crate) fn abort_unchecked(&mut self) {
        self.reset();
        if let Some(mem) = self.mem.take() {
            mem.decref();
        }
        if self.holds_gate {
            self.holds_gate = false;
            self.db.release_write_gate();
        }
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if let Some(mem) = self.mem.take() {
            mem.decref();
        }
        if self.holds_gate {
            self.holds_gate = false;
            self.db.release_write_gate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::tmpfs::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open_with_options(Options::new(dir.path()).initial_buckets(8))
            .expect("Failed to open db")
    }

    #[test]
    fn test_append_records_layout() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        batch.put(b"alpha", b"1");
        batch.delete(b"beta");
        assert_eq!(batch.len(), 2);

        let (k0, v0) = batch.index[0].kv(&batch.data);
        assert_eq!(k0, b"alpha");
        assert_eq!(v0, b"1");
        assert!(!batch.index[0].del_flag);

        let (k1, v1) = batch.index[1].kv(&batch.data);
        assert_eq!(k1, b"beta");
        assert!(v1.is_empty());
        assert!(batch.index[1].del_flag);

        assert_eq!(batch.first_key_hash, key_hash(b"alpha"));
        assert_eq!(batch.internal_len, (5 + 1 + 8) + (4 + 8));
        batch.abort();
    }

    #[test]
    fn test_uniq_keeps_latest_in_order() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.put(b"a", b"3");
        batch.put(b"c", b"4");

        let pending = batch.uniq();
        assert_eq!(pending.len(), 3);

        let keys: Vec<&[u8]> = pending.iter().map(|e| e.kv(&batch.data).0).collect();
        // "a" survives at the position of its latest occurrence.
        assert_eq!(keys, vec![b"b" as &[u8], b"a", b"c"]);
        let (_, va) = pending[1].kv(&batch.data);
        assert_eq!(va, b"3");
        batch.abort();
    }

    #[test]
    fn test_uniq_delete_supersedes_put() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        batch.put(b"x", b"1");
        batch.delete(b"x");

        let pending = batch.uniq();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].del_flag);
        batch.abort();
    }

    #[test]
    fn test_reset_clears_buffers() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        batch.put(b"k", b"v");
        batch.reset();
        assert_eq!(batch.len(), 0);
        assert!(batch.data.is_empty());
        assert_eq!(batch.internal_len, 0);
        batch.abort();
    }

    #[test]
    fn test_write_assigns_contiguous_sequences() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.put(b"c", b"3");
        batch.write().expect("write failed");

        let mem = batch.mem.as_ref().expect("memdb unbound");
        let m = mem.lock();
        assert_eq!(batch.batch_seq, 0);
        assert_eq!(m.seq, 3, "three staged entries, sequences 1..=3");
        assert_eq!(m.count, 3);
        drop(m);
        batch.abort();
    }

    #[test]
    fn test_write_validates_keys() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = Db::open_with_options(
            Options::new(dir.path())
                .initial_buckets(8)
                .max_key_length(16)
                .max_value_length(32),
        )
        .expect("Failed to open db");

        let mut batch = db.batch().expect("Failed to create batch");
        batch.put(b"", b"v");
        assert_eq!(batch.write(), Err(Error::KeyEmpty));
        batch.abort();

        let mut batch = db.batch().expect("Failed to create batch");
        batch.put(&[b'k'; 17], b"v");
        assert_eq!(batch.write(), Err(Error::KeyTooLarge));
        batch.abort();

        let mut batch = db.batch().expect("Failed to create batch");
        batch.put(b"k", &[b'v'; 33]);
        assert_eq!(batch.write(), Err(Error::ValueTooLarge));
        batch.abort();

        // Exactly at the limits is accepted.
        let mut batch = db.batch().expect("Failed to create batch");
        batch.put(&[b'k'; 16], &[b'v'; 32]);
        batch.write().expect("write at limits failed");
        batch.commit().expect("commit failed");
        batch.abort();
        assert_eq!(db.count(), 1);
    }

    #[test]
    fn test_commit_without_write_is_noop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        batch.put(b"k", b"v");
        // Nothing staged: the walk finds no entries above batch_seq.
        batch.commit().expect("commit failed");
        assert_eq!(db.count(), 0);
        batch.abort();
    }

    #[test]
    fn test_commit_after_abort_is_noop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        batch.put(b"k", b"v");
        batch.abort();
        batch.commit().expect("commit after abort failed");
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn test_buffer_growth_taper() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_db(&dir);
        let mut batch = db.batch().expect("Failed to create batch");

        for i in 0..(GROW_RECORDS + 100) {
            let key = format!("key_{i:06}");
            batch.put(key.as_bytes(), b"value");
        }
        assert_eq!(batch.len(), GROW_RECORDS + 100);

        let (k, v) = batch.index[GROW_RECORDS + 99].kv(&batch.data);
        assert_eq!(k, format!("key_{:06}", GROW_RECORDS + 99).as_bytes());
        assert_eq!(v, b"value");
        batch.abort();
    }
}
