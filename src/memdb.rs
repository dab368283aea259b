//! In-memory staging index for write batches.
//!
//! The memdb mirrors the persistent bucket table in miniature: the same
//! slot layout, bucket fan-out and overflow chaining, but backed by a
//! byte arena instead of the data file and grown by linear-hashing
//! splits instead of overflow-only growth. Batches stage internal-key
//! entries here under monotonically increasing sequence numbers; the
//! commit walk later replays staged entries in (bucket, slot) order.
//!
//! A memdb is shared: several batches may bind to one instance and all
//! draw from its sequence space. Sharing is tracked with an explicit
//! reference count — `Arc` aliveness is not the same thing, because the
//! owning `Db` keeps a handle to hand to future batches, and a commit
//! against a memdb no batch references anymore must be a no-op.
//!
//! All mutation happens while the database writer gate is held, so the
//! interior mutex is uncontended in practice; it exists to make shared
//! read access sound.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::bucket::{Slot, SLOTS_PER_BUCKET};
use crate::data::now_secs;
use crate::error::Result;
use crate::Error;

/// Primary bucket count of a fresh memdb. Must be a power of two for
/// the linear-hashing masks.
const INITIAL_BUCKETS: usize = 32;

/// A memdb bucket. `next` is a 1-based index into the overflow arena;
/// 0 terminates the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemBucket {
    pub slots: [Slot; SLOTS_PER_BUCKET],
    pub next: usize,
}

/// Position of a bucket in the two arenas.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Primary(usize),
    Overflow(usize),
}

/// Reference-counted shared staging index.
#[derive(Debug)]
pub struct MemDb {
    refs: AtomicI32,
    inner: Mutex<MemState>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::with_buckets(INITIAL_BUCKETS)
    }

    /// Test entry point: a memdb with a custom primary bucket count.
    pub(crate) fn with_buckets(base: usize) -> Self {
        assert!(base.is_power_of_two(), "bucket count must be a power of two");
        Self {
            refs: AtomicI32::new(0),
            inner: Mutex::new(MemState::new(base)),
        }
    }

    pub fn incref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn getref(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn lock(&self) -> MutexGuard<'_, MemState> {
        self.inner.lock().unwrap()
    }
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

/// The bucket table proper, behind the memdb mutex.
#[derive(Debug)]
pub struct MemState {
    level: u32,
    split_idx: usize,
    base: usize,
    buckets: Vec<MemBucket>,
    overflow: Vec<MemBucket>,
    free_overflow: Vec<usize>,
    data: Vec<u8>,
    pub count: u64,
    pub seq: u64,
}

impl MemState {
    fn new(base: usize) -> Self {
        Self {
            level: 0,
            split_idx: 0,
            base,
            buckets: vec![MemBucket::default(); base],
            overflow: Vec::new(),
            free_overflow: Vec::new(),
            // Offset 0 marks an empty slot, so it is never a valid
            // arena position.
            data: vec![0],
            count: 0,
            seq: 0,
        }
    }

    /// Current primary bucket count.
    pub fn n_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Linear-hashing bucket index: buckets before the split pointer
    /// have already been divided and use the wider mask.
    pub fn bucket_index(&self, hash: u32) -> usize {
        let h = hash as usize;
        let idx = h & ((self.base << self.level) - 1);
        if idx < self.split_idx {
            h & ((self.base << (self.level + 1)) - 1)
        } else {
            idx
        }
    }

    /// Occupancy across all primary buckets.
    pub fn load(&self) -> f64 {
        self.count as f64 / (self.n_buckets() * SLOTS_PER_BUCKET) as f64
    }

    /// Stages an internal-key/value pair under `hash`.
    pub fn put(&mut self, hash: u32, ikey: &[u8], value: &[u8], expires_at: u32) -> Result<()> {
        let kv_offset = self.data.len() as u64;
        self.data.extend_from_slice(ikey);
        self.data.extend_from_slice(value);

        let slot = Slot {
            hash,
            key_size: ikey.len() as u16,
            value_size: value.len() as u32,
            expires_at,
            kv_offset,
        };
        let idx = self.bucket_index(hash);
        self.insert_slot(idx, slot);
        self.count += 1;
        Ok(())
    }

    /// Reads the internal key and value staged in `slot`, failing with
    /// [`Error::KeyExpired`] once the entry's TTL has lapsed.
    pub fn read_key_value(&self, slot: &Slot) -> Result<(&[u8], &[u8])> {
        if slot.expires_at != 0 && slot.expires_at <= now_secs() {
            return Err(Error::KeyExpired);
        }
        let key_end = slot.kv_offset as usize + usize::from(slot.key_size);
        let kv_end = key_end + slot.value_size as usize;
        if kv_end > self.data.len() {
            return Err(Error::Corrupted("memdb slot out of range".to_string()));
        }
        Ok((
            &self.data[slot.kv_offset as usize..key_end],
            &self.data[key_end..kv_end],
        ))
    }

    /// The primary bucket at `idx`, for walking.
    pub fn bucket(&self, idx: usize) -> &MemBucket {
        &self.buckets[idx]
    }

    /// The overflow bucket chained as `next` (1-based).
    pub fn overflow_bucket(&self, next: usize) -> &MemBucket {
        &self.overflow[next - 1]
    }

    /// Splits the bucket at the split pointer, redistributing its chain
    /// between the old position and a freshly appended bucket.
    pub fn split(&mut self) {
        let old_idx = self.split_idx;
        let wide_mask = (self.base << (self.level + 1)) - 1;

        let mut slots = Vec::new();
        let mut b = std::mem::take(&mut self.buckets[old_idx]);
        loop {
            for sl in b.slots.iter().filter(|s| !s.is_empty()) {
                slots.push(*sl);
            }
            if b.next == 0 {
                break;
            }
            let n = b.next;
            b = std::mem::take(&mut self.overflow[n - 1]);
            self.free_overflow.push(n);
        }

        self.buckets.push(MemBucket::default());
        for sl in slots {
            let target = (sl.hash as usize) & wide_mask;
            self.insert_slot(target, sl);
        }

        self.split_idx += 1;
        if self.split_idx == self.base << self.level {
            self.level += 1;
            self.split_idx = 0;
        }
        tracing::debug!(
            n_buckets = self.n_buckets(),
            count = self.count,
            "memdb split"
        );
    }

    /// Places `slot` in the first free slot of the chain at `idx`,
    /// growing the chain with an overflow bucket when saturated. Does
    /// not touch `count`.
    fn insert_slot(&mut self, idx: usize, slot: Slot) {
        let mut loc = Loc::Primary(idx);
        loop {
            let b = self.bucket_mut(loc);
            if let Some(p) = b.slots.iter().position(Slot::is_empty) {
                b.slots[p] = slot;
                return;
            }
            if b.next != 0 {
                loc = Loc::Overflow(b.next);
                continue;
            }
            break;
        }
        let n = self.alloc_overflow();
        self.overflow[n - 1].slots[0] = slot;
        self.bucket_mut(loc).next = n;
    }

    fn bucket_mut(&mut self, loc: Loc) -> &mut MemBucket {
        match loc {
            Loc::Primary(i) => &mut self.buckets[i],
            Loc::Overflow(i) => &mut self.overflow[i - 1],
        }
    }

    fn alloc_overflow(&mut self) -> usize {
        match self.free_overflow.pop() {
            Some(i) => {
                self.overflow[i - 1] = MemBucket::default();
                i
            }
            None => {
                self.overflow.push(MemBucket::default());
                self.overflow.len()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikey;

    /// Finds the staged user key by walking the chain at its bucket.
    fn lookup(m: &MemState, hash: u32, ukey: &[u8]) -> Option<Vec<u8>> {
        let mut b = *m.bucket(m.bucket_index(hash));
        loop {
            for sl in b.slots.iter() {
                if sl.is_empty() {
                    return None;
                }
                if sl.hash == hash {
                    let (ik, value) = m.read_key_value(sl).ok()?;
                    let parsed = ikey::parse(ik).ok()?;
                    if parsed.ukey == ukey {
                        return Some(value.to_vec());
                    }
                }
            }
            if b.next == 0 {
                return None;
            }
            b = *m.overflow_bucket(b.next);
        }
    }

    fn stage(m: &mut MemState, hash: u32, ukey: &[u8], value: &[u8]) {
        let seq = m.seq + 1;
        let ik = ikey::encode(ukey, seq, false, 0);
        m.put(hash, &ik, value, 0).expect("put failed");
        m.seq = seq;
    }

    #[test]
    fn test_put_and_read() {
        let mem = MemDb::with_buckets(4);
        let mut m = mem.lock();

        stage(&mut m, 11, b"alpha", b"one");
        stage(&mut m, 12, b"beta", b"two");

        assert_eq!(m.count, 2);
        assert_eq!(m.seq, 2);
        assert_eq!(lookup(&m, 11, b"alpha"), Some(b"one".to_vec()));
        assert_eq!(lookup(&m, 12, b"beta"), Some(b"two".to_vec()));
        assert_eq!(lookup(&m, 13, b"gamma"), None);
    }

    #[test]
    fn test_chain_overflow() {
        let mem = MemDb::with_buckets(2);
        let mut m = mem.lock();

        // All hashes land in bucket 0 and saturate it past one bucket.
        let n = (SLOTS_PER_BUCKET * 2 + 3) as u32;
        for i in 0..n {
            let key = format!("k{i}");
            stage(&mut m, i * 4, key.as_bytes(), b"v");
        }

        assert_eq!(m.count, u64::from(n));
        assert!(m.bucket(0).next != 0, "expected an overflow bucket");
        for i in 0..n {
            let key = format!("k{i}");
            assert!(
                lookup(&m, i * 4, key.as_bytes()).is_some(),
                "missing staged key {key}"
            );
        }
    }

    #[test]
    fn test_split_redistributes() {
        let mem = MemDb::with_buckets(2);
        let mut m = mem.lock();

        let n = 64u32;
        for i in 0..n {
            let key = format!("key_{i:03}");
            stage(&mut m, crate::hash::key_hash(key.as_bytes()), key.as_bytes(), b"v");
        }

        let before = m.n_buckets();
        m.split();
        m.split();
        assert_eq!(m.n_buckets(), before + 2);
        assert_eq!(m.count, u64::from(n), "split must not change the count");

        for i in 0..n {
            let key = format!("key_{i:03}");
            let hash = crate::hash::key_hash(key.as_bytes());
            assert!(
                lookup(&m, hash, key.as_bytes()).is_some(),
                "key {key} lost by split"
            );
        }
    }

    #[test]
    fn test_split_advances_level() {
        let mem = MemDb::with_buckets(2);
        let mut m = mem.lock();

        // Two splits exhaust level 0 of a 2-bucket table.
        m.split();
        m.split();
        assert_eq!(m.n_buckets(), 4);
        assert_eq!(m.level, 1);
        assert_eq!(m.split_idx, 0);

        for hash in 0..16u32 {
            assert!(m.bucket_index(hash) < m.n_buckets());
        }
    }

    #[test]
    fn test_expired_entry_read() {
        let mem = MemDb::new();
        let mut m = mem.lock();

        let ik = ikey::encode(b"gone", 1, false, 1);
        m.put(9, &ik, b"v", 1).expect("put failed");

        let slot = m.bucket(m.bucket_index(9)).slots[0];
        assert_eq!(m.read_key_value(&slot).unwrap_err(), Error::KeyExpired);
    }

    #[test]
    fn test_refcount() {
        let mem = MemDb::new();
        assert_eq!(mem.getref(), 0);
        mem.incref();
        mem.incref();
        assert_eq!(mem.getref(), 2);
        mem.decref();
        assert_eq!(mem.getref(), 1);
    }

    #[test]
    fn test_load_factor() {
        let mem = MemDb::with_buckets(2);
        let mut m = mem.lock();
        assert_eq!(m.load(), 0.0);

        stage(&mut m, 1, b"a", b"v");
        assert!(m.load() > 0.0);
    }
}
