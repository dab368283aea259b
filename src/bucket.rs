use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::Error;

/// Number of slots per bucket.
pub const SLOTS_PER_BUCKET: usize = 22;

/// Encoded slot width: u32 hash, u16 key size, u32 value size,
/// u32 expiry, u64 payload offset.
pub const SLOT_SIZE: usize = 22;

/// On-disk bucket width: the slot array plus a u64 overflow link,
/// padded to a power of two.
pub const BUCKET_SIZE: usize = 512;

/// One hash-table entry. A slot with `kv_offset == 0` is empty; both
/// the data file and the memdb arena reserve offset zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Slot {
    pub hash: u32,
    pub key_size: u16,
    pub value_size: u32,
    pub expires_at: u32,
    pub kv_offset: u64,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.kv_offset == 0
    }

    /// Total payload length, key plus value.
    pub fn kv_size(&self) -> u32 {
        u32::from(self.key_size) + self.value_size
    }
}

/// A fixed-size group of slots chained to an optional overflow bucket.
/// `next` is a file offset in the persistent index (0 = end of chain);
/// the memdb reuses the same layout with arena indices.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bucket {
    pub slots: [Slot; SLOTS_PER_BUCKET],
    pub next: u64,
}

impl Bucket {
    /// Removes the slot at `i`, shifting later slots down so occupied
    /// slots stay contiguous. Lookups stop at the first empty slot, so
    /// a hole in the middle would orphan everything behind it.
    pub fn remove(&mut self, i: usize) {
        self.slots.copy_within(i + 1.., i);
        self.slots[SLOTS_PER_BUCKET - 1] = Slot::default();
    }

    pub fn encode(&self) -> [u8; BUCKET_SIZE] {
        let mut buf = [0u8; BUCKET_SIZE];
        for (i, slot) in self.slots.iter().enumerate() {
            let b = &mut buf[i * SLOT_SIZE..(i + 1) * SLOT_SIZE];
            LittleEndian::write_u32(&mut b[0..4], slot.hash);
            LittleEndian::write_u16(&mut b[4..6], slot.key_size);
            LittleEndian::write_u32(&mut b[6..10], slot.value_size);
            LittleEndian::write_u32(&mut b[10..14], slot.expires_at);
            LittleEndian::write_u64(&mut b[14..22], slot.kv_offset);
        }
        let off = SLOTS_PER_BUCKET * SLOT_SIZE;
        LittleEndian::write_u64(&mut buf[off..off + 8], self.next);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BUCKET_SIZE {
            return Err(Error::Corrupted(format!(
                "short bucket: {} bytes",
                buf.len()
            )));
        }
        let mut bucket = Bucket::default();
        for (i, slot) in bucket.slots.iter_mut().enumerate() {
            let b = &buf[i * SLOT_SIZE..(i + 1) * SLOT_SIZE];
            slot.hash = LittleEndian::read_u32(&b[0..4]);
            slot.key_size = LittleEndian::read_u16(&b[4..6]);
            slot.value_size = LittleEndian::read_u32(&b[6..10]);
            slot.expires_at = LittleEndian::read_u32(&b[10..14]);
            slot.kv_offset = LittleEndian::read_u64(&b[14..22]);
        }
        let off = SLOTS_PER_BUCKET * SLOT_SIZE;
        bucket.next = LittleEndian::read_u64(&buf[off..off + 8]);
        Ok(bucket)
    }
}

/// A bucket paired with its location in the index file.
#[derive(Debug, Clone, Copy)]
pub struct BucketHandle {
    pub bucket: Bucket,
    pub offset: u64,
}
