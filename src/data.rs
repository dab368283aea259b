//! Data region: append-and-free payload storage.
//!
//! Payloads are `key || value` blobs written past a fixed header. The
//! region never moves live data; deleted or superseded spans go on an
//! in-memory free list and later writes are placed into the first span
//! that fits. The free list is persisted in the meta snapshot, not in
//! the data file itself.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bucket::Slot;
use crate::error::Result;
use crate::fs::DbFile;
use crate::Error;

const MAGIC: &[u8; 8] = b"KILNDB\x00D";
const VERSION: u32 = 1;

/// Header region reserved at the front of the file. Keeping it non-zero
/// sized means a payload offset of 0 can mark an empty slot.
pub const DATA_HEADER_SIZE: u64 = 512;

/// Seconds since the epoch, clamped into the u32 expiry domain.
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs().min(u64::from(u32::MAX)) as u32)
}

/// A reclaimable span of the data region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreeBlock {
    pub offset: u64,
    pub size: u32,
}

/// First-fit free list over reclaimed spans.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeList {
    blocks: Vec<FreeBlock>,
}

impl FreeList {
    /// Records a reclaimable span. Zero-sized spans are dropped.
    pub fn free(&mut self, offset: u64, size: u32) {
        if size == 0 {
            return;
        }
        self.blocks.push(FreeBlock { offset, size });
    }

    /// Takes `size` bytes from the first span that fits, splitting the
    /// remainder back onto the list.
    pub fn allocate(&mut self, size: u32) -> Option<u64> {
        let i = self.blocks.iter().position(|b| b.size >= size)?;
        let block = self.blocks[i];
        if block.size == size {
            self.blocks.swap_remove(i);
        } else {
            self.blocks[i] = FreeBlock {
                offset: block.offset + u64::from(size),
                size: block.size - size,
            };
        }
        Some(block.offset)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// The payload file plus its free list.
#[derive(Debug)]
pub struct DataFile {
    file: DbFile,
    pub(crate) free: FreeList,
}

impl DataFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = DbFile::open(path)?;
        if file.size() == 0 {
            let mut header = [0u8; DATA_HEADER_SIZE as usize];
            header[..8].copy_from_slice(MAGIC);
            LittleEndian::write_u32(&mut header[8..12], VERSION);
            file.append(&header)?;
        } else {
            if file.size() < DATA_HEADER_SIZE {
                return Err(Error::InvalidHeader);
            }
            let mut header = [0u8; 12];
            file.read_at(&mut header, 0)?;
            if &header[..8] != MAGIC {
                return Err(Error::InvalidMagic);
            }
            let version = LittleEndian::read_u32(&header[8..12]);
            if version != VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
        }
        Ok(Self {
            file,
            free: FreeList::default(),
        })
    }

    /// Writes `key || value`, reusing a freed span when one fits, and
    /// returns the payload offset.
    pub fn write_key_value(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut buf = Vec::with_capacity(key.len() + value.len());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);

        match self.free.allocate(buf.len() as u32) {
            Some(off) => {
                self.file.write_at(&buf, off)?;
                Ok(off)
            }
            None => self.file.append(&buf),
        }
    }

    /// Reads the key stored for `slot`. Used for byte-wise comparison
    /// during chain walks, so expiry is not consulted.
    pub fn read_key(&self, slot: &Slot) -> Result<Vec<u8>> {
        let mut key = vec![0u8; usize::from(slot.key_size)];
        self.file.read_at(&mut key, slot.kv_offset)?;
        Ok(key)
    }

    /// Reads the `(key, value)` payload for `slot`, failing with
    /// [`Error::KeyExpired`] once the entry's TTL has lapsed.
    pub fn read_key_value(&self, slot: &Slot) -> Result<(Vec<u8>, Vec<u8>)> {
        if slot.expires_at != 0 && slot.expires_at <= now_secs() {
            return Err(Error::KeyExpired);
        }
        let mut buf = vec![0u8; slot.kv_size() as usize];
        self.file.read_at(&mut buf, slot.kv_offset)?;
        let value = buf.split_off(usize::from(slot.key_size));
        Ok((buf, value))
    }

    /// Marks the span at `offset` reclaimable.
    pub fn free(&mut self, size: u32, offset: u64) {
        self.free.free(offset, size);
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::key_hash;
    use crate::tmpfs::NamedTempFile;

    fn slot_for(hash: u32, key: &[u8], value: &[u8], expires_at: u32, off: u64) -> Slot {
        Slot {
            hash,
            key_size: key.len() as u16,
            value_size: value.len() as u32,
            expires_at,
            kv_offset: off,
        }
    }

    #[test]
    fn test_write_and_read_key_value() {
        let tmp = NamedTempFile::new().expect("Failed to create temp file");
        let mut data = DataFile::open(tmp.path()).expect("Failed to open data file");

        let off = data
            .write_key_value(b"key1", b"value1")
            .expect("write failed");
        assert!(off >= DATA_HEADER_SIZE, "payload must land past the header");

        let slot = slot_for(key_hash(b"key1"), b"key1", b"value1", 0, off);
        let (key, value) = data.read_key_value(&slot).expect("read failed");
        assert_eq!(key, b"key1");
        assert_eq!(value, b"value1");
        assert_eq!(data.read_key(&slot).expect("read_key failed"), b"key1");
    }

    #[test]
    fn test_expired_read_fails() {
        let tmp = NamedTempFile::new().expect("Failed to create temp file");
        let mut data = DataFile::open(tmp.path()).expect("Failed to open data file");

        let off = data.write_key_value(b"e", b"v").expect("write failed");
        let slot = slot_for(key_hash(b"e"), b"e", b"v", now_secs() - 1, off);
        assert_eq!(data.read_key_value(&slot), Err(Error::KeyExpired));

        // read_key ignores expiry so chain walks can still match the slot.
        assert_eq!(data.read_key(&slot).expect("read_key failed"), b"e");
    }

    #[test]
    fn test_freed_span_is_reused() {
        let tmp = NamedTempFile::new().expect("Failed to create temp file");
        let mut data = DataFile::open(tmp.path()).expect("Failed to open data file");

        let off1 = data.write_key_value(b"aaaa", b"bbbb").expect("write failed");
        data.free(8, off1);

        let off2 = data.write_key_value(b"cccc", b"dddd").expect("write failed");
        assert_eq!(off1, off2, "exact-fit span should be reused");
    }

    #[test]
    fn test_free_list_split() {
        let mut free = FreeList::default();
        free.free(100, 10);

        assert_eq!(free.allocate(4), Some(100));
        assert_eq!(free.allocate(6), Some(104));
        assert_eq!(free.allocate(1), None);
        assert!(free.is_empty());
    }

    #[test]
    fn test_free_list_skips_small_blocks() {
        let mut free = FreeList::default();
        free.free(100, 4);
        free.free(200, 16);

        assert_eq!(free.allocate(8), Some(200));
        assert_eq!(free.len(), 2, "remainder plus the untouched block");
    }

    #[test]
    fn test_reopen_validates_magic() {
        let tmp = NamedTempFile::new().expect("Failed to create temp file");
        {
            DataFile::open(tmp.path()).expect("Failed to create data file");
        }
        // Corrupt the magic and reopen.
        {
            let file = DbFile::open(tmp.path()).expect("reopen failed");
            file.write_at(b"BADMAGIC", 0).expect("write failed");
        }
        assert!(matches!(DataFile::open(tmp.path()), Err(Error::InvalidMagic)));
    }
}
