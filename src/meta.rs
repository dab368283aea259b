//! Meta snapshot: the restart state commit leaves behind.
//!
//! A small bincode record holding the live-key count, the data-region
//! free list and the presence filter bits. Written on sync and close,
//! loaded on open. When the snapshot is missing or unreadable the store
//! rebuilds count and filter by scanning the bucket table; only the
//! free-list knowledge is lost in that case.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::FreeList;
use crate::error::Result;
use crate::Error;

const MAGIC: &[u8; 8] = b"KILNDB\x00M";
const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    magic: [u8; 8],
    version: u32,
    pub count: u64,
    pub free: FreeList,
    pub filter_bits: Vec<u8>,
}

impl Meta {
    pub fn new(count: u64, free: FreeList, filter_bits: Vec<u8>) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            count,
            free,
            filter_bits,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidMagic);
        }
        if self.version != VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    /// Writes the snapshot atomically: into a sibling temp file first,
    /// then renamed over the old snapshot.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("meta.tmp");
        let encoded = bincode::serialize(self)?;
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads and validates a snapshot; `Ok(None)` when none exists.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path.as_ref()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: Meta = bincode::deserialize(&bytes)?;
        meta.validate()?;
        Ok(Some(meta))
    }
}
