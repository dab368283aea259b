//! Persistent bucket table.
//!
//! A fixed array of primary buckets follows the header; overflow
//! buckets are appended at the end of the file and linked through each
//! bucket's `next` offset. The primary bucket count never changes after
//! creation — growth happens only through overflow chains, and the
//! memdb absorbs load spikes before they reach this file.

use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

use crate::bucket::{Bucket, BucketHandle, BUCKET_SIZE};
use crate::error::Result;
use crate::fs::DbFile;
use crate::Error;

const MAGIC: &[u8; 8] = b"KILNDB\x00I";
const VERSION: u32 = 1;

pub const INDEX_HEADER_SIZE: u64 = 512;

#[derive(Debug)]
pub struct IndexFile {
    file: DbFile,
    n_buckets: u32,
}

impl IndexFile {
    /// Opens the bucket table, creating it with `initial_buckets`
    /// primary buckets when the file is new. An existing file keeps the
    /// bucket count it was created with.
    pub fn open<P: AsRef<Path>>(path: P, initial_buckets: u32) -> Result<Self> {
        let mut file = DbFile::open(path)?;
        let n_buckets;
        if file.size() == 0 {
            n_buckets = initial_buckets.max(1);
            let mut header = [0u8; INDEX_HEADER_SIZE as usize];
            header[..8].copy_from_slice(MAGIC);
            LittleEndian::write_u32(&mut header[8..12], VERSION);
            LittleEndian::write_u32(&mut header[12..16], n_buckets);
            file.append(&header)?;
            // Fresh buckets are all-zero, which decodes as empty slots.
            file.extend(n_buckets * BUCKET_SIZE as u32)?;
        } else {
            if file.size() < INDEX_HEADER_SIZE {
                return Err(Error::InvalidHeader);
            }
            let mut header = [0u8; 16];
            file.read_at(&mut header, 0)?;
            if &header[..8] != MAGIC {
                return Err(Error::InvalidMagic);
            }
            let version = LittleEndian::read_u32(&header[8..12]);
            if version != VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
            n_buckets = LittleEndian::read_u32(&header[12..16]);
            let min_size = INDEX_HEADER_SIZE + u64::from(n_buckets) * BUCKET_SIZE as u64;
            if n_buckets == 0 || file.size() < min_size {
                return Err(Error::Corrupted(format!(
                    "index file truncated: {} buckets, {} bytes",
                    n_buckets,
                    file.size()
                )));
            }
        }
        Ok(Self { file, n_buckets })
    }

    /// Number of primary buckets.
    pub fn n_buckets(&self) -> u32 {
        self.n_buckets
    }

    /// Total buckets in the file, primary and overflow.
    pub fn bucket_count(&self) -> u64 {
        (self.file.size() - INDEX_HEADER_SIZE) / BUCKET_SIZE as u64
    }

    /// Primary bucket index for a key hash.
    pub fn bucket_index(&self, hash: u32) -> u32 {
        hash % self.n_buckets
    }

    /// File offset of the bucket at `idx`, primary or overflow.
    pub fn bucket_offset(&self, idx: u64) -> u64 {
        INDEX_HEADER_SIZE + idx * BUCKET_SIZE as u64
    }

    pub fn read_bucket(&self, offset: u64) -> Result<Bucket> {
        let mut buf = [0u8; BUCKET_SIZE];
        self.file.read_at(&mut buf, offset)?;
        Bucket::decode(&buf)
    }

    pub fn write_bucket(&mut self, bucket: &Bucket, offset: u64) -> Result<()> {
        self.file.write_at(&bucket.encode(), offset)
    }

    /// Allocates an empty overflow bucket at the end of the file. The
    /// caller links it into a chain and persists both buckets.
    pub fn create_overflow_bucket(&mut self) -> Result<BucketHandle> {
        let offset = self.file.extend(BUCKET_SIZE as u32)?;
        Ok(BucketHandle {
            bucket: Bucket::default(),
            offset,
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}
