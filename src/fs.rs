use std::fs::{File, OpenOptions};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::Result;

/// A random-access file that tracks its own logical size.
///
/// The index and data files both grow by appending fixed- or
/// variable-sized regions and rewrite earlier regions in place, so the
/// current end offset is consulted on every allocation. Tracking it
/// here avoids a metadata round trip per write.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    size: u64,
}

impl DbFile {
    /// Opens the file at `path`, creating it if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Truncates the file to `size` bytes.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        self.size = size;
        Ok(())
    }

    /// Grows the file by `n` bytes and returns the offset of the new region.
    pub fn extend(&mut self, n: u32) -> Result<u64> {
        let off = self.size;
        self.file.set_len(off + u64::from(n))?;
        self.size += u64::from(n);
        Ok(off)
    }

    /// Writes `data` at the current end of the file and returns its offset.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let off = self.size;
        self.file.write_all_at(data, off)?;
        self.size += data.len() as u64;
        Ok(off)
    }

    /// Writes `data` in place at `off`. Does not move the end of the file.
    pub fn write_at(&self, data: &[u8], off: u64) -> Result<()> {
        self.file.write_all_at(data, off)?;
        Ok(())
    }

    /// Fills `buf` from the file starting at `off`.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<()> {
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    /// Flushes file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
