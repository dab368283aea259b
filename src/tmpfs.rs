//! Scratch paths for tests.
//!
//! Every helper hands out a path under one shared base directory,
//! disambiguated by process ID, a process-wide counter and a timestamp.
//! The counter is what makes paths unique when a test creates several
//! in the same clock tick.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const BASE_DIR: &str = "/tmp/kilndb_tests";

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn unique_path(prefix: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(BASE_DIR)?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let name = format!("{prefix}_{}_{id}_{nanos}", std::process::id());
    Ok(PathBuf::from(BASE_DIR).join(name))
}

/// A scratch directory removed with its contents on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let path = unique_path("dir")?;
        fs::create_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A reserved scratch-file path. The file itself is created by whoever
/// opens the path; whatever ends up there is removed on drop.
pub struct NamedTempFile {
    path: PathBuf,
}

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            path: unique_path("file")?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
