use std::path::PathBuf;

/// Hard ceiling on key length. Memdb slots record the internal key
/// length (user key plus a 12-byte tail) in a u16.
pub const MAX_KEY_LENGTH: usize = u16::MAX as usize - 12;

/// Hard ceiling on value length; slot value sizes are u32.
pub const MAX_VALUE_LENGTH: usize = 1 << 30;

/// Configuration for a kilndb store
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Fsync index and data files at the end of every commit (default: false)
    pub sync_writes: bool,

    /// Number of primary buckets in the persistent index (default: 256)
    pub initial_buckets: u32,

    /// Maximum accepted key length (default: 65523)
    pub max_key_length: usize,

    /// Maximum accepted value length (default: 1GiB)
    pub max_value_length: usize,

    /// Maximum number of live keys before inserts fail (default: u32::MAX)
    pub max_keys: u64,

    /// Memdb occupancy ratio that triggers a split (default: 0.7)
    pub load_factor: f64,

    /// Size of the presence filter in bits (default: 1MiB of bits)
    pub filter_bits: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./kilndb"),
            sync_writes: false,
            initial_buckets: 256,
            max_key_length: MAX_KEY_LENGTH,
            max_value_length: MAX_VALUE_LENGTH,
            max_keys: u32::MAX as u64,
            load_factor: 0.7,
            filter_bits: 1 << 23,
        }
    }
}

impl Options {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Fsync after every commit
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Set the number of primary index buckets
    pub fn initial_buckets(mut self, n: u32) -> Self {
        self.initial_buckets = n.max(1);
        self
    }

    /// Set the maximum key length, capped at [`MAX_KEY_LENGTH`]
    pub fn max_key_length(mut self, len: usize) -> Self {
        self.max_key_length = len.min(MAX_KEY_LENGTH);
        self
    }

    /// Set the maximum value length, capped at [`MAX_VALUE_LENGTH`]
    pub fn max_value_length(mut self, len: usize) -> Self {
        self.max_value_length = len.min(MAX_VALUE_LENGTH);
        self
    }

    /// Set the maximum number of live keys
    pub fn max_keys(mut self, n: u64) -> Self {
        self.max_keys = n;
        self
    }

    /// Set the memdb split load factor
    pub fn load_factor(mut self, ratio: f64) -> Self {
        self.load_factor = ratio;
        self
    }

    /// Set the presence filter size in bits
    pub fn filter_bits(mut self, bits: usize) -> Self {
        self.filter_bits = bits.max(64);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let opts = Options::default();
        assert_eq!(opts.dir, PathBuf::from("./kilndb"));
        assert!(!opts.sync_writes);
        assert_eq!(opts.initial_buckets, 256);
        assert_eq!(opts.max_key_length, MAX_KEY_LENGTH);
        assert_eq!(opts.load_factor, 0.7);
    }

    #[test]
    fn test_config_builder() {
        let opts = Options::new("/tmp/test")
            .sync_writes(true)
            .initial_buckets(16)
            .max_keys(1000)
            .load_factor(0.5);

        assert_eq!(opts.dir, PathBuf::from("/tmp/test"));
        assert!(opts.sync_writes);
        assert_eq!(opts.initial_buckets, 16);
        assert_eq!(opts.max_keys, 1000);
        assert_eq!(opts.load_factor, 0.5);
    }

    #[test]
    fn test_key_length_clamped() {
        let opts = Options::default().max_key_length(usize::MAX);
        assert_eq!(opts.max_key_length, MAX_KEY_LENGTH);
    }
}
