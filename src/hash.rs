use crc::{Crc, CRC_32_ISCSI};

/// CRC-32/iSCSI (Castagnoli) instance shared by the key hash.
pub const KEY_CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// 32-bit hash of a user key.
///
/// The same hash addresses the memdb buckets, the persistent bucket
/// table, and the presence filter, and is the collapse key for batch
/// deduplication.
pub fn key_hash(key: &[u8]) -> u32 {
    KEY_CRC32.checksum(key)
}
