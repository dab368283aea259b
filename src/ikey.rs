use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::Error;

/// Maximum sequence number. The low 8 bits of the packed word carry the
/// delete flag, leaving 56 bits for the sequence.
pub const MAX_SEQ: u64 = (1 << 56) - 1;

/// Length of the metadata tail appended to the user key.
pub const TAIL_LEN: usize = 12;

/// A decoded internal key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedKey<'a> {
    pub ukey: &'a [u8],
    pub seq: u64,
    pub deleted: bool,
    pub expires_at: u32,
}

/// Packs a user key with its sequence number, delete flag and expiry:
/// `ukey || u64(seq << 8 | dflag) || u32(expires_at)`, little-endian.
///
/// Panics if `seq` exceeds [`MAX_SEQ`]; sequence numbers are assigned
/// internally, so overflow is a programmer error.
pub fn encode(ukey: &[u8], seq: u64, deleted: bool, expires_at: u32) -> Vec<u8> {
    assert!(seq <= MAX_SEQ, "sequence number out of range");

    let mut ik = Vec::with_capacity(ukey.len() + TAIL_LEN);
    ik.extend_from_slice(ukey);

    let mut tail = [0u8; TAIL_LEN];
    LittleEndian::write_u64(&mut tail[..8], (seq << 8) | u64::from(deleted));
    LittleEndian::write_u32(&mut tail[8..], expires_at);
    ik.extend_from_slice(&tail);
    ik
}

/// Recovers `(ukey, seq, deleted, expires_at)` from an internal key.
pub fn parse(ik: &[u8]) -> Result<ParsedKey<'_>> {
    if ik.len() < TAIL_LEN {
        return Err(Error::InvalidInternalKey);
    }
    let split = ik.len() - TAIL_LEN;
    let num = LittleEndian::read_u64(&ik[split..split + 8]);
    let expires_at = LittleEndian::read_u32(&ik[split + 8..]);
    Ok(ParsedKey {
        ukey: &ik[..split],
        seq: num >> 8,
        deleted: num & 0xff != 0,
        expires_at,
    })
}
