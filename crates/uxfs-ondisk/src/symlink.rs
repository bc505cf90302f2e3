//! Remote symlink block header (V5 only).
//!
//! V4 symlink blocks hold the target bytes raw; V5 blocks carry a 56-byte
//! self-describing header ahead of the payload.

use crate::cksum;
use uuid::Uuid;
use uxfs_types::{read_be_u32, write_be_u32, write_be_u64, ParseError};

pub const SYMLINK_MAGIC: u32 = 0x5853_4C4D; // "XSLM"
pub const SYMLINK_HDR_SIZE: usize = 56;
pub const SYMLINK_CRC_OFF: usize = 12;

/// Decoded remote-symlink block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymlinkHdr {
    /// Byte offset of this block's payload within the target.
    pub offset: u32,
    /// Payload bytes stored in this block.
    pub bytes: u32,
}

impl SymlinkHdr {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(buf, 0)?;
        if magic != SYMLINK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SYMLINK_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            offset: read_be_u32(buf, 4)?,
            bytes: read_be_u32(buf, 8)?,
        })
    }

    pub fn encode(self, buf: &mut [u8], blkno: u64, owner: u64, uuid: &Uuid) {
        write_be_u32(buf, 0, SYMLINK_MAGIC);
        write_be_u32(buf, 4, self.offset);
        write_be_u32(buf, 8, self.bytes);
        buf[16..32].copy_from_slice(uuid.as_bytes());
        write_be_u64(buf, 32, owner);
        write_be_u64(buf, 40, blkno);
        write_be_u64(buf, 48, 0); // lsn
    }
}

/// Verify a V5 remote symlink block.
#[must_use]
pub fn verify_symlink_crc(buf: &[u8]) -> bool {
    cksum::verify_cksum(buf, SYMLINK_CRC_OFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_crc() {
        let hdr = SymlinkHdr {
            offset: 0,
            bytes: 100,
        };
        let mut buf = vec![0_u8; 4096];
        hdr.encode(&mut buf, 88, 131, &Uuid::from_u128(6));
        buf[SYMLINK_HDR_SIZE..SYMLINK_HDR_SIZE + 100].fill(b'x');
        cksum::update_cksum(&mut buf, SYMLINK_CRC_OFF);
        assert!(verify_symlink_crc(&buf));
        assert_eq!(SymlinkHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn bad_magic() {
        let buf = vec![0_u8; 64];
        assert!(SymlinkHdr::decode(&buf).is_err());
    }
}
