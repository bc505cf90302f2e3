//! B+tree block headers and record codecs.
//!
//! Short-pointer trees (free space, inodes) address blocks within one AG;
//! long-pointer trees (the bmap fork) use segmented fsblock numbers. V5
//! headers append blkno/lsn/uuid/owner/crc to the V4 layout.

use crate::cksum;
use uuid::Uuid;
use uxfs_types::{
    read_be_u16, read_be_u32, read_be_u64, read_u8, write_be_u16, write_be_u32, write_be_u64,
    ParseError, NULL_AGBLOCK, NULL_FSBLOCK,
};

// Short-form magics.
pub const ABTB_MAGIC: u32 = 0x4142_5442; // "ABTB" — free space by block
pub const ABTB_CRC_MAGIC: u32 = 0x4142_3342; // "AB3B"
pub const ABTC_MAGIC: u32 = 0x4142_5443; // "ABTC" — free space by size
pub const ABTC_CRC_MAGIC: u32 = 0x4142_3343; // "AB3C"
pub const IBT_MAGIC: u32 = 0x4941_4254; // "IABT" — inode btree
pub const IBT_CRC_MAGIC: u32 = 0x4941_4233; // "IAB3"

// Long-form magics (bmap btree).
pub const BMAP_MAGIC: u32 = 0x424D_4150; // "BMAP"
pub const BMAP_CRC_MAGIC: u32 = 0x424D_4133; // "BMA3"

pub const SHORT_BTREE_HDR_V4: usize = 16;
pub const SHORT_BTREE_HDR_V5: usize = 56;
pub const SHORT_BTREE_CRC_OFF: usize = 52;

pub const LONG_BTREE_HDR_V4: usize = 24;
pub const LONG_BTREE_HDR_V5: usize = 72;
pub const LONG_BTREE_CRC_OFF: usize = 64;

/// Header of a short-pointer btree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortBtreeHdr {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u32,
    pub rightsib: u32,
}

impl ShortBtreeHdr {
    #[must_use]
    pub fn is_v5(magic: u32) -> bool {
        matches!(magic, ABTB_CRC_MAGIC | ABTC_CRC_MAGIC | IBT_CRC_MAGIC)
    }

    #[must_use]
    pub fn hdr_size(magic: u32) -> usize {
        if Self::is_v5(magic) {
            SHORT_BTREE_HDR_V5
        } else {
            SHORT_BTREE_HDR_V4
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_be_u32(buf, 0)?,
            level: read_be_u16(buf, 4)?,
            numrecs: read_be_u16(buf, 6)?,
            leftsib: read_be_u32(buf, 8)?,
            rightsib: read_be_u32(buf, 12)?,
        })
    }

    pub fn encode(self, buf: &mut [u8], blkno: u64, owner: u32, uuid: &Uuid) {
        write_be_u32(buf, 0, self.magic);
        write_be_u16(buf, 4, self.level);
        write_be_u16(buf, 6, self.numrecs);
        write_be_u32(buf, 8, self.leftsib);
        write_be_u32(buf, 12, self.rightsib);
        if Self::is_v5(self.magic) {
            write_be_u64(buf, 16, blkno);
            write_be_u64(buf, 24, 0); // lsn
            buf[32..48].copy_from_slice(uuid.as_bytes());
            write_be_u32(buf, 48, owner);
        }
    }

    /// Fresh empty leaf/root block header.
    #[must_use]
    pub fn new_leaf(magic: u32) -> Self {
        Self {
            magic,
            level: 0,
            numrecs: 0,
            leftsib: NULL_AGBLOCK,
            rightsib: NULL_AGBLOCK,
        }
    }
}

/// Header of a long-pointer (bmap) btree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongBtreeHdr {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u64,
    pub rightsib: u64,
}

impl LongBtreeHdr {
    #[must_use]
    pub fn is_v5(magic: u32) -> bool {
        magic == BMAP_CRC_MAGIC
    }

    #[must_use]
    pub fn hdr_size(magic: u32) -> usize {
        if Self::is_v5(magic) {
            LONG_BTREE_HDR_V5
        } else {
            LONG_BTREE_HDR_V4
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_be_u32(buf, 0)?,
            level: read_be_u16(buf, 4)?,
            numrecs: read_be_u16(buf, 6)?,
            leftsib: read_be_u64(buf, 8)?,
            rightsib: read_be_u64(buf, 16)?,
        })
    }

    pub fn encode(self, buf: &mut [u8], blkno: u64, owner: u64, uuid: &Uuid) {
        write_be_u32(buf, 0, self.magic);
        write_be_u16(buf, 4, self.level);
        write_be_u16(buf, 6, self.numrecs);
        write_be_u64(buf, 8, self.leftsib);
        write_be_u64(buf, 16, self.rightsib);
        if Self::is_v5(self.magic) {
            write_be_u64(buf, 24, blkno);
            write_be_u64(buf, 32, 0); // lsn
            buf[40..56].copy_from_slice(uuid.as_bytes());
            write_be_u64(buf, 56, owner);
        }
    }

    #[must_use]
    pub fn new_leaf(magic: u32) -> Self {
        Self {
            magic,
            level: 0,
            numrecs: 0,
            leftsib: NULL_FSBLOCK,
            rightsib: NULL_FSBLOCK,
        }
    }
}

// ── Free-space records ──────────────────────────────────────────────────────

/// Free-space record: `(startblock, blockcount)` within one AG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRec {
    pub startblock: u32,
    pub blockcount: u32,
}

impl AllocRec {
    pub const SIZE: usize = 8;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            startblock: read_be_u32(buf, offset)?,
            blockcount: read_be_u32(buf, offset + 4)?,
        })
    }

    pub fn encode(self, buf: &mut [u8], offset: usize) {
        write_be_u32(buf, offset, self.startblock);
        write_be_u32(buf, offset + 4, self.blockcount);
    }

    /// Maximum leaf records for a block of `block_size` bytes.
    #[must_use]
    pub fn maxrecs(block_size: usize, v5: bool) -> usize {
        (block_size - ShortBtreeHdr::hdr_size(if v5 { ABTB_CRC_MAGIC } else { ABTB_MAGIC }))
            / Self::SIZE
    }
}

// ── Inode btree records ─────────────────────────────────────────────────────

/// Inodes per allocation chunk (fixed by the format).
pub const INODES_PER_CHUNK: u32 = 64;

/// Inode btree record: a 64-inode chunk and its free mask.
///
/// The sparse-inode layout stores `(holemask, count, freecount)` in place of
/// the plain 32-bit freecount; both are handled, full chunks are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InobtRec {
    pub startino: u32,
    pub freecount: u32,
    /// Bit i set = inode i of the chunk is free.
    pub free: u64,
}

impl InobtRec {
    pub const SIZE: usize = 16;

    pub fn decode(buf: &[u8], offset: usize, sparse: bool) -> Result<Self, ParseError> {
        let startino = read_be_u32(buf, offset)?;
        let freecount = if sparse {
            // holemask(u16) count(u8) freecount(u8)
            u32::from(read_u8(buf, offset + 7)?)
        } else {
            read_be_u32(buf, offset + 4)?
        };
        Ok(Self {
            startino,
            freecount,
            free: read_be_u64(buf, offset + 8)?,
        })
    }

    pub fn encode(self, buf: &mut [u8], offset: usize, sparse: bool) {
        write_be_u32(buf, offset, self.startino);
        if sparse {
            // holemask = 0 (full chunk), count = 64, freecount as u8.
            write_be_u16(buf, offset + 4, 0);
            buf[offset + 6] = INODES_PER_CHUNK as u8;
            buf[offset + 7] = self.freecount as u8;
        } else {
            write_be_u32(buf, offset + 4, self.freecount);
        }
        write_be_u64(buf, offset + 8, self.free);
    }

    /// Maximum leaf records for a block of `block_size` bytes.
    #[must_use]
    pub fn maxrecs(block_size: usize, v5: bool) -> usize {
        (block_size - ShortBtreeHdr::hdr_size(if v5 { IBT_CRC_MAGIC } else { IBT_MAGIC }))
            / Self::SIZE
    }

    /// Whether chunk-relative inode `idx` is free.
    #[must_use]
    pub fn is_free(&self, idx: u32) -> bool {
        self.free & (1 << idx) != 0
    }
}

/// Verify a short btree block's CRC; V4 magics always pass.
#[must_use]
pub fn verify_short_crc(buf: &[u8]) -> bool {
    match read_be_u32(buf, 0) {
        Ok(m) if ShortBtreeHdr::is_v5(m) => cksum::verify_cksum(buf, SHORT_BTREE_CRC_OFF),
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Verify a long btree block's CRC; V4 magics always pass.
#[must_use]
pub fn verify_long_crc(buf: &[u8]) -> bool {
    match read_be_u32(buf, 0) {
        Ok(m) if LongBtreeHdr::is_v5(m) => cksum::verify_cksum(buf, LONG_BTREE_CRC_OFF),
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hdr_v5_round_trip() {
        let hdr = ShortBtreeHdr {
            magic: ABTB_CRC_MAGIC,
            level: 0,
            numrecs: 7,
            leftsib: NULL_AGBLOCK,
            rightsib: NULL_AGBLOCK,
        };
        let mut buf = vec![0_u8; 4096];
        hdr.encode(&mut buf, 8, 0, &Uuid::from_u128(2));
        cksum::update_cksum(&mut buf, SHORT_BTREE_CRC_OFF);
        assert!(verify_short_crc(&buf));
        assert_eq!(ShortBtreeHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn long_hdr_round_trip() {
        let hdr = LongBtreeHdr {
            magic: BMAP_CRC_MAGIC,
            level: 0,
            numrecs: 3,
            leftsib: NULL_FSBLOCK,
            rightsib: NULL_FSBLOCK,
        };
        let mut buf = vec![0_u8; 4096];
        hdr.encode(&mut buf, 16, 131, &Uuid::from_u128(5));
        cksum::update_cksum(&mut buf, LONG_BTREE_CRC_OFF);
        assert!(verify_long_crc(&buf));
        assert_eq!(LongBtreeHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn alloc_rec_round_trip_and_maxrecs() {
        let rec = AllocRec {
            startblock: 17,
            blockcount: 4000,
        };
        let mut buf = [0_u8; 8];
        rec.encode(&mut buf, 0);
        assert_eq!(AllocRec::decode(&buf, 0).unwrap(), rec);
        assert_eq!(AllocRec::maxrecs(4096, true), (4096 - 56) / 8);
        assert_eq!(AllocRec::maxrecs(4096, false), (4096 - 16) / 8);
    }

    #[test]
    fn inobt_rec_full_round_trip() {
        let rec = InobtRec {
            startino: 64,
            freecount: 60,
            free: !0_u64 << 4,
        };
        let mut buf = [0_u8; 16];
        rec.encode(&mut buf, 0, false);
        let out = InobtRec::decode(&buf, 0, false).unwrap();
        assert_eq!(out, rec);
        assert!(!out.is_free(0));
        assert!(out.is_free(4));
        assert!(out.is_free(63));
    }

    #[test]
    fn inobt_rec_sparse_encoding() {
        let rec = InobtRec {
            startino: 128,
            freecount: 64,
            free: !0_u64,
        };
        let mut buf = [0_u8; 16];
        rec.encode(&mut buf, 0, true);
        // holemask zero, count 64.
        assert_eq!(read_be_u16(&buf, 4).unwrap(), 0);
        assert_eq!(buf[6], 64);
        assert_eq!(buf[7], 64);
        let out = InobtRec::decode(&buf, 0, true).unwrap();
        assert_eq!(out.startino, 128);
        assert_eq!(out.freecount, 64);
        assert_eq!(out.free, !0_u64);
    }

    #[test]
    fn new_leaf_headers() {
        let s = ShortBtreeHdr::new_leaf(ABTB_MAGIC);
        assert_eq!(s.level, 0);
        assert_eq!(s.leftsib, NULL_AGBLOCK);
        let l = LongBtreeHdr::new_leaf(BMAP_MAGIC);
        assert_eq!(l.rightsib, NULL_FSBLOCK);
    }
}
