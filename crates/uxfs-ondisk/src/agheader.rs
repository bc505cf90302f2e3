//! Allocation-group headers: AGF (free space) and AGI (inodes).
//!
//! Both live in the first sectors of every AG: superblock copy at sector 0,
//! AGF at sector 1, AGI at sector 2, AGFL at sector 3.

use crate::cksum;
use uuid::Uuid;
use uxfs_types::{
    read_be_u32, read_fixed, write_be_u32, write_be_u64, ParseError, NULL_AGINO,
};

pub const AGF_MAGIC: u32 = 0x5841_4746; // "XAGF"
pub const AGI_MAGIC: u32 = 0x5841_4749; // "XAGI"

pub const AGF_CRC_OFF: usize = 0xD8;
pub const AGI_CRC_OFF: usize = 0x138;

/// Number of unlinked-list hash buckets in the AGI.
pub const AGI_UNLINKED_BUCKETS: usize = 64;

/// Decoded AGF (free-space header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agf {
    pub seqno: u32,
    /// AG length in blocks (last AG may be short).
    pub length: u32,
    pub bno_root: u32,
    pub cnt_root: u32,
    pub bno_level: u32,
    pub cnt_level: u32,
    pub flfirst: u32,
    pub fllast: u32,
    pub flcount: u32,
    pub freeblks: u32,
    pub longest: u32,
    pub btreeblks: u32,
    pub uuid: Uuid,
}

impl Agf {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(buf, 0)?;
        if magic != AGF_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(AGF_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            seqno: read_be_u32(buf, 0x08)?,
            length: read_be_u32(buf, 0x0C)?,
            bno_root: read_be_u32(buf, 0x10)?,
            cnt_root: read_be_u32(buf, 0x14)?,
            bno_level: read_be_u32(buf, 0x1C)?,
            cnt_level: read_be_u32(buf, 0x20)?,
            flfirst: read_be_u32(buf, 0x28)?,
            fllast: read_be_u32(buf, 0x2C)?,
            flcount: read_be_u32(buf, 0x30)?,
            freeblks: read_be_u32(buf, 0x34)?,
            longest: read_be_u32(buf, 0x38)?,
            btreeblks: read_be_u32(buf, 0x3C)?,
            uuid: Uuid::from_bytes(read_fixed::<16>(buf, 0x40)?),
        })
    }

    /// Encode into a sector buffer. The caller refreshes the CRC on V5.
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        write_be_u32(buf, 0x00, AGF_MAGIC);
        write_be_u32(buf, 0x04, 1); // versionnum
        write_be_u32(buf, 0x08, self.seqno);
        write_be_u32(buf, 0x0C, self.length);
        write_be_u32(buf, 0x10, self.bno_root);
        write_be_u32(buf, 0x14, self.cnt_root);
        write_be_u32(buf, 0x1C, self.bno_level);
        write_be_u32(buf, 0x20, self.cnt_level);
        write_be_u32(buf, 0x28, self.flfirst);
        write_be_u32(buf, 0x2C, self.fllast);
        write_be_u32(buf, 0x30, self.flcount);
        write_be_u32(buf, 0x34, self.freeblks);
        write_be_u32(buf, 0x38, self.longest);
        write_be_u32(buf, 0x3C, self.btreeblks);
        buf[0x40..0x50].copy_from_slice(self.uuid.as_bytes());
    }

    #[must_use]
    pub fn verify_crc(buf: &[u8], v5: bool) -> bool {
        !v5 || cksum::verify_cksum(buf, AGF_CRC_OFF)
    }
}

/// Decoded AGI (inode-allocation header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agi {
    pub seqno: u32,
    pub length: u32,
    /// Allocated inode count in this AG.
    pub count: u32,
    pub root: u32,
    pub level: u32,
    pub freecount: u32,
    pub newino: u32,
    pub dirino: u32,
    pub unlinked: [u32; AGI_UNLINKED_BUCKETS],
    pub uuid: Uuid,
}

impl Agi {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(buf, 0)?;
        if magic != AGI_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(AGI_MAGIC),
                actual: u64::from(magic),
            });
        }
        let mut unlinked = [NULL_AGINO; AGI_UNLINKED_BUCKETS];
        for (i, bucket) in unlinked.iter_mut().enumerate() {
            *bucket = read_be_u32(buf, 0x28 + i * 4)?;
        }
        Ok(Self {
            seqno: read_be_u32(buf, 0x08)?,
            length: read_be_u32(buf, 0x0C)?,
            count: read_be_u32(buf, 0x10)?,
            root: read_be_u32(buf, 0x14)?,
            level: read_be_u32(buf, 0x18)?,
            freecount: read_be_u32(buf, 0x1C)?,
            newino: read_be_u32(buf, 0x20)?,
            dirino: read_be_u32(buf, 0x24)?,
            unlinked,
            uuid: Uuid::from_bytes(read_fixed::<16>(buf, 0x128)?),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        write_be_u32(buf, 0x00, AGI_MAGIC);
        write_be_u32(buf, 0x04, 1);
        write_be_u32(buf, 0x08, self.seqno);
        write_be_u32(buf, 0x0C, self.length);
        write_be_u32(buf, 0x10, self.count);
        write_be_u32(buf, 0x14, self.root);
        write_be_u32(buf, 0x18, self.level);
        write_be_u32(buf, 0x1C, self.freecount);
        write_be_u32(buf, 0x20, self.newino);
        write_be_u32(buf, 0x24, self.dirino);
        for (i, bucket) in self.unlinked.iter().enumerate() {
            write_be_u32(buf, 0x28 + i * 4, *bucket);
        }
        buf[0x128..0x138].copy_from_slice(self.uuid.as_bytes());
    }

    #[must_use]
    pub fn verify_crc(buf: &[u8], v5: bool) -> bool {
        !v5 || cksum::verify_cksum(buf, AGI_CRC_OFF)
    }
}

/// Stamp an LSN field used by V5 headers (we always write zero: the engine
/// commits by direct write-back and never replays a log).
pub fn stamp_agf_lsn(buf: &mut [u8]) {
    write_be_u64(buf, 0xD0, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agf() -> Agf {
        Agf {
            seqno: 1,
            length: 4096,
            bno_root: 1,
            cnt_root: 2,
            bno_level: 1,
            cnt_level: 1,
            flfirst: 0,
            fllast: 3,
            flcount: 4,
            freeblks: 4000,
            longest: 3900,
            btreeblks: 0,
            uuid: Uuid::from_u128(11),
        }
    }

    #[test]
    fn agf_round_trip_with_crc() {
        let agf = test_agf();
        let mut buf = vec![0_u8; 512];
        agf.encode(&mut buf);
        cksum::update_cksum(&mut buf, AGF_CRC_OFF);
        assert!(Agf::verify_crc(&buf, true));
        assert_eq!(Agf::decode(&buf).unwrap(), agf);
    }

    #[test]
    fn agf_bad_magic() {
        let buf = vec![0_u8; 512];
        assert!(Agf::decode(&buf).is_err());
    }

    #[test]
    fn agi_round_trip() {
        let mut agi = Agi {
            seqno: 2,
            length: 4096,
            count: 64,
            root: 3,
            level: 1,
            freecount: 60,
            newino: 64,
            dirino: NULL_AGINO,
            unlinked: [NULL_AGINO; AGI_UNLINKED_BUCKETS],
            uuid: Uuid::from_u128(12),
        };
        agi.unlinked[5] = 99;
        let mut buf = vec![0_u8; 512];
        agi.encode(&mut buf);
        cksum::update_cksum(&mut buf, AGI_CRC_OFF);
        assert!(Agi::verify_crc(&buf, true));
        let out = Agi::decode(&buf).unwrap();
        assert_eq!(out, agi);
        assert_eq!(out.unlinked[5], 99);
        assert_eq!(out.unlinked[6], NULL_AGINO);
    }

    #[test]
    fn v4_skips_crc() {
        let buf = vec![0_u8; 512];
        assert!(Agf::verify_crc(&buf, false));
        assert!(Agi::verify_crc(&buf, false));
    }
}
