//! Packed 128-bit extent records (`xfs_bmbt_rec`).
//!
//! Layout, most significant bit first:
//! `flag:1 | startoff:54 | startblock:52 | blockcount:21`
//! split across two big-endian 64-bit words. The flag marks an unwritten
//! (reads-as-zero) extent.

use uxfs_types::{read_be_u64, write_be_u64, FileBlock, FsBlock, ParseError};

pub const EXTENT_REC_SIZE: usize = 16;

/// Maximum blockcount a single record can carry (21 bits).
pub const MAX_EXTENT_LEN: u64 = (1 << 21) - 1;

/// An unpacked extent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRec {
    /// File block offset this extent starts at.
    pub startoff: FileBlock,
    /// First disk block of the extent (segmented fsblock).
    pub startblock: FsBlock,
    /// Length in filesystem blocks.
    pub blockcount: u64,
    /// Unwritten extents read back as zeroes.
    pub unwritten: bool,
}

impl ExtentRec {
    /// File block just past the end of this extent.
    #[must_use]
    pub fn end_off(&self) -> u64 {
        self.startoff.0 + self.blockcount
    }

    /// Unpack from 16 on-disk bytes.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        let l0 = read_be_u64(buf, offset)?;
        let l1 = read_be_u64(buf, offset + 8)?;

        let unwritten = l0 >> 63 != 0;
        let startoff = (l0 >> 9) & ((1 << 54) - 1);
        let startblock = ((l0 & 0x1FF) << 43) | (l1 >> 21);
        let blockcount = l1 & ((1 << 21) - 1);

        Ok(Self {
            startoff: FileBlock(startoff),
            startblock: FsBlock(startblock),
            blockcount,
            unwritten,
        })
    }

    /// Pack into 16 on-disk bytes.
    pub fn encode(&self, buf: &mut [u8], offset: usize) {
        let flag = u64::from(self.unwritten) << 63;
        let l0 = flag | ((self.startoff.0 & ((1 << 54) - 1)) << 9) | (self.startblock.0 >> 43);
        let l1 = ((self.startblock.0 & ((1 << 43) - 1)) << 21) | (self.blockcount & ((1 << 21) - 1));
        write_be_u64(buf, offset, l0);
        write_be_u64(buf, offset + 8, l1);
    }

    /// Decode a packed inline extent list.
    pub fn decode_list(buf: &[u8], count: usize) -> Result<Vec<Self>, ParseError> {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(Self::decode(buf, i * EXTENT_REC_SIZE)?);
        }
        Ok(out)
    }

    /// Encode an extent list into a packed byte vector.
    #[must_use]
    pub fn encode_list(records: &[Self]) -> Vec<u8> {
        let mut out = vec![0_u8; records.len() * EXTENT_REC_SIZE];
        for (i, rec) in records.iter().enumerate() {
            rec.encode(&mut out, i * EXTENT_REC_SIZE);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let rec = ExtentRec {
            startoff: FileBlock(0x3_FFFF_FFFF),
            startblock: FsBlock(0xF_FFFF_FFFF_FFF),
            blockcount: MAX_EXTENT_LEN,
            unwritten: true,
        };
        let mut buf = [0_u8; 16];
        rec.encode(&mut buf, 0);
        assert_eq!(ExtentRec::decode(&buf, 0).unwrap(), rec);
    }

    #[test]
    fn written_flag_clear() {
        let rec = ExtentRec {
            startoff: FileBlock(7),
            startblock: FsBlock(4099),
            blockcount: 3,
            unwritten: false,
        };
        let mut buf = [0_u8; 16];
        rec.encode(&mut buf, 0);
        let out = ExtentRec::decode(&buf, 0).unwrap();
        assert!(!out.unwritten);
        assert_eq!(out.startoff, FileBlock(7));
        assert_eq!(out.startblock, FsBlock(4099));
        assert_eq!(out.blockcount, 3);
        assert_eq!(out.end_off(), 10);
    }

    #[test]
    fn list_round_trip() {
        let recs = vec![
            ExtentRec {
                startoff: FileBlock(0),
                startblock: FsBlock(100),
                blockcount: 4,
                unwritten: false,
            },
            ExtentRec {
                startoff: FileBlock(10),
                startblock: FsBlock(300),
                blockcount: 1,
                unwritten: true,
            },
        ];
        let packed = ExtentRec::encode_list(&recs);
        assert_eq!(packed.len(), 32);
        assert_eq!(ExtentRec::decode_list(&packed, 2).unwrap(), recs);
    }

    #[test]
    fn zero_record() {
        let buf = [0_u8; 16];
        let rec = ExtentRec::decode(&buf, 0).unwrap();
        assert_eq!(rec.blockcount, 0);
        assert_eq!(rec.startoff, FileBlock(0));
        assert!(!rec.unwritten);
    }
}
