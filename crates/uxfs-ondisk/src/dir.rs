//! Directory on-disk structures: shortform, data/block headers, leaf blocks.
//!
//! A directory starts shortform (packed into the inode's literal area),
//! grows into a single "block" form directory block (data header + entries
//! + trailing hash lookup array + tail), then into leaf form (pure data
//! blocks plus a separate leaf block of hash-sorted entries in the 32 GiB
//! leaf region).

use crate::cksum;
use uuid::Uuid;
use uxfs_types::{
    read_be_u16, read_be_u32, read_be_u64, read_u8, roundup8, write_be_u16,
    write_be_u32, write_be_u64, ParseError,
};

// Data/block magics.
pub const DIR2_BLOCK_MAGIC: u32 = 0x5844_3242; // "XD2B"
pub const DIR3_BLOCK_MAGIC: u32 = 0x5844_4233; // "XDB3"
pub const DIR2_DATA_MAGIC: u32 = 0x5844_3244; // "XD2D"
pub const DIR3_DATA_MAGIC: u32 = 0x5844_4433; // "XDD3"

// Leaf magics (16-bit, stored in the da blkinfo).
pub const DIR2_LEAF1_MAGIC: u16 = 0xD2F1;
pub const DIR3_LEAF1_MAGIC: u16 = 0x3DF1;
pub const DIR2_LEAFN_MAGIC: u16 = 0xD2FF;
pub const DIR3_LEAFN_MAGIC: u16 = 0x3DFF;
pub const DA_NODE_MAGIC: u16 = 0xFEBE;
pub const DA3_NODE_MAGIC: u16 = 0x3EBE;

/// Tag marking an unused span inside a data block.
pub const DATA_FREE_TAG: u16 = 0xFFFF;

/// CRC offset within V5 directory data/block blocks.
pub const DIR_DATA_CRC_OFF: usize = 4;
/// CRC offset within V5 leaf blocks (inside the da3 blkinfo).
pub const DIR_LEAF_CRC_OFF: usize = 12;

/// Number of tracked best-free regions in a data block header.
pub const DATA_BEST_FREE: usize = 3;

// ── Entry sizing ────────────────────────────────────────────────────────────

/// Byte size of a data-block entry for a name of `namelen` bytes.
///
/// inumber(8) + namelen(1) + name + optional ftype(1) + tag(2), rounded up
/// to 8-byte alignment.
#[must_use]
pub fn entry_size(namelen: usize, has_ftype: bool) -> usize {
    roundup8(8 + 1 + namelen + usize::from(has_ftype) + 2)
}

/// Byte size of a shortform entry.
///
/// namelen(1) + offset(2) + name + optional ftype(1) + inumber(4|8).
#[must_use]
pub fn sf_entry_size(namelen: usize, i8: bool, has_ftype: bool) -> usize {
    1 + 2 + namelen + usize::from(has_ftype) + if i8 { 8 } else { 4 }
}

// ── Shortform ───────────────────────────────────────────────────────────────

/// One shortform directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfEntry {
    pub name: Vec<u8>,
    /// Emulated data-block offset, used for readdir cookies.
    pub offset: u16,
    pub ftype: u8,
    pub inumber: u64,
}

/// Decoded shortform directory (header + entries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfDir {
    pub parent: u64,
    pub entries: Vec<SfEntry>,
}

impl SfDir {
    /// Decode the shortform directory from the inode's data fork bytes.
    pub fn decode(buf: &[u8], has_ftype: bool) -> Result<Self, ParseError> {
        let count = read_u8(buf, 0)?;
        let i8count = read_u8(buf, 1)?;
        let i8 = i8count > 0;

        let parent = if i8 {
            read_be_u64(buf, 2)?
        } else {
            u64::from(read_be_u32(buf, 2)?)
        };
        let mut pos = 2 + if i8 { 8 } else { 4 };

        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let namelen = usize::from(read_u8(buf, pos)?);
            let offset = read_be_u16(buf, pos + 1)?;
            let name = ensure_name(buf, pos + 3, namelen)?;
            pos += 3 + namelen;
            let ftype = if has_ftype {
                let t = read_u8(buf, pos)?;
                pos += 1;
                t
            } else {
                0
            };
            let inumber = if i8 {
                let v = read_be_u64(buf, pos)?;
                pos += 8;
                v
            } else {
                let v = u64::from(read_be_u32(buf, pos)?);
                pos += 4;
                v
            };
            entries.push(SfEntry {
                name,
                offset,
                ftype,
                inumber,
            });
        }

        Ok(Self { parent, entries })
    }

    /// Whether any inumber (parent included) needs 8-byte storage.
    #[must_use]
    pub fn needs_i8(&self) -> bool {
        self.parent > u64::from(u32::MAX)
            || self.entries.iter().any(|e| e.inumber > u64::from(u32::MAX))
    }

    /// Encoded byte size with the current entry set.
    #[must_use]
    pub fn encoded_size(&self, has_ftype: bool) -> usize {
        let i8 = self.needs_i8();
        let mut size = 2 + if i8 { 8 } else { 4 };
        for e in &self.entries {
            size += sf_entry_size(e.name.len(), i8, has_ftype);
        }
        size
    }

    /// Encode into the inode's data fork representation.
    #[must_use]
    pub fn encode(&self, has_ftype: bool) -> Vec<u8> {
        let i8 = self.needs_i8();
        let mut out = vec![0_u8; self.encoded_size(has_ftype)];
        // count is a u8: shortform converts to block form long before 256
        // entries, enforced by the inline-capacity check on insert.
        out[0] = self.entries.len() as u8;
        out[1] = if i8 { self.entries.len() as u8 } else { 0 };
        let mut pos = 2;
        if i8 {
            write_be_u64(&mut out, pos, self.parent);
            pos += 8;
        } else {
            write_be_u32(&mut out, pos, self.parent as u32);
            pos += 4;
        }
        for e in &self.entries {
            out[pos] = e.name.len() as u8;
            write_be_u16(&mut out, pos + 1, e.offset);
            out[pos + 3..pos + 3 + e.name.len()].copy_from_slice(&e.name);
            pos += 3 + e.name.len();
            if has_ftype {
                out[pos] = e.ftype;
                pos += 1;
            }
            if i8 {
                write_be_u64(&mut out, pos, e.inumber);
                pos += 8;
            } else {
                write_be_u32(&mut out, pos, e.inumber as u32);
                pos += 4;
            }
        }
        out
    }
}

fn ensure_name(buf: &[u8], offset: usize, len: usize) -> Result<Vec<u8>, ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "namelen",
        reason: "overflow",
    })?;
    if end > buf.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: buf.len().saturating_sub(offset),
        });
    }
    Ok(buf[offset..end].to_vec())
}

// ── Data / block headers ────────────────────────────────────────────────────

/// Decoded data-block header (block or leaf-data flavor, V4 or V5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHdr {
    pub magic: u32,
    /// Largest three free regions: `(offset, length)`, zero-length unused.
    pub best_free: [(u16, u16); DATA_BEST_FREE],
}

impl DataHdr {
    #[must_use]
    pub fn is_v5(magic: u32) -> bool {
        magic == DIR3_BLOCK_MAGIC || magic == DIR3_DATA_MAGIC
    }

    /// Offset of the first entry for the given header flavor.
    #[must_use]
    pub fn entries_offset(magic: u32) -> usize {
        if Self::is_v5(magic) {
            64
        } else {
            16
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(buf, 0)?;
        let bf_off = match magic {
            DIR2_BLOCK_MAGIC | DIR2_DATA_MAGIC => 4,
            DIR3_BLOCK_MAGIC | DIR3_DATA_MAGIC => 48,
            other => {
                return Err(ParseError::InvalidMagic {
                    expected: u64::from(DIR2_DATA_MAGIC),
                    actual: u64::from(other),
                })
            }
        };
        let mut best_free = [(0_u16, 0_u16); DATA_BEST_FREE];
        for (i, slot) in best_free.iter_mut().enumerate() {
            slot.0 = read_be_u16(buf, bf_off + i * 4)?;
            slot.1 = read_be_u16(buf, bf_off + i * 4 + 2)?;
        }
        Ok(Self { magic, best_free })
    }

    /// Write the header fields into a block image. For V5 headers the
    /// self-describing fields (blkno, owner, uuid) are stamped as well; the
    /// CRC is refreshed separately at transaction commit.
    pub fn encode(&self, buf: &mut [u8], blkno: u64, owner: u64, uuid: &Uuid) {
        write_be_u32(buf, 0, self.magic);
        let bf_off = if Self::is_v5(self.magic) {
            write_be_u64(buf, 8, blkno);
            buf[24..40].copy_from_slice(uuid.as_bytes());
            write_be_u64(buf, 40, owner);
            48
        } else {
            4
        };
        for (i, slot) in self.best_free.iter().enumerate() {
            write_be_u16(buf, bf_off + i * 4, slot.0);
            write_be_u16(buf, bf_off + i * 4 + 2, slot.1);
        }
    }

    /// Largest tracked free span.
    #[must_use]
    pub fn longest_free(&self) -> u16 {
        self.best_free.iter().map(|&(_, len)| len).max().unwrap_or(0)
    }
}

/// One record inside the entry region of a data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRec {
    Entry {
        inumber: u64,
        name: Vec<u8>,
        ftype: u8,
        /// Total on-disk size of this entry.
        size: usize,
    },
    Unused {
        /// Total on-disk size of the unused span.
        size: usize,
    },
}

impl DataRec {
    /// Parse the record starting at `offset`.
    pub fn decode(buf: &[u8], offset: usize, has_ftype: bool) -> Result<Self, ParseError> {
        let freetag = read_be_u16(buf, offset)?;
        if freetag == DATA_FREE_TAG {
            let size = usize::from(read_be_u16(buf, offset + 2)?);
            if size < 8 || offset + size > buf.len() {
                return Err(ParseError::InvalidField {
                    field: "dup_length",
                    reason: "unused span length out of range",
                });
            }
            return Ok(Self::Unused { size });
        }

        let inumber = read_be_u64(buf, offset)?;
        let namelen = usize::from(read_u8(buf, offset + 8)?);
        let name = ensure_name(buf, offset + 9, namelen)?;
        let ftype = if has_ftype {
            read_u8(buf, offset + 9 + namelen)?
        } else {
            0
        };
        Ok(Self::Entry {
            inumber,
            name,
            ftype,
            size: entry_size(namelen, has_ftype),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Entry { size, .. } | Self::Unused { size } => *size,
        }
    }
}

/// Write a live entry at `offset`; the trailing tag records the offset.
pub fn write_entry(
    buf: &mut [u8],
    offset: usize,
    inumber: u64,
    name: &[u8],
    ftype: u8,
    has_ftype: bool,
) {
    let size = entry_size(name.len(), has_ftype);
    buf[offset..offset + size].fill(0);
    write_be_u64(buf, offset, inumber);
    buf[offset + 8] = name.len() as u8;
    buf[offset + 9..offset + 9 + name.len()].copy_from_slice(name);
    if has_ftype {
        buf[offset + 9 + name.len()] = ftype;
    }
    write_be_u16(buf, offset + size - 2, offset as u16);
}

/// Write an unused span at `offset`.
pub fn write_unused(buf: &mut [u8], offset: usize, size: usize) {
    buf[offset..offset + size].fill(0);
    write_be_u16(buf, offset, DATA_FREE_TAG);
    write_be_u16(buf, offset + 2, size as u16);
    write_be_u16(buf, offset + size - 2, offset as u16);
}

// ── Block tail and leaf entries ─────────────────────────────────────────────

/// Trailing `(count, stale)` pair of a block-form directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTail {
    pub count: u32,
    pub stale: u32,
}

impl BlockTail {
    pub const SIZE: usize = 8;

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let off = buf.len() - Self::SIZE;
        Ok(Self {
            count: read_be_u32(buf, off)?,
            stale: read_be_u32(buf, off + 4)?,
        })
    }

    pub fn encode(self, buf: &mut [u8]) {
        let off = buf.len() - Self::SIZE;
        write_be_u32(buf, off, self.count);
        write_be_u32(buf, off + 4, self.stale);
    }
}

/// Hash lookup entry: `(hashval, dataptr)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub hashval: u32,
    pub address: u32,
}

impl LeafEntry {
    pub const SIZE: usize = 8;
    /// Address value of a stale (deleted) leaf entry.
    pub const STALE: u32 = 0;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            hashval: read_be_u32(buf, offset)?,
            address: read_be_u32(buf, offset + 4)?,
        })
    }

    pub fn encode(self, buf: &mut [u8], offset: usize) {
        write_be_u32(buf, offset, self.hashval);
        write_be_u32(buf, offset + 4, self.address);
    }
}

/// Byte range of the block-form leaf array: `(first_entry_offset, count)`.
pub fn block_leaf_region(buf: &[u8]) -> Result<(usize, usize), ParseError> {
    let tail = BlockTail::decode(buf)?;
    let count = tail.count as usize;
    let need = count
        .checked_mul(LeafEntry::SIZE)
        .and_then(|n| n.checked_add(BlockTail::SIZE))
        .ok_or(ParseError::InvalidField {
            field: "btp_count",
            reason: "leaf array overflow",
        })?;
    if need > buf.len() {
        return Err(ParseError::InvalidField {
            field: "btp_count",
            reason: "leaf array exceeds block",
        });
    }
    Ok((buf.len() - need, count))
}

// ── Leaf blocks (leaf form) ─────────────────────────────────────────────────

/// Decoded leaf-block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafHdr {
    pub magic: u16,
    pub forw: u32,
    pub back: u32,
    pub count: u16,
    pub stale: u16,
}

impl LeafHdr {
    #[must_use]
    pub fn is_v5(magic: u16) -> bool {
        magic == DIR3_LEAF1_MAGIC || magic == DIR3_LEAFN_MAGIC || magic == DA3_NODE_MAGIC
    }

    /// Offset of the first leaf entry for the given flavor.
    #[must_use]
    pub fn entries_offset(magic: u16) -> usize {
        if Self::is_v5(magic) {
            64
        } else {
            16
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u16(buf, 8)?;
        let (count, stale) = if Self::is_v5(magic) {
            (read_be_u16(buf, 56)?, read_be_u16(buf, 58)?)
        } else {
            (read_be_u16(buf, 12)?, read_be_u16(buf, 14)?)
        };
        Ok(Self {
            magic,
            forw: read_be_u32(buf, 0)?,
            back: read_be_u32(buf, 4)?,
            count,
            stale,
        })
    }

    pub fn encode(self, buf: &mut [u8], blkno: u64, owner: u64, uuid: &Uuid) {
        write_be_u32(buf, 0, self.forw);
        write_be_u32(buf, 4, self.back);
        write_be_u16(buf, 8, self.magic);
        if Self::is_v5(self.magic) {
            write_be_u64(buf, 16, blkno);
            buf[32..48].copy_from_slice(uuid.as_bytes());
            write_be_u64(buf, 48, owner);
            write_be_u16(buf, 56, self.count);
            write_be_u16(buf, 58, self.stale);
        } else {
            write_be_u16(buf, 12, self.count);
            write_be_u16(buf, 14, self.stale);
        }
    }
}

/// Leaf tail: count of best-free slots kept at the end of a leaf1 block.
pub fn leaf_tail_bestcount(buf: &[u8]) -> Result<u32, ParseError> {
    read_be_u32(buf, buf.len() - 4)
}

pub fn set_leaf_tail_bestcount(buf: &mut [u8], count: u32) {
    let off = buf.len() - 4;
    write_be_u32(buf, off, count);
}

/// Read best-free slot `idx` (bytes counted back from the tail).
pub fn leaf_best(buf: &[u8], idx: usize, bestcount: usize) -> Result<u16, ParseError> {
    let off = buf.len() - 4 - (bestcount - idx) * 2;
    read_be_u16(buf, off)
}

pub fn set_leaf_best(buf: &mut [u8], idx: usize, bestcount: usize, value: u16) {
    let off = buf.len() - 4 - (bestcount - idx) * 2;
    write_be_u16(buf, off, value);
}

// ── CRC helpers ─────────────────────────────────────────────────────────────

/// Verify the CRC of a V5 directory data/block buffer; V4 always passes.
#[must_use]
pub fn verify_data_crc(buf: &[u8]) -> bool {
    match read_be_u32(buf, 0) {
        Ok(m) if DataHdr::is_v5(m) => cksum::verify_cksum(buf, DIR_DATA_CRC_OFF),
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Verify the CRC of a V5 leaf buffer; V4 always passes.
#[must_use]
pub fn verify_leaf_crc(buf: &[u8]) -> bool {
    match read_be_u16(buf, 8) {
        Ok(m) if LeafHdr::is_v5(m) => cksum::verify_cksum(buf, DIR_LEAF_CRC_OFF),
        Ok(_) => true,
        Err(_) => false,
    }
}
