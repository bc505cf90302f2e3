//! On-disk inode (dinode) codec, V2 and V3 layouts.
//!
//! The V2 core is 96 bytes followed by `di_next_unlinked`; the literal
//! (fork) area starts at 100. V3 inodes continue with the CRC, change
//! count, LSN, flags2, creation time, own inode number and UUID; their
//! literal area starts at 176. The V3 CRC covers the whole on-disk inode
//! with the CRC field zeroed.

use crate::cksum;
use uuid::Uuid;
use uxfs_types::{
    read_be_u16, read_be_u32, read_be_u64, read_fixed, read_u8, write_be_u16, write_be_u32,
    write_be_u64, ParseError, Timestamp, NULL_AGINO, XFS_DINODE_MAGIC,
};

/// Offset of the V3 inode CRC field.
pub const INODE_CRC_OFF: usize = 100;

/// Literal-area offsets by inode version.
pub const LITERAL_OFF_V2: usize = 100;
pub const LITERAL_OFF_V3: usize = 176;

/// Fork format byte values (`di_format` / `di_aformat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ForkFormat {
    /// Character/block device: the fork holds a device number.
    Dev = 0,
    /// Inline bytes (small directories, short symlinks).
    Local = 1,
    /// Inline list of packed extent records.
    Extents = 2,
    /// Inline B+tree root; leaves live in blocks.
    Btree = 3,
}

impl ForkFormat {
    pub fn from_byte(b: u8) -> Result<Self, ParseError> {
        match b {
            0 => Ok(Self::Dev),
            1 => Ok(Self::Local),
            2 => Ok(Self::Extents),
            3 => Ok(Self::Btree),
            _ => Err(ParseError::InvalidField {
                field: "di_format",
                reason: "unrecognized fork format",
            }),
        }
    }
}

/// Log-field classes for inode mutation, mirroring `XFS_ILOG_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeLogFlags(pub u32);

impl InodeLogFlags {
    pub const CORE: Self = Self(0x001);
    pub const DDATA: Self = Self(0x002);
    pub const DEXT: Self = Self(0x004);
    pub const DBROOT: Self = Self(0x008);
    pub const DEV: Self = Self(0x010);
    pub const ADATA: Self = Self(0x020);
    pub const AEXT: Self = Self(0x040);
    pub const ABROOT: Self = Self(0x080);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for InodeLogFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for InodeLogFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Decoded inode core, common to V2 and V3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiCore {
    pub mode: u16,
    pub version: u8,
    pub format: ForkFormat,
    pub onlink: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub projid: u32,
    pub flushiter: u16,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub size: u64,
    pub nblocks: u64,
    pub extsize: u32,
    pub nextents: u32,
    pub anextents: u16,
    /// Attribute fork offset in 8-byte units; 0 means no attribute fork.
    pub forkoff: u8,
    pub aformat: ForkFormat,
    pub flags: u16,
    pub gen: u32,
    // V3 only; zeroed on V2.
    pub changecount: u64,
    pub lsn: u64,
    pub flags2: u64,
    pub crtime: Timestamp,
    pub ino: u64,
    pub uuid: Uuid,
}

impl DiCore {
    /// Offset of the literal (fork) area for this inode version.
    #[must_use]
    pub fn literal_offset(&self) -> usize {
        if self.version >= 3 {
            LITERAL_OFF_V3
        } else {
            LITERAL_OFF_V2
        }
    }

    /// Byte size of the data-fork region within the literal area.
    #[must_use]
    pub fn data_fork_size(&self, inode_size: usize) -> usize {
        if self.forkoff != 0 {
            usize::from(self.forkoff) << 3
        } else {
            inode_size - self.literal_offset()
        }
    }

    /// Byte size of the attribute-fork region (0 without a fork).
    #[must_use]
    pub fn attr_fork_size(&self, inode_size: usize) -> usize {
        if self.forkoff == 0 {
            0
        } else {
            inode_size - self.literal_offset() - (usize::from(self.forkoff) << 3)
        }
    }
}

/// A fully decoded on-disk inode: core plus raw fork bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DInode {
    pub core: DiCore,
    pub next_unlinked: u32,
    pub data_fork: Vec<u8>,
    pub attr_fork: Vec<u8>,
}

impl DInode {
    /// Decode an inode from its `inode_size` slot in the cluster buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u16(buf, 0)?;
        if magic != XFS_DINODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_DINODE_MAGIC),
                actual: u64::from(magic),
            });
        }

        let version = read_u8(buf, 4)?;
        if !(1..=3).contains(&version) {
            return Err(ParseError::InvalidField {
                field: "di_version",
                reason: "unsupported inode version",
            });
        }

        let core = DiCore {
            mode: read_be_u16(buf, 2)?,
            version,
            format: ForkFormat::from_byte(read_u8(buf, 5)?)?,
            onlink: read_be_u16(buf, 6)?,
            uid: read_be_u32(buf, 8)?,
            gid: read_be_u32(buf, 12)?,
            nlink: if version >= 2 {
                read_be_u32(buf, 16)?
            } else {
                u32::from(read_be_u16(buf, 6)?)
            },
            projid: u32::from(read_be_u16(buf, 20)?)
                | (u32::from(read_be_u16(buf, 22)?) << 16),
            flushiter: read_be_u16(buf, 30)?,
            atime: Timestamp::decode(buf, 32)?,
            mtime: Timestamp::decode(buf, 40)?,
            ctime: Timestamp::decode(buf, 48)?,
            size: read_be_u64(buf, 56)?,
            nblocks: read_be_u64(buf, 64)?,
            extsize: read_be_u32(buf, 72)?,
            nextents: read_be_u32(buf, 76)?,
            anextents: read_be_u16(buf, 80)?,
            forkoff: read_u8(buf, 82)?,
            aformat: ForkFormat::from_byte(read_u8(buf, 83)?).unwrap_or(ForkFormat::Extents),
            flags: read_be_u16(buf, 90)?,
            gen: read_be_u32(buf, 92)?,
            changecount: if version >= 3 {
                read_be_u64(buf, 104)?
            } else {
                0
            },
            lsn: if version >= 3 { read_be_u64(buf, 112)? } else { 0 },
            flags2: if version >= 3 { read_be_u64(buf, 120)? } else { 0 },
            crtime: if version >= 3 {
                Timestamp::decode(buf, 144)?
            } else {
                Timestamp::default()
            },
            ino: if version >= 3 { read_be_u64(buf, 152)? } else { 0 },
            uuid: if version >= 3 {
                Uuid::from_bytes(read_fixed::<16>(buf, 160)?)
            } else {
                Uuid::nil()
            },
        };

        let next_unlinked = read_be_u32(buf, 96)?;
        let lit = core.literal_offset();
        let dsize = core.data_fork_size(buf.len());
        let asize = core.attr_fork_size(buf.len());
        if lit + dsize + asize > buf.len() {
            return Err(ParseError::InvalidField {
                field: "di_forkoff",
                reason: "fork areas exceed inode size",
            });
        }

        Ok(Self {
            core,
            next_unlinked,
            data_fork: buf[lit..lit + dsize].to_vec(),
            attr_fork: buf[lit + dsize..lit + dsize + asize].to_vec(),
        })
    }

    /// Verify the V3 inode CRC; V2 inodes always pass.
    #[must_use]
    pub fn verify_crc(buf: &[u8]) -> bool {
        match read_u8(buf, 4) {
            Ok(v) if v >= 3 => cksum::verify_cksum(buf, INODE_CRC_OFF),
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Encode into an `inode_size` slot, refreshing the V3 CRC.
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        let c = &self.core;
        write_be_u16(buf, 0, XFS_DINODE_MAGIC);
        write_be_u16(buf, 2, c.mode);
        buf[4] = c.version;
        buf[5] = c.format as u8;
        write_be_u16(buf, 6, c.onlink);
        write_be_u32(buf, 8, c.uid);
        write_be_u32(buf, 12, c.gid);
        write_be_u32(buf, 16, c.nlink);
        write_be_u16(buf, 20, (c.projid & 0xFFFF) as u16);
        write_be_u16(buf, 22, (c.projid >> 16) as u16);
        write_be_u16(buf, 30, c.flushiter);
        c.atime.encode(buf, 32);
        c.mtime.encode(buf, 40);
        c.ctime.encode(buf, 48);
        write_be_u64(buf, 56, c.size);
        write_be_u64(buf, 64, c.nblocks);
        write_be_u32(buf, 72, c.extsize);
        write_be_u32(buf, 76, c.nextents);
        write_be_u16(buf, 80, c.anextents);
        buf[82] = c.forkoff;
        buf[83] = c.aformat as u8;
        write_be_u16(buf, 90, c.flags);
        write_be_u32(buf, 92, c.gen);
        write_be_u32(buf, 96, self.next_unlinked);

        if c.version >= 3 {
            write_be_u64(buf, 104, c.changecount);
            write_be_u64(buf, 112, c.lsn);
            write_be_u64(buf, 120, c.flags2);
            c.crtime.encode(buf, 144);
            write_be_u64(buf, 152, c.ino);
            buf[160..176].copy_from_slice(c.uuid.as_bytes());
        }

        let lit = c.literal_offset();
        let dlen = self.data_fork.len().min(buf.len() - lit);
        buf[lit..lit + dlen].copy_from_slice(&self.data_fork[..dlen]);
        let aoff = lit + c.data_fork_size(buf.len());
        let alen = self.attr_fork.len().min(buf.len().saturating_sub(aoff));
        if alen > 0 {
            buf[aoff..aoff + alen].copy_from_slice(&self.attr_fork[..alen]);
        }

        if c.version >= 3 {
            cksum::update_cksum(buf, INODE_CRC_OFF);
        }
    }

    /// Fresh in-core image of a newly allocated inode slot.
    #[must_use]
    pub fn new_free(version: u8, ino: u64, uuid: Uuid) -> Self {
        Self {
            core: DiCore {
                mode: 0,
                version,
                format: ForkFormat::Extents,
                onlink: 0,
                uid: 0,
                gid: 0,
                nlink: 0,
                projid: 0,
                flushiter: 0,
                atime: Timestamp::default(),
                mtime: Timestamp::default(),
                ctime: Timestamp::default(),
                size: 0,
                nblocks: 0,
                extsize: 0,
                nextents: 0,
                anextents: 0,
                forkoff: 0,
                aformat: ForkFormat::Extents,
                flags: 0,
                gen: 0,
                changecount: 0,
                lsn: 0,
                flags2: 0,
                crtime: Timestamp::default(),
                ino,
                uuid,
            },
            next_unlinked: NULL_AGINO,
            data_fork: Vec::new(),
            attr_fork: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_v3() -> DInode {
        let mut di = DInode::new_free(3, 128, Uuid::from_u128(7));
        di.core.mode = 0o100_644;
        di.core.format = ForkFormat::Extents;
        di.core.nlink = 1;
        di.core.uid = 1000;
        di.core.gid = 100;
        di.core.size = 5;
        di.core.nblocks = 1;
        di.core.nextents = 1;
        di.core.gen = 42;
        di.core.atime = Timestamp {
            sec: 1_700_000_000,
            nsec: 1,
        };
        di.core.mtime = Timestamp {
            sec: 1_700_000_001,
            nsec: 2,
        };
        di.core.ctime = Timestamp {
            sec: 1_700_000_002,
            nsec: 3,
        };
        di.core.crtime = Timestamp {
            sec: 1_699_999_999,
            nsec: 0,
        };
        di.data_fork = vec![0xAB; 16];
        di
    }

    #[test]
    fn v3_round_trip_with_crc() {
        let di = sample_v3();
        let mut buf = vec![0_u8; 512];
        di.encode(&mut buf);

        assert!(DInode::verify_crc(&buf));
        let out = DInode::decode(&buf).expect("decode");
        assert_eq!(out.core.mode, di.core.mode);
        assert_eq!(out.core.nlink, 1);
        assert_eq!(out.core.size, 5);
        assert_eq!(out.core.ino, 128);
        assert_eq!(out.core.uuid, di.core.uuid);
        assert_eq!(out.next_unlinked, NULL_AGINO);
        assert_eq!(&out.data_fork[..16], &di.data_fork[..]);
        // Literal area of a 512-byte V3 inode is 336 bytes.
        assert_eq!(out.data_fork.len(), 512 - 176);
    }

    #[test]
    fn v2_round_trip() {
        let mut di = sample_v3();
        di.core.version = 2;
        let mut buf = vec![0_u8; 256];
        di.encode(&mut buf);
        assert!(DInode::verify_crc(&buf)); // V2: trivially true
        let out = DInode::decode(&buf).expect("decode");
        assert_eq!(out.core.version, 2);
        assert_eq!(out.core.changecount, 0);
        assert_eq!(out.data_fork.len(), 256 - 100);
    }

    #[test]
    fn crc_detects_flip() {
        let di = sample_v3();
        let mut buf = vec![0_u8; 512];
        di.encode(&mut buf);
        buf[57] ^= 0x40; // size byte
        assert!(!DInode::verify_crc(&buf));
    }

    #[test]
    fn bad_magic_rejected() {
        let buf = vec![0_u8; 512];
        assert!(matches!(
            DInode::decode(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn attr_fork_split() {
        let mut di = sample_v3();
        // forkoff is in 8-byte units from the literal start.
        di.core.forkoff = 20; // data fork = 160 bytes
        di.attr_fork = vec![0xEE; 8];
        let mut buf = vec![0_u8; 512];
        di.encode(&mut buf);
        let out = DInode::decode(&buf).expect("decode");
        assert_eq!(out.data_fork.len(), 160);
        assert_eq!(out.attr_fork.len(), 512 - 176 - 160);
        assert_eq!(&out.attr_fork[..8], &[0xEE; 8]);
    }

    #[test]
    fn fork_format_bytes() {
        assert_eq!(ForkFormat::from_byte(0).unwrap(), ForkFormat::Dev);
        assert_eq!(ForkFormat::from_byte(1).unwrap(), ForkFormat::Local);
        assert_eq!(ForkFormat::from_byte(2).unwrap(), ForkFormat::Extents);
        assert_eq!(ForkFormat::from_byte(3).unwrap(), ForkFormat::Btree);
        assert!(ForkFormat::from_byte(9).is_err());
    }

    #[test]
    fn log_flags_compose() {
        let f = InodeLogFlags::CORE | InodeLogFlags::DDATA;
        assert!(f.contains(InodeLogFlags::CORE));
        assert!(f.contains(InodeLogFlags::DDATA));
        assert!(!f.contains(InodeLogFlags::DEV));
        assert!(InodeLogFlags::default().is_empty());
    }
}
