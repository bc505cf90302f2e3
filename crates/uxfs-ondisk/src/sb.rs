//! Superblock codec and mount-time validation.

use crate::cksum;
use uuid::Uuid;
use uxfs_types::{
    read_be_u16, read_be_u32, read_be_u64, read_fixed, read_u8, write_be_u16, write_be_u32,
    write_be_u64, Geometry, InodeNumber, ParseError, XFS_SB_MAGIC,
};

/// Offset of the V5 superblock CRC field.
pub const SB_CRC_OFF: usize = 224;

/// `sb_versionnum` low-nibble values we accept.
const SB_VERSION_4: u16 = 4;
const SB_VERSION_5: u16 = 5;

/// `sb_versionnum` bit: `sb_features2` is valid (V4).
const SB_VERSION_MOREBITS: u16 = 0x8000;
/// `sb_features2` bit: directory entries carry a file-type byte (V4).
const SB_VERSION2_FTYPE: u32 = 0x0200;

/// `sb_features_incompat` bits (V5).
pub const SB_FEAT_INCOMPAT_FTYPE: u32 = 0x1;
pub const SB_FEAT_INCOMPAT_SPINODES: u32 = 0x2;
pub const SB_FEAT_INCOMPAT_META_UUID: u32 = 0x4;

/// Incompat bits this engine understands; anything else refuses to mount.
const SB_FEAT_INCOMPAT_SUPPORTED: u32 =
    SB_FEAT_INCOMPAT_FTYPE | SB_FEAT_INCOMPAT_SPINODES | SB_FEAT_INCOMPAT_META_UUID;

/// Reasons a superblock is rejected at mount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SbError {
    #[error("bad superblock magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported superblock version {0}")]
    BadVersion(u16),
    #[error("filesystem has in-progress flag set (unfinished mkfs)")]
    InProgress,
    #[error("filesystem has an external log")]
    ExternalLog,
    #[error("filesystem has a real-time section")]
    RealtimeSection,
    #[error("unsupported incompatible features {0:#x}")]
    UnsupportedFeatures(u32),
    #[error("superblock checksum mismatch")]
    BadCrc,
    #[error("invalid geometry field {field}: {reason}")]
    BadGeometry {
        field: &'static str,
        reason: &'static str,
    },
    #[error("superblock parse failed: {0}")]
    Parse(#[from] ParseError),
}

/// Per-mount format summary handed to the allocator, directory and extent
/// layers: geometry plus the feature bits they branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsMeta {
    pub geo: Geometry,
    pub v5: bool,
    pub has_ftype: bool,
    pub sparse_inodes: bool,
    /// Inode chunk alignment in blocks.
    pub inode_align: u32,
    pub uuid: Uuid,
    pub rootino: InodeNumber,
}

/// Decoded superblock. Field names mirror the on-disk `sb_*` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub blocksize: u32,
    pub dblocks: u64,
    pub rextents: u64,
    pub uuid: Uuid,
    pub logstart: u64,
    pub rootino: InodeNumber,
    pub rextsize: u32,
    pub agblocks: u32,
    pub agcount: u32,
    pub logblocks: u32,
    pub versionnum: u16,
    pub sectsize: u16,
    pub inodesize: u16,
    pub inopblock: u16,
    pub fname: [u8; 12],
    pub blocklog: u8,
    pub sectlog: u8,
    pub inodelog: u8,
    pub inopblog: u8,
    pub agblklog: u8,
    pub inprogress: u8,
    pub imax_pct: u8,
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
    pub inoalignmt: u32,
    pub dirblklog: u8,
    pub features2: u32,
    pub features_compat: u32,
    pub features_ro_compat: u32,
    pub features_incompat: u32,
    pub features_log_incompat: u32,
    pub meta_uuid: Uuid,
}

impl Superblock {
    /// Decode a superblock from the first sector, without validation.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            blocksize: read_be_u32(buf, 4)?,
            dblocks: read_be_u64(buf, 8)?,
            rextents: read_be_u64(buf, 24)?,
            uuid: Uuid::from_bytes(read_fixed::<16>(buf, 32)?),
            logstart: read_be_u64(buf, 48)?,
            rootino: InodeNumber(read_be_u64(buf, 56)?),
            rextsize: read_be_u32(buf, 80)?,
            agblocks: read_be_u32(buf, 84)?,
            agcount: read_be_u32(buf, 88)?,
            logblocks: read_be_u32(buf, 96)?,
            versionnum: read_be_u16(buf, 100)?,
            sectsize: read_be_u16(buf, 102)?,
            inodesize: read_be_u16(buf, 104)?,
            inopblock: read_be_u16(buf, 106)?,
            fname: read_fixed::<12>(buf, 108)?,
            blocklog: read_u8(buf, 120)?,
            sectlog: read_u8(buf, 121)?,
            inodelog: read_u8(buf, 122)?,
            inopblog: read_u8(buf, 123)?,
            agblklog: read_u8(buf, 124)?,
            inprogress: read_u8(buf, 126)?,
            imax_pct: read_u8(buf, 127)?,
            icount: read_be_u64(buf, 128)?,
            ifree: read_be_u64(buf, 136)?,
            fdblocks: read_be_u64(buf, 144)?,
            inoalignmt: read_be_u32(buf, 180)?,
            dirblklog: read_u8(buf, 192)?,
            features2: read_be_u32(buf, 200)?,
            features_compat: read_be_u32(buf, 208)?,
            features_ro_compat: read_be_u32(buf, 212)?,
            features_incompat: read_be_u32(buf, 216)?,
            features_log_incompat: read_be_u32(buf, 220)?,
            meta_uuid: Uuid::from_bytes(read_fixed::<16>(buf, 248)?),
        })
    }

    /// Decode and run the full mount-time validation ladder.
    pub fn decode_validated(buf: &[u8]) -> Result<Self, SbError> {
        let magic = read_be_u32(buf, 0)?;
        if magic != XFS_SB_MAGIC {
            return Err(SbError::BadMagic(magic));
        }

        let sb = Self::decode(buf)?;

        let version = sb.versionnum & 0xF;
        if version != SB_VERSION_4 && version != SB_VERSION_5 {
            return Err(SbError::BadVersion(version));
        }
        if sb.inprogress != 0 {
            return Err(SbError::InProgress);
        }
        if sb.logstart == 0 {
            return Err(SbError::ExternalLog);
        }
        if sb.rextents != 0 {
            return Err(SbError::RealtimeSection);
        }
        if sb.is_v5() {
            let unknown = sb.features_incompat & !SB_FEAT_INCOMPAT_SUPPORTED;
            if unknown != 0 {
                return Err(SbError::UnsupportedFeatures(unknown));
            }
            if !cksum::verify_cksum(buf, SB_CRC_OFF) {
                return Err(SbError::BadCrc);
            }
        }

        if !sb.blocksize.is_power_of_two() || !(512..=65536).contains(&sb.blocksize) {
            return Err(SbError::BadGeometry {
                field: "blocksize",
                reason: "must be a power of two in 512..=65536",
            });
        }
        if sb.blocksize != 1 << sb.blocklog {
            return Err(SbError::BadGeometry {
                field: "blocklog",
                reason: "does not match blocksize",
            });
        }
        if sb.inodesize != 1 << sb.inodelog || sb.inopblock != 1 << sb.inopblog {
            return Err(SbError::BadGeometry {
                field: "inodelog",
                reason: "inode size/count logs inconsistent",
            });
        }
        if sb.agcount == 0 || sb.agblocks == 0 {
            return Err(SbError::BadGeometry {
                field: "agcount",
                reason: "zero allocation groups",
            });
        }

        Ok(sb)
    }

    /// Re-encode into a sector-sized buffer, refreshing the V5 CRC.
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        write_be_u32(buf, 0, XFS_SB_MAGIC);
        write_be_u32(buf, 4, self.blocksize);
        write_be_u64(buf, 8, self.dblocks);
        write_be_u64(buf, 24, self.rextents);
        buf[32..48].copy_from_slice(self.uuid.as_bytes());
        write_be_u64(buf, 48, self.logstart);
        write_be_u64(buf, 56, self.rootino.0);
        write_be_u32(buf, 80, self.rextsize);
        write_be_u32(buf, 84, self.agblocks);
        write_be_u32(buf, 88, self.agcount);
        write_be_u32(buf, 96, self.logblocks);
        write_be_u16(buf, 100, self.versionnum);
        write_be_u16(buf, 102, self.sectsize);
        write_be_u16(buf, 104, self.inodesize);
        write_be_u16(buf, 106, self.inopblock);
        buf[108..120].copy_from_slice(&self.fname);
        buf[120] = self.blocklog;
        buf[121] = self.sectlog;
        buf[122] = self.inodelog;
        buf[123] = self.inopblog;
        buf[124] = self.agblklog;
        buf[126] = self.inprogress;
        buf[127] = self.imax_pct;
        write_be_u64(buf, 128, self.icount);
        write_be_u64(buf, 136, self.ifree);
        write_be_u64(buf, 144, self.fdblocks);
        write_be_u32(buf, 180, self.inoalignmt);
        buf[192] = self.dirblklog;
        write_be_u32(buf, 200, self.features2);
        write_be_u32(buf, 208, self.features_compat);
        write_be_u32(buf, 212, self.features_ro_compat);
        write_be_u32(buf, 216, self.features_incompat);
        write_be_u32(buf, 220, self.features_log_incompat);
        buf[248..264].copy_from_slice(self.meta_uuid.as_bytes());
        if self.is_v5() {
            cksum::update_cksum(buf, SB_CRC_OFF);
        }
    }

    #[must_use]
    pub fn is_v5(&self) -> bool {
        self.versionnum & 0xF == SB_VERSION_5
    }

    /// Whether metadata blocks carry CRCs.
    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.is_v5()
    }

    /// Whether directory entries carry a one-byte file-type tag.
    #[must_use]
    pub fn has_ftype(&self) -> bool {
        if self.is_v5() {
            self.features_incompat & SB_FEAT_INCOMPAT_FTYPE != 0
        } else {
            self.versionnum & SB_VERSION_MOREBITS != 0
                && self.features2 & SB_VERSION2_FTYPE != 0
        }
    }

    /// UUID stamped into V5 metadata blocks.
    #[must_use]
    pub fn metadata_uuid(&self) -> Uuid {
        if self.is_v5() && self.features_incompat & SB_FEAT_INCOMPAT_META_UUID != 0 {
            self.meta_uuid
        } else {
            self.uuid
        }
    }

    /// Addressing geometry derived from the validated fields.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.blocksize,
            block_log: u32::from(self.blocklog),
            sector_size: u32::from(self.sectsize),
            ag_blocks: self.agblocks,
            ag_count: self.agcount,
            ag_blk_log: u32::from(self.agblklog),
            inode_size: u32::from(self.inodesize),
            inode_log: u32::from(self.inodelog),
            inodes_per_block: u32::from(self.inopblock),
            inopb_log: u32::from(self.inopblog),
            dir_blk_log: u32::from(self.dirblklog),
        }
    }

    /// Feature summary carried by the mount and passed to every layer.
    #[must_use]
    pub fn meta(&self) -> FsMeta {
        FsMeta {
            geo: self.geometry(),
            v5: self.is_v5(),
            has_ftype: self.has_ftype(),
            sparse_inodes: self.is_v5()
                && self.features_incompat & SB_FEAT_INCOMPAT_SPINODES != 0,
            inode_align: self.inoalignmt.max(1),
            uuid: self.metadata_uuid(),
            rootino: self.rootino,
        }
    }

    /// Upper bound on the inode count, from `sb_imax_pct`.
    #[must_use]
    pub fn max_inode_count(&self) -> u64 {
        if self.imax_pct == 0 {
            return u64::MAX;
        }
        let max_blocks = self.dblocks / 100 * u64::from(self.imax_pct);
        max_blocks << (u32::from(self.inopblog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sb() -> Superblock {
        Superblock {
            blocksize: 4096,
            dblocks: 16384,
            rextents: 0,
            uuid: Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10),
            logstart: 8192,
            rootino: InodeNumber(128),
            rextsize: 4,
            agblocks: 4096,
            agcount: 4,
            logblocks: 512,
            versionnum: 5 | 0x8000,
            sectsize: 512,
            inodesize: 512,
            inopblock: 8,
            fname: *b"uxfs\0\0\0\0\0\0\0\0",
            blocklog: 12,
            sectlog: 9,
            inodelog: 9,
            inopblog: 3,
            agblklog: 12,
            inprogress: 0,
            imax_pct: 25,
            icount: 64,
            ifree: 61,
            fdblocks: 15000,
            inoalignmt: 8,
            dirblklog: 0,
            features2: 0,
            features_compat: 0,
            features_ro_compat: 0,
            features_incompat: SB_FEAT_INCOMPAT_FTYPE,
            features_log_incompat: 0,
            meta_uuid: Uuid::nil(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let sb = test_sb();
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        let out = Superblock::decode_validated(&buf).expect("validated");
        assert_eq!(out, sb);
        assert!(out.is_v5());
        assert!(out.has_crc());
        assert!(out.has_ftype());
    }

    #[test]
    fn bad_magic_rejected() {
        let sb = test_sb();
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        buf[0] = b'E';
        assert!(matches!(
            Superblock::decode_validated(&buf),
            Err(SbError::BadMagic(_))
        ));
    }

    #[test]
    fn inprogress_rejected() {
        let mut sb = test_sb();
        sb.inprogress = 1;
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        assert_eq!(Superblock::decode_validated(&buf), Err(SbError::InProgress));
    }

    #[test]
    fn external_log_rejected() {
        let mut sb = test_sb();
        sb.logstart = 0;
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        assert_eq!(
            Superblock::decode_validated(&buf),
            Err(SbError::ExternalLog)
        );
    }

    #[test]
    fn realtime_section_rejected() {
        let mut sb = test_sb();
        sb.rextents = 100;
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        assert_eq!(
            Superblock::decode_validated(&buf),
            Err(SbError::RealtimeSection)
        );
    }

    #[test]
    fn unknown_incompat_rejected() {
        let mut sb = test_sb();
        sb.features_incompat |= 0x8; // bigtime, unsupported
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        assert_eq!(
            Superblock::decode_validated(&buf),
            Err(SbError::UnsupportedFeatures(0x8))
        );
    }

    #[test]
    fn crc_mismatch_rejected() {
        let sb = test_sb();
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        buf[130] ^= 0xFF; // corrupt icount without refreshing CRC
        assert_eq!(Superblock::decode_validated(&buf), Err(SbError::BadCrc));
    }

    #[test]
    fn v4_ftype_via_features2() {
        let mut sb = test_sb();
        sb.versionnum = 4 | 0x8000;
        sb.features_incompat = 0;
        sb.features2 = 0x0200;
        let mut buf = vec![0_u8; 512];
        sb.encode(&mut buf);
        let out = Superblock::decode_validated(&buf).expect("v4 mounts");
        assert!(!out.is_v5());
        assert!(!out.has_crc());
        assert!(out.has_ftype());
    }

    #[test]
    fn geometry_derivation() {
        let geo = test_sb().geometry();
        assert_eq!(geo.block_size, 4096);
        assert_eq!(geo.dir_block_size(), 4096);
        assert_eq!(geo.inodes_per_block, 8);
        assert_eq!(geo.ag_count, 4);
    }

    #[test]
    fn meta_uuid_falls_back_to_sb_uuid() {
        let sb = test_sb();
        assert_eq!(sb.metadata_uuid(), sb.uuid);
    }
}
