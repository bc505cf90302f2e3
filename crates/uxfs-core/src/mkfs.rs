//! Minimal image formatter.
//!
//! Lays down a mountable filesystem on a blank byte device: superblock,
//! per-AG headers with single-record free-space trees, an internal log
//! region, and a shortform root directory. Production volumes come from
//! the reference `mkfs.xfs`; this formatter exists for tests and tooling
//! that need a volume without shelling out.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use uxfs_block::{BufCache, ByteDevice};
use uxfs_error::{Result, XfsError};
use uxfs_inode::{init_inode, now, Fork, InodeCache};
use uxfs_ondisk::{sb::SB_FEAT_INCOMPAT_FTYPE, InodeLogFlags, Superblock};
use uxfs_trans::{TxKind, TxManager};
use uxfs_types::{AgNumber, DAddr, InodeNumber, TxId, S_IFDIR};

/// Formatting parameters; the defaults describe a small V5 test volume.
#[derive(Debug, Clone)]
pub struct MkfsParams {
    pub block_size: u32,
    pub ag_blocks: u32,
    pub ag_count: u32,
    pub inode_size: u16,
    pub log_blocks: u32,
    pub v5: bool,
    pub uuid: Uuid,
}

impl Default for MkfsParams {
    fn default() -> Self {
        Self {
            block_size: 4096,
            ag_blocks: 1024,
            ag_count: 2,
            inode_size: 512,
            log_blocks: 64,
            v5: true,
            uuid: Uuid::from_u128(0x7578_6673_2D74_6573_742D_766F_6C75_6D65),
        }
    }
}

/// Per-AG metadata placement: headers live in block 0, then the three
/// btree roots.
const BNO_ROOT: u32 = 1;
const CNT_ROOT: u32 = 2;
const INO_ROOT: u32 = 3;
const AG_RESERVED: u32 = 4;

/// Format `dev` and return the superblock that was written.
pub fn format(dev: &Arc<dyn ByteDevice>, params: &MkfsParams) -> Result<Superblock> {
    let p = params;
    if !p.block_size.is_power_of_two() || !p.inode_size.is_power_of_two() {
        return Err(XfsError::Invalid("block and inode sizes must be powers of two"));
    }
    let needed =
        u64::from(p.ag_blocks) * u64::from(p.ag_count) * u64::from(p.block_size);
    if dev.len_bytes() < needed {
        return Err(XfsError::Invalid("device too small for requested geometry"));
    }

    let inopblock = p.block_size / u32::from(p.inode_size);
    let mut sb = Superblock {
        blocksize: p.block_size,
        dblocks: u64::from(p.ag_blocks) * u64::from(p.ag_count),
        rextents: 0,
        uuid: p.uuid,
        logstart: u64::from(AG_RESERVED), // fsb in AG 0, right after the roots
        rootino: InodeNumber(0),          // patched after allocation
        rextsize: 4,
        agblocks: p.ag_blocks,
        agcount: p.ag_count,
        logblocks: p.log_blocks,
        versionnum: if p.v5 { 5 | 0x8000 } else { 4 | 0x8000 },
        sectsize: 512,
        inodesize: p.inode_size,
        inopblock: inopblock as u16,
        fname: *b"uxfs\0\0\0\0\0\0\0\0",
        blocklog: p.block_size.trailing_zeros() as u8,
        sectlog: 9,
        inodelog: p.inode_size.trailing_zeros() as u8,
        inopblog: inopblock.trailing_zeros() as u8,
        agblklog: (32 - (p.ag_blocks - 1).leading_zeros()) as u8,
        inprogress: 0,
        imax_pct: 25,
        icount: 0,
        ifree: 0,
        fdblocks: 0,
        inoalignmt: (64 / inopblock).max(1),
        dirblklog: 0,
        features2: if p.v5 { 0 } else { 0x0200 }, // V4 keeps FTYPE via features2
        features_compat: 0,
        features_ro_compat: 0,
        features_incompat: if p.v5 { SB_FEAT_INCOMPAT_FTYPE } else { 0 },
        features_log_incompat: 0,
        meta_uuid: Uuid::nil(),
    };

    let fs = sb.meta();
    let cache = BufCache::new(Arc::clone(dev));

    // AG 0 additionally reserves the internal log region.
    for agno in 0..p.ag_count {
        let reserved = if agno == 0 {
            AG_RESERVED + p.log_blocks
        } else {
            AG_RESERVED
        };
        uxfs_alloc::format_ag(
            &cache,
            &fs,
            AgNumber(agno),
            p.ag_blocks,
            BNO_ROOT,
            CNT_ROOT,
            INO_ROOT,
            reserved,
        )?;
    }
    let mut fdblocks = 0_u64;
    for agno in 0..p.ag_count {
        fdblocks += uxfs_alloc::ag_free_blocks(&cache, &fs, AgNumber(agno))?;
    }

    // Root directory: allocate the first inode chunk and point the root
    // at a shortform self-parented directory.
    let txmgr = TxManager::new(p.block_size, p.log_blocks);
    let icache = InodeCache::new();
    let mut tx = txmgr.begin_reserved(TxKind::Mkdir, 0)?;
    let rootino = uxfs_alloc::alloc_inode(&mut tx, &cache, &fs, AgNumber(0), true)?;

    let mut root = init_inode(
        p.v5,
        fs.uuid,
        rootino,
        S_IFDIR | 0o755,
        2,
        0,
        0,
        0,
        now(),
    );
    let sf = uxfs_dir::init_shortform(&fs, rootino);
    root.core.size = sf.len() as u64;
    root.data_fork = Fork::Local(sf);
    let root_inode = icache.install_new(rootino, root);
    tx.join_inode(&root_inode)?;
    tx.log_inode(&root_inode, InodeLogFlags::CORE | InodeLogFlags::DDATA)?;
    let delta = tx
        .commit(&cache, &fs.geo)
        .map_err(|e| XfsError::Format(format!("mkfs root commit failed: {e}")))?;

    sb.rootino = rootino;
    sb.icount = u64::try_from(delta.icount).unwrap_or(0);
    sb.ifree = u64::try_from(delta.ifree.max(0)).unwrap_or(0);
    sb.fdblocks = fdblocks.wrapping_add_signed(delta.fdblocks);

    // Primary superblock in sector 0.
    let sb_buf = cache.get_uninit(DAddr(0), 512);
    let stamp = TxId(u64::MAX);
    sb_buf.pin(stamp)?;
    {
        let mut data = sb_buf.data_mut();
        sb.encode(&mut data);
    }
    sb_buf.log_range(stamp, 0, 511)?;
    sb_buf.unpin_keep();
    cache.write_back(&sb_buf)?;
    cache.flush()?;

    info!(
        target: "uxfs::mkfs",
        event = "formatted",
        blocks = sb.dblocks,
        rootino = sb.rootino.0,
        fdblocks = sb.fdblocks
    );
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mount, MountOptions};
    use uxfs_block::MemByteDevice;

    fn test_dev() -> Arc<dyn ByteDevice> {
        Arc::new(MemByteDevice::new(2 * 1024 * 4096))
    }

    #[test]
    fn format_then_mount() {
        let dev = test_dev();
        let sb = format(&dev, &MkfsParams::default()).expect("format");
        assert!(sb.is_v5());
        assert!(sb.has_ftype());
        assert_eq!(sb.icount, 64);
        assert_eq!(sb.ifree, 63);

        let mount = Mount::open_device(dev, &MountOptions { read_only: false }).expect("mount");
        let root = mount.stat(b"/").expect("stat root");
        assert_eq!(root.ino, sb.rootino);
        assert_eq!(root.mode & uxfs_types::S_IFMT, S_IFDIR);
        assert_eq!(root.nlink, 2);
        mount.check_counters().expect("counters consistent");
        mount.unmount().unwrap();
    }

    #[test]
    fn format_v4_then_mount() {
        let dev = test_dev();
        let sb = format(
            &dev,
            &MkfsParams {
                v5: false,
                ..MkfsParams::default()
            },
        )
        .expect("format v4");
        assert!(!sb.is_v5());
        assert!(sb.has_ftype());

        let mount = Mount::open_device(dev, &MountOptions::default()).expect("mount v4");
        assert!(mount.is_readonly());
        assert!(mount.stat(b"/").is_ok());
    }

    #[test]
    fn too_small_device_rejected() {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        assert!(format(&dev, &MkfsParams::default()).is_err());
    }
}
