#![forbid(unsafe_code)]
//! Mount state and the namespace API.
//!
//! A [`Mount`] owns the buffer cache, the inode cache and the decoded
//! superblock for one backing store, and exposes the operations a mount
//! daemon consumes: path lookup, stat, readdir, read/readlink on the read
//! side; create/mkdir/unlink/rmdir/rename/link/symlink/setattr/truncate/
//! write on the write side (in [`ops`]).
//!
//! Writers serialize through the mount-wide lock; readers share it. Every
//! mutation runs under a transaction committed with immediate write-back,
//! so `fsync` has nothing left to push except the device cache.

mod ops;
pub mod mkfs;

pub use ops::TimeUpdate;

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uxfs_block::{BufCache, ByteDevice, FileByteDevice};
use uxfs_dir::DirEntry;
use uxfs_error::{Result, XfsError};
use uxfs_inode::{Fork, Inode, InodeCache};
use uxfs_ondisk::{FsMeta, Superblock, SymlinkHdr, SYMLINK_HDR_SIZE};
use uxfs_trans::{SbDelta, TxManager};
use uxfs_types::{FileBlock, InodeNumber, Timestamp, BBSHIFT, MAX_NAME_LEN};

pub use uxfs_error::XfsError as Error;
pub use uxfs_types::FileType;

/// Mount policy knobs.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Refuse all mutations when set (the default).
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { read_only: true }
    }
}

/// POSIX-shaped attributes returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: InodeNumber,
    pub mode: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Allocated blocks in 512-byte units.
    pub blocks: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
    pub rdev: u32,
    pub blksize: u32,
    pub gen: u32,
}

/// Filesystem-wide statistics (`statvfs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Consecutive commit-path write failures that flip the mount into
/// read-only-degraded mode.
const DEGRADE_THRESHOLD: u32 = 3;

/// A mounted filesystem.
pub struct Mount {
    cache: BufCache,
    icache: InodeCache,
    txmgr: TxManager,
    fs: FsMeta,
    sb: Mutex<Superblock>,
    read_only: bool,
    degraded: AtomicBool,
    write_failures: AtomicU32,
    unmounted: AtomicBool,
    /// Single-writer discipline: writers take it exclusively, readers share.
    op_lock: RwLock<()>,
    /// Credentials stamped onto newly created inodes.
    uid: u32,
    gid: u32,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("read_only", &self.read_only)
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .field("rootino", &self.fs.rootino)
            .finish()
    }
}

impl Mount {
    /// Mount a filesystem image or block device by path.
    pub fn open(source: impl AsRef<Path>, options: &MountOptions) -> Result<Arc<Self>> {
        let dev = FileByteDevice::open(source.as_ref())?;
        if !options.read_only && !dev.writable() {
            return Err(XfsError::ReadOnly);
        }
        Self::open_device(Arc::new(dev), options)
    }

    /// Mount over an already-open byte device.
    pub fn open_device(dev: Arc<dyn ByteDevice>, options: &MountOptions) -> Result<Arc<Self>> {
        let cache = BufCache::new(dev);

        // The superblock always fits the first 512-byte sector.
        let sb_buf = cache.get(uxfs_types::DAddr(0), 512)?;
        let mut sb = {
            let data = sb_buf.data();
            Superblock::decode_validated(&data)
                .map_err(|e| XfsError::Format(format!("superblock rejected: {e}")))?
        };
        let fs = sb.meta();

        let min_len = u64::from(sb.agcount) * u64::from(sb.agblocks) * u64::from(sb.blocksize);
        if cache.device().len_bytes() < min_len {
            return Err(XfsError::Format(format!(
                "device shorter than filesystem: {} < {min_len}",
                cache.device().len_bytes()
            )));
        }

        // The AG headers are authoritative after an unclean shutdown;
        // recompute the lazy counters from them instead of trusting the
        // possibly stale superblock copies.
        let mut fdblocks = 0_u64;
        let mut ifree = 0_u64;
        let mut icount = 0_u64;
        for agno in 0..fs.geo.ag_count {
            let ag = uxfs_types::AgNumber(agno);
            fdblocks += uxfs_alloc::ag_free_blocks(&cache, &fs, ag)?;
            ifree += uxfs_alloc::ag_free_inodes(&cache, &fs, ag)?;
            icount += uxfs_alloc::ag_inode_count(&cache, &fs, ag)?;
        }
        sb.fdblocks = fdblocks;
        sb.ifree = ifree;
        sb.icount = icount;

        let txmgr = TxManager::new(sb.blocksize, sb.logblocks);
        info!(
            target: "uxfs::mount",
            event = "mounted",
            v5 = fs.v5,
            ftype = fs.has_ftype,
            block_size = sb.blocksize,
            ag_count = sb.agcount,
            rootino = sb.rootino.0,
            read_only = options.read_only
        );

        let (uid, gid) = process_creds();
        let mount = Arc::new(Self {
            cache,
            icache: InodeCache::new(),
            txmgr,
            fs,
            sb: Mutex::new(sb),
            read_only: options.read_only,
            degraded: AtomicBool::new(false),
            write_failures: AtomicU32::new(0),
            unmounted: AtomicBool::new(false),
            op_lock: RwLock::new(()),
            uid,
            gid,
        });

        // The root inode must resolve for the mount to be usable.
        mount.iget(mount.fs.rootino)?;
        Ok(mount)
    }

    /// Flush everything and persist superblock counters; idempotent.
    pub fn unmount(&self) -> Result<()> {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _w = self.op_lock.write();

        if !self.read_only && !self.degraded.load(Ordering::Relaxed) {
            let sb = self.sb.lock();
            let buf = self.cache.get(uxfs_types::DAddr(0), 512)?;
            let tx_id = uxfs_types::TxId(u64::MAX - 1);
            buf.pin(tx_id)?;
            {
                let mut data = buf.data_mut();
                sb.encode(&mut data);
            }
            buf.log_range(tx_id, 0, 511)?;
            buf.unpin_keep();
            if let Err(e) = self.cache.write_back(&buf) {
                warn!(target: "uxfs::mount", event = "sb_flush_error", error = %e);
            }
        }

        // Best effort: a failed flush must not wedge unmount.
        if let Err(e) = self.cache.flush() {
            warn!(target: "uxfs::mount", event = "flush_error", error = %e);
        }
        debug!(target: "uxfs::mount", event = "unmounted");
        Ok(())
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.read_only || self.degraded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn features(&self) -> &FsMeta {
        &self.fs
    }

    pub(crate) fn cache(&self) -> &BufCache {
        &self.cache
    }

    pub(crate) fn txmgr(&self) -> &TxManager {
        &self.txmgr
    }

    pub(crate) fn credentials(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    /// Gate every mutating operation: `EROFS` first, per the contract.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(XfsError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn write_guard(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.op_lock.write()
    }

    fn read_guard(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.op_lock.read()
    }

    /// Apply a committed transaction's counter delta; track write health.
    pub(crate) fn apply_commit(&self, delta: SbDelta) {
        let mut sb = self.sb.lock();
        sb.fdblocks = sb.fdblocks.wrapping_add_signed(delta.fdblocks);
        sb.icount = sb.icount.wrapping_add_signed(delta.icount);
        sb.ifree = sb.ifree.wrapping_add_signed(delta.ifree);
        self.write_failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed commit; repeated failures degrade to read-only.
    pub(crate) fn note_write_failure(&self, err: &XfsError) {
        if matches!(err, XfsError::Io(_)) {
            let n = self.write_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= DEGRADE_THRESHOLD && !self.degraded.swap(true, Ordering::Relaxed) {
                warn!(
                    target: "uxfs::mount",
                    event = "degraded_readonly",
                    failures = n
                );
            }
        }
    }

    // ── Inode access ────────────────────────────────────────────────────────

    pub(crate) fn iget(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        self.icache.get(&self.cache, &self.fs.geo, self.fs.v5, ino)
    }

    pub(crate) fn icache(&self) -> &InodeCache {
        &self.icache
    }

    // ── Path resolution ─────────────────────────────────────────────────────

    /// Split an absolute path into components; empty components collapse.
    fn components(path: &[u8]) -> impl Iterator<Item = &[u8]> {
        path.split(|&b| b == b'/').filter(|c| !c.is_empty())
    }

    /// Walk from the root to the inode a path names.
    pub fn lookup_by_path(&self, path: &[u8]) -> Result<Arc<Inode>> {
        let _r = self.read_guard();
        self.resolve(path)
    }

    pub(crate) fn resolve(&self, path: &[u8]) -> Result<Arc<Inode>> {
        let mut current = self.iget(self.fs.rootino)?;
        for comp in Self::components(path) {
            if !current.is_dir() {
                return Err(XfsError::NotDirectory);
            }
            if comp.len() > MAX_NAME_LEN {
                return Err(XfsError::NameTooLong);
            }
            let next = uxfs_dir::lookup(&self.cache, &self.fs, &current, comp)?
                .ok_or_else(|| XfsError::NotFound(String::from_utf8_lossy(comp).into_owned()))?;
            current = self.iget(next)?;
        }
        Ok(current)
    }

    /// Resolve a path's parent directory and leaf name.
    pub(crate) fn lookup_parent(&self, path: &[u8]) -> Result<(Arc<Inode>, Vec<u8>)> {
        let comps: Vec<&[u8]> = Self::components(path).collect();
        let Some((leaf, parents)) = comps.split_last() else {
            return Err(XfsError::Invalid("path names the root"));
        };
        if leaf.len() > MAX_NAME_LEN {
            return Err(XfsError::NameTooLong);
        }

        let mut current = self.iget(self.fs.rootino)?;
        for comp in parents {
            if !current.is_dir() {
                return Err(XfsError::NotDirectory);
            }
            let next = uxfs_dir::lookup(&self.cache, &self.fs, &current, comp)?
                .ok_or_else(|| XfsError::NotFound(String::from_utf8_lossy(comp).into_owned()))?;
            current = self.iget(next)?;
        }
        if !current.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        Ok((current, leaf.to_vec()))
    }

    // ── Read-side operations ────────────────────────────────────────────────

    /// Attributes of the inode a path names.
    pub fn stat(&self, path: &[u8]) -> Result<FileAttr> {
        let _r = self.read_guard();
        let inode = self.resolve(path)?;
        Ok(self.attr_of(&inode))
    }

    pub(crate) fn attr_of(&self, inode: &Inode) -> FileAttr {
        let state = inode.read();
        let rdev = match &state.data_fork {
            Fork::Dev(d) => *d,
            _ => 0,
        };
        FileAttr {
            ino: inode.ino(),
            mode: state.core.mode,
            nlink: state.core.nlink,
            uid: state.core.uid,
            gid: state.core.gid,
            size: state.core.size,
            blocks: state.core.nblocks << (self.fs.geo.block_log - BBSHIFT),
            atime: state.core.atime,
            mtime: state.core.mtime,
            ctime: state.core.ctime,
            crtime: state.core.crtime,
            rdev,
            blksize: self.fs.geo.block_size,
            gen: state.core.gen,
        }
    }

    /// Filesystem statistics from the in-memory superblock counters.
    pub fn statvfs(&self) -> FsStat {
        let sb = self.sb.lock();
        FsStat {
            block_size: sb.blocksize,
            blocks: sb.dblocks,
            blocks_free: sb.fdblocks,
            files: sb.icount,
            files_free: sb.ifree,
            name_max: MAX_NAME_LEN as u32,
        }
    }

    /// List a directory from `cookie` (0 for the beginning).
    pub fn readdir(&self, path: &[u8], cookie: u64) -> Result<Vec<DirEntry>> {
        let _r = self.read_guard();
        let dir = self.resolve(path)?;
        uxfs_dir::iterate(&self.cache, &self.fs, &dir, cookie)
    }

    /// Read a symlink's target bytes.
    pub fn readlink(&self, path: &[u8]) -> Result<Vec<u8>> {
        let _r = self.read_guard();
        let inode = self.resolve(path)?;
        self.readlink_inode(&inode)
    }

    pub(crate) fn readlink_inode(&self, inode: &Inode) -> Result<Vec<u8>> {
        if !inode.is_symlink() {
            return Err(XfsError::Invalid("not a symlink"));
        }
        let state = inode.read();
        let size = usize::try_from(state.core.size)
            .map_err(|_| XfsError::Format("symlink size overflow".to_owned()))?;

        match &state.data_fork {
            Fork::Local(bytes) => Ok(bytes[..size.min(bytes.len())].to_vec()),
            fork @ (Fork::Extents(_) | Fork::Btree { .. }) => {
                let mut out = Vec::with_capacity(size);
                let bs = self.fs.geo.block_size as usize;
                let payload_per_block = if self.fs.v5 { bs - SYMLINK_HDR_SIZE } else { bs };
                let nblocks = size.div_ceil(payload_per_block);
                let maps = uxfs_extent::map_range(fork, FileBlock(0), nblocks as u64);
                for map in maps {
                    let Some(disk) = map.disk_block else {
                        return Err(XfsError::Corruption {
                            daddr: 0,
                            detail: "symlink body has a hole".to_owned(),
                        });
                    };
                    for i in 0..map.len {
                        let daddr = self.fs.geo.fsb_to_daddr(uxfs_types::FsBlock(disk.0 + i));
                        let buf = self.cache.get(daddr, bs)?;
                        let data = buf.data();
                        let chunk = if self.fs.v5 {
                            if !uxfs_ondisk::symlink::verify_symlink_crc(&data) {
                                return Err(XfsError::Corruption {
                                    daddr: daddr.0,
                                    detail: "symlink block checksum mismatch".to_owned(),
                                });
                            }
                            let hdr = SymlinkHdr::decode(&data)
                                .map_err(|e| XfsError::Format(e.to_string()))?;
                            let len = hdr.bytes as usize;
                            data[SYMLINK_HDR_SIZE..SYMLINK_HDR_SIZE + len].to_vec()
                        } else {
                            let remaining = size - out.len();
                            data[..remaining.min(bs)].to_vec()
                        };
                        out.extend_from_slice(&chunk);
                        if out.len() >= size {
                            break;
                        }
                    }
                }
                out.truncate(size);
                Ok(out)
            }
            Fork::Dev(_) => Err(XfsError::Format("symlink with device fork".to_owned())),
        }
    }

    /// Read up to `len` bytes of a regular file at `offset`.
    ///
    /// Holes and unwritten extents read as zeroes; the file size bounds the
    /// result.
    pub fn read(&self, path: &[u8], offset: u64, len: u32) -> Result<Vec<u8>> {
        let _r = self.read_guard();
        let inode = self.resolve(path)?;
        self.read_inode_data(&inode, offset, len)
    }

    pub(crate) fn read_inode_data(&self, inode: &Inode, offset: u64, len: u32) -> Result<Vec<u8>> {
        if !inode.is_reg() {
            return Err(XfsError::Invalid("read from non-regular file"));
        }
        let state = inode.read();
        let size = state.core.size;
        if offset >= size {
            return Ok(Vec::new());
        }
        let want = u64::from(len).min(size - offset);
        let want_usize = usize::try_from(want)
            .map_err(|_| XfsError::Format("read length overflow".to_owned()))?;
        let mut out = vec![0_u8; want_usize];

        let bs = u64::from(self.fs.geo.block_size);
        let first_fb = self.fs.geo.b_to_fsbt(offset).0;
        let last_fb = self.fs.geo.b_to_fsbt(offset + want - 1).0;
        let maps = uxfs_extent::map_range(
            &state.data_fork,
            FileBlock(first_fb),
            last_fb - first_fb + 1,
        );
        drop(state);

        for map in maps {
            let Some(disk) = map.disk_block else {
                continue; // hole reads as zeroes
            };
            if map.unwritten {
                continue;
            }
            for i in 0..map.len {
                let fb = map.file_block.0 + i;
                let block_start = fb * bs;
                let block_end = block_start + bs;
                let copy_start = block_start.max(offset);
                let copy_end = block_end.min(offset + want);
                if copy_start >= copy_end {
                    continue;
                }
                let daddr = self
                    .fs
                    .geo
                    .fsb_to_daddr(uxfs_types::FsBlock(disk.0 + i));
                let buf = self.cache.get(daddr, bs as usize)?;
                let data = buf.data();
                let src_off = (copy_start - block_start) as usize;
                let dst_off = (copy_start - offset) as usize;
                let n = (copy_end - copy_start) as usize;
                out[dst_off..dst_off + n].copy_from_slice(&data[src_off..src_off + n]);
            }
        }
        Ok(out)
    }

    /// Persist outstanding state for one file.
    ///
    /// Commits write back immediately, so only the device cache remains.
    pub fn fsync(&self, path: &[u8]) -> Result<()> {
        let _r = self.read_guard();
        let _inode = self.resolve(path)?;
        self.cache.device().sync()
    }

    /// Persist all outstanding state.
    pub fn sync(&self) -> Result<()> {
        let _r = self.read_guard();
        self.cache.flush()
    }

    // ── Invariant probes (used by tests and tooling) ────────────────────────

    /// Verify the AG counters against the superblock counters.
    pub fn check_counters(&self) -> Result<()> {
        let mut free_blocks = 0_u64;
        let mut free_inodes = 0_u64;
        for agno in 0..self.fs.geo.ag_count {
            free_blocks +=
                uxfs_alloc::ag_free_blocks(&self.cache, &self.fs, uxfs_types::AgNumber(agno))?;
            free_inodes +=
                uxfs_alloc::ag_free_inodes(&self.cache, &self.fs, uxfs_types::AgNumber(agno))?;
        }
        let sb = self.sb.lock();
        if free_blocks != sb.fdblocks {
            return Err(XfsError::Corruption {
                daddr: 0,
                detail: format!(
                    "free block counter drift: AGs say {free_blocks}, superblock says {}",
                    sb.fdblocks
                ),
            });
        }
        if free_inodes != sb.ifree {
            return Err(XfsError::Corruption {
                daddr: 0,
                detail: format!(
                    "free inode counter drift: AGs say {free_inodes}, superblock says {}",
                    sb.ifree
                ),
            });
        }
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !self.unmounted.load(Ordering::Relaxed) {
            let _ = self.unmount();
        }
    }
}

/// Credentials stamped onto newly created inodes: the daemon process's
/// own uid/gid, read without an FFI call.
fn process_creds() -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|m| (m.uid(), m.gid()))
        .unwrap_or((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_split() {
        let comps: Vec<&[u8]> = Mount::components(b"/a/b/c").collect();
        assert_eq!(comps, vec![b"a".as_slice(), b"b", b"c"]);
        let comps: Vec<&[u8]> = Mount::components(b"//x//y/").collect();
        assert_eq!(comps, vec![b"x".as_slice(), b"y"]);
        assert_eq!(Mount::components(b"/").count(), 0);
        assert_eq!(Mount::components(b"").count(), 0);
    }

    #[test]
    fn mount_options_default_read_only() {
        assert!(MountOptions::default().read_only);
    }
}
