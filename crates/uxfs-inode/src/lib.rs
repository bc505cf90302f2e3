#![forbid(unsafe_code)]
//! Inode management.
//!
//! In-core inodes mirror the on-disk core plus decoded forks. The cache
//! maps inode numbers to shared handles; callers own strong references and
//! the cache keeps a weak backing set, so an inode's identity survives
//! exactly as long as someone references it. Mutation happens only under a
//! transaction: pin, modify, log, then commit re-encodes the inode into its
//! cluster buffer.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};
use uuid::Uuid;
use uxfs_block::BufCache;
use uxfs_error::{Result, XfsError};
use uxfs_ondisk::btree::{self, LongBtreeHdr};
use uxfs_ondisk::{DInode, DiCore, ExtentRec, ForkFormat, InodeLogFlags};
use uxfs_types::{
    read_be_u16, read_be_u32, read_be_u64, write_be_u16, write_be_u64, FsBlock, Geometry,
    InodeNumber, Timestamp, TxId, NULL_AGINO,
};

pub mod xattr;

// ── Forks ───────────────────────────────────────────────────────────────────

/// Decoded per-fork state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fork {
    /// Device number of a character or block special file.
    Dev(u32),
    /// Inline bytes: small directory, short symlink, tiny attr list.
    Local(Vec<u8>),
    /// Ordered extent records held inline in the inode.
    Extents(Vec<ExtentRec>),
    /// Extent records materialized from a bmap btree; `leaves` are the
    /// on-disk leaf blocks backing them, in key order.
    Btree {
        extents: Vec<ExtentRec>,
        leaves: Vec<FsBlock>,
    },
}

impl Fork {
    #[must_use]
    pub fn format(&self) -> ForkFormat {
        match self {
            Self::Dev(_) => ForkFormat::Dev,
            Self::Local(_) => ForkFormat::Local,
            Self::Extents(_) => ForkFormat::Extents,
            Self::Btree { .. } => ForkFormat::Btree,
        }
    }

    /// The extent list, for either mapped format.
    #[must_use]
    pub fn extents(&self) -> &[ExtentRec] {
        match self {
            Self::Extents(recs) | Self::Btree { extents: recs, .. } => recs,
            _ => &[],
        }
    }

    #[must_use]
    pub fn local_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Local(bytes) => Some(bytes),
            _ => None,
        }
    }
}

// ── In-core inode ───────────────────────────────────────────────────────────

/// Mutable inode state guarded inside [`Inode`].
#[derive(Debug, Clone)]
pub struct InodeState {
    pub core: DiCore,
    pub next_unlinked: u32,
    pub data_fork: Fork,
    pub attr_fork: Option<Fork>,
}

#[derive(Debug)]
struct InodePin {
    tx: TxId,
    snapshot: InodeState,
    log_flags: InodeLogFlags,
}

/// A cached in-core inode.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    state: RwLock<InodeState>,
    pin: Mutex<Option<InodePin>>,
}

impl Inode {
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn read(&self) -> RwLockReadGuard<'_, InodeState> {
        self.state.read()
    }

    /// Mutable access; callers hold a pin on this inode's transaction.
    #[must_use]
    pub fn write(&self) -> RwLockWriteGuard<'_, InodeState> {
        self.state.write()
    }

    #[must_use]
    pub fn mode(&self) -> u16 {
        self.state.read().core.mode
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        uxfs_types::is_dir(self.mode())
    }

    #[must_use]
    pub fn is_reg(&self) -> bool {
        uxfs_types::is_reg(self.mode())
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        uxfs_types::is_symlink(self.mode())
    }

    /// Pin to a transaction, snapshotting for abort. Re-pinning by the
    /// same transaction is a no-op.
    pub fn pin(&self, tx: TxId) -> Result<()> {
        let mut pin = self.pin.lock();
        match pin.as_ref() {
            Some(p) if p.tx != tx => Err(XfsError::Format(format!(
                "inode {} already joined to tx {}",
                self.ino, p.tx.0
            ))),
            Some(_) => Ok(()),
            None => {
                *pin = Some(InodePin {
                    tx,
                    snapshot: self.state.read().clone(),
                    log_flags: InodeLogFlags::default(),
                });
                trace!(target: "uxfs::inode", event = "inode_pin", ino = self.ino.0, tx = tx.0);
                Ok(())
            }
        }
    }

    /// Record dirtied field classes for the pinning transaction.
    pub fn log(&self, tx: TxId, flags: InodeLogFlags) -> Result<()> {
        let mut pin = self.pin.lock();
        match pin.as_mut() {
            Some(p) if p.tx == tx => {
                p.log_flags |= flags;
                Ok(())
            }
            _ => Err(XfsError::Format(format!(
                "inode {} logged without a pin from tx {}",
                self.ino, tx.0
            ))),
        }
    }

    /// Dirty flags accumulated under the current pin.
    #[must_use]
    pub fn log_flags(&self) -> InodeLogFlags {
        self.pin.lock().as_ref().map_or_else(InodeLogFlags::default, |p| p.log_flags)
    }

    #[must_use]
    pub fn pinned_by(&self) -> Option<TxId> {
        self.pin.lock().as_ref().map(|p| p.tx)
    }

    /// Commit path: drop the pin, keep the mutated state.
    pub fn unpin_keep(&self) {
        *self.pin.lock() = None;
    }

    /// Abort path: restore the pre-pin state and drop the pin.
    pub fn unpin_revert(&self) {
        if let Some(p) = self.pin.lock().take() {
            *self.state.write() = p.snapshot;
        }
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// Wall-clock timestamp, clamped to the classic on-disk range.
#[must_use]
pub fn now() -> Timestamp {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        sec: u32::try_from(dur.as_secs()).unwrap_or(u32::MAX),
        nsec: dur.subsec_nanos(),
    }
}

/// Touch ctime only (chmod, chown, link count changes).
pub fn touch_ctime(core: &mut DiCore, ts: Timestamp) {
    core.ctime = ts;
    bump_changecount(core);
}

/// Touch mtime and ctime (content mutations).
pub fn touch_mtime_ctime(core: &mut DiCore, ts: Timestamp) {
    core.mtime = ts;
    core.ctime = ts;
    bump_changecount(core);
}

pub fn touch_atime(core: &mut DiCore, ts: Timestamp) {
    core.atime = ts;
}

fn bump_changecount(core: &mut DiCore) {
    if core.version >= 3 {
        core.changecount = core.changecount.wrapping_add(1);
    }
}

// ── Fork decode / encode ────────────────────────────────────────────────────

/// Decode a fork from its raw inline bytes.
///
/// Btree-format forks are materialized by walking the bmap tree through the
/// buffer cache; the leaf list is retained so a later rewrite can free the
/// old blocks.
pub fn decode_fork(
    cache: &BufCache,
    geo: &Geometry,
    format: ForkFormat,
    raw: &[u8],
    nextents: usize,
    size_hint: u64,
) -> Result<Fork> {
    match format {
        ForkFormat::Dev => {
            let dev = read_be_u32(raw, 0).map_err(to_format_err)?;
            Ok(Fork::Dev(dev))
        }
        ForkFormat::Local => {
            let len = usize::try_from(size_hint)
                .unwrap_or(raw.len())
                .min(raw.len());
            Ok(Fork::Local(raw[..len].to_vec()))
        }
        ForkFormat::Extents => {
            let recs = ExtentRec::decode_list(raw, nextents).map_err(to_format_err)?;
            check_extent_order(&recs)?;
            Ok(Fork::Extents(recs))
        }
        ForkFormat::Btree => {
            let (extents, leaves) = walk_bmap_root(cache, geo, raw)?;
            check_extent_order(&extents)?;
            Ok(Fork::Btree { extents, leaves })
        }
    }
}

fn to_format_err(e: uxfs_types::ParseError) -> XfsError {
    XfsError::Format(e.to_string())
}

/// Extent lists must be strictly increasing by file offset with no overlap.
fn check_extent_order(recs: &[ExtentRec]) -> Result<()> {
    for pair in recs.windows(2) {
        if pair[1].startoff.0 < pair[0].end_off() {
            return Err(XfsError::Format(
                "extent records out of order or overlapping".to_owned(),
            ));
        }
    }
    Ok(())
}

/// Walk an inline bmdr root and collect all leaf extent records.
fn walk_bmap_root(
    cache: &BufCache,
    geo: &Geometry,
    raw: &[u8],
) -> Result<(Vec<ExtentRec>, Vec<FsBlock>)> {
    let level = read_be_u16(raw, 0).map_err(to_format_err)?;
    let numrecs = usize::from(read_be_u16(raw, 2).map_err(to_format_err)?);
    if level == 0 {
        return Err(XfsError::Format("bmap root with level 0".to_owned()));
    }

    // Root keys at 4, pointers at 4 + maxrecs * 8.
    let maxrecs = (raw.len() - 4) / 16;
    if numrecs > maxrecs {
        return Err(XfsError::Format("bmap root numrecs exceeds space".to_owned()));
    }
    let ptr_base = 4 + maxrecs * 8;

    let mut extents = Vec::new();
    let mut leaves = Vec::new();
    for i in 0..numrecs {
        let ptr = read_be_u64(raw, ptr_base + i * 8).map_err(to_format_err)?;
        walk_bmap_block(cache, geo, FsBlock(ptr), level - 1, &mut extents, &mut leaves, 0)?;
    }
    Ok((extents, leaves))
}

const MAX_BMAP_DEPTH: u32 = 8;

fn walk_bmap_block(
    cache: &BufCache,
    geo: &Geometry,
    fsb: FsBlock,
    level: u16,
    extents: &mut Vec<ExtentRec>,
    leaves: &mut Vec<FsBlock>,
    depth: u32,
) -> Result<()> {
    if depth > MAX_BMAP_DEPTH {
        return Err(XfsError::Format("bmap tree too deep".to_owned()));
    }

    let daddr = geo.fsb_to_daddr(fsb);
    let buf = cache.get(daddr, geo.block_size as usize)?;
    let data = buf.data();

    if !btree::verify_long_crc(&data) {
        return Err(XfsError::Corruption {
            daddr: daddr.0,
            detail: "bmap block checksum mismatch".to_owned(),
        });
    }
    let hdr = LongBtreeHdr::decode(&data).map_err(to_format_err)?;
    if hdr.magic != btree::BMAP_MAGIC && hdr.magic != btree::BMAP_CRC_MAGIC {
        return Err(XfsError::Corruption {
            daddr: daddr.0,
            detail: format!("bad bmap magic {:#x}", hdr.magic),
        });
    }
    if hdr.level != level {
        return Err(XfsError::Corruption {
            daddr: daddr.0,
            detail: "bmap level mismatch".to_owned(),
        });
    }

    let hdr_size = LongBtreeHdr::hdr_size(hdr.magic);
    if level == 0 {
        leaves.push(fsb);
        for i in 0..usize::from(hdr.numrecs) {
            extents.push(
                ExtentRec::decode(&data, hdr_size + i * 16).map_err(to_format_err)?,
            );
        }
        return Ok(());
    }

    // Interior node: keys then pointers, split at maxrecs. Collect the
    // child pointers first so this block's guard is released before
    // descending.
    let maxrecs = (data.len() - hdr_size) / 16;
    let ptr_base = hdr_size + maxrecs * 8;
    let mut children = Vec::with_capacity(usize::from(hdr.numrecs));
    for i in 0..usize::from(hdr.numrecs) {
        children.push(read_be_u64(&data, ptr_base + i * 8).map_err(to_format_err)?);
    }
    drop(data);

    for ptr in children {
        walk_bmap_block(cache, geo, FsBlock(ptr), level - 1, extents, leaves, depth + 1)?;
    }
    Ok(())
}

/// Encode a fork back into inline bytes for the inode's literal area.
///
/// For btree forks this produces the bmdr root; leaf blocks are written by
/// the extent layer when the mapping changes.
#[must_use]
pub fn encode_fork(fork: &Fork, region_size: usize) -> Vec<u8> {
    match fork {
        Fork::Dev(dev) => {
            let mut out = vec![0_u8; 4];
            uxfs_types::write_be_u32(&mut out, 0, *dev);
            out
        }
        Fork::Local(bytes) => bytes.clone(),
        Fork::Extents(recs) => ExtentRec::encode_list(recs),
        Fork::Btree { extents, leaves } => {
            let mut out = vec![0_u8; region_size];
            write_be_u16(&mut out, 0, 1); // level
            write_be_u16(&mut out, 2, leaves.len() as u16);
            let maxrecs = (region_size - 4) / 16;
            let ptr_base = 4 + maxrecs * 8;
            for (i, leaf) in leaves.iter().enumerate() {
                write_be_u64(&mut out, 4 + i * 8, leaf_first_key(extents, leaves, i));
                write_be_u64(&mut out, ptr_base + i * 8, leaf.0);
            }
            out
        }
    }
}

/// First file offset covered by leaf `idx`, assuming records are spread
/// evenly across the recorded leaves in key order.
fn leaf_first_key(extents: &[ExtentRec], leaves: &[FsBlock], idx: usize) -> u64 {
    if leaves.is_empty() || extents.is_empty() {
        return 0;
    }
    let per_leaf = extents.len().div_ceil(leaves.len());
    extents
        .get(idx * per_leaf)
        .map_or(0, |rec| rec.startoff.0)
}

// ── Cluster I/O ─────────────────────────────────────────────────────────────

/// Location of an inode within its cluster buffer.
#[derive(Debug, Clone, Copy)]
pub struct InodeLocation {
    pub daddr: uxfs_types::DAddr,
    pub buf_len: usize,
    pub byte_offset: usize,
}

/// Compute the buffer location of an inode.
#[must_use]
pub fn locate_inode(geo: &Geometry, ino: InodeNumber) -> InodeLocation {
    let agno = geo.ino_to_agno(ino);
    let agbno = geo.ino_to_agbno(ino);
    let offset = geo.ino_to_offset(ino);
    InodeLocation {
        daddr: geo.fsb_to_daddr(geo.ag_to_fsb(agno, agbno)),
        buf_len: geo.block_size as usize,
        byte_offset: (offset * geo.inode_size) as usize,
    }
}

/// Read and decode an inode, verifying the V5 CRC and identity.
pub fn read_inode(
    cache: &BufCache,
    geo: &Geometry,
    v5: bool,
    ino: InodeNumber,
) -> Result<InodeState> {
    let loc = locate_inode(geo, ino);
    let buf = cache.get(loc.daddr, loc.buf_len)?;
    let data = buf.data();
    let raw = &data[loc.byte_offset..loc.byte_offset + geo.inode_size as usize];

    if v5 && !DInode::verify_crc(raw) {
        return Err(XfsError::Corruption {
            daddr: loc.daddr.0,
            detail: format!("inode {ino} checksum mismatch"),
        });
    }

    let di = DInode::decode(raw).map_err(to_format_err)?;
    if di.core.version >= 3 && di.core.ino != ino.0 {
        return Err(XfsError::Corruption {
            daddr: loc.daddr.0,
            detail: format!("inode {ino} self-number mismatch ({})", di.core.ino),
        });
    }

    let inode_size = geo.inode_size as usize;
    let data_fork = decode_fork(
        cache,
        geo,
        di.core.format,
        &di.data_fork,
        di.core.nextents as usize,
        di.core.size,
    )?;
    let attr_fork = if di.core.forkoff != 0 {
        Some(decode_fork(
            cache,
            geo,
            di.core.aformat,
            &di.attr_fork,
            usize::from(di.core.anextents),
            di.core.attr_fork_size(inode_size) as u64,
        )?)
    } else {
        None
    };
    drop(data);

    Ok(InodeState {
        core: di.core,
        next_unlinked: di.next_unlinked,
        data_fork,
        attr_fork,
    })
}

/// Re-encode an in-core inode into its pinned cluster buffer.
///
/// The caller (transaction commit) pins the buffer first and refreshes
/// buffer CRCs afterwards; the inode's own V3 CRC is computed here.
pub fn flush_inode(
    cache: &BufCache,
    geo: &Geometry,
    tx: TxId,
    inode: &Inode,
) -> Result<uxfs_block::BufHandle> {
    let loc = locate_inode(geo, inode.ino());
    let buf = cache.get_pinned(tx, loc.daddr, loc.buf_len)?;
    let inode_size = geo.inode_size as usize;
    let state = inode.read();

    let mut core = state.core.clone();
    core.nextents = state.data_fork.extents().len() as u32;
    core.anextents = state
        .attr_fork
        .as_ref()
        .map_or(0, |f| f.extents().len() as u16);
    core.format = state.data_fork.format();
    if let Some(attr) = &state.attr_fork {
        core.aformat = attr.format();
    }

    let region = core.data_fork_size(inode_size);
    let di = DInode {
        data_fork: encode_fork(&state.data_fork, region),
        attr_fork: state
            .attr_fork
            .as_ref()
            .map(|f| encode_fork(f, core.attr_fork_size(inode_size)))
            .unwrap_or_default(),
        next_unlinked: state.next_unlinked,
        core,
    };
    drop(state);

    {
        let mut data = buf.data_mut();
        let slot = &mut data[loc.byte_offset..loc.byte_offset + inode_size];
        di.encode(slot);
    }
    buf.log_range(tx, loc.byte_offset, loc.byte_offset + inode_size - 1)?;
    trace!(target: "uxfs::inode", event = "inode_flush", ino = inode.ino().0, tx = tx.0);
    Ok(buf)
}

/// Initialize the in-core state of a newly allocated inode.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn init_inode(
    v5: bool,
    uuid: Uuid,
    ino: InodeNumber,
    mode: u16,
    nlink: u32,
    uid: u32,
    gid: u32,
    rdev: u32,
    ts: Timestamp,
) -> InodeState {
    let data_fork = if uxfs_types::is_chr(mode) || uxfs_types::is_blk(mode) {
        Fork::Dev(rdev)
    } else if uxfs_types::is_dir(mode) {
        Fork::Local(Vec::new())
    } else {
        Fork::Extents(Vec::new())
    };

    InodeState {
        core: DiCore {
            mode,
            version: if v5 { 3 } else { 2 },
            format: data_fork.format(),
            onlink: 0,
            uid,
            gid,
            nlink,
            projid: 0,
            flushiter: 0,
            atime: ts,
            mtime: ts,
            ctime: ts,
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
            crtime: ts,
            ino: ino.0,
            uuid,
        },
        next_unlinked: NULL_AGINO,
        data_fork,
        attr_fork: None,
    }
}

// ── Inode cache ─────────────────────────────────────────────────────────────

/// Weak-backed map from inode number to in-core inode.
pub struct InodeCache {
    map: Mutex<HashMap<u64, Weak<Inode>>>,
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeCache")
            .field("entries", &self.map.lock().len())
            .finish()
    }
}

impl InodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Get the in-core inode, reading from disk on a miss.
    pub fn get(
        &self,
        cache: &BufCache,
        geo: &Geometry,
        v5: bool,
        ino: InodeNumber,
    ) -> Result<Arc<Inode>> {
        let mut map = self.map.lock();
        if let Some(live) = map.get(&ino.0).and_then(Weak::upgrade) {
            return Ok(live);
        }

        let state = read_inode(cache, geo, v5, ino)?;
        let inode = Arc::new(Inode {
            ino,
            state: RwLock::new(state),
            pin: Mutex::new(None),
        });
        map.insert(ino.0, Arc::downgrade(&inode));
        trace!(target: "uxfs::inode", event = "icache_install", ino = ino.0);
        Ok(inode)
    }

    /// Install a freshly created inode that has no on-disk image yet.
    pub fn install_new(&self, ino: InodeNumber, state: InodeState) -> Arc<Inode> {
        let inode = Arc::new(Inode {
            ino,
            state: RwLock::new(state),
            pin: Mutex::new(None),
        });
        self.map.lock().insert(ino.0, Arc::downgrade(&inode));
        inode
    }

    /// Drop dead weak entries; called opportunistically.
    pub fn reap(&self) {
        let mut map = self.map.lock();
        let before = map.len();
        map.retain(|_, weak| weak.strong_count() > 0);
        let reaped = before - map.len();
        if reaped > 0 {
            trace!(target: "uxfs::inode", event = "icache_reap", reaped);
        }
    }

    /// Remove an inode whose identity was freed (unlink to zero).
    pub fn forget(&self, ino: InodeNumber) {
        if self.map.lock().remove(&ino.0).is_some() {
            trace!(target: "uxfs::inode", event = "icache_forget", ino = ino.0);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

/// Warn-and-revert guard for inodes left pinned by a dropped transaction.
pub fn abort_stray_pin(inode: &Inode, tx: TxId) {
    if inode.pinned_by() == Some(tx) {
        warn!(
            target: "uxfs::inode",
            event = "stray_pin_revert",
            ino = inode.ino().0,
            tx = tx.0
        );
        inode.unpin_revert();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use uxfs_block::{ByteDevice, MemByteDevice};
    use uxfs_types::{AgBlock, AgNumber, FileBlock, S_IFDIR, S_IFREG};

    fn test_geo() -> Geometry {
        Geometry {
            block_size: 4096,
            block_log: 12,
            sector_size: 512,
            ag_blocks: 1024,
            ag_count: 1,
            ag_blk_log: 10,
            inode_size: 512,
            inode_log: 9,
            inodes_per_block: 8,
            inopb_log: 3,
            dir_blk_log: 0,
        }
    }

    fn test_cache() -> BufCache {
        let dev = StdArc::new(MemByteDevice::new(1024 * 4096));
        BufCache::new(dev as StdArc<dyn ByteDevice>)
    }

    fn write_test_inode(cache: &BufCache, geo: &Geometry, ino: InodeNumber, state: &InodeState) {
        let tx = TxId(999);
        let icache = InodeCache::new();
        let inode = icache.install_new(ino, state.clone());
        inode.pin(tx).unwrap();
        let buf = flush_inode(cache, geo, tx, &inode).unwrap();
        cache.commit_tx(tx, &[buf]).unwrap();
        inode.unpin_keep();
    }

    #[test]
    fn init_read_round_trip() {
        let geo = test_geo();
        let cache = test_cache();
        let ino = geo.agino_to_ino(AgNumber(0), geo.agbno_to_agino(AgBlock(16), 3));

        let ts = Timestamp {
            sec: 1_700_000_000,
            nsec: 77,
        };
        let state = init_inode(
            true,
            Uuid::from_u128(5),
            ino,
            S_IFREG | 0o644,
            1,
            1000,
            100,
            0,
            ts,
        );
        write_test_inode(&cache, &geo, ino, &state);

        let out = read_inode(&cache, &geo, true, ino).expect("read");
        assert_eq!(out.core.mode, S_IFREG | 0o644);
        assert_eq!(out.core.uid, 1000);
        assert_eq!(out.core.nlink, 1);
        assert_eq!(out.core.crtime, ts);
        assert_eq!(out.core.ino, ino.0);
        assert_eq!(out.data_fork, Fork::Extents(Vec::new()));
        assert_eq!(out.next_unlinked, NULL_AGINO);
    }

    #[test]
    fn crc_mismatch_is_corruption() {
        let geo = test_geo();
        let cache = test_cache();
        let ino = geo.agino_to_ino(AgNumber(0), geo.agbno_to_agino(AgBlock(16), 0));
        let state = init_inode(
            true,
            Uuid::nil(),
            ino,
            S_IFREG | 0o600,
            1,
            0,
            0,
            0,
            Timestamp::default(),
        );
        write_test_inode(&cache, &geo, ino, &state);

        // Flip one byte inside the on-disk inode.
        let loc = locate_inode(&geo, ino);
        let buf = cache.get(loc.daddr, loc.buf_len).unwrap();
        buf.data_mut()[loc.byte_offset + 60] ^= 1;

        match read_inode(&cache, &geo, true, ino) {
            Err(XfsError::Corruption { .. }) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn dev_fork_round_trip() {
        let geo = test_geo();
        let cache = test_cache();
        let ino = geo.agino_to_ino(AgNumber(0), geo.agbno_to_agino(AgBlock(17), 1));
        let state = init_inode(
            true,
            Uuid::nil(),
            ino,
            uxfs_types::S_IFCHR | 0o600,
            1,
            0,
            0,
            0x0105,
            Timestamp::default(),
        );
        write_test_inode(&cache, &geo, ino, &state);
        let out = read_inode(&cache, &geo, true, ino).unwrap();
        assert_eq!(out.data_fork, Fork::Dev(0x0105));
    }

    #[test]
    fn extents_fork_round_trip() {
        let geo = test_geo();
        let cache = test_cache();
        let ino = geo.agino_to_ino(AgNumber(0), geo.agbno_to_agino(AgBlock(18), 2));
        let mut state = init_inode(
            true,
            Uuid::nil(),
            ino,
            S_IFREG | 0o644,
            1,
            0,
            0,
            0,
            Timestamp::default(),
        );
        let recs = vec![
            ExtentRec {
                startoff: FileBlock(0),
                startblock: FsBlock(200),
                blockcount: 4,
                unwritten: false,
            },
            ExtentRec {
                startoff: FileBlock(8),
                startblock: FsBlock(300),
                blockcount: 2,
                unwritten: true,
            },
        ];
        state.data_fork = Fork::Extents(recs.clone());
        state.core.size = 10 * 4096;
        state.core.nblocks = 6;
        write_test_inode(&cache, &geo, ino, &state);

        let out = read_inode(&cache, &geo, true, ino).unwrap();
        assert_eq!(out.data_fork.extents(), &recs[..]);
    }

    #[test]
    fn out_of_order_extents_rejected() {
        let recs = vec![
            ExtentRec {
                startoff: FileBlock(8),
                startblock: FsBlock(300),
                blockcount: 2,
                unwritten: false,
            },
            ExtentRec {
                startoff: FileBlock(0),
                startblock: FsBlock(200),
                blockcount: 4,
                unwritten: false,
            },
        ];
        assert!(check_extent_order(&recs).is_err());
    }

    #[test]
    fn local_dir_fork_round_trip() {
        let geo = test_geo();
        let cache = test_cache();
        let ino = geo.agino_to_ino(AgNumber(0), geo.agbno_to_agino(AgBlock(19), 0));
        let mut state = init_inode(
            true,
            Uuid::nil(),
            ino,
            S_IFDIR | 0o755,
            2,
            0,
            0,
            0,
            Timestamp::default(),
        );
        let sf = vec![1_u8, 0, 0, 0, 0, 128, 4, 0, 96, b'n', b'a', b'm', b'e', 1, 0, 0, 0, 131];
        state.core.size = sf.len() as u64;
        state.data_fork = Fork::Local(sf.clone());
        write_test_inode(&cache, &geo, ino, &state);

        let out = read_inode(&cache, &geo, true, ino).unwrap();
        assert_eq!(out.data_fork.local_bytes().unwrap(), &sf[..]);
    }

    #[test]
    fn pin_snapshot_revert() {
        let icache = InodeCache::new();
        let state = init_inode(
            true,
            Uuid::nil(),
            InodeNumber(128),
            S_IFREG | 0o644,
            1,
            0,
            0,
            0,
            Timestamp::default(),
        );
        let inode = icache.install_new(InodeNumber(128), state);
        let tx = TxId(7);
        inode.pin(tx).unwrap();
        inode.write().core.nlink = 5;
        inode.log(tx, InodeLogFlags::CORE).unwrap();
        assert!(inode.log_flags().contains(InodeLogFlags::CORE));

        inode.unpin_revert();
        assert_eq!(inode.read().core.nlink, 1);
        assert!(inode.pinned_by().is_none());
    }

    #[test]
    fn pin_conflict_rejected() {
        let icache = InodeCache::new();
        let inode = icache.install_new(
            InodeNumber(129),
            init_inode(
                true,
                Uuid::nil(),
                InodeNumber(129),
                S_IFREG | 0o644,
                1,
                0,
                0,
                0,
                Timestamp::default(),
            ),
        );
        inode.pin(TxId(1)).unwrap();
        assert!(inode.pin(TxId(2)).is_err());
        assert!(inode.log(TxId(2), InodeLogFlags::CORE).is_err());
    }

    #[test]
    fn cache_returns_same_arc_and_reaps() {
        let geo = test_geo();
        let cache = test_cache();
        let icache = InodeCache::new();
        let ino = geo.agino_to_ino(AgNumber(0), geo.agbno_to_agino(AgBlock(20), 0));
        write_test_inode(
            &cache,
            &geo,
            ino,
            &init_inode(
                true,
                Uuid::nil(),
                ino,
                S_IFREG | 0o644,
                1,
                0,
                0,
                0,
                Timestamp::default(),
            ),
        );

        let a = icache.get(&cache, &geo, true, ino).unwrap();
        let b = icache.get(&cache, &geo, true, ino).unwrap();
        assert!(StdArc::ptr_eq(&a, &b));
        assert_eq!(icache.len(), 1);

        drop(a);
        drop(b);
        icache.reap();
        assert!(icache.is_empty());
    }

    #[test]
    fn timestamps_touch() {
        let mut core = init_inode(
            true,
            Uuid::nil(),
            InodeNumber(1),
            S_IFREG,
            1,
            0,
            0,
            0,
            Timestamp::default(),
        )
        .core;
        let t1 = Timestamp { sec: 100, nsec: 0 };
        touch_mtime_ctime(&mut core, t1);
        assert_eq!(core.mtime, t1);
        assert_eq!(core.ctime, t1);
        let cc = core.changecount;

        let t2 = Timestamp { sec: 200, nsec: 0 };
        touch_ctime(&mut core, t2);
        assert_eq!(core.ctime, t2);
        assert_eq!(core.mtime, t1);
        assert_eq!(core.changecount, cc + 1);
    }
}
