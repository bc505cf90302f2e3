#![forbid(unsafe_code)]
//! Transaction facade.
//!
//! Every metadata mutation is bracketed by a transaction: reserve log
//! space from a per-operation table, pin the buffers and inodes it will
//! dirty, record logged deltas, then commit or cancel. Commit re-encodes
//! pinned inodes into their cluster buffers, refreshes the CRCs of dirtied
//! V5 metadata, and writes everything back immediately; cancel restores
//! every pinned object to its pre-join snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uxfs_block::{BufCache, BufHandle};
use uxfs_error::{Result, XfsError};
use uxfs_inode::{flush_inode, Inode};
use uxfs_ondisk::{cksum, InodeLogFlags};
use uxfs_types::{DAddr, FsBlock, Geometry, TxId};

// ── Reservation table ───────────────────────────────────────────────────────

/// The namespace operation a transaction is reserved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Create,
    Mkdir,
    Remove,
    Rename,
    Link,
    Symlink,
    Write,
    Truncate,
    Setattr,
    /// Directory or fork growth inside another operation's chain.
    Growth,
}

/// Log-space reservation in bytes for one operation.
///
/// The multipliers bound the metadata a single operation can dirty: the
/// inode cluster, the directory blocks it touches, the AG headers, and the
/// btree roots. They are deliberately generous; the check they feed is that
/// a reservation never exceeds the on-disk log.
#[must_use]
pub fn log_reservation(kind: TxKind, block_size: u32) -> u64 {
    let bs = u64::from(block_size);
    match kind {
        TxKind::Create | TxKind::Mkdir | TxKind::Symlink => 3 * bs + 1024,
        TxKind::Rename => 4 * bs + 1024,
        TxKind::Remove | TxKind::Link => 2 * bs + 1024,
        TxKind::Write | TxKind::Growth => 2 * bs + 512,
        TxKind::Truncate => 3 * bs,
        TxKind::Setattr => bs,
    }
}

// ── Transaction state machine ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Allocated,
    Reserved,
    Committing,
    Committed,
    Aborted,
}

/// Superblock counter deltas accumulated by one transaction; applied by
/// the mount after a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SbDelta {
    pub fdblocks: i64,
    pub icount: i64,
    pub ifree: i64,
}

impl SbDelta {
    pub fn add(&mut self, other: SbDelta) {
        self.fdblocks += other.fdblocks;
        self.icount += other.icount;
        self.ifree += other.ifree;
    }
}

/// An extent free queued under a transaction, applied at `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredFree {
    pub start: FsBlock,
    pub len: u64,
}

struct LoggedBuf {
    handle: BufHandle,
    /// CRC field offset for V5 metadata; `None` for unchecksummed buffers
    /// (V4 metadata, file data, inode clusters whose CRCs are per-inode).
    crc_off: Option<usize>,
}

/// One metadata mutation in flight.
pub struct Transaction {
    id: TxId,
    kind: TxKind,
    state: TxState,
    bufs: Vec<LoggedBuf>,
    inodes: Vec<Arc<Inode>>,
    deferred: Vec<DeferredFree>,
    sb_delta: SbDelta,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id.0)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("bufs", &self.bufs.len())
            .field("inodes", &self.inodes.len())
            .finish()
    }
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> TxId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    #[must_use]
    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// Reserve log space; moves `Allocated → Reserved`.
    pub fn reserve(&mut self, mgr: &TxManager, extra_blocks: u64) -> Result<()> {
        if self.state != TxState::Allocated {
            return Err(XfsError::Format(format!(
                "reserve in state {:?}",
                self.state
            )));
        }
        let needed = log_reservation(self.kind, mgr.block_size)
            + extra_blocks * u64::from(mgr.block_size);
        if needed > mgr.log_bytes {
            debug!(
                target: "uxfs::trans",
                event = "reserve_fail",
                tx = self.id.0,
                needed,
                log_bytes = mgr.log_bytes
            );
            return Err(XfsError::NoSpace);
        }
        self.state = TxState::Reserved;
        trace!(target: "uxfs::trans", event = "reserve", tx = self.id.0, kind = ?self.kind, needed);
        Ok(())
    }

    fn check_live(&self) -> Result<()> {
        if self.state != TxState::Reserved {
            return Err(XfsError::Format(format!(
                "transaction used in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Pin a buffer to this transaction and track it for commit.
    pub fn join_buf(&mut self, handle: &BufHandle, crc_off: Option<usize>) -> Result<()> {
        self.check_live()?;
        handle.pin(self.id)?;
        if !self
            .bufs
            .iter()
            .any(|b| Arc::ptr_eq(&b.handle, handle))
        {
            self.bufs.push(LoggedBuf {
                handle: Arc::clone(handle),
                crc_off,
            });
        }
        Ok(())
    }

    /// Get a buffer through the cache, pinned to this transaction.
    pub fn get_buf(
        &mut self,
        cache: &BufCache,
        daddr: DAddr,
        len: usize,
        crc_off: Option<usize>,
    ) -> Result<BufHandle> {
        self.check_live()?;
        let handle = cache.get(daddr, len)?;
        self.join_buf(&handle, crc_off)?;
        Ok(handle)
    }

    /// Get a fresh (unread) buffer for a newly allocated block.
    pub fn get_buf_uninit(
        &mut self,
        cache: &BufCache,
        daddr: DAddr,
        len: usize,
        crc_off: Option<usize>,
    ) -> Result<BufHandle> {
        self.check_live()?;
        let handle = cache.get_uninit(daddr, len);
        self.join_buf(&handle, crc_off)?;
        Ok(handle)
    }

    /// Record a dirtied byte range on a joined buffer.
    pub fn log_buf(&mut self, handle: &BufHandle, first: usize, last: usize) -> Result<()> {
        self.check_live()?;
        handle.log_range(self.id, first, last)
    }

    /// Pin an inode to this transaction.
    ///
    /// Multi-inode operations join in increasing inode-number order; the
    /// assertion documents the discipline for implementers that relax the
    /// single-writer rule.
    pub fn join_inode(&mut self, inode: &Arc<Inode>) -> Result<()> {
        self.check_live()?;
        inode.pin(self.id)?;
        if !self.inodes.iter().any(|i| Arc::ptr_eq(i, inode)) {
            self.inodes.push(Arc::clone(inode));
        }
        Ok(())
    }

    /// Record dirtied inode field classes.
    pub fn log_inode(&mut self, inode: &Inode, flags: InodeLogFlags) -> Result<()> {
        self.check_live()?;
        inode.log(self.id, flags)
    }

    /// Queue an extent free to be applied by the allocator's `finish`.
    pub fn defer_free(&mut self, start: FsBlock, len: u64) -> Result<()> {
        self.check_live()?;
        self.deferred.push(DeferredFree { start, len });
        trace!(target: "uxfs::trans", event = "defer_free", tx = self.id.0, start = start.0, len);
        Ok(())
    }

    /// Drain queued frees (allocator `finish` path).
    pub fn take_deferred(&mut self) -> Vec<DeferredFree> {
        std::mem::take(&mut self.deferred)
    }

    #[must_use]
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Accumulate superblock counter changes.
    pub fn add_sb_delta(&mut self, delta: SbDelta) {
        self.sb_delta.add(delta);
    }

    /// Commit: flush logged inodes into their clusters, refresh V5 CRCs,
    /// write every pinned buffer back, release all pins.
    ///
    /// Returns the superblock counter delta for the mount to apply.
    pub fn commit(mut self, cache: &BufCache, geo: &Geometry) -> Result<SbDelta> {
        self.check_live()?;
        if self.has_deferred() {
            return Err(XfsError::Format(
                "commit with unfinished deferred frees".to_owned(),
            ));
        }
        self.state = TxState::Committing;

        // Inodes with dirty flags re-encode into their cluster buffers.
        for inode in &self.inodes {
            if !inode.log_flags().is_empty() {
                let handle = flush_inode(cache, geo, self.id, inode)?;
                if !self
                    .bufs
                    .iter()
                    .any(|b| Arc::ptr_eq(&b.handle, &handle))
                {
                    self.bufs.push(LoggedBuf {
                        handle,
                        crc_off: None,
                    });
                }
            }
        }

        // Refresh metadata CRCs on dirtied checksummed buffers.
        for buf in &self.bufs {
            if let Some(off) = buf.crc_off {
                if buf.handle.is_dirty() {
                    cksum::update_cksum(&mut buf.handle.data_mut(), off);
                }
            }
        }

        let handles: Vec<BufHandle> = self.bufs.iter().map(|b| Arc::clone(&b.handle)).collect();
        cache.commit_tx(self.id, &handles)?;
        for inode in &self.inodes {
            inode.unpin_keep();
        }

        self.state = TxState::Committed;
        debug!(
            target: "uxfs::trans",
            event = "commit",
            tx = self.id.0,
            kind = ?self.kind,
            bufs = self.bufs.len(),
            inodes = self.inodes.len()
        );
        Ok(self.sb_delta)
    }

    /// Abort: restore all pinned state. Idempotent.
    pub fn cancel(&mut self) {
        if matches!(self.state, TxState::Committed | TxState::Aborted) {
            return;
        }
        for buf in &self.bufs {
            if buf.handle.pinned_by() == Some(self.id) {
                buf.handle.unpin_revert();
            }
        }
        for inode in &self.inodes {
            if inode.pinned_by() == Some(self.id) {
                inode.unpin_revert();
            }
        }
        self.bufs.clear();
        self.inodes.clear();
        self.deferred.clear();
        self.sb_delta = SbDelta::default();
        self.state = TxState::Aborted;
        debug!(target: "uxfs::trans", event = "cancel", tx = self.id.0, kind = ?self.kind);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state, TxState::Reserved | TxState::Committing) {
            // A handle dropped before commit is a programming error; abort
            // so no partial mutation stays visible.
            warn!(
                target: "uxfs::trans",
                event = "dropped_unfinished",
                tx = self.id.0,
                state = ?self.state
            );
            self.cancel();
        }
    }
}

// ── Transaction manager ─────────────────────────────────────────────────────

/// Allocates transaction ids and holds the log-capacity bound.
#[derive(Debug)]
pub struct TxManager {
    next_id: AtomicU64,
    block_size: u32,
    log_bytes: u64,
}

impl TxManager {
    #[must_use]
    pub fn new(block_size: u32, log_blocks: u32) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            block_size,
            log_bytes: u64::from(log_blocks) * u64::from(block_size),
        }
    }

    /// Enter the `Allocated` state.
    #[must_use]
    pub fn begin(&self, kind: TxKind) -> Transaction {
        let id = TxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(target: "uxfs::trans", event = "begin", tx = id.0, kind = ?kind);
        Transaction {
            id,
            kind,
            state: TxState::Allocated,
            bufs: Vec::new(),
            inodes: Vec::new(),
            deferred: Vec::new(),
            sb_delta: SbDelta::default(),
        }
    }

    /// Begin and reserve in one step.
    pub fn begin_reserved(&self, kind: TxKind, extra_blocks: u64) -> Result<Transaction> {
        let mut tx = self.begin(kind);
        tx.reserve(self, extra_blocks)?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use uuid::Uuid;
    use uxfs_block::{ByteDevice, MemByteDevice};
    use uxfs_inode::{init_inode, InodeCache};
    use uxfs_types::{InodeNumber, Timestamp, S_IFREG};

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

    fn test_cache() -> (StdArc<MemByteDevice>, BufCache) {
        let dev = StdArc::new(MemByteDevice::new(1024 * 4096));
        let cache = BufCache::new(StdArc::clone(&dev) as StdArc<dyn ByteDevice>);
        (dev, cache)
    }

    #[test]
    fn state_machine_happy_path() {
        let (_dev, cache) = test_cache();
        let geo = test_geo();
        let mgr = TxManager::new(4096, 512);

        let mut tx = mgr.begin(TxKind::Setattr);
        assert_eq!(tx.state(), TxState::Allocated);
        tx.reserve(&mgr, 0).unwrap();
        assert_eq!(tx.state(), TxState::Reserved);

        let buf = tx.get_buf(&cache, DAddr(8), 4096, None).unwrap();
        buf.data_mut()[0] = 0x42;
        tx.log_buf(&buf, 0, 0).unwrap();

        let delta = tx.commit(&cache, &geo).unwrap();
        assert_eq!(delta, SbDelta::default());
        assert!(!buf.is_dirty());
        assert!(buf.pinned_by().is_none());
    }

    #[test]
    fn reserve_twice_rejected() {
        let mgr = TxManager::new(4096, 512);
        let mut tx = mgr.begin(TxKind::Create);
        tx.reserve(&mgr, 0).unwrap();
        assert!(tx.reserve(&mgr, 0).is_err());
        tx.cancel();
    }

    #[test]
    fn tiny_log_fails_reserve() {
        let mgr = TxManager::new(4096, 1);
        let mut tx = mgr.begin(TxKind::Rename);
        assert!(matches!(tx.reserve(&mgr, 0), Err(XfsError::NoSpace)));
    }

    #[test]
    fn cancel_reverts_buffers_and_inodes() {
        let (dev, cache) = test_cache();
        let mgr = TxManager::new(4096, 512);
        let icache = InodeCache::new();
        let inode = icache.install_new(
            InodeNumber(128),
            init_inode(
                true,
                Uuid::nil(),
                InodeNumber(128),
                S_IFREG | 0o644,
                1,
                0,
                0,
                0,
                Timestamp::default(),
            ),
        );

        let mut tx = mgr.begin_reserved(TxKind::Setattr, 0).unwrap();
        let buf = tx.get_buf(&cache, DAddr(0), 4096, None).unwrap();
        buf.data_mut()[0] = 0xEE;
        tx.log_buf(&buf, 0, 0).unwrap();

        tx.join_inode(&inode).unwrap();
        inode.write().core.nlink = 9;
        tx.log_inode(&inode, InodeLogFlags::CORE).unwrap();

        tx.cancel();
        tx.cancel(); // idempotent

        assert_eq!(tx.state(), TxState::Aborted);
        assert_eq!(buf.data()[0], 0);
        assert_eq!(inode.read().core.nlink, 1);
        assert_eq!(dev.snapshot()[0], 0);
    }

    #[test]
    fn commit_refreshes_crc() {
        let (dev, cache) = test_cache();
        let geo = test_geo();
        let mgr = TxManager::new(4096, 512);

        let mut tx = mgr.begin_reserved(TxKind::Growth, 0).unwrap();
        let buf = tx.get_buf_uninit(&cache, DAddr(64), 4096, Some(4)).unwrap();
        {
            let mut data = buf.data_mut();
            data[0..4].copy_from_slice(&0x5844_4433_u32.to_be_bytes()); // XDD3
            data[100] = 0x77;
        }
        tx.log_buf(&buf, 0, 4095).unwrap();
        tx.commit(&cache, &geo).unwrap();

        let img = dev.snapshot();
        let block = &img[64 * 512..64 * 512 + 4096];
        assert!(uxfs_ondisk::cksum::verify_cksum(block, 4));
        assert_eq!(block[100], 0x77);
    }

    #[test]
    fn commit_flushes_logged_inode() {
        let (_dev, cache) = test_cache();
        let geo = test_geo();
        let mgr = TxManager::new(4096, 512);
        let icache = InodeCache::new();

        let ino = geo.agino_to_ino(uxfs_types::AgNumber(0), 16 << 3);
        let inode = icache.install_new(
            ino,
            init_inode(
                true,
                Uuid::nil(),
                ino,
                S_IFREG | 0o600,
                1,
                42,
                42,
                0,
                Timestamp { sec: 9, nsec: 9 },
            ),
        );

        let mut tx = mgr.begin_reserved(TxKind::Create, 0).unwrap();
        tx.join_inode(&inode).unwrap();
        tx.log_inode(&inode, InodeLogFlags::CORE).unwrap();
        tx.commit(&cache, &geo).unwrap();

        let state = uxfs_inode::read_inode(&cache, &geo, true, ino).unwrap();
        assert_eq!(state.core.uid, 42);
        assert_eq!(state.core.mode, S_IFREG | 0o600);
        assert!(inode.pinned_by().is_none());
    }

    #[test]
    fn commit_with_pending_deferred_rejected() {
        let (_dev, cache) = test_cache();
        let geo = test_geo();
        let mgr = TxManager::new(4096, 512);
        let mut tx = mgr.begin_reserved(TxKind::Truncate, 0).unwrap();
        tx.defer_free(FsBlock(100), 4).unwrap();
        assert!(tx.commit(&cache, &geo).is_err());
    }

    #[test]
    fn sb_delta_accumulates() {
        let mgr = TxManager::new(4096, 512);
        let mut tx = mgr.begin_reserved(TxKind::Write, 0).unwrap();
        tx.add_sb_delta(SbDelta {
            fdblocks: -4,
            icount: 0,
            ifree: 0,
        });
        tx.add_sb_delta(SbDelta {
            fdblocks: -1,
            icount: 64,
            ifree: 63,
        });
        let (_dev, cache) = test_cache();
        let delta = tx.commit(&cache, &test_geo()).unwrap();
        assert_eq!(delta.fdblocks, -5);
        assert_eq!(delta.icount, 64);
        assert_eq!(delta.ifree, 63);
    }

    #[test]
    fn drop_unfinished_reverts() {
        let (_dev, cache) = test_cache();
        let mgr = TxManager::new(4096, 512);
        let buf;
        {
            let mut tx = mgr.begin_reserved(TxKind::Setattr, 0).unwrap();
            buf = tx.get_buf(&cache, DAddr(0), 4096, None).unwrap();
            buf.data_mut()[7] = 7;
            tx.log_buf(&buf, 7, 7).unwrap();
            // dropped without commit
        }
        assert_eq!(buf.data()[7], 0);
        assert!(buf.pinned_by().is_none());
    }
}
