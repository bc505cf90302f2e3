#![forbid(unsafe_code)]
//! Block device abstraction and buffer cache.
//!
//! The buffer cache owns the canonical in-memory image of every disk region
//! currently referenced. Buffers are keyed by `(daddr, length)`, read
//! through on first access, and written back either at transaction commit
//! (dirty + pinned) or at flush (dirty + unpinned). A buffer dirtied under
//! a transaction cannot be written back until that transaction commits.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uxfs_error::{Result, XfsError};
use uxfs_types::{DAddr, TxId, BBSHIFT};

// ── Byte device ─────────────────────────────────────────────────────────────

/// Byte-addressed backing store with pread/pwrite semantics.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device.
///
/// Opens read-write and falls back to read-only; `writable()` reports which
/// mode won so the mount layer can refuse read-write mounts up front.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| XfsError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(XfsError::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(XfsError::ReadOnly);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| XfsError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(XfsError::Format(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device, used by tests and by tooling that formats images.
#[derive(Debug)]
pub struct MemByteDevice {
    data: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let off = usize::try_from(offset)
            .map_err(|_| XfsError::Format("offset does not fit usize".to_owned()))?;
        let end = off
            .checked_add(buf.len())
            .filter(|&e| e <= data.len())
            .ok_or_else(|| XfsError::Format("read out of bounds".to_owned()))?;
        buf.copy_from_slice(&data[off..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let off = usize::try_from(offset)
            .map_err(|_| XfsError::Format("offset does not fit usize".to_owned()))?;
        let end = off
            .checked_add(buf.len())
            .filter(|&e| e <= data.len())
            .ok_or_else(|| XfsError::Format("write out of bounds".to_owned()))?;
        data[off..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BufInner {
    data: Vec<u8>,
    dirty: bool,
    pinned_by: Option<TxId>,
    /// Pre-pin image, restored on transaction abort.
    snapshot: Option<Vec<u8>>,
    /// Byte ranges dirtied by the pinning transaction.
    logged: Vec<(usize, usize)>,
}

/// One cached disk extent.
#[derive(Debug)]
pub struct Buf {
    daddr: DAddr,
    len: usize,
    inner: Mutex<BufInner>,
}

/// Shared handle to a cached buffer.
pub type BufHandle = Arc<Buf>;

/// Read guard over a buffer's bytes.
pub struct BufData<'a>(MutexGuard<'a, BufInner>);

impl std::ops::Deref for BufData<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0.data
    }
}

/// Write guard over a buffer's bytes.
pub struct BufDataMut<'a>(MutexGuard<'a, BufInner>);

impl std::ops::Deref for BufDataMut<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0.data
    }
}

impl std::ops::DerefMut for BufDataMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0.data
    }
}

impl Buf {
    #[must_use]
    pub fn daddr(&self) -> DAddr {
        self.daddr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the buffer's bytes.
    #[must_use]
    pub fn data(&self) -> BufData<'_> {
        BufData(self.inner.lock())
    }

    /// Mutably borrow the buffer's bytes.
    ///
    /// Callers mutate only while the buffer is pinned to their transaction;
    /// the single-writer discipline makes this a convention rather than a
    /// checked lock order.
    #[must_use]
    pub fn data_mut(&self) -> BufDataMut<'_> {
        BufDataMut(self.inner.lock())
    }

    /// Pin this buffer to a transaction, snapshotting for abort.
    pub fn pin(&self, tx: TxId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.pinned_by {
            Some(owner) if owner != tx => Err(XfsError::Format(format!(
                "buffer {} already pinned by tx {}",
                self.daddr, owner.0
            ))),
            Some(_) => Ok(()),
            None => {
                inner.snapshot = Some(inner.data.clone());
                inner.pinned_by = Some(tx);
                trace!(target: "uxfs::block", event = "buf_pin", daddr = self.daddr.0, tx = tx.0);
                Ok(())
            }
        }
    }

    /// Record that `[first..=last]` was dirtied by the pinning transaction.
    pub fn log_range(&self, tx: TxId, first: usize, last: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pinned_by != Some(tx) {
            return Err(XfsError::Format(format!(
                "log_range on buffer {} not pinned by tx {}",
                self.daddr, tx.0
            )));
        }
        if last >= inner.data.len() || first > last {
            return Err(XfsError::Format(format!(
                "log_range out of bounds: {first}..={last} len={}",
                inner.data.len()
            )));
        }
        inner.dirty = true;
        inner.logged.push((first, last));
        Ok(())
    }

    /// Whether the buffer holds unwritten modifications.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    #[must_use]
    pub fn pinned_by(&self) -> Option<TxId> {
        self.inner.lock().pinned_by
    }

    /// Release the pin keeping the modified bytes (commit path).
    ///
    /// Called by the transaction layer only.
    pub fn unpin_keep(&self) {
        let mut inner = self.inner.lock();
        inner.pinned_by = None;
        inner.snapshot = None;
        inner.logged.clear();
    }

    /// Release the pin restoring the pre-pin bytes (abort path).
    ///
    /// Called by the transaction layer only.
    pub fn unpin_revert(&self) {
        let mut inner = self.inner.lock();
        if let Some(snapshot) = inner.snapshot.take() {
            inner.data = snapshot;
        }
        inner.dirty = false;
        inner.pinned_by = None;
        inner.logged.clear();
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

/// Maps `(daddr, length)` to the canonical buffer for that disk extent.
pub struct BufCache {
    dev: Arc<dyn ByteDevice>,
    bufs: Mutex<HashMap<(u64, usize), BufHandle>>,
}

impl std::fmt::Debug for BufCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufCache")
            .field("cached", &self.bufs.lock().len())
            .finish()
    }
}

impl BufCache {
    #[must_use]
    pub fn new(dev: Arc<dyn ByteDevice>) -> Self {
        Self {
            dev,
            bufs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.dev
    }

    /// Get the buffer for a disk extent, reading through on a miss.
    pub fn get(&self, daddr: DAddr, len: usize) -> Result<BufHandle> {
        if let Some(buf) = self.bufs.lock().get(&(daddr.0, len)) {
            return Ok(Arc::clone(buf));
        }

        let mut data = vec![0_u8; len];
        self.dev.read_exact_at(daddr.0 << BBSHIFT, &mut data)?;
        trace!(target: "uxfs::block", event = "buf_read", daddr = daddr.0, len);

        let buf = Arc::new(Buf {
            daddr,
            len,
            inner: Mutex::new(BufInner {
                data,
                dirty: false,
                pinned_by: None,
                snapshot: None,
                logged: Vec::new(),
            }),
        });
        // A racing insert is impossible under the single-writer rule, but
        // entry() keeps the map canonical regardless.
        let mut bufs = self.bufs.lock();
        let entry = bufs
            .entry((daddr.0, len))
            .or_insert_with(|| Arc::clone(&buf));
        Ok(Arc::clone(entry))
    }

    /// Get a buffer without reading the device: for freshly allocated
    /// blocks whose on-disk content is undefined.
    pub fn get_uninit(&self, daddr: DAddr, len: usize) -> BufHandle {
        let mut bufs = self.bufs.lock();
        let entry = bufs.entry((daddr.0, len)).or_insert_with(|| {
            trace!(target: "uxfs::block", event = "buf_fresh", daddr = daddr.0, len);
            Arc::new(Buf {
                daddr,
                len,
                inner: Mutex::new(BufInner {
                    data: vec![0_u8; len],
                    dirty: false,
                    pinned_by: None,
                    snapshot: None,
                    logged: Vec::new(),
                }),
            })
        });
        // Reset stale cached content: the block was just reallocated.
        {
            let mut inner = entry.inner.lock();
            if inner.pinned_by.is_none() {
                inner.data.fill(0);
                inner.dirty = false;
            }
        }
        Arc::clone(entry)
    }

    /// Get and pin in one step (`get_pinned` of the transaction layer).
    pub fn get_pinned(&self, tx: TxId, daddr: DAddr, len: usize) -> Result<BufHandle> {
        let buf = self.get(daddr, len)?;
        buf.pin(tx)?;
        Ok(buf)
    }

    /// Write one buffer back to the device and mark it clean.
    pub fn write_back(&self, buf: &Buf) -> Result<()> {
        let mut inner = buf.inner.lock();
        if !inner.dirty {
            return Ok(());
        }
        self.dev.write_all_at(buf.daddr.0 << BBSHIFT, &inner.data)?;
        inner.dirty = false;
        trace!(target: "uxfs::block", event = "buf_writeback", daddr = buf.daddr.0, len = buf.len);
        Ok(())
    }

    /// Release the pins of a committing transaction, writing buffers back.
    pub fn commit_tx(&self, tx: TxId, bufs: &[BufHandle]) -> Result<()> {
        for buf in bufs {
            debug_assert_eq!(buf.pinned_by(), Some(tx));
            self.write_back(buf)?;
            buf.unpin_keep();
        }
        Ok(())
    }

    /// Release the pins of an aborting transaction, restoring snapshots.
    pub fn abort_tx(&self, tx: TxId, bufs: &[BufHandle]) {
        for buf in bufs {
            if buf.pinned_by() == Some(tx) {
                buf.unpin_revert();
            }
        }
    }

    /// Write back every dirty, unpinned buffer.
    pub fn flush(&self) -> Result<()> {
        let handles: Vec<BufHandle> = self.bufs.lock().values().map(Arc::clone).collect();
        let mut first_err = None;
        let mut flushed = 0_usize;
        for buf in handles {
            if buf.pinned_by().is_some() {
                warn!(
                    target: "uxfs::block",
                    event = "flush_skip_pinned",
                    daddr = buf.daddr.0
                );
                continue;
            }
            match self.write_back(&buf) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!(target: "uxfs::block", event = "flush_error", daddr = buf.daddr.0, error = %e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        debug!(target: "uxfs::block", event = "flush_done", flushed);
        match first_err {
            None => self.dev.sync(),
            Some(e) => Err(e),
        }
    }

    /// Drop clean, unpinned buffers that nothing else references.
    pub fn purge_clean(&self) {
        let mut bufs = self.bufs.lock();
        bufs.retain(|_, buf| {
            Arc::strong_count(buf) > 1 || buf.is_dirty() || buf.pinned_by().is_some()
        });
    }

    /// Number of cached buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bufs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bufs.lock().is_empty()
    }
}
