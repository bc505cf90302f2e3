//! Mutating namespace operations.
//!
//! Every operation here follows the same bracket: take the writer lock,
//! refuse read-only mounts up front, resolve paths, then run one
//! transaction (chained with allocator `finish`) that either commits or
//! cancels with nothing visible.

use crate::{FileAttr, Mount};
use std::sync::Arc;
use tracing::debug;
use uxfs_dir as dir;
use uxfs_error::{Result, XfsError};
use uxfs_extent::{ensure_mapped, map_range, truncate_to};
use uxfs_inode::{init_inode, now, touch_ctime, touch_mtime_ctime, Fork, Inode};
use uxfs_ondisk::{InodeLogFlags, SymlinkHdr, SYMLINK_CRC_OFF, SYMLINK_HDR_SIZE};
use uxfs_trans::{Transaction, TxKind};
use uxfs_types::{
    is_blk, is_chr, is_dir, FileBlock, FileType, InodeNumber, Timestamp, MAX_LINK,
    MAX_SYMLINK_LEN, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, S_ISGID, S_ISUID,
};

/// Sentinel-bearing timestamp update for `utimens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    /// Use the wall clock.
    Now,
    /// Leave the field unchanged.
    Omit,
    Set(Timestamp),
}

impl TimeUpdate {
    fn resolve(self, wall: Timestamp) -> Option<Timestamp> {
        match self {
            Self::Now => Some(wall),
            Self::Omit => None,
            Self::Set(ts) => Some(ts),
        }
    }
}

/// Write chunks cover at most this many blocks, like the original's
/// 16-block ceiling per transaction.
const WRITE_CHUNK_BLOCKS: u64 = 16;

impl Mount {
    /// Commit and fold the counter delta into the superblock.
    fn commit_tx(&self, tx: Transaction) -> Result<()> {
        match tx.commit(self.cache(), &self.features().geo) {
            Ok(delta) => {
                self.apply_commit(delta);
                Ok(())
            }
            Err(e) => {
                self.note_write_failure(&e);
                Err(e)
            }
        }
    }

    /// Join inodes in increasing inode-number order, deduplicated.
    fn join_ordered(&self, tx: &mut Transaction, inodes: &[&Arc<Inode>]) -> Result<()> {
        let mut sorted: Vec<&Arc<Inode>> = inodes.to_vec();
        sorted.sort_by_key(|i| i.ino());
        sorted.dedup_by_key(|i| i.ino());
        for inode in sorted {
            tx.join_inode(inode)?;
        }
        Ok(())
    }

    // ── create / mknod ──────────────────────────────────────────────────────

    /// Create a regular file, FIFO, socket or device node.
    ///
    /// `mode` without type bits defaults to a regular file; `rdev` is
    /// stored only for character and block devices.
    pub fn create(&self, path: &[u8], mode: u16, rdev: u32) -> Result<FileAttr> {
        let _w = self.write_guard();
        self.check_writable()?;
        let mode = if mode & S_IFMT == 0 { S_IFREG | mode } else { mode };
        if is_dir(mode) {
            return Err(XfsError::Invalid("create cannot make directories"));
        }

        let (parent, name) = self.lookup_parent(path)?;
        dir::check_name(&name)?;
        if dir::lookup(self.cache(), self.features(), &parent, &name)?.is_some() {
            return Err(XfsError::Exists);
        }

        let mut tx = self.txmgr().begin_reserved(TxKind::Create, 0)?;
        let result = self.create_body(&mut tx, &parent, &name, mode, rdev);
        match result {
            Ok(inode) => {
                self.commit_tx(tx)?;
                Ok(self.attr_of(&inode))
            }
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    fn create_body(
        &self,
        tx: &mut Transaction,
        parent: &Arc<Inode>,
        name: &[u8],
        mode: u16,
        rdev: u32,
    ) -> Result<Arc<Inode>> {
        let fs = self.features();
        tx.join_inode(parent)?;

        let hint_agno = fs.geo.ino_to_agno(parent.ino());
        let ino = uxfs_alloc::alloc_inode(tx, self.cache(), fs, hint_agno, false)?;

        let ts = now();
        let (uid, gid) = self.credentials();
        let state = init_inode(fs.v5, fs.uuid, ino, mode, 1, uid, gid, rdev, ts);
        let inode = self.icache().install_new(ino, state);
        tx.join_inode(&inode)?;
        let mut flags = InodeLogFlags::CORE;
        if is_chr(mode) || is_blk(mode) {
            flags |= InodeLogFlags::DEV;
        }
        tx.log_inode(&inode, flags)?;

        dir::insert(
            tx,
            self.cache(),
            fs,
            parent,
            name,
            ino,
            FileType::from_mode(mode),
        )?;
        touch_mtime_ctime(&mut parent.write().core, ts);
        tx.log_inode(parent, InodeLogFlags::CORE)?;

        uxfs_alloc::finish(tx, self.cache(), fs)?;
        debug!(target: "uxfs::ops", event = "create", ino = ino.0, mode);
        Ok(inode)
    }

    /// Device-node spelling of [`Mount::create`]; the mode's type bits
    /// select the kind.
    pub fn mknod(&self, path: &[u8], mode: u16, rdev: u32) -> Result<FileAttr> {
        self.create(path, mode, rdev)
    }

    // ── mkdir ───────────────────────────────────────────────────────────────

    pub fn mkdir(&self, path: &[u8], mode: u16) -> Result<FileAttr> {
        let _w = self.write_guard();
        self.check_writable()?;

        let (parent, name) = self.lookup_parent(path)?;
        dir::check_name(&name)?;
        if dir::lookup(self.cache(), self.features(), &parent, &name)?.is_some() {
            return Err(XfsError::Exists);
        }
        if parent.read().core.nlink >= MAX_LINK {
            return Err(XfsError::TooManyLinks);
        }

        let mut tx = self.txmgr().begin_reserved(TxKind::Mkdir, 0)?;
        let result = self.mkdir_body(&mut tx, &parent, &name, mode);
        match result {
            Ok(inode) => {
                self.commit_tx(tx)?;
                Ok(self.attr_of(&inode))
            }
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    fn mkdir_body(
        &self,
        tx: &mut Transaction,
        parent: &Arc<Inode>,
        name: &[u8],
        mode: u16,
    ) -> Result<Arc<Inode>> {
        let fs = self.features();
        tx.join_inode(parent)?;

        let hint_agno = fs.geo.ino_to_agno(parent.ino());
        let ino = uxfs_alloc::alloc_inode(tx, self.cache(), fs, hint_agno, true)?;

        let ts = now();
        let (uid, gid) = self.credentials();
        let dir_mode = S_IFDIR | (mode & !S_IFMT);
        let mut state = init_inode(fs.v5, fs.uuid, ino, dir_mode, 2, uid, gid, 0, ts);
        let sf = dir::init_shortform(fs, parent.ino());
        state.core.size = sf.len() as u64;
        state.data_fork = Fork::Local(sf);
        let inode = self.icache().install_new(ino, state);
        tx.join_inode(&inode)?;
        tx.log_inode(&inode, InodeLogFlags::CORE | InodeLogFlags::DDATA)?;

        dir::insert(tx, self.cache(), fs, parent, name, ino, FileType::Directory)?;
        {
            let mut pstate = parent.write();
            pstate.core.nlink += 1; // the child's ".."
            touch_mtime_ctime(&mut pstate.core, ts);
        }
        tx.log_inode(parent, InodeLogFlags::CORE)?;

        uxfs_alloc::finish(tx, self.cache(), fs)?;
        debug!(target: "uxfs::ops", event = "mkdir", ino = ino.0);
        Ok(inode)
    }

    // ── unlink / rmdir ──────────────────────────────────────────────────────

    /// Remove a non-directory name; frees the inode when the link count
    /// reaches zero.
    pub fn unlink(&self, path: &[u8]) -> Result<()> {
        let _w = self.write_guard();
        self.check_writable()?;

        let (parent, name) = self.lookup_parent(path)?;
        let target = dir::lookup(self.cache(), self.features(), &parent, &name)?
            .ok_or_else(|| XfsError::NotFound(String::from_utf8_lossy(&name).into_owned()))?;
        let inode = self.iget(target)?;
        if inode.is_dir() {
            return Err(XfsError::IsDirectory);
        }

        let mut tx = self.txmgr().begin_reserved(TxKind::Remove, 0)?;
        let result = self.unlink_body(&mut tx, &parent, &name, &inode);
        match result {
            Ok(freed) => {
                self.commit_tx(tx)?;
                if freed {
                    self.icache().forget(target);
                }
                Ok(())
            }
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    fn unlink_body(
        &self,
        tx: &mut Transaction,
        parent: &Arc<Inode>,
        name: &[u8],
        inode: &Arc<Inode>,
    ) -> Result<bool> {
        let fs = self.features();
        self.join_ordered(tx, &[parent, inode])?;

        dir::remove(tx, self.cache(), fs, parent, name, inode.ino())?;
        let ts = now();
        touch_mtime_ctime(&mut parent.write().core, ts);
        tx.log_inode(parent, InodeLogFlags::CORE)?;

        let nlink = {
            let mut state = inode.write();
            state.core.nlink -= 1;
            touch_ctime(&mut state.core, ts);
            state.core.nlink
        };
        tx.log_inode(inode, InodeLogFlags::CORE)?;

        let freed = nlink == 0;
        if freed {
            self.free_inode_space(tx, inode)?;
        }
        uxfs_alloc::finish(tx, self.cache(), fs)?;
        debug!(target: "uxfs::ops", event = "unlink", ino = inode.ino().0, freed);
        Ok(freed)
    }

    /// Release a zero-linked inode: data and attribute fork extents, then
    /// the inode slot itself, in the same transaction chain.
    fn free_inode_space(&self, tx: &mut Transaction, inode: &Arc<Inode>) -> Result<()> {
        let fs = self.features();
        truncate_to(tx, self.cache(), fs, inode, 0)?;

        let attr_extents: Vec<uxfs_ondisk::ExtentRec> = inode
            .read()
            .attr_fork
            .as_ref()
            .map(|f| f.extents().to_vec())
            .unwrap_or_default();
        for rec in attr_extents {
            uxfs_alloc::free(tx, rec.startblock, rec.blockcount)?;
        }

        {
            let mut state = inode.write();
            state.core.mode = 0;
            state.core.size = 0;
            state.core.nblocks = 0;
            state.core.forkoff = 0;
            state.attr_fork = None;
            state.data_fork = Fork::Extents(Vec::new());
        }
        tx.log_inode(inode, InodeLogFlags::CORE)?;
        uxfs_alloc::free_inode(tx, self.cache(), fs, inode.ino())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &[u8]) -> Result<()> {
        let _w = self.write_guard();
        self.check_writable()?;

        let (parent, name) = self.lookup_parent(path)?;
        let target = dir::lookup(self.cache(), self.features(), &parent, &name)?
            .ok_or_else(|| XfsError::NotFound(String::from_utf8_lossy(&name).into_owned()))?;
        let inode = self.iget(target)?;
        if !inode.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        if target == self.features().rootino {
            return Err(XfsError::Invalid("cannot remove the root directory"));
        }
        if inode.read().core.nlink > 2 || !dir::is_empty(self.cache(), self.features(), &inode)? {
            return Err(XfsError::NotEmpty);
        }

        let mut tx = self.txmgr().begin_reserved(TxKind::Remove, 0)?;
        let result = self.rmdir_body(&mut tx, &parent, &name, &inode);
        match result {
            Ok(()) => {
                self.commit_tx(tx)?;
                self.icache().forget(target);
                Ok(())
            }
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    fn rmdir_body(
        &self,
        tx: &mut Transaction,
        parent: &Arc<Inode>,
        name: &[u8],
        inode: &Arc<Inode>,
    ) -> Result<()> {
        let fs = self.features();
        self.join_ordered(tx, &[parent, inode])?;

        dir::remove(tx, self.cache(), fs, parent, name, inode.ino())?;
        let ts = now();
        {
            let mut pstate = parent.write();
            pstate.core.nlink -= 1; // the removed "..'s" back-reference
            touch_mtime_ctime(&mut pstate.core, ts);
        }
        tx.log_inode(parent, InodeLogFlags::CORE)?;

        {
            let mut state = inode.write();
            state.core.nlink = 0;
            touch_ctime(&mut state.core, ts);
        }
        tx.log_inode(inode, InodeLogFlags::CORE)?;
        self.free_inode_space(tx, inode)?;

        uxfs_alloc::finish(tx, self.cache(), fs)?;
        debug!(target: "uxfs::ops", event = "rmdir", ino = inode.ino().0);
        Ok(())
    }

    // ── rename ──────────────────────────────────────────────────────────────

    /// Rename, overwriting a compatible destination.
    pub fn rename(&self, src_path: &[u8], dst_path: &[u8]) -> Result<()> {
        let _w = self.write_guard();
        self.check_writable()?;
        let fs = self.features();

        let (src_parent, src_name) = self.lookup_parent(src_path)?;
        let (dst_parent, dst_name) = self.lookup_parent(dst_path)?;
        dir::check_name(&dst_name)?;

        let src_ino = dir::lookup(self.cache(), fs, &src_parent, &src_name)?
            .ok_or_else(|| XfsError::NotFound(String::from_utf8_lossy(&src_name).into_owned()))?;
        let src_inode = self.iget(src_ino)?;

        // Same directory, same byte string: success without a transaction.
        if src_parent.ino() == dst_parent.ino() && src_name == dst_name {
            return Ok(());
        }

        // A directory cannot move into itself or its own subtree.
        if src_inode.is_dir()
            && (dst_parent.ino() == src_ino || self.is_descendant(src_ino, &dst_parent)?)
        {
            return Err(XfsError::Invalid("rename into own subtree"));
        }

        let dst_existing = dir::lookup(self.cache(), fs, &dst_parent, &dst_name)?;
        let dst_inode = match dst_existing {
            Some(ino) if ino == src_ino => return Ok(()), // same inode: no-op
            Some(ino) => {
                let inode = self.iget(ino)?;
                match (src_inode.is_dir(), inode.is_dir()) {
                    (false, true) => return Err(XfsError::IsDirectory),
                    (true, false) => return Err(XfsError::NotDirectory),
                    (true, true)
                        if inode.read().core.nlink > 2
                            || !dir::is_empty(self.cache(), fs, &inode)? =>
                    {
                        return Err(XfsError::NotEmpty)
                    }
                    _ => {}
                }
                Some(inode)
            }
            None => None,
        };

        let mut tx = self.txmgr().begin_reserved(TxKind::Rename, 0)?;
        let result = self.rename_body(
            &mut tx,
            &src_parent,
            &src_name,
            &src_inode,
            &dst_parent,
            &dst_name,
            dst_inode.as_ref(),
        );
        match result {
            Ok(freed) => {
                self.commit_tx(tx)?;
                if let Some(ino) = freed {
                    self.icache().forget(ino);
                }
                Ok(())
            }
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_body(
        &self,
        tx: &mut Transaction,
        src_parent: &Arc<Inode>,
        src_name: &[u8],
        src_inode: &Arc<Inode>,
        dst_parent: &Arc<Inode>,
        dst_name: &[u8],
        dst_inode: Option<&Arc<Inode>>,
    ) -> Result<Option<InodeNumber>> {
        let fs = self.features();
        let mut join: Vec<&Arc<Inode>> = vec![src_parent, dst_parent, src_inode];
        if let Some(dst) = dst_inode {
            join.push(dst);
        }
        self.join_ordered(tx, &join)?;

        let ts = now();
        let same_dir = src_parent.ino() == dst_parent.ino();
        let src_is_dir = src_inode.is_dir();
        let mut freed = None;

        // Overwrite: the destination entry goes away first.
        if let Some(dst) = dst_inode {
            dir::remove(tx, self.cache(), fs, dst_parent, dst_name, dst.ino())?;
            let nlink = {
                let mut state = dst.write();
                if state.core.mode & S_IFMT == S_IFDIR {
                    state.core.nlink = 0;
                } else {
                    state.core.nlink -= 1;
                }
                touch_ctime(&mut state.core, ts);
                state.core.nlink
            };
            tx.log_inode(dst, InodeLogFlags::CORE)?;
            if dst.is_dir() {
                dst_parent.write().core.nlink -= 1;
            }
            if nlink == 0 {
                self.free_inode_space(tx, dst)?;
                freed = Some(dst.ino());
            }
        }

        dir::insert(
            tx,
            self.cache(),
            fs,
            dst_parent,
            dst_name,
            src_inode.ino(),
            FileType::from_mode(src_inode.mode()),
        )?;
        dir::remove(tx, self.cache(), fs, src_parent, src_name, src_inode.ino())?;

        if src_is_dir && !same_dir {
            // Retarget "..", move the back-reference between parents.
            dir::replace(tx, self.cache(), fs, src_inode, b"..", dst_parent.ino())?;
            src_parent.write().core.nlink -= 1;
            dst_parent.write().core.nlink += 1;
        }

        touch_mtime_ctime(&mut src_parent.write().core, ts);
        tx.log_inode(src_parent, InodeLogFlags::CORE)?;
        if !same_dir {
            touch_mtime_ctime(&mut dst_parent.write().core, ts);
            tx.log_inode(dst_parent, InodeLogFlags::CORE)?;
        }
        touch_ctime(&mut src_inode.write().core, ts);
        tx.log_inode(src_inode, InodeLogFlags::CORE)?;

        uxfs_alloc::finish(tx, self.cache(), fs)?;
        debug!(
            target: "uxfs::ops",
            event = "rename",
            src = src_inode.ino().0,
            overwrote = dst_inode.is_some()
        );
        Ok(freed)
    }

    /// Whether `node` sits underneath directory `ancestor` in the tree.
    fn is_descendant(&self, ancestor: InodeNumber, node: &Arc<Inode>) -> Result<bool> {
        let fs = self.features();
        let mut current = Arc::clone(node);
        // The tree has no cycles by construction; the bound guards against
        // on-disk corruption.
        for _ in 0..4096 {
            if current.ino() == ancestor {
                return Ok(true);
            }
            if current.ino() == fs.rootino {
                return Ok(false);
            }
            let parent = uxfs_dir::lookup(self.cache(), fs, &current, b"..")?
                .ok_or_else(|| XfsError::Corruption {
                    daddr: 0,
                    detail: format!("directory {} has no '..'", current.ino()),
                })?;
            current = self.iget(parent)?;
        }
        Err(XfsError::Corruption {
            daddr: 0,
            detail: "directory ancestry does not reach the root".to_owned(),
        })
    }

    // ── link / symlink ──────────────────────────────────────────────────────

    /// Hard-link `src_path` under a new name.
    pub fn link(&self, src_path: &[u8], dst_path: &[u8]) -> Result<()> {
        let _w = self.write_guard();
        self.check_writable()?;
        let fs = self.features();

        let src_inode = self.resolve(src_path)?;
        if src_inode.is_dir() {
            return Err(XfsError::NotPermitted);
        }
        if src_inode.read().core.nlink >= MAX_LINK {
            return Err(XfsError::TooManyLinks);
        }
        let (dst_parent, dst_name) = self.lookup_parent(dst_path)?;
        dir::check_name(&dst_name)?;
        if dir::lookup(self.cache(), fs, &dst_parent, &dst_name)?.is_some() {
            return Err(XfsError::Exists);
        }

        let mut tx = self.txmgr().begin_reserved(TxKind::Link, 0)?;
        let result = (|| -> Result<()> {
            self.join_ordered(&mut tx, &[&dst_parent, &src_inode])?;
            let ts = now();
            {
                let mut state = src_inode.write();
                state.core.nlink += 1;
                touch_ctime(&mut state.core, ts);
            }
            tx.log_inode(&src_inode, InodeLogFlags::CORE)?;
            dir::insert(
                &mut tx,
                self.cache(),
                fs,
                &dst_parent,
                &dst_name,
                src_inode.ino(),
                FileType::from_mode(src_inode.mode()),
            )?;
            touch_mtime_ctime(&mut dst_parent.write().core, ts);
            tx.log_inode(&dst_parent, InodeLogFlags::CORE)?;
            uxfs_alloc::finish(&mut tx, self.cache(), fs)
        })();
        match result {
            Ok(()) => self.commit_tx(tx),
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    /// Create a symbolic link holding `target`.
    pub fn symlink(&self, path: &[u8], target: &[u8]) -> Result<FileAttr> {
        let _w = self.write_guard();
        self.check_writable()?;
        if target.is_empty() {
            return Err(XfsError::Invalid("empty symlink target"));
        }
        if target.len() > MAX_SYMLINK_LEN {
            return Err(XfsError::NameTooLong);
        }

        let (parent, name) = self.lookup_parent(path)?;
        dir::check_name(&name)?;
        if dir::lookup(self.cache(), self.features(), &parent, &name)?.is_some() {
            return Err(XfsError::Exists);
        }

        let mut tx = self.txmgr().begin_reserved(TxKind::Symlink, 0)?;
        let result = self.symlink_body(&mut tx, &parent, &name, target);
        match result {
            Ok(inode) => {
                self.commit_tx(tx)?;
                Ok(self.attr_of(&inode))
            }
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    fn symlink_body(
        &self,
        tx: &mut Transaction,
        parent: &Arc<Inode>,
        name: &[u8],
        target: &[u8],
    ) -> Result<Arc<Inode>> {
        let fs = self.features();
        tx.join_inode(parent)?;

        let hint_agno = fs.geo.ino_to_agno(parent.ino());
        let ino = uxfs_alloc::alloc_inode(tx, self.cache(), fs, hint_agno, false)?;
        let ts = now();
        let (uid, gid) = self.credentials();
        let mut state = init_inode(fs.v5, fs.uuid, ino, S_IFLNK | 0o777, 1, uid, gid, 0, ts);
        state.core.size = target.len() as u64;

        let literal = state.core.data_fork_size(fs.geo.inode_size as usize);
        let inline = target.len() <= literal;
        if inline {
            state.data_fork = Fork::Local(target.to_vec());
        }
        let inode = self.icache().install_new(ino, state);
        tx.join_inode(&inode)?;

        if inline {
            tx.log_inode(&inode, InodeLogFlags::CORE | InodeLogFlags::DDATA)?;
        } else {
            self.write_remote_symlink(tx, &inode, target)?;
        }

        dir::insert(tx, self.cache(), fs, parent, name, ino, FileType::Symlink)?;
        touch_mtime_ctime(&mut parent.write().core, ts);
        tx.log_inode(parent, InodeLogFlags::CORE)?;
        uxfs_alloc::finish(tx, self.cache(), fs)?;
        debug!(target: "uxfs::ops", event = "symlink", ino = ino.0, inline, len = target.len());
        Ok(inode)
    }

    /// Write an extent-backed symlink body (V5 blocks carry headers).
    fn write_remote_symlink(
        &self,
        tx: &mut Transaction,
        inode: &Arc<Inode>,
        target: &[u8],
    ) -> Result<()> {
        let fs = self.features();
        let bs = fs.geo.block_size as usize;
        let payload_per_block = if fs.v5 { bs - SYMLINK_HDR_SIZE } else { bs };
        let nblocks = target.len().div_ceil(payload_per_block) as u64;

        let maps = ensure_mapped(tx, self.cache(), fs, inode, FileBlock(0), nblocks)?;
        let mut written = 0_usize;
        for map in maps {
            let disk = map.disk_block.ok_or_else(|| XfsError::Format(
                "symlink body mapping left a hole".to_owned(),
            ))?;
            for i in 0..map.len {
                let chunk = (target.len() - written).min(payload_per_block);
                let daddr = fs.geo.fsb_to_daddr(uxfs_types::FsBlock(disk.0 + i));
                let buf = tx.get_buf_uninit(
                    self.cache(),
                    daddr,
                    bs,
                    fs.v5.then_some(SYMLINK_CRC_OFF),
                )?;
                {
                    let mut data = buf.data_mut();
                    if fs.v5 {
                        SymlinkHdr {
                            offset: written as u32,
                            bytes: chunk as u32,
                        }
                        .encode(&mut data, daddr.0, inode.ino().0, &fs.uuid);
                        data[SYMLINK_HDR_SIZE..SYMLINK_HDR_SIZE + chunk]
                            .copy_from_slice(&target[written..written + chunk]);
                    } else {
                        data[..chunk].copy_from_slice(&target[written..written + chunk]);
                    }
                }
                tx.log_buf(&buf, 0, bs - 1)?;
                written += chunk;
                if written >= target.len() {
                    break;
                }
            }
        }
        tx.log_inode(inode, InodeLogFlags::CORE | InodeLogFlags::DEXT)?;
        Ok(())
    }

    // ── setattr family ──────────────────────────────────────────────────────

    /// chmod: permission bits change, type bits are immutable.
    pub fn chmod(&self, path: &[u8], mode: u16) -> Result<()> {
        self.setattr(path, |core, ts| {
            core.mode = (core.mode & S_IFMT) | (mode & !S_IFMT);
            touch_ctime(core, ts);
        })
    }

    /// chown: changing either id clears setuid/setgid.
    pub fn chown(&self, path: &[u8], uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.setattr(path, |core, ts| {
            let mut changed = false;
            if let Some(uid) = uid {
                changed |= core.uid != uid;
                core.uid = uid;
            }
            if let Some(gid) = gid {
                changed |= core.gid != gid;
                core.gid = gid;
            }
            if changed {
                core.mode &= !(S_ISUID | S_ISGID);
            }
            touch_ctime(core, ts);
        })
    }

    /// utimens with `Now`/`Omit` sentinels; ctime always updates.
    pub fn utimens(&self, path: &[u8], atime: TimeUpdate, mtime: TimeUpdate) -> Result<()> {
        self.setattr(path, |core, ts| {
            if let Some(t) = atime.resolve(ts) {
                core.atime = t;
            }
            if let Some(t) = mtime.resolve(ts) {
                core.mtime = t;
            }
            touch_ctime(core, ts);
        })
    }

    fn setattr(
        &self,
        path: &[u8],
        apply: impl FnOnce(&mut uxfs_ondisk::DiCore, Timestamp),
    ) -> Result<()> {
        let _w = self.write_guard();
        self.check_writable()?;
        let inode = self.resolve(path)?;

        let mut tx = self.txmgr().begin_reserved(TxKind::Setattr, 0)?;
        let result = (|| -> Result<()> {
            tx.join_inode(&inode)?;
            apply(&mut inode.write().core, now());
            tx.log_inode(&inode, InodeLogFlags::CORE)
        })();
        match result {
            Ok(()) => self.commit_tx(tx),
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    // ── truncate ────────────────────────────────────────────────────────────

    /// Change a regular file's size; shrinking frees blocks past the new
    /// end, growth is sparse.
    pub fn truncate(&self, path: &[u8], new_size: u64) -> Result<()> {
        let _w = self.write_guard();
        self.check_writable()?;
        let inode = self.resolve(path)?;
        if !inode.is_reg() {
            return Err(XfsError::Invalid("truncate of non-regular file"));
        }

        let mut tx = self.txmgr().begin_reserved(TxKind::Truncate, 0)?;
        let result = (|| -> Result<()> {
            let fs = self.features();
            tx.join_inode(&inode)?;
            let old_size = inode.read().core.size;
            if new_size < old_size {
                let keep_blocks = fs.geo.b_to_fsb(new_size);
                truncate_to(&mut tx, self.cache(), fs, &inode, keep_blocks)?;
            }
            {
                let mut state = inode.write();
                state.core.size = new_size;
                touch_mtime_ctime(&mut state.core, now());
            }
            tx.log_inode(&inode, InodeLogFlags::CORE)?;
            uxfs_alloc::finish(&mut tx, self.cache(), fs)
        })();
        match result {
            Ok(()) => self.commit_tx(tx),
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    // ── write ───────────────────────────────────────────────────────────────

    /// Write `data` at `offset`, extending the file as needed.
    ///
    /// Processed in block-aligned chunks, one transaction each; a failure
    /// after some chunks committed reports the bytes already written.
    pub fn write(&self, path: &[u8], data: &[u8], offset: u64) -> Result<usize> {
        let _w = self.write_guard();
        self.check_writable()?;
        let inode = self.resolve(path)?;
        if !inode.is_reg() {
            return Err(XfsError::Invalid("write to non-regular file"));
        }

        let bs = u64::from(self.features().geo.block_size);
        let mut written = 0_usize;
        while written < data.len() {
            let cur = offset + written as u64;
            // Chunk ends at a block boundary, at most 16 blocks out.
            let chunk_end = ((cur / bs) + WRITE_CHUNK_BLOCKS) * bs;
            let chunk = ((chunk_end - cur) as usize).min(data.len() - written);

            match self.write_chunk(&inode, &data[written..written + chunk], cur) {
                Ok(()) => written += chunk,
                Err(e) if written > 0 => {
                    debug!(target: "uxfs::ops", event = "short_write", written, error = %e);
                    return Ok(written);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn write_chunk(&self, inode: &Arc<Inode>, data: &[u8], offset: u64) -> Result<()> {
        let fs = self.features();
        let bs = u64::from(fs.geo.block_size);
        let first_fb = offset / bs;
        let last_fb = (offset + data.len() as u64 - 1) / bs;
        let count = last_fb - first_fb + 1;

        let mut tx = self.txmgr().begin_reserved(TxKind::Write, count)?;
        let result = (|| -> Result<()> {
            tx.join_inode(inode)?;

            // Remember which blocks were holes: they need zero-filled
            // buffers rather than stale disk content.
            let pre = map_range(&inode.read().data_fork, FileBlock(first_fb), count);
            let was_hole = |fb: u64| {
                pre.iter().any(|m| {
                    m.disk_block.is_none() && fb >= m.file_block.0 && fb < m.file_block.0 + m.len
                })
            };

            let maps = ensure_mapped(&mut tx, self.cache(), fs, inode, FileBlock(first_fb), count)?;
            for map in maps {
                let disk = map.disk_block.ok_or_else(|| XfsError::NoSpace)?;
                for i in 0..map.len {
                    let fb = map.file_block.0 + i;
                    let daddr = fs.geo.fsb_to_daddr(uxfs_types::FsBlock(disk.0 + i));
                    let block_start = fb * bs;
                    let copy_start = block_start.max(offset);
                    let copy_end = (block_start + bs).min(offset + data.len() as u64);
                    if copy_start >= copy_end {
                        continue;
                    }

                    let fresh = was_hole(fb);
                    let buf = if fresh {
                        tx.get_buf_uninit(self.cache(), daddr, bs as usize, None)?
                    } else {
                        tx.get_buf(self.cache(), daddr, bs as usize, None)?
                    };
                    let first = (copy_start - block_start) as usize;
                    let last = (copy_end - block_start) as usize - 1;
                    {
                        let mut bytes = buf.data_mut();
                        let src = (copy_start - offset) as usize;
                        bytes[first..=last]
                            .copy_from_slice(&data[src..src + (last - first + 1)]);
                    }
                    // Fresh blocks are logged whole so the zeroes persist.
                    if fresh {
                        tx.log_buf(&buf, 0, bs as usize - 1)?;
                    } else {
                        tx.log_buf(&buf, first, last)?;
                    }
                }
            }

            let end = offset + data.len() as u64;
            {
                let mut state = inode.write();
                if end > state.core.size {
                    state.core.size = end;
                }
                touch_mtime_ctime(&mut state.core, now());
            }
            tx.log_inode(inode, InodeLogFlags::CORE)?;
            uxfs_alloc::finish(&mut tx, self.cache(), fs)
        })();
        match result {
            Ok(()) => self.commit_tx(tx),
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }
}
