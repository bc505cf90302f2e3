#![forbid(unsafe_code)]
//! Space and inode allocation.
//!
//! The allocator serves extent requests from the per-AG free-space btrees
//! (by-block and by-size) and inode requests from the per-AG inode btree,
//! all through AGF/AGI headers. Frees queued under a transaction are
//! applied by [`finish`] so ordering constraints across sub-operations
//! hold; allocation takes effect immediately.
//!
//! The by-size tree is always rewritten from the by-block record set, so
//! the two trees cannot drift apart. Trees are read and written at
//! root-leaf depth; a deeper tree refuses mutation.

use tracing::{debug, trace};
use uxfs_block::{BufCache, BufHandle};
use uxfs_error::{Result, XfsError};
use uxfs_ondisk::btree::{
    AllocRec, InobtRec, ShortBtreeHdr, ABTB_CRC_MAGIC, ABTB_MAGIC, ABTC_CRC_MAGIC, ABTC_MAGIC,
    IBT_CRC_MAGIC, IBT_MAGIC, INODES_PER_CHUNK, SHORT_BTREE_CRC_OFF,
};
use uxfs_ondisk::{cksum, Agf, Agi, DInode, FsMeta, AGF_CRC_OFF, AGI_CRC_OFF};
use uxfs_trans::{SbDelta, Transaction};
use uxfs_types::{AgBlock, AgNumber, DAddr, FsBlock, InodeNumber, NULL_AGINO};

// ── Hints and results ───────────────────────────────────────────────────────

/// Placement hint for extent allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocHint {
    /// Preferred allocation group (e.g. the parent directory's).
    pub agno: Option<AgNumber>,
    /// Preferred neighborhood (e.g. just past the file's last extent).
    pub near: Option<FsBlock>,
}

/// Result of one extent allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    pub start: FsBlock,
    pub len: u32,
}

// ── AG header addressing ────────────────────────────────────────────────────

/// 512-byte basic blocks per device sector.
fn bb_per_sector(fs: &FsMeta) -> u64 {
    u64::from(fs.geo.sector_size >> 9)
}

fn agf_daddr(fs: &FsMeta, agno: AgNumber) -> DAddr {
    DAddr(fs.geo.ag_daddr(agno).0 + bb_per_sector(fs))
}

fn agi_daddr(fs: &FsMeta, agno: AgNumber) -> DAddr {
    DAddr(fs.geo.ag_daddr(agno).0 + 2 * bb_per_sector(fs))
}

fn crc_off(fs: &FsMeta, off: usize) -> Option<usize> {
    fs.v5.then_some(off)
}

// ── Free-space state ────────────────────────────────────────────────────────

struct FreeSpace {
    agno: AgNumber,
    agf: Agf,
    agf_buf: BufHandle,
    bno_buf: BufHandle,
    cnt_buf: BufHandle,
    recs: Vec<AllocRec>,
}

fn load_freespace(
    tx: &mut Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    agno: AgNumber,
) -> Result<FreeSpace> {
    let sect = fs.geo.sector_size as usize;
    let agf_buf = tx.get_buf(cache, agf_daddr(fs, agno), sect, crc_off(fs, AGF_CRC_OFF))?;
    let agf = {
        let data = agf_buf.data();
        if !Agf::verify_crc(&data, fs.v5) {
            return Err(XfsError::Corruption {
                daddr: agf_buf.daddr().0,
                detail: format!("AGF {agno} checksum mismatch"),
            });
        }
        Agf::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?
    };

    if agf.bno_level != 1 || agf.cnt_level != 1 {
        return Err(XfsError::Corruption {
            daddr: agf_buf.daddr().0,
            detail: "free-space btree deeper than root leaf".to_owned(),
        });
    }

    let bs = fs.geo.block_size as usize;
    let bno_buf = tx.get_buf(
        cache,
        fs.geo.fsb_to_daddr(fs.geo.ag_to_fsb(agno, AgBlock(agf.bno_root))),
        bs,
        crc_off(fs, SHORT_BTREE_CRC_OFF),
    )?;
    let cnt_buf = tx.get_buf(
        cache,
        fs.geo.fsb_to_daddr(fs.geo.ag_to_fsb(agno, AgBlock(agf.cnt_root))),
        bs,
        crc_off(fs, SHORT_BTREE_CRC_OFF),
    )?;

    let recs = {
        let data = bno_buf.data();
        if !uxfs_ondisk::btree::verify_short_crc(&data) {
            return Err(XfsError::Corruption {
                daddr: bno_buf.daddr().0,
                detail: "by-block btree checksum mismatch".to_owned(),
            });
        }
        let hdr = ShortBtreeHdr::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?;
        if hdr.magic != ABTB_MAGIC && hdr.magic != ABTB_CRC_MAGIC {
            return Err(XfsError::Corruption {
                daddr: bno_buf.daddr().0,
                detail: format!("bad by-block btree magic {:#x}", hdr.magic),
            });
        }
        let base = ShortBtreeHdr::hdr_size(hdr.magic);
        let mut recs = Vec::with_capacity(usize::from(hdr.numrecs));
        for i in 0..usize::from(hdr.numrecs) {
            recs.push(
                AllocRec::decode(&data, base + i * AllocRec::SIZE)
                    .map_err(|e| XfsError::Format(e.to_string()))?,
            );
        }
        recs
    };

    Ok(FreeSpace {
        agno,
        agf,
        agf_buf,
        bno_buf,
        cnt_buf,
        recs,
    })
}

fn store_freespace(tx: &mut Transaction, fs: &FsMeta, space: &mut FreeSpace) -> Result<()> {
    let bs = fs.geo.block_size as usize;
    if space.recs.len() > AllocRec::maxrecs(bs, fs.v5) {
        return Err(XfsError::Corruption {
            daddr: space.bno_buf.daddr().0,
            detail: "free-space record set overflows the root leaf".to_owned(),
        });
    }

    space.recs.sort_by_key(|r| r.startblock);

    let (bno_magic, cnt_magic) = if fs.v5 {
        (ABTB_CRC_MAGIC, ABTC_CRC_MAGIC)
    } else {
        (ABTB_MAGIC, ABTC_MAGIC)
    };

    write_leaf(tx, fs, &space.bno_buf, bno_magic, space.agno, &space.recs)?;
    let mut by_size = space.recs.clone();
    by_size.sort_by_key(|r| (r.blockcount, r.startblock));
    write_leaf(tx, fs, &space.cnt_buf, cnt_magic, space.agno, &by_size)?;

    space.agf.freeblks = space.recs.iter().map(|r| r.blockcount).sum();
    space.agf.longest = space.recs.iter().map(|r| r.blockcount).max().unwrap_or(0);

    let sect = fs.geo.sector_size as usize;
    {
        let mut data = space.agf_buf.data_mut();
        space.agf.encode(&mut data);
    }
    tx.log_buf(&space.agf_buf, 0, sect - 1)?;
    Ok(())
}

fn write_leaf(
    tx: &mut Transaction,
    fs: &FsMeta,
    buf: &BufHandle,
    magic: u32,
    agno: AgNumber,
    recs: &[AllocRec],
) -> Result<()> {
    let bs = fs.geo.block_size as usize;
    {
        let mut data = buf.data_mut();
        data.fill(0);
        let mut hdr = ShortBtreeHdr::new_leaf(magic);
        hdr.numrecs = recs.len() as u16;
        hdr.encode(&mut data, buf.daddr().0, agno.0, &fs.uuid);
        let base = ShortBtreeHdr::hdr_size(magic);
        for (i, rec) in recs.iter().enumerate() {
            rec.encode(&mut data, base + i * AllocRec::SIZE);
        }
    }
    tx.log_buf(buf, 0, bs - 1)
}

// ── Record-set manipulation (pure) ──────────────────────────────────────────

fn roundup_u32(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Carve `want` blocks out of the record set, honoring alignment, near the
/// `near` AG block when possible. Returns `(start, len)`; `len` may fall
/// short of `want` when no extent is long enough.
fn take_extent(recs: &mut Vec<AllocRec>, want: u32, align: u32, near: Option<u32>) -> Option<(u32, u32)> {
    #[derive(Clone, Copy)]
    struct Candidate {
        idx: usize,
        aligned: u32,
        avail: u32,
    }

    let mut best: Option<Candidate> = None;
    for (idx, rec) in recs.iter().enumerate() {
        let aligned = roundup_u32(rec.startblock, align);
        let end = rec.startblock + rec.blockcount;
        if aligned >= end {
            continue;
        }
        let avail = end - aligned;
        let cand = Candidate { idx, aligned, avail };
        best = Some(match best {
            None => cand,
            Some(prev) => {
                let prev_fits = prev.avail >= want;
                let cand_fits = avail >= want;
                let better = match (prev_fits, cand_fits) {
                    (true, false) => false,
                    (false, true) => true,
                    (true, true) => match near {
                        Some(goal) => {
                            cand.aligned.abs_diff(goal) < prev.aligned.abs_diff(goal)
                        }
                        None => false,
                    },
                    (false, false) => avail > prev.avail,
                };
                if better {
                    cand
                } else {
                    prev
                }
            }
        });
    }

    let cand = best?;
    let got = cand.avail.min(want);
    let rec = recs[cand.idx];
    recs.remove(cand.idx);

    // Front remainder (alignment gap).
    if cand.aligned > rec.startblock {
        recs.push(AllocRec {
            startblock: rec.startblock,
            blockcount: cand.aligned - rec.startblock,
        });
    }
    // Back remainder.
    let taken_end = cand.aligned + got;
    let rec_end = rec.startblock + rec.blockcount;
    if rec_end > taken_end {
        recs.push(AllocRec {
            startblock: taken_end,
            blockcount: rec_end - taken_end,
        });
    }
    recs.sort_by_key(|r| r.startblock);
    Some((cand.aligned, got))
}

/// Return `start..start+count` to the free set, coalescing neighbors.
fn insert_free(recs: &mut Vec<AllocRec>, start: u32, count: u32) -> Result<()> {
    let end = start + count;
    for rec in recs.iter() {
        let rec_end = rec.startblock + rec.blockcount;
        if start < rec_end && rec.startblock < end {
            return Err(XfsError::Format(format!(
                "double free: [{start}, {end}) overlaps free extent [{}, {rec_end})",
                rec.startblock
            )));
        }
    }

    recs.push(AllocRec {
        startblock: start,
        blockcount: count,
    });
    recs.sort_by_key(|r| r.startblock);

    // Coalesce adjacent runs in one pass.
    let mut merged: Vec<AllocRec> = Vec::with_capacity(recs.len());
    for rec in recs.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.startblock + prev.blockcount == rec.startblock => {
                prev.blockcount += rec.blockcount;
            }
            _ => merged.push(rec),
        }
    }
    *recs = merged;
    Ok(())
}

// ── Extent allocation ───────────────────────────────────────────────────────

/// Allocate a contiguous extent of up to `want` blocks (at least 1).
///
/// Shorter extents are returned when no single run satisfies `want`; the
/// caller loops. `align` is a block alignment requirement (1 for none).
pub fn allocate(
    tx: &mut Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    hint: &AllocHint,
    want: u32,
    align: u32,
) -> Result<BlockAlloc> {
    if want == 0 {
        return Err(XfsError::Invalid("zero-length allocation"));
    }

    let start_ag = hint
        .agno
        .or_else(|| hint.near.map(|fsb| fs.geo.fsb_to_ag(fsb).0))
        .unwrap_or(AgNumber(0));

    for i in 0..fs.geo.ag_count {
        let agno = AgNumber((start_ag.0 + i) % fs.geo.ag_count);
        let near = hint.near.and_then(|fsb| {
            let (a, b) = fs.geo.fsb_to_ag(fsb);
            (a == agno).then_some(b.0)
        });

        let mut space = load_freespace(tx, cache, fs, agno)?;
        if let Some((agbno, len)) = take_extent(&mut space.recs, want, align, near) {
            store_freespace(tx, fs, &mut space)?;
            tx.add_sb_delta(SbDelta {
                fdblocks: -i64::from(len),
                icount: 0,
                ifree: 0,
            });
            let start = fs.geo.ag_to_fsb(agno, AgBlock(agbno));
            debug!(
                target: "uxfs::alloc",
                event = "extent_alloc",
                agno = agno.0,
                agbno,
                len,
                want
            );
            return Ok(BlockAlloc { start, len });
        }
    }

    Err(XfsError::NoSpace)
}

/// Queue an extent free; applied at [`finish`].
pub fn free(tx: &mut Transaction, start: FsBlock, len: u64) -> Result<()> {
    tx.defer_free(start, len)
}

/// Free an extent immediately (also the worker behind deferred frees).
pub fn free_extent_now(
    tx: &mut Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    start: FsBlock,
    len: u64,
) -> Result<()> {
    let (agno, agbno) = fs.geo.fsb_to_ag(start);
    let len32 = u32::try_from(len).map_err(|_| XfsError::Invalid("extent free too long"))?;

    let mut space = load_freespace(tx, cache, fs, agno)?;
    insert_free(&mut space.recs, agbno.0, len32)?;
    store_freespace(tx, fs, &mut space)?;
    tx.add_sb_delta(SbDelta {
        fdblocks: i64::from(len32),
        icount: 0,
        ifree: 0,
    });
    trace!(target: "uxfs::alloc", event = "extent_free", agno = agno.0, agbno = agbno.0, len = len32);
    Ok(())
}

/// Apply every deferred allocator action queued on the transaction.
pub fn finish(tx: &mut Transaction, cache: &BufCache, fs: &FsMeta) -> Result<()> {
    for df in tx.take_deferred() {
        free_extent_now(tx, cache, fs, df.start, df.len)?;
    }
    Ok(())
}

// ── Inode allocation ────────────────────────────────────────────────────────

struct InodeSpace {
    agno: AgNumber,
    agi: Agi,
    agi_buf: BufHandle,
    ibt_buf: BufHandle,
    recs: Vec<InobtRec>,
}

fn load_inospace(
    tx: &mut Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    agno: AgNumber,
) -> Result<InodeSpace> {
    let sect = fs.geo.sector_size as usize;
    let agi_buf = tx.get_buf(cache, agi_daddr(fs, agno), sect, crc_off(fs, AGI_CRC_OFF))?;
    let agi = {
        let data = agi_buf.data();
        if !Agi::verify_crc(&data, fs.v5) {
            return Err(XfsError::Corruption {
                daddr: agi_buf.daddr().0,
                detail: format!("AGI {agno} checksum mismatch"),
            });
        }
        Agi::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?
    };
    if agi.level != 1 {
        return Err(XfsError::Corruption {
            daddr: agi_buf.daddr().0,
            detail: "inode btree deeper than root leaf".to_owned(),
        });
    }

    let bs = fs.geo.block_size as usize;
    let ibt_buf = tx.get_buf(
        cache,
        fs.geo.fsb_to_daddr(fs.geo.ag_to_fsb(agno, AgBlock(agi.root))),
        bs,
        crc_off(fs, SHORT_BTREE_CRC_OFF),
    )?;
    let recs = {
        let data = ibt_buf.data();
        if !uxfs_ondisk::btree::verify_short_crc(&data) {
            return Err(XfsError::Corruption {
                daddr: ibt_buf.daddr().0,
                detail: "inode btree checksum mismatch".to_owned(),
            });
        }
        let hdr = ShortBtreeHdr::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?;
        if hdr.magic != IBT_MAGIC && hdr.magic != IBT_CRC_MAGIC {
            return Err(XfsError::Corruption {
                daddr: ibt_buf.daddr().0,
                detail: format!("bad inode btree magic {:#x}", hdr.magic),
            });
        }
        let base = ShortBtreeHdr::hdr_size(hdr.magic);
        let mut recs = Vec::with_capacity(usize::from(hdr.numrecs));
        for i in 0..usize::from(hdr.numrecs) {
            recs.push(
                InobtRec::decode(&data, base + i * InobtRec::SIZE, fs.sparse_inodes)
                    .map_err(|e| XfsError::Format(e.to_string()))?,
            );
        }
        recs
    };

    Ok(InodeSpace {
        agno,
        agi,
        agi_buf,
        ibt_buf,
        recs,
    })
}

fn store_inospace(tx: &mut Transaction, fs: &FsMeta, space: &mut InodeSpace) -> Result<()> {
    let bs = fs.geo.block_size as usize;
    if space.recs.len() > InobtRec::maxrecs(bs, fs.v5) {
        return Err(XfsError::Corruption {
            daddr: space.ibt_buf.daddr().0,
            detail: "inode record set overflows the root leaf".to_owned(),
        });
    }
    space.recs.sort_by_key(|r| r.startino);

    let magic = if fs.v5 { IBT_CRC_MAGIC } else { IBT_MAGIC };
    {
        let mut data = space.ibt_buf.data_mut();
        data.fill(0);
        let mut hdr = ShortBtreeHdr::new_leaf(magic);
        hdr.numrecs = space.recs.len() as u16;
        hdr.encode(&mut data, space.ibt_buf.daddr().0, space.agno.0, &fs.uuid);
        let base = ShortBtreeHdr::hdr_size(magic);
        for (i, rec) in space.recs.iter().enumerate() {
            rec.encode(&mut data, base + i * InobtRec::SIZE, fs.sparse_inodes);
        }
    }
    tx.log_buf(&space.ibt_buf, 0, bs - 1)?;

    space.agi.freecount = space.recs.iter().map(|r| r.freecount).sum();
    let sect = fs.geo.sector_size as usize;
    {
        let mut data = space.agi_buf.data_mut();
        space.agi.encode(&mut data);
    }
    tx.log_buf(&space.agi_buf, 0, sect - 1)?;
    Ok(())
}

/// Allocate an inode number, preferring `hint_agno`.
///
/// Serves from existing chunks' free masks; allocates a fresh 64-inode
/// chunk when an AG has none. Directories take the same path (the Orlov
/// spreading of the reference allocator reduces to the AG rotation here).
pub fn alloc_inode(
    tx: &mut Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    hint_agno: AgNumber,
    _is_dir: bool,
) -> Result<InodeNumber> {
    for i in 0..fs.geo.ag_count {
        let agno = AgNumber((hint_agno.0 + i) % fs.geo.ag_count);
        let mut space = load_inospace(tx, cache, fs, agno)?;

        if space.agi.freecount == 0 && alloc_chunk(tx, cache, fs, &mut space).is_err() {
            continue;
        }

        if let Some(rec) = space.recs.iter_mut().find(|r| r.freecount > 0) {
            let bit = rec.free.trailing_zeros();
            rec.free &= !(1_u64 << bit);
            rec.freecount -= 1;
            let agino = rec.startino + bit;
            store_inospace(tx, fs, &mut space)?;
            tx.add_sb_delta(SbDelta {
                fdblocks: 0,
                icount: 0,
                ifree: -1,
            });
            let ino = fs.geo.agino_to_ino(agno, agino);
            debug!(target: "uxfs::alloc", event = "inode_alloc", agno = agno.0, agino, ino = ino.0);
            return Ok(ino);
        }
    }
    Err(XfsError::NoSpace)
}

/// Allocate and initialize a fresh inode chunk in `space`'s AG.
fn alloc_chunk(
    tx: &mut Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    space: &mut InodeSpace,
) -> Result<()> {
    let ipb = fs.geo.inodes_per_block;
    if ipb > INODES_PER_CHUNK {
        return Err(XfsError::Format(
            "inodes-per-block exceeds chunk size".to_owned(),
        ));
    }
    let blocks = INODES_PER_CHUNK / ipb;

    let mut fspace = load_freespace(tx, cache, fs, space.agno)?;
    let Some((agbno, got)) = take_extent(&mut fspace.recs, blocks, fs.inode_align, None) else {
        return Err(XfsError::NoSpace);
    };
    if got < blocks {
        // Partial chunk: put it back and fail this AG.
        insert_free(&mut fspace.recs, agbno, got)?;
        store_freespace(tx, fs, &mut fspace)?;
        return Err(XfsError::NoSpace);
    }
    store_freespace(tx, fs, &mut fspace)?;
    tx.add_sb_delta(SbDelta {
        fdblocks: -i64::from(blocks),
        icount: 0,
        ifree: 0,
    });

    // Stamp every slot in the chunk as a free inode.
    let start_agino = fs.geo.agbno_to_agino(AgBlock(agbno), 0);
    let inode_size = fs.geo.inode_size as usize;
    let version = if fs.v5 { 3 } else { 2 };
    for blk in 0..blocks {
        let fsb = fs.geo.ag_to_fsb(space.agno, AgBlock(agbno + blk));
        let buf = tx.get_buf_uninit(
            cache,
            fs.geo.fsb_to_daddr(fsb),
            fs.geo.block_size as usize,
            None,
        )?;
        {
            let mut data = buf.data_mut();
            for slot in 0..ipb {
                let agino = start_agino + blk * ipb + slot;
                let ino = fs.geo.agino_to_ino(space.agno, agino);
                let di = DInode::new_free(version, ino.0, fs.uuid);
                let off = (slot as usize) * inode_size;
                di.encode(&mut data[off..off + inode_size]);
            }
        }
        tx.log_buf(&buf, 0, fs.geo.block_size as usize - 1)?;
    }

    space.recs.push(InobtRec {
        startino: start_agino,
        freecount: INODES_PER_CHUNK,
        free: !0_u64,
    });
    space.agi.count += INODES_PER_CHUNK;
    space.agi.newino = start_agino;
    tx.add_sb_delta(SbDelta {
        fdblocks: 0,
        icount: i64::from(INODES_PER_CHUNK),
        ifree: i64::from(INODES_PER_CHUNK),
    });
    debug!(
        target: "uxfs::alloc",
        event = "chunk_alloc",
        agno = space.agno.0,
        start_agino,
        blocks
    );
    Ok(())
}

/// Return an inode number to its chunk's free mask.
pub fn free_inode(
    tx: &mut Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    ino: InodeNumber,
) -> Result<()> {
    let agno = fs.geo.ino_to_agno(ino);
    let agino = fs.geo.ino_to_agino(ino);
    let mut space = load_inospace(tx, cache, fs, agno)?;

    let rec = space
        .recs
        .iter_mut()
        .find(|r| agino >= r.startino && agino < r.startino + INODES_PER_CHUNK)
        .ok_or_else(|| XfsError::Corruption {
            daddr: 0,
            detail: format!("inode {ino} freed outside any chunk"),
        })?;
    let bit = agino - rec.startino;
    if rec.is_free(bit) {
        return Err(XfsError::Format(format!("double free of inode {ino}")));
    }
    rec.free |= 1 << bit;
    rec.freecount += 1;
    store_inospace(tx, fs, &mut space)?;
    tx.add_sb_delta(SbDelta {
        fdblocks: 0,
        icount: 0,
        ifree: 1,
    });
    trace!(target: "uxfs::alloc", event = "inode_free", ino = ino.0);
    Ok(())
}

// ── Read-only probes ────────────────────────────────────────────────────────

/// Free blocks recorded in one AG's AGF (invariant checks, statvfs).
pub fn ag_free_blocks(cache: &BufCache, fs: &FsMeta, agno: AgNumber) -> Result<u64> {
    let buf = cache.get(agf_daddr(fs, agno), fs.geo.sector_size as usize)?;
    let data = buf.data();
    let agf = Agf::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?;
    Ok(u64::from(agf.freeblks))
}

/// Free inodes recorded in one AG's AGI.
pub fn ag_free_inodes(cache: &BufCache, fs: &FsMeta, agno: AgNumber) -> Result<u64> {
    let buf = cache.get(agi_daddr(fs, agno), fs.geo.sector_size as usize)?;
    let data = buf.data();
    let agi = Agi::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?;
    Ok(u64::from(agi.freecount))
}

/// Allocated inode slots recorded in one AG's AGI.
pub fn ag_inode_count(cache: &BufCache, fs: &FsMeta, agno: AgNumber) -> Result<u64> {
    let buf = cache.get(agi_daddr(fs, agno), fs.geo.sector_size as usize)?;
    let data = buf.data();
    let agi = Agi::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?;
    Ok(u64::from(agi.count))
}

// ── Test-image formatting support ───────────────────────────────────────────

/// Write fresh AGF/AGI/btree-root structures for an AG.
///
/// This is the formatter used by tests and tooling to lay down a minimal,
/// valid AG: free space in one run, an empty inode btree. `reserved`
/// blocks at the front of the AG (headers, btree roots, log) are excluded
/// from the free list.
pub fn format_ag(
    cache: &BufCache,
    fs: &FsMeta,
    agno: AgNumber,
    ag_len: u32,
    bno_root: u32,
    cnt_root: u32,
    ino_root: u32,
    reserved: u32,
) -> Result<()> {
    let sect = fs.geo.sector_size as usize;
    let bs = fs.geo.block_size as usize;

    let agf = Agf {
        seqno: agno.0,
        length: ag_len,
        bno_root,
        cnt_root,
        bno_level: 1,
        cnt_level: 1,
        flfirst: 0,
        fllast: 0,
        flcount: 0,
        freeblks: ag_len - reserved,
        longest: ag_len - reserved,
        btreeblks: 0,
        uuid: fs.uuid,
    };
    let buf = cache.get_uninit(agf_daddr(fs, agno), sect);
    {
        let mut data = buf.data_mut();
        agf.encode(&mut data);
        if fs.v5 {
            cksum::update_cksum(&mut data, AGF_CRC_OFF);
        }
    }
    force_out(cache, &buf)?;

    let agi = Agi {
        seqno: agno.0,
        length: ag_len,
        count: 0,
        root: ino_root,
        level: 1,
        freecount: 0,
        newino: NULL_AGINO,
        dirino: NULL_AGINO,
        unlinked: [NULL_AGINO; uxfs_ondisk::agheader::AGI_UNLINKED_BUCKETS],
        uuid: fs.uuid,
    };
    let buf = cache.get_uninit(agi_daddr(fs, agno), sect);
    {
        let mut data = buf.data_mut();
        agi.encode(&mut data);
        if fs.v5 {
            cksum::update_cksum(&mut data, AGI_CRC_OFF);
        }
    }
    force_out(cache, &buf)?;

    // Free-space roots: a single record covering everything past the
    // reserved region.
    let rec = AllocRec {
        startblock: reserved,
        blockcount: ag_len - reserved,
    };
    for (root, magic) in [
        (bno_root, if fs.v5 { ABTB_CRC_MAGIC } else { ABTB_MAGIC }),
        (cnt_root, if fs.v5 { ABTC_CRC_MAGIC } else { ABTC_MAGIC }),
    ] {
        let daddr = fs.geo.fsb_to_daddr(fs.geo.ag_to_fsb(agno, AgBlock(root)));
        let buf = cache.get_uninit(daddr, bs);
        {
            let mut data = buf.data_mut();
            let mut hdr = ShortBtreeHdr::new_leaf(magic);
            hdr.numrecs = 1;
            hdr.encode(&mut data, daddr.0, agno.0, &fs.uuid);
            rec.encode(&mut data, ShortBtreeHdr::hdr_size(magic));
            if fs.v5 {
                cksum::update_cksum(&mut data, SHORT_BTREE_CRC_OFF);
            }
        }
        force_out(cache, &buf)?;
    }

    // Empty inode btree root.
    let magic = if fs.v5 { IBT_CRC_MAGIC } else { IBT_MAGIC };
    let daddr = fs.geo.fsb_to_daddr(fs.geo.ag_to_fsb(agno, AgBlock(ino_root)));
    let buf = cache.get_uninit(daddr, bs);
    {
        let mut data = buf.data_mut();
        ShortBtreeHdr::new_leaf(magic).encode(&mut data, daddr.0, agno.0, &fs.uuid);
        if fs.v5 {
            cksum::update_cksum(&mut data, SHORT_BTREE_CRC_OFF);
        }
    }
    force_out(cache, &buf)?;

    Ok(())
}

fn force_out(cache: &BufCache, buf: &BufHandle) -> Result<()> {
    // Formatting runs outside any transaction: mark and push directly.
    buf.pin(uxfs_types::TxId(u64::MAX))?;
    buf.log_range(uxfs_types::TxId(u64::MAX), 0, buf.len() - 1)?;
    buf.unpin_keep();
    cache.write_back(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;
    use uxfs_block::{ByteDevice, MemByteDevice};
    use uxfs_trans::{TxKind, TxManager};
    use uxfs_types::Geometry;

    fn test_fs() -> FsMeta {
        FsMeta {
            geo: Geometry {
                block_size: 4096,
                block_log: 12,
                sector_size: 512,
                ag_blocks: 1024,
                ag_count: 2,
                ag_blk_log: 10,
                inode_size: 512,
                inode_log: 9,
                inodes_per_block: 8,
                inopb_log: 3,
                dir_blk_log: 0,
            },
            v5: true,
            has_ftype: true,
            sparse_inodes: false,
            inode_align: 8,
            uuid: Uuid::from_u128(0xABCD),
            rootino: InodeNumber(128),
        }
    }

    fn setup() -> (FsMeta, BufCache, TxManager) {
        let fs = test_fs();
        let dev = Arc::new(MemByteDevice::new(2 * 1024 * 4096));
        let cache = BufCache::new(dev as Arc<dyn ByteDevice>);
        for agno in 0..fs.geo.ag_count {
            format_ag(&cache, &fs, AgNumber(agno), 1024, 8, 9, 10, 16).unwrap();
        }
        let mgr = TxManager::new(4096, 512);
        (fs, cache, mgr)
    }

    #[test]
    fn take_extent_respects_alignment() {
        let mut recs = vec![AllocRec {
            startblock: 3,
            blockcount: 20,
        }];
        let (start, len) = take_extent(&mut recs, 8, 8, None).unwrap();
        assert_eq!(start, 8);
        assert_eq!(len, 8);
        // Front gap [3,8) and tail [16,23) stay free.
        assert_eq!(
            recs,
            vec![
                AllocRec {
                    startblock: 3,
                    blockcount: 5
                },
                AllocRec {
                    startblock: 16,
                    blockcount: 7
                },
            ]
        );
    }

    #[test]
    fn take_extent_short_when_fragmented() {
        let mut recs = vec![
            AllocRec {
                startblock: 0,
                blockcount: 3,
            },
            AllocRec {
                startblock: 10,
                blockcount: 5,
            },
        ];
        let (start, len) = take_extent(&mut recs, 100, 1, None).unwrap();
        assert_eq!((start, len), (10, 5));
    }

    #[test]
    fn insert_free_coalesces() {
        let mut recs = vec![
            AllocRec {
                startblock: 0,
                blockcount: 4,
            },
            AllocRec {
                startblock: 8,
                blockcount: 4,
            },
        ];
        insert_free(&mut recs, 4, 4).unwrap();
        assert_eq!(
            recs,
            vec![AllocRec {
                startblock: 0,
                blockcount: 12
            }]
        );
    }

    #[test]
    fn insert_free_detects_double_free() {
        let mut recs = vec![AllocRec {
            startblock: 0,
            blockcount: 10,
        }];
        assert!(insert_free(&mut recs, 5, 2).is_err());
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let (fs, cache, mgr) = setup();

        let mut tx = mgr.begin_reserved(TxKind::Write, 0).unwrap();
        let alloc = allocate(&mut tx, &cache, &fs, &AllocHint::default(), 16, 1).unwrap();
        assert_eq!(alloc.len, 16);
        let delta = tx.commit(&cache, &fs.geo).unwrap();
        assert_eq!(delta.fdblocks, -16);

        assert_eq!(ag_free_blocks(&cache, &fs, AgNumber(0)).unwrap(), 1008 - 16);

        let mut tx = mgr.begin_reserved(TxKind::Truncate, 0).unwrap();
        free(&mut tx, alloc.start, u64::from(alloc.len)).unwrap();
        finish(&mut tx, &cache, &fs).unwrap();
        let delta = tx.commit(&cache, &fs.geo).unwrap();
        assert_eq!(delta.fdblocks, 16);
        assert_eq!(ag_free_blocks(&cache, &fs, AgNumber(0)).unwrap(), 1008);
    }

    #[test]
    fn allocation_falls_over_to_next_ag() {
        let (fs, cache, mgr) = setup();

        // Drain AG 0.
        let mut tx = mgr.begin_reserved(TxKind::Write, 0).unwrap();
        let a = allocate(&mut tx, &cache, &fs, &AllocHint::default(), 1008, 1).unwrap();
        assert_eq!(a.len, 1008);
        tx.commit(&cache, &fs.geo).unwrap();

        // Next allocation lands in AG 1.
        let mut tx = mgr.begin_reserved(TxKind::Write, 0).unwrap();
        let b = allocate(&mut tx, &cache, &fs, &AllocHint::default(), 4, 1).unwrap();
        tx.commit(&cache, &fs.geo).unwrap();
        assert_eq!(fs.geo.fsb_to_ag(b.start).0, AgNumber(1));
    }

    #[test]
    fn exhaustion_reports_nospace() {
        let (fs, cache, mgr) = setup();
        let mut tx = mgr.begin_reserved(TxKind::Write, 0).unwrap();
        for _ in 0..2 {
            let a = allocate(&mut tx, &cache, &fs, &AllocHint::default(), 1008, 1).unwrap();
            assert_eq!(a.len, 1008);
        }
        assert!(matches!(
            allocate(&mut tx, &cache, &fs, &AllocHint::default(), 1, 1),
            Err(XfsError::NoSpace)
        ));
        tx.cancel();
    }

    #[test]
    fn abort_restores_free_space() {
        let (fs, cache, mgr) = setup();
        let before = ag_free_blocks(&cache, &fs, AgNumber(0)).unwrap();

        let mut tx = mgr.begin_reserved(TxKind::Write, 0).unwrap();
        allocate(&mut tx, &cache, &fs, &AllocHint::default(), 64, 1).unwrap();
        tx.cancel();

        assert_eq!(ag_free_blocks(&cache, &fs, AgNumber(0)).unwrap(), before);
    }

    #[test]
    fn inode_chunk_alloc_and_free() {
        let (fs, cache, mgr) = setup();

        let mut tx = mgr.begin_reserved(TxKind::Create, 0).unwrap();
        let ino = alloc_inode(&mut tx, &cache, &fs, AgNumber(0), false).unwrap();
        let delta = tx.commit(&cache, &fs.geo).unwrap();

        // Fresh chunk: 64 inodes appeared, one was taken.
        assert_eq!(delta.icount, 64);
        assert_eq!(delta.ifree, 63);
        assert_eq!(ag_free_inodes(&cache, &fs, AgNumber(0)).unwrap(), 63);
        assert_eq!(fs.geo.ino_to_agno(ino), AgNumber(0));
        // Chunk start is aligned to the inode alignment.
        assert_eq!(fs.geo.ino_to_agbno(ino).0 % fs.inode_align, 0);

        // The slot was stamped as a valid free inode.
        let state = uxfs_inode::read_inode(&cache, &fs.geo, fs.v5, ino);
        assert!(state.is_ok());

        let mut tx = mgr.begin_reserved(TxKind::Remove, 0).unwrap();
        free_inode(&mut tx, &cache, &fs, ino).unwrap();
        let delta = tx.commit(&cache, &fs.geo).unwrap();
        assert_eq!(delta.ifree, 1);
        assert_eq!(ag_free_inodes(&cache, &fs, AgNumber(0)).unwrap(), 64);
    }

    #[test]
    fn second_inode_reuses_chunk() {
        let (fs, cache, mgr) = setup();
        let mut tx = mgr.begin_reserved(TxKind::Create, 0).unwrap();
        let a = alloc_inode(&mut tx, &cache, &fs, AgNumber(0), false).unwrap();
        let b = alloc_inode(&mut tx, &cache, &fs, AgNumber(0), false).unwrap();
        tx.commit(&cache, &fs.geo).unwrap();
        assert_eq!(b.0, a.0 + 1);
        assert_eq!(ag_free_inodes(&cache, &fs, AgNumber(0)).unwrap(), 62);
    }

    #[test]
    fn double_inode_free_rejected() {
        let (fs, cache, mgr) = setup();
        let mut tx = mgr.begin_reserved(TxKind::Create, 0).unwrap();
        let ino = alloc_inode(&mut tx, &cache, &fs, AgNumber(0), false).unwrap();
        tx.commit(&cache, &fs.geo).unwrap();

        let mut tx = mgr.begin_reserved(TxKind::Remove, 0).unwrap();
        free_inode(&mut tx, &cache, &fs, ino).unwrap();
        assert!(free_inode(&mut tx, &cache, &fs, ino).is_err());
        tx.cancel();
    }
}
