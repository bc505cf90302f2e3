#![forbid(unsafe_code)]
//! Directory engine.
//!
//! Name lookup, ordered iteration, insert, remove and replace across the
//! three on-disk layouts: shortform (inline), block (one directory block
//! with a trailing hash array), and leaf (data blocks plus a hash-sorted
//! leaf block in the 32 GiB region). The layout a directory is in follows
//! the XFS rule: local format is shortform, otherwise the highest mapped
//! byte distinguishes block from leaf.
//!
//! Mutations rebuild the touched directory block densely rather than
//! patching free spans in place; the resulting image is canonical for the
//! format (entries packed, one trailing unused span, best-free accurate).

use std::sync::Arc;
use tracing::{debug, trace};
use uxfs_block::{BufCache, BufHandle};
use uxfs_error::{Result, XfsError};
use uxfs_extent::{ensure_mapped, map_range};
use uxfs_inode::{Fork, Inode};
use uxfs_ondisk::dir::{
    self, entry_size, BlockTail, DataHdr, DataRec, LeafEntry, LeafHdr, SfDir, SfEntry,
    DIR2_BLOCK_MAGIC, DIR2_DATA_MAGIC, DIR2_LEAF1_MAGIC, DIR3_BLOCK_MAGIC, DIR3_DATA_MAGIC,
    DIR3_LEAF1_MAGIC, DIR_DATA_CRC_OFF, DIR_LEAF_CRC_OFF,
};
use uxfs_ondisk::{FsMeta, InodeLogFlags};
use uxfs_types::{FileBlock, FileType, InodeNumber, MAX_NAME_LEN};

// ── Public types ────────────────────────────────────────────────────────────

/// One entry produced by [`iterate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: InodeNumber,
    pub ftype: FileType,
    /// Dataptr cookie of this entry.
    pub cookie: u64,
    /// Cookie to resume iteration just past this entry.
    pub next_cookie: u64,
}

/// Directory layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirForm {
    Shortform,
    Block,
    Leaf,
}

fn dir_form(fs: &FsMeta, fork: &Fork) -> DirForm {
    match fork {
        Fork::Local(_) => DirForm::Shortform,
        other => {
            // Block form iff the highest mapped byte is exactly one
            // directory block (the leaf region sits far above otherwise).
            let last_end = other
                .extents()
                .iter()
                .map(uxfs_ondisk::ExtentRec::end_off)
                .max()
                .unwrap_or(0);
            if fs.geo.fsb_to_b(last_end) == u64::from(fs.geo.dir_block_size()) {
                DirForm::Block
            } else {
                DirForm::Leaf
            }
        }
    }
}

// ── Name hash ───────────────────────────────────────────────────────────────

/// The XFS directory name hash (`xfs_da_hashname`).
#[must_use]
pub fn hash_name(name: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    let mut chunk = name;
    while chunk.len() >= 4 {
        hash = (u32::from(chunk[0]) << 21)
            ^ (u32::from(chunk[1]) << 14)
            ^ (u32::from(chunk[2]) << 7)
            ^ u32::from(chunk[3])
            ^ hash.rotate_left(28);
        chunk = &chunk[4..];
    }
    match chunk.len() {
        3 => {
            (u32::from(chunk[0]) << 14)
                ^ (u32::from(chunk[1]) << 7)
                ^ u32::from(chunk[2])
                ^ hash.rotate_left(21)
        }
        2 => (u32::from(chunk[0]) << 7) ^ u32::from(chunk[1]) ^ hash.rotate_left(14),
        1 => u32::from(chunk[0]) ^ hash.rotate_left(7),
        _ => hash,
    }
}

/// Validate a candidate entry name.
pub fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(XfsError::Invalid("empty name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(XfsError::NameTooLong);
    }
    if name.contains(&b'/') {
        return Err(XfsError::Invalid("name contains '/'"));
    }
    Ok(())
}

// ── Shortform helpers ───────────────────────────────────────────────────────

/// Initial shortform image for a fresh directory: no entries, just the
/// parent pointer.
#[must_use]
pub fn init_shortform(fs: &FsMeta, parent: InodeNumber) -> Vec<u8> {
    SfDir {
        parent: parent.0,
        entries: Vec::new(),
    }
    .encode(fs.has_ftype)
}

fn decode_sf(fs: &FsMeta, fork: &Fork) -> Result<SfDir> {
    let bytes = fork
        .local_bytes()
        .ok_or_else(|| XfsError::Format("shortform directory without local fork".to_owned()))?;
    SfDir::decode(bytes, fs.has_ftype).map_err(|e| XfsError::Format(e.to_string()))
}

fn data_hdr_offset(fs: &FsMeta) -> usize {
    if fs.v5 {
        64
    } else {
        16
    }
}

/// Emulated block offsets of `.` and `..`, shared by shortform cookies and
/// block layout.
fn dot_offsets(fs: &FsMeta) -> (u32, u32) {
    let base = data_hdr_offset(fs) as u32;
    let dot = base;
    let dotdot = base + entry_size(1, fs.has_ftype) as u32;
    (dot, dotdot)
}

fn first_entry_offset(fs: &FsMeta) -> u32 {
    let (_, dotdot) = dot_offsets(fs);
    dotdot + entry_size(2, fs.has_ftype) as u32
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Resolve `name` in `dir`. `.` and `..` resolve like any other entry.
pub fn lookup(cache: &BufCache, fs: &FsMeta, dir: &Inode, name: &[u8]) -> Result<Option<InodeNumber>> {
    if !dir.is_dir() {
        return Err(XfsError::NotDirectory);
    }
    check_name(name)?;
    let state = dir.read();

    match dir_form(fs, &state.data_fork) {
        DirForm::Shortform => {
            let sf = decode_sf(fs, &state.data_fork)?;
            if name == b"." {
                return Ok(Some(dir.ino()));
            }
            if name == b".." {
                return Ok(Some(InodeNumber(sf.parent)));
            }
            Ok(sf
                .entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| InodeNumber(e.inumber)))
        }
        DirForm::Block | DirForm::Leaf => {
            let fork = state.data_fork.clone();
            drop(state);
            lookup_scan(cache, fs, &fork, name)
        }
    }
}

/// Scan-based lookup over the data blocks, consulting the hash array of a
/// block-form directory when present.
fn lookup_scan(
    cache: &BufCache,
    fs: &FsMeta,
    fork: &Fork,
    name: &[u8],
) -> Result<Option<InodeNumber>> {
    if let DirForm::Block = dir_form(fs, fork) {
        if let Some(buf) = read_dir_block(cache, fs, fork, 0)? {
            let data = buf.data();
            let hash = hash_name(name);
            let (leaf_start, count) =
                dir::block_leaf_region(&data).map_err(|e| XfsError::Format(e.to_string()))?;
            for i in 0..count {
                let ent = LeafEntry::decode(&data, leaf_start + i * LeafEntry::SIZE)
                    .map_err(|e| XfsError::Format(e.to_string()))?;
                if ent.hashval != hash || ent.address == LeafEntry::STALE {
                    continue;
                }
                let off = fs.geo.dataptr_to_byte(u64::from(ent.address)) as usize;
                if let DataRec::Entry { inumber, name: n, .. } =
                    DataRec::decode(&data, off, fs.has_ftype)
                        .map_err(|e| XfsError::Format(e.to_string()))?
                {
                    if n == name {
                        return Ok(Some(InodeNumber(inumber)));
                    }
                }
            }
            return Ok(None);
        }
        return Ok(None);
    }

    // Leaf/node form: hash-probe the leaf when it is a recognized leaf1
    // block, else walk the data blocks.
    if let Some(found) = lookup_via_leaf(cache, fs, fork, name)? {
        return Ok(Some(found));
    }
    for db in 0..data_block_count(fs, fork) {
        let Some(buf) = read_dir_block(cache, fs, fork, db)? else {
            continue;
        };
        let data = buf.data();
        if let Some(ino) = scan_block_for_name(fs, &data, name, data.len())? {
            return Ok(Some(ino));
        }
    }
    Ok(None)
}

fn lookup_via_leaf(
    cache: &BufCache,
    fs: &FsMeta,
    fork: &Fork,
    name: &[u8],
) -> Result<Option<InodeNumber>> {
    let Some(leaf_buf) = read_dir_block(cache, fs, fork, fs.geo.dir_leaf_block())? else {
        return Ok(None);
    };
    let leaf_data = leaf_buf.data();
    let hdr = match LeafHdr::decode(&leaf_data) {
        Ok(h) if h.magic == DIR2_LEAF1_MAGIC || h.magic == DIR3_LEAF1_MAGIC => h,
        // Node-form index; the caller falls back to a data scan.
        _ => return Ok(None),
    };

    let hash = hash_name(name);
    let base = LeafHdr::entries_offset(hdr.magic);
    for i in 0..usize::from(hdr.count) {
        let ent = LeafEntry::decode(&leaf_data, base + i * LeafEntry::SIZE)
            .map_err(|e| XfsError::Format(e.to_string()))?;
        if ent.hashval != hash || ent.address == LeafEntry::STALE {
            continue;
        }
        let byte = fs.geo.dataptr_to_byte(u64::from(ent.address));
        let db = fs.geo.dir_byte_to_db(byte);
        let off = fs.geo.dir_byte_to_off(byte) as usize;
        let Some(data_buf) = read_dir_block(cache, fs, fork, db)? else {
            continue;
        };
        let data = data_buf.data();
        if let DataRec::Entry { inumber, name: n, .. } =
            DataRec::decode(&data, off, fs.has_ftype).map_err(|e| XfsError::Format(e.to_string()))?
        {
            if n == name {
                return Ok(Some(InodeNumber(inumber)));
            }
        }
    }
    Ok(None)
}

fn scan_block_for_name(
    fs: &FsMeta,
    data: &[u8],
    name: &[u8],
    region_end: usize,
) -> Result<Option<InodeNumber>> {
    let hdr = DataHdr::decode(data).map_err(|e| XfsError::Format(e.to_string()))?;
    let end = entries_region_end(data, hdr.magic, region_end)?;
    let mut pos = DataHdr::entries_offset(hdr.magic);
    while pos < end {
        let rec = DataRec::decode(data, pos, fs.has_ftype)
            .map_err(|e| XfsError::Format(e.to_string()))?;
        if let DataRec::Entry {
            inumber, name: n, ..
        } = &rec
        {
            if n == name {
                return Ok(Some(InodeNumber(*inumber)));
            }
        }
        pos += rec.size();
    }
    Ok(None)
}

/// End of the live entry region: for block-form images the leaf array
/// bounds it, for data blocks the block end does.
fn entries_region_end(data: &[u8], magic: u32, region_end: usize) -> Result<usize> {
    if magic == DIR2_BLOCK_MAGIC || magic == DIR3_BLOCK_MAGIC {
        let (leaf_start, _) =
            dir::block_leaf_region(data).map_err(|e| XfsError::Format(e.to_string()))?;
        Ok(leaf_start)
    } else {
        Ok(region_end)
    }
}

// ── Block mapping helpers ───────────────────────────────────────────────────

fn data_block_count(fs: &FsMeta, fork: &Fork) -> u64 {
    // Data region only: everything below the leaf offset.
    let leaf_db = fs.geo.dir_leaf_block();
    fork.extents()
        .iter()
        .map(uxfs_ondisk::ExtentRec::end_off)
        .filter(|&e| e <= leaf_db * u64::from(fs.geo.dir_block_fsbs()))
        .max()
        .unwrap_or(0)
        / u64::from(fs.geo.dir_block_fsbs())
}

/// Read directory logical block `db`, or `None` when it is a hole.
fn read_dir_block(
    cache: &BufCache,
    fs: &FsMeta,
    fork: &Fork,
    db: u64,
) -> Result<Option<BufHandle>> {
    let fsbs = u64::from(fs.geo.dir_block_fsbs());
    let maps = map_range(fork, FileBlock(db * fsbs), fsbs);
    let Some(first) = maps.first() else {
        return Ok(None);
    };
    let Some(disk) = first.disk_block else {
        return Ok(None);
    };
    if first.len < fsbs {
        return Err(XfsError::Format(
            "directory block split across extents".to_owned(),
        ));
    }
    let buf = cache.get(fs.geo.fsb_to_daddr(disk), fs.geo.dir_block_size() as usize)?;
    // An in-transaction image has its CRC stamped at commit; verify only
    // settled buffers.
    if fs.v5 && buf.pinned_by().is_none() && !buf.is_dirty() {
        let data = buf.data();
        let ok = if db >= fs.geo.dir_leaf_block() {
            dir::verify_leaf_crc(&data)
        } else {
            dir::verify_data_crc(&data)
        };
        if !ok {
            return Err(XfsError::Corruption {
                daddr: buf.daddr().0,
                detail: format!("directory block {db} checksum mismatch"),
            });
        }
    }
    Ok(Some(buf))
}

// ── Iterate ─────────────────────────────────────────────────────────────────

/// List entries starting at `from_cookie` (0 lists everything).
///
/// `.` and `..` always come first; every entry carries a monotonically
/// increasing cookie, and any previously returned cookie is a valid resume
/// point.
pub fn iterate(cache: &BufCache, fs: &FsMeta, dir: &Inode, from_cookie: u64) -> Result<Vec<DirEntry>> {
    if !dir.is_dir() {
        return Err(XfsError::NotDirectory);
    }
    let state = dir.read();
    let form = dir_form(fs, &state.data_fork);
    match form {
        DirForm::Shortform => iterate_sf(fs, dir, &decode_sf(fs, &state.data_fork)?, from_cookie),
        DirForm::Block | DirForm::Leaf => {
            let fork = state.data_fork.clone();
            drop(state);
            iterate_data_blocks(cache, fs, &fork, from_cookie)
        }
    }
}

fn iterate_sf(fs: &FsMeta, dir: &Inode, sf: &SfDir, from: u64) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let (dot, dotdot) = dot_offsets(fs);
    let dot_ptr = fs.geo.byte_to_dataptr(fs.geo.dir_byte(0, dot));
    let dotdot_ptr = fs.geo.byte_to_dataptr(fs.geo.dir_byte(0, dotdot));

    if from <= dot_ptr {
        out.push(DirEntry {
            name: b".".to_vec(),
            ino: dir.ino(),
            ftype: FileType::Directory,
            cookie: dot_ptr,
            next_cookie: dotdot_ptr,
        });
    }
    let first_real = fs
        .geo
        .byte_to_dataptr(fs.geo.dir_byte(0, first_entry_offset(fs)));
    if from <= dotdot_ptr {
        out.push(DirEntry {
            name: b"..".to_vec(),
            ino: InodeNumber(sf.parent),
            ftype: FileType::Directory,
            cookie: dotdot_ptr,
            next_cookie: first_real,
        });
    }

    let end_ptr = fs.geo.byte_to_dataptr(fs.geo.dir_byte(1, 0));
    for (i, ent) in sf.entries.iter().enumerate() {
        let ptr = fs
            .geo
            .byte_to_dataptr(fs.geo.dir_byte(0, u32::from(ent.offset)));
        if ptr < from {
            continue;
        }
        let next = sf.entries.get(i + 1).map_or(end_ptr, |n| {
            fs.geo
                .byte_to_dataptr(fs.geo.dir_byte(0, u32::from(n.offset)))
        });
        out.push(DirEntry {
            name: ent.name.clone(),
            ino: InodeNumber(ent.inumber),
            ftype: if fs.has_ftype {
                FileType::from_tag(ent.ftype)
            } else {
                FileType::Unknown
            },
            cookie: ptr,
            next_cookie: next,
        });
    }
    Ok(out)
}

fn iterate_data_blocks(
    cache: &BufCache,
    fs: &FsMeta,
    fork: &Fork,
    from: u64,
) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let nblocks = data_block_count(fs, fork);
    let start_db = fs.geo.dir_byte_to_db(fs.geo.dataptr_to_byte(from));

    for db in start_db..nblocks {
        let Some(buf) = read_dir_block(cache, fs, fork, db)? else {
            continue;
        };
        let data = buf.data();
        let hdr = DataHdr::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?;
        let end = entries_region_end(&data, hdr.magic, data.len())?;
        let next_block_ptr = fs.geo.byte_to_dataptr(fs.geo.dir_byte(db + 1, 0));

        let mut pos = DataHdr::entries_offset(hdr.magic);
        while pos < end {
            let rec = DataRec::decode(&data, pos, fs.has_ftype)
                .map_err(|e| XfsError::Format(e.to_string()))?;
            let size = rec.size();
            if let DataRec::Entry {
                inumber,
                name,
                ftype,
                ..
            } = rec
            {
                let ptr = fs.geo.byte_to_dataptr(fs.geo.dir_byte(db, pos as u32));
                if ptr >= from {
                    let next_pos = pos + size;
                    let next = if next_pos < end {
                        fs.geo.byte_to_dataptr(fs.geo.dir_byte(db, next_pos as u32))
                    } else {
                        next_block_ptr
                    };
                    out.push(DirEntry {
                        name,
                        ino: InodeNumber(inumber),
                        ftype: if fs.has_ftype {
                            FileType::from_tag(ftype)
                        } else {
                            FileType::Unknown
                        },
                        cookie: ptr,
                        next_cookie: next,
                    });
                }
            }
            pos += size;
        }
    }
    Ok(out)
}

/// Whether the directory holds only `.` and `..`.
pub fn is_empty(cache: &BufCache, fs: &FsMeta, dir: &Inode) -> Result<bool> {
    let entries = iterate(cache, fs, dir, 0)?;
    Ok(entries
        .iter()
        .all(|e| e.name == b"." || e.name == b".."))
}

// ── Insert ──────────────────────────────────────────────────────────────────

/// A live entry carried through block rebuilds.
#[derive(Debug, Clone)]
struct LiveEntry {
    inumber: u64,
    name: Vec<u8>,
    ftype: u8,
}

/// Insert `name -> ino` into `dir` under `tx`.
///
/// Promotes shortform → block → leaf as capacity demands. The inode must
/// already be joined to the transaction.
pub fn insert(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    name: &[u8],
    ino: InodeNumber,
    ftype: FileType,
) -> Result<()> {
    check_name(name)?;
    if lookup(cache, fs, dir, name)?.is_some() {
        return Err(XfsError::Exists);
    }

    let form = dir_form(fs, &dir.read().data_fork);
    match form {
        DirForm::Shortform => insert_sf(tx, cache, fs, dir, name, ino, ftype),
        DirForm::Block => insert_block(tx, cache, fs, dir, name, ino, ftype),
        DirForm::Leaf => insert_leaf(tx, cache, fs, dir, name, ino, ftype),
    }
}

fn sf_capacity(fs: &FsMeta, dir: &Inode) -> usize {
    dir.read().core.data_fork_size(fs.geo.inode_size as usize)
}

fn insert_sf(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    name: &[u8],
    ino: InodeNumber,
    ftype: FileType,
) -> Result<()> {
    let mut sf = decode_sf(fs, &dir.read().data_fork)?;

    // Emulated offset continues past the last assigned one.
    let next_off = sf
        .entries
        .iter()
        .map(|e| u32::from(e.offset) + entry_size(e.name.len(), fs.has_ftype) as u32)
        .max()
        .unwrap_or_else(|| first_entry_offset(fs));
    sf.entries.push(SfEntry {
        name: name.to_vec(),
        offset: u16::try_from(next_off).map_err(|_| XfsError::NoSpace)?,
        ftype: ftype as u8,
        inumber: ino.0,
    });

    let encoded = sf.encode(fs.has_ftype);
    if encoded.len() <= sf_capacity(fs, dir) && sf.entries.len() < 255 {
        {
            let mut state = dir.write();
            state.core.size = encoded.len() as u64;
            state.data_fork = Fork::Local(encoded);
        }
        tx.log_inode(dir, InodeLogFlags::CORE | InodeLogFlags::DDATA)?;
        trace!(target: "uxfs::dir", event = "sf_insert", dir = dir.ino().0, namelen = name.len());
        return Ok(());
    }

    // Shortform overflow: promote to block form carrying all entries.
    sf.entries.pop();
    promote_sf_to_block(tx, cache, fs, dir, &sf)?;
    insert_block(tx, cache, fs, dir, name, ino, ftype)
}

/// Convert a shortform directory into block form.
fn promote_sf_to_block(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    sf: &SfDir,
) -> Result<()> {
    let entries: Vec<LiveEntry> = sf
        .entries
        .iter()
        .map(|e| LiveEntry {
            inumber: e.inumber,
            name: e.name.clone(),
            ftype: e.ftype,
        })
        .collect();
    let parent = InodeNumber(sf.parent);

    // The fork switches to extents before the data block maps in.
    {
        let mut state = dir.write();
        state.data_fork = Fork::Extents(Vec::new());
    }
    let fsbs = u64::from(fs.geo.dir_block_fsbs());
    ensure_mapped(tx, cache, fs, dir, FileBlock(0), fsbs)?;

    write_block_form(tx, cache, fs, dir, parent, &entries)?;
    {
        let mut state = dir.write();
        state.core.size = u64::from(fs.geo.dir_block_size());
    }
    tx.log_inode(dir, InodeLogFlags::CORE | InodeLogFlags::DEXT)?;
    debug!(target: "uxfs::dir", event = "sf_to_block", dir = dir.ino().0, entries = entries.len());
    Ok(())
}

/// Rewrite directory block 0 as a canonical block-form image.
fn write_block_form(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    parent: InodeNumber,
    entries: &[LiveEntry],
) -> Result<()> {
    let bsize = fs.geo.dir_block_size() as usize;
    let magic = if fs.v5 { DIR3_BLOCK_MAGIC } else { DIR2_BLOCK_MAGIC };
    let hdr_off = DataHdr::entries_offset(magic);

    // Leaf array: . and .. plus every live entry.
    let leaf_count = entries.len() + 2;
    let leaf_bytes = leaf_count * LeafEntry::SIZE + BlockTail::SIZE;

    let mut layout: Vec<(u32, LiveEntry)> = Vec::with_capacity(leaf_count);
    let mut pos = hdr_off;
    let dot = LiveEntry {
        inumber: dir.ino().0,
        name: b".".to_vec(),
        ftype: FileType::Directory as u8,
    };
    let dotdot = LiveEntry {
        inumber: parent.0,
        name: b"..".to_vec(),
        ftype: FileType::Directory as u8,
    };
    for ent in std::iter::once(&dot)
        .chain(std::iter::once(&dotdot))
        .chain(entries.iter())
    {
        layout.push((pos as u32, ent.clone()));
        pos += entry_size(ent.name.len(), fs.has_ftype);
    }
    if pos + leaf_bytes > bsize {
        return Err(XfsError::NoSpace);
    }

    let buf = get_dir_block_pinned(tx, cache, fs, dir, 0, DIR_DATA_CRC_OFF)?;
    {
        let mut data = buf.data_mut();
        data.fill(0);

        let free_off = pos;
        let free_len = bsize - leaf_bytes - pos;
        let hdr = DataHdr {
            magic,
            best_free: [
                (
                    if free_len > 0 { free_off as u16 } else { 0 },
                    free_len as u16,
                ),
                (0, 0),
                (0, 0),
            ],
        };
        hdr.encode(&mut data, buf.daddr().0, dir.ino().0, &fs.uuid);

        for (off, ent) in &layout {
            dir::write_entry(
                &mut data,
                *off as usize,
                ent.inumber,
                &ent.name,
                ent.ftype,
                fs.has_ftype,
            );
        }
        if free_len > 0 {
            dir::write_unused(&mut data, free_off, free_len);
        }

        // Hash-sorted leaf array ahead of the tail.
        let mut leaf: Vec<LeafEntry> = layout
            .iter()
            .map(|(off, ent)| LeafEntry {
                hashval: hash_name(&ent.name),
                address: fs.geo.byte_to_dataptr(fs.geo.dir_byte(0, *off)) as u32,
            })
            .collect();
        leaf.sort_by_key(|e| e.hashval);
        let leaf_start = bsize - BlockTail::SIZE - leaf.len() * LeafEntry::SIZE;
        for (i, ent) in leaf.iter().enumerate() {
            ent.encode(&mut data, leaf_start + i * LeafEntry::SIZE);
        }
        BlockTail {
            count: leaf.len() as u32,
            stale: 0,
        }
        .encode(&mut data);
    }
    tx.log_buf(&buf, 0, bsize - 1)?;
    Ok(())
}

/// Pin a mapped directory block for mutation.
fn get_dir_block_pinned(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Inode,
    db: u64,
    crc_off: usize,
) -> Result<BufHandle> {
    let fork = dir.read().data_fork.clone();
    let fsbs = u64::from(fs.geo.dir_block_fsbs());
    let maps = map_range(&fork, FileBlock(db * fsbs), fsbs);
    let disk = maps
        .first()
        .and_then(|m| m.disk_block)
        .ok_or_else(|| XfsError::Format(format!("directory block {db} unmapped")))?;
    tx.get_buf(
        cache,
        fs.geo.fsb_to_daddr(disk),
        fs.geo.dir_block_size() as usize,
        fs.v5.then_some(crc_off),
    )
}

/// Collect the live entries of one data block, excluding `.` and `..`.
fn collect_block_entries(
    fs: &FsMeta,
    data: &[u8],
) -> Result<(Vec<LiveEntry>, Option<InodeNumber>)> {
    let hdr = DataHdr::decode(data).map_err(|e| XfsError::Format(e.to_string()))?;
    let end = entries_region_end(data, hdr.magic, data.len())?;
    let mut out = Vec::new();
    let mut parent = None;
    let mut pos = DataHdr::entries_offset(hdr.magic);
    while pos < end {
        let rec = DataRec::decode(data, pos, fs.has_ftype)
            .map_err(|e| XfsError::Format(e.to_string()))?;
        if let DataRec::Entry {
            inumber,
            name,
            ftype,
            ..
        } = &rec
        {
            if name == b".." {
                parent = Some(InodeNumber(*inumber));
            } else if name != b"." {
                out.push(LiveEntry {
                    inumber: *inumber,
                    name: name.clone(),
                    ftype: *ftype,
                });
            }
        }
        pos += rec.size();
    }
    Ok((out, parent))
}

fn insert_block(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    name: &[u8],
    ino: InodeNumber,
    ftype: FileType,
) -> Result<()> {
    let fork = dir.read().data_fork.clone();
    let buf = read_dir_block(cache, fs, &fork, 0)?
        .ok_or_else(|| XfsError::Format("block-form directory without block 0".to_owned()))?;
    let (mut entries, parent) = collect_block_entries(fs, &buf.data())?;
    let parent = parent
        .ok_or_else(|| XfsError::Format("directory block missing '..'".to_owned()))?;
    drop(buf);

    entries.push(LiveEntry {
        inumber: ino.0,
        name: name.to_vec(),
        ftype: ftype as u8,
    });

    match write_block_form(tx, cache, fs, dir, parent, &entries) {
        Ok(()) => {
            tx.log_inode(dir, InodeLogFlags::CORE)?;
            Ok(())
        }
        Err(XfsError::NoSpace) => {
            entries.pop();
            promote_block_to_leaf(tx, cache, fs, dir, parent, &entries)?;
            insert_leaf(tx, cache, fs, dir, name, ino, ftype)
        }
        Err(e) => Err(e),
    }
}

/// Convert block form to leaf form: block 0 becomes a pure data block and
/// a leaf block materializes in the leaf region.
fn promote_block_to_leaf(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    parent: InodeNumber,
    entries: &[LiveEntry],
) -> Result<()> {
    let leaf_db = fs.geo.dir_leaf_block();
    let fsbs = u64::from(fs.geo.dir_block_fsbs());
    ensure_mapped(tx, cache, fs, dir, FileBlock(leaf_db * fsbs), fsbs)?;

    write_data_block(tx, cache, fs, dir, 0, Some(parent), entries)?;
    rebuild_leaf_index(tx, cache, fs, dir)?;
    tx.log_inode(dir, InodeLogFlags::CORE | InodeLogFlags::DEXT)?;
    debug!(target: "uxfs::dir", event = "block_to_leaf", dir = dir.ino().0, entries = entries.len());
    Ok(())
}

/// Rewrite one data block (leaf-form flavor) with the given entries.
///
/// `parent` is present only for block 0, which carries `.` and `..`.
fn write_data_block(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    db: u64,
    parent: Option<InodeNumber>,
    entries: &[LiveEntry],
) -> Result<()> {
    let bsize = fs.geo.dir_block_size() as usize;
    let magic = if fs.v5 { DIR3_DATA_MAGIC } else { DIR2_DATA_MAGIC };
    let hdr_off = DataHdr::entries_offset(magic);

    let mut layout: Vec<(u32, LiveEntry)> = Vec::new();
    let mut pos = hdr_off;
    if let Some(parent) = parent {
        for ent in [
            LiveEntry {
                inumber: dir.ino().0,
                name: b".".to_vec(),
                ftype: FileType::Directory as u8,
            },
            LiveEntry {
                inumber: parent.0,
                name: b"..".to_vec(),
                ftype: FileType::Directory as u8,
            },
        ] {
            let size = entry_size(ent.name.len(), fs.has_ftype);
            layout.push((pos as u32, ent));
            pos += size;
        }
    }
    for ent in entries {
        let size = entry_size(ent.name.len(), fs.has_ftype);
        if pos + size > bsize {
            return Err(XfsError::NoSpace);
        }
        layout.push((pos as u32, ent.clone()));
        pos += size;
    }

    let buf = get_dir_block_pinned(tx, cache, fs, dir, db, DIR_DATA_CRC_OFF)?;
    {
        let mut data = buf.data_mut();
        data.fill(0);
        let free_off = pos;
        let free_len = bsize - pos;
        let hdr = DataHdr {
            magic,
            best_free: [
                (
                    if free_len > 0 { free_off as u16 } else { 0 },
                    free_len as u16,
                ),
                (0, 0),
                (0, 0),
            ],
        };
        hdr.encode(&mut data, buf.daddr().0, dir.ino().0, &fs.uuid);
        for (off, ent) in &layout {
            dir::write_entry(
                &mut data,
                *off as usize,
                ent.inumber,
                &ent.name,
                ent.ftype,
                fs.has_ftype,
            );
        }
        if free_len >= 8 {
            dir::write_unused(&mut data, free_off, free_len);
        }
    }
    tx.log_buf(&buf, 0, bsize - 1)?;
    Ok(())
}

/// Rebuild the leaf1 hash index and best-free array from the data blocks.
fn rebuild_leaf_index(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
) -> Result<()> {
    let fork = dir.read().data_fork.clone();
    let bsize = fs.geo.dir_block_size() as usize;
    let nblocks = data_block_count(fs, &fork);

    let mut ents: Vec<LeafEntry> = Vec::new();
    let mut bests: Vec<u16> = Vec::with_capacity(nblocks as usize);
    for db in 0..nblocks {
        let Some(buf) = read_dir_block(cache, fs, &fork, db)? else {
            bests.push(u16::MAX);
            continue;
        };
        let data = buf.data();
        let hdr = DataHdr::decode(&data).map_err(|e| XfsError::Format(e.to_string()))?;
        bests.push(hdr.longest_free());
        let end = entries_region_end(&data, hdr.magic, data.len())?;
        let mut pos = DataHdr::entries_offset(hdr.magic);
        while pos < end {
            let rec = DataRec::decode(&data, pos, fs.has_ftype)
                .map_err(|e| XfsError::Format(e.to_string()))?;
            if let DataRec::Entry { name, .. } = &rec {
                ents.push(LeafEntry {
                    hashval: hash_name(name),
                    address: fs.geo.byte_to_dataptr(fs.geo.dir_byte(db, pos as u32)) as u32,
                });
            }
            pos += rec.size();
        }
    }
    ents.sort_by_key(|e| (e.hashval, e.address));

    let magic = if fs.v5 { DIR3_LEAF1_MAGIC } else { DIR2_LEAF1_MAGIC };
    let base = LeafHdr::entries_offset(magic);
    let tail_bytes = 4 + bests.len() * 2;
    if base + ents.len() * LeafEntry::SIZE + tail_bytes > bsize {
        return Err(XfsError::NoSpace);
    }

    let buf = get_dir_block_pinned(tx, cache, fs, dir, fs.geo.dir_leaf_block(), DIR_LEAF_CRC_OFF)?;
    {
        let mut data = buf.data_mut();
        data.fill(0);
        LeafHdr {
            magic,
            forw: 0,
            back: 0,
            count: ents.len() as u16,
            stale: 0,
        }
        .encode(&mut data, buf.daddr().0, dir.ino().0, &fs.uuid);
        for (i, ent) in ents.iter().enumerate() {
            ent.encode(&mut data, base + i * LeafEntry::SIZE);
        }
        dir::set_leaf_tail_bestcount(&mut data, bests.len() as u32);
        for (i, best) in bests.iter().enumerate() {
            dir::set_leaf_best(&mut data, i, bests.len(), *best);
        }
    }
    tx.log_buf(&buf, 0, bsize - 1)?;
    Ok(())
}

fn insert_leaf(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    name: &[u8],
    ino: InodeNumber,
    ftype: FileType,
) -> Result<()> {
    let fork = dir.read().data_fork.clone();
    let need = entry_size(name.len(), fs.has_ftype);
    let nblocks = data_block_count(fs, &fork);

    // First data block whose free space fits the entry.
    let mut target = None;
    for db in 0..nblocks {
        let Some(buf) = read_dir_block(cache, fs, &fork, db)? else {
            continue;
        };
        let data = buf.data();
        let free = block_free_bytes(fs, &data)?;
        if free >= need {
            target = Some(db);
            break;
        }
    }

    let db = match target {
        Some(db) => db,
        None => {
            // Grow the data region by one directory block.
            let fsbs = u64::from(fs.geo.dir_block_fsbs());
            let db = nblocks;
            ensure_mapped(tx, cache, fs, dir, FileBlock(db * fsbs), fsbs)?;
            write_data_block(tx, cache, fs, dir, db, None, &[])?;
            {
                let mut state = dir.write();
                state.core.size = (db + 1) * u64::from(fs.geo.dir_block_size());
            }
            db
        }
    };

    // Rebuild the target block with the entry appended.
    let fork = dir.read().data_fork.clone();
    let buf = read_dir_block(cache, fs, &fork, db)?
        .ok_or_else(|| XfsError::Format("target directory block vanished".to_owned()))?;
    let (mut entries, parent) = collect_block_entries(fs, &buf.data())?;
    drop(buf);
    entries.push(LiveEntry {
        inumber: ino.0,
        name: name.to_vec(),
        ftype: ftype as u8,
    });
    write_data_block(
        tx,
        cache,
        fs,
        dir,
        db,
        if db == 0 { parent } else { None },
        &entries,
    )?;
    rebuild_leaf_index(tx, cache, fs, dir)?;
    tx.log_inode(dir, InodeLogFlags::CORE)?;
    trace!(target: "uxfs::dir", event = "leaf_insert", dir = dir.ino().0, db, namelen = name.len());
    Ok(())
}

/// Free bytes in a data block's entry region.
fn block_free_bytes(fs: &FsMeta, data: &[u8]) -> Result<usize> {
    let hdr = DataHdr::decode(data).map_err(|e| XfsError::Format(e.to_string()))?;
    let end = entries_region_end(data, hdr.magic, data.len())?;
    let mut free = 0;
    let mut pos = DataHdr::entries_offset(hdr.magic);
    while pos < end {
        let rec = DataRec::decode(data, pos, fs.has_ftype)
            .map_err(|e| XfsError::Format(e.to_string()))?;
        if let DataRec::Unused { size } = rec {
            free += size;
        }
        pos += rec.size();
    }
    Ok(free)
}

// ── Remove / replace ────────────────────────────────────────────────────────

/// Remove `name` (expected to map to `ino`) from `dir`.
///
/// A block-form directory whose remaining entries fit inline demotes back
/// to shortform.
pub fn remove(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    name: &[u8],
    ino: InodeNumber,
) -> Result<()> {
    check_name(name)?;
    if name == b"." || name == b".." {
        return Err(XfsError::Invalid("cannot remove dot entries"));
    }

    let form = dir_form(fs, &dir.read().data_fork);
    match form {
        DirForm::Shortform => {
            let mut sf = decode_sf(fs, &dir.read().data_fork)?;
            let before = sf.entries.len();
            sf.entries.retain(|e| !(e.name == name && e.inumber == ino.0));
            if sf.entries.len() == before {
                return Err(XfsError::NotFound(String::from_utf8_lossy(name).into_owned()));
            }
            let encoded = sf.encode(fs.has_ftype);
            {
                let mut state = dir.write();
                state.core.size = encoded.len() as u64;
                state.data_fork = Fork::Local(encoded);
            }
            tx.log_inode(dir, InodeLogFlags::CORE | InodeLogFlags::DDATA)?;
            Ok(())
        }
        DirForm::Block => {
            let fork = dir.read().data_fork.clone();
            let buf = read_dir_block(cache, fs, &fork, 0)?
                .ok_or_else(|| XfsError::Format("block-form directory without block 0".to_owned()))?;
            let (mut entries, parent) = collect_block_entries(fs, &buf.data())?;
            drop(buf);
            let parent = parent
                .ok_or_else(|| XfsError::Format("directory block missing '..'".to_owned()))?;
            let before = entries.len();
            entries.retain(|e| !(e.name == name && e.inumber == ino.0));
            if entries.len() == before {
                return Err(XfsError::NotFound(String::from_utf8_lossy(name).into_owned()));
            }

            if let Some(encoded) = build_sf_image(fs, dir, parent, &entries) {
                // Demote: free the directory block, then go inline.
                uxfs_extent::truncate_to(tx, cache, fs, dir, 0)?;
                {
                    let mut state = dir.write();
                    state.core.size = encoded.len() as u64;
                    state.data_fork = Fork::Local(encoded);
                }
                tx.log_inode(dir, InodeLogFlags::CORE | InodeLogFlags::DDATA)?;
                debug!(target: "uxfs::dir", event = "block_to_sf", dir = dir.ino().0);
                return Ok(());
            }

            write_block_form(tx, cache, fs, dir, parent, &entries)?;
            tx.log_inode(dir, InodeLogFlags::CORE)?;
            Ok(())
        }
        DirForm::Leaf => {
            let fork = dir.read().data_fork.clone();
            let nblocks = data_block_count(fs, &fork);
            for db in 0..nblocks {
                let Some(buf) = read_dir_block(cache, fs, &fork, db)? else {
                    continue;
                };
                let (mut entries, parent) = collect_block_entries(fs, &buf.data())?;
                drop(buf);
                let before = entries.len();
                entries.retain(|e| !(e.name == name && e.inumber == ino.0));
                if entries.len() == before {
                    continue;
                }
                write_data_block(
                    tx,
                    cache,
                    fs,
                    dir,
                    db,
                    if db == 0 { parent } else { None },
                    &entries,
                )?;
                rebuild_leaf_index(tx, cache, fs, dir)?;
                tx.log_inode(dir, InodeLogFlags::CORE)?;
                return Ok(());
            }
            Err(XfsError::NotFound(String::from_utf8_lossy(name).into_owned()))
        }
    }
}

/// Shortform image for the given contents, when they fit inline.
fn build_sf_image(
    fs: &FsMeta,
    dir: &Inode,
    parent: InodeNumber,
    entries: &[LiveEntry],
) -> Option<Vec<u8>> {
    if entries.len() >= 255 {
        return None;
    }
    let mut offset = first_entry_offset(fs);
    let sf = SfDir {
        parent: parent.0,
        entries: entries
            .iter()
            .map(|e| {
                let ent = SfEntry {
                    name: e.name.clone(),
                    offset: offset.min(u32::from(u16::MAX)) as u16,
                    ftype: e.ftype,
                    inumber: e.inumber,
                };
                offset += entry_size(e.name.len(), fs.has_ftype) as u32;
                ent
            })
            .collect(),
    };
    let encoded = sf.encode(fs.has_ftype);
    (encoded.len() <= sf_capacity(fs, dir)).then_some(encoded)
}

/// Retarget an existing entry (rename uses this for `..`).
pub fn replace(
    tx: &mut uxfs_trans::Transaction,
    cache: &BufCache,
    fs: &FsMeta,
    dir: &Arc<Inode>,
    name: &[u8],
    new_ino: InodeNumber,
) -> Result<()> {
    check_name(name)?;
    let form = dir_form(fs, &dir.read().data_fork);
    match form {
        DirForm::Shortform => {
            let mut sf = decode_sf(fs, &dir.read().data_fork)?;
            if name == b".." {
                sf.parent = new_ino.0;
            } else {
                let ent = sf
                    .entries
                    .iter_mut()
                    .find(|e| e.name == name)
                    .ok_or_else(|| {
                        XfsError::NotFound(String::from_utf8_lossy(name).into_owned())
                    })?;
                ent.inumber = new_ino.0;
            }
            let encoded = sf.encode(fs.has_ftype);
            {
                let mut state = dir.write();
                state.core.size = encoded.len() as u64;
                state.data_fork = Fork::Local(encoded);
            }
            tx.log_inode(dir, InodeLogFlags::CORE | InodeLogFlags::DDATA)?;
            Ok(())
        }
        DirForm::Block | DirForm::Leaf => {
            let fork = dir.read().data_fork.clone();
            let nblocks = data_block_count(fs, &fork);
            for db in 0..nblocks {
                let Some(buf) = read_dir_block(cache, fs, &fork, db)? else {
                    continue;
                };
                // Locate the entry's byte offset, then patch the inumber.
                let found = {
                    let data = buf.data();
                    find_entry_offset(fs, &data, name)?
                };
                if let Some(off) = found {
                    let pinned = get_dir_block_pinned(tx, cache, fs, dir, db, DIR_DATA_CRC_OFF)?;
                    {
                        let mut data = pinned.data_mut();
                        uxfs_types::write_be_u64(&mut data, off, new_ino.0);
                    }
                    tx.log_buf(&pinned, off, off + 7)?;
                    tx.log_inode(dir, InodeLogFlags::CORE)?;
                    return Ok(());
                }
            }
            Err(XfsError::NotFound(String::from_utf8_lossy(name).into_owned()))
        }
    }
}

fn find_entry_offset(fs: &FsMeta, data: &[u8], name: &[u8]) -> Result<Option<usize>> {
    let hdr = DataHdr::decode(data).map_err(|e| XfsError::Format(e.to_string()))?;
    let end = entries_region_end(data, hdr.magic, data.len())?;
    let mut pos = DataHdr::entries_offset(hdr.magic);
    while pos < end {
        let rec = DataRec::decode(data, pos, fs.has_ftype)
            .map_err(|e| XfsError::Format(e.to_string()))?;
        if let DataRec::Entry { name: n, .. } = &rec {
            if n == name {
                return Ok(Some(pos));
            }
        }
        pos += rec.size();
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use uuid::Uuid;
    use uxfs_block::{ByteDevice, MemByteDevice};
    use uxfs_inode::{init_inode, InodeCache};
    use uxfs_trans::{TxKind, TxManager};
    use uxfs_types::{AgNumber, Geometry, Timestamp, S_IFDIR};

    fn test_fs() -> FsMeta {
        FsMeta {
            geo: Geometry {
                block_size: 4096,
                block_log: 12,
                sector_size: 512,
                ag_blocks: 4096,
                ag_count: 1,
                ag_blk_log: 12,
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
            uuid: Uuid::from_u128(0x1234),
            rootino: InodeNumber(128),
        }
    }

    struct Env {
        fs: FsMeta,
        cache: BufCache,
        mgr: TxManager,
        icache: InodeCache,
    }

    fn setup() -> Env {
        let fs = test_fs();
        let dev = StdArc::new(MemByteDevice::new(4096 * 4096));
        let cache = BufCache::new(dev as StdArc<dyn ByteDevice>);
        uxfs_alloc::format_ag(&cache, &fs, AgNumber(0), 4096, 8, 9, 10, 16).unwrap();
        Env {
            fs,
            cache,
            mgr: TxManager::new(4096, 2048),
            icache: InodeCache::new(),
        }
    }

    fn new_dir(env: &Env, ino_raw: u64, parent: InodeNumber) -> StdArc<Inode> {
        let ino = InodeNumber(ino_raw);
        let mut state = init_inode(
            true,
            env.fs.uuid,
            ino,
            S_IFDIR | 0o755,
            2,
            0,
            0,
            0,
            Timestamp::default(),
        );
        let sf = init_shortform(&env.fs, parent);
        state.core.size = sf.len() as u64;
        state.data_fork = Fork::Local(sf);
        env.icache.install_new(ino, state)
    }

    fn names(entries: &[DirEntry]) -> Vec<Vec<u8>> {
        entries.iter().map(|e| e.name.clone()).collect()
    }

    #[test]
    fn hash_matches_reference_values() {
        // Rolling-hash identities from the algorithm itself.
        assert_eq!(hash_name(b""), 0);
        assert_eq!(hash_name(b"a"), u32::from(b'a'));
        assert_eq!(
            hash_name(b"ab"),
            (u32::from(b'a') << 7) ^ u32::from(b'b')
        );
        assert_eq!(
            hash_name(b"abcd"),
            (u32::from(b'a') << 21)
                ^ (u32::from(b'b') << 14)
                ^ (u32::from(b'c') << 7)
                ^ u32::from(b'd')
        );
        // Longer names mix the rotation in.
        assert_ne!(hash_name(b"abcde"), hash_name(b"abced"));
    }

    #[test]
    fn check_name_limits() {
        assert!(check_name(b"ok").is_ok());
        assert!(matches!(check_name(b""), Err(XfsError::Invalid(_))));
        assert!(matches!(check_name(b"a/b"), Err(XfsError::Invalid(_))));
        let long = vec![b'x'; 255];
        assert!(check_name(&long).is_ok());
        let too_long = vec![b'x'; 256];
        assert!(matches!(check_name(&too_long), Err(XfsError::NameTooLong)));
    }

    #[test]
    fn sf_insert_lookup_remove() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));

        let mut tx = env.mgr.begin_reserved(TxKind::Create, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        insert(&mut tx, &env.cache, &env.fs, &dir, b"hello", InodeNumber(131), FileType::Regular)
            .unwrap();
        insert(&mut tx, &env.cache, &env.fs, &dir, b"world", InodeNumber(132), FileType::Directory)
            .unwrap();
        tx.commit(&env.cache, &env.fs.geo).unwrap();

        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b"hello").unwrap(),
            Some(InodeNumber(131))
        );
        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b"world").unwrap(),
            Some(InodeNumber(132))
        );
        assert_eq!(lookup(&env.cache, &env.fs, &dir, b"nope").unwrap(), None);
        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b".").unwrap(),
            Some(dir.ino())
        );
        assert!(!is_empty(&env.cache, &env.fs, &dir).unwrap());

        let mut tx = env.mgr.begin_reserved(TxKind::Remove, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        remove(&mut tx, &env.cache, &env.fs, &dir, b"hello", InodeNumber(131)).unwrap();
        tx.commit(&env.cache, &env.fs.geo).unwrap();

        assert_eq!(lookup(&env.cache, &env.fs, &dir, b"hello").unwrap(), None);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        let mut tx = env.mgr.begin_reserved(TxKind::Create, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        insert(&mut tx, &env.cache, &env.fs, &dir, b"x", InodeNumber(131), FileType::Regular)
            .unwrap();
        assert!(matches!(
            insert(&mut tx, &env.cache, &env.fs, &dir, b"x", InodeNumber(132), FileType::Regular),
            Err(XfsError::Exists)
        ));
        tx.cancel();
    }

    #[test]
    fn sf_iterate_order_and_cookies() {
        let env = setup();
        let parent = InodeNumber(130);
        let dir = new_dir(&env, 128, parent);
        let mut tx = env.mgr.begin_reserved(TxKind::Create, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        for (i, name) in [b"aa".as_slice(), b"bb", b"cc"].iter().enumerate() {
            insert(
                &mut tx,
                &env.cache,
                &env.fs,
                &dir,
                name,
                InodeNumber(200 + i as u64),
                FileType::Regular,
            )
            .unwrap();
        }
        tx.commit(&env.cache, &env.fs.geo).unwrap();

        let all = iterate(&env.cache, &env.fs, &dir, 0).unwrap();
        assert_eq!(
            names(&all),
            vec![
                b".".to_vec(),
                b"..".to_vec(),
                b"aa".to_vec(),
                b"bb".to_vec(),
                b"cc".to_vec()
            ]
        );
        assert_eq!(all[1].ino, parent);
        // Cookies strictly increase.
        for pair in all.windows(2) {
            assert!(pair[0].cookie < pair[1].cookie);
        }
        // Resuming from any next_cookie yields exactly the suffix.
        let resumed = iterate(&env.cache, &env.fs, &dir, all[2].next_cookie).unwrap();
        assert_eq!(names(&resumed), vec![b"bb".to_vec(), b"cc".to_vec()]);
    }

    #[test]
    fn sf_replace_dotdot() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(130));
        let mut tx = env.mgr.begin_reserved(TxKind::Rename, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        replace(&mut tx, &env.cache, &env.fs, &dir, b"..", InodeNumber(555)).unwrap();
        tx.commit(&env.cache, &env.fs.geo).unwrap();
        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b"..").unwrap(),
            Some(InodeNumber(555))
        );
    }

    fn fill_dir(env: &Env, dir: &StdArc<Inode>, count: usize) {
        let mut inserted = 0;
        while inserted < count {
            let mut tx = env.mgr.begin_reserved(TxKind::Create, 0).unwrap();
            tx.join_inode(dir).unwrap();
            let batch = (count - inserted).min(64);
            for i in inserted..inserted + batch {
                let name = format!("entry{i:05}");
                insert(
                    &mut tx,
                    &env.cache,
                    &env.fs,
                    dir,
                    name.as_bytes(),
                    InodeNumber(1000 + i as u64),
                    FileType::Regular,
                )
                .unwrap();
            }
            uxfs_alloc::finish(&mut tx, &env.cache, &env.fs).unwrap();
            tx.commit(&env.cache, &env.fs.geo).unwrap();
            inserted += batch;
        }
    }

    #[test]
    fn promotion_to_block_preserves_contents() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        // A 512-byte inode's literal area is 336 bytes; ~20 entries of this
        // shape overflow shortform.
        fill_dir(&env, &dir, 20);

        assert!(matches!(dir.read().data_fork, Fork::Extents(_)));
        assert_eq!(dir.read().core.size, 4096);

        for i in 0..20 {
            let name = format!("entry{i:05}");
            assert_eq!(
                lookup(&env.cache, &env.fs, &dir, name.as_bytes()).unwrap(),
                Some(InodeNumber(1000 + i as u64)),
                "missing {name} after promotion"
            );
        }
        let all = iterate(&env.cache, &env.fs, &dir, 0).unwrap();
        assert_eq!(all.len(), 22);
        assert_eq!(all[0].name, b".");
        assert_eq!(all[1].name, b"..");
    }

    #[test]
    fn block_demotes_to_sf_on_removal() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        fill_dir(&env, &dir, 20);
        assert!(matches!(dir.read().data_fork, Fork::Extents(_)));

        // Remove until the contents fit inline again.
        for i in 2..20 {
            let name = format!("entry{i:05}");
            let mut tx = env.mgr.begin_reserved(TxKind::Remove, 0).unwrap();
            tx.join_inode(&dir).unwrap();
            remove(
                &mut tx,
                &env.cache,
                &env.fs,
                &dir,
                name.as_bytes(),
                InodeNumber(1000 + i as u64),
            )
            .unwrap();
            uxfs_alloc::finish(&mut tx, &env.cache, &env.fs).unwrap();
            tx.commit(&env.cache, &env.fs.geo).unwrap();
        }

        assert!(matches!(dir.read().data_fork, Fork::Local(_)));
        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b"entry00000").unwrap(),
            Some(InodeNumber(1000))
        );
        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b"entry00001").unwrap(),
            Some(InodeNumber(1001))
        );
        assert_eq!(lookup(&env.cache, &env.fs, &dir, b"entry00005").unwrap(), None);
    }

    #[test]
    fn promotion_to_leaf_with_many_entries() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        // A 4 KiB block holds ~165 24-byte entries; 300 forces leaf form.
        fill_dir(&env, &dir, 300);

        let form = dir_form(&env.fs, &dir.read().data_fork);
        assert_eq!(form, DirForm::Leaf);
        assert!(dir.read().core.size >= 2 * 4096);

        for i in [0_usize, 150, 299] {
            let name = format!("entry{i:05}");
            assert_eq!(
                lookup(&env.cache, &env.fs, &dir, name.as_bytes()).unwrap(),
                Some(InodeNumber(1000 + i as u64)),
                "missing {name} in leaf form"
            );
        }

        let all = iterate(&env.cache, &env.fs, &dir, 0).unwrap();
        assert_eq!(all.len(), 302);
        let mut seen: Vec<_> = all[2..].iter().map(|e| e.ino.0).collect();
        seen.sort_unstable();
        let expect: Vec<_> = (1000..1300).collect();
        assert_eq!(seen, expect);
    }

    #[test]
    fn leaf_remove_and_lookup() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        fill_dir(&env, &dir, 300);

        let mut tx = env.mgr.begin_reserved(TxKind::Remove, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        remove(&mut tx, &env.cache, &env.fs, &dir, b"entry00150", InodeNumber(1150)).unwrap();
        uxfs_alloc::finish(&mut tx, &env.cache, &env.fs).unwrap();
        tx.commit(&env.cache, &env.fs.geo).unwrap();

        assert_eq!(lookup(&env.cache, &env.fs, &dir, b"entry00150").unwrap(), None);
        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b"entry00151").unwrap(),
            Some(InodeNumber(1151))
        );
        assert_eq!(iterate(&env.cache, &env.fs, &dir, 0).unwrap().len(), 301);
    }

    #[test]
    fn paginated_iteration_covers_everything() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        fill_dir(&env, &dir, 300);

        // Page through 25 entries at a time using next_cookie.
        let mut cookie = 0;
        let mut collected: Vec<Vec<u8>> = Vec::new();
        loop {
            let page = iterate(&env.cache, &env.fs, &dir, cookie).unwrap();
            if page.is_empty() {
                break;
            }
            let take = page.len().min(25);
            for e in &page[..take] {
                collected.push(e.name.clone());
            }
            cookie = page[take - 1].next_cookie;
            if take == page.len() {
                break;
            }
        }
        assert_eq!(collected.len(), 302);
        let mut real: Vec<_> = collected[2..].to_vec();
        real.sort();
        let mut expect: Vec<_> = (0..300).map(|i| format!("entry{i:05}").into_bytes()).collect();
        expect.sort();
        assert_eq!(real, expect);
    }

    #[test]
    fn block_replace_patches_inumber() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        fill_dir(&env, &dir, 20);

        let mut tx = env.mgr.begin_reserved(TxKind::Rename, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        replace(&mut tx, &env.cache, &env.fs, &dir, b"entry00003", InodeNumber(777)).unwrap();
        tx.commit(&env.cache, &env.fs.geo).unwrap();

        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, b"entry00003").unwrap(),
            Some(InodeNumber(777))
        );
    }

    #[test]
    fn max_name_length_entries() {
        let env = setup();
        let dir = new_dir(&env, 128, InodeNumber(128));
        let long = vec![b'z'; 255];

        let mut tx = env.mgr.begin_reserved(TxKind::Create, 0).unwrap();
        tx.join_inode(&dir).unwrap();
        insert(&mut tx, &env.cache, &env.fs, &dir, &long, InodeNumber(900), FileType::Regular)
            .unwrap();
        uxfs_alloc::finish(&mut tx, &env.cache, &env.fs).unwrap();
        tx.commit(&env.cache, &env.fs.geo).unwrap();

        assert_eq!(
            lookup(&env.cache, &env.fs, &dir, &long).unwrap(),
            Some(InodeNumber(900))
        );
    }
}
