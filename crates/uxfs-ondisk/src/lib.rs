#![forbid(unsafe_code)]
//! On-disk format codecs for XFS V4 and V5 metadata.
//!
//! Every structure here is decoded from and re-encoded to big-endian byte
//! slices; raw buffers are never reinterpreted in place. Each metadata type
//! carries its magic and, on V5, the offset of its CRC32C field.

pub mod agheader;
pub mod btree;
pub mod cksum;
pub mod dir;
pub mod extent;
pub mod inode;
pub mod sb;
pub mod symlink;

pub use agheader::{Agf, Agi, AGF_CRC_OFF, AGI_CRC_OFF};
pub use btree::{
    AllocRec, InobtRec, LongBtreeHdr, ShortBtreeHdr, LONG_BTREE_CRC_OFF, SHORT_BTREE_CRC_OFF,
};
pub use cksum::{split_cksum, update_cksum, verify_cksum};
pub use dir::{
    entry_size, sf_entry_size, BlockTail, DataHdr, DataRec, LeafEntry, LeafHdr, SfDir, SfEntry,
    DATA_FREE_TAG, DIR_DATA_CRC_OFF, DIR_LEAF_CRC_OFF,
};
pub use symlink::{SymlinkHdr, SYMLINK_CRC_OFF, SYMLINK_HDR_SIZE};
pub use extent::ExtentRec;
pub use inode::{DInode, DiCore, ForkFormat, InodeLogFlags, INODE_CRC_OFF};
pub use sb::{FsMeta, Superblock, SB_CRC_OFF};
