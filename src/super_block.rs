// SPDX-License-Identifier: MPL-2.0

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::prelude::*;

/// The byte offset of the superblock from the start of the device.
pub const SUPER_BLOCK_OFFSET: usize = 1024;

/// The magic signature every ext2 superblock must carry.
const EXT2_MAGIC: u16 = 0xef53;

/// The first non-reserved inode number in a revision-1 filesystem.
pub(crate) const FIRST_USABLE_INO: u32 = 11;

const GOOD_OLD_REV: u32 = 0;
const GOOD_OLD_INODE_SIZE: usize = 128;

/// The in-memory superblock.
///
/// It is the authoritative source of the filesystem geometry and of the
/// global free counts, which every allocation and free must go through.
#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    inodes_count: u32,
    blocks_count: u32,
    free_blocks_count: u32,
    free_inodes_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    first_ino: u32,
    inode_size: usize,
    raw: RawSuperBlock,
}

impl TryFrom<RawSuperBlock> for SuperBlock {
    type Error = crate::error::Error;

    fn try_from(raw: RawSuperBlock) -> Result<Self> {
        if raw.magic != EXT2_MAGIC {
            return Err(Error::BadMagic);
        }
        if (1024usize << raw.log_block_size) != BLOCK_SIZE {
            return Err(Error::NotSupported);
        }
        let (first_ino, inode_size) = if raw.rev_level == GOOD_OLD_REV {
            (FIRST_USABLE_INO, GOOD_OLD_INODE_SIZE)
        } else {
            (raw.first_ino, raw.inode_size as usize)
        };
        if inode_size < GOOD_OLD_INODE_SIZE || BLOCK_SIZE % inode_size != 0 {
            return Err(Error::NotSupported);
        }
        if raw.blocks_per_group == 0
            || raw.blocks_per_group as usize > BLOCK_SIZE * 8
            || raw.inodes_per_group == 0
            || raw.inodes_per_group as usize > BLOCK_SIZE * 8
        {
            return Err(Error::NotSupported);
        }
        Ok(Self {
            inodes_count: raw.inodes_count,
            blocks_count: raw.blocks_count,
            free_blocks_count: raw.free_blocks_count,
            free_inodes_count: raw.free_inodes_count,
            first_data_block: raw.first_data_block,
            blocks_per_group: raw.blocks_per_group,
            inodes_per_group: raw.inodes_per_group,
            first_ino,
            inode_size,
            raw,
        })
    }
}

impl SuperBlock {
    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    pub fn inode_size(&self) -> usize {
        self.inode_size
    }

    pub fn total_inodes(&self) -> u32 {
        self.inodes_count
    }

    pub fn total_blocks(&self) -> u32 {
        self.blocks_count
    }

    pub fn free_blocks_count(&self) -> u32 {
        self.free_blocks_count
    }

    pub fn free_inodes_count(&self) -> u32 {
        self.free_inodes_count
    }

    pub fn first_data_block(&self) -> Ext2Bid {
        self.first_data_block
    }

    pub fn blocks_per_group(&self) -> u32 {
        self.blocks_per_group
    }

    pub fn inodes_per_group(&self) -> u32 {
        self.inodes_per_group
    }

    pub fn first_usable_ino(&self) -> u32 {
        self.first_ino
    }

    /// Returns the number of block groups.
    ///
    /// The last group may cover fewer blocks than `blocks_per_group`.
    pub fn block_groups_count(&self) -> u32 {
        (self.blocks_count - self.first_data_block).div_ceil(self.blocks_per_group)
    }

    /// Returns the first block of the group descriptor table.
    ///
    /// The table starts on the first block following the superblock.
    pub fn group_descriptors_bid(&self) -> Ext2Bid {
        self.first_data_block + 1
    }

    pub(crate) fn inc_free_blocks(&mut self) {
        debug_assert!(self.free_blocks_count < self.blocks_count);
        self.free_blocks_count += 1;
    }

    pub(crate) fn dec_free_blocks(&mut self) {
        debug_assert!(self.free_blocks_count > 0);
        self.free_blocks_count -= 1;
    }

    pub(crate) fn inc_free_inodes(&mut self) {
        debug_assert!(self.free_inodes_count < self.inodes_count);
        self.free_inodes_count += 1;
    }

    pub(crate) fn dec_free_inodes(&mut self) {
        debug_assert!(self.free_inodes_count > 0);
        self.free_inodes_count -= 1;
    }

    /// Re-serializes the superblock for write-back, preserving every raw
    /// field this driver does not interpret.
    pub(crate) fn to_raw(&self) -> RawSuperBlock {
        let mut raw = self.raw;
        raw.free_blocks_count = self.free_blocks_count;
        raw.free_inodes_count = self.free_inodes_count;
        raw
    }
}

const_assert!(core::mem::size_of::<RawSuperBlock>() == 1024);

/// The superblock on disk, including the fields this driver leaves alone.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct RawSuperBlock {
    /// Total number of inodes.
    pub inodes_count: u32,
    /// Total number of blocks.
    pub blocks_count: u32,
    /// Number of blocks reserved for the superuser.
    pub reserved_blocks_count: u32,
    /// Number of free blocks.
    pub free_blocks_count: u32,
    /// Number of free inodes.
    pub free_inodes_count: u32,
    /// First data block (the block containing the superblock).
    pub first_data_block: u32,
    /// Block size is `1024 << log_block_size`.
    pub log_block_size: u32,
    /// Fragment size is `1024 << log_frag_size`.
    pub log_frag_size: u32,
    /// Number of blocks in each block group.
    pub blocks_per_group: u32,
    /// Number of fragments in each block group.
    pub frags_per_group: u32,
    /// Number of inodes in each block group.
    pub inodes_per_group: u32,
    /// Mount time.
    pub mtime: u32,
    /// Write time.
    pub wtime: u32,
    /// Mount count since the last full check.
    pub mnt_count: u16,
    /// Maximal mount count between two full checks.
    pub max_mnt_count: u16,
    /// Magic signature.
    pub magic: u16,
    /// Filesystem state.
    pub state: u16,
    /// Behaviour when detecting errors.
    pub errors: u16,
    /// Minor revision level.
    pub minor_rev_level: u16,
    /// Time of the last check.
    pub lastcheck: u32,
    /// Maximal time between checks.
    pub checkinterval: u32,
    /// Creator OS.
    pub creator_os: u32,
    /// Revision level.
    pub rev_level: u32,
    /// Default uid for reserved blocks.
    pub def_resuid: u16,
    /// Default gid for reserved blocks.
    pub def_resgid: u16,
    /// First non-reserved inode (revision 1).
    pub first_ino: u32,
    /// Size of the on-disk inode record (revision 1).
    pub inode_size: u16,
    /// Index of the block group hosting this superblock copy.
    pub block_group_idx: u16,
    /// Compatible feature set.
    pub feature_compat: u32,
    /// Incompatible feature set.
    pub feature_incompat: u32,
    /// Read-only-compatible feature set.
    pub feature_ro_compat: u32,
    /// 128-bit volume uuid.
    pub uuid: [u8; 16],
    /// Volume name.
    pub volume_name: [u8; 16],
    /// Directory where last mounted.
    pub last_mounted: [u8; 64],
    /// Compression algorithms in use.
    pub algorithm_usage_bitmap: u32,
    /// Number of blocks to preallocate for files.
    pub prealloc_blocks: u8,
    /// Number of blocks to preallocate for directories.
    pub prealloc_dir_blocks: u8,
    padding1: u16,
    /// Journal uuid (unused here).
    pub journal_uuid: [u8; 16],
    /// Journal file inode (unused here).
    pub journal_ino: u32,
    /// Journal device (unused here).
    pub journal_dev: u32,
    /// Head of the orphan inode list.
    pub last_orphan: u32,
    /// Htree hash seed.
    pub hash_seed: [u32; 4],
    /// Default hash version.
    pub def_hash_version: u8,
    reserved_char_pad: u8,
    reserved_word_pad: u16,
    /// Default mount options.
    pub default_mount_opts: u32,
    /// First metablock block group.
    pub first_meta_bg: u32,
    reserved: [u32; 190],
}

impl RawSuperBlock {
    /// A zeroed superblock to be filled in by `Ext2::format`.
    pub fn new_zeroed_for_format() -> Self {
        Self::new_zeroed()
    }

    pub fn set_magic(&mut self) {
        self.magic = EXT2_MAGIC;
    }
}
