// SPDX-License-Identifier: MPL-2.0

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bitmap::BitMap;
use crate::inode::Ext2Inode;
use crate::prelude::*;
use crate::super_block::SuperBlock;

/// Blocks are clustered into block groups in order to reduce fragmentation and
/// minimise the amount of head seeking when reading a large amount of
/// consecutive data.
pub(crate) struct BlockGroup {
    idx: usize,
    inner: RwLock<Dirty<GroupMetadata>>,
    inode_cache: RwLock<BTreeMap<u32, Weak<Ext2Inode>>>,
}

#[derive(Clone, Debug)]
struct GroupMetadata {
    descriptor: GroupDescriptor,
    block_bitmap: BitMap,
    inode_bitmap: BitMap,
}

impl BlockGroup {
    /// Loads and constructs a block group.
    pub fn load(
        idx: usize,
        block_device: &dyn BlockDevice,
        super_block: &SuperBlock,
    ) -> Result<Self> {
        let descriptor = {
            let offset = descriptor_offset(super_block, idx);
            let raw_descriptor = block_device.read_val::<RawGroupDescriptor>(offset)?;
            GroupDescriptor::from(raw_descriptor)
        };

        let get_bitmap = |bid: Ext2Bid, bit_len: usize| -> Result<BitMap> {
            let mut buf = vec![0u8; BLOCK_SIZE];
            block_device.read_block(bid, &mut buf)?;
            BitMap::from_bytes_with_bit_len(&buf, bit_len)
        };

        let block_bitmap = get_bitmap(
            descriptor.block_bitmap_bid,
            super_block.blocks_per_group() as usize,
        )?;
        let inode_bitmap = get_bitmap(
            descriptor.inode_bitmap_bid,
            super_block.inodes_per_group() as usize,
        )?;

        let metadata = GroupMetadata {
            descriptor,
            block_bitmap,
            inode_bitmap,
        };
        Ok(Self {
            idx,
            inner: RwLock::new(Dirty::new(metadata)),
            inode_cache: RwLock::new(BTreeMap::new()),
        })
    }

    /// Returns the cached inode object, if any.
    ///
    /// Fails with `NotFound` if the inode is not allocated on disk.
    pub fn get_inode(&self, inode_idx: u32) -> Result<Option<Arc<Ext2Inode>>> {
        if !self.inner.read().inode_bitmap.is_allocated(inode_idx as usize) {
            return Err(Error::NotFound);
        }
        let inode_option = self
            .inode_cache
            .read()
            .get(&inode_idx)
            .and_then(|weak| weak.upgrade());
        Ok(inode_option)
    }

    /// Inserts a live inode object into the cache.
    ///
    /// At most one live object may exist per inode number; the caller must
    /// have checked the cache first.
    pub fn put_inode(&self, inode_idx: u32, inode: Weak<Ext2Inode>) {
        debug_assert!(self.inner.read().inode_bitmap.is_allocated(inode_idx as usize));
        let mut inode_cache = self.inode_cache.write();
        // Dead weak entries are reclaimed lazily here.
        inode_cache.retain(|_, cached| cached.upgrade().is_some());
        inode_cache.insert(inode_idx, inode);
    }

    /// Allocates and returns an inode index within this group.
    pub fn alloc_inode(&self, is_dir: bool) -> Option<u32> {
        let mut inner = self.inner.write();
        let inode_idx = inner.inode_bitmap.alloc()?;
        inner.descriptor.free_inodes_count -= 1;
        if is_dir {
            inner.descriptor.dirs_count += 1;
        }
        Some(inode_idx as u32)
    }

    /// Frees an allocated inode index.
    ///
    /// Returns whether the inode was allocated; a double free changes nothing
    /// so that the free counts stay correct.
    pub fn free_inode(&self, inode_idx: u32, is_dir: bool) -> bool {
        let mut inner = self.inner.write();
        if !inner.inode_bitmap.is_allocated(inode_idx as usize) {
            warn!("ignoring free of unallocated inode {} in group {}", inode_idx, self.idx);
            return false;
        }
        inner.inode_bitmap.free(inode_idx as usize);
        inner.descriptor.free_inodes_count += 1;
        if is_dir {
            inner.descriptor.dirs_count -= 1;
        }
        drop(inner);
        self.inode_cache.write().remove(&inode_idx);
        true
    }

    /// Allocates and returns a block index within this group.
    pub fn alloc_block(&self) -> Option<u32> {
        let mut inner = self.inner.write();
        let block_idx = inner.block_bitmap.alloc()?;
        inner.descriptor.free_blocks_count -= 1;
        Some(block_idx as u32)
    }

    /// Frees an allocated block index.
    ///
    /// Returns whether the block was allocated; a double free changes nothing
    /// so that the free counts stay correct.
    pub fn free_block(&self, block_idx: u32) -> bool {
        let mut inner = self.inner.write();
        if !inner.block_bitmap.is_allocated(block_idx as usize) {
            warn!("ignoring free of unallocated block {} in group {}", block_idx, self.idx);
            return false;
        }
        inner.block_bitmap.free(block_idx as usize);
        inner.descriptor.free_blocks_count += 1;
        true
    }

    pub fn is_block_allocated(&self, block_idx: u32) -> bool {
        self.inner.read().block_bitmap.is_allocated(block_idx as usize)
    }

    pub fn free_blocks_count(&self) -> u16 {
        self.inner.read().descriptor.free_blocks_count
    }

    pub fn free_inodes_count(&self) -> u16 {
        self.inner.read().descriptor.free_inodes_count
    }

    pub fn inode_table_bid(&self) -> Ext2Bid {
        self.inner.read().descriptor.inode_table_bid
    }

    /// Writes back the descriptor and both bitmaps if anything changed.
    pub fn sync_metadata(
        &self,
        block_device: &dyn BlockDevice,
        super_block: &SuperBlock,
    ) -> Result<()> {
        if !self.inner.read().is_dirty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        let raw_descriptor = RawGroupDescriptor::from(&inner.descriptor);
        block_device.write_val(descriptor_offset(super_block, self.idx), &raw_descriptor)?;

        block_device.write_block(
            inner.descriptor.inode_bitmap_bid,
            inner.inode_bitmap.as_bytes(),
        )?;
        block_device.write_block(
            inner.descriptor.block_bitmap_bid,
            inner.block_bitmap.as_bytes(),
        )?;

        inner.clear_dirty();
        Ok(())
    }

    /// Writes back every cached inode that is still alive.
    pub fn sync_all_inodes(&self) -> Result<()> {
        let inodes: Vec<Arc<Ext2Inode>> = {
            let mut inode_cache = self.inode_cache.write();
            inode_cache.retain(|_, inode| inode.upgrade().is_some());
            inode_cache
                .values()
                .filter_map(|inode| inode.upgrade())
                .collect()
        };
        for inode in inodes {
            inode.sync_all()?;
        }
        Ok(())
    }
}

impl Debug for BlockGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BlockGroup")
            .field("idx", &self.idx)
            .field("descriptor", &self.inner.read().descriptor)
            .finish()
    }
}

fn descriptor_offset(super_block: &SuperBlock, idx: usize) -> usize {
    super_block.group_descriptors_bid() as usize * BLOCK_SIZE
        + idx * core::mem::size_of::<RawGroupDescriptor>()
}

/// The in-memory block group descriptor.
///
/// It records where the important data structures for the group are located.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GroupDescriptor {
    /// Blocks usage bitmap block
    block_bitmap_bid: Ext2Bid,
    /// Inodes usage bitmap block
    inode_bitmap_bid: Ext2Bid,
    /// Starting block of inode table
    inode_table_bid: Ext2Bid,
    /// Number of free blocks in group
    free_blocks_count: u16,
    /// Number of free inodes in group
    free_inodes_count: u16,
    /// Number of directories in group
    dirs_count: u16,
}

impl From<RawGroupDescriptor> for GroupDescriptor {
    fn from(desc: RawGroupDescriptor) -> Self {
        Self {
            block_bitmap_bid: desc.block_bitmap,
            inode_bitmap_bid: desc.inode_bitmap,
            inode_table_bid: desc.inode_table,
            free_blocks_count: desc.free_blocks_count,
            free_inodes_count: desc.free_inodes_count,
            dirs_count: desc.dirs_count,
        }
    }
}

const_assert!(core::mem::size_of::<RawGroupDescriptor>() == 32);

/// The raw block group descriptor.
///
/// The descriptor table starts on the first block following the superblock.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct RawGroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub dirs_count: u16,
    pad: u16,
    reserved: [u32; 3],
}

impl RawGroupDescriptor {
    pub(crate) fn new(
        block_bitmap: Ext2Bid,
        inode_bitmap: Ext2Bid,
        inode_table: Ext2Bid,
        free_blocks_count: u16,
        free_inodes_count: u16,
        dirs_count: u16,
    ) -> Self {
        Self {
            block_bitmap,
            inode_bitmap,
            inode_table,
            free_blocks_count,
            free_inodes_count,
            dirs_count,
            pad: 0u16,
            reserved: [0u32; 3],
        }
    }
}

impl From<&GroupDescriptor> for RawGroupDescriptor {
    fn from(desc: &GroupDescriptor) -> Self {
        Self {
            block_bitmap: desc.block_bitmap_bid,
            inode_bitmap: desc.inode_bitmap_bid,
            inode_table: desc.inode_table_bid,
            free_blocks_count: desc.free_blocks_count,
            free_inodes_count: desc.free_inodes_count,
            dirs_count: desc.dirs_count,
            pad: 0u16,
            reserved: [0u32; 3],
        }
    }
}
