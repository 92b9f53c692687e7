// SPDX-License-Identifier: MPL-2.0

use zerocopy::IntoBytes;

use crate::block_group::{BlockGroup, RawGroupDescriptor};
use crate::block_ptr::{
    BidPath, BID_SIZE, DB_INDIRECT, DIRECT_RANGE, INDIRECT, INDIRECT_CNT, TB_INDIRECT,
};
use crate::dir::{DirEntry, DirEntryWriter};
use crate::inode::{Ext2Inode, FilePerm, FileType, InodeDesc, RawInode};
use crate::prelude::*;
use crate::super_block::{RawSuperBlock, SuperBlock, FIRST_USABLE_INO, SUPER_BLOCK_OFFSET};

/// The inode number of the root directory.
pub const ROOT_INO: u32 = 2;

/// The ext2 filesystem over a block device.
pub struct Ext2 {
    block_device: Arc<dyn BlockDevice>,
    super_block: RwLock<Dirty<SuperBlock>>,
    block_groups: Vec<BlockGroup>,
    blocks_per_group: u32,
    inodes_per_group: u32,
    first_data_block: Ext2Bid,
    inode_size: usize,
    self_ref: Weak<Self>,
}

impl Ext2 {
    /// Opens the ext2 filesystem on `block_device`.
    pub fn open(block_device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let raw_super_block = block_device.read_val::<RawSuperBlock>(SUPER_BLOCK_OFFSET)?;
        let super_block = SuperBlock::try_from(raw_super_block)?;
        if super_block.total_blocks() > block_device.total_blocks() {
            return Err(Error::InvalidParam);
        }

        let block_groups = {
            let mut block_groups = Vec::with_capacity(super_block.block_groups_count() as usize);
            for idx in 0..super_block.block_groups_count() as usize {
                block_groups.push(BlockGroup::load(idx, block_device.as_ref(), &super_block)?);
            }
            block_groups
        };

        debug!(
            "opened ext2 with {} blocks in {} groups",
            super_block.total_blocks(),
            block_groups.len()
        );
        Ok(Arc::new_cyclic(|weak_ref| Self {
            blocks_per_group: super_block.blocks_per_group(),
            inodes_per_group: super_block.inodes_per_group(),
            first_data_block: super_block.first_data_block(),
            inode_size: super_block.inode_size(),
            block_device,
            super_block: RwLock::new(Dirty::new(super_block)),
            block_groups,
            self_ref: weak_ref.clone(),
        }))
    }

    pub(crate) fn block_device(&self) -> &dyn BlockDevice {
        self.block_device.as_ref()
    }

    /// Returns a copy of the superblock.
    pub fn super_block(&self) -> SuperBlock {
        **self.super_block.read()
    }

    pub fn free_blocks_count(&self) -> u32 {
        self.super_block.read().free_blocks_count()
    }

    pub fn free_inodes_count(&self) -> u32 {
        self.super_block.read().free_inodes_count()
    }

    /// Returns the root directory.
    pub fn root_inode(&self) -> Result<Arc<Ext2Inode>> {
        self.lookup_inode(ROOT_INO)
    }

    /// Returns the inode object for `ino`, from the per-group cache if one is
    /// alive and from disk otherwise.
    pub fn lookup_inode(&self, ino: u32) -> Result<Arc<Ext2Inode>> {
        let (group_idx, inode_idx) = self.inode_location(ino)?;
        let block_group = &self.block_groups[group_idx];
        if let Some(inode) = block_group.get_inode(inode_idx)? {
            return Ok(inode);
        }

        let raw_inode = self
            .block_device
            .read_val::<RawInode>(self.inode_offset(block_group, inode_idx))?;
        let desc = Dirty::new(InodeDesc::try_from(raw_inode)?);
        let inode = Arc::new(Ext2Inode::new(
            ino,
            group_idx,
            desc,
            self.self_ref.clone(),
        ));
        block_group.put_inode(inode_idx, Arc::downgrade(&inode));
        Ok(inode)
    }

    /// Allocates an inode and constructs its live object.
    ///
    /// The on-disk record is written out before the inode is linked anywhere,
    /// so a crash cannot leave a directory entry naming a garbage inode.
    pub(crate) fn create_inode(
        &self,
        preferred_group_idx: usize,
        file_type: FileType,
        perm: FilePerm,
    ) -> Result<Arc<Ext2Inode>> {
        let (group_idx, inode_idx) = self.alloc_ino(preferred_group_idx, file_type == FileType::Dir)?;
        let ino = group_idx as u32 * self.inodes_per_group + inode_idx + 1;
        debug_assert!(ino >= FIRST_USABLE_INO);

        let desc = Dirty::new_dirty(InodeDesc::new(file_type, perm));
        let inode = Arc::new(Ext2Inode::new(
            ino,
            group_idx,
            desc,
            self.self_ref.clone(),
        ));
        inode.sync_metadata()?;
        self.block_groups[group_idx].put_inode(inode_idx, Arc::downgrade(&inode));
        Ok(inode)
    }

    fn alloc_ino(&self, preferred_group_idx: usize, is_dir: bool) -> Result<(usize, u32)> {
        if preferred_group_idx >= self.block_groups.len() {
            return Err(Error::InvalidParam);
        }
        for idx in 0..self.block_groups.len() {
            let group_idx = (preferred_group_idx + idx) % self.block_groups.len();
            if let Some(inode_idx) = self.block_groups[group_idx].alloc_inode(is_dir) {
                self.super_block.write().dec_free_inodes();
                return Ok((group_idx, inode_idx));
            }
        }
        Err(Error::NoSpace)
    }

    pub(crate) fn free_inode(&self, ino: u32, is_dir: bool) -> Result<()> {
        let (group_idx, inode_idx) = self.inode_location(ino)?;
        if self.block_groups[group_idx].free_inode(inode_idx, is_dir) {
            self.super_block.write().inc_free_inodes();
        }
        Ok(())
    }

    /// Allocates one block, preferring the given group and scanning the rest
    /// in index order from there.
    pub(crate) fn alloc_block(&self, preferred_group_idx: usize) -> Result<Ext2Bid> {
        if preferred_group_idx >= self.block_groups.len() {
            return Err(Error::InvalidParam);
        }
        for idx in 0..self.block_groups.len() {
            let group_idx = (preferred_group_idx + idx) % self.block_groups.len();
            if let Some(block_idx) = self.block_groups[group_idx].alloc_block() {
                self.super_block.write().dec_free_blocks();
                return Ok(self.first_data_block
                    + group_idx as u32 * self.blocks_per_group
                    + block_idx);
            }
        }
        Err(Error::NoSpace)
    }

    /// Allocates `count` blocks, or none at all on failure.
    pub(crate) fn alloc_blocks(&self, preferred_group_idx: usize, count: u32) -> Result<Vec<Ext2Bid>> {
        let mut bids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.alloc_block(preferred_group_idx) {
                Ok(bid) => bids.push(bid),
                Err(err) => {
                    warn!("failed to allocate {} blocks, rolling back", count);
                    for &bid in &bids {
                        self.free_block(bid);
                    }
                    return Err(err);
                }
            }
        }
        Ok(bids)
    }

    pub(crate) fn free_block(&self, bid: Ext2Bid) {
        let Some((group_idx, block_idx)) = self.block_location(bid) else {
            warn!("ignoring free of out-of-range block {}", bid);
            return;
        };
        if self.block_groups[group_idx].free_block(block_idx) {
            self.super_block.write().inc_free_blocks();
        }
    }

    pub(crate) fn is_block_allocated(&self, bid: Ext2Bid) -> bool {
        self.block_location(bid)
            .is_some_and(|(group_idx, block_idx)| {
                self.block_groups[group_idx].is_block_allocated(block_idx)
            })
    }

    /// Resolves the device block id of one data block of an inode by walking
    /// its pointer tree.
    pub(crate) fn resolve_bid(&self, desc: &InodeDesc, idx: u32) -> Result<Ext2Bid> {
        if idx >= desc.blocks_count {
            return Err(Error::InvalidParam);
        }
        let bid = match BidPath::from(idx) {
            BidPath::Direct(slot) => desc.data[slot],
            BidPath::Indirect(idx1) => self.read_indirect(desc.data[INDIRECT], idx1)?,
            BidPath::DbIndirect(idx1, idx2) => {
                let lvl1 = self.read_indirect(desc.data[DB_INDIRECT], idx1)?;
                self.read_indirect(lvl1, idx2)?
            }
            BidPath::TbIndirect(idx1, idx2, idx3) => {
                let lvl1 = self.read_indirect(desc.data[TB_INDIRECT], idx1)?;
                let lvl2 = self.read_indirect(lvl1, idx2)?;
                self.read_indirect(lvl2, idx3)?
            }
        };
        if bid == 0 {
            return Err(Error::BadBlockList);
        }
        Ok(bid)
    }

    fn read_indirect(&self, bid: Ext2Bid, idx: usize) -> Result<Ext2Bid> {
        if bid == 0 {
            return Err(Error::BadBlockList);
        }
        self.block_device
            .read_val::<u32>(bid as usize * BLOCK_SIZE + idx * BID_SIZE)
    }

    /// Reads the complete, in-order list of data block ids of an inode.
    pub(crate) fn block_list_for_inode(&self, desc: &InodeDesc) -> Result<Vec<Ext2Bid>> {
        let mut list = Vec::with_capacity(desc.blocks_count as usize);
        let mut remaining = desc.blocks_count;

        for slot in DIRECT_RANGE {
            if remaining == 0 {
                return Ok(list);
            }
            if desc.data[slot] == 0 {
                return Err(Error::BadBlockList);
            }
            list.push(desc.data[slot]);
            remaining -= 1;
        }
        for (root_slot, level) in [(INDIRECT, 1), (DB_INDIRECT, 2), (TB_INDIRECT, 3)] {
            if remaining == 0 {
                break;
            }
            self.collect_indirect(desc.data[root_slot], level, &mut remaining, &mut list)?;
        }
        if remaining > 0 {
            return Err(Error::BadBlockList);
        }
        Ok(list)
    }

    fn collect_indirect(
        &self,
        bid: Ext2Bid,
        level: u32,
        remaining: &mut u32,
        list: &mut Vec<Ext2Bid>,
    ) -> Result<()> {
        if bid == 0 {
            return Err(Error::BadBlockList);
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.block_device.read_block(bid, &mut buf)?;
        for chunk in buf.chunks_exact(BID_SIZE) {
            if *remaining == 0 {
                break;
            }
            let entry = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if level == 1 {
                if entry == 0 {
                    return Err(Error::BadBlockList);
                }
                list.push(entry);
                *remaining -= 1;
            } else {
                self.collect_indirect(entry, level - 1, remaining, list)?;
            }
        }
        Ok(())
    }

    /// Rewrites the pointer tree of an inode to address exactly `blocks`,
    /// reusing surviving pointer blocks, allocating new ones as the tree
    /// grows and freeing the ones the tree no longer needs.
    ///
    /// `desc.blocks_count` must still describe the old tree; the caller
    /// updates it afterwards. On failure the newly allocated pointer blocks
    /// are returned to the allocator.
    pub(crate) fn write_block_list_for_inode(
        &self,
        group_idx: usize,
        desc: &mut InodeDesc,
        blocks: &[Ext2Bid],
    ) -> Result<()> {
        let mut data = desc.data;
        let mut allocated: Vec<Ext2Bid> = Vec::new();

        let result: Result<()> = (|| {
            for slot in DIRECT_RANGE {
                data[slot] = blocks.get(slot).copied().unwrap_or(0);
            }
            let mut from = DIRECT_RANGE.end;
            for (root_slot, level) in [(INDIRECT, 1u32), (DB_INDIRECT, 2), (TB_INDIRECT, 3)] {
                let span = (INDIRECT_CNT as usize).pow(level);
                let entries = &blocks[from.min(blocks.len())..(from + span).min(blocks.len())];
                data[root_slot] =
                    self.update_tree(group_idx, data[root_slot], level, entries, &mut allocated)?;
                from += span;
            }
            Ok(())
        })();

        if let Err(err) = result {
            for &bid in &allocated {
                self.free_block(bid);
            }
            return Err(err);
        }
        desc.data = data;
        Ok(())
    }

    /// Rewrites one pointer subtree so that it addresses exactly `entries`.
    ///
    /// Returns the root block id of the subtree, zero if it is now empty.
    fn update_tree(
        &self,
        group_idx: usize,
        old_root: Ext2Bid,
        level: u32,
        entries: &[Ext2Bid],
        allocated: &mut Vec<Ext2Bid>,
    ) -> Result<Ext2Bid> {
        if entries.is_empty() {
            if old_root != 0 {
                self.free_meta_tree(old_root, level)?;
            }
            return Ok(0);
        }

        let root = if old_root != 0 {
            old_root
        } else {
            let bid = self.alloc_block(group_idx)?;
            allocated.push(bid);
            bid
        };

        let mut buf = vec![0u8; BLOCK_SIZE];
        if old_root != 0 {
            self.block_device.read_block(old_root, &mut buf)?;
        }
        let mut dirty = old_root == 0;

        let child_span = (INDIRECT_CNT as usize).pow(level - 1);
        for slot in 0..INDIRECT_CNT as usize {
            let old_entry = u32::from_le_bytes([
                buf[slot * BID_SIZE],
                buf[slot * BID_SIZE + 1],
                buf[slot * BID_SIZE + 2],
                buf[slot * BID_SIZE + 3],
            ]);
            let new_entry = if level == 1 {
                entries.get(slot).copied().unwrap_or(0)
            } else {
                let begin = (slot * child_span).min(entries.len());
                let end = ((slot + 1) * child_span).min(entries.len());
                self.update_tree(group_idx, old_entry, level - 1, &entries[begin..end], allocated)?
            };
            if new_entry != old_entry {
                buf[slot * BID_SIZE..(slot + 1) * BID_SIZE]
                    .copy_from_slice(&new_entry.to_le_bytes());
                dirty = true;
            }
        }

        if dirty {
            self.block_device.write_block(root, &buf)?;
        }
        Ok(root)
    }

    /// Frees the pointer blocks of a subtree. The data blocks it addressed
    /// are freed separately by the caller.
    fn free_meta_tree(&self, root: Ext2Bid, level: u32) -> Result<()> {
        if level > 1 {
            let mut buf = vec![0u8; BLOCK_SIZE];
            self.block_device.read_block(root, &mut buf)?;
            for chunk in buf.chunks_exact(BID_SIZE) {
                let entry = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if entry != 0 {
                    self.free_meta_tree(entry, level - 1)?;
                }
            }
        }
        self.free_block(root);
        Ok(())
    }

    /// Writes back the on-disk record of one inode.
    pub(crate) fn sync_inode(&self, ino: u32, raw_inode: &RawInode) -> Result<()> {
        let (group_idx, inode_idx) = self.inode_location(ino)?;
        let offset = self.inode_offset(&self.block_groups[group_idx], inode_idx);
        self.block_device.write_val(offset, raw_inode)
    }

    /// Writes back the superblock, the group descriptors and the bitmaps.
    ///
    /// Every allocation dirties the superblock counters, so a clean
    /// superblock means the groups are clean too.
    pub fn sync_metadata(&self) -> Result<()> {
        let mut super_block = self.super_block.write();
        if !super_block.is_dirty() {
            return Ok(());
        }
        for block_group in &self.block_groups {
            block_group.sync_metadata(self.block_device.as_ref(), &super_block)?;
        }
        self.block_device
            .write_val(SUPER_BLOCK_OFFSET, &super_block.to_raw())?;
        super_block.clear_dirty();
        Ok(())
    }

    /// Writes back every cached inode, then the filesystem metadata.
    pub fn sync_all(&self) -> Result<()> {
        for block_group in &self.block_groups {
            block_group.sync_all_inodes()?;
        }
        self.sync_metadata()
    }

    fn inode_location(&self, ino: u32) -> Result<(usize, u32)> {
        if ino == 0 {
            return Err(Error::InvalidParam);
        }
        let group_idx = ((ino - 1) / self.inodes_per_group) as usize;
        if group_idx >= self.block_groups.len() {
            return Err(Error::InvalidParam);
        }
        Ok((group_idx, (ino - 1) % self.inodes_per_group))
    }

    fn inode_offset(&self, block_group: &BlockGroup, inode_idx: u32) -> usize {
        block_group.inode_table_bid() as usize * BLOCK_SIZE + inode_idx as usize * self.inode_size
    }

    fn block_location(&self, bid: Ext2Bid) -> Option<(usize, u32)> {
        if bid < self.first_data_block {
            return None;
        }
        let group_idx = ((bid - self.first_data_block) / self.blocks_per_group) as usize;
        if group_idx >= self.block_groups.len() {
            return None;
        }
        Some((group_idx, (bid - self.first_data_block) % self.blocks_per_group))
    }
}

impl Debug for Ext2 {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Ext2")
            .field("super_block", &**self.super_block.read())
            .field("block_groups_count", &self.block_groups.len())
            .finish()
    }
}

impl Ext2 {
    /// Writes a fresh revision-1 filesystem onto `block_device`.
    ///
    /// The layout is fixed: the superblock in block 1, the descriptor table
    /// right after it, then per group a block bitmap, an inode bitmap, the
    /// inode table and the data blocks. No backup superblocks are written.
    pub fn format(
        block_device: &dyn BlockDevice,
        blocks_per_group: u32,
        inodes_per_group: u32,
    ) -> Result<()> {
        let inode_size = core::mem::size_of::<RawInode>();
        if blocks_per_group == 0
            || blocks_per_group as usize > BLOCK_SIZE * 8
            || inodes_per_group == 0
            || inodes_per_group as usize > BLOCK_SIZE * 8
            || inodes_per_group as usize * inode_size % BLOCK_SIZE != 0
        {
            return Err(Error::InvalidParam);
        }

        let total_blocks = block_device.total_blocks();
        let first_data_block: Ext2Bid = 1;
        if total_blocks <= first_data_block {
            return Err(Error::InvalidParam);
        }
        let groups_count = (total_blocks - first_data_block).div_ceil(blocks_per_group);
        let descriptor_table_blocks = (groups_count as usize
            * core::mem::size_of::<RawGroupDescriptor>())
        .div_ceil(BLOCK_SIZE) as u32;
        let inode_table_blocks = (inodes_per_group as usize * inode_size / BLOCK_SIZE) as u32;

        let zero_block = vec![0u8; BLOCK_SIZE];
        let mut descriptors = Vec::with_capacity(groups_count as usize);
        let mut total_free_blocks = 0u32;

        for group_idx in 0..groups_count {
            let group_start = first_data_block + group_idx * blocks_per_group;
            let blocks_in_group = blocks_per_group.min(total_blocks - group_start);
            // The superblock and the descriptor table sit at the head of
            // group 0 only.
            let fs_overhead = if group_idx == 0 {
                1 + descriptor_table_blocks
            } else {
                0
            };
            let overhead = fs_overhead + 2 + inode_table_blocks;
            let root_dir_blocks = if group_idx == 0 { 1 } else { 0 };
            if blocks_in_group <= overhead + root_dir_blocks {
                return Err(Error::InvalidParam);
            }

            let block_bitmap_bid = group_start + fs_overhead;
            let inode_bitmap_bid = block_bitmap_bid + 1;
            let inode_table_bid = inode_bitmap_bid + 1;

            let mut block_bitmap = vec![0u8; BLOCK_SIZE];
            for idx in 0..(overhead + root_dir_blocks) as usize {
                block_bitmap[idx / 8] |= 1 << (idx % 8);
            }
            for idx in blocks_in_group as usize..blocks_per_group as usize {
                // The tail of a partial last group is never allocatable.
                block_bitmap[idx / 8] |= 1 << (idx % 8);
            }
            block_device.write_block(block_bitmap_bid, &block_bitmap)?;

            let mut inode_bitmap = vec![0u8; BLOCK_SIZE];
            let reserved_inodes = if group_idx == 0 {
                FIRST_USABLE_INO - 1
            } else {
                0
            };
            for idx in 0..reserved_inodes as usize {
                inode_bitmap[idx / 8] |= 1 << (idx % 8);
            }
            block_device.write_block(inode_bitmap_bid, &inode_bitmap)?;

            for table_block in 0..inode_table_blocks {
                block_device.write_block(inode_table_bid + table_block, &zero_block)?;
            }

            let free_blocks = (blocks_in_group - overhead - root_dir_blocks) as u16;
            let free_inodes = (inodes_per_group - reserved_inodes) as u16;
            let dirs_count = if group_idx == 0 { 1 } else { 0 };
            total_free_blocks += free_blocks as u32;
            descriptors.push(RawGroupDescriptor::new(
                block_bitmap_bid,
                inode_bitmap_bid,
                inode_table_bid,
                free_blocks,
                free_inodes,
                dirs_count,
            ));

            if group_idx == 0 {
                Self::format_root_dir(
                    block_device,
                    inode_table_bid,
                    group_start + overhead,
                )?;
            }
        }

        let mut descriptor_table = vec![0u8; descriptor_table_blocks as usize * BLOCK_SIZE];
        for (idx, descriptor) in descriptors.iter().enumerate() {
            let offset = idx * core::mem::size_of::<RawGroupDescriptor>();
            descriptor_table[offset..offset + core::mem::size_of::<RawGroupDescriptor>()]
                .copy_from_slice(descriptor.as_bytes());
        }
        block_device.write_bytes_at(
            (first_data_block + 1) as usize * BLOCK_SIZE,
            &descriptor_table,
        )?;

        let mut raw_super_block = RawSuperBlock::new_zeroed_for_format();
        raw_super_block.set_magic();
        raw_super_block.inodes_count = groups_count * inodes_per_group;
        raw_super_block.blocks_count = total_blocks;
        raw_super_block.free_blocks_count = total_free_blocks;
        raw_super_block.free_inodes_count = groups_count * inodes_per_group - (FIRST_USABLE_INO - 1);
        raw_super_block.first_data_block = first_data_block;
        raw_super_block.blocks_per_group = blocks_per_group;
        raw_super_block.inodes_per_group = inodes_per_group;
        raw_super_block.state = 1;
        raw_super_block.errors = 1;
        raw_super_block.rev_level = 1;
        raw_super_block.first_ino = FIRST_USABLE_INO;
        raw_super_block.inode_size = inode_size as u16;
        block_device.write_val(SUPER_BLOCK_OFFSET, &raw_super_block)?;
        Ok(())
    }

    fn format_root_dir(
        block_device: &dyn BlockDevice,
        inode_table_bid: Ext2Bid,
        data_bid: Ext2Bid,
    ) -> Result<()> {
        let mut content = Vec::new();
        let mut writer = DirEntryWriter::new(&mut content);
        writer.append_entry(DirEntry::self_entry(ROOT_INO))?;
        writer.append_entry(DirEntry::parent_entry(ROOT_INO))?;
        drop(writer);
        block_device.write_block(data_bid, &content)?;

        let mut desc = InodeDesc::new(FileType::Dir, FilePerm::from_bits_truncate(0o755));
        desc.hard_links = 2;
        desc.size = BLOCK_SIZE;
        desc.blocks_count = 1;
        desc.data[0] = data_bid;

        let offset = inode_table_bid as usize * BLOCK_SIZE
            + (ROOT_INO - 1) as usize * core::mem::size_of::<RawInode>();
        block_device.write_val(offset, &RawInode::from(&desc))
    }
}
