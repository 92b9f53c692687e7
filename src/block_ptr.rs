// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// Direct pointers to blocks.
pub const DIRECT_RANGE: core::ops::Range<usize> = 0..12;
/// The number of direct blocks.
pub const DIRECT_CNT: u32 = DIRECT_RANGE.end as u32;

/// Indirect pointer to blocks.
pub const INDIRECT: usize = DIRECT_RANGE.end;
/// The number of blocks addressed by one indirect block.
pub const INDIRECT_CNT: u32 = (BLOCK_SIZE / BID_SIZE) as u32;

/// Doubly indirect pointer to blocks.
pub const DB_INDIRECT: usize = INDIRECT + 1;
/// The number of blocks addressed by the doubly indirect tree.
pub const DB_INDIRECT_CNT: u32 = INDIRECT_CNT * INDIRECT_CNT;

/// Trebly indirect pointer to blocks.
pub const TB_INDIRECT: usize = DB_INDIRECT + 1;
/// The number of blocks addressed by the trebly indirect tree.
pub const TB_INDIRECT_CNT: u32 = INDIRECT_CNT * DB_INDIRECT_CNT;

/// The number of block pointers in an inode.
pub const BLOCK_PTR_CNT: usize = TB_INDIRECT + 1;

/// The largest number of data blocks the pointer tree can address.
pub const MAX_BLOCK_CNT: u32 = DIRECT_CNT + INDIRECT_CNT + DB_INDIRECT_CNT + TB_INDIRECT_CNT;

/// The size of a block id on disk.
pub const BID_SIZE: usize = core::mem::size_of::<u32>();

/// Represents the various ways in which a block id can be located in ext2,
/// one variant per level of indirection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BidPath {
    /// Direct reference: the block id sits in the given pointer slot.
    Direct(usize),
    /// Single indirection: the index within the indirect block.
    Indirect(usize),
    /// Double indirection: the index within the first-level indirect block,
    /// then the index within the second-level indirect block.
    DbIndirect(usize, usize),
    /// Treble indirection: the indices within the first-, second- and
    /// third-level indirect blocks.
    TbIndirect(usize, usize, usize),
}

impl From<u32> for BidPath {
    fn from(bid: u32) -> Self {
        if bid < DIRECT_CNT {
            Self::Direct(bid as usize)
        } else if bid < DIRECT_CNT + INDIRECT_CNT {
            let indirect_bid = bid - DIRECT_CNT;
            Self::Indirect(indirect_bid as usize)
        } else if bid < DIRECT_CNT + INDIRECT_CNT + DB_INDIRECT_CNT {
            let db_indirect_bid = bid - (DIRECT_CNT + INDIRECT_CNT);
            let lvl1_idx = (db_indirect_bid / INDIRECT_CNT) as usize;
            let lvl2_idx = (db_indirect_bid % INDIRECT_CNT) as usize;
            Self::DbIndirect(lvl1_idx, lvl2_idx)
        } else if bid < DIRECT_CNT + INDIRECT_CNT + DB_INDIRECT_CNT + TB_INDIRECT_CNT {
            let tb_indirect_bid = bid - (DIRECT_CNT + INDIRECT_CNT + DB_INDIRECT_CNT);
            let lvl1_idx = (tb_indirect_bid / DB_INDIRECT_CNT) as usize;
            let lvl2_idx = ((tb_indirect_bid / INDIRECT_CNT) % INDIRECT_CNT) as usize;
            let lvl3_idx = (tb_indirect_bid % INDIRECT_CNT) as usize;
            Self::TbIndirect(lvl1_idx, lvl2_idx, lvl3_idx)
        } else {
            // Callers bound the index by a validated `blocks_count`.
            unreachable!("block index {} exceeds the addressable maximum", bid);
        }
    }
}

/// The concrete shape of an inode's block list for a given number of data
/// blocks: how many blocks fall under each level of indirection, plus the
/// number of metadata (pointer-table) blocks the shape itself consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockListShape {
    pub direct_blocks: u32,
    pub indirect_blocks: u32,
    pub doubly_indirect_blocks: u32,
    pub trebly_indirect_blocks: u32,
    pub meta_blocks: u32,
}

impl BlockListShape {
    /// Computes the shape for `blocks_count` data blocks.
    pub fn compute(blocks_count: u32) -> Self {
        let mut shape = Self::default();
        let mut remaining = blocks_count;

        shape.direct_blocks = remaining.min(DIRECT_CNT);
        remaining -= shape.direct_blocks;

        shape.indirect_blocks = remaining.min(INDIRECT_CNT);
        if shape.indirect_blocks > 0 {
            shape.meta_blocks += 1;
        }
        remaining -= shape.indirect_blocks;

        shape.doubly_indirect_blocks = remaining.min(DB_INDIRECT_CNT);
        if shape.doubly_indirect_blocks > 0 {
            shape.meta_blocks += 1 + shape.doubly_indirect_blocks.div_ceil(INDIRECT_CNT);
        }
        remaining -= shape.doubly_indirect_blocks;

        shape.trebly_indirect_blocks = remaining.min(TB_INDIRECT_CNT);
        if shape.trebly_indirect_blocks > 0 {
            shape.meta_blocks += 1
                + shape.trebly_indirect_blocks.div_ceil(DB_INDIRECT_CNT)
                + shape.trebly_indirect_blocks.div_ceil(INDIRECT_CNT);
        }

        shape
    }
}
