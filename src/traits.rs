// SPDX-License-Identifier: MPL-2.0

//! The seam between the filesystem and its block device collaborator.

use alloc::vec;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, Result};

/// The block size supported by this driver.
///
/// The classic ext2 format allows 1 KiB to 4 KiB blocks; this driver pins the
/// size and refuses to mount filesystems with a different geometry.
pub const BLOCK_SIZE: usize = 1024;

/// A device-wide block id.
pub type Ext2Bid = u32;

/// A fixed-block-size disk, addressed by linear block number.
///
/// All I/O is synchronous; a failed read or write is fatal to the operation
/// in progress and is never retried by the filesystem.
pub trait BlockDevice: Send + Sync {
    /// Reads the block at `bid` into `buf`, which must be `BLOCK_SIZE` bytes.
    fn read_block(&self, bid: Ext2Bid, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf`, which must be `BLOCK_SIZE` bytes, to the block at `bid`.
    fn write_block(&self, bid: Ext2Bid, buf: &[u8]) -> Result<()>;

    /// Returns the number of blocks on the device.
    fn total_blocks(&self) -> Ext2Bid;
}

/// Byte-granular helpers layered on top of `BlockDevice`.
///
/// On-disk records do not always start on a block boundary (the superblock,
/// group descriptors and raw inodes are all packed by byte offset), so these
/// helpers read-modify-write the blocks that a byte range spans.
pub trait BlockDeviceExt {
    fn read_bytes_at(&self, offset: usize, buf: &mut [u8]) -> Result<()>;
    fn write_bytes_at(&self, offset: usize, buf: &[u8]) -> Result<()>;

    fn read_val<T: FromBytes>(&self, offset: usize) -> Result<T>;
    fn write_val<T: IntoBytes + Immutable>(&self, offset: usize, val: &T) -> Result<()>;
}

impl<B: BlockDevice + ?Sized> BlockDeviceExt for B {
    fn read_bytes_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut block_buf = vec![0u8; BLOCK_SIZE];
        let mut cur = offset;
        let end = offset + buf.len();
        while cur < end {
            let bid = (cur / BLOCK_SIZE) as Ext2Bid;
            let begin = cur % BLOCK_SIZE;
            let len = (BLOCK_SIZE - begin).min(end - cur);
            self.read_block(bid, &mut block_buf)?;
            buf[cur - offset..cur - offset + len].copy_from_slice(&block_buf[begin..begin + len]);
            cur += len;
        }
        Ok(())
    }

    fn write_bytes_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut block_buf = vec![0u8; BLOCK_SIZE];
        let mut cur = offset;
        let end = offset + buf.len();
        while cur < end {
            let bid = (cur / BLOCK_SIZE) as Ext2Bid;
            let begin = cur % BLOCK_SIZE;
            let len = (BLOCK_SIZE - begin).min(end - cur);
            if len < BLOCK_SIZE {
                self.read_block(bid, &mut block_buf)?;
            }
            block_buf[begin..begin + len].copy_from_slice(&buf[cur - offset..cur - offset + len]);
            self.write_block(bid, &block_buf)?;
            cur += len;
        }
        Ok(())
    }

    fn read_val<T: FromBytes>(&self, offset: usize) -> Result<T> {
        let mut buf = vec![0u8; core::mem::size_of::<T>()];
        self.read_bytes_at(offset, &mut buf)?;
        T::read_from_bytes(&buf).map_err(|_| Error::IoError)
    }

    fn write_val<T: IntoBytes + Immutable>(&self, offset: usize, val: &T) -> Result<()> {
        self.write_bytes_at(offset, val.as_bytes())
    }
}
