// SPDX-License-Identifier: MPL-2.0

//! A safe Rust ext2 filesystem.
//!
//! The driver speaks to the disk through the [`BlockDevice`] trait and hands
//! out [`Ext2Inode`] objects for files, directories and symlinks. All I/O is
//! synchronous and metadata updates are written through to the device before
//! a mutating operation returns.
//!
//! ```ignore
//! let fs = Ext2::open(block_device)?;
//! let root = fs.root_inode()?;
//! let file = root.create("hello", FileType::File, FilePerm::from_bits_truncate(0o644))?;
//! file.write_at(0, b"hello world")?;
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod error;
pub mod traits;

mod bitmap;
mod block_group;
mod block_ptr;
mod dir;
mod fs;
mod inode;
mod prelude;
mod super_block;
mod utils;

#[cfg(test)]
mod test;

pub use dir::{DirentVisitor, MAX_FNAME_LEN};
pub use error::{Error, Result};
pub use fs::{Ext2, ROOT_INO};
pub use inode::{Ext2Inode, FileFlags, FilePerm, FileType, FAST_SYMLINK_MAX_LEN};
pub use super_block::SuperBlock;
pub use traits::{BlockDevice, Ext2Bid, BLOCK_SIZE};
