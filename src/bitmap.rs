// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// An allocation bitmap covering one block group, one bit per block or inode.
///
/// A set bit means allocated. Bit `i` lives in byte `i / 8` at position
/// `i % 8`, matching the on-disk ext2 ordering.
#[derive(Clone)]
pub(crate) struct BitMap {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitMap {
    /// Builds a bitmap from its on-disk bytes, scanning only `bit_len` bits.
    pub fn from_bytes_with_bit_len(bytes: &[u8], bit_len: usize) -> Result<Self> {
        if bit_len > bytes.len() * 8 {
            return Err(Error::BadBitMap);
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            bit_len,
        })
    }

    /// Allocates the lowest-index free bit, or returns `None` if full.
    ///
    /// First-fit keeps allocation deterministic and reproducible.
    pub fn alloc(&mut self) -> Option<usize> {
        for (byte_idx, byte) in self.bytes.iter_mut().enumerate() {
            if *byte == 0xff {
                continue;
            }
            let bit_idx = (!*byte).trailing_zeros() as usize;
            let idx = byte_idx * 8 + bit_idx;
            if idx >= self.bit_len {
                return None;
            }
            *byte |= 1 << bit_idx;
            return Some(idx);
        }
        None
    }

    /// Frees one allocated bit.
    ///
    /// Returns whether the bit was allocated. Freeing an already-free bit is
    /// a no-op, so a double free cannot corrupt the free counts derived from
    /// this bitmap.
    pub fn free(&mut self, idx: usize) -> bool {
        if !self.is_allocated(idx) {
            return false;
        }
        self.bytes[idx / 8] &= !(1 << (idx % 8));
        true
    }

    pub fn is_allocated(&self, idx: usize) -> bool {
        idx < self.bit_len && self.bytes[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Debug for BitMap {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BitMap")
            .field("bit_len", &self.bit_len)
            .finish()
    }
}
