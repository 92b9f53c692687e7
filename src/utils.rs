// SPDX-License-Identifier: MPL-2.0

use core::ops::{Deref, DerefMut};

/// A wrapper that tracks whether the inner value has been mutated since the
/// last write-back.
///
/// Any access through `DerefMut` marks the value dirty; the owner clears the
/// flag after flushing the value to the device.
#[derive(Clone, Debug)]
pub struct Dirty<T> {
    value: T,
    dirty: bool,
}

impl<T> Dirty<T> {
    /// Creates a new clean value.
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    /// Creates a new value that starts out dirty.
    pub fn new_dirty(value: T) -> Self {
        Self { value, dirty: true }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

impl<T> Deref for Dirty<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Dirty<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.value
    }
}
