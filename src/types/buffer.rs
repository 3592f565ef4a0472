// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Grow-only byte buffer backing chunk and record assembly.
//!
//! The buffer separates logical size from capacity: `set_size` grows
//! capacity by doubling and never shrinks it, so the engine's reusable
//! chunk buffers stop allocating once they reach steady state.

/// A growable byte buffer with explicit size and capacity.
///
/// Single-owner and non-cloneable. Invariant: `size <= capacity`.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    size: usize,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// The first `size` bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Mutable access to the first `size` bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current capacity in bytes. Never shrinks.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Set the logical size, doubling capacity as needed.
    pub fn set_size(&mut self, size: usize) {
        self.ensure_capacity(size);
        self.size = size;
    }

    /// Append bytes, growing as needed.
    pub fn extend(&mut self, bytes: &[u8]) {
        let old_size = self.size;
        self.set_size(old_size + bytes.len());
        self.data[old_size..old_size + bytes.len()].copy_from_slice(bytes);
    }

    /// Swap contents with another buffer.
    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    fn ensure_capacity(&mut self, capacity: usize) {
        if capacity <= self.data.len() {
            return;
        }
        let mut new_capacity = self.data.len().max(1);
        while new_capacity < capacity {
            new_capacity *= 2;
        }
        self.data.resize(new_capacity, 0);
    }
}
