// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory the USB controller can DMA into and out of.
//!
//! A transfer hands the controller a raw address that it will keep using
//! until the transfer completes or the endpoint is flushed, long after any
//! Rust borrow would have ended. So the scheduling API doesn't take slices;
//! it takes a `DmaRegion`, which can only be built safely from memory that
//! lives forever.

use core::cell::UnsafeCell;

/// A span of memory handed to the controller for one transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaRegion {
    addr: usize,
    len: usize,
    writable: bool,
}

impl DmaRegion {
    /// Zero bytes, for status stages and other zero-length packets.
    pub const EMPTY: Self = Self {
        addr: 0,
        len: 0,
        writable: true,
    };

    /// A region the controller may read but must never write, such as a
    /// descriptor in flash.
    pub fn from_static(data: &'static [u8]) -> Self {
        Self {
            addr: data.as_ptr() as usize,
            len: data.len(),
            writable: false,
        }
    }

    /// Safety: the `len` bytes at `addr` must stay valid, and not be accessed
    /// by anything else, until every transfer using the region has completed
    /// or been flushed. If `writable`, the controller may write to them.
    pub const unsafe fn from_raw_parts(addr: usize, len: usize, writable: bool) -> Self {
        Self {
            addr,
            len,
            writable,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The first `len` bytes of this region, or the whole region if it is
    /// shorter.
    pub fn truncated(self, len: usize) -> Self {
        Self {
            len: self.len.min(len),
            ..self
        }
    }
}

/// A statically allocated, DMA-visible buffer.
///
/// Software access goes through the `unsafe` accessors: the controller may
/// be writing to the buffer whenever a transfer on it is outstanding, and only
/// the code that scheduled that transfer knows when it isn't.
#[repr(C, align(4))]
pub struct DmaBuffer<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
}

// Safety: all access to the contents is through unsafe methods whose
// contracts require the caller to exclude concurrent use.
unsafe impl<const N: usize> Sync for DmaBuffer<N> {}

impl<const N: usize> DmaBuffer<N> {
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; N]),
        }
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// The whole buffer, writable by the controller.
    pub fn region(&'static self) -> DmaRegion {
        DmaRegion {
            addr: self.bytes.get() as usize,
            len: N,
            writable: true,
        }
    }

    /// Safety: no transfer may be using the buffer, and no other reference to
    /// its contents may exist for the lifetime of the result.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut(&self) -> &mut [u8; N] {
        &mut *self.bytes.get()
    }

    /// Safety: no transfer may be writing the buffer, and no mutable
    /// reference may exist, for the lifetime of the result.
    pub unsafe fn as_ref(&self) -> &[u8; N] {
        &*self.bytes.get()
    }
}

impl<const N: usize> Default for DmaBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static BUFFER: DmaBuffer<64> = DmaBuffer::new();
    static DESCRIPTOR: [u8; 4] = [4, 3, 9, 4];

    #[test]
    fn buffer_region_is_writable() {
        let region = BUFFER.region();
        assert_eq!(region.len(), 64);
        assert!(region.is_writable());
        assert_eq!(region.addr() % 4, 0);
    }

    #[test]
    fn static_data_is_read_only() {
        let region = DmaRegion::from_static(&DESCRIPTOR);
        assert_eq!(region.len(), 4);
        assert!(!region.is_writable());
        assert_eq!(region.truncated(2).len(), 2);
        assert_eq!(region.truncated(200).len(), 4);
    }
}
