// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-mode transfer descriptors (dTDs), UM10503 section 23.9.
//!
//! A dTD is read and written by the controller's DMA engine, so its layout is
//! fixed by the silicon:
//!
//! ```text
//! 0x00  next dTD pointer           (bit 0: terminate)
//! 0x04  token                      (status, MultO, IOC, total bytes)
//! 0x08  buffer page pointers 0..4
//! 0x1C  reserved
//! ```
//!
//! Link and page fields are pointer-sized so that the same code can run, and
//! be tested, on a 64-bit host; on the 32-bit target they are exactly the
//! hardware's 32-bit words.

use vcell::VolatileCell;

/// Terminate bit of a next-dTD pointer.
pub const TERMINATE: usize = 1;

/// Most bytes the 15-bit `total_bytes` field can describe.
pub const MAX_TOTAL_BYTES: u32 = 0x7FFF;

/// Five page pointers, four kilobytes each.
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_COUNT: usize = 5;

pub mod token {
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_MASK: u32 = 0xFF;
    pub const STATUS_ERRORS: u32 = STATUS_HALTED | STATUS_BUFFER_ERROR | STATUS_TRANSACTION_ERROR;

    pub const MULTO_SHIFT: u32 = 10;
    pub const MULTO_MASK: u32 = 0b11 << MULTO_SHIFT;
    pub const IOC: u32 = 1 << 15;
    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF << TOTAL_BYTES_SHIFT;

    pub const fn total_bytes(n: u32) -> u32 {
        (n << TOTAL_BYTES_SHIFT) & TOTAL_BYTES_MASK
    }

    pub const fn multo(n: u32) -> u32 {
        (n << MULTO_SHIFT) & MULTO_MASK
    }
}

/// The status byte of a retired (or still active) descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TdStatus(pub u8);

impl TdStatus {
    pub fn is_active(self) -> bool {
        u32::from(self.0) & token::STATUS_ACTIVE != 0
    }

    /// Any of the conditions the hardware can't recover from by itself.
    pub fn is_error(self) -> bool {
        u32::from(self.0) & token::STATUS_ERRORS != 0
    }

    pub fn is_halted(self) -> bool {
        u32::from(self.0) & token::STATUS_HALTED != 0
    }
}

#[repr(C, align(32))]
pub struct TransferDescriptor {
    next: VolatileCell<usize>,
    token: VolatileCell<u32>,
    pages: [VolatileCell<usize>; PAGE_COUNT],
    _reserved: VolatileCell<u32>,
}

#[cfg(target_pointer_width = "32")]
const _: () = assert!(core::mem::size_of::<TransferDescriptor>() == 32);

// Safety: every field is only ever accessed with volatile reads and writes,
// and the queue that owns a descriptor serializes software access to it.
unsafe impl Sync for TransferDescriptor {}

impl TransferDescriptor {
    pub const fn new() -> Self {
        const PAGE: VolatileCell<usize> = VolatileCell::new(0);
        Self {
            next: VolatileCell::new(TERMINATE),
            token: VolatileCell::new(0),
            pages: [PAGE; PAGE_COUNT],
            _reserved: VolatileCell::new(0),
        }
    }

    /// The DMA address the hardware uses to refer to this descriptor.
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    pub fn next(&self) -> usize {
        self.next.get()
    }

    pub fn set_next(&self, td: &TransferDescriptor) {
        self.next.set(td.address());
    }

    pub fn set_next_raw(&self, link: usize) {
        self.next.set(link);
    }

    pub fn terminate(&self) {
        self.next.set(TERMINATE);
    }

    pub fn is_terminated(&self) -> bool {
        self.next.get() & TERMINATE != 0
    }

    pub fn token(&self) -> u32 {
        self.token.get()
    }

    pub fn set_token(&self, token: u32) {
        self.token.set(token);
    }

    pub fn status(&self) -> TdStatus {
        TdStatus((self.token.get() & token::STATUS_MASK) as u8)
    }

    /// Bytes the hardware has _not_ yet moved.
    pub fn remaining_bytes(&self) -> u32 {
        (self.token.get() & token::TOTAL_BYTES_MASK) >> token::TOTAL_BYTES_SHIFT
    }

    pub fn page(&self, i: usize) -> usize {
        self.pages[i].get()
    }

    /// Arms this descriptor for a transfer of `length` bytes at `data`,
    /// interrupting on completion. The descriptor is left terminated; linking
    /// it to a successor is the scheduler's business.
    pub fn prepare(&self, data: usize, length: u32) {
        self.next.set(TERMINATE);
        self.token.set(
            token::total_bytes(length)
                | token::IOC
                | token::multo(0)
                | token::STATUS_ACTIVE,
        );
        fill_pages(&self.pages, data);
    }
}

impl Default for TransferDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Fills five page pointers for a buffer starting at `data`. The first points
/// at the data itself; the rest at the following 4 KiB page boundaries.
pub(crate) fn fill_pages(pages: &[VolatileCell<usize>; PAGE_COUNT], data: usize) {
    pages[0].set(data);
    for (i, page) in pages.iter().enumerate().skip(1) {
        page.set((data + i * PAGE_SIZE) & !(PAGE_SIZE - 1));
    }
}

/// True if five page pointers starting at `data` can cover `length` bytes.
pub fn fits_in_pages(data: usize, length: u32) -> bool {
    (data & (PAGE_SIZE - 1)) + length as usize <= PAGE_SIZE * PAGE_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_arms_and_terminates() {
        let td = TransferDescriptor::new();
        td.set_next_raw(0x1234_5000);
        td.prepare(0x2000_0010, 512);
        assert!(td.is_terminated());
        assert!(td.status().is_active());
        assert!(!td.status().is_error());
        assert_eq!(td.remaining_bytes(), 512);
        assert_ne!(td.token() & token::IOC, 0);
    }

    #[test]
    fn pages_follow_page_boundaries() {
        let td = TransferDescriptor::new();
        td.prepare(0x2000_0abc, 16384);
        assert_eq!(td.page(0), 0x2000_0abc);
        assert_eq!(td.page(1), 0x2000_1000);
        assert_eq!(td.page(2), 0x2000_2000);
        assert_eq!(td.page(4), 0x2000_4000);
    }

    #[test]
    fn page_coverage() {
        assert!(fits_in_pages(0x1000, 20480));
        assert!(!fits_in_pages(0x1001, 20480));
        assert!(fits_in_pages(0x1fff, 16385));
        assert!(fits_in_pages(0, 0));
    }

    #[test]
    fn error_bits_are_errors() {
        assert!(TdStatus(token::STATUS_HALTED as u8).is_error());
        assert!(TdStatus(token::STATUS_BUFFER_ERROR as u8).is_error());
        assert!(TdStatus(token::STATUS_TRANSACTION_ERROR as u8).is_error());
        assert!(!TdStatus(token::STATUS_ACTIVE as u8).is_error());
    }

    #[test]
    fn descriptor_is_dma_aligned() {
        let td = TransferDescriptor::new();
        assert_eq!(td.address() % 32, 0);
    }
}
