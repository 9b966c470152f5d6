// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-mode queue heads (dQHs), UM10503 section 23.8.
//!
//! The controller expects one dQH per endpoint direction, packed into a
//! 2 KiB-aligned list whose address goes in ENDPOINTLISTADDR. Each dQH is 64
//! bytes:
//!
//! ```text
//! 0x00  endpoint capabilities      (MULT, ZLT, MPL, IOS)
//! 0x04  current dTD pointer
//! 0x08  overlay: next dTD pointer
//! 0x0C  overlay: token
//! 0x10  overlay: buffer pages 0..4
//! 0x24  reserved, used by software  (owning endpoint)
//! 0x28  SETUP buffer, 8 bytes
//! 0x30  padding to 64 bytes
//! ```

use crate::td::{self, PAGE_COUNT};
use crate::types::EndpointAddress;
use vcell::VolatileCell;

/// Number of dQHs in a list: six endpoint pairs on the larger controller.
pub const QH_COUNT: usize = 12;

pub mod capabilities {
    /// Interrupt on SETUP.
    pub const IOS: u32 = 1 << 15;
    pub const MPL_SHIFT: u32 = 16;
    pub const MPL_MASK: u32 = 0x7FF << MPL_SHIFT;
    /// Zero-length termination _disable_.
    pub const ZLT: u32 = 1 << 29;
    pub const MULT_SHIFT: u32 = 30;
    pub const MULT_MASK: u32 = 0b11 << MULT_SHIFT;

    pub const fn mpl(max_packet_size: u16) -> u32 {
        ((max_packet_size as u32) << MPL_SHIFT) & MPL_MASK
    }

    pub const fn mult(n: u32) -> u32 {
        (n << MULT_SHIFT) & MULT_MASK
    }
}

#[repr(C, align(64))]
pub struct QueueHead {
    capabilities: VolatileCell<u32>,
    current_dtd: VolatileCell<usize>,
    next_dtd: VolatileCell<usize>,
    token: VolatileCell<u32>,
    pages: [VolatileCell<usize>; PAGE_COUNT],
    owner: VolatileCell<usize>,
    setup: VolatileCell<[u8; 8]>,
    _padding: [u32; 4],
}

#[cfg(target_pointer_width = "32")]
const _: () = assert!(core::mem::size_of::<QueueHead>() == 64);

// Safety: fields are only touched through volatile accesses; software writes
// to a dQH happen while the endpoint is flushed or under a critical section.
unsafe impl Sync for QueueHead {}

impl QueueHead {
    pub const fn new() -> Self {
        const PAGE: VolatileCell<usize> = VolatileCell::new(0);
        Self {
            capabilities: VolatileCell::new(0),
            current_dtd: VolatileCell::new(0),
            next_dtd: VolatileCell::new(td::TERMINATE),
            token: VolatileCell::new(0),
            pages: [PAGE; PAGE_COUNT],
            owner: VolatileCell::new(0),
            setup: VolatileCell::new([0; 8]),
            _padding: [0; 4],
        }
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities.get()
    }

    pub fn max_packet_size(&self) -> u16 {
        ((self.capabilities.get() & capabilities::MPL_MASK) >> capabilities::MPL_SHIFT) as u16
    }

    pub fn current_dtd(&self) -> usize {
        self.current_dtd.get()
    }

    pub fn next_dtd(&self) -> usize {
        self.next_dtd.get()
    }

    pub fn token(&self) -> u32 {
        self.token.get()
    }

    /// Resets the queue head to an idle endpoint with the given packet size.
    /// ZLT is set, so the controller never appends zero-length packets on
    /// its own; `setup_interrupt` sets IOS, which control endpoints need.
    pub fn configure(&self, max_packet_size: u16, setup_interrupt: bool) {
        self.capabilities.set(
            capabilities::mult(0)
                | capabilities::ZLT
                | capabilities::mpl(max_packet_size)
                | if setup_interrupt { capabilities::IOS } else { 0 },
        );
        self.current_dtd.set(0);
        self.next_dtd.set(td::TERMINATE);
        self.token.set(td::token::total_bytes(0) | td::token::multo(0));
        for page in &self.pages {
            page.set(0);
        }
    }

    /// Points the overlay at `first` and clears any ACTIVE/HALTED status left
    /// over from a previous transfer, ready for ENDPTPRIME.
    pub fn load(&self, first: usize) {
        self.next_dtd.set(first);
        self.token.set(
            self.token.get() & !(td::token::STATUS_ACTIVE | td::token::STATUS_HALTED),
        );
    }

    /// The software back-reference stored in the reserved word; zero means
    /// no endpoint has been initialized on this queue head.
    pub fn owner(&self) -> usize {
        self.owner.get()
    }

    pub fn set_owner(&self, owner: usize) {
        self.owner.set(owner);
    }

    /// The most recent SETUP packet, as written by the controller.
    pub fn setup_buffer(&self) -> [u8; 8] {
        self.setup.get()
    }

    /// Stands in for the controller writing a SETUP packet.
    #[cfg(test)]
    pub(crate) fn receive_setup(&self, bytes: [u8; 8]) {
        self.setup.set(bytes);
    }

    /// Stands in for the controller advancing its overlay past a retired dTD.
    #[cfg(test)]
    pub(crate) fn advance(&self, current: usize, next: usize) {
        self.current_dtd.set(current);
        self.next_dtd.set(next);
    }
}

impl Default for QueueHead {
    fn default() -> Self {
        Self::new()
    }
}

/// The controller's endpoint list. Its address is what gets written to
/// ENDPOINTLISTADDR, so it must be 2 KiB aligned and live forever.
#[repr(C, align(2048))]
pub struct QueueHeadList {
    heads: [QueueHead; QH_COUNT],
}

impl QueueHeadList {
    pub const fn new() -> Self {
        const QH: QueueHead = QueueHead::new();
        Self { heads: [QH; QH_COUNT] }
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// The queue head for an endpoint, or `None` if its number is beyond the
    /// list.
    pub fn get(&self, endpoint: EndpointAddress) -> Option<&QueueHead> {
        self.heads.get(endpoint.queue_head_index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueHead> {
        self.heads.iter()
    }
}

impl Default for QueueHeadList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UsbDir;

    #[test]
    fn list_is_aligned_for_endpointlistaddr() {
        let list = Box::new(QueueHeadList::new());
        assert_eq!(list.address() % 2048, 0);
    }

    #[test]
    fn configure_sets_capabilities() {
        let qh = QueueHead::new();
        qh.configure(64, true);
        assert_eq!(qh.max_packet_size(), 64);
        assert_ne!(qh.capabilities() & capabilities::IOS, 0);
        assert_ne!(qh.capabilities() & capabilities::ZLT, 0);
        assert_eq!(qh.next_dtd(), td::TERMINATE);

        qh.configure(512, false);
        assert_eq!(qh.max_packet_size(), 512);
        assert_eq!(qh.capabilities() & capabilities::IOS, 0);
    }

    #[test]
    fn load_clears_stale_status() {
        let qh = QueueHead::new();
        qh.token.set(td::token::STATUS_ACTIVE | td::token::STATUS_HALTED | td::token::total_bytes(3));
        qh.load(0x2000_0040);
        assert_eq!(qh.next_dtd(), 0x2000_0040);
        assert_eq!(qh.token(), td::token::total_bytes(3));
    }

    #[test]
    fn lookup_rejects_missing_endpoints() {
        let list = Box::new(QueueHeadList::new());
        assert!(list.get(UsbDir::In.endpoint(5)).is_some());
        assert!(list.get(UsbDir::Out.endpoint(6)).is_none());
    }
}
