// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-mode data structures, as laid out by the EHCI specification
//! (sections 3.1, 3.5 and 3.6), which the LPC43xx host controller follows.
//!
//! Links between structures are physical addresses with flag bits in the low
//! five bits: bit 0 terminates the list, bits 2:1 give the type of the
//! structure pointed to.

use crate::td::{fill_pages, PAGE_COUNT};
use crate::types::Speed;
use vcell::VolatileCell;

pub mod link {
    pub const TERMINATE: usize = 1;
    pub const TYPE_SHIFT: u32 = 1;
    pub const TYPE_MASK: usize = 0b11 << TYPE_SHIFT;
    pub const POINTER_MASK: usize = !0x1F;
}

/// What a horizontal link points at, EHCI table 3-18.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum DescriptorType {
    Itd = 0,
    Qh = 1,
    Sitd = 2,
    Fstn = 3,
}

/// Builds a non-terminating link to a structure of type `kind` at `address`.
pub const fn link_to(address: usize, kind: DescriptorType) -> usize {
    (address & link::POINTER_MASK) | ((kind as usize) << link::TYPE_SHIFT)
}

pub const fn is_terminating(link: usize) -> bool {
    link & link::TERMINATE != 0
}

pub const fn link_pointer(link: usize) -> usize {
    link & link::POINTER_MASK
}

/// Queue head dword 1: endpoint characteristics.
pub mod characteristics {
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;
    pub const INACTIVATE_ON_NEXT: u32 = 1 << 7;
    pub const ENDPOINT_SHIFT: u32 = 8;
    pub const ENDPOINT_MASK: u32 = 0xF << ENDPOINT_SHIFT;
    pub const SPEED_SHIFT: u32 = 12;
    pub const SPEED_MASK: u32 = 0b11 << SPEED_SHIFT;
    /// Take the data toggle from the qTD rather than the overlay.
    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;
    pub const HEAD_OF_RECLAMATION: u32 = 1 << 15;
    pub const MAX_PACKET_SHIFT: u32 = 16;
    pub const MAX_PACKET_MASK: u32 = 0x7FF << MAX_PACKET_SHIFT;
    pub const CONTROL_ENDPOINT: u32 = 1 << 27;
    pub const NAK_RELOAD_SHIFT: u32 = 28;
    pub const NAK_RELOAD_MASK: u32 = 0xF << NAK_RELOAD_SHIFT;
}

/// Queue head dword 2: endpoint capabilities.
pub mod capabilities {
    pub const SMASK_MASK: u32 = 0xFF;
    pub const CMASK_SHIFT: u32 = 8;
    pub const CMASK_MASK: u32 = 0xFF << CMASK_SHIFT;
    pub const HUB_SHIFT: u32 = 16;
    pub const HUB_MASK: u32 = 0x7F << HUB_SHIFT;
    pub const PORT_SHIFT: u32 = 23;
    pub const PORT_MASK: u32 = 0x7F << PORT_SHIFT;
    pub const MULT_SHIFT: u32 = 30;
    pub const MULT_MASK: u32 = 0b11 << MULT_SHIFT;
}

/// qTD token, EHCI section 3.5.3.
pub mod token {
    pub const STATUS_PING: u32 = 1 << 0;
    pub const STATUS_SPLIT: u32 = 1 << 1;
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const PID_SHIFT: u32 = 8;
    pub const PID_MASK: u32 = 0b11 << PID_SHIFT;
    pub const CERR_SHIFT: u32 = 10;
    pub const CERR_MASK: u32 = 0b11 << CERR_SHIFT;
    pub const CURRENT_PAGE_SHIFT: u32 = 12;
    pub const CURRENT_PAGE_MASK: u32 = 0b111 << CURRENT_PAGE_SHIFT;
    pub const IOC: u32 = 1 << 15;
    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF << TOTAL_BYTES_SHIFT;
    pub const DATA_TOGGLE: u32 = 1 << 31;
}

/// PID code of a qTD; sets the direction of the transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

/// The EHCI endpoint speed encoding, which is not in speed order.
pub const fn speed_bits(speed: Speed) -> u32 {
    match speed {
        Speed::Full => 0,
        Speed::Low => 1,
        Speed::High => 2,
    }
}

/// A queue element transfer descriptor (qTD), also used as the transfer
/// overlay area of a queue head.
///
/// This type carries no alignment of its own so it can sit inside a queue
/// head; standalone qTDs must be placed on a 32-byte boundary by their
/// container.
#[repr(C)]
pub struct TransferDescriptor {
    next: VolatileCell<usize>,
    alternate_next: VolatileCell<usize>,
    token: VolatileCell<u32>,
    pages: [VolatileCell<usize>; PAGE_COUNT],
}

#[cfg(target_pointer_width = "32")]
const _: () = assert!(core::mem::size_of::<TransferDescriptor>() == 32);

// Safety: volatile access only; chain edits happen in critical sections.
unsafe impl Sync for TransferDescriptor {}

impl TransferDescriptor {
    pub const fn new() -> Self {
        const PAGE: VolatileCell<usize> = VolatileCell::new(0);
        Self {
            next: VolatileCell::new(link::TERMINATE),
            alternate_next: VolatileCell::new(link::TERMINATE),
            token: VolatileCell::new(0),
            pages: [PAGE; PAGE_COUNT],
        }
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    pub fn next(&self) -> usize {
        self.next.get()
    }

    pub fn set_next(&self, link: usize) {
        self.next.set(link);
    }

    pub fn alternate_next(&self) -> usize {
        self.alternate_next.get()
    }

    pub fn token(&self) -> u32 {
        self.token.get()
    }

    pub fn set_token(&self, token: u32) {
        self.token.set(token);
    }

    pub fn is_active(&self) -> bool {
        self.token.get() & token::STATUS_ACTIVE != 0
    }

    pub fn is_halted(&self) -> bool {
        self.token.get() & token::STATUS_HALTED != 0
    }

    pub fn has_transaction_error(&self) -> bool {
        self.token.get() & token::STATUS_TRANSACTION_ERROR != 0
    }

    pub fn remaining_bytes(&self) -> u32 {
        (self.token.get() & token::TOTAL_BYTES_MASK) >> token::TOTAL_BYTES_SHIFT
    }

    pub fn page(&self, i: usize) -> usize {
        self.pages[i].get()
    }

    /// Arms the qTD for `length` bytes at `data`. The error counter starts
    /// at three, the usual EHCI retry budget.
    pub fn prepare(
        &self,
        pid: Pid,
        data_toggle: bool,
        interrupt_on_complete: bool,
        data: usize,
        length: u32,
    ) {
        self.next.set(link::TERMINATE);
        self.alternate_next.set(link::TERMINATE);
        self.token.set(
            ((length << token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK)
                | if interrupt_on_complete { token::IOC } else { 0 }
                | (3 << token::CERR_SHIFT)
                | ((pid as u32) << token::PID_SHIFT)
                | if data_toggle { token::DATA_TOGGLE } else { 0 }
                | token::STATUS_ACTIVE,
        );
        fill_pages(&self.pages, data);
    }

    /// Returns the overlay to the empty, halted state: no qTD to fetch and
    /// nothing to execute.
    fn park(&self) {
        self.next.set(link::TERMINATE);
        self.alternate_next.set(link::TERMINATE);
        self.token.set(token::STATUS_HALTED);
        for page in &self.pages {
            page.set(0);
        }
    }
}

impl Default for TransferDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// An EHCI queue head.
#[repr(C, align(2048))]
pub struct QueueHead {
    horizontal: VolatileCell<usize>,
    characteristics: VolatileCell<u32>,
    capabilities: VolatileCell<u32>,
    current_qtd: VolatileCell<usize>,
    overlay: TransferDescriptor,
}

// Safety: volatile access only; the driver edits live queue heads only with
// the relevant schedule disabled or inside a critical section.
unsafe impl Sync for QueueHead {}

impl QueueHead {
    pub const fn new() -> Self {
        Self {
            horizontal: VolatileCell::new(link::TERMINATE),
            characteristics: VolatileCell::new(0),
            capabilities: VolatileCell::new(0),
            current_qtd: VolatileCell::new(0),
            overlay: TransferDescriptor::new(),
        }
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// A link the hardware can follow to this queue head.
    pub fn link(&self) -> usize {
        link_to(self.address(), DescriptorType::Qh)
    }

    pub fn horizontal(&self) -> usize {
        self.horizontal.get()
    }

    pub fn set_horizontal(&self, link: usize) {
        self.horizontal.set(link);
    }

    pub fn characteristics(&self) -> u32 {
        self.characteristics.get()
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities.get()
    }

    pub fn overlay(&self) -> &TransferDescriptor {
        &self.overlay
    }

    pub fn device_address(&self) -> u8 {
        (self.characteristics.get() & characteristics::DEVICE_ADDRESS_MASK) as u8
    }

    pub fn endpoint_number(&self) -> u8 {
        ((self.characteristics.get() & characteristics::ENDPOINT_MASK)
            >> characteristics::ENDPOINT_SHIFT) as u8
    }

    pub fn max_packet_length(&self) -> u16 {
        ((self.characteristics.get() & characteristics::MAX_PACKET_MASK)
            >> characteristics::MAX_PACKET_SHIFT) as u16
    }

    pub fn is_reclamation_head(&self) -> bool {
        self.characteristics.get() & characteristics::HEAD_OF_RECLAMATION != 0
    }

    /// Sets up an asynchronous endpoint. The control endpoint flag only
    /// applies to full- and low-speed devices; it must stay clear at high
    /// speed. Control endpoints take their data toggle from each qTD, since
    /// every stage of a control transfer sets it explicitly. Split
    /// transactions and periodic masks are left at zero.
    pub fn initialize(
        &self,
        device_address: u8,
        endpoint_number: u8,
        speed: Speed,
        is_control: bool,
        max_packet_size: u16,
    ) {
        let control = is_control && speed != Speed::High;
        self.characteristics.set(
            (device_address as u32 & characteristics::DEVICE_ADDRESS_MASK)
                | ((endpoint_number as u32) << characteristics::ENDPOINT_SHIFT
                    & characteristics::ENDPOINT_MASK)
                | (speed_bits(speed) << characteristics::SPEED_SHIFT)
                | ((max_packet_size as u32 & 0x7FF) << characteristics::MAX_PACKET_SHIFT)
                | if control { characteristics::CONTROL_ENDPOINT } else { 0 }
                | if is_control { characteristics::DATA_TOGGLE_CONTROL } else { 0 },
        );
        self.capabilities.set(0);
        self.current_qtd.set(0);
        self.overlay.next.set(link::TERMINATE);
        self.overlay.alternate_next.set(link::TERMINATE);
        self.overlay.token.set(0);
    }

    /// Drops whatever the overlay was doing and clears a halt, leaving the
    /// queue head idle with an empty chain. Only while the controller isn't
    /// looking at it: the schedule is off, or the queue head is halted.
    pub fn reset_overlay(&self) {
        self.current_qtd.set(0);
        self.overlay.next.set(link::TERMINATE);
        self.overlay.alternate_next.set(link::TERMINATE);
        self.overlay.token.set(0);
    }

    /// Makes this the empty head of the asynchronous ring: linked to itself,
    /// flagged as head of reclamation, with a halted overlay.
    pub fn make_async_head(&self) {
        self.characteristics.set(characteristics::HEAD_OF_RECLAMATION);
        self.capabilities.set(0);
        self.current_qtd.set(0);
        self.overlay.park();
        self.horizontal.set(self.link());
    }

    /// Makes this the placeholder queue head every periodic frame list entry
    /// points at: terminating, in microframe 0, halted.
    pub fn make_periodic_head(&self) {
        self.horizontal
            .set(link::TERMINATE | ((DescriptorType::Qh as usize) << link::TYPE_SHIFT));
        self.characteristics.set(0);
        self.capabilities.set(1);
        self.current_qtd.set(0);
        self.overlay.park();
    }
}

impl Default for QueueHead {
    fn default() -> Self {
        Self::new()
    }
}

/// The periodic frame list: one link per frame, 4 KiB aligned.
#[repr(C, align(4096))]
pub struct FrameList<const N: usize> {
    entries: [VolatileCell<usize>; N],
}

// Safety: volatile access only.
unsafe impl<const N: usize> Sync for FrameList<N> {}

impl<const N: usize> FrameList<N> {
    pub const fn new() -> Self {
        const ENTRY: VolatileCell<usize> = VolatileCell::new(link::TERMINATE);
        Self { entries: [ENTRY; N] }
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    pub fn fill(&self, link: usize) {
        for entry in &self.entries {
            entry.set(link);
        }
    }

    pub fn entry(&self, frame: usize) -> usize {
        self.entries[frame].get()
    }
}

impl<const N: usize> Default for FrameList<N> {
    fn default() -> Self {
        Self::new()
    }
}
