// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-mode driver: the controller as an EHCI host with one root port.
//!
//! Only the asynchronous schedule (control and bulk) carries traffic. The
//! periodic schedule is built, so the frame list is valid, but every entry
//! points at one idle placeholder queue head.
//!
//! Endpoint queue heads come from a fixed pool and live on a ring hanging off
//! a permanent head-of-reclamation queue head. Transfers are qTDs, also
//! pooled, appended to their queue head's chain. Finished transfers are found
//! by scanning the pending list from the interrupt handler.
//!
//! On top of that sit blocking calls for talking to a device: single
//! transfers, whole control requests, and the standard requests needed to
//! enumerate it (descriptors, address, configuration). These wait on the
//! interrupt handler, so they belong in mainline code.

use crate::buffer::DmaRegion;
use crate::descriptor::{DescriptorType, DeviceDescriptor};
use crate::ehci::{self, Pid};
use crate::error::{Error, Result};
use crate::pool::{FreeList, Linked, NIL};
use crate::registers::{portsc1, usbcmd, usbintr, usbmode, usbsts, ControllerId, Reg, Registers};
use crate::td;
use crate::types::{request_type, SetupPacket, Speed, StandardRequest, UsbDir};
use core::cell::Cell;
use core::hint::spin_loop;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use critical_section::Mutex;

/// Endpoint queue heads available to `set_up_asynchronous_endpoint_queue`.
pub const ASYNC_POOL_SIZE: usize = 8;
/// Transfers that can be in flight at once, across all endpoints.
pub const TD_POOL_SIZE: usize = 8;
/// Entries in the periodic frame list.
pub const PERIODIC_LIST_SIZE: usize = 8;

/// USBCMD frame list size field for a list of `entries`. Only the sizes
/// EHCI allows, powers of two from 8 to 1024, are accepted.
const fn frame_list_size_bits(entries: usize) -> u32 {
    let code = match entries {
        1024 => 0,
        512 => 1,
        256 => 2,
        128 => 3,
        64 => 4,
        32 => 5,
        16 => 6,
        8 => 7,
        _ => panic!("unsupported frame list size"),
    };
    (if code & 1 != 0 { usbcmd::FS0 } else { 0 })
        | (if code & 2 != 0 { usbcmd::FS1 } else { 0 })
        | (if code & 4 != 0 { usbcmd::FS2 } else { 0 })
}

const FRAME_LIST_SIZE_BITS: u32 = frame_list_size_bits(PERIODIC_LIST_SIZE);

/// Called from interrupt context when a host transfer finishes:
/// `callback(context, transferred, halted, transaction_error)`.
#[derive(Copy, Clone, Debug)]
pub struct HostCompletion {
    pub callback: fn(usize, u32, bool, bool),
    pub context: usize,
}

impl HostCompletion {
    pub const fn new(callback: fn(usize, u32, bool, bool), context: usize) -> Self {
        Self { callback, context }
    }
}

/// Most qTDs one `schedule_chain` call links: a control transfer's three
/// stages.
const MAX_CHAIN: usize = 3;

/// One qTD's worth of a chain being scheduled.
#[derive(Copy, Clone)]
struct Stage {
    pid: Pid,
    data_toggle: bool,
    region: DmaRegion,
    completion: Option<HostCompletion>,
    interrupt_on_complete: bool,
}

impl Stage {
    const fn new(pid: Pid, data_toggle: bool, region: DmaRegion) -> Self {
        Self {
            pid,
            data_toggle,
            region,
            completion: None,
            interrupt_on_complete: false,
        }
    }

    const fn interrupting(mut self) -> Self {
        self.interrupt_on_complete = true;
        self
    }
}

/// Where one stage of a blocking transfer reports back to the caller
/// waiting on it.
#[derive(Default)]
struct StageOutcome {
    done: AtomicBool,
    halted: AtomicBool,
    transaction_error: AtomicBool,
    transferred: AtomicU32,
}

impl StageOutcome {
    fn completion(&self) -> HostCompletion {
        HostCompletion::new(Self::record, self as *const Self as usize)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn record(context: usize, transferred: u32, halted: bool, transaction_error: bool) {
        // Safety: `context` came from `completion` on an outcome the waiting
        // caller keeps alive until each of its stages has either reported
        // here or been dropped from the pending list.
        let outcome = unsafe { &*(context as *const StageOutcome) };
        outcome.transferred.store(transferred, Ordering::Relaxed);
        outcome.halted.store(halted, Ordering::Relaxed);
        outcome.transaction_error.store(transaction_error, Ordering::Relaxed);
        outcome.done.store(true, Ordering::Release);
    }
}

struct Slot(AtomicU16);

impl Linked for Slot {
    fn link(&self) -> &AtomicU16 {
        &self.0
    }
}

/// One pooled host transfer. The qTD leads, so the hardware sees a 32-byte
/// aligned descriptor.
#[repr(C, align(32))]
pub struct HostTransfer {
    td: ehci::TransferDescriptor,
    free_next: AtomicU16,
    /// Next on the pending list. Only touched in a critical section.
    pending_next: Cell<u16>,
    queue_head: Cell<usize>,
    maximum_length: Cell<u32>,
    completion: Cell<Option<HostCompletion>>,
}

// Safety: the cells are only written while the transfer is allocated to a
// single owner, or inside a critical section (`pending_next`).
unsafe impl Sync for HostTransfer {}

impl Linked for HostTransfer {
    fn link(&self) -> &AtomicU16 {
        &self.free_next
    }
}

impl HostTransfer {
    const NEW: Self = Self {
        td: ehci::TransferDescriptor::new(),
        free_next: AtomicU16::new(NIL),
        pending_next: Cell::new(NIL),
        queue_head: Cell::new(0),
        maximum_length: Cell::new(0),
        completion: Cell::new(None),
    };

    pub fn td(&self) -> &ehci::TransferDescriptor {
        &self.td
    }

    pub fn maximum_length(&self) -> u32 {
        self.maximum_length.get()
    }
}

/// Everything the host controller reads by DMA. Must be a static.
pub struct HostMemory {
    async_head: ehci::QueueHead,
    periodic_head: ehci::QueueHead,
    frame_list: ehci::FrameList<PERIODIC_LIST_SIZE>,
    queue_heads: [ehci::QueueHead; ASYNC_POOL_SIZE],
    queue_head_links: [Slot; ASYNC_POOL_SIZE],
    transfers: [HostTransfer; TD_POOL_SIZE],
}

impl HostMemory {
    pub const fn new() -> Self {
        const QH: ehci::QueueHead = ehci::QueueHead::new();
        const SLOT: Slot = Slot(AtomicU16::new(NIL));
        Self {
            async_head: ehci::QueueHead::new(),
            periodic_head: ehci::QueueHead::new(),
            frame_list: ehci::FrameList::new(),
            queue_heads: [QH; ASYNC_POOL_SIZE],
            queue_head_links: [SLOT; ASYNC_POOL_SIZE],
            transfers: [HostTransfer::NEW; TD_POOL_SIZE],
        }
    }

    pub fn async_head(&self) -> &ehci::QueueHead {
        &self.async_head
    }

    pub fn periodic_head(&self) -> &ehci::QueueHead {
        &self.periodic_head
    }

    pub fn frame_list(&self) -> &ehci::FrameList<PERIODIC_LIST_SIZE> {
        &self.frame_list
    }

    fn queue_head_index(&self, qh: &ehci::QueueHead) -> Option<usize> {
        self.queue_heads
            .iter()
            .position(|candidate| core::ptr::eq(candidate, qh))
    }

    /// The queue head at a hardware link address, if it's one of ours.
    fn queue_head_at(&self, address: usize) -> Option<&ehci::QueueHead> {
        core::iter::once(&self.async_head)
            .chain(self.queue_heads.iter())
            .find(|qh| qh.address() == address)
    }

    fn transfer_at(&self, address: usize) -> Option<&HostTransfer> {
        self.transfers.iter().find(|t| t.td.address() == address)
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UsbHost<R> {
    regs: R,
    controller: ControllerId,
    memory: &'static HostMemory,
    free_queue_heads: FreeList,
    free_transfers: FreeList,
    pending: Mutex<Cell<u16>>,
}

impl<R: Registers> UsbHost<R> {
    pub const fn new(regs: R, controller: ControllerId, memory: &'static HostMemory) -> Self {
        Self {
            regs,
            controller,
            memory,
            free_queue_heads: FreeList::new(),
            free_transfers: FreeList::new(),
            pending: Mutex::new(Cell::new(NIL)),
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    pub fn memory(&self) -> &'static HostMemory {
        self.memory
    }

    /// Resets the controller and brings it up as a host with empty
    /// schedules. Forgets every queue head and transfer handed out before.
    pub fn init(&self) -> Result<()> {
        self.controller_reset();
        self.set_host_mode();
        self.set_up_interrupts();

        let memory = self.memory;
        self.free_queue_heads.init(&memory.queue_head_links)?;
        self.free_transfers.init(&memory.transfers)?;
        critical_section::with(|cs| self.pending.borrow(cs).set(NIL));

        self.set_up_lists();
        log::info!("{:?}: host controller initialized", self.controller);
        Ok(())
    }

    pub fn run(&self) {
        self.regs.set_bits(Reg::UsbCmd, usbcmd::RS);
    }

    fn halt(&self) {
        self.regs.clear_bits(Reg::UsbCmd, usbcmd::RS);
        while self.regs.read(Reg::UsbSts) & usbsts::HCH == 0 {
            spin_loop();
        }
    }

    fn controller_reset(&self) {
        // Resetting a running host is undefined; halt first.
        self.halt();
        self.regs.write(Reg::UsbCmd, usbcmd::RST);
        while self.regs.read(Reg::UsbCmd) & usbcmd::RST != 0 {
            spin_loop();
        }
    }

    fn set_host_mode(&self) {
        self.halt();
        // VBPS: we supply VBUS, as far as the controller is concerned.
        self.regs.modify(Reg::UsbMode, |v| {
            (v & !usbmode::CM_MASK) | usbmode::CM_HOST | usbmode::VBPS
        });
    }

    fn set_up_interrupts(&self) {
        self.regs.write(Reg::UsbIntr, 0);
        self.regs.write(Reg::UsbSts, !0);
        self.regs.write(
            Reg::UsbIntr,
            usbintr::UE
                | usbintr::UEE
                | usbintr::PCE
                | usbintr::AAE
                | usbintr::SRE
                | usbintr::UAIE
                | usbintr::UPIA,
        );
    }

    fn set_up_lists(&self) {
        let memory = self.memory;

        memory.async_head.make_async_head();
        self.regs
            .write(Reg::AsyncListAddr, memory.async_head.address() as u32);

        memory.periodic_head.make_periodic_head();
        memory.frame_list.fill(memory.periodic_head.link());
        self.regs
            .write(Reg::PeriodicListBase, memory.frame_list.address() as u32);

        self.regs.modify(Reg::UsbCmd, |v| {
            (v & !(usbcmd::FS0 | usbcmd::FS1 | usbcmd::FS2)) | FRAME_LIST_SIZE_BITS
        });
        // Periodic stays off until something needs it.
        self.regs.set_bits(Reg::UsbCmd, usbcmd::ASE);
    }

    fn disable_asynchronous_schedule(&self) {
        self.regs.clear_bits(Reg::UsbCmd, usbcmd::ASE);
        while self.regs.read(Reg::UsbSts) & usbsts::AS != 0 {
            spin_loop();
        }
    }

    fn enable_asynchronous_schedule(&self) {
        self.regs.set_bits(Reg::UsbCmd, usbcmd::ASE);
        while self.regs.read(Reg::UsbSts) & usbsts::AS == 0 {
            spin_loop();
        }
    }

    /// Allocates a queue head for one endpoint of a downstream device and
    /// links it into the asynchronous schedule.
    pub fn set_up_asynchronous_endpoint_queue(
        &self,
        device_address: u8,
        endpoint_number: u8,
        speed: Speed,
        is_control: bool,
        max_packet_size: u16,
    ) -> Result<&'static ehci::QueueHead> {
        if device_address > 127 || endpoint_number > 15 || max_packet_size > 1024 {
            return Err(Error::InvalidArgument);
        }
        let memory = self.memory;
        let index = self
            .free_queue_heads
            .pop(&memory.queue_head_links)
            .ok_or(Error::PoolExhausted)?;
        let qh = &memory.queue_heads[index];
        qh.initialize(device_address, endpoint_number, speed, is_control, max_packet_size);

        // The controller may be holding the head's horizontal link; only edit
        // the ring while it's off.
        self.disable_asynchronous_schedule();
        qh.set_horizontal(memory.async_head.horizontal());
        memory.async_head.set_horizontal(qh.link());
        self.enable_asynchronous_schedule();

        log::debug!(
            "{:?}: queue for device {} endpoint {}, {:?}",
            self.controller,
            device_address,
            endpoint_number,
            speed
        );
        Ok(qh)
    }

    /// Unlinks a queue head from the asynchronous schedule and returns it to
    /// the pool. Transfers still pending on it are dropped without their
    /// completions running.
    pub fn tear_down_asynchronous_endpoint_queue(&self, qh: &'static ehci::QueueHead) -> Result<()> {
        let memory = self.memory;
        let index = memory.queue_head_index(qh).ok_or(Error::InvalidArgument)?;

        self.disable_asynchronous_schedule();
        let mut previous = &memory.async_head;
        let found = loop {
            let next = ehci::link_pointer(previous.horizontal());
            if next == qh.address() {
                previous.set_horizontal(qh.horizontal());
                break true;
            }
            match memory.queue_head_at(next) {
                Some(n) if !core::ptr::eq(n, &memory.async_head) => previous = n,
                _ => break false,
            }
        };
        // With the schedule off the controller caches nothing, so the queue
        // head is free for reuse as soon as it's back on.
        self.enable_asynchronous_schedule();
        if !found {
            return Err(Error::InvalidArgument);
        }

        let dropped = self.take_pending(|t| t.queue_head.get() == qh.address());
        self.free_queue_heads.push(&memory.queue_head_links, index);
        log::debug!(
            "{:?}: queue torn down, {} transfers dropped",
            self.controller,
            dropped
        );
        Ok(())
    }

    /// Queues a transfer of `region` on `qh`. The PID sets the direction;
    /// `data_toggle` is the toggle the qTD starts with, for queue heads that
    /// take their toggle from the qTD.
    pub fn transfer_schedule(
        &self,
        qh: &'static ehci::QueueHead,
        pid: Pid,
        data_toggle: bool,
        region: DmaRegion,
        completion: Option<HostCompletion>,
    ) -> Result<()> {
        let stage = Stage {
            completion,
            ..Stage::new(pid, data_toggle, region).interrupting()
        };
        self.schedule_chain(qh, &[stage])
    }

    /// Queues `stages` on `qh` as one chain of qTDs. The chain is built and
    /// linked up first, then hung off the queue head in one step, so the
    /// controller never sees half of it.
    fn schedule_chain(&self, qh: &'static ehci::QueueHead, stages: &[Stage]) -> Result<()> {
        let memory = self.memory;
        memory.queue_head_index(qh).ok_or(Error::InvalidArgument)?;
        if stages.is_empty() || stages.len() > MAX_CHAIN {
            return Err(Error::InvalidArgument);
        }
        for stage in stages {
            let region = stage.region;
            if !td::fits_in_pages(region.addr(), region.len() as u32)
                || (stage.pid == Pid::In && !region.is_empty() && !region.is_writable())
            {
                return Err(Error::InvalidArgument);
            }
        }

        let mut slots = [0; MAX_CHAIN];
        for i in 0..stages.len() {
            match self.free_transfers.pop(&memory.transfers) {
                Some(index) => slots[i] = index,
                None => {
                    for &index in &slots[..i] {
                        self.free_transfers.push(&memory.transfers, index);
                    }
                    return Err(Error::PoolExhausted);
                }
            }
        }
        let chain = &slots[..stages.len()];

        for (&index, stage) in chain.iter().zip(stages) {
            let transfer = &memory.transfers[index];
            transfer.td.prepare(
                stage.pid,
                stage.data_toggle,
                stage.interrupt_on_complete,
                stage.region.addr(),
                stage.region.len() as u32,
            );
            transfer.queue_head.set(qh.address());
            transfer.maximum_length.set(stage.region.len() as u32);
            transfer.completion.set(stage.completion);
        }
        for pair in chain.windows(2) {
            memory.transfers[pair[0]]
                .td
                .set_next(memory.transfers[pair[1]].td.address());
        }
        let first = &memory.transfers[chain[0]];

        critical_section::with(|cs| {
            // Pending list, in scheduling order.
            let head = self.pending.borrow(cs);
            let mut tail = self.pending_tail(head.get());
            for &index in chain {
                let transfer = &memory.transfers[index];
                transfer.pending_next.set(NIL);
                match tail {
                    Some(t) => t.pending_next.set(index as u16),
                    None => head.set(index as u16),
                }
                tail = Some(transfer);
            }

            // The hardware chain: follow the overlay to the terminating link.
            let mut last = qh.overlay();
            while !ehci::is_terminating(last.next()) {
                match memory.transfer_at(ehci::link_pointer(last.next())) {
                    Some(t) => last = &t.td,
                    None => break,
                }
            }
            last.set_next(first.td.address());
        });
        for stage in stages {
            log::trace!(
                "{:?}: {:?} transfer, {} bytes",
                self.controller,
                stage.pid,
                stage.region.len()
            );
        }
        Ok(())
    }

    /// Queues `stages` on `qh` and waits until all of them have finished,
    /// or one has halted. Returns the bytes each stage moved.
    ///
    /// The wait relies on the interrupt handler to retire transfers, so the
    /// USB interrupt (or a loop polling `handle_interrupt`) must be running,
    /// and this must not be called from it.
    fn run_chain<const N: usize>(
        &self,
        qh: &'static ehci::QueueHead,
        mut stages: [Stage; N],
    ) -> Result<[u32; N]> {
        let outcomes: [StageOutcome; N] = core::array::from_fn(|_| StageOutcome::default());
        for (stage, outcome) in stages.iter_mut().zip(&outcomes) {
            stage.completion = Some(outcome.completion());
        }
        self.schedule_chain(qh, &stages)?;

        loop {
            let failed = outcomes
                .iter()
                .find(|o| o.is_done() && o.halted.load(Ordering::Relaxed));
            if let Some(failed) = failed {
                let error = if failed.transaction_error.load(Ordering::Relaxed) {
                    Error::TransactionError
                } else {
                    Error::Stalled
                };
                self.abandon(qh);
                return Err(error);
            }
            if outcomes.iter().all(StageOutcome::is_done) {
                break;
            }
            spin_loop();
        }
        Ok(core::array::from_fn(|i| {
            outcomes[i].transferred.load(Ordering::Relaxed)
        }))
    }

    /// Cleans up after a halt on `qh`: transfers still queued behind the
    /// failed one go back to the pool without completions, and the queue
    /// head is cleared for reuse.
    fn abandon(&self, qh: &'static ehci::QueueHead) {
        let dropped = self.take_pending(|t| t.queue_head.get() == qh.address());
        // Halted, so the controller has let go of it.
        qh.reset_overlay();
        log::debug!(
            "{:?}: device {} endpoint {} halted, {} transfers dropped",
            self.controller,
            qh.device_address(),
            qh.endpoint_number(),
            dropped
        );
    }

    /// Moves `region` on `qh` as a single qTD and waits for it, returning
    /// the bytes transferred. A STALL comes back as `Error::Stalled`. See
    /// `run_chain` for the rules on waiting.
    pub fn transfer(
        &self,
        qh: &'static ehci::QueueHead,
        pid: Pid,
        data_toggle: bool,
        region: DmaRegion,
    ) -> Result<u32> {
        let [moved] = self.run_chain(qh, [Stage::new(pid, data_toggle, region).interrupting()])?;
        Ok(moved)
    }

    pub fn send_on_endpoint(&self, qh: &'static ehci::QueueHead, data: DmaRegion) -> Result<u32> {
        self.transfer(qh, Pid::Out, false, data)
    }

    pub fn read_from_endpoint(&self, qh: &'static ehci::QueueHead, data: DmaRegion) -> Result<u32> {
        self.transfer(qh, Pid::In, false, data)
    }

    /// Runs a whole control transfer on `qh` and waits for it: the SETUP
    /// stage, a data stage in the direction `setup` gives if it asks for any
    /// bytes, and a status stage going the other way (IN when there's no
    /// data). `data` has to hold `setup.length` bytes. Returns the number of
    /// data bytes moved, which for a read may be short.
    ///
    /// Only the status stage interrupts on completion; a halt in an earlier
    /// stage is caught by the error interrupt.
    pub fn control_request(
        &self,
        qh: &'static ehci::QueueHead,
        setup: &SetupPacket,
        data: DmaRegion,
    ) -> Result<u32> {
        let length = usize::from(setup.length.get());
        if data.len() < length {
            return Err(Error::InvalidArgument);
        }

        let packet = *setup;
        // Safety: `packet` outlives the transfer, since `run_chain` doesn't
        // return while any stage is still queued.
        let packet_region = unsafe {
            DmaRegion::from_raw_parts(
                &packet as *const SetupPacket as usize,
                size_of::<SetupPacket>(),
                false,
            )
        };
        let setup_stage = Stage::new(Pid::Setup, false, packet_region);

        if length == 0 {
            self.run_chain(
                qh,
                [setup_stage, Stage::new(Pid::In, true, DmaRegion::EMPTY).interrupting()],
            )?;
            return Ok(0);
        }
        let (data_pid, status_pid) = match setup.direction() {
            UsbDir::In => (Pid::In, Pid::Out),
            UsbDir::Out => (Pid::Out, Pid::In),
        };
        let [_, moved, _] = self.run_chain(
            qh,
            [
                setup_stage,
                Stage::new(data_pid, true, data.truncated(length)),
                Stage::new(status_pid, true, DmaRegion::EMPTY).interrupting(),
            ],
        )?;
        Ok(moved)
    }

    /// GET_DESCRIPTOR for up to `out.len()` bytes of descriptor `kind`
    /// number `index`. `language` is the LANGID for string descriptors and
    /// zero otherwise.
    pub fn get_descriptor(
        &self,
        qh: &'static ehci::QueueHead,
        kind: DescriptorType,
        index: u8,
        language: u16,
        out: DmaRegion,
    ) -> Result<u32> {
        let setup = SetupPacket::new(
            request_type::DEVICE_TO_HOST | request_type::STANDARD | request_type::RECIPIENT_DEVICE,
            StandardRequest::GetDescriptor as u8,
            (kind as u16) << 8 | u16::from(index),
            language,
            u16::try_from(out.len()).unwrap_or(u16::MAX),
        );
        self.control_request(qh, &setup, out)
    }

    pub fn read_device_descriptor(&self, qh: &'static ehci::QueueHead, out: DmaRegion) -> Result<u32> {
        let out = out.truncated(size_of::<DeviceDescriptor>());
        self.get_descriptor(qh, DescriptorType::Device, 0, 0, out)
    }

    /// Reads the first configuration descriptor, and as much of the
    /// interface and endpoint descriptors after it as fits in `out`.
    pub fn read_configuration_descriptors(
        &self,
        qh: &'static ehci::QueueHead,
        out: DmaRegion,
    ) -> Result<u32> {
        self.get_descriptor(qh, DescriptorType::Configuration, 0, 0, out)
    }

    pub fn set_configuration(&self, qh: &'static ehci::QueueHead, number: u8) -> Result<()> {
        self.standard_out(qh, StandardRequest::SetConfiguration, u16::from(number))
    }

    /// Moves the device on `qh` to `address`. Its queue heads have to be
    /// set up again with the new address afterwards.
    pub fn set_address(&self, qh: &'static ehci::QueueHead, address: u8) -> Result<()> {
        if address > 127 {
            return Err(Error::InvalidArgument);
        }
        self.standard_out(qh, StandardRequest::SetAddress, u16::from(address))
    }

    fn standard_out(
        &self,
        qh: &'static ehci::QueueHead,
        request: StandardRequest,
        value: u16,
    ) -> Result<()> {
        let setup = SetupPacket::new(
            request_type::HOST_TO_DEVICE | request_type::STANDARD | request_type::RECIPIENT_DEVICE,
            request as u8,
            value,
            0,
            0,
        );
        self.control_request(qh, &setup, DmaRegion::EMPTY)?;
        Ok(())
    }

    fn pending_tail(&self, mut index: u16) -> Option<&'static HostTransfer> {
        let memory = self.memory;
        let mut tail = None;
        while let Some(t) = memory.transfers.get(usize::from(index)) {
            tail = Some(t);
            index = t.pending_next.get();
        }
        tail
    }

    /// Unlinks the first pending transfer matching `pred`.
    fn unlink_pending(&self, pred: impl Fn(&HostTransfer) -> bool) -> Option<(usize, &'static HostTransfer)> {
        let memory = self.memory;
        critical_section::with(|cs| {
            let head = self.pending.borrow(cs);
            let mut previous: Option<&HostTransfer> = None;
            let mut index = head.get();
            while let Some(t) = memory.transfers.get(usize::from(index)) {
                if pred(t) {
                    match previous {
                        Some(p) => p.pending_next.set(t.pending_next.get()),
                        None => head.set(t.pending_next.get()),
                    }
                    t.pending_next.set(NIL);
                    return Some((usize::from(index), t));
                }
                previous = Some(t);
                index = t.pending_next.get();
            }
            None
        })
    }

    /// Frees every pending transfer matching `pred`, without completions.
    fn take_pending(&self, pred: impl Fn(&HostTransfer) -> bool) -> usize {
        let mut n = 0;
        while let Some((index, _)) = self.unlink_pending(&pred) {
            self.free_transfers.push(&self.memory.transfers, index);
            n += 1;
        }
        n
    }

    pub fn pending_count(&self) -> usize {
        let memory = self.memory;
        critical_section::with(|cs| {
            let mut n = 0;
            let mut index = self.pending.borrow(cs).get();
            while let Some(t) = memory.transfers.get(usize::from(index)) {
                n += 1;
                index = t.pending_next.get();
            }
            n
        })
    }

    /// Reports and frees every pending transfer the controller has finished
    /// with, successfully or not. Returns how many there were.
    pub fn handle_asynchronous_transfer_complete(&self) -> usize {
        let mut n = 0;
        while let Some((index, transfer)) = self.unlink_pending(|t| !t.td.is_active()) {
            let td = &transfer.td;
            let transferred = transfer
                .maximum_length
                .get()
                .saturating_sub(td.remaining_bytes());
            let halted = td.is_halted();
            let transaction_error = td.has_transaction_error();
            if halted {
                log::debug!(
                    "{:?}: transfer halted, transaction error {}",
                    self.controller,
                    transaction_error
                );
            }
            if let Some(c) = transfer.completion.get() {
                (c.callback)(c.context, transferred, halted, transaction_error);
            }
            self.free_transfers.push(&self.memory.transfers, index);
            n += 1;
        }
        n
    }

    /// Drives reset on the root port, returning when the controller ends
    /// it. Give the device 100 ms or so before talking to it.
    pub fn reset_device(&self) {
        self.modify_port(|v| (v & !portsc1::PE) | portsc1::PR);
        while self.regs.read(Reg::PortSc1) & portsc1::PR != 0 {
            spin_loop();
        }
    }

    pub fn provide_vbus(&self) {
        self.modify_port(|v| v | portsc1::PP);
    }

    pub fn stop_providing_vbus(&self) {
        self.modify_port(|v| v & !portsc1::PP);
    }

    /// Read-modify-write of PORTSC1 that doesn't clear the change bits by
    /// writing them back.
    fn modify_port(&self, f: impl FnOnce(u32) -> u32) {
        self.regs.modify(Reg::PortSc1, |v| {
            f(v & !(portsc1::CSC | portsc1::PEC))
        });
    }

    pub fn device_connected(&self) -> bool {
        self.regs.read(Reg::PortSc1) & portsc1::CCS != 0
    }

    /// Speed of the attached device, if there is one.
    pub fn port_speed(&self) -> Option<Speed> {
        if !self.device_connected() {
            return None;
        }
        match (self.regs.read(Reg::PortSc1) & portsc1::PSPD_MASK) >> portsc1::PSPD_SHIFT {
            1 => Some(Speed::Low),
            2 => Some(Speed::High),
            _ => Some(Speed::Full),
        }
    }

    pub fn get_status(&self) -> u32 {
        let status = self.regs.read(Reg::UsbSts) & self.regs.read(Reg::UsbIntr);
        self.regs.write(Reg::UsbSts, status);
        status
    }

    /// The body of the USB interrupt handler in host mode.
    pub fn handle_interrupt(&self) {
        let status = self.get_status();
        if status & (usbsts::UI | usbsts::UAI) != 0 {
            self.handle_asynchronous_transfer_complete();
        }
        if status & usbsts::PCI != 0 {
            log::debug!(
                "{:?}: port change, connected: {}",
                self.controller,
                self.device_connected()
            );
        }
        if status & usbsts::UEI != 0 {
            log::warn!("{:?}: transaction error", self.controller);
            // Failed transfers are retired like any other.
            self.handle_asynchronous_transfer_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DmaBuffer;
    use crate::registers::mock::MockRegisters;
    use std::sync::Mutex as StdMutex;
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    type MockHost = UsbHost<MockRegisters>;

    static BUFFER: DmaBuffer<256> = DmaBuffer::new();

    fn host() -> &'static MockHost {
        let memory = Box::leak(Box::new(HostMemory::new()));
        let host = Box::leak(Box::new(UsbHost::new(
            MockRegisters::new(),
            ControllerId::Usb1,
            memory,
        )));
        host.init().unwrap();
        host
    }

    /// The ring of queue heads after the async head, in order.
    fn ring(host: &MockHost) -> Vec<usize> {
        let memory = host.memory();
        let head = memory.async_head().address();
        let mut out = vec![];
        let mut next = ehci::link_pointer(memory.async_head().horizontal());
        while next != head {
            out.push(next);
            next = ehci::link_pointer(memory.queue_head_at(next).unwrap().horizontal());
            assert!(out.len() <= ASYNC_POOL_SIZE, "ring isn't closed");
        }
        out
    }

    /// Stands in for the controller finishing the qTD at the front of
    /// `qh`'s chain.
    fn finish(host: &MockHost, qh: &ehci::QueueHead, remaining: u32, status: u32) {
        let memory = host.memory();
        let next = qh.overlay().next();
        let transfer = memory.transfer_at(ehci::link_pointer(next)).unwrap();
        let td = transfer.td();
        let kept = td.token()
            & !(ehci::token::TOTAL_BYTES_MASK | ehci::token::STATUS_ACTIVE);
        td.set_token(kept | (remaining << ehci::token::TOTAL_BYTES_SHIFT) | status);
        qh.overlay().set_next(td.next());
        if td.token() & ehci::token::IOC != 0 {
            host.registers().raise(Reg::UsbSts, usbsts::UAI);
        }
        if status & ehci::token::STATUS_HALTED != 0 {
            host.registers().raise(Reg::UsbSts, usbsts::UEI);
        }
    }

    /// What one qTD asked of the bus.
    #[derive(Debug, PartialEq)]
    struct Seen {
        pid: u32,
        toggle: bool,
        ioc: bool,
        length: u32,
        setup: Option<[u8; 8]>,
    }

    fn asked(pid: Pid, toggle: bool, ioc: bool, length: u32) -> Seen {
        Seen {
            pid: pid as u32,
            toggle,
            ioc,
            length,
            setup: None,
        }
    }

    /// The first active qTD on `qh`'s chain, once one turns up.
    fn next_active(host: &MockHost, qh: &ehci::QueueHead) -> &'static HostTransfer {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let next = qh.overlay().next();
            if !ehci::is_terminating(next) {
                if let Some(t) = host.memory().transfer_at(ehci::link_pointer(next)) {
                    if t.td().is_active() {
                        return t;
                    }
                }
            }
            assert!(Instant::now() < deadline, "no qTD was scheduled");
            std::thread::yield_now();
        }
    }

    /// Plays the controller and the downstream device on another thread,
    /// while the test thread sits in a blocking call. Each
    /// `(remaining, status)` retires the next qTD on `qh`, then runs the
    /// interrupt handler as the hardware would.
    fn bus(
        host: &'static MockHost,
        qh: &'static ehci::QueueHead,
        script: Vec<(u32, u32)>,
    ) -> JoinHandle<Vec<Seen>> {
        std::thread::spawn(move || {
            script
                .into_iter()
                .map(|(remaining, status)| {
                    let td = next_active(host, qh).td();
                    let token = td.token();
                    let pid = (token & ehci::token::PID_MASK) >> ehci::token::PID_SHIFT;
                    let setup = (pid == Pid::Setup as u32).then(|| {
                        // Safety: the packet is on the stack of the caller
                        // blocked waiting for this qTD.
                        let bytes = unsafe { core::slice::from_raw_parts(td.page(0) as *const u8, 8) };
                        let mut packet = [0; 8];
                        packet.copy_from_slice(bytes);
                        packet
                    });
                    let seen = Seen {
                        pid,
                        toggle: token & ehci::token::DATA_TOGGLE != 0,
                        ioc: token & ehci::token::IOC != 0,
                        length: td.remaining_bytes(),
                        setup,
                    };
                    finish(host, qh, remaining, status);
                    host.handle_interrupt();
                    seen
                })
                .collect()
        })
    }

    fn control_queue(host: &MockHost) -> &'static ehci::QueueHead {
        host.set_up_asynchronous_endpoint_queue(0, 0, Speed::Full, true, 64)
            .unwrap()
    }

    #[test]
    fn init_builds_empty_schedules() {
        let host = host();
        let regs = host.registers();
        let memory = host.memory();

        assert_eq!(regs.peek(Reg::UsbMode), usbmode::CM_HOST | usbmode::VBPS);
        let head = memory.async_head();
        assert_eq!(ehci::link_pointer(head.horizontal()), head.address());
        assert!(head.is_reclamation_head());
        assert!(head.overlay().is_halted());
        assert_eq!(regs.peek(Reg::AsyncListAddr), head.address() as u32);

        let periodic = memory.periodic_head().link();
        for i in 0..PERIODIC_LIST_SIZE {
            assert_eq!(memory.frame_list().entry(i), periodic);
        }
        assert!(ehci::is_terminating(memory.periodic_head().horizontal()));
        assert_eq!(
            regs.peek(Reg::PeriodicListBase),
            memory.frame_list().address() as u32
        );

        let cmd = regs.peek(Reg::UsbCmd);
        assert_ne!(cmd & usbcmd::ASE, 0);
        assert_eq!(cmd & usbcmd::PSE, 0);
        assert_eq!(
            cmd & (usbcmd::FS0 | usbcmd::FS1 | usbcmd::FS2),
            usbcmd::FS0 | usbcmd::FS1 | usbcmd::FS2
        );
        assert_ne!(regs.peek(Reg::UsbIntr) & usbintr::UAIE, 0);
    }

    #[test]
    fn frame_list_sizes() {
        assert_eq!(frame_list_size_bits(1024), 0);
        assert_eq!(frame_list_size_bits(32), usbcmd::FS0 | usbcmd::FS2);
        let all: Vec<u32> = [1024, 512, 256, 128, 64, 32, 16, 8]
            .iter()
            .map(|&n| frame_list_size_bits(n))
            .collect();
        for (i, bits) in all.iter().enumerate() {
            assert!(!all[i + 1..].contains(bits));
        }
    }

    #[test]
    fn queue_heads_join_the_ring_with_the_schedule_off() {
        let host = host();
        let regs = host.registers();
        regs.clear_write_log();

        let a = host
            .set_up_asynchronous_endpoint_queue(1, 0, Speed::Full, true, 64)
            .unwrap();
        let b = host
            .set_up_asynchronous_endpoint_queue(1, 2, Speed::High, false, 512)
            .unwrap();
        assert_eq!(ring(host), vec![b.address(), a.address()]);

        assert_eq!(a.device_address(), 1);
        assert_eq!(b.endpoint_number(), 2);
        assert_eq!(b.max_packet_length(), 512);
        assert_ne!(a.characteristics() & ehci::characteristics::CONTROL_ENDPOINT, 0);
        assert_eq!(b.characteristics() & ehci::characteristics::CONTROL_ENDPOINT, 0);

        let ase: Vec<bool> = regs
            .writes_to(Reg::UsbCmd)
            .iter()
            .map(|v| v & usbcmd::ASE != 0)
            .collect();
        assert_eq!(ase, vec![false, true, false, true]);
        assert_ne!(regs.peek(Reg::UsbSts) & usbsts::AS, 0);
    }

    #[test]
    fn queue_head_pool_is_finite_and_reusable() {
        let host = host();
        let qhs: Vec<_> = (0..ASYNC_POOL_SIZE as u8)
            .map(|i| {
                host.set_up_asynchronous_endpoint_queue(i + 1, 1, Speed::Full, false, 64)
                    .unwrap()
            })
            .collect();
        assert_eq!(
            host.set_up_asynchronous_endpoint_queue(20, 1, Speed::Full, false, 64)
                .err(),
            Some(Error::PoolExhausted)
        );

        host.tear_down_asynchronous_endpoint_queue(qhs[3]).unwrap();
        assert_eq!(ring(host).len(), ASYNC_POOL_SIZE - 1);
        assert!(!ring(host).contains(&qhs[3].address()));
        assert_eq!(
            host.tear_down_asynchronous_endpoint_queue(qhs[3]),
            Err(Error::InvalidArgument)
        );

        let again = host
            .set_up_asynchronous_endpoint_queue(20, 1, Speed::Full, false, 64)
            .unwrap();
        assert!(core::ptr::eq(again, qhs[3]));
        assert_eq!(ring(host).len(), ASYNC_POOL_SIZE);
    }

    #[test]
    fn bad_queue_parameters_are_rejected() {
        let host = host();
        assert_eq!(
            host.set_up_asynchronous_endpoint_queue(128, 0, Speed::Full, true, 64)
                .err(),
            Some(Error::InvalidArgument)
        );
        static STRAY: ehci::QueueHead = ehci::QueueHead::new();
        assert_eq!(
            host.transfer_schedule(&STRAY, Pid::Out, false, DmaRegion::EMPTY, None),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn transfers_chain_behind_the_overlay() {
        let host = host();
        let qh = host
            .set_up_asynchronous_endpoint_queue(3, 0, Speed::High, true, 64)
            .unwrap();
        let region = BUFFER.region().truncated(8);
        host.transfer_schedule(qh, Pid::Setup, false, region, None).unwrap();
        host.transfer_schedule(qh, Pid::In, true, BUFFER.region().truncated(18), None)
            .unwrap();

        let first = host.memory().transfer_at(qh.overlay().next()).unwrap();
        assert_eq!(first.maximum_length(), 8);
        assert!(first.td().is_active());
        assert_eq!(
            (first.td().token() & ehci::token::PID_MASK) >> ehci::token::PID_SHIFT,
            Pid::Setup as u32
        );
        let second = host.memory().transfer_at(first.td().next()).unwrap();
        assert_eq!(second.maximum_length(), 18);
        assert_ne!(second.td().token() & ehci::token::DATA_TOGGLE, 0);
        assert!(ehci::is_terminating(second.td().next()));
        assert_eq!(host.pending_count(), 2);
    }

    #[test]
    fn completions_report_bytes_and_errors() {
        static SEEN: StdMutex<Vec<(usize, u32, bool, bool)>> = StdMutex::new(Vec::new());
        fn record(context: usize, transferred: u32, halted: bool, error: bool) {
            SEEN.lock().unwrap().push((context, transferred, halted, error));
        }

        let host = host();
        let qh = host
            .set_up_asynchronous_endpoint_queue(2, 1, Speed::Full, false, 64)
            .unwrap();
        let region = BUFFER.region().truncated(64);
        for context in [1, 2] {
            host.transfer_schedule(qh, Pid::In, false, region, Some(HostCompletion::new(record, context)))
                .unwrap();
        }

        finish(host, qh, 4, 0);
        host.handle_interrupt();
        assert_eq!(*SEEN.lock().unwrap(), vec![(1, 60, false, false)]);
        assert_eq!(host.pending_count(), 1);

        finish(
            host,
            qh,
            64,
            ehci::token::STATUS_HALTED | ehci::token::STATUS_TRANSACTION_ERROR,
        );
        host.handle_interrupt();
        assert_eq!(
            *SEEN.lock().unwrap(),
            vec![(1, 60, false, false), (2, 0, true, true)]
        );
        assert_eq!(host.pending_count(), 0);
    }

    #[test]
    fn transfer_pool_exhausts_and_recovers_on_teardown() {
        let host = host();
        let qh = host
            .set_up_asynchronous_endpoint_queue(2, 1, Speed::Full, false, 64)
            .unwrap();
        for _ in 0..TD_POOL_SIZE {
            host.transfer_schedule(qh, Pid::Out, false, DmaRegion::EMPTY, None)
                .unwrap();
        }
        assert_eq!(
            host.transfer_schedule(qh, Pid::Out, false, DmaRegion::EMPTY, None),
            Err(Error::PoolExhausted)
        );
        host.tear_down_asynchronous_endpoint_queue(qh).unwrap();
        assert_eq!(host.pending_count(), 0);

        let qh = host
            .set_up_asynchronous_endpoint_queue(2, 1, Speed::Full, false, 64)
            .unwrap();
        host.transfer_schedule(qh, Pid::Out, false, DmaRegion::EMPTY, None)
            .unwrap();
    }

    #[test]
    fn reading_into_flash_is_rejected() {
        static ROM: [u8; 4] = [0; 4];
        let host = host();
        let qh = host
            .set_up_asynchronous_endpoint_queue(2, 1, Speed::Full, false, 64)
            .unwrap();
        assert_eq!(
            host.transfer_schedule(qh, Pid::In, false, DmaRegion::from_static(&ROM), None),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            host.transfer_schedule(qh, Pid::Out, false, DmaRegion::from_static(&ROM), None),
            Ok(())
        );
    }

    #[test]
    fn port_control() {
        let host = host();
        let regs = host.registers();
        assert!(!host.device_connected());
        assert_eq!(host.port_speed(), None);

        regs.raise(Reg::PortSc1, portsc1::CCS | portsc1::PE | portsc1::CSC | (1 << portsc1::PSPD_SHIFT));
        assert!(host.device_connected());
        assert_eq!(host.port_speed(), Some(Speed::Low));

        host.provide_vbus();
        assert_ne!(regs.peek(Reg::PortSc1) & portsc1::PP, 0);
        // Change bits aren't written back.
        assert!(regs.writes_to(Reg::PortSc1).iter().all(|v| v & portsc1::CSC == 0));

        regs.clear_write_log();
        host.reset_device();
        let writes = regs.writes_to(Reg::PortSc1);
        assert_eq!(writes.len(), 1);
        assert_ne!(writes[0] & portsc1::PR, 0);
        assert_eq!(writes[0] & portsc1::PE, 0);
        assert_eq!(regs.peek(Reg::PortSc1) & portsc1::PR, 0);

        host.stop_providing_vbus();
        assert_eq!(regs.peek(Reg::PortSc1) & portsc1::PP, 0);
    }

    #[test]
    fn device_descriptor_read_is_three_stages() {
        let host = host();
        let qh = control_queue(host);
        let device = bus(host, qh, vec![(0, 0), (0, 0), (0, 0)]);
        let read = host.read_device_descriptor(qh, BUFFER.region());
        let seen = device.join().unwrap();

        assert_eq!(read, Ok(18));
        assert_eq!(
            seen,
            vec![
                Seen {
                    setup: Some([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]),
                    ..asked(Pid::Setup, false, false, 8)
                },
                asked(Pid::In, true, false, 18),
                asked(Pid::Out, true, true, 0),
            ]
        );
        assert_eq!(host.pending_count(), 0);
    }

    #[test]
    fn string_descriptor_request_and_short_reply() {
        let host = host();
        let qh = control_queue(host);
        let device = bus(host, qh, vec![(0, 0), (30, 0), (0, 0)]);
        let read = host.get_descriptor(
            qh,
            DescriptorType::String,
            2,
            0x0409,
            BUFFER.region().truncated(40),
        );
        let seen = device.join().unwrap();

        assert_eq!(read, Ok(10));
        assert_eq!(
            seen[0].setup,
            Some([0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0x28, 0x00])
        );
        assert_eq!(seen[1], asked(Pid::In, true, false, 40));
    }

    #[test]
    fn requests_without_data_ack_with_in() {
        let host = host();
        let qh = control_queue(host);

        let device = bus(host, qh, vec![(0, 0), (0, 0)]);
        assert_eq!(host.set_address(qh, 5), Ok(()));
        let seen = device.join().unwrap();
        assert_eq!(
            seen,
            vec![
                Seen {
                    setup: Some([0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]),
                    ..asked(Pid::Setup, false, false, 8)
                },
                asked(Pid::In, true, true, 0),
            ]
        );

        let device = bus(host, qh, vec![(0, 0), (0, 0)]);
        assert_eq!(host.set_configuration(qh, 1), Ok(()));
        let seen = device.join().unwrap();
        assert_eq!(
            seen[0].setup,
            Some([0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00])
        );
        assert_eq!(
            host.set_address(qh, 128),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn stalled_setup_abandons_the_rest_of_the_request() {
        let host = host();
        let qh = control_queue(host);
        let device = bus(host, qh, vec![(8, ehci::token::STATUS_HALTED)]);
        let read = host.read_device_descriptor(qh, BUFFER.region());
        device.join().unwrap();

        assert_eq!(read, Err(Error::Stalled));
        assert_eq!(host.pending_count(), 0);
        assert!(!qh.overlay().is_halted());
        assert!(ehci::is_terminating(qh.overlay().next()));
        // Every qTD of the request went back to the pool.
        for _ in 0..TD_POOL_SIZE {
            host.transfer_schedule(qh, Pid::Out, false, DmaRegion::EMPTY, None)
                .unwrap();
        }
    }

    #[test]
    fn blocking_reads_report_bytes_and_errors() {
        let host = host();
        let qh = host
            .set_up_asynchronous_endpoint_queue(2, 1, Speed::Full, false, 64)
            .unwrap();

        let device = bus(host, qh, vec![(40, 0)]);
        let read = host.read_from_endpoint(qh, BUFFER.region().truncated(64));
        let seen = device.join().unwrap();
        assert_eq!(read, Ok(24));
        assert_eq!(seen, vec![asked(Pid::In, false, true, 64)]);

        let device = bus(
            host,
            qh,
            vec![(
                64,
                ehci::token::STATUS_HALTED | ehci::token::STATUS_TRANSACTION_ERROR,
            )],
        );
        let sent = host.send_on_endpoint(qh, BUFFER.region().truncated(64));
        device.join().unwrap();
        assert_eq!(sent, Err(Error::TransactionError));
        assert_eq!(host.pending_count(), 0);
    }

    #[test]
    fn control_request_needs_room_for_the_data() {
        let host = host();
        let qh = control_queue(host);
        let setup = SetupPacket::new(0x80, 0x06, 0x0100, 0, 18);
        assert_eq!(
            host.control_request(qh, &setup, BUFFER.region().truncated(8)),
            Err(Error::InvalidArgument)
        );
        assert_eq!(host.pending_count(), 0);
    }

    #[test]
    fn chain_that_cannot_fit_takes_nothing_from_the_pool() {
        let host = host();
        let qh = control_queue(host);
        for _ in 0..TD_POOL_SIZE - 2 {
            host.transfer_schedule(qh, Pid::Out, false, DmaRegion::EMPTY, None)
                .unwrap();
        }
        assert_eq!(
            host.read_device_descriptor(qh, BUFFER.region()),
            Err(Error::PoolExhausted)
        );
        assert_eq!(host.pending_count(), TD_POOL_SIZE - 2);
        for _ in 0..2 {
            host.transfer_schedule(qh, Pid::Out, false, DmaRegion::EMPTY, None)
                .unwrap();
        }
    }
}
