// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-mode driver for the LPC43xx USB controllers (UM10503 chapter 23).
//!
//! The controller walks per-endpoint chains of transfer descriptors on its
//! own; the driver's job is to build those chains, hand them over ("prime"),
//! and hear back about completions and SETUP packets. Each endpoint direction
//! moves through
//!
//! ```text
//! disabled -> idle -> priming -> active (hardware owns the dTD chain) -> idle
//! ```
//!
//! `endpoint_init` takes it from disabled to idle, scheduling a transfer on an
//! idle endpoint primes it, and completions bring it back once the chain
//! runs dry. Scheduling onto an active endpoint appends to the live chain,
//! which is where the add-dTD tripwire comes in; see `schedule_append`.
//!
//! Everything here is safe to call from both thread mode and the USB
//! interrupt. The driver itself never enables the interrupt; the firmware can
//! do that, or just call `handle_interrupt` from its main loop.

use crate::buffer::DmaRegion;
use crate::descriptor::{Configuration, Descriptors};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::qh::{QueueHead, QueueHeadList, QH_COUNT};
use crate::queue::{Completion, TransferQueue};
use crate::registers::{
    deviceaddr, endptctrl, otgsc, portsc1, usbcmd, usbintr, usbmode, usbsts, ControllerId, Reg,
    Registers,
};
use crate::td::{self, TransferDescriptor};
use crate::types::{EndpointAddress, SetupPacket, Speed, UsbDir, UsbTransferType};
use core::cell::Cell;
use core::hint::spin_loop;
use critical_section::Mutex;

/// Run-time knobs for the device driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Handle SET_ADDRESS in the interrupt handler: latch the address with
    /// USBADRA and acknowledge, without involving the request handlers.
    /// Turn this off to see SET_ADDRESS like any other request.
    pub auto_set_address: bool,
    /// Interrupt threshold control, in microframes. Zero interrupts
    /// immediately.
    pub interrupt_threshold: u8,
}

impl DeviceConfig {
    pub const fn new() -> Self {
        Self {
            auto_set_address: true,
            interrupt_threshold: 0,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How appending a descriptor to a live chain played out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A prime was still in progress, and will pick up the new descriptor.
    PickedUpByPrime,
    /// The endpoint was still running the chain, and will reach the new
    /// descriptor through the link.
    AlreadyLinked,
    /// The endpoint had already run off the end of the chain, so it was
    /// primed again starting at the new descriptor.
    Reprimed,
}

pub struct UsbDevice<R> {
    regs: R,
    controller: ControllerId,
    queue_heads: &'static QueueHeadList,
    descriptors: &'static Descriptors,
    config: DeviceConfig,
    queues: Mutex<Cell<[Option<&'static TransferQueue>; QH_COUNT]>>,
    configuration: Mutex<Cell<Option<&'static Configuration>>>,
    configuration_changed: Mutex<Cell<Option<fn(&UsbDevice<R>)>>>,
}

impl<R: Registers + 'static> UsbDevice<R> {
    pub const fn new(
        regs: R,
        controller: ControllerId,
        queue_heads: &'static QueueHeadList,
        descriptors: &'static Descriptors,
        config: DeviceConfig,
    ) -> Self {
        Self {
            regs,
            controller,
            queue_heads,
            descriptors,
            config,
            queues: Mutex::new(Cell::new([None; QH_COUNT])),
            configuration: Mutex::new(Cell::new(None)),
            configuration_changed: Mutex::new(Cell::new(None)),
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    pub fn descriptors(&self) -> &'static Descriptors {
        self.descriptors
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    ////////////////////////////////////////////////////////////////////////
    // Controller lifecycle.

    /// Resets the controller into device mode, points it at the queue head
    /// list, and enables the interrupts the driver handles. Doesn't connect
    /// to the bus; that's `run`.
    pub fn init(&self) {
        self.controller_reset();
        self.set_device_mode();

        self.regs.modify(Reg::UsbCmd, |v| {
            (v & !usbcmd::ITC_MASK)
                | (u32::from(self.config.interrupt_threshold) << usbcmd::ITC_SHIFT)
        });
        self.regs
            .write(Reg::EndpointListAddr, self.queue_heads.address() as u32);
        self.regs.write(
            Reg::UsbIntr,
            usbintr::UE | usbintr::UEE | usbintr::PCE | usbintr::URE | usbintr::SLE,
        );
        log::info!("{:?}: device controller initialized", self.controller);
    }

    /// Sets Run/Stop, attaching to the bus.
    pub fn run(&self) {
        self.regs.set_bits(Reg::UsbCmd, usbcmd::RS);
        log::info!("{:?}: running", self.controller);
    }

    pub fn stop(&self) {
        self.regs.clear_bits(Reg::UsbCmd, usbcmd::RS);
    }

    /// Detaches and resets the controller's internal state. Leaves the
    /// controller stopped.
    pub fn controller_reset(&self) {
        self.reset_all_endpoints();
        self.stop();
        // RST resets pipelines, timers and state machines; the effect on an
        // attached host is undefined, hence the detach above.
        self.regs.write(Reg::UsbCmd, usbcmd::RST);
        while self.regs.read(Reg::UsbCmd) & usbcmd::RST != 0 {
            spin_loop();
        }
    }

    fn set_device_mode(&self) {
        self.regs.write(Reg::UsbMode, usbmode::CM_DEVICE);
        if self.controller == ControllerId::Usb0 {
            // OTG termination pulls down USB_DM; VBUS discharges through the
            // resistor.
            self.regs.write(Reg::OtgSc, otgsc::OT | otgsc::VD);
        }
    }

    /// The speed negotiated with the host. USB1 only does full speed with
    /// its internal PHY.
    pub fn speed(&self) -> Speed {
        match self.controller {
            ControllerId::Usb0 => {
                match (self.regs.read(Reg::PortSc1) & portsc1::PSPD_MASK) >> portsc1::PSPD_SHIFT {
                    2 => Speed::High,
                    _ => Speed::Full,
                }
            }
            ControllerId::Usb1 => Speed::Full,
        }
    }

    pub fn set_address_immediate(&self, address: u8) {
        self.regs.write(Reg::DeviceAddr, deviceaddr::usbadr(address));
    }

    /// Sets the address to take effect once the next IN status stage on
    /// endpoint 0 has been acknowledged, as SET_ADDRESS requires.
    pub fn set_address_deferred(&self, address: u8) {
        self.regs
            .write(Reg::DeviceAddr, deviceaddr::usbadr(address) | deviceaddr::USBADRA);
    }

    /// Reads the pending, enabled status flags and clears exactly those, so
    /// that anything raised in between survives for next time.
    pub fn get_status(&self) -> u32 {
        let status = self.regs.read(Reg::UsbSts) & self.regs.read(Reg::UsbIntr);
        self.regs.write(Reg::UsbSts, status);
        status
    }

    pub fn endpoint_setup_status(&self) -> u32 {
        self.regs.read(Reg::EndptSetupStat)
    }

    pub fn clear_endpoint_setup_status(&self, bits: u32) {
        self.regs.write(Reg::EndptSetupStat, bits);
    }

    pub fn endpoint_complete_status(&self) -> u32 {
        self.regs.read(Reg::EndptComplete)
    }

    pub fn clear_endpoint_complete(&self, bits: u32) {
        self.regs.write(Reg::EndptComplete, bits);
    }

    pub fn endpoint_ready_status(&self) -> u32 {
        self.regs.read(Reg::EndptStat)
    }

    fn clear_pending_interrupts(&self, mask: u32) {
        self.regs.write(Reg::EndptNak, mask);
        self.regs
            .write(Reg::EndptSetupStat, self.regs.read(Reg::EndptSetupStat) & mask);
        self.regs
            .write(Reg::EndptComplete, self.regs.read(Reg::EndptComplete) & mask);
    }

    fn wait_for_priming(&self, mask: u32) {
        while self.regs.read(Reg::EndptPrime) & mask != 0 {
            spin_loop();
        }
    }

    /// Waits out any prime in progress, then flushes the endpoints in `mask`
    /// and waits for the flush to finish. A packet already on the wire still
    /// completes.
    fn flush_primed_endpoints(&self, mask: u32) {
        self.wait_for_priming(mask);
        self.regs.write(Reg::EndptFlush, mask);
        while self.regs.read(Reg::EndptFlush) & mask != 0 {
            spin_loop();
        }
    }

    fn disable_all_endpoints(&self) {
        for n in 0..self.controller.endpoint_count() {
            self.regs
                .clear_bits(Reg::EndptCtrl(n), endptctrl::RXE | endptctrl::TXE);
        }
    }

    fn reset_all_endpoints(&self) {
        self.disable_all_endpoints();
        self.regs.write(Reg::UsbSts, !0);
        self.clear_pending_interrupts(!0);
        self.flush_primed_endpoints(!0);
    }

    /// What USB 2.0 asks of a device on bus reset (UM10503 23.10.3):
    /// endpoints disabled and flushed, address 0, unconfigured. Anything that
    /// was queued is dropped without completing.
    pub fn bus_reset(&self) {
        self.reset_all_endpoints();
        let queues = critical_section::with(|cs| self.queues.borrow(cs).get());
        let dropped: usize = queues.iter().flatten().map(|q| q.flush()).sum();
        if dropped != 0 {
            log::warn!(
                "{:?}: bus reset dropped {} queued transfers",
                self.controller,
                dropped
            );
        }
        self.set_address_immediate(0);
        if let Err(e) = self.set_configuration(0) {
            log::warn!("{:?}: couldn't deconfigure on bus reset: {}", self.controller, e);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Configuration.

    pub fn configuration(&self) -> Option<&'static Configuration> {
        critical_section::with(|cs| self.configuration.borrow(cs).get())
    }

    pub fn configuration_number(&self) -> u8 {
        self.configuration().map_or(0, |c| c.number)
    }

    /// Called whenever the active configuration changes, including back to
    /// unconfigured on bus reset.
    pub fn set_configuration_changed_callback(&self, callback: Option<fn(&UsbDevice<R>)>) {
        critical_section::with(|cs| self.configuration_changed.borrow(cs).set(callback));
    }

    /// Selects configuration `number` at the current bus speed; 0 returns
    /// the device to the unconfigured state.
    pub fn set_configuration(&self, number: u8) -> Result<()> {
        let new = match number {
            0 => None,
            n => Some(
                self.descriptors
                    .configuration(n, self.speed())
                    .ok_or(Error::NoConfiguration)?,
            ),
        };
        let old = critical_section::with(|cs| self.configuration.borrow(cs).replace(new));
        let changed = match (old, new) {
            (Some(a), Some(b)) => !core::ptr::eq(a, b),
            (None, None) => false,
            _ => true,
        };
        if changed {
            log::debug!("{:?}: configuration {}", self.controller, number);
            let callback = critical_section::with(|cs| self.configuration_changed.borrow(cs).get());
            if let Some(callback) = callback {
                callback(self);
            }
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Endpoints.

    fn queue_head(&self, endpoint: EndpointAddress) -> Result<&'static QueueHead> {
        if endpoint.number() >= self.controller.endpoint_count() {
            return Err(Error::InvalidArgument);
        }
        let heads: &'static QueueHeadList = self.queue_heads;
        heads.get(endpoint).ok_or(Error::InvalidArgument)
    }

    /// The software endpoint initialized at `address`, if any.
    pub fn endpoint(&self, address: EndpointAddress) -> Option<&'static Endpoint<R>> {
        let qh = self.queue_head(address).ok()?;
        // Safety: the only non-zero values ever stored in a queue head's
        // owner word come from `Endpoint::<R>::token`, in `endpoint_init`,
        // and this device's `R` is fixed.
        unsafe { Endpoint::from_token(qh.owner()) }
    }

    /// The other direction of `endpoint`'s number, if it has been
    /// initialized.
    pub fn sibling(&self, endpoint: &Endpoint<R>) -> Option<&'static Endpoint<R>> {
        self.endpoint(endpoint.address().sibling())
    }

    /// Brings up an endpoint with packet size and type taken from the active
    /// configuration's endpoint descriptor, or, failing that, as a control
    /// endpoint with the device descriptor's EP0 packet size.
    pub fn endpoint_init(&self, endpoint: &'static Endpoint<R>) -> Result<()> {
        let descriptor = self
            .configuration()
            .and_then(|c| c.endpoint(endpoint.address()));
        let (max_packet_size, transfer_type) = match descriptor {
            Some(d) => (d.max_packet_size(), d.transfer_type()),
            None => (self.descriptors.max_packet_size0(), UsbTransferType::Control),
        };
        self.endpoint_init_without_descriptor(endpoint, max_packet_size, transfer_type)
    }

    pub fn endpoint_init_without_descriptor(
        &self,
        endpoint: &'static Endpoint<R>,
        max_packet_size: u16,
        transfer_type: UsbTransferType,
    ) -> Result<()> {
        let address = endpoint.address();
        let qh = self.queue_head(address)?;
        self.endpoint_flush(address)?;

        qh.configure(max_packet_size, transfer_type == UsbTransferType::Control);
        qh.set_owner(endpoint.token());

        self.endpoint_set_type(address.number(), transfer_type);
        self.endpoint_enable(address);
        log::debug!(
            "{:?}: {:?} up, {:?}, {} byte packets",
            self.controller,
            address,
            transfer_type,
            max_packet_size
        );
        Ok(())
    }

    /// Sets the type of both halves of an endpoint. UM10503 23.6.24 wants
    /// the unused half of an endpoint set to something other than control,
    /// so the pair always agrees.
    fn endpoint_set_type(&self, number: u8, transfer_type: UsbTransferType) {
        let t = transfer_type as u32;
        self.regs.modify(Reg::EndptCtrl(number), |v| {
            (v & !(endptctrl::TXT_MASK | endptctrl::RXT_MASK))
                | (t << endptctrl::TXT_SHIFT)
                | (t << endptctrl::RXT_SHIFT)
        });
    }

    fn endpoint_enable(&self, endpoint: EndpointAddress) {
        let bits = if endpoint.is_in() {
            endptctrl::TXE | endptctrl::TXR
        } else {
            endptctrl::RXE | endptctrl::RXR
        };
        self.regs.set_bits(Reg::EndptCtrl(endpoint.number()), bits);
    }

    /// Turns an endpoint direction off, dropping anything queued on it.
    /// Endpoint 0 is always enabled in hardware, so it can't be disabled.
    pub fn endpoint_disable(&self, endpoint: EndpointAddress) -> Result<()> {
        self.queue_head(endpoint)?;
        if endpoint.number() == 0 {
            return Err(Error::InvalidArgument);
        }
        let bit = if endpoint.is_in() {
            endptctrl::TXE
        } else {
            endptctrl::RXE
        };
        self.regs.clear_bits(Reg::EndptCtrl(endpoint.number()), bit);
        self.clear_pending_interrupts(endpoint.status_bit());
        self.endpoint_flush(endpoint)?;
        log::debug!("{:?}: {:?} disabled", self.controller, endpoint);
        Ok(())
    }

    /// Drops everything queued on an endpoint, in software and in hardware.
    pub fn endpoint_flush(&self, endpoint: EndpointAddress) -> Result<()> {
        self.queue_head(endpoint)?;
        if let Some(queue) = self.queue_for(endpoint) {
            queue.flush();
        }
        self.flush_primed_endpoints(endpoint.status_bit());
        Ok(())
    }

    /// Stalls an endpoint number. Stalls apply to both directions at once
    /// (UM10503 23.10.5.2); the hardware clears a control endpoint's stall on
    /// the next SETUP.
    pub fn endpoint_stall(&self, endpoint: EndpointAddress) -> Result<()> {
        self.queue_head(endpoint)?;
        self.regs.set_bits(
            Reg::EndptCtrl(endpoint.number()),
            endptctrl::RXS | endptctrl::TXS,
        );
        log::debug!("{:?}: {:?} stalled", self.controller, endpoint);
        Ok(())
    }

    /// Hands the chain starting at `first` to the hardware.
    pub fn endpoint_prime(&self, endpoint: EndpointAddress, first: &TransferDescriptor) -> Result<()> {
        let qh = self.queue_head(endpoint)?;
        qh.load(first.address());
        self.regs.write(Reg::EndptPrime, endpoint.status_bit());
        Ok(())
    }

    pub fn endpoint_is_priming(&self, endpoint: EndpointAddress) -> bool {
        self.regs.read(Reg::EndptPrime) & endpoint.status_bit() != 0
    }

    /// True while the endpoint has a primed descriptor chain it hasn't
    /// finished.
    pub fn endpoint_is_ready(&self, endpoint: EndpointAddress) -> bool {
        self.regs.read(Reg::EndptStat) & endpoint.status_bit() != 0
    }

    pub fn endpoint_is_complete(&self, endpoint: EndpointAddress) -> bool {
        self.regs.read(Reg::EndptComplete) & endpoint.status_bit() != 0
    }

    /// Primes an idle endpoint with a single descriptor. Waits first for the
    /// endpoint to stop being ready, since an aborted transaction can leave
    /// it that way for a moment.
    pub fn schedule_wait(&self, endpoint: EndpointAddress, td: &TransferDescriptor) -> Result<()> {
        self.queue_head(endpoint)?;
        while self.endpoint_is_ready(endpoint) {
            spin_loop();
        }
        td.terminate();
        self.endpoint_prime(endpoint, td)
    }

    /// Links `new` after `tail` on an endpoint that may be running, following
    /// the add-dTD tripwire procedure of UM10503 23.10.11.3.
    ///
    /// The hardware might be just finishing `tail` as we link. If a prime is
    /// in flight it will see the link. Otherwise we sample ENDPTSTAT under
    /// the ATDTW tripwire, which the hardware clears if it touches the queue
    /// head meanwhile; a sample taken with the tripwire intact tells us for
    /// sure whether the endpoint is still on the chain (and will follow the
    /// link) or has run off its end (and must be primed again from `new`).
    pub fn schedule_append(
        &self,
        endpoint: EndpointAddress,
        tail: &TransferDescriptor,
        new: &TransferDescriptor,
    ) -> Result<AppendOutcome> {
        self.queue_head(endpoint)?;
        tail.set_next(new);
        if self.endpoint_is_priming(endpoint) {
            return Ok(AppendOutcome::PickedUpByPrime);
        }

        let ready = loop {
            self.regs.set_bits(Reg::UsbCmd, usbcmd::ATDTW);
            let ready = self.endpoint_is_ready(endpoint);
            if self.regs.read(Reg::UsbCmd) & usbcmd::ATDTW != 0 {
                break ready;
            }
        };
        self.regs.clear_bits(Reg::UsbCmd, usbcmd::ATDTW);

        if ready {
            Ok(AppendOutcome::AlreadyLinked)
        } else {
            self.endpoint_prime(endpoint, new)?;
            Ok(AppendOutcome::Reprimed)
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Transfer queues.

    /// Attaches a transfer queue to its endpoint, and resets its pool. One
    /// queue per endpoint direction.
    pub fn queue_init(&self, queue: &'static TransferQueue) -> Result<()> {
        self.queue_head(queue.endpoint())?;
        let slot = queue.endpoint().queue_head_index();
        critical_section::with(|cs| {
            let cell = self.queues.borrow(cs);
            let mut queues = cell.get();
            if queues[slot].is_some() {
                return Err(Error::QueueAlreadyRegistered);
            }
            queue.reset()?;
            queues[slot] = Some(queue);
            cell.set(queues);
            Ok(())
        })
    }

    fn queue_for(&self, endpoint: EndpointAddress) -> Option<&'static TransferQueue> {
        let slot = endpoint.queue_head_index();
        critical_section::with(|cs| self.queues.borrow(cs).get().get(slot).copied().flatten())
    }

    pub fn queue(&self, endpoint: EndpointAddress) -> Result<&'static TransferQueue> {
        self.queue_head(endpoint)?;
        self.queue_for(endpoint).ok_or(Error::NoQueue)
    }

    /// Queues a transfer of `region` on `endpoint`, returning at once.
    /// `completion` runs from the interrupt handler when it finishes.
    /// Fails with `PoolExhausted` if every transfer slot is in flight.
    pub fn schedule(
        &self,
        endpoint: EndpointAddress,
        region: DmaRegion,
        completion: Option<Completion>,
    ) -> Result<()> {
        let result = self.try_schedule(endpoint, region, completion);
        if result == Err(Error::PoolExhausted) {
            log::warn!("{:?}: {:?} transfer pool exhausted", self.controller, endpoint);
        }
        result
    }

    /// Like `schedule`, but spins until a transfer slot frees up.
    ///
    /// There's no timeout. Pools are expected to be sized so that slots
    /// always come back; if one can't (say, it's waiting on completions that
    /// only this context would process) this never returns.
    pub fn schedule_block(
        &self,
        endpoint: EndpointAddress,
        region: DmaRegion,
        completion: Option<Completion>,
    ) -> Result<()> {
        loop {
            match self.try_schedule(endpoint, region, completion) {
                Err(Error::PoolExhausted) => spin_loop(),
                other => return other,
            }
        }
    }

    /// Queues a zero-length packet, typically a control status stage.
    pub fn schedule_ack(&self, endpoint: EndpointAddress) -> Result<()> {
        self.schedule_block(endpoint, DmaRegion::EMPTY, None)
    }

    fn try_schedule(
        &self,
        endpoint: EndpointAddress,
        region: DmaRegion,
        completion: Option<Completion>,
    ) -> Result<()> {
        self.queue_head(endpoint)?;
        if region.len() > td::MAX_TOTAL_BYTES as usize
            || !td::fits_in_pages(region.addr(), region.len() as u32)
            || (!endpoint.is_in() && !region.is_empty() && !region.is_writable())
        {
            return Err(Error::InvalidArgument);
        }
        let queue = self.queue(endpoint)?;
        let transfer = queue.allocate().ok_or(Error::PoolExhausted)?;
        transfer.prepare(region, completion);

        critical_section::with(|cs| match queue.enqueue_active(cs, transfer)? {
            None => self.schedule_wait(endpoint, transfer.td()),
            Some(tail) => {
                let outcome = self.schedule_append(endpoint, tail.td(), transfer.td())?;
                log::trace!("{:?}: append {:?}", endpoint, outcome);
                Ok(())
            }
        })
    }

    /// Retires finished transfers on `endpoint`, running their completions.
    /// Meant to be called from the endpoint's `transfer_complete` callback.
    ///
    /// If the hardware reports a descriptor as halted or failed, the
    /// endpoint stops: everything queued on it is dropped, the hardware side
    /// is flushed, and the queue's error hook hears about it. Transfers
    /// behind the failed one never complete.
    pub fn complete_scan(&self, endpoint: EndpointAddress) -> Result<usize> {
        let queue = self.queue(endpoint)?;
        match queue.complete_scan() {
            Ok(n) => Ok(n),
            Err(e) => {
                log::error!(
                    "{:?}: transfer on {:?} failed, status {:#04x}",
                    self.controller,
                    e.endpoint,
                    e.status.0
                );
                self.flush_primed_endpoints(endpoint.status_bit());
                queue.report(e);
                Ok(0)
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Interrupt handling.

    /// The body of the USB interrupt handler. Also fine to call by polling.
    pub fn handle_interrupt(&self) {
        let status = self.get_status();
        if status == 0 {
            return;
        }

        if status & usbsts::UI != 0 {
            // A dTD with IOC completed, a short packet arrived, or a SETUP
            // did.
            self.check_for_setup_events();
            self.check_for_transfer_events();
        }
        if status & usbsts::PCI != 0 {
            log::debug!("{:?}: port change, {:?} speed", self.controller, self.speed());
        }
        if status & usbsts::SLI != 0 {
            log::debug!("{:?}: suspended", self.controller);
        }
        if status & usbsts::URI != 0 {
            log::info!("{:?}: bus reset", self.controller);
            self.bus_reset();
        }
        if status & usbsts::UEI != 0 {
            log::warn!("{:?}: transaction error", self.controller);
        }
    }

    fn check_for_setup_events(&self) {
        let pending = self.endpoint_setup_status();
        if pending == 0 {
            return;
        }
        for n in 0..self.controller.endpoint_count() {
            let bit = 1 << n;
            if pending & bit == 0 {
                continue;
            }
            let out = UsbDir::Out.endpoint(n);
            let Ok(qh) = self.queue_head(out) else {
                continue;
            };
            let bytes = self.read_setup(qh, bit);
            let Some(endpoint) = self.endpoint(out) else {
                continue;
            };
            endpoint.store_setup(bytes);
            if let Some(sibling) = self.sibling(endpoint) {
                sibling.store_setup(bytes);
            }

            let setup = SetupPacket::from_bytes(&bytes);
            if self.config.auto_set_address && setup.is_set_address() {
                log::debug!("{:?}: address {}", self.controller, setup.value_l());
                self.set_address_deferred(setup.value_l());
                if let Err(e) = self.schedule_ack(out.sibling()) {
                    log::warn!("{:?}: couldn't acknowledge SET_ADDRESS: {}", self.controller, e);
                }
                continue;
            }
            if let Some(callback) = endpoint.setup_complete() {
                callback(self, endpoint);
            }
        }
    }

    /// Copies a SETUP packet out of a queue head under the setup tripwire
    /// (UM10503 23.10.8.2.1): if another SETUP lands mid-copy the hardware
    /// clears SUTW, and we copy again.
    fn read_setup(&self, qh: &QueueHead, bit: u32) -> [u8; 8] {
        self.clear_endpoint_setup_status(bit);
        let bytes = loop {
            self.regs.set_bits(Reg::UsbCmd, usbcmd::SUTW);
            let bytes = qh.setup_buffer();
            if self.regs.read(Reg::UsbCmd) & usbcmd::SUTW != 0 {
                break bytes;
            }
        };
        self.regs.clear_bits(Reg::UsbCmd, usbcmd::SUTW);
        bytes
    }

    fn check_for_transfer_events(&self) {
        let pending = self.endpoint_complete_status();
        if pending == 0 {
            return;
        }
        for n in 0..self.controller.endpoint_count() {
            for dir in [UsbDir::Out, UsbDir::In] {
                let address = dir.endpoint(n);
                let bit = address.status_bit();
                if pending & bit == 0 {
                    continue;
                }
                self.clear_endpoint_complete(bit);
                if let Some(endpoint) = self.endpoint(address) {
                    if let Some(callback) = endpoint.transfer_complete() {
                        callback(self, endpoint);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the driver tests: a device on a mock register
    //! file, and a stand-in for the controller's DMA engine.

    use super::*;
    use crate::descriptor::tests::DESCRIPTORS;
    use crate::queue::Transfer;
    use crate::registers::mock::MockRegisters;
    use crate::td::token;
    use crate::types::{EP0_IN, EP0_OUT};

    pub(crate) type MockDevice = UsbDevice<MockRegisters>;

    pub(crate) fn device(config: DeviceConfig) -> &'static MockDevice {
        let heads = Box::leak(Box::new(QueueHeadList::new()));
        let device = Box::leak(Box::new(UsbDevice::new(
            MockRegisters::new(),
            ControllerId::Usb0,
            heads,
            &DESCRIPTORS,
            config,
        )));
        device.init();
        device
    }

    pub(crate) fn queue(device: &MockDevice, endpoint: EndpointAddress, slots: usize) -> &'static TransferQueue {
        let pool: &'static [Transfer] =
            Box::leak((0..slots).map(|_| Transfer::NEW).collect::<Vec<_>>().into_boxed_slice());
        let queue = Box::leak(Box::new(TransferQueue::new(endpoint, pool)));
        device.queue_init(queue).unwrap();
        queue
    }

    pub(crate) fn endpoint(
        address: EndpointAddress,
        setup_complete: Option<crate::endpoint::EndpointCallback<MockRegisters>>,
        transfer_complete: Option<crate::endpoint::EndpointCallback<MockRegisters>>,
    ) -> &'static Endpoint<MockRegisters> {
        Box::leak(Box::new(Endpoint::new(address, setup_complete, transfer_complete)))
    }

    /// Sets up both halves of endpoint 0 with queues, as firmware would.
    pub(crate) fn control_pair(
        device: &MockDevice,
        setup_complete: Option<crate::endpoint::EndpointCallback<MockRegisters>>,
        transfer_complete: Option<crate::endpoint::EndpointCallback<MockRegisters>>,
    ) -> (&'static Endpoint<MockRegisters>, &'static Endpoint<MockRegisters>) {
        let out = endpoint(EP0_OUT, setup_complete, transfer_complete);
        let in_ = endpoint(EP0_IN, None, transfer_complete);
        queue(device, EP0_OUT, 4);
        queue(device, EP0_IN, 4);
        device.endpoint_init(out).unwrap();
        device.endpoint_init(in_).unwrap();
        (out, in_)
    }

    /// Stands in for the DMA engine: finishes the first active descriptor on
    /// `endpoint`'s chain with `remaining` bytes left over, advances the
    /// overlay, and raises the completion interrupt. Returns false if there
    /// was nothing to do.
    pub(crate) fn retire(device: &MockDevice, endpoint: EndpointAddress, remaining: u32) -> bool {
        retire_with(device, endpoint, remaining, 0)
    }

    pub(crate) fn retire_with(
        device: &MockDevice,
        endpoint: EndpointAddress,
        remaining: u32,
        status: u32,
    ) -> bool {
        let qh = device.queue_heads.get(endpoint).unwrap();
        let regs = device.registers();
        let mut link = qh.next_dtd();
        while link & td::TERMINATE == 0 {
            // Safety: the driver only ever links descriptors from leaked
            // pools, which outlive the test.
            let td = unsafe { &*(link as *const TransferDescriptor) };
            if td.status().is_active() {
                let kept = td.token() & !(token::STATUS_MASK | token::TOTAL_BYTES_MASK);
                td.set_token(kept | token::total_bytes(remaining) | status);
                qh.advance(link, td.next());
                if td.is_terminated() || status != 0 {
                    regs.lower(Reg::EndptStat, endpoint.status_bit());
                }
                regs.raise(Reg::EndptComplete, endpoint.status_bit());
                regs.raise(Reg::UsbSts, usbsts::UI);
                return true;
            }
            link = td.next();
        }
        false
    }

    /// Stands in for the host sending a SETUP packet to endpoint 0.
    pub(crate) fn receive_setup(device: &MockDevice, bytes: [u8; 8]) {
        device.queue_heads.get(EP0_OUT).unwrap().receive_setup(bytes);
        device.registers().raise(Reg::EndptSetupStat, 1);
        device.registers().raise(Reg::UsbSts, usbsts::UI);
    }
}
