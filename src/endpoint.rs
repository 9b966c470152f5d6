// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software endpoints.
//!
//! An `Endpoint` is the driver's handle on one direction of one endpoint
//! number. Endpoints are statics, like the queues that feed them; the
//! controller learns about one when it's initialized with
//! `UsbDevice::endpoint_init`, which records it in the endpoint's queue head.
//! From then on the interrupt handler can get from a hardware event back to
//! the `Endpoint` and its callbacks, and the IN/OUT sibling of an endpoint
//! can be looked up through the device.

use crate::device::UsbDevice;
use crate::types::{EndpointAddress, SetupPacket};
use core::cell::Cell;
use critical_section::Mutex;

/// Runs in interrupt context when a SETUP packet lands on a control endpoint
/// (called on the OUT half), or when a transfer on the endpoint completes.
pub type EndpointCallback<R> = fn(&UsbDevice<R>, &'static Endpoint<R>);

pub struct Endpoint<R: 'static> {
    address: EndpointAddress,
    setup: Mutex<Cell<[u8; 8]>>,
    setup_complete: Option<EndpointCallback<R>>,
    transfer_complete: Option<EndpointCallback<R>>,
}

impl<R: 'static> Endpoint<R> {
    pub const fn new(
        address: EndpointAddress,
        setup_complete: Option<EndpointCallback<R>>,
        transfer_complete: Option<EndpointCallback<R>>,
    ) -> Self {
        Self {
            address,
            setup: Mutex::new(Cell::new([0; 8])),
            setup_complete,
            transfer_complete,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    /// The last SETUP packet received on this endpoint's number. Both halves
    /// of a control endpoint get a copy.
    pub fn setup(&self) -> SetupPacket {
        let bytes = critical_section::with(|cs| self.setup.borrow(cs).get());
        SetupPacket::from_bytes(&bytes)
    }

    pub(crate) fn store_setup(&self, bytes: [u8; 8]) {
        critical_section::with(|cs| self.setup.borrow(cs).set(bytes));
    }

    pub fn setup_complete(&self) -> Option<EndpointCallback<R>> {
        self.setup_complete
    }

    pub fn transfer_complete(&self) -> Option<EndpointCallback<R>> {
        self.transfer_complete
    }

    /// What the queue head's reserved word holds for this endpoint.
    pub(crate) fn token(&'static self) -> usize {
        self as *const Self as usize
    }

    /// Safety: `token` must be zero or have come from `token` on an
    /// `Endpoint<R>` of this same `R`.
    pub(crate) unsafe fn from_token(token: usize) -> Option<&'static Self> {
        (token as *const Self).as_ref()
    }
}

impl<R: 'static> core::fmt::Debug for Endpoint<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .finish()
    }
}
