// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control request dispatch.
//!
//! A control transfer arrives as a SETUP packet, then maybe a data stage,
//! then a status stage going the other way. The firmware points endpoint 0's
//! callbacks at `setup_complete` and the two `control_*_complete` functions
//! here (through small wrappers that name its `RequestHandlers`), and these
//! route each stage to the handler for the request's type. A handler that
//! doesn't recognize the request, or a missing handler, gets the endpoint
//! stalled, which is how USB 2.0 section 9.2.7 says to refuse a request.

use crate::device::UsbDevice;
use crate::endpoint::Endpoint;
use crate::registers::Registers;
use crate::types::{RequestKind, TransferStage, UsbDir};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Ok,
    Stall,
}

/// Handles one stage of a control request. Runs in interrupt context.
pub type RequestHandler<R> =
    fn(&UsbDevice<R>, &'static Endpoint<R>, TransferStage) -> RequestStatus;

/// Handlers by request type (bits 6:5 of bmRequestType).
pub struct RequestHandlers<R: 'static> {
    pub standard: Option<RequestHandler<R>>,
    pub class: Option<RequestHandler<R>>,
    pub vendor: Option<RequestHandler<R>>,
    pub reserved: Option<RequestHandler<R>>,
}

impl<R: Registers + 'static> RequestHandlers<R> {
    pub fn handler(&self, kind: RequestKind) -> Option<RequestHandler<R>> {
        match kind {
            RequestKind::Standard => self.standard,
            RequestKind::Class => self.class,
            RequestKind::Vendor => self.vendor,
            RequestKind::Reserved => self.reserved,
        }
    }

    /// Runs the handler for the request last seen on `endpoint`, stalling
    /// if there's none or it says no.
    pub fn dispatch(
        &self,
        device: &UsbDevice<R>,
        endpoint: &'static Endpoint<R>,
        stage: TransferStage,
    ) -> RequestStatus {
        let setup = endpoint.setup();
        let status = match self.handler(setup.kind()) {
            Some(handler) => handler(device, endpoint, stage),
            None => RequestStatus::Stall,
        };
        if status == RequestStatus::Stall {
            log::debug!(
                "stalling request {:#04x}/{:#04x} in {:?} stage",
                setup.request_type,
                setup.request,
                stage
            );
            if let Err(e) = device.endpoint_stall(endpoint.address()) {
                log::warn!("couldn't stall {:?}: {}", endpoint.address(), e);
            }
        }
        status
    }

    /// For endpoint 0 OUT's `setup_complete`.
    pub fn setup_complete(&self, device: &UsbDevice<R>, endpoint: &'static Endpoint<R>) {
        self.dispatch(device, endpoint, TransferStage::Setup);
    }

    /// For endpoint 0 OUT's `transfer_complete`. An OUT completing is the
    /// data stage of a host-to-device request, or the status stage of a
    /// device-to-host one.
    pub fn control_out_complete(&self, device: &UsbDevice<R>, endpoint: &'static Endpoint<R>) {
        let stage = match endpoint.setup().direction() {
            UsbDir::In => TransferStage::Status,
            UsbDir::Out => TransferStage::Data,
        };
        self.dispatch(device, endpoint, stage);
        if let Err(e) = device.complete_scan(endpoint.address()) {
            log::warn!("{:?}: {}", endpoint.address(), e);
        }
    }

    /// For endpoint 0 IN's `transfer_complete`; the mirror image of
    /// `control_out_complete`.
    pub fn control_in_complete(&self, device: &UsbDevice<R>, endpoint: &'static Endpoint<R>) {
        let stage = match endpoint.setup().direction() {
            UsbDir::In => TransferStage::Data,
            UsbDir::Out => TransferStage::Status,
        };
        self.dispatch(device, endpoint, stage);
        if let Err(e) = device.complete_scan(endpoint.address()) {
            log::warn!("{:?}: {}", endpoint.address(), e);
        }
    }
}
