// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The standard requests of USB 2.0 chapter 9, enough to get enumerated and
//! configured. Install `handle` as the `standard` entry of the firmware's
//! `RequestHandlers`.
//!
//! All the work happens in the SETUP stage: a request with data queues the
//! data stage and the status stage back to back, and the later stages just
//! report success.

use crate::buffer::{DmaBuffer, DmaRegion};
use crate::descriptor::DescriptorType;
use crate::device::UsbDevice;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::registers::Registers;
use crate::request::RequestStatus;
use crate::types::{SetupPacket, Speed, StandardRequest, TransferStage, UsbDir};

/// GET_STATUS always answers "bus powered, no remote wakeup, not halted".
static STATUS: [u8; 2] = [0, 0];

/// Every possible GET_CONFIGURATION answer, so the reply can come straight
/// out of flash.
static CONFIGURATION_VALUES: [u8; 256] = {
    let mut values = [0; 256];
    let mut i = 0;
    while i < values.len() {
        values[i] = i as u8;
        i += 1;
    }
    values
};

/// Scratch for OTHER_SPEED_CONFIGURATION, which has to be rewritten on the
/// way out.
static OTHER_SPEED: DmaBuffer<512> = DmaBuffer::new();

pub fn handle<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &'static Endpoint<R>,
    stage: TransferStage,
) -> RequestStatus {
    if stage != TransferStage::Setup {
        return RequestStatus::Ok;
    }
    let setup = endpoint.setup();
    let result = match setup.standard_request() {
        Some(StandardRequest::GetStatus) => get_status(device, endpoint, &setup),
        Some(StandardRequest::SetAddress) => set_address(device, endpoint, &setup),
        Some(StandardRequest::GetDescriptor) => get_descriptor(device, endpoint, &setup),
        Some(StandardRequest::SetConfiguration) => set_configuration(device, endpoint, &setup),
        Some(StandardRequest::GetConfiguration) => get_configuration(device, endpoint, &setup),
        _ => return RequestStatus::Stall,
    };
    match result {
        Ok(status) => status,
        Err(e) => {
            log::warn!("standard request {:#04x} failed: {}", setup.request, e);
            RequestStatus::Stall
        }
    }
}

/// Sends `data` (cut down to what the host asked for) and then collects the
/// host's zero-length status packet.
fn respond<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &Endpoint<R>,
    setup: &SetupPacket,
    data: DmaRegion,
) -> Result<RequestStatus> {
    let number = endpoint.address().number();
    let data = data.truncated(usize::from(setup.length.get()));
    device.schedule_block(UsbDir::In.endpoint(number), data, None)?;
    device.schedule_ack(UsbDir::Out.endpoint(number))?;
    Ok(RequestStatus::Ok)
}

fn acknowledge<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &Endpoint<R>,
) -> Result<RequestStatus> {
    let number = endpoint.address().number();
    device.schedule_ack(UsbDir::In.endpoint(number))?;
    Ok(RequestStatus::Ok)
}

fn get_status<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &Endpoint<R>,
    setup: &SetupPacket,
) -> Result<RequestStatus> {
    respond(device, endpoint, setup, DmaRegion::from_static(&STATUS))
}

fn set_address<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &Endpoint<R>,
    setup: &SetupPacket,
) -> Result<RequestStatus> {
    // The new address can only apply after the status stage goes out from
    // the old one.
    device.set_address_deferred(setup.value_l());
    acknowledge(device, endpoint)
}

fn get_descriptor<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &Endpoint<R>,
    setup: &SetupPacket,
) -> Result<RequestStatus> {
    let descriptors = device.descriptors();
    let index = setup.value_l();
    let speed = device.speed();
    let bytes = match DescriptorType::from_raw(setup.value_h()) {
        Some(DescriptorType::Device) => Some(descriptors.device_bytes()),
        Some(DescriptorType::Configuration) => descriptors
            .configuration_by_index(index, speed)
            .map(|c| c.descriptor),
        Some(DescriptorType::String) => descriptors.string(index),
        Some(DescriptorType::DeviceQualifier) => descriptors.qualifier_bytes(),
        Some(DescriptorType::OtherSpeedConfiguration) => {
            let other = match speed {
                Speed::High => Speed::Full,
                _ => Speed::High,
            };
            if let Some(configuration) = descriptors.configuration_by_index(index, other) {
                // Safety: control transfers on endpoint 0 run one at a time,
                // and a new SETUP cancels whatever was in flight before this
                // runs, so nothing is reading the scratch buffer.
                let scratch = unsafe { OTHER_SPEED.as_mut() };
                let n = configuration.as_other_speed(scratch).len();
                return respond(device, endpoint, setup, OTHER_SPEED.region().truncated(n));
            }
            None
        }
        _ => None,
    };
    match bytes {
        Some(bytes) => respond(device, endpoint, setup, DmaRegion::from_static(bytes)),
        None => Ok(RequestStatus::Stall),
    }
}

fn set_configuration<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &Endpoint<R>,
    setup: &SetupPacket,
) -> Result<RequestStatus> {
    if device.set_configuration(setup.value_l()).is_err() {
        return Ok(RequestStatus::Stall);
    }
    acknowledge(device, endpoint)
}

fn get_configuration<R: Registers + 'static>(
    device: &UsbDevice<R>,
    endpoint: &Endpoint<R>,
    setup: &SetupPacket,
) -> Result<RequestStatus> {
    let n = usize::from(device.configuration_number());
    respond(
        device,
        endpoint,
        setup,
        DmaRegion::from_static(&CONFIGURATION_VALUES[n..n + 1]),
    )
}
