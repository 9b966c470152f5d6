// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GreatFET USB core bring-up firmware.
//!
//! This is the smallest complete device built on `greatfet_usb`: it
//! enumerates, answers the standard requests and one vendor request, and
//! echoes whatever the host sends to the bulk OUT endpoint back out of the
//! bulk IN endpoint. It's meant as a smoke test for a board, and as a worked
//! example of wiring up the driver, which mostly consists of declaring the
//! right statics.
//!
//! Everything the controller touches by DMA is a `static` below: the queue
//! head table, the transfer pools, the descriptors, and the loopback buffer.
//! Nothing is allocated at runtime.
//!
//! Clocks are not configured here. The USB0 PLL and the base clock for
//! whichever controller is selected are expected to be running already,
//! which is the case when started from the GreatFET bootloader.
//!
//! The device is polled rather than interrupt driven: the main loop calls
//! `handle_interrupt` over and over. That's the same code the NVIC handler
//! would run, just without having to hand the device to an ISR.

#![no_std]
#![no_main]

use cortex_m_rt::entry;

use byteorder::LittleEndian;
use zerocopy::{AsBytes, Unaligned, U16};

use greatfet_usb::descriptor::{
    bytes_of, string_descriptor, Configuration, ConfigurationDescriptor, DescriptorType,
    Descriptors, DeviceDescriptor, DeviceQualifierDescriptor, EndpointDescriptor,
    InterfaceDescriptor, LANGUAGE_ENGLISH_US,
};
use greatfet_usb::qh::QueueHeadList;
use greatfet_usb::request::{RequestHandlers, RequestStatus};
use greatfet_usb::types::{EndpointAddress, Speed, TransferStage, UsbDir, EP0_IN, EP0_OUT};
use greatfet_usb::{
    standard, Completion, ControllerId, DeviceConfig, DmaBuffer, DmaRegion, Endpoint, Mmio,
    Transfer, TransferQueue, UsbDevice,
};

use panic_halt as _;

cfg_if::cfg_if! {
    if #[cfg(feature = "target-usb0")] {
        const CONTROLLER: ControllerId = ControllerId::Usb0;
        const PRODUCT_ID: u16 = 0x60E6;
    } else if #[cfg(feature = "target-usb1")] {
        const CONTROLLER: ControllerId = ControllerId::Usb1;
        const PRODUCT_ID: u16 = 0x60E7;
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

const VENDOR_ID: u16 = 0x1D50;

const BULK_IN: EndpointAddress = UsbDir::In.endpoint(1);
const BULK_OUT: EndpointAddress = UsbDir::Out.endpoint(2);

/// Vendor request returning `BOARD_ID`.
const REQUEST_READ_BOARD_ID: u8 = 0x00;
static BOARD_ID: [u8; 4] = 0x0000_0000_u32.to_le_bytes();

#[entry]
fn main() -> ! {
    enable_phy(CONTROLLER);

    if let Err(e) = bring_up() {
        panic!("USB bring-up failed: {}", e);
    }

    loop {
        DEVICE.handle_interrupt();
    }
}

fn bring_up() -> greatfet_usb::Result<()> {
    DEVICE.init();
    for queue in [&EP0_OUT_QUEUE, &EP0_IN_QUEUE, &BULK_OUT_QUEUE, &BULK_IN_QUEUE] {
        DEVICE.queue_init(queue)?;
    }
    DEVICE.set_configuration_changed_callback(Some(configuration_changed));
    DEVICE.endpoint_init(&EP0_OUT_ENDPOINT)?;
    DEVICE.endpoint_init(&EP0_IN_ENDPOINT)?;
    DEVICE.run();
    Ok(())
}

/// Powers up the transceiver. Neither PHY is on out of reset.
fn enable_phy(controller: ControllerId) {
    // CREG0 bit 5 powers down the USB0 PHY when set.
    const CREG0: *mut u32 = 0x4004_3004 as *mut u32;
    const USB0PHY: u32 = 1 << 5;
    // USB1 pad control: ESEA | EPWR, plus VBUS so that the controller sees
    // a session.
    const SFSUSB: *mut u32 = 0x4008_6C80 as *mut u32;
    const SFSUSB_DEVICE: u32 = (1 << 1) | (1 << 4) | (1 << 5);

    // Safety: both are fixed system control registers that nothing else in
    // this program touches.
    unsafe {
        match controller {
            ControllerId::Usb0 => {
                let creg0 = CREG0.read_volatile();
                CREG0.write_volatile(creg0 & !USB0PHY);
            }
            ControllerId::Usb1 => SFSUSB.write_volatile(SFSUSB_DEVICE),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// The device.

static DEVICE: UsbDevice<Mmio> = UsbDevice::new(
    // Safety: this is the only driver for the controller.
    unsafe { Mmio::for_controller(CONTROLLER) },
    CONTROLLER,
    &QUEUE_HEADS,
    &DESCRIPTORS,
    DeviceConfig::new(),
);

static QUEUE_HEADS: QueueHeadList = QueueHeadList::new();

static EP0_OUT_POOL: [Transfer; 4] = [Transfer::NEW; 4];
static EP0_IN_POOL: [Transfer; 4] = [Transfer::NEW; 4];
static BULK_OUT_POOL: [Transfer; 2] = [Transfer::NEW; 2];
static BULK_IN_POOL: [Transfer; 2] = [Transfer::NEW; 2];

static EP0_OUT_QUEUE: TransferQueue = TransferQueue::new(EP0_OUT, &EP0_OUT_POOL);
static EP0_IN_QUEUE: TransferQueue = TransferQueue::new(EP0_IN, &EP0_IN_POOL);
static BULK_OUT_QUEUE: TransferQueue =
    TransferQueue::new(BULK_OUT, &BULK_OUT_POOL).with_error_hook(bulk_error);
static BULK_IN_QUEUE: TransferQueue =
    TransferQueue::new(BULK_IN, &BULK_IN_POOL).with_error_hook(bulk_error);

static EP0_OUT_ENDPOINT: Endpoint<Mmio> =
    Endpoint::new(EP0_OUT, Some(control_setup), Some(control_out_complete));
static EP0_IN_ENDPOINT: Endpoint<Mmio> = Endpoint::new(EP0_IN, None, Some(control_in_complete));
static BULK_OUT_ENDPOINT: Endpoint<Mmio> = Endpoint::new(BULK_OUT, None, Some(bulk_complete));
static BULK_IN_ENDPOINT: Endpoint<Mmio> = Endpoint::new(BULK_IN, None, Some(bulk_complete));

///////////////////////////////////////////////////////////////////////////////
// Control requests.

static HANDLERS: RequestHandlers<Mmio> = RequestHandlers {
    standard: Some(standard::handle::<Mmio>),
    class: None,
    vendor: Some(vendor_request),
    reserved: None,
};

fn control_setup(device: &UsbDevice<Mmio>, endpoint: &'static Endpoint<Mmio>) {
    HANDLERS.setup_complete(device, endpoint);
}

fn control_out_complete(device: &UsbDevice<Mmio>, endpoint: &'static Endpoint<Mmio>) {
    HANDLERS.control_out_complete(device, endpoint);
}

fn control_in_complete(device: &UsbDevice<Mmio>, endpoint: &'static Endpoint<Mmio>) {
    HANDLERS.control_in_complete(device, endpoint);
}

fn vendor_request(
    device: &UsbDevice<Mmio>,
    endpoint: &'static Endpoint<Mmio>,
    stage: TransferStage,
) -> RequestStatus {
    let setup = endpoint.setup();
    if setup.request != REQUEST_READ_BOARD_ID || setup.direction() != UsbDir::In {
        return RequestStatus::Stall;
    }
    if stage != TransferStage::Setup {
        return RequestStatus::Ok;
    }
    let length = usize::from(setup.length.get()).min(BOARD_ID.len());
    let data = DmaRegion::from_static(&BOARD_ID).truncated(length);
    match device
        .schedule_block(EP0_IN, data, None)
        .and_then(|_| device.schedule_ack(EP0_OUT))
    {
        Ok(()) => RequestStatus::Ok,
        Err(_) => RequestStatus::Stall,
    }
}

///////////////////////////////////////////////////////////////////////////////
// Bulk loopback.
//
// One buffer, used in turns: a packet comes in on BULK_OUT, the same bytes
// go back out on BULK_IN, and when that's done the OUT is rearmed. So the
// host has to read each echo before sending the next packet.

static LOOPBACK: DmaBuffer<512> = DmaBuffer::new();

fn configuration_changed(device: &UsbDevice<Mmio>) {
    if device.configuration().is_none() {
        for endpoint in [BULK_OUT, BULK_IN] {
            if let Err(e) = device.endpoint_disable(endpoint) {
                log::warn!("couldn't disable {:?}: {}", endpoint, e);
            }
        }
        return;
    }

    let armed = device
        .endpoint_init(&BULK_OUT_ENDPOINT)
        .and_then(|_| device.endpoint_init(&BULK_IN_ENDPOINT))
        .and_then(|_| receive(device));
    if let Err(e) = armed {
        log::error!("loopback setup failed: {}", e);
    }
}

fn receive(device: &UsbDevice<Mmio>) -> greatfet_usb::Result<()> {
    device.schedule(BULK_OUT, LOOPBACK.region(), Some(Completion::new(received, 0)))
}

fn received(_: usize, length: u32) {
    let echo = LOOPBACK.region().truncated(length as usize);
    if let Err(e) = DEVICE.schedule(BULK_IN, echo, Some(Completion::new(echoed, 0))) {
        log::warn!("echo of {} bytes failed: {}", length, e);
    }
}

fn echoed(_: usize, _: u32) {
    if let Err(e) = receive(&DEVICE) {
        log::warn!("rearming loopback failed: {}", e);
    }
}

fn bulk_complete(device: &UsbDevice<Mmio>, endpoint: &'static Endpoint<Mmio>) {
    if let Err(e) = device.complete_scan(endpoint.address()) {
        log::warn!("{:?}: {}", endpoint.address(), e);
    }
}

fn bulk_error(error: greatfet_usb::queue::TransferError) {
    log::error!("loopback transfer failed: {:?}", error);
}

///////////////////////////////////////////////////////////////////////////////
// Descriptors.

const fn u16le(v: u16) -> U16<LittleEndian> {
    U16::from_bytes(v.to_le_bytes())
}

static DEVICE_DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    length: 18,
    descriptor_type: DescriptorType::Device,
    bcd_usb: u16le(0x0200),
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: 64,
    vendor: u16le(VENDOR_ID),
    product: u16le(PRODUCT_ID),
    bcd_device: u16le(0x0100),
    manufacturer_s: 1,
    product_s: 2,
    serial_s: 0,
    num_configurations: 1,
};

static QUALIFIER: DeviceQualifierDescriptor = DeviceQualifierDescriptor {
    length: 10,
    descriptor_type: DescriptorType::DeviceQualifier,
    bcd_usb: u16le(0x0200),
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: 64,
    num_configurations: 1,
    reserved: 0,
};

/// The one configuration: a vendor-specific interface with the two bulk
/// endpoints.
#[derive(AsBytes, Unaligned)]
#[repr(C)]
struct LoopbackConfiguration {
    config: ConfigurationDescriptor,
    interface: InterfaceDescriptor,
    bulk_in: EndpointDescriptor,
    bulk_out: EndpointDescriptor,
}

const fn loopback_configuration(max_packet_size: u16) -> LoopbackConfiguration {
    const fn bulk(address: EndpointAddress, max_packet_size: u16) -> EndpointDescriptor {
        EndpointDescriptor {
            length: 7,
            descriptor_type: DescriptorType::Endpoint as u8,
            endpoint_address: address.raw(),
            attributes: 2, // bulk
            max_packet_size: u16le(max_packet_size),
            interval: 0,
        }
    }

    LoopbackConfiguration {
        config: ConfigurationDescriptor {
            length: 9,
            descriptor_type: DescriptorType::Configuration,
            total_length: u16le(core::mem::size_of::<LoopbackConfiguration>() as u16),
            num_interfaces: 1,
            configuration_value: 1,
            configuration_s: 0,
            attributes: 0x80, // bus powered
            max_power: 250,   // 500mA
        },
        interface: InterfaceDescriptor {
            length: 9,
            descriptor_type: DescriptorType::Interface,
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 2,
            interface_class: 0xFF,
            interface_subclass: 0xFF,
            interface_protocol: 0xFF,
            interface_s: 0,
        },
        bulk_in: bulk(BULK_IN, max_packet_size),
        bulk_out: bulk(BULK_OUT, max_packet_size),
    }
}

static HS_CONFIGURATION: LoopbackConfiguration = loopback_configuration(512);
static FS_CONFIGURATION: LoopbackConfiguration = loopback_configuration(64);

static MANUFACTURER: [u8; 40] = string_descriptor("Great Scott Gadgets");
static PRODUCT: [u8; 18] = string_descriptor("GreatFET");

static DESCRIPTORS: Descriptors = Descriptors {
    device: &DEVICE_DESCRIPTOR,
    qualifier: Some(&QUALIFIER),
    strings: &[&LANGUAGE_ENGLISH_US, &MANUFACTURER, &PRODUCT],
    configurations: &[
        Configuration {
            number: 1,
            speed: Speed::High,
            descriptor: bytes_of(&HS_CONFIGURATION),
        },
        Configuration {
            number: 1,
            speed: Speed::Full,
            descriptor: bytes_of(&FS_CONFIGURATION),
        },
    ],
};
