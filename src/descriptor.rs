// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB descriptors, and the table a device answers GET_DESCRIPTOR from.
//!
//! Descriptors are served straight out of the statics that define them: the
//! controller DMAs from wherever they live. So a `Descriptors` table holds
//! `'static` references, and everything in here that turns a descriptor into
//! bytes is `const`, so a complete table can be built at compile time.

use crate::types::{EndpointAddress, Speed, UsbTransferType};
use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes, Unaligned)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfiguration = 0x07,
}

impl DescriptorType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::from_u8(raw)
    }
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct DeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: DescriptorType,
    /// USB version in binary-coded decimal, `0x02_00` for a high-speed part.
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Packet size of endpoint 0. Also what endpoints without a descriptor
    /// of their own fall back to.
    pub max_packet_size0: u8,
    pub vendor: U16<LittleEndian>,
    pub product: U16<LittleEndian>,
    pub bcd_device: U16<LittleEndian>,
    /// Index of manufacturer name in string descriptor table.
    pub manufacturer_s: u8,
    /// Index of product name in string descriptor table.
    pub product_s: u8,
    /// Index of serial number in string descriptor table.
    pub serial_s: u8,
    pub num_configurations: u8,
}

/// What the device would look like at its other speed. Only high-speed
/// capable devices have one.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct DeviceQualifierDescriptor {
    /// Length of this structure, must be 10.
    pub length: u8,
    pub descriptor_type: DescriptorType,
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
    pub reserved: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct ConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// `Configuration`, or `OtherSpeedConfiguration`.
    pub descriptor_type: DescriptorType,
    /// Total length of all descriptors in this configuration, concatenated.
    pub total_length: U16<LittleEndian>,
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    pub configuration_s: u8,
    /// Bit 7 must be set; bit 6 means self-powered, bit 5 remote wakeup.
    pub attributes: u8,
    /// Maximum device power consumption in units of 2mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct InterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    pub descriptor_type: DescriptorType,
    pub interface_number: u8,
    pub alternate_setting: u8,
    /// Number of endpoint descriptors in this interface.
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_s: u8,
}

/// Describes an endpoint within an interface.
///
/// Unlike the others this is also parsed back out of configuration bytes, so
/// every field is a plain integer.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct EndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    /// Must be `DescriptorType::Endpoint`.
    pub descriptor_type: u8,
    /// Address of this endpoint, where the bottom 4 bits give the endpoint
    /// number (0..15) and the top bit distinguishes IN (1) from OUT (0).
    pub endpoint_address: u8,
    /// Endpoint attributes; the bottom 2 bits are a `UsbTransferType`.
    pub attributes: u8,
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval for interrupt and isochronous endpoints.
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::from_raw(self.endpoint_address)
    }

    pub fn transfer_type(&self) -> UsbTransferType {
        UsbTransferType::from_u8(self.attributes & 0b11).unwrap_or(UsbTransferType::Control)
    }

    /// Packet size, without the high-bandwidth multiplier bits.
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size.get() & 0x7FF
    }
}

/// Views a descriptor struct as the bytes the host will see.
pub const fn bytes_of<T: AsBytes>(descriptor: &'static T) -> &'static [u8] {
    // Safety: `AsBytes` types have no padding or other uninitialized bytes,
    // and the reference is valid for `'static`.
    unsafe {
        core::slice::from_raw_parts(
            descriptor as *const T as *const u8,
            core::mem::size_of::<T>(),
        )
    }
}

/// Builds a string descriptor from ASCII text: a two byte header followed by
/// the text as UTF-16LE. `N` must be `2 + 2 * text.len()`, which is checked
/// at compile time when used in a `static`.
pub const fn string_descriptor<const N: usize>(text: &str) -> [u8; N] {
    let text = text.as_bytes();
    assert!(N == 2 + 2 * text.len() && N <= 255);
    let mut out = [0u8; N];
    out[0] = N as u8;
    out[1] = DescriptorType::String as u8;
    let mut i = 0;
    while i < text.len() {
        out[2 + 2 * i] = text[i];
        i += 1;
    }
    out
}

/// The string descriptor at index zero, listing supported languages.
pub const LANGUAGE_ENGLISH_US: [u8; 4] = [4, DescriptorType::String as u8, 0x09, 0x04];

/// One configuration: the configuration descriptor and everything under it,
/// concatenated, for one bus speed.
#[derive(Copy, Clone, Debug)]
pub struct Configuration {
    pub number: u8,
    pub speed: Speed,
    pub descriptor: &'static [u8],
}

impl Configuration {
    /// Walks the configuration's descriptors looking for `address`.
    pub fn endpoint(&self, address: EndpointAddress) -> Option<EndpointDescriptor> {
        self.endpoints().find(|ep| ep.address() == address)
    }

    pub fn endpoints(&self) -> EndpointDescriptors {
        EndpointDescriptors {
            rest: self.descriptor,
        }
    }

    /// This configuration as seen at the other speed: the same bytes, with
    /// the type changed to OTHER_SPEED_CONFIGURATION. Writes into `out` and
    /// returns the used part.
    pub fn as_other_speed<'a>(&self, out: &'a mut [u8]) -> &'a [u8] {
        let n = self.descriptor.len().min(out.len());
        out[..n].copy_from_slice(&self.descriptor[..n]);
        if n > 1 {
            out[1] = DescriptorType::OtherSpeedConfiguration as u8;
        }
        &out[..n]
    }
}

/// Iterator over the endpoint descriptors in a configuration.
pub struct EndpointDescriptors {
    rest: &'static [u8],
}

impl Iterator for EndpointDescriptors {
    type Item = EndpointDescriptor;

    fn next(&mut self) -> Option<EndpointDescriptor> {
        loop {
            let length = usize::from(*self.rest.first()?);
            if length < 2 || length > self.rest.len() {
                // Malformed; stop rather than loop or overrun.
                self.rest = &[];
                return None;
            }
            let (this, rest) = self.rest.split_at(length);
            self.rest = rest;
            if this[1] != DescriptorType::Endpoint as u8 {
                continue;
            }
            if let Some(lv) = LayoutVerified::<_, EndpointDescriptor>::new_from_prefix(this)
                .map(|(lv, _)| lv)
            {
                return Some(*lv.into_ref());
            }
        }
    }
}

/// Everything a device tells the host about itself.
pub struct Descriptors {
    pub device: &'static DeviceDescriptor,
    pub qualifier: Option<&'static DeviceQualifierDescriptor>,
    /// Complete string descriptors, by index; index 0 is the language list.
    pub strings: &'static [&'static [u8]],
    pub configurations: &'static [Configuration],
}

impl Descriptors {
    pub fn device_bytes(&self) -> &'static [u8] {
        bytes_of(self.device)
    }

    pub fn qualifier_bytes(&self) -> Option<&'static [u8]> {
        self.qualifier.map(bytes_of)
    }

    pub fn string(&self, index: u8) -> Option<&'static [u8]> {
        self.strings.get(usize::from(index)).copied()
    }

    /// The configuration the host selects with SET_CONFIGURATION(`number`)
    /// while connected at `speed`.
    pub fn configuration(&self, number: u8, speed: Speed) -> Option<&'static Configuration> {
        let configurations: &'static [Configuration] = self.configurations;
        configurations
            .iter()
            .find(|c| c.number == number && c.speed == speed)
    }

    /// The `index`th configuration for `speed`, as GET_DESCRIPTOR counts
    /// them.
    pub fn configuration_by_index(&self, index: u8, speed: Speed) -> Option<&'static Configuration> {
        let configurations: &'static [Configuration] = self.configurations;
        configurations
            .iter()
            .filter(|c| c.speed == speed)
            .nth(usize::from(index))
    }

    pub fn max_packet_size0(&self) -> u16 {
        u16::from(self.device.max_packet_size0)
    }
}
