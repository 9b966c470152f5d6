// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB protocol vocabulary: directions, endpoint addresses, SETUP packets,
//! request codes, transfer types and speeds.
//!
//! None of this is specific to the LPC43xx; it's the USB 2.0 spec, chapter 9,
//! written down as Rust types.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 byte, and IN by an `0x80` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> EndpointAddress {
        EndpointAddress(num & 0xF | self as u8)
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// An endpoint address as it appears on the wire: the endpoint number in the
/// bottom four bits, the direction in bit 7.
///
/// Whether the number actually exists on a given controller is checked by the
/// controller driver, not here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress(u8);

pub const EP0_OUT: EndpointAddress = UsbDir::Out.endpoint(0);
pub const EP0_IN: EndpointAddress = UsbDir::In.endpoint(0);

impl EndpointAddress {
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw & 0x8F)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn number(self) -> u8 {
        self.0 & 0xF
    }

    pub const fn direction(self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.0)
    }

    pub const fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// The endpoint with the same number and the opposite direction.
    pub const fn sibling(self) -> Self {
        Self(self.0 ^ 0x80)
    }

    /// Position of this endpoint's queue head in the controller's endpoint
    /// list. OUT and IN alternate: EP0 OUT, EP0 IN, EP1 OUT, ...
    pub const fn queue_head_index(self) -> usize {
        (self.number() as usize) * 2 + ((self.0 >> 7) & 1) as usize
    }

    /// Bit position of this endpoint in the ENDPTPRIME / ENDPTFLUSH /
    /// ENDPTSTAT / ENDPTCOMPLETE registers: OUT endpoints occupy the low half,
    /// IN endpoints the high half.
    pub const fn status_bit(self) -> u32 {
        if self.is_in() {
            1 << (16 + self.number())
        } else {
            1 << self.number()
        }
    }
}

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Request type: direction in bit 7, kind (standard / class / vendor) in
    /// bits 6:5, recipient in the low bits.
    pub request_type: u8,
    /// Request. Standard setup requests are in the `StandardRequest` enum.
    /// Classes and vendors can extend this as long as they use their own
    /// request type.
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// A second argument, usually an interface or endpoint index.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

/// Fields of `SetupPacket::request_type`, to be or'd together.
pub mod request_type {
    pub const HOST_TO_DEVICE: u8 = 0x00;
    pub const DEVICE_TO_HOST: u8 = 0x80;
    pub const STANDARD: u8 = 0 << 5;
    pub const CLASS: u8 = 1 << 5;
    pub const VENDOR: u8 = 2 << 5;
    pub const RECIPIENT_DEVICE: u8 = 0;
    pub const RECIPIENT_INTERFACE: u8 = 1;
    pub const RECIPIENT_ENDPOINT: u8 = 2;
}

impl SetupPacket {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(length),
        }
    }

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        // An 8-byte, alignment-1 buffer always fits an 8-byte, alignment-1
        // struct, so this can't actually fall through to the default.
        LayoutVerified::<_, SetupPacket>::new(&bytes[..])
            .map(|lv| *lv.into_ref())
            .unwrap_or_default()
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn standard_request(&self) -> Option<StandardRequest> {
        StandardRequest::from_u8(self.request)
    }

    pub fn value_l(&self) -> u8 {
        self.value.get() as u8
    }

    pub fn value_h(&self) -> u8 {
        (self.value.get() >> 8) as u8
    }

    /// True for a standard, device-recipient, host-to-device SET_ADDRESS.
    pub fn is_set_address(&self) -> bool {
        self.request_type == 0x00 && self.standard_request() == Some(StandardRequest::SetAddress)
    }
}

/// Bits 6:5 of `request_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// The standard requests of USB 2.0 table 9-4.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

/// Types of transfer that can be indicated by the `attributes` field of an
/// endpoint descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

/// The phases of a control transfer, as seen by a request handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStage {
    Setup,
    Data,
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_head_index_interleaves_directions() {
        assert_eq!(EP0_OUT.queue_head_index(), 0);
        assert_eq!(EP0_IN.queue_head_index(), 1);
        assert_eq!(EndpointAddress::from_raw(0x83).queue_head_index(), 7);
        assert_eq!(EndpointAddress::from_raw(0x05).queue_head_index(), 10);
    }

    #[test]
    fn status_bits_split_at_sixteen() {
        assert_eq!(EndpointAddress::from_raw(0x02).status_bit(), 1 << 2);
        assert_eq!(EndpointAddress::from_raw(0x82).status_bit(), 1 << 18);
    }

    #[test]
    fn setup_packet_decodes_set_address() {
        let setup = SetupPacket::from_bytes(&[0x00, 0x05, 0x07, 0x00, 0, 0, 0, 0]);
        assert!(setup.is_set_address());
        assert_eq!(setup.value_l(), 7);
        assert_eq!(setup.kind(), RequestKind::Standard);
        assert_eq!(setup.direction(), UsbDir::Out);
    }

    #[test]
    fn setup_packet_decodes_vendor_in() {
        let setup = SetupPacket::from_bytes(&[0xC0, 0x65, 0x34, 0x12, 0x01, 0x00, 0x40, 0x00]);
        assert_eq!(setup.kind(), RequestKind::Vendor);
        assert_eq!(setup.direction(), UsbDir::In);
        assert_eq!(setup.value.get(), 0x1234);
        assert_eq!(setup.value_h(), 0x12);
        assert_eq!(setup.index.get(), 1);
        assert_eq!(setup.length.get(), 64);
        assert_eq!(setup.standard_request(), None);
    }

    #[test]
    fn built_setup_packet_is_little_endian_on_the_wire() {
        let setup = SetupPacket::new(
            request_type::DEVICE_TO_HOST | request_type::STANDARD | request_type::RECIPIENT_DEVICE,
            StandardRequest::GetDescriptor as u8,
            0x0302,
            0x0409,
            255,
        );
        assert_eq!(setup.as_bytes(), &[0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xFF, 0x00]);
        assert_eq!(setup.direction(), UsbDir::In);
    }
}
