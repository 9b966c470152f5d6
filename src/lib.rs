// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB core for the LPC43xx, as used on GreatFET.
//!
//! The LPC43xx has two copies of a ChipIdea-derived USB controller: USB0,
//! with a high-speed PHY, and USB1, full-speed only. Either can be brought up
//! as a device (`UsbDevice`) or, via its EHCI-compatible side, as a host
//! (`UsbHost`).
//!
//! On the device side, each endpoint has a queue head in a 2 KiB aligned
//! table, and work is handed to the controller as chains of transfer
//! descriptors (dTDs). The driver keeps a `TransferQueue` per endpoint that
//! owns a fixed pool of dTDs; `UsbDevice::schedule` and friends take a slot,
//! link it onto the hardware chain, and the interrupt handler retires
//! finished slots in order and runs their completions. Control requests are
//! routed by `request::RequestHandlers`, with the chapter 9 requests answered
//! by `standard::handle`.
//!
//! On the host side, `UsbHost` maintains the asynchronous schedule: a ring of
//! EHCI queue heads, one per device endpoint, each with a FIFO of qTDs.
//!
//! Everything here is `no_std` and allocation free. Memory the controller
//! reads is supplied by the caller as `'static` data, usually statics in the
//! firmware. Register access goes through the `Registers` trait, so the
//! drivers can be exercised against a model of the controller in tests.
//!
//! Logging uses the `log` facade. Nothing is printed unless the firmware
//! installs a logger.

#![cfg_attr(not(test), no_std)]

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod ehci;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod peripheral;
pub mod pool;
pub mod qh;
pub mod queue;
pub mod registers;
pub mod request;
pub mod standard;
pub mod td;
pub mod types;

pub use buffer::{DmaBuffer, DmaRegion};
pub use device::{DeviceConfig, UsbDevice};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use host::{HostMemory, UsbHost};
pub use peripheral::Peripheral;
pub use queue::{Completion, Transfer, TransferQueue};
pub use registers::{ControllerId, Mmio, Registers};
