// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A controller in whichever role it was brought up in.

use crate::device::UsbDevice;
use crate::error::{Error, Result};
use crate::host::UsbHost;
use crate::registers::{ControllerId, Registers};

pub enum Peripheral<R> {
    Device(UsbDevice<R>),
    Host(UsbHost<R>),
}

impl<R: Registers + 'static> Peripheral<R> {
    pub fn controller(&self) -> ControllerId {
        match self {
            Peripheral::Device(d) => d.controller(),
            Peripheral::Host(h) => h.controller(),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Peripheral::Host(_))
    }

    pub fn as_device(&self) -> Result<&UsbDevice<R>> {
        match self {
            Peripheral::Device(d) => Ok(d),
            Peripheral::Host(_) => Err(Error::WrongMode),
        }
    }

    pub fn as_host(&self) -> Result<&UsbHost<R>> {
        match self {
            Peripheral::Host(h) => Ok(h),
            Peripheral::Device(_) => Err(Error::WrongMode),
        }
    }

    /// Routes the controller's interrupt to whichever driver owns it.
    pub fn handle_interrupt(&self) {
        match self {
            Peripheral::Device(d) => d.handle_interrupt(),
            Peripheral::Host(h) => h.handle_interrupt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::DESCRIPTORS;
    use crate::device::DeviceConfig;
    use crate::host::HostMemory;
    use crate::qh::QueueHeadList;
    use crate::registers::mock::MockRegisters;

    #[test]
    fn role_accessors() {
        let heads = Box::leak(Box::new(QueueHeadList::new()));
        let device = Peripheral::Device(UsbDevice::new(
            MockRegisters::new(),
            ControllerId::Usb0,
            heads,
            &DESCRIPTORS,
            DeviceConfig::new(),
        ));
        assert!(device.as_device().is_ok());
        assert_eq!(device.as_host().err(), Some(Error::WrongMode));
        assert!(!device.is_host());

        let memory = Box::leak(Box::new(HostMemory::new()));
        let host = Peripheral::Host(UsbHost::new(MockRegisters::new(), ControllerId::Usb1, memory));
        assert_eq!(host.as_device().err(), Some(Error::WrongMode));
        assert_eq!(host.controller(), ControllerId::Usb1);
        host.as_host().unwrap().init().unwrap();
        host.handle_interrupt();
    }
}
