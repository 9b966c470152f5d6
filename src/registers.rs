// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The LPC43xx USB controller register file.
//!
//! Both controllers share one register layout (UM10503 chapters 23 and 24);
//! they differ only in base address and in how many endpoints they implement.
//! Several registers have different names in device and host mode but live at
//! the same offset, e.g. DEVICEADDR / PERIODICLISTBASE. Both names are listed
//! here and resolve to the same offset.
//!
//! Drivers never poke addresses directly. They go through the `Registers`
//! trait, which is implemented by `Mmio` for the real silicon, and by a
//! software model of the controller in tests.

/// Which of the two USB controllers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerId {
    /// The high-speed OTG controller with the on-chip HS PHY.
    Usb0,
    /// The second controller, full speed only without an external ULPI PHY.
    Usb1,
}

impl ControllerId {
    pub const fn base_address(self) -> usize {
        match self {
            ControllerId::Usb0 => 0x4000_6000,
            ControllerId::Usb1 => 0x4000_7000,
        }
    }

    /// Number of endpoint pairs the controller implements, including EP0.
    pub const fn endpoint_count(self) -> u8 {
        match self {
            ControllerId::Usb0 => 6,
            ControllerId::Usb1 => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    UsbCmd,
    UsbSts,
    UsbIntr,
    FrIndex,
    /// Device mode.
    DeviceAddr,
    /// Host mode, same offset as `DeviceAddr`.
    PeriodicListBase,
    /// Device mode.
    EndpointListAddr,
    /// Host mode, same offset as `EndpointListAddr`.
    AsyncListAddr,
    EndptNak,
    EndptNakEn,
    PortSc1,
    OtgSc,
    UsbMode,
    EndptSetupStat,
    EndptPrime,
    EndptFlush,
    EndptStat,
    EndptComplete,
    EndptCtrl(u8),
}

impl Reg {
    pub const fn offset(self) -> usize {
        match self {
            Reg::UsbCmd => 0x140,
            Reg::UsbSts => 0x144,
            Reg::UsbIntr => 0x148,
            Reg::FrIndex => 0x14C,
            Reg::DeviceAddr | Reg::PeriodicListBase => 0x154,
            Reg::EndpointListAddr | Reg::AsyncListAddr => 0x158,
            Reg::EndptNak => 0x178,
            Reg::EndptNakEn => 0x17C,
            Reg::PortSc1 => 0x184,
            Reg::OtgSc => 0x1A4,
            Reg::UsbMode => 0x1A8,
            Reg::EndptSetupStat => 0x1AC,
            Reg::EndptPrime => 0x1B0,
            Reg::EndptFlush => 0x1B4,
            Reg::EndptStat => 0x1B8,
            Reg::EndptComplete => 0x1BC,
            Reg::EndptCtrl(n) => 0x1C0 + 4 * (n as usize & 0xF),
        }
    }
}

pub mod usbcmd {
    pub const RS: u32 = 1 << 0;
    pub const RST: u32 = 1 << 1;
    /// Host: frame list size, bits 0 and 1 of the three-bit code.
    pub const FS0: u32 = 1 << 2;
    pub const FS1: u32 = 1 << 3;
    /// Host: periodic schedule enable.
    pub const PSE: u32 = 1 << 4;
    /// Host: asynchronous schedule enable.
    pub const ASE: u32 = 1 << 5;
    /// Device: setup tripwire.
    pub const SUTW: u32 = 1 << 13;
    /// Device: add dTD tripwire.
    pub const ATDTW: u32 = 1 << 14;
    /// Host: frame list size, bit 2 of the three-bit code.
    pub const FS2: u32 = 1 << 15;
    pub const ITC_SHIFT: u32 = 16;
    pub const ITC_MASK: u32 = 0xFF << ITC_SHIFT;
}

pub mod usbsts {
    pub const UI: u32 = 1 << 0;
    pub const UEI: u32 = 1 << 1;
    pub const PCI: u32 = 1 << 2;
    pub const FRI: u32 = 1 << 3;
    pub const SEI: u32 = 1 << 4;
    pub const AAI: u32 = 1 << 5;
    pub const URI: u32 = 1 << 6;
    pub const SRI: u32 = 1 << 7;
    pub const SLI: u32 = 1 << 8;
    /// Host controller halted.
    pub const HCH: u32 = 1 << 12;
    /// Periodic schedule status.
    pub const PS: u32 = 1 << 14;
    /// Asynchronous schedule status.
    pub const AS: u32 = 1 << 15;
    pub const NAKI: u32 = 1 << 16;
    pub const UAI: u32 = 1 << 18;
    pub const UPI: u32 = 1 << 19;
}

pub mod usbintr {
    pub const UE: u32 = 1 << 0;
    pub const UEE: u32 = 1 << 1;
    pub const PCE: u32 = 1 << 2;
    pub const FRE: u32 = 1 << 3;
    pub const AAE: u32 = 1 << 5;
    pub const URE: u32 = 1 << 6;
    pub const SRE: u32 = 1 << 7;
    pub const SLE: u32 = 1 << 8;
    pub const NAKE: u32 = 1 << 16;
    pub const UAIE: u32 = 1 << 18;
    pub const UPIA: u32 = 1 << 19;
}

pub mod deviceaddr {
    /// Address advance: latch the new address only once the next IN status
    /// stage has been acknowledged.
    pub const USBADRA: u32 = 1 << 24;
    pub const USBADR_SHIFT: u32 = 25;

    pub const fn usbadr(address: u8) -> u32 {
        ((address & 0x7F) as u32) << USBADR_SHIFT
    }
}

pub mod portsc1 {
    pub const CCS: u32 = 1 << 0;
    pub const CSC: u32 = 1 << 1;
    pub const PE: u32 = 1 << 2;
    pub const PEC: u32 = 1 << 3;
    pub const PR: u32 = 1 << 8;
    pub const PP: u32 = 1 << 12;
    pub const PSPD_SHIFT: u32 = 26;
    pub const PSPD_MASK: u32 = 0b11 << PSPD_SHIFT;
}

pub mod otgsc {
    /// VBUS discharge.
    pub const VD: u32 = 1 << 0;
    /// OTG termination.
    pub const OT: u32 = 1 << 3;
}

pub mod usbmode {
    pub const CM_MASK: u32 = 0b11;
    pub const CM_DEVICE: u32 = 0b10;
    pub const CM_HOST: u32 = 0b11;
    /// Host: VBUS power select.
    pub const VBPS: u32 = 1 << 5;
}

pub mod endptctrl {
    pub const RXS: u32 = 1 << 0;
    pub const RXT_SHIFT: u32 = 2;
    pub const RXT_MASK: u32 = 0b11 << RXT_SHIFT;
    pub const RXR: u32 = 1 << 6;
    pub const RXE: u32 = 1 << 7;
    pub const TXS: u32 = 1 << 16;
    pub const TXT_SHIFT: u32 = 18;
    pub const TXT_MASK: u32 = 0b11 << TXT_SHIFT;
    pub const TXR: u32 = 1 << 22;
    pub const TXE: u32 = 1 << 23;
}

/// Register-level access to one USB controller.
///
/// The read/modify/write shape deliberately matches what a PAC would give us,
/// so driver code reads the same whether it runs on silicon or in a test.
pub trait Registers {
    fn read(&self, reg: Reg) -> u32;
    fn write(&self, reg: Reg, value: u32);

    fn modify(&self, reg: Reg, f: impl FnOnce(u32) -> u32) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }

    fn set_bits(&self, reg: Reg, bits: u32) {
        self.modify(reg, |v| v | bits);
    }

    fn clear_bits(&self, reg: Reg, bits: u32) {
        self.modify(reg, |v| v & !bits);
    }
}

/// The real thing: volatile accesses to a controller's register block.
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Safety: `base` must be the base address of an LPC43xx USB controller,
    /// and the caller must be the only owner of that controller.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Safety: as for `new`; at most one `Mmio` per controller may exist.
    pub const unsafe fn for_controller(id: ControllerId) -> Self {
        Self::new(id.base_address())
    }
}

impl Registers for Mmio {
    #[inline(always)]
    fn read(&self, reg: Reg) -> u32 {
        // Safety: `new`'s contract puts a register block at `base`, and every
        // `Reg` offset is inside it and 4-byte aligned.
        unsafe { core::ptr::read_volatile((self.base + reg.offset()) as *const u32) }
    }

    #[inline(always)]
    fn write(&self, reg: Reg, value: u32) {
        // Safety: see `read`.
        unsafe { core::ptr::write_volatile((self.base + reg.offset()) as *mut u32, value) }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A software model of the controller, good enough to exercise the
    //! driver's protocol logic: write-one-to-clear status registers,
    //! self-clearing command bits, priming/flushing, the add-dTD tripwire,
    //! deferred addressing, and the host schedule status bits.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    const WORDS: usize = 0x200 / 4;

    pub struct MockRegisters {
        words: [AtomicU32; WORDS],
        /// When set, ENDPTPRIME completes instantly and marks the endpoint
        /// ready; otherwise primes stay pending until `finish_priming`.
        pub auto_prime: AtomicBool,
        /// Number of upcoming USBCMD reads that report ATDTW as cleared by the
        /// hardware (i.e. the add-dTD race was lost).
        pub atdtw_losses: AtomicU32,
        /// Number of upcoming USBCMD reads that report SUTW as cleared (a new
        /// SETUP arrived mid-copy).
        pub sutw_losses: AtomicU32,
        effective_address: AtomicU32,
        deferred_address: Mutex<Option<u8>>,
        writes: Mutex<Vec<(Reg, u32)>>,
    }

    impl MockRegisters {
        pub fn new() -> Self {
            Self {
                words: core::array::from_fn(|_| AtomicU32::new(0)),
                auto_prime: AtomicBool::new(true),
                atdtw_losses: AtomicU32::new(0),
                sutw_losses: AtomicU32::new(0),
                effective_address: AtomicU32::new(0),
                deferred_address: Mutex::new(None),
                writes: Mutex::new(Vec::new()),
            }
        }

        fn word(&self, reg: Reg) -> &AtomicU32 {
            &self.words[reg.offset() / 4]
        }

        /// Reads a register without triggering any modelled side effect.
        pub fn peek(&self, reg: Reg) -> u32 {
            self.word(reg).load(Ordering::SeqCst)
        }

        /// Sets register bits as the hardware would, without the driver's
        /// write semantics.
        pub fn raise(&self, reg: Reg, bits: u32) {
            self.word(reg).fetch_or(bits, Ordering::SeqCst);
        }

        pub fn lower(&self, reg: Reg, bits: u32) {
            self.word(reg).fetch_and(!bits, Ordering::SeqCst);
        }

        /// Completes every pending prime.
        pub fn finish_priming(&self) {
            let pending = self.word(Reg::EndptPrime).swap(0, Ordering::SeqCst);
            self.raise(Reg::EndptStat, pending);
        }

        /// The address the port currently answers to.
        pub fn effective_address(&self) -> u8 {
            self.effective_address.load(Ordering::SeqCst) as u8
        }

        /// Models the host ACKing the IN status stage on EP0, which is when a
        /// deferred (USBADRA) address takes effect.
        pub fn acknowledge_status_in(&self) {
            if let Some(address) = self.deferred_address.lock().unwrap().take() {
                self.effective_address.store(address as u32, Ordering::SeqCst);
            }
        }

        pub fn writes_to(&self, reg: Reg) -> Vec<u32> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(r, _)| r.offset() == reg.offset())
                .map(|&(_, v)| v)
                .collect()
        }

        pub fn clear_write_log(&self) {
            self.writes.lock().unwrap().clear();
        }
    }

    impl Registers for MockRegisters {
        fn read(&self, reg: Reg) -> u32 {
            if reg == Reg::UsbCmd {
                let value = self.peek(reg);
                if value & usbcmd::ATDTW != 0 && take_one(&self.atdtw_losses) {
                    self.lower(reg, usbcmd::ATDTW);
                }
                if value & usbcmd::SUTW != 0 && take_one(&self.sutw_losses) {
                    self.lower(reg, usbcmd::SUTW);
                }
            }
            self.peek(reg)
        }

        fn write(&self, reg: Reg, value: u32) {
            self.writes.lock().unwrap().push((reg, value));
            let word = self.word(reg);
            match reg {
                Reg::UsbCmd => {
                    word.store(value & !usbcmd::RST, Ordering::SeqCst);
                    // Schedules and the run bit are mirrored into USBSTS
                    // without delay.
                    for (cmd, sts) in [(usbcmd::ASE, usbsts::AS), (usbcmd::PSE, usbsts::PS)] {
                        if value & cmd != 0 {
                            self.raise(Reg::UsbSts, sts);
                        } else {
                            self.lower(Reg::UsbSts, sts);
                        }
                    }
                    if value & usbcmd::RS != 0 {
                        self.lower(Reg::UsbSts, usbsts::HCH);
                    } else {
                        self.raise(Reg::UsbSts, usbsts::HCH);
                    }
                }
                Reg::UsbSts | Reg::EndptSetupStat | Reg::EndptComplete | Reg::EndptNak => {
                    word.fetch_and(!value, Ordering::SeqCst);
                }
                Reg::EndptPrime => {
                    if self.auto_prime.load(Ordering::SeqCst) {
                        self.raise(Reg::EndptStat, value);
                    } else {
                        word.fetch_or(value, Ordering::SeqCst);
                    }
                }
                Reg::EndptFlush => {
                    self.lower(Reg::EndptStat, value);
                    word.store(0, Ordering::SeqCst);
                }
                Reg::DeviceAddr => {
                    word.store(value, Ordering::SeqCst);
                    let address = (value >> deviceaddr::USBADR_SHIFT) as u8;
                    if value & deviceaddr::USBADRA != 0 {
                        *self.deferred_address.lock().unwrap() = Some(address);
                    } else {
                        self.effective_address.store(address as u32, Ordering::SeqCst);
                    }
                }
                Reg::PortSc1 => {
                    word.store(value & !portsc1::PR, Ordering::SeqCst);
                }
                _ => word.store(value, Ordering::SeqCst),
            }
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}
