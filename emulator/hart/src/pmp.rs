//! Physical memory protection
//!
//! Sixteen entries, each a permission byte packed into the `pmpcfg` words
//! plus one address register. Entries are scanned in order and the first one
//! whose window contains the access decides. In machine mode only locked
//! entries are consulted; locked entries survive everything short of a reset.

use crate::{AccessType, PrivilegeLevel, XlenU};

pub const PMP_ENTRY_COUNT: usize = 16;

/// Bytes per `pmpcfg` word, and therefore entries per word.
const CFG_BYTES: usize = (crate::XLEN / 8) as usize;
/// Number of `pmpcfg` CSRs: four on rv32, two on rv64.
pub const PMP_CFG_REG_COUNT: usize = PMP_ENTRY_COUNT / CFG_BYTES;

const PMP_R: u8 = 1 << 0;
const PMP_W: u8 = 1 << 1;
const PMP_X: u8 = 1 << 2;
const PMP_L: u8 = 1 << 7;

/// The address-matching mode of an entry, bits 3..=4 of its config byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMatching {
    Off = 0,
    /// Top of range: the window spans from the previous entry's address
    /// (or zero for entry 0) up to this entry's address.
    Tor = 1,
    /// A naturally aligned 4-byte window at `addr << 2`.
    Na4 = 2,
    /// A naturally aligned power-of-two window encoded by the trailing one
    /// bits of the address register.
    Napot = 3,
}

impl AddressMatching {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => AddressMatching::Off,
            1 => AddressMatching::Tor,
            2 => AddressMatching::Na4,
            _ => AddressMatching::Napot,
        }
    }
}

fn access_bit(kind: AccessType) -> u8 {
    match kind {
        AccessType::Read => PMP_R,
        AccessType::Write => PMP_W,
        AccessType::Fetch => PMP_X,
    }
}

/// The access violated the physical memory protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmpViolation;

#[derive(Debug, Default)]
pub struct Pmp {
    cfg: [XlenU; PMP_CFG_REG_COUNT],
    addr: [XlenU; PMP_ENTRY_COUNT],
}

impl Pmp {
    pub fn new() -> Self {
        Self::default()
    }

    fn cfg_byte(&self, entry: usize) -> u8 {
        (self.cfg[entry / CFG_BYTES] >> (8 * (entry % CFG_BYTES))) as u8
    }

    fn set_cfg_byte(&mut self, entry: usize, byte: u8) {
        let shift = 8 * (entry % CFG_BYTES);
        let word = &mut self.cfg[entry / CFG_BYTES];
        *word = (*word & !((0xFF as XlenU) << shift)) | ((byte as XlenU) << shift);
    }

    fn locked(&self, entry: usize) -> bool {
        self.cfg_byte(entry) & PMP_L != 0
    }

    fn matching(&self, entry: usize) -> AddressMatching {
        AddressMatching::from_bits(self.cfg_byte(entry) >> 3)
    }

    pub fn read_cfg(&self, reg: usize) -> XlenU {
        self.cfg[reg]
    }

    /// Write one `pmpcfg` word. The write is bytewise and skips locked
    /// entries, which only a hardware reset can unlock.
    pub fn write_cfg(&mut self, reg: usize, value: XlenU) {
        for lane in 0..CFG_BYTES {
            let entry = reg * CFG_BYTES + lane;
            if self.locked(entry) {
                continue;
            }
            self.set_cfg_byte(entry, (value >> (8 * lane)) as u8);
        }
    }

    pub fn read_addr(&self, entry: usize) -> XlenU {
        self.addr[entry]
    }

    /// Write one `pmpaddr` register.
    ///
    /// The register is not writable while its own entry is locked, nor while
    /// the following entry is locked in TOR mode (its window depends on this
    /// address). A rejected write is silently dropped.
    pub fn write_addr(&mut self, entry: usize, value: XlenU) {
        if self.locked(entry) {
            return;
        }
        if entry + 1 < PMP_ENTRY_COUNT
            && self.locked(entry + 1)
            && self.matching(entry + 1) == AddressMatching::Tor
        {
            return;
        }
        self.addr[entry] = value;
    }

    /// The byte window `[start, start + size)` of an active entry.
    fn window(&self, entry: usize) -> (u64, u64) {
        let addr = self.addr[entry] as u64;
        match self.matching(entry) {
            AddressMatching::Off => (0, 0),
            AddressMatching::Tor => {
                let start = if entry == 0 {
                    0
                } else {
                    (self.addr[entry - 1] as u64) << 2
                };
                (start, (addr << 2).saturating_sub(start))
            }
            AddressMatching::Na4 => (addr << 2, 4),
            AddressMatching::Napot => {
                if addr == XlenU::MAX as u64 {
                    return (0, u64::MAX);
                }
                let ones = addr.trailing_ones();
                let size = 1u64 << (ones + 3);
                let start = (addr & !((1u64 << ones) - 1)) << 2;
                (start, size)
            }
        }
    }

    /// Check a physical access of `len` bytes against the protection.
    ///
    /// Entries are scanned in order and the first entry containing the access
    /// decides via its RWX bits. Machine mode consults only locked entries.
    /// An access that straddles a window edge is denied, except that machine
    /// mode passes when the RWX bits of the partially matching entry allow
    /// the access. Without any match machine mode passes; other modes are
    /// denied as soon as at least one entry is active.
    pub fn check(
        &self,
        level: PrivilegeLevel,
        addr: u64,
        len: usize,
        kind: AccessType,
    ) -> Result<(), PmpViolation> {
        let machine = level == PrivilegeLevel::Machine;
        let mut any_active = false;
        let end = addr + (len as u64 - 1);

        for entry in 0..PMP_ENTRY_COUNT {
            // locked entries are enforced against machine mode, everything
            // else machine mode ignores
            if machine && !self.locked(entry) {
                continue;
            }
            if self.matching(entry) == AddressMatching::Off {
                continue;
            }
            any_active = true;

            let (start, size) = self.window(entry);
            let within = |a: u64| a >= start && a - start < size;
            let lower = within(addr);
            let upper = within(end);
            let allowed = self.cfg_byte(entry) & access_bit(kind) != 0;

            match (lower, upper) {
                (true, true) => {
                    return if allowed { Ok(()) } else { Err(PmpViolation) };
                }
                (true, false) | (false, true) => {
                    log::trace!(
                        "pmp: {}-byte access at {:#x} straddles entry {} window {:#x}+{:#x}",
                        len,
                        addr,
                        entry,
                        start,
                        size
                    );
                    return if machine && allowed {
                        Ok(())
                    } else {
                        Err(PmpViolation)
                    };
                }
                (false, false) => {}
            }
        }

        if machine || !any_active {
            Ok(())
        } else {
            Err(PmpViolation)
        }
    }
}
