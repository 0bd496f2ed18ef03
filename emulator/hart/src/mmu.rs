//! Sv32 page translation
//!
//! Two levels of 4 KiB page-table pages holding 4-byte entries, walked as
//! laid out in the privileged specification. Machine mode and a bare `satp`
//! bypass translation entirely.
//!
//! The walker reads page-table entries through a callback so that those
//! implicit accesses take the same PMP-checked path to the bus as everything
//! else; a failing PTE read is an access fault, not a page fault.
//!
//! The accessed and dirty bits are deliberately left untouched by the
//! walker.

use crate::{AccessType, PrivilegeLevel, XlenU};
use bitflags::bitflags;

pub const PAGE_SIZE: u64 = 4096;
const PTE_SIZE: u64 = 4;
const LEVELS: u32 = 2;

#[cfg(feature = "rv32")]
const SATP_MODE_SHIFT: u32 = 31;
#[cfg(feature = "rv32")]
const SATP_MODE_MASK: XlenU = 0x1;
#[cfg(feature = "rv32")]
const SATP_PPN_MASK: XlenU = 0x3F_FFFF;

#[cfg(not(feature = "rv32"))]
const SATP_MODE_SHIFT: u32 = 60;
#[cfg(not(feature = "rv32"))]
const SATP_MODE_MASK: XlenU = 0xF;
#[cfg(not(feature = "rv32"))]
const SATP_PPN_MASK: XlenU = 0xFFF_FFFF_FFFF;

bitflags! {
    /// The flag bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// The entry takes part in translation at all.
        const VALID = 1 << 0;
        /// Loads from the mapped page are allowed.
        const READ = 1 << 1;
        /// Stores to the mapped page are allowed.
        const WRITE = 1 << 2;
        /// Instruction fetches from the mapped page are allowed.
        const EXEC = 1 << 3;
        /// The page belongs to user mode.
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;

        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// How a translation failed. A page fault takes the cause matching the
/// access kind; an access fault means the walk itself could not read a PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuFault {
    PageFault,
    AccessFault,
}

#[derive(Debug, Default)]
pub struct Mmu {
    satp: XlenU,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn satp(&self) -> XlenU {
        self.satp
    }

    pub fn set_satp(&mut self, value: XlenU) {
        log::trace!("satp <- {:#x}", value);
        self.satp = value;
    }

    fn mode(&self) -> XlenU {
        (self.satp >> SATP_MODE_SHIFT) & SATP_MODE_MASK
    }

    fn root_table(&self) -> u64 {
        (self.satp & SATP_PPN_MASK) as u64 * PAGE_SIZE
    }

    /// Translate a virtual address.
    ///
    /// `read_pte` performs the physical PTE reads (PMP-checked, through the
    /// bus); its failure aborts the walk with an access fault. `sum` and
    /// `mxr` are the corresponding `mstatus` fields.
    pub fn translate(
        &self,
        level: PrivilegeLevel,
        virt_addr: XlenU,
        kind: AccessType,
        sum: bool,
        mxr: bool,
        mut read_pte: impl FnMut(u64) -> Result<u64, ()>,
    ) -> Result<u64, MmuFault> {
        // machine mode and bare mode have no translation
        if level == PrivilegeLevel::Machine || self.mode() == 0 {
            return Ok(virt_addr as u64);
        }

        let va = virt_addr as u64;
        let vpn = [(va >> 12) & 0x3FF, (va >> 22) & 0x3FF];

        let mut table = self.root_table();
        let mut walk_level = LEVELS - 1;
        let (pte, leaf_level) = loop {
            let pte_addr = table + vpn[walk_level as usize] * PTE_SIZE;
            let pte = read_pte(pte_addr).map_err(|_| MmuFault::AccessFault)? as u32;
            let flags = PteFlags::from_bits_truncate(pte);

            if !flags.contains(PteFlags::VALID)
                || (!flags.contains(PteFlags::READ) && flags.contains(PteFlags::WRITE))
            {
                log::trace!("page fault: invalid pte {:#x} for va {:#x}", pte, va);
                return Err(MmuFault::PageFault);
            }
            if flags.intersects(PteFlags::RWX) {
                break (pte, walk_level);
            }
            if walk_level == 0 {
                log::trace!("page fault: no leaf for va {:#x}", va);
                return Err(MmuFault::PageFault);
            }
            walk_level -= 1;
            table = ((pte as u64) >> 10) * PAGE_SIZE;
        };

        let mut flags = PteFlags::from_bits_truncate(pte);
        let user_page = flags.contains(PteFlags::USER);

        // user mode only reaches user pages
        if level == PrivilegeLevel::User && !user_page {
            log::trace!("page fault: user access to privileged page {:#x}", va);
            return Err(MmuFault::PageFault);
        }
        // supervisor mode reaches user pages only with SUM, and never
        // executes from them
        if level == PrivilegeLevel::Supervisor && user_page && (!sum || kind == AccessType::Fetch) {
            log::trace!("page fault: supervisor access to user page {:#x}", va);
            return Err(MmuFault::PageFault);
        }

        // make executable readable
        if mxr && kind == AccessType::Read && flags.contains(PteFlags::EXEC) {
            flags |= PteFlags::READ;
        }
        let required = match kind {
            AccessType::Read => PteFlags::READ,
            AccessType::Write => PteFlags::WRITE,
            AccessType::Fetch => PteFlags::EXEC,
        };
        if !flags.contains(required) {
            log::trace!("page fault: {:?} not permitted by pte for va {:#x}", kind, va);
            return Err(MmuFault::PageFault);
        }

        let ppn = [((pte as u64) >> 10) & 0x3FF, ((pte as u64) >> 20) & 0xFFF];

        // a superpage leaf must have its low PPN part clear
        if leaf_level > 0 && ppn[0] != 0 {
            log::trace!("page fault: misaligned superpage for va {:#x}", va);
            return Err(MmuFault::PageFault);
        }

        // physical addresses are 34 bit wide, even on a 32 bit hart
        let phys = match leaf_level {
            0 => (ppn[1] << 22) | (ppn[0] << 12) | (va & 0xFFF),
            _ => (ppn[1] << 22) | (va & 0x3F_FFFF),
        };
        log::trace!("translated va {:#x} -> pa {:#x}", va, phys);
        Ok(phys)
    }
}
