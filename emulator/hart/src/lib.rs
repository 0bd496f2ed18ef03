//! The interpreter core of a single RISC-V hart
//!
//! This crate implements the rv32ima / rv64ima instruction set together with
//! the machine, supervisor and user privilege levels of the RISC-V privileged
//! specification: a control-and-status register file, the trap and interrupt
//! engine with delegation, an Sv32 page translation unit and physical memory
//! protection.
//!
//! The hart itself owns no memory. All physical accesses go through the
//! [`Bus`] capability that the caller hands to [`Hart::step`] for the
//! duration of one instruction.

use static_assertions::assert_eq_size;
use thiserror::Error;

pub mod csr;
pub mod decode;
mod exec;
mod hart;
pub mod mmu;
pub mod pmp;
pub mod trap;

pub use hart::Hart;

/// Width of the general purpose registers and the program counter.
#[cfg(feature = "rv32")]
pub const XLEN: u32 = 32;
#[cfg(not(feature = "rv32"))]
pub const XLEN: u32 = 64;

/// Unsigned register-width integer.
#[cfg(feature = "rv32")]
pub type XlenU = u32;
#[cfg(not(feature = "rv32"))]
pub type XlenU = u64;

/// Signed register-width integer.
#[cfg(feature = "rv32")]
pub type XlenI = i32;
#[cfg(not(feature = "rv32"))]
pub type XlenI = i64;

assert_eq_size!(XlenU, XlenI);

/// Mask applied to shift amounts, `log2(XLEN)` bits wide.
#[cfg(feature = "rv32")]
pub const SHIFT_MASK: XlenU = 0x1F;
#[cfg(not(feature = "rv32"))]
pub const SHIFT_MASK: XlenU = 0x3F;

/// The RISC-V privilege levels implemented by this hart.
///
/// The discriminants are the architectural encoding, which also makes the
/// derived ordering the privilege ordering (machine is the most privileged).
/// Level 2 is reserved by the specification and does not exist here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl PrivilegeLevel {
    /// Decode a two bit xPP field.
    ///
    /// The reserved encoding `2` is mapped to machine mode; it cannot be
    /// produced by this hart because trap entry only ever stores real levels.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => PrivilegeLevel::User,
            1 => PrivilegeLevel::Supervisor,
            _ => PrivilegeLevel::Machine,
        }
    }

    /// The next lower privilege level, if any.
    pub fn lower(self) -> Option<Self> {
        match self {
            PrivilegeLevel::Machine => Some(PrivilegeLevel::Supervisor),
            PrivilegeLevel::Supervisor => Some(PrivilegeLevel::User),
            PrivilegeLevel::User => None,
        }
    }
}

/// What a memory access wants to do, as seen by the PMP and the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    /// An instruction fetch. Fetches ignore `mstatus.MPRV` and are checked
    /// against the execute permission.
    Fetch,
}

/// A physical memory access missed every device window or spanned a window
/// boundary. The hart surfaces this as an access fault of the originating
/// access kind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no device claims the {len}-byte access at physical address {addr:#x}")]
pub struct BusError {
    pub addr: u64,
    pub len: usize,
}

/// The physical bus capability the hart borrows for the duration of a step.
///
/// Addresses are physical (34 bit in Sv32, so `u64` even on a 32-bit hart)
/// and values are little-endian, truncated to `len` bytes.
pub trait Bus {
    fn read(&mut self, addr: u64, len: usize) -> Result<u64, BusError>;
    fn write(&mut self, addr: u64, value: u64, len: usize) -> Result<(), BusError>;
}
