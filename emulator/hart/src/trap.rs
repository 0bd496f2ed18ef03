//! The trap and interrupt engine
//!
//! Trap setup and trap handling registers are shared across privilege levels
//! but with different access views, so they are unified here: `status`,
//! `ideleg`, `ie` and `ip` are a single underlying word each, read and
//! written through per-level WARL masks, while the setup registers (`isa`,
//! `edeleg`, `tvec`, `counteren`) and the handling registers (`scratch`,
//! `epc`, `cause`, `tval`) exist once per level.
//!
//! The engine also decides which privilege level serves an exception
//! (walking the `edeleg` chain downward) or a pending interrupt, and performs
//! the architectural trap-entry and trap-return register shuffles.

use crate::{PrivilegeLevel, XlenI, XlenU, XLEN};
use bitflags::bitflags;

bitflags! {
    /// Single-bit fields of the shared `status` word.
    ///
    /// The two bit MPP field at bits 11..=12 is handled with
    /// [`TrapUnit::previous_privilege`] and friends instead of a flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: XlenU {
        /// User-level global interrupt enable.
        const UIE = 1 << 0;
        /// Supervisor-level global interrupt enable.
        const SIE = 1 << 1;
        /// Machine-level global interrupt enable.
        const MIE = 1 << 3;
        /// Pre-trap value of UIE.
        const UPIE = 1 << 4;
        /// Pre-trap value of SIE.
        const SPIE = 1 << 5;
        /// Pre-trap value of MIE.
        const MPIE = 1 << 7;
        /// Privilege level active before the last trap into supervisor mode.
        const SPP = 1 << 8;
        /// When set, data accesses use the privilege level stored in MPP.
        /// Instruction address-translation and protection are unaffected.
        const MPRV = 1 << 17;
        /// Permit supervisor access to user-accessible pages.
        const SUM = 1 << 18;
        /// Make executable pages readable.
        const MXR = 1 << 19;
    }
}

/// Bit position of the two bit MPP field in `status`.
const STATUS_MPP_SHIFT: u32 = 11;

/// Exception causes as encoded in `xcause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Exception {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    EnvCallFromUMode = 8,
    EnvCallFromSMode = 9,
    EnvCallFromMMode = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

impl Exception {
    /// The environment-call cause for the given originating privilege level.
    pub fn env_call_from(level: PrivilegeLevel) -> Self {
        match level {
            PrivilegeLevel::User => Exception::EnvCallFromUMode,
            PrivilegeLevel::Supervisor => Exception::EnvCallFromSMode,
            PrivilegeLevel::Machine => Exception::EnvCallFromMMode,
        }
    }
}

/// The three interrupt classes of the local interrupt architecture.
///
/// Together with a target privilege level, a class selects one bit in the
/// shared `ie`/`ip`/`ideleg` words: software interrupts occupy bits 0..=3,
/// timer interrupts bits 4..=7 and external interrupts bits 8..=11, indexed
/// by privilege level within each group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqClass {
    Software,
    Timer,
    External,
}

impl IrqClass {
    fn base_bit(self) -> u32 {
        match self {
            IrqClass::Software => 0,
            IrqClass::Timer => 4,
            IrqClass::External => 8,
        }
    }
}

/// The `ie`/`ip` bit (and the interrupt cause number) of an interrupt class
/// targeting a privilege level.
pub fn irq_bit(class: IrqClass, level: PrivilegeLevel) -> u32 {
    class.base_bit() + level as u32
}

/// The registers hosted by the trap engine, addressed per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReg {
    Status,
    Isa,
    Edeleg,
    Ideleg,
    Ie,
    Tvec,
    Counteren,
    Scratch,
    Epc,
    Cause,
    Tval,
    Ip,
}

/// Registers with one shared storage word viewed by all three levels.
#[derive(Debug, Default)]
struct SharedRegs {
    status: XlenU,
    ideleg: XlenU,
    ie: XlenU,
    ip: XlenU,
}

/// Registers that exist separately per privilege level.
#[derive(Debug, Default)]
struct LevelRegs {
    isa: XlenU,
    edeleg: XlenU,
    tvec: XlenU,
    counteren: XlenU,
    scratch: XlenU,
    epc: XlenU,
    cause: XlenU,
    tval: XlenU,
}

#[derive(Debug, Default)]
pub struct TrapUnit {
    shared: SharedRegs,
    m: LevelRegs,
    s: LevelRegs,
    u: LevelRegs,
}

/// View mask of the shared `status` word for a privilege level.
///
/// Machine mode sees every implemented bit, supervisor mode the S/U relevant
/// subset, user mode only the U bits.
fn status_view(level: PrivilegeLevel) -> XlenU {
    const SD: XlenU = 1 << (XLEN - 1);
    match level {
        // UIE..MPRV/SUM/MXR plus the MPP/SPP fields, matching the mstatus
        // write mask of this implementation
        PrivilegeLevel::Machine => SD | 0x000F_007F_F9BB_u64 as XlenU,
        PrivilegeLevel::Supervisor => {
            SD | (StatusFlags::SIE
                | StatusFlags::UIE
                | StatusFlags::SPIE
                | StatusFlags::UPIE
                | StatusFlags::SPP
                | StatusFlags::SUM
                | StatusFlags::MXR)
                .bits()
        }
        PrivilegeLevel::User => (StatusFlags::UIE | StatusFlags::UPIE).bits(),
    }
}

/// View mask of the shared `ie`/`ip`/`ideleg` words for a privilege level.
fn irq_view(level: PrivilegeLevel) -> XlenU {
    match level {
        PrivilegeLevel::Machine => 0xBBB,
        PrivilegeLevel::Supervisor => 0x333,
        PrivilegeLevel::User => 0x111,
    }
}

impl TrapUnit {
    pub fn new() -> Self {
        Self::default()
    }

    fn bank(&self, level: PrivilegeLevel) -> &LevelRegs {
        match level {
            PrivilegeLevel::Machine => &self.m,
            PrivilegeLevel::Supervisor => &self.s,
            PrivilegeLevel::User => &self.u,
        }
    }

    fn bank_mut(&mut self, level: PrivilegeLevel) -> &mut LevelRegs {
        match level {
            PrivilegeLevel::Machine => &mut self.m,
            PrivilegeLevel::Supervisor => &mut self.s,
            PrivilegeLevel::User => &mut self.u,
        }
    }

    /// Read a trap register through the view of the given privilege level.
    pub fn read(&self, level: PrivilegeLevel, reg: TrapReg) -> XlenU {
        match reg {
            TrapReg::Status => self.shared.status & status_view(level),
            TrapReg::Ideleg => self.shared.ideleg & irq_view(level),
            TrapReg::Ie => self.shared.ie & irq_view(level),
            TrapReg::Ip => self.shared.ip & irq_view(level),
            TrapReg::Isa => self.bank(level).isa,
            TrapReg::Edeleg => self.bank(level).edeleg,
            TrapReg::Tvec => self.bank(level).tvec,
            TrapReg::Counteren => self.bank(level).counteren,
            TrapReg::Scratch => self.bank(level).scratch,
            TrapReg::Epc => self.bank(level).epc,
            TrapReg::Cause => self.bank(level).cause,
            TrapReg::Tval => self.bank(level).tval,
        }
    }

    /// Write a trap register through the view of the given privilege level.
    ///
    /// For the shared registers the value is merged under the view mask, so a
    /// lower-privilege write cannot disturb bits outside its view.
    pub fn write(&mut self, level: PrivilegeLevel, reg: TrapReg, value: XlenU) {
        let merge_shared = |word: &mut XlenU, view: XlenU| {
            *word = (*word & !view) | (value & view);
        };
        match reg {
            TrapReg::Status => merge_shared(&mut self.shared.status, status_view(level)),
            TrapReg::Ideleg => merge_shared(&mut self.shared.ideleg, irq_view(level)),
            TrapReg::Ie => merge_shared(&mut self.shared.ie, irq_view(level)),
            TrapReg::Ip => merge_shared(&mut self.shared.ip, irq_view(level)),
            TrapReg::Isa => self.bank_mut(level).isa = value,
            TrapReg::Edeleg => self.bank_mut(level).edeleg = value,
            TrapReg::Tvec => self.bank_mut(level).tvec = value,
            TrapReg::Counteren => self.bank_mut(level).counteren = value,
            TrapReg::Scratch => self.bank_mut(level).scratch = value,
            TrapReg::Epc => self.bank_mut(level).epc = value,
            TrapReg::Cause => self.bank_mut(level).cause = value,
            TrapReg::Tval => self.bank_mut(level).tval = value,
        }
    }

    fn status_flag(&self, flag: StatusFlags) -> bool {
        self.shared.status & flag.bits() != 0
    }

    /// Whether data accesses are redirected to the MPP privilege level.
    pub fn mprv(&self) -> bool {
        self.status_flag(StatusFlags::MPRV)
    }

    pub fn sum(&self) -> bool {
        self.status_flag(StatusFlags::SUM)
    }

    pub fn mxr(&self) -> bool {
        self.status_flag(StatusFlags::MXR)
    }

    /// The privilege level stored in the MPP field.
    pub fn machine_previous_privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_bits((self.shared.status >> STATUS_MPP_SHIFT) as u8 & 0x3)
    }

    fn global_irq_enabled(&self, level: PrivilegeLevel) -> bool {
        self.shared.status & (1 << level as u32) != 0
    }

    /// Merge the external wire levels from the interrupt fabric (`mei` from
    /// the PLIC, `msi` and `mti` from the CLINT) into the pending word.
    ///
    /// A wire is sampled into the per-level pending bit only while the
    /// corresponding enable bit is set, for all three privilege levels.
    pub fn set_pending_wires(&mut self, mei: bool, msi: bool, mti: bool) {
        for level in [
            PrivilegeLevel::Machine,
            PrivilegeLevel::Supervisor,
            PrivilegeLevel::User,
        ] {
            for (class, wire) in [
                (IrqClass::External, mei),
                (IrqClass::Software, msi),
                (IrqClass::Timer, mti),
            ] {
                let bit = 1 << irq_bit(class, level);
                if self.shared.ie & bit != 0 {
                    if wire {
                        self.shared.ip |= bit;
                    } else {
                        self.shared.ip &= !bit;
                    }
                }
            }
        }
    }

    /// Find the highest-priority interrupt that can be taken right now.
    ///
    /// Priority is MEI > MSI > MTI > SEI > SSI > STI > UEI > USI > UTI. An
    /// interrupt targeting level x is takeable iff its bit is set in both
    /// `ie` and `ip`, it is not delegated below the current privilege level,
    /// and either the hart runs below x or it runs at x with x's global
    /// interrupt enable set. Returns the serving level and the cause number.
    pub fn pending_interrupt(&self, current: PrivilegeLevel) -> Option<(PrivilegeLevel, u32)> {
        for target in [
            PrivilegeLevel::Machine,
            PrivilegeLevel::Supervisor,
            PrivilegeLevel::User,
        ] {
            for class in [IrqClass::External, IrqClass::Software, IrqClass::Timer] {
                let cause = irq_bit(class, target);
                let bit = 1 << cause;

                // delegated below this level, will be considered again under
                // its lower-level alias
                if self.shared.ideleg & bit != 0 && current < target {
                    continue;
                }
                if self.shared.ip & bit == 0 || self.shared.ie & bit == 0 {
                    continue;
                }
                let takeable = current < target
                    || (current == target && self.global_irq_enabled(target));
                if takeable {
                    return Some((target, cause));
                }
            }
        }
        None
    }

    /// Determine which privilege level serves an exception raised while
    /// running at `current`.
    ///
    /// Starting at machine level, the exception moves one level down whenever
    /// the current privilege is below the level under consideration and that
    /// level's `edeleg` register delegates the cause.
    pub fn exception_target(&self, current: PrivilegeLevel, cause: Exception) -> PrivilegeLevel {
        let cause_bit = 1 << cause as u32;
        let mut target = PrivilegeLevel::Machine;
        while current < target && self.bank(target).edeleg & cause_bit != 0 {
            match target.lower() {
                Some(lower) => target = lower,
                None => break,
            }
        }
        target
    }

    /// Perform trap entry into `target`, coming from `previous`.
    ///
    /// `epc` is the address to be saved in `xEPC` (the faulting instruction
    /// for exceptions, the next instruction for interrupts) and `cause` the
    /// full cause word including the interrupt bit. Saves xPP and xPIE,
    /// clears xIE and returns the trap vector the PC must be set to.
    pub fn serve(
        &mut self,
        target: PrivilegeLevel,
        previous: PrivilegeLevel,
        cause: XlenU,
        epc: XlenU,
    ) -> XlenU {
        log::debug!(
            "trap entry to {:?} from {:?}: cause {:#x} epc {:#x}",
            target,
            previous,
            cause,
            epc
        );

        let bank = self.bank_mut(target);
        bank.epc = epc;
        bank.cause = cause;

        // xPP <- y
        match target {
            PrivilegeLevel::Machine => {
                self.shared.status &= !(0x3 << STATUS_MPP_SHIFT);
                self.shared.status |= (previous as XlenU) << STATUS_MPP_SHIFT;
            }
            PrivilegeLevel::Supervisor => {
                self.shared.status &= !StatusFlags::SPP.bits();
                if previous != PrivilegeLevel::User {
                    self.shared.status |= StatusFlags::SPP.bits();
                }
            }
            PrivilegeLevel::User => {}
        }

        // xPIE <- xIE; xIE <- 0
        let ie_bit = 1 << target as u32;
        let pie_bit = 1 << (4 + target as u32);
        if self.shared.status & ie_bit != 0 {
            self.shared.status |= pie_bit;
        } else {
            self.shared.status &= !pie_bit;
        }
        self.shared.status &= !ie_bit;

        self.bank(target).tvec
    }

    /// Perform the register half of an `xRET` from `level`.
    ///
    /// Restores xIE from xPIE, sets xPIE to 1, resets xPP to user mode and
    /// returns the saved exception PC together with the privilege level to
    /// drop to.
    pub fn trap_return(&mut self, level: PrivilegeLevel) -> (XlenU, PrivilegeLevel) {
        let previous = match level {
            PrivilegeLevel::Machine => self.machine_previous_privilege(),
            PrivilegeLevel::Supervisor => {
                if self.status_flag(StatusFlags::SPP) {
                    PrivilegeLevel::Supervisor
                } else {
                    PrivilegeLevel::User
                }
            }
            PrivilegeLevel::User => PrivilegeLevel::User,
        };

        // xIE <- xPIE; xPIE <- 1
        let ie_bit = 1 << level as u32;
        let pie_bit = 1 << (4 + level as u32);
        if self.shared.status & pie_bit != 0 {
            self.shared.status |= ie_bit;
        } else {
            self.shared.status &= !ie_bit;
        }
        self.shared.status |= pie_bit;

        // xPP <- U
        match level {
            PrivilegeLevel::Machine => self.shared.status &= !(0x3 << STATUS_MPP_SHIFT),
            PrivilegeLevel::Supervisor => self.shared.status &= !StatusFlags::SPP.bits(),
            PrivilegeLevel::User => {}
        }

        log::debug!("trap return from {:?} to {:?}", level, previous);
        (self.bank(level).epc, previous)
    }
}

/// Build the `xcause` value for an interrupt cause number.
pub fn interrupt_cause(cause: u32) -> XlenU {
    (1 << (XLEN - 1)) | cause as XlenU
}

/// Build the `xcause` value for an exception.
pub fn exception_cause(cause: Exception) -> XlenU {
    cause as XlenU
}

/// Whether an `xcause` value denotes an interrupt.
pub fn cause_is_interrupt(cause: XlenU) -> bool {
    (cause as XlenI) < 0
}

#[cfg(test)]
mod test {
    use super::*;

    const M: PrivilegeLevel = PrivilegeLevel::Machine;
    const S: PrivilegeLevel = PrivilegeLevel::Supervisor;
    const U: PrivilegeLevel = PrivilegeLevel::User;

    #[test]
    fn test_status_views_share_one_word() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Status, StatusFlags::SIE.bits());
        assert_eq!(trap.read(S, TrapReg::Status), StatusFlags::SIE.bits());

        trap.write(S, TrapReg::Status, 0);
        assert_eq!(trap.read(M, TrapReg::Status) & StatusFlags::SIE.bits(), 0);
    }

    #[test]
    fn test_supervisor_status_write_cannot_touch_machine_bits() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Status, StatusFlags::MIE.bits() | StatusFlags::MPRV.bits());
        trap.write(S, TrapReg::Status, 0);
        assert!(trap.mprv());
        assert_ne!(trap.read(M, TrapReg::Status) & StatusFlags::MIE.bits(), 0);
    }

    #[test]
    fn test_handling_registers_are_per_level() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Scratch, 0x1111);
        trap.write(S, TrapReg::Scratch, 0x2222);
        assert_eq!(trap.read(M, TrapReg::Scratch), 0x1111);
        assert_eq!(trap.read(S, TrapReg::Scratch), 0x2222);
    }

    #[test]
    fn test_ie_views_are_masked_per_level() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Ie, 0xBBB);
        assert_eq!(trap.read(S, TrapReg::Ie), 0x333);
        assert_eq!(trap.read(U, TrapReg::Ie), 0x111);
    }

    #[test]
    fn test_machine_timer_interrupt_is_taken_with_mie_set() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Ie, 1 << irq_bit(IrqClass::Timer, M));
        trap.write(M, TrapReg::Status, StatusFlags::MIE.bits());
        trap.set_pending_wires(false, false, true);

        let (level, cause) = trap.pending_interrupt(M).unwrap();
        assert_eq!(level, M);
        assert_eq!(cause, 7);
    }

    #[test]
    fn test_interrupt_not_taken_without_global_enable() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Ie, 1 << irq_bit(IrqClass::Timer, M));
        trap.set_pending_wires(false, false, true);
        assert_eq!(trap.pending_interrupt(M), None);
    }

    #[test]
    fn test_interrupt_taken_from_lower_privilege_regardless_of_mie() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Ie, 1 << irq_bit(IrqClass::Timer, M));
        trap.set_pending_wires(false, false, true);
        // MIE clear, but user mode is strictly below machine
        let (level, cause) = trap.pending_interrupt(U).unwrap();
        assert_eq!(level, M);
        assert_eq!(cause, 7);
    }

    #[test]
    fn test_external_beats_software_beats_timer() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Ie, 0xBBB);
        trap.write(M, TrapReg::Status, StatusFlags::MIE.bits());
        trap.set_pending_wires(true, true, true);

        let (_, cause) = trap.pending_interrupt(M).unwrap();
        assert_eq!(cause, 11, "MEI must win over MSI and MTI");
    }

    #[test]
    fn test_delegated_timer_interrupt_serves_in_supervisor() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Ideleg, 1 << irq_bit(IrqClass::Timer, M));
        trap.write(
            M,
            TrapReg::Ie,
            (1 << irq_bit(IrqClass::Timer, M)) | (1 << irq_bit(IrqClass::Timer, S)),
        );
        trap.write(M, TrapReg::Status, StatusFlags::SIE.bits());
        trap.set_pending_wires(false, false, true);

        let (level, cause) = trap.pending_interrupt(S).unwrap();
        assert_eq!(level, S);
        assert_eq!(cause, 5);
    }

    #[test]
    fn test_exception_stays_in_machine_without_delegation() {
        let trap = TrapUnit::new();
        assert_eq!(trap.exception_target(U, Exception::EnvCallFromUMode), M);
    }

    #[test]
    fn test_exception_delegation_walks_down() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Edeleg, 1 << Exception::EnvCallFromUMode as u32);
        assert_eq!(trap.exception_target(U, Exception::EnvCallFromUMode), S);

        // but never below the current privilege level
        assert_eq!(trap.exception_target(M, Exception::EnvCallFromUMode), M);
        assert_eq!(trap.exception_target(S, Exception::EnvCallFromUMode), S);
    }

    #[test]
    fn test_serve_saves_previous_state_and_masks_interrupts() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Status, StatusFlags::MIE.bits());
        trap.write(M, TrapReg::Tvec, 0x8000_0000);

        let vector = trap.serve(M, S, exception_cause(Exception::IllegalInstruction), 0x1234);
        assert_eq!(vector, 0x8000_0000);
        assert_eq!(trap.read(M, TrapReg::Epc), 0x1234);
        assert_eq!(trap.read(M, TrapReg::Cause), 2);
        assert_eq!(trap.machine_previous_privilege(), S);
        let status = trap.read(M, TrapReg::Status);
        assert_eq!(status & StatusFlags::MIE.bits(), 0, "MIE must be cleared");
        assert_ne!(status & StatusFlags::MPIE.bits(), 0, "MPIE must hold the old MIE");
    }

    #[test]
    fn test_trap_return_restores_interrupt_enable() {
        let mut trap = TrapUnit::new();
        trap.write(M, TrapReg::Status, StatusFlags::MIE.bits());
        trap.serve(M, U, exception_cause(Exception::EnvCallFromUMode), 0x4000);

        let (epc, previous) = trap.trap_return(M);
        assert_eq!(epc, 0x4000);
        assert_eq!(previous, U);
        let status = trap.read(M, TrapReg::Status);
        assert_ne!(status & StatusFlags::MIE.bits(), 0, "MIE must be restored from MPIE");
        assert_ne!(status & StatusFlags::MPIE.bits(), 0, "MPIE must be set after return");
        assert_eq!(trap.machine_previous_privilege(), U, "MPP must reset to user");
    }

    #[test]
    fn test_interrupt_cause_has_top_bit() {
        let cause = interrupt_cause(7);
        assert!(cause_is_interrupt(cause));
        assert!(!cause_is_interrupt(exception_cause(Exception::Breakpoint)));
    }
}
