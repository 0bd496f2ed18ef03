//! Hart state and the per-step run loop
//!
//! One [`Hart::step`] call advances the hart by exactly one retired
//! instruction or one trap entry. The caller owns the bus and the
//! peripherals; the hart borrows the bus for the duration of the step and,
//! separately, has its interrupt wires sampled through
//! [`Hart::process_interrupts`] after every step.

use crate::csr::{Backing, CsrAccessError, CsrFile};
use crate::decode::decode;
use crate::mmu::{Mmu, MmuFault};
use crate::pmp::Pmp;
use crate::trap::{exception_cause, interrupt_cause, Exception, TrapUnit};
use crate::{AccessType, Bus, PrivilegeLevel, XlenU};

pub struct Hart {
    pub(crate) privilege: PrivilegeLevel,
    cycle: u64,

    pub(crate) x: [XlenU; 32],
    pub(crate) pc: XlenU,
    /// Target of a taken branch, jump or xRET; `None` advances to PC + 4.
    pub(crate) next_pc: Option<XlenU>,

    /// The instruction word currently being executed.
    pub(crate) instruction: u32,

    /// At most one synchronous trap is latched per step; later trap-causing
    /// operations of the same instruction are ignored.
    sync_trap: Option<Exception>,

    /// Address of a valid load reservation, if any.
    pub(crate) reservation: Option<XlenU>,

    pub(crate) csr: CsrFile,
    pub(crate) trap: TrapUnit,
    pub(crate) pmp: Pmp,
    pub(crate) mmu: Mmu,
}

impl Hart {
    /// Create a hart in reset state: machine mode, PC at the reset vector,
    /// everything else zero.
    pub fn new(reset_pc: XlenU) -> Self {
        Hart {
            privilege: PrivilegeLevel::Machine,
            cycle: 0,
            x: [0; 32],
            pc: reset_pc,
            next_pc: None,
            instruction: 0,
            sync_trap: None,
            reservation: None,
            csr: CsrFile::new(),
            trap: TrapUnit::new(),
            pmp: Pmp::new(),
            mmu: Mmu::new(),
        }
    }

    pub fn pc(&self) -> XlenU {
        self.pc
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn register(&self, index: usize) -> XlenU {
        self.x[index]
    }

    /// Overwrite a general purpose register. Mainly useful for tests and for
    /// preparing a hart state outside of reset.
    pub fn set_register(&mut self, index: usize, value: XlenU) {
        self.x[index] = value;
        self.x[0] = 0;
    }

    pub fn trap_unit(&self) -> &TrapUnit {
        &self.trap
    }

    pub fn trap_unit_mut(&mut self) -> &mut TrapUnit {
        &mut self.trap
    }

    /// Latch a synchronous trap for this step, first cause wins.
    pub(crate) fn raise(&mut self, cause: Exception) {
        if self.sync_trap.is_none() {
            self.sync_trap = Some(cause);
        }
    }

    /// Advance by one retired instruction or one latched trap cause.
    pub fn step(&mut self, bus: &mut dyn Bus) {
        self.next_pc = None;

        if let Ok(word) = self.fetch(bus) {
            self.instruction = word;
            match decode(word) {
                Ok(decoded) => self.execute(bus, &decoded),
                Err(_) => {
                    log::debug!(
                        "illegal instruction {:#010x} at pc {:#x}",
                        word,
                        self.pc
                    );
                    self.raise(Exception::IllegalInstruction);
                }
            }
        }

        // register 0 is hardwired to zero no matter what execution wrote
        self.x[0] = 0;

        self.pc = match self.next_pc.take() {
            Some(target) => target,
            None => self.pc.wrapping_add(4),
        };
        self.cycle += 1;
    }

    /// Sample the interrupt wires and take a pending interrupt or the
    /// latched synchronous trap, overriding the PC chosen by the step.
    pub fn process_interrupts(&mut self, mei: bool, msi: bool, mti: bool) {
        self.trap.set_pending_wires(mei, msi, mti);

        if let Some((target, cause)) = self.trap.pending_interrupt(self.privilege) {
            // for interrupts the saved PC is the next instruction
            let vector = self
                .trap
                .serve(target, self.privilege, interrupt_cause(cause), self.pc);
            self.enter_trap(target, vector);
            return;
        }

        if let Some(cause) = self.sync_trap.take() {
            let target = self.trap.exception_target(self.privilege, cause);
            // the PC has already advanced past the faulting instruction
            let epc = self.pc.wrapping_sub(4);
            let vector = self
                .trap
                .serve(target, self.privilege, exception_cause(cause), epc);
            self.enter_trap(target, vector);
        }
    }

    fn enter_trap(&mut self, target: PrivilegeLevel, vector: XlenU) {
        self.privilege = target;
        self.pc = vector;
        // a trap breaks any load reservation
        self.reservation = None;
    }

    /// The privilege level governing data accesses: `mstatus.MPP` while
    /// `MPRV` is set, the current level otherwise.
    fn data_privilege(&self) -> PrivilegeLevel {
        if self.trap.mprv() {
            self.trap.machine_previous_privilege()
        } else {
            self.privilege
        }
    }

    /// Translate, PMP-check and route one access. On failure the matching
    /// trap cause for `kind` is latched and `Err` returned.
    fn access(
        &mut self,
        bus: &mut dyn Bus,
        effective: PrivilegeLevel,
        vaddr: XlenU,
        value: Option<XlenU>,
        len: usize,
        kind: AccessType,
    ) -> Result<XlenU, ()> {
        let page_fault = match kind {
            AccessType::Read => Exception::LoadPageFault,
            AccessType::Write => Exception::StorePageFault,
            AccessType::Fetch => Exception::InstructionPageFault,
        };
        let access_fault = match kind {
            AccessType::Read => Exception::LoadAccessFault,
            AccessType::Write => Exception::StoreAccessFault,
            AccessType::Fetch => Exception::InstructionAccessFault,
        };

        let Hart { mmu, pmp, trap, .. } = &mut *self;
        let translated =
            mmu.translate(effective, vaddr, kind, trap.sum(), trap.mxr(), |pte_addr| {
                // the implicit PTE reads are PMP-checked physical reads
                pmp.check(effective, pte_addr, 4, AccessType::Read)
                    .map_err(|_| ())?;
                bus.read(pte_addr, 4).map_err(|_| ())
            });
        let phys = match translated {
            Ok(phys) => phys,
            Err(fault) => {
                self.raise(match fault {
                    MmuFault::PageFault => page_fault,
                    MmuFault::AccessFault => access_fault,
                });
                return Err(());
            }
        };

        if self.pmp.check(effective, phys, len, kind).is_err() {
            self.raise(access_fault);
            return Err(());
        }

        let result = match value {
            Some(value) => bus.write(phys, value as u64, len).map(|_| 0),
            None => bus.read(phys, len).map(|v| v as XlenU),
        };
        result.map_err(|err| {
            log::warn!("bus error: {}", err);
            self.raise(access_fault);
        })
    }

    fn fetch(&mut self, bus: &mut dyn Bus) -> Result<u32, ()> {
        // fetches are unaffected by MPRV and always use the hart's privilege
        self.access(bus, self.privilege, self.pc, None, 4, AccessType::Fetch)
            .map(|word| word as u32)
    }

    /// A checked data load of `len` bytes, zero-extended.
    pub(crate) fn load(&mut self, bus: &mut dyn Bus, vaddr: XlenU, len: usize) -> Result<XlenU, ()> {
        self.access(bus, self.data_privilege(), vaddr, None, len, AccessType::Read)
    }

    /// A checked data store of the low `len` bytes of `value`.
    pub(crate) fn store(
        &mut self,
        bus: &mut dyn Bus,
        vaddr: XlenU,
        value: XlenU,
        len: usize,
    ) -> Result<(), ()> {
        self.access(
            bus,
            self.data_privilege(),
            vaddr,
            Some(value),
            len,
            AccessType::Write,
        )
        .map(|_| ())
    }

    /// Read a CSR at the current privilege level.
    pub(crate) fn csr_read(&self, addr: u16) -> Result<XlenU, CsrAccessError> {
        let entry = self.csr.check_read(self.privilege, addr)?;
        let value = match entry.backing {
            Backing::Value => entry.value,
            Backing::Trap(level, reg) => self.trap.read(level, reg),
            Backing::PmpCfg(reg) => self.pmp.read_cfg(reg),
            Backing::PmpAddr(reg) => self.pmp.read_addr(reg),
            Backing::Satp => self.mmu.satp(),
        };
        Ok(value)
    }

    /// Write a CSR at the current privilege level, applying the write mask.
    ///
    /// A write to a register without write permission is dropped; the read
    /// half of the CSR instruction has already passed the access check.
    pub(crate) fn csr_write(&mut self, addr: u16, value: XlenU) {
        match self.csr.check_write(self.privilege, addr, value) {
            Ok((backing, masked)) => match backing {
                Backing::Value => self.csr.store(addr, masked),
                Backing::Trap(level, reg) => self.trap.write(level, reg, masked),
                Backing::PmpCfg(reg) => self.pmp.write_cfg(reg, masked),
                Backing::PmpAddr(reg) => self.pmp.write_addr(reg, masked),
                Backing::Satp => self.mmu.set_satp(masked),
            },
            Err(_) => {
                log::debug!("dropping write to read-only csr {:#x}", addr);
            }
        }
    }

    /// Return from a trap taken at `level` (the register half of xRET).
    pub(crate) fn trap_return(&mut self, level: PrivilegeLevel) {
        let (epc, previous) = self.trap.trap_return(level);
        self.next_pc = Some(epc);
        self.privilege = previous;
    }

    /// Dump the architectural register state at trace level.
    pub fn dump_registers(&self) {
        log::trace!("pc: {:#018x} instr: {:#010x}", self.pc, self.instruction);
        for (i, value) in self.x.iter().enumerate() {
            log::trace!("x[{:2}]: {:#018x}", i, value);
        }
    }
}
