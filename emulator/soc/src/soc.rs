//! SoC assembly and the run loop
//!
//! Builds the qemu-virt-like memory map around one hart, installs the reset
//! vector, firmware and device tree, and steps the machine: one instruction,
//! then the UART, PLIC and CLINT updates whose wires feed the hart's
//! interrupt processing before the next step.

use crate::uart::ConsoleInput;
use crate::{Memory, SystemBus};
use hart::{Hart, XlenU};
use thiserror::Error;

pub const MROM_BASE: u64 = 0x1000;
pub const MROM_SIZE: u64 = 0xF000;
pub const CLINT_BASE: u64 = 0x200_0000;
pub const CLINT_SIZE: u64 = 0x10000;
pub const SIMPLE_UART_BASE: u64 = 0x300_0000;
pub const SIMPLE_UART_SIZE: u64 = 0x2;
pub const PLIC_BASE: u64 = 0xC00_0000;
pub const PLIC_SIZE: u64 = 0x3FF_F004;
pub const NS16550_BASE: u64 = 0x1000_0000;
pub const NS16550_SIZE: u64 = 0xC;
pub const DRAM_BASE: u64 = 0x8000_0000;
pub const DRAM_SIZE: u64 = 128 * 1024 * 1024;

/// The PLIC source the console UART interrupt is wired to.
pub const UART_IRQ: u32 = 10;

const MIB: u64 = 0x10_0000;

/// Which UART model acts as the console: receives stdin and drives the PLIC
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleKind {
    #[default]
    Simple,
    Ns16550,
}

#[derive(Debug, Error)]
pub enum SocError {
    #[error("firmware image ({0} bytes) does not fit into {DRAM_SIZE} bytes of dram")]
    FirmwareTooLarge(usize),
    #[error("device tree blob ({0} bytes) does not fit into dram")]
    DtbTooLarge(usize),
}

pub struct Soc {
    pub hart: Hart,
    pub bus: SystemBus,
    console: ConsoleKind,
}

impl Soc {
    /// Build the SoC with the firmware at the DRAM base and the optional
    /// device tree blob near the high end of DRAM, aligned down to 2 MiB.
    pub fn new(firmware: &[u8], dtb: Option<&[u8]>, console: ConsoleKind) -> Result<Self, SocError> {
        if firmware.len() as u64 > DRAM_SIZE {
            return Err(SocError::FirmwareTooLarge(firmware.len()));
        }

        let mut dram = Memory::new(DRAM_SIZE as usize);
        dram.load(0, firmware);

        let mut fdt_addr = 0u64;
        if let Some(dtb) = dtb {
            let end = DRAM_BASE + DRAM_SIZE;
            fdt_addr = (end - dtb.len() as u64) & !(2 * MIB - 1);
            if fdt_addr < DRAM_BASE {
                return Err(SocError::DtbTooLarge(dtb.len()));
            }
            dram.load((fdt_addr - DRAM_BASE) as usize, dtb);
        }

        let mut mrom = Memory::new(MROM_SIZE as usize);
        write_reset_vector(&mut mrom, DRAM_BASE, fdt_addr);

        let mut bus = SystemBus::new(mrom, dram);
        bus.map_dram(DRAM_BASE);
        bus.map_clint(CLINT_BASE, CLINT_SIZE);
        bus.map_plic(PLIC_BASE, PLIC_SIZE);
        bus.map_simple_uart(SIMPLE_UART_BASE, SIMPLE_UART_SIZE);
        bus.map_ns16550(NS16550_BASE, NS16550_SIZE);
        bus.map_mrom(MROM_BASE);

        log::debug!(
            "soc initialized: {} bytes firmware, dtb at {:#x}",
            firmware.len(),
            fdt_addr
        );

        Ok(Self {
            hart: Hart::new(MROM_BASE as XlenU),
            bus,
            console,
        })
    }

    /// The handle the stdin reader thread uses to feed the console.
    pub fn console_input(&self) -> Box<dyn ConsoleInput> {
        match self.console {
            ConsoleKind::Simple => Box::new(self.bus.simple_uart.input()),
            ConsoleKind::Ns16550 => Box::new(self.bus.ns16550.input()),
        }
    }

    /// One iteration of the run loop: step the hart, update the peripherals
    /// and let their wires feed the trap engine.
    pub fn step(&mut self) {
        self.hart.step(&mut self.bus);

        let simple_irq = self.bus.simple_uart.update();
        let ns16550_irq = self.bus.ns16550.update();
        let uart_irq = match self.console {
            ConsoleKind::Simple => simple_irq,
            ConsoleKind::Ns16550 => ns16550_irq,
        };

        self.bus.plic.set_pending(UART_IRQ, uart_irq);
        let mei = self.bus.plic.update();
        let (msi, mti) = self.bus.clint.update();

        self.hart.process_interrupts(mei, msi, mti);
    }

    /// Run until the PC hits `success_pc` or the cycle counter reaches
    /// `max_cycles` (zero disables the bound).
    pub fn run(&mut self, success_pc: Option<XlenU>, max_cycles: u64) {
        loop {
            self.step();

            if Some(self.hart.pc()) == success_pc {
                log::debug!("success pc {:#x} reached", self.hart.pc());
                break;
            }
            if max_cycles != 0 && self.hart.cycle() >= max_cycles {
                log::debug!("cycle bound {} reached", max_cycles);
                break;
            }
        }
    }
}

/// The reset vector the hart starts at, as qemu's virt machine lays it out:
/// load the hart id into a0 and the device tree address into a1, then jump
/// to the start address. The two address slots after the code are read with
/// XLEN-sized loads.
fn write_reset_vector(mrom: &mut Memory, start_addr: u64, fdt_addr: u64) {
    #[cfg(not(feature = "rv32"))]
    let load_slots: [u32; 2] = [
        0x0202B583, // ld a1, 32(t0)
        0x0182B283, // ld t0, 24(t0)
    ];
    #[cfg(feature = "rv32")]
    let load_slots: [u32; 2] = [
        0x0202A583, // lw a1, 32(t0)
        0x0182A283, // lw t0, 24(t0)
    ];

    let reset_vec: [u32; 10] = [
        0x00000297, // auipc t0, 0
        0x02828613, // addi a2, t0, 40
        0xF1402573, // csrr a0, mhartid
        load_slots[0],
        load_slots[1],
        0x00028067, // jr t0
        start_addr as u32,
        (start_addr >> 32) as u32,
        fdt_addr as u32,
        (fdt_addr >> 32) as u32,
    ];

    for (i, word) in reset_vec.iter().enumerate() {
        mrom.write(i as u64 * 4, *word as u64, 4);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hart::PrivilegeLevel;

    fn firmware_words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Step until the hart has left the reset vector and executed `steps`
    /// firmware instructions.
    fn run_firmware(soc: &mut Soc, steps: usize) {
        while soc.hart.pc() < DRAM_BASE as XlenU {
            soc.step();
        }
        for _ in 0..steps {
            soc.step();
        }
    }

    #[test]
    fn test_reset_vector_reaches_the_firmware() {
        let firmware = firmware_words(&[0x00000013]); // nop
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();

        assert_eq!(soc.hart.pc(), MROM_BASE as XlenU);
        assert_eq!(soc.hart.privilege(), PrivilegeLevel::Machine);

        run_firmware(&mut soc, 0);
        assert_eq!(soc.hart.pc(), DRAM_BASE as XlenU);
        // a0 holds the hart id
        assert_eq!(soc.hart.register(10), 0);
    }

    #[test]
    fn test_dtb_lands_at_an_aligned_address_in_a1() {
        let firmware = firmware_words(&[0x00000013]);
        let dtb = vec![0xD7u8; 0x400];
        let mut soc = Soc::new(&firmware, Some(&dtb), ConsoleKind::Simple).unwrap();

        run_firmware(&mut soc, 0);
        let fdt_addr = soc.hart.register(11) as u64;
        assert_eq!(fdt_addr % (2 * MIB), 0);
        assert!(fdt_addr >= DRAM_BASE && fdt_addr < DRAM_BASE + DRAM_SIZE);

        use hart::Bus;
        assert_eq!(soc.bus.read(fdt_addr, 1).unwrap(), 0xD7);
    }

    #[test]
    fn test_addi_chain_firmware() {
        let firmware = firmware_words(&[
            0x00500513, // addi x10, x0, 5
            0x00350513, // addi x10, x10, 3
        ]);
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();
        run_firmware(&mut soc, 2);

        assert_eq!(soc.hart.register(10), 8);
        assert_eq!(soc.hart.pc(), (DRAM_BASE + 8) as XlenU);
    }

    #[test]
    fn test_run_stops_at_the_success_pc() {
        let firmware = firmware_words(&[
            0x00000013, // nop
            0x00000013, // nop
            0x0000006F, // j .
        ]);
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();
        soc.run(Some((DRAM_BASE + 8) as XlenU), 0);
        assert_eq!(soc.hart.pc(), (DRAM_BASE + 8) as XlenU);
    }

    #[test]
    fn test_run_honours_the_cycle_bound() {
        let firmware = firmware_words(&[0x0000006F]); // j .
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();
        soc.run(None, 100);
        assert_eq!(soc.hart.cycle(), 100);
    }

    #[test]
    fn test_oversized_firmware_is_rejected() {
        let firmware = vec![0u8; DRAM_SIZE as usize + 1];
        assert!(matches!(
            Soc::new(&firmware, None, ConsoleKind::Simple),
            Err(SocError::FirmwareTooLarge(_))
        ));
    }

    #[test]
    fn test_software_interrupt_via_msip() {
        let firmware = firmware_words(&[
            0x00000297, // auipc t0, 0
            0x02428293, // addi t0, t0, 36          (handler below)
            0x30529073, // csrw mtvec, t0
            0x00800293, // addi t0, x0, 8           (MSIE)
            0x30429073, // csrw mie, t0
            0x00800293, // addi t0, x0, 8           (MIE)
            0x30029073, // csrw mstatus, t0
            0x0000006F, // j .
            0x00000013, // nop
            0x0000006F, // handler: j .
        ]);
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();
        // raise the software interrupt the way another agent would, through
        // the msip register
        soc.bus.clint.write(0x0000, 1, 4);

        for _ in 0..64 {
            soc.step();
        }

        let cause = soc
            .hart
            .trap_unit()
            .read(PrivilegeLevel::Machine, hart::trap::TrapReg::Cause);
        assert_eq!(cause, hart::trap::interrupt_cause(3));
    }

    #[test]
    fn test_console_bytes_flow_through_the_bus() {
        use hart::Bus;
        let firmware = firmware_words(&[0x00000013]);
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();

        soc.console_input().push_byte(b'z');
        let status = soc.bus.read(SIMPLE_UART_BASE + 1, 1).unwrap();
        assert_eq!(status & 0x1, 0, "rx must not be empty");
        assert_eq!(soc.bus.read(SIMPLE_UART_BASE, 1).unwrap(), b'z' as u64);
    }

    #[test]
    fn test_uart_rx_interrupt_reaches_the_plic() {
        use hart::Bus;
        let firmware = firmware_words(&[0x00000013]);
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();

        // rx interrupt enable in the uart, source 10 enabled in the plic
        soc.bus.write(SIMPLE_UART_BASE + 1, 0x2, 1).unwrap();
        soc.bus.write(PLIC_BASE + UART_IRQ as u64 * 4, 1, 4).unwrap();
        soc.bus.write(PLIC_BASE + 0x2000, 1 << UART_IRQ, 4).unwrap();

        soc.console_input().push_byte(b'q');
        soc.step();

        // the uart interrupt won arbitration and is claimable
        assert_eq!(
            soc.bus.read(PLIC_BASE + 0x20_0004, 4).unwrap(),
            UART_IRQ as u64
        );
    }

    #[test]
    fn test_machine_timer_interrupt_fires_through_the_clint() {
        // mtvec <- handler; mie.MTIE <- 1; mstatus.MIE <- 1; loop
        let firmware = firmware_words(&[
            0x00000297, // auipc t0, 0
            0x02428293, // addi t0, t0, 36          (handler below)
            0x30529073, // csrw mtvec, t0
            0x08000293, // addi t0, x0, 128         (MTIE)
            0x30429073, // csrw mie, t0
            0x00800293, // addi t0, x0, 8           (MIE)
            0x30029073, // csrw mstatus, t0
            0x0000006F, // j .
            0x00000013, // nop
            0x0000006F, // handler: j .
        ]);
        let mut soc = Soc::new(&firmware, None, ConsoleKind::Simple).unwrap();
        // mtimecmp stays zero, so the timer fires as soon as it is enabled
        for _ in 0..64 {
            soc.step();
        }

        let cause = soc
            .hart
            .trap_unit()
            .read(PrivilegeLevel::Machine, hart::trap::TrapReg::Cause);
        assert_eq!(cause, hart::trap::interrupt_cause(7));
        assert_eq!(soc.hart.pc(), (DRAM_BASE + 36) as XlenU);
    }
}
