//! The address-decoded system bus
//!
//! An ordered table of device windows; the first window containing an access
//! routes it, and devices see addresses relative to their window start. An
//! access that hits no window, or that would span a window boundary, is a
//! bus error which the hart turns into an access fault.

use crate::uart::{Ns16550, SimpleUart};
use crate::{Clint, Memory, Plic};
use hart::{Bus, BusError};

/// The devices a window can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slave {
    Mrom,
    Dram,
    Clint,
    Plic,
    SimpleUart,
    Ns16550,
}

struct Window {
    start: u64,
    size: u64,
    slave: Slave,
}

pub struct SystemBus {
    windows: Vec<Window>,
    pub mrom: Memory,
    pub dram: Memory,
    pub clint: Clint,
    pub plic: Plic,
    pub simple_uart: SimpleUart,
    pub ns16550: Ns16550,
}

impl SystemBus {
    pub fn new(mrom: Memory, dram: Memory) -> Self {
        Self {
            windows: Vec::new(),
            mrom,
            dram,
            clint: Clint::new(),
            plic: Plic::new(),
            simple_uart: SimpleUart::new(),
            ns16550: Ns16550::new(),
        }
    }

    fn map(&mut self, start: u64, size: u64, slave: Slave) {
        self.windows.push(Window { start, size, slave });
    }

    pub fn map_mrom(&mut self, start: u64) {
        let size = self.mrom.size() as u64;
        self.map(start, size, Slave::Mrom);
    }

    pub fn map_dram(&mut self, start: u64) {
        let size = self.dram.size() as u64;
        self.map(start, size, Slave::Dram);
    }

    pub fn map_clint(&mut self, start: u64, size: u64) {
        self.map(start, size, Slave::Clint);
    }

    pub fn map_plic(&mut self, start: u64, size: u64) {
        self.map(start, size, Slave::Plic);
    }

    pub fn map_simple_uart(&mut self, start: u64, size: u64) {
        self.map(start, size, Slave::SimpleUart);
    }

    pub fn map_ns16550(&mut self, start: u64, size: u64) {
        self.map(start, size, Slave::Ns16550);
    }

    /// Find the window containing the whole access.
    fn route(&self, addr: u64, len: usize) -> Option<(u64, Slave)> {
        self.windows
            .iter()
            .find(|w| addr >= w.start && addr + len as u64 <= w.start + w.size)
            .map(|w| (addr - w.start, w.slave))
    }
}

impl Bus for SystemBus {
    fn read(&mut self, addr: u64, len: usize) -> Result<u64, BusError> {
        let (offset, slave) = self.route(addr, len).ok_or(BusError { addr, len })?;
        let value = match slave {
            Slave::Mrom => self.mrom.read(offset, len),
            Slave::Dram => self.dram.read(offset, len),
            Slave::Clint => self.clint.read(offset, len),
            Slave::Plic => self.plic.read(offset, len),
            Slave::SimpleUart => self.simple_uart.read(offset, len),
            Slave::Ns16550 => self.ns16550.read(offset, len),
        };
        Ok(value)
    }

    fn write(&mut self, addr: u64, value: u64, len: usize) -> Result<(), BusError> {
        let (offset, slave) = self.route(addr, len).ok_or(BusError { addr, len })?;
        match slave {
            Slave::Mrom => self.mrom.write(offset, value, len),
            Slave::Dram => self.dram.write(offset, value, len),
            Slave::Clint => self.clint.write(offset, value, len),
            Slave::Plic => self.plic.write(offset, value, len),
            Slave::SimpleUart => self.simple_uart.write(offset, value, len),
            Slave::Ns16550 => self.ns16550.write(offset, value, len),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bus() -> SystemBus {
        let mut bus = SystemBus::new(Memory::new(0x1000), Memory::new(0x1000));
        bus.map_mrom(0x1000);
        bus.map_dram(0x8000_0000);
        bus
    }

    #[test]
    fn test_accesses_are_window_relative() {
        let mut bus = bus();
        bus.write(0x8000_0010, 0xAABB, 2).unwrap();
        assert_eq!(bus.dram.read(0x10, 2), 0xAABB);
        assert_eq!(bus.read(0x8000_0010, 2).unwrap(), 0xAABB);
    }

    #[test]
    fn test_miss_is_a_bus_error() {
        let mut bus = bus();
        assert!(bus.read(0x4000_0000, 4).is_err());
        assert!(bus.write(0x4000_0000, 0, 4).is_err());
    }

    #[test]
    fn test_access_spanning_a_window_edge_is_denied() {
        let mut bus = bus();
        // the last valid word of the rom window
        assert!(bus.read(0x1000 + 0xFFC, 4).is_ok());
        assert!(bus.read(0x1000 + 0xFFE, 4).is_err());
    }

    #[test]
    fn test_first_matching_window_wins() {
        let mut bus = SystemBus::new(Memory::new(0x100), Memory::new(0x100));
        bus.map_mrom(0x1000);
        bus.map_dram(0x1000);
        bus.mrom.write(0, 0x11, 1);
        bus.dram.write(0, 0x22, 1);
        assert_eq!(bus.read(0x1000, 1).unwrap(), 0x11);
    }
}
