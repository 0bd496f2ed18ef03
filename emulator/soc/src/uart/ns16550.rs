//! A 16550 compatible UART
//!
//! Single-byte access to offsets 0..=7 with the classical register map:
//! RX/TX (or the divisor latch with DLAB set) at 0, IER/DLM at 1, IIR/FCR at
//! 2, LCR at 3, MCR at 4, LSR at 5, MSR at 6 and scratch at 7. Transmission
//! is line buffered to stdout. The divisor latch registers are accepted and
//! ignored; requesting FCR DMA mode is fatal.

use super::ConsoleInput;
use fifo::Fifo;
use std::io::Write;
use std::sync::{Arc, Mutex};

const REG_RX_TX_DLL: u64 = 0;
const REG_IER_DLM: u64 = 1;
const REG_IIR_FCR: u64 = 2;
const REG_LCR: u64 = 3;
const REG_MCR: u64 = 4;
const REG_LSR: u64 = 5;
const REG_MSR: u64 = 6;
const REG_SCRATCH: u64 = 7;

/// IIR interrupt identifications, highest priority first.
const IIR_RX_LINE_STATUS: u8 = 0xC;
const IIR_RX_DATA_AVAILABLE: u8 = 0x4;
const IIR_TX_HOLDING_EMPTY: u8 = 0x2;
const IIR_NO_IRQ_PENDING: u8 = 0x1;

const FIFO_SIZE: usize = 16;

#[derive(Debug)]
struct State {
    rx: Fifo,
    tx: Fifo,

    dlab: bool,
    fifo_enabled: bool,
    lcr: u8,
    scratch: u8,

    irq_rx_data_available: bool,
    irq_tx_holding_empty: bool,
    irq_line_status: bool,
    irq_modem_status: bool,

    /// RX FIFO fill level that triggers the data-available interrupt.
    rx_irq_fifo_level: usize,
    /// A character arrived since the last LSR read.
    lsr_change: bool,
    /// The THR-empty interrupt stops retriggering once its IIR id was read,
    /// until the next transmit.
    tx_stop_triggering: bool,
    tx_needs_flush: bool,
    iir: u8,
}

pub struct Ns16550 {
    state: Arc<Mutex<State>>,
}

#[derive(Clone)]
pub struct Ns16550Input {
    state: Arc<Mutex<State>>,
}

impl ConsoleInput for Ns16550Input {
    fn push_byte(&self, byte: u8) {
        let mut state = self.state.lock().unwrap();
        state.rx.push(byte);
        state.lsr_change = true;
    }
}

impl Ns16550 {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rx: Fifo::new(FIFO_SIZE),
                tx: Fifo::new(FIFO_SIZE),
                dlab: false,
                fifo_enabled: false,
                lcr: 0,
                scratch: 0,
                irq_rx_data_available: false,
                irq_tx_holding_empty: false,
                irq_line_status: false,
                irq_modem_status: false,
                rx_irq_fifo_level: 1,
                lsr_change: false,
                tx_stop_triggering: false,
                tx_needs_flush: false,
                iir: IIR_NO_IRQ_PENDING,
            })),
        }
    }

    pub fn input(&self) -> Ns16550Input {
        Ns16550Input {
            state: self.state.clone(),
        }
    }

    pub fn read(&mut self, offset: u64, len: usize) -> u64 {
        if len != 1 {
            log::warn!("16550: only byte reads are supported, got {}", len);
            return 0;
        }
        let mut state = self.state.lock().unwrap();
        let value = match offset {
            REG_RX_TX_DLL => {
                if state.dlab {
                    0
                } else {
                    state.rx.pop().unwrap_or(0)
                }
            }
            REG_IER_DLM => {
                if state.dlab {
                    0
                } else {
                    (state.irq_rx_data_available as u8)
                        | (state.irq_tx_holding_empty as u8) << 1
                        | (state.irq_line_status as u8) << 2
                        | (state.irq_modem_status as u8) << 3
                }
            }
            REG_IIR_FCR => {
                let iir = state.iir;
                if iir == IIR_TX_HOLDING_EMPTY {
                    // reading the id acknowledges the THR-empty interrupt
                    state.iir = IIR_NO_IRQ_PENDING;
                    state.tx_stop_triggering = true;
                }
                iir
            }
            REG_LCR => state.lcr,
            REG_MCR => 0x8,
            REG_LSR => {
                let data_ready = !state.rx.is_empty();
                let thr_empty = state.tx.is_empty();
                state.lsr_change = false;
                (data_ready as u8) | (thr_empty as u8) << 5 | (thr_empty as u8) << 6
            }
            REG_MSR => 0xB0,
            REG_SCRATCH => state.scratch,
            _ => 0,
        };
        value as u64
    }

    pub fn write(&mut self, offset: u64, value: u64, len: usize) {
        if len != 1 {
            log::warn!("16550: only byte writes are supported, got {}", len);
            return;
        }
        let byte = value as u8;
        let mut state = self.state.lock().unwrap();
        match offset {
            REG_RX_TX_DLL => {
                if !state.dlab {
                    state.tx.push(byte);
                    if !state.fifo_enabled || byte == b'\n' {
                        state.tx_needs_flush = true;
                    }
                    state.tx_stop_triggering = false;
                }
                // divisor latch low: accepted and ignored
            }
            REG_IER_DLM => {
                if !state.dlab {
                    state.irq_rx_data_available = byte & 0x1 != 0;
                    state.irq_tx_holding_empty = byte & 0x2 != 0;
                    state.irq_line_status = byte & 0x4 != 0;
                    state.irq_modem_status = byte & 0x8 != 0;
                }
            }
            REG_IIR_FCR => {
                if byte & 0x8 != 0 {
                    // the guest kernel would silently lose data from here on
                    panic!("16550: DMA mode is not supported");
                }
                if byte & 0x2 != 0 {
                    state.rx.clear();
                }
                if byte & 0x4 != 0 {
                    state.tx.clear();
                }
                state.fifo_enabled = byte & 0x1 != 0;
                state.rx_irq_fifo_level = match (byte >> 6) & 0x3 {
                    3 => 14,
                    2 => 8,
                    1 => 4,
                    _ => 1,
                };
            }
            REG_LCR => {
                state.lcr = byte;
                state.dlab = byte & 0x80 != 0;
            }
            REG_MCR => {}
            REG_SCRATCH => state.scratch = byte,
            _ => {}
        }
    }

    /// Flush pending transmit data and sample the interrupt line.
    pub fn update(&mut self) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.tx.is_full() || state.tx_needs_flush {
            let stdout = std::io::stdout();
            let mut stdout = stdout.lock();
            for byte in state.tx.drain() {
                let _ = stdout.write_all(&[byte]);
            }
            let _ = stdout.flush();
            state.tx_needs_flush = false;
        }

        let irq = if (state.irq_line_status || state.irq_rx_data_available) && state.lsr_change {
            state.iir = IIR_RX_LINE_STATUS;
            true
        } else if state.irq_rx_data_available && state.rx.len() >= state.rx_irq_fifo_level {
            state.iir = IIR_RX_DATA_AVAILABLE;
            true
        } else if state.irq_tx_holding_empty && state.tx.is_empty() && !state.tx_stop_triggering {
            state.iir = IIR_TX_HOLDING_EMPTY;
            true
        } else {
            state.iir = IIR_NO_IRQ_PENDING;
            false
        };
        irq
    }
}

impl Default for Ns16550 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lsr_reports_data_ready_and_thr_empty() {
        let mut uart = Ns16550::new();
        let lsr = uart.read(REG_LSR, 1) as u8;
        assert_eq!(lsr & 0x1, 0, "no data yet");
        assert_ne!(lsr & 0x20, 0, "thr starts empty");

        uart.input().push_byte(b'a');
        let lsr = uart.read(REG_LSR, 1) as u8;
        assert_ne!(lsr & 0x1, 0);
    }

    #[test]
    fn test_rx_data_available_interrupt() {
        let mut uart = Ns16550::new();
        uart.write(REG_IER_DLM, 0x1, 1);
        assert!(!uart.update());

        uart.input().push_byte(b'a');
        assert!(uart.update());
        // the line-status id wins while the lsr change is unacknowledged
        assert_eq!(uart.read(REG_IIR_FCR, 1) as u8, IIR_RX_LINE_STATUS);

        // after reading LSR and draining RX the interrupt is gone
        uart.read(REG_LSR, 1);
        uart.read(REG_RX_TX_DLL, 1);
        assert!(!uart.update());
    }

    #[test]
    fn test_thr_empty_interrupt_stops_after_iir_read() {
        let mut uart = Ns16550::new();
        uart.write(REG_IER_DLM, 0x2, 1);

        assert!(uart.update());
        assert_eq!(uart.read(REG_IIR_FCR, 1) as u8, IIR_TX_HOLDING_EMPTY);
        // acknowledged: no retrigger while nothing is transmitted
        assert!(!uart.update());

        // transmitting re-arms the interrupt
        uart.write(REG_RX_TX_DLL, b'\n' as u64, 1);
        assert!(uart.update());
    }

    #[test]
    fn test_dlab_redirects_the_low_registers() {
        let mut uart = Ns16550::new();
        uart.write(REG_LCR, 0x80, 1);
        // divisor latch writes must not transmit anything
        uart.write(REG_RX_TX_DLL, 0x42, 1);
        uart.write(REG_IER_DLM, 0x42, 1);
        uart.write(REG_LCR, 0x00, 1);

        assert_eq!(uart.read(REG_IER_DLM, 1), 0, "ier was shadowed by dlab");
        let lsr = uart.read(REG_LSR, 1) as u8;
        assert_ne!(lsr & 0x20, 0, "tx fifo must still be empty");
    }

    #[test]
    fn test_fcr_clears_fifos_and_sets_trigger_level() {
        let mut uart = Ns16550::new();
        uart.write(REG_IER_DLM, 0x1, 1);
        uart.write(REG_IIR_FCR, 0x1 | (1 << 6), 1); // fifo on, level 4
        uart.read(REG_LSR, 1); // clear the lsr-change marker

        for byte in 0..3 {
            uart.input().push_byte(byte);
        }
        uart.read(REG_LSR, 1);
        assert!(!uart.update(), "below the trigger level");

        uart.input().push_byte(3);
        uart.read(REG_LSR, 1);
        assert!(uart.update());

        // clearing the rx fifo drops the condition
        uart.write(REG_IIR_FCR, 0x1 | 0x2, 1);
        uart.read(REG_LSR, 1);
        assert!(!uart.update());
    }

    #[test]
    #[should_panic(expected = "DMA mode")]
    fn test_fcr_dma_mode_is_fatal() {
        let mut uart = Ns16550::new();
        uart.write(REG_IIR_FCR, 0x8, 1);
    }

    #[test]
    fn test_scratch_register_roundtrip() {
        let mut uart = Ns16550::new();
        uart.write(REG_SCRATCH, 0x5A, 1);
        assert_eq!(uart.read(REG_SCRATCH, 1), 0x5A);
    }
}
