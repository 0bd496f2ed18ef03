//! The two-register console UART
//!
//! Offset 0 is the RX (read) / TX (write) FIFO port, offset 1 the status
//! register with {RXEMPTY, RXIEN, TXEMPTY, TXIEN} at bits {0, 1, 2, 3}.
//! Both FIFOs hold a single byte. The TX path is flushed to stdout when the
//! FIFO fills or a newline is written; the RX interrupt fires while RXIEN is
//! set and the RX FIFO is full, the TX interrupt while TXIEN is set and the
//! TX FIFO is empty.

use super::ConsoleInput;
use fifo::Fifo;
use std::io::Write;
use std::sync::{Arc, Mutex};

const TX_RX_REG: u64 = 0;
const STATUS_REG: u64 = 1;

const RXEMPTY_BIT: u8 = 0;
const RXIEN_BIT: u8 = 1;
const TXEMPTY_BIT: u8 = 2;
const TXIEN_BIT: u8 = 3;

const FIFO_SIZE: usize = 1;

#[derive(Debug)]
struct State {
    rx: Fifo,
    tx: Fifo,
    rx_irq_enabled: bool,
    tx_irq_enabled: bool,
    tx_needs_flush: bool,
}

pub struct SimpleUart {
    state: Arc<Mutex<State>>,
}

/// The RX-side handle held by the stdin reader thread.
#[derive(Clone)]
pub struct SimpleUartInput {
    state: Arc<Mutex<State>>,
}

impl ConsoleInput for SimpleUartInput {
    fn push_byte(&self, byte: u8) {
        let mut state = self.state.lock().unwrap();
        state.rx.push(byte);
    }
}

impl SimpleUart {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rx: Fifo::new(FIFO_SIZE),
                tx: Fifo::new(FIFO_SIZE),
                rx_irq_enabled: false,
                tx_irq_enabled: false,
                tx_needs_flush: false,
            })),
        }
    }

    pub fn input(&self) -> SimpleUartInput {
        SimpleUartInput {
            state: self.state.clone(),
        }
    }

    pub fn read(&mut self, offset: u64, len: usize) -> u64 {
        if len != 1 {
            log::warn!("uart: only byte reads are supported, got {}", len);
            return 0;
        }
        let mut state = self.state.lock().unwrap();
        match offset {
            TX_RX_REG => state.rx.pop().unwrap_or(0) as u64,
            STATUS_REG => {
                let mut status = 0u8;
                status |= (state.rx.is_empty() as u8) << RXEMPTY_BIT;
                status |= (state.rx_irq_enabled as u8) << RXIEN_BIT;
                status |= (state.tx.is_empty() as u8) << TXEMPTY_BIT;
                status |= (state.tx_irq_enabled as u8) << TXIEN_BIT;
                status as u64
            }
            _ => 0,
        }
    }

    pub fn write(&mut self, offset: u64, value: u64, len: usize) {
        if len != 1 {
            log::warn!("uart: only byte writes are supported, got {}", len);
            return;
        }
        let byte = value as u8;
        let mut state = self.state.lock().unwrap();
        match offset {
            TX_RX_REG => {
                state.tx.push(byte);
                if byte == b'\n' {
                    state.tx_needs_flush = true;
                }
            }
            STATUS_REG => {
                state.rx_irq_enabled = byte & (1 << RXIEN_BIT) != 0;
                state.tx_irq_enabled = byte & (1 << TXIEN_BIT) != 0;
            }
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

        if state.rx_irq_enabled && state.rx.is_full() {
            return true;
        }
        if state.tx_irq_enabled && state.tx.is_empty() {
            return true;
        }
        false
    }
}

impl Default for SimpleUart {
    fn default() -> Self {
        Self::new()
    }
}
