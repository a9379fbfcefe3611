//! 8250-style UART mock
//!
//! Enough for firmware blocking putc/getc polling loops: writes to THR are
//! collected as output, LSR always reads transmitter-empty. No divisor
//! modelling, no interrupts.

use serde::{Deserialize, Serialize};

use crate::memory::Bus;

// Register offsets
const UART_THR: u32 = 0; // Out: Transmitter Holding Register
const UART_LSR: u32 = 5; // In:  Line Status Register

// Line Status Register bits
const UART_LSR_TEMT: u32 = 0x40; // Transmitter empty
const UART_LSR_THRE: u32 = 0x20; // Transmit-hold-register empty

/// Mock UART device
#[derive(Default, Serialize, Deserialize)]
pub struct Uart {
    tx_buffer: Vec<u8>,
}

impl Uart {
    pub fn new() -> Self {
        Uart::default()
    }

    /// Drain the bytes written to THR since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx_buffer)
    }
}

impl Bus for Uart {
    fn r8(&mut self, addr: u32) -> Option<u8> {
        if addr == UART_LSR {
            // Transmission is instantaneous from the guest's point of view
            Some((UART_LSR_TEMT | UART_LSR_THRE) as u8)
        } else {
            Some(0)
        }
    }

    fn w8(&mut self, addr: u32, data: u8) -> bool {
        if addr == UART_THR {
            self.tx_buffer.push(data);
        }
        true
    }

    fn r16(&mut self, addr: u32) -> Option<u16> {
        self.r8(addr).map(u16::from)
    }

    fn w16(&mut self, addr: u32, data: u16) -> bool {
        self.w8(addr, data as u8)
    }

    fn r32(&mut self, addr: u32) -> Option<u32> {
        self.r8(addr).map(u32::from)
    }

    fn w32(&mut self, addr: u32, data: u32) -> bool {
        self.w8(addr, data as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thr_collects_output() {
        let mut uart = Uart::new();
        assert!(uart.w8(UART_THR, b'h'));
        assert!(uart.w8(UART_THR, b'i'));
        assert_eq!(uart.take_output(), b"hi");
        assert!(uart.take_output().is_empty());
    }

    #[test]
    fn test_lsr_reads_transmitter_empty() {
        let mut uart = Uart::new();
        assert_eq!(uart.r8(UART_LSR), Some(0x60));
        assert_eq!(uart.r8(0), Some(0));
    }
}
