//! Testbench I/O port
//!
//! Three word registers: offset 0 prints a byte, offset 4 prints a word in
//! hex, offset 8 requests exit with the written value as exit code. Only
//! word writes are decoded; everything else is a bus error.

use serde::{Deserialize, Serialize};

use crate::memory::Bus;

const TBIO_PUTC: u32 = 0x0;
const TBIO_PUTWORD: u32 = 0x4;
const TBIO_EXIT: u32 = 0x8;

/// Testbench exit/print port
#[derive(Default, Serialize, Deserialize)]
pub struct TbIo {
    output: Vec<u8>,
    exit_code: Option<u32>,
}

impl TbIo {
    pub fn new() -> Self {
        TbIo::default()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Exit code written by the guest, if any.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }
}

impl Bus for TbIo {
    fn r8(&mut self, _addr: u32) -> Option<u8> {
        None
    }

    fn w8(&mut self, _addr: u32, _data: u8) -> bool {
        false
    }

    fn r16(&mut self, _addr: u32) -> Option<u16> {
        None
    }

    fn w16(&mut self, _addr: u32, _data: u16) -> bool {
        false
    }

    fn r32(&mut self, _addr: u32) -> Option<u32> {
        None
    }

    fn w32(&mut self, addr: u32, data: u32) -> bool {
        match addr {
            TBIO_PUTC => {
                self.output.push(data as u8);
                true
            }
            TBIO_PUTWORD => {
                self.output.extend_from_slice(format!("{:08x}\n", data).as_bytes());
                true
            }
            TBIO_EXIT => {
                self.exit_code = Some(data);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_putc_putword() {
        let mut io = TbIo::new();
        assert!(io.w32(TBIO_PUTC, b'!' as u32));
        assert!(io.w32(TBIO_PUTWORD, 0xdeadbeef));
        assert_eq!(io.take_output(), b"!deadbeef\n");
    }

    #[test]
    fn test_exit_latch() {
        let mut io = TbIo::new();
        assert_eq!(io.exit_code(), None);
        assert!(io.w32(TBIO_EXIT, 42));
        assert_eq!(io.exit_code(), Some(42));
    }

    #[test]
    fn test_reads_are_bus_errors() {
        let mut io = TbIo::new();
        assert_eq!(io.r32(0), None);
        assert!(!io.w8(0, 1));
    }
}
