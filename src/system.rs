//! System orchestrator
//!
//! Wires the core to RAM and the MMIO peripherals and drives stepping.
//! The memory map follows the reference testbench: RAM at a configurable
//! base, I/O high in the physical space.

use std::io::Write;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::Cpu;
use crate::devices::{MTimer, TbIo, Uart};
use crate::memory::{Bus, Ram};
use crate::snapshot::{self, SnapshotError};

pub const IO_BASE: u32 = 0xe000_0000;
pub const TBIO_BASE: u32 = IO_BASE;
const TBIO_SIZE: u32 = 12;
pub const UART_BASE: u32 = IO_BASE + 0x4000;
const UART_SIZE: u32 = 8;
pub const MTIMER_BASE: u32 = IO_BASE + 0x8000;
const MTIMER_SIZE: u32 = 16;

/// How often the wall-clock timer advances, in executed instructions.
const MTIME_CADENCE: u64 = 0x1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Physical base address of RAM.
    pub ram_base: u32,
    /// RAM size in bytes (word-aligned).
    pub ram_size: u32,
    /// PC value at reset.
    pub reset_vector: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            ram_base: 0x8000_0000,
            ram_size: 256 * 1024 * 1024,
            reset_vector: 0x8000_0000,
        }
    }
}

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("binary spanning {addr:#010x}..{end:#010x} does not fit in RAM ({base:#010x}..{top:#010x})")]
    BinaryOutOfRange {
        addr: u32,
        end: u64,
        base: u32,
        top: u64,
    },
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Outcome of a bounded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The guest wrote the exit port.
    Exit { code: u32, cycles: u64 },
    /// The cycle budget ran out first.
    TimedOut { cycles: u64 },
}

/// A complete single-hart machine.
#[derive(Serialize, Deserialize)]
pub struct System {
    pub cpu: Cpu,
    ram: Ram,
    uart: Uart,
    mtimer: MTimer,
    tbio: TbIo,
    config: SystemConfig,
    cycle: u64,
}

impl System {
    pub fn new(config: SystemConfig) -> Self {
        info!(
            "system: {} KiB RAM at {:#010x}, reset vector {:#010x}",
            config.ram_size / 1024,
            config.ram_base,
            config.reset_vector
        );
        System {
            cpu: Cpu::new(config.reset_vector),
            ram: Ram::new(config.ram_size),
            uart: Uart::new(),
            mtimer: MTimer::new(),
            tbio: TbIo::new(),
            config,
            cycle: 0,
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Place a flat binary at an absolute physical address inside RAM.
    pub fn load_binary(&mut self, data: &[u8], addr: u32) -> Result<(), SystemError> {
        let base = self.config.ram_base;
        let top = base as u64 + self.ram.size() as u64;
        let end = addr as u64 + data.len() as u64;
        if addr < base || end > top {
            return Err(SystemError::BinaryOutOfRange {
                addr,
                end,
                base,
                top,
            });
        }
        debug!("loading {} bytes at {:#010x}", data.len(), addr);
        self.ram.load(addr - base, data);
        Ok(())
    }

    /// Advance the machine by one instruction, then give the timer its
    /// cadence tick and re-latch the timer IRQ line.
    pub fn step(&mut self, trace: bool) {
        let mut bus = SystemBus {
            ram: &mut self.ram,
            ram_base: self.config.ram_base,
            uart: &mut self.uart,
            mtimer: &mut self.mtimer,
            tbio: &mut self.tbio,
        };
        self.cpu.step(&mut bus, trace);
        if self.cycle % MTIME_CADENCE == 0 {
            self.mtimer.step_time();
            self.cpu.csr.set_irq_t(self.mtimer.irq_pending());
        }
        self.cycle = self.cycle.wrapping_add(1);
    }

    /// Run until the guest exits or `max_cycles` steps have executed
    /// (0 = no limit). Guest output is forwarded to stdout.
    pub fn run(&mut self, max_cycles: u64, trace: bool) -> RunResult {
        let mut cycles = 0u64;
        while max_cycles == 0 || cycles < max_cycles {
            self.step(trace);
            cycles += 1;
            let output = self.drain_output();
            if !output.is_empty() {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                let _ = handle.write_all(&output);
                let _ = handle.flush();
            }
            if let Some(code) = self.exit_code() {
                return RunResult::Exit { code, cycles };
            }
        }
        RunResult::TimedOut { cycles }
    }

    /// Collect pending guest output (UART, then testbench port).
    pub fn drain_output(&mut self) -> Vec<u8> {
        let mut output = self.uart.take_output();
        output.extend(self.tbio.take_output());
        output
    }

    /// Exit code written to the testbench exit port, if any.
    pub fn exit_code(&self) -> Option<u32> {
        self.tbio.exit_code()
    }

    /// Latch the external software interrupt line.
    pub fn set_irq_s(&mut self, irq: bool) {
        self.cpu.csr.set_irq_s(irq);
    }

    /// Latch the external interrupt line.
    pub fn set_irq_e(&mut self, irq: bool) {
        self.cpu.csr.set_irq_e(irq);
    }

    /// Read one physical byte the way the core would see it.
    pub fn read_memory(&mut self, addr: u32) -> Option<u8> {
        let mut bus = SystemBus {
            ram: &mut self.ram,
            ram_base: self.config.ram_base,
            uart: &mut self.uart,
            mtimer: &mut self.mtimer,
            tbio: &mut self.tbio,
        };
        bus.r8(addr)
    }

    /// Force the whole machine back to its reset state.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.ram.fill_zero();
        self.uart = Uart::new();
        self.mtimer = MTimer::new();
        self.tbio = TbIo::new();
        self.cycle = 0;
    }

    /// Serialize the whole machine state.
    pub fn save_state(&self) -> Result<Vec<u8>, SystemError> {
        Ok(snapshot::save(self)?)
    }

    /// Restore a machine from a snapshot blob.
    pub fn restore_state(data: &[u8]) -> Result<System, SystemError> {
        Ok(snapshot::restore(data)?)
    }
}

/// Borrowed bus view routing physical addresses to RAM and devices.
struct SystemBus<'a> {
    ram: &'a mut Ram,
    ram_base: u32,
    uart: &'a mut Uart,
    mtimer: &'a mut MTimer,
    tbio: &'a mut TbIo,
}

impl SystemBus<'_> {
    fn route(&mut self, addr: u32) -> Option<(&mut dyn Bus, u32)> {
        if addr.wrapping_sub(self.ram_base) < self.ram.size() {
            let offset = addr.wrapping_sub(self.ram_base);
            return Some((&mut *self.ram, offset));
        }
        if addr.wrapping_sub(TBIO_BASE) < TBIO_SIZE {
            return Some((&mut *self.tbio, addr - TBIO_BASE));
        }
        if addr.wrapping_sub(UART_BASE) < UART_SIZE {
            return Some((&mut *self.uart, addr - UART_BASE));
        }
        if addr.wrapping_sub(MTIMER_BASE) < MTIMER_SIZE {
            return Some((&mut *self.mtimer, addr - MTIMER_BASE));
        }
        None
    }
}

impl Bus for SystemBus<'_> {
    fn r8(&mut self, addr: u32) -> Option<u8> {
        let (dev, offset) = self.route(addr)?;
        dev.r8(offset)
    }

    fn w8(&mut self, addr: u32, data: u8) -> bool {
        match self.route(addr) {
            Some((dev, offset)) => dev.w8(offset, data),
            None => false,
        }
    }

    fn r16(&mut self, addr: u32) -> Option<u16> {
        let (dev, offset) = self.route(addr)?;
        dev.r16(offset)
    }

    fn w16(&mut self, addr: u32, data: u16) -> bool {
        match self.route(addr) {
            Some((dev, offset)) => dev.w16(offset, data),
            None => false,
        }
    }

    fn r32(&mut self, addr: u32) -> Option<u32> {
        let (dev, offset) = self.route(addr)?;
        dev.r32(offset)
    }

    fn w32(&mut self, addr: u32, data: u32) -> bool {
        match self.route(addr) {
            Some((dev, offset)) => dev.w32(offset, data),
            None => false,
        }
    }
}
