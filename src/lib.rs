//! RV32 system emulator
//!
//! An instruction-accurate interpreter for a single RV32IMAC+Zcmp hart
//! with M/S/U privilege and Sv32 virtual memory, enough to boot a
//! supervisor under machine-mode firmware. The surrounding machine is a
//! flat RAM plus a small set of testbench peripherals (8250-style UART,
//! machine timer, exit port).

pub mod cpu;
pub mod devices;
pub mod memory;
pub mod snapshot;
pub mod system;

pub use system::{RunResult, System, SystemConfig};
