//! RV32IMAC+Zcmp CPU core
//!
//! Implements the RISC-V 32-bit base integer instruction set with the
//! M (multiply/divide), A (atomic), C (compressed) and Zcmp extensions,
//! Zicsr/Zicntr, M/S/U privilege and Sv32 virtual memory.

pub mod csr;
pub mod decode;
mod execute;
mod execute_c;
pub mod mmu;
pub mod trap;

pub use csr::{Csr, PrivilegeLevel};

use serde::{Deserialize, Serialize};

use crate::memory::Bus;
use decode::REG_NAMES;
use trap::{Trap, XCAUSE_INSTR_FAULT, XCAUSE_INSTR_ILLEGAL, XCAUSE_INSTR_PAGEFAULT};

/// Tentative effects of the instruction currently being stepped.
///
/// Nothing here touches architectural state until the commit point at the
/// end of `step`, so a check that fails late (e.g. a CSR write after a CSR
/// read) can still suppress the whole instruction.
#[derive(Default)]
pub(crate) struct StepEffects {
    /// Destination register number; writes to x0 are discarded at commit.
    rd: u32,
    rd_wdata: Option<u32>,
    pc_wdata: Option<u32>,
    exception: Option<Trap>,
    /// CSR (address, value-after-write) captured for tracing.
    csr_trace: Option<(u32, u32)>,
    /// Privilege change (mret/sret) captured for tracing.
    priv_trace: Option<PrivilegeLevel>,
}

impl StepEffects {
    fn raise(&mut self, cause: u32) {
        self.exception = Some(Trap::new(cause));
    }

    fn raise_with_tval(&mut self, cause: u32, tval: u32) {
        self.exception = Some(Trap::with_tval(cause, tval));
    }
}

/// CPU state
#[derive(Serialize, Deserialize)]
pub struct Cpu {
    /// General purpose registers (x0-x31)
    pub regs: [u32; 32],
    /// Program counter
    pub pc: u32,
    /// Control and Status Registers, including the trap engine
    pub csr: Csr,
    /// Reservation flag for LR/SC (single hart: no address granule)
    pub load_reserved: bool,

    reset_vector: u32,
}

impl Cpu {
    pub fn new(reset_vector: u32) -> Self {
        Cpu {
            regs: [0u32; 32],
            pc: reset_vector,
            csr: Csr::new(),
            load_reserved: false,
            reset_vector,
        }
    }

    /// Read register (x0 always returns 0)
    #[inline(always)]
    pub fn read_reg(&self, reg: u32) -> u32 {
        if reg == 0 {
            0
        } else {
            self.regs[reg as usize & 0x1f]
        }
    }

    /// Write register (x0 writes are ignored)
    #[inline(always)]
    pub fn write_reg(&mut self, reg: u32, value: u32) {
        if reg != 0 {
            self.regs[reg as usize & 0x1f] = value;
        }
    }

    /// Reset CPU state
    pub fn reset(&mut self) {
        self.regs = [0u32; 32];
        self.pc = self.reset_vector;
        self.csr.reset();
        self.load_reserved = false;
    }

    /// Fetch and execute one instruction.
    ///
    /// All architectural effects land in registers, memory and CSR state;
    /// nothing is returned. A pending interrupt is taken after the
    /// instruction completes and resumes at its tentative next PC.
    pub fn step(&mut self, bus: &mut impl Bus, trace: bool) {
        let pc = self.pc;
        let mut fx = StepEffects::default();

        // Both halfwords are fetched unconditionally; the upper one is used
        // only when the lower one announces a 32-bit encoding.
        let fetch_paddr0 = mmu::vmap_fetch(&self.csr, bus, pc);
        let fetch0 = fetch_paddr0.and_then(|paddr| bus.r16(paddr));
        let fetch_paddr1 = mmu::vmap_fetch(&self.csr, bus, pc.wrapping_add(2));
        let fetch1 = fetch_paddr1.and_then(|paddr| bus.r16(paddr));

        let lo = fetch0.unwrap_or(0) as u32;
        let is_32bit = lo & 0x3 == 0x3;
        let instr = lo | ((fetch1.unwrap_or(0) as u32) << 16);
        let instr_len = if is_32bit { 4 } else { 2 };

        // The tval of a fetch fault is the virtual address whose translation
        // or read failed, which is mid-instruction when a 32-bit encoding
        // crosses a page boundary.
        if fetch_paddr0.is_none() {
            fx.raise_with_tval(XCAUSE_INSTR_PAGEFAULT, pc);
        } else if fetch0.is_none() {
            fx.raise_with_tval(XCAUSE_INSTR_FAULT, pc);
        } else if is_32bit && fetch_paddr1.is_none() {
            fx.raise_with_tval(XCAUSE_INSTR_PAGEFAULT, pc.wrapping_add(2));
        } else if is_32bit && fetch1.is_none() {
            fx.raise_with_tval(XCAUSE_INSTR_FAULT, pc.wrapping_add(2));
        } else if is_32bit {
            self.execute32(instr, bus, &mut fx, trace);
        } else {
            self.execute16(instr & 0xffff, bus, &mut fx);
        }

        if trace {
            let mut line = format!("{:08x}: ", pc);
            if is_32bit {
                line.push_str(&format!("{:08x} : ", instr));
            } else {
                line.push_str(&format!("    {:04x} : ", instr & 0xffff));
            }
            match (fx.rd, fx.rd_wdata) {
                (rd, Some(wdata)) if rd != 0 => {
                    line.push_str(&format!("{:<3}   <- {:08x} ", REG_NAMES[rd as usize], wdata));
                }
                _ => line.push_str("                  "),
            }
            match fx.pc_wdata {
                Some(target) => println!("{}: pc <- {:08x}", line, target),
                None => println!("{}:", line),
            }
            if let Some((addr, result)) = fx.csr_trace {
                println!("                   : #{:03x}  <- {:08x} :", addr, result);
            }
        }

        let mut xtval = None;
        if let Some(exception) = fx.exception {
            xtval = exception.tval;
            if exception.cause == XCAUSE_INSTR_ILLEGAL && xtval.is_none() {
                // Zero-extended instruction bits
                xtval = Some(if is_32bit { instr } else { instr & 0xffff });
            }
            let target = self.csr.trap_enter_exception(exception.cause, pc);
            fx.pc_wdata = Some(target);
            if let Some(xtval) = xtval {
                self.csr.trap_set_xtval(xtval);
            }
            if trace {
                println!(
                    "^^^ Trap           : cause <- {:<2}       : pc <- {:08x}",
                    exception.cause, target
                );
                fx.priv_trace = Some(self.csr.true_priv());
            }
        } else {
            // Interrupts are taken once the instruction has fully completed,
            // so the saved EPC is the next instruction's address.
            let next_pc = fx.pc_wdata.unwrap_or(pc.wrapping_add(instr_len));
            if let Some(target) = self.csr.trap_check_enter_irq(next_pc) {
                fx.pc_wdata = Some(target);
                if trace {
                    println!(
                        "^^^ IRQ            : priv  <- {}        : pc <- {:08x}",
                        priv_char(self.csr.true_priv()),
                        target
                    );
                }
            }
        }

        if trace {
            if let Some(priv_level) = fx.priv_trace {
                println!("|||                : priv  <- {}        :", priv_char(priv_level));
            }
            if let Some(xtval) = xtval {
                println!("|||                : tval  <- {:08x} :", xtval);
            }
        }

        // Commit
        self.pc = fx.pc_wdata.unwrap_or(pc.wrapping_add(instr_len));
        if fx.exception.is_none() && fx.rd != 0 {
            if let Some(wdata) = fx.rd_wdata {
                self.regs[fx.rd as usize] = wdata;
            }
        }
        self.csr.step_counters();
    }
}

fn priv_char(priv_level: PrivilegeLevel) -> char {
    match priv_level {
        PrivilegeLevel::User => 'U',
        PrivilegeLevel::Supervisor => 'S',
        PrivilegeLevel::Machine => 'M',
    }
}
