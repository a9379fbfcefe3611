//! 32-bit instruction execution
//!
//! Implements RV32I, M, A (word forms), Zicsr and the privileged SYSTEM
//! instructions. Unsigned arithmetic everywhere, with explicit sign
//! reinterpretation where the ISA asks for it.

use super::csr::{CsrWriteOp, PrivilegeLevel, PTE_R, PTE_W};
use super::decode::*;
use super::mmu;
use super::trap::*;
use super::{Cpu, StepEffects};
use crate::memory::Bus;

impl Cpu {
    pub(crate) fn execute32(
        &mut self,
        instr: u32,
        bus: &mut impl Bus,
        fx: &mut StepEffects,
        trace: bool,
    ) {
        let d = DecodedInst::decode(instr);
        let rs1 = self.read_reg(d.rs1);
        let rs2 = self.read_reg(d.rs2);
        fx.rd = d.rd;

        match d.opc {
            OPC_OP => match d.funct7 {
                0b00_00000 => {
                    fx.rd_wdata = Some(match d.funct3 {
                        0b000 => rs1.wrapping_add(rs2),
                        0b001 => rs1 << (rs2 & 0x1f),
                        0b010 => ((rs1 as i32) < (rs2 as i32)) as u32,
                        0b011 => (rs1 < rs2) as u32,
                        0b100 => rs1 ^ rs2,
                        0b101 => rs1 >> (rs2 & 0x1f),
                        0b110 => rs1 | rs2,
                        _ => rs1 & rs2,
                    });
                }
                0b01_00000 => match d.funct3 {
                    0b000 => fx.rd_wdata = Some(rs1.wrapping_sub(rs2)),
                    0b101 => fx.rd_wdata = Some(((rs1 as i32) >> (rs2 & 0x1f)) as u32),
                    _ => fx.raise(XCAUSE_INSTR_ILLEGAL),
                },
                0b00_00001 => fx.rd_wdata = Some(exec_m_extension(d.funct3, rs1, rs2)),
                _ => fx.raise(XCAUSE_INSTR_ILLEGAL),
            },

            OPC_OP_IMM => {
                let imm = imm_i(instr);
                match d.funct3 {
                    0b000 => fx.rd_wdata = Some(rs1.wrapping_add(imm)),
                    0b010 => fx.rd_wdata = Some(((rs1 as i32) < (imm as i32)) as u32),
                    0b011 => fx.rd_wdata = Some((rs1 < imm) as u32),
                    0b100 => fx.rd_wdata = Some(rs1 ^ imm),
                    0b110 => fx.rd_wdata = Some(rs1 | imm),
                    0b111 => fx.rd_wdata = Some(rs1 & imm),
                    // Shift amount lives in the rs2 field
                    0b001 if d.funct7 == 0b00_00000 => fx.rd_wdata = Some(rs1 << d.rs2),
                    0b101 if d.funct7 == 0b00_00000 => fx.rd_wdata = Some(rs1 >> d.rs2),
                    0b101 if d.funct7 == 0b01_00000 => {
                        fx.rd_wdata = Some(((rs1 as i32) >> d.rs2) as u32)
                    }
                    _ => fx.raise(XCAUSE_INSTR_ILLEGAL),
                }
            }

            OPC_BRANCH => {
                let target = self.pc.wrapping_add(imm_b(instr));
                let taken = match d.funct3 {
                    0b000 => Some(rs1 == rs2),
                    0b001 => Some(rs1 != rs2),
                    0b100 => Some((rs1 as i32) < (rs2 as i32)),
                    0b101 => Some((rs1 as i32) >= (rs2 as i32)),
                    0b110 => Some(rs1 < rs2),
                    0b111 => Some(rs1 >= rs2),
                    _ => None,
                };
                match taken {
                    Some(true) => fx.pc_wdata = Some(target),
                    Some(false) => {}
                    None => fx.raise(XCAUSE_INSTR_ILLEGAL),
                }
            }

            OPC_LOAD => {
                let addr_v = rs1.wrapping_add(imm_i(instr));
                if d.funct3 == 0b011 || d.funct3 > 0b101 {
                    fx.raise(XCAUSE_INSTR_ILLEGAL);
                } else if addr_v & ((1 << (d.funct3 & 0x3)) - 1) != 0 {
                    // Alignment is checked on the virtual address, before
                    // translation is attempted.
                    fx.raise_with_tval(XCAUSE_LOAD_ALIGN, addr_v);
                } else {
                    match mmu::vmap_ls(&self.csr, bus, addr_v, PTE_R) {
                        None => fx.raise_with_tval(XCAUSE_LOAD_PAGEFAULT, addr_v),
                        Some(addr_p) => {
                            let value = match d.funct3 {
                                0b000 => bus.r8(addr_p).map(|b| b as i8 as i32 as u32),
                                0b001 => bus.r16(addr_p).map(|h| h as i16 as i32 as u32),
                                0b010 => bus.r32(addr_p),
                                0b100 => bus.r8(addr_p).map(u32::from),
                                _ => bus.r16(addr_p).map(u32::from),
                            };
                            match value {
                                Some(value) => fx.rd_wdata = Some(value),
                                None => fx.raise_with_tval(XCAUSE_LOAD_FAULT, addr_v),
                            }
                        }
                    }
                }
            }

            OPC_STORE => {
                let addr_v = rs1.wrapping_add(imm_s(instr));
                if d.funct3 > 0b010 {
                    fx.raise(XCAUSE_INSTR_ILLEGAL);
                } else if addr_v & ((1 << d.funct3) - 1) != 0 {
                    fx.raise_with_tval(XCAUSE_STORE_ALIGN, addr_v);
                } else {
                    match mmu::vmap_ls(&self.csr, bus, addr_v, PTE_W) {
                        None => fx.raise_with_tval(XCAUSE_STORE_PAGEFAULT, addr_v),
                        Some(addr_p) => {
                            let ok = match d.funct3 {
                                0b000 => bus.w8(addr_p, rs2 as u8),
                                0b001 => bus.w16(addr_p, rs2 as u16),
                                _ => bus.w32(addr_p, rs2),
                            };
                            if !ok {
                                fx.raise_with_tval(XCAUSE_STORE_FAULT, addr_v);
                            }
                        }
                    }
                }
            }

            OPC_AMO => self.exec_amo(instr, &d, rs1, rs2, bus, fx),

            OPC_MISC_MEM => {
                // Single hart, no instruction cache: both fences are nops
                if instr & FENCE_MASK != FENCE_BITS && instr & FENCE_I_MASK != FENCE_I_BITS {
                    fx.raise(XCAUSE_INSTR_ILLEGAL);
                }
            }

            OPC_JAL => {
                fx.rd_wdata = Some(self.pc.wrapping_add(4));
                fx.pc_wdata = Some(self.pc.wrapping_add(imm_j(instr)));
            }

            OPC_JALR => {
                fx.rd_wdata = Some(self.pc.wrapping_add(4));
                fx.pc_wdata = Some(rs1.wrapping_add(imm_i(instr)) & !1);
            }

            OPC_LUI => fx.rd_wdata = Some(imm_u(instr)),

            OPC_AUIPC => fx.rd_wdata = Some(self.pc.wrapping_add(imm_u(instr))),

            OPC_SYSTEM => self.exec_system(instr, &d, rs1, fx, trace),

            _ => fx.raise(XCAUSE_INSTR_ILLEGAL),
        }
    }

    fn exec_system(
        &mut self,
        instr: u32,
        d: &DecodedInst,
        rs1: u32,
        fx: &mut StepEffects,
        trace: bool,
    ) {
        match d.funct3 {
            FUNCT3_CSRRW | FUNCT3_CSRRS | FUNCT3_CSRRC | FUNCT3_CSRRWI | FUNCT3_CSRRSI
            | FUNCT3_CSRRCI => {
                let csr_addr = instr >> 20;
                let write_op = match d.funct3 & 0x3 {
                    0b01 => CsrWriteOp::Write,
                    0b10 => CsrWriteOp::Set,
                    _ => CsrWriteOp::Clear,
                };
                // The immediate forms use the rs1 field as a zero-extended value
                let wdata = if d.funct3 & 0x4 != 0 { d.rs1 } else { rs1 };

                // CSRRW reads only when rd is architecturally visible; the
                // set/clear forms always read.
                if write_op != CsrWriteOp::Write || d.rd != 0 {
                    match self.csr.read(csr_addr) {
                        Some(value) => fx.rd_wdata = Some(value),
                        None => fx.raise(XCAUSE_INSTR_ILLEGAL),
                    }
                }
                // The set/clear forms write only when the source is nonzero
                if write_op == CsrWriteOp::Write || d.rs1 != 0 {
                    if !self.csr.write(csr_addr, wdata, write_op) {
                        fx.raise(XCAUSE_INSTR_ILLEGAL);
                    } else if trace {
                        fx.csr_trace =
                            Some((csr_addr, self.csr.read(csr_addr).unwrap_or(0)));
                    }
                }
                // Suppress GPR writeback of an earlier read when the write
                // half of the op failed
                if fx.exception.is_some() {
                    fx.rd_wdata = None;
                }
            }

            FUNCT3_PRIV => match instr {
                ECALL_BITS => {
                    fx.raise_with_tval(
                        XCAUSE_ECALL_U + self.csr.true_priv() as u32,
                        0,
                    );
                }
                EBREAK_BITS => fx.raise_with_tval(XCAUSE_EBREAK, 0),
                MRET_BITS => {
                    if self.csr.true_priv() == PrivilegeLevel::Machine {
                        fx.pc_wdata = Some(self.csr.trap_mret());
                        if trace {
                            fx.priv_trace = Some(self.csr.true_priv());
                        }
                    } else {
                        fx.raise(XCAUSE_INSTR_ILLEGAL);
                    }
                }
                SRET_BITS => {
                    if self.csr.true_priv() < PrivilegeLevel::Supervisor
                        || self.csr.sret_trapped_by_tsr()
                    {
                        fx.raise(XCAUSE_INSTR_ILLEGAL);
                    } else {
                        fx.pc_wdata = Some(self.csr.trap_sret());
                        if trace {
                            fx.priv_trace = Some(self.csr.true_priv());
                        }
                    }
                }
                WFI_BITS => {
                    // The external loop latches interrupts between steps, so
                    // waiting is a nop
                }
                _ if instr & SFENCE_VMA_MASK == SFENCE_VMA_BITS => {
                    // No TLB to flush; only the permission check remains
                    if !self.csr.permit_sfence_vma() {
                        fx.raise(XCAUSE_INSTR_ILLEGAL);
                    }
                }
                _ => fx.raise(XCAUSE_INSTR_ILLEGAL),
            },

            _ => fx.raise(XCAUSE_INSTR_ILLEGAL),
        }
    }

    fn exec_amo(
        &mut self,
        _instr: u32,
        d: &DecodedInst,
        rs1: u32,
        rs2: u32,
        bus: &mut impl Bus,
        fx: &mut StepEffects,
    ) {
        if d.funct3 != 0b010 {
            fx.raise(XCAUSE_INSTR_ILLEGAL);
            return;
        }
        let addr_v = rs1;
        let funct5 = d.funct7 >> 2;

        match funct5 {
            FUNCT5_LR if d.rs2 == 0 => {
                if addr_v & 0x3 != 0 {
                    fx.raise_with_tval(XCAUSE_LOAD_ALIGN, addr_v);
                } else {
                    match mmu::vmap_ls(&self.csr, bus, addr_v, PTE_R) {
                        None => fx.raise_with_tval(XCAUSE_LOAD_PAGEFAULT, addr_v),
                        Some(addr_p) => match bus.r32(addr_p) {
                            Some(value) => {
                                fx.rd_wdata = Some(value);
                                self.load_reserved = true;
                            }
                            None => fx.raise_with_tval(XCAUSE_LOAD_FAULT, addr_v),
                        },
                    }
                }
            }

            FUNCT5_SC => {
                if addr_v & 0x3 != 0 {
                    fx.raise_with_tval(XCAUSE_STORE_ALIGN, addr_v);
                } else if self.load_reserved {
                    match mmu::vmap_ls(&self.csr, bus, addr_v, PTE_W) {
                        None => fx.raise_with_tval(XCAUSE_STORE_PAGEFAULT, addr_v),
                        Some(addr_p) => {
                            self.load_reserved = false;
                            if bus.w32(addr_p, rs2) {
                                fx.rd_wdata = Some(0);
                            } else {
                                fx.raise_with_tval(XCAUSE_STORE_FAULT, addr_v);
                            }
                        }
                    }
                } else {
                    // No reservation: fail without touching memory
                    fx.rd_wdata = Some(1);
                }
            }

            FUNCT5_AMOSWAP | FUNCT5_AMOADD | FUNCT5_AMOXOR | FUNCT5_AMOAND | FUNCT5_AMOOR
            | FUNCT5_AMOMIN | FUNCT5_AMOMAX | FUNCT5_AMOMINU | FUNCT5_AMOMAXU => {
                if addr_v & 0x3 != 0 {
                    fx.raise_with_tval(XCAUSE_STORE_ALIGN, addr_v);
                } else {
                    // AMOs need both permissions up front; faults on either
                    // leg report as stores
                    match mmu::vmap_ls(&self.csr, bus, addr_v, PTE_R | PTE_W) {
                        None => fx.raise_with_tval(XCAUSE_STORE_PAGEFAULT, addr_v),
                        Some(addr_p) => match bus.r32(addr_p) {
                            None => fx.raise_with_tval(XCAUSE_STORE_FAULT, addr_v),
                            Some(old) => {
                                let new = match funct5 {
                                    FUNCT5_AMOSWAP => rs2,
                                    FUNCT5_AMOADD => old.wrapping_add(rs2),
                                    FUNCT5_AMOXOR => old ^ rs2,
                                    FUNCT5_AMOAND => old & rs2,
                                    FUNCT5_AMOOR => old | rs2,
                                    FUNCT5_AMOMIN => (old as i32).min(rs2 as i32) as u32,
                                    FUNCT5_AMOMAX => (old as i32).max(rs2 as i32) as u32,
                                    FUNCT5_AMOMINU => old.min(rs2),
                                    _ => old.max(rs2),
                                };
                                if bus.w32(addr_p, new) {
                                    // rd receives the original memory value
                                    fx.rd_wdata = Some(old);
                                } else {
                                    fx.raise_with_tval(XCAUSE_STORE_FAULT, addr_v);
                                }
                            }
                        },
                    }
                }
            }

            _ => fx.raise(XCAUSE_INSTR_ILLEGAL),
        }
    }
}

/// M extension: all eight funct3 encodings are defined.
fn exec_m_extension(funct3: u32, rs1: u32, rs2: u32) -> u32 {
    match funct3 {
        // MUL: low 32 bits
        0b000 => rs1.wrapping_mul(rs2),
        // MULH: signed x signed, high 32 bits
        0b001 => ((rs1 as i32 as i64).wrapping_mul(rs2 as i32 as i64) >> 32) as u32,
        // MULHSU: signed x unsigned
        0b010 => ((rs1 as i32 as i64).wrapping_mul(rs2 as i64) >> 32) as u32,
        // MULHU: unsigned x unsigned
        0b011 => (((rs1 as u64).wrapping_mul(rs2 as u64)) >> 32) as u32,
        // DIV
        0b100 => {
            if rs2 == 0 {
                u32::MAX
            } else {
                (rs1 as i32).wrapping_div(rs2 as i32) as u32
            }
        }
        // DIVU
        0b101 => {
            if rs2 == 0 {
                u32::MAX
            } else {
                rs1 / rs2
            }
        }
        // REM
        0b110 => {
            if rs2 == 0 {
                rs1
            } else {
                (rs1 as i32).wrapping_rem(rs2 as i32) as u32
            }
        }
        // REMU
        _ => {
            if rs2 == 0 {
                rs1
            } else {
                rs1 % rs2
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::csr::{CsrWriteOp, CSR_MCAUSE, CSR_MSCRATCH, CSR_MTVAL, CSR_MTVEC};
    use super::super::Cpu;
    use super::*;
    use crate::memory::Ram;

    const RESET: u32 = 0x40;

    fn run(program: &[u32], setup: impl FnOnce(&mut Cpu, &mut Ram)) -> (Cpu, Ram) {
        let mut ram = Ram::new(64 * 1024);
        for (i, &instr) in program.iter().enumerate() {
            ram.w32(RESET + 4 * i as u32, instr);
        }
        let mut cpu = Cpu::new(RESET);
        setup(&mut cpu, &mut ram);
        for _ in 0..program.len() {
            cpu.step(&mut ram, false);
        }
        (cpu, ram)
    }

    #[test]
    fn test_div_edge_cases() {
        assert_eq!(exec_m_extension(0b100, 7, 0), u32::MAX); // x / 0 == -1
        assert_eq!(
            exec_m_extension(0b100, i32::MIN as u32, -1i32 as u32),
            i32::MIN as u32
        );
        assert_eq!(exec_m_extension(0b110, 7, 0), 7); // x % 0 == x
        assert_eq!(exec_m_extension(0b110, i32::MIN as u32, -1i32 as u32), 0);
        assert_eq!(exec_m_extension(0b101, 123, 0), u32::MAX);
        assert_eq!(exec_m_extension(0b111, 123, 0), 123);
    }

    #[test]
    fn test_mulh_variants() {
        assert_eq!(exec_m_extension(0b000, 0x8000_0000, 2), 0);
        assert_eq!(exec_m_extension(0b001, -1i32 as u32, -1i32 as u32), 0);
        assert_eq!(exec_m_extension(0b011, 0xffff_ffff, 0xffff_ffff), 0xffff_fffe);
        // MULHSU: -1 * 0xffffffff = -0xffffffff -> high word 0xffffffff
        assert_eq!(exec_m_extension(0b010, -1i32 as u32, 0xffff_ffff), 0xffff_ffff);
    }

    #[test]
    fn test_store_loop() {
        // sw x1, 0(x2); addi x2, x2, 4; bne x2, x3, -8
        let (cpu, mut ram) = run(
            &[0x00112023, 0x00410113, 0xfe311ce3],
            |cpu, _| {
                cpu.write_reg(1, 0xdead);
                cpu.write_reg(2, 0x1000);
                cpu.write_reg(3, 0x1010);
            },
        );
        // run() steps 3 times; finish the remaining iterations by hand
        let mut cpu = cpu;
        while cpu.pc != 0x4c {
            cpu.step(&mut ram, false);
        }
        for addr in (0x1000..0x1010).step_by(4) {
            assert_eq!(ram.r32(addr), Some(0xdead));
        }
        assert_eq!(cpu.read_reg(2), 0x1010);
    }

    #[test]
    fn test_load_sign_extension() {
        let (cpu, _) = run(
            &[
                0x00008083, // lb x1, 0(x1)
            ],
            |cpu, ram| {
                cpu.write_reg(1, 0x2000);
                ram.w8(0x2000, 0x80);
            },
        );
        assert_eq!(cpu.read_reg(1), 0xffff_ff80);
    }

    #[test]
    fn test_misaligned_load_traps_before_translation() {
        let (cpu, _) = run(
            &[0x00012083], // lw x1, 0(x2)
            |cpu, _| {
                cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
                cpu.write_reg(2, 0x1001);
            },
        );
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_LOAD_ALIGN));
        assert_eq!(cpu.csr.read(CSR_MTVAL), Some(0x1001));
        assert_eq!(cpu.pc, 0x100);
        // No register write on the trapped load
        assert_eq!(cpu.read_reg(1), 0);
    }

    #[test]
    fn test_store_fault_outside_memory() {
        let (cpu, _) = run(
            &[0x00112023], // sw x1, 0(x2)
            |cpu, _| {
                cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
                cpu.write_reg(2, 0x0100_0000);
            },
        );
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_STORE_FAULT));
        assert_eq!(cpu.csr.read(CSR_MTVAL), Some(0x0100_0000));
    }

    #[test]
    fn test_lr_sc_pair() {
        // lr.w x1, (x2); sc.w x3, x4, (x2); sc.w x5, x4, (x2)
        let (cpu, mut ram) = run(
            &[0x100120af, 0x184121af, 0x184122af],
            |cpu, ram| {
                cpu.write_reg(2, 0x3000);
                cpu.write_reg(4, 0x5555);
                ram.w32(0x3000, 0x1234);
            },
        );
        assert_eq!(cpu.read_reg(1), 0x1234); // loaded word
        assert_eq!(cpu.read_reg(3), 0); // first sc succeeds
        assert_eq!(cpu.read_reg(5), 1); // second sc fails
        assert_eq!(ram.r32(0x3000), Some(0x5555));
    }

    #[test]
    fn test_sc_without_reservation_writes_nothing() {
        let (cpu, mut ram) = run(
            &[0x184121af], // sc.w x3, x4, (x2)
            |cpu, ram| {
                cpu.write_reg(2, 0x3000);
                cpu.write_reg(4, 0x5555);
                ram.w32(0x3000, 0x1234);
            },
        );
        assert_eq!(cpu.read_reg(3), 1);
        assert_eq!(ram.r32(0x3000), Some(0x1234));
    }

    #[test]
    fn test_amoadd() {
        // amoadd.w x1, x4, (x2) : funct5 00000
        let (cpu, mut ram) = run(
            &[0x004120af],
            |cpu, ram| {
                cpu.write_reg(2, 0x3000);
                cpu.write_reg(4, 10);
                ram.w32(0x3000, 32);
            },
        );
        assert_eq!(cpu.read_reg(1), 32); // rd gets the original value
        assert_eq!(ram.r32(0x3000), Some(42));
    }

    #[test]
    fn test_amo_minmax() {
        // amomax.w x1, x4, (x2) : funct5 10100 -> funct7 1010000
        let (cpu, mut ram) = run(
            &[0xa04120af],
            |cpu, ram| {
                cpu.write_reg(2, 0x3000);
                cpu.write_reg(4, 5);
                ram.w32(0x3000, -7i32 as u32);
            },
        );
        assert_eq!(cpu.read_reg(1), -7i32 as u32);
        assert_eq!(ram.r32(0x3000), Some(5));
    }

    #[test]
    fn test_misaligned_amo_is_store_align() {
        let (cpu, _) = run(
            &[0x004120af], // amoadd.w
            |cpu, _| {
                cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
                cpu.write_reg(2, 0x3002);
            },
        );
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_STORE_ALIGN));
        assert_eq!(cpu.csr.read(CSR_MTVAL), Some(0x3002));
    }

    #[test]
    fn test_csrrw_round_trip() {
        // csrrw x1, mscratch, x2 = 0x34011073 | rd/rs1
        let (cpu, _) = run(
            &[0x34011073 | (1 << 7) | (2 << 15)],
            |cpu, _| {
                cpu.csr.write(CSR_MSCRATCH, 0xaaaa, CsrWriteOp::Write);
                cpu.write_reg(2, 0x5555);
            },
        );
        assert_eq!(cpu.read_reg(1), 0xaaaa);
        assert_eq!(cpu.csr.read(CSR_MSCRATCH), Some(0x5555));
    }

    #[test]
    fn test_csrrs_zero_source_does_not_write_read_only() {
        // csrrs x1, mhartid, x0 reads the RO register without trapping
        let (cpu, _) = run(&[0xf1402073 | (1 << 7)], |_, _| {});
        assert_eq!(cpu.read_reg(1), 0);
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(0));
    }

    #[test]
    fn test_csrrw_read_only_traps_and_suppresses_rd() {
        // csrrw x1, mhartid, x2 must trap and leave x1 untouched
        let (cpu, _) = run(
            &[0xf1411073 | (1 << 7)],
            |cpu, _| {
                cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
                cpu.write_reg(1, 0x77);
            },
        );
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_INSTR_ILLEGAL));
        assert_eq!(cpu.read_reg(1), 0x77);
    }

    #[test]
    fn test_wfi_and_fences_are_nops() {
        let (cpu, _) = run(&[0x10500073, 0x0000000f, 0x0000100f], |_, _| {});
        assert_eq!(cpu.pc, RESET + 12);
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(0));
    }
}
