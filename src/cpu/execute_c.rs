//! Compressed (16-bit) instruction execution
//!
//! Full Zca coverage over the three RVC quadrants, plus the Zcmp
//! push/pop/popret/popretz and mvsa01/mva01s sequences. Memory forms share
//! the alignment and translation behaviour of their 32-bit counterparts.

use super::csr::{PTE_R, PTE_W};
use super::decode::*;
use super::mmu;
use super::trap::*;
use super::{Cpu, StepEffects};
use crate::memory::Bus;

impl Cpu {
    pub(crate) fn execute16(&mut self, instr: u32, bus: &mut impl Bus, fx: &mut StepEffects) {
        match instr & 0x3 {
            0x0 => self.exec_quadrant0(instr, bus, fx),
            0x1 => self.exec_quadrant1(instr, fx),
            _ => self.exec_quadrant2(instr, bus, fx),
        }
    }

    fn exec_quadrant0(&mut self, instr: u32, bus: &mut impl Bus, fx: &mut StepEffects) {
        if rvc_match(instr, C_ILLEGAL16) {
            fx.raise(XCAUSE_INSTR_ILLEGAL);
        } else if rvc_match(instr, C_ADDI4SPN) {
            fx.rd = c_rs2_s(instr);
            fx.rd_wdata = Some(
                self.regs[2]
                    .wrapping_add(getbits(instr, 12, 11) << 4)
                    .wrapping_add(getbits(instr, 10, 7) << 6)
                    .wrapping_add(getbit(instr, 6) << 2)
                    .wrapping_add(getbit(instr, 5) << 3),
            );
        } else if rvc_match(instr, C_LW) {
            let addr_v = self.regs[c_rs1_s(instr) as usize]
                .wrapping_add(getbit(instr, 6) << 2)
                .wrapping_add(getbits(instr, 12, 10) << 3)
                .wrapping_add(getbit(instr, 5) << 6);
            fx.rd = c_rs2_s(instr);
            fx.rd_wdata = self.c_load_word(bus, addr_v, &mut fx.exception);
        } else if rvc_match(instr, C_SW) {
            let addr_v = self.regs[c_rs1_s(instr) as usize]
                .wrapping_add(getbit(instr, 6) << 2)
                .wrapping_add(getbits(instr, 12, 10) << 3)
                .wrapping_add(getbit(instr, 5) << 6);
            let value = self.regs[c_rs2_s(instr) as usize];
            self.c_store_word(bus, addr_v, value, &mut fx.exception);
        } else {
            fx.raise(XCAUSE_INSTR_ILLEGAL);
        }
    }

    fn exec_quadrant1(&mut self, instr: u32, fx: &mut StepEffects) {
        if rvc_match(instr, C_ADDI) {
            fx.rd = c_rs1_l(instr);
            fx.rd_wdata = Some(self.regs[c_rs1_l(instr) as usize].wrapping_add(imm_ci(instr)));
        } else if rvc_match(instr, C_JAL) {
            fx.pc_wdata = Some(self.pc.wrapping_add(imm_cj(instr)));
            fx.rd = 1;
            fx.rd_wdata = Some(self.pc.wrapping_add(2));
        } else if rvc_match(instr, C_LI) {
            fx.rd = c_rs1_l(instr);
            fx.rd_wdata = Some(imm_ci(instr));
        } else if rvc_match(instr, C_LUI) {
            fx.rd = c_rs1_l(instr);
            if fx.rd == 2 {
                // ADDI16SP when rd is the stack pointer
                fx.rd_wdata = Some(
                    self.regs[2]
                        .wrapping_sub(getbit(instr, 12) << 9)
                        .wrapping_add(getbit(instr, 6) << 4)
                        .wrapping_add(getbit(instr, 5) << 6)
                        .wrapping_add(getbits(instr, 4, 3) << 7)
                        .wrapping_add(getbit(instr, 2) << 5),
                );
            } else {
                fx.rd_wdata = Some(
                    (getbits(instr, 6, 2) << 12).wrapping_sub(getbit(instr, 12) << 17),
                );
            }
        } else if rvc_match(instr, C_SRLI) {
            fx.rd = c_rs1_s(instr);
            fx.rd_wdata = Some(self.regs[fx.rd as usize] >> getbits(instr, 6, 2));
        } else if rvc_match(instr, C_SRAI) {
            fx.rd = c_rs1_s(instr);
            fx.rd_wdata =
                Some(((self.regs[fx.rd as usize] as i32) >> getbits(instr, 6, 2)) as u32);
        } else if rvc_match(instr, C_ANDI) {
            fx.rd = c_rs1_s(instr);
            fx.rd_wdata = Some(self.regs[fx.rd as usize] & imm_ci(instr));
        } else if rvc_match(instr, C_SUB) {
            fx.rd = c_rs1_s(instr);
            fx.rd_wdata = Some(
                self.regs[c_rs1_s(instr) as usize]
                    .wrapping_sub(self.regs[c_rs2_s(instr) as usize]),
            );
        } else if rvc_match(instr, C_XOR) {
            fx.rd = c_rs1_s(instr);
            fx.rd_wdata =
                Some(self.regs[c_rs1_s(instr) as usize] ^ self.regs[c_rs2_s(instr) as usize]);
        } else if rvc_match(instr, C_OR) {
            fx.rd = c_rs1_s(instr);
            fx.rd_wdata =
                Some(self.regs[c_rs1_s(instr) as usize] | self.regs[c_rs2_s(instr) as usize]);
        } else if rvc_match(instr, C_AND) {
            fx.rd = c_rs1_s(instr);
            fx.rd_wdata =
                Some(self.regs[c_rs1_s(instr) as usize] & self.regs[c_rs2_s(instr) as usize]);
        } else if rvc_match(instr, C_J) {
            fx.pc_wdata = Some(self.pc.wrapping_add(imm_cj(instr)));
        } else if rvc_match(instr, C_BEQZ) {
            if self.regs[c_rs1_s(instr) as usize] == 0 {
                fx.pc_wdata = Some(self.pc.wrapping_add(imm_cb(instr)));
            }
        } else if rvc_match(instr, C_BNEZ) {
            if self.regs[c_rs1_s(instr) as usize] != 0 {
                fx.pc_wdata = Some(self.pc.wrapping_add(imm_cb(instr)));
            }
        } else {
            fx.raise(XCAUSE_INSTR_ILLEGAL);
        }
    }

    fn exec_quadrant2(&mut self, instr: u32, bus: &mut impl Bus, fx: &mut StepEffects) {
        if rvc_match(instr, C_SLLI) {
            fx.rd = c_rs1_l(instr);
            fx.rd_wdata = Some(self.regs[fx.rd as usize] << getbits(instr, 6, 2));
        } else if rvc_match(instr, C_MV) {
            if c_rs2_l(instr) == 0 {
                // c.jr
                fx.pc_wdata = Some(self.regs[c_rs1_l(instr) as usize] & !1);
            } else {
                fx.rd = c_rs1_l(instr);
                fx.rd_wdata = Some(self.regs[c_rs2_l(instr) as usize]);
            }
        } else if rvc_match(instr, C_ADD) {
            if c_rs2_l(instr) == 0 {
                if c_rs1_l(instr) == 0 {
                    // c.ebreak
                    fx.raise_with_tval(XCAUSE_EBREAK, 0);
                } else {
                    // c.jalr
                    fx.pc_wdata = Some(self.regs[c_rs1_l(instr) as usize] & !1);
                    fx.rd = 1;
                    fx.rd_wdata = Some(self.pc.wrapping_add(2));
                }
            } else {
                fx.rd = c_rs1_l(instr);
                fx.rd_wdata = Some(
                    self.regs[c_rs1_l(instr) as usize]
                        .wrapping_add(self.regs[c_rs2_l(instr) as usize]),
                );
            }
        } else if rvc_match(instr, C_LWSP) {
            let addr_v = self.regs[2]
                .wrapping_add(getbit(instr, 12) << 5)
                .wrapping_add(getbits(instr, 6, 4) << 2)
                .wrapping_add(getbits(instr, 3, 2) << 6);
            fx.rd = c_rs1_l(instr);
            fx.rd_wdata = self.c_load_word(bus, addr_v, &mut fx.exception);
        } else if rvc_match(instr, C_SWSP) {
            let addr_v = self.regs[2]
                .wrapping_add(getbits(instr, 12, 9) << 2)
                .wrapping_add(getbits(instr, 8, 7) << 6);
            let value = self.regs[c_rs2_l(instr) as usize];
            self.c_store_word(bus, addr_v, value, &mut fx.exception);
        } else if rvc_match(instr, CM_PUSH) {
            self.exec_zcmp_push(instr, bus, fx);
        } else if rvc_match(instr, CM_POP)
            || rvc_match(instr, CM_POPRET)
            || rvc_match(instr, CM_POPRETZ)
        {
            self.exec_zcmp_pop(instr, bus, fx);
        } else if rvc_match(instr, CM_MVSA01) {
            self.regs[zcmp_s_mapping(getbits(instr, 9, 7)) as usize] = self.regs[10];
            self.regs[zcmp_s_mapping(getbits(instr, 4, 2)) as usize] = self.regs[11];
        } else if rvc_match(instr, CM_MVA01S) {
            self.regs[10] = self.regs[zcmp_s_mapping(getbits(instr, 9, 7)) as usize];
            self.regs[11] = self.regs[zcmp_s_mapping(getbits(instr, 4, 2)) as usize];
        } else {
            fx.raise(XCAUSE_INSTR_ILLEGAL);
        }
    }

    /// cm.push: store the register list downwards from sp, then adjust sp.
    fn exec_zcmp_push(&mut self, instr: u32, bus: &mut impl Bus, fx: &mut StepEffects) {
        if zcmp_rlist(instr) < 4 {
            fx.raise(XCAUSE_INSTR_ILLEGAL);
            return;
        }
        let reg_mask = zcmp_reg_mask(instr);
        let mut addr = self.regs[2];
        for i in (1..32).rev() {
            if reg_mask & (1 << i) != 0 {
                addr = addr.wrapping_sub(4);
                if !self.c_store_word(bus, addr, self.regs[i as usize], &mut fx.exception) {
                    return;
                }
            }
        }
        fx.rd = 2;
        fx.rd_wdata = Some(self.regs[2].wrapping_sub(zcmp_stack_adj(instr)));
    }

    /// cm.pop / cm.popret / cm.popretz: reload the register list from the
    /// top of the frame, adjust sp, optionally clear a0 and return via ra.
    fn exec_zcmp_pop(&mut self, instr: u32, bus: &mut impl Bus, fx: &mut StepEffects) {
        if zcmp_rlist(instr) < 4 {
            fx.raise(XCAUSE_INSTR_ILLEGAL);
            return;
        }
        let clear_a0 = rvc_match(instr, CM_POPRETZ);
        let ret = clear_a0 || rvc_match(instr, CM_POPRET);
        let reg_mask = zcmp_reg_mask(instr);
        let stack_adj = zcmp_stack_adj(instr);
        let mut addr = self.regs[2].wrapping_add(stack_adj);
        for i in (1..32).rev() {
            if reg_mask & (1 << i) != 0 {
                addr = addr.wrapping_sub(4);
                match self.c_load_word(bus, addr, &mut fx.exception) {
                    Some(value) => self.regs[i as usize] = value,
                    None => return,
                }
            }
        }
        if clear_a0 {
            self.regs[10] = 0;
        }
        if ret {
            fx.pc_wdata = Some(self.regs[1]);
        }
        fx.rd = 2;
        fx.rd_wdata = Some(self.regs[2].wrapping_add(stack_adj));
    }

    /// Word load shared by the compressed memory forms: alignment check on
    /// the virtual address, then translate, then read.
    fn c_load_word(
        &self,
        bus: &mut impl Bus,
        addr_v: u32,
        exception: &mut Option<Trap>,
    ) -> Option<u32> {
        if addr_v & 0x3 != 0 {
            *exception = Some(Trap::with_tval(XCAUSE_LOAD_ALIGN, addr_v));
            return None;
        }
        match mmu::vmap_ls(&self.csr, bus, addr_v, PTE_R) {
            None => {
                *exception = Some(Trap::with_tval(XCAUSE_LOAD_PAGEFAULT, addr_v));
                None
            }
            Some(addr_p) => match bus.r32(addr_p) {
                Some(value) => Some(value),
                None => {
                    *exception = Some(Trap::with_tval(XCAUSE_LOAD_FAULT, addr_v));
                    None
                }
            },
        }
    }

    /// Word store counterpart of `c_load_word`. Returns false on fault.
    fn c_store_word(
        &self,
        bus: &mut impl Bus,
        addr_v: u32,
        value: u32,
        exception: &mut Option<Trap>,
    ) -> bool {
        if addr_v & 0x3 != 0 {
            *exception = Some(Trap::with_tval(XCAUSE_STORE_ALIGN, addr_v));
            return false;
        }
        match mmu::vmap_ls(&self.csr, bus, addr_v, PTE_W) {
            None => {
                *exception = Some(Trap::with_tval(XCAUSE_STORE_PAGEFAULT, addr_v));
                false
            }
            Some(addr_p) => {
                if bus.w32(addr_p, value) {
                    true
                } else {
                    *exception = Some(Trap::with_tval(XCAUSE_STORE_FAULT, addr_v));
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::csr::{CsrWriteOp, CSR_MCAUSE, CSR_MTVEC};
    use super::super::Cpu;
    use super::*;
    use crate::memory::Ram;

    const RESET: u32 = 0x40;

    fn setup16(program: &[u16]) -> (Cpu, Ram) {
        let mut ram = Ram::new(64 * 1024);
        for (i, &h) in program.iter().enumerate() {
            ram.w16(RESET + 2 * i as u32, h);
        }
        (Cpu::new(RESET), ram)
    }

    #[test]
    fn test_c_addi() {
        // c.addi x8, -2 ; c.li a0, 3
        let (mut cpu, mut ram) = setup16(&[0x1479, 0x450d]);
        cpu.write_reg(8, 10);
        cpu.step(&mut ram, false);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.read_reg(8), 8);
        assert_eq!(cpu.read_reg(10), 3);
        assert_eq!(cpu.pc, RESET + 4);
    }

    #[test]
    fn test_c_addi4spn_and_addi16sp() {
        // c.addi4spn x8, sp, 8 : nzuimm=8 -> bit5 set => 0x0020 | rd'=0 -> 0x0020? use encoding 0x0020|0x0000
        // Encode: funct3=000 op=00, imm[5:4]@12:11=00 imm[9:6]@10:7=0000 imm[2]@6=0 imm[3]@5=1, rd'=000
        let (mut cpu, mut ram) = setup16(&[0x0020]);
        cpu.write_reg(2, 0x1000);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.read_reg(8), 0x1008);

        // c.addi16sp sp, -32: funct3=011, rd=2, imm = -32
        // imm[9]@12=1 imm[4]@6=1 imm[6]@5=0 imm[8:7]@4:3=11 imm[5]@2=0
        // -32 = 0b11_1110_0000: imm9=1, imm8:7=11, imm6=1, imm5=0, imm4=0
        let bits: u16 = 0x6000 | (2 << 7) | (1 << 12) | (1 << 5) | (0b11 << 3) | (1 << 2) | 0x1;
        let (mut cpu, mut ram) = setup16(&[bits]);
        cpu.write_reg(2, 0x1000);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.read_reg(2), 0x1000 - 32);
    }

    #[test]
    fn test_c_lw_sw() {
        // c.sw x9, 0(x8) = funct3 110, rs1'=000(x8), rs2'=001(x9)
        let sw: u16 = 0xc000 | (0 << 7) | (1 << 2);
        // c.lw x10, 0(x8)
        let lw: u16 = 0x4000 | (0 << 7) | (2 << 2);
        let (mut cpu, mut ram) = setup16(&[sw, lw]);
        cpu.write_reg(8, 0x2000);
        cpu.write_reg(9, 0xcafe);
        cpu.step(&mut ram, false);
        cpu.step(&mut ram, false);
        assert_eq!(ram.r32(0x2000), Some(0xcafe));
        assert_eq!(cpu.read_reg(10), 0xcafe);
    }

    #[test]
    fn test_c_j_and_c_jal() {
        // c.j +8
        let cj: u16 = 0xa001 | (0b100 << 3); // imm[3:1] at bits 5:3
        let (mut cpu, mut ram) = setup16(&[cj]);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.pc, RESET + 8);

        // c.jal +8 writes ra
        let cjal: u16 = 0x2001 | (0b100 << 3);
        let (mut cpu, mut ram) = setup16(&[cjal]);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.pc, RESET + 8);
        assert_eq!(cpu.read_reg(1), RESET + 2);
    }

    #[test]
    fn test_c_jr_clears_bit0() {
        // c.jr x5 = C_MV with rs2=0, rs1=5
        let cjr: u16 = 0x8002 | (5 << 7);
        let (mut cpu, mut ram) = setup16(&[cjr]);
        cpu.write_reg(5, 0x2001);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.pc, 0x2000);
    }

    #[test]
    fn test_c_ebreak() {
        let (mut cpu, mut ram) = setup16(&[0x9002]);
        cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_EBREAK));
        assert_eq!(cpu.pc, 0x100);
    }

    #[test]
    fn test_c_branches() {
        // c.beqz x8, +4
        let beqz: u16 = 0xc001 | (0 << 7) | (0b10 << 3); // imm[2:1] at 4:3
        let (mut cpu, mut ram) = setup16(&[beqz]);
        cpu.write_reg(8, 0);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.pc, RESET + 4);

        let (mut cpu, mut ram) = setup16(&[beqz]);
        cpu.write_reg(8, 1);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.pc, RESET + 2);
    }

    #[test]
    fn test_illegal16_all_zero() {
        let (mut cpu, mut ram) = setup16(&[0x0000]);
        cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_INSTR_ILLEGAL));
        // tval is the zero-extended 16-bit encoding
        assert_eq!(cpu.csr.read(super::super::csr::CSR_MTVAL), Some(0));
    }

    #[test]
    fn test_zcmp_push_pop_round_trip() {
        // cm.push {ra, s0-s2}, -32 : rlist=6 (3 regs)+... rlist 6 => ra,s0,s1
        let push: u16 = 0xb802 | (6 << 4);
        // cm.pop {ra, s0-s1}, +32
        let pop: u16 = 0xba02 | (6 << 4);
        let (mut cpu, mut ram) = setup16(&[push, pop]);
        cpu.write_reg(2, 0x2000);
        cpu.write_reg(1, 0x1111); // ra
        cpu.write_reg(8, 0x8888); // s0
        cpu.write_reg(9, 0x9999); // s1

        cpu.step(&mut ram, false);
        // Descending GPR order from sp: s1 at sp-4, s0 at sp-8, ra at sp-12
        assert_eq!(ram.r32(0x2000 - 4), Some(0x9999));
        assert_eq!(ram.r32(0x2000 - 8), Some(0x8888));
        assert_eq!(ram.r32(0x2000 - 12), Some(0x1111));
        assert_eq!(cpu.read_reg(2), 0x2000 - 0x10);

        // Clobber and pop back
        cpu.write_reg(1, 0);
        cpu.write_reg(8, 0);
        cpu.write_reg(9, 0);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.read_reg(1), 0x1111);
        assert_eq!(cpu.read_reg(8), 0x8888);
        assert_eq!(cpu.read_reg(9), 0x9999);
        assert_eq!(cpu.read_reg(2), 0x2000);
    }

    #[test]
    fn test_zcmp_popret_returns_and_popretz_clears_a0() {
        // Frame holding ra = 0x3000 at sp+12 (single-reg list, adj 16)
        let popret: u16 = 0xbe02 | (4 << 4);
        let (mut cpu, mut ram) = setup16(&[popret]);
        cpu.write_reg(2, 0x2000);
        cpu.write_reg(10, 0x5a5a);
        ram.w32(0x2000 + 12, 0x3000);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.pc, 0x3000);
        assert_eq!(cpu.read_reg(1), 0x3000);
        assert_eq!(cpu.read_reg(2), 0x2010);
        assert_eq!(cpu.read_reg(10), 0x5a5a); // popret leaves a0

        let popretz: u16 = 0xbc02 | (4 << 4);
        let (mut cpu, mut ram) = setup16(&[popretz]);
        cpu.write_reg(2, 0x2000);
        cpu.write_reg(10, 0x5a5a);
        ram.w32(0x2000 + 12, 0x3000);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.pc, 0x3000);
        assert_eq!(cpu.read_reg(10), 0); // popretz clears a0
    }

    #[test]
    fn test_zcmp_reserved_rlist_is_illegal() {
        let push: u16 = 0xb802 | (2 << 4); // rlist 2 is reserved
        let (mut cpu, mut ram) = setup16(&[push]);
        cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
        cpu.write_reg(2, 0x2000);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_INSTR_ILLEGAL));
    }

    #[test]
    fn test_zcmp_mv_pairs() {
        // cm.mvsa01 s0, s1 : r1s'=000, r2s'=001
        let mvsa: u16 = 0xac22 | (0 << 7) | (1 << 2);
        let (mut cpu, mut ram) = setup16(&[mvsa]);
        cpu.write_reg(10, 0xaaaa);
        cpu.write_reg(11, 0xbbbb);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.read_reg(8), 0xaaaa); // s0
        assert_eq!(cpu.read_reg(9), 0xbbbb); // s1

        // cm.mva01s s2, s3 maps through x18/x19
        let mva: u16 = 0xac62 | (2 << 7) | (3 << 2);
        let (mut cpu, mut ram) = setup16(&[mva]);
        cpu.write_reg(18, 0x1212);
        cpu.write_reg(19, 0x1313);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.read_reg(10), 0x1212);
        assert_eq!(cpu.read_reg(11), 0x1313);
    }

    #[test]
    fn test_zcmp_push_fault_keeps_sp() {
        // Stores land outside RAM: STORE_FAULT, sp must stay untouched
        let push: u16 = 0xb802 | (4 << 4);
        let (mut cpu, mut ram) = setup16(&[push]);
        cpu.csr.write(CSR_MTVEC, 0x100, CsrWriteOp::Write);
        cpu.write_reg(2, 0x0200_0000);
        cpu.step(&mut ram, false);
        assert_eq!(cpu.csr.read(CSR_MCAUSE), Some(XCAUSE_STORE_FAULT));
        assert_eq!(cpu.read_reg(2), 0x0200_0000);
    }
}
