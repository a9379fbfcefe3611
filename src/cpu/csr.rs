//! Control and Status Registers and the trap engine
//!
//! One structure owns all privileged state: the unified mstatus/sstatus
//! backing word, the unified interrupt enable/pending words, trap vectors
//! and syndromes for both M and S, delegation masks, counters, and the
//! current privilege level. Exception entry, interrupt entry, MRET and
//! SRET all funnel through `trap_enter_at_priv`.

use serde::{Deserialize, Serialize};

use super::trap::XCAUSE_IRQ_FLAG;

// CSR addresses. Bits [9:8] encode the minimum privilege, bits [11:10] ==
// 0b11 marks the register read-only.

// Supervisor trap setup / handling
pub const CSR_SSTATUS: u32 = 0x100;
pub const CSR_SIE: u32 = 0x104;
pub const CSR_STVEC: u32 = 0x105;
pub const CSR_SCOUNTEREN: u32 = 0x106;
pub const CSR_SSCRATCH: u32 = 0x140;
pub const CSR_SEPC: u32 = 0x141;
pub const CSR_SCAUSE: u32 = 0x142;
pub const CSR_STVAL: u32 = 0x143;
pub const CSR_SIP: u32 = 0x144;
pub const CSR_SATP: u32 = 0x180;

// Machine trap setup / handling
pub const CSR_MSTATUS: u32 = 0x300;
pub const CSR_MISA: u32 = 0x301;
pub const CSR_MEDELEG: u32 = 0x302;
pub const CSR_MIDELEG: u32 = 0x303;
pub const CSR_MIE: u32 = 0x304;
pub const CSR_MTVEC: u32 = 0x305;
pub const CSR_MCOUNTEREN: u32 = 0x306;
pub const CSR_MSCRATCH: u32 = 0x340;
pub const CSR_MEPC: u32 = 0x341;
pub const CSR_MCAUSE: u32 = 0x342;
pub const CSR_MTVAL: u32 = 0x343;
pub const CSR_MIP: u32 = 0x344;

// Machine counters
pub const CSR_MCYCLE: u32 = 0xb00;
pub const CSR_MINSTRET: u32 = 0xb02;
pub const CSR_MCYCLEH: u32 = 0xb80;
pub const CSR_MINSTRETH: u32 = 0xb82;

// Unprivileged counter shadows
pub const CSR_CYCLE: u32 = 0xc00;
pub const CSR_INSTRET: u32 = 0xc02;
pub const CSR_CYCLEH: u32 = 0xc80;
pub const CSR_INSTRETH: u32 = 0xc82;

// Machine ID
pub const CSR_MVENDORID: u32 = 0xf11;
pub const CSR_MARCHID: u32 = 0xf12;
pub const CSR_MIMPID: u32 = 0xf13;
pub const CSR_MHARTID: u32 = 0xf14;

// mstatus bits
pub const MSTATUS_SIE: u32 = 1 << 1;
pub const MSTATUS_MIE: u32 = 1 << 3;
pub const MSTATUS_SPIE: u32 = 1 << 5;
pub const MSTATUS_MPIE: u32 = 1 << 7;
pub const MSTATUS_SPP: u32 = 1 << 8;
pub const MSTATUS_MPP: u32 = 3 << 11;
pub const MSTATUS_MPRV: u32 = 1 << 17;
pub const MSTATUS_SUM: u32 = 1 << 18;
pub const MSTATUS_MXR: u32 = 1 << 19;
pub const MSTATUS_TVM: u32 = 1 << 20;
pub const MSTATUS_TW: u32 = 1 << 21;
pub const MSTATUS_TSR: u32 = 1 << 22;

/// sstatus is this masked view of the shared backing word.
pub const SSTATUS_MASK: u32 =
    MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP | MSTATUS_SUM | MSTATUS_MXR;

pub const MSTATUS_MASK: u32 = SSTATUS_MASK
    | MSTATUS_MIE
    | MSTATUS_MPIE
    | MSTATUS_MPP
    | MSTATUS_MPRV
    | MSTATUS_TVM
    | MSTATUS_TW
    | MSTATUS_TSR;

// mip/mie interrupt lanes
pub const MIP_SSIP: u32 = 1 << 1;
pub const MIP_MSIP: u32 = 1 << 3;
pub const MIP_STIP: u32 = 1 << 5;
pub const MIP_MTIP: u32 = 1 << 7;
pub const MIP_SEIP: u32 = 1 << 9;
pub const MIP_MEIP: u32 = 1 << 11;

pub const MIP_MASK: u32 = MIP_SSIP | MIP_MSIP | MIP_STIP | MIP_MTIP | MIP_SEIP | MIP_MEIP;
pub const SIP_MASK: u32 = MIP_SSIP | MIP_STIP | MIP_SEIP;

// satp fields
pub const SATP_MODE: u32 = 1 << 31;
pub const SATP_ASID: u32 = 0x1ff << 22;
pub const SATP_PPN: u32 = 0x003f_ffff;

// Sv32 PTE fields
pub const PTE_V: u32 = 1 << 0;
pub const PTE_R: u32 = 1 << 1;
pub const PTE_W: u32 = 1 << 2;
pub const PTE_X: u32 = 1 << 3;
pub const PTE_U: u32 = 1 << 4;
pub const PTE_A: u32 = 1 << 6;
pub const PTE_D: u32 = 1 << 7;

/// misa readback: RV32IMAC with S and U support.
pub const MISA_VALUE: u32 = 0x4010_1105;

/// Privilege levels
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl From<u32> for PrivilegeLevel {
    fn from(val: u32) -> Self {
        match val & 3 {
            0 => PrivilegeLevel::User,
            1 => PrivilegeLevel::Supervisor,
            _ => PrivilegeLevel::Machine,
        }
    }
}

/// Read-modify-write behaviour of a CSR access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CsrWriteOp {
    Write,
    Set,
    Clear,
}

/// CSR file and trap state for one hart.
#[derive(Serialize, Deserialize)]
pub struct Csr {
    /// Current privilege level
    pub priv_level: PrivilegeLevel,

    /// Latched external IRQ lines, ORed into the mip readback
    irq_t: bool,
    irq_s: bool,
    irq_e: bool,

    /// Shared mstatus/sstatus backing word
    xstatus: u32,
    /// Shared mie/sie backing word
    xie: u32,
    /// Shared mip/sip backing word (software-writable lanes only)
    xip: u32,
    mtvec: u32,
    mtval: u32,
    mscratch: u32,
    mepc: u32,
    mcause: u32,
    medeleg: u32,
    mideleg: u32,

    mcounteren: u32,
    mcycle: u32,
    mcycleh: u32,
    minstret: u32,
    minstreth: u32,

    stvec: u32,
    stval: u32,
    scounteren: u32,
    sscratch: u32,
    sepc: u32,
    scause: u32,
    satp: u32,
}

impl Csr {
    pub fn new() -> Self {
        Csr {
            priv_level: PrivilegeLevel::Machine,
            irq_t: false,
            irq_s: false,
            irq_e: false,
            xstatus: 0,
            xie: 0,
            xip: 0,
            mtvec: 0,
            mtval: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            medeleg: 0,
            mideleg: 0,
            mcounteren: 0,
            mcycle: 0,
            mcycleh: 0,
            minstret: 0,
            minstreth: 0,
            stvec: 0,
            stval: 0,
            scounteren: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            satp: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Csr::new();
    }

    /// mip readback is the stored word ORed with the latched IRQ lines.
    /// The latched bits are volatile and never written back into storage.
    fn effective_xip(&self) -> u32 {
        let mut xip = self.xip;
        if self.irq_s {
            xip |= MIP_MSIP | MIP_SSIP;
        }
        if self.irq_t {
            xip |= MIP_MTIP | MIP_STIP;
        }
        if self.irq_e {
            xip |= MIP_MEIP | MIP_SEIP;
        }
        xip
    }

    /// Read a CSR. Returns None on a permission or decode failure.
    pub fn read(&self, addr: u32) -> Option<u32> {
        // Minimum privilege check
        if addr >= 1 << 12 || (addr >> 8) & 0x3 > self.priv_level as u32 {
            return None;
        }
        // Additional per-register permission checks
        let priv_level = self.priv_level;
        let permit_cycle = (priv_level >= PrivilegeLevel::Machine || self.mcounteren & 0x1 != 0)
            && (priv_level >= PrivilegeLevel::Supervisor || self.scounteren & 0x1 != 0);
        let permit_instret = (priv_level >= PrivilegeLevel::Machine || self.mcounteren & 0x4 != 0)
            && (priv_level >= PrivilegeLevel::Supervisor || self.scounteren & 0x4 != 0);

        match addr {
            // Machine ID
            CSR_MISA => Some(MISA_VALUE),
            CSR_MHARTID => Some(0),
            CSR_MARCHID => Some(0),
            CSR_MIMPID => Some(0),
            CSR_MVENDORID => Some(0),

            // Machine trap handling
            CSR_MSTATUS => Some(self.xstatus & MSTATUS_MASK),
            CSR_MIE => Some(self.xie & MIP_MASK),
            CSR_MIP => Some(self.effective_xip() & MIP_MASK),
            CSR_MTVEC => Some(self.mtvec),
            CSR_MSCRATCH => Some(self.mscratch),
            CSR_MEPC => Some(self.mepc),
            CSR_MCAUSE => Some(self.mcause),
            CSR_MTVAL => Some(self.mtval),
            CSR_MEDELEG => Some(self.medeleg),
            CSR_MIDELEG => Some(self.mideleg),

            // Machine counters
            CSR_MCOUNTEREN => Some(self.mcounteren),
            CSR_MCYCLE => Some(self.mcycle),
            CSR_MCYCLEH => Some(self.mcycleh),
            CSR_MINSTRET => Some(self.minstret),
            CSR_MINSTRETH => Some(self.minstreth),

            // Supervisor trap handling
            CSR_SSTATUS => Some(self.xstatus & SSTATUS_MASK),
            CSR_SIE => Some(self.xie & SIP_MASK),
            CSR_SIP => Some(self.effective_xip() & SIP_MASK & self.mideleg),
            CSR_STVEC => Some(self.stvec),
            CSR_SCOUNTEREN => Some(self.scounteren),
            CSR_SSCRATCH => Some(self.sscratch),
            CSR_SEPC => Some(self.sepc),
            CSR_SCAUSE => Some(self.scause),
            CSR_STVAL => Some(self.stval),
            CSR_SATP => {
                if self.permit_satp() {
                    Some(self.satp)
                } else {
                    None
                }
            }

            // Unprivileged counter shadows
            CSR_CYCLE => permit_cycle.then_some(self.mcycle),
            CSR_CYCLEH => permit_cycle.then_some(self.mcycleh),
            CSR_INSTRET => permit_instret.then_some(self.minstret),
            CSR_INSTRETH => permit_instret.then_some(self.minstreth),

            _ => None,
        }
    }

    /// Write a CSR, applying the per-register WARL mask.
    /// Returns false on a permission or decode failure.
    pub fn write(&mut self, addr: u32, data: u32, op: CsrWriteOp) -> bool {
        // Minimum privilege check, and reject read-only registers
        if addr >= 1 << 12
            || (addr >> 8) & 0x3 > self.priv_level as u32
            || (addr >> 10) & 0x3 == 0x3
        {
            return false;
        }

        // Read-modify-write behaviour for the set/clear forms
        let data = match op {
            CsrWriteOp::Write => data,
            CsrWriteOp::Set | CsrWriteOp::Clear => {
                let rdata = match self.read(addr) {
                    Some(rdata) => rdata,
                    None => return false,
                };
                if op == CsrWriteOp::Set {
                    rdata | data
                } else {
                    rdata & !data
                }
            }
        };

        match addr {
            CSR_MISA => {}
            CSR_MHARTID => {}
            CSR_MARCHID => {}
            CSR_MIMPID => {}
            CSR_MVENDORID => {}

            CSR_MSTATUS => {
                self.xstatus = (data & MSTATUS_MASK) | (self.xstatus & !MSTATUS_MASK)
            }
            CSR_MIE => self.xie = data & MIP_MASK,
            // Only the supervisor lanes of mip are software-writable; the
            // machine lanes come from the external IRQ latches.
            CSR_MIP => self.xip = (self.xip & !SIP_MASK) | (data & SIP_MASK),
            CSR_MTVEC => self.mtvec = data & 0xffff_fffd,
            CSR_MSCRATCH => self.mscratch = data,
            CSR_MEPC => self.mepc = data & 0xffff_fffe,
            CSR_MCAUSE => self.mcause = data & 0x8000_00ff,
            CSR_MTVAL => self.mtval = data,
            CSR_MEDELEG => self.medeleg = data,
            CSR_MIDELEG => self.mideleg = data,

            CSR_MCOUNTEREN => self.mcounteren = data & 0x7,
            CSR_MCYCLE => self.mcycle = data,
            CSR_MCYCLEH => self.mcycleh = data,
            CSR_MINSTRET => self.minstret = data,
            CSR_MINSTRETH => self.minstreth = data,

            CSR_SSTATUS => {
                self.xstatus = (data & SSTATUS_MASK) | (self.xstatus & !SSTATUS_MASK)
            }
            CSR_SIE => self.xie = (self.xie & !SIP_MASK) | (data & SIP_MASK),
            CSR_SIP => {
                let mask = SIP_MASK & self.mideleg;
                self.xip = (self.xip & !mask) | (data & mask);
            }
            CSR_STVEC => self.stvec = data & 0xffff_fffd,
            CSR_SCOUNTEREN => self.scounteren = data & 0x7,
            CSR_SSCRATCH => self.sscratch = data,
            CSR_SEPC => self.sepc = data & 0xffff_fffe,
            CSR_SCAUSE => self.scause = data & 0x8000_00ff,
            CSR_STVAL => self.stval = data,
            CSR_SATP => {
                if self.permit_satp() {
                    self.satp = data & !SATP_ASID;
                } else {
                    return false;
                }
            }

            _ => return false,
        }
        true
    }

    /// Advance the 64-bit cycle and instret counters by one.
    pub fn step_counters(&mut self) {
        let mcycle_next = (((self.mcycleh as u64) << 32) | self.mcycle as u64).wrapping_add(1);
        self.mcycle = mcycle_next as u32;
        self.mcycleh = (mcycle_next >> 32) as u32;
        let minstret_next =
            (((self.minstreth as u64) << 32) | self.minstret as u64).wrapping_add(1);
        self.minstret = minstret_next as u32;
        self.minstreth = (minstret_next >> 32) as u32;
    }

    /// Update trap state for entry at `target_priv`, which must not be below
    /// the current privilege. Returns the trap target PC.
    fn trap_enter_at_priv(&mut self, xcause: u32, xepc: u32, target_priv: PrivilegeLevel) -> u32 {
        debug_assert!(target_priv >= self.priv_level);
        if target_priv == PrivilegeLevel::Machine {
            self.xstatus =
                (self.xstatus & !MSTATUS_MPP) | ((self.priv_level as u32) << 11);
            self.priv_level = PrivilegeLevel::Machine;

            if self.xstatus & MSTATUS_MIE != 0 {
                self.xstatus |= MSTATUS_MPIE;
            }
            self.xstatus &= !MSTATUS_MIE;

            self.mcause = xcause;
            self.mepc = xepc;
            if self.mtvec & 0x1 != 0 && xcause & XCAUSE_IRQ_FLAG != 0 {
                (self.mtvec & !1).wrapping_add(4 * (xcause & !XCAUSE_IRQ_FLAG))
            } else {
                self.mtvec & !1
            }
        } else {
            debug_assert!(target_priv == PrivilegeLevel::Supervisor);
            self.xstatus =
                (self.xstatus & !MSTATUS_SPP) | (((self.priv_level as u32) & 1) << 8);
            self.priv_level = PrivilegeLevel::Supervisor;

            if self.xstatus & MSTATUS_SIE != 0 {
                self.xstatus |= MSTATUS_SPIE;
            }
            self.xstatus &= !MSTATUS_SIE;

            self.scause = xcause;
            self.sepc = xepc;
            if self.stvec & 0x1 != 0 && xcause & XCAUSE_IRQ_FLAG != 0 {
                (self.stvec & !1).wrapping_add(4 * (xcause & !XCAUSE_IRQ_FLAG))
            } else {
                self.stvec & !1
            }
        }
    }

    /// Enter a synchronous exception: delegation picks the target privilege,
    /// never below the current one. Returns the trap target PC.
    pub fn trap_enter_exception(&mut self, xcause: u32, xepc: u32) -> u32 {
        debug_assert!(xcause < 32);
        let mut target = if self.medeleg & (1 << xcause) != 0 {
            PrivilegeLevel::Supervisor
        } else {
            PrivilegeLevel::Machine
        };
        if target < self.priv_level {
            target = self.priv_level;
        }
        self.trap_enter_at_priv(xcause, xepc, target)
    }

    /// If an interrupt must be taken now, enter it and return its target PC.
    ///
    /// `xepc` is the tentative next PC of the completing instruction, so the
    /// interrupted flow resumes after it.
    pub fn trap_check_enter_irq(&mut self, xepc: u32) -> Option<u32> {
        let effective_xip = self.effective_xip();
        let m_targeted = effective_xip & self.xie & MIP_MASK & !self.mideleg;
        let s_targeted = effective_xip & self.xie & SIP_MASK & self.mideleg;

        let take_m = m_targeted != 0
            && (self.xstatus & MSTATUS_MIE != 0 || self.priv_level < PrivilegeLevel::Machine);
        let take_s = s_targeted != 0
            && (self.xstatus & MSTATUS_SIE != 0 || self.priv_level < PrivilegeLevel::Supervisor)
            && self.priv_level <= PrivilegeLevel::Supervisor;

        if take_m {
            let cause = XCAUSE_IRQ_FLAG | m_targeted.trailing_zeros();
            Some(self.trap_enter_at_priv(cause, xepc, PrivilegeLevel::Machine))
        } else if take_s {
            let cause = XCAUSE_IRQ_FLAG | s_targeted.trailing_zeros();
            Some(self.trap_enter_at_priv(cause, xepc, PrivilegeLevel::Supervisor))
        } else {
            None
        }
    }

    /// MRET: restore the privilege stacked in MPP. Returns mepc.
    pub fn trap_mret(&mut self) -> u32 {
        let pp = PrivilegeLevel::from((self.xstatus >> 11) & 0x3);
        self.priv_level = pp;
        self.xstatus &= !MSTATUS_MPP;
        if pp != PrivilegeLevel::Machine {
            self.xstatus &= !MSTATUS_MPRV;
        }
        if self.xstatus & MSTATUS_MPIE != 0 {
            self.xstatus |= MSTATUS_MIE;
        } else {
            self.xstatus &= !MSTATUS_MIE;
        }
        self.xstatus |= MSTATUS_MPIE;
        self.mepc
    }

    /// SRET: restore the privilege stacked in SPP. Returns sepc.
    /// The TSR/permission checks are the executor's responsibility.
    pub fn trap_sret(&mut self) -> u32 {
        self.priv_level = PrivilegeLevel::from((self.xstatus >> 8) & 0x1);
        self.xstatus &= !MSTATUS_SPP;
        if self.xstatus & MSTATUS_SPIE != 0 {
            self.xstatus |= MSTATUS_SIE;
        } else {
            self.xstatus &= !MSTATUS_SIE;
        }
        self.xstatus |= MSTATUS_SPIE;
        // Target of sret is never M, so MPRV is always cleared.
        self.xstatus &= !MSTATUS_MPRV;
        self.sepc
    }

    /// Write the trap value register of the current (post-entry) privilege.
    pub fn trap_set_xtval(&mut self, xtval: u32) {
        assert!(self.priv_level >= PrivilegeLevel::Supervisor);
        if self.priv_level == PrivilegeLevel::Supervisor {
            self.stval = xtval;
        } else {
            self.mtval = xtval;
        }
    }

    /// True privilege, which is also the effective privilege for instruction
    /// fetch (fetch is not affected by MPRV).
    pub fn true_priv(&self) -> PrivilegeLevel {
        self.priv_level
    }

    /// Effective privilege for loads and stores: MPP while MPRV is set.
    pub fn effective_priv_ls(&self) -> PrivilegeLevel {
        if self.xstatus & MSTATUS_MPRV != 0 {
            assert!(self.priv_level == PrivilegeLevel::Machine);
            PrivilegeLevel::from((self.xstatus >> 11) & 0x3)
        } else {
            self.priv_level
        }
    }

    pub fn translation_enabled_fetch(&self) -> bool {
        self.true_priv() != PrivilegeLevel::Machine && self.satp & SATP_MODE != 0
    }

    pub fn translation_enabled_ls(&self) -> bool {
        self.effective_priv_ls() != PrivilegeLevel::Machine && self.satp & SATP_MODE != 0
    }

    /// Physical address of the root page table.
    pub fn atp(&self) -> u32 {
        (self.satp & SATP_PPN) << 12
    }

    fn permit_satp(&self) -> bool {
        self.priv_level >= PrivilegeLevel::Machine || self.xstatus & MSTATUS_TVM == 0
    }

    pub fn permit_sfence_vma(&self) -> bool {
        self.priv_level == PrivilegeLevel::Machine
            || (self.priv_level == PrivilegeLevel::Supervisor
                && self.xstatus & MSTATUS_TVM == 0)
    }

    pub fn sret_trapped_by_tsr(&self) -> bool {
        self.priv_level == PrivilegeLevel::Supervisor && self.xstatus & MSTATUS_TSR != 0
    }

    /// Check a leaf PTE's permissions against the access's requirements.
    /// X in the requirements marks the access as an instruction fetch.
    pub fn pte_permissions_ok(&self, pte: u32, required: u32) -> bool {
        let effective_priv = if required & PTE_X != 0 {
            self.true_priv()
        } else {
            self.effective_priv_ls()
        };
        debug_assert!(effective_priv <= PrivilegeLevel::Supervisor);

        // S access to a user page needs SUM
        if pte & PTE_U != 0
            && effective_priv == PrivilegeLevel::Supervisor
            && self.xstatus & MSTATUS_SUM == 0
        {
            return false;
        }
        // U access to a supervisor page never succeeds
        if pte & PTE_U == 0 && effective_priv == PrivilegeLevel::User {
            return false;
        }
        let mut permissions = pte & (PTE_R | PTE_W | PTE_X);
        if self.xstatus & MSTATUS_MXR != 0 && permissions & PTE_X != 0 {
            permissions |= PTE_R;
        }
        !permissions & required == 0
    }

    pub fn set_irq_t(&mut self, irq: bool) {
        self.irq_t = irq;
    }

    pub fn set_irq_s(&mut self, irq: bool) {
        self.irq_s = irq;
    }

    pub fn set_irq_e(&mut self, irq: bool) {
        self.irq_e = irq;
    }
}

impl Default for Csr {
    fn default() -> Self {
        Self::new()
    }
}
