//! Sv32 address translation
//!
//! Two-level page-table walk over physical memory, used for both
//! instruction fetch and data access. 4 KiB pages at the second level,
//! 4 MiB megapages at the first. A and D bits are updated in place; a
//! failed PTE read or write-back is a translation fault, reported by the
//! caller as the page-fault cause for the access kind.

use super::csr::{Csr, PTE_A, PTE_D, PTE_R, PTE_V, PTE_W, PTE_X};
use crate::memory::Bus;

/// Walk the tables for `vaddr` with the root at `atp`. Returns the physical
/// address, or None for any kind of translation fault.
fn walk(csr: &Csr, bus: &mut impl Bus, vaddr: u32, atp: u32, required: u32) -> Option<u32> {
    // First stage: vaddr bits 31:22 index the root table
    let addr_of_pte1 = atp.wrapping_add((vaddr >> 20) & 0xffc);
    let pte1 = bus.r32(addr_of_pte1)?;
    if pte1 & PTE_V == 0 {
        return None;
    }
    // Write-without-read is a reserved encoding
    if pte1 & PTE_W != 0 && pte1 & PTE_R == 0 {
        return None;
    }
    if pte1 & (PTE_X | PTE_W | PTE_R) != 0 {
        // Leaf at the first level: a 4 MiB megapage.
        // Permission check before touching A/D bits.
        if !csr.pte_permissions_ok(pte1, required) {
            return None;
        }
        // The low PPN bits must be clear so the leaf covers an aligned range
        if pte1 & 0x000f_fc00 != 0 {
            return None;
        }
        let pte1_a_d_update = pte1 | PTE_A | if required & PTE_W != 0 { PTE_D } else { 0 };
        if pte1_a_d_update != pte1 && !bus.w32(addr_of_pte1, pte1_a_d_update) {
            return None;
        }
        return Some(((pte1 << 2) & 0xffc0_0000) | (vaddr & 0x003f_ffff));
    }

    // Second stage: vaddr bits 21:12
    let addr_of_pte0 = ((pte1 << 2) & 0xffff_f000) | ((vaddr >> 10) & 0xffc);
    let pte0 = bus.r32(addr_of_pte0)?;
    // Must be a valid leaf
    if pte0 & PTE_V == 0 || pte0 & (PTE_X | PTE_W | PTE_R) == 0 {
        return None;
    }
    if pte0 & PTE_W != 0 && pte0 & PTE_R == 0 {
        return None;
    }
    if !csr.pte_permissions_ok(pte0, required) {
        return None;
    }
    let pte0_a_d_update = pte0 | PTE_A | if required & PTE_W != 0 { PTE_D } else { 0 };
    if pte0_a_d_update != pte0 && !bus.w32(addr_of_pte0, pte0_a_d_update) {
        return None;
    }
    Some(((pte0 << 2) & 0xffff_f000) | (vaddr & 0xfff))
}

/// Translate a load/store address. Identity when translation is off for
/// the effective (MPRV-adjusted) privilege.
pub fn vmap_ls(csr: &Csr, bus: &mut impl Bus, vaddr: u32, required: u32) -> Option<u32> {
    if csr.translation_enabled_ls() {
        walk(csr, bus, vaddr, csr.atp(), required)
    } else {
        Some(vaddr)
    }
}

/// Translate a fetch address. Identity when translation is off for the true
/// privilege; fetch ignores MPRV.
pub fn vmap_fetch(csr: &Csr, bus: &mut impl Bus, vaddr: u32) -> Option<u32> {
    if csr.translation_enabled_fetch() {
        walk(csr, bus, vaddr, csr.atp(), PTE_X)
    } else {
        Some(vaddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::csr::{
        CsrWriteOp, PrivilegeLevel, CSR_MSTATUS, CSR_SATP, MSTATUS_MPRV, PTE_U, SATP_MODE,
    };
    use crate::memory::Ram;

    // Root table at 0x4000, second-level table at 0x5000.
    const L1: u32 = 0x4000;
    const L0: u32 = 0x5000;

    fn setup() -> (Csr, Ram) {
        let mut csr = Csr::new();
        csr.write(CSR_SATP, SATP_MODE | (L1 >> 12), CsrWriteOp::Write);
        csr.priv_level = PrivilegeLevel::Supervisor;
        (csr, Ram::new(0x10000))
    }

    fn leaf(ppn: u32, flags: u32) -> u32 {
        (ppn << 10) | flags | PTE_V
    }

    #[test]
    fn test_bare_mode_is_identity() {
        let mut csr = Csr::new();
        let mut ram = Ram::new(0x1000);
        csr.priv_level = PrivilegeLevel::Supervisor;
        assert_eq!(vmap_ls(&csr, &mut ram, 0xdead_beef, PTE_R), Some(0xdead_beef));
        assert_eq!(vmap_fetch(&csr, &mut ram, 0x42), Some(0x42));
    }

    #[test]
    fn test_machine_mode_bypasses_translation() {
        let (mut csr, mut ram) = setup();
        csr.priv_level = PrivilegeLevel::Machine;
        assert_eq!(vmap_fetch(&csr, &mut ram, 0x1234), Some(0x1234));
        assert_eq!(vmap_ls(&csr, &mut ram, 0x1234, PTE_W), Some(0x1234));
    }

    #[test]
    fn test_megapage_translation() {
        let (csr, mut ram) = setup();
        // VPN1 0 -> megapage at physical 0x0040_0000
        ram.w32(L1, leaf(0x400, PTE_R | PTE_W));
        assert_eq!(
            vmap_ls(&csr, &mut ram, 0x0000_1234, PTE_R),
            Some(0x0040_1234)
        );
        // A bit set, D clear after a read
        let pte = ram.r32(L1).unwrap();
        assert_ne!(pte & PTE_A, 0);
        assert_eq!(pte & PTE_D, 0);
    }

    #[test]
    fn test_megapage_misaligned_ppn_faults() {
        let (csr, mut ram) = setup();
        // Nonzero low PPN bits in a first-level leaf
        ram.w32(L1, leaf(0x401, PTE_R | PTE_W));
        assert_eq!(vmap_ls(&csr, &mut ram, 0x0000_1234, PTE_R), None);
    }

    #[test]
    fn test_two_level_translation() {
        let (csr, mut ram) = setup();
        // VPN1 0 -> pointer to L0
        ram.w32(L1, leaf(L0 >> 12, 0));
        // VPN0 2 -> physical page 7
        ram.w32(L0 + 2 * 4, leaf(7, PTE_R | PTE_W));
        assert_eq!(
            vmap_ls(&csr, &mut ram, 0x0000_2abc, PTE_R),
            Some(0x0000_7abc)
        );
    }

    #[test]
    fn test_dirty_bit_on_store() {
        let (csr, mut ram) = setup();
        ram.w32(L1, leaf(L0 >> 12, 0));
        ram.w32(L0, leaf(7, PTE_R | PTE_W));
        assert!(vmap_ls(&csr, &mut ram, 0x0000_0123, PTE_W).is_some());
        let pte = ram.r32(L0).unwrap();
        assert_ne!(pte & PTE_A, 0);
        assert_ne!(pte & PTE_D, 0);
    }

    #[test]
    fn test_invalid_pte_faults() {
        let (csr, mut ram) = setup();
        // V clear
        ram.w32(L1, leaf(0, PTE_R) & !PTE_V);
        assert_eq!(vmap_ls(&csr, &mut ram, 0, PTE_R), None);
        // Pointer to a pointer (second level must be a leaf)
        ram.w32(L1, leaf(L0 >> 12, 0));
        ram.w32(L0, leaf(6, 0));
        assert_eq!(vmap_ls(&csr, &mut ram, 0, PTE_R), None);
    }

    #[test]
    fn test_reserved_w_without_r_faults() {
        let (csr, mut ram) = setup();
        ram.w32(L1, leaf(0x400, PTE_W));
        assert_eq!(vmap_ls(&csr, &mut ram, 0, PTE_W), None);
    }

    #[test]
    fn test_permission_mismatch_faults() {
        let (csr, mut ram) = setup();
        ram.w32(L1, leaf(L0 >> 12, 0));
        ram.w32(L0, leaf(7, PTE_R));
        assert!(vmap_ls(&csr, &mut ram, 0, PTE_R).is_some());
        assert_eq!(vmap_ls(&csr, &mut ram, 0, PTE_W), None);
        assert_eq!(vmap_fetch(&csr, &mut ram, 0), None);
    }

    #[test]
    fn test_user_page_from_user_mode() {
        let (mut csr, mut ram) = setup();
        ram.w32(L1, leaf(L0 >> 12, 0));
        ram.w32(L0, leaf(7, PTE_R | PTE_X | PTE_U));
        csr.priv_level = PrivilegeLevel::User;
        assert!(vmap_fetch(&csr, &mut ram, 0x0000_0040).is_some());
        // Revoking X faults the next fetch
        ram.w32(L0, leaf(7, PTE_R | PTE_U) | PTE_A);
        assert_eq!(vmap_fetch(&csr, &mut ram, 0x0000_0040), None);
    }

    #[test]
    fn test_pte_read_outside_memory_faults() {
        let (mut csr, mut ram) = setup();
        // Root beyond the end of RAM
        csr.priv_level = PrivilegeLevel::Machine;
        csr.write(CSR_SATP, SATP_MODE | 0x1000, CsrWriteOp::Write);
        csr.priv_level = PrivilegeLevel::Supervisor;
        assert_eq!(vmap_ls(&csr, &mut ram, 0, PTE_R), None);
    }

    #[test]
    fn test_mprv_applies_to_ls_only() {
        let (mut csr, mut ram) = setup();
        ram.w32(L1, leaf(L0 >> 12, 0));
        ram.w32(L0, leaf(7, PTE_R | PTE_W | PTE_X));
        csr.priv_level = PrivilegeLevel::Machine;
        csr.write(CSR_MSTATUS, MSTATUS_MPRV | (1 << 11), CsrWriteOp::Write);
        // Loads/stores translate at MPP = S
        assert_eq!(vmap_ls(&csr, &mut ram, 0x0000_0100, PTE_R), Some(0x0000_7100));
        // Fetch stays at the true privilege (M): identity
        assert_eq!(vmap_fetch(&csr, &mut ram, 0x0000_0100), Some(0x0000_0100));
    }
}
