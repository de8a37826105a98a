//! Control and status registers
//!
//! From the unprivileged spec version 20191213, chapter 9: "RISC-V
//! defines a separate address space of 4096 Control and Status
//! registers associated with each hart". This file implements the
//! subset of that space the memory subsystem reads and writes,
//! holding each register as an explicit field rather than an
//! address-indexed map. CSR address decoding and the Zicsr
//! instructions live with the execution pipeline, which calls the
//! `csr_*` accessors here.
//!
//! Registers implemented (privileged spec v20211203):
//!
//! - satp (section 4.1.11): bits 63:60 select the paging mode (0 =
//!   bare, 8 = Sv39), bits 43:0 hold the physical page number of the
//!   root page table. Bits 59:44 (ASID and the unused PPN bits) are
//!   WARL zero here, since no translation caching keys off the ASID.
//! - mstatus: only the fields that influence memory accesses are
//!   interpreted - MPP (bits 12:11), MPRV (bit 17), SUM (bit 18) and
//!   MXR (bit 19). The remaining bits are stored but not consulted.
//! - medeleg: exception delegation mask, used to pick the trap-value
//!   register when a fault is recorded.
//! - mtval/stval: trap-value registers, written with the faulting
//!   virtual address before an exception is returned.
//! - pmpaddr0-15 and the packed pmpcfg0/pmpcfg2 pair (section 3.7),
//!   plus the structurally identical spmpaddr/spmpcfg arrays for the
//!   supervisor-mode protection unit.
//!
//! The current privilege mode is kept here too. It is not a CSR, but
//! it travels with the same architectural state and every consumer of
//! this struct needs it to derive the effective mode of an access.

use crate::utils::{deposit_field, extract_field};

use super::trap::Exception;
use super::PrivilegeMode;

/// Number of PMP region entries
pub const PMP_COUNT: usize = 16;

/// Number of SPMP region entries
pub const SPMP_COUNT: usize = 16;

// mstatus fields
pub const MSTATUS_MPP: u64 = 11;
pub const MSTATUS_MPRV: u64 = 17;
pub const MSTATUS_SUM: u64 = 18;
pub const MSTATUS_MXR: u64 = 19;

// satp paging-mode selector values
pub const SATP_MODE_BARE: u64 = 0;
pub const SATP_MODE_SV39: u64 = 8;

/// Architectural register file for the memory subsystem
#[derive(Debug)]
pub struct Csr {
    /// Current privilege mode of the hart
    pub mode: PrivilegeMode,
    mstatus: u64,
    satp: u64,
    medeleg: u64,
    mtval: u64,
    stval: u64,
    pmpcfg: [u64; PMP_COUNT / 8],
    pmpaddr: [u64; PMP_COUNT],
    spmpcfg: [u64; SPMP_COUNT / 8],
    spmpaddr: [u64; SPMP_COUNT],
}

impl Default for Csr {
    fn default() -> Self {
        Self {
            // Harts come out of reset in machine mode
            mode: PrivilegeMode::Machine,
            mstatus: 0,
            satp: 0,
            medeleg: 0,
            mtval: 0,
            stval: 0,
            pmpcfg: [0; PMP_COUNT / 8],
            pmpaddr: [0; PMP_COUNT],
            spmpcfg: [0; SPMP_COUNT / 8],
            spmpaddr: [0; SPMP_COUNT],
        }
    }
}

impl Csr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn csr_mstatus(&self) -> u64 {
        self.mstatus
    }

    pub fn csr_write_mstatus(&mut self, value: u64) {
        self.mstatus = value;
    }

    /// The MPRV bit: data accesses use the privilege in MPP
    pub fn mprv(&self) -> bool {
        self.mstatus >> MSTATUS_MPRV & 1 != 0
    }

    /// The previous privilege mode (MPP field)
    pub fn mpp(&self) -> PrivilegeMode {
        PrivilegeMode::from_bits(extract_field(self.mstatus, MSTATUS_MPP + 1, MSTATUS_MPP))
    }

    /// The SUM bit: permit supervisor access to user pages
    pub fn sum(&self) -> bool {
        self.mstatus >> MSTATUS_SUM & 1 != 0
    }

    /// The MXR bit: make executable pages readable
    pub fn mxr(&self) -> bool {
        self.mstatus >> MSTATUS_MXR & 1 != 0
    }

    /// The privilege mode that governs an access
    ///
    /// When MPRV is set, data accesses are performed with the
    /// privilege in MPP. Instruction fetches are never affected by
    /// MPRV (section 3.1.6.3 of the privileged spec).
    pub fn effective_mode(&self, ifetch: bool) -> PrivilegeMode {
        if self.mprv() && !ifetch {
            self.mpp()
        } else {
            self.mode
        }
    }

    pub fn csr_satp(&self) -> u64 {
        self.satp
    }

    /// Write satp. The ASID field and the PPN bits above the
    /// supported physical address range are WARL zero.
    pub fn csr_write_satp(&mut self, value: u64) {
        let mode = extract_field(value, 63, 60);
        let ppn = extract_field(value, 43, 0);
        self.satp = mode << 60 | ppn;
    }

    /// The paging-mode selector field of satp
    pub fn satp_mode(&self) -> u64 {
        extract_field(self.satp, 63, 60)
    }

    /// The root-table physical page number field of satp
    pub fn satp_ppn(&self) -> u64 {
        extract_field(self.satp, 43, 0)
    }

    pub fn csr_medeleg(&self) -> u64 {
        self.medeleg
    }

    pub fn csr_write_medeleg(&mut self, value: u64) {
        self.medeleg = value;
    }

    /// Whether this exception traps to supervisor mode
    ///
    /// Exceptions raised while below machine mode are delegated when
    /// the corresponding medeleg bit is set (section 3.1.8).
    pub fn exception_delegated(&self, ex: Exception) -> bool {
        self.mode < PrivilegeMode::Machine && self.medeleg >> ex.cause() & 1 != 0
    }

    pub fn csr_mtval(&self) -> u64 {
        self.mtval
    }

    pub fn csr_write_mtval(&mut self, value: u64) {
        self.mtval = value;
    }

    pub fn csr_stval(&self) -> u64 {
        self.stval
    }

    pub fn csr_write_stval(&mut self, value: u64) {
        self.stval = value;
    }

    /// Record the trap value for an exception about to be raised
    ///
    /// Writes stval when the exception is delegated to supervisor
    /// mode, mtval otherwise.
    pub fn set_trap_value(&mut self, ex: Exception, value: u64) {
        if self.exception_delegated(ex) {
            self.stval = value;
        } else {
            self.mtval = value;
        }
    }

    /// Configuration byte of PMP entry i, extracted from the packed
    /// pmpcfg0/pmpcfg2 pair
    pub fn pmpcfg_from_index(&self, i: usize) -> u8 {
        (self.pmpcfg[i / 8] >> (8 * (i % 8))) as u8
    }

    /// Address register of PMP entry i
    pub fn pmpaddr_from_index(&self, i: usize) -> u64 {
        self.pmpaddr.get(i).copied().unwrap_or(0)
    }

    /// Write one of the packed PMP configuration registers; n is 0
    /// for pmpcfg0, 1 for pmpcfg2
    pub fn csr_write_pmpcfg(&mut self, n: usize, value: u64) {
        self.pmpcfg[n] = value;
    }

    /// Write pmpaddr i. The register is WARL and holds bits 55:2 of
    /// the region address, so only the low 54 bits are kept.
    pub fn csr_write_pmpaddr(&mut self, i: usize, value: u64) {
        self.pmpaddr[i] = extract_field(value, 53, 0);
    }

    /// Install PMP entry i in one step (address plus config byte)
    pub fn set_pmp_entry(&mut self, i: usize, cfg: u8, addr: u64) {
        self.csr_write_pmpaddr(i, addr);
        let group = self.pmpcfg[i / 8];
        let lo = 8 * (i % 8) as u64;
        self.pmpcfg[i / 8] = deposit_field(group, lo + 7, lo, cfg.into());
    }

    /// Configuration byte of SPMP entry i
    pub fn spmpcfg_from_index(&self, i: usize) -> u8 {
        (self.spmpcfg[i / 8] >> (8 * (i % 8))) as u8
    }

    /// Address register of SPMP entry i
    pub fn spmpaddr_from_index(&self, i: usize) -> u64 {
        self.spmpaddr.get(i).copied().unwrap_or(0)
    }

    pub fn csr_write_spmpcfg(&mut self, n: usize, value: u64) {
        self.spmpcfg[n] = value;
    }

    pub fn csr_write_spmpaddr(&mut self, i: usize, value: u64) {
        self.spmpaddr[i] = extract_field(value, 53, 0);
    }

    /// Install SPMP entry i in one step (address plus config byte)
    pub fn set_spmp_entry(&mut self, i: usize, cfg: u8, addr: u64) {
        self.csr_write_spmpaddr(i, addr);
        let group = self.spmpcfg[i / 8];
        let lo = 8 * (i % 8) as u64;
        self.spmpcfg[i / 8] = deposit_field(group, lo + 7, lo, cfg.into());
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_mstatus_fields() {
        let mut csr = Csr::new();
        csr.csr_write_mstatus(1 << MSTATUS_MPRV | 1 << MSTATUS_SUM | 1 << MSTATUS_MXR);
        assert!(csr.mprv());
        assert!(csr.sum());
        assert!(csr.mxr());
        assert_eq!(csr.mpp(), PrivilegeMode::User);
        csr.csr_write_mstatus(0b01 << MSTATUS_MPP);
        assert_eq!(csr.mpp(), PrivilegeMode::Supervisor);
        assert!(!csr.mprv());
    }

    #[test]
    fn check_effective_mode_override_is_data_only() {
        let mut csr = Csr::new();
        csr.mode = PrivilegeMode::Machine;
        csr.csr_write_mstatus(1 << MSTATUS_MPRV | 0b01 << MSTATUS_MPP);
        // MPRV redirects data accesses to MPP, never fetches
        assert_eq!(csr.effective_mode(false), PrivilegeMode::Supervisor);
        assert_eq!(csr.effective_mode(true), PrivilegeMode::Machine);
    }

    #[test]
    fn check_satp_decode() {
        let mut csr = Csr::new();
        csr.csr_write_satp(SATP_MODE_SV39 << 60 | 0x8_1234);
        assert_eq!(csr.satp_mode(), SATP_MODE_SV39);
        assert_eq!(csr.satp_ppn(), 0x8_1234);
        // ASID bits are WARL zero
        csr.csr_write_satp(SATP_MODE_SV39 << 60 | 0xffff << 44 | 1);
        assert_eq!(csr.csr_satp(), SATP_MODE_SV39 << 60 | 1);
    }

    #[test]
    fn check_trap_value_delegation() {
        let mut csr = Csr::new();
        let ex = Exception::LoadPageFault;
        csr.mode = PrivilegeMode::Supervisor;
        csr.set_trap_value(ex, 0x1000);
        assert_eq!(csr.csr_mtval(), 0x1000);
        assert_eq!(csr.csr_stval(), 0);
        csr.csr_write_medeleg(1 << ex.cause());
        csr.set_trap_value(ex, 0x2000);
        assert_eq!(csr.csr_stval(), 0x2000);
        // Machine mode ignores delegation
        csr.mode = PrivilegeMode::Machine;
        csr.set_trap_value(ex, 0x3000);
        assert_eq!(csr.csr_mtval(), 0x3000);
    }

    #[test]
    fn check_pmpcfg_byte_packing() {
        let mut csr = Csr::new();
        csr.csr_write_pmpcfg(0, 0x8877_6655_4433_2211);
        csr.csr_write_pmpcfg(1, 0xff00_0000_0000_00aa);
        assert_eq!(csr.pmpcfg_from_index(0), 0x11);
        assert_eq!(csr.pmpcfg_from_index(3), 0x44);
        assert_eq!(csr.pmpcfg_from_index(7), 0x88);
        assert_eq!(csr.pmpcfg_from_index(8), 0xaa);
        assert_eq!(csr.pmpcfg_from_index(15), 0xff);
    }

    #[test]
    fn check_set_pmp_entry_round_trip() {
        let mut csr = Csr::new();
        csr.set_pmp_entry(9, 0x1f, 0x2000_0000);
        assert_eq!(csr.pmpcfg_from_index(9), 0x1f);
        assert_eq!(csr.pmpaddr_from_index(9), 0x2000_0000);
        // Neighbouring config bytes are untouched
        assert_eq!(csr.pmpcfg_from_index(8), 0);
        assert_eq!(csr.pmpcfg_from_index(10), 0);
    }

    #[test]
    fn check_pmpaddr_warl_width() {
        let mut csr = Csr::new();
        csr.csr_write_pmpaddr(0, u64::MAX);
        assert_eq!(csr.pmpaddr_from_index(0), (1 << 54) - 1);
    }

    #[test]
    fn check_out_of_range_region_reads_zero() {
        let csr = Csr::new();
        assert_eq!(csr.pmpaddr_from_index(PMP_COUNT), 0);
        assert_eq!(csr.spmpaddr_from_index(SPMP_COUNT), 0);
    }
}
