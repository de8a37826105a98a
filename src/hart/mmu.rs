//! Sv39 address translation
//!
//! This file implements the virtual-memory view of the hart: the
//! canonical-address and alignment checks that run ahead of any
//! translation, the cached translate/direct routing decision for
//! fetches and data accesses, the three-level Sv39 page walk, and the
//! permission rules applied at the leaf. References to the privileged
//! spec refer to version 20211203, sections 4.3 and 4.4.
//!
//! The walk is performed in full on every access; there is no TLB.
//! Translation failures never return to the remaining walk logic:
//! the fault is recorded in the trap-value register and the
//! [`Exception`] is returned immediately, to be delivered at the
//! instruction-execution boundary.
//!
//! Accessed/dirty maintenance follows one of two policies selected in
//! [`MmuConfig`]: the walker either updates the bits itself and
//! writes the entry back (hardware policy), or raises the page fault
//! so that trap-handler software performs the update and the access
//! is retried (exception policy, used when running lock-step against
//! a core that traps for A/D updates).

use log::{debug, trace, warn};

use crate::utils::{extract_field, mask};

use super::csr::{Csr, SATP_MODE_BARE, SATP_MODE_SV39};
use super::guide::{cross_page_fetch_mismatch, ExecutionGuide, ForceLimiter};
use super::memory::{MemType, Memory, Wordsize};
use super::trap::Exception;
use super::PrivilegeMode;

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_MASK: u64 = (1 << PAGE_SHIFT) - 1;

// Sv39 walk geometry
const PTW_LEVELS: u64 = 3;
const PTE_BYTES: u64 = 8;
const VPN_BITS: u64 = 9;

// PTE flag bits
const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_U: u64 = 1 << 4;
const PTE_G: u64 = 1 << 5;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

/// Bit position of the virtual-page-number slice for a walk level
fn vpn_shift(level: u64) -> u64 {
    PAGE_SHIFT + VPN_BITS * level
}

/// The 9-bit virtual-page-number slice for a walk level
fn vpn_slice(vaddr: u64, level: u64) -> u64 {
    vaddr >> vpn_shift(level) & mask(VPN_BITS)
}

/// Classes of memory access presented for translation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessType {
    Ifetch,
    Read,
    Write,
}

impl AccessType {
    /// Tag for the final access of this class
    pub fn mem_type(&self) -> MemType {
        match self {
            Self::Ifetch => MemType::Ifetch,
            Self::Read => MemType::Read,
            Self::Write => MemType::Write,
        }
    }

    /// Tag for page-table reads performed on behalf of this class
    pub fn table_read_type(&self) -> MemType {
        match self {
            Self::Ifetch => MemType::IfetchPtRead,
            Self::Read => MemType::Read,
            Self::Write => MemType::WritePtRead,
        }
    }

    /// Dense index for per-class state
    pub fn index(&self) -> usize {
        match self {
            Self::Ifetch => 0,
            Self::Read => 1,
            Self::Write => 2,
        }
    }
}

/// Sv39 page-table entry
///
/// Bit layout (section 4.4.1 of the privileged spec):
///
/// | Bits  | Field | Meaning |
/// |-------|-------|---------|
/// | 0     | V     | entry is valid |
/// | 1     | R     | page is readable |
/// | 2     | W     | page is writable |
/// | 3     | X     | page is executable |
/// | 4     | U     | page is accessible to user mode |
/// | 5     | G     | mapping is global |
/// | 6     | A     | page was accessed since A was cleared |
/// | 7     | D     | page was written since D was cleared |
/// | 9:8   | RSW   | reserved for software |
/// | 53:10 | PPN   | physical page number |
/// | 63:54 | -     | reserved |
///
/// An entry with W set and R clear is reserved and must fault. No
/// field other than V is meaningful while V is clear.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn valid(&self) -> bool {
        self.0 & PTE_V != 0
    }

    pub fn readable(&self) -> bool {
        self.0 & PTE_R != 0
    }

    pub fn writable(&self) -> bool {
        self.0 & PTE_W != 0
    }

    pub fn executable(&self) -> bool {
        self.0 & PTE_X != 0
    }

    pub fn user(&self) -> bool {
        self.0 & PTE_U != 0
    }

    pub fn global(&self) -> bool {
        self.0 & PTE_G != 0
    }

    pub fn accessed(&self) -> bool {
        self.0 & PTE_A != 0
    }

    pub fn dirty(&self) -> bool {
        self.0 & PTE_D != 0
    }

    /// The reserved-for-software field (bits 9:8)
    pub fn rsw(&self) -> u64 {
        extract_field(self.0, 9, 8)
    }

    /// The physical page number field (bits 53:10)
    pub fn ppn(&self) -> u64 {
        extract_field(self.0, 53, 10)
    }

    /// Physical base address of the page or next-level table
    pub fn page_base(&self) -> u64 {
        self.ppn() << PAGE_SHIFT
    }

    pub fn set_accessed(&mut self) {
        self.0 |= PTE_A;
    }

    pub fn set_dirty(&mut self) {
        self.0 |= PTE_D;
    }
}

/// Routing decision for an access class
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MmuMode {
    /// Addresses are used as physical addresses unchanged
    #[default]
    Direct,
    /// Addresses go through the Sv39 walk
    Translate,
}

/// Accessed/dirty maintenance policy
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AdUpdate {
    /// The walker sets the bits and writes the entry back in place
    #[default]
    Hardware,
    /// A clear A bit (or clear D bit on a store) raises the page
    /// fault for the access; trap-handler software updates the entry
    /// and the access succeeds on retry
    Exception,
}

/// Per-core configuration of the memory subsystem
#[derive(Debug, Copy, Clone)]
pub struct MmuConfig {
    /// Accessed/dirty maintenance policy
    pub ad_update: AdUpdate,
    /// Check natural alignment of data accesses ahead of translation
    pub check_alignment: bool,
    /// Route PMP permission lookups through the two-level permission
    /// table for regions with the table bit set
    pub pmp_table: bool,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            ad_update: AdUpdate::Hardware,
            check_alignment: true,
            pmp_table: false,
        }
    }
}

/// Translation state of one simulated core
///
/// Owns the cached routing modes, the atomic-sequence flag, the
/// configuration, and the lock-step guide state. Cores never share an
/// instance.
#[derive(Debug, Default)]
pub struct Mmu {
    fetch_mode: MmuMode,
    data_mode: MmuMode,
    amo: bool,
    guide: Option<ExecutionGuide>,
    limiter: ForceLimiter,
    config: MmuConfig,
}

impl Mmu {
    pub fn new(config: MmuConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    /// Mark the start (true) or end (false) of an atomic sequence.
    /// While the flag is set, faults on the read probe of the
    /// sequence are reported as store/AMO faults.
    pub fn set_amo(&mut self, amo: bool) {
        self.amo = amo;
    }

    pub fn amo(&self) -> bool {
        self.amo
    }

    /// Install or remove the lock-step execution guide
    pub fn set_guide(&mut self, guide: Option<ExecutionGuide>) {
        self.guide = guide;
    }

    fn compute_mode(&self, csr: &Csr, ifetch: bool) -> MmuMode {
        if csr.effective_mode(ifetch) < PrivilegeMode::Machine {
            let satp_mode = csr.satp_mode();
            assert!(
                satp_mode == SATP_MODE_BARE || satp_mode == SATP_MODE_SV39,
                "unsupported paging mode {satp_mode} selected in satp"
            );
            if satp_mode == SATP_MODE_SV39 {
                return MmuMode::Translate;
            }
        }
        MmuMode::Direct
    }

    /// Recompute the cached fetch and data routing modes
    ///
    /// Must be called after every change to the privilege mode, satp,
    /// or the mstatus override fields. Returns whether the data mode
    /// changed, which callers use to invalidate any fast-path caches
    /// keyed on it.
    pub fn refresh_mode(&mut self, csr: &Csr) -> bool {
        self.fetch_mode = self.compute_mode(csr, true);
        let old = self.data_mode;
        self.data_mode = self.compute_mode(csr, false);
        if self.data_mode != old {
            debug!("data mmu mode is now {:?}", self.data_mode);
        }
        self.data_mode != old
    }

    fn fetch_mode(&self) -> MmuMode {
        self.fetch_mode
    }

    /// The cached routing mode for data accesses
    pub fn data_mode(&self) -> MmuMode {
        self.data_mode
    }

    /// The cached routing mode for an access class, without
    /// recomputation
    pub fn translation_active(&self, ty: AccessType) -> bool {
        let mode = match ty {
            AccessType::Ifetch => self.fetch_mode(),
            _ => self.data_mode(),
        };
        mode == MmuMode::Translate
    }

    /// Validate an access address and pick its routing
    ///
    /// Privileged spec 4.4.1: fetch, load and store effective
    /// addresses must have bits 63:39 all equal to bit 38, or else a
    /// page fault occurs. The check only applies while translation is
    /// active for the class. Data accesses are additionally checked
    /// for natural alignment when the software alignment check is
    /// configured; len is the access width in bytes.
    pub fn check_access(
        &mut self,
        csr: &mut Csr,
        vaddr: u64,
        len: u64,
        ty: AccessType,
    ) -> Result<MmuMode, Exception> {
        trace!("mmu checking addr {vaddr:#x}");
        let ifetch = ty == AccessType::Ifetch;
        let vm_enable = csr.effective_mode(ifetch) < PrivilegeMode::Machine
            && csr.satp_mode() == SATP_MODE_SV39;
        let va_msbs = vaddr >> 38;
        let msbs_ok = va_msbs == mask(26u64) || va_msbs == 0 || !vm_enable;
        if !msbs_ok {
            let ex = match ty {
                AccessType::Ifetch => Exception::InstructionPageFault,
                AccessType::Read if self.amo => Exception::StoreAmoPageFault,
                AccessType::Read => Exception::LoadPageFault,
                AccessType::Write => Exception::StoreAmoPageFault,
            };
            if ifetch {
                csr.csr_write_stval(vaddr);
            }
            csr.set_trap_value(ex, vaddr);
            return Err(ex);
        }

        if ifetch {
            return Ok(self.fetch_mode());
        }
        self.check_data_alignment(csr, vaddr, len, ty)?;
        Ok(self.data_mode())
    }

    /// Alignment check alone, for callers that have already routed
    /// the access
    pub fn check_data_alignment(
        &mut self,
        csr: &mut Csr,
        vaddr: u64,
        len: u64,
        ty: AccessType,
    ) -> Result<(), Exception> {
        if self.config.check_alignment && vaddr & (len - 1) != 0 {
            debug!("misaligned access: vaddr {vaddr:#x} len {len} {ty:?}");
            let ex = if self.amo || ty == AccessType::Write {
                Exception::StoreAmoAddressMisaligned
            } else {
                Exception::LoadAddressMisaligned
            };
            csr.set_trap_value(ex, vaddr);
            return Err(ex);
        }
        Ok(())
    }

    /// Apply the leaf permission rules for an access
    ///
    /// Pass structurally_ok = false to ask which fault a failed walk
    /// should report: the denial path then picks the class-specific
    /// exception without consulting the entry's capability bits.
    /// On denial the trap value is written and the exception
    /// returned; the caller must not continue the access.
    pub fn check_permission(
        &mut self,
        csr: &mut Csr,
        pte: Pte,
        structurally_ok: bool,
        vaddr: u64,
        ty: AccessType,
    ) -> Result<(), Exception> {
        let ifetch = ty == AccessType::Ifetch;
        let mode = csr.effective_mode(ifetch);
        assert!(
            mode == PrivilegeMode::User || mode == PrivilegeMode::Supervisor,
            "permission check for a mode that bypasses translation"
        );
        let defer_ad = self.config.ad_update == AdUpdate::Exception;

        let mut ok = structurally_ok;
        ok = ok && pte.valid();
        ok = ok && !(mode == PrivilegeMode::User && !pte.user());
        ok = ok && !(pte.user() && mode == PrivilegeMode::Supervisor && (!csr.sum() || ifetch));
        trace!(
            "ok: {ok}, mode == U: {}, pte.u: {}, ppn: {:#x}",
            mode == PrivilegeMode::User,
            pte.user(),
            pte.page_base()
        );

        match ty {
            AccessType::Ifetch => {
                let update_ad = defer_ad && !pte.accessed();
                if update_ad && ok && pte.executable() {
                    trace!("raise exception to update a/d for fetch");
                }
                if !(ok && pte.executable()) || update_ad {
                    assert!(!self.amo, "atomic sequence reached an instruction fetch");
                    csr.set_trap_value(Exception::InstructionPageFault, vaddr);
                    return Err(Exception::InstructionPageFault);
                }
            }
            AccessType::Read => {
                let can_load = pte.readable() || csr.mxr() && pte.executable();
                let update_ad = defer_ad && !pte.accessed();
                if !(ok && can_load) || update_ad {
                    let ex = if self.amo {
                        trace!("redirect to store/AMO page fault at {vaddr:#x}");
                        Exception::StoreAmoPageFault
                    } else {
                        Exception::LoadPageFault
                    };
                    csr.set_trap_value(ex, vaddr);
                    self.amo = false;
                    return Err(ex);
                }
            }
            AccessType::Write => {
                let update_ad = defer_ad && (!pte.accessed() || !pte.dirty());
                if !(ok && pte.writable()) || update_ad {
                    csr.set_trap_value(Exception::StoreAmoPageFault, vaddr);
                    self.amo = false;
                    return Err(Exception::StoreAmoPageFault);
                }
            }
        }
        Ok(())
    }

    /// Raise the class-specific fault for a structurally failed walk
    fn walk_fault(&mut self, csr: &mut Csr, pte: Pte, vaddr: u64, ty: AccessType) -> Exception {
        trace!("translation failed for {vaddr:#x}");
        self.check_permission(csr, pte, false, vaddr, ty)
            .expect_err("a structurally failed walk never passes the permission check")
    }

    /// Three-level Sv39 walk returning the physical page base
    fn walk(
        &mut self,
        csr: &mut Csr,
        memory: &mut Memory,
        vaddr: u64,
        ty: AccessType,
    ) -> Result<u64, Exception> {
        trace!("page walk for {vaddr:#x}");
        let mut base = csr.satp_ppn() << PAGE_SHIFT;
        let mut pte = Pte::new(0);

        // 39-bit sign extension, re-checked so that a walk entered
        // directly still faults on a non-canonical address
        let sext = ((vaddr << 25) as i64 >> 25) as u64;
        if sext != vaddr {
            return Err(self.walk_fault(csr, pte, vaddr, ty));
        }

        let mut level = PTW_LEVELS - 1;
        let pte_addr;
        loop {
            let addr = base + vpn_slice(vaddr, level) * PTE_BYTES;
            // Table reads are performed at supervisor privilege
            pte = Pte::new(memory.read(
                addr,
                Wordsize::Doubleword,
                ty.table_read_type(),
                PrivilegeMode::Supervisor,
                vaddr,
            ));
            trace!(
                "walk level {level}: pte at {addr:#x} is {:#x} for vaddr {vaddr:#x}",
                pte.bits()
            );
            base = pte.page_base();
            if !pte.valid() || pte.writable() && !pte.readable() {
                return Err(self.walk_fault(csr, pte, vaddr, ty));
            }
            if pte.readable() || pte.executable() {
                pte_addr = addr;
                break;
            }
            if level == 0 {
                // Ran out of levels without finding a leaf
                return Err(self.walk_fault(csr, pte, vaddr, ty));
            }
            level -= 1;
        }

        self.check_permission(csr, pte, true, vaddr, ty)?;

        if level > 0 {
            // Superpage: the translated base must be aligned to the
            // level's span; the in-span bits come from the virtual
            // address
            let span_mask = mask(vpn_shift(level));
            if base & span_mask != 0 {
                return Err(self.walk_fault(csr, pte, vaddr, ty));
            }
            base = base & !span_mask | vaddr & span_mask & !PAGE_MASK;
        }

        if self.config.ad_update == AdUpdate::Hardware {
            let is_write = ty == AccessType::Write;
            if !pte.accessed() || !pte.dirty() && is_write {
                pte.set_accessed();
                if is_write {
                    pte.set_dirty();
                }
                memory.write(pte_addr, pte.bits(), Wordsize::Doubleword, csr.mode, vaddr);
            }
        }

        Ok(base)
    }

    /// Translate a virtual address, returning the physical page base
    ///
    /// The page offset is not included in the result; the caller
    /// merges `vaddr & PAGE_MASK` back in. Under lock-step execution
    /// a successful walk is still compared against the guide record
    /// and the reference core's fault re-raised if one was recorded.
    pub fn translate(
        &mut self,
        csr: &mut Csr,
        memory: &mut Memory,
        vaddr: u64,
        ty: AccessType,
    ) -> Result<u64, Exception> {
        let page_base = self.walk(csr, memory, vaddr, ty)?;
        self.check_forced_fault(csr, vaddr, ty)?;
        Ok(page_base)
    }

    /// Re-raise a fault recorded by the reference core
    fn check_forced_fault(
        &mut self,
        csr: &mut Csr,
        vaddr: u64,
        ty: AccessType,
    ) -> Result<(), Exception> {
        let Some(guide) = self.guide else {
            return Ok(());
        };
        if !guide.force_raise_exception {
            return Ok(());
        }
        match ty {
            AccessType::Ifetch if guide.exception == Exception::InstructionPageFault.cause() => {
                if self.limiter.exhausted(vaddr, ty) {
                    return Ok(());
                }
                let ex = Exception::InstructionPageFault;
                // The trap value comes from the guide record, not the
                // local walk
                if csr.exception_delegated(ex) {
                    csr.csr_write_stval(guide.stval);
                    if vaddr != guide.stval && !cross_page_fetch_mismatch(vaddr, guide.stval) {
                        warn!(
                            "local stval {vaddr:#x} does not match recorded stval {:#x}",
                            guide.stval
                        );
                    }
                } else {
                    csr.csr_write_mtval(guide.mtval);
                    if vaddr != guide.mtval && !cross_page_fetch_mismatch(vaddr, guide.mtval) {
                        warn!(
                            "local mtval {vaddr:#x} does not match recorded mtval {:#x}",
                            guide.mtval
                        );
                    }
                }
                debug!("force raise instruction page fault at {vaddr:#x}");
                Err(ex)
            }
            AccessType::Read if guide.exception == Exception::LoadPageFault.cause() => {
                if self.limiter.exhausted(vaddr, ty) {
                    return Ok(());
                }
                csr.set_trap_value(Exception::LoadPageFault, vaddr);
                debug!("force raise load page fault at {vaddr:#x}");
                Err(Exception::LoadPageFault)
            }
            AccessType::Write if guide.exception == Exception::StoreAmoPageFault.cause() => {
                if self.limiter.exhausted(vaddr, ty) {
                    return Ok(());
                }
                csr.set_trap_value(Exception::StoreAmoPageFault, vaddr);
                debug!("force raise store/AMO page fault at {vaddr:#x}");
                Err(Exception::StoreAmoPageFault)
            }
            _ => Ok(()),
        }
    }
}
