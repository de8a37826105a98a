//! RISC-V Hardware Thread - memory subsystem
//!
//! This module assembles the memory-facing architectural state of one
//! hart: the backing physical memory, the control and status
//! registers that steer translation and protection, and the Sv39 MMU
//! with its PMP and SPMP units. The execution pipeline drives it
//! through the entry points on [`Hart`]:
//!
//! * [`Hart::check_mem_access`] validates the virtual address
//!   (canonical form, alignment) and reports whether the access goes
//!   through translation or straight to physical memory;
//! * [`Hart::translate_address`] runs the page walk and returns the
//!   physical address, or the exception to deliver;
//! * [`Hart::pmp_ok`] and [`Hart::spmp_ok`] check the resulting
//!   physical access against the region protection units;
//! * [`Hart::refresh_mmu_mode`] must be called whenever the
//!   privilege mode or a translation-controlling CSR changes.
//!
//! Every memory access the pipeline performs passes the address
//! check first, is then translated or used directly according to the
//! routing decision, and the physical address is checked by the
//! protection units before it reaches the backing store.
//!
//! A multi-core simulation creates one `Hart` per core; nothing here
//! is shared between instances.

use self::csr::Csr;
use self::memory::{MemType, Memory};
use self::mmu::{AccessType, Mmu, MmuConfig, MmuMode, PAGE_MASK};
use self::trap::Exception;

pub mod csr;
pub mod guide;
pub mod memory;
pub mod mmu;
pub mod pmp;
pub mod spmp;
pub mod trap;

/// Privilege levels of the hart
///
/// The declaration order gives the privilege ordering, so modes
/// compare as User < Supervisor < Machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrivilegeMode {
    User,
    Supervisor,
    Machine,
}

impl PrivilegeMode {
    /// Decode the architectural 2-bit encoding (as held in
    /// mstatus.MPP). The value 2 is reserved.
    pub fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::User,
            1 => Self::Supervisor,
            3 => Self::Machine,
            _ => panic!("reserved privilege encoding {bits}"),
        }
    }

    /// The architectural 2-bit encoding of this mode
    pub fn bits(&self) -> u64 {
        match self {
            Self::User => 0,
            Self::Supervisor => 1,
            Self::Machine => 3,
        }
    }
}

/// Memory-subsystem state of one simulated core
#[derive(Debug, Default)]
pub struct Hart {
    pub csr: Csr,
    pub memory: Memory,
    pub mmu: Mmu,
}

impl Hart {
    pub fn new(config: MmuConfig) -> Self {
        Self {
            mmu: Mmu::new(config),
            ..Self::default()
        }
    }

    /// Recompute the cached translation routing; returns whether the
    /// data-access routing changed
    pub fn refresh_mmu_mode(&mut self) -> bool {
        self.mmu.refresh_mode(&self.csr)
    }

    /// Whether accesses of this class currently go through the walk
    pub fn translation_active(&self, ty: AccessType) -> bool {
        self.mmu.translation_active(ty)
    }

    /// Validate an access and return its routing decision
    pub fn check_mem_access(
        &mut self,
        vaddr: u64,
        len: u64,
        ty: AccessType,
    ) -> Result<MmuMode, Exception> {
        self.mmu.check_access(&mut self.csr, vaddr, len, ty)
    }

    /// Translate a virtual address to the full physical address
    pub fn translate_address(&mut self, vaddr: u64, ty: AccessType) -> Result<u64, Exception> {
        let page_base = self
            .mmu
            .translate(&mut self.csr, &mut self.memory, vaddr, ty)?;
        Ok(page_base | vaddr & PAGE_MASK)
    }

    /// Check a physical access against the PMP regions
    pub fn pmp_ok(&self, addr: u64, len: u64, ty: MemType, mode: PrivilegeMode) -> bool {
        pmp::pmp_check(
            &self.csr,
            &self.memory,
            self.mmu.config(),
            addr,
            len,
            ty,
            mode,
        )
    }

    /// Check a physical access against the SPMP regions
    pub fn spmp_ok(&self, addr: u64, len: u64, ty: MemType, mode: PrivilegeMode) -> bool {
        spmp::spmp_check(&self.csr, addr, len, ty, mode)
    }

    /// Mark the start or end of an atomic sequence
    pub fn set_amo(&mut self, amo: bool) {
        self.mmu.set_amo(amo);
    }
}
