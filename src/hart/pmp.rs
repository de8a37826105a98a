//! Physical memory protection
//!
//! Region-based access control applied to physical addresses after
//! translation (or directly, for accesses that bypass it). Each of
//! the [`super::csr::PMP_COUNT`] entries pairs an address register
//! with a configuration byte selecting the matching mode - top of
//! range, naturally aligned 4-byte, or naturally aligned
//! power-of-two - and the read/write/execute bits the region grants.
//! Entries are scanned in index order and the first region that
//! fully covers the access decides it; there is no best-match
//! selection. See section 3.7 of the privileged spec (v20211203).
//!
//! Checks are pure: the result is a bool and no fault is raised
//! here. The memory pipeline that receives a denial converts it into
//! the access fault appropriate to the original access.
//!
//! An optional lookup-table extension (enabled in
//! [`MmuConfig::pmp_table`]) redirects permission derivation for
//! regions with the T bit set into a two-level bitmap keyed by the
//! page offset inside the region, giving per-page nibble-granular
//! permissions instead of one R/W/X triple for the whole region. The
//! root of that table lives in the next entry's address register.

use log::trace;

use super::csr::{Csr, PMP_COUNT};
use super::memory::{MemType, Memory, Wordsize};
use super::mmu::{MmuConfig, PAGE_SHIFT};
use super::PrivilegeMode;

/// Address registers hold bits 55:2 of the region address
pub const PMP_SHIFT: u64 = 2;

/// Matching granularity in bytes
const PMP_GRANULE: usize = 4;

// pmpcfg fields
pub const PMP_R: u8 = 0x01;
pub const PMP_W: u8 = 0x02;
pub const PMP_X: u8 = 0x04;
pub const PMP_A: u8 = 0x18;
pub const PMP_T: u8 = 0x20;
pub const PMP_L: u8 = 0x80;

// Values of the address-matching field (pmpcfg bits 4:3)
pub const PMP_TOR: u8 = 0x08;
pub const PMP_NA4: u8 = 0x10;
pub const PMP_NAPOT: u8 = 0x18;

/// Region address-matching mode, from pmpcfg bits 4:3
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressMode {
    Off,
    Tor,
    Na4,
    Napot,
}

impl AddressMode {
    pub fn from_cfg(cfg: u8) -> Self {
        match cfg >> 3 & 0x3 {
            0 => Self::Off,
            1 => Self::Tor,
            2 => Self::Na4,
            _ => Self::Napot,
        }
    }
}

/// Outcome of matching one access against one region
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionMatch {
    /// No granule of the access falls in the region
    None,
    /// Some granules fall in the region and some do not; always a
    /// hard deny, whatever the region's permissions
    Partial,
    /// Every granule of the access falls in the region
    Full,
}

/// Match every 4-byte granule of `[addr, addr+len)` against a region
///
/// For TOR matching, base is the previous entry's bound (zero for
/// entry 0). The NAPOT block is decoded from the trailing-ones
/// encoding of the address register: k trailing ones select a
/// naturally aligned block of 2^(k+3) bytes.
pub fn region_match(
    base: u64,
    addr: u64,
    len: u64,
    region_addr: u64,
    mode: AddressMode,
) -> RegionMatch {
    let bound = region_addr << PMP_SHIFT;
    // Turn the trailing-ones encoding into a comparison mask; for
    // NA4 the mask keeps every word-address bit
    let m = region_addr << 1 | (mode != AddressMode::Na4) as u64;
    let napot_mask = !(m & !m.wrapping_add(1)) << PMP_SHIFT;

    let mut any = false;
    let mut all = true;
    for granule in (addr..addr + len).step_by(PMP_GRANULE) {
        let matched = match mode {
            AddressMode::Off => false,
            AddressMode::Tor => base <= granule && granule < bound,
            AddressMode::Na4 | AddressMode::Napot => (granule ^ bound) & napot_mask == 0,
        };
        any |= matched;
        all &= matched;
    }
    if !any {
        RegionMatch::None
    } else if !all {
        RegionMatch::Partial
    } else {
        RegionMatch::Full
    }
}

/// Check an access against the PMP regions
///
/// Page-table reads performed on behalf of a fetch or store carry
/// their own tags and count as reads here. When no entry is
/// configured at all the check is inactive and everything passes;
/// once any entry is in use, an access matching no region is denied
/// below machine mode.
pub fn pmp_check(
    csr: &Csr,
    memory: &Memory,
    config: &MmuConfig,
    addr: u64,
    len: u64,
    ty: MemType,
    out_mode: PrivilegeMode,
) -> bool {
    let ifetch = ty == MemType::Ifetch;
    // The physical access layer cannot always derive the effective
    // mode and passes machine mode; recompute from mstatus here
    let mode = if out_mode == PrivilegeMode::Machine {
        csr.effective_mode(ifetch)
    } else {
        out_mode
    };

    let mut base = 0;
    let mut configured = false;
    for i in 0..PMP_COUNT {
        let pmpaddr = csr.pmpaddr_from_index(i);
        let cfg = csr.pmpcfg_from_index(i);
        let amode = AddressMode::from_cfg(cfg);
        if amode != AddressMode::Off {
            configured = true;
            match region_match(base, addr, len, pmpaddr, amode) {
                RegionMatch::Partial => {
                    trace!("pmp entry {i} covers only part of the access at {addr:#x}");
                    return false;
                }
                RegionMatch::Full => {
                    if config.pmp_table && cfg & PMP_T != 0 {
                        if mode == PrivilegeMode::Machine {
                            return true;
                        }
                        let offset = if amode == AddressMode::Tor {
                            addr.wrapping_sub(base)
                        } else {
                            addr.wrapping_sub(pmpaddr << PMP_SHIFT)
                        };
                        // The table root page lives in the next
                        // entry's address register
                        let root = csr.pmpaddr_from_index(i + 1) << PAGE_SHIFT;
                        return table_permission(memory, offset, root, ty);
                    }
                    return mode == PrivilegeMode::Machine && cfg & PMP_L == 0
                        || ty.is_read() && cfg & PMP_R != 0
                        || ty == MemType::Write && cfg & PMP_W != 0
                        || ty == MemType::Ifetch && cfg & PMP_X != 0;
                }
                RegionMatch::None => {}
            }
        }
        base = pmpaddr << PMP_SHIFT;
    }

    if !configured {
        return true;
    }
    mode == PrivilegeMode::Machine
}

/// Permission lookup through the two-level table rooted at root_base
///
/// The offset of the access into its region selects a root entry
/// (bits 33:25), a leaf entry (bits 24:16) and a page index (bits
/// 15:12). A root entry with low nibble 1 points at a leaf table
/// whose bytes pack two permission nibbles each; a root entry with
/// only the low bit set carries a single permission nibble for the
/// whole range in bits 4:1. The shared encoding 0b10 in the nibble's
/// low bits collapses to execute-only.
fn table_permission(memory: &Memory, offset: u64, root_base: u64, ty: MemType) -> bool {
    let root_off = offset >> 25 & 0x1ff;
    let leaf_off = offset >> 16 & 0x1ff;
    let page_index = offset >> 12 & 0xf;

    let root_entry = memory.read_direct(root_base + (root_off << 3), Wordsize::Doubleword);
    let mut perm = 0;
    if root_entry & 0xf == 1 {
        let leaf_addr = ((root_entry >> 5) << 12) + (leaf_off << 3) + page_index / 2;
        let leaf = memory.read_direct(leaf_addr, Wordsize::Byte);
        perm = if page_index % 2 == 1 {
            leaf >> 4
        } else {
            leaf & 0xf
        };
    } else if root_entry & 0x1 == 1 {
        perm = root_entry >> 1 & 0xf;
    }

    if perm & 0x3 == 0x2 {
        perm &= 0x4;
    }
    match ty {
        MemType::Read | MemType::IfetchPtRead | MemType::WritePtRead => perm & 0x1 != 0,
        MemType::Write => perm & 0x2 != 0,
        MemType::Ifetch => perm & 0x4 != 0,
    }
}
