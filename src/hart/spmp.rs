//! Supervisor-mode memory protection
//!
//! A second region-based protection unit, structurally the same as
//! PMP (the same entry layout and the same matching primitive) but
//! aimed at isolating supervisor and user software from each other
//! rather than constraining machine mode. Instead of a lock bit each
//! entry carries an S bit, and the {S,R,W,X} nibble of the entry is
//! not tested directly: it indexes a 16-entry permission table that
//! yields the effective read/write/execute rights, with different
//! tables for user mode and for supervisor mode with and without
//! mstatus.SUM.
//!
//! Like PMP, checks are pure and the caller turns a denial into an
//! access fault. One policy difference is deliberate and preserved
//! from the observed behaviour of this unit: an access that matches
//! no region is allowed in every mode, even when other regions are
//! configured, where PMP would default-deny below machine mode (see
//! DESIGN.md).

use log::trace;

use super::csr::{Csr, SPMP_COUNT};
use super::memory::MemType;
use super::pmp::{region_match, AddressMode, RegionMatch, PMP_SHIFT};
use super::PrivilegeMode;

// spmpcfg fields; the address-matching field is shared with PMP
pub const SPMP_R: u8 = 0x01;
pub const SPMP_W: u8 = 0x02;
pub const SPMP_X: u8 = 0x04;
pub const SPMP_S: u8 = 0x80;

// Permission bits produced by the derivation tables
const PERM_R: u8 = 0b100;
const PERM_W: u8 = 0b010;
const PERM_X: u8 = 0b001;

/// Assemble the {S,R,W,X} nibble from an entry's configuration byte
fn cfg_nibble(cfg: u8) -> u8 {
    (cfg & SPMP_S) >> 4 | (cfg & SPMP_R) << 2 | (cfg & SPMP_W) | (cfg & SPMP_X) >> 2
}

/// Effective R/W/X rights granted by an entry for an access mode
///
/// The nibble indexes one of three tables: user mode, supervisor
/// mode, and supervisor mode with SUM set (which opens the
/// shared/user entries for data access). Machine mode is not subject
/// to this unit and receives full rights.
fn derive_permissions(nibble: u8, mode: PrivilegeMode, sum: bool) -> u8 {
    match mode {
        PrivilegeMode::Machine => PERM_R | PERM_W | PERM_X,
        PrivilegeMode::Supervisor if !sum => match nibble {
            0b0010 | 0b0011 => 0b110,
            0b1001 | 0b1010 => 0b001,
            0b1000 => 0b111,
            0b1011 => 0b101,
            0b1100 => 0b100,
            0b1101 => 0b101,
            0b1110 => 0b110,
            0b1111 => 0b100,
            _ => 0b000,
        },
        PrivilegeMode::Supervisor => match nibble {
            0b0010 | 0b0011 => 0b110,
            0b0100 | 0b0101 => 0b100,
            0b0110 | 0b0111 => 0b110,
            0b1001 | 0b1010 => 0b001,
            0b1011 => 0b101,
            0b1000 => 0b111,
            0b1100 => 0b100,
            0b1101 => 0b101,
            0b1110 => 0b110,
            0b1111 => 0b100,
            _ => 0b000,
        },
        PrivilegeMode::User => match nibble {
            0b0001 => 0b001,
            0b0010 => 0b100,
            0b0011 => 0b110,
            0b0100 => 0b100,
            0b0101 => 0b101,
            0b0110 => 0b110,
            0b1000 | 0b0111 => 0b111,
            0b1010 | 0b1011 => 0b001,
            0b1111 => 0b100,
            _ => 0b000,
        },
    }
}

/// Check an access against the SPMP regions
///
/// Entries are scanned in index order with the same running
/// top-of-range base as PMP; the first region fully covering the
/// access decides it, and a region covering it only in part always
/// denies. An access matching no region is allowed regardless of
/// mode.
pub fn spmp_check(csr: &Csr, addr: u64, len: u64, ty: MemType, mode: PrivilegeMode) -> bool {
    let mut base = 0;
    for i in 0..SPMP_COUNT {
        let spmp_addr = csr.spmpaddr_from_index(i);
        let cfg = csr.spmpcfg_from_index(i);
        let amode = AddressMode::from_cfg(cfg);
        if amode != AddressMode::Off {
            match region_match(base, addr, len, spmp_addr, amode) {
                RegionMatch::Partial => {
                    trace!("spmp entry {i} covers only part of the access at {addr:#x}");
                    return false;
                }
                RegionMatch::Full => {
                    let perms = derive_permissions(cfg_nibble(cfg), mode, csr.sum());
                    return match ty {
                        MemType::Ifetch => perms & PERM_X != 0,
                        MemType::Read | MemType::IfetchPtRead | MemType::WritePtRead => {
                            perms & PERM_R != 0
                        }
                        MemType::Write => perms & PERM_W != 0,
                    };
                }
                RegionMatch::None => {}
            }
        }
        base = spmp_addr << PMP_SHIFT;
    }
    true
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::hart::csr::MSTATUS_SUM;
    use crate::hart::pmp::{PMP_NAPOT, PMP_TOR};

    /// spmpaddr encoding of the NAPOT region [0x8000_0000, 0x8000_1000)
    const NAPOT_4K: u64 = (0x8000_0000 >> 2) | 0x1ff;

    #[test]
    fn check_cfg_nibble_assembly() {
        assert_eq!(cfg_nibble(SPMP_S), 0b1000);
        assert_eq!(cfg_nibble(SPMP_R), 0b0100);
        assert_eq!(cfg_nibble(SPMP_W), 0b0010);
        assert_eq!(cfg_nibble(SPMP_X), 0b0001);
        assert_eq!(cfg_nibble(SPMP_S | SPMP_R | SPMP_W | SPMP_X), 0b1111);
    }

    #[test]
    fn check_user_region_rights_for_user_mode() {
        // S clear, R|W: a user region granting read and write
        let nibble = cfg_nibble(SPMP_R | SPMP_W);
        let perms = derive_permissions(nibble, PrivilegeMode::User, false);
        assert_eq!(perms, PERM_R | PERM_W);
    }

    #[test]
    fn check_supervisor_needs_sum_for_user_region() {
        let nibble = cfg_nibble(SPMP_R | SPMP_W);
        assert_eq!(
            derive_permissions(nibble, PrivilegeMode::Supervisor, false),
            0b000
        );
        assert_eq!(
            derive_permissions(nibble, PrivilegeMode::Supervisor, true),
            PERM_R | PERM_W
        );
    }

    #[test]
    fn check_supervisor_region_closed_to_user() {
        // S set, R|W: a supervisor region
        let nibble = cfg_nibble(SPMP_S | SPMP_R | SPMP_W);
        assert_eq!(
            derive_permissions(nibble, PrivilegeMode::Supervisor, false),
            PERM_R | PERM_W
        );
        assert_eq!(derive_permissions(nibble, PrivilegeMode::User, false), 0b000);
    }

    #[test]
    fn check_shared_execute_region() {
        // S set with X only: execute-only for both modes
        let nibble = cfg_nibble(SPMP_S | SPMP_X);
        assert_eq!(
            derive_permissions(nibble, PrivilegeMode::Supervisor, false),
            PERM_X
        );
        assert_eq!(
            derive_permissions(nibble, PrivilegeMode::User, false),
            0b000
        );
        // S with W: shared execute in both modes
        let nibble = cfg_nibble(SPMP_S | SPMP_W);
        assert_eq!(
            derive_permissions(nibble, PrivilegeMode::Supervisor, false),
            PERM_X
        );
        assert_eq!(
            derive_permissions(nibble, PrivilegeMode::User, false),
            PERM_X
        );
    }

    #[test]
    fn check_machine_mode_has_full_rights() {
        assert_eq!(
            derive_permissions(0b0000, PrivilegeMode::Machine, false),
            PERM_R | PERM_W | PERM_X
        );
    }

    #[test]
    fn check_matched_region_governs_access() {
        let mut csr = Csr::new();
        csr.set_spmp_entry(0, SPMP_R | SPMP_W | PMP_NAPOT, NAPOT_4K);
        assert!(spmp_check(
            &csr,
            0x8000_0000,
            8,
            MemType::Read,
            PrivilegeMode::User
        ));
        assert!(spmp_check(
            &csr,
            0x8000_0000,
            8,
            MemType::Write,
            PrivilegeMode::User
        ));
        assert!(!spmp_check(
            &csr,
            0x8000_0000,
            4,
            MemType::Ifetch,
            PrivilegeMode::User
        ));
    }

    #[test]
    fn check_sum_controls_supervisor_data_access() {
        let mut csr = Csr::new();
        csr.set_spmp_entry(0, SPMP_R | SPMP_W | PMP_NAPOT, NAPOT_4K);
        assert!(!spmp_check(
            &csr,
            0x8000_0000,
            8,
            MemType::Read,
            PrivilegeMode::Supervisor
        ));
        csr.csr_write_mstatus(1 << MSTATUS_SUM);
        assert!(spmp_check(
            &csr,
            0x8000_0000,
            8,
            MemType::Read,
            PrivilegeMode::Supervisor
        ));
    }

    #[test]
    fn check_partial_match_denies() {
        let mut csr = Csr::new();
        csr.set_spmp_entry(0, SPMP_R | SPMP_W | SPMP_X | PMP_NAPOT, NAPOT_4K);
        assert!(!spmp_check(
            &csr,
            0x8000_0ffc,
            8,
            MemType::Read,
            PrivilegeMode::User
        ));
    }

    #[test]
    fn check_no_match_allows_every_mode() {
        // No regions at all: the documented default-allow
        let csr = Csr::new();
        for mode in [
            PrivilegeMode::User,
            PrivilegeMode::Supervisor,
            PrivilegeMode::Machine,
        ] {
            assert!(spmp_check(&csr, 0x8000_0000, 8, MemType::Write, mode));
        }
        // Still allowed when regions are configured but none match
        let mut csr = Csr::new();
        csr.set_spmp_entry(0, SPMP_R | PMP_NAPOT, NAPOT_4K);
        assert!(spmp_check(
            &csr,
            0x4000_0000,
            8,
            MemType::Write,
            PrivilegeMode::User
        ));
    }

    #[test]
    fn check_tor_entries_share_running_base() {
        let mut csr = Csr::new();
        csr.csr_write_spmpaddr(0, 0x1000 >> 2);
        csr.set_spmp_entry(1, SPMP_R | PMP_TOR, 0x2000 >> 2);
        assert!(spmp_check(
            &csr,
            0x1800,
            4,
            MemType::Read,
            PrivilegeMode::User
        ));
        assert!(!spmp_check(
            &csr,
            0x1800,
            4,
            MemType::Write,
            PrivilegeMode::User
        ));
    }
}
