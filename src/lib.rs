//! Memory subsystem of a 64-bit RISC-V full-system simulator.
//!
//! This crate models the privileged-architecture view of memory: Sv39
//! virtual-address translation, the permission rules that govern user
//! and supervisor accesses, hardware- and software-managed
//! accessed/dirty bits, and the two region-based physical protection
//! units (PMP and SPMP). The instruction pipeline that drives it lives
//! elsewhere; the boundary is the [`hart::Hart`] type and the
//! translation and protection entry points it exposes.
//!
//! References to the privileged spec refer to version 20211203.

pub mod hart;
pub mod utils;
