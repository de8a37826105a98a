//! Physical memory backing store
//!
//! The basic memory model is described in section 1.4 of the RISC-V
//! unprivileged reference. All of physical memory is modelled as a
//! sparse byte map: reads of locations that were never written return
//! zero, and writing zero releases the byte again. The address space
//! is the full 64-bit physical range; bounds and attribute checking
//! belong to the protection units, not to the store itself.
//!
//! Every read carries an access-kind tag, the privilege mode of the
//! access and the virtual address it originated from. The tags matter
//! because the page-table walker reads PTEs through this same
//! primitive: a protection unit sitting in front of the store must be
//! able to tell a table read performed on behalf of a fetch or a
//! store apart from the final data access itself (see
//! [`MemType::IfetchPtRead`] and [`MemType::WritePtRead`]).
//!
//! One peripheral is mapped into the address space: a virtual UART
//! output register at 0x3f8. Bytes stored there are captured into a
//! character queue which can be drained with `flush_stdout`,
//! modelling a debug console connection to the simulated machine.

use log::trace;
use queues::*;
use std::collections::HashMap;

use super::PrivilegeMode;

/// Address of the virtual UART output register
const UART_TX_ADDR: u64 = 0x3f8;

/// Word sizes defined in the RISC-V specification
#[derive(Debug, Copy, Clone)]
pub enum Wordsize {
    Byte,
    Halfword,
    Word,
    Doubleword,
}

impl Wordsize {
    fn width(&self) -> u64 {
        match self {
            Wordsize::Byte => 1,
            Wordsize::Halfword => 2,
            Wordsize::Word => 4,
            Wordsize::Doubleword => 8,
        }
    }
}

/// Access-kind tag travelling with each physical read
///
/// The final access of a fetch, load or store uses the first three
/// variants. The two `*PtRead` variants tag the 8-byte page-table
/// reads the walker performs while translating a fetch or a store;
/// a walker translating a load tags its table reads `Read`. For
/// physical protection purposes every table read counts as a read,
/// whatever access it was performed on behalf of.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemType {
    Ifetch,
    Read,
    Write,
    IfetchPtRead,
    WritePtRead,
}

impl MemType {
    /// True for the plain and page-table read variants
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read | Self::IfetchPtRead | Self::WritePtRead)
    }
}

/// Simulated physical memory
///
/// The default store is empty (all-zero) memory with an empty UART
/// queue.
#[derive(Debug, Default)]
pub struct Memory {
    data: HashMap<u64, u8>,
    stdout: Queue<char>,
}

fn read_byte(byte_map: &HashMap<u64, u8>, addr: u64) -> u64 {
    u64::from(*byte_map.get(&addr).unwrap_or(&0))
}

fn read_word(byte_map: &HashMap<u64, u8>, addr: u64, num_bytes: u64) -> u64 {
    let mut value = 0;
    for n in 0..num_bytes {
        let byte_n = read_byte(byte_map, addr.wrapping_add(n));
        value |= byte_n << (8 * n);
    }
    value
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current contents of the stdout buffer as a string
    /// and also delete the contents of the buffer
    pub fn flush_stdout(&mut self) -> String {
        let mut stdout = String::new();
        while let Ok(ch) = self.stdout.remove() {
            stdout.push(ch);
        }
        stdout
    }

    fn write_byte(&mut self, addr: u64, value: u8) {
        // Char output device
        if addr == UART_TX_ADDR {
            self.stdout
                .add(value as char)
                .expect("insert into queue should work");
        } else if value == 0 {
            self.data.remove(&addr);
        } else {
            self.data.insert(addr, value);
        }
    }

    /// Read without access tagging
    ///
    /// Used for simulator-owned structures (e.g. the PMP permission
    /// tables) whose reads are not architectural accesses and are
    /// invisible to the protection units.
    pub fn read_direct(&self, addr: u64, word_size: Wordsize) -> u64 {
        read_word(&self.data, addr, word_size.width())
    }

    /// Write without access tagging
    pub fn write_direct(&mut self, addr: u64, value: u64, word_size: Wordsize) {
        for n in 0..word_size.width() {
            let byte_n = 0xff & (value >> (8 * n));
            self.write_byte(addr.wrapping_add(n), byte_n as u8);
        }
    }

    /// Tagged physical read
    ///
    /// The tag, privilege mode and originating virtual address do not
    /// change what is read; they identify the access to tracing and
    /// to any protection check sitting in front of the store.
    pub fn read(
        &self,
        addr: u64,
        word_size: Wordsize,
        mem_type: MemType,
        mode: PrivilegeMode,
        vaddr: u64,
    ) -> u64 {
        let value = self.read_direct(addr, word_size);
        trace!(
            "paddr read {addr:#x} ({word_size:?}, {mem_type:?}, {mode:?}, vaddr {vaddr:#x}) \
             -> {value:#x}"
        );
        value
    }

    /// Tagged physical write
    pub fn write(
        &mut self,
        addr: u64,
        value: u64,
        word_size: Wordsize,
        mode: PrivilegeMode,
        vaddr: u64,
    ) {
        trace!("paddr write {addr:#x} ({word_size:?}, {mode:?}, vaddr {vaddr:#x}) <- {value:#x}");
        self.write_direct(addr, value, word_size);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    /// Just test a few of each type of read
    #[test]
    fn memory_zero_initialised() {
        let mem = Memory::default();
        for addr in (0..100).step_by(11) {
            assert_eq!(mem.read_direct(addr, Wordsize::Byte), 0);
            assert_eq!(mem.read_direct(addr, Wordsize::Halfword), 0);
            assert_eq!(mem.read_direct(addr, Wordsize::Word), 0);
            assert_eq!(mem.read_direct(addr, Wordsize::Doubleword), 0);
        }
    }

    #[test]
    fn byte_write_then_read() {
        let mut mem = Memory::default();
        for addr in (0..100).step_by(11) {
            let value = 17 * addr;
            mem.write_direct(addr, value, Wordsize::Byte);
            assert_eq!(mem.read_direct(addr, Wordsize::Byte), 0xff & value);
            // Check write did not spill into next byte
            assert_eq!(mem.read_direct(addr + 1, Wordsize::Byte), 0);
        }
    }

    #[test]
    fn doubleword_write_then_read() {
        let mut mem = Memory::default();
        let value = 0x1234_5678_9abc_def0;
        mem.write_direct(0x8000_0000, value, Wordsize::Doubleword);
        assert_eq!(mem.read_direct(0x8000_0000, Wordsize::Doubleword), value);
        // Little-endian byte order
        assert_eq!(mem.read_direct(0x8000_0000, Wordsize::Byte), 0xf0);
        assert_eq!(mem.read_direct(0x8000_0007, Wordsize::Byte), 0x12);
    }

    #[test]
    fn check_64bit_memory_wrap() {
        let mut mem = Memory::default();
        let value = 0x0403_0201;
        let addr = 0xffff_ffff_ffff_ffff;
        mem.write_direct(addr, value, Wordsize::Word);
        assert_eq!(mem.read_direct(addr, Wordsize::Byte), 1);
        assert_eq!(mem.read_direct(0, Wordsize::Byte), 2);
        assert_eq!(mem.read_direct(1, Wordsize::Byte), 3);
        assert_eq!(mem.read_direct(2, Wordsize::Byte), 4);
    }

    #[test]
    fn check_zero_write_releases_byte() {
        let mut mem = Memory::default();
        mem.write_direct(40, 0xff, Wordsize::Byte);
        mem.write_direct(40, 0, Wordsize::Byte);
        assert_eq!(mem.read_direct(40, Wordsize::Byte), 0);
    }

    #[test]
    fn check_uart_output_device() {
        let mut mem = Memory::default();
        for ch in "ok\n".bytes() {
            mem.write_direct(0x3f8, ch.into(), Wordsize::Byte);
        }
        assert_eq!(mem.flush_stdout(), "ok\n");
        // Queue is drained by flushing
        assert_eq!(mem.flush_stdout(), "");
    }

    #[test]
    fn check_tagged_read_matches_direct() {
        let mut mem = Memory::default();
        mem.write_direct(0x1000, 0xabcd, Wordsize::Halfword);
        let tagged = mem.read(
            0x1000,
            Wordsize::Halfword,
            MemType::IfetchPtRead,
            PrivilegeMode::Supervisor,
            0xdead_b000,
        );
        assert_eq!(tagged, 0xabcd);
    }
}
