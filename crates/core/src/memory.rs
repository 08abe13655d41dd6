//! Guest memory access
//!
//! All guest-visible memory goes through [`GuestMemory`], a byte-level bus
//! interface with little-endian word helpers. Accesses never fail: reads
//! from unmapped addresses return 0 and writes to them are dropped, which is
//! what a PC bus does with open addresses.

use serde::{Deserialize, Serialize};

/// Size of the real-mode address space plus the High Memory Area
pub const REAL_MODE_SPACE: usize = 0x10FFF0;

/// Byte-addressable guest memory
pub trait GuestMemory {
    /// Read a byte from memory at the given linear address
    fn read(&self, addr: u32) -> u8;

    /// Write a byte to memory at the given linear address
    fn write(&mut self, addr: u32, val: u8);

    fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read(addr), self.read(addr.wrapping_add(1))])
    }

    fn read_u32(&self, addr: u32) -> u32 {
        let lo = self.read_u16(addr) as u32;
        let hi = self.read_u16(addr.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.write(addr, lo);
        self.write(addr.wrapping_add(1), hi);
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_u16(addr, val as u16);
        self.write_u16(addr.wrapping_add(2), (val >> 16) as u16);
    }

    /// Fill `buf` from consecutive addresses starting at `addr`
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read(addr.wrapping_add(i as u32));
        }
    }

    /// Store `data` at consecutive addresses starting at `addr`
    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.write(addr.wrapping_add(i as u32), byte);
        }
    }
}

/// Flat, contiguous guest memory starting at linear address 0
#[derive(Debug, Clone)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    /// Create zeroed memory of the given size in bytes
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    /// Memory covering the full real-mode address space (1MB + HMA)
    pub fn real_mode() -> Self {
        Self::new(REAL_MODE_SPACE)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check whether a linear address is backed by this memory
    pub fn contains(&self, addr: u32) -> bool {
        (addr as usize) < self.bytes.len()
    }

    /// Direct view of a byte range, if fully in bounds
    pub fn slice(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let start = addr as usize;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

impl GuestMemory for FlatMemory {
    fn read(&self, addr: u32) -> u8 {
        self.bytes.get(addr as usize).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: u32, val: u8) {
        if let Some(byte) = self.bytes.get_mut(addr as usize) {
            *byte = val;
        }
    }
}

/// Real-mode far pointer (segment:offset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FarPtr {
    pub segment: u16,
    pub offset: u16,
}

impl FarPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Decode the packed form (offset in the low word, segment in the high word)
    pub const fn from_u32(packed: u32) -> Self {
        Self {
            segment: (packed >> 16) as u16,
            offset: packed as u16,
        }
    }

    /// Pack as offset in the low word, segment in the high word
    pub const fn to_u32(self) -> u32 {
        ((self.segment as u32) << 16) | self.offset as u32
    }

    /// Real-mode linear address (segment * 16 + offset)
    pub const fn linear(self) -> u32 {
        ((self.segment as u32) << 4) + self.offset as u32
    }
}

impl std::fmt::Display for FarPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}
