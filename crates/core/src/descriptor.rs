//! x86 segment descriptors
//!
//! Encoding and decoding of the 8-byte descriptor format used by the GDT and
//! LDT:
//! - Bytes 0-1: Segment Limit (bits 0-15)
//! - Bytes 2-3: Base Address (bits 0-15)
//! - Byte 4: Base Address (bits 16-23)
//! - Byte 5: Access Rights
//! - Byte 6: Limit (bits 16-19) + Flags
//! - Byte 7: Base Address (bits 24-31)

use serde::{Deserialize, Serialize};

/// Segment descriptor in decoded form
///
/// `limit` is the raw 20-bit field; see [`SegmentDescriptor::byte_limit`]
/// for the limit in bytes once granularity is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    /// High nibble of byte 6 (see [`flags`])
    pub flags: u8,
}

impl SegmentDescriptor {
    /// Build a descriptor from a byte-granular limit, switching to page
    /// granularity when the limit does not fit in 20 bits
    pub fn with_byte_limit(base: u32, byte_limit: u32, access: u8, flags: u8) -> Self {
        let flags = flags & !flags::GRANULARITY;
        if byte_limit > 0xFFFFF {
            Self {
                base,
                limit: byte_limit >> 12,
                access,
                flags: flags | flags::GRANULARITY,
            }
        } else {
            Self {
                base,
                limit: byte_limit,
                access,
                flags,
            }
        }
    }

    /// Parse a segment descriptor from 8 bytes in memory
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        let limit_low = u16::from_le_bytes([bytes[0], bytes[1]]);
        let base_low = u16::from_le_bytes([bytes[2], bytes[3]]);

        Self {
            base: (base_low as u32) | ((bytes[4] as u32) << 16) | ((bytes[7] as u32) << 24),
            limit: (limit_low as u32) | (((bytes[6] & 0x0F) as u32) << 16),
            access: bytes[5],
            flags: (bytes[6] >> 4) & 0x0F,
        }
    }

    /// Encode into the 8-byte table format
    pub fn to_bytes(&self) -> [u8; 8] {
        let limit = self.limit & 0xFFFFF;
        [
            limit as u8,
            (limit >> 8) as u8,
            self.base as u8,
            (self.base >> 8) as u8,
            (self.base >> 16) as u8,
            self.access,
            ((self.flags & 0x0F) << 4) | ((limit >> 16) as u8 & 0x0F),
            (self.base >> 24) as u8,
        ]
    }

    /// Segment limit in bytes
    pub fn byte_limit(&self) -> u32 {
        if self.flags & flags::GRANULARITY != 0 {
            (self.limit << 12) | 0xFFF
        } else {
            self.limit
        }
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        (self.access & access_rights::PRESENT) != 0
    }

    /// Descriptor privilege level (DPL)
    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 0x03
    }

    #[inline]
    pub fn is_code_segment(&self) -> bool {
        (self.access & access_rights::CODE_SEGMENT) != 0
    }

    /// Whether the default operand/stack size is 32-bit
    #[inline]
    pub fn is_big(&self) -> bool {
        (self.flags & flags::BIG) != 0
    }
}

/// Access Rights Byte flags
pub mod access_rights {
    pub const ACCESSED: u8 = 0x01;

    /// For data segments: Writable
    /// For code segments: Readable
    pub const WRITABLE_READABLE: u8 = 0x02;

    /// For data segments: Expand down
    /// For code segments: Conforming
    pub const EXPAND_DOWN_CONFORMING: u8 = 0x04;

    /// Code segment (1) vs Data segment (0)
    pub const CODE_SEGMENT: u8 = 0x08;

    /// Descriptor type: System (0) or Code/Data (1)
    pub const DESCRIPTOR_TYPE: u8 = 0x10;

    /// Descriptor Privilege Level (2 bits)
    pub const DPL_MASK: u8 = 0x60;

    pub const PRESENT: u8 = 0x80;
}

/// Flag nibble (byte 6, bits 4-7)
pub mod flags {
    /// Available for system software
    pub const AVAILABLE: u8 = 0x01;
    /// Default operand size / big stack (32-bit)
    pub const BIG: u8 = 0x04;
    /// Limit counted in 4KB pages
    pub const GRANULARITY: u8 = 0x08;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_descriptor_from_bytes() {
        // base=0x100000, limit=0xFFFFF, access=0x9A (code, present, DPL=0)
        let bytes = [0xFF, 0xFF, 0x00, 0x00, 0x10, 0x9A, 0xCF, 0x00];

        let desc = SegmentDescriptor::from_bytes(&bytes);
        assert_eq!(desc.base, 0x00100000);
        assert_eq!(desc.limit, 0x000FFFFF);
        assert_eq!(desc.access, 0x9A);
        assert!(desc.is_present());
        assert!(desc.is_code_segment());
        assert!(desc.is_big());
        assert_eq!(desc.dpl(), 0);
        assert_eq!(desc.byte_limit(), 0xFFFF_FFFF);
        assert_eq!(desc.to_bytes(), bytes);
    }

    #[test]
    fn test_large_limit_switches_to_page_granularity() {
        let desc = SegmentDescriptor::with_byte_limit(0x20000, 0x3F_FFFF, 0xF2, 0);
        assert_eq!(desc.flags & flags::GRANULARITY, flags::GRANULARITY);
        assert_eq!(desc.limit, 0x3FF);
        assert_eq!(desc.byte_limit(), 0x3F_FFFF);

        let small = SegmentDescriptor::with_byte_limit(0x20000, 0xFFFF, 0xF2, flags::GRANULARITY);
        assert_eq!(small.flags & flags::GRANULARITY, 0);
        assert_eq!(small.byte_limit(), 0xFFFF);
    }

    #[test]
    fn test_segment_descriptor_dpl_and_type() {
        let bytes = [0x00, 0x00, 0x34, 0x12, 0x00, 0xF2, 0x00, 0x00];
        let desc = SegmentDescriptor::from_bytes(&bytes);
        assert_eq!(desc.dpl(), 3);
        assert_eq!(desc.base, 0x1234);
        assert!(!desc.is_code_segment());
    }
}
