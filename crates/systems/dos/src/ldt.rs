//! Local descriptor table
//!
//! Selectors handed to DPMI clients are LDT selectors with RPL 3
//! (`index << 3 | 7`). Indices 1-15 are reserved for clients that ask for
//! specific descriptors (000Dh); general allocation starts at index 16.

use crate::error::DpmiError;
use emu_core::descriptor::{access_rights, flags, SegmentDescriptor};
use emu_core::logging::{log, LogCategory, LogLevel};

pub const LDT_ENTRIES: usize = 8192;
pub const FIRST_SPECIFIC_INDEX: usize = 1;
pub const FIRST_GENERAL_INDEX: usize = 16;

/// Segment type flags for [`LocalDescriptorTable::allocate_selector`]
pub mod segment_flags {
    use emu_core::descriptor::access_rights;

    /// Writable data segment
    pub const DATA: u8 = access_rights::WRITABLE_READABLE | access_rights::ACCESSED;
    /// Readable code segment
    pub const CODE: u8 =
        access_rights::CODE_SEGMENT | access_rights::WRITABLE_READABLE | access_rights::ACCESSED;
    /// 32-bit default operand size / big stack
    pub const BIG: u8 = 0x40;
}

const TYPE_MASK: u8 = 0x0F;
const CLIENT_ACCESS: u8 =
    access_rights::PRESENT | access_rights::DPL_MASK | access_rights::DESCRIPTOR_TYPE;

#[inline]
pub fn selector_for(index: usize) -> u16 {
    ((index as u16) << 3) | 7
}

#[derive(Debug, Clone)]
pub struct LocalDescriptorTable {
    entries: Vec<Option<SegmentDescriptor>>,
}

impl Default for LocalDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDescriptorTable {
    pub fn new() -> Self {
        Self {
            entries: vec![None; LDT_ENTRIES],
        }
    }

    fn index_of(selector: u16) -> Option<usize> {
        // TI bit selects the LDT; index 0 is never handed out
        if selector & 4 == 0 {
            return None;
        }
        let index = (selector >> 3) as usize;
        (index != 0).then_some(index)
    }

    fn entry(&self, selector: u16) -> Result<&SegmentDescriptor, DpmiError> {
        Self::index_of(selector)
            .and_then(|index| self.entries[index].as_ref())
            .ok_or(DpmiError::InvalidSelector(selector))
    }

    fn entry_mut(&mut self, selector: u16) -> Result<&mut SegmentDescriptor, DpmiError> {
        Self::index_of(selector)
            .and_then(|index| self.entries[index].as_mut())
            .ok_or(DpmiError::InvalidSelector(selector))
    }

    fn blank() -> SegmentDescriptor {
        SegmentDescriptor {
            base: 0,
            limit: 0,
            access: CLIENT_ACCESS | segment_flags::DATA,
            flags: 0,
        }
    }

    pub fn is_allocated(&self, selector: u16) -> bool {
        self.entry(selector).is_ok()
    }

    pub fn in_use(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    /// Allocate `count` consecutive descriptors (base 0, limit 0, data);
    /// returns the first selector
    pub fn allocate_array(&mut self, count: u16) -> Option<u16> {
        let count = count as usize;
        if count == 0 {
            return None;
        }

        let mut run = 0;
        for index in FIRST_GENERAL_INDEX..LDT_ENTRIES {
            if self.entries[index].is_some() {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = index + 1 - count;
                for slot in &mut self.entries[first..=index] {
                    *slot = Some(Self::blank());
                }
                log(LogCategory::Dpmi, LogLevel::Trace, || {
                    format!("allocated {} descriptor(s) at {:#06X}", count, selector_for(first))
                });
                return Some(selector_for(first));
            }
        }

        log(LogCategory::Dpmi, LogLevel::Warn, || {
            format!("LDT exhausted allocating {} descriptor(s)", count)
        });
        None
    }

    /// Allocate one descriptor for `base..=base+limit` with the given
    /// [`segment_flags`]
    pub fn allocate_selector(&mut self, base: u32, limit: u32, seg_flags: u8) -> Option<u16> {
        let selector = self.allocate_array(1)?;
        let index = selector as usize >> 3;
        self.entries[index] = Some(SegmentDescriptor::with_byte_limit(
            base,
            limit,
            CLIENT_ACCESS | (seg_flags & TYPE_MASK),
            if seg_flags & segment_flags::BIG != 0 {
                flags::BIG
            } else {
                0
            },
        ));
        Some(selector)
    }

    /// Claim one of the reserved low descriptors (000Dh)
    pub fn allocate_specific(&mut self, selector: u16) -> Result<(), DpmiError> {
        let index = Self::index_of(selector)
            .filter(|&index| (FIRST_SPECIFIC_INDEX..FIRST_GENERAL_INDEX).contains(&index))
            .ok_or(DpmiError::InvalidSelector(selector))?;
        if self.entries[index].is_some() {
            return Err(DpmiError::DescriptorUnavailable);
        }
        self.entries[index] = Some(Self::blank());
        Ok(())
    }

    /// Extend an array of `count` descriptors starting at `first` to
    /// `new_count`, either claiming the following free slots or releasing
    /// the tail. Nothing changes on failure.
    pub fn resize_array(&mut self, first: u16, count: u16, new_count: u16) -> bool {
        let Some(start) = Self::index_of(first) else {
            return false;
        };
        let (count, new_count) = (count as usize, new_count as usize);
        if new_count == 0 || start + new_count > LDT_ENTRIES {
            return false;
        }

        if new_count > count {
            if self.entries[start + count..start + new_count]
                .iter()
                .any(Option::is_some)
            {
                return false;
            }
            for slot in &mut self.entries[start + count..start + new_count] {
                *slot = Some(Self::blank());
            }
        } else {
            for slot in &mut self.entries[start + new_count..start + count] {
                *slot = None;
            }
        }
        true
    }

    pub fn free(&mut self, selector: u16) -> Result<(), DpmiError> {
        let index = Self::index_of(selector).ok_or(DpmiError::InvalidSelector(selector))?;
        match self.entries[index].take() {
            Some(_) => Ok(()),
            None => Err(DpmiError::InvalidSelector(selector)),
        }
    }

    pub fn descriptor(&self, selector: u16) -> Result<SegmentDescriptor, DpmiError> {
        self.entry(selector).copied()
    }

    /// Replace a descriptor (000Ch); system descriptors are refused
    pub fn set_descriptor(
        &mut self,
        selector: u16,
        descriptor: SegmentDescriptor,
    ) -> Result<(), DpmiError> {
        if descriptor.access & access_rights::DESCRIPTOR_TYPE == 0 {
            return Err(DpmiError::InvalidValue);
        }
        *self.entry_mut(selector)? = descriptor;
        Ok(())
    }

    pub fn base(&self, selector: u16) -> Result<u32, DpmiError> {
        Ok(self.entry(selector)?.base)
    }

    pub fn set_base(&mut self, selector: u16, base: u32) -> Result<(), DpmiError> {
        self.entry_mut(selector)?.base = base;
        Ok(())
    }

    /// Limit in bytes
    pub fn limit(&self, selector: u16) -> Result<u32, DpmiError> {
        Ok(self.entry(selector)?.byte_limit())
    }

    /// Set the byte limit. Limits above 1MB must be page-granular, so their
    /// low 12 bits have to be set.
    pub fn set_limit(&mut self, selector: u16, limit: u32) -> Result<(), DpmiError> {
        if limit > 0xFFFFF && limit & 0xFFF != 0xFFF {
            return Err(DpmiError::InvalidValue);
        }
        let entry = self.entry_mut(selector)?;
        *entry = SegmentDescriptor::with_byte_limit(entry.base, limit, entry.access, entry.flags);
        Ok(())
    }

    /// Set access rights (0009h): `access` is the access byte, the high
    /// nibble of `extended` holds the G/B/AVL flags
    pub fn set_access_rights(
        &mut self,
        selector: u16,
        access: u8,
        extended: u8,
    ) -> Result<(), DpmiError> {
        if access & access_rights::DESCRIPTOR_TYPE == 0
            || (access & access_rights::DPL_MASK) != access_rights::DPL_MASK
        {
            return Err(DpmiError::InvalidValue);
        }
        let entry = self.entry_mut(selector)?;
        entry.access = access;
        entry.flags = (extended >> 4) & 0x0F;
        Ok(())
    }

    /// Writable data alias of an existing descriptor (000Ah)
    pub fn alias(&mut self, selector: u16) -> Result<u16, DpmiError> {
        let source = self.descriptor(selector)?;
        let alias = self
            .allocate_array(1)
            .ok_or(DpmiError::DescriptorUnavailable)?;
        let access = (source.access & !TYPE_MASK) | segment_flags::DATA;
        self.entries[alias as usize >> 3] = Some(SegmentDescriptor { access, ..source });
        Ok(alias)
    }

    /// Linear address of `selector:offset`
    pub fn linear(&self, selector: u16, offset: u32) -> Result<u32, DpmiError> {
        Ok(self.base(selector)?.wrapping_add(offset))
    }
}
