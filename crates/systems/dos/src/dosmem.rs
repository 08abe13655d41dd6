//! Conventional memory arena
//!
//! Paragraph-granular first-fit allocator over the DOS memory area. Backs
//! DPMI functions 0100h-0102h, default real-mode stacks and callback
//! trampolines.

use emu_core::logging::{log, LogCategory, LogLevel};
use serde::Serialize;
use std::collections::BTreeMap;

/// Allocator of small blocks in the real-mode address space
pub trait GuestBlockAllocator {
    /// Allocate at least `size` bytes; returns the block's segment and
    /// linear address
    fn allocate_block(&mut self, size: u32) -> Option<(u16, u32)>;

    /// Free a block by the linear address returned from `allocate_block`
    fn free_block(&mut self, linear: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DosBlock {
    pub segment: u16,
    pub paragraphs: u16,
}

#[derive(Debug, Clone)]
pub struct DosMemory {
    start: u16,
    end: u16,
    /// Allocated blocks: segment -> size in paragraphs
    blocks: BTreeMap<u16, u16>,
}

impl DosMemory {
    /// Arena covering paragraphs `start..end`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            blocks: BTreeMap::new(),
        }
    }

    /// Allocate `paragraphs`; on failure returns the largest free block
    pub fn allocate(&mut self, paragraphs: u16) -> Result<u16, u16> {
        if paragraphs == 0 {
            return Err(self.largest_free());
        }

        let mut candidate = self.start;
        for (&segment, &size) in &self.blocks {
            if segment - candidate >= paragraphs {
                break;
            }
            candidate = segment + size;
        }

        if self.end - candidate < paragraphs {
            let largest = self.largest_free();
            log(LogCategory::Memory, LogLevel::Debug, || {
                format!(
                    "DOS allocation of {:#06X} paragraphs failed, largest free {:#06X}",
                    paragraphs, largest
                )
            });
            return Err(largest);
        }

        self.blocks.insert(candidate, paragraphs);
        log(LogCategory::Memory, LogLevel::Trace, || {
            format!(
                "DOS block {:04X} ({:#06X} paragraphs)",
                candidate, paragraphs
            )
        });
        Ok(candidate)
    }

    pub fn free(&mut self, segment: u16) -> bool {
        self.blocks.remove(&segment).is_some()
    }

    /// Resize a block in place; on failure returns the largest size the
    /// block could take
    pub fn resize(&mut self, segment: u16, paragraphs: u16) -> Result<(), Option<u16>> {
        if !self.blocks.contains_key(&segment) {
            return Err(None);
        }
        let ceiling = self
            .blocks
            .range(segment + 1..)
            .next()
            .map_or(self.end, |(&next, _)| next);
        let max = ceiling - segment;
        if paragraphs == 0 || paragraphs > max {
            return Err(Some(max));
        }
        self.blocks.insert(segment, paragraphs);
        Ok(())
    }

    pub fn block(&self, segment: u16) -> Option<DosBlock> {
        self.blocks.get(&segment).map(|&paragraphs| DosBlock {
            segment,
            paragraphs,
        })
    }

    pub fn blocks(&self) -> impl Iterator<Item = DosBlock> + '_ {
        self.blocks.iter().map(|(&segment, &paragraphs)| DosBlock {
            segment,
            paragraphs,
        })
    }

    pub fn largest_free(&self) -> u16 {
        let mut largest = 0;
        let mut cursor = self.start;
        for (&segment, &size) in &self.blocks {
            largest = largest.max(segment - cursor);
            cursor = segment + size;
        }
        largest.max(self.end - cursor)
    }

    pub fn free_paragraphs(&self) -> u32 {
        let used: u32 = self.blocks.values().map(|&size| size as u32).sum();
        (self.end - self.start) as u32 - used
    }
}

impl GuestBlockAllocator for DosMemory {
    fn allocate_block(&mut self, size: u32) -> Option<(u16, u32)> {
        let paragraphs = u16::try_from(size.div_ceil(16)).ok()?;
        let segment = self.allocate(paragraphs).ok()?;
        Some((segment, (segment as u32) << 4))
    }

    fn free_block(&mut self, linear: u32) -> bool {
        if linear & 0xF != 0 {
            return false;
        }
        u16::try_from(linear >> 4).is_ok_and(|segment| self.free(segment))
    }
}
