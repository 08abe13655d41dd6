//! Linear memory allocation (0501h-0503h)
//!
//! DPMI clients expect linear blocks to come back at increasing addresses.
//! Some of them compare block addresses to decide how to merge or order
//! their own heaps, so the allocator keeps a cursor just past the previous
//! block and probes forward from it in 64KB steps. Only when the probe wraps
//! around the address space does it fall back to letting the host pick an
//! address.

use crate::error::DpmiError;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::GuestMemory;
use std::collections::BTreeMap;

/// Host address-space reservation granularity
pub const ALLOCATION_GRANULARITY: u32 = 0x10000;

/// Host virtual memory service backing linear blocks
///
/// Addresses are guest linear addresses; the host maps them identically.
pub trait HostVirtualMemory: GuestMemory {
    /// Reserve and commit `size` readable/writable/executable bytes.
    ///
    /// With a hint the region must start exactly at the hint; `None` is
    /// returned when that range is unavailable. Without a hint the host
    /// picks any free address.
    fn commit(&mut self, hint: Option<u32>, size: u32) -> Option<u32>;

    /// Committed size of the region starting at `addr`
    fn region_size(&self, addr: u32) -> Option<u32>;

    /// Release the region starting at `addr`
    fn release(&mut self, addr: u32) -> bool;

    fn page_size(&self) -> u32;

    /// Total size of the managed address space
    fn total_bytes(&self) -> u32;

    fn free_bytes(&self) -> u32;

    fn largest_free_block(&self) -> u32;
}

/// In-process stand-in for the host's virtual memory API
///
/// Regions are page-rounded and placed on 64KB boundaries inside
/// `[base, limit)`. Backing storage is allocated on commit.
#[derive(Debug, Clone)]
pub struct SimulatedHostMemory {
    base: u32,
    limit: u32,
    page_size: u32,
    regions: BTreeMap<u32, Vec<u8>>,
}

impl SimulatedHostMemory {
    pub fn new(base: u32, limit: u32, page_size: u32) -> Self {
        Self {
            base,
            limit,
            page_size,
            regions: BTreeMap::new(),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn round_to_page(&self, size: u32) -> Option<u32> {
        let page = self.page_size as u64;
        let rounded = (size as u64).div_ceil(page) * page;
        u32::try_from(rounded).ok()
    }

    fn is_free(&self, start: u32, len: u32) -> bool {
        let end = start as u64 + len as u64;
        if start < self.base || end > self.limit as u64 {
            return false;
        }
        // end <= limit, so it fits in u32
        match self.regions.range(..end as u32).next_back() {
            Some((&addr, data)) => addr as u64 + data.len() as u64 <= start as u64,
            None => true,
        }
    }

    fn find_free(&self, len: u32) -> Option<u32> {
        let mut candidate = self.base as u64;
        for (&addr, data) in &self.regions {
            if addr as u64 >= candidate && addr as u64 - candidate >= len as u64 {
                break;
            }
            let end = addr as u64 + data.len() as u64;
            candidate = candidate.max(end.next_multiple_of(ALLOCATION_GRANULARITY as u64));
        }
        if candidate + len as u64 <= self.limit as u64 {
            Some(candidate as u32)
        } else {
            None
        }
    }

    fn region_at(&self, addr: u32) -> Option<(u32, &Vec<u8>)> {
        let (&start, data) = self.regions.range(..=addr).next_back()?;
        ((addr - start) < data.len() as u32).then_some((start, data))
    }

    /// Gaps between regions, in address order
    fn gaps(&self) -> impl Iterator<Item = u32> + '_ {
        let mut cursor = self.base as u64;
        let limit = self.limit as u64;
        self.regions
            .iter()
            .map(|(&addr, data)| (addr as u64, addr as u64 + data.len() as u64))
            .chain(std::iter::once((limit, limit)))
            .map(move |(start, end)| {
                let gap = start.saturating_sub(cursor);
                cursor = cursor.max(end);
                gap as u32
            })
    }
}

impl GuestMemory for SimulatedHostMemory {
    fn read(&self, addr: u32) -> u8 {
        match self.region_at(addr) {
            Some((start, data)) => data[(addr - start) as usize],
            None => 0,
        }
    }

    fn write(&mut self, addr: u32, val: u8) {
        if let Some((&start, data)) = self.regions.range_mut(..=addr).next_back() {
            if let Some(byte) = data.get_mut((addr - start) as usize) {
                *byte = val;
            }
        }
    }
}

impl HostVirtualMemory for SimulatedHostMemory {
    fn commit(&mut self, hint: Option<u32>, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let len = self.round_to_page(size)?;
        let start = match hint {
            Some(addr) => {
                let addr = addr & !(ALLOCATION_GRANULARITY - 1);
                self.is_free(addr, len).then_some(addr)?
            }
            None => self.find_free(len)?,
        };
        self.regions.insert(start, vec![0; len as usize]);
        Some(start)
    }

    fn region_size(&self, addr: u32) -> Option<u32> {
        self.regions.get(&addr).map(|data| data.len() as u32)
    }

    fn release(&mut self, addr: u32) -> bool {
        self.regions.remove(&addr).is_some()
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn total_bytes(&self) -> u32 {
        self.limit - self.base
    }

    fn free_bytes(&self) -> u32 {
        let used: u64 = self.regions.values().map(|data| data.len() as u64).sum();
        (self.total_bytes() as u64).saturating_sub(used) as u32
    }

    fn largest_free_block(&self) -> u32 {
        self.gaps().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbePass {
    /// Probing upward from the cursor
    Forward,
    /// Wrapped once; host placement tried, probing continues from low memory
    Fallback,
    /// Passed the starting cursor again; the next wrap means exhaustion
    Exhausting,
}

/// Monotonic linear block allocator
#[derive(Debug)]
pub struct LinearAllocator<H: HostVirtualMemory> {
    host: H,
    /// Next probe address, or `None` before the first allocation and after
    /// the cursor wrapped past the top of the address space
    cursor: Option<u32>,
    fallbacks: u32,
    warned: bool,
}

impl<H: HostVirtualMemory> LinearAllocator<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            cursor: None,
            fallbacks: 0,
            warned: false,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }

    /// Number of allocations that had to give up linear ordering
    pub fn fallback_count(&self) -> u32 {
        self.fallbacks
    }

    /// Number of non-linear fallback warnings emitted (at most one)
    pub fn fallback_warnings(&self) -> u32 {
        self.warned as u32
    }

    /// Allocate `size` bytes at an address above every previous block
    /// whenever the address space allows it
    pub fn allocate(&mut self, size: u32) -> Result<u32, DpmiError> {
        if size == 0 {
            return Err(DpmiError::InvalidValue);
        }

        let addr = match self.cursor {
            None => self
                .host
                .commit(None, size)
                .ok_or(DpmiError::OutOfMemory(size))?,
            Some(start) => self.probe_from(start, size)?,
        };

        self.cursor = next_cursor(addr, size);
        log(LogCategory::Memory, LogLevel::Debug, || {
            format!("linear block of {:#X} bytes at {:#010X}", size, addr)
        });
        Ok(addr)
    }

    fn probe_from(&mut self, start: u32, size: u32) -> Result<u32, DpmiError> {
        let mut probe = start;
        let mut pass = ProbePass::Forward;

        loop {
            if let Some(addr) = self.host.commit(Some(probe), size) {
                return Ok(addr);
            }

            let next = probe.wrapping_add(ALLOCATION_GRANULARITY);
            match pass {
                ProbePass::Forward if next < start => {
                    self.fallbacks += 1;
                    if !self.warned {
                        self.warned = true;
                        log(LogCategory::Memory, LogLevel::Warn, || {
                            "linear address space wrapped; falling back to non-linear allocation"
                                .to_string()
                        });
                    }
                    if let Some(addr) = self.host.commit(None, size) {
                        return Ok(addr);
                    }
                    pass = ProbePass::Fallback;
                }
                ProbePass::Fallback if next >= start => pass = ProbePass::Exhausting,
                ProbePass::Exhausting if next < start => {
                    log(LogCategory::Memory, LogLevel::Error, || {
                        format!("out of linear memory allocating {:#X} bytes", size)
                    });
                    return Err(DpmiError::OutOfMemory(size));
                }
                _ => {}
            }
            probe = next;
        }
    }

    /// Grow a block, moving it when the committed region is too small.
    /// Blocks are never shrunk.
    pub fn reallocate(&mut self, addr: u32, new_size: u32) -> Result<u32, DpmiError> {
        let committed = self
            .host
            .region_size(addr)
            .ok_or(DpmiError::InvalidHandle(addr))?;
        if new_size <= committed {
            return Ok(addr);
        }

        let moved = self.allocate(new_size)?;
        let mut contents = vec![0u8; committed as usize];
        self.host.read_bytes(addr, &mut contents);
        self.host.write_bytes(moved, &contents);
        self.host.release(addr);

        log(LogCategory::Memory, LogLevel::Debug, || {
            format!(
                "linear block {:#010X} moved to {:#010X} ({:#X} bytes)",
                addr, moved, new_size
            )
        });
        Ok(moved)
    }

    pub fn free(&mut self, addr: u32) -> Result<(), DpmiError> {
        if self.host.release(addr) {
            Ok(())
        } else {
            Err(DpmiError::InvalidHandle(addr))
        }
    }
}

/// First 64KB boundary past the block, `None` when that wraps to zero
fn next_cursor(addr: u32, size: u32) -> Option<u32> {
    let end = addr as u64 + size as u64;
    let aligned = end.next_multiple_of(ALLOCATION_GRANULARITY as u64);
    u32::try_from(aligned).ok().filter(|&cursor| cursor != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> LinearAllocator<SimulatedHostMemory> {
        LinearAllocator::new(SimulatedHostMemory::new(0x0040_0000, 0x0100_0000, 4096))
    }

    #[test]
    fn test_allocations_are_monotonic() {
        let mut linear = allocator();
        let mut previous_end = 0u64;
        for size in [100, 0x12345, 4096, 0x10000, 1] {
            let addr = linear.allocate(size).unwrap();
            assert!(addr as u64 >= previous_end);
            assert_eq!(addr % ALLOCATION_GRANULARITY, 0);
            previous_end = addr as u64 + size as u64;
        }
        assert_eq!(linear.fallback_warnings(), 0);
    }

    #[test]
    fn test_monotonic_after_free() {
        let mut linear = allocator();
        let a = linear.allocate(0x1000).unwrap();
        let b = linear.allocate(0x1000).unwrap();
        linear.free(a).unwrap();
        let c = linear.allocate(0x1000).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut linear = allocator();
        assert_eq!(linear.allocate(0), Err(DpmiError::InvalidValue));
    }

    #[test]
    fn test_reallocate_never_shrinks() {
        let mut linear = allocator();
        let addr = linear.allocate(100).unwrap();
        assert_eq!(linear.reallocate(addr, 50), Ok(addr));
        assert_eq!(linear.reallocate(addr, 4000), Ok(addr));
        assert_eq!(linear.host().region_size(addr), Some(4096));
    }

    #[test]
    fn test_reallocate_moves_and_preserves_contents() {
        let mut linear = allocator();
        let addr = linear.allocate(100).unwrap();
        let pattern: Vec<u8> = (0..100).map(|i| i as u8 ^ 0x5A).collect();
        linear.host_mut().write_bytes(addr, &pattern);

        let moved = linear.reallocate(addr, 0x20000).unwrap();
        assert_ne!(moved, addr);
        assert!(moved > addr);
        let mut copy = vec![0u8; 100];
        linear.host().read_bytes(moved, &mut copy);
        assert_eq!(copy, pattern);
        assert_eq!(linear.host().region_size(addr), None);
    }

    #[test]
    fn test_invalid_handles() {
        let mut linear = allocator();
        assert_eq!(
            linear.free(0x0050_0000),
            Err(DpmiError::InvalidHandle(0x0050_0000))
        );
        assert_eq!(
            linear.reallocate(0x0050_0000, 16),
            Err(DpmiError::InvalidHandle(0x0050_0000))
        );
        let addr = linear.allocate(16).unwrap();
        linear.free(addr).unwrap();
        assert_eq!(linear.free(addr), Err(DpmiError::InvalidHandle(addr)));
    }

    #[test]
    fn test_wrap_falls_back_and_warns_once() {
        // Four 64KB slots
        let host = SimulatedHostMemory::new(0x4000_0000, 0x4004_0000, 4096);
        let mut linear = LinearAllocator::new(host);

        let a = linear.allocate(0x10000).unwrap();
        let b = linear.allocate(0x10000).unwrap();
        let c = linear.allocate(0x10000).unwrap();
        assert_eq!((a, b, c), (0x4000_0000, 0x4001_0000, 0x4002_0000));
        linear.free(a).unwrap();
        linear.free(b).unwrap();

        // Cursor sits at the last slot; fill it
        let d = linear.allocate(0x10000).unwrap();
        assert_eq!(d, 0x4003_0000);
        assert_eq!(linear.fallback_warnings(), 0);

        // Nothing above the cursor: wrap and reuse low memory
        let e = linear.allocate(0x10000).unwrap();
        assert_eq!(e, 0x4000_0000);
        assert_eq!(linear.fallback_warnings(), 1);

        let f = linear.allocate(0x10000).unwrap();
        assert_eq!(f, 0x4001_0000);
        assert_eq!(linear.fallback_warnings(), 1);

        assert_eq!(
            linear.allocate(0x10000),
            Err(DpmiError::OutOfMemory(0x10000))
        );
    }

    #[test]
    fn test_host_accounting() {
        let mut host = SimulatedHostMemory::new(0x0040_0000, 0x0060_0000, 4096);
        assert_eq!(host.total_bytes(), 0x20_0000);
        assert_eq!(host.largest_free_block(), 0x20_0000);

        let addr = host.commit(Some(0x0050_0000), 10).unwrap();
        assert_eq!(addr, 0x0050_0000);
        assert_eq!(host.region_size(addr), Some(4096));
        assert_eq!(host.free_bytes(), 0x20_0000 - 4096);
        assert_eq!(host.largest_free_block(), 0x10_0000);
        assert_eq!(host.commit(Some(0x0050_0000), 10), None);

        host.write_u32(addr + 8, 0xCAFE_F00D);
        assert_eq!(host.read_u32(addr + 8), 0xCAFE_F00D);
        assert_eq!(host.read(addr + 4096), 0);
    }
}
