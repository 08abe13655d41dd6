//! XMS driver entry point
//!
//! Clients locate the driver through INT 2Fh AX=4310h and far-call the
//! returned entry, which traps into the extender. Functions are selected by
//! AH; on return AX=1 means success, AX=0 failure with the error in BL.
//!
//! Extended memory blocks are kept host-side; function 0Bh copies between
//! them and conventional memory.

use crate::context::NativeContext;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::{FarPtr, GuestMemory};
use serde::Serialize;
use std::collections::BTreeMap;

/// XMS 2.0
const XMS_VERSION: u16 = 0x0200;
const DRIVER_REVISION: u16 = 0x0001;

/// Size of the High Memory Area in bytes (64KB - 16 bytes)
const HMA_SIZE: u32 = 65520;

/// Nominal linear address reported for locked blocks
const EMB_BASE_ADDRESS: u32 = 0x0011_0000;
const MAX_HANDLES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XmsError {
    NotImplemented = 0x80,
    HmaDoesNotExist = 0x90,
    HmaAlreadyInUse = 0x91,
    HmaSizeTooSmall = 0x92,
    HmaNotAllocated = 0x93,
    AllExtendedMemoryAllocated = 0xA0,
    AllHandlesInUse = 0xA1,
    InvalidHandle = 0xA2,
    InvalidSourceHandle = 0xA3,
    InvalidSourceOffset = 0xA4,
    InvalidDestHandle = 0xA5,
    InvalidDestOffset = 0xA6,
    InvalidLength = 0xA7,
    BlockNotLocked = 0xAA,
    BlockLocked = 0xAB,
    LockCountOverflow = 0xAC,
    UmbSmallerThanRequested = 0xB0,
    NoUmbsAvailable = 0xB1,
    InvalidUmbSegment = 0xB2,
}

#[derive(Debug, Clone)]
struct ExtendedMemoryBlock {
    lock_count: u8,
    linear_address: u32,
    data: Vec<u8>,
}

impl ExtendedMemoryBlock {
    fn size_kb(&self) -> u16 {
        (self.data.len() / 1024) as u16
    }
}

#[derive(Debug, Clone)]
struct UpperMemoryBlock {
    segment: u16,
    paragraphs: u16,
    allocated: bool,
}

/// One side of an 0Bh move: an EMB offset, or conventional memory when the
/// handle is zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveEndpoint {
    Conventional(u32),
    Block { handle: u16, offset: u32 },
}

impl MoveEndpoint {
    fn new(handle: u16, offset: u32) -> Self {
        if handle == 0 {
            MoveEndpoint::Conventional(FarPtr::from_u32(offset).linear())
        } else {
            MoveEndpoint::Block { handle, offset }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct XmsStatus {
    pub total_kb: u32,
    pub free_kb: u32,
    pub handles: usize,
    pub a20_enabled: bool,
    pub hma_allocated: bool,
}

#[derive(Debug, Clone)]
pub struct XmsDriver {
    total_kb: u32,
    free_kb: u32,
    blocks: BTreeMap<u16, ExtendedMemoryBlock>,
    hma_allocated: bool,
    a20_enabled: bool,
    a20_global_count: u16,
    umbs: Vec<UpperMemoryBlock>,
}

impl XmsDriver {
    pub fn new(extended_kb: u32) -> Self {
        Self {
            total_kb: extended_kb,
            free_kb: extended_kb,
            blocks: BTreeMap::new(),
            hma_allocated: false,
            a20_enabled: false,
            a20_global_count: 0,
            // C000-DFFF, two 64KB blocks
            umbs: [0xC000, 0xD000]
                .into_iter()
                .map(|segment| UpperMemoryBlock {
                    segment,
                    paragraphs: 0x1000,
                    allocated: false,
                })
                .collect(),
        }
    }

    pub fn status(&self) -> XmsStatus {
        XmsStatus {
            total_kb: self.total_kb,
            free_kb: self.free_kb,
            handles: self.blocks.len(),
            a20_enabled: self.a20_enabled,
            hma_allocated: self.hma_allocated,
        }
    }

    /// Service one far call to the driver entry point
    pub fn handle_entry<M: GuestMemory + ?Sized>(&mut self, ctx: &mut NativeContext, mem: &mut M) {
        let function = ctx.ah();
        log(LogCategory::Xms, LogLevel::Trace, || {
            format!("XMS function {:02X}h DX={:04X}", function, ctx.dx())
        });

        let result = match function {
            0x00 => {
                ctx.set_ax(XMS_VERSION);
                ctx.set_bx(DRIVER_REVISION);
                ctx.set_dx(1);
                return;
            }
            0x01 => self.request_hma(ctx.dx()),
            0x02 => self.release_hma(),
            0x03 => {
                self.global_enable_a20();
                Ok(())
            }
            0x04 => {
                self.global_disable_a20();
                Ok(())
            }
            0x05 => {
                self.a20_enabled = true;
                Ok(())
            }
            0x06 => {
                self.a20_enabled = false;
                Ok(())
            }
            0x07 => {
                ctx.set_ax(self.a20_enabled as u16);
                ctx.set_bl(0);
                return;
            }
            0x08 => {
                let (largest, total) = self.query_free();
                ctx.set_ax(largest);
                ctx.set_dx(total);
                ctx.set_bl(if total == 0 {
                    XmsError::AllExtendedMemoryAllocated as u8
                } else {
                    0
                });
                return;
            }
            0x09 => self.allocate(ctx.dx()).map(|handle| ctx.set_dx(handle)),
            0x0A => self.free(ctx.dx()),
            0x0B => {
                let params = FarPtr::new(ctx.ds, ctx.si()).linear();
                self.move_block(params, mem)
            }
            0x0C => self.lock(ctx.dx()).map(|addr| {
                ctx.set_dx((addr >> 16) as u16);
                ctx.set_bx(addr as u16);
            }),
            0x0D => self.unlock(ctx.dx()),
            0x0E => self.handle_info(ctx.dx()).map(|(locks, free_handles, size_kb)| {
                ctx.set_bh(locks);
                ctx.set_bl(free_handles);
                ctx.set_dx(size_kb);
            }),
            0x0F => self.reallocate(ctx.dx(), ctx.bx()),
            0x10 => match self.request_umb(ctx.dx()) {
                Ok((segment, paragraphs)) => {
                    ctx.set_bx(segment);
                    ctx.set_dx(paragraphs);
                    Ok(())
                }
                Err((err, largest)) => {
                    ctx.set_dx(largest);
                    Err(err)
                }
            },
            0x11 => self.release_umb(ctx.dx()),
            _ => {
                log(LogCategory::Stubs, LogLevel::Warn, || {
                    format!("unimplemented XMS function {:02X}h", function)
                });
                Err(XmsError::NotImplemented)
            }
        };

        match result {
            Ok(()) => ctx.set_ax(1),
            Err(err) => {
                log(LogCategory::Xms, LogLevel::Debug, || {
                    format!("XMS function {:02X}h failed: {:?}", function, err)
                });
                ctx.set_ax(0);
                ctx.set_bl(err as u8);
            }
        }
    }

    pub fn request_hma(&mut self, min_size: u16) -> Result<(), XmsError> {
        if self.hma_allocated {
            return Err(XmsError::HmaAlreadyInUse);
        }
        if min_size as u32 > HMA_SIZE {
            return Err(XmsError::HmaSizeTooSmall);
        }
        self.hma_allocated = true;
        Ok(())
    }

    pub fn release_hma(&mut self) -> Result<(), XmsError> {
        if !self.hma_allocated {
            return Err(XmsError::HmaNotAllocated);
        }
        self.hma_allocated = false;
        Ok(())
    }

    pub fn global_enable_a20(&mut self) {
        self.a20_global_count = self.a20_global_count.saturating_add(1);
        self.a20_enabled = true;
    }

    pub fn global_disable_a20(&mut self) {
        self.a20_global_count = self.a20_global_count.saturating_sub(1);
        if self.a20_global_count == 0 {
            self.a20_enabled = false;
        }
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    /// Largest free block and total free extended memory, in KB
    pub fn query_free(&self) -> (u16, u16) {
        let free = self.free_kb.min(0xFFFF) as u16;
        (free, free)
    }

    pub fn allocate(&mut self, size_kb: u16) -> Result<u16, XmsError> {
        if size_kb as u32 > self.free_kb {
            return Err(XmsError::AllExtendedMemoryAllocated);
        }
        if self.blocks.len() >= MAX_HANDLES {
            return Err(XmsError::AllHandlesInUse);
        }

        let handle = (1..=MAX_HANDLES as u16)
            .find(|handle| !self.blocks.contains_key(handle))
            .ok_or(XmsError::AllHandlesInUse)?;
        let used_kb = self.total_kb - self.free_kb;
        self.free_kb -= size_kb as u32;
        self.blocks.insert(
            handle,
            ExtendedMemoryBlock {
                lock_count: 0,
                linear_address: EMB_BASE_ADDRESS + used_kb * 1024,
                data: vec![0; size_kb as usize * 1024],
            },
        );
        log(LogCategory::Xms, LogLevel::Debug, || {
            format!("EMB {:04X}: {} KB", handle, size_kb)
        });
        Ok(handle)
    }

    pub fn free(&mut self, handle: u16) -> Result<(), XmsError> {
        let block = self.blocks.get(&handle).ok_or(XmsError::InvalidHandle)?;
        if block.lock_count > 0 {
            return Err(XmsError::BlockLocked);
        }
        self.free_kb += block.size_kb() as u32;
        self.blocks.remove(&handle);
        Ok(())
    }

    /// Function 0Bh: copy using the move structure at linear `params`
    ///
    /// | offset | size | field              |
    /// |--------|------|--------------------|
    /// | 00h    | 4    | length (even)      |
    /// | 04h    | 2    | source handle      |
    /// | 06h    | 4    | source offset      |
    /// | 0Ah    | 2    | destination handle |
    /// | 0Ch    | 4    | destination offset |
    pub fn move_block<M: GuestMemory + ?Sized>(
        &mut self,
        params: u32,
        mem: &mut M,
    ) -> Result<(), XmsError> {
        let length = mem.read_u32(params);
        let source = MoveEndpoint::new(mem.read_u16(params + 4), mem.read_u32(params + 6));
        let dest = MoveEndpoint::new(mem.read_u16(params + 0x0A), mem.read_u32(params + 0x0C));

        if length & 1 != 0 {
            return Err(XmsError::InvalidLength);
        }
        self.check_endpoint(
            source,
            length,
            XmsError::InvalidSourceHandle,
            XmsError::InvalidSourceOffset,
        )?;
        self.check_endpoint(
            dest,
            length,
            XmsError::InvalidDestHandle,
            XmsError::InvalidDestOffset,
        )?;

        let mut buffer = vec![0u8; length as usize];
        match source {
            MoveEndpoint::Conventional(addr) => mem.read_bytes(addr, &mut buffer),
            MoveEndpoint::Block { handle, offset } => {
                if let Some(block) = self.blocks.get(&handle) {
                    let start = offset as usize;
                    buffer.copy_from_slice(&block.data[start..start + length as usize]);
                }
            }
        }
        match dest {
            MoveEndpoint::Conventional(addr) => mem.write_bytes(addr, &buffer),
            MoveEndpoint::Block { handle, offset } => {
                if let Some(block) = self.blocks.get_mut(&handle) {
                    let start = offset as usize;
                    block.data[start..start + length as usize].copy_from_slice(&buffer);
                }
            }
        }
        Ok(())
    }

    fn check_endpoint(
        &self,
        endpoint: MoveEndpoint,
        length: u32,
        bad_handle: XmsError,
        bad_offset: XmsError,
    ) -> Result<(), XmsError> {
        match endpoint {
            MoveEndpoint::Conventional(addr) => {
                if addr as u64 + length as u64 > emu_core::memory::REAL_MODE_SPACE as u64 {
                    return Err(bad_offset);
                }
            }
            MoveEndpoint::Block { handle, offset } => {
                let block = self.blocks.get(&handle).ok_or(bad_handle)?;
                if offset as u64 + length as u64 > block.data.len() as u64 {
                    return Err(if offset as usize > block.data.len() {
                        bad_offset
                    } else {
                        XmsError::InvalidLength
                    });
                }
            }
        }
        Ok(())
    }

    pub fn lock(&mut self, handle: u16) -> Result<u32, XmsError> {
        let block = self
            .blocks
            .get_mut(&handle)
            .ok_or(XmsError::InvalidHandle)?;
        block.lock_count = block
            .lock_count
            .checked_add(1)
            .ok_or(XmsError::LockCountOverflow)?;
        Ok(block.linear_address)
    }

    pub fn unlock(&mut self, handle: u16) -> Result<(), XmsError> {
        let block = self
            .blocks
            .get_mut(&handle)
            .ok_or(XmsError::InvalidHandle)?;
        block.lock_count = block
            .lock_count
            .checked_sub(1)
            .ok_or(XmsError::BlockNotLocked)?;
        Ok(())
    }

    /// Lock count, free handle count and size in KB
    pub fn handle_info(&self, handle: u16) -> Result<(u8, u8, u16), XmsError> {
        let block = self.blocks.get(&handle).ok_or(XmsError::InvalidHandle)?;
        let free_handles = (MAX_HANDLES - self.blocks.len()) as u8;
        Ok((block.lock_count, free_handles, block.size_kb()))
    }

    pub fn reallocate(&mut self, handle: u16, size_kb: u16) -> Result<(), XmsError> {
        let block = self
            .blocks
            .get_mut(&handle)
            .ok_or(XmsError::InvalidHandle)?;
        if block.lock_count > 0 {
            return Err(XmsError::BlockLocked);
        }

        let old_kb = block.size_kb() as u32;
        let new_kb = size_kb as u32;
        if new_kb > old_kb {
            let extra = new_kb - old_kb;
            if extra > self.free_kb {
                return Err(XmsError::AllExtendedMemoryAllocated);
            }
            self.free_kb -= extra;
        } else {
            self.free_kb += old_kb - new_kb;
        }
        block.data.resize(size_kb as usize * 1024, 0);
        Ok(())
    }

    /// Returns the segment and size; on failure the error and the largest
    /// free UMB
    pub fn request_umb(&mut self, paragraphs: u16) -> Result<(u16, u16), (XmsError, u16)> {
        if let Some(umb) = self
            .umbs
            .iter_mut()
            .find(|umb| !umb.allocated && umb.paragraphs >= paragraphs)
        {
            umb.allocated = true;
            return Ok((umb.segment, umb.paragraphs));
        }

        let largest = self
            .umbs
            .iter()
            .filter(|umb| !umb.allocated)
            .map(|umb| umb.paragraphs)
            .max();
        match largest {
            Some(largest) => Err((XmsError::UmbSmallerThanRequested, largest)),
            None => Err((XmsError::NoUmbsAvailable, 0)),
        }
    }

    pub fn release_umb(&mut self, segment: u16) -> Result<(), XmsError> {
        match self
            .umbs
            .iter_mut()
            .find(|umb| umb.segment == segment && umb.allocated)
        {
            Some(umb) => {
                umb.allocated = false;
                Ok(())
            }
            None => Err(XmsError::InvalidUmbSegment),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::FlatMemory;

    fn call(xms: &mut XmsDriver, mem: &mut FlatMemory, ah: u8, dx: u16) -> NativeContext {
        let mut ctx = NativeContext::real_mode(0x2000, 0);
        ctx.set_ah(ah);
        ctx.set_dx(dx);
        xms.handle_entry(&mut ctx, mem);
        ctx
    }

    #[test]
    fn test_version() {
        let mut xms = XmsDriver::new(1024);
        let mut mem = FlatMemory::real_mode();
        let ctx = call(&mut xms, &mut mem, 0x00, 0);
        assert_eq!(ctx.ax(), 0x0200);
        assert_eq!(ctx.dx(), 1);
    }

    #[test]
    fn test_hma_allocation() {
        let mut xms = XmsDriver::new(1024);
        assert_eq!(xms.request_hma(0xFFFF), Err(XmsError::HmaSizeTooSmall));
        assert_eq!(xms.request_hma(0x1000), Ok(()));
        assert_eq!(xms.request_hma(0x1000), Err(XmsError::HmaAlreadyInUse));
        assert_eq!(xms.release_hma(), Ok(()));
        assert_eq!(xms.release_hma(), Err(XmsError::HmaNotAllocated));
    }

    #[test]
    fn test_a20_counting() {
        let mut xms = XmsDriver::new(1024);
        let mut mem = FlatMemory::real_mode();
        call(&mut xms, &mut mem, 0x03, 0);
        call(&mut xms, &mut mem, 0x03, 0);
        call(&mut xms, &mut mem, 0x04, 0);
        assert_eq!(call(&mut xms, &mut mem, 0x07, 0).ax(), 1);
        call(&mut xms, &mut mem, 0x04, 0);
        assert_eq!(call(&mut xms, &mut mem, 0x07, 0).ax(), 0);
    }

    #[test]
    fn test_allocate_and_free_through_entry() {
        let mut xms = XmsDriver::new(1024);
        let mut mem = FlatMemory::real_mode();

        let ctx = call(&mut xms, &mut mem, 0x09, 256);
        assert_eq!(ctx.ax(), 1);
        let handle = ctx.dx();

        let ctx = call(&mut xms, &mut mem, 0x08, 0);
        assert_eq!(ctx.ax(), 768);

        let ctx = call(&mut xms, &mut mem, 0x09, 1024);
        assert_eq!(ctx.ax(), 0);
        assert_eq!(ctx.bl(), XmsError::AllExtendedMemoryAllocated as u8);

        assert_eq!(call(&mut xms, &mut mem, 0x0A, handle).ax(), 1);
        let ctx = call(&mut xms, &mut mem, 0x0A, handle);
        assert_eq!(ctx.ax(), 0);
        assert_eq!(ctx.bl(), XmsError::InvalidHandle as u8);
    }

    #[test]
    fn test_lock_blocks_free() {
        let mut xms = XmsDriver::new(1024);
        let handle = xms.allocate(64).unwrap();
        let addr = xms.lock(handle).unwrap();
        assert_eq!(addr, EMB_BASE_ADDRESS);
        assert_eq!(xms.free(handle), Err(XmsError::BlockLocked));
        assert_eq!(xms.reallocate(handle, 128), Err(XmsError::BlockLocked));
        assert_eq!(xms.handle_info(handle), Ok((1, 127, 64)));
        xms.unlock(handle).unwrap();
        assert_eq!(xms.unlock(handle), Err(XmsError::BlockNotLocked));
        assert_eq!(xms.free(handle), Ok(()));
    }

    #[test]
    fn test_move_between_conventional_and_emb() {
        let mut xms = XmsDriver::new(1024);
        let mut mem = FlatMemory::real_mode();
        let handle = xms.allocate(4).unwrap();

        // Source text at 1000:0000, move structure at 2000:0000
        mem.write_bytes(0x10000, b"extended");
        let params = 0x20000;
        mem.write_u32(params, 8);
        mem.write_u16(params + 4, 0);
        mem.write_u32(params + 6, FarPtr::new(0x1000, 0).to_u32());
        mem.write_u16(params + 0x0A, handle);
        mem.write_u32(params + 0x0C, 16);

        let mut ctx = NativeContext::real_mode(0x2000, 0);
        ctx.set_ah(0x0B);
        ctx.ds = 0x2000;
        xms.handle_entry(&mut ctx, &mut mem);
        assert_eq!(ctx.ax(), 1);

        // And back to 3000:0000
        mem.write_u16(params + 4, handle);
        mem.write_u32(params + 6, 16);
        mem.write_u16(params + 0x0A, 0);
        mem.write_u32(params + 0x0C, FarPtr::new(0x3000, 0).to_u32());
        xms.move_block(params, &mut mem).unwrap();
        assert_eq!(mem.slice(0x30000, 8), Some(&b"extended"[..]));
    }

    #[test]
    fn test_move_validation() {
        let mut xms = XmsDriver::new(1024);
        let mut mem = FlatMemory::real_mode();
        let handle = xms.allocate(1).unwrap();
        let params = 0x20000;

        mem.write_u32(params, 3);
        assert_eq!(xms.move_block(params, &mut mem), Err(XmsError::InvalidLength));

        mem.write_u32(params, 2);
        mem.write_u16(params + 4, 0x55);
        assert_eq!(
            xms.move_block(params, &mut mem),
            Err(XmsError::InvalidSourceHandle)
        );

        mem.write_u16(params + 4, 0);
        mem.write_u16(params + 0x0A, handle);
        mem.write_u32(params + 0x0C, 4096);
        assert_eq!(
            xms.move_block(params, &mut mem),
            Err(XmsError::InvalidDestOffset)
        );
    }

    #[test]
    fn test_umbs() {
        let mut xms = XmsDriver::new(1024);
        assert_eq!(xms.request_umb(0x800), Ok((0xC000, 0x1000)));
        assert_eq!(
            xms.request_umb(0x2000),
            Err((XmsError::UmbSmallerThanRequested, 0x1000))
        );
        assert_eq!(xms.request_umb(0x1000), Ok((0xD000, 0x1000)));
        assert_eq!(xms.request_umb(1), Err((XmsError::NoUmbsAvailable, 0)));
        assert_eq!(xms.release_umb(0xC000), Ok(()));
        assert_eq!(xms.release_umb(0xC000), Err(XmsError::InvalidUmbSegment));
    }

    #[test]
    fn test_unknown_function() {
        let mut xms = XmsDriver::new(1024);
        let mut mem = FlatMemory::real_mode();
        let ctx = call(&mut xms, &mut mem, 0x42, 0);
        assert_eq!(ctx.ax(), 0);
        assert_eq!(ctx.bl(), 0x80);
    }
}
