//! INT 31h service dispatcher
//!
//! Decodes AX into a DPMI function, validates its register arguments,
//! performs it against the task and encodes the outcome back into the
//! registers. Failures are reported the DPMI way: carry set, and an error
//! word in AX when the function defines one.

use crate::callbacks::{CallbackHandler, GuestCallback};
use crate::context::{NativeContext, RealModeCallRecord};
use crate::cpu::VirtualCpu;
use crate::error::DpmiError;
use crate::ldt::segment_flags;
use crate::linear::HostVirtualMemory;
use crate::task::{pm_stub, DosBlockAllocation, DosTask, GuestView};
use crate::vectors::{self, PmHandler, BIOS_STUB_SEGMENT};
use emu_core::descriptor::SegmentDescriptor;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::{FarPtr, GuestMemory};

/// DPMI 0.90
const DPMI_VERSION: u16 = 0x005A;
/// 32-bit host, no virtual memory, V86 reflection
const DPMI_VERSION_FLAGS: u16 = 0x0005;
/// Master/slave PIC base vectors
const PIC_BASES: u16 = 0x0102;
/// Selector increment for arrays of descriptors
const SELECTOR_INCREMENT: u16 = 8;
/// Real-mode stub offset of the `retf` in `wrap_seg`
const WRAPPER_RETF: u16 = 2;
/// Size of the 0500h free memory structure
const FREE_MEMORY_INFO_SIZE: usize = 0x30;

impl<H: HostVirtualMemory> DosTask<H> {
    /// Handle an `int 31h` trap
    ///
    /// `ctx` is the register state right after the `int 31h` instruction.
    /// Only fatal errors are returned; everything else is reported to the
    /// guest through its registers.
    pub fn handle_int31(
        &mut self,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<(), DpmiError> {
        match self.check_wrappers(ctx, cpu) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log(LogCategory::Dpmi, LogLevel::Error, || {
                    format!("wrapper call at {:04X}:{:04X} failed: {}", ctx.cs, ctx.ip(), err)
                });
                ctx.set_carry(true);
                return Ok(());
            }
        }

        ctx.set_carry(false);
        let function = ctx.ax();
        log(LogCategory::Dpmi, LogLevel::Trace, || {
            format!(
                "INT 31h AX={:04X} BX={:04X} CX={:04X} DX={:04X}",
                function,
                ctx.bx(),
                ctx.cx(),
                ctx.dx()
            )
        });

        match self.dispatch(function, ctx, cpu) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => {
                log(LogCategory::Dpmi, LogLevel::Error, || {
                    format!("function {:04X}: {}", function, err)
                });
                Err(err)
            }
            Err(err) => {
                log(LogCategory::Dpmi, LogLevel::Debug, || {
                    format!("function {:04X} failed: {}", function, err)
                });
                if let Some(code) = err.code() {
                    ctx.set_ax(code);
                }
                if let DpmiError::InsufficientMemory {
                    available_paragraphs,
                } = err
                {
                    ctx.set_bx(available_paragraphs);
                }
                ctx.set_carry(true);
                Ok(())
            }
        }
    }

    fn dispatch(
        &mut self,
        function: u16,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<(), DpmiError> {
        match function {
            0x0000 => self.allocate_descriptors(ctx),
            0x0001 => self.free_descriptor(ctx),
            0x0002 => self.segment_to_descriptor(ctx),
            0x0003 => {
                ctx.set_ax(SELECTOR_INCREMENT);
                Ok(())
            }
            0x0004 | 0x0005 => {
                self.acknowledge(function, "lock/unlock selector");
                ctx.eax = 0;
                Ok(())
            }
            0x0006 => self.get_segment_base(ctx),
            0x0007 => self.set_segment_base(ctx),
            0x0008 => self.set_segment_limit(ctx),
            0x0009 => self
                .ldt
                .set_access_rights(ctx.bx(), ctx.cl(), ctx.ch()),
            0x000A => {
                let alias = self.ldt.alias(ctx.bx())?;
                ctx.set_ax(alias);
                Ok(())
            }
            0x000B => self.get_descriptor(ctx),
            0x000C => self.set_descriptor(ctx),
            0x000D => self.ldt.allocate_specific(ctx.bx()),
            0x000E | 0x000F => {
                self.acknowledge(function, "multiple descriptors");
                Ok(())
            }
            0x0100 => self.allocate_dos_memory(ctx),
            0x0101 => self.free_dos_memory(ctx),
            0x0102 => self.resize_dos_memory(ctx),
            0x0200 => {
                let handler = vectors::rm_vector(&self.memory, ctx.bl());
                ctx.set_cx(handler.segment);
                ctx.set_dx(handler.offset);
                Ok(())
            }
            0x0201 => {
                let handler = FarPtr::new(ctx.cx(), ctx.dx());
                log(LogCategory::Dpmi, LogLevel::Debug, || {
                    format!("real-mode vector {:02X}h -> {}", ctx.bl(), handler)
                });
                vectors::set_rm_vector(&mut self.memory, ctx.bl(), handler);
                Ok(())
            }
            0x0202 => {
                let handler = self.interrupts.exception_handler(ctx.bl())?;
                self.return_pm_handler(ctx, handler);
                Ok(())
            }
            0x0203 => {
                let handler = self.pm_handler_from(ctx);
                self.interrupts.set_exception_handler(ctx.bl(), handler)
            }
            0x0204 => {
                let handler = self.interrupts.handler(ctx.bl());
                self.return_pm_handler(ctx, handler);
                Ok(())
            }
            0x0205 => {
                let handler = self.pm_handler_from(ctx);
                log(LogCategory::Dpmi, LogLevel::Debug, || {
                    format!(
                        "protected-mode vector {:02X}h -> {:04X}:{:08X}",
                        ctx.bl(),
                        handler.selector,
                        handler.offset
                    )
                });
                self.interrupts.set_handler(ctx.bl(), handler);
                Ok(())
            }
            0x0300 => self.simulate_real_mode_interrupt(ctx, cpu),
            0x0301 => self.call_real_mode(ctx, cpu, false),
            0x0302 => self.call_real_mode(ctx, cpu, true),
            0x0303 => self.allocate_real_mode_callback(ctx),
            0x0304 => {
                let address = FarPtr::new(ctx.cx(), ctx.dx());
                self.callbacks.free(address, &mut self.dosmem)
            }
            0x0305 => {
                self.acknowledge(function, "state save/restore");
                ctx.set_ax(0);
                ctx.set_bx(self.segments.wrap_seg);
                ctx.set_cx(WRAPPER_RETF);
                ctx.set_si(self.segments.dpmi_sel);
                self.set_offset_di(
                    ctx,
                    if self.client_mode.is_32bit() {
                        pm_stub::RETF32
                    } else {
                        pm_stub::RETF16
                    },
                );
                Ok(())
            }
            0x0306 => {
                ctx.set_bx(self.segments.wrap_seg);
                ctx.set_cx(0);
                ctx.set_si(self.segments.dpmi_sel);
                self.set_offset_di(ctx, pm_stub::RAW_SWITCH);
                Ok(())
            }
            0x0400 => {
                ctx.set_ax(DPMI_VERSION);
                ctx.set_bx(DPMI_VERSION_FLAGS);
                ctx.set_cl(self.config.cpu_model.processor_level());
                ctx.set_dx(PIC_BASES);
                Ok(())
            }
            0x0401 => {
                self.acknowledge(function, "capabilities");
                Ok(())
            }
            0x0500 => self.free_memory_information(ctx),
            0x0501 => {
                let size = join(ctx.bx(), ctx.cx());
                let addr = self.linear.allocate(size)?;
                return_linear_block(ctx, addr);
                Ok(())
            }
            0x0502 => self.linear.free(join(ctx.si(), ctx.di())),
            0x0503 => {
                let size = join(ctx.bx(), ctx.cx());
                let addr = self.linear.reallocate(join(ctx.si(), ctx.di()), size)?;
                return_linear_block(ctx, addr);
                Ok(())
            }
            0x0507 => {
                self.acknowledge(function, "page attributes");
                Ok(())
            }
            0x0600..=0x0603 => {
                self.acknowledge(function, "lock/unlock region");
                Ok(())
            }
            0x0604 => {
                let page = self.config.page_size;
                ctx.set_bx((page >> 16) as u16);
                ctx.set_cx(page as u16);
                Ok(())
            }
            0x0702 | 0x0703 => {
                self.acknowledge(function, "page discard");
                Ok(())
            }
            0x0800 => {
                self.acknowledge(function, "physical address mapping");
                Ok(())
            }
            _ => {
                log(LogCategory::Stubs, LogLevel::Warn, || {
                    format!("unsupported DPMI function {:04X}", function)
                });
                Err(DpmiError::Unsupported(function))
            }
        }
    }

    fn acknowledge(&self, function: u16, what: &str) {
        log(LogCategory::Stubs, LogLevel::Warn, || {
            format!("function {:04X} ({}) acknowledged, not implemented", function, what)
        });
    }

    /// Linear address of `selector:offset` with the client's offset width
    fn client_address(&self, selector: u16, offset: u32) -> Result<u32, DpmiError> {
        self.ldt.linear(selector, self.client_mode.offset(offset))
    }

    fn set_offset_di(&self, ctx: &mut NativeContext, offset: u16) {
        if self.client_mode.is_32bit() {
            ctx.edi = offset as u32;
        } else {
            ctx.set_di(offset);
        }
    }

    fn pm_handler_from(&self, ctx: &NativeContext) -> PmHandler {
        PmHandler::new(ctx.cx(), self.client_mode.offset(ctx.edx))
    }

    fn return_pm_handler(&self, ctx: &mut NativeContext, handler: PmHandler) {
        ctx.set_cx(handler.selector);
        if self.client_mode.is_32bit() {
            ctx.edx = handler.offset;
        } else {
            ctx.set_dx(handler.offset as u16);
        }
    }

    fn allocate_descriptors(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let selector = self
            .ldt
            .allocate_array(ctx.cx())
            .ok_or(DpmiError::DescriptorUnavailable)?;
        ctx.set_ax(selector);
        Ok(())
    }

    fn free_descriptor(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let selector = ctx.bx();
        if self.is_host_owned_selector(selector) {
            log(LogCategory::Dpmi, LogLevel::Warn, || {
                format!("refusing to free host-owned selector {:04X}", selector)
            });
            return Err(DpmiError::InvalidSelector(selector));
        }
        self.ldt.free(selector)?;
        self.segment_selectors.retain(|_, &mut cached| cached != selector);

        // Segment registers holding the freed selector become null
        for reg in [&mut ctx.ds, &mut ctx.es, &mut ctx.fs, &mut ctx.gs] {
            if (*reg ^ selector) & !3 == 0 {
                *reg = 0;
            }
        }
        Ok(())
    }

    /// Selectors released through other calls: the stub selector, those
    /// claimed at protected-mode entry, and 0100h block arrays
    fn is_host_owned_selector(&self, selector: u16) -> bool {
        let index = selector >> 3;
        index == self.segments.dpmi_sel >> 3
            || self
                .session
                .as_ref()
                .is_some_and(|session| session.selectors.iter().any(|&s| s >> 3 == index))
            || self.dos_blocks.iter().any(|(&first, block)| {
                let first = first >> 3;
                index >= first && index < first + block.selectors
            })
    }

    fn segment_to_descriptor(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let segment = ctx.bx();
        let selector = match self.segment_selectors.get(&segment) {
            Some(&selector) => selector,
            None => {
                let selector = self
                    .ldt
                    .allocate_selector((segment as u32) << 4, 0xFFFF, segment_flags::DATA)
                    .ok_or(DpmiError::DescriptorUnavailable)?;
                self.segment_selectors.insert(segment, selector);
                selector
            }
        };
        ctx.set_ax(selector);
        Ok(())
    }

    fn get_segment_base(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let base = self.ldt.base(ctx.bx())?;
        ctx.set_cx((base >> 16) as u16);
        ctx.set_dx(base as u16);
        Ok(())
    }

    fn set_segment_base(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let base = join(ctx.cx(), ctx.dx());
        log(LogCategory::Dpmi, LogLevel::Trace, || {
            format!("selector {:04X} base {:08X}", ctx.bx(), base)
        });
        self.ldt.set_base(ctx.bx(), base)
    }

    fn set_segment_limit(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        self.ldt.set_limit(ctx.bx(), join(ctx.cx(), ctx.dx()))
    }

    fn get_descriptor(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let descriptor = self.ldt.descriptor(ctx.bx())?;
        let addr = self.client_address(ctx.es, ctx.edi)?;
        let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        mem.write_bytes(addr, &descriptor.to_bytes());
        Ok(())
    }

    fn set_descriptor(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let addr = self.client_address(ctx.es, ctx.edi)?;
        let mut bytes = [0u8; 8];
        GuestView::new(&mut self.memory, self.linear.host_mut()).read_bytes(addr, &mut bytes);
        self.ldt
            .set_descriptor(ctx.bx(), SegmentDescriptor::from_bytes(&bytes))
    }

    /// 0100h: BX paragraphs -> AX segment, DX selector
    fn allocate_dos_memory(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let paragraphs = ctx.bx();
        let segment = self
            .dosmem
            .allocate(paragraphs)
            .map_err(|available_paragraphs| DpmiError::InsufficientMemory {
                available_paragraphs,
            })?;

        let count = selectors_for(paragraphs);
        let Some(selector) = self.ldt.allocate_array(count) else {
            self.dosmem.free(segment);
            return Err(DpmiError::DescriptorUnavailable);
        };
        self.map_dos_block(selector, segment, paragraphs, count)?;
        self.dos_blocks.insert(
            selector,
            DosBlockAllocation {
                segment,
                selectors: count,
            },
        );

        log(LogCategory::Memory, LogLevel::Debug, || {
            format!(
                "DOS block {:04X} ({:#X} paragraphs), selector {:04X}",
                segment, paragraphs, selector
            )
        });
        ctx.set_ax(segment);
        ctx.set_dx(selector);
        Ok(())
    }

    /// Point the block's selectors at consecutive 64KB windows; the first
    /// covers the whole block
    fn map_dos_block(
        &mut self,
        selector: u16,
        segment: u16,
        paragraphs: u16,
        count: u16,
    ) -> Result<(), DpmiError> {
        let base = (segment as u32) << 4;
        let size = paragraphs as u32 * 16;
        for i in 0..count {
            let sel = selector + i * SELECTOR_INCREMENT;
            let offset = i as u32 * 0x10000;
            let limit = if i == 0 {
                size - 1
            } else {
                (size - offset).min(0x10000) - 1
            };
            self.ldt.set_base(sel, base + offset)?;
            self.ldt.set_limit(sel, limit)?;
        }
        Ok(())
    }

    fn free_dos_memory(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let selector = ctx.dx();
        let block = self
            .dos_blocks
            .remove(&selector)
            .ok_or(DpmiError::MemoryBlockInvalid(selector))?;
        self.dosmem.free(block.segment);
        for i in 0..block.selectors {
            let _ = self.ldt.free(selector + i * SELECTOR_INCREMENT);
        }
        Ok(())
    }

    /// 0102h: resize in place; on failure BX holds the largest possible size
    fn resize_dos_memory(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let selector = ctx.dx();
        let paragraphs = ctx.bx();
        let block = *self
            .dos_blocks
            .get(&selector)
            .ok_or(DpmiError::MemoryBlockInvalid(selector))?;
        let old_paragraphs = self
            .dosmem
            .block(block.segment)
            .map(|b| b.paragraphs)
            .ok_or(DpmiError::MemoryBlockInvalid(selector))?;

        self.dosmem
            .resize(block.segment, paragraphs)
            .map_err(|max| match max {
                Some(available_paragraphs) => DpmiError::InsufficientMemory {
                    available_paragraphs,
                },
                None => DpmiError::MemoryBlockInvalid(selector),
            })?;

        let count = selectors_for(paragraphs);
        if !self.ldt.resize_array(selector, block.selectors, count) {
            // Undo; the old size fitted before
            let _ = self.dosmem.resize(block.segment, old_paragraphs);
            return Err(DpmiError::DescriptorUnavailable);
        }
        self.map_dos_block(selector, block.segment, paragraphs, count)?;
        self.dos_blocks.insert(
            selector,
            DosBlockAllocation {
                segment: block.segment,
                selectors: count,
            },
        );
        Ok(())
    }

    /// Word arguments the client left on its protected-mode stack
    fn client_stack_words(&mut self, ctx: &NativeContext, count: u16) -> Result<Vec<u16>, DpmiError> {
        let base = self.client_address(ctx.ss, ctx.esp)?;
        let mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        Ok((0..count as u32)
            .map(|i| mem.read_u16(base.wrapping_add(i * 2)))
            .collect())
    }

    /// 0300h: BL vector, CX stack words, ES:(E)DI call record
    fn simulate_real_mode_interrupt(
        &mut self,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<(), DpmiError> {
        let vector = ctx.bl();
        let record_addr = self.client_address(ctx.es, ctx.edi)?;
        let args = self.client_stack_words(ctx, ctx.cx())?;
        let mut rm = RealModeCallRecord::read_from(
            &GuestView::new(&mut self.memory, self.linear.host_mut()),
            record_addr,
        )
        .to_native();

        let handler = vectors::rm_vector(&self.memory, vector);
        log(LogCategory::Dpmi, LogLevel::Debug, || {
            format!("simulate real-mode INT {:02X}h via {}", vector, handler)
        });

        let outcome = if handler.segment == BIOS_STUB_SEGMENT {
            let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
            cpu.real_mode_interrupt(vector, &mut rm, &mut mem);
            Ok(())
        } else {
            rm.cs = handler.segment;
            rm.eip = handler.offset as u32;
            self.call_real_mode_procedure(&mut rm, &args, true, cpu)
        };

        let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        RealModeCallRecord::from_native(&rm).write_to(&mut mem, record_addr);
        outcome
    }

    /// 0301h/0302h: far call or interrupt-style call through the record's
    /// CS:IP
    fn call_real_mode(
        &mut self,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
        iret: bool,
    ) -> Result<(), DpmiError> {
        let record_addr = self.client_address(ctx.es, ctx.edi)?;
        let record = RealModeCallRecord::read_from(
            &GuestView::new(&mut self.memory, self.linear.host_mut()),
            record_addr,
        );
        if record.cs == 0 && record.ip == 0 {
            log(LogCategory::Dpmi, LogLevel::Warn, || {
                "real-mode call to 0000:0000 refused".to_string()
            });
            return Err(DpmiError::InvalidRealModeTarget);
        }

        let args = self.client_stack_words(ctx, ctx.cx())?;
        let mut rm = record.to_native();
        let outcome = self.call_real_mode_procedure(&mut rm, &args, iret, cpu);

        let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        RealModeCallRecord::from_native(&rm).write_to(&mut mem, record_addr);
        outcome
    }

    /// 0303h: DS:(E)SI procedure, ES:(E)DI call record -> CX:DX callback
    fn allocate_real_mode_callback(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let guest = GuestCallback {
            selector: ctx.ds,
            offset: self.client_mode.offset(ctx.esi),
            regs_selector: ctx.es,
            regs_offset: self.client_mode.offset(ctx.edi),
        };
        let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        let address =
            self.callbacks
                .allocate(CallbackHandler::Guest(guest), &mut self.dosmem, &mut mem)?;
        ctx.set_cx(address.segment);
        ctx.set_dx(address.offset);
        Ok(())
    }

    /// 0500h: fill the 30h-byte structure at ES:(E)DI
    fn free_memory_information(&mut self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let addr = self.client_address(ctx.es, ctx.edi)?;
        let host = self.linear.host();
        let page = host.page_size().max(1);
        let largest = host.largest_free_block();
        let fields = [
            largest,
            largest / page,
            largest / page,
            host.total_bytes() / page,
            host.total_bytes() / page,
            host.free_bytes() / page,
            host.total_bytes() / page,
            host.free_bytes() / page,
        ];

        let mut info = [0xFFu8; FREE_MEMORY_INFO_SIZE];
        for (i, value) in fields.iter().enumerate() {
            info[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        mem.write_bytes(addr, &info);
        Ok(())
    }
}

#[inline]
fn join(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// 0501h/0503h outputs: BX:CX linear address, SI:DI handle
fn return_linear_block(ctx: &mut NativeContext, addr: u32) {
    ctx.set_bx((addr >> 16) as u16);
    ctx.set_cx(addr as u16);
    ctx.set_si((addr >> 16) as u16);
    ctx.set_di(addr as u16);
}

/// Descriptors needed to cover a block of `paragraphs`, one per 64KB
fn selectors_for(paragraphs: u16) -> u16 {
    (paragraphs as u32).div_ceil(0x1000).max(1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DpmiConfig;
    use crate::cpu::HeadlessCpu;

    fn task() -> DosTask {
        DosTask::new(DpmiConfig::default()).unwrap()
    }

    fn call(task: &mut DosTask, ctx: &mut NativeContext) {
        let mut cpu = HeadlessCpu::default();
        task.handle_int31(ctx, &mut cpu).unwrap();
    }

    fn pm(ax: u16) -> NativeContext {
        let mut ctx = NativeContext::default();
        ctx.set_ax(ax);
        ctx
    }

    #[test]
    fn test_selector_increment() {
        let mut task = task();
        let mut ctx = pm(0x0003);
        call(&mut task, &mut ctx);
        assert_eq!(ctx.ax(), 8);
        assert!(!ctx.carry());
    }

    #[test]
    fn test_unsupported_function_only_touches_ax_and_carry() {
        let mut task = task();
        let mut ctx = pm(0x0E00);
        ctx.ebx = 0x1111_2222;
        ctx.edx = 0x3333_4444;
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x8001);
        assert_eq!(ctx.ebx, 0x1111_2222);
        assert_eq!(ctx.edx, 0x3333_4444);
    }

    #[test]
    fn test_free_descriptor_clears_segment_registers() {
        let mut task = task();
        let mut ctx = pm(0x0000);
        ctx.set_cx(1);
        call(&mut task, &mut ctx);
        let selector = ctx.ax();

        ctx.set_ax(0x0001);
        ctx.set_bx(selector);
        ctx.ds = selector;
        ctx.es = selector & !3;
        ctx.fs = 0x0F;
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());
        assert_eq!((ctx.ds, ctx.es, ctx.fs), (0, 0, 0x0F));

        ctx.set_ax(0x0001);
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x8022);
    }

    #[test]
    fn test_free_descriptor_refuses_host_selectors() {
        let mut task = task();
        let dpmi_sel = task.segments().dpmi_sel;
        let mut ctx = pm(0x0001);
        ctx.set_bx(dpmi_sel);
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x8022);
        assert!(task.ldt().is_allocated(dpmi_sel));

        // The stub selector is never handed out again
        let mut ctx = pm(0x0000);
        ctx.set_cx(1);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());
        assert_ne!(ctx.ax(), dpmi_sel);

        // Selectors of a 0100h block are released by 0101h only
        let mut ctx = pm(0x0100);
        ctx.set_bx(0x1800);
        call(&mut task, &mut ctx);
        let block = ctx.dx();
        for selector in [block, block + 8] {
            let mut free = pm(0x0001);
            free.set_bx(selector);
            call(&mut task, &mut free);
            assert!(free.carry());
            assert_eq!(free.ax(), 0x8022);
        }
        ctx.set_ax(0x0101);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());
        assert!(!task.ldt().is_allocated(block));
    }

    #[test]
    fn test_free_descriptor_refuses_entry_selectors() {
        let mut task = task();
        let mut ctx = NativeContext::real_mode(task.segments().dpmi_seg, 2);
        ctx.ss = 0x2000;
        ctx.ds = 0x2000;
        ctx.esp = 0x00FC;
        task.conventional_mut().write_u16(0x200FE, 0x3000);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());

        let stack = ctx.ss;
        let mut free = pm(0x0001);
        free.set_bx(stack);
        call(&mut task, &mut free);
        assert!(free.carry());
        assert_eq!(free.ax(), 0x8022);
        assert!(task.ldt().is_allocated(stack));
    }

    #[test]
    fn test_segment_to_descriptor_is_cached() {
        let mut task = task();
        let mut ctx = pm(0x0002);
        ctx.set_bx(0xB800);
        call(&mut task, &mut ctx);
        let first = ctx.ax();
        assert_eq!(task.ldt().base(first), Ok(0xB8000));

        ctx.set_ax(0x0002);
        call(&mut task, &mut ctx);
        assert_eq!(ctx.ax(), first);
    }

    #[test]
    fn test_version() {
        let mut task = task();
        let mut ctx = pm(0x0400);
        call(&mut task, &mut ctx);
        assert_eq!(ctx.ax(), 0x005A);
        assert_eq!(ctx.bx(), 0x0005);
        assert_eq!(ctx.cl(), 0x03);
        assert_eq!(ctx.dx(), 0x0102);
    }

    #[test]
    fn test_raw_switch_addresses() {
        let mut task = task();
        let mut ctx = pm(0x0306);
        call(&mut task, &mut ctx);
        let segments = task.segments();
        assert_eq!(ctx.bx(), segments.wrap_seg);
        assert_eq!(ctx.cx(), 0);
        assert_eq!(ctx.si(), segments.dpmi_sel);
        assert_eq!(ctx.di(), pm_stub::RAW_SWITCH);
    }

    #[test]
    fn test_state_save_addresses() {
        let mut task = task();
        let mut ctx = pm(0x0305);
        call(&mut task, &mut ctx);
        assert_eq!(ctx.ax(), 0);
        assert_eq!(ctx.bx(), task.segments().wrap_seg);
        assert_eq!(ctx.cx(), WRAPPER_RETF);
        assert_eq!(ctx.di(), pm_stub::RETF16);
    }

    #[test]
    fn test_real_mode_vectors() {
        let mut task = task();
        let mut ctx = pm(0x0200);
        ctx.set_bl(0x21);
        call(&mut task, &mut ctx);
        assert_eq!((ctx.cx(), ctx.dx()), (0xF000, 0x0084));

        ctx.set_ax(0x0201);
        ctx.set_cx(0x1234);
        ctx.set_dx(0x0010);
        call(&mut task, &mut ctx);
        ctx.set_ax(0x0200);
        ctx.set_cx(0);
        ctx.set_dx(0);
        call(&mut task, &mut ctx);
        assert_eq!((ctx.cx(), ctx.dx()), (0x1234, 0x0010));
    }

    #[test]
    fn test_exception_vector_range() {
        let mut task = task();
        let mut ctx = pm(0x0203);
        ctx.set_bl(0x0E);
        ctx.set_cx(0x0087);
        ctx.set_dx(0x0100);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());

        ctx.set_ax(0x0202);
        ctx.set_cx(0);
        ctx.set_dx(0);
        call(&mut task, &mut ctx);
        assert_eq!((ctx.cx(), ctx.dx()), (0x0087, 0x0100));

        ctx.set_ax(0x0202);
        ctx.set_bl(0x20);
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x8021);
    }

    #[test]
    fn test_page_size() {
        let mut task = task();
        let mut ctx = pm(0x0604);
        call(&mut task, &mut ctx);
        assert_eq!((ctx.bx(), ctx.cx()), (0, 0x1000));
    }

    #[test]
    fn test_dos_memory_failure_reports_largest_block() {
        let mut task = task();
        let mut ctx = pm(0x0100);
        ctx.set_bx(0xFFFF);
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x0008);
        assert_eq!(ctx.bx(), task.dos_memory().largest_free());
    }

    #[test]
    fn test_large_dos_block_gets_selector_array() {
        let mut task = task();
        let mut ctx = pm(0x0100);
        ctx.set_bx(0x1800);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());
        let segment = ctx.ax();
        let selector = ctx.dx();

        assert_eq!(task.ldt().base(selector), Ok((segment as u32) << 4));
        assert_eq!(task.ldt().limit(selector), Ok(0x17FFF));
        assert_eq!(
            task.ldt().base(selector + 8),
            Ok(((segment as u32) << 4) + 0x10000)
        );
        assert_eq!(task.ldt().limit(selector + 8), Ok(0x7FFF));
    }

    #[test]
    fn test_resize_dos_memory() {
        let mut task = task();
        let mut ctx = pm(0x0100);
        ctx.set_bx(0x10);
        call(&mut task, &mut ctx);
        let selector = ctx.dx();

        // Block right behind it
        let mut other = pm(0x0100);
        other.set_bx(0x10);
        call(&mut task, &mut other);

        ctx.set_ax(0x0102);
        ctx.set_bx(0x08);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());
        assert_eq!(task.ldt().limit(selector), Ok(0x7F));

        ctx.set_ax(0x0102);
        ctx.set_bx(0x20);
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x0008);
        assert_eq!(ctx.bx(), 0x10);

        ctx.set_ax(0x0102);
        ctx.set_dx(0x0F);
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x0009);
    }

    #[test]
    fn test_free_memory_information() {
        let mut task = task();
        let mut ctx = pm(0x0000);
        ctx.set_cx(1);
        call(&mut task, &mut ctx);
        let selector = ctx.ax();
        task.ldt.set_base(selector, 0x2000).unwrap();
        task.ldt.set_limit(selector, 0xFFFF).unwrap();

        ctx.set_ax(0x0500);
        ctx.es = selector;
        ctx.edi = 0;
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());

        let memory = task.conventional();
        let total = task.config().linear_limit - task.config().linear_base;
        assert_eq!(memory.read_u32(0x2000), total);
        assert_eq!(memory.read_u32(0x2000 + 0x0C), total / 4096);
        assert_eq!(memory.read_u32(0x2000 + 0x20), 0xFFFF_FFFF);
        assert_eq!(memory.read_u32(0x2000 + 0x2C), 0xFFFF_FFFF);
    }

    #[test]
    fn test_linear_memory_functions() {
        let mut task = task();
        let mut ctx = pm(0x0501);
        ctx.set_bx(0x0001);
        ctx.set_cx(0x0000);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());
        let addr = join(ctx.bx(), ctx.cx());
        assert_eq!(join(ctx.si(), ctx.di()), addr);

        ctx.set_ax(0x0503);
        ctx.set_bx(0x0000);
        ctx.set_cx(0x0100);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());
        assert_eq!(join(ctx.bx(), ctx.cx()), addr);

        ctx.set_ax(0x0502);
        call(&mut task, &mut ctx);
        assert!(!ctx.carry());

        ctx.set_ax(0x0502);
        call(&mut task, &mut ctx);
        assert!(ctx.carry());
        assert_eq!(ctx.ax(), 0x8023);
    }

    #[test]
    fn test_selectors_for() {
        assert_eq!(selectors_for(1), 1);
        assert_eq!(selectors_for(0x1000), 1);
        assert_eq!(selectors_for(0x1001), 2);
        assert_eq!(selectors_for(0xFFFF), 16);
    }
}
