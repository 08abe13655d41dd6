//! DOS task state
//!
//! [`DosTask`] owns everything one DPMI client sees: conventional memory,
//! the host linear address space, the LDT, interrupt tables, callbacks and
//! the host stubs through which real-mode code traps back into the
//! extender.

use crate::callbacks::CallbackRegistry;
use crate::config::DpmiConfig;
use crate::context::{ClientMode, NativeContext};
use crate::dosmem::{DosMemory, GuestBlockAllocator};
use crate::error::DpmiError;
use crate::ldt::{segment_flags, LocalDescriptorTable};
use crate::linear::{HostVirtualMemory, LinearAllocator, SimulatedHostMemory};
use crate::mode_switch::{ExecutionMode, ProtectedModeSession};
use crate::vectors::{self, InterruptTable};
use crate::xms::XmsDriver;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::{FarPtr, FlatMemory, GuestMemory};
use serde::Serialize;
use std::collections::HashMap;

/// `int 31h; retf`, shared by the real-mode stubs
const REAL_MODE_STUB: [u8; 3] = [0xCD, 0x31, 0xCB];

/// Offsets inside the protected-mode stub segment (`dpmi_sel`)
pub mod pm_stub {
    /// `int 31h`: raw mode switch entry
    pub const RAW_SWITCH: u16 = 0x08;
    /// `iret`
    pub const IRET16: u16 = 0x0A;
    /// `iretd`
    pub const IRET32: u16 = 0x0B;
    /// `retf`
    pub const RETF16: u16 = 0x0D;
    /// `retfd`
    pub const RETF32: u16 = 0x0E;
    pub const SIZE: u32 = 0x10;
}

fn pm_stub_code() -> [u8; pm_stub::SIZE as usize] {
    let mut code = [0u8; pm_stub::SIZE as usize];
    code[pm_stub::RAW_SWITCH as usize..][..2].copy_from_slice(&[0xCD, 0x31]);
    code[pm_stub::IRET16 as usize] = 0xCF;
    code[pm_stub::IRET32 as usize..][..2].copy_from_slice(&[0x66, 0xCF]);
    code[pm_stub::RETF16 as usize] = 0xCB;
    code[pm_stub::RETF32 as usize..][..2].copy_from_slice(&[0x66, 0xCB]);
    code
}

/// PSP size in paragraphs and the offset of its environment segment
const PSP_PARAGRAPHS: u16 = 0x10;
pub(crate) const PSP_ENVIRONMENT: u32 = 0x2C;

/// Segments and selectors of the host stubs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostSegments {
    /// Real-mode call wrapper; real-mode procedures return to `wrap_seg:0`
    pub wrap_seg: u16,
    /// Protected-mode entry returned by INT 2Fh AX=1687h
    pub dpmi_seg: u16,
    /// XMS driver entry returned by INT 2Fh AX=4310h
    pub xms_seg: u16,
    /// Real-mode segment of the protected-mode stubs
    pub pm_stub_seg: u16,
    /// Code selector over the protected-mode stubs
    pub dpmi_sel: u16,
}

/// Conventional memory block handed out by 0100h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DosBlockAllocation {
    pub segment: u16,
    pub selectors: u16,
}

/// Guest linear address space: conventional memory below the end of the
/// HMA, host linear blocks above it
pub struct GuestView<'a, H: HostVirtualMemory> {
    low: &'a mut FlatMemory,
    high: &'a mut H,
}

impl<'a, H: HostVirtualMemory> GuestView<'a, H> {
    pub fn new(low: &'a mut FlatMemory, high: &'a mut H) -> Self {
        Self { low, high }
    }
}

impl<H: HostVirtualMemory> GuestMemory for GuestView<'_, H> {
    fn read(&self, addr: u32) -> u8 {
        if self.low.contains(addr) {
            self.low.read(addr)
        } else {
            self.high.read(addr)
        }
    }

    fn write(&mut self, addr: u32, val: u8) {
        if self.low.contains(addr) {
            self.low.write(addr, val);
        } else {
            self.high.write(addr, val);
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskSnapshot<'a> {
    mode: ExecutionMode,
    client_mode: ClientMode,
    dpmi_flags: u16,
    segments: HostSegments,
    psp_segment: u16,
    selectors_in_use: usize,
    dos_blocks: Vec<(u16, DosBlockAllocation)>,
    callbacks: Vec<String>,
    linear_cursor: Option<u32>,
    linear_fallback_warnings: u32,
    linear_free_bytes: u32,
    conventional_free_paragraphs: u32,
    xms: crate::xms::XmsStatus,
    config: &'a DpmiConfig,
}

pub struct DosTask<H: HostVirtualMemory = SimulatedHostMemory> {
    pub(crate) config: DpmiConfig,
    pub(crate) memory: FlatMemory,
    pub(crate) linear: LinearAllocator<H>,
    pub(crate) dosmem: DosMemory,
    pub(crate) ldt: LocalDescriptorTable,
    pub(crate) interrupts: InterruptTable,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) xms: XmsDriver,
    pub(crate) segments: HostSegments,
    pub(crate) psp_segment: u16,
    pub(crate) mode: ExecutionMode,
    pub(crate) client_mode: ClientMode,
    /// AX at protected-mode entry; bit 0 selects a 32-bit client
    pub(crate) dpmi_flags: u16,
    pub(crate) session: Option<ProtectedModeSession>,
    /// Blocks from 0100h, keyed by their first selector
    pub(crate) dos_blocks: HashMap<u16, DosBlockAllocation>,
    /// Selectors returned by 0002h, keyed by segment
    pub(crate) segment_selectors: HashMap<u16, u16>,
}

impl DosTask<SimulatedHostMemory> {
    /// Task backed by an in-process simulated host address space
    pub fn new(config: DpmiConfig) -> Result<Self, DpmiError> {
        let host = SimulatedHostMemory::new(config.linear_base, config.linear_limit, config.page_size);
        Self::with_host(config, host)
    }
}

impl<H: HostVirtualMemory> DosTask<H> {
    pub fn with_host(config: DpmiConfig, host: H) -> Result<Self, DpmiError> {
        let mut memory = FlatMemory::real_mode();
        vectors::install_default_vectors(&mut memory);

        let mut dosmem = DosMemory::new(config.arena_start_segment, config.conventional_top_segment());
        let wrap_seg = Self::install_stub(&mut dosmem, &mut memory, &REAL_MODE_STUB)?;
        let dpmi_seg = Self::install_stub(&mut dosmem, &mut memory, &REAL_MODE_STUB)?;
        let xms_seg = Self::install_stub(&mut dosmem, &mut memory, &REAL_MODE_STUB)?;
        let pm_stub_seg = Self::install_stub(&mut dosmem, &mut memory, &pm_stub_code())?;

        let mut ldt = LocalDescriptorTable::new();
        let dpmi_sel = ldt
            .allocate_selector((pm_stub_seg as u32) << 4, pm_stub::SIZE - 1, segment_flags::CODE)
            .ok_or(DpmiError::DescriptorUnavailable)?;

        let psp_segment = dosmem
            .allocate(PSP_PARAGRAPHS)
            .map_err(|available_paragraphs| DpmiError::InsufficientMemory {
                available_paragraphs,
            })?;
        let psp = (psp_segment as u32) << 4;
        // int 20h, then the first paragraph past conventional memory
        memory.write_bytes(psp, &[0xCD, 0x20]);
        memory.write_u16(psp + 2, config.conventional_top_segment());

        let segments = HostSegments {
            wrap_seg,
            dpmi_seg,
            xms_seg,
            pm_stub_seg,
            dpmi_sel,
        };
        log(LogCategory::Dpmi, LogLevel::Info, || {
            format!(
                "task ready: wrapper {:04X}, entry {:04X}, XMS {:04X}, stubs {:04X} ({:04X}), PSP {:04X}",
                wrap_seg, dpmi_seg, xms_seg, pm_stub_seg, dpmi_sel, psp_segment
            )
        });

        Ok(Self {
            xms: XmsDriver::new(config.extended_kb),
            linear: LinearAllocator::new(host),
            config,
            memory,
            dosmem,
            ldt,
            interrupts: InterruptTable::new(),
            callbacks: CallbackRegistry::new(),
            segments,
            psp_segment,
            mode: ExecutionMode::RealMode,
            client_mode: ClientMode::Bits16,
            dpmi_flags: 0,
            session: None,
            dos_blocks: HashMap::new(),
            segment_selectors: HashMap::new(),
        })
    }

    fn install_stub(
        dosmem: &mut DosMemory,
        memory: &mut FlatMemory,
        code: &[u8],
    ) -> Result<u16, DpmiError> {
        let (segment, linear) = dosmem
            .allocate_block(code.len() as u32)
            .ok_or(DpmiError::InsufficientMemory {
                available_paragraphs: 0,
            })?;
        memory.write_bytes(linear, code);
        Ok(segment)
    }

    pub fn config(&self) -> &DpmiConfig {
        &self.config
    }

    pub fn segments(&self) -> HostSegments {
        self.segments
    }

    pub fn psp_segment(&self) -> u16 {
        self.psp_segment
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn client_mode(&self) -> ClientMode {
        self.client_mode
    }

    pub fn dpmi_flags(&self) -> u16 {
        self.dpmi_flags
    }

    pub fn ldt(&self) -> &LocalDescriptorTable {
        &self.ldt
    }

    pub fn dos_memory(&self) -> &DosMemory {
        &self.dosmem
    }

    pub fn linear(&self) -> &LinearAllocator<H> {
        &self.linear
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn interrupts(&self) -> &InterruptTable {
        &self.interrupts
    }

    pub fn xms(&self) -> &XmsDriver {
        &self.xms
    }

    /// Conventional memory (the first 1MB plus the HMA)
    pub fn conventional(&self) -> &FlatMemory {
        &self.memory
    }

    pub fn conventional_mut(&mut self) -> &mut FlatMemory {
        &mut self.memory
    }

    /// Whole guest address space
    pub fn guest_memory(&mut self) -> GuestView<'_, H> {
        GuestView::new(&mut self.memory, self.linear.host_mut())
    }

    /// Linear address of `segment:offset` as the context addresses memory:
    /// paragraphs in real mode, LDT selectors in protected mode
    pub fn linear_address(
        &self,
        ctx: &NativeContext,
        segment: u16,
        offset: u32,
    ) -> Result<u32, DpmiError> {
        if ctx.is_v86() {
            Ok(FarPtr::new(segment, offset as u16).linear())
        } else {
            self.ldt.linear(segment, self.client_mode.offset(offset))
        }
    }

    /// INT 2Fh multiplex services owned by the extender. Returns false when
    /// the call belongs to someone else.
    pub fn handle_int2f(&mut self, ctx: &mut NativeContext) -> bool {
        let function = ctx.ax();
        match function {
            0x1687 => {
                ctx.set_ax(0);
                // 32-bit clients supported
                ctx.set_bx(0x0001);
                ctx.set_cl(self.config.cpu_model.processor_level());
                ctx.set_dx(0x005A);
                // No private data paragraphs
                ctx.set_si(0);
                ctx.es = self.segments.dpmi_seg;
                ctx.set_di(0);
            }
            0x4300 => ctx.set_al(0x80),
            0x4310 => {
                ctx.es = self.segments.xms_seg;
                ctx.set_bx(0);
            }
            _ => return false,
        }
        log(LogCategory::Dpmi, LogLevel::Debug, || {
            format!("INT 2Fh AX={:04X} handled", function)
        });
        true
    }

    /// Serialize a summary of the task state to JSON
    pub fn save_state(&self) -> Result<String, serde_json::Error> {
        let mut dos_blocks: Vec<_> = self
            .dos_blocks
            .iter()
            .map(|(&selector, &block)| (selector, block))
            .collect();
        dos_blocks.sort_unstable_by_key(|&(selector, _)| selector);

        let snapshot = TaskSnapshot {
            mode: self.mode,
            client_mode: self.client_mode,
            dpmi_flags: self.dpmi_flags,
            segments: self.segments,
            psp_segment: self.psp_segment,
            selectors_in_use: self.ldt.in_use(),
            dos_blocks,
            callbacks: self
                .callbacks
                .addresses()
                .iter()
                .map(ToString::to_string)
                .collect(),
            linear_cursor: self.linear.cursor(),
            linear_fallback_warnings: self.linear.fallback_warnings(),
            linear_free_bytes: self.linear.host().free_bytes(),
            conventional_free_paragraphs: self.dosmem.free_paragraphs(),
            xms: self.xms.status(),
            config: &self.config,
        };
        serde_json::to_string_pretty(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DosTask {
        DosTask::new(DpmiConfig::default()).unwrap()
    }

    #[test]
    fn test_stubs_installed() {
        let task = task();
        let segments = task.segments();
        let wrap = FarPtr::new(segments.wrap_seg, 0).linear();
        assert_eq!(task.conventional().slice(wrap, 3), Some(&REAL_MODE_STUB[..]));

        let pm = FarPtr::new(segments.pm_stub_seg, 0).linear();
        assert_eq!(
            task.conventional().slice(pm + pm_stub::RAW_SWITCH as u32, 2),
            Some(&[0xCD, 0x31][..])
        );
        assert_eq!(task.ldt().base(segments.dpmi_sel), Ok(pm));
        assert!(task.ldt().descriptor(segments.dpmi_sel).unwrap().is_code_segment());
    }

    #[test]
    fn test_int2f_dpmi_detection() {
        let mut task = task();
        let mut ctx = NativeContext::real_mode(0x1000, 0);
        ctx.set_ax(0x1687);
        assert!(task.handle_int2f(&mut ctx));
        assert_eq!(ctx.ax(), 0);
        assert_eq!(ctx.bx(), 1);
        assert_eq!(ctx.cl(), 0x03);
        assert_eq!(ctx.dx(), 0x005A);
        assert_eq!(ctx.es, task.segments().dpmi_seg);
        assert_eq!(ctx.di(), 0);
    }

    #[test]
    fn test_int2f_xms_detection() {
        let mut task = task();
        let mut ctx = NativeContext::real_mode(0x1000, 0);
        ctx.set_ax(0x4300);
        assert!(task.handle_int2f(&mut ctx));
        assert_eq!(ctx.al(), 0x80);

        ctx.set_ax(0x4310);
        assert!(task.handle_int2f(&mut ctx));
        assert_eq!(ctx.es, task.segments().xms_seg);
        assert_eq!(ctx.bx(), 0);

        ctx.set_ax(0x1600);
        assert!(!task.handle_int2f(&mut ctx));
    }

    #[test]
    fn test_guest_view_routes_by_address() {
        let mut task = task();
        let block = task.linear.allocate(0x100).unwrap();
        let mut mem = task.guest_memory();
        mem.write_u16(0x500, 0x1234);
        mem.write_u16(block, 0xBEEF);
        assert_eq!(mem.read_u16(block), 0xBEEF);
        assert_eq!(task.conventional().read_u16(0x500), 0x1234);
        assert_eq!(task.linear().host().read_u16(block), 0xBEEF);
    }

    #[test]
    fn test_linear_address_modes() {
        let mut task = task();
        let rm = NativeContext::real_mode(0, 0);
        assert_eq!(task.linear_address(&rm, 0x1234, 0x0010), Ok(0x12350));

        let sel = task
            .ldt
            .allocate_selector(0x0040_0000, 0xFFFF, segment_flags::DATA)
            .unwrap();
        let pm = NativeContext::default();
        assert_eq!(task.linear_address(&pm, sel, 0x0001_0010), Ok(0x0040_0010));
        task.client_mode = ClientMode::Bits32;
        assert_eq!(task.linear_address(&pm, sel, 0x0001_0010), Ok(0x0041_0010));
        assert_eq!(
            task.linear_address(&pm, 0x0F, 0),
            Err(DpmiError::InvalidSelector(0x0F))
        );
    }

    #[test]
    fn test_save_state_is_json() {
        let task = task();
        let json = task.save_state().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["mode"], "RealMode");
        assert_eq!(value["selectors_in_use"], 1);
        assert_eq!(value["linear_fallback_warnings"], 0);
    }
}
