//! Real/protected mode transitions
//!
//! Real-mode procedure calls (0300h-0302h), the raw mode switch, the initial
//! switch into protected mode through the INT 2Fh AX=1687h entry, and the
//! wrapper checks that route traps from host stubs before INT 31h dispatch.

use crate::context::{eflags, ClientMode, NativeContext};
use crate::cpu::VirtualCpu;
use crate::dosmem::GuestBlockAllocator;
use crate::error::DpmiError;
use crate::ldt::segment_flags;
use crate::linear::HostVirtualMemory;
use crate::task::{pm_stub, DosTask, GuestView, PSP_ENVIRONMENT};
use crate::vectors::BIOS_STUB_SEGMENT;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::{FarPtr, GuestMemory};
use serde::Serialize;

const OPCODE_JMP_NEAR: u8 = 0xE9;
const OPCODE_JMP_FAR: u8 = 0xEA;
const OPCODE_JMP_SHORT: u8 = 0xEB;

/// Stack handed to real-mode calls made with SS=0
pub const DEFAULT_STACK_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionMode {
    ProtectedMode,
    /// Building the real-mode frame for a call
    TransitioningToReal,
    RealMode,
}

struct EntrySelectors {
    cs: u16,
    ss: u16,
    ds: u16,
    /// PSP
    es: u16,
    env: Option<u16>,
}

/// Resources claimed when the client entered protected mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedModeSession {
    pub selectors: Vec<u16>,
    /// Environment segment the PSP held before it was replaced by a selector
    pub environment_segment: Option<u16>,
}

impl<H: HostVirtualMemory> DosTask<H> {
    /// Follow unconditional jumps at CS:IP so the call lands on real code
    pub(crate) fn resolve_jump_chain(&self, ctx: &mut NativeContext) -> Result<(), DpmiError> {
        let mut hops = 0;
        loop {
            let at = FarPtr::new(ctx.cs, ctx.ip()).linear();
            match self.memory.read(at) {
                OPCODE_JMP_NEAR => {
                    let rel = self.memory.read_u16(at + 1);
                    ctx.eip = ctx.ip().wrapping_add(3).wrapping_add(rel) as u32;
                }
                OPCODE_JMP_FAR => {
                    ctx.eip = self.memory.read_u16(at + 1) as u32;
                    ctx.cs = self.memory.read_u16(at + 3);
                }
                OPCODE_JMP_SHORT => {
                    let rel = self.memory.read(at + 1) as i8;
                    ctx.eip = ctx.ip().wrapping_add(2).wrapping_add(rel as i16 as u16) as u32;
                }
                _ => return Ok(()),
            }

            hops += 1;
            if hops > self.config.max_jump_chain {
                log(LogCategory::ModeSwitch, LogLevel::Error, || {
                    format!("jump chain did not terminate at {:04X}:{:04X}", ctx.cs, ctx.ip())
                });
                return Err(DpmiError::DegenerateJumpChain {
                    segment: ctx.cs,
                    offset: ctx.ip(),
                });
            }
        }
    }

    /// Call the real-mode procedure at `ctx.cs:ctx.ip` and return when it
    /// comes back to the wrapper
    ///
    /// `stack_args` are copied onto the real-mode stack in order; with
    /// `iret` the call is made as an interrupt (FLAGS pushed first).
    pub fn call_real_mode_procedure(
        &mut self,
        ctx: &mut NativeContext,
        stack_args: &[u16],
        iret: bool,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<(), DpmiError> {
        log(LogCategory::ModeSwitch, LogLevel::Debug, || {
            format!(
                "real-mode {} {:04X}:{:04X}, {} stack word(s)",
                if iret { "interrupt" } else { "call" },
                ctx.cs,
                ctx.ip(),
                stack_args.len()
            )
        });

        let previous = self.mode;
        let mut default_stack = None;
        let result = self.run_real_mode_call(ctx, stack_args, iret, cpu, &mut default_stack);
        if let Some(block) = default_stack {
            self.dosmem.free_block(block);
        }
        self.mode = previous;

        if let Err(err) = &result {
            let level = if err.is_fatal() {
                LogLevel::Error
            } else {
                LogLevel::Warn
            };
            log(LogCategory::ModeSwitch, level, || format!("real-mode call failed: {}", err));
        }
        result
    }

    fn run_real_mode_call(
        &mut self,
        ctx: &mut NativeContext,
        stack_args: &[u16],
        iret: bool,
        cpu: &mut dyn VirtualCpu,
        default_stack: &mut Option<u32>,
    ) -> Result<(), DpmiError> {
        let mut frame_built = false;
        loop {
            self.resolve_jump_chain(ctx)?;

            // Default BIOS vector: let the host emulate the interrupt
            if ctx.cs == BIOS_STUB_SEGMENT && iret {
                let vector = (ctx.ip() / 4) as u8;
                log(LogCategory::ModeSwitch, LogLevel::Trace, || {
                    format!("INT {:02X}h handled by the host", vector)
                });
                let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
                cpu.real_mode_interrupt(vector, ctx, &mut mem);
                return Ok(());
            }

            if !frame_built {
                self.mode = ExecutionMode::TransitioningToReal;
                *default_stack = self.push_call_frame(ctx, stack_args, iret)?;
                frame_built = true;
            }

            self.mode = ExecutionMode::RealMode;
            if !self.run_host_stub(ctx, cpu)? {
                let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
                cpu.enter_real_mode(ctx, &mut mem)?;
            }

            if self.is_wrapper_return(ctx) {
                return Ok(());
            }
            log(LogCategory::ModeSwitch, LogLevel::Trace, || {
                format!("real-mode call continues at {:04X}:{:04X}", ctx.cs, ctx.ip())
            });
        }
    }

    fn is_wrapper_return(&self, ctx: &NativeContext) -> bool {
        ctx.cs == self.segments.wrap_seg && ctx.ip() == 0
    }

    /// Service the host stub about to run at CS:IP in place of real-mode
    /// execution. Returns false when CS:IP is guest code.
    ///
    /// Callback handlers leave CS:IP wherever real mode continues. The
    /// other stubs are `int 31h; retf`: the trap is stepped over so the
    /// next excursion runs the stub's far return.
    fn run_host_stub(
        &mut self,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<bool, DpmiError> {
        if self.callbacks.contains(ctx.cs) {
            self.invoke_callback(ctx.cs, ctx, cpu)?;
            return Ok(true);
        }
        if ctx.ip() != 0 {
            return Ok(false);
        }
        if ctx.cs == self.segments.xms_seg {
            ctx.eip = 2;
            self.xms.handle_entry(ctx, &mut self.memory);
            Ok(true)
        } else if ctx.cs == self.segments.dpmi_seg {
            // Protected mode is entered once, from the client's own real mode
            ctx.eip = 2;
            log(LogCategory::ModeSwitch, LogLevel::Warn, || {
                "protected-mode entry called during a real-mode excursion".to_string()
            });
            ctx.set_carry(true);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Copy arguments, FLAGS (for interrupts) and the wrapper return address
    /// onto the real-mode stack. Returns the default stack block, if one had
    /// to be allocated.
    fn push_call_frame(
        &mut self,
        ctx: &mut NativeContext,
        stack_args: &[u16],
        iret: bool,
    ) -> Result<Option<u32>, DpmiError> {
        let mut allocated = None;
        if ctx.ss == 0 {
            let (segment, block) = self
                .dosmem
                .allocate_block(DEFAULT_STACK_SIZE)
                .ok_or(DpmiError::DefaultStackUnavailable)?;
            ctx.ss = segment;
            ctx.esp = DEFAULT_STACK_SIZE - 2;
            allocated = Some(block);
        }

        let base = (ctx.ss as u32) << 4;
        let mut sp = ctx.sp().wrapping_sub((stack_args.len() * 2) as u16);
        for (i, &word) in stack_args.iter().enumerate() {
            self.memory
                .write_u16(base + sp.wrapping_add((i * 2) as u16) as u32, word);
        }

        let wrap_seg = self.segments.wrap_seg;
        let memory = &mut self.memory;
        let mut push = |val: u16| {
            sp = sp.wrapping_sub(2);
            memory.write_u16(base + sp as u32, val);
        };
        if iret {
            push(ctx.eflags as u16);
        }
        push(wrap_seg);
        push(0);

        ctx.esp = sp as u32;
        Ok(allocated)
    }

    /// Raw switch from protected to real mode and back
    ///
    /// The protected-mode registers describe the real-mode target: DS=AX,
    /// ES=CX, SS=DX, ESP=EBX, CS=SI, EIP=EDI. When real-mode code raw
    /// switches back through `wrap_seg:0` its registers describe the
    /// protected-mode destination the same way. Callbacks and XMS calls
    /// made in between are serviced on the way.
    pub fn raw_mode_switch(
        &mut self,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<(), DpmiError> {
        let mut rm = NativeContext {
            ds: ctx.ax(),
            es: ctx.cx(),
            ss: ctx.dx(),
            esp: ctx.ebx,
            cs: ctx.si(),
            eip: ctx.edi,
            ebp: ctx.ebp,
            fs: 0,
            gs: 0,
            eflags: ctx.eflags | eflags::VM,
            ..NativeContext::default()
        };
        log(LogCategory::ModeSwitch, LogLevel::Debug, || {
            format!(
                "raw switch to real mode {:04X}:{:04X}, stack {:04X}:{:04X}",
                rm.cs,
                rm.ip(),
                rm.ss,
                rm.sp()
            )
        });

        self.mode = ExecutionMode::RealMode;
        loop {
            if !self.run_host_stub(&mut rm, cpu)? {
                let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
                if let Err(err) = cpu.enter_real_mode(&mut rm, &mut mem) {
                    log(LogCategory::ModeSwitch, LogLevel::Error, || {
                        format!("sync lost during raw mode switch: {}", err)
                    });
                    return Err(DpmiError::SynchronizationLost);
                }
            }
            if self.is_wrapper_return(&rm) {
                break;
            }
            log(LogCategory::ModeSwitch, LogLevel::Trace, || {
                format!("raw switch continues at {:04X}:{:04X}", rm.cs, rm.ip())
            });
        }

        ctx.ds = rm.ax();
        ctx.es = rm.cx();
        ctx.ss = rm.dx();
        ctx.esp = rm.ebx;
        ctx.cs = rm.si();
        ctx.eip = rm.edi;
        ctx.ebp = rm.ebp;
        ctx.fs = 0;
        ctx.gs = 0;
        self.mode = ExecutionMode::ProtectedMode;

        log(LogCategory::ModeSwitch, LogLevel::Debug, || {
            format!("raw switch back to {:04X}:{:08X}", ctx.cs, ctx.eip)
        });
        Ok(())
    }

    /// Raw switch entered through `dpmi_sel`: after the round trip, resume
    /// at the new protected-mode CS:EIP through the stub's IRET, with the
    /// interrupt return record on the new stack
    pub(crate) fn raw_mode_switch_wrapper(
        &mut self,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<(), DpmiError> {
        self.raw_mode_switch(ctx, cpu)?;

        let big = self.client_mode.is_32bit();
        let frame_size = if big { 12 } else { 6 };
        let esp = self.client_mode.offset(ctx.esp.wrapping_sub(frame_size));
        let frame = self.ldt.linear(ctx.ss, esp)?;
        let flags = ctx.eflags & !eflags::VM;

        let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        if big {
            mem.write_u32(frame, ctx.eip);
            mem.write_u32(frame + 4, ctx.cs as u32);
            mem.write_u32(frame + 8, flags);
            ctx.esp = esp;
            ctx.eip = pm_stub::IRET32 as u32;
        } else {
            mem.write_u16(frame, ctx.ip());
            mem.write_u16(frame + 2, ctx.cs);
            mem.write_u16(frame + 4, flags as u16);
            ctx.set_sp(esp as u16);
            ctx.eip = pm_stub::IRET16 as u32;
        }
        ctx.cs = self.segments.dpmi_sel;
        ctx.eflags = flags;
        Ok(())
    }

    /// Enter protected mode from the INT 2Fh AX=1687h entry point
    ///
    /// `ctx` is the real-mode context trapped at `dpmi_seg`; the caller's far
    /// return address is on its stack. On success `ctx` becomes the
    /// protected-mode context, positioned on the stub's far return so the
    /// client resumes after its call with selectors in every segment
    /// register. On failure carry is set and the client stays in real mode.
    pub(crate) fn start_protected_mode(&mut self, ctx: &mut NativeContext) {
        if self.session.is_some() {
            log(LogCategory::ModeSwitch, LogLevel::Warn, || {
                "client is already in protected mode".to_string()
            });
            ctx.set_carry(true);
            return;
        }

        let client_mode = if ctx.ax() & 1 != 0 {
            ClientMode::Bits32
        } else {
            ClientMode::Bits16
        };
        let data_flags = if client_mode.is_32bit() {
            segment_flags::DATA | segment_flags::BIG
        } else {
            segment_flags::DATA
        };

        let stack = FarPtr::new(ctx.ss, ctx.sp()).linear();
        let return_ip = self.memory.read_u16(stack);
        let return_cs = self.memory.read_u16(stack + 2);
        let psp = (self.psp_segment as u32) << 4;
        let env_segment = self.memory.read_u16(psp + PSP_ENVIRONMENT);

        let mut selectors = Vec::new();
        let Some(entry) =
            self.allocate_entry_selectors(ctx, return_cs, env_segment, data_flags, &mut selectors)
        else {
            for &selector in &selectors {
                let _ = self.ldt.free(selector);
            }
            log(LogCategory::ModeSwitch, LogLevel::Error, || {
                "out of descriptors entering protected mode".to_string()
            });
            ctx.set_carry(true);
            return;
        };
        let EntrySelectors { cs, ss, ds, es, env } = entry;

        if let Some(env) = env {
            self.memory.write_u16(psp + PSP_ENVIRONMENT, env);
        }

        // The stub's far return pops the caller's IP and the new CS
        let mut sp = ctx.sp();
        if client_mode.is_32bit() {
            sp = sp.wrapping_sub(4);
            let base = (ctx.ss as u32) << 4;
            self.memory.write_u32(base + sp as u32, return_ip as u32);
            self.memory.write_u32(base + sp as u32 + 4, cs as u32);
        } else {
            self.memory.write_u16(stack + 2, cs);
        }

        ctx.cs = self.segments.dpmi_sel;
        ctx.eip = if client_mode.is_32bit() {
            pm_stub::RETF32 as u32
        } else {
            pm_stub::RETF16 as u32
        };
        ctx.ss = ss;
        ctx.esp = sp as u32;
        ctx.ds = ds;
        ctx.es = es;
        ctx.fs = 0;
        ctx.gs = 0;
        ctx.eflags &= !eflags::VM;
        ctx.set_carry(false);

        self.client_mode = client_mode;
        self.dpmi_flags = ctx.ax();
        self.mode = ExecutionMode::ProtectedMode;
        self.session = Some(ProtectedModeSession {
            selectors,
            environment_segment: env.map(|_| env_segment),
        });

        log(LogCategory::ModeSwitch, LogLevel::Info, || {
            format!(
                "entered {}-bit protected mode: CS={:04X} SS={:04X} DS={:04X} ES={:04X}",
                if client_mode.is_32bit() { 32 } else { 16 },
                cs,
                ss,
                ds,
                es
            )
        });
    }

    fn allocate_entry_selectors(
        &mut self,
        ctx: &NativeContext,
        return_cs: u16,
        env_segment: u16,
        data_flags: u8,
        selectors: &mut Vec<u16>,
    ) -> Option<EntrySelectors> {
        let psp = (self.psp_segment as u32) << 4;
        let mut alias = |base: u32, limit: u32, flags: u8| -> Option<u16> {
            let selector = self.ldt.allocate_selector(base, limit, flags)?;
            selectors.push(selector);
            Some(selector)
        };

        let cs = alias((return_cs as u32) << 4, 0xFFFF, segment_flags::CODE)?;
        let ss = alias((ctx.ss as u32) << 4, 0xFFFF, data_flags)?;
        let ds = if ctx.ds == ctx.ss {
            ss
        } else {
            alias((ctx.ds as u32) << 4, 0xFFFF, data_flags)?
        };
        let es = alias(psp, 0xFF, data_flags)?;
        let env = if env_segment != 0 {
            Some(alias((env_segment as u32) << 4, 0xFFFF, segment_flags::DATA)?)
        } else {
            None
        };
        Some(EntrySelectors { cs, ss, ds, es, env })
    }

    /// Release the selectors claimed at protected-mode entry and return the
    /// task to real mode
    pub fn terminate_client(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(segment) = session.environment_segment {
            let psp = (self.psp_segment as u32) << 4;
            self.memory.write_u16(psp + PSP_ENVIRONMENT, segment);
        }
        for selector in session.selectors {
            let _ = self.ldt.free(selector);
        }
        self.mode = ExecutionMode::RealMode;
        self.client_mode = ClientMode::Bits16;
        log(LogCategory::ModeSwitch, LogLevel::Info, || {
            "client left protected mode".to_string()
        });
    }

    /// Route traps from host stubs. Returns true when the trap was a wrapper
    /// call rather than an INT 31h service request.
    pub fn check_wrappers(
        &mut self,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<bool, DpmiError> {
        if !ctx.is_v86() {
            if ctx.cs == self.segments.dpmi_sel {
                self.raw_mode_switch_wrapper(ctx, cpu)?;
                return Ok(true);
            }
            return Ok(false);
        }

        if ctx.cs == self.segments.dpmi_seg {
            self.start_protected_mode(ctx);
            Ok(true)
        } else if ctx.cs == self.segments.xms_seg {
            self.xms.handle_entry(ctx, &mut self.memory);
            Ok(true)
        } else if self.callbacks.contains(ctx.cs) {
            self.invoke_callback(ctx.cs, ctx, cpu)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
