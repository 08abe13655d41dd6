//! Guest execution interface
//!
//! The extender does not execute guest instructions itself. Whoever owns the
//! CPU (an interpreter, or a host that runs guest code natively) implements
//! [`VirtualCpu`], and the extender calls it for every real-mode excursion
//! and every protected-mode callback.

use crate::context::{ClientMode, NativeContext};
use crate::error::DpmiError;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::{FarPtr, GuestMemory};

const OPCODE_IRET: u8 = 0xCF;

pub trait VirtualCpu {
    /// Run real-mode code starting at `ctx.cs:ctx.ip` until it executes
    /// `int 31h` inside a segment owned by the extender (the call wrapper or
    /// a callback trampoline).
    ///
    /// On return `ctx` holds the real-mode registers with CS:IP naming the
    /// trapping `int 31h` instruction. Interrupts raised by the guest along
    /// the way, and traps in segments the extender does not own, are the
    /// implementation's business. An error means the excursion cannot be
    /// resumed.
    fn enter_real_mode(
        &mut self,
        ctx: &mut NativeContext,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), DpmiError>;

    /// Emulate the BIOS/DOS service behind a real-mode interrupt vector
    /// that still points at its default stub
    fn real_mode_interrupt(&mut self, vector: u8, ctx: &mut NativeContext, mem: &mut dyn GuestMemory);

    /// Call protected-mode code at `ctx.cs:ctx.eip` and run it until its
    /// final far return (IRET for callbacks). `ctx` is updated with the
    /// registers it returned with.
    fn call_protected_mode(
        &mut self,
        ctx: &mut NativeContext,
        mode: ClientMode,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), DpmiError>;
}

/// Executor for hosts without an instruction interpreter
///
/// Real-mode code is taken to consist of its final return: entering real
/// mode pops the far return address off the stack (and FLAGS when the entry
/// byte is an `iret`), which brings calls straight back to the wrapper.
/// Host interrupts and protected-mode callbacks return without touching the
/// registers. Everything is recorded for inspection.
#[derive(Debug, Default)]
pub struct HeadlessCpu {
    pub real_mode_entries: Vec<FarPtr>,
    pub interrupts: Vec<u8>,
    pub protected_mode_calls: Vec<(u16, u32)>,
}

impl HeadlessCpu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VirtualCpu for HeadlessCpu {
    fn enter_real_mode(
        &mut self,
        ctx: &mut NativeContext,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), DpmiError> {
        let entry = FarPtr::new(ctx.cs, ctx.ip());
        self.real_mode_entries.push(entry);

        let stack = (ctx.ss as u32) << 4;
        let mut sp = ctx.sp();
        let mut pop = || {
            let val = mem.read_u16(stack + sp as u32);
            sp = sp.wrapping_add(2);
            val
        };
        let ip = pop();
        let cs = pop();
        let flags = if mem.read(entry.linear()) == OPCODE_IRET {
            Some(pop())
        } else {
            None
        };

        ctx.cs = cs;
        ctx.eip = ip as u32;
        if let Some(flags) = flags {
            ctx.eflags = (ctx.eflags & 0xFFFF_0000) | flags as u32;
        }
        ctx.set_sp(sp);
        log(LogCategory::ModeSwitch, LogLevel::Trace, || {
            format!("headless return from {} to {:04X}:{:04X}", entry, cs, ip)
        });
        Ok(())
    }

    fn real_mode_interrupt(&mut self, vector: u8, _ctx: &mut NativeContext, _mem: &mut dyn GuestMemory) {
        self.interrupts.push(vector);
    }

    fn call_protected_mode(
        &mut self,
        ctx: &mut NativeContext,
        _mode: ClientMode,
        _mem: &mut dyn GuestMemory,
    ) -> Result<(), DpmiError> {
        self.protected_mode_calls.push((ctx.cs, ctx.eip));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::FlatMemory;

    #[test]
    fn test_headless_far_return() {
        let mut mem = FlatMemory::real_mode();
        mem.write_u16(0x2000 + 0x100, 0x0000);
        mem.write_u16(0x2000 + 0x102, 0x1234);
        let mut ctx = NativeContext::real_mode(0x3000, 0x0010);
        ctx.ss = 0x0200;
        ctx.esp = 0x100;

        let mut cpu = HeadlessCpu::new();
        cpu.enter_real_mode(&mut ctx, &mut mem).unwrap();
        assert_eq!((ctx.cs, ctx.ip(), ctx.sp()), (0x1234, 0x0000, 0x104));
        assert_eq!(cpu.real_mode_entries, vec![FarPtr::new(0x3000, 0x0010)]);
    }

    #[test]
    fn test_headless_interrupt_return_pops_flags() {
        let mut mem = FlatMemory::real_mode();
        mem.write(0x30010, OPCODE_IRET);
        mem.write_u16(0x2100, 0x0004);
        mem.write_u16(0x2102, 0x1234);
        mem.write_u16(0x2104, 0x0001);
        let mut ctx = NativeContext::real_mode(0x3000, 0x0010);
        ctx.ss = 0x0200;
        ctx.esp = 0x100;

        let mut cpu = HeadlessCpu::new();
        cpu.enter_real_mode(&mut ctx, &mut mem).unwrap();
        assert_eq!((ctx.cs, ctx.ip(), ctx.sp()), (0x1234, 0x0004, 0x106));
        assert!(ctx.carry());
    }
}
