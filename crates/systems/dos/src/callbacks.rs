//! Real-mode callbacks (0303h/0304h)
//!
//! A callback is a small trampoline in conventional memory: `int 31h`
//! followed by a short jump back to the `int`. Real-mode code calls it like
//! any far procedure; the trap lands in the extender, which recognises the
//! trampoline by its segment and hands control to the registered handler.
//! Handlers are either host closures or guest protected-mode procedures.

use crate::context::{eflags, NativeContext, RealModeCallRecord};
use crate::cpu::VirtualCpu;
use crate::dosmem::GuestBlockAllocator;
use crate::error::DpmiError;
use crate::ldt::segment_flags;
use crate::linear::HostVirtualMemory;
use crate::task::{DosTask, GuestView};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::{FarPtr, GuestMemory};
use std::collections::BTreeMap;
use std::fmt;

const OPCODE_INT: u8 = 0xCD;
const OPCODE_JMP_SHORT: u8 = 0xEB;
const DPMI_VECTOR: u8 = 0x31;

pub const TRAMPOLINE_LEN: u32 = 4;

/// `int 31h; jmp short <start>`
///
/// The jump displacement is relative to the end of the stub, so the code is
/// position-independent and needs no patching after it is copied.
pub const TRAMPOLINE_CODE: [u8; TRAMPOLINE_LEN as usize] = [
    OPCODE_INT,
    DPMI_VECTOR,
    OPCODE_JMP_SHORT,
    (-(TRAMPOLINE_LEN as i8)) as u8,
];

pub type InternalCallback = Box<dyn FnMut(&mut NativeContext)>;

/// Guest protected-mode procedure registered with 0303h
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestCallback {
    pub selector: u16,
    pub offset: u32,
    /// Where the real-mode call record is exchanged
    pub regs_selector: u16,
    pub regs_offset: u32,
}

pub enum CallbackHandler {
    Internal(InternalCallback),
    Guest(GuestCallback),
}

impl fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackHandler::Internal(_) => f.write_str("Internal"),
            CallbackHandler::Guest(guest) => f.debug_tuple("Guest").field(guest).finish(),
        }
    }
}

#[derive(Debug)]
pub struct Trampoline {
    pub address: FarPtr,
    block: u32,
    handler: CallbackHandler,
}

/// Live trampolines, keyed by segment
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    trampolines: BTreeMap<u16, Trampoline>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trampolines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trampolines.is_empty()
    }

    /// Whether `segment` belongs to a live trampoline
    pub fn contains(&self, segment: u16) -> bool {
        self.trampolines.contains_key(&segment)
    }

    pub fn addresses(&self) -> Vec<FarPtr> {
        self.trampolines.values().map(|t| t.address).collect()
    }

    pub fn get(&self, segment: u16) -> Option<&Trampoline> {
        self.trampolines.get(&segment)
    }

    /// Build a trampoline for `handler` and return its real-mode address
    pub fn allocate<A, M>(
        &mut self,
        handler: CallbackHandler,
        blocks: &mut A,
        mem: &mut M,
    ) -> Result<FarPtr, DpmiError>
    where
        A: GuestBlockAllocator + ?Sized,
        M: GuestMemory + ?Sized,
    {
        let (segment, block) = blocks
            .allocate_block(TRAMPOLINE_LEN)
            .ok_or(DpmiError::CallbackUnavailable)?;
        mem.write_bytes(block, &TRAMPOLINE_CODE);

        let address = FarPtr::new(segment, 0);
        log(LogCategory::Callbacks, LogLevel::Debug, || {
            format!("callback {} -> {:?}", address, handler)
        });
        self.trampolines.insert(
            segment,
            Trampoline {
                address,
                block,
                handler,
            },
        );
        Ok(address)
    }

    pub fn free<A>(&mut self, address: FarPtr, blocks: &mut A) -> Result<(), DpmiError>
    where
        A: GuestBlockAllocator + ?Sized,
    {
        match self.trampolines.get(&address.segment) {
            Some(trampoline) if trampoline.address == address => {}
            _ => return Err(DpmiError::InvalidCallbackAddress(address)),
        }
        if let Some(trampoline) = self.trampolines.remove(&address.segment) {
            blocks.free_block(trampoline.block);
        }
        log(LogCategory::Callbacks, LogLevel::Debug, || {
            format!("callback {} freed", address)
        });
        Ok(())
    }
}

impl<H: HostVirtualMemory> DosTask<H> {
    /// Register a host closure as a real-mode callback
    pub fn allocate_internal_callback<F>(&mut self, handler: F) -> Result<FarPtr, DpmiError>
    where
        F: FnMut(&mut NativeContext) + 'static,
    {
        self.callbacks.allocate(
            CallbackHandler::Internal(Box::new(handler)),
            &mut self.dosmem,
            &mut self.memory,
        )
    }

    pub fn free_internal_callback(&mut self, address: FarPtr) -> Result<(), DpmiError> {
        self.callbacks.free(address, &mut self.dosmem)
    }

    /// Run the handler behind the trampoline at `segment`
    ///
    /// `ctx` is the real-mode context that called the trampoline; on return
    /// it holds whatever real-mode state the handler left behind, including
    /// the CS:IP to continue at.
    pub fn invoke_callback(
        &mut self,
        segment: u16,
        ctx: &mut NativeContext,
        cpu: &mut dyn VirtualCpu,
    ) -> Result<(), DpmiError> {
        let guest = match self.callbacks.trampolines.get_mut(&segment) {
            None => return Err(DpmiError::InvalidCallbackAddress(FarPtr::new(segment, 0))),
            Some(trampoline) => match &mut trampoline.handler {
                CallbackHandler::Internal(handler) => {
                    log(LogCategory::Callbacks, LogLevel::Trace, || {
                        format!("internal callback {:04X}", segment)
                    });
                    handler(ctx);
                    return Ok(());
                }
                CallbackHandler::Guest(guest) => *guest,
            },
        };

        log(LogCategory::Callbacks, LogLevel::Debug, || {
            format!(
                "callback {:04X} -> {:04X}:{:08X}, regs at {:04X}:{:08X}",
                segment, guest.selector, guest.offset, guest.regs_selector, guest.regs_offset
            )
        });

        let mode = self.client_mode;
        let record_addr = self
            .ldt
            .linear(guest.regs_selector, mode.offset(guest.regs_offset))?;
        let mut mem = GuestView::new(&mut self.memory, self.linear.host_mut());
        RealModeCallRecord::from_native(ctx).write_to(&mut mem, record_addr);

        // Selector over the real-mode stack so the handler can reach its
        // arguments through DS:(E)SI
        let stack_alias = self
            .ldt
            .allocate_selector((ctx.ss as u32) << 4, 0xFFFF, segment_flags::DATA)
            .ok_or(DpmiError::DescriptorUnavailable)?;

        // SS:ESP stay the real-mode values; the VirtualCpu switches the
        // handler onto its protected-mode stack
        let mut pm = NativeContext {
            cs: guest.selector,
            eip: guest.offset,
            ds: stack_alias,
            esi: ctx.esp & 0xFFFF,
            es: guest.regs_selector,
            edi: guest.regs_offset,
            eflags: ctx.eflags & !eflags::VM,
            ..*ctx
        };
        let result = cpu.call_protected_mode(&mut pm, mode, &mut mem);
        self.ldt.free(stack_alias)?;
        result?;

        // The handler may hand back a different record in ES:(E)DI
        let returned = self.ldt.linear(pm.es, mode.offset(pm.edi))?;
        *ctx = RealModeCallRecord::read_from(&mem, returned).to_native();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dosmem::DosMemory;
    use emu_core::FlatMemory;

    #[test]
    fn test_trampoline_code_jumps_to_its_start() {
        assert_eq!(TRAMPOLINE_CODE, [0xCD, 0x31, 0xEB, 0xFC]);
    }

    #[test]
    fn test_allocate_writes_stub() {
        let mut registry = CallbackRegistry::new();
        let mut dosmem = DosMemory::new(0x1000, 0x2000);
        let mut mem = FlatMemory::real_mode();

        let address = registry
            .allocate(
                CallbackHandler::Internal(Box::new(|_| {})),
                &mut dosmem,
                &mut mem,
            )
            .unwrap();
        assert_eq!(address, FarPtr::new(0x1000, 0));
        assert!(registry.contains(0x1000));

        let mut stub = [0u8; 4];
        mem.read_bytes(address.linear(), &mut stub);
        assert_eq!(stub, TRAMPOLINE_CODE);
    }

    #[test]
    fn test_free_rejects_unknown_address() {
        let mut registry = CallbackRegistry::new();
        let mut dosmem = DosMemory::new(0x1000, 0x2000);
        let mut mem = FlatMemory::real_mode();
        let address = registry
            .allocate(
                CallbackHandler::Internal(Box::new(|_| {})),
                &mut dosmem,
                &mut mem,
            )
            .unwrap();

        let wrong = FarPtr::new(address.segment, 2);
        assert_eq!(
            registry.free(wrong, &mut dosmem),
            Err(DpmiError::InvalidCallbackAddress(wrong))
        );
        registry.free(address, &mut dosmem).unwrap();
        assert_eq!(
            registry.free(address, &mut dosmem),
            Err(DpmiError::InvalidCallbackAddress(address))
        );
        assert!(registry.is_empty());
        assert_eq!(dosmem.free_paragraphs(), 0x1000);
    }

    #[test]
    fn test_exhausted_arena() {
        let mut registry = CallbackRegistry::new();
        let mut dosmem = DosMemory::new(0x1000, 0x1001);
        let mut mem = FlatMemory::real_mode();
        registry
            .allocate(CallbackHandler::Internal(Box::new(|_| {})), &mut dosmem, &mut mem)
            .unwrap();
        assert_eq!(
            registry
                .allocate(CallbackHandler::Internal(Box::new(|_| {})), &mut dosmem, &mut mem)
                .unwrap_err(),
            DpmiError::CallbackUnavailable
        );
    }
}
