//! Interrupt vectors
//!
//! Real-mode vectors live in the guest's interrupt vector table at linear
//! 0:0000. Until something hooks them they point into the BIOS stub segment
//! at `F000:vector*4`, where an IRET sits; a real-mode call that lands there
//! is short-circuited to the host's interrupt emulation. Protected-mode
//! handlers and exception handlers are host-side tables.

use crate::error::DpmiError;
use emu_core::{FarPtr, GuestMemory};
use serde::Serialize;

/// Segment of the default real-mode interrupt stubs
pub const BIOS_STUB_SEGMENT: u16 = 0xF000;

const OPCODE_IRET: u8 = 0xCF;
const EXCEPTION_COUNT: usize = 32;

/// Default handler address for a real-mode vector
pub fn default_rm_vector(vector: u8) -> FarPtr {
    FarPtr::new(BIOS_STUB_SEGMENT, vector as u16 * 4)
}

/// Point every IVT entry at its BIOS stub and place the IRET stubs
pub fn install_default_vectors<M: GuestMemory + ?Sized>(mem: &mut M) {
    for vector in 0..=255u8 {
        let stub = default_rm_vector(vector);
        set_rm_vector(mem, vector, stub);
        mem.write(stub.linear(), OPCODE_IRET);
    }
}

pub fn rm_vector<M: GuestMemory + ?Sized>(mem: &M, vector: u8) -> FarPtr {
    let entry = vector as u32 * 4;
    FarPtr::new(mem.read_u16(entry + 2), mem.read_u16(entry))
}

pub fn set_rm_vector<M: GuestMemory + ?Sized>(mem: &mut M, vector: u8, handler: FarPtr) {
    let entry = vector as u32 * 4;
    mem.write_u16(entry, handler.offset);
    mem.write_u16(entry + 2, handler.segment);
}

/// Protected-mode far pointer (selector:offset32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PmHandler {
    pub selector: u16,
    pub offset: u32,
}

impl PmHandler {
    pub const fn new(selector: u16, offset: u32) -> Self {
        Self { selector, offset }
    }
}

/// Protected-mode interrupt and exception handler tables
#[derive(Debug, Clone)]
pub struct InterruptTable {
    handlers: Vec<PmHandler>,
    exceptions: [PmHandler; EXCEPTION_COUNT],
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptTable {
    pub fn new() -> Self {
        Self {
            handlers: vec![PmHandler::default(); 256],
            exceptions: [PmHandler::default(); EXCEPTION_COUNT],
        }
    }

    pub fn handler(&self, vector: u8) -> PmHandler {
        self.handlers[vector as usize]
    }

    pub fn set_handler(&mut self, vector: u8, handler: PmHandler) {
        self.handlers[vector as usize] = handler;
    }

    pub fn exception_handler(&self, exception: u8) -> Result<PmHandler, DpmiError> {
        self.exceptions
            .get(exception as usize)
            .copied()
            .ok_or(DpmiError::InvalidValue)
    }

    pub fn set_exception_handler(
        &mut self,
        exception: u8,
        handler: PmHandler,
    ) -> Result<(), DpmiError> {
        let slot = self
            .exceptions
            .get_mut(exception as usize)
            .ok_or(DpmiError::InvalidValue)?;
        *slot = handler;
        Ok(())
    }
}
