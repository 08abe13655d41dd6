//! DPMI error taxonomy
//!
//! Every failure a DPMI function can report maps onto one variant here. The
//! dispatcher turns non-fatal variants into the guest calling convention
//! (error word in AX, carry flag set); only [`DpmiError::SynchronizationLost`]
//! escapes to the host.

use emu_core::FarPtr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DpmiError {
    #[error("unsupported DPMI function {0:#06X}")]
    Unsupported(u16),
    #[error("descriptor unavailable")]
    DescriptorUnavailable,
    #[error("linear memory unavailable")]
    LinearMemoryUnavailable,
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid selector {0:#06X}")]
    InvalidSelector(u16),
    #[error("invalid memory handle {0:#010X}")]
    InvalidHandle(u32),
    #[error("no real-mode callback available")]
    CallbackUnavailable,
    #[error("invalid real-mode callback address {0}")]
    InvalidCallbackAddress(FarPtr),
    #[error("insufficient conventional memory ({available_paragraphs} paragraphs available)")]
    InsufficientMemory { available_paragraphs: u16 },
    #[error("invalid DOS memory block {0:#06X}")]
    MemoryBlockInvalid(u16),
    #[error("out of linear memory allocating {0} bytes")]
    OutOfMemory(u32),
    #[error("could not allocate a default real-mode stack")]
    DefaultStackUnavailable,
    #[error("real-mode call target is 0000:0000")]
    InvalidRealModeTarget,
    #[error("jump chain at {segment:04X}:{offset:04X} exceeds the hop limit")]
    DegenerateJumpChain { segment: u16, offset: u16 },
    #[error("real/protected mode synchronization lost")]
    SynchronizationLost,
}

impl DpmiError {
    /// Error word returned to the guest in AX, if the failure carries one
    pub fn code(&self) -> Option<u16> {
        match self {
            DpmiError::Unsupported(_) => Some(0x8001),
            DpmiError::DescriptorUnavailable => Some(0x8011),
            DpmiError::LinearMemoryUnavailable | DpmiError::OutOfMemory(_) => Some(0x8012),
            DpmiError::CallbackUnavailable => Some(0x8015),
            DpmiError::InvalidValue => Some(0x8021),
            DpmiError::InvalidSelector(_) => Some(0x8022),
            DpmiError::InvalidHandle(_) => Some(0x8023),
            DpmiError::InvalidCallbackAddress(_) => Some(0x8024),
            DpmiError::InsufficientMemory { .. } => Some(0x0008),
            DpmiError::MemoryBlockInvalid(_) => Some(0x0009),
            // Real-mode call failures only set carry
            DpmiError::DefaultStackUnavailable
            | DpmiError::InvalidRealModeTarget
            | DpmiError::DegenerateJumpChain { .. }
            | DpmiError::SynchronizationLost => None,
        }
    }

    /// Fatal errors cannot be reported to the guest; the task must end.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DpmiError::SynchronizationLost)
    }
}
