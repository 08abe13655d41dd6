//! DPMI host for a DOS task
//!
//! This crate implements the protected-mode side of a DOS extender: the
//! INT 31h services a DPMI 0.9 client calls, the descriptor table and
//! memory managers behind them, real-mode callbacks, and the switches
//! between real and protected mode. Guest instructions are executed by an
//! external [`VirtualCpu`]; the task only ever sees the register context at
//! a trap.

mod callbacks;
mod config;
mod context;
mod cpu;
mod dosmem;
mod error;
mod int31;
mod ldt;
mod linear;
mod mode_switch;
mod task;
mod vectors;
mod xms;

pub use callbacks::{CallbackHandler, CallbackRegistry, GuestCallback, TRAMPOLINE_CODE};
pub use config::{ConfigError, CpuModel, DpmiConfig};
pub use context::{eflags, ClientMode, NativeContext, RealModeCallRecord};
pub use cpu::{HeadlessCpu, VirtualCpu};
pub use dosmem::{DosBlock, DosMemory, GuestBlockAllocator};
pub use error::DpmiError;
pub use ldt::{segment_flags, selector_for, LocalDescriptorTable, FIRST_GENERAL_INDEX};
pub use linear::{HostVirtualMemory, LinearAllocator, SimulatedHostMemory, ALLOCATION_GRANULARITY};
pub use mode_switch::{ExecutionMode, ProtectedModeSession, DEFAULT_STACK_SIZE};
pub use task::{pm_stub, DosTask, GuestView, HostSegments};
pub use vectors::{PmHandler, BIOS_STUB_SEGMENT};
pub use xms::{XmsDriver, XmsError, XmsStatus};
