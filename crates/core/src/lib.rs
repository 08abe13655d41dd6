//! Core primitives shared by the DOS extender crates.

pub mod descriptor;
pub mod logging;
pub mod memory;

pub use memory::{FarPtr, FlatMemory, GuestMemory};
