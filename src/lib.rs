//! IJVM - an interpreter for the IJVM bytecode
//!
//! This library provides the machine, the binary loader, an assembler and
//! disassembler for program images, and a TUI debugger.

pub mod config;
pub mod debugger;
pub mod signal;
pub mod vm;

// Re-export commonly used types
pub use config::{GcMode, RuntimeConfig};
pub use vm::{Machine, Program, VmError};
