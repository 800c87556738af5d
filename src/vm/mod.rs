pub mod asm;
pub mod bytecode;
pub mod cpu;
pub mod dump;
mod error;
pub mod heap;
mod io;
pub mod net;
mod ops;
pub mod slots;
mod vm;

/// Machine word: a 32-bit two's-complement integer.
pub type Word = i32;
/// Instruction byte.
pub type Byte = u8;

pub use asm::{AsmError, Assembler};
pub use bytecode::{BytecodeError, Program};
pub use cpu::{FrameInfo, Registers};
pub use error::VmError;
pub use heap::{ArrayHeap, GcStats, HeapError};
pub use io::SharedOutput;
pub use net::{ConnectionTable, NetError};
pub use ops::Opcode;
pub use slots::RefTag;
pub use vm::{Machine, MachineStats};
