use thiserror::Error;

use super::bytecode::BytecodeError;
use super::heap::HeapError;
use super::net::NetError;

/// Fatal machine conditions.
///
/// Once one of these is recorded the machine stops: `finished()` turns true
/// and further `step()` calls do nothing.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid opcode 0x{byte:02X} at 0x{pc:04X}")]
    InvalidOpcode { pc: usize, byte: u8 },
    #[error("instruction at 0x{pc:04X} runs past the end of code")]
    TruncatedInstruction { pc: usize },
    #[error("jump from 0x{pc:04X} to negative address {target}")]
    InvalidJump { pc: usize, target: i64 },
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow: limit of {limit} words exceeded")]
    StackOverflow { limit: usize },
    #[error("out of memory growing the stack to {words} words")]
    OutOfMemory { words: usize },
    #[error("local variable {index} out of range (frame has {count})")]
    LocalOutOfRange { index: usize, count: usize },
    #[error("constant {index} out of range (pool has {count})")]
    ConstantOutOfRange { index: usize, count: usize },
    #[error("invalid method address {address}")]
    InvalidMethod { address: i32 },
    #[error("method at 0x{address:04X} takes {args} arguments but only {available} are on the stack")]
    InvalidArguments {
        address: usize,
        args: usize,
        available: usize,
    },
    #[error("corrupted frame on return: {0}")]
    CorruptFrame(&'static str),
    #[error("ERR instruction at 0x{pc:04X}")]
    ErrInstruction { pc: usize },
    #[error("WIDE at 0x{pc:04X} is the last instruction")]
    DanglingWide { pc: usize },
    #[error(transparent)]
    Load(#[from] BytecodeError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("interrupted")]
    Interrupted,
    #[error("no program loaded")]
    NotLoaded,
}

impl From<std::io::Error> for VmError {
    fn from(err: std::io::Error) -> Self {
        VmError::Io(err.to_string())
    }
}
