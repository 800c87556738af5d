//! Memory and register model.
//!
//! One growable word array holds both the operand stack and every call
//! frame. A frame for an invoked method looks like this (indices grow up):
//!
//! ```text
//!   fp+3: old_pc
//!   fp+2: old_fp
//!   fp+1: old_nv
//!   fp+0: old_lv      <- fp
//!   lv+n-1: last local
//!   ...
//!   lv+0: first argument (the object reference slot)   <- lv
//! ```
//!
//! The entry frame has no saved-register block: its locals sit at
//! `[0, nv)` and its operands start directly at `fp == nv`.

use serde::Serialize;

use super::error::VmError;
use super::ops::Opcode;
use super::{Byte, Word};

/// Smallest stack allocation, in words.
pub const STACK_MIN_SIZE: usize = 4096;
/// Factor applied to the stack capacity when it fills up.
pub const STACK_GROWTH: usize = 8;
/// Operand headroom reserved above the entry frame's locals.
pub const OPERAND_MARGIN: usize = 1024;
/// Default hard ceiling on stack size: 2^30 words (4 GiB).
pub const DEFAULT_STACK_LIMIT: usize = 1 << 30;

/// Number of saved registers pushed by INVOKEVIRTUAL.
pub const FRAME_HEADER: usize = 4;

/// Snapshot of the register file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Registers {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
    pub lv: usize,
    pub nv: usize,
}

/// One entry of the call chain, innermost first when returned by
/// [`Cpu::frames`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Base of the frame's variables.
    pub lv: usize,
    /// Argument + local count.
    pub nv: usize,
    /// Saved-register block, equal to `lv + nv`.
    pub fp: usize,
    /// Where execution resumes in the caller; `None` for the entry frame.
    pub return_pc: Option<usize>,
}

#[derive(Debug)]
pub struct Cpu {
    constants: Vec<Word>,
    code: Vec<Byte>,
    stack: Vec<Word>,
    stack_limit: usize,
    pub(crate) pc: usize,
    /// Number of live words; the top of stack is `stack[sp - 1]`.
    sp: usize,
    fp: usize,
    lv: usize,
    nv: usize,
    /// Invoked frames above the entry frame.
    depth: usize,
    max_sp: usize,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::empty(DEFAULT_STACK_LIMIT)
    }
}

impl Cpu {
    /// A CPU with no memory allocated.
    pub fn empty(stack_limit: usize) -> Self {
        Self {
            constants: Vec::new(),
            code: Vec::new(),
            stack: Vec::new(),
            stack_limit: stack_limit.max(1),
            pc: 0,
            sp: 0,
            fp: 0,
            lv: 0,
            nv: 0,
            depth: 0,
            max_sp: 0,
        }
    }

    /// Install a program image and build the entry frame.
    ///
    /// Fails without allocating when the entry frame cannot fit the limit.
    pub fn load(
        constants: Vec<Word>,
        code: Vec<Byte>,
        stack_limit: usize,
    ) -> Result<Self, VmError> {
        let stack_limit = stack_limit.max(1);
        let locals = scan_main_locals(&code, &constants);
        if locals > stack_limit {
            return Err(VmError::StackOverflow { limit: stack_limit });
        }
        let capacity = initial_capacity(locals).min(stack_limit).max(locals);

        let mut stack = Vec::new();
        stack
            .try_reserve_exact(capacity)
            .map_err(|_| VmError::OutOfMemory { words: capacity })?;
        stack.resize(capacity, 0);

        Ok(Self {
            constants,
            code,
            stack,
            stack_limit,
            pc: 0,
            sp: locals,
            fp: locals,
            lv: 0,
            nv: locals,
            depth: 0,
            max_sp: locals,
        })
    }

    /// Release all memory. Safe to call repeatedly.
    pub fn clear(&mut self) {
        *self = Self::empty(self.stack_limit);
    }

    // ========================================
    // Accessors
    // ========================================

    pub fn code(&self) -> &[Byte] {
        &self.code
    }

    pub fn constants(&self) -> &[Word] {
        &self.constants
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn registers(&self) -> Registers {
        Registers {
            pc: self.pc,
            sp: self.sp,
            fp: self.fp,
            lv: self.lv,
            nv: self.nv,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Allocated stack size in words.
    pub fn capacity(&self) -> usize {
        self.stack.len()
    }

    /// Highest `sp` reached since load.
    pub fn max_sp(&self) -> usize {
        self.max_sp
    }

    /// Every live word, frames included. This is the GC root set.
    pub fn live_stack(&self) -> &[Word] {
        &self.stack[..self.sp]
    }

    /// Operands of the current frame, bottom first.
    pub fn operand_stack(&self) -> &[Word] {
        &self.stack[self.operand_base()..self.sp]
    }

    /// Arguments and locals of the current frame.
    pub fn locals(&self) -> &[Word] {
        &self.stack[self.lv..self.lv + self.nv]
    }

    fn operand_base(&self) -> usize {
        if self.depth == 0 {
            self.fp
        } else {
            self.fp + FRAME_HEADER
        }
    }

    /// Walk the call chain through the saved-register blocks.
    pub fn frames(&self) -> Vec<FrameInfo> {
        let mut frames = Vec::with_capacity(self.depth + 1);
        let (mut lv, mut nv, mut fp) = (self.lv, self.nv, self.fp);
        for _ in 0..self.depth {
            let saved = &self.stack[fp..fp + FRAME_HEADER];
            frames.push(FrameInfo {
                lv,
                nv,
                fp,
                return_pc: Some(saved[3] as usize),
            });
            lv = saved[0] as usize;
            nv = saved[1] as usize;
            fp = saved[2] as usize;
        }
        frames.push(FrameInfo {
            lv,
            nv,
            fp,
            return_pc: None,
        });
        frames
    }

    // ========================================
    // Stack operations
    // ========================================

    pub fn push(&mut self, value: Word) -> Result<(), VmError> {
        if self.sp == self.stack.len() {
            self.grow()?;
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        self.max_sp = self.max_sp.max(self.sp);
        Ok(())
    }

    fn grow(&mut self) -> Result<(), VmError> {
        let current = self.stack.len();
        if current >= self.stack_limit {
            return Err(VmError::StackOverflow {
                limit: self.stack_limit,
            });
        }
        let target = current
            .saturating_mul(STACK_GROWTH)
            .max(STACK_MIN_SIZE)
            .min(self.stack_limit);
        self.stack
            .try_reserve_exact(target - current)
            .map_err(|_| VmError::OutOfMemory { words: target })?;
        self.stack.resize(target, 0);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Word, VmError> {
        if self.sp <= self.operand_base() {
            return Err(VmError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp])
    }

    pub fn peek(&self) -> Result<Word, VmError> {
        if self.sp <= self.operand_base() {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack[self.sp - 1])
    }

    pub fn local(&self, index: usize) -> Result<Word, VmError> {
        if index >= self.nv {
            return Err(VmError::LocalOutOfRange {
                index,
                count: self.nv,
            });
        }
        Ok(self.stack[self.lv + index])
    }

    pub fn set_local(&mut self, index: usize, value: Word) -> Result<(), VmError> {
        if index >= self.nv {
            return Err(VmError::LocalOutOfRange {
                index,
                count: self.nv,
            });
        }
        self.stack[self.lv + index] = value;
        Ok(())
    }

    pub fn constant(&self, index: usize) -> Result<Word, VmError> {
        self.constants
            .get(index)
            .copied()
            .ok_or(VmError::ConstantOutOfRange {
                index,
                count: self.constants.len(),
            })
    }

    // ========================================
    // Instruction stream
    // ========================================

    pub fn fetch_u8(&mut self) -> Result<u8, VmError> {
        let byte = *self
            .code
            .get(self.pc)
            .ok_or(VmError::TruncatedInstruction { pc: self.pc })?;
        self.pc += 1;
        Ok(byte)
    }

    pub fn fetch_i8(&mut self) -> Result<i8, VmError> {
        self.fetch_u8().map(|b| b as i8)
    }

    pub fn fetch_u16(&mut self) -> Result<u16, VmError> {
        if self.pc + 2 > self.code.len() {
            return Err(VmError::TruncatedInstruction { pc: self.pc });
        }
        let value = u16::from_be_bytes([self.code[self.pc], self.code[self.pc + 1]]);
        self.pc += 2;
        Ok(value)
    }

    pub fn fetch_i16(&mut self) -> Result<i16, VmError> {
        self.fetch_u16().map(|v| v as i16)
    }

    /// Branch relative to the opcode at `op_pc`.
    ///
    /// A target at or past the end of code is accepted; the run then stops
    /// as end-of-code.
    pub fn jump(&mut self, op_pc: usize, offset: i16) -> Result<(), VmError> {
        let target = op_pc as i64 + offset as i64;
        if target < 0 {
            return Err(VmError::InvalidJump { pc: op_pc, target });
        }
        self.pc = target as usize;
        Ok(())
    }

    // ========================================
    // Call protocol
    // ========================================

    /// Enter the method whose header starts at `address`.
    ///
    /// The caller has already pushed the arguments; `self.pc` is the return
    /// address.
    pub fn enter_frame(&mut self, address: Word) -> Result<(), VmError> {
        if address < 0 || address as usize + 4 > self.code.len() {
            return Err(VmError::InvalidMethod { address });
        }
        let address = address as usize;
        let args = u16::from_be_bytes([self.code[address], self.code[address + 1]]) as usize;
        let locals = u16::from_be_bytes([self.code[address + 2], self.code[address + 3]]) as usize;

        let available = self.sp - self.operand_base();
        if args > available {
            return Err(VmError::InvalidArguments {
                address,
                args,
                available,
            });
        }

        let return_pc = self.pc;
        let (old_lv, old_nv, old_fp) = (self.lv, self.nv, self.fp);
        for _ in 0..locals {
            self.push(0)?;
        }
        self.push(old_lv as Word)?;
        self.push(old_nv as Word)?;
        self.push(old_fp as Word)?;
        self.push(return_pc as Word)?;

        self.fp = self.sp - FRAME_HEADER;
        self.nv = args + locals;
        self.lv = self.fp - self.nv;
        self.pc = address + 4;
        self.depth += 1;
        Ok(())
    }

    /// Pop the return value, discard the current frame and push the value
    /// onto the caller's operand stack.
    pub fn leave_frame(&mut self) -> Result<(), VmError> {
        if self.depth == 0 {
            return Err(VmError::CorruptFrame("return from the entry frame"));
        }
        let value = self.pop()?;

        let saved = &self.stack[self.fp..self.fp + FRAME_HEADER];
        let (old_lv, old_nv, old_fp, old_pc) = (saved[0], saved[1], saved[2], saved[3]);
        if old_lv < 0 || old_nv < 0 || old_fp < 0 || old_pc < 0 {
            return Err(VmError::CorruptFrame("negative saved register"));
        }
        let (old_lv, old_nv, old_fp, old_pc) =
            (old_lv as usize, old_nv as usize, old_fp as usize, old_pc as usize);
        if old_lv + old_nv != old_fp || old_fp > self.lv {
            return Err(VmError::CorruptFrame("saved frame pointers are inconsistent"));
        }
        if old_pc > self.code.len() {
            return Err(VmError::CorruptFrame("return address outside code"));
        }

        self.sp = self.lv;
        self.lv = old_lv;
        self.nv = old_nv;
        self.fp = old_fp;
        self.pc = old_pc;
        self.depth -= 1;
        self.push(value)
    }
}

/// Smallest `STACK_MIN_SIZE * 8^i` that holds `locals` plus operand headroom.
fn initial_capacity(locals: usize) -> usize {
    let needed = locals + OPERAND_MARGIN;
    let mut capacity = STACK_MIN_SIZE;
    while capacity < needed {
        capacity = capacity.saturating_mul(STACK_GROWTH);
    }
    capacity
}

/// Count the locals used by the entry method.
///
/// Scans from address 0 up to the lowest method address reached through an
/// INVOKEVIRTUAL constant, returning one past the highest index used by
/// ILOAD, ISTORE or IINC.
pub fn scan_main_locals(code: &[Byte], constants: &[Word]) -> usize {
    let mut end = code.len();
    let mut count = 0usize;
    let mut wide = false;
    let mut pc = 0usize;

    while pc < end {
        let Some(op) = Opcode::from_byte(code[pc]) else {
            pc += 1;
            wide = false;
            continue;
        };
        let operands = &code[(pc + 1).min(code.len())..];
        let short = |at: usize| -> Option<usize> {
            Some(u16::from_be_bytes([*operands.get(at)?, *operands.get(at + 1)?]) as usize)
        };
        match op {
            Opcode::Wide => {
                wide = true;
                pc += 1;
                continue;
            }
            Opcode::Iload | Opcode::Istore | Opcode::Iinc => {
                let index = if wide {
                    short(0)
                } else {
                    operands.first().map(|&b| b as usize)
                };
                if let Some(index) = index {
                    count = count.max(index + 1);
                }
            }
            Opcode::InvokeVirtual => {
                if let Some(address) = short(0)
                    .and_then(|i| constants.get(i))
                    .filter(|&&a| a > 0)
                {
                    end = end.min(*address as usize);
                }
            }
            _ => {}
        }
        pc += 1 + op.operand_len(wide);
        wide = false;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_with(code: Vec<u8>, constants: Vec<Word>) -> Cpu {
        Cpu::load(constants, code, DEFAULT_STACK_LIMIT).unwrap()
    }

    #[test]
    fn test_scan_main_locals_plain_and_wide() {
        // ISTORE 3, WIDE ISTORE 0x0100, HALT
        let code = vec![0x36, 0x03, 0xC4, 0x36, 0x01, 0x00, 0xFF];
        assert_eq!(scan_main_locals(&code, &[]), 257);
        assert_eq!(scan_main_locals(&[0xFF], &[]), 0);
    }

    #[test]
    fn test_scan_stops_at_first_method() {
        // main: INVOKEVIRTUAL #0, HALT; method at 4 uses ISTORE 9
        let code = vec![0xB6, 0x00, 0x00, 0xFF, 0x00, 0x01, 0x00, 0x00, 0x36, 0x09, 0xAC];
        assert_eq!(scan_main_locals(&code, &[4]), 0);
    }

    #[test]
    fn test_initial_capacity() {
        assert_eq!(initial_capacity(0), 4096);
        assert_eq!(initial_capacity(3072), 4096);
        assert_eq!(initial_capacity(3073), 32768);
    }

    #[test]
    fn test_entry_frame_layout() {
        let cpu = cpu_with(vec![0x36, 0x01, 0xFF], vec![]);
        let regs = cpu.registers();
        assert_eq!((regs.lv, regs.nv, regs.fp, regs.sp), (0, 2, 2, 2));
        assert_eq!(cpu.locals(), &[0, 0]);
        assert!(cpu.operand_stack().is_empty());
        assert_eq!(cpu.capacity(), STACK_MIN_SIZE);
    }

    #[test]
    fn test_pop_below_frame_is_underflow() {
        let mut cpu = cpu_with(vec![0x36, 0x00, 0xFF], vec![]);
        assert!(matches!(cpu.pop(), Err(VmError::StackUnderflow)));
        cpu.push(7).unwrap();
        assert_eq!(cpu.peek().unwrap(), 7);
        assert_eq!(cpu.pop().unwrap(), 7);
        assert!(matches!(cpu.peek(), Err(VmError::StackUnderflow)));
    }

    #[test]
    fn test_stack_grows_and_respects_limit() {
        let mut cpu = Cpu::load(vec![], vec![0xFF], 5000).unwrap();
        assert_eq!(cpu.capacity(), 4096);
        for i in 0..5000 {
            cpu.push(i).unwrap();
        }
        assert_eq!(cpu.capacity(), 5000);
        assert!(matches!(
            cpu.push(1),
            Err(VmError::StackOverflow { limit: 5000 })
        ));
        assert_eq!(cpu.pop().unwrap(), 4999);
    }

    #[test]
    fn test_local_bounds() {
        let mut cpu = cpu_with(vec![0x36, 0x00, 0xFF], vec![]);
        cpu.set_local(0, 9).unwrap();
        assert_eq!(cpu.local(0).unwrap(), 9);
        assert!(matches!(
            cpu.local(1),
            Err(VmError::LocalOutOfRange { index: 1, count: 1 })
        ));
    }

    #[test]
    fn test_fetch_past_end() {
        let mut cpu = cpu_with(vec![0x10], vec![]);
        cpu.pc = 1;
        assert!(matches!(
            cpu.fetch_u8(),
            Err(VmError::TruncatedInstruction { pc: 1 })
        ));
        cpu.pc = 0;
        assert!(matches!(
            cpu.fetch_u16(),
            Err(VmError::TruncatedInstruction { pc: 0 })
        ));
    }

    #[test]
    fn test_enter_and_leave_frame() {
        // method at 0: 2 args, 1 local
        let code = vec![0x00, 0x02, 0x00, 0x01, 0xAC];
        let mut cpu = cpu_with(code, vec![]);
        cpu.push(0x42).unwrap(); // objref
        cpu.push(5).unwrap();
        cpu.pc = 99;

        cpu.enter_frame(0).unwrap();
        assert_eq!(cpu.depth(), 1);
        assert_eq!(cpu.locals(), &[0x42, 5, 0]);
        assert_eq!(cpu.pc(), 4);
        assert_eq!(cpu.frames().len(), 2);
        assert_eq!(cpu.frames()[0].return_pc, Some(99));

        cpu.push(11).unwrap();
        // return address is outside this tiny code block
        assert!(matches!(cpu.leave_frame(), Err(VmError::CorruptFrame(_))));
    }

    #[test]
    fn test_leave_restores_caller() {
        let code = vec![0x00, 0x01, 0x00, 0x00, 0xAC, 0xFF, 0xFF, 0xFF];
        let mut cpu = cpu_with(code, vec![]);
        cpu.push(1).unwrap();
        cpu.pc = 7;
        let before = cpu.registers();

        cpu.enter_frame(0).unwrap();
        cpu.push(33).unwrap();
        cpu.leave_frame().unwrap();

        let after = cpu.registers();
        assert_eq!(after.pc, 7);
        assert_eq!(after.sp, before.sp);
        assert_eq!((after.lv, after.nv, after.fp), (before.lv, before.nv, before.fp));
        assert_eq!(cpu.operand_stack(), &[33]);
        assert_eq!(cpu.depth(), 0);
    }

    #[test]
    fn test_enter_frame_rejects_bad_calls() {
        let code = vec![0x00, 0x03, 0x00, 0x00, 0xAC];
        let mut cpu = cpu_with(code, vec![]);
        cpu.push(1).unwrap();
        assert!(matches!(
            cpu.enter_frame(0),
            Err(VmError::InvalidArguments { args: 3, available: 1, .. })
        ));
        assert!(matches!(
            cpu.enter_frame(-4),
            Err(VmError::InvalidMethod { address: -4 })
        ));
        assert!(matches!(
            cpu.enter_frame(3),
            Err(VmError::InvalidMethod { address: 3 })
        ));
    }

    #[test]
    fn test_return_from_entry_frame_is_fatal() {
        let mut cpu = cpu_with(vec![0xAC], vec![]);
        cpu.push(1).unwrap();
        assert!(matches!(cpu.leave_frame(), Err(VmError::CorruptFrame(_))));
    }

    #[test]
    fn test_negative_jump() {
        let mut cpu = cpu_with(vec![0xA7, 0xFF, 0xF0], vec![]);
        assert!(matches!(
            cpu.jump(0, -16),
            Err(VmError::InvalidJump { pc: 0, target: -16 })
        ));
        cpu.jump(0, 100).unwrap();
        assert_eq!(cpu.pc(), 100);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut cpu = cpu_with(vec![0xFF], vec![1, 2]);
        cpu.clear();
        cpu.clear();
        assert!(cpu.code().is_empty());
        assert!(cpu.constants().is_empty());
        assert_eq!(cpu.capacity(), 0);
        assert!(cpu.live_stack().is_empty());
    }
}
