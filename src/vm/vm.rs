use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, error, trace};

use super::bytecode::{self, Program};
use super::cpu::{Cpu, FrameInfo, Registers};
use super::error::VmError;
use super::heap::{ArrayHeap, GcStats};
use super::net::ConnectionTable;
use super::ops::Opcode;
use super::{Byte, Word};
use crate::config::RuntimeConfig;

/// Execution counters for one loaded program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MachineStats {
    pub instructions: u64,
    pub invocations: u64,
    pub max_call_depth: usize,
    /// Highest number of live stack words.
    pub max_stack_words: usize,
    pub gc: GcStats,
}

/// What the dispatch loop does after an instruction.
enum ControlFlow {
    Continue,
    /// WIDE was executed; run the next instruction as part of this step.
    Wide,
    Halt,
}

/// The IJVM: CPU, array heap, connections and I/O streams of one program.
pub struct Machine {
    config: RuntimeConfig,
    cpu: Cpu,
    heap: ArrayHeap,
    net: ConnectionTable,
    input: Box<dyn Read>,
    output: Box<dyn Write>,
    /// Set by WIDE, consumed by the next instruction.
    wide: bool,
    error: Option<VmError>,
    halted: bool,
    loaded: bool,
    stats: MachineStats,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Machine {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            cpu: Cpu::empty(config.stack_limit),
            heap: ArrayHeap::new(config.gc_mode, config.heap_limit),
            net: ConnectionTable::default(),
            input: Box::new(io::stdin()),
            output: Box::new(io::BufWriter::new(io::stdout())),
            wide: false,
            error: None,
            halted: false,
            loaded: false,
            stats: MachineStats::default(),
            interrupt: None,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn set_input(&mut self, input: impl Read + 'static) {
        self.input = Box::new(input);
    }

    pub fn set_output(&mut self, output: impl Write + 'static) {
        let _ = self.output.flush();
        self.output = Box::new(output);
    }

    /// Stop `run` with [`VmError::Interrupted`] once `flag` becomes true.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Load the binary at `path`, replacing any loaded program.
    ///
    /// On failure the machine is left empty.
    pub fn init(&mut self, path: &Path) -> Result<(), VmError> {
        self.destroy();
        let program = bytecode::load(path)?;
        self.load(program)
    }

    /// Install an already parsed program.
    pub fn load(&mut self, program: Program) -> Result<(), VmError> {
        self.destroy();
        self.cpu = Cpu::load(program.constants, program.code, self.config.stack_limit)?;
        self.wide = false;
        self.error = None;
        self.halted = false;
        self.loaded = true;
        self.stats = MachineStats::default();

        let regs = self.cpu.registers();
        debug!(
            code_bytes = self.cpu.code().len(),
            constants = self.cpu.constants().len(),
            main_locals = regs.nv,
            stack_words = self.cpu.capacity(),
            "program loaded"
        );
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Free the program, every array and every connection. The machine
    /// stays usable and can load another program. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        let _ = self.output.flush();
        if self.loaded {
            debug!(
                arrays = self.heap.len(),
                connections = self.net.len(),
                "destroying machine state"
            );
        }
        self.net.destroy();
        self.heap.destroy();
        self.cpu.clear();
        self.wide = false;
        self.loaded = false;
    }

    /// Tear everything down and exit the process with `code`.
    pub fn terminate_now(&mut self, code: i32) -> ! {
        self.destroy();
        std::process::exit(code)
    }

    // ========================================
    // Execution
    // ========================================

    /// True once the machine halted, hit a fatal error, or ran off the end
    /// of the code.
    pub fn finished(&self) -> bool {
        self.error.is_some() || self.halted || self.cpu.pc() >= self.cpu.code().len()
    }

    pub fn error_flag(&self) -> bool {
        self.error.is_some()
    }

    pub fn halt_flag(&self) -> bool {
        self.halted
    }

    /// The fatal condition that stopped the machine, if any.
    pub fn error(&self) -> Option<&VmError> {
        self.error.as_ref()
    }

    /// Run until finished. Returns the fatal error if one stopped the run.
    pub fn run(&mut self) -> Result<(), &VmError> {
        if !self.loaded {
            self.fail(VmError::NotLoaded);
        }
        while self.step() {
            if self
                .interrupt
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                self.fail(VmError::Interrupted);
                break;
            }
        }
        if let Err(err) = self.output.flush() {
            self.fail(err.into());
        }
        match &self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Execute one instruction (WIDE and the instruction it prefixes count
    /// as one step). Returns whether execution can continue.
    pub fn step(&mut self) -> bool {
        if self.finished() {
            return false;
        }
        loop {
            match self.execute() {
                Ok(ControlFlow::Continue) => break,
                Ok(ControlFlow::Wide) => {
                    if self.cpu.pc() >= self.cpu.code().len() {
                        let pc = self.cpu.pc() - 1;
                        self.fail(VmError::DanglingWide { pc });
                        break;
                    }
                }
                Ok(ControlFlow::Halt) => {
                    debug!(pc = self.cpu.pc(), "halted");
                    self.halted = true;
                    break;
                }
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
        !self.finished()
    }

    fn fail(&mut self, err: VmError) {
        error!(pc = self.cpu.pc(), error = %err, "machine error");
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn execute(&mut self) -> Result<ControlFlow, VmError> {
        let op_pc = self.cpu.pc();
        let byte = self.cpu.fetch_u8()?;
        let op = Opcode::from_byte(byte).ok_or(VmError::InvalidOpcode { pc: op_pc, byte })?;
        // Only ILOAD, ISTORE and IINC read the flag; any other opcode clears it.
        let wide = std::mem::take(&mut self.wide);

        self.stats.instructions += 1;
        trace!(pc = op_pc, op = %op, wide, sp = self.cpu.registers().sp, "dispatch");

        match op {
            Opcode::Nop => {}
            Opcode::Bipush => {
                let value = self.cpu.fetch_i8()?;
                self.cpu.push(value as Word)?;
            }
            Opcode::LdcW => {
                let index = self.cpu.fetch_u16()?;
                let value = self.cpu.constant(index as usize)?;
                self.cpu.push(value)?;
            }
            Opcode::Pop => {
                self.cpu.pop()?;
            }
            Opcode::Dup => {
                let value = self.cpu.peek()?;
                self.cpu.push(value)?;
            }
            Opcode::Swap => {
                let a = self.cpu.pop()?;
                let b = self.cpu.pop()?;
                self.cpu.push(a)?;
                self.cpu.push(b)?;
            }

            Opcode::Iload => {
                let index = self.local_index(wide)?;
                let value = self.cpu.local(index)?;
                self.cpu.push(value)?;
            }
            Opcode::Istore => {
                let index = self.local_index(wide)?;
                let value = self.cpu.pop()?;
                self.cpu.set_local(index, value)?;
            }
            Opcode::Iinc => {
                let index = self.local_index(wide)?;
                let delta = self.cpu.fetch_i8()?;
                let value = self.cpu.local(index)?;
                self.cpu.set_local(index, value.wrapping_add(delta as Word))?;
            }
            Opcode::Wide => {
                self.wide = true;
                return Ok(ControlFlow::Wide);
            }

            Opcode::Iadd => self.binary(Word::wrapping_add)?,
            Opcode::Isub => self.binary(Word::wrapping_sub)?,
            Opcode::Iand => self.binary(|a, b| a & b)?,
            Opcode::Ior => self.binary(|a, b| a | b)?,

            Opcode::Ifeq => {
                let offset = self.cpu.fetch_i16()?;
                if self.cpu.pop()? == 0 {
                    self.cpu.jump(op_pc, offset)?;
                }
            }
            Opcode::Iflt => {
                let offset = self.cpu.fetch_i16()?;
                if self.cpu.pop()? < 0 {
                    self.cpu.jump(op_pc, offset)?;
                }
            }
            Opcode::IcmpEq => {
                let offset = self.cpu.fetch_i16()?;
                let first = self.cpu.pop()?;
                let second = self.cpu.pop()?;
                if second == first {
                    self.cpu.jump(op_pc, offset)?;
                }
            }
            Opcode::Goto => {
                let offset = self.cpu.fetch_i16()?;
                self.cpu.jump(op_pc, offset)?;
            }
            Opcode::InvokeVirtual => {
                let index = self.cpu.fetch_u16()?;
                let address = self.cpu.constant(index as usize)?;
                self.cpu.enter_frame(address)?;
                self.stats.invocations += 1;
                self.stats.max_call_depth = self.stats.max_call_depth.max(self.cpu.depth());
            }
            Opcode::Ireturn => self.cpu.leave_frame()?,

            Opcode::NewArray => {
                let count = self.cpu.pop()?;
                let reference = self.heap.create(count, self.cpu.live_stack())?;
                self.cpu.push(reference)?;
            }
            Opcode::Iaload => {
                let reference = self.cpu.pop()?;
                let index = self.cpu.pop()?;
                let value = self.heap.get(reference, index)?;
                self.cpu.push(value)?;
            }
            Opcode::Iastore => {
                let reference = self.cpu.pop()?;
                let index = self.cpu.pop()?;
                let value = self.cpu.pop()?;
                self.heap.set(reference, index, value)?;
            }
            Opcode::Gc => {
                self.heap.collect(self.cpu.live_stack());
            }

            Opcode::NetBind => {
                let port = self.cpu.pop()?;
                let reference = self.net.bind(port)?;
                self.cpu.push(reference)?;
            }
            Opcode::NetConnect => {
                let port = self.cpu.pop()?;
                let host = self.cpu.pop()?;
                let reference = self.net.connect(host, port)?;
                self.cpu.push(reference)?;
            }
            Opcode::NetIn => {
                let reference = self.cpu.pop()?;
                let value = self.net.recv(reference)?;
                self.cpu.push(value)?;
            }
            Opcode::NetOut => {
                let reference = self.cpu.pop()?;
                let data = self.cpu.pop()?;
                self.net.send(reference, data)?;
            }
            Opcode::NetClose => {
                let reference = self.cpu.pop()?;
                self.net.close(reference)?;
            }

            Opcode::In => {
                let value = self.read_byte()?;
                self.cpu.push(value)?;
            }
            Opcode::Out => {
                let value = self.cpu.pop()?;
                self.output.write_all(&[value as u8])?;
            }
            Opcode::Err => return Err(VmError::ErrInstruction { pc: op_pc }),
            Opcode::Halt => return Ok(ControlFlow::Halt),
        }
        Ok(ControlFlow::Continue)
    }

    fn local_index(&mut self, wide: bool) -> Result<usize, VmError> {
        if wide {
            Ok(self.cpu.fetch_u16()? as usize)
        } else {
            Ok(self.cpu.fetch_u8()? as usize)
        }
    }

    fn binary(&mut self, f: impl FnOnce(Word, Word) -> Word) -> Result<(), VmError> {
        let b = self.cpu.pop()?;
        let a = self.cpu.pop()?;
        self.cpu.push(f(a, b))
    }

    /// One byte from the input stream, 0 at end of input.
    fn read_byte(&mut self) -> Result<Word, VmError> {
        // Prompts written before a blocking read must be visible.
        self.output.flush()?;
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return Ok(0),
                Ok(_) => return Ok(buf[0] as Word),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    // ========================================
    // Inspection
    // ========================================

    pub fn program_counter(&self) -> usize {
        self.cpu.pc()
    }

    /// Opcode byte at the program counter.
    pub fn current_instruction(&self) -> Option<Byte> {
        self.cpu.code().get(self.cpu.pc()).copied()
    }

    pub fn code(&self) -> &[Byte] {
        self.cpu.code()
    }

    pub fn constants(&self) -> &[Word] {
        self.cpu.constants()
    }

    /// Operands of the current frame, bottom first.
    pub fn operand_stack(&self) -> &[Word] {
        self.cpu.operand_stack()
    }

    /// Top of the operand stack.
    pub fn tos(&self) -> Option<Word> {
        self.cpu.operand_stack().last().copied()
    }

    /// Live stack words, frames included.
    pub fn stack_size(&self) -> usize {
        self.cpu.registers().sp
    }

    /// Every live stack word, frames included.
    pub fn stack(&self) -> &[Word] {
        self.cpu.live_stack()
    }

    pub fn locals(&self) -> &[Word] {
        self.cpu.locals()
    }

    pub fn local(&self, index: usize) -> Option<Word> {
        self.cpu.locals().get(index).copied()
    }

    pub fn registers(&self) -> Registers {
        self.cpu.registers()
    }

    /// Call chain, innermost frame first.
    pub fn frames(&self) -> Vec<FrameInfo> {
        self.cpu.frames()
    }

    pub fn heap(&self) -> &ArrayHeap {
        &self.heap
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.net
    }

    pub fn stats(&self) -> MachineStats {
        MachineStats {
            max_stack_words: self.cpu.max_sp(),
            gc: self.heap.stats(),
            ..self.stats
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.destroy();
    }
}
