//! Label-resolving builder for program images.
//!
//! Used by the test suites, the benchmarks and anything else that needs to
//! produce IJVM binaries without an external assembler:
//!
//! ```
//! use ijvm::vm::{Assembler, Opcode};
//!
//! let mut asm = Assembler::new();
//! asm.bipush(5).bipush(3).op(Opcode::Iadd).op(Opcode::Out).op(Opcode::Halt);
//! let program = asm.finish().unwrap();
//! assert_eq!(program.code, vec![0x10, 5, 0x10, 3, 0x60, 0xFD, 0xFF]);
//! ```

use std::collections::HashMap;

use thiserror::Error;

use super::bytecode::Program;
use super::ops::Opcode;
use super::{Byte, Word};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),
    #[error("label '{0}' defined twice")]
    DuplicateLabel(String),
    #[error("branch to '{label}' at 0x{at:04X} does not fit in 16 bits")]
    BranchOutOfRange { label: String, at: usize },
    #[error("constant pool is full")]
    TooManyConstants,
}

#[derive(Debug, Clone)]
struct Fixup {
    /// Address of the branch opcode.
    at: usize,
    label: String,
}

#[derive(Debug, Clone, Default)]
pub struct Assembler {
    code: Vec<Byte>,
    constants: Vec<Word>,
    labels: HashMap<String, usize>,
    /// Label definitions in order, for symbol output.
    label_order: Vec<String>,
    methods: Vec<String>,
    branches: Vec<Fixup>,
    /// Constant slots holding the address of a label.
    addresses: Vec<(usize, String)>,
    errors: Vec<AsmError>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code address.
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        if self.labels.insert(name.to_string(), self.code.len()).is_some() {
            self.errors.push(AsmError::DuplicateLabel(name.to_string()));
        } else {
            self.label_order.push(name.to_string());
        }
        self
    }

    /// Emit an instruction without immediates.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op.byte());
        self
    }

    /// Emit a raw byte, e.g. to produce deliberately malformed code.
    pub fn byte(&mut self, byte: Byte) -> &mut Self {
        self.code.push(byte);
        self
    }

    fn short(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    pub fn bipush(&mut self, value: i8) -> &mut Self {
        self.code.extend_from_slice(&[Opcode::Bipush.byte(), value as u8]);
        self
    }

    /// Add a value to the constant pool and return its index.
    pub fn constant(&mut self, value: Word) -> u16 {
        if self.constants.len() > u16::MAX as usize {
            self.errors.push(AsmError::TooManyConstants);
            return u16::MAX;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }

    pub fn ldc_w(&mut self, index: u16) -> &mut Self {
        self.code.push(Opcode::LdcW.byte());
        self.short(index);
        self
    }

    /// Push an arbitrary word through the constant pool.
    pub fn push_word(&mut self, value: Word) -> &mut Self {
        let index = self.constant(value);
        self.ldc_w(index)
    }

    fn local_op(&mut self, op: Opcode, index: u16) {
        if index > u8::MAX as u16 {
            self.code.push(Opcode::Wide.byte());
            self.code.push(op.byte());
            self.short(index);
        } else {
            self.code.extend_from_slice(&[op.byte(), index as u8]);
        }
    }

    /// ILOAD, prefixed with WIDE when the index needs two bytes.
    pub fn iload(&mut self, index: u16) -> &mut Self {
        self.local_op(Opcode::Iload, index);
        self
    }

    /// ISTORE, prefixed with WIDE when the index needs two bytes.
    pub fn istore(&mut self, index: u16) -> &mut Self {
        self.local_op(Opcode::Istore, index);
        self
    }

    pub fn iinc(&mut self, index: u16, delta: i8) -> &mut Self {
        self.local_op(Opcode::Iinc, index);
        self.code.push(delta as u8);
        self
    }

    /// Emit a branch to `label`; the offset is patched in `finish`.
    pub fn branch(&mut self, op: Opcode, label: &str) -> &mut Self {
        debug_assert!(op.is_branch(), "{op} is not a branch");
        self.branches.push(Fixup {
            at: self.code.len(),
            label: label.to_string(),
        });
        self.code.push(op.byte());
        self.short(0);
        self
    }

    /// INVOKEVIRTUAL through a fresh constant holding the address of
    /// `method`.
    pub fn invoke(&mut self, method: &str) -> &mut Self {
        let index = self.constant(0);
        self.addresses.push((index as usize, method.to_string()));
        self.code.push(Opcode::InvokeVirtual.byte());
        self.short(index);
        self
    }

    /// Start a method: define `name` here and emit its header.
    ///
    /// `args` counts the object reference slot.
    pub fn method(&mut self, name: &str, args: u16, locals: u16) -> &mut Self {
        self.label(name);
        self.methods.push(name.to_string());
        self.short(args);
        self.short(locals);
        self
    }

    /// Resolve labels and produce the program image.
    pub fn finish(&self) -> Result<Program, AsmError> {
        if let Some(err) = self.errors.first() {
            return Err(err.clone());
        }
        let mut code = self.code.clone();
        for fixup in &self.branches {
            let target = self.resolve(&fixup.label)?;
            let offset = target as i64 - fixup.at as i64;
            let offset = i16::try_from(offset).map_err(|_| AsmError::BranchOutOfRange {
                label: fixup.label.clone(),
                at: fixup.at,
            })?;
            code[fixup.at + 1..fixup.at + 3].copy_from_slice(&offset.to_be_bytes());
        }

        let mut constants = self.constants.clone();
        for (index, label) in &self.addresses {
            constants[*index] = self.resolve(label)? as Word;
        }
        Ok(Program::new(constants, code))
    }

    fn resolve(&self, label: &str) -> Result<usize, AsmError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| AsmError::UndefinedLabel(label.to_string()))
    }

    /// Method entry points as `(address, name)`, in definition order.
    pub fn method_symbols(&self) -> Vec<(u32, String)> {
        self.methods
            .iter()
            .map(|name| (self.labels[name] as u32, name.clone()))
            .collect()
    }

    /// Labels that are not method entry points, as `(address, name)`.
    pub fn label_symbols(&self) -> Vec<(u32, String)> {
        self.label_order
            .iter()
            .filter(|name| !self.methods.contains(*name))
            .map(|name| (self.labels[name] as u32, name.clone()))
            .collect()
    }
}
