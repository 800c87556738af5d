//! IJVM binary image loading and writing.
//!
//! Binary format (all integers big-endian):
//! - Magic: u32 `0x1DEADFAD`
//! - Constant block: origin u32, size u32 (bytes, multiple of 4), words
//! - Text block: origin u32, size u32 (bytes), raw instruction bytes
//! - Optional trailing debug-symbol blocks (see `debugger::symbols`)
//!
//! Origins are informational and not enforced. Constants are converted to
//! native words on load; instruction bytes are kept as-is.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::{Byte, Word};

/// File signature of IJVM binaries.
pub const MAGIC: u32 = 0x1DEA_DFAD;

/// Error type for loading a binary image.
#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bad file signature 0x{0:08X}")]
    InvalidMagic(u32),
    #[error("unexpected end of file while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("constant block size {0} is not a multiple of 4")]
    MisalignedConstants(u32),
    #[error("cannot allocate {bytes} bytes for {section}")]
    Allocation { section: &'static str, bytes: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A loaded program: constant pool and instruction bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub constant_origin: u32,
    pub constants: Vec<Word>,
    pub text_origin: u32,
    pub code: Vec<Byte>,
}

impl Program {
    pub fn new(constants: Vec<Word>, code: Vec<Byte>) -> Self {
        Self {
            constant_origin: 0,
            constants,
            text_origin: 0,
            code,
        }
    }
}

/// Load a program from a file path.
///
/// Either the whole image is read and validated, or nothing is returned.
pub fn load(path: &Path) -> Result<Program, BytecodeError> {
    let file = File::open(path).map_err(|source| BytecodeError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let program = read_program(&mut BufReader::new(file))?;
    debug!(
        path = %path.display(),
        constants = program.constants.len(),
        code_bytes = program.code.len(),
        "binary loaded"
    );
    Ok(program)
}

/// Deserialize a program from bytes.
pub fn deserialize(data: &[u8]) -> Result<Program, BytecodeError> {
    let mut cursor = io::Cursor::new(data);
    read_program(&mut cursor)
}

/// Serialize a program to bytes.
pub fn serialize(program: &Program) -> Vec<u8> {
    let mut buf = Vec::new();
    write_program(&mut buf, program).expect("writing to Vec cannot fail");
    buf
}

/// Read a program image from a reader.
pub fn read_program<R: Read>(r: &mut R) -> Result<Program, BytecodeError> {
    let magic = read_u32(r, "magic number")?;
    if magic != MAGIC {
        return Err(BytecodeError::InvalidMagic(magic));
    }

    // Constant pool
    let constant_origin = read_u32(r, "constant origin")?;
    let constant_size = read_u32(r, "constant size")?;
    if constant_size % 4 != 0 {
        return Err(BytecodeError::MisalignedConstants(constant_size));
    }
    let raw = read_block(r, constant_size as usize, "constant pool")?;
    let constants = raw
        .chunks_exact(4)
        .map(|bytes| Word::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect();

    // Text
    let text_origin = read_u32(r, "text origin")?;
    let text_size = read_u32(r, "text size")?;
    let code = read_block(r, text_size as usize, "text")?;

    Ok(Program {
        constant_origin,
        constants,
        text_origin,
        code,
    })
}

/// Write a program image to a writer.
pub fn write_program<W: Write>(w: &mut W, program: &Program) -> io::Result<()> {
    write_u32(w, MAGIC)?;

    write_u32(w, program.constant_origin)?;
    write_u32(w, (program.constants.len() * 4) as u32)?;
    for constant in &program.constants {
        w.write_all(&constant.to_be_bytes())?;
    }

    write_u32(w, program.text_origin)?;
    write_u32(w, program.code.len() as u32)?;
    w.write_all(&program.code)
}

/// Read `len` bytes, reporting allocation failure instead of aborting.
fn read_block<R: Read>(
    r: &mut R,
    len: usize,
    section: &'static str,
) -> Result<Vec<u8>, BytecodeError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| BytecodeError::Allocation {
            section,
            bytes: len,
        })?;
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(BytecodeError::UnexpectedEof(section));
    }
    Ok(buf)
}

pub(crate) fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub(crate) fn read_u32<R: Read>(r: &mut R, what: &'static str) -> Result<u32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof(what))?;
    Ok(u32::from_be_bytes(buf))
}
