//! Debug symbols trailing the text block of a binary.
//!
//! Two optional blocks follow the text block: function symbols, then label
//! symbols. Each block has the usual `origin u32, size u32` header followed
//! by `size` bytes of records `{address u32, name, NUL}`.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::vm::BytecodeError;
use crate::vm::bytecode::{self, read_u32, write_u32};

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    #[error("{0} symbol block is truncated")]
    Truncated(&'static str),
    #[error("{block} symbol at offset {offset} is not NUL-terminated")]
    Unterminated { block: &'static str, offset: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub address: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbols {
    pub functions: Vec<Symbol>,
    pub labels: Vec<Symbol>,
}

impl Symbols {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.labels.is_empty()
    }

    /// Address of `name`, functions first.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.functions
            .iter()
            .chain(&self.labels)
            .find(|s| s.name == name)
            .map(|s| s.address)
    }

    /// Symbol defined exactly at `address`, functions first.
    pub fn name_at(&self, address: usize) -> Option<&str> {
        self.functions
            .iter()
            .chain(&self.labels)
            .find(|s| s.address as usize == address)
            .map(|s| s.name.as_str())
    }

    /// The function whose body contains `address`: the one with the highest
    /// start address not above it.
    pub fn function_at(&self, address: usize) -> Option<&Symbol> {
        self.functions
            .iter()
            .filter(|s| s.address as usize <= address)
            .max_by_key(|s| s.address)
    }
}

/// Read the symbols of the binary at `path`. A binary without symbol
/// blocks yields an empty table.
pub fn load(path: &Path) -> Result<Symbols, SymbolError> {
    let file = File::open(path).map_err(|source| BytecodeError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut r = BufReader::new(file);
    bytecode::read_program(&mut r)?;
    let symbols = read_symbols(&mut r)?;
    debug!(
        functions = symbols.functions.len(),
        labels = symbols.labels.len(),
        "debug symbols loaded"
    );
    Ok(symbols)
}

/// Parse the symbol blocks from a reader positioned after the text block.
pub fn read_symbols<R: Read>(r: &mut R) -> Result<Symbols, SymbolError> {
    let functions = read_block(r, "function")?.unwrap_or_default();
    let labels = read_block(r, "label")?.unwrap_or_default();
    Ok(Symbols { functions, labels })
}

fn read_block<R: Read>(
    r: &mut R,
    block: &'static str,
) -> Result<Option<Vec<Symbol>>, SymbolError> {
    // End of file where a block would start means the block is absent.
    let mut origin = [0u8; 4];
    let mut filled = 0;
    while filled < origin.len() {
        match r.read(&mut origin[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < origin.len() {
        return Err(SymbolError::Truncated(block));
    }

    let size = read_u32(r, "symbol block size").map_err(|_| SymbolError::Truncated(block))?;
    let mut data = Vec::new();
    r.by_ref().take(size as u64).read_to_end(&mut data)?;
    if data.len() != size as usize {
        return Err(SymbolError::Truncated(block));
    }

    let mut symbols = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let Some(addr) = data.get(offset..offset + 4) else {
            return Err(SymbolError::Truncated(block));
        };
        let address = u32::from_be_bytes([addr[0], addr[1], addr[2], addr[3]]);
        let rest = &data[offset + 4..];
        let Some(end) = rest.iter().position(|&b| b == 0) else {
            return Err(SymbolError::Unterminated { block, offset });
        };
        symbols.push(Symbol {
            address,
            name: String::from_utf8_lossy(&rest[..end]).into_owned(),
        });
        offset += 4 + end + 1;
    }
    Ok(Some(symbols))
}

/// Append both symbol blocks after a program image.
pub fn write_symbols<W: Write>(
    w: &mut W,
    functions: &[(u32, String)],
    labels: &[(u32, String)],
) -> io::Result<()> {
    for block in [functions, labels] {
        let mut data = Vec::new();
        for (address, name) in block {
            data.extend_from_slice(&address.to_be_bytes());
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        write_u32(w, 0)?;
        write_u32(w, data.len() as u32)?;
        w.write_all(&data)?;
    }
    Ok(())
}
