//! Human-readable listing of a program image.

use std::collections::BTreeSet;
use std::fmt::Write;

use super::Word;
use super::bytecode::Program;
use super::ops::Opcode;

/// One decoded line of the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub address: usize,
    pub bytes: Vec<u8>,
    pub text: String,
}

/// Render the whole program, constant pool first.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    if !program.constants.is_empty() {
        let _ = writeln!(out, ".constant");
        for (i, value) in program.constants.iter().enumerate() {
            let _ = writeln!(out, "    #{i:<5} {value} (0x{:08X})", *value as u32);
        }
        let _ = writeln!(out, ".end-constant");
        out.push('\n');
    }
    for line in decode(program) {
        let hex: Vec<String> = line.bytes.iter().map(|b| format!("{b:02x}")).collect();
        let _ = writeln!(out, "0x{:04X}  {:<12} {}", line.address, hex.join(" "), line.text);
    }
    out
}

/// Decode the code block into lines.
///
/// Method headers are recognised at every address reached through an
/// INVOKEVIRTUAL constant.
pub fn decode(program: &Program) -> Vec<Line> {
    let mut methods = BTreeSet::new();
    // Discovering a method changes how the bytes after it decode, so sweep
    // until the set of method addresses stops growing.
    loop {
        let (lines, found) = sweep(program, &methods);
        if found.is_subset(&methods) {
            return lines;
        }
        methods.extend(found);
    }
}

fn sweep(program: &Program, methods: &BTreeSet<usize>) -> (Vec<Line>, BTreeSet<usize>) {
    let code = &program.code;
    let mut lines = Vec::new();
    let mut found = BTreeSet::new();
    let mut pc = 0;

    while pc < code.len() {
        if methods.contains(&pc) && pc + 4 <= code.len() {
            let args = u16::from_be_bytes([code[pc], code[pc + 1]]);
            let locals = u16::from_be_bytes([code[pc + 2], code[pc + 3]]);
            lines.push(Line {
                address: pc,
                bytes: code[pc..pc + 4].to_vec(),
                text: format!(".method args={args} locals={locals}"),
            });
            pc += 4;
            continue;
        }

        let start = pc;
        let mut wide = false;
        let mut op = Opcode::from_byte(code[pc]);
        let prefixes = code
            .get(pc + 1)
            .and_then(|&b| Opcode::from_byte(b))
            .is_some_and(Opcode::accepts_wide);
        if op == Some(Opcode::Wide) && prefixes {
            wide = true;
            pc += 1;
            op = Opcode::from_byte(code[pc]);
        }

        let Some(op) = op else {
            lines.push(raw_byte(start, code[start]));
            pc = start + 1;
            continue;
        };
        let len = 1 + op.operand_len(wide);
        if pc + len > code.len() {
            lines.push(raw_byte(start, code[start]));
            pc = start + 1;
            continue;
        }

        let operands = &code[pc + 1..pc + len];
        let short = || u16::from_be_bytes([operands[0], operands[1]]);
        let mut text = String::new();
        if wide {
            text.push_str("WIDE ");
        }
        text.push_str(op.mnemonic());
        match op {
            Opcode::Bipush => {
                let _ = write!(text, " {}", operands[0] as i8);
            }
            Opcode::LdcW => {
                let index = short() as usize;
                let _ = write!(text, " #{index}");
                if let Some(value) = program.constants.get(index) {
                    let _ = write!(text, " (={value})");
                }
            }
            Opcode::Iload | Opcode::Istore => {
                let index = if wide { short() } else { operands[0] as u16 };
                let _ = write!(text, " {index}");
            }
            Opcode::Iinc => {
                let (index, delta) = if wide {
                    (short(), operands[2] as i8)
                } else {
                    (operands[0] as u16, operands[1] as i8)
                };
                let _ = write!(text, " {index} {delta}");
            }
            Opcode::Ifeq | Opcode::Iflt | Opcode::IcmpEq | Opcode::Goto => {
                let target = pc as i64 + short() as i16 as i64;
                let _ = write!(text, " 0x{target:04X}");
            }
            Opcode::InvokeVirtual => {
                let index = short() as usize;
                let _ = write!(text, " #{index}");
                if let Some(&address) = program.constants.get(index) {
                    let _ = write!(text, " (-> 0x{address:04X})");
                    if let Some(address) = method_address(address, code.len()) {
                        found.insert(address);
                    }
                }
            }
            _ => {}
        }
        pc += len;
        lines.push(Line {
            address: start,
            bytes: code[start..pc].to_vec(),
            text,
        });
    }
    (lines, found)
}

fn method_address(address: Word, code_len: usize) -> Option<usize> {
    let address = usize::try_from(address).ok()?;
    (address + 4 <= code_len).then_some(address)
}

fn raw_byte(address: usize, byte: u8) -> Line {
    Line {
        address,
        bytes: vec![byte],
        text: format!(".byte 0x{byte:02X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Assembler;

    #[test]
    fn test_listing_with_method() {
        let mut asm = Assembler::new();
        asm.bipush(0)
            .bipush(-3)
            .invoke("f")
            .op(Opcode::Halt)
            .method("f", 2, 1)
            .iload(1)
            .istore(300)
            .op(Opcode::Ireturn);
        let program = asm.finish().unwrap();
        let texts: Vec<String> = decode(&program).into_iter().map(|l| l.text).collect();
        assert_eq!(
            texts,
            vec![
                "BIPUSH 0",
                "BIPUSH -3",
                "INVOKEVIRTUAL #0 (-> 0x0008)",
                "HALT",
                ".method args=2 locals=1",
                "ILOAD 1",
                "WIDE ISTORE 300",
                "IRETURN",
            ]
        );
    }

    #[test]
    fn test_branch_targets_are_absolute() {
        let mut asm = Assembler::new();
        asm.op(Opcode::Nop).label("x").branch(Opcode::Goto, "x");
        let lines = decode(&asm.finish().unwrap());
        assert_eq!(lines[1].text, "GOTO 0x0001");
        assert_eq!(lines[1].bytes, vec![0xA7, 0x00, 0x00]);
    }

    #[test]
    fn test_unknown_and_truncated_bytes() {
        let program = Program::new(vec![], vec![0x01, 0x10]);
        let texts: Vec<String> = decode(&program).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec![".byte 0x01", ".byte 0x10"]);
    }

    #[test]
    fn test_disassemble_includes_constants() {
        let program = Program::new(vec![-1], vec![0x13, 0x00, 0x00, 0xFF]);
        let listing = disassemble(&program);
        assert!(listing.contains("#0     -1 (0xFFFFFFFF)"));
        assert!(listing.contains("0x0000  13 00 00     LDC_W #0 (=-1)"));
        assert!(listing.contains("0x0003  ff           HALT"));
    }
}
