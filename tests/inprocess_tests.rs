//! In-process integration tests.
//!
//! Programs are assembled, written to temporary binaries and loaded through
//! the same path the command-line driver uses.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use ijvm::config::{GcMode, RuntimeConfig};
use ijvm::debugger::symbols;
use ijvm::vm::{Assembler, BytecodeError, Machine, Opcode, Program, SharedOutput, VmError, bytecode};
use tempfile::NamedTempFile;

fn write_binary(program: &Program) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&bytecode::serialize(program)).unwrap();
    file
}

/// Load `program` from disk, run it with `input`, and return the machine
/// and everything it printed.
fn run_with(program: &Program, input: &[u8], config: RuntimeConfig) -> (Machine, String) {
    let file = write_binary(program);
    let output = SharedOutput::new();
    let mut machine = Machine::new(config);
    machine.set_output(output.clone());
    machine.set_input(std::io::Cursor::new(input.to_vec()));
    machine.init(file.path()).unwrap();
    let _ = machine.run();
    (machine, output.to_string_lossy())
}

fn run(program: &Program, input: &[u8]) -> (Machine, String) {
    run_with(program, input, RuntimeConfig::default())
}

#[test]
fn test_hello_from_constants() {
    let mut asm = Assembler::new();
    for c in "Hello!\n".bytes() {
        asm.push_word(c as i32).op(Opcode::Out);
    }
    asm.op(Opcode::Halt);
    let (machine, out) = run(&asm.finish().unwrap(), b"");
    assert_eq!(out, "Hello!\n");
    assert!(machine.halt_flag());
    assert!(!machine.error_flag());
}

#[test]
fn test_echo_until_end_of_input() {
    let mut asm = Assembler::new();
    asm.label("loop")
        .op(Opcode::In)
        .op(Opcode::Dup)
        .branch(Opcode::Ifeq, "done")
        .op(Opcode::Out)
        .branch(Opcode::Goto, "loop")
        .label("done")
        .op(Opcode::Halt);
    let (machine, out) = run(&asm.finish().unwrap(), b"echo me");
    assert_eq!(out, "echo me");
    assert_eq!(machine.tos(), Some(0));
}

#[test]
fn test_uppercase_filter() {
    // Subtract 32 from every byte that is at least 'a'.
    let mut asm = Assembler::new();
    asm.label("loop")
        .op(Opcode::In)
        .op(Opcode::Dup)
        .branch(Opcode::Ifeq, "done")
        .op(Opcode::Dup)
        .bipush(b'a' as i8)
        .op(Opcode::Isub)
        .branch(Opcode::Iflt, "print")
        .bipush(32)
        .op(Opcode::Isub)
        .label("print")
        .op(Opcode::Out)
        .branch(Opcode::Goto, "loop")
        .label("done")
        .op(Opcode::Halt);
    let (_, out) = run(&asm.finish().unwrap(), b"Shout, IJVM!");
    assert_eq!(out, "SHOUT, IJVM!");
}

#[test]
fn test_recursive_factorial() {
    // fact(n) = n == 0 ? 1 : n * fact(n - 1), with multiplication done by
    // repeated addition in a helper method.
    let mut asm = Assembler::new();
    asm.bipush(0)
        .bipush(6)
        .invoke("fact")
        .op(Opcode::Halt)
        .method("fact", 2, 0)
        .iload(1)
        .branch(Opcode::Ifeq, "one")
        .bipush(0)
        .iload(1)
        .bipush(0)
        .iload(1)
        .bipush(1)
        .op(Opcode::Isub)
        .invoke("fact")
        .invoke("mul")
        .op(Opcode::Ireturn)
        .label("one")
        .bipush(1)
        .op(Opcode::Ireturn)
        .method("mul", 3, 1)
        .bipush(0)
        .istore(3)
        .label("mul_loop")
        .iload(1)
        .branch(Opcode::Ifeq, "mul_done")
        .iload(3)
        .iload(2)
        .op(Opcode::Iadd)
        .istore(3)
        .iinc(1, -1)
        .branch(Opcode::Goto, "mul_loop")
        .label("mul_done")
        .iload(3)
        .op(Opcode::Ireturn);
    let (machine, _) = run(&asm.finish().unwrap(), b"");
    assert!(machine.halt_flag(), "{:?}", machine.error());
    assert_eq!(machine.tos(), Some(720));
    assert_eq!(machine.frames().len(), 1);
    let stats = machine.stats();
    assert_eq!(stats.invocations, 13);
    assert_eq!(stats.max_call_depth, 7);
}

#[test]
fn test_arrays_survive_gc_through_locals() {
    let mut asm = Assembler::new();
    asm.bipush(4)
        .op(Opcode::NewArray)
        .istore(0)
        // a[2] = 42
        .bipush(42)
        .bipush(2)
        .iload(0)
        .op(Opcode::Iastore)
        // garbage
        .bipush(100)
        .op(Opcode::NewArray)
        .op(Opcode::Pop)
        .op(Opcode::Gc)
        .bipush(2)
        .iload(0)
        .op(Opcode::Iaload)
        .op(Opcode::Halt);
    let (machine, _) = run(&asm.finish().unwrap(), b"");
    assert!(machine.halt_flag(), "{:?}", machine.error());
    assert_eq!(machine.tos(), Some(42));
    assert_eq!(machine.heap().len(), 1);
    assert_eq!(machine.stats().gc.arrays_freed, 1);
}

/// Builds outer -> middle -> inner, keeping only `outer` on the stack.
fn nested_arrays() -> Program {
    let mut asm = Assembler::new();
    asm.bipush(1)
        .op(Opcode::NewArray)
        .istore(0)
        .bipush(1)
        .op(Opcode::NewArray)
        .istore(1)
        .bipush(1)
        .op(Opcode::NewArray)
        // middle[0] = inner
        .bipush(0)
        .iload(1)
        .op(Opcode::Iastore)
        // outer[0] = middle
        .iload(1)
        .bipush(0)
        .iload(0)
        .op(Opcode::Iastore)
        // drop the only stack copy of middle
        .bipush(0)
        .istore(1)
        .op(Opcode::Gc)
        .op(Opcode::Halt);
    asm.finish().unwrap()
}

#[test]
fn test_shallow_gc_keeps_one_hop() {
    let (machine, _) = run(&nested_arrays(), b"");
    assert!(machine.halt_flag(), "{:?}", machine.error());
    // outer is a root, middle is one hop away, inner is two.
    assert_eq!(machine.heap().len(), 2);
}

#[test]
fn test_transitive_gc_from_config() {
    let config = RuntimeConfig {
        gc_mode: GcMode::Transitive,
        ..Default::default()
    };
    let (machine, _) = run_with(&nested_arrays(), b"", config);
    assert!(machine.halt_flag(), "{:?}", machine.error());
    assert_eq!(machine.heap().len(), 3);
}

#[test]
fn test_heap_limit_collects_and_retries() {
    let mut asm = Assembler::new();
    asm.bipush(100)
        .istore(0)
        .label("loop")
        .iload(0)
        .branch(Opcode::Ifeq, "done")
        .bipush(64)
        .op(Opcode::NewArray)
        .op(Opcode::Pop)
        .iinc(0, -1)
        .branch(Opcode::Goto, "loop")
        .label("done")
        .op(Opcode::Halt);
    let config = RuntimeConfig {
        heap_limit: Some(256),
        ..Default::default()
    };
    let (machine, _) = run_with(&asm.finish().unwrap(), b"", config);
    assert!(machine.halt_flag(), "{:?}", machine.error());
    let gc = machine.stats().gc;
    assert_eq!(gc.arrays_allocated, 100);
    assert!(gc.cycles > 0);
    assert!(machine.heap().live_words() <= 256);
}

#[test]
fn test_heap_limit_exhausted_is_fatal() {
    let mut asm = Assembler::new();
    asm.label("loop")
        .bipush(64)
        .op(Opcode::NewArray)
        .branch(Opcode::Goto, "loop");
    let config = RuntimeConfig {
        heap_limit: Some(128),
        ..Default::default()
    };
    let (machine, _) = run_with(&asm.finish().unwrap(), b"", config);
    assert!(matches!(machine.error(), Some(VmError::Heap(_))));
    assert_eq!(machine.heap().len(), 2);
}

#[test]
fn test_network_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).unwrap();
        stream.write_all(&[byte[0] + 1]).unwrap();
    });

    let mut asm = Assembler::new();
    asm.push_word(0x7F00_0001)
        .push_word(port as i32)
        .op(Opcode::NetConnect)
        .istore(0)
        .bipush(b'h' as i8)
        .iload(0)
        .op(Opcode::NetOut)
        .iload(0)
        .op(Opcode::NetIn)
        .op(Opcode::Out)
        .iload(0)
        .op(Opcode::NetClose)
        .op(Opcode::Halt);
    let (machine, out) = run(&asm.finish().unwrap(), b"");
    peer.join().unwrap();
    assert!(machine.halt_flag(), "{:?}", machine.error());
    assert_eq!(out, "i");
    assert!(machine.connections().is_empty());
}

#[test]
fn test_failed_connect_pushes_zero() {
    // Grab a free port and release it so nothing listens there.
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut asm = Assembler::new();
    asm.push_word(0x7F00_0001)
        .push_word(port as i32)
        .op(Opcode::NetConnect)
        .op(Opcode::Halt);
    let (machine, _) = run(&asm.finish().unwrap(), b"");
    assert!(machine.halt_flag());
    assert_eq!(machine.tos(), Some(0));
}

#[test]
fn test_fatal_error_stops_the_run() {
    let mut asm = Assembler::new();
    asm.bipush(b'a' as i8)
        .op(Opcode::Out)
        .op(Opcode::Err)
        .bipush(b'b' as i8)
        .op(Opcode::Out)
        .op(Opcode::Halt);
    let (mut machine, out) = run(&asm.finish().unwrap(), b"");
    assert_eq!(out, "a");
    assert!(matches!(
        machine.error(),
        Some(VmError::ErrInstruction { pc: 3 })
    ));
    assert!(machine.finished());
    assert!(!machine.step());
}

#[test]
fn test_load_errors_leave_machine_empty() {
    let mut machine = Machine::default();

    let mut bad_magic = NamedTempFile::new().unwrap();
    bad_magic.write_all(&[0xCA, 0xFE, 0xBA, 0xBE]).unwrap();
    assert!(matches!(
        machine.init(bad_magic.path()),
        Err(VmError::Load(BytecodeError::InvalidMagic(0xCAFE_BABE)))
    ));
    assert!(!machine.is_loaded());

    let program = Program::new(vec![1, 2], vec![0x00, 0xFF]);
    let mut bytes = bytecode::serialize(&program);
    bytes.truncate(bytes.len() - 1);
    let mut truncated = NamedTempFile::new().unwrap();
    truncated.write_all(&bytes).unwrap();
    assert!(matches!(
        machine.init(truncated.path()),
        Err(VmError::Load(BytecodeError::UnexpectedEof(_)))
    ));
    assert!(!machine.is_loaded());

    assert!(matches!(
        machine.init(std::path::Path::new("/nonexistent/program.ijvm")),
        Err(VmError::Load(BytecodeError::Open { .. }))
    ));
    assert!(matches!(machine.run(), Err(VmError::NotLoaded)));
}

#[test]
fn test_trailing_symbols_are_ignored_by_loader() {
    let mut asm = Assembler::new();
    asm.label("main")
        .bipush(b'!' as i8)
        .op(Opcode::Out)
        .op(Opcode::Halt);
    let program = asm.finish().unwrap();
    let mut bytes = bytecode::serialize(&program);
    symbols::write_symbols(&mut bytes, &asm.method_symbols(), &asm.label_symbols()).unwrap();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();

    let output = SharedOutput::new();
    let mut machine = Machine::default();
    machine.set_output(output.clone());
    machine.init(file.path()).unwrap();
    assert_eq!(machine.code(), program.code.as_slice());
    machine.run().unwrap();
    assert_eq!(output.to_string_lossy(), "!");
    assert_eq!(symbols::load(file.path()).unwrap().lookup("main"), Some(0));
}

#[test]
fn test_destroy_and_reload() {
    let mut first = Assembler::new();
    first
        .bipush(8)
        .op(Opcode::NewArray)
        .op(Opcode::Halt);
    let mut second = Assembler::new();
    second.bipush(7).op(Opcode::Halt);

    let file_a = write_binary(&first.finish().unwrap());
    let file_b = write_binary(&second.finish().unwrap());

    let mut machine = Machine::default();
    machine.init(file_a.path()).unwrap();
    machine.run().unwrap();
    assert_eq!(machine.heap().len(), 1);

    machine.destroy();
    machine.destroy();
    assert!(!machine.is_loaded());
    assert!(machine.heap().is_empty());

    machine.init(file_b.path()).unwrap();
    assert_eq!(machine.program_counter(), 0);
    assert!(!machine.halt_flag());
    machine.run().unwrap();
    assert_eq!(machine.tos(), Some(7));
    assert_eq!(machine.stats().gc.arrays_allocated, 0);
}

#[test]
fn test_main_locals_sized_from_code() {
    let mut asm = Assembler::new();
    asm.bipush(5)
        .istore(300)
        .iload(300)
        .op(Opcode::Halt);
    let file = write_binary(&asm.finish().unwrap());
    let mut machine = Machine::default();
    machine.init(file.path()).unwrap();
    assert_eq!(machine.locals().len(), 301);
    assert_eq!(machine.registers().sp, 301);
    machine.run().unwrap();
    assert_eq!(machine.local(300), Some(5));
    assert_eq!(machine.operand_stack(), &[5]);
}
