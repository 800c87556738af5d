use ijvm::vm::{Assembler, Machine, MachineStats, Opcode, Program};
use serde::Serialize;
use std::io;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    ijvm_secs: f64,
    rust_time_secs: f64,
    stats: MachineStats,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

const SUM_LOOP_N: i32 = 1_000_000;
const FIBONACCI_N: i8 = 25;
const CHURN_N: i32 = 50_000;

// Rust reference implementations

fn rust_sum_loop() {
    let mut sum: i32 = 0;
    let mut i = SUM_LOOP_N;
    while i != 0 {
        sum = sum.wrapping_add(i);
        i -= 1;
    }
    eprintln!("{}", sum);
}

fn rust_fibonacci(n: i32) -> i32 {
    if n < 2 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

fn rust_array_churn() {
    let mut live = 0usize;
    for i in (1..=CHURN_N).rev() {
        let array = vec![0i32; 16];
        live += array.len();
        if i & 63 == 0 {
            live = 0;
        }
    }
    eprintln!("{}", live);
}

// IJVM programs

fn sum_loop() -> Program {
    let mut asm = Assembler::new();
    asm.bipush(0)
        .istore(0)
        .push_word(SUM_LOOP_N)
        .istore(1)
        .label("loop")
        .iload(1)
        .branch(Opcode::Ifeq, "done")
        .iload(0)
        .iload(1)
        .op(Opcode::Iadd)
        .istore(0)
        .iinc(1, -1)
        .branch(Opcode::Goto, "loop")
        .label("done")
        .op(Opcode::Halt);
    asm.finish().expect("sum_loop assembles")
}

fn fibonacci() -> Program {
    let mut asm = Assembler::new();
    asm.bipush(0)
        .bipush(FIBONACCI_N)
        .invoke("fib")
        .op(Opcode::Pop)
        .op(Opcode::Halt)
        .method("fib", 2, 0)
        .iload(1)
        .bipush(2)
        .op(Opcode::Isub)
        .branch(Opcode::Iflt, "base")
        .bipush(0)
        .iload(1)
        .bipush(1)
        .op(Opcode::Isub)
        .invoke("fib")
        .bipush(0)
        .iload(1)
        .bipush(2)
        .op(Opcode::Isub)
        .invoke("fib")
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn)
        .label("base")
        .iload(1)
        .op(Opcode::Ireturn);
    asm.finish().expect("fibonacci assembles")
}

fn array_churn() -> Program {
    let mut asm = Assembler::new();
    asm.push_word(CHURN_N)
        .istore(0)
        .label("loop")
        .iload(0)
        .branch(Opcode::Ifeq, "done")
        .bipush(16)
        .op(Opcode::NewArray)
        .op(Opcode::Pop)
        .iload(0)
        .bipush(63)
        .op(Opcode::Iand)
        .branch(Opcode::Ifeq, "collect")
        .branch(Opcode::Goto, "next")
        .label("collect")
        .op(Opcode::Gc)
        .label("next")
        .iinc(0, -1)
        .branch(Opcode::Goto, "loop")
        .label("done")
        .op(Opcode::Halt);
    asm.finish().expect("array_churn assembles")
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce(),
{
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn run_ijvm_benchmark(name: &str, program: Program) -> (f64, MachineStats) {
    let mut machine = Machine::default();
    machine.set_output(io::sink());
    if let Err(e) = machine.load(program) {
        eprintln!("IJVM benchmark {} failed to load: {}", name, e);
        return (0.0, MachineStats::default());
    }

    let start = Instant::now();
    if let Err(e) = machine.run() {
        eprintln!("IJVM benchmark {} failed: {}", name, e);
    }
    let elapsed = start.elapsed().as_secs_f64();
    (elapsed, machine.stats())
}

fn main() {
    let mut results = Vec::new();

    // sum_loop benchmark
    let rust_time = time_rust(rust_sum_loop);
    let (ijvm, stats) = run_ijvm_benchmark("sum_loop", sum_loop());
    results.push(BenchmarkResult {
        name: "sum_loop".to_string(),
        ijvm_secs: ijvm,
        rust_time_secs: rust_time,
        stats,
    });

    // fibonacci benchmark
    let rust_time = time_rust(|| eprintln!("{}", rust_fibonacci(FIBONACCI_N as i32)));
    let (ijvm, stats) = run_ijvm_benchmark("fibonacci", fibonacci());
    results.push(BenchmarkResult {
        name: "fibonacci".to_string(),
        ijvm_secs: ijvm,
        rust_time_secs: rust_time,
        stats,
    });

    // array_churn benchmark
    let rust_time = time_rust(rust_array_churn);
    let (ijvm, stats) = run_ijvm_benchmark("array_churn", array_churn());
    results.push(BenchmarkResult {
        name: "array_churn".to_string(),
        ijvm_secs: ijvm,
        rust_time_secs: rust_time,
        stats,
    });

    let output = BenchmarkOutput { results };
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
}
