use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ijvm::config::{GcMode, RuntimeConfig, StatsFormat};
use ijvm::vm::{Machine, MachineStats, VmError, bytecode, dump};
use ijvm::{debugger, signal};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GcModeArg {
    Shallow,
    Transitive,
}

impl From<GcModeArg> for GcMode {
    fn from(arg: GcModeArg) -> Self {
        match arg {
            GcModeArg::Shallow => GcMode::Shallow,
            GcModeArg::Transitive => GcMode::Transitive,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

impl From<StatsFormatArg> for StatsFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Human => StatsFormat::Human,
            StatsFormatArg::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "ijvm")]
#[command(about = "An IJVM bytecode interpreter", long_about = None)]
struct Cli {
    /// Log machine events to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an IJVM binary
    Run {
        /// The binary to run
        binary: PathBuf,

        /// Read program input from a file instead of stdin
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Write program output to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Runtime configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Array reachability used by GC (shallow, transitive)
        #[arg(long, value_enum)]
        gc_mode: Option<GcModeArg>,

        /// Maximum stack size in words
        #[arg(long, value_name = "WORDS")]
        stack_limit: Option<usize>,

        /// Maximum live array words [default: 268435456]
        #[arg(long, value_name = "WORDS")]
        heap_limit: Option<usize>,

        /// Print GC statistics
        #[arg(long)]
        gc_stats: bool,

        /// Print machine statistics (human or json format)
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        stats: Option<StatsFormatArg>,
    },
    /// Disassemble an IJVM binary
    Dump {
        /// The binary to disassemble
        binary: PathBuf,
    },
    /// Debug an IJVM binary with the TUI debugger
    Debug {
        /// The binary to debug (can also be loaded with `file`)
        binary: Option<PathBuf>,

        /// Runtime configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "ijvm=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, String> {
    match path {
        Some(path) => RuntimeConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(RuntimeConfig::default()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // The debugger owns the terminal; log lines would corrupt the screen.
    if !matches!(cli.command, Commands::Debug { .. }) {
        init_tracing(cli.verbose);
    }

    match cli.command {
        Commands::Run {
            binary,
            input,
            output,
            config,
            gc_mode,
            stack_limit,
            heap_limit,
            gc_stats,
            stats,
        } => {
            let mut config = match load_config(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            // Flags override the configuration file
            if let Some(mode) = gc_mode {
                config.gc_mode = mode.into();
            }
            if let Some(limit) = stack_limit {
                config.stack_limit = limit;
            }
            if heap_limit.is_some() {
                config.heap_limit = heap_limit;
            }
            config.gc_stats |= gc_stats;
            if let Some(format) = stats {
                config.stats = Some(format.into());
            }

            return run_binary(&binary, input.as_deref(), output.as_deref(), config);
        }
        Commands::Dump { binary } => match bytecode::load(&binary) {
            Ok(program) => print!("{}", dump::disassemble(&program)),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        Commands::Debug { binary, config } => {
            let result = load_config(config.as_deref())
                .and_then(|config| debugger::run_debugger(binary.as_deref(), config));
            if let Err(e) = result {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

fn run_binary(
    binary: &Path,
    input: Option<&Path>,
    output: Option<&Path>,
    config: RuntimeConfig,
) -> ExitCode {
    let mut machine = Machine::new(config);

    if let Some(path) = input {
        match File::open(path) {
            Ok(file) => machine.set_input(BufReader::new(file)),
            Err(e) => {
                eprintln!("error: cannot open {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }
    if let Some(path) = output {
        match File::create(path) {
            Ok(file) => machine.set_output(BufWriter::new(file)),
            Err(e) => {
                eprintln!("error: cannot create {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = machine.init(binary) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    machine.set_interrupt(signal::install());

    let outcome = match machine.run() {
        Ok(()) => Ok(()),
        Err(VmError::Interrupted) => Err(None),
        Err(e) => Err(Some(e.to_string())),
    };
    report(&machine);

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(None) => {
            eprintln!("interrupted");
            machine.terminate_now(signal::EXIT_INTERRUPTED)
        }
        Err(Some(e)) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Print the statistics requested by the configuration to stderr.
fn report(machine: &Machine) {
    let stats = machine.stats();
    if machine.config().gc_stats {
        eprintln!(
            "[GC] Collections: {}, Arrays allocated: {}, Arrays freed: {}, Live arrays: {}",
            stats.gc.cycles,
            stats.gc.arrays_allocated,
            stats.gc.arrays_freed,
            machine.heap().len()
        );
    }
    match machine.config().stats {
        Some(StatsFormat::Human) => print_human(&stats),
        Some(StatsFormat::Json) => match serde_json::to_string(&stats) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("error: {}", e),
        },
        None => {}
    }
}

fn print_human(stats: &MachineStats) {
    eprintln!("instructions:    {}", stats.instructions);
    eprintln!("invocations:     {}", stats.invocations);
    eprintln!("max call depth:  {}", stats.max_call_depth);
    eprintln!("max stack words: {}", stats.max_stack_words);
    eprintln!(
        "gc cycles:       {} ({} arrays allocated, {} freed)",
        stats.gc.cycles, stats.gc.arrays_allocated, stats.gc.arrays_freed
    );
}
