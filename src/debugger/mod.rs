//! Interactive TUI debugger for IJVM binaries.

pub mod symbols;

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::vm::dump::{self, Line};
use crate::vm::{Machine, Opcode, Program, SharedOutput};
use symbols::Symbols;

const HELP: &str = "Commands: file <path> | input <path> | b(reak) <addr|symbol> | d(elete) <addr|symbol> | s(tep) [n] | c(ontinue) | r(un) | i(nfo) | bt | h(elp) | q(uit)";

/// Where the debuggee is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No program loaded.
    Empty,
    /// Loaded, no instruction executed yet.
    Loaded,
    Started,
    /// Halted, ran off the end, or stopped on a fatal error.
    Finished,
}

/// Debugger state.
pub struct Debugger {
    machine: Machine,
    output: SharedOutput,
    program_path: Option<PathBuf>,
    input_path: Option<PathBuf>,
    symbols: Symbols,
    listing: Vec<Line>,
    breakpoints: BTreeSet<usize>,
    state: State,
    /// Cleared by `quit`.
    running: bool,
    input: String,
    status: String,
}

impl Debugger {
    /// Create a debugger, loading `path` if one is given.
    pub fn new(path: Option<&Path>) -> Result<Self, String> {
        Self::with_config(path, RuntimeConfig::default())
    }

    pub fn with_config(path: Option<&Path>, config: RuntimeConfig) -> Result<Self, String> {
        let output = SharedOutput::new();
        let mut machine = Machine::new(config);
        machine.set_output(output.clone());
        machine.set_input(io::empty());

        let mut debugger = Self {
            machine,
            output,
            program_path: None,
            input_path: None,
            symbols: Symbols::default(),
            listing: Vec::new(),
            breakpoints: BTreeSet::new(),
            state: State::Empty,
            running: true,
            input: String::new(),
            status: "Ready. Type 'h' for help.".to_string(),
        };
        if let Some(path) = path {
            debugger.load_file(path)?;
        }
        Ok(debugger)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn breakpoints(&self) -> &BTreeSet<usize> {
        &self.breakpoints
    }

    /// Everything the program has written so far.
    pub fn output(&self) -> String {
        self.output.to_string_lossy()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // ========================================
    // Program loading
    // ========================================

    fn load_file(&mut self, path: &Path) -> Result<(), String> {
        self.state = State::Empty;
        self.listing.clear();
        self.symbols = Symbols::default();
        self.machine.init(path).map_err(|e| e.to_string())?;
        self.symbols = symbols::load(path).map_err(|e| e.to_string())?;
        self.program_path = Some(path.to_path_buf());
        self.reset_io()?;

        let program = Program::new(
            self.machine.constants().to_vec(),
            self.machine.code().to_vec(),
        );
        self.listing = dump::decode(&program);
        self.state = State::Loaded;
        self.status = if self.symbols.is_empty() {
            format!("Loaded {} (no debug symbols)", path.display())
        } else {
            format!(
                "Loaded {} ({} functions, {} labels)",
                path.display(),
                self.symbols.functions.len(),
                self.symbols.labels.len()
            )
        };
        debug!(path = %path.display(), "debugger loaded program");
        Ok(())
    }

    /// Reload the current program from disk, keeping breakpoints.
    fn reload(&mut self) -> Result<(), String> {
        let Some(path) = self.program_path.clone() else {
            return Err("No program loaded.".to_string());
        };
        if let Err(e) = self.machine.init(&path) {
            self.state = State::Empty;
            return Err(e.to_string());
        }
        self.reset_io()?;
        self.state = State::Loaded;
        Ok(())
    }

    fn reset_io(&mut self) -> Result<(), String> {
        self.output.clear();
        match &self.input_path {
            Some(path) => {
                let file = File::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
                self.machine.set_input(io::BufReader::new(file));
            }
            None => self.machine.set_input(io::empty()),
        }
        Ok(())
    }

    fn set_input_file(&mut self, path: &Path) {
        match File::open(path) {
            Ok(file) => {
                self.machine.set_input(io::BufReader::new(file));
                self.input_path = Some(path.to_path_buf());
                self.status = format!("Program input read from {}", path.display());
            }
            Err(e) => self.status = format!("{}: {e}", path.display()),
        }
    }

    // ========================================
    // Execution
    // ========================================

    /// Execute one instruction.
    fn step(&mut self) {
        match self.state {
            State::Empty => {
                self.status = "No program loaded.".to_string();
                return;
            }
            State::Finished => {
                self.status = "Program has ended.".to_string();
                return;
            }
            State::Loaded | State::Started => {}
        }

        self.state = State::Started;
        self.machine.step();
        if self.machine.finished() {
            self.finish();
        } else {
            self.status = format!(
                "PC: 0x{:04X}, Stack size: {}",
                self.machine.program_counter(),
                self.machine.stack_size()
            );
        }
    }

    fn finish(&mut self) {
        self.state = State::Finished;
        self.status = match self.machine.error() {
            Some(err) => format!("Fatal error: {err}"),
            None if self.machine.halt_flag() => "Program halted.".to_string(),
            None => "Program finished.".to_string(),
        };
    }

    /// Continue execution until breakpoint or end.
    fn continue_exec(&mut self) {
        loop {
            self.step();
            if self.state != State::Started {
                break;
            }
            // Check breakpoints
            let pc = self.machine.program_counter();
            if self.breakpoints.contains(&pc) {
                self.status = format!("Breakpoint hit at {}", self.describe(pc));
                break;
            }
        }
    }

    /// Resolve a numeric address (hex with `0x`, or decimal) or a symbol.
    fn resolve(&self, arg: &str) -> Option<usize> {
        let number = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
            Some(hex) => usize::from_str_radix(hex, 16).ok(),
            None => arg.parse::<usize>().ok(),
        };
        if number.is_some() {
            return number;
        }
        // Method symbols name the header; stop on the first instruction.
        if let Some(f) = self.symbols.functions.iter().find(|s| s.name == arg) {
            return Some(f.address as usize + 4);
        }
        self.symbols.lookup(arg).map(|a| a as usize)
    }

    fn describe(&self, address: usize) -> String {
        if let Some(name) = self.symbols.name_at(address) {
            return format!("0x{address:04X} <{name}>");
        }
        match self.symbols.function_at(address) {
            Some(f) => format!(
                "0x{address:04X} <{}+{}>",
                f.name,
                address - f.address as usize
            ),
            None => format!("0x{address:04X}"),
        }
    }

    /// Set a breakpoint at an address.
    fn set_breakpoint(&mut self, address: usize) {
        self.breakpoints.insert(address);
        self.status = format!("Breakpoint set at {}", self.describe(address));
    }

    /// Delete a breakpoint at an address.
    fn delete_breakpoint(&mut self, address: usize) {
        if self.breakpoints.remove(&address) {
            self.status = format!("Breakpoint deleted at {}", self.describe(address));
        } else {
            self.status = format!("No breakpoint at 0x{address:04X}");
        }
    }

    fn info(&self) -> String {
        if self.state == State::Empty {
            return "No program loaded.".to_string();
        }
        let regs = self.machine.registers();
        let stats = self.machine.stats();
        let op = self
            .machine
            .current_instruction()
            .map(|b| Opcode::from_byte(b).map_or(format!("0x{b:02X}"), |op| op.to_string()))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{:?} | pc={} ({op}) sp={} fp={} lv={} nv={} | tos={} | arrays={} conns={} | steps={}",
            self.state,
            self.describe(regs.pc),
            regs.sp,
            regs.fp,
            regs.lv,
            regs.nv,
            self.machine
                .tos()
                .map_or("-".to_string(), |v| v.to_string()),
            self.machine.heap().len(),
            self.machine.connections().len(),
            stats.instructions
        )
    }

    fn backtrace(&self) -> String {
        if self.state == State::Empty {
            return "No program loaded.".to_string();
        }
        let mut at = self.machine.program_counter();
        let mut entries = Vec::new();
        for (i, frame) in self.machine.frames().iter().enumerate() {
            entries.push(format!("#{i} {}", self.describe(at)));
            match frame.return_pc {
                Some(pc) => at = pc,
                None => break,
            }
        }
        format!("Stack: {}", entries.join(" <- "))
    }

    /// Process a command.
    pub fn process_command(&mut self, cmd: &str) {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        if parts.is_empty() {
            return;
        }

        match parts[0] {
            "file" => match parts.get(1) {
                Some(path) => {
                    if let Err(e) = self.load_file(Path::new(path)) {
                        self.status = format!("Failed to load {path}: {e}");
                    }
                }
                None => self.status = "Usage: file <path>".to_string(),
            },
            "input" => match parts.get(1) {
                Some(path) => self.set_input_file(Path::new(path)),
                None => self.status = "Usage: input <path>".to_string(),
            },
            "s" | "step" => {
                let count = match parts.get(1).map(|n| n.parse::<usize>()) {
                    None => 1,
                    Some(Ok(n)) => n,
                    Some(Err(_)) => {
                        self.status = "Usage: step [count]".to_string();
                        return;
                    }
                };
                for _ in 0..count {
                    self.step();
                    if self.state != State::Started {
                        break;
                    }
                }
            }
            "c" | "continue" => self.continue_exec(),
            "r" | "run" => match self.reload() {
                Ok(()) => self.continue_exec(),
                Err(e) => self.status = e,
            },
            "b" | "break" => match parts.get(1) {
                Some(arg) => match self.resolve(arg) {
                    Some(address) => self.set_breakpoint(address),
                    None => self.status = format!("Unknown address or symbol: {arg}"),
                },
                None => {
                    let bps: Vec<String> = self
                        .breakpoints
                        .iter()
                        .map(|&a| self.describe(a))
                        .collect();
                    self.status = format!("Breakpoints: {}", bps.join(", "));
                }
            },
            "d" | "delete" => match parts.get(1) {
                Some(arg) => match self.resolve(arg) {
                    Some(address) => self.delete_breakpoint(address),
                    None => self.status = format!("Unknown address or symbol: {arg}"),
                },
                None => self.status = "Usage: delete <addr|symbol>".to_string(),
            },
            "i" | "info" => self.status = self.info(),
            "bt" | "backtrace" => self.status = self.backtrace(),
            "q" | "quit" => {
                self.running = false;
            }
            "h" | "help" => {
                self.status = HELP.to_string();
            }
            _ => {
                self.status = format!("Unknown command: {}", parts[0]);
            }
        }
    }

    // ========================================
    // Terminal UI
    // ========================================

    /// Run the debugger TUI.
    pub fn run(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        stdout.execute(EnterAlternateScreen)?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        while self.running {
            terminal.draw(|frame| self.ui(frame))?;

            if let Event::Key(key) = event::read()?
                && key.kind == KeyEventKind::Press
            {
                match key.code {
                    KeyCode::Enter => {
                        let cmd = self.input.clone();
                        self.input.clear();
                        self.process_command(&cmd);
                    }
                    KeyCode::Char(c) => {
                        self.input.push(c);
                    }
                    KeyCode::Backspace => {
                        self.input.pop();
                    }
                    KeyCode::Esc => {
                        self.running = false;
                    }
                    _ => {}
                }
            }
        }

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        Ok(())
    }

    fn ui(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(10),   // Code + machine state
                Constraint::Length(6), // Output
                Constraint::Length(3), // Status
                Constraint::Length(3), // Input
            ])
            .split(frame.area());

        let top = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(chunks[0]);

        // Code view
        let pc = self.machine.program_counter();
        let live = matches!(self.state, State::Loaded | State::Started);
        let mut selected = None;
        let mut code_items: Vec<ListItem> = Vec::new();
        for line in &self.listing {
            if let Some(name) = self.symbols.name_at(line.address) {
                code_items.push(
                    ListItem::new(format!("{name}:")).style(Style::default().fg(Color::Yellow)),
                );
            }
            let current = live && line.address == pc;
            let prefix = if self.breakpoints.contains(&line.address) {
                "●"
            } else {
                " "
            };
            let marker = if current { "▶" } else { " " };
            let content = format!("{}{} 0x{:04X} │ {}", prefix, marker, line.address, line.text);
            let style = if current {
                selected = Some(code_items.len());
                Style::default().bg(Color::DarkGray)
            } else {
                Style::default()
            };
            code_items.push(ListItem::new(content).style(style));
        }
        let code =
            List::new(code_items).block(Block::default().title("Code").borders(Borders::ALL));
        let mut code_state = ListState::default().with_selected(selected);
        frame.render_stateful_widget(code, top[0], &mut code_state);

        // Stack, locals and frames
        let side = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Percentage(40),
                Constraint::Percentage(35),
                Constraint::Percentage(25),
            ])
            .split(top[1]);

        let stack_text: Vec<String> = self
            .machine
            .operand_stack()
            .iter()
            .rev()
            .take(side[0].height.saturating_sub(2) as usize)
            .map(|v| format!("{v:>11}  0x{:08X}", *v as u32))
            .collect();
        let stack = Paragraph::new(stack_text.join("\n"))
            .block(Block::default().title("Stack").borders(Borders::ALL));
        frame.render_widget(stack, side[0]);

        let locals_text: Vec<String> = self
            .machine
            .locals()
            .iter()
            .enumerate()
            .map(|(i, v)| format!("[{i}] = {v}"))
            .collect();
        let locals = Paragraph::new(locals_text.join("\n"))
            .block(Block::default().title("Locals").borders(Borders::ALL));
        frame.render_widget(locals, side[1]);

        let frames_text = if self.state == State::Empty {
            String::new()
        } else {
            self.machine
                .frames()
                .iter()
                .enumerate()
                .map(|(i, f)| format!("#{i} lv={} nv={} fp={}", f.lv, f.nv, f.fp))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let frames = Paragraph::new(frames_text)
            .block(Block::default().title("Frames").borders(Borders::ALL));
        frame.render_widget(frames, side[2]);

        // Output
        let output = self.output();
        let lines: Vec<&str> = output.lines().collect();
        let visible = chunks[1].height.saturating_sub(2) as usize;
        let output_text = lines[lines.len().saturating_sub(visible)..].join("\n");
        let output = Paragraph::new(output_text)
            .block(Block::default().title("Output").borders(Borders::ALL));
        frame.render_widget(output, chunks[1]);

        // Status
        let status = Paragraph::new(self.status.clone())
            .block(Block::default().title("Status").borders(Borders::ALL));
        frame.render_widget(status, chunks[2]);

        // Input
        let input = Paragraph::new(format!("(ijdb) {}", self.input))
            .block(Block::default().title("Command").borders(Borders::ALL));
        frame.render_widget(input, chunks[3]);
    }
}

/// Run the debugger, optionally on a file.
pub fn run_debugger(path: Option<&Path>, config: RuntimeConfig) -> Result<(), String> {
    let mut debugger = Debugger::with_config(path, config)?;
    debugger.run().map_err(|e| e.to_string())
}
