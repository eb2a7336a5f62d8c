//! Lox CLI
//!
//! `lox <script.lox>` compiles and runs a file: program output on
//! stdout, diagnostics on stderr. Exit codes follow sysexits: 65 for
//! compile errors, 70 for runtime errors, 64/66 for usage and missing
//! files.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser};
use clap_complete::{Shell, generate};

use lox_core::Heap;
use lox_runtime::{InterpretResult, Vm, disassemble_source};

#[derive(Parser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox interpreter - compile and run .lox programs", long_about = None)]
struct Cli {
    /// Lox source file to run
    script: Option<PathBuf>,

    /// Print the bytecode listing before executing
    #[arg(long)]
    disassemble: bool,

    /// Dump the value stack after every instruction (to stderr)
    #[arg(long)]
    trace: bool,

    /// Initial garbage collection threshold in bytes
    #[arg(long, value_name = "BYTES")]
    gc_threshold: Option<usize>,

    /// Generate shell completion scripts and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        generate(shell, &mut Cli::command(), "lox", &mut io::stdout());
        return;
    }

    let Some(script) = cli.script else {
        eprintln!("Usage: lox [OPTIONS] <SCRIPT>");
        eprintln!("The interactive REPL is not implemented; pass a .lox file.");
        process::exit(64);
    };

    let source = match fs::read_to_string(&script) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Error reading {}: {}", script.display(), error);
            process::exit(66);
        }
    };

    if cli.disassemble {
        match disassemble_source(&source) {
            Ok(listing) => print!("{listing}"),
            Err(diagnostics) => {
                eprintln!("{diagnostics}");
                process::exit(65);
            }
        }
    }

    let heap = match cli.gc_threshold {
        Some(bytes) => Heap::with_threshold(bytes),
        None => Heap::new(),
    };
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let mut vm = Vm::with_heap(&mut stdout, heap)
        .error_sink(&mut stderr)
        .trace_execution(cli.trace);

    match vm.interpret(&source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => process::exit(65),
        InterpretResult::RuntimeError => process::exit(70),
    }
}
