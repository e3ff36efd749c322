//! Thin CLI front-end: a standalone binary built on top of the library
//! crate. Argument parsing, file reading, and wiring the host callbacks to
//! stdio — no interpreter logic lives here.
//!
//! `clap` derive drives a flat `lumen [-v|--version] [path]` surface (no
//! subcommands needed), a dedicated worker thread runs the interpreter
//! with an enlarged stack so deeply recursive scripts don't blow the
//! default thread stack, and `ExitCode` reports the result the way a
//! Unix tool is expected to.

use clap::Parser;
use lumen::{new_vm, Configuration, InterpretResult};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

const STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "lumen", about = "Lumen: an embeddable, class-based, concurrent scripting language", version)]
struct Cli {
    /// Print the version and exit. Lowercase `-v` rather than clap's
    /// default `-V`.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Script to run. Omit to start the REPL.
    path: Option<PathBuf>,
}

fn main() -> ExitCode {
    // Run on a dedicated thread with headroom beyond the default 8 MiB
    // stack, since deeply recursive scripts can blow it.
    std::thread::Builder::new()
        .name("lumen-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(run)
        .expect("failed to spawn lumen worker thread")
        .join()
        .unwrap_or(ExitCode::from(70))
}

fn run() -> ExitCode {
    let cli = Cli::parse();
    match cli.path {
        Some(path) => run_file(&path),
        None => run_repl(),
    }
}

/// Exit codes: 65 for a compile error, 70 for a runtime error.
fn exit_code_for(result: InterpretResult) -> ExitCode {
    match result {
        InterpretResult::Success => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(65),
        InterpretResult::RuntimeError => ExitCode::from(70),
    }
}

fn run_file(path: &std::path::Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("lumen: cannot read '{}': {}", path.display(), e);
            return ExitCode::from(65);
        }
    };
    let module_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("main").to_string();
    let mut vm = new_vm(Configuration::default());
    let result = vm.interpret(&module_name, &source);
    let _ = std::io::stdout().flush();
    exit_code_for(result)
}

/// A line-at-a-time REPL over a single persistent module: every line is
/// compiled and run against the same `"main"` module object, so `var`
/// declarations from earlier lines stay visible.
fn run_repl() -> ExitCode {
    let mut vm = new_vm(Configuration::default());
    println!("lumen (type Ctrl-D to exit)");
    loop {
        print!("> ");
        if std::io::stdout().flush().is_err() {
            break;
        }
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(_) => break,
        }
        if line.trim().is_empty() {
            continue;
        }
        vm.interpret("main", &line);
    }
    println!();
    ExitCode::SUCCESS
}
