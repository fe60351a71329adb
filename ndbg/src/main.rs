use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;

use ndbg::debugger::{Debugger, ReplInput};
use nula_rt::compile::{compile, CompileOptions};
use nula_rt::vm::stdout_sink;
use nula_rt::Vm;

#[derive(Parser)]
#[command(name = "ndbg")]
#[command(about = "Interactive instruction-level debugger for the Nula VM")]
#[command(version)]
struct Cli {
    /// Script source or pre-compiled bytecode to debug
    file: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let bytes = match fs::read(&cli.file) {
        Ok(b) => b,
        Err(_) => {
            eprintln!("unable to open file");
            return ExitCode::FAILURE;
        }
    };

    // Text files are compiled; anything else is taken as bytecode.
    let blob = if looks_like_source(&bytes) {
        let source = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => {
                eprintln!("unable to read file");
                return ExitCode::FAILURE;
            }
        };
        let opts = CompileOptions {
            optimization: 1, // higher levels harm debuggability
            debug_level: 2,
            type_info: 1,
            coverage: 1,
        };
        match compile(&source, &opts) {
            Ok(blob) => blob,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        bytes
    };

    let mut vm = Vm::new();
    let dbg = Rc::new(RefCell::new(Debugger::new(
        ReplInput::editor(),
        stdout_sink(),
    )));
    Debugger::attach(dbg.clone(), &mut vm);

    let chunkname = format!("@{}", cli.file.display());
    let closure = match vm.load_blob(&blob, &chunkname) {
        Ok(c) => c,
        Err(_) => {
            eprintln!("invalid or corrupted bytecode");
            return ExitCode::FAILURE;
        }
    };
    if let Some(proto) = vm.function_proto(closure) {
        dbg.borrow_mut().registry.collect(&proto);
    }

    match vm.pcall(closure, &[], 0) {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) if vm.interrupted() => ExitCode::SUCCESS,
        Err(e) => {
            dbg.borrow_mut().report_script_error(&e);
            ExitCode::SUCCESS
        }
    }
}

/// A file whose first two bytes are printable is treated as source text.
fn looks_like_source(bytes: &[u8]) -> bool {
    let mut head = bytes.iter().take(2);
    head.all(|&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7f).contains(&b))
}
