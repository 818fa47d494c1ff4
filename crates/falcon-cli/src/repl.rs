//! Interactive read-eval-print loop, line editing via `rustyline`.

use std::path::PathBuf;

use falcon_vm::{FalconError, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::exit_code;

fn history_path() -> PathBuf {
    std::env::var_os("FALCON_HISTFILE").map(PathBuf::from).unwrap_or_else(|| {
        let mut p = dirs_home();
        p.push(".falcon_history");
        p
    })
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

pub fn run(vm: &mut Vm, debug: bool) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("error: could not start the line editor: {e}");
            return exit_code::IO_ERROR;
        }
    };
    let history = history_path();
    let _ = editor.load_history(&history);

    loop {
        match editor.readline("falcon> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                eval_line(vm, &line, debug);
            }
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => continue,
            Err(e) => {
                eprintln!("error: {e}");
                break;
            }
        }
    }

    let _ = editor.save_history(&history);
    exit_code::OK
}

fn eval_line(vm: &mut Vm, line: &str, debug: bool) {
    if debug {
        match vm.disassemble_source(line) {
            Ok(dump) => println!("{dump}"),
            Err(errors) => {
                for e in &errors {
                    eprintln!("{e}");
                }
                return;
            }
        }
    }
    if let Err(err) = vm.interpret(line) {
        match err {
            FalconError::Compile(errors) => {
                for e in &errors {
                    eprintln!("{e}");
                }
            }
            FalconError::Runtime { error, trace } => {
                eprintln!("runtime error: {error}");
                eprint!("{trace}");
            }
        }
    }
}
