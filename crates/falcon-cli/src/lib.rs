//! Argument parsing, REPL, and file execution for the `falcon` binary.

mod repl;

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use falcon_vm::{FalconError, Vm};

/// BSD `sysexits.h`-style process exit codes, distinguishing usage errors,
/// I/O errors, compile errors and runtime errors by distinct nonzero codes.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 64;
    pub const IO_ERROR: i32 = 74;
    pub const COMPILE_ERROR: i32 = 65;
    pub const RUNTIME_ERROR: i32 = 70;
}

#[derive(Parser, Debug)]
#[command(name = "falcon", version, about = "Falcon: a small dynamically typed scripting language")]
struct Cli {
    /// Dump compiled bytecode instead of (or before) running.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Run an inline expression instead of a script or the REPL.
    #[arg(short = 'i', long = "inline", value_name = "EXPR")]
    inline: Option<String>,

    /// Path to a Falcon script. Omit together with `-i` to start the REPL.
    script: Option<PathBuf>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("FALCON_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn new_vm() -> Vm {
    let mut vm = Vm::new();
    falcon_stdlib::install(&mut vm);
    vm
}

/// Parses `args` and dispatches to inline/file/REPL mode, returning the
/// process exit code to use.
pub fn run<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    init_tracing();

    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            eprint!("{e}");
            return exit_code::USAGE;
        }
    };

    let mut vm = new_vm();

    if let Some(expr) = &cli.inline {
        return run_source(&mut vm, expr, cli.debug);
    }

    if let Some(path) = &cli.script {
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: could not read '{}': {e}", path.display());
                return exit_code::IO_ERROR;
            }
        };
        return run_source(&mut vm, &source, cli.debug);
    }

    repl::run(&mut vm, cli.debug)
}

fn run_source(vm: &mut Vm, source: &str, debug: bool) -> i32 {
    if debug {
        match vm.disassemble_source(source) {
            Ok(dump) => println!("{dump}"),
            Err(errors) => {
                for e in &errors {
                    eprintln!("{e}");
                }
                return exit_code::COMPILE_ERROR;
            }
        }
    }

    match vm.interpret(source) {
        Ok(()) => exit_code::OK,
        Err(FalconError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
            exit_code::COMPILE_ERROR
        }
        Err(FalconError::Runtime { error, trace }) => {
            eprintln!("runtime error: {error}");
            eprint!("{trace}");
            exit_code::RUNTIME_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn usage_error_exits_64() {
        let code = run(["falcon", "--not-a-flag"]);
        assert_eq!(code, exit_code::USAGE);
    }

    #[test]
    fn missing_script_file_exits_74() {
        let code = run(["falcon", "/nonexistent/path/to/script.fl"]);
        assert_eq!(code, exit_code::IO_ERROR);
    }

    #[test]
    fn compile_error_exits_65() {
        let code = run(["falcon", "-i", "let x = ;"]);
        assert_eq!(code, exit_code::COMPILE_ERROR);
    }

    #[test]
    fn runtime_error_exits_70() {
        let code = run(["falcon", "-i", "1 / 0;"]);
        assert_eq!(code, exit_code::RUNTIME_ERROR);
    }

    #[test]
    fn successful_script_exits_0() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "let x = 1 + 2;").unwrap();
        let code = run(["falcon", file.path().to_str().unwrap()]);
        assert_eq!(code, exit_code::OK);
    }
}
