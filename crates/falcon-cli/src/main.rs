//! Entry point for the `falcon` binary.
//!
//! Kept minimal on purpose: set up error reporting and logging, then hand
//! off to `falcon_cli::run()` so the actual CLI logic stays unit-testable
//! (`cargo test -p falcon-cli`).

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: failed to initialize color-eyre: {e}");
    }
    env_logger::init();

    let code = falcon_cli::run(std::env::args_os());
    std::process::exit(code);
}
