//! Compile-time diagnostics.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[line {line}] {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}

/// Accumulates parse errors instead of aborting on the first one, so a
/// script with several mistakes reports all of them in one pass.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<ParseError>,
    /// Set once the parser hits a token it can't recover from locally;
    /// suppresses further cascading errors until a statement boundary.
    panic_mode: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, line: u32, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(ParseError::new(line, message));
    }

    pub fn synchronize(&mut self) {
        self.panic_mode = false;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<ParseError> {
        self.errors
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{} compile error(s)", .0.len())]
    Errors(Vec<ParseError>),
}
