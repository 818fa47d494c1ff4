//! Runtime error taxonomy: one variant per distinct failure the VM can hit,
//! not a single catch-all string.

use thiserror::Error;

pub const STACK_MAX: usize = 4096;
pub const FRAMES_MAX: usize = 256;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("operand must be a {expected}, got {actual}")]
    TypeMismatch { expected: &'static str, actual: &'static str },

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("object has no property '{0}'")]
    UndefinedProperty(String),

    #[error("expected {expected} argument(s) but got {actual}")]
    ArityMismatch { expected: u8, actual: u8 },

    #[error("division by zero")]
    DivisionByZero,

    #[error("stack overflow")]
    StackOverflow,

    #[error("call stack exhausted (more than {FRAMES_MAX} nested calls)")]
    FrameOverflow,

    #[error("index {index} out of bounds for a collection of length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("value is not callable")]
    NotCallable,

    #[error("can only inherit from a class")]
    InvalidSuperclass,

    #[error("unknown opcode at instruction {0}")]
    UnknownOpcode(usize),

    #[error("{0}")]
    Native(String),
}

/// What the VM's `interpret` entry point hands back: either side succeeds
/// with a unit value, or fails with a typed reason plus (for runtime
/// failures) the call-stack trace to print alongside it.
#[derive(Debug, Error)]
pub enum FalconError {
    #[error("{} compile error(s)", .0.len())]
    Compile(Vec<falcon_compiler::ParseError>),

    #[error("{error}\n{trace}")]
    Runtime { error: RuntimeError, trace: String },
}

pub type InterpretResult = Result<(), FalconError>;
