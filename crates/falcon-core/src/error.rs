//! Error types owned by `falcon-core`: failures that can occur while
//! building or reading a [`crate::chunk::Chunk`], independent of whether the
//! chunk came from the compiler or (hypothetically) anywhere else.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("constant pool exceeded u16 capacity ({max} entries)")]
    ConstPoolOverflow { max: usize },

    #[error("jump offset {offset} out of range for a 32-bit relative jump")]
    JumpOffsetOverflow { offset: i64 },

    #[error("instruction index {index} has no recorded source line")]
    MissingLine { index: usize },
}
