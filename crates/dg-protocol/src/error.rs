//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding gateway instructions
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Element length prefix is not a decimal number
    #[error("Invalid element length: {0:?}")]
    InvalidLength(String),

    /// Element was not followed by `,` or `;`
    #[error("Unexpected terminator {found:?} after element")]
    UnexpectedTerminator { found: char },

    /// Instruction bytes are not valid UTF-8
    #[error("Instruction is not valid UTF-8")]
    InvalidUtf8,

    /// Instruction exceeds the maximum accepted size
    #[error("Instruction too large: {size} bytes exceeds maximum of {max} bytes")]
    InstructionTooLarge { size: usize, max: usize },

    /// Instruction does not carry the arguments its opcode requires
    #[error("Malformed {opcode} instruction: {reason}")]
    Malformed { opcode: String, reason: String },

    /// Input event outside the accepted range
    #[error("Invalid input event: {0}")]
    InvalidInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
