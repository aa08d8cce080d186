//! dg-protocol: Gateway instruction protocol for deskgate sessions
//!
//! This crate defines the text instruction format spoken over the tunnel
//! between the session client and the remote-access gateway, plus the
//! input event model the presentation layer submits to a session.

pub mod codec;
pub mod error;
pub mod input;
pub mod instruction;
pub mod session;

pub use codec::InstructionCodec;
pub use error::ProtocolError;
pub use input::{InputEvent, MouseButton, PointerState, MAX_WHEEL_NOTCHES};
pub use instruction::{opcode, Instruction, MAX_INSTRUCTION_LENGTH};
pub use session::SessionId;
