//! Gateway instruction encoding/decoding
//!
//! Every instruction is a comma-separated list of elements terminated by
//! a semicolon. Each element is prefixed by its length and a period:
//!
//! ```text
//! 4.size,1.0,4.1024,3.768;
//! ```
//!
//! The first element is the opcode, the rest are arguments. Lengths count
//! Unicode scalar values, not bytes, so a multi-byte character still has
//! length 1.

use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::error::ProtocolError;

/// Maximum encoded size of a single instruction in bytes
pub const MAX_INSTRUCTION_LENGTH: usize = 32 * 1024;

/// Opcodes the session client produces or reacts to
pub mod opcode {
    /// Internal tunnel instruction; its single argument is the tunnel UUID
    pub const INTERNAL: &str = "";
    pub const READY: &str = "ready";
    pub const SYNC: &str = "sync";
    pub const NOP: &str = "nop";
    pub const ERROR: &str = "error";
    pub const DISCONNECT: &str = "disconnect";
    pub const KEY: &str = "key";
    pub const MOUSE: &str = "mouse";
}

/// A single protocol instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Instruction opcode
    pub opcode: String,
    /// Instruction arguments
    pub args: Vec<String>,
}

impl Instruction {
    /// Create a new instruction
    pub fn new<I, S>(opcode: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Keyboard event for an X11 keysym
    pub fn key(keysym: u32, pressed: bool) -> Self {
        Self::new(
            opcode::KEY,
            [keysym.to_string(), if pressed { "1" } else { "0" }.to_string()],
        )
    }

    /// Pointer state: position plus the bitmask of pressed buttons
    pub fn mouse(x: i32, y: i32, button_mask: u8) -> Self {
        Self::new(
            opcode::MOUSE,
            [x.to_string(), y.to_string(), button_mask.to_string()],
        )
    }

    /// Frame acknowledgement echoing the gateway timestamp
    pub fn sync(timestamp: &str) -> Self {
        Self::new(opcode::SYNC, [timestamp])
    }

    pub fn nop() -> Self {
        Self::new(opcode::NOP, Vec::<String>::new())
    }

    pub fn disconnect() -> Self {
        Self::new(opcode::DISCONNECT, Vec::<String>::new())
    }

    /// Whether this instruction has the given opcode
    pub fn is(&self, opcode: &str) -> bool {
        self.opcode == opcode
    }

    /// First argument, if any
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Message and numeric status code of an `error` instruction
    pub fn error_details(&self) -> Result<(String, u32), ProtocolError> {
        if !self.is(opcode::ERROR) {
            return Err(ProtocolError::Malformed {
                opcode: self.opcode.clone(),
                reason: "not an error instruction".to_string(),
            });
        }
        let message = self.args.first().cloned().unwrap_or_default();
        let code = match self.args.get(1) {
            Some(raw) => raw.parse::<u32>().map_err(|_| ProtocolError::Malformed {
                opcode: self.opcode.clone(),
                reason: format!("status code {:?} is not numeric", raw),
            })?,
            None => 0,
        };
        Ok((message, code))
    }

    /// Append the encoded instruction to a buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut first = true;
        for element in std::iter::once(&self.opcode).chain(self.args.iter()) {
            if !first {
                dst.put_u8(b',');
            }
            first = false;
            dst.put_slice(element.chars().count().to_string().as_bytes());
            dst.put_u8(b'.');
            dst.put_slice(element.as_bytes());
        }
        dst.put_u8(b';');
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.len()
    }

    /// Try to decode one instruction from the front of `src`.
    ///
    /// Returns the instruction and the number of bytes it occupied, or
    /// `None` if `src` does not yet hold a complete instruction.
    pub fn decode_prefix(src: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let mut pos = 0;
        let mut elements: Vec<String> = Vec::new();

        loop {
            // Length prefix
            let digits_start = pos;
            while pos < src.len() && src[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos >= src.len() {
                return Ok(None);
            }
            if src[pos] != b'.' || pos == digits_start {
                let raw = String::from_utf8_lossy(&src[digits_start..=pos]).into_owned();
                return Err(ProtocolError::InvalidLength(raw));
            }
            let raw_len = std::str::from_utf8(&src[digits_start..pos])
                .map_err(|_| ProtocolError::InvalidUtf8)?;
            let char_len: usize = raw_len
                .parse()
                .map_err(|_| ProtocolError::InvalidLength(raw_len.to_string()))?;
            pos += 1;

            // Element value: walk `char_len` UTF-8 scalar values
            let value_start = pos;
            for _ in 0..char_len {
                let Some(&lead) = src.get(pos) else {
                    return Ok(None);
                };
                pos += utf8_width(lead).ok_or(ProtocolError::InvalidUtf8)?;
                if pos > src.len() {
                    return Ok(None);
                }
            }
            let value = std::str::from_utf8(&src[value_start..pos])
                .map_err(|_| ProtocolError::InvalidUtf8)?;
            elements.push(value.to_string());

            // Terminator
            let Some(&terminator) = src.get(pos) else {
                return Ok(None);
            };
            pos += 1;
            match terminator {
                b',' => continue,
                b';' => break,
                other => {
                    return Err(ProtocolError::UnexpectedTerminator {
                        found: other as char,
                    })
                }
            }
        }

        let mut elements = elements.into_iter();
        let opcode = elements.next().unwrap_or_default();
        Ok(Some((
            Self {
                opcode,
                args: elements.collect(),
            },
            pos,
        )))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

/// Width in bytes of the UTF-8 sequence starting with `lead`
fn utf8_width(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_counts_characters_not_bytes() {
        let instruction = Instruction::new("name", ["héllo"]);
        assert_eq!(instruction.to_string(), "4.name,5.héllo;");
    }

    #[test]
    fn test_encode_no_args() {
        assert_eq!(Instruction::nop().to_string(), "3.nop;");
        assert_eq!(Instruction::disconnect().to_string(), "10.disconnect;");
    }

    #[test]
    fn test_decode_internal_instruction() {
        let raw = b"0.,36.2f3a8c1e-0000-4000-8000-1234567890ab;";
        let (instruction, used) = Instruction::decode_prefix(raw).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert!(instruction.is(opcode::INTERNAL));
        assert_eq!(
            instruction.first_arg(),
            Some("2f3a8c1e-0000-4000-8000-1234567890ab")
        );
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        assert!(Instruction::decode_prefix(b"4.sync,3.12").unwrap().is_none());
        assert!(Instruction::decode_prefix(b"4.sy").unwrap().is_none());
        assert!(Instruction::decode_prefix(b"").unwrap().is_none());
        // Split inside a multi-byte character
        let full = "4.name,1.é;".as_bytes();
        assert!(Instruction::decode_prefix(&full[..full.len() - 2])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_rejects_bad_terminator() {
        let result = Instruction::decode_prefix(b"3.nop:");
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedTerminator { found: ':' })
        ));
    }

    #[test]
    fn test_decode_rejects_missing_length() {
        let result = Instruction::decode_prefix(b".nop;");
        assert!(matches!(result, Err(ProtocolError::InvalidLength(_))));
    }

    #[test]
    fn test_error_details() {
        let instruction = Instruction::new(opcode::ERROR, ["Upstream timeout", "514"]);
        let (message, code) = instruction.error_details().unwrap();
        assert_eq!(message, "Upstream timeout");
        assert_eq!(code, 0x0202);
    }

    #[test]
    fn test_key_and_mouse_helpers() {
        assert_eq!(Instruction::key(0x61, true).to_string(), "3.key,2.97,1.1;");
        assert_eq!(
            Instruction::mouse(10, 20, 1).to_string(),
            "5.mouse,2.10,2.20,1.1;"
        );
    }
}
