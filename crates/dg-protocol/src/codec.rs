//! Tokio codec for gateway instructions

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::instruction::{Instruction, MAX_INSTRUCTION_LENGTH};

/// Codec for encoding/decoding gateway instructions
///
/// The tunnel transport may split an instruction across messages or pack
/// several into one, so decoding works on an accumulating buffer.
#[derive(Debug, Default)]
pub struct InstructionCodec;

impl InstructionCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for InstructionCodec {
    type Item = Instruction;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Instruction::decode_prefix(&src[..])? {
            Some((instruction, used)) => {
                let _ = src.split_to(used);
                Ok(Some(instruction))
            }
            None if src.len() > MAX_INSTRUCTION_LENGTH => {
                tracing::warn!(
                    "Buffered {} bytes without a complete instruction",
                    src.len()
                );
                Err(ProtocolError::InstructionTooLarge {
                    size: src.len(),
                    max: MAX_INSTRUCTION_LENGTH,
                })
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Instruction> for InstructionCodec {
    type Error = ProtocolError;

    fn encode(&mut self, instruction: Instruction, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        instruction.encode(dst);

        let size = dst.len() - start;
        if size > MAX_INSTRUCTION_LENGTH {
            dst.truncate(start);
            return Err(ProtocolError::InstructionTooLarge {
                size,
                max: MAX_INSTRUCTION_LENGTH,
            });
        }

        Ok(())
    }
}
