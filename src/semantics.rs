//! The instruction-semantics service: bytes in, lifted instructions out.

use std::sync::Arc;

use tracing::{event, Level};

use crate::{
    bytecode::Instruction,
    error::{ConfigError, LiftError},
    ty::ArchInfo,
};

pub mod x86;

/// Decodes machine code of one processor into p-code.
///
/// Implementations must be pure: decoding the same bytes at the same address
/// always yields the same instruction.
pub trait InstructionSemantics: Send + Sync {
    fn arch(&self) -> &Arc<ArchInfo>;

    /// Decode the instruction starting at `bytes[0]`, located at `address`.
    fn decode(&self, bytes: &[u8], address: u64) -> Result<Instruction, LiftError>;

    /// Decode consecutive instructions until one transfers control or
    /// `max_instructions` have been read.
    fn decode_block(&self, bytes: &[u8], address: u64, max_instructions: usize) -> Result<Vec<Instruction>, LiftError> {
        let mut instructions = Vec::new();
        let mut offset = 0;
        while instructions.len() < max_instructions && offset < bytes.len() {
            let instruction = self.decode(&bytes[offset..], address + offset as u64)?;
            offset += instruction.length;
            let terminal = instruction.terminates_block();
            instructions.push(instruction);
            if terminal {
                break;
            }
        }
        Ok(instructions)
    }
}

/// Pick the semantics provider for a processor language id.
pub fn semantics_for(language_id: &str) -> Result<Arc<dyn InstructionSemantics>, ConfigError> {
    match language_id {
        x86::LANGUAGE_ID | "x86-64" | "x86_64" => {
            event!(Level::DEBUG, "using built-in x86-64 semantics");
            Ok(Arc::new(x86::X86_64Semantics::new()))
        }
        other => Err(ConfigError::UnknownLanguage(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_language_is_rejected() {
        assert!(semantics_for("ARM:LE:32:v8").is_err());
        assert!(semantics_for("x86:LE:64:default").is_ok());
    }

    #[test]
    fn block_stops_at_transfer() {
        let sem = x86::X86_64Semantics::new();
        // pop rdi; ret; pop rsi
        let block = sem.decode_block(&[0x5f, 0xc3, 0x5e], 0x1000, 8).unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(block[1].address, 0x1001);
    }
}
