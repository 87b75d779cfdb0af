//! Capstone-based instruction decoders for the supported backends.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use capstone::arch::arm64::ArchMode as Arm64Mode;
use capstone::arch::x86::ArchMode as X86Mode;
use capstone::{prelude::BuildsCapstone, Capstone};

use crate::{Address, Architecture, Decoder, Insn, MAX_INSTRUCTION_SIZE};

/// Errors that can occur while setting up a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),
}

/// A Capstone-based decoder for one ISA.
///
/// The Capstone handles themselves live in a thread-local pool, so the
/// decoder is a plain value that can sit in a `static` backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapstoneDecoder {
    X86_64,
    AArch64,
}

thread_local! {
    static CS_POOL: RefCell<HashMap<CapstoneDecoder, Rc<Capstone>>> =
        RefCell::new(HashMap::new());
}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture
    pub fn for_architecture(arch: Architecture) -> Result<Self, DecoderError> {
        match arch {
            Architecture::X86_64 => Ok(CapstoneDecoder::X86_64),
            Architecture::AArch64 => Ok(CapstoneDecoder::AArch64),
            other => Err(DecoderError::UnsupportedArchitecture(other)),
        }
    }

    /// Build an x86 64-bit Capstone handle (Intel syntax)
    pub fn build_x86_64() -> Result<Capstone, DecoderError> {
        Ok(Capstone::new()
            .x86()
            .mode(X86Mode::Mode64)
            .detail(false)
            .build()?)
    }

    /// Build an AArch64 Capstone handle
    pub fn build_aarch64() -> Result<Capstone, DecoderError> {
        Ok(Capstone::new()
            .arm64()
            .mode(Arm64Mode::Arm)
            .detail(false)
            .build()?)
    }

    /// Build a fresh handle for this decoder.
    pub fn build(&self) -> Result<Capstone, DecoderError> {
        match self {
            CapstoneDecoder::X86_64 => Self::build_x86_64(),
            CapstoneDecoder::AArch64 => Self::build_aarch64(),
        }
    }

    /// Get the architecture of this decoder
    pub fn architecture(&self) -> Architecture {
        match self {
            CapstoneDecoder::X86_64 => Architecture::X86_64,
            CapstoneDecoder::AArch64 => Architecture::AArch64,
        }
    }

    fn handle(&self) -> Option<Rc<Capstone>> {
        CS_POOL.with(|cell| {
            let mut map = cell.borrow_mut();
            if let Some(cs) = map.get(self) {
                return Some(cs.clone());
            }
            match self.build() {
                Ok(cs) => {
                    let cs = Rc::new(cs);
                    map.insert(*self, cs.clone());
                    Some(cs)
                }
                Err(e) => {
                    log::warn!("Unable to build {} decoder: {}", self, e);
                    None
                }
            }
        })
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.architecture())
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, code: &[u8], at: Address) -> Option<Insn> {
        if code.is_empty() {
            return None;
        }

        let end = code.len().min(MAX_INSTRUCTION_SIZE);
        let cs = self.handle()?;

        let disasm = cs.disasm_count(&code[..end], at, 1).ok()?;
        let i = disasm.iter().next()?;

        if i.address() != at {
            return None;
        }

        Some(Insn::new(
            i.address(),
            i.bytes(),
            i.mnemonic().unwrap_or(""),
            i.op_str().unwrap_or(""),
        ))
    }

    fn invalid_step(&self) -> usize {
        match self {
            CapstoneDecoder::X86_64 => 1,
            CapstoneDecoder::AArch64 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operand;

    #[test]
    fn test_architecture_mapping() {
        let decoder = CapstoneDecoder::for_architecture(Architecture::X86_64).unwrap();
        assert_eq!(decoder.architecture(), Architecture::X86_64);
        assert!(CapstoneDecoder::for_architecture(Architecture::Arm).is_err());
    }

    #[test]
    fn test_x86_decode() {
        // mov eax, 1
        let bytes = [0xb8, 0x01, 0x00, 0x00, 0x00];
        let insn = CapstoneDecoder::X86_64.decode(&bytes, 0x1000).unwrap();

        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.size, 5);
        assert_eq!(insn.bytes(), &bytes);
        assert_eq!(insn.operands[0], Operand::Register("eax".into()));
        assert_eq!(insn.operands[1], Operand::Immediate(1));
    }

    #[test]
    fn test_x86_imul_immediate_decode() {
        // imul eax, ecx, 0x10
        let bytes = [0x6b, 0xc1, 0x10];
        let insn = CapstoneDecoder::X86_64.decode(&bytes, 0).unwrap();

        assert_eq!(insn.mnemonic, "imul");
        assert_eq!(insn.operands.len(), 3);
        assert_eq!(insn.operands[2], Operand::Immediate(0x10));
    }

    #[test]
    fn test_aarch64_decode() {
        // mul x0, x1, x2
        let bytes = [0x20, 0x7c, 0x02, 0x9b];
        let insn = CapstoneDecoder::AArch64.decode(&bytes, 0x4000).unwrap();

        assert_eq!(insn.mnemonic, "mul");
        assert_eq!(
            insn.operands,
            vec![
                Operand::Register("x0".into()),
                Operand::Register("x1".into()),
                Operand::Register("x2".into()),
            ]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(CapstoneDecoder::X86_64.decode(&[], 0).is_none());
    }
}
