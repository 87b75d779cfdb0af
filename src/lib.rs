//! Core IR, traits, and dispatch for the il_reclaim method-body reconstructor.
//!
//! IL2CPP compiles managed assemblies into native code. This library takes the
//! native bytes of a compiled method, together with the recovered type and
//! generic metadata, and rebuilds an equivalent managed representation:
//! pseudocode for humans and CIL-like bytecode for an assembly writer.
//!
//! The pipeline for one method is:
//!
//! 1. decode the body with the architecture backend ([`arch::InstructionSet`]),
//! 2. split it into a control flow graph ([`cfg::ControlFlowGraph`]),
//! 3. lower the graph to the instruction-set independent language ([`isil`]),
//! 4. walk the instructions with the action engine ([`analysis`]), which uses
//!    the type resolver ([`types`]) to type every synthesized local.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use il_reclaim::{
//!     analysis::{AnalysisEnvironment, MethodAnalysisContext},
//!     config::AnalysisOptions,
//!     parser::GoblinParser,
//!     types::{ManagedMethod, TypeResolver, TypeTable},
//!     BinaryParser,
//! };
//! # fn metadata() -> Arc<dyn il_reclaim::types::MetadataSource> { unimplemented!() }
//! # fn method() -> Arc<ManagedMethod> { unimplemented!() }
//!
//! let data = std::fs::read("GameAssembly.dll").unwrap();
//! let image = GoblinParser::new().parse(&data).unwrap();
//! let backend = image.architecture.backend().unwrap();
//!
//! let table = Arc::new(TypeTable::new(Vec::new()));
//! let resolver = Arc::new(TypeResolver::new(table, metadata()));
//! let env = AnalysisEnvironment::new(resolver, AnalysisOptions::default());
//!
//! let mut ctx = MethodAnalysisContext::new(0x180001000, None, method());
//! let report = ctx.analyze(backend, &image, &env);
//! println!("{}", report.pseudocode);
//! ```

pub mod analysis;
pub mod arch;
pub mod cfg;
pub mod config;
pub mod decoder;
pub mod format;
pub mod image;
pub mod isil;
pub mod operand;
pub mod parser;
pub mod pipeline;
pub mod strategy;
pub mod types;

/// Represents a virtual address in the loaded image
pub type Address = u64;

use std::fmt;

pub use image::{BinaryImage, Segment};
pub use operand::{MemoryOperand, Operand};

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Mnemonic used for bytes that do not decode to a valid instruction.
pub const INVALID_MNEMONIC: &str = "(bad)";

/// One decoded native instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Virtual address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "imul")
    pub mnemonic: String,
    /// Operand text exactly as the disassembler rendered it
    pub op_str: String,
    /// Operands parsed out of `op_str`
    pub operands: Vec<Operand>,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl Insn {
    /// Build an instruction record, parsing the operand text.
    pub fn new(addr: Address, raw: &[u8], mnemonic: &str, op_str: &str) -> Self {
        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        let len = raw.len().min(MAX_INSTRUCTION_SIZE);
        bytes[..len].copy_from_slice(&raw[..len]);

        Self {
            addr,
            size: len as u8,
            mnemonic: mnemonic.to_ascii_lowercase(),
            op_str: op_str.to_string(),
            operands: operand::parse_operands(op_str),
            bytes,
        }
    }

    /// Placeholder for bytes that could not be decoded.
    pub fn invalid(addr: Address, raw: &[u8]) -> Self {
        Self::new(addr, raw, INVALID_MNEMONIC, "")
    }

    /// Returns true if this entry stands in for undecodable bytes.
    pub fn is_invalid(&self) -> bool {
        self.mnemonic == INVALID_MNEMONIC
    }

    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Address of the byte following this instruction.
    pub fn end(&self) -> Address {
        self.addr + self.size as Address
    }

    /// Operand at position `index`, if present.
    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op_str.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{}\t{}", self.mnemonic, self.op_str)
        }
    }
}

/// Decoder trait: architecture-specific disassembler.
pub trait Decoder: Send + Sync {
    /// Decode the single instruction at the start of `code`.
    ///
    /// # Arguments
    /// * `code` - Bytes starting at the instruction to decode
    /// * `at` - Virtual address of `code[0]`
    ///
    /// # Returns
    /// Some(Insn) if an instruction was successfully decoded, None otherwise
    fn decode(&self, code: &[u8], at: Address) -> Option<Insn>;

    /// Number of bytes to skip when `decode` fails.
    fn invalid_step(&self) -> usize {
        1
    }
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// Unknown architecture
    Unknown,
}

impl Architecture {
    /// Select the process-wide backend for this architecture.
    pub fn backend(self) -> Result<&'static dyn arch::InstructionSet, ReclaimError> {
        arch::backend_for(self)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Parser trait: turn raw file bytes into a mapped `BinaryImage`.
pub trait BinaryParser: Send + Sync {
    /// Parse binary data into an image
    ///
    /// # Arguments
    /// * `data` - The binary data to parse
    ///
    /// # Returns
    /// Result containing the mapped image if parsing was successful
    fn parse(&self, data: &[u8]) -> Result<BinaryImage, ReclaimError>;
}

/// Error type for reconstruction operations
#[derive(Debug, thiserror::Error)]
pub enum ReclaimError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    Parsing(String),

    /// Decoder error
    #[error("Decoder error: {0}")]
    Decoder(#[from] decoder::DecoderError),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// Type or generic parameter resolution failed
    #[error("Resolution error: {0}")]
    Resolution(#[from] types::ResolveError),

    /// Invalid analysis options
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
