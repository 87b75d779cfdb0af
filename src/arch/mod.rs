//! Pluggable per-architecture backends.
//!
//! Every backend implements the full [`InstructionSet`] capability set. A
//! capability a backend does not model yet answers with an explicit
//! "unavailable" value (`None` graph, empty ISIL) instead of failing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cfg::ControlFlowGraph;
use crate::isil::IsilBlock;
use crate::strategy::BodyOptions;
use crate::{Address, Architecture, BinaryImage, Decoder, Insn, ReclaimError};

pub mod arm64;
mod keys;
pub mod x86_64;

pub use arm64::Arm64InstructionSet;
pub use keys::{KeyFunction, KeyFunctionAddresses};
pub use x86_64::X86_64InstructionSet;

static X86_64_BACKEND: X86_64InstructionSet = X86_64InstructionSet::new();
static ARM64_BACKEND: Arm64InstructionSet = Arm64InstructionSet::new();

/// Select the process-wide backend for `arch`.
pub fn backend_for(arch: Architecture) -> Result<&'static dyn InstructionSet, ReclaimError> {
    match arch {
        Architecture::X86_64 => Ok(&X86_64_BACKEND),
        Architecture::AArch64 => Ok(&ARM64_BACKEND),
        other => Err(ReclaimError::UnsupportedArchitecture(other)),
    }
}

/// Arithmetic and logic operations the engine and ISIL understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
    ShiftRightArithmetic,
}

impl ArithmeticOp {
    /// Pseudocode operator symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Subtract => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
            ArithmeticOp::And => "&",
            ArithmeticOp::Or => "|",
            ArithmeticOp::Xor => "^",
            ArithmeticOp::ShiftLeft => "<<",
            ArithmeticOp::ShiftRight => ">>>",
            ArithmeticOp::ShiftRightArithmetic => ">>",
        }
    }
}

/// Branch conditions after a compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Below,
    BelowOrEqual,
    Above,
    AboveOrEqual,
    /// Flag tests we do not reconstruct (sign, overflow, parity)
    Unmodeled,
}

impl Condition {
    /// Pseudocode comparison operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            Condition::Equal => "==",
            Condition::NotEqual => "!=",
            Condition::Less | Condition::Below => "<",
            Condition::LessOrEqual | Condition::BelowOrEqual => "<=",
            Condition::Greater | Condition::Above => ">",
            Condition::GreaterOrEqual | Condition::AboveOrEqual => ">=",
            Condition::Unmodeled => "??",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Architecture-neutral classification of one native instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    Nop,
    /// Register/immediate move, including zero/sign extension
    Move,
    /// Load from memory into the first operand
    Load,
    /// Store of a register to memory
    Store,
    /// Address computation (`lea`, `adr`, `adrp`)
    LoadAddress,
    Arithmetic(ArithmeticOp),
    Compare,
    /// Bitwise test setting flags only
    Test,
    ConditionalJump(Condition),
    /// Compare a register against zero and branch (`cbz`, `cbnz`)
    CompareZeroAndBranch(Condition),
    Jump,
    IndirectJump,
    Call,
    IndirectCall,
    Return,
    Push,
    Pop,
    /// Padding or trap (`int3`, `ud2`, `brk`)
    Trap,
    Invalid,
    Unknown,
}

impl InsnClass {
    /// Whether control never falls through to the next instruction.
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            InsnClass::Jump | InsnClass::IndirectJump | InsnClass::Return | InsnClass::Trap
        )
    }

    /// Whether the instruction terminates a basic block.
    pub fn is_block_end(&self) -> bool {
        self.ends_flow()
            || matches!(
                self,
                InsnClass::ConditionalJump(_) | InsnClass::CompareZeroAndBranch(_)
            )
    }
}

/// Direct branch/call target: the last immediate operand.
pub fn direct_target(insn: &Insn) -> Option<Address> {
    insn.operands
        .iter()
        .rev()
        .find_map(|op| op.immediate())
        .map(|v| v as Address)
}

/// Which x86-64 calling convention the binary was compiled for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Abi {
    /// Windows x64 (rcx, rdx, r8, r9)
    #[default]
    Microsoft,
    /// System V AMD64 (rdi, rsi, rdx, rcx, r8, r9)
    SystemV,
}

/// Register roles the action engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingConvention {
    /// Integer argument registers in order
    pub argument_registers: &'static [&'static str],
    /// Integer return register
    pub return_register: &'static str,
    /// Registers a call may clobber
    pub volatile_registers: &'static [&'static str],
    /// Stack and frame registers; arithmetic on these is scaffolding
    pub frame_registers: &'static [&'static str],
    /// Whether argument N always uses register N, floating point or not
    pub positional_arguments: bool,
}

impl CallingConvention {
    /// Whether `canonical` is a stack or frame register.
    pub fn is_frame_register(&self, canonical: &str) -> bool {
        self.frame_registers.contains(&canonical)
    }
}

/// The capability set every architecture backend provides.
pub trait InstructionSet: Send + Sync {
    /// Architecture this backend handles.
    fn architecture(&self) -> Architecture;

    /// Single-instruction decoder.
    fn decoder(&self) -> &dyn Decoder;

    /// Classify a decoded instruction.
    fn classify(&self, insn: &Insn) -> InsnClass;

    /// Width of a register in bits, `None` for unknown names.
    fn register_width(&self, name: &str) -> Option<u16>;

    /// Full-width register that `name` aliases (`eax` -> `rax`).
    fn canonical_register(&self, name: &str) -> String;

    /// Register roles for the given ABI.
    fn calling_convention(&self, abi: Abi) -> CallingConvention;

    /// Decode one method body starting at `address`.
    ///
    /// Returns an empty list when the address is not mapped.
    fn decode_method(
        &self,
        image: &BinaryImage,
        address: Address,
        length: Option<u64>,
        options: &BodyOptions,
    ) -> Vec<Insn>;

    /// Build the control flow graph, or `None` when not modelled.
    fn build_graph(&self, insns: &[Insn], keys: &KeyFunctionAddresses) -> Option<ControlFlowGraph>;

    /// Lower a graph to ISIL; an empty list means "not modelled".
    fn to_isil(&self, graph: &ControlFlowGraph) -> Vec<IsilBlock>;

    /// Locate the well-known runtime helpers from the export table.
    fn key_function_addresses(
        &self,
        image: &BinaryImage,
        exports: &[(String, Address)],
    ) -> KeyFunctionAddresses;

    /// Render a method body as assembly text.
    fn print_assembly(&self, insns: &[Insn]) -> String;
}

/// Shared `0xADDR mnemonic operands` rendering.
pub(crate) fn render_assembly(insns: &[Insn]) -> String {
    insns
        .iter()
        .map(|insn| format!("0x{:X} {} {}", insn.addr, insn.mnemonic, insn.op_str).trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_end_classes() {
        assert!(InsnClass::Return.is_block_end());
        assert!(InsnClass::ConditionalJump(Condition::Equal).is_block_end());
        assert!(!InsnClass::ConditionalJump(Condition::Equal).ends_flow());
        assert!(!InsnClass::Call.is_block_end());
    }

    #[test]
    fn test_direct_target() {
        let insn = Insn::new(0x10, &[0x74, 0x02], "je", "0x14");
        assert_eq!(direct_target(&insn), Some(0x14));

        let insn = Insn::new(0x10, &[0, 0, 0, 0], "cbz", "x0, #0x40");
        assert_eq!(direct_target(&insn), Some(0x40));

        let insn = Insn::new(0x10, &[0xff, 0xe0], "jmp", "rax");
        assert_eq!(direct_target(&insn), None);
    }

    #[test]
    fn test_render_assembly() {
        let insns = vec![
            Insn::new(0x1000, &[0x90], "nop", ""),
            Insn::new(0x1001, &[0xc3], "ret", ""),
        ];
        assert_eq!(render_assembly(&insns), "0x1000 nop\n0x1001 ret");
    }
}
