//! Instruction-set independent language.
//!
//! Each CFG block lowers to a list of [`IsilNode`]s in an architecture-neutral
//! vocabulary. Forms a translator does not model become [`IsilOpCode::Opaque`]
//! nodes that keep the original instruction text.

use std::fmt;

use serde::Serialize;

use crate::arch::{ArithmeticOp, Condition};
use crate::cfg::{BlockId, Edge};
use crate::{Address, MemoryOperand, Operand};

pub mod x86;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IsilOpCode {
    Nop,
    Move,
    Load,
    Store,
    LoadAddress,
    Arithmetic(ArithmeticOp),
    Compare,
    Test,
    Jump,
    JumpIf(Condition),
    Call,
    Return,
    Push,
    Pop,
    Interrupt,
    /// Unmodelled instruction; see [`IsilNode::original`]
    Opaque,
}

impl fmt::Display for IsilOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsilOpCode::Arithmetic(op) => write!(f, "{:?}", op),
            IsilOpCode::JumpIf(c) => write!(f, "JumpIf{:?}", c),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsilMemory {
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: u8,
    pub offset: i64,
}

/// Symbolic operand of an ISIL node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IsilOperand {
    Register(String),
    /// A frame-relative local, by offset from the stack pointer
    StackSlot(i64),
    Immediate(i64),
    Memory(IsilMemory),
    /// A code address (branch or call target)
    Target(Address),
}

impl IsilOperand {
    /// Lower a native operand. Memory off the stack pointer becomes a stack slot.
    pub fn from_native(op: &Operand, stack_pointer: &str) -> Option<Self> {
        match op {
            Operand::Register(r) => Some(IsilOperand::Register(r.clone())),
            Operand::Immediate(v) => Some(IsilOperand::Immediate(*v)),
            Operand::Memory(m) => Some(Self::from_memory(m, stack_pointer)),
            Operand::Other(_) => None,
        }
    }

    fn from_memory(m: &MemoryOperand, stack_pointer: &str) -> Self {
        if m.base.as_deref() == Some(stack_pointer) && m.index.is_none() {
            return IsilOperand::StackSlot(m.displacement);
        }
        IsilOperand::Memory(IsilMemory {
            base: m.base.clone(),
            index: m.index.clone(),
            scale: m.scale,
            offset: m.displacement,
        })
    }
}

impl fmt::Display for IsilOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsilOperand::Register(r) => write!(f, "{}", r),
            IsilOperand::StackSlot(o) => write!(f, "stack:0x{:x}", o),
            IsilOperand::Immediate(v) if *v < 0 => write!(f, "-0x{:x}", v.unsigned_abs()),
            IsilOperand::Immediate(v) => write!(f, "0x{:x}", v),
            IsilOperand::Target(a) => write!(f, "@0x{:X}", a),
            IsilOperand::Memory(m) => {
                write!(f, "[")?;
                let mut parts = Vec::new();
                if let Some(b) = &m.base {
                    parts.push(b.clone());
                }
                if let Some(i) = &m.index {
                    parts.push(format!("{}*{}", i, m.scale));
                }
                if m.offset != 0 || parts.is_empty() {
                    parts.push(format!("0x{:x}", m.offset));
                }
                write!(f, "{}]", parts.join("+"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsilNode {
    /// Native address the node was lowered from
    pub address: Address,
    pub opcode: IsilOpCode,
    pub operands: Vec<IsilOperand>,
    /// Original instruction text, kept for opaque nodes
    pub original: Option<String>,
}

impl IsilNode {
    pub fn new(address: Address, opcode: IsilOpCode, operands: Vec<IsilOperand>) -> Self {
        Self {
            address,
            opcode,
            operands,
            original: None,
        }
    }

    pub fn opaque(address: Address, original: impl Into<String>) -> Self {
        Self {
            address,
            opcode: IsilOpCode::Opaque,
            operands: Vec::new(),
            original: Some(original.into()),
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.opcode == IsilOpCode::Opaque
    }
}

impl fmt::Display for IsilNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(original) = &self.original {
            return write!(f, "{} ; {}", self.opcode, original);
        }
        let ops: Vec<String> = self.operands.iter().map(|o| o.to_string()).collect();
        if ops.is_empty() {
            write!(f, "{}", self.opcode)
        } else {
            write!(f, "{} {}", self.opcode, ops.join(", "))
        }
    }
}

/// The ISIL form of one CFG block, with its edges carried over.
#[derive(Debug, Clone, Serialize)]
pub struct IsilBlock {
    pub block: BlockId,
    pub start: Address,
    pub nodes: Vec<IsilNode>,
    pub successors: Vec<Edge>,
}

/// Count opaque nodes across a lowered method.
pub fn opaque_count(blocks: &[IsilBlock]) -> usize {
    blocks
        .iter()
        .flat_map(|b| &b.nodes)
        .filter(|n| n.is_opaque())
        .count()
}

/// Render a lowered method, one numbered node per line.
pub fn render(blocks: &[IsilBlock]) -> String {
    let mut out = String::new();
    let mut index = 0usize;
    for block in blocks {
        out.push_str(&format!("block_{}:\n", block.block));
        for node in &block.nodes {
            out.push_str(&format!("  {:03} {}\n", index, node));
            index += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_slot_lowering() {
        let op = Operand::Memory(MemoryOperand {
            base: Some("rsp".into()),
            displacement: 0x28,
            ..MemoryOperand::default()
        });
        assert_eq!(IsilOperand::from_native(&op, "rsp"), Some(IsilOperand::StackSlot(0x28)));

        let op = Operand::Memory(MemoryOperand {
            base: Some("rcx".into()),
            displacement: 0x10,
            ..MemoryOperand::default()
        });
        assert_eq!(
            IsilOperand::from_native(&op, "rsp").unwrap().to_string(),
            "[rcx+0x10]"
        );
    }

    #[test]
    fn test_node_display() {
        let node = IsilNode::new(
            0x10,
            IsilOpCode::Arithmetic(ArithmeticOp::Multiply),
            vec![
                IsilOperand::Register("eax".into()),
                IsilOperand::Register("ecx".into()),
                IsilOperand::Immediate(0x10),
            ],
        );
        assert_eq!(node.to_string(), "Multiply eax, ecx, 0x10");
        assert_eq!(IsilNode::opaque(0x10, "cpuid").to_string(), "Opaque ; cpuid");
    }
}
