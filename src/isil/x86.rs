//! x86-64 to ISIL lowering.

use super::{IsilBlock, IsilNode, IsilOpCode, IsilOperand};
use crate::arch::{direct_target, ArithmeticOp, Condition, InsnClass, InstructionSet};
use crate::cfg::ControlFlowGraph;
use crate::{Insn, Operand};

const STACK_POINTER: &str = "rsp";

/// Lower every block of `graph`.
pub fn translate(isa: &dyn InstructionSet, graph: &ControlFlowGraph) -> Vec<IsilBlock> {
    let blocks: Vec<IsilBlock> = graph
        .blocks()
        .iter()
        .map(|block| IsilBlock {
            block: block.id,
            start: block.start,
            nodes: block.insns.iter().map(|insn| lower(isa, insn)).collect(),
            successors: block.successors.clone(),
        })
        .collect();

    let opaque = super::opaque_count(&blocks);
    if opaque > 0 {
        log::debug!("ISIL: {} opaque nodes in {} blocks", opaque, blocks.len());
    }
    blocks
}

fn operands(insn: &Insn) -> Option<Vec<IsilOperand>> {
    insn.operands
        .iter()
        .map(|op| IsilOperand::from_native(op, STACK_POINTER))
        .collect()
}

fn same_register(insn: &Insn) -> bool {
    matches!(
        (insn.operand(0), insn.operand(1)),
        (Some(Operand::Register(a)), Some(Operand::Register(b))) if a == b
    )
}

/// Lower one instruction.
fn lower(isa: &dyn InstructionSet, insn: &Insn) -> IsilNode {
    let opaque = || IsilNode::opaque(insn.addr, insn.to_string());
    let Some(ops) = operands(insn) else {
        return opaque();
    };
    let node = |opcode, operands| IsilNode::new(insn.addr, opcode, operands);

    let class = isa.classify(insn);
    match class {
        InsnClass::Nop => node(IsilOpCode::Nop, vec![]),
        InsnClass::Move if ops.len() == 2 => node(IsilOpCode::Move, ops),
        InsnClass::Load if ops.len() == 2 => node(IsilOpCode::Load, ops),
        InsnClass::Store if ops.len() == 2 => node(IsilOpCode::Store, ops),
        InsnClass::LoadAddress if ops.len() == 2 => node(IsilOpCode::LoadAddress, ops),

        // xor r, r is the idiomatic zeroing move
        InsnClass::Arithmetic(ArithmeticOp::Xor) if same_register(insn) => {
            node(IsilOpCode::Move, vec![ops[0].clone(), IsilOperand::Immediate(0)])
        }
        InsnClass::Arithmetic(op) => match ops.as_slice() {
            [dst, src] => node(IsilOpCode::Arithmetic(op), vec![dst.clone(), dst.clone(), src.clone()]),
            [dst, lhs, rhs] => node(IsilOpCode::Arithmetic(op), vec![dst.clone(), lhs.clone(), rhs.clone()]),
            // shl rax (implicit count of one)
            [dst] if matches!(
                op,
                ArithmeticOp::ShiftLeft | ArithmeticOp::ShiftRight | ArithmeticOp::ShiftRightArithmetic
            ) =>
            {
                node(IsilOpCode::Arithmetic(op), vec![dst.clone(), dst.clone(), IsilOperand::Immediate(1)])
            }
            // one-operand imul/idiv work on rdx:rax
            _ => opaque(),
        },

        InsnClass::Compare if ops.len() == 2 => node(IsilOpCode::Compare, ops),
        InsnClass::Test if ops.len() == 2 => node(IsilOpCode::Test, ops),

        InsnClass::ConditionalJump(Condition::Unmodeled) => opaque(),
        InsnClass::ConditionalJump(c) => match direct_target(insn) {
            Some(t) => node(IsilOpCode::JumpIf(c), vec![IsilOperand::Target(t)]),
            None => opaque(),
        },
        InsnClass::Jump | InsnClass::Call => {
            let opcode = if class == InsnClass::Jump {
                IsilOpCode::Jump
            } else {
                IsilOpCode::Call
            };
            match direct_target(insn) {
                Some(t) => node(opcode, vec![IsilOperand::Target(t)]),
                None => opaque(),
            }
        }
        InsnClass::IndirectJump if ops.len() == 1 => node(IsilOpCode::Jump, ops),
        InsnClass::IndirectCall if ops.len() == 1 => node(IsilOpCode::Call, ops),
        InsnClass::Return => node(IsilOpCode::Return, vec![]),
        InsnClass::Push if ops.len() == 1 => node(IsilOpCode::Push, ops),
        InsnClass::Pop if ops.len() == 1 => node(IsilOpCode::Pop, ops),
        InsnClass::Trap => node(IsilOpCode::Interrupt, vec![]),
        _ => opaque(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::KeyFunctionAddresses;
    use crate::{Architecture, BinaryImage};

    fn lower_code(code: &[u8]) -> Vec<IsilBlock> {
        let image = BinaryImage::raw(Architecture::X86_64, 0x1000, code);
        let isa = Architecture::X86_64.backend().unwrap();
        let insns = crate::strategy::linear::sweep_exact(isa, &image, 0x1000, code.len() as u64);
        let graph = isa.build_graph(&insns, &KeyFunctionAddresses::new()).unwrap();
        isa.to_isil(&graph)
    }

    #[test]
    fn test_three_operand_multiply() {
        // imul eax, ecx, 0x10; ret
        let blocks = lower_code(&[0x6b, 0xc1, 0x10, 0xc3]);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].nodes[0].to_string(), "Multiply eax, ecx, 0x10");
        assert_eq!(blocks[0].nodes[1].opcode, IsilOpCode::Return);
    }

    #[test]
    fn test_compare_and_branch_keep_edges() {
        // cmp ecx, 5; jl 0x1006; ret; xor eax, eax; ret
        let code = [0x83, 0xf9, 0x05, 0x7c, 0x01, 0xc3, 0x31, 0xc0, 0xc3];
        let blocks = lower_code(&code);

        assert_eq!(blocks.len(), 3);
        let entry = &blocks[0];
        assert_eq!(entry.nodes[0].to_string(), "Compare ecx, 0x5");
        assert_eq!(entry.nodes[1].opcode, IsilOpCode::JumpIf(Condition::Less));
        assert_eq!(entry.successors.len(), 2);
        assert_eq!(blocks[2].nodes[0].to_string(), "Move eax, 0x0");
    }

    #[test]
    fn test_unmodelled_is_opaque() {
        // cpuid; ret
        let blocks = lower_code(&[0x0f, 0xa2, 0xc3]);

        assert!(blocks[0].nodes[0].is_opaque());
        assert_eq!(blocks[0].nodes[0].original.as_deref(), Some("cpuid"));
        assert_eq!(super::super::opaque_count(&blocks), 1);
    }

    #[test]
    fn test_stack_access_becomes_slot() {
        // mov qword ptr [rsp + 8], rcx; ret
        let blocks = lower_code(&[0x48, 0x89, 0x4c, 0x24, 0x08, 0xc3]);
        assert_eq!(blocks[0].nodes[0].to_string(), "Store stack:0x8, rcx");
    }
}
