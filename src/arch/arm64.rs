//! AArch64 backend.
//!
//! Decoding, graphs, key functions and assembly printing are modelled. ISIL
//! lowering is not: `to_isil` hands back an empty list and callers fall back
//! to raw-instruction analysis.

use super::{
    keys::follow_thunk, render_assembly, Abi, ArithmeticOp, CallingConvention, Condition,
    InsnClass, InstructionSet, KeyFunctionAddresses,
};
use crate::cfg::{self, ControlFlowGraph};
use crate::decoder::CapstoneDecoder;
use crate::isil::IsilBlock;
use crate::strategy::{self, BodyOptions};
use crate::{Address, Architecture, BinaryImage, Decoder, Insn, Operand};

fn numbered(name: &str, prefix: char) -> Option<u8> {
    let rest = name.strip_prefix(prefix)?;
    let n: u8 = rest.parse().ok()?;
    (n <= 30).then_some(n)
}

/// Whether `name` is an AArch64 register.
pub fn is_register(name: &str) -> bool {
    matches!(name, "sp" | "wsp" | "xzr" | "wzr" | "fp" | "lr")
        || numbered(name, 'x').is_some()
        || numbered(name, 'w').is_some()
        || vector_width(name).is_some()
}

fn vector_width(name: &str) -> Option<u16> {
    let mut chars = name.chars();
    let width = match chars.next()? {
        'b' => 8,
        'h' => 16,
        's' => 32,
        'd' => 64,
        'q' | 'v' => 128,
        _ => return None,
    };
    let n: u8 = chars.as_str().parse().ok()?;
    (n < 32).then_some(width)
}

fn condition_for(suffix: &str) -> Condition {
    match suffix {
        "eq" => Condition::Equal,
        "ne" => Condition::NotEqual,
        "lt" => Condition::Less,
        "le" => Condition::LessOrEqual,
        "gt" => Condition::Greater,
        "ge" => Condition::GreaterOrEqual,
        "lo" | "cc" => Condition::Below,
        "ls" => Condition::BelowOrEqual,
        "hi" => Condition::Above,
        "hs" | "cs" => Condition::AboveOrEqual,
        _ => Condition::Unmodeled,
    }
}

fn stack_relative(insn: &Insn) -> bool {
    insn.operands.iter().any(|op| {
        op.memory()
            .and_then(|m| m.base.as_deref())
            .is_some_and(|base| matches!(base, "sp" | "x29" | "fp"))
    })
}

const AAPCS64: CallingConvention = CallingConvention {
    argument_registers: &["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7"],
    return_register: "x0",
    volatile_registers: &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18",
    ],
    frame_registers: &["sp", "x29", "x30"],
    positional_arguments: false,
};

/// The AArch64 instruction set backend.
#[derive(Debug)]
pub struct Arm64InstructionSet {
    decoder: CapstoneDecoder,
}

impl Arm64InstructionSet {
    pub const fn new() -> Self {
        Self {
            decoder: CapstoneDecoder::AArch64,
        }
    }
}

impl Default for Arm64InstructionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionSet for Arm64InstructionSet {
    fn architecture(&self) -> Architecture {
        Architecture::AArch64
    }

    fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }

    fn classify(&self, insn: &Insn) -> InsnClass {
        if insn.is_invalid() {
            return InsnClass::Invalid;
        }
        let m = insn.mnemonic.as_str();
        if let Some(suffix) = m.strip_prefix("b.") {
            return InsnClass::ConditionalJump(condition_for(suffix));
        }
        match m {
            "nop" => InsnClass::Nop,
            "brk" | "udf" | "hlt" => InsnClass::Trap,
            "stp" | "ldp" if stack_relative(insn) => InsnClass::Nop,
            "mov" | "movz" | "sxtw" | "uxtw" | "sxth" | "sxtb" | "uxth" | "uxtb" => {
                InsnClass::Move
            }
            "ldr" | "ldur" | "ldrsw" | "ldrb" | "ldrh" | "ldrsb" | "ldrsh"
                if matches!(insn.operand(1), Some(Operand::Memory(_))) =>
            {
                InsnClass::Load
            }
            "str" | "stur" | "strb" | "strh" => InsnClass::Store,
            "adr" | "adrp" => InsnClass::LoadAddress,
            "add" => InsnClass::Arithmetic(ArithmeticOp::Add),
            "sub" => InsnClass::Arithmetic(ArithmeticOp::Subtract),
            "mul" => InsnClass::Arithmetic(ArithmeticOp::Multiply),
            "sdiv" | "udiv" => InsnClass::Arithmetic(ArithmeticOp::Divide),
            "and" => InsnClass::Arithmetic(ArithmeticOp::And),
            "orr" => InsnClass::Arithmetic(ArithmeticOp::Or),
            "eor" => InsnClass::Arithmetic(ArithmeticOp::Xor),
            "lsl" => InsnClass::Arithmetic(ArithmeticOp::ShiftLeft),
            "lsr" => InsnClass::Arithmetic(ArithmeticOp::ShiftRight),
            "asr" => InsnClass::Arithmetic(ArithmeticOp::ShiftRightArithmetic),
            "cmp" => InsnClass::Compare,
            "tst" => InsnClass::Test,
            "cbz" => InsnClass::CompareZeroAndBranch(Condition::Equal),
            "cbnz" => InsnClass::CompareZeroAndBranch(Condition::NotEqual),
            "tbz" | "tbnz" => InsnClass::ConditionalJump(Condition::Unmodeled),
            "b" => InsnClass::Jump,
            "br" => InsnClass::IndirectJump,
            "bl" => InsnClass::Call,
            "blr" => InsnClass::IndirectCall,
            "ret" => InsnClass::Return,
            _ => InsnClass::Unknown,
        }
    }

    fn register_width(&self, name: &str) -> Option<u16> {
        match name {
            "sp" | "xzr" | "fp" | "lr" => Some(64),
            "wsp" | "wzr" => Some(32),
            _ if numbered(name, 'x').is_some() => Some(64),
            _ if numbered(name, 'w').is_some() => Some(32),
            _ => vector_width(name),
        }
    }

    fn canonical_register(&self, name: &str) -> String {
        match name {
            "fp" => "x29".to_string(),
            "lr" => "x30".to_string(),
            "wsp" => "sp".to_string(),
            "wzr" => "xzr".to_string(),
            _ => match numbered(name, 'w') {
                Some(n) => format!("x{}", n),
                None => name.to_string(),
            },
        }
    }

    fn calling_convention(&self, _abi: Abi) -> CallingConvention {
        AAPCS64
    }

    fn decode_method(
        &self,
        image: &BinaryImage,
        address: Address,
        length: Option<u64>,
        options: &BodyOptions,
    ) -> Vec<Insn> {
        strategy::decode_body(self, image, address, length, options)
    }

    fn build_graph(&self, insns: &[Insn], keys: &KeyFunctionAddresses) -> Option<ControlFlowGraph> {
        Some(cfg::build(self, insns, keys))
    }

    fn to_isil(&self, _graph: &ControlFlowGraph) -> Vec<IsilBlock> {
        Vec::new()
    }

    fn key_function_addresses(
        &self,
        image: &BinaryImage,
        exports: &[(String, Address)],
    ) -> KeyFunctionAddresses {
        KeyFunctionAddresses::from_exports(exports, |addr| follow_thunk(self, image, addr))
    }

    fn print_assembly(&self, insns: &[Insn]) -> String {
        render_assembly(insns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn insn(mnemonic: &str, ops: &str) -> Insn {
        Insn::new(0x4000, &[0, 0, 0, 0], mnemonic, ops)
    }

    #[rstest]
    #[case("x0", Some(64), "x0")]
    #[case("w7", Some(32), "x7")]
    #[case("fp", Some(64), "x29")]
    #[case("wzr", Some(32), "xzr")]
    #[case("d0", Some(64), "d0")]
    #[case("x31", None, "x31")]
    fn test_register_width_and_family(
        #[case] name: &str,
        #[case] width: Option<u16>,
        #[case] canonical: &str,
    ) {
        let isa = Arm64InstructionSet::new();
        assert_eq!(isa.register_width(name), width);
        assert_eq!(isa.canonical_register(name), canonical);
    }

    #[test]
    fn test_classify() {
        let isa = Arm64InstructionSet::new();
        assert_eq!(
            isa.classify(&insn("mul", "x0, x1, x2")),
            InsnClass::Arithmetic(ArithmeticOp::Multiply)
        );
        assert_eq!(isa.classify(&insn("ldr", "x0, [x1, #0x10]")), InsnClass::Load);
        assert_eq!(isa.classify(&insn("str", "w0, [x1, #0x10]")), InsnClass::Store);
        assert_eq!(isa.classify(&insn("stp", "x29, x30, [sp, #-0x10]!")), InsnClass::Nop);
        assert_eq!(
            isa.classify(&insn("b.lt", "#0x4010")),
            InsnClass::ConditionalJump(Condition::Less)
        );
        assert_eq!(
            isa.classify(&insn("cbnz", "x0, #0x4010")),
            InsnClass::CompareZeroAndBranch(Condition::NotEqual)
        );
        assert_eq!(isa.classify(&insn("bl", "#0x8000")), InsnClass::Call);
        assert_eq!(isa.classify(&insn("ret", "")), InsnClass::Return);
    }

    #[test]
    fn test_isil_is_unavailable() {
        let isa = Arm64InstructionSet::new();
        let insns = vec![insn("ret", "")];
        let graph = isa.build_graph(&insns, &KeyFunctionAddresses::new()).unwrap();
        assert!(isa.to_isil(&graph).is_empty());
    }
}
