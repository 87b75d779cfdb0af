//! x86-64 backend: the fully modelled architecture.

use super::{
    keys::follow_thunk, render_assembly, Abi, ArithmeticOp, CallingConvention, Condition,
    InsnClass, InstructionSet, KeyFunctionAddresses,
};
use crate::cfg::{self, ControlFlowGraph};
use crate::decoder::CapstoneDecoder;
use crate::isil::{self, IsilBlock};
use crate::strategy::{self, BodyOptions};
use crate::{Address, Architecture, BinaryImage, Decoder, Insn, Operand};

/// (name, canonical, width in bits) for the legacy register file.
const LEGACY_REGISTERS: &[(&str, &str, u16)] = &[
    ("rax", "rax", 64), ("eax", "rax", 32), ("ax", "rax", 16), ("al", "rax", 8), ("ah", "rax", 8),
    ("rbx", "rbx", 64), ("ebx", "rbx", 32), ("bx", "rbx", 16), ("bl", "rbx", 8), ("bh", "rbx", 8),
    ("rcx", "rcx", 64), ("ecx", "rcx", 32), ("cx", "rcx", 16), ("cl", "rcx", 8), ("ch", "rcx", 8),
    ("rdx", "rdx", 64), ("edx", "rdx", 32), ("dx", "rdx", 16), ("dl", "rdx", 8), ("dh", "rdx", 8),
    ("rsi", "rsi", 64), ("esi", "rsi", 32), ("si", "rsi", 16), ("sil", "rsi", 8),
    ("rdi", "rdi", 64), ("edi", "rdi", 32), ("di", "rdi", 16), ("dil", "rdi", 8),
    ("rsp", "rsp", 64), ("esp", "rsp", 32), ("sp", "rsp", 16), ("spl", "rsp", 8),
    ("rbp", "rbp", 64), ("ebp", "rbp", 32), ("bp", "rbp", 16), ("bpl", "rbp", 8),
    ("rip", "rip", 64), ("eip", "rip", 32),
];

const SEGMENTS: &[&str] = &["cs", "ds", "es", "fs", "gs", "ss"];

/// `r8`..`r15` with an optional `d`/`w`/`b` suffix.
fn extended_register(name: &str) -> Option<(String, u16)> {
    let rest = name.strip_prefix('r')?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let number: u8 = rest[..digits_end].parse().ok()?;
    if !(8..=15).contains(&number) {
        return None;
    }
    let width = match &rest[digits_end..] {
        "" => 64,
        "d" => 32,
        "w" => 16,
        "b" => 8,
        _ => return None,
    };
    Some((format!("r{}", number), width))
}

fn vector_register(name: &str) -> Option<u16> {
    let (prefix, width) = if let Some(rest) = name.strip_prefix("xmm") {
        (rest, 128)
    } else if let Some(rest) = name.strip_prefix("ymm") {
        (rest, 256)
    } else {
        return None;
    };
    prefix.parse::<u8>().ok().filter(|n| *n < 32).map(|_| width)
}

/// Whether `name` is an x86-64 register.
pub fn is_register(name: &str) -> bool {
    LEGACY_REGISTERS.iter().any(|(n, _, _)| *n == name)
        || extended_register(name).is_some()
        || vector_register(name).is_some()
        || is_segment(name)
}

/// Whether `name` is a segment register.
pub fn is_segment(name: &str) -> bool {
    SEGMENTS.contains(&name)
}

fn condition_for(mnemonic: &str) -> Option<Condition> {
    let condition = match mnemonic {
        "je" | "jz" => Condition::Equal,
        "jne" | "jnz" => Condition::NotEqual,
        "jl" | "jnge" => Condition::Less,
        "jle" | "jng" => Condition::LessOrEqual,
        "jg" | "jnle" => Condition::Greater,
        "jge" | "jnl" => Condition::GreaterOrEqual,
        "jb" | "jnae" | "jc" => Condition::Below,
        "jbe" | "jna" => Condition::BelowOrEqual,
        "ja" | "jnbe" => Condition::Above,
        "jae" | "jnb" | "jnc" => Condition::AboveOrEqual,
        "js" | "jns" | "jo" | "jno" | "jp" | "jnp" | "jpe" | "jpo" | "jrcxz" | "jecxz" => {
            Condition::Unmodeled
        }
        _ => return None,
    };
    Some(condition)
}

fn has_memory(insn: &Insn, index: usize) -> bool {
    matches!(insn.operand(index), Some(Operand::Memory(_)))
}

const MICROSOFT: CallingConvention = CallingConvention {
    argument_registers: &["rcx", "rdx", "r8", "r9"],
    return_register: "rax",
    volatile_registers: &["rax", "rcx", "rdx", "r8", "r9", "r10", "r11"],
    frame_registers: &["rsp", "rbp"],
    positional_arguments: true,
};

const SYSTEM_V: CallingConvention = CallingConvention {
    argument_registers: &["rdi", "rsi", "rdx", "rcx", "r8", "r9"],
    return_register: "rax",
    volatile_registers: &["rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11"],
    frame_registers: &["rsp", "rbp"],
    positional_arguments: false,
};

/// The x86-64 instruction set backend.
#[derive(Debug)]
pub struct X86_64InstructionSet {
    decoder: CapstoneDecoder,
}

impl X86_64InstructionSet {
    pub const fn new() -> Self {
        Self {
            decoder: CapstoneDecoder::X86_64,
        }
    }
}

impl Default for X86_64InstructionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionSet for X86_64InstructionSet {
    fn architecture(&self) -> Architecture {
        Architecture::X86_64
    }

    fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }

    fn classify(&self, insn: &Insn) -> InsnClass {
        if insn.is_invalid() {
            return InsnClass::Invalid;
        }
        let m = insn.mnemonic.as_str();
        match m {
            "nop" | "endbr64" | "pause" => InsnClass::Nop,
            "int3" | "ud2" | "hlt" => InsnClass::Trap,
            "mov" | "movabs" if has_memory(insn, 0) => InsnClass::Store,
            "mov" | "movabs" | "movzx" | "movsx" | "movsxd" if has_memory(insn, 1) => {
                InsnClass::Load
            }
            "mov" | "movabs" | "movzx" | "movsx" | "movsxd" => InsnClass::Move,
            "lea" => InsnClass::LoadAddress,
            "add" => InsnClass::Arithmetic(ArithmeticOp::Add),
            "sub" => InsnClass::Arithmetic(ArithmeticOp::Subtract),
            "imul" => InsnClass::Arithmetic(ArithmeticOp::Multiply),
            "and" => InsnClass::Arithmetic(ArithmeticOp::And),
            "or" => InsnClass::Arithmetic(ArithmeticOp::Or),
            "xor" => InsnClass::Arithmetic(ArithmeticOp::Xor),
            "shl" | "sal" => InsnClass::Arithmetic(ArithmeticOp::ShiftLeft),
            "shr" => InsnClass::Arithmetic(ArithmeticOp::ShiftRight),
            "sar" => InsnClass::Arithmetic(ArithmeticOp::ShiftRightArithmetic),
            "cmp" => InsnClass::Compare,
            "test" => InsnClass::Test,
            "jmp" if matches!(insn.operand(0), Some(Operand::Immediate(_))) => InsnClass::Jump,
            "jmp" => InsnClass::IndirectJump,
            "call" if matches!(insn.operand(0), Some(Operand::Immediate(_))) => InsnClass::Call,
            "call" => InsnClass::IndirectCall,
            "ret" | "retn" => InsnClass::Return,
            "push" => InsnClass::Push,
            "pop" => InsnClass::Pop,
            _ => match condition_for(m) {
                Some(condition) => InsnClass::ConditionalJump(condition),
                None => InsnClass::Unknown,
            },
        }
    }

    fn register_width(&self, name: &str) -> Option<u16> {
        LEGACY_REGISTERS
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, _, w)| *w)
            .or_else(|| extended_register(name).map(|(_, w)| w))
            .or_else(|| vector_register(name))
    }

    fn canonical_register(&self, name: &str) -> String {
        if let Some((_, canonical, _)) = LEGACY_REGISTERS.iter().find(|(n, _, _)| *n == name) {
            return canonical.to_string();
        }
        if let Some((canonical, _)) = extended_register(name) {
            return canonical;
        }
        name.to_string()
    }

    fn calling_convention(&self, abi: Abi) -> CallingConvention {
        match abi {
            Abi::Microsoft => MICROSOFT,
            Abi::SystemV => SYSTEM_V,
        }
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

    fn to_isil(&self, graph: &ControlFlowGraph) -> Vec<IsilBlock> {
        isil::x86::translate(self, graph)
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
        Insn::new(0x1000, &[0x90], mnemonic, ops)
    }

    #[rstest]
    #[case("rax", Some(64), "rax")]
    #[case("eax", Some(32), "rax")]
    #[case("cl", Some(8), "rcx")]
    #[case("r9d", Some(32), "r9")]
    #[case("r15", Some(64), "r15")]
    #[case("r12w", Some(16), "r12")]
    #[case("xmm0", Some(128), "xmm0")]
    #[case("ymm15", Some(256), "ymm15")]
    #[case("r16", None, "r16")]
    fn test_register_width_and_family(
        #[case] name: &str,
        #[case] width: Option<u16>,
        #[case] canonical: &str,
    ) {
        let isa = X86_64InstructionSet::new();
        assert_eq!(isa.register_width(name), width);
        assert_eq!(isa.canonical_register(name), canonical);
    }

    #[test]
    fn test_classify_moves() {
        let isa = X86_64InstructionSet::new();
        assert_eq!(isa.classify(&insn("mov", "rax, rcx")), InsnClass::Move);
        assert_eq!(isa.classify(&insn("mov", "eax, dword ptr [rcx + 0x10]")), InsnClass::Load);
        assert_eq!(isa.classify(&insn("mov", "qword ptr [rcx + 0x18], rdx")), InsnClass::Store);
        assert_eq!(isa.classify(&insn("movzx", "eax, byte ptr [rcx]")), InsnClass::Load);
        assert_eq!(isa.classify(&insn("lea", "rcx, [rip + 0x100]")), InsnClass::LoadAddress);
    }

    #[test]
    fn test_classify_flow() {
        let isa = X86_64InstructionSet::new();
        assert_eq!(isa.classify(&insn("jmp", "0x1010")), InsnClass::Jump);
        assert_eq!(isa.classify(&insn("jmp", "rax")), InsnClass::IndirectJump);
        assert_eq!(
            isa.classify(&insn("jge", "0x1010")),
            InsnClass::ConditionalJump(Condition::GreaterOrEqual)
        );
        assert_eq!(
            isa.classify(&insn("js", "0x1010")),
            InsnClass::ConditionalJump(Condition::Unmodeled)
        );
        assert_eq!(isa.classify(&insn("call", "0x2000")), InsnClass::Call);
        assert_eq!(isa.classify(&insn("call", "qword ptr [rax + 0x10]")), InsnClass::IndirectCall);
        assert_eq!(isa.classify(&insn("ret", "")), InsnClass::Return);
        assert_eq!(isa.classify(&Insn::invalid(0, &[0x06])), InsnClass::Invalid);
        assert_eq!(isa.classify(&insn("cvtsi2sd", "xmm0, eax")), InsnClass::Unknown);
    }

    #[test]
    fn test_follow_thunk() {
        // 0x1000: jmp 0x1010
        let image = BinaryImage::raw(Architecture::X86_64, 0x1000, &[0xeb, 0x0e]);
        let isa = X86_64InstructionSet::new();
        let keys = isa.key_function_addresses(&image, &[("il2cpp_object_new".into(), 0x1000)]);
        assert_eq!(keys.get(super::super::KeyFunction::ObjectNew), Some(0x1010));
    }

    #[test]
    fn test_print_assembly() {
        // mov eax, ecx; ret
        let image = BinaryImage::raw(Architecture::X86_64, 0x1000, &[0x89, 0xc8, 0xc3]);
        let isa = X86_64InstructionSet::new();
        let insns = isa.decode_method(&image, 0x1000, Some(3), &BodyOptions::default());
        assert_eq!(isa.print_assembly(&insns), "0x1000 mov eax, ecx\n0x1002 ret");
    }
}
