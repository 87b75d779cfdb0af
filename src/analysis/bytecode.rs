//! CIL-like instructions produced by actions.
//!
//! Branches name native addresses; the emitter that writes the final method
//! body turns each [`CilInstruction::Label`] into an instruction offset.

use std::fmt;
use std::sync::Arc;

use crate::arch::{ArithmeticOp, Condition};
use crate::types::{ManagedMethod, TypeSignature};
use crate::Address;

use super::operand::FieldRef;

/// A called method, compared by identity.
#[derive(Debug, Clone)]
pub struct MethodRef(pub Arc<ManagedMethod>);

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CilInstruction {
    Ldarg(u16),
    Starg(u16),
    Ldloc(u16),
    Stloc(u16),
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    Ldstr(String),
    Ldnull,
    Ldfld(FieldRef),
    Stfld(FieldRef),
    Ldsfld(FieldRef),
    Stsfld(FieldRef),
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    ConvI1,
    ConvI2,
    ConvI4,
    ConvI8,
    ConvU1,
    ConvU2,
    ConvU4,
    ConvU8,
    Beq(Address),
    BneUn(Address),
    Blt(Address),
    Ble(Address),
    Bgt(Address),
    Bge(Address),
    BltUn(Address),
    BleUn(Address),
    BgtUn(Address),
    BgeUn(Address),
    Br(Address),
    Brtrue(Address),
    Brfalse(Address),
    Call(MethodRef),
    Newobj(TypeSignature),
    Newarr(TypeSignature),
    Throw,
    Ret,
    /// Branch target marker
    Label(Address),
}

impl CilInstruction {
    /// The instruction applying `op` to the two topmost stack values.
    pub fn arithmetic(op: ArithmeticOp) -> Self {
        match op {
            ArithmeticOp::Add => CilInstruction::Add,
            ArithmeticOp::Subtract => CilInstruction::Sub,
            ArithmeticOp::Multiply => CilInstruction::Mul,
            ArithmeticOp::Divide => CilInstruction::Div,
            ArithmeticOp::And => CilInstruction::And,
            ArithmeticOp::Or => CilInstruction::Or,
            ArithmeticOp::Xor => CilInstruction::Xor,
            ArithmeticOp::ShiftLeft => CilInstruction::Shl,
            ArithmeticOp::ShiftRight => CilInstruction::ShrUn,
            ArithmeticOp::ShiftRightArithmetic => CilInstruction::Shr,
        }
    }

    /// Two-operand compare-and-branch for `condition`.
    pub fn branch(condition: Condition, target: Address) -> Option<Self> {
        Some(match condition {
            Condition::Equal => CilInstruction::Beq(target),
            Condition::NotEqual => CilInstruction::BneUn(target),
            Condition::Less => CilInstruction::Blt(target),
            Condition::LessOrEqual => CilInstruction::Ble(target),
            Condition::Greater => CilInstruction::Bgt(target),
            Condition::GreaterOrEqual => CilInstruction::Bge(target),
            Condition::Below => CilInstruction::BltUn(target),
            Condition::BelowOrEqual => CilInstruction::BleUn(target),
            Condition::Above => CilInstruction::BgtUn(target),
            Condition::AboveOrEqual => CilInstruction::BgeUn(target),
            Condition::Unmodeled => return None,
        })
    }

    /// Sign or zero extension from `bits` wide values.
    pub fn extend(bits: u16, signed: bool) -> Self {
        match (bits, signed) {
            (0..=8, true) => CilInstruction::ConvI1,
            (9..=16, true) => CilInstruction::ConvI2,
            (17..=32, true) => CilInstruction::ConvI4,
            (_, true) => CilInstruction::ConvI8,
            (0..=8, false) => CilInstruction::ConvU1,
            (9..=16, false) => CilInstruction::ConvU2,
            (17..=32, false) => CilInstruction::ConvU4,
            (_, false) => CilInstruction::ConvU8,
        }
    }

    /// Branch target, for branching instructions.
    pub fn target(&self) -> Option<Address> {
        use CilInstruction::*;
        match self {
            Beq(t) | BneUn(t) | Blt(t) | Ble(t) | Bgt(t) | Bge(t) | BltUn(t) | BleUn(t)
            | BgtUn(t) | BgeUn(t) | Br(t) | Brtrue(t) | Brfalse(t) => Some(*t),
            _ => None,
        }
    }
}

impl fmt::Display for CilInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CilInstruction::*;
        match self {
            Ldarg(i) => write!(f, "ldarg {}", i),
            Starg(i) => write!(f, "starg {}", i),
            Ldloc(i) => write!(f, "ldloc {}", i),
            Stloc(i) => write!(f, "stloc {}", i),
            LdcI4(v) => write!(f, "ldc.i4 {}", v),
            LdcI8(v) => write!(f, "ldc.i8 {}", v),
            LdcR4(v) => write!(f, "ldc.r4 {}", v),
            LdcR8(v) => write!(f, "ldc.r8 {}", v),
            Ldstr(s) => write!(f, "ldstr {:?}", s),
            Ldnull => write!(f, "ldnull"),
            Ldfld(field) => write!(f, "ldfld {}", field),
            Stfld(field) => write!(f, "stfld {}", field),
            Ldsfld(field) => write!(f, "ldsfld {}", field),
            Stsfld(field) => write!(f, "stsfld {}", field),
            Add => write!(f, "add"),
            Sub => write!(f, "sub"),
            Mul => write!(f, "mul"),
            Div => write!(f, "div"),
            And => write!(f, "and"),
            Or => write!(f, "or"),
            Xor => write!(f, "xor"),
            Shl => write!(f, "shl"),
            Shr => write!(f, "shr"),
            ShrUn => write!(f, "shr.un"),
            ConvI1 => write!(f, "conv.i1"),
            ConvI2 => write!(f, "conv.i2"),
            ConvI4 => write!(f, "conv.i4"),
            ConvI8 => write!(f, "conv.i8"),
            ConvU1 => write!(f, "conv.u1"),
            ConvU2 => write!(f, "conv.u2"),
            ConvU4 => write!(f, "conv.u4"),
            ConvU8 => write!(f, "conv.u8"),
            Beq(t) => write!(f, "beq loc_{:X}", t),
            BneUn(t) => write!(f, "bne.un loc_{:X}", t),
            Blt(t) => write!(f, "blt loc_{:X}", t),
            Ble(t) => write!(f, "ble loc_{:X}", t),
            Bgt(t) => write!(f, "bgt loc_{:X}", t),
            Bge(t) => write!(f, "bge loc_{:X}", t),
            BltUn(t) => write!(f, "blt.un loc_{:X}", t),
            BleUn(t) => write!(f, "ble.un loc_{:X}", t),
            BgtUn(t) => write!(f, "bgt.un loc_{:X}", t),
            BgeUn(t) => write!(f, "bge.un loc_{:X}", t),
            Br(t) => write!(f, "br loc_{:X}", t),
            Brtrue(t) => write!(f, "brtrue loc_{:X}", t),
            Brfalse(t) => write!(f, "brfalse loc_{:X}", t),
            Call(m) => write!(f, "call {}", m),
            Newobj(t) => write!(f, "newobj {}", t),
            Newarr(t) => write!(f, "newarr {}", t),
            Throw => write!(f, "throw"),
            Ret => write!(f, "ret"),
            Label(a) => write!(f, "loc_{:X}:", a),
        }
    }
}
