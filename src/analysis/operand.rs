//! Locals and the operands actions consume.

use std::fmt;

use crate::types::{same_type, FieldDefinition, PrimitiveKind, TypeHandle, TypeSignature};

use super::bytecode::CilInstruction;
use super::TaintReason;

/// Index of a local inside its method's local list.
pub type LocalId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    This,
    /// Managed argument slot (`this` is slot 0 for instance methods)
    Parameter(u16),
    /// Synthesized variable, by variable slot
    Variable(u16),
}

/// A virtual variable synthesized for a method.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDefinition {
    pub id: LocalId,
    pub name: String,
    pub ty: TypeSignature,
    /// Register the value lived in when the local was created
    pub register: Option<String>,
    pub kind: LocalKind,
}

impl LocalDefinition {
    /// Push the local's value.
    pub fn load(&self) -> CilInstruction {
        match self.kind {
            LocalKind::This => CilInstruction::Ldarg(0),
            LocalKind::Parameter(slot) => CilInstruction::Ldarg(slot),
            LocalKind::Variable(slot) => CilInstruction::Ldloc(slot),
        }
    }

    /// Pop into the local.
    pub fn store(&self) -> CilInstruction {
        match self.kind {
            LocalKind::This => CilInstruction::Starg(0),
            LocalKind::Parameter(slot) => CilInstruction::Starg(slot),
            LocalKind::Variable(slot) => CilInstruction::Stloc(slot),
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, LocalKind::Variable(_))
    }
}

/// A literal the engine materialized.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Single(f32),
    Double(f64),
    String(String),
}

impl ConstantValue {
    /// Integer constant typed by the width of the register it lands in.
    pub fn for_width(value: i64, width_bits: u16) -> Self {
        if width_bits <= 32 {
            ConstantValue::Int32(value as i32)
        } else {
            ConstantValue::Int64(value)
        }
    }

    /// Primitive type of the constant, `None` for null.
    pub fn primitive(&self) -> Option<PrimitiveKind> {
        match self {
            ConstantValue::Null => None,
            ConstantValue::Boolean(_) => Some(PrimitiveKind::Boolean),
            ConstantValue::Int32(_) => Some(PrimitiveKind::Int32),
            ConstantValue::Int64(_) => Some(PrimitiveKind::Int64),
            ConstantValue::Single(_) => Some(PrimitiveKind::Single),
            ConstantValue::Double(_) => Some(PrimitiveKind::Double),
            ConstantValue::String(_) => Some(PrimitiveKind::String),
        }
    }

    /// Integer value, for constants that hold one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ConstantValue::Int32(v) => Some(*v as i64),
            ConstantValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn load(&self) -> CilInstruction {
        match self {
            ConstantValue::Null => CilInstruction::Ldnull,
            ConstantValue::Boolean(b) => CilInstruction::LdcI4(*b as i32),
            ConstantValue::Int32(v) => CilInstruction::LdcI4(*v),
            ConstantValue::Int64(v) => CilInstruction::LdcI8(*v),
            ConstantValue::Single(v) => CilInstruction::LdcR4(*v),
            ConstantValue::Double(v) => CilInstruction::LdcR8(*v),
            ConstantValue::String(s) => CilInstruction::Ldstr(s.clone()),
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Null => write!(f, "null"),
            ConstantValue::Boolean(b) => write!(f, "{}", b),
            ConstantValue::Int32(v) => write!(f, "{}", v),
            ConstantValue::Int64(v) => write!(f, "{}", v),
            ConstantValue::Single(v) => write!(f, "{}f", v),
            ConstantValue::Double(v) => write!(f, "{}", v),
            ConstantValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// A field of a known owner.
#[derive(Debug, Clone)]
pub struct FieldRef {
    pub owner: TypeHandle,
    pub name: String,
    pub field_type: TypeSignature,
    pub offset: u32,
    pub is_static: bool,
}

impl FieldRef {
    pub fn new(owner: &TypeHandle, field: &FieldDefinition) -> Self {
        Self {
            owner: owner.clone(),
            name: field.name.clone(),
            field_type: field.field_type.clone(),
            offset: field.offset,
            is_static: field.is_static,
        }
    }
}

impl PartialEq for FieldRef {
    fn eq(&self, other: &Self) -> bool {
        same_type(&self.owner, &other.owner) && self.name == other.name && self.offset == other.offset
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}::{}", self.field_type, self.owner.full_name(), self.name)
    }
}

/// What a register, stack slot or action input is known to hold.
#[derive(Debug, Clone)]
pub enum AnalysedOperand {
    Local(LocalId),
    Constant(ConstantValue),
    /// A field of a local, or a static field when `instance` is `None`
    Field {
        instance: Option<LocalId>,
        field: FieldRef,
    },
    /// The runtime class structure of a type
    ClassPointer(TypeHandle),
    /// The static field block of a type
    StaticFields(TypeHandle),
}

impl PartialEq for AnalysedOperand {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AnalysedOperand::Local(a), AnalysedOperand::Local(b)) => a == b,
            (AnalysedOperand::Constant(a), AnalysedOperand::Constant(b)) => a == b,
            (
                AnalysedOperand::Field { instance: a, field: fa },
                AnalysedOperand::Field { instance: b, field: fb },
            ) => a == b && fa == fb,
            (AnalysedOperand::ClassPointer(a), AnalysedOperand::ClassPointer(b))
            | (AnalysedOperand::StaticFields(a), AnalysedOperand::StaticFields(b)) => {
                same_type(a, b)
            }
            _ => false,
        }
    }
}

impl AnalysedOperand {
    /// The local this operand reads, if any.
    pub fn local(&self) -> Option<LocalId> {
        match self {
            AnalysedOperand::Local(id) => Some(*id),
            AnalysedOperand::Field { instance, .. } => *instance,
            _ => None,
        }
    }

    /// Instructions that push this operand's value.
    pub fn load(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        match self {
            AnalysedOperand::Local(id) => Ok(vec![local(locals, *id)?.load()]),
            AnalysedOperand::Constant(c) => Ok(vec![c.load()]),
            AnalysedOperand::Field {
                instance: Some(id),
                field,
            } => Ok(vec![local(locals, *id)?.load(), CilInstruction::Ldfld(field.clone())]),
            AnalysedOperand::Field {
                instance: None,
                field,
            } => Ok(vec![CilInstruction::Ldsfld(field.clone())]),
            AnalysedOperand::ClassPointer(_) | AnalysedOperand::StaticFields(_) => {
                Err(TaintReason::NotLoadable(self.render(locals)))
            }
        }
    }

    /// Pseudocode text for the operand.
    pub fn render(&self, locals: &[LocalDefinition]) -> String {
        match self {
            AnalysedOperand::Local(id) => local_name(locals, *id),
            AnalysedOperand::Constant(c) => c.to_string(),
            AnalysedOperand::Field {
                instance: Some(id),
                field,
            } => format!("{}.{}", local_name(locals, *id), field.name),
            AnalysedOperand::Field {
                instance: None,
                field,
            } => format!("{}.{}", field.owner.full_name(), field.name),
            AnalysedOperand::ClassPointer(t) => format!("typeof({})", t.full_name()),
            AnalysedOperand::StaticFields(t) => format!("{}.<statics>", t.full_name()),
        }
    }
}

pub(crate) fn local(locals: &[LocalDefinition], id: LocalId) -> Result<&LocalDefinition, TaintReason> {
    locals
        .get(id)
        .ok_or_else(|| TaintReason::MissingOperand(format!("local #{}", id)))
}

pub(crate) fn local_name(locals: &[LocalDefinition], id: LocalId) -> String {
    locals
        .get(id)
        .map_or_else(|| format!("<local #{}>", id), |l| l.name.clone())
}

/// An action input: where it came from and what it resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInput {
    /// Native operand text the input was read from
    pub origin: String,
    pub value: Option<AnalysedOperand>,
}

impl ActionInput {
    pub fn new(origin: impl Into<String>, value: Option<AnalysedOperand>) -> Self {
        Self {
            origin: origin.into(),
            value,
        }
    }

    pub fn resolved(origin: impl Into<String>, value: AnalysedOperand) -> Self {
        Self::new(origin, Some(value))
    }

    /// The resolved operand, or the taint its absence causes.
    pub fn require(&self) -> Result<&AnalysedOperand, TaintReason> {
        self.value
            .as_ref()
            .ok_or_else(|| TaintReason::MissingOperand(self.origin.clone()))
    }

    pub fn load(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        self.require()?.load(locals)
    }

    pub fn render(&self, locals: &[LocalDefinition]) -> String {
        match &self.value {
            Some(v) => v.render(locals),
            None => format!("<unknown {}>", self.origin),
        }
    }

    pub fn local(&self) -> Option<LocalId> {
        self.value.as_ref().and_then(AnalysedOperand::local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeDefinition, TypeTable};
    use rstest::rstest;

    fn int32() -> TypeSignature {
        let table = TypeTable::new(Vec::new());
        TypeSignature::Definition(table.primitive(PrimitiveKind::Int32).clone())
    }

    #[rstest]
    #[case(5, 32, ConstantValue::Int32(5))]
    #[case(-1, 8, ConstantValue::Int32(-1))]
    #[case(0x1_0000_0000, 64, ConstantValue::Int64(0x1_0000_0000))]
    fn test_constant_width(#[case] value: i64, #[case] width: u16, #[case] expected: ConstantValue) {
        assert_eq!(ConstantValue::for_width(value, width), expected);
    }

    #[test]
    fn test_local_load_store() {
        let param = LocalDefinition {
            id: 0,
            name: "a".to_string(),
            ty: int32(),
            register: Some("rcx".to_string()),
            kind: LocalKind::Parameter(1),
        };
        let var = LocalDefinition {
            id: 1,
            name: "local0".to_string(),
            ty: int32(),
            register: None,
            kind: LocalKind::Variable(0),
        };
        assert_eq!(param.load(), CilInstruction::Ldarg(1));
        assert_eq!(var.store(), CilInstruction::Stloc(0));
        assert!(!param.is_variable());
    }

    #[test]
    fn test_operand_rendering_and_loading() {
        let owner = TypeDefinition::new("Game", "Player").into_handle();
        let field = FieldRef {
            owner: owner.clone(),
            name: "health".to_string(),
            field_type: int32(),
            offset: 0x10,
            is_static: false,
        };
        let locals = vec![LocalDefinition {
            id: 0,
            name: "this".to_string(),
            ty: TypeSignature::Definition(owner.clone()),
            register: None,
            kind: LocalKind::This,
        }];

        let read = AnalysedOperand::Field {
            instance: Some(0),
            field: field.clone(),
        };
        assert_eq!(read.render(&locals), "this.health");
        assert_eq!(
            read.load(&locals).unwrap(),
            vec![CilInstruction::Ldarg(0), CilInstruction::Ldfld(field)]
        );

        let class = AnalysedOperand::ClassPointer(owner);
        assert_eq!(class.render(&locals), "typeof(Game.Player)");
        assert!(matches!(class.load(&locals), Err(TaintReason::NotLoadable(_))));
    }

    #[test]
    fn test_missing_input_taints() {
        let input = ActionInput::new("ecx", None);
        assert_eq!(input.render(&[]), "<unknown ecx>");
        assert_eq!(
            input.require().unwrap_err(),
            TaintReason::MissingOperand("ecx".to_string())
        );
    }
}
