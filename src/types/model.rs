//! Managed type-system model.
//!
//! Definitions are shared as [`TypeHandle`]s and compared by pointer, so two
//! handles name the same type only if they are the same allocation.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// A shared managed type definition.
pub type TypeHandle = Arc<TypeDefinition>;

/// Whether two handles are the same definition.
pub fn same_type(a: &TypeHandle, b: &TypeHandle) -> bool {
    Arc::ptr_eq(a, b)
}

/// A field of a managed type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: TypeSignature,
    /// Byte offset from the object start (instance) or static block start
    pub offset: u32,
    pub is_static: bool,
}

/// A managed type definition.
#[derive(Debug)]
pub struct TypeDefinition {
    pub namespace: String,
    pub name: String,
    pub declaring_type: Option<TypeHandle>,
    pub is_value_type: bool,
    /// Names of the type's own generic parameters, in order
    pub generic_parameters: Vec<String>,
    fields: OnceLock<Vec<FieldDefinition>>,
}

impl TypeDefinition {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            declaring_type: None,
            is_value_type: false,
            generic_parameters: Vec::new(),
            fields: OnceLock::new(),
        }
    }

    pub fn value_type(mut self) -> Self {
        self.is_value_type = true;
        self
    }

    pub fn nested_in(mut self, declaring_type: TypeHandle) -> Self {
        self.declaring_type = Some(declaring_type);
        self
    }

    pub fn with_generic_parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.generic_parameters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fields(self, fields: Vec<FieldDefinition>) -> Self {
        let _ = self.fields.set(fields);
        self
    }

    pub fn into_handle(self) -> TypeHandle {
        Arc::new(self)
    }

    /// Attach fields after construction, for types whose fields refer back
    /// to themselves. Returns false if fields were already set.
    pub fn set_fields(&self, fields: Vec<FieldDefinition>) -> bool {
        self.fields.set(fields).is_ok()
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        self.fields.get().map_or(&[], Vec::as_slice)
    }

    /// Instance field stored at `offset`.
    pub fn field_at_offset(&self, offset: u32) -> Option<&FieldDefinition> {
        self.fields()
            .iter()
            .find(|f| !f.is_static && f.offset == offset)
    }

    /// Static field stored at `offset` in the static block.
    pub fn static_field_at_offset(&self, offset: u32) -> Option<&FieldDefinition> {
        self.fields()
            .iter()
            .find(|f| f.is_static && f.offset == offset)
    }

    /// `Namespace.Name`, or `Outer/Inner` for nested types.
    pub fn full_name(&self) -> String {
        match &self.declaring_type {
            Some(outer) => format!("{}/{}", outer.full_name(), self.name),
            None if self.namespace.is_empty() => self.name.clone(),
            None => format!("{}.{}", self.namespace, self.name),
        }
    }

    pub fn arity(&self) -> usize {
        self.generic_parameters.len()
    }
}

/// Whether a generic parameter belongs to a type or a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericParameterKind {
    Type,
    Method,
}

/// A constructed generic parameter.
///
/// Constraints are filled in after the parameter is cached, so a constraint
/// may refer back to the parameter itself.
pub struct GenericParameter {
    pub name: String,
    pub flags: u16,
    pub kind: GenericParameterKind,
    pub index_in_owner: u16,
    pub(crate) constraints: OnceLock<Vec<TypeSignature>>,
}

impl GenericParameter {
    pub fn new(name: impl Into<String>, flags: u16, kind: GenericParameterKind, index_in_owner: u16) -> Self {
        Self {
            name: name.into(),
            flags,
            kind,
            index_in_owner,
            constraints: OnceLock::new(),
        }
    }

    /// Resolved constraints; empty until resolution finished.
    pub fn constraints(&self) -> &[TypeSignature] {
        self.constraints.get().map_or(&[], Vec::as_slice)
    }
}

// Constraints may point back at the parameter, so only their count is shown.
impl fmt::Debug for GenericParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericParameter")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("kind", &self.kind)
            .field("index_in_owner", &self.index_in_owner)
            .field("constraints", &self.constraints().len())
            .finish()
    }
}

/// A reference to a managed type as it appears in a signature.
#[derive(Debug, Clone)]
pub enum TypeSignature {
    Definition(TypeHandle),
    SzArray(Box<TypeSignature>),
    Array {
        element: Box<TypeSignature>,
        rank: u8,
    },
    Pointer(Box<TypeSignature>),
    GenericInstance {
        definition: TypeHandle,
        is_value_type: bool,
        arguments: Vec<TypeSignature>,
    },
    GenericParameter(Arc<GenericParameter>),
    /// Positional reference (`!0`, `!!0`) used inside generic arguments
    GenericParameterRef {
        kind: GenericParameterKind,
        index: u16,
    },
}

impl TypeSignature {
    /// The definition a signature is rooted at, when it has one.
    pub fn definition(&self) -> Option<&TypeHandle> {
        match self {
            TypeSignature::Definition(d) => Some(d),
            TypeSignature::GenericInstance { definition, .. } => Some(definition),
            _ => None,
        }
    }

    pub fn make_sz_array(self) -> Self {
        TypeSignature::SzArray(Box::new(self))
    }

    pub fn make_array(self, rank: u8) -> Self {
        TypeSignature::Array {
            element: Box::new(self),
            rank,
        }
    }

    pub fn make_pointer(self) -> Self {
        TypeSignature::Pointer(Box::new(self))
    }

    pub fn is_value_type(&self) -> bool {
        match self {
            TypeSignature::Definition(d) => d.is_value_type,
            TypeSignature::GenericInstance { is_value_type, .. } => *is_value_type,
            _ => false,
        }
    }
}

impl PartialEq for TypeSignature {
    fn eq(&self, other: &Self) -> bool {
        use TypeSignature::*;
        match (self, other) {
            (Definition(a), Definition(b)) => same_type(a, b),
            (SzArray(a), SzArray(b)) | (Pointer(a), Pointer(b)) => a == b,
            (Array { element: a, rank: ra }, Array { element: b, rank: rb }) => ra == rb && a == b,
            (
                GenericInstance {
                    definition: da,
                    arguments: aa,
                    ..
                },
                GenericInstance {
                    definition: db,
                    arguments: ab,
                    ..
                },
            ) => same_type(da, db) && aa == ab,
            (GenericParameter(a), GenericParameter(b)) => Arc::ptr_eq(a, b),
            (
                GenericParameterRef { kind: ka, index: ia },
                GenericParameterRef { kind: kb, index: ib },
            ) => ka == kb && ia == ib,
            _ => false,
        }
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSignature::Definition(d) => write!(f, "{}", d.full_name()),
            TypeSignature::SzArray(e) => write!(f, "{}[]", e),
            TypeSignature::Array { element, rank } => {
                write!(f, "{}[{}]", element, ",".repeat(rank.saturating_sub(1) as usize))
            }
            TypeSignature::Pointer(e) => write!(f, "{}*", e),
            TypeSignature::GenericInstance {
                definition,
                arguments,
                ..
            } => {
                let args: Vec<String> = arguments.iter().map(|a| a.to_string()).collect();
                write!(f, "{}<{}>", definition.full_name(), args.join(", "))
            }
            TypeSignature::GenericParameter(p) => write!(f, "{}", p.name),
            TypeSignature::GenericParameterRef { kind, index } => match kind {
                GenericParameterKind::Type => write!(f, "!{}", index),
                GenericParameterKind::Method => write!(f, "!!{}", index),
            },
        }
    }
}

/// Built-in types with a fixed handle per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Void,
    Boolean,
    Char,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    String,
    IntPtr,
    UIntPtr,
    Object,
    TypedReference,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 18] = [
        PrimitiveKind::Void,
        PrimitiveKind::Boolean,
        PrimitiveKind::Char,
        PrimitiveKind::SByte,
        PrimitiveKind::Byte,
        PrimitiveKind::Int16,
        PrimitiveKind::UInt16,
        PrimitiveKind::Int32,
        PrimitiveKind::UInt32,
        PrimitiveKind::Int64,
        PrimitiveKind::UInt64,
        PrimitiveKind::Single,
        PrimitiveKind::Double,
        PrimitiveKind::String,
        PrimitiveKind::IntPtr,
        PrimitiveKind::UIntPtr,
        PrimitiveKind::Object,
        PrimitiveKind::TypedReference,
    ];

    /// Type name inside the `System` namespace.
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Void => "Void",
            PrimitiveKind::Boolean => "Boolean",
            PrimitiveKind::Char => "Char",
            PrimitiveKind::SByte => "SByte",
            PrimitiveKind::Byte => "Byte",
            PrimitiveKind::Int16 => "Int16",
            PrimitiveKind::UInt16 => "UInt16",
            PrimitiveKind::Int32 => "Int32",
            PrimitiveKind::UInt32 => "UInt32",
            PrimitiveKind::Int64 => "Int64",
            PrimitiveKind::UInt64 => "UInt64",
            PrimitiveKind::Single => "Single",
            PrimitiveKind::Double => "Double",
            PrimitiveKind::String => "String",
            PrimitiveKind::IntPtr => "IntPtr",
            PrimitiveKind::UIntPtr => "UIntPtr",
            PrimitiveKind::Object => "Object",
            PrimitiveKind::TypedReference => "TypedReference",
        }
    }

    /// C# keyword alias, if the language has one.
    pub fn keyword(self) -> Option<&'static str> {
        Some(match self {
            PrimitiveKind::Void => "void",
            PrimitiveKind::Boolean => "bool",
            PrimitiveKind::Char => "char",
            PrimitiveKind::SByte => "sbyte",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::Int16 => "short",
            PrimitiveKind::UInt16 => "ushort",
            PrimitiveKind::Int32 => "int",
            PrimitiveKind::UInt32 => "uint",
            PrimitiveKind::Int64 => "long",
            PrimitiveKind::UInt64 => "ulong",
            PrimitiveKind::Single => "float",
            PrimitiveKind::Double => "double",
            PrimitiveKind::String => "string",
            PrimitiveKind::IntPtr => "nint",
            PrimitiveKind::UIntPtr => "nuint",
            PrimitiveKind::Object => "object",
            PrimitiveKind::TypedReference => return None,
        })
    }

    pub fn is_value_type(self) -> bool {
        !matches!(self, PrimitiveKind::String | PrimitiveKind::Object)
    }

    /// The C# keyword alias, matched exactly.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.keyword() == Some(keyword))
    }

    /// Match a simple or `System.`-qualified name ignoring case, or a keyword
    /// exactly.
    pub fn from_name(name: &str) -> Option<Self> {
        let simple = match name.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("System.") => &name[7..],
            _ => name,
        };
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(simple))
            .or_else(|| Self::from_keyword(name))
    }
}

/// The loaded type table, indexable by type definition index.
#[derive(Debug)]
pub struct TypeTable {
    types: Vec<TypeHandle>,
    primitives: Vec<TypeHandle>,
}

impl TypeTable {
    /// Wrap `types`. Primitive handles are taken from `System.*` entries when
    /// present and synthesized otherwise.
    pub fn new(types: Vec<TypeHandle>) -> Self {
        let primitives = PrimitiveKind::ALL
            .iter()
            .map(|kind| {
                types
                    .iter()
                    .find(|t| t.declaring_type.is_none() && t.namespace == "System" && t.name == kind.name())
                    .cloned()
                    .unwrap_or_else(|| {
                        let def = TypeDefinition::new("System", kind.name());
                        if kind.is_value_type() {
                            def.value_type().into_handle()
                        } else {
                            def.into_handle()
                        }
                    })
            })
            .collect();

        Self { types, primitives }
    }

    /// Type definition at `index`.
    pub fn get(&self, index: usize) -> Option<&TypeHandle> {
        self.types.get(index)
    }

    pub fn types(&self) -> &[TypeHandle] {
        &self.types
    }

    pub fn primitive(&self, kind: PrimitiveKind) -> &TypeHandle {
        // ALL and `primitives` share an order.
        &self.primitives[kind as usize]
    }

    pub fn object(&self) -> &TypeHandle {
        self.primitive(PrimitiveKind::Object)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
