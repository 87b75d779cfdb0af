//! Native type descriptors and the metadata they point into.
//!
//! A descriptor is the IL2CPP `Il2CppType` record: a kind byte plus one
//! payload word whose meaning depends on the kind. The tables the payload
//! indexes or points into are read through [`MetadataSource`], which the
//! external metadata parser implements.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::model::PrimitiveKind;
use crate::Address;

/// `Il2CppTypeEnum`, with the discriminants the runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeKind {
    End = 0x00,
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
    String = 0x0e,
    Ptr = 0x0f,
    ByRef = 0x10,
    ValueType = 0x11,
    Class = 0x12,
    Var = 0x13,
    Array = 0x14,
    GenericInst = 0x15,
    TypedByRef = 0x16,
    I = 0x18,
    U = 0x19,
    FnPtr = 0x1b,
    Object = 0x1c,
    SzArray = 0x1d,
    MVar = 0x1e,
    CModReqd = 0x1f,
    CModOpt = 0x20,
    Internal = 0x21,
    Modifier = 0x40,
    Sentinel = 0x41,
    Pinned = 0x45,
    Enum = 0x55,
}

impl TypeKind {
    /// Decode the raw kind byte.
    pub fn from_raw(raw: u8) -> Option<Self> {
        use TypeKind::*;
        Some(match raw {
            0x00 => End,
            0x01 => Void,
            0x02 => Boolean,
            0x03 => Char,
            0x04 => I1,
            0x05 => U1,
            0x06 => I2,
            0x07 => U2,
            0x08 => I4,
            0x09 => U4,
            0x0a => I8,
            0x0b => U8,
            0x0c => R4,
            0x0d => R8,
            0x0e => String,
            0x0f => Ptr,
            0x10 => ByRef,
            0x11 => ValueType,
            0x12 => Class,
            0x13 => Var,
            0x14 => Array,
            0x15 => GenericInst,
            0x16 => TypedByRef,
            0x18 => I,
            0x19 => U,
            0x1b => FnPtr,
            0x1c => Object,
            0x1d => SzArray,
            0x1e => MVar,
            0x1f => CModReqd,
            0x20 => CModOpt,
            0x21 => Internal,
            0x40 => Modifier,
            0x41 => Sentinel,
            0x45 => Pinned,
            0x55 => Enum,
            _ => return None,
        })
    }

    /// The well-known managed type a primitive kind maps to.
    pub fn primitive(self) -> Option<PrimitiveKind> {
        Some(match self {
            TypeKind::Object => PrimitiveKind::Object,
            TypeKind::Void => PrimitiveKind::Void,
            TypeKind::Boolean => PrimitiveKind::Boolean,
            TypeKind::Char => PrimitiveKind::Char,
            TypeKind::I1 => PrimitiveKind::SByte,
            TypeKind::U1 => PrimitiveKind::Byte,
            TypeKind::I2 => PrimitiveKind::Int16,
            TypeKind::U2 => PrimitiveKind::UInt16,
            TypeKind::I4 => PrimitiveKind::Int32,
            TypeKind::U4 => PrimitiveKind::UInt32,
            TypeKind::I => PrimitiveKind::IntPtr,
            TypeKind::U => PrimitiveKind::UIntPtr,
            TypeKind::I8 => PrimitiveKind::Int64,
            TypeKind::U8 => PrimitiveKind::UInt64,
            TypeKind::R4 => PrimitiveKind::Single,
            TypeKind::R8 => PrimitiveKind::Double,
            TypeKind::String => PrimitiveKind::String,
            TypeKind::TypedByRef => PrimitiveKind::TypedReference,
            _ => return None,
        })
    }

    /// Whether this is a type (`VAR`) or method (`MVAR`) generic parameter.
    pub fn is_generic_parameter(self) -> bool {
        matches!(self, TypeKind::Var | TypeKind::MVar)
    }
}

/// One `Il2CppType` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub kind: TypeKind,
    /// Class index, generic parameter index, or pointer, depending on `kind`
    pub data: u64,
    pub by_ref: bool,
}

impl TypeDescriptor {
    pub fn new(kind: TypeKind, data: u64) -> Self {
        Self {
            kind,
            data,
            by_ref: false,
        }
    }

    pub fn primitive(kind: TypeKind) -> Self {
        Self::new(kind, 0)
    }

    /// Class or value type at `index` in the type table.
    pub fn class(index: usize) -> Self {
        Self::new(TypeKind::Class, index as u64)
    }

    /// Generic parameter at `index` in the metadata generic parameter table.
    pub fn generic_parameter(kind: TypeKind, index: u32) -> Self {
        Self::new(kind, index as u64)
    }
}

/// `Il2CppArrayType`: a multi-dimensional array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayTypeInfo {
    /// Pointer to the element type descriptor
    pub element: Address,
    pub rank: u8,
}

/// `Il2CppGenericClass`: a generic definition plus its class instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericClassInfo {
    /// Type definition index before metadata v27, descriptor pointer from v27 on
    pub type_definition: u64,
    /// Pointer to the `Il2CppGenericInst` holding the type arguments
    pub class_inst: Address,
}

/// One row of the metadata generic parameter table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericParameterInfo {
    pub name: String,
    pub flags: u16,
    /// Position within the owning type or method
    pub index_in_owner: u16,
    pub constraints: Vec<TypeDescriptor>,
}

/// Read access to the metadata tables a descriptor payload refers to.
pub trait MetadataSource: Send + Sync {
    /// Metadata format version (24, 24.2, 27, 29, ...)
    fn metadata_version(&self) -> f32;

    /// Descriptor stored at `pointer` in the binary.
    fn type_at(&self, pointer: Address) -> Option<TypeDescriptor>;

    fn array_type_at(&self, pointer: Address) -> Option<ArrayTypeInfo>;

    fn generic_class_at(&self, pointer: Address) -> Option<GenericClassInfo>;

    /// Type argument descriptor pointers of the generic inst at `pointer`.
    fn generic_inst_at(&self, pointer: Address) -> Option<Vec<Address>>;

    fn generic_parameter(&self, index: u32) -> Option<GenericParameterInfo>;
}

/// A [`MetadataSource`] backed by plain maps.
///
/// Hosts that have already parsed the metadata can load it here instead of
/// implementing the trait.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetadata {
    pub version: f32,
    pub types: HashMap<Address, TypeDescriptor>,
    pub array_types: HashMap<Address, ArrayTypeInfo>,
    pub generic_classes: HashMap<Address, GenericClassInfo>,
    pub generic_insts: HashMap<Address, Vec<Address>>,
    pub generic_parameters: HashMap<u32, GenericParameterInfo>,
}

impl InMemoryMetadata {
    pub fn new(version: f32) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, pointer: Address, descriptor: TypeDescriptor) -> Self {
        self.types.insert(pointer, descriptor);
        self
    }

    pub fn with_array_type(mut self, pointer: Address, info: ArrayTypeInfo) -> Self {
        self.array_types.insert(pointer, info);
        self
    }

    pub fn with_generic_class(mut self, pointer: Address, info: GenericClassInfo) -> Self {
        self.generic_classes.insert(pointer, info);
        self
    }

    pub fn with_generic_inst(mut self, pointer: Address, arguments: Vec<Address>) -> Self {
        self.generic_insts.insert(pointer, arguments);
        self
    }

    pub fn with_generic_parameter(mut self, index: u32, info: GenericParameterInfo) -> Self {
        self.generic_parameters.insert(index, info);
        self
    }
}

impl MetadataSource for InMemoryMetadata {
    fn metadata_version(&self) -> f32 {
        self.version
    }

    fn type_at(&self, pointer: Address) -> Option<TypeDescriptor> {
        self.types.get(&pointer).copied()
    }

    fn array_type_at(&self, pointer: Address) -> Option<ArrayTypeInfo> {
        self.array_types.get(&pointer).copied()
    }

    fn generic_class_at(&self, pointer: Address) -> Option<GenericClassInfo> {
        self.generic_classes.get(&pointer).copied()
    }

    fn generic_inst_at(&self, pointer: Address) -> Option<Vec<Address>> {
        self.generic_insts.get(&pointer).cloned()
    }

    fn generic_parameter(&self, index: u32) -> Option<GenericParameterInfo> {
        self.generic_parameters.get(&index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x08, Some(TypeKind::I4))]
    #[case(0x13, Some(TypeKind::Var))]
    #[case(0x1e, Some(TypeKind::MVar))]
    #[case(0x55, Some(TypeKind::Enum))]
    #[case(0x17, None)]
    fn test_kind_from_raw(#[case] raw: u8, #[case] expected: Option<TypeKind>) {
        assert_eq!(TypeKind::from_raw(raw), expected);
        if let Some(kind) = expected {
            assert_eq!(kind as u8, raw);
        }
    }

    #[test]
    fn test_primitive_kinds() {
        assert_eq!(TypeKind::I8.primitive(), Some(PrimitiveKind::Int64));
        assert_eq!(TypeKind::TypedByRef.primitive(), Some(PrimitiveKind::TypedReference));
        assert_eq!(TypeKind::Class.primitive(), None);
        assert!(TypeKind::MVar.is_generic_parameter());
    }
}
