//! Type and generic resolution.
//!
//! Maps native IL2CPP type descriptors, and plain type names, onto the
//! managed type model the action engine types its locals with.

pub mod descriptor;
pub mod importer;
pub mod lookup;
pub mod method;
pub mod model;
pub mod resolver;

pub use descriptor::{
    ArrayTypeInfo, GenericClassInfo, GenericParameterInfo, InMemoryMetadata, MetadataSource,
    TypeDescriptor, TypeKind,
};
pub use importer::{ImporterTable, ReferenceImporter};
pub use lookup::TypeLookup;
pub use method::{ManagedMethod, MethodImplementation, ParameterDefinition};
pub use model::{
    same_type, FieldDefinition, GenericParameter, GenericParameterKind, PrimitiveKind,
    TypeDefinition, TypeHandle, TypeSignature, TypeTable,
};
pub use resolver::TypeResolver;

use crate::Address;

/// Errors raised while resolving types and generic parameters
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// Nothing matched, even after every fallback
    #[error("Unable to resolve {what}")]
    Unresolvable { what: String },

    /// A non-parameter descriptor was imported as a generic parameter
    #[error("Can't import {0:?} as a generic parameter because it isn't one")]
    NotAGenericParameter(TypeKind),

    /// A generic argument pointer did not lead to a descriptor
    #[error("Generic argument descriptor at 0x{0:x} is missing")]
    MissingGenericArgument(Address),

    /// A metadata table entry the descriptor refers to is absent
    #[error("Missing metadata: {0}")]
    MissingMetadata(String),
}
