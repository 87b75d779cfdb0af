//! Resolved managed method stubs.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::model::{TypeHandle, TypeSignature};

/// How a method is implemented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodImplementation {
    #[default]
    Managed,
    Abstract,
    InternalCall,
    PInvoke,
    Native,
    Runtime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDefinition {
    pub name: String,
    pub parameter_type: TypeSignature,
}

/// Signature and owner of the method whose body is being rebuilt.
#[derive(Debug, Clone)]
pub struct ManagedMethod {
    pub name: String,
    pub declaring_type: TypeHandle,
    pub is_static: bool,
    pub return_type: TypeSignature,
    pub parameters: Vec<ParameterDefinition>,
    pub implementation: MethodImplementation,
}

impl ManagedMethod {
    pub fn new(name: impl Into<String>, declaring_type: TypeHandle, return_type: TypeSignature) -> Self {
        Self {
            name: name.into(),
            declaring_type,
            is_static: false,
            return_type,
            parameters: Vec::new(),
            implementation: MethodImplementation::Managed,
        }
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, parameter_type: TypeSignature) -> Self {
        self.parameters.push(ParameterDefinition {
            name: name.into(),
            parameter_type,
        });
        self
    }

    pub fn with_implementation(mut self, implementation: MethodImplementation) -> Self {
        self.implementation = implementation;
        self
    }

    /// Whether the method has a managed body worth reconstructing.
    pub fn has_body(&self) -> bool {
        self.implementation == MethodImplementation::Managed
    }

    /// Whether the method returns nothing.
    pub fn returns_void(&self) -> bool {
        matches!(
            &self.return_type,
            TypeSignature::Definition(d) if d.namespace == "System" && d.name == "Void"
        )
    }

    /// `Namespace.Type::Name`
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type.full_name(), self.name)
    }
}

impl fmt::Display for ManagedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| format!("{} {}", p.parameter_type, p.name))
            .collect();
        write!(
            f,
            "{}{} {}({})",
            if self.is_static { "static " } else { "" },
            self.return_type,
            self.full_name(),
            params.join(", ")
        )
    }
}
