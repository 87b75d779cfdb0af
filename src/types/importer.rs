//! Reference importers, one per destination assembly.

use std::sync::Arc;

use dashmap::DashMap;

use super::model::{TypeHandle, TypeSignature};

/// Records which definitions a destination assembly references.
#[derive(Debug)]
pub struct ReferenceImporter {
    assembly: String,
    imported: DashMap<String, TypeHandle>,
}

impl ReferenceImporter {
    pub fn new(assembly: impl Into<String>) -> Self {
        Self {
            assembly: assembly.into(),
            imported: DashMap::new(),
        }
    }

    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    /// Import a definition and return a signature naming it.
    pub fn import_type(&self, definition: &TypeHandle) -> TypeSignature {
        self.imported
            .entry(definition.full_name())
            .or_insert_with(|| definition.clone());
        TypeSignature::Definition(definition.clone())
    }

    /// Import every definition a signature mentions. Generic parameters are
    /// owned by the destination already and pass through untouched.
    pub fn import_signature(&self, signature: TypeSignature) -> TypeSignature {
        match signature {
            TypeSignature::Definition(d) => self.import_type(&d),
            TypeSignature::SzArray(e) => self.import_signature(*e).make_sz_array(),
            TypeSignature::Array { element, rank } => self.import_signature(*element).make_array(rank),
            TypeSignature::Pointer(e) => self.import_signature(*e).make_pointer(),
            TypeSignature::GenericInstance {
                definition,
                is_value_type,
                arguments,
            } => {
                self.import_type(&definition);
                TypeSignature::GenericInstance {
                    definition,
                    is_value_type,
                    arguments: arguments
                        .into_iter()
                        .map(|a| self.import_signature(a))
                        .collect(),
                }
            }
            param @ (TypeSignature::GenericParameter(_) | TypeSignature::GenericParameterRef { .. }) => {
                param
            }
        }
    }

    pub fn is_imported(&self, full_name: &str) -> bool {
        self.imported.contains_key(full_name)
    }

    pub fn imported_count(&self) -> usize {
        self.imported.len()
    }
}

/// Importer-association table keyed by destination assembly name.
#[derive(Debug, Default)]
pub struct ImporterTable {
    by_assembly: DashMap<String, Arc<ReferenceImporter>>,
}

impl ImporterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The importer for `assembly`, created on first use.
    pub fn importer_for(&self, assembly: &str) -> Arc<ReferenceImporter> {
        self.by_assembly
            .entry(assembly.to_string())
            .or_insert_with(|| Arc::new(ReferenceImporter::new(assembly)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.by_assembly.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_assembly.is_empty()
    }
}
