//! Descriptor-driven type resolution.
//!
//! [`TypeResolver`] owns the run-wide caches: the name lookup cache and the
//! generic parameter cache. Both sit in [`DashMap`]s so parallel method
//! analyses can share one resolver.

use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use super::descriptor::{MetadataSource, TypeDescriptor, TypeKind};
use super::importer::ReferenceImporter;
use super::lookup::TypeLookup;
use super::model::{GenericParameter, GenericParameterKind, TypeHandle, TypeSignature, TypeTable};
use super::ResolveError;

/// Metadata version from which generic classes hold a descriptor pointer
/// instead of a type definition index.
pub const POINTER_GENERIC_CLASS_VERSION: f32 = 27.0;

pub(crate) type LookupCell = Arc<OnceLock<Option<TypeLookup>>>;

/// Maps native type descriptors and names onto the managed type model.
pub struct TypeResolver {
    pub(crate) table: Arc<TypeTable>,
    metadata: Arc<dyn MetadataSource>,
    pub(crate) by_name: DashMap<String, LookupCell>,
    generic_parameters: DashMap<u32, Arc<ParameterCell>>,
}

impl TypeResolver {
    pub fn new(table: Arc<TypeTable>, metadata: Arc<dyn MetadataSource>) -> Self {
        Self {
            table,
            metadata,
            by_name: DashMap::new(),
            generic_parameters: DashMap::new(),
        }
    }

    pub fn table(&self) -> &TypeTable {
        &self.table
    }

    pub fn metadata(&self) -> &dyn MetadataSource {
        self.metadata.as_ref()
    }

    /// Number of generic parameters constructed so far.
    pub fn cached_generic_parameters(&self) -> usize {
        self.generic_parameters.len()
    }

    fn class_at(&self, index: u64) -> Result<&TypeHandle, ResolveError> {
        self.table
            .get(index as usize)
            .ok_or_else(|| ResolveError::Unresolvable {
                what: format!("type definition index {}", index),
            })
    }

    fn descriptor_at(&self, pointer: u64) -> Result<TypeDescriptor, ResolveError> {
        self.metadata
            .type_at(pointer)
            .ok_or_else(|| ResolveError::MissingMetadata(format!("type descriptor at 0x{:x}", pointer)))
    }

    /// Positional reference for a `VAR`/`MVAR` descriptor.
    fn generic_parameter_ref(&self, descriptor: &TypeDescriptor) -> Result<TypeSignature, ResolveError> {
        let kind = match descriptor.kind {
            TypeKind::MVar => GenericParameterKind::Method,
            TypeKind::Var => GenericParameterKind::Type,
            other => return Err(ResolveError::NotAGenericParameter(other)),
        };
        let index = parameter_index(descriptor)?;
        let info = self
            .metadata
            .generic_parameter(index)
            .ok_or_else(|| ResolveError::MissingMetadata(format!("generic parameter {}", index)))?;
        Ok(TypeSignature::GenericParameterRef {
            kind,
            index: info.index_in_owner,
        })
    }

    /// Resolve a descriptor to a managed signature, importing what it names.
    ///
    /// Unknown kinds resolve to `System.Object`. A generic instance is built
    /// only when every argument resolves.
    pub fn resolve_type(
        &self,
        descriptor: &TypeDescriptor,
        importer: &ReferenceImporter,
    ) -> Result<TypeSignature, ResolveError> {
        if let Some(primitive) = descriptor.kind.primitive() {
            return Ok(importer.import_type(self.table.primitive(primitive)));
        }

        match descriptor.kind {
            TypeKind::Class | TypeKind::ValueType => Ok(importer.import_type(self.class_at(descriptor.data)?)),

            TypeKind::Array => {
                let array = self.metadata.array_type_at(descriptor.data).ok_or_else(|| {
                    ResolveError::MissingMetadata(format!("array type at 0x{:x}", descriptor.data))
                })?;
                let element = self.descriptor_at(array.element)?;
                Ok(self.resolve_type(&element, importer)?.make_array(array.rank))
            }

            TypeKind::SzArray => {
                let element = self.descriptor_at(descriptor.data)?;
                if element.kind.is_generic_parameter() {
                    return Ok(self.generic_parameter_ref(&element)?.make_sz_array());
                }
                Ok(self.resolve_type(&element, importer)?.make_sz_array())
            }

            TypeKind::Ptr => {
                let pointee = self.descriptor_at(descriptor.data)?;
                Ok(self.resolve_type(&pointee, importer)?.make_pointer())
            }

            TypeKind::GenericInst => self.resolve_generic_instance(descriptor, importer),

            TypeKind::Var | TypeKind::MVar => Ok(TypeSignature::GenericParameter(
                self.import_generic_parameter(descriptor, importer)?,
            )),

            other => {
                log::trace!("Descriptor kind {:?} resolves to System.Object", other);
                Ok(importer.import_type(self.table.object()))
            }
        }
    }

    fn resolve_generic_instance(
        &self,
        descriptor: &TypeDescriptor,
        importer: &ReferenceImporter,
    ) -> Result<TypeSignature, ResolveError> {
        let class = self.metadata.generic_class_at(descriptor.data).ok_or_else(|| {
            ResolveError::MissingMetadata(format!("generic class at 0x{:x}", descriptor.data))
        })?;

        let definition = if self.metadata.metadata_version() < POINTER_GENERIC_CLASS_VERSION {
            self.class_at(class.type_definition)?.clone()
        } else {
            let base = self.descriptor_at(class.type_definition)?;
            self.resolve_type(&base, importer)?
                .definition()
                .cloned()
                .ok_or_else(|| ResolveError::Unresolvable {
                    what: "base type for generic instance".to_string(),
                })?
        };

        let pointers = self.metadata.generic_inst_at(class.class_inst).ok_or_else(|| {
            ResolveError::MissingMetadata(format!("generic inst at 0x{:x}", class.class_inst))
        })?;

        let arguments = pointers
            .into_iter()
            .map(|pointer| {
                let argument = self
                    .metadata
                    .type_at(pointer)
                    .ok_or(ResolveError::MissingGenericArgument(pointer))?;
                if argument.kind.is_generic_parameter() {
                    self.generic_parameter_ref(&argument)
                } else {
                    self.resolve_type(&argument, importer)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        importer.import_type(&definition);
        Ok(TypeSignature::GenericInstance {
            is_value_type: definition.is_value_type,
            definition,
            arguments,
        })
    }

    /// Construct, or fetch from the cache, the generic parameter a `VAR` or
    /// `MVAR` descriptor names.
    ///
    /// The parameter is cached before its constraints are resolved, so a
    /// constraint that leads back to it finds the cached handle. Only the
    /// populating thread sees that unfinished handle; other callers for the
    /// same index block until its constraints are set.
    pub fn import_generic_parameter(
        &self,
        descriptor: &TypeDescriptor,
        importer: &ReferenceImporter,
    ) -> Result<Arc<GenericParameter>, ResolveError> {
        let kind = match descriptor.kind {
            TypeKind::Var => GenericParameterKind::Type,
            TypeKind::MVar => GenericParameterKind::Method,
            other => return Err(ResolveError::NotAGenericParameter(other)),
        };
        let index = parameter_index(descriptor)?;

        let cell = match self.generic_parameters.get(&index) {
            Some(cell) => cell.value().clone(),
            None => {
                let info = self.metadata.generic_parameter(index).ok_or_else(|| {
                    ResolveError::MissingMetadata(format!("generic parameter {}", index))
                })?;
                let candidate = ParameterCell::new(
                    GenericParameter::new(info.name, info.flags, kind, info.index_in_owner),
                    info.constraints,
                );
                // The shard lock is released at the end of this statement.
                self.generic_parameters
                    .entry(index)
                    .or_insert(candidate)
                    .value()
                    .clone()
            }
        };

        let current = thread::current().id();
        if cell.outcome.get().is_none() && cell.populator.get() == Some(&current) {
            // A constraint of this parameter refers back to it.
            return Ok(cell.parameter.clone());
        }

        let outcome = cell.outcome.get_or_init(|| {
            let _ = cell.populator.set(current);
            self.populate(index, &cell, importer)
        });
        match outcome {
            Ok(()) => Ok(cell.parameter.clone()),
            Err(e) => {
                self.generic_parameters
                    .remove_if(&index, |_, cached| Arc::ptr_eq(cached, &cell));
                Err(e.clone())
            }
        }
    }

    fn populate(
        &self,
        index: u32,
        cell: &ParameterCell,
        importer: &ReferenceImporter,
    ) -> Result<(), ResolveError> {
        let parameter = &cell.parameter;
        let constraints = cell
            .constraints
            .iter()
            .map(|c| self.resolve_type(c, importer))
            .collect::<Result<Vec<_>, _>>()?;
        log::trace!(
            "Generic parameter {} ({}) with {} constraints",
            index,
            parameter.name,
            constraints.len()
        );
        let _ = parameter.constraints.set(constraints);
        Ok(())
    }
}

/// Generic parameter table index carried by a `VAR`/`MVAR` descriptor.
fn parameter_index(descriptor: &TypeDescriptor) -> Result<u32, ResolveError> {
    u32::try_from(descriptor.data).map_err(|_| {
        ResolveError::MissingMetadata(format!("generic parameter {}", descriptor.data))
    })
}

/// A cached generic parameter and the state of its constraint resolution.
struct ParameterCell {
    parameter: Arc<GenericParameter>,
    /// Constraint descriptors still to be resolved
    constraints: Vec<TypeDescriptor>,
    /// Thread running the population, once it started
    populator: OnceLock<ThreadId>,
    outcome: OnceLock<Result<(), ResolveError>>,
}

impl ParameterCell {
    fn new(parameter: GenericParameter, constraints: Vec<TypeDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            parameter: Arc::new(parameter),
            constraints,
            populator: OnceLock::new(),
            outcome: OnceLock::new(),
        })
    }
}
