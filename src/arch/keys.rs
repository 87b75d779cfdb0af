//! Well-known IL2CPP runtime helper addresses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{direct_target, InsnClass, InstructionSet};
use crate::{Address, BinaryImage, MAX_INSTRUCTION_SIZE};

/// Runtime helpers the action engine recognises calls to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFunction {
    InitializeMethod,
    RuntimeClassInit,
    ObjectNew,
    ArrayNew,
    RaiseException,
    RaiseIndexOutOfRange,
    RaiseNullReference,
}

impl KeyFunction {
    pub const ALL: [KeyFunction; 7] = [
        KeyFunction::InitializeMethod,
        KeyFunction::RuntimeClassInit,
        KeyFunction::ObjectNew,
        KeyFunction::ArrayNew,
        KeyFunction::RaiseException,
        KeyFunction::RaiseIndexOutOfRange,
        KeyFunction::RaiseNullReference,
    ];

    /// Export names the helper is known by across IL2CPP versions.
    pub fn export_names(&self) -> &'static [&'static str] {
        match self {
            KeyFunction::InitializeMethod => &[
                "il2cpp_codegen_initialize_method",
                "il2cpp_codegen_initialize_runtime_metadata",
            ],
            KeyFunction::RuntimeClassInit => &["il2cpp_runtime_class_init"],
            KeyFunction::ObjectNew => &["il2cpp_object_new", "il2cpp_codegen_object_new"],
            KeyFunction::ArrayNew => &["il2cpp_array_new_specific", "il2cpp_array_new"],
            KeyFunction::RaiseException => {
                &["il2cpp_raise_exception", "il2cpp_codegen_raise_exception"]
            }
            KeyFunction::RaiseIndexOutOfRange => &[
                "il2cpp_codegen_raise_index_out_of_range_exception",
                "ThrowIndexOutOfRangeException",
            ],
            KeyFunction::RaiseNullReference => &[
                "il2cpp_codegen_raise_null_reference_exception",
                "ThrowNullReferenceException",
            ],
        }
    }

    /// Helpers that never return to the caller.
    pub fn is_noreturn(&self) -> bool {
        matches!(
            self,
            KeyFunction::RaiseException
                | KeyFunction::RaiseIndexOutOfRange
                | KeyFunction::RaiseNullReference
        )
    }
}

/// Per-backend table of runtime helper entry points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFunctionAddresses {
    addresses: HashMap<KeyFunction, Address>,
    by_address: HashMap<Address, KeyFunction>,
}

impl KeyFunctionAddresses {
    /// An empty table (no helper known).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the address of `function`.
    pub fn set(&mut self, function: KeyFunction, address: Address) {
        if let Some(old) = self.addresses.insert(function, address) {
            self.by_address.remove(&old);
        }
        self.by_address.insert(address, function);
    }

    /// Address of `function`, if located.
    pub fn get(&self, function: KeyFunction) -> Option<Address> {
        self.addresses.get(&function).copied()
    }

    /// Which helper, if any, lives at `address`.
    pub fn helper_at(&self, address: Address) -> Option<KeyFunction> {
        self.by_address.get(&address).copied()
    }

    /// Whether a call to `address` never returns.
    pub fn is_noreturn(&self, address: Address) -> bool {
        self.helper_at(address).is_some_and(|f| f.is_noreturn())
    }

    /// Number of located helpers.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether no helper was located.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Match export names, resolving each hit through `resolve`.
    pub fn from_exports<F>(exports: &[(String, Address)], resolve: F) -> Self
    where
        F: Fn(Address) -> Address,
    {
        let mut table = Self::new();
        for function in KeyFunction::ALL {
            let hit = exports.iter().find(|(name, _)| {
                function
                    .export_names()
                    .iter()
                    .any(|candidate| name.trim_start_matches('_') == *candidate)
            });
            if let Some((name, address)) = hit {
                let resolved = resolve(*address);
                log::debug!(
                    "Key function {:?} = {} @ 0x{:x} (export 0x{:x})",
                    function,
                    name,
                    resolved,
                    address
                );
                table.set(function, resolved);
            }
        }
        table
    }
}

/// Follow an export that starts with a direct unconditional jump.
pub(crate) fn follow_thunk(isa: &dyn InstructionSet, image: &BinaryImage, address: Address) -> Address {
    let Some(code) = image.bytes_at(address, MAX_INSTRUCTION_SIZE) else {
        return address;
    };
    match isa.decoder().decode(code, address) {
        Some(insn) if isa.classify(&insn) == InsnClass::Jump => {
            direct_target(&insn).unwrap_or(address)
        }
        _ => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_address() {
        let mut keys = KeyFunctionAddresses::new();
        keys.set(KeyFunction::RaiseException, 0x5000);
        keys.set(KeyFunction::ObjectNew, 0x6000);

        assert_eq!(keys.helper_at(0x5000), Some(KeyFunction::RaiseException));
        assert!(keys.is_noreturn(0x5000));
        assert!(!keys.is_noreturn(0x6000));
        assert_eq!(keys.helper_at(0x7000), None);
    }

    #[test]
    fn test_reassignment_drops_old_address() {
        let mut keys = KeyFunctionAddresses::new();
        keys.set(KeyFunction::ObjectNew, 0x10);
        keys.set(KeyFunction::ObjectNew, 0x20);

        assert_eq!(keys.helper_at(0x10), None);
        assert_eq!(keys.get(KeyFunction::ObjectNew), Some(0x20));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_from_exports() {
        let exports = vec![
            ("_il2cpp_object_new".to_string(), 0x100),
            ("il2cpp_raise_exception".to_string(), 0x200),
            ("unrelated".to_string(), 0x300),
        ];
        let keys = KeyFunctionAddresses::from_exports(&exports, |a| a + 0x1000);

        assert_eq!(keys.get(KeyFunction::ObjectNew), Some(0x1100));
        assert_eq!(keys.get(KeyFunction::RaiseException), Some(0x1200));
        assert_eq!(keys.len(), 2);
    }
}
