//! The analysis action engine.
//!
//! A [`MethodAnalysisContext`] walks one decoded method, simulating which
//! managed value each register and stack slot holds, and records an ordered
//! list of [`AnalysisAction`]s. The list renders as pseudocode and, when no
//! action is tainted, as bytecode.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::types::{ManagedMethod, TypeHandle};
use crate::Address;

pub mod actions;
pub mod bytecode;
mod context;
mod engine;
pub mod operand;

pub use actions::{Action, ActionKind, AnalysisAction, Comparison};
pub use bytecode::{CilInstruction, MethodRef};
pub use context::{AnalysisEnvironment, Diagnostic, MethodAnalysisContext, MethodReport};
pub use operand::{
    ActionInput, AnalysedOperand, ConstantValue, FieldRef, LocalDefinition, LocalId, LocalKind,
};

/// Offset of the static field block pointer inside a 64-bit runtime class.
pub const STATIC_FIELDS_OFFSET: i64 = 0xB8;

/// Lifecycle of one method analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AnalysisState {
    Unanalyzed,
    Decoding,
    GraphBuilt,
    ActionsSynthesized,
    /// Every action produced valid bytecode
    Emittable,
    /// At least one action could not be synthesized
    Tainted,
}

impl AnalysisState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisState::Emittable | AnalysisState::Tainted)
    }
}

impl fmt::Display for AnalysisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why an action cannot produce bytecode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaintReason {
    #[error("no value is known for {0}")]
    MissingOperand(String),

    #[error("call to unresolved function 0x{0:X}")]
    UnresolvedCall(Address),

    #[error("no field matches {0}")]
    UnresolvedField(String),

    #[error("{0} cannot be pushed as a managed value")]
    NotLoadable(String),

    #[error("conditional branch without a preceding compare")]
    NoComparison,

    #[error("branch condition is not reconstructed")]
    UnmodeledCondition,

    #[error("control leaves the method towards 0x{0:X}")]
    LeavesMethod(Address),

    #[error("type {0} could not be resolved")]
    MissingType(String),

    #[error("{0} arguments are passed on the stack")]
    StackArguments(usize),

    #[error("loop-carried value in {0} is not reconstructed")]
    LoopCarried(String),

    #[error("{0}")]
    Unmodeled(String),
}

/// A tainted action: where it came from and why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Tainted action at 0x{address:X}: {reason}")]
pub struct TaintedAction {
    pub address: Address,
    pub reason: TaintReason,
}

/// Why bytecode could not be produced for a whole method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaintedMethod {
    #[error("No instructions could be decoded at 0x{0:X}")]
    EmptyBody(Address),

    #[error(transparent)]
    Action(#[from] TaintedAction),
}

/// Host-provided knowledge about the runtime's global tables.
pub trait RuntimeLookup: Send + Sync {
    /// The managed method whose code starts at `address`.
    fn method_at(&self, address: Address) -> Option<Arc<ManagedMethod>>;

    /// The class whose runtime structure pointer is stored at `address`.
    /// For array classes this is the element class, as `il2cpp_array_new_specific`
    /// callers pass it.
    fn class_at(&self, address: Address) -> Option<TypeHandle>;

    /// The string literal stored at `address`.
    fn string_literal_at(&self, _address: Address) -> Option<String> {
        None
    }
}

/// Knows nothing; every call and global is unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRuntimeLookup;

impl RuntimeLookup for NoRuntimeLookup {
    fn method_at(&self, _address: Address) -> Option<Arc<ManagedMethod>> {
        None
    }

    fn class_at(&self, _address: Address) -> Option<TypeHandle> {
        None
    }
}

/// A lookup backed by prebuilt address maps.
#[derive(Debug, Clone, Default)]
pub struct StaticRuntimeLookup {
    methods: HashMap<Address, Arc<ManagedMethod>>,
    classes: HashMap<Address, TypeHandle>,
    strings: HashMap<Address, String>,
}

impl StaticRuntimeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, address: Address, method: Arc<ManagedMethod>) -> Self {
        self.methods.insert(address, method);
        self
    }

    pub fn with_class(mut self, address: Address, class: TypeHandle) -> Self {
        self.classes.insert(address, class);
        self
    }

    pub fn with_string(mut self, address: Address, literal: impl Into<String>) -> Self {
        self.strings.insert(address, literal.into());
        self
    }
}

impl RuntimeLookup for StaticRuntimeLookup {
    fn method_at(&self, address: Address) -> Option<Arc<ManagedMethod>> {
        self.methods.get(&address).cloned()
    }

    fn class_at(&self, address: Address) -> Option<TypeHandle> {
        self.classes.get(&address).cloned()
    }

    fn string_literal_at(&self, address: Address) -> Option<String> {
        self.strings.get(&address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeDefinition;

    #[test]
    fn test_terminal_states() {
        assert!(AnalysisState::Emittable.is_terminal());
        assert!(AnalysisState::Tainted.is_terminal());
        assert!(!AnalysisState::ActionsSynthesized.is_terminal());
    }

    #[test]
    fn test_taint_messages() {
        let taint = TaintedAction {
            address: 0x1004,
            reason: TaintReason::MissingOperand("rdx".to_string()),
        };
        assert_eq!(taint.to_string(), "Tainted action at 0x1004: no value is known for rdx");
        let method: TaintedMethod = taint.clone().into();
        assert_eq!(method, TaintedMethod::Action(taint));
    }

    #[test]
    fn test_static_lookup() {
        let class = TypeDefinition::new("Game", "Player").into_handle();
        let lookup = StaticRuntimeLookup::new()
            .with_class(0x5000, class.clone())
            .with_string(0x5008, "hello");

        assert!(Arc::ptr_eq(&lookup.class_at(0x5000).unwrap(), &class));
        assert_eq!(lookup.string_literal_at(0x5008).as_deref(), Some("hello"));
        assert!(lookup.method_at(0x5000).is_none());
        assert!(NoRuntimeLookup.class_at(0x5000).is_none());
    }
}
