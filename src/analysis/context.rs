//! Per-run environment and per-method analysis state.

use std::fmt;
use std::sync::Arc;

use crate::arch::{InstructionSet, KeyFunctionAddresses};
use crate::cfg::{ControlFlowGraph, ExceptionRegion};
use crate::config::AnalysisOptions;
use crate::isil::{self, IsilBlock};
use crate::types::{ImporterTable, ManagedMethod, ReferenceImporter, TypeResolver};
use crate::{Address, BinaryImage, Insn};

use super::actions::AnalysisAction;
use super::bytecode::CilInstruction;
use super::engine::ActionEngine;
use super::operand::LocalDefinition;
use super::{AnalysisState, NoRuntimeLookup, RuntimeLookup, TaintedAction, TaintedMethod};

/// Destination assembly used when the host does not name one.
pub const DEFAULT_ASSEMBLY: &str = "Assembly-CSharp";

/// Everything shared by the methods of one run.
pub struct AnalysisEnvironment {
    pub resolver: Arc<TypeResolver>,
    pub options: AnalysisOptions,
    pub keys: KeyFunctionAddresses,
    pub runtime: Arc<dyn RuntimeLookup>,
    importers: Arc<ImporterTable>,
    assembly: String,
}

impl AnalysisEnvironment {
    pub fn new(resolver: Arc<TypeResolver>, options: AnalysisOptions) -> Self {
        Self {
            resolver,
            options,
            keys: KeyFunctionAddresses::new(),
            runtime: Arc::new(NoRuntimeLookup),
            importers: Arc::new(ImporterTable::new()),
            assembly: DEFAULT_ASSEMBLY.to_string(),
        }
    }

    pub fn with_keys(mut self, keys: KeyFunctionAddresses) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeLookup>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Share an importer table with other environments.
    pub fn with_importers(mut self, importers: Arc<ImporterTable>) -> Self {
        self.importers = importers;
        self
    }

    /// Assembly the reconstructed bodies are written into.
    pub fn with_assembly(mut self, assembly: impl Into<String>) -> Self {
        self.assembly = assembly.into();
        self
    }

    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    pub fn importers(&self) -> &ImporterTable {
        &self.importers
    }

    /// The importer for the destination assembly.
    pub fn importer(&self) -> Arc<ReferenceImporter> {
        self.importers.importer_for(&self.assembly)
    }
}

impl fmt::Debug for AnalysisEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisEnvironment")
            .field("options", &self.options)
            .field("keys", &self.keys.len())
            .field("assembly", &self.assembly)
            .finish()
    }
}

/// Something incomplete about a method's analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// Nothing decoded at the entry address
    EmptyBody,
    /// The backend has no control flow graph builder
    GraphUnavailable,
    /// The backend has no ISIL translator
    IsilUnavailable,
    /// Blocks ending in indirect branches
    UnknownSuccessors(usize),
    /// Undecodable instruction entries
    DecodeGaps(usize),
    /// ISIL nodes left opaque
    OpaqueIsil(usize),
    /// An action that could not produce bytecode
    Tainted(TaintedAction),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::EmptyBody => write!(f, "no instructions decoded"),
            Diagnostic::GraphUnavailable => write!(f, "control flow graph unavailable"),
            Diagnostic::IsilUnavailable => write!(f, "ISIL translation unavailable"),
            Diagnostic::UnknownSuccessors(n) => write!(f, "{} unresolved indirect branch(es)", n),
            Diagnostic::DecodeGaps(n) => write!(f, "{} undecodable instruction(s)", n),
            Diagnostic::OpaqueIsil(n) => write!(f, "{} opaque ISIL node(s)", n),
            Diagnostic::Tainted(t) => write!(f, "{}", t),
        }
    }
}

/// What the analysis of one method produced.
#[derive(Debug, Clone)]
pub struct MethodReport {
    pub address: Address,
    /// Managed signature of the method
    pub method: String,
    pub state: AnalysisState,
    pub instruction_count: usize,
    /// Block count, when a graph was built
    pub block_count: Option<usize>,
    /// Summary of every action, bookkeeping included
    pub actions: Vec<String>,
    pub pseudocode: String,
    /// Bytecode, when synthesis was requested
    pub bytecode: Option<Result<Vec<CilInstruction>, TaintedMethod>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl MethodReport {
    pub fn is_tainted(&self) -> bool {
        self.state == AnalysisState::Tainted
    }
}

/// Per-method analysis state.
#[derive(Debug)]
pub struct MethodAnalysisContext {
    pub address: Address,
    /// Body length from metadata, when known
    pub length: Option<u64>,
    pub method: Arc<ManagedMethod>,
    pub exception_regions: Vec<ExceptionRegion>,
    state: AnalysisState,
    insns: Vec<Insn>,
    graph: Option<ControlFlowGraph>,
    isil: Vec<IsilBlock>,
    locals: Vec<LocalDefinition>,
    actions: Vec<AnalysisAction>,
    diagnostics: Vec<Diagnostic>,
}

impl MethodAnalysisContext {
    pub fn new(address: Address, length: Option<u64>, method: Arc<ManagedMethod>) -> Self {
        Self {
            address,
            length,
            method,
            exception_regions: Vec::new(),
            state: AnalysisState::Unanalyzed,
            insns: Vec::new(),
            graph: None,
            isil: Vec::new(),
            locals: Vec::new(),
            actions: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn with_exception_regions(mut self, regions: Vec<ExceptionRegion>) -> Self {
        self.exception_regions = regions;
        self
    }

    pub fn state(&self) -> AnalysisState {
        self.state
    }

    pub fn instructions(&self) -> &[Insn] {
        &self.insns
    }

    /// The raw bytes of the decoded body.
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.insns.iter().flat_map(|i| i.bytes().iter().copied()).collect()
    }

    pub fn graph(&self) -> Option<&ControlFlowGraph> {
        self.graph.as_ref()
    }

    pub fn isil(&self) -> &[IsilBlock] {
        &self.isil
    }

    pub fn locals(&self) -> &[LocalDefinition] {
        &self.locals
    }

    pub fn actions(&self) -> &[AnalysisAction] {
        &self.actions
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Run the whole pipeline for this method and report on it.
    pub fn analyze(
        &mut self,
        isa: &dyn InstructionSet,
        image: &BinaryImage,
        env: &AnalysisEnvironment,
    ) -> MethodReport {
        self.decode(isa, image, env);
        if !self.insns.is_empty() {
            self.build_graph(isa, env);
            self.synthesize(isa, env);
        }
        self.report(env.options.emit_bytecode)
    }

    fn decode(&mut self, isa: &dyn InstructionSet, image: &BinaryImage, env: &AnalysisEnvironment) {
        self.state = AnalysisState::Decoding;
        self.insns = isa.decode_method(image, self.address, self.length, &env.options.body_options());

        if self.insns.is_empty() {
            log::warn!("{}: nothing decoded at 0x{:X}", self.method.full_name(), self.address);
            self.diagnostics.push(Diagnostic::EmptyBody);
            self.state = AnalysisState::Tainted;
            return;
        }

        let gaps = self.insns.iter().filter(|i| i.is_invalid()).count();
        if gaps > 0 {
            log::warn!(
                "{}: {} undecodable instruction(s)",
                self.method.full_name(),
                gaps
            );
            self.diagnostics.push(Diagnostic::DecodeGaps(gaps));
        }
        log::debug!(
            "{}: decoded {} instructions at 0x{:X}",
            self.method.full_name(),
            self.insns.len(),
            self.address
        );
    }

    fn build_graph(&mut self, isa: &dyn InstructionSet, env: &AnalysisEnvironment) {
        let Some(mut graph) = isa.build_graph(&self.insns, &env.keys) else {
            log::warn!(
                "{}: no control flow graph for {}",
                self.method.full_name(),
                isa.architecture()
            );
            self.diagnostics.push(Diagnostic::GraphUnavailable);
            return;
        };
        graph.attach_exception_regions(&self.exception_regions);
        self.state = AnalysisState::GraphBuilt;

        let unknown = graph.unknown_successor_count();
        if unknown > 0 {
            self.diagnostics.push(Diagnostic::UnknownSuccessors(unknown));
        }

        self.isil = isa.to_isil(&graph);
        if self.isil.is_empty() {
            log::warn!(
                "{}: no ISIL translation for {}",
                self.method.full_name(),
                isa.architecture()
            );
            self.diagnostics.push(Diagnostic::IsilUnavailable);
        } else {
            let opaque = isil::opaque_count(&self.isil);
            if opaque > 0 {
                self.diagnostics.push(Diagnostic::OpaqueIsil(opaque));
            }
        }
        log::debug!("{}: {} blocks", self.method.full_name(), graph.len());
        self.graph = Some(graph);
    }

    fn synthesize(&mut self, isa: &dyn InstructionSet, env: &AnalysisEnvironment) {
        let engine = ActionEngine::new(isa, env, &self.method, &self.insns);
        let (locals, actions) = engine.run();
        self.locals = locals;
        self.actions = actions;
        self.state = AnalysisState::ActionsSynthesized;

        let taints: Vec<TaintedAction> = self
            .actions
            .iter()
            .filter_map(|a| a.taint(&self.locals))
            .collect();
        self.state = if taints.is_empty() {
            AnalysisState::Emittable
        } else {
            AnalysisState::Tainted
        };
        log::debug!(
            "{}: {} actions, {} tainted",
            self.method.full_name(),
            self.actions.len(),
            taints.len()
        );
        self.diagnostics
            .extend(taints.into_iter().map(Diagnostic::Tainted));
    }

    /// Bytecode for the whole method. Fails on the first tainted action;
    /// nothing partial is ever returned.
    pub fn bytecode(&self) -> Result<Vec<CilInstruction>, TaintedMethod> {
        if self.insns.is_empty() {
            return Err(TaintedMethod::EmptyBody(self.address));
        }
        let mut out = Vec::new();
        for action in &self.actions {
            out.extend(action.to_bytecode(&self.locals)?);
        }
        Ok(out)
    }

    /// Pseudocode of the important actions. Tainted actions are annotated
    /// inline rather than dropped.
    pub fn pseudocode(&self) -> String {
        let mut out = String::new();
        for action in self.actions.iter().filter(|a| a.is_important()) {
            let line = action.to_pseudocode(&self.locals);
            if line.ends_with(':') {
                out.push_str(&line);
            } else {
                out.push_str("    ");
                out.push_str(&line);
            }
            if let Some(taint) = action.taint(&self.locals) {
                out.push_str(&format!(" // tainted: {}", taint.reason));
            }
            out.push('\n');
        }
        out
    }

    pub fn report(&self, emit_bytecode: bool) -> MethodReport {
        MethodReport {
            address: self.address,
            method: self.method.to_string(),
            state: self.state,
            instruction_count: self.insns.len(),
            block_count: self.graph.as_ref().map(ControlFlowGraph::len),
            actions: self.actions.iter().map(|a| a.summary(&self.locals)).collect(),
            pseudocode: self.pseudocode(),
            bytecode: emit_bytecode.then(|| self.bytecode()),
            diagnostics: self.diagnostics.clone(),
        }
    }
}
