//! The instruction walker.
//!
//! Instructions are visited in address order. The machine state maps each
//! canonical register (and each frame-relative stack slot) to the operand it
//! is believed to hold. Every result gets a fresh local; a register that is
//! reused is simply rebound.
//!
//! At a branch target the state is rebuilt from what the incoming forward
//! branches saw: replaced when control cannot fall into the target, merged
//! (agreeing bindings only) when it can.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::arch::{
    direct_target, ArithmeticOp, CallingConvention, Condition, InsnClass, InstructionSet,
    KeyFunction,
};
use crate::types::{ManagedMethod, PrimitiveKind, ReferenceImporter, TypeSignature};
use crate::{Address, Insn, MemoryOperand, Operand};

use super::actions::{
    ActionKind, AllocateAction, AllocateArrayAction, AnalysisAction, ArithmeticAction,
    CallAction, Comparison, ConditionalBranchAction, ConstantLoadAction, ConvertAction,
    FieldReadAction, FieldWriteAction, GlobalLoadAction, JumpAction, LabelAction,
    RegisterCopyAction, ReturnAction, RuntimeHelperAction, StackSpillAction, ThrowAction,
    ThrowNewAction, UnmodeledAction,
};
use super::bytecode::CilInstruction;
use super::context::AnalysisEnvironment;
use super::operand::{
    ActionInput, AnalysedOperand, ConstantValue, FieldRef, LocalDefinition, LocalId, LocalKind,
};
use super::{TaintReason, STATIC_FIELDS_OFFSET};

/// Extension mnemonics and whether they sign-extend.
const CONVERSIONS: &[(&str, bool)] = &[
    ("movsx", true),
    ("movsxd", true),
    ("movzx", false),
    ("sxtb", true),
    ("sxth", true),
    ("sxtw", true),
    ("uxtb", false),
    ("uxth", false),
    ("uxtw", false),
];

const ZERO_REGISTER: &str = "xzr";

type StackSlot = (String, i64);

#[derive(Debug, Clone, Default, PartialEq)]
struct MachineState {
    registers: HashMap<String, AnalysedOperand>,
    stack: HashMap<StackSlot, AnalysedOperand>,
    pushed: Vec<Option<AnalysedOperand>>,
    comparison: Option<Comparison>,
}

impl MachineState {
    /// Keep only what both states agree on.
    fn merge(&mut self, other: &MachineState) {
        self.registers.retain(|k, v| other.registers.get(k) == Some(v));
        self.stack.retain(|k, v| other.stack.get(k) == Some(v));
        if self.pushed != other.pushed {
            self.pushed.clear();
        }
        if self.comparison != other.comparison {
            self.comparison = None;
        }
    }
}

/// Where a memory operand points.
enum Place {
    Stack(StackSlot),
    Global(Address),
    Relative { base: AnalysedOperand, offset: i64 },
    Unknown,
}

/// How a managed argument reaches the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgumentSlot {
    Register(&'static str),
    FloatingPoint,
    Stack,
}

fn is_floating_point(ty: &TypeSignature) -> bool {
    matches!(
        ty,
        TypeSignature::Definition(d)
            if d.namespace == "System" && (d.name == "Single" || d.name == "Double")
    )
}

pub(crate) struct ActionEngine<'a> {
    isa: &'a dyn InstructionSet,
    env: &'a AnalysisEnvironment,
    method: &'a ManagedMethod,
    insns: &'a [Insn],
    convention: CallingConvention,
    importer: Arc<ReferenceImporter>,
    addresses: HashSet<Address>,
    labels: BTreeSet<Address>,
    locals: Vec<LocalDefinition>,
    actions: Vec<AnalysisAction>,
    state: MachineState,
    incoming: HashMap<Address, MachineState>,
    /// Instruction index and state at each label already walked
    entered: HashMap<Address, (usize, MachineState)>,
    variables: u16,
}

impl<'a> ActionEngine<'a> {
    pub(crate) fn new(
        isa: &'a dyn InstructionSet,
        env: &'a AnalysisEnvironment,
        method: &'a ManagedMethod,
        insns: &'a [Insn],
    ) -> Self {
        let addresses: HashSet<Address> = insns.iter().map(|i| i.addr).collect();
        let labels = insns
            .iter()
            .filter(|i| {
                matches!(
                    isa.classify(i),
                    InsnClass::ConditionalJump(_) | InsnClass::CompareZeroAndBranch(_) | InsnClass::Jump
                )
            })
            .filter_map(direct_target)
            .filter(|t| addresses.contains(t))
            .collect();

        Self {
            isa,
            env,
            method,
            insns,
            convention: isa.calling_convention(env.options.abi),
            importer: env.importer(),
            addresses,
            labels,
            locals: Vec::new(),
            actions: Vec::new(),
            state: MachineState::default(),
            incoming: HashMap::new(),
            entered: HashMap::new(),
            variables: 0,
        }
    }

    /// Walk the body and hand back the locals and actions.
    pub(crate) fn run(mut self) -> (Vec<LocalDefinition>, Vec<AnalysisAction>) {
        self.bind_parameters();

        let insns = self.insns;
        let mut falls_through = true;
        for (index, insn) in insns.iter().enumerate() {
            if self.labels.contains(&insn.addr) {
                self.enter_label(index, insn.addr, falls_through);
            }
            let class = self.isa.classify(insn);
            log::trace!("0x{:X} {} => {:?}", insn.addr, insn, class);
            self.step(insn, class);
            falls_through = !class.ends_flow() && !self.is_noreturn_call(insn, class);
        }
        (self.locals, self.actions)
    }

    fn step(&mut self, insn: &Insn, class: InsnClass) {
        match class {
            InsnClass::Nop | InsnClass::Trap => {}
            InsnClass::Move => self.on_move(insn),
            InsnClass::Load => self.on_load(insn),
            InsnClass::Store => self.on_store(insn),
            InsnClass::LoadAddress => self.on_load_address(insn),
            InsnClass::Arithmetic(op) => self.on_arithmetic(insn, op),
            InsnClass::Compare => self.on_compare(insn, false),
            InsnClass::Test => self.on_compare(insn, true),
            InsnClass::ConditionalJump(condition) => {
                let comparison = self.state.comparison.clone();
                self.on_conditional(insn, condition, comparison);
            }
            InsnClass::CompareZeroAndBranch(condition) => {
                let comparison = insn.operand(0).map(|op| {
                    let width = self.operand_width(op);
                    Comparison {
                        lhs: self.input_for(op, width),
                        rhs: ActionInput::resolved("#0", AnalysedOperand::Constant(ConstantValue::for_width(0, width))),
                        modeled: true,
                    }
                });
                self.on_conditional(insn, condition, comparison);
            }
            InsnClass::Jump => self.on_jump(insn),
            InsnClass::Call => self.on_call(insn),
            InsnClass::IndirectCall => {
                self.unmodeled(insn, TaintReason::Unmodeled("indirect call".to_string()));
                self.clobber();
            }
            InsnClass::IndirectJump => {
                self.unmodeled(insn, TaintReason::Unmodeled("indirect jump".to_string()))
            }
            InsnClass::Return => self.on_return(insn),
            InsnClass::Push => self.on_push(insn),
            InsnClass::Pop => self.on_pop(insn),
            InsnClass::Invalid => {
                self.unmodeled(insn, TaintReason::Unmodeled("undecodable bytes".to_string()))
            }
            InsnClass::Unknown => {
                self.unmodeled(
                    insn,
                    TaintReason::Unmodeled(format!("unmodeled instruction {}", insn.mnemonic)),
                );
                if let Some(dst) = insn.operand(0).and_then(Operand::register) {
                    self.bind(dst, None);
                }
                self.state.comparison = None;
            }
        }
    }

    // State helpers

    fn push(&mut self, address: Address, kind: ActionKind) {
        self.actions.push(AnalysisAction::new(address, kind));
    }

    fn unmodeled(&mut self, insn: &Insn, reason: TaintReason) {
        log::trace!("0x{:X}: {}", insn.addr, reason);
        let instruction = format!("{} {}", insn.mnemonic, insn.op_str).trim_end().to_string();
        self.push(insn.addr, ActionKind::Unmodeled(UnmodeledAction { instruction, reason }));
    }

    fn canonical(&self, register: &str) -> String {
        self.isa.canonical_register(register)
    }

    fn is_frame(&self, register: &str) -> bool {
        self.convention.is_frame_register(&self.canonical(register))
    }

    fn width(&self, register: &str) -> u16 {
        self.isa.register_width(register).unwrap_or(64)
    }

    fn operand_width(&self, op: &Operand) -> u16 {
        match op {
            Operand::Register(r) => self.width(r),
            Operand::Memory(m) => m.size.map_or(32, |s| u16::from(s) * 8),
            _ => 32,
        }
    }

    fn bind(&mut self, register: &str, value: Option<AnalysedOperand>) {
        let key = self.canonical(register);
        match value {
            Some(value) => {
                self.state.registers.insert(key, value);
            }
            None => {
                self.state.registers.remove(&key);
            }
        }
    }

    fn read_register(&self, register: &str) -> ActionInput {
        let key = self.canonical(register);
        if key == ZERO_REGISTER {
            let zero = ConstantValue::for_width(0, self.width(register));
            return ActionInput::resolved(register, AnalysedOperand::Constant(zero));
        }
        ActionInput::new(register, self.state.registers.get(&key).cloned())
    }

    /// Value of a source operand; immediates are typed by `width`.
    fn input_for(&self, op: &Operand, width: u16) -> ActionInput {
        match op {
            Operand::Register(r) => self.read_register(r),
            Operand::Immediate(v) => ActionInput::resolved(
                op.to_string(),
                AnalysedOperand::Constant(ConstantValue::for_width(*v, width)),
            ),
            other => ActionInput::new(other.to_string(), None),
        }
    }

    fn primitive(&self, kind: PrimitiveKind) -> TypeSignature {
        self.importer
            .import_type(self.env.resolver.table().primitive(kind))
    }

    fn integer_for_width(&self, width: u16) -> TypeSignature {
        if width <= 32 {
            self.primitive(PrimitiveKind::Int32)
        } else {
            self.primitive(PrimitiveKind::Int64)
        }
    }

    fn new_variable(&mut self, ty: TypeSignature, register: Option<String>) -> LocalId {
        let id = self.locals.len();
        let slot = self.variables;
        self.variables += 1;
        log::trace!("New local{} of type {}", slot, ty);
        self.locals.push(LocalDefinition {
            id,
            name: format!("local{}", slot),
            ty,
            register,
            kind: LocalKind::Variable(slot),
        });
        id
    }

    /// Fresh local for a value landing in `register`.
    fn define(&mut self, register: &str, ty: TypeSignature) -> LocalId {
        let id = self.new_variable(ty, Some(self.canonical(register)));
        self.bind(register, Some(AnalysedOperand::Local(id)));
        id
    }

    fn clobber(&mut self) {
        for register in self.convention.volatile_registers {
            self.state.registers.remove(*register);
        }
        self.state.comparison = None;
    }

    fn is_noreturn_call(&self, insn: &Insn, class: InsnClass) -> bool {
        class == InsnClass::Call
            && direct_target(insn).is_some_and(|t| self.env.keys.is_noreturn(t))
    }

    /// Integer register, if any, carrying each managed argument.
    fn argument_slots(&self, method: &ManagedMethod) -> Vec<ArgumentSlot> {
        let registers = self.convention.argument_registers;
        let floats = std::iter::repeat(false)
            .take(usize::from(!method.is_static))
            .chain(method.parameters.iter().map(|p| is_floating_point(&p.parameter_type)));

        let mut integer_index = 0;
        floats
            .enumerate()
            .map(|(position, float)| {
                if float {
                    return ArgumentSlot::FloatingPoint;
                }
                let index = if self.convention.positional_arguments {
                    position
                } else {
                    integer_index
                };
                integer_index += 1;
                registers
                    .get(index)
                    .map_or(ArgumentSlot::Stack, |r| ArgumentSlot::Register(*r))
            })
            .collect()
    }

    fn bind_parameters(&mut self) {
        let method = self.method;
        let slots = self.argument_slots(method);
        let mut slots = slots.into_iter();

        if !method.is_static {
            let ty = self.importer.import_type(&method.declaring_type);
            self.define_argument(LocalKind::This, "this".to_string(), ty, slots.next());
        }
        let first = u16::from(!method.is_static);
        for (i, parameter) in method.parameters.iter().enumerate() {
            let slot = first + i as u16;
            let name = if parameter.name.is_empty() {
                format!("arg{}", slot)
            } else {
                parameter.name.clone()
            };
            let ty = self.importer.import_signature(parameter.parameter_type.clone());
            self.define_argument(LocalKind::Parameter(slot), name, ty, slots.next());
        }
    }

    fn define_argument(
        &mut self,
        kind: LocalKind,
        name: String,
        ty: TypeSignature,
        slot: Option<ArgumentSlot>,
    ) {
        let id = self.locals.len();
        let register = match slot {
            Some(ArgumentSlot::Register(r)) => Some(r.to_string()),
            _ => None,
        };
        if let Some(r) = &register {
            self.state.registers.insert(r.clone(), AnalysedOperand::Local(id));
        }
        self.locals.push(LocalDefinition {
            id,
            name,
            ty,
            register,
            kind,
        });
    }

    // Control flow

    fn enter_label(&mut self, index: usize, address: Address, falls_through: bool) {
        match (self.incoming.remove(&address), falls_through) {
            (Some(incoming), true) => self.state.merge(&incoming),
            (Some(incoming), false) => self.state = incoming,
            // Only reached backwards; the back edge is checked against this.
            (None, _) => {}
        }
        self.entered.insert(address, (index, self.state.clone()));
        self.push(address, ActionKind::Label(LabelAction { address }));
    }

    fn record_branch(&mut self, from: Address, target: Address) {
        if target <= from {
            return self.check_back_edge(from, target);
        }
        match self.incoming.get_mut(&target) {
            Some(existing) => existing.merge(&self.state),
            None => {
                self.incoming.insert(target, self.state.clone());
            }
        }
    }

    /// Taint a back edge when the loop reads a register or stack slot whose
    /// binding at the loop head no longer holds.
    fn check_back_edge(&mut self, from: Address, target: Address) {
        let insns = self.insns;
        let Some((head, snapshot)) = self.entered.get(&target) else {
            return;
        };
        let Some(tail) = insns.iter().position(|i| i.addr == from) else {
            return;
        };
        let body = &insns[*head..=tail];

        let mut carried: Vec<String> = snapshot
            .registers
            .iter()
            .filter(|(register, value)| self.state.registers.get(*register) != Some(*value))
            .filter(|(register, _)| self.register_live_in(body, register))
            .map(|(register, _)| register.clone())
            .collect();
        carried.extend(
            snapshot
                .stack
                .iter()
                .filter(|(slot, value)| self.state.stack.get(*slot) != Some(*value))
                .filter(|(slot, _)| self.slot_live_in(body, slot))
                .map(|((base, offset), _)| format!("[{}{:+}]", base, offset)),
        );
        if carried.is_empty() {
            return;
        }
        carried.sort();
        self.unmodeled(&insns[tail], TaintReason::LoopCarried(carried.join(", ")));
    }

    /// Whether `body` reads `register` before overwriting it.
    fn register_live_in(&self, body: &[Insn], register: &str) -> bool {
        let names = |r: &str| self.canonical(r) == register;
        for insn in body {
            let class = self.isa.classify(insn);
            let destination_only = match class {
                InsnClass::Move | InsnClass::Load | InsnClass::LoadAddress | InsnClass::Pop => true,
                InsnClass::Arithmetic(_) => insn.operands.len() >= 3,
                _ => false,
            };
            let read = insn.operands.iter().enumerate().any(|(i, op)| match op {
                Operand::Register(r) => names(r) && !(i == 0 && destination_only),
                Operand::Memory(m) => {
                    m.base.as_deref().is_some_and(names) || m.index.as_deref().is_some_and(names)
                }
                _ => false,
            });
            let call = matches!(class, InsnClass::Call | InsnClass::IndirectCall);
            let implicit = (call && self.convention.argument_registers.iter().any(|r| *r == register))
                || (class == InsnClass::Return && register == self.convention.return_register);
            if read || implicit {
                return true;
            }
            let written = matches!(insn.operand(0), Some(Operand::Register(r)) if names(r))
                || (call && self.convention.volatile_registers.iter().any(|r| *r == register));
            if written {
                return false;
            }
        }
        false
    }

    /// Whether `body` loads the stack slot before storing to it.
    fn slot_live_in(&self, body: &[Insn], slot: &StackSlot) -> bool {
        for insn in body {
            let touches = insn.operands.iter().any(|op| {
                op.memory().is_some_and(|m| {
                    m.index.is_none()
                        && m.displacement == slot.1
                        && m.base.as_deref().is_some_and(|b| self.canonical(b) == slot.0)
                })
            });
            if touches {
                return self.isa.classify(insn) != InsnClass::Store;
            }
        }
        false
    }

    fn on_conditional(&mut self, insn: &Insn, condition: Condition, comparison: Option<Comparison>) {
        let Some(target) = direct_target(insn) else {
            return self.unmodeled(insn, TaintReason::Unmodeled("branch without target".to_string()));
        };
        let inside = self.addresses.contains(&target);
        self.push(
            insn.addr,
            ActionKind::ConditionalBranch(ConditionalBranchAction {
                condition,
                comparison,
                target,
                inside,
            }),
        );
        if inside {
            self.record_branch(insn.addr, target);
        }
    }

    fn on_jump(&mut self, insn: &Insn) {
        let Some(target) = direct_target(insn) else {
            return self.unmodeled(insn, TaintReason::Unmodeled("jump without target".to_string()));
        };
        let inside = self.addresses.contains(&target);
        if !inside && self.env.runtime.method_at(target).is_some() {
            // Tail call.
            self.on_managed_call(insn, target);
            return self.on_return(insn);
        }
        self.push(insn.addr, ActionKind::Jump(JumpAction { target, inside }));
        if inside {
            self.record_branch(insn.addr, target);
        }
    }

    fn on_return(&mut self, insn: &Insn) {
        let value = if self.method.returns_void() {
            None
        } else if is_floating_point(&self.method.return_type) {
            Some(ActionInput::new("floating point return", None))
        } else {
            Some(self.read_register(self.convention.return_register))
        };
        self.push(insn.addr, ActionKind::Return(ReturnAction { value }));
    }

    // Data movement

    fn on_move(&mut self, insn: &Insn) {
        let (Some(Operand::Register(dst)), Some(src), 2) =
            (insn.operand(0), insn.operand(1), insn.operands.len())
        else {
            return self.unmodeled(insn, TaintReason::Unmodeled(format!("{} operand form", insn.mnemonic)));
        };
        if self.is_frame(dst) {
            return;
        }

        if let Some((_, signed)) = CONVERSIONS.iter().find(|(m, _)| *m == insn.mnemonic) {
            return self.on_convert(insn, dst, src, *signed);
        }

        match src {
            Operand::Immediate(v) => {
                let value = ConstantValue::for_width(*v, self.width(dst));
                self.bind(dst, Some(AnalysedOperand::Constant(value.clone())));
                self.push(
                    insn.addr,
                    ActionKind::ConstantLoad(ConstantLoadAction {
                        register: dst.clone(),
                        value,
                    }),
                );
            }
            Operand::Register(r) if self.is_frame(r) => self.bind(dst, None),
            Operand::Register(r) => {
                let source = self.read_register(r);
                self.bind(dst, source.value.clone());
                self.push(
                    insn.addr,
                    ActionKind::RegisterCopy(RegisterCopyAction {
                        destination: dst.clone(),
                        source,
                    }),
                );
            }
            _ => self.unmodeled(insn, TaintReason::Unmodeled(format!("{} source", insn.mnemonic))),
        }
    }

    fn on_convert(&mut self, insn: &Insn, dst: &str, src: &Operand, signed: bool) {
        let from = self.operand_width(src);
        let to = self.width(dst);
        let source = self.input_for(src, from);

        let mut conversions = vec![CilInstruction::extend(from, signed)];
        if to > 32 {
            conversions.push(CilInstruction::extend(64, signed));
        }
        let ty = self.integer_for_width(to);
        let result = self.define(dst, ty);
        self.push(
            insn.addr,
            ActionKind::Convert(ConvertAction {
                source,
                conversions,
                result,
            }),
        );
    }

    fn place(&self, insn: &Insn, mem: &MemoryOperand) -> Place {
        if mem.segment.is_some() || mem.index.is_some() {
            return Place::Unknown;
        }
        let Some(base) = &mem.base else {
            return Place::Global(mem.displacement as Address);
        };
        if base == "rip" {
            return Place::Global(insn.end().wrapping_add_signed(mem.displacement));
        }
        if self.is_frame(base) {
            return Place::Stack((self.canonical(base), mem.displacement));
        }
        match self.state.registers.get(&self.canonical(base)) {
            Some(AnalysedOperand::Constant(c)) => match c.as_integer() {
                Some(a) => Place::Global((a as Address).wrapping_add_signed(mem.displacement)),
                None => Place::Unknown,
            },
            Some(value) => Place::Relative {
                base: value.clone(),
                offset: mem.displacement,
            },
            None => Place::Unknown,
        }
    }

    /// The field at `offset` from `base`, when `base` is typed.
    fn field_at(&self, base: &AnalysedOperand, offset: i64) -> Option<AnalysedOperand> {
        let offset = u32::try_from(offset).ok()?;
        match base {
            AnalysedOperand::Local(id) => {
                let owner = self.locals.get(*id)?.ty.definition()?;
                let field = owner.field_at_offset(offset)?;
                Some(AnalysedOperand::Field {
                    instance: Some(*id),
                    field: FieldRef::new(owner, field),
                })
            }
            AnalysedOperand::StaticFields(owner) => {
                let field = owner.static_field_at_offset(offset)?;
                Some(AnalysedOperand::Field {
                    instance: None,
                    field: FieldRef::new(owner, field),
                })
            }
            _ => None,
        }
    }

    fn on_load(&mut self, insn: &Insn) {
        let (Some(Operand::Register(dst)), Some(mem)) = (
            insn.operand(0),
            insn.operands.iter().skip(1).find_map(Operand::memory),
        ) else {
            return self.unmodeled(insn, TaintReason::Unmodeled(format!("{} operand form", insn.mnemonic)));
        };
        if self.is_frame(dst) {
            return;
        }

        match self.place(insn, mem) {
            Place::Stack(slot) => {
                let value = self.state.stack.get(&slot).cloned();
                self.bind(dst, value.clone());
                self.push(
                    insn.addr,
                    ActionKind::StackSpill(StackSpillAction {
                        register: dst.clone(),
                        slot: mem.to_string(),
                        spill: false,
                        value,
                    }),
                );
            }
            Place::Global(address) => {
                let value = self
                    .env
                    .runtime
                    .class_at(address)
                    .map(AnalysedOperand::ClassPointer)
                    .or_else(|| {
                        self.env
                            .runtime
                            .string_literal_at(address)
                            .map(|s| AnalysedOperand::Constant(ConstantValue::String(s)))
                    });
                if value.is_none() {
                    log::trace!("Global 0x{:X} is not known to the runtime lookup", address);
                }
                self.bind(dst, value.clone());
                self.push(
                    insn.addr,
                    ActionKind::GlobalLoad(GlobalLoadAction {
                        register: dst.clone(),
                        address: Some(address),
                        value,
                    }),
                );
            }
            Place::Relative {
                base: AnalysedOperand::ClassPointer(class),
                offset: STATIC_FIELDS_OFFSET,
            } => {
                let value = Some(AnalysedOperand::StaticFields(class));
                self.bind(dst, value.clone());
                self.push(
                    insn.addr,
                    ActionKind::GlobalLoad(GlobalLoadAction {
                        register: dst.clone(),
                        address: None,
                        value,
                    }),
                );
            }
            Place::Relative { base, offset } => {
                let (field, result) = match self.field_at(&base, offset) {
                    Some(field) => {
                        let ty = match &field {
                            AnalysedOperand::Field { field, .. } => {
                                self.importer.import_signature(field.field_type.clone())
                            }
                            _ => self.integer_for_width(self.width(dst)),
                        };
                        let result = self.define(dst, ty);
                        (ActionInput::resolved(mem.to_string(), field), Some(result))
                    }
                    None => {
                        self.bind(dst, None);
                        (ActionInput::new(mem.to_string(), None), None)
                    }
                };
                self.push(insn.addr, ActionKind::FieldRead(FieldReadAction { field, result }));
            }
            Place::Unknown => {
                self.bind(dst, None);
                self.push(
                    insn.addr,
                    ActionKind::FieldRead(FieldReadAction {
                        field: ActionInput::new(mem.to_string(), None),
                        result: None,
                    }),
                );
            }
        }
    }

    fn on_store(&mut self, insn: &Insn) {
        let Some((mem_index, mem)) = insn
            .operands
            .iter()
            .enumerate()
            .find_map(|(i, op)| op.memory().map(|m| (i, m)))
        else {
            return self.unmodeled(insn, TaintReason::Unmodeled(format!("{} operand form", insn.mnemonic)));
        };
        let Some(src) = insn
            .operands
            .iter()
            .enumerate()
            .find(|(i, _)| *i != mem_index)
            .map(|(_, op)| op)
        else {
            return self.unmodeled(insn, TaintReason::Unmodeled(format!("{} operand form", insn.mnemonic)));
        };

        let width = match (mem.size, src) {
            (Some(size), _) => u16::from(size) * 8,
            (None, op) => self.operand_width(op),
        };
        let value = self.input_for(src, width);

        match self.place(insn, mem) {
            Place::Stack(slot) => {
                match &value.value {
                    Some(v) => {
                        self.state.stack.insert(slot, v.clone());
                    }
                    None => {
                        self.state.stack.remove(&slot);
                    }
                }
                self.push(
                    insn.addr,
                    ActionKind::StackSpill(StackSpillAction {
                        register: src.to_string(),
                        slot: mem.to_string(),
                        spill: true,
                        value: value.value,
                    }),
                );
            }
            Place::Relative { base, offset } => {
                let field = ActionInput::new(mem.to_string(), self.field_at(&base, offset));
                self.push(insn.addr, ActionKind::FieldWrite(FieldWriteAction { field, value }));
            }
            Place::Global(_) | Place::Unknown => {
                let field = ActionInput::new(mem.to_string(), None);
                self.push(insn.addr, ActionKind::FieldWrite(FieldWriteAction { field, value }));
            }
        }
    }

    fn on_load_address(&mut self, insn: &Insn) {
        let Some(Operand::Register(dst)) = insn.operand(0) else {
            return self.unmodeled(insn, TaintReason::Unmodeled(format!("{} operand form", insn.mnemonic)));
        };
        if self.is_frame(dst) {
            return;
        }
        let address = match insn.operand(1) {
            Some(Operand::Immediate(v)) => Some(*v as Address),
            Some(Operand::Memory(mem)) => match self.place(insn, mem) {
                Place::Global(a) => Some(a),
                _ => None,
            },
            _ => None,
        };
        match address {
            Some(a) => {
                let value = ConstantValue::Int64(a as i64);
                self.bind(dst, Some(AnalysedOperand::Constant(value.clone())));
                self.push(
                    insn.addr,
                    ActionKind::ConstantLoad(ConstantLoadAction {
                        register: dst.clone(),
                        value,
                    }),
                );
            }
            None => {
                log::trace!("0x{:X}: address computation into {} not tracked", insn.addr, dst);
                self.bind(dst, None);
            }
        }
    }

    fn on_push(&mut self, insn: &Insn) {
        let value = insn
            .operand(0)
            .and_then(|op| self.input_for(op, 64).value);
        self.state.pushed.push(value);
    }

    fn on_pop(&mut self, insn: &Insn) {
        let value = self.state.pushed.pop().flatten();
        if let Some(dst) = insn.operand(0).and_then(Operand::register) {
            if !self.is_frame(dst) {
                self.bind(dst, value);
            }
        }
    }

    // Arithmetic and compares

    fn on_arithmetic(&mut self, insn: &Insn, op: ArithmeticOp) {
        let ops = &insn.operands;
        let Some(Operand::Register(dst)) = ops.first() else {
            return self.unmodeled(insn, TaintReason::Unmodeled("arithmetic on memory".to_string()));
        };
        self.state.comparison = None;
        if self.is_frame(dst) {
            return;
        }
        let width = self.width(dst);

        let zeroing = op == ArithmeticOp::Xor
            && ops.len() == 2
            && ops[1].register().map(|r| self.canonical(r)) == Some(self.canonical(dst));
        if zeroing {
            let value = ConstantValue::for_width(0, width);
            self.bind(dst, Some(AnalysedOperand::Constant(value.clone())));
            self.push(
                insn.addr,
                ActionKind::ConstantLoad(ConstantLoadAction {
                    register: dst.clone(),
                    value,
                }),
            );
            return;
        }

        let shift = matches!(
            op,
            ArithmeticOp::ShiftLeft | ArithmeticOp::ShiftRight | ArithmeticOp::ShiftRightArithmetic
        );
        let (lhs, rhs) = match ops.len() {
            1 if shift => (
                self.input_for(&ops[0], width),
                ActionInput::resolved("1", AnalysedOperand::Constant(ConstantValue::Int32(1))),
            ),
            2 => (self.input_for(&ops[0], width), self.input_for(&ops[1], width)),
            3 => (self.input_for(&ops[1], width), self.input_for(&ops[2], width)),
            _ => {
                return self.unmodeled(
                    insn,
                    TaintReason::Unmodeled(format!("{} operand form", insn.mnemonic)),
                )
            }
        };

        let ty = self.integer_for_width(width);
        let result = self.define(dst, ty);
        self.push(
            insn.addr,
            ActionKind::Arithmetic(ArithmeticAction { op, lhs, rhs, result }),
        );
    }

    fn on_compare(&mut self, insn: &Insn, is_test: bool) {
        let ops = &insn.operands;
        let (Some(a), Some(b)) = (ops.first(), ops.get(1)) else {
            self.state.comparison = None;
            return;
        };
        let width = self.operand_width(a);
        let lhs = self.input_for(a, width);
        let comparison = if is_test {
            let same_register = match (a.register(), b.register()) {
                (Some(x), Some(y)) => self.canonical(x) == self.canonical(y),
                _ => false,
            };
            Comparison {
                lhs,
                rhs: ActionInput::resolved(
                    b.to_string(),
                    AnalysedOperand::Constant(ConstantValue::for_width(0, width)),
                ),
                modeled: same_register,
            }
        } else {
            Comparison {
                lhs,
                rhs: self.input_for(b, width),
                modeled: ops.len() == 2,
            }
        };
        self.state.comparison = Some(comparison);
    }

    // Calls

    fn on_call(&mut self, insn: &Insn) {
        let Some(target) = direct_target(insn) else {
            self.unmodeled(insn, TaintReason::Unmodeled("call without target".to_string()));
            return self.clobber();
        };
        match self.env.keys.helper_at(target) {
            Some(helper) => self.on_helper(insn, helper),
            None => self.on_managed_call(insn, target),
        }
    }

    fn argument(&self, index: usize) -> ActionInput {
        match self.convention.argument_registers.get(index) {
            Some(register) => self.read_register(register),
            None => ActionInput::new(format!("argument {}", index), None),
        }
    }

    fn on_managed_call(&mut self, insn: &Insn, target: Address) {
        let method = self.env.runtime.method_at(target);
        let mut arguments = Vec::new();
        let mut stack_arguments = 0;
        if let Some(m) = &method {
            for (i, slot) in self.argument_slots(m).into_iter().enumerate() {
                arguments.push(match slot {
                    ArgumentSlot::Register(r) => self.read_register(r),
                    ArgumentSlot::FloatingPoint => {
                        ActionInput::new(format!("floating point argument {}", i), None)
                    }
                    ArgumentSlot::Stack => {
                        stack_arguments += 1;
                        ActionInput::new(format!("stack argument {}", i), None)
                    }
                });
            }
        } else {
            log::trace!("0x{:X}: call target 0x{:X} is unknown", insn.addr, target);
        }

        self.clobber();
        let result = match &method {
            Some(m) if !m.returns_void() => {
                let ty = self.importer.import_signature(m.return_type.clone());
                Some(self.define(self.convention.return_register, ty))
            }
            _ => None,
        };
        self.push(
            insn.addr,
            ActionKind::Call(CallAction {
                target,
                method,
                arguments,
                stack_arguments,
                result,
            }),
        );
    }

    fn on_helper(&mut self, insn: &Insn, helper: KeyFunction) {
        let returned = self.convention.return_register;
        match helper {
            KeyFunction::InitializeMethod | KeyFunction::RuntimeClassInit => {
                let argument = self.argument(0).value;
                self.clobber();
                self.push(
                    insn.addr,
                    ActionKind::RuntimeHelper(RuntimeHelperAction { helper, argument }),
                );
            }
            KeyFunction::ObjectNew => {
                let class = self.argument(0);
                self.clobber();
                let result = match &class.value {
                    Some(AnalysedOperand::ClassPointer(c)) => {
                        let ty = self.importer.import_type(c);
                        Some(self.define(returned, ty))
                    }
                    _ => None,
                };
                self.push(insn.addr, ActionKind::Allocate(AllocateAction { class, result }));
            }
            KeyFunction::ArrayNew => {
                let element = self.argument(0);
                let length = self.argument(1);
                self.clobber();
                let result = match &element.value {
                    Some(AnalysedOperand::ClassPointer(e)) => {
                        let ty = self.importer.import_type(e).make_sz_array();
                        Some(self.define(returned, ty))
                    }
                    _ => None,
                };
                self.push(
                    insn.addr,
                    ActionKind::AllocateArray(AllocateArrayAction {
                        element,
                        length,
                        result,
                    }),
                );
            }
            KeyFunction::RaiseException => {
                let exception = self.argument(0);
                self.clobber();
                self.push(insn.addr, ActionKind::Throw(ThrowAction { exception }));
            }
            KeyFunction::RaiseIndexOutOfRange => {
                self.throw_new(insn, "System.IndexOutOfRangeException")
            }
            KeyFunction::RaiseNullReference => {
                self.throw_new(insn, "System.NullReferenceException")
            }
        }
    }

    fn throw_new(&mut self, insn: &Insn, type_name: &str) {
        let exception_type = self.env.resolver.resolve_definition_by_name(type_name);
        if let Some(ty) = &exception_type {
            self.importer.import_type(ty);
        } else {
            log::warn!("Exception type {} is not in the type table", type_name);
        }
        self.clobber();
        self.push(
            insn.addr,
            ActionKind::ThrowNew(ThrowNewAction {
                type_name: type_name.to_string(),
                exception_type,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisState, MethodAnalysisContext, StaticRuntimeLookup};
    use crate::arch::{Arm64InstructionSet, KeyFunctionAddresses, X86_64InstructionSet};
    use crate::config::AnalysisOptions;
    use crate::types::{
        FieldDefinition, InMemoryMetadata, TypeDefinition, TypeHandle, TypeResolver, TypeTable,
    };

    static X86: X86_64InstructionSet = X86_64InstructionSet::new();
    static ARM64: Arm64InstructionSet = Arm64InstructionSet::new();

    struct Fixture {
        env: AnalysisEnvironment,
        player: TypeHandle,
    }

    fn fixture(runtime: StaticRuntimeLookup, keys: KeyFunctionAddresses) -> Fixture {
        let player = TypeDefinition::new("Game", "Player").into_handle();
        let types = vec![
            player.clone(),
            TypeDefinition::new("System", "IndexOutOfRangeException").into_handle(),
        ];
        let table = Arc::new(TypeTable::new(types));
        let int32 = TypeSignature::Definition(table.primitive(PrimitiveKind::Int32).clone());
        player.set_fields(vec![
            FieldDefinition {
                name: "health".to_string(),
                field_type: int32.clone(),
                offset: 0x10,
                is_static: false,
            },
            FieldDefinition {
                name: "count".to_string(),
                field_type: int32,
                offset: 0x0,
                is_static: true,
            },
        ]);
        let resolver = Arc::new(TypeResolver::new(table, Arc::new(InMemoryMetadata::new(24.0))));
        let env = AnalysisEnvironment::new(resolver, AnalysisOptions::default())
            .with_runtime(Arc::new(runtime))
            .with_keys(keys);
        Fixture { env, player }
    }

    fn sig(f: &Fixture, kind: PrimitiveKind) -> TypeSignature {
        TypeSignature::Definition(f.env.resolver.table().primitive(kind).clone())
    }

    fn insn(addr: Address, size: u8, mnemonic: &str, ops: &str) -> Insn {
        Insn::new(addr, &vec![0x90; size as usize], mnemonic, ops)
    }

    fn walk(
        isa: &dyn InstructionSet,
        f: &Fixture,
        method: &ManagedMethod,
        insns: &[Insn],
    ) -> (Vec<LocalDefinition>, Vec<AnalysisAction>) {
        ActionEngine::new(isa, &f.env, method, insns).run()
    }

    fn important(locals: &[LocalDefinition], actions: &[AnalysisAction]) -> Vec<String> {
        actions
            .iter()
            .filter(|a| a.is_important())
            .map(|a| a.to_pseudocode(locals))
            .collect()
    }

    #[test]
    fn test_parameters_bind_to_argument_registers() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Add", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_parameter("a", sig(&f, PrimitiveKind::Int32))
            .with_parameter("scale", sig(&f, PrimitiveKind::Single))
            .with_parameter("b", sig(&f, PrimitiveKind::Int32));

        let (locals, _) = walk(&X86, &f, &method, &[]);
        let registers: Vec<Option<&str>> = locals.iter().map(|l| l.register.as_deref()).collect();
        // Positional: the float still occupies r8.
        assert_eq!(registers, vec![Some("rcx"), Some("rdx"), None, Some("r9")]);
        assert_eq!(locals[0].kind, LocalKind::This);
        assert_eq!(locals[3].kind, LocalKind::Parameter(3));

        let (locals, _) = walk(&ARM64, &f, &method, &[]);
        let registers: Vec<Option<&str>> = locals.iter().map(|l| l.register.as_deref()).collect();
        assert_eq!(registers, vec![Some("x0"), Some("x1"), None, Some("x2")]);
    }

    #[test]
    fn test_two_operand_arithmetic_and_return() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Sum", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int32))
            .with_parameter("b", sig(&f, PrimitiveKind::Int32));
        let insns = vec![
            insn(0x1000, 2, "mov", "eax, ecx"),
            insn(0x1002, 2, "add", "eax, edx"),
            insn(0x1004, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec!["System.Int32 local0 = a + b", "return local0"]
        );
        let bytecode: Vec<CilInstruction> = actions
            .iter()
            .flat_map(|a| a.to_bytecode(&locals).unwrap())
            .collect();
        assert_eq!(
            bytecode,
            vec![
                CilInstruction::Ldarg(0),
                CilInstruction::Ldarg(1),
                CilInstruction::Add,
                CilInstruction::Stloc(0),
                CilInstruction::Ldloc(0),
                CilInstruction::Ret,
            ]
        );
    }

    #[test]
    fn test_register_reuse_creates_fresh_locals() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("F", f.player.clone(), sig(&f, PrimitiveKind::Int64))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int64));
        let insns = vec![
            insn(0x1000, 4, "add", "rcx, 1"),
            insn(0x1004, 4, "add", "rcx, 2"),
            insn(0x1008, 3, "mov", "rax, rcx"),
            insn(0x100b, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec![
                "System.Int64 local0 = a + 1",
                "System.Int64 local1 = local0 + 2",
                "return local1",
            ]
        );
    }

    #[test]
    fn test_xor_zeroing_is_a_constant() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Zero", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true);
        let insns = vec![insn(0x1000, 2, "xor", "eax, eax"), insn(0x1002, 1, "ret", "")];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(important(&locals, &actions), vec!["return 0"]);
        assert_eq!(
            actions[1].to_bytecode(&locals).unwrap(),
            vec![CilInstruction::LdcI4(0), CilInstruction::Ret]
        );
    }

    #[test]
    fn test_compare_branch_and_label() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Clamp", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int32));
        let insns = vec![
            insn(0x1000, 3, "cmp", "ecx, 10"),
            insn(0x1003, 2, "jle", "0x100a"),
            insn(0x1005, 5, "mov", "ecx, 10"),
            insn(0x100a, 2, "mov", "eax, ecx"),
            insn(0x100c, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec!["if (a <= 10) goto loc_100A", "loc_100A:", "return <unknown rax>"]
        );
        // The two paths disagree on ecx, so the join forgets it.
        assert!(actions.last().unwrap().taint(&locals).is_some());
    }

    #[test]
    fn test_join_keeps_agreeing_bindings() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Pick", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int32));
        let insns = vec![
            insn(0x1000, 2, "test", "ecx, ecx"),
            insn(0x1002, 2, "je", "0x1006"),
            insn(0x1004, 2, "mov", "edx, ecx"),
            insn(0x1006, 2, "mov", "eax, ecx"),
            insn(0x1008, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec!["if (a == 0) goto loc_1006", "loc_1006:", "return a"]
        );
        assert!(actions.iter().all(|a| a.taint(&locals).is_none()));
    }

    #[test]
    fn test_loop_counter_taints_back_edge() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Count", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int32));
        let insns = vec![
            insn(0x1000, 2, "xor", "eax, eax"),
            insn(0x1002, 3, "add", "eax, 1"),
            insn(0x1005, 2, "cmp", "eax, ecx"),
            insn(0x1007, 2, "jl", "0x1002"),
            insn(0x1009, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        let taint = actions
            .iter()
            .find_map(|a| a.taint(&locals))
            .expect("the loop counter is carried around the back edge");
        assert_eq!(taint.reason, TaintReason::LoopCarried("rax".to_string()));
        assert!(actions.iter().any(|a| a.to_bytecode(&locals).is_err()));
    }

    #[test]
    fn test_loop_without_carried_values() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Spin", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int32));
        let insns = vec![
            insn(0x1000, 2, "mov", "eax, ecx"),
            insn(0x1002, 3, "cmp", "eax, 10"),
            insn(0x1005, 2, "jl", "0x1000"),
            insn(0x1007, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert!(actions.iter().all(|a| a.taint(&locals).is_none()));
    }

    #[test]
    fn test_loop_overwriting_before_read_is_clean() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Reset", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int32));
        // edx changes inside the loop but is written before any read.
        let insns = vec![
            insn(0x1000, 2, "xor", "edx, edx"),
            insn(0x1002, 2, "mov", "edx, ecx"),
            insn(0x1004, 3, "add", "edx, 1"),
            insn(0x1007, 3, "cmp", "edx, 10"),
            insn(0x100a, 2, "jl", "0x1002"),
            insn(0x100c, 2, "mov", "eax, edx"),
            insn(0x100e, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert!(actions.iter().all(|a| a.taint(&locals).is_none()));
    }

    #[test]
    fn test_field_read_and_write() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Heal", f.player.clone(), sig(&f, PrimitiveKind::Void));
        let insns = vec![
            insn(0x1000, 3, "mov", "eax, dword ptr [rcx + 0x10]"),
            insn(0x1003, 3, "add", "eax, 5"),
            insn(0x1006, 3, "mov", "dword ptr [rcx + 0x10], eax"),
            insn(0x1009, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec![
                "System.Int32 local0 = this.health",
                "System.Int32 local1 = local0 + 5",
                "this.health = local1",
                "return",
            ]
        );
        assert!(actions.iter().all(|a| a.taint(&locals).is_none()));
    }

    #[test]
    fn test_static_field_through_class_pointer() {
        let f0 = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let runtime = StaticRuntimeLookup::new().with_class(0x5000, f0.player.clone());
        let f = Fixture {
            env: AnalysisEnvironment::new(f0.env.resolver.clone(), AnalysisOptions::default())
                .with_runtime(Arc::new(runtime)),
            player: f0.player.clone(),
        };
        let method = ManagedMethod::new("Count", f.player.clone(), sig(&f, PrimitiveKind::Int32))
            .with_static(true);
        // mov rax, [rip + 0x3ff9] at 0x1000 (7 bytes) reads 0x5000.
        let insns = vec![
            insn(0x1000, 7, "mov", "rax, qword ptr [rip + 0x3ff9]"),
            insn(0x1007, 7, "mov", "rax, qword ptr [rax + 0xb8]"),
            insn(0x100e, 2, "mov", "eax, dword ptr [rax]"),
            insn(0x1010, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec!["System.Int32 local0 = Game.Player.count", "return local0"]
        );
        assert!(matches!(
            actions[2].to_bytecode(&locals).unwrap()[0],
            CilInstruction::Ldsfld(_)
        ));
    }

    #[test]
    fn test_managed_call_clobbers_and_binds_result() {
        let f0 = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let callee = Arc::new(
            ManagedMethod::new("Scale", f0.player.clone(), sig(&f0, PrimitiveKind::Int32))
                .with_parameter("factor", sig(&f0, PrimitiveKind::Int32)),
        );
        let runtime = StaticRuntimeLookup::new().with_method(0x2000, callee.clone());
        let f = Fixture {
            env: AnalysisEnvironment::new(f0.env.resolver.clone(), AnalysisOptions::default())
                .with_runtime(Arc::new(runtime)),
            player: f0.player.clone(),
        };
        let method = ManagedMethod::new("Run", f.player.clone(), sig(&f, PrimitiveKind::Int32));
        let insns = vec![
            insn(0x1000, 5, "mov", "edx, 3"),
            insn(0x1005, 5, "call", "0x2000"),
            insn(0x100a, 1, "ret", ""),
        ];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec!["System.Int32 local0 = Game.Player::Scale(this, 3)", "return local0"]
        );
        let call = actions[1].to_bytecode(&locals).unwrap();
        assert_eq!(call[0], CilInstruction::Ldarg(0));
        assert_eq!(call[1], CilInstruction::LdcI4(3));
        assert_eq!(call[2], CilInstruction::Call(crate::analysis::MethodRef(callee)));
        assert_eq!(call[3], CilInstruction::Stloc(0));
    }

    #[test]
    fn test_unresolved_call_taints() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Run", f.player.clone(), sig(&f, PrimitiveKind::Void))
            .with_static(true);
        let insns = vec![insn(0x1000, 5, "call", "0x3000"), insn(0x1005, 1, "ret", "")];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        let taint = actions[0].taint(&locals).unwrap();
        assert_eq!(taint.reason, TaintReason::UnresolvedCall(0x3000));
    }

    #[test]
    fn test_bounds_check_helper_throws() {
        let mut keys = KeyFunctionAddresses::new();
        keys.set(KeyFunction::RaiseIndexOutOfRange, 0x4000);
        let f = fixture(StaticRuntimeLookup::new(), keys);
        let method = ManagedMethod::new("Get", f.player.clone(), sig(&f, PrimitiveKind::Void))
            .with_static(true);
        let insns = vec![insn(0x1000, 5, "call", "0x4000"), insn(0x1005, 1, "int3", "")];

        let (locals, actions) = walk(&X86, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec!["throw new System.IndexOutOfRangeException()"]
        );
        let bytecode = actions[0].to_bytecode(&locals).unwrap();
        assert_eq!(bytecode[1], CilInstruction::Throw);
    }

    #[test]
    fn test_arm64_cbz_and_spill() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = ManagedMethod::new("Check", f.player.clone(), sig(&f, PrimitiveKind::Int64))
            .with_static(true)
            .with_parameter("a", sig(&f, PrimitiveKind::Int64));
        let insns = vec![
            insn(0x1000, 4, "str", "x0, [sp, #8]"),
            insn(0x1004, 4, "cbz", "x0, #0x1010"),
            insn(0x1008, 4, "ldr", "x1, [sp, #8]"),
            insn(0x100c, 4, "add", "x0, x1, #1"),
            insn(0x1010, 4, "ret", ""),
        ];

        let (locals, actions) = walk(&ARM64, &f, &method, &insns);
        assert_eq!(
            important(&locals, &actions),
            vec![
                "if (a == 0) goto loc_1010",
                "System.Int64 local0 = a + 1",
                "loc_1010:",
                "return <unknown x0>",
            ]
        );
        assert_eq!(
            actions[1].to_bytecode(&locals).unwrap(),
            vec![CilInstruction::Ldarg(0), CilInstruction::Brfalse(0x1010)]
        );
    }

    #[test]
    fn test_unknown_instruction_taints_method() {
        let f = fixture(StaticRuntimeLookup::new(), KeyFunctionAddresses::new());
        let method = Arc::new(
            ManagedMethod::new("Odd", f.player.clone(), sig(&f, PrimitiveKind::Void)).with_static(true),
        );
        let image = crate::BinaryImage::raw(crate::Architecture::X86_64, 0x1000, &[0x0f, 0xa2, 0xc3]);
        let mut ctx = MethodAnalysisContext::new(0x1000, Some(3), method);

        let report = ctx.analyze(&X86, &image, &f.env);
        assert_eq!(report.state, AnalysisState::Tainted);
        assert!(report.pseudocode.contains("// cpuid // tainted"));
        assert!(matches!(report.bytecode, Some(Err(_))));
    }
}
