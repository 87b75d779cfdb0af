//! Synthesized actions.
//!
//! Every action can render itself as pseudocode and as bytecode. Bookkeeping
//! actions (register copies, spills, constant loads) exist so the machine
//! state can be replayed, but are not important: they print nothing and emit
//! no bytecode. An action that lacks an operand it needs fails
//! [`Action::to_bytecode`] with a [`TaintReason`].

use std::sync::Arc;

use crate::arch::{ArithmeticOp, Condition, KeyFunction};
use crate::types::{ManagedMethod, TypeHandle, TypeSignature};
use crate::Address;

use super::bytecode::{CilInstruction, MethodRef};
use super::operand::{local, local_name, ActionInput, AnalysedOperand, ConstantValue, LocalDefinition, LocalId};
use super::{TaintReason, TaintedAction};

/// Behaviour shared by every action.
pub trait Action {
    /// Bytecode reproducing the action's effect.
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason>;

    /// One line of pseudocode.
    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String;

    /// Short description for reports.
    fn summary(&self, locals: &[LocalDefinition]) -> String;

    /// Whether the action is visible in the final output.
    fn is_important(&self) -> bool {
        true
    }

    /// Locals the action reads.
    fn consumed(&self) -> Vec<LocalId> {
        Vec::new()
    }

    /// Local the action defines.
    fn produced(&self) -> Option<LocalId> {
        None
    }
}

fn declare(locals: &[LocalDefinition], id: LocalId) -> String {
    match locals.get(id) {
        Some(l) => format!("{} {}", l.ty, l.name),
        None => format!("<local #{}>", id),
    }
}

fn store(locals: &[LocalDefinition], id: LocalId) -> Result<CilInstruction, TaintReason> {
    Ok(local(locals, id)?.store())
}

fn inputs_consumed<'a>(inputs: impl IntoIterator<Item = &'a ActionInput>) -> Vec<LocalId> {
    inputs.into_iter().filter_map(ActionInput::local).collect()
}

/// `result = lhs OP rhs`
#[derive(Debug, Clone, PartialEq)]
pub struct ArithmeticAction {
    pub op: ArithmeticOp,
    pub lhs: ActionInput,
    pub rhs: ActionInput,
    pub result: LocalId,
}

impl Action for ArithmeticAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let mut out = self.lhs.load(locals)?;
        out.extend(self.rhs.load(locals)?);
        out.push(CilInstruction::arithmetic(self.op));
        out.push(store(locals, self.result)?);
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        format!(
            "{} = {} {} {}",
            declare(locals, self.result),
            self.lhs.render(locals),
            self.op.symbol(),
            self.rhs.render(locals)
        )
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!(
            "{:?} {} by {} into {}",
            self.op,
            self.lhs.render(locals),
            self.rhs.render(locals),
            local_name(locals, self.result)
        )
    }

    fn consumed(&self) -> Vec<LocalId> {
        inputs_consumed([&self.lhs, &self.rhs])
    }

    fn produced(&self) -> Option<LocalId> {
        Some(self.result)
    }
}

/// Sign or zero extension into a new local.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertAction {
    pub source: ActionInput,
    pub conversions: Vec<CilInstruction>,
    pub result: LocalId,
}

impl Action for ConvertAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let mut out = self.source.load(locals)?;
        out.extend(self.conversions.iter().cloned());
        out.push(store(locals, self.result)?);
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        let ty = locals.get(self.result).map(|l| l.ty.to_string()).unwrap_or_default();
        format!(
            "{} = ({}){}",
            declare(locals, self.result),
            ty,
            self.source.render(locals)
        )
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!(
            "Converts {} into {}",
            self.source.render(locals),
            local_name(locals, self.result)
        )
    }

    fn consumed(&self) -> Vec<LocalId> {
        inputs_consumed([&self.source])
    }

    fn produced(&self) -> Option<LocalId> {
        Some(self.result)
    }
}

/// A register now holds a literal.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantLoadAction {
    pub register: String,
    pub value: ConstantValue,
}

impl Action for ConstantLoadAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        Ok(Vec::new())
    }

    fn to_pseudocode(&self, _locals: &[LocalDefinition]) -> String {
        format!("{} = {}", self.register, self.value)
    }

    fn summary(&self, _locals: &[LocalDefinition]) -> String {
        format!("Loads constant {} into {}", self.value, self.register)
    }

    fn is_important(&self) -> bool {
        false
    }
}

/// A register now holds whatever another register held.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterCopyAction {
    pub destination: String,
    pub source: ActionInput,
}

impl Action for RegisterCopyAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        Ok(Vec::new())
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        format!("{} = {}", self.destination, self.source.render(locals))
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!("Copies {} into {}", self.source.render(locals), self.destination)
    }

    fn is_important(&self) -> bool {
        false
    }
}

/// A register spilled to, or restored from, a stack slot.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSpillAction {
    pub register: String,
    pub slot: String,
    /// True for register to stack
    pub spill: bool,
    pub value: Option<AnalysedOperand>,
}

impl Action for StackSpillAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        Ok(Vec::new())
    }

    fn to_pseudocode(&self, _locals: &[LocalDefinition]) -> String {
        if self.spill {
            format!("{} = {}", self.slot, self.register)
        } else {
            format!("{} = {}", self.register, self.slot)
        }
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        let value = self
            .value
            .as_ref()
            .map_or_else(|| "an unknown value".to_string(), |v| v.render(locals));
        if self.spill {
            format!("Spills {} ({}) to {}", self.register, value, self.slot)
        } else {
            format!("Restores {} ({}) from {}", self.register, value, self.slot)
        }
    }

    fn is_important(&self) -> bool {
        false
    }
}

/// A load from a global slot: class pointers, string literals, static blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalLoadAction {
    pub register: String,
    pub address: Option<Address>,
    pub value: Option<AnalysedOperand>,
}

impl Action for GlobalLoadAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        Ok(Vec::new())
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        let value = self
            .value
            .as_ref()
            .map_or_else(|| "<unknown global>".to_string(), |v| v.render(locals));
        format!("{} = {}", self.register, value)
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        let at = self.address.map(|a| format!(" @ 0x{:X}", a)).unwrap_or_default();
        format!("Loads global{} into {}: {}", at, self.register, self.to_pseudocode(locals))
    }

    fn is_important(&self) -> bool {
        false
    }
}

/// `result = instance.field` or `result = Owner.field`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReadAction {
    pub field: ActionInput,
    pub result: Option<LocalId>,
}

impl Action for FieldReadAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let (Some(field), Some(result)) = (&self.field.value, self.result) else {
            return Err(TaintReason::UnresolvedField(self.field.origin.clone()));
        };
        let mut out = field.load(locals)?;
        out.push(store(locals, result)?);
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        match self.result {
            Some(result) => format!("{} = {}", declare(locals, result), self.field.render(locals)),
            None => format!("<unknown> = {}", self.field.render(locals)),
        }
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!("Reads field {}", self.field.render(locals))
    }

    fn consumed(&self) -> Vec<LocalId> {
        inputs_consumed([&self.field])
    }

    fn produced(&self) -> Option<LocalId> {
        self.result
    }
}

/// `instance.field = value` or `Owner.field = value`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWriteAction {
    pub field: ActionInput,
    pub value: ActionInput,
}

impl Action for FieldWriteAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        match &self.field.value {
            Some(AnalysedOperand::Field {
                instance: Some(id),
                field,
            }) => {
                let mut out = vec![local(locals, *id)?.load()];
                out.extend(self.value.load(locals)?);
                out.push(CilInstruction::Stfld(field.clone()));
                Ok(out)
            }
            Some(AnalysedOperand::Field {
                instance: None,
                field,
            }) => {
                let mut out = self.value.load(locals)?;
                out.push(CilInstruction::Stsfld(field.clone()));
                Ok(out)
            }
            _ => Err(TaintReason::UnresolvedField(self.field.origin.clone())),
        }
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        format!("{} = {}", self.field.render(locals), self.value.render(locals))
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!(
            "Writes {} to field {}",
            self.value.render(locals),
            self.field.render(locals)
        )
    }

    fn consumed(&self) -> Vec<LocalId> {
        inputs_consumed([&self.field, &self.value])
    }
}

/// The operands of the compare a conditional branch consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub lhs: ActionInput,
    pub rhs: ActionInput,
    /// False for flag-setting forms we do not reconstruct (bit tests)
    pub modeled: bool,
}

/// `if (lhs COND rhs) goto target`
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBranchAction {
    pub condition: Condition,
    pub comparison: Option<Comparison>,
    pub target: Address,
    /// Whether the target lies inside the method body
    pub inside: bool,
}

impl ConditionalBranchAction {
    fn compares_with_zero(comparison: &Comparison) -> bool {
        matches!(
            &comparison.rhs.value,
            Some(AnalysedOperand::Constant(c)) if c.as_integer() == Some(0)
        )
    }
}

impl Action for ConditionalBranchAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        if !self.inside {
            return Err(TaintReason::LeavesMethod(self.target));
        }
        let comparison = self.comparison.as_ref().ok_or(TaintReason::NoComparison)?;
        if !comparison.modeled {
            return Err(TaintReason::UnmodeledCondition);
        }
        let mut out = comparison.lhs.load(locals)?;
        if Self::compares_with_zero(comparison) {
            match self.condition {
                Condition::Equal => {
                    out.push(CilInstruction::Brfalse(self.target));
                    return Ok(out);
                }
                Condition::NotEqual => {
                    out.push(CilInstruction::Brtrue(self.target));
                    return Ok(out);
                }
                _ => {}
            }
        }
        out.extend(comparison.rhs.load(locals)?);
        out.push(
            CilInstruction::branch(self.condition, self.target)
                .ok_or(TaintReason::UnmodeledCondition)?,
        );
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        let test = match &self.comparison {
            Some(c) if c.modeled => format!(
                "{} {} {}",
                c.lhs.render(locals),
                self.condition.symbol(),
                c.rhs.render(locals)
            ),
            _ => format!("<flags> {}", self.condition.symbol()),
        };
        format!("if ({}) goto loc_{:X}", test, self.target)
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!("Branches to 0x{:X}: {}", self.target, self.to_pseudocode(locals))
    }

    fn consumed(&self) -> Vec<LocalId> {
        self.comparison
            .as_ref()
            .map(|c| inputs_consumed([&c.lhs, &c.rhs]))
            .unwrap_or_default()
    }
}

/// `goto target`
#[derive(Debug, Clone, PartialEq)]
pub struct JumpAction {
    pub target: Address,
    pub inside: bool,
}

impl Action for JumpAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        if !self.inside {
            return Err(TaintReason::LeavesMethod(self.target));
        }
        Ok(vec![CilInstruction::Br(self.target)])
    }

    fn to_pseudocode(&self, _locals: &[LocalDefinition]) -> String {
        format!("goto loc_{:X}", self.target)
    }

    fn summary(&self, _locals: &[LocalDefinition]) -> String {
        format!("Jumps to 0x{:X}", self.target)
    }
}

/// A branch target.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelAction {
    pub address: Address,
}

impl Action for LabelAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        Ok(vec![CilInstruction::Label(self.address)])
    }

    fn to_pseudocode(&self, _locals: &[LocalDefinition]) -> String {
        format!("loc_{:X}:", self.address)
    }

    fn summary(&self, _locals: &[LocalDefinition]) -> String {
        format!("Branch target 0x{:X}", self.address)
    }
}

/// A direct call to a managed method.
#[derive(Debug, Clone)]
pub struct CallAction {
    pub target: Address,
    pub method: Option<Arc<ManagedMethod>>,
    pub arguments: Vec<ActionInput>,
    /// Arguments that would have been passed on the stack
    pub stack_arguments: usize,
    pub result: Option<LocalId>,
}

impl PartialEq for CallAction {
    fn eq(&self, other: &Self) -> bool {
        let same_method = match (&self.method, &other.method) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_method
            && self.target == other.target
            && self.arguments == other.arguments
            && self.stack_arguments == other.stack_arguments
            && self.result == other.result
    }
}

impl CallAction {
    fn callee(&self) -> String {
        match &self.method {
            Some(m) => m.full_name(),
            None => format!("sub_{:X}", self.target),
        }
    }
}

impl Action for CallAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let method = self
            .method
            .as_ref()
            .ok_or(TaintReason::UnresolvedCall(self.target))?;
        if self.stack_arguments > 0 {
            return Err(TaintReason::StackArguments(self.stack_arguments));
        }
        let mut out = Vec::new();
        for argument in &self.arguments {
            out.extend(argument.load(locals)?);
        }
        out.push(CilInstruction::Call(MethodRef(method.clone())));
        if let Some(result) = self.result {
            out.push(store(locals, result)?);
        }
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        let args: Vec<String> = self.arguments.iter().map(|a| a.render(locals)).collect();
        let call = format!("{}({})", self.callee(), args.join(", "));
        match self.result {
            Some(result) => format!("{} = {}", declare(locals, result), call),
            None => call,
        }
    }

    fn summary(&self, _locals: &[LocalDefinition]) -> String {
        format!("Calls {} @ 0x{:X}", self.callee(), self.target)
    }

    fn consumed(&self) -> Vec<LocalId> {
        inputs_consumed(&self.arguments)
    }

    fn produced(&self) -> Option<LocalId> {
        self.result
    }
}

/// `result = new T()` from an object allocation helper.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocateAction {
    pub class: ActionInput,
    pub result: Option<LocalId>,
}

impl Action for AllocateAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let (Some(AnalysedOperand::ClassPointer(class)), Some(result)) = (&self.class.value, self.result)
        else {
            return Err(TaintReason::MissingOperand(self.class.origin.clone()));
        };
        Ok(vec![
            CilInstruction::Newobj(TypeSignature::Definition(class.clone())),
            store(locals, result)?,
        ])
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        match (&self.class.value, self.result) {
            (Some(AnalysedOperand::ClassPointer(class)), Some(result)) => {
                format!("{} = new {}()", declare(locals, result), class.full_name())
            }
            _ => format!("<unknown> = new {}()", self.class.render(locals)),
        }
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!("Allocates an instance of {}", self.class.render(locals))
    }

    fn produced(&self) -> Option<LocalId> {
        self.result
    }
}

/// `result = new T[length]`
#[derive(Debug, Clone, PartialEq)]
pub struct AllocateArrayAction {
    pub element: ActionInput,
    pub length: ActionInput,
    pub result: Option<LocalId>,
}

impl Action for AllocateArrayAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let (Some(AnalysedOperand::ClassPointer(element)), Some(result)) =
            (&self.element.value, self.result)
        else {
            return Err(TaintReason::MissingOperand(self.element.origin.clone()));
        };
        let mut out = self.length.load(locals)?;
        out.push(CilInstruction::Newarr(TypeSignature::Definition(element.clone())));
        out.push(store(locals, result)?);
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        let element = match &self.element.value {
            Some(AnalysedOperand::ClassPointer(e)) => e.full_name(),
            _ => self.element.render(locals),
        };
        let target = self
            .result
            .map_or_else(|| "<unknown>".to_string(), |r| declare(locals, r));
        format!("{} = new {}[{}]", target, element, self.length.render(locals))
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!(
            "Allocates an array of {} elements",
            self.length.render(locals)
        )
    }

    fn consumed(&self) -> Vec<LocalId> {
        inputs_consumed([&self.length])
    }

    fn produced(&self) -> Option<LocalId> {
        self.result
    }
}

/// `throw value`
#[derive(Debug, Clone, PartialEq)]
pub struct ThrowAction {
    pub exception: ActionInput,
}

impl Action for ThrowAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let mut out = self.exception.load(locals)?;
        out.push(CilInstruction::Throw);
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        format!("throw {}", self.exception.render(locals))
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!("Throws {}", self.exception.render(locals))
    }

    fn consumed(&self) -> Vec<LocalId> {
        inputs_consumed([&self.exception])
    }
}

/// `throw new T()` from a runtime check helper.
#[derive(Debug, Clone)]
pub struct ThrowNewAction {
    pub type_name: String,
    pub exception_type: Option<TypeHandle>,
}

impl PartialEq for ThrowNewAction {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name
            && match (&self.exception_type, &other.exception_type) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl Action for ThrowNewAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let ty = self
            .exception_type
            .as_ref()
            .ok_or_else(|| TaintReason::MissingType(self.type_name.clone()))?;
        Ok(vec![
            CilInstruction::Newobj(TypeSignature::Definition(ty.clone())),
            CilInstruction::Throw,
        ])
    }

    fn to_pseudocode(&self, _locals: &[LocalDefinition]) -> String {
        format!("throw new {}()", self.type_name)
    }

    fn summary(&self, _locals: &[LocalDefinition]) -> String {
        format!("Throws a new {}", self.type_name)
    }
}

/// `return` or `return value`
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnAction {
    pub value: Option<ActionInput>,
}

impl Action for ReturnAction {
    fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        let mut out = match &self.value {
            Some(value) => value.load(locals)?,
            None => Vec::new(),
        };
        out.push(CilInstruction::Ret);
        Ok(out)
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        match &self.value {
            Some(value) => format!("return {}", value.render(locals)),
            None => "return".to_string(),
        }
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        match &self.value {
            Some(value) => format!("Returns {}", value.render(locals)),
            None => "Returns".to_string(),
        }
    }

    fn consumed(&self) -> Vec<LocalId> {
        self.value.iter().filter_map(ActionInput::local).collect()
    }
}

/// Runtime bookkeeping calls with no managed counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeHelperAction {
    pub helper: KeyFunction,
    pub argument: Option<AnalysedOperand>,
}

impl Action for RuntimeHelperAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        Ok(Vec::new())
    }

    fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        let name = self.helper.export_names().first().copied().unwrap_or("helper");
        let argument = self
            .argument
            .as_ref()
            .map(|a| a.render(locals))
            .unwrap_or_default();
        format!("{}({})", name, argument)
    }

    fn summary(&self, locals: &[LocalDefinition]) -> String {
        format!("Runtime bookkeeping: {}", self.to_pseudocode(locals))
    }

    fn is_important(&self) -> bool {
        false
    }
}

/// An instruction the engine cannot reproduce.
#[derive(Debug, Clone, PartialEq)]
pub struct UnmodeledAction {
    pub instruction: String,
    pub reason: TaintReason,
}

impl Action for UnmodeledAction {
    fn to_bytecode(&self, _locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintReason> {
        Err(self.reason.clone())
    }

    fn to_pseudocode(&self, _locals: &[LocalDefinition]) -> String {
        format!("// {}", self.instruction)
    }

    fn summary(&self, _locals: &[LocalDefinition]) -> String {
        format!("Unmodeled: {}", self.instruction)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Arithmetic(ArithmeticAction),
    Convert(ConvertAction),
    ConstantLoad(ConstantLoadAction),
    RegisterCopy(RegisterCopyAction),
    StackSpill(StackSpillAction),
    GlobalLoad(GlobalLoadAction),
    FieldRead(FieldReadAction),
    FieldWrite(FieldWriteAction),
    ConditionalBranch(ConditionalBranchAction),
    Jump(JumpAction),
    Label(LabelAction),
    Call(CallAction),
    Allocate(AllocateAction),
    AllocateArray(AllocateArrayAction),
    Throw(ThrowAction),
    ThrowNew(ThrowNewAction),
    Return(ReturnAction),
    RuntimeHelper(RuntimeHelperAction),
    Unmodeled(UnmodeledAction),
}

impl ActionKind {
    pub fn as_action(&self) -> &dyn Action {
        match self {
            ActionKind::Arithmetic(a) => a,
            ActionKind::Convert(a) => a,
            ActionKind::ConstantLoad(a) => a,
            ActionKind::RegisterCopy(a) => a,
            ActionKind::StackSpill(a) => a,
            ActionKind::GlobalLoad(a) => a,
            ActionKind::FieldRead(a) => a,
            ActionKind::FieldWrite(a) => a,
            ActionKind::ConditionalBranch(a) => a,
            ActionKind::Jump(a) => a,
            ActionKind::Label(a) => a,
            ActionKind::Call(a) => a,
            ActionKind::Allocate(a) => a,
            ActionKind::AllocateArray(a) => a,
            ActionKind::Throw(a) => a,
            ActionKind::ThrowNew(a) => a,
            ActionKind::Return(a) => a,
            ActionKind::RuntimeHelper(a) => a,
            ActionKind::Unmodeled(a) => a,
        }
    }
}

/// One synthesized step, tagged with the native address it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisAction {
    pub address: Address,
    pub kind: ActionKind,
}

impl AnalysisAction {
    pub fn new(address: Address, kind: ActionKind) -> Self {
        Self { address, kind }
    }

    pub fn to_bytecode(&self, locals: &[LocalDefinition]) -> Result<Vec<CilInstruction>, TaintedAction> {
        self.kind
            .as_action()
            .to_bytecode(locals)
            .map_err(|reason| TaintedAction {
                address: self.address,
                reason,
            })
    }

    pub fn to_pseudocode(&self, locals: &[LocalDefinition]) -> String {
        self.kind.as_action().to_pseudocode(locals)
    }

    pub fn summary(&self, locals: &[LocalDefinition]) -> String {
        self.kind.as_action().summary(locals)
    }

    pub fn is_important(&self) -> bool {
        self.kind.as_action().is_important()
    }

    pub fn consumed(&self) -> Vec<LocalId> {
        self.kind.as_action().consumed()
    }

    pub fn produced(&self) -> Option<LocalId> {
        self.kind.as_action().produced()
    }

    /// The taint this action carries, if any.
    pub fn taint(&self, locals: &[LocalDefinition]) -> Option<TaintedAction> {
        self.to_bytecode(locals).err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::operand::LocalKind;
    use crate::types::{PrimitiveKind, TypeTable};

    fn locals() -> Vec<LocalDefinition> {
        let table = TypeTable::new(Vec::new());
        let int64 = TypeSignature::Definition(table.primitive(PrimitiveKind::Int64).clone());
        let make = |id, name: &str, kind| LocalDefinition {
            id,
            name: name.to_string(),
            ty: int64.clone(),
            register: None,
            kind,
        };
        vec![
            make(0, "a", LocalKind::Parameter(0)),
            make(1, "b", LocalKind::Parameter(1)),
            make(2, "local0", LocalKind::Variable(0)),
        ]
    }

    #[test]
    fn test_arithmetic_action() {
        let locals = locals();
        let action = ArithmeticAction {
            op: ArithmeticOp::Subtract,
            lhs: ActionInput::resolved("x0", AnalysedOperand::Local(0)),
            rhs: ActionInput::resolved("#1", AnalysedOperand::Constant(ConstantValue::Int64(1))),
            result: 2,
        };
        assert_eq!(action.to_pseudocode(&locals), "System.Int64 local0 = a - 1");
        assert_eq!(
            action.to_bytecode(&locals).unwrap(),
            vec![
                CilInstruction::Ldarg(0),
                CilInstruction::LdcI8(1),
                CilInstruction::Sub,
                CilInstruction::Stloc(0),
            ]
        );
        assert_eq!(action.consumed(), vec![0]);
        assert_eq!(action.produced(), Some(2));
    }

    #[test]
    fn test_missing_operand_taints() {
        let locals = locals();
        let action = AnalysisAction::new(
            0x1000,
            ActionKind::Arithmetic(ArithmeticAction {
                op: ArithmeticOp::Add,
                lhs: ActionInput::new("rdx", None),
                rhs: ActionInput::resolved("rcx", AnalysedOperand::Local(1)),
                result: 2,
            }),
        );
        let taint = action.taint(&locals).unwrap();
        assert_eq!(taint.address, 0x1000);
        assert_eq!(taint.reason, TaintReason::MissingOperand("rdx".to_string()));
        assert_eq!(action.to_pseudocode(&locals), "System.Int64 local0 = <unknown rdx> + b");
    }

    #[test]
    fn test_zero_compare_uses_brfalse() {
        let locals = locals();
        let action = ConditionalBranchAction {
            condition: Condition::Equal,
            comparison: Some(Comparison {
                lhs: ActionInput::resolved("eax", AnalysedOperand::Local(0)),
                rhs: ActionInput::resolved("eax", AnalysedOperand::Constant(ConstantValue::Int32(0))),
                modeled: true,
            }),
            target: 0x1010,
            inside: true,
        };
        assert_eq!(
            action.to_bytecode(&locals).unwrap(),
            vec![CilInstruction::Ldarg(0), CilInstruction::Brfalse(0x1010)]
        );
        assert_eq!(action.to_pseudocode(&locals), "if (a == 0) goto loc_1010");
    }

    #[test]
    fn test_branch_without_compare_taints() {
        let action = ConditionalBranchAction {
            condition: Condition::Less,
            comparison: None,
            target: 0x1010,
            inside: true,
        };
        assert_eq!(action.to_bytecode(&[]), Err(TaintReason::NoComparison));

        let outside = JumpAction {
            target: 0x9000,
            inside: false,
        };
        assert_eq!(outside.to_bytecode(&[]), Err(TaintReason::LeavesMethod(0x9000)));
    }

    #[test]
    fn test_bookkeeping_is_not_important() {
        let copy = RegisterCopyAction {
            destination: "rbx".to_string(),
            source: ActionInput::new("rcx", None),
        };
        assert!(!copy.is_important());
        assert_eq!(copy.to_bytecode(&[]), Ok(Vec::new()));

        let ret = ReturnAction { value: None };
        assert!(ret.is_important());
        assert_eq!(ret.to_bytecode(&[]), Ok(vec![CilInstruction::Ret]));
    }
}
