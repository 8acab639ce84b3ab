#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use ember_ir::{
    IdGen, IrAssignmentStatement, IrAssignmentTarget, IrBreakStatement, IrCodeChunk, IrConditionalBranch,
    IrContinueStatement, IrCreateTemporaryValue, IrExpression, IrImplicitEvaluation, IrInvocationLandingPad,
    IrLandingPadAction, IrLoopIdentity, IrRegisterWeakReferenceStatement, IrReturnStatement, IrStatement,
    IrTemporaryValueReference, IrThrowStatement, IrTryIdentity, IrType, IrUnregisterWeakReferenceStatement,
    IrVariableDeclaration, IrWhileLoop,
};

use super::ir_type;
use crate::binder::{
    AssignmentTarget, BoundCodeChunk, BoundExpression, BoundFunction, BoundIf, BoundInvocation,
    BoundStatement, BoundTry, BoundVariable, ExpressionKind, FunctionBody, FunctionKind,
    MemberInitialization, StatementKind, VariableKind,
};
use crate::builtins::CoreTypes;
use crate::context::{Context, DeferredCode, EffectSubject, EphemeralState};
use crate::types::{BoundType, Mutability};

enum Binding {
    /// Never reassigned; lives in a single temporary.
    Ssa(IrTemporaryValueReference),
    Storage(Arc<IrVariableDeclaration>),
}

/// A lowered expression. An owned value carries one strong reference that
/// has to be consumed or dropped.
struct Value {
    temp: IrTemporaryValueReference,
    owned: bool,
}

impl Value {
    fn borrowed(temp: IrTemporaryValueReference) -> Self {
        Self { temp, owned: false }
    }
}

fn counted(temp: &IrTemporaryValueReference) -> bool {
    temp.ty().is_reference_counted()
}

pub(super) struct Lowerer {
    id: IdGen,
    code: Vec<IrStatement>,
    bindings: HashMap<u32, Binding>,
    globals: HashMap<u32, Arc<IrVariableDeclaration>>,
    /// Owned values not consumed yet, in creation order.
    pending: Vec<IrTemporaryValueReference>,
    loops: Vec<(Arc<IrLoopIdentity>, usize)>,
    tries: Vec<(Arc<IrTryIdentity>, usize)>,
    /// Released when an exception leaves the function.
    frame_owned: Vec<IrTemporaryValueReference>,
    /// Reassignable parameters hold a reference of their own.
    parameter_storage: Vec<Arc<IrVariableDeclaration>>,
    constructed: Option<IrTemporaryValueReference>,
    demote: bool,
    core: Rc<CoreTypes>,
}

impl Lowerer {
    pub(super) fn new(context: &Rc<Context>) -> Self {
        Self {
            id: IdGen::default(),
            code: Vec::new(),
            bindings: HashMap::new(),
            globals: HashMap::new(),
            pending: Vec::new(),
            loops: Vec::new(),
            tries: Vec::new(),
            frame_owned: Vec::new(),
            parameter_storage: Vec::new(),
            constructed: None,
            demote: context.config().demote_single_assignment_variables,
            core: context.core_types(),
        }
    }

    // ---- emission helpers

    fn emit(&mut self, statement: IrStatement) {
        self.code.push(statement);
    }

    fn with_code<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> (R, Vec<IrStatement>) {
        let saved = mem::take(&mut self.code);
        let result = f(self);
        let code = mem::replace(&mut self.code, saved);
        (result, code)
    }

    fn temporary(&mut self, value: IrExpression, ty: IrType, counted_at_creation: bool) -> IrTemporaryValueReference {
        let counted_at_creation = counted_at_creation && ty.is_reference_counted();
        let temp = IrTemporaryValueReference::new(IrCreateTemporaryValue {
            id: self.id.fresh_temporary(),
            value,
            ty,
            counted_at_creation,
        });
        self.emit(IrStatement::CreateTemporaryValue(temp.clone()));
        temp
    }

    fn produce(&mut self, value: IrExpression, ty: IrType, counted_at_creation: bool) -> Value {
        let temp = self.temporary(value, ty, counted_at_creation);
        let owned = temp.declaration().counted_at_creation;
        if owned {
            self.pending.push(temp.clone());
        }
        Value { temp, owned }
    }

    fn unpend(&mut self, temp: &IrTemporaryValueReference) -> bool {
        match self.pending.iter().rposition(|p| p.refers_to(temp)) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Makes `value` carry a reference for the caller to consume right away.
    fn own(&mut self, value: Value) -> IrTemporaryValueReference {
        if !counted(&value.temp) {
            return value.temp;
        }
        if value.owned {
            if !self.unpend(&value.temp) {
                ice!("owned temporary %{} consumed twice", value.temp.id().0);
            }
            return value.temp;
        }
        self.emit(IrStatement::CreateStrongReference(value.temp.clone()));
        value.temp
    }

    fn release(&mut self, value: Value) {
        if value.owned && counted(&value.temp) {
            self.unpend(&value.temp);
            self.emit(IrStatement::DropStrongReference(value.temp));
        }
    }

    fn drop_temp(&mut self, temp: IrTemporaryValueReference) {
        if counted(&temp) {
            self.emit(IrStatement::DropStrongReference(temp));
        }
    }

    fn unit_type(&self) -> IrType {
        IrType::value(&self.core.unit.canonical_name)
    }

    fn yields_value(&self, ty: &BoundType) -> bool {
        let unit = ty.base().is_some_and(|b| b.same_as(&self.core.unit)) && !ty.is_nullable();
        !unit && !ty.is_nothing()
    }

    // ---- leaving scopes

    fn run_deferred(&mut self, code: Vec<DeferredCode>) {
        for deferred in code.into_iter().rev() {
            match deferred {
                DeferredCode::DropVariable(variable) => match self.bindings.get(&variable.id) {
                    Some(Binding::Ssa(temp)) => {
                        let temp = temp.clone();
                        self.drop_temp(temp);
                    }
                    Some(Binding::Storage(declaration)) => {
                        let declaration = declaration.clone();
                        let view = self.temporary(
                            IrExpression::VariableAccess(declaration.clone()),
                            declaration.ty.clone(),
                            false,
                        );
                        self.drop_temp(view);
                    }
                    None => {}
                },
            }
        }
    }

    /// Drops pending values created since `base` without forgetting them:
    /// the paths that do not leave keep needing them.
    fn drop_pending_from(&mut self, base: usize) {
        let doomed: Vec<IrTemporaryValueReference> = self.pending[base.min(self.pending.len())..]
            .iter()
            .rev()
            .cloned()
            .collect();
        for temp in doomed {
            self.emit(IrStatement::DropStrongReference(temp));
        }
    }

    fn leave_parameters(&mut self) {
        for declaration in self.parameter_storage.clone() {
            let view = self.temporary(
                IrExpression::VariableAccess(declaration.clone()),
                declaration.ty.clone(),
                false,
            );
            self.drop_temp(view);
        }
    }

    /// Cleanup for an exception raised at `context`: up to the innermost
    /// `try`, or out of the function.
    fn unwind(&mut self, context: &Rc<Context>) {
        let base = self.tries.last().map_or(0, |(_, base)| *base);
        self.drop_pending_from(base);
        self.run_deferred(context.deferred_code_at_unwind());
        if self.tries.is_empty() {
            for temp in self.frame_owned.clone() {
                self.emit(IrStatement::DropStrongReference(temp));
            }
            self.leave_parameters();
        }
    }

    fn catch_target(&self) -> Option<Arc<IrTryIdentity>> {
        self.tries.last().map(|(identity, _)| identity.clone())
    }

    fn landing_pad(&mut self, context: &Rc<Context>) -> IrInvocationLandingPad {
        let action = match self.catch_target() {
            Some(target) => IrLandingPadAction::JumpToCatch(target),
            None => IrLandingPadAction::Propagate,
        };
        let ((), cleanup) = self.with_code(|l| l.unwind(context));
        IrInvocationLandingPad {
            cleanup: IrCodeChunk::new(cleanup),
            action,
        }
    }

    // ---- functions

    pub(super) fn function_body(
        mut self,
        function: &BoundFunction,
        parameters: &[Arc<IrVariableDeclaration>],
    ) -> IrCodeChunk {
        for (parameter, declaration) in function.parameters.iter().zip(parameters) {
            if parameter.is_single_static_assignment(self.demote) {
                let view = self.temporary(
                    IrExpression::VariableAccess(declaration.clone()),
                    declaration.ty.clone(),
                    false,
                );
                self.bindings.insert(parameter.id, Binding::Ssa(view));
                continue;
            }
            if declaration.ty.is_reference_counted() {
                let view = self.temporary(
                    IrExpression::VariableAccess(declaration.clone()),
                    declaration.ty.clone(),
                    false,
                );
                self.emit(IrStatement::CreateStrongReference(view.clone()));
                self.emit(IrStatement::Assignment(IrAssignmentStatement {
                    target: IrAssignmentTarget::Variable(declaration.clone()),
                    value: view,
                }));
                self.parameter_storage.push(declaration.clone());
            }
            self.bindings
                .insert(parameter.id, Binding::Storage(declaration.clone()));
        }

        match &function.kind {
            FunctionKind::Constructor { .. } => self.constructor(function),
            FunctionKind::Destructor { .. } => self.destructor(function),
            FunctionKind::TopLevel | FunctionKind::Member { .. } => self.plain_body(function),
        }
        IrCodeChunk::new(self.code)
    }

    fn plain_body(&mut self, function: &BoundFunction) {
        match &function.body {
            Some(FunctionBody::Block(chunk)) => self.block_body(chunk),
            Some(FunctionBody::SingleExpression(expression)) => {
                let value = self.expression(expression);
                let result = self.returned(value, &expression.ty());
                self.leave_parameters();
                self.emit(IrStatement::Return(IrReturnStatement { value: result }));
            }
            None => {}
        }
    }

    fn block_body(&mut self, chunk: &BoundCodeChunk) {
        if self.statements(chunk, false) {
            return;
        }
        self.run_deferred(chunk.final_context().deferred_code_at_function_exit());
        self.leave_parameters();
        let value = self.constructed.clone();
        self.emit(IrStatement::Return(IrReturnStatement { value }));
    }

    fn returned(&mut self, value: Value, ty: &BoundType) -> Option<IrTemporaryValueReference> {
        if self.yields_value(ty) {
            Some(self.own(value))
        } else {
            self.release(value);
            None
        }
    }

    fn constructor(&mut self, function: &BoundFunction) {
        let Some(class) = function.class() else {
            ice!("constructor {} without a class", function.canonical_name);
        };
        let ty = ir_type(&class.base_type.self_type(Mutability::Exclusive));
        let object = self.temporary(
            IrExpression::AllocateObject {
                class: class.base_type.canonical_name.clone(),
            },
            ty,
            true,
        );
        if let Some(variable) = &function.constructed_object {
            self.bindings
                .insert(variable.id, Binding::Ssa(object.clone()));
        }
        self.constructed = Some(object.clone());
        self.frame_owned.push(object.clone());

        let weak = self.core.is_weak(&class.base_type);
        for member in &class.members {
            let value = match &member.initializer {
                MemberInitialization::None => continue,
                MemberInitialization::ConstructorParameter => {
                    let Some(parameter) = function.parameters.iter().find(|p| p.name == member.name) else {
                        ice!("no constructor parameter for member {}", member.name);
                    };
                    let ty = parameter.ty().map(ir_type).unwrap_or_else(|| self.unit_type());
                    self.read_variable(parameter, ty)
                }
                MemberInitialization::Expression(expression) => self.expression(expression),
            };
            if weak {
                self.emit(IrStatement::RegisterWeakReference(IrRegisterWeakReferenceStatement {
                    weak_object: object.clone(),
                    referred_object: value.temp.clone(),
                }));
                self.release(value);
                continue;
            }
            let value = self.own(value);
            self.emit(IrStatement::Assignment(IrAssignmentStatement {
                target: IrAssignmentTarget::ClassMember {
                    object: object.clone(),
                    member: member.name.clone(),
                },
                value,
            }));
        }

        if let Some(FunctionBody::Block(chunk)) = &function.body {
            self.block_body(chunk);
        }
    }

    fn destructor(&mut self, function: &BoundFunction) {
        let Some(class) = function.class() else {
            ice!("destructor {} without a class", function.canonical_name);
        };
        let receiver = match function.parameters.first().and_then(|p| self.bindings.get(&p.id)) {
            Some(Binding::Ssa(temp)) => temp.clone(),
            _ => ice!("destructor {} without a receiver", function.canonical_name),
        };
        if let Some(FunctionBody::Block(chunk)) = &function.body {
            if !self.statements(chunk, false) {
                self.run_deferred(chunk.final_context().deferred_code_at_scope_exit());
            }
        }
        let weak = self.core.is_weak(&class.base_type);
        for member in &class.members {
            let ty = ir_type(&member.ty(class.context()));
            if !ty.is_reference_counted() {
                continue;
            }
            let view = self.temporary(
                IrExpression::ClassMemberVariableAccess {
                    base: receiver.clone(),
                    member: member.name.clone(),
                },
                ty,
                false,
            );
            if weak {
                self.emit(IrStatement::UnregisterWeakReference(IrUnregisterWeakReferenceStatement {
                    weak_object: receiver.clone(),
                    referred_object: view,
                }));
            } else {
                self.emit(IrStatement::DropStrongReference(view));
            }
        }
        self.emit(IrStatement::DeallocateObject(receiver));
        self.emit(IrStatement::Return(IrReturnStatement { value: None }));
    }

    pub(super) fn global_initializer(mut self, initializer: &BoundExpression) -> IrImplicitEvaluation {
        let value = self.expression(initializer);
        let result = self.own(value);
        IrImplicitEvaluation {
            code: IrCodeChunk::new(self.code),
            result: Some(result),
        }
    }

    // ---- statements

    /// Lowers the statements of `chunk`, leaving out the trailing one if
    /// `skip_last`. Returns whether control left the chunk explicitly;
    /// anything after that is unreachable and not lowered.
    fn statements(&mut self, chunk: &BoundCodeChunk, skip_last: bool) -> bool {
        let count = chunk.statements.len() - usize::from(skip_last && !chunk.statements.is_empty());
        chunk.statements[..count].iter().any(|s| self.statement(s))
    }

    fn statement(&mut self, statement: &BoundStatement) -> bool {
        let context = statement.context();
        match &statement.kind {
            StatementKind::Variable {
                variable,
                initializer,
                ..
            } => {
                self.declare(variable, initializer.as_ref());
                false
            }
            StatementKind::Assignment { target, value } => {
                self.assign(context, target, value);
                false
            }
            StatementKind::Return(value) => {
                self.return_statement(context, value.as_ref());
                true
            }
            StatementKind::Throw(value) => {
                self.throw(context, value);
                true
            }
            StatementKind::While { condition, body } => {
                self.while_loop(condition, body);
                false
            }
            StatementKind::Break => {
                if let Some((identity, base)) = self.loops.last().cloned() {
                    self.drop_pending_from(base);
                    self.run_deferred(context.deferred_code_at_loop_exit());
                    self.emit(IrStatement::Break(IrBreakStatement { from: identity }));
                }
                true
            }
            StatementKind::Continue => {
                if let Some((identity, base)) = self.loops.last().cloned() {
                    self.drop_pending_from(base);
                    self.run_deferred(context.deferred_code_at_loop_exit());
                    self.emit(IrStatement::Continue(IrContinueStatement { loop_: identity }));
                }
                true
            }
            StatementKind::Expression(expression) => {
                let value = self.expression(expression);
                self.release(value);
                false
            }
        }
    }

    fn declare(&mut self, variable: &Rc<BoundVariable>, initializer: Option<&BoundExpression>) {
        if let (true, Some(initializer)) = (variable.is_single_static_assignment(self.demote), initializer) {
            let value = self.expression(initializer);
            let temp = self.own(value);
            self.bindings.insert(variable.id, Binding::Ssa(temp));
            return;
        }
        let ty = variable.ty().map(ir_type).unwrap_or_else(|| self.unit_type());
        let declaration = Arc::new(IrVariableDeclaration {
            name: variable.name.clone(),
            ty,
        });
        self.emit(IrStatement::VariableDeclaration(declaration.clone()));
        self.bindings
            .insert(variable.id, Binding::Storage(declaration.clone()));
        if let Some(initializer) = initializer {
            let value = self.expression(initializer);
            let value = self.own(value);
            self.emit(IrStatement::Assignment(IrAssignmentStatement {
                target: IrAssignmentTarget::Variable(declaration),
                value,
            }));
        }
    }

    fn storage_of(&mut self, variable: &BoundVariable) -> Option<Arc<IrVariableDeclaration>> {
        match self.bindings.get(&variable.id) {
            Some(Binding::Storage(declaration)) => Some(declaration.clone()),
            Some(Binding::Ssa(_)) => None,
            None if variable.kind == VariableKind::Global => Some(self.global_declaration(variable)),
            None => None,
        }
    }

    fn global_declaration(&mut self, variable: &BoundVariable) -> Arc<IrVariableDeclaration> {
        let ty = variable.ty().map(ir_type).unwrap_or_else(|| self.unit_type());
        self.globals
            .entry(variable.id)
            .or_insert_with(|| {
                Arc::new(IrVariableDeclaration {
                    name: variable.canonical_name(),
                    ty,
                })
            })
            .clone()
    }

    /// New value first, then the old one is released; assigning a value to
    /// the storage that already holds it stays safe.
    fn assign(&mut self, context: &Rc<Context>, target: &AssignmentTarget, value: &BoundExpression) {
        match target {
            AssignmentTarget::Variable { variable, .. } => {
                let storage = variable.get().and_then(|v| Some((v.clone(), self.storage_of(v)?)));
                let Some((variable, declaration)) = storage else {
                    let value = self.expression(value);
                    self.release(value);
                    return;
                };
                let value = self.expression(value);
                let value = self.own(value);
                let first = variable.kind == VariableKind::Local
                    && !variable.has_initializer
                    && context.ephemeral_state(&EffectSubject::Variable(variable.id)) == EphemeralState::Uninitialized;
                let old = (!first && declaration.ty.is_reference_counted()).then(|| {
                    self.temporary(
                        IrExpression::VariableAccess(declaration.clone()),
                        declaration.ty.clone(),
                        false,
                    )
                });
                self.emit(IrStatement::Assignment(IrAssignmentStatement {
                    target: IrAssignmentTarget::Variable(declaration),
                    value,
                }));
                if let Some(old) = old {
                    self.emit(IrStatement::DropStrongReference(old));
                }
            }
            AssignmentTarget::Member {
                object,
                member,
                resolved,
            } => {
                let object_value = self.expression(object);
                let value = self.expression(value);
                let value = self.own(value);
                let constructing = object
                    .as_variable()
                    .is_some_and(|v| v.kind == VariableKind::ConstructedObject);
                let first = constructing
                    && context.ephemeral_state(&EffectSubject::Member(member.clone())) == EphemeralState::Uninitialized;
                let ty = match resolved.get() {
                    Some(variable) => ir_type(&variable.ty(context)),
                    None => value.ty().clone(),
                };
                let old = (!first && ty.is_reference_counted()).then(|| {
                    self.temporary(
                        IrExpression::ClassMemberVariableAccess {
                            base: object_value.temp.clone(),
                            member: member.clone(),
                        },
                        ty,
                        false,
                    )
                });
                self.emit(IrStatement::Assignment(IrAssignmentStatement {
                    target: IrAssignmentTarget::ClassMember {
                        object: object_value.temp.clone(),
                        member: member.clone(),
                    },
                    value,
                }));
                if let Some(old) = old {
                    self.emit(IrStatement::DropStrongReference(old));
                }
                self.release(object_value);
            }
        }
    }

    fn return_statement(&mut self, context: &Rc<Context>, value: Option<&BoundExpression>) {
        let result = match (value, self.constructed.clone()) {
            (Some(expression), None) => {
                let value = self.expression(expression);
                self.returned(value, &expression.ty())
            }
            (Some(expression), Some(object)) => {
                let value = self.expression(expression);
                self.release(value);
                Some(object)
            }
            (None, constructed) => constructed,
        };
        self.drop_pending_from(0);
        self.run_deferred(context.deferred_code_at_function_exit());
        self.leave_parameters();
        self.emit(IrStatement::Return(IrReturnStatement { value: result }));
    }

    fn throw(&mut self, context: &Rc<Context>, value: &BoundExpression) {
        let value = self.expression(value);
        let value = self.own(value);
        let catch_target = self.catch_target();
        self.unwind(context);
        let fill_stack_trace = self.core.fill_stack_trace.symbol();
        let unit = self.unit_type();
        self.temporary(
            IrExpression::StaticDispatchInvocation {
                function: fill_stack_trace,
                arguments: vec![value.clone()],
                landing_pad: Some(IrInvocationLandingPad {
                    cleanup: IrCodeChunk::default(),
                    action: IrLandingPadAction::Swallow,
                }),
            },
            unit,
            false,
        );
        self.emit(IrStatement::Throw(IrThrowStatement { value, catch_target }));
    }

    /// `while c { body }` becomes a loop whose body starts with
    /// `if !c { break }`.
    fn while_loop(&mut self, condition: &BoundExpression, body: &BoundCodeChunk) {
        let identity = self.id.fresh_loop();
        self.loops.push((identity.clone(), self.pending.len()));
        let exit = identity.clone();
        let ((), code) = self.with_code(|l| {
            let condition = l.expression(condition);
            l.emit(IrStatement::ConditionalBranch(IrConditionalBranch {
                condition: condition.temp.clone(),
                then_branch: IrCodeChunk::default(),
                else_branch: Some(IrCodeChunk::new(vec![IrStatement::Break(IrBreakStatement {
                    from: exit,
                })])),
            }));
            l.release(condition);
            if !l.statements(body, false) {
                l.run_deferred(body.final_context().deferred_code_at_scope_exit());
            }
        });
        self.loops.pop();
        self.emit(IrStatement::While(IrWhileLoop {
            identity,
            body: IrCodeChunk::new(code),
        }));
    }

    // ---- expressions

    fn expression(&mut self, expression: &BoundExpression) -> Value {
        let ty = ir_type(&expression.ty());
        match &expression.kind {
            ExpressionKind::IntegerLiteral { effective, .. } => {
                self.produce(IrExpression::IntegerLiteral(effective.get()), ty, false)
            }
            ExpressionKind::BooleanLiteral(value) => self.produce(IrExpression::BooleanLiteral(*value), ty, false),
            ExpressionKind::StringLiteral(value) => {
                self.produce(IrExpression::StringLiteral(value.clone()), ty, true)
            }
            ExpressionKind::NullLiteral => self.produce(IrExpression::NullLiteral, ty, true),
            ExpressionKind::Identifier { variable, .. } => match variable.get() {
                Some(variable) => self.read_variable(variable, ty),
                None => self.produce(IrExpression::NullLiteral, ty, true),
            },
            ExpressionKind::MemberAccess {
                object,
                member,
                null_safe,
                ..
            } => self.member_access(object, member, *null_safe, ty),
            ExpressionKind::NotNullAssertion(inner) => {
                let value = self.expression(inner);
                let temp = self.temporary(IrExpression::NotNullAssertion(value.temp.clone()), ty, false);
                if value.owned {
                    self.unpend(&value.temp);
                    self.pending.push(temp.clone());
                }
                Value {
                    temp,
                    owned: value.owned,
                }
            }
            ExpressionKind::Invocation(invocation) => self.invocation(expression, invocation, ty),
            ExpressionKind::If(if_expr) => self.conditional(expression, if_expr, ty),
            ExpressionKind::Try(try_expr) => self.try_catch(expression, try_expr, ty),
        }
    }

    fn read_variable(&mut self, variable: &BoundVariable, ty: IrType) -> Value {
        match self.bindings.get(&variable.id) {
            Some(Binding::Ssa(temp)) => Value::borrowed(temp.clone()),
            Some(Binding::Storage(declaration)) => {
                let declaration = declaration.clone();
                self.produce(IrExpression::VariableAccess(declaration), ty, false)
            }
            None if variable.kind == VariableKind::Global => {
                let declaration = self.global_declaration(variable);
                self.produce(IrExpression::VariableAccess(declaration), ty, false)
            }
            None => self.produce(IrExpression::NullLiteral, ty, true),
        }
    }

    fn member_access(&mut self, object: &BoundExpression, member: &str, null_safe: bool, ty: IrType) -> Value {
        let object_value = self.expression(object);
        if null_safe && object.ty().is_nullable() {
            let condition = self.temporary(
                IrExpression::IsNull(object_value.temp.clone()),
                ir_type(&self.core.bool_type()),
                false,
            );
            let (null, then_code) = self.with_code(|l| l.temporary(IrExpression::NullLiteral, ty.clone(), true));
            let base = object_value.temp.clone();
            let (access, else_code) = self.with_code(|l| {
                let view = l.temporary(
                    IrExpression::ClassMemberVariableAccess {
                        base,
                        member: member.to_string(),
                    },
                    ty.clone(),
                    false,
                );
                l.own(Value::borrowed(view))
            });
            let result = self.produce(
                IrExpression::IfExpression {
                    condition,
                    then_branch: IrImplicitEvaluation {
                        code: IrCodeChunk::new(then_code),
                        result: Some(null),
                    },
                    else_branch: IrImplicitEvaluation {
                        code: IrCodeChunk::new(else_code),
                        result: Some(access),
                    },
                },
                ty,
                true,
            );
            self.release(object_value);
            return result;
        }

        let view = self.temporary(
            IrExpression::ClassMemberVariableAccess {
                base: object_value.temp.clone(),
                member: member.to_string(),
            },
            ty,
            false,
        );
        if !object_value.owned {
            return Value::borrowed(view);
        }
        // The object may die with its last reference; keep the member alive.
        let temp = self.own(Value::borrowed(view));
        self.release(object_value);
        if counted(&temp) {
            self.pending.push(temp.clone());
        }
        Value {
            owned: counted(&temp),
            temp,
        }
    }

    fn invocation(&mut self, expression: &BoundExpression, invocation: &BoundInvocation, ty: IrType) -> Value {
        let arguments: Vec<Value> = invocation
            .all_arguments()
            .into_iter()
            .map(|a| self.expression(a))
            .collect();
        let Some(target) = invocation.target.get() else {
            for argument in arguments.into_iter().rev() {
                self.release(argument);
            }
            return self.produce(IrExpression::NullLiteral, ty, true);
        };
        let function = &target.function;
        let landing_pad = (!function.is_nothrow()).then(|| self.landing_pad(expression.context()));
        let temps: Vec<IrTemporaryValueReference> = arguments.iter().map(|a| a.temp.clone()).collect();
        let call = match &target.dynamic_dispatch {
            Some(interface) => IrExpression::DynamicDispatchInvocation {
                interface: interface.canonical_name.clone(),
                function: function.symbol(),
                arguments: temps,
                landing_pad,
            },
            None => IrExpression::StaticDispatchInvocation {
                function: function.symbol(),
                arguments: temps,
                landing_pad,
            },
        };
        let result = self.produce(call, ty, true);
        for argument in arguments.into_iter().rev() {
            self.release(argument);
        }
        result
    }

    fn implicit(&mut self, chunk: &BoundCodeChunk, want_result: bool) -> IrImplicitEvaluation {
        let base = self.pending.len();
        let (result, code) = self.with_code(|l| {
            let result_expression = chunk
                .result_expression()
                .filter(|_| want_result && !chunk.terminates());
            if l.statements(chunk, result_expression.is_some()) {
                return None;
            }
            let result = result_expression.map(|e| {
                let value = l.expression(e);
                l.own(value)
            });
            l.run_deferred(chunk.final_context().deferred_code_at_scope_exit());
            result
        });
        self.pending.truncate(base);
        IrImplicitEvaluation {
            code: IrCodeChunk::new(code),
            result,
        }
    }

    fn conditional(&mut self, expression: &BoundExpression, if_expr: &BoundIf, ty: IrType) -> Value {
        let has_value = if_expr.else_branch.is_some() && self.yields_value(&expression.ty());
        let condition = self.expression(&if_expr.condition);
        let then_branch = self.implicit(&if_expr.then_branch, has_value);
        let else_branch = match &if_expr.else_branch {
            Some(branch) => self.implicit(branch, has_value),
            None => IrImplicitEvaluation {
                code: IrCodeChunk::default(),
                result: None,
            },
        };
        let result = self.produce(
            IrExpression::IfExpression {
                condition: condition.temp.clone(),
                then_branch,
                else_branch,
            },
            ty,
            has_value,
        );
        self.release(condition);
        result
    }

    fn try_catch(&mut self, expression: &BoundExpression, try_expr: &BoundTry, ty: IrType) -> Value {
        let has_value = self.yields_value(&expression.ty());
        let identity = self.id.fresh_try();
        self.tries.push((identity.clone(), self.pending.len()));
        let body = self.implicit(&try_expr.body, has_value);
        self.tries.pop();

        let catch_variable = Arc::new(IrVariableDeclaration {
            name: try_expr.catch_variable.name.clone(),
            ty: ir_type(&self.core.throwable_type()),
        });
        self.bindings.insert(
            try_expr.catch_variable.id,
            Binding::Storage(catch_variable.clone()),
        );
        let catch_branch = self.implicit(&try_expr.catch_body, has_value);
        self.produce(
            IrExpression::TryCatchExpression {
                identity,
                body,
                catch_variable,
                catch_branch,
            },
            ty,
            has_value,
        )
    }
}
