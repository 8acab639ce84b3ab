#![forbid(unsafe_code)]

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;

use ember_ast::{
    self as ast, BinaryOp, Expr, ExprKind, IfExpr, InvocationExpr, NumberBase, Span, Spanned, Stmt,
    TypeArgumentRef, UnaryOp, VariableOwnership,
};

use super::class::{BoundMemberVariable, inherited_functions_named};
use super::function::{BoundFunction, FunctionKind};
use super::statement::BoundCodeChunk;
use super::variable::{BoundVariable, VariableKind};
use super::{Phase, PhaseMemo, collect};
use crate::context::{Context, DeferredCode, EffectSubject, EphemeralState, ScopeKind, SideEffect};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::overload::{ArgumentType, Candidate, OverloadQuery, literal_out_of_range, resolve_overload};
use crate::types::{BaseType, BoundType, Mutability, TypeUnification};

pub struct BoundExpression {
    pub span: Span,
    context: Rc<Context>,
    /// Context following the enclosing statement; side effects land here.
    continuation: Rc<Context>,
    pub kind: ExpressionKind,
    expected: RefCell<Option<BoundType>>,
    ty: OnceCell<BoundType>,
    phases: PhaseMemo,
}

pub enum ExpressionKind {
    IntegerLiteral {
        value: i128,
        base: NumberBase,
        /// The value after adapting to the literal's type; differs from
        /// `value` for bit patterns read as two's complement.
        effective: Cell<i128>,
    },
    BooleanLiteral(bool),
    StringLiteral(String),
    NullLiteral,
    Identifier {
        name: String,
        variable: OnceCell<Rc<BoundVariable>>,
    },
    MemberAccess {
        object: Box<BoundExpression>,
        member: String,
        null_safe: bool,
        resolved: OnceCell<Rc<BoundMemberVariable>>,
    },
    Invocation(Box<BoundInvocation>),
    NotNullAssertion(Box<BoundExpression>),
    If(Box<BoundIf>),
    Try(Box<BoundTry>),
}

pub struct BoundInvocation {
    pub receiver: Option<BoundExpression>,
    pub name: String,
    type_arguments: Vec<TypeArgumentRef>,
    pub arguments: Vec<BoundExpression>,
    pub target: OnceCell<InvocationTarget>,
}

/// The overload an invocation was bound to.
pub struct InvocationTarget {
    pub function: Rc<BoundFunction>,
    /// Parameter types after substituting the solved type variables,
    /// receiver first.
    pub parameter_types: Vec<BoundType>,
    /// Set when the function is abstract in this interface and the call
    /// must be dispatched on the runtime type.
    pub dynamic_dispatch: Option<Rc<BaseType>>,
}

impl BoundInvocation {
    /// Receiver (if any) followed by the arguments, in evaluation order.
    pub fn all_arguments(&self) -> Vec<&BoundExpression> {
        self.receiver.iter().chain(self.arguments.iter()).collect()
    }
}

pub struct BoundIf {
    pub condition: BoundExpression,
    pub then_branch: BoundCodeChunk,
    pub else_branch: Option<BoundCodeChunk>,
}

pub struct BoundTry {
    pub body: BoundCodeChunk,
    pub catch_variable: Rc<BoundVariable>,
    pub catch_body: BoundCodeChunk,
}

fn operator_function(op: BinaryOp) -> Option<&'static str> {
    Some(match op {
        BinaryOp::Plus => "plus",
        BinaryOp::Minus => "minus",
        BinaryOp::Times => "times",
        BinaryOp::Divide => "div",
        BinaryOp::Modulo => "rem",
        BinaryOp::Equals => "equals",
        BinaryOp::Less => "lessThan",
        BinaryOp::Greater => "greaterThan",
        BinaryOp::LessOrEqual => "lessThanOrEqual",
        BinaryOp::GreaterOrEqual => "greaterThanOrEqual",
        BinaryOp::NotEquals | BinaryOp::And | BinaryOp::Or => return None,
    })
}

fn call(span: Span, receiver: Expr, name: &str, arguments: Vec<Expr>) -> Expr {
    Expr {
        span,
        kind: ExprKind::Invocation(Box::new(InvocationExpr {
            receiver: Some(receiver),
            name: Spanned::new(span, name.to_string()),
            type_arguments: Vec::new(),
            arguments,
        })),
    }
}

fn block(expr: Expr) -> ast::CodeChunk {
    ast::CodeChunk {
        span: expr.span,
        stmts: vec![Stmt::Expr(expr)],
    }
}

fn boolean(span: Span, value: bool) -> Expr {
    Expr {
        span,
        kind: ExprKind::BooleanLiteral(value),
    }
}

/// Operators are calls to operator functions; `&&` and `||` short-circuit
/// and become conditionals.
fn desugar(expr: &Expr) -> Option<Expr> {
    let span = expr.span;
    match &expr.kind {
        ExprKind::Binary { left, op, right } => {
            let (left, right) = ((**left).clone(), (**right).clone());
            Some(match op {
                BinaryOp::NotEquals => call(span, call(span, left, "equals", vec![right]), "not", Vec::new()),
                BinaryOp::And => Expr {
                    span,
                    kind: ExprKind::If(Box::new(IfExpr {
                        condition: left,
                        then_branch: block(right),
                        else_branch: Some(block(boolean(span, false))),
                    })),
                },
                BinaryOp::Or => Expr {
                    span,
                    kind: ExprKind::If(Box::new(IfExpr {
                        condition: left,
                        then_branch: block(boolean(span, true)),
                        else_branch: Some(block(right)),
                    })),
                },
                other => call(span, left, operator_function(*other)?, vec![right]),
            })
        }
        ExprKind::Unary { op: UnaryOp::Not, operand } => {
            Some(call(span, (**operand).clone(), "not", Vec::new()))
        }
        ExprKind::Unary {
            op: UnaryOp::Negate,
            operand,
        } => match &operand.kind {
            ExprKind::IntegerLiteral(_) => None,
            _ => Some(call(span, (**operand).clone(), "negate", Vec::new())),
        },
        _ => None,
    }
}

fn integer(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

impl BoundExpression {
    pub fn bind(expr: &Expr, context: &Rc<Context>, continuation: &Rc<Context>) -> Self {
        if let Some(desugared) = desugar(expr) {
            return Self::bind(&desugared, context, continuation);
        }
        let sub = |e: &Expr| Self::bind(e, context, continuation);
        let kind = match &expr.kind {
            ExprKind::IntegerLiteral(literal) => ExpressionKind::IntegerLiteral {
                value: integer(literal.value),
                base: literal.base,
                effective: Cell::new(integer(literal.value)),
            },
            ExprKind::Unary { operand, .. } => match &operand.kind {
                ExprKind::IntegerLiteral(literal) => ExpressionKind::IntegerLiteral {
                    value: -integer(literal.value),
                    base: literal.base,
                    effective: Cell::new(-integer(literal.value)),
                },
                _ => ice!("unary operator survived desugaring"),
            },
            ExprKind::Binary { .. } => ice!("binary operator survived desugaring"),
            ExprKind::BooleanLiteral(value) => ExpressionKind::BooleanLiteral(*value),
            ExprKind::StringLiteral(value) => ExpressionKind::StringLiteral(value.clone()),
            ExprKind::NullLiteral => ExpressionKind::NullLiteral,
            ExprKind::Identifier(name) => ExpressionKind::Identifier {
                name: name.node.clone(),
                variable: OnceCell::new(),
            },
            ExprKind::MemberAccess {
                object,
                member,
                null_safe,
            } => ExpressionKind::MemberAccess {
                object: Box::new(sub(object)),
                member: member.node.clone(),
                null_safe: *null_safe,
                resolved: OnceCell::new(),
            },
            ExprKind::Invocation(invocation) => ExpressionKind::Invocation(Box::new(BoundInvocation {
                receiver: invocation.receiver.as_ref().map(sub),
                name: invocation.name.node.clone(),
                type_arguments: invocation.type_arguments.clone(),
                arguments: invocation.arguments.iter().map(sub).collect(),
                target: OnceCell::new(),
            })),
            ExprKind::NotNullAssertion(inner) => ExpressionKind::NotNullAssertion(Box::new(sub(inner))),
            ExprKind::If(if_expr) => ExpressionKind::If(Box::new(BoundIf {
                condition: sub(&if_expr.condition),
                then_branch: BoundCodeChunk::bind(&if_expr.then_branch, context, ScopeKind::Branch),
                else_branch: if_expr
                    .else_branch
                    .as_ref()
                    .map(|chunk| BoundCodeChunk::bind(chunk, context, ScopeKind::Branch)),
            })),
            ExprKind::Try(try_expr) => {
                let catch_variable = Rc::new(BoundVariable::new(
                    try_expr.catch_variable.node.clone(),
                    try_expr.catch_variable.span,
                    VariableKind::CatchVariable,
                    VariableOwnership::Captured,
                    false,
                    true,
                ));
                let catch_body = BoundCodeChunk::bind(&try_expr.catch_body, context, ScopeKind::Catch);
                let scope = catch_body.scope();
                scope.add_variable(catch_variable.clone());
                scope.track_side_effect(SideEffect::Reached(EffectSubject::Variable(catch_variable.id)));
                scope.add_deferred_code(DeferredCode::DropVariable(catch_variable.clone()));
                ExpressionKind::Try(Box::new(BoundTry {
                    body: BoundCodeChunk::bind(&try_expr.body, context, ScopeKind::TryBody),
                    catch_variable,
                    catch_body,
                }))
            }
        };
        Self {
            span: expr.span,
            context: context.clone(),
            continuation: continuation.clone(),
            kind,
            expected: RefCell::new(None),
            ty: OnceCell::new(),
            phases: PhaseMemo::default(),
        }
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.context
    }

    /// The type the surrounding code wants; literals adapt to it. Must be
    /// set before phase 2.
    pub fn set_expected_type(&self, ty: BoundType) {
        if self.phases.is_done(Phase::Two) {
            return;
        }
        *self.expected.borrow_mut() = Some(ty);
    }

    /// The type after phase 2; a stand-in before.
    pub fn ty(&self) -> BoundType {
        match self.ty.get() {
            Some(ty) => ty.clone(),
            None => BoundType::Unresolved {
                name: "<unknown>".to_string(),
                standin: Box::new(self.context.core_types().any_nullable()),
            },
        }
    }

    fn set_type(&self, ty: BoundType) {
        if self.ty.set(ty).is_err() {
            ice!("type of expression at {:?} set twice", self.span);
        }
    }

    /// An integer literal whose type is not fixed yet.
    pub fn flexible_integer(&self) -> Option<(i128, NumberBase)> {
        match &self.kind {
            ExpressionKind::IntegerLiteral { value, base, .. } if !self.phases.is_done(Phase::Two) => {
                Some((*value, *base))
            }
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<Rc<BoundVariable>> {
        match &self.kind {
            ExpressionKind::Identifier { variable, .. } => variable.get().cloned(),
            _ => None,
        }
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::One, || match &self.kind {
            ExpressionKind::MemberAccess { object, .. } => object.phase1(),
            ExpressionKind::NotNullAssertion(inner) => inner.phase1(),
            ExpressionKind::Invocation(invocation) => {
                collect(invocation.all_arguments().into_iter().map(|a| a.phase1()))
            }
            ExpressionKind::If(if_expr) => {
                let mut parts = vec![if_expr.condition.phase1(), if_expr.then_branch.phase1()];
                if let Some(else_branch) = &if_expr.else_branch {
                    parts.push(else_branch.phase1());
                }
                collect(parts)
            }
            ExpressionKind::Try(try_expr) => {
                try_expr
                    .catch_variable
                    .set_type(self.context.core_types().throwable_type());
                collect([try_expr.body.phase1(), try_expr.catch_body.phase1()])
            }
            _ => Vec::new(),
        })
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || {
            let (ty, diagnostics) = self.infer();
            self.set_type(ty);
            diagnostics
        })
    }

    fn expected(&self) -> Option<BoundType> {
        self.expected.borrow().clone()
    }

    fn infer(&self) -> (BoundType, Vec<Diagnostic>) {
        let core = self.context.core_types();
        match &self.kind {
            ExpressionKind::IntegerLiteral {
                value,
                base,
                effective,
            } => {
                let expected = self.expected().map(|t| t.non_nullable());
                let target = match expected.as_ref().and_then(|t| t.base()) {
                    Some(b) if b.integer_kind().is_some() => b.clone(),
                    _ => core.int().clone(),
                };
                let Some(kind) = target.integer_kind() else {
                    ice!("integer literal typed as non-integer {}", target.canonical_name);
                };
                let ty = BoundType::simple(&target, Mutability::Immutable);
                match kind.accept_literal(*value, *base) {
                    Some(adapted) => {
                        effective.set(adapted);
                        (ty, Vec::new())
                    }
                    None => (ty, vec![literal_out_of_range(*value, &target, kind, self.span)]),
                }
            }
            ExpressionKind::BooleanLiteral(_) => (core.bool_type(), Vec::new()),
            ExpressionKind::StringLiteral(_) => (core.string_type(), Vec::new()),
            ExpressionKind::NullLiteral => (core.nothing_type().nullable(), Vec::new()),
            ExpressionKind::Identifier { name, variable } => {
                match self.context.resolve_variable(name, false) {
                    Some(found) => {
                        let (ty, cyclic) = match (found.ty(), found.type_source()) {
                            (Some(ty), _) => (ty.clone(), None),
                            (None, Some(global)) => global.ty(),
                            (None, None) => (
                                BoundType::Unresolved {
                                    name: name.clone(),
                                    standin: Box::new(core.any_nullable()),
                                },
                                None,
                            ),
                        };
                        let _ = variable.set(found);
                        (ty, cyclic.into_iter().collect())
                    }
                    None => (
                        BoundType::Unresolved {
                            name: name.clone(),
                            standin: Box::new(core.any_nullable()),
                        },
                        vec![Diagnostic::new(
                            DiagnosticKind::UnresolvedVariable { name: name.clone() },
                            self.span,
                        )],
                    ),
                }
            }
            ExpressionKind::MemberAccess {
                object,
                member,
                null_safe,
                resolved,
            } => self.infer_member_access(object, member, *null_safe, resolved),
            ExpressionKind::NotNullAssertion(inner) => {
                let diagnostics = inner.phase2();
                (inner.ty().non_nullable(), diagnostics)
            }
            ExpressionKind::Invocation(invocation) => self.infer_invocation(invocation),
            ExpressionKind::If(if_expr) => self.infer_if(if_expr),
            ExpressionKind::Try(try_expr) => self.infer_try(try_expr),
        }
    }

    fn infer_member_access(
        &self,
        object: &BoundExpression,
        member: &str,
        null_safe: bool,
        resolved: &OnceCell<Rc<BoundMemberVariable>>,
    ) -> (BoundType, Vec<Diagnostic>) {
        let core = self.context.core_types();
        let mut diagnostics = object.phase2();
        let object_type = object.ty();
        let unknown = BoundType::Unresolved {
            name: member.to_string(),
            standin: Box::new(core.any_nullable()),
        };
        if object_type.is_unresolved() {
            return (unknown, diagnostics);
        }
        if object_type.is_nullable() && !null_safe {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::UnsafeNullableAccess {
                    ty: object_type.to_string(),
                },
                object.span,
            ));
        }
        let viewed = object_type.non_nullable().effective_upper_bound();
        let found = viewed
            .base()
            .and_then(|b| Some((b.clone(), b.class()?.member(member)?)));
        let Some((base, variable)) = found else {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::UnknownMember {
                    ty: object_type.to_string(),
                    member: member.to_string(),
                },
                self.span,
            ));
            return (unknown, diagnostics);
        };
        let declared = variable
            .ty(&self.context)
            .substitute_arguments(&base.type_parameters, viewed.arguments());
        let mutability = object_type.mutability().combined_with(declared.mutability());
        let mut ty = declared.with_mutability(mutability);
        if null_safe && object_type.is_nullable() {
            ty = ty.nullable();
        }
        let _ = resolved.set(variable);
        (ty, diagnostics)
    }

    fn branch_type(&self, branches: &[&BoundCodeChunk]) -> BoundType {
        let core = self.context.core_types();
        let top = BoundType::simple(&core.any, Mutability::ReadOnly);
        let mut result: Option<BoundType> = None;
        for branch in branches {
            if branch.terminates() {
                continue;
            }
            let ty = match branch.result_expression() {
                Some(expression) => expression.ty(),
                None => core.unit_type(),
            };
            result = Some(match result {
                None => ty,
                Some(previous) => previous
                    .closest_common_supertype_with(&ty, &top)
                    .unwrap_or_else(|| core.any_nullable()),
            });
        }
        result.unwrap_or_else(|| core.nothing_type())
    }

    /// Records where the branches join so initialization state flows past
    /// the conditional.
    fn merge_branches(&self, branches: &[&BoundCodeChunk], fallthrough: bool) {
        let mut joined: Vec<Rc<Context>> = branches
            .iter()
            .filter(|b| !b.terminates())
            .map(|b| b.final_context())
            .collect();
        if fallthrough {
            joined.push(self.context.clone());
        }
        self.continuation.track_side_effect(SideEffect::Merge(joined));
    }

    fn infer_if(&self, if_expr: &BoundIf) -> (BoundType, Vec<Diagnostic>) {
        let core = self.context.core_types();
        let bool_type = core.bool_type();
        if_expr.condition.set_expected_type(bool_type.clone());
        let mut parts = vec![if_expr.condition.phase2()];
        parts.push(
            bool_type
                .unify(&if_expr.condition.ty(), if_expr.condition.span, TypeUnification::new())
                .into_diagnostics(),
        );

        let mut branches = vec![&if_expr.then_branch];
        branches.extend(if_expr.else_branch.as_ref());
        if let Some(expected) = self.expected() {
            for branch in &branches {
                branch.set_expected_result(expected.clone());
            }
        }
        parts.extend(branches.iter().map(|b| b.phase2()));
        self.merge_branches(&branches, if_expr.else_branch.is_none());

        let ty = if if_expr.else_branch.is_some() {
            self.branch_type(&branches)
        } else {
            core.unit_type()
        };
        (ty, collect(parts))
    }

    fn infer_try(&self, try_expr: &BoundTry) -> (BoundType, Vec<Diagnostic>) {
        let branches = [&try_expr.body, &try_expr.catch_body];
        if let Some(expected) = self.expected() {
            for branch in &branches {
                branch.set_expected_result(expected.clone());
            }
        }
        let diagnostics = collect(branches.iter().map(|b| b.phase2()));
        self.merge_branches(&branches, false);
        (self.branch_type(&branches), diagnostics)
    }

    /// Brings a type declared on `function` into the view of this call:
    /// type parameters of the owner are replaced by the receiver's type
    /// arguments; the function's own become type variables.
    fn adapt(&self, ty: &BoundType, function: &BoundFunction, receiver: Option<&BoundType>) -> BoundType {
        let mut adapted = ty.clone();
        if let (FunctionKind::Member { owner }, Some(receiver)) = (&function.kind, receiver) {
            let viewed = receiver.non_nullable().effective_upper_bound();
            if let Some(base) = viewed.base() {
                let arguments = base
                    .supertype_arguments(owner, viewed.arguments())
                    .unwrap_or_default();
                adapted = adapted.substitute_arguments(&owner.type_parameters, &arguments);
            }
        }
        adapted.with_type_variables(&function.type_parameters)
    }

    fn candidate(&self, function: &Rc<BoundFunction>, receiver: Option<&BoundType>) -> Candidate {
        Candidate {
            function: function.clone(),
            type_parameters: function.type_parameters.clone(),
            parameter_types: function
                .parameter_types()
                .iter()
                .map(|t| self.adapt(t, function, receiver))
                .collect(),
            return_type: function
                .declared_return_type()
                .map(|t| self.adapt(&t, function, receiver)),
        }
    }

    fn collect_candidates(&self, invocation: &BoundInvocation, receiver: Option<&BoundType>) -> Vec<Candidate> {
        let name = invocation.name.as_str();
        let arity = invocation.all_arguments().len();
        let Some(receiver) = receiver else {
            if let Some(base) = self.context.resolve_base_type(name, false) {
                let Some(class) = base.class() else {
                    return Vec::new();
                };
                let constructor = &class.constructor;
                if constructor.parameter_count() != arity {
                    return Vec::new();
                }
                let parameters = &base.type_parameters;
                return vec![Candidate {
                    function: constructor.clone(),
                    type_parameters: parameters.clone(),
                    parameter_types: constructor
                        .parameter_types()
                        .iter()
                        .map(|t| t.with_type_variables(parameters))
                        .collect(),
                    return_type: Some(base.self_type(Mutability::Exclusive).with_type_variables(parameters)),
                }];
            }
            return self
                .context
                .function_overload_sets(name)
                .into_iter()
                .flatten()
                .filter(|f| f.parameter_count() == arity && !f.is_receiver_bearing())
                .map(|f| self.candidate(&f, None))
                .collect();
        };

        let mut members: Vec<Rc<BoundFunction>> = Vec::new();
        let viewed = receiver.non_nullable().effective_upper_bound();
        if let Some(base) = viewed.base() {
            if let Some(class) = base.class() {
                members.extend(class.member_functions_named(name));
                for inherited in inherited_functions_named(&class, name) {
                    let implemented = members
                        .iter()
                        .any(|m| m.parameter_count() == inherited.parameter_count());
                    if !implemented {
                        members.push(inherited);
                    }
                }
            } else if let Some(interface) = base.interface() {
                members.extend(interface.all_functions_named(name));
            }
        }
        let top_level = self.context.function_overload_sets(name).into_iter().flatten();
        members
            .into_iter()
            .chain(top_level)
            .filter(|f| f.parameter_count() == arity && f.is_receiver_bearing())
            .map(|f| self.candidate(&f, Some(receiver)))
            .collect()
    }

    fn infer_invocation(&self, invocation: &BoundInvocation) -> (BoundType, Vec<Diagnostic>) {
        let core = self.context.core_types();
        let mut parts = Vec::new();
        let arguments = invocation.all_arguments();

        let argument_types: Vec<ArgumentType> = arguments
            .iter()
            .map(|a| match a.flexible_integer() {
                Some((value, base)) => ArgumentType::IntegerLiteral { value, base },
                None => {
                    parts.push(a.phase2());
                    ArgumentType::Typed(a.ty())
                }
            })
            .collect();
        let argument_spans: Vec<Span> = arguments.iter().map(|a| a.span).collect();
        let receiver_type = invocation.receiver.as_ref().map(|_| match &argument_types[0] {
            ArgumentType::Typed(ty) => ty.clone(),
            ArgumentType::IntegerLiteral { .. } => core.int_type(),
        });

        let explicit: Vec<BoundType> = invocation
            .type_arguments
            .iter()
            .map(|a| {
                let (ty, found) = self.context.resolve_type(&a.ty);
                parts.push(found);
                ty
            })
            .collect();

        let unresolved = BoundType::Unresolved {
            name: invocation.name.clone(),
            standin: Box::new(core.any_nullable()),
        };
        let finish_literals = |parts: &mut Vec<Vec<Diagnostic>>| {
            for argument in &arguments {
                if argument.flexible_integer().is_some() {
                    parts.push(argument.phase2());
                }
            }
        };

        if receiver_type.as_ref().is_some_and(BoundType::is_unresolved) {
            finish_literals(&mut parts);
            return (unresolved, collect(parts));
        }
        let candidates = self.collect_candidates(invocation, receiver_type.as_ref());
        let expected = self.expected();
        let query = OverloadQuery {
            name: &invocation.name,
            arguments: &argument_types,
            argument_spans: &argument_spans,
            explicit_type_arguments: &explicit,
            expected_return: expected.as_ref(),
            span: self.span,
            default_integer: core.int_type(),
        };
        let (chosen, found) = resolve_overload(candidates, &query);
        parts.push(found);
        let Some(evaluation) = chosen else {
            parts.push(vec![Diagnostic::new(
                DiagnosticKind::UnresolvableFunction {
                    name: invocation.name.clone(),
                    arity: arguments.len(),
                },
                self.span,
            )]);
            finish_literals(&mut parts);
            return (unresolved, collect(parts));
        };

        let unification = &evaluation.unification;
        let parameter_types: Vec<BoundType> = evaluation
            .candidate
            .parameter_types
            .iter()
            .map(|t| t.instantiate(unification))
            .collect();
        for (argument, parameter) in arguments.iter().zip(&parameter_types) {
            if argument.flexible_integer().is_some() {
                argument.set_expected_type(parameter.clone());
                parts.push(argument.phase2());
            }
        }

        let function = evaluation.candidate.function.clone();
        let return_type = match &evaluation.candidate.return_type {
            Some(declared) => declared.instantiate(unification),
            None => {
                let (inferred, cyclic) = function.return_type();
                parts.push(cyclic.into_iter().collect());
                self.adapt(&inferred, &function, receiver_type.as_ref())
                    .instantiate(unification)
            }
        };
        let ty = if function.is_guaranteed_to_throw() {
            core.nothing_type()
        } else {
            return_type
        };

        // Handing a variable to an exclusive parameter ends its lifetime.
        for (argument, parameter) in arguments.iter().zip(&function.parameters) {
            let copied = parameter.ty().is_some_and(BoundType::is_value_type);
            if parameter.ownership != VariableOwnership::Exclusive || copied {
                continue;
            }
            if let Some(variable) = argument.as_variable() {
                self.continuation
                    .track_side_effect(SideEffect::Reached(EffectSubject::LifetimeEnded(variable.id)));
            }
        }

        let dynamic_dispatch = match &function.kind {
            FunctionKind::Member { owner } if owner.interface().is_some() => Some(owner.clone()),
            _ => None,
        };
        tracing::trace!(name = %invocation.name, symbol = %function.symbol(), "bound invocation");
        let _ = invocation.target.set(InvocationTarget {
            function,
            parameter_types,
            dynamic_dispatch,
        });
        (ty, collect(parts))
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Three, || match &self.kind {
            ExpressionKind::Identifier { variable, .. } => match variable.get() {
                Some(variable) => self.check_variable_read(variable),
                None => Vec::new(),
            },
            ExpressionKind::MemberAccess {
                object, resolved, ..
            } => {
                let mut parts = vec![object.phase3()];
                if let (Some(variable), Some(member)) = (object.as_variable(), resolved.get()) {
                    if variable.kind == VariableKind::ConstructedObject
                        && self.context.ephemeral_state(&EffectSubject::Member(member.name.clone()))
                            != EphemeralState::Initialized
                    {
                        parts.push(vec![Diagnostic::new(
                            DiagnosticKind::UninitializedMemberRead {
                                member: member.name.clone(),
                            },
                            self.span,
                        )]);
                    }
                }
                collect(parts)
            }
            ExpressionKind::NotNullAssertion(inner) => inner.phase3(),
            ExpressionKind::Invocation(invocation) => {
                let mut parts: Vec<Vec<Diagnostic>> =
                    invocation.all_arguments().iter().map(|a| a.phase3()).collect();
                if let Some(target) = invocation.target.get() {
                    parts.push(check_captures(&invocation.all_arguments(), &target.function));
                }
                collect(parts)
            }
            ExpressionKind::If(if_expr) => {
                let mut parts = vec![if_expr.condition.phase3(), if_expr.then_branch.phase3()];
                if let Some(else_branch) = &if_expr.else_branch {
                    parts.push(else_branch.phase3());
                }
                collect(parts)
            }
            ExpressionKind::Try(try_expr) => collect([try_expr.body.phase3(), try_expr.catch_body.phase3()]),
            _ => Vec::new(),
        })
    }

    fn check_variable_read(&self, variable: &BoundVariable) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if matches!(variable.kind, VariableKind::Local | VariableKind::CatchVariable) {
            match self.context.ephemeral_state(&EffectSubject::Variable(variable.id)) {
                EphemeralState::Initialized => {}
                EphemeralState::PartiallyInitialized => diagnostics.push(Diagnostic::new(
                    DiagnosticKind::VariableMaybeNotInitialized {
                        name: variable.name.clone(),
                    },
                    self.span,
                )),
                EphemeralState::Uninitialized => diagnostics.push(Diagnostic::new(
                    DiagnosticKind::VariableNotInitialized {
                        name: variable.name.clone(),
                    },
                    self.span,
                )),
            }
        }
        if self.context.ephemeral_state(&EffectSubject::LifetimeEnded(variable.id)) != EphemeralState::Uninitialized {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::UseAfterLifetimeEnded {
                    name: variable.name.clone(),
                },
                self.span,
            ));
        }
        diagnostics
    }
}

/// A borrowed parameter may not be handed to a parameter that keeps a
/// reference.
fn check_captures(arguments: &[&BoundExpression], function: &BoundFunction) -> Vec<Diagnostic> {
    arguments
        .iter()
        .zip(&function.parameters)
        .filter(|(_, parameter)| parameter.ownership != VariableOwnership::Borrowed)
        .filter_map(|(argument, _)| {
            let variable = borrowed_reference(argument)?;
            Some(Diagnostic::new(
                DiagnosticKind::BorrowedValueCaptured {
                    name: variable.name.clone(),
                },
                argument.span,
            ))
        })
        .collect()
}

/// The variable `expression` names, if it is a borrowed parameter of a
/// reference-counted type.
pub(crate) fn borrowed_reference(expression: &BoundExpression) -> Option<Rc<BoundVariable>> {
    let variable = expression.as_variable()?;
    let borrowed = variable.is_parameter() && variable.ownership == VariableOwnership::Borrowed;
    let counted = variable.ty().is_some_and(|t| !t.is_value_type());
    (borrowed && counted).then_some(variable)
}
