#![forbid(unsafe_code)]

use std::cell::{OnceCell, RefCell};
use std::rc::Rc;

use ember_ast::{self as ast, Span, Stmt, TypeRef, VariableOwnership};

use super::class::BoundMemberVariable;
use super::expression::{BoundExpression, ExpressionKind, borrowed_reference};
use super::variable::{BoundVariable, VariableKind};
use super::{Phase, PhaseMemo, collect};
use crate::context::{Context, DeferredCode, EffectSubject, EphemeralState, ScopeKind, SideEffect};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::types::{BoundType, TypeUnification};

/// A sequence of statements with its own scope.
pub struct BoundCodeChunk {
    pub span: Span,
    scope: Rc<Context>,
    pub statements: Vec<BoundStatement>,
    final_context: Rc<Context>,
    expected_result: RefCell<Option<BoundType>>,
    phases: PhaseMemo,
}

pub struct BoundStatement {
    pub span: Span,
    context: Rc<Context>,
    continuation: Rc<Context>,
    pub kind: StatementKind,
    phases: PhaseMemo,
}

pub enum StatementKind {
    Variable {
        variable: Rc<BoundVariable>,
        declared_type: Option<TypeRef>,
        initializer: Option<BoundExpression>,
    },
    Assignment {
        target: AssignmentTarget,
        value: BoundExpression,
    },
    Return(Option<BoundExpression>),
    Throw(BoundExpression),
    While {
        condition: BoundExpression,
        body: BoundCodeChunk,
    },
    Break,
    Continue,
    Expression(BoundExpression),
}

pub enum AssignmentTarget {
    Variable {
        name: String,
        span: Span,
        variable: OnceCell<Rc<BoundVariable>>,
    },
    Member {
        object: BoundExpression,
        member: String,
        resolved: OnceCell<Rc<BoundMemberVariable>>,
    },
}

impl BoundCodeChunk {
    pub fn bind(chunk: &ast::CodeChunk, parent: &Rc<Context>, kind: ScopeKind) -> Self {
        let scope = parent.derive_scope(kind);
        let mut current = scope.clone();
        let mut statements = Vec::with_capacity(chunk.stmts.len());
        for stmt in &chunk.stmts {
            let statement = BoundStatement::bind(stmt, &current);
            current = statement.continuation.clone();
            statements.push(statement);
        }
        Self {
            span: chunk.span,
            scope,
            statements,
            final_context: current,
            expected_result: RefCell::new(None),
            phases: PhaseMemo::default(),
        }
    }

    pub fn scope(&self) -> &Rc<Context> {
        &self.scope
    }

    /// The context after the last statement.
    pub fn final_context(&self) -> Rc<Context> {
        self.final_context.clone()
    }

    /// The trailing expression statement; it is the chunk's value when the
    /// chunk is a branch of an `if` or `try`.
    pub fn result_expression(&self) -> Option<&BoundExpression> {
        match self.statements.last().map(|s| &s.kind) {
            Some(StatementKind::Expression(expression)) => Some(expression),
            _ => None,
        }
    }

    pub fn set_expected_result(&self, ty: BoundType) {
        *self.expected_result.borrow_mut() = Some(ty);
    }

    /// Whether control never reaches the end of the chunk. Meaningful after
    /// phase 2.
    pub fn terminates(&self) -> bool {
        self.statements.iter().any(BoundStatement::terminates)
    }

    /// Whether the chunk ends in an exception on every path, judged from its
    /// `throw` statements alone.
    pub fn always_throws(&self) -> bool {
        self.statements
            .iter()
            .find(|s| s.terminates_syntactically())
            .is_some_and(BoundStatement::always_throws)
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases
            .run(Phase::One, || collect(self.statements.iter().map(|s| s.phase1())))
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || {
            if let (Some(expected), Some(result)) = (self.expected_result.borrow().clone(), self.result_expression()) {
                result.set_expected_type(expected);
            }
            let mut parts: Vec<Vec<Diagnostic>> = self.statements.iter().map(|s| s.phase2()).collect();
            let first_terminating = self.statements.iter().position(BoundStatement::terminates);
            if let Some(unreachable) = first_terminating.and_then(|i| self.statements.get(i + 1)) {
                parts.push(vec![Diagnostic::new(DiagnosticKind::UnreachableCode, unreachable.span)]);
            }
            collect(parts)
        })
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases
            .run(Phase::Three, || collect(self.statements.iter().map(|s| s.phase3())))
    }
}

fn expression_always_throws(expression: &BoundExpression) -> bool {
    match &expression.kind {
        ExpressionKind::If(if_expr) => if_expr
            .else_branch
            .as_ref()
            .is_some_and(|e| e.always_throws() && if_expr.then_branch.always_throws()),
        ExpressionKind::Try(try_expr) => try_expr.body.always_throws() && try_expr.catch_body.always_throws(),
        _ => false,
    }
}

impl BoundStatement {
    fn bind(stmt: &Stmt, context: &Rc<Context>) -> Self {
        let continuation = context.derive_continuation();
        let expression = |e: &ast::Expr| BoundExpression::bind(e, context, &continuation);
        let kind = match stmt {
            Stmt::Variable(decl) => {
                let variable = Rc::new(BoundVariable::new(
                    decl.name.node.clone(),
                    decl.name.span,
                    VariableKind::Local,
                    decl.ownership.unwrap_or(VariableOwnership::Captured),
                    decl.reassignable,
                    decl.initializer.is_some(),
                ));
                let initializer = decl.initializer.as_ref().map(expression);
                continuation.add_variable(variable.clone());
                continuation.add_deferred_code(DeferredCode::DropVariable(variable.clone()));
                StatementKind::Variable {
                    variable,
                    declared_type: decl.declared_type.clone(),
                    initializer,
                }
            }
            Stmt::Assignment(assignment) => StatementKind::Assignment {
                target: match &assignment.target {
                    ast::AssignmentTarget::Variable(name) => AssignmentTarget::Variable {
                        name: name.node.clone(),
                        span: name.span,
                        variable: OnceCell::new(),
                    },
                    ast::AssignmentTarget::Member { object, member } => AssignmentTarget::Member {
                        object: expression(object),
                        member: member.node.clone(),
                        resolved: OnceCell::new(),
                    },
                },
                value: expression(&assignment.value),
            },
            Stmt::Return(ret) => StatementKind::Return(ret.value.as_ref().map(expression)),
            Stmt::Throw(throw) => StatementKind::Throw(expression(&throw.value)),
            Stmt::While(while_stmt) => StatementKind::While {
                condition: expression(&while_stmt.condition),
                body: BoundCodeChunk::bind(&while_stmt.body, context, ScopeKind::Loop),
            },
            Stmt::Break(_) => StatementKind::Break,
            Stmt::Continue(_) => StatementKind::Continue,
            Stmt::Expr(expr) => StatementKind::Expression(expression(expr)),
        };
        Self {
            span: stmt.span(),
            context: context.clone(),
            continuation,
            kind,
            phases: PhaseMemo::default(),
        }
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.context
    }

    pub fn continuation(&self) -> &Rc<Context> {
        &self.continuation
    }

    fn terminates_syntactically(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Return(_) | StatementKind::Throw(_) | StatementKind::Break | StatementKind::Continue
        )
    }

    fn always_throws(&self) -> bool {
        match &self.kind {
            StatementKind::Throw(_) => true,
            StatementKind::Expression(expression) => expression_always_throws(expression),
            _ => false,
        }
    }

    pub fn terminates(&self) -> bool {
        if self.terminates_syntactically() {
            return true;
        }
        let nothing = |e: &BoundExpression| e.ty().is_nothing();
        match &self.kind {
            StatementKind::Expression(expression) => nothing(expression),
            StatementKind::Variable {
                initializer: Some(initializer),
                ..
            } => nothing(initializer),
            StatementKind::Assignment { value, .. } => nothing(value),
            StatementKind::While { condition, .. } => nothing(condition),
            _ => false,
        }
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::One, || match &self.kind {
            StatementKind::Variable {
                variable,
                declared_type,
                initializer,
            } => self.declare_variable(variable, declared_type.as_ref(), initializer.as_ref()),
            StatementKind::Assignment { target, value } => {
                let mut parts = vec![value.phase1()];
                if let AssignmentTarget::Member { object, .. } = target {
                    parts.push(object.phase1());
                }
                collect(parts)
            }
            StatementKind::Return(value) => value.as_ref().map(|v| v.phase1()).unwrap_or_default(),
            StatementKind::Throw(value) | StatementKind::Expression(value) => value.phase1(),
            StatementKind::While { condition, body } => collect([condition.phase1(), body.phase1()]),
            StatementKind::Break if !self.context.is_within_loop() => {
                vec![Diagnostic::new(DiagnosticKind::BreakOutsideLoop, self.span)]
            }
            StatementKind::Continue if !self.context.is_within_loop() => {
                vec![Diagnostic::new(DiagnosticKind::ContinueOutsideLoop, self.span)]
            }
            StatementKind::Break | StatementKind::Continue => Vec::new(),
        })
    }

    fn declare_variable(
        &self,
        variable: &BoundVariable,
        declared_type: Option<&TypeRef>,
        initializer: Option<&BoundExpression>,
    ) -> Vec<Diagnostic> {
        let mut parts = Vec::new();
        if let Some(initializer) = initializer {
            parts.push(initializer.phase1());
        }
        if self.context.resolve_variable(&variable.name, true).is_some() {
            parts.push(vec![Diagnostic::new(
                DiagnosticKind::DuplicateDeclaration {
                    name: variable.name.clone(),
                },
                variable.span,
            )]);
        }
        match (declared_type, initializer) {
            (Some(reference), _) => {
                let (ty, found) = self.context.resolve_type(reference);
                parts.push(found);
                variable.set_type(ty);
            }
            (None, None) => {
                parts.push(vec![Diagnostic::new(
                    DiagnosticKind::CannotInferVariableType {
                        variable: variable.name.clone(),
                    },
                    variable.span,
                )]);
                variable.set_type(BoundType::Unresolved {
                    name: variable.name.clone(),
                    standin: Box::new(self.context.core_types().any_nullable()),
                });
            }
            (None, Some(_)) => {}
        }
        collect(parts)
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || match &self.kind {
            StatementKind::Variable {
                variable,
                initializer,
                ..
            } => {
                let Some(initializer) = initializer else {
                    return Vec::new();
                };
                let diagnostics = assign_checked(variable.ty(), initializer);
                if variable.ty().is_none() {
                    variable.set_type(initializer.ty());
                }
                self.continuation
                    .track_side_effect(SideEffect::Reached(EffectSubject::Variable(variable.id)));
                diagnostics
            }
            StatementKind::Assignment { target, value } => self.infer_assignment(target, value),
            StatementKind::Return(value) => {
                let expected = self.context.return_type();
                match value {
                    Some(value) => assign_checked(expected.as_ref(), value),
                    None => {
                        let core = self.context.core_types();
                        match expected {
                            Some(expected) => expected
                                .unify(&core.unit_type(), self.span, TypeUnification::new())
                                .into_diagnostics(),
                            None => Vec::new(),
                        }
                    }
                }
            }
            StatementKind::Throw(value) => {
                let throwable = self.context.core_types().throwable_type();
                assign_checked(Some(&throwable), value)
            }
            StatementKind::While { condition, body } => {
                let bool_type = self.context.core_types().bool_type();
                let diagnostics = collect([assign_checked(Some(&bool_type), condition), body.phase2()]);
                // The body may run any number of times, including none.
                self.continuation
                    .track_side_effect(SideEffect::Merge(vec![self.context.clone(), body.final_context()]));
                diagnostics
            }
            StatementKind::Expression(expression) => expression.phase2(),
            StatementKind::Break | StatementKind::Continue => Vec::new(),
        })
    }

    fn infer_assignment(&self, target: &AssignmentTarget, value: &BoundExpression) -> Vec<Diagnostic> {
        match target {
            AssignmentTarget::Variable { name, span, variable } => {
                let Some(found) = self.context.resolve_variable(name, false) else {
                    let mut diagnostics = value.phase2();
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::UnresolvedVariable { name: name.clone() },
                        *span,
                    ));
                    return diagnostics;
                };
                let mut diagnostics = Vec::new();
                let first_initialization = found.kind == VariableKind::Local
                    && !found.has_initializer
                    && self.context.ephemeral_state(&EffectSubject::Variable(found.id))
                        == EphemeralState::Uninitialized;
                if !found.reassignable && !first_initialization {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::ValReassignment { name: name.clone() },
                        *span,
                    ));
                }
                found.record_assignment();
                diagnostics.extend(assign_checked(found.ty(), value));
                self.continuation
                    .track_side_effect(SideEffect::Reached(EffectSubject::Variable(found.id)));
                let _ = variable.set(found);
                diagnostics
            }
            AssignmentTarget::Member {
                object,
                member,
                resolved,
            } => {
                let mut diagnostics = object.phase2();
                let object_type = object.ty();
                if object_type.is_unresolved() {
                    diagnostics.extend(value.phase2());
                    return diagnostics;
                }
                let viewed = object_type.non_nullable().effective_upper_bound();
                let found = viewed
                    .base()
                    .and_then(|b| Some((b.clone(), b.class()?.member(member)?)));
                let Some((base, variable)) = found else {
                    diagnostics.extend(value.phase2());
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::UnknownMember {
                            ty: object_type.to_string(),
                            member: member.clone(),
                        },
                        object.span,
                    ));
                    return diagnostics;
                };
                if object_type.is_nullable() {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::UnsafeNullableAccess {
                            ty: object_type.to_string(),
                        },
                        object.span,
                    ));
                }
                let constructing = is_constructed_object(object);
                let subject = EffectSubject::Member(member.clone());
                let first_initialization =
                    constructing && self.context.ephemeral_state(&subject) == EphemeralState::Uninitialized;
                if !variable.reassignable && !first_initialization {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::ValReassignment { name: member.clone() },
                        self.span,
                    ));
                }
                let declared = variable
                    .ty(&self.context)
                    .substitute_arguments(&base.type_parameters, viewed.arguments());
                diagnostics.extend(assign_checked(Some(&declared), value));
                if constructing {
                    self.continuation.track_side_effect(SideEffect::Reached(subject));
                }
                let _ = resolved.set(variable);
                diagnostics
            }
        }
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Three, || match &self.kind {
            StatementKind::Variable { initializer, .. } => {
                initializer.as_ref().map(|i| i.phase3()).unwrap_or_default()
            }
            StatementKind::Assignment { target, value } => {
                let mut parts = vec![value.phase3()];
                match target {
                    AssignmentTarget::Variable { variable, .. } => {
                        if variable.get().is_some_and(|v| v.kind == VariableKind::Global) {
                            parts.push(captured(value));
                        }
                    }
                    AssignmentTarget::Member { object, member, .. } => {
                        parts.push(object.phase3());
                        parts.push(captured(value));
                        let mutability = object.ty().mutability();
                        if !is_constructed_object(object) && !mutability.allows_mutation() {
                            parts.push(vec![Diagnostic::new(
                                DiagnosticKind::MutationThroughReadOnly {
                                    member: member.clone(),
                                    mutability: mutability.keyword().to_string(),
                                },
                                self.span,
                            )]);
                        }
                    }
                }
                collect(parts)
            }
            StatementKind::Return(value) => value.as_ref().map(|v| v.phase3()).unwrap_or_default(),
            StatementKind::Throw(value) | StatementKind::Expression(value) => value.phase3(),
            StatementKind::While { condition, body } => collect([condition.phase3(), body.phase3()]),
            StatementKind::Break | StatementKind::Continue => Vec::new(),
        })
    }
}

/// Phase 2 of `value` with `target` as its expected type, then the
/// assignability check.
fn assign_checked(target: Option<&BoundType>, value: &BoundExpression) -> Vec<Diagnostic> {
    let Some(target) = target else {
        return value.phase2();
    };
    value.set_expected_type(target.clone());
    let mut diagnostics = value.phase2();
    diagnostics.extend(
        target
            .unify(&value.ty(), value.span, TypeUnification::new())
            .into_diagnostics(),
    );
    diagnostics
}

fn is_constructed_object(expression: &BoundExpression) -> bool {
    expression
        .as_variable()
        .is_some_and(|v| v.kind == VariableKind::ConstructedObject)
}

/// Storing a borrowed parameter somewhere that outlives the call.
fn captured(value: &BoundExpression) -> Vec<Diagnostic> {
    borrowed_reference(value)
        .map(|variable| {
            vec![Diagnostic::new(
                DiagnosticKind::BorrowedValueCaptured {
                    name: variable.name.clone(),
                },
                value.span,
            )]
        })
        .unwrap_or_default()
}
