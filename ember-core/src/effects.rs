#![forbid(unsafe_code)]

//! Purity and nothrow checks on function bodies.
//!
//! A function is `pure` (no reads or writes of global state, calls only
//! pure functions), `readonly` (may read global state) or modifying. Writes
//! to the object under construction and to exclusively held objects do not
//! count as modifications: nobody else can observe them.

use std::fmt;
use std::rc::Rc;

use ember_ast::Span;

use crate::binder::{
    AssignmentTarget, BoundCodeChunk, BoundExpression, BoundFunction, ExpressionKind, FunctionBody,
    MemberInitialization, StatementKind, VariableKind,
};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::types::Mutability;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Purity {
    Pure,
    ReadOnly,
    Modifying,
}

impl Purity {
    pub fn keyword(self) -> &'static str {
        match self {
            Purity::Pure => "pure",
            Purity::ReadOnly => "readonly",
            Purity::Modifying => "mutable",
        }
    }
}

impl fmt::Display for Purity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

struct EffectWalker<'f> {
    function: &'f BoundFunction,
    declared: Purity,
    nothrow: bool,
    fill_stack_trace: Rc<BoundFunction>,
    /// Number of enclosing `try` bodies; exceptions inside are caught.
    try_depth: usize,
    diagnostics: Vec<Diagnostic>,
}

impl EffectWalker<'_> {
    fn requires(&mut self, needed: Purity, reason: String, span: Span) {
        if needed > self.declared {
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::PurityViolation {
                    function: self.function.name.clone(),
                    declared: self.declared.keyword().to_string(),
                    reason,
                },
                span,
            ));
        }
    }

    fn may_throw(&mut self, reason: String, span: Span) {
        if self.nothrow && self.try_depth == 0 {
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::NothrowViolation {
                    function: self.function.name.clone(),
                    reason,
                },
                span,
            ));
        }
    }

    fn chunk(&mut self, chunk: &BoundCodeChunk) {
        for statement in &chunk.statements {
            match &statement.kind {
                StatementKind::Variable { initializer, .. } => {
                    if let Some(initializer) = initializer {
                        self.expression(initializer);
                    }
                }
                StatementKind::Assignment { target, value } => {
                    self.expression(value);
                    self.assignment(target, statement.span);
                }
                StatementKind::Return(value) => {
                    if let Some(value) = value {
                        self.expression(value);
                    }
                }
                StatementKind::Throw(value) => {
                    self.expression(value);
                    self.may_throw("it throws".to_string(), statement.span);
                }
                StatementKind::While { condition, body } => {
                    self.expression(condition);
                    self.chunk(body);
                }
                StatementKind::Expression(expression) => self.expression(expression),
                StatementKind::Break | StatementKind::Continue => {}
            }
        }
    }

    fn assignment(&mut self, target: &AssignmentTarget, span: Span) {
        match target {
            AssignmentTarget::Variable { variable, name, .. } => {
                if variable.get().is_some_and(|v| v.kind == VariableKind::Global) {
                    self.requires(Purity::Modifying, format!("it writes global variable `{name}`"), span);
                }
            }
            AssignmentTarget::Member { object, member, .. } => {
                self.expression(object);
                let constructing = object
                    .as_variable()
                    .is_some_and(|v| v.kind == VariableKind::ConstructedObject);
                let exclusive = object.ty().mutability() == Mutability::Exclusive;
                if !constructing && !exclusive {
                    self.requires(Purity::Modifying, format!("it assigns member `{member}`"), span);
                }
            }
        }
    }

    fn expression(&mut self, expression: &BoundExpression) {
        match &expression.kind {
            ExpressionKind::Identifier { variable, name } => {
                if variable.get().is_some_and(|v| v.kind == VariableKind::Global) {
                    self.requires(
                        Purity::ReadOnly,
                        format!("it reads global variable `{name}`"),
                        expression.span,
                    );
                }
            }
            ExpressionKind::MemberAccess { object, .. } => self.expression(object),
            ExpressionKind::NotNullAssertion(inner) => self.expression(inner),
            ExpressionKind::Invocation(invocation) => {
                for argument in invocation.all_arguments() {
                    self.expression(argument);
                }
                let Some(target) = invocation.target.get() else {
                    return;
                };
                let callee = &target.function;
                if Rc::ptr_eq(callee, &self.fill_stack_trace) {
                    return;
                }
                let purity = callee.declared_purity();
                self.requires(
                    purity,
                    format!("it calls `{}` which is {purity}", callee.name),
                    expression.span,
                );
                if !callee.is_nothrow() {
                    self.may_throw(format!("it calls `{}` which may throw", callee.name), expression.span);
                }
            }
            ExpressionKind::If(if_expr) => {
                self.expression(&if_expr.condition);
                self.chunk(&if_expr.then_branch);
                if let Some(else_branch) = &if_expr.else_branch {
                    self.chunk(else_branch);
                }
            }
            ExpressionKind::Try(try_expr) => {
                self.try_depth += 1;
                self.chunk(&try_expr.body);
                self.try_depth -= 1;
                self.chunk(&try_expr.catch_body);
            }
            ExpressionKind::IntegerLiteral { .. }
            | ExpressionKind::BooleanLiteral(_)
            | ExpressionKind::StringLiteral(_)
            | ExpressionKind::NullLiteral => {}
        }
    }
}

/// Checks the body of `function` (and for constructors the member
/// initializers) against its declared purity and nothrow modifier.
pub(crate) fn check_function(function: &BoundFunction) -> Vec<Diagnostic> {
    let core = function.context().core_types();
    let mut walker = EffectWalker {
        function,
        declared: function.declared_purity(),
        nothrow: function.is_nothrow(),
        fill_stack_trace: core.fill_stack_trace.clone(),
        try_depth: 0,
        diagnostics: Vec::new(),
    };
    if function.is_constructor() {
        if let Some(class) = function.class() {
            for member in &class.members {
                if let MemberInitialization::Expression(expression) = &member.initializer {
                    walker.expression(expression);
                }
            }
        }
    }
    match &function.body {
        Some(FunctionBody::Block(chunk)) => walker.chunk(chunk),
        Some(FunctionBody::SingleExpression(expression)) => walker.expression(expression),
        None => {}
    }
    walker.diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purity_is_ordered_by_permissiveness() {
        assert!(Purity::Pure < Purity::ReadOnly);
        assert!(Purity::ReadOnly < Purity::Modifying);
        assert_eq!(Purity::Modifying.to_string(), "mutable");
    }
}
