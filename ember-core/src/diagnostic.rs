#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt;

use ember_ast::Span;
use miette::LabeledSpan;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn display(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Error)]
pub enum DiagnosticKind {
    // structural
    #[error("`{name}` is already declared in this scope")]
    DuplicateDeclaration { name: String },
    #[error("cannot resolve type `{name}`")]
    UnresolvedType { name: String },
    #[error("unknown identifier `{name}`")]
    UnresolvedVariable { name: String },
    #[error("nothing named `{symbol}` in package `{package}`")]
    UnresolvedImport { package: String, symbol: String },
    #[error("modifiers `{first}` and `{second}` cannot be combined")]
    ConflictingModifiers { first: String, second: String },
    #[error("function `{function}` must have a body")]
    MissingFunctionBody { function: String },
    #[error("function `{function}` must not have a body")]
    UnexpectedFunctionBody { function: String },
    #[error("parameter `{parameter}` needs a declared type")]
    MissingParameterType { parameter: String },
    #[error("cannot infer a type for `{variable}`; declare one or add an initializer")]
    CannotInferVariableType { variable: String },
    #[error("`{ty}` is not an interface; classes may only implement interfaces")]
    SupertypeNotAnInterface { ty: String },
    #[error("`break` outside of a loop")]
    BreakOutsideLoop,
    #[error("`continue` outside of a loop")]
    ContinueOutsideLoop,

    // types
    #[error("a value of type `{source_type}` cannot be assigned to `{target_type}`: {reason}")]
    NotAssignable {
        source_type: String,
        target_type: String,
        reason: String,
    },
    #[error("integer literal {value} is out of range for type `{ty}` ({min}..={max})")]
    IntegerLiteralOutOfRange {
        value: String,
        ty: String,
        min: String,
        max: String,
    },
    #[error("`{ty}` expects {expected} type argument(s), {found} given")]
    MissingTypeArguments {
        ty: String,
        expected: usize,
        found: usize,
    },
    #[error("`{ty}` expects {expected} type argument(s), {found} given")]
    SuperfluousTypeArguments {
        ty: String,
        expected: usize,
        found: usize,
    },
    #[error("type argument `{argument}` for `{parameter}` is not within its bound `{bound}`")]
    TypeArgumentOutOfBounds {
        parameter: String,
        bound: String,
        argument: String,
    },
    #[error("no function `{name}` taking {arity} parameter(s) is in scope")]
    UnresolvableFunction { name: String, arity: usize },
    #[error("none of the {candidates} overloads of `{name}` matches the arguments")]
    NoMatchingOverload { name: String, candidates: usize },
    #[error("invocation of `{name}` is ambiguous between {candidates} overloads")]
    AmbiguousInvocation { name: String, candidates: usize },
    #[error("overloads of `{name}` with {arity} parameter(s) have no parameter whose types are disjoint")]
    OverloadSetNotDisjoint { name: String, arity: usize },
    #[error("type `{ty}` has no member `{member}`")]
    UnknownMember { ty: String, member: String },
    #[error("`{ty}` is nullable; use `?.` or `!!`")]
    UnsafeNullableAccess { ty: String },
    #[error("the type of `{subject}` depends on itself and cannot be inferred")]
    CyclicTypeInference { subject: String },
    #[error("function `{function}` does not return a value on every path")]
    MissingReturn { function: String },
    #[error("unreachable code")]
    UnreachableCode,

    // effects and ownership
    #[error("`{function}` is declared {declared} but {reason}")]
    PurityViolation {
        function: String,
        declared: String,
        reason: String,
    },
    #[error("`{function}` is declared nothrow but {reason}")]
    NothrowViolation { function: String, reason: String },
    #[error("`{function}` widens the ownership of parameter `{parameter}` from {base} to {overriding}")]
    OverrideWidensOwnership {
        function: String,
        parameter: String,
        base: String,
        overriding: String,
    },
    #[error("class `{class}` does not implement `{function}`")]
    AbstractFunctionNotImplemented { class: String, function: String },
    #[error("`{function}` is marked override but overrides nothing")]
    OverridesNothing { function: String },
    #[error("`{function}` overrides a supertype function and must be marked override")]
    MissingOverrideModifier { function: String },
    #[error("member variable `{member}` is not initialized during construction")]
    MemberNotInitialized { member: String },
    #[error("`{name}` is not initialized here")]
    VariableNotInitialized { name: String },
    #[error("`{name}` is possibly not initialized here")]
    VariableMaybeNotInitialized { name: String },
    #[error("member variable `{member}` is read before it is initialized")]
    UninitializedMemberRead { member: String },
    #[error("`{name}` is a val and cannot be reassigned")]
    ValReassignment { name: String },
    #[error("cannot assign to `{member}` through a {mutability} reference")]
    MutationThroughReadOnly { member: String, mutability: String },
    #[error("borrowed value `{name}` cannot be captured")]
    BorrowedValueCaptured { name: String },
    #[error("`{name}` was handed off as an exclusive reference and can no longer be used")]
    UseAfterLifetimeEnded { name: String },
}

impl DiagnosticKind {
    pub fn default_severity(&self) -> Severity {
        match self {
            DiagnosticKind::UnreachableCode => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DiagnosticKind::DuplicateDeclaration { .. } => "ember::sema::duplicate_declaration",
            DiagnosticKind::UnresolvedType { .. } => "ember::sema::unresolved_type",
            DiagnosticKind::UnresolvedVariable { .. } => "ember::sema::unresolved_variable",
            DiagnosticKind::UnresolvedImport { .. } => "ember::sema::unresolved_import",
            DiagnosticKind::ConflictingModifiers { .. } => "ember::sema::conflicting_modifiers",
            DiagnosticKind::MissingFunctionBody { .. } => "ember::sema::missing_body",
            DiagnosticKind::UnexpectedFunctionBody { .. } => "ember::sema::unexpected_body",
            DiagnosticKind::MissingParameterType { .. } => "ember::sema::missing_parameter_type",
            DiagnosticKind::CannotInferVariableType { .. } => "ember::sema::cannot_infer_type",
            DiagnosticKind::SupertypeNotAnInterface { .. } => "ember::sema::illegal_supertype",
            DiagnosticKind::BreakOutsideLoop => "ember::sema::break_outside_loop",
            DiagnosticKind::ContinueOutsideLoop => "ember::sema::continue_outside_loop",
            DiagnosticKind::NotAssignable { .. } => "ember::types::not_assignable",
            DiagnosticKind::IntegerLiteralOutOfRange { .. } => "ember::types::literal_out_of_range",
            DiagnosticKind::MissingTypeArguments { .. } => "ember::types::missing_type_arguments",
            DiagnosticKind::SuperfluousTypeArguments { .. } => {
                "ember::types::superfluous_type_arguments"
            }
            DiagnosticKind::TypeArgumentOutOfBounds { .. } => "ember::types::argument_out_of_bounds",
            DiagnosticKind::UnresolvableFunction { .. } => "ember::overload::unresolvable",
            DiagnosticKind::NoMatchingOverload { .. } => "ember::overload::no_match",
            DiagnosticKind::AmbiguousInvocation { .. } => "ember::overload::ambiguous",
            DiagnosticKind::OverloadSetNotDisjoint { .. } => "ember::overload::not_disjoint",
            DiagnosticKind::UnknownMember { .. } => "ember::types::unknown_member",
            DiagnosticKind::UnsafeNullableAccess { .. } => "ember::types::unsafe_nullable_access",
            DiagnosticKind::CyclicTypeInference { .. } => "ember::types::cyclic_inference",
            DiagnosticKind::MissingReturn { .. } => "ember::flow::missing_return",
            DiagnosticKind::UnreachableCode => "ember::flow::unreachable",
            DiagnosticKind::PurityViolation { .. } => "ember::effects::purity",
            DiagnosticKind::NothrowViolation { .. } => "ember::effects::nothrow",
            DiagnosticKind::OverrideWidensOwnership { .. } => "ember::ownership::override_widens",
            DiagnosticKind::AbstractFunctionNotImplemented { .. } => {
                "ember::class::abstract_not_implemented"
            }
            DiagnosticKind::OverridesNothing { .. } => "ember::class::overrides_nothing",
            DiagnosticKind::MissingOverrideModifier { .. } => "ember::class::missing_override",
            DiagnosticKind::MemberNotInitialized { .. } => "ember::class::member_not_initialized",
            DiagnosticKind::VariableNotInitialized { .. }
            | DiagnosticKind::VariableMaybeNotInitialized { .. } => "ember::flow::uninitialized_read",
            DiagnosticKind::UninitializedMemberRead { .. } => "ember::class::uninitialized_member_read",
            DiagnosticKind::ValReassignment { .. } => "ember::ownership::val_reassignment",
            DiagnosticKind::MutationThroughReadOnly { .. } => "ember::ownership::readonly_mutation",
            DiagnosticKind::BorrowedValueCaptured { .. } => "ember::ownership::borrowed_captured",
            DiagnosticKind::UseAfterLifetimeEnded { .. } => "ember::ownership::lifetime_ended",
        }
    }
}

/// A finding about the analyzed program. Equality is structural so the same
/// problem reported along two paths collapses into one entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Error)]
#[error("{kind}")]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub span: Span,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, span: Span) -> Self {
        Self {
            severity: kind.default_severity(),
            kind,
            span,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl miette::Diagnostic for Diagnostic {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.kind.code()))
    }

    fn severity(&self) -> Option<miette::Severity> {
        Some(match self.severity {
            Severity::Info => miette::Severity::Advice,
            Severity::Warning => miette::Severity::Warning,
            Severity::Error => miette::Severity::Error,
        })
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        Some(Box::new(std::iter::once(LabeledSpan::new_with_span(
            None, self.span,
        ))))
    }
}

/// Ordered, de-duplicating collection of diagnostics.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    seen: HashSet<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        if self.seen.insert(diagnostic.clone()) {
            self.items.push(diagnostic);
        }
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for d in diagnostics {
            self.push(d);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        let mut out = Diagnostics::new();
        out.extend(iter);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structurally_equal_diagnostics_collapse() {
        let kind = DiagnosticKind::UnresolvedVariable {
            name: "x".to_string(),
        };
        let mut all = Diagnostics::new();
        all.push(Diagnostic::new(kind.clone(), ember_ast::span(3, 1)));
        all.push(Diagnostic::new(kind.clone(), ember_ast::span(3, 1)));
        all.push(Diagnostic::new(kind, ember_ast::span(9, 1)));
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn unreachable_code_is_a_warning() {
        let d = Diagnostic::new(DiagnosticKind::UnreachableCode, ember_ast::span(0, 1));
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.to_string(), "unreachable code");
    }
}
