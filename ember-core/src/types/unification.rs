#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::rc::Rc;

use ember_ast::{Span, Variance};

use super::{BoundType, BoundTypeArgument, Mutability, TypeParameter};
use crate::diagnostic::{Diagnostic, DiagnosticKind};

/// Solved type variables plus the diagnostics found while solving them.
///
/// Values are never modified in place; every operation hands back the next
/// unification.
#[derive(Clone, Debug, Default)]
pub struct TypeUnification {
    bindings: BTreeMap<u32, BoundType>,
    diagnostics: Vec<Diagnostic>,
}

impl TypeUnification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(&self, parameter_id: u32) -> Option<&BoundType> {
        self.bindings.get(&parameter_id)
    }

    pub fn plus_binding(mut self, parameter_id: u32, ty: BoundType) -> Self {
        self.bindings.insert(parameter_id, ty);
        self
    }

    pub fn plus_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        if !self.diagnostics.contains(&diagnostic) {
            self.diagnostics.push(diagnostic);
        }
        self
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn diagnostic_count(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Drops every diagnostic added after the first `count`.
    pub fn truncate_diagnostics(mut self, count: usize) -> Self {
        self.diagnostics.truncate(count);
        self
    }

    /// Rewrites the diagnostics added after the first `count`, e.g. to turn a
    /// generic "not assignable" into "type argument out of bounds".
    pub fn decorate_since(
        mut self,
        count: usize,
        decorate: impl Fn(Diagnostic) -> Diagnostic,
    ) -> Self {
        let tail: Vec<Diagnostic> = self.diagnostics.drain(count..).collect();
        for d in tail {
            self = self.plus_diagnostic(decorate(d));
        }
        self
    }
}

fn not_assignable(target: &BoundType, assignee: &BoundType, span: Span, reason: &str) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::NotAssignable {
            source_type: assignee.to_string(),
            target_type: target.to_string(),
            reason: reason.to_string(),
        },
        span,
    )
}

impl BoundType {
    /// Checks that a value of type `assignee` may be stored in a location of
    /// type `self`, solving type variables on either side along the way.
    pub fn unify(&self, assignee: &BoundType, span: Span, carry: TypeUnification) -> TypeUnification {
        use BoundType::*;

        match (self, assignee) {
            (Unresolved { standin, .. }, _) => {
                let count = carry.diagnostic_count();
                standin.unify(assignee, span, carry).truncate_diagnostics(count)
            }
            (_, Unresolved { standin, .. }) => {
                let count = carry.diagnostic_count();
                self.unify(standin, span, carry).truncate_diagnostics(count)
            }
            (Variable { parameter, mutability }, _) => {
                self.unify_variable_location(parameter, *mutability, assignee, span, carry)
            }
            (_, Variable { parameter, .. }) => match carry.binding(parameter.id).cloned() {
                Some(bound) => self.unify(&bound, span, carry),
                None => {
                    let count = carry.diagnostic_count();
                    let carry = parameter.bound().unify(self, span, carry);
                    if carry.diagnostic_count() > count {
                        return carry.decorate_since(count, |d| out_of_bounds(d, parameter, self));
                    }
                    carry.plus_binding(parameter.id, self.clone())
                }
            },
            (_, _) if assignee.is_nothing() => carry,
            (Nullable(target), Nullable(value)) => target.unify(value, span, carry),
            (Nullable(target), _) => target.unify(assignee, span, carry),
            (_, Nullable(value)) => {
                if value.is_nothing() {
                    carry.plus_diagnostic(not_assignable(self, assignee, span, "null is not allowed here"))
                } else {
                    carry.plus_diagnostic(not_assignable(self, assignee, span, "the value may be null"))
                }
            }
            (Argument { variance, ty, .. }, _) => match variance {
                Variance::Out => carry.plus_diagnostic(not_assignable(
                    self,
                    assignee,
                    span,
                    "an out-projected location accepts no values",
                )),
                Variance::In | Variance::Unspecified => ty.unify(assignee, span, carry),
            },
            (_, Argument { .. }) => self.unify(&assignee.effective_upper_bound(), span, carry),
            (
                Generic {
                    parameter: target_parameter,
                    ..
                },
                Generic {
                    parameter: value_parameter,
                    ..
                },
            ) if target_parameter.id == value_parameter.id => {
                self.unify_mutability(assignee, span, carry)
            }
            (Generic { .. }, _) => carry.plus_diagnostic(not_assignable(
                self,
                assignee,
                span,
                "only values of the type parameter itself can be assigned",
            )),
            (_, Generic { .. }) => self.unify(&assignee.effective_upper_bound(), span, carry),
            (
                Root {
                    base: target_base,
                    arguments: target_arguments,
                    ..
                },
                Root {
                    base: value_base,
                    arguments: value_arguments,
                    ..
                },
            ) => {
                let count = carry.diagnostic_count();
                let carry = self.unify_mutability(assignee, span, carry);
                if carry.diagnostic_count() > count {
                    return carry;
                }
                if target_base.is_top {
                    return carry;
                }
                let Some(viewed) = value_base.supertype_arguments(target_base, value_arguments) else {
                    let reason = format!("{} is not a subtype of {}", value_base.simple_name, target_base.simple_name);
                    return carry.plus_diagnostic(not_assignable(self, assignee, span, &reason));
                };
                let mut carry = carry;
                for (target_argument, value_argument) in target_arguments.iter().zip(viewed.iter()) {
                    carry = unify_argument(self, assignee, target_argument, value_argument, span, carry);
                }
                carry
            }
        }
    }

    fn unify_mutability(&self, assignee: &BoundType, span: Span, carry: TypeUnification) -> TypeUnification {
        let value = assignee.mutability();
        let target = self.mutability();
        if value.is_assignable_to(target) {
            carry
        } else {
            let reason = format!("a {value} reference cannot be used as {target}");
            carry.plus_diagnostic(not_assignable(self, assignee, span, &reason))
        }
    }

    fn unify_variable_location(
        &self,
        parameter: &Rc<TypeParameter>,
        mutability: Option<Mutability>,
        assignee: &BoundType,
        span: Span,
        carry: TypeUnification,
    ) -> TypeUnification {
        if let Some(required) = mutability {
            if !assignee.mutability().is_assignable_to(required) {
                let reason = format!("a {} reference cannot be used as {required}", assignee.mutability());
                return carry.plus_diagnostic(not_assignable(self, assignee, span, &reason));
            }
        }

        let solved = match carry.binding(parameter.id).cloned() {
            None => assignee.clone(),
            Some(bound) => {
                if bound.is_assignable_from(assignee) {
                    return carry;
                }
                if assignee.is_assignable_from(&bound) {
                    assignee.clone()
                } else {
                    match bound.closest_common_supertype_with(assignee, &parameter.bound()) {
                        Some(widened) => widened,
                        None => assignee.clone(),
                    }
                }
            }
        };

        let count = carry.diagnostic_count();
        let carry = parameter.bound().unify(&solved, span, carry);
        if carry.diagnostic_count() > count {
            return carry.decorate_since(count, |d| out_of_bounds(d, parameter, &solved));
        }
        carry.plus_binding(parameter.id, solved)
    }

    pub fn is_assignable_from(&self, assignee: &BoundType) -> bool {
        !self
            .unify(assignee, ember_ast::span(0, 0), TypeUnification::new())
            .has_errors()
    }

    /// The most specific type both `self` and `other` can be assigned to; used
    /// where control flow joins. `top` is the fallback when the two types share
    /// no base other than the top type (it provides the `Any` base).
    pub fn closest_common_supertype_with(&self, other: &BoundType, top: &BoundType) -> Option<BoundType> {
        use BoundType::*;

        match (self, other) {
            (Unresolved { .. }, _) => Some(other.clone()),
            (_, Unresolved { .. }) => Some(self.clone()),
            _ if self.is_nothing() => Some(other.clone()),
            _ if other.is_nothing() => Some(self.clone()),
            (Nullable(a), Nullable(b)) => a.closest_common_supertype_with(b, top).map(BoundType::nullable),
            (Nullable(a), b) => {
                if a.is_nothing() {
                    Some(b.clone().nullable())
                } else {
                    a.closest_common_supertype_with(b, top).map(BoundType::nullable)
                }
            }
            (a, Nullable(b)) => {
                if b.is_nothing() {
                    Some(a.clone().nullable())
                } else {
                    a.closest_common_supertype_with(b, top).map(BoundType::nullable)
                }
            }
            (Generic { parameter: a, .. }, Generic { parameter: b, .. }) if a.id == b.id => {
                let mutability = self.mutability().union(other.mutability());
                Some(self.with_mutability(mutability))
            }
            (Root { .. }, Root { .. }) => Some(common_root_supertype(self, other, top)),
            _ => {
                let a = self.effective_upper_bound();
                let b = other.effective_upper_bound();
                if matches!(a, Root { .. }) && matches!(b, Root { .. }) {
                    a.closest_common_supertype_with(&b, top)
                } else {
                    None
                }
            }
        }
    }
}

fn out_of_bounds(d: Diagnostic, parameter: &TypeParameter, argument: &BoundType) -> Diagnostic {
    match d.kind {
        DiagnosticKind::NotAssignable { .. } => Diagnostic::new(
            DiagnosticKind::TypeArgumentOutOfBounds {
                parameter: parameter.name.clone(),
                bound: parameter.bound().to_string(),
                argument: argument.to_string(),
            },
            d.span,
        ),
        _ => d,
    }
}

fn unify_argument(
    target: &BoundType,
    assignee: &BoundType,
    target_argument: &BoundTypeArgument,
    value_argument: &BoundTypeArgument,
    span: Span,
    carry: TypeUnification,
) -> TypeUnification {
    if let BoundType::Variable { parameter, .. } = &target_argument.ty {
        if carry.binding(parameter.id).is_none() && target_argument.variance == Variance::Unspecified {
            let solved = match value_argument.variance {
                Variance::Unspecified => value_argument.ty.clone(),
                variance => BoundType::argument(parameter.clone(), variance, value_argument.ty.clone()),
            };
            return carry.plus_binding(parameter.id, solved);
        }
    }

    let count = carry.diagnostic_count();
    match (target_argument.variance, value_argument.variance) {
        (Variance::Unspecified, Variance::Unspecified) => {
            let carry = target_argument.ty.unify(&value_argument.ty, span, carry);
            let carry = if carry.diagnostic_count() == count {
                value_argument.ty.unify(&target_argument.ty, span, carry)
            } else {
                carry
            };
            if carry.diagnostic_count() > count {
                let reason = format!(
                    "type argument {} must be exactly {}",
                    value_argument.ty, target_argument.ty
                );
                carry
                    .truncate_diagnostics(count)
                    .plus_diagnostic(not_assignable(target, assignee, span, &reason))
            } else {
                carry
            }
        }
        (Variance::Out, Variance::Out | Variance::Unspecified) => {
            target_argument.ty.unify(&value_argument.ty, span, carry)
        }
        (Variance::In, Variance::In | Variance::Unspecified) => {
            value_argument.ty.unify(&target_argument.ty, span, carry)
        }
        (target_variance, value_variance) => {
            let reason = format!(
                "variance mismatch: {} argument where {} is required",
                variance_name(value_variance),
                variance_name(target_variance)
            );
            carry.plus_diagnostic(not_assignable(target, assignee, span, &reason))
        }
    }
}

fn variance_name(variance: Variance) -> &'static str {
    match variance {
        Variance::In => "an in",
        Variance::Out => "an out",
        Variance::Unspecified => "an invariant",
    }
}

fn common_root_supertype(a: &BoundType, b: &BoundType, top: &BoundType) -> BoundType {
    let mutability = a.mutability().union(b.mutability());
    let a_m = a.with_mutability(mutability);
    let b_m = b.with_mutability(mutability);
    if a_m.is_assignable_from(&b_m) {
        return a_m;
    }
    if b_m.is_assignable_from(&a_m) {
        return b_m;
    }

    // Breadth-first over the supertypes of `a`, first hit wins.
    let mut queue: Vec<BoundType> = vec![a_m];
    let mut index = 0;
    while index < queue.len() {
        let current = queue[index].clone();
        index += 1;
        if current.is_assignable_from(&b_m) {
            return current;
        }
        if let BoundType::Root { base, arguments, .. } = &current {
            for supertype in base.supertypes() {
                queue.push(
                    supertype
                        .substitute_arguments(&base.type_parameters, arguments)
                        .with_mutability(mutability),
                );
            }
        }
    }
    top.with_mutability(mutability)
}

