#![forbid(unsafe_code)]

//! Selection of one function out of a set of same-name, same-arity overloads.

use std::collections::BTreeMap;
use std::rc::Rc;

use ember_ast::{NumberBase, Span};

use crate::binder::BoundFunction;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::types::{BaseType, BoundType, IntegerKind, TypeParameter, TypeUnification};

/// What is known about an argument when overloads are compared. Integer
/// literals adapt to the parameter they are passed to.
#[derive(Clone, Debug)]
pub(crate) enum ArgumentType {
    Typed(BoundType),
    IntegerLiteral { value: i128, base: NumberBase },
}

#[derive(Clone)]
pub(crate) struct Candidate {
    pub function: Rc<BoundFunction>,
    /// Parameters solved by unification; their uses in the types below are
    /// type variables.
    pub type_parameters: Vec<Rc<TypeParameter>>,
    pub parameter_types: Vec<BoundType>,
    pub return_type: Option<BoundType>,
}

pub(crate) struct Evaluation {
    pub candidate: Candidate,
    pub unification: TypeUnification,
    pub error_positions: Vec<usize>,
}

impl Evaluation {
    fn is_legal(&self) -> bool {
        !self.unification.has_errors()
    }
}

pub(crate) struct OverloadQuery<'a> {
    pub name: &'a str,
    pub arguments: &'a [ArgumentType],
    pub argument_spans: &'a [Span],
    pub explicit_type_arguments: &'a [BoundType],
    pub expected_return: Option<&'a BoundType>,
    pub span: Span,
    /// Type of an integer literal that has nothing to adapt to.
    pub default_integer: BoundType,
}

pub(crate) fn literal_out_of_range(
    value: i128,
    base: &BaseType,
    kind: IntegerKind,
    span: Span,
) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::IntegerLiteralOutOfRange {
            value: value.to_string(),
            ty: base.simple_name.clone(),
            min: kind.min().to_string(),
            max: kind.max().to_string(),
        },
        span,
    )
}

fn evaluate(candidate: Candidate, query: &OverloadQuery<'_>) -> Evaluation {
    let mut unification = TypeUnification::new();
    let mut error_positions = Vec::new();

    if !query.explicit_type_arguments.is_empty() {
        let expected = candidate.type_parameters.len();
        let found = query.explicit_type_arguments.len();
        if expected != found {
            let kind = if found > expected {
                DiagnosticKind::SuperfluousTypeArguments {
                    ty: candidate.function.name.clone(),
                    expected,
                    found,
                }
            } else {
                DiagnosticKind::MissingTypeArguments {
                    ty: candidate.function.name.clone(),
                    expected,
                    found,
                }
            };
            unification = unification.plus_diagnostic(Diagnostic::new(kind, query.span));
        }
        for (parameter, argument) in candidate
            .type_parameters
            .iter()
            .zip(query.explicit_type_arguments)
        {
            if let Some(bound) = parameter.resolved_bound() {
                let before = unification.diagnostic_count();
                unification = bound.unify(argument, query.span, unification);
                unification = unification.decorate_since(before, |d| {
                    Diagnostic::new(
                        DiagnosticKind::TypeArgumentOutOfBounds {
                            parameter: parameter.name.clone(),
                            bound: bound.to_string(),
                            argument: argument.to_string(),
                        },
                        d.span,
                    )
                });
            }
            unification = unification.plus_binding(parameter.id, argument.clone());
        }
    }

    // The expected return type only seeds bindings; a mismatch there is
    // reported by whoever expected it.
    if let (Some(expected), Some(declared)) = (query.expected_return, &candidate.return_type) {
        if declared.contains_type_variables() {
            let before = unification.diagnostic_count();
            unification = expected.unify(declared, query.span, unification);
            unification = unification.truncate_diagnostics(before);
        }
    }

    for (position, argument) in query.arguments.iter().enumerate() {
        let Some(parameter) = candidate.parameter_types.get(position) else {
            continue;
        };
        let span = query
            .argument_spans
            .get(position)
            .copied()
            .unwrap_or(query.span);
        let before = unification.diagnostic_count();
        unification = match argument {
            ArgumentType::Typed(ty) => parameter.unify(ty, span, unification),
            ArgumentType::IntegerLiteral { value, base } => {
                unify_literal(parameter, *value, *base, span, &query.default_integer, unification)
            }
        };
        if unification.diagnostic_count() > before {
            error_positions.push(position);
        }
    }

    Evaluation {
        candidate,
        unification,
        error_positions,
    }
}

fn unify_literal(
    parameter: &BoundType,
    value: i128,
    base: NumberBase,
    span: Span,
    default_integer: &BoundType,
    carry: TypeUnification,
) -> TypeUnification {
    let target = parameter.instantiate_partially(&carry).non_nullable();
    if let Some(base_type) = target.base() {
        if let Some(kind) = base_type.integer_kind() {
            return match kind.accept_literal(value, base) {
                Some(_) => carry,
                None => carry.plus_diagnostic(literal_out_of_range(value, base_type, kind, span)),
            };
        }
    }
    parameter.unify(default_integer, span, carry)
}

/// Parameter positions where every two candidates declare disjoint types.
fn disjoint_positions(candidates: &[&Candidate]) -> Vec<usize> {
    let arity = candidates
        .iter()
        .map(|c| c.parameter_types.len())
        .min()
        .unwrap_or(0);
    (0..arity)
        .filter(|&position| {
            candidates.iter().enumerate().all(|(i, a)| {
                candidates[i + 1..].iter().all(|b| {
                    a.parameter_types[position].is_disjoint_with(&b.parameter_types[position])
                })
            })
        })
        .collect()
}

/// Picks the candidate to bind the invocation to. `None` only when there
/// are no candidates; otherwise a best-effort choice is returned even when
/// diagnostics are.
pub(crate) fn resolve_overload(
    candidates: Vec<Candidate>,
    query: &OverloadQuery<'_>,
) -> (Option<Evaluation>, Vec<Diagnostic>) {
    let candidate_count = candidates.len();
    let mut evaluations: Vec<Evaluation> = candidates
        .into_iter()
        .map(|candidate| evaluate(candidate, query))
        .collect();
    let legal: Vec<usize> = (0..evaluations.len())
        .filter(|&i| evaluations[i].is_legal())
        .collect();

    tracing::debug!(
        name = query.name,
        candidates = candidate_count,
        legal = legal.len(),
        "resolving overload"
    );

    match legal.as_slice() {
        [] if evaluations.is_empty() => (None, Vec::new()),
        [only] => {
            let chosen = evaluations.swap_remove(*only);
            (Some(chosen), Vec::new())
        }
        [] if evaluations.len() == 1 => {
            let chosen = evaluations.swap_remove(0);
            let diagnostics = chosen.unification.diagnostics().to_vec();
            (Some(chosen), diagnostics)
        }
        [] => {
            let candidates: Vec<&Candidate> = evaluations.iter().map(|e| &e.candidate).collect();
            let disjoint = disjoint_positions(&candidates);
            let narrowed: Vec<usize> = (0..evaluations.len())
                .filter(|&i| {
                    !evaluations[i]
                        .error_positions
                        .iter()
                        .any(|p| disjoint.contains(p))
                })
                .collect();
            if let [only] = narrowed.as_slice() {
                let chosen = evaluations.swap_remove(*only);
                let diagnostics = chosen.unification.diagnostics().to_vec();
                return (Some(chosen), diagnostics);
            }
            tracing::debug!(name = query.name, "no overload matches; falling back to the first");
            let diagnostic = Diagnostic::new(
                DiagnosticKind::NoMatchingOverload {
                    name: query.name.to_string(),
                    candidates: candidate_count,
                },
                query.span,
            );
            (Some(evaluations.swap_remove(0)), vec![diagnostic])
        }
        several => {
            if let Some(chosen) = retry_with_default_integers(&evaluations, several, query) {
                return (Some(evaluations.swap_remove(chosen)), Vec::new());
            }
            let diagnostic = Diagnostic::new(
                DiagnosticKind::AmbiguousInvocation {
                    name: query.name.to_string(),
                    candidates: several.len(),
                },
                query.span,
            );
            (Some(evaluations.swap_remove(several[0])), vec![diagnostic])
        }
    }
}

/// `f(1)` with overloads for `S8` and `S32`: integer literals that fit
/// several candidates prefer the one taking the default integer type.
fn retry_with_default_integers(
    evaluations: &[Evaluation],
    legal: &[usize],
    query: &OverloadQuery<'_>,
) -> Option<usize> {
    if !query
        .arguments
        .iter()
        .any(|a| matches!(a, ArgumentType::IntegerLiteral { .. }))
    {
        return None;
    }
    let typed: Vec<ArgumentType> = query
        .arguments
        .iter()
        .map(|a| match a {
            ArgumentType::IntegerLiteral { .. } => ArgumentType::Typed(query.default_integer.clone()),
            typed => typed.clone(),
        })
        .collect();
    let retry = OverloadQuery {
        name: query.name,
        arguments: &typed,
        argument_spans: query.argument_spans,
        explicit_type_arguments: query.explicit_type_arguments,
        expected_return: query.expected_return,
        span: query.span,
        default_integer: query.default_integer.clone(),
    };
    let still_legal: Vec<usize> = legal
        .iter()
        .copied()
        .filter(|&i| evaluate(evaluations[i].candidate.clone(), &retry).is_legal())
        .collect();
    match still_legal.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

/// An overload set with more than one member needs a parameter position at
/// which all members are pairwise disjoint, or calls could not tell them
/// apart. Reports at most one diagnostic per set.
pub(crate) fn check_overload_set(functions: &[Rc<BoundFunction>]) -> Option<Diagnostic> {
    let [first, ..] = functions else {
        return None;
    };
    if functions.len() < 2 {
        return None;
    }
    let candidates: Vec<Candidate> = functions
        .iter()
        .map(|f| Candidate {
            function: f.clone(),
            type_parameters: Vec::new(),
            parameter_types: f.parameter_types(),
            return_type: None,
        })
        .collect();
    let refs: Vec<&Candidate> = candidates.iter().collect();
    if !disjoint_positions(&refs).is_empty() {
        return None;
    }
    Some(Diagnostic::new(
        DiagnosticKind::OverloadSetNotDisjoint {
            name: first.name.clone(),
            arity: first.parameter_count(),
        },
        functions[1].span,
    ))
}

/// Groups `functions` into overload sets by name and arity and checks each.
pub(crate) fn check_overload_sets<'f>(functions: impl IntoIterator<Item = &'f Rc<BoundFunction>>) -> Vec<Diagnostic> {
    let mut sets: BTreeMap<(String, usize), Vec<Rc<BoundFunction>>> = BTreeMap::new();
    for function in functions {
        sets.entry((function.name.clone(), function.parameter_count()))
            .or_default()
            .push(function.clone());
    }
    sets.values().filter_map(|set| check_overload_set(set)).collect()
}
