#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use ember_ast::{
    self as ast, Expr, FunctionDecl, Modifier, ModifierKind, ParameterDecl, Span,
    TypeParameterDecl, TypeRef, VariableOwnership,
};
use ember_ir::IrFunction;

use super::class::BoundClass;
use super::expression::BoundExpression;
use super::statement::BoundCodeChunk;
use super::variable::{BoundVariable, VariableKind};
use super::{Phase, PhaseMemo, ReentrancyGuard, collect};
use crate::context::{Context, EffectSubject, ScopeKind, SideEffect};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::effects::{self, Purity};
use crate::types::{BaseType, BoundType, Mutability, TypeParameter, TypeUnification};

pub enum FunctionKind {
    TopLevel,
    /// Declared in the body of a class or interface.
    Member { owner: Rc<BaseType> },
    Constructor { class: Weak<BoundClass> },
    Destructor { class: Weak<BoundClass> },
}

pub enum FunctionBody {
    Block(BoundCodeChunk),
    SingleExpression(BoundExpression),
}

pub struct BoundFunction {
    pub name: String,
    pub span: Span,
    pub canonical_name: String,
    pub kind: FunctionKind,
    context: Rc<Context>,
    pub type_parameters: Vec<Rc<TypeParameter>>,
    type_parameter_decls: Vec<TypeParameterDecl>,
    pub parameters: Vec<Rc<BoundVariable>>,
    parameter_decls: Vec<ParameterDecl>,
    default_values: Vec<Option<BoundExpression>>,
    modifiers: Vec<Modifier>,
    return_type_ref: Option<TypeRef>,
    declared_return: OnceCell<Option<BoundType>>,
    inferred_return: OnceCell<BoundType>,
    /// `self` of a constructor: the object under construction.
    pub constructed_object: Option<Rc<BoundVariable>>,
    pub body: Option<FunctionBody>,
    nothrow: OnceCell<bool>,
    return_inference: ReentrancyGuard,
    throw_analysis: ReentrancyGuard,
    phases: PhaseMemo,
    ir: OnceCell<Arc<IrFunction>>,
}

fn has_modifier(modifiers: &[Modifier], kind: &ModifierKind) -> bool {
    modifiers.iter().any(|m| &m.kind == kind)
}

fn modifier_keyword(kind: &ModifierKind) -> String {
    match kind {
        ModifierKind::Pure => "pure".to_string(),
        ModifierKind::ReadOnly => "readonly".to_string(),
        ModifierKind::Mutable => "mut".to_string(),
        ModifierKind::Nothrow => "nothrow".to_string(),
        ModifierKind::External { ffi } => format!("external({ffi})"),
        ModifierKind::Intrinsic => "intrinsic".to_string(),
        ModifierKind::Override => "override".to_string(),
        ModifierKind::Operator => "operator".to_string(),
        ModifierKind::Export => "export".to_string(),
    }
}

const CONFLICTING_MODIFIERS: [(&str, &str); 4] = [
    ("pure", "readonly"),
    ("pure", "mut"),
    ("readonly", "mut"),
    ("intrinsic", "external"),
];

/// Rank of an ownership on the borrowed < captured < exclusive scale used
/// for override checks.
pub(crate) fn ownership_rank(ownership: VariableOwnership) -> u8 {
    match ownership {
        VariableOwnership::Borrowed => 0,
        VariableOwnership::Captured => 1,
        VariableOwnership::Exclusive => 2,
    }
}

pub(crate) fn ownership_name(ownership: VariableOwnership) -> &'static str {
    match ownership {
        VariableOwnership::Borrowed => "borrowed",
        VariableOwnership::Captured => "captured",
        VariableOwnership::Exclusive => "exclusive",
    }
}

impl BoundFunction {
    /// Binds a declared function. `parent` is the context of the enclosing
    /// source file or type body.
    pub fn bind(parent: &Rc<Context>, decl: &FunctionDecl, kind: FunctionKind, canonical_name: String) -> Self {
        let context = parent.derive_scope(ScopeKind::FunctionRoot {
            return_type: OnceCell::new(),
            constructor: false,
        });
        let body = decl.body.as_ref().map(|body| match body {
            ast::FunctionBody::Block(chunk) => {
                FunctionBody::Block(BoundCodeChunk::bind(chunk, &context, ScopeKind::Block))
            }
            ast::FunctionBody::SingleExpression(expr) => {
                let continuation = context.derive_continuation();
                FunctionBody::SingleExpression(BoundExpression::bind(expr, &context, &continuation))
            }
        });
        Self::assemble(
            context,
            decl.name.node.clone(),
            decl.span,
            canonical_name,
            kind,
            &decl.type_parameters,
            decl.parameters.clone(),
            decl.modifiers.clone(),
            decl.return_type.clone(),
            body,
            None,
        )
    }

    /// The constructor of a class. `parameters` are the members initialized
    /// from constructor arguments.
    pub fn bind_constructor(
        parent: &Rc<Context>,
        class: Weak<BoundClass>,
        canonical_class_name: &str,
        span: Span,
        parameters: Vec<ParameterDecl>,
        modifiers: Vec<Modifier>,
        body: Option<&ast::CodeChunk>,
    ) -> Self {
        let context = parent.derive_scope(ScopeKind::FunctionRoot {
            return_type: OnceCell::new(),
            constructor: true,
        });
        let constructed_object = Rc::new(BoundVariable::new(
            "self".to_string(),
            span,
            VariableKind::ConstructedObject,
            VariableOwnership::Exclusive,
            false,
            true,
        ));
        context.add_variable(constructed_object.clone());
        context.track_side_effect(SideEffect::Reached(EffectSubject::Variable(constructed_object.id)));
        let empty = ast::CodeChunk {
            span,
            stmts: Vec::new(),
        };
        let chunk = BoundCodeChunk::bind(body.unwrap_or(&empty), &context, ScopeKind::Block);
        Self::assemble(
            context,
            "constructor".to_string(),
            span,
            format!("{canonical_class_name}.__constructor"),
            FunctionKind::Constructor { class },
            &[],
            parameters,
            modifiers,
            None,
            Some(FunctionBody::Block(chunk)),
            Some(constructed_object),
        )
    }

    pub fn bind_destructor(
        parent: &Rc<Context>,
        class: Weak<BoundClass>,
        canonical_class_name: &str,
        span: Span,
        body: Option<&ast::CodeChunk>,
    ) -> Self {
        let context = parent.derive_scope(ScopeKind::FunctionRoot {
            return_type: OnceCell::new(),
            constructor: false,
        });
        let empty = ast::CodeChunk {
            span,
            stmts: Vec::new(),
        };
        let chunk = BoundCodeChunk::bind(body.unwrap_or(&empty), &context, ScopeKind::Block);
        let receiver = ParameterDecl {
            span,
            name: ast::Spanned::new(span, "self".to_string()),
            ownership: None,
            declared_type: None,
            default_value: None,
            reassignable: false,
        };
        Self::assemble(
            context,
            "destructor".to_string(),
            span,
            format!("{canonical_class_name}.__destructor"),
            FunctionKind::Destructor { class },
            &[],
            vec![receiver],
            vec![Modifier {
                span,
                kind: ModifierKind::Nothrow,
            }],
            None,
            Some(FunctionBody::Block(chunk)),
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        context: Rc<Context>,
        name: String,
        span: Span,
        canonical_name: String,
        kind: FunctionKind,
        type_parameter_decls: &[TypeParameterDecl],
        parameter_decls: Vec<ParameterDecl>,
        modifiers: Vec<Modifier>,
        return_type_ref: Option<TypeRef>,
        body: Option<FunctionBody>,
        constructed_object: Option<Rc<BoundVariable>>,
    ) -> Self {
        let type_parameters: Vec<Rc<TypeParameter>> = type_parameter_decls
            .iter()
            .map(|p| Rc::new(TypeParameter::new(p.name.node.clone(), p.variance, p.span)))
            .collect();
        for parameter in &type_parameters {
            context.add_type_parameter(parameter.clone());
        }

        let default_ownership = match kind {
            FunctionKind::Constructor { .. } => VariableOwnership::Captured,
            _ => VariableOwnership::Borrowed,
        };
        let parameters = parameter_decls
            .iter()
            .map(|p| {
                Rc::new(BoundVariable::new(
                    p.name.node.clone(),
                    p.name.span,
                    VariableKind::Parameter,
                    p.ownership.unwrap_or(default_ownership),
                    p.reassignable,
                    true,
                ))
            })
            .collect();
        let default_values = parameter_decls
            .iter()
            .map(|p| {
                p.default_value.as_ref().map(|value: &Expr| {
                    let continuation = context.derive_continuation();
                    BoundExpression::bind(value, &context, &continuation)
                })
            })
            .collect();

        let function = Self {
            name,
            span,
            canonical_name,
            kind,
            context,
            type_parameters,
            type_parameter_decls: type_parameter_decls.to_vec(),
            parameters,
            parameter_decls,
            default_values,
            modifiers,
            return_type_ref,
            declared_return: OnceCell::new(),
            inferred_return: OnceCell::new(),
            constructed_object,
            body,
            nothrow: OnceCell::new(),
            return_inference: ReentrancyGuard::default(),
            throw_analysis: ReentrancyGuard::default(),
            phases: PhaseMemo::default(),
            ir: OnceCell::new(),
        };
        let nothrow = function.has(&ModifierKind::Nothrow) || function.is_external();
        function.set_nothrow(nothrow);
        function
    }

    fn has(&self, kind: &ModifierKind) -> bool {
        has_modifier(&self.modifiers, kind)
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.context
    }

    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Types of the parameters as declared; stand-ins before phase 1 ran.
    pub fn parameter_types(&self) -> Vec<BoundType> {
        self.parameters
            .iter()
            .map(|p| match p.ty() {
                Some(ty) => ty.clone(),
                None => BoundType::Unresolved {
                    name: p.name.clone(),
                    standin: Box::new(self.context.core_types().any_nullable()),
                },
            })
            .collect()
    }

    /// Called as `receiver.name(...)`: the first parameter is named `self`.
    pub fn is_receiver_bearing(&self) -> bool {
        self.parameter_decls
            .first()
            .is_some_and(|p| p.name.node == "self")
    }

    pub fn is_external(&self) -> bool {
        self.modifiers
            .iter()
            .any(|m| matches!(m.kind, ModifierKind::External { .. }))
    }

    pub fn is_intrinsic(&self) -> bool {
        self.has(&ModifierKind::Intrinsic)
    }

    pub fn is_override(&self) -> bool {
        self.has(&ModifierKind::Override)
    }

    pub fn is_constructor(&self) -> bool {
        matches!(self.kind, FunctionKind::Constructor { .. })
    }

    /// Declared in an interface without a body.
    pub fn is_abstract(&self) -> bool {
        self.body.is_none() && matches!(&self.kind, FunctionKind::Member { owner } if owner.interface().is_some())
    }

    pub fn set_nothrow(&self, nothrow: bool) {
        if self.nothrow.set(nothrow).is_err() {
            ice!("nothrow of {} set twice", self.canonical_name);
        }
    }

    pub fn is_nothrow(&self) -> bool {
        self.nothrow.get().copied().unwrap_or(false)
    }

    pub fn declared_purity(&self) -> Purity {
        if self.has(&ModifierKind::Pure) {
            Purity::Pure
        } else if self.has(&ModifierKind::ReadOnly) {
            Purity::ReadOnly
        } else if self.has(&ModifierKind::Mutable) {
            Purity::Modifying
        } else if self.is_constructor() {
            Purity::Pure
        } else {
            Purity::Modifying
        }
    }

    /// The return type as spelled out (or implied); `None` when it must be
    /// inferred from a single-expression body.
    pub fn declared_return_type(&self) -> Option<BoundType> {
        self.declared_return.get().cloned().flatten()
    }

    pub fn class(&self) -> Option<Rc<BoundClass>> {
        match &self.kind {
            FunctionKind::Constructor { class } | FunctionKind::Destructor { class } => class.upgrade(),
            FunctionKind::Member { owner } => owner.class(),
            FunctionKind::TopLevel => None,
        }
    }

    /// The return type, inferring it from the body where needed. Inference
    /// may run into the function itself through the call graph; that is
    /// reported and answered with a stand-in.
    pub fn return_type(&self) -> (BoundType, Option<Diagnostic>) {
        if let Some(declared) = self.declared_return_type() {
            return (declared, None);
        }
        if let Some(inferred) = self.inferred_return.get() {
            return (inferred.clone(), None);
        }
        let core = self.context.core_types();
        let Some(FunctionBody::SingleExpression(expression)) = &self.body else {
            return (core.unit_type(), None);
        };
        let Some(_token) = self.return_inference.enter() else {
            tracing::debug!(function = %self.canonical_name, "cyclic return type inference");
            let standin = BoundType::Unresolved {
                name: self.name.clone(),
                standin: Box::new(core.any_nullable()),
            };
            let diagnostic = Diagnostic::new(
                DiagnosticKind::CyclicTypeInference {
                    subject: self.name.clone(),
                },
                self.span,
            );
            return (standin, Some(diagnostic));
        };
        expression.phase1();
        let _ = expression.phase2();
        let inferred = expression.ty();
        if self.inferred_return.set(inferred.clone()).is_err() {
            ice!("return type of {} inferred twice", self.canonical_name);
        }
        self.context.set_return_type(inferred.clone());
        (inferred, None)
    }

    /// Whether every invocation ends in an exception. Consults only what is
    /// already resolved; answers `false` on re-entry.
    pub fn is_guaranteed_to_throw(&self) -> bool {
        let Some(_token) = self.throw_analysis.enter() else {
            return false;
        };
        if self.declared_return_type().is_some_and(|t| t.is_nothing()) {
            return true;
        }
        match &self.body {
            Some(FunctionBody::Block(chunk)) => chunk.always_throws(),
            Some(FunctionBody::SingleExpression(_)) => {
                self.inferred_return.get().is_some_and(BoundType::is_nothing)
            }
            None => false,
        }
    }

    /// `canonical(T1,T2)`; distinguishes overloads in the IR.
    pub fn symbol(&self) -> String {
        let parameters: Vec<String> = self.parameter_types().iter().map(ToString::to_string).collect();
        format!("{}({})", self.canonical_name, parameters.join(","))
    }

    fn receiver_type(&self) -> Option<BoundType> {
        let mutability = if self.has(&ModifierKind::Mutable) {
            Mutability::Mutable
        } else {
            Mutability::ReadOnly
        };
        match &self.kind {
            FunctionKind::Member { owner } => Some(owner.self_type(mutability)),
            FunctionKind::Destructor { class } => class
                .upgrade()
                .map(|c| c.base_type.self_type(Mutability::Mutable)),
            _ => None,
        }
    }

    fn check_modifiers(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let keywords: Vec<String> = self.modifiers.iter().map(|m| modifier_keyword(&m.kind)).collect();
        let present = |k: &str| keywords.iter().any(|w| w == k || w.starts_with(&format!("{k}(")));
        for (first, second) in CONFLICTING_MODIFIERS {
            if present(first) && present(second) {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::ConflictingModifiers {
                        first: first.to_string(),
                        second: second.to_string(),
                    },
                    self.span,
                ));
            }
        }

        let declared_only = self.is_external() || self.is_intrinsic();
        let may_be_abstract = matches!(&self.kind, FunctionKind::Member { owner } if owner.interface().is_some());
        match (&self.body, declared_only) {
            (Some(_), true) => diagnostics.push(Diagnostic::new(
                DiagnosticKind::UnexpectedFunctionBody {
                    function: self.name.clone(),
                },
                self.span,
            )),
            (None, false) if !may_be_abstract => diagnostics.push(Diagnostic::new(
                DiagnosticKind::MissingFunctionBody {
                    function: self.name.clone(),
                },
                self.span,
            )),
            _ => {}
        }
        diagnostics
    }

    fn resolve_signature(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let core = self.context.core_types();

        for (parameter, decl) in self.type_parameters.iter().zip(&self.type_parameter_decls) {
            let bound = match &decl.bound {
                Some(bound) => {
                    let (ty, found) = self.context.resolve_type(bound);
                    diagnostics.extend(found);
                    ty
                }
                None => core.any_nullable(),
            };
            parameter.set_bound(bound);
        }

        for (index, (parameter, decl)) in self.parameters.iter().zip(&self.parameter_decls).enumerate() {
            if self.context.resolve_variable(&parameter.name, true).is_some() {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::DuplicateDeclaration {
                        name: parameter.name.clone(),
                    },
                    parameter.span,
                ));
            }
            let receiver = if index == 0 && decl.name.node == "self" {
                self.receiver_type()
            } else {
                None
            };
            let ty = match (&decl.declared_type, receiver) {
                (Some(declared), _) => {
                    let (ty, found) = self.context.resolve_type(declared);
                    diagnostics.extend(found);
                    ty
                }
                (None, Some(receiver)) => receiver,
                (None, None) => {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::MissingParameterType {
                            parameter: parameter.name.clone(),
                        },
                        decl.span,
                    ));
                    BoundType::Unresolved {
                        name: parameter.name.clone(),
                        standin: Box::new(core.any_nullable()),
                    }
                }
            };
            parameter.set_type(ty);
            self.context.add_variable(parameter.clone());
            self.context
                .track_side_effect(SideEffect::Reached(EffectSubject::Variable(parameter.id)));
        }

        let declared = match (&self.kind, &self.return_type_ref, &self.body) {
            (FunctionKind::Constructor { class }, _, _) => Some(match class.upgrade() {
                Some(class) => class.base_type.self_type(Mutability::Exclusive),
                None => ice!("constructor outlived its class"),
            }),
            (_, Some(reference), _) => {
                let (ty, found) = self.context.resolve_type(reference);
                diagnostics.extend(found);
                Some(ty)
            }
            (_, None, Some(FunctionBody::SingleExpression(_))) => None,
            (_, None, _) => Some(core.unit_type()),
        };
        if let Some(declared) = &declared {
            self.context.set_return_type(declared.clone());
            if let Some(object) = &self.constructed_object {
                object.set_type(declared.clone());
            }
        }
        if self.declared_return.set(declared).is_err() {
            ice!("return type of {} resolved twice", self.canonical_name);
        }
        diagnostics
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::One, || {
            let mut parts = vec![self.check_modifiers(), self.resolve_signature()];
            for value in self.default_values.iter().flatten() {
                parts.push(value.phase1());
            }
            match &self.body {
                Some(FunctionBody::Block(chunk)) => parts.push(chunk.phase1()),
                Some(FunctionBody::SingleExpression(expression)) => parts.push(expression.phase1()),
                None => {}
            }
            collect(parts)
        })
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || {
            let mut parts = Vec::new();
            let (_, cyclic) = self.return_type();
            parts.push(cyclic.into_iter().collect());

            for (parameter, value) in self.parameters.iter().zip(&self.default_values) {
                let (Some(value), Some(ty)) = (value, parameter.ty()) else {
                    continue;
                };
                value.set_expected_type(ty.clone());
                parts.push(value.phase2());
                let unification = ty.unify(&value.ty(), value.span, TypeUnification::new());
                parts.push(unification.into_diagnostics());
            }

            match (&self.body, self.declared_return_type()) {
                (Some(FunctionBody::Block(chunk)), _) => parts.push(chunk.phase2()),
                (Some(FunctionBody::SingleExpression(expression)), Some(declared)) => {
                    expression.set_expected_type(declared.clone());
                    parts.push(expression.phase2());
                    let unification = declared.unify(&expression.ty(), expression.span, TypeUnification::new());
                    parts.push(unification.into_diagnostics());
                }
                (Some(FunctionBody::SingleExpression(expression)), None) => parts.push(expression.phase2()),
                (None, _) => {}
            }
            collect(parts)
        })
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Three, || {
            let mut parts = Vec::new();
            for value in self.default_values.iter().flatten() {
                parts.push(value.phase3());
            }
            match &self.body {
                Some(FunctionBody::Block(chunk)) => {
                    parts.push(chunk.phase3());
                    parts.push(self.check_returns(chunk));
                }
                Some(FunctionBody::SingleExpression(expression)) => parts.push(expression.phase3()),
                None => {}
            }
            parts.push(effects::check_function(self));
            collect(parts)
        })
    }

    fn check_returns(&self, chunk: &BoundCodeChunk) -> Vec<Diagnostic> {
        let Some(declared) = self.declared_return_type() else {
            return Vec::new();
        };
        let needs_value = !declared.is_unresolved()
            && !self.is_constructor()
            && declared
                .base()
                .is_none_or(|b| !b.same_as(&self.context.core_types().unit));
        if needs_value && !chunk.terminates() {
            return vec![Diagnostic::new(
                DiagnosticKind::MissingReturn {
                    function: self.name.clone(),
                },
                self.span,
            )];
        }
        Vec::new()
    }

    pub fn is_analyzed(&self) -> bool {
        self.phases.is_done(Phase::Three)
    }

    /// The lowered form; computed once and shared afterwards.
    pub fn to_backend_ir(&self) -> Arc<IrFunction> {
        self.ir
            .get_or_init(|| Arc::new(crate::lower::lower_function(self)))
            .clone()
    }
}
