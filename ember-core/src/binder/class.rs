#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::rc::Rc;
use std::sync::Arc;

use ember_ast::{
    ClassDecl, ClassMember, InterfaceDecl, MemberInitializer, ParameterDecl, PackageName, Span,
    TypeParameterDecl, TypeRef,
};
use ember_ir::{IrClass, IrInterface};

use super::expression::BoundExpression;
use super::function::{BoundFunction, FunctionBody, FunctionKind, ownership_name, ownership_rank};
use super::{Phase, PhaseMemo, collect};
use crate::context::{Context, ContextKind, EffectSubject, EphemeralState, ScopeKind, SideEffect};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::overload::check_overload_sets;
use crate::types::{BaseType, BaseTypeKind, BoundType, TypeDeclaration, TypeParameter, TypeUnification};

pub enum MemberInitialization {
    /// Must be assigned in the constructor body.
    None,
    ConstructorParameter,
    Expression(BoundExpression),
}

pub struct BoundMemberVariable {
    pub name: String,
    pub span: Span,
    pub reassignable: bool,
    ty: OnceCell<BoundType>,
    pub initializer: MemberInitialization,
}

impl BoundMemberVariable {
    /// The declared type; a stand-in before the owning class ran phase 1.
    pub fn ty(&self, context: &Rc<Context>) -> BoundType {
        match self.ty.get() {
            Some(ty) => ty.clone(),
            None => BoundType::Unresolved {
                name: self.name.clone(),
                standin: Box::new(context.core_types().any_nullable()),
            },
        }
    }

    pub fn resolved_type(&self) -> Option<&BoundType> {
        self.ty.get()
    }
}

fn bind_type_parameters(context: &Rc<Context>, decls: &[TypeParameterDecl]) -> Vec<Rc<TypeParameter>> {
    decls
        .iter()
        .map(|p| {
            let parameter = Rc::new(TypeParameter::new(p.name.node.clone(), p.variance, p.span));
            context.add_type_parameter(parameter.clone());
            parameter
        })
        .collect()
}

/// Resolves type parameter bounds and supertypes; only interfaces may be
/// supertypes. Runs for every type of the program before any phase, since
/// phase 1 of one type may look at the supertypes of another.
fn resolve_headers(
    context: &Rc<Context>,
    base_type: &BaseType,
    parameter_decls: &[TypeParameterDecl],
    supertypes: &[TypeRef],
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let core = context.core_types();
    for (parameter, decl) in base_type.type_parameters.iter().zip(parameter_decls) {
        let bound = match &decl.bound {
            Some(bound) => {
                let (ty, found) = context.resolve_type(bound);
                diagnostics.extend(found);
                ty
            }
            None => core.any_nullable(),
        };
        parameter.set_bound(bound);
    }

    let mut resolved = Vec::new();
    for reference in supertypes {
        let (ty, found) = context.resolve_type(reference);
        diagnostics.extend(found);
        match ty.base() {
            Some(base) if base.kind == BaseTypeKind::Class => {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::SupertypeNotAnInterface { ty: ty.to_string() },
                    reference.span,
                ));
            }
            Some(_) => resolved.push(ty),
            None => {}
        }
    }
    base_type.set_supertypes(resolved);
    diagnostics
}

/// Interfaces reachable through the supertypes of `base`, nearest first.
fn supertype_interfaces(base: &BaseType) -> Vec<Rc<BoundInterface>> {
    let mut out: Vec<Rc<BoundInterface>> = Vec::new();
    let mut queue: Vec<Rc<BaseType>> = base.supertypes().iter().filter_map(|t| t.base().cloned()).collect();
    while !queue.is_empty() {
        let next = queue.remove(0);
        if let Some(interface) = next.interface() {
            if out.iter().any(|i| i.base_type.same_as(&interface.base_type)) {
                continue;
            }
            queue.extend(next.supertypes().iter().filter_map(|t| t.base().cloned()));
            out.push(interface);
        }
    }
    out
}

pub struct BoundClass {
    pub base_type: Rc<BaseType>,
    context: Rc<Context>,
    /// Scope the member initializer expressions are bound in; they run as
    /// part of the constructor.
    initializer_context: Rc<Context>,
    type_parameter_decls: Vec<TypeParameterDecl>,
    supertype_refs: Vec<TypeRef>,
    member_decls: Vec<TypeRef>,
    pub members: Vec<Rc<BoundMemberVariable>>,
    pub constructor: Rc<BoundFunction>,
    pub destructor: Rc<BoundFunction>,
    pub member_functions: Vec<Rc<BoundFunction>>,
    structural: Vec<Diagnostic>,
    headers: OnceCell<Vec<Diagnostic>>,
    phases: PhaseMemo,
    ir: OnceCell<Arc<IrClass>>,
}

impl BoundClass {
    pub fn bind(file: &Rc<Context>, package: &PackageName, decl: &ClassDecl) -> Rc<Self> {
        let class = Rc::new_cyclic(|weak| {
            let context = file.derive(ContextKind::TypeBody);
            let type_parameters = bind_type_parameters(&context, &decl.type_parameters);
            let base_type = Rc::new(BaseType::new(
                package.child(&decl.name.node),
                decl.name.node.clone(),
                BaseTypeKind::Class,
                decl.name.span,
                type_parameters,
                None,
                false,
            ));
            let initializer_context = context.derive_scope(ScopeKind::FunctionRoot {
                return_type: OnceCell::new(),
                constructor: true,
            });

            let mut structural = Vec::new();
            let mut members = Vec::new();
            let mut member_decls = Vec::new();
            let mut constructor_parameters = Vec::new();
            let mut constructor_decl = None;
            let mut destructor_decl = None;
            let mut member_functions = Vec::new();
            for member in &decl.members {
                match member {
                    ClassMember::Variable(variable) => {
                        let initializer = match &variable.initializer {
                            MemberInitializer::None => MemberInitialization::None,
                            MemberInitializer::ConstructorParameter => {
                                constructor_parameters.push(ParameterDecl {
                                    span: variable.span,
                                    name: variable.name.clone(),
                                    ownership: None,
                                    declared_type: Some(variable.declared_type.clone()),
                                    default_value: None,
                                    reassignable: false,
                                });
                                MemberInitialization::ConstructorParameter
                            }
                            MemberInitializer::Expression(expr) => {
                                let continuation = initializer_context.derive_continuation();
                                MemberInitialization::Expression(BoundExpression::bind(
                                    expr,
                                    &initializer_context,
                                    &continuation,
                                ))
                            }
                        };
                        members.push(Rc::new(BoundMemberVariable {
                            name: variable.name.node.clone(),
                            span: variable.name.span,
                            reassignable: variable.reassignable,
                            ty: OnceCell::new(),
                            initializer,
                        }));
                        member_decls.push(variable.declared_type.clone());
                    }
                    ClassMember::Constructor(constructor) => {
                        if constructor_decl.replace(constructor).is_some() {
                            structural.push(Diagnostic::new(
                                DiagnosticKind::DuplicateDeclaration {
                                    name: "constructor".to_string(),
                                },
                                constructor.span,
                            ));
                        }
                    }
                    ClassMember::Destructor(destructor) => {
                        if destructor_decl.replace(destructor).is_some() {
                            structural.push(Diagnostic::new(
                                DiagnosticKind::DuplicateDeclaration {
                                    name: "destructor".to_string(),
                                },
                                destructor.span,
                            ));
                        }
                    }
                    ClassMember::Function(function) => {
                        member_functions.push(Rc::new(BoundFunction::bind(
                            &context,
                            function,
                            FunctionKind::Member {
                                owner: base_type.clone(),
                            },
                            format!("{}.{}", base_type.canonical_name, function.name.node),
                        )));
                    }
                }
            }

            let constructor = Rc::new(BoundFunction::bind_constructor(
                &context,
                weak.clone(),
                &base_type.canonical_name,
                constructor_decl.map_or(decl.span, |c| c.span),
                constructor_parameters,
                constructor_decl.map(|c| c.modifiers.clone()).unwrap_or_default(),
                constructor_decl.map(|c| &c.body),
            ));
            for member in &members {
                if !matches!(member.initializer, MemberInitialization::None) {
                    constructor
                        .context()
                        .track_side_effect(SideEffect::Reached(EffectSubject::Member(member.name.clone())));
                }
            }
            let destructor = Rc::new(BoundFunction::bind_destructor(
                &context,
                weak.clone(),
                &base_type.canonical_name,
                destructor_decl.map_or(decl.span, |d| d.span),
                destructor_decl.map(|d| &d.body),
            ));

            Self {
                base_type,
                context,
                initializer_context,
                type_parameter_decls: decl.type_parameters.clone(),
                supertype_refs: decl.supertypes.clone(),
                member_decls,
                members,
                constructor,
                destructor,
                member_functions,
                structural,
                headers: OnceCell::new(),
                phases: PhaseMemo::default(),
                ir: OnceCell::new(),
            }
        });
        class
            .base_type
            .set_declaration(TypeDeclaration::Class(Rc::downgrade(&class)));
        class
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.context
    }

    pub fn initializer_context(&self) -> &Rc<Context> {
        &self.initializer_context
    }

    pub fn member(&self, name: &str) -> Option<Rc<BoundMemberVariable>> {
        self.members.iter().find(|m| m.name == name).cloned()
    }

    pub fn member_functions_named(&self, name: &str) -> Vec<Rc<BoundFunction>> {
        self.member_functions
            .iter()
            .filter(|f| f.name == name)
            .cloned()
            .collect()
    }

    pub fn resolve_headers(&self) {
        let diagnostics = resolve_headers(
            &self.context,
            &self.base_type,
            &self.type_parameter_decls,
            &self.supertype_refs,
        );
        if self.headers.set(diagnostics).is_err() {
            ice!("headers of {} resolved twice", self.base_type.canonical_name);
        }
    }

    fn resolve_members(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for (index, (member, reference)) in self.members.iter().zip(&self.member_decls).enumerate() {
            if self.members[..index].iter().any(|m| m.name == member.name) {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::DuplicateDeclaration {
                        name: member.name.clone(),
                    },
                    member.span,
                ));
            }
            let (ty, found) = self.context.resolve_type(reference);
            diagnostics.extend(found);
            if member.ty.set(ty).is_err() {
                ice!("type of member {} resolved twice", member.name);
            }
        }
        diagnostics
    }

    fn functions(&self) -> impl Iterator<Item = &Rc<BoundFunction>> {
        std::iter::once(&self.constructor)
            .chain(std::iter::once(&self.destructor))
            .chain(self.member_functions.iter())
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::One, || {
            let mut parts = vec![
                self.structural.clone(),
                self.headers.get().cloned().unwrap_or_default(),
                self.resolve_members(),
            ];
            for member in &self.members {
                if let MemberInitialization::Expression(expression) = &member.initializer {
                    parts.push(expression.phase1());
                }
            }
            parts.extend(self.functions().map(|f| f.phase1()));
            collect(parts)
        })
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || {
            let mut parts = Vec::new();
            for member in &self.members {
                if let MemberInitialization::Expression(expression) = &member.initializer {
                    let ty = member.ty(&self.context);
                    expression.set_expected_type(ty.clone());
                    parts.push(expression.phase2());
                    parts.push(
                        ty.unify(&expression.ty(), expression.span, TypeUnification::new())
                            .into_diagnostics(),
                    );
                }
            }
            parts.extend(self.functions().map(|f| f.phase2()));
            parts.push(check_overload_sets(&self.member_functions));
            collect(parts)
        })
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Three, || {
            let mut parts = Vec::new();
            for member in &self.members {
                if let MemberInitialization::Expression(expression) = &member.initializer {
                    parts.push(expression.phase3());
                }
            }
            parts.extend(self.functions().map(|f| f.phase3()));
            parts.push(self.check_member_initialization());
            parts.push(self.check_overrides());
            collect(parts)
        })
    }

    /// Members without an initializer must be assigned on every path
    /// through the constructor body.
    fn check_member_initialization(&self) -> Vec<Diagnostic> {
        let Some(FunctionBody::Block(body)) = &self.constructor.body else {
            return Vec::new();
        };
        let end = body.final_context();
        self.members
            .iter()
            .filter(|m| matches!(m.initializer, MemberInitialization::None))
            .filter(|m| {
                end.ephemeral_state(&EffectSubject::Member(m.name.clone())) != EphemeralState::Initialized
            })
            .map(|m| {
                Diagnostic::new(
                    DiagnosticKind::MemberNotInitialized {
                        member: m.name.clone(),
                    },
                    m.span,
                )
            })
            .collect()
    }

    fn check_overrides(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let interfaces = supertype_interfaces(&self.base_type);
        let inherited: Vec<Rc<BoundFunction>> = interfaces
            .iter()
            .flat_map(|i| i.functions.iter().cloned())
            .collect();
        let overridden = |f: &Rc<BoundFunction>| {
            inherited
                .iter()
                .find(|g| g.name == f.name && g.parameter_count() == f.parameter_count())
                .cloned()
        };

        for function in &self.member_functions {
            match (overridden(function), function.is_override()) {
                (None, true) => diagnostics.push(Diagnostic::new(
                    DiagnosticKind::OverridesNothing {
                        function: function.name.clone(),
                    },
                    function.span,
                )),
                (Some(_), false) => diagnostics.push(Diagnostic::new(
                    DiagnosticKind::MissingOverrideModifier {
                        function: function.name.clone(),
                    },
                    function.span,
                )),
                _ => {}
            }
            let Some(base) = overridden(function) else {
                continue;
            };
            // A declared `self` receiver is exempt.
            let receiver = usize::from(function.is_receiver_bearing());
            for (ours, theirs) in function.parameters.iter().zip(&base.parameters).skip(receiver) {
                if ownership_rank(ours.ownership) > ownership_rank(theirs.ownership) {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::OverrideWidensOwnership {
                            function: function.name.clone(),
                            parameter: ours.name.clone(),
                            base: ownership_name(theirs.ownership).to_string(),
                            overriding: ownership_name(ours.ownership).to_string(),
                        },
                        ours.span,
                    ));
                }
            }
        }

        for abstract_function in inherited.iter().filter(|f| f.is_abstract()) {
            let implemented = self.member_functions.iter().any(|f| {
                f.name == abstract_function.name && f.parameter_count() == abstract_function.parameter_count()
            });
            if !implemented {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::AbstractFunctionNotImplemented {
                        class: self.base_type.simple_name.clone(),
                        function: abstract_function.name.clone(),
                    },
                    self.base_type.span,
                ));
            }
        }
        diagnostics
    }

    pub fn to_backend_ir(&self) -> Arc<IrClass> {
        self.ir
            .get_or_init(|| Arc::new(crate::lower::lower_class(self)))
            .clone()
    }
}

pub struct BoundInterface {
    pub base_type: Rc<BaseType>,
    context: Rc<Context>,
    type_parameter_decls: Vec<TypeParameterDecl>,
    supertype_refs: Vec<TypeRef>,
    pub functions: Vec<Rc<BoundFunction>>,
    headers: OnceCell<Vec<Diagnostic>>,
    phases: PhaseMemo,
    ir: OnceCell<Arc<IrInterface>>,
}

impl BoundInterface {
    pub fn bind(file: &Rc<Context>, package: &PackageName, decl: &InterfaceDecl) -> Rc<Self> {
        let context = file.derive(ContextKind::TypeBody);
        let type_parameters = bind_type_parameters(&context, &decl.type_parameters);
        let base_type = Rc::new(BaseType::new(
            package.child(&decl.name.node),
            decl.name.node.clone(),
            BaseTypeKind::Interface,
            decl.name.span,
            type_parameters,
            None,
            false,
        ));
        let functions = decl
            .functions
            .iter()
            .map(|f| {
                Rc::new(BoundFunction::bind(
                    &context,
                    f,
                    FunctionKind::Member {
                        owner: base_type.clone(),
                    },
                    format!("{}.{}", base_type.canonical_name, f.name.node),
                ))
            })
            .collect();
        let interface = Rc::new(Self {
            base_type,
            context,
            type_parameter_decls: decl.type_parameters.clone(),
            supertype_refs: decl.supertypes.clone(),
            functions,
            headers: OnceCell::new(),
            phases: PhaseMemo::default(),
            ir: OnceCell::new(),
        });
        interface
            .base_type
            .set_declaration(TypeDeclaration::Interface(Rc::downgrade(&interface)));
        interface
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.context
    }

    pub fn functions_named(&self, name: &str) -> Vec<Rc<BoundFunction>> {
        self.functions.iter().filter(|f| f.name == name).cloned().collect()
    }

    /// Own functions plus those inherited from super-interfaces.
    pub fn all_functions_named(&self, name: &str) -> Vec<Rc<BoundFunction>> {
        let mut all = self.functions_named(name);
        for interface in supertype_interfaces(&self.base_type) {
            all.extend(interface.functions_named(name));
        }
        all
    }

    pub fn resolve_headers(&self) {
        let diagnostics = resolve_headers(
            &self.context,
            &self.base_type,
            &self.type_parameter_decls,
            &self.supertype_refs,
        );
        if self.headers.set(diagnostics).is_err() {
            ice!("headers of {} resolved twice", self.base_type.canonical_name);
        }
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::One, || {
            let mut parts = vec![self.headers.get().cloned().unwrap_or_default()];
            parts.extend(self.functions.iter().map(|f| f.phase1()));
            collect(parts)
        })
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || {
            let mut parts: Vec<Vec<Diagnostic>> = self.functions.iter().map(|f| f.phase2()).collect();
            parts.push(check_overload_sets(&self.functions));
            collect(parts)
        })
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases
            .run(Phase::Three, || collect(self.functions.iter().map(|f| f.phase3())))
    }

    pub fn to_backend_ir(&self) -> Arc<IrInterface> {
        self.ir
            .get_or_init(|| Arc::new(crate::lower::lower_interface(self)))
            .clone()
    }
}

/// Classes inherit the functions of the interfaces they implement.
pub(crate) fn inherited_functions_named(class: &BoundClass, name: &str) -> Vec<Rc<BoundFunction>> {
    supertype_interfaces(&class.base_type)
        .iter()
        .flat_map(|i| i.functions_named(name))
        .collect()
}
