#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::rc::Rc;
use std::sync::Arc;

use ember_ast::{Declaration, ImportDecl, Module, PackageName, Span, TypeRef, VariableDecl, VariableOwnership};
use ember_ir::{IrGlobalVariable, IrPackage};

use super::class::{BoundClass, BoundInterface};
use super::expression::BoundExpression;
use super::function::{BoundFunction, FunctionKind};
use super::variable::{BoundVariable, VariableKind};
use super::{Phase, PhaseMemo, collect};
use crate::builtins::CORE_PACKAGE;
use crate::context::{Context, ContextKind};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::overload::check_overload_sets;
use crate::types::{BoundType, TypeUnification};

pub struct BoundGlobalVariable {
    pub variable: Rc<BoundVariable>,
    context: Rc<Context>,
    declared_type: Option<TypeRef>,
    pub initializer: Option<BoundExpression>,
    phases: PhaseMemo,
    ir: OnceCell<Arc<IrGlobalVariable>>,
}

impl BoundGlobalVariable {
    fn bind(file: &Rc<Context>, package: &PackageName, decl: &VariableDecl) -> Self {
        let variable = Rc::new(BoundVariable::new(
            decl.name.node.clone(),
            decl.name.span,
            VariableKind::Global,
            decl.ownership.unwrap_or(VariableOwnership::Captured),
            decl.reassignable,
            decl.initializer.is_some(),
        ));
        variable.set_canonical_name(package.child(&decl.name.node));
        let initializer = decl.initializer.as_ref().map(|expr| {
            let continuation = file.derive_continuation();
            BoundExpression::bind(expr, file, &continuation)
        });
        Self {
            variable,
            context: file.clone(),
            declared_type: decl.declared_type.clone(),
            initializer,
            phases: PhaseMemo::default(),
            ir: OnceCell::new(),
        }
    }

    pub fn span(&self) -> Span {
        self.variable.span
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::One, || {
            let mut parts = Vec::new();
            if let Some(initializer) = &self.initializer {
                parts.push(initializer.phase1());
            }
            match (&self.declared_type, &self.initializer) {
                (Some(reference), _) => {
                    let (ty, found) = self.context.resolve_type(reference);
                    parts.push(found);
                    self.variable.set_type(ty);
                }
                (None, None) => {
                    parts.push(vec![Diagnostic::new(
                        DiagnosticKind::CannotInferVariableType {
                            variable: self.variable.name.clone(),
                        },
                        self.span(),
                    )]);
                    self.variable.set_type(BoundType::Unresolved {
                        name: self.variable.name.clone(),
                        standin: Box::new(self.context.core_types().any_nullable()),
                    });
                }
                (None, Some(_)) => {}
            }
            if self.initializer.is_none() {
                parts.push(vec![Diagnostic::new(
                    DiagnosticKind::VariableNotInitialized {
                        name: self.variable.name.clone(),
                    },
                    self.span(),
                )]);
            }
            collect(parts)
        })
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || {
            let Some(initializer) = &self.initializer else {
                return Vec::new();
            };
            if let Some(declared) = self.variable.ty() {
                initializer.set_expected_type(declared.clone());
            }
            let mut parts = vec![initializer.phase2()];
            match self.variable.ty() {
                Some(declared) => parts.push(
                    declared
                        .unify(&initializer.ty(), initializer.span, TypeUnification::new())
                        .into_diagnostics(),
                ),
                None => self.variable.set_type(initializer.ty()),
            }
            collect(parts)
        })
    }

    /// The type of the global for a reader. An undeclared type is inferred
    /// on first use; a read from within its own initializer is a cycle,
    /// reported and answered with a stand-in.
    pub fn ty(&self) -> (BoundType, Option<Diagnostic>) {
        if let Some(ty) = self.variable.ty() {
            return (ty.clone(), None);
        }
        let standin = BoundType::Unresolved {
            name: self.variable.name.clone(),
            standin: Box::new(self.context.core_types().any_nullable()),
        };
        if self.phases.is_running(Phase::Two) {
            tracing::debug!(global = %self.variable.canonical_name(), "cyclic global type inference");
            let diagnostic = Diagnostic::new(
                DiagnosticKind::CyclicTypeInference {
                    subject: self.variable.name.clone(),
                },
                self.span(),
            );
            return (standin, Some(diagnostic));
        }
        let _ = self.phase2();
        match self.variable.ty() {
            Some(ty) => (ty.clone(), None),
            None => (standin, None),
        }
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Three, || match &self.initializer {
            Some(initializer) => initializer.phase3(),
            None => Vec::new(),
        })
    }

    pub fn to_backend_ir(&self) -> Arc<IrGlobalVariable> {
        self.ir
            .get_or_init(|| Arc::new(crate::lower::lower_global(self)))
            .clone()
    }
}

pub struct BoundSourceFile {
    pub name: String,
    pub context: Rc<Context>,
    imports: Vec<ImportDecl>,
}

pub struct BoundModule {
    pub package: PackageName,
    context: Rc<Context>,
    pub files: Vec<BoundSourceFile>,
    pub functions: Vec<Rc<BoundFunction>>,
    pub classes: Vec<Rc<BoundClass>>,
    pub interfaces: Vec<Rc<BoundInterface>>,
    pub globals: Vec<Rc<BoundGlobalVariable>>,
    structural: Vec<Diagnostic>,
    linked: OnceCell<Vec<Diagnostic>>,
    phases: PhaseMemo,
    ir: OnceCell<Arc<IrPackage>>,
}

impl BoundModule {
    /// Binds the declarations of `module` and registers its package with
    /// the software context. Imports are resolved by [`BoundModule::link`]
    /// once every module is registered.
    pub fn new(software: &Rc<Context>, module: &Module) -> Rc<Self> {
        let package = module.package.clone();
        let context = software.derive(ContextKind::Module(package.clone()));
        software.register_package(context.clone());
        let core = PackageName::parse(CORE_PACKAGE);

        let mut files = Vec::new();
        let mut functions = Vec::new();
        let mut classes = Vec::new();
        let mut interfaces = Vec::new();
        let mut globals: Vec<Rc<BoundGlobalVariable>> = Vec::new();
        let mut structural = Vec::new();
        // Types and globals share one namespace; functions overload instead.
        let mut names: Vec<String> = Vec::new();

        for file in &module.files {
            let file_context = context.derive(ContextKind::SourceFile);
            if package != core {
                file_context.add_implicit_import(core.clone());
            }
            for declaration in &file.declarations {
                match declaration {
                    Declaration::Function(decl) => {
                        let function = Rc::new(BoundFunction::bind(
                            &file_context,
                            decl,
                            FunctionKind::TopLevel,
                            package.child(&decl.name.node),
                        ));
                        context.add_function(function.clone());
                        functions.push(function);
                    }
                    Declaration::Class(decl) => {
                        if names.contains(&decl.name.node) {
                            structural.push(duplicate(&decl.name.node, decl.name.span));
                        }
                        names.push(decl.name.node.clone());
                        let class = BoundClass::bind(&file_context, &package, decl);
                        context.add_base_type(class.base_type.clone());
                        classes.push(class);
                    }
                    Declaration::Interface(decl) => {
                        if names.contains(&decl.name.node) {
                            structural.push(duplicate(&decl.name.node, decl.name.span));
                        }
                        names.push(decl.name.node.clone());
                        let interface = BoundInterface::bind(&file_context, &package, decl);
                        context.add_base_type(interface.base_type.clone());
                        interfaces.push(interface);
                    }
                    Declaration::GlobalVariable(decl) => {
                        if names.contains(&decl.name.node) {
                            structural.push(duplicate(&decl.name.node, decl.name.span));
                        }
                        names.push(decl.name.node.clone());
                        let global = Rc::new(BoundGlobalVariable::bind(&file_context, &package, decl));
                        global.variable.set_type_source(Rc::downgrade(&global));
                        context.add_variable(global.variable.clone());
                        globals.push(global);
                    }
                }
            }
            files.push(BoundSourceFile {
                name: file.name.clone(),
                context: file_context,
                imports: file.imports.clone(),
            });
        }

        tracing::debug!(
            package = %package,
            functions = functions.len(),
            classes = classes.len(),
            interfaces = interfaces.len(),
            "bound module"
        );

        Rc::new(Self {
            package,
            context,
            files,
            functions,
            classes,
            interfaces,
            globals,
            structural,
            linked: OnceCell::new(),
            phases: PhaseMemo::default(),
            ir: OnceCell::new(),
        })
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.context
    }

    /// Resolves imports, then the headers (type parameter bounds and
    /// supertypes) of every class and interface.
    pub fn link(&self) {
        let mut diagnostics = Vec::new();
        for file in &self.files {
            diagnostics.extend(file.imports.iter().filter_map(|i| file.context.add_import(i)));
        }
        for interface in &self.interfaces {
            interface.resolve_headers();
        }
        for class in &self.classes {
            class.resolve_headers();
        }
        if self.linked.set(diagnostics).is_err() {
            ice!("module {} linked twice", self.package);
        }
    }

    pub fn phase1(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::One, || {
            let mut parts = vec![
                self.structural.clone(),
                self.linked.get().cloned().unwrap_or_default(),
            ];
            parts.extend(self.interfaces.iter().map(|i| i.phase1()));
            parts.extend(self.classes.iter().map(|c| c.phase1()));
            parts.extend(self.globals.iter().map(|g| g.phase1()));
            parts.extend(self.functions.iter().map(|f| f.phase1()));
            collect(parts)
        })
    }

    pub fn phase2(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Two, || {
            let mut parts = Vec::new();
            parts.extend(self.globals.iter().map(|g| g.phase2()));
            parts.push(check_overload_sets(&self.functions));
            parts.extend(self.interfaces.iter().map(|i| i.phase2()));
            parts.extend(self.classes.iter().map(|c| c.phase2()));
            parts.extend(self.functions.iter().map(|f| f.phase2()));
            collect(parts)
        })
    }

    pub fn phase3(&self) -> Vec<Diagnostic> {
        self.phases.run(Phase::Three, || {
            let mut parts = Vec::new();
            parts.extend(self.interfaces.iter().map(|i| i.phase3()));
            parts.extend(self.classes.iter().map(|c| c.phase3()));
            parts.extend(self.globals.iter().map(|g| g.phase3()));
            parts.extend(self.functions.iter().map(|f| f.phase3()));
            collect(parts)
        })
    }

    pub fn is_analyzed(&self) -> bool {
        self.phases.is_done(Phase::Three)
    }

    pub fn to_backend_ir(&self) -> Arc<IrPackage> {
        self.ir
            .get_or_init(|| Arc::new(crate::lower::lower_package(self)))
            .clone()
    }
}

fn duplicate(name: &str, span: Span) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::DuplicateDeclaration {
            name: name.to_string(),
        },
        span,
    )
}
