#![forbid(unsafe_code)]

//! The context tree.
//!
//! Every scope-introducing node derives a child context from the context it
//! was bound in. Children hold a weak back-reference to their parent; the
//! bound node that created a context owns it. Within a code chunk each
//! statement derives a continuation context from the previous statement's, so
//! lookups and side-effect queries see exactly the statements before them.

use std::cell::{OnceCell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use ember_ast::{ImportDecl, ImportedSymbol, PackageName, TypeRef};

use crate::binder::{BoundFunction, BoundVariable};
use crate::builtins::CoreTypes;
use crate::config::SemaConfig;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::types::{BaseType, BoundType, BoundTypeArgument, Mutability, TypeParameter};

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(0);

pub struct SoftwareRoot {
    packages: RefCell<Vec<Rc<Context>>>,
    core: OnceCell<Rc<CoreTypes>>,
    pub config: SemaConfig,
}

pub enum ScopeKind {
    FunctionRoot {
        return_type: OnceCell<BoundType>,
        constructor: bool,
    },
    Block,
    Loop,
    TryBody,
    Catch,
    Branch,
}

pub enum ContextKind {
    Software(SoftwareRoot),
    Module(PackageName),
    SourceFile,
    /// Body of a class or interface; holds its type parameters.
    TypeBody,
    Scope(ScopeKind),
    /// Derived after each statement.
    Continuation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EffectSubject {
    Variable(u32),
    Member(String),
    /// Set once an exclusive variable was handed off.
    LifetimeEnded(u32),
}

pub enum SideEffect {
    Reached(EffectSubject),
    /// Control flow joins here; each context is the last one of a branch
    /// that completes normally.
    Merge(Vec<Rc<Context>>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EphemeralState {
    Uninitialized,
    PartiallyInitialized,
    Initialized,
}

#[derive(Clone)]
pub enum DeferredCode {
    DropVariable(Rc<BoundVariable>),
}

struct Import {
    package: PackageName,
    symbol: Option<String>,
}

pub struct Context {
    pub id: u32,
    parent: Option<Weak<Context>>,
    pub kind: ContextKind,
    variables: RefCell<Vec<Rc<BoundVariable>>>,
    base_types: RefCell<Vec<Rc<BaseType>>>,
    type_aliases: RefCell<Vec<(String, Rc<BaseType>)>>,
    type_parameters: RefCell<Vec<Rc<TypeParameter>>>,
    functions: RefCell<Vec<Rc<BoundFunction>>>,
    imports: RefCell<Vec<Import>>,
    effects: RefCell<Vec<SideEffect>>,
    deferred: RefCell<Vec<DeferredCode>>,
}

/// One step of name lookup: declarations of these contexts are consulted
/// together; the optional name restricts a single-symbol import.
type LookupLevel = Vec<(Rc<Context>, Option<String>)>;

impl Context {
    fn new(parent: Option<Weak<Context>>, kind: ContextKind) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            parent,
            kind,
            variables: RefCell::new(Vec::new()),
            base_types: RefCell::new(Vec::new()),
            type_aliases: RefCell::new(Vec::new()),
            type_parameters: RefCell::new(Vec::new()),
            functions: RefCell::new(Vec::new()),
            imports: RefCell::new(Vec::new()),
            effects: RefCell::new(Vec::new()),
            deferred: RefCell::new(Vec::new()),
        })
    }

    pub fn software(config: SemaConfig) -> Rc<Self> {
        Self::new(
            None,
            ContextKind::Software(SoftwareRoot {
                packages: RefCell::new(Vec::new()),
                core: OnceCell::new(),
                config,
            }),
        )
    }

    pub fn derive(self: &Rc<Self>, kind: ContextKind) -> Rc<Self> {
        Self::new(Some(Rc::downgrade(self)), kind)
    }

    pub fn derive_scope(self: &Rc<Self>, kind: ScopeKind) -> Rc<Self> {
        self.derive(ContextKind::Scope(kind))
    }

    pub fn derive_continuation(self: &Rc<Self>) -> Rc<Self> {
        self.derive(ContextKind::Continuation)
    }

    pub fn parent(&self) -> Option<Rc<Context>> {
        let parent = self.parent.as_ref()?;
        match parent.upgrade() {
            Some(p) => Some(p),
            None => ice!("context {} outlived its parent", self.id),
        }
    }

    /// `self` and all of its ancestors, innermost first.
    pub fn ancestors(self: &Rc<Self>) -> Vec<Rc<Context>> {
        let mut out = vec![self.clone()];
        while let Some(parent) = out.last().and_then(|c| c.parent()) {
            out.push(parent);
        }
        out
    }

    fn software_root(self: &Rc<Self>) -> Rc<Context> {
        match self.ancestors().pop() {
            Some(root) if matches!(root.kind, ContextKind::Software(_)) => root,
            _ => ice!("context {} is not attached to a software context", self.id),
        }
    }

    fn with_root<R>(self: &Rc<Self>, f: impl FnOnce(&SoftwareRoot) -> R) -> R {
        let root = self.software_root();
        match &root.kind {
            ContextKind::Software(software) => f(software),
            _ => ice!("software root has the wrong kind"),
        }
    }

    pub fn core_types(self: &Rc<Self>) -> Rc<CoreTypes> {
        self.with_root(|r| match r.core.get() {
            Some(core) => core.clone(),
            None => ice!("core types used before the core package was bound"),
        })
    }

    pub fn set_core_types(&self, core: Rc<CoreTypes>) {
        let ContextKind::Software(root) = &self.kind else {
            ice!("core types attached to a non-root context");
        };
        if root.core.set(core).is_err() {
            ice!("core types attached twice");
        }
    }

    pub fn config(self: &Rc<Self>) -> SemaConfig {
        self.with_root(|r| r.config.clone())
    }

    pub fn register_package(&self, module: Rc<Context>) {
        let ContextKind::Software(root) = &self.kind else {
            ice!("package registered on a non-root context");
        };
        root.packages.borrow_mut().push(module);
    }

    pub fn package_context(self: &Rc<Self>, name: &PackageName) -> Option<Rc<Context>> {
        self.with_root(|r| {
            r.packages
                .borrow()
                .iter()
                .find(|p| matches!(&p.kind, ContextKind::Module(n) if n == name))
                .cloned()
        })
    }

    pub fn package_name(self: &Rc<Self>) -> Option<PackageName> {
        self.ancestors().into_iter().find_map(|c| match &c.kind {
            ContextKind::Module(name) => Some(name.clone()),
            _ => None,
        })
    }

    // ---- declarations

    pub fn add_variable(&self, variable: Rc<BoundVariable>) {
        self.variables.borrow_mut().push(variable);
    }

    pub fn add_base_type(&self, base: Rc<BaseType>) {
        self.base_types.borrow_mut().push(base);
    }

    pub fn add_type_alias(&self, alias: &str, base: Rc<BaseType>) {
        self.type_aliases.borrow_mut().push((alias.to_string(), base));
    }

    pub fn add_type_parameter(&self, parameter: Rc<TypeParameter>) {
        self.type_parameters.borrow_mut().push(parameter);
    }

    pub fn add_function(&self, function: Rc<BoundFunction>) {
        self.functions.borrow_mut().push(function);
    }

    pub fn functions(&self) -> Vec<Rc<BoundFunction>> {
        self.functions.borrow().clone()
    }

    /// Records an import; reports it when the package or symbol is unknown.
    pub fn add_import(self: &Rc<Self>, import: &ImportDecl) -> Option<Diagnostic> {
        let symbol = match &import.symbol {
            ImportedSymbol::All => None,
            ImportedSymbol::Named(name) => Some(name.node.clone()),
        };
        let unresolved = || {
            Diagnostic::new(
                DiagnosticKind::UnresolvedImport {
                    package: import.package.to_string(),
                    symbol: symbol.clone().unwrap_or_else(|| "*".to_string()),
                },
                import.span,
            )
        };
        let Some(package) = self.package_context(&import.package) else {
            return Some(unresolved());
        };
        if let Some(name) = &symbol {
            if !package.declares(name) {
                return Some(unresolved());
            }
        }
        self.imports.borrow_mut().push(Import {
            package: import.package.clone(),
            symbol,
        });
        None
    }

    /// Star-imports a package without validation; used for the core package.
    pub fn add_implicit_import(&self, package: PackageName) {
        self.imports.borrow_mut().push(Import {
            package,
            symbol: None,
        });
    }

    fn declares(&self, name: &str) -> bool {
        self.variables.borrow().iter().any(|v| v.name == name)
            || self.base_types.borrow().iter().any(|b| b.simple_name == name)
            || self.functions.borrow().iter().any(|f| f.name == name)
    }

    // ---- lookup

    fn lookup_levels(self: &Rc<Self>, local_only: bool) -> Vec<LookupLevel> {
        let mut levels: Vec<LookupLevel> = Vec::new();
        let mut skip_module: Option<u32> = None;
        for ctx in self.ancestors() {
            if skip_module == Some(ctx.id) {
                continue;
            }
            let stop = local_only && !matches!(ctx.kind, ContextKind::Continuation);
            levels.push(vec![(ctx.clone(), None)]);
            if stop {
                break;
            }
            if matches!(ctx.kind, ContextKind::SourceFile) {
                // Package-level declarations shadow imports.
                if let Some(module) = ctx.parent() {
                    skip_module = Some(module.id);
                    levels.push(vec![(module, None)]);
                }
                let imported: LookupLevel = ctx
                    .imports
                    .borrow()
                    .iter()
                    .filter_map(|i| Some((self.package_context(&i.package)?, i.symbol.clone())))
                    .collect();
                if !imported.is_empty() {
                    levels.push(imported);
                }
            }
        }
        levels
    }

    fn lookup<T>(
        self: &Rc<Self>,
        name: &str,
        local_only: bool,
        own: impl Fn(&Context, &str) -> Option<T>,
    ) -> Option<T> {
        for level in self.lookup_levels(local_only) {
            for (ctx, filter) in &level {
                if filter.as_deref().is_some_and(|f| f != name) {
                    continue;
                }
                if let Some(found) = own(&**ctx, name) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn resolve_variable(self: &Rc<Self>, name: &str, local_only: bool) -> Option<Rc<BoundVariable>> {
        self.lookup(name, local_only, |ctx, name| {
            ctx.variables
                .borrow()
                .iter()
                .rev()
                .find(|v| v.name == name)
                .cloned()
        })
    }

    pub fn resolve_base_type(self: &Rc<Self>, name: &str, local_only: bool) -> Option<Rc<BaseType>> {
        self.lookup(name, local_only, |ctx, name| {
            let declared = ctx.base_types.borrow().iter().find(|b| b.simple_name == name).cloned();
            declared.or_else(|| {
                ctx.type_aliases
                    .borrow()
                    .iter()
                    .find(|(alias, _)| alias == name)
                    .map(|(_, base)| base.clone())
            })
        })
    }

    pub fn resolve_type_parameter(self: &Rc<Self>, name: &str) -> Option<Rc<TypeParameter>> {
        self.lookup(name, false, |ctx, name| {
            ctx.type_parameters
                .borrow()
                .iter()
                .find(|p| p.name == name)
                .cloned()
        })
    }

    /// Top-level functions named `name`, grouped by parameter count. For
    /// every count the innermost level that declares such a function wins.
    pub fn function_overload_sets(self: &Rc<Self>, name: &str) -> Vec<Vec<Rc<BoundFunction>>> {
        let mut sets: BTreeMap<usize, Vec<Rc<BoundFunction>>> = BTreeMap::new();
        for level in self.lookup_levels(false) {
            let mut found: BTreeMap<usize, Vec<Rc<BoundFunction>>> = BTreeMap::new();
            for (ctx, filter) in &level {
                if filter.as_deref().is_some_and(|f| f != name) {
                    continue;
                }
                for function in ctx.functions.borrow().iter().filter(|f| f.name == name) {
                    found
                        .entry(function.parameter_count())
                        .or_default()
                        .push(function.clone());
                }
            }
            for (arity, functions) in found {
                sets.entry(arity).or_insert(functions);
            }
        }
        sets.into_values().collect()
    }

    /// Never fails: a type that cannot be resolved becomes
    /// [`BoundType::Unresolved`] and the problem is returned alongside.
    pub fn resolve_type(self: &Rc<Self>, reference: &TypeRef) -> (BoundType, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let name = reference.name.node.as_str();
        let explicit_mutability = reference.mutability.map(Mutability::from);

        let resolved = if let Some(parameter) = self.resolve_type_parameter(name) {
            if !reference.arguments.is_empty() {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::SuperfluousTypeArguments {
                        ty: name.to_string(),
                        expected: 0,
                        found: reference.arguments.len(),
                    },
                    reference.span,
                ));
            }
            BoundType::Generic {
                parameter,
                mutability: explicit_mutability,
            }
        } else if let Some(base) = self.resolve_base_type(name, false) {
            let mutability = explicit_mutability.unwrap_or_else(|| base.default_mutability());
            let arguments = self.resolve_type_arguments(&base, reference, &mut diagnostics);
            BoundType::Root {
                base,
                arguments,
                mutability,
            }
        } else {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::UnresolvedType {
                    name: name.to_string(),
                },
                reference.name.span,
            ));
            let core = self.core_types();
            BoundType::Unresolved {
                name: name.to_string(),
                standin: Box::new(BoundType::simple(&core.any, Mutability::ReadOnly).nullable()),
            }
        };

        let resolved = if reference.nullable {
            resolved.nullable()
        } else {
            resolved
        };
        (resolved, diagnostics)
    }

    fn resolve_type_arguments(
        self: &Rc<Self>,
        base: &Rc<BaseType>,
        reference: &TypeRef,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<BoundTypeArgument> {
        let expected = base.type_parameters.len();
        let found = reference.arguments.len();
        if found < expected {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::MissingTypeArguments {
                    ty: base.simple_name.clone(),
                    expected,
                    found,
                },
                reference.span,
            ));
        } else if found > expected {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::SuperfluousTypeArguments {
                    ty: base.simple_name.clone(),
                    expected,
                    found,
                },
                reference.span,
            ));
        }

        let mut arguments = Vec::with_capacity(expected);
        for (index, parameter) in base.type_parameters.iter().enumerate() {
            let Some(argument) = reference.arguments.get(index) else {
                let core = self.core_types();
                arguments.push(BoundTypeArgument {
                    variance: ember_ast::Variance::Unspecified,
                    ty: BoundType::Unresolved {
                        name: parameter.name.clone(),
                        standin: Box::new(BoundType::simple(&core.any, Mutability::ReadOnly).nullable()),
                    },
                });
                continue;
            };
            let (ty, nested) = self.resolve_type(&argument.ty);
            diagnostics.extend(nested);
            if let Some(bound) = parameter.resolved_bound() {
                let unification = bound.unify(&ty, argument.span, crate::types::TypeUnification::new());
                if unification.has_errors() {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::TypeArgumentOutOfBounds {
                            parameter: parameter.name.clone(),
                            bound: bound.to_string(),
                            argument: ty.to_string(),
                        },
                        argument.span,
                    ));
                }
            }
            arguments.push(BoundTypeArgument {
                variance: argument.variance,
                ty,
            });
        }
        arguments
    }

    // ---- scopes

    fn nearest_scope(self: &Rc<Self>, accept: impl Fn(&ScopeKind) -> bool) -> Option<Rc<Context>> {
        self.ancestors()
            .into_iter()
            .find(|c| matches!(&c.kind, ContextKind::Scope(kind) if accept(kind)))
    }

    pub fn function_root(self: &Rc<Self>) -> Option<Rc<Context>> {
        self.nearest_scope(|k| matches!(k, ScopeKind::FunctionRoot { .. }))
    }

    pub fn return_type(self: &Rc<Self>) -> Option<BoundType> {
        let root = self.function_root()?;
        match &root.kind {
            ContextKind::Scope(ScopeKind::FunctionRoot { return_type, .. }) => return_type.get().cloned(),
            _ => None,
        }
    }

    pub fn set_return_type(&self, ty: BoundType) {
        match &self.kind {
            ContextKind::Scope(ScopeKind::FunctionRoot { return_type, .. }) => {
                if return_type.set(ty).is_err() {
                    ice!("return type of function context {} set twice", self.id);
                }
            }
            _ => ice!("return type set on a context that is not a function root"),
        }
    }

    pub fn in_constructor(self: &Rc<Self>) -> bool {
        self.function_root().is_some_and(|root| {
            matches!(
                root.kind,
                ContextKind::Scope(ScopeKind::FunctionRoot {
                    constructor: true,
                    ..
                })
            )
        })
    }

    /// Whether `break`/`continue` have a loop to refer to. Loops do not reach
    /// across function boundaries.
    pub fn is_within_loop(self: &Rc<Self>) -> bool {
        self.nearest_scope(|k| matches!(k, ScopeKind::Loop | ScopeKind::FunctionRoot { .. }))
            .is_some_and(|c| matches!(c.kind, ContextKind::Scope(ScopeKind::Loop)))
    }

    // ---- side effects

    pub fn track_side_effect(&self, effect: SideEffect) {
        self.effects.borrow_mut().push(effect);
    }

    pub fn ephemeral_state(self: &Rc<Self>, subject: &EffectSubject) -> EphemeralState {
        for ctx in self.ancestors() {
            if let Some(state) = ctx.local_state(subject) {
                return state;
            }
        }
        EphemeralState::Uninitialized
    }

    fn local_state(&self, subject: &EffectSubject) -> Option<EphemeralState> {
        let effects = self.effects.borrow();
        // States only ever advance, so any hit in this context is final.
        if effects
            .iter()
            .any(|e| matches!(e, SideEffect::Reached(s) if s == subject))
        {
            return Some(EphemeralState::Initialized);
        }
        effects.iter().rev().find_map(|effect| match effect {
            SideEffect::Merge(branches) if !branches.is_empty() => {
                // Branch contexts chain back past the fork, so each branch
                // state already accounts for everything before it.
                let states: Vec<EphemeralState> =
                    branches.iter().map(|b| b.ephemeral_state(subject)).collect();
                let all = |s: EphemeralState| states.iter().all(|x| *x == s);
                Some(if all(EphemeralState::Initialized) {
                    EphemeralState::Initialized
                } else if all(EphemeralState::Uninitialized) {
                    EphemeralState::Uninitialized
                } else {
                    EphemeralState::PartiallyInitialized
                })
            }
            _ => None,
        })
    }

    // ---- deferred code

    pub fn add_deferred_code(&self, code: DeferredCode) {
        self.deferred.borrow_mut().push(code);
    }

    /// Collects deferred code from `self` outwards up to and including the
    /// first context accepted by `stop`, in registration order.
    fn deferred_code_until(self: &Rc<Self>, stop: impl Fn(&Context) -> bool) -> Vec<DeferredCode> {
        let mut collected = Vec::new();
        for ctx in self.ancestors() {
            collected.extend(ctx.deferred.borrow().iter().rev().cloned());
            if stop(&*ctx) {
                break;
            }
        }
        collected.reverse();
        tracing::trace!(context = self.id, count = collected.len(), "collected deferred code");
        collected
    }

    pub fn deferred_code_at_scope_exit(self: &Rc<Self>) -> Vec<DeferredCode> {
        self.deferred_code_until(|c| matches!(c.kind, ContextKind::Scope(_)))
    }

    /// For `break` and `continue`: everything up to the loop body.
    pub fn deferred_code_at_loop_exit(self: &Rc<Self>) -> Vec<DeferredCode> {
        self.deferred_code_until(|c| {
            matches!(
                c.kind,
                ContextKind::Scope(ScopeKind::Loop | ScopeKind::FunctionRoot { .. })
            )
        })
    }

    pub fn deferred_code_at_function_exit(self: &Rc<Self>) -> Vec<DeferredCode> {
        self.deferred_code_until(|c| matches!(c.kind, ContextKind::Scope(ScopeKind::FunctionRoot { .. })))
    }

    /// For exceptions: everything up to the innermost enclosing try body, or
    /// the whole function.
    pub fn deferred_code_at_unwind(self: &Rc<Self>) -> Vec<DeferredCode> {
        self.deferred_code_until(|c| {
            matches!(
                c.kind,
                ContextKind::Scope(ScopeKind::TryBody | ScopeKind::FunctionRoot { .. })
            )
        })
    }
}
