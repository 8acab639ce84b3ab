#![forbid(unsafe_code)]

//! Reference-count balance verification by symbolic path enumeration.
//!
//! Every temporary of a reference-counted type starts with one increment if it
//! was counted at creation. `CreateStrongReference` adds one; `DropStrongReference`,
//! a returned or thrown value, a stored assignment value and the result handed
//! out of an implicit evaluation each take one away. A temporary that aliases
//! another temporary (a plain reference or a not-null assertion) shares its
//! counter.
//!
//! On every path leaving the function the counts must cancel out. Temporaries
//! that merely view a storage location (variable or member reads) may end with
//! one more drop than increments: that drop releases the value previously held
//! by the storage.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use thiserror::Error;

use crate::ir::*;

/// Upper bound on the number of distinct symbolic states tracked at any one
/// point of a function.
const MAX_PATHS: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("reference count imbalance in `{function}`: %{temporary} has {increments} increment(s) and {decrements} decrement(s) {site}")]
pub struct RefCountImbalance {
    pub function: String,
    pub temporary: TemporaryId,
    pub increments: u32,
    pub decrements: u32,
    pub site: ExitSite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitSite {
    Return,
    FallOffEnd,
    Throw,
    ExceptionPropagation,
    LoopIteration,
}

impl fmt::Display for ExitSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExitSite::Return => "at a return",
            ExitSite::FallOffEnd => "at the end of the body",
            ExitSite::Throw => "at a throw",
            ExitSite::ExceptionPropagation => "when an exception propagates",
            ExitSite::LoopIteration => "at the end of a loop iteration",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Counter {
    increments: u32,
    decrements: u32,
    storage_view: bool,
}

impl Counter {
    fn balanced(&self) -> bool {
        if self.storage_view {
            self.decrements == self.increments || self.decrements == self.increments + 1
        } else {
            self.decrements == self.increments
        }
    }
}

type State = BTreeMap<TemporaryId, Counter>;

#[derive(Default)]
struct Flow {
    fallthrough: Vec<State>,
    breaks: Vec<(usize, State)>,
    continues: Vec<(usize, State)>,
}

struct Walker<'f> {
    function: &'f str,
    aliases: HashMap<TemporaryId, TemporaryId>,
    catch_entries: HashMap<usize, Vec<State>>,
    errors: Vec<RefCountImbalance>,
}

fn identity_key<T>(identity: &Arc<T>) -> usize {
    Arc::as_ptr(identity) as usize
}

fn dedup(states: Vec<State>) -> Vec<State> {
    let unique: BTreeSet<State> = states.into_iter().collect();
    unique.into_iter().take(MAX_PATHS).collect()
}

impl<'f> Walker<'f> {
    fn new(function: &'f str) -> Self {
        Self {
            function,
            aliases: HashMap::new(),
            catch_entries: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn root(&self, t: &IrTemporaryValueReference) -> TemporaryId {
        let mut id = t.id();
        while let Some(next) = self.aliases.get(&id) {
            id = *next;
        }
        id
    }

    fn adjust(&self, state: &mut State, t: &IrTemporaryValueReference, inc: u32, dec: u32) {
        if !t.ty().is_reference_counted() {
            return;
        }
        if let Some(counter) = state.get_mut(&self.root(t)) {
            counter.increments += inc;
            counter.decrements += dec;
        }
    }

    fn check_exit(&mut self, state: &State, site: ExitSite) {
        for (id, counter) in state {
            if !counter.balanced() {
                self.report(*id, counter, site);
            }
        }
    }

    fn report(&mut self, temporary: TemporaryId, counter: &Counter, site: ExitSite) {
        let imbalance = RefCountImbalance {
            function: self.function.to_string(),
            temporary,
            increments: counter.increments,
            decrements: counter.decrements,
            site,
        };
        if !self.errors.contains(&imbalance) {
            self.errors.push(imbalance);
        }
    }

    fn walk_chunk(&mut self, chunk: &IrCodeChunk, states: Vec<State>) -> Flow {
        let mut flow = Flow::default();
        let mut current = states;
        for stmt in &chunk.statements {
            let mut next = Vec::new();
            for state in current {
                self.step(stmt, state, &mut next, &mut flow);
            }
            current = dedup(next);
            if current.is_empty() {
                break;
            }
        }
        flow.fallthrough = current;
        flow
    }

    /// Runs the code of an implicit evaluation and hands its result out.
    fn walk_implicit(
        &mut self,
        eval: &IrImplicitEvaluation,
        states: Vec<State>,
        outer: &mut Flow,
    ) -> Vec<State> {
        let flow = self.walk_chunk(&eval.code, states);
        outer.breaks.extend(flow.breaks);
        outer.continues.extend(flow.continues);
        flow.fallthrough
            .into_iter()
            .map(|mut state| {
                if let Some(result) = &eval.result {
                    self.adjust(&mut state, result, 0, 1);
                }
                state
            })
            .collect()
    }

    fn step(&mut self, stmt: &IrStatement, mut state: State, next: &mut Vec<State>, flow: &mut Flow) {
        match stmt {
            IrStatement::CreateTemporaryValue(t) => {
                next.extend(self.create(t, state, flow));
            }
            IrStatement::CreateStrongReference(t) => {
                self.adjust(&mut state, t, 1, 0);
                next.push(state);
            }
            IrStatement::DropStrongReference(t) => {
                self.adjust(&mut state, t, 0, 1);
                next.push(state);
            }
            IrStatement::Assignment(a) => {
                self.adjust(&mut state, &a.value, 0, 1);
                next.push(state);
            }
            IrStatement::ConditionalBranch(b) => {
                let then_flow = self.walk_chunk(&b.then_branch, vec![state.clone()]);
                self.merge(then_flow, next, flow);
                match &b.else_branch {
                    Some(else_branch) => {
                        let else_flow = self.walk_chunk(else_branch, vec![state]);
                        self.merge(else_flow, next, flow);
                    }
                    None => next.push(state),
                }
            }
            IrStatement::Return(r) => {
                if let Some(value) = &r.value {
                    self.adjust(&mut state, value, 0, 1);
                }
                self.check_exit(&state, ExitSite::Return);
            }
            IrStatement::Throw(t) => {
                self.adjust(&mut state, &t.value, 0, 1);
                match &t.catch_target {
                    Some(target) => self
                        .catch_entries
                        .entry(identity_key(target))
                        .or_default()
                        .push(state),
                    None => self.check_exit(&state, ExitSite::Throw),
                }
            }
            IrStatement::While(w) => self.walk_loop(w, state, next, flow),
            IrStatement::Break(b) => flow.breaks.push((identity_key(&b.from), state)),
            IrStatement::Continue(c) => flow.continues.push((identity_key(&c.loop_), state)),
            IrStatement::VariableDeclaration(_)
            | IrStatement::DeallocateObject(_)
            | IrStatement::RegisterWeakReference(_)
            | IrStatement::UnregisterWeakReference(_) => next.push(state),
        }
    }

    fn merge(&mut self, inner: Flow, next: &mut Vec<State>, flow: &mut Flow) {
        next.extend(inner.fallthrough);
        flow.breaks.extend(inner.breaks);
        flow.continues.extend(inner.continues);
    }

    fn walk_loop(&mut self, w: &IrWhileLoop, entry: State, next: &mut Vec<State>, flow: &mut Flow) {
        let key = identity_key(&w.identity);
        let body = self.walk_chunk(&w.body, vec![entry.clone()]);

        let mut iteration_ends = body.fallthrough;
        for (target, state) in body.continues {
            if target == key {
                iteration_ends.push(state);
            } else {
                flow.continues.push((target, state));
            }
        }
        for end in iteration_ends {
            self.check_iteration(&entry, &end);
        }
        for (target, state) in body.breaks {
            if target == key {
                next.push(state);
            } else {
                flow.breaks.push((target, state));
            }
        }
    }

    /// Values from before the loop must be unchanged when the next iteration
    /// starts; values created inside the body must be balanced.
    fn check_iteration(&mut self, entry: &State, end: &State) {
        for (id, counter) in end {
            let ok = match entry.get(id) {
                Some(before) => before == counter,
                None => counter.balanced(),
            };
            if !ok {
                self.report(*id, counter, ExitSite::LoopIteration);
            }
        }
    }

    fn create(&mut self, t: &IrTemporaryValueReference, state: State, flow: &mut Flow) -> Vec<State> {
        let decl = t.declaration();
        let completed = match &decl.value {
            IrExpression::StaticDispatchInvocation { landing_pad, .. }
            | IrExpression::DynamicDispatchInvocation { landing_pad, .. } => {
                let mut completed = vec![state.clone()];
                if let Some(pad) = landing_pad {
                    completed.extend(self.landing_pad(pad, state, flow));
                }
                completed
            }
            IrExpression::IfExpression {
                then_branch,
                else_branch,
                ..
            } => {
                let mut completed = self.walk_implicit(then_branch, vec![state.clone()], flow);
                completed.extend(self.walk_implicit(else_branch, vec![state], flow));
                completed
            }
            IrExpression::TryCatchExpression {
                identity,
                body,
                catch_branch,
                ..
            } => {
                let mut completed = self.walk_implicit(body, vec![state], flow);
                let entries = self
                    .catch_entries
                    .remove(&identity_key(identity))
                    .unwrap_or_default();
                if !entries.is_empty() {
                    completed.extend(self.walk_implicit(catch_branch, dedup(entries), flow));
                }
                completed
            }
            _ => vec![state],
        };

        if !t.ty().is_reference_counted() {
            return completed;
        }
        let alias_of = match &decl.value {
            IrExpression::TemporaryValueReference(r) | IrExpression::NotNullAssertion(r)
                if r.ty().is_reference_counted() =>
            {
                Some(self.root(r))
            }
            _ => None,
        };
        if let Some(root) = alias_of {
            self.aliases.insert(t.id(), root);
        }
        completed
            .into_iter()
            .map(|mut state| {
                match alias_of {
                    Some(root) => {
                        if decl.counted_at_creation {
                            if let Some(counter) = state.get_mut(&root) {
                                counter.increments += 1;
                            }
                        }
                    }
                    None => {
                        state.insert(
                            t.id(),
                            Counter {
                                increments: u32::from(decl.counted_at_creation),
                                decrements: 0,
                                storage_view: decl.value.is_storage_view(),
                            },
                        );
                    }
                }
                state
            })
            .collect()
    }

    /// Follows the exceptional edge of an invocation. Returns the states that
    /// continue after the invocation (swallowed exceptions).
    fn landing_pad(&mut self, pad: &IrInvocationLandingPad, state: State, flow: &mut Flow) -> Vec<State> {
        let cleanup = self.walk_chunk(&pad.cleanup, vec![state]);
        flow.breaks.extend(cleanup.breaks);
        flow.continues.extend(cleanup.continues);
        match &pad.action {
            IrLandingPadAction::Propagate => {
                for state in &cleanup.fallthrough {
                    self.check_exit(state, ExitSite::ExceptionPropagation);
                }
                Vec::new()
            }
            IrLandingPadAction::JumpToCatch(target) => {
                self.catch_entries
                    .entry(identity_key(target))
                    .or_default()
                    .extend(cleanup.fallthrough);
                Vec::new()
            }
            IrLandingPadAction::Swallow => cleanup.fallthrough,
        }
    }
}

/// Checks a single function. Functions without a body are trivially balanced.
pub fn verify_function(function: &IrFunction) -> Vec<RefCountImbalance> {
    let Some(body) = &function.body else {
        return Vec::new();
    };
    let mut walker = Walker::new(&function.symbol);
    let flow = walker.walk_chunk(body, vec![State::new()]);
    for state in &flow.fallthrough {
        walker.check_exit(state, ExitSite::FallOffEnd);
    }
    walker.errors
}

/// Checks the initializer of a global variable; its result is handed to the
/// global's storage.
pub fn verify_global_initializer(global: &IrGlobalVariable) -> Vec<RefCountImbalance> {
    let mut walker = Walker::new(&global.declaration.name);
    let mut flow = Flow::default();
    let completed = walker.walk_implicit(&global.initializer, vec![State::new()], &mut flow);
    for state in &completed {
        walker.check_exit(state, ExitSite::FallOffEnd);
    }
    walker.errors
}

pub fn verify_package(package: &IrPackage) -> Vec<RefCountImbalance> {
    let mut imbalances: Vec<RefCountImbalance> = package
        .all_functions()
        .par_iter()
        .flat_map_iter(|f| verify_function(f))
        .collect();
    imbalances.extend(
        package
            .variables
            .par_iter()
            .flat_map_iter(|v| verify_global_initializer(v))
            .collect::<Vec<_>>(),
    );
    imbalances
}

pub fn verify_reference_counts(context: &IrSoftwareContext) -> Vec<RefCountImbalance> {
    context
        .packages
        .par_iter()
        .flat_map_iter(|p| verify_package(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_type() -> IrType {
        IrType::Simple {
            base: "test.Box".to_string(),
            arguments: Vec::new(),
            nullable: false,
            reference_counted: true,
        }
    }

    fn temp(id: u32, value: IrExpression, counted: bool) -> IrTemporaryValueReference {
        IrTemporaryValueReference::new(IrCreateTemporaryValue {
            id: TemporaryId(id),
            value,
            ty: object_type(),
            counted_at_creation: counted,
        })
    }

    fn call(name: &str) -> IrExpression {
        IrExpression::StaticDispatchInvocation {
            function: name.to_string(),
            arguments: Vec::new(),
            landing_pad: None,
        }
    }

    fn function(statements: Vec<IrStatement>) -> IrFunction {
        IrFunction {
            canonical_name: "test.f".to_string(),
            symbol: "test.f".to_string(),
            parameters: Vec::new(),
            return_type: object_type(),
            is_external_c: false,
            is_nothrow: false,
            body: Some(IrCodeChunk::new(statements)),
        }
    }

    #[test]
    fn returned_call_result_is_balanced() {
        let t = temp(0, call("make"), true);
        let f = function(vec![
            IrStatement::CreateTemporaryValue(t.clone()),
            IrStatement::Return(IrReturnStatement { value: Some(t) }),
        ]);
        assert!(verify_function(&f).is_empty());
    }

    #[test]
    fn missing_drop_is_reported() {
        let t = temp(0, call("make"), true);
        let f = function(vec![IrStatement::CreateTemporaryValue(t)]);
        let errors = verify_function(&f);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].site, ExitSite::FallOffEnd);
        assert_eq!(errors[0].increments, 1);
        assert_eq!(errors[0].decrements, 0);
    }

    #[test]
    fn drop_on_only_one_branch_is_reported() {
        let t = temp(0, call("make"), true);
        let cond = IrTemporaryValueReference::new(IrCreateTemporaryValue {
            id: TemporaryId(1),
            value: IrExpression::BooleanLiteral(true),
            ty: IrType::value("emerge.core.Bool"),
            counted_at_creation: false,
        });
        let f = function(vec![
            IrStatement::CreateTemporaryValue(t.clone()),
            IrStatement::CreateTemporaryValue(cond.clone()),
            IrStatement::ConditionalBranch(IrConditionalBranch {
                condition: cond,
                then_branch: IrCodeChunk::new(vec![IrStatement::DropStrongReference(t)]),
                else_branch: None,
            }),
        ]);
        assert_eq!(verify_function(&f).len(), 1);
    }

    #[test]
    fn storage_view_may_release_previous_value() {
        let var = Arc::new(IrVariableDeclaration {
            name: "x".to_string(),
            ty: object_type(),
        });
        let old = temp(0, IrExpression::VariableAccess(var), false);
        let f = function(vec![
            IrStatement::CreateTemporaryValue(old.clone()),
            IrStatement::DropStrongReference(old),
        ]);
        assert!(verify_function(&f).is_empty());
    }

    #[test]
    fn loop_local_leak_is_reported_per_iteration() {
        let identity = Arc::new(IrLoopIdentity { label: 0 });
        let t = temp(0, call("make"), true);
        let f = function(vec![IrStatement::While(IrWhileLoop {
            identity: identity.clone(),
            body: IrCodeChunk::new(vec![
                IrStatement::CreateTemporaryValue(t),
                IrStatement::Continue(IrContinueStatement { loop_: identity }),
            ]),
        })]);
        let errors = verify_function(&f);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].site, ExitSite::LoopIteration);
    }
}
