#![forbid(unsafe_code)]

//! Bound (semantically analyzed) program.
//!
//! Every bindable node runs three phases in order:
//!
//! 1. structural: declared types are resolved and declarations registered;
//! 2. inference: remaining types are inferred, overloads resolved;
//! 3. validation: effect and ownership rules are checked on final types.
//!
//! Each phase runs at most once per node; repeated calls return the memoized
//! diagnostics.

mod class;
mod expression;
mod function;
mod module;
mod statement;
mod variable;

use std::cell::{Cell, OnceCell};
use std::fmt;

use crate::diagnostic::Diagnostic;

pub use class::{BoundClass, BoundInterface, BoundMemberVariable, MemberInitialization};
pub use expression::{BoundExpression, BoundIf, BoundInvocation, BoundTry, ExpressionKind, InvocationTarget};
pub use function::{BoundFunction, FunctionBody, FunctionKind};
pub use module::{BoundGlobalVariable, BoundModule, BoundSourceFile};
pub use statement::{AssignmentTarget, BoundCodeChunk, BoundStatement, StatementKind};
pub use variable::{BoundVariable, VariableKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    One,
    Two,
    Three,
}

impl Phase {
    fn index(self) -> usize {
        match self {
            Phase::One => 0,
            Phase::Two => 1,
            Phase::Three => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {}", self.index() + 1)
    }
}

/// One-shot results of the three phases of a node.
#[derive(Default)]
pub struct PhaseMemo {
    results: [OnceCell<Vec<Diagnostic>>; 3],
    running: [Cell<bool>; 3],
}

impl PhaseMemo {
    pub fn run(&self, phase: Phase, compute: impl FnOnce() -> Vec<Diagnostic>) -> Vec<Diagnostic> {
        let i = phase.index();
        debug_assert!(
            i == 0 || self.results[i - 1].get().is_some(),
            "{phase} invoked before its prerequisite"
        );
        if let Some(done) = self.results[i].get() {
            return done.clone();
        }
        if self.running[i].replace(true) {
            ice!("{phase} re-entered on the same node");
        }
        let diagnostics = compute();
        self.running[i].set(false);
        if self.results[i].set(diagnostics.clone()).is_err() {
            ice!("{phase} produced two different results");
        }
        diagnostics
    }

    pub fn is_done(&self, phase: Phase) -> bool {
        self.results[phase.index()].get().is_some()
    }

    pub fn is_running(&self, phase: Phase) -> bool {
        self.running[phase.index()].get()
    }
}

/// Detects re-entry into a computation that may recurse through the call
/// graph.
#[derive(Default)]
pub struct ReentrancyGuard {
    active: Cell<bool>,
}

pub struct GuardToken<'g> {
    guard: &'g ReentrancyGuard,
}

impl ReentrancyGuard {
    /// `None` when the guarded computation is already running.
    pub fn enter(&self) -> Option<GuardToken<'_>> {
        if self.active.replace(true) {
            None
        } else {
            Some(GuardToken { guard: self })
        }
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.active.set(false);
    }
}

/// Concatenates the diagnostics of several phase results.
pub(crate) fn collect<I>(parts: I) -> Vec<Diagnostic>
where
    I: IntoIterator<Item = Vec<Diagnostic>>,
{
    let mut out = Vec::new();
    for part in parts {
        for d in part {
            if !out.contains(&d) {
                out.push(d);
            }
        }
    }
    out
}
