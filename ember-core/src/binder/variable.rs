#![forbid(unsafe_code)]

use std::cell::{Cell, OnceCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use ember_ast::{Span, VariableOwnership};

use super::module::BoundGlobalVariable;
use crate::types::BoundType;

static NEXT_VARIABLE_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariableKind {
    Global,
    Parameter,
    Local,
    CatchVariable,
    /// `self` inside a constructor: the object under construction.
    ConstructedObject,
}

/// A named value. Its initialization state is tracked by the contexts it is
/// used in, never on the variable itself.
pub struct BoundVariable {
    pub id: u32,
    pub name: String,
    pub span: Span,
    pub kind: VariableKind,
    pub ownership: VariableOwnership,
    pub reassignable: bool,
    pub has_initializer: bool,
    ty: OnceCell<BoundType>,
    canonical_name: OnceCell<String>,
    /// The global whose initializer determines an undeclared type.
    type_source: OnceCell<Weak<BoundGlobalVariable>>,
    assignments: Cell<u32>,
}

impl std::fmt::Debug for BoundVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoundVariable({}#{})", self.name, self.id)
    }
}

impl BoundVariable {
    pub fn new(
        name: String,
        span: Span,
        kind: VariableKind,
        ownership: VariableOwnership,
        reassignable: bool,
        has_initializer: bool,
    ) -> Self {
        Self {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            span,
            kind,
            ownership,
            reassignable,
            has_initializer,
            ty: OnceCell::new(),
            canonical_name: OnceCell::new(),
            type_source: OnceCell::new(),
            assignments: Cell::new(0),
        }
    }

    pub fn set_type(&self, ty: BoundType) {
        if self.ty.set(ty).is_err() {
            ice!("type of variable {} set twice", self.name);
        }
    }

    /// `None` until the declaring node ran the phase that determines it.
    pub fn ty(&self) -> Option<&BoundType> {
        self.ty.get()
    }

    /// Package-qualified name of a global; the plain name otherwise.
    pub fn canonical_name(&self) -> String {
        self.canonical_name.get().cloned().unwrap_or_else(|| self.name.clone())
    }

    pub fn set_canonical_name(&self, name: String) {
        if self.canonical_name.set(name).is_err() {
            ice!("canonical name of variable {} set twice", self.name);
        }
    }

    pub fn set_type_source(&self, global: Weak<BoundGlobalVariable>) {
        if self.type_source.set(global).is_err() {
            ice!("type source of variable {} set twice", self.name);
        }
    }

    pub fn type_source(&self) -> Option<Rc<BoundGlobalVariable>> {
        self.type_source.get().and_then(Weak::upgrade)
    }

    pub fn record_assignment(&self) {
        self.assignments.set(self.assignments.get() + 1);
    }

    pub fn assignment_count(&self) -> u32 {
        self.assignments.get()
    }

    pub fn is_parameter(&self) -> bool {
        self.kind == VariableKind::Parameter
    }

    /// Whether the variable can live in a single SSA temporary instead of
    /// storage: it is initialized at its declaration and never assigned
    /// afterwards. A `var` qualifies only when `demote_reassignable` is set.
    pub fn is_single_static_assignment(&self, demote_reassignable: bool) -> bool {
        match self.kind {
            VariableKind::Local => {
                self.has_initializer
                    && self.assignments.get() == 0
                    && (!self.reassignable || demote_reassignable)
            }
            VariableKind::Parameter => !self.reassignable,
            VariableKind::ConstructedObject => true,
            VariableKind::Global | VariableKind::CatchVariable => false,
        }
    }
}
