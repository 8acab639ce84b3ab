#![forbid(unsafe_code)]

//! Entry point: binds modules, runs the three analysis phases and hands out
//! diagnostics and backend IR.

use std::cell::OnceCell;
use std::rc::Rc;

use ember_ast::Module;
use ember_ir::{IrSoftwareContext, RefCountImbalance, verify_reference_counts};
use miette::Diagnostic as MietteDiagnostic;
use thiserror::Error;

use crate::binder::{BoundModule, collect};
use crate::builtins::bind_core_package;
use crate::config::SemaConfig;
use crate::context::Context;
use crate::diagnostic::{Diagnostic, Diagnostics, Severity};

#[derive(Debug, Error, MietteDiagnostic)]
pub enum BackendIrError {
    #[error("cannot lower a program with {count} error(s)")]
    #[diagnostic(
        code(ember::backend_ir::errors),
        help("fix the reported errors, or use `to_backend_ir_for_tooling`")
    )]
    ProgramHasErrors { count: usize },

    #[error("internal compiler error: lowered code is not reference-count balanced ({} finding(s))", .imbalances.len())]
    #[diagnostic(code(ember::backend_ir::refcount))]
    ReferenceCountImbalance { imbalances: Vec<RefCountImbalance> },
}

pub struct SemanticAnalyzer {
    config: SemaConfig,
}

impl SemanticAnalyzer {
    pub fn new(config: SemaConfig) -> Self {
        Self { config }
    }

    /// Analyzes `modules` together with the built-in core package. Every
    /// module sees every other one; the order of `modules` does not matter.
    #[tracing::instrument(skip_all, fields(modules = modules.len()))]
    pub fn analyze(&self, modules: &[Module]) -> AnalysisResult {
        let software = Context::software(self.config.clone());
        let core = bind_core_package(&software);
        let mut bound = vec![core];
        bound.extend(modules.iter().map(|m| BoundModule::new(&software, m)));

        for module in &bound {
            module.link();
        }
        let phase1 = run_phase("phase1", &bound, |m| m.phase1());
        let phase2 = run_phase("phase2", &bound, |m| m.phase2());
        let phase3 = run_phase("phase3", &bound, |m| m.phase3());

        let mut diagnostics = Diagnostics::new();
        diagnostics.extend(collect(vec![phase1, phase2, phase3]));
        if let Some(limit) = self.config.max_reported_diagnostics {
            diagnostics.truncate(limit);
        }
        tracing::debug!(diagnostics = diagnostics.len(), "analysis finished");

        AnalysisResult {
            config: self.config.clone(),
            software,
            modules: bound,
            diagnostics,
            ir: OnceCell::new(),
        }
    }
}

impl Default for SemanticAnalyzer {
    fn default() -> Self {
        Self::new(SemaConfig::default())
    }
}

fn run_phase(name: &str, modules: &[Rc<BoundModule>], phase: impl Fn(&BoundModule) -> Vec<Diagnostic>) -> Vec<Diagnostic> {
    let span = tracing::debug_span!("phase", phase = name);
    let _entered = span.enter();
    collect(modules.iter().map(|m| phase(&**m)))
}

pub struct AnalysisResult {
    config: SemaConfig,
    software: Rc<Context>,
    modules: Vec<Rc<BoundModule>>,
    diagnostics: Diagnostics,
    ir: OnceCell<IrSoftwareContext>,
}

impl AnalysisResult {
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Errors, plus warnings when `deny_warnings` is set.
    pub fn error_count(&self) -> usize {
        let threshold = if self.config.deny_warnings {
            Severity::Warning
        } else {
            Severity::Error
        };
        self.diagnostics.iter().filter(|d| d.severity >= threshold).count()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// The bound modules, the core package first.
    pub fn modules(&self) -> &[Rc<BoundModule>] {
        &self.modules
    }

    pub fn software_context(&self) -> &Rc<Context> {
        &self.software
    }

    /// Lowers the program for a backend. Refuses programs with errors and,
    /// when configured, lowered code the reference-count verifier rejects.
    pub fn to_backend_ir(&self) -> Result<&IrSoftwareContext, BackendIrError> {
        let count = self.error_count();
        if count > 0 {
            return Err(BackendIrError::ProgramHasErrors { count });
        }
        let ir = self.lowered();
        if self.config.verify_reference_counts {
            let imbalances = verify_reference_counts(ir);
            if !imbalances.is_empty() {
                for imbalance in &imbalances {
                    tracing::error!(%imbalance, "reference count imbalance");
                }
                return Err(BackendIrError::ReferenceCountImbalance { imbalances });
            }
        }
        Ok(ir)
    }

    /// Lowers whatever could be analyzed, errors or not. Unresolved parts
    /// lower to placeholders; the result is meant for inspection only.
    pub fn to_backend_ir_for_tooling(&self) -> &IrSoftwareContext {
        self.lowered()
    }

    #[tracing::instrument(skip_all)]
    fn lowered(&self) -> &IrSoftwareContext {
        self.ir.get_or_init(|| IrSoftwareContext {
            packages: self.modules.iter().map(|m| m.to_backend_ir()).collect(),
        })
    }
}
