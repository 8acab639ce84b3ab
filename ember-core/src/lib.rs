#![forbid(unsafe_code)]

/// Aborts on a broken compiler invariant. Never used for problems in the
/// analyzed program; those become [`Diagnostic`]s.
macro_rules! ice {
    ($($arg:tt)*) => {
        panic!("internal compiler error: {}", format_args!($($arg)*))
    };
}

mod analyzer;
pub mod binder;
mod builtins;
mod config;
pub mod context;
mod diagnostic;
mod effects;
mod lower;
mod overload;
pub mod types;

pub use analyzer::{AnalysisResult, BackendIrError, SemanticAnalyzer};
pub use builtins::{CORE_PACKAGE, CoreTypes};
pub use config::{ConfigError, SemaConfig};
pub use diagnostic::{Diagnostic, DiagnosticKind, Diagnostics, Severity};
pub use effects::Purity;
pub use types::{BoundType, Mutability, TypeUnification};
