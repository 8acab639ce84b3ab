#![forbid(unsafe_code)]

//! Executable IR handed to code generation backends.

pub mod ir;
mod print;
pub mod refcount;

pub use ir::*;
pub use refcount::{
    ExitSite, RefCountImbalance, verify_function, verify_package, verify_reference_counts,
};
