//! Embedded script support.
//!
//! Plugin scripts are collected from disk by the [`ScriptLoader`], wrapped
//! and compiled by the [`ScriptEngine`], and called with a per-invocation
//! `msg` table built from the execution context.

pub mod api;
pub mod engine;
pub mod literal;
pub mod loader;
pub mod wrapper;

pub use api::DiceApi;
pub use engine::{Interpreter, ResourceLimits, ScriptEngine};
pub use literal::{parse_embedded_literal, to_embedded_table};
pub use loader::{ScanResult, ScriptDialect, ScriptLoader, ScriptUnit};
