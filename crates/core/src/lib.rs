//! polity-core: policy-script front end.
//!
//! Lexes and parses the statement language policy authors write for each
//! stage, and statically checks it against the allow-lists shared with the
//! sandbox.
//!
//! # Public API
//!
//! - [`parse()`] -- source text to statements
//! - [`lint()`] / [`lint_with()`] -- authoring-time diagnostics
//! - [`analyze()`] -- the name and allow-list pass the sandbox runs before execution
//! - [`Stage`] -- the six stage slots and the names each one binds
//! - [`ScriptError`] -- lex, parse, violation and runtime errors

pub mod allowlist;
pub mod ast;
pub mod error;
pub mod lexer;
pub mod lint;
pub mod parser;
pub mod stage;
pub mod visit;

// ── Convenience re-exports ───────────────────────────────────────────

pub use error::{ErrorClass, ScriptError};
pub use lint::{analyze, lint, lint_with, LintOptions, Rules};
pub use parser::parse;
pub use stage::Stage;
