//! Restricted execution of policy stage code.
//!
//! [`Sandbox::run`] treats a stage body as the body of a function whose
//! parameters are the supplied [`Arguments`]. The body is parsed and checked
//! against the allow-lists before anything runs; a violation is returned as
//! [`SandboxError::NotWhitelisted`] and no statement executes. Errors raised
//! while running become [`SandboxError::PolicyCode`], attributed to the stage.
//!
//! Host objects (the action, proposal, platform handles) are supplied through
//! the [`HostObject`] trait. Policy code can read their attributes and call
//! their methods but never assign to them.

pub mod error;
pub mod json;
pub mod limits;
pub mod ops;
pub mod value;

mod builtins;
mod interp;
mod methods;
mod modules;

use polity_core::ast::Stmt;
use polity_core::{analyze, parse, Rules, Stage};
use tracing::{debug, warn};

pub use error::SandboxError;
pub use interp::Interpreter;
pub use limits::Limits;
pub use value::{CallArgs, Dict, HostObject, Key, RuntimeError, Value};

/// Named values bound as the stage function's parameters, in order.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    entries: Vec<(String, Value)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Bind `name`, replacing an earlier binding of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: Limits,
}

impl Sandbox {
    pub fn new(limits: Limits) -> Self {
        Sandbox { limits }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Parse and check a stage body for the given parameter names.
    pub fn compile<S: AsRef<str>>(
        &self,
        source: &str,
        stage: Stage,
        names: &[S],
    ) -> Result<Vec<Stmt>, SandboxError> {
        let program = parse(source).map_err(|e| SandboxError::NotWhitelisted {
            stage,
            diagnostics: vec![e.diagnostic()],
        })?;
        let rules = Rules {
            arguments: names.iter().map(|n| n.as_ref().to_owned()).collect(),
            sentinels: true,
            known_methods_only: false,
        };
        let violations = analyze(&program, &rules);
        if !violations.is_empty() {
            let diagnostics: Vec<String> = violations.iter().map(|v| v.diagnostic()).collect();
            warn!(stage = %stage, diagnostics = ?diagnostics, "rejected non-whitelisted policy code");
            return Err(SandboxError::NotWhitelisted { stage, diagnostics });
        }
        Ok(program)
    }

    /// Compile and run a stage body, returning its `return` value or `None`.
    pub fn run(&self, source: &str, stage: Stage, args: &Arguments) -> Result<Value, SandboxError> {
        let names: Vec<&str> = args.names().collect();
        let program = self.compile(source, stage, &names)?;

        let mut interp = Interpreter::new(stage, self.limits);
        for (name, value) in &args.entries {
            interp.bind(name.clone(), value.clone());
        }
        match interp.run(&program) {
            Ok(v) if value::nests_deeper_than(&v, value::MAX_DEPTH) => {
                value::dismantle(v);
                let line = interp.line();
                let message = format!(
                    "RecursionError at line {} of {}: returned value nests more than {} levels deep",
                    line,
                    stage,
                    value::MAX_DEPTH
                );
                warn!(stage = %stage, line, "{}", message);
                Err(SandboxError::PolicyCode {
                    stage,
                    kind: "RecursionError".into(),
                    line,
                    message,
                })
            }
            Ok(v) => {
                debug!(stage = %stage, operations = interp.operations(), "stage code finished");
                Ok(v)
            }
            Err(e) => {
                let line = interp.line();
                let message = format!("{} at line {} of {}: {}", e.kind, line, stage, e.message);
                warn!(stage = %stage, line, kind = %e.kind, "{}", message);
                Err(SandboxError::PolicyCode {
                    stage,
                    kind: e.kind,
                    line,
                    message,
                })
            }
        }
    }
}
