//! Static checks over policy code.
//!
//! [`analyze`] is the shared name/allow-list pass: the sandbox runs it before
//! executing anything, and [`lint`] runs it with the stricter authoring rules
//! and renders the findings as diagnostics.

use std::collections::{BTreeSet, HashMap};

use crate::allowlist::{self, DEFAULT_PLATFORMS};
use crate::ast::{Expr, ExprKind, Stmt, StmtKind, Target};
use crate::error::ScriptError;
use crate::parser::parse;
use crate::stage::Stage;
use crate::visit::{walk_body, walk_expr, walk_stmt, walk_target, Bindings, Visitor};

const PRIVATE_ATTRIBUTE_MESSAGE: &str = "access to private attributes is not allowed.";
const ATTRIBUTE_ASSIGNMENT_MESSAGE: &str = "assigning to attributes is not allowed.";
const METHOD_ERROR_MESSAGE: &str =
    "method cannot be called because it is not in the list of whitelisted methods.";
const SENTINEL_STAGE_MESSAGE: &str = "result sentinels can only be used in the check stage.";

/// What the analysis accepts beyond the fixed allow-lists.
#[derive(Debug, Clone)]
pub struct Rules {
    /// Argument names of the implicit stage function.
    pub arguments: Vec<String>,
    /// Whether `PASSED`, `FAILED` and `PROPOSED` resolve.
    pub sentinels: bool,
    /// Reject method calls whose name no known object type provides.
    pub known_methods_only: bool,
}

/// Run the name and allow-list checks over a parsed stage body.
pub fn analyze(program: &[Stmt], rules: &Rules) -> Vec<ScriptError> {
    let bindings = Bindings::of(program);
    let mut modules: HashMap<String, String> = allowlist::MODULES
        .iter()
        .map(|(m, _)| (m.to_string(), m.to_string()))
        .collect();
    for (binding, module) in &bindings.imports {
        if allowlist::module(module).is_some() {
            modules.insert(binding.clone(), module.clone());
        }
    }
    modules.retain(|binding, _| {
        !bindings.assigned.contains(binding) && !rules.arguments.iter().any(|a| a == binding)
    });

    let mut a = Analyzer {
        rules,
        assigned: &bindings.assigned,
        modules,
        errors: Vec::new(),
    };
    walk_body(&mut a, program);
    a.errors
}

struct Analyzer<'a> {
    rules: &'a Rules,
    assigned: &'a BTreeSet<String>,
    modules: HashMap<String, String>,
    errors: Vec<ScriptError>,
}

impl Analyzer<'_> {
    fn defined(&self, name: &str) -> bool {
        self.rules.arguments.iter().any(|a| a == name)
            || self.assigned.contains(name)
            || self.modules.contains_key(name)
            || allowlist::is_builtin(name)
            || (self.rules.sentinels && allowlist::sentinel_value(name).is_some())
    }

    fn module_of(&self, expr: &Expr) -> Option<&str> {
        match &expr.kind {
            ExprKind::Name(n) => self.modules.get(n).map(|m| m.as_str()),
            _ => None,
        }
    }

    fn report(&mut self, line: u32, code: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ScriptError::violation(line, code, message));
    }

    fn undefined(&mut self, name: &str, line: u32) {
        if allowlist::sentinel_value(name).is_some() {
            self.report(line, name, SENTINEL_STAGE_MESSAGE);
        } else {
            self.report(line, name, format!("name '{}' is not defined.", name));
        }
    }
}

impl Visitor for Analyzer<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(names) => {
                for n in names {
                    if allowlist::module(&n.module).is_none() {
                        self.report(stmt.line, n.module.clone(), allowlist::IMPORT_ERROR_MESSAGE);
                    }
                }
            }
            StmtKind::ImportFrom { module, .. } => {
                self.report(
                    stmt.line,
                    module.clone(),
                    allowlist::DISALLOW_FROM_IMPORT_ERROR_MESSAGE,
                );
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_target(&mut self, target: &Target, line: u32) {
        if let Target::Attribute { attr, .. } = target {
            self.report(line, attr.clone(), ATTRIBUTE_ASSIGNMENT_MESSAGE);
        }
        walk_target(self, target, line);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(n) => {
                if !self.defined(n) {
                    self.undefined(n, expr.line);
                }
            }
            ExprKind::Call { func, args, kwargs } => {
                match &func.kind {
                    ExprKind::Name(n) if !self.defined(n) => {
                        if allowlist::sentinel_value(n).is_some() {
                            self.undefined(n, func.line);
                        } else {
                            self.report(
                                func.line,
                                n.clone(),
                                allowlist::FUNCTION_BUILTIN_ERROR_MESSAGE,
                            );
                        }
                        for a in args {
                            self.visit_expr(a);
                        }
                        for (_, a) in kwargs {
                            self.visit_expr(a);
                        }
                        return;
                    }
                    ExprKind::Attribute { value, attr }
                        if self.rules.known_methods_only
                            && self.module_of(value).is_none()
                            && !attr.starts_with('_')
                            && !allowlist::is_known_method(attr) =>
                    {
                        self.report(func.line, attr.clone(), METHOD_ERROR_MESSAGE);
                    }
                    _ => {}
                }
                walk_expr(self, expr);
            }
            ExprKind::Attribute { value, attr } => {
                if attr.starts_with('_') {
                    self.report(expr.line, attr.clone(), PRIVATE_ATTRIBUTE_MESSAGE);
                } else if let Some(module) = self.module_of(value) {
                    if !allowlist::module_allows(module, attr) {
                        let code = format!("{}.{}", module, attr);
                        self.report(expr.line, code, allowlist::FUNCTION_MODULE_ERROR_MESSAGE);
                    }
                }
                walk_expr(self, expr);
            }
            _ => walk_expr(self, expr),
        }
    }
}

// ──────────────────────────────────────────────
// Linter
// ──────────────────────────────────────────────

/// Inputs to [`lint_with`].
#[derive(Debug, Clone)]
pub struct LintOptions {
    pub stage: Stage,
    /// Platform handle names the community has connected.
    pub platforms: Vec<String>,
}

impl LintOptions {
    pub fn new(stage: Stage) -> Self {
        LintOptions {
            stage,
            platforms: DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_platforms<S: Into<String>>(mut self, platforms: impl IntoIterator<Item = S>) -> Self {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }
}

/// Lint one stage body against the default platform set. An empty result
/// means the code is clean.
pub fn lint(source: &str, stage: Stage) -> Vec<String> {
    lint_with(source, &LintOptions::new(stage))
}

pub fn lint_with(source: &str, opts: &LintOptions) -> Vec<String> {
    let program = match parse(source) {
        Ok(p) => p,
        Err(e) => return vec![e.diagnostic()],
    };
    let rules = Rules {
        arguments: opts.stage.arguments(&opts.platforms),
        sentinels: opts.stage == Stage::Check,
        known_methods_only: true,
    };
    let mut seen = BTreeSet::new();
    analyze(&program, &rules)
        .into_iter()
        .map(|e| e.diagnostic())
        .filter(|d| seen.insert(d.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_check_stage() {
        let src = "if len(proposal.data.get('yes', [])) > 2:\n  return PASSED\nreturn PROPOSED";
        assert!(lint(src, Stage::Check).is_empty());
    }

    #[test]
    fn top_level_return_is_legal() {
        assert!(lint("return True", Stage::Filter).is_empty());
    }

    #[test]
    fn rejects_unlisted_import() {
        let diags = lint("import os\nreturn True", Stage::Filter);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0], format!("line 1: os: {}", allowlist::IMPORT_ERROR_MESSAGE));
    }

    #[test]
    fn rejects_from_import() {
        let diags = lint("from math import floor", Stage::Check);
        assert!(diags[0].contains(allowlist::DISALLOW_FROM_IMPORT_ERROR_MESSAGE));
    }

    #[test]
    fn rejects_unlisted_builtin_call() {
        let diags = lint("open('/etc/passwd')", Stage::Notify);
        assert_eq!(
            diags,
            vec![format!("line 1: open: {}", allowlist::FUNCTION_BUILTIN_ERROR_MESSAGE)]
        );
    }

    #[test]
    fn rejects_unlisted_module_function() {
        let diags = lint("import math\nx = math.system('ls')", Stage::Check);
        assert_eq!(
            diags,
            vec![format!("line 2: math.system: {}", allowlist::FUNCTION_MODULE_ERROR_MESSAGE)]
        );
    }

    #[test]
    fn aliased_import_is_tracked() {
        assert!(lint("import datetime as dt\nx = dt.now()", Stage::Check).is_empty());
        assert_eq!(lint("import re as r\nr.compile('x')", Stage::Check).len(), 1);
    }

    #[test]
    fn sentinels_only_in_check() {
        let diags = lint("return PASSED", Stage::Success);
        assert_eq!(diags, vec![format!("line 1: PASSED: {}", SENTINEL_STAGE_MESSAGE)]);
        assert!(lint("return FAILED", Stage::Check).is_empty());
    }

    #[test]
    fn private_attributes_and_attribute_assignment() {
        let diags = lint("x = action.__class__\naction.executed = True", Stage::Success);
        assert_eq!(diags.len(), 2);
        assert!(diags[0].starts_with("line 1: __class__:"));
        assert!(diags[1].starts_with("line 2: executed:"));
    }

    #[test]
    fn unknown_method_names() {
        let diags = lint("action.delete_everything()", Stage::Success);
        assert_eq!(diags, vec![format!("line 1: delete_everything: {}", METHOD_ERROR_MESSAGE)]);
        assert!(lint("slack.post_message(text='hi')", Stage::Notify).is_empty());
    }

    #[test]
    fn platform_names_follow_options() {
        let opts = LintOptions::new(Stage::Notify).with_platforms(["matrix"]);
        assert!(lint_with("matrix.make_call('x', {})", &opts).is_empty());
        assert_eq!(lint_with("slack.make_call('x', {})", &opts).len(), 1);
    }

    #[test]
    fn metagov_is_not_available_in_filter() {
        assert_eq!(lint("metagov.get_process()", Stage::Filter).len(), 1);
        assert!(lint("metagov.get_process()", Stage::Check).is_empty());
    }

    #[test]
    fn undefined_names_are_reported_once() {
        let diags = lint("x = y + y", Stage::Check);
        assert_eq!(diags, vec!["line 1: y: name 'y' is not defined.".to_string()]);
    }

    #[test]
    fn syntax_errors_become_diagnostics() {
        let diags = lint("if x\n  return 1", Stage::Check);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].starts_with("line 1: SyntaxError:"));
    }

    #[test]
    fn forbidden_constructs_carry_their_keyword() {
        let diags = lint("def f():\n  return 1", Stage::Check);
        assert!(diags[0].starts_with("line 1: def:"));
    }
}
