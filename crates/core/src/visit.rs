//! Read-only AST traversal.
//!
//! Implement `Visitor` and override the hooks you need; call the matching
//! `walk_*` function from an override to keep descending.

use std::collections::BTreeSet;

use crate::ast::{Expr, ExprKind, Stmt, StmtKind, Target};

pub trait Visitor {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_target(&mut self, target: &Target, line: u32) {
        walk_target(self, target, line);
    }
}

pub fn walk_body<V: Visitor + ?Sized>(v: &mut V, body: &[Stmt]) {
    for stmt in body {
        v.visit_stmt(stmt);
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(v: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Expr(e) => v.visit_expr(e),
        StmtKind::Assign { target, value } | StmtKind::AugAssign { target, value, .. } => {
            v.visit_expr(value);
            v.visit_target(target, stmt.line);
        }
        StmtKind::If { branches, orelse } => {
            for (cond, body) in branches {
                v.visit_expr(cond);
                walk_body(v, body);
            }
            walk_body(v, orelse);
        }
        StmtKind::For { target, iter, body } => {
            v.visit_expr(iter);
            v.visit_target(target, stmt.line);
            walk_body(v, body);
        }
        StmtKind::While { cond, body } => {
            v.visit_expr(cond);
            walk_body(v, body);
        }
        StmtKind::Return(e) | StmtKind::Raise(e) => {
            if let Some(e) = e {
                v.visit_expr(e);
            }
        }
        StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue => {}
    }
}

pub fn walk_target<V: Visitor + ?Sized>(v: &mut V, target: &Target, line: u32) {
    match target {
        Target::Name(_) => {}
        Target::Subscript { value, index } => {
            v.visit_expr(value);
            v.visit_expr(index);
        }
        Target::Attribute { value, .. } => v.visit_expr(value),
        Target::Tuple(items) => {
            for t in items {
                v.visit_target(t, line);
            }
        }
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::None
        | ExprKind::Bool(_)
        | ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_)
        | ExprKind::Name(_) => {}
        ExprKind::List(items) | ExprKind::Tuple(items) => {
            for e in items {
                v.visit_expr(e);
            }
        }
        ExprKind::Dict(entries) => {
            for (k, val) in entries {
                v.visit_expr(k);
                v.visit_expr(val);
            }
        }
        ExprKind::Attribute { value, .. } => v.visit_expr(value),
        ExprKind::Subscript { value, index } => {
            v.visit_expr(value);
            v.visit_expr(index);
        }
        ExprKind::Slice { lower, upper, step } => {
            for part in [lower, upper, step].into_iter().flatten() {
                v.visit_expr(part);
            }
        }
        ExprKind::Call { func, args, kwargs } => {
            v.visit_expr(func);
            for a in args {
                v.visit_expr(a);
            }
            for (_, a) in kwargs {
                v.visit_expr(a);
            }
        }
        ExprKind::Unary { operand, .. } => v.visit_expr(operand),
        ExprKind::Binary { left, right, .. } => {
            v.visit_expr(left);
            v.visit_expr(right);
        }
        ExprKind::Compare { left, ops } => {
            v.visit_expr(left);
            for (_, e) in ops {
                v.visit_expr(e);
            }
        }
        ExprKind::And(a, b) | ExprKind::Or(a, b) => {
            v.visit_expr(a);
            v.visit_expr(b);
        }
        ExprKind::IfExp { cond, body, orelse } => {
            v.visit_expr(cond);
            v.visit_expr(body);
            v.visit_expr(orelse);
        }
        ExprKind::ListComp {
            elt,
            target,
            iter,
            cond,
        } => {
            v.visit_expr(iter);
            v.visit_target(target, expr.line);
            if let Some(c) = cond {
                v.visit_expr(c);
            }
            v.visit_expr(elt);
        }
    }
}

// ──────────────────────────────────────────────
// Bound names
// ──────────────────────────────────────────────

/// Names a program binds, split by how they are bound.
#[derive(Debug, Default)]
pub struct Bindings {
    /// Assignment, loop and comprehension targets.
    pub assigned: BTreeSet<String>,
    /// Import bindings mapped to the module they name.
    pub imports: Vec<(String, String)>,
}

impl Bindings {
    pub fn of(program: &[Stmt]) -> Bindings {
        let mut b = Bindings::default();
        walk_body(&mut b, program);
        b
    }
}

impl Visitor for Bindings {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        if let StmtKind::Import(names) = &stmt.kind {
            for n in names {
                self.imports
                    .push((n.binding().to_owned(), n.module.clone()));
            }
        }
        walk_stmt(self, stmt);
    }

    fn visit_target(&mut self, target: &Target, line: u32) {
        if let Target::Name(n) = target {
            self.assigned.insert(n.clone());
        }
        walk_target(self, target, line);
    }
}
