//! Tree-walking interpreter for one stage body.
//!
//! The body is run as if it were a function whose parameters are the bound
//! arguments; `return` ends the run and supplies its result.

use std::collections::HashMap;

use polity_core::allowlist;
use polity_core::ast::{BinOp, CmpOp, Expr, ExprKind, Stmt, StmtKind, Target};
use polity_core::Stage;

use crate::limits::Limits;
use crate::ops;
use crate::value::{dismantle, py_cmp, py_eq, py_is, BoundMethod, CallArgs, Dict, Key, RuntimeError, Value};

pub(crate) enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

pub struct Interpreter {
    pub(crate) stage: Stage,
    pub(crate) limits: Limits,
    locals: HashMap<String, Value>,
    ops: u64,
    line: u32,
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        for (_, value) in self.locals.drain() {
            dismantle(value);
        }
    }
}

impl Interpreter {
    pub fn new(stage: Stage, limits: Limits) -> Self {
        Interpreter {
            stage,
            limits,
            locals: HashMap::new(),
            ops: 0,
            line: 0,
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    /// Line of the statement being executed, or of the one that failed.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Operations performed so far.
    pub fn operations(&self) -> u64 {
        self.ops
    }

    pub fn run(&mut self, body: &[Stmt]) -> Result<Value, RuntimeError> {
        match self.exec_block(body)? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::None),
            Flow::Break | Flow::Continue => Err(RuntimeError::new(
                "SyntaxError",
                "'break' or 'continue' outside loop",
            )),
        }
    }

    pub(crate) fn tick(&mut self) -> Result<(), RuntimeError> {
        self.ops += 1;
        if self.ops > self.limits.max_operations {
            return Err(RuntimeError::limit(format!(
                "operation budget of {} exhausted",
                self.limits.max_operations
            )));
        }
        Ok(())
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, RuntimeError> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, RuntimeError> {
        self.line = stmt.line;
        self.tick()?;
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.eval(e)?;
            }
            StmtKind::Assign { target, value } => {
                let v = self.eval(value)?;
                self.assign(target, v)?;
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = self.read_target(target)?;
                let rhs = self.eval(value)?;
                if let (BinOp::Add, Value::List(l)) = (op, &current) {
                    let extra = rhs.iter_items()?;
                    let mut l = l.borrow_mut();
                    self.limits.check_collection(l.len() + extra.len())?;
                    l.extend(extra);
                } else {
                    let updated = ops::binary(*op, &current, &rhs, &self.limits)?;
                    self.assign(target, updated)?;
                }
            }
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    self.line = cond.line;
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::For { target, iter, body } => {
                let items = self.eval(iter)?.iter_items()?;
                for item in items {
                    self.tick()?;
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::While { cond, body } => loop {
                self.line = stmt.line;
                self.tick()?;
                if !self.eval(cond)?.truthy() {
                    break;
                }
                match self.exec_block(body)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            StmtKind::Return(e) => {
                let v = match e {
                    Some(e) => self.eval(e)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(v));
            }
            StmtKind::Raise(e) => {
                let raised = match e {
                    Some(e) => self.eval(e)?,
                    None => {
                        return Err(RuntimeError::new(
                            "RuntimeError",
                            "No active exception to reraise",
                        ))
                    }
                };
                return Err(raise(raised));
            }
            StmtKind::Import(names) => {
                for n in names {
                    let module = allowlist::MODULES
                        .iter()
                        .find(|(m, _)| *m == n.module)
                        .map(|(m, _)| *m)
                        .ok_or_else(|| {
                            RuntimeError::new("ImportError", allowlist::IMPORT_ERROR_MESSAGE)
                        })?;
                    self.bind(n.binding(), Value::Module(module));
                }
            }
            StmtKind::ImportFrom { .. } => {
                return Err(RuntimeError::new(
                    "ImportError",
                    allowlist::DISALLOW_FROM_IMPORT_ERROR_MESSAGE,
                ));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), RuntimeError> {
        match target {
            Target::Name(n) => {
                if let Some(old) = self.locals.insert(n.clone(), value) {
                    dismantle(old);
                }
                Ok(())
            }
            Target::Subscript { value: container, index } => {
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(RuntimeError::type_error("slice assignment is not supported"));
                }
                let c = self.eval(container)?;
                let i = self.eval(index)?;
                ops::set_item(&c, &i, value, &self.limits)
            }
            Target::Attribute { attr, .. } => Err(RuntimeError::attribute_error(format!(
                "cannot assign to attribute '{}'",
                attr
            ))),
            Target::Tuple(targets) => {
                let items = value.iter_items()?;
                if items.len() < targets.len() {
                    return Err(RuntimeError::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                if items.len() > targets.len() {
                    return Err(RuntimeError::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (t, v) in targets.iter().zip(items) {
                    self.assign(t, v)?;
                }
                Ok(())
            }
        }
    }

    fn read_target(&mut self, target: &Target) -> Result<Value, RuntimeError> {
        match target {
            Target::Name(n) => self.lookup(n),
            Target::Subscript { value, index } => {
                let c = self.eval(value)?;
                let i = self.eval(index)?;
                ops::get_item(&c, &i)
            }
            Target::Attribute { value, attr } => {
                let v = self.eval(value)?;
                self.attribute(&v, attr)
            }
            Target::Tuple(_) => Err(RuntimeError::new(
                "SyntaxError",
                "illegal expression for augmented assignment",
            )),
        }
    }

    // ── Expressions ──────────────────────────────────────────────────────

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        match &expr.kind {
            ExprKind::None => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::List(items) => {
                self.limits.check_collection(items.len())?;
                let items = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::list(items))
            }
            ExprKind::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::tuple(items))
            }
            ExprKind::Dict(entries) => {
                self.limits.check_collection(entries.len())?;
                let mut d = Dict::new();
                for (k, v) in entries {
                    let key = Key::from_value(&self.eval(k)?)?;
                    let value = self.eval(v)?;
                    d.insert(key, value);
                }
                Ok(Value::dict(d))
            }
            ExprKind::Name(n) => self.lookup(n),
            ExprKind::Attribute { value, attr } => {
                let v = self.eval(value)?;
                self.attribute(&v, attr)
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let lower = self.slice_bound(lower.as_deref())?;
                    let upper = self.slice_bound(upper.as_deref())?;
                    let step = self.slice_bound(step.as_deref())?;
                    return ops::slice(&container, lower, upper, step);
                }
                let i = self.eval(index)?;
                ops::get_item(&container, &i)
            }
            ExprKind::Slice { .. } => Err(RuntimeError::new(
                "SyntaxError",
                "slice used outside a subscript",
            )),
            ExprKind::Call { func, args, kwargs } => {
                let f = self.eval(func)?;
                let mut call = CallArgs::default();
                for a in args {
                    call.positional.push(self.eval(a)?);
                }
                for (k, a) in kwargs {
                    call.keywords.push((k.clone(), self.eval(a)?));
                }
                self.call(&f, call)
            }
            ExprKind::Unary { op, operand } => {
                let v = self.eval(operand)?;
                ops::unary(*op, &v)
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                ops::binary(*op, &l, &r, &self.limits)
            }
            ExprKind::Compare { left, ops: chain } => {
                let mut l = self.eval(left)?;
                for (op, right) in chain {
                    let r = self.eval(right)?;
                    if !compare(*op, &l, &r)? {
                        return Ok(Value::Bool(false));
                    }
                    l = r;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::And(a, b) => {
                let l = self.eval(a)?;
                if !l.truthy() {
                    return Ok(l);
                }
                self.eval(b)
            }
            ExprKind::Or(a, b) => {
                let l = self.eval(a)?;
                if l.truthy() {
                    return Ok(l);
                }
                self.eval(b)
            }
            ExprKind::IfExp { cond, body, orelse } => {
                if self.eval(cond)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            ExprKind::ListComp {
                elt,
                target,
                iter,
                cond,
            } => {
                let items = self.eval(iter)?.iter_items()?;
                let mut out = Vec::new();
                for item in items {
                    self.tick()?;
                    self.assign(target, item)?;
                    if let Some(c) = cond {
                        if !self.eval(c)?.truthy() {
                            continue;
                        }
                    }
                    out.push(self.eval(elt)?);
                    self.limits.check_collection(out.len())?;
                }
                Ok(Value::list(out))
            }
        }
    }

    fn slice_bound(&mut self, e: Option<&Expr>) -> Result<Option<i64>, RuntimeError> {
        match e {
            None => Ok(None),
            Some(e) => match self.eval(e)? {
                Value::None => Ok(None),
                v => Ok(Some(v.expect_int("slice indices")?)),
            },
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(v) = self.locals.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = allowlist::sentinel_value(name) {
            return Ok(Value::Str(v.to_owned()));
        }
        if let Some(b) = allowlist::BUILTINS
            .iter()
            .chain(allowlist::EXCEPTIONS)
            .find(|b| **b == name)
        {
            return Ok(Value::Builtin(*b));
        }
        if let Some((m, _)) = allowlist::MODULES.iter().find(|(m, _)| *m == name) {
            return Ok(Value::Module(*m));
        }
        Err(RuntimeError::name_error(format!("name '{}' is not defined", name)))
    }

    pub(crate) fn attribute(&mut self, v: &Value, attr: &str) -> Result<Value, RuntimeError> {
        let missing = || {
            RuntimeError::attribute_error(format!(
                "'{}' object has no attribute '{}'",
                v.type_name(),
                attr
            ))
        };
        if attr.starts_with('_') {
            return Err(missing());
        }
        let method = || -> Result<Value, RuntimeError> {
            Ok(Value::Method(std::rc::Rc::new(BoundMethod {
                receiver: v.clone(),
                name: attr.to_owned(),
            })))
        };
        match v {
            Value::Object(o) => {
                if let Some(a) = o.get_attr(attr) {
                    Ok(a)
                } else if o.has_method(attr) {
                    method()
                } else {
                    Err(missing())
                }
            }
            Value::Module(m) => self.module_attr(m, attr),
            Value::Str(_) if allowlist::STRING_METHODS.contains(&attr) => method(),
            Value::List(_) if allowlist::LIST_METHODS.contains(&attr) => method(),
            Value::Dict(_) if allowlist::DICT_METHODS.contains(&attr) => method(),
            Value::DateTime(_) | Value::Duration(_) => self.temporal_attr(v, attr).or_else(|_| {
                if matches!(attr, "isoformat" | "timestamp" | "total_seconds") {
                    method()
                } else {
                    Err(missing())
                }
            }),
            Value::Exception(e) if attr == "message" => Ok(Value::Str(e.message.clone())),
            _ => Err(missing()),
        }
    }

    pub(crate) fn call(&mut self, func: &Value, args: CallArgs) -> Result<Value, RuntimeError> {
        self.tick()?;
        match func {
            Value::Builtin(name) => self.call_builtin(name, args),
            Value::ModuleFn { module, name } => self.call_module_fn(module, name, args),
            Value::Method(m) => match &m.receiver {
                Value::Object(o) => o.call_method(&m.name, args),
                Value::Str(s) => self.str_method(s, &m.name, args),
                Value::List(_) => self.list_method(&m.receiver, &m.name, args),
                Value::Dict(_) => self.dict_method(&m.receiver, &m.name, args),
                Value::DateTime(_) | Value::Duration(_) => {
                    self.temporal_method(&m.receiver, &m.name, args)
                }
                other => Err(RuntimeError::attribute_error(format!(
                    "'{}' object has no attribute '{}'",
                    other.type_name(),
                    m.name
                ))),
            },
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => py_eq(a, b)?,
        CmpOp::Neq => !py_eq(a, b)?,
        CmpOp::Lt => py_cmp(a, b)? == Less,
        CmpOp::Lte => py_cmp(a, b)? != Greater,
        CmpOp::Gt => py_cmp(a, b)? == Greater,
        CmpOp::Gte => py_cmp(a, b)? != Less,
        CmpOp::In => ops::contains(b, a)?,
        CmpOp::NotIn => !ops::contains(b, a)?,
        CmpOp::Is => py_is(a, b),
        CmpOp::IsNot => !py_is(a, b),
    })
}

/// Turn a raised value into the error that ends the run.
fn raise(v: Value) -> RuntimeError {
    match v {
        Value::Exception(e) => RuntimeError::new(e.kind.clone(), e.message.clone()),
        Value::Builtin(name) if allowlist::EXCEPTIONS.contains(&name) => {
            RuntimeError::new(name, "")
        }
        other => RuntimeError::type_error(format!(
            "exceptions must derive from BaseException, not {}",
            other.type_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polity_core::parse;

    fn run(src: &str) -> Result<Value, RuntimeError> {
        let prog = parse(src).unwrap();
        Interpreter::new(Stage::Check, Limits::default()).run(&prog)
    }

    #[test]
    fn falls_off_the_end_with_none() {
        assert_eq!(run("x = 1").unwrap(), Value::None);
    }

    #[test]
    fn loops_and_accumulators() {
        let src = "total = 0\nfor i in range(10):\n  if i % 2 == 0:\n    continue\n  total += i\nreturn total";
        assert_eq!(run(src).unwrap(), Value::Int(25));
    }

    #[test]
    fn while_with_break() {
        let src = "n = 0\nwhile True:\n  n += 1\n  if n >= 5:\n    break\nreturn n";
        assert_eq!(run(src).unwrap(), Value::Int(5));
    }

    #[test]
    fn tuple_unpacking_and_dict_iteration() {
        let src = "d = {'a': 1, 'b': 2}\nout = []\nfor k, v in d.items():\n  out.append(k + str(v))\nreturn out";
        assert_eq!(
            run(src).unwrap(),
            Value::list(vec![Value::from("a1"), Value::from("b2")])
        );
    }

    #[test]
    fn chained_comparison_short_circuits() {
        assert_eq!(run("return 1 < 2 < 3").unwrap(), Value::Bool(true));
        assert_eq!(run("return 3 < 2 < 'x'").unwrap(), Value::Bool(false));
    }

    #[test]
    fn boolean_operators_return_operands() {
        assert_eq!(run("return [] or 'fallback'").unwrap(), Value::from("fallback"));
        assert_eq!(run("return 0 and 1").unwrap(), Value::Int(0));
    }

    #[test]
    fn comprehension_with_condition() {
        let src = "return [x * x for x in range(6) if x % 2 == 1]";
        assert_eq!(
            run(src).unwrap(),
            Value::list(vec![Value::Int(1), Value::Int(9), Value::Int(25)])
        );
    }

    #[test]
    fn sentinels_resolve_to_status_strings() {
        assert_eq!(run("return PASSED").unwrap(), Value::from("passed"));
    }

    #[test]
    fn raise_carries_kind_and_message() {
        let err = run("raise ValueError('bad input')").unwrap_err();
        assert_eq!(err.kind, "ValueError");
        assert_eq!(err.message, "bad input");
    }

    #[test]
    fn infinite_loops_exhaust_the_budget() {
        let prog = parse("while True:\n  pass").unwrap();
        let mut it = Interpreter::new(
            Stage::Check,
            Limits {
                max_operations: 500,
                ..Limits::default()
            },
        );
        let err = it.run(&prog).unwrap_err();
        assert_eq!(err.kind, "ResourceLimitError");
        assert!(it.operations() > 500);
    }

    #[test]
    fn error_line_is_the_failing_statement() {
        let prog = parse("x = 1\ny = 2\nz = x / 0").unwrap();
        let mut it = Interpreter::new(Stage::Check, Limits::default());
        let err = it.run(&prog).unwrap_err();
        assert_eq!(err.kind, "ZeroDivisionError");
        assert_eq!(it.line(), 3);
    }

    #[test]
    fn list_plus_equals_extends_in_place() {
        let src = "a = [1]\nb = a\na += [2]\nreturn b";
        assert_eq!(run(src).unwrap(), Value::list(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn unpack_mismatch() {
        let err = run("a, b = [1, 2, 3]").unwrap_err();
        assert!(err.message.contains("too many values"));
    }
}
