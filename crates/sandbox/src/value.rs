//! Runtime values of the policy-script interpreter.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use time::{Duration, OffsetDateTime};

// ──────────────────────────────────────────────
// Errors raised while running
// ──────────────────────────────────────────────

/// A script-level exception: `kind` is the name policy code sees
/// (`TypeError`, `KeyError`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: String,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        RuntimeError::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        RuntimeError::new("ValueError", message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        RuntimeError::new("KeyError", message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        RuntimeError::new("IndexError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        RuntimeError::new("AttributeError", message)
    }

    pub fn name_error(message: impl Into<String>) -> Self {
        RuntimeError::new("NameError", message)
    }

    pub fn zero_division() -> Self {
        RuntimeError::new("ZeroDivisionError", "division by zero")
    }

    pub fn overflow() -> Self {
        RuntimeError::new("OverflowError", "integer overflow")
    }

    pub fn limit(message: impl Into<String>) -> Self {
        RuntimeError::new("ResourceLimitError", message)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RuntimeError {}

// ──────────────────────────────────────────────
// Host objects
// ──────────────────────────────────────────────

/// An object supplied by the embedder (the action, the proposal, a platform
/// handle, ...). Policy code can read its attributes and call its methods
/// but can never assign to it.
pub trait HostObject {
    fn type_name(&self) -> &str;

    /// Plain attribute read. `None` means the object has no such attribute.
    fn get_attr(&self, name: &str) -> Option<Value>;

    fn has_method(&self, name: &str) -> bool;

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError>;

    fn repr(&self) -> String {
        format!("<{}>", self.type_name())
    }
}

// ──────────────────────────────────────────────
// Call arguments
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>) -> Self {
        CallArgs {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The argument at `index`, or the keyword argument `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword(name))
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn require(&self, index: usize, name: &str, func: &str) -> Result<&Value, RuntimeError> {
        self.get(index, name).ok_or_else(|| {
            RuntimeError::type_error(format!("{}() missing required argument '{}'", func, name))
        })
    }

    pub fn at_most(&self, n: usize, func: &str) -> Result<(), RuntimeError> {
        if self.positional.len() > n {
            return Err(RuntimeError::type_error(format!(
                "{}() takes at most {} arguments ({} given)",
                func,
                n,
                self.positional.len()
            )));
        }
        Ok(())
    }

    pub fn no_keywords(&self, func: &str) -> Result<(), RuntimeError> {
        match self.keywords.first() {
            Some((k, _)) => Err(RuntimeError::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                func, k
            ))),
            None => Ok(()),
        }
    }
}

// ──────────────────────────────────────────────
// Dict keys and dicts
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Key {
    pub fn from_value(v: &Value) -> Result<Key, RuntimeError> {
        match v {
            Value::None => Ok(Key::None),
            Value::Bool(b) => Ok(Key::Bool(*b)),
            Value::Int(i) => Ok(Key::Int(*i)),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Key::Int(*f as i64)),
            Value::Str(s) => Ok(Key::Str(s.clone())),
            other => Err(RuntimeError::type_error(format!(
                "unhashable type: '{}'",
                other.type_name()
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Str(s) => Value::Str(s.clone()),
        }
    }

    /// Used when a dict is rendered as JSON.
    pub fn to_json_key(&self) -> String {
        match self {
            Key::None => "null".to_owned(),
            Key::Bool(b) => b.to_string(),
            Key::Int(i) => i.to_string(),
            Key::Str(s) => s.clone(),
        }
    }
}

/// Insertion-ordered mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dict {
    entries: Vec<(Key, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Dict::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Key, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.iter().map(|(k, _)| k)
    }
}

impl FromIterator<(Key, Value)> for Dict {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        let mut d = Dict::new();
        for (k, v) in iter {
            d.insert(k, v);
        }
        d
    }
}

// ──────────────────────────────────────────────
// Values
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub kind: String,
    pub message: String,
}

/// A method looked up on a value but not yet called.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    /// Always UTC.
    DateTime(OffsetDateTime),
    Duration(Duration),
    Object(Rc<dyn HostObject>),
    Module(&'static str),
    Builtin(&'static str),
    ModuleFn {
        module: &'static str,
        name: &'static str,
    },
    Method(Rc<BoundMethod>),
    Exception(Rc<Exception>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        py_eq(self, other).unwrap_or(false)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self {
        Value::dict(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(d: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(d)))
    }

    pub fn object<T: HostObject + 'static>(obj: T) -> Value {
        Value::Object(Rc::new(obj))
    }

    pub fn exception(kind: impl Into<String>, message: impl Into<String>) -> Value {
        Value::Exception(Rc::new(Exception {
            kind: kind.into(),
            message: message.into(),
        }))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Dict(_) => "dict".into(),
            Value::DateTime(_) => "datetime".into(),
            Value::Duration(_) => "timedelta".into(),
            Value::Object(o) => o.type_name().to_owned(),
            Value::Module(_) => "module".into(),
            Value::Builtin(_) | Value::ModuleFn { .. } => "builtin_function_or_method".into(),
            Value::Method(_) => "method".into(),
            Value::Exception(e) => e.kind.clone(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Duration(d) => !d.is_zero(),
            _ => true,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn expect_str(&self, what: &str) -> Result<&str, RuntimeError> {
        self.as_str().ok_or_else(|| {
            RuntimeError::type_error(format!("{} must be str, not {}", what, self.type_name()))
        })
    }

    pub fn expect_int(&self, what: &str) -> Result<i64, RuntimeError> {
        self.as_int().ok_or_else(|| {
            RuntimeError::type_error(format!("{} must be int, not {}", what, self.type_name()))
        })
    }

    pub fn expect_float(&self, what: &str) -> Result<f64, RuntimeError> {
        self.as_float().ok_or_else(|| {
            RuntimeError::type_error(format!(
                "{} must be a number, not {}",
                what,
                self.type_name()
            ))
        })
    }

    /// Snapshot of the items of an iterable.
    pub fn iter_items(&self) -> Result<Vec<Value>, RuntimeError> {
        match self {
            Value::List(l) => Ok(l.borrow().clone()),
            Value::Tuple(t) => Ok(t.as_ref().clone()),
            Value::Dict(d) => Ok(d.borrow().keys().map(Key::to_value).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// `str(v)`.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::DateTime(dt) => format_datetime(dt, ' '),
            Value::Exception(e) => e.message.clone(),
            other => other.repr(),
        }
    }

    /// `repr(v)`. Renderings longer than `REPR_BUDGET` bytes are cut short
    /// and end in `...`.
    pub fn repr(&self) -> String {
        let mut r = Render::new(REPR_BUDGET);
        self.render(&mut r);
        if r.truncated {
            r.out.push_str("...");
        }
        r.out
    }

    /// `str(v)` for policy code: a rendering longer than `max_len` bytes is
    /// a limit error rather than an allocation.
    pub fn display_within(&self, max_len: usize) -> Result<String, RuntimeError> {
        match self {
            Value::Str(_) | Value::DateTime(_) | Value::Exception(_) => Ok(self.to_display()),
            other => other.repr_within(max_len),
        }
    }

    /// `repr(v)`, failing once the rendering passes `max_len` bytes.
    pub fn repr_within(&self, max_len: usize) -> Result<String, RuntimeError> {
        let mut r = Render::new(max_len);
        self.render(&mut r);
        if r.truncated {
            return Err(RuntimeError::limit(format!(
                "string of more than {} bytes exceeds the limit",
                max_len
            )));
        }
        Ok(r.out)
    }

    fn render(&self, r: &mut Render) {
        if r.truncated {
            return;
        }
        match self {
            Value::List(l) => {
                let Some(items) = r.enter(Rc::as_ptr(l) as *const (), || l.try_borrow().ok()) else {
                    r.push("[...]");
                    return;
                };
                r.push("[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        r.push(", ");
                    }
                    item.render(r);
                    if r.truncated {
                        break;
                    }
                }
                r.push("]");
                r.leave();
            }
            Value::Tuple(t) => {
                if r.enter(Rc::as_ptr(t) as *const (), || Some(())).is_none() {
                    r.push("(...)");
                    return;
                }
                r.push("(");
                for (i, item) in t.iter().enumerate() {
                    if i > 0 {
                        r.push(", ");
                    }
                    item.render(r);
                    if r.truncated {
                        break;
                    }
                }
                r.push(if t.len() == 1 { ",)" } else { ")" });
                r.leave();
            }
            Value::Dict(d) => {
                let Some(entries) = r.enter(Rc::as_ptr(d) as *const (), || d.try_borrow().ok()) else {
                    r.push("{...}");
                    return;
                };
                r.push("{");
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        r.push(", ");
                    }
                    k.to_value().render(r);
                    r.push(": ");
                    v.render(r);
                    if r.truncated {
                        break;
                    }
                }
                r.push("}");
                r.leave();
            }
            other => {
                let flat = other.repr_scalar();
                r.push(&flat);
            }
        }
    }

    fn repr_scalar(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => repr_str(s),
            Value::DateTime(dt) => format!("datetime({})", format_datetime(dt, 'T')),
            Value::Duration(d) => format_duration(d),
            Value::Object(o) => o.repr(),
            Value::Module(m) => format!("<module '{}'>", m),
            Value::Builtin(b) => format!("<built-in function {}>", b),
            Value::ModuleFn { module, name } => format!("<built-in function {}.{}>", module, name),
            Value::Method(m) => format!("<method {} of {}>", m.name, m.receiver.type_name()),
            Value::Exception(e) => format!("{}({})", e.kind, repr_str(&e.message)),
            Value::List(_) => "[...]".into(),
            Value::Tuple(_) => "(...)".into(),
            Value::Dict(_) => "{...}".into(),
        }
    }
}

/// Deepest container nesting that rendering and comparison descend into.
pub const MAX_DEPTH: usize = 64;

/// Output ceiling of [`Value::repr`], which has no limits at hand.
const REPR_BUDGET: usize = 1 << 20;

/// Output buffer for `repr`. `open` holds the containers being rendered
/// further up; meeting one of them again, or nesting past `MAX_DEPTH`,
/// renders as `[...]`.
struct Render {
    out: String,
    open: Vec<*const ()>,
    budget: usize,
    truncated: bool,
}

impl Render {
    fn new(budget: usize) -> Self {
        Render {
            out: String::new(),
            open: Vec::new(),
            budget,
            truncated: false,
        }
    }

    fn push(&mut self, s: &str) {
        if self.truncated {
            return;
        }
        if self.out.len() + s.len() > self.budget {
            self.truncated = true;
            return;
        }
        self.out.push_str(s);
    }

    /// Mark `id` open and read its contents, or `None` if it is already
    /// open, too deep, or cannot be read.
    fn enter<T>(&mut self, id: *const (), read: impl FnOnce() -> Option<T>) -> Option<T> {
        if self.open.len() >= MAX_DEPTH || self.open.contains(&id) {
            return None;
        }
        let contents = read()?;
        self.open.push(id);
        Some(contents)
    }

    fn leave(&mut self) {
        self.open.pop();
    }
}

pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// ISO 8601 with the given date/time separator and a `+00:00` offset.
pub fn format_datetime(dt: &OffsetDateTime, sep: char) -> String {
    let mut s = format!(
        "{:04}-{:02}-{:02}{}{:02}:{:02}:{:02}",
        dt.year(),
        dt.month() as u8,
        dt.day(),
        sep,
        dt.hour(),
        dt.minute(),
        dt.second()
    );
    if dt.microsecond() != 0 {
        s.push_str(&format!(".{:06}", dt.microsecond()));
    }
    s.push_str("+00:00");
    s
}

fn format_duration(d: &Duration) -> String {
    let total = d.whole_seconds();
    let days = total.div_euclid(86_400);
    let rem = total.rem_euclid(86_400);
    let hms = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);
    match days {
        0 => hms,
        1 | -1 => format!("{} day, {}", days, hms),
        _ => format!("{} days, {}", days, hms),
    }
}

// ──────────────────────────────────────────────
// Equality and ordering
// ──────────────────────────────────────────────

pub fn py_eq(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    eq_at(a, b, 0)
}

fn eq_at(a: &Value, b: &Value, depth: usize) -> Result<bool, RuntimeError> {
    Ok(match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (
            Value::Int(_) | Value::Float(_) | Value::Bool(_),
            Value::Int(_) | Value::Float(_) | Value::Bool(_),
        ) => a.as_float() == b.as_float(),
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (peek(x)?, peek(y)?);
            seq_eq(&x, &y, depth)?
        }
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y) || seq_eq(x, y, depth)?,
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (peek(x)?, peek(y)?);
            if x.len() != y.len() {
                return Ok(false);
            }
            let depth = descend(depth)?;
            for (k, v) in x.iter() {
                match y.get(k) {
                    Some(w) if eq_at(v, w, depth)? => {}
                    _ => return Ok(false),
                }
            }
            true
        }
        (Value::DateTime(x), Value::DateTime(y)) => x == y,
        (Value::Duration(x), Value::Duration(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Module(x), Value::Module(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (
            Value::ModuleFn { module: m1, name: n1 },
            Value::ModuleFn { module: m2, name: n2 },
        ) => m1 == m2 && n1 == n2,
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        _ => false,
    })
}

/// Position of the first item equal to `item`.
pub fn py_index(items: &[Value], item: &Value) -> Result<Option<usize>, RuntimeError> {
    for (i, x) in items.iter().enumerate() {
        if py_eq(x, item)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn seq_eq(a: &[Value], b: &[Value], depth: usize) -> Result<bool, RuntimeError> {
    if a.len() != b.len() {
        return Ok(false);
    }
    let depth = descend(depth)?;
    for (x, y) in a.iter().zip(b) {
        if !eq_at(x, y, depth)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// One level further into nested containers, or a `RecursionError` past
/// `MAX_DEPTH`.
fn descend(depth: usize) -> Result<usize, RuntimeError> {
    if depth >= MAX_DEPTH {
        return Err(RuntimeError::new(
            "RecursionError",
            "maximum recursion depth exceeded in comparison",
        ));
    }
    Ok(depth + 1)
}

fn peek<T>(cell: &RefCell<T>) -> Result<std::cell::Ref<'_, T>, RuntimeError> {
    cell.try_borrow()
        .map_err(|_| RuntimeError::new("RuntimeError", "container changed size during comparison"))
}

/// Release `value` without recursing, so dropping a deeply nested list
/// cannot exhaust the stack. Containers still shared elsewhere are left
/// for their other owners.
pub(crate) fn dismantle(value: Value) {
    let mut pending = vec![value];
    while let Some(v) = pending.pop() {
        match v {
            Value::List(l) if Rc::strong_count(&l) == 1 => {
                if let Ok(mut items) = l.try_borrow_mut() {
                    pending.append(&mut items);
                }
            }
            Value::Tuple(t) => {
                if let Ok(items) = Rc::try_unwrap(t) {
                    pending.extend(items);
                }
            }
            Value::Dict(d) if Rc::strong_count(&d) == 1 => {
                if let Ok(mut d) = d.try_borrow_mut() {
                    pending.extend(std::mem::take(&mut d.entries).into_iter().map(|(_, v)| v));
                }
            }
            Value::Method(m) => {
                if let Ok(m) = Rc::try_unwrap(m) {
                    pending.push(m.receiver);
                }
            }
            _ => {}
        }
    }
}

/// Whether containers inside `v` nest more than `limit` levels deep. Each
/// container is walked once, so cycles terminate.
pub(crate) fn nests_deeper_than(v: &Value, limit: usize) -> bool {
    let mut seen: HashSet<*const ()> = HashSet::new();
    let mut pending: Vec<(Value, usize)> = vec![(v.clone(), 1)];
    while let Some((v, depth)) = pending.pop() {
        let (id, children) = match &v {
            Value::List(l) => (
                Rc::as_ptr(l) as *const (),
                l.try_borrow().map(|items| items.clone()).unwrap_or_default(),
            ),
            Value::Tuple(t) => (Rc::as_ptr(t) as *const (), t.as_ref().clone()),
            Value::Dict(d) => (
                Rc::as_ptr(d) as *const (),
                d.try_borrow()
                    .map(|d| d.entries.iter().map(|(_, v)| v.clone()).collect())
                    .unwrap_or_default(),
            ),
            _ => continue,
        };
        if depth > limit {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        pending.extend(children.into_iter().map(|c| (c, depth + 1)));
    }
    false
}

/// Identity, for `is`.
pub fn py_is(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y),
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Module(x), Value::Module(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => false,
    }
}

pub fn py_cmp(a: &Value, b: &Value) -> Result<Ordering, RuntimeError> {
    cmp_at(a, b, 0)
}

fn cmp_at(a: &Value, b: &Value, depth: usize) -> Result<Ordering, RuntimeError> {
    let unsupported = || {
        RuntimeError::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))
    };
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (
            Value::Int(_) | Value::Float(_) | Value::Bool(_),
            Value::Int(_) | Value::Float(_) | Value::Bool(_),
        ) => {
            let (x, y) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
            x.partial_cmp(&y).ok_or_else(unsupported)
        }
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(Ordering::Equal);
            }
            seq_cmp(&peek(x)?, &peek(y)?, depth)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y, depth),
        (Value::DateTime(x), Value::DateTime(y)) => Ok(x.cmp(y)),
        (Value::Duration(x), Value::Duration(y)) => Ok(x.cmp(y)),
        _ => Err(unsupported()),
    }
}

fn seq_cmp(a: &[Value], b: &[Value], depth: usize) -> Result<Ordering, RuntimeError> {
    let depth = descend(depth)?;
    for (x, y) in a.iter().zip(b) {
        if !eq_at(x, y, depth)? {
            return cmp_at(x, y, depth);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(py_eq(&Value::Int(1), &Value::Float(1.0)).unwrap());
        assert!(py_eq(&Value::Bool(true), &Value::Int(1)).unwrap());
        assert!(!py_eq(&Value::Str("1".into()), &Value::Int(1)).unwrap());
    }

    #[test]
    fn dict_equality_ignores_order() {
        let a: Dict = [(Key::Str("x".into()), Value::Int(1)), (Key::Str("y".into()), Value::Int(2))]
            .into_iter()
            .collect();
        let b: Dict = [(Key::Str("y".into()), Value::Int(2)), (Key::Str("x".into()), Value::Int(1))]
            .into_iter()
            .collect();
        assert_eq!(Value::dict(a), Value::dict(b));
    }

    #[test]
    fn dict_insert_replaces_in_place() {
        let mut d = Dict::new();
        d.insert(Key::Str("a".into()), Value::Int(1));
        d.insert(Key::Str("b".into()), Value::Int(2));
        d.insert(Key::Str("a".into()), Value::Int(3));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec![Key::Str("a".into()), Key::Str("b".into())]);
        assert_eq!(d.get(&Key::Str("a".into())), Some(&Value::Int(3)));
    }

    #[test]
    fn reprs() {
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::Str("it's".into()).repr(), "'it\\'s'");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(Value::list(vec![Value::None, Value::Bool(true)]).repr(), "[None, True]");
    }

    #[test]
    fn ordering_rejects_mixed_types() {
        assert!(py_cmp(&Value::Int(1), &Value::Str("a".into())).is_err());
        assert_eq!(
            py_cmp(&Value::Str("a".into()), &Value::Str("b".into())).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn float_keys_collapse_to_ints() {
        assert_eq!(Key::from_value(&Value::Float(3.0)).unwrap(), Key::Int(3));
        assert!(Key::from_value(&Value::Float(0.5)).is_err());
        assert!(Key::from_value(&Value::list(vec![])).is_err());
    }

    fn self_containing_list() -> (Value, Rc<RefCell<Vec<Value>>>) {
        let l = Rc::new(RefCell::new(Vec::new()));
        let v = Value::List(Rc::clone(&l));
        l.borrow_mut().push(v.clone());
        (v, l)
    }

    fn nested(levels: usize) -> Value {
        let mut v = Value::list(vec![]);
        for _ in 0..levels {
            v = Value::list(vec![v]);
        }
        v
    }

    #[test]
    fn cyclic_containers_render_an_ellipsis() {
        let (v, l) = self_containing_list();
        assert_eq!(v.repr(), "[[...]]");

        let mut d = Dict::new();
        d.insert(Key::Str("k".into()), Value::Int(1));
        let dict = Value::dict(d);
        if let Value::Dict(cell) = &dict {
            cell.borrow_mut().insert(Key::Str("me".into()), dict.clone());
        }
        assert_eq!(dict.repr(), "{'k': 1, 'me': {...}}");

        l.borrow_mut().clear();
    }

    #[test]
    fn deep_nesting_renders_to_a_fixed_depth() {
        let v = nested(10_000);
        let expected = format!("{}[...]{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        assert_eq!(v.repr(), expected);
        dismantle(v);
    }

    #[test]
    fn comparing_cycles_is_a_recursion_error() {
        let (a, la) = self_containing_list();
        let (b, lb) = self_containing_list();
        assert!(py_eq(&a, &a).unwrap());
        let err = py_eq(&a, &b).unwrap_err();
        assert_eq!(err.kind, "RecursionError");
        assert_eq!(py_cmp(&a, &b).unwrap_err().kind, "RecursionError");
        assert_ne!(a, b);
        la.borrow_mut().clear();
        lb.borrow_mut().clear();
    }

    #[test]
    fn shallow_nesting_still_compares() {
        assert!(py_eq(&nested(MAX_DEPTH - 1), &nested(MAX_DEPTH - 1)).unwrap());
        assert_eq!(
            py_eq(&nested(MAX_DEPTH + 5), &nested(MAX_DEPTH + 5)).unwrap_err().kind,
            "RecursionError"
        );
    }

    #[test]
    fn dismantling_a_deep_chain_does_not_recurse() {
        dismantle(nested(200_000));

        let mut t = Value::tuple(vec![]);
        for _ in 0..200_000 {
            t = Value::tuple(vec![t]);
        }
        dismantle(t);
    }

    #[test]
    fn dismantle_leaves_shared_containers_intact() {
        let inner = Value::list(vec![Value::Int(1)]);
        dismantle(Value::list(vec![inner.clone()]));
        assert_eq!(inner.repr(), "[1]");
    }

    #[test]
    fn nesting_depth_is_measured_once_per_container() {
        assert!(!nests_deeper_than(&nested(MAX_DEPTH - 1), MAX_DEPTH));
        assert!(nests_deeper_than(&nested(MAX_DEPTH), MAX_DEPTH));
        let (v, l) = self_containing_list();
        assert!(!nests_deeper_than(&v, MAX_DEPTH));
        l.borrow_mut().clear();
    }

    #[test]
    fn bounded_rendering_fails_past_the_limit() {
        let v = Value::list(vec![Value::from("x".repeat(100)); 100]);
        assert_eq!(v.repr_within(50).unwrap_err().kind, "ResourceLimitError");
        assert!(v.repr_within(100_000).is_ok());
        assert_eq!(Value::from("abc").display_within(1).unwrap(), "abc");
    }
}
