//! The built-in functions policy code can call without importing anything.

use std::cell::RefCell;

use polity_core::allowlist;
use polity_core::ast::BinOp;
use tracing::debug;

use crate::interp::Interpreter;
use crate::ops;
use crate::value::{py_cmp, py_index, CallArgs, Dict, Key, RuntimeError, Value};

impl Interpreter {
    pub(crate) fn call_builtin(&mut self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        if allowlist::EXCEPTIONS.contains(&name) {
            let message = match args.positional.first() {
                Some(v) => v.display_within(self.limits.max_string_len)?,
                None => String::new(),
            };
            return Ok(Value::exception(name, message));
        }
        match name {
            "abs" => {
                let x = args.require(0, "x", name)?;
                match x {
                    Value::Int(_) | Value::Bool(_) => x
                        .as_int()
                        .and_then(i64::checked_abs)
                        .map(Value::Int)
                        .ok_or_else(RuntimeError::overflow),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    Value::Duration(d) => Ok(Value::Duration(d.abs())),
                    other => Err(RuntimeError::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        other.type_name()
                    ))),
                }
            }
            "all" => {
                let items = args.require(0, "iterable", name)?.iter_items()?;
                Ok(Value::Bool(items.iter().all(Value::truthy)))
            }
            "any" => {
                let items = args.require(0, "iterable", name)?.iter_items()?;
                Ok(Value::Bool(items.iter().any(Value::truthy)))
            }
            "bool" => Ok(Value::Bool(args.get(0, "x").is_some_and(Value::truthy))),
            "chr" => {
                let i = args.require(0, "i", name)?.expect_int("chr() argument")?;
                u32::try_from(i)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| Value::Str(c.to_string()))
                    .ok_or_else(|| RuntimeError::value_error("chr() arg not in range(0x110000)"))
            }
            "ord" => {
                let s = args.require(0, "c", name)?.expect_str("ord() argument")?;
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Value::Int(c as i64)),
                    _ => Err(RuntimeError::type_error(format!(
                        "ord() expected a character, but string of length {} found",
                        s.chars().count()
                    ))),
                }
            }
            "debug" => {
                let msg = args
                    .positional
                    .iter()
                    .map(|v| v.display_within(self.limits.max_string_len))
                    .collect::<Result<Vec<_>, _>>()?
                    .join(" ");
                debug!(stage = %self.stage, "{}", msg);
                Ok(Value::None)
            }
            "dict" => self.builtin_dict(args),
            "divmod" => {
                args.at_most(2, name)?;
                let a = args.require(0, "a", name)?;
                let b = args.require(1, "b", name)?;
                let q = ops::binary(BinOp::FloorDiv, a, b, &self.limits)?;
                let r = ops::binary(BinOp::Mod, a, b, &self.limits)?;
                Ok(Value::tuple(vec![q, r]))
            }
            "enumerate" => {
                let items = args.require(0, "iterable", name)?.iter_items()?;
                let start = match args.get(1, "start") {
                    Some(v) => v.expect_int("start")?,
                    None => 0,
                };
                let mut out = Vec::with_capacity(items.len());
                for (i, v) in items.into_iter().enumerate() {
                    let idx = start
                        .checked_add(i as i64)
                        .ok_or_else(RuntimeError::overflow)?;
                    out.push(Value::tuple(vec![Value::Int(idx), v]));
                }
                Ok(Value::list(out))
            }
            "float" => match args.get(0, "x") {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| {
                        RuntimeError::value_error(format!(
                            "could not convert string to float: '{}'",
                            s
                        ))
                    }),
                Some(v) => Ok(Value::Float(v.expect_float("float() argument")?)),
            },
            "int" => self.builtin_int(args),
            "len" => {
                let x = args.require(0, "obj", name)?;
                let n = match x {
                    Value::Str(s) => s.chars().count(),
                    Value::List(l) => l.borrow().len(),
                    Value::Tuple(t) => t.len(),
                    Value::Dict(d) => d.borrow().len(),
                    other => {
                        return Err(RuntimeError::type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Int(n as i64))
            }
            "list" => match args.get(0, "iterable") {
                None => Ok(Value::list(Vec::new())),
                Some(v) => Ok(Value::list(v.iter_items()?)),
            },
            "tuple" => match args.get(0, "iterable") {
                None => Ok(Value::tuple(Vec::new())),
                Some(v) => Ok(Value::tuple(v.iter_items()?)),
            },
            "set" => {
                let items = match args.get(0, "iterable") {
                    None => Vec::new(),
                    Some(v) => v.iter_items()?,
                };
                let mut unique: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    if py_index(&unique, &item)?.is_none() {
                        unique.push(item);
                    }
                }
                Ok(Value::list(unique))
            }
            "max" => self.extremum(args, name, std::cmp::Ordering::Greater),
            "min" => self.extremum(args, name, std::cmp::Ordering::Less),
            "pow" => {
                let a = args.require(0, "base", name)?;
                let b = args.require(1, "exp", name)?;
                ops::binary(BinOp::Pow, a, b, &self.limits)
            }
            "range" => self.builtin_range(args),
            "round" => {
                let x = args.require(0, "number", name)?.expect_float("round() argument")?;
                match args.get(1, "ndigits") {
                    None | Some(Value::None) => {
                        let r = x.round_ties_even();
                        if !r.is_finite() || r.abs() > 9.2e18 {
                            return Err(RuntimeError::overflow());
                        }
                        Ok(Value::Int(r as i64))
                    }
                    Some(n) => {
                        let n = n.expect_int("ndigits")?.clamp(-308, 308) as i32;
                        let scale = 10f64.powi(n);
                        Ok(Value::Float((x * scale).round_ties_even() / scale))
                    }
                }
            }
            "sorted" => {
                let items = args.require(0, "iterable", name)?.iter_items()?;
                let key = args.keyword("key").cloned();
                let reverse = args.keyword("reverse").is_some_and(Value::truthy);
                let sorted = self.sort_values(items, key.as_ref(), reverse)?;
                Ok(Value::list(sorted))
            }
            "str" => match args.get(0, "object") {
                Some(v) => Ok(Value::Str(v.display_within(self.limits.max_string_len)?)),
                None => Ok(Value::Str(String::new())),
            },
            "sum" => {
                let items = args.require(0, "iterable", name)?.iter_items()?;
                let mut total = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
                for item in items {
                    total = ops::binary(BinOp::Add, &total, &item, &self.limits)?;
                }
                Ok(total)
            }
            "zip" => {
                let columns = args
                    .positional
                    .iter()
                    .map(Value::iter_items)
                    .collect::<Result<Vec<_>, _>>()?;
                let n = columns.iter().map(Vec::len).min().unwrap_or(0);
                let rows = (0..n)
                    .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                    .collect();
                Ok(Value::list(rows))
            }
            other => Err(RuntimeError::name_error(format!(
                "name '{}' is not defined",
                other
            ))),
        }
    }

    fn builtin_dict(&mut self, args: CallArgs) -> Result<Value, RuntimeError> {
        let mut d = Dict::new();
        match args.positional.first() {
            None => {}
            Some(Value::Dict(src)) => {
                for (k, v) in src.borrow().iter() {
                    d.insert(k.clone(), v.clone());
                }
            }
            Some(other) => {
                for pair in other.iter_items()? {
                    let kv = pair.iter_items()?;
                    if kv.len() != 2 {
                        return Err(RuntimeError::value_error(format!(
                            "dictionary update sequence element has length {}; 2 is required",
                            kv.len()
                        )));
                    }
                    d.insert(Key::from_value(&kv[0])?, kv[1].clone());
                }
            }
        }
        for (k, v) in args.keywords {
            d.insert(Key::Str(k), v);
        }
        self.limits.check_collection(d.len())?;
        Ok(Value::dict(d))
    }

    fn builtin_int(&mut self, args: CallArgs) -> Result<Value, RuntimeError> {
        let x = match args.get(0, "x") {
            None => return Ok(Value::Int(0)),
            Some(x) => x,
        };
        match x {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Float(f) => {
                if !f.is_finite() || f.abs() >= 9.2e18 {
                    return Err(RuntimeError::value_error(format!(
                        "cannot convert float {} to integer",
                        f
                    )));
                }
                Ok(Value::Int(f.trunc() as i64))
            }
            Value::Str(s) => {
                let base = match args.get(1, "base") {
                    Some(b) => b.expect_int("base")?,
                    None => 10,
                };
                let base = u32::try_from(base)
                    .ok()
                    .filter(|b| (2..=36).contains(b))
                    .ok_or_else(|| RuntimeError::value_error("int() base must be >= 2 and <= 36"))?;
                i64::from_str_radix(s.trim(), base)
                    .map(Value::Int)
                    .map_err(|_| {
                        RuntimeError::value_error(format!(
                            "invalid literal for int() with base {}: '{}'",
                            base, s
                        ))
                    })
            }
            other => Err(RuntimeError::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        }
    }

    fn builtin_range(&mut self, args: CallArgs) -> Result<Value, RuntimeError> {
        let ints = args
            .positional
            .iter()
            .map(|v| v.expect_int("range() argument"))
            .collect::<Result<Vec<_>, _>>()?;
        let (start, stop, step) = match ints.as_slice() {
            [stop] => (0, *stop, 1),
            [start, stop] => (*start, *stop, 1),
            [start, stop, step] => (*start, *stop, *step),
            _ => {
                return Err(RuntimeError::type_error(format!(
                    "range expected 1 to 3 arguments, got {}",
                    ints.len()
                )))
            }
        };
        if step == 0 {
            return Err(RuntimeError::value_error("range() arg 3 must not be zero"));
        }
        let span = if step > 0 {
            (stop as i128 - start as i128 + step as i128 - 1) / step as i128
        } else {
            (start as i128 - stop as i128 - step as i128 - 1) / (-(step as i128))
        };
        let len = span.max(0);
        if len > self.limits.max_collection_len as i128 {
            return Err(RuntimeError::limit(format!(
                "range of {} items exceeds the limit of {}",
                len, self.limits.max_collection_len
            )));
        }
        let items = (0..len as i64)
            .map(|i| Value::Int(start + i * step))
            .collect();
        Ok(Value::list(items))
    }

    fn extremum(
        &mut self,
        args: CallArgs,
        name: &str,
        want: std::cmp::Ordering,
    ) -> Result<Value, RuntimeError> {
        let items = match args.positional.len() {
            0 => {
                return Err(RuntimeError::type_error(format!(
                    "{} expected at least 1 argument, got 0",
                    name
                )))
            }
            1 => args.positional[0].iter_items()?,
            _ => args.positional.clone(),
        };
        let key = args.keyword("key").cloned();
        let mut best: Option<(Value, Value)> = None;
        for item in items {
            let k = match &key {
                Some(f) if !f.is_none() => self.call(f, CallArgs::new(vec![item.clone()]))?,
                _ => item.clone(),
            };
            best = match best {
                None => Some((k, item)),
                Some((bk, bv)) => {
                    if py_cmp(&k, &bk)? == want {
                        Some((k, item))
                    } else {
                        Some((bk, bv))
                    }
                }
            };
        }
        match best {
            Some((_, v)) => Ok(v),
            None => args.keyword("default").cloned().ok_or_else(|| {
                RuntimeError::value_error(format!("{}() arg is an empty sequence", name))
            }),
        }
    }

    /// Stable sort by `key(item)` (or the item itself).
    pub(crate) fn sort_values(
        &mut self,
        items: Vec<Value>,
        key: Option<&Value>,
        reverse: bool,
    ) -> Result<Vec<Value>, RuntimeError> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let k = match key {
                Some(f) if !f.is_none() => self.call(f, CallArgs::new(vec![item.clone()]))?,
                _ => item.clone(),
            };
            keyed.push((k, item));
        }
        let failure: RefCell<Option<RuntimeError>> = RefCell::new(None);
        keyed.sort_by(|(a, _), (b, _)| {
            let ord = py_cmp(a, b).unwrap_or_else(|e| {
                failure.borrow_mut().get_or_insert(e);
                std::cmp::Ordering::Equal
            });
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        });
        if let Some(e) = failure.into_inner() {
            return Err(e);
        }
        Ok(keyed.into_iter().map(|(_, v)| v).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::interp::Interpreter;
    use crate::limits::Limits;
    use crate::value::Value;
    use polity_core::{parse, Stage};

    fn run(src: &str) -> Value {
        let prog = parse(src).unwrap();
        Interpreter::new(Stage::Check, Limits::default())
            .run(&prog)
            .unwrap()
    }

    #[test]
    fn rounding_is_half_to_even() {
        assert_eq!(run("return round(2.5)"), Value::Int(2));
        assert_eq!(run("return round(3.5)"), Value::Int(4));
        assert_eq!(run("return round(1.234, 2)"), Value::Float(1.23));
    }

    #[test]
    fn sorted_with_key_and_reverse() {
        let v = run("return sorted(['ccc', 'a', 'bb'], key=len, reverse=True)");
        assert_eq!(
            v,
            Value::list(vec![Value::from("ccc"), Value::from("bb"), Value::from("a")])
        );
    }

    #[test]
    fn sorted_mixed_types_fails() {
        let prog = parse("return sorted([1, 'a'])").unwrap();
        let err = Interpreter::new(Stage::Check, Limits::default())
            .run(&prog)
            .unwrap_err();
        assert_eq!(err.kind, "TypeError");
    }

    #[test]
    fn range_shapes() {
        assert_eq!(run("return len(range(0, 10, 3))"), Value::Int(4));
        assert_eq!(run("return range(5, 0, -2)"), Value::list(vec![Value::Int(5), Value::Int(3), Value::Int(1)]));
        assert_eq!(run("return range(3, 1)"), Value::list(vec![]));
    }

    #[test]
    fn huge_range_hits_the_collection_limit() {
        let prog = parse("return range(10 ** 12)").unwrap();
        let err = Interpreter::new(Stage::Check, Limits::default())
            .run(&prog)
            .unwrap_err();
        assert_eq!(err.kind, "ResourceLimitError");
    }

    #[test]
    fn min_max_forms() {
        assert_eq!(run("return max(3, 9, 4)"), Value::Int(9));
        assert_eq!(run("return min([3, 9, 4])"), Value::Int(3));
        assert_eq!(run("return max([], default=0)"), Value::Int(0));
    }

    #[test]
    fn conversions() {
        assert_eq!(run("return int('42')"), Value::Int(42));
        assert_eq!(run("return int('ff', 16)"), Value::Int(255));
        assert_eq!(run("return int(-3.9)"), Value::Int(-3));
        assert_eq!(run("return float('1.5')"), Value::Float(1.5));
        assert_eq!(run("return str(None)"), Value::from("None"));
        assert_eq!(run("return bool([])"), Value::Bool(false));
    }

    #[test]
    fn set_deduplicates_in_order() {
        assert_eq!(
            run("return set([3, 1, 3, 2, 1])"),
            Value::list(vec![Value::Int(3), Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn zip_and_enumerate() {
        assert_eq!(run("return len(zip([1, 2, 3], 'ab'))"), Value::Int(2));
        assert_eq!(
            run("return enumerate(['x'], 1)"),
            Value::list(vec![Value::tuple(vec![Value::Int(1), "x".into()])])
        );
    }

    #[test]
    fn exception_constructors() {
        let v = run("return Exception('boom')");
        assert_eq!(v.to_display(), "boom");
        assert_eq!(v.type_name(), "Exception");
    }
}
