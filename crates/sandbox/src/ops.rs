//! Operator semantics: arithmetic, membership, indexing and slicing.

use polity_core::ast::{BinOp, UnaryOp};
use time::Duration;

use crate::limits::Limits;
use crate::value::{dismantle, py_index, Key, RuntimeError, Value};

enum Num {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn numbers(a: &Value, b: &Value) -> Option<Num> {
    match (a, b) {
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
            Some(Num::Ints(a.as_int()?, b.as_int()?))
        }
        (
            Value::Int(_) | Value::Float(_) | Value::Bool(_),
            Value::Int(_) | Value::Float(_) | Value::Bool(_),
        ) => Some(Num::Floats(a.as_float()?, b.as_float()?)),
        _ => None,
    }
}

fn unsupported(op: BinOp, a: &Value, b: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
}

pub fn binary(op: BinOp, a: &Value, b: &Value, limits: &Limits) -> Result<Value, RuntimeError> {
    if let Some(n) = numbers(a, b) {
        return arithmetic(op, n);
    }
    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => {
            limits.check_string(x.len() + y.len())?;
            Ok(Value::Str(format!("{}{}", x, y)))
        }
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            let mut items = x.borrow().clone();
            items.extend(y.borrow().iter().cloned());
            limits.check_collection(items.len())?;
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            limits.check_collection(items.len())?;
            Ok(Value::tuple(items))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(_) | Value::Bool(_))
        | (BinOp::Mul, Value::Int(_) | Value::Bool(_), Value::Str(s)) => {
            let n = a.as_int().or(b.as_int()).unwrap_or(0).max(0) as usize;
            limits.check_string(s.len().saturating_mul(n))?;
            Ok(Value::Str(s.repeat(n)))
        }
        (BinOp::Mul, Value::List(l), Value::Int(_) | Value::Bool(_))
        | (BinOp::Mul, Value::Int(_) | Value::Bool(_), Value::List(l)) => {
            let n = a.as_int().or(b.as_int()).unwrap_or(0).max(0) as usize;
            let src = l.borrow();
            limits.check_collection(src.len().saturating_mul(n))?;
            let mut items = Vec::with_capacity(src.len() * n);
            for _ in 0..n {
                items.extend(src.iter().cloned());
            }
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::DateTime(t), Value::Duration(d))
        | (BinOp::Add, Value::Duration(d), Value::DateTime(t)) => t
            .checked_add(*d)
            .map(Value::DateTime)
            .ok_or_else(|| RuntimeError::new("OverflowError", "date value out of range")),
        (BinOp::Sub, Value::DateTime(t), Value::Duration(d)) => t
            .checked_sub(*d)
            .map(Value::DateTime)
            .ok_or_else(|| RuntimeError::new("OverflowError", "date value out of range")),
        (BinOp::Sub, Value::DateTime(x), Value::DateTime(y)) => Ok(Value::Duration(*x - *y)),
        (BinOp::Add, Value::Duration(x), Value::Duration(y)) => x
            .checked_add(*y)
            .map(Value::Duration)
            .ok_or_else(RuntimeError::overflow),
        (BinOp::Sub, Value::Duration(x), Value::Duration(y)) => x
            .checked_sub(*y)
            .map(Value::Duration)
            .ok_or_else(RuntimeError::overflow),
        (BinOp::Mul, Value::Duration(d), Value::Int(n))
        | (BinOp::Mul, Value::Int(n), Value::Duration(d)) => {
            let n = i32::try_from(*n).map_err(|_| RuntimeError::overflow())?;
            d.checked_mul(n).map(Value::Duration).ok_or_else(RuntimeError::overflow)
        }
        (BinOp::Div, Value::Duration(x), Value::Duration(y)) => {
            if y.is_zero() {
                return Err(RuntimeError::zero_division());
            }
            Ok(Value::Float(x.as_seconds_f64() / y.as_seconds_f64()))
        }
        _ => Err(unsupported(op, a, b)),
    }
}

fn arithmetic(op: BinOp, n: Num) -> Result<Value, RuntimeError> {
    match n {
        Num::Ints(x, y) => match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(RuntimeError::overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(RuntimeError::overflow),
            BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(RuntimeError::overflow),
            BinOp::Div => {
                if y == 0 {
                    return Err(RuntimeError::zero_division());
                }
                Ok(Value::Float(x as f64 / y as f64))
            }
            BinOp::FloorDiv => floor_div(x, y).map(Value::Int),
            BinOp::Mod => floor_mod(x, y).map(Value::Int),
            BinOp::Pow => {
                if y < 0 {
                    return Ok(Value::Float((x as f64).powf(y as f64)));
                }
                let exp = u32::try_from(y).map_err(|_| RuntimeError::overflow())?;
                x.checked_pow(exp).map(Value::Int).ok_or_else(RuntimeError::overflow)
            }
        },
        Num::Floats(x, y) => match op {
            BinOp::Add => Ok(Value::Float(x + y)),
            BinOp::Sub => Ok(Value::Float(x - y)),
            BinOp::Mul => Ok(Value::Float(x * y)),
            BinOp::Div => {
                if y == 0.0 {
                    return Err(RuntimeError::zero_division());
                }
                Ok(Value::Float(x / y))
            }
            BinOp::FloorDiv => {
                if y == 0.0 {
                    return Err(RuntimeError::zero_division());
                }
                Ok(Value::Float((x / y).floor()))
            }
            BinOp::Mod => {
                if y == 0.0 {
                    return Err(RuntimeError::zero_division());
                }
                let r = x % y;
                Ok(Value::Float(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }))
            }
            BinOp::Pow => Ok(Value::Float(x.powf(y))),
        },
    }
}

pub fn floor_div(x: i64, y: i64) -> Result<i64, RuntimeError> {
    if y == 0 {
        return Err(RuntimeError::zero_division());
    }
    let q = x.checked_div(y).ok_or_else(RuntimeError::overflow)?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

pub fn floor_mod(x: i64, y: i64) -> Result<i64, RuntimeError> {
    if y == 0 {
        return Err(RuntimeError::zero_division());
    }
    let r = x.checked_rem(y).ok_or_else(RuntimeError::overflow)?;
    if r != 0 && ((r < 0) != (y < 0)) {
        Ok(r + y)
    } else {
        Ok(r)
    }
}

pub fn unary(op: UnaryOp, v: &Value) -> Result<Value, RuntimeError> {
    match (op, v) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Int(_) | Value::Bool(_)) => v
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(RuntimeError::overflow),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, Value::Duration(d)) => Ok(Value::Duration(-*d)),
        (UnaryOp::Pos, Value::Int(_) | Value::Bool(_)) => Ok(Value::Int(v.as_int().unwrap_or(0))),
        (UnaryOp::Pos, Value::Float(_) | Value::Duration(_)) => Ok(v.clone()),
        (op, v) => {
            let sym = if op == UnaryOp::Neg { "-" } else { "+" };
            Err(RuntimeError::type_error(format!(
                "bad operand type for unary {}: '{}'",
                sym,
                v.type_name()
            )))
        }
    }
}

/// `item in container`.
pub fn contains(container: &Value, item: &Value) -> Result<bool, RuntimeError> {
    match container {
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(RuntimeError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(l) => Ok(py_index(&l.borrow(), item)?.is_some()),
        Value::Tuple(t) => Ok(py_index(t, item)?.is_some()),
        Value::Dict(d) => Ok(d.borrow().contains(&Key::from_value(item)?)),
        other => Err(RuntimeError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize, what: &str) -> Result<usize, RuntimeError> {
    let len_i = len as i64;
    let idx = if index < 0 { index + len_i } else { index };
    if idx < 0 || idx >= len_i {
        return Err(RuntimeError::index_error(format!("{} index out of range", what)));
    }
    Ok(idx as usize)
}

/// `container[index]` for a non-slice index.
pub fn get_item(container: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match container {
        Value::List(l) => {
            let l = l.borrow();
            let i = normalize_index(index.expect_int("list indices")?, l.len(), "list")?;
            Ok(l[i].clone())
        }
        Value::Tuple(t) => {
            let i = normalize_index(index.expect_int("tuple indices")?, t.len(), "tuple")?;
            Ok(t[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(index.expect_int("string indices")?, chars.len(), "string")?;
            Ok(Value::Str(chars[i].to_string()))
        }
        Value::Dict(d) => {
            let key = Key::from_value(index)?;
            d.borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| RuntimeError::key_error(index.repr()))
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `container[index] = value`.
pub fn set_item(container: &Value, index: &Value, value: Value, limits: &Limits) -> Result<(), RuntimeError> {
    match container {
        Value::List(l) => {
            let mut l = l.borrow_mut();
            let i = normalize_index(index.expect_int("list indices")?, l.len(), "list assignment")?;
            let old = std::mem::replace(&mut l[i], value);
            drop(l);
            dismantle(old);
            Ok(())
        }
        Value::Dict(d) => {
            let key = Key::from_value(index)?;
            let mut d = d.borrow_mut();
            if !d.contains(&key) {
                limits.check_collection(d.len() + 1)?;
            }
            d.insert(key, value);
            Ok(())
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Indices selected by `[lower:upper:step]` over a sequence of `len` items.
pub fn slice_indices(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, RuntimeError> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(RuntimeError::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |x: i64, lo: i64, hi: i64| {
        let x = if x < 0 { x + len } else { x };
        x.clamp(lo, hi)
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map_or(0, |x| clamp(x, 0, len));
        let stop = upper.map_or(len, |x| clamp(x, 0, len));
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    } else {
        let start = lower.map_or(len - 1, |x| clamp(x, -1, len - 1));
        let stop = upper.map_or(-1, |x| clamp(x, -1, len - 1));
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    }
    Ok(out)
}

pub fn slice(
    container: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> Result<Value, RuntimeError> {
    match container {
        Value::List(l) => {
            let l = l.borrow();
            let idx = slice_indices(l.len(), lower, upper, step)?;
            Ok(Value::list(idx.into_iter().map(|i| l[i].clone()).collect()))
        }
        Value::Tuple(t) => {
            let idx = slice_indices(t.len(), lower, upper, step)?;
            Ok(Value::tuple(idx.into_iter().map(|i| t[i].clone()).collect()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = slice_indices(chars.len(), lower, upper, step)?;
            Ok(Value::Str(idx.into_iter().map(|i| chars[i]).collect()))
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `timedelta` from keyword parts.
pub fn duration_from_parts(days: f64, hours: f64, minutes: f64, seconds: f64) -> Result<Duration, RuntimeError> {
    let total = days * 86_400.0 + hours * 3_600.0 + minutes * 60.0 + seconds;
    if !total.is_finite() || total.abs() > 1.0e15 {
        return Err(RuntimeError::overflow());
    }
    Ok(Duration::seconds_f64(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        assert_eq!(floor_div(7, 2).unwrap(), 3);
        assert_eq!(floor_div(-7, 2).unwrap(), -4);
        assert_eq!(floor_mod(-7, 2).unwrap(), 1);
        assert_eq!(floor_mod(7, -2).unwrap(), -1);
    }

    #[test]
    fn integer_overflow_is_an_error() {
        let err = binary(BinOp::Mul, &Value::Int(i64::MAX), &Value::Int(2), &limits()).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
        let err = binary(BinOp::Pow, &Value::Int(2), &Value::Int(1000), &limits()).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
    }

    #[test]
    fn string_repetition_respects_limit() {
        let small = Limits {
            max_string_len: 10,
            ..Limits::default()
        };
        let err = binary(BinOp::Mul, &Value::from("ab"), &Value::Int(6), &small).unwrap_err();
        assert_eq!(err.kind, "ResourceLimitError");
        let ok = binary(BinOp::Mul, &Value::from("ab"), &Value::Int(5), &small).unwrap();
        assert_eq!(ok, Value::from("ababababab"));
    }

    #[test]
    fn slices_follow_sequence_semantics() {
        assert_eq!(slice_indices(5, Some(1), Some(3), None).unwrap(), vec![1, 2]);
        assert_eq!(slice_indices(5, None, None, Some(2)).unwrap(), vec![0, 2, 4]);
        assert_eq!(slice_indices(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert!(slice_indices(5, None, None, Some(0)).is_err());
    }

    #[test]
    fn membership() {
        assert!(contains(&Value::from("hello"), &Value::from("ell")).unwrap());
        let l = Value::list(vec![Value::Int(1), Value::from("a")]);
        assert!(contains(&l, &Value::from("a")).unwrap());
        assert!(!contains(&l, &Value::Int(2)).unwrap());
        assert!(contains(&Value::Int(3), &Value::Int(3)).is_err());
    }

    #[test]
    fn negative_indexing() {
        let l = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(get_item(&l, &Value::Int(-1)).unwrap(), Value::Int(2));
        assert_eq!(get_item(&l, &Value::Int(2)).unwrap_err().kind, "IndexError");
    }
}
