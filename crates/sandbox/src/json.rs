//! Conversion between interpreter values and JSON.

use serde_json::{Map, Number};

use crate::value::{format_datetime, format_float, Dict, Key, RuntimeError, Value, MAX_DEPTH};

fn not_serializable(v: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "Object of type {} is not JSON serializable",
        v.type_name()
    ))
}

/// Convert a value for persistence. Datetimes become ISO strings and
/// durations become seconds.
pub fn to_json(v: &Value) -> Result<serde_json::Value, RuntimeError> {
    to_json_at(v, 0)
}

fn to_json_at(v: &Value, depth: usize) -> Result<serde_json::Value, RuntimeError> {
    if depth > MAX_DEPTH {
        return Err(RuntimeError::value_error("value nested too deeply for JSON"));
    }
    Ok(match v {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| RuntimeError::value_error("Out of range float values are not JSON compliant"))?,
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(
            items
                .borrow()
                .iter()
                .map(|i| to_json_at(i, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Value::Tuple(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|i| to_json_at(i, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Value::Dict(d) => {
            let mut map = Map::new();
            for (k, item) in d.borrow().iter() {
                map.insert(k.to_json_key(), to_json_at(item, depth + 1)?);
            }
            serde_json::Value::Object(map)
        }
        Value::DateTime(dt) => serde_json::Value::String(format_datetime(dt, 'T')),
        Value::Duration(d) => Number::from_f64(d.as_seconds_f64())
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        other => return Err(not_serializable(other)),
    })
}

pub fn from_json(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::list(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::dict(
            map.iter()
                .map(|(k, item)| (Key::Str(k.clone()), from_json(item)))
                .collect::<Dict>(),
        ),
    }
}

/// Render a value the way `json.dumps` does, keeping dict insertion order.
/// JSON text for `v`, failing once it grows past `max_len` bytes.
pub fn dumps(
    v: &Value,
    indent: Option<usize>,
    sort_keys: bool,
    max_len: usize,
) -> Result<String, RuntimeError> {
    let mut out = String::new();
    let layout = Layout {
        indent,
        sort_keys,
        max_len,
    };
    write_value(&mut out, v, &layout, 0)?;
    Ok(out)
}

struct Layout {
    indent: Option<usize>,
    sort_keys: bool,
    max_len: usize,
}

impl Layout {
    fn check(&self, out: &str) -> Result<(), RuntimeError> {
        if out.len() > self.max_len {
            return Err(RuntimeError::limit(format!(
                "string of more than {} bytes exceeds the limit",
                self.max_len
            )));
        }
        Ok(())
    }
}

fn write_str(out: &mut String, s: &str) {
    // serde_json's string escaping never fails for a &str.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

fn newline(out: &mut String, indent: Option<usize>, depth: usize) {
    if let Some(width) = indent {
        out.push('\n');
        out.extend(std::iter::repeat(' ').take(width * depth));
    }
}

fn write_seq(
    out: &mut String,
    items: &[Value],
    layout: &Layout,
    depth: usize,
) -> Result<(), RuntimeError> {
    if items.is_empty() {
        out.push_str("[]");
        return Ok(());
    }
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(if layout.indent.is_some() { "," } else { ", " });
        }
        newline(out, layout.indent, depth + 1);
        write_value(out, item, layout, depth + 1)?;
        layout.check(out)?;
    }
    newline(out, layout.indent, depth);
    out.push(']');
    Ok(())
}

fn write_value(
    out: &mut String,
    v: &Value,
    layout: &Layout,
    depth: usize,
) -> Result<(), RuntimeError> {
    if depth > MAX_DEPTH {
        return Err(RuntimeError::value_error("value nested too deeply for JSON"));
    }
    match v {
        Value::None => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) if f.is_nan() => out.push_str("NaN"),
        Value::Float(f) if f.is_infinite() => {
            out.push_str(if *f > 0.0 { "Infinity" } else { "-Infinity" })
        }
        Value::Float(f) => out.push_str(&format_float(*f)),
        Value::Str(s) => write_str(out, s),
        Value::List(items) => {
            let items = items.borrow().clone();
            write_seq(out, &items, layout, depth)?;
        }
        Value::Tuple(items) => write_seq(out, items, layout, depth)?,
        Value::Dict(d) => {
            let mut entries: Vec<(String, Value)> = d
                .borrow()
                .iter()
                .map(|(k, item)| (k.to_json_key(), item.clone()))
                .collect();
            if layout.sort_keys {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            if entries.is_empty() {
                out.push_str("{}");
                return Ok(());
            }
            out.push('{');
            for (i, (k, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(if layout.indent.is_some() { "," } else { ", " });
                }
                newline(out, layout.indent, depth + 1);
                write_str(out, k);
                out.push_str(": ");
                write_value(out, item, layout, depth + 1)?;
                layout.check(out)?;
            }
            newline(out, layout.indent, depth);
            out.push('}');
        }
        other => return Err(not_serializable(other)),
    }
    Ok(())
}

/// Parse a JSON document into a value.
pub fn loads(text: &str) -> Result<Value, RuntimeError> {
    let parsed: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RuntimeError::new("JSONDecodeError", e.to_string()))?;
    Ok(from_json(&parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_keeps_insertion_order() {
        let d: Dict = [
            (Key::Str("z".into()), Value::Int(1)),
            (Key::Str("a".into()), Value::list(vec![Value::Bool(true), Value::None])),
        ]
        .into_iter()
        .collect();
        let v = Value::dict(d);
        assert_eq!(dumps(&v, None, false, usize::MAX).unwrap(), r#"{"z": 1, "a": [true, null]}"#);
        assert_eq!(dumps(&v, None, true, usize::MAX).unwrap(), r#"{"a": [true, null], "z": 1}"#);
    }

    #[test]
    fn dumps_with_indent() {
        let v = Value::list(vec![Value::Int(1), Value::Float(2.5)]);
        assert_eq!(dumps(&v, Some(2), false, usize::MAX).unwrap(), "[\n  1,\n  2.5\n]");
    }

    #[test]
    fn integer_keys_become_strings() {
        let d: Dict = [(Key::Int(3), Value::from("x"))].into_iter().collect();
        let j = to_json(&Value::dict(d)).unwrap();
        assert_eq!(j, serde_json::json!({"3": "x"}));
    }

    #[test]
    fn loads_numbers() {
        let v = loads(r#"{"n": 3, "f": 1.5, "l": []}"#).unwrap();
        let j = to_json(&v).unwrap();
        assert_eq!(j, serde_json::json!({"n": 3, "f": 1.5, "l": []}));
    }

    #[test]
    fn host_objects_are_rejected() {
        let err = to_json(&Value::Builtin("len")).unwrap_err();
        assert_eq!(err.kind, "TypeError");
    }

    #[test]
    fn bad_json_is_a_decode_error() {
        assert_eq!(loads("{").unwrap_err().kind, "JSONDecodeError");
    }
}
