//! Methods of the built-in value types.

use time::OffsetDateTime;

use crate::interp::Interpreter;
use crate::value::{dismantle, format_datetime, py_eq, py_index, CallArgs, Key, RuntimeError, Value};

fn char_index(s: &str, byte_idx: usize) -> i64 {
    s[..byte_idx].chars().count() as i64
}

fn strip_set(args: &CallArgs) -> Result<Option<Vec<char>>, RuntimeError> {
    match args.get(0, "chars") {
        None | Some(Value::None) => Ok(None),
        Some(v) => Ok(Some(v.expect_str("strip chars")?.chars().collect())),
    }
}

/// `str.startswith` / `str.endswith` accept a string or a tuple of strings.
fn affixes(v: &Value) -> Result<Vec<String>, RuntimeError> {
    match v {
        Value::Str(s) => Ok(vec![s.clone()]),
        Value::Tuple(items) => items
            .iter()
            .map(|i| i.expect_str("affix").map(str::to_owned))
            .collect(),
        other => Err(RuntimeError::type_error(format!(
            "expected str or tuple of str, not {}",
            other.type_name()
        ))),
    }
}

impl Interpreter {
    pub(crate) fn str_method(&mut self, s: &str, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        let out = match name {
            "capitalize" => {
                let mut chars = s.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                    None => String::new(),
                }
            }
            "count" => {
                let sub = args.require(0, "sub", name)?.expect_str("count() argument")?;
                let n = if sub.is_empty() {
                    s.chars().count() + 1
                } else {
                    s.matches(sub).count()
                };
                return Ok(Value::Int(n as i64));
            }
            "endswith" => {
                let suffixes = affixes(args.require(0, "suffix", name)?)?;
                return Ok(Value::Bool(suffixes.iter().any(|x| s.ends_with(x.as_str()))));
            }
            "startswith" => {
                let prefixes = affixes(args.require(0, "prefix", name)?)?;
                return Ok(Value::Bool(prefixes.iter().any(|x| s.starts_with(x.as_str()))));
            }
            "find" => {
                let sub = args.require(0, "sub", name)?.expect_str("find() argument")?;
                return Ok(Value::Int(s.find(sub).map_or(-1, |i| char_index(s, i))));
            }
            "format" => self.format_str(s, &args)?,
            "isalpha" => {
                return Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)))
            }
            "isdigit" => {
                return Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())))
            }
            "join" => {
                let parts = args.require(0, "iterable", name)?.iter_items()?;
                let strs = parts
                    .iter()
                    .map(|p| p.expect_str("sequence item"))
                    .collect::<Result<Vec<_>, _>>()?;
                let total = strs.iter().fold(
                    s.len().saturating_mul(strs.len().saturating_sub(1)),
                    |n, p| n.saturating_add(p.len()),
                );
                self.limits.check_string(total)?;
                strs.join(s)
            }
            "lower" => s.to_lowercase(),
            "upper" => s.to_uppercase(),
            "title" => {
                let mut out = String::with_capacity(s.len());
                let mut prev_alpha = false;
                for c in s.chars() {
                    if c.is_alphabetic() {
                        if prev_alpha {
                            out.extend(c.to_lowercase());
                        } else {
                            out.extend(c.to_uppercase());
                        }
                        prev_alpha = true;
                    } else {
                        out.push(c);
                        prev_alpha = false;
                    }
                }
                out
            }
            "strip" | "lstrip" | "rstrip" => {
                let set = strip_set(&args)?;
                let matches = |c: char| match &set {
                    Some(chars) => chars.contains(&c),
                    None => c.is_whitespace(),
                };
                match name {
                    "strip" => s.trim_matches(matches).to_owned(),
                    "lstrip" => s.trim_start_matches(matches).to_owned(),
                    _ => s.trim_end_matches(matches).to_owned(),
                }
            }
            "replace" => {
                let old = args.require(0, "old", name)?.expect_str("replace() argument")?;
                let new = args.require(1, "new", name)?.expect_str("replace() argument")?;
                let limit = match args.get(2, "count") {
                    Some(c) => usize::try_from(c.expect_int("count")?).ok(),
                    None => None,
                };
                let hits = s.matches(old).take(limit.unwrap_or(usize::MAX)).count();
                let grown = hits.saturating_mul(new.len().saturating_sub(old.len()));
                self.limits.check_string(s.len().saturating_add(grown))?;
                match limit {
                    Some(n) => s.replacen(old, new, n),
                    None => s.replace(old, new),
                }
            }
            "split" => {
                let sep = match args.get(0, "sep") {
                    None | Some(Value::None) => None,
                    Some(v) => Some(v.expect_str("separator")?.to_owned()),
                };
                let maxsplit = match args.get(1, "maxsplit") {
                    Some(v) => v.expect_int("maxsplit")?,
                    None => -1,
                };
                let parts: Vec<String> = match sep {
                    Some(sep) if sep.is_empty() => {
                        return Err(RuntimeError::value_error("empty separator"))
                    }
                    Some(sep) if maxsplit >= 0 => s
                        .splitn((maxsplit as usize).saturating_add(1), sep.as_str())
                        .map(str::to_owned)
                        .collect(),
                    Some(sep) => s.split(sep.as_str()).map(str::to_owned).collect(),
                    None => {
                        let words: Vec<&str> = s.split_whitespace().collect();
                        if maxsplit >= 0 && (maxsplit as usize) < words.len() {
                            let n = maxsplit as usize;
                            let mut head: Vec<String> =
                                words[..n].iter().map(|w| w.to_string()).collect();
                            let mut rest = s.trim_start();
                            for w in &words[..n] {
                                rest = rest[w.len()..].trim_start();
                            }
                            head.push(rest.to_owned());
                            head
                        } else {
                            words.into_iter().map(str::to_owned).collect()
                        }
                    }
                };
                self.limits.check_collection(parts.len())?;
                return Ok(Value::list(parts.into_iter().map(Value::Str).collect()));
            }
            "splitlines" => {
                return Ok(Value::list(s.lines().map(Value::from).collect()));
            }
            other => {
                return Err(RuntimeError::attribute_error(format!(
                    "'str' object has no attribute '{}'",
                    other
                )))
            }
        };
        Ok(Value::Str(out))
    }

    /// `str.format` with `{}`, `{0}`, `{name}` fields and `{{`/`}}` escapes.
    /// The only format specs understood are `.Nf` and `d`.
    fn format_str(&mut self, template: &str, args: &CallArgs) -> Result<String, RuntimeError> {
        let mut out = String::new();
        let mut auto = 0usize;
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => field.push(ch),
                            None => {
                                return Err(RuntimeError::value_error(
                                    "expected '}' before end of string",
                                ))
                            }
                        }
                    }
                    let (name, spec) = match field.split_once(':') {
                        Some((n, s)) => (n.to_owned(), Some(s.to_owned())),
                        None => (field, None),
                    };
                    let found = if name.is_empty() {
                        auto += 1;
                        args.positional.get(auto - 1)
                    } else if let Ok(i) = name.parse::<usize>() {
                        args.positional.get(i)
                    } else {
                        args.keyword(&name)
                    };
                    let value = found.ok_or_else(|| {
                        RuntimeError::key_error(format!("replacement field '{}' has no value", name))
                    })?;
                    out.push_str(&apply_spec(value, spec.as_deref(), self.limits.max_string_len)?);
                }
                '}' => return Err(RuntimeError::value_error("single '}' encountered in format string")),
                c => out.push(c),
            }
        }
        self.limits.check_string(out.len())?;
        Ok(out)
    }

    pub(crate) fn list_method(&mut self, recv: &Value, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        let Value::List(list) = recv else {
            return Err(RuntimeError::type_error("list method on a non-list"));
        };
        match name {
            "append" => {
                let v = args.require(0, "object", name)?.clone();
                let mut l = list.borrow_mut();
                self.limits.check_collection(l.len() + 1)?;
                l.push(v);
                Ok(Value::None)
            }
            "extend" => {
                let extra = args.require(0, "iterable", name)?.iter_items()?;
                let mut l = list.borrow_mut();
                self.limits.check_collection(l.len() + extra.len())?;
                l.extend(extra);
                Ok(Value::None)
            }
            "insert" => {
                let idx = args.require(0, "index", name)?.expect_int("index")?;
                let v = args.require(1, "object", name)?.clone();
                let mut l = list.borrow_mut();
                self.limits.check_collection(l.len() + 1)?;
                let len = l.len() as i64;
                let pos = if idx < 0 { (idx + len).max(0) } else { idx.min(len) };
                l.insert(pos as usize, v);
                Ok(Value::None)
            }
            "pop" => {
                let mut l = list.borrow_mut();
                if l.is_empty() {
                    return Err(RuntimeError::index_error("pop from empty list"));
                }
                let len = l.len() as i64;
                let idx = match args.get(0, "index") {
                    Some(v) => v.expect_int("index")?,
                    None => -1,
                };
                let pos = if idx < 0 { idx + len } else { idx };
                if pos < 0 || pos >= len {
                    return Err(RuntimeError::index_error("pop index out of range"));
                }
                Ok(l.remove(pos as usize))
            }
            "remove" => {
                let v = args.require(0, "value", name)?;
                let pos = py_index(&list.borrow(), v)?
                    .ok_or_else(|| RuntimeError::value_error("list.remove(x): x not in list"))?;
                list.borrow_mut().remove(pos);
                Ok(Value::None)
            }
            "index" => {
                let v = args.require(0, "value", name)?;
                let pos = py_index(&list.borrow(), v)?;
                pos.map(|p| Value::Int(p as i64))
                    .ok_or_else(|| RuntimeError::value_error(format!("{} is not in list", v.repr())))
            }
            "count" => {
                let v = args.require(0, "value", name)?;
                let mut n = 0;
                for x in list.borrow().iter() {
                    if py_eq(x, v)? {
                        n += 1;
                    }
                }
                Ok(Value::Int(n))
            }
            "reverse" => {
                list.borrow_mut().reverse();
                Ok(Value::None)
            }
            "sort" => {
                let items = list.borrow().clone();
                let key = args.keyword("key").cloned();
                let reverse = args.keyword("reverse").is_some_and(Value::truthy);
                let sorted = self.sort_values(items, key.as_ref(), reverse)?;
                *list.borrow_mut() = sorted;
                Ok(Value::None)
            }
            "copy" => Ok(Value::list(list.borrow().clone())),
            "clear" => {
                let items = std::mem::take(&mut *list.borrow_mut());
                items.into_iter().for_each(dismantle);
                Ok(Value::None)
            }
            other => Err(RuntimeError::attribute_error(format!(
                "'list' object has no attribute '{}'",
                other
            ))),
        }
    }

    pub(crate) fn dict_method(&mut self, recv: &Value, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        let Value::Dict(dict) = recv else {
            return Err(RuntimeError::type_error("dict method on a non-dict"));
        };
        match name {
            "get" => {
                let key = Key::from_value(args.require(0, "key", name)?)?;
                let default = args.get(1, "default").cloned().unwrap_or(Value::None);
                Ok(dict.borrow().get(&key).cloned().unwrap_or(default))
            }
            "keys" => Ok(Value::list(dict.borrow().keys().map(Key::to_value).collect())),
            "values" => Ok(Value::list(
                dict.borrow().iter().map(|(_, v)| v.clone()).collect(),
            )),
            "items" => Ok(Value::list(
                dict.borrow()
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
                    .collect(),
            )),
            "pop" => {
                let raw = args.require(0, "key", name)?;
                let key = Key::from_value(raw)?;
                match dict.borrow_mut().remove(&key) {
                    Some(v) => Ok(v),
                    None => args
                        .get(1, "default")
                        .cloned()
                        .ok_or_else(|| RuntimeError::key_error(raw.repr())),
                }
            }
            "setdefault" => {
                let key = Key::from_value(args.require(0, "key", name)?)?;
                let default = args.get(1, "default").cloned().unwrap_or(Value::None);
                let mut d = dict.borrow_mut();
                if let Some(v) = d.get(&key) {
                    return Ok(v.clone());
                }
                self.limits.check_collection(d.len() + 1)?;
                d.insert(key, default.clone());
                Ok(default)
            }
            "update" => {
                let mut incoming = Vec::new();
                if let Some(src) = args.positional.first() {
                    match src {
                        Value::Dict(other) => {
                            incoming.extend(other.borrow().iter().cloned());
                        }
                        other => {
                            for pair in other.iter_items()? {
                                let kv = pair.iter_items()?;
                                if kv.len() != 2 {
                                    return Err(RuntimeError::value_error(
                                        "dictionary update sequence element must have length 2",
                                    ));
                                }
                                incoming.push((Key::from_value(&kv[0])?, kv[1].clone()));
                            }
                        }
                    }
                }
                for (k, v) in &args.keywords {
                    incoming.push((Key::Str(k.clone()), v.clone()));
                }
                let mut d = dict.borrow_mut();
                for (k, v) in incoming {
                    d.insert(k, v);
                }
                self.limits.check_collection(d.len())?;
                Ok(Value::None)
            }
            "copy" => Ok(Value::dict(dict.borrow().clone())),
            "clear" => {
                let cleared = std::mem::take(&mut *dict.borrow_mut());
                dismantle(Value::dict(cleared));
                Ok(Value::None)
            }
            other => Err(RuntimeError::attribute_error(format!(
                "'dict' object has no attribute '{}'",
                other
            ))),
        }
    }

    pub(crate) fn temporal_attr(&self, v: &Value, attr: &str) -> Result<Value, RuntimeError> {
        let missing = || {
            RuntimeError::attribute_error(format!(
                "'{}' object has no attribute '{}'",
                v.type_name(),
                attr
            ))
        };
        match v {
            Value::DateTime(dt) => {
                let n = match attr {
                    "year" => dt.year() as i64,
                    "month" => dt.month() as u8 as i64,
                    "day" => dt.day() as i64,
                    "hour" => dt.hour() as i64,
                    "minute" => dt.minute() as i64,
                    "second" => dt.second() as i64,
                    "microsecond" => dt.microsecond() as i64,
                    _ => return Err(missing()),
                };
                Ok(Value::Int(n))
            }
            Value::Duration(d) => {
                let total = d.whole_seconds();
                match attr {
                    "days" => Ok(Value::Int(total.div_euclid(86_400))),
                    "seconds" => Ok(Value::Int(total.rem_euclid(86_400))),
                    _ => Err(missing()),
                }
            }
            _ => Err(missing()),
        }
    }

    pub(crate) fn temporal_method(&mut self, recv: &Value, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        args.no_keywords(name)?;
        match (recv, name) {
            (Value::DateTime(dt), "isoformat") => Ok(Value::Str(format_datetime(dt, 'T'))),
            (Value::DateTime(dt), "timestamp") => {
                let secs = (*dt - OffsetDateTime::UNIX_EPOCH).as_seconds_f64();
                Ok(Value::Float(secs))
            }
            (Value::Duration(d), "total_seconds") => Ok(Value::Float(d.as_seconds_f64())),
            (other, name) => Err(RuntimeError::attribute_error(format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }
}

fn apply_spec(v: &Value, spec: Option<&str>, max_len: usize) -> Result<String, RuntimeError> {
    let spec = match spec {
        None | Some("") => return v.display_within(max_len),
        Some(s) => s,
    };
    if spec == "d" {
        return Ok(v.expect_int("format value")?.to_string());
    }
    if let Some(digits) = spec.strip_prefix('.').and_then(|s| s.strip_suffix('f')) {
        let prec: usize = digits
            .parse()
            .map_err(|_| RuntimeError::value_error(format!("invalid format spec '{}'", spec)))?;
        let f = v.expect_float("format value")?;
        return Ok(format!("{:.*}", prec.min(32), f));
    }
    Err(RuntimeError::value_error(format!("unsupported format spec '{}'", spec)))
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

    fn strs(items: &[&str]) -> Value {
        Value::list(items.iter().map(|s| Value::from(*s)).collect())
    }

    #[test]
    fn split_forms() {
        assert_eq!(run("return '  a  b c '.split()"), strs(&["a", "b", "c"]));
        assert_eq!(run("return 'a,b,,c'.split(',')"), strs(&["a", "b", "", "c"]));
        assert_eq!(run("return 'a b c'.split(None, 1)"), strs(&["a", "b c"]));
        assert_eq!(run("return 'k=v=w'.split('=', 1)"), strs(&["k", "v=w"]));
    }

    #[test]
    fn strip_and_case() {
        assert_eq!(run("return '  hi  '.strip()"), Value::from("hi"));
        assert_eq!(run("return 'xxhixx'.strip('x')"), Value::from("hi"));
        assert_eq!(run("return 'hello world'.title()"), Value::from("Hello World"));
        assert_eq!(run("return 'hELLO'.capitalize()"), Value::from("Hello"));
    }

    #[test]
    fn format_fields() {
        assert_eq!(
            run("return '{} voted {choice} ({:.1f}%)'.format('ann', 62.25, choice='yes')"),
            Value::from("ann voted yes (62.2%)")
        );
        assert_eq!(run("return '{{literal}} {0}'.format(7)"), Value::from("{literal} 7"));
    }

    #[test]
    fn list_mutation() {
        let src = "l = [3, 1, 2]\nl.append(5)\nl.sort()\nx = l.pop(0)\nl.insert(0, 9)\nl.remove(2)\nreturn [x, l]";
        assert_eq!(
            run(src),
            Value::list(vec![
                Value::Int(1),
                Value::list(vec![Value::Int(9), Value::Int(3), Value::Int(5)])
            ])
        );
    }

    #[test]
    fn dict_access() {
        let src = "d = {'a': 1}\nd.setdefault('b', [])\nd['b'].append(2)\nd.update(c=3)\nreturn [d.get('z', 0), d.pop('a'), sorted(d.keys())]";
        assert_eq!(
            run(src),
            Value::list(vec![Value::Int(0), Value::Int(1), strs(&["b", "c"])])
        );
    }

    #[test]
    fn find_counts_characters() {
        assert_eq!(run("return 'héllo'.find('l')"), Value::Int(2));
        assert_eq!(run("return 'abc'.find('z')"), Value::Int(-1));
    }
}
