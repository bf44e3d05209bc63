//! The allow-listed standard modules: math, json, base64, datetime, time,
//! random and re.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use base64::Engine as _;
use polity_core::allowlist;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::interp::Interpreter;
use crate::json;
use crate::ops::duration_from_parts;
use crate::value::{CallArgs, RuntimeError, Value};

/// Compiled regex size ceiling, in bytes.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

impl Interpreter {
    pub(crate) fn module_attr(&self, module: &str, attr: &str) -> Result<Value, RuntimeError> {
        let missing = || {
            RuntimeError::attribute_error(format!(
                "module '{}' has no attribute '{}'",
                module, attr
            ))
        };
        let (module, attrs) = allowlist::MODULES
            .iter()
            .find(|(m, _)| *m == module)
            .ok_or_else(missing)?;
        let name = attrs.iter().find(|a| **a == attr).ok_or_else(missing)?;
        Ok(match (*module, *name) {
            ("math", "pi") => Value::Float(std::f64::consts::PI),
            ("math", "e") => Value::Float(std::f64::consts::E),
            ("math", "inf") => Value::Float(f64::INFINITY),
            (module, name) => Value::ModuleFn { module, name },
        })
    }

    pub(crate) fn call_module_fn(
        &mut self,
        module: &str,
        name: &str,
        args: CallArgs,
    ) -> Result<Value, RuntimeError> {
        match module {
            "math" => math(name, &args),
            "json" => self.json_fn(name, &args),
            "base64" => base64_fn(name, &args),
            "datetime" => datetime_fn(name, &args),
            "time" => Ok(Value::Float(
                (OffsetDateTime::now_utc() - OffsetDateTime::UNIX_EPOCH).as_seconds_f64(),
            )),
            "random" => self.random_fn(name, &args),
            "re" => self.re_fn(name, &args),
            other => Err(RuntimeError::name_error(format!(
                "name '{}' is not defined",
                other
            ))),
        }
    }

    fn json_fn(&mut self, name: &str, args: &CallArgs) -> Result<Value, RuntimeError> {
        match name {
            "dumps" => {
                let obj = args.require(0, "obj", name)?;
                let indent = match args.keyword("indent") {
                    None | Some(Value::None) => None,
                    Some(v) => Some(v.expect_int("indent")?.clamp(0, 16) as usize),
                };
                let sort_keys = args.keyword("sort_keys").is_some_and(Value::truthy);
                let out = json::dumps(obj, indent, sort_keys, self.limits.max_string_len)?;
                Ok(Value::Str(out))
            }
            _ => {
                let text = args.require(0, "s", name)?.expect_str("loads() argument")?;
                self.limits.check_string(text.len())?;
                json::loads(text)
            }
        }
    }

    fn random_fn(&mut self, name: &str, args: &CallArgs) -> Result<Value, RuntimeError> {
        let mut rng = rand::thread_rng();
        match name {
            "random" => Ok(Value::Float(rng.gen::<f64>())),
            "randint" => {
                let a = args.require(0, "a", name)?.expect_int("randint() bound")?;
                let b = args.require(1, "b", name)?.expect_int("randint() bound")?;
                if a > b {
                    return Err(RuntimeError::value_error(format!(
                        "empty range for randint({}, {})",
                        a, b
                    )));
                }
                Ok(Value::Int(rng.gen_range(a..=b)))
            }
            "choice" => {
                let seq = args.require(0, "seq", name)?.iter_items()?;
                seq.choose(&mut rng)
                    .cloned()
                    .ok_or_else(|| RuntimeError::index_error("Cannot choose from an empty sequence"))
            }
            "sample" => {
                let population = args.require(0, "population", name)?.iter_items()?;
                let k = args.require(1, "k", name)?.expect_int("sample size")?;
                if k < 0 || k as usize > population.len() {
                    return Err(RuntimeError::value_error(
                        "Sample larger than population or is negative",
                    ));
                }
                Ok(Value::list(
                    population
                        .choose_multiple(&mut rng, k as usize)
                        .cloned()
                        .collect(),
                ))
            }
            _ => match args.require(0, "x", name)? {
                Value::List(items) => {
                    items.borrow_mut().shuffle(&mut rng);
                    Ok(Value::None)
                }
                other => Err(RuntimeError::type_error(format!(
                    "shuffle() argument must be a list, not '{}'",
                    other.type_name()
                ))),
            },
        }
    }

    fn re_fn(&mut self, name: &str, args: &CallArgs) -> Result<Value, RuntimeError> {
        let pattern = args.require(0, "pattern", name)?.expect_str("pattern")?;
        if name == "escape" {
            return Ok(Value::Str(regex::escape(pattern)));
        }
        let (string_index, string_name) = if name == "sub" { (2, "string") } else { (1, "string") };
        let text = args
            .require(string_index, string_name, name)?
            .expect_str("string")?;
        match name {
            "search" => {
                let re = compile(pattern)?;
                Ok(re.find(text).map(|m| m.as_str()).into())
            }
            "match" => {
                let re = compile(&format!("^(?:{})", pattern))?;
                Ok(re.find(text).map(|m| m.as_str()).into())
            }
            "fullmatch" => {
                let re = compile(&format!(r"\A(?:{})\z", pattern))?;
                Ok(re.find(text).map(|m| m.as_str()).into())
            }
            "findall" => {
                let re = compile(pattern)?;
                let groups = re.captures_len() - 1;
                let mut out = Vec::new();
                for caps in re.captures_iter(text) {
                    let group = |i: usize| Value::from(caps.get(i).map_or("", |m| m.as_str()));
                    out.push(match groups {
                        0 => group(0),
                        1 => group(1),
                        n => Value::tuple((1..=n).map(group).collect()),
                    });
                    self.limits.check_collection(out.len())?;
                }
                Ok(Value::list(out))
            }
            "split" => {
                let re = compile(pattern)?;
                let maxsplit = match args.get(2, "maxsplit") {
                    Some(v) => v.expect_int("maxsplit")?,
                    None => 0,
                };
                let parts: Vec<Value> = if maxsplit > 0 {
                    re.splitn(text, (maxsplit as usize).saturating_add(1)).map(Value::from).collect()
                } else {
                    re.split(text).map(Value::from).collect()
                };
                self.limits.check_collection(parts.len())?;
                Ok(Value::list(parts))
            }
            _ => {
                let re = compile(pattern)?;
                let repl = args.require(1, "repl", name)?.expect_str("repl")?;
                let count = match args.get(3, "count") {
                    Some(v) => v.expect_int("count")?.max(0) as usize,
                    None => 0,
                };
                let template = replacement_template(repl);
                let mut out = String::new();
                let mut last = 0;
                for (n, caps) in re.captures_iter(text).enumerate() {
                    if count != 0 && n >= count {
                        break;
                    }
                    let Some(m) = caps.get(0) else { continue };
                    out.push_str(&text[last..m.start()]);
                    caps.expand(&template, &mut out);
                    last = m.end();
                    self.limits.check_string(out.len() + (text.len() - last))?;
                }
                out.push_str(&text[last..]);
                Ok(Value::Str(out))
            }
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, RuntimeError> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| RuntimeError::new("error", e.to_string()))
}

/// Rewrite `re.sub` replacement syntax (`\1`, `\g<name>`) into the regex
/// crate's `${1}` form, escaping literal dollars.
fn replacement_template(repl: &str) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{}}}", group));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let group: String = chars.by_ref().take_while(|c| *c != '>').collect();
                        out.push_str(&format!("${{{}}}", group));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

fn math(name: &str, args: &CallArgs) -> Result<Value, RuntimeError> {
    let x = args.require(0, "x", name)?.expect_float("math argument")?;
    let domain = || RuntimeError::value_error("math domain error");
    let to_int = |f: f64| {
        if f.is_finite() && f.abs() < 9.0e18 {
            Ok(Value::Int(f as i64))
        } else {
            Err(RuntimeError::overflow())
        }
    };
    match name {
        "ceil" => to_int(x.ceil()),
        "floor" => to_int(x.floor()),
        "fabs" => Ok(Value::Float(x.abs())),
        "exp" => {
            let r = x.exp();
            if r.is_infinite() {
                return Err(RuntimeError::overflow());
            }
            Ok(Value::Float(r))
        }
        "sqrt" if x < 0.0 => Err(domain()),
        "sqrt" => Ok(Value::Float(x.sqrt())),
        "log" | "log10" if x <= 0.0 => Err(domain()),
        "log10" => Ok(Value::Float(x.log10())),
        "log" => match args.get(1, "base") {
            Some(b) => {
                let base = b.expect_float("log base")?;
                if base <= 0.0 || base == 1.0 {
                    return Err(domain());
                }
                Ok(Value::Float(x.ln() / base.ln()))
            }
            None => Ok(Value::Float(x.ln())),
        },
        _ => {
            let y = args.require(1, "b", name)?.expect_float("math argument")?;
            let rel = match args.keyword("rel_tol") {
                Some(v) => v.expect_float("rel_tol")?,
                None => 1e-9,
            };
            let abs = match args.keyword("abs_tol") {
                Some(v) => v.expect_float("abs_tol")?,
                None => 0.0,
            };
            let close = x == y || (x - y).abs() <= (rel * x.abs().max(y.abs())).max(abs);
            Ok(Value::Bool(close))
        }
    }
}

fn base64_fn(name: &str, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = args.require(0, "s", name)?.expect_str("base64 argument")?;
    let engine = if name.starts_with("urlsafe") { &BASE64_URL } else { &BASE64 };
    if name.ends_with("encode") {
        return Ok(Value::Str(engine.encode(s.as_bytes())));
    }
    let bytes = engine
        .decode(s.trim())
        .map_err(|e| RuntimeError::new("binascii.Error", e.to_string()))?;
    String::from_utf8(bytes)
        .map(Value::Str)
        .map_err(|_| RuntimeError::value_error("decoded base64 payload is not valid UTF-8"))
}

fn datetime_fn(name: &str, args: &CallArgs) -> Result<Value, RuntimeError> {
    match name {
        "now" | "utcnow" => Ok(Value::DateTime(OffsetDateTime::now_utc())),
        "fromtimestamp" => {
            let ts = args.require(0, "timestamp", name)?.expect_float("timestamp")?;
            from_timestamp(ts).map(Value::DateTime)
        }
        "fromisoformat" => {
            let s = args.require(0, "date_string", name)?.expect_str("date string")?;
            parse_iso(s).map(Value::DateTime)
        }
        _ => {
            let float_kw = |index: Option<usize>, key: &str| -> Result<f64, RuntimeError> {
                let v = match index {
                    Some(i) => args.get(i, key),
                    None => args.keyword(key),
                };
                v.map_or(Ok(0.0), |v| v.expect_float(key))
            };
            let days = float_kw(Some(0), "days")? + 7.0 * float_kw(None, "weeks")?;
            let seconds = float_kw(Some(1), "seconds")? + float_kw(None, "milliseconds")? / 1e3;
            let d = duration_from_parts(
                days,
                float_kw(None, "hours")?,
                float_kw(None, "minutes")?,
                seconds,
            )?;
            Ok(Value::Duration(d))
        }
    }
}

pub(crate) fn from_timestamp(ts: f64) -> Result<OffsetDateTime, RuntimeError> {
    if !ts.is_finite() {
        return Err(RuntimeError::value_error("timestamp out of range"));
    }
    let nanos = (ts * 1e9) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|_| RuntimeError::value_error("timestamp out of range"))
}

/// ISO 8601 date or datetime; naive values are taken as UTC.
pub(crate) fn parse_iso(s: &str) -> Result<OffsetDateTime, RuntimeError> {
    let s = s.trim();
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(dt.to_offset(time::UtcOffset::UTC));
    }
    let normalized = s.replacen(' ', "T", 1);
    if let Ok(dt) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Ok(dt.to_offset(time::UtcOffset::UTC));
    }
    let naive = [
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]"),
    ];
    for fmt in naive {
        if let Ok(p) = PrimitiveDateTime::parse(&normalized, fmt) {
            return Ok(p.assume_utc());
        }
    }
    if let Ok(d) = Date::parse(s, format_description!("[year]-[month]-[day]")) {
        return Ok(d.midnight().assume_utc());
    }
    Err(RuntimeError::value_error(format!(
        "Invalid isoformat string: '{}'",
        s
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Limits;
    use polity_core::{parse, Stage};

    fn run(src: &str) -> Result<Value, RuntimeError> {
        let prog = parse(src).unwrap();
        Interpreter::new(Stage::Check, Limits::default()).run(&prog)
    }

    #[test]
    fn math_functions() {
        assert_eq!(run("return math.floor(2.7)").unwrap(), Value::Int(2));
        assert_eq!(run("return math.ceil(2.1)").unwrap(), Value::Int(3));
        assert_eq!(run("return math.isclose(0.1 + 0.2, 0.3)").unwrap(), Value::Bool(true));
        assert_eq!(run("return math.sqrt(-1)").unwrap_err().kind, "ValueError");
        assert_eq!(run("return math.system").unwrap_err().kind, "AttributeError");
    }

    #[test]
    fn json_roundtrip_through_modules() {
        let v = run("return json.loads(json.dumps({'a': [1, 2]}))['a'][1]").unwrap();
        assert_eq!(v, Value::Int(2));
    }

    #[test]
    fn base64_text() {
        assert_eq!(run("return base64.b64encode('hi')").unwrap(), Value::from("aGk="));
        assert_eq!(run("return base64.b64decode('aGk=')").unwrap(), Value::from("hi"));
    }

    #[test]
    fn regex_functions() {
        assert_eq!(run("return re.search(r'\\d+', 'ab12cd')").unwrap(), Value::from("12"));
        assert_eq!(run("return re.match('b', 'abc')").unwrap(), Value::None);
        assert_eq!(run("return re.fullmatch('a.c', 'abc')").unwrap(), Value::from("abc"));
        assert_eq!(
            run("return re.sub('(a)(b)', r'\\2\\1', 'abab')").unwrap(),
            Value::from("baba")
        );
        assert_eq!(
            run("return re.findall('(\\w)=(\\d)', 'a=1 b=2')").unwrap(),
            Value::list(vec![
                Value::tuple(vec![Value::from("a"), Value::from("1")]),
                Value::tuple(vec![Value::from("b"), Value::from("2")]),
            ])
        );
        assert_eq!(run("return re.search('(', 'x')").unwrap_err().kind, "error");
    }

    #[test]
    fn dollars_in_replacement_are_literal() {
        assert_eq!(replacement_template("$1 \\1"), "$$1 ${1}");
        assert_eq!(replacement_template("\\g<word>!"), "${word}!");
    }

    #[test]
    fn datetime_arithmetic() {
        let src = "start = datetime.fromisoformat('2024-01-01T00:00:00')\nend = start + datetime.timedelta(days=2, hours=3)\nreturn [end.isoformat(), (end - start).total_seconds()]";
        assert_eq!(
            run(src).unwrap(),
            Value::list(vec![
                Value::from("2024-01-03T03:00:00+00:00"),
                Value::Float(183_600.0)
            ])
        );
    }

    #[test]
    fn iso_parsing_variants() {
        let utc = parse_iso("2024-05-01T10:00:00Z").unwrap();
        let offset = parse_iso("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(utc, offset);
        assert!(parse_iso("2024-05-01").is_ok());
        assert!(parse_iso("2024-05-01 10:30").is_ok());
        assert!(parse_iso("yesterday").is_err());
    }

    #[test]
    fn random_respects_bounds() {
        for _ in 0..20 {
            let v = run("return random.randint(1, 3)").unwrap().as_int().unwrap();
            assert!((1..=3).contains(&v));
        }
        assert_eq!(run("return random.choice([])").unwrap_err().kind, "IndexError");
        assert_eq!(
            run("return len(random.sample([1, 2, 3], 2))").unwrap(),
            Value::Int(2)
        );
    }
}
