//! The fixed registry of names policy code may use.
//!
//! The sandbox builds its built-in table from these lists and the linter
//! checks against them, so both gates agree on what is allowed.

pub const IMPORT_ERROR_MESSAGE: &str =
    "module cannot be imported because it is not in the list of whitelisted modules.";
pub const FUNCTION_BUILTIN_ERROR_MESSAGE: &str =
    "function cannot be called because it is not in the list of whitelisted builtins.";
pub const FUNCTION_MODULE_ERROR_MESSAGE: &str =
    "function cannot be called because it is not in the list of whitelisted module functions.";
pub const DISALLOW_FROM_IMPORT_ERROR_MESSAGE: &str = "using from import syntax is disallowed.";

/// Check-stage result sentinels and their string values.
pub const PASSED: &str = "passed";
pub const FAILED: &str = "failed";
pub const PROPOSED: &str = "proposed";

pub const SENTINELS: &[(&str, &str)] = &[("PASSED", PASSED), ("FAILED", FAILED), ("PROPOSED", PROPOSED)];

pub const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "chr", "debug", "dict", "divmod", "enumerate", "float", "int",
    "len", "list", "max", "min", "ord", "pow", "range", "round", "set", "sorted", "str", "sum",
    "tuple", "zip",
];

pub const EXCEPTIONS: &[&str] = &["Exception", "ValueError", "TypeError", "KeyError", "RuntimeError"];

/// Allow-listed modules and the attributes each exposes.
pub const MODULES: &[(&str, &[&str])] = &[
    (
        "math",
        &[
            "ceil", "e", "exp", "fabs", "floor", "inf", "isclose", "log", "log10", "pi", "sqrt",
        ],
    ),
    ("json", &["dumps", "loads"]),
    ("base64", &["b64decode", "b64encode", "urlsafe_b64decode", "urlsafe_b64encode"]),
    ("datetime", &["fromisoformat", "fromtimestamp", "now", "timedelta", "utcnow"]),
    ("time", &["time"]),
    ("random", &["choice", "randint", "random", "sample", "shuffle"]),
    ("re", &["escape", "findall", "fullmatch", "match", "search", "split", "sub"]),
];

pub const STRING_METHODS: &[&str] = &[
    "capitalize", "count", "endswith", "find", "format", "isalpha", "isdigit", "join", "lower",
    "lstrip", "replace", "rstrip", "split", "splitlines", "startswith", "strip", "title", "upper",
];

pub const LIST_METHODS: &[&str] = &[
    "append", "clear", "copy", "count", "extend", "index", "insert", "pop", "remove", "reverse",
    "sort",
];

pub const DICT_METHODS: &[&str] = &[
    "clear", "copy", "get", "items", "keys", "pop", "setdefault", "update", "values",
];

/// Methods of the objects the evaluation context exposes.
pub const CONTEXT_METHODS: &[&str] = &[
    // action
    "execute",
    "revert",
    "has_role",
    "has_permission",
    // data stores
    "get",
    "set",
    "remove",
    // governance client
    "start_process",
    "get_process",
    "close_process",
    "perform_action",
    // logger
    "debug",
    "info",
    "warning",
    "error",
    // platform handles
    "make_call",
    "post_message",
    "initiate_vote",
    // proposal
    "get_time_elapsed",
    // datetime and timedelta
    "isoformat",
    "timestamp",
    "total_seconds",
];

/// Platform handle names assumed when linting without a community.
pub const DEFAULT_PLATFORMS: &[&str] = &[
    "slack",
    "discord",
    "discourse",
    "reddit",
    "github",
    "opencollective",
    "loomio",
    "sourcecred",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name) || EXCEPTIONS.contains(&name)
}

pub fn sentinel_value(name: &str) -> Option<&'static str> {
    SENTINELS.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

/// The attribute list of an allow-listed module.
pub fn module(name: &str) -> Option<&'static [&'static str]> {
    MODULES.iter().find(|(m, _)| *m == name).map(|(_, attrs)| *attrs)
}

pub fn module_allows(module_name: &str, attr: &str) -> bool {
    module(module_name).is_some_and(|attrs| attrs.contains(&attr))
}

pub fn is_known_method(name: &str) -> bool {
    STRING_METHODS.contains(&name)
        || LIST_METHODS.contains(&name)
        || DICT_METHODS.contains(&name)
        || CONTEXT_METHODS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangerous_modules_are_absent() {
        for m in ["os", "sys", "subprocess", "socket", "importlib", "builtins"] {
            assert!(module(m).is_none(), "{} must not be allow-listed", m);
        }
    }

    #[test]
    fn module_function_lookup() {
        assert!(module_allows("math", "floor"));
        assert!(!module_allows("math", "system"));
        assert!(!module_allows("os", "path"));
    }

    #[test]
    fn introspection_builtins_are_absent() {
        for b in ["eval", "exec", "open", "getattr", "globals", "__import__", "compile", "type"] {
            assert!(!is_builtin(b), "{} must not be a builtin", b);
        }
    }
}
