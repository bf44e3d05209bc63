use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad category of a script error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The source could not be tokenized or parsed.
    Syntax,
    /// The source parsed but uses something outside the allow-lists.
    Violation,
    /// The source failed while running.
    Runtime,
}

/// An error produced while lexing, parsing, checking or running policy code.
///
/// `kind` carries the user-facing error name (`SyntaxError`, `NameError`,
/// `Exception`, ...) and `code` the offending module, function or name when
/// there is one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptError {
    pub class: ErrorClass,
    pub kind: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ScriptError {
    pub fn new(class: ErrorClass, kind: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        ScriptError {
            class,
            kind: kind.into(),
            line,
            code: None,
            message: message.into(),
        }
    }

    pub fn lex(line: u32, message: impl Into<String>) -> Self {
        ScriptError::new(ErrorClass::Syntax, "SyntaxError", line, message)
    }

    pub fn parse(line: u32, message: impl Into<String>) -> Self {
        ScriptError::new(ErrorClass::Syntax, "SyntaxError", line, message)
    }

    pub fn violation(line: u32, code: impl Into<String>, message: impl Into<String>) -> Self {
        ScriptError {
            class: ErrorClass::Violation,
            kind: "NotWhitelisted".to_owned(),
            line,
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn runtime(kind: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        ScriptError::new(ErrorClass::Runtime, kind, line, message)
    }

    pub fn is_runtime(&self) -> bool {
        self.class == ErrorClass::Runtime
    }

    /// Render as a diagnostic line: `line <n>: <code>: <message>`.
    pub fn diagnostic(&self) -> String {
        match &self.code {
            Some(code) => format!("line {}: {}: {}", self.line, code, self.message),
            None => format!("line {}: {}: {}", self.line, self.kind, self.message),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}: {}", self.kind, self.line, self.message)
    }
}

impl std::error::Error for ScriptError {}
