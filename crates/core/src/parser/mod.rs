/// Recursive-descent parser for policy script.
/// Produces the statement list of one stage body. No name resolution is
/// done here. That is the job of the checker and the linter.
use crate::ast::Stmt;
use crate::error::ScriptError;
use crate::lexer::{lex, Spanned, Token};

mod expressions;
mod statements;

/// Maximum nesting of blocks and expressions before the parser gives up.
pub const MAX_NESTING: usize = 64;

/// Words that can never be used as names.
pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Keywords the grammar recognises only to reject them.
pub const FORBIDDEN_KEYWORDS: &[(&str, &str)] = &[
    ("def", "defining functions is not allowed"),
    ("class", "defining classes is not allowed"),
    ("lambda", "lambda expressions are not allowed"),
    ("try", "exception handling blocks are not allowed"),
    ("except", "exception handling blocks are not allowed"),
    ("finally", "exception handling blocks are not allowed"),
    ("with", "context managers are not allowed"),
    ("global", "global declarations are not allowed"),
    ("nonlocal", "nonlocal declarations are not allowed"),
    ("del", "del statements are not allowed"),
    ("yield", "generators are not allowed"),
    ("async", "asynchronous code is not allowed"),
    ("await", "asynchronous code is not allowed"),
    ("assert", "assert statements are not allowed"),
];

// ──────────────────────────────────────────────
// Parser
// ──────────────────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    nesting: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned]) -> Self {
        Parser {
            tokens,
            pos: 0,
            nesting: 0,
        }
    }

    fn cur(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.cur().token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn cur_line(&self) -> u32 {
        self.cur().line
    }

    fn advance(&mut self) -> &Spanned {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> ScriptError {
        ScriptError::parse(self.cur_line(), msg)
    }

    fn is_word(&self, w: &str) -> bool {
        matches!(self.peek(), Token::Word(x) if x == w)
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if self.is_word(w) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Token, what: &str) -> Result<(), ScriptError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.err(format!("expected {}, got {}", what, describe(self.peek()))))
        }
    }

    fn expect_word(&mut self, expected: &str) -> Result<(), ScriptError> {
        if self.eat_word(expected) {
            Ok(())
        } else {
            Err(self.err(format!(
                "expected '{}', got {}",
                expected,
                describe(self.peek())
            )))
        }
    }

    /// Take an identifier that is not a keyword.
    fn take_name(&mut self) -> Result<String, ScriptError> {
        if let Token::Word(w) = self.peek().clone() {
            if let Some((kw, msg)) = FORBIDDEN_KEYWORDS.iter().find(|(k, _)| *k == w) {
                return Err(ScriptError::violation(self.cur_line(), *kw, *msg));
            }
            if KEYWORDS.contains(&w.as_str()) {
                return Err(self.err(format!("invalid syntax: unexpected keyword '{}'", w)));
            }
            self.advance();
            Ok(w)
        } else {
            Err(self.err(format!("expected identifier, got {}", describe(self.peek()))))
        }
    }

    fn enter(&mut self) -> Result<(), ScriptError> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.err("code nests too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
    }
}

fn describe(tok: &Token) -> String {
    match tok {
        Token::Word(w) => format!("'{}'", w),
        Token::Str(_) => "string literal".to_owned(),
        Token::Int(n) => format!("'{}'", n),
        Token::Float(f) => format!("'{}'", f),
        Token::Newline => "end of line".to_owned(),
        Token::Indent => "indent".to_owned(),
        Token::Dedent => "dedent".to_owned(),
        Token::Eof => "end of input".to_owned(),
        other => format!("{:?}", other),
    }
}

/// Parse a stage body into its statements.
pub fn parse(src: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = lex(src)?;
    let mut p = Parser::new(&tokens);
    p.parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, CmpOp, ExprKind, StmtKind, Target};
    use crate::error::ErrorClass;

    #[test]
    fn empty_body_parses_to_nothing() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("   \n# comment only\n").unwrap().is_empty());
    }

    #[test]
    fn return_sentinel() {
        let stmts = parse("return PASSED").unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StmtKind::Return(Some(e)) => assert_eq!(e.kind, ExprKind::Name("PASSED".into())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn if_elif_else_chain() {
        let src = "if a:\n  return 1\nelif b:\n  return 2\nelse:\n  return 3\n";
        let stmts = parse(src).unwrap();
        match &stmts[0].kind {
            StmtKind::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn inline_suite() {
        let stmts = parse("if action.initiator is None: return False\nreturn True").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn precedence_mul_over_add() {
        let stmts = parse("x = 1 + 2 * 3").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Binary { op, right, .. } => {
                    assert_eq!(*op, BinOp::Add);
                    assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn not_in_and_is_not() {
        let stmts = parse("x = a not in b\ny = c is not None").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Compare { ops, .. } => assert_eq!(ops[0].0, CmpOp::NotIn),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        match &stmts[1].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Compare { ops, .. } => assert_eq!(ops[0].0, CmpOp::IsNot),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tuple_unpacking_for_loop() {
        let stmts = parse("for k, v in d.items():\n  total += v\n").unwrap();
        match &stmts[0].kind {
            StmtKind::For { target, .. } => {
                assert!(matches!(target, Target::Tuple(items) if items.len() == 2))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn list_comprehension() {
        let stmts = parse("ids = [u for u in users if u != 'bot']").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::ListComp { cond: Some(_), .. }))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn keyword_arguments() {
        let stmts = parse("metagov.start_process('loomio.poll', title='x', options=[1])").unwrap();
        match &stmts[0].kind {
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::Call { args, kwargs, .. } => {
                    assert_eq!(args.len(), 1);
                    assert_eq!(kwargs.len(), 2);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn def_is_a_violation() {
        let err = parse("def f():\n  return 1\n").unwrap_err();
        assert_eq!(err.class, ErrorClass::Violation);
        assert_eq!(err.code.as_deref(), Some("def"));
    }

    #[test]
    fn lambda_is_a_violation() {
        let err = parse("f = lambda x: x").unwrap_err();
        assert_eq!(err.class, ErrorClass::Violation);
    }

    #[test]
    fn missing_colon_is_syntax_error() {
        let err = parse("if x\n  return 1\n").unwrap_err();
        assert_eq!(err.class, ErrorClass::Syntax);
        assert_eq!(err.line, 1);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let src = format!("x = {}1{}", "(".repeat(200), ")".repeat(200));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nests too deeply"));
    }

    #[test]
    fn slices() {
        let stmts = parse("x = s[1:3]\ny = s[::2]").unwrap();
        assert_eq!(stmts.len(), 2);
    }
}
