use super::{Parser, FORBIDDEN_KEYWORDS};
use crate::ast::{BinOp, Expr, ExprKind, ImportName, Stmt, StmtKind, Target};
use crate::error::ScriptError;
use crate::lexer::Token;

impl<'a> Parser<'a> {
    pub(super) fn parse_program(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            while self.eat(&Token::Newline) {}
            match self.peek() {
                Token::Eof => break,
                Token::Indent => return Err(self.err("unexpected indent")),
                Token::Dedent => {
                    self.advance();
                }
                _ => stmts.push(self.parse_statement()?),
            }
        }
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.enter()?;
        let stmt = self.parse_statement_inner();
        self.leave();
        stmt
    }

    fn parse_statement_inner(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.cur_line();
        let word = match self.peek() {
            Token::Word(w) => Some(w.clone()),
            _ => None,
        };

        let kind = match word.as_deref() {
            Some("if") => {
                self.advance();
                return self.parse_if(line);
            }
            Some("for") => {
                self.advance();
                let target = self.parse_target_list()?;
                self.expect_word("in")?;
                let iter = self.parse_expr_list()?;
                self.expect(&Token::Colon, "':'")?;
                let body = self.parse_suite()?;
                return Ok(Stmt {
                    kind: StmtKind::For { target, iter, body },
                    line,
                });
            }
            Some("while") => {
                self.advance();
                let cond = self.parse_expr()?;
                self.expect(&Token::Colon, "':'")?;
                let body = self.parse_suite()?;
                return Ok(Stmt {
                    kind: StmtKind::While { cond, body },
                    line,
                });
            }
            Some("return") => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr_list()?))
                }
            }
            Some("raise") => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Raise(None)
                } else {
                    StmtKind::Raise(Some(self.parse_expr()?))
                }
            }
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some("import") => {
                self.advance();
                self.parse_import()?
            }
            Some("from") => {
                self.advance();
                let module = self.parse_dotted_name()?;
                self.expect_word("import")?;
                let mut names = Vec::new();
                if self.eat(&Token::Star) {
                    names.push("*".to_owned());
                } else {
                    let parens = self.eat(&Token::LParen);
                    loop {
                        names.push(self.take_name()?);
                        if self.eat_word("as") {
                            self.take_name()?;
                        }
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    if parens {
                        self.expect(&Token::RParen, "')'")?;
                    }
                }
                StmtKind::ImportFrom { module, names }
            }
            Some("elif") | Some("else") => {
                return Err(self.err(format!(
                    "invalid syntax: '{}' without a matching 'if'",
                    word.unwrap_or_default()
                )));
            }
            Some(w) if FORBIDDEN_KEYWORDS.iter().any(|(k, _)| *k == w) => {
                let (kw, msg) = FORBIDDEN_KEYWORDS
                    .iter()
                    .find(|(k, _)| *k == w)
                    .copied()
                    .unwrap_or(("", ""));
                return Err(ScriptError::violation(line, kw, msg));
            }
            _ => self.parse_expression_statement()?,
        };

        self.expect_statement_end()?;
        Ok(Stmt { kind, line })
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, ScriptError> {
        let first = self.parse_expr_list()?;
        let aug = match self.peek() {
            Token::PlusAssign => Some(BinOp::Add),
            Token::MinusAssign => Some(BinOp::Sub),
            Token::StarAssign => Some(BinOp::Mul),
            Token::SlashAssign => Some(BinOp::Div),
            _ => None,
        };
        if let Some(op) = aug {
            self.advance();
            let target = self.to_target(first)?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.err("illegal expression for augmented assignment"));
            }
            let value = self.parse_expr_list()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }
        if self.eat(&Token::Assign) {
            let target = self.to_target(first)?;
            let value = self.parse_expr_list()?;
            if self.peek() == &Token::Assign {
                return Err(self.err("chained assignment is not supported"));
            }
            return Ok(StmtKind::Assign { target, value });
        }
        Ok(StmtKind::Expr(first))
    }

    fn parse_if(&mut self, line: u32) -> Result<Stmt, ScriptError> {
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        self.expect(&Token::Colon, "':'")?;
        let body = self.parse_suite()?;
        branches.push((cond, body));
        let mut orelse = Vec::new();
        loop {
            if self.eat_word("elif") {
                let cond = self.parse_expr()?;
                self.expect(&Token::Colon, "':'")?;
                let body = self.parse_suite()?;
                branches.push((cond, body));
                continue;
            }
            if self.eat_word("else") {
                self.expect(&Token::Colon, "':'")?;
                orelse = self.parse_suite()?;
            }
            break;
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            line,
        })
    }

    /// Parse the block after a `:`. Either an indented block or a single
    /// statement on the same line.
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        if !self.eat(&Token::Newline) {
            return Ok(vec![self.parse_statement()?]);
        }
        while self.eat(&Token::Newline) {}
        if !self.eat(&Token::Indent) {
            return Err(self.err("expected an indented block"));
        }
        let mut body = Vec::new();
        loop {
            while self.eat(&Token::Newline) {}
            match self.peek() {
                Token::Dedent => {
                    self.advance();
                    break;
                }
                Token::Eof => break,
                _ => body.push(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_import(&mut self) -> Result<StmtKind, ScriptError> {
        let mut names = Vec::new();
        loop {
            let module = self.parse_dotted_name()?;
            let alias = if self.eat_word("as") {
                Some(self.take_name()?)
            } else {
                None
            };
            names.push(ImportName { module, alias });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(StmtKind::Import(names))
    }

    fn parse_dotted_name(&mut self) -> Result<String, ScriptError> {
        let mut name = self.take_name()?;
        while self.eat(&Token::Dot) {
            name.push('.');
            name.push_str(&self.take_name()?);
        }
        Ok(name)
    }

    /// Comma-separated assignment targets, as used by `for`.
    pub(super) fn parse_target_list(&mut self) -> Result<Target, ScriptError> {
        let mut items = Vec::new();
        let mut saw_comma = false;
        loop {
            let e = self.parse_sum()?;
            items.push(self.to_target(e)?);
            if !self.eat(&Token::Comma) {
                break;
            }
            saw_comma = true;
            if self.is_word("in") {
                break;
            }
        }
        if !saw_comma && items.len() == 1 {
            return Ok(items.remove(0));
        }
        Ok(Target::Tuple(items))
    }

    pub(super) fn to_target(&self, e: Expr) -> Result<Target, ScriptError> {
        match e.kind {
            ExprKind::Name(n) => Ok(Target::Name(n)),
            ExprKind::Subscript { value, index } => Ok(Target::Subscript { value, index }),
            ExprKind::Attribute { value, attr } => Ok(Target::Attribute { value, attr }),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                let targets = items
                    .into_iter()
                    .map(|i| self.to_target(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Target::Tuple(targets))
            }
            _ => Err(ScriptError::parse(e.line, "cannot assign to expression")),
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Eof | Token::Dedent)
    }

    fn expect_statement_end(&mut self) -> Result<(), ScriptError> {
        match self.peek() {
            Token::Newline => {
                self.advance();
                Ok(())
            }
            Token::Eof | Token::Dedent => Ok(()),
            other => {
                let msg = format!("invalid syntax: unexpected {}", super::describe(other));
                Err(self.err(msg))
            }
        }
    }
}
