use super::{Parser, FORBIDDEN_KEYWORDS};
use crate::ast::{BinOp, CmpOp, Expr, ExprKind, UnaryOp};
use crate::error::ScriptError;
use crate::lexer::Token;

fn boxed(e: Expr) -> Box<Expr> {
    Box::new(e)
}

impl<'a> Parser<'a> {
    // ── Expression lists ─────────────────────────────────────────────────

    /// `a`, or `a, b, ...` which builds a tuple.
    pub(super) fn parse_expr_list(&mut self) -> Result<Expr, ScriptError> {
        let line = self.cur_line();
        let first = self.parse_expr()?;
        if self.peek() != &Token::Comma {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if !self.starts_expr() {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn starts_expr(&self) -> bool {
        match self.peek() {
            Token::Word(w) => {
                !matches!(w.as_str(), "in" | "for" | "if" | "else" | "and" | "or" | "is" | "as")
            }
            Token::Str(_)
            | Token::Int(_)
            | Token::Float(_)
            | Token::LParen
            | Token::LBracket
            | Token::LBrace
            | Token::Minus
            | Token::Plus => true,
            _ => false,
        }
    }

    // ── Boolean layer ────────────────────────────────────────────────────

    pub(super) fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        self.enter()?;
        let e = self.parse_conditional();
        self.leave();
        e
    }

    fn parse_conditional(&mut self) -> Result<Expr, ScriptError> {
        let line = self.cur_line();
        let body = self.parse_or()?;
        if !self.eat_word("if") {
            return Ok(body);
        }
        let cond = self.parse_or()?;
        self.expect_word("else")?;
        let orelse = self.parse_expr()?;
        Ok(Expr {
            kind: ExprKind::IfExp {
                cond: boxed(cond),
                body: boxed(body),
                orelse: boxed(orelse),
            },
            line,
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_and()?;
        while self.eat_word("or") {
            let line = left.line;
            let right = self.parse_and()?;
            left = Expr {
                kind: ExprKind::Or(boxed(left), boxed(right)),
                line,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_not()?;
        while self.eat_word("and") {
            let line = left.line;
            let right = self.parse_not()?;
            left = Expr {
                kind: ExprKind::And(boxed(left), boxed(right)),
                line,
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ScriptError> {
        let line = self.cur_line();
        if self.eat_word("not") {
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: boxed(operand?),
                },
                line,
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Token::Eq => CmpOp::Eq,
            Token::Neq => CmpOp::Neq,
            Token::Lt => CmpOp::Lt,
            Token::Lte => CmpOp::Lte,
            Token::Gt => CmpOp::Gt,
            Token::Gte => CmpOp::Gte,
            Token::Word(w) if w == "in" => CmpOp::In,
            Token::Word(w) if w == "not" && matches!(self.peek_at(1), Token::Word(n) if n == "in") => {
                self.advance();
                CmpOp::NotIn
            }
            Token::Word(w) if w == "is" => {
                if matches!(self.peek_at(1), Token::Word(n) if n == "not") {
                    self.advance();
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.parse_sum()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.parse_sum()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let line = left.line;
        Ok(Expr {
            kind: ExprKind::Compare {
                left: boxed(left),
                ops,
            },
            line,
        })
    }

    // ── Arithmetic layer ─────────────────────────────────────────────────

    pub(super) fn parse_sum(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::DoubleSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_factor()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ScriptError> {
        let line = self.cur_line();
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_factor();
        self.leave();
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: boxed(operand?),
            },
            line,
        })
    }

    fn parse_power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.parse_primary()?;
        if !self.eat(&Token::DoubleStar) {
            return Ok(base);
        }
        // right-associative, binds tighter than unary minus on the left
        self.enter()?;
        let exp = self.parse_factor();
        self.leave();
        Ok(binary(BinOp::Pow, base, exp?))
    }

    // ── Primaries and trailers ───────────────────────────────────────────

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        let mut e = self.parse_atom()?;
        loop {
            let line = self.cur_line();
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let attr = match self.peek().clone() {
                        Token::Word(w) => {
                            self.advance();
                            w
                        }
                        other => {
                            return Err(self.err(format!(
                                "expected attribute name, got {}",
                                super::describe(&other)
                            )))
                        }
                    };
                    e = Expr {
                        kind: ExprKind::Attribute {
                            value: boxed(e),
                            attr,
                        },
                        line,
                    };
                }
                Token::LParen => {
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    e = Expr {
                        kind: ExprKind::Call {
                            func: boxed(e),
                            args,
                            kwargs,
                        },
                        line,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_subscript()?;
                    self.expect(&Token::RBracket, "']'")?;
                    e = Expr {
                        kind: ExprKind::Subscript {
                            value: boxed(e),
                            index: boxed(index),
                        },
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while self.peek() != &Token::RParen {
            let is_kwarg =
                matches!(self.peek(), Token::Word(_)) && self.peek_at(1) == &Token::Assign;
            if is_kwarg {
                let name = self.take_name()?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.err(format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.err("positional argument follows keyword argument"));
                }
                let arg = self.parse_expr()?;
                // `any(x for x in xs)` takes a bare generator as its only argument
                if self.is_word("for") && args.is_empty() {
                    let comp = self.parse_comprehension(arg)?;
                    args.push(comp);
                    self.expect(&Token::RParen, "')'")?;
                    return Ok((args, kwargs));
                }
                args.push(arg);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen, "')'")?;
        Ok((args, kwargs))
    }

    fn parse_subscript(&mut self) -> Result<Expr, ScriptError> {
        let line = self.cur_line();
        let lower = if self.peek() == &Token::Colon {
            None
        } else {
            let e = self.parse_expr()?;
            if self.peek() != &Token::Colon {
                return Ok(e);
            }
            Some(boxed(e))
        };
        self.expect(&Token::Colon, "':'")?;
        let upper = self.parse_slice_part()?;
        let step = if self.eat(&Token::Colon) {
            self.parse_slice_part()?
        } else {
            None
        };
        Ok(Expr {
            kind: ExprKind::Slice { lower, upper, step },
            line,
        })
    }

    fn parse_slice_part(&mut self) -> Result<Option<Box<Expr>>, ScriptError> {
        match self.peek() {
            Token::Colon | Token::RBracket => Ok(None),
            _ => Ok(Some(boxed(self.parse_expr()?))),
        }
    }

    // ── Atoms ────────────────────────────────────────────────────────────

    fn parse_atom(&mut self) -> Result<Expr, ScriptError> {
        let line = self.cur_line();
        let kind = match self.peek().clone() {
            Token::Int(n) => {
                self.advance();
                ExprKind::Int(n)
            }
            Token::Float(f) => {
                self.advance();
                ExprKind::Float(f)
            }
            Token::Str(s) => {
                self.advance();
                let mut s = s;
                // adjacent literals concatenate
                while let Token::Str(next) = self.peek().clone() {
                    self.advance();
                    s.push_str(&next);
                }
                ExprKind::Str(s)
            }
            Token::Word(w) if w == "True" => {
                self.advance();
                ExprKind::Bool(true)
            }
            Token::Word(w) if w == "False" => {
                self.advance();
                ExprKind::Bool(false)
            }
            Token::Word(w) if w == "None" => {
                self.advance();
                ExprKind::None
            }
            Token::Word(w) => {
                if let Some((kw, msg)) = FORBIDDEN_KEYWORDS.iter().find(|(k, _)| *k == w) {
                    return Err(ScriptError::violation(line, *kw, *msg));
                }
                ExprKind::Name(self.take_name()?)
            }
            Token::LParen => {
                self.advance();
                return self.parse_paren(line);
            }
            Token::LBracket => {
                self.advance();
                return self.parse_list(line);
            }
            Token::LBrace => {
                self.advance();
                return self.parse_dict(line);
            }
            other => {
                return Err(self.err(format!(
                    "invalid syntax: unexpected {}",
                    super::describe(&other)
                )))
            }
        };
        Ok(Expr { kind, line })
    }

    fn parse_paren(&mut self, line: u32) -> Result<Expr, ScriptError> {
        if self.eat(&Token::RParen) {
            return Ok(Expr {
                kind: ExprKind::Tuple(Vec::new()),
                line,
            });
        }
        let first = self.parse_expr()?;
        if self.is_word("for") {
            let comp = self.parse_comprehension(first)?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(comp);
        }
        if self.eat(&Token::RParen) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.peek() == &Token::RParen {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(&Token::RParen, "')'")?;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn parse_list(&mut self, line: u32) -> Result<Expr, ScriptError> {
        let mut items = Vec::new();
        if self.eat(&Token::RBracket) {
            return Ok(Expr {
                kind: ExprKind::List(items),
                line,
            });
        }
        let first = self.parse_expr()?;
        if self.is_word("for") {
            let comp = self.parse_comprehension(first)?;
            self.expect(&Token::RBracket, "']'")?;
            return Ok(comp);
        }
        items.push(first);
        while self.eat(&Token::Comma) {
            if self.peek() == &Token::RBracket {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(&Token::RBracket, "']'")?;
        Ok(Expr {
            kind: ExprKind::List(items),
            line,
        })
    }

    fn parse_dict(&mut self, line: u32) -> Result<Expr, ScriptError> {
        let mut entries = Vec::new();
        while self.peek() != &Token::RBrace {
            let key = self.parse_expr()?;
            if self.peek() != &Token::Colon {
                return Err(self.err("set literals are not supported, use set([...])"));
            }
            self.advance();
            let value = self.parse_expr()?;
            entries.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace, "'}'")?;
        Ok(Expr {
            kind: ExprKind::Dict(entries),
            line,
        })
    }

    /// `elt for target in iter [if cond]`, positioned at `for`.
    fn parse_comprehension(&mut self, elt: Expr) -> Result<Expr, ScriptError> {
        let line = elt.line;
        self.expect_word("for")?;
        let target = self.parse_target_list()?;
        self.expect_word("in")?;
        let iter = self.parse_or()?;
        let cond = if self.eat_word("if") {
            Some(boxed(self.parse_or()?))
        } else {
            None
        };
        if self.is_word("for") {
            return Err(self.err("nested comprehensions are not supported"));
        }
        Ok(Expr {
            kind: ExprKind::ListComp {
                elt: boxed(elt),
                target,
                iter: boxed(iter),
                cond,
            },
            line,
        })
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    let line = left.line;
    Expr {
        kind: ExprKind::Binary {
            op,
            left: boxed(left),
            right: boxed(right),
        },
        line,
    }
}
