use crate::error::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifiers and keywords, told apart by the parser
    Word(String),
    /// Quoted string literal (content without quotes, escapes resolved)
    Str(String),
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Dot,
    // Assignment
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    // Comparison operators
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    // Arithmetic operators
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    // Layout
    Newline,
    Indent,
    Dedent,
    // End of input
    Eof,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

/// Width of the smallest indentation among non-blank lines. Policy bodies
/// are often pasted with a uniform leading indent; that indent is level zero.
fn base_indent(src: &str) -> usize {
    src.lines()
        .filter(|l| {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#')
        })
        .map(|l| indent_width(l.chars()))
        .min()
        .unwrap_or(0)
}

fn indent_width(chars: impl Iterator<Item = char>) -> usize {
    let mut width = 0usize;
    for c in chars {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}

pub fn lex(src: &str) -> Result<Vec<Spanned>, ScriptError> {
    let mut tokens: Vec<Spanned> = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut pos = 0usize;
    let mut line: u32 = 1;
    let mut indents: Vec<usize> = vec![base_indent(src)];
    let mut depth = 0usize;
    let mut at_line_start = true;

    macro_rules! push {
        ($tok:expr, $line:expr) => {
            tokens.push(Spanned {
                token: $tok,
                line: $line,
            })
        };
    }

    while pos < chars.len() {
        if at_line_start && depth == 0 {
            let start = pos;
            while pos < chars.len() && (chars[pos] == ' ' || chars[pos] == '\t') {
                pos += 1;
            }
            let width = indent_width(chars[start..pos].iter().copied());
            let blank = pos >= chars.len() || matches!(chars[pos], '\n' | '\r' | '#');
            if blank {
                while pos < chars.len() && chars[pos] != '\n' {
                    pos += 1;
                }
                if pos < chars.len() {
                    pos += 1;
                    line += 1;
                }
                continue;
            }
            at_line_start = false;
            let top = *indents.last().unwrap_or(&0);
            if width > top {
                if tokens.is_empty() {
                    return Err(ScriptError::lex(line, "unexpected indent"));
                }
                indents.push(width);
                push!(Token::Indent, line);
            } else if width < top {
                while indents.len() > 1 && width < *indents.last().unwrap_or(&0) {
                    indents.pop();
                    push!(Token::Dedent, line);
                }
                if width != *indents.last().unwrap_or(&0) {
                    return Err(ScriptError::lex(
                        line,
                        "unindent does not match any outer indentation level",
                    ));
                }
            }
        }

        let c = chars[pos];

        // Line comment
        if c == '#' {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }

        // Explicit line continuation
        if c == '\\' {
            let mut look = pos + 1;
            if look < chars.len() && chars[look] == '\r' {
                look += 1;
            }
            if look < chars.len() && chars[look] == '\n' {
                pos = look + 1;
                line += 1;
                continue;
            }
            return Err(ScriptError::lex(line, "unexpected character after line continuation"));
        }

        if c == '\n' {
            if depth == 0 && !matches!(tokens.last(), Some(Spanned { token: Token::Newline, .. }) | None)
            {
                push!(Token::Newline, line);
            }
            line += 1;
            pos += 1;
            if depth == 0 {
                at_line_start = true;
            }
            continue;
        }

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        let tok_line = line;

        // String literal, optionally raw
        let raw = matches!(c, 'r' | 'R')
            && pos + 1 < chars.len()
            && matches!(chars[pos + 1], '"' | '\'');
        if raw {
            pos += 1;
        }
        let c = chars[pos];
        if c == '"' || c == '\'' {
            let triple = pos + 2 < chars.len() && chars[pos + 1] == c && chars[pos + 2] == c;
            pos += if triple { 3 } else { 1 };
            let mut s = String::new();
            loop {
                if pos >= chars.len() {
                    return Err(ScriptError::lex(tok_line, "unterminated string literal"));
                }
                let sc = chars[pos];
                if sc == c {
                    if !triple {
                        pos += 1;
                        break;
                    }
                    if pos + 2 < chars.len() && chars[pos + 1] == c && chars[pos + 2] == c {
                        pos += 3;
                        break;
                    }
                }
                if sc == '\\' {
                    pos += 1;
                    if pos >= chars.len() {
                        return Err(ScriptError::lex(tok_line, "unterminated escape in string"));
                    }
                    if raw {
                        s.push('\\');
                        if chars[pos] == '\n' {
                            line += 1;
                        }
                        s.push(chars[pos]);
                        pos += 1;
                        continue;
                    }
                    match chars[pos] {
                        '"' => s.push('"'),
                        '\'' => s.push('\''),
                        '\\' => s.push('\\'),
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        'r' => s.push('\r'),
                        '0' => s.push('\0'),
                        '\n' => line += 1,
                        other => {
                            s.push('\\');
                            s.push(other);
                        }
                    }
                    pos += 1;
                    continue;
                }
                if sc == '\n' {
                    if !triple {
                        return Err(ScriptError::lex(tok_line, "unterminated string literal"));
                    }
                    line += 1;
                }
                s.push(sc);
                pos += 1;
            }
            push!(Token::Str(s), tok_line);
            continue;
        }

        // Number
        if c.is_ascii_digit() {
            let start = pos;
            let mut is_float = false;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos + 1 < chars.len() && chars[pos] == '.' && chars[pos + 1].is_ascii_digit() {
                is_float = true;
                pos += 1;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
            }
            if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
                let mut look = pos + 1;
                if look < chars.len() && (chars[look] == '+' || chars[look] == '-') {
                    look += 1;
                }
                if look < chars.len() && chars[look].is_ascii_digit() {
                    is_float = true;
                    pos = look;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }
            let s: String = chars[start..pos].iter().collect();
            if is_float {
                let f: f64 = s
                    .parse()
                    .map_err(|_| ScriptError::lex(tok_line, format!("invalid float '{}'", s)))?;
                push!(Token::Float(f), tok_line);
            } else {
                let n: i64 = s
                    .parse()
                    .map_err(|_| ScriptError::lex(tok_line, format!("invalid integer '{}'", s)))?;
                push!(Token::Int(n), tok_line);
            }
            continue;
        }

        // Identifier / keyword
        if c.is_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect();
            push!(Token::Word(word), tok_line);
            continue;
        }

        // Operators and punctuation
        let next = chars.get(pos + 1).copied();
        let (token, width) = match (c, next) {
            ('(', _) => {
                depth += 1;
                (Token::LParen, 1)
            }
            ('[', _) => {
                depth += 1;
                (Token::LBracket, 1)
            }
            ('{', _) => {
                depth += 1;
                (Token::LBrace, 1)
            }
            (')', _) | (']', _) | ('}', _) => {
                if depth == 0 {
                    return Err(ScriptError::lex(tok_line, format!("unmatched '{}'", c)));
                }
                depth -= 1;
                let t = match c {
                    ')' => Token::RParen,
                    ']' => Token::RBracket,
                    _ => Token::RBrace,
                };
                (t, 1)
            }
            (':', _) => (Token::Colon, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('=', Some('=')) => (Token::Eq, 2),
            ('=', _) => (Token::Assign, 1),
            ('!', Some('=')) => (Token::Neq, 2),
            ('<', Some('=')) => (Token::Lte, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', Some('=')) => (Token::Gte, 2),
            ('>', _) => (Token::Gt, 1),
            ('+', Some('=')) => (Token::PlusAssign, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', Some('=')) => (Token::MinusAssign, 2),
            ('-', _) => (Token::Minus, 1),
            ('*', Some('*')) => (Token::DoubleStar, 2),
            ('*', Some('=')) => (Token::StarAssign, 2),
            ('*', _) => (Token::Star, 1),
            ('/', Some('/')) => (Token::DoubleSlash, 2),
            ('/', Some('=')) => (Token::SlashAssign, 2),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            _ => {
                return Err(ScriptError::lex(
                    tok_line,
                    format!("unexpected character '{}'", c),
                ));
            }
        };
        push!(token, tok_line);
        pos += width;
    }

    if depth > 0 {
        return Err(ScriptError::lex(line, "unexpected end of input inside brackets"));
    }
    if !matches!(tokens.last(), Some(Spanned { token: Token::Newline, .. }) | None) {
        push!(Token::Newline, line);
    }
    while indents.len() > 1 {
        indents.pop();
        push!(Token::Dedent, line);
    }
    push!(Token::Eof, line);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn simple_return() {
        assert_eq!(
            kinds("return True"),
            vec![
                Token::Word("return".into()),
                Token::Word("True".into()),
                Token::Newline,
                Token::Eof
            ]
        );
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(toks.contains(&Token::Indent));
        assert!(toks.contains(&Token::Dedent));
        let indent_at = toks.iter().position(|t| t == &Token::Indent).unwrap();
        let dedent_at = toks.iter().position(|t| t == &Token::Dedent).unwrap();
        assert!(indent_at < dedent_at);
    }

    #[test]
    fn crlf_and_blank_lines_are_ignored() {
        let toks = kinds("x = 1\r\n\r\n   \r\ny = 2\r\n");
        let newlines = toks.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn uniform_leading_indent_is_level_zero() {
        let toks = kinds("  x = 1\n  return x\n");
        assert!(!toks.contains(&Token::Indent));
    }

    #[test]
    fn newlines_inside_brackets_are_joined() {
        let toks = kinds("x = [1,\n 2]\n");
        let newlines = toks.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn bad_dedent_is_an_error() {
        let err = lex("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn string_escapes_and_numbers() {
        assert_eq!(
            kinds(r#"'a\'b' 1.5 2e3 7"#)[..4],
            [
                Token::Str("a'b".into()),
                Token::Float(1.5),
                Token::Float(2000.0),
                Token::Int(7)
            ]
        );
    }

    #[test]
    fn raw_strings_keep_backslashes() {
        assert_eq!(
            kinds(r#"r'\d+\'' raw"#)[..2],
            [Token::Str(r"\d+\'".into()), Token::Word("raw".into())]
        );
    }

    #[test]
    fn unterminated_string_reports_line() {
        let err = lex("x = 1\ny = 'abc\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unterminated"));
    }
}
