//! Kernel body language.
//!
//! A body is a list of assignments `out = expr;`. Expressions combine port
//! names and float literals with `+ - * /`, unary minus, parentheses and
//! intrinsic calls such as `max(in0, in1)`. `//` starts a line comment.

use std::fmt;

use thiserror::Error;
use ts_core::BinaryOp;

/// Deepest expression tree a body may contain
pub const MAX_DEPTH: usize = 256;

/// Parsed expression tree
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Port(String),
    Literal(f32),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call { name: String, args: Vec<Expr> },
}

/// `target = value;`
#[derive(Clone, Debug, PartialEq)]
pub struct Assign {
    pub target: String,
    pub value: Expr,
    pub line: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Body {
    pub statements: Vec<Assign>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f32),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Assign,
    Semi,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "`{s}`"),
            Token::Number(v) => write!(f, "`{v}`"),
            Token::Plus => f.write_str("`+`"),
            Token::Minus => f.write_str("`-`"),
            Token::Star => f.write_str("`*`"),
            Token::Slash => f.write_str("`/`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Comma => f.write_str("`,`"),
            Token::Assign => f.write_str("`=`"),
            Token::Semi => f.write_str("`;`"),
        }
    }
}

/// Byte offset → 1-based (line, column)
fn locate(src: &str, offset: usize) -> (usize, usize) {
    let before = &src[..offset.min(src.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;
    (line, column)
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let single = match c {
            b'+' => Some(Token::Plus),
            b'-' => Some(Token::Minus),
            b'*' => Some(Token::Star),
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            b',' => Some(Token::Comma),
            b'=' => Some(Token::Assign),
            b';' => Some(Token::Semi),
            _ => None,
        };
        if let Some(tok) = single {
            out.push((tok, start));
            i += 1;
        } else if c.is_ascii_whitespace() {
            i += 1;
        } else if c == b'/' {
            if bytes.get(i + 1) == Some(&b'/') {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            } else {
                out.push((Token::Slash, start));
                i += 1;
            }
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push((Token::Ident(src[start..i].to_string()), start));
        } else if c.is_ascii_digit() || c == b'.' {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                i += 1;
                if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
                    i += 1;
                }
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            // accept a trailing `f` as in C literals
            let text = &src[start..i];
            if i < bytes.len() && bytes[i] == b'f' {
                i += 1;
            }
            let value: f32 = text.parse().map_err(|_| {
                let (line, column) = locate(src, start);
                ParseError { line, column, message: format!("invalid number `{text}`") }
            })?;
            out.push((Token::Number(value), start));
        } else {
            let (line, column) = locate(src, start);
            let ch = src[start..].chars().next().unwrap_or('?');
            return Err(ParseError { line, column, message: format!("unexpected character `{ch}`") });
        }
    }
    Ok(out)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.src.len(), |(_, o)| *o)
    }

    fn error(&self, message: String) -> ParseError {
        let (line, column) = locate(self.src, self.offset());
        ParseError { line, column, message }
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), ParseError> {
        if self.peek() == Some(&want) {
            self.pos += 1;
            return Ok(());
        }
        match self.peek() {
            Some(t) => Err(self.error(format!("expected {want}, found {t}"))),
            None => Err(self.error(format!("expected {want}, found end of body"))),
        }
    }

    fn body(&mut self) -> Result<Body, ParseError> {
        let mut statements = Vec::new();
        while let Some(tok) = self.peek() {
            if *tok == Token::Semi {
                self.pos += 1;
                continue;
            }
            let (line, _) = locate(self.src, self.offset());
            let target = match self.next() {
                Some(Token::Ident(name)) => name,
                Some(t) => {
                    self.pos -= 1;
                    return Err(self.error(format!("expected an output port name, found {t}")));
                }
                None => break,
            };
            self.expect(Token::Assign)?;
            let value = self.expr()?;
            match self.peek() {
                Some(Token::Semi) => self.pos += 1,
                None => {}
                Some(t) => return Err(self.error(format!("expected `;`, found {t}"))),
            }
            statements.push(Assign { target, value, line });
        }
        Ok(Body { statements })
    }

    /// Enter one level of recursion
    fn nest(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply".into()));
        }
        Ok(())
    }

    /// Height of a node built from children of height `h`
    fn grow(&self, h: usize) -> Result<usize, ParseError> {
        if h >= MAX_DEPTH {
            return Err(self.error("expression nested too deeply".into()));
        }
        Ok(h + 1)
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.sum().map(|(e, _)| e)
    }

    // Every rule below returns the expression and its tree height.

    fn sum(&mut self) -> Result<(Expr, usize), ParseError> {
        self.nest()?;
        let (mut lhs, mut h) = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let (rhs, rh) = self.term()?;
            h = self.grow(h.max(rh))?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= 1;
        Ok((lhs, h))
    }

    fn term(&mut self) -> Result<(Expr, usize), ParseError> {
        let (mut lhs, mut h) = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok((lhs, h)),
            };
            self.pos += 1;
            let (rhs, rh) = self.unary()?;
            h = self.grow(h.max(rh))?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<(Expr, usize), ParseError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.nest()?;
            let (inner, h) = self.unary()?;
            self.depth -= 1;
            return Ok((Expr::Neg(Box::new(inner)), self.grow(h)?));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<(Expr, usize), ParseError> {
        match self.next() {
            Some(Token::Number(v)) => Ok((Expr::Literal(v), 1)),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok((Expr::Port(name), 1));
                }
                self.pos += 1;
                let mut args = Vec::new();
                let mut h = 0;
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        let (arg, ah) = self.sum()?;
                        args.push(arg);
                        h = h.max(ah);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok((Expr::Call { name, args }, self.grow(h)?))
            }
            Some(Token::LParen) => {
                let inner = self.sum()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(t) => {
                self.pos -= 1;
                Err(self.error(format!("expected an expression, found {t}")))
            }
            None => Err(self.error("expected an expression, found end of body".into())),
        }
    }
}

/// Parse a kernel body
pub fn parse_body(src: &str) -> Result<Body, ParseError> {
    let tokens = tokenize(src)?;
    Parser { src, tokens, pos: 0, depth: 0 }.body()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> Box<Expr> {
        Box::new(Expr::Port(name.into()))
    }

    #[test]
    fn parses_precedence_and_calls() {
        let body = parse_body("out0 = in0 + 2 * max(in1, -in2);").unwrap();
        assert_eq!(body.statements.len(), 1);
        let expected = Expr::Binary(
            BinaryOp::Add,
            port("in0"),
            Box::new(Expr::Binary(
                BinaryOp::Mul,
                Box::new(Expr::Literal(2.0)),
                Box::new(Expr::Call {
                    name: "max".into(),
                    args: vec![Expr::Port("in1".into()), Expr::Neg(port("in2"))],
                }),
            )),
        );
        assert_eq!(body.statements[0].target, "out0");
        assert_eq!(body.statements[0].value, expected);
    }

    #[test]
    fn subtraction_is_left_associative() {
        let body = parse_body("o = a - b - c").unwrap();
        let expected = Expr::Binary(
            BinaryOp::Sub,
            Box::new(Expr::Binary(BinaryOp::Sub, port("a"), port("b"))),
            port("c"),
        );
        assert_eq!(body.statements[0].value, expected);
    }

    #[test]
    fn multiple_statements_and_comments() {
        let src = "
            // saxpy
            out0 = 2.5f * in0 + in1;
            out1 = (in0);
        ";
        let body = parse_body(src).unwrap();
        assert_eq!(body.statements.len(), 2);
        assert_eq!(body.statements[0].line, 3);
        assert_eq!(body.statements[1].value, Expr::Port("in0".into()));
    }

    #[test]
    fn literals() {
        let body = parse_body("o = .5 + 1e3 + 2.;").unwrap();
        let Expr::Binary(_, lhs, rhs) = &body.statements[0].value else { panic!() };
        assert_eq!(**rhs, Expr::Literal(2.0));
        assert_eq!(**lhs, Expr::Binary(BinaryOp::Add, Box::new(Expr::Literal(0.5)), Box::new(Expr::Literal(1000.0))));
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse_body("out0 = in0 +;").unwrap_err();
        assert_eq!((err.line, err.column), (1, 13));

        let err = parse_body("out0 = in0\nout1 = in1;").unwrap_err();
        assert_eq!(err.line, 2);

        let err = parse_body("out0 = in0 # 1;").unwrap_err();
        assert!(err.message.contains('#'));

        assert!(parse_body("out0 = max(in0, in1;").is_err());
        assert!(parse_body("= in0;").is_err());
    }

    #[test]
    fn empty_body_has_no_statements() {
        assert!(parse_body("").unwrap().statements.is_empty());
        assert!(parse_body(" ;; ").unwrap().statements.is_empty());
    }

    #[test]
    fn deep_nesting_is_an_error() {
        let deep = |open: &str, close: &str, n: usize| format!("out0 = {}in0{};", open.repeat(n), close.repeat(n));

        let err = parse_body(&deep("(", ")", 3000)).unwrap_err();
        assert!(err.message.contains("nested too deeply"));
        assert!(parse_body(&deep("-", "", 3000)).is_err());
        assert!(parse_body(&deep("abs(", ")", 3000)).is_err());
        // left-leaning chains grow the tree without recursing
        let chain = format!("out0 = in0{};", " + in0".repeat(3000));
        assert!(parse_body(&chain).unwrap_err().message.contains("nested too deeply"));

        assert!(parse_body(&deep("(", ")", 100)).is_ok());
        assert!(parse_body(&deep("-", "", MAX_DEPTH - 1)).is_ok());
        assert!(parse_body(&deep("-", "", MAX_DEPTH)).is_err());
    }
}
