//! Arithmetic formulas used by character template fields.
//!
//! Grammar:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/' | '%') unary)*
//! unary  := '-' unary | '+' unary | atom
//! atom   := number | 'this' '.' ident | '(' expr ')'
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Error produced while parsing or evaluating a formula.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FormulaError(pub String);

fn err<T>(msg: impl Into<String>) -> Result<T, FormulaError> {
    Err(FormulaError(msg.into()))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn tokenize(src: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| FormulaError(format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(value));
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if is_ident_char(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(word)) if word == "this" => {
                if self.next() != Some(Token::Dot) {
                    return err("expected '.' after 'this'");
                }
                match self.next() {
                    Some(Token::Ident(field)) => Ok(Expr::Field(field)),
                    _ => err("expected field name after 'this.'"),
                }
            }
            Some(Token::Ident(word)) => err(format!("unsupported identifier '{word}'")),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                if self.next() != Some(Token::RParen) {
                    return err("missing ')'");
                }
                Ok(inner)
            }
            Some(other) => err(format!("unexpected token {other:?}")),
            None => err("unexpected end of formula"),
        }
    }
}

/// A parsed arithmetic formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    expr: Expr,
}

impl Formula {
    /// Parse formula text.
    pub fn parse(src: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return err("empty formula");
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return err(format!("trailing input in '{src}'"));
        }
        Ok(Self { expr })
    }

    /// Field identifiers referenced as `this.<ident>`, in first-use order.
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        collect_refs(&self.expr, &mut refs);
        refs
    }

    /// Evaluate with `lookup` resolving field identifiers.
    pub fn eval<F>(&self, lookup: F) -> Result<f64, FormulaError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let value = eval_expr(&self.expr, &lookup)?;
        if !value.is_finite() {
            return err("result is not a finite number");
        }
        Ok(value)
    }
}

fn collect_refs<'a>(expr: &'a Expr, refs: &mut Vec<&'a str>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Field(name) => {
            if !refs.contains(&name.as_str()) {
                refs.push(name.as_str());
            }
        }
        Expr::Neg(inner) => collect_refs(inner, refs),
        Expr::Binary(_, lhs, rhs) => {
            collect_refs(lhs, refs);
            collect_refs(rhs, refs);
        }
    }
}

fn eval_expr<F>(expr: &Expr, lookup: &F) -> Result<f64, FormulaError>
where
    F: Fn(&str) -> Option<f64>,
{
    Ok(match expr {
        Expr::Number(n) => *n,
        Expr::Field(name) => match lookup(name) {
            Some(v) => v,
            None => return err(format!("unknown field 'this.{name}'")),
        },
        Expr::Neg(inner) => -eval_expr(inner, lookup)?,
        Expr::Binary(op, lhs, rhs) => {
            let a = eval_expr(lhs, lookup)?;
            let b = eval_expr(rhs, lookup)?;
            match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div | BinOp::Rem if b == 0.0 => return err("division by zero"),
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
            }
        }
    })
}
