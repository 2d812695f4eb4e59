//! Metadata filter expressions.
//!
//! Retrieval requests may carry a `filterExpression` that restricts the
//! similarity search to documents whose metadata matches. The language is a
//! small portable subset shared by most vector stores:
//!
//! ```text
//! source == 'guide.pdf' && (year >= 2023 || draft == false)
//! genre IN ['drama', 'documentary'] AND NOT rating < 3
//! author NIN ["anon"]
//! ```
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `==` `!=` `<` `<=` `>` `>=` | Comparison against a string, number, or boolean literal |
//! | `IN [..]` `NIN [..]` `NOT IN [..]` | List membership |
//! | `&&` / `AND`, `\|\|` / `OR` | Conjunction / disjunction (`AND` binds tighter) |
//! | `!` / `NOT`, `( )` | Negation, grouping |
//!
//! Keywords are case-insensitive. A key missing from a document's metadata
//! fails every test except `!=` and `NIN`. Expressions are limited to
//! [`MAX_EXPRESSION_LEN`] characters and [`MAX_NESTING`] levels of `!` and
//! parentheses.

use std::cmp::Ordering;

use crate::error::{GatewayError, Result};
use crate::models::{MetaValue, Metadata};

pub const MAX_EXPRESSION_LEN: usize = 4096;
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Compare {
        key: String,
        op: CmpOp,
        value: MetaValue,
    },
    In {
        key: String,
        values: Vec<MetaValue>,
        negated: bool,
    },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Parse an expression. Syntax errors are reported as invalid requests.
    pub fn parse(input: &str) -> Result<Self> {
        if input.chars().count() > MAX_EXPRESSION_LEN {
            return Err(syntax_error(format!(
                "longer than {} characters",
                MAX_EXPRESSION_LEN
            )));
        }
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(syntax_error(format!("unexpected {:?}", tok)));
        }
        Ok(expr)
    }

    /// Evaluate against a document's metadata.
    pub fn matches(&self, meta: &Metadata) -> bool {
        match self {
            FilterExpr::Compare { key, op, value } => match meta.get(key) {
                Some(actual) => compare(actual, *op, value),
                None => *op == CmpOp::Ne,
            },
            FilterExpr::In {
                key,
                values,
                negated,
            } => {
                let found = meta
                    .get(key)
                    .map(|actual| values.iter().any(|v| values_equal(actual, v)))
                    .unwrap_or(false);
                found != *negated
            }
            FilterExpr::And(a, b) => a.matches(meta) && b.matches(meta),
            FilterExpr::Or(a, b) => a.matches(meta) || b.matches(meta),
            FilterExpr::Not(inner) => !inner.matches(meta),
        }
    }
}

fn values_equal(a: &MetaValue, b: &MetaValue) -> bool {
    match (a, b) {
        (MetaValue::Number(x), MetaValue::Number(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn compare(actual: &MetaValue, op: CmpOp, expected: &MetaValue) -> bool {
    match op {
        CmpOp::Eq => values_equal(actual, expected),
        CmpOp::Ne => !values_equal(actual, expected),
        _ => {
            let ordering = match (actual, expected) {
                (MetaValue::Number(a), MetaValue::Number(b)) => a.partial_cmp(b),
                (MetaValue::String(a), MetaValue::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ordering {
                Some(ord) => match op {
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                    CmpOp::Eq | CmpOp::Ne => false,
                },
                None => false,
            }
        }
    }
}

fn syntax_error(message: impl Into<String>) -> GatewayError {
    GatewayError::invalid(format!("invalid filter expression: {}", message.into()))
}

// ============ Lexer ============

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Op(CmpOp),
    And,
    Or,
    Not,
    In,
    Nin,
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let inclusive = next == Some('=');
                let op = match (c, inclusive) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if inclusive { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax_error("unterminated string literal")),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            value.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E')) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax_error(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(n));
            }
            c if is_ident_char(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IN" => Token::In,
                    "NIN" => Token::Nin,
                    "TRUE" => Token::Bool(true),
                    "FALSE" => Token::Bool(false),
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(syntax_error(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

// ============ Parser ============

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(syntax_error(format!("expected {:?}, found {:?}", expected, tok))),
            None => Err(syntax_error(format!("expected {:?}, found end of input", expected))),
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_unary()?;
                self.depth -= 1;
                Ok(FilterExpr::Not(Box::new(inner)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            _ => self.parse_comparison(),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(syntax_error(format!("nested deeper than {} levels", MAX_NESTING)));
        }
        Ok(())
    }

    fn parse_comparison(&mut self) -> Result<FilterExpr> {
        let key = match self.advance() {
            Some(Token::Ident(name)) | Some(Token::Str(name)) => name,
            Some(tok) => return Err(syntax_error(format!("expected a key, found {:?}", tok))),
            None => return Err(syntax_error("expected a key, found end of input")),
        };

        match self.advance() {
            Some(Token::Op(op)) => {
                let value = self.parse_literal()?;
                Ok(FilterExpr::Compare { key, op, value })
            }
            Some(Token::In) => Ok(FilterExpr::In {
                key,
                values: self.parse_list()?,
                negated: false,
            }),
            Some(Token::Nin) => Ok(FilterExpr::In {
                key,
                values: self.parse_list()?,
                negated: true,
            }),
            Some(Token::Not) => {
                self.expect(Token::In)?;
                Ok(FilterExpr::In {
                    key,
                    values: self.parse_list()?,
                    negated: true,
                })
            }
            Some(tok) => Err(syntax_error(format!(
                "expected an operator after '{}', found {:?}",
                key, tok
            ))),
            None => Err(syntax_error(format!("expected an operator after '{}'", key))),
        }
    }

    fn parse_literal(&mut self) -> Result<MetaValue> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(MetaValue::String(s)),
            Some(Token::Num(n)) => Ok(MetaValue::Number(n)),
            Some(Token::Bool(b)) => Ok(MetaValue::Bool(b)),
            Some(tok) => Err(syntax_error(format!("expected a literal, found {:?}", tok))),
            None => Err(syntax_error("expected a literal, found end of input")),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<MetaValue>> {
        self.expect(Token::LBracket)?;
        let mut values = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.pos += 1;
            return Ok(values);
        }
        loop {
            values.push(self.parse_literal()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                Some(tok) => return Err(syntax_error(format!("expected ',' or ']', found {:?}", tok))),
                None => return Err(syntax_error("unterminated list")),
            }
        }
        Ok(values)
    }
}
