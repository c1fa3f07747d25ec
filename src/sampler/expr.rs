//! Rule condition language.
//!
//! Conditions are compiled once into an [`Expr`] tree when the sampler is
//! built and evaluated against each record without re-parsing.
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | primary
//! primary := "(" or ")" | "exists" "(" ident ")" | operand [cmp operand | "contains" operand]
//! cmp     := "==" | "!=" | ">" | ">=" | "<" | "<="
//! ```

use crate::model::{AttributeValue, Record};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected end of condition")]
    UnexpectedEnd,
    #[error("empty condition")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(AttributeValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Contains {
        haystack: Operand,
        needle: Operand,
    },
    Exists(String),
    /// Bare operand; true when it resolves to boolean true
    Truthy(Operand),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

// ============================================================
// Evaluation
// ============================================================

impl Expr {
    pub fn evaluate(&self, record: &Record) -> bool {
        match self {
            Self::Compare { left, op, right } => {
                match (resolve(left, record), resolve(right, record)) {
                    (Some(l), Some(r)) => compare(&l, *op, &r),
                    _ => false,
                }
            }
            Self::Contains { haystack, needle } => {
                match (resolve(haystack, record), resolve(needle, record)) {
                    (Some(h), Some(n)) => h.to_string().contains(&n.to_string()),
                    _ => false,
                }
            }
            Self::Exists(name) => {
                record.attribute(name).is_some() || record.builtin_field(name).is_some()
            }
            Self::Truthy(operand) => resolve(operand, record)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            Self::Not(inner) => !inner.evaluate(record),
            Self::And(l, r) => l.evaluate(record) && r.evaluate(record),
            Self::Or(l, r) => l.evaluate(record) || r.evaluate(record),
        }
    }
}

fn resolve(operand: &Operand, record: &Record) -> Option<AttributeValue> {
    match operand {
        Operand::Literal(value) => Some(value.clone()),
        Operand::Field(name) => record
            .attribute(name)
            .cloned()
            .or_else(|| record.builtin_field(name)),
    }
}

fn compare(left: &AttributeValue, op: CompareOp, right: &AttributeValue) -> bool {
    use AttributeValue::*;

    let ordering = match (left, right) {
        (Str(l), Str(r)) => Some(l.cmp(r)),
        (Bool(_), _) | (_, Bool(_)) => match (left.as_bool(), right.as_bool()) {
            (Some(l), Some(r)) => {
                return match op {
                    CompareOp::Eq => l == r,
                    CompareOp::Ne => l != r,
                    _ => false,
                }
            }
            _ => None,
        },
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => None,
        },
    };

    let Some(ordering) = ordering else {
        return false;
    };

    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
    }
}

// ============================================================
// Lexer
// ============================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(AttributeValue),
    Str(String),
    Bool(bool),
    Cmp(CompareOp),
    And,
    Or,
    Not,
    Contains,
    Exists,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) | Self::Str(s) => s.clone(),
            Self::Number(v) => v.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Cmp(op) => format!("{:?}", op),
            Self::And => "&&".to_string(),
            Self::Or => "||".to_string(),
            Self::Not => "!".to_string(),
            Self::Contains => "contains".to_string(),
            Self::Exists => "exists".to_string(),
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
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
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ConditionError::UnexpectedChar(c, i));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(ConditionError::UnexpectedChar(c, i));
                }
                tokens.push(Token::Cmp(CompareOp::Eq));
                i += 2;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CompareOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '>' | '<' => {
                let with_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, with_eq) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Cmp(op));
                i += if with_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(start)),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some(&other) => {
                            text.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Contains,
                    "exists" => Token::Exists,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ConditionError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).map_or(false, |c| c.is_ascii_digit())
}

fn parse_number(text: &str) -> Result<AttributeValue, ConditionError> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(AttributeValue::Int(v));
    }
    text.parse::<f64>()
        .map(AttributeValue::Double)
        .map_err(|_| ConditionError::InvalidNumber(text.to_string()))
}

// ============================================================
// Parser
// ============================================================

/// Compile a condition string into an expression tree
pub fn compile(input: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ConditionError::UnexpectedToken(token.describe())),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ConditionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ConditionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(ConditionError::UnexpectedToken(token.describe()))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next()? {
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Exists => {
                self.expect(Token::LParen)?;
                let name = match self.next()? {
                    Token::Ident(name) => name,
                    other => return Err(ConditionError::UnexpectedToken(other.describe())),
                };
                self.expect(Token::RParen)?;
                Ok(Expr::Exists(name))
            }
            token => {
                let left = operand_from(token)?;
                match self.peek() {
                    Some(Token::Cmp(op)) => {
                        let op = *op;
                        self.pos += 1;
                        let right = operand_from(self.next()?)?;
                        Ok(Expr::Compare { left, op, right })
                    }
                    Some(Token::Contains) => {
                        self.pos += 1;
                        let needle = operand_from(self.next()?)?;
                        Ok(Expr::Contains {
                            haystack: left,
                            needle,
                        })
                    }
                    _ => Ok(Expr::Truthy(left)),
                }
            }
        }
    }
}

fn operand_from(token: Token) -> Result<Operand, ConditionError> {
    match token {
        Token::Ident(name) => Ok(Operand::Field(name)),
        Token::Number(value) => Ok(Operand::Literal(value)),
        Token::Str(text) => Ok(Operand::Literal(AttributeValue::Str(text))),
        Token::Bool(b) => Ok(Operand::Literal(AttributeValue::Bool(b))),
        other => Err(ConditionError::UnexpectedToken(other.describe())),
    }
}
