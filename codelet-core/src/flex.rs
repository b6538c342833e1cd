//! Lazily-bound compile-time expressions.
//!
//! A [`FlexParam`] carries a named expression over a declared parameter list
//! and can be evaluated any number of times against bound values. Capacity
//! and bandwidth constraints, tile hints and level hints are all encoded this
//! way. The body language is a small total arithmetic/boolean grammar with
//! indexed lookup into map-valued parameters (`sizes[M]`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A value an expression can produce or be bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Map(BTreeMap<String, i64>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Map(_) => "map",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Map(m) => write!(f, "{m:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<BTreeMap<String, i64>> for Value {
    fn from(m: BTreeMap<String, i64>) -> Self {
        Value::Map(m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Int(i64),
    Bool(bool),
    Var(String),
    Index(String, String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Ident(String),
    Sym(&'static str),
}

fn tokenize(name: &str, src: &str) -> Result<Vec<Token>> {
    let err = |msg: String| Error::Expr {
        name: name.to_string(),
        msg,
    };
    let mut toks = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let text = &src[start..i];
                let v = text
                    .parse()
                    .map_err(|_| err(format!("bad integer literal `{text}`")))?;
                toks.push(Token::Int(v));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                toks.push(Token::Ident(src[start..i].to_string()));
            }
            '(' | ')' | '[' | ']' | '+' | '-' | '*' => {
                toks.push(Token::Sym(match c {
                    '(' => "(",
                    ')' => ")",
                    '[' => "[",
                    ']' => "]",
                    '+' => "+",
                    '-' => "-",
                    _ => "*",
                }));
                i += 1;
            }
            '/' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                    toks.push(Token::Sym("//"));
                    i += 2;
                } else {
                    return Err(err("single `/` is not supported, use `//`".to_string()));
                }
            }
            '=' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Token::Sym("=="));
                    i += 2;
                } else {
                    return Err(err("single `=` is not supported, use `==`".to_string()));
                }
            }
            '!' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Token::Sym("!="));
                    i += 2;
                } else {
                    return Err(err("unexpected `!`".to_string()));
                }
            }
            '<' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Token::Sym("<="));
                    i += 2;
                } else {
                    toks.push(Token::Sym("<"));
                    i += 1;
                }
            }
            '>' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Token::Sym(">="));
                    i += 2;
                } else {
                    toks.push(Token::Sym(">"));
                    i += 1;
                }
            }
            _ => return Err(err(format!("unexpected character `{c}`"))),
        }
    }
    Ok(toks)
}

struct Parser<'a> {
    name: &'a str,
    toks: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: impl Into<String>) -> Error {
        Error::Expr {
            name: self.name.to_string(),
            msg: msg.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_kw("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat_kw("and") {
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_kw("not") {
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_cmp()
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Sym("==")) => BinOp::Eq,
            Some(Token::Sym("!=")) => BinOp::Ne,
            Some(Token::Sym("<")) => BinOp::Lt,
            Some(Token::Sym("<=")) => BinOp::Le,
            Some(Token::Sym(">")) => BinOp::Gt,
            Some(Token::Sym(">=")) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_add()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = if self.eat_sym("+") {
                BinOp::Add
            } else if self.eat_sym("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.eat_sym("*") {
                BinOp::Mul
            } else if self.eat_sym("//") {
                BinOp::FloorDiv
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_sym("-") {
            Ok(Expr::Neg(Box::new(self.parse_unary()?)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Ident(id)) => match id.as_str() {
                "true" | "True" => Ok(Expr::Bool(true)),
                "false" | "False" => Ok(Expr::Bool(false)),
                _ => {
                    if self.eat_sym("[") {
                        let key = match self.bump() {
                            Some(Token::Ident(k)) => k,
                            other => {
                                return Err(
                                    self.err(format!("expected index key, got {other:?}"))
                                )
                            }
                        };
                        if !self.eat_sym("]") {
                            return Err(self.err("expected `]`"));
                        }
                        Ok(Expr::Index(id, key))
                    } else {
                        Ok(Expr::Var(id))
                    }
                }
            },
            Some(Token::Sym("(")) => {
                let inner = self.parse_or()?;
                if !self.eat_sym(")") {
                    return Err(self.err("expected `)`"));
                }
                Ok(inner)
            }
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }
}

/// A named, lazily-bound expression over a declared parameter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexParam {
    name: String,
    params: Vec<String>,
    body: String,
    #[serde(skip, default)]
    expr: Option<Expr>,
}

impl FlexParam {
    pub fn new(name: impl Into<String>, params: &[&str], body: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let body = body.into();
        let toks = tokenize(&name, &body)?;
        let mut parser = Parser {
            name: &name,
            toks: &toks,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != toks.len() {
            return Err(parser.err("trailing tokens after expression"));
        }
        Ok(Self {
            name,
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
            expr: Some(expr),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Evaluate the body with `args` bound positionally to the declared
    /// parameter list.
    pub fn evaluate(&self, args: &[Value]) -> Result<Value> {
        if args.len() != self.params.len() {
            return Err(Error::Expr {
                name: self.name.clone(),
                msg: format!(
                    "expected {} arguments, got {}",
                    self.params.len(),
                    args.len()
                ),
            });
        }
        let expr = match &self.expr {
            Some(e) => e,
            // Deserialized FlexParams re-parse on first use.
            None => {
                let toks = tokenize(&self.name, &self.body)?;
                let mut parser = Parser {
                    name: &self.name,
                    toks: &toks,
                    pos: 0,
                };
                return Self {
                    name: self.name.clone(),
                    params: self.params.clone(),
                    body: self.body.clone(),
                    expr: Some(parser.parse_or()?),
                }
                .evaluate(args);
            }
        };
        let env: BTreeMap<&str, &Value> = self
            .params
            .iter()
            .map(String::as_str)
            .zip(args.iter())
            .collect();
        self.eval(expr, &env)
    }

    pub fn evaluate_bool(&self, args: &[Value]) -> Result<bool> {
        match self.evaluate(args)? {
            Value::Bool(b) => Ok(b),
            other => Err(Error::Expr {
                name: self.name.clone(),
                msg: format!("expected a boolean result, got {}", other.type_name()),
            }),
        }
    }

    fn eval(&self, expr: &Expr, env: &BTreeMap<&str, &Value>) -> Result<Value> {
        let err = |msg: String| Error::Expr {
            name: self.name.clone(),
            msg,
        };
        match expr {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Bool(v) => Ok(Value::Bool(*v)),
            Expr::Var(id) => env
                .get(id.as_str())
                .map(|v| (*v).clone())
                .ok_or_else(|| err(format!("unbound parameter `{id}`"))),
            Expr::Index(id, key) => {
                let base = env
                    .get(id.as_str())
                    .ok_or_else(|| err(format!("unbound parameter `{id}`")))?;
                match base {
                    Value::Map(m) => m
                        .get(key)
                        .copied()
                        .map(Value::Int)
                        .ok_or_else(|| err(format!("`{id}` has no key `{key}`"))),
                    other => Err(err(format!("cannot index into {}", other.type_name()))),
                }
            }
            Expr::Neg(inner) => match self.eval(inner, env)? {
                Value::Int(v) => Ok(Value::Int(-v)),
                other => Err(err(format!("cannot negate {}", other.type_name()))),
            },
            Expr::Not(inner) => match self.eval(inner, env)? {
                Value::Bool(v) => Ok(Value::Bool(!v)),
                other => Err(err(format!("cannot apply `not` to {}", other.type_name()))),
            },
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs, env)?;
                let r = self.eval(rhs, env)?;
                match op {
                    BinOp::And | BinOp::Or => match (l, r) {
                        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if *op == BinOp::And {
                            a && b
                        } else {
                            a || b
                        })),
                        (a, b) => Err(err(format!(
                            "boolean operator over {} and {}",
                            a.type_name(),
                            b.type_name()
                        ))),
                    },
                    _ => {
                        let (a, b) = match (l, r) {
                            (Value::Int(a), Value::Int(b)) => (a, b),
                            (a, b) => {
                                return Err(err(format!(
                                    "arithmetic over {} and {}",
                                    a.type_name(),
                                    b.type_name()
                                )))
                            }
                        };
                        Ok(match op {
                            BinOp::Add => Value::Int(a + b),
                            BinOp::Sub => Value::Int(a - b),
                            BinOp::Mul => Value::Int(a * b),
                            BinOp::FloorDiv => {
                                if b == 0 {
                                    return Err(err("division by zero".to_string()));
                                }
                                Value::Int(a.div_euclid(b))
                            }
                            BinOp::Eq => Value::Bool(a == b),
                            BinOp::Ne => Value::Bool(a != b),
                            BinOp::Lt => Value::Bool(a < b),
                            BinOp::Le => Value::Bool(a <= b),
                            BinOp::Gt => Value::Bool(a > b),
                            BinOp::Ge => Value::Bool(a >= b),
                            BinOp::And | BinOp::Or => unreachable!(),
                        })
                    }
                }
            }
        }
    }
}
