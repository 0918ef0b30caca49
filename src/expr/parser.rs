//! Recursive-descent parser producing a positional AST.
//!
//! Precedence, lowest first: `|`, `&`, comparisons, `+ -`, `* / %`,
//! unary `- + ! ~`, power (`**` or `^`, right associative).

use crate::error::ExprError;

use super::lexer::{Spanned, Token};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Func {
    Abs,
    Min,
    Max,
    Sqrt,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" | "Abs" => Some(Func::Abs),
            "min" | "Min" => Some(Func::Min),
            "max" | "Max" => Some(Func::Max),
            "sqrt" => Some(Func::Sqrt),
            _ => None,
        }
    }

    /// `None` means variadic with at least one argument.
    fn arity(self) -> Option<usize> {
        match self {
            Func::Abs | Func::Sqrt => Some(1),
            Func::Min | Func::Max => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Num(f64),
    Bool(bool),
    Var(usize),
    Unary(UnOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

pub(crate) struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    end: usize,
    /// Free variable names in first-appearance order; `Node::Var` indexes this.
    pub variables: Vec<String>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Spanned], text_len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end: text_len,
            variables: Vec::new(),
        }
    }

    pub fn parse(&mut self) -> Result<Node, ExprError> {
        if self.tokens.is_empty() {
            return Err(ExprError::Parse {
                position: 0,
                message: "empty expression".into(),
            });
        }
        let node = self.or_expr()?;
        if let Some(extra) = self.tokens.get(self.pos) {
            return Err(ExprError::Parse {
                position: extra.position,
                message: format!("unexpected token {:?}", extra.token),
            });
        }
        Ok(node)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |s| s.position)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExprError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(ExprError::Parse {
                position: self.position(),
                message: format!("expected {what}"),
            })
        }
    }

    fn or_expr(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.comparison()?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Node, ExprError> {
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
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Node::Unary(UnOp::Neg, Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Node::Unary(UnOp::Not, Box::new(self.unary()?)))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Node, ExprError> {
        let base = self.primary()?;
        if self.eat(&Token::Pow) {
            // Right associative, and the exponent may carry its own sign.
            let exponent = self.unary()?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let position = self.position();
        let Some(token) = self.peek().cloned() else {
            return Err(ExprError::Parse {
                position,
                message: "unexpected end of expression".into(),
            });
        };
        self.pos += 1;

        match token {
            Token::Number(v) => Ok(Node::Num(v)),
            Token::LParen => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    return self.call(name, position);
                }
                match name.as_str() {
                    "True" | "true" => Ok(Node::Bool(true)),
                    "False" | "false" => Ok(Node::Bool(false)),
                    _ => Ok(Node::Var(self.intern(name))),
                }
            }
            other => Err(ExprError::Parse {
                position,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }

    fn call(&mut self, name: String, position: usize) -> Result<Node, ExprError> {
        let func = Func::lookup(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.or_expr()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, "`,` or `)` in argument list")?;
                break;
            }
        }

        match func.arity() {
            Some(expected) if expected != args.len() => Err(ExprError::Arity {
                name,
                expected,
                got: args.len(),
            }),
            None if args.is_empty() => Err(ExprError::Parse {
                position,
                message: format!("`{name}` needs at least one argument"),
            }),
            _ => Ok(Node::Call(func, args)),
        }
    }

    fn intern(&mut self, name: String) -> usize {
        if let Some(idx) = self.variables.iter().position(|v| *v == name) {
            return idx;
        }
        self.variables.push(name);
        self.variables.len() - 1
    }
}
