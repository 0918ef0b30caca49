//! Symbolic boolean/arithmetic expressions over named data points.
//!
//! Expressions are compiled once, when configuration is loaded, into an
//! AST whose variables are positional indices into an ordered name list.
//! Evaluation binds a value per name and walks the tree; nothing is
//! reparsed per tick.

mod lexer;
mod parser;

use std::collections::HashMap;
use std::fmt;

use crate::error::ExprError;

use parser::{BinOp, Func, Node, Parser, UnOp};

/// Result of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    /// Numeric view; booleans become `1.0` / `0.0`.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Number(v) => v,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
        }
    }

    /// Truth view; any non-zero, non-NaN number is true.
    pub fn truthy(self) -> bool {
        match self {
            Value::Number(v) => v != 0.0 && !v.is_nan(),
            Value::Bool(b) => b,
        }
    }

    /// Returns the value only when it is a finite number.
    pub fn finite_number(self) -> Option<f64> {
        match self {
            Value::Number(v) if v.is_finite() => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A parsed expression ready for repeated evaluation.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use ilc_engine::expr::{CompiledExpr, Value};
///
/// let expr = CompiledExpr::compile("(fan_status == 1) & (zone_temp < 78)").unwrap();
/// let bindings = HashMap::from([("fan_status".to_string(), 1.0), ("zone_temp".to_string(), 74.0)]);
/// assert_eq!(expr.evaluate(&bindings).unwrap(), Value::Bool(true));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    root: Node,
    variables: Vec<String>,
}

impl CompiledExpr {
    /// Parses `text` into a reusable expression.
    ///
    /// # Errors
    ///
    /// Returns `ExprError::Parse`, `UnknownFunction`, or `Arity` when the
    /// text is not a well-formed expression.
    pub fn compile(text: &str) -> Result<Self, ExprError> {
        let tokens = lexer::tokenize(text)?;
        let mut parser = Parser::new(&tokens, text.len());
        let root = parser.parse()?;
        Ok(Self {
            source: text.to_string(),
            root,
            variables: parser.variables,
        })
    }

    /// Joins condition fragments the way multi-part eligibility conditions
    /// are written in configuration: every fragment is parenthesised except
    /// bare `&` / `|` connectives.
    ///
    /// `["a > 1", "&", "b < 2"]` compiles as `(a > 1)&(b < 2)`.
    pub fn compile_fragments<S: AsRef<str>>(fragments: &[S]) -> Result<Self, ExprError> {
        let mut text = String::new();
        for fragment in fragments {
            let fragment = fragment.as_ref().trim();
            if matches!(fragment, "&" | "|" | "&&" | "||") {
                text.push_str(fragment);
            } else {
                text.push('(');
                text.push_str(fragment);
                text.push(')');
            }
        }
        Self::compile(&text)
    }

    /// Free variable names in first-appearance order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates against named bindings.
    ///
    /// # Errors
    ///
    /// Returns `ExprError::MissingBinding` naming the first variable that has
    /// no entry in `bindings`; no default is substituted.
    pub fn evaluate(&self, bindings: &HashMap<String, f64>) -> Result<Value, ExprError> {
        let mut values = Vec::with_capacity(self.variables.len());
        for name in &self.variables {
            let v = bindings
                .get(name)
                .copied()
                .ok_or_else(|| ExprError::MissingBinding(name.clone()))?;
            values.push(v);
        }
        Ok(eval(&self.root, &values))
    }

    /// Evaluates with values given positionally, in [`Self::variables`] order.
    ///
    /// # Errors
    ///
    /// Returns `ExprError::MissingBinding` for the first variable without a
    /// positional value.
    pub fn evaluate_positional(&self, values: &[f64]) -> Result<Value, ExprError> {
        if let Some(missing) = self.variables.get(values.len()) {
            return Err(ExprError::MissingBinding(missing.clone()));
        }
        Ok(eval(&self.root, values))
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(node: &Node, values: &[f64]) -> Value {
    match node {
        Node::Num(v) => Value::Number(*v),
        Node::Bool(b) => Value::Bool(*b),
        Node::Var(idx) => Value::Number(values[*idx]),
        Node::Unary(UnOp::Neg, inner) => Value::Number(-eval(inner, values).as_f64()),
        Node::Unary(UnOp::Not, inner) => Value::Bool(!eval(inner, values).truthy()),
        Node::And(lhs, rhs) => {
            if !eval(lhs, values).truthy() {
                return Value::Bool(false);
            }
            Value::Bool(eval(rhs, values).truthy())
        }
        Node::Or(lhs, rhs) => {
            if eval(lhs, values).truthy() {
                return Value::Bool(true);
            }
            Value::Bool(eval(rhs, values).truthy())
        }
        Node::Binary(op, lhs, rhs) => {
            let a = eval(lhs, values).as_f64();
            let b = eval(rhs, values).as_f64();
            match op {
                BinOp::Add => Value::Number(a + b),
                BinOp::Sub => Value::Number(a - b),
                BinOp::Mul => Value::Number(a * b),
                BinOp::Div => Value::Number(a / b),
                BinOp::Rem => Value::Number(a % b),
                BinOp::Pow => Value::Number(a.powf(b)),
                BinOp::Lt => Value::Bool(a < b),
                BinOp::Le => Value::Bool(a <= b),
                BinOp::Gt => Value::Bool(a > b),
                BinOp::Ge => Value::Bool(a >= b),
                BinOp::Eq => Value::Bool(a == b),
                BinOp::Ne => Value::Bool(a != b),
            }
        }
        Node::Call(func, args) => {
            let mut nums = args.iter().map(|a| eval(a, values).as_f64());
            match func {
                Func::Abs => Value::Number(nums.next().unwrap_or(0.0).abs()),
                Func::Sqrt => Value::Number(nums.next().unwrap_or(0.0).sqrt()),
                Func::Min => Value::Number(nums.fold(f64::INFINITY, f64::min)),
                Func::Max => Value::Number(nums.fold(f64::NEG_INFINITY, f64::max)),
            }
        }
    }
}

/// Strips all whitespace from a configured point name.
///
/// Telemetry keys and configured argument names are both normalised this
/// way so that `"Zone Temperature"` and `"ZoneTemperature"` address the same
/// point.
pub fn normalize_point_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}
