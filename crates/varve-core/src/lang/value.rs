//! Runtime values of the procedural language.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use varve_store::Datum;

use super::ast::Expr;
use super::env::Capture;

/// A function value: parameters, body, and the captured lexical scope.
pub struct FunctionValue {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Rc<Expr>,
    pub captured: Capture,
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionValue({})", self.name.as_deref().unwrap_or("<anonymous>"))
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Number(f64),
    Str(String),
    Bool(bool),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Function(Rc<FunctionValue>),
    Error { message: String, context: String },
}

impl Value {
    pub fn error(message: impl Into<String>, context: impl Into<String>) -> Self {
        Value::Error { message: message.into(), context: context.into() }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
            Value::Function(_) => "function",
            Value::Error { .. } => "error",
        }
    }

    /// Glossary truthiness: `false`, `null`, `0`, `""`, empty list/struct are
    /// falsy; everything else (errors included) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Struct(fields) => !fields.is_empty(),
            Value::Function(_) | Value::Error { .. } => true,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error { .. })
    }

    /// Structural equality. Functions compare by identity; errors by message.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Struct(a), Value::Struct(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Error { message: a, .. }, Value::Error { message: b, .. }) => a == b,
            _ => false,
        }
    }

    /// Ordering for `<`/`>` style comparisons: numbers, strings, and bools
    /// order within their own type; anything else is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Convert a column datum into a language value.
    pub fn from_datum(d: &Datum) -> Value {
        match d {
            Datum::Null => Value::Null,
            Datum::Int(v) => Value::Number(*v as f64),
            Datum::Float(v) => Value::Number(*v),
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Str(s) => Value::Str(s.clone()),
            Datum::Timestamp(t) => Value::Number(*t as f64),
            Datum::Binary(b) => Value::Str(format!("0x{}", hex::encode(b))),
        }
    }

    /// Convert back into a datum where a natural mapping exists.
    pub fn to_datum(&self) -> Option<Datum> {
        match self {
            Value::Null => Some(Datum::Null),
            Value::Number(n) => {
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    Some(Datum::Int(*n as i64))
                } else {
                    Some(Datum::Float(*n))
                }
            }
            Value::Str(s) => Some(Datum::Str(s.clone())),
            Value::Bool(b) => Some(Datum::Bool(*b)),
            Value::List(_) | Value::Struct(_) | Value::Function(_) | Value::Error { .. } => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{b}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Struct(fields) => {
                f.write_str("{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Function(func) => {
                write!(f, "<function {}>", func.name.as_deref().unwrap_or("<anonymous>"))
            }
            Value::Error { message, context } => {
                if context.is_empty() {
                    write!(f, "error: {message}")
                } else {
                    write!(f, "error: {message} ({context})")
                }
            }
        }
    }
}
