//! Operator and builtin semantics shared by the AST evaluator and the
//! hot-path compiled form. Both dispatch through these functions, which is
//! what makes specialization observationally equivalent.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

use super::ast::{BinOp, UnOp};
use super::value::Value;

/// Arithmetic and comparison. `and`/`or`/`??` short-circuit and are handled
/// by the callers. Error values propagate; NULL propagates through
/// arithmetic and ordering.
pub fn binary_op(op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
    if let Value::Error { .. } = lhs {
        return Ok(lhs);
    }
    if let Value::Error { .. } = rhs {
        return Ok(rhs);
    }
    match op {
        BinOp::Eq => Ok(Value::Bool(lhs.loose_eq(&rhs))),
        BinOp::Ne => Ok(Value::Bool(!lhs.loose_eq(&rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            if matches!(lhs, Value::Null) || matches!(rhs, Value::Null) {
                return Ok(Value::Null);
            }
            match lhs.compare(&rhs) {
                Some(ord) => {
                    let result = match op {
                        BinOp::Lt => ord.is_lt(),
                        BinOp::Le => ord.is_le(),
                        BinOp::Gt => ord.is_gt(),
                        _ => ord.is_ge(),
                    };
                    Ok(Value::Bool(result))
                }
                None => Ok(Value::error(
                    format!("cannot compare {} and {}", lhs.type_name(), rhs.type_name()),
                    "comparison",
                )),
            }
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            arithmetic(op, lhs, rhs)
        }
        BinOp::And | BinOp::Or | BinOp::Coalesce => Err(EngineError::Internal(
            "short-circuit operators must not reach binary_op".to_string(),
        )),
    }
}

fn arithmetic(op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
    if matches!(lhs, Value::Null) || matches!(rhs, Value::Null) {
        return Ok(Value::Null);
    }
    if op == BinOp::Add {
        if let (Value::Str(a), Value::Str(b)) = (&lhs, &rhs) {
            return Ok(Value::Str(format!("{a}{b}")));
        }
        if let (Value::List(a), Value::List(b)) = (&lhs, &rhs) {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            return Ok(Value::List(out));
        }
    }
    let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) else {
        return Ok(Value::error(
            format!("cannot {} {} and {}", op.symbol(), lhs.type_name(), rhs.type_name()),
            "arithmetic",
        ));
    };
    let (a, b) = (*a, *b);
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Ok(Value::error("division by zero", "arithmetic"));
            }
            a / b
        }
        BinOp::Rem => {
            if b == 0.0 {
                return Ok(Value::error("division by zero", "arithmetic"));
            }
            a % b
        }
        _ => unreachable!("arithmetic dispatch"),
    };
    Ok(Value::Number(result))
}

pub fn unary_op(op: UnOp, value: Value) -> Result<Value> {
    if let Value::Error { .. } = value {
        return Ok(value);
    }
    match op {
        UnOp::Neg => match value {
            Value::Number(n) => Ok(Value::Number(-n)),
            Value::Null => Ok(Value::Null),
            other => Ok(Value::error(
                format!("cannot negate {}", other.type_name()),
                "arithmetic",
            )),
        },
        UnOp::Not => Ok(Value::Bool(!value.is_truthy())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastTy {
    Int,
    Float,
    Str,
    Bool,
}

impl CastTy {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => Some(CastTy::Int),
            "float" | "double" | "number" => Some(CastTy::Float),
            "string" | "str" | "text" => Some(CastTy::Str),
            "bool" | "boolean" => Some(CastTy::Bool),
            _ => None,
        }
    }
}

/// `expr :: type`. A failed conversion yields an error value, which strict
/// mode later promotes.
pub fn cast_value(value: Value, ty: CastTy) -> Value {
    if value.is_error() {
        return value;
    }
    match (ty, &value) {
        (_, Value::Null) => Value::Null,
        (CastTy::Int, Value::Number(n)) => Value::Number(n.trunc()),
        (CastTy::Int, Value::Str(s)) => match s.trim().parse::<f64>() {
            Ok(n) => Value::Number(n.trunc()),
            Err(_) => Value::error(format!("cannot cast '{s}' to int"), "cast"),
        },
        (CastTy::Int, Value::Bool(b)) => Value::Number(if *b { 1.0 } else { 0.0 }),
        (CastTy::Float, Value::Number(_)) => value,
        (CastTy::Float, Value::Str(s)) => match s.trim().parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::error(format!("cannot cast '{s}' to float"), "cast"),
        },
        (CastTy::Float, Value::Bool(b)) => Value::Number(if *b { 1.0 } else { 0.0 }),
        (CastTy::Str, _) => Value::Str(value.to_string()),
        (CastTy::Bool, _) => Value::Bool(value.is_truthy()),
        _ => Value::error(
            format!("cannot cast {} to {ty:?}", value.type_name()),
            "cast",
        ),
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

pub const BUILTIN_NAMES: &[&str] = &[
    "len", "abs", "floor", "ceil", "sqrt", "str", "num", "range", "push", "keys", "error",
    "is_error", "is_null", "upper", "lower",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

fn arity_error(name: &str, expected: &str, got: usize) -> EngineError {
    EngineError::Execution(format!("{name} expects {expected} argument(s), got {got}"))
}

pub fn call_builtin(name: &str, args: &[Value]) -> Result<Value> {
    // Error values short-circuit through builtins too.
    if let Some(err) = args.iter().find(|a| a.is_error()) {
        if name != "is_error" && name != "str" {
            return Ok(err.clone());
        }
    }
    match name {
        "len" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            match arg {
                Value::Str(s) => Ok(Value::Number(s.chars().count() as f64)),
                Value::List(items) => Ok(Value::Number(items.len() as f64)),
                Value::Struct(fields) => Ok(Value::Number(fields.len() as f64)),
                other => Ok(Value::error(
                    format!("len of {}", other.type_name()),
                    "builtin",
                )),
            }
        }
        "abs" | "floor" | "ceil" | "sqrt" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            match arg {
                Value::Number(n) => {
                    let result = match name {
                        "abs" => n.abs(),
                        "floor" => n.floor(),
                        "ceil" => n.ceil(),
                        _ => {
                            if *n < 0.0 {
                                return Ok(Value::error("sqrt of negative number", "builtin"));
                            }
                            n.sqrt()
                        }
                    };
                    Ok(Value::Number(result))
                }
                Value::Null => Ok(Value::Null),
                other => Ok(Value::error(
                    format!("{name} of {}", other.type_name()),
                    "builtin",
                )),
            }
        }
        "str" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            Ok(Value::Str(arg.to_string()))
        }
        "num" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            Ok(cast_value(arg.clone(), CastTy::Float))
        }
        "range" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            match arg {
                Value::Number(n) if *n >= 0.0 => {
                    let count = *n as usize;
                    Ok(Value::List((0..count).map(|i| Value::Number(i as f64)).collect()))
                }
                other => Ok(Value::error(
                    format!("range of {}", other.type_name()),
                    "builtin",
                )),
            }
        }
        "push" => {
            let [list, item] = args else { return Err(arity_error(name, "2", args.len())) };
            match list {
                Value::List(items) => {
                    let mut out = items.clone();
                    out.push(item.clone());
                    Ok(Value::List(out))
                }
                other => Ok(Value::error(
                    format!("push to {}", other.type_name()),
                    "builtin",
                )),
            }
        }
        "keys" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            match arg {
                Value::Struct(fields) => {
                    Ok(Value::List(fields.keys().map(|k| Value::Str(k.clone())).collect()))
                }
                other => Ok(Value::error(
                    format!("keys of {}", other.type_name()),
                    "builtin",
                )),
            }
        }
        "error" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            Ok(Value::error(arg.to_string(), "user"))
        }
        "is_error" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            Ok(Value::Bool(arg.is_error()))
        }
        "is_null" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            Ok(Value::Bool(matches!(arg, Value::Null)))
        }
        "upper" | "lower" => {
            let [arg] = args else { return Err(arity_error(name, "1", args.len())) };
            match arg {
                Value::Str(s) => Ok(Value::Str(if name == "upper" {
                    s.to_uppercase()
                } else {
                    s.to_lowercase()
                })),
                Value::Null => Ok(Value::Null),
                other => Ok(Value::error(
                    format!("{name} of {}", other.type_name()),
                    "builtin",
                )),
            }
        }
        _ => Err(EngineError::Execution(format!("unknown function {name}"))),
    }
}

/// `expr[index]`: lists index by number, structs by key.
pub fn index_value(value: Value, index: Value) -> Result<Value> {
    if value.is_error() {
        return Ok(value);
    }
    match (&value, &index) {
        (Value::List(items), Value::Number(n)) => {
            let i = *n as i64;
            if i < 0 || i as usize >= items.len() {
                Ok(Value::error(format!("index {i} out of bounds"), "index"))
            } else {
                Ok(items[i as usize].clone())
            }
        }
        (Value::Struct(fields), Value::Str(key)) => {
            Ok(fields.get(key).cloned().unwrap_or(Value::Null))
        }
        _ => Ok(Value::error(
            format!("cannot index {} with {}", value.type_name(), index.type_name()),
            "index",
        )),
    }
}

/// `expr.field` on a struct; missing fields read as NULL.
pub fn field_value(value: Value, name: &str) -> Value {
    match value {
        Value::Struct(fields) => fields.get(name).cloned().unwrap_or(Value::Null),
        Value::Error { .. } => value,
        other => Value::error(format!("no field {name} on {}", other.type_name()), "field"),
    }
}

/// Build a struct value (used by both evaluators for struct literals).
pub fn make_struct(fields: Vec<(String, Value)>) -> Value {
    let mut map = BTreeMap::new();
    for (k, v) in fields {
        map.insert(k, v);
    }
    Value::Struct(map)
}
