//! Plan execution.
//!
//! Operators are pull-based producers: `next_row() -> Result<Option<Row>>`.
//! Every operator shares an `ExecContext` carrying the plan deadline, cancel
//! flag, strict-mode switch, and memory budget; deadline and cancellation
//! are polled at I/O boundaries and every `poll_rows` rows.

pub mod agg;
pub mod join;
pub mod ops;
pub mod parallel;
pub mod scan;
pub mod spill;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use varve_store::{Datum, Row};

use crate::error::{EngineError, Result};
use crate::lang::ast::Expr;
use crate::lang::ops as lang_ops;
use crate::lang::value::Value;

/// Shared per-plan execution state.
pub struct ExecContext {
    pub deadline: Option<Instant>,
    pub cancel: Arc<AtomicBool>,
    pub strict: bool,
    pub memory_budget: usize,
    pub poll_rows: u64,
    ticks: AtomicU64,
}

impl ExecContext {
    pub fn new(
        deadline: Option<Instant>,
        cancel: Arc<AtomicBool>,
        strict: bool,
        memory_budget: usize,
        poll_rows: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            deadline,
            cancel,
            strict,
            memory_budget,
            poll_rows: poll_rows.max(1),
            ticks: AtomicU64::new(0),
        })
    }

    /// Unbounded context for internal plumbing and tests.
    pub fn unbounded() -> Arc<Self> {
        Self::new(None, Arc::new(AtomicBool::new(false)), false, usize::MAX, 4096)
    }

    /// Row-granularity poll: cheap counter bump, full check every
    /// `poll_rows` rows.
    pub fn tick(&self) -> Result<()> {
        let n = self.ticks.fetch_add(1, Ordering::Relaxed);
        if n % self.poll_rows == 0 {
            self.check_now()?;
        }
        Ok(())
    }

    /// Full deadline/cancel check, called at I/O boundaries.
    pub fn check_now(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(EngineError::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(EngineError::Timeout);
            }
        }
        Ok(())
    }
}

/// Pull-based row producer.
pub trait RowStream {
    fn columns(&self) -> &[String];
    fn next_row(&mut self) -> Result<Option<Row>>;
}

pub type BoxStream = Box<dyn RowStream>;

/// Drain a stream into a vector.
pub fn collect_rows(stream: &mut dyn RowStream) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    while let Some(row) = stream.next_row()? {
        out.push(row);
    }
    Ok(out)
}

/// A materialized stream.
pub struct VecStream {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
}

impl VecStream {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows: rows.into_iter() }
    }
}

impl RowStream for VecStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.next())
    }
}

// ---------------------------------------------------------------------------
// Row-scoped expression evaluation
// ---------------------------------------------------------------------------

/// Resolve a column reference against an output schema. Bare names match
/// exactly first, then as an unambiguous `table.name` suffix.
pub fn resolve_column(columns: &[String], name: &str) -> Result<usize> {
    if let Some(i) = columns.iter().position(|c| c == name) {
        return Ok(i);
    }
    let suffix = format!(".{name}");
    let matches: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.ends_with(&suffix))
        .map(|(i, _)| i)
        .collect();
    match matches.len() {
        1 => Ok(matches[0]),
        0 => Err(EngineError::Catalog(format!("unknown column {name}"))),
        _ => Err(EngineError::Catalog(format!("ambiguous column {name}"))),
    }
}

fn eval_value(expr: &Expr, columns: &[String], row: &Row) -> Result<Value> {
    use crate::lang::ast::BinOp;
    match expr {
        Expr::Literal(d) => Ok(Value::from_datum(d)),
        Expr::Ident(name) => {
            let i = resolve_column(columns, name)?;
            Ok(Value::from_datum(&row[i]))
        }
        Expr::Field(inner, name) => {
            // `t.col` qualified column reference.
            if let Expr::Ident(qualifier) = inner.as_ref() {
                let qualified = format!("{qualifier}.{name}");
                if let Some(i) = columns.iter().position(|c| c == &qualified) {
                    return Ok(Value::from_datum(&row[i]));
                }
            }
            let value = eval_value(inner, columns, row)?;
            Ok(lang_ops::field_value(value, name))
        }
        Expr::IndexAt(inner, index) => {
            let value = eval_value(inner, columns, row)?;
            let idx = eval_value(index, columns, row)?;
            lang_ops::index_value(value, idx)
        }
        Expr::Unary { op, expr } => {
            let value = eval_value(expr, columns, row)?;
            lang_ops::unary_op(*op, value)
        }
        Expr::Binary { op: BinOp::And, lhs, rhs } => {
            let l = eval_value(lhs, columns, row)?;
            if !l.is_truthy() {
                return Ok(l);
            }
            eval_value(rhs, columns, row)
        }
        Expr::Binary { op: BinOp::Or, lhs, rhs } => {
            let l = eval_value(lhs, columns, row)?;
            if l.is_truthy() {
                return Ok(l);
            }
            eval_value(rhs, columns, row)
        }
        Expr::Binary { op: BinOp::Coalesce, lhs, rhs } => {
            let l = eval_value(lhs, columns, row)?;
            if matches!(l, Value::Null) {
                eval_value(rhs, columns, row)
            } else {
                Ok(l)
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_value(lhs, columns, row)?;
            let r = eval_value(rhs, columns, row)?;
            lang_ops::binary_op(*op, l, r)
        }
        Expr::Cast { expr, ty } => {
            let parsed = lang_ops::CastTy::parse(ty)
                .ok_or_else(|| EngineError::Execution(format!("unknown cast target {ty}")))?;
            let value = eval_value(expr, columns, row)?;
            Ok(lang_ops::cast_value(value, parsed))
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_value(arg, columns, row)?);
            }
            lang_ops::call_builtin(name, &values)
        }
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_value(item, columns, row)?);
            }
            Ok(Value::List(out))
        }
        Expr::Aggregate { func, .. } => Err(EngineError::Internal(format!(
            "unresolved {} aggregate reached row evaluation",
            func.name()
        ))),
        other => Err(EngineError::Execution(format!(
            "expression {other:?} is not valid in a row context"
        ))),
    }
}

/// Evaluate an expression against one row. Row-local faults become NULL
/// unless strict mode promotes them to `Execution` errors.
pub fn eval_row_expr(expr: &Expr, columns: &[String], row: &Row, strict: bool) -> Result<Datum> {
    let value = eval_value(expr, columns, row)?;
    if let Value::Error { message, context } = &value {
        if strict {
            return Err(EngineError::Execution(format!("{message} ({context})")));
        }
        return Ok(Datum::Null);
    }
    value.to_datum().ok_or_else(|| {
        EngineError::Execution(format!("{} cannot be stored in a row", value.type_name()))
    })
}

/// Evaluate a predicate: errors count as non-matching unless strict.
pub fn row_matches(pred: &Expr, columns: &[String], row: &Row, strict: bool) -> Result<bool> {
    let value = eval_value(pred, columns, row)?;
    if let Value::Error { message, context } = &value {
        if strict {
            return Err(EngineError::Execution(format!("{message} ({context})")));
        }
        return Ok(false);
    }
    Ok(value.is_truthy())
}
