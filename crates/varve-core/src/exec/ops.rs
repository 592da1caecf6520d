//! Streaming operators: filter, project, distinct, order, limit.

use std::collections::HashSet;
use std::sync::Arc;

use varve_store::{Datum, Row};

use crate::error::Result;
use crate::lang::ast::Expr;

use super::spill::SpillSort;
use super::{eval_row_expr, row_matches, ExecContext, RowStream};

/// Filter by an arbitrary predicate expression.
pub struct FilterStream {
    input: Box<dyn RowStream>,
    predicate: Expr,
    ctx: Arc<ExecContext>,
}

impl FilterStream {
    pub fn new(input: Box<dyn RowStream>, predicate: Expr, ctx: Arc<ExecContext>) -> Self {
        Self { input, predicate, ctx }
    }
}

impl RowStream for FilterStream {
    fn columns(&self) -> &[String] {
        self.input.columns()
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        while let Some(row) = self.input.next_row()? {
            self.ctx.tick()?;
            if row_matches(&self.predicate, self.input.columns(), &row, self.ctx.strict)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Project expressions into a new schema.
pub struct ProjectStream {
    input: Box<dyn RowStream>,
    exprs: Vec<Expr>,
    columns: Vec<String>,
    ctx: Arc<ExecContext>,
}

impl ProjectStream {
    pub fn new(
        input: Box<dyn RowStream>,
        exprs: Vec<(Expr, String)>,
        ctx: Arc<ExecContext>,
    ) -> Self {
        let (exprs, columns) = exprs.into_iter().unzip();
        Self { input, exprs, columns, ctx }
    }
}

impl RowStream for ProjectStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(row) = self.input.next_row()? else { return Ok(None) };
        self.ctx.tick()?;
        let mut out = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            out.push(eval_row_expr(expr, self.input.columns(), &row, self.ctx.strict)?);
        }
        Ok(Some(out))
    }
}

/// DISTINCT: a hash set within the memory budget, switching to an external
/// sort-and-dedupe once the budget is exceeded.
pub struct DistinctStream {
    input: Option<Box<dyn RowStream>>,
    columns: Vec<String>,
    seen: HashSet<Row>,
    seen_bytes: usize,
    ctx: Arc<ExecContext>,
    spilled: Option<super::spill::SortedIter>,
    /// Rows already emitted through the in-memory path before the switch.
    already_emitted: HashSet<Row>,
    last_key: Option<Row>,
}

fn row_bytes(row: &Row) -> usize {
    row.iter()
        .map(|d| match d {
            Datum::Null | Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) | Datum::Timestamp(_) => 8,
            Datum::Str(s) => s.len() + 8,
            Datum::Binary(b) => b.len() + 8,
        })
        .sum::<usize>()
        + 16
}

impl DistinctStream {
    pub fn new(input: Box<dyn RowStream>, ctx: Arc<ExecContext>) -> Self {
        let columns = input.columns().to_vec();
        Self {
            input: Some(input),
            columns,
            seen: HashSet::new(),
            seen_bytes: 0,
            ctx,
            spilled: None,
            already_emitted: HashSet::new(),
            last_key: None,
        }
    }

    /// Budget exceeded: sort the not-yet-emitted row plus the rest of the
    /// input externally and dedupe on merge. Previously emitted rows are
    /// remembered so the output prefix does not repeat.
    fn switch_to_spill(&mut self, pending: Row) -> Result<()> {
        let mut input = self.input.take().expect("input is live until the switch");
        let mut sorter = SpillSort::new(vec![true; self.columns.len()], self.ctx.memory_budget);
        sorter.push(pending.clone(), pending)?;
        while let Some(row) = input.next_row()? {
            self.ctx.tick()?;
            sorter.push(row.clone(), row)?;
        }
        self.already_emitted = std::mem::take(&mut self.seen);
        self.seen_bytes = 0;
        self.spilled = Some(sorter.finish()?);
        Ok(())
    }

    fn serve_spilled(&mut self) -> Result<Option<Row>> {
        loop {
            let Some(item) = self.spilled.as_mut().and_then(Iterator::next) else {
                return Ok(None);
            };
            let (_, row) = item?;
            self.ctx.tick()?;
            if self.last_key.as_ref() == Some(&row) {
                continue;
            }
            self.last_key = Some(row.clone());
            if self.already_emitted.contains(&row) {
                continue;
            }
            return Ok(Some(row));
        }
    }
}

impl RowStream for DistinctStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.spilled.is_some() {
            return self.serve_spilled();
        }
        loop {
            let Some(input) = self.input.as_mut() else { return Ok(None) };
            let Some(row) = input.next_row()? else { return Ok(None) };
            self.ctx.tick()?;
            if self.seen.contains(&row) {
                continue;
            }
            self.seen_bytes += row_bytes(&row);
            if self.seen_bytes > self.ctx.memory_budget {
                self.switch_to_spill(row)?;
                return self.serve_spilled();
            }
            self.seen.insert(row.clone());
            return Ok(Some(row));
        }
    }
}

/// Stable ORDER BY with external merge past the memory budget.
pub struct OrderStream {
    inner: Option<OrderState>,
    columns: Vec<String>,
}

enum OrderState {
    Pending { input: Box<dyn RowStream>, keys: Vec<(Expr, bool)>, ctx: Arc<ExecContext> },
    Sorted(super::spill::SortedIter),
}

impl OrderStream {
    pub fn new(
        input: Box<dyn RowStream>,
        keys: Vec<(Expr, bool)>,
        ctx: Arc<ExecContext>,
    ) -> Self {
        let columns = input.columns().to_vec();
        Self { inner: Some(OrderState::Pending { input, keys, ctx }), columns }
    }
}

impl RowStream for OrderStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        if let Some(OrderState::Pending { .. }) = self.inner {
            let Some(OrderState::Pending { mut input, keys, ctx }) = self.inner.take() else {
                unreachable!("checked variant above")
            };
            let directions: Vec<bool> = keys.iter().map(|(_, asc)| *asc).collect();
            let mut sorter = SpillSort::new(directions, ctx.memory_budget);
            while let Some(row) = input.next_row()? {
                ctx.tick()?;
                let mut key = Vec::with_capacity(keys.len());
                for (expr, _) in &keys {
                    key.push(eval_row_expr(expr, input.columns(), &row, ctx.strict)?);
                }
                sorter.push(key, row)?;
            }
            self.inner = Some(OrderState::Sorted(sorter.finish()?));
        }
        match &mut self.inner {
            Some(OrderState::Sorted(iter)) => match iter.next() {
                Some(item) => Ok(Some(item?.1)),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

pub struct LimitStream {
    input: Box<dyn RowStream>,
    remaining: u64,
}

impl LimitStream {
    pub fn new(input: Box<dyn RowStream>, limit: u64) -> Self {
        Self { input, remaining: limit }
    }
}

impl RowStream for LimitStream {
    fn columns(&self) -> &[String] {
        self.input.columns()
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.input.next_row()? {
            Some(row) => {
                self.remaining -= 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::VecStream;
    use super::*;
    use crate::exec::collect_rows;
    use crate::lang::ast::Statement;
    use crate::lang::parser::parse_statement;

    fn expr_of(src: &str) -> Expr {
        let Statement::Expr(e) = parse_statement(src).unwrap() else { panic!() };
        e
    }

    fn input(rows: Vec<Vec<i64>>) -> Box<dyn RowStream> {
        Box::new(VecStream::new(
            vec!["id".into(), "v".into()],
            rows.into_iter().map(|r| r.into_iter().map(Datum::Int).collect()).collect(),
        ))
    }

    #[test]
    fn filter_applies_predicate() {
        let mut stream = FilterStream::new(
            input(vec![vec![1, 10], vec![2, 20], vec![3, 30]]),
            expr_of("id > 1"),
            ExecContext::unbounded(),
        );
        let rows = collect_rows(&mut stream).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn project_computes_expressions() {
        let mut stream = ProjectStream::new(
            input(vec![vec![1, 10]]),
            vec![(expr_of("v * 2"), "doubled".into()), (expr_of("id"), "id".into())],
            ExecContext::unbounded(),
        );
        assert_eq!(stream.columns(), &["doubled".to_string(), "id".to_string()]);
        let rows = collect_rows(&mut stream).unwrap();
        assert_eq!(rows[0], vec![Datum::Int(20), Datum::Int(1)]);
    }

    #[test]
    fn distinct_in_memory() {
        let mut stream = DistinctStream::new(
            input(vec![vec![1, 10], vec![1, 10], vec![2, 20], vec![1, 10]]),
            ExecContext::unbounded(),
        );
        let rows = collect_rows(&mut stream).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn distinct_spills_exactly() {
        // A 1-byte budget forces the external path immediately.
        let ctx = super::super::ExecContext::new(
            None,
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
            false,
            1,
            4096,
        );
        let rows: Vec<Vec<i64>> = (0..100).map(|i| vec![i % 10, (i % 10) * 2]).collect();
        let mut stream = DistinctStream::new(input(rows), ctx);
        let mut out = collect_rows(&mut stream).unwrap();
        out.sort();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn order_is_stable_and_directional() {
        let mut stream = OrderStream::new(
            input(vec![vec![2, 1], vec![1, 2], vec![2, 3], vec![1, 4]]),
            vec![(expr_of("id"), false)],
            ExecContext::unbounded(),
        );
        let rows = collect_rows(&mut stream).unwrap();
        // Descending by id; ties keep arrival order (v=1 then v=3).
        assert_eq!(rows[0], vec![Datum::Int(2), Datum::Int(1)]);
        assert_eq!(rows[1], vec![Datum::Int(2), Datum::Int(3)]);
        assert_eq!(rows[2], vec![Datum::Int(1), Datum::Int(2)]);
    }

    #[test]
    fn limit_truncates() {
        let mut stream = LimitStream::new(input(vec![vec![1, 1], vec![2, 2], vec![3, 3]]), 2);
        assert_eq!(collect_rows(&mut stream).unwrap().len(), 2);
    }
}
