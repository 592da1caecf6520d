//! Inner joins: hash join on equi-predicates, nested-loop fallback.

use std::collections::HashMap;
use std::sync::Arc;

use varve_store::{Datum, Row};

use crate::error::Result;
use crate::lang::ast::{BinOp, Expr};

use super::{eval_row_expr, resolve_column, row_matches, ExecContext, RowStream, VecStream};

/// An equi-join key pair: expressions over the left and right schemas.
struct EquiKey {
    left: Expr,
    right: Expr,
}

/// Find `left_col == right_col` conjuncts in the ON expression. Column
/// sides are identified against the two input schemas.
fn extract_equi_keys(on: &Expr, left_cols: &[String], right_cols: &[String]) -> Vec<EquiKey> {
    fn side_of(expr: &Expr, left: &[String], right: &[String]) -> Option<bool> {
        // true = left, false = right; None when unresolvable or ambiguous.
        let name = match expr {
            Expr::Ident(name) => name.clone(),
            Expr::Field(inner, field) => match inner.as_ref() {
                Expr::Ident(qualifier) => format!("{qualifier}.{field}"),
                _ => return None,
            },
            _ => return None,
        };
        let in_left = resolve_column(left, &name).is_ok();
        let in_right = resolve_column(right, &name).is_ok();
        match (in_left, in_right) {
            (true, false) => Some(true),
            (false, true) => Some(false),
            _ => None,
        }
    }

    fn walk(expr: &Expr, left: &[String], right: &[String], out: &mut Vec<EquiKey>) {
        match expr {
            Expr::Binary { op: BinOp::And, lhs, rhs } => {
                walk(lhs, left, right, out);
                walk(rhs, left, right, out);
            }
            Expr::Binary { op: BinOp::Eq, lhs, rhs } => {
                match (side_of(lhs, left, right), side_of(rhs, left, right)) {
                    (Some(true), Some(false)) => out.push(EquiKey {
                        left: (**lhs).clone(),
                        right: (**rhs).clone(),
                    }),
                    (Some(false), Some(true)) => out.push(EquiKey {
                        left: (**rhs).clone(),
                        right: (**lhs).clone(),
                    }),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(on, left_cols, right_cols, &mut out);
    out
}

/// Qualify a schema with its table name so joined outputs stay unambiguous.
pub fn qualify_columns(table: &str, columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| format!("{table}.{c}")).collect()
}

/// Inner join. Builds a hash table on the smaller side when the ON clause
/// carries at least one equality; otherwise falls back to a nested loop.
/// The residual ON predicate is re-checked on every candidate pair.
pub fn join(
    left: &mut dyn RowStream,
    right: &mut dyn RowStream,
    on: &Expr,
    build_left: bool,
    ctx: &Arc<ExecContext>,
) -> Result<VecStream> {
    let left_cols = left.columns().to_vec();
    let right_cols = right.columns().to_vec();
    let mut out_cols = left_cols.clone();
    out_cols.extend(right_cols.clone());

    let left_rows = super::collect_rows(left)?;
    let right_rows = super::collect_rows(right)?;
    let keys = extract_equi_keys(on, &left_cols, &right_cols);

    let mut out_rows: Vec<Row> = Vec::new();
    let combined = |l: &Row, r: &Row| -> Row {
        let mut row = l.clone();
        row.extend(r.iter().cloned());
        row
    };

    if keys.is_empty() {
        // Nested loop.
        for l in &left_rows {
            for r in &right_rows {
                ctx.tick()?;
                let row = combined(l, r);
                if row_matches(on, &out_cols, &row, ctx.strict)? {
                    out_rows.push(row);
                }
            }
        }
        return Ok(VecStream::new(out_cols, out_rows));
    }

    let key_of = |row: &Row, cols: &[String], exprs: &[&Expr]| -> Result<Option<Vec<Datum>>> {
        let mut key = Vec::with_capacity(exprs.len());
        for expr in exprs {
            let datum = eval_row_expr(expr, cols, row, ctx.strict)?;
            if datum.is_null() {
                return Ok(None); // NULL never joins
            }
            key.push(datum);
        }
        Ok(Some(key))
    };
    let left_exprs: Vec<&Expr> = keys.iter().map(|k| &k.left).collect();
    let right_exprs: Vec<&Expr> = keys.iter().map(|k| &k.right).collect();

    let (build_rows, build_cols, build_exprs, probe_rows, probe_cols, probe_exprs) = if build_left
    {
        (&left_rows, &left_cols, &left_exprs, &right_rows, &right_cols, &right_exprs)
    } else {
        (&right_rows, &right_cols, &right_exprs, &left_rows, &left_cols, &left_exprs)
    };

    let mut table: HashMap<Vec<Datum>, Vec<usize>> = HashMap::new();
    for (i, row) in build_rows.iter().enumerate() {
        ctx.tick()?;
        if let Some(key) = key_of(row, build_cols, build_exprs)? {
            table.entry(key).or_default().push(i);
        }
    }

    for probe in probe_rows {
        ctx.tick()?;
        let Some(key) = key_of(probe, probe_cols, probe_exprs)? else { continue };
        let Some(matches) = table.get(&key) else { continue };
        for &i in matches {
            let row = if build_left {
                combined(&build_rows[i], probe)
            } else {
                combined(probe, &build_rows[i])
            };
            // Residual predicates beyond the equi-keys still apply.
            if row_matches(on, &out_cols, &row, ctx.strict)? {
                out_rows.push(row);
            }
        }
    }
    Ok(VecStream::new(out_cols, out_rows))
}

#[cfg(test)]
mod tests {
    use super::super::collect_rows;
    use super::*;
    use crate::lang::ast::Statement;
    use crate::lang::parser::parse_statement;

    fn expr_of(src: &str) -> Expr {
        let Statement::Expr(e) = parse_statement(src).unwrap() else { panic!() };
        e
    }

    fn users() -> VecStream {
        VecStream::new(
            qualify_columns("users", &["id".into(), "name".into()]),
            vec![
                vec![Datum::Int(1), Datum::Str("ada".into())],
                vec![Datum::Int(2), Datum::Str("grace".into())],
                vec![Datum::Int(3), Datum::Str("edsger".into())],
            ],
        )
    }

    fn orders() -> VecStream {
        VecStream::new(
            qualify_columns("orders", &["uid".into(), "total".into()]),
            vec![
                vec![Datum::Int(1), Datum::Int(100)],
                vec![Datum::Int(2), Datum::Int(50)],
                vec![Datum::Int(1), Datum::Int(25)],
                vec![Datum::Null, Datum::Int(1)],
            ],
        )
    }

    #[test]
    fn hash_join_on_equality() {
        let mut left = users();
        let mut right = orders();
        let mut joined = join(
            &mut left,
            &mut right,
            &expr_of("id == uid"),
            true,
            &ExecContext::unbounded(),
        )
        .unwrap();
        let rows = collect_rows(&mut joined).unwrap();
        assert_eq!(rows.len(), 3);
        // Probe order drives output order; null uid never joins.
        assert_eq!(rows[0][0], Datum::Int(1));
        assert_eq!(rows[1][0], Datum::Int(2));
    }

    #[test]
    fn build_side_choice_does_not_change_results() {
        let run = |build_left: bool| {
            let mut left = users();
            let mut right = orders();
            let mut joined = join(
                &mut left,
                &mut right,
                &expr_of("id == uid"),
                build_left,
                &ExecContext::unbounded(),
            )
            .unwrap();
            let mut rows = collect_rows(&mut joined).unwrap();
            rows.sort();
            rows
        };
        assert_eq!(run(true), run(false));
    }

    #[test]
    fn qualified_on_clause() {
        let mut left = users();
        let mut right = orders();
        let mut joined = join(
            &mut left,
            &mut right,
            &expr_of("users.id == orders.uid"),
            true,
            &ExecContext::unbounded(),
        )
        .unwrap();
        assert_eq!(collect_rows(&mut joined).unwrap().len(), 3);
    }

    #[test]
    fn residual_predicate_filters_pairs() {
        let mut left = users();
        let mut right = orders();
        let mut joined = join(
            &mut left,
            &mut right,
            &expr_of("id == uid AND total > 30"),
            true,
            &ExecContext::unbounded(),
        )
        .unwrap();
        let rows = collect_rows(&mut joined).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn nested_loop_when_no_equality() {
        let mut left = users();
        let mut right = orders();
        let mut joined = join(
            &mut left,
            &mut right,
            &expr_of("id < uid"),
            true,
            &ExecContext::unbounded(),
        )
        .unwrap();
        let rows = collect_rows(&mut joined).unwrap();
        // id 1 joins uid 2; nothing else satisfies id < uid.
        assert_eq!(rows.len(), 1);
    }
}
