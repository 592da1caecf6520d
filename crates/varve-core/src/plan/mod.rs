//! Query planning: normalized query text, sargable conditions, access paths,
//! and the cost model.

pub mod normalize;
pub mod planner;

use varve_store::{Datum, PrunePredicate, TableDef};

use crate::cache::Fingerprint;

pub use normalize::{normalize_expr, normalize_select};
pub use planner::{plan_table_access, PlannerInputs};

/// Access method chosen for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOp {
    SeqScan,
    IndexScan { index: String },
    ParallelScan,
    ViewScan { view: String },
}

impl AccessOp {
    pub fn tag(&self) -> &'static str {
        match self {
            AccessOp::SeqScan => "seq_scan",
            AccessOp::IndexScan { .. } => "index_scan",
            AccessOp::ParallelScan => "parallel_scan",
            AccessOp::ViewScan { .. } => "view_scan",
        }
    }
}

/// Sargable comparison operators. `!=` is not sargable and stays in the
/// residual filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One `column <op> constant` conjunct extracted from WHERE.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CmpOp,
    pub value: Datum,
}

/// The plan the executor consumes verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub op: AccessOp,
    pub table: String,
    pub conditions: Vec<Condition>,
    pub degree: usize,
    pub cost: f64,
    pub estimated_rows: u64,
}

impl QueryPlan {
    pub fn fingerprint(&self, normalized_query: &str) -> Fingerprint {
        Fingerprint::new(normalized_query, self.op.tag(), self.degree)
    }
}

/// Table-level statistics gathered from stripe footers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub row_count: u64,
    pub stripe_count: u64,
    /// Stripes surviving footer pruning under the query's conditions.
    pub surviving_stripes: u64,
}

/// What the planner knows about one index.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub name: String,
    pub kind: varve_store::IndexKind,
    pub columns: Vec<String>,
    pub unique: bool,
    pub key_count: usize,
    /// Built from an older stripe set; must be ignored until rebuilt.
    pub stale: bool,
}

/// Extract sargable conjuncts from a WHERE expression. Anything that is not
/// a `column <op> literal` under a conjunction stays residual.
pub fn extract_conditions(expr: &crate::lang::ast::Expr) -> Vec<Condition> {
    use crate::lang::ast::{BinOp, Expr};

    fn leaf(op: BinOp, lhs: &Expr, rhs: &Expr, out: &mut Vec<Condition>) {
        let (column, value, op) = match (lhs, rhs) {
            (Expr::Ident(c), Expr::Literal(v)) => {
                let mapped = match op {
                    BinOp::Eq => CmpOp::Eq,
                    BinOp::Lt => CmpOp::Lt,
                    BinOp::Le => CmpOp::Le,
                    BinOp::Gt => CmpOp::Gt,
                    BinOp::Ge => CmpOp::Ge,
                    _ => return,
                };
                (c.clone(), v.clone(), mapped)
            }
            (Expr::Literal(v), Expr::Ident(c)) => {
                // Flip the comparison around the constant.
                let mapped = match op {
                    BinOp::Eq => CmpOp::Eq,
                    BinOp::Lt => CmpOp::Gt,
                    BinOp::Le => CmpOp::Ge,
                    BinOp::Gt => CmpOp::Lt,
                    BinOp::Ge => CmpOp::Le,
                    _ => return,
                };
                (c.clone(), v.clone(), mapped)
            }
            _ => return,
        };
        if !value.is_null() {
            out.push(Condition { column, value, op });
        }
    }

    fn walk(expr: &Expr, out: &mut Vec<Condition>) {
        match expr {
            Expr::Binary { op: BinOp::And, lhs, rhs } => {
                walk(lhs, out);
                walk(rhs, out);
            }
            Expr::Binary { op, lhs, rhs } => leaf(*op, lhs, rhs, out),
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(expr, &mut out);
    out
}

/// Map conditions onto footer prune predicates for a table layout.
pub fn prune_predicates(conditions: &[Condition], table: &TableDef) -> Vec<PrunePredicate> {
    let mut out = Vec::new();
    for cond in conditions {
        let Ok(column) = table.column_index(&cond.column) else { continue };
        let pred = match cond.op {
            CmpOp::Eq => PrunePredicate::Membership { column, values: vec![cond.value.clone()] },
            CmpOp::Lt => PrunePredicate::Range {
                column,
                lo: None,
                hi: Some(cond.value.clone()),
                lo_inclusive: true,
                hi_inclusive: false,
            },
            CmpOp::Le => PrunePredicate::Range {
                column,
                lo: None,
                hi: Some(cond.value.clone()),
                lo_inclusive: true,
                hi_inclusive: true,
            },
            CmpOp::Gt => PrunePredicate::Range {
                column,
                lo: Some(cond.value.clone()),
                hi: None,
                lo_inclusive: false,
                hi_inclusive: true,
            },
            CmpOp::Ge => PrunePredicate::Range {
                column,
                lo: Some(cond.value.clone()),
                hi: None,
                lo_inclusive: true,
                hi_inclusive: true,
            },
        };
        out.push(pred);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse_statement;
    use crate::lang::ast::Statement;

    fn where_of(src: &str) -> crate::lang::ast::Expr {
        let Statement::Select(select) = parse_statement(src).unwrap() else { panic!() };
        select.where_clause.unwrap()
    }

    #[test]
    fn extracts_conjunctive_leaves() {
        let conds =
            extract_conditions(&where_of("SELECT * FROM t WHERE id > 1 AND v = 10 AND name == 'x'"));
        assert_eq!(conds.len(), 3);
        assert_eq!(conds[0], Condition { column: "id".into(), op: CmpOp::Gt, value: Datum::Int(1) });
        assert_eq!(conds[1].op, CmpOp::Eq);
    }

    #[test]
    fn flipped_comparison_normalizes() {
        let conds = extract_conditions(&where_of("SELECT * FROM t WHERE 5 < id"));
        assert_eq!(conds, vec![Condition { column: "id".into(), op: CmpOp::Gt, value: Datum::Int(5) }]);
    }

    #[test]
    fn disjunctions_and_residuals_skipped() {
        let conds = extract_conditions(&where_of("SELECT * FROM t WHERE id = 1 OR v = 2"));
        assert!(conds.is_empty());
        let conds = extract_conditions(&where_of("SELECT * FROM t WHERE id != 3 AND v = 2"));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].column, "v");
    }

    #[test]
    fn fingerprint_ties_plan_to_query() {
        let plan = QueryPlan {
            op: AccessOp::SeqScan,
            table: "t".into(),
            conditions: vec![],
            degree: 1,
            cost: 10.0,
            estimated_rows: 10,
        };
        assert_ne!(plan.fingerprint("SELECT A"), plan.fingerprint("SELECT B"));
    }
}
