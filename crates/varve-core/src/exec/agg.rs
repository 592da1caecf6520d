//! Hash aggregation with mergeable per-aggregate state.
//!
//! Every aggregate state is associative and encodable as a fixed run of
//! datums, so the same machinery serves in-memory hash aggregation, the
//! spill path (partial states sorted by group key and merged), and running
//! window frames (`UNBOUNDED PRECEDING AND CURRENT ROW`).

use std::collections::HashMap;
use std::sync::Arc;

use varve_store::{Datum, Row};

use crate::error::{EngineError, Result};
use crate::lang::ast::{AggFunc, Expr};

use super::spill::SpillSort;
use super::{eval_row_expr, ExecContext, RowStream};

/// A resolved aggregate: function plus argument expression (`None` = `*`).
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub func: AggFunc,
    pub arg: Option<Expr>,
}

/// Mergeable accumulator. SUM over integers stays integral and surfaces
/// overflow; AVG carries `(sum, count)`; MIN/MAX are monotone over the
/// datum order.
#[derive(Debug, Clone, PartialEq)]
pub enum AggState {
    Sum { int: i64, float: f64, is_float: bool, seen: bool },
    Count(i64),
    Avg { sum: f64, count: i64 },
    Min(Option<Datum>),
    Max(Option<Datum>),
}

impl AggState {
    /// The identity element for the aggregate.
    pub fn identity(func: AggFunc) -> Self {
        match func {
            AggFunc::Sum => AggState::Sum { int: 0, float: 0.0, is_float: false, seen: false },
            AggFunc::Count => AggState::Count(0),
            AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggFunc::Min => AggState::Min(None),
            AggFunc::Max => AggState::Max(None),
        }
    }

    /// Fold one input value. `None` is the `*` argument (row counting).
    pub fn update(&mut self, value: Option<&Datum>) -> Result<()> {
        match self {
            AggState::Count(n) => {
                // COUNT(*) counts rows; COUNT(col) counts non-null values.
                if value.is_none_or(|v| !v.is_null()) {
                    *n += 1;
                }
            }
            AggState::Sum { int, float, is_float, seen } => match value {
                Some(Datum::Int(v)) => {
                    *seen = true;
                    if *is_float {
                        *float += *v as f64;
                    } else {
                        *int = int.checked_add(*v).ok_or_else(|| {
                            EngineError::Execution("integer overflow in SUM".to_string())
                        })?;
                    }
                }
                Some(Datum::Float(v)) => {
                    *seen = true;
                    if !*is_float {
                        *float = *int as f64;
                        *is_float = true;
                    }
                    *float += v;
                }
                Some(Datum::Null) | None => {}
                Some(other) => {
                    return Err(EngineError::Execution(format!(
                        "cannot SUM a {}",
                        other.type_name()
                    )))
                }
            },
            AggState::Avg { sum, count } => match value {
                Some(Datum::Int(v)) => {
                    *sum += *v as f64;
                    *count += 1;
                }
                Some(Datum::Float(v)) => {
                    *sum += v;
                    *count += 1;
                }
                Some(Datum::Null) | None => {}
                Some(other) => {
                    return Err(EngineError::Execution(format!(
                        "cannot AVG a {}",
                        other.type_name()
                    )))
                }
            },
            AggState::Min(best) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && best
                            .as_ref()
                            .is_none_or(|b| v.total_cmp(b) == std::cmp::Ordering::Less)
                    {
                        *best = Some(v.clone());
                    }
                }
            }
            AggState::Max(best) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && best
                            .as_ref()
                            .is_none_or(|b| v.total_cmp(b) == std::cmp::Ordering::Greater)
                    {
                        *best = Some(v.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Associative combine of two partial states.
    pub fn merge(&mut self, other: &AggState) -> Result<()> {
        match (self, other) {
            (AggState::Count(a), AggState::Count(b)) => *a += b,
            (
                AggState::Sum { int, float, is_float, seen },
                AggState::Sum { int: oi, float: of, is_float: oif, seen: os },
            ) => {
                *seen |= os;
                if *is_float || *oif {
                    if !*is_float {
                        *float = *int as f64;
                        *is_float = true;
                    }
                    *float += if *oif { *of } else { *oi as f64 };
                } else {
                    *int = int.checked_add(*oi).ok_or_else(|| {
                        EngineError::Execution("integer overflow in SUM".to_string())
                    })?;
                }
            }
            (AggState::Avg { sum, count }, AggState::Avg { sum: os, count: oc }) => {
                *sum += os;
                *count += oc;
            }
            (AggState::Min(best), AggState::Min(other_best)) => {
                if let Some(v) = other_best {
                    if best.as_ref().is_none_or(|b| v.total_cmp(b) == std::cmp::Ordering::Less) {
                        *best = Some(v.clone());
                    }
                }
            }
            (AggState::Max(best), AggState::Max(other_best)) => {
                if let Some(v) = other_best {
                    if best
                        .as_ref()
                        .is_none_or(|b| v.total_cmp(b) == std::cmp::Ordering::Greater)
                    {
                        *best = Some(v.clone());
                    }
                }
            }
            _ => {
                return Err(EngineError::Internal(
                    "mismatched aggregate states merged".to_string(),
                ))
            }
        }
        Ok(())
    }

    pub fn finalize(&self) -> Datum {
        match self {
            AggState::Count(n) => Datum::Int(*n),
            AggState::Sum { int, float, is_float, seen } => {
                if !seen {
                    Datum::Null
                } else if *is_float {
                    Datum::Float(*float)
                } else {
                    Datum::Int(*int)
                }
            }
            AggState::Avg { sum, count } => {
                if *count == 0 {
                    Datum::Null
                } else {
                    Datum::Float(sum / *count as f64)
                }
            }
            AggState::Min(best) | AggState::Max(best) => {
                best.clone().unwrap_or(Datum::Null)
            }
        }
    }

    /// Fixed-width datum encoding for spilled partial states.
    fn to_datums(&self) -> Vec<Datum> {
        match self {
            AggState::Count(n) => vec![Datum::Int(0), Datum::Int(*n), Datum::Null],
            AggState::Sum { int, float, is_float, seen } => vec![
                Datum::Int(1),
                if *is_float { Datum::Float(*float) } else { Datum::Int(*int) },
                Datum::Bool(*seen),
            ],
            AggState::Avg { sum, count } => {
                vec![Datum::Int(2), Datum::Float(*sum), Datum::Int(*count)]
            }
            AggState::Min(best) => {
                vec![Datum::Int(3), best.clone().unwrap_or(Datum::Null), Datum::Bool(best.is_some())]
            }
            AggState::Max(best) => {
                vec![Datum::Int(4), best.clone().unwrap_or(Datum::Null), Datum::Bool(best.is_some())]
            }
        }
    }

    fn from_datums(datums: &[Datum]) -> Result<Self> {
        let corrupt = || EngineError::Internal("malformed spilled aggregate state".to_string());
        let [tag, payload, extra] = datums else { return Err(corrupt()) };
        Ok(match tag {
            Datum::Int(0) => match payload {
                Datum::Int(n) => AggState::Count(*n),
                _ => return Err(corrupt()),
            },
            Datum::Int(1) => match (payload, extra) {
                (Datum::Int(v), Datum::Bool(seen)) => {
                    AggState::Sum { int: *v, float: 0.0, is_float: false, seen: *seen }
                }
                (Datum::Float(v), Datum::Bool(seen)) => {
                    AggState::Sum { int: 0, float: *v, is_float: true, seen: *seen }
                }
                _ => return Err(corrupt()),
            },
            Datum::Int(2) => match (payload, extra) {
                (Datum::Float(sum), Datum::Int(count)) => {
                    AggState::Avg { sum: *sum, count: *count }
                }
                _ => return Err(corrupt()),
            },
            Datum::Int(3) => match extra {
                Datum::Bool(true) => AggState::Min(Some(payload.clone())),
                Datum::Bool(false) => AggState::Min(None),
                _ => return Err(corrupt()),
            },
            Datum::Int(4) => match extra {
                Datum::Bool(true) => AggState::Max(Some(payload.clone())),
                Datum::Bool(false) => AggState::Max(None),
                _ => return Err(corrupt()),
            },
            _ => return Err(corrupt()),
        })
    }
}

const STATE_WIDTH: usize = 3;

fn states_to_row(states: &[AggState]) -> Row {
    states.iter().flat_map(|s| s.to_datums()).collect()
}

fn states_from_row(row: &[Datum], count: usize) -> Result<Vec<AggState>> {
    if row.len() != count * STATE_WIDTH {
        return Err(EngineError::Internal("malformed spilled aggregate row".to_string()));
    }
    row.chunks(STATE_WIDTH).map(AggState::from_datums).collect()
}

fn fold_row(
    states: &mut [AggState],
    aggs: &[AggSpec],
    columns: &[String],
    row: &Row,
    strict: bool,
) -> Result<()> {
    for (state, spec) in states.iter_mut().zip(aggs) {
        match &spec.arg {
            Some(expr) => {
                let value = eval_row_expr(expr, columns, row, strict)?;
                state.update(Some(&value))?;
            }
            None => state.update(None)?,
        }
    }
    Ok(())
}

/// Group-and-aggregate: hash aggregation within the memory budget, spilling
/// partial states as sorted runs merged by group key. Returns
/// `(group_key, final datums per aggregate)` pairs; with no GROUP BY there
/// is exactly one group with an empty key.
pub fn group_aggregate(
    input: &mut dyn RowStream,
    group_exprs: &[Expr],
    aggs: &[AggSpec],
    ctx: &Arc<ExecContext>,
) -> Result<Vec<(Vec<Datum>, Vec<Datum>)>> {
    let columns = input.columns().to_vec();
    let mut groups: HashMap<Vec<Datum>, Vec<AggState>> = HashMap::new();
    let mut approx_bytes = 0usize;
    let mut spill: Option<SpillSort> = None;

    while let Some(row) = input.next_row()? {
        ctx.tick()?;
        let mut key = Vec::with_capacity(group_exprs.len());
        for expr in group_exprs {
            key.push(eval_row_expr(expr, &columns, &row, ctx.strict)?);
        }
        if let Some(sorter) = &mut spill {
            // Spill mode: each row becomes a singleton partial state.
            let mut states: Vec<AggState> =
                aggs.iter().map(|a| AggState::identity(a.func)).collect();
            fold_row(&mut states, aggs, &columns, &row, ctx.strict)?;
            sorter.push(key, states_to_row(&states))?;
            continue;
        }
        match groups.get_mut(&key) {
            Some(states) => fold_row(states, aggs, &columns, &row, ctx.strict)?,
            None => {
                approx_bytes += 64 + key.len() * 16 + aggs.len() * 24;
                let mut states: Vec<AggState> =
                    aggs.iter().map(|a| AggState::identity(a.func)).collect();
                fold_row(&mut states, aggs, &columns, &row, ctx.strict)?;
                groups.insert(key, states);
                if approx_bytes > ctx.memory_budget {
                    // Convert resident groups to partial-state runs and
                    // continue in spill mode.
                    let mut sorter =
                        SpillSort::new(vec![true; group_exprs.len()], ctx.memory_budget);
                    for (key, states) in groups.drain() {
                        sorter.push(key, states_to_row(&states))?;
                    }
                    spill = Some(sorter);
                }
            }
        }
    }

    let mut out: Vec<(Vec<Datum>, Vec<Datum>)> = Vec::new();
    match spill {
        None => {
            for (key, states) in groups {
                out.push((key, states.iter().map(AggState::finalize).collect()));
            }
        }
        Some(sorter) => {
            let mut current: Option<(Vec<Datum>, Vec<AggState>)> = None;
            for item in sorter.finish()? {
                let (key, state_row) = item?;
                ctx.tick()?;
                let states = states_from_row(&state_row, aggs.len())?;
                match &mut current {
                    Some((cur_key, cur_states)) if *cur_key == key => {
                        for (a, b) in cur_states.iter_mut().zip(&states) {
                            a.merge(b)?;
                        }
                    }
                    _ => {
                        if let Some((key, states)) = current.take() {
                            out.push((key, states.iter().map(AggState::finalize).collect()));
                        }
                        current = Some((key, states));
                    }
                }
            }
            if let Some((key, states)) = current.take() {
                out.push((key, states.iter().map(AggState::finalize).collect()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::VecStream;
    use super::*;
    use crate::lang::ast::Statement;
    use crate::lang::parser::parse_statement;

    fn expr_of(src: &str) -> Expr {
        let Statement::Expr(e) = parse_statement(src).unwrap() else { panic!() };
        e
    }

    fn input(rows: Vec<(i64, i64)>) -> VecStream {
        VecStream::new(
            vec!["k".into(), "v".into()],
            rows.into_iter().map(|(k, v)| vec![Datum::Int(k), Datum::Int(v)]).collect(),
        )
    }

    fn sum_spec() -> AggSpec {
        AggSpec { func: AggFunc::Sum, arg: Some(expr_of("v")) }
    }

    #[test]
    fn global_sum_without_group_by() {
        let mut stream = input(vec![(1, 10), (2, 20), (3, 30)]);
        let groups =
            group_aggregate(&mut stream, &[], &[sum_spec()], &ExecContext::unbounded()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1, vec![Datum::Int(60)]);
    }

    #[test]
    fn grouped_aggregates() {
        let mut stream = input(vec![(1, 10), (2, 5), (1, 7), (2, 1)]);
        let specs = [
            sum_spec(),
            AggSpec { func: AggFunc::Count, arg: None },
            AggSpec { func: AggFunc::Min, arg: Some(expr_of("v")) },
            AggSpec { func: AggFunc::Max, arg: Some(expr_of("v")) },
            AggSpec { func: AggFunc::Avg, arg: Some(expr_of("v")) },
        ];
        let mut groups = group_aggregate(
            &mut stream,
            &[expr_of("k")],
            &specs,
            &ExecContext::unbounded(),
        )
        .unwrap();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            groups[0],
            (
                vec![Datum::Int(1)],
                vec![
                    Datum::Int(17),
                    Datum::Int(2),
                    Datum::Int(7),
                    Datum::Int(10),
                    Datum::Float(8.5)
                ]
            )
        );
    }

    #[test]
    fn sum_promotes_to_float_on_mixed_input() {
        let mut state = AggState::identity(AggFunc::Sum);
        state.update(Some(&Datum::Int(1))).unwrap();
        state.update(Some(&Datum::Float(0.5))).unwrap();
        assert_eq!(state.finalize(), Datum::Float(1.5));
    }

    #[test]
    fn empty_input_identities() {
        let mut stream = input(vec![]);
        let specs =
            [sum_spec(), AggSpec { func: AggFunc::Count, arg: None }];
        let groups =
            group_aggregate(&mut stream, &[], &specs, &ExecContext::unbounded()).unwrap();
        // No rows and no GROUP BY: hash aggregation yields no resident
        // group, so the caller supplies identity output for the global case.
        assert!(groups.is_empty());
        assert_eq!(AggState::identity(AggFunc::Sum).finalize(), Datum::Null);
        assert_eq!(AggState::identity(AggFunc::Count).finalize(), Datum::Int(0));
    }

    #[test]
    fn nulls_are_skipped() {
        let mut stream = VecStream::new(
            vec!["k".into(), "v".into()],
            vec![
                vec![Datum::Int(1), Datum::Int(5)],
                vec![Datum::Int(1), Datum::Null],
            ],
        );
        let specs = [
            sum_spec(),
            AggSpec { func: AggFunc::Count, arg: Some(expr_of("v")) },
            AggSpec { func: AggFunc::Count, arg: None },
        ];
        let groups =
            group_aggregate(&mut stream, &[], &specs, &ExecContext::unbounded()).unwrap();
        assert_eq!(groups[0].1, vec![Datum::Int(5), Datum::Int(1), Datum::Int(2)]);
    }

    #[test]
    fn spilled_grouping_matches_in_memory() {
        let rows: Vec<(i64, i64)> = (0..1000).map(|i| (i % 37, i)).collect();
        let specs = [sum_spec(), AggSpec { func: AggFunc::Count, arg: None }];

        let mut in_memory = group_aggregate(
            &mut input(rows.clone()),
            &[expr_of("k")],
            &specs,
            &ExecContext::unbounded(),
        )
        .unwrap();

        let tiny_budget = ExecContext::new(
            None,
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
            false,
            256,
            4096,
        );
        let mut spilled =
            group_aggregate(&mut input(rows), &[expr_of("k")], &specs, &tiny_budget).unwrap();

        in_memory.sort_by(|a, b| a.0.cmp(&b.0));
        spilled.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(in_memory, spilled);
    }

    #[test]
    fn sum_overflow_is_execution_error() {
        let mut state = AggState::identity(AggFunc::Sum);
        state.update(Some(&Datum::Int(i64::MAX))).unwrap();
        assert!(state.update(Some(&Datum::Int(1))).is_err());
    }

    #[test]
    fn state_datum_roundtrip() {
        let mut sum = AggState::identity(AggFunc::Sum);
        sum.update(Some(&Datum::Int(42))).unwrap();
        let avg = AggState::Avg { sum: 1.5, count: 3 };
        let min = AggState::Min(Some(Datum::Str("a".into())));
        for state in [sum, avg, min, AggState::Count(9), AggState::Max(None)] {
            let datums = state.to_datums();
            assert_eq!(AggState::from_datums(&datums).unwrap(), state);
        }
    }
}
