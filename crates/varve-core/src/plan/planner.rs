//! Cost-based access-path selection.
//!
//! Cost model: `rows x (io_per_row + cpu_per_row)`, with the IO term scaled
//! by the fraction of stripes that survive footer pruning. A full scan is
//! always a candidate, so the chosen cost never exceeds it; candidate
//! indexes are ranked by estimated cost with the kind preference
//! `unique > hash > btree > bitmap > bloom` as the tie-break.

use tracing::debug;

use varve_store::IndexKind;

use crate::config::EngineConfig;

use super::{AccessOp, CmpOp, Condition, IndexMeta, QueryPlan, TableStats};

pub struct PlannerInputs<'a> {
    pub table: &'a str,
    pub stats: TableStats,
    pub indexes: &'a [IndexMeta],
    /// False when the query needs cross-row state without an associative
    /// combiner (running windows), which rules out chunked execution.
    pub chunk_independent: bool,
    pub config: &'a EngineConfig,
}

fn kind_preference(kind: IndexKind, unique: bool) -> u8 {
    if unique {
        return 0;
    }
    match kind {
        IndexKind::Hash => 1,
        IndexKind::BTree => 2,
        IndexKind::Bitmap => 3,
        IndexKind::Bloom => 4,
    }
}

/// Does this index cover the query, and how selective would it be?
/// Returns the estimated row count of an index scan, or `None`.
fn index_estimate(index: &IndexMeta, conditions: &[Condition], rows: u64) -> Option<u64> {
    if index.stale || index.columns.is_empty() {
        return None;
    }
    let leading = &index.columns[0];
    let eq_on_leading = conditions.iter().any(|c| &c.column == leading && c.op == CmpOp::Eq);
    let range_on_leading = conditions.iter().any(|c| &c.column == leading && c.op != CmpOp::Eq);

    match index.kind {
        IndexKind::Hash | IndexKind::Bitmap => {
            if !eq_on_leading {
                return None;
            }
            if index.unique {
                return Some(1);
            }
            Some((rows / index.key_count.max(1) as u64).max(1))
        }
        IndexKind::BTree => {
            if eq_on_leading {
                if index.unique {
                    return Some(1);
                }
                return Some((rows / index.key_count.max(1) as u64).max(1));
            }
            if range_on_leading {
                // A third of the table for an open range is the classic
                // selectivity guess.
                return Some((rows / 3).max(1));
            }
            None
        }
        // A bloom index only pre-filters; it cannot drive a scan by itself
        // and is picked only when nothing better covers the query.
        IndexKind::Bloom => {
            if eq_on_leading {
                Some(rows.max(1))
            } else {
                None
            }
        }
    }
}

/// Choose the access path for a single table.
pub fn plan_table_access(conditions: &[Condition], inputs: &PlannerInputs<'_>) -> QueryPlan {
    let cfg = inputs.config;
    let rows = inputs.stats.row_count;
    let surviving_fraction = if inputs.stats.stripe_count == 0 {
        1.0
    } else {
        inputs.stats.surviving_stripes as f64 / inputs.stats.stripe_count as f64
    };
    let full_scan_cost =
        rows as f64 * (cfg.io_cost_per_row * surviving_fraction + cfg.cpu_cost_per_row);

    // Candidate: sequential scan, possibly parallel.
    let mut best = QueryPlan {
        op: AccessOp::SeqScan,
        table: inputs.table.to_string(),
        conditions: conditions.to_vec(),
        degree: 1,
        cost: full_scan_cost,
        estimated_rows: rows,
    };
    if inputs.chunk_independent && rows > cfg.parallel_row_threshold {
        let degree = (rows.div_ceil(cfg.chunk_rows.max(1)) as usize)
            .clamp(1, cfg.effective_max_degree());
        if degree > 1 {
            // Parallelism divides the work but pays a merge overhead per
            // chunk, so tiny inputs never choose it.
            let parallel_cost =
                full_scan_cost / degree as f64 + degree as f64 * cfg.cpu_cost_per_row * 64.0;
            if parallel_cost < best.cost {
                best = QueryPlan {
                    op: AccessOp::ParallelScan,
                    degree,
                    cost: parallel_cost,
                    ..best
                };
            }
        }
    }

    // Candidate: each covering index.
    let mut candidates: Vec<(f64, u8, &IndexMeta, u64)> = Vec::new();
    for index in inputs.indexes {
        let Some(est_rows) = index_estimate(index, conditions, rows) else { continue };
        let probe_cost = (index.key_count.max(2) as f64).log2() * cfg.cpu_cost_per_row;
        let cost = est_rows as f64
            * (cfg.io_cost_per_row + cfg.cpu_cost_per_row + cfg.index_probe_cost)
            + probe_cost;
        candidates.push((cost, kind_preference(index.kind, index.unique), index, est_rows));
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    if let Some((cost, _, index, est_rows)) = candidates.into_iter().next() {
        if cost < best.cost {
            best = QueryPlan {
                op: AccessOp::IndexScan { index: index.name.clone() },
                degree: 1,
                cost,
                estimated_rows: est_rows,
                ..best
            };
        }
    }

    debug!(
        event = "plan.access_chosen",
        table = %inputs.table,
        op = %best.op.tag(),
        cost = best.cost,
        degree = best.degree,
    );
    best
}

/// Hash-join side selection: build on the smaller estimated input.
pub fn build_side_is_left(left_rows: u64, right_rows: u64) -> bool {
    left_rows <= right_rows
}
