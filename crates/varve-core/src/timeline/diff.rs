//! Incremental diff between two points on the timeline.

use std::collections::{BTreeMap, BTreeSet};

use varve_store::{CommitId, StripeId};

use crate::error::{EngineError, Result};

use super::Timeline;

/// Stripes appearing on exactly one side of `(a, b)`, grouped by table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub table: String,
    /// Present at `b` but not at `a`.
    pub added: Vec<StripeId>,
    /// Present at `a` but not at `b`.
    pub removed: Vec<StripeId>,
}

fn state_sets(timeline: &Timeline, at: CommitId) -> Result<BTreeMap<String, BTreeSet<StripeId>>> {
    let mut out = BTreeMap::new();
    for (table, root) in timeline.full_state_at(at)? {
        let set = timeline.get_manifest(&table, &root)?;
        out.insert(table, set.stripes.into_iter().collect());
    }
    Ok(out)
}

/// Symmetric stripe difference between commits `a` and `b`.
pub fn diff(timeline: &Timeline, a: CommitId, b: CommitId) -> Result<Vec<TableChange>> {
    let state_a = state_sets(timeline, a)?;
    let state_b = state_sets(timeline, b)?;

    let tables: BTreeSet<&String> = state_a.keys().chain(state_b.keys()).collect();
    let empty = BTreeSet::new();
    let mut changes = Vec::new();
    for table in tables {
        let sa = state_a.get(table).unwrap_or(&empty);
        let sb = state_b.get(table).unwrap_or(&empty);
        let added: Vec<StripeId> = sb.difference(sa).copied().collect();
        let removed: Vec<StripeId> = sa.difference(sb).copied().collect();
        if !added.is_empty() || !removed.is_empty() {
            changes.push(TableChange { table: table.clone(), added, removed });
        }
    }
    Ok(changes)
}

/// `diff(ancestor, descendant)` with the ancestry requirement enforced.
pub fn changes_since(
    timeline: &Timeline,
    ancestor: CommitId,
    descendant: CommitId,
) -> Result<Vec<TableChange>> {
    let mut found = false;
    for step in timeline.walk(descendant, None) {
        if step?.id == ancestor {
            found = true;
            break;
        }
    }
    if !found {
        return Err(EngineError::Execution(format!(
            "{} is not an ancestor of {}",
            ancestor.short(),
            descendant.short()
        )));
    }
    diff(timeline, ancestor, descendant)
}
