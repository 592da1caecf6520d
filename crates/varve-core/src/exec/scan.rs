//! Sequential and index scans over a table's stripe set.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use varve_store::{
    parse_stripe, stripe_key, BlobStore, PrunePredicate, Row, StorageError, StripeId, StripeSet,
    TableDef,
};

use crate::error::{EngineError, Result};
use crate::exec::ExecContext;
use crate::timeline::Quarantine;

use super::RowStream;

/// Load one stripe's rows, enforcing quarantine and content verification.
/// `None` means the stripe was pruned by its footer.
pub fn load_stripe_rows(
    store: &Arc<dyn BlobStore>,
    quarantine: &Quarantine,
    table: &str,
    stripe: &StripeId,
    predicates: &[PrunePredicate],
    projection: Option<&[usize]>,
) -> Result<Option<Vec<Row>>> {
    let key = stripe_key(table, stripe);
    if quarantine.is_marked(&key) {
        return Err(EngineError::Integrity(format!(
            "stripe {} is quarantined pending repair",
            stripe.short()
        )));
    }
    let bytes = store.get(&key)?;
    let parsed = match parse_stripe(&bytes, Some(stripe)) {
        Ok(parsed) => parsed,
        Err(e @ StorageError::CorruptStripe { .. }) => {
            quarantine.mark(&key, "stripe failed verification during scan");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    if !predicates.iter().all(|p| parsed.footer().may_match(p)) {
        debug!(event = "scan.stripe_pruned", table = %table, stripe = %stripe.short());
        return Ok(None);
    }
    Ok(Some(parsed.decode_rows(projection)?))
}

/// Sequential scan: stripes in set order, footer-pruned, decoded on demand.
pub struct TableScan {
    store: Arc<dyn BlobStore>,
    table: String,
    columns: Vec<String>,
    stripes: VecDeque<StripeId>,
    predicates: Vec<PrunePredicate>,
    quarantine: Quarantine,
    ctx: Arc<ExecContext>,
    current: VecDeque<Row>,
}

impl TableScan {
    pub fn new(
        store: Arc<dyn BlobStore>,
        table: &TableDef,
        set: &StripeSet,
        predicates: Vec<PrunePredicate>,
        quarantine: Quarantine,
        ctx: Arc<ExecContext>,
    ) -> Self {
        Self {
            store,
            table: table.name.clone(),
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            stripes: set.stripes.iter().copied().collect(),
            predicates,
            quarantine,
            ctx,
            current: VecDeque::new(),
        }
    }
}

impl RowStream for TableScan {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.current.pop_front() {
                self.ctx.tick()?;
                return Ok(Some(row));
            }
            let Some(stripe) = self.stripes.pop_front() else {
                return Ok(None);
            };
            self.ctx.check_now()?;
            if let Some(rows) = load_stripe_rows(
                &self.store,
                &self.quarantine,
                &self.table,
                &stripe,
                &self.predicates,
                None,
            )? {
                self.current = rows.into();
            }
        }
    }
}

/// Locators grouped per stripe, in stripe-set order, offsets ascending.
pub fn group_locators(
    locators: &[varve_store::Locator],
    set: &StripeSet,
) -> Vec<(StripeId, Vec<u32>)> {
    let mut grouped: Vec<(StripeId, Vec<u32>)> = Vec::new();
    for stripe in &set.stripes {
        let mut offsets: Vec<u32> = locators
            .iter()
            .filter(|l| &l.stripe == stripe)
            .map(|l| l.row)
            .collect();
        if offsets.is_empty() {
            continue;
        }
        offsets.sort_unstable();
        offsets.dedup();
        grouped.push((*stripe, offsets));
    }
    grouped
}

/// Index scan: resolve locators, decode each touched stripe once, emit the
/// selected rows in stripe-local order.
pub struct IndexScan {
    store: Arc<dyn BlobStore>,
    table: String,
    columns: Vec<String>,
    groups: VecDeque<(StripeId, Vec<u32>)>,
    quarantine: Quarantine,
    ctx: Arc<ExecContext>,
    current: VecDeque<Row>,
}

impl IndexScan {
    pub fn new(
        store: Arc<dyn BlobStore>,
        table: &TableDef,
        groups: Vec<(StripeId, Vec<u32>)>,
        quarantine: Quarantine,
        ctx: Arc<ExecContext>,
    ) -> Self {
        Self {
            store,
            table: table.name.clone(),
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            groups: groups.into(),
            quarantine,
            ctx,
            current: VecDeque::new(),
        }
    }
}

impl RowStream for IndexScan {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.current.pop_front() {
                self.ctx.tick()?;
                return Ok(Some(row));
            }
            let Some((stripe, offsets)) = self.groups.pop_front() else {
                return Ok(None);
            };
            self.ctx.check_now()?;
            let Some(rows) =
                load_stripe_rows(&self.store, &self.quarantine, &self.table, &stripe, &[], None)?
            else {
                continue;
            };
            self.current = offsets
                .into_iter()
                .filter_map(|offset| rows.get(offset as usize).cloned())
                .collect();
        }
    }
}
