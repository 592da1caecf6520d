//! Parallel chunked scan.
//!
//! Stripes are partitioned into `degree` contiguous chunks and decoded on
//! the rayon pool. Each worker fills a chunk-local buffer; buffers are
//! drained in submission order, so the merged output is deterministic for a
//! given stripe ordering and chunking. Workers poll the shared context, so
//! cancellation and deadlines reach into the pool.

use std::collections::VecDeque;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use varve_store::{BlobStore, PrunePredicate, Row, StripeId, StripeSet, TableDef};

use crate::error::Result;
use crate::exec::scan::load_stripe_rows;
use crate::exec::{ExecContext, RowStream};
use crate::timeline::Quarantine;

/// Split stripes into at most `degree` contiguous chunks.
pub fn partition_stripes(stripes: &[StripeId], degree: usize) -> Vec<Vec<StripeId>> {
    let degree = degree.clamp(1, stripes.len().max(1));
    let chunk_size = stripes.len().div_ceil(degree);
    stripes.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect()
}

pub struct ParallelScan {
    columns: Vec<String>,
    rows: VecDeque<Row>,
    ctx: Arc<ExecContext>,
}

impl ParallelScan {
    /// Execute the chunked scan eagerly and hold the merged buffers.
    pub fn run(
        store: Arc<dyn BlobStore>,
        table: &TableDef,
        set: &StripeSet,
        predicates: Vec<PrunePredicate>,
        degree: usize,
        quarantine: Quarantine,
        ctx: Arc<ExecContext>,
    ) -> Result<Self> {
        let chunks = partition_stripes(&set.stripes, degree);
        debug!(
            event = "parallel_scan.start",
            table = %table.name,
            stripes = set.stripes.len(),
            chunks = chunks.len(),
        );

        let table_name = table.name.clone();
        // Workers return chunk-local buffers; `collect` preserves chunk
        // order, which is the deterministic-merge contract.
        let chunk_results: Vec<Result<Vec<Row>>> = chunks
            .par_iter()
            .map(|chunk| {
                let mut local = Vec::new();
                for stripe in chunk {
                    ctx.check_now()?;
                    if let Some(rows) = load_stripe_rows(
                        &store,
                        &quarantine,
                        &table_name,
                        stripe,
                        &predicates,
                        None,
                    )? {
                        local.extend(rows);
                    }
                }
                Ok(local)
            })
            .collect();

        let mut rows = VecDeque::new();
        for chunk in chunk_results {
            rows.extend(chunk?);
        }
        Ok(Self {
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
            ctx,
        })
    }
}

impl RowStream for ParallelScan {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        match self.rows.pop_front() {
            Some(row) => {
                self.ctx.tick()?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}
