//! Budget-bounded sorting with spill to disk.
//!
//! `SpillSort` accumulates `(key, row)` records in memory; when the byte
//! budget is exceeded the buffer is sorted and written out as one run, and
//! the final iterator is a k-way merge over every run plus the in-memory
//! remainder. A monotone sequence number rides along for stability.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use itertools::Itertools;
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use varve_store::{Datum, Row};

use crate::error::{EngineError, Result};

type Record = (Vec<Datum>, u64, Row);

fn record_bytes(key: &[Datum], row: &Row) -> usize {
    fn datum_bytes(d: &Datum) -> usize {
        match d {
            Datum::Null | Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) | Datum::Timestamp(_) => 8,
            Datum::Str(s) => s.len() + 8,
            Datum::Binary(b) => b.len() + 8,
        }
    }
    32 + key.iter().map(datum_bytes).sum::<usize>() + row.iter().map(datum_bytes).sum::<usize>()
}

/// Compare key tuples under per-key sort directions (`true` = ascending).
pub fn compare_keys(a: &[Datum], b: &[Datum], directions: &[bool]) -> Ordering {
    for (i, (ka, kb)) in a.iter().zip(b).enumerate() {
        let ord = ka.total_cmp(kb);
        if ord != Ordering::Equal {
            let ascending = directions.get(i).copied().unwrap_or(true);
            return if ascending { ord } else { ord.reverse() };
        }
    }
    Ordering::Equal
}

pub struct SpillSort {
    directions: Vec<bool>,
    budget: usize,
    bytes: usize,
    seq: u64,
    buffer: Vec<Record>,
    spill_dir: Option<TempDir>,
    runs: Vec<PathBuf>,
}

impl SpillSort {
    pub fn new(directions: Vec<bool>, budget: usize) -> Self {
        Self {
            directions,
            budget: budget.max(1),
            bytes: 0,
            seq: 0,
            buffer: Vec::new(),
            spill_dir: None,
            runs: Vec::new(),
        }
    }

    pub fn push(&mut self, key: Vec<Datum>, row: Row) -> Result<()> {
        self.bytes += record_bytes(&key, &row);
        self.buffer.push((key, self.seq, row));
        self.seq += 1;
        if self.bytes > self.budget {
            self.flush_run()?;
        }
        Ok(())
    }

    fn sort_buffer(&mut self) {
        let directions = self.directions.clone();
        self.buffer
            .sort_by(|a, b| compare_keys(&a.0, &b.0, &directions).then(a.1.cmp(&b.1)));
    }

    fn flush_run(&mut self) -> Result<()> {
        self.sort_buffer();
        if self.spill_dir.is_none() {
            self.spill_dir = Some(
                tempfile::tempdir().map_err(|e| EngineError::Io(format!("spill dir: {e}")))?,
            );
        }
        let dir = self.spill_dir.as_ref().expect("spill dir was just created");
        let path = dir.path().join(format!("run-{}.jsonl", Uuid::new_v4()));
        let file =
            File::create(&path).map_err(|e| EngineError::Io(format!("spill create: {e}")))?;
        let mut writer = BufWriter::new(file);
        for record in self.buffer.drain(..) {
            let line = serde_json::to_string(&record)
                .map_err(|e| EngineError::Internal(format!("spill encode: {e}")))?;
            writer
                .write_all(line.as_bytes())
                .and_then(|()| writer.write_all(b"\n"))
                .map_err(|e| EngineError::Io(format!("spill write: {e}")))?;
        }
        writer.flush().map_err(|e| EngineError::Io(format!("spill flush: {e}")))?;
        debug!(event = "spill.run_written", path = %path.display());
        self.runs.push(path);
        self.bytes = 0;
        Ok(())
    }

    /// Finish: iterator over `(key, row)` in sorted order.
    pub fn finish(mut self) -> Result<SortedIter> {
        self.sort_buffer();
        let directions = self.directions.clone();
        let mut sources: Vec<Box<dyn Iterator<Item = Result<Record>>>> = Vec::new();
        for path in &self.runs {
            let file =
                File::open(path).map_err(|e| EngineError::Io(format!("spill open: {e}")))?;
            let reader = BufReader::new(file);
            sources.push(Box::new(reader.lines().map(|line| {
                let line = line.map_err(|e| EngineError::Io(format!("spill read: {e}")))?;
                serde_json::from_str::<Record>(&line)
                    .map_err(|e| EngineError::Internal(format!("spill decode: {e}")))
            })));
        }
        sources.push(Box::new(self.buffer.into_iter().map(Ok)));

        let dirs = directions.clone();
        let merged = sources.into_iter().kmerge_by(move |a, b| match (a, b) {
            (Err(_), _) => true,
            (_, Err(_)) => false,
            (Ok(x), Ok(y)) => {
                compare_keys(&x.0, &y.0, &dirs).then(x.1.cmp(&y.1)) != Ordering::Greater
            }
        });
        Ok(SortedIter { inner: Box::new(merged), _spill_dir: self.spill_dir })
    }

    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }
}

/// Sorted output; keeps the spill directory alive until dropped.
pub struct SortedIter {
    inner: Box<dyn Iterator<Item = Result<Record>>>,
    _spill_dir: Option<TempDir>,
}

impl Iterator for SortedIter {
    type Item = Result<(Vec<Datum>, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.map(|(key, _, row)| (key, row)))
    }
}
