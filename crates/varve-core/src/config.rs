//! Engine configuration.
//!
//! Every tunable the engine consults lives here, individually defaultable so
//! a config file only needs the fields it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Row capacity of one stripe.
    pub stripe_rows: usize,
    /// Target size of one page in bytes.
    pub page_bytes: usize,
    /// Bits per value for footer bloom filters.
    pub bloom_bits_per_value: usize,
    /// Hard cap on a single bloom filter; past it the filter degrades.
    pub bloom_max_bits: usize,

    /// Result cache bounds.
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,

    /// Parallel scan kicks in past this estimated row count.
    pub parallel_row_threshold: u64,
    /// Upper bound on scan parallelism. 0 means "number of cores".
    pub max_parallel_degree: usize,
    /// Rows per parallel chunk.
    pub chunk_rows: u64,

    /// Cost model coefficients.
    pub io_cost_per_row: f64,
    pub cpu_cost_per_row: f64,
    /// Per-row cost of an index probe relative to a scanned row.
    pub index_probe_cost: f64,

    /// Hot-path compiler: promote after this many calls.
    pub hotpath_threshold: u32,
    pub hotpath_min_threshold: u32,
    pub hotpath_max_threshold: u32,
    /// Benchmark race: samples kept, warm-up discarded, retire margin.
    pub bench_samples: usize,
    pub bench_warmup: usize,
    pub bench_retire_margin: f64,

    /// Evaluator recursion cap.
    pub recursion_limit: usize,
    /// Operators poll the deadline every this many rows.
    pub poll_rows: u64,
    /// Byte budget per plan before growing operators spill.
    pub memory_budget_bytes: usize,
    /// Promote row-local evaluation errors to plan failures.
    pub strict_mode: bool,

    /// HEAD append retry policy on ConcurrentWrite.
    pub append_retries: u32,
    pub append_backoff_ms: u64,

    /// Commit author recorded on writes.
    pub author: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stripe_rows: 10_000,
            page_bytes: 64 * 1024,
            bloom_bits_per_value: 10,
            bloom_max_bits: 1 << 19,
            cache_max_entries: 256,
            cache_max_bytes: 64 * 1024 * 1024,
            parallel_row_threshold: 50_000,
            max_parallel_degree: 0,
            chunk_rows: 10_000,
            io_cost_per_row: 1.0,
            cpu_cost_per_row: 0.1,
            index_probe_cost: 0.2,
            hotpath_threshold: 10,
            hotpath_min_threshold: 1,
            hotpath_max_threshold: 1000,
            bench_samples: 16,
            bench_warmup: 4,
            bench_retire_margin: 0.25,
            recursion_limit: 1000,
            poll_rows: 4096,
            memory_budget_bytes: 64 * 1024 * 1024,
            strict_mode: false,
            append_retries: 3,
            append_backoff_ms: 10,
            author: "varve".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| EngineError::Io(format!("config parse: {e}")))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Io(format!("config read: {e}")))?;
        Self::from_toml_str(&content)
    }

    /// Effective scan parallelism bound.
    pub fn effective_max_degree(&self) -> usize {
        if self.max_parallel_degree == 0 {
            num_cpus::get()
        } else {
            self.max_parallel_degree
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.stripe_rows, 10_000);
        assert_eq!(cfg.page_bytes, 64 * 1024);
        assert_eq!(cfg.hotpath_threshold, 10);
        assert_eq!(cfg.recursion_limit, 1000);
        assert_eq!(cfg.poll_rows, 4096);
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg = EngineConfig::from_toml_str("stripe_rows = 128\nstrict_mode = true\n").unwrap();
        assert_eq!(cfg.stripe_rows, 128);
        assert!(cfg.strict_mode);
        // Untouched fields keep defaults.
        assert_eq!(cfg.hotpath_threshold, 10);
    }

    #[test]
    fn bad_toml_is_io_error() {
        let err = EngineConfig::from_toml_str("stripe_rows = [").unwrap_err();
        assert_eq!(err.code(), 13);
    }

    #[test]
    fn zero_degree_falls_back_to_cores() {
        let cfg = EngineConfig::default();
        assert!(cfg.effective_max_degree() >= 1);
        let fixed = EngineConfig { max_parallel_degree: 3, ..EngineConfig::default() };
        assert_eq!(fixed.effective_max_degree(), 3);
    }
}
