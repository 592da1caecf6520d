//! Structured observability hooks for engine lifecycle events.
//!
//! This module provides:
//! - Global tracing initialization (env-filtered, optional JSON output)
//! - Query-scoped tracing spans via the `QuerySpan` RAII guard
//! - Emission functions for key lifecycle events: commit append, plan
//!   selection, cache hits/misses, hot-path promotion and retirement
//!
//! Events are emitted at `info!` level, filterable via the `VARVE_LOG` env
//! var. For JSON output, set `VARVE_LOG_FORMAT=json`.

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("VARVE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("VARVE_LOG_FORMAT").is_ok_and(|v| v == "json");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A subscriber may already be installed by the embedding application.
    let _ = result;
}

/// RAII guard that enters a query-scoped tracing span.
pub struct QuerySpan {
    _span: tracing::span::EnteredSpan,
}

impl QuerySpan {
    /// Create and enter a span tagged with the query id.
    pub fn enter(query_id: &str) -> Self {
        let span = tracing::info_span!("varve.query", query_id = %query_id);
        Self { _span: span.entered() }
    }
}

/// Emit event: a commit was appended to the timeline.
pub fn emit_commit_appended(commit: &str, parent: &str, operation: &str, tables: usize) {
    info!(
        event = "commit.appended",
        commit = %commit,
        parent = %parent,
        operation = %operation,
        tables = tables,
    );
}

/// Emit event: the planner selected an access path.
pub fn emit_plan_selected(fingerprint: &str, op: &str, cost: f64, degree: usize) {
    info!(
        event = "plan.selected",
        fingerprint = %fingerprint,
        op = %op,
        cost = cost,
        degree = degree,
    );
}

/// Emit event: result cache hit.
pub fn emit_cache_hit(fingerprint: &str) {
    info!(event = "cache.hit", fingerprint = %fingerprint);
}

/// Emit event: result cache miss.
pub fn emit_cache_miss(fingerprint: &str) {
    info!(event = "cache.miss", fingerprint = %fingerprint);
}

/// Emit event: a function crossed the hot-path threshold and was specialized.
pub fn emit_hotpath_promoted(function: &str, calls: u64) {
    info!(event = "hotpath.promoted", function = %function, calls = calls);
}

/// Emit event: a specialized function lost its benchmark race and was retired.
pub fn emit_hotpath_retired(function: &str, reason: &str) {
    info!(event = "hotpath.retired", function = %function, reason = %reason);
}

/// Emit event: a blob failed integrity checks and was quarantined.
pub fn emit_integrity_quarantined(key: &str, detail: &str) {
    warn!(event = "integrity.quarantined", key = %key, detail = %detail);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_span_enter_does_not_panic() {
        let _span = QuerySpan::enter("q-test");
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
