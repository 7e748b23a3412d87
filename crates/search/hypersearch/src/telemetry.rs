//! Logging setup and search metrics
//!
//! Counters are exported through the `metrics` facade, so any recorder the
//! host installs (Prometheus, statsd, ...) picks them up. A process-local
//! copy is kept in atomics for worker reports and tests.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

use crate::types::CompletionReason;

pub const MODELS_CREATED: &str = "hypersearch_models_created_total";
pub const MODELS_COMPLETED: &str = "hypersearch_models_completed_total";
pub const ORPHANS_ADOPTED: &str = "hypersearch_orphans_adopted_total";
pub const OWNERSHIP_LOST: &str = "hypersearch_ownership_lost_total";
pub const STATE_CONFLICTS: &str = "hypersearch_engine_state_conflicts_total";
pub const ACTIVE_SWARMS: &str = "hypersearch_active_swarms";

static DESCRIBE: Once = Once::new();

/// Install a `fmt` subscriber honouring `RUST_LOG`, falling back to `default_filter`
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(MODELS_CREATED, "Models inserted into the job store");
        describe_counter!(MODELS_COMPLETED, "Models completed, by completion reason");
        describe_counter!(ORPHANS_ADOPTED, "Orphaned models claimed from presumed-dead workers");
        describe_counter!(OWNERSHIP_LOST, "Models abandoned after another worker took them over");
        describe_counter!(STATE_CONFLICTS, "Engine state writes rejected by the version check");
        describe_gauge!(ACTIVE_SWARMS, "Swarms currently active");
    });
}

/// Per-worker search counters
#[derive(Debug, Default)]
pub struct SearchMetrics {
    models_created: AtomicU64,
    models_completed: AtomicU64,
    models_errored: AtomicU64,
    orphans_adopted: AtomicU64,
    ownership_lost: AtomicU64,
    state_conflicts: AtomicU64,
}

/// Point-in-time copy of [`SearchMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub models_created: u64,
    pub models_completed: u64,
    pub models_errored: u64,
    pub orphans_adopted: u64,
    pub ownership_lost: u64,
    pub state_conflicts: u64,
}

impl SearchMetrics {
    pub fn new() -> Self {
        describe_metrics();
        Self::default()
    }

    pub fn model_created(&self) {
        self.models_created.fetch_add(1, Ordering::Relaxed);
        counter!(MODELS_CREATED).increment(1);
    }

    pub fn model_completed(&self, reason: CompletionReason) {
        self.models_completed.fetch_add(1, Ordering::Relaxed);
        if reason == CompletionReason::Error {
            self.models_errored.fetch_add(1, Ordering::Relaxed);
        }
        counter!(MODELS_COMPLETED, "reason" => reason.as_str()).increment(1);
    }

    pub fn orphan_adopted(&self) {
        self.orphans_adopted.fetch_add(1, Ordering::Relaxed);
        counter!(ORPHANS_ADOPTED).increment(1);
    }

    pub fn ownership_lost(&self) {
        self.ownership_lost.fetch_add(1, Ordering::Relaxed);
        counter!(OWNERSHIP_LOST).increment(1);
    }

    pub fn state_conflict(&self) {
        self.state_conflicts.fetch_add(1, Ordering::Relaxed);
        counter!(STATE_CONFLICTS).increment(1);
    }

    pub fn active_swarms(&self, count: usize) {
        gauge!(ACTIVE_SWARMS).set(count as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            models_created: self.models_created.load(Ordering::Relaxed),
            models_completed: self.models_completed.load(Ordering::Relaxed),
            models_errored: self.models_errored.load(Ordering::Relaxed),
            orphans_adopted: self.orphans_adopted.load(Ordering::Relaxed),
            ownership_lost: self.ownership_lost.load(Ordering::Relaxed),
            state_conflicts: self.state_conflicts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_events() {
        let metrics = SearchMetrics::new();
        metrics.model_created();
        metrics.model_created();
        metrics.model_completed(CompletionReason::Eof);
        metrics.model_completed(CompletionReason::Error);
        metrics.orphan_adopted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.models_created, 2);
        assert_eq!(snapshot.models_completed, 2);
        assert_eq!(snapshot.models_errored, 1);
        assert_eq!(snapshot.orphans_adopted, 1);
        assert_eq!(snapshot.ownership_lost, 0);
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("debug");
        init_tracing("info");
    }
}
