// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the migration subsystem.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The hosting process is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `registry_migration_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: document, relational
//! - `outcome`: committed, conflict, rolled_back
//! - `reason`: chain failure kind

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the end of a top-level transaction
pub fn record_transaction(backend: &str, outcome: &str) {
    counter!(
        "registry_migration_transactions_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a write rejected by a read-only manager
pub fn record_read_only_violation(backend: &str, operation: &str) {
    counter!(
        "registry_migration_read_only_violations_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a committed migration state change
pub fn record_state_transition(from: &str, to: &str) {
    counter!(
        "registry_migration_state_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Set the current migration phase (0 = DOC_ONLY ... 5 = REL_ONLY)
pub fn set_migration_phase(phase: u8) {
    gauge!("registry_migration_phase").set(phase as f64);
}

/// Record the size of a successfully listed segment chain
pub fn record_segments_listed(count: usize) {
    counter!("registry_migration_segments_listed_total").increment(count as u64);
    histogram!("registry_migration_chain_length").record(count as f64);
}

/// Record a listing that refused to return a chain
pub fn record_chain_failure(reason: &str) {
    counter!(
        "registry_migration_chain_failures_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record segments found by probing that listing had missed
pub fn record_segments_healed(count: usize) {
    counter!("registry_migration_segments_healed_total").increment(count as u64);
}

/// Record replayed transactions
pub fn record_replay_applied(count: usize) {
    counter!("registry_migration_replay_applied_total").increment(count as u64);
}

/// Record queued transactions dropped because the cursor had passed them
pub fn record_replay_skipped(count: usize) {
    counter!("registry_migration_replay_skipped_total").increment(count as u64);
}

/// Set replay queue depth in transactions
pub fn set_replay_queue_depth(depth: usize) {
    gauge!("registry_migration_replay_queue_depth").set(depth as f64);
}

/// Record a segment applied during backfill
pub fn record_backfill_segment(mutations: usize) {
    counter!("registry_migration_backfill_segments_total").increment(1);
    counter!("registry_migration_backfill_mutations_total").increment(mutations as u64);
}

/// Record entities found to differ between backends
pub fn record_consistency_mismatches(kind: &str, count: usize) {
    counter!(
        "registry_migration_consistency_mismatches_total",
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Records operation duration when dropped.
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "registry_migration_operation_seconds",
            "operation" => self.operation
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
