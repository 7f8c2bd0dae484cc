//! Prometheus metrics for pass observability
//!
//! The dataworker is a batch job, so instead of serving a scrape endpoint
//! the registry is text-encoded into the log at the end of each pass and
//! picked up by the log pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use tracing::info;

lazy_static! {
    // Read-side metrics
    pub static ref EVENTS_READ: CounterVec = register_counter_vec!(
        "lattice_events_read_total",
        "Total settlement events read by type",
        &["chain_id", "event_type"]
    ).unwrap();

    pub static ref CHAIN_READ_FAILURES: CounterVec = register_counter_vec!(
        "lattice_chain_read_failures_total",
        "Chain reads that failed and narrowed the bundle range",
        &["chain_id"]
    ).unwrap();

    pub static ref RANGE_END_BLOCK: GaugeVec = register_gauge_vec!(
        "lattice_range_end_block",
        "End block of the current bundle range per chain",
        &["chain_id"]
    ).unwrap();

    // Bundle lifecycle metrics
    pub static ref BUNDLES_PROPOSED: CounterVec = register_counter_vec!(
        "lattice_bundles_proposed_total",
        "Root bundles proposed",
        &["outcome"]
    ).unwrap();

    pub static ref BUNDLES_DISPUTED: CounterVec = register_counter_vec!(
        "lattice_bundles_disputed_total",
        "Pending bundles disputed after root mismatch",
        &["outcome"]
    ).unwrap();

    pub static ref LEAVES_EXECUTED: CounterVec = register_counter_vec!(
        "lattice_leaves_executed_total",
        "Bundle leaves executed by type",
        &["leaf_type"]
    ).unwrap();

    pub static ref LEAVES_DEFERRED: CounterVec = register_counter_vec!(
        "lattice_leaves_deferred_total",
        "Leaf executions deferred to a later pass",
        &["leaf_type"]
    ).unwrap();

    // Finalizer metrics
    pub static ref WITHDRAWALS_PROVEN: CounterVec = register_counter_vec!(
        "lattice_withdrawals_proven_total",
        "Withdrawal proofs submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref WITHDRAWALS_FINALIZED: CounterVec = register_counter_vec!(
        "lattice_withdrawals_finalized_total",
        "Withdrawals finalized",
        &["chain_id"]
    ).unwrap();

    pub static ref WITHDRAWALS_SKIPPED: CounterVec = register_counter_vec!(
        "lattice_withdrawals_skipped_total",
        "Withdrawals skipped (pre-upgrade encoding or unmapped token)",
        &["chain_id"]
    ).unwrap();
}

pub fn record_events_read(chain_id: u64, event_type: &str, count: usize) {
    EVENTS_READ
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc_by(count as f64);
}

pub fn record_read_failure(chain_id: u64) {
    CHAIN_READ_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_range_end(chain_id: u64, end_block: u64) {
    RANGE_END_BLOCK
        .with_label_values(&[&chain_id.to_string()])
        .set(end_block as f64);
}

pub fn record_proposal() {
    BUNDLES_PROPOSED.with_label_values(&["submitted"]).inc();
}

pub fn record_dispute() {
    BUNDLES_DISPUTED.with_label_values(&["submitted"]).inc();
}

pub fn record_leaf_execution(leaf_type: &str, executed: u32, deferred: u32) {
    LEAVES_EXECUTED
        .with_label_values(&[leaf_type])
        .inc_by(executed as f64);
    LEAVES_DEFERRED
        .with_label_values(&[leaf_type])
        .inc_by(deferred as f64);
}

pub fn record_finalizations(chain_id: u64, proven: usize, finalized: usize, skipped: usize) {
    let chain = chain_id.to_string();
    WITHDRAWALS_PROVEN
        .with_label_values(&[&chain])
        .inc_by(proven as f64);
    WITHDRAWALS_FINALIZED
        .with_label_values(&[&chain])
        .inc_by(finalized as f64);
    WITHDRAWALS_SKIPPED
        .with_label_values(&[&chain])
        .inc_by(skipped as f64);
}

/// Encode the full registry into the log at end of pass
pub fn flush_to_log() {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_ok() {
        if let Ok(text) = String::from_utf8(buffer) {
            info!(metrics = %text, "Pass metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        record_events_read(10, "deposit", 3);
        record_events_read(10, "deposit", 2);
        let value = EVENTS_READ
            .with_label_values(&["10", "deposit"])
            .get();
        assert!(value >= 5.0);
    }
}
