//! Update pipeline metrics.
//!
//! Counters and histograms for lease contention, applied updates, range
//! collapses and flushes. These complement the structured logging in the
//! coordinator.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Lease Metrics
// ============================================================================

/// Time spent waiting for a document lease.
pub const LOCK_WAIT_SECONDS: &str = "quire_lock_wait_seconds";

/// Lease acquisitions that timed out.
pub const LOCK_TIMEOUTS: &str = "quire_lock_timeouts_total";

// ============================================================================
// Update Metrics
// ============================================================================

/// Updates applied and persisted.
pub const UPDATES_APPLIED: &str = "quire_updates_applied_total";

/// Updates rejected, labelled by error kind.
pub const UPDATE_ERRORS: &str = "quire_update_errors_total";

/// Updates taken from the queue per drain cycle.
pub const DRAIN_BATCH_SIZE: &str = "quire_drain_batch_size";

/// Updates that collapsed a range to zero length.
pub const RANGES_COLLAPSED: &str = "quire_ranges_collapsed_total";

/// History recorder failures (logged, never propagated).
pub const HISTORY_FAILURES: &str = "quire_history_record_failures_total";

// ============================================================================
// Lifecycle Metrics
// ============================================================================

/// Documents loaded from the durable store into the cache.
pub const DOCS_LOADED: &str = "quire_docs_loaded_total";

/// Flushes to the durable store, labelled by outcome.
pub const DOC_FLUSHES: &str = "quire_doc_flushes_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all update pipeline metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_histogram!(LOCK_WAIT_SECONDS, "Time spent waiting for document leases");
    describe_counter!(LOCK_TIMEOUTS, "Total document lease acquisitions that timed out");
    describe_counter!(UPDATES_APPLIED, "Total updates applied and persisted");
    describe_counter!(UPDATE_ERRORS, "Total updates rejected, by error kind");
    describe_histogram!(DRAIN_BATCH_SIZE, "Updates processed per drain cycle");
    describe_counter!(RANGES_COLLAPSED, "Total updates that collapsed a range");
    describe_counter!(HISTORY_FAILURES, "Total failed history recordings");
    describe_counter!(DOCS_LOADED, "Total documents loaded from the durable store");
    describe_counter!(DOC_FLUSHES, "Total flushes to the durable store, by outcome");
}

/// Records how long a lease acquisition waited.
pub fn record_lock_wait(waited: Duration) {
    histogram!(LOCK_WAIT_SECONDS).record(waited.as_secs_f64());
}

/// Records a lease acquisition timeout.
pub fn record_lock_timeout() {
    counter!(LOCK_TIMEOUTS).increment(1);
}

/// Records an applied update.
pub fn record_update_applied(op_count: usize) {
    let kind = if op_count == 0 { "empty" } else { "ops" };
    counter!(UPDATES_APPLIED, "kind" => kind).increment(1);
}

/// Records a rejected update.
pub fn record_update_error(kind: &'static str) {
    counter!(UPDATE_ERRORS, "kind" => kind).increment(1);
}

/// Records the size of a drain batch.
#[allow(clippy::cast_precision_loss)]
pub fn record_drain_batch(size: usize) {
    histogram!(DRAIN_BATCH_SIZE).record(size as f64);
}

/// Records an update that collapsed a range.
pub fn record_ranges_collapsed() {
    counter!(RANGES_COLLAPSED).increment(1);
}

/// Records a history recorder failure.
pub fn record_history_failure() {
    counter!(HISTORY_FAILURES).increment(1);
}

/// Records a document load from the durable store.
pub fn record_doc_loaded() {
    counter!(DOCS_LOADED).increment(1);
}

/// Records a flush attempt.
pub fn record_flush(outcome: &'static str) {
    counter!(DOC_FLUSHES, "outcome" => outcome).increment(1);
}
