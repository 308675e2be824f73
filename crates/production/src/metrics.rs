//! Production metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Consensus ===
    pub sequences_committed: Counter,
    pub committed_sequence: Gauge,
    pub view_number: Gauge,
    pub view_changes: Counter,
    pub checkpoints_built: Counter,
    pub stable_checkpoint: Gauge,

    // === Queues ===
    pub backlog_size: Gauge,
    pub pending_requests: Gauge,

    // === Network ===
    pub messages_sent: Counter,
    pub messages_received: Counter,

    // === Collaborators ===
    pub apply_latency: Histogram,
    pub storage_write_latency: Histogram,

    // === Errors ===
    pub messages_rejected: CounterVec,
    pub collaborator_errors: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let latency_buckets = vec![
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
        ];

        Self {
            // Consensus
            sequences_committed: register_counter!(
                "pbft_sequences_committed_total",
                "Total number of sequences committed"
            )
            .unwrap(),

            committed_sequence: register_gauge!(
                "pbft_committed_sequence",
                "Last committed sequence"
            )
            .unwrap(),

            view_number: register_gauge!("pbft_view_number", "View number of the current round")
                .unwrap(),

            view_changes: register_counter!(
                "pbft_view_changes_total",
                "Total number of view changes applied"
            )
            .unwrap(),

            checkpoints_built: register_counter!(
                "pbft_checkpoints_built_total",
                "Checkpoints built by the application"
            )
            .unwrap(),

            stable_checkpoint: register_gauge!(
                "pbft_stable_checkpoint_sequence",
                "Sequence of the latest stable checkpoint"
            )
            .unwrap(),

            // Queues
            backlog_size: register_gauge!(
                "pbft_backlog_size",
                "Messages waiting for the local view or phase"
            )
            .unwrap(),

            pending_requests: register_gauge!(
                "pbft_pending_requests",
                "Client requests waiting to be committed"
            )
            .unwrap(),

            // Network
            messages_sent: register_counter!(
                "pbft_messages_sent_total",
                "Total consensus messages broadcast"
            )
            .unwrap(),

            messages_received: register_counter!(
                "pbft_messages_received_total",
                "Total consensus messages received"
            )
            .unwrap(),

            // Collaborators
            apply_latency: register_histogram!(
                "pbft_apply_latency_seconds",
                "Application commit and checkpoint latency",
                latency_buckets.clone()
            )
            .unwrap(),

            storage_write_latency: register_histogram!(
                "pbft_storage_write_latency_seconds",
                "Snapshot and checkpoint write latency",
                latency_buckets
            )
            .unwrap(),

            // Errors
            messages_rejected: register_counter_vec!(
                "pbft_messages_rejected_total",
                "Messages rejected by the consensus core",
                &["reason"]
            )
            .unwrap(),

            collaborator_errors: register_counter_vec!(
                "pbft_collaborator_errors_total",
                "Failures reported by the application, storage or transport",
                &["kind"]
            )
            .unwrap(),
        }
    }
}

/// Get or initialize the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Record newly committed sequences.
pub fn record_committed(sequence: u64, newly_committed: u64) {
    let m = metrics();
    m.sequences_committed.inc_by(newly_committed as f64);
    m.committed_sequence.set(sequence as f64);
}

/// Record the view number of the live round.
pub fn set_view_number(view_number: u64) {
    metrics().view_number.set(view_number as f64);
}

/// Record applied view changes.
pub fn record_view_changes(count: u64) {
    metrics().view_changes.inc_by(count as f64);
}

/// Record a checkpoint built by the application.
pub fn record_checkpoint_built() {
    metrics().checkpoints_built.inc();
}

/// Record the latest stable checkpoint.
pub fn set_stable_checkpoint(sequence: u64) {
    metrics().stable_checkpoint.set(sequence as f64);
}

/// Update queue depths.
pub fn set_queue_depths(backlog: usize, pending_requests: usize) {
    let m = metrics();
    m.backlog_size.set(backlog as f64);
    m.pending_requests.set(pending_requests as f64);
}

/// Record a broadcast.
pub fn record_message_sent() {
    metrics().messages_sent.inc();
}

/// Record an inbound message.
pub fn record_message_received() {
    metrics().messages_received.inc();
}

/// Record a rejected message.
pub fn record_message_rejected(reason: &str) {
    metrics()
        .messages_rejected
        .with_label_values(&[reason])
        .inc();
}

/// Record application latency.
pub fn record_apply(latency_secs: f64) {
    metrics().apply_latency.observe(latency_secs);
}

/// Record storage write latency.
pub fn record_storage_write(latency_secs: f64) {
    metrics().storage_write_latency.observe(latency_secs);
}

/// Record a collaborator failure.
pub fn record_collaborator_error(kind: &str) {
    metrics()
        .collaborator_errors
        .with_label_values(&[kind])
        .inc();
}
