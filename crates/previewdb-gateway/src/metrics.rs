//! Prometheus Metrics for the previewdb gateway
//!
//! Exports metrics for:
//! - Routing decisions and federation rewrites
//! - Probe fallbacks to production
//! - Query latency and outcome
//! - Client connections, pinned sessions and federation bootstrap

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

// ═══════════════════════════════════════════════════════════════════════════
// ROUTING METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Queries routed by target store and statement category
pub static QUERIES_ROUTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "previewdb_queries_routed_total",
        "Total queries routed by target and statement category",
        &["target", "category"]
    )
    .unwrap()
});

/// Federation rewrite attempts by outcome (applied, not_applicable, rejected, error)
pub static REWRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "previewdb_rewrites_total",
        "Federation rewrite attempts by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Probe fallbacks by SQLSTATE of the failed fresh attempt
pub static PROBE_FALLBACKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "previewdb_probe_fallbacks_total",
        "Reads re-issued against production after the fresh probe failed",
        &["sqlstate"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// EXECUTION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Query latency by target and status
pub static QUERY_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "previewdb_query_duration_seconds",
        "Query execution latency in seconds",
        &["target", "status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap()
});

/// Errors surfaced to clients by category
pub static CLIENT_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "previewdb_client_errors_total",
        "Errors returned to clients by category",
        &["category"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTION & FEDERATION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Client sessions that pinned a fresh connection (transactions, SET)
pub static SESSIONS_PINNED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "previewdb_sessions_pinned_total",
        "Times a client session pinned a dedicated fresh connection"
    )
    .unwrap()
});

pub static ACTIVE_CONNECTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "previewdb_active_connections",
        "Client connections currently open"
    )
    .unwrap()
});

/// Bootstrap runs by outcome (success, failure)
pub static BOOTSTRAP_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "previewdb_federation_bootstrap_total",
        "Federation bootstrap runs by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static FEDERATED_TABLES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "previewdb_federated_tables",
        "Tables in the active federation catalog"
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize all metrics (call at startup)
pub fn init_metrics() {
    let _ = &*QUERIES_ROUTED_TOTAL;
    let _ = &*REWRITES_TOTAL;
    let _ = &*PROBE_FALLBACKS_TOTAL;
    let _ = &*QUERY_DURATION_SECONDS;
    let _ = &*CLIENT_ERRORS_TOTAL;
    let _ = &*SESSIONS_PINNED_TOTAL;
    let _ = &*ACTIVE_CONNECTIONS;
    let _ = &*BOOTSTRAP_TOTAL;
    let _ = &*FEDERATED_TABLES;

    ACTIVE_CONNECTIONS.set(0.0);
    FEDERATED_TABLES.set(0.0);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_query_routed(target: &str, category: &str) {
    QUERIES_ROUTED_TOTAL
        .with_label_values(&[target, category])
        .inc();
}

pub fn record_rewrite(outcome: &str) {
    REWRITES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_probe_fallback(sqlstate: &str) {
    PROBE_FALLBACKS_TOTAL.with_label_values(&[sqlstate]).inc();
}

/// Record query completion
pub fn record_query_completed(target: &str, status: &str, duration_secs: f64) {
    QUERY_DURATION_SECONDS
        .with_label_values(&[target, status])
        .observe(duration_secs);
}

pub fn record_client_error(category: &str) {
    CLIENT_ERRORS_TOTAL.with_label_values(&[category]).inc();
}

pub fn record_session_pinned() {
    SESSIONS_PINNED_TOTAL.inc();
}

pub fn connection_opened() {
    ACTIVE_CONNECTIONS.inc();
}

pub fn connection_closed() {
    ACTIVE_CONNECTIONS.dec();
}

pub fn record_bootstrap(success: bool, federated_tables: usize) {
    let outcome = if success { "success" } else { "failure" };
    BOOTSTRAP_TOTAL.with_label_values(&[outcome]).inc();
    if success {
        FEDERATED_TABLES.set(federated_tables as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_series() {
        init_metrics();
        record_query_routed("fresh", "read");
        record_rewrite("applied");
        let text = encode_metrics();
        assert!(text.contains("previewdb_queries_routed_total"));
        assert!(text.contains("previewdb_rewrites_total"));
    }
}
