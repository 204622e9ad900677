use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::LazyLock;

pub static VERIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_verify_outcomes_total",
        "Verification outcomes by status, reason and backend",
        &["status", "reason", "backend"]
    )
    .unwrap()
});

pub static VERIFICATION_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "x402_verify_latency_seconds",
        "End-to-end verification latency",
        &["backend"],
        vec![0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .unwrap()
});

pub static CACHE_LOOKUPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_verify_cache_lookups_total",
        "Verification cache lookups",
        &["result"]
    )
    .unwrap()
});

pub static BACKEND_CALLS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_verify_backend_calls_total",
        "External backend calls by backend and result",
        &["backend", "result"]
    )
    .unwrap()
});

pub static ANALYTICS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "x402_verify_analytics_dropped_total",
        "Verification events dropped because the analytics queue was full"
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
