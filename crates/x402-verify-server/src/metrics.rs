use prometheus::{register_int_counter_vec, IntCounterVec};
use std::sync::LazyLock;

/// Gated requests by priced route and response status.
pub static GATED_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_verify_server_gated_requests_total",
        "Requests to priced routes by route and HTTP status",
        &["route", "status"]
    )
    .unwrap()
});

pub fn observe(route: &str, status: u16) {
    GATED_REQUESTS
        .with_label_values(&[route, &status.to_string()])
        .inc();
}
