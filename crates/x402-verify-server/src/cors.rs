use actix_cors::Cors;
use actix_web::http::header::{HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};

use crate::headers::{X_PAYMENT, X_PAYMENT_CHAIN, X_PAYMENT_TX};

/// Allow the configured origins, or localhost on any port when none are set.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin = origin.to_str().unwrap_or("");
            if allowed.is_empty() {
                origin == "http://localhost" || origin.starts_with("http://localhost:")
            } else {
                allowed.iter().any(|a| a == "*" || a == origin)
            }
        })
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            AUTHORIZATION,
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static(X_PAYMENT),
            HeaderName::from_static(X_PAYMENT_TX),
            HeaderName::from_static(X_PAYMENT_CHAIN),
        ])
        .expose_headers(vec![
            RETRY_AFTER,
            HeaderName::from_static("x-payment-required"),
            HeaderName::from_static("x-payment-amount"),
            HeaderName::from_static("x-payment-verified-by"),
        ])
        .max_age(3600)
}
