use actix_web::{web, HttpRequest, HttpResponse};
use x402_verify::security::bearer_matches;
use x402_verify::{ChainBackend, FacilitatorBackend, PaymentRequirement};

use crate::gate;
use crate::headers::extract_proofs;
use crate::metrics;
use crate::state::AppState;

/// Register `/health`, `/metrics` and the priced `/api/*` routes.
pub fn configure<C, F>(cfg: &mut web::ServiceConfig)
where
    C: ChainBackend + 'static,
    F: FacilitatorBackend + 'static,
{
    cfg.route("/health", web::get().to(health::<C, F>))
        .route("/metrics", web::get().to(metrics_endpoint::<C, F>))
        .route("/api/{tail:.*}", web::get().to(paid_resource::<C, F>))
        .route("/api/{tail:.*}", web::post().to(paid_resource::<C, F>));
}

/// GET /health
pub async fn health<C, F>(state: web::Data<AppState<C, F>>) -> HttpResponse
where
    C: ChainBackend + 'static,
    F: FacilitatorBackend + 'static,
{
    let cache = state.engine.cache().stats();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "x402-verify-server",
        "version": env!("CARGO_PKG_VERSION"),
        "pricedEndpoints": state.prices.len(),
        "chains": state.chains.ids().collect::<Vec<_>>(),
        "unifiedFallback": state.engine.config().unified_fallback,
        "cache": {
            "entries": cache.entries,
            "hits": cache.hits,
            "misses": cache.misses,
            "hitRate": cache.hit_rate(),
        },
    }))
}

/// GET /metrics - Prometheus text format, bearer-gated when a token is set.
pub async fn metrics_endpoint<C, F>(
    req: HttpRequest,
    state: web::Data<AppState<C, F>>,
) -> HttpResponse
where
    C: ChainBackend + 'static,
    F: FacilitatorBackend + 'static,
{
    match &state.metrics_token {
        Some(expected) => {
            let header = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            if !bearer_matches(header, expected) {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None if !state.public_metrics => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN or X402_PUBLIC_METRICS=true to access /metrics"
            }));
        }
        None => {}
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(x402_verify::metrics::metrics_output())
}

/// Any priced path under `/api`. Unpriced paths are 404.
pub async fn paid_resource<C, F>(
    req: HttpRequest,
    state: web::Data<AppState<C, F>>,
) -> HttpResponse
where
    C: ChainBackend + 'static,
    F: FacilitatorBackend + 'static,
{
    let Some(requirement) = state.requirement_for(req.path()) else {
        return HttpResponse::NotFound().json(serde_json::json!({ "error": "not found" }));
    };

    let response = gate_request(&req, state.get_ref(), &requirement).await;
    // Route label comes from the price table, so cardinality is bounded.
    metrics::observe(
        requirement.resource.as_deref().unwrap_or("unknown"),
        response.status().as_u16(),
    );
    response
}

async fn gate_request<C, F>(
    req: &HttpRequest,
    state: &AppState<C, F>,
    requirement: &PaymentRequirement,
) -> HttpResponse
where
    C: ChainBackend,
    F: FacilitatorBackend,
{
    let proofs = match extract_proofs(req.headers()) {
        Ok(Some(proofs)) => proofs,
        Ok(None) => return gate::payment_required(requirement),
        Err(e) => {
            tracing::warn!(path = %req.path(), error = %e, "unreadable payment headers");
            return gate::malformed_proof(requirement);
        }
    };

    let outcome = match state
        .engine
        .verify_with_fallback(requirement, &proofs.primary, proofs.secondary.as_ref())
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(path = %req.path(), error = %e, "payment verification failed");
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "payment verification failed"
            }));
        }
    };

    let Some(transfer) = outcome.normalized_transfer.as_ref().filter(|_| outcome.is_verified())
    else {
        return gate::not_verified(requirement, &outcome);
    };

    HttpResponse::Ok()
        .insert_header(("X-Payment-Verified-By", outcome.backend_used.as_str()))
        .json(serde_json::json!({
            "resource": requirement.resource,
            "payment": {
                "chain": transfer.chain,
                "txHash": transfer.tx_hash,
                "payer": transfer.from_address,
                "amountUsd": transfer.amount_usd(),
                "backend": outcome.backend_used,
            },
        }))
}
