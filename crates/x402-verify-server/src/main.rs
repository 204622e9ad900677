use std::time::Duration;

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use x402_verify::{ChainReader, FacilitatorClient};
use x402_verify_server::{config::ServerConfig, cors::build_cors, routes, state};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!(?config, "configuration loaded");

    let parts = match state::build_live(&config) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!("failed to initialise verifier: {e}");
            std::process::exit(1);
        }
    };

    let verifier = &config.verifier;
    tracing::info!("Starting x402-verify-server on port {}", config.port);
    tracing::info!("Merchant address: {}", verifier.merchant_address);
    for chain in verifier.chains.iter() {
        if let Some(address) = &chain.payment_address {
            tracing::info!("Payment address on {}: {}", chain.id, address);
        }
    }
    tracing::info!(
        "Facilitator: {} ({})",
        verifier.facilitator_url,
        if verifier.facilitator_enabled { "enabled" } else { "disabled" }
    );
    tracing::info!(
        "HMAC auth: {}",
        if verifier.facilitator_secret.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    tracing::info!("Unified fallback: {}", verifier.unified_fallback);
    tracing::info!("Database: {}", verifier.db_path);
    for (path, price) in config.prices.iter() {
        tracing::info!("Priced endpoint: {path} = ${price}");
    }
    tracing::info!("Rate limit: {} req/min per IP", config.rate_limit_rpm);

    if parts.facilitator.is_enabled() {
        let facilitator = parts.facilitator.clone();
        tokio::spawn(async move {
            match facilitator.supported_networks().await {
                Ok(kinds) => {
                    let networks: Vec<_> = kinds.iter().map(|k| k.network.as_str()).collect();
                    tracing::info!(?networks, "facilitator reachable");
                }
                Err(e) => tracing::warn!(error = %e, "facilitator not reachable at startup"),
            }
        });
    }

    let governor_conf = match GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
    {
        Some(conf) => conf,
        None => {
            tracing::error!("invalid rate limit: {}", config.rate_limit_rpm);
            std::process::exit(1);
        }
    };

    let allowed_origins = config.allowed_origins.clone();
    let state_data = web::Data::new(parts.state);

    let result = HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .wrap(Logger::default())
            .wrap(build_cors(&allowed_origins))
            .wrap(Governor::new(&governor_conf))
            .configure(routes::configure::<ChainReader, FacilitatorClient>)
    })
    .bind(("0.0.0.0", config.port))?
    .run()
    .await;

    // The writer drains once the last recorder clone (held by the app state) is dropped.
    match tokio::time::timeout(Duration::from_secs(5), parts.analytics_writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "analytics writer did not shut down cleanly"),
        Err(_) => tracing::warn!("analytics queue not drained before shutdown"),
    }
    result
}
