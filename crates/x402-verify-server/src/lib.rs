//! HTTP 402 resource server on top of [`x402_verify`].
//!
//! Prices come from a path table; a request to a priced path must carry a
//! payment proof in its headers, which the verification engine checks before
//! the request is served. Anything short of `Verified` gets a 402 that
//! restates the price so the client can pay and retry.
//!
//! # Modules
//!
//! - [`config`]: server settings on top of [`x402_verify::VerifierConfig`]
//! - [`pricing`]: path price table ([`PriceTable`](pricing::PriceTable))
//! - [`headers`]: `X-PAYMENT` / `x-payment-tx` extraction
//! - [`gate`]: 402 response bodies
//! - [`routes`]: `/health`, `/metrics`, `/api/*`

pub mod config;
pub mod cors;
pub mod gate;
pub mod headers;
pub mod metrics;
pub mod pricing;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use gate::PaymentRequiredBody;
pub use headers::{extract_proofs, PresentedProofs};
pub use pricing::PriceTable;
pub use state::{AppState, LiveState};
