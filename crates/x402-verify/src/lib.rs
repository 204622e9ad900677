//! x402 payment verification.
//!
//! Decides whether an HTTP 402 payment proof entitles a request to a
//! protected resource. Two kinds of proof are accepted:
//!
//! - **Facilitator token** (`X-PAYMENT`): a base64 envelope checked by an
//!   external facilitator ([`FacilitatorClient`])
//! - **On-chain reference** (`x-payment-tx` + `x-payment-chain`): a
//!   transaction read straight from an EVM or Solana node ([`ChainReader`])
//!
//! Either way the result is normalized into a [`NormalizedTransfer`], run
//! through anti-fraud policy and consumed exactly once before
//! [`VerificationEngine`] reports it `Verified`. The engine is fail-closed:
//! timeouts, unknown chains and unreadable responses never grant access.
//!
//! # Quick example
//!
//! ```no_run
//! use x402_verify::{
//!     FacilitatorClient, ChainReader, Proof, ReplayGuard,
//!     VerificationEngine, VerifierConfig,
//! };
//! use x402_verify::http_client::{build_client, RetryPolicy};
//! # use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VerifierConfig::from_env()?;
//! let http = build_client(config.chain_timeout)?;
//! let registry = Arc::new(config.chains.clone());
//! let chain = ChainReader::from_registry(&registry, http.clone(), RetryPolicy::default())?;
//! let facilitator = FacilitatorClient::new(http, config.facilitator_url.clone(), registry);
//! let engine = VerificationEngine::new(
//!     chain,
//!     facilitator,
//!     ReplayGuard::in_memory(),
//!     config.engine_config(),
//! );
//! # let requirement: x402_verify::PaymentRequirement = todo!();
//! let outcome = engine
//!     .verify(&requirement, &Proof::on_chain("0x…", "base"))
//!     .await?;
//! println!("{:?}", outcome.status);
//! # Ok(())
//! # }
//! ```

// Data model
pub mod amount;
pub mod chain;
pub mod error;
pub mod outcome;
pub mod payment;

// Verification pipeline
pub mod backend;
pub mod cache;
pub mod engine;
pub mod policy;
pub mod replay;

// Backends
pub mod facilitator_client;
pub mod reader;

// Plumbing
pub mod analytics;
pub mod config;
pub mod hmac;
pub mod http_client;
pub mod metrics;
pub mod security;

// Re-exports
pub use amount::{TokenAmount, UsdAmount};
pub use analytics::{AnalyticsRecorder, AnalyticsSink, SqliteAnalyticsSink, VerificationEvent};
pub use backend::{BackendError, ChainBackend, FacilitatorBackend};
pub use chain::{ChainConfig, ChainFamily, ChainRegistry};
pub use config::{ConfigError, VerifierConfig};
pub use engine::{EngineConfig, VerificationEngine};
pub use error::VerifyError;
pub use facilitator_client::FacilitatorClient;
pub use outcome::{Backend, Reason, VerificationOutcome, VerificationStatus};
pub use payment::*;
pub use policy::{PolicyConfig, PolicyEngine};
pub use reader::ChainReader;
pub use replay::{ReplayGuard, ReplayStore, SqliteReplayStore};
