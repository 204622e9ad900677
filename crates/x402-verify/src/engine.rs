//! The verification pipeline.
//!
//! ```text
//! requirement, proof
//!   -> cache lookup
//!   -> facilitator | chain (deadline per backend, optional race)
//!   -> replay check -> policy -> atomic consume
//!   -> cache insert -> analytics
//! ```
//!
//! Business failures never surface as `Err`: they are `Rejected` or
//! `BackendUnavailable` outcomes. `Err` means the caller handed over a broken
//! [`PaymentRequirement`].

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::analytics::{AnalyticsRecorder, VerificationEvent};
use crate::backend::{BackendError, ChainBackend, FacilitatorBackend};
use crate::cache::{fingerprint, VerificationCache, DEFAULT_TTL, DEFAULT_UNAVAILABLE_TTL};
use crate::config::{DEFAULT_CHAIN_TIMEOUT, DEFAULT_FACILITATOR_TIMEOUT};
use crate::metrics;
use crate::outcome::{Backend, Reason, VerificationOutcome};
use crate::payment::{NormalizedTransfer, PaymentRequirement, Proof};
use crate::policy::{PolicyConfig, PolicyEngine};
use crate::replay::{ConsumeResult, ConsumedProof, ReplayGuard};
use crate::VerifyError;

type Attempt = (Backend, Result<NormalizedTransfer, BackendError>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub policy: PolicyConfig,
    pub facilitator_timeout: Duration,
    pub chain_timeout: Duration,
    pub cache_ttl: Duration,
    pub unavailable_cache_ttl: Duration,
    /// Race both backends when a request carries a facilitator token and an
    /// on-chain proof at once.
    pub unified_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            facilitator_timeout: DEFAULT_FACILITATOR_TIMEOUT,
            chain_timeout: DEFAULT_CHAIN_TIMEOUT,
            cache_ttl: DEFAULT_TTL,
            unavailable_cache_ttl: DEFAULT_UNAVAILABLE_TTL,
            unified_fallback: false,
        }
    }
}

pub struct VerificationEngine<C, F> {
    chain: C,
    facilitator: F,
    replay: ReplayGuard,
    cache: VerificationCache,
    policy: PolicyEngine,
    analytics: AnalyticsRecorder,
    config: EngineConfig,
}

impl<C, F> VerificationEngine<C, F>
where
    C: ChainBackend,
    F: FacilitatorBackend,
{
    pub fn new(chain: C, facilitator: F, replay: ReplayGuard, config: EngineConfig) -> Self {
        Self {
            chain,
            facilitator,
            replay,
            cache: VerificationCache::new(config.cache_ttl, config.unavailable_cache_ttl),
            policy: PolicyEngine::new(config.policy.clone()),
            analytics: AnalyticsRecorder::noop(),
            config,
        }
    }

    pub fn with_analytics(mut self, analytics: AnalyticsRecorder) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &VerificationCache {
        &self.cache
    }

    /// Verify a single proof against `requirement`.
    pub async fn verify(
        &self,
        requirement: &PaymentRequirement,
        proof: &Proof,
    ) -> Result<VerificationOutcome, VerifyError> {
        self.verify_with_fallback(requirement, proof, None).await
    }

    /// Verify `primary`, racing it against `secondary` when unified fallback
    /// is enabled.
    ///
    /// The first backend to return a definitive answer wins and the other
    /// call is dropped. Transient answers (timeout, node down, not yet
    /// confirmed) wait for the other backend; if both are transient the
    /// primary's answer is reported. With fallback disabled `secondary` is
    /// ignored.
    pub async fn verify_with_fallback(
        &self,
        requirement: &PaymentRequirement,
        primary: &Proof,
        secondary: Option<&Proof>,
    ) -> Result<VerificationOutcome, VerifyError> {
        requirement.validate()?;
        let started = Instant::now();

        if let Some(cached) = self.cache.get(&fingerprint(requirement, primary)) {
            return Ok(self.serve_cached(requirement, cached, started));
        }

        // A secondary proof that already has a verdict is not raced again; it
        // only stands in if the primary cannot be decided.
        let mut secondary = secondary.filter(|_| self.config.unified_fallback);
        let mut cached_secondary = None;
        if let Some(proof) = secondary {
            if let Some(cached) = self.cache.get(&fingerprint(requirement, proof)) {
                cached_secondary = Some(cached);
                secondary = None;
            }
        }

        let (attempt, decided_by) = match secondary {
            Some(secondary) => self.race(requirement, primary, secondary).await,
            None => (self.call_backend(requirement, primary).await, primary),
        };

        if is_transient(&attempt) {
            if let Some(cached) = cached_secondary {
                return Ok(self.serve_cached(requirement, cached, started));
            }
        }

        let outcome = self.decide(requirement, attempt, started);

        // Only the proof that produced the outcome is cached; a proof whose
        // call was cancelled or skipped has not been checked.
        self.cache
            .insert(fingerprint(requirement, decided_by), outcome.clone());
        self.analytics
            .record(VerificationEvent::from_outcome(&outcome, requirement));
        Ok(outcome)
    }

    fn serve_cached(
        &self,
        requirement: &PaymentRequirement,
        cached: VerificationOutcome,
        started: Instant,
    ) -> VerificationOutcome {
        let outcome = served_from_cache(cached, elapsed_ms(started));
        tracing::debug!(
            status = outcome.status.as_str(),
            reason = outcome.reason.as_str(),
            "verification served from cache"
        );
        self.analytics
            .record(VerificationEvent::from_outcome(&outcome, requirement));
        outcome
    }

    /// Returns the winning attempt and the proof it was made with.
    async fn race<'p>(
        &self,
        requirement: &PaymentRequirement,
        primary: &'p Proof,
        secondary: &'p Proof,
    ) -> (Attempt, &'p Proof) {
        let first = self.call_backend(requirement, primary);
        let second = self.call_backend(requirement, secondary);
        tokio::pin!(first, second);

        let (mut first_open, mut second_open) = (true, true);
        let mut fallback: Option<(Attempt, &'p Proof)> = None;

        while first_open || second_open {
            tokio::select! {
                attempt = &mut first, if first_open => {
                    first_open = false;
                    if !is_transient(&attempt) {
                        return (attempt, primary);
                    }
                    fallback = Some((attempt, primary));
                }
                attempt = &mut second, if second_open => {
                    second_open = false;
                    if !is_transient(&attempt) {
                        return (attempt, secondary);
                    }
                    fallback.get_or_insert((attempt, secondary));
                }
            }
        }

        fallback.unwrap_or((
            (
                backend_for(primary),
                Err(BackendError::Unavailable("no backend answered".into())),
            ),
            primary,
        ))
    }

    async fn call_backend(&self, requirement: &PaymentRequirement, proof: &Proof) -> Attempt {
        let (backend, result) = match proof {
            Proof::Facilitator(p) => {
                let result = if p.token.trim().is_empty() {
                    Err(BackendError::Malformed("empty payment token".into()))
                } else {
                    tokio::time::timeout(
                        self.config.facilitator_timeout,
                        self.facilitator.authorize_or_verify(&p.token, requirement),
                    )
                    .await
                    .unwrap_or(Err(BackendError::Timeout))
                };
                (Backend::Facilitator, result)
            }
            Proof::OnChain(p) => {
                let result = if p.tx_hash.trim().is_empty() || p.chain.trim().is_empty() {
                    Err(BackendError::Malformed(
                        "on-chain proof needs both tx hash and chain".into(),
                    ))
                } else {
                    tokio::time::timeout(
                        self.config.chain_timeout,
                        self.chain.fetch_transfer(
                            &p.chain,
                            &p.tx_hash,
                            requirement.pay_to_for(&p.chain),
                        ),
                    )
                    .await
                    .unwrap_or(Err(BackendError::Timeout))
                };
                (Backend::Chain, result)
            }
        };

        let label = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_transient() => "unavailable",
            Err(_) => "rejected",
        };
        metrics::BACKEND_CALLS
            .with_label_values(&[backend.as_str(), label])
            .inc();

        (backend, result)
    }

    /// Replay check, policy, then the atomic consume. Nothing here awaits.
    fn decide(
        &self,
        requirement: &PaymentRequirement,
        (backend, result): Attempt,
        started: Instant,
    ) -> VerificationOutcome {
        let transfer = match result {
            Ok(transfer) => transfer,
            Err(e) => {
                let reason = e.reason(backend);
                if e.is_transient() {
                    tracing::warn!(backend = backend.as_str(), error = %e, "backend unavailable");
                } else {
                    tracing::warn!(
                        backend = backend.as_str(),
                        reason = reason.as_str(),
                        error = %e,
                        "payment rejected by backend"
                    );
                }
                return VerificationOutcome::failed(reason, backend, elapsed_ms(started));
            }
        };

        let key = transfer.idempotency_key();
        let reject = |reason: Reason| {
            tracing::warn!(
                backend = backend.as_str(),
                key = %key,
                reason = reason.as_str(),
                "payment rejected"
            );
            VerificationOutcome::failed(reason, backend, elapsed_ms(started))
        };

        match self.replay.is_consumed(&key) {
            Ok(true) => return reject(Reason::ReplayDetected),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(key = %key, error = %e, "replay store lookup failed");
                return VerificationOutcome::failed(
                    Reason::ReplayStoreUnavailable,
                    backend,
                    elapsed_ms(started),
                );
            }
        }

        if let Err(reason) = self.policy.evaluate(&transfer, requirement, Utc::now()) {
            return reject(reason);
        }

        match self
            .replay
            .try_consume(&ConsumedProof::new(key.clone(), transfer.chain.clone()))
        {
            Ok(ConsumeResult::Consumed) => {}
            Ok(ConsumeResult::AlreadyConsumed) => return reject(Reason::ReplayDetected),
            Err(e) => {
                tracing::error!(key = %key, error = %e, "failed to record consumed proof");
                return VerificationOutcome::failed(
                    Reason::ReplayStoreUnavailable,
                    backend,
                    elapsed_ms(started),
                );
            }
        }

        tracing::info!(
            backend = backend.as_str(),
            chain = %transfer.chain,
            tx = %transfer.tx_hash,
            payer = %transfer.from_address,
            amount = %transfer.amount_usd(),
            "payment verified"
        );
        VerificationOutcome::verified(transfer, backend, elapsed_ms(started))
    }
}

/// A cached `Verified` means the proof is already spent: a second request
/// with it is a replay, not a second grant.
fn served_from_cache(cached: VerificationOutcome, latency_ms: u64) -> VerificationOutcome {
    if cached.is_verified() {
        return VerificationOutcome::failed(Reason::ReplayDetected, Backend::Cache, latency_ms);
    }
    VerificationOutcome {
        backend_used: Backend::Cache,
        latency_ms,
        ..cached
    }
}

fn is_transient((_, result): &Attempt) -> bool {
    matches!(result, Err(e) if e.is_transient())
}

fn backend_for(proof: &Proof) -> Backend {
    match proof {
        Proof::Facilitator(_) => Backend::Facilitator,
        Proof::OnChain(_) => Backend::Chain,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::{TokenAmount, UsdAmount};
    use crate::chain::BASE_USDC;
    use crate::outcome::VerificationStatus;
    use crate::payment::PaymentOption;
    use alloy::primitives::U256;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MERCHANT: &str = "0x000000000000000000000000000000000000abcd";
    const TX: &str = "0x8f3a1c4b2e5d6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8";

    fn requirement() -> PaymentRequirement {
        PaymentRequirement {
            price: UsdAmount::from_cents(1),
            merchant_address: MERCHANT.to_string(),
            payment_options: vec![PaymentOption {
                network: "base".to_string(),
                token_symbol: "USDC".to_string(),
                token_address: BASE_USDC.to_string(),
                pay_to: None,
            }],
            resource: Some("/api/data".to_string()),
            description: None,
        }
    }

    fn transfer(micros: u64) -> NormalizedTransfer {
        NormalizedTransfer {
            from_address: "0x1111111111111111111111111111111111111111".to_string(),
            to_address: MERCHANT.to_string(),
            amount: TokenAmount::new(U256::from(micros), 6),
            token: BASE_USDC.to_string(),
            chain: "base".to_string(),
            timestamp: Utc::now(),
            tx_hash: TX.to_string(),
            confirmations: 12,
        }
    }

    struct FixedChain {
        result: Result<NormalizedTransfer, BackendError>,
        calls: AtomicUsize,
    }

    impl ChainBackend for FixedChain {
        async fn fetch_transfer(
            &self,
            _chain: &str,
            _tx_hash: &str,
            _pay_to: &str,
        ) -> Result<NormalizedTransfer, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    struct NoFacilitator;

    impl FacilitatorBackend for NoFacilitator {
        async fn authorize_or_verify(
            &self,
            _token: &str,
            _requirement: &PaymentRequirement,
        ) -> Result<NormalizedTransfer, BackendError> {
            Err(BackendError::Disabled)
        }
    }

    fn engine(
        result: Result<NormalizedTransfer, BackendError>,
    ) -> VerificationEngine<FixedChain, NoFacilitator> {
        let config = EngineConfig {
            policy: PolicyConfig {
                min_payment: UsdAmount::from_cents(1),
                ..PolicyConfig::default()
            },
            ..EngineConfig::default()
        };
        VerificationEngine::new(
            FixedChain {
                result,
                calls: AtomicUsize::new(0),
            },
            NoFacilitator,
            ReplayGuard::in_memory(),
            config,
        )
    }

    #[tokio::test]
    async fn test_verified_then_replay() {
        let engine = engine(Ok(transfer(10_000)));
        let proof = Proof::on_chain(TX, "base");

        let first = engine.verify(&requirement(), &proof).await.unwrap();
        assert_eq!(first.status, VerificationStatus::Verified);
        assert_eq!(first.backend_used, Backend::Chain);
        assert!(first.normalized_transfer.is_some());

        let second = engine.verify(&requirement(), &proof).await.unwrap();
        assert_eq!(second.reason, Reason::ReplayDetected);
        assert_eq!(second.backend_used, Backend::Cache);
        assert_eq!(engine.chain.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_requirement_is_an_error() {
        let engine = engine(Ok(transfer(10_000)));
        let mut req = requirement();
        req.payment_options.clear();
        assert!(matches!(
            engine.verify(&req, &Proof::on_chain(TX, "base")).await,
            Err(VerifyError::InvalidRequirement(_))
        ));
        assert_eq!(engine.chain.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_proof_is_malformed_without_backend_call() {
        let engine = engine(Ok(transfer(10_000)));
        let outcome = engine
            .verify(&requirement(), &Proof::on_chain("", "base"))
            .await
            .unwrap();
        assert_eq!(outcome.reason, Reason::MalformedProof);
        assert_eq!(engine.chain.calls.load(Ordering::SeqCst), 0);

        let outcome = engine
            .verify(&requirement(), &Proof::facilitator("  "))
            .await
            .unwrap();
        assert_eq!(outcome.reason, Reason::MalformedProof);
        assert_eq!(outcome.backend_used, Backend::Facilitator);
    }

    #[tokio::test]
    async fn test_backend_errors_map_to_reasons() {
        let outcome = engine(Err(BackendError::NotFound))
            .verify(&requirement(), &Proof::on_chain(TX, "base"))
            .await
            .unwrap();
        assert_eq!(outcome.status, VerificationStatus::Rejected);
        assert_eq!(outcome.reason, Reason::ChainTransactionNotFound);

        let outcome = engine(Err(BackendError::Unconfirmed {
            confirmations: 1,
            required: 6,
        }))
        .verify(&requirement(), &Proof::on_chain(TX, "base"))
        .await
        .unwrap();
        assert_eq!(outcome.status, VerificationStatus::BackendUnavailable);
        assert_eq!(outcome.retry_after_secs, Some(10));
    }

    #[tokio::test]
    async fn test_policy_rejection_does_not_consume() {
        let engine = engine(Ok(transfer(5_000)));
        let outcome = engine
            .verify(&requirement(), &Proof::on_chain(TX, "base"))
            .await
            .unwrap();
        assert_eq!(outcome.reason, Reason::Underpayment);
        assert!(!engine.replay.is_consumed(&format!("base:{TX}")).unwrap());
    }

    #[test]
    fn test_cached_rejection_keeps_reason() {
        let cached = VerificationOutcome::failed(Reason::WrongRecipient, Backend::Chain, 40);
        let served = served_from_cache(cached, 0);
        assert_eq!(served.reason, Reason::WrongRecipient);
        assert_eq!(served.backend_used, Backend::Cache);
        assert_eq!(served.latency_ms, 0);
    }
}
