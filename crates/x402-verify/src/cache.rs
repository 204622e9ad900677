//! Short-lived memoization of verification outcomes.
//!
//! Keyed by a fingerprint of the proof and the requirement it was checked
//! against, so a client retrying with the same header is answered without
//! another facilitator or RPC round-trip. Eviction is by TTL only; expired
//! entries are swept every [`PURGE_EVERY`] inserts so distinct junk proofs
//! cannot grow the map without bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::hmac::hex;
use crate::metrics;
use crate::outcome::{VerificationOutcome, VerificationStatus};
use crate::payment::{idempotency_key, is_hex_string, PaymentRequirement, Proof};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_UNAVAILABLE_TTL: Duration = Duration::from_secs(5);
pub const PURGE_EVERY: u64 = 256;

#[derive(Debug, Clone)]
struct CacheEntry {
    outcome: VerificationOutcome,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct VerificationCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    unavailable_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl Default for VerificationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_UNAVAILABLE_TTL)
    }
}

impl VerificationCache {
    /// `ttl` applies to verdicts; `unavailable_ttl` to `BackendUnavailable`
    /// outcomes so an outage does not outlive itself in the cache.
    pub fn new(ttl: Duration, unavailable_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            unavailable_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<VerificationOutcome> {
        self.get_at(fingerprint, Instant::now())
    }

    fn get_at(&self, fingerprint: &str, now: Instant) -> Option<VerificationOutcome> {
        // The read guard must be dropped before remove_if touches the same shard.
        let hit = self
            .entries
            .get(fingerprint)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.outcome.clone());

        if hit.is_none() {
            self.entries
                .remove_if(fingerprint, |_, entry| entry.expires_at <= now);
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
        }
        hit
    }

    pub fn insert(&self, fingerprint: String, outcome: VerificationOutcome) {
        self.insert_at(fingerprint, outcome, Instant::now());
    }

    fn insert_at(&self, fingerprint: String, outcome: VerificationOutcome, now: Instant) {
        let ttl = match outcome.status {
            VerificationStatus::BackendUnavailable => self.unavailable_ttl,
            _ => self.ttl,
        };
        if ttl.is_zero() {
            return;
        }
        self.entries.insert(
            fingerprint,
            CacheEntry {
                outcome,
                expires_at: now + ttl,
            },
        );

        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            let purged = self.purge_expired_at(now);
            if purged > 0 {
                tracing::debug!(
                    purged,
                    remaining = self.entries.len(),
                    "swept expired cache entries"
                );
            }
        }
    }

    /// Drop expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

/// Stable SHA-256 fingerprint of a proof as checked against a requirement.
///
/// Two byte-identical submissions against the same requirement always share a
/// fingerprint; the same proof against a different price or merchant never does.
pub fn fingerprint(requirement: &PaymentRequirement, proof: &Proof) -> String {
    let mut hasher = Sha256::new();

    hasher.update(b"req\0");
    hasher.update(requirement.price.micros().to_be_bytes());
    hasher.update(normalize_address(&requirement.merchant_address).as_bytes());
    for option in &requirement.payment_options {
        hasher.update(b"\0opt\0");
        hasher.update(option.network.to_ascii_lowercase().as_bytes());
        hasher.update(b"\0");
        hasher.update(normalize_address(&option.token_address).as_bytes());
        if let Some(pay_to) = &option.pay_to {
            hasher.update(b"\0to\0");
            hasher.update(normalize_address(pay_to).as_bytes());
        }
    }

    match proof {
        Proof::Facilitator(p) => {
            hasher.update(b"\0facilitator\0");
            hasher.update(p.token.trim().as_bytes());
        }
        Proof::OnChain(p) => {
            hasher.update(b"\0onchain\0");
            hasher.update(idempotency_key(&p.chain, &p.tx_hash).as_bytes());
        }
    }

    hex::encode(hasher.finalize())
}

fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if is_hex_string(address) {
        address.to_ascii_lowercase()
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::UsdAmount;
    use crate::outcome::{Backend, Reason};
    use crate::payment::PaymentOption;

    fn requirement(price: &str) -> PaymentRequirement {
        PaymentRequirement {
            price: UsdAmount::parse(price).unwrap(),
            merchant_address: "0xABCD".to_string(),
            payment_options: vec![PaymentOption {
                network: "base".to_string(),
                token_symbol: "USDC".to_string(),
                token_address: crate::chain::BASE_USDC.to_string(),
                pay_to: None,
            }],
            resource: None,
            description: None,
        }
    }

    fn rejected() -> VerificationOutcome {
        VerificationOutcome::failed(Reason::Underpayment, Backend::Chain, 12)
    }

    #[test]
    fn test_fingerprint_is_stable_and_normalized() {
        let req = requirement("0.01");
        let a = fingerprint(&req, &Proof::on_chain("0xABC123", "Base"));
        let b = fingerprint(&req, &Proof::on_chain("0xabc123", "base"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_scoped_by_requirement() {
        let proof = Proof::on_chain("0xabc", "base");
        assert_ne!(
            fingerprint(&requirement("0.01"), &proof),
            fingerprint(&requirement("0.02"), &proof)
        );

        let mut redirected = requirement("0.01");
        redirected.payment_options[0].pay_to = Some("0xBEEF".to_string());
        assert_ne!(
            fingerprint(&requirement("0.01"), &proof),
            fingerprint(&redirected, &proof)
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_proof_kind() {
        let req = requirement("0.01");
        assert_ne!(
            fingerprint(&req, &Proof::facilitator("0xabc")),
            fingerprint(&req, &Proof::on_chain("0xabc", "base"))
        );
    }

    #[test]
    fn test_hit_and_miss_counted() {
        let cache = VerificationCache::default();
        assert!(cache.get("fp").is_none());
        cache.insert("fp".to_string(), rejected());
        assert_eq!(cache.get("fp"), Some(rejected()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_entries_expire() {
        let cache = VerificationCache::new(Duration::from_secs(60), Duration::from_secs(5));
        let start = Instant::now();
        cache.insert_at("fp".to_string(), rejected(), start);

        assert!(cache.get_at("fp", start + Duration::from_secs(59)).is_some());
        assert!(cache.get_at("fp", start + Duration::from_secs(61)).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_unavailable_uses_short_ttl() {
        let cache = VerificationCache::new(Duration::from_secs(3600), Duration::from_secs(5));
        let start = Instant::now();
        let unavailable =
            VerificationOutcome::failed(Reason::ChainRpcTimeout, Backend::Chain, 5000);
        cache.insert_at("fp".to_string(), unavailable, start);

        assert!(cache.get_at("fp", start + Duration::from_secs(4)).is_some());
        assert!(cache.get_at("fp", start + Duration::from_secs(6)).is_none());
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let cache = VerificationCache::new(Duration::from_secs(3600), Duration::ZERO);
        cache.insert(
            "fp".to_string(),
            VerificationOutcome::failed(Reason::FacilitatorUnreachable, Backend::Facilitator, 1),
        );
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache = VerificationCache::new(Duration::from_secs(10), Duration::from_secs(1));
        let start = Instant::now();
        cache.insert_at("a".to_string(), rejected(), start);
        cache.insert_at(
            "b".to_string(),
            VerificationOutcome::failed(Reason::ChainNodeUnavailable, Backend::Chain, 1),
            start,
        );
        assert_eq!(cache.purge_expired_at(start + Duration::from_secs(2)), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_inserts_sweep_expired_entries() {
        let cache = VerificationCache::new(Duration::from_secs(10), Duration::from_secs(1));
        let start = Instant::now();
        cache.insert_at("stale".to_string(), rejected(), start);

        let later = start + Duration::from_secs(11);
        for i in 1..PURGE_EVERY {
            cache.insert_at(format!("fresh-{i}"), rejected(), later);
        }

        // Never read back, yet gone.
        assert!(!cache.entries.contains_key("stale"));
        assert_eq!(cache.stats().entries, (PURGE_EVERY - 1) as usize);
        assert_eq!(cache.stats().misses, 0);
    }
}
