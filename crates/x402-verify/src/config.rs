use std::time::Duration;

use url::Url;

use crate::amount::UsdAmount;
use crate::cache::{DEFAULT_TTL, DEFAULT_UNAVAILABLE_TTL};
use crate::chain::{ChainFamily, ChainRegistry};
use crate::engine::EngineConfig;
use crate::policy::{PolicyConfig, DEFAULT_MAX_PAYMENT_AGE, DEFAULT_MIN_PAYMENT};

pub const DEFAULT_FACILITATOR_URL: &str = "https://facilitator.payai.network";
pub const DEFAULT_DB_PATH: &str = "./x402-verify.db";
pub const DEFAULT_FACILITATOR_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CHAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the engine and its backends need, loaded once at startup.
#[derive(Clone)]
pub struct VerifierConfig {
    /// Address every payment must reach
    pub merchant_address: String,
    pub facilitator_url: String,
    pub facilitator_enabled: bool,
    /// HMAC secret for `X-Facilitator-Auth` (None = unsigned requests)
    pub facilitator_secret: Option<Vec<u8>>,
    /// Race facilitator and chain when a request carries both proofs
    pub unified_fallback: bool,
    pub policy: PolicyConfig,
    pub facilitator_timeout: Duration,
    pub chain_timeout: Duration,
    pub cache_ttl: Duration,
    pub unavailable_cache_ttl: Duration,
    /// SQLite file for consumed proofs and verification attempts
    pub db_path: String,
    pub chains: ChainRegistry,
}

impl std::fmt::Debug for VerifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierConfig")
            .field("merchant_address", &self.merchant_address)
            .field("facilitator_url", &self.facilitator_url)
            .field("facilitator_enabled", &self.facilitator_enabled)
            .field(
                "facilitator_secret",
                &self.facilitator_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("unified_fallback", &self.unified_fallback)
            .field("policy", &self.policy)
            .field("facilitator_timeout", &self.facilitator_timeout)
            .field("chain_timeout", &self.chain_timeout)
            .field("cache_ttl", &self.cache_ttl)
            .field("unavailable_cache_ttl", &self.unavailable_cache_ttl)
            .field("db_path", &self.db_path)
            .field("chains", &self.chains.ids().collect::<Vec<_>>())
            .finish()
    }
}

impl VerifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let merchant_address = get("X402_MERCHANT_ADDRESS")
            .ok_or(ConfigError::MissingRequired("X402_MERCHANT_ADDRESS"))?;

        let facilitator_url =
            get("X402_FACILITATOR_URL").unwrap_or_else(|| DEFAULT_FACILITATOR_URL.to_string());
        Url::parse(&facilitator_url).map_err(|_| ConfigError::InvalidUrl(facilitator_url.clone()))?;

        let facilitator_enabled = parse_bool(&get, "X402_FACILITATOR_ENABLED", true)?;
        let unified_fallback = parse_bool(&get, "X402_UNIFIED_FALLBACK", false)?;

        let facilitator_secret = get("FACILITATOR_SHARED_SECRET").map(String::into_bytes);
        if let Some(ref secret) = facilitator_secret {
            if secret.len() < 32 {
                tracing::warn!(
                    "FACILITATOR_SHARED_SECRET is too short ({} bytes, minimum 32)",
                    secret.len()
                );
            }
        }

        let min_payment = match get("X402_MIN_PAYMENT_USD") {
            Some(raw) => UsdAmount::parse(&raw)
                .map_err(|e| ConfigError::InvalidValue("X402_MIN_PAYMENT_USD", e.to_string()))?,
            None => DEFAULT_MIN_PAYMENT,
        };
        let max_payment_age = parse_duration(
            &get,
            "X402_MAX_PAYMENT_AGE_SECS",
            DEFAULT_MAX_PAYMENT_AGE,
            Duration::from_secs,
        )?;
        let facilitator_timeout = parse_duration(
            &get,
            "X402_FACILITATOR_TIMEOUT_MS",
            DEFAULT_FACILITATOR_TIMEOUT,
            Duration::from_millis,
        )?;
        let chain_timeout = parse_duration(
            &get,
            "X402_CHAIN_TIMEOUT_MS",
            DEFAULT_CHAIN_TIMEOUT,
            Duration::from_millis,
        )?;
        let cache_ttl =
            parse_duration(&get, "X402_CACHE_TTL_SECS", DEFAULT_TTL, Duration::from_secs)?;
        let unavailable_cache_ttl = parse_duration(
            &get,
            "X402_UNAVAILABLE_CACHE_TTL_SECS",
            DEFAULT_UNAVAILABLE_TTL,
            Duration::from_secs,
        )?;

        let db_path = get("X402_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let mut chains = ChainRegistry::with_defaults();
        let ids: Vec<String> = chains.ids().map(String::from).collect();
        for id in ids {
            let upper = id.to_ascii_uppercase();
            let rpc_key = format!("X402_{upper}_RPC_URL");
            if let Some(rpc_url) = get(&rpc_key) {
                Url::parse(&rpc_url).map_err(|_| ConfigError::InvalidUrl(rpc_url.clone()))?;
                chains.set_rpc_url(&id, rpc_url);
            }
            let conf_key = format!("X402_{upper}_CONFIRMATIONS");
            if let Some(raw) = get(&conf_key) {
                let confirmations = raw
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidNumber(conf_key.clone(), raw))?;
                chains.set_required_confirmations(&id, confirmations);
            }
            let address_key = format!("X402_{upper}_PAYMENT_ADDRESS");
            if let Some(address) = get(&address_key) {
                let family = chains.get(&id).map(|chain| chain.family);
                if family != Some(ChainFamily::of_address(&address)) {
                    return Err(ConfigError::InvalidAddress(address_key, address));
                }
                chains.set_payment_address(&id, address);
            }
        }

        let unpaid: Vec<&str> = chains
            .iter()
            .filter(|chain| chain.recipient(&merchant_address).is_none())
            .map(|chain| chain.id.as_str())
            .collect();
        if !unpaid.is_empty() {
            tracing::warn!(
                chains = ?unpaid,
                "no payment address for these chains; they will not be offered"
            );
        }

        if !facilitator_enabled && !unified_fallback {
            tracing::warn!(
                "facilitator disabled and unified fallback off: X-PAYMENT proofs will be refused"
            );
        }

        Ok(Self {
            merchant_address,
            facilitator_url,
            facilitator_enabled,
            facilitator_secret,
            unified_fallback,
            policy: PolicyConfig {
                min_payment,
                max_payment_age,
            },
            facilitator_timeout,
            chain_timeout,
            cache_ttl,
            unavailable_cache_ttl,
            db_path,
            chains,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy: self.policy.clone(),
            facilitator_timeout: self.facilitator_timeout,
            chain_timeout: self.chain_timeout,
            cache_ttl: self.cache_ttl,
            unavailable_cache_ttl: self.unavailable_cache_ttl,
            unified_fallback: self.unified_fallback,
        }
    }
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(key, v)),
    }
}

fn parse_duration<G>(
    get: &G,
    key: &'static str,
    default: Duration,
    unit: fn(u64) -> Duration,
) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u64>()
            .map(unit)
            .map_err(|_| ConfigError::InvalidNumber(key.to_string(), raw)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid number for {0}: {1}")]
    InvalidNumber(String, String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("{0} is not an address on that chain: {1}")]
    InvalidAddress(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            VerifierConfig::from_lookup(lookup(&[("X402_MERCHANT_ADDRESS", "0xabc")])).unwrap();
        assert_eq!(config.merchant_address, "0xabc");
        assert_eq!(config.facilitator_url, DEFAULT_FACILITATOR_URL);
        assert!(config.facilitator_enabled);
        assert!(!config.unified_fallback);
        assert_eq!(config.policy.min_payment, UsdAmount::from_cents(10));
        assert_eq!(config.policy.max_payment_age, Duration::from_secs(604_800));
        assert_eq!(config.facilitator_timeout, Duration::from_secs(2));
        assert_eq!(config.chain_timeout, Duration::from_secs(5));
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.chains.get("ethereum").unwrap().required_confirmations, 12);
    }

    #[test]
    fn test_merchant_required() {
        assert!(matches!(
            VerifierConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingRequired("X402_MERCHANT_ADDRESS"))
        ));
        assert!(VerifierConfig::from_lookup(lookup(&[("X402_MERCHANT_ADDRESS", "  ")])).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = VerifierConfig::from_lookup(lookup(&[
            ("X402_MERCHANT_ADDRESS", "0xabc"),
            ("X402_FACILITATOR_ENABLED", "false"),
            ("X402_UNIFIED_FALLBACK", "1"),
            ("X402_MIN_PAYMENT_USD", "$0.01"),
            ("X402_MAX_PAYMENT_AGE_SECS", "3600"),
            ("X402_CHAIN_TIMEOUT_MS", "250"),
            ("X402_BASE_RPC_URL", "http://localhost:8545"),
            ("X402_SOLANA_CONFIRMATIONS", "1"),
        ]))
        .unwrap();
        assert!(!config.facilitator_enabled);
        assert!(config.unified_fallback);
        assert_eq!(config.policy.min_payment, UsdAmount::parse("0.01").unwrap());
        assert_eq!(config.policy.max_payment_age, Duration::from_secs(3600));
        assert_eq!(config.chain_timeout, Duration::from_millis(250));
        assert_eq!(config.chains.get("base").unwrap().rpc_url, "http://localhost:8545");
        assert_eq!(config.chains.get("solana").unwrap().required_confirmations, 1);

        let engine = config.engine_config();
        assert!(engine.unified_fallback);
        assert_eq!(engine.chain_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_per_chain_payment_address() {
        let sol_wallet = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
        let config = VerifierConfig::from_lookup(lookup(&[
            ("X402_MERCHANT_ADDRESS", "0x2222222222222222222222222222222222222222"),
            ("X402_SOLANA_PAYMENT_ADDRESS", sol_wallet),
        ]))
        .unwrap();
        let solana = config.chains.get("solana").unwrap();
        assert_eq!(solana.payment_address.as_deref(), Some(sol_wallet));
        assert!(config.chains.get("base").unwrap().payment_address.is_none());

        let err = VerifierConfig::from_lookup(lookup(&[
            ("X402_MERCHANT_ADDRESS", "0x2222222222222222222222222222222222222222"),
            ("X402_SOLANA_PAYMENT_ADDRESS", "0x3333333333333333333333333333333333333333"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidAddress(key, _) if key == "X402_SOLANA_PAYMENT_ADDRESS"
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = ("X402_MERCHANT_ADDRESS", "0xabc");
        assert!(matches!(
            VerifierConfig::from_lookup(lookup(&[base, ("X402_FACILITATOR_URL", "not a url")])),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            VerifierConfig::from_lookup(lookup(&[base, ("X402_UNIFIED_FALLBACK", "maybe")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            VerifierConfig::from_lookup(lookup(&[base, ("X402_CACHE_TTL_SECS", "-1")])),
            Err(ConfigError::InvalidNumber(..))
        ));
        assert!(
            VerifierConfig::from_lookup(lookup(&[base, ("X402_MIN_PAYMENT_USD", "ten")])).is_err()
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = VerifierConfig::from_lookup(lookup(&[
            ("X402_MERCHANT_ADDRESS", "0xabc"),
            ("FACILITATOR_SHARED_SECRET", "super-secret-value-that-is-long-enough"),
        ]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret"));
    }
}
