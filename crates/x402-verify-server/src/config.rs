use x402_verify::{ConfigError, VerifierConfig};

use crate::pricing::{PriceTable, DEFAULT_ENDPOINT_PRICES};

pub const DEFAULT_PORT: u16 = 4021;
pub const DEFAULT_RATE_LIMIT_RPM: u64 = 60;

/// HTTP-side settings plus the verifier configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_rpm: u64,
    /// Empty means localhost only.
    pub allowed_origins: Vec<String>,
    /// Bearer token for `/metrics`
    pub metrics_token: Option<String>,
    /// Serve `/metrics` without a token when none is configured.
    pub public_metrics: bool,
    pub prices: PriceTable,
    pub verifier: VerifierConfig,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("allowed_origins", &self.allowed_origins)
            .field("metrics_token", &self.metrics_token.as_ref().map(|_| "[REDACTED]"))
            .field("public_metrics", &self.public_metrics)
            .field("prices", &self.prices)
            .field("verifier", &self.verifier)
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("PORT".to_string(), raw))?,
            None => DEFAULT_PORT,
        };
        let rate_limit_rpm = match get("RATE_LIMIT_RPM") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(rpm) if rpm > 0 => rpm,
                _ => return Err(ConfigError::InvalidNumber("RATE_LIMIT_RPM".to_string(), raw)),
            },
            None => DEFAULT_RATE_LIMIT_RPM,
        };

        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let metrics_token = get("METRICS_TOKEN");
        let public_metrics = get("X402_PUBLIC_METRICS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let prices = PriceTable::parse(
            get("X402_ENDPOINT_PRICES")
                .as_deref()
                .unwrap_or(DEFAULT_ENDPOINT_PRICES),
        )?;
        if prices.is_empty() {
            tracing::warn!("no priced endpoints configured; every /api path will return 404");
        }

        let verifier = VerifierConfig::from_lookup(&lookup)?;

        Ok(Self {
            port,
            rate_limit_rpm,
            allowed_origins,
            metrics_token,
            public_metrics,
            prices,
            verifier,
        })
    }
}
