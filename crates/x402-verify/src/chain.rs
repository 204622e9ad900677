use std::collections::BTreeMap;

use crate::payment::is_hex_string;

/// Chain identifier for Base mainnet.
pub const BASE: &str = "base";
pub const ETHEREUM: &str = "ethereum";
pub const POLYGON: &str = "polygon";
pub const SOLANA: &str = "solana";

/// USDC on Base.
pub const BASE_USDC: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";
/// USDC on Ethereum mainnet.
pub const ETHEREUM_USDC: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
/// Native USDC on Polygon PoS.
pub const POLYGON_USDC: &str = "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359";
/// USDC mint on Solana.
pub const SOLANA_USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// USDC has 6 decimal places on every supported chain.
pub const USDC_DECIMALS: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    Evm,
    Solana,
}

impl ChainFamily {
    /// Family an address belongs to: `0x` hex is EVM, anything else Solana.
    pub fn of_address(address: &str) -> Self {
        if is_hex_string(address.trim()) {
            ChainFamily::Evm
        } else {
            ChainFamily::Solana
        }
    }
}

/// Runtime configuration for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub id: String,
    pub family: ChainFamily,
    pub rpc_url: String,
    pub token_symbol: String,
    pub token_address: String,
    pub token_decimals: u8,
    pub required_confirmations: u64,
    /// Recipient on this chain; unset means the merchant address.
    pub payment_address: Option<String>,
}

impl ChainConfig {
    fn usdc(
        id: &str,
        family: ChainFamily,
        rpc_url: &str,
        token_address: &str,
        required_confirmations: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            family,
            rpc_url: rpc_url.to_string(),
            token_symbol: "USDC".to_string(),
            token_address: token_address.to_string(),
            token_decimals: USDC_DECIMALS,
            required_confirmations,
            payment_address: None,
        }
    }

    /// Where payments on this chain go, or `None` when the merchant address
    /// belongs to another chain family and no override is configured.
    pub fn recipient<'a>(&'a self, merchant: &'a str) -> Option<&'a str> {
        match &self.payment_address {
            Some(address) => Some(address),
            None if ChainFamily::of_address(merchant) == self.family => Some(merchant),
            None => None,
        }
    }
}

/// Read-only map of chain id to [`ChainConfig`], loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<String, ChainConfig>,
}

impl ChainRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Base, Ethereum, Polygon and Solana with their USDC deployments.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.insert(ChainConfig::usdc(
            BASE,
            ChainFamily::Evm,
            "https://mainnet.base.org",
            BASE_USDC,
            6,
        ));
        registry.insert(ChainConfig::usdc(
            ETHEREUM,
            ChainFamily::Evm,
            "https://eth.llamarpc.com",
            ETHEREUM_USDC,
            12,
        ));
        registry.insert(ChainConfig::usdc(
            POLYGON,
            ChainFamily::Evm,
            "https://polygon-rpc.com",
            POLYGON_USDC,
            12,
        ));
        registry.insert(ChainConfig::usdc(
            SOLANA,
            ChainFamily::Solana,
            "https://api.mainnet-beta.solana.com",
            SOLANA_USDC_MINT,
            32,
        ));
        registry
    }

    pub fn insert(&mut self, config: ChainConfig) {
        self.chains.insert(config.id.to_ascii_lowercase(), config);
    }

    /// Case-insensitive lookup.
    pub fn get(&self, id: &str) -> Option<&ChainConfig> {
        self.chains.get(&id.trim().to_ascii_lowercase())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.values()
    }

    /// Returns `false` if `id` is not registered.
    pub fn set_rpc_url(&mut self, id: &str, rpc_url: impl Into<String>) -> bool {
        match self.chains.get_mut(&id.to_ascii_lowercase()) {
            Some(chain) => {
                chain.rpc_url = rpc_url.into();
                true
            }
            None => false,
        }
    }

    /// Returns `false` if `id` is not registered.
    pub fn set_payment_address(&mut self, id: &str, address: impl Into<String>) -> bool {
        match self.chains.get_mut(&id.to_ascii_lowercase()) {
            Some(chain) => {
                chain.payment_address = Some(address.into());
                true
            }
            None => false,
        }
    }

    pub fn set_required_confirmations(&mut self, id: &str, confirmations: u64) -> bool {
        match self.chains.get_mut(&id.to_ascii_lowercase()) {
            Some(chain) => {
                chain.required_confirmations = confirmations;
                true
            }
            None => false,
        }
    }
}
