//! Direct on-chain verification.
//!
//! One adapter per registered chain, selected by chain id at call time. All
//! adapters are read-only: they hold no keys and submit nothing.

pub mod evm;
pub mod solana;

use std::collections::HashMap;

use crate::backend::{BackendError, ChainBackend};
use crate::chain::{ChainFamily, ChainRegistry};
use crate::http_client::RetryPolicy;
use crate::payment::NormalizedTransfer;
use crate::VerifyError;

pub use evm::EvmReader;
pub use solana::SolanaReader;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

pub enum ChainAdapter {
    Evm(EvmReader),
    Solana(SolanaReader),
}

impl ChainAdapter {
    pub fn family(&self) -> ChainFamily {
        match self {
            ChainAdapter::Evm(_) => ChainFamily::Evm,
            ChainAdapter::Solana(_) => ChainFamily::Solana,
        }
    }

    async fn fetch_transfer(
        &self,
        tx_hash: &str,
        pay_to: &str,
    ) -> Result<NormalizedTransfer, BackendError> {
        match self {
            ChainAdapter::Evm(reader) => reader.fetch_transfer(tx_hash, pay_to).await,
            ChainAdapter::Solana(reader) => reader.fetch_transfer(tx_hash, pay_to).await,
        }
    }
}

/// Dispatches `fetch_transfer` to the adapter registered for a chain id.
pub struct ChainReader {
    adapters: HashMap<String, ChainAdapter>,
}

impl ChainReader {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// One adapter per chain in `registry`. Solana adapters share `http`.
    pub fn from_registry(
        registry: &ChainRegistry,
        http: reqwest::Client,
        retry: RetryPolicy,
    ) -> Result<Self, VerifyError> {
        let mut reader = Self::empty();
        for chain in registry.iter() {
            let adapter = match chain.family {
                ChainFamily::Evm => ChainAdapter::Evm(EvmReader::new(chain.clone())?),
                ChainFamily::Solana => ChainAdapter::Solana(
                    SolanaReader::new(chain.clone(), http.clone()).with_retry(retry),
                ),
            };
            reader.insert(&chain.id, adapter);
        }
        Ok(reader)
    }

    pub fn insert(&mut self, chain: &str, adapter: ChainAdapter) {
        self.adapters.insert(chain.to_ascii_lowercase(), adapter);
    }

    pub fn supports(&self, chain: &str) -> bool {
        self.adapters.contains_key(&chain.trim().to_ascii_lowercase())
    }

    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl ChainBackend for ChainReader {
    async fn fetch_transfer(
        &self,
        chain: &str,
        tx_hash: &str,
        pay_to: &str,
    ) -> Result<NormalizedTransfer, BackendError> {
        let adapter = self
            .adapters
            .get(&chain.trim().to_ascii_lowercase())
            .ok_or_else(|| BackendError::UnsupportedChain(chain.to_string()))?;
        validate_tx_hash(adapter.family(), tx_hash)?;
        adapter.fetch_transfer(tx_hash.trim(), pay_to).await
    }
}

/// Reject obviously malformed hashes before spending an RPC call on them.
pub fn validate_tx_hash(family: ChainFamily, tx_hash: &str) -> Result<(), BackendError> {
    let tx_hash = tx_hash.trim();
    let valid = match family {
        ChainFamily::Evm => {
            tx_hash.len() == 66
                && (tx_hash.starts_with("0x") || tx_hash.starts_with("0X"))
                && tx_hash[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        ChainFamily::Solana => {
            (64..=88).contains(&tx_hash.len())
                && tx_hash.chars().all(|c| BASE58_ALPHABET.contains(c))
        }
    };
    if valid {
        Ok(())
    } else {
        Err(BackendError::Malformed(format!(
            "not a valid {family:?} transaction id"
        )))
    }
}
