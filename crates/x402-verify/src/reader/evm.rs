use std::str::FromStr;

use alloy::eips::BlockNumberOrTag;
use alloy::network::ReceiptResponse;
use alloy::primitives::{Address, Log, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::sol;
use alloy::sol_types::SolEvent;
use chrono::{DateTime, Utc};

use crate::amount::TokenAmount;
use crate::backend::BackendError;
use crate::chain::ChainConfig;
use crate::payment::{addresses_match, NormalizedTransfer};
use crate::VerifyError;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// ERC-20 `Transfer` decoded from a receipt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// Decode `log` if it is an ERC-20 `Transfer` (ERC-721 transfers index the
/// value as a third topic and are skipped).
pub fn decode_transfer(log: &Log) -> Option<TransferLog> {
    let topics = log.data.topics();
    if topics.len() != 3 || topics[0] != Transfer::SIGNATURE_HASH {
        return None;
    }
    let data = &log.data.data;
    if data.len() < 32 {
        return None;
    }
    Some(TransferLog {
        token: log.address,
        from: Address::from_word(topics[1]),
        to: Address::from_word(topics[2]),
        value: U256::from_be_slice(&data[..32]),
    })
}

/// Pick the transfer a payment proof most plausibly refers to.
///
/// Preference: configured stablecoin to `pay_to`, then any stablecoin
/// transfer, then any transfer at all so the policy can name the precise
/// violation.
pub fn select_transfer(logs: &[Log], stablecoin: &str, pay_to: &str) -> Option<TransferLog> {
    let transfers: Vec<TransferLog> = logs.iter().filter_map(decode_transfer).collect();
    let is_stablecoin = |t: &TransferLog| addresses_match(&t.token.to_string(), stablecoin);

    transfers
        .iter()
        .find(|&t| is_stablecoin(t) && addresses_match(&t.to.to_string(), pay_to))
        .or_else(|| transfers.iter().find(|&t| is_stablecoin(t)))
        .or_else(|| transfers.first())
        .cloned()
}

/// Reads ERC-20 payments from an EVM JSON-RPC node.
pub struct EvmReader {
    provider: RootProvider,
    config: ChainConfig,
}

impl EvmReader {
    pub fn new(config: ChainConfig) -> Result<Self, VerifyError> {
        let url = url::Url::parse(&config.rpc_url).map_err(|e| {
            VerifyError::ConfigError(format!("invalid RPC URL for {}: {e}", config.id))
        })?;
        Ok(Self {
            provider: RootProvider::new_http(url),
            config,
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub async fn fetch_transfer(
        &self,
        tx_hash: &str,
        pay_to: &str,
    ) -> Result<NormalizedTransfer, BackendError> {
        let hash = B256::from_str(tx_hash)
            .map_err(|e| BackendError::Malformed(format!("invalid transaction hash: {e}")))?;

        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.unavailable("eth_getTransactionReceipt", e))?;

        let Some(receipt) = receipt else {
            return Err(self.missing_receipt(hash).await);
        };

        if !receipt.status() {
            return Err(BackendError::Reverted);
        }

        let block_number = receipt.block_number.ok_or(BackendError::Unconfirmed {
            confirmations: 0,
            required: self.config.required_confirmations,
        })?;

        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.unavailable("eth_blockNumber", e))?;
        let confirmations = head.saturating_sub(block_number);
        if confirmations < self.config.required_confirmations {
            return Err(BackendError::Unconfirmed {
                confirmations,
                required: self.config.required_confirmations,
            });
        }

        let logs: Vec<Log> = receipt
            .inner
            .logs()
            .iter()
            .map(|log| log.inner.clone())
            .collect();
        let transfer = select_transfer(&logs, &self.config.token_address, pay_to)
            .ok_or(BackendError::NoTransfer)?;

        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .map_err(|e| self.unavailable("eth_getBlockByNumber", e))?
            .ok_or_else(|| {
                BackendError::Unavailable(format!("block {block_number} not served by node"))
            })?;
        let timestamp = i64::try_from(block.header.timestamp)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| BackendError::Unavailable("block timestamp out of range".into()))?;

        tracing::debug!(
            chain = %self.config.id,
            tx = %tx_hash,
            block = block_number,
            confirmations,
            token = %transfer.token,
            "decoded EVM transfer"
        );

        Ok(NormalizedTransfer {
            from_address: transfer.from.to_string(),
            to_address: transfer.to.to_string(),
            amount: TokenAmount::new(transfer.value, self.config.token_decimals),
            token: transfer.token.to_string(),
            chain: self.config.id.clone(),
            timestamp,
            tx_hash: tx_hash.to_string(),
            confirmations,
        })
    }

    /// No receipt: pending in the mempool is "not yet", unknown is "not found".
    async fn missing_receipt(&self, hash: B256) -> BackendError {
        match self.provider.get_transaction_by_hash(hash).await {
            Ok(Some(_)) => BackendError::Unconfirmed {
                confirmations: 0,
                required: self.config.required_confirmations,
            },
            Ok(None) => BackendError::NotFound,
            Err(e) => self.unavailable("eth_getTransactionByHash", e),
        }
    }

    fn unavailable(&self, method: &str, error: impl std::fmt::Display) -> BackendError {
        tracing::warn!(chain = %self.config.id, method, error = %error, "RPC call failed");
        BackendError::Unavailable(format!("{method} failed"))
    }
}
