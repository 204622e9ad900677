use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::amount::TokenAmount;
use crate::backend::BackendError;
use crate::chain::ChainConfig;
use crate::http_client::{send_with_retry, RetryPolicy};
use crate::payment::NormalizedTransfer;

const TOKEN_PROGRAMS: [&str; 2] = ["spl-token", "spl-token-2022"];

/// Reads SPL token payments over Solana JSON-RPC (`jsonParsed` encoding).
pub struct SolanaReader {
    http: reqwest::Client,
    config: ChainConfig,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl SolanaReader {
    pub fn new(config: ChainConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            config,
            retry: RetryPolicy::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn fetch_transfer(
        &self,
        signature: &str,
        pay_to: &str,
    ) -> Result<NormalizedTransfer, BackendError> {
        let tx = self
            .rpc(
                "getTransaction",
                json!([
                    signature,
                    {
                        "encoding": "jsonParsed",
                        "commitment": "confirmed",
                        "maxSupportedTransactionVersion": 0
                    }
                ]),
            )
            .await?;
        if tx.is_null() {
            return Err(self.missing_transaction(signature).await);
        }

        let head = self
            .rpc("getSlot", json!([{ "commitment": "confirmed" }]))
            .await?
            .as_u64()
            .ok_or_else(|| BackendError::Unavailable("getSlot returned no slot".into()))?;

        let transfer = parse_transaction(&tx, signature, &self.config, pay_to, head)?;
        tracing::debug!(
            chain = %self.config.id,
            tx = %signature,
            confirmations = transfer.confirmations,
            mint = %transfer.token,
            "decoded SPL transfer"
        );
        Ok(transfer)
    }

    /// `getTransaction` only sees confirmed transactions. A signature the
    /// cluster already knows at `processed` is pending, not missing.
    async fn missing_transaction(&self, signature: &str) -> BackendError {
        let statuses = match self
            .rpc(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
            )
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => return e,
        };
        match statuses.pointer("/value/0").filter(|s| !s.is_null()) {
            None => BackendError::NotFound,
            Some(status) if status.get("err").is_some_and(|e| !e.is_null()) => {
                BackendError::Reverted
            }
            Some(status) => {
                let confirmations = status
                    .get("confirmations")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tracing::debug!(
                    chain = %self.config.id,
                    tx = %signature,
                    confirmations,
                    "transaction known but not yet confirmed"
                );
                BackendError::Unconfirmed {
                    confirmations,
                    required: self.config.required_confirmations,
                }
            }
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let resp = send_with_retry(&self.retry, || {
            self.http.post(&self.config.rpc_url).json(&body)
        })
        .await
        .map_err(|e| {
            tracing::warn!(chain = %self.config.id, method, error = %e, "RPC call failed");
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Unavailable(format!("{method} failed"))
            }
        })?;

        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "{method} returned HTTP {}",
                resp.status()
            )));
        }

        let mut reply: Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{method} reply unparseable: {e}")))?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            tracing::warn!(chain = %self.config.id, method, error = %error, "RPC error");
            return Err(BackendError::Unavailable(format!("{method} returned an error")));
        }
        Ok(reply.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone)]
struct TokenAccount {
    mint: Option<String>,
    owner: Option<String>,
    decimals: Option<u8>,
}

#[derive(Debug, Clone)]
struct SplTransfer {
    from: String,
    to: String,
    mint: Option<String>,
    amount: U256,
    decimals: Option<u8>,
}

/// Decode a `getTransaction` (`jsonParsed`) result into a transfer.
///
/// `head` is the current confirmed slot.
pub fn parse_transaction(
    tx: &Value,
    signature: &str,
    config: &ChainConfig,
    pay_to: &str,
    head: u64,
) -> Result<NormalizedTransfer, BackendError> {
    let meta = tx
        .get("meta")
        .filter(|m| !m.is_null())
        .ok_or_else(|| BackendError::Unavailable("transaction has no meta".into()))?;
    if meta.get("err").is_some_and(|e| !e.is_null()) {
        return Err(BackendError::Reverted);
    }

    let block_time = tx
        .get("blockTime")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| BackendError::Unavailable("transaction has no blockTime".into()))?;

    let slot = tx.get("slot").and_then(Value::as_u64).unwrap_or(head);
    let confirmations = head.saturating_sub(slot);
    if confirmations < config.required_confirmations {
        return Err(BackendError::Unconfirmed {
            confirmations,
            required: config.required_confirmations,
        });
    }

    let accounts = token_accounts(tx, meta);
    let transfers: Vec<SplTransfer> = instructions(tx, meta)
        .filter_map(|ix| decode_instruction(ix, &accounts, pay_to))
        .collect();

    let is_stablecoin = |t: &SplTransfer| t.mint.as_deref() == Some(config.token_address.as_str());
    let selected = transfers
        .iter()
        .find(|&t| is_stablecoin(t) && t.to == pay_to)
        .or_else(|| transfers.iter().find(|&t| is_stablecoin(t)))
        .or_else(|| transfers.first())
        .ok_or(BackendError::NoTransfer)?;

    Ok(NormalizedTransfer {
        from_address: selected.from.clone(),
        to_address: selected.to.clone(),
        amount: TokenAmount::new(
            selected.amount,
            selected.decimals.unwrap_or(config.token_decimals),
        ),
        token: selected.mint.clone().unwrap_or_default(),
        chain: config.id.clone(),
        timestamp: block_time,
        tx_hash: signature.to_string(),
        confirmations,
    })
}

/// Top-level instructions followed by inner (CPI) instructions.
fn instructions<'a>(tx: &'a Value, meta: &'a Value) -> impl Iterator<Item = &'a Value> {
    let outer = tx
        .pointer("/transaction/message/instructions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();
    let inner = meta
        .get("innerInstructions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|group| group.get("instructions").and_then(Value::as_array))
        .flatten();
    outer.chain(inner)
}

/// Token account address -> mint/owner, from `meta.postTokenBalances`.
fn token_accounts(tx: &Value, meta: &Value) -> HashMap<String, TokenAccount> {
    let keys: Vec<&str> = tx
        .pointer("/transaction/message/accountKeys")
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .map(|k| {
                    k.as_str()
                        .or_else(|| k.get("pubkey").and_then(Value::as_str))
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();

    let mut accounts = HashMap::new();
    let balances = meta
        .get("postTokenBalances")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();
    for balance in balances {
        let Some(address) = balance
            .get("accountIndex")
            .and_then(Value::as_u64)
            .and_then(|i| keys.get(i as usize))
        else {
            continue;
        };
        accounts.insert(
            address.to_string(),
            TokenAccount {
                mint: balance.get("mint").and_then(Value::as_str).map(String::from),
                owner: balance.get("owner").and_then(Value::as_str).map(String::from),
                decimals: balance
                    .pointer("/uiTokenAmount/decimals")
                    .and_then(Value::as_u64)
                    .and_then(|d| u8::try_from(d).ok()),
            },
        );
    }
    accounts
}

fn decode_instruction(
    ix: &Value,
    accounts: &HashMap<String, TokenAccount>,
    pay_to: &str,
) -> Option<SplTransfer> {
    let program = ix.get("program").and_then(Value::as_str)?;
    if !TOKEN_PROGRAMS.contains(&program) {
        return None;
    }
    let parsed = ix.get("parsed")?;
    let kind = parsed.get("type").and_then(Value::as_str)?;
    let info = parsed.get("info")?;

    let (raw_amount, decimals) = match kind {
        "transfer" => (info.get("amount").and_then(Value::as_str)?, None),
        "transferChecked" => (
            info.pointer("/tokenAmount/amount").and_then(Value::as_str)?,
            info.pointer("/tokenAmount/decimals")
                .and_then(Value::as_u64)
                .and_then(|d| u8::try_from(d).ok()),
        ),
        _ => return None,
    };
    let amount = U256::from_str(raw_amount).ok()?;

    let destination = info.get("destination").and_then(Value::as_str)?;
    let account = accounts.get(destination);

    // Pay to the token account itself only if that is what the merchant named.
    let to = if destination == pay_to {
        destination.to_string()
    } else {
        account
            .and_then(|a| a.owner.clone())
            .unwrap_or_else(|| destination.to_string())
    };

    let from = info
        .get("authority")
        .or_else(|| info.get("multisigAuthority"))
        .or_else(|| info.get("source"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mint = info
        .get("mint")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| account.and_then(|a| a.mint.clone()));

    Some(SplTransfer {
        from,
        to,
        mint,
        amount,
        decimals: decimals.or_else(|| account.and_then(|a| a.decimals)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::UsdAmount;
    use crate::chain::{ChainRegistry, SOLANA_USDC_MINT};

    const SIG: &str =
        "5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW";
    const PAYER: &str = "7EYnhQoR9YM3N7UoaKRoA44Uy8JeaZV3qyouov87awMs";
    const PAYER_ATA: &str = "3Lz6rCrXdLybFiuJGJnEjv6Z2XtCh5n4proPGP2aBkA1";
    const MERCHANT: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
    const MERCHANT_ATA: &str = "CEbEcy3L5bZ1CZNqDk5FZ4wYiNjSGuFLyJiyTnYNaTaG";

    fn config() -> ChainConfig {
        ChainRegistry::with_defaults().get("solana").cloned().unwrap()
    }

    fn tx(instruction: Value, err: Value) -> Value {
        json!({
            "slot": 1000,
            "blockTime": 1_700_000_000,
            "meta": {
                "err": err,
                "innerInstructions": [],
                "postTokenBalances": [
                    {
                        "accountIndex": 1,
                        "mint": SOLANA_USDC_MINT,
                        "owner": PAYER,
                        "uiTokenAmount": { "amount": "0", "decimals": 6 }
                    },
                    {
                        "accountIndex": 2,
                        "mint": SOLANA_USDC_MINT,
                        "owner": MERCHANT,
                        "uiTokenAmount": { "amount": "10000", "decimals": 6 }
                    }
                ]
            },
            "transaction": {
                "signatures": [SIG],
                "message": {
                    "accountKeys": [
                        { "pubkey": PAYER, "signer": true, "writable": true },
                        { "pubkey": PAYER_ATA, "signer": false, "writable": true },
                        { "pubkey": MERCHANT_ATA, "signer": false, "writable": true }
                    ],
                    "instructions": [instruction]
                }
            }
        })
    }

    fn transfer_checked(amount: &str) -> Value {
        json!({
            "program": "spl-token",
            "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
            "parsed": {
                "type": "transferChecked",
                "info": {
                    "authority": PAYER,
                    "source": PAYER_ATA,
                    "destination": MERCHANT_ATA,
                    "mint": SOLANA_USDC_MINT,
                    "tokenAmount": { "amount": amount, "decimals": 6, "uiAmountString": "0.01" }
                }
            }
        })
    }

    #[test]
    fn test_transfer_checked_resolves_owner() {
        let t = parse_transaction(
            &tx(transfer_checked("10000"), Value::Null),
            SIG,
            &config(),
            MERCHANT,
            1100,
        )
        .unwrap();
        assert_eq!(t.to_address, MERCHANT);
        assert_eq!(t.from_address, PAYER);
        assert_eq!(t.token, SOLANA_USDC_MINT);
        assert_eq!(t.amount_usd(), UsdAmount::parse("0.01").unwrap());
        assert_eq!(t.confirmations, 100);
        assert_eq!(t.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(t.idempotency_key(), format!("solana:{SIG}"));
    }

    #[test]
    fn test_plain_transfer_takes_mint_from_balances() {
        let ix = json!({
            "program": "spl-token",
            "parsed": {
                "type": "transfer",
                "info": {
                    "authority": PAYER,
                    "source": PAYER_ATA,
                    "destination": MERCHANT_ATA,
                    "amount": "5000"
                }
            }
        });
        let t = parse_transaction(&tx(ix, Value::Null), SIG, &config(), MERCHANT, 1100).unwrap();
        assert_eq!(t.token, SOLANA_USDC_MINT);
        assert_eq!(t.to_address, MERCHANT);
        assert_eq!(t.amount_usd(), UsdAmount::parse("0.005").unwrap());
    }

    #[test]
    fn test_merchant_named_token_account_directly() {
        let t = parse_transaction(
            &tx(transfer_checked("10000"), Value::Null),
            SIG,
            &config(),
            MERCHANT_ATA,
            1100,
        )
        .unwrap();
        assert_eq!(t.to_address, MERCHANT_ATA);
    }

    #[test]
    fn test_failed_transaction_is_reverted() {
        let err = parse_transaction(
            &tx(transfer_checked("10000"), json!({"InstructionError": [0, "Custom"]})),
            SIG,
            &config(),
            MERCHANT,
            1100,
        )
        .unwrap_err();
        assert_eq!(err, BackendError::Reverted);
    }

    #[test]
    fn test_too_few_confirmations() {
        let err = parse_transaction(
            &tx(transfer_checked("10000"), Value::Null),
            SIG,
            &config(),
            MERCHANT,
            1010,
        )
        .unwrap_err();
        assert_eq!(
            err,
            BackendError::Unconfirmed {
                confirmations: 10,
                required: 32
            }
        );
    }

    #[test]
    fn test_no_token_instruction() {
        let ix = json!({
            "program": "system",
            "parsed": { "type": "transfer", "info": { "lamports": 5000 } }
        });
        let err = parse_transaction(&tx(ix, Value::Null), SIG, &config(), MERCHANT, 1100)
            .unwrap_err();
        assert_eq!(err, BackendError::NoTransfer);
    }

    #[test]
    fn test_inner_instructions_are_scanned() {
        let mut value = tx(
            json!({"program": "system", "parsed": {"type": "advanceNonce"}}),
            Value::Null,
        );
        value["meta"]["innerInstructions"] = json!([
            { "index": 0, "instructions": [transfer_checked("20000")] }
        ]);
        let t = parse_transaction(&value, SIG, &config(), MERCHANT, 1100).unwrap();
        assert_eq!(t.amount_usd(), UsdAmount::parse("0.02").unwrap());
    }

    #[test]
    fn test_missing_block_time_fails_closed() {
        let mut value = tx(transfer_checked("10000"), Value::Null);
        value["blockTime"] = Value::Null;
        let err = parse_transaction(&value, SIG, &config(), MERCHANT, 1100).unwrap_err();
        assert!(err.is_transient());
    }
}
