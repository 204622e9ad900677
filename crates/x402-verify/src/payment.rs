use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::{TokenAmount, UsdAmount};
use crate::VerifyError;

/// One accepted way of paying: a token on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOption {
    pub network: String,
    pub token_symbol: String,
    pub token_address: String,
    /// Recipient on this network when it differs from the merchant address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
}

/// What a protected request costs and who gets paid.
///
/// Built per request by the pricing layer and only ever read by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub price: UsdAmount,
    pub merchant_address: String,
    pub payment_options: Vec<PaymentOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentRequirement {
    /// Shape check. A failure here is a caller bug, not a payment verdict.
    pub fn validate(&self) -> Result<(), VerifyError> {
        if self.merchant_address.trim().is_empty() {
            return Err(VerifyError::InvalidRequirement(
                "merchant address is empty".to_string(),
            ));
        }
        if self.payment_options.is_empty() {
            return Err(VerifyError::InvalidRequirement(
                "no payment options".to_string(),
            ));
        }
        for (i, option) in self.payment_options.iter().enumerate() {
            if option.network.trim().is_empty() {
                return Err(VerifyError::InvalidRequirement(format!(
                    "payment option {i} has no network"
                )));
            }
            if option.token_address.trim().is_empty() {
                return Err(VerifyError::InvalidRequirement(format!(
                    "payment option {i} has no token address"
                )));
            }
            if option.pay_to.as_deref().is_some_and(|a| a.trim().is_empty()) {
                return Err(VerifyError::InvalidRequirement(format!(
                    "payment option {i} has an empty recipient"
                )));
            }
        }
        Ok(())
    }

    /// First option offered for `network`, matched case-insensitively.
    pub fn option_for(&self, network: &str) -> Option<&PaymentOption> {
        self.payment_options
            .iter()
            .find(|o| o.network.eq_ignore_ascii_case(network))
    }

    /// Address a payment on `network` must reach.
    pub fn pay_to_for(&self, network: &str) -> &str {
        self.option_for(network)
            .and_then(|o| o.pay_to.as_deref())
            .unwrap_or(&self.merchant_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitatorProof {
    /// Base64 envelope exactly as received in the `X-PAYMENT` header.
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainProof {
    pub tx_hash: String,
    pub chain: String,
}

/// Evidence of payment presented by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Proof {
    Facilitator(FacilitatorProof),
    OnChain(OnChainProof),
}

impl Proof {
    pub fn facilitator(token: impl Into<String>) -> Self {
        Proof::Facilitator(FacilitatorProof {
            token: token.into(),
        })
    }

    pub fn on_chain(tx_hash: impl Into<String>, chain: impl Into<String>) -> Self {
        Proof::OnChain(OnChainProof {
            tx_hash: tx_hash.into(),
            chain: chain.into(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Proof::Facilitator(_) => "facilitator",
            Proof::OnChain(_) => "on_chain",
        }
    }
}

/// The one shape policy evaluation reasons about, whichever backend produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTransfer {
    pub from_address: String,
    pub to_address: String,
    pub amount: TokenAmount,
    /// Token contract (EVM) or mint (Solana).
    pub token: String,
    pub chain: String,
    pub timestamp: DateTime<Utc>,
    /// Transaction hash, signature, or facilitator-assigned id.
    pub tx_hash: String,
    pub confirmations: u64,
}

impl NormalizedTransfer {
    pub fn amount_usd(&self) -> UsdAmount {
        self.amount.usd()
    }

    /// Key under which this transfer may be consumed exactly once.
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.chain, &self.tx_hash)
    }
}

/// `"<chain>:<id>"` with the chain lowercased and hex ids lowercased.
///
/// Base58 signatures are case-sensitive and kept verbatim.
pub fn idempotency_key(chain: &str, id: &str) -> String {
    let id = id.trim();
    let id = if is_hex_string(id) {
        id.to_ascii_lowercase()
    } else {
        id.to_string()
    };
    format!("{}:{}", chain.trim().to_ascii_lowercase(), id)
}

/// `0x`-prefixed and hex from there on.
pub fn is_hex_string(s: &str) -> bool {
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or("");
    !body.is_empty() && body.chars().all(|c| c.is_ascii_hexdigit())
}

/// Address equality: case-insensitive for hex, exact otherwise.
pub fn addresses_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if is_hex_string(a) && is_hex_string(b) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}
