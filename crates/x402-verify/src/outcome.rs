use serde::{Deserialize, Serialize};

use crate::payment::NormalizedTransfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Rejected,
    BackendUnavailable,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Rejected => "rejected",
            VerificationStatus::BackendUnavailable => "backend_unavailable",
        }
    }
}

/// Which path produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Facilitator,
    Chain,
    Cache,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Facilitator => "facilitator",
            Backend::Chain => "chain",
            Backend::Cache => "cache",
        }
    }
}

/// Structured reason attached to every outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Verified,

    // Rejected
    MalformedProof,
    WrongRecipient,
    UnsupportedToken,
    Underpayment,
    BelowDustThreshold,
    PaymentTooOld,
    ReplayDetected,
    FacilitatorInvalid,
    ChainTransactionNotFound,
    UnsupportedChain,
    TransactionReverted,
    NoTransferFound,

    // BackendUnavailable
    FacilitatorUnreachable,
    FacilitatorDisabled,
    #[serde(rename = "chain_rpc_timeout")]
    ChainRpcTimeout,
    ChainNodeUnavailable,
    TransactionUnconfirmed,
    ReplayStoreUnavailable,
}

impl Reason {
    pub fn status(&self) -> VerificationStatus {
        use Reason::*;
        match self {
            Verified => VerificationStatus::Verified,
            MalformedProof | WrongRecipient | UnsupportedToken | Underpayment
            | BelowDustThreshold | PaymentTooOld | ReplayDetected | FacilitatorInvalid
            | ChainTransactionNotFound | UnsupportedChain | TransactionReverted
            | NoTransferFound => VerificationStatus::Rejected,
            FacilitatorUnreachable | FacilitatorDisabled | ChainRpcTimeout
            | ChainNodeUnavailable | TransactionUnconfirmed | ReplayStoreUnavailable => {
                VerificationStatus::BackendUnavailable
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        use Reason::*;
        match self {
            Verified => "verified",
            MalformedProof => "malformed_proof",
            WrongRecipient => "wrong_recipient",
            UnsupportedToken => "unsupported_token",
            Underpayment => "underpayment",
            BelowDustThreshold => "below_dust_threshold",
            PaymentTooOld => "payment_too_old",
            ReplayDetected => "replay_detected",
            FacilitatorInvalid => "facilitator_invalid",
            ChainTransactionNotFound => "chain_transaction_not_found",
            UnsupportedChain => "unsupported_chain",
            TransactionReverted => "transaction_reverted",
            NoTransferFound => "no_transfer_found",
            FacilitatorUnreachable => "facilitator_unreachable",
            FacilitatorDisabled => "facilitator_disabled",
            ChainRpcTimeout => "chain_rpc_timeout",
            ChainNodeUnavailable => "chain_node_unavailable",
            TransactionUnconfirmed => "transaction_unconfirmed",
            ReplayStoreUnavailable => "replay_store_unavailable",
        }
    }

    /// Whether the HTTP layer may echo this code back to the client.
    ///
    /// Replay and facilitator-signature verdicts stay opaque, as do
    /// internal infrastructure details.
    pub fn is_client_visible(&self) -> bool {
        use Reason::*;
        matches!(
            self,
            MalformedProof
                | WrongRecipient
                | UnsupportedToken
                | Underpayment
                | BelowDustThreshold
                | PaymentTooOld
                | UnsupportedChain
                | ChainTransactionNotFound
                | TransactionUnconfirmed
                | FacilitatorDisabled
        )
    }

    /// Suggested client back-off for transient verdicts.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Reason::TransactionUnconfirmed => Some(10),
            Reason::FacilitatorDisabled => Some(0),
            r if r.status() == VerificationStatus::BackendUnavailable => Some(5),
            _ => None,
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `verify` call.
///
/// `normalized_transfer` is present exactly when `status` is `Verified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub status: VerificationStatus,
    pub reason: Reason,
    pub backend_used: Backend,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_transfer: Option<NormalizedTransfer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl VerificationOutcome {
    pub fn verified(transfer: NormalizedTransfer, backend: Backend, latency_ms: u64) -> Self {
        Self {
            status: VerificationStatus::Verified,
            reason: Reason::Verified,
            backend_used: backend,
            latency_ms,
            normalized_transfer: Some(transfer),
            retry_after_secs: None,
        }
    }

    /// Non-verified outcome. Passing [`Reason::Verified`] here is a bug and is
    /// downgraded to a `ChainNodeUnavailable` failure rather than granting access.
    pub fn failed(reason: Reason, backend: Backend, latency_ms: u64) -> Self {
        let reason = if reason == Reason::Verified {
            Reason::ChainNodeUnavailable
        } else {
            reason
        };
        Self {
            status: reason.status(),
            reason,
            backend_used: backend,
            latency_ms,
            normalized_transfer: None,
            retry_after_secs: reason.retry_after_secs(),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified && self.normalized_transfer.is_some()
    }
}
