//! Verification backend seams.
//!
//! - [`ChainBackend`]: reads a transfer straight from a chain node
//! - [`FacilitatorBackend`]: asks the external facilitator to vouch for a token
//!
//! [`crate::reader::ChainReader`] and [`crate::facilitator_client::FacilitatorClient`]
//! are the live implementations. The engine is generic over both so tests can
//! plug in counting mocks.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::outcome::{Backend, Reason};
use crate::payment::{NormalizedTransfer, PaymentRequirement};

/// Why a backend could not produce a [`NormalizedTransfer`].
///
/// Some variants are verdicts about the payment, others are infrastructure
/// failures; [`BackendError::is_transient`] tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transaction not found")]
    NotFound,

    #[error("payment rejected by facilitator: {0}")]
    Invalid(String),

    #[error("transaction reverted")]
    Reverted,

    #[error("transaction carries no token transfer")]
    NoTransfer,

    #[error("transaction has {confirmations} confirmations, {required} required")]
    Unconfirmed { confirmations: u64, required: u64 },

    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("malformed proof: {0}")]
    Malformed(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend timed out")]
    Timeout,

    #[error("facilitator disabled")]
    Disabled,
}

impl BackendError {
    /// Infrastructure trouble rather than a verdict; another backend may still decide.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unconfirmed { .. }
                | BackendError::Unavailable(_)
                | BackendError::Timeout
                | BackendError::Disabled
        )
    }

    /// Reason code reported when this error ends a verification on `backend`.
    pub fn reason(&self, backend: Backend) -> Reason {
        match self {
            BackendError::NotFound => Reason::ChainTransactionNotFound,
            BackendError::Invalid(_) => Reason::FacilitatorInvalid,
            BackendError::Reverted => Reason::TransactionReverted,
            BackendError::NoTransfer => Reason::NoTransferFound,
            BackendError::Unconfirmed { .. } => Reason::TransactionUnconfirmed,
            BackendError::UnsupportedChain(_) => Reason::UnsupportedChain,
            BackendError::Malformed(_) => Reason::MalformedProof,
            BackendError::Disabled => Reason::FacilitatorDisabled,
            BackendError::Unavailable(_) => match backend {
                Backend::Facilitator => Reason::FacilitatorUnreachable,
                _ => Reason::ChainNodeUnavailable,
            },
            BackendError::Timeout => match backend {
                Backend::Facilitator => Reason::FacilitatorUnreachable,
                _ => Reason::ChainRpcTimeout,
            },
        }
    }
}

/// Direct chain lookup.
pub trait ChainBackend: Send + Sync {
    /// Fetch and decode the token transfer in `tx_hash` on `chain`.
    ///
    /// `pay_to` only guides which transfer to pick when a transaction carries
    /// several; the policy still checks the recipient.
    fn fetch_transfer(
        &self,
        chain: &str,
        tx_hash: &str,
        pay_to: &str,
    ) -> impl Future<Output = Result<NormalizedTransfer, BackendError>> + Send;
}

/// Facilitator-attested verification of an opaque payment token.
pub trait FacilitatorBackend: Send + Sync {
    fn authorize_or_verify(
        &self,
        token: &str,
        requirement: &PaymentRequirement,
    ) -> impl Future<Output = Result<NormalizedTransfer, BackendError>> + Send;
}

impl<T: ChainBackend> ChainBackend for Arc<T> {
    fn fetch_transfer(
        &self,
        chain: &str,
        tx_hash: &str,
        pay_to: &str,
    ) -> impl Future<Output = Result<NormalizedTransfer, BackendError>> + Send {
        (**self).fetch_transfer(chain, tx_hash, pay_to)
    }
}

impl<T: FacilitatorBackend> FacilitatorBackend for Arc<T> {
    fn authorize_or_verify(
        &self,
        token: &str,
        requirement: &PaymentRequirement,
    ) -> impl Future<Output = Result<NormalizedTransfer, BackendError>> + Send {
        (**self).authorize_or_verify(token, requirement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::VerificationStatus;

    #[test]
    fn test_transient_errors_map_to_backend_unavailable() {
        for err in [
            BackendError::Timeout,
            BackendError::Unavailable("503".into()),
            BackendError::Disabled,
            BackendError::Unconfirmed {
                confirmations: 1,
                required: 6,
            },
        ] {
            assert!(err.is_transient());
            assert_eq!(
                err.reason(Backend::Chain).status(),
                VerificationStatus::BackendUnavailable
            );
        }
    }

    #[test]
    fn test_verdicts_map_to_rejected() {
        for err in [
            BackendError::NotFound,
            BackendError::Invalid("expired".into()),
            BackendError::Reverted,
            BackendError::NoTransfer,
            BackendError::UnsupportedChain("arbitrum".into()),
            BackendError::Malformed("bad hash".into()),
        ] {
            assert!(!err.is_transient());
            assert_eq!(
                err.reason(Backend::Facilitator).status(),
                VerificationStatus::Rejected
            );
        }
    }

    #[test]
    fn test_timeout_reason_depends_on_backend() {
        assert_eq!(
            BackendError::Timeout.reason(Backend::Facilitator),
            Reason::FacilitatorUnreachable
        );
        assert_eq!(
            BackendError::Timeout.reason(Backend::Chain),
            Reason::ChainRpcTimeout
        );
    }
}
