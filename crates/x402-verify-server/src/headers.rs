//! Payment proof extraction from request headers.
//!
//! - `X-PAYMENT: <base64 token>` is a facilitator proof
//! - `x-payment-tx` + `x-payment-chain` is an on-chain proof
//!
//! When both are present the facilitator token is primary and the on-chain
//! reference is offered to the engine as the secondary.

use actix_web::http::header::HeaderMap;
use x402_verify::Proof;

pub const X_PAYMENT: &str = "x-payment";
pub const X_PAYMENT_TX: &str = "x-payment-tx";
pub const X_PAYMENT_CHAIN: &str = "x-payment-chain";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedProofs {
    pub primary: Proof,
    pub secondary: Option<Proof>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("header {0} is not valid ASCII")]
    Unreadable(&'static str),

    #[error("header {0} requires both x-payment-tx and x-payment-chain")]
    IncompletePair(&'static str),
}

/// Proofs carried by `headers`, `Ok(None)` when the request carries none.
pub fn extract_proofs(headers: &HeaderMap) -> Result<Option<PresentedProofs>, HeaderError> {
    let token = header(headers, X_PAYMENT)?;
    let tx = header(headers, X_PAYMENT_TX)?;
    let chain = header(headers, X_PAYMENT_CHAIN)?;

    let on_chain = match (tx, chain) {
        (Some(tx), Some(chain)) => Some(Proof::on_chain(tx, chain)),
        (Some(_), None) => return Err(HeaderError::IncompletePair(X_PAYMENT_TX)),
        (None, Some(_)) => return Err(HeaderError::IncompletePair(X_PAYMENT_CHAIN)),
        (None, None) => None,
    };

    Ok(match (token, on_chain) {
        (Some(token), secondary) => Some(PresentedProofs {
            primary: Proof::facilitator(token),
            secondary,
        }),
        (None, Some(on_chain)) => Some(PresentedProofs {
            primary: on_chain,
            secondary: None,
        }),
        (None, None) => None,
    })
}

/// Trimmed, non-empty header value.
fn header(headers: &HeaderMap, name: &'static str) -> Result<Option<String>, HeaderError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let value = value.to_str().map_err(|_| HeaderError::Unreadable(name))?.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
    }
}
