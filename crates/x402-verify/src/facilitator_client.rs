//! Client for an external x402 facilitator's `/verify` endpoint.
//!
//! The `X-PAYMENT` token is a base64 JSON envelope carrying an EIP-3009
//! `exact` authorization. It is decoded locally, forwarded verbatim to the
//! facilitator together with requirements derived from the
//! [`PaymentRequirement`], and the facilitator's verdict is mapped into a
//! [`NormalizedTransfer`]. Settlement is never requested.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;
use crate::backend::{BackendError, FacilitatorBackend};
use crate::chain::{ChainRegistry, USDC_DECIMALS};
use crate::hmac::{sign_request, FACILITATOR_AUTH_HEADER};
use crate::http_client::{send_with_retry, RetryPolicy};
use crate::payment::{NormalizedTransfer, PaymentOption, PaymentRequirement};

pub const X402_VERSION: u32 = 1;
pub const EXACT_SCHEME: &str = "exact";

/// Decoded `X-PAYMENT` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactPayload {
    pub signature: String,
    pub authorization: Authorization,
}

/// EIP-3009 `transferWithAuthorization` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub from: String,
    pub to: String,
    /// Token units as a decimal string.
    pub value: String,
    #[serde(default)]
    pub valid_after: serde_json::Value,
    #[serde(default)]
    pub valid_before: serde_json::Value,
    pub nonce: String,
}

/// Requirements in the facilitator's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub asset: String,
    pub pay_to: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub max_timeout_seconds: u64,
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
    #[serde(default)]
    payer: Option<String>,
}

/// One entry of `GET /supported`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedKind {
    #[serde(default)]
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
}

#[derive(Debug, Deserialize)]
struct SupportedResponse {
    #[serde(default)]
    kinds: Vec<SupportedKind>,
}

/// Decode the base64 envelope. Returns the raw JSON (forwarded untouched so
/// the signed content is never re-serialized) and its typed view.
pub fn decode_envelope(token: &str) -> Result<(serde_json::Value, PaymentEnvelope), BackendError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(|e| BackendError::Malformed(format!("invalid base64: {e}")))?;
    let raw: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| BackendError::Malformed(format!("invalid JSON: {e}")))?;
    let envelope: PaymentEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| BackendError::Malformed(format!("invalid payment envelope: {e}")))?;
    if !envelope.scheme.eq_ignore_ascii_case(EXACT_SCHEME) {
        return Err(BackendError::Malformed(format!(
            "unsupported scheme '{}'",
            envelope.scheme
        )));
    }
    Ok((raw, envelope))
}

/// Build the facilitator-side requirements for `option`.
pub fn facilitator_requirements(
    requirement: &PaymentRequirement,
    option: &PaymentOption,
    decimals: u8,
) -> FacilitatorRequirements {
    FacilitatorRequirements {
        scheme: EXACT_SCHEME.to_string(),
        network: option.network.clone(),
        max_amount_required: requirement.price.to_token_units(decimals).to_string(),
        asset: option.token_address.clone(),
        pay_to: option
            .pay_to
            .clone()
            .unwrap_or_else(|| requirement.merchant_address.clone()),
        resource: requirement.resource.clone().unwrap_or_default(),
        description: requirement.description.clone().unwrap_or_default(),
        mime_type: "application/json".to_string(),
        max_timeout_seconds: 60,
        extra: serde_json::json!({ "name": option.token_symbol, "version": "2" }),
    }
}

/// Map a facilitator reply into a transfer or a backend error.
///
/// Only a 2xx body that parses and says `isValid: true` yields a transfer.
pub fn interpret_response(
    status: u16,
    body: &[u8],
    envelope: &PaymentEnvelope,
    option: &PaymentOption,
    decimals: u8,
    now: DateTime<Utc>,
) -> Result<NormalizedTransfer, BackendError> {
    if status == 401 || status == 403 {
        return Err(BackendError::Unavailable(
            "facilitator authentication failed".to_string(),
        ));
    }
    if !(200..300).contains(&status) {
        return Err(BackendError::Unavailable(format!(
            "facilitator returned HTTP {status}"
        )));
    }

    let response: VerifyResponse = serde_json::from_slice(body).map_err(|e| {
        BackendError::Unavailable(format!("unparseable facilitator response: {e}"))
    })?;

    if !response.is_valid {
        return Err(BackendError::Invalid(
            response
                .invalid_reason
                .unwrap_or_else(|| "unspecified".to_string()),
        ));
    }

    let authorization = &envelope.payload.authorization;
    let raw = U256::from_str(authorization.value.trim()).map_err(|e| {
        BackendError::Malformed(format!("authorization value is not an integer: {e}"))
    })?;

    let from_address = response
        .payer
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| authorization.from.clone());

    Ok(NormalizedTransfer {
        from_address,
        to_address: authorization.to.clone(),
        amount: TokenAmount::new(raw, decimals),
        token: option.token_address.clone(),
        chain: envelope.network.to_ascii_lowercase(),
        timestamp: now,
        tx_hash: authorization.nonce.clone(),
        confirmations: 0,
    })
}

#[derive(Clone)]
pub struct FacilitatorClient {
    http: reqwest::Client,
    base_url: String,
    enabled: bool,
    shared_secret: Option<Vec<u8>>,
    registry: Arc<ChainRegistry>,
    retry: RetryPolicy,
}

impl FacilitatorClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        registry: Arc<ChainRegistry>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            enabled: true,
            shared_secret: None,
            registry,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_shared_secret(mut self, secret: Option<Vec<u8>>) -> Self {
        self.shared_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Payment kinds the facilitator advertises.
    pub async fn supported_networks(&self) -> Result<Vec<SupportedKind>, BackendError> {
        if !self.enabled {
            return Err(BackendError::Disabled);
        }
        let url = format!("{}/supported", self.base_url);
        let resp = send_with_retry(&self.retry, || {
            self.http.get(&url).timeout(Duration::from_secs(5))
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("facilitator request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "facilitator returned HTTP {}",
                resp.status()
            )));
        }
        let body: SupportedResponse = resp.json().await.map_err(|e| {
            BackendError::Unavailable(format!("unparseable facilitator response: {e}"))
        })?;
        Ok(body.kinds)
    }

    async fn verify_token(
        &self,
        token: &str,
        requirement: &PaymentRequirement,
    ) -> Result<NormalizedTransfer, BackendError> {
        if !self.enabled {
            return Err(BackendError::Disabled);
        }

        let (raw, envelope) = decode_envelope(token)?;
        let option = requirement
            .option_for(&envelope.network)
            .ok_or_else(|| BackendError::UnsupportedChain(envelope.network.clone()))?;
        let decimals = self
            .registry
            .get(&envelope.network)
            .map(|c| c.token_decimals)
            .unwrap_or(USDC_DECIMALS);

        let body = serde_json::json!({
            "x402Version": envelope.x402_version,
            "paymentPayload": raw,
            "paymentRequirements": facilitator_requirements(requirement, option, decimals),
        });
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| BackendError::Unavailable(format!("serialization failed: {e}")))?;
        let signature = self
            .shared_secret
            .as_deref()
            .map(|secret| sign_request(secret, &body_bytes));

        let url = format!("{}/verify", self.base_url);
        let resp = send_with_retry(&self.retry, || {
            let mut request = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body_bytes.clone());
            if let Some(sig) = &signature {
                request = request.header(FACILITATOR_AUTH_HEADER, sig);
            }
            request
        })
        .await
        .map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Unavailable(format!("facilitator request failed: {e}"))
            }
        })?;

        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BackendError::Unavailable(format!("facilitator body read failed: {e}")))?;

        let result = interpret_response(status, &bytes, &envelope, option, decimals, Utc::now());
        match &result {
            Ok(transfer) => tracing::debug!(
                network = %envelope.network,
                payer = %transfer.from_address,
                "facilitator accepted payment"
            ),
            Err(e) => tracing::debug!(
                network = %envelope.network,
                status,
                error = %e,
                "facilitator did not accept payment"
            ),
        }
        result
    }
}

impl FacilitatorBackend for FacilitatorClient {
    async fn authorize_or_verify(
        &self,
        token: &str,
        requirement: &PaymentRequirement,
    ) -> Result<NormalizedTransfer, BackendError> {
        self.verify_token(token, requirement).await
    }
}
