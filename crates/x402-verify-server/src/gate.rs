//! HTTP 402 responses.

use actix_web::http::header;
use actix_web::HttpResponse;
use serde::Serialize;
use x402_verify::{
    PaymentOption, PaymentRequirement, Reason, UsdAmount, VerificationOutcome, VerificationStatus,
};

/// Body of every 402, mirroring the requirement so the client can retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub error: String,
    pub price: UsdAmount,
    pub merchant: String,
    pub payment_options: Vec<PaymentOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Only codes safe to disclose; fraud-adjacent and infrastructure detail is withheld.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl PaymentRequiredBody {
    pub fn new(requirement: &PaymentRequirement, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            price: requirement.price,
            merchant: requirement.merchant_address.clone(),
            payment_options: requirement.payment_options.clone(),
            resource: requirement.resource.clone(),
            description: requirement.description.clone(),
            reason: None,
            retry_after: None,
        }
    }
}

/// 402 for a request that carried no proof.
pub fn payment_required(requirement: &PaymentRequirement) -> HttpResponse {
    respond(PaymentRequiredBody::new(requirement, "payment required"))
}

/// 402 for a proof the server could not even parse.
pub fn malformed_proof(requirement: &PaymentRequirement) -> HttpResponse {
    let mut body = PaymentRequiredBody::new(requirement, "malformed payment proof");
    body.reason = Some(Reason::MalformedProof);
    respond(body)
}

/// 402 for any outcome other than `Verified`.
pub fn not_verified(
    requirement: &PaymentRequirement,
    outcome: &VerificationOutcome,
) -> HttpResponse {
    let error = match outcome.status {
        VerificationStatus::BackendUnavailable => "payment verification unavailable",
        _ => "payment rejected",
    };
    let mut body = PaymentRequiredBody::new(requirement, error);
    body.reason = outcome.reason.is_client_visible().then_some(outcome.reason);
    body.retry_after = outcome.retry_after_secs.filter(|secs| *secs > 0);
    respond(body)
}

fn respond(body: PaymentRequiredBody) -> HttpResponse {
    let mut response = HttpResponse::PaymentRequired();
    response
        .insert_header(("X-Payment-Required", "true"))
        .insert_header(("X-Payment-Amount", body.price.to_string()))
        .insert_header(("X-Payment-Currency", "USD"));
    if let Some(secs) = body.retry_after {
        response.insert_header((header::RETRY_AFTER, secs.to_string()));
    }
    response.json(body)
}
