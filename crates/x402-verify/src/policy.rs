//! Anti-fraud checks on a normalized transfer.
//!
//! Pure: no I/O, no clock reads. Checks run in a fixed order and the first
//! failure decides the rejection reason.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::amount::UsdAmount;
use crate::outcome::Reason;
use crate::payment::{addresses_match, NormalizedTransfer, PaymentRequirement};

pub const DEFAULT_MIN_PAYMENT: UsdAmount = UsdAmount::from_cents(10);
pub const DEFAULT_MAX_PAYMENT_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Dust threshold, independent of the endpoint price.
    pub min_payment: UsdAmount,
    pub max_payment_age: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_payment: DEFAULT_MIN_PAYMENT,
            max_payment_age: DEFAULT_MAX_PAYMENT_AGE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn evaluate(
        &self,
        transfer: &NormalizedTransfer,
        requirement: &PaymentRequirement,
        now: DateTime<Utc>,
    ) -> Result<(), Reason> {
        if !addresses_match(&transfer.to_address, requirement.pay_to_for(&transfer.chain)) {
            return Err(Reason::WrongRecipient);
        }

        let token_accepted = requirement.payment_options.iter().any(|option| {
            option.network.eq_ignore_ascii_case(&transfer.chain)
                && addresses_match(&option.token_address, &transfer.token)
        });
        if !token_accepted {
            return Err(Reason::UnsupportedToken);
        }

        let amount = transfer.amount_usd();
        if amount < requirement.price {
            return Err(Reason::Underpayment);
        }
        if amount < self.config.min_payment {
            return Err(Reason::BelowDustThreshold);
        }

        // Future-dated timestamps (clock skew) have no age and pass.
        let age = now.signed_duration_since(transfer.timestamp);
        let max_age = chrono::Duration::from_std(self.config.max_payment_age)
            .unwrap_or(chrono::Duration::MAX);
        if age > max_age {
            return Err(Reason::PaymentTooOld);
        }

        Ok(())
    }
}
