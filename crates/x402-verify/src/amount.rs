//! Money handling in a single comparison unit.
//!
//! Every amount the policy looks at is a [`UsdAmount`]: an integer count of
//! micro-dollars. Prices are parsed from strings and token transfers are
//! converted from their native decimals, so no floating point ever enters
//! the comparison.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Fractional digits carried by [`UsdAmount`].
pub const USD_DECIMALS: u32 = 6;

const MICROS_PER_DOLLAR: u128 = 10u128.pow(USD_DECIMALS);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("invalid amount '{0}': no numeric content")]
    Empty(String),

    #[error("invalid amount '{0}': {1}")]
    Invalid(String, String),

    #[error("invalid amount '{0}': overflow")]
    Overflow(String),
}

/// A USD-denominated amount in micro-dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsdAmount(u128);

impl UsdAmount {
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(micros: u128) -> Self {
        Self(micros)
    }

    pub const fn micros(self) -> u128 {
        self.0
    }

    /// Whole-cent constructor, handy for thresholds (`from_cents(10)` is $0.10).
    pub const fn from_cents(cents: u128) -> Self {
        Self(cents * (MICROS_PER_DOLLAR / 100))
    }

    /// Parse a human-readable price such as `"$0.01"`, `"0.005"` or `"2"`.
    ///
    /// Digits past the sixth fractional place are truncated.
    pub fn parse(input: &str) -> Result<Self, AmountError> {
        let cleaned: String = input
            .trim()
            .trim_start_matches('$')
            .chars()
            .filter(|c| *c != '_')
            .collect();

        if cleaned.is_empty() {
            return Err(AmountError::Empty(input.to_string()));
        }
        if !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(AmountError::Invalid(
                input.to_string(),
                "unexpected character".to_string(),
            ));
        }

        let (integer_part, fractional_part) = cleaned.split_once('.').unwrap_or((&cleaned, ""));
        if fractional_part.contains('.') {
            return Err(AmountError::Invalid(
                input.to_string(),
                "more than one decimal point".to_string(),
            ));
        }
        if integer_part.is_empty() && fractional_part.is_empty() {
            return Err(AmountError::Empty(input.to_string()));
        }

        let integer: u128 = if integer_part.is_empty() {
            0
        } else {
            integer_part
                .parse()
                .map_err(|_| AmountError::Overflow(input.to_string()))?
        };

        let decimals = USD_DECIMALS as usize;
        let frac_digits = &fractional_part[..fractional_part.len().min(decimals)];
        let fractional: u128 = if frac_digits.is_empty() {
            0
        } else {
            let value: u128 = frac_digits
                .parse()
                .map_err(|e| AmountError::Invalid(input.to_string(), format!("{e}")))?;
            value * 10u128.pow((decimals - frac_digits.len()) as u32)
        };

        integer
            .checked_mul(MICROS_PER_DOLLAR)
            .and_then(|i| i.checked_add(fractional))
            .map(Self)
            .ok_or_else(|| AmountError::Overflow(input.to_string()))
    }

    /// Convert a USD-pegged token amount from its native decimals.
    ///
    /// Truncates below one micro-dollar and saturates at `u128::MAX`.
    pub fn from_token_units(raw: U256, decimals: u8) -> Self {
        let decimals = u32::from(decimals);
        let scaled = if decimals >= USD_DECIMALS {
            raw / U256::from(10u64).pow(U256::from(decimals - USD_DECIMALS))
        } else {
            raw.saturating_mul(U256::from(10u64).pow(U256::from(USD_DECIMALS - decimals)))
        };
        Self(u128::try_from(scaled).unwrap_or(u128::MAX))
    }

    /// Express this amount in a token's native units.
    pub fn to_token_units(self, decimals: u8) -> U256 {
        let decimals = u32::from(decimals);
        let micros = U256::from(self.0);
        if decimals >= USD_DECIMALS {
            micros.saturating_mul(U256::from(10u64).pow(U256::from(decimals - USD_DECIMALS)))
        } else {
            micros / U256::from(10u64).pow(U256::from(USD_DECIMALS - decimals))
        }
    }
}

impl fmt::Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_DOLLAR;
        let frac = format!("{:06}", self.0 % MICROS_PER_DOLLAR);
        let trimmed = frac.trim_end_matches('0');
        if trimmed.len() < 2 {
            write!(f, "{whole}.{:0<2}", trimmed)
        } else {
            write!(f, "{whole}.{trimmed}")
        }
    }
}

impl FromStr for UsdAmount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for UsdAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UsdAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// An on-chain token amount together with the decimals needed to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAmount {
    pub raw: U256,
    pub decimals: u8,
}

impl TokenAmount {
    pub fn new(raw: U256, decimals: u8) -> Self {
        Self { raw, decimals }
    }

    /// Value in the common comparison unit.
    pub fn usd(&self) -> UsdAmount {
        UsdAmount::from_token_units(self.raw, self.decimals)
    }
}
