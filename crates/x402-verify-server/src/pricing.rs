//! Per-endpoint prices and the payment requirement derived from them.

use std::collections::BTreeMap;

use x402_verify::{ChainRegistry, ConfigError, PaymentOption, PaymentRequirement, UsdAmount};

/// Used when `X402_ENDPOINT_PRICES` is unset.
pub const DEFAULT_ENDPOINT_PRICES: &str = "/api/exploits:0.01,/api/exploits/latest-alert:0.01";

/// Exact-path price table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceTable {
    routes: BTreeMap<String, UsdAmount>,
}

impl PriceTable {
    /// Parse `"/path:0.01,/other:$0.05"`. Whitespace around entries is ignored.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut table = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (path, price) = entry.rsplit_once(':').ok_or_else(|| {
                ConfigError::InvalidValue("X402_ENDPOINT_PRICES", entry.to_string())
            })?;
            let path = path.trim();
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue(
                    "X402_ENDPOINT_PRICES",
                    format!("path must start with '/': {path}"),
                ));
            }
            let price = UsdAmount::parse(price)
                .map_err(|e| ConfigError::InvalidValue("X402_ENDPOINT_PRICES", e.to_string()))?;
            if price == UsdAmount::ZERO {
                return Err(ConfigError::InvalidValue(
                    "X402_ENDPOINT_PRICES",
                    format!("zero price for {path}"),
                ));
            }
            table.insert(path, price);
        }
        Ok(table)
    }

    pub fn insert(&mut self, path: &str, price: UsdAmount) {
        self.routes.insert(normalize(path).to_string(), price);
    }

    pub fn price_for(&self, path: &str) -> Option<UsdAmount> {
        self.routes.get(normalize(path)).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, UsdAmount)> {
        self.routes.iter().map(|(p, a)| (p.as_str(), *a))
    }

    /// Requirement for `path`, offering the stablecoin of every chain that
    /// has a recipient. Chains whose address family differs from `merchant`
    /// are only offered with their own payment address.
    pub fn requirement_for(
        &self,
        path: &str,
        merchant: &str,
        chains: &ChainRegistry,
    ) -> Option<PaymentRequirement> {
        let price = self.price_for(path)?;
        Some(PaymentRequirement {
            price,
            merchant_address: merchant.to_string(),
            payment_options: chains
                .iter()
                .filter_map(|chain| {
                    let recipient = chain.recipient(merchant)?;
                    Some(PaymentOption {
                        network: chain.id.clone(),
                        token_symbol: chain.token_symbol.clone(),
                        token_address: chain.token_address.clone(),
                        pay_to: (recipient != merchant).then(|| recipient.to_string()),
                    })
                })
                .collect(),
            resource: Some(normalize(path).to_string()),
            description: Some(format!("Access to {} requires payment", normalize(path))),
        })
    }
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prices() {
        let table = PriceTable::parse(" /api/data:0.01, /api/premium:$0.05 ,").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.price_for("/api/data"), Some(UsdAmount::from_cents(1)));
        assert_eq!(table.price_for("/api/premium/"), Some(UsdAmount::from_cents(5)));
        assert_eq!(table.price_for("/api/other"), None);
    }

    #[test]
    fn test_default_prices_parse() {
        let table = PriceTable::parse(DEFAULT_ENDPOINT_PRICES).unwrap();
        assert_eq!(table.price_for("/api/exploits"), Some(UsdAmount::from_cents(1)));
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(PriceTable::parse("/api/data").is_err());
        assert!(PriceTable::parse("api/data:0.01").is_err());
        assert!(PriceTable::parse("/api/data:cheap").is_err());
        assert!(PriceTable::parse("/api/data:0").is_err());
        assert!(PriceTable::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_requirement_offers_chains_of_the_merchant_family() {
        let table = PriceTable::parse("/api/data:0.01").unwrap();
        let chains = ChainRegistry::with_defaults();
        let req = table.requirement_for("/api/data", "0xabc", &chains).unwrap();
        assert_eq!(req.price, UsdAmount::from_cents(1));
        assert_eq!(req.merchant_address, "0xabc");
        let networks: Vec<&str> = req.payment_options.iter().map(|o| o.network.as_str()).collect();
        assert_eq!(networks, vec!["base", "ethereum", "polygon"]);
        assert!(req.payment_options.iter().all(|o| o.pay_to.is_none()));
        assert_eq!(req.resource.as_deref(), Some("/api/data"));
        assert!(req.validate().is_ok());

        assert!(table.requirement_for("/api/nope", "0xabc", &chains).is_none());
    }

    #[test]
    fn test_requirement_uses_chain_payment_address() {
        let table = PriceTable::parse("/api/data:0.01").unwrap();
        let mut chains = ChainRegistry::with_defaults();
        chains.set_payment_address("solana", "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin");

        let req = table.requirement_for("/api/data", "0xabc", &chains).unwrap();
        assert_eq!(req.payment_options.len(), chains.iter().count());
        assert_eq!(
            req.pay_to_for("solana"),
            "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin"
        );
        assert_eq!(req.pay_to_for("base"), "0xabc");
    }
}
