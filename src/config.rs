use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notifier::RetryPolicy;

/// A bonus tier: deposits of at least `min_amount` receive `percent` of the
/// deposited amount as bonus credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusTier {
    pub min_amount: i64,
    pub percent: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Shared secret used both to sign outgoing requests and to verify callbacks.
    pub private_key: String,
    pub merchant_code: String,
}

#[derive(Debug, Clone)]
pub struct OrderServiceConfig {
    pub base_url: String,
    pub internal_key: Option<String>,
}

/// Configuration threaded into every component at construction time.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub min_deposit_amount: i64,
    pub deposit_expiry: Duration,
    pub invoice_expiry: Duration,
    pub default_currency: String,
    pub bonus_tiers: Vec<BonusTier>,
    pub retry: RetryPolicy,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            min_deposit_amount: 10_000,
            deposit_expiry: Duration::from_secs(24 * 3600),
            invoice_expiry: Duration::from_secs(24 * 3600),
            default_currency: "IDR".to_string(),
            bonus_tiers: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Parses `min_amount:percent` pairs separated by commas, e.g.
/// `500000:5,1000000:10`.
pub fn parse_bonus_tiers(s: &str) -> anyhow::Result<Vec<BonusTier>> {
    let mut tiers = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (min, pct) = part
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("bonus tier must be min:percent, got {part}"))?;
        let min_amount: i64 = min
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bonus tier minimum {min}: {e}"))?;
        let percent: u32 = pct
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bonus tier percent {pct}: {e}"))?;
        anyhow::ensure!(min_amount > 0, "bonus tier minimum must be > 0");
        anyhow::ensure!(percent <= 100, "bonus tier percent must be <= 100");
        tiers.push(BonusTier {
            min_amount,
            percent,
        });
    }
    Ok(tiers)
}
