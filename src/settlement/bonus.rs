use crate::config::BonusTier;

/// Deposit bonus schedule. The highest tier whose minimum the deposit meets
/// applies; amounts below every tier earn nothing.
#[derive(Debug, Clone, Default)]
pub struct BonusPolicy {
    tiers: Vec<BonusTier>,
}

impl BonusPolicy {
    pub fn new(mut tiers: Vec<BonusTier>) -> Self {
        tiers.sort_by_key(|t| t.min_amount);
        Self { tiers }
    }

    pub fn tiers(&self) -> &[BonusTier] {
        &self.tiers
    }

    /// `floor(amount * percent / 100)` for the matching tier.
    pub fn bonus_for(&self, amount: i64) -> i64 {
        let Some(tier) = self.tiers.iter().rev().find(|t| amount >= t.min_amount) else {
            return 0;
        };
        let bonus = i128::from(amount) * i128::from(tier.percent) / 100;
        i64::try_from(bonus).unwrap_or(0)
    }
}
