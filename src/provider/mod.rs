pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive as _;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    VirtualAccount,
    EWallet,
    Qris,
    ConvenienceStore,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFee {
    pub flat: i64,
    pub percent: Decimal,
}

/// A payment channel offered by the provider, with the fee charged to the
/// payer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub code: String,
    pub name: String,
    pub kind: ChannelKind,
    pub fee: ChannelFee,
    /// 0 means no floor.
    pub min_fee: i64,
    /// 0 means no ceiling.
    pub max_fee: i64,
    pub active: bool,
}

impl Channel {
    pub fn fee_for(&self, amount: i64) -> i64 {
        compute_fee(amount, &self.fee, self.min_fee, self.max_fee)
    }
}

/// `clamp(flat + round(amount * percent / 100), min_fee, max_fee)`, where a
/// zero bound is ignored.
pub fn compute_fee(amount: i64, fee: &ChannelFee, min_fee: i64, max_fee: i64) -> i64 {
    let percent_part = (Decimal::from(amount) * fee.percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(i64::MAX);
    let mut total = fee.flat.saturating_add(percent_part);
    if min_fee > 0 {
        total = total.max(min_fee);
    }
    if max_fee > 0 {
        total = total.min(max_fee);
    }
    total
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: Option<String>,
    pub name: String,
    pub price: i64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub method: String,
    pub merchant_ref: String,
    pub amount: i64,
    pub customer: CustomerInfo,
    pub order_items: Vec<OrderItem>,
    pub return_url: Option<String>,
    pub expired_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    pub title: String,
    pub steps: Vec<String>,
}

/// What the provider hands back for a created transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTransaction {
    pub reference: String,
    pub pay_code: Option<String>,
    pub checkout_url: Option<String>,
    pub payment_name: String,
    #[serde(default)]
    pub instructions: Vec<PaymentInstruction>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>>;

    async fn create_transaction(&self, req: &TransactionRequest) -> Result<ProviderTransaction>;
}

/// Looks a channel up by code (case-insensitive). Unknown and inactive
/// channels are validation errors.
pub async fn find_channel(provider: &dyn PaymentProvider, code: &str) -> Result<Channel> {
    let channel = provider
        .list_channels()
        .await?
        .into_iter()
        .find(|c| c.code.eq_ignore_ascii_case(code))
        .ok_or_else(|| BillingError::UnknownChannel(code.to_string()))?;
    if !channel.active {
        return Err(BillingError::ChannelInactive(channel.code));
    }
    Ok(channel)
}
