use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    Channel, ChannelFee, ChannelKind, PaymentProvider, ProviderTransaction, TransactionRequest,
};
use crate::config::ProviderConfig;
use crate::error::Result;
use crate::gate::SignatureGate;
use crate::notifier::{AttemptError, RetryPolicy, with_retry};

const SERVICE: &str = "payment provider";

/// Every provider response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WireFee {
    #[serde(default)]
    flat: i64,
    #[serde(default)]
    percent: Decimal,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    group: String,
    code: String,
    name: String,
    total_fee: WireFee,
    #[serde(default)]
    minimum_fee: Option<i64>,
    #[serde(default)]
    maximum_fee: Option<i64>,
    active: bool,
}

impl From<WireChannel> for Channel {
    fn from(w: WireChannel) -> Self {
        Channel {
            kind: kind_from_group(&w.group, &w.code),
            code: w.code,
            name: w.name,
            fee: ChannelFee {
                flat: w.total_fee.flat,
                percent: w.total_fee.percent,
            },
            min_fee: w.minimum_fee.unwrap_or(0),
            max_fee: w.maximum_fee.unwrap_or(0),
            active: w.active,
        }
    }
}

fn kind_from_group(group: &str, code: &str) -> ChannelKind {
    let group = group.to_ascii_lowercase();
    if code.eq_ignore_ascii_case("QRIS") || group.contains("qris") {
        ChannelKind::Qris
    } else if group.contains("virtual account") {
        ChannelKind::VirtualAccount
    } else if group.contains("wallet") {
        ChannelKind::EWallet
    } else if group.contains("convenience") || group.contains("retail") {
        ChannelKind::ConvenienceStore
    } else {
        ChannelKind::Other
    }
}

#[derive(Debug, Serialize)]
struct WireOrderItem<'a> {
    sku: Option<&'a str>,
    name: &'a str,
    price: i64,
    quantity: u32,
}

#[derive(Debug, Serialize)]
struct WireCreateTransaction<'a> {
    method: &'a str,
    merchant_ref: &'a str,
    amount: i64,
    customer_name: &'a str,
    customer_email: &'a str,
    customer_phone: Option<&'a str>,
    order_items: Vec<WireOrderItem<'a>>,
    return_url: Option<&'a str>,
    expired_time: i64,
    signature: String,
}

/// HTTP client for the payment provider's merchant API.
#[derive(Debug, Clone)]
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    cfg: ProviderConfig,
    signer: SignatureGate,
    retry: RetryPolicy,
}

impl HttpPaymentProvider {
    pub fn new(cfg: ProviderConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(retry.attempt_timeout)
            .build()?;
        let signer = SignatureGate::new(&cfg.private_key);
        Ok(Self {
            client,
            cfg,
            signer,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    /// Signature the provider expects on transaction creation.
    pub fn request_signature(&self, merchant_ref: &str, amount: i64) -> String {
        let payload = format!("{}{}{}", self.cfg.merchant_code, merchant_ref, amount);
        self.signer.sign(payload.as_bytes())
    }

    async fn send<T: DeserializeOwned + Send>(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder + Send + Sync,
    ) -> Result<T> {
        with_retry(&self.retry, SERVICE, |_attempt| {
            let req = build().bearer_auth(&self.cfg.api_key);
            async move {
                let resp = req.send().await.map_err(|e| AttemptError::from_reqwest(&e))?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(AttemptError::from_status(status.as_u16(), body));
                }
                let envelope: Envelope<T> =
                    resp.json().await.map_err(|e| AttemptError::from_reqwest(&e))?;
                match envelope.data {
                    Some(data) if envelope.success => Ok(data),
                    _ => Err(AttemptError::Permanent {
                        status: Some(status.as_u16()),
                        detail: envelope.message,
                    }),
                }
            }
        })
        .await
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let url = self.url("merchant/payment-channel");
        let channels: Vec<WireChannel> = self.send(|| self.client.get(&url)).await?;
        Ok(channels.into_iter().map(Channel::from).collect())
    }

    async fn create_transaction(&self, req: &TransactionRequest) -> Result<ProviderTransaction> {
        let url = self.url("transaction/create");
        let body = WireCreateTransaction {
            method: &req.method,
            merchant_ref: &req.merchant_ref,
            amount: req.amount,
            customer_name: &req.customer.name,
            customer_email: &req.customer.email,
            customer_phone: req.customer.phone.as_deref(),
            order_items: req
                .order_items
                .iter()
                .map(|item| WireOrderItem {
                    sku: item.sku.as_deref(),
                    name: &item.name,
                    price: item.price,
                    quantity: item.quantity,
                })
                .collect(),
            return_url: req.return_url.as_deref(),
            expired_time: req.expired_time.timestamp(),
            signature: self.request_signature(&req.merchant_ref, req.amount),
        };

        let tx: ProviderTransaction = self.send(|| self.client.post(&url).json(&body)).await?;
        tracing::info!(
            merchant_ref = %req.merchant_ref,
            reference = %tx.reference,
            method = %req.method,
            amount = req.amount,
            "provider transaction created"
        );
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HttpPaymentProvider {
        HttpPaymentProvider::new(
            ProviderConfig {
                base_url: "https://provider.test/api/".into(),
                api_key: "key".into(),
                private_key: "private".into(),
                merchant_code: "T0001".into(),
            },
            RetryPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn request_signature_covers_merchant_ref_and_amount() {
        let p = provider();
        let expected = SignatureGate::new("private").sign(b"T0001DEP-1100000");
        assert_eq!(p.request_signature("DEP-1", 100_000), expected);
        assert_ne!(p.request_signature("DEP-1", 100_001), expected);
    }

    #[test]
    fn decodes_channel_catalog() {
        let raw = r#"{
          "success": true,
          "message": "",
          "data": [
            {"group": "Virtual Account", "code": "BRIVA", "name": "BRI Virtual Account",
             "total_fee": {"flat": 4000, "percent": "0.00"}, "minimum_fee": null,
             "maximum_fee": null, "active": true},
            {"group": "E-Wallet", "code": "QRIS", "name": "QRIS",
             "total_fee": {"flat": 750, "percent": 0.7}, "minimum_fee": 1000,
             "maximum_fee": 0, "active": false}
          ]
        }"#;
        let env: Envelope<Vec<WireChannel>> = serde_json::from_str(raw).unwrap();
        let channels: Vec<Channel> = env.data.unwrap().into_iter().map(Channel::from).collect();
        assert_eq!(channels[0].kind, ChannelKind::VirtualAccount);
        assert_eq!(channels[0].fee_for(100_000), 4_000);
        assert_eq!(channels[1].kind, ChannelKind::Qris);
        assert_eq!(channels[1].min_fee, 1_000);
        assert!(!channels[1].active);
    }

    #[test]
    fn url_joins_paths() {
        assert_eq!(
            provider().url("transaction/create"),
            "https://provider.test/api/transaction/create"
        );
    }
}
