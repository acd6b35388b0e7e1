use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttemptError, RetryPolicy, with_retry};
use crate::config::OrderServiceConfig;
use crate::error::Result;

const SERVICE: &str = "order service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPaymentStatus {
    Paid,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaymentUpdate {
    #[serde(skip)]
    pub order_id: String,
    pub status: OrderPaymentStatus,
    pub reference: String,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Tells the order system how payment for one of its orders turned out.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn notify(&self, update: &OrderPaymentUpdate) -> Result<()>;
}

/// `POST {base}/internal/orders/{id}/payment-status` with bounded retry.
#[derive(Debug, Clone)]
pub struct HttpOrderNotifier {
    client: reqwest::Client,
    cfg: OrderServiceConfig,
    retry: RetryPolicy,
}

impl HttpOrderNotifier {
    pub fn new(cfg: OrderServiceConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(retry.attempt_timeout)
            .build()?;
        Ok(Self { client, cfg, retry })
    }

    fn url(&self, order_id: &str) -> String {
        format!(
            "{}/internal/orders/{}/payment-status",
            self.cfg.base_url.trim_end_matches('/'),
            order_id
        )
    }
}

#[async_trait]
impl OrderNotifier for HttpOrderNotifier {
    async fn notify(&self, update: &OrderPaymentUpdate) -> Result<()> {
        let url = self.url(&update.order_id);
        with_retry(&self.retry, SERVICE, |attempt| {
            let mut req = self.client.post(&url).json(update);
            if let Some(key) = &self.cfg.internal_key {
                req = req.header("X-Internal-Key", key);
            }
            let url = url.clone();
            async move {
                tracing::debug!(%url, attempt, "notifying order service");
                let resp = req.send().await.map_err(|e| AttemptError::from_reqwest(&e))?;
                let status = resp.status();
                if status.is_success() {
                    return Ok(());
                }
                let body = resp.text().await.unwrap_or_default();
                Err(AttemptError::from_status(status.as_u16(), body))
            }
        })
        .await?;

        tracing::info!(
            order_id = %update.order_id,
            status = ?update.status,
            reference = %update.reference,
            "order service notified"
        );
        Ok(())
    }
}

/// Used when no order service is configured (operator tooling, tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyNotifier;

#[async_trait]
impl OrderNotifier for LogOnlyNotifier {
    async fn notify(&self, update: &OrderPaymentUpdate) -> Result<()> {
        tracing::info!(
            order_id = %update.order_id,
            status = ?update.status,
            reference = %update.reference,
            "order notification skipped, no order service configured"
        );
        Ok(())
    }
}
