pub mod order;

use std::future::Future;
use std::time::Duration;

use crate::error::{BillingError, Result};

/// Bounded retry with exponential backoff for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Why a single attempt failed, and whether another attempt may help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Transient { status: Option<u16>, detail: String },
    Permanent { status: Option<u16>, detail: String },
}

impl AttemptError {
    /// 5xx and 429 are worth retrying; every other non-success status is not.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if status >= 500 || status == 429 {
            Self::Transient {
                status: Some(status),
                detail,
            }
        } else {
            Self::Permanent {
                status: Some(status),
                detail,
            }
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() || err.is_builder() {
            return Self::Permanent {
                status: None,
                detail: err.to_string(),
            };
        }
        // connect, timeout, body and other request-level failures
        Self::Transient {
            status: None,
            detail: err.to_string(),
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. Every terminal failure becomes `ServiceUnavailable` carrying the
/// last status seen.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, service: &'static str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AttemptError::Transient {
                status: None,
                detail: format!("attempt timed out after {:?}", policy.attempt_timeout),
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(AttemptError::Permanent { status, detail }) => {
                tracing::warn!(service, attempt, ?status, %detail, "non-retryable failure");
                return Err(BillingError::ServiceUnavailable {
                    service,
                    status,
                    detail,
                });
            }
            Err(AttemptError::Transient { status, detail }) => {
                if attempt >= max_attempts {
                    tracing::warn!(service, attempt, ?status, %detail, "retry budget exhausted");
                    return Err(BillingError::ServiceUnavailable {
                        service,
                        status,
                        detail,
                    });
                }
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    service,
                    attempt,
                    ?status,
                    %detail,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
