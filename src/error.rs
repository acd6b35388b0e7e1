use thiserror::Error;

pub type Result<T, E = BillingError> = std::result::Result<T, E>;

/// Broad grouping used to decide how much of an error a caller may see and
/// whether retrying makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Conflict,
    Authentication,
    Transient,
    Internal,
}

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("amount must be greater than zero (got {amount})")]
    InvalidAmount { amount: i64 },

    #[error("amount {amount} is below the minimum of {minimum}")]
    AmountBelowMinimum { amount: i64, minimum: i64 },

    #[error("unknown payment channel: {0}")]
    UnknownChannel(String),

    #[error("payment channel is not active: {0}")]
    ChannelInactive(String),

    #[error("invalid callback payload: {0}")]
    InvalidPayload(String),

    #[error("wallet not found for user {user_id}")]
    WalletNotFound { user_id: String },

    #[error("insufficient balance: current {current}, required {required}")]
    InsufficientBalance { current: i64, required: i64 },

    #[error("ledger entry not found: {0}")]
    EntryNotFound(String),

    #[error("ledger entry {entry_id} cannot be refunded: {reason}")]
    InvalidRefund { entry_id: String, reason: String },

    #[error("deposit not found: {0}")]
    DepositNotFound(String),

    #[error("idempotency key {0} belongs to a different deposit request")]
    IdempotencyConflict(String),

    #[error("invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("invoice {0} is already paid")]
    InvoiceAlreadyPaid(String),

    #[error("invoice {0} has expired")]
    InvoiceExpired(String),

    #[error("invoice {invoice_id} is not payable in status {status}")]
    InvoiceNotPayable { invoice_id: String, status: String },

    #[error("access denied")]
    AccessDenied,

    #[error("callback signature is invalid")]
    SignatureInvalid,

    /// Terminal outcome of an outbound call, after retries where allowed.
    #[error("{service} unavailable (status {status:?}): {detail}")]
    ServiceUnavailable {
        service: &'static str,
        status: Option<u16>,
        detail: String,
    },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl BillingError {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::AmountBelowMinimum { .. } => "AMOUNT_BELOW_MINIMUM",
            Self::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            Self::ChannelInactive(_) => "CHANNEL_INACTIVE",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::WalletNotFound { .. } => "WALLET_NOT_FOUND",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            Self::InvalidRefund { .. } => "INVALID_REFUND",
            Self::DepositNotFound(_) => "DEPOSIT_NOT_FOUND",
            Self::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Self::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            Self::InvoiceAlreadyPaid(_) => "INVOICE_ALREADY_PAID",
            Self::InvoiceExpired(_) => "INVOICE_EXPIRED",
            Self::InvoiceNotPayable { .. } => "INVOICE_NOT_PAYABLE",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::Storage(_) => "INTERNAL_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAmount { .. }
            | Self::AmountBelowMinimum { .. }
            | Self::UnknownChannel(_)
            | Self::ChannelInactive(_)
            | Self::InvalidPayload(_) => ErrorClass::Validation,
            Self::WalletNotFound { .. }
            | Self::InsufficientBalance { .. }
            | Self::EntryNotFound(_)
            | Self::InvalidRefund { .. }
            | Self::DepositNotFound(_)
            | Self::IdempotencyConflict(_)
            | Self::InvoiceNotFound(_)
            | Self::InvoiceAlreadyPaid(_)
            | Self::InvoiceExpired(_)
            | Self::InvoiceNotPayable { .. }
            | Self::AccessDenied => ErrorClass::Conflict,
            Self::SignatureInvalid => ErrorClass::Authentication,
            Self::ServiceUnavailable { .. } => ErrorClass::Transient,
            Self::Storage(_) => ErrorClass::Internal,
        }
    }

    /// Message safe to show to an API consumer. Transient and internal errors
    /// never leak provider or storage detail.
    pub fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::Validation | ErrorClass::Conflict | ErrorClass::Authentication => {
                self.to_string()
            }
            ErrorClass::Transient => "service temporarily unavailable, try again later".into(),
            ErrorClass::Internal => "internal error".into(),
        }
    }

    /// Shortfall for an `InsufficientBalance` error.
    pub fn deficit(&self) -> Option<i64> {
        match self {
            Self::InsufficientBalance { current, required } => Some(required - current),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deficit_is_required_minus_current() {
        let err = BillingError::InsufficientBalance {
            current: 30_000,
            required: 50_000,
        };
        assert_eq!(err.deficit(), Some(20_000));
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
        assert_eq!(BillingError::AccessDenied.deficit(), None);
    }

    #[test]
    fn transient_and_internal_messages_are_generic() {
        let err = BillingError::ServiceUnavailable {
            service: "payment provider",
            status: Some(502),
            detail: "upstream said: secret stack trace".into(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.public_message().contains("secret"));

        let err = BillingError::Storage(anyhow::anyhow!("disk I/O error at /var/lib/db"));
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn validation_messages_are_shown() {
        let err = BillingError::AmountBelowMinimum {
            amount: 5_000,
            minimum: 10_000,
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.public_message().contains("10000"));
    }
}
