use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use hosting_billing::error::{BillingError, Result};
use hosting_billing::notifier::order::{OrderNotifier, OrderPaymentUpdate};
use hosting_billing::provider::{
    Channel, ChannelFee, ChannelKind, PaymentProvider, ProviderTransaction, TransactionRequest,
};
use rust_decimal_macros::dec;

/// In-process payment provider with a fixed channel catalog.
pub struct MockProvider {
    channels: Vec<Channel>,
    fail_create: AtomicBool,
    next_reference: AtomicU64,
    pub requests: Mutex<Vec<TransactionRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            channels: vec![
                Channel {
                    code: "BRIVA".into(),
                    name: "BRI Virtual Account".into(),
                    kind: ChannelKind::VirtualAccount,
                    fee: ChannelFee {
                        flat: 4_000,
                        percent: dec!(0),
                    },
                    min_fee: 0,
                    max_fee: 0,
                    active: true,
                },
                Channel {
                    code: "QRIS".into(),
                    name: "QRIS".into(),
                    kind: ChannelKind::Qris,
                    fee: ChannelFee {
                        flat: 750,
                        percent: dec!(0.7),
                    },
                    min_fee: 1_000,
                    max_fee: 0,
                    active: true,
                },
                Channel {
                    code: "OVO".into(),
                    name: "OVO".into(),
                    kind: ChannelKind::EWallet,
                    fee: ChannelFee {
                        flat: 0,
                        percent: dec!(3),
                    },
                    min_fee: 0,
                    max_fee: 0,
                    active: false,
                },
            ],
            fail_create: AtomicBool::new(false),
            next_reference: AtomicU64::new(1),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_create.store(failing, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.channels.clone())
    }

    async fn create_transaction(&self, req: &TransactionRequest) -> Result<ProviderTransaction> {
        self.requests.lock().unwrap().push(req.clone());
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BillingError::ServiceUnavailable {
                service: "payment provider",
                status: Some(503),
                detail: "mock outage".into(),
            });
        }
        let n = self.next_reference.fetch_add(1, Ordering::SeqCst);
        let reference = format!("T0001{n:08}");
        Ok(ProviderTransaction {
            checkout_url: Some(format!("https://pay.test/checkout/{reference}")),
            pay_code: Some(format!("88{n:010}")),
            reference,
            payment_name: req.method.clone(),
            instructions: Vec::new(),
        })
    }
}

/// Order notifier that keeps every update it was handed.
#[derive(Default)]
pub struct RecordingNotifier {
    fail: AtomicBool,
    pub updates: Mutex<Vec<OrderPaymentUpdate>>,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<OrderPaymentUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderNotifier for RecordingNotifier {
    async fn notify(&self, update: &OrderPaymentUpdate) -> Result<()> {
        self.updates.lock().unwrap().push(update.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::ServiceUnavailable {
                service: "order service",
                status: Some(503),
                detail: "mock outage".into(),
            });
        }
        Ok(())
    }
}
