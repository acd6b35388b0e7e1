#![allow(dead_code)]

pub mod billing_server;
pub mod mock;
pub mod port;

use std::sync::Arc;
use std::time::Duration;

use hosting_billing::config::{BillingConfig, BonusTier};
use hosting_billing::db::{Database, Isolation};
use hosting_billing::gate::SignatureGate;
use hosting_billing::intent::issuer::{IntentIssuer, NewDeposit};
use hosting_billing::ledger::Ledger;
use hosting_billing::notifier::RetryPolicy;
use hosting_billing::provider::CustomerInfo;
use hosting_billing::settlement::bonus::BonusPolicy;
use hosting_billing::settlement::engine::SettlementEngine;
use serde_json::json;

use mock::{MockProvider, RecordingNotifier};

pub const CALLBACK_KEY: &str = "merchant-private-key";

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        attempt_timeout: Duration::from_secs(2),
    }
}

pub fn customer() -> CustomerInfo {
    CustomerInfo {
        name: "Budi Santoso".into(),
        email: "budi@example.com".into(),
        phone: Some("081234567890".into()),
    }
}

pub fn new_deposit(user_id: &str, amount: i64, channel: &str) -> NewDeposit {
    NewDeposit {
        user_id: user_id.into(),
        amount,
        channel: channel.into(),
        customer: customer(),
        return_url: None,
        idempotency_key: None,
    }
}

/// Callback body as the provider would send it.
pub fn callback_body(reference: &str, merchant_ref: &str, status: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "reference": reference,
        "merchant_ref": merchant_ref,
        "payment_method": "BRI Virtual Account",
        "payment_method_code": "BRIVA",
        "total_amount": amount,
        "amount_received": amount,
        "is_closed_payment": 1,
        "status": status,
        "paid_at": 1767225600,
        "note": null
    }))
    .expect("encode callback")
}

/// Everything a settlement test needs, wired against one temp database.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub db: Database,
    pub ledger: Ledger,
    pub gate: SignatureGate,
    pub provider: Arc<MockProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub issuer: IntentIssuer,
    pub engine: SettlementEngine,
    cfg: BillingConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig::default())
    }

    pub fn with_bonus(tiers: Vec<BonusTier>) -> Self {
        Self::with_config(BillingConfig {
            bonus_tiers: tiers,
            ..BillingConfig::default()
        })
    }

    pub fn with_config(cfg: BillingConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("billing.sqlite3")).expect("open db");
        let ledger = Ledger::new(Isolation::Serializable);
        let gate = SignatureGate::new(CALLBACK_KEY);
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let issuer = IntentIssuer::new(
            cfg.clone(),
            db.clone(),
            provider.clone(),
            notifier.clone(),
        );
        let engine = SettlementEngine::new(
            db.clone(),
            ledger,
            gate.clone(),
            notifier.clone(),
            BonusPolicy::new(cfg.bonus_tiers.clone()),
        );
        Self {
            dir,
            db,
            ledger,
            gate,
            provider,
            notifier,
            issuer,
            engine,
            cfg,
        }
    }

    /// A second worker: its own connection to the same database file.
    pub fn second_worker(&self) -> (Database, SettlementEngine) {
        let db = Database::open(self.db.path().to_path_buf()).expect("open second handle");
        let engine = SettlementEngine::new(
            db.clone(),
            self.ledger,
            self.gate.clone(),
            self.notifier.clone(),
            BonusPolicy::new(self.cfg.bonus_tiers.clone()),
        );
        (db, engine)
    }

    pub fn sign(&self, body: &[u8]) -> String {
        self.gate.sign(body)
    }

    pub fn balance(&self, user_id: &str) -> i64 {
        self.db
            .with_conn(|conn| self.ledger.balance(conn, user_id))
            .expect("balance")
    }
}
