use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use hosting_billing::api::{self, AppState};
use hosting_billing::config::{BillingConfig, OrderServiceConfig, ProviderConfig, parse_bonus_tiers};
use hosting_billing::db::{Database, Isolation, now};
use hosting_billing::gate::SignatureGate;
use hosting_billing::intent::issuer::IntentIssuer;
use hosting_billing::ledger::Ledger;
use hosting_billing::notifier::RetryPolicy;
use hosting_billing::notifier::order::{HttpOrderNotifier, LogOnlyNotifier, OrderNotifier};
use hosting_billing::provider::http::HttpPaymentProvider;
use hosting_billing::settlement::bonus::BonusPolicy;
use hosting_billing::settlement::engine::SettlementEngine;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "BILLING_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: String,

    #[arg(long, env = "BILLING_DB_PATH")]
    db_path: PathBuf,

    #[arg(long, env = "PAYMENT_PROVIDER_BASE_URL")]
    provider_base_url: String,

    #[arg(long, env = "PAYMENT_PROVIDER_API_KEY", hide_env_values = true)]
    provider_api_key: String,

    #[arg(long, env = "PAYMENT_PROVIDER_PRIVATE_KEY", hide_env_values = true)]
    provider_private_key: String,

    #[arg(long, env = "PAYMENT_PROVIDER_MERCHANT_CODE")]
    provider_merchant_code: String,

    #[arg(long, env = "ORDER_SERVICE_URL")]
    order_service_url: Option<String>,

    #[arg(long, env = "ORDER_SERVICE_INTERNAL_KEY", hide_env_values = true)]
    order_service_internal_key: Option<String>,

    #[arg(long, env = "BILLING_MIN_DEPOSIT", default_value_t = 10_000)]
    min_deposit_amount: i64,

    #[arg(long, env = "BILLING_DEPOSIT_EXPIRY_HOURS", default_value_t = 24)]
    deposit_expiry_hours: u64,

    #[arg(long, env = "BILLING_INVOICE_EXPIRY_HOURS", default_value_t = 24)]
    invoice_expiry_hours: u64,

    #[arg(long, env = "BILLING_CURRENCY", default_value = "IDR")]
    currency: String,

    /// `min_amount:percent` pairs, e.g. `500000:5,1000000:10`.
    #[arg(long, env = "BILLING_BONUS_TIERS", default_value = "")]
    bonus_tiers: String,

    #[arg(long, env = "BILLING_RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    #[arg(long, env = "BILLING_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,
}

impl Args {
    fn billing_config(&self) -> Result<BillingConfig> {
        Ok(BillingConfig {
            min_deposit_amount: self.min_deposit_amount,
            deposit_expiry: Duration::from_secs(self.deposit_expiry_hours * 3600),
            invoice_expiry: Duration::from_secs(self.invoice_expiry_hours * 3600),
            default_currency: self.currency.clone(),
            bonus_tiers: parse_bonus_tiers(&self.bonus_tiers).context("parse bonus tiers")?,
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                ..RetryPolicy::default()
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    hosting_billing::logging::init().ok();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen_addr.parse().context("parse listen_addr")?;
    let cfg = args.billing_config()?;

    let db = Database::open(args.db_path.clone()).context("open billing database")?;
    let ledger = Ledger::new(Isolation::Serializable);

    let provider_cfg = ProviderConfig {
        base_url: args.provider_base_url.clone(),
        api_key: args.provider_api_key.clone(),
        private_key: args.provider_private_key.clone(),
        merchant_code: args.provider_merchant_code.clone(),
    };
    let gate = SignatureGate::new(&provider_cfg.private_key);
    let provider = Arc::new(
        HttpPaymentProvider::new(provider_cfg, cfg.retry).context("build provider client")?,
    );

    let notifier: Arc<dyn OrderNotifier> = match &args.order_service_url {
        Some(base_url) => Arc::new(
            HttpOrderNotifier::new(
                OrderServiceConfig {
                    base_url: base_url.clone(),
                    internal_key: args.order_service_internal_key.clone(),
                },
                cfg.retry,
            )
            .context("build order service client")?,
        ),
        None => {
            tracing::warn!("no order service configured, notifications are only logged");
            Arc::new(LogOnlyNotifier)
        }
    };

    let engine = SettlementEngine::new(
        db.clone(),
        ledger,
        gate,
        notifier.clone(),
        BonusPolicy::new(cfg.bonus_tiers.clone()),
    );
    let issuer = IntentIssuer::new(cfg.clone(), db.clone(), provider, notifier);

    spawn_expiry_worker(
        engine.clone(),
        Duration::from_secs(args.sweep_interval_secs),
    );

    let app = api::router(AppState {
        db,
        ledger,
        issuer,
        engine,
    });

    tracing::info!(%listen_addr, "starting billing HTTP server");
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("bind listen_addr")?;
    axum::serve(listener, app).await.context("serve HTTP")?;

    Ok(())
}

fn spawn_expiry_worker(engine: SettlementEngine, poll_interval: Duration) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = engine.expire_overdue(now()).await {
                tracing::warn!(error = %err, "expiry worker error");
            }
            tokio::time::sleep(poll_interval).await;
        }
    });
}
