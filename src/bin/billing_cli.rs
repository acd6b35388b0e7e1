use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use hosting_billing::config::OrderServiceConfig;
use hosting_billing::db::{Database, Isolation, now};
use hosting_billing::ledger::{Ledger, Posting, ReferenceKind};
use hosting_billing::notifier::RetryPolicy;
use hosting_billing::notifier::order::{HttpOrderNotifier, LogOnlyNotifier, OrderNotifier};
use hosting_billing::settlement::engine::SettlementEngine;
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "BILLING_DB_PATH")]
    db_path: PathBuf,

    /// Order service to notify about invoices expired by `sweep`.
    #[arg(long, env = "ORDER_SERVICE_URL")]
    order_service_url: Option<String>,

    #[arg(long, env = "ORDER_SERVICE_INTERNAL_KEY", hide_env_values = true)]
    order_service_internal_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Balance {
        #[arg(long)]
        user_id: String,
    },
    History {
        #[arg(long)]
        user_id: String,
    },
    /// Recompute the hash chain and balances of a wallet.
    Verify {
        #[arg(long)]
        user_id: String,
    },
    /// Manual balance adjustment.
    Credit {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        amount: i64,

        #[arg(long)]
        reference: String,

        #[arg(long, default_value = "Manual adjustment")]
        description: String,
    },
    Debit {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        amount: i64,

        #[arg(long)]
        reference: String,

        #[arg(long, default_value = "Manual adjustment")]
        description: String,
    },
    Refund {
        #[arg(long)]
        entry_id: String,

        #[arg(long)]
        reason: String,
    },
    /// Expire overdue deposits and invoices now.
    Sweep,
    /// List intents that need an operator.
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    hosting_billing::logging::init().ok();
    let args = Args::parse();

    let db = Database::open(args.db_path.clone()).context("open billing database")?;
    let ledger = Ledger::new(Isolation::Serializable);
    let order_service = args.order_service_url.clone().map(|base_url| OrderServiceConfig {
        base_url,
        internal_key: args.order_service_internal_key.clone(),
    });

    let out = match args.command {
        Command::Balance { user_id } => {
            let balance = db.with_conn(|conn| ledger.balance(conn, &user_id))?;
            json!({ "user_id": user_id, "balance": balance })
        }
        Command::History { user_id } => {
            let entries = db.with_conn(|conn| ledger.entries(conn, &user_id))?;
            json!({ "user_id": user_id, "entries": entries })
        }
        Command::Verify { user_id } => {
            let audit = db.with_conn(|conn| ledger.verify(conn, &user_id))?;
            let consistent = audit.is_consistent();
            let out = json!({ "consistent": consistent, "audit": audit });
            if !consistent {
                println!("{}", serde_json::to_string_pretty(&out)?);
                anyhow::bail!("ledger for user {user_id} is inconsistent");
            }
            out
        }
        Command::Credit {
            user_id,
            amount,
            reference,
            description,
        } => {
            let posting = Posting::new(user_id, amount, ReferenceKind::Adjustment, reference)
                .description(description);
            let entry = db
                .with_conn(|conn| ledger.credit(conn, &posting))
                .context("credit")?;
            json!(entry)
        }
        Command::Debit {
            user_id,
            amount,
            reference,
            description,
        } => {
            let posting = Posting::new(user_id, amount, ReferenceKind::Adjustment, reference)
                .description(description);
            let entry = db
                .with_conn(|conn| ledger.debit(conn, &posting))
                .context("debit")?;
            json!(entry)
        }
        Command::Refund { entry_id, reason } => {
            let entry = db
                .with_conn(|conn| ledger.refund(conn, &entry_id, &reason))
                .context("refund")?;
            json!(entry)
        }
        Command::Sweep => {
            let report = engine(order_service, db, ledger)?.expire_overdue(now()).await?;
            json!(report)
        }
        Command::Reconcile => {
            let report = engine(order_service, db, ledger)?.reconciliation().await?;
            json!(report)
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn engine(
    order_service: Option<OrderServiceConfig>,
    db: Database,
    ledger: Ledger,
) -> Result<SettlementEngine> {
    let notifier: Arc<dyn OrderNotifier> = match order_service {
        Some(cfg) => Arc::new(
            HttpOrderNotifier::new(cfg, RetryPolicy::default())
                .context("build order service client")?,
        ),
        None => Arc::new(LogOnlyNotifier),
    };
    Ok(SettlementEngine::maintenance(db, ledger, notifier))
}
