mod support;

use std::time::Duration;

use anyhow::{Context as _, Result};

use hosting_billing::config::BillingConfig;
use hosting_billing::error::{BillingError, ErrorClass};
use hosting_billing::intent::issuer::{NewDeposit, NewInvoice, PaymentRequest};
use hosting_billing::intent::{DepositStatus, INVOICE_PREFIX, InvoiceStatus, store};
use hosting_billing::notifier::order::OrderPaymentStatus;

use support::{Harness, customer, new_deposit};

fn new_invoice(order_id: &str, amount: i64) -> NewInvoice {
    NewInvoice {
        order_id: order_id.into(),
        user_id: "user-1".into(),
        amount,
        currency: None,
        description: None,
    }
}

fn pay_with(channel: &str) -> PaymentRequest {
    PaymentRequest {
        channel: channel.into(),
        user_id: Some("user-1".into()),
        customer: customer(),
        items: Vec::new(),
        return_url: Some("https://panel.example.com/invoices".into()),
    }
}

#[tokio::test]
async fn deposit_charges_amount_plus_channel_fee() -> Result<()> {
    let h = Harness::new();
    let deposit = h
        .issuer
        .create_deposit(new_deposit("user-1", 100_000, "briva"))
        .await?;

    assert_eq!(deposit.status, DepositStatus::Pending);
    assert_eq!(deposit.channel, "BRIVA");
    assert_eq!(deposit.fee, 4_000);
    assert_eq!(deposit.total_amount, 104_000);
    assert!(deposit.processed_at.is_none());
    assert!(deposit.provider_reference.is_some());
    assert!(deposit.checkout_url.is_some());
    assert!(deposit.expires_at > deposit.created_at);

    let requests = h.provider.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].amount, 104_000);
    assert_eq!(requests[0].merchant_ref, deposit.merchant_ref);
    assert_eq!(requests[0].order_items[0].price, 104_000);

    let stored = h
        .db
        .with_conn(|conn| Ok(store::get_deposit(conn, &deposit.id)?))?
        .context("deposit row")?;
    assert_eq!(stored.total_amount, 104_000);
    assert_eq!(stored.provider_reference, deposit.provider_reference);
    assert_eq!(stored.status, DepositStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn percentage_fee_respects_minimum() -> Result<()> {
    let h = Harness::new();
    // 750 + 0.7% of 20000 = 890, raised to the 1000 minimum
    let small = h
        .issuer
        .create_deposit(new_deposit("user-1", 20_000, "QRIS"))
        .await?;
    assert_eq!(small.fee, 1_000);

    // 750 + 0.7% of 1000000 = 7750
    let large = h
        .issuer
        .create_deposit(new_deposit("user-1", 1_000_000, "QRIS"))
        .await?;
    assert_eq!(large.fee, 7_750);
    assert_eq!(large.total_amount, 1_007_750);
    Ok(())
}

#[tokio::test]
async fn provider_failure_leaves_no_deposit_behind() -> Result<()> {
    let h = Harness::new();
    h.provider.set_failing(true);

    let err = h
        .issuer
        .create_deposit(new_deposit("user-1", 100_000, "BRIVA"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, BillingError::ServiceUnavailable { .. }),
        "{err:?}"
    );
    assert_eq!(h.provider.request_count(), 1);

    let count = h
        .db
        .with_conn(|conn| Ok(store::count_deposits_for_user(conn, "user-1")?))?;
    assert_eq!(count, 0);

    h.provider.set_failing(false);
    h.issuer
        .create_deposit(new_deposit("user-1", 100_000, "BRIVA"))
        .await?;
    let count = h
        .db
        .with_conn(|conn| Ok(store::count_deposits_for_user(conn, "user-1")?))?;
    assert_eq!(count, 1);
    Ok(())
}

#[tokio::test]
async fn unusable_channels_are_rejected_and_rolled_back() -> Result<()> {
    let h = Harness::new();

    let err = h
        .issuer
        .create_deposit(new_deposit("user-1", 100_000, "DOGECOIN"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UnknownChannel(_)), "{err:?}");

    let err = h
        .issuer
        .create_deposit(new_deposit("user-1", 100_000, "OVO"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ChannelInactive(_)), "{err:?}");

    assert_eq!(h.provider.request_count(), 0);
    let count = h
        .db
        .with_conn(|conn| Ok(store::count_deposits_for_user(conn, "user-1")?))?;
    assert_eq!(count, 0);
    Ok(())
}

#[tokio::test]
async fn deposit_amount_is_validated_before_anything_else() -> Result<()> {
    let h = Harness::new();

    let err = h
        .issuer
        .create_deposit(new_deposit("user-1", 5_000, "BRIVA"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::AmountBelowMinimum {
            amount: 5_000,
            minimum: 10_000
        }
    ));

    let err = h
        .issuer
        .create_deposit(new_deposit("user-1", 0, "BRIVA"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidAmount { amount: 0 }));

    assert_eq!(h.provider.request_count(), 0);
    Ok(())
}

#[tokio::test]
async fn reused_idempotency_key_returns_the_original_deposit() -> Result<()> {
    let h = Harness::new();
    let keyed = |user: &str, amount| NewDeposit {
        idempotency_key: Some("client-key-1".into()),
        ..new_deposit(user, amount, "BRIVA")
    };

    let first = h.issuer.create_deposit(keyed("user-1", 100_000)).await?;
    let retried = h.issuer.create_deposit(keyed("user-1", 100_000)).await?;
    assert_eq!(retried.id, first.id);
    assert_eq!(retried.provider_reference, first.provider_reference);
    assert_eq!(retried.total_amount, 104_000);
    assert_eq!(h.provider.request_count(), 1);

    let err = h
        .issuer
        .create_deposit(keyed("user-1", 250_000))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::IdempotencyConflict(_)), "{err:?}");
    assert_eq!(err.code(), "IDEMPOTENCY_CONFLICT");
    assert_eq!(err.class(), ErrorClass::Conflict);

    let err = h
        .issuer
        .create_deposit(keyed("user-2", 100_000))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::IdempotencyConflict(_)), "{err:?}");

    assert_eq!(h.provider.request_count(), 1);
    let count = h
        .db
        .with_conn(|conn| Ok(store::count_deposits_for_user(conn, "user-1")?))?;
    assert_eq!(count, 1);
    Ok(())
}

#[tokio::test]
async fn idempotency_key_is_free_again_after_a_rolled_back_attempt() -> Result<()> {
    let h = Harness::new();
    let req = NewDeposit {
        idempotency_key: Some("client-key-2".into()),
        ..new_deposit("user-1", 100_000, "BRIVA")
    };

    h.provider.set_failing(true);
    h.issuer.create_deposit(req.clone()).await.unwrap_err();

    h.provider.set_failing(false);
    let deposit = h.issuer.create_deposit(req).await?;
    assert_eq!(deposit.idempotency_key, "client-key-2");
    assert!(deposit.provider_reference.is_some());
    assert_eq!(h.provider.request_count(), 2);
    Ok(())
}

#[tokio::test]
async fn create_invoice_is_idempotent_per_order() -> Result<()> {
    let h = Harness::new();
    let first = h
        .issuer
        .create_invoice(new_invoice("order-1", 250_000))
        .await?;
    assert_eq!(first.status, InvoiceStatus::Pending);
    assert_eq!(first.currency, "IDR");
    assert!(first.invoice_number.starts_with(INVOICE_PREFIX));
    assert!(first.payment.is_none());

    let second = h
        .issuer
        .create_invoice(new_invoice("order-1", 999_999))
        .await?;
    assert_eq!(second.id, first.id);
    assert_eq!(second.amount, 250_000);

    let other = h
        .issuer
        .create_invoice(new_invoice("order-2", 10_000))
        .await?;
    assert_ne!(other.id, first.id);
    assert_ne!(other.invoice_number, first.invoice_number);

    let err = h
        .issuer
        .create_invoice(new_invoice("order-3", -1))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidAmount { .. }));
    Ok(())
}

#[tokio::test]
async fn initiate_payment_snapshots_channel_and_fee() -> Result<()> {
    let h = Harness::new();
    let invoice = h
        .issuer
        .create_invoice(new_invoice("order-1", 150_000))
        .await?;

    let updated = h
        .issuer
        .initiate_payment(&invoice.id, pay_with("BRIVA"))
        .await?;
    assert_eq!(updated.status, InvoiceStatus::Pending);
    let payment = updated.payment.context("payment snapshot")?;
    assert_eq!(payment.channel, "BRIVA");
    assert_eq!(payment.method, "BRI Virtual Account");
    assert_eq!(payment.fee, 4_000);
    assert!(payment.url.is_some());
    assert!(payment.code.is_some());

    let requests = h.provider.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].merchant_ref, invoice.invoice_number);
    assert_eq!(requests[0].amount, 154_000);
    assert_eq!(requests[0].order_items.len(), 1);
    assert_eq!(requests[0].order_items[0].name, format!("Invoice {}", invoice.invoice_number));
    Ok(())
}

#[tokio::test]
async fn initiate_payment_failure_keeps_invoice_payable() -> Result<()> {
    let h = Harness::new();
    let invoice = h
        .issuer
        .create_invoice(new_invoice("order-1", 150_000))
        .await?;

    h.provider.set_failing(true);
    let err = h
        .issuer
        .initiate_payment(&invoice.id, pay_with("BRIVA"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ServiceUnavailable { .. }));

    let stored = h
        .db
        .with_conn(|conn| Ok(store::get_invoice(conn, &invoice.id)?))?
        .context("invoice row")?;
    assert_eq!(stored.status, InvoiceStatus::Pending);
    assert!(stored.payment.is_none());

    h.provider.set_failing(false);
    h.issuer
        .initiate_payment(&invoice.id, pay_with("QRIS"))
        .await?;
    Ok(())
}

#[tokio::test]
async fn initiate_payment_rejects_wrong_owner_and_settled_invoices() -> Result<()> {
    let h = Harness::new();
    let invoice = h
        .issuer
        .create_invoice(new_invoice("order-1", 150_000))
        .await?;

    let mut stranger = pay_with("BRIVA");
    stranger.user_id = Some("user-2".into());
    let err = h
        .issuer
        .initiate_payment(&invoice.id, stranger)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AccessDenied));

    let err = h
        .issuer
        .initiate_payment("no-such-invoice", pay_with("BRIVA"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvoiceNotFound(_)));

    let body = support::callback_body("T0001PAID", &invoice.invoice_number, "PAID", 150_000);
    h.engine
        .handle_callback(&body, Some(&h.sign(&body)))
        .await?;
    let err = h
        .issuer
        .initiate_payment(&invoice.id, pay_with("BRIVA"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvoiceAlreadyPaid(_)));
    assert_eq!(h.provider.request_count(), 0);
    Ok(())
}

#[tokio::test]
async fn initiate_payment_on_overdue_invoice_expires_it() -> Result<()> {
    let h = Harness::with_config(BillingConfig {
        invoice_expiry: Duration::ZERO,
        ..BillingConfig::default()
    });
    let invoice = h
        .issuer
        .create_invoice(new_invoice("order-1", 150_000))
        .await?;

    let err = h
        .issuer
        .initiate_payment(&invoice.id, pay_with("BRIVA"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvoiceExpired(_)));
    assert_eq!(h.provider.request_count(), 0);

    let stored = h
        .db
        .with_conn(|conn| Ok(store::get_invoice(conn, &invoice.id)?))?
        .context("invoice row")?;
    assert_eq!(stored.status, InvoiceStatus::Expired);

    let updates = h.notifier.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].order_id, "order-1");
    assert_eq!(updates[0].status, OrderPaymentStatus::Failed);

    // a second attempt sees the stored status; no second notification
    let err = h
        .issuer
        .initiate_payment(&invoice.id, pay_with("BRIVA"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvoiceExpired(_)));
    assert_eq!(h.notifier.updates().len(), 1);
    Ok(())
}
