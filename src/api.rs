use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::db::Database;
use crate::error::{BillingError, ErrorClass};
use crate::intent::issuer::{IntentIssuer, NewDeposit, NewInvoice, PaymentRequest};
use crate::ledger::Ledger;
use crate::settlement::engine::SettlementEngine;

/// Header the provider puts the callback signature in.
pub const SIGNATURE_HEADER: &str = "x-callback-signature";

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub ledger: Ledger,
    pub issuer: IntentIssuer,
    pub engine: SettlementEngine,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/callback", post(callback))
        .route("/deposits", post(create_deposit))
        .route("/invoices", post(create_invoice))
        .route("/invoices/{id}/pay", post(initiate_payment))
        .route("/invoices/{id}/pay-balance", post(pay_from_balance))
        .route("/wallets/{user_id}", get(wallet))
        .with_state(state)
}

/// `BillingError` rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub BillingError);

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &BillingError) -> StatusCode {
    match err {
        BillingError::WalletNotFound { .. }
        | BillingError::EntryNotFound(_)
        | BillingError::DepositNotFound(_)
        | BillingError::InvoiceNotFound(_) => StatusCode::NOT_FOUND,
        BillingError::AccessDenied => StatusCode::FORBIDDEN,
        BillingError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        _ => match err.class() {
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Authentication => StatusCode::UNAUTHORIZED,
            ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);
        if matches!(err.class(), ErrorClass::Transient | ErrorClass::Internal) {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        let mut body = json!({
            "success": false,
            "code": err.code(),
            "message": err.public_message(),
        });
        if let Some(deficit) = err.deficit() {
            body["deficit"] = json!(deficit);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn callback(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let outcome = state.engine.handle_callback(&body, signature).await?;
    Ok(Json(json!({ "success": true, "result": outcome })))
}

async fn create_deposit(State(state): State<AppState>, Json(req): Json<NewDeposit>) -> ApiResult {
    let deposit = state.issuer.create_deposit(req).await?;
    Ok(Json(json!({ "success": true, "data": deposit })))
}

async fn create_invoice(State(state): State<AppState>, Json(req): Json<NewInvoice>) -> ApiResult {
    let invoice = state.issuer.create_invoice(req).await?;
    Ok(Json(json!({ "success": true, "data": invoice })))
}

async fn initiate_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PaymentRequest>,
) -> ApiResult {
    let invoice = state.issuer.initiate_payment(&id, req).await?;
    Ok(Json(json!({ "success": true, "data": invoice })))
}

#[derive(Debug, Deserialize)]
struct BalancePaymentRequest {
    user_id: String,
}

async fn pay_from_balance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BalancePaymentRequest>,
) -> ApiResult {
    let payment = state
        .engine
        .pay_invoice_from_balance(&id, &req.user_id)
        .await?;
    Ok(Json(json!({ "success": true, "data": payment })))
}

async fn wallet(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let ledger = state.ledger;
    let wallet = state
        .db
        .run(move |conn| ledger.wallet(conn, &user_id))
        .await?;
    Ok(Json(json!({ "success": true, "data": wallet })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_classes_to_statuses() {
        assert_eq!(
            status_for(&BillingError::SignatureInvalid),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&BillingError::InvoiceNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&BillingError::InvoiceAlreadyPaid("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BillingError::IdempotencyConflict("k".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BillingError::InsufficientBalance {
                current: 1,
                required: 2
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(&BillingError::ServiceUnavailable {
                service: "payment provider",
                status: Some(502),
                detail: String::new(),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
