use actix_web::{Error, HttpResponse, error::InternalError, get, http::StatusCode, post, web};
use chrono::Utc;
use common::{PaymentError, PaymentSource, PaymentStatus};
use serde::Deserialize;

use crate::payments::{self, InitiatePaymentRequest};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
}

#[post("/payments/stk")]
pub async fn initiate_stk(
    body: web::Json<InitiatePaymentRequest>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PaymentError> {
    let initiated =
        payments::initiate_stk_payment(&app_state, body.into_inner(), Utc::now().naive_utc())
            .await?;
    Ok(HttpResponse::Created().json(initiated))
}

#[get("/payments/stk/{id}")]
pub async fn get_stk_status(
    path: web::Path<String>,
    query: web::Query<StatusQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PaymentError> {
    let id = path.into_inner();
    let tx =
        payments::stk_payment_status(&app_state, &id, query.refresh, Utc::now().naive_utc())
            .await?;
    Ok(HttpResponse::Ok().json(tx.status_view()))
}

#[get("/payments/stk")]
pub async fn list_stk(
    query: web::Query<ListQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<PaymentStatus>().map_err(|_| {
            InternalError::new(
                "Status must be one of created, awaiting_confirmation, confirmed, failed, expired.",
                StatusCode::BAD_REQUEST,
            )
        })?),
        None => None,
    };

    let transactions = app_state
        .db
        .get_pending_transactions(status)
        .await
        .map_err(|e| {
            log::error!("Failed to get pending transactions: {}", e);
            InternalError::new(
                "Failed to get payments. Please try again later.",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?;

    Ok(HttpResponse::Ok().json(transactions))
}

#[post("/payments/{source:stk|manual|qr}/{id}/finalize")]
pub async fn finalize(
    path: web::Path<(String, String)>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PaymentError> {
    let (source, id) = path.into_inner();
    let source = source
        .parse::<PaymentSource>()
        .map_err(|e| PaymentError::Validation(e.to_string()))?;
    let sale =
        payments::finalize_payment(&app_state, source, &id, Utc::now().naive_utc()).await?;
    Ok(HttpResponse::Ok().json(sale))
}
