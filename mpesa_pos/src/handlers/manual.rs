use actix_web::{HttpResponse, get, post, web};
use chrono::Utc;
use common::{PaymentChannel, PaymentError};

use crate::payments::{self, ManualPaymentRequest, QrPaymentRequest, VerifyReceiptRequest};
use crate::state::AppState;

#[post("/payments/manual")]
pub async fn record_manual(
    body: web::Json<ManualPaymentRequest>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PaymentError> {
    let confirmed =
        payments::record_manual_payment(&app_state, body.into_inner(), Utc::now().naive_utc())
            .await?;
    Ok(HttpResponse::Created().json(confirmed))
}

#[post("/payments/qr")]
pub async fn create_qr(
    body: web::Json<QrPaymentRequest>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PaymentError> {
    let payment =
        payments::create_qr_payment(&app_state, body.into_inner(), Utc::now().naive_utc()).await?;
    Ok(HttpResponse::Created().json(payment))
}

#[post("/payments/qr/{id}/verify")]
pub async fn verify_qr(
    path: web::Path<String>,
    body: web::Json<VerifyReceiptRequest>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PaymentError> {
    let id = path.into_inner();
    let confirmed =
        payments::verify_qr_payment(&app_state, &id, body.into_inner(), Utc::now().naive_utc())
            .await?;
    Ok(HttpResponse::Ok().json(confirmed))
}

#[get("/payments/{channel:manual|qr}/{id}")]
pub async fn get_manual_status(
    path: web::Path<(String, String)>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PaymentError> {
    let (channel, id) = path.into_inner();
    let channel = channel
        .parse::<PaymentChannel>()
        .map_err(|e| PaymentError::Validation(e.to_string()))?;
    let payment =
        payments::manual_payment_status(&app_state, channel, &id, Utc::now().naive_utc()).await?;
    Ok(HttpResponse::Ok().json(payment.status_view()))
}
