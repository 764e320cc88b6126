use actix_web::{HttpResponse, post, web};
use chrono::Utc;
use common::mpesa::{CallbackAck, StkCallbackEnvelope};

use crate::payments;
use crate::state::AppState;

/// Receives the provider's asynchronous STK result. Every well-formed payload is
/// acknowledged, including ones for unknown or already settled payments and ones
/// that could not be stored. A lost callback is recovered by `?refresh=true` status reads.
#[post("/payments/mpesa/callback")]
pub async fn mpesa_callback(
    body: web::Json<StkCallbackEnvelope>,
    app_state: web::Data<AppState>,
) -> HttpResponse {
    let callback = body.into_inner().body.stk_callback;
    log::info!(
        "STK callback checkout_request_id={} result_code={} desc={}",
        callback.checkout_request_id,
        callback.result_code,
        callback.result_desc
    );

    match payments::handle_stk_callback(&app_state, &callback, Utc::now().naive_utc()).await {
        Ok(disposition) => log::debug!(
            "Callback {} handled: {:?}",
            callback.checkout_request_id,
            disposition
        ),
        Err(e) => log::error!(
            "Failed to apply callback {}: {}",
            callback.checkout_request_id,
            e
        ),
    }

    HttpResponse::Ok().json(CallbackAck::accepted())
}
