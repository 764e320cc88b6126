use actix_web::web;
use chrono::{NaiveDateTime, Utc};
use common::mpesa::{CallbackOutcome, QrRequest, StkCallback, StkPushRequest, StkQueryOutcome};
use common::{
    CartLine, CartSnapshotLine, Database, ManualPayment, PaymentChannel, PaymentError,
    PaymentSource, PaymentStatus, PendingTransaction, Result, SaleWithItems, cart_total,
    generate_reference, is_unique_violation, normalize_phone, validate_cart,
    validate_receipt_number,
};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub amount: i64,
    pub phone: String,
    pub cart: Vec<CartLine>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualPaymentRequest {
    pub amount: i64,
    #[serde(default)]
    pub phone: Option<String>,
    pub cart: Vec<CartLine>,
    pub receipt_number: String,
}

#[derive(Debug, Deserialize)]
pub struct QrPaymentRequest {
    pub amount: i64,
    #[serde(default)]
    pub phone: Option<String>,
    pub cart: Vec<CartLine>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyReceiptRequest {
    pub receipt_number: String,
}

#[derive(Debug, Serialize)]
pub struct StkInitiated {
    pub id: String,
    pub status: PaymentStatus,
    pub checkout_request_id: Option<String>,
    pub customer_message: String,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct ConfirmedSale {
    pub payment: ManualPayment,
    pub sale: SaleWithItems,
}

/// What a provider callback did to the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackDisposition {
    Confirmed { sale_id: Option<i64> },
    Failed,
    /// The record was already terminal (or just expired) and kept its state.
    Ignored(PaymentStatus),
    UnknownCorrelationId,
}

/// Prices the cart from the catalog and checks it adds up to `amount`.
pub async fn build_cart_snapshot(
    db: &Database,
    amount: i64,
    cart: &[CartLine],
) -> Result<Vec<CartSnapshotLine>> {
    if amount <= 0 {
        return Err(PaymentError::Validation(
            "Amount must be greater than zero".to_string(),
        ));
    }
    validate_cart(cart)?;

    let mut lines = Vec::with_capacity(cart.len());
    for line in cart {
        let product = db.get_product(line.product_id).await?.ok_or_else(|| {
            PaymentError::Validation(format!("Unknown product {}", line.product_id))
        })?;
        lines.push(CartSnapshotLine::from_product(&product, line.quantity)?);
    }

    let total = cart_total(&lines);
    if total != amount {
        return Err(PaymentError::Validation(format!(
            "Amount {} does not match cart total {}",
            amount, total
        )));
    }
    Ok(lines)
}

pub async fn initiate_stk_payment(
    state: &AppState,
    request: InitiatePaymentRequest,
    now: NaiveDateTime,
) -> Result<StkInitiated> {
    let phone = normalize_phone(&request.phone)?;
    let cart = build_cart_snapshot(&state.db, request.amount, &request.cart).await?;

    let pending = PendingTransaction::new(
        request.session_id,
        request.amount,
        phone,
        cart,
        now,
        state.payment_timeout,
    );
    state.db.save_pending_transaction(&pending).await?;
    log::info!(
        "Created pending transaction id={} amount={} phone={}",
        pending.id,
        pending.amount,
        pending.phone
    );

    let push = StkPushRequest {
        amount: pending.amount,
        phone: pending.phone.clone(),
        account_reference: pending.id.chars().take(8).collect::<String>().to_uppercase(),
        description: "POS checkout".to_string(),
    };
    let accepted = match state.provider.stk_push(&push).await {
        Ok(accepted) => accepted,
        Err(e) => {
            log::error!("STK push failed for transaction id={}: {}", pending.id, e);
            state
                .db
                .mark_pending_failed(&pending.id, None, &e.to_string(), now)
                .await?;
            return Err(e);
        }
    };

    let moved = state
        .db
        .mark_awaiting_confirmation(
            &pending.id,
            &accepted.merchant_request_id,
            &accepted.checkout_request_id,
            now,
        )
        .await?;
    if !moved {
        return Err(PaymentError::Conflict(format!(
            "Transaction {} left the created state before the provider answered",
            pending.id
        )));
    }

    Ok(StkInitiated {
        id: pending.id,
        status: PaymentStatus::AwaitingConfirmation,
        checkout_request_id: Some(accepted.checkout_request_id),
        customer_message: accepted.customer_message,
        expires_at: pending.expires_at,
    })
}

pub async fn handle_stk_callback(
    state: &AppState,
    callback: &StkCallback,
    now: NaiveDateTime,
) -> Result<CallbackDisposition> {
    let Some(pending) = state
        .db
        .get_pending_by_checkout_id(&callback.checkout_request_id)
        .await?
    else {
        log::warn!(
            "Callback for unknown checkout request {} (result_code={})",
            callback.checkout_request_id,
            callback.result_code
        );
        return Ok(CallbackDisposition::UnknownCorrelationId);
    };

    if pending.is_overdue(now) {
        let expired = state.db.expire_pending_transactions(now).await?;
        log::warn!(
            "Late callback for transaction id={}; expired {} overdue record(s)",
            pending.id,
            expired
        );
        return Ok(CallbackDisposition::Ignored(PaymentStatus::Expired));
    }

    match callback.outcome() {
        CallbackOutcome::Success {
            receipt_number,
            amount,
            ..
        } => {
            if pending.status == PaymentStatus::Confirmed && pending.receipt_number.is_none() {
                if state.db.receipt_in_use(&receipt_number).await? {
                    let note = format!(
                        "Callback receipt {} already settled another payment",
                        receipt_number
                    );
                    log::warn!("Transaction id={}: {}", pending.id, note);
                    state
                        .db
                        .annotate_confirmed(&callback.checkout_request_id, &note, now)
                        .await?;
                } else {
                    state
                        .db
                        .backfill_receipt(&callback.checkout_request_id, &receipt_number, now)
                        .await?;
                }
                return Ok(CallbackDisposition::Ignored(pending.status));
            }
            if pending.status.is_terminal() {
                log::info!(
                    "Ignoring repeated callback for transaction id={} in state {}",
                    pending.id,
                    pending.status
                );
                return Ok(CallbackDisposition::Ignored(pending.status));
            }

            if let Some(paid) = amount.filter(|paid| *paid != pending.amount) {
                let reason = format!("Paid amount {} does not match expected {}", paid, pending.amount);
                return fail_pending(state, &pending, 0, &reason, now).await;
            }
            if state.db.receipt_in_use(&receipt_number).await? {
                let reason = format!("Receipt {} already settled another payment", receipt_number);
                return fail_pending(state, &pending, 0, &reason, now).await;
            }

            let confirmed = state
                .db
                .confirm_pending_transaction(
                    &callback.checkout_request_id,
                    Some(&receipt_number),
                    callback.result_code,
                    &callback.result_desc,
                    now,
                )
                .await?;
            if !confirmed {
                let current = current_status(state, &pending.id).await?;
                return Ok(CallbackDisposition::Ignored(current));
            }
            log::info!(
                "Transaction id={} confirmed with receipt {}",
                pending.id,
                receipt_number
            );

            // The callback is acknowledged even when finalization fails; it can be retried.
            let sale_id = match finalize_payment(state, PaymentSource::Stk, &pending.id, now).await {
                Ok(sale) => Some(sale.sale.id),
                Err(e) => {
                    log::error!("Failed to finalize transaction id={}: {}", pending.id, e);
                    None
                }
            };
            Ok(CallbackDisposition::Confirmed { sale_id })
        }
        CallbackOutcome::Failure {
            result_code,
            reason,
        } => {
            if pending.status.is_terminal() {
                return Ok(CallbackDisposition::Ignored(pending.status));
            }
            fail_pending(state, &pending, result_code, &reason, now).await
        }
    }
}

async fn fail_pending(
    state: &AppState,
    pending: &PendingTransaction,
    result_code: i64,
    reason: &str,
    now: NaiveDateTime,
) -> Result<CallbackDisposition> {
    if state
        .db
        .mark_pending_failed(&pending.id, Some(result_code), reason, now)
        .await?
    {
        log::warn!("Transaction id={} failed: {}", pending.id, reason);
        Ok(CallbackDisposition::Failed)
    } else {
        Ok(CallbackDisposition::Ignored(
            current_status(state, &pending.id).await?,
        ))
    }
}

async fn current_status(state: &AppState, id: &str) -> Result<PaymentStatus> {
    state
        .db
        .get_pending_transaction(id)
        .await?
        .map(|p| p.status)
        .ok_or_else(|| PaymentError::NotFound(format!("Transaction {} not found", id)))
}

/// Current state of an STK payment. Overdue records are expired on read; with `refresh`
/// the provider is asked about records still awaiting confirmation.
pub async fn stk_payment_status(
    state: &AppState,
    id: &str,
    refresh: bool,
    now: NaiveDateTime,
) -> Result<PendingTransaction> {
    let pending = state
        .db
        .get_pending_transaction(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Transaction {} not found", id)))?;

    if pending.is_overdue(now) {
        state.db.expire_pending_transactions(now).await?;
    } else if refresh && pending.status == PaymentStatus::AwaitingConfirmation {
        if let Some(checkout_request_id) = pending.checkout_request_id.as_deref() {
            refresh_from_provider(state, &pending, checkout_request_id, now).await?;
        }
    } else {
        return Ok(pending);
    }

    state
        .db
        .get_pending_transaction(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Transaction {} not found", id)))
}

async fn refresh_from_provider(
    state: &AppState,
    pending: &PendingTransaction,
    checkout_request_id: &str,
    now: NaiveDateTime,
) -> Result<()> {
    match state.provider.query_stk(checkout_request_id).await {
        Ok(StkQueryOutcome::Pending) => {
            log::debug!("Transaction id={} still processing at provider", pending.id);
        }
        Ok(StkQueryOutcome::Completed {
            result_code: 0,
            result_desc,
        }) => {
            let confirmed = state
                .db
                .confirm_pending_transaction(checkout_request_id, None, 0, &result_desc, now)
                .await?;
            if confirmed {
                log::info!("Transaction id={} confirmed by status query", pending.id);
                if let Err(e) = finalize_payment(state, PaymentSource::Stk, &pending.id, now).await
                {
                    log::error!("Failed to finalize transaction id={}: {}", pending.id, e);
                }
            }
        }
        Ok(StkQueryOutcome::Completed {
            result_code,
            result_desc,
        }) => {
            state
                .db
                .mark_pending_failed(&pending.id, Some(result_code), &result_desc, now)
                .await?;
        }
        Err(e) => {
            log::warn!("Status query for transaction id={} failed: {}", pending.id, e);
        }
    }
    Ok(())
}

/// Turns a confirmed payment into a sale. Safe to call repeatedly.
pub async fn finalize_payment(
    state: &AppState,
    source: PaymentSource,
    id: &str,
    now: NaiveDateTime,
) -> Result<SaleWithItems> {
    let not_found = || PaymentError::NotFound(format!("No {} payment with id {}", source, id));
    let (status, confirmed) = match source {
        PaymentSource::Stk => {
            let pending = state
                .db
                .get_pending_transaction(id)
                .await?
                .ok_or_else(not_found)?;
            (pending.status, pending.confirmed_payment())
        }
        PaymentSource::Manual | PaymentSource::Qr => {
            let payment = state
                .db
                .get_manual_payment(id)
                .await?
                .filter(|p| PaymentSource::from(p.channel) == source)
                .ok_or_else(not_found)?;
            (payment.status, payment.confirmed_payment())
        }
    };
    let confirmed = confirmed.ok_or_else(|| {
        PaymentError::Conflict(format!(
            "Payment {} is {}; only confirmed payments can be finalized",
            id, status
        ))
    })?;

    match state.db.finalize_sale(&confirmed, now).await {
        Ok(outcome) => {
            if !outcome.is_new() {
                log::info!("Payment {} was already finalized", id);
            }
            Ok(outcome.into_sale())
        }
        Err(e) if is_unique_violation(&e) => {
            // Another request created the sale between our check and insert.
            state
                .db
                .get_sale_by_payment(source, id)
                .await?
                .ok_or(PaymentError::Internal(e))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn record_manual_payment(
    state: &AppState,
    request: ManualPaymentRequest,
    now: NaiveDateTime,
) -> Result<ConfirmedSale> {
    let receipt = validate_receipt_number(&request.receipt_number)?;
    let phone = request.phone.as_deref().map(normalize_phone).transpose()?;
    let cart = build_cart_snapshot(&state.db, request.amount, &request.cart).await?;
    ensure_receipt_unused(&state.db, &receipt).await?;

    let payment = ManualPayment::new(
        PaymentChannel::Manual,
        request.amount,
        phone,
        cart,
        now,
        state.payment_timeout,
    );
    state.db.save_manual_payment(&payment).await?;
    log::info!(
        "Recorded manual payment id={} amount={} receipt={}",
        payment.id,
        payment.amount,
        receipt
    );

    confirm_manual(state, &payment.id, &receipt, now).await
}

pub async fn create_qr_payment(
    state: &AppState,
    request: QrPaymentRequest,
    now: NaiveDateTime,
) -> Result<ManualPayment> {
    let phone = request.phone.as_deref().map(normalize_phone).transpose()?;
    let cart = build_cart_snapshot(&state.db, request.amount, &request.cart).await?;

    let mut payment = ManualPayment::new(
        PaymentChannel::Qr,
        request.amount,
        phone,
        cart,
        now,
        state.payment_timeout,
    );
    let reference = generate_reference("QR", 8);
    payment.qr_reference = Some(reference.clone());
    state.db.save_manual_payment(&payment).await?;

    let qr = match state
        .provider
        .generate_qr(&QrRequest {
            amount: payment.amount,
            reference,
        })
        .await
    {
        Ok(qr) => qr,
        Err(e) => {
            log::error!("QR generation failed for payment id={}: {}", payment.id, e);
            state
                .db
                .mark_manual_failed(&payment.id, &e.to_string(), now)
                .await?;
            return Err(e);
        }
    };

    let moved = state
        .db
        .mark_qr_awaiting(&payment.id, &qr.request_id, &qr.image, now)
        .await?;
    if !moved {
        state.db.expire_manual_payments(now).await?;
        let current = get_manual(&state.db, PaymentChannel::Qr, &payment.id).await?;
        return Err(PaymentError::Conflict(format!(
            "Payment {} is {} and cannot show a QR code",
            payment.id, current.status
        )));
    }
    get_manual(&state.db, PaymentChannel::Qr, &payment.id).await
}

pub async fn verify_qr_payment(
    state: &AppState,
    id: &str,
    request: VerifyReceiptRequest,
    now: NaiveDateTime,
) -> Result<ConfirmedSale> {
    let receipt = validate_receipt_number(&request.receipt_number)?;
    let payment = get_manual(&state.db, PaymentChannel::Qr, id).await?;

    if payment.status == PaymentStatus::Confirmed
        && payment.receipt_number.as_deref() == Some(receipt.as_str())
    {
        let sale = finalize_payment(state, PaymentSource::Qr, id, now).await?;
        let payment = get_manual(&state.db, PaymentChannel::Qr, id).await?;
        return Ok(ConfirmedSale { payment, sale });
    }
    ensure_receipt_unused(&state.db, &receipt).await?;

    confirm_manual(state, id, &receipt, now).await
}

pub async fn manual_payment_status(
    state: &AppState,
    channel: PaymentChannel,
    id: &str,
    now: NaiveDateTime,
) -> Result<ManualPayment> {
    let payment = get_manual(&state.db, channel, id).await?;
    if payment.is_overdue(now) {
        state.db.expire_manual_payments(now).await?;
        return get_manual(&state.db, channel, id).await;
    }
    Ok(payment)
}

async fn get_manual(db: &Database, channel: PaymentChannel, id: &str) -> Result<ManualPayment> {
    db.get_manual_payment(id)
        .await?
        .filter(|p| p.channel == channel)
        .ok_or_else(|| PaymentError::NotFound(format!("Payment {} not found", id)))
}

async fn ensure_receipt_unused(db: &Database, receipt: &str) -> Result<()> {
    if db.receipt_in_use(receipt).await? {
        return Err(PaymentError::Conflict(format!(
            "Receipt {} has already been used",
            receipt
        )));
    }
    Ok(())
}

async fn confirm_manual(
    state: &AppState,
    id: &str,
    receipt: &str,
    now: NaiveDateTime,
) -> Result<ConfirmedSale> {
    match state.db.confirm_manual_payment(id, receipt, now).await {
        Ok(true) => {}
        Ok(false) => {
            let current = state
                .db
                .get_manual_payment(id)
                .await?
                .ok_or_else(|| PaymentError::NotFound(format!("Payment {} not found", id)))?;
            if current.is_overdue(now) {
                state.db.expire_manual_payments(now).await?;
                return Err(PaymentError::Expired(format!(
                    "Payment {} expired before it was verified",
                    id
                )));
            }
            return Err(PaymentError::Conflict(format!(
                "Payment {} is {} and cannot be verified",
                id, current.status
            )));
        }
        Err(e) if is_unique_violation(&e) => {
            return Err(PaymentError::Conflict(format!(
                "Receipt {} has already been used",
                receipt
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let payment = state
        .db
        .get_manual_payment(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Payment {} not found", id)))?;
    let sale = finalize_payment(state, payment.channel.into(), id, now).await?;
    let payment = get_manual(&state.db, payment.channel, id).await?;
    Ok(ConfirmedSale { payment, sale })
}

pub async fn start_expiry_sweeper(data: web::Data<AppState>, interval_seconds: u64) {
    loop {
        let now = Utc::now().naive_utc();
        match data.db.expire_overdue_payments(now).await {
            Ok((0, 0)) => {}
            Ok((stk, manual)) => log::info!(
                "Expired {} STK and {} manual/QR payment(s) past their deadline",
                stk,
                manual
            ),
            Err(e) => log::error!("Error expiring stale payments: {:#}", e),
        }
        sleep(Duration::from_secs(interval_seconds)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failure_callback, now, success_callback, test_context};
    use std::sync::atomic::Ordering;

    fn stk_request(product_id: i64, quantity: i64, amount: i64) -> InitiatePaymentRequest {
        InitiatePaymentRequest {
            amount,
            phone: "0712345678".to_string(),
            cart: vec![CartLine {
                product_id,
                quantity,
            }],
            session_id: Some("till-1".to_string()),
        }
    }

    #[tokio::test]
    async fn stk_payment_confirmed_by_callback_creates_one_sale() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        assert_eq!(started.status, PaymentStatus::AwaitingConfirmation);
        let checkout = started.checkout_request_id.clone().unwrap();

        let disposition = handle_stk_callback(
            &ctx.state,
            &success_callback(&checkout, "QWE123", 500),
            now(),
        )
        .await
        .unwrap();
        let CallbackDisposition::Confirmed { sale_id: Some(sale_id) } = disposition else {
            panic!("unexpected disposition {disposition:?}");
        };

        let tx = ctx.state.db.get_pending_transaction(&started.id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Confirmed);
        assert_eq!(tx.receipt_number.as_deref(), Some("QWE123"));
        assert_eq!(tx.phone, "254712345678");
        assert_eq!(tx.sale_id, Some(sale_id));

        let sales = ctx.state.db.get_sales().await.unwrap();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].total, 500);
        assert_eq!(sales[0].payment_source, PaymentSource::Stk);
    }

    #[tokio::test]
    async fn rejects_amount_that_does_not_match_cart() {
        let ctx = test_context(120).await;
        let err = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 2, 500), now())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));

        let err = initiate_stk_payment(&ctx.state, stk_request(999, 1, 500), now())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));

        let mut empty = stk_request(ctx.product.id, 1, 500);
        empty.cart.clear();
        assert!(initiate_stk_payment(&ctx.state, empty, now()).await.is_err());
        assert_eq!(ctx.provider.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_failure_marks_transaction_failed() {
        let ctx = test_context(120).await;
        ctx.provider.fail_push.store(true, Ordering::SeqCst);

        let err = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Provider(_)));

        let failed = ctx
            .state
            .db
            .get_pending_transactions(Some(PaymentStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].checkout_request_id.is_none());
    }

    #[tokio::test]
    async fn repeated_callback_does_not_create_second_sale() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        let callback = success_callback(started.checkout_request_id.as_deref().unwrap(), "QWE123", 500);

        handle_stk_callback(&ctx.state, &callback, now()).await.unwrap();
        let again = handle_stk_callback(&ctx.state, &callback, now()).await.unwrap();
        assert_eq!(again, CallbackDisposition::Ignored(PaymentStatus::Confirmed));

        assert_eq!(ctx.state.db.get_sales().await.unwrap().len(), 1);
        let product = ctx.state.db.get_product(ctx.product.id).await.unwrap().unwrap();
        assert_eq!(product.stock, 9);
    }

    #[tokio::test]
    async fn late_callback_cannot_resurrect_expired_payment() {
        let ctx = test_context(60).await;
        let started_at = now();
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), started_at)
            .await
            .unwrap();
        let later = started_at + chrono::Duration::seconds(61);

        let disposition = handle_stk_callback(
            &ctx.state,
            &success_callback(started.checkout_request_id.as_deref().unwrap(), "QWE123", 500),
            later,
        )
        .await
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Ignored(PaymentStatus::Expired));

        let tx = ctx.state.db.get_pending_transaction(&started.id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Expired);
        assert!(tx.receipt_number.is_none());
        assert!(ctx.state.db.get_sales().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_callback_and_mismatched_amount_fail_the_payment() {
        let ctx = test_context(120).await;
        let cancelled = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        let disposition = handle_stk_callback(
            &ctx.state,
            &failure_callback(
                cancelled.checkout_request_id.as_deref().unwrap(),
                1032,
                "Request cancelled by user",
            ),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Failed);

        let short = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        let disposition = handle_stk_callback(
            &ctx.state,
            &success_callback(short.checkout_request_id.as_deref().unwrap(), "QWE124", 50),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Failed);
        assert!(ctx.state.db.get_sales().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn callback_for_unknown_checkout_is_reported() {
        let ctx = test_context(120).await;
        let disposition = handle_stk_callback(&ctx.state, &success_callback("ws_CO_nope", "QWE123", 500), now())
            .await
            .unwrap();
        assert_eq!(disposition, CallbackDisposition::UnknownCorrelationId);
    }

    #[tokio::test]
    async fn refresh_leaves_pending_payment_untouched() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();

        let unchanged = stk_payment_status(&ctx.state, &started.id, false, now()).await.unwrap();
        assert_eq!(unchanged.status, PaymentStatus::AwaitingConfirmation);
        assert_eq!(ctx.provider.queries.load(Ordering::SeqCst), 0);

        let refreshed = stk_payment_status(&ctx.state, &started.id, true, now()).await.unwrap();
        assert_eq!(refreshed.status, PaymentStatus::AwaitingConfirmation);
        assert_eq!(ctx.provider.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_confirms_and_late_callback_backfills_receipt() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        ctx.provider
            .answer_queries_with(StkQueryOutcome::Completed {
                result_code: 0,
                result_desc: "The service request is processed successfully.".to_string(),
            })
            .await;

        let refreshed = stk_payment_status(&ctx.state, &started.id, true, now()).await.unwrap();
        assert_eq!(refreshed.status, PaymentStatus::Confirmed);
        assert!(refreshed.receipt_number.is_none());
        assert!(refreshed.sale_id.is_some());

        handle_stk_callback(
            &ctx.state,
            &success_callback(started.checkout_request_id.as_deref().unwrap(), "QWE125", 500),
            now(),
        )
        .await
        .unwrap();
        let tx = ctx.state.db.get_pending_transaction(&started.id).await.unwrap().unwrap();
        assert_eq!(tx.receipt_number.as_deref(), Some("QWE125"));
        assert_eq!(ctx.state.db.get_sales().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_records_provider_failure() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        ctx.provider
            .answer_queries_with(StkQueryOutcome::Completed {
                result_code: 1037,
                result_desc: "DS timeout user cannot be reached".to_string(),
            })
            .await;

        let refreshed = stk_payment_status(&ctx.state, &started.id, true, now()).await.unwrap();
        assert_eq!(refreshed.status, PaymentStatus::Failed);
        assert_eq!(refreshed.result_code, Some(1037));
    }

    #[tokio::test]
    async fn status_read_expires_overdue_payment() {
        let ctx = test_context(30).await;
        let started_at = now();
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), started_at)
            .await
            .unwrap();

        let status = stk_payment_status(
            &ctx.state,
            &started.id,
            true,
            started_at + chrono::Duration::seconds(31),
        )
        .await
        .unwrap();
        assert_eq!(status.status, PaymentStatus::Expired);
        assert_eq!(ctx.provider.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finalize_twice_returns_the_same_sale() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 2, 1000), now())
            .await
            .unwrap();
        handle_stk_callback(
            &ctx.state,
            &success_callback(started.checkout_request_id.as_deref().unwrap(), "QWE126", 1000),
            now(),
        )
        .await
        .unwrap();

        let first = finalize_payment(&ctx.state, PaymentSource::Stk, &started.id, now()).await.unwrap();
        let second = finalize_payment(&ctx.state, PaymentSource::Stk, &started.id, now()).await.unwrap();
        assert_eq!(first.sale.id, second.sale.id);
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].quantity, 2);
        assert_eq!(ctx.state.db.get_sales().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finalize_rejects_unconfirmed_and_unknown_payments() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();

        let err = finalize_payment(&ctx.state, PaymentSource::Stk, &started.id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Conflict(_)));

        let err = finalize_payment(&ctx.state, PaymentSource::Manual, &started.id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound(_)));
    }

    #[tokio::test]
    async fn manual_payment_is_confirmed_and_receipt_cannot_be_reused() {
        let ctx = test_context(120).await;
        let request = || ManualPaymentRequest {
            amount: 500,
            phone: None,
            cart: vec![CartLine {
                product_id: ctx.product.id,
                quantity: 1,
            }],
            receipt_number: "qwe777".to_string(),
        };

        let confirmed = record_manual_payment(&ctx.state, request(), now()).await.unwrap();
        assert_eq!(confirmed.payment.status, PaymentStatus::Confirmed);
        assert_eq!(confirmed.payment.receipt_number.as_deref(), Some("QWE777"));
        assert_eq!(confirmed.payment.sale_id, Some(confirmed.sale.sale.id));
        assert_eq!(confirmed.sale.sale.payment_source, PaymentSource::Manual);

        let err = record_manual_payment(&ctx.state, request(), now()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Conflict(_)));
        assert_eq!(ctx.state.db.get_sales().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_receipt_already_used_by_stk_is_rejected() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        handle_stk_callback(
            &ctx.state,
            &success_callback(started.checkout_request_id.as_deref().unwrap(), "QWE123", 500),
            now(),
        )
        .await
        .unwrap();

        let err = record_manual_payment(
            &ctx.state,
            ManualPaymentRequest {
                amount: 500,
                phone: Some("0712345678".to_string()),
                cart: vec![CartLine {
                    product_id: ctx.product.id,
                    quantity: 1,
                }],
                receipt_number: "QWE123".to_string(),
            },
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PaymentError::Conflict(_)));
    }

    #[tokio::test]
    async fn qr_payment_is_verified_once() {
        let ctx = test_context(120).await;
        let request = QrPaymentRequest {
            amount: 500,
            phone: None,
            cart: vec![CartLine {
                product_id: ctx.product.id,
                quantity: 1,
            }],
        };
        let qr = create_qr_payment(&ctx.state, request, now()).await.unwrap();
        assert_eq!(qr.status, PaymentStatus::AwaitingConfirmation);
        assert!(qr.qr_code.is_some());
        assert!(qr.qr_reference.as_deref().unwrap().starts_with("QR"));

        let verify = || VerifyReceiptRequest {
            receipt_number: "QRX12345".to_string(),
        };
        let first = verify_qr_payment(&ctx.state, &qr.id, verify(), now()).await.unwrap();
        assert_eq!(first.payment.status, PaymentStatus::Confirmed);
        assert_eq!(first.sale.sale.payment_source, PaymentSource::Qr);

        let second = verify_qr_payment(&ctx.state, &qr.id, verify(), now()).await.unwrap();
        assert_eq!(first.sale.sale.id, second.sale.sale.id);

        let err = verify_qr_payment(
            &ctx.state,
            &qr.id,
            VerifyReceiptRequest {
                receipt_number: "OTHER123".to_string(),
            },
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PaymentError::Conflict(_)));
    }

    #[tokio::test]
    async fn qr_generation_failure_and_expiry() {
        let ctx = test_context(60).await;
        let request = || QrPaymentRequest {
            amount: 500,
            phone: None,
            cart: vec![CartLine {
                product_id: ctx.product.id,
                quantity: 1,
            }],
        };

        ctx.provider.fail_qr.store(true, Ordering::SeqCst);
        let err = create_qr_payment(&ctx.state, request(), now()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Provider(_)));

        ctx.provider.fail_qr.store(false, Ordering::SeqCst);
        let started_at = now();
        let qr = create_qr_payment(&ctx.state, request(), started_at).await.unwrap();
        let later = started_at + chrono::Duration::seconds(61);
        let err = verify_qr_payment(
            &ctx.state,
            &qr.id,
            VerifyReceiptRequest {
                receipt_number: "QRX99999".to_string(),
            },
            later,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PaymentError::Expired(_)));

        let status = manual_payment_status(&ctx.state, PaymentChannel::Qr, &qr.id, later)
            .await
            .unwrap();
        assert_eq!(status.status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn sweep_expires_every_overdue_payment() {
        let ctx = test_context(10).await;
        let started_at = now();
        initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), started_at)
            .await
            .unwrap();
        create_qr_payment(
            &ctx.state,
            QrPaymentRequest {
                amount: 500,
                phone: None,
                cart: vec![CartLine {
                    product_id: ctx.product.id,
                    quantity: 1,
                }],
            },
            started_at,
        )
        .await
        .unwrap();

        assert_eq!(ctx.state.db.expire_overdue_payments(started_at).await.unwrap(), (0, 0));
        let later = started_at + chrono::Duration::seconds(11);
        assert_eq!(ctx.state.db.expire_overdue_payments(later).await.unwrap(), (1, 1));
        assert_eq!(ctx.state.db.expire_overdue_payments(later).await.unwrap(), (0, 0));
    }

    fn manual_request(product_id: i64, receipt: &str) -> ManualPaymentRequest {
        ManualPaymentRequest {
            amount: 500,
            phone: None,
            cart: vec![CartLine {
                product_id,
                quantity: 1,
            }],
            receipt_number: receipt.to_string(),
        }
    }

    #[tokio::test]
    async fn late_callback_does_not_backfill_receipt_settling_another_payment() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();
        ctx.provider
            .answer_queries_with(StkQueryOutcome::Completed {
                result_code: 0,
                result_desc: "The service request is processed successfully.".to_string(),
            })
            .await;
        let refreshed = stk_payment_status(&ctx.state, &started.id, true, now()).await.unwrap();
        assert_eq!(refreshed.status, PaymentStatus::Confirmed);
        record_manual_payment(&ctx.state, manual_request(ctx.product.id, "QWE777"), now())
            .await
            .unwrap();

        let disposition = handle_stk_callback(
            &ctx.state,
            &success_callback(started.checkout_request_id.as_deref().unwrap(), "QWE777", 500),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Ignored(PaymentStatus::Confirmed));

        let tx = ctx.state.db.get_pending_transaction(&started.id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Confirmed);
        assert!(tx.receipt_number.is_none());
        assert!(tx.result_desc.unwrap().contains("QWE777"));
    }

    #[tokio::test]
    async fn callback_with_receipt_used_by_manual_payment_fails() {
        let ctx = test_context(120).await;
        record_manual_payment(&ctx.state, manual_request(ctx.product.id, "QWE888"), now())
            .await
            .unwrap();
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();

        let disposition = handle_stk_callback(
            &ctx.state,
            &success_callback(started.checkout_request_id.as_deref().unwrap(), "qwe888", 500),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Failed);

        let tx = ctx.state.db.get_pending_transaction(&started.id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Failed);
        assert!(tx.receipt_number.is_none());
        assert!(tx.sale_id.is_none());
        assert_eq!(ctx.state.db.get_sales().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn success_callback_without_receipt_fails_the_payment() {
        let ctx = test_context(120).await;
        let started = initiate_stk_payment(&ctx.state, stk_request(ctx.product.id, 1, 500), now())
            .await
            .unwrap();

        let disposition = handle_stk_callback(
            &ctx.state,
            &failure_callback(
                started.checkout_request_id.as_deref().unwrap(),
                0,
                "The service request is processed successfully.",
            ),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Failed);

        let tx = ctx.state.db.get_pending_transaction(&started.id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Failed);
        assert_eq!(tx.result_code, Some(0));
        assert!(ctx.state.db.get_sales().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn qr_payment_past_deadline_is_not_issued() {
        let ctx = test_context(0).await;
        let err = create_qr_payment(
            &ctx.state,
            QrPaymentRequest {
                amount: 500,
                phone: None,
                cart: vec![CartLine {
                    product_id: ctx.product.id,
                    quantity: 1,
                }],
            },
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PaymentError::Conflict(_)));
    }
}
