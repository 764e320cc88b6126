use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use sqlx::types::Json;

use crate::schema::{CartSnapshotLine, ConfirmedPayment, PaymentSource, PaymentStatus, PaymentStatusView};

/// A mobile-money charge recorded before the provider has confirmed it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PendingTransaction {
    pub id: String,
    pub session_id: Option<String>,
    pub amount: i64,
    pub phone: String,
    pub cart: Json<Vec<CartSnapshotLine>>,
    pub status: PaymentStatus,
    pub merchant_request_id: Option<String>,
    /// Provider correlation id (`CheckoutRequestID`), set once the STK push is accepted.
    pub checkout_request_id: Option<String>,
    pub receipt_number: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub sale_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PendingTransaction {
    pub fn new(
        session_id: Option<String>,
        amount: i64,
        phone: String,
        cart: Vec<CartSnapshotLine>,
        now: NaiveDateTime,
        timeout: Duration,
    ) -> Self {
        PendingTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            amount,
            phone,
            cart: Json(cart),
            status: PaymentStatus::Created,
            merchant_request_id: None,
            checkout_request_id: None,
            receipt_number: None,
            result_code: None,
            result_desc: None,
            sale_id: None,
            created_at: now,
            expires_at: now + timeout,
            updated_at: now,
        }
    }

    pub fn is_overdue(&self, now: NaiveDateTime) -> bool {
        !self.status.is_terminal() && self.expires_at <= now
    }

    pub fn status_view(&self) -> PaymentStatusView {
        PaymentStatusView {
            id: self.id.clone(),
            status: self.status,
            receipt_number: self.receipt_number.clone(),
            result_desc: self.result_desc.clone(),
            sale_id: self.sale_id,
        }
    }

    /// `None` unless the record is confirmed and carries its correlation id.
    pub fn confirmed_payment(&self) -> Option<ConfirmedPayment> {
        if self.status != PaymentStatus::Confirmed || self.checkout_request_id.is_none() {
            return None;
        }
        Some(ConfirmedPayment {
            source: PaymentSource::Stk,
            payment_id: self.id.clone(),
            amount: self.amount,
            phone: Some(self.phone.clone()),
            receipt_number: self.receipt_number.clone(),
            cart: self.cart.0.clone(),
        })
    }
}
