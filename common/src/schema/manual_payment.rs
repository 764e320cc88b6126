use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use sqlx::types::Json;

use crate::schema::{
    CartSnapshotLine, ConfirmedPayment, PaymentChannel, PaymentStatus, PaymentStatusView,
};

/// A payment confirmed by an operator typing or scanning the provider's receipt code
/// instead of waiting for a callback.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ManualPayment {
    pub id: String,
    pub channel: PaymentChannel,
    pub amount: i64,
    pub phone: Option<String>,
    pub cart: Json<Vec<CartSnapshotLine>>,
    pub status: PaymentStatus,
    pub qr_reference: Option<String>,
    pub qr_request_id: Option<String>,
    /// Base64 PNG returned by the provider, only for the QR channel.
    pub qr_code: Option<String>,
    pub receipt_number: Option<String>,
    pub result_desc: Option<String>,
    pub sale_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ManualPayment {
    pub fn new(
        channel: PaymentChannel,
        amount: i64,
        phone: Option<String>,
        cart: Vec<CartSnapshotLine>,
        now: NaiveDateTime,
        timeout: Duration,
    ) -> Self {
        ManualPayment {
            id: uuid::Uuid::new_v4().to_string(),
            channel,
            amount,
            phone,
            cart: Json(cart),
            status: PaymentStatus::Created,
            qr_reference: None,
            qr_request_id: None,
            qr_code: None,
            receipt_number: None,
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

    /// For manual entries the receipt code is the provider correlation id.
    pub fn confirmed_payment(&self) -> Option<ConfirmedPayment> {
        if self.status != PaymentStatus::Confirmed || self.receipt_number.is_none() {
            return None;
        }
        Some(ConfirmedPayment {
            source: self.channel.into(),
            payment_id: self.id.clone(),
            amount: self.amount,
            phone: self.phone.clone(),
            receipt_number: self.receipt_number.clone(),
            cart: self.cart.0.clone(),
        })
    }
}
