mod callback;
mod daraja;

pub use callback::*;
pub use daraja::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkPushRequest {
    pub amount: i64,
    pub phone: String,
    /// Shown on the payer's phone; the provider truncates it at 12 characters.
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StkPushAccepted {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub customer_message: String,
}

/// Answer of the provider's STK status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StkQueryOutcome {
    /// The payer has not finished yet.
    Pending,
    Completed { result_code: i64, result_desc: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrRequest {
    pub amount: i64,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCode {
    pub request_id: String,
    /// Base64 encoded PNG.
    pub image: String,
}

/// The outbound half of the mobile-money provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted>;
    async fn query_stk(&self, checkout_request_id: &str) -> Result<StkQueryOutcome>;
    async fn generate_qr(&self, request: &QrRequest) -> Result<QrCode>;
}
