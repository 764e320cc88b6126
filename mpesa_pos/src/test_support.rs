use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use common::mpesa::{
    PaymentProvider, QrCode, QrRequest, StkCallback, StkCallbackEnvelope, StkPushAccepted,
    StkPushRequest, StkQueryOutcome,
};
use common::{PaymentError, Product, Result};
use tokio::sync::Mutex;

use crate::state::AppState;

/// Scriptable stand-in for the provider.
#[derive(Default)]
pub struct MockProvider {
    pub fail_push: AtomicBool,
    pub fail_qr: AtomicBool,
    pub pushes: AtomicU32,
    pub queries: AtomicU32,
    pub query_outcome: Mutex<Option<StkQueryOutcome>>,
}

impl MockProvider {
    pub async fn answer_queries_with(&self, outcome: StkQueryOutcome) {
        *self.query_outcome.lock().await = Some(outcome);
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted> {
        let n = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(PaymentError::Provider("Simulated provider outage".to_string()));
        }
        Ok(StkPushAccepted {
            merchant_request_id: format!("mr-{n}"),
            checkout_request_id: format!("ws_CO_{n}_{}", request.phone),
            customer_message: "Success. Request accepted for processing".to_string(),
        })
    }

    async fn query_stk(&self, _checkout_request_id: &str) -> Result<StkQueryOutcome> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .query_outcome
            .lock()
            .await
            .clone()
            .unwrap_or(StkQueryOutcome::Pending))
    }

    async fn generate_qr(&self, request: &QrRequest) -> Result<QrCode> {
        if self.fail_qr.load(Ordering::SeqCst) {
            return Err(PaymentError::Provider("QR service unavailable".to_string()));
        }
        Ok(QrCode {
            request_id: format!("qr-{}", request.reference),
            image: "iVBORw0KGgoAAAANSUhEUgAAAAEAAAAB".to_string(),
        })
    }
}

pub struct TestContext {
    pub state: AppState,
    pub provider: Arc<MockProvider>,
    pub product: Product,
}

/// In-memory state with one product, "Sugar 2kg" at 500.
pub async fn test_context(timeout_seconds: i64) -> TestContext {
    let provider = Arc::new(MockProvider::default());
    let state = AppState::new(
        "sqlite::memory:",
        provider.clone(),
        Duration::seconds(timeout_seconds),
    )
    .await
    .unwrap();
    let product = state
        .db
        .upsert_product(&Product::new("Sugar 2kg", "SUG-2KG", 500, 10), now())
        .await
        .unwrap();
    TestContext {
        state,
        provider,
        product,
    }
}

pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn success_callback(checkout_request_id: &str, receipt: &str, amount: i64) -> StkCallback {
    let envelope: StkCallbackEnvelope = serde_json::from_value(serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "mr-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": amount },
                        { "Name": "MpesaReceiptNumber", "Value": receipt },
                        { "Name": "TransactionDate", "Value": 20250601120000u64 },
                        { "Name": "PhoneNumber", "Value": 254712345678u64 }
                    ]
                }
            }
        }
    }))
    .unwrap();
    envelope.body.stk_callback
}

pub fn failure_callback(checkout_request_id: &str, result_code: i64, desc: &str) -> StkCallback {
    let envelope: StkCallbackEnvelope = serde_json::from_value(serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "mr-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": desc
            }
        }
    }))
    .unwrap();
    envelope.body.stk_callback
}
