use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::helpers::validate_receipt_number;

/// Body posted by the provider to the STK callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success {
        receipt_number: String,
        amount: Option<i64>,
        phone: Option<String>,
    },
    Failure {
        result_code: i64,
        reason: String,
    },
}

impl StkCallback {
    fn item(&self, name: &str) -> Option<&Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    fn item_string(&self, name: &str) -> Option<String> {
        match self.item(name)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Amounts arrive as `500` or `500.00`.
    fn item_amount(&self, name: &str) -> Option<i64> {
        match self.item(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
            _ => None,
        }
    }

    /// A zero result code only counts as success when a well-formed receipt number came with it.
    /// The receipt is upper-cased like operator-entered ones.
    pub fn outcome(&self) -> CallbackOutcome {
        if self.result_code != 0 {
            return CallbackOutcome::Failure {
                result_code: self.result_code,
                reason: self.result_desc.clone(),
            };
        }
        match self.item_string("MpesaReceiptNumber") {
            Some(raw) => match validate_receipt_number(&raw) {
                Ok(receipt_number) => CallbackOutcome::Success {
                    receipt_number,
                    amount: self.item_amount("Amount"),
                    phone: self.item_string("PhoneNumber"),
                },
                Err(_) => CallbackOutcome::Failure {
                    result_code: self.result_code,
                    reason: format!("Malformed MpesaReceiptNumber '{}'", raw),
                },
            },
            None => CallbackOutcome::Failure {
                result_code: self.result_code,
                reason: "Success callback without MpesaReceiptNumber".to_string(),
            },
        }
    }
}

/// Acknowledgement the provider expects back from the callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        CallbackAck {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }
}
