use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{PaymentError, Result};
use crate::helpers::mpesa_timestamp;
use crate::mpesa::{
    PaymentProvider, QrCode, QrRequest, StkPushAccepted, StkPushRequest, StkQueryOutcome,
};

/// Error code the STK query returns while the payer has not answered the prompt yet.
const STILL_PROCESSING: &str = "500.001.1001";

#[derive(Debug, Clone)]
pub struct DarajaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    pub transaction_type: String,
    pub qr_merchant_name: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Safaricom Daraja client for STK push, STK query and dynamic QR.
pub struct DarajaClient {
    http: reqwest::Client,
    config: DarajaConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushBody<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'a str,
    amount: i64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryBody<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Deserialize)]
struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    result_code: String,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct QrBody<'a> {
    merchant_name: &'a str,
    ref_no: &'a str,
    amount: i64,
    trx_code: &'a str,
    #[serde(rename = "CPI")]
    cpi: &'a str,
    size: &'a str,
}

#[derive(Deserialize)]
struct QrResponse {
    #[serde(rename = "RequestID", default)]
    request_id: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "QRCode", default)]
    qr_code: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "errorMessage", default)]
    error_message: String,
}

impl DarajaClient {
    pub fn new(config: DarajaConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    /// base64(shortcode + passkey + timestamp)
    pub fn password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
        STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .get(self.url("/oauth/v1/generate?grant_type=client_credentials"))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(|e| PaymentError::Provider(format!("Token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PaymentError::Provider(format!(
                "Token request rejected with HTTP {}",
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::Provider(format!("Invalid token response: {e}")))?;

        let lifetime = body
            .expires_in
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(3599);
        // Cached token is dropped a minute before the provider expires it.
        let expires_at = Instant::now() + Duration::from_secs(lifetime.saturating_sub(60));
        log::debug!("Fetched provider access token valid for {}s", lifetime);

        *guard = Some(CachedToken {
            value: body.access_token.clone(),
            expires_at,
        });
        Ok(body.access_token)
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        self.http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| PaymentError::Provider(format!("Request to {path} failed: {e}")))
    }

    async fn read_error(response: reqwest::Response) -> ErrorResponse {
        let status = response.status();
        response.json::<ErrorResponse>().await.unwrap_or(ErrorResponse {
            error_code: status.as_u16().to_string(),
            error_message: status.to_string(),
        })
    }
}

#[async_trait]
impl PaymentProvider for DarajaClient {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted> {
        let timestamp = mpesa_timestamp(Utc::now());
        let account_reference: String = request.account_reference.chars().take(12).collect();
        let body = StkPushBody {
            business_short_code: &self.config.shortcode,
            password: Self::password(&self.config.shortcode, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: &self.config.transaction_type,
            amount: request.amount,
            party_a: &request.phone,
            party_b: &self.config.shortcode,
            phone_number: &request.phone,
            callback_url: &self.config.callback_url,
            account_reference: &account_reference,
            transaction_desc: &request.description,
        };

        let response = self.post_json("/mpesa/stkpush/v1/processrequest", &body).await?;
        if !response.status().is_success() {
            let error = Self::read_error(response).await;
            return Err(PaymentError::Provider(format!(
                "STK push rejected ({}): {}",
                error.error_code, error.error_message
            )));
        }
        let accepted: StkPushResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::Provider(format!("Invalid STK push response: {e}")))?;
        if accepted.response_code != "0" {
            return Err(PaymentError::Provider(format!(
                "STK push not accepted ({}): {}",
                accepted.response_code, accepted.response_description
            )));
        }

        log::info!(
            "STK push accepted: checkout_request_id={} phone={} amount={}",
            accepted.checkout_request_id,
            request.phone,
            request.amount
        );
        Ok(StkPushAccepted {
            merchant_request_id: accepted.merchant_request_id,
            checkout_request_id: accepted.checkout_request_id,
            customer_message: accepted.customer_message,
        })
    }

    async fn query_stk(&self, checkout_request_id: &str) -> Result<StkQueryOutcome> {
        let timestamp = mpesa_timestamp(Utc::now());
        let body = StkQueryBody {
            business_short_code: &self.config.shortcode,
            password: Self::password(&self.config.shortcode, &self.config.passkey, &timestamp),
            timestamp,
            checkout_request_id,
        };

        let response = self.post_json("/mpesa/stkpushquery/v1/query", &body).await?;
        if !response.status().is_success() {
            let error = Self::read_error(response).await;
            if error.error_code == STILL_PROCESSING {
                return Ok(StkQueryOutcome::Pending);
            }
            return Err(PaymentError::Provider(format!(
                "STK query rejected ({}): {}",
                error.error_code, error.error_message
            )));
        }
        let result: StkQueryResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::Provider(format!("Invalid STK query response: {e}")))?;
        let result_code = result.result_code.trim().parse::<i64>().map_err(|_| {
            PaymentError::Provider(format!("Unexpected ResultCode '{}'", result.result_code))
        })?;

        Ok(StkQueryOutcome::Completed {
            result_code,
            result_desc: result.result_desc,
        })
    }

    async fn generate_qr(&self, request: &QrRequest) -> Result<QrCode> {
        let body = QrBody {
            merchant_name: &self.config.qr_merchant_name,
            ref_no: &request.reference,
            amount: request.amount,
            trx_code: "PB",
            cpi: &self.config.shortcode,
            size: "300",
        };

        let response = self.post_json("/mpesa/qrcode/v1/generate", &body).await?;
        if !response.status().is_success() {
            let error = Self::read_error(response).await;
            return Err(PaymentError::Provider(format!(
                "QR generation rejected ({}): {}",
                error.error_code, error.error_message
            )));
        }
        let qr: QrResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::Provider(format!("Invalid QR response: {e}")))?;
        if qr.qr_code.is_empty() {
            return Err(PaymentError::Provider(format!(
                "QR generation returned no image: {}",
                qr.response_description
            )));
        }

        Ok(QrCode {
            request_id: qr.request_id,
            image: qr.qr_code,
        })
    }
}
