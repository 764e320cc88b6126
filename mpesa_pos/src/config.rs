use std::sync::Arc;

use anyhow::Context;
use common::mpesa::{DarajaClient, DarajaConfig};

use crate::state::AppState;

const SANDBOX_URL: &str = "https://sandbox.safaricom.co.ke";

pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub daraja: DarajaConfig,
    pub payment_timeout_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub products_yaml: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let server_host =
            std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let server_port = std::env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("SERVER_PORT must be a port number")?;

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let daraja = DarajaConfig {
            base_url: std::env::var("MPESA_BASE_URL").unwrap_or_else(|_| SANDBOX_URL.to_string()),
            consumer_key: std::env::var("MPESA_CONSUMER_KEY")
                .context("MPESA_CONSUMER_KEY must be set")?,
            consumer_secret: std::env::var("MPESA_CONSUMER_SECRET")
                .context("MPESA_CONSUMER_SECRET must be set")?,
            shortcode: std::env::var("MPESA_SHORTCODE").context("MPESA_SHORTCODE must be set")?,
            passkey: std::env::var("MPESA_PASSKEY").context("MPESA_PASSKEY must be set")?,
            callback_url: std::env::var("MPESA_CALLBACK_URL")
                .context("MPESA_CALLBACK_URL must be set")?,
            transaction_type: std::env::var("MPESA_TRANSACTION_TYPE")
                .unwrap_or_else(|_| "CustomerPayBillOnline".to_string()),
            qr_merchant_name: std::env::var("MPESA_QR_MERCHANT_NAME")
                .unwrap_or_else(|_| "POS".to_string()),
        };

        let payment_timeout_seconds = std::env::var("PAYMENT_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "120".to_string())
            .parse::<i64>()
            .context("PAYMENT_TIMEOUT_SECONDS must be a whole number of seconds")?;
        if payment_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("PAYMENT_TIMEOUT_SECONDS must be positive"));
        }

        let sweep_interval_seconds = std::env::var("SWEEP_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .context("SWEEP_INTERVAL_SECONDS must be a whole number of seconds")?
            .max(1);

        let products_yaml = std::env::var("PRODUCTS_YAML").ok();

        Ok(Self {
            server_host,
            server_port,
            database_url,
            daraja,
            payment_timeout_seconds,
            sweep_interval_seconds,
            products_yaml,
        })
    }

    pub async fn create_app_state(&self) -> anyhow::Result<AppState> {
        let provider = DarajaClient::new(self.daraja.clone())?;
        AppState::new(
            &self.database_url,
            Arc::new(provider),
            chrono::Duration::seconds(self.payment_timeout_seconds),
        )
        .await
        .context("Failed to initialize AppState")
    }
}
