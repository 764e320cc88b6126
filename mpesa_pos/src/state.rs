use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use common::Database;
use common::Product;
use common::mpesa::PaymentProvider;

pub struct AppState {
    pub db: Database,
    pub provider: Arc<dyn PaymentProvider>,
    /// How long a payment may stay unconfirmed before it expires.
    pub payment_timeout: Duration,
}

impl AppState {
    pub async fn new(
        database_url: &str,
        provider: Arc<dyn PaymentProvider>,
        payment_timeout: Duration,
    ) -> Result<Self> {
        let db = Database::new(database_url).await?;
        log::info!("Database initialized successfully!");

        Ok(AppState {
            db,
            provider,
            payment_timeout,
        })
    }

    pub async fn initialize_products_from_file(&self, products_yaml: &str) -> Result<usize> {
        let products = Product::from_yaml_file(products_yaml)
            .await
            .with_context(|| format!("Failed to load products from `{}`", products_yaml))?;

        let now = Utc::now().naive_utc();
        for product in &products {
            self.db
                .upsert_product(product, now)
                .await
                .with_context(|| format!("Failed to save product sku={} to database", product.sku))?;
        }

        Ok(products.len())
    }
}
