use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::db::Database;
use crate::schema::{CartSnapshotLine, PaymentSource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sale {
    pub id: i64,
    pub payment_source: PaymentSource,
    pub payment_id: String,
    pub receipt_number: Option<String>,
    pub phone: Option<String>,
    pub total: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SaleItem {
    pub id: i64,
    pub sale_id: i64,
    pub product_id: i64,
    pub name: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub line_total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaleWithItems {
    #[serde(flatten)]
    pub sale: Sale,
    pub items: Vec<SaleItem>,
}

/// Everything the finalizer needs from a confirmed payment record, whatever table it lives in.
#[derive(Debug, Clone)]
pub struct ConfirmedPayment {
    pub source: PaymentSource,
    pub payment_id: String,
    pub amount: i64,
    pub phone: Option<String>,
    pub receipt_number: Option<String>,
    pub cart: Vec<CartSnapshotLine>,
}

/// Result of a finalization request.
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Created(SaleWithItems),
    AlreadyFinalized(SaleWithItems),
}

impl FinalizeOutcome {
    pub fn into_sale(self) -> SaleWithItems {
        match self {
            FinalizeOutcome::Created(sale) | FinalizeOutcome::AlreadyFinalized(sale) => sale,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, FinalizeOutcome::Created(_))
    }
}

impl Sale {
    /// Streams every sale into a CSV file and returns how many rows were written.
    pub async fn export_csv(db: &Database, path: &str) -> anyhow::Result<usize> {
        let file = tokio::fs::File::create(path).await?;
        let mut wtr = csv_async::AsyncSerializer::from_writer(file);

        let mut rows = db.stream_sales();
        let mut count = 0;
        while let Some(sale) = rows.next().await {
            wtr.serialize(sale?).await?;
            count += 1;
        }
        wtr.flush().await?;
        log::info!("Exported {} sales to {}", count, path);
        Ok(count)
    }
}
