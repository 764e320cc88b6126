use std::str::FromStr;

use anyhow::Context;
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio_stream::Stream;

use crate::schema::{
    ConfirmedPayment, FinalizeOutcome, ManualPayment, PaymentSource, PaymentStatus,
    PendingTransaction, Product, Sale, SaleItem, SaleWithItems,
};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Failed to create SQLite connect options")?
            .create_if_missing(true);

        // Every connection to `:memory:` is its own database, so keep exactly one alive.
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        sqlx::migrate!()
            .run(&pool)
            .await
            .context("Database migration error")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- PRODUCTS ---

    pub async fn upsert_product(
        &self,
        product: &Product,
        now: NaiveDateTime,
    ) -> anyhow::Result<Product> {
        let saved = sqlx::query_as::<_, Product>(
            r#"
            INSERT INTO products (name, sku, price, stock, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (sku) DO UPDATE SET
                name = excluded.name,
                price = excluded.price,
                stock = excluded.stock,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&product.name)
        .bind(&product.sku)
        .bind(product.price)
        .bind(product.stock)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context(format!("Failed to save product with sku {}", product.sku))?;
        log::debug!("Saved product to database: {:?}", saved);
        Ok(saved)
    }

    pub async fn get_products(&self) -> anyhow::Result<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>("SELECT * FROM products ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("Failed to get all products from database")?;
        Ok(products)
    }

    pub async fn get_product(&self, product_id: i64) -> anyhow::Result<Option<Product>> {
        let product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = ?")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to get product with id {}", product_id))?;
        Ok(product)
    }

    // --- PENDING TRANSACTIONS ---

    pub async fn save_pending_transaction(&self, tx: &PendingTransaction) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_transactions (
                id, session_id, amount, phone, cart, status,
                created_at, expires_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tx.id)
        .bind(&tx.session_id)
        .bind(tx.amount)
        .bind(&tx.phone)
        .bind(&tx.cart)
        .bind(tx.status)
        .bind(tx.created_at)
        .bind(tx.expires_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to save pending transaction")?;
        Ok(())
    }

    pub async fn get_pending_transaction(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<PendingTransaction>> {
        let tx = sqlx::query_as::<_, PendingTransaction>(
            "SELECT * FROM pending_transactions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context(format!("Failed to get pending transaction {}", id))?;
        Ok(tx)
    }

    pub async fn get_pending_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> anyhow::Result<Option<PendingTransaction>> {
        let tx = sqlx::query_as::<_, PendingTransaction>(
            "SELECT * FROM pending_transactions WHERE checkout_request_id = ?",
        )
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .context(format!(
            "Failed to get pending transaction for checkout request {}",
            checkout_request_id
        ))?;
        Ok(tx)
    }

    pub async fn get_pending_transactions(
        &self,
        status: Option<PaymentStatus>,
    ) -> anyhow::Result<Vec<PendingTransaction>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, PendingTransaction>(
                    "SELECT * FROM pending_transactions WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, PendingTransaction>(
                    "SELECT * FROM pending_transactions ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to get pending transactions")?;
        Ok(rows)
    }

    /// Created -> AwaitingConfirmation, storing the provider correlation ids.
    pub async fn mark_awaiting_confirmation(
        &self,
        id: &str,
        merchant_request_id: &str,
        checkout_request_id: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = 'awaiting_confirmation',
                merchant_request_id = ?,
                checkout_request_id = ?,
                updated_at = ?
            WHERE id = ? AND status = 'created'
            "#,
        )
        .bind(merchant_request_id)
        .bind(checkout_request_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context(format!("Failed to mark transaction {} as awaiting", id))?;
        Ok(result.rows_affected() == 1)
    }

    /// Any non-terminal state -> Failed.
    pub async fn mark_pending_failed(
        &self,
        id: &str,
        result_code: Option<i64>,
        reason: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = 'failed', result_code = ?, result_desc = ?, updated_at = ?
            WHERE id = ? AND status IN ('created', 'awaiting_confirmation')
            "#,
        )
        .bind(result_code)
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context(format!("Failed to mark transaction {} as failed", id))?;
        Ok(result.rows_affected() == 1)
    }

    /// AwaitingConfirmation -> Confirmed, keyed by the provider correlation id and
    /// only while the record has not expired.
    pub async fn confirm_pending_transaction(
        &self,
        checkout_request_id: &str,
        receipt_number: Option<&str>,
        result_code: i64,
        result_desc: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = 'confirmed', receipt_number = ?, result_code = ?,
                result_desc = ?, updated_at = ?
            WHERE checkout_request_id = ?
              AND status = 'awaiting_confirmation'
              AND expires_at > ?
            "#,
        )
        .bind(receipt_number)
        .bind(result_code)
        .bind(result_desc)
        .bind(now)
        .bind(checkout_request_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(format!(
            "Failed to confirm transaction for checkout request {}",
            checkout_request_id
        ))?;
        Ok(result.rows_affected() == 1)
    }

    /// A confirmation that came from a status query has no receipt; the late callback fills it in.
    pub async fn backfill_receipt(
        &self,
        checkout_request_id: &str,
        receipt_number: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_transactions
            SET receipt_number = ?, updated_at = ?
            WHERE checkout_request_id = ? AND status = 'confirmed' AND receipt_number IS NULL
            "#,
        )
        .bind(receipt_number)
        .bind(now)
        .bind(checkout_request_id)
        .execute(&self.pool)
        .await
        .context("Failed to backfill receipt number")?;
        Ok(result.rows_affected() == 1)
    }

    /// Overwrites `result_desc` on a confirmed record without touching its state.
    pub async fn annotate_confirmed(
        &self,
        checkout_request_id: &str,
        note: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_transactions
            SET result_desc = ?, updated_at = ?
            WHERE checkout_request_id = ? AND status = 'confirmed'
            "#,
        )
        .bind(note)
        .bind(now)
        .bind(checkout_request_id)
        .execute(&self.pool)
        .await
        .context("Failed to annotate confirmed transaction")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn expire_pending_transactions(&self, now: NaiveDateTime) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = 'expired', result_desc = 'No confirmation before timeout', updated_at = ?
            WHERE status IN ('created', 'awaiting_confirmation') AND expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to expire pending transactions")?;
        Ok(result.rows_affected())
    }

    // --- MANUAL / QR PAYMENTS ---

    pub async fn save_manual_payment(&self, payment: &ManualPayment) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_payments (
                id, channel, amount, phone, cart, status, qr_reference,
                created_at, expires_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&payment.id)
        .bind(payment.channel)
        .bind(payment.amount)
        .bind(&payment.phone)
        .bind(&payment.cart)
        .bind(payment.status)
        .bind(&payment.qr_reference)
        .bind(payment.created_at)
        .bind(payment.expires_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to save manual payment")?;
        Ok(())
    }

    pub async fn get_manual_payment(&self, id: &str) -> anyhow::Result<Option<ManualPayment>> {
        let payment =
            sqlx::query_as::<_, ManualPayment>("SELECT * FROM manual_payments WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context(format!("Failed to get manual payment {}", id))?;
        Ok(payment)
    }

    pub async fn mark_qr_awaiting(
        &self,
        id: &str,
        qr_request_id: &str,
        qr_code: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE manual_payments
            SET status = 'awaiting_confirmation', qr_request_id = ?, qr_code = ?, updated_at = ?
            WHERE id = ? AND status = 'created' AND expires_at > ?
            "#,
        )
        .bind(qr_request_id)
        .bind(qr_code)
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(format!("Failed to mark QR payment {} as awaiting", id))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_manual_failed(
        &self,
        id: &str,
        reason: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE manual_payments
            SET status = 'failed', result_desc = ?, updated_at = ?
            WHERE id = ? AND status IN ('created', 'awaiting_confirmation')
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context(format!("Failed to mark manual payment {} as failed", id))?;
        Ok(result.rows_affected() == 1)
    }

    /// Any non-terminal, unexpired state -> Confirmed with the operator-supplied receipt.
    pub async fn confirm_manual_payment(
        &self,
        id: &str,
        receipt_number: &str,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE manual_payments
            SET status = 'confirmed', receipt_number = ?, result_desc = 'Verified by operator',
                updated_at = ?
            WHERE id = ?
              AND status IN ('created', 'awaiting_confirmation')
              AND expires_at > ?
            "#,
        )
        .bind(receipt_number)
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(format!("Failed to confirm manual payment {}", id))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn expire_manual_payments(&self, now: NaiveDateTime) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE manual_payments
            SET status = 'expired', result_desc = 'No confirmation before timeout', updated_at = ?
            WHERE status IN ('created', 'awaiting_confirmation') AND expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to expire manual payments")?;
        Ok(result.rows_affected())
    }

    /// Expires overdue records in both payment tables. Returns (stk, manual) counts.
    pub async fn expire_overdue_payments(&self, now: NaiveDateTime) -> anyhow::Result<(u64, u64)> {
        let stk = self.expire_pending_transactions(now).await?;
        let manual = self.expire_manual_payments(now).await?;
        Ok((stk, manual))
    }

    /// A receipt code may settle exactly one payment across both payment tables.
    pub async fn receipt_in_use(&self, receipt_number: &str) -> anyhow::Result<bool> {
        let in_use: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM pending_transactions WHERE receipt_number = ?1)
                OR EXISTS (SELECT 1 FROM manual_payments WHERE receipt_number = ?1)
            "#,
        )
        .bind(receipt_number)
        .fetch_one(&self.pool)
        .await
        .context(format!("Failed to check receipt {}", receipt_number))?;
        Ok(in_use != 0)
    }

    // --- SALES ---

    /// Persists the sale, its items and the stock decrement, then links the payment record.
    /// All or nothing; a second call for the same payment returns the existing sale.
    pub async fn finalize_sale(
        &self,
        payment: &ConfirmedPayment,
        now: NaiveDateTime,
    ) -> anyhow::Result<FinalizeOutcome> {
        let total: i64 = payment.cart.iter().map(|l| l.line_total).sum();
        if total != payment.amount {
            return Err(anyhow::anyhow!(
                "Cart total {} of payment {} does not match the confirmed amount {}",
                total,
                payment.payment_id,
                payment.amount
            ));
        }

        // Take the write lock up front so concurrent finalizers queue instead of failing with BUSY.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("Failed to begin finalization")?;

        if let Some(existing) =
            Self::find_sale_by_payment(&mut tx, payment.source, &payment.payment_id).await?
        {
            tx.commit().await.context("Failed to close finalization")?;
            return Ok(FinalizeOutcome::AlreadyFinalized(existing));
        }

        let sale = sqlx::query_as::<_, Sale>(
            r#"
            INSERT INTO sales (payment_source, payment_id, receipt_number, phone, total, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(payment.source)
        .bind(&payment.payment_id)
        .bind(&payment.receipt_number)
        .bind(&payment.phone)
        .bind(total)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context(format!("Failed to save sale for payment {}", payment.payment_id))?;

        let mut items = Vec::with_capacity(payment.cart.len());
        for line in &payment.cart {
            let item = sqlx::query_as::<_, SaleItem>(
                r#"
                INSERT INTO sale_items (sale_id, product_id, name, quantity, unit_price, line_total)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(sale.id)
            .bind(line.product_id)
            .bind(&line.name)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.line_total)
            .fetch_one(&mut *tx)
            .await
            .context(format!("Failed to save sale item for product {}", line.product_id))?;
            items.push(item);

            let remaining: Option<i64> = sqlx::query_scalar(
                "UPDATE products SET stock = stock - ?, updated_at = ? WHERE id = ? RETURNING stock",
            )
            .bind(line.quantity)
            .bind(now)
            .bind(line.product_id)
            .fetch_optional(&mut *tx)
            .await
            .context(format!("Failed to decrement stock for product {}", line.product_id))?;
            match remaining {
                Some(stock) if stock < 0 => log::warn!(
                    "Product {} oversold by {} after sale {}",
                    line.product_id,
                    -stock,
                    sale.id
                ),
                None => log::warn!(
                    "Product {} vanished before sale {} was finalized",
                    line.product_id,
                    sale.id
                ),
                _ => {}
            }
        }

        let link = format!(
            "UPDATE {} SET sale_id = ?, updated_at = ? WHERE id = ? AND status = 'confirmed' AND sale_id IS NULL",
            payment.source.payment_table()
        );
        let linked = sqlx::query(&link)
            .bind(sale.id)
            .bind(now)
            .bind(&payment.payment_id)
            .execute(&mut *tx)
            .await
            .context(format!("Failed to link sale {} to payment", sale.id))?;
        if linked.rows_affected() != 1 {
            tx.rollback().await.context("Failed to roll back finalization")?;
            return Err(anyhow::anyhow!(
                "Payment {} is not confirmed or already linked to a sale",
                payment.payment_id
            ));
        }

        tx.commit().await.context("Failed to commit finalization")?;
        log::info!(
            "Finalized sale id={} total={} for {} payment {}",
            sale.id,
            sale.total,
            payment.source,
            payment.payment_id
        );
        Ok(FinalizeOutcome::Created(SaleWithItems { sale, items }))
    }

    async fn find_sale_by_payment(
        tx: &mut Transaction<'_, Sqlite>,
        source: PaymentSource,
        payment_id: &str,
    ) -> anyhow::Result<Option<SaleWithItems>> {
        let sale = sqlx::query_as::<_, Sale>(
            "SELECT * FROM sales WHERE payment_source = ? AND payment_id = ?",
        )
        .bind(source)
        .bind(payment_id)
        .fetch_optional(&mut **tx)
        .await
        .context(format!("Failed to look up sale for payment {}", payment_id))?;

        let Some(sale) = sale else {
            return Ok(None);
        };
        let items = sqlx::query_as::<_, SaleItem>("SELECT * FROM sale_items WHERE sale_id = ?")
            .bind(sale.id)
            .fetch_all(&mut **tx)
            .await
            .context(format!("Failed to get items for sale {}", sale.id))?;
        Ok(Some(SaleWithItems { sale, items }))
    }

    pub async fn get_sale_by_payment(
        &self,
        source: PaymentSource,
        payment_id: &str,
    ) -> anyhow::Result<Option<SaleWithItems>> {
        let mut tx = self.pool.begin().await.context("Failed to begin read")?;
        let sale = Self::find_sale_by_payment(&mut tx, source, payment_id).await?;
        tx.commit().await.context("Failed to close read")?;
        Ok(sale)
    }

    pub async fn get_sale(&self, sale_id: i64) -> anyhow::Result<Option<SaleWithItems>> {
        let sale = sqlx::query_as::<_, Sale>("SELECT * FROM sales WHERE id = ?")
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to get sale with id {}", sale_id))?;

        let Some(sale) = sale else {
            return Ok(None);
        };
        let items = sqlx::query_as::<_, SaleItem>("SELECT * FROM sale_items WHERE sale_id = ?")
            .bind(sale.id)
            .fetch_all(&self.pool)
            .await
            .context(format!("Failed to get items for sale {}", sale.id))?;
        Ok(Some(SaleWithItems { sale, items }))
    }

    pub async fn get_sales(&self) -> anyhow::Result<Vec<Sale>> {
        let sales = sqlx::query_as::<_, Sale>("SELECT * FROM sales ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to get all sales")?;
        Ok(sales)
    }

    pub fn stream_sales(&self) -> impl Stream<Item = Result<Sale, sqlx::Error>> + Unpin + '_ {
        sqlx::query_as::<_, Sale>("SELECT * FROM sales ORDER BY id").fetch(&self.pool)
    }
}
