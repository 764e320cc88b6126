use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub sku: String,
    /// Whole shillings; the provider does not accept fractional amounts.
    pub price: i64,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
}

impl Product {
    pub fn new(name: &str, sku: &str, price: i64, stock: i64) -> Self {
        Product {
            id: 0, //set by DB
            name: name.to_string(),
            sku: sku.to_string(),
            price,
            stock,
            created_at: None,
            updated_at: None,
        }
    }

    pub async fn from_yaml_file(path: &str) -> anyhow::Result<Vec<Product>> {
        let content = tokio::fs::read_to_string(path).await?;
        let products: Vec<Product> = serde_yaml::from_str(&content)?;
        if let Some(bad) = products.iter().find(|p| p.price < 0 || p.sku.trim().is_empty()) {
            return Err(anyhow::anyhow!(
                "Product '{}' must have a sku and a non-negative price",
                bad.name
            ));
        }
        log::debug!("Loaded {} products from {}", products.len(), path);
        Ok(products)
    }
}
