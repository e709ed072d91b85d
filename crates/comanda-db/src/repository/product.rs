//! # Product Repository
//!
//! Catalog lookups used by the sale engine and delivery intake. Catalog
//! maintenance itself happens outside the engine; `insert` exists for the
//! seed binary and tests.
//!
//! Stock levels are never written here. Every change to `current_stock`
//! goes through the stock ledger so a movement row explains it.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use comanda_core::Product;

const SELECT_PRODUCT: &str = "SELECT id, tenant_id, sku, name, price_cents, track_stock, \
     current_stock, destination, is_active, created_at, updated_at FROM products";

/// Repository for product lookups.
#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProductRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!("{SELECT_PRODUCT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(product)
    }

    /// Gets a product by id or fails with `NotFound`.
    pub async fn require(&self, id: &str) -> DbResult<Product> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("Product", id))
    }

    pub async fn get_by_sku(&self, tenant_id: &str, sku: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "{SELECT_PRODUCT} WHERE tenant_id = ? AND sku = ?"
        ))
        .bind(tenant_id)
        .bind(sku)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    /// Case-insensitive exact name match among active products.
    ///
    /// Used to attach delivery lines to catalog products.
    pub async fn find_by_name(&self, tenant_id: &str, name: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "{SELECT_PRODUCT} WHERE tenant_id = ? AND is_active = 1 \
             AND name = ? COLLATE NOCASE ORDER BY created_at LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    pub async fn list_active(&self, tenant_id: &str) -> DbResult<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(&format!(
            "{SELECT_PRODUCT} WHERE tenant_id = ? AND is_active = 1 ORDER BY name"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }

    /// Inserts a product.
    ///
    /// ## Returns
    /// * `Err(DbError::UniqueViolation)` - SKU already exists for the tenant
    pub async fn insert(&self, product: &Product) -> DbResult<()> {
        debug!(sku = %product.sku, "Inserting product");

        sqlx::query(
            "INSERT INTO products (id, tenant_id, sku, name, price_cents, track_stock, \
             current_stock, destination, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&product.id)
        .bind(&product.tenant_id)
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.price_cents)
        .bind(product.track_stock)
        .bind(product.current_stock)
        .bind(product.destination)
        .bind(product.is_active)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Soft-deletes a product. Historical sale lines keep referencing it.
    pub async fn deactivate(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE products SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Product", id));
        }
        Ok(())
    }

    /// Counts active products of a tenant (diagnostics, seed guard).
    pub async fn count(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products WHERE tenant_id = ? AND is_active = 1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{product, setup};
    use comanda_core::{Destination, DEFAULT_TENANT_ID};

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let db = setup().await;
        let beer = product(&db, "Chopp 300ml", 1200, Some(50), Some(Destination::Bar)).await;

        let loaded = db.products().require(&beer.id).await.unwrap();
        assert_eq!(loaded.destination, Some(Destination::Bar));
        assert!(loaded.track_stock);
        assert_eq!(loaded.current_stock, 50);

        let by_name = db
            .products()
            .find_by_name(DEFAULT_TENANT_ID, "chopp 300ML")
            .await
            .unwrap();
        assert_eq!(by_name.map(|p| p.id), Some(beer.id.clone()));
        assert_eq!(db.products().count(DEFAULT_TENANT_ID).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_sku_rejected() {
        let db = setup().await;
        let first = product(&db, "X-Burger", 3200, None, None).await;

        let mut copy = first.clone();
        copy.id = uuid::Uuid::new_v4().to_string();
        let err = db.products().insert(&copy).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_deactivated_products_are_hidden() {
        let db = setup().await;
        let p = product(&db, "Pudim", 900, None, Some(Destination::None)).await;

        db.products().deactivate(&p.id).await.unwrap();
        assert!(db
            .products()
            .find_by_name(DEFAULT_TENANT_ID, "Pudim")
            .await
            .unwrap()
            .is_none());
        assert!(db.products().list_active(DEFAULT_TENANT_ID).await.unwrap().is_empty());
    }
}
