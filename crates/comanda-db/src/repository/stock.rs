//! # Stock Ledger
//!
//! Per-product quantity with an append-only movement log.
//!
//! ## Movement Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  every change to products.current_stock writes exactly one row:         │
//! │                                                                         │
//! │    kind      quantity   old_stock   new_stock   reason                  │
//! │    exit      2          10          8           venda      (complete)   │
//! │    entrance  2          8           10          devolução  (cancel)     │
//! │                                                                         │
//! │  rows are never updated or deleted                                      │
//! │  sale-driven movements run inside the sale's store transaction          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stock may go negative: the kitchen sells what it has even when the
//! count is behind.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use comanda_core::{MovementKind, StockMovement};

const SELECT_MOVEMENT: &str = "SELECT id, tenant_id, product_id, sale_id, kind, quantity, \
     old_stock, new_stock, reason, responsible_id, approver_id, created_at FROM stock_movements";

/// One requested stock change.
#[derive(Debug, Clone)]
pub struct MovementRequest<'a> {
    pub tenant_id: &'a str,
    pub product_id: &'a str,
    pub sale_id: Option<&'a str>,
    pub kind: MovementKind,
    pub quantity: i64,
    pub reason: &'a str,
    pub responsible_id: Option<&'a str>,
    pub approver_id: Option<&'a str>,
}

// =============================================================================
// Transaction Helpers
// =============================================================================

/// Whether the product tracks stock.
pub(crate) async fn tracks_stock(conn: &mut SqliteConnection, product_id: &str) -> DbResult<bool> {
    let tracked: Option<bool> =
        sqlx::query_scalar("SELECT track_stock FROM products WHERE id = ?")
            .bind(product_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(tracked.unwrap_or(false))
}

/// Applies one movement on the given connection (usually a transaction).
pub(crate) async fn record_movement(
    conn: &mut SqliteConnection,
    request: &MovementRequest<'_>,
) -> DbResult<StockMovement> {
    if request.quantity <= 0 {
        return Err(DbError::QueryFailed(format!(
            "stock movement quantity must be positive, got {}",
            request.quantity
        )));
    }

    let old_stock: i64 = sqlx::query_scalar("SELECT current_stock FROM products WHERE id = ?")
        .bind(request.product_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DbError::not_found("Product", request.product_id))?;

    let new_stock = match request.kind {
        MovementKind::Entrance => old_stock + request.quantity,
        MovementKind::Exit => old_stock - request.quantity,
    };
    let now = Utc::now();

    sqlx::query("UPDATE products SET current_stock = ?, updated_at = ? WHERE id = ?")
        .bind(new_stock)
        .bind(now)
        .bind(request.product_id)
        .execute(&mut *conn)
        .await?;

    let movement = StockMovement {
        id: Uuid::new_v4().to_string(),
        tenant_id: request.tenant_id.to_string(),
        product_id: request.product_id.to_string(),
        sale_id: request.sale_id.map(str::to_string),
        kind: request.kind,
        quantity: request.quantity,
        old_stock,
        new_stock,
        reason: request.reason.to_string(),
        responsible_id: request.responsible_id.map(str::to_string),
        approver_id: request.approver_id.map(str::to_string),
        created_at: now,
    };

    sqlx::query(
        "INSERT INTO stock_movements (id, tenant_id, product_id, sale_id, kind, quantity, \
         old_stock, new_stock, reason, responsible_id, approver_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&movement.id)
    .bind(&movement.tenant_id)
    .bind(&movement.product_id)
    .bind(&movement.sale_id)
    .bind(movement.kind)
    .bind(movement.quantity)
    .bind(movement.old_stock)
    .bind(movement.new_stock)
    .bind(&movement.reason)
    .bind(&movement.responsible_id)
    .bind(&movement.approver_id)
    .bind(movement.created_at)
    .execute(&mut *conn)
    .await?;

    debug!(
        product_id = %movement.product_id,
        kind = ?movement.kind,
        quantity = movement.quantity,
        new_stock,
        "Stock movement recorded"
    );

    Ok(movement)
}

/// Movements of a sale with the given kind and reason.
pub(crate) async fn movements_for_sale_in(
    conn: &mut SqliteConnection,
    sale_id: &str,
    kind: MovementKind,
    reason: &str,
) -> DbResult<Vec<StockMovement>> {
    let movements = sqlx::query_as::<_, StockMovement>(&format!(
        "{SELECT_MOVEMENT} WHERE sale_id = ? AND kind = ? AND reason = ? ORDER BY created_at"
    ))
    .bind(sale_id)
    .bind(kind)
    .bind(reason)
    .fetch_all(&mut *conn)
    .await?;
    Ok(movements)
}

// =============================================================================
// Repository
// =============================================================================

#[derive(Debug, Clone)]
pub struct StockRepository {
    pool: SqlitePool,
}

impl StockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        StockRepository { pool }
    }

    /// Records a manual movement (restock, count correction) in its own
    /// transaction.
    pub async fn adjust(&self, request: &MovementRequest<'_>) -> DbResult<StockMovement> {
        let mut tx = self.pool.begin().await?;
        let movement = record_movement(&mut tx, request).await?;
        tx.commit().await?;
        Ok(movement)
    }

    pub async fn current_stock(&self, product_id: &str) -> DbResult<i64> {
        sqlx::query_scalar("SELECT current_stock FROM products WHERE id = ?")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Product", product_id))
    }

    pub async fn movements_for_sale(&self, sale_id: &str) -> DbResult<Vec<StockMovement>> {
        let movements = sqlx::query_as::<_, StockMovement>(&format!(
            "{SELECT_MOVEMENT} WHERE sale_id = ? ORDER BY created_at, kind"
        ))
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(movements)
    }

    pub async fn movements_for_product(&self, product_id: &str) -> DbResult<Vec<StockMovement>> {
        let movements = sqlx::query_as::<_, StockMovement>(&format!(
            "{SELECT_MOVEMENT} WHERE product_id = ? ORDER BY created_at"
        ))
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(movements)
    }
}
