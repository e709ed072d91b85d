//! # Sale Repository
//!
//! Store operations for sales, their items and payments.
//!
//! ## Sale Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sale Lifecycle                                    │
//! │                                                                         │
//! │  1. FIRST WRITE (send to production / first payment)                    │
//! │     └── save(SaleWrite { stored: false, .. })                           │
//! │         sale row + pending items + payments, one transaction            │
//! │                                                                         │
//! │  2. LATER WRITES                                                        │
//! │     └── save(SaleWrite { stored: true, .. })                            │
//! │         header guarded by status IN ('open','reserved')                 │
//! │                                                                         │
//! │  3. COMPLETE                                                            │
//! │     └── complete_sale() ─ one transaction:                              │
//! │         session still open, totals recomputed from stored rows,         │
//! │         guarded open → completed, stock exits ("venda"),                │
//! │         optional item release, fiscal outbox entry                      │
//! │                                                                         │
//! │  4. CANCEL                                                              │
//! │     └── cancel_sale() ─ one transaction:                                │
//! │         guarded → cancelled, exact restore of this sale's exits         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every state change is a conditional update. When the guard matches no
//! row the caller lost a race (or repeated itself) and gets
//! [`DbError::Conflict`]; nothing else in the transaction is applied.
//!
//! Payments and completions re-check the cashier session inside their own
//! transaction. The caller's in-memory figures are never trusted for the
//! completion: a copy loaded before another terminal added lines is
//! refused with [`DbError::Unsettled`].

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::stock::MovementRequest;
use crate::repository::{fiscal, stock};
use comanda_core::pricing::{compute_totals, Discount, PricingPolicy, SaleTotals};
use comanda_core::reconciliation::SaleRecord;
use comanda_core::{
    Destination, DiscountKind, FiscalStatus, Money, MovementKind, Payment, ProductionStatus,
    Sale, SaleItem, StockMovement, STOCK_REASON_RETURN, STOCK_REASON_SALE,
};

const SELECT_SALE: &str = "SELECT id, tenant_id, session_id, table_label, customer_label, \
     people_count, status, origin, subtotal_cents, service_fee_enabled, service_fee_cents, \
     discount_kind, discount_value, discount_cents, discount_reason, total_cents, \
     payment_method, external_order_id, fiscal_status, fiscal_document_url, fiscal_message, \
     cancel_reason, created_at, updated_at, completed_at, cancelled_at FROM sales";

const SELECT_ITEM: &str = "SELECT id, sale_id, product_id, name_snapshot, quantity, \
     unit_price_cents, production_status, destination, notes, created_at, status_changed_at \
     FROM sale_items";

const SELECT_PAYMENT: &str = "SELECT id, sale_id, method, amount_cents, created_at FROM payments";

// =============================================================================
// Write Descriptors
// =============================================================================

/// What changed on an aggregate since its last persistence point.
#[derive(Debug, Clone, Copy)]
pub struct SaleWrite<'a> {
    /// Header as it should be stored.
    pub sale: &'a Sale,
    /// Whether the sale row already exists.
    pub stored: bool,
    /// Lines not yet in the store.
    pub new_items: &'a [SaleItem],
    /// Payments not yet in the store.
    pub new_payments: &'a [Payment],
}

/// Side effects of a completion.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions<'a> {
    /// Rules used to recompute the stored figures.
    pub policy: &'a PricingPolicy,
    /// Mark every item delivered in the same transaction.
    pub release_items: bool,
    /// Write a fiscal outbox entry and set `fiscal_status = pending`.
    pub enqueue_fiscal: bool,
    /// Employee recorded on the stock movements.
    pub responsible_id: Option<&'a str>,
}

/// Result of a completion.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// Figures computed from the stored items and payments.
    pub totals: SaleTotals,
    pub movements: Vec<StockMovement>,
    pub released_items: u64,
}

/// Which items a batch production transition touches.
#[derive(Debug, Clone, Copy)]
pub struct ProductionFilter<'a> {
    pub tenant_id: &'a str,
    /// Station destination. Unresolved items always match.
    pub destination: Option<Destination>,
    pub sale_id: Option<&'a str>,
}

// =============================================================================
// Transaction Helpers
// =============================================================================

async fn insert_sale(conn: &mut SqliteConnection, sale: &Sale) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO sales (id, tenant_id, session_id, table_label, customer_label, people_count, \
         status, origin, subtotal_cents, service_fee_enabled, service_fee_cents, discount_kind, \
         discount_value, discount_cents, discount_reason, total_cents, payment_method, \
         external_order_id, fiscal_status, fiscal_document_url, fiscal_message, cancel_reason, \
         created_at, updated_at, completed_at, cancelled_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&sale.id)
    .bind(&sale.tenant_id)
    .bind(&sale.session_id)
    .bind(&sale.table_label)
    .bind(&sale.customer_label)
    .bind(sale.people_count)
    .bind(sale.status)
    .bind(sale.origin)
    .bind(sale.subtotal_cents)
    .bind(sale.service_fee_enabled)
    .bind(sale.service_fee_cents)
    .bind(sale.discount_kind)
    .bind(sale.discount_value)
    .bind(sale.discount_cents)
    .bind(&sale.discount_reason)
    .bind(sale.total_cents)
    .bind(&sale.payment_method)
    .bind(&sale.external_order_id)
    .bind(sale.fiscal_status)
    .bind(&sale.fiscal_document_url)
    .bind(&sale.fiscal_message)
    .bind(&sale.cancel_reason)
    .bind(sale.created_at)
    .bind(sale.updated_at)
    .bind(sale.completed_at)
    .bind(sale.cancelled_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Writes the mutable header fields while the sale is still open/reserved.
async fn update_mutable_header(conn: &mut SqliteConnection, sale: &Sale) -> DbResult<()> {
    let result = sqlx::query(
        "UPDATE sales SET session_id = COALESCE(session_id, ?), table_label = ?, \
         customer_label = ?, people_count = ?, status = ?, subtotal_cents = ?, \
         service_fee_enabled = ?, service_fee_cents = ?, discount_kind = ?, discount_value = ?, \
         discount_cents = ?, discount_reason = ?, total_cents = ?, payment_method = ?, \
         updated_at = ? \
         WHERE id = ? AND status IN ('open', 'reserved')",
    )
    .bind(&sale.session_id)
    .bind(&sale.table_label)
    .bind(&sale.customer_label)
    .bind(sale.people_count)
    .bind(sale.status)
    .bind(sale.subtotal_cents)
    .bind(sale.service_fee_enabled)
    .bind(sale.service_fee_cents)
    .bind(sale.discount_kind)
    .bind(sale.discount_value)
    .bind(sale.discount_cents)
    .bind(&sale.discount_reason)
    .bind(sale.total_cents)
    .bind(&sale.payment_method)
    .bind(Utc::now())
    .bind(&sale.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict("Sale", &sale.id, "open"));
    }
    Ok(())
}

async fn insert_item(conn: &mut SqliteConnection, item: &SaleItem) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO sale_items (id, sale_id, product_id, name_snapshot, quantity, \
         unit_price_cents, production_status, destination, notes, created_at, status_changed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&item.id)
    .bind(&item.sale_id)
    .bind(&item.product_id)
    .bind(&item.name_snapshot)
    .bind(item.quantity)
    .bind(item.unit_price_cents)
    .bind(item.production_status)
    .bind(item.destination)
    .bind(&item.notes)
    .bind(item.created_at)
    .bind(item.status_changed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_payment(conn: &mut SqliteConnection, payment: &Payment) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO payments (id, sale_id, method, amount_cents, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&payment.id)
    .bind(&payment.sale_id)
    .bind(&payment.method)
    .bind(payment.amount_cents)
    .bind(payment.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fails unless the sale's cashier session is open.
///
/// Runs after the transaction has written, so the session can't be closed
/// between this check and the commit.
async fn ensure_session_open(conn: &mut SqliteConnection, sale_id: &str) -> DbResult<()> {
    let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT s.session_id, cs.status FROM sales s \
         LEFT JOIN cashier_sessions cs ON cs.id = s.session_id WHERE s.id = ?",
    )
    .bind(sale_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        None => Err(DbError::not_found("Sale", sale_id)),
        Some((_, Some(status))) if status == "open" => Ok(()),
        Some((session_id, _)) => Err(DbError::session_not_open(
            session_id.unwrap_or_else(|| "(none)".to_string()),
        )),
    }
}

/// Recomputes a sale's figures from what is stored, not from the caller.
async fn stored_totals(
    conn: &mut SqliteConnection,
    sale_id: &str,
    policy: &PricingPolicy,
) -> DbResult<SaleTotals> {
    let (service_fee_enabled, discount_kind, discount_value): (bool, Option<DiscountKind>, i64) =
        sqlx::query_as(
            "SELECT service_fee_enabled, discount_kind, discount_value FROM sales WHERE id = ?",
        )
        .bind(sale_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DbError::not_found("Sale", sale_id))?;

    let lines: Vec<(i64, i64)> =
        sqlx::query_as("SELECT quantity, unit_price_cents FROM sale_items WHERE sale_id = ?")
            .bind(sale_id)
            .fetch_all(&mut *conn)
            .await?;
    if lines.is_empty() {
        return Err(DbError::conflict("Sale", sale_id, "holding items"));
    }

    let paid: Vec<i64> = sqlx::query_scalar("SELECT amount_cents FROM payments WHERE sale_id = ?")
        .bind(sale_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(compute_totals(
        lines
            .into_iter()
            .map(|(quantity, unit)| (quantity, Money::from_cents(unit))),
        service_fee_enabled,
        discount_kind.map(|kind| Discount {
            kind,
            value: discount_value,
        }),
        paid.into_iter().map(Money::from_cents),
        policy,
    ))
}

/// Every sale of a session with items and payments.
pub(crate) async fn session_records(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> DbResult<Vec<SaleRecord>> {
    let sales = sqlx::query_as::<_, Sale>(&format!(
        "{SELECT_SALE} WHERE session_id = ? ORDER BY created_at"
    ))
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?;

    let items = sqlx::query_as::<_, SaleItem>(&format!(
        "{SELECT_ITEM} WHERE sale_id IN (SELECT id FROM sales WHERE session_id = ?) \
         ORDER BY created_at, id"
    ))
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?;

    let payments = sqlx::query_as::<_, Payment>(&format!(
        "{SELECT_PAYMENT} WHERE sale_id IN (SELECT id FROM sales WHERE session_id = ?) \
         ORDER BY created_at, id"
    ))
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(assemble(sales, items, payments))
}

/// Header + new children, in the caller's transaction.
async fn write_changes(conn: &mut SqliteConnection, write: &SaleWrite<'_>) -> DbResult<()> {
    if write.stored {
        update_mutable_header(conn, write.sale).await?;
    } else {
        insert_sale(conn, write.sale).await?;
    }
    for item in write.new_items {
        insert_item(conn, item).await?;
    }
    for payment in write.new_payments {
        insert_payment(conn, payment).await?;
    }
    Ok(())
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for sale store operations.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Sale>> {
        let sale = sqlx::query_as::<_, Sale>(&format!("{SELECT_SALE} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sale)
    }

    pub async fn require(&self, id: &str) -> DbResult<Sale> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("Sale", id))
    }

    pub async fn get_items(&self, sale_id: &str) -> DbResult<Vec<SaleItem>> {
        let items = sqlx::query_as::<_, SaleItem>(&format!(
            "{SELECT_ITEM} WHERE sale_id = ? ORDER BY created_at, id"
        ))
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn get_payments(&self, sale_id: &str) -> DbResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "{SELECT_PAYMENT} WHERE sale_id = ? ORDER BY created_at, id"
        ))
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    /// Sale with its items and payments.
    pub async fn load(&self, id: &str) -> DbResult<SaleRecord> {
        let sale = self.require(id).await?;
        let items = self.get_items(id).await?;
        let payments = self.get_payments(id).await?;
        Ok(SaleRecord {
            sale,
            items,
            payments,
        })
    }

    pub async fn find_by_external_id(&self, external_order_id: &str) -> DbResult<Option<Sale>> {
        let sale =
            sqlx::query_as::<_, Sale>(&format!("{SELECT_SALE} WHERE external_order_id = ?"))
                .bind(external_order_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(sale)
    }

    /// Open and reserved sales of a tenant, optionally for one session.
    pub async fn list_open(
        &self,
        tenant_id: &str,
        session_id: Option<&str>,
    ) -> DbResult<Vec<Sale>> {
        let sales = match session_id {
            Some(session_id) => {
                sqlx::query_as::<_, Sale>(&format!(
                    "{SELECT_SALE} WHERE tenant_id = ? AND status IN ('open', 'reserved') \
                     AND (session_id = ? OR session_id IS NULL) ORDER BY created_at"
                ))
                .bind(tenant_id)
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Sale>(&format!(
                    "{SELECT_SALE} WHERE tenant_id = ? AND status IN ('open', 'reserved') \
                     ORDER BY created_at"
                ))
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(sales)
    }

    /// Every sale of a session with items and payments, for reconciliation.
    pub async fn records_for_session(&self, session_id: &str) -> DbResult<Vec<SaleRecord>> {
        let mut conn = self.pool.acquire().await?;
        session_records(&mut conn, session_id).await
    }

    /// Sales that still have undelivered items, with all their items.
    ///
    /// This is the raw input of every KDS station queue.
    pub async fn production_board(&self, tenant_id: &str) -> DbResult<Vec<(Sale, Vec<SaleItem>)>> {
        const ACTIVE: &str = "tenant_id = ? AND status IN ('open', 'completed') \
             AND EXISTS (SELECT 1 FROM sale_items si WHERE si.sale_id = sales.id \
             AND si.production_status != 'delivered')";

        let sales = sqlx::query_as::<_, Sale>(&format!(
            "{SELECT_SALE} WHERE {ACTIVE} ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, SaleItem>(&format!(
            "{SELECT_ITEM} WHERE sale_id IN (SELECT id FROM sales WHERE {ACTIVE}) \
             ORDER BY created_at, id"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(assemble(sales, items, Vec::new())
            .into_iter()
            .map(|r| (r.sale, r.items))
            .collect())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persists header changes plus new items and payments atomically.
    ///
    /// ## Returns
    /// * `Err(DbError::Conflict)` - stored sale is no longer open/reserved
    /// * `Err(DbError::SessionNotOpen)` - new payments but the drawer is closed
    /// * `Err(DbError::UniqueViolation)` - duplicate external order id
    pub async fn save(&self, write: SaleWrite<'_>) -> DbResult<()> {
        debug!(
            sale_id = %write.sale.id,
            stored = write.stored,
            new_items = write.new_items.len(),
            new_payments = write.new_payments.len(),
            "Saving sale"
        );

        let mut tx = self.pool.begin().await?;
        write_changes(&mut tx, &write).await?;
        if !write.new_payments.is_empty() {
            ensure_session_open(&mut tx, &write.sale.id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Deletes a stored item unless it was delivered, and rewrites the header.
    pub async fn delete_item(&self, sale: &Sale, item_id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "DELETE FROM sale_items WHERE id = ? AND sale_id = ? \
             AND production_status != 'delivered'",
        )
        .bind(item_id)
        .bind(&sale.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::conflict("SaleItem", item_id, "removable"));
        }

        update_mutable_header(&mut tx, sale).await?;
        tx.commit().await?;

        debug!(sale_id = %sale.id, item_id = %item_id, "Sale item deleted");
        Ok(())
    }

    /// Deletes a stored payment and rewrites the header.
    pub async fn delete_payment(&self, sale: &Sale, payment_id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM payments WHERE id = ? AND sale_id = ?")
            .bind(payment_id)
            .bind(&sale.id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Payment", payment_id));
        }

        update_mutable_header(&mut tx, sale).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Moves stored items between two sales and rewrites both headers.
    ///
    /// `target` is inserted first when it does not exist yet. The source
    /// header may carry `transferred` when it was emptied.
    pub async fn transfer_items(
        &self,
        source: &Sale,
        target: SaleWrite<'_>,
        stored_item_ids: &[String],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        write_changes(&mut tx, &target).await?;

        for item_id in stored_item_ids {
            let result = sqlx::query(
                "UPDATE sale_items SET sale_id = ? WHERE id = ? AND sale_id = ?",
            )
            .bind(&target.sale.id)
            .bind(item_id)
            .bind(&source.id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(DbError::conflict("SaleItem", item_id, "on the source sale"));
            }
        }

        update_mutable_header(&mut tx, source).await?;
        tx.commit().await?;

        info!(
            from = %source.id,
            to = %target.sale.id,
            items = stored_item_ids.len(),
            "Items transferred"
        );
        Ok(())
    }

    /// Completes a sale in one transaction.
    ///
    /// ## Steps
    /// 1. Pending header/items/payments are written
    /// 2. The sale's session must still be open
    /// 3. Totals are recomputed from the stored items and payments and
    ///    must be settled within the tolerance
    /// 4. `open → completed` guarded update with those figures
    /// 5. One `exit`/"venda" movement per stock-tracked product
    /// 6. Optional release of every item to `delivered`
    /// 7. Optional fiscal outbox entry
    ///
    /// ## Returns
    /// * `Err(DbError::Conflict)` - no longer open, or no stored items
    /// * `Err(DbError::SessionNotOpen)` - the drawer was closed
    /// * `Err(DbError::Unsettled)` - stored payments don't cover stored items
    pub async fn complete_sale(
        &self,
        write: SaleWrite<'_>,
        options: CompletionOptions<'_>,
    ) -> DbResult<CompletionOutcome> {
        let sale = write.sale;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        write_changes(&mut tx, &write).await?;
        ensure_session_open(&mut tx, &sale.id).await?;

        let totals = stored_totals(&mut tx, &sale.id, options.policy).await?;
        if !totals.is_settled() {
            debug!(
                sale_id = %sale.id,
                total_cents = totals.total.cents(),
                paid_cents = totals.total_paid.cents(),
                "Stored payments do not cover the sale"
            );
            return Err(DbError::Unsettled {
                sale_id: sale.id.clone(),
                remaining_cents: totals.remaining_due.cents(),
            });
        }

        let fiscal_status = options.enqueue_fiscal.then_some(FiscalStatus::Pending);
        let result = sqlx::query(
            "UPDATE sales SET status = 'completed', subtotal_cents = ?, service_fee_cents = ?, \
             discount_cents = ?, total_cents = ?, \
             fiscal_status = COALESCE(?, fiscal_status), completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'open' AND EXISTS (SELECT 1 FROM cashier_sessions cs \
             WHERE cs.id = sales.session_id AND cs.status = 'open')",
        )
        .bind(totals.subtotal.cents())
        .bind(totals.service_fee.cents())
        .bind(totals.discount.cents())
        .bind(totals.total.cents())
        .bind(fiscal_status)
        .bind(now)
        .bind(now)
        .bind(&sale.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::conflict("Sale", &sale.id, "open"));
        }

        let quantities: Vec<(String, i64)> = sqlx::query_as(
            "SELECT product_id, SUM(quantity) FROM sale_items \
             WHERE sale_id = ? AND product_id IS NOT NULL \
             GROUP BY product_id ORDER BY product_id",
        )
        .bind(&sale.id)
        .fetch_all(&mut *tx)
        .await?;

        let mut movements = Vec::new();
        for (product_id, quantity) in &quantities {
            if !stock::tracks_stock(&mut tx, product_id).await? {
                continue;
            }
            let movement = stock::record_movement(
                &mut tx,
                &MovementRequest {
                    tenant_id: &sale.tenant_id,
                    product_id,
                    sale_id: Some(&sale.id),
                    kind: MovementKind::Exit,
                    quantity: *quantity,
                    reason: STOCK_REASON_SALE,
                    responsible_id: options.responsible_id,
                    approver_id: None,
                },
            )
            .await?;
            movements.push(movement);
        }

        let released_items = if options.release_items {
            sqlx::query(
                "UPDATE sale_items SET production_status = 'delivered', status_changed_at = ? \
                 WHERE sale_id = ? AND production_status != 'delivered'",
            )
            .bind(now)
            .bind(&sale.id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            0
        };

        if options.enqueue_fiscal {
            fiscal::enqueue(&mut tx, &sale.id).await?;
        }

        tx.commit().await?;

        info!(
            sale_id = %sale.id,
            total_cents = totals.total.cents(),
            movements = movements.len(),
            released_items,
            "Sale completed"
        );

        Ok(CompletionOutcome {
            totals,
            movements,
            released_items,
        })
    }

    /// Cancels a sale and restores exactly the stock its completion took.
    ///
    /// A second call fails with `Conflict` before any stock is touched.
    pub async fn cancel_sale(
        &self,
        sale_id: &str,
        reason: &str,
        responsible_id: Option<&str>,
        approver_id: Option<&str>,
    ) -> DbResult<Vec<StockMovement>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE sales SET status = 'cancelled', cancel_reason = ?, cancelled_at = ?, \
             updated_at = ? WHERE id = ? AND status IN ('open', 'reserved', 'completed')",
        )
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(sale_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::conflict("Sale", sale_id, "cancellable"));
        }

        let tenant_id: String = sqlx::query_scalar("SELECT tenant_id FROM sales WHERE id = ?")
            .bind(sale_id)
            .fetch_one(&mut *tx)
            .await?;

        let exits =
            stock::movements_for_sale_in(&mut tx, sale_id, MovementKind::Exit, STOCK_REASON_SALE)
                .await?;

        let mut restored = Vec::with_capacity(exits.len());
        for exit in &exits {
            let movement = stock::record_movement(
                &mut tx,
                &MovementRequest {
                    tenant_id: &tenant_id,
                    product_id: &exit.product_id,
                    sale_id: Some(sale_id),
                    kind: MovementKind::Entrance,
                    quantity: exit.quantity,
                    reason: STOCK_REASON_RETURN,
                    responsible_id,
                    approver_id,
                },
            )
            .await?;
            restored.push(movement);
        }

        tx.commit().await?;

        info!(
            sale_id = %sale_id,
            restored = restored.len(),
            "Sale cancelled"
        );
        Ok(restored)
    }

    /// Batch production transition `from → to` over a filter.
    ///
    /// `SET status = to WHERE status = from` makes a repeated batch a no-op.
    /// Only items of open or completed sales move.
    pub async fn update_production(
        &self,
        filter: ProductionFilter<'_>,
        from: ProductionStatus,
        to: ProductionStatus,
    ) -> DbResult<u64> {
        let mut sql = String::from(
            "UPDATE sale_items SET production_status = ?, status_changed_at = ? \
             WHERE production_status = ? AND sale_id IN \
             (SELECT id FROM sales WHERE tenant_id = ? AND status IN ('open', 'completed'))",
        );
        if filter.destination.is_some() {
            sql.push_str(" AND (destination = ? OR destination IS NULL)");
        }
        if filter.sale_id.is_some() {
            sql.push_str(" AND sale_id = ?");
        }

        let mut query = sqlx::query(&sql)
            .bind(to)
            .bind(Utc::now())
            .bind(from)
            .bind(filter.tenant_id);
        if let Some(destination) = filter.destination {
            query = query.bind(destination);
        }
        if let Some(sale_id) = filter.sale_id {
            query = query.bind(sale_id);
        }

        let updated = query.execute(&self.pool).await?.rows_affected();
        debug!(
            from = from.as_str(),
            to = to.as_str(),
            destination = ?filter.destination,
            sale_id = ?filter.sale_id,
            updated,
            "Production batch applied"
        );
        Ok(updated)
    }
}

/// Groups items and payments under their sales, keeping sale order.
fn assemble(sales: Vec<Sale>, items: Vec<SaleItem>, payments: Vec<Payment>) -> Vec<SaleRecord> {
    let mut items_by_sale: HashMap<String, Vec<SaleItem>> = HashMap::new();
    for item in items {
        items_by_sale.entry(item.sale_id.clone()).or_default().push(item);
    }
    let mut payments_by_sale: HashMap<String, Vec<Payment>> = HashMap::new();
    for payment in payments {
        payments_by_sale
            .entry(payment.sale_id.clone())
            .or_default()
            .push(payment);
    }

    sales
        .into_iter()
        .map(|sale| SaleRecord {
            items: items_by_sale.remove(&sale.id).unwrap_or_default(),
            payments: payments_by_sale.remove(&sale.id).unwrap_or_default(),
            sale,
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::session::SessionClosing;
    use crate::repository::test_support::{open_session, product, setup};
    use crate::Database;
    use comanda_core::production::RoutingRules;
    use comanda_core::sale::{NewSale, SaleAggregate};
    use comanda_core::{CashierSession, Product, SaleStatus, DEFAULT_TENANT_ID};

    fn table(session: &CashierSession) -> SaleAggregate {
        let header = NewSale::table(&session.id, "Mesa 4", 2);
        SaleAggregate::new(DEFAULT_TENANT_ID, header, PricingPolicy::default()).unwrap()
    }

    fn counter(session: &CashierSession) -> SaleAggregate {
        let header = NewSale::counter(&session.id);
        SaleAggregate::new(DEFAULT_TENANT_ID, header, PricingPolicy::default()).unwrap()
    }

    async fn loaded(db: &Database, sale_id: &str) -> SaleAggregate {
        let record = db.sales().load(sale_id).await.unwrap();
        SaleAggregate::from_parts(
            record.sale,
            record.items,
            record.payments,
            PricingPolicy::default(),
        )
    }

    async fn store(db: &Database, sale: &mut SaleAggregate, new_payments: &[Payment]) {
        let items = sale.commit_pending();
        db.sales()
            .save(SaleWrite {
                sale: &sale.sale,
                stored: sale.stored,
                new_items: &items,
                new_payments,
            })
            .await
            .unwrap();
        sale.stored = true;
    }

    async fn complete(db: &Database, sale: &SaleAggregate) -> DbResult<CompletionOutcome> {
        db.sales()
            .complete_sale(
                SaleWrite {
                    sale: &sale.sale,
                    stored: true,
                    new_items: &[],
                    new_payments: &[],
                },
                CompletionOptions {
                    policy: &PricingPolicy::default(),
                    release_items: false,
                    enqueue_fiscal: true,
                    responsible_id: None,
                },
            )
            .await
    }

    async fn paid_sale(
        db: &Database,
        session: &CashierSession,
        lines: &[(&Product, i64)],
    ) -> SaleAggregate {
        let rules = RoutingRules::default();
        let mut sale = table(session);
        for (p, qty) in lines {
            sale.add_product(p, *qty, &rules).unwrap();
        }
        let payment = sale.add_payment("cash", None).unwrap();
        store(db, &mut sale, &[payment]).await;
        sale
    }

    fn closing() -> SessionClosing {
        SessionClosing {
            final_balance_cents: 0,
            system_balance_cents: 0,
            difference_cents: 0,
            closing_data: "{}".to_string(),
            notes: None,
            closed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_first_save_writes_everything() {
        let db = setup().await;
        let session = open_session(&db).await;
        let burger = product(&db, "X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let sale = paid_sale(&db, &session, &[(&burger, 2)]).await;

        let record = db.sales().load(sale.id()).await.unwrap();
        assert_eq!(record.sale.total_cents, 7040);
        assert_eq!(record.items.len(), 1);
        assert_eq!(record.items[0].production_status, ProductionStatus::Pending);
        assert_eq!(record.payments.len(), 1);
        assert_eq!(record.payments[0].amount_cents, 7040);
    }

    #[tokio::test]
    async fn test_complete_deducts_stock_once() {
        let db = setup().await;
        let session = open_session(&db).await;
        let beer = product(&db, "Cerveja", 1000, Some(10), Some(Destination::Bar)).await;
        let food = product(&db, "Feijoada", 5000, None, Some(Destination::Kitchen)).await;
        let sale = paid_sale(&db, &session, &[(&beer, 3), (&food, 1)]).await;

        let outcome = complete(&db, &sale).await.unwrap();
        assert_eq!(outcome.movements.len(), 1);
        assert_eq!(outcome.totals.total.cents(), 8800);
        assert_eq!(db.stock().current_stock(&beer.id).await.unwrap(), 7);

        let stored = db.sales().require(sale.id()).await.unwrap();
        assert_eq!(stored.status, SaleStatus::Completed);
        assert_eq!(stored.fiscal_status, Some(FiscalStatus::Pending));
        assert!(db.fiscal_outbox().get_for_sale(sale.id()).await.unwrap().is_some());

        // Second terminal completing the same sale loses the guard
        let err = complete(&db, &sale).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
        assert_eq!(db.stock().current_stock(&beer.id).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_stale_copy_cannot_complete_short() {
        let db = setup().await;
        let session = open_session(&db).await;
        let rules = RoutingRules::default();
        let soup = product(&db, "Sopa", 1000, None, Some(Destination::Kitchen)).await;
        let steak = product(&db, "Bife", 2000, Some(10), Some(Destination::Kitchen)).await;

        let mut sale = counter(&session);
        sale.add_product(&soup, 1, &rules).unwrap();
        let cash = sale.add_payment("cash", None).unwrap();
        store(&db, &mut sale, &[cash]).await;

        let stale = loaded(&db, sale.id()).await;
        let mut other = loaded(&db, sale.id()).await;
        other.add_product(&steak, 1, &rules).unwrap();
        store(&db, &mut other, &[]).await;

        let err = complete(&db, &stale).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Unsettled {
                remaining_cents: 2000,
                ..
            }
        ));
        let stored = db.sales().require(sale.id()).await.unwrap();
        assert_eq!(stored.status, SaleStatus::Open);
        assert_eq!(stored.total_cents, 3000);
        assert_eq!(db.stock().current_stock(&steak.id).await.unwrap(), 10);
        assert!(db.fiscal_outbox().get_for_sale(sale.id()).await.unwrap().is_none());

        // Once the second line is paid the stale copy completes at the stored total
        let pix = other.add_payment("pix", None).unwrap();
        store(&db, &mut other, &[pix]).await;
        let outcome = complete(&db, &stale).await.unwrap();
        assert_eq!(outcome.totals.total.cents(), 3000);
        assert_eq!(outcome.totals.total_paid.cents(), 3000);
        assert_eq!(db.sales().require(sale.id()).await.unwrap().total_cents, 3000);
        assert_eq!(db.stock().current_stock(&steak.id).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_payment_and_completion() {
        let db = setup().await;
        let session = open_session(&db).await;
        let rules = RoutingRules::default();
        let beer = product(&db, "Cerveja", 1000, Some(5), Some(Destination::Bar)).await;
        let paid = paid_sale(&db, &session, &[(&beer, 1)]).await;

        let mut unpaid = counter(&session);
        unpaid.add_product(&beer, 1, &rules).unwrap();
        store(&db, &mut unpaid, &[]).await;

        let sales_at_close = db
            .sessions()
            .close_with(&session.id, |_, sales, _| Ok::<_, DbError>((closing(), sales.len())))
            .await
            .unwrap();
        assert_eq!(sales_at_close, 2);

        let err = complete(&db, &paid).await.unwrap_err();
        assert!(matches!(err, DbError::SessionNotOpen { .. }));
        assert_eq!(
            db.sales().require(paid.id()).await.unwrap().status,
            SaleStatus::Open
        );
        assert_eq!(db.stock().current_stock(&beer.id).await.unwrap(), 5);

        let late = unpaid.add_payment("cash", None).unwrap();
        let err = db
            .sales()
            .save(SaleWrite {
                sale: &unpaid.sale,
                stored: true,
                new_items: &[],
                new_payments: std::slice::from_ref(&late),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::SessionNotOpen { .. }));
        assert!(db.sales().get_payments(unpaid.id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_restores_exactly_once() {
        let db = setup().await;
        let session = open_session(&db).await;
        let beer = product(&db, "Cerveja", 1000, Some(10), Some(Destination::Bar)).await;
        let sale = paid_sale(&db, &session, &[(&beer, 4)]).await;
        complete(&db, &sale).await.unwrap();
        assert_eq!(db.stock().current_stock(&beer.id).await.unwrap(), 6);

        let restored = db
            .sales()
            .cancel_sale(sale.id(), "cliente desistiu", None, Some("manager-1"))
            .await
            .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].reason, STOCK_REASON_RETURN);
        assert_eq!(db.stock().current_stock(&beer.id).await.unwrap(), 10);

        let again = db.sales().cancel_sale(sale.id(), "again", None, None).await;
        assert!(matches!(again, Err(DbError::Conflict { .. })));
        assert_eq!(db.stock().current_stock(&beer.id).await.unwrap(), 10);
        assert_eq!(db.stock().movements_for_sale(sale.id()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_production_batch_is_idempotent_and_fails_open() {
        let db = setup().await;
        let session = open_session(&db).await;
        let rules = RoutingRules::default();
        let burger = product(&db, "X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let beer = product(&db, "Chopp", 1200, None, Some(Destination::Bar)).await;

        let mut sale = table(&session);
        sale.add_product(&burger, 1, &rules).unwrap();
        sale.add_product(&beer, 1, &rules).unwrap();
        sale.add_line(comanda_core::sale::NewLine {
            product_id: None,
            name: "Prato do dia".to_string(),
            unit_price: Money::from_cents(2500),
            quantity: 1,
            destination: None,
            notes: None,
        })
        .unwrap();
        store(&db, &mut sale, &[]).await;

        let filter = ProductionFilter {
            tenant_id: DEFAULT_TENANT_ID,
            destination: Some(Destination::Kitchen),
            sale_id: None,
        };
        let moved = db
            .sales()
            .update_production(filter, ProductionStatus::Pending, ProductionStatus::Preparing)
            .await
            .unwrap();
        // Burger plus the unresolved line
        assert_eq!(moved, 2);

        let again = db
            .sales()
            .update_production(filter, ProductionStatus::Pending, ProductionStatus::Preparing)
            .await
            .unwrap();
        assert_eq!(again, 0);

        let board = db.sales().production_board(DEFAULT_TENANT_ID).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].1.len(), 3);
    }

    #[tokio::test]
    async fn test_delivered_item_cannot_be_deleted() {
        let db = setup().await;
        let session = open_session(&db).await;
        let water = product(&db, "Agua", 400, None, Some(Destination::None)).await;
        let mut sale = table(&session);
        sale.add_product(&water, 1, &RoutingRules::default()).unwrap();
        store(&db, &mut sale, &[]).await;

        let item_id = sale.items[0].id.clone();
        let err = db.sales().delete_item(&sale.sale, &item_id).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_session_records_group_children() {
        let db = setup().await;
        let session = open_session(&db).await;
        let burger = product(&db, "X-Burger", 3200, None, None).await;

        let mut sale = table(&session);
        sale.add_product(&burger, 1, &RoutingRules::default()).unwrap();
        let pix = sale.add_payment("pix", None).unwrap();
        store(&db, &mut sale, &[pix]).await;

        let records = db.sales().records_for_session(&session.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].items.len(), 1);
        assert_eq!(records[0].payments[0].method, "pix");
    }
}
