//! # Fiscal Outbox Repository
//!
//! Queue of completed sales waiting for fiscal document emission.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  complete_sale()                                                        │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. UPDATE sales SET status = 'completed' WHERE status = 'open' │   │
//! │  │  2. stock exits                                                 │   │
//! │  │  3. INSERT INTO fiscal_outbox (sale_id)                         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │ COMMIT                                                          │
//! │       ▼                                                                 │
//! │  Fiscal worker (comanda-engine)                                         │
//! │  1. get_pending()                                                       │
//! │  2. emit via the fiscal service                                         │
//! │  3. record_result(): sale fiscal fields + outbox row, one transaction   │
//! │     or mark_failed(): attempts += 1, last_error                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A sale is never lost and its fiscal entry is never orphaned; emission
//! can lag completion indefinitely without blocking the terminal.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;
use comanda_core::{FiscalOutboxEntry, FiscalStatus};

const SELECT_ENTRY: &str = "SELECT id, sale_id, attempts, last_error, created_at, \
     attempted_at, processed_at FROM fiscal_outbox";

/// Inserts an outbox entry on the given connection (the completion tx).
pub(crate) async fn enqueue(conn: &mut SqliteConnection, sale_id: &str) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO fiscal_outbox (id, sale_id, attempts, created_at) VALUES (?, ?, 0, ?) \
         ON CONFLICT (sale_id) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(sale_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    debug!(sale_id = %sale_id, "Queued for fiscal emission");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FiscalOutboxRepository {
    pool: SqlitePool,
}

impl FiscalOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        FiscalOutboxRepository { pool }
    }

    /// Unprocessed entries with fewer than `max_attempts` attempts, oldest
    /// first.
    pub async fn get_pending(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> DbResult<Vec<FiscalOutboxEntry>> {
        let entries = sqlx::query_as::<_, FiscalOutboxEntry>(&format!(
            "{SELECT_ENTRY} WHERE processed_at IS NULL AND attempts < ? \
             ORDER BY created_at LIMIT ?"
        ))
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn get_for_sale(&self, sale_id: &str) -> DbResult<Option<FiscalOutboxEntry>> {
        let entry = sqlx::query_as::<_, FiscalOutboxEntry>(&format!(
            "{SELECT_ENTRY} WHERE sale_id = ?"
        ))
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Stores the emission outcome on the sale and closes the entry.
    ///
    /// `Pending` keeps the entry open (the service accepted the request but
    /// has not decided yet) and only stamps the attempt.
    pub async fn record_result(
        &self,
        entry_id: &str,
        sale_id: &str,
        status: FiscalStatus,
        document_url: Option<&str>,
        message: Option<&str>,
    ) -> DbResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE sales SET fiscal_status = ?, \
             fiscal_document_url = COALESCE(?, fiscal_document_url), \
             fiscal_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(document_url)
        .bind(message)
        .bind(now)
        .bind(sale_id)
        .execute(&mut *tx)
        .await?;

        let processed_at: Option<DateTime<Utc>> = match status {
            FiscalStatus::Pending => None,
            FiscalStatus::Authorized | FiscalStatus::Error => Some(now),
        };
        sqlx::query(
            "UPDATE fiscal_outbox SET attempts = attempts + 1, attempted_at = ?, \
             processed_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(now)
        .bind(processed_at)
        .bind(match status {
            FiscalStatus::Error => message,
            _ => None,
        })
        .bind(entry_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(sale_id = %sale_id, status = ?status, "Fiscal result recorded");
        Ok(())
    }

    /// Records a transport failure; the entry stays pending for retry.
    pub async fn mark_failed(&self, entry_id: &str, error: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE fiscal_outbox SET attempts = attempts + 1, last_error = ?, attempted_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Gives up on an entry after the retry budget: the sale is flagged
    /// `error` so the operator can re-issue the document by hand.
    pub async fn abandon(&self, entry_id: &str, sale_id: &str, error: &str) -> DbResult<()> {
        self.record_result(entry_id, sale_id, FiscalStatus::Error, None, Some(error))
            .await
    }

    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM fiscal_outbox WHERE processed_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Deletes entries processed before `before`. Returns the number removed.
    pub async fn cleanup_processed(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM fiscal_outbox WHERE processed_at IS NOT NULL AND processed_at < ?",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
