//! # Cash Session Repository
//!
//! Drawer shifts and their manual cash movements.
//!
//! ## Session Guards
//! ```text
//! open()            INSERT, partial unique index: one open session per tenant
//!                   (a racing second terminal hits UniqueViolation → Conflict)
//! add_transaction() INSERT ... SELECT ... WHERE session is open
//! close_with()      one transaction:
//!                   UPDATE ... WHERE status = 'open'   (takes the write lock)
//!                   read sales + movements ──► caller reconciles
//!                   UPDATE closing figures
//! ```
//!
//! The closing snapshot is written exactly once; a session that is closed
//! can't receive supplies, withdrawals, payments or a second close. Since
//! the status flips before the sales are read, a payment or completion
//! racing the close either lands in the report or is refused.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::sale::session_records;
use comanda_core::reconciliation::SaleRecord;
use comanda_core::{CashierSession, CashierTransaction};

const SELECT_SESSION: &str = "SELECT id, tenant_id, employee_id, kind, status, \
     initial_balance_cents, opened_at, closed_at, final_balance_cents, system_balance_cents, \
     difference_cents, closing_data, notes FROM cashier_sessions";

const SELECT_TRANSACTION: &str = "SELECT id, session_id, kind, amount_cents, description, \
     method, employee_id, approver_id, created_at FROM cashier_transactions";

/// Closing figures written once when the drawer is counted.
#[derive(Debug, Clone)]
pub struct SessionClosing {
    pub final_balance_cents: i64,
    pub system_balance_cents: i64,
    pub difference_cents: i64,
    /// Serialized Z report.
    pub closing_data: String,
    pub notes: Option<String>,
    pub closed_at: DateTime<Utc>,
}

async fn session_transactions(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> DbResult<Vec<CashierTransaction>> {
    let transactions = sqlx::query_as::<_, CashierTransaction>(&format!(
        "{SELECT_TRANSACTION} WHERE session_id = ? ORDER BY created_at"
    ))
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(transactions)
}

#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SessionRepository { pool }
    }

    /// Inserts an open session.
    ///
    /// ## Returns
    /// * `Err(DbError::Conflict)` - the tenant already has an open session
    pub async fn open(&self, session: &CashierSession) -> DbResult<()> {
        let result = sqlx::query(
            "INSERT INTO cashier_sessions (id, tenant_id, employee_id, kind, status, \
             initial_balance_cents, opened_at) VALUES (?, ?, ?, ?, 'open', ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.tenant_id)
        .bind(&session.employee_id)
        .bind(session.kind)
        .bind(session.initial_balance_cents)
        .bind(session.opened_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(
                    session_id = %session.id,
                    employee_id = %session.employee_id,
                    initial_balance_cents = session.initial_balance_cents,
                    "Cash session opened"
                );
                Ok(())
            }
            Err(e) => match DbError::from(e) {
                DbError::UniqueViolation { .. } => Err(DbError::conflict(
                    "CashierSession",
                    &session.tenant_id,
                    "without an open session",
                )),
                other => Err(other),
            },
        }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<CashierSession>> {
        let session =
            sqlx::query_as::<_, CashierSession>(&format!("{SELECT_SESSION} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(session)
    }

    pub async fn require(&self, id: &str) -> DbResult<CashierSession> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("CashierSession", id))
    }

    /// The tenant's open session, if any.
    pub async fn current(&self, tenant_id: &str) -> DbResult<Option<CashierSession>> {
        let session = sqlx::query_as::<_, CashierSession>(&format!(
            "{SELECT_SESSION} WHERE tenant_id = ? AND status = 'open'"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Most recent sessions first.
    pub async fn list_recent(&self, tenant_id: &str, limit: u32) -> DbResult<Vec<CashierSession>> {
        let sessions = sqlx::query_as::<_, CashierSession>(&format!(
            "{SELECT_SESSION} WHERE tenant_id = ? ORDER BY opened_at DESC LIMIT ?"
        ))
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Records a supply or withdrawal against an open session.
    pub async fn add_transaction(&self, transaction: &CashierTransaction) -> DbResult<()> {
        let result = sqlx::query(
            "INSERT INTO cashier_transactions (id, session_id, kind, amount_cents, description, \
             method, employee_id, approver_id, created_at) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM cashier_sessions WHERE id = ? AND status = 'open')",
        )
        .bind(&transaction.id)
        .bind(&transaction.session_id)
        .bind(transaction.kind)
        .bind(transaction.amount_cents)
        .bind(&transaction.description)
        .bind(&transaction.method)
        .bind(&transaction.employee_id)
        .bind(&transaction.approver_id)
        .bind(transaction.created_at)
        .bind(&transaction.session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::conflict(
                "CashierSession",
                &transaction.session_id,
                "open",
            ));
        }

        debug!(
            session_id = %transaction.session_id,
            kind = ?transaction.kind,
            amount_cents = transaction.amount_cents,
            "Cash movement recorded"
        );
        Ok(())
    }

    pub async fn transactions(&self, session_id: &str) -> DbResult<Vec<CashierTransaction>> {
        let mut conn = self.pool.acquire().await?;
        session_transactions(&mut conn, session_id).await
    }

    /// Closes a session and writes its closing snapshot in one transaction.
    ///
    /// `settle` receives the session with every sale and cash movement as
    /// of the close and returns the figures to store plus a value for the
    /// caller. An error from `settle` rolls the close back.
    ///
    /// ## Returns
    /// * `Err(DbError::NotFound)` - unknown session
    /// * `Err(DbError::Conflict)` - already closed
    pub async fn close_with<T, E, F>(&self, session_id: &str, settle: F) -> Result<T, E>
    where
        F: FnOnce(
            &CashierSession,
            &[SaleRecord],
            &[CashierTransaction],
        ) -> Result<(SessionClosing, T), E>,
        E: From<DbError>,
    {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let result = sqlx::query(
            "UPDATE cashier_sessions SET status = 'closed' WHERE id = ? AND status = 'open'",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;
        if result.rows_affected() == 0 {
            let known: Option<String> =
                sqlx::query_scalar("SELECT id FROM cashier_sessions WHERE id = ?")
                    .bind(session_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(DbError::from)?;
            return Err(match known {
                Some(_) => DbError::conflict("CashierSession", session_id, "open"),
                None => DbError::not_found("CashierSession", session_id),
            }
            .into());
        }

        let session =
            sqlx::query_as::<_, CashierSession>(&format!("{SELECT_SESSION} WHERE id = ?"))
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(DbError::from)?;
        let sales = session_records(&mut tx, session_id).await?;
        let transactions = session_transactions(&mut tx, session_id).await?;

        let (closing, value) = settle(&session, &sales, &transactions)?;

        sqlx::query(
            "UPDATE cashier_sessions SET closed_at = ?, final_balance_cents = ?, \
             system_balance_cents = ?, difference_cents = ?, closing_data = ?, notes = ? \
             WHERE id = ?",
        )
        .bind(closing.closed_at)
        .bind(closing.final_balance_cents)
        .bind(closing.system_balance_cents)
        .bind(closing.difference_cents)
        .bind(&closing.closing_data)
        .bind(&closing.notes)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;

        info!(
            session_id = %session_id,
            sales = sales.len(),
            difference_cents = closing.difference_cents,
            "Cash session closed"
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{new_session, open_session, setup};
    use crate::Database;
    use comanda_core::{SessionStatus, TransactionKind, DEFAULT_TENANT_ID};
    use uuid::Uuid;

    fn supply(session_id: &str, employee_id: &str, amount: i64) -> CashierTransaction {
        CashierTransaction {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            kind: TransactionKind::Supply,
            amount_cents: amount,
            description: "troco".to_string(),
            method: Some("cash".to_string()),
            employee_id: employee_id.to_string(),
            approver_id: None,
            created_at: Utc::now(),
        }
    }

    fn closing(final_balance: i64, system_balance: i64) -> SessionClosing {
        SessionClosing {
            final_balance_cents: final_balance,
            system_balance_cents: system_balance,
            difference_cents: final_balance - system_balance,
            closing_data: "{}".to_string(),
            notes: Some("ok".to_string()),
            closed_at: Utc::now(),
        }
    }

    async fn close(db: &Database, session_id: &str, figures: SessionClosing) -> DbResult<()> {
        db.sessions()
            .close_with(session_id, |_, _, _| Ok((figures, ())))
            .await
    }

    #[tokio::test]
    async fn test_one_open_session_per_tenant() {
        let db = setup().await;
        let first = open_session(&db).await;

        let second = new_session(&first.employee_id, 0);
        let err = db.sessions().open(&second).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));

        let current = db.sessions().current(DEFAULT_TENANT_ID).await.unwrap().unwrap();
        assert_eq!(current.id, first.id);
    }

    #[tokio::test]
    async fn test_close_is_written_once() {
        let db = setup().await;
        let session = open_session(&db).await;

        close(&db, &session.id, closing(16_000, 15_500)).await.unwrap();
        let err = close(&db, &session.id, closing(0, 0)).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));

        let stored = db.sessions().require(&session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Closed);
        assert_eq!(stored.difference_cents, Some(500));
        assert!(stored.closed_at.is_some());
        assert!(db.sessions().current(DEFAULT_TENANT_ID).await.unwrap().is_none());

        let unknown = close(&db, "missing", closing(0, 0)).await.unwrap_err();
        assert!(matches!(unknown, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_settlement_keeps_session_open() {
        let db = setup().await;
        let session = open_session(&db).await;
        db.sessions()
            .add_transaction(&supply(&session.id, &session.employee_id, 2_000))
            .await
            .unwrap();

        let err = db
            .sessions()
            .close_with(&session.id, |seen, sales, transactions| {
                assert_eq!(seen.initial_balance_cents, 10_000);
                assert!(sales.is_empty());
                assert_eq!(transactions.len(), 1);
                Err::<(SessionClosing, ()), _>(DbError::Internal("report failed".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal(_)));

        let stored = db.sessions().require(&session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Open);
        assert!(stored.closing_data.is_none());
    }

    #[tokio::test]
    async fn test_transactions_require_open_session() {
        let db = setup().await;
        let session = open_session(&db).await;

        db.sessions()
            .add_transaction(&supply(&session.id, &session.employee_id, 2_000))
            .await
            .unwrap();
        assert_eq!(db.sessions().transactions(&session.id).await.unwrap().len(), 1);

        close(&db, &session.id, closing(12_000, 12_000)).await.unwrap();

        let err = db
            .sessions()
            .add_transaction(&supply(&session.id, &session.employee_id, 500))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
        assert_eq!(db.sessions().transactions(&session.id).await.unwrap().len(), 1);
    }
}
