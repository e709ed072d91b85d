//! # Cashier Session Manager
//!
//! Drawer lifecycle: open, manual cash movements, blind-count close with
//! the Z report.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Cashier Session Lifecycle                          │
//! │                                                                         │
//! │   open_session(float)                                                   │
//! │        │   one open session per tenant (partial unique index)           │
//! │        ▼                                                                │
//! │   ┌─────────┐  add_transaction(supply | withdrawal)                     │
//! │   │  OPEN   │◄──────────────────┐   withdrawals above the threshold     │
//! │   └────┬────┘───────────────────┘   need a manager                      │
//! │        │                                                                │
//! │        │ close_session(counted by method, notes)                        │
//! │        │   1. load session sales + movements                            │
//! │        │   2. reconcile → ZReport                                       │
//! │        │   3. guarded UPDATE ... WHERE status = 'open'                  │
//! │        │   4. print Z report (failure = warning)                        │
//! │        ▼                                                                │
//! │   ┌─────────┐                                                           │
//! │   │ CLOSED  │  terminal                                                 │
//! │   └─────────┘                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests carry an explicit [`SessionHandle`]. Operations that need an
//! open drawer re-check the stored status, so a handle held by a terminal
//! goes stale the moment another terminal closes the session.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use comanda_core::payment_methods::PaymentMethodRegistry;
use comanda_core::reconciliation::{reconcile, ZReport};
use comanda_core::validation::{
    validate_description, validate_non_negative_amount, validate_positive_amount,
};
use comanda_core::{
    Actor, CashierSession, CashierTransaction, Money, SessionKind, SessionStatus, TransactionKind,
};
use comanda_db::{Database, SessionClosing};

use crate::auth::{authorize, Approver};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::printing::{Ticket, TicketSink};

// =============================================================================
// Session Handle
// =============================================================================

/// The cashier session a request runs against.
///
/// Obtained from [`SessionManager`]; never built from a bare id.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: CashierSession,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.session.tenant_id
    }

    pub fn employee_id(&self) -> &str {
        &self.session.employee_id
    }

    pub fn kind(&self) -> SessionKind {
        self.session.kind
    }

    /// Session row as of when the handle was resolved.
    pub fn session(&self) -> &CashierSession {
        &self.session
    }
}

/// Re-reads the session and fails with `CashierClosed` unless it is open.
pub(crate) async fn ensure_open(
    db: &Database,
    handle: &SessionHandle,
) -> EngineResult<CashierSession> {
    match db.sessions().get_by_id(handle.id()).await? {
        Some(session) if session.is_open() => Ok(session),
        _ => {
            debug!(session_id = %handle.id(), "Session is not open");
            Err(EngineError::CashierClosed)
        }
    }
}

// =============================================================================
// Requests & Outcomes
// =============================================================================

/// A manual supply or withdrawal.
#[derive(Debug, Clone, Copy)]
pub struct CashMovement<'a> {
    pub kind: TransactionKind,
    pub amount: Money,
    pub description: &'a str,
    /// Free label ("Dinheiro", "pix"); informational.
    pub method: Option<&'a str>,
}

impl<'a> CashMovement<'a> {
    pub fn supply(amount: Money, description: &'a str) -> Self {
        CashMovement {
            kind: TransactionKind::Supply,
            amount,
            description,
            method: None,
        }
    }

    pub fn withdrawal(amount: Money, description: &'a str) -> Self {
        CashMovement {
            kind: TransactionKind::Withdrawal,
            amount,
            description,
            method: None,
        }
    }

    pub fn with_method(mut self, method: &'a str) -> Self {
        self.method = Some(method);
        self
    }
}

/// Result of a successful close.
#[derive(Debug, Clone)]
pub struct SessionClose {
    pub report: ZReport,
    /// Non-fatal problems (Z report not printed, sales left open).
    pub warnings: Vec<String>,
}

// =============================================================================
// Session Manager
// =============================================================================

#[derive(Clone)]
pub struct SessionManager {
    db: Database,
    config: Arc<EngineConfig>,
    registry: PaymentMethodRegistry,
    sink: Arc<dyn TicketSink>,
    feed: ChangeFeed,
}

impl SessionManager {
    pub fn new(
        db: Database,
        config: Arc<EngineConfig>,
        sink: Arc<dyn TicketSink>,
        feed: ChangeFeed,
    ) -> Self {
        let registry = config.payment_registry();
        SessionManager {
            db,
            config,
            registry,
            sink,
            feed,
        }
    }

    /// Opens the drawer of the store.
    ///
    /// ## Returns
    /// * `Err(SessionAlreadyOpen)` - another session is open, including the
    ///   case where a second terminal won the race
    pub async fn open_session(
        &self,
        actor: &Actor,
        initial_balance: Money,
        kind: SessionKind,
    ) -> EngineResult<SessionHandle> {
        validate_non_negative_amount("initial_balance", initial_balance)?;

        let tenant_id = self.config.tenant_id();
        if self.db.sessions().current(tenant_id).await?.is_some() {
            return Err(EngineError::SessionAlreadyOpen);
        }

        let session = CashierSession {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            employee_id: actor.employee_id.clone(),
            kind,
            status: SessionStatus::Open,
            initial_balance_cents: initial_balance.cents(),
            opened_at: Utc::now(),
            closed_at: None,
            final_balance_cents: None,
            system_balance_cents: None,
            difference_cents: None,
            closing_data: None,
            notes: None,
        };

        match self.db.sessions().open(&session).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Err(EngineError::SessionAlreadyOpen),
            Err(e) => return Err(e.into()),
        }

        self.feed.publish(ChangeEvent::SessionOpened {
            session_id: session.id.clone(),
        });
        Ok(SessionHandle { session })
    }

    /// The open session of the store, if any.
    pub async fn current_session(&self) -> EngineResult<Option<SessionHandle>> {
        let session = self.db.sessions().current(self.config.tenant_id()).await?;
        Ok(session.map(|session| SessionHandle { session }))
    }

    pub async fn require_current(&self) -> EngineResult<SessionHandle> {
        self.current_session()
            .await?
            .ok_or(EngineError::NoOpenSession)
    }

    /// Records a supply or withdrawal.
    ///
    /// Withdrawals above `cash.manager_withdrawal_threshold_cents` need a
    /// manager actor or a verified approver. `method` is kept as a label
    /// only; manual movements always count against the cash drawer.
    pub async fn add_transaction(
        &self,
        handle: &SessionHandle,
        actor: &Actor,
        movement: CashMovement<'_>,
        approver: Option<&Approver>,
    ) -> EngineResult<CashierTransaction> {
        let CashMovement {
            kind,
            amount,
            description,
            method,
        } = movement;
        validate_positive_amount("amount", amount)?;
        let description = validate_description(description)?;

        let approver_id = if kind == TransactionKind::Withdrawal
            && amount > self.config.withdrawal_threshold()
        {
            authorize(actor, approver, "withdraw cash")?
                .approver_id()
                .map(str::to_string)
        } else {
            None
        };

        let method = method
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|m| match self.registry.get(m) {
                Some(def) => def.id.clone(),
                None => m.to_string(),
            });

        let transaction = CashierTransaction {
            id: Uuid::new_v4().to_string(),
            session_id: handle.id().to_string(),
            kind,
            amount_cents: amount.cents(),
            description,
            method,
            employee_id: actor.employee_id.clone(),
            approver_id,
            created_at: Utc::now(),
        };

        match self.db.sessions().add_transaction(&transaction).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Err(EngineError::NoOpenSession),
            Err(e) => return Err(e.into()),
        }

        info!(
            session_id = %handle.id(),
            kind = ?kind,
            amount = %amount,
            approver = ?transaction.approver_id,
            "Cash movement recorded"
        );
        Ok(transaction)
    }

    /// Reconciliation of the session so far, without closing it (X report).
    pub async fn partial_report(&self, handle: &SessionHandle) -> EngineResult<ZReport> {
        let session = self.db.sessions().require(handle.id()).await?;
        let sales = self.db.sales().records_for_session(&session.id).await?;
        let transactions = self.db.sessions().transactions(&session.id).await?;

        Ok(reconcile(
            &session,
            &sales,
            &transactions,
            &BTreeMap::new(),
            &self.registry,
            Utc::now(),
            None,
        ))
    }

    /// Closes the session against the operator's blind count.
    ///
    /// `counted` maps payment-method labels to counted amounts; labels are
    /// normalized through the registry, unknown ones land in "other".
    pub async fn close_session(
        &self,
        handle: &SessionHandle,
        counted: &BTreeMap<String, Money>,
        notes: Option<&str>,
    ) -> EngineResult<SessionClose> {
        for (method, amount) in counted {
            validate_non_negative_amount(method, *amount)?;
        }
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());

        // Reconciled inside the closing transaction: a payment or completion
        // racing the close is either counted here or refused by the store.
        let report = self
            .db
            .sessions()
            .close_with(handle.id(), |session, sales, transactions| {
                let closed_at = Utc::now();
                let report = reconcile(
                    session,
                    sales,
                    transactions,
                    counted,
                    &self.registry,
                    closed_at,
                    notes.map(str::to_string),
                );
                let closing = SessionClosing {
                    final_balance_cents: report.reported_total.cents(),
                    system_balance_cents: report.system_balance.cents(),
                    difference_cents: report.difference.cents(),
                    closing_data: report.closing_data_json()?,
                    notes: notes.map(str::to_string),
                    closed_at,
                };
                Ok::<_, EngineError>((closing, report))
            })
            .await?;
        let session_id = handle.id();

        info!(
            session_id = %session_id,
            system_balance = %report.system_balance,
            reported = %report.reported_total,
            difference = %report.difference,
            "Cash session closed"
        );

        let mut warnings = Vec::new();
        if !report.open_sale_ids.is_empty() {
            warn!(
                session_id = %session_id,
                open_sales = report.open_sale_ids.len(),
                "Session closed with open sales"
            );
            warnings.push(format!(
                "{} sale(s) still open at close",
                report.open_sale_ids.len()
            ));
        }

        if let Err(e) = self.sink.print(Ticket::ZReport(Box::new(report.clone()))).await {
            warn!(session_id = %session_id, error = %e, "Z report not printed");
            warnings.push(format!("Z report not printed: {e}"));
        }

        self.feed.publish(ChangeEvent::SessionClosed {
            session_id: session_id.to_string(),
        });

        Ok(SessionClose { report, warnings })
    }
}
