//! # Fiscal Outbox Worker
//!
//! Drains the fiscal outbox written by `complete_sale` and records the
//! emission outcome on each sale.
//!
//! ## Worker Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fiscal Worker Flow                               │
//! │                                                                         │
//! │  every poll_interval_secs:                                              │
//! │                                                                         │
//! │  1. get_pending(batch_size, max_attempts)                               │
//! │                                                                         │
//! │  2. for each entry: load SaleRecord ──► FiscalEmitter::emit             │
//! │                                                                         │
//! │        authorized ──► record_result(authorized, url)   entry closed     │
//! │        error      ──► record_result(error, message)    entry closed     │
//! │        pending    ──► record_result(pending)           retried later    │
//! │        Err(_)     ──► mark_failed(attempts += 1)       retried later    │
//! │                                                                         │
//! │  3. last allowed attempt still not final ──► abandon:                   │
//! │        fiscal_status = error, operator re-issues by hand                │
//! │                                                                         │
//! │  every hour: delete entries processed more than 7 days ago             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Completion never waits for any of this.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use comanda_core::reconciliation::SaleRecord;
use comanda_core::{FiscalOutboxEntry, FiscalStatus};
use comanda_db::Database;

use crate::config::FiscalSettings;
use crate::error::{EngineError, EngineResult};

/// How long processed entries are kept.
const RETENTION_DAYS: i64 = 7;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

// =============================================================================
// Emitter
// =============================================================================

/// Answer of the fiscal service for one sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalOutcome {
    pub status: FiscalStatus,
    pub document_url: Option<String>,
    pub message: Option<String>,
}

impl FiscalOutcome {
    pub fn authorized(document_url: impl Into<String>) -> Self {
        FiscalOutcome {
            status: FiscalStatus::Authorized,
            document_url: Some(document_url.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        FiscalOutcome {
            status: FiscalStatus::Error,
            document_url: None,
            message: Some(message.into()),
        }
    }

    pub fn pending() -> Self {
        FiscalOutcome {
            status: FiscalStatus::Pending,
            document_url: None,
            message: None,
        }
    }
}

/// The external fiscal document service.
///
/// `Err` means the request did not get an answer (network, 5xx) and will
/// be retried; a rejection is an `Ok` with `FiscalStatus::Error`.
#[async_trait]
pub trait FiscalEmitter: Send + Sync {
    async fn emit(&self, record: &SaleRecord) -> EngineResult<FiscalOutcome>;
}

// =============================================================================
// Worker
// =============================================================================

/// Counts of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub authorized: usize,
    pub rejected: usize,
    pub pending: usize,
    pub failed: usize,
    pub abandoned: usize,
}

pub struct FiscalWorker {
    db: Database,
    emitter: Arc<dyn FiscalEmitter>,
    settings: FiscalSettings,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a spawned [`FiscalWorker`].
#[derive(Clone)]
pub struct FiscalWorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl FiscalWorkerHandle {
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| EngineError::external("fiscal worker", "shutdown channel closed"))
    }
}

impl FiscalWorker {
    pub fn new(
        db: Database,
        emitter: Arc<dyn FiscalEmitter>,
        settings: FiscalSettings,
    ) -> (Self, FiscalWorkerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = FiscalWorker {
            db,
            emitter,
            settings,
            shutdown_rx,
        };
        (worker, FiscalWorkerHandle { shutdown_tx })
    }

    /// Runs until shut down. Spawn as a background task.
    pub async fn run(mut self) {
        info!(
            poll_interval_secs = self.settings.poll_interval_secs,
            max_attempts = self.settings.max_attempts,
            "Fiscal worker starting"
        );

        let poll_interval = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.process_batch().await {
                        error!(error = %e, "Failed to process fiscal batch");
                    }
                }

                _ = cleanup.tick() => {
                    let before = Utc::now() - chrono::Duration::days(RETENTION_DAYS);
                    match self.db.fiscal_outbox().cleanup_processed(before).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Fiscal outbox cleaned"),
                        Err(e) => warn!(error = %e, "Fiscal outbox cleanup failed"),
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Fiscal worker shutting down");
                    break;
                }
            }
        }

        info!("Fiscal worker stopped");
    }

    /// Processes one batch of pending entries.
    pub async fn process_batch(&self) -> EngineResult<BatchReport> {
        let entries = self
            .db
            .fiscal_outbox()
            .get_pending(self.settings.batch_size, self.settings.max_attempts)
            .await?;

        let mut report = BatchReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        debug!(count = entries.len(), "Processing fiscal batch");

        for entry in &entries {
            self.process_entry(entry, &mut report).await?;
        }

        info!(
            authorized = report.authorized,
            rejected = report.rejected,
            pending = report.pending,
            failed = report.failed,
            abandoned = report.abandoned,
            "Fiscal batch processed"
        );
        Ok(report)
    }

    async fn process_entry(
        &self,
        entry: &FiscalOutboxEntry,
        report: &mut BatchReport,
    ) -> EngineResult<()> {
        let outbox = self.db.fiscal_outbox();
        let last_attempt = entry.attempts + 1 >= i64::from(self.settings.max_attempts);

        let record = self.db.sales().load(&entry.sale_id).await?;
        match self.emitter.emit(&record).await {
            Ok(outcome) => match outcome.status {
                FiscalStatus::Authorized | FiscalStatus::Error => {
                    outbox
                        .record_result(
                            &entry.id,
                            &entry.sale_id,
                            outcome.status,
                            outcome.document_url.as_deref(),
                            outcome.message.as_deref(),
                        )
                        .await?;
                    if outcome.status == FiscalStatus::Authorized {
                        report.authorized += 1;
                    } else {
                        warn!(
                            sale_id = %entry.sale_id,
                            message = ?outcome.message,
                            "Fiscal document rejected"
                        );
                        report.rejected += 1;
                    }
                }
                FiscalStatus::Pending if last_attempt => {
                    outbox
                        .abandon(&entry.id, &entry.sale_id, "still pending after last attempt")
                        .await?;
                    report.abandoned += 1;
                }
                FiscalStatus::Pending => {
                    outbox
                        .record_result(
                            &entry.id,
                            &entry.sale_id,
                            FiscalStatus::Pending,
                            outcome.document_url.as_deref(),
                            outcome.message.as_deref(),
                        )
                        .await?;
                    report.pending += 1;
                }
            },
            Err(e) if last_attempt => {
                error!(
                    sale_id = %entry.sale_id,
                    attempts = entry.attempts + 1,
                    error = %e,
                    "Giving up on fiscal emission"
                );
                outbox.abandon(&entry.id, &entry.sale_id, &e.to_string()).await?;
                report.abandoned += 1;
            }
            Err(e) => {
                warn!(
                    sale_id = %entry.sale_id,
                    attempts = entry.attempts + 1,
                    error = %e,
                    "Fiscal emission failed, will retry"
                );
                outbox.mark_failed(&entry.id, &e.to_string()).await?;
                report.failed += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use comanda_core::sale::NewSale;
    use comanda_core::{Actor, Destination, Money, Role, SessionKind};

    use crate::config::EngineConfig;
    use crate::session::SessionHandle;
    use crate::test_support::{self, TestContext};

    /// Answers per sale, in order; `pending` once a script runs out.
    #[derive(Default)]
    struct ScriptedEmitter {
        scripts: Mutex<HashMap<String, VecDeque<EngineResult<FiscalOutcome>>>>,
    }

    impl ScriptedEmitter {
        fn script(&self, sale_id: &str, answers: Vec<EngineResult<FiscalOutcome>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(sale_id.to_string(), answers.into());
        }
    }

    #[async_trait]
    impl FiscalEmitter for ScriptedEmitter {
        async fn emit(&self, record: &SaleRecord) -> EngineResult<FiscalOutcome> {
            self.scripts
                .lock()
                .unwrap()
                .get_mut(&record.sale.id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(FiscalOutcome::pending()))
        }
    }

    async fn setup() -> (TestContext, Actor, SessionHandle) {
        let mut config = EngineConfig::default();
        config.fiscal.enabled = true;
        let ctx = test_support::setup_with_config(config).await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();
        (ctx, cashier, session)
    }

    async fn completed_sale(ctx: &TestContext, cashier: &Actor, session: &SessionHandle) -> String {
        let product = ctx
            .product(
                &format!("Prato {}", uuid::Uuid::new_v4()),
                2500,
                None,
                Some(Destination::Kitchen),
            )
            .await;
        let mut sale = ctx.sales.new_sale(session, NewSale::counter(session.id())).unwrap();
        ctx.sales.add_item(&mut sale, &product.id, 1).await.unwrap();
        ctx.sales.record_payment(session, &mut sale, "cash", None).await.unwrap();
        ctx.sales.complete_sale(session, &mut sale, cashier).await.unwrap();
        sale.id().to_string()
    }

    fn worker(ctx: &TestContext, emitter: Arc<ScriptedEmitter>, max_attempts: u32) -> FiscalWorker {
        let mut settings = ctx.config.fiscal.clone();
        settings.max_attempts = max_attempts;
        FiscalWorker::new(ctx.db.clone(), emitter, settings).0
    }

    #[tokio::test]
    async fn test_final_outcomes_close_the_entry() {
        let (ctx, cashier, session) = setup().await;
        let good = completed_sale(&ctx, &cashier, &session).await;
        let bad = completed_sale(&ctx, &cashier, &session).await;
        assert_eq!(
            ctx.db.sales().require(&good).await.unwrap().fiscal_status,
            Some(FiscalStatus::Pending)
        );

        let emitter = Arc::new(ScriptedEmitter::default());
        emitter.script(&good, vec![Ok(FiscalOutcome::authorized("https://nfce.example/1"))]);
        emitter.script(&bad, vec![Ok(FiscalOutcome::rejected("CFOP inválido"))]);

        let worker = worker(&ctx, emitter, 5);
        let report = worker.process_batch().await.unwrap();
        assert_eq!(report.authorized, 1);
        assert_eq!(report.rejected, 1);

        let good = ctx.db.sales().require(&good).await.unwrap();
        assert_eq!(good.fiscal_status, Some(FiscalStatus::Authorized));
        assert_eq!(good.fiscal_document_url.as_deref(), Some("https://nfce.example/1"));
        let bad = ctx.db.sales().require(&bad).await.unwrap();
        assert_eq!(bad.fiscal_status, Some(FiscalStatus::Error));
        assert_eq!(bad.fiscal_message.as_deref(), Some("CFOP inválido"));

        assert_eq!(ctx.db.fiscal_outbox().count_pending().await.unwrap(), 0);
        assert_eq!(worker.process_batch().await.unwrap(), BatchReport::default());
    }

    #[tokio::test]
    async fn test_pending_answer_is_retried() {
        let (ctx, cashier, session) = setup().await;
        let sale_id = completed_sale(&ctx, &cashier, &session).await;

        let emitter = Arc::new(ScriptedEmitter::default());
        emitter.script(
            &sale_id,
            vec![
                Ok(FiscalOutcome::pending()),
                Ok(FiscalOutcome::authorized("https://nfce.example/2")),
            ],
        );
        let worker = worker(&ctx, emitter, 5);

        assert_eq!(worker.process_batch().await.unwrap().pending, 1);
        let entry = ctx.db.fiscal_outbox().get_for_sale(&sale_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.processed_at.is_none());

        assert_eq!(worker.process_batch().await.unwrap().authorized, 1);
        assert_eq!(
            ctx.db.sales().require(&sale_id).await.unwrap().fiscal_status,
            Some(FiscalStatus::Authorized)
        );
    }

    #[tokio::test]
    async fn test_unanswered_emission_is_abandoned() {
        let (ctx, cashier, session) = setup().await;
        let sale_id = completed_sale(&ctx, &cashier, &session).await;

        let emitter = Arc::new(ScriptedEmitter::default());
        emitter.script(
            &sale_id,
            vec![
                Err(EngineError::external("fiscal", "connection reset")),
                Err(EngineError::external("fiscal", "connection reset")),
            ],
        );
        let worker = worker(&ctx, emitter, 2);

        let first = worker.process_batch().await.unwrap();
        assert_eq!(first.failed, 1);
        let entry = ctx.db.fiscal_outbox().get_for_sale(&sale_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.is_some());

        let second = worker.process_batch().await.unwrap();
        assert_eq!(second.abandoned, 1);
        let sale = ctx.db.sales().require(&sale_id).await.unwrap();
        assert_eq!(sale.fiscal_status, Some(FiscalStatus::Error));
        assert_eq!(ctx.db.fiscal_outbox().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let (ctx, _, _) = setup().await;
        let (worker, handle) = FiscalWorker::new(
            ctx.db.clone(),
            Arc::new(ScriptedEmitter::default()),
            ctx.config.fiscal.clone(),
        );
        let task = tokio::spawn(worker.run());

        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
