//! # comanda-engine: Transaction and Cash-Session Services for Comanda
//!
//! Every multi-step business operation of the POS: building and paying
//! sales, routing items to production, running the cash drawer, and the
//! background workers that talk to the fiscal service and delivery channels.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Comanda Service Layer                            │
//! │                                                                         │
//! │  terminal / KDS / agent                                                 │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  SaleEngine    │  │ Production     │  │  SessionManager        │    │
//! │  │                │  │ Tracker        │  │                        │    │
//! │  │ cart, discount │  │ station queues │  │ open, supply,          │    │
//! │  │ pay, complete, │  │ batch status   │  │ withdrawal, close      │    │
//! │  │ cancel, move   │  │ transitions    │  │ + Z report             │    │
//! │  └───────┬────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │          │                   │                       │                  │
//! │          │     AuthorizationGate (manager PIN)       │                  │
//! │          │                   │                       │                  │
//! │          ▼                   ▼                       ▼                  │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            comanda-db (guarded writes, one tx per op)           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │          │                                           ▲                  │
//! │          ▼                                           │                  │
//! │  ┌────────────────┐                       ┌────────────────────────┐    │
//! │  │ FiscalWorker   │                       │  DeliveryIntake        │    │
//! │  │ drains outbox  │                       │  polls the channel,    │    │
//! │  │ FiscalEmitter  │                       │  materializes orders   │    │
//! │  └────────────────┘                       └────────────────────────┘    │
//! │                                                                         │
//! │  SIDE CHANNELS:                                                        │
//! │  • ChangeFeed  - broadcast of committed changes (screens refresh)      │
//! │  • TicketSink  - kitchen tickets, pre-bills, receipts, Z reports       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`auth`] - Manager PIN verification and the authorization decision
//! - [`config`] - Engine configuration (TOML + environment overrides)
//! - [`error`] - Engine error types
//! - [`feed`] - Change feed for live screens
//! - [`fiscal`] - Fiscal outbox worker
//! - [`intake`] - Delivery order poller
//! - [`printing`] - Ticket types and the printer seam
//! - [`production`] - KDS queues and batch transitions
//! - [`sale_engine`] - Sale lifecycle
//! - [`session`] - Cashier sessions and the Z report
//!
//! ## Usage
//!
//! ```rust,ignore
//! use comanda_engine::{ChangeFeed, EngineConfig, LoggingSink, SaleEngine, SessionManager};
//!
//! let config = Arc::new(EngineConfig::load(None)?);
//! let feed = ChangeFeed::new();
//! let sink = Arc::new(LoggingSink);
//!
//! let sessions = SessionManager::new(db.clone(), config.clone(), sink.clone(), feed.clone());
//! let sales = SaleEngine::new(db, config, sink, feed);
//!
//! let session = sessions.open_session(&cashier, Money::from_cents(10_000), SessionKind::Counter).await?;
//! let mut sale = sales.new_sale(&session, NewSale::counter(session.id()))?;
//! sales.add_item(&mut sale, &product_id, 2).await?;
//! sales.record_payment(&session, &mut sale, "cash", None).await?;
//! sales.complete_sale(&session, &mut sale, &cashier).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod config;
pub mod error;
pub mod feed;
pub mod fiscal;
pub mod intake;
pub mod printing;
pub mod production;
pub mod sale_engine;
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{authorize, hash_pin, Approver, Authorization, AuthorizationGate};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use feed::{ChangeEvent, ChangeFeed};
pub use fiscal::{BatchReport, FiscalEmitter, FiscalOutcome, FiscalWorker, FiscalWorkerHandle};
pub use intake::{
    DeliveryChannel, DeliveryIntake, DeliveryIntakeHandle, DeliveryLine, DeliveryOrder,
    IntakeReport,
};
pub use printing::{LoggingSink, Ticket, TicketSink};
pub use production::{ProductionScope, ProductionTracker};
pub use sale_engine::{ProductionDispatch, RecordedPayment, SaleCompletion, SaleEngine};
pub use session::{CashMovement, SessionClose, SessionHandle, SessionManager};

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use comanda_core::{Actor, Destination, Employee, Product, Role};
    use comanda_db::{Database, DbConfig};
    use uuid::Uuid;

    use crate::auth::{hash_pin, AuthorizationGate};
    use crate::config::EngineConfig;
    use crate::error::{EngineError, EngineResult};
    use crate::feed::ChangeFeed;
    use crate::printing::{Ticket, TicketSink};
    use crate::production::ProductionTracker;
    use crate::sale_engine::SaleEngine;
    use crate::session::SessionManager;

    /// Keeps every printed ticket.
    #[derive(Default)]
    pub struct RecordingSink {
        tickets: Mutex<Vec<Ticket>>,
    }

    impl RecordingSink {
        pub fn kinds(&self) -> Vec<&'static str> {
            self.tickets.lock().unwrap().iter().map(Ticket::kind).collect()
        }
    }

    #[async_trait]
    impl TicketSink for RecordingSink {
        async fn print(&self, ticket: Ticket) -> EngineResult<()> {
            self.tickets.lock().unwrap().push(ticket);
            Ok(())
        }
    }

    /// A printer that is always offline.
    pub struct FailingSink;

    #[async_trait]
    impl TicketSink for FailingSink {
        async fn print(&self, _ticket: Ticket) -> EngineResult<()> {
            Err(EngineError::external("printer", "paper out"))
        }
    }

    pub struct TestContext {
        pub db: Database,
        pub config: Arc<EngineConfig>,
        pub gate: AuthorizationGate,
        pub sessions: SessionManager,
        pub sales: SaleEngine,
        pub production: ProductionTracker,
        pub feed: ChangeFeed,
        pub printed: Arc<RecordingSink>,
    }

    pub async fn setup() -> TestContext {
        setup_with_config(EngineConfig::default()).await
    }

    pub async fn setup_with_config(config: EngineConfig) -> TestContext {
        let printed = Arc::new(RecordingSink::default());
        build(config, printed.clone(), printed).await
    }

    pub async fn setup_with_sink(sink: Arc<dyn TicketSink>) -> TestContext {
        build(EngineConfig::default(), sink, Arc::new(RecordingSink::default())).await
    }

    async fn build(
        config: EngineConfig,
        sink: Arc<dyn TicketSink>,
        printed: Arc<RecordingSink>,
    ) -> TestContext {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let config = Arc::new(config);
        let feed = ChangeFeed::new();

        TestContext {
            gate: AuthorizationGate::new(db.clone()),
            sessions: SessionManager::new(db.clone(), config.clone(), sink.clone(), feed.clone()),
            sales: SaleEngine::new(db.clone(), config.clone(), sink, feed.clone()),
            production: ProductionTracker::new(db.clone(), config.clone(), feed.clone()),
            db,
            config,
            feed,
            printed,
        }
    }

    impl TestContext {
        pub async fn actor(&self, name: &str, role: Role, pin: &str) -> Actor {
            let employee = Employee {
                id: Uuid::new_v4().to_string(),
                tenant_id: self.config.tenant_id().to_string(),
                name: name.to_string(),
                role,
                pin_hash: hash_pin(pin).unwrap(),
                is_active: true,
                created_at: Utc::now(),
            };
            self.db.employees().insert(&employee).await.unwrap();
            Actor::from(&employee)
        }

        pub async fn product(
            &self,
            name: &str,
            price_cents: i64,
            stock: Option<i64>,
            destination: Option<Destination>,
        ) -> Product {
            let now = Utc::now();
            let product = Product {
                id: Uuid::new_v4().to_string(),
                tenant_id: self.config.tenant_id().to_string(),
                sku: name.to_string(),
                name: name.to_string(),
                price_cents,
                track_stock: stock.is_some(),
                current_stock: stock.unwrap_or(0),
                destination,
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            self.db.products().insert(&product).await.unwrap();
            product
        }
    }
}
