//! # comanda-db: Ledger Store for Comanda
//!
//! Durable state for the POS engine. SQLite through sqlx: one file holds
//! sales, items, payments, cash sessions, the stock ledger and the fiscal
//! outbox.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Comanda Data Flow                                │
//! │                                                                         │
//! │  SaleEngine::complete_sale                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     comanda-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐   │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │   │   │
//! │  │   │               │    │ SaleRepo      │    │              │   │   │
//! │  │   │ SqlitePool    │◄───│ SessionRepo   │    │ 001_initial  │   │   │
//! │  │   │               │    │ StockRepo     │    │              │   │   │
//! │  │   │               │    │ FiscalOutbox  │    │              │   │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Contract
//!
//! Several terminals and KDS screens write the same rows. Every state
//! change is a conditional update (`... WHERE status = 'open'`); losing the
//! race surfaces as [`DbError::Conflict`] and leaves no partial effects.
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use comanda_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("comanda.db")).await?;
//!
//! let session = db.sessions().current(DEFAULT_TENANT_ID).await?;
//! let open = db.sales().list_open(DEFAULT_TENANT_ID, None).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::employee::EmployeeRepository;
pub use repository::fiscal::FiscalOutboxRepository;
pub use repository::product::ProductRepository;
pub use repository::sale::{
    CompletionOptions, CompletionOutcome, ProductionFilter, SaleRepository, SaleWrite,
};
pub use repository::session::{SessionClosing, SessionRepository};
pub use repository::stock::{MovementRequest, StockRepository};
