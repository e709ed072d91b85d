//! # comanda-core: Pure Business Logic for Comanda
//!
//! Everything the POS engine decides without touching a store, a network or
//! a clock it did not receive as an argument: sale pricing, production
//! routing, payment method bucketing and the end-of-shift reconciliation.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Comanda Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               apps/agent (store daemon)                         │   │
//! │  │    config ──► pool ──► engine services ──► background workers   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               comanda-engine (async services)                   │   │
//! │  │    SaleEngine • ProductionTracker • SessionManager • Gate       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ comanda-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌────────────┐ ┌────────────────┐   │   │
//! │  │   │  money   │ │ pricing  │ │ production │ │ reconciliation │   │   │
//! │  │   │  types   │ │   sale   │ │  routing   │ │   Z report     │   │   │
//! │  │   └──────────┘ └──────────┘ └────────────┘ └────────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               comanda-db (SQLite repositories)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records shared with the store (Sale, SaleItem, CashierSession...)
//! - [`money`] - Integer cents arithmetic
//! - [`pricing`] - Service fee, discount and totals
//! - [`sale`] - The in-memory sale aggregate
//! - [`production`] - KDS routing, transitions and urgency
//! - [`payment_methods`] - Configured methods and reconciliation buckets
//! - [`reconciliation`] - The Z report
//! - [`validation`] - Input rules
//! - [`error`] - Domain errors
//!
//! ## Example Usage
//!
//! ```rust
//! use comanda_core::money::Money;
//! use comanda_core::pricing::{compute_totals, Discount, PricingPolicy};
//!
//! let lines = vec![(2, Money::from_cents(1000)), (1, Money::from_cents(500))];
//! let totals = compute_totals(
//!     lines,
//!     true,
//!     Some(Discount::fixed(Money::from_cents(300))),
//!     Vec::new(),
//!     &PricingPolicy::default(),
//! );
//!
//! // 25.00 + 10% fee − 3.00
//! assert_eq!(totals.total.cents(), 2450);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod money;
pub mod payment_methods;
pub mod pricing;
pub mod production;
pub mod reconciliation;
pub mod sale;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use payment_methods::PaymentMethodRegistry;
pub use pricing::{Discount, PricingPolicy, SaleTotals};
pub use sale::SaleAggregate;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Tenant used by single-store deployments.
///
/// Every table carries `tenant_id`; the agent runs one tenant at a time.
pub const DEFAULT_TENANT_ID: &str = "00000000-0000-0000-0000-000000000001";

/// Maximum lines on a single sale.
pub const MAX_SALE_LINES: usize = 100;

/// Maximum quantity on a single line (catches 1000 typed for 10).
pub const MAX_ITEM_QUANTITY: i64 = 999;
