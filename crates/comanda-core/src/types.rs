//! # Domain Types
//!
//! Core domain types shared by the ledger store, the engine and the
//! terminal/KDS front-ends.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  CashierSession ──< Sale ──< SaleItem       (production state machine)  │
//! │        │             │                                                  │
//! │        │             └────< Payment         (multi-tender)              │
//! │        └──────< CashierTransaction          (supply / withdrawal)       │
//! │                                                                         │
//! │  Product ──< StockMovement                  (append-only stock ledger)  │
//! │  Employee                                   (Authorization Gate)        │
//! │  FiscalOutboxEntry                          (post-completion emission)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every persisted record uses a UUID v4 `id`. Monetary columns are integer
//! cents and end in `_cents`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;

// =============================================================================
// Rate
// =============================================================================

/// A rate represented in basis points (bps).
///
/// 1 bps = 0.01%, so 1000 bps = 10% (the usual restaurant service fee).
/// Used for the service fee and for percentage discounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Rate(u32);

impl Rate {
    /// 100%.
    pub const FULL: Rate = Rate(10_000);

    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        Rate(bps)
    }

    /// Creates a rate from a percentage (configuration convenience).
    pub fn from_percentage(pct: f64) -> Self {
        Rate((pct * 100.0).round().max(0.0) as u32)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Returns the rate as a percentage (display only).
    #[inline]
    pub fn percentage(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    #[inline]
    pub const fn zero() -> Self {
        Rate(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Default for Rate {
    fn default() -> Self {
        Rate::zero()
    }
}

// =============================================================================
// Production Routing
// =============================================================================

/// Which production station prepares an item.
///
/// `None` is an explicit "no production" mapping (bottled water, desserts
/// from the display fridge). An item whose destination is *unknown* is
/// represented as `Option<Destination>::None` and is shown on every station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Kitchen,
    Bar,
    None,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Kitchen => "kitchen",
            Destination::Bar => "bar",
            Destination::None => "none",
        }
    }
}

/// Production status of a single sale item.
///
/// ```text
/// pending ──► preparing ──► ready ──► delivered
/// ```
/// Forward only. The only way "back" is an authorized item removal, which is
/// refused once the item is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Pending,
    Preparing,
    Ready,
    Delivered,
}

impl ProductionStatus {
    /// Position in the state machine.
    #[inline]
    pub const fn rank(&self) -> u8 {
        match self {
            ProductionStatus::Pending => 0,
            ProductionStatus::Preparing => 1,
            ProductionStatus::Ready => 2,
            ProductionStatus::Delivered => 3,
        }
    }

    /// The next state, or `None` once delivered.
    pub const fn next(&self) -> Option<ProductionStatus> {
        match self {
            ProductionStatus::Pending => Some(ProductionStatus::Preparing),
            ProductionStatus::Preparing => Some(ProductionStatus::Ready),
            ProductionStatus::Ready => Some(ProductionStatus::Delivered),
            ProductionStatus::Delivered => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductionStatus::Pending => "pending",
            ProductionStatus::Preparing => "preparing",
            ProductionStatus::Ready => "ready",
            ProductionStatus::Delivered => "delivered",
        }
    }
}

impl Default for ProductionStatus {
    fn default() -> Self {
        ProductionStatus::Pending
    }
}

// =============================================================================
// Product
// =============================================================================

/// A catalog product (reference data, maintained outside the engine).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Product {
    pub id: String,
    pub tenant_id: String,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    /// Whether completion deducts stock for this product.
    pub track_stock: bool,
    pub current_stock: i64,
    /// Explicit production routing. When absent the name heuristic applies.
    pub destination: Option<Destination>,
    pub is_active: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    #[inline]
    pub fn price(&self) -> Money {
        Money::from_cents(self.price_cents)
    }
}

// =============================================================================
// Employee
// =============================================================================

/// Employee role, as far as the engine cares about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Cashier,
    Waiter,
    Kitchen,
}

impl Role {
    /// Roles that may approve privileged actions.
    #[inline]
    pub fn is_manager(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

/// An employee record from the directory.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Employee {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub role: Role,
    /// Argon2 PHC string. Never leaves the backend.
    #[serde(skip_serializing, default)]
    #[ts(skip)]
    pub pin_hash: String,
    pub is_active: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// The acting employee of a request.
///
/// Resolved by the caller (terminal login) and passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Actor {
    pub employee_id: String,
    pub name: String,
    pub role: Role,
}

impl From<&Employee> for Actor {
    fn from(employee: &Employee) -> Self {
        Actor {
            employee_id: employee.id.clone(),
            name: employee.name.clone(),
            role: employee.role,
        }
    }
}

// =============================================================================
// Sale
// =============================================================================

/// The status of a sale.
///
/// ```text
///   reserved ──(first item/payment)──► open ──► completed
///                                        │
///                                        ├────► cancelled
///                                        └────► transferred (all items moved)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Open,
    Reserved,
    Completed,
    Cancelled,
    Transferred,
}

impl SaleStatus {
    /// Items, discounts and payments may still change.
    #[inline]
    pub fn is_mutable(&self) -> bool {
        matches!(self, SaleStatus::Open | SaleStatus::Reserved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Open => "open",
            SaleStatus::Reserved => "reserved",
            SaleStatus::Completed => "completed",
            SaleStatus::Cancelled => "cancelled",
            SaleStatus::Transferred => "transferred",
        }
    }
}

impl Default for SaleStatus {
    fn default() -> Self {
        SaleStatus::Open
    }
}

/// Where the order came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SaleOrigin {
    Counter,
    Delivery,
}

/// How a discount value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    /// `discount_value` is an amount in cents.
    Fixed,
    /// `discount_value` is a rate in basis points.
    Percentage,
}

/// Outcome of the fiscal document emission for a completed sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum FiscalStatus {
    Pending,
    Authorized,
    Error,
}

/// Aggregate root for one table/customer order.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Sale {
    pub id: String,
    pub tenant_id: String,
    /// Owning cashier session. Reserved tables may exist before a session.
    pub session_id: Option<String>,
    pub table_label: Option<String>,
    pub customer_label: Option<String>,
    pub people_count: i64,
    pub status: SaleStatus,
    pub origin: SaleOrigin,
    pub subtotal_cents: i64,
    pub service_fee_enabled: bool,
    pub service_fee_cents: i64,
    pub discount_kind: Option<DiscountKind>,
    /// Cents for fixed discounts, basis points for percentage discounts.
    pub discount_value: i64,
    /// Discount actually applied after clamping.
    pub discount_cents: i64,
    pub discount_reason: Option<String>,
    pub total_cents: i64,
    /// Single-method label kept for sales recorded without Payment rows.
    pub payment_method: Option<String>,
    pub external_order_id: Option<String>,
    pub fiscal_status: Option<FiscalStatus>,
    pub fiscal_document_url: Option<String>,
    pub fiscal_message: Option<String>,
    pub cancel_reason: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Sale {
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    #[inline]
    pub fn subtotal(&self) -> Money {
        Money::from_cents(self.subtotal_cents)
    }

    #[inline]
    pub fn discount(&self) -> Money {
        Money::from_cents(self.discount_cents)
    }

    #[inline]
    pub fn service_fee(&self) -> Money {
        Money::from_cents(self.service_fee_cents)
    }
}

// =============================================================================
// Sale Item
// =============================================================================

/// One line of a sale.
///
/// Name and unit price are snapshots taken when the line was added so the
/// ticket history survives catalog edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SaleItem {
    pub id: String,
    pub sale_id: String,
    /// Absent for delivery lines without a catalog match.
    pub product_id: Option<String>,
    pub name_snapshot: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub production_status: ProductionStatus,
    /// `None` when routing could not be resolved (fail open on the KDS).
    pub destination: Option<Destination>,
    pub notes: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub status_changed_at: DateTime<Utc>,
}

impl SaleItem {
    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }

    /// unit_price × quantity.
    #[inline]
    pub fn line_total(&self) -> Money {
        self.unit_price().multiply_quantity(self.quantity)
    }
}

// =============================================================================
// Payment
// =============================================================================

/// One tender recorded against a sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Payment {
    pub id: String,
    pub sale_id: String,
    /// Payment method registry id ("cash", "credit", ...).
    pub method: String,
    pub amount_cents: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl Payment {
    #[inline]
    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}

// =============================================================================
// Cashier Session
// =============================================================================

/// Which drawer a session accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Counter,
    Delivery,
}

impl Default for SessionKind {
    fn default() -> Self {
        SessionKind::Counter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    /// Terminal. Corrections require a new session.
    Closed,
}

/// One cash-drawer shift.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct CashierSession {
    pub id: String,
    pub tenant_id: String,
    pub employee_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub initial_balance_cents: i64,
    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Σ counted amounts reported by the operator.
    pub final_balance_cents: Option<i64>,
    pub system_balance_cents: Option<i64>,
    pub difference_cents: Option<i64>,
    /// JSON per-method comparison written at close.
    pub closing_data: Option<String>,
    pub notes: Option<String>,
}

impl CashierSession {
    #[inline]
    pub fn initial_balance(&self) -> Money {
        Money::from_cents(self.initial_balance_cents)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }
}

/// Manual cash movement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Money put into the drawer (change float top-up).
    Supply,
    /// Money taken out of the drawer (bleed, supplier paid in cash).
    Withdrawal,
}

/// A manual cash movement within an open session.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct CashierTransaction {
    pub id: String,
    pub session_id: String,
    pub kind: TransactionKind,
    pub amount_cents: i64,
    pub description: String,
    /// Informational only; manual movements always hit the cash bucket.
    pub method: Option<String>,
    pub employee_id: String,
    pub approver_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl CashierTransaction {
    #[inline]
    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}

// =============================================================================
// Stock Ledger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Entrance,
    Exit,
}

/// Reason written on stock deducted by a completed sale.
pub const STOCK_REASON_SALE: &str = "venda";

/// Reason written on stock restored by a cancelled sale.
pub const STOCK_REASON_RETURN: &str = "devolução";

/// Append-only stock ledger row. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct StockMovement {
    pub id: String,
    pub tenant_id: String,
    pub product_id: String,
    pub sale_id: Option<String>,
    pub kind: MovementKind,
    pub quantity: i64,
    pub old_stock: i64,
    pub new_stock: i64,
    pub reason: String,
    pub responsible_id: Option<String>,
    pub approver_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Fiscal Outbox
// =============================================================================

/// A completed sale waiting for fiscal emission.
///
/// Written in the same store transaction that completes the sale and
/// drained by the fiscal worker afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct FiscalOutboxEntry {
    pub id: String,
    pub sale_id: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub attempted_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub processed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Unit Tests
// =============================================================================
