//! # Z Report Reconciliation
//!
//! Pure end-of-shift reconciliation: compares what the system expects in
//! the drawer (per payment method) against the operator's blind count.
//!
//! ## Algorithm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  gross_sales    = Σ total(completed sales)                              │
//! │  supplies       = Σ supply transactions                                 │
//! │  withdrawals    = Σ withdrawal transactions                             │
//! │  system_balance = initial + gross_sales + supplies − withdrawals        │
//! │                                                                         │
//! │  Per-method buckets:                                                    │
//! │    each completed sale's payments ──► bucket(method)                    │
//! │    change given back              ──► − cash bucket                     │
//! │    sale without payments          ──► bucket(legacy label) += total     │
//! │    initial + supplies − withdrawals ──► cash bucket                     │
//! │                                                                         │
//! │  reported_total = Σ counted                                             │
//! │  difference     = reported_total − system_balance                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Example: initial 100, one sale of 50 paid in cash, supply 20, withdrawal
//! 10 → system balance 160. Counting 155 gives a difference of −5.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

use crate::money::Money;
use crate::payment_methods::{PaymentMethodRegistry, OTHER_BUCKET};
use crate::types::{
    CashierSession, CashierTransaction, Payment, Sale, SaleItem, SaleStatus, SessionKind,
    TransactionKind,
};

/// Cumulative revenue share (bps) closing the A class.
const ABC_A_LIMIT_BPS: i64 = 8_000;
/// Cumulative revenue share (bps) closing the B class.
const ABC_B_LIMIT_BPS: i64 = 9_500;

// =============================================================================
// Inputs
// =============================================================================

/// A sale with its lines and payments, as loaded for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleRecord {
    pub sale: Sale,
    pub items: Vec<SaleItem>,
    pub payments: Vec<Payment>,
}

// =============================================================================
// Report
// =============================================================================

/// System vs counted figure for one payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MethodComparison {
    pub method: String,
    pub system: Money,
    pub reported: Money,
    pub difference: Money,
}

/// ABC curve class of a product in the sales mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum AbcClass {
    A,
    B,
    C,
}

/// One product line of the sales mix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SalesMixEntry {
    pub product_id: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub revenue: Money,
    /// Share of total revenue in basis points.
    pub share_bps: i64,
    pub class: AbcClass,
}

/// A cancelled sale listed on the report.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CancelledSaleEntry {
    pub sale_id: String,
    pub table_label: Option<String>,
    pub customer_label: Option<String>,
    pub total: Money,
    pub reason: Option<String>,
    #[ts(as = "Option<String>")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// The end-of-shift Z report.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ZReport {
    pub session_id: String,
    pub employee_id: String,
    pub kind: SessionKind,
    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub closed_at: DateTime<Utc>,
    pub initial_balance: Money,
    pub gross_sales: Money,
    pub supplies: Money,
    pub withdrawals: Money,
    pub discounts: Money,
    pub service_fees: Money,
    pub system_balance: Money,
    pub reported_total: Money,
    pub difference: Money,
    pub completed_sales: usize,
    pub cancelled_sales: usize,
    /// Sales still open or reserved when the drawer was closed.
    pub open_sale_ids: Vec<String>,
    pub methods: Vec<MethodComparison>,
    pub sales_mix: Vec<SalesMixEntry>,
    pub cancellations: Vec<CancelledSaleEntry>,
    pub notes: Option<String>,
}

impl ZReport {
    /// The per-method comparison as stored in `closing_data`.
    pub fn closing_data_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.methods)
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Runs the reconciliation for one session.
///
/// `sales` may contain sales in any status; only completed ones count
/// towards balances, cancelled ones are listed, open ones are reported.
pub fn reconcile(
    session: &CashierSession,
    sales: &[SaleRecord],
    transactions: &[CashierTransaction],
    counted: &BTreeMap<String, Money>,
    registry: &PaymentMethodRegistry,
    closed_at: DateTime<Utc>,
    notes: Option<String>,
) -> ZReport {
    let completed: Vec<&SaleRecord> = sales
        .iter()
        .filter(|r| r.sale.status == SaleStatus::Completed)
        .collect();

    let gross_sales: Money = completed.iter().map(|r| r.sale.total()).sum();
    let discounts: Money = completed.iter().map(|r| r.sale.discount()).sum();
    let service_fees: Money = completed.iter().map(|r| r.sale.service_fee()).sum();

    let sum_kind = |kind: TransactionKind| -> Money {
        transactions
            .iter()
            .filter(|t| t.kind == kind)
            .map(CashierTransaction::amount)
            .sum()
    };
    let supplies = sum_kind(TransactionKind::Supply);
    let withdrawals = sum_kind(TransactionKind::Withdrawal);

    let initial = session.initial_balance();
    let system_balance = initial + gross_sales + supplies - withdrawals;

    let system_buckets = method_buckets(&completed, initial + supplies - withdrawals, registry);

    let mut reported_buckets: BTreeMap<String, Money> = BTreeMap::new();
    for (method, amount) in counted {
        *reported_buckets
            .entry(registry.bucket_for(method))
            .or_default() += *amount;
    }
    let reported_total: Money = reported_buckets.values().sum();

    let methods = compare_methods(&system_buckets, &reported_buckets);

    let cancellations: Vec<CancelledSaleEntry> = sales
        .iter()
        .filter(|r| r.sale.status == SaleStatus::Cancelled)
        .map(|r| CancelledSaleEntry {
            sale_id: r.sale.id.clone(),
            table_label: r.sale.table_label.clone(),
            customer_label: r.sale.customer_label.clone(),
            total: r.sale.total(),
            reason: r.sale.cancel_reason.clone(),
            cancelled_at: r.sale.cancelled_at,
        })
        .collect();

    let open_sale_ids = sales
        .iter()
        .filter(|r| r.sale.status.is_mutable())
        .map(|r| r.sale.id.clone())
        .collect();

    ZReport {
        session_id: session.id.clone(),
        employee_id: session.employee_id.clone(),
        kind: session.kind,
        opened_at: session.opened_at,
        closed_at,
        initial_balance: initial,
        gross_sales,
        supplies,
        withdrawals,
        discounts,
        service_fees,
        system_balance,
        reported_total,
        difference: reported_total - system_balance,
        completed_sales: completed.len(),
        cancelled_sales: cancellations.len(),
        open_sale_ids,
        methods,
        sales_mix: sales_mix(&completed),
        cancellations,
        notes,
    }
}

/// Distributes completed sales into per-method buckets.
fn method_buckets(
    completed: &[&SaleRecord],
    drawer_float: Money,
    registry: &PaymentMethodRegistry,
) -> BTreeMap<String, Money> {
    let cash = registry.cash_bucket();
    let mut buckets: BTreeMap<String, Money> = BTreeMap::new();

    for record in completed {
        if record.payments.is_empty() {
            let bucket = match record.sale.payment_method.as_deref() {
                Some(label) => registry.bucket_for(label),
                None => OTHER_BUCKET.to_string(),
            };
            *buckets.entry(bucket).or_default() += record.sale.total();
            continue;
        }

        let mut paid = Money::zero();
        for payment in &record.payments {
            paid += payment.amount();
            *buckets
                .entry(registry.bucket_for(&payment.method))
                .or_default() += payment.amount();
        }

        let change = (paid - record.sale.total()).non_negative();
        if change.is_positive() {
            *buckets.entry(cash.clone()).or_default() -= change;
        }
    }

    *buckets.entry(cash).or_default() += drawer_float;
    buckets
}

/// Builds the comparison over the union of system and counted methods.
fn compare_methods(
    system: &BTreeMap<String, Money>,
    reported: &BTreeMap<String, Money>,
) -> Vec<MethodComparison> {
    let mut methods: Vec<&String> = system.keys().chain(reported.keys()).collect();
    methods.sort();
    methods.dedup();

    methods
        .into_iter()
        .map(|method| {
            let system = system.get(method).copied().unwrap_or_default();
            let reported = reported.get(method).copied().unwrap_or_default();
            MethodComparison {
                method: method.clone(),
                system,
                reported,
                difference: reported - system,
            }
        })
        .collect()
}

/// Aggregates sold quantities and revenue per product with ABC classes.
fn sales_mix(completed: &[&SaleRecord]) -> Vec<SalesMixEntry> {
    let mut by_key: BTreeMap<String, SalesMixEntry> = BTreeMap::new();

    for item in completed.iter().flat_map(|r| r.items.iter()) {
        let key = item
            .product_id
            .clone()
            .unwrap_or_else(|| format!("name:{}", item.name_snapshot.to_lowercase()));
        let entry = by_key.entry(key).or_insert_with(|| SalesMixEntry {
            product_id: item.product_id.clone(),
            name: item.name_snapshot.clone(),
            quantity: 0,
            revenue: Money::zero(),
            share_bps: 0,
            class: AbcClass::C,
        });
        entry.quantity += item.quantity;
        entry.revenue += item.line_total();
    }

    let mut entries: Vec<SalesMixEntry> = by_key.into_values().collect();
    entries.sort_by(|a, b| b.revenue.cmp(&a.revenue).then_with(|| a.name.cmp(&b.name)));

    let total: i64 = entries.iter().map(|e| e.revenue.cents()).sum();
    let mut cumulative_before = 0i64;
    for entry in &mut entries {
        let share = if total > 0 {
            entry.revenue.cents() * 10_000 / total
        } else {
            0
        };
        entry.share_bps = share;
        entry.class = if cumulative_before < ABC_A_LIMIT_BPS {
            AbcClass::A
        } else if cumulative_before < ABC_B_LIMIT_BPS {
            AbcClass::B
        } else {
            AbcClass::C
        };
        cumulative_before += share;
    }

    entries
}

// =============================================================================
// Unit Tests
// =============================================================================
