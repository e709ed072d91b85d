//! # Sale Aggregate
//!
//! In-memory aggregate for one table/customer order: the sale row, its
//! persisted lines, lines still waiting to be persisted, and payments.
//!
//! ## Persistence Boundary
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  add_line()             ──► pending   (memory only, merges allowed)    │
//! │                                                                         │
//! │  send to production  ─┐                                                 │
//! │  first payment       ─┴──► items     (stored, never merged again)      │
//! │                                                                         │
//! │  totals() always covers items + pending                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The aggregate enforces every rule that does not need the store. Guards
//! that do (double completion, double cancellation) live in comanda-db.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::Money;
use crate::pricing::{compute_totals, Discount, PricingPolicy, SaleTotals};
use crate::production::{initial_status, RoutingRules};
use crate::types::{
    Destination, Payment, Product, ProductionStatus, Sale, SaleItem, SaleOrigin, SaleStatus,
};
use crate::validation::{validate_people_count, validate_quantity, validate_reason};
use crate::{MAX_ITEM_QUANTITY, MAX_SALE_LINES};

// =============================================================================
// Inputs
// =============================================================================

/// Header data for a new sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSale {
    pub session_id: Option<String>,
    pub table_label: Option<String>,
    pub customer_label: Option<String>,
    pub people_count: i64,
    pub origin: SaleOrigin,
    pub service_fee_enabled: bool,
}

impl NewSale {
    /// A counter/table sale with the service fee on.
    pub fn table(session_id: &str, table_label: impl Into<String>, people_count: i64) -> Self {
        NewSale {
            session_id: Some(session_id.to_string()),
            table_label: Some(table_label.into()),
            customer_label: None,
            people_count,
            origin: SaleOrigin::Counter,
            service_fee_enabled: true,
        }
    }

    /// A walk-up counter sale: no table, no service fee.
    pub fn counter(session_id: &str) -> Self {
        NewSale {
            session_id: Some(session_id.to_string()),
            table_label: None,
            customer_label: None,
            people_count: 1,
            origin: SaleOrigin::Counter,
            service_fee_enabled: false,
        }
    }
}

/// A line to add, already resolved against the catalog (or not).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLine {
    pub product_id: Option<String>,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i64,
    pub destination: Option<Destination>,
    pub notes: Option<String>,
}

impl NewLine {
    /// Builds a line from a catalog product, routing it with `rules`.
    pub fn from_product(product: &Product, quantity: i64, rules: &RoutingRules) -> Self {
        NewLine {
            product_id: Some(product.id.clone()),
            name: product.name.clone(),
            unit_price: product.price(),
            quantity,
            destination: rules.resolve(Some(product), None),
            notes: None,
        }
    }
}

// =============================================================================
// Aggregate
// =============================================================================

/// One sale with everything needed to compute and validate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleAggregate {
    pub sale: Sale,
    /// Lines that exist in the store.
    pub items: Vec<SaleItem>,
    /// Lines added since the last persistence point.
    pub pending: Vec<SaleItem>,
    pub payments: Vec<Payment>,
    /// Whether the sale row exists in the store.
    pub stored: bool,
    policy: PricingPolicy,
}

impl SaleAggregate {
    /// Starts a new open sale (not yet stored).
    pub fn new(tenant_id: &str, header: NewSale, policy: PricingPolicy) -> CoreResult<Self> {
        Self::with_status(tenant_id, header, SaleStatus::Open, policy)
    }

    /// Starts a zero-item placeholder for a reserved table.
    pub fn reserved(tenant_id: &str, header: NewSale, policy: PricingPolicy) -> CoreResult<Self> {
        Self::with_status(tenant_id, header, SaleStatus::Reserved, policy)
    }

    fn with_status(
        tenant_id: &str,
        header: NewSale,
        status: SaleStatus,
        policy: PricingPolicy,
    ) -> CoreResult<Self> {
        validate_people_count(header.people_count)?;
        let now = Utc::now();

        let sale = Sale {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            session_id: header.session_id,
            table_label: header.table_label,
            customer_label: header.customer_label,
            people_count: header.people_count,
            status,
            origin: header.origin,
            subtotal_cents: 0,
            service_fee_enabled: header.service_fee_enabled,
            service_fee_cents: 0,
            discount_kind: None,
            discount_value: 0,
            discount_cents: 0,
            discount_reason: None,
            total_cents: 0,
            payment_method: None,
            external_order_id: None,
            fiscal_status: None,
            fiscal_document_url: None,
            fiscal_message: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
        };

        Ok(SaleAggregate {
            sale,
            items: Vec::new(),
            pending: Vec::new(),
            payments: Vec::new(),
            stored: false,
            policy,
        })
    }

    /// Rehydrates an aggregate loaded from the store.
    pub fn from_parts(
        sale: Sale,
        items: Vec<SaleItem>,
        payments: Vec<Payment>,
        policy: PricingPolicy,
    ) -> Self {
        SaleAggregate {
            sale,
            items,
            pending: Vec::new(),
            payments,
            stored: true,
            policy,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.sale.id
    }

    #[inline]
    pub fn status(&self) -> SaleStatus {
        self.sale.status
    }

    #[inline]
    pub fn policy(&self) -> &PricingPolicy {
        &self.policy
    }

    /// Persisted and pending lines, in insertion order.
    pub fn lines(&self) -> impl Iterator<Item = &SaleItem> {
        self.items.iter().chain(self.pending.iter())
    }

    pub fn line_count(&self) -> usize {
        self.items.len() + self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The discount requested on the sale, if any.
    pub fn discount(&self) -> Option<Discount> {
        self.sale.discount_kind.map(|kind| Discount {
            kind,
            value: self.sale.discount_value,
        })
    }

    /// Current derived figures.
    pub fn totals(&self) -> SaleTotals {
        compute_totals(
            self.lines().map(|i| (i.quantity, i.unit_price())),
            self.sale.service_fee_enabled,
            self.discount(),
            self.payments.iter().map(Payment::amount),
            &self.policy,
        )
    }

    // =========================================================================
    // Guards
    // =========================================================================

    fn ensure_mutable(&self) -> CoreResult<()> {
        if !self.sale.status.is_mutable() {
            return Err(self.status_error());
        }
        Ok(())
    }

    fn status_error(&self) -> CoreError {
        CoreError::InvalidSaleStatus {
            sale_id: self.sale.id.clone(),
            status: self.sale.status.as_str().to_string(),
        }
    }

    /// First item or payment turns a reserved table into an open sale.
    fn activate(&mut self) {
        if self.sale.status == SaleStatus::Reserved {
            self.sale.status = SaleStatus::Open;
        }
    }

    /// Writes the derived figures back onto the sale row.
    fn refresh(&mut self) {
        let totals = self.totals();
        self.sale.subtotal_cents = totals.subtotal.cents();
        self.sale.service_fee_cents = totals.service_fee.cents();
        self.sale.discount_cents = totals.discount.cents();
        self.sale.total_cents = totals.total.cents();
        self.sale.updated_at = Utc::now();
    }

    // =========================================================================
    // Cart Composition
    // =========================================================================

    /// Adds a line, merging into an unpersisted line of the same product,
    /// unit price, destination and notes. Returns the affected line id.
    ///
    /// ## Merge Rules
    /// ```text
    /// pending: [Burger x1 @ 32.00]
    /// add Burger x2 @ 32.00          → [Burger x3 @ 32.00]
    /// add Burger x1 @ 28.00 (promo)  → [Burger x3 @ 32.00, Burger x1 @ 28.00]
    ///
    /// items (sent to kitchen): [Burger x1]
    /// add Burger x1                  → new pending line (the kitchen already
    ///                                  has a ticket for the first one)
    /// ```
    pub fn add_line(&mut self, line: NewLine) -> CoreResult<String> {
        self.ensure_mutable()?;
        validate_quantity(line.quantity)?;
        if line.name.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "name".to_string(),
            }
            .into());
        }
        if line.unit_price.is_negative() {
            return Err(ValidationError::MustNotBeNegative {
                field: "unit_price".to_string(),
            }
            .into());
        }

        let mergeable = line.product_id.is_some();
        if mergeable {
            if let Some(existing) = self.pending.iter_mut().find(|i| {
                i.product_id == line.product_id
                    && i.unit_price_cents == line.unit_price.cents()
                    && i.destination == line.destination
                    && i.notes == line.notes
            }) {
                let new_qty = existing.quantity + line.quantity;
                if new_qty > MAX_ITEM_QUANTITY {
                    return Err(CoreError::QuantityTooLarge {
                        requested: new_qty,
                        max: MAX_ITEM_QUANTITY,
                    });
                }
                existing.quantity = new_qty;
                let id = existing.id.clone();
                self.activate();
                self.refresh();
                return Ok(id);
            }
        }

        if self.line_count() >= MAX_SALE_LINES {
            return Err(CoreError::SaleTooLarge {
                max: MAX_SALE_LINES,
            });
        }

        let now = Utc::now();
        let item = SaleItem {
            id: Uuid::new_v4().to_string(),
            sale_id: self.sale.id.clone(),
            product_id: line.product_id,
            name_snapshot: line.name.trim().to_string(),
            quantity: line.quantity,
            unit_price_cents: line.unit_price.cents(),
            production_status: initial_status(line.destination),
            destination: line.destination,
            notes: line.notes,
            created_at: now,
            status_changed_at: now,
        };
        let id = item.id.clone();
        self.pending.push(item);
        self.activate();
        self.refresh();
        Ok(id)
    }

    /// Adds a catalog product.
    pub fn add_product(
        &mut self,
        product: &Product,
        quantity: i64,
        rules: &RoutingRules,
    ) -> CoreResult<String> {
        self.add_line(NewLine::from_product(product, quantity, rules))
    }

    /// Removes a line. Delivered lines are final.
    ///
    /// Returns the removed line and whether it was persisted.
    pub fn remove_line(&mut self, item_id: &str) -> CoreResult<(SaleItem, bool)> {
        self.ensure_mutable()?;

        let (list, persisted) = if self.items.iter().any(|i| i.id == item_id) {
            (&mut self.items, true)
        } else if self.pending.iter().any(|i| i.id == item_id) {
            (&mut self.pending, false)
        } else {
            return Err(CoreError::ItemNotFound(item_id.to_string()));
        };

        let index = list
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(|| CoreError::ItemNotFound(item_id.to_string()))?;
        if list[index].production_status == ProductionStatus::Delivered {
            return Err(CoreError::ItemAlreadyDelivered(item_id.to_string()));
        }

        let removed = list.remove(index);
        self.refresh();
        Ok((removed, persisted))
    }

    /// Moves pending lines into the persisted list and returns a copy of
    /// what was moved (for the store write).
    pub fn commit_pending(&mut self) -> Vec<SaleItem> {
        let moved: Vec<SaleItem> = self.pending.drain(..).collect();
        self.items.extend(moved.iter().cloned());
        moved
    }

    // =========================================================================
    // Discount & Service Fee
    // =========================================================================

    /// Sets the discount; `reason` is stored as given (callers annotate it).
    pub fn apply_discount(&mut self, discount: Discount, reason: &str) -> CoreResult<SaleTotals> {
        self.ensure_mutable()?;
        crate::validation::validate_discount(discount.kind, discount.value)?;
        let reason = validate_reason(reason)?;

        self.sale.discount_kind = Some(discount.kind);
        self.sale.discount_value = discount.value;
        self.sale.discount_reason = Some(reason);
        self.refresh();
        Ok(self.totals())
    }

    pub fn clear_discount(&mut self) -> CoreResult<SaleTotals> {
        self.ensure_mutable()?;
        self.sale.discount_kind = None;
        self.sale.discount_value = 0;
        self.sale.discount_reason = None;
        self.refresh();
        Ok(self.totals())
    }

    pub fn set_service_fee(&mut self, enabled: bool) -> CoreResult<SaleTotals> {
        self.ensure_mutable()?;
        self.sale.service_fee_enabled = enabled;
        self.refresh();
        Ok(self.totals())
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Appends a payment. `None` or zero pays the remaining due.
    ///
    /// `method` must already be resolved against the registry.
    pub fn add_payment(&mut self, method: &str, amount: Option<Money>) -> CoreResult<Payment> {
        self.ensure_mutable()?;

        let amount = match amount {
            Some(a) if !a.is_zero() => a,
            _ => self.totals().remaining_due,
        };
        if !amount.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: "amount".to_string(),
            }
            .into());
        }

        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            sale_id: self.sale.id.clone(),
            method: method.to_string(),
            amount_cents: amount.cents(),
            created_at: Utc::now(),
        };
        self.payments.push(payment.clone());
        self.activate();
        self.refresh();
        Ok(payment)
    }

    /// Removes a payment, re-opening its amount as due.
    pub fn remove_payment(&mut self, payment_id: &str) -> CoreResult<Payment> {
        self.ensure_mutable()?;
        let index = self
            .payments
            .iter()
            .position(|p| p.id == payment_id)
            .ok_or_else(|| CoreError::PaymentNotFound(payment_id.to_string()))?;
        let removed = self.payments.remove(index);
        self.refresh();
        Ok(removed)
    }

    // =========================================================================
    // Closure
    // =========================================================================

    /// Checks completion preconditions and returns the final figures.
    pub fn ensure_completable(&self) -> CoreResult<SaleTotals> {
        if self.sale.status != SaleStatus::Open {
            return Err(self.status_error());
        }
        if self.line_count() == 0 {
            return Err(ValidationError::Required {
                field: "items".to_string(),
            }
            .into());
        }
        let totals = self.totals();
        if !totals.is_settled() {
            return Err(CoreError::PaymentIncomplete {
                remaining_cents: totals.remaining_due.cents(),
            });
        }
        Ok(totals)
    }

    /// Checks cancellation preconditions.
    pub fn ensure_cancellable(&self) -> CoreResult<()> {
        match self.sale.status {
            SaleStatus::Open | SaleStatus::Reserved | SaleStatus::Completed => Ok(()),
            _ => Err(self.status_error()),
        }
    }

    // =========================================================================
    // Table Transfer
    // =========================================================================

    /// Moves lines to another open sale.
    ///
    /// A source left without lines becomes `transferred`. Emptying a sale
    /// that already holds payments is refused so no tender is orphaned.
    pub fn transfer_lines(
        &mut self,
        target: &mut SaleAggregate,
        item_ids: &[String],
    ) -> CoreResult<Vec<SaleItem>> {
        self.ensure_mutable()?;
        target.ensure_mutable()?;
        if item_ids.is_empty() {
            return Err(ValidationError::Required {
                field: "items".to_string(),
            }
            .into());
        }
        let mut requested: Vec<&String> = Vec::with_capacity(item_ids.len());
        for id in item_ids {
            if !self.lines().any(|i| &i.id == id) {
                return Err(CoreError::ItemNotFound(id.clone()));
            }
            if !requested.contains(&id) {
                requested.push(id);
            }
        }
        if target.line_count() + requested.len() > MAX_SALE_LINES {
            return Err(CoreError::SaleTooLarge {
                max: MAX_SALE_LINES,
            });
        }
        let empties_source = self.line_count() == requested.len();
        if empties_source && !self.payments.is_empty() {
            return Err(self.status_error());
        }

        let mut moved = Vec::with_capacity(requested.len());
        for (list, target_list) in [
            (&mut self.items, &mut target.items),
            (&mut self.pending, &mut target.pending),
        ] {
            let (taking, keeping): (Vec<SaleItem>, Vec<SaleItem>) =
                list.drain(..).partition(|i| item_ids.contains(&i.id));
            *list = keeping;
            for mut item in taking {
                item.sale_id = target.sale.id.clone();
                target_list.push(item.clone());
                moved.push(item);
            }
        }

        if empties_source {
            self.sale.status = SaleStatus::Transferred;
        }
        self.refresh();
        target.activate();
        target.refresh();
        Ok(moved)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiscountKind, Rate};
    use crate::DEFAULT_TENANT_ID;

    fn product(id: &str, name: &str, price: i64) -> Product {
        Product {
            id: id.to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            sku: format!("SKU-{}", id),
            name: name.to_string(),
            price_cents: price,
            track_stock: true,
            current_stock: 10,
            destination: Some(Destination::Kitchen),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sale() -> SaleAggregate {
        SaleAggregate::new(
            DEFAULT_TENANT_ID,
            NewSale::table("session-1", "12", 2),
            PricingPolicy::default(),
        )
        .unwrap()
    }

    fn rules() -> RoutingRules {
        RoutingRules::default()
    }

    fn assert_total_invariant(agg: &SaleAggregate) {
        let t = agg.totals();
        assert_eq!(
            t.total,
            (t.subtotal + t.service_fee - t.discount).non_negative()
        );
        assert_eq!(agg.sale.total_cents, t.total.cents());
    }

    #[test]
    fn test_pending_lines_merge_by_product_and_price() {
        let mut agg = sale();
        let burger = product("p1", "Burger", 3200);
        let first = agg.add_product(&burger, 1, &rules()).unwrap();
        let second = agg.add_product(&burger, 2, &rules()).unwrap();

        assert_eq!(first, second);
        assert_eq!(agg.line_count(), 1);
        assert_eq!(agg.pending[0].quantity, 3);
        assert_total_invariant(&agg);
    }

    #[test]
    fn test_persisted_lines_never_merge() {
        let mut agg = sale();
        let burger = product("p1", "Burger", 3200);
        agg.add_product(&burger, 1, &rules()).unwrap();
        let committed = agg.commit_pending();
        assert_eq!(committed.len(), 1);

        agg.add_product(&burger, 1, &rules()).unwrap();
        assert_eq!(agg.items.len(), 1);
        assert_eq!(agg.pending.len(), 1);
        assert_eq!(agg.totals().subtotal.cents(), 6400);
    }

    #[test]
    fn test_reserved_becomes_open_on_first_item() {
        let mut agg = SaleAggregate::reserved(
            DEFAULT_TENANT_ID,
            NewSale::table("session-1", "4", 4),
            PricingPolicy::default(),
        )
        .unwrap();
        assert_eq!(agg.status(), SaleStatus::Reserved);

        agg.add_product(&product("p1", "Soup", 1800), 1, &rules()).unwrap();
        assert_eq!(agg.status(), SaleStatus::Open);
    }

    #[test]
    fn test_full_table_scenario() {
        let mut agg = sale();
        agg.add_product(&product("p1", "Pasta", 1000), 2, &rules()).unwrap();
        agg.add_product(&product("p2", "Salad", 500), 1, &rules()).unwrap();
        agg.apply_discount(Discount::fixed(Money::from_cents(300)), "regular customer")
            .unwrap();
        assert_total_invariant(&agg);
        assert_eq!(agg.sale.total_cents, 2450);

        agg.add_payment("cash", Some(Money::from_cents(2000))).unwrap();
        let rest = agg.add_payment("credit", None).unwrap();
        assert_eq!(rest.amount_cents, 450);

        let totals = agg.ensure_completable().unwrap();
        assert_eq!(totals.remaining_due, Money::zero());
        assert_eq!(totals.change_due, Money::zero());
    }

    #[test]
    fn test_completion_requires_payment() {
        let mut agg = sale();
        agg.add_product(&product("p1", "Pasta", 1000), 1, &rules()).unwrap();
        agg.add_payment("cash", Some(Money::from_cents(500))).unwrap();
        assert!(matches!(
            agg.ensure_completable(),
            Err(CoreError::PaymentIncomplete { .. })
        ));
    }

    #[test]
    fn test_remove_payment_reopens_due() {
        let mut agg = sale();
        agg.set_service_fee(false).unwrap();
        agg.add_product(&product("p1", "Pasta", 1000), 1, &rules()).unwrap();
        let payment = agg.add_payment("pix", None).unwrap();
        assert_eq!(agg.totals().remaining_due, Money::zero());

        agg.remove_payment(&payment.id).unwrap();
        assert_eq!(agg.totals().remaining_due.cents(), 1000);
    }

    #[test]
    fn test_delivered_line_cannot_be_removed() {
        let mut agg = sale();
        let id = agg
            .add_line(NewLine {
                product_id: Some("water".to_string()),
                name: "Water".to_string(),
                unit_price: Money::from_cents(400),
                quantity: 1,
                destination: Some(Destination::None),
                notes: None,
            })
            .unwrap();
        assert_eq!(agg.pending[0].production_status, ProductionStatus::Delivered);
        assert!(matches!(
            agg.remove_line(&id),
            Err(CoreError::ItemAlreadyDelivered(_))
        ));
    }

    #[test]
    fn test_percentage_discount_rejects_over_hundred() {
        let mut agg = sale();
        agg.add_product(&product("p1", "Pasta", 1000), 1, &rules()).unwrap();
        let result = agg.apply_discount(
            Discount {
                kind: DiscountKind::Percentage,
                value: 12_000,
            },
            "typo",
        );
        assert!(result.is_err());
        assert!(agg.sale.discount_kind.is_none());

        agg.apply_discount(Discount::percentage(Rate::from_bps(10_000)), "on the house")
            .unwrap();
        assert_eq!(agg.sale.total_cents, 100); // fee on subtotal remains
        assert_total_invariant(&agg);
    }

    #[test]
    fn test_transfer_moves_lines_and_marks_source() {
        let mut from = sale();
        let mut to = sale();
        let line = from.add_product(&product("p1", "Beer", 1200), 2, &rules()).unwrap();
        from.commit_pending();

        let moved = from.transfer_lines(&mut to, &[line.clone()]).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].sale_id, to.sale.id);
        assert_eq!(from.status(), SaleStatus::Transferred);
        assert_eq!(from.sale.total_cents, 0);
        assert_eq!(to.items.len(), 1);
        assert_eq!(to.totals().subtotal.cents(), 2400);
    }

    #[test]
    fn test_repeated_id_moves_one_line() {
        let mut from = sale();
        let mut to = sale();
        let beer = from.add_product(&product("p1", "Beer", 1200), 1, &rules()).unwrap();
        from.add_product(&product("p2", "Pasta", 3000), 1, &rules()).unwrap();
        from.commit_pending();

        let moved = from
            .transfer_lines(&mut to, &[beer.clone(), beer.clone()])
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(from.status(), SaleStatus::Open);
        assert_eq!(from.line_count(), 1);
        assert_eq!(from.sale.subtotal_cents, 3000);
        assert_eq!(to.line_count(), 1);
    }

    #[test]
    fn test_completed_sale_rejects_changes() {
        let mut agg = sale();
        agg.sale.status = SaleStatus::Completed;
        assert!(agg.add_product(&product("p1", "Pasta", 1000), 1, &rules()).is_err());
        assert!(agg.add_payment("cash", None).is_err());
        assert!(agg.ensure_cancellable().is_ok());

        agg.sale.status = SaleStatus::Cancelled;
        assert!(agg.ensure_cancellable().is_err());
    }
}
