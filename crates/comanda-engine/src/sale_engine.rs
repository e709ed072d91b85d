//! # Sale Engine
//!
//! The sale aggregate from cart to closure.
//!
//! ## Sale Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Sale Engine Flow                              │
//! │                                                                         │
//! │  new_sale / reserve_table                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  add_item ─► add_item ─► ...          (in memory, merges pending lines) │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  send_to_production                   (persist + kitchen tickets)       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  apply_discount ◄── manager or approver                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  record_payment ─► record_payment     (open session required)           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  complete_sale                        ONE store transaction:            │
//! │       │                                 open → completed (guarded)      │
//! │       │                                 stock exits ("venda")           │
//! │       │                                 optional item release           │
//! │       │                                 fiscal outbox entry             │
//! │       ▼                                                                 │
//! │  receipt (best effort)                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Model
//!
//! Every mutating operation works on a snapshot: if the store write fails
//! the aggregate is restored, so the caller never holds a cart that
//! disagrees with the store. Printing failures never fail an operation;
//! they come back as warnings.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use comanda_core::payment_methods::PaymentMethodRegistry;
use comanda_core::production::{items_for_station, RoutingRules, Station};
use comanda_core::sale::{NewLine, NewSale};
use comanda_core::validation::validate_reason;
use comanda_core::{
    Actor, Discount, FiscalStatus, Money, Payment, PricingPolicy, ProductionStatus, Sale,
    SaleAggregate, SaleItem, SaleOrigin, SaleStatus, SaleTotals, StockMovement,
};
use comanda_db::{CompletionOptions, Database, SaleWrite};

use crate::auth::{authorize, Approver};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::printing::{Ticket, TicketSink};
use crate::session::{ensure_open, SessionHandle};

// =============================================================================
// Outcomes
// =============================================================================

/// Result of [`SaleEngine::send_to_production`].
#[derive(Debug, Clone)]
pub struct ProductionDispatch {
    /// Lines persisted by this call.
    pub items: Vec<SaleItem>,
    pub warnings: Vec<String>,
}

/// Result of [`SaleEngine::record_payment`].
#[derive(Debug, Clone)]
pub struct RecordedPayment {
    pub payment: Payment,
    pub totals: SaleTotals,
    pub warnings: Vec<String>,
}

/// Result of [`SaleEngine::complete_sale`].
#[derive(Debug, Clone)]
pub struct SaleCompletion {
    pub totals: SaleTotals,
    pub movements: Vec<StockMovement>,
    pub released_items: u64,
    pub warnings: Vec<String>,
}

// =============================================================================
// Sale Engine
// =============================================================================

#[derive(Clone)]
pub struct SaleEngine {
    db: Database,
    config: Arc<EngineConfig>,
    policy: PricingPolicy,
    registry: PaymentMethodRegistry,
    rules: RoutingRules,
    sink: Arc<dyn TicketSink>,
    feed: ChangeFeed,
}

impl SaleEngine {
    pub fn new(
        db: Database,
        config: Arc<EngineConfig>,
        sink: Arc<dyn TicketSink>,
        feed: ChangeFeed,
    ) -> Self {
        SaleEngine {
            policy: config.pricing_policy(),
            registry: config.payment_registry(),
            rules: config.routing_rules(),
            db,
            config,
            sink,
            feed,
        }
    }

    // =========================================================================
    // Creation & Loading
    // =========================================================================

    /// Starts an in-memory sale owned by `session`.
    pub fn new_sale(
        &self,
        session: &SessionHandle,
        mut header: NewSale,
    ) -> EngineResult<SaleAggregate> {
        header.session_id = Some(session.id().to_string());
        Ok(SaleAggregate::new(session.tenant_id(), header, self.policy)?)
    }

    /// Stores a zero-item placeholder for a reserved table.
    ///
    /// Reservations may be taken before the drawer opens; the session is
    /// attached when the table starts consuming.
    pub async fn reserve_table(
        &self,
        session: Option<&SessionHandle>,
        table_label: &str,
        customer_label: Option<&str>,
        people_count: i64,
    ) -> EngineResult<SaleAggregate> {
        let header = NewSale {
            session_id: session.map(|s| s.id().to_string()),
            table_label: Some(table_label.trim().to_string()).filter(|t| !t.is_empty()),
            customer_label: customer_label.map(|c| c.trim().to_string()),
            people_count,
            origin: SaleOrigin::Counter,
            service_fee_enabled: true,
        };
        let mut sale = SaleAggregate::reserved(self.config.tenant_id(), header, self.policy)?;

        self.db
            .sales()
            .save(SaleWrite {
                sale: &sale.sale,
                stored: false,
                new_items: &[],
                new_payments: &[],
            })
            .await?;
        sale.stored = true;

        info!(sale_id = %sale.id(), table = table_label, "Table reserved");
        self.publish_sale(&sale.sale);
        Ok(sale)
    }

    /// Rehydrates a stored sale.
    pub async fn load(&self, sale_id: &str) -> EngineResult<SaleAggregate> {
        let record = self.db.sales().load(sale_id).await?;
        Ok(SaleAggregate::from_parts(
            record.sale,
            record.items,
            record.payments,
            self.policy,
        ))
    }

    /// Open and reserved sales of the session, plus reservations without one.
    pub async fn open_sales(&self, session: &SessionHandle) -> EngineResult<Vec<SaleAggregate>> {
        let sales = self
            .db
            .sales()
            .list_open(session.tenant_id(), Some(session.id()))
            .await?;

        let mut aggregates = Vec::with_capacity(sales.len());
        for sale in sales {
            let items = self.db.sales().get_items(&sale.id).await?;
            let payments = self.db.sales().get_payments(&sale.id).await?;
            aggregates.push(SaleAggregate::from_parts(
                sale,
                items,
                payments,
                self.policy,
            ));
        }
        Ok(aggregates)
    }

    // =========================================================================
    // Cart Composition
    // =========================================================================

    /// Adds a catalog product to the cart. Nothing is persisted.
    pub async fn add_item(
        &self,
        sale: &mut SaleAggregate,
        product_id: &str,
        quantity: i64,
    ) -> EngineResult<String> {
        let product = self.db.products().require(product_id).await?;
        if !product.is_active {
            return Err(EngineError::not_found("Product", product_id));
        }
        Ok(sale.add_product(&product, quantity, &self.rules)?)
    }

    /// Adds a line that is not in the catalog (open-price item).
    ///
    /// Without an explicit destination the line is routed by name.
    pub fn add_custom_line(
        &self,
        sale: &mut SaleAggregate,
        mut line: NewLine,
    ) -> EngineResult<String> {
        if line.destination.is_none() && line.product_id.is_none() {
            line.destination = self.rules.resolve(None, Some(&line.name));
        }
        Ok(sale.add_line(line)?)
    }

    /// Removes a line.
    ///
    /// Lines already sent to production need a manager; cart lines do not.
    /// Delivered lines are never removable.
    pub async fn remove_item(
        &self,
        sale: &mut SaleAggregate,
        item_id: &str,
        actor: &Actor,
        approver: Option<&Approver>,
    ) -> EngineResult<SaleItem> {
        let sent = sale.items.iter().any(|i| i.id == item_id);
        let authorization = if sent {
            Some(authorize(actor, approver, "remove an item")?)
        } else {
            None
        };

        let snapshot = sale.clone();
        let (removed, persisted) = sale.remove_line(item_id)?;

        if persisted && sale.stored {
            if let Err(e) = self.db.sales().delete_item(&sale.sale, item_id).await {
                *sale = snapshot;
                return Err(e.into());
            }
            info!(
                sale_id = %sale.id(),
                item_id,
                name = %removed.name_snapshot,
                actor = %actor.employee_id,
                approver = ?authorization.as_ref().and_then(|a| a.approver_id()),
                "Item removed"
            );
            self.publish_sale(&sale.sale);
        }
        Ok(removed)
    }

    // =========================================================================
    // Discount & Service Fee
    // =========================================================================

    /// Applies a discount.
    ///
    /// A non-manager needs a verified approver; without one the sale is not
    /// touched. The stored reason names the approver.
    pub async fn apply_discount(
        &self,
        sale: &mut SaleAggregate,
        discount: Discount,
        reason: &str,
        actor: &Actor,
        approver: Option<&Approver>,
    ) -> EngineResult<SaleTotals> {
        let authorization = authorize(actor, approver, "apply a discount")?;
        let reason = validate_reason(reason)?;
        let reason = match authorization.approver_name() {
            Some(name) => format!("{reason} (autorizado por {name})"),
            None => reason,
        };

        let snapshot = sale.clone();
        let totals = sale.apply_discount(discount, &reason)?;
        self.persist_header(sale, snapshot).await?;

        info!(
            sale_id = %sale.id(),
            discount = %totals.discount,
            actor = %actor.employee_id,
            approver = ?authorization.approver_id(),
            "Discount applied"
        );
        Ok(totals)
    }

    pub async fn clear_discount(&self, sale: &mut SaleAggregate) -> EngineResult<SaleTotals> {
        let snapshot = sale.clone();
        let totals = sale.clear_discount()?;
        self.persist_header(sale, snapshot).await?;
        Ok(totals)
    }

    pub async fn set_service_fee(
        &self,
        sale: &mut SaleAggregate,
        enabled: bool,
    ) -> EngineResult<SaleTotals> {
        let snapshot = sale.clone();
        let totals = sale.set_service_fee(enabled)?;
        self.persist_header(sale, snapshot).await?;
        Ok(totals)
    }

    // =========================================================================
    // Production
    // =========================================================================

    /// Persists the sale with its pending lines and prints kitchen tickets.
    pub async fn send_to_production(
        &self,
        session: &SessionHandle,
        sale: &mut SaleAggregate,
    ) -> EngineResult<ProductionDispatch> {
        ensure_open(&self.db, session).await?;
        if sale.stored && !sale.has_pending() {
            return Ok(ProductionDispatch {
                items: Vec::new(),
                warnings: Vec::new(),
            });
        }

        let snapshot = sale.clone();
        attach_session(sale, session);
        let items = sale.commit_pending();

        if let Err(e) = self
            .db
            .sales()
            .save(SaleWrite {
                sale: &sale.sale,
                stored: snapshot.stored,
                new_items: &items,
                new_payments: &[],
            })
            .await
        {
            *sale = snapshot;
            return Err(e.into());
        }
        sale.stored = true;

        info!(sale_id = %sale.id(), items = items.len(), "Items sent to production");
        let warnings = self.print_kitchen_tickets(&sale.sale, &items).await;
        self.feed.publish(ChangeEvent::ItemsSent {
            sale_id: sale.id().to_string(),
            items: items.len(),
        });

        Ok(ProductionDispatch { items, warnings })
    }

    /// Prints the bill for the table to check before paying.
    pub async fn print_pre_bill(&self, sale: &SaleAggregate) -> EngineResult<()> {
        self.sink
            .print(Ticket::PreBill {
                sale: sale.sale.clone(),
                items: sale.lines().cloned().collect(),
                totals: sale.totals(),
            })
            .await
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Records a tender. `None` or zero pays the remaining due.
    ///
    /// Requires an open drawer. An unstored sale is written together with
    /// its pending lines and the payment in one store transaction.
    pub async fn record_payment(
        &self,
        session: &SessionHandle,
        sale: &mut SaleAggregate,
        method: &str,
        amount: Option<Money>,
    ) -> EngineResult<RecordedPayment> {
        ensure_open(&self.db, session).await?;
        let method = self.registry.resolve(method)?.id.clone();

        let snapshot = sale.clone();
        attach_session(sale, session);
        let payment = match sale.add_payment(&method, amount) {
            Ok(payment) => payment,
            Err(e) => {
                *sale = snapshot;
                return Err(e.into());
            }
        };
        let items = sale.commit_pending();

        if let Err(e) = self
            .db
            .sales()
            .save(SaleWrite {
                sale: &sale.sale,
                stored: snapshot.stored,
                new_items: &items,
                new_payments: std::slice::from_ref(&payment),
            })
            .await
        {
            *sale = snapshot;
            return Err(e.into());
        }
        sale.stored = true;

        let totals = sale.totals();
        debug!(
            sale_id = %sale.id(),
            method = %payment.method,
            amount = %payment.amount(),
            remaining = %totals.remaining_due,
            "Payment recorded"
        );

        let warnings = if items.is_empty() {
            Vec::new()
        } else {
            self.print_kitchen_tickets(&sale.sale, &items).await
        };
        self.publish_sale(&sale.sale);

        Ok(RecordedPayment {
            payment,
            totals,
            warnings,
        })
    }

    /// Removes a tender, re-opening its amount as due.
    ///
    /// `approver` is only recorded in the log.
    pub async fn remove_payment(
        &self,
        sale: &mut SaleAggregate,
        payment_id: &str,
        actor: &Actor,
        approver: Option<&Approver>,
    ) -> EngineResult<SaleTotals> {
        let snapshot = sale.clone();
        let removed = sale.remove_payment(payment_id)?;

        if sale.stored {
            if let Err(e) = self.db.sales().delete_payment(&sale.sale, payment_id).await {
                *sale = snapshot;
                return Err(e.into());
            }
        }

        info!(
            sale_id = %sale.id(),
            payment_id,
            amount = %removed.amount(),
            actor = %actor.employee_id,
            approver = ?approver.map(|a| a.employee_id.as_str()),
            "Payment removed"
        );
        self.publish_sale(&sale.sale);
        Ok(sale.totals())
    }

    // =========================================================================
    // Closure
    // =========================================================================

    /// Completes a fully paid sale.
    ///
    /// The store re-checks the drawer and recomputes the totals from what
    /// is stored, so a copy loaded before another terminal added lines is
    /// refused rather than completed short.
    ///
    /// ## Returns
    /// * `Err(CashierClosed)` - the session is no longer open
    /// * `Err(Core(PaymentIncomplete))` - more than 0.01 still due
    /// * `Err(Db(Conflict))` - another terminal completed or cancelled it first
    pub async fn complete_sale(
        &self,
        session: &SessionHandle,
        sale: &mut SaleAggregate,
        actor: &Actor,
    ) -> EngineResult<SaleCompletion> {
        ensure_open(&self.db, session).await?;
        sale.ensure_completable()?;

        let snapshot = sale.clone();
        attach_session(sale, session);
        let items = sale.commit_pending();

        let policy = *sale.policy();
        let release_items = self.config.production.release_on_complete;
        let enqueue_fiscal = self.config.fiscal.enabled;
        let outcome = match self
            .db
            .sales()
            .complete_sale(
                SaleWrite {
                    sale: &sale.sale,
                    stored: snapshot.stored,
                    new_items: &items,
                    new_payments: &[],
                },
                CompletionOptions {
                    policy: &policy,
                    release_items,
                    enqueue_fiscal,
                    responsible_id: Some(&actor.employee_id),
                },
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                *sale = snapshot;
                return Err(e.into());
            }
        };

        let totals = outcome.totals;
        let now = Utc::now();
        sale.stored = true;
        sale.sale.status = SaleStatus::Completed;
        sale.sale.subtotal_cents = totals.subtotal.cents();
        sale.sale.service_fee_cents = totals.service_fee.cents();
        sale.sale.discount_cents = totals.discount.cents();
        sale.sale.total_cents = totals.total.cents();
        sale.sale.completed_at = Some(now);
        sale.sale.updated_at = now;
        if enqueue_fiscal {
            sale.sale.fiscal_status = Some(FiscalStatus::Pending);
        }
        if release_items {
            for item in &mut sale.items {
                if item.production_status != ProductionStatus::Delivered {
                    item.production_status = ProductionStatus::Delivered;
                    item.status_changed_at = now;
                }
            }
        }

        let mut warnings = Vec::new();
        if !items.is_empty() && !release_items {
            warnings.extend(self.print_kitchen_tickets(&sale.sale, &items).await);
        }

        let receipt = Ticket::Receipt {
            sale: sale.sale.clone(),
            items: sale.items.clone(),
            payments: sale.payments.clone(),
            totals,
        };
        if let Err(e) = self.sink.print(receipt).await {
            warn!(sale_id = %sale.id(), error = %e, "Receipt not printed");
            warnings.push(format!("Receipt not printed: {e}"));
        }

        self.publish_sale(&sale.sale);

        Ok(SaleCompletion {
            totals,
            movements: outcome.movements,
            released_items: outcome.released_items,
            warnings,
        })
    }

    /// Cancels a sale, restoring any stock its completion deducted.
    ///
    /// A second cancellation is a state conflict and touches no stock.
    pub async fn cancel_sale(
        &self,
        sale: &mut SaleAggregate,
        reason: &str,
        actor: &Actor,
        approver: Option<&Approver>,
    ) -> EngineResult<Vec<StockMovement>> {
        let authorization = authorize(actor, approver, "cancel a sale")?;
        let reason = validate_reason(reason)?;
        sale.ensure_cancellable()?;

        let restored = if sale.stored {
            self.db
                .sales()
                .cancel_sale(
                    sale.id(),
                    &reason,
                    Some(&actor.employee_id),
                    authorization.approver_id(),
                )
                .await?
        } else {
            debug!(sale_id = %sale.id(), "Discarding unsaved sale");
            Vec::new()
        };

        let now = Utc::now();
        sale.sale.status = SaleStatus::Cancelled;
        sale.sale.cancel_reason = Some(reason);
        sale.sale.cancelled_at = Some(now);
        sale.sale.updated_at = now;

        info!(
            sale_id = %sale.id(),
            restored = restored.len(),
            actor = %actor.employee_id,
            approver = ?authorization.approver_id(),
            "Sale cancelled"
        );
        self.publish_sale(&sale.sale);
        Ok(restored)
    }

    // =========================================================================
    // Table Transfer
    // =========================================================================

    /// Moves lines from one open sale to another.
    ///
    /// A source left without lines becomes `transferred`.
    pub async fn transfer_items(
        &self,
        source: &mut SaleAggregate,
        target: &mut SaleAggregate,
        item_ids: &[String],
        actor: &Actor,
        approver: Option<&Approver>,
    ) -> EngineResult<Vec<SaleItem>> {
        let authorization = authorize(actor, approver, "transfer items")?;

        let stored_ids: Vec<String> = source
            .items
            .iter()
            .filter(|i| item_ids.contains(&i.id))
            .map(|i| i.id.clone())
            .collect();

        let source_snapshot = source.clone();
        let target_snapshot = target.clone();
        let moved = source.transfer_lines(target, item_ids)?;

        let result = if source.stored {
            self.db
                .sales()
                .transfer_items(
                    &source.sale,
                    SaleWrite {
                        sale: &target.sale,
                        stored: target.stored,
                        new_items: &[],
                        new_payments: &[],
                    },
                    &stored_ids,
                )
                .await
                .map(|_| true)
        } else if target.stored {
            self.db
                .sales()
                .save(SaleWrite {
                    sale: &target.sale,
                    stored: true,
                    new_items: &[],
                    new_payments: &[],
                })
                .await
                .map(|_| true)
        } else {
            Ok(false)
        };

        match result {
            Ok(stored) => target.stored |= stored,
            Err(e) => {
                *source = source_snapshot;
                *target = target_snapshot;
                return Err(e.into());
            }
        }

        info!(
            from = %source.id(),
            to = %target.id(),
            items = moved.len(),
            source_status = source.status().as_str(),
            approver = ?authorization.approver_id(),
            "Items transferred"
        );
        self.publish_sale(&source.sale);
        self.publish_sale(&target.sale);
        Ok(moved)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Writes the header of a stored sale, restoring `snapshot` on failure.
    async fn persist_header(
        &self,
        sale: &mut SaleAggregate,
        snapshot: SaleAggregate,
    ) -> EngineResult<()> {
        if !sale.stored {
            return Ok(());
        }
        let result = self
            .db
            .sales()
            .save(SaleWrite {
                sale: &sale.sale,
                stored: true,
                new_items: &[],
                new_payments: &[],
            })
            .await;
        if let Err(e) = result {
            *sale = snapshot;
            return Err(e.into());
        }
        self.publish_sale(&sale.sale);
        Ok(())
    }

    /// One kitchen ticket per station with something to prepare.
    async fn print_kitchen_tickets(&self, sale: &Sale, items: &[SaleItem]) -> Vec<String> {
        let mut warnings = Vec::new();
        for station in [Station::Kitchen, Station::Bar] {
            let station_items = items_for_station(station, items);
            if station_items.is_empty() {
                continue;
            }
            let ticket = Ticket::Kitchen {
                station,
                sale_id: sale.id.clone(),
                table_label: sale.table_label.clone(),
                customer_label: sale.customer_label.clone(),
                items: station_items,
            };
            if let Err(e) = self.sink.print(ticket).await {
                warn!(sale_id = %sale.id, ?station, error = %e, "Kitchen ticket not printed");
                warnings.push(format!("{station:?} ticket not printed: {e}"));
            }
        }
        warnings
    }

    fn publish_sale(&self, sale: &Sale) {
        self.feed.publish(ChangeEvent::SaleUpdated {
            sale_id: sale.id.clone(),
            status: sale.status,
        });
    }
}

/// Reservations taken before the shift belong to the first session that
/// touches them.
fn attach_session(sale: &mut SaleAggregate, session: &SessionHandle) {
    if sale.sale.session_id.is_none() {
        sale.sale.session_id = Some(session.id().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use comanda_core::{Destination, Rate, Role, SessionKind};

    #[tokio::test]
    async fn test_payment_requires_open_session() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "4", 2)).unwrap();
        ctx.sales.add_item(&mut sale, &burger.id, 1).await.unwrap();

        ctx.sessions
            .close_session(&session, &Default::default(), None)
            .await
            .unwrap();

        let err = ctx
            .sales
            .record_payment(&session, &mut sale, "cash", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CashierClosed));
        assert!(sale.payments.is_empty());
        assert!(!sale.stored);
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();
        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "1", 1)).unwrap();
        ctx.sales
            .add_custom_line(
                &mut sale,
                NewLine {
                    product_id: None,
                    name: "Couvert".into(),
                    unit_price: Money::from_cents(800),
                    quantity: 1,
                    destination: Some(Destination::None),
                    notes: None,
                },
            )
            .unwrap();

        let err = ctx
            .sales
            .record_payment(&session, &mut sale, "cheque", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Core(comanda_core::CoreError::UnknownPaymentMethod(_))
        ));

        // Registry ids resolve case-insensitively to the canonical id
        let paid = ctx
            .sales
            .record_payment(&session, &mut sale, "PIX", None)
            .await
            .unwrap();
        assert_eq!(paid.payment.method, "pix");
        assert!(paid.totals.is_settled());
    }

    #[tokio::test]
    async fn test_send_to_production_prints_per_station() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let chopp = ctx.product("Chopp", 1200, Some(50), Some(Destination::Bar)).await;
        let water = ctx.product("Água", 500, Some(10), Some(Destination::None)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "7", 3)).unwrap();
        ctx.sales.add_item(&mut sale, &burger.id, 2).await.unwrap();
        ctx.sales.add_item(&mut sale, &chopp.id, 3).await.unwrap();
        ctx.sales.add_item(&mut sale, &water.id, 1).await.unwrap();

        let dispatch = ctx.sales.send_to_production(&session, &mut sale).await.unwrap();
        assert_eq!(dispatch.items.len(), 3);
        assert!(dispatch.warnings.is_empty());
        assert!(sale.stored);
        assert!(!sale.has_pending());

        let printed = ctx.printed.kinds();
        assert_eq!(printed, vec!["kitchen", "kitchen"]);

        // Nothing pending: no second round of tickets
        let again = ctx.sales.send_to_production(&session, &mut sale).await.unwrap();
        assert!(again.items.is_empty());
        assert_eq!(ctx.printed.kinds().len(), 2);

        let stored = ctx.db.sales().get_items(sale.id()).await.unwrap();
        let water_line = stored.iter().find(|i| i.name_snapshot == "Água").unwrap();
        assert_eq!(water_line.production_status, ProductionStatus::Delivered);
    }

    #[tokio::test]
    async fn test_reserved_table_opens_on_first_item() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;

        let mut sale = ctx.sales.reserve_table(None, "12", Some("Silva"), 4).await.unwrap();
        assert_eq!(sale.status(), SaleStatus::Reserved);
        assert_eq!(sale.sale.session_id, None);

        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();
        let listed = ctx.sales.open_sales(&session).await.unwrap();
        assert_eq!(listed.len(), 1);

        ctx.sales.add_item(&mut sale, &burger.id, 1).await.unwrap();
        assert_eq!(sale.status(), SaleStatus::Open);
        ctx.sales.send_to_production(&session, &mut sale).await.unwrap();

        let stored = ctx.sales.load(sale.id()).await.unwrap();
        assert_eq!(stored.status(), SaleStatus::Open);
        assert_eq!(stored.sale.session_id.as_deref(), Some(session.id()));
        assert_eq!(stored.items.len(), 1);
    }

    #[tokio::test]
    async fn test_sent_item_removal_is_gated() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        ctx.actor("Gerente", Role::Manager, "1234").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let fries = ctx.product("Fritas", 2800, None, Some(Destination::Kitchen)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "2", 2)).unwrap();
        let sent = ctx.sales.add_item(&mut sale, &burger.id, 1).await.unwrap();
        ctx.sales.send_to_production(&session, &mut sale).await.unwrap();
        let cart = ctx.sales.add_item(&mut sale, &fries.id, 1).await.unwrap();

        // Cart lines go freely
        ctx.sales.remove_item(&mut sale, &cart, &cashier, None).await.unwrap();

        let err = ctx
            .sales
            .remove_item(&mut sale, &sent, &cashier, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AuthorizationRequired { .. }));
        assert_eq!(sale.line_count(), 1);

        let approver = ctx.gate.verify(session.tenant_id(), "1234").await.unwrap();
        ctx.sales
            .remove_item(&mut sale, &sent, &cashier, Some(&approver))
            .await
            .unwrap();
        assert_eq!(sale.totals().total, Money::zero());
        assert!(ctx.db.sales().get_items(sale.id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_percentage_discount_on_stored_sale() {
        let ctx = test_support::setup().await;
        let manager = ctx.actor("Gerente", Role::Manager, "1234").await;
        let burger = ctx.product("X-Burger", 10_000, None, Some(Destination::Kitchen)).await;
        let session = ctx
            .sessions
            .open_session(&manager, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "9", 2)).unwrap();
        ctx.sales.add_item(&mut sale, &burger.id, 1).await.unwrap();
        ctx.sales.send_to_production(&session, &mut sale).await.unwrap();

        let totals = ctx
            .sales
            .apply_discount(
                &mut sale,
                Discount::percentage(Rate::from_bps(1000)),
                "cliente fiel",
                &manager,
                None,
            )
            .await
            .unwrap();
        // 100.00 + 10.00 fee - 10% of the subtotal
        assert_eq!(totals.discount, Money::from_cents(1000));
        assert_eq!(totals.total, Money::from_cents(10_000));

        let stored = ctx.db.sales().require(sale.id()).await.unwrap();
        assert_eq!(stored.discount_cents, 1000);
        assert_eq!(stored.discount_reason.as_deref(), Some("cliente fiel"));

        let cleared = ctx.sales.clear_discount(&mut sale).await.unwrap();
        assert_eq!(cleared.total, Money::from_cents(11_000));
        let no_fee = ctx.sales.set_service_fee(&mut sale, false).await.unwrap();
        assert_eq!(no_fee.total, Money::from_cents(10_000));
        assert_eq!(ctx.db.sales().require(sale.id()).await.unwrap().total_cents, 10_000);
    }

    #[tokio::test]
    async fn test_split_payment_then_complete() {
        let ctx = test_support::setup().await;
        let manager = ctx.actor("Gerente", Role::Manager, "1234").await;
        let pasta = ctx.product("Massa", 1000, None, Some(Destination::Kitchen)).await;
        let juice = ctx.product("Suco", 500, None, Some(Destination::Bar)).await;
        let session = ctx
            .sessions
            .open_session(&manager, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "6", 2)).unwrap();
        ctx.sales.add_item(&mut sale, &pasta.id, 2).await.unwrap();
        ctx.sales.add_item(&mut sale, &juice.id, 1).await.unwrap();
        let totals = ctx
            .sales
            .apply_discount(
                &mut sale,
                Discount::fixed(Money::from_cents(300)),
                "cortesia",
                &manager,
                None,
            )
            .await
            .unwrap();
        assert_eq!(totals.subtotal, Money::from_cents(2500));
        assert_eq!(totals.service_fee, Money::from_cents(250));
        assert_eq!(totals.total, Money::from_cents(2450));

        let first = ctx
            .sales
            .record_payment(&session, &mut sale, "cash", Some(Money::from_cents(2000)))
            .await
            .unwrap();
        assert_eq!(first.totals.remaining_due, Money::from_cents(450));
        assert!(sale.stored);

        let err = ctx
            .sales
            .complete_sale(&session, &mut sale, &manager)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Core(comanda_core::CoreError::PaymentIncomplete { remaining_cents: 450 })
        ));
        assert_eq!(sale.status(), SaleStatus::Open);

        ctx.sales
            .record_payment(&session, &mut sale, "debit", Some(Money::from_cents(450)))
            .await
            .unwrap();
        let done = ctx.sales.complete_sale(&session, &mut sale, &manager).await.unwrap();
        assert_eq!(done.totals.remaining_due, Money::zero());
        assert_eq!(done.totals.change_due, Money::zero());
        assert!(done.warnings.is_empty());
        assert_eq!(ctx.printed.kinds().last(), Some(&"receipt"));

        let stored = ctx.sales.load(sale.id()).await.unwrap();
        assert_eq!(stored.status(), SaleStatus::Completed);
        assert_eq!(stored.payments.len(), 2);
        assert_eq!(stored.sale.total_cents, 2450);
    }

    #[tokio::test]
    async fn test_denied_discount_changes_nothing() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        ctx.actor("Gerente", Role::Manager, "1234").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "8", 2)).unwrap();
        ctx.sales.add_item(&mut sale, &burger.id, 1).await.unwrap();
        ctx.sales.send_to_production(&session, &mut sale).await.unwrap();
        let before = sale.totals();

        let err = ctx
            .sales
            .apply_discount(
                &mut sale,
                Discount::fixed(Money::from_cents(500)),
                "aniversário",
                &cashier,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AuthorizationRequired { .. }));
        assert_eq!(sale.totals(), before);
        assert_eq!(ctx.db.sales().require(sale.id()).await.unwrap().discount_cents, 0);

        // A wrong PIN never yields an approver
        let denied = ctx.gate.verify(session.tenant_id(), "9999").await.unwrap_err();
        assert!(matches!(denied, EngineError::AuthorizationDenied));

        let approver = ctx.gate.verify(session.tenant_id(), "1234").await.unwrap();
        ctx.sales
            .apply_discount(
                &mut sale,
                Discount::fixed(Money::from_cents(500)),
                "aniversário",
                &cashier,
                Some(&approver),
            )
            .await
            .unwrap();
        let stored = ctx.db.sales().require(sale.id()).await.unwrap();
        assert_eq!(stored.discount_cents, 500);
        assert_eq!(
            stored.discount_reason.as_deref(),
            Some("aniversário (autorizado por Gerente)")
        );
    }

    #[tokio::test]
    async fn test_cancel_restores_stock_once() {
        let ctx = test_support::setup().await;
        let manager = ctx.actor("Gerente", Role::Manager, "1234").await;
        let chopp = ctx.product("Chopp", 1200, Some(10), Some(Destination::Bar)).await;
        let session = ctx
            .sessions
            .open_session(&manager, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::counter(session.id())).unwrap();
        ctx.sales.add_item(&mut sale, &chopp.id, 3).await.unwrap();
        ctx.sales.record_payment(&session, &mut sale, "cash", None).await.unwrap();
        let done = ctx.sales.complete_sale(&session, &mut sale, &manager).await.unwrap();
        assert_eq!(done.movements.len(), 1);
        assert_eq!(ctx.db.stock().current_stock(&chopp.id).await.unwrap(), 7);

        // Second terminal holds a copy taken before the cancellation
        let mut stale = ctx.sales.load(sale.id()).await.unwrap();

        let restored = ctx
            .sales
            .cancel_sale(&mut sale, "cliente desistiu", &manager, None)
            .await
            .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].quantity, 3);
        assert_eq!(ctx.db.stock().current_stock(&chopp.id).await.unwrap(), 10);
        assert_eq!(sale.status(), SaleStatus::Cancelled);

        let err = ctx
            .sales
            .cancel_sale(&mut stale, "de novo", &manager, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Db(ref e) if e.is_conflict()));
        assert_eq!(ctx.db.stock().current_stock(&chopp.id).await.unwrap(), 10);
        assert_eq!(ctx.db.stock().movements_for_sale(sale.id()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transfer_between_tables() {
        let ctx = test_support::setup().await;
        let manager = ctx.actor("Gerente", Role::Manager, "1234").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let chopp = ctx.product("Chopp", 1200, None, Some(Destination::Bar)).await;
        let session = ctx
            .sessions
            .open_session(&manager, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut source = ctx
            .sales
            .new_sale(&session, NewSale::table(session.id(), "1", 2))
            .unwrap();
        let burger_line = ctx.sales.add_item(&mut source, &burger.id, 1).await.unwrap();
        let chopp_line = ctx.sales.add_item(&mut source, &chopp.id, 2).await.unwrap();
        ctx.sales.send_to_production(&session, &mut source).await.unwrap();
        let mut target = ctx
            .sales
            .new_sale(&session, NewSale::table(session.id(), "2", 2))
            .unwrap();

        let moved = ctx
            .sales
            .transfer_items(&mut source, &mut target, &[chopp_line.clone()], &manager, None)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(target.stored);
        assert_eq!(ctx.db.sales().get_items(target.id()).await.unwrap().len(), 1);
        assert_eq!(ctx.db.sales().get_items(source.id()).await.unwrap().len(), 1);

        ctx.sales
            .transfer_items(&mut source, &mut target, &[burger_line], &manager, None)
            .await
            .unwrap();
        assert_eq!(source.status(), SaleStatus::Transferred);
        let stored = ctx.sales.load(source.id()).await.unwrap();
        assert_eq!(stored.status(), SaleStatus::Transferred);
        assert_eq!(ctx.sales.load(target.id()).await.unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn test_pre_bill_prints_current_totals() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let water = ctx.product("Água", 500, None, Some(Destination::None)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::table(session.id(), "3", 1)).unwrap();
        ctx.sales.add_item(&mut sale, &water.id, 2).await.unwrap();
        ctx.sales.print_pre_bill(&sale).await.unwrap();

        assert_eq!(ctx.printed.kinds(), vec!["pre_bill"]);
        assert!(!sale.stored);
    }

    #[tokio::test]
    async fn test_stale_copy_is_refused_at_completion() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let soup = ctx.product("Sopa", 1000, None, Some(Destination::Kitchen)).await;
        let steak = ctx.product("Bife", 2000, Some(10), Some(Destination::Kitchen)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut first = ctx.sales.new_sale(&session, NewSale::counter(session.id())).unwrap();
        ctx.sales.add_item(&mut first, &soup.id, 1).await.unwrap();
        ctx.sales
            .record_payment(&session, &mut first, "cash", None)
            .await
            .unwrap();

        // Another terminal adds a line to the same sale and fires it
        let mut second = ctx.sales.load(first.id()).await.unwrap();
        ctx.sales.add_item(&mut second, &steak.id, 1).await.unwrap();
        ctx.sales.send_to_production(&session, &mut second).await.unwrap();

        let err = ctx
            .sales
            .complete_sale(&session, &mut first, &cashier)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Core(comanda_core::CoreError::PaymentIncomplete {
                remaining_cents: 2000
            })
        ));
        assert_eq!(first.status(), SaleStatus::Open);
        assert_eq!(ctx.db.stock().current_stock(&steak.id).await.unwrap(), 10);

        let stored = ctx.sales.load(first.id()).await.unwrap();
        assert_eq!(stored.status(), SaleStatus::Open);
        assert_eq!(stored.sale.total_cents, 3000);
        assert_eq!(stored.items.len(), 2);
    }

    #[tokio::test]
    async fn test_completion_releases_items_for_counter_service() {
        let mut config = EngineConfig::default();
        config.production.release_on_complete = true;
        let ctx = test_support::setup_with_config(config).await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let chopp = ctx.product("Chopp", 1200, Some(20), Some(Destination::Bar)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut sale = ctx.sales.new_sale(&session, NewSale::counter(session.id())).unwrap();
        ctx.sales.add_item(&mut sale, &burger.id, 1).await.unwrap();
        ctx.sales.add_item(&mut sale, &chopp.id, 2).await.unwrap();
        ctx.sales.send_to_production(&session, &mut sale).await.unwrap();
        ctx.production
            .advance(
                &crate::ProductionScope::station(Station::Kitchen),
                ProductionStatus::Pending,
                ProductionStatus::Preparing,
            )
            .await
            .unwrap();
        ctx.sales
            .record_payment(&session, &mut sale, "pix", None)
            .await
            .unwrap();

        let done = ctx.sales.complete_sale(&session, &mut sale, &cashier).await.unwrap();
        assert_eq!(done.released_items, 2);
        assert!(sale
            .items
            .iter()
            .all(|i| i.production_status == ProductionStatus::Delivered));

        let stored = ctx.db.sales().get_items(sale.id()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored
            .iter()
            .all(|i| i.production_status == ProductionStatus::Delivered));

        assert!(ctx.production.station_queue(Station::Kitchen).await.unwrap().is_empty());
        assert!(ctx.production.station_queue(Station::Bar).await.unwrap().is_empty());
        assert_eq!(ctx.printed.kinds(), vec!["kitchen", "kitchen", "receipt"]);
    }
}
