//! # Delivery Intake
//!
//! Pulls orders from a delivery channel and materializes them as sales.
//!
//! ## Poll Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Delivery Intake Cycle                            │
//! │                                                                         │
//! │  tick (poll_interval_secs, default 30)                                  │
//! │    │                                                                    │
//! │    ├── no open cashier session ──► skip, orders stay unacknowledged     │
//! │    │                                                                    │
//! │    ▼                                                                    │
//! │  fetch_orders ── CredentialExpired ──► refresh_credential ──► fetch     │
//! │    │                                    (refresh fails → cycle fails)   │
//! │    ▼                                                                    │
//! │  for each order:                                                        │
//! │    external id already stored ──► duplicate (ack again)                 │
//! │    otherwise ──► INSERT sale + items (+ prepaid payment)                │
//! │                  unique violation = another poller won ──► duplicate    │
//! │    │                                                                    │
//! │    ▼                                                                    │
//! │  acknowledge(materialized + duplicates)                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An order that fails to materialize is not acknowledged, so the channel
//! delivers it again on the next cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use comanda_core::production::RoutingRules;
use comanda_core::sale::{NewLine, NewSale};
use comanda_core::{
    CashierSession, Discount, Money, PricingPolicy, SaleAggregate, SaleOrigin,
};
use comanda_db::{Database, DbError, SaleWrite};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::feed::{ChangeEvent, ChangeFeed};

const CHANNEL_DISCOUNT_REASON: &str = "desconto do canal de entrega";

// =============================================================================
// Channel
// =============================================================================

/// One order as delivered by the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub external_id: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub lines: Vec<DeliveryLine>,
    /// Discount funded by the store (coupon), in cents.
    #[serde(default)]
    pub discount_cents: i64,
    /// Already charged by the channel.
    #[serde(default)]
    pub prepaid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLine {
    #[serde(default)]
    pub sku: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A third-party delivery channel.
///
/// `fetch_orders` and `acknowledge` fail with
/// [`EngineError::CredentialExpired`] when the access token must be renewed.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_orders(&self) -> EngineResult<Vec<DeliveryOrder>>;

    async fn acknowledge(&self, external_ids: &[String]) -> EngineResult<()>;

    async fn refresh_credential(&self) -> EngineResult<()>;
}

// =============================================================================
// Intake
// =============================================================================

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeReport {
    /// No open session; nothing fetched.
    pub skipped: bool,
    pub received: usize,
    pub created: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub struct DeliveryIntake {
    db: Database,
    config: Arc<EngineConfig>,
    channel: Arc<dyn DeliveryChannel>,
    feed: ChangeFeed,
    policy: PricingPolicy,
    rules: RoutingRules,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a spawned [`DeliveryIntake`].
#[derive(Clone)]
pub struct DeliveryIntakeHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl DeliveryIntakeHandle {
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| EngineError::external("delivery intake", "shutdown channel closed"))
    }
}

enum Materialized {
    Created(String),
    Duplicate,
}

impl DeliveryIntake {
    pub fn new(
        db: Database,
        config: Arc<EngineConfig>,
        channel: Arc<dyn DeliveryChannel>,
        feed: ChangeFeed,
    ) -> (Self, DeliveryIntakeHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let intake = DeliveryIntake {
            policy: config.pricing_policy(),
            rules: config.routing_rules(),
            db,
            config,
            channel,
            feed,
            shutdown_rx,
        };
        (intake, DeliveryIntakeHandle { shutdown_tx })
    }

    /// Polls until shut down. Spawn as a background task.
    pub async fn run(mut self) {
        info!(
            channel = self.channel.name(),
            poll_interval_secs = self.config.intake.poll_interval_secs,
            "Delivery intake starting"
        );

        let poll_interval = Duration::from_secs(self.config.intake.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(
                            channel = self.channel.name(),
                            error = %e,
                            "Delivery intake cycle failed"
                        );
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Delivery intake shutting down");
                    break;
                }
            }
        }

        info!("Delivery intake stopped");
    }

    /// Runs one fetch → materialize → acknowledge cycle.
    pub async fn poll_once(&self) -> EngineResult<IntakeReport> {
        let mut report = IntakeReport::default();

        let Some(session) = self.db.sessions().current(self.config.tenant_id()).await? else {
            debug!("No open cashier session, delivery orders left for the next cycle");
            report.skipped = true;
            return Ok(report);
        };

        let orders = match self.channel.fetch_orders().await {
            Err(EngineError::CredentialExpired { .. }) => {
                self.refresh().await?;
                self.channel.fetch_orders().await?
            }
            other => other?,
        };
        report.received = orders.len();
        if orders.is_empty() {
            return Ok(report);
        }

        let mut acknowledged = Vec::with_capacity(orders.len());
        for order in &orders {
            match self.materialize(&session, order).await {
                Ok(Materialized::Created(sale_id)) => {
                    report.created += 1;
                    acknowledged.push(order.external_id.clone());
                    self.feed.publish(ChangeEvent::DeliveryOrderReceived {
                        sale_id,
                        external_order_id: order.external_id.clone(),
                    });
                }
                Ok(Materialized::Duplicate) => {
                    report.duplicates += 1;
                    acknowledged.push(order.external_id.clone());
                }
                Err(e) => {
                    warn!(
                        external_id = %order.external_id,
                        error = %e,
                        "Delivery order not materialized"
                    );
                    report.failed += 1;
                }
            }
        }

        if !acknowledged.is_empty() {
            match self.channel.acknowledge(&acknowledged).await {
                Err(EngineError::CredentialExpired { .. }) => {
                    self.refresh().await?;
                    self.channel.acknowledge(&acknowledged).await?;
                }
                other => other?,
            }
        }

        info!(
            channel = self.channel.name(),
            received = report.received,
            created = report.created,
            duplicates = report.duplicates,
            failed = report.failed,
            "Delivery intake cycle"
        );
        Ok(report)
    }

    async fn refresh(&self) -> EngineResult<()> {
        info!(channel = self.channel.name(), "Refreshing delivery channel credential");
        self.channel.refresh_credential().await.map_err(|e| {
            warn!(channel = self.channel.name(), error = %e, "Credential refresh failed");
            e
        })
    }

    /// Writes one order as an open delivery sale.
    async fn materialize(
        &self,
        session: &CashierSession,
        order: &DeliveryOrder,
    ) -> EngineResult<Materialized> {
        if self
            .db
            .sales()
            .find_by_external_id(&order.external_id)
            .await?
            .is_some()
        {
            debug!(external_id = %order.external_id, "Delivery order already stored");
            return Ok(Materialized::Duplicate);
        }

        let tenant_id = self.config.tenant_id();
        let header = NewSale {
            session_id: Some(session.id.clone()),
            table_label: None,
            customer_label: order.customer_name.clone(),
            people_count: 1,
            origin: SaleOrigin::Delivery,
            service_fee_enabled: false,
        };
        let mut sale = SaleAggregate::new(tenant_id, header, self.policy)?;
        sale.sale.external_order_id = Some(order.external_id.clone());

        for line in &order.lines {
            let product = match line.sku.as_deref() {
                Some(sku) => self.db.products().get_by_sku(tenant_id, sku).await?,
                None => None,
            };
            let product = match product {
                Some(product) => Some(product),
                None => self.db.products().find_by_name(tenant_id, &line.name).await?,
            };

            sale.add_line(NewLine {
                product_id: product.as_ref().map(|p| p.id.clone()),
                name: line.name.clone(),
                unit_price: Money::from_cents(line.unit_price_cents),
                quantity: line.quantity,
                destination: self.rules.resolve(product.as_ref(), Some(&line.name)),
                notes: line.notes.clone(),
            })?;
        }

        if order.discount_cents > 0 {
            sale.apply_discount(
                Discount::fixed(Money::from_cents(order.discount_cents)),
                CHANNEL_DISCOUNT_REASON,
            )?;
        }

        let payments = if order.prepaid && sale.totals().total.is_positive() {
            vec![sale.add_payment(&self.config.intake.prepaid_method, None)?]
        } else {
            Vec::new()
        };
        let items = sale.commit_pending();

        let saved = self
            .db
            .sales()
            .save(SaleWrite {
                sale: &sale.sale,
                stored: false,
                new_items: &items,
                new_payments: &payments,
            })
            .await;
        match saved {
            Ok(()) => {
                info!(
                    sale_id = %sale.id(),
                    external_id = %order.external_id,
                    items = items.len(),
                    total = %sale.totals().total,
                    "Delivery order materialized"
                );
                Ok(Materialized::Created(sale.id().to_string()))
            }
            Err(DbError::UniqueViolation { .. }) => {
                debug!(external_id = %order.external_id, "Delivery order stored concurrently");
                Ok(Materialized::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }
}
