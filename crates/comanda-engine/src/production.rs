//! # Production Tracker
//!
//! Batch status transitions and station queues for the kitchen display.
//!
//! ```text
//! KDS "start all" (kitchen)    advance(kitchen, pending → preparing)
//!          │
//!          ▼
//! validate_transition  ── backward / same state ──► InvalidTransition
//!          │                                         (store untouched)
//!          ▼
//! UPDATE sale_items SET production_status = to
//!  WHERE production_status = from
//!    AND (destination = 'kitchen' OR destination IS NULL)
//! ```
//!
//! Repeating a batch moves nothing the second time, so a screen may retry
//! freely after a timeout.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use comanda_core::production::{build_station_queue, validate_transition, KdsTicket, Station};
use comanda_core::ProductionStatus;
use comanda_db::{Database, ProductionFilter};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::feed::{ChangeEvent, ChangeFeed};

/// Which items a batch transition touches.
#[derive(Debug, Clone, Default)]
pub struct ProductionScope {
    /// Limit to one station (unresolved items included).
    pub station: Option<Station>,
    /// Limit to one sale.
    pub sale_id: Option<String>,
}

impl ProductionScope {
    pub fn station(station: Station) -> Self {
        ProductionScope {
            station: Some(station),
            sale_id: None,
        }
    }

    pub fn sale(sale_id: impl Into<String>) -> Self {
        ProductionScope {
            station: None,
            sale_id: Some(sale_id.into()),
        }
    }
}

#[derive(Clone)]
pub struct ProductionTracker {
    db: Database,
    config: Arc<EngineConfig>,
    feed: ChangeFeed,
}

impl ProductionTracker {
    pub fn new(db: Database, config: Arc<EngineConfig>, feed: ChangeFeed) -> Self {
        ProductionTracker { db, config, feed }
    }

    /// Moves every item in `scope` from `from` to `to`.
    ///
    /// Returns how many items moved.
    pub async fn advance(
        &self,
        scope: &ProductionScope,
        from: ProductionStatus,
        to: ProductionStatus,
    ) -> EngineResult<u64> {
        validate_transition(from, to)?;

        let destination = scope.station.map(|s| s.destination());
        let updated = self
            .db
            .sales()
            .update_production(
                ProductionFilter {
                    tenant_id: self.config.tenant_id(),
                    destination,
                    sale_id: scope.sale_id.as_deref(),
                },
                from,
                to,
            )
            .await?;

        if updated > 0 {
            info!(
                station = ?scope.station,
                sale_id = ?scope.sale_id,
                from = from.as_str(),
                to = to.as_str(),
                updated,
                "Production advanced"
            );
            self.feed.publish(ChangeEvent::ProductionAdvanced {
                destination,
                sale_id: scope.sale_id.clone(),
                to,
                updated,
            });
        }
        Ok(updated)
    }

    /// Tickets for one station, most urgent first.
    pub async fn station_queue(&self, station: Station) -> EngineResult<Vec<KdsTicket>> {
        let board = self.db.sales().production_board(self.config.tenant_id()).await?;
        Ok(build_station_queue(
            station,
            &board,
            Utc::now(),
            self.config.production.alert_threshold_minutes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::test_support;
    use comanda_core::sale::{NewLine, NewSale};
    use comanda_core::{Destination, Money, Role, SessionKind};

    #[tokio::test]
    async fn test_backward_transition_touches_nothing() {
        let ctx = test_support::setup().await;
        let err = ctx
            .production
            .advance(
                &ProductionScope::default(),
                ProductionStatus::Ready,
                ProductionStatus::Preparing,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(_)));

        let err = ctx
            .production
            .advance(
                &ProductionScope::default(),
                ProductionStatus::Ready,
                ProductionStatus::Ready,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(_)));
    }

    #[tokio::test]
    async fn test_station_batch_and_fail_open_queue() {
        let ctx = test_support::setup().await;
        let cashier = ctx.actor("Caixa", Role::Cashier, "0000").await;
        let burger = ctx.product("X-Burger", 3200, None, Some(Destination::Kitchen)).await;
        let chopp = ctx.product("Chopp", 1200, Some(20), Some(Destination::Bar)).await;
        let session = ctx
            .sessions
            .open_session(&cashier, Money::zero(), SessionKind::Counter)
            .await
            .unwrap();

        let mut table = ctx.sales.new_sale(&session, NewSale::table(session.id(), "3", 2)).unwrap();
        ctx.sales.add_item(&mut table, &burger.id, 1).await.unwrap();
        ctx.sales.add_item(&mut table, &chopp.id, 2).await.unwrap();
        ctx.sales.send_to_production(&session, &mut table).await.unwrap();

        // A line nobody could route shows on every screen
        let mut odd = ctx.sales.new_sale(&session, NewSale::table(session.id(), "5", 1)).unwrap();
        odd.add_line(NewLine {
            product_id: None,
            name: "Pedido especial".into(),
            unit_price: Money::from_cents(1500),
            quantity: 1,
            destination: None,
            notes: None,
        })
        .unwrap();
        ctx.sales.send_to_production(&session, &mut odd).await.unwrap();

        let bar = ctx.production.station_queue(Station::Bar).await.unwrap();
        assert_eq!(bar.len(), 2);
        let fail_open = bar.iter().find(|t| t.sale_id == odd.id()).unwrap();
        assert!(fail_open.fail_open);
        let bar_table = bar.iter().find(|t| t.sale_id == table.id()).unwrap();
        assert_eq!(bar_table.items.len(), 1);
        assert_eq!(bar_table.items[0].name_snapshot, "Chopp");

        let moved = ctx
            .production
            .advance(
                &ProductionScope::station(Station::Kitchen),
                ProductionStatus::Pending,
                ProductionStatus::Preparing,
            )
            .await
            .unwrap();
        assert_eq!(moved, 2);

        let again = ctx
            .production
            .advance(
                &ProductionScope::station(Station::Kitchen),
                ProductionStatus::Pending,
                ProductionStatus::Preparing,
            )
            .await
            .unwrap();
        assert_eq!(again, 0);

        let delivered = ctx
            .production
            .advance(
                &ProductionScope::sale(table.id()),
                ProductionStatus::Pending,
                ProductionStatus::Delivered,
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let bar = ctx.production.station_queue(Station::Bar).await.unwrap();
        assert_eq!(bar.len(), 1);
        assert_eq!(bar[0].sale_id, odd.id());
    }
}
