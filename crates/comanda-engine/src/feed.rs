//! # Change Feed
//!
//! In-process notifications for display clients (KDS screens, table map,
//! cashier dashboard). Publishing never blocks and never fails the
//! operation that published; a client that falls behind skips ahead.
//!
//! ```text
//! SaleEngine ─────┐
//! ProductionTracker ──► ChangeFeed (broadcast, 256) ──► KDS kitchen
//! SessionManager ─┘                                 ──► KDS bar
//! DeliveryIntake ─┘                                 ──► table map
//! ```

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use comanda_core::{Destination, ProductionStatus, SaleStatus};

const FEED_CAPACITY: usize = 256;

/// Something a display may need to refresh for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    SaleUpdated {
        sale_id: String,
        status: SaleStatus,
    },
    ItemsSent {
        sale_id: String,
        items: usize,
    },
    ProductionAdvanced {
        destination: Option<Destination>,
        sale_id: Option<String>,
        to: ProductionStatus,
        updated: u64,
    },
    SessionOpened {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    DeliveryOrderReceived {
        sale_id: String,
        external_order_id: String,
    },
}

/// Broadcast channel shared by every engine service.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        ChangeFeed { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. No subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        trace!(?event, "Publishing change");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
