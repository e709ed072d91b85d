//! # Production Rules
//!
//! Pure rules behind the kitchen/bar display (KDS): item routing, the
//! forward-only state machine, and the urgency signal used for ordering.
//!
//! ## Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. product.destination set?      ──► use it (authoritative)           │
//! │  2. name available?               ──► keyword match → bar              │
//! │                                       otherwise     → kitchen          │
//! │  3. nothing to go on              ──► unresolved (NULL)                │
//! │                                                                         │
//! │  A ticket with ANY unresolved item is shown on EVERY station.          │
//! │  Dropping an item silently is worse than showing it twice.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::types::{Destination, Product, ProductionStatus, Sale, SaleItem};

// =============================================================================
// State Machine
// =============================================================================

/// Initial production status for a newly persisted item.
///
/// Items explicitly routed to no station skip the queue entirely.
pub fn initial_status(destination: Option<Destination>) -> ProductionStatus {
    match destination {
        Some(Destination::None) => ProductionStatus::Delivered,
        _ => ProductionStatus::Pending,
    }
}

/// Validates a batch transition `from → to`.
///
/// Forward jumps are allowed (a runner may mark a pending drink delivered);
/// same-state and backward moves are not.
pub fn validate_transition(from: ProductionStatus, to: ProductionStatus) -> CoreResult<()> {
    if to.rank() <= from.rank() {
        return Err(CoreError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Stations
// =============================================================================

/// A KDS screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Station {
    Kitchen,
    Bar,
}

impl Station {
    pub fn destination(&self) -> Destination {
        match self {
            Station::Kitchen => Destination::Kitchen,
            Station::Bar => Destination::Bar,
        }
    }
}

/// Keyword fallback for products without an explicit destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRules {
    /// Lower-case fragments that mark a product as a bar item.
    pub beverage_keywords: Vec<String>,
}

impl Default for RoutingRules {
    fn default() -> Self {
        let keywords = [
            "suco", "refri", "cerveja", "chopp", "drink", "caipirinha", "vinho", "agua", "água",
            "coca", "juice", "beer", "wine", "soda", "cocktail",
        ];
        RoutingRules {
            beverage_keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl RoutingRules {
    /// Resolves a destination from a catalog product or a bare line name.
    pub fn resolve(&self, product: Option<&Product>, name: Option<&str>) -> Option<Destination> {
        if let Some(destination) = product.and_then(|p| p.destination) {
            return Some(destination);
        }

        let name = product.map(|p| p.name.as_str()).or(name)?;
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return None;
        }

        if self
            .beverage_keywords
            .iter()
            .any(|k| !k.is_empty() && name.contains(&k.to_lowercase()))
        {
            Some(Destination::Bar)
        } else {
            Some(Destination::Kitchen)
        }
    }
}

/// Whether a ticket must be shown on every station.
pub fn is_fail_open(items: &[SaleItem]) -> bool {
    items.iter().any(|i| i.destination.is_none())
}

/// Items of one ticket a station should display.
///
/// A station sees its own items plus every unresolved one, the same set a
/// station batch transition moves. A fail-open ticket therefore reaches
/// every screen without showing items another station owns.
pub fn items_for_station(station: Station, items: &[SaleItem]) -> Vec<SaleItem> {
    items
        .iter()
        .filter(|i| i.production_status != ProductionStatus::Delivered)
        .filter(|i| i.destination.is_none() || i.destination == Some(station.destination()))
        .cloned()
        .collect()
}

// =============================================================================
// Urgency
// =============================================================================

/// Display urgency, derived from elapsed time. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    /// ≥ 50% of the alert threshold.
    Warning,
    /// ≥ 100% of the alert threshold.
    Critical,
}

impl Urgency {
    /// Buckets `elapsed / threshold`.
    pub fn from_elapsed(elapsed_minutes: i64, threshold_minutes: i64) -> Self {
        if threshold_minutes <= 0 {
            return Urgency::Normal;
        }
        let pct = elapsed_minutes.max(0) * 100 / threshold_minutes;
        if pct >= 100 {
            Urgency::Critical
        } else if pct >= 50 {
            Urgency::Warning
        } else {
            Urgency::Normal
        }
    }
}

/// One ticket on a station queue.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct KdsTicket {
    pub sale_id: String,
    pub table_label: Option<String>,
    pub customer_label: Option<String>,
    pub items: Vec<SaleItem>,
    /// Shown everywhere because an item has no resolved destination.
    pub fail_open: bool,
    #[ts(as = "String")]
    pub oldest_at: DateTime<Utc>,
    pub elapsed_minutes: i64,
    pub urgency: Urgency,
}

/// Builds a station queue from open sales and their items.
///
/// Tickets are ordered by urgency (critical first), then by age.
pub fn build_station_queue(
    station: Station,
    sales: &[(Sale, Vec<SaleItem>)],
    now: DateTime<Utc>,
    alert_threshold_minutes: i64,
) -> Vec<KdsTicket> {
    let mut queue: Vec<KdsTicket> = sales
        .iter()
        .filter_map(|(sale, items)| {
            let visible = items_for_station(station, items);
            let oldest_at = visible.iter().map(|i| i.created_at).min()?;
            let elapsed_minutes = (now - oldest_at).num_minutes();
            Some(KdsTicket {
                sale_id: sale.id.clone(),
                table_label: sale.table_label.clone(),
                customer_label: sale.customer_label.clone(),
                fail_open: is_fail_open(items),
                items: visible,
                oldest_at,
                elapsed_minutes,
                urgency: Urgency::from_elapsed(elapsed_minutes, alert_threshold_minutes),
            })
        })
        .collect();

    queue.sort_by(|a, b| {
        b.urgency
            .cmp(&a.urgency)
            .then_with(|| a.oldest_at.cmp(&b.oldest_at))
    });
    queue
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SaleOrigin, SaleStatus};
    use chrono::Duration;

    fn item(id: &str, destination: Option<Destination>, minutes_ago: i64) -> SaleItem {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        SaleItem {
            id: id.to_string(),
            sale_id: "s".to_string(),
            product_id: None,
            name_snapshot: id.to_string(),
            quantity: 1,
            unit_price_cents: 100,
            production_status: ProductionStatus::Pending,
            destination,
            notes: None,
            created_at: at,
            status_changed_at: at,
        }
    }

    fn sale(id: &str) -> Sale {
        let now = Utc::now();
        Sale {
            id: id.to_string(),
            tenant_id: "t".to_string(),
            session_id: None,
            table_label: Some(id.to_string()),
            customer_label: None,
            people_count: 1,
            status: SaleStatus::Open,
            origin: SaleOrigin::Counter,
            subtotal_cents: 0,
            service_fee_enabled: false,
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
        }
    }

    #[test]
    fn test_transitions_are_forward_only() {
        use ProductionStatus::*;
        assert!(validate_transition(Pending, Preparing).is_ok());
        assert!(validate_transition(Pending, Delivered).is_ok());
        assert!(validate_transition(Ready, Preparing).is_err());
        assert!(validate_transition(Ready, Ready).is_err());
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(initial_status(Some(Destination::Kitchen)), ProductionStatus::Pending);
        assert_eq!(initial_status(None), ProductionStatus::Pending);
        assert_eq!(initial_status(Some(Destination::None)), ProductionStatus::Delivered);
    }

    #[test]
    fn test_routing_keyword_fallback() {
        let rules = RoutingRules::default();
        assert_eq!(rules.resolve(None, Some("Suco de laranja")), Some(Destination::Bar));
        assert_eq!(rules.resolve(None, Some("Feijoada")), Some(Destination::Kitchen));
        assert_eq!(rules.resolve(None, None), None);
        assert_eq!(rules.resolve(None, Some("  ")), None);
    }

    #[test]
    fn test_fail_open_ticket_shows_everywhere() {
        let items = vec![
            item("burger", Some(Destination::Kitchen), 5),
            item("beer", Some(Destination::Bar), 5),
            item("mystery", None, 5),
        ];
        assert!(is_fail_open(&items));

        let bar: Vec<String> = items_for_station(Station::Bar, &items)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(bar, vec!["beer", "mystery"]);

        let kitchen: Vec<String> = items_for_station(Station::Kitchen, &items)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(kitchen, vec!["burger", "mystery"]);

        let routed = vec![
            item("burger", Some(Destination::Kitchen), 5),
            item("beer", Some(Destination::Bar), 5),
        ];
        let bar = items_for_station(Station::Bar, &routed);
        assert_eq!(bar.len(), 1);
        assert_eq!(bar[0].id, "beer");
    }

    #[test]
    fn test_urgency_buckets() {
        assert_eq!(Urgency::from_elapsed(4, 10), Urgency::Normal);
        assert_eq!(Urgency::from_elapsed(5, 10), Urgency::Warning);
        assert_eq!(Urgency::from_elapsed(10, 10), Urgency::Critical);
        assert_eq!(Urgency::from_elapsed(30, 0), Urgency::Normal);
    }

    #[test]
    fn test_queue_orders_by_urgency_then_age() {
        let sales = vec![
            (sale("fresh"), vec![item("a", Some(Destination::Kitchen), 1)]),
            (sale("late"), vec![item("b", Some(Destination::Kitchen), 25)]),
            (sale("bar-only"), vec![item("c", Some(Destination::Bar), 40)]),
        ];
        let queue = build_station_queue(Station::Kitchen, &sales, Utc::now(), 20);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].sale_id, "late");
        assert_eq!(queue[0].urgency, Urgency::Critical);
        assert_eq!(queue[1].sale_id, "fresh");
    }
}
