//! # Ticket Sink
//!
//! Where printable documents go. Layout belongs to the sink; the engine
//! hands over structured data and treats every failure as a warning.
//!
//! ```text
//! send_to_production ──► Ticket::Kitchen  (one per station)
//! print_pre_bill     ──► Ticket::PreBill
//! complete_sale      ──► Ticket::Receipt
//! close_session      ──► Ticket::ZReport
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use comanda_core::production::Station;
use comanda_core::reconciliation::ZReport;
use comanda_core::{Payment, Sale, SaleItem, SaleTotals};

use crate::error::EngineResult;

/// A document for the printing/reporting sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ticket {
    Kitchen {
        station: Station,
        sale_id: String,
        table_label: Option<String>,
        customer_label: Option<String>,
        items: Vec<SaleItem>,
    },
    PreBill {
        sale: Sale,
        items: Vec<SaleItem>,
        totals: SaleTotals,
    },
    Receipt {
        sale: Sale,
        items: Vec<SaleItem>,
        payments: Vec<Payment>,
        totals: SaleTotals,
    },
    ZReport(Box<ZReport>),
}

impl Ticket {
    pub fn kind(&self) -> &'static str {
        match self {
            Ticket::Kitchen { .. } => "kitchen",
            Ticket::PreBill { .. } => "pre_bill",
            Ticket::Receipt { .. } => "receipt",
            Ticket::ZReport(_) => "z_report",
        }
    }
}

/// Printing/reporting collaborator.
#[async_trait]
pub trait TicketSink: Send + Sync {
    async fn print(&self, ticket: Ticket) -> EngineResult<()>;
}

/// Sink that only logs. Default for headless deployments.
#[derive(Debug, Default, Clone)]
pub struct LoggingSink;

#[async_trait]
impl TicketSink for LoggingSink {
    async fn print(&self, ticket: Ticket) -> EngineResult<()> {
        match &ticket {
            Ticket::Kitchen {
                station,
                sale_id,
                items,
                ..
            } => info!(?station, sale_id = %sale_id, items = items.len(), "Kitchen ticket"),
            Ticket::PreBill { sale, totals, .. } => {
                info!(sale_id = %sale.id, total = %totals.total, "Pre-bill")
            }
            Ticket::Receipt { sale, totals, .. } => {
                info!(
                    sale_id = %sale.id,
                    total = %totals.total,
                    change = %totals.change_due,
                    "Receipt"
                )
            }
            Ticket::ZReport(report) => info!(
                session_id = %report.session_id,
                system_balance = %report.system_balance,
                difference = %report.difference,
                "Z report"
            ),
        }
        Ok(())
    }
}
