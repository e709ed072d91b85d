//! # Fiscal Service Adapter
//!
//! ```text
//! POST {endpoint}/documents   Authorization: Bearer {api_token}
//!
//!   2xx {"status": "authorized", "document_url": ...}  ──► authorized
//!   2xx {"status": "rejected",   "message": ...}       ──► error (final)
//!   2xx {"status": "processing"}                       ──► pending (retry)
//!   4xx                                                ──► error (final)
//!   408 / 429 / 5xx / network                          ──► Err (retry)
//! ```

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use comanda_core::reconciliation::SaleRecord;
use comanda_engine::config::FiscalSettings;
use comanda_engine::{EngineError, EngineResult, FiscalEmitter, FiscalOutcome};

use super::{endpoint_path, http_client, parse_endpoint};
use crate::error::AgentResult;

const SERVICE: &str = "fiscal";

#[derive(Debug, Serialize)]
struct DocumentRequest<'a> {
    sale_id: &'a str,
    tenant_id: &'a str,
    total_cents: i64,
    discount_cents: i64,
    service_fee_cents: i64,
    items: Vec<DocumentItem<'a>>,
    payments: Vec<DocumentPayment<'a>>,
}

#[derive(Debug, Serialize)]
struct DocumentItem<'a> {
    name: &'a str,
    quantity: i64,
    unit_price_cents: i64,
}

#[derive(Debug, Serialize)]
struct DocumentPayment<'a> {
    method: &'a str,
    amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DocumentStatus {
    Authorized,
    Rejected,
    Processing,
}

#[derive(Debug, Deserialize)]
struct DocumentResponse {
    status: DocumentStatus,
    #[serde(default)]
    document_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl<'a> DocumentRequest<'a> {
    fn from_record(record: &'a SaleRecord) -> Self {
        DocumentRequest {
            sale_id: &record.sale.id,
            tenant_id: &record.sale.tenant_id,
            total_cents: record.sale.total_cents,
            discount_cents: record.sale.discount_cents,
            service_fee_cents: record.sale.service_fee_cents,
            items: record
                .items
                .iter()
                .map(|item| DocumentItem {
                    name: &item.name_snapshot,
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                })
                .collect(),
            payments: record
                .payments
                .iter()
                .map(|payment| DocumentPayment {
                    method: &payment.method,
                    amount_cents: payment.amount_cents,
                })
                .collect(),
        }
    }
}

fn outcome_from(response: DocumentResponse) -> FiscalOutcome {
    match response.status {
        DocumentStatus::Authorized => FiscalOutcome {
            status: comanda_core::FiscalStatus::Authorized,
            document_url: response.document_url,
            message: response.message,
        },
        DocumentStatus::Rejected => {
            FiscalOutcome::rejected(response.message.unwrap_or_else(|| "rejected".to_string()))
        }
        DocumentStatus::Processing => FiscalOutcome::pending(),
    }
}

/// Whether a non-success status is worth retrying.
fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// [`FiscalEmitter`] over the fiscal service HTTP API.
pub struct HttpFiscalEmitter {
    client: reqwest::Client,
    documents_url: Url,
    api_token: Option<String>,
}

impl HttpFiscalEmitter {
    pub fn new(settings: &FiscalSettings) -> AgentResult<Self> {
        let base = parse_endpoint(settings.endpoint.as_deref(), "fiscal")?;
        Ok(HttpFiscalEmitter {
            client: http_client(settings.timeout_secs)?,
            documents_url: endpoint_path(&base, "documents"),
            api_token: settings.api_token.clone(),
        })
    }
}

#[async_trait]
impl FiscalEmitter for HttpFiscalEmitter {
    async fn emit(&self, record: &SaleRecord) -> EngineResult<FiscalOutcome> {
        let mut request = self
            .client
            .post(self.documents_url.clone())
            .json(&DocumentRequest::from_record(record));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::external(SERVICE, e.to_string()))?;
        let status = response.status();
        debug!(sale_id = %record.sale.id, %status, "Fiscal service answered");

        if status.is_success() {
            let body: DocumentResponse = response
                .json()
                .await
                .map_err(|e| EngineError::external(SERVICE, format!("invalid response: {e}")))?;
            return Ok(outcome_from(body));
        }

        let text = response.text().await.unwrap_or_default();
        if is_transient(status) {
            return Err(EngineError::external(SERVICE, format!("{status}: {text}")));
        }
        Ok(FiscalOutcome::rejected(format!("{status}: {text}")))
    }
}
