//! # Delivery Channel Adapter
//!
//! ```text
//! POST {endpoint}/oauth/token            client_credentials ──► access token
//! GET  {endpoint}/orders?status=pending  Bearer token       ──► [DeliveryOrder]
//! POST {endpoint}/orders/acknowledgment  {"ids": [...]}
//!
//! 401 on orders ──► CredentialExpired (the intake refreshes and retries once)
//! ```
//!
//! The token lives in memory only; a restart starts with a refresh.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use comanda_engine::config::IntakeSettings;
use comanda_engine::{DeliveryChannel, DeliveryOrder, EngineError, EngineResult};

use super::{endpoint_path, http_client, parse_endpoint};
use crate::error::{AgentError, AgentResult};

const SERVICE: &str = "delivery";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct Acknowledgment<'a> {
    ids: &'a [String],
}

/// [`DeliveryChannel`] over a delivery platform HTTP API.
pub struct HttpDeliveryChannel {
    client: reqwest::Client,
    base: Url,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<String>>,
}

impl HttpDeliveryChannel {
    pub fn new(settings: &IntakeSettings) -> AgentResult<Self> {
        let base = parse_endpoint(settings.endpoint.as_deref(), "intake")?;
        let client_id = settings
            .client_id
            .clone()
            .ok_or_else(|| AgentError::Config("intake.client_id is required".into()))?;
        let client_secret = settings
            .client_secret
            .clone()
            .ok_or_else(|| AgentError::Config("intake.client_secret is required".into()))?;

        Ok(HttpDeliveryChannel {
            client: http_client(settings.timeout_secs)?,
            base,
            client_id,
            client_secret,
            token: RwLock::new(None),
        })
    }

    async fn bearer(&self) -> EngineResult<String> {
        self.token.read().await.clone().ok_or_else(expired)
    }
}

fn expired() -> EngineError {
    EngineError::CredentialExpired {
        service: SERVICE.to_string(),
    }
}

fn transport(e: reqwest::Error) -> EngineError {
    EngineError::external(SERVICE, e.to_string())
}

/// Maps a non-success status of an authenticated call.
fn status_error(status: StatusCode, body: &str) -> EngineError {
    if status == StatusCode::UNAUTHORIZED {
        expired()
    } else {
        EngineError::external(SERVICE, format!("{status}: {body}"))
    }
}

#[async_trait]
impl DeliveryChannel for HttpDeliveryChannel {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn fetch_orders(&self) -> EngineResult<Vec<DeliveryOrder>> {
        let token = self.bearer().await?;
        let mut url = endpoint_path(&self.base, "orders");
        url.query_pairs_mut().append_pair("status", "pending");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let orders: Vec<DeliveryOrder> = response
            .json()
            .await
            .map_err(|e| EngineError::external(SERVICE, format!("invalid orders payload: {e}")))?;
        debug!(count = orders.len(), "Delivery orders fetched");
        Ok(orders)
    }

    async fn acknowledge(&self, external_ids: &[String]) -> EngineResult<()> {
        let token = self.bearer().await?;
        let response = self
            .client
            .post(endpoint_path(&self.base, "orders/acknowledgment"))
            .bearer_auth(token)
            .json(&Acknowledgment { ids: external_ids })
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(())
    }

    async fn refresh_credential(&self) -> EngineResult<()> {
        let response = self
            .client
            .post(endpoint_path(&self.base, "oauth/token"))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::external(
                SERVICE,
                format!("token endpoint answered {status}: {body}"),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::external(SERVICE, format!("invalid token payload: {e}")))?;
        *self.token.write().await = Some(token.access_token);
        info!("Delivery channel credential refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IntakeSettings {
        IntakeSettings {
            enabled: true,
            endpoint: Some("https://merchant.example.com/v1".into()),
            client_id: Some("loja-01".into()),
            client_secret: Some("s3cret".into()),
            ..IntakeSettings::default()
        }
    }

    #[tokio::test]
    async fn test_without_token_the_credential_is_expired() {
        let channel = HttpDeliveryChannel::new(&settings()).unwrap();
        let err = channel.fetch_orders().await.unwrap_err();
        assert!(matches!(err, EngineError::CredentialExpired { .. }));
        let err = channel.acknowledge(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, EngineError::CredentialExpired { .. }));
    }

    #[test]
    fn test_unauthorized_maps_to_expired() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            EngineError::CredentialExpired { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "maintenance"),
            EngineError::ExternalService { .. }
        ));
    }

    #[test]
    fn test_credentials_are_required() {
        let mut missing = settings();
        missing.client_secret = None;
        assert!(matches!(
            HttpDeliveryChannel::new(&missing),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_orders_payload_shape() {
        let json = r#"[{
            "external_id": "ifd-123",
            "customer_name": "Ana",
            "lines": [{"sku": "XB", "name": "X Burger", "quantity": 2, "unit_price_cents": 3000}],
            "discount_cents": 500,
            "prepaid": true
        }]"#;
        let orders: Vec<DeliveryOrder> = serde_json::from_str(json).unwrap();
        assert_eq!(orders[0].lines[0].sku.as_deref(), Some("XB"));
        assert!(orders[0].prepaid);
    }
}
