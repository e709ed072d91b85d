//! # HTTP Adapters
//!
//! reqwest implementations of the engine's outbound seams.
//!
//! - [`fiscal`] - [`FiscalEmitter`](comanda_engine::FiscalEmitter) over the fiscal service API
//! - [`delivery`] - [`DeliveryChannel`](comanda_engine::DeliveryChannel) over a delivery platform API

pub mod delivery;
pub mod fiscal;

use std::time::Duration;

use url::Url;

use crate::error::{AgentError, AgentResult};

pub use delivery::HttpDeliveryChannel;
pub use fiscal::HttpFiscalEmitter;

/// Parses a configured base endpoint.
pub(crate) fn parse_endpoint(endpoint: Option<&str>, section: &str) -> AgentResult<Url> {
    let raw = endpoint
        .ok_or_else(|| AgentError::Config(format!("{section}.endpoint is required")))?;
    let url = Url::parse(raw).map_err(|e| AgentError::InvalidEndpoint {
        endpoint: raw.to_string(),
        message: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(AgentError::InvalidEndpoint {
            endpoint: raw.to_string(),
            message: "not a base URL".to_string(),
        });
    }
    Ok(url)
}

/// Appends path segments to a base endpoint, with or without trailing slash.
pub(crate) fn endpoint_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty();
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
    }
    url
}

pub(crate) fn http_client(timeout_secs: u64) -> AgentResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(concat!("comanda-agent/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_path_joins_segments() {
        let base = parse_endpoint(Some("https://api.example.com/v2"), "fiscal").unwrap();
        assert_eq!(
            endpoint_path(&base, "documents").as_str(),
            "https://api.example.com/v2/documents"
        );

        let slash = parse_endpoint(Some("https://api.example.com/v2/"), "fiscal").unwrap();
        assert_eq!(
            endpoint_path(&slash, "orders/acknowledgment").as_str(),
            "https://api.example.com/v2/orders/acknowledgment"
        );
    }

    #[test]
    fn test_parse_endpoint_errors() {
        assert!(matches!(
            parse_endpoint(None, "intake"),
            Err(AgentError::Config(_))
        ));
        assert!(matches!(
            parse_endpoint(Some("not a url"), "intake"),
            Err(AgentError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            parse_endpoint(Some("mailto:ops@example.com"), "intake"),
            Err(AgentError::InvalidEndpoint { .. })
        ));
    }
}
