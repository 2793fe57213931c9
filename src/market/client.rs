use async_trait::async_trait;
use reqwest::{Client, Proxy, StatusCode};
use thiserror::Error;

use crate::config::MarketConfig;

/// Symbol list endpoint
pub const SYMBOLS_PATH: &str = "/v1/common/symbols";

/// Relative path of the recent trade history for one symbol
pub fn trade_history_path(symbol: &str, size: u32) -> String {
    format!("/market/history/trade?size={}&symbol={}", size, symbol)
}

/// A failed exchange request, carrying the exact URL that failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{url}: {message}")]
pub struct HttpError {
    pub url: String,
    pub message: String,
}

impl HttpError {
    pub fn new(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            message: message.into(),
        }
    }
}

/// Raw access to the exchange REST API
///
/// Implementations hand back the response body untouched; parsing belongs to the caller.
#[async_trait]
pub trait MarketClient: Send + Sync {
    /// Absolute URL a target resolves to
    fn resolve(&self, target: &str) -> String;

    /// GET `target` (relative path or absolute URL)
    async fn get(&self, target: &str) -> Result<String, HttpError>;
}

/// Huobi Pro REST client
pub struct HuobiClient {
    http: Client,
    base_url: String,
}

impl HuobiClient {
    pub fn new(config: &MarketConfig) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout());

        if let Some(proxy_url) = &config.proxy_url {
            builder = builder.proxy(Proxy::all(proxy_url)?);
            tracing::info!("Routing exchange requests through proxy {}", proxy_url);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketClient for HuobiClient {
    fn resolve(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else if target.starts_with('/') {
            format!("{}{}", self.base_url, target)
        } else {
            format!("{}/{}", self.base_url, target)
        }
    }

    async fn get(&self, target: &str) -> Result<String, HttpError> {
        let url = self.resolve(target);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| HttpError::new(&url, e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(HttpError::new(&url, status_message(status)));
        }

        response
            .text()
            .await
            .map_err(|e| HttpError::new(&url, e.to_string()))
    }
}

/// "<code> & <reason>", e.g. "502 & Bad Gateway"
fn status_message(status: StatusCode) -> String {
    format!(
        "{} & {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown Status")
    )
}
