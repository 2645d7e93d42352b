#[cfg(test)]
mod tests;

use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, HeaderValue, USER_AGENT},
};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Errors raised while talking to VK over HTTP.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or its body could not be read.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("HTTP status {0}")]
    Status(StatusCode),
    /// No response arrived within the given time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The body was JSON but not of the expected shape.
    #[error("Unexpected response body: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether sending the same request again may succeed: network failures,
    /// timeouts, 5xx and 429. Client errors and bad responses are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => !e.is_builder() && !e.is_decode(),
            Self::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Timeout(_) => true,
            Self::InvalidUrl(_) | Self::Decode(_) => false,
        }
    }
}

/// Result of a transport call.
pub type Result<T> = std::result::Result<T, TransportError>;

/// The only capability the pipeline needs from HTTP: a GET returning JSON.
#[automock]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a GET request to `url` with `params` as the query string and
    /// decodes the body as JSON.
    async fn get_json(&self, url: &str, params: &[(String, String)]) -> Result<Value>;
}

/// Resolves a VK API method name against the configured API base URL.
pub fn method_url(api_url: &str, method: &str) -> Result<String> {
    Ok(Url::parse(api_url)?.join(method)?.to_string())
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Builds the HTTP client. `timeout` bounds every request and should
    /// exceed the long-poll hold time.
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("vk-longpoll-bot"));

        let client = Client::builder().default_headers(headers).timeout(timeout).build()?;
        tracing::debug!("HTTP client built successfully.");

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_json(&self, url: &str, params: &[(String, String)]) -> Result<Value> {
        let url = Url::parse(url)?;
        let resp = self.client.get(url).query(params).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status()));
        }
        let body = resp.json::<Value>().await?;
        Ok(body)
    }
}
