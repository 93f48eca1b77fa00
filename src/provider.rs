use std::time::Duration;

use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::types::{Cursor, Item, Page};

/// Failure while fetching one page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned HTTP {0}")]
    HttpStatus(u16),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("could not decode page: {0}")]
    Decode(String),
}

/// Anything that can return one page of a collection at a cursor.
///
/// `T` is the record type pages decode into: typed [`Item`]s for the
/// census, raw JSON values for exports.
#[async_trait::async_trait]
pub trait PageSource<T = Item>: Send + Sync {
    async fn fetch_page(&self, cursor: &Cursor, limit: usize) -> Result<Page<T>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub token: String,
    pub resource: String,
    /// Query parameter carrying an opaque cursor token.
    pub cursor_param: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientSettings {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            resource: "devices".to_string(),
            cursor_param: "offset".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// `PageSource` over the Fusion-style REST API:
/// `GET {base}/{resource}?limit=N&offset=O` with a bearer token.
#[derive(Debug, Clone)]
pub struct FusionClient {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
    cursor_param: String,
}

impl FusionClient {
    pub fn new(settings: ClientSettings) -> Result<Self, FetchError> {
        let base = settings.base_url.trim_end_matches('/');
        let resource = settings.resource.trim_matches('/');
        let endpoint = Url::parse(&format!("{base}/{resource}"))
            .map_err(|err| FetchError::Network(format!("invalid endpoint: {err}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            token: settings.token,
            cursor_param: settings.cursor_param,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn page_url(&self, cursor: &Cursor, limit: usize) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("limit", &limit.to_string());
            match cursor {
                Cursor::Offset(o) => q.append_pair("offset", &o.to_string()),
                Cursor::Token(t) => q.append_pair(&self.cursor_param, t),
            };
        }
        url
    }

    async fn fetch_json(&self, cursor: &Cursor, limit: usize) -> Result<Value, FetchError> {
        let url = self.page_url(cursor, limit);
        debug!(%cursor, limit, "fetching page");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        serde_json::from_slice(&body).map_err(decode_error)
    }
}

#[async_trait::async_trait]
impl PageSource for FusionClient {
    async fn fetch_page(&self, cursor: &Cursor, limit: usize) -> Result<Page, FetchError> {
        item_page(self.fetch_json(cursor, limit).await?)
    }
}

#[async_trait::async_trait]
impl PageSource<Value> for FusionClient {
    async fn fetch_page(&self, cursor: &Cursor, limit: usize) -> Result<Page<Value>, FetchError> {
        record_page(self.fetch_json(cursor, limit).await?)
    }
}

/// A device listing must come in a `data` envelope; anything else is a fault,
/// not an empty collection.
fn item_page(body: Value) -> Result<Page, FetchError> {
    if body.get("data").is_none() {
        return Err(FetchError::Decode("response has no `data` array".to_string()));
    }
    serde_json::from_value(body).map_err(decode_error)
}

/// Single-object resources (`/system-health`) answer without an envelope;
/// such a body is one record.
fn record_page(body: Value) -> Result<Page<Value>, FetchError> {
    if body.get("data").is_none() {
        return Ok(Page::bare(body));
    }
    serde_json::from_value(body).map_err(decode_error)
}

fn decode_error(err: serde_json::Error) -> FetchError {
    FetchError::Decode(err.to_string())
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout(err.to_string());
    }
    if err.is_decode() {
        return FetchError::Decode(err.to_string());
    }
    FetchError::Network(err.to_string())
}
