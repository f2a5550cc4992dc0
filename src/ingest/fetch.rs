//! HTTP retrieval with conditional GET.

use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{Client, StatusCode};

use crate::ingest::types::{FetchError, FetchRequest, FetchResponse, FetchedDocument, Fetcher};

const USER_AGENT: &str = concat!("feed-poller/", env!("CARGO_PKG_VERSION"));

/// `reqwest`-backed [`Fetcher`].
///
/// The overall per-poll deadline is enforced by the poll task; the client
/// itself only bounds connection setup.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { client })
    }
}

/// Request headers for one poll: always bypass intermediate caches, and send
/// whichever validators the source handed out last time.
pub fn request_headers(req: &FetchRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Some(v) = req.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
        headers.insert(IF_NONE_MATCH, v);
    }
    if let Some(v) = req
        .last_modified
        .as_deref()
        .and_then(|lm| HeaderValue::from_str(lm).ok())
    {
        headers.insert(IF_MODIFIED_SINCE, v);
    }
    headers
}

/// Rough wire size of a header block (`name: value\r\n` per line).
pub fn header_block_size(headers: &HeaderMap) -> u32 {
    let total: usize = headers
        .iter()
        .map(|(k, v)| k.as_str().len() + v.as_bytes().len() + 4)
        .sum();
    u32::try_from(total).unwrap_or(u32::MAX)
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn classify_send_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Connect(e.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let t0 = std::time::Instant::now();
        let response = self
            .client
            .get(&req.url)
            .headers(request_headers(req))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let header_size = header_block_size(response.headers());
        histogram!("feed_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        if status == StatusCode::NOT_MODIFIED {
            counter!("feed_fetch_not_modified_total").increment(1);
            return Ok(FetchResponse::NotModified { header_size });
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED);
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Body(e.to_string())
            }
        })?;

        Ok(FetchResponse::Content(FetchedDocument {
            bytes: bytes.to_vec(),
            etag,
            last_modified,
            header_size,
        }))
    }
}
