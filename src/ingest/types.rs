// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of a feed window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    /// guid/id from the feed, or a digest of title + link when absent.
    pub raw_id: String,
    pub published: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub text: Option<String>,
}

impl FeedItem {
    /// Identity used for "new vs. already seen": title + link, case-insensitive.
    pub fn identity(&self) -> String {
        format!("{}{}", self.title, self.link).to_lowercase()
    }
}

/// Result of parsing one feed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub items: Vec<FeedItem>,
}

/// Conditional-GET aware request for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub bytes: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub header_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResponse {
    /// 304: nothing changed since the validators were issued.
    NotModified { header_size: u32 },
    Content(FetchedDocument),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("reading body failed: {0}")]
    Body(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed feed xml: {0}")]
    Xml(String),
    #[error("document is neither RSS nor Atom")]
    UnknownFormat,
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

pub trait FeedParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedFeed, ParseError>;
}
