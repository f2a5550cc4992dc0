// tests/common/mod.rs
// Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use feed_poller::ingest::types::{
    FeedItem, FeedParser, FetchError, FetchRequest, FetchResponse, FetchedDocument, Fetcher,
    ParseError, ParsedFeed,
};
use feed_poller::poll::{PollContext, PollSettings};
use feed_poller::store::{InMemoryStore, Store, StoreError, StoreResult};
use feed_poller::source::{SourceDefaults, SourceRecord};
use chrono::{DateTime, Utc};
use feed_poller::strategy::{AdaptiveStrategy, AdaptiveTuning, IntervalBounds, UpdateStrategy};

pub fn item(title: &str) -> FeedItem {
    FeedItem {
        title: title.to_string(),
        link: format!("http://example.org/{title}"),
        raw_id: title.to_string(),
        published: None,
        author: None,
        description: None,
        text: None,
    }
}

/// Body understood by [`TitlesParser`].
pub fn titles_body(titles: &[String]) -> Result<FetchResponse, FetchError> {
    Ok(FetchResponse::Content(FetchedDocument {
        bytes: titles.join("\n").into_bytes(),
        etag: None,
        last_modified: None,
        header_size: 64,
    }))
}

pub fn titles(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("{prefix}{i}")).collect()
}

/// One line per item title.
pub struct TitlesParser;

impl FeedParser for TitlesParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
        let s = std::str::from_utf8(bytes).map_err(|e| ParseError::Xml(e.to_string()))?;
        Ok(ParsedFeed {
            title: None,
            items: s.lines().filter(|l| !l.is_empty()).map(item).collect(),
        })
    }
}

/// Hands out queued responses in order; repeats the last one when exhausted.
pub struct ScriptedFetcher {
    script: Mutex<Vec<Result<FetchResponse, FetchError>>>,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<Result<FetchResponse, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, _req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut s = self.script.lock();
        if s.len() > 1 {
            s.remove(0)
        } else {
            s.first().cloned().unwrap_or(Err(FetchError::Timeout))
        }
    }
}

/// Records how many fetches run at once, overall and per URL.
#[derive(Default)]
pub struct ConcurrencyProbe {
    state: Mutex<ProbeState>,
    pub delay: Duration,
}

#[derive(Default)]
struct ProbeState {
    active: usize,
    max_active: usize,
    per_url: HashMap<String, usize>,
    max_per_url: usize,
    calls: usize,
}

impl ConcurrencyProbe {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Mutex::new(ProbeState::default()),
            delay,
        }
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().max_active
    }

    pub fn max_per_url(&self) -> usize {
        self.state.lock().max_per_url
    }

    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }
}

#[async_trait]
impl Fetcher for ConcurrencyProbe {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        {
            let mut s = self.state.lock();
            s.calls += 1;
            s.active += 1;
            s.max_active = s.max_active.max(s.active);
            let n = {
                let n = s.per_url.entry(req.url.clone()).or_insert(0);
                *n += 1;
                *n
            };
            s.max_per_url = s.max_per_url.max(n);
        }
        tokio::time::sleep(self.delay).await;
        {
            let mut s = self.state.lock();
            s.active -= 1;
            if let Some(n) = s.per_url.get_mut(&req.url) {
                *n -= 1;
            }
        }
        titles_body(&["a".to_string(), "b".to_string()])
    }
}

/// Fetcher whose task dies mid-poll.
pub struct PanickingFetcher;

#[async_trait]
impl Fetcher for PanickingFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        panic!("fetcher blew up on {}", req.url);
    }
}

/// Store whose backend is gone: every call fails.
pub struct BrokenStore;

fn gone<T>() -> StoreResult<T> {
    Err(StoreError::Backend("database is locked".into()))
}

#[async_trait]
impl Store for BrokenStore {
    async fn add_source(&self, _url: &str, _d: SourceDefaults) -> StoreResult<SourceRecord> {
        gone()
    }
    async fn upsert_source(&self, _r: &SourceRecord) -> StoreResult<()> {
        gone()
    }
    async fn insert_items_if_absent(&self, _id: i64, _items: &[FeedItem]) -> StoreResult<usize> {
        gone()
    }
    async fn commit_poll(&self, _r: &SourceRecord, _items: &[FeedItem]) -> StoreResult<usize> {
        gone()
    }
    async fn get_sources_due_for_poll(&self, _now: DateTime<Utc>) -> StoreResult<Vec<SourceRecord>> {
        gone()
    }
    async fn all_sources(&self) -> StoreResult<Vec<SourceRecord>> {
        gone()
    }
    async fn get_source(&self, id: i64) -> StoreResult<SourceRecord> {
        Err(StoreError::NotFound(id))
    }
    async fn item_count(&self, _id: i64) -> StoreResult<usize> {
        gone()
    }
}

pub fn adaptive() -> Arc<dyn UpdateStrategy> {
    Arc::new(AdaptiveStrategy::new(
        AdaptiveTuning::default(),
        IntervalBounds::new(1, 1440),
    ))
}

pub fn context(fetcher: Arc<dyn Fetcher>, store: Arc<dyn Store>) -> Arc<PollContext> {
    Arc::new(PollContext {
        fetcher,
        parser: Arc::new(TitlesParser),
        store,
        strategy: adaptive(),
        settings: PollSettings::default(),
    })
}

pub fn memory_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}
