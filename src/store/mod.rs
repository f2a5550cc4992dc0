//! # Store
//! Persistence boundary of the poller: source records plus the items seen so far.
//!
//! Item insertion is idempotent on `(source_id, raw_id)`. [`Store::commit_poll`]
//! writes a record together with its new items as one unit.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ingest::types::FeedItem;
use crate::source::{SourceDefaults, SourceRecord};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend failed: {0}")]
    Backend(String),
    #[error("unknown source id {0}")]
    NotFound(i64),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Register a feed URL; returns the existing record when already known.
    async fn add_source(&self, feed_url: &str, defaults: SourceDefaults) -> StoreResult<SourceRecord>;

    async fn upsert_source(&self, record: &SourceRecord) -> StoreResult<()>;

    /// Returns how many of `items` were not stored before.
    async fn insert_items_if_absent(&self, source_id: i64, items: &[FeedItem]) -> StoreResult<usize>;

    /// Record update and item inserts of one poll, atomically.
    async fn commit_poll(&self, record: &SourceRecord, items: &[FeedItem]) -> StoreResult<usize>;

    async fn get_sources_due_for_poll(&self, now: DateTime<Utc>) -> StoreResult<Vec<SourceRecord>>;

    async fn all_sources(&self) -> StoreResult<Vec<SourceRecord>>;

    async fn get_source(&self, id: i64) -> StoreResult<SourceRecord>;

    async fn item_count(&self, source_id: i64) -> StoreResult<usize>;
}

/// A record is due when it was never polled or its interval has elapsed.
pub fn is_due(record: &SourceRecord, now: DateTime<Utc>) -> bool {
    record.next_due(now) <= now
}
