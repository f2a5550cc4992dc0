use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::ingest::types::FeedItem;
use crate::source::{SourceDefaults, SourceRecord};
use crate::store::{is_due, Store, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    next_id: i64,
    sources: BTreeMap<i64, SourceRecord>,
    by_url: HashMap<String, i64>,
    items: HashMap<i64, HashSet<String>>,
}

impl Inner {
    fn insert_items(&mut self, source_id: i64, items: &[FeedItem]) -> usize {
        let seen = self.items.entry(source_id).or_default();
        items
            .iter()
            .filter(|it| seen.insert(it.raw_id.clone()))
            .count()
    }
}

/// Process-local store for tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn add_source(&self, feed_url: &str, defaults: SourceDefaults) -> StoreResult<SourceRecord> {
        let url = feed_url.trim();
        let mut g = self.inner.lock();
        if let Some(id) = g.by_url.get(url).copied() {
            return g.sources.get(&id).cloned().ok_or(StoreError::NotFound(id));
        }
        g.next_id += 1;
        let record = SourceRecord::new(g.next_id, url, defaults);
        g.by_url.insert(url.to_string(), record.id);
        g.sources.insert(record.id, record.clone());
        Ok(record)
    }

    async fn upsert_source(&self, record: &SourceRecord) -> StoreResult<()> {
        let mut g = self.inner.lock();
        g.next_id = g.next_id.max(record.id);
        g.by_url.insert(record.feed_url.clone(), record.id);
        g.sources.insert(record.id, record.clone());
        Ok(())
    }

    async fn insert_items_if_absent(&self, source_id: i64, items: &[FeedItem]) -> StoreResult<usize> {
        Ok(self.inner.lock().insert_items(source_id, items))
    }

    async fn commit_poll(&self, record: &SourceRecord, items: &[FeedItem]) -> StoreResult<usize> {
        // One lock for both writes.
        let mut g = self.inner.lock();
        g.next_id = g.next_id.max(record.id);
        g.by_url.insert(record.feed_url.clone(), record.id);
        g.sources.insert(record.id, record.clone());
        Ok(g.insert_items(record.id, items))
    }

    async fn get_sources_due_for_poll(&self, now: DateTime<Utc>) -> StoreResult<Vec<SourceRecord>> {
        let g = self.inner.lock();
        Ok(g.sources.values().filter(|r| is_due(r, now)).cloned().collect())
    }

    async fn all_sources(&self) -> StoreResult<Vec<SourceRecord>> {
        Ok(self.inner.lock().sources.values().cloned().collect())
    }

    async fn get_source(&self, id: i64) -> StoreResult<SourceRecord> {
        self.inner
            .lock()
            .sources
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn item_count(&self, source_id: i64) -> StoreResult<usize> {
        Ok(self
            .inner
            .lock()
            .items
            .get(&source_id)
            .map_or(0, HashSet::len))
    }
}
