//! SQLite-backed [`Store`].
//!
//! Timestamps are stored as unix milliseconds. Small collections of a record
//! (remembered headlines, publish history, conditional-GET validators) are
//! JSON columns; the post distribution has its own table with one row per
//! minute that has been observed at least once.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::ingest::types::FeedItem;
use crate::post_distribution::{Bucket, PostDistribution};
use crate::source::{ActivityPattern, SourceDefaults, SourceRecord, SourceStatus, UpdateMode};
use crate::store::{Store, StoreError, StoreResult};

const SOURCE_COLUMNS: &str = "id, feed_url, site_url, title, status, update_interval_minutes,
    update_mode, last_poll_time, last_successful_check_time, checks, unreachable_count,
    unparsable_count, misses, total_processing_ms, last_headlines, window_size, byte_size,
    last_item_timestamp, items_seen_total, publish_history, activity_pattern, classified_at,
    observed_until, timestamped_polls, on_the_fly_polls, conditional";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
}

fn status_str(s: SourceStatus) -> &'static str {
    match s {
        SourceStatus::New => "new",
        SourceStatus::Active => "active",
    }
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(v: &T) -> StoreResult<String> {
    serde_json::to_string(v).map_err(backend)
}

impl SqliteStore {
    /// Open (and create if needed) the database file.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_url TEXT NOT NULL UNIQUE,
                site_url TEXT,
                title TEXT,
                status TEXT NOT NULL DEFAULT 'new',
                update_interval_minutes INTEGER NOT NULL,
                update_mode TEXT NOT NULL,
                last_poll_time INTEGER,
                last_successful_check_time INTEGER,
                checks INTEGER NOT NULL DEFAULT 0,
                unreachable_count INTEGER NOT NULL DEFAULT 0,
                unparsable_count INTEGER NOT NULL DEFAULT 0,
                misses INTEGER NOT NULL DEFAULT 0,
                total_processing_ms INTEGER NOT NULL DEFAULT 0,
                last_headlines TEXT NOT NULL DEFAULT '[]',
                window_size INTEGER NOT NULL DEFAULT 0,
                byte_size INTEGER NOT NULL DEFAULT 0,
                last_item_timestamp INTEGER,
                items_seen_total INTEGER NOT NULL DEFAULT 0,
                publish_history TEXT NOT NULL DEFAULT '[]',
                activity_pattern TEXT NOT NULL DEFAULT 'UNKNOWN',
                classified_at INTEGER,
                observed_until INTEGER,
                timestamped_polls INTEGER NOT NULL DEFAULT 0,
                on_the_fly_polls INTEGER NOT NULL DEFAULT 0,
                conditional TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS source_post_distribution (
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                minute_of_day INTEGER NOT NULL,
                posts INTEGER NOT NULL,
                chances INTEGER NOT NULL,
                PRIMARY KEY (source_id, minute_of_day)
            );

            CREATE TABLE IF NOT EXISTS items (
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                raw_id TEXT NOT NULL,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                published INTEGER,
                author TEXT,
                description TEXT,
                PRIMARY KEY (source_id, raw_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sources_last_poll ON sources(last_poll_time);
        "#,
        )
        .map_err(backend)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(SourceRecord, Option<i64>)> {
        let id: i64 = row.get(0)?;
        let feed_url: String = row.get(1)?;
        let mode: String = row.get(6)?;
        let mut r = SourceRecord::new(
            id,
            feed_url,
            SourceDefaults {
                interval_minutes: row.get::<_, i64>(5)?.max(1) as u32,
                update_mode: UpdateMode::parse(&mode).unwrap_or_default(),
            },
        );
        r.site_url = row.get(2)?;
        r.title = row.get(3)?;
        r.status = match row.get::<_, String>(4)?.as_str() {
            "active" => SourceStatus::Active,
            _ => SourceStatus::New,
        };
        r.last_poll_time = from_millis(row.get(7)?);
        r.last_successful_check_time = from_millis(row.get(8)?);
        r.checks = row.get::<_, i64>(9)? as u64;
        r.unreachable_count = row.get::<_, i64>(10)? as u64;
        r.unparsable_count = row.get::<_, i64>(11)? as u64;
        r.misses = row.get::<_, i64>(12)? as u64;
        r.total_processing_ms = row.get::<_, i64>(13)? as u64;
        r.last_headlines = json_col(row, 14)?;
        r.window_size = row.get::<_, i64>(15)? as usize;
        r.byte_size = row.get::<_, i64>(16)? as u64;
        r.last_item_timestamp = from_millis(row.get(17)?);
        r.items_seen_total = row.get::<_, i64>(18)? as u64;
        r.publish_history = json_col(row, 19)?;
        r.activity_pattern =
            ActivityPattern::parse(&row.get::<_, String>(20)?).unwrap_or_default();
        r.classified_at = from_millis(row.get(21)?);
        let observed_until: Option<i64> = row.get(22)?;
        r.timestamped_polls = row.get::<_, i64>(23)? as u64;
        r.on_the_fly_polls = row.get::<_, i64>(24)? as u64;
        r.conditional = json_col(row, 25)?;
        Ok((r, observed_until))
    }

    fn load_distribution(
        conn: &Connection,
        source_id: i64,
        observed_until: Option<i64>,
    ) -> StoreResult<PostDistribution> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT minute_of_day, posts, chances FROM source_post_distribution
                 WHERE source_id = ?1",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![source_id], |row| {
                Ok((
                    row.get::<_, i64>(0)? as usize,
                    Bucket {
                        posts: row.get::<_, i64>(1)? as u32,
                        chances: row.get::<_, i64>(2)? as u32,
                    },
                ))
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        Ok(PostDistribution::from_parts(rows, observed_until))
    }

    fn query_records(
        conn: &Connection,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Vec<SourceRecord>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources {where_clause} ORDER BY id");
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let partial = stmt
            .query_map(args, Self::row_to_record)
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;

        partial
            .into_iter()
            .map(|(mut r, observed_until)| {
                r.post_distribution = Self::load_distribution(conn, r.id, observed_until)?;
                Ok(r)
            })
            .collect()
    }

    fn write_source(conn: &Connection, r: &SourceRecord) -> StoreResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO sources ({SOURCE_COLUMNS}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                  ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
                 ON CONFLICT(id) DO UPDATE SET
                    feed_url = excluded.feed_url,
                    site_url = excluded.site_url,
                    title = excluded.title,
                    status = excluded.status,
                    update_interval_minutes = excluded.update_interval_minutes,
                    update_mode = excluded.update_mode,
                    last_poll_time = excluded.last_poll_time,
                    last_successful_check_time = excluded.last_successful_check_time,
                    checks = excluded.checks,
                    unreachable_count = excluded.unreachable_count,
                    unparsable_count = excluded.unparsable_count,
                    misses = excluded.misses,
                    total_processing_ms = excluded.total_processing_ms,
                    last_headlines = excluded.last_headlines,
                    window_size = excluded.window_size,
                    byte_size = excluded.byte_size,
                    last_item_timestamp = excluded.last_item_timestamp,
                    items_seen_total = excluded.items_seen_total,
                    publish_history = excluded.publish_history,
                    activity_pattern = excluded.activity_pattern,
                    classified_at = excluded.classified_at,
                    observed_until = excluded.observed_until,
                    timestamped_polls = excluded.timestamped_polls,
                    on_the_fly_polls = excluded.on_the_fly_polls,
                    conditional = excluded.conditional"
            ),
            params![
                r.id,
                r.feed_url,
                r.site_url,
                r.title,
                status_str(r.status),
                i64::from(r.update_interval_minutes),
                r.update_mode.as_str(),
                to_millis(r.last_poll_time),
                to_millis(r.last_successful_check_time),
                r.checks as i64,
                r.unreachable_count as i64,
                r.unparsable_count as i64,
                r.misses as i64,
                r.total_processing_ms as i64,
                to_json(&r.last_headlines)?,
                r.window_size as i64,
                r.byte_size as i64,
                to_millis(r.last_item_timestamp),
                r.items_seen_total as i64,
                to_json(&r.publish_history)?,
                r.activity_pattern.as_str(),
                to_millis(r.classified_at),
                r.post_distribution.observed_until(),
                r.timestamped_polls as i64,
                r.on_the_fly_polls as i64,
                to_json(&r.conditional)?,
            ],
        )
        .map_err(backend)?;

        conn.execute(
            "DELETE FROM source_post_distribution WHERE source_id = ?1",
            params![r.id],
        )
        .map_err(backend)?;
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO source_post_distribution (source_id, minute_of_day, posts, chances)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(backend)?;
        for (minute, b) in r.post_distribution.buckets().iter().enumerate() {
            if b.chances > 0 {
                stmt.execute(params![
                    r.id,
                    minute as i64,
                    i64::from(b.posts),
                    i64::from(b.chances)
                ])
                .map_err(backend)?;
            }
        }
        Ok(())
    }

    fn insert_items(conn: &Connection, source_id: i64, items: &[FeedItem]) -> StoreResult<usize> {
        let mut stmt = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO items
                    (source_id, raw_id, title, link, published, author, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(backend)?;
        let mut inserted = 0;
        for it in items {
            inserted += stmt
                .execute(params![
                    source_id,
                    it.raw_id,
                    it.title,
                    it.link,
                    to_millis(it.published),
                    it.author,
                    it.description,
                ])
                .map_err(backend)?;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn add_source(&self, feed_url: &str, defaults: SourceDefaults) -> StoreResult<SourceRecord> {
        let url = feed_url.trim();
        let mut conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM sources WHERE feed_url = ?1",
                params![url],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        if let Some(id) = existing {
            return Self::query_records(&conn, "WHERE id = ?1", params![id])?
                .pop()
                .ok_or(StoreError::NotFound(id));
        }

        let tx = conn.transaction().map_err(backend)?;
        tx.execute(
            "INSERT INTO sources (feed_url, update_interval_minutes, update_mode) VALUES (?1, ?2, ?3)",
            params![url, i64::from(defaults.interval_minutes), defaults.update_mode.as_str()],
        )
        .map_err(backend)?;
        let record = SourceRecord::new(tx.last_insert_rowid(), url, defaults);
        Self::write_source(&tx, &record)?;
        tx.commit().map_err(backend)?;
        Ok(record)
    }

    async fn upsert_source(&self, record: &SourceRecord) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        Self::write_source(&tx, record)?;
        tx.commit().map_err(backend)
    }

    async fn insert_items_if_absent(&self, source_id: i64, items: &[FeedItem]) -> StoreResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let n = Self::insert_items(&tx, source_id, items)?;
        tx.commit().map_err(backend)?;
        Ok(n)
    }

    async fn commit_poll(&self, record: &SourceRecord, items: &[FeedItem]) -> StoreResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        Self::write_source(&tx, record)?;
        let n = Self::insert_items(&tx, record.id, items)?;
        tx.commit().map_err(backend)?;
        Ok(n)
    }

    async fn get_sources_due_for_poll(&self, now: DateTime<Utc>) -> StoreResult<Vec<SourceRecord>> {
        let conn = self.conn.lock();
        let now_ms = now.timestamp_millis();
        Self::query_records(
            &conn,
            "WHERE last_poll_time IS NULL
                OR last_poll_time + update_interval_minutes * 60000 <= ?1",
            params![now_ms],
        )
    }

    async fn all_sources(&self) -> StoreResult<Vec<SourceRecord>> {
        let conn = self.conn.lock();
        Self::query_records(&conn, "", params![])
    }

    async fn get_source(&self, id: i64) -> StoreResult<SourceRecord> {
        let conn = self.conn.lock();
        Self::query_records(&conn, "WHERE id = ?1", params![id])?
            .pop()
            .ok_or(StoreError::NotFound(id))
    }

    async fn item_count(&self, source_id: i64) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items WHERE source_id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(n as usize)
    }
}
