//! # Source Record
//! Persistent state of one monitored feed plus the small value types it is
//! built from (update mode, activity pattern, remembered headlines).
//!
//! A record is mutated only by the Poll Task that currently owns it; the
//! scheduler and the store hold it the rest of the time.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::post_distribution::PostDistribution;
use crate::strategy::FreshnessSample;

/// Which side of the latency/requests trade-off a source is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Detect new items as early as possible.
    #[default]
    MinDelay,
    /// Issue as few requests as possible without provably missing items.
    MaxCoverage,
}

impl UpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::MinDelay => "min_delay",
            UpdateMode::MaxCoverage => "max_coverage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min_delay" | "mindelay" => Some(UpdateMode::MinDelay),
            "max_coverage" | "maxcoverage" => Some(UpdateMode::MaxCoverage),
            _ => None,
        }
    }
}

/// Coarse temporal publication behavior of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityPattern {
    #[default]
    Unknown,
    Constant,
    Chunked,
    Sliced,
    Zombie,
    OnTheFly,
    Empty,
}

impl ActivityPattern {
    pub const ALL: [ActivityPattern; 7] = [
        ActivityPattern::Unknown,
        ActivityPattern::Constant,
        ActivityPattern::Chunked,
        ActivityPattern::Sliced,
        ActivityPattern::Zombie,
        ActivityPattern::OnTheFly,
        ActivityPattern::Empty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityPattern::Unknown => "UNKNOWN",
            ActivityPattern::Constant => "CONSTANT",
            ActivityPattern::Chunked => "CHUNKED",
            ActivityPattern::Sliced => "SLICED",
            ActivityPattern::Zombie => "ZOMBIE",
            ActivityPattern::OnTheFly => "ON_THE_FLY",
            ActivityPattern::Empty => "EMPTY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|p| p.as_str() == wanted)
    }
}

/// Operational status, orthogonal to the activity pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    New,
    Active,
}

/// Conditional-GET state remembered between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalGet {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// `None` until the source has answered at least once.
    pub etag_support: Option<bool>,
    pub lms_support: Option<bool>,
    /// Header size of a 304 answer; used to estimate saved bandwidth.
    pub cg_header_size: Option<u32>,
}

impl ConditionalGet {
    /// Remember validators from a full (2xx) response.
    pub fn remember(&mut self, etag: Option<String>, last_modified: Option<String>) {
        self.etag_support = Some(etag.is_some());
        self.lms_support = Some(last_modified.is_some());
        self.etag = etag;
        self.last_modified = last_modified;
    }

    pub fn is_supported(&self) -> bool {
        self.etag_support == Some(true) || self.lms_support == Some(true)
    }
}

/// Deduplicating, order-preserving set of item identities seen at the last
/// poll. Identities are compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Headlines {
    order: Vec<String>,
    index: HashSet<String>,
}

impl Headlines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from identities, keeping the first occurrence and at most `cap` entries.
    pub fn from_identities<I, S>(identities: I, cap: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Self::new();
        for id in identities {
            if out.order.len() >= cap {
                break;
            }
            out.insert(id.as_ref());
        }
        out
    }

    fn insert(&mut self, identity: &str) -> bool {
        let key = identity.to_lowercase();
        if self.index.insert(key.clone()) {
            self.order.push(key);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains(&identity.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for Headlines {
    fn from(v: Vec<String>) -> Self {
        let cap = v.len();
        Headlines::from_identities(v, cap)
    }
}

impl From<Headlines> for Vec<String> {
    fn from(h: Headlines) -> Self {
        h.order
    }
}

/// Values applied to a freshly registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceDefaults {
    pub interval_minutes: u32,
    pub update_mode: UpdateMode,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            update_mode: UpdateMode::MinDelay,
        }
    }
}

/// Persistent state of one monitored feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: i64,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub title: Option<String>,
    pub status: SourceStatus,

    // --- polling state ---
    pub update_interval_minutes: u32,
    pub update_mode: UpdateMode,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub last_successful_check_time: Option<DateTime<Utc>>,
    pub checks: u64,
    pub unreachable_count: u64,
    pub unparsable_count: u64,
    /// Polls where every visible item was new, i.e. items may have scrolled out unseen.
    pub misses: u64,
    pub total_processing_ms: u64,

    // --- freshness bookkeeping ---
    pub last_headlines: Headlines,
    #[serde(skip)]
    cached_freshness: Option<FreshnessSample>,

    // --- item window stats ---
    pub window_size: usize,
    pub byte_size: u64,
    pub last_item_timestamp: Option<DateTime<Utc>>,
    pub items_seen_total: u64,
    /// Sorted, distinct unix seconds of the most recent publish timestamps.
    pub publish_history: Vec<i64>,

    // --- classification state ---
    pub activity_pattern: ActivityPattern,
    pub classified_at: Option<DateTime<Utc>>,
    pub post_distribution: PostDistribution,
    pub timestamped_polls: u64,
    pub on_the_fly_polls: u64,

    pub conditional: ConditionalGet,
}

impl SourceRecord {
    pub fn new(id: i64, feed_url: impl Into<String>, defaults: SourceDefaults) -> Self {
        let feed_url = feed_url.into();
        let site_url = site_url_of(&feed_url);
        Self {
            id,
            feed_url,
            site_url,
            title: None,
            status: SourceStatus::New,
            update_interval_minutes: defaults.interval_minutes.max(1),
            update_mode: defaults.update_mode,
            last_poll_time: None,
            last_successful_check_time: None,
            checks: 0,
            unreachable_count: 0,
            unparsable_count: 0,
            misses: 0,
            total_processing_ms: 0,
            last_headlines: Headlines::new(),
            cached_freshness: None,
            window_size: 0,
            byte_size: 0,
            last_item_timestamp: None,
            items_seen_total: 0,
            publish_history: Vec::new(),
            activity_pattern: ActivityPattern::Unknown,
            classified_at: None,
            post_distribution: PostDistribution::new(),
            timestamped_polls: 0,
            on_the_fly_polls: 0,
            conditional: ConditionalGet::default(),
        }
    }

    /// Mark the start of a new poll: the cached freshness belongs to the previous one.
    pub fn begin_poll(&mut self, now: DateTime<Utc>) {
        self.cached_freshness = None;
        self.last_poll_time = Some(now);
        self.status = SourceStatus::Active;
    }

    pub fn cached_freshness(&self) -> Option<FreshnessSample> {
        self.cached_freshness
    }

    pub fn cache_freshness(&mut self, sample: FreshnessSample) {
        self.cached_freshness = Some(sample);
    }

    pub fn one_full_day_observed(&self) -> bool {
        self.post_distribution.one_full_day_observed()
    }

    /// Classification is stale when it never produced a label or is older than `max_age`.
    pub fn classification_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match (self.activity_pattern, self.classified_at) {
            (ActivityPattern::Unknown, _) | (_, None) => true,
            (_, Some(at)) => now - at >= max_age,
        }
    }

    /// Merge publish timestamps into the bounded, sorted history.
    pub fn remember_publish_times<I>(&mut self, times: I, cap: usize)
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        self.publish_history
            .extend(times.into_iter().map(|t| t.timestamp()));
        self.publish_history.sort_unstable();
        self.publish_history.dedup();
        if self.publish_history.len() > cap {
            let excess = self.publish_history.len() - cap;
            self.publish_history.drain(0..excess);
        }
    }

    /// Time at which the scheduler should poll this source next.
    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_poll_time {
            Some(last) => last + interval_duration(self.update_interval_minutes),
            None => now,
        }
    }
}

pub fn interval_duration(minutes: u32) -> chrono::Duration {
    chrono::Duration::minutes(i64::from(minutes))
}

/// `scheme://host[:port]` of a feed URL.
pub fn site_url_of(feed_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(feed_url).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
