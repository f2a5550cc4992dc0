//! # Poll Task
//! One fetch-and-process cycle for one source.
//!
//! The task owns its [`SourceRecord`] for the whole cycle and hands it back
//! in the [`PollCompletion`]. Every failure ends as a [`PollOutcome`]; nothing
//! propagates to the scheduler.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classifier::{classify, ClassifierInput, ClassifierThresholds};
use crate::ingest::types::{
    FeedItem, FeedParser, FetchError, FetchRequest, FetchResponse, FetchedDocument, Fetcher,
    ParsedFeed,
};
use crate::source::{ActivityPattern, Headlines, SourceRecord};
use crate::store::Store;
use crate::strategy::{freshness_ratio, AdaptationInput, FreshnessSample, UpdateStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollOutcome {
    Success,
    Miss,
    Unreachable,
    Unparsable,
    ExecutionTimeWarning,
    Error,
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollOutcome::Success => "SUCCESS",
            PollOutcome::Miss => "MISS",
            PollOutcome::Unreachable => "UNREACHABLE",
            PollOutcome::Unparsable => "UNPARSABLE",
            PollOutcome::ExecutionTimeWarning => "EXECUTION_TIME_WARNING",
            PollOutcome::Error => "ERROR",
        }
    }
}

/// What a finished poll tells the scheduler and telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReport {
    pub source_id: i64,
    pub feed_url: String,
    pub outcome: PollOutcome,
    pub freshness: Option<FreshnessSample>,
    pub new_items: usize,
    /// Items the store had not seen before.
    pub inserted: usize,
    pub interval_minutes: u32,
    pub pattern: ActivityPattern,
    pub pattern_changed: bool,
    pub execution_warning: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PollCompletion {
    pub record: SourceRecord,
    pub report: PollReport,
}

/// Knobs of the poll cycle.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub execution_warn: Duration,
    /// Deadline for the fetch step; `None` waits indefinitely.
    pub fetch_timeout: Option<Duration>,
    pub reclassify_after: chrono::Duration,
    pub headline_capacity: usize,
    pub timestamp_history: usize,
    pub classifier: ClassifierThresholds,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            execution_warn: Duration::from_secs(180),
            fetch_timeout: Some(Duration::from_secs(60)),
            reclassify_after: chrono::Duration::days(30),
            headline_capacity: 500,
            timestamp_history: 250,
            classifier: ClassifierThresholds::default(),
        }
    }
}

/// Collaborators shared by every poll.
pub struct PollContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub parser: Arc<dyn FeedParser>,
    pub store: Arc<dyn Store>,
    pub strategy: Arc<dyn UpdateStrategy>,
    pub settings: PollSettings,
}

/// What processing a fetched document produced, before persistence.
struct Processed {
    outcome: PollOutcome,
    freshness: Option<FreshnessSample>,
    new_items: Vec<FeedItem>,
    pattern_changed: bool,
}

impl Processed {
    fn failed(outcome: PollOutcome) -> Self {
        Self {
            outcome,
            freshness: None,
            new_items: Vec::new(),
            pattern_changed: false,
        }
    }
}

pub struct PollTask {
    ctx: Arc<PollContext>,
    record: SourceRecord,
}

impl PollTask {
    pub fn new(ctx: Arc<PollContext>, record: SourceRecord) -> Self {
        Self { ctx, record }
    }

    pub async fn run(self) -> PollCompletion {
        self.run_at(Utc::now()).await
    }

    /// Run the cycle with `now` as the poll time.
    pub async fn run_at(self, now: DateTime<Utc>) -> PollCompletion {
        let started = Instant::now();
        let PollTask { ctx, mut record } = self;
        let misses_before = record.misses;
        record.begin_poll(now);

        tracing::debug!(source_id = record.id, url = %record.feed_url, "poll start");

        // 1) Fetch, bounded by the optional deadline
        let request = FetchRequest {
            url: record.feed_url.clone(),
            etag: record.conditional.etag.clone(),
            last_modified: record.conditional.last_modified.clone(),
        };
        let fetched = match ctx.settings.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, ctx.fetcher.fetch(&request))
                .await
                .unwrap_or(Err(FetchError::Timeout)),
            None => ctx.fetcher.fetch(&request).await,
        };

        // 2) Parse and process
        let processed = match fetched {
            Err(e) => {
                record.unreachable_count += 1;
                tracing::warn!(source_id = record.id, url = %record.feed_url, error = %e, "fetch failed");
                Processed::failed(PollOutcome::Unreachable)
            }
            Ok(FetchResponse::NotModified { header_size }) => {
                not_modified(&ctx, &mut record, now, header_size)
            }
            Ok(FetchResponse::Content(doc)) => match ctx.parser.parse(&doc.bytes) {
                Err(e) => {
                    record.unparsable_count += 1;
                    tracing::warn!(source_id = record.id, url = %record.feed_url, error = %e, "parse failed");
                    Processed::failed(PollOutcome::Unparsable)
                }
                Ok(feed) => process_window(&ctx, &mut record, now, &doc, feed),
            },
        };

        // 3) Persist record and new items as one unit
        record.total_processing_ms = record
            .total_processing_ms
            .saturating_add(started.elapsed().as_millis() as u64);
        let commit = ctx.store.commit_poll(&record, &processed.new_items).await;

        // 4) Outcome
        let elapsed = started.elapsed();
        let execution_warning = elapsed > ctx.settings.execution_warn;
        let (outcome, inserted) = match commit {
            Err(e) => {
                tracing::error!(source_id = record.id, error = %e, "persisting poll failed");
                (PollOutcome::Error, 0)
            }
            Ok(n) => {
                let outcome = match processed.outcome {
                    PollOutcome::Success if execution_warning => PollOutcome::ExecutionTimeWarning,
                    PollOutcome::Success if record.misses > misses_before => PollOutcome::Miss,
                    other => other,
                };
                (outcome, n)
            }
        };
        if execution_warning {
            tracing::warn!(
                source_id = record.id,
                url = %record.feed_url,
                elapsed_ms = elapsed.as_millis() as u64,
                "poll exceeded execution-time warning threshold"
            );
        }

        let report = PollReport {
            source_id: record.id,
            feed_url: record.feed_url.clone(),
            outcome,
            freshness: processed.freshness,
            new_items: processed.new_items.len(),
            inserted,
            interval_minutes: record.update_interval_minutes,
            pattern: record.activity_pattern,
            pattern_changed: processed.pattern_changed,
            execution_warning,
            elapsed_ms: elapsed.as_millis() as u64,
        };
        crate::metrics::record_poll(&report);
        tracing::debug!(
            source_id = record.id,
            url = %record.feed_url,
            outcome = outcome.as_str(),
            elapsed_ms = report.elapsed_ms,
            interval = record.update_interval_minutes,
            "poll finish"
        );

        PollCompletion { record, report }
    }
}

/// 304: the window is unchanged, so nothing is new.
fn not_modified(
    ctx: &PollContext,
    record: &mut SourceRecord,
    now: DateTime<Utc>,
    header_size: u32,
) -> Processed {
    record.conditional.cg_header_size = Some(header_size);
    record.post_distribution.observe_poll(now, &[]);
    let pattern_changed = refresh_classification(ctx, record, now);

    let sample = freshness_ratio(0, record.window_size);
    adapt_interval(ctx, record, sample);
    record.checks += 1;
    record.last_successful_check_time = Some(now);

    Processed {
        outcome: PollOutcome::Success,
        freshness: Some(sample),
        new_items: Vec::new(),
        pattern_changed,
    }
}

fn process_window(
    ctx: &PollContext,
    record: &mut SourceRecord,
    now: DateTime<Utc>,
    doc: &FetchedDocument,
    feed: ParsedFeed,
) -> Processed {
    let settings = &ctx.settings;
    record
        .conditional
        .remember(doc.etag.clone(), doc.last_modified.clone());
    if let Some(title) = feed.title.filter(|t| !t.is_empty()) {
        record.title = Some(title);
    }

    // New entries: identities of this window absent from the previous one.
    let mut seen = HashSet::new();
    let mut window = Vec::with_capacity(feed.items.len());
    for item in feed.items {
        if seen.insert(item.identity()) {
            window.push(item);
        }
    }
    let new_items: Vec<FeedItem> = window
        .iter()
        .filter(|it| !record.last_headlines.contains(&it.identity()))
        .cloned()
        .collect();
    record.items_seen_total += new_items.len() as u64;

    // Publish-time bookkeeping
    let stamps: Vec<DateTime<Utc>> = window.iter().filter_map(|it| it.published).collect();
    record.post_distribution.observe_poll(now, &stamps);
    record.remember_publish_times(stamps.iter().copied(), settings.timestamp_history);
    if stamps.len() >= 2 {
        record.timestamped_polls += 1;
        let near = settings.classifier.on_the_fly_window_secs;
        if stamps.iter().all(|t| (now - *t).num_seconds().abs() <= near) {
            record.on_the_fly_polls += 1;
        }
    }
    if let Some(newest) = stamps.iter().max().copied() {
        record.last_item_timestamp = Some(record.last_item_timestamp.map_or(newest, |t| t.max(newest)));
    }

    let pattern_changed = refresh_classification(ctx, record, now);

    let sample = freshness_ratio(new_items.len(), window.len());
    if sample.suggests_miss() && !record.last_headlines.is_empty() {
        record.misses += 1;
    }
    adapt_interval(ctx, record, sample);

    record.last_headlines = Headlines::from_identities(
        window.iter().map(FeedItem::identity),
        settings.headline_capacity,
    );
    record.checks += 1;
    record.byte_size = doc.bytes.len() as u64;
    record.window_size = window.len();
    record.last_successful_check_time = Some(now);

    Processed {
        outcome: PollOutcome::Success,
        freshness: Some(sample),
        new_items,
        pattern_changed,
    }
}

/// Keep the activity pattern current; returns whether it changed.
fn refresh_classification(ctx: &PollContext, record: &mut SourceRecord, now: DateTime<Utc>) -> bool {
    let before = record.activity_pattern;

    if record.items_seen_total == 0 {
        record.activity_pattern = ActivityPattern::Empty;
        record.classified_at = Some(now);
    } else {
        if before == ActivityPattern::Empty {
            record.activity_pattern = ActivityPattern::Unknown;
            record.classified_at = None;
        }
        if record.one_full_day_observed()
            && record.classification_stale(now, ctx.settings.reclassify_after)
        {
            record.activity_pattern =
                classify(&ClassifierInput::from_record(record), &ctx.settings.classifier);
            record.classified_at = Some(now);
        }
    }

    let changed = record.activity_pattern != before;
    if changed {
        tracing::info!(
            target: "feeds",
            source_id = record.id,
            url = %record.feed_url,
            from = before.as_str(),
            to = record.activity_pattern.as_str(),
            "activity pattern changed"
        );
    }
    changed
}

fn adapt_interval(ctx: &PollContext, record: &mut SourceRecord, sample: FreshnessSample) {
    record.cache_freshness(sample);
    record.update_interval_minutes = ctx.strategy.next_interval(&AdaptationInput {
        current_interval: record.update_interval_minutes,
        pn_target: sample.pn_target,
        mode: record.update_mode,
        pattern: record.activity_pattern,
    });
}
