// tests/poll_scenarios.rs
mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use feed_poller::classifier::{classify, ClassifierInput, ClassifierThresholds};
use feed_poller::ingest::types::{FetchError, FetchResponse};
use feed_poller::poll::{PollContext, PollOutcome, PollSettings, PollTask};
use feed_poller::post_distribution::PostDistribution;
use feed_poller::source::{ActivityPattern, Headlines, SourceDefaults, SourceRecord, UpdateMode};
use feed_poller::store::Store;

use common::*;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

/// A record that saw `old0..old19` at its previous poll.
fn primed(mode: UpdateMode) -> SourceRecord {
    let mut r = SourceRecord::new(
        1,
        "http://example.org/feed",
        SourceDefaults {
            interval_minutes: 60,
            update_mode: mode,
        },
    );
    let previous: Vec<String> = titles("old", 0..20)
        .iter()
        .map(|t| item(t).identity())
        .collect();
    r.last_headlines = Headlines::from_identities(previous, 500);
    r.window_size = 20;
    r.items_seen_total = 20;
    r
}

async fn poll_window(mode: UpdateMode, window: Vec<String>) -> feed_poller::PollCompletion {
    let store = memory_store();
    let ctx = context(Arc::new(ScriptedFetcher::new(vec![titles_body(&window)])), store);
    PollTask::new(ctx, primed(mode)).run_at(now()).await
}

fn five_new_of_twenty() -> Vec<String> {
    let mut w = titles("new", 0..5);
    w.extend(titles("old", 0..15));
    w
}

#[tokio::test]
async fn scenario_a_low_freshness_grows_interval_more_under_max_coverage() {
    let min_delay = poll_window(UpdateMode::MinDelay, five_new_of_twenty()).await;
    let max_cov = poll_window(UpdateMode::MaxCoverage, five_new_of_twenty()).await;

    for done in [&min_delay, &max_cov] {
        let f = done.report.freshness.expect("freshness sample");
        assert_eq!(f.new_entries, 5);
        assert_eq!(f.total_entries, 20);
        assert!((f.pn_target - 5.0 / 19.0).abs() < 1e-12);
        assert_eq!(done.report.outcome, PollOutcome::Success);
    }

    let a = min_delay.record.update_interval_minutes;
    let b = max_cov.record.update_interval_minutes;
    assert!(a >= 60, "MIN_DELAY must not shorten on low freshness: {a}");
    assert!(b > 60, "MAX_COVERAGE must grow: {b}");
    assert!(b - 60 > a - 60);
}

#[tokio::test]
async fn scenario_b_complete_turnover_shrinks_interval_more_under_min_delay() {
    let min_delay = poll_window(UpdateMode::MinDelay, titles("new", 0..20)).await;
    let max_cov = poll_window(UpdateMode::MaxCoverage, titles("new", 0..20)).await;

    for done in [&min_delay, &max_cov] {
        let f = done.report.freshness.expect("freshness sample");
        assert_eq!(f.pn_target, 1.0);
        assert!(f.raw_ratio > 1.0);
        assert_eq!(done.report.outcome, PollOutcome::Miss);
        assert_eq!(done.record.misses, 1);
    }

    let a = min_delay.record.update_interval_minutes;
    let b = max_cov.record.update_interval_minutes;
    assert!(a < 60 && b < 60);
    assert!(a < b, "MIN_DELAY shrinks harder: {a} vs {b}");
}

#[tokio::test]
async fn scenario_c_timeout_is_unreachable_and_keeps_interval() {
    let store = memory_store();
    let ctx = context(
        Arc::new(ScriptedFetcher::new(vec![Err(FetchError::Timeout)])),
        store.clone(),
    );
    let record = primed(UpdateMode::MinDelay);
    let done = PollTask::new(ctx, record).run_at(now()).await;

    assert_eq!(done.report.outcome, PollOutcome::Unreachable);
    assert_eq!(done.record.unreachable_count, 1);
    assert_eq!(done.record.update_interval_minutes, 60);
    assert_eq!(done.record.next_due(now()), now() + Duration::minutes(60));

    // persisted even though the poll failed
    let stored = store.get_source(1).await.unwrap();
    assert_eq!(stored.unreachable_count, 1);
    assert_eq!(stored.last_poll_time, Some(now()));
}

#[tokio::test]
async fn scenario_d_source_without_items_is_empty() {
    let store = memory_store();
    let ctx = context(
        Arc::new(ScriptedFetcher::new(vec![titles_body(&[])])),
        store,
    );
    let mut record = SourceRecord::new(9, "http://example.org/empty", SourceDefaults::default());
    for i in 0..3 {
        let done = PollTask::new(ctx.clone(), record)
            .run_at(now() + Duration::hours(i))
            .await;
        assert_eq!(done.report.outcome, PollOutcome::Success);
        record = done.record;
        assert_eq!(record.activity_pattern, ActivityPattern::Empty);
    }
    assert_eq!(record.items_seen_total, 0);

    // Even with a fully observed day the classifier answers EMPTY.
    let mut d = PostDistribution::new();
    d.observe_poll(now(), &[now() - Duration::days(2)]);
    assert!(d.one_full_day_observed());
    let input = ClassifierInput {
        distribution: &d,
        publish_history: &[],
        items_seen_total: 0,
        timestamped_polls: 0,
        on_the_fly_polls: 0,
    };
    assert_eq!(
        classify(&input, &ClassifierThresholds::default()),
        ActivityPattern::Empty
    );
}

#[tokio::test]
async fn repeated_items_are_not_new_and_not_stored_twice() {
    let store = memory_store();
    let window = titles("item", 0..4);
    let ctx = context(
        Arc::new(ScriptedFetcher::new(vec![titles_body(&window)])),
        store.clone(),
    );
    let record = SourceRecord::new(3, "http://example.org/feed", SourceDefaults::default());

    let first = PollTask::new(ctx.clone(), record).run_at(now()).await;
    assert_eq!(first.report.inserted, 4);
    let second = PollTask::new(ctx, first.record)
        .run_at(now() + Duration::hours(1))
        .await;
    assert_eq!(second.report.new_items, 0);
    assert_eq!(second.report.inserted, 0);
    assert_eq!(second.report.freshness.map(|f| f.pn_target), Some(0.0));
    assert_eq!(store.item_count(3).await.unwrap(), 4);
}

#[tokio::test]
async fn not_modified_answers_keep_window_and_count_checks() {
    let store = memory_store();
    let ctx = context(
        Arc::new(ScriptedFetcher::new(vec![
            titles_body(&titles("x", 0..3)),
            Ok(FetchResponse::NotModified { header_size: 120 }),
        ])),
        store,
    );
    let record = SourceRecord::new(4, "http://example.org/feed", SourceDefaults::default());
    let first = PollTask::new(ctx.clone(), record).run_at(now()).await;
    let second = PollTask::new(ctx, first.record)
        .run_at(now() + Duration::minutes(30))
        .await;

    assert_eq!(second.report.outcome, PollOutcome::Success);
    assert_eq!(second.record.window_size, 3);
    assert_eq!(second.record.last_headlines.len(), 3);
    assert_eq!(second.record.checks, 2);
    assert_eq!(second.record.conditional.cg_header_size, Some(120));
}

#[tokio::test]
async fn slow_poll_is_flagged_but_runs_to_completion() {
    let store = memory_store();
    let ctx = Arc::new(PollContext {
        fetcher: Arc::new(ConcurrencyProbe::new(std::time::Duration::from_millis(20))),
        parser: Arc::new(TitlesParser),
        store: store.clone(),
        strategy: adaptive(),
        settings: PollSettings {
            execution_warn: std::time::Duration::ZERO,
            ..PollSettings::default()
        },
    });
    let record = SourceRecord::new(5, "http://example.org/slow", SourceDefaults::default());
    let done = PollTask::new(ctx, record).run_at(now()).await;

    assert_eq!(done.report.outcome, PollOutcome::ExecutionTimeWarning);
    assert!(done.report.execution_warning);
    assert!(done.report.elapsed_ms >= 20);
    // the whole cycle still ran
    assert_eq!(done.report.inserted, 2);
    assert_eq!(done.record.checks, 1);
    assert_eq!(store.get_source(5).await.unwrap().checks, 1);
}

#[tokio::test]
async fn store_failure_ends_as_error() {
    let ctx = context(
        Arc::new(ScriptedFetcher::new(vec![titles_body(&titles("x", 0..3))])),
        Arc::new(BrokenStore),
    );
    let record = SourceRecord::new(6, "http://example.org/feed", SourceDefaults::default());
    let done = PollTask::new(ctx, record).run_at(now()).await;

    assert_eq!(done.report.outcome, PollOutcome::Error);
    assert_eq!(done.report.inserted, 0);
    assert_eq!(done.report.new_items, 3);
    // the in-memory record still reflects the poll and is handed back
    assert_eq!(done.record.last_poll_time, Some(now()));
    assert_eq!(done.record.window_size, 3);
}
