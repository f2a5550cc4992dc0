// tests/scheduler_dispatch.rs
mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use feed_poller::ingest::types::FetchError;
use feed_poller::poll::PollOutcome;
use feed_poller::source::{interval_duration, SourceDefaults};
use feed_poller::store::Store;
use feed_poller::Scheduler;

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_e_two_due_sources_run_concurrently_never_twice() {
    let store = memory_store();
    let a = store.add_source("http://example.org/a", SourceDefaults::default()).await.unwrap();
    let b = store.add_source("http://example.org/b", SourceDefaults::default()).await.unwrap();

    let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(150)));
    let ctx = context(probe.clone(), store.clone());
    let (scheduler, mut reports) = Scheduler::new(ctx, 4, Duration::from_millis(50)).with_reports();
    assert_eq!(scheduler.load_from_store().await.unwrap(), 2);

    let now = Utc::now();
    assert_eq!(scheduler.dispatch_due(now), 2);
    assert!(scheduler.in_flight().contains(a.id));
    assert!(scheduler.in_flight().contains(b.id));

    // Both sources show up as due again while their polls are running.
    scheduler.queue().schedule(a.clone(), now);
    scheduler.queue().schedule(b.clone(), now);
    assert_eq!(scheduler.dispatch_due(now), 0, "in-flight sources must not be dispatched");

    let r1 = reports.recv().await.unwrap();
    let r2 = reports.recv().await.unwrap();
    assert_ne!(r1.source_id, r2.source_id);
    scheduler.wait_idle().await;

    assert_eq!(probe.calls(), 2);
    assert_eq!(probe.max_per_url(), 1);
    assert_eq!(probe.max_active(), 2);
    assert!(scheduler.in_flight().is_empty());
    assert_eq!(scheduler.queue().len(), 2);
}

#[tokio::test]
async fn pool_width_bounds_concurrent_polls() {
    let store = memory_store();
    for i in 0..5 {
        store
            .add_source(&format!("http://example.org/{i}"), SourceDefaults::default())
            .await
            .unwrap();
    }
    let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(30)));
    let ctx = context(probe.clone(), store.clone());
    let (scheduler, mut reports) = Scheduler::new(ctx, 2, Duration::from_millis(10)).with_reports();
    scheduler.load_from_store().await.unwrap();

    assert_eq!(scheduler.dispatch_due(Utc::now()), 2);
    let mut done = 0;
    while done < 5 {
        reports.recv().await.unwrap();
        done += 1;
        scheduler.dispatch_due(Utc::now());
    }
    scheduler.wait_idle().await;

    assert_eq!(probe.calls(), 5);
    assert!(probe.max_active() <= 2);
}

#[tokio::test]
async fn scenario_c_unreachable_source_is_readmitted_after_its_interval() {
    let store = memory_store();
    let src = store.add_source("http://example.org/down", SourceDefaults::default()).await.unwrap();
    let ctx = context(
        Arc::new(ScriptedFetcher::new(vec![Err(FetchError::Connect("refused".into()))])),
        store.clone(),
    );
    let (scheduler, mut reports) = Scheduler::new(ctx, 1, Duration::from_millis(10)).with_reports();
    scheduler.load_from_store().await.unwrap();

    let before = Utc::now();
    assert_eq!(scheduler.dispatch_due(before), 1);
    let report = reports.recv().await.unwrap();
    let after = Utc::now();

    assert_eq!(report.outcome, PollOutcome::Unreachable);
    assert_eq!(report.interval_minutes, 60);
    let due = scheduler.queue().due_of(src.id).expect("readmitted");
    assert!(due >= before + interval_duration(60));
    assert!(due <= after + interval_duration(60));

    let stored = store.get_source(src.id).await.unwrap();
    assert_eq!(stored.unreachable_count, 1);
    assert_eq!(stored.update_interval_minutes, 60);
    // not due again right away
    assert_eq!(scheduler.dispatch_due(Utc::now()), 0);
}

#[tokio::test]
async fn run_loop_polls_and_stops_on_shutdown() {
    let store = memory_store();
    store.add_source("http://example.org/live", SourceDefaults::default()).await.unwrap();
    let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(5)));
    let ctx = context(probe.clone(), store.clone());
    let (scheduler, mut reports) = Scheduler::new(ctx, 2, Duration::from_millis(10)).with_reports();
    scheduler.load_from_store().await.unwrap();
    let scheduler = Arc::new(scheduler);

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = {
        let s = scheduler.clone();
        tokio::spawn(async move { s.run(stop_rx).await })
    };

    let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("poll finished in time")
        .unwrap();
    assert_eq!(report.outcome, PollOutcome::Success);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("scheduler stopped")
        .unwrap();
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn panicking_poll_is_reported_and_readmitted() {
    let store = memory_store();
    let src = store.add_source("http://example.org/boom", SourceDefaults::default()).await.unwrap();
    let ctx = context(Arc::new(PanickingFetcher), store.clone());
    let (scheduler, mut reports) = Scheduler::new(ctx, 1, Duration::from_millis(10)).with_reports();
    scheduler.load_from_store().await.unwrap();

    let before = Utc::now();
    assert_eq!(scheduler.dispatch_due(before), 1);
    let report = reports.recv().await.unwrap();
    let after = Utc::now();

    assert_eq!(report.outcome, PollOutcome::Error);
    assert_eq!(report.source_id, src.id);
    assert!(scheduler.in_flight().is_empty());
    let due = scheduler.queue().due_of(src.id).expect("readmitted");
    assert!(due >= before + interval_duration(60));
    assert!(due <= after + interval_duration(60));

    // the worker slot was released
    scheduler.wait_idle().await;
}

#[tokio::test]
async fn reloading_sources_never_duplicates_a_running_or_queued_source() {
    let store = memory_store();
    let src = store.add_source("http://example.org/busy", SourceDefaults::default()).await.unwrap();
    let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(100)));
    let ctx = context(probe.clone(), store.clone());
    let (scheduler, mut reports) = Scheduler::new(ctx, 2, Duration::from_millis(10)).with_reports();
    assert_eq!(scheduler.load_from_store().await.unwrap(), 1);

    assert_eq!(scheduler.dispatch_due(Utc::now()), 1);
    // running: the stale copy from the store is not queued
    assert_eq!(scheduler.load_from_store().await.unwrap(), 0);
    assert!(!scheduler.admit(src.clone()));
    assert!(scheduler.queue().is_empty());

    let report = reports.recv().await.unwrap();
    assert_eq!(report.outcome, PollOutcome::Success);
    let due = scheduler.queue().due_of(src.id).expect("readmitted");

    // queued: a reload keeps the entry written by the finished poll
    assert_eq!(scheduler.load_from_store().await.unwrap(), 0);
    assert_eq!(scheduler.queue().due_of(src.id), Some(due));
    assert_eq!(scheduler.dispatch_due(Utc::now()), 0);
    scheduler.wait_idle().await;
    assert_eq!(probe.calls(), 1);
}
