// tests/metrics.rs
use axum::body::{self, Body};
use http::{Request, StatusCode};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use tower::ServiceExt;

use feed_poller::metrics::{record_poll, Metrics};
use feed_poller::poll::{PollOutcome, PollReport};
use feed_poller::source::ActivityPattern;
use feed_poller::strategy::freshness_ratio;

fn report(outcome: PollOutcome) -> PollReport {
    PollReport {
        source_id: 1,
        feed_url: "http://example.org/feed".into(),
        outcome,
        freshness: Some(freshness_ratio(3, 10)),
        new_items: 3,
        inserted: 3,
        interval_minutes: 42,
        pattern: ActivityPattern::Chunked,
        pattern_changed: true,
        execution_warning: outcome == PollOutcome::ExecutionTimeWarning,
        elapsed_ms: 12,
    }
}

#[tokio::test]
async fn healthz_and_metrics_routes_answer() {
    let app = Metrics::detached().router();

    let resp = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"ok");

    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[test]
fn poll_report_feeds_counters_and_histograms() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        record_poll(&report(PollOutcome::Success));
        record_poll(&report(PollOutcome::ExecutionTimeWarning));
    });

    let snapshot = snapshotter.snapshot().into_vec();
    let counter = |name: &str, label: Option<(&str, &str)>| -> u64 {
        snapshot
            .iter()
            .filter(|(ck, _, _, _)| ck.key().name() == name)
            .filter(|(ck, _, _, _)| match label {
                Some((k, v)) => ck.key().labels().any(|l| l.key() == k && l.value() == v),
                None => true,
            })
            .map(|(_, _, _, v)| match v {
                DebugValue::Counter(n) => *n,
                _ => 0,
            })
            .sum()
    };

    assert_eq!(counter("feed_polls_total", Some(("outcome", "SUCCESS"))), 1);
    assert_eq!(counter("feed_polls_total", Some(("outcome", "EXECUTION_TIME_WARNING"))), 1);
    assert_eq!(counter("feed_new_items_total", None), 6);
    assert_eq!(counter("feed_execution_warnings_total", None), 1);
    assert_eq!(counter("feed_activity_pattern_changes_total", Some(("pattern", "CHUNKED"))), 2);
    assert!(snapshot
        .iter()
        .any(|(ck, _, _, v)| ck.key().name() == "feed_freshness_ratio"
            && matches!(v, DebugValue::Histogram(h) if h.len() == 2)));
}
