//! # Telemetry
//! Poll outcomes, freshness ratios and scheduler occupancy, exported in the
//! Prometheus text format on `/metrics`.

use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::poll::PollReport;

/// Register metric descriptions once per process.
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_polls_total", "Completed polls by outcome.");
        describe_histogram!("feed_poll_duration_ms", "Wall-clock time of one poll in milliseconds.");
        describe_histogram!("feed_freshness_ratio", "pnTarget of polls that saw a window.");
        describe_counter!("feed_new_items_total", "Items not seen at the previous poll.");
        describe_counter!(
            "feed_activity_pattern_changes_total",
            "Activity pattern transitions by new pattern."
        );
        describe_counter!(
            "feed_execution_warnings_total",
            "Polls that exceeded the execution-time warning threshold."
        );
        describe_gauge!("feed_sources_in_flight", "Polls currently running.");
        describe_gauge!("feed_sources_scheduled", "Sources waiting in the due queue.");
        describe_histogram!("feed_fetch_ms", "HTTP fetch time in milliseconds.");
        describe_counter!("feed_fetch_not_modified_total", "Conditional GETs answered with 304.");
        describe_histogram!("feed_parse_ms", "Feed parse time in milliseconds.");
    });
}

/// Telemetry for one completed poll.
pub fn record_poll(report: &PollReport) {
    ensure_metrics_described();
    counter!("feed_polls_total", "outcome" => report.outcome.as_str()).increment(1);
    histogram!("feed_poll_duration_ms").record(report.elapsed_ms as f64);
    if let Some(f) = report.freshness {
        histogram!("feed_freshness_ratio").record(f.pn_target);
    }
    counter!("feed_new_items_total").increment(report.new_items as u64);
    if report.pattern_changed {
        counter!("feed_activity_pattern_changes_total", "pattern" => report.pattern.as_str())
            .increment(1);
    }
    if report.execution_warning {
        counter!("feed_execution_warnings_total").increment(1);
    }
}

pub fn record_occupancy(in_flight: usize, scheduled: usize) {
    gauge!("feed_sources_in_flight").set(in_flight as f64);
    gauge!("feed_sources_scheduled").set(scheduled as f64);
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// A handle not wired to the global recorder (renders an empty exposition).
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// Router exposing `/metrics` and `/healthz`.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
            .route("/healthz", get(|| async { "ok" }))
    }
}
