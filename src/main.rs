//! Feed poller binary entrypoint.
//! Loads the reader config and source list, registers the sources in SQLite,
//! serves `/metrics` and runs the scheduler until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use feed_poller::config::sources::load_sources_default;
use feed_poller::ingest::fetch::HttpFetcher;
use feed_poller::ingest::parse::XmlFeedParser;
use feed_poller::metrics::Metrics;
use feed_poller::store::{SqliteStore, Store};
use feed_poller::{init_tracing, PollContext, ReaderConfig, Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = ReaderConfig::load_default().context("loading reader config")?;
    let urls = load_sources_default().context("loading source list")?;

    let store = Arc::new(SqliteStore::open(&cfg.database_path).context("opening database")?);
    for url in &urls {
        store
            .add_source(url, cfg.source_defaults())
            .await
            .with_context(|| format!("registering {url}"))?;
    }

    // --- Metrics endpoint ---
    let metrics = Metrics::init()?;
    let listener = tokio::net::TcpListener::bind(&cfg.metrics_addr)
        .await
        .with_context(|| format!("binding metrics listener on {}", cfg.metrics_addr))?;
    tracing::info!(addr = %cfg.metrics_addr, "metrics listening");
    let router = metrics.router();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::warn!("metrics server: {e:#}");
        }
    });

    // --- Scheduler ---
    let ctx = Arc::new(PollContext {
        fetcher: Arc::new(HttpFetcher::new()?),
        parser: Arc::new(XmlFeedParser::new()),
        store: store.clone(),
        strategy: cfg.build_strategy(),
        settings: cfg.poll_settings(),
    });
    let scheduler = Scheduler::new(ctx, cfg.workers, cfg.tick());
    scheduler.load_from_store().await.context("loading sources")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
        }
        let _ = stop_tx.send(true);
    });

    scheduler.run(stop_rx).await;
    tracing::info!("feed poller stopped");
    Ok(())
}
