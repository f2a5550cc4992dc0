//! Poll a single feed URL once and print the report as JSON.
//!
//! Usage: `poll-once <feed-url>`

use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde_json::json;

use feed_poller::ingest::fetch::HttpFetcher;
use feed_poller::ingest::parse::XmlFeedParser;
use feed_poller::store::{InMemoryStore, Store};
use feed_poller::{init_tracing, PollContext, PollTask, ReaderConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let url = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: poll-once <feed-url>"))?;
    let cfg = ReaderConfig::load_default().context("loading reader config")?;

    let store = Arc::new(InMemoryStore::new());
    let record = store.add_source(&url, cfg.source_defaults()).await?;
    let ctx = Arc::new(PollContext {
        fetcher: Arc::new(HttpFetcher::new()?),
        parser: Arc::new(XmlFeedParser::new()),
        store: store.clone(),
        strategy: cfg.build_strategy(),
        settings: cfg.poll_settings(),
    });

    let done = PollTask::new(ctx, record).run().await;
    let out = json!({
        "report": done.report,
        "title": done.record.title,
        "window_size": done.record.window_size,
        "conditional_get": done.record.conditional.is_supported(),
        "next_due": done.record.next_due(chrono::Utc::now()),
        "activity_pattern": done.record.activity_pattern,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
