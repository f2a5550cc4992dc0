// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod classifier;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod poll;
pub mod post_distribution;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod strategy;

// ---- Re-exports for stable public API ----
pub use crate::config::ReaderConfig;
pub use crate::poll::{PollCompletion, PollContext, PollOutcome, PollReport, PollTask};
pub use crate::scheduler::Scheduler;
pub use crate::source::{ActivityPattern, SourceRecord, UpdateMode};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `FEEDS_LOG_FORMAT=json` switches to JSON lines; anything else logs compact
/// text. The filter comes from `RUST_LOG`.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feed_poller=info,feeds=info,warn"));

    let json = std::env::var("FEEDS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
    }
}
