// src/config/mod.rs
//! # Reader configuration
//! Interval bounds, pool width, deadlines and the tunables of the strategy
//! and classifier. Read from TOML or JSON; every field has a default.

pub mod sources;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::classifier::ClassifierThresholds;
use crate::poll::PollSettings;
use crate::source::{SourceDefaults, UpdateMode};
use crate::strategy::{AdaptiveStrategy, AdaptiveTuning, FixedStrategy, IntervalBounds, UpdateStrategy};

const ENV_PATH: &str = "FEEDS_CONFIG_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Adaptive,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub min_interval_minutes: u32,
    pub max_interval_minutes: u32,
    pub default_interval_minutes: u32,
    pub default_update_mode: UpdateMode,
    /// Worker-pool width.
    pub workers: usize,
    pub tick_millis: u64,
    pub execution_warn_secs: u64,
    /// 0 disables the fetch deadline.
    pub fetch_timeout_secs: u64,
    pub reclassify_after_days: i64,
    pub strategy: StrategyKind,
    pub fixed_interval_minutes: u32,
    pub adaptive: AdaptiveTuning,
    pub classifier: ClassifierThresholds,
    pub headline_capacity: usize,
    pub timestamp_history: usize,
    pub database_path: PathBuf,
    pub metrics_addr: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            min_interval_minutes: 1,
            max_interval_minutes: 1440,
            default_interval_minutes: 60,
            default_update_mode: UpdateMode::MinDelay,
            workers: 16,
            tick_millis: 1000,
            execution_warn_secs: 180,
            fetch_timeout_secs: 60,
            reclassify_after_days: 30,
            strategy: StrategyKind::Adaptive,
            fixed_interval_minutes: 60,
            adaptive: AdaptiveTuning::default(),
            classifier: ClassifierThresholds::default(),
            headline_capacity: 500,
            timestamp_history: 250,
            database_path: PathBuf::from("state/feeds.db"),
            metrics_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

impl ReaderConfig {
    /// Load from an explicit path; `.json` is JSON, anything else TOML.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading reader config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg: ReaderConfig = if ext == "json" {
            serde_json::from_str(&content).context("parsing reader config json")?
        } else {
            toml::from_str(&content).context("parsing reader config toml")?
        };
        Ok(cfg.validated())
    }

    /// Load using env var + fallbacks:
    /// 1) $FEEDS_CONFIG_PATH
    /// 2) config/feeds.toml
    /// 3) config/feeds.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        for candidate in ["config/feeds.toml", "config/feeds.json"] {
            let p = PathBuf::from(candidate);
            if p.exists() {
                return Self::load_from(&p);
            }
        }
        Ok(Self::default())
    }

    /// Repair inconsistent values instead of rejecting them.
    pub fn validated(mut self) -> Self {
        if self.min_interval_minutes > self.max_interval_minutes {
            // swap to keep a valid interval
            std::mem::swap(&mut self.min_interval_minutes, &mut self.max_interval_minutes);
        }
        self.min_interval_minutes = self.min_interval_minutes.max(1);
        self.max_interval_minutes = self.max_interval_minutes.max(1);
        let bounds = self.bounds();
        self.default_interval_minutes = bounds.clamp(self.default_interval_minutes);
        self.fixed_interval_minutes = bounds.clamp(self.fixed_interval_minutes);
        self.workers = self.workers.max(1);
        self.tick_millis = self.tick_millis.max(10);
        self.reclassify_after_days = self.reclassify_after_days.max(0);
        self.headline_capacity = self.headline_capacity.max(1);
        self.timestamp_history = self.timestamp_history.max(2);
        self.adaptive = self.adaptive.sanitized();
        self
    }

    pub fn bounds(&self) -> IntervalBounds {
        IntervalBounds::new(self.min_interval_minutes, self.max_interval_minutes)
    }

    pub fn source_defaults(&self) -> SourceDefaults {
        SourceDefaults {
            interval_minutes: self.default_interval_minutes,
            update_mode: self.default_update_mode,
        }
    }

    pub fn build_strategy(&self) -> Arc<dyn UpdateStrategy> {
        match self.strategy {
            StrategyKind::Adaptive => Arc::new(AdaptiveStrategy::new(self.adaptive.clone(), self.bounds())),
            StrategyKind::Fixed => Arc::new(FixedStrategy::new(self.fixed_interval_minutes, self.bounds())),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            execution_warn: Duration::from_secs(self.execution_warn_secs),
            fetch_timeout: (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs)),
            reclassify_after: chrono::Duration::days(self.reclassify_after_days),
            headline_capacity: self.headline_capacity,
            timestamp_history: self.timestamp_history,
            classifier: self.classifier.clone(),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}
