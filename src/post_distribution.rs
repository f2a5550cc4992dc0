//! # Post Distribution
//! Per-source histogram over the 1440 minutes of the day.
//!
//! Every poll observes a span of wall-clock minutes: from where the previous
//! poll stopped observing (or the oldest visible item on the first poll) up to
//! the poll time. Each minute in that span gets one more *chance*; each minute
//! in that span that carried a visible item gets one more *post*. Spans of
//! successive polls never overlap, so an absolute minute is counted once and
//! `posts <= chances` holds for every bucket.
//!
//! Once every bucket has at least one chance, a full day has been observed and
//! the activity classifier may trust the profile.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MINUTES_PER_DAY: usize = 1440;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub posts: u32,
    pub chances: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDistribution {
    buckets: Vec<Bucket>,
    /// Absolute minute (unix minutes) up to which chances have been counted, exclusive.
    observed_until: Option<i64>,
    /// Sticky once true: chances never decrease.
    full_day: bool,
}

/// What a single poll contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub minutes_observed: u64,
    pub posts_recorded: u32,
}

impl Default for PostDistribution {
    fn default() -> Self {
        Self::new()
    }
}

impl PostDistribution {
    pub fn new() -> Self {
        Self {
            buckets: vec![Bucket::default(); MINUTES_PER_DAY],
            observed_until: None,
            full_day: false,
        }
    }

    /// Rebuild from stored parts (e.g. a database row set). Missing minutes stay empty.
    pub fn from_parts<I>(buckets: I, observed_until: Option<i64>) -> Self
    where
        I: IntoIterator<Item = (usize, Bucket)>,
    {
        let mut d = Self::new();
        for (minute, b) in buckets {
            if minute < MINUTES_PER_DAY {
                d.buckets[minute] = Bucket {
                    posts: b.posts.min(b.chances),
                    chances: b.chances,
                };
            }
        }
        d.observed_until = observed_until;
        d.full_day = d.buckets.iter().all(|b| b.chances >= 1);
        d
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bucket(&self, minute_of_day: usize) -> Bucket {
        self.buckets[minute_of_day % MINUTES_PER_DAY]
    }

    pub fn observed_until(&self) -> Option<i64> {
        self.observed_until
    }

    /// End of the observed span as a timestamp.
    pub fn observed_until_time(&self) -> Option<DateTime<Utc>> {
        self.observed_until
            .and_then(|m| DateTime::<Utc>::from_timestamp(m.saturating_mul(60), 0))
    }

    pub fn total_posts(&self) -> u64 {
        self.buckets.iter().map(|b| u64::from(b.posts)).sum()
    }

    pub fn one_full_day_observed(&self) -> bool {
        self.full_day
    }

    /// Posts per hour of the day, summed over the minute buckets.
    pub fn posts_per_hour(&self) -> [u64; 24] {
        let mut out = [0u64; 24];
        for (minute, b) in self.buckets.iter().enumerate() {
            out[minute / 60] += u64::from(b.posts);
        }
        out
    }

    /// Record what one poll could see.
    ///
    /// `window` are the publish times of all items visible in this poll (not
    /// only the new ones). An empty window (e.g. a not-modified answer) only
    /// advances the chances since the previous observation.
    pub fn observe_poll(&mut self, poll_time: DateTime<Utc>, window: &[DateTime<Utc>]) -> Observation {
        let end = unix_minute(poll_time);
        let oldest = window.iter().map(|t| unix_minute(*t)).filter(|m| *m < end).min();

        // 1) Start of the span: resume where we stopped, unless the window no
        //    longer reaches back that far (then the gap is unobservable).
        let start = match (self.observed_until, oldest) {
            (Some(until), Some(o)) => until.max(o),
            (Some(until), None) => until,
            (None, Some(o)) => o,
            (None, None) => return Observation::default(),
        };
        if end <= start {
            return Observation::default();
        }

        // 2) Chances for every minute in [start, end).
        let span = (end - start) as u64;
        let full_days = span / MINUTES_PER_DAY as u64;
        if full_days > 0 {
            let add = u32::try_from(full_days).unwrap_or(u32::MAX);
            for b in self.buckets.iter_mut() {
                b.chances = b.chances.saturating_add(add);
            }
        }
        let rest_start = start + (full_days * MINUTES_PER_DAY as u64) as i64;
        for m in rest_start..end {
            let b = &mut self.buckets[minute_of_day(m)];
            b.chances = b.chances.saturating_add(1);
        }

        // 3) Posts: each absolute minute of the span at most once.
        let post_minutes: BTreeSet<i64> = window
            .iter()
            .map(|t| unix_minute(*t))
            .filter(|m| (start..end).contains(m))
            .collect();
        for m in &post_minutes {
            let b = &mut self.buckets[minute_of_day(*m)];
            b.posts = b.posts.saturating_add(1).min(b.chances);
        }

        self.observed_until = Some(end);
        if !self.full_day {
            self.full_day = self.buckets.iter().all(|b| b.chances >= 1);
        }

        Observation {
            minutes_observed: span,
            posts_recorded: post_minutes.len() as u32,
        }
    }
}

fn unix_minute(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(60)
}

fn minute_of_day(unix_minute: i64) -> usize {
    unix_minute.rem_euclid(MINUTES_PER_DAY as i64) as usize
}
