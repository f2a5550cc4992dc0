//! # Activity Classifier
//! Maps a source's accumulated history to one [`ActivityPattern`].
//!
//! Pure and deterministic: the same history always yields the same label.
//! Nothing here reads the wall clock; "how old is the newest post" is measured
//! against the end of the observed span in the post distribution.
//!
//! Decision order:
//! 1. `EMPTY`: no item was ever seen.
//! 2. `UNKNOWN`: no full day observed yet.
//! 3. `ZOMBIE`: the newest post is older than `zombie_after_days`.
//! 4. `ON_THE_FLY`: most timestamped polls saw items stamped at poll time.
//! 5. `UNKNOWN`: too few publish gaps to say more.
//! 6. `CONSTANT`: publish gaps have a low coefficient of variation.
//! 7. `SLICED`: posts are confined to a few hours of the day.
//! 8. `CHUNKED`: anything else (irregular bursts spread over the day).

use serde::{Deserialize, Serialize};

use crate::post_distribution::PostDistribution;
use crate::source::{ActivityPattern, SourceRecord};

/// Named, tunable thresholds separating the classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    /// Publish gaps (and timestamped polls) needed before a temporal label.
    pub min_intervals: usize,
    pub zombie_after_days: i64,
    pub on_the_fly_window_secs: i64,
    pub on_the_fly_fraction: f64,
    /// Max coefficient of variation of publish gaps for `CONSTANT`.
    pub constant_max_cv: f64,
    pub sliced_max_active_hours: usize,
    pub sliced_min_posts: u64,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            min_intervals: 5,
            zombie_after_days: 180,
            on_the_fly_window_secs: 120,
            on_the_fly_fraction: 0.8,
            constant_max_cv: 0.5,
            sliced_max_active_hours: 6,
            sliced_min_posts: 12,
        }
    }
}

/// The history the classifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput<'a> {
    pub distribution: &'a PostDistribution,
    /// Sorted, distinct publish times (unix seconds).
    pub publish_history: &'a [i64],
    pub items_seen_total: u64,
    pub timestamped_polls: u64,
    pub on_the_fly_polls: u64,
}

impl<'a> ClassifierInput<'a> {
    pub fn from_record(r: &'a SourceRecord) -> Self {
        Self {
            distribution: &r.post_distribution,
            publish_history: &r.publish_history,
            items_seen_total: r.items_seen_total,
            timestamped_polls: r.timestamped_polls,
            on_the_fly_polls: r.on_the_fly_polls,
        }
    }
}

pub fn classify(input: &ClassifierInput<'_>, t: &ClassifierThresholds) -> ActivityPattern {
    if input.items_seen_total == 0 {
        return ActivityPattern::Empty;
    }
    if !input.distribution.one_full_day_observed() {
        return ActivityPattern::Unknown;
    }

    if let (Some(&newest), Some(until)) = (
        input.publish_history.last(),
        input.distribution.observed_until_time(),
    ) {
        let silence = until.timestamp() - newest;
        if silence > t.zombie_after_days.saturating_mul(86_400) {
            return ActivityPattern::Zombie;
        }
    }

    let min = t.min_intervals.max(1);
    if input.timestamped_polls >= min as u64 {
        let share = input.on_the_fly_polls as f64 / input.timestamped_polls as f64;
        if share >= t.on_the_fly_fraction {
            return ActivityPattern::OnTheFly;
        }
    }

    let gaps = publish_gaps(input.publish_history);
    if gaps.len() < min {
        return ActivityPattern::Unknown;
    }

    if let Some(cv) = coefficient_of_variation(&gaps) {
        if cv <= t.constant_max_cv {
            return ActivityPattern::Constant;
        }
    }

    if input.distribution.total_posts() >= t.sliced_min_posts {
        let active_hours = input
            .distribution
            .posts_per_hour()
            .iter()
            .filter(|&&n| n > 0)
            .count();
        if active_hours <= t.sliced_max_active_hours {
            return ActivityPattern::Sliced;
        }
    }

    ActivityPattern::Chunked
}

fn publish_gaps(history: &[i64]) -> Vec<f64> {
    history
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64)
        .filter(|g| *g > 0.0)
        .collect()
}

fn coefficient_of_variation(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Some(var.sqrt() / mean)
}
