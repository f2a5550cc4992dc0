//! # Interval Adaptation
//! Pure control loop: `(current interval, pnTarget, mode, activity pattern)`
//! → next interval.
//!
//! Each mode has a *neutral* freshness ratio. Below it the interval grows,
//! above it the interval shrinks; the distance to the neutral point scales the
//! step. `MIN_DELAY` sits at a high neutral point with a strong shrink gain,
//! `MAX_COVERAGE` at an even higher one with a strong growth gain. The
//! activity pattern scales both gains. The factor is non-increasing in the
//! ratio, so a fresher poll never yields a longer interval.

use serde::{Deserialize, Serialize};

use crate::source::{ActivityPattern, UpdateMode};

/// Freshness of one poll's visible window relative to the previous poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreshnessSample {
    pub new_entries: usize,
    pub total_entries: usize,
    /// `new / (total - 1)`, may exceed 1 when every visible item is new.
    pub raw_ratio: f64,
    /// `raw_ratio` clamped to `[0, 1]`.
    pub pn_target: f64,
}

impl FreshnessSample {
    /// Every visible item is new: older items may have scrolled out unseen.
    pub fn suggests_miss(&self) -> bool {
        self.raw_ratio > 1.0
    }
}

/// Compute the freshness ratio of a poll.
///
/// With one or zero visible items there is no basis to judge, so the poll is
/// treated as fully fresh.
pub fn freshness_ratio(new_entries: usize, total_entries: usize) -> FreshnessSample {
    let new_entries = new_entries.min(total_entries);
    let raw_ratio = if total_entries > 1 {
        new_entries as f64 / (total_entries - 1) as f64
    } else {
        1.0
    };
    FreshnessSample {
        new_entries,
        total_entries,
        raw_ratio,
        pn_target: raw_ratio.clamp(0.0, 1.0),
    }
}

/// Inclusive interval bounds in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBounds {
    pub min: u32,
    pub max: u32,
}

impl IntervalBounds {
    pub fn new(min: u32, max: u32) -> Self {
        let min = min.max(1);
        let max = max.max(1);
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn clamp(&self, minutes: u32) -> u32 {
        minutes.clamp(self.min, self.max)
    }
}

/// Everything the strategy may look at for one decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptationInput {
    pub current_interval: u32,
    pub pn_target: f64,
    pub mode: UpdateMode,
    pub pattern: ActivityPattern,
}

pub trait UpdateStrategy: Send + Sync {
    fn next_interval(&self, input: &AdaptationInput) -> u32;
    fn name(&self) -> &'static str;
}

/// Gains for one update mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeTuning {
    /// Ratio at which the interval is left unchanged.
    pub neutral: f64,
    /// Relative growth at `pnTarget = 0` (0.25 → ×1.25).
    pub max_growth: f64,
    /// Relative shrink at `pnTarget = 1` (0.5 → ×0.5).
    pub max_shrink: f64,
}

/// Multipliers applied to a mode's gains for one activity pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternBias {
    pub growth: f64,
    pub shrink: f64,
    /// Ignore the source's own mode and use `MAX_COVERAGE` gains.
    #[serde(default)]
    pub force_max_coverage: bool,
}

impl PatternBias {
    const fn new(growth: f64, shrink: f64, force_max_coverage: bool) -> Self {
        Self {
            growth,
            shrink,
            force_max_coverage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternBiases {
    pub unknown: PatternBias,
    pub constant: PatternBias,
    pub chunked: PatternBias,
    pub sliced: PatternBias,
    pub zombie: PatternBias,
    pub on_the_fly: PatternBias,
    pub empty: PatternBias,
}

impl Default for PatternBiases {
    fn default() -> Self {
        Self {
            unknown: PatternBias::new(1.0, 1.0, false),
            // Regular sources may converge to a tight interval; keep them there.
            constant: PatternBias::new(0.5, 1.0, false),
            // A burst makes the whole window look new; don't overreact to it.
            chunked: PatternBias::new(1.0, 0.5, false),
            sliced: PatternBias::new(0.75, 0.75, false),
            zombie: PatternBias::new(2.0, 0.25, true),
            // Timestamps are generated per request; freshness says little.
            on_the_fly: PatternBias::new(1.0, 0.25, false),
            empty: PatternBias::new(2.0, 0.0, true),
        }
    }
}

impl PatternBiases {
    /// Every pattern except EMPTY keeps some growth and shrink.
    fn sanitized(mut self) -> Self {
        for b in [
            &mut self.unknown,
            &mut self.constant,
            &mut self.chunked,
            &mut self.sliced,
            &mut self.zombie,
            &mut self.on_the_fly,
        ] {
            b.growth = finite_or(b.growth, 1.0).max(MIN_GAIN);
            b.shrink = finite_or(b.shrink, 1.0).max(MIN_GAIN);
        }
        self.empty.growth = finite_or(self.empty.growth, 1.0).max(0.0);
        self.empty.shrink = finite_or(self.empty.shrink, 0.0).max(0.0);
        self
    }

    pub fn for_pattern(&self, p: ActivityPattern) -> PatternBias {
        match p {
            ActivityPattern::Unknown => self.unknown,
            ActivityPattern::Constant => self.constant,
            ActivityPattern::Chunked => self.chunked,
            ActivityPattern::Sliced => self.sliced,
            ActivityPattern::Zombie => self.zombie,
            ActivityPattern::OnTheFly => self.on_the_fly,
            ActivityPattern::Empty => self.empty,
        }
    }
}

/// Tunables of [`AdaptiveStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTuning {
    pub min_delay: ModeTuning,
    pub max_coverage: ModeTuning,
    pub patterns: PatternBiases,
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            min_delay: ModeTuning {
                neutral: 0.5,
                max_growth: 0.25,
                max_shrink: 0.5,
            },
            max_coverage: ModeTuning {
                neutral: 0.9,
                max_growth: 1.0,
                max_shrink: 0.2,
            },
            patterns: PatternBiases::default(),
        }
    }
}

impl AdaptiveTuning {
    /// Keep gains in ranges where the factor stays positive and monotone.
    pub fn sanitized(mut self) -> Self {
        for m in [&mut self.min_delay, &mut self.max_coverage] {
            m.neutral = finite_or(m.neutral, 0.5).clamp(MIN_GAIN, 1.0 - MIN_GAIN);
            m.max_growth = finite_or(m.max_growth, 0.0).max(MIN_GAIN);
            m.max_shrink = finite_or(m.max_shrink, 0.0).clamp(MIN_GAIN, MAX_SHRINK);
        }
        self.patterns = self.patterns.sanitized();
        self
    }
}

/// No single step may shrink the interval by more than this share.
const MAX_SHRINK: f64 = 0.95;

/// Smallest gain a mode or non-EMPTY pattern may carry.
const MIN_GAIN: f64 = 0.01;

fn finite_or(x: f64, fallback: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        fallback
    }
}

/// Freshness-driven strategy.
#[derive(Debug, Clone)]
pub struct AdaptiveStrategy {
    tuning: AdaptiveTuning,
    bounds: IntervalBounds,
}

impl AdaptiveStrategy {
    pub fn new(tuning: AdaptiveTuning, bounds: IntervalBounds) -> Self {
        Self {
            tuning: tuning.sanitized(),
            bounds,
        }
    }

    /// Multiplicative factor applied to the current interval.
    pub fn factor(&self, pn_target: f64, mode: UpdateMode, pattern: ActivityPattern) -> f64 {
        let bias = self.tuning.patterns.for_pattern(pattern);
        let mode = if bias.force_max_coverage {
            UpdateMode::MaxCoverage
        } else {
            mode
        };
        let tuning = match mode {
            UpdateMode::MinDelay => self.tuning.min_delay,
            UpdateMode::MaxCoverage => self.tuning.max_coverage,
        };

        // NaN carries no information: treat like an unjudgeable poll.
        let p = if pn_target.is_nan() {
            1.0
        } else {
            pn_target.clamp(0.0, 1.0)
        };
        let growth = tuning.max_growth * bias.growth.max(0.0);
        let shrink = (tuning.max_shrink * bias.shrink.max(0.0)).min(MAX_SHRINK);
        let neutral = tuning.neutral;

        if p < neutral {
            1.0 + growth * (neutral - p) / neutral
        } else if p > neutral {
            1.0 - shrink * (p - neutral) / (1.0 - neutral)
        } else {
            1.0
        }
    }
}

impl UpdateStrategy for AdaptiveStrategy {
    fn next_interval(&self, input: &AdaptationInput) -> u32 {
        let current = self.bounds.clamp(input.current_interval);
        let f = self.factor(input.pn_target, input.mode, input.pattern);
        let scaled = f64::from(current) * f;

        // Round away from the current value so any real change moves at least
        // one minute; the mapping stays monotone in the factor.
        let next = if f > 1.0 {
            scaled.ceil()
        } else if f < 1.0 {
            scaled.floor()
        } else {
            f64::from(current)
        };
        self.bounds.clamp(next.clamp(0.0, f64::from(u32::MAX)) as u32)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}

/// Baseline: every source is polled at the same fixed interval.
#[derive(Debug, Clone)]
pub struct FixedStrategy {
    interval: u32,
}

impl FixedStrategy {
    pub fn new(interval: u32, bounds: IntervalBounds) -> Self {
        Self {
            interval: bounds.clamp(interval),
        }
    }
}

impl UpdateStrategy for FixedStrategy {
    fn next_interval(&self, _input: &AdaptationInput) -> u32 {
        self.interval
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}
