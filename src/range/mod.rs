// Pre-lock high/low aggregation for one stream
use crate::models::Bar;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RangeError {
    #[error("range for {0} already frozen")]
    AlreadyFrozen(String),
}

/// Why a bar was not folded into the range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeRejection {
    BeforeWindowStart,
    AfterWindowEnd,
    DuplicateTimestamp,
    WrongInstrument,
    InvalidBar,
    Frozen,
}

impl RangeRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeRejection::BeforeWindowStart => "before_window_start",
            RangeRejection::AfterWindowEnd => "after_window_end",
            RangeRejection::DuplicateTimestamp => "duplicate_timestamp",
            RangeRejection::WrongInstrument => "wrong_instrument",
            RangeRejection::InvalidBar => "invalid_bar",
            RangeRejection::Frozen => "frozen",
        }
    }
}

impl fmt::Display for RangeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObserveOutcome {
    Accepted,
    Rejected(RangeRejection),
}

/// Running view of the range; high/low are `None` until a bar arrives
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeSnapshot {
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub bar_count: usize,
}

/// Immutable range captured at lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenRange {
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub bar_count: usize,
    pub expected_bars: usize,
    pub window_start: DateTime<Utc>,
    pub lock: DateTime<Utc>,
}

impl FrozenRange {
    /// received / expected, capped at 1.0
    pub fn completeness(&self) -> f64 {
        if self.expected_bars == 0 {
            return 1.0;
        }
        (self.bar_count as f64 / self.expected_bars as f64).min(1.0)
    }

    /// high - low, or `None` when no bar was observed
    pub fn size(&self) -> Option<f64> {
        match (self.high, self.low) {
            (Some(high), Some(low)) => Some(high - low),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bar_count == 0
    }
}

/// Folds in-window bars into a running high/low until frozen
#[derive(Debug, Clone)]
pub struct RangeBuilder {
    instrument: String,
    window_start: DateTime<Utc>,
    lock: DateTime<Utc>,
    bar_interval: Duration,
    high: Option<f64>,
    low: Option<f64>,
    seen: BTreeSet<DateTime<Utc>>,
    frozen: Option<FrozenRange>,
}

impl RangeBuilder {
    pub fn new(
        instrument: impl Into<String>,
        window_start: DateTime<Utc>,
        lock: DateTime<Utc>,
        bar_interval: Duration,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            window_start,
            lock,
            bar_interval,
            high: None,
            low: None,
            seen: BTreeSet::new(),
            frozen: None,
        }
    }

    /// Fold a bar into the range if it lies in `[window_start, lock)`
    pub fn observe(&mut self, bar: &Bar) -> ObserveOutcome {
        if self.frozen.is_some() {
            tracing::debug!(
                instrument = %self.instrument,
                ts = %bar.timestamp,
                "Bar offered to frozen range, ignored"
            );
            return ObserveOutcome::Rejected(RangeRejection::Frozen);
        }
        if bar.instrument != self.instrument {
            return ObserveOutcome::Rejected(RangeRejection::WrongInstrument);
        }
        if !bar.high.is_finite() || !bar.low.is_finite() || bar.high < bar.low {
            tracing::warn!(
                instrument = %self.instrument,
                ts = %bar.timestamp,
                high = bar.high,
                low = bar.low,
                "Invalid bar rejected"
            );
            return ObserveOutcome::Rejected(RangeRejection::InvalidBar);
        }
        if bar.timestamp < self.window_start {
            return ObserveOutcome::Rejected(RangeRejection::BeforeWindowStart);
        }
        if bar.timestamp >= self.lock {
            return ObserveOutcome::Rejected(RangeRejection::AfterWindowEnd);
        }
        if !self.seen.insert(bar.timestamp) {
            return ObserveOutcome::Rejected(RangeRejection::DuplicateTimestamp);
        }

        self.high = Some(self.high.map_or(bar.high, |h| h.max(bar.high)));
        self.low = Some(self.low.map_or(bar.low, |l| l.min(bar.low)));

        ObserveOutcome::Accepted
    }

    pub fn snapshot(&self) -> RangeSnapshot {
        RangeSnapshot {
            high: self.high,
            low: self.low,
            bar_count: self.seen.len(),
        }
    }

    /// Number of bars a gap-free window would contain
    pub fn expected_bars(&self) -> usize {
        let interval = self.bar_interval.num_seconds();
        if interval <= 0 {
            return 0;
        }
        let window = (self.lock - self.window_start).num_seconds().max(0);
        ((window + interval - 1) / interval) as usize
    }

    pub fn completeness(&self) -> f64 {
        let expected = self.expected_bars();
        if expected == 0 {
            return 1.0;
        }
        (self.seen.len() as f64 / expected as f64).min(1.0)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Freeze the range; later `observe` calls become no-ops
    pub fn freeze(&mut self) -> Result<FrozenRange, RangeError> {
        if self.frozen.is_some() {
            return Err(RangeError::AlreadyFrozen(self.instrument.clone()));
        }

        let frozen = FrozenRange {
            high: self.high,
            low: self.low,
            bar_count: self.seen.len(),
            expected_bars: self.expected_bars(),
            window_start: self.window_start,
            lock: self.lock,
        };
        self.frozen = Some(frozen.clone());
        Ok(frozen)
    }

    pub fn frozen(&self) -> Option<&FrozenRange> {
        self.frozen.as_ref()
    }
}
