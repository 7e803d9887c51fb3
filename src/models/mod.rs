use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLC price bar for one instrument
///
/// Bars are transient: they are folded into a range and then dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn new(
        instrument: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp,
            open,
            high,
            low,
            close,
        }
    }
}

/// Single trade/quote price update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Price extremes seen since the previous update, from a bar or a tick
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
    pub last: f64,
}

impl From<&Bar> for PriceUpdate {
    fn from(bar: &Bar) -> Self {
        Self {
            instrument: bar.instrument.clone(),
            timestamp: bar.timestamp,
            high: bar.high,
            low: bar.low,
            last: bar.close,
        }
    }
}

impl From<&PriceTick> for PriceUpdate {
    fn from(tick: &PriceTick) -> Self {
        Self {
            instrument: tick.instrument.clone(),
            timestamp: tick.timestamp,
            high: tick.price,
            low: tick.price,
            last: tick.price,
        }
    }
}

/// Why a position (or a stream's exposure) was closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Target,
    Stop,
    BreakEvenStop,
    TimeCutoff,
    FailClosed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Target => "target",
            ExitReason::Stop => "stop",
            ExitReason::BreakEvenStop => "break_even_stop",
            ExitReason::TimeCutoff => "time_cutoff",
            ExitReason::FailClosed => "fail_closed",
        };
        f.write_str(s)
    }
}

/// Breakout direction of a bracket leg
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Side of the order that opens a position in this direction
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side of the orders that close a position in this direction
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    /// +1.0 for long, -1.0 for short
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Identity of a stream without its trading date: instrument, session, slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn new(instrument: &str, session: &str, slot: NaiveTime) -> Self {
        Self(format!("{}-{}-{}", instrument, session, slot.format("%H%M")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full key of a live stream instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub trading_date: NaiveDate,
    pub instrument: String,
    pub session: String,
    pub slot: NaiveTime,
}

impl StreamKey {
    pub fn new(
        trading_date: NaiveDate,
        instrument: impl Into<String>,
        session: impl Into<String>,
        slot: NaiveTime,
    ) -> Self {
        Self {
            trading_date,
            instrument: instrument.into(),
            session: session.into(),
            slot,
        }
    }

    pub fn id(&self) -> StreamId {
        StreamId::new(&self.instrument, &self.session, self.slot)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id(), self.trading_date)
    }
}
