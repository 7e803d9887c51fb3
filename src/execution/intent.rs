use crate::models::{Direction, StreamId, StreamKey};
use crate::stream::BracketLeg;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic idempotency key
///
/// BLAKE3 over a canonical rendering of the defining attributes, so the same
/// intent produces the same key across restarts and builds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    fn from_canonical(canonical: &str) -> Self {
        Self(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    /// Key of the "range locked" record for one stream on one date
    pub fn for_range_lock(trading_date: NaiveDate, stream: &StreamId) -> Self {
        Self::from_canonical(&format!("range_lock|{}|{}", trading_date, stream))
    }

    /// Key of a stream-level flatten issued outside any intent
    pub fn for_stream_event(trading_date: NaiveDate, stream: &StreamId, kind: &str) -> Self {
        Self::from_canonical(&format!("{}|{}|{}", kind, trading_date, stream))
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// A proposed entry order with its protective levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub fingerprint: Fingerprint,
    pub trading_date: NaiveDate,
    pub stream: StreamId,
    pub instrument: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub breakeven_trigger: f64,
    pub breakeven_stop: f64,
    pub quantity: u32,
}

impl Intent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trading_date: NaiveDate,
        stream: StreamId,
        instrument: impl Into<String>,
        direction: Direction,
        entry_price: f64,
        stop_price: Option<f64>,
        target_price: Option<f64>,
        breakeven_trigger: f64,
        breakeven_stop: f64,
        quantity: u32,
    ) -> Self {
        let instrument = instrument.into();
        let fingerprint = Self::fingerprint_of(
            trading_date,
            &stream,
            &instrument,
            direction,
            entry_price,
            stop_price,
            target_price,
            breakeven_trigger,
        );
        Self {
            fingerprint,
            trading_date,
            stream,
            instrument,
            direction,
            entry_price,
            stop_price,
            target_price,
            breakeven_trigger,
            breakeven_stop,
            quantity,
        }
    }

    /// Build the intent for one bracket leg of a stream
    pub fn from_leg(key: &StreamKey, leg: &BracketLeg) -> Self {
        Self::new(
            key.trading_date,
            key.id(),
            key.instrument.clone(),
            leg.direction,
            leg.entry,
            Some(leg.stop),
            Some(leg.target),
            leg.breakeven_trigger,
            leg.breakeven_stop,
            leg.quantity,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn fingerprint_of(
        trading_date: NaiveDate,
        stream: &StreamId,
        instrument: &str,
        direction: Direction,
        entry: f64,
        stop: Option<f64>,
        target: Option<f64>,
        breakeven_trigger: f64,
    ) -> Fingerprint {
        // Fixed precision so float noise below 1e-8 never changes the key
        let price = |p: Option<f64>| p.map_or_else(|| "none".to_string(), |v| format!("{:.8}", v));
        let canonical = format!(
            "intent|{}|{}|{}|{}|{}|{}|{}|{}",
            trading_date,
            stream,
            instrument,
            direction,
            price(Some(entry)),
            price(stop),
            price(target),
            price(Some(breakeven_trigger)),
        );
        Fingerprint::from_canonical(&canonical)
    }

    /// Both protective legs are present and usable
    pub fn has_bracket_legs(&self) -> bool {
        matches!(self.stop_price, Some(p) if p.is_finite())
            && matches!(self.target_price, Some(p) if p.is_finite())
    }
}
