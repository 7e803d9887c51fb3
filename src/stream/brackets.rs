use crate::config::InstrumentPolicy;
use crate::models::Direction;
use crate::range::FrozenRange;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a locked range cannot produce brackets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoTradeReason {
    EmptyRange,
    ZeroWidthRange,
    EntriesRejected,
    NoFill,
    PastCutoff,
}

impl fmt::Display for NoTradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NoTradeReason::EmptyRange => "empty_range",
            NoTradeReason::ZeroWidthRange => "zero_width_range",
            NoTradeReason::EntriesRejected => "entries_rejected",
            NoTradeReason::NoFill => "no_fill",
            NoTradeReason::PastCutoff => "past_cutoff",
        };
        f.write_str(s)
    }
}

/// One side of the dual-direction bracket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketLeg {
    pub direction: Direction,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub breakeven_trigger: f64,
    pub breakeven_stop: f64,
    pub quantity: u32,
}

/// Both breakout legs plus the distances they were built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketPlan {
    pub long: BracketLeg,
    pub short: BracketLeg,
    pub range_size: f64,
    pub stop_distance: f64,
    pub target_distance: f64,
}

impl BracketPlan {
    pub fn leg(&self, direction: Direction) -> &BracketLeg {
        match direction {
            Direction::Long => &self.long,
            Direction::Short => &self.short,
        }
    }
}

/// Snap a price to the nearest multiple of `tick`
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    (price / tick).round() * tick
}

/// Compute both bracket legs from a frozen range
///
/// stop distance = min(range size, k * target distance)
pub fn compute_brackets(
    range: &FrozenRange,
    policy: &InstrumentPolicy,
) -> Result<BracketPlan, NoTradeReason> {
    let (high, low) = match (range.high, range.low) {
        (Some(high), Some(low)) => (high, low),
        _ => return Err(NoTradeReason::EmptyRange),
    };

    let tick = policy.tick_size;
    let range_size = round_to_tick(high - low, tick);
    if range_size < tick / 2.0 {
        return Err(NoTradeReason::ZeroWidthRange);
    }

    let target_distance = policy.target_distance;
    let stop_distance = round_to_tick(
        range_size.min(policy.stop_multiplier * target_distance),
        tick,
    );
    let be_distance = policy.breakeven_fraction * target_distance;
    let be_offset = policy.breakeven_offset_ticks as f64 * tick;

    let leg = |direction: Direction, entry: f64| {
        let sign = direction.sign();
        BracketLeg {
            direction,
            entry,
            stop: round_to_tick(entry - sign * stop_distance, tick),
            target: round_to_tick(entry + sign * target_distance, tick),
            breakeven_trigger: round_to_tick(entry + sign * be_distance, tick),
            breakeven_stop: round_to_tick(entry + sign * be_offset, tick),
            quantity: policy.quantity,
        }
    };

    Ok(BracketPlan {
        long: leg(Direction::Long, round_to_tick(high + tick, tick)),
        short: leg(Direction::Short, round_to_tick(low - tick, tick)),
        range_size,
        stop_distance,
        target_distance,
    })
}
