use crate::models::Bar;
use crate::stream::round_to_tick;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Intraday shapes for synthetic session data
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SessionScenario {
    /// Quiet range, then a sustained move up after the breakout time
    BreakoutUp,
    /// Quiet range, then a sustained move down
    BreakoutDown,
    /// Mean-reverting chop all day
    Choppy,
    /// Breakout up with roughly one bar in ten missing
    WithGaps,
}

/// Seeded bar generator for one instrument
pub struct SessionBarGenerator {
    rng: StdRng,
    instrument: String,
    base_price: f64,
    tick_size: f64,
}

impl SessionBarGenerator {
    pub fn new(seed: u64, instrument: impl Into<String>, base_price: f64, tick_size: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            instrument: instrument.into(),
            base_price,
            tick_size,
        }
    }

    /// Bars from `start` (inclusive) to `end` (exclusive)
    ///
    /// Before `breakout_at` the walk is mean-reverting around the base
    /// price; afterwards the scenario's drift takes over.
    pub fn generate(
        &mut self,
        scenario: SessionScenario,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
        breakout_at: DateTime<Utc>,
    ) -> Vec<Bar> {
        let mut bars = Vec::new();
        let mut price = self.base_price;
        let mut ts = start;

        // Per-bar drift after the breakout, as a fraction of price
        let drift = match scenario {
            SessionScenario::BreakoutUp | SessionScenario::WithGaps => 0.0006,
            SessionScenario::BreakoutDown => -0.0006,
            SessionScenario::Choppy => 0.0,
        };

        while ts < end {
            let trending = ts >= breakout_at && scenario != SessionScenario::Choppy;
            let step = if trending {
                price * (drift + self.rng.gen_range(-0.0002..0.0002))
            } else {
                let reversion = (self.base_price - price) * 0.2;
                reversion + price * self.rng.gen_range(-0.0008..0.0008)
            };
            price += step;

            let skip = scenario == SessionScenario::WithGaps && self.rng.gen_bool(0.1);
            if !skip {
                bars.push(self.create_bar(price, ts));
            }
            ts += interval;
        }

        bars
    }

    fn create_bar(&mut self, price: f64, timestamp: DateTime<Utc>) -> Bar {
        let noise_pct = 0.0005;
        let high = price * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = price * (1.0 - self.rng.gen_range(0.0..noise_pct));
        let open = (price * (1.0 + self.rng.gen_range(-noise_pct..noise_pct))).clamp(low, high);

        let tick = self.tick_size;
        let high = round_to_tick(high, tick);
        let low = round_to_tick(low, tick);
        Bar::new(
            self.instrument.clone(),
            timestamp,
            round_to_tick(open, tick).clamp(low, high),
            high,
            low,
            round_to_tick(price, tick).clamp(low, high),
        )
    }
}

/// Merge per-instrument bar series into one time-ordered feed
pub fn merge_feeds(feeds: Vec<Vec<Bar>>) -> Vec<Bar> {
    let mut all: Vec<Bar> = feeds.into_iter().flatten().collect();
    all.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.instrument.cmp(&b.instrument))
    });
    all
}
