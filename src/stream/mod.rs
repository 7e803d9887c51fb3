// Per-stream lifecycle: range building, lock, bracket emission, supervision
pub mod brackets;

pub use brackets::{compute_brackets, round_to_tick, BracketLeg, BracketPlan, NoTradeReason};

use crate::clock::{ClockError, SessionClock, SessionTimes};
use crate::config::{InstrumentPolicy, StreamSpec};
use crate::execution::{Intent, OrderId};
use crate::models::{Bar, Direction, ExitReason, StreamId, StreamKey};
use crate::range::{FrozenRange, ObserveOutcome, RangeBuilder, RangeSnapshot};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("cannot activate stream {stream}: {source}")]
    Clock {
        stream: StreamId,
        #[source]
        source: ClockError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Inactive,
    AwaitingData,
    Armed,
    RangeBuilding,
    RangeLocked,
    Complete,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Inactive => "INACTIVE",
            StreamState::AwaitingData => "AWAITING_DATA",
            StreamState::Armed => "ARMED",
            StreamState::RangeBuilding => "RANGE_BUILDING",
            StreamState::RangeLocked => "RANGE_LOCKED",
            StreamState::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

/// How a stream finished its day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Completion {
    Exited { reason: ExitReason },
    Cutoff,
    NoTrade { reason: NoTradeReason },
    FailClosed { detail: String },
}

/// Work the engine must carry out on behalf of a stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    RequestBackfill {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Journal the frozen range (and brackets, if tradable)
    Locked {
        range: FrozenRange,
        plan: Option<BracketPlan>,
    },
    SubmitIntents {
        intents: Vec<Intent>,
    },
    /// Cancel working orders and close any open quantity
    ForceFlatten,
}

/// Order handles of the protective pair currently guarding the position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveHandles {
    pub stop_order: OrderId,
    pub target_order: OrderId,
    pub quantity: u32,
}

/// Read-only view for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub stream: StreamId,
    pub trading_date: NaiveDate,
    pub state: StreamState,
    pub window_start: DateTime<Utc>,
    pub lock: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub range: RangeSnapshot,
    pub completeness: f64,
    pub brackets: Option<BracketPlan>,
    pub entries_submitted: bool,
    pub position: Option<Direction>,
    pub filled_qty: u32,
    pub breakeven_applied: bool,
    pub protective: Option<ProtectiveHandles>,
    pub restored: bool,
    pub completion: Option<Completion>,
}

pub struct Stream {
    key: StreamKey,
    id: StreamId,
    policy: Arc<InstrumentPolicy>,
    times: SessionTimes,
    backfill_timeout: Duration,
    bar_interval: Duration,
    state: StreamState,
    builder: RangeBuilder,
    range: Option<FrozenRange>,
    plan: Option<BracketPlan>,
    awaiting_since: Option<DateTime<Utc>>,
    entries_submitted: bool,
    position: Option<Direction>,
    filled_qty: u32,
    protective: Option<ProtectiveHandles>,
    breakeven_applied: bool,
    exit_reason: Option<ExitReason>,
    rejected: Vec<Direction>,
    restored: bool,
    completion: Option<Completion>,
}

impl Stream {
    pub fn new(
        key: StreamKey,
        policy: Arc<InstrumentPolicy>,
        times: SessionTimes,
        bar_interval: Duration,
        backfill_timeout: Duration,
    ) -> Self {
        let builder = RangeBuilder::new(
            key.instrument.clone(),
            times.window_start.utc,
            times.lock.utc,
            bar_interval,
        );
        Self {
            id: key.id(),
            key,
            policy,
            times,
            backfill_timeout,
            bar_interval,
            state: StreamState::Inactive,
            builder,
            range: None,
            plan: None,
            awaiting_since: None,
            entries_submitted: false,
            position: None,
            filled_qty: 0,
            protective: None,
            breakeven_applied: false,
            exit_reason: None,
            rejected: Vec::new(),
            restored: false,
            completion: None,
        }
    }

    /// Resolve the session times for `date` and build an inactive stream
    pub fn from_spec(
        date: NaiveDate,
        spec: &StreamSpec,
        clock: &SessionClock,
        bar_interval: Duration,
        backfill_timeout: Duration,
    ) -> Result<Self, StreamError> {
        let key = StreamKey::new(date, spec.policy.symbol.clone(), spec.session.clone(), spec.slot);
        let times = clock
            .session_times(date, spec.range_start, spec.slot, spec.cutoff)
            .map_err(|source| StreamError::Clock {
                stream: key.id(),
                source,
            })?;
        Ok(Self::new(key, spec.policy.clone(), times, bar_interval, backfill_timeout))
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn instrument(&self) -> &str {
        &self.key.instrument
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn times(&self) -> &SessionTimes {
        &self.times
    }

    pub fn policy(&self) -> &InstrumentPolicy {
        &self.policy
    }

    pub fn range_snapshot(&self) -> RangeSnapshot {
        self.builder.snapshot()
    }

    pub fn frozen_range(&self) -> Option<&FrozenRange> {
        self.range.as_ref()
    }

    pub fn brackets(&self) -> Option<&BracketPlan> {
        self.plan.as_ref()
    }

    pub fn entries_submitted(&self) -> bool {
        self.entries_submitted
    }

    pub fn filled_qty(&self) -> u32 {
        self.filled_qty
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.state == StreamState::Complete
    }

    fn transition(&mut self, next: StreamState) {
        tracing::info!(
            stream = %self.id,
            date = %self.key.trading_date,
            from = %self.state,
            to = %next,
            "Stream transition"
        );
        self.state = next;
    }

    fn complete(&mut self, completion: Completion) {
        tracing::info!(
            stream = %self.id,
            completion = ?completion,
            filled_qty = self.filled_qty,
            "Stream complete"
        );
        self.completion = Some(completion);
        self.transition(StreamState::Complete);
    }

    /// INACTIVE -> AWAITING_DATA, requesting history for the part of the
    /// window that already elapsed
    pub fn activate(&mut self, now: DateTime<Utc>) -> Vec<StreamAction> {
        if self.state != StreamState::Inactive {
            return Vec::new();
        }

        if now >= self.times.cutoff.utc {
            self.complete(Completion::NoTrade {
                reason: NoTradeReason::PastCutoff,
            });
            return Vec::new();
        }

        self.transition(StreamState::AwaitingData);
        self.awaiting_since = Some(now);

        if now <= self.times.window_start.utc {
            // Nothing has happened yet, so there is nothing to backfill
            self.transition(StreamState::Armed);
            return self.advance(now);
        }

        let mut actions = vec![StreamAction::RequestBackfill {
            start: self.times.window_start.utc,
            end: now.min(self.times.lock.utc),
        }];
        actions.extend(self.advance(now));
        actions
    }

    /// Jump straight to RANGE_LOCKED from a journalled lock
    pub fn restore_locked(
        &mut self,
        range: FrozenRange,
        plan: Option<BracketPlan>,
        entries_submitted: bool,
    ) {
        tracing::info!(
            stream = %self.id,
            high = ?range.high,
            low = ?range.low,
            bars = range.bar_count,
            entries_submitted,
            "Restoring locked range from journal"
        );
        self.restored = true;
        self.range = Some(range);
        self.entries_submitted = entries_submitted;
        match plan {
            Some(plan) => {
                self.plan = Some(plan);
                self.transition(StreamState::RangeLocked);
            }
            None => {
                let reason = match self.range.as_ref() {
                    Some(r) if r.is_empty() => NoTradeReason::EmptyRange,
                    _ => NoTradeReason::ZeroWidthRange,
                };
                self.complete(Completion::NoTrade { reason });
            }
        }
    }

    /// Historical bars arrived for the elapsed part of the window
    pub fn on_backfill(&mut self, bars: &[Bar], now: DateTime<Utc>) -> Vec<StreamAction> {
        if self.state != StreamState::AwaitingData {
            tracing::debug!(stream = %self.id, state = %self.state, "Late backfill ignored");
            return Vec::new();
        }

        let accepted = bars
            .iter()
            .filter(|bar| self.builder.observe(bar) == ObserveOutcome::Accepted)
            .count();

        tracing::info!(
            stream = %self.id,
            received = bars.len(),
            accepted,
            completeness = self.builder.completeness(),
            "Backfill complete"
        );

        self.transition(StreamState::Armed);
        self.advance(now)
    }

    /// Backfill failed or timed out: continue with whatever the live feed gives
    pub fn on_backfill_failed(&mut self, reason: &str, now: DateTime<Utc>) -> Vec<StreamAction> {
        if self.state != StreamState::AwaitingData {
            return Vec::new();
        }

        tracing::warn!(
            stream = %self.id,
            reason,
            completeness = self.builder.completeness(),
            "Backfill unavailable, proceeding with reduced completeness"
        );

        self.transition(StreamState::Armed);
        self.advance(now)
    }

    /// Feed a live bar into the range (only before lock)
    pub fn on_bar(&mut self, bar: &Bar) {
        if !matches!(
            self.state,
            StreamState::AwaitingData | StreamState::Armed | StreamState::RangeBuilding
        ) {
            return;
        }

        if let ObserveOutcome::Rejected(reason) = self.builder.observe(bar) {
            tracing::trace!(
                stream = %self.id,
                ts = %bar.timestamp,
                reason = %reason,
                "Bar not added to range"
            );
        }
    }

    /// Re-evaluate every time guard against `now`
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<StreamAction> {
        let mut actions = Vec::new();

        loop {
            let before = self.state;
            match self.state {
                StreamState::Inactive | StreamState::Complete => {}
                StreamState::AwaitingData => {
                    let waited = self
                        .awaiting_since
                        .map(|since| now - since)
                        .unwrap_or_else(Duration::zero);
                    // Bar-driven time moves a whole interval at once, so the
                    // bar that activated the stream cannot expire its own request
                    if waited > self.backfill_timeout.max(self.bar_interval) {
                        actions.extend(self.on_backfill_failed("timeout", now));
                        return actions;
                    }
                }
                StreamState::Armed => {
                    if now >= self.times.window_start.utc {
                        self.transition(StreamState::RangeBuilding);
                    }
                }
                StreamState::RangeBuilding => {
                    if now >= self.times.lock.utc {
                        actions.extend(self.lock(now));
                    }
                }
                StreamState::RangeLocked => {
                    if now >= self.times.cutoff.utc && !self.entries_submitted {
                        self.complete(Completion::NoTrade {
                            reason: NoTradeReason::PastCutoff,
                        });
                    } else if now >= self.times.cutoff.utc {
                        let completion = match self.exit_reason {
                            Some(reason) => Completion::Exited { reason },
                            None => Completion::Cutoff,
                        };
                        self.complete(completion);
                        actions.push(StreamAction::ForceFlatten);
                    } else if !self.entries_submitted {
                        // Lock was journalled but the entries never were
                        if let Some(intents) = self.take_entry_submission() {
                            actions.push(StreamAction::SubmitIntents { intents });
                        }
                    }
                }
            }
            if self.state == before {
                break;
            }
        }

        actions
    }

    fn lock(&mut self, now: DateTime<Utc>) -> Vec<StreamAction> {
        let range = match self.builder.freeze() {
            Ok(range) => range,
            Err(e) => {
                tracing::error!(stream = %self.id, error = %e, "Range freeze failed");
                return Vec::new();
            }
        };

        if range.completeness() < 0.5 {
            tracing::warn!(
                stream = %self.id,
                bars = range.bar_count,
                expected = range.expected_bars,
                completeness = range.completeness(),
                "Range locked with low completeness"
            );
        }

        self.range = Some(range.clone());

        match compute_brackets(&range, &self.policy) {
            Ok(plan) => {
                tracing::info!(
                    stream = %self.id,
                    high = ?range.high,
                    low = ?range.low,
                    long_entry = plan.long.entry,
                    short_entry = plan.short.entry,
                    stop_distance = plan.stop_distance,
                    "Range locked"
                );
                self.plan = Some(plan.clone());
                self.transition(StreamState::RangeLocked);

                let mut actions = vec![StreamAction::Locked {
                    range,
                    plan: Some(plan),
                }];
                // A single jump past the cutoff (feed gap, rollover) locks the
                // range for the record but must not put entries at the venue
                if now >= self.times.cutoff.utc {
                    tracing::warn!(stream = %self.id, now = %now, "Range locked after cutoff, entries withheld");
                    self.complete(Completion::NoTrade {
                        reason: NoTradeReason::PastCutoff,
                    });
                    return actions;
                }
                if let Some(intents) = self.take_entry_submission() {
                    actions.push(StreamAction::SubmitIntents { intents });
                }
                actions
            }
            Err(reason) => {
                tracing::warn!(stream = %self.id, reason = %reason, "Range locked, cannot trade");
                self.complete(Completion::NoTrade { reason });
                vec![StreamAction::Locked { range, plan: None }]
            }
        }
    }

    /// Hand out both bracket intents exactly once per stream
    pub fn take_entry_submission(&mut self) -> Option<Vec<Intent>> {
        if self.entries_submitted {
            tracing::warn!(
                stream = %self.id,
                "Entry submission already made for this stream, suppressed"
            );
            return None;
        }
        if self.state != StreamState::RangeLocked {
            return None;
        }
        let plan = self.plan.as_ref()?;
        self.entries_submitted = true;
        Some(vec![
            Intent::from_leg(&self.key, &plan.long),
            Intent::from_leg(&self.key, &plan.short),
        ])
    }

    pub fn record_entry_fill(&mut self, direction: Direction, filled_qty: u32) {
        self.position = Some(direction);
        self.filled_qty = filled_qty;
    }

    pub fn record_protective(&mut self, handles: ProtectiveHandles) {
        self.protective = Some(handles);
    }

    pub fn record_breakeven(&mut self) {
        self.breakeven_applied = true;
    }

    pub fn record_exit(&mut self, reason: ExitReason) {
        self.exit_reason = Some(reason);
        self.protective = None;
    }

    pub fn record_entry_rejected(&mut self, direction: Direction) {
        if !self.rejected.contains(&direction) {
            self.rejected.push(direction);
        }
    }

    /// Fail-closed: no further activity for this stream today
    pub fn stand_down(&mut self, detail: impl Into<String>) {
        if self.state == StreamState::Complete {
            return;
        }
        let detail = detail.into();
        tracing::error!(stream = %self.id, detail = %detail, "Stream stood down");
        self.complete(Completion::FailClosed { detail });
    }

    /// RANGE_LOCKED -> COMPLETE once flat with nothing working
    pub fn settle(&mut self, open_qty: u32, working_orders: usize) {
        if self.state != StreamState::RangeLocked || !self.entries_submitted {
            return;
        }
        if open_qty > 0 || working_orders > 0 {
            return;
        }

        let completion = match self.exit_reason {
            Some(reason) => Completion::Exited { reason },
            None if self.rejected.len() == 2 => Completion::NoTrade {
                reason: NoTradeReason::EntriesRejected,
            },
            None => Completion::NoTrade {
                reason: NoTradeReason::NoFill,
            },
        };
        self.complete(completion);
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            stream: self.id.clone(),
            trading_date: self.key.trading_date,
            state: self.state,
            window_start: self.times.window_start.utc,
            lock: self.times.lock.utc,
            cutoff: self.times.cutoff.utc,
            range: match &self.range {
                Some(r) => RangeSnapshot {
                    high: r.high,
                    low: r.low,
                    bar_count: r.bar_count,
                },
                None => self.builder.snapshot(),
            },
            completeness: match &self.range {
                Some(r) => r.completeness(),
                None => self.builder.completeness(),
            },
            brackets: self.plan.clone(),
            entries_submitted: self.entries_submitted,
            position: self.position,
            filled_qty: self.filled_qty,
            breakeven_applied: self.breakeven_applied,
            protective: self.protective.clone(),
            restored: self.restored,
            completion: self.completion.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    fn policy() -> Arc<InstrumentPolicy> {
        Arc::new(InstrumentPolicy {
            symbol: "GC".to_string(),
            tick_size: 0.1,
            quantity: 1,
            target_distance: 10.0,
            stop_multiplier: 3.0,
            breakeven_fraction: 0.65,
            breakeven_offset_ticks: 1,
        })
    }

    fn stream() -> Stream {
        let spec = StreamSpec {
            policy: policy(),
            session: "S1".to_string(),
            range_start: hm(7, 0),
            slot: hm(8, 0),
            cutoff: hm(12, 0),
        };
        let clock = SessionClock::from_name("America/Chicago").unwrap();
        Stream::from_spec(date(), &spec, &clock, Duration::minutes(5), Duration::seconds(30))
            .unwrap()
    }

    // 07:00 CDT on 2026-03-09
    fn window_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
    }

    fn bar(minutes: i64, high: f64, low: f64) -> Bar {
        Bar::new("GC", window_start() + Duration::minutes(minutes), low, high, low, high)
    }

    #[test]
    fn test_activation_before_window_arms_directly() {
        let mut s = stream();
        let actions = s.activate(window_start() - Duration::hours(1));
        assert!(actions.is_empty());
        assert_eq!(s.state(), StreamState::Armed);
    }

    #[test]
    fn test_activation_mid_window_requests_backfill() {
        let mut s = stream();
        let now = window_start() + Duration::minutes(20);
        let actions = s.activate(now);
        assert_eq!(
            actions,
            vec![StreamAction::RequestBackfill {
                start: window_start(),
                end: now
            }]
        );
        assert_eq!(s.state(), StreamState::AwaitingData);

        let history = vec![bar(0, 2660.0, 2655.0), bar(5, 2662.0, 2654.0)];
        s.on_backfill(&history, now);
        assert_eq!(s.state(), StreamState::RangeBuilding);
        assert_eq!(s.range_snapshot().bar_count, 2);
    }

    #[test]
    fn test_backfill_timeout_proceeds() {
        let mut s = stream();
        let now = window_start() + Duration::minutes(20);
        s.activate(now);
        s.advance(now + Duration::minutes(5));
        assert_eq!(s.state(), StreamState::AwaitingData);
        s.advance(now + Duration::minutes(5) + Duration::seconds(1));
        assert_eq!(s.state(), StreamState::RangeBuilding);

        // Late completion is ignored
        assert!(s.on_backfill(&[bar(0, 1.0, 1.0)], now).is_empty());
        assert_eq!(s.range_snapshot().bar_count, 0);
    }

    #[test]
    fn test_lock_emits_both_intents_once() {
        let mut s = stream();
        s.activate(window_start() - Duration::minutes(1));
        s.advance(window_start());
        assert_eq!(s.state(), StreamState::RangeBuilding);

        s.on_bar(&bar(0, 2674.6, 2660.0));
        s.on_bar(&bar(5, 2670.0, 2652.5));

        let actions = s.advance(window_start() + Duration::hours(1));
        assert_eq!(s.state(), StreamState::RangeLocked);
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], StreamAction::Locked { plan: Some(_), .. }));
        match &actions[1] {
            StreamAction::SubmitIntents { intents } => {
                assert_eq!(intents.len(), 2);
                assert_eq!(intents[0].direction, Direction::Long);
                assert_eq!(intents[1].direction, Direction::Short);
            }
            other => panic!("unexpected action {:?}", other),
        }

        // A late re-detection is gated by the flag
        assert!(s.take_entry_submission().is_none());
        assert!(s.advance(window_start() + Duration::minutes(61)).is_empty());
    }

    #[test]
    fn test_empty_range_completes_without_trading() {
        let mut s = stream();
        s.activate(window_start() - Duration::minutes(1));
        let actions = s.advance(window_start() + Duration::hours(2));
        assert_eq!(s.state(), StreamState::Complete);
        assert_eq!(
            s.completion(),
            Some(&Completion::NoTrade {
                reason: NoTradeReason::EmptyRange
            })
        );
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], StreamAction::Locked { plan: None, .. }));
    }

    #[test]
    fn test_engine_start_after_lock_locks_from_history() {
        let mut s = stream();
        let now = window_start() + Duration::minutes(90);
        let actions = s.activate(now);
        assert_eq!(
            actions,
            vec![StreamAction::RequestBackfill {
                start: window_start(),
                end: window_start() + Duration::hours(1),
            }]
        );

        let history = vec![bar(0, 2674.6, 2660.0), bar(30, 2670.0, 2652.5)];
        let actions = s.on_backfill(&history, now);
        assert_eq!(s.state(), StreamState::RangeLocked);
        assert_eq!(actions.len(), 2);
        let range = s.frozen_range().unwrap();
        assert_eq!(range.high, Some(2674.6));
        assert_eq!(range.low, Some(2652.5));
    }

    #[test]
    fn test_post_lock_bars_are_ignored() {
        let mut s = stream();
        s.activate(window_start() - Duration::minutes(1));
        s.on_bar(&bar(0, 2674.6, 2652.5));
        s.advance(window_start() + Duration::hours(1));
        let locked = s.frozen_range().cloned();

        s.on_bar(&bar(65, 3000.0, 2000.0));
        assert_eq!(s.frozen_range().cloned(), locked);
    }

    #[test]
    fn test_cutoff_forces_flatten() {
        let mut s = stream();
        s.activate(window_start() - Duration::minutes(1));
        s.on_bar(&bar(0, 2674.6, 2652.5));
        s.advance(window_start() + Duration::hours(1));

        let actions = s.advance(window_start() + Duration::hours(5));
        assert_eq!(actions, vec![StreamAction::ForceFlatten]);
        assert_eq!(s.completion(), Some(&Completion::Cutoff));
    }

    #[test]
    fn test_jump_past_cutoff_locks_without_entries() {
        let mut s = stream();
        s.activate(window_start() - Duration::minutes(1));
        s.advance(window_start());
        s.on_bar(&bar(0, 2674.6, 2652.5));

        // One event carries time from inside the window to after cutoff
        let actions = s.advance(window_start() + Duration::hours(5) + Duration::minutes(30));
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], StreamAction::Locked { plan: Some(_), .. }));
        assert!(!s.entries_submitted());
        assert_eq!(
            s.completion(),
            Some(&Completion::NoTrade {
                reason: NoTradeReason::PastCutoff
            })
        );
        assert!(s.take_entry_submission().is_none());
    }

    #[test]
    fn test_restored_lock_without_entries_past_cutoff() {
        let mut original = stream();
        original.activate(window_start() - Duration::minutes(1));
        original.on_bar(&bar(0, 2674.6, 2652.5));
        original.advance(window_start() + Duration::hours(6));
        let range = original.frozen_range().cloned().unwrap();
        let plan = original.brackets().cloned();

        let mut restored = stream();
        restored.restore_locked(range, plan, false);
        let actions = restored.advance(window_start() + Duration::hours(6));
        assert!(actions.is_empty());
        assert_eq!(
            restored.completion(),
            Some(&Completion::NoTrade {
                reason: NoTradeReason::PastCutoff
            })
        );
    }

    #[test]
    fn test_settle_after_exit() {
        let mut s = stream();
        s.activate(window_start() - Duration::minutes(1));
        s.on_bar(&bar(0, 2674.6, 2652.5));
        s.advance(window_start() + Duration::hours(1));

        s.record_entry_fill(Direction::Long, 1);
        s.settle(1, 2);
        assert_eq!(s.state(), StreamState::RangeLocked);

        s.record_exit(ExitReason::Target);
        s.settle(0, 0);
        assert_eq!(
            s.completion(),
            Some(&Completion::Exited {
                reason: ExitReason::Target
            })
        );
    }

    #[test]
    fn test_restore_skips_range_building() {
        let mut original = stream();
        original.activate(window_start() - Duration::minutes(1));
        original.on_bar(&bar(0, 2674.6, 2652.5));
        original.advance(window_start() + Duration::hours(1));
        let range = original.frozen_range().cloned().unwrap();
        let plan = original.brackets().cloned();

        let mut restored = stream();
        restored.restore_locked(range.clone(), plan.clone(), true);
        assert_eq!(restored.state(), StreamState::RangeLocked);
        assert_eq!(restored.frozen_range(), Some(&range));
        assert_eq!(restored.brackets(), plan.as_ref());

        // Activation is a no-op once restored
        assert!(restored.activate(window_start() + Duration::minutes(70)).is_empty());
        assert_eq!(restored.state(), StreamState::RangeLocked);
    }

    #[test]
    fn test_stand_down_is_terminal() {
        let mut s = stream();
        s.activate(window_start() - Duration::minutes(1));
        s.stand_down("unmapped fill");
        assert!(s.is_complete());
        assert!(matches!(s.completion(), Some(Completion::FailClosed { .. })));
        assert!(s.advance(window_start() + Duration::hours(1)).is_empty());
    }

    #[test]
    fn test_clock_gap_fails_activation() {
        let spec = StreamSpec {
            policy: policy(),
            session: "S1".to_string(),
            range_start: hm(2, 30),
            slot: hm(7, 30),
            cutoff: hm(12, 0),
        };
        let clock = SessionClock::from_name("America/Chicago").unwrap();
        let result = Stream::from_spec(
            NaiveDate::from_ymd_opt(2026, 3, 8).unwrap(),
            &spec,
            &clock,
            Duration::minutes(5),
            Duration::seconds(30),
        );
        assert!(matches!(result, Err(StreamError::Clock { .. })));
    }
}
