// Single-threaded dispatch: every event is applied to completion before the next
mod replay;

pub use replay::run_feed;

use crate::backfill::BackfillRequest;
use crate::clock::SessionClock;
use crate::config::{ConfigError, EngineConfig, StreamSpec};
use crate::execution::{
    CoordinatorEffect, ExecutionCoordinator, GatewayEvent, IntentExposure, OrderGateway,
};
use crate::journal::{ExecutionJournal, JournalError};
use crate::models::{Bar, ExitReason, PriceTick, PriceUpdate, StreamId, StreamKey};
use crate::stream::{Stream, StreamAction, StreamError, StreamSnapshot, StreamState};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("stream {0} already registered")]
    DuplicateStream(StreamKey),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Bar(Bar),
    Tick(PriceTick),
    /// Time passes with no market data
    Heartbeat(DateTime<Utc>),
    BackfillCompleted {
        trading_date: NaiveDate,
        stream: StreamId,
        bars: Vec<Bar>,
    },
    BackfillFailed {
        trading_date: NaiveDate,
        stream: StreamId,
        reason: String,
    },
    Execution(GatewayEvent),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub bars: u64,
    pub ticks: u64,
    pub heartbeats: u64,
    pub backfills_completed: u64,
    pub backfills_failed: u64,
    pub execution_events: u64,
    pub days_started: u64,
}

/// A stream that could not be built for the day
#[derive(Debug, Clone, Serialize)]
pub struct FailedActivation {
    pub trading_date: NaiveDate,
    pub detail: String,
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub trading_date: Option<NaiveDate>,
    pub now: Option<DateTime<Utc>>,
    pub streams: Vec<StreamSnapshot>,
    pub exposure: Vec<IntentExposure>,
    pub failed_activations: Vec<FailedActivation>,
    pub journal_entries: usize,
    pub pending_backfills: usize,
    pub stats: EngineStats,
}

pub struct Engine<G: OrderGateway> {
    clock: SessionClock,
    specs: Vec<StreamSpec>,
    bar_interval: Duration,
    backfill_timeout: Duration,
    coordinator: ExecutionCoordinator<G>,
    streams: BTreeMap<StreamId, Stream>,
    trading_date: Option<NaiveDate>,
    now: Option<DateTime<Utc>>,
    backfill_requests: Vec<BackfillRequest>,
    failed_activations: Vec<FailedActivation>,
    stats: EngineStats,
}

impl<G: OrderGateway> Engine<G> {
    pub fn new(config: &EngineConfig, gateway: G, journal: ExecutionJournal) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            clock: config.clock()?,
            specs: config.stream_specs(),
            bar_interval: config.bar_interval(),
            backfill_timeout: config.backfill_timeout(),
            coordinator: ExecutionCoordinator::new(gateway, journal),
            streams: BTreeMap::new(),
            trading_date: None,
            now: None,
            backfill_requests: Vec::new(),
            failed_activations: Vec::new(),
            stats: EngineStats::default(),
        })
    }

    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    pub fn trading_date(&self) -> Option<NaiveDate> {
        self.trading_date
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator<G> {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut ExecutionCoordinator<G> {
        &mut self.coordinator
    }

    pub fn stream(&self, id: &StreamId) -> Option<&Stream> {
        self.streams.get(id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    /// Backfill work produced since the last call
    pub fn take_backfill_requests(&mut self) -> Vec<BackfillRequest> {
        std::mem::take(&mut self.backfill_requests)
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn set_now(&mut self, now: DateTime<Utc>) {
        if self.now.map_or(true, |prev| now > prev) {
            self.now = Some(now);
            self.coordinator.set_time(now);
        }
    }

    /// Register a stream for the current day
    pub fn add_stream(&mut self, stream: Stream) -> Result<(), EngineError> {
        if self.streams.contains_key(stream.id()) {
            return Err(EngineError::DuplicateStream(stream.key().clone()));
        }
        self.streams.insert(stream.id().clone(), stream);
        Ok(())
    }

    /// Build, restore and activate every configured stream for `date`
    pub fn start_day(&mut self, date: NaiveDate, now: DateTime<Utc>) -> Result<(), EngineError> {
        tracing::info!(date = %date, streams = self.specs.len(), "📅 Starting trading day");
        self.stats.days_started += 1;
        self.set_now(now);
        self.trading_date = Some(date);
        self.streams.clear();
        self.failed_activations.clear();
        self.coordinator.roll_to(date);

        for spec in self.specs.clone() {
            match Stream::from_spec(date, &spec, &self.clock, self.bar_interval, self.backfill_timeout) {
                Ok(stream) => self.add_stream(stream)?,
                Err(e) => {
                    // The other streams still trade
                    tracing::error!(error = %e, "Stream not activated today");
                    self.failed_activations.push(FailedActivation {
                        trading_date: date,
                        detail: e.to_string(),
                    });
                }
            }
        }

        let ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        for id in ids {
            if self.restore_stream(date, &id) {
                continue;
            }
            let actions = match self.streams.get_mut(&id) {
                Some(stream) => stream.activate(now),
                None => continue,
            };
            self.apply_actions(&id, actions);
        }

        self.pump();
        self.settle();
        Ok(())
    }

    /// Put a stream straight into its journalled lock, if there is one
    fn restore_stream(&mut self, date: NaiveDate, id: &StreamId) -> bool {
        let Some(locked) = self.coordinator.journal().restore_locked_state(date, id) else {
            return false;
        };

        let records = self.coordinator.recorded_intents(date, id);
        for record in records.iter().filter(|r| r.is_unknown_submission()) {
            tracing::warn!(
                stream = %id,
                fingerprint = %record.intent.fingerprint,
                direction = %record.intent.direction,
                "unknown_submission: intent recorded but never confirmed, not resubmitting"
            );
        }
        for record in records.iter().filter(|r| !r.is_unknown_submission()) {
            tracing::info!(
                stream = %id,
                fingerprint = %record.intent.fingerprint,
                outcome = ?record.outcome,
                order = ?record.order_id,
                "Journalled intent found on restart"
            );
        }

        if let Some(stream) = self.streams.get_mut(id) {
            stream.restore_locked(locked.range, locked.brackets, !records.is_empty());
        }
        let effects = self.coordinator.rehydrate(date, id);
        self.apply_effects(effects);
        true
    }

    /// Apply one event to completion
    pub fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Bar(bar) => {
                self.stats.bars += 1;
                if !self.enter_time(bar.timestamp) {
                    return;
                }
                for stream in self.streams.values_mut() {
                    if stream.instrument() == bar.instrument {
                        stream.on_bar(&bar);
                    }
                }
                self.on_market(PriceUpdate::from(&bar));
                self.advance(bar.timestamp + self.bar_interval);
            }
            EngineEvent::Tick(tick) => {
                self.stats.ticks += 1;
                if !self.enter_time(tick.timestamp) {
                    return;
                }
                self.on_market(PriceUpdate::from(&tick));
                self.advance(tick.timestamp);
            }
            EngineEvent::Heartbeat(now) => {
                self.stats.heartbeats += 1;
                if !self.enter_time(now) {
                    return;
                }
                self.advance(now);
            }
            EngineEvent::BackfillCompleted {
                trading_date,
                stream,
                bars,
            } => {
                self.stats.backfills_completed += 1;
                if self.trading_date != Some(trading_date) {
                    tracing::debug!(stream = %stream, date = %trading_date, "Backfill for another day ignored");
                    return;
                }
                let now = self.now();
                let actions = match self.streams.get_mut(&stream) {
                    Some(s) => s.on_backfill(&bars, now),
                    None => return,
                };
                self.apply_actions(&stream, actions);
                self.pump();
                self.settle();
            }
            EngineEvent::BackfillFailed {
                trading_date,
                stream,
                reason,
            } => {
                self.stats.backfills_failed += 1;
                if self.trading_date != Some(trading_date) {
                    return;
                }
                let now = self.now();
                let actions = match self.streams.get_mut(&stream) {
                    Some(s) => s.on_backfill_failed(&reason, now),
                    None => return,
                };
                self.apply_actions(&stream, actions);
                self.pump();
                self.settle();
            }
            EngineEvent::Execution(event) => {
                self.stats.execution_events += 1;
                let effects = self.coordinator.handle_event(event);
                self.apply_effects(effects);
                self.pump();
                self.settle();
            }
        }
    }

    /// Roll the trading day if `ts` falls on a later one.
    /// Returns false for data from a day already finished.
    fn enter_time(&mut self, ts: DateTime<Utc>) -> bool {
        let date = self.clock.trading_date(ts);
        match self.trading_date {
            None => {
                if let Err(e) = self.start_day(date, ts) {
                    tracing::error!(error = %e, "Could not start trading day");
                }
                true
            }
            Some(current) if date > current => {
                // Let the old day reach its cutoffs before it is dropped
                self.advance(ts);
                tracing::info!(from = %current, to = %date, "Trading date rollover");
                if let Err(e) = self.start_day(date, ts) {
                    tracing::error!(error = %e, "Could not start trading day");
                }
                true
            }
            Some(current) if date < current => {
                tracing::warn!(ts = %ts, current = %current, "Event from a previous trading date ignored");
                false
            }
            Some(_) => true,
        }
    }

    fn on_market(&mut self, update: PriceUpdate) {
        self.coordinator.set_time(update.timestamp);
        let effects = self.coordinator.on_price(&update);
        self.apply_effects(effects);
        self.coordinator.gateway_mut().on_market(&update);
        self.pump();
        self.settle();
    }

    /// Re-evaluate every stream's time guards
    fn advance(&mut self, now: DateTime<Utc>) {
        self.set_now(now);
        let ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        for id in ids {
            let actions = match self.streams.get_mut(&id) {
                Some(stream) => stream.advance(now),
                None => continue,
            };
            self.apply_actions(&id, actions);
        }
        self.pump();
        self.settle();
    }

    fn apply_actions(&mut self, id: &StreamId, actions: Vec<StreamAction>) {
        let Some(date) = self.trading_date else {
            return;
        };

        for action in actions {
            match action {
                StreamAction::RequestBackfill { start, end } => {
                    let Some(stream) = self.streams.get(id) else {
                        continue;
                    };
                    self.backfill_requests.push(BackfillRequest {
                        trading_date: date,
                        stream: id.clone(),
                        instrument: stream.instrument().to_string(),
                        start,
                        end,
                    });
                }
                StreamAction::Locked { range, plan } => {
                    if let Err(e) = self.coordinator.record_lock(date, id, &range, plan.as_ref()) {
                        tracing::error!(stream = %id, error = %e, "Range lock not journalled");
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.stand_down(format!("journal write failed: {}", e));
                        }
                        return;
                    }
                }
                StreamAction::SubmitIntents { intents } => {
                    let effects = self.coordinator.submit_intents(intents);
                    self.apply_effects(effects);
                }
                StreamAction::ForceFlatten => {
                    self.coordinator
                        .flatten_stream(date, id, ExitReason::TimeCutoff);
                }
            }
        }
    }

    fn apply_effects(&mut self, effects: Vec<CoordinatorEffect>) {
        for effect in effects {
            match effect {
                CoordinatorEffect::InstrumentHalted { instrument, detail } => {
                    for stream in self.streams.values_mut() {
                        if stream.instrument() == instrument {
                            stream.stand_down(detail.clone());
                        }
                    }
                }
                CoordinatorEffect::EntryFilled {
                    trading_date,
                    stream,
                    direction,
                    filled_qty,
                } => {
                    if let Some(s) = self.stream_for(trading_date, &stream) {
                        s.record_entry_fill(direction, filled_qty);
                    }
                }
                CoordinatorEffect::ProtectivePlaced {
                    trading_date,
                    stream,
                    handles,
                } => {
                    if let Some(s) = self.stream_for(trading_date, &stream) {
                        s.record_protective(handles);
                    }
                }
                CoordinatorEffect::BreakEvenApplied {
                    trading_date,
                    stream,
                } => {
                    if let Some(s) = self.stream_for(trading_date, &stream) {
                        s.record_breakeven();
                    }
                }
                CoordinatorEffect::Exited {
                    trading_date,
                    stream,
                    reason,
                    ..
                } => {
                    if let Some(s) = self.stream_for(trading_date, &stream) {
                        s.record_exit(reason);
                    }
                }
                CoordinatorEffect::EntryRejected {
                    trading_date,
                    stream,
                    direction,
                } => {
                    if let Some(s) = self.stream_for(trading_date, &stream) {
                        s.record_entry_rejected(direction);
                    }
                }
                CoordinatorEffect::StoodDown {
                    trading_date,
                    stream,
                    detail,
                } => {
                    if let Some(s) = self.stream_for(trading_date, &stream) {
                        s.stand_down(detail);
                    }
                }
            }
        }
    }

    fn stream_for(&mut self, trading_date: NaiveDate, id: &StreamId) -> Option<&mut Stream> {
        if self.trading_date != Some(trading_date) {
            return None;
        }
        self.streams.get_mut(id)
    }

    fn pump(&mut self) {
        let effects = self.coordinator.pump();
        self.apply_effects(effects);
    }

    /// Complete locked streams that are flat with nothing working
    fn settle(&mut self) {
        let Some(date) = self.trading_date else {
            return;
        };
        for stream in self.streams.values_mut() {
            if stream.state() != StreamState::RangeLocked {
                continue;
            }
            let open = self.coordinator.open_qty(date, stream.id());
            let working = self.coordinator.working_orders(date, stream.id());
            stream.settle(open, working);
        }
    }

    pub fn all_complete(&self) -> bool {
        !self.streams.is_empty() && self.streams.values().all(|s| s.is_complete())
    }

    pub fn diagnostics(&self) -> EngineSnapshot {
        EngineSnapshot {
            trading_date: self.trading_date,
            now: self.now,
            streams: self.streams.values().map(|s| s.snapshot()).collect(),
            exposure: self.coordinator.exposure(),
            failed_activations: self.failed_activations.clone(),
            journal_entries: self.coordinator.journal().len(),
            pending_backfills: self.backfill_requests.len(),
            stats: self.stats.clone(),
        }
    }
}
