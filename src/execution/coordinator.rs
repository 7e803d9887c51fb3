use super::gateway::{
    GatewayError, GatewayEvent, OrderGateway, OrderId, OrderKind, OrderRequest, OrderSpec,
};
use super::intent::{Fingerprint, Intent};
use crate::journal::{ExecutionJournal, IntentRecord, JournalError, JournalEvent, Outcome};
use crate::models::{Direction, ExitReason, PriceUpdate, Side, StreamId};
use crate::range::FrozenRange;
use crate::stream::{BracketPlan, ProtectiveHandles};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderRole {
    Entry,
    Stop,
    Target,
    Flatten(ExitReason),
    /// Instrument-wide flatten or excess unwind, outside per-intent accounting
    Offset,
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    fingerprint: Fingerprint,
    trading_date: NaiveDate,
    stream: StreamId,
    role: OrderRole,
    quantity: u32,
    filled: u32,
    working: bool,
    cancel_requested: bool,
}

#[derive(Debug, Clone)]
struct IntentState {
    intent: Intent,
    entry_order: Option<OrderId>,
    entry_filled: u32,
    exited: u32,
    stop_order: Option<OrderId>,
    target_order: Option<OrderId>,
    protected_qty: u32,
    stop_price: f64,
    breakeven_applied: bool,
    last_exit: Option<ExitReason>,
}

impl IntentState {
    fn new(intent: Intent) -> Self {
        let stop_price = intent.stop_price.unwrap_or(intent.entry_price);
        Self {
            intent,
            entry_order: None,
            entry_filled: 0,
            exited: 0,
            stop_order: None,
            target_order: None,
            protected_qty: 0,
            stop_price,
            breakeven_applied: false,
            last_exit: None,
        }
    }

    fn open_qty(&self) -> u32 {
        self.entry_filled.saturating_sub(self.exited)
    }

    fn belongs_to(&self, trading_date: NaiveDate, stream: &StreamId) -> bool {
        self.intent.trading_date == trading_date && &self.intent.stream == stream
    }
}

/// What changed on the execution side, for the owning stream to record
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEffect {
    EntryFilled {
        trading_date: NaiveDate,
        stream: StreamId,
        direction: Direction,
        filled_qty: u32,
    },
    ProtectivePlaced {
        trading_date: NaiveDate,
        stream: StreamId,
        handles: ProtectiveHandles,
    },
    BreakEvenApplied {
        trading_date: NaiveDate,
        stream: StreamId,
    },
    Exited {
        trading_date: NaiveDate,
        stream: StreamId,
        direction: Direction,
        reason: ExitReason,
    },
    EntryRejected {
        trading_date: NaiveDate,
        stream: StreamId,
        direction: Direction,
    },
    StoodDown {
        trading_date: NaiveDate,
        stream: StreamId,
        detail: String,
    },
    /// An unattributable fill: every stream on the instrument must stop
    InstrumentHalted { instrument: String, detail: String },
}

/// Per-intent exposure view for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct IntentExposure {
    pub fingerprint: Fingerprint,
    pub trading_date: NaiveDate,
    pub stream: StreamId,
    pub direction: Direction,
    pub entry_filled: u32,
    pub exited: u32,
    pub open_qty: u32,
    pub protected_qty: u32,
    pub stop_price: f64,
    pub breakeven_applied: bool,
    pub last_exit: Option<ExitReason>,
}

/// Owns the journal and the gateway; keeps every position protected
///
/// Submission is journal-first: an intent is durably recorded before the
/// gateway sees it, and a fingerprint already in the journal is never sent
/// again unless its last outcome was a rejection.
pub struct ExecutionCoordinator<G: OrderGateway> {
    gateway: G,
    journal: ExecutionJournal,
    orders: HashMap<OrderId, TrackedOrder>,
    intents: BTreeMap<Fingerprint, IntentState>,
    closed_streams: HashSet<(NaiveDate, StreamId)>,
    failed_streams: HashSet<(NaiveDate, StreamId)>,
    halted_instruments: HashSet<String>,
    next_group: u64,
    now: DateTime<Utc>,
    trading_date: Option<NaiveDate>,
}

impl<G: OrderGateway> ExecutionCoordinator<G> {
    pub fn new(gateway: G, journal: ExecutionJournal) -> Self {
        Self {
            gateway,
            journal,
            orders: HashMap::new(),
            intents: BTreeMap::new(),
            closed_streams: HashSet::new(),
            failed_streams: HashSet::new(),
            halted_instruments: HashSet::new(),
            next_group: 0,
            now: DateTime::<Utc>::MIN_UTC,
            trading_date: None,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn journal(&self) -> &ExecutionJournal {
        &self.journal
    }

    /// Advance the clock used to stamp journal entries
    pub fn set_time(&mut self, now: DateTime<Utc>) {
        if now > self.now {
            self.now = now;
        }
    }

    fn record(
        &mut self,
        fingerprint: &Fingerprint,
        trading_date: NaiveDate,
        stream: &StreamId,
        event: JournalEvent,
    ) -> Result<u64, JournalError> {
        self.journal
            .append(fingerprint.clone(), trading_date, stream.clone(), self.now, event)
    }

    fn record_or_log(
        &mut self,
        fingerprint: &Fingerprint,
        trading_date: NaiveDate,
        stream: &StreamId,
        event: JournalEvent,
    ) {
        if let Err(e) = self.record(fingerprint, trading_date, stream, event) {
            tracing::error!(
                stream = %stream,
                fingerprint = %fingerprint,
                error = %e,
                "Journal write failed"
            );
        }
    }

    fn record_for_intent(&mut self, fingerprint: &Fingerprint, event: JournalEvent) {
        let Some(state) = self.intents.get(fingerprint) else {
            return;
        };
        let (date, stream) = (state.intent.trading_date, state.intent.stream.clone());
        self.record_or_log(fingerprint, date, &stream, event);
    }

    /// Journal a range lock under its stream-level fingerprint
    pub fn record_lock(
        &mut self,
        trading_date: NaiveDate,
        stream: &StreamId,
        range: &FrozenRange,
        brackets: Option<&BracketPlan>,
    ) -> Result<(), JournalError> {
        let fingerprint = Fingerprint::for_range_lock(trading_date, stream);
        if self.journal.lookup(&fingerprint).is_some() {
            tracing::debug!(stream = %stream, "Range lock already journalled");
            return Ok(());
        }
        self.record(
            &fingerprint,
            trading_date,
            stream,
            JournalEvent::RangeLocked {
                range: range.clone(),
                brackets: brackets.cloned(),
            },
        )?;
        Ok(())
    }

    /// Intents the journal already holds for a stream (restart reconciliation)
    pub fn recorded_intents(&self, trading_date: NaiveDate, stream: &StreamId) -> Vec<IntentRecord> {
        self.journal.intents_for(trading_date, stream)
    }

    pub fn submit_intents(&mut self, intents: Vec<Intent>) -> Vec<CoordinatorEffect> {
        let mut effects = Vec::new();
        for intent in intents {
            effects.extend(self.submit_intent(intent));
        }
        effects
    }

    fn submit_intent(&mut self, intent: Intent) -> Vec<CoordinatorEffect> {
        let date = intent.trading_date;
        let stream = intent.stream.clone();
        let direction = intent.direction;
        let fingerprint = intent.fingerprint.clone();

        if self.closed_streams.contains(&(date, stream.clone()))
            || self.halted_instruments.contains(&intent.instrument)
        {
            tracing::warn!(stream = %stream, fingerprint = %fingerprint, "Stream closed, intent dropped");
            return Vec::new();
        }

        if let Some(outcome) = self.journal.outcome(&fingerprint) {
            if outcome != Outcome::Rejected {
                tracing::warn!(
                    stream = %stream,
                    fingerprint = %fingerprint,
                    outcome = ?outcome,
                    "Duplicate intent suppressed"
                );
                return Vec::new();
            }
        }

        if !intent.has_bracket_legs() {
            tracing::error!(stream = %stream, fingerprint = %fingerprint, "Intent without protective legs refused");
            self.record_or_log(
                &fingerprint,
                date,
                &stream,
                JournalEvent::Rejected {
                    reason: "missing protective legs".to_string(),
                },
            );
            return self.fail_closed(date, &stream, format!("{} intent missing bracket legs", direction));
        }

        if let Err(e) = self.record(
            &fingerprint,
            date,
            &stream,
            JournalEvent::IntentRecorded {
                intent: intent.clone(),
            },
        ) {
            tracing::error!(stream = %stream, error = %e, "Intent could not be journalled, not submitted");
            return self.fail_closed(date, &stream, format!("journal write failed: {}", e));
        }

        let spec = OrderSpec {
            instrument: intent.instrument.clone(),
            side: direction.entry_side(),
            quantity: intent.quantity,
            kind: OrderKind::StopMarket {
                trigger: intent.entry_price,
            },
            tag: format!("{}:entry:{}", stream, direction),
            oco_group: Some(format!("{}:{}:entry", date, stream)),
        };

        let mut state = IntentState::new(intent);
        let result = self.gateway.submit(OrderRequest::Place(spec));
        match result {
            Ok(order_id) => {
                tracing::info!(
                    stream = %stream,
                    direction = %direction,
                    entry = state.intent.entry_price,
                    quantity = state.intent.quantity,
                    order = %order_id,
                    "Entry order submitted"
                );
                let quantity = state.intent.quantity;
                self.track(order_id.clone(), &fingerprint, date, &stream, OrderRole::Entry, quantity);
                state.entry_order = Some(order_id.clone());
                self.intents.insert(fingerprint.clone(), state);
                self.record_or_log(&fingerprint, date, &stream, JournalEvent::Submitted { order_id });
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(stream = %stream, direction = %direction, error = %e, "Entry order rejected");
                self.intents.insert(fingerprint.clone(), state);
                self.record_or_log(
                    &fingerprint,
                    date,
                    &stream,
                    JournalEvent::Rejected {
                        reason: e.to_string(),
                    },
                );
                vec![CoordinatorEffect::EntryRejected {
                    trading_date: date,
                    stream,
                    direction,
                }]
            }
        }
    }

    /// Apply one gateway notification
    pub fn handle_event(&mut self, event: GatewayEvent) -> Vec<CoordinatorEffect> {
        match event {
            GatewayEvent::Filled {
                order_id,
                instrument,
                quantity,
                price,
                timestamp,
                ..
            } => {
                self.set_time(timestamp);
                self.on_fill(order_id, &instrument, quantity, price)
            }
            GatewayEvent::Rejected { order_id, reason } => self.on_rejected(&order_id, &reason),
            GatewayEvent::Cancelled { order_id } => self.on_cancelled(&order_id),
        }
    }

    /// Drain the gateway and apply everything it reported
    pub fn pump(&mut self) -> Vec<CoordinatorEffect> {
        let mut effects = Vec::new();
        loop {
            let events = self.gateway.poll_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                effects.extend(self.handle_event(event));
            }
        }
        effects
    }

    fn on_fill(
        &mut self,
        order_id: OrderId,
        instrument: &str,
        quantity: u32,
        price: f64,
    ) -> Vec<CoordinatorEffect> {
        let Some(order) = self.orders.get_mut(&order_id) else {
            return self.halt_instrument(
                instrument,
                format!("fill of {} for unknown order {}", quantity, order_id),
            );
        };

        order.filled += quantity;
        let overfill = order.filled > order.quantity;
        if order.filled >= order.quantity {
            order.working = false;
        }
        let role = order.role;
        let fingerprint = order.fingerprint.clone();

        match role {
            OrderRole::Entry => self.on_entry_fill(&fingerprint, quantity, price, overfill),
            OrderRole::Stop | OrderRole::Target | OrderRole::Flatten(_) => {
                self.on_exit_fill(&fingerprint, role, quantity, price)
            }
            OrderRole::Offset => {
                tracing::info!(order = %order_id, quantity, price, "Offset order filled");
                Vec::new()
            }
        }
    }

    fn on_entry_fill(
        &mut self,
        fingerprint: &Fingerprint,
        delta: u32,
        price: f64,
        overfill: bool,
    ) -> Vec<CoordinatorEffect> {
        let Some(state) = self.intents.get_mut(fingerprint) else {
            return Vec::new();
        };
        state.entry_filled += delta;
        let date = state.intent.trading_date;
        let stream = state.intent.stream.clone();
        let direction = state.intent.direction;
        let filled_qty = state.entry_filled;

        tracing::info!(
            stream = %stream,
            direction = %direction,
            delta,
            filled_qty,
            price,
            "Entry filled"
        );
        self.record_or_log(
            fingerprint,
            date,
            &stream,
            JournalEvent::EntryFilled { filled_qty, price },
        );

        let mut effects = vec![CoordinatorEffect::EntryFilled {
            trading_date: date,
            stream: stream.clone(),
            direction,
            filled_qty,
        }];
        self.cancel_sibling_entries(fingerprint);

        if overfill {
            effects.extend(self.fail_closed(date, &stream, "entry overfilled".to_string()));
            return effects;
        }

        if self.closed_streams.contains(&(date, stream.clone())) {
            // Fill raced a flatten: close it straight away
            let reason = if self.failed_streams.contains(&(date, stream.clone())) {
                ExitReason::FailClosed
            } else {
                ExitReason::TimeCutoff
            };
            self.flatten_intent(fingerprint, reason);
            return effects;
        }

        effects.extend(self.sync_protection(fingerprint, false));
        effects
    }

    fn on_exit_fill(
        &mut self,
        fingerprint: &Fingerprint,
        role: OrderRole,
        delta: u32,
        price: f64,
    ) -> Vec<CoordinatorEffect> {
        let Some(state) = self.intents.get_mut(fingerprint) else {
            return Vec::new();
        };

        let applied = delta.min(state.open_qty());
        let excess = delta - applied;
        state.exited += applied;

        let reason = match role {
            OrderRole::Stop if state.breakeven_applied => ExitReason::BreakEvenStop,
            OrderRole::Stop => ExitReason::Stop,
            OrderRole::Target => ExitReason::Target,
            OrderRole::Flatten(reason) => reason,
            OrderRole::Entry | OrderRole::Offset => return Vec::new(),
        };
        state.last_exit = Some(reason);

        let date = state.intent.trading_date;
        let stream = state.intent.stream.clone();
        let direction = state.intent.direction;
        let instrument = state.intent.instrument.clone();
        let remaining = state.open_qty();

        tracing::info!(
            stream = %stream,
            direction = %direction,
            reason = %reason,
            exit_qty = applied,
            remaining,
            price,
            "Exit filled"
        );
        self.record_or_log(
            fingerprint,
            date,
            &stream,
            JournalEvent::Exited {
                reason,
                exit_qty: applied,
                price,
            },
        );

        let mut effects = Vec::new();

        if excess > 0 {
            tracing::error!(stream = %stream, excess, "Exit fill exceeded open quantity");
            self.submit_offset(&instrument, direction.entry_side(), excess, date, &stream, fingerprint);
            effects.extend(self.fail_closed(date, &stream, format!("exit overfilled by {}", excess)));
        }

        if remaining == 0 {
            self.cancel_intent_orders(fingerprint);
            effects.push(CoordinatorEffect::Exited {
                trading_date: date,
                stream,
                direction,
                reason,
            });
        } else if !matches!(role, OrderRole::Flatten(_)) {
            effects.extend(self.sync_protection(fingerprint, false));
        }

        effects
    }

    fn on_rejected(&mut self, order_id: &OrderId, reason: &str) -> Vec<CoordinatorEffect> {
        let Some(order) = self.orders.get_mut(order_id) else {
            tracing::warn!(order = %order_id, reason, "Rejection for unknown order");
            return Vec::new();
        };
        order.working = false;
        let role = order.role;
        let fingerprint = order.fingerprint.clone();
        let date = order.trading_date;
        let stream = order.stream.clone();

        match role {
            OrderRole::Entry => {
                tracing::warn!(stream = %stream, reason, "Entry order rejected");
                self.record_for_intent(
                    &fingerprint,
                    JournalEvent::Rejected {
                        reason: reason.to_string(),
                    },
                );
                let Some(state) = self.intents.get(&fingerprint) else {
                    return Vec::new();
                };
                vec![CoordinatorEffect::EntryRejected {
                    trading_date: date,
                    stream,
                    direction: state.intent.direction,
                }]
            }
            OrderRole::Stop | OrderRole::Target => {
                self.record_for_intent(
                    &fingerprint,
                    JournalEvent::Rejected {
                        reason: reason.to_string(),
                    },
                );
                self.fail_closed(date, &stream, format!("protective order rejected: {}", reason))
            }
            OrderRole::Flatten(_) | OrderRole::Offset => {
                tracing::error!(stream = %stream, reason, "Flatten order rejected, exposure may remain");
                self.fail_closed(date, &stream, format!("flatten rejected: {}", reason))
            }
        }
    }

    fn on_cancelled(&mut self, order_id: &OrderId) -> Vec<CoordinatorEffect> {
        let Some(order) = self.orders.get_mut(order_id) else {
            return Vec::new();
        };
        order.working = false;
        if order.cancel_requested {
            return Vec::new();
        }
        let role = order.role;
        let fingerprint = order.fingerprint.clone();
        let date = order.trading_date;
        let stream = order.stream.clone();

        match role {
            OrderRole::Entry => {
                tracing::info!(stream = %stream, order = %order_id, "Entry order cancelled by venue");
                self.record_for_intent(&fingerprint, JournalEvent::Cancelled);
                Vec::new()
            }
            OrderRole::Stop | OrderRole::Target => {
                let guarding = self.intents.get(&fingerprint).is_some_and(|s| {
                    s.open_qty() > 0
                        && (s.stop_order.as_ref() == Some(order_id)
                            || s.target_order.as_ref() == Some(order_id))
                });
                if guarding {
                    self.fail_closed(date, &stream, "protective order cancelled externally".to_string())
                } else {
                    Vec::new()
                }
            }
            OrderRole::Flatten(_) | OrderRole::Offset => Vec::new(),
        }
    }

    /// Move stops to break-even for positions whose trigger traded
    pub fn on_price(&mut self, update: &PriceUpdate) -> Vec<CoordinatorEffect> {
        let due: Vec<Fingerprint> = self
            .intents
            .iter()
            .filter(|(_, s)| {
                s.intent.instrument == update.instrument
                    && s.open_qty() > 0
                    && !s.breakeven_applied
                    && s.stop_order.is_some()
            })
            .filter(|(_, s)| match s.intent.direction {
                Direction::Long => update.high >= s.intent.breakeven_trigger,
                Direction::Short => update.low <= s.intent.breakeven_trigger,
            })
            .map(|(fp, _)| fp.clone())
            .collect();

        let mut effects = Vec::new();
        for fingerprint in due {
            effects.extend(self.apply_breakeven(&fingerprint));
        }
        effects
    }

    fn apply_breakeven(&mut self, fingerprint: &Fingerprint) -> Vec<CoordinatorEffect> {
        let Some(state) = self.intents.get_mut(fingerprint) else {
            return Vec::new();
        };
        let new_stop = state.intent.breakeven_stop;
        let stop_order = state.stop_order.clone();
        state.breakeven_applied = true;
        state.stop_price = new_stop;
        let date = state.intent.trading_date;
        let stream = state.intent.stream.clone();

        let modified = match stop_order {
            Some(ref id) => self.gateway.modify_stop(id, new_stop),
            None => Err(GatewayError::Unavailable("no stop order".to_string())),
        };

        let mut effects = Vec::new();
        if let Err(e) = modified {
            tracing::warn!(stream = %stream, error = %e, "Stop modify failed, replacing protective pair");
            effects.extend(self.sync_protection(fingerprint, true));
            if self.failed_streams.contains(&(date, stream.clone())) {
                return effects;
            }
        }

        tracing::info!(stream = %stream, stop = new_stop, "Break-even applied");
        self.record_or_log(
            fingerprint,
            date,
            &stream,
            JournalEvent::BreakEvenApplied {
                stop_price: new_stop,
            },
        );
        effects.push(CoordinatorEffect::BreakEvenApplied {
            trading_date: date,
            stream,
        });
        effects
    }

    /// Make the protective pair quantity equal the open quantity
    fn sync_protection(&mut self, fingerprint: &Fingerprint, force: bool) -> Vec<CoordinatorEffect> {
        let Some(state) = self.intents.get(fingerprint) else {
            return Vec::new();
        };
        let open = state.open_qty();
        let in_place = state.stop_order.is_some() && state.target_order.is_some();
        if !force && in_place && state.protected_qty == open {
            return Vec::new();
        }

        let stale: Vec<OrderId> = [state.stop_order.clone(), state.target_order.clone()]
            .into_iter()
            .flatten()
            .collect();
        for id in &stale {
            self.cancel_order(id);
        }

        let Some(state) = self.intents.get_mut(fingerprint) else {
            return Vec::new();
        };
        state.stop_order = None;
        state.target_order = None;
        state.protected_qty = 0;
        if open == 0 {
            return Vec::new();
        }

        let date = state.intent.trading_date;
        let stream = state.intent.stream.clone();
        let instrument = state.intent.instrument.clone();
        let exit_side = state.intent.direction.exit_side();
        let stop_price = state.stop_price;
        let Some(target_price) = state.intent.target_price else {
            return self.fail_closed(date, &stream, "intent lost its target".to_string());
        };

        if let Err(e) = self.record(
            fingerprint,
            date,
            &stream,
            JournalEvent::ProtectiveRequested {
                quantity: open,
                stop_price,
                target_price,
            },
        ) {
            tracing::error!(stream = %stream, error = %e, "Protective request could not be journalled, not placed");
            return self.fail_closed(date, &stream, format!("journal write failed: {}", e));
        }

        self.next_group += 1;
        let group = format!("{}:protect:{}", fingerprint.short(), self.next_group);
        let stop_spec = OrderSpec {
            instrument: instrument.clone(),
            side: exit_side,
            quantity: open,
            kind: OrderKind::StopMarket { trigger: stop_price },
            tag: format!("{}:stop", stream),
            oco_group: Some(group.clone()),
        };
        let target_spec = OrderSpec {
            instrument,
            side: exit_side,
            quantity: open,
            kind: OrderKind::Limit {
                price: target_price,
            },
            tag: format!("{}:target", stream),
            oco_group: Some(group),
        };

        let stop_order = match self.place_tracked(stop_spec, fingerprint, date, &stream, OrderRole::Stop) {
            Ok(id) => id,
            Err(e) => {
                return self.fail_closed(date, &stream, format!("protective stop failed: {}", e));
            }
        };
        let target_order =
            match self.place_tracked(target_spec, fingerprint, date, &stream, OrderRole::Target) {
                Ok(id) => id,
                Err(e) => {
                    self.cancel_order(&stop_order);
                    return self.fail_closed(date, &stream, format!("protective target failed: {}", e));
                }
            };

        if let Some(state) = self.intents.get_mut(fingerprint) {
            state.stop_order = Some(stop_order.clone());
            state.target_order = Some(target_order.clone());
            state.protected_qty = open;
        }

        tracing::info!(
            stream = %stream,
            quantity = open,
            stop = stop_price,
            target = target_price,
            "Protective pair placed"
        );
        self.record_or_log(
            fingerprint,
            date,
            &stream,
            JournalEvent::ProtectivePlaced {
                stop_order: stop_order.clone(),
                target_order: target_order.clone(),
                quantity: open,
                stop_price,
                target_price,
            },
        );

        vec![CoordinatorEffect::ProtectivePlaced {
            trading_date: date,
            stream,
            handles: ProtectiveHandles {
                stop_order,
                target_order,
                quantity: open,
            },
        }]
    }

    fn place_tracked(
        &mut self,
        spec: OrderSpec,
        fingerprint: &Fingerprint,
        trading_date: NaiveDate,
        stream: &StreamId,
        role: OrderRole,
    ) -> Result<OrderId, GatewayError> {
        let quantity = spec.quantity;
        let order_id = self.gateway.submit(OrderRequest::Place(spec))?;
        self.track(order_id.clone(), fingerprint, trading_date, stream, role, quantity);
        Ok(order_id)
    }

    fn cancel_order(&mut self, order_id: &OrderId) {
        let Some(order) = self.orders.get_mut(order_id) else {
            return;
        };
        order.cancel_requested = true;
        if !order.working {
            return;
        }
        match self.gateway.cancel(order_id) {
            Ok(()) => {}
            Err(GatewayError::UnknownOrder(_)) => {
                // Already gone at the venue (filled or cancelled by OCO)
                if let Some(order) = self.orders.get_mut(order_id) {
                    order.working = false;
                }
            }
            Err(e) => {
                tracing::warn!(order = %order_id, error = %e, "Cancel failed");
            }
        }
    }

    fn cancel_sibling_entries(&mut self, fingerprint: &Fingerprint) {
        let Some(state) = self.intents.get(fingerprint) else {
            return;
        };
        let (date, stream) = (state.intent.trading_date, state.intent.stream.clone());
        let siblings: Vec<(Fingerprint, OrderId)> = self
            .intents
            .iter()
            .filter(|(fp, s)| *fp != fingerprint && s.belongs_to(date, &stream) && s.entry_filled == 0)
            .filter_map(|(fp, s)| s.entry_order.clone().map(|id| (fp.clone(), id)))
            .filter(|(_, id)| self.orders.get(id).is_some_and(|o| o.working))
            .collect();

        for (sibling, order_id) in siblings {
            tracing::info!(stream = %stream, order = %order_id, "Cancelling opposite entry");
            self.cancel_order(&order_id);
            self.record_for_intent(&sibling, JournalEvent::Cancelled);
        }
    }

    fn cancel_intent_orders(&mut self, fingerprint: &Fingerprint) {
        let Some(state) = self.intents.get_mut(fingerprint) else {
            return;
        };
        let ids: Vec<OrderId> = [
            state.entry_order.clone(),
            state.stop_order.take(),
            state.target_order.take(),
        ]
        .into_iter()
        .flatten()
        .collect();
        state.protected_qty = 0;
        for id in ids {
            self.cancel_order(&id);
        }
    }

    fn flatten_intent(&mut self, fingerprint: &Fingerprint, reason: ExitReason) {
        self.cancel_intent_orders(fingerprint);
        let Some(state) = self.intents.get(fingerprint) else {
            return;
        };
        let open = state.open_qty();
        if open == 0 {
            return;
        }
        let date = state.intent.trading_date;
        let stream = state.intent.stream.clone();
        let spec = OrderSpec {
            instrument: state.intent.instrument.clone(),
            side: state.intent.direction.exit_side(),
            quantity: open,
            kind: OrderKind::Market,
            tag: format!("{}:flatten:{}", stream, reason),
            oco_group: None,
        };
        tracing::warn!(stream = %stream, quantity = open, reason = %reason, "Flattening position");
        // A failed write is logged but never blocks closing exposure
        self.record_or_log(
            fingerprint,
            date,
            &stream,
            JournalEvent::FlattenRequested {
                reason,
                quantity: open,
            },
        );
        match self.place_tracked(spec, fingerprint, date, &stream, OrderRole::Flatten(reason)) {
            Ok(order_id) => self.record_or_log(
                fingerprint,
                date,
                &stream,
                JournalEvent::FlattenSubmitted {
                    order_id,
                    reason,
                    quantity: open,
                },
            ),
            Err(e) => {
                tracing::error!(stream = %stream, error = %e, "Flatten order failed, exposure remains");
            }
        }
    }

    /// Cancel everything working for a stream and close its open quantity
    pub fn flatten_stream(&mut self, trading_date: NaiveDate, stream: &StreamId, reason: ExitReason) {
        self.closed_streams.insert((trading_date, stream.clone()));
        let fingerprints: Vec<Fingerprint> = self
            .intents
            .iter()
            .filter(|(_, s)| s.belongs_to(trading_date, stream))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fingerprint in fingerprints {
            self.flatten_intent(&fingerprint, reason);
        }
    }

    /// Flatten and stop all activity for a stream
    pub fn fail_closed(
        &mut self,
        trading_date: NaiveDate,
        stream: &StreamId,
        detail: String,
    ) -> Vec<CoordinatorEffect> {
        if !self.failed_streams.insert((trading_date, stream.clone())) {
            return Vec::new();
        }
        tracing::error!(stream = %stream, date = %trading_date, detail = %detail, "Fail-closed");
        let fingerprint = Fingerprint::for_stream_event(trading_date, stream, "fail_closed");
        self.record_or_log(
            &fingerprint,
            trading_date,
            stream,
            JournalEvent::FailClosed {
                reason: detail.clone(),
            },
        );
        self.flatten_stream(trading_date, stream, ExitReason::FailClosed);
        vec![CoordinatorEffect::StoodDown {
            trading_date,
            stream: stream.clone(),
            detail,
        }]
    }

    fn submit_offset(
        &mut self,
        instrument: &str,
        side: Side,
        quantity: u32,
        trading_date: NaiveDate,
        stream: &StreamId,
        fingerprint: &Fingerprint,
    ) {
        let spec = OrderSpec {
            instrument: instrument.to_string(),
            side,
            quantity,
            kind: OrderKind::Market,
            tag: format!("{}:offset", stream),
            oco_group: None,
        };
        self.record_or_log(
            &Fingerprint::for_stream_event(trading_date, stream, "offset"),
            trading_date,
            stream,
            JournalEvent::FlattenRequested {
                reason: ExitReason::FailClosed,
                quantity,
            },
        );
        if let Err(e) = self.place_tracked(spec, fingerprint, trading_date, stream, OrderRole::Offset) {
            tracing::error!(stream = %stream, error = %e, "Offset order failed");
        }
    }

    fn halt_instrument(&mut self, instrument: &str, detail: String) -> Vec<CoordinatorEffect> {
        if !self.halted_instruments.insert(instrument.to_string()) {
            tracing::error!(instrument, detail = %detail, "Further unmapped fill on halted instrument");
        } else {
            tracing::error!(instrument, detail = %detail, "Unmapped fill, halting instrument");
        }

        let affected: Vec<Fingerprint> = self
            .intents
            .iter()
            .filter(|(_, s)| s.intent.instrument == instrument)
            .map(|(fp, _)| fp.clone())
            .collect();
        let trading_date = affected
            .iter()
            .filter_map(|fp| self.intents.get(fp).map(|s| s.intent.trading_date))
            .max()
            .or(self.trading_date)
            .unwrap_or_else(|| self.now.date_naive());

        for fingerprint in &affected {
            self.cancel_intent_orders(fingerprint);
            let Some(state) = self.intents.get_mut(fingerprint) else {
                continue;
            };
            let open = state.open_qty();
            let key = (state.intent.trading_date, state.intent.stream.clone());
            if open > 0 {
                // Closed by the instrument-wide flatten below
                state.exited = state.entry_filled;
                state.last_exit = Some(ExitReason::FailClosed);
            }
            self.closed_streams.insert(key.clone());
            if self.failed_streams.insert(key.clone()) {
                self.record_or_log(
                    &Fingerprint::for_stream_event(key.0, &key.1, "fail_closed"),
                    key.0,
                    &key.1,
                    JournalEvent::FailClosed {
                        reason: detail.clone(),
                    },
                );
            }
        }

        let instrument_stream = StreamId(instrument.to_string());
        let fingerprint =
            Fingerprint::for_stream_event(trading_date, &instrument_stream, "instrument_flatten");
        self.record_or_log(
            &fingerprint,
            trading_date,
            &instrument_stream,
            JournalEvent::FailClosed {
                reason: detail.clone(),
            },
        );

        match self.gateway.submit(OrderRequest::Flatten {
            instrument: instrument.to_string(),
            tag: "unmapped-fill".to_string(),
        }) {
            Ok(order_id) => {
                self.orders.insert(
                    order_id,
                    TrackedOrder {
                        fingerprint,
                        trading_date,
                        stream: instrument_stream,
                        role: OrderRole::Offset,
                        quantity: u32::MAX,
                        filled: 0,
                        working: false,
                        cancel_requested: false,
                    },
                );
            }
            Err(e) => {
                tracing::error!(instrument, error = %e, "Instrument flatten failed");
            }
        }

        vec![CoordinatorEffect::InstrumentHalted {
            instrument: instrument.to_string(),
            detail,
        }]
    }

    fn track(
        &mut self,
        order_id: OrderId,
        fingerprint: &Fingerprint,
        trading_date: NaiveDate,
        stream: &StreamId,
        role: OrderRole,
        quantity: u32,
    ) {
        self.orders.insert(
            order_id,
            TrackedOrder {
                fingerprint: fingerprint.clone(),
                trading_date,
                stream: stream.clone(),
                role,
                quantity,
                filled: 0,
                working: true,
                cancel_requested: false,
            },
        );
    }

    fn retire(&mut self, order_id: Option<&OrderId>) {
        if let Some(order) = order_id.and_then(|id| self.orders.get_mut(id)) {
            order.working = false;
        }
    }

    /// Rebuild a stream's execution state from the journal after a restart
    ///
    /// Orders named in the journal are tracked again so that later gateway
    /// events for them map back to their intent.
    pub fn rehydrate(&mut self, trading_date: NaiveDate, stream: &StreamId) -> Vec<CoordinatorEffect> {
        let entries: Vec<_> = self
            .journal
            .entries()
            .iter()
            .filter(|e| e.trading_date == trading_date && &e.stream == stream)
            .cloned()
            .collect();

        let mut touched: Vec<Fingerprint> = Vec::new();
        let mut protect_pending: HashSet<Fingerprint> = HashSet::new();
        let mut flatten_pending: HashSet<Fingerprint> = HashSet::new();
        let mut flatten_orders: HashMap<Fingerprint, Vec<OrderId>> = HashMap::new();
        for entry in entries {
            let fp = entry.fingerprint;
            if let JournalEvent::IntentRecorded { intent } = entry.event {
                if !self.intents.contains_key(&fp) {
                    self.intents.insert(fp.clone(), IntentState::new(intent));
                    touched.push(fp);
                }
                continue;
            }
            let Some(state) = self.intents.get(&fp) else {
                continue;
            };
            let quantity = state.intent.quantity;

            match entry.event {
                JournalEvent::Submitted { order_id } => {
                    self.track(order_id.clone(), &fp, trading_date, stream, OrderRole::Entry, quantity);
                    if let Some(state) = self.intents.get_mut(&fp) {
                        state.entry_order = Some(order_id);
                    }
                }
                JournalEvent::EntryFilled { filled_qty, .. } => {
                    let entry_order = state.entry_order.clone();
                    if let Some(order) = entry_order.as_ref().and_then(|id| self.orders.get_mut(id)) {
                        order.filled = filled_qty;
                        order.working = filled_qty < order.quantity;
                    }
                    if let Some(state) = self.intents.get_mut(&fp) {
                        state.entry_filled = filled_qty;
                    }
                }
                JournalEvent::ProtectiveRequested { .. } => {
                    protect_pending.insert(fp);
                }
                JournalEvent::FlattenRequested { .. } => {
                    flatten_pending.insert(fp);
                }
                JournalEvent::FlattenSubmitted {
                    order_id,
                    reason,
                    quantity,
                } => {
                    flatten_pending.remove(&fp);
                    self.track(order_id.clone(), &fp, trading_date, stream, OrderRole::Flatten(reason), quantity);
                    flatten_orders.entry(fp).or_default().push(order_id);
                }
                JournalEvent::ProtectivePlaced {
                    stop_order,
                    target_order,
                    quantity,
                    stop_price,
                    ..
                } => {
                    protect_pending.remove(&fp);
                    let (old_stop, old_target) = (state.stop_order.clone(), state.target_order.clone());
                    self.retire(old_stop.as_ref());
                    self.retire(old_target.as_ref());
                    self.track(stop_order.clone(), &fp, trading_date, stream, OrderRole::Stop, quantity);
                    self.track(target_order.clone(), &fp, trading_date, stream, OrderRole::Target, quantity);
                    if let Some(state) = self.intents.get_mut(&fp) {
                        state.stop_order = Some(stop_order);
                        state.target_order = Some(target_order);
                        state.protected_qty = quantity;
                        state.stop_price = stop_price;
                    }
                }
                JournalEvent::BreakEvenApplied { stop_price } => {
                    if let Some(state) = self.intents.get_mut(&fp) {
                        state.breakeven_applied = true;
                        state.stop_price = stop_price;
                    }
                }
                JournalEvent::Exited { reason, exit_qty, .. } => {
                    let flat = state.open_qty() <= exit_qty;
                    let mut ids = vec![state.entry_order.clone(), state.stop_order.clone(), state.target_order.clone()];
                    if flat {
                        ids.extend(flatten_orders.remove(&fp).unwrap_or_default().into_iter().map(Some));
                        for id in ids.iter().flatten() {
                            self.retire(Some(id));
                        }
                        protect_pending.remove(&fp);
                        flatten_pending.remove(&fp);
                    }
                    if let Some(state) = self.intents.get_mut(&fp) {
                        state.exited += exit_qty;
                        state.last_exit = Some(reason);
                        if flat {
                            state.stop_order = None;
                            state.target_order = None;
                            state.protected_qty = 0;
                        }
                    }
                }
                JournalEvent::Cancelled | JournalEvent::Rejected { .. } => {
                    let entry_order = state.entry_order.clone();
                    if state.entry_filled == 0 {
                        self.retire(entry_order.as_ref());
                    }
                }
                _ => {}
            }
        }

        let mut effects = Vec::new();
        let key = (trading_date, stream.clone());
        let fail_fp = Fingerprint::for_stream_event(trading_date, stream, "fail_closed");
        if self.journal.lookup(&fail_fp).is_some() {
            self.closed_streams.insert(key.clone());
            self.failed_streams.insert(key);
            effects.push(CoordinatorEffect::StoodDown {
                trading_date,
                stream: stream.clone(),
                detail: "fail-closed before restart".to_string(),
            });
        }

        for fp in touched {
            let Some(state) = self.intents.get(&fp) else {
                continue;
            };
            let direction = state.intent.direction;
            if state.entry_filled > 0 {
                effects.push(CoordinatorEffect::EntryFilled {
                    trading_date,
                    stream: stream.clone(),
                    direction,
                    filled_qty: state.entry_filled,
                });
            }
            if let (Some(stop_order), Some(target_order)) = (&state.stop_order, &state.target_order) {
                effects.push(CoordinatorEffect::ProtectivePlaced {
                    trading_date,
                    stream: stream.clone(),
                    handles: ProtectiveHandles {
                        stop_order: stop_order.clone(),
                        target_order: target_order.clone(),
                        quantity: state.protected_qty,
                    },
                });
            }
            if state.breakeven_applied {
                effects.push(CoordinatorEffect::BreakEvenApplied {
                    trading_date,
                    stream: stream.clone(),
                });
            }
            if let (Some(reason), 0) = (state.last_exit, state.open_qty()) {
                effects.push(CoordinatorEffect::Exited {
                    trading_date,
                    stream: stream.clone(),
                    direction,
                    reason,
                });
            }
            tracing::info!(
                stream = %stream,
                fingerprint = %fp,
                entry_filled = state.entry_filled,
                open_qty = state.open_qty(),
                breakeven_applied = state.breakeven_applied,
                "Intent state rebuilt from journal"
            );
        }

        // Order actions journalled as requested but never confirmed
        for fp in flatten_pending {
            if !self.intents.get(&fp).is_some_and(|s| s.open_qty() > 0) {
                continue;
            }
            tracing::error!(
                stream = %stream,
                fingerprint = %fp,
                "unknown_submission: flatten requested but never confirmed, not resending"
            );
            self.closed_streams.insert((trading_date, stream.clone()));
            if self.failed_streams.insert((trading_date, stream.clone())) {
                effects.push(CoordinatorEffect::StoodDown {
                    trading_date,
                    stream: stream.clone(),
                    detail: "flatten unconfirmed before restart".to_string(),
                });
            }
        }
        for fp in protect_pending {
            if !self.intents.get(&fp).is_some_and(|s| s.open_qty() > 0) {
                continue;
            }
            tracing::error!(
                stream = %stream,
                fingerprint = %fp,
                "unknown_submission: protective pair requested but never confirmed"
            );
            effects.extend(self.fail_closed(
                trading_date,
                stream,
                "protective pair unconfirmed before restart".to_string(),
            ));
        }

        effects
    }

    pub fn open_qty(&self, trading_date: NaiveDate, stream: &StreamId) -> u32 {
        self.intents
            .values()
            .filter(|s| s.belongs_to(trading_date, stream))
            .map(|s| s.open_qty())
            .sum()
    }

    pub fn working_orders(&self, trading_date: NaiveDate, stream: &StreamId) -> usize {
        self.orders
            .values()
            .filter(|o| o.working && o.trading_date == trading_date && &o.stream == stream)
            .count()
    }

    pub fn is_halted(&self, instrument: &str) -> bool {
        self.halted_instruments.contains(instrument)
    }

    pub fn exposure(&self) -> Vec<IntentExposure> {
        self.intents
            .iter()
            .map(|(fp, s)| IntentExposure {
                fingerprint: fp.clone(),
                trading_date: s.intent.trading_date,
                stream: s.intent.stream.clone(),
                direction: s.intent.direction,
                entry_filled: s.entry_filled,
                exited: s.exited,
                open_qty: s.open_qty(),
                protected_qty: s.protected_qty,
                stop_price: s.stop_price,
                breakeven_applied: s.breakeven_applied,
                last_exit: s.last_exit,
            })
            .collect()
    }

    /// Forget per-day bookkeeping for dates before `trading_date`
    pub fn roll_to(&mut self, trading_date: NaiveDate) {
        self.trading_date = Some(trading_date);
        self.intents
            .retain(|_, s| s.intent.trading_date >= trading_date || s.open_qty() > 0);
        self.orders
            .retain(|_, o| o.trading_date >= trading_date || o.working);
        self.closed_streams.retain(|(d, _)| *d >= trading_date);
        self.failed_streams.retain(|(d, _)| *d >= trading_date);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperGateway;
    use crate::models::StreamKey;
    use chrono::{NaiveTime, TimeZone};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    fn key() -> StreamKey {
        StreamKey::new(date(), "ES", "S1", NaiveTime::from_hms_opt(7, 30, 0).unwrap())
    }

    fn intent(direction: Direction, qty: u32) -> Intent {
        let (entry, stop, target, trigger, be) = match direction {
            Direction::Long => (5010.25, 4999.75, 5020.25, 5016.75, 5010.5),
            Direction::Short => (4999.75, 5010.25, 4989.75, 4993.25, 4999.5),
        };
        Intent::new(date(), key().id(), "ES", direction, entry, Some(stop), Some(target), trigger, be, qty)
    }

    fn bar(high: f64, low: f64, last: f64) -> PriceUpdate {
        PriceUpdate {
            instrument: "ES".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap(),
            high,
            low,
            last,
        }
    }

    /// Paper venue that also counts every call reaching it
    #[derive(Default)]
    struct RecordingGateway {
        inner: PaperGateway,
        placed: Vec<OrderSpec>,
        flattens: usize,
        cancels: usize,
    }

    impl OrderGateway for RecordingGateway {
        fn submit(&mut self, request: OrderRequest) -> Result<OrderId, GatewayError> {
            match &request {
                OrderRequest::Place(spec) => self.placed.push(spec.clone()),
                OrderRequest::Flatten { .. } => self.flattens += 1,
            }
            self.inner.submit(request)
        }

        fn cancel(&mut self, order_id: &OrderId) -> Result<(), GatewayError> {
            self.cancels += 1;
            self.inner.cancel(order_id)
        }

        fn modify_stop(&mut self, order_id: &OrderId, trigger: f64) -> Result<(), GatewayError> {
            self.inner.modify_stop(order_id, trigger)
        }

        fn poll_events(&mut self) -> Vec<GatewayEvent> {
            self.inner.poll_events()
        }

        fn on_market(&mut self, update: &PriceUpdate) {
            self.inner.on_market(update)
        }
    }

    fn coordinator(gw: PaperGateway) -> ExecutionCoordinator<PaperGateway> {
        ExecutionCoordinator::new(gw, ExecutionJournal::in_memory())
    }

    fn step(c: &mut ExecutionCoordinator<PaperGateway>, update: PriceUpdate) -> Vec<CoordinatorEffect> {
        let mut effects = c.on_price(&update);
        c.gateway_mut().on_market(&update);
        effects.extend(c.pump());
        effects
    }

    #[test]
    fn test_entry_fill_places_protection_and_cancels_sibling() {
        let mut c = coordinator(PaperGateway::new());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        let effects = c.submit_intents(vec![intent(Direction::Long, 2), intent(Direction::Short, 2)]);
        assert!(effects.is_empty());
        assert_eq!(c.working_orders(date(), &key().id()), 2);

        let effects = step(&mut c, bar(5011.0, 5005.0, 5010.5));
        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::EntryFilled { filled_qty: 2, .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            CoordinatorEffect::ProtectivePlaced { handles, .. } if handles.quantity == 2
        )));
        assert_eq!(c.open_qty(date(), &key().id()), 2);
        // Stop and target only; the short entry is gone
        assert_eq!(c.working_orders(date(), &key().id()), 2);
    }

    #[test]
    fn test_partial_fills_resize_protection() {
        let mut c = coordinator(PaperGateway::new().with_fill_chunk(1));
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 3)]);

        step(&mut c, bar(5011.0, 5005.0, 5010.5));
        let exposure = &c.exposure()[0];
        assert_eq!(exposure.entry_filled, 1);
        assert_eq!(exposure.protected_qty, 1);

        step(&mut c, bar(5012.0, 5009.0, 5011.0));
        let exposure = &c.exposure()[0];
        assert_eq!(exposure.entry_filled, 2);
        assert_eq!(exposure.protected_qty, 2);
    }

    fn entry_order_id(journal: &ExecutionJournal) -> OrderId {
        journal
            .entries()
            .iter()
            .find_map(|e| match &e.event {
                JournalEvent::Submitted { order_id } => Some(order_id.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn entry_fill(order_id: &OrderId, quantity: u32) -> GatewayEvent {
        GatewayEvent::Filled {
            order_id: order_id.clone(),
            instrument: "ES".to_string(),
            side: Side::Buy,
            quantity,
            price: 5010.25,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 9, 13, 5, 0).unwrap(),
        }
    }

    #[test]
    fn test_any_fill_chunking_ends_fully_protected() {
        for chunks in [vec![3], vec![1, 2], vec![2, 1], vec![1, 1, 1]] {
            let mut c = ExecutionCoordinator::new(RecordingGateway::default(), ExecutionJournal::in_memory());
            c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
            c.submit_intents(vec![intent(Direction::Long, 3)]);
            let entry = entry_order_id(c.journal());

            for delta in &chunks {
                c.gateway_mut().inner.inject(entry_fill(&entry, *delta));
                c.pump();
                let exposure = &c.exposure()[0];
                assert_eq!(exposure.protected_qty, exposure.entry_filled, "chunks {:?}", chunks);
            }

            let exposure = &c.exposure()[0];
            assert_eq!(exposure.entry_filled, 3, "chunks {:?}", chunks);
            assert_eq!(exposure.protected_qty, 3, "chunks {:?}", chunks);
            // Every resize cancelled the previous stop and target
            assert_eq!(c.gateway().cancels, 2 * (chunks.len() - 1), "chunks {:?}", chunks);
            assert_eq!(c.gateway().placed.len(), 1 + 2 * chunks.len(), "chunks {:?}", chunks);
            assert_eq!(c.working_orders(date(), &key().id()), 2, "chunks {:?}", chunks);
        }
    }

    #[test]
    fn test_protection_and_flatten_journalled_before_sending() {
        let mut c = coordinator(PaperGateway::new());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        let long = intent(Direction::Long, 1);
        let fp = long.fingerprint.clone();
        c.submit_intents(vec![long]);
        step(&mut c, bar(5011.0, 5005.0, 5010.5));
        c.flatten_stream(date(), &key().id(), ExitReason::TimeCutoff);
        c.pump();

        let kinds: Vec<&'static str> = c
            .journal()
            .history(&fp)
            .map(|e| match e.event {
                JournalEvent::IntentRecorded { .. } => "recorded",
                JournalEvent::Submitted { .. } => "submitted",
                JournalEvent::EntryFilled { .. } => "filled",
                JournalEvent::ProtectiveRequested { .. } => "protect_requested",
                JournalEvent::ProtectivePlaced { .. } => "protect_placed",
                JournalEvent::FlattenRequested { .. } => "flatten_requested",
                JournalEvent::FlattenSubmitted { .. } => "flatten_submitted",
                JournalEvent::Exited { .. } => "exited",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "recorded",
                "submitted",
                "filled",
                "protect_requested",
                "protect_placed",
                "flatten_requested",
                "flatten_submitted",
                "exited"
            ]
        );
    }

    fn journal_through_fill(tail: Vec<JournalEvent>) -> (ExecutionJournal, Fingerprint) {
        let long = intent(Direction::Long, 1);
        let fp = long.fingerprint.clone();
        let ts = Utc.with_ymd_and_hms(2026, 3, 9, 13, 5, 0).unwrap();
        let mut journal = ExecutionJournal::in_memory();
        let mut events = vec![
            JournalEvent::IntentRecorded { intent: long },
            JournalEvent::Submitted {
                order_id: OrderId("entry-1".to_string()),
            },
            JournalEvent::EntryFilled {
                filled_qty: 1,
                price: 5010.25,
            },
        ];
        events.extend(tail);
        for event in events {
            journal.append(fp.clone(), date(), key().id(), ts, event).unwrap();
        }
        (journal, fp)
    }

    #[test]
    fn test_rehydrate_unconfirmed_protection_fails_closed() {
        let (journal, fp) = journal_through_fill(vec![JournalEvent::ProtectiveRequested {
            quantity: 1,
            stop_price: 4999.75,
            target_price: 5020.25,
        }]);
        let mut c = ExecutionCoordinator::new(RecordingGateway::default(), journal);
        c.gateway_mut().on_market(&bar(5012.0, 5010.0, 5011.0));

        let effects = c.rehydrate(date(), &key().id());
        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::StoodDown { .. })));
        // Closed with a market order, never re-protected
        assert_eq!(c.gateway().placed.len(), 1);
        assert_eq!(c.gateway().placed[0].kind, OrderKind::Market);
        assert_eq!(c.journal().outcome(&fp), Some(Outcome::Flattening));
    }

    #[test]
    fn test_rehydrate_unconfirmed_flatten_is_not_resent() {
        let (journal, _) = journal_through_fill(vec![
            JournalEvent::ProtectiveRequested {
                quantity: 1,
                stop_price: 4999.75,
                target_price: 5020.25,
            },
            JournalEvent::ProtectivePlaced {
                stop_order: OrderId("stop-1".to_string()),
                target_order: OrderId("target-1".to_string()),
                quantity: 1,
                stop_price: 4999.75,
                target_price: 5020.25,
            },
            JournalEvent::FlattenRequested {
                reason: ExitReason::TimeCutoff,
                quantity: 1,
            },
        ]);
        let mut c = ExecutionCoordinator::new(RecordingGateway::default(), journal);
        c.gateway_mut().on_market(&bar(5012.0, 5010.0, 5011.0));

        let effects = c.rehydrate(date(), &key().id());
        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::StoodDown { .. })));
        assert!(c.gateway().placed.is_empty());
        assert_eq!(c.gateway().flattens, 0);
    }

    #[test]
    fn test_rehydrated_flatten_fill_maps_to_intent() {
        let (journal, _) = journal_through_fill(vec![
            JournalEvent::FlattenRequested {
                reason: ExitReason::TimeCutoff,
                quantity: 1,
            },
            JournalEvent::FlattenSubmitted {
                order_id: OrderId("flat-1".to_string()),
                reason: ExitReason::TimeCutoff,
                quantity: 1,
            },
        ]);
        let mut c = coordinator(PaperGateway::new());
        c.journal = journal;
        c.rehydrate(date(), &key().id());

        let effects = c.handle_event(GatewayEvent::Filled {
            order_id: OrderId("flat-1".to_string()),
            instrument: "ES".to_string(),
            side: Side::Sell,
            quantity: 1,
            price: 5011.0,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 9, 13, 10, 0).unwrap(),
        });
        assert!(effects.iter().any(|e| matches!(
            e,
            CoordinatorEffect::Exited { reason: ExitReason::TimeCutoff, .. }
        )));
        assert!(!c.is_halted("ES"));
    }

    #[test]
    fn test_instrument_flatten_uses_trading_date() {
        let mut c = coordinator(PaperGateway::new());
        c.roll_to(date());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 1)]);

        // 20:00 CDT on the 9th is already the 10th in UTC
        c.gateway_mut().inject(GatewayEvent::Filled {
            order_id: OrderId("mystery".to_string()),
            instrument: "ES".to_string(),
            side: Side::Buy,
            quantity: 1,
            price: 5004.5,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 10, 1, 0, 0).unwrap(),
        });
        c.pump();

        let instrument = StreamId("ES".to_string());
        let fp = Fingerprint::for_stream_event(date(), &instrument, "instrument_flatten");
        let entry = c.journal().lookup(&fp).unwrap();
        assert_eq!(entry.trading_date, date());
        assert!(c
            .journal()
            .entries()
            .iter()
            .all(|e| e.trading_date == date()));

        // Same-day roll keeps the flatten order attributed
        c.roll_to(date());
        assert!(c.orders.values().any(|o| o.fingerprint == fp && o.trading_date == date()));
    }

    #[test]
    fn test_target_exit_and_flat() {
        let mut c = coordinator(PaperGateway::new());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 1), intent(Direction::Short, 1)]);
        step(&mut c, bar(5011.0, 5005.0, 5010.5));

        let effects = step(&mut c, bar(5021.0, 5012.0, 5020.0));
        assert!(effects.iter().any(|e| matches!(
            e,
            CoordinatorEffect::Exited { reason: ExitReason::Target, .. }
        )));
        assert_eq!(c.open_qty(date(), &key().id()), 0);
        assert_eq!(c.working_orders(date(), &key().id()), 0);
        assert_eq!(c.gateway().position("ES"), 0);
    }

    #[test]
    fn test_breakeven_applied_once_then_stop_labelled() {
        let mut c = coordinator(PaperGateway::new());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 1)]);
        step(&mut c, bar(5011.0, 5005.0, 5010.5));

        let effects = step(&mut c, bar(5017.0, 5012.0, 5016.0));
        let applied = effects
            .iter()
            .filter(|e| matches!(e, CoordinatorEffect::BreakEvenApplied { .. }))
            .count();
        assert_eq!(applied, 1);
        assert_eq!(c.exposure()[0].stop_price, 5010.5);

        // Trigger trades again: no second application
        let effects = step(&mut c, bar(5018.0, 5015.0, 5016.0));
        assert!(!effects.iter().any(|e| matches!(e, CoordinatorEffect::BreakEvenApplied { .. })));

        let effects = step(&mut c, bar(5015.0, 5010.0, 5010.0));
        assert!(effects.iter().any(|e| matches!(
            e,
            CoordinatorEffect::Exited { reason: ExitReason::BreakEvenStop, .. }
        )));
    }

    #[test]
    fn test_breakeven_falls_back_to_replace() {
        let mut c = coordinator(PaperGateway::new().without_modify());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 1)]);
        // Close above the break-even stop so the replacement is accepted
        step(&mut c, bar(5012.0, 5005.0, 5011.5));

        let effects = step(&mut c, bar(5017.0, 5012.0, 5016.0));
        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::ProtectivePlaced { .. })));
        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::BreakEvenApplied { .. })));
        assert_eq!(c.working_orders(date(), &key().id()), 2);
    }

    #[test]
    fn test_duplicate_intent_suppressed() {
        let mut c = coordinator(PaperGateway::new());
        c.submit_intents(vec![intent(Direction::Long, 1)]);
        c.submit_intents(vec![intent(Direction::Long, 1)]);
        assert_eq!(c.gateway().working_orders(), 1);
        let recorded = c
            .journal()
            .entries()
            .iter()
            .filter(|e| matches!(e.event, JournalEvent::IntentRecorded { .. }))
            .count();
        assert_eq!(recorded, 1);
    }

    #[test]
    fn test_resubmission_never_reaches_venue() {
        let mut c = ExecutionCoordinator::new(RecordingGateway::default(), ExecutionJournal::in_memory());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        for _ in 0..3 {
            c.submit_intents(vec![intent(Direction::Long, 1), intent(Direction::Short, 1)]);
        }
        assert_eq!(c.gateway().placed.len(), 2);
        assert_eq!(c.gateway().cancels, 0);
    }

    #[test]
    fn test_unknown_fill_flattens_once_without_protection() {
        let mut c = ExecutionCoordinator::new(RecordingGateway::default(), ExecutionJournal::in_memory());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 1)]);

        let fill = bar(5011.0, 5005.0, 5010.5);
        c.on_price(&fill);
        c.gateway_mut().on_market(&fill);
        c.pump();
        // Entry, stop, target
        assert_eq!(c.gateway().placed.len(), 3);

        c.gateway_mut().inner.inject(GatewayEvent::Filled {
            order_id: OrderId("mystery".to_string()),
            instrument: "ES".to_string(),
            side: Side::Sell,
            quantity: 1,
            price: 5010.0,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 9, 13, 5, 0).unwrap(),
        });
        let effects = c.pump();

        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::InstrumentHalted { .. })));
        assert_eq!(c.gateway().flattens, 1);
        assert_eq!(c.gateway().placed.len(), 3);
        assert_eq!(c.gateway().inner.position("ES"), 0);
        assert_eq!(c.open_qty(date(), &key().id()), 0);
    }

    #[test]
    fn test_intent_without_legs_fails_closed() {
        let mut c = ExecutionCoordinator::new(RecordingGateway::default(), ExecutionJournal::in_memory());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        let mut bad = intent(Direction::Long, 1);
        bad.stop_price = None;
        let effects = c.submit_intents(vec![bad, intent(Direction::Short, 1)]);

        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], CoordinatorEffect::StoodDown { .. }));
        // The valid sibling never reaches the venue
        assert!(c.gateway().placed.is_empty());
        assert_eq!(c.gateway().inner.working_orders(), 0);
        let fail_fp = Fingerprint::for_stream_event(date(), &key().id(), "fail_closed");
        assert_eq!(c.journal().outcome(&fail_fp), Some(Outcome::FailClosed));
    }

    #[test]
    fn test_intent_without_legs_cancels_submitted_sibling() {
        let mut c = coordinator(PaperGateway::new());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        let mut bad = intent(Direction::Short, 1);
        bad.target_price = None;
        let effects = c.submit_intents(vec![intent(Direction::Long, 1), bad]);

        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::StoodDown { .. })));
        c.pump();
        assert_eq!(c.gateway().working_orders(), 0);
        assert_eq!(c.working_orders(date(), &key().id()), 0);
        assert_eq!(c.gateway().position("ES"), 0);
    }

    #[test]
    fn test_rejected_protective_fails_closed() {
        let mut c = coordinator(PaperGateway::new().reject_tag(":stop"));
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 1)]);

        let effects = step(&mut c, bar(5011.0, 5005.0, 5010.5));
        assert!(effects.iter().any(|e| matches!(e, CoordinatorEffect::StoodDown { .. })));
        assert_eq!(c.open_qty(date(), &key().id()), 0);
        assert_eq!(c.gateway().position("ES"), 0);
        assert_eq!(c.working_orders(date(), &key().id()), 0);
    }

    #[test]
    fn test_unmapped_fill_halts_instrument() {
        let mut c = coordinator(PaperGateway::new());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 1)]);
        c.gateway_mut().inject(GatewayEvent::Filled {
            order_id: OrderId("mystery".to_string()),
            instrument: "ES".to_string(),
            side: Side::Buy,
            quantity: 1,
            price: 5004.5,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap(),
        });

        let effects = c.pump();
        assert!(matches!(effects[0], CoordinatorEffect::InstrumentHalted { .. }));
        assert!(c.is_halted("ES"));
        assert_eq!(c.working_orders(date(), &key().id()), 0);

        // No new exposure on that instrument
        c.submit_intents(vec![intent(Direction::Short, 1)]);
        assert_eq!(c.gateway().working_orders(), 0);
    }

    #[test]
    fn test_flatten_stream_at_cutoff() {
        let mut c = coordinator(PaperGateway::new());
        c.gateway_mut().on_market(&bar(5005.0, 5004.0, 5004.5));
        c.submit_intents(vec![intent(Direction::Long, 2)]);
        step(&mut c, bar(5011.0, 5005.0, 5010.5));

        c.flatten_stream(date(), &key().id(), ExitReason::TimeCutoff);
        let effects = c.pump();
        assert!(effects.iter().any(|e| matches!(
            e,
            CoordinatorEffect::Exited { reason: ExitReason::TimeCutoff, .. }
        )));
        assert_eq!(c.gateway().position("ES"), 0);
        assert_eq!(c.working_orders(date(), &key().id()), 0);
    }
}
