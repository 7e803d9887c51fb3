use super::gateway::{
    GatewayError, GatewayEvent, OrderGateway, OrderId, OrderKind, OrderRequest, OrderSpec,
};
use crate::models::{PriceUpdate, Side};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
struct WorkingOrder {
    id: OrderId,
    spec: OrderSpec,
    remaining: u32,
}

/// Simulated broker that matches resting orders against bar extremes
///
/// Stops fill at their trigger, limits at their price, market orders at the
/// last seen price. Orders are matched in submission order.
#[derive(Debug, Default)]
pub struct PaperGateway {
    working: Vec<WorkingOrder>,
    events: VecDeque<GatewayEvent>,
    positions: HashMap<String, i64>,
    last_price: HashMap<String, f64>,
    last_time: Option<DateTime<Utc>>,
    fill_chunk: Option<u32>,
    reject_tags: Vec<String>,
    modify_unsupported: bool,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split every resting-order fill into pieces of at most `chunk`
    pub fn with_fill_chunk(mut self, chunk: u32) -> Self {
        self.fill_chunk = Some(chunk.max(1));
        self
    }

    /// Reject any order whose tag contains `fragment`
    pub fn reject_tag(mut self, fragment: impl Into<String>) -> Self {
        self.reject_tags.push(fragment.into());
        self
    }

    /// Refuse in-place stop modification (forces cancel-and-recreate)
    pub fn without_modify(mut self) -> Self {
        self.modify_unsupported = true;
        self
    }

    /// Net signed position per instrument
    pub fn position(&self, instrument: &str) -> i64 {
        self.positions.get(instrument).copied().unwrap_or(0)
    }

    pub fn working_orders(&self) -> usize {
        self.working.len()
    }

    pub fn last_price(&self, instrument: &str) -> Option<f64> {
        self.last_price.get(instrument).copied()
    }

    /// Queue an externally originated event
    pub fn inject(&mut self, event: GatewayEvent) {
        self.events.push_back(event);
    }

    fn fill(&mut self, order_id: OrderId, instrument: &str, side: Side, quantity: u32, price: f64) {
        let signed = match side {
            Side::Buy => quantity as i64,
            Side::Sell => -(quantity as i64),
        };
        *self.positions.entry(instrument.to_string()).or_insert(0) += signed;

        tracing::debug!(
            order = %order_id,
            instrument,
            side = ?side,
            quantity,
            price,
            "Paper fill"
        );

        self.events.push_back(GatewayEvent::Filled {
            order_id,
            instrument: instrument.to_string(),
            side,
            quantity,
            price,
            timestamp: self.last_time.unwrap_or_else(Utc::now),
        });
    }

    fn trigger_price(spec: &OrderSpec, update: &PriceUpdate) -> Option<f64> {
        match (spec.kind, spec.side) {
            (OrderKind::StopMarket { trigger }, Side::Buy) if update.high >= trigger => {
                Some(trigger.max(update.low))
            }
            (OrderKind::StopMarket { trigger }, Side::Sell) if update.low <= trigger => {
                Some(trigger.min(update.high))
            }
            (OrderKind::Limit { price }, Side::Buy) if update.low <= price => Some(price),
            (OrderKind::Limit { price }, Side::Sell) if update.high >= price => Some(price),
            _ => None,
        }
    }

    fn cancel_group(&mut self, group: &str, except: &OrderId) {
        let (cancelled, kept): (Vec<_>, Vec<_>) = self
            .working
            .drain(..)
            .partition(|o| o.spec.oco_group.as_deref() == Some(group) && &o.id != except);
        self.working = kept;
        for order in cancelled {
            self.events.push_back(GatewayEvent::Cancelled { order_id: order.id });
        }
    }
}

impl OrderGateway for PaperGateway {
    fn submit(&mut self, request: OrderRequest) -> Result<OrderId, GatewayError> {
        let order_id = OrderId::generate();

        match request {
            OrderRequest::Flatten { instrument, tag } => {
                let net = self.position(&instrument);
                if net != 0 {
                    let price = self.last_price(&instrument).ok_or_else(|| {
                        GatewayError::Rejected(format!("no market price for {}", instrument))
                    })?;
                    let side = if net > 0 { Side::Sell } else { Side::Buy };
                    tracing::info!(instrument = %instrument, tag = %tag, net, "Paper flatten");
                    self.fill(order_id.clone(), &instrument, side, net.unsigned_abs() as u32, price);
                }
                Ok(order_id)
            }
            OrderRequest::Place(spec) => {
                if spec.quantity == 0 {
                    return Err(GatewayError::Rejected("zero quantity".to_string()));
                }

                if self.reject_tags.iter().any(|t| spec.tag.contains(t.as_str())) {
                    self.events.push_back(GatewayEvent::Rejected {
                        order_id: order_id.clone(),
                        reason: format!("rejected by venue: {}", spec.tag),
                    });
                    return Ok(order_id);
                }

                let last = self.last_price(&spec.instrument);
                match spec.kind {
                    OrderKind::Market => {
                        let price = last.ok_or_else(|| {
                            GatewayError::Rejected(format!("no market price for {}", spec.instrument))
                        })?;
                        self.fill(order_id.clone(), &spec.instrument, spec.side, spec.quantity, price);
                    }
                    OrderKind::StopMarket { trigger } => {
                        let wrong_side = match (spec.side, last) {
                            (Side::Buy, Some(px)) => trigger <= px,
                            (Side::Sell, Some(px)) => trigger >= px,
                            (_, None) => false,
                        };
                        if wrong_side {
                            self.events.push_back(GatewayEvent::Rejected {
                                order_id: order_id.clone(),
                                reason: format!("stop {} on wrong side of market", trigger),
                            });
                        } else {
                            self.working.push(WorkingOrder {
                                id: order_id.clone(),
                                remaining: spec.quantity,
                                spec,
                            });
                        }
                    }
                    OrderKind::Limit { .. } => {
                        self.working.push(WorkingOrder {
                            id: order_id.clone(),
                            remaining: spec.quantity,
                            spec,
                        });
                    }
                }
                Ok(order_id)
            }
        }
    }

    fn cancel(&mut self, order_id: &OrderId) -> Result<(), GatewayError> {
        let pos = self
            .working
            .iter()
            .position(|o| &o.id == order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.clone()))?;
        self.working.remove(pos);
        self.events.push_back(GatewayEvent::Cancelled {
            order_id: order_id.clone(),
        });
        Ok(())
    }

    fn modify_stop(&mut self, order_id: &OrderId, trigger: f64) -> Result<(), GatewayError> {
        if self.modify_unsupported {
            return Err(GatewayError::NotModifiable(order_id.clone()));
        }
        let order = self
            .working
            .iter_mut()
            .find(|o| &o.id == order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.clone()))?;
        match &mut order.spec.kind {
            OrderKind::StopMarket { trigger: t } => {
                *t = trigger;
                Ok(())
            }
            _ => Err(GatewayError::NotModifiable(order_id.clone())),
        }
    }

    fn poll_events(&mut self) -> Vec<GatewayEvent> {
        self.events.drain(..).collect()
    }

    fn on_market(&mut self, update: &PriceUpdate) {
        self.last_price.insert(update.instrument.clone(), update.last);
        self.last_time = Some(update.timestamp);

        let triggered: Vec<(OrderId, f64)> = self
            .working
            .iter()
            .filter(|o| o.spec.instrument == update.instrument)
            .filter_map(|o| Self::trigger_price(&o.spec, update).map(|px| (o.id.clone(), px)))
            .collect();

        for (order_id, price) in triggered {
            // May already be gone through an OCO sibling earlier in this pass
            let Some(idx) = self.working.iter().position(|o| o.id == order_id) else {
                continue;
            };
            let order = &self.working[idx];
            let quantity = self.fill_chunk.map_or(order.remaining, |c| c.min(order.remaining));
            let instrument = order.spec.instrument.clone();
            let side = order.spec.side;
            let group = order.spec.oco_group.clone();

            self.working[idx].remaining -= quantity;
            if self.working[idx].remaining == 0 {
                self.working.remove(idx);
            }
            self.fill(order_id.clone(), &instrument, side, quantity, price);

            if let Some(group) = group {
                self.cancel_group(&group, &order_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn update(high: f64, low: f64, last: f64) -> PriceUpdate {
        PriceUpdate {
            instrument: "ES".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap(),
            high,
            low,
            last,
        }
    }

    fn stop(side: Side, trigger: f64, qty: u32, group: Option<&str>) -> OrderRequest {
        OrderRequest::Place(OrderSpec {
            instrument: "ES".to_string(),
            side,
            quantity: qty,
            kind: OrderKind::StopMarket { trigger },
            tag: "test".to_string(),
            oco_group: group.map(str::to_string),
        })
    }

    #[test]
    fn test_stop_triggers_on_extreme() {
        let mut gw = PaperGateway::new();
        let id = gw.submit(stop(Side::Buy, 5010.25, 2, None)).unwrap();

        gw.on_market(&update(5010.0, 5005.0, 5008.0));
        assert!(gw.poll_events().is_empty());

        gw.on_market(&update(5012.0, 5008.0, 5011.0));
        let events = gw.poll_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            GatewayEvent::Filled { order_id, quantity, price, .. } => {
                assert_eq!(order_id, &id);
                assert_eq!(*quantity, 2);
                assert_eq!(*price, 5010.25);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(gw.position("ES"), 2);
        assert_eq!(gw.working_orders(), 0);
    }

    #[test]
    fn test_oco_sibling_cancelled() {
        let mut gw = PaperGateway::new();
        gw.submit(stop(Side::Buy, 5010.25, 1, Some("g"))).unwrap();
        let short = gw.submit(stop(Side::Sell, 4999.75, 1, Some("g"))).unwrap();

        // Bar spans both triggers; only the first in submission order fills
        gw.on_market(&update(5011.0, 4999.0, 5000.0));
        let events = gw.poll_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], GatewayEvent::Filled { .. }));
        assert_eq!(events[1], GatewayEvent::Cancelled { order_id: short });
        assert_eq!(gw.position("ES"), 1);
    }

    #[test]
    fn test_fill_chunks() {
        let mut gw = PaperGateway::new().with_fill_chunk(1);
        gw.submit(stop(Side::Sell, 4999.75, 3, None)).unwrap();
        gw.on_market(&update(5000.0, 4999.0, 4999.5));
        gw.on_market(&update(5000.0, 4999.0, 4999.5));
        let fills = gw
            .poll_events()
            .into_iter()
            .filter(|e| matches!(e, GatewayEvent::Filled { quantity: 1, .. }))
            .count();
        assert_eq!(fills, 2);
        assert_eq!(gw.position("ES"), -2);
        assert_eq!(gw.working_orders(), 1);
    }

    #[test]
    fn test_wrong_side_stop_rejected() {
        let mut gw = PaperGateway::new();
        gw.on_market(&update(5010.0, 5000.0, 5005.0));
        gw.submit(stop(Side::Sell, 5006.0, 1, None)).unwrap();
        let events = gw.poll_events();
        assert!(matches!(events[0], GatewayEvent::Rejected { .. }));
        assert_eq!(gw.working_orders(), 0);
    }

    #[test]
    fn test_flatten_closes_net_position() {
        let mut gw = PaperGateway::new();
        gw.submit(stop(Side::Buy, 5001.0, 3, None)).unwrap();
        gw.on_market(&update(5002.0, 5000.0, 5001.5));
        gw.poll_events();

        gw.submit(OrderRequest::Flatten {
            instrument: "ES".to_string(),
            tag: "flatten".to_string(),
        })
        .unwrap();
        let events = gw.poll_events();
        assert!(matches!(
            events[0],
            GatewayEvent::Filled { side: Side::Sell, quantity: 3, price, .. } if price == 5001.5
        ));
        assert_eq!(gw.position("ES"), 0);
    }

    #[test]
    fn test_modify_and_cancel() {
        let mut gw = PaperGateway::new();
        let id = gw.submit(stop(Side::Sell, 4990.0, 1, None)).unwrap();
        gw.modify_stop(&id, 4995.0).unwrap();
        gw.on_market(&update(5000.0, 4994.0, 4996.0));
        assert_eq!(gw.position("ES"), -1);

        let other = gw.submit(stop(Side::Sell, 4980.0, 1, None)).unwrap();
        gw.cancel(&other).unwrap();
        assert_eq!(gw.cancel(&other), Err(GatewayError::UnknownOrder(other.clone())));

        let mut strict = PaperGateway::new().without_modify();
        let id = strict.submit(stop(Side::Sell, 4990.0, 1, None)).unwrap();
        assert!(matches!(
            strict.modify_stop(&id, 4995.0),
            Err(GatewayError::NotModifiable(_))
        ));
    }
}
