//! Paper exchange used for replays and tests.
//!
//! Matching is driven entirely by the snapshots fed through
//! [`ExchangeAdapter::observe_market`]:
//! - post-only orders that would cross are rejected with
//!   [`RejectReason::PostOnlyWouldCross`].
//! - resting orders fill at their own price once the opposite touch trades through them.
//! - IOC and market orders take liquidity at the opposite touch, bounded by the queue depth.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, trace};
use tranche_broker::{BrokerError, BrokerResult, ExchangeAdapter};
use tranche_core::{
    MarketSnapshot, OrderAck, OrderId, OrderRequest, OrderStatus, OrderType, Price, Quantity,
    RejectReason, Side, Symbol, TimeInForce,
};

/// Order-level metadata stored for orders resting on the simulated book.
#[derive(Clone, Debug)]
struct RestingOrder {
    request: OrderRequest,
    price: Price,
    filled: Quantity,
}

impl RestingOrder {
    fn remaining(&self) -> Quantity {
        (self.request.size - self.filled).max(Decimal::ZERO)
    }
}

/// Simulated venue implementing [`ExchangeAdapter`].
#[derive(Debug, Default)]
pub struct PaperExchange {
    name: String,
    markets: HashMap<Symbol, MarketSnapshot>,
    // Ordered so matching is deterministic.
    open_orders: BTreeMap<u64, RestingOrder>,
    acks: Vec<OrderAck>,
    next_id: u64,
    clock: Option<DateTime<Utc>>,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Number of orders resting on the simulated book.
    pub fn open_orders(&self) -> usize {
        self.open_orders.len()
    }

    /// Request of a resting order, if it is still open.
    pub fn resting(&self, order_id: &str) -> Option<&OrderRequest> {
        parse_id(order_id)
            .and_then(|seq| self.open_orders.get(&seq))
            .map(|resting| &resting.request)
    }

    /// Execute `notional` of a resting order at its limit price, as if a
    /// counterparty traded against it.
    pub fn fill_resting(&mut self, order_id: &str, notional: Quantity) -> BrokerResult<()> {
        let seq = parse_id(order_id).ok_or_else(|| BrokerError::UnknownOrder(order_id.into()))?;
        let timestamp = self.now();
        let resting = self
            .open_orders
            .get_mut(&seq)
            .ok_or_else(|| BrokerError::UnknownOrder(order_id.into()))?;
        resting.filled += notional.min(resting.remaining());
        let done = resting.remaining().is_zero();
        let ack = if done {
            OrderAck::filled(order_id, resting.filled, resting.price, timestamp)
        } else {
            OrderAck::partially_filled(order_id, resting.filled, resting.price, timestamp)
        };
        if done {
            self.open_orders.remove(&seq);
        }
        self.acks.push(ack);
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn crosses(snapshot: &MarketSnapshot, side: Side, price: Price) -> bool {
        match side {
            Side::Buy => price >= snapshot.best_ask,
            Side::Sell => price <= snapshot.best_bid,
        }
    }

    /// Take liquidity at the opposite touch. Returns the filled notional and price.
    fn take(
        snapshot: &MarketSnapshot,
        request: &OrderRequest,
        limit: Option<Price>,
    ) -> (Quantity, Price) {
        let touch = snapshot.opposite_best(request.side);
        if let Some(limit) = limit {
            if !Self::crosses(snapshot, request.side, limit) {
                return (Decimal::ZERO, touch);
            }
        }
        (request.size.min(snapshot.queue_depth), touch)
    }
}

fn order_id(seq: u64) -> OrderId {
    format!("paper-{seq}")
}

fn parse_id(order_id: &str) -> Option<u64> {
    order_id.strip_prefix("paper-")?.parse().ok()
}

impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn place_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderId> {
        if request.size <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(format!(
                "order size must be positive, got {}",
                request.size
            )));
        }
        let snapshot = self
            .markets
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| {
                BrokerError::Exchange(format!("no market data for {}", request.symbol))
            })?;
        self.next_id += 1;
        let seq = self.next_id;
        let id = order_id(seq);
        let timestamp = self.now();

        let limit = match request.order_type {
            OrderType::Market => None,
            OrderType::Limit => Some(request.price.ok_or_else(|| {
                BrokerError::InvalidRequest("limit order requires price".into())
            })?),
        };

        match (limit, request.time_in_force) {
            (Some(price), Some(TimeInForce::PostOnly))
                if Self::crosses(&snapshot, request.side, price) =>
            {
                debug!(order_id = %id, %price, "post-only order would cross");
                self.acks.push(OrderAck::rejected(
                    id.clone(),
                    RejectReason::PostOnlyWouldCross,
                    timestamp,
                ));
            }
            (None, _) | (_, Some(TimeInForce::ImmediateOrCancel)) => {
                let (filled, price) = Self::take(&snapshot, request, limit);
                let ack = if filled >= request.size {
                    OrderAck::filled(id.clone(), filled, price, timestamp)
                } else {
                    OrderAck {
                        avg_fill_price: (filled > Decimal::ZERO).then_some(price),
                        ..OrderAck::canceled(id.clone(), filled, timestamp)
                    }
                };
                debug!(order_id = %id, %filled, status = ?ack.status, "immediate order matched");
                self.acks.push(ack);
            }
            (Some(price), _) => {
                let mut resting = RestingOrder {
                    request: request.clone(),
                    price,
                    filled: Decimal::ZERO,
                };
                self.acks.push(OrderAck::accepted(id.clone(), timestamp));
                if Self::crosses(&snapshot, request.side, price) {
                    let (filled, touch) = Self::take(&snapshot, request, limit);
                    resting.filled = filled;
                    resting.price = touch;
                }
                if resting.remaining().is_zero() {
                    self.acks.push(OrderAck::filled(
                        id.clone(),
                        resting.filled,
                        resting.price,
                        timestamp,
                    ));
                } else {
                    if resting.filled > Decimal::ZERO {
                        self.acks.push(OrderAck::partially_filled(
                            id.clone(),
                            resting.filled,
                            resting.price,
                            timestamp,
                        ));
                    }
                    trace!(order_id = %id, %price, "order resting");
                    self.open_orders.insert(seq, resting);
                }
            }
        }
        Ok(id)
    }

    fn cancel_order(&mut self, order_id: &OrderId) -> BrokerResult<()> {
        let resting = parse_id(order_id)
            .and_then(|seq| self.open_orders.remove(&seq))
            .ok_or_else(|| BrokerError::UnknownOrder(order_id.clone()))?;
        let timestamp = self.now();
        self.acks.push(OrderAck {
            avg_fill_price: (resting.filled > Decimal::ZERO).then_some(resting.price),
            ..OrderAck::canceled(order_id.clone(), resting.filled, timestamp)
        });
        Ok(())
    }

    fn observe_market(&mut self, snapshot: &MarketSnapshot) {
        self.clock = Some(
            self.clock
                .map_or(snapshot.timestamp, |now| now.max(snapshot.timestamp)),
        );
        self.markets
            .insert(snapshot.symbol.clone(), snapshot.clone());

        let traded: Vec<u64> = self
            .open_orders
            .iter()
            .filter(|(_, resting)| resting.request.symbol == snapshot.symbol)
            .filter(|(_, resting)| match resting.request.side {
                Side::Buy => snapshot.best_ask <= resting.price,
                Side::Sell => snapshot.best_bid >= resting.price,
            })
            .map(|(seq, _)| *seq)
            .collect();
        for seq in traded {
            if let Some(mut resting) = self.open_orders.remove(&seq) {
                resting.filled = resting.request.size;
                debug!(order_id = %order_id(seq), price = %resting.price, "resting order traded through");
                self.acks.push(OrderAck::filled(
                    order_id(seq),
                    resting.filled,
                    resting.price,
                    snapshot.timestamp,
                ));
            }
        }
    }

    fn poll_acks(&mut self) -> Vec<OrderAck> {
        std::mem::take(&mut self.acks)
    }
}
