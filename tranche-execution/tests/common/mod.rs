#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use tranche_broker::{BrokerError, BrokerResult, ExchangeAdapter};
use tranche_config::AppConfig;
use tranche_core::{MarketSnapshot, OrderAck, OrderId, OrderRequest, Side, Signal};
use tranche_execution::{Event, Scheduler};
use tranche_portfolio::MemorySink;

/// Adapter that records requests and never produces acks on its own.
#[derive(Default)]
pub struct MockExchange {
    pub placed: Vec<(OrderId, OrderRequest)>,
    pub cancelled: Vec<OrderId>,
    /// Fail the n-th placement (1-based).
    pub fail_on_place: Option<usize>,
    attempts: usize,
}

impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    fn place_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderId> {
        self.attempts += 1;
        if self.fail_on_place == Some(self.attempts) {
            return Err(BrokerError::Transport("connection reset".into()));
        }
        let id = format!("mock-{}", self.placed.len() + 1);
        self.placed.push((id.clone(), request.clone()));
        Ok(id)
    }

    fn cancel_order(&mut self, order_id: &OrderId) -> BrokerResult<()> {
        self.cancelled.push(order_id.clone());
        Ok(())
    }
}

impl MockExchange {
    /// Adapter whose `n`-th placement (1-based) fails with a transport error.
    pub fn failing_on(n: usize) -> Self {
        Self {
            fail_on_place: Some(n),
            ..Self::default()
        }
    }

    /// Placed orders for `symbol`, oldest first.
    pub fn orders_for(&self, symbol: &str) -> Vec<(OrderId, OrderRequest)> {
        self.placed
            .iter()
            .filter(|(_, request)| request.symbol == symbol)
            .cloned()
            .collect()
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
}

pub fn at(ms: i64) -> DateTime<Utc> {
    t0() + Duration::milliseconds(ms)
}

pub fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.cluster_map = "BTCUSDT:mega;ETHUSDT:mega".parse().unwrap();
    config
}

pub fn scheduler(config: &AppConfig) -> Scheduler<MockExchange> {
    Scheduler::new(config, MockExchange::default(), Box::new(MemorySink::new())).unwrap()
}

pub fn market(symbol: &str, bid: i64, ask: i64, ms: i64) -> Event {
    Event::Market(MarketSnapshot::new(
        symbol,
        cents(bid),
        cents(ask),
        Decimal::from(10),
        at(ms),
    ))
}

pub fn signal(symbol: &str, side: Side, notional: i64, ms: i64) -> Event {
    Event::Signal(Signal::new(symbol, side, 2.0, Decimal::from(notional), at(ms)))
}

pub fn fill(order: &(OrderId, OrderRequest), price: Decimal, ms: i64) -> Event {
    Event::OrderAck(OrderAck::filled(order.0.clone(), order.1.size, price, at(ms)))
}

pub fn canceled(order_id: &str, ms: i64) -> Event {
    Event::OrderAck(OrderAck::canceled(order_id, Decimal::ZERO, at(ms)))
}
