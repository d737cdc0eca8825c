//! Maximum favorable / adverse excursion tracking for open positions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tranche_core::{Price, Quantity, Side, Symbol};

use crate::{ClosedPosition, Position};

/// Finalized statistics for one closed trade.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub symbol: Symbol,
    pub side: Side,
    pub notional: Quantity,
    pub entry_price: Price,
    pub exit_price: Price,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    /// Best price move in the trade's favor, as a non-negative price distance.
    pub mfe: Price,
    /// Worst price move against the trade, as a non-negative price distance.
    pub mae: Price,
    pub pnl: Decimal,
}

/// Destination for finalized trade records. Persistence lives behind this trait.
pub trait MetricsSink: Send {
    fn record(&mut self, record: MetricsRecord);
}

/// Collects records in memory; clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<MetricsRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, record: MetricsRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Emits every record as a structured `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, record: MetricsRecord) {
        info!(
            target: "tranche::metrics",
            symbol = %record.symbol,
            side = %record.side,
            notional = %record.notional,
            entry = %record.entry_price,
            exit = %record.exit_price,
            mfe = %record.mfe,
            mae = %record.mae,
            pnl = %record.pnl,
            held_ms = (record.exit_time - record.entry_time).num_milliseconds(),
            "trade metrics"
        );
    }
}

#[derive(Clone, Debug)]
struct Excursion {
    high: Price,
    low: Price,
}

impl Excursion {
    fn new(price: Price) -> Self {
        Self {
            high: price,
            low: price,
        }
    }

    fn update(&mut self, price: Price) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
    }

    /// (favorable, adverse) distances from `entry` for `side`.
    fn extremes(&self, side: Side, entry: Price) -> (Price, Price) {
        let (favorable, adverse) = match side {
            Side::Buy => (self.high - entry, entry - self.low),
            Side::Sell => (entry - self.low, self.high - entry),
        };
        (favorable.max(Decimal::ZERO), adverse.max(Decimal::ZERO))
    }
}

/// Passive observer of open positions and the mid prices that follow them.
pub struct MetricsRecorder {
    open: HashMap<Symbol, Excursion>,
    sink: Box<dyn MetricsSink>,
}

impl MetricsRecorder {
    pub fn new(sink: Box<dyn MetricsSink>) -> Self {
        Self {
            open: HashMap::new(),
            sink,
        }
    }

    /// Start (or keep) tracking `position`. Re-opening an already tracked symbol keeps its path.
    pub fn on_open(&mut self, position: &Position) {
        self.open
            .entry(position.symbol.clone())
            .and_modify(|excursion| excursion.update(position.entry_price))
            .or_insert_with(|| Excursion::new(position.entry_price));
    }

    /// Feed a later mid price for `symbol`.
    pub fn on_price(&mut self, symbol: &str, mid: Price) {
        if let Some(excursion) = self.open.get_mut(symbol) {
            excursion.update(mid);
        }
    }

    /// Finalize the record for a closed position and hand it to the sink.
    pub fn on_close(&mut self, closed: &ClosedPosition) -> MetricsRecord {
        let position = &closed.position;
        let mut excursion = self
            .open
            .remove(&position.symbol)
            .unwrap_or_else(|| Excursion::new(position.entry_price));
        excursion.update(closed.exit_price);
        let (mfe, mae) = excursion.extremes(position.side, position.entry_price);
        let record = MetricsRecord {
            symbol: position.symbol.clone(),
            side: position.side,
            notional: position.notional,
            entry_price: position.entry_price,
            exit_price: closed.exit_price,
            entry_time: position.opened_at,
            exit_time: closed.closed_at,
            mfe,
            mae,
            pnl: closed.pnl,
        };
        debug!(symbol = %record.symbol, %mfe, %mae, "metrics record finalized");
        self.sink.record(record.clone());
        record
    }

    /// Whether `symbol` currently has a tracked position.
    pub fn is_tracking(&self, symbol: &str) -> bool {
        self.open.contains_key(symbol)
    }
}
