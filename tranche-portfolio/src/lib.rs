//! Position accounting primitives.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tranche_core::{IntentId, Price, Quantity, Side, Symbol};

pub mod excursion;

pub use excursion::{MemorySink, MetricsRecord, MetricsRecorder, MetricsSink, TracingSink};

/// Result alias for portfolio operations.
pub type PortfolioResult<T> = Result<T, PortfolioError>;

/// Portfolio-specific error type.
#[derive(Debug, Error)]
pub enum PortfolioError {
    /// Raised when a close references a symbol without an open position.
    #[error("no open position for {0}")]
    UnknownSymbol(Symbol),
    /// Raised when a fill would add to a position held on the other side.
    #[error("position in {symbol} is {held}, cannot add {requested}")]
    SideMismatch {
        symbol: Symbol,
        held: Side,
        requested: Side,
    },
    /// Prices and notionals must be strictly positive.
    #[error("invalid {field} for {symbol}: {value}")]
    InvalidAmount {
        symbol: Symbol,
        field: &'static str,
        value: Decimal,
    },
}

/// Open exposure in one symbol.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Side,
    /// Entry notional in quote currency.
    pub notional: Quantity,
    /// Volume-weighted entry price.
    pub entry_price: Price,
    pub opened_at: DateTime<Utc>,
    pub intent_id: Option<IntentId>,
}

impl Position {
    /// Base-asset quantity implied by the entry notional.
    #[must_use]
    pub fn quantity(&self) -> Decimal {
        if self.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            self.notional / self.entry_price
        }
    }

    /// Realized P&L in quote currency if the position were closed at `exit_price`.
    #[must_use]
    pub fn pnl_at(&self, exit_price: Price) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (exit_price - self.entry_price) / self.entry_price * self.notional * self.side.sign()
    }
}

/// Position that has been closed out.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: Price,
    pub closed_at: DateTime<Utc>,
    pub pnl: Decimal,
}

/// Stores open positions keyed by symbol.
#[derive(Clone, Debug, Default)]
pub struct PositionBook {
    positions: HashMap<Symbol, Position>,
    realized_pnl: Decimal,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a position or add to an existing one on the same side.
    pub fn open(&mut self, position: Position) -> PortfolioResult<&Position> {
        for (field, value) in [
            ("notional", position.notional),
            ("entry price", position.entry_price),
        ] {
            if value <= Decimal::ZERO {
                return Err(PortfolioError::InvalidAmount {
                    symbol: position.symbol.clone(),
                    field,
                    value,
                });
            }
        }
        let symbol = position.symbol.clone();
        match self.positions.get_mut(&symbol) {
            Some(existing) if existing.side != position.side => {
                return Err(PortfolioError::SideMismatch {
                    symbol,
                    held: existing.side,
                    requested: position.side,
                });
            }
            Some(existing) => {
                let base = existing.quantity() + position.quantity();
                existing.notional += position.notional;
                existing.entry_price = existing.notional / base;
                info!(
                    symbol = %existing.symbol,
                    notional = %existing.notional,
                    entry = %existing.entry_price,
                    "position increased"
                );
            }
            None => {
                info!(
                    symbol = %position.symbol,
                    side = %position.side,
                    notional = %position.notional,
                    entry = %position.entry_price,
                    "position opened"
                );
                self.positions.insert(symbol.clone(), position);
            }
        }
        self.positions
            .get(&symbol)
            .ok_or(PortfolioError::UnknownSymbol(symbol))
    }

    /// Close the whole position in `symbol` at `exit_price`.
    pub fn close(
        &mut self,
        symbol: &str,
        exit_price: Price,
        closed_at: DateTime<Utc>,
    ) -> PortfolioResult<ClosedPosition> {
        if exit_price <= Decimal::ZERO {
            return Err(PortfolioError::InvalidAmount {
                symbol: symbol.to_string(),
                field: "exit price",
                value: exit_price,
            });
        }
        let position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| PortfolioError::UnknownSymbol(symbol.to_string()))?;
        let pnl = position.pnl_at(exit_price);
        self.realized_pnl += pnl;
        info!(
            symbol,
            side = %position.side,
            entry = %position.entry_price,
            exit = %exit_price,
            pnl = %pnl,
            "position closed"
        );
        Ok(ClosedPosition {
            position,
            exit_price,
            closed_at,
            pnl,
        })
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Cumulative realized P&L across all closed positions.
    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side, notional: i64, price: i64) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side,
            notional: Decimal::from(notional),
            entry_price: Decimal::from(price),
            opened_at: Utc::now(),
            intent_id: Some(uuid::Uuid::new_v4()),
        }
    }

    #[test]
    fn long_close_realizes_relative_move() {
        let mut book = PositionBook::new();
        book.open(position(Side::Buy, 20, 100)).unwrap();
        let closed = book.close("BTCUSDT", Decimal::from(110), Utc::now()).unwrap();
        assert_eq!(closed.pnl, Decimal::from(2));
        assert!(book.is_empty());
        assert_eq!(book.realized_pnl(), Decimal::from(2));
    }

    #[test]
    fn short_close_inverts_sign() {
        let mut book = PositionBook::new();
        book.open(position(Side::Sell, 20, 100)).unwrap();
        let closed = book.close("BTCUSDT", Decimal::from(110), Utc::now()).unwrap();
        assert_eq!(closed.pnl, Decimal::from(-2));
    }

    #[test]
    fn adding_same_side_updates_vwap() {
        let mut book = PositionBook::new();
        book.open(position(Side::Buy, 100, 100)).unwrap();
        let merged = book.open(position(Side::Buy, 200, 200)).unwrap();
        assert_eq!(merged.notional, Decimal::from(300));
        // 1 + 1 base units for 300 quote.
        assert_eq!(merged.entry_price, Decimal::from(150));
    }

    #[test]
    fn opposite_side_and_unknown_symbol_are_errors() {
        let mut book = PositionBook::new();
        book.open(position(Side::Buy, 20, 100)).unwrap();
        assert!(matches!(
            book.open(position(Side::Sell, 20, 100)).unwrap_err(),
            PortfolioError::SideMismatch { .. }
        ));
        assert!(matches!(
            book.close("ETHUSDT", Decimal::ONE, Utc::now()).unwrap_err(),
            PortfolioError::UnknownSymbol(_)
        ));
        assert!(book.open(position(Side::Buy, 0, 100)).is_err());
    }
}
