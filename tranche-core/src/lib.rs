//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision. Order sizes are expressed as quote notional (USDT).
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;

/// Unique identifier assigned to orders (exchange or client provided).
pub type OrderId = String;

/// Identifier of an admitted execution intent.
pub type IntentId = Uuid;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Convert to `i8` representation used by certain exchanges.
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    /// Signed multiplier applied to price deltas (`+1` long, `-1` short).
    #[must_use]
    pub fn sign(self) -> Decimal {
        Decimal::from(self.as_i8())
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("buy"),
            Self::Sell => f.write_str("sell"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "buy" | "long" | "b" => Ok(Self::Buy),
            "sell" | "short" | "s" => Ok(Self::Sell),
            other => Err(format!("unsupported side '{other}'")),
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderType {
    /// Execute immediately at best available price.
    Market,
    /// Execute at the provided limit price.
    Limit,
}

/// Optional time-in-force constraints.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TimeInForce {
    GoodTilCanceled,
    /// Resting order that must only add liquidity.
    PostOnly,
    ImmediateOrCancel,
}

/// Top-of-book view published for a symbol.
///
/// Snapshots are immutable; a newer snapshot for the same symbol supersedes
/// the previous one.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub best_bid: Price,
    pub best_ask: Price,
    pub mid: Price,
    /// Resting size at the best level on each side of the book.
    pub queue_depth: Quantity,
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Build a snapshot deriving the mid price from the touch.
    #[must_use]
    pub fn new(
        symbol: impl Into<Symbol>,
        best_bid: Price,
        best_ask: Price,
        queue_depth: Quantity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            best_bid,
            best_ask,
            mid: (best_bid + best_ask) / Decimal::TWO,
            queue_depth,
            timestamp,
        }
    }

    #[must_use]
    pub fn spread(&self) -> Price {
        self.best_ask - self.best_bid
    }

    /// Best price on the same side as `side` (bid for buys, ask for sells).
    #[must_use]
    pub fn same_side_best(&self, side: Side) -> Price {
        match side {
            Side::Buy => self.best_bid,
            Side::Sell => self.best_ask,
        }
    }

    /// Best price on the opposite side (the one an aggressive order would hit).
    #[must_use]
    pub fn opposite_best(&self, side: Side) -> Price {
        self.same_side_best(side.inverse())
    }
}

/// Candidate trade produced by an external signal generator.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Signal {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    /// Institutional score compared against the adaptive cutoff.
    pub score: f64,
    /// Requested notional in quote currency.
    pub notional: Quantity,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Convenience constructor to build a signal with a random identifier.
    #[must_use]
    pub fn new(
        symbol: impl Into<Symbol>,
        side: Side,
        score: f64,
        notional: Quantity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            score,
            notional,
            timestamp,
        }
    }
}

/// Desired order placement parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    /// Order size as quote notional.
    pub size: Quantity,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Whether the request must only add liquidity.
    #[must_use]
    pub fn is_post_only(&self) -> bool {
        matches!(self.time_in_force, Some(TimeInForce::PostOnly))
    }
}

/// Status reported by the venue for a single order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Whether the order can no longer trade.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }
}

/// Reason attached to a rejected order.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Post-only order would have matched on arrival.
    PostOnlyWouldCross,
    Other(String),
}

/// Asynchronous acknowledgment emitted by the venue.
///
/// `filled_size` is cumulative for the order, so replaying the same ack is harmless.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_size: Quantity,
    #[serde(default)]
    pub avg_fill_price: Option<Price>,
    #[serde(default)]
    pub reject_reason: Option<RejectReason>,
    pub timestamp: DateTime<Utc>,
}

impl OrderAck {
    #[must_use]
    pub fn accepted(order_id: impl Into<OrderId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Accepted,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            reject_reason: None,
            timestamp,
        }
    }

    #[must_use]
    pub fn filled(
        order_id: impl Into<OrderId>,
        filled_size: Quantity,
        avg_fill_price: Price,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Filled,
            filled_size,
            avg_fill_price: Some(avg_fill_price),
            reject_reason: None,
            timestamp,
        }
    }

    #[must_use]
    pub fn partially_filled(
        order_id: impl Into<OrderId>,
        filled_size: Quantity,
        avg_fill_price: Price,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            status: OrderStatus::PartiallyFilled,
            ..Self::filled(order_id, filled_size, avg_fill_price, timestamp)
        }
    }

    #[must_use]
    pub fn canceled(
        order_id: impl Into<OrderId>,
        filled_size: Quantity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Canceled,
            filled_size,
            avg_fill_price: None,
            reject_reason: None,
            timestamp,
        }
    }

    #[must_use]
    pub fn rejected(
        order_id: impl Into<OrderId>,
        reason: RejectReason,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Rejected,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            reject_reason: Some(reason),
            timestamp,
        }
    }
}

/// Round `price` onto the tick grid, moving toward the passive side for `side`.
///
/// Buys round down, sells round up. A non-positive tick returns the price unchanged.
#[must_use]
pub fn round_passive(price: Price, tick: Price, side: Side) -> Price {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = price / tick;
    let steps = match side {
        Side::Buy => steps.floor(),
        Side::Sell => steps.ceil(),
    };
    steps * tick
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_derives_mid_from_touch() {
        let snap = MarketSnapshot::new(
            "BTCUSDT",
            Decimal::new(9_999, 2),
            Decimal::new(10_001, 2),
            Decimal::from(5),
            Utc::now(),
        );
        assert_eq!(snap.mid, Decimal::from(100));
        assert_eq!(snap.spread(), Decimal::new(2, 2));
        assert_eq!(snap.opposite_best(Side::Buy), Decimal::new(10_001, 2));
    }

    #[test]
    fn passive_rounding_respects_side() {
        let tick = Decimal::new(1, 2);
        let price = Decimal::new(100_005, 3);
        assert_eq!(round_passive(price, tick, Side::Buy), Decimal::new(10_000, 2));
        assert_eq!(round_passive(price, tick, Side::Sell), Decimal::new(10_001, 2));
        assert_eq!(
            round_passive(Decimal::from(100), tick, Side::Buy),
            Decimal::from(100)
        );
    }

    #[test]
    fn side_parses_trading_aliases() {
        assert_eq!("long".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("flat".parse::<Side>().is_err());
    }

    #[test]
    fn ack_deserializes_with_defaults() {
        let raw = r#"{"order_id":"abc","status":"Canceled","timestamp":"2024-01-01T00:00:00Z"}"#;
        let ack: OrderAck = serde_json::from_str(raw).unwrap();
        assert_eq!(ack.status, OrderStatus::Canceled);
        assert!(ack.filled_size.is_zero());
        assert!(ack.status.is_final());
    }
}
