//! Execution intents and the tranches they are split into.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tranche_config::SplitRatios;
use tranche_core::{IntentId, OrderId, Price, Quantity, Side, Signal, Symbol};
use uuid::Uuid;

/// Lifecycle of a single tranche.
///
/// `Pending -> Quoted -> (Requoted)* -> Filled | Cancelled | FallbackFilled`.
/// `Fallback` is held while the IOC order is in flight.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TrancheState {
    Pending,
    Quoted,
    Requoted,
    Fallback,
    Filled,
    Cancelled,
    FallbackFilled,
}

impl TrancheState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::FallbackFilled)
    }

    /// Whether the tranche has a passive quote resting on the book.
    #[must_use]
    pub fn is_quoting(self) -> bool {
        matches!(self, Self::Quoted | Self::Requoted)
    }
}

/// Why a child order was submitted.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ChildRole {
    /// Passive quote (initial, re-quote or re-peg).
    Quote,
    /// Aggressive IOC sent at the fallback timeout.
    Fallback,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ChildStatus {
    Live,
    CancelRequested,
    Done,
}

/// One order sent on behalf of a tranche.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChildOrder {
    pub order_id: Option<OrderId>,
    pub client_order_id: String,
    pub role: ChildRole,
    pub price: Price,
    pub size: Quantity,
    /// Cumulative filled notional reported by the venue.
    pub filled: Quantity,
    pub avg_fill_price: Option<Price>,
    pub status: ChildStatus,
}

impl ChildOrder {
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self.status, ChildStatus::Done)
    }
}

/// Sub-order with a fixed target notional.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Tranche {
    pub index: usize,
    pub ratio: Decimal,
    pub target: Quantity,
    pub peg: Option<Price>,
    /// Identifier of the order currently working for this tranche.
    pub order_id: Option<OrderId>,
    pub state: TrancheState,
    pub created_at: DateTime<Utc>,
    pub quoted_at: Option<DateTime<Utc>>,
    pub last_requote_at: Option<DateTime<Utc>>,
    /// Deadline of the armed deferred re-quote check, if any.
    pub requote_check_at: Option<DateTime<Utc>>,
    pub requotes: u32,
    pub repeg_attempts: u32,
    pub cancel_requested: bool,
    pub children: Vec<ChildOrder>,
    pub current_child: Option<usize>,
}

impl Tranche {
    fn new(index: usize, ratio: Decimal, target: Quantity, created_at: DateTime<Utc>) -> Self {
        Self {
            index,
            ratio,
            target,
            peg: None,
            order_id: None,
            state: TrancheState::Pending,
            created_at,
            quoted_at: None,
            last_requote_at: None,
            requote_check_at: None,
            requotes: 0,
            repeg_attempts: 0,
            cancel_requested: false,
            children: Vec::new(),
            current_child: None,
        }
    }

    /// Filled notional across every child order (fills from replaced orders count).
    #[must_use]
    pub fn filled(&self) -> Quantity {
        self.children.iter().map(|child| child.filled).sum()
    }

    #[must_use]
    pub fn remaining(&self) -> Quantity {
        (self.target - self.filled()).max(Decimal::ZERO)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.filled() >= self.target
    }

    /// Volume-weighted average fill price across child orders.
    #[must_use]
    pub fn avg_fill_price(&self) -> Option<Price> {
        vwap(self.children.iter().filter_map(|child| {
            child
                .avg_fill_price
                .filter(|_| child.filled > Decimal::ZERO)
                .map(|price| (child.filled, price))
        }))
    }

    pub fn child_index(&self, order_id: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|child| child.order_id.as_deref() == Some(order_id))
    }

    pub fn current(&self) -> Option<&ChildOrder> {
        self.current_child.and_then(|idx| self.children.get(idx))
    }

    /// Children still working at the venue.
    pub fn open_children(&self) -> impl Iterator<Item = (usize, &ChildOrder)> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, child)| child.is_open())
    }
}

/// Aggregate outcome reported when every tranche is terminal.
#[derive(Clone, Debug, PartialEq)]
pub struct IntentOutcome {
    pub intent_id: IntentId,
    pub signal_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub requested: Quantity,
    pub filled: Quantity,
    pub avg_fill_price: Option<Price>,
    pub states: Vec<TrancheState>,
    pub completed_at: DateTime<Utc>,
}

/// Admitted instruction to trade a notional in one symbol and side.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionIntent {
    pub id: IntentId,
    pub signal_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub notional: Quantity,
    pub created_at: DateTime<Utc>,
    pub tranches: Vec<Tranche>,
    pub cancel_reason: Option<String>,
}

impl ExecutionIntent {
    /// Split `notional` according to `split`; the last tranche absorbs rounding.
    pub fn new(
        signal: &Signal,
        notional: Quantity,
        split: &SplitRatios,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            Uuid::new_v4(),
            signal.id,
            signal.symbol.clone(),
            signal.side,
            notional,
            split.ratios(),
            created_at,
        )
    }

    fn build(
        id: IntentId,
        signal_id: Uuid,
        symbol: Symbol,
        side: Side,
        notional: Quantity,
        ratios: &[Decimal],
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut allocated = Decimal::ZERO;
        let last = ratios.len().saturating_sub(1);
        let tranches = ratios
            .iter()
            .enumerate()
            .map(|(index, ratio)| {
                let target = if index == last {
                    (notional - allocated).max(Decimal::ZERO)
                } else {
                    notional * *ratio
                };
                allocated += target;
                Tranche::new(index, *ratio, target, created_at)
            })
            .collect();
        Self {
            id,
            signal_id,
            symbol,
            side,
            notional,
            created_at,
            tranches,
            cancel_reason: None,
        }
    }

    /// A fresh intent for the same signal with its notional multiplied by `factor`.
    #[must_use]
    pub fn scaled(&self, factor: Decimal) -> Self {
        let ratios: Vec<Decimal> = self.tranches.iter().map(|t| t.ratio).collect();
        Self::build(
            Uuid::new_v4(),
            self.signal_id,
            self.symbol.clone(),
            self.side,
            self.notional * factor,
            &ratios,
            self.created_at,
        )
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tranches.iter().all(|t| t.state.is_terminal())
    }

    /// Whether any child order is still awaiting a final ack from the venue.
    #[must_use]
    pub fn has_open_orders(&self) -> bool {
        self.tranches
            .iter()
            .any(|tranche| tranche.open_children().next().is_some())
    }

    #[must_use]
    pub fn filled_notional(&self) -> Quantity {
        self.tranches.iter().map(Tranche::filled).sum()
    }

    #[must_use]
    pub fn avg_fill_price(&self) -> Option<Price> {
        vwap(self.tranches.iter().flat_map(|tranche| {
            tranche.children.iter().filter_map(|child| {
                child
                    .avg_fill_price
                    .filter(|_| child.filled > Decimal::ZERO)
                    .map(|price| (child.filled, price))
            })
        }))
    }

    /// Locate the tranche and child that own `order_id`.
    pub fn locate(&self, order_id: &str) -> Option<(usize, usize)> {
        self.tranches.iter().enumerate().find_map(|(t, tranche)| {
            tranche.child_index(order_id).map(|c| (t, c))
        })
    }

    pub fn outcome(&self, completed_at: DateTime<Utc>) -> IntentOutcome {
        IntentOutcome {
            intent_id: self.id,
            signal_id: self.signal_id,
            symbol: self.symbol.clone(),
            side: self.side,
            requested: self.notional,
            filled: self.filled_notional(),
            avg_fill_price: self.avg_fill_price(),
            states: self.tranches.iter().map(|t| t.state).collect(),
            completed_at,
        }
    }
}

/// Notional-weighted price: total notional over total base quantity.
///
/// The quotient is rounded to the finest price scale among the fills, and a
/// single common fill price is returned unchanged.
fn vwap(fills: impl Iterator<Item = (Quantity, Price)>) -> Option<Price> {
    let mut notional = Decimal::ZERO;
    let mut base = Decimal::ZERO;
    let mut scale = 0;
    let mut common: Option<Price> = None;
    let mut uniform = true;
    for (size, price) in fills.filter(|(_, price)| *price > Decimal::ZERO) {
        notional += size;
        base += size / price;
        scale = scale.max(price.scale());
        match common {
            None => common = Some(price),
            Some(seen) if seen != price => uniform = false,
            Some(_) => {}
        }
    }
    if base.is_zero() {
        return None;
    }
    if uniform {
        return common;
    }
    Some((notional / base).round_dp(scale))
}
