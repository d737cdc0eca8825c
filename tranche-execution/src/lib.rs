//! Smart fill execution, supervisory risk and the event loop that drives them.

pub mod intent;
pub mod orchestrator;
pub mod risk;
pub mod scheduler;
pub mod sfi;

use thiserror::Error;
use tranche_broker::BrokerError;
use tranche_config::ConfigError;
use tranche_core::{IntentId, OrderId, Price, Symbol};
use tranche_portfolio::PortfolioError;

pub use intent::{
    ChildOrder, ChildRole, ChildStatus, ExecutionIntent, IntentOutcome, Tranche, TrancheState,
};
pub use orchestrator::{OrchestratorStats, OrderOrchestrator};
pub use risk::{BlockReason, RiskDecision, RiskGuard, RiskState, StaleDataError, TradeOutcome};
pub use scheduler::{EngineStats, Event, Scheduler};
pub use sfi::{PlacePurpose, SfiAction, SmartFill, TimerKind, TimerRequest};

/// Convenience alias for execution results.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Failures surfaced by the execution layer.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No market snapshot is available to price an order.
    #[error("no market snapshot for {0}")]
    MissingSnapshot(Symbol),
    #[error(transparent)]
    StaleData(#[from] StaleDataError),
    #[error("order {order_id} rejected: {reason}")]
    ExchangeRejection { order_id: OrderId, reason: String },
    /// An acknowledgment referenced an order no live intent owns.
    #[error("order {0} is not tracked")]
    OrderNotFound(OrderId),
    #[error("intent {0} is not active")]
    IntentNotFound(IntentId),
    #[error("computed price {price} for {symbol} is not positive")]
    InvalidPrice { symbol: Symbol, price: Price },
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
