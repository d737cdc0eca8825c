//! Exchange-agnostic traits used by the rest of the engine.

use thiserror::Error;
use tranche_core::{MarketSnapshot, OrderAck, OrderId, OrderRequest};

pub mod source;

pub use source::{ReplaySource, SnapshotSource};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by adapter implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Represents transport-level failures (network, timeouts, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// Returned when the request parameters are invalid for the target exchange.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Exchange responded with a business error (e.g., insufficient margin).
    #[error("exchange error: {0}")]
    Exchange(String),
    /// The exchange does not know the referenced order.
    #[error("order {0} not found")]
    UnknownOrder(OrderId),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

/// Order submission boundary.
///
/// Calls must not block on the venue: `place_order` returns as soon as the
/// request is handed off and the outcome arrives later as an [`OrderAck`].
/// Delivery of acks is at-least-once and keyed by the returned order id.
pub trait ExchangeAdapter {
    /// Human-friendly adapter name used for logging purposes.
    fn name(&self) -> &str;

    /// Submit a new order and return the identifier acks will carry.
    fn place_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderId>;

    /// Request cancellation of a resting order. Confirmation arrives as an ack.
    fn cancel_order(&mut self, order_id: &OrderId) -> BrokerResult<()>;

    /// Feed the latest top-of-book to adapters that simulate matching locally.
    fn observe_market(&mut self, _snapshot: &MarketSnapshot) {}

    /// Drain acknowledgments produced since the last call.
    ///
    /// Push-based adapters deliver acks through their own channel and keep the default.
    fn poll_acks(&mut self) -> Vec<OrderAck> {
        Vec::new()
    }
}

impl<T> ExchangeAdapter for Box<T>
where
    T: ExchangeAdapter + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn place_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderId> {
        (**self).place_order(request)
    }

    fn cancel_order(&mut self, order_id: &OrderId) -> BrokerResult<()> {
        (**self).cancel_order(order_id)
    }

    fn observe_market(&mut self, snapshot: &MarketSnapshot) {
        (**self).observe_market(snapshot)
    }

    fn poll_acks(&mut self) -> Vec<OrderAck> {
        (**self).poll_acks()
    }
}
