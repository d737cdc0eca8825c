//! Tranche aggregate crate that re-exports the main components for downstream users.

pub use tranche_broker as broker;
pub use tranche_config as config;
pub use tranche_core as core;
pub use tranche_execution as execution;
pub use tranche_indicators as indicators;
pub use tranche_paper as paper;
pub use tranche_portfolio as portfolio;

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use tranche_broker::{BrokerError, BrokerResult, ExchangeAdapter, ReplaySource, SnapshotSource};
    pub use tranche_config::{load_config, load_config_from, AppConfig, ClusterMap, SplitRatios};
    pub use tranche_core::*;
    pub use tranche_execution::{
        Event, ExecutionError, ExecutionIntent, ExecutionResult, IntentOutcome, RiskDecision,
        RiskGuard, Scheduler, SmartFill, TrancheState,
    };
    pub use tranche_indicators::ThresholdEstimator;
    pub use tranche_paper::PaperExchange;
    pub use tranche_portfolio::{MetricsRecord, MetricsRecorder, MetricsSink, PositionBook};
}
