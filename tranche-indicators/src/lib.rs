//! Streaming statistics shared by the execution engine.

pub mod core;
pub mod threshold;

pub use crate::core::{quantile_inclusive, IndicatorError, RollingWindow};
pub use threshold::ThresholdEstimator;
