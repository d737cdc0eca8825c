//! Adaptive score cutoff driven by a rolling quantile per symbol.

use std::cell::RefCell;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use tranche_config::{ConfigError, ThresholdSettings};
use tranche_core::Symbol;

use crate::core::{quantile_inclusive, RollingWindow};

#[derive(Clone, Debug)]
struct SymbolWindow {
    scores: RollingWindow,
    last_update: DateTime<Utc>,
}

/// Tracks recent institutional scores and derives the admission cutoff.
///
/// The cutoff for a symbol is `max(floor, quantile(window, q))`, falling back
/// to the floor until `min_samples` scores have been observed.
#[derive(Clone, Debug)]
pub struct ThresholdEstimator {
    quantile: f64,
    window: usize,
    floor: f64,
    min_samples: usize,
    template: RollingWindow,
    windows: HashMap<Symbol, SymbolWindow>,
    scratch: RefCell<Vec<f64>>,
}

impl ThresholdEstimator {
    pub fn new(settings: ThresholdSettings) -> Result<Self, ConfigError> {
        let template =
            RollingWindow::new(settings.window).map_err(|_| ConfigError::InvalidWindow)?;
        if !(settings.quantile > 0.0 && settings.quantile <= 1.0) {
            return Err(ConfigError::InvalidQuantile(settings.quantile));
        }
        Ok(Self {
            quantile: settings.quantile,
            window: settings.window,
            floor: settings.floor,
            min_samples: settings.min_samples.clamp(1, settings.window),
            template,
            windows: HashMap::new(),
            scratch: RefCell::new(Vec::with_capacity(settings.window)),
        })
    }

    /// Record a score for `symbol`. Non-finite scores are ignored.
    pub fn observe(&mut self, symbol: &str, score: f64, timestamp: DateTime<Utc>) {
        if !score.is_finite() {
            debug!(symbol, score, "ignoring non-finite score");
            return;
        }
        if !self.windows.contains_key(symbol) {
            self.windows.insert(
                symbol.to_string(),
                SymbolWindow {
                    scores: self.template.clone(),
                    last_update: timestamp,
                },
            );
        }
        let Some(entry) = self.windows.get_mut(symbol) else {
            return;
        };
        entry.scores.push(score);
        entry.last_update = entry.last_update.max(timestamp);
    }

    /// Current admission cutoff for `symbol`.
    #[must_use]
    pub fn cutoff(&self, symbol: &str) -> f64 {
        let Some(entry) = self.windows.get(symbol) else {
            return self.floor;
        };
        if entry.scores.len() < self.min_samples {
            return self.floor;
        }
        let mut sorted = self.scratch.borrow_mut();
        entry.scores.sorted_into(&mut sorted);
        quantile_inclusive(&sorted, self.quantile)
            .map(|value| value.max(self.floor))
            .unwrap_or(self.floor)
    }

    /// Whether `score` clears the current cutoff for `symbol`.
    #[must_use]
    pub fn admits(&self, symbol: &str, score: f64) -> bool {
        score.is_finite() && score >= self.cutoff(symbol)
    }

    pub fn set_floor(&mut self, floor: f64) {
        info!(old = self.floor, new = floor, "score floor updated");
        self.floor = floor;
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn quantile(&self) -> f64 {
        self.quantile
    }

    /// Maximum number of scores retained per symbol.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of scores currently held for `symbol`.
    pub fn window_len(&self, symbol: &str) -> usize {
        self.windows
            .get(symbol)
            .map(|entry| entry.scores.len())
            .unwrap_or(0)
    }

    /// Scores held for `symbol`, oldest first.
    pub fn window_scores(&self, symbol: &str) -> Vec<f64> {
        self.windows
            .get(symbol)
            .map(|entry| entry.scores.iter().collect())
            .unwrap_or_default()
    }

    pub fn last_update(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.windows.get(symbol).map(|entry| entry.last_update)
    }
}
