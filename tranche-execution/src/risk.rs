//! Supervisory risk checks applied before an intent reaches the market.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tranche_config::RiskSettings;
use tranche_core::{Quantity, Symbol};

use crate::intent::ExecutionIntent;

/// Market data for a symbol is missing or too old to trade on.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("stale market data for {symbol} (age {age_ms:?} ms, limit {limit_ms} ms)")]
pub struct StaleDataError {
    pub symbol: Symbol,
    /// Age of the last snapshot, `None` when no snapshot was ever seen.
    pub age_ms: Option<i64>,
    pub limit_ms: u64,
}

/// Reason an intent was refused.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BlockReason {
    #[error("kill switch active until {until}")]
    KillSwitch { until: DateTime<Utc> },
    #[error("daily drawdown {drawdown_pct}% reached limit {limit_pct}%")]
    DailyDrawdown {
        drawdown_pct: Decimal,
        limit_pct: Decimal,
    },
    #[error("loss on {symbol} of {loss} reached limit {limit}")]
    SymbolLoss {
        symbol: Symbol,
        loss: Decimal,
        limit: Decimal,
    },
    #[error("cluster {cluster} exposure {current} + {requested} exceeds {limit}")]
    ClusterExposure {
        cluster: String,
        current: Quantity,
        requested: Quantity,
        limit: Quantity,
    },
    #[error(transparent)]
    StaleData(#[from] StaleDataError),
}

/// Outcome of [`RiskGuard::check`].
#[derive(Clone, Debug, PartialEq)]
pub enum RiskDecision {
    Allow,
    /// Proceed with the notional multiplied by `scale`.
    Throttle { scale: Decimal, reason: String },
    Block(BlockReason),
}

impl RiskDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum TradeOutcome {
    Win,
    Loss,
    Flat,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Win => f.write_str("win"),
            Self::Loss => f.write_str("loss"),
            Self::Flat => f.write_str("flat"),
        }
    }
}

/// Mutable counters owned by the guard.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RiskState {
    pub day: Option<NaiveDate>,
    pub realized_today: Decimal,
    pub peak_today: Decimal,
    pub consecutive_losses: u32,
    pub last_outcome: Option<TradeOutcome>,
    pub kill_switch_until: Option<DateTime<Utc>>,
    pub symbol_losses: HashMap<Symbol, Decimal>,
    pub last_snapshot: HashMap<Symbol, DateTime<Utc>>,
    pub exposure: HashMap<String, Quantity>,
    pub regime: Option<String>,
}

/// Account-level risk supervisor.
#[derive(Clone, Debug)]
pub struct RiskGuard {
    settings: RiskSettings,
    state: RiskState,
}

impl RiskGuard {
    pub fn new(settings: RiskSettings) -> Self {
        Self {
            settings,
            state: RiskState::default(),
        }
    }

    pub fn settings(&self) -> &RiskSettings {
        &self.settings
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    /// Evaluate `intent` at `now` without mutating anything.
    pub fn check(&self, intent: &ExecutionIntent, now: DateTime<Utc>) -> RiskDecision {
        if let Some(until) = self.kill_switch_until(now) {
            return RiskDecision::Block(BlockReason::KillSwitch { until });
        }

        let limit_pct = self.settings.daily_dd_limit_pct;
        let drawdown_pct = self.drawdown_pct(now);
        if limit_pct > Decimal::ZERO && drawdown_pct >= limit_pct {
            return RiskDecision::Block(BlockReason::DailyDrawdown {
                drawdown_pct: drawdown_pct.round_dp(4),
                limit_pct,
            });
        }

        let symbol_limit = self.settings.max_loss_per_symbol;
        let loss = self.symbol_loss(&intent.symbol, now);
        if symbol_limit > Decimal::ZERO && loss >= symbol_limit {
            return RiskDecision::Block(BlockReason::SymbolLoss {
                symbol: intent.symbol.clone(),
                loss,
                limit: symbol_limit,
            });
        }

        let ratio = self.settings.throttle_at_ratio;
        let mut scale = Decimal::ONE;
        let mut reasons = Vec::new();
        if limit_pct > Decimal::ZERO && drawdown_pct >= limit_pct * ratio {
            scale = scale.min(self.settings.throttle_scale);
            reasons.push(format!("drawdown {}%", drawdown_pct.round_dp(2)));
        }
        if symbol_limit > Decimal::ZERO && loss >= symbol_limit * ratio {
            scale = scale.min(self.settings.throttle_scale);
            reasons.push(format!("{} loss {}", intent.symbol, loss));
        }
        if let Some(regime) = self.state.regime.as_deref() {
            if self.settings.throttle_regimes.iter().any(|r| r == regime) {
                scale = scale.min(self.settings.throttle_scale);
                reasons.push(format!("regime {regime}"));
            }
        }

        // Exposure is judged on the size that would actually be submitted.
        let requested = intent.notional * scale;
        let cluster = self.settings.clusters.cluster_of(&intent.symbol);
        let current = self.cluster_exposure(cluster);
        if current + requested > self.settings.cluster_max_exposure {
            return RiskDecision::Block(BlockReason::ClusterExposure {
                cluster: cluster.to_string(),
                current,
                requested,
                limit: self.settings.cluster_max_exposure,
            });
        }

        if let Err(err) = self.ensure_fresh(&intent.symbol, now) {
            return RiskDecision::Block(err.into());
        }

        if scale < Decimal::ONE {
            RiskDecision::Throttle {
                scale,
                reason: reasons.join(", "),
            }
        } else {
            RiskDecision::Allow
        }
    }

    /// Return the expiry when the kill switch is active at `now`.
    pub fn kill_switch_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.state.kill_switch_until.filter(|until| now < *until)
    }

    /// Drawdown from the intraday realized peak, in percent of reference equity.
    pub fn drawdown_pct(&self, now: DateTime<Utc>) -> Decimal {
        if !self.is_current_day(now) || self.settings.reference_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let drawdown = (self.state.peak_today - self.state.realized_today).max(Decimal::ZERO);
        drawdown / self.settings.reference_equity * Decimal::ONE_HUNDRED
    }

    /// Sum of losing closes in `symbol` today, as a positive amount.
    pub fn symbol_loss(&self, symbol: &str, now: DateTime<Utc>) -> Decimal {
        if !self.is_current_day(now) {
            return Decimal::ZERO;
        }
        self.state
            .symbol_losses
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn cluster_exposure(&self, cluster: &str) -> Quantity {
        self.state
            .exposure
            .get(cluster)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Exposure of the cluster `symbol` belongs to.
    pub fn exposure_for(&self, symbol: &str) -> Quantity {
        self.cluster_exposure(self.settings.clusters.cluster_of(symbol))
    }

    pub fn ensure_fresh(&self, symbol: &str, now: DateTime<Utc>) -> Result<(), StaleDataError> {
        let limit_ms = self.settings.stale_data_ms;
        match self.state.last_snapshot.get(symbol) {
            None => Err(StaleDataError {
                symbol: symbol.to_string(),
                age_ms: None,
                limit_ms,
            }),
            Some(last) => {
                let age = now.signed_duration_since(*last).num_milliseconds();
                if age > limit_ms as i64 {
                    Err(StaleDataError {
                        symbol: symbol.to_string(),
                        age_ms: Some(age),
                        limit_ms,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn is_current_day(&self, now: DateTime<Utc>) -> bool {
        self.state.day == Some(now.date_naive())
    }

    /// Apply clock-driven transitions: UTC day rollover and kill-switch expiry.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.state.day != Some(today) {
            if let Some(previous) = self.state.day {
                info!(
                    from = %previous,
                    to = %today,
                    realized = %self.state.realized_today,
                    "risk day rolled over"
                );
            }
            self.state.day = Some(today);
            self.state.realized_today = Decimal::ZERO;
            self.state.peak_today = Decimal::ZERO;
            self.state.symbol_losses.clear();
        }
        if let Some(until) = self.state.kill_switch_until {
            if now >= until {
                info!(%until, "kill switch cleared");
                self.state.kill_switch_until = None;
                self.state.consecutive_losses = 0;
            }
        }
    }

    /// Record a closed trade. Returns true when this close activated the kill switch.
    pub fn on_trade_closed(&mut self, symbol: &str, pnl: Decimal, at: DateTime<Utc>) -> bool {
        self.refresh(at);
        self.state.realized_today += pnl;
        self.state.peak_today = self.state.peak_today.max(self.state.realized_today);

        if pnl < Decimal::ZERO {
            *self
                .state
                .symbol_losses
                .entry(symbol.to_string())
                .or_insert(Decimal::ZERO) += -pnl;
            self.state.consecutive_losses += 1;
            self.state.last_outcome = Some(TradeOutcome::Loss);
        } else {
            self.state.consecutive_losses = 0;
            self.state.last_outcome = Some(if pnl.is_zero() {
                TradeOutcome::Flat
            } else {
                TradeOutcome::Win
            });
        }

        let max = self.settings.max_consec_losses;
        if max > 0
            && self.state.consecutive_losses >= max
            && self.kill_switch_until(at).is_none()
        {
            let until = at + Duration::minutes(self.settings.cooldown_min as i64);
            self.state.kill_switch_until = Some(until);
            warn!(
                symbol,
                streak = self.state.consecutive_losses,
                %until,
                "kill switch activated after consecutive losses"
            );
            return true;
        }
        false
    }

    pub fn reserve_exposure(&mut self, symbol: &str, notional: Quantity) {
        let cluster = self.settings.clusters.cluster_of(symbol).to_string();
        *self.state.exposure.entry(cluster).or_insert(Decimal::ZERO) += notional;
    }

    pub fn release_exposure(&mut self, symbol: &str, notional: Quantity) {
        let cluster = self.settings.clusters.cluster_of(symbol);
        if let Some(current) = self.state.exposure.get_mut(cluster) {
            *current = (*current - notional).max(Decimal::ZERO);
        }
    }

    pub fn on_position_opened(&mut self, symbol: &str, notional: Quantity) {
        self.reserve_exposure(symbol, notional);
    }

    pub fn on_position_closed(&mut self, symbol: &str, notional: Quantity) {
        self.release_exposure(symbol, notional);
    }

    /// Record data freshness for `symbol`.
    pub fn on_snapshot(&mut self, symbol: &str, timestamp: DateTime<Utc>) {
        match self.state.last_snapshot.get_mut(symbol) {
            Some(last) => *last = (*last).max(timestamp),
            None => {
                self.state
                    .last_snapshot
                    .insert(symbol.to_string(), timestamp);
            }
        }
    }

    pub fn set_regime(&mut self, regime: &str) {
        let regime = regime.trim().to_lowercase();
        if self.state.regime.as_deref() != Some(regime.as_str()) {
            info!(%regime, "regime updated");
            self.state.regime = Some(regime);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tranche_config::{AppConfig, ClusterMap};
    use tranche_core::{Side, Signal};

    fn guard() -> RiskGuard {
        let mut settings = AppConfig::default().risk();
        settings.clusters = "BTCUSDT:mega;ETHUSDT:mega".parse().unwrap();
        settings.cluster_max_exposure = Decimal::from(3);
        RiskGuard::new(settings)
    }

    fn intent(symbol: &str, notional: Decimal, now: DateTime<Utc>) -> ExecutionIntent {
        let signal = Signal::new(symbol, Side::Buy, 2.0, notional, now);
        ExecutionIntent::new(&signal, notional, &Default::default(), now)
    }

    fn fresh(guard: &mut RiskGuard, now: DateTime<Utc>) {
        guard.refresh(now);
        guard.on_snapshot("BTCUSDT", now);
        guard.on_snapshot("ETHUSDT", now);
        guard.on_snapshot("SOLUSDT", now);
    }

    #[test]
    fn cluster_exposure_blocks_over_limit() {
        let now = Utc::now();
        let mut guard = guard();
        fresh(&mut guard, now);
        guard.on_position_opened("ETHUSDT", Decimal::new(25, 1));

        let blocked = guard.check(&intent("BTCUSDT", Decimal::ONE, now), now);
        assert!(matches!(
            blocked,
            RiskDecision::Block(BlockReason::ClusterExposure { .. })
        ));
        let allowed = guard.check(&intent("BTCUSDT", Decimal::new(4, 1), now), now);
        assert_eq!(allowed, RiskDecision::Allow);
        // Unmapped symbols live in the default cluster.
        let other = guard.check(&intent("SOLUSDT", Decimal::ONE, now), now);
        assert_eq!(other, RiskDecision::Allow);
        assert_eq!(ClusterMap::default().cluster_of("SOLUSDT"), "default");
    }

    #[test]
    fn kill_switch_lifecycle() {
        let now = Utc::now();
        let mut guard = guard();
        fresh(&mut guard, now);
        assert!(!guard.on_trade_closed("BTCUSDT", Decimal::new(-1, 1), now));
        assert!(!guard.on_trade_closed("BTCUSDT", Decimal::new(-1, 1), now));
        assert!(guard.on_trade_closed("BTCUSDT", Decimal::new(-1, 1), now));

        let probe = intent("BTCUSDT", Decimal::ONE, now);
        assert!(matches!(
            guard.check(&probe, now + Duration::minutes(29)),
            RiskDecision::Block(BlockReason::KillSwitch { .. })
        ));

        let later = now + Duration::minutes(30);
        fresh(&mut guard, later);
        assert_eq!(guard.state().consecutive_losses, 0);
        assert_eq!(guard.check(&probe, later), RiskDecision::Allow);
    }

    #[test]
    fn win_resets_streak() {
        let now = Utc::now();
        let mut guard = guard();
        fresh(&mut guard, now);
        guard.on_trade_closed("BTCUSDT", Decimal::new(-1, 1), now);
        guard.on_trade_closed("BTCUSDT", Decimal::new(-1, 1), now);
        guard.on_trade_closed("BTCUSDT", Decimal::new(2, 1), now);
        assert_eq!(guard.state().consecutive_losses, 0);
        assert_eq!(guard.state().last_outcome, Some(TradeOutcome::Win));
        assert!(!guard.on_trade_closed("BTCUSDT", Decimal::new(-1, 1), now));
    }

    #[test]
    fn drawdown_blocks_and_throttles() {
        let now = Utc::now();
        let mut settings = AppConfig::default().risk();
        settings.max_consec_losses = 0;
        let mut guard = RiskGuard::new(settings);
        fresh(&mut guard, now);
        let probe = intent("BTCUSDT", Decimal::ONE, now);

        // +10 then -35: drawdown 35 of 1000 reference = 3.5% >= 3%.
        guard.on_trade_closed("ETHUSDT", Decimal::from(10), now);
        guard.on_trade_closed("ETHUSDT", Decimal::from(-25), now);
        // 25 / 1000 = 2.5% >= 0.8 * 3% -> throttled.
        match guard.check(&probe, now) {
            RiskDecision::Throttle { scale, .. } => assert_eq!(scale, Decimal::new(5, 1)),
            other => panic!("expected throttle, got {other:?}"),
        }
        guard.on_trade_closed("ETHUSDT", Decimal::from(-10), now);
        assert!(matches!(
            guard.check(&probe, now),
            RiskDecision::Block(BlockReason::DailyDrawdown { .. })
        ));

        // A new UTC day starts from a clean slate.
        let tomorrow = now + Duration::days(1);
        fresh(&mut guard, tomorrow);
        assert_eq!(guard.check(&probe, tomorrow), RiskDecision::Allow);
    }

    #[test]
    fn symbol_loss_limit_blocks_only_that_symbol() {
        let now = Utc::now();
        let mut settings = AppConfig::default().risk();
        settings.max_consec_losses = 0;
        settings.reference_equity = Decimal::from(1_000_000);
        let mut guard = RiskGuard::new(settings);
        fresh(&mut guard, now);
        guard.on_trade_closed("BTCUSDT", Decimal::from(-50), now);
        assert!(matches!(
            guard.check(&intent("BTCUSDT", Decimal::ONE, now), now),
            RiskDecision::Block(BlockReason::SymbolLoss { .. })
        ));
        assert_eq!(
            guard.check(&intent("ETHUSDT", Decimal::ONE, now), now),
            RiskDecision::Allow
        );
    }

    #[test]
    fn stale_or_missing_data_blocks() {
        let now = Utc::now();
        let mut guard = guard();
        guard.refresh(now);
        let probe = intent("BTCUSDT", Decimal::ONE, now);
        assert!(matches!(
            guard.check(&probe, now),
            RiskDecision::Block(BlockReason::StaleData(StaleDataError { age_ms: None, .. }))
        ));
        guard.on_snapshot("BTCUSDT", now);
        let late = now + Duration::milliseconds(120_001);
        assert!(matches!(
            guard.check(&probe, late),
            RiskDecision::Block(BlockReason::StaleData(_))
        ));
    }

    #[test]
    fn regime_throttle_and_idempotent_check() {
        let now = Utc::now();
        let mut guard = guard();
        fresh(&mut guard, now);
        guard.set_regime("RISK_OFF");
        let probe = intent("BTCUSDT", Decimal::ONE, now);
        let first = guard.check(&probe, now);
        let second = guard.check(&probe, now);
        assert_eq!(first, second);
        assert!(matches!(first, RiskDecision::Throttle { .. }));
    }

    #[test]
    fn throttled_size_is_what_counts_against_the_cluster() {
        let now = Utc::now();
        let mut guard = guard();
        fresh(&mut guard, now);
        guard.on_position_opened("ETHUSDT", Decimal::new(25, 1));
        let probe = intent("BTCUSDT", Decimal::ONE, now);
        assert!(matches!(
            guard.check(&probe, now),
            RiskDecision::Block(BlockReason::ClusterExposure { .. })
        ));

        guard.set_regime("risk_off");
        match guard.check(&probe, now) {
            RiskDecision::Throttle { scale, .. } => assert_eq!(scale, Decimal::new(5, 1)),
            other => panic!("expected throttle, got {other:?}"),
        }

        let larger = intent("BTCUSDT", Decimal::new(12, 1), now);
        match guard.check(&larger, now) {
            RiskDecision::Block(BlockReason::ClusterExposure { requested, .. }) => {
                assert_eq!(requested, Decimal::new(6, 1))
            }
            other => panic!("expected cluster block, got {other:?}"),
        }
    }
}
