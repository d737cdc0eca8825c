//! Layered configuration loading utilities.
//!
//! Options keep the flat names used by operators (`ORDER_VALUE_USDT`,
//! `PEGMID_SPLIT`, ...). Files use the lowercase spelling of the same keys.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, ConfigError as SourceError, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use thiserror::Error;

mod deserializer;

/// Tolerance applied when checking that split ratios sum to one.
pub const SPLIT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Option names that may be overridden directly from the process environment.
pub const ENV_KEYS: &[&str] = &[
    "ORDER_VALUE_USDT",
    "REQ_SCORE_FLOOR",
    "INST_Q",
    "INST_WINDOW",
    "INST_MIN_SAMPLES",
    "POST_ONLY_DEFAULT",
    "PEGMID_SPLIT",
    "TICK_DEFAULT",
    "QUEUE_THRESHOLD",
    "REQUOTE_COOLDOWN_MS",
    "FALLBACK_TIMEOUT_MS",
    "USE_IOC_FALLBACK",
    "FALLBACK_SLIPPAGE_TICKS",
    "MAX_REPEG_RETRIES",
    "TRANCHE_LADDER_TICKS",
    "DAILY_DD_LIMIT_PCT",
    "REFERENCE_EQUITY_USDT",
    "MAX_CONSEC_LOSSES",
    "COOLDOWN_MIN",
    "MAX_LOSS_PER_SYMBOL_USDT",
    "CLUSTER_MAP",
    "CLUSTER_MAX_EXPOSURE",
    "STALE_DATA_MS",
    "THROTTLE_AT_RATIO",
    "THROTTLE_SCALE",
    "THROTTLE_REGIMES",
    "LOG_LEVEL",
];

/// Errors raised while loading or validating configuration. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("split ratios must not be empty")]
    EmptySplit,
    #[error("split ratio {0} must be positive")]
    NonPositiveRatio(Decimal),
    #[error("split ratios sum to {0}, expected 1")]
    SplitSum(Decimal),
    #[error("invalid split ratio '{0}'")]
    MalformedRatio(String),
    #[error("window size must be positive")]
    InvalidWindow,
    #[error("quantile {0} must lie within (0, 1]")]
    InvalidQuantile(f64),
    #[error("invalid cluster map entry '{0}' (expected SYMBOL:cluster)")]
    InvalidClusterEntry(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to load configuration: {0}")]
    Source(#[from] SourceError),
}

/// Fixed tranche split applied to every execution intent.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitRatios(Vec<Decimal>);

impl SplitRatios {
    /// Validate and build a split. Every ratio must be positive and the sum must be one.
    pub fn new(ratios: Vec<Decimal>) -> Result<Self, ConfigError> {
        if ratios.is_empty() {
            return Err(ConfigError::EmptySplit);
        }
        if let Some(bad) = ratios.iter().find(|ratio| **ratio <= Decimal::ZERO) {
            return Err(ConfigError::NonPositiveRatio(*bad));
        }
        let sum: Decimal = ratios.iter().copied().sum();
        if (sum - Decimal::ONE).abs() > SPLIT_TOLERANCE {
            return Err(ConfigError::SplitSum(sum));
        }
        Ok(Self(ratios))
    }

    pub fn ratios(&self) -> &[Decimal] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self(vec![Decimal::new(6, 1), Decimal::new(4, 1)])
    }
}

impl FromStr for SplitRatios {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let ratios = value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                Decimal::from_str(part).map_err(|_| ConfigError::MalformedRatio(part.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(ratios)
    }
}

impl<'de> Deserialize<'de> for SplitRatios {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            List(Vec<Decimal>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
            Raw::List(list) => Self::new(list).map_err(de::Error::custom),
        }
    }
}

/// Static symbol to risk-cluster mapping. Symbols are stored uppercase, clusters lowercase.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterMap(HashMap<String, String>);

impl ClusterMap {
    /// Cluster label used for symbols absent from the map.
    pub const DEFAULT_CLUSTER: &'static str = "default";

    pub fn new<I, S, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, C)>,
        S: AsRef<str>,
        C: AsRef<str>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(symbol, cluster)| {
                    (
                        symbol.as_ref().trim().to_uppercase(),
                        cluster.as_ref().trim().to_lowercase(),
                    )
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn cluster_of(&self, symbol: &str) -> &str {
        self.0
            .get(&symbol.to_uppercase())
            .map(String::as_str)
            .unwrap_or(Self::DEFAULT_CLUSTER)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for ClusterMap {
    type Err = ConfigError;

    /// Parses `BTCUSDT:mega;ETHUSDT:mega` (`,` is accepted as a separator too).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut pairs = Vec::new();
        for part in value.split([';', ',']).map(str::trim) {
            if part.is_empty() {
                continue;
            }
            let (symbol, cluster) = part
                .split_once(':')
                .filter(|(s, c)| !s.trim().is_empty() && !c.trim().is_empty())
                .ok_or_else(|| ConfigError::InvalidClusterEntry(part.to_string()))?;
            pairs.push((symbol, cluster));
        }
        Ok(Self::new(pairs))
    }
}

impl<'de> Deserialize<'de> for ClusterMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Table(HashMap<String, String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
            Raw::Table(table) => Ok(Self::new(table)),
        }
    }
}

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_order_value")]
    pub order_value_usdt: Decimal,
    #[serde(default = "default_score_floor")]
    pub req_score_floor: f64,
    #[serde(default = "default_quantile")]
    pub inst_q: f64,
    #[serde(default = "default_window")]
    pub inst_window: usize,
    #[serde(default = "default_min_samples")]
    pub inst_min_samples: usize,
    #[serde(default = "default_true")]
    pub post_only_default: bool,
    #[serde(default)]
    pub pegmid_split: SplitRatios,
    #[serde(default = "default_tick")]
    pub tick_default: Decimal,
    #[serde(default, with = "deserializer::uppercase_key")]
    pub tick_sizes: HashMap<String, Decimal>,
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: Decimal,
    #[serde(default = "default_requote_cooldown_ms")]
    pub requote_cooldown_ms: u64,
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub use_ioc_fallback: bool,
    #[serde(default = "default_fallback_slippage_ticks")]
    pub fallback_slippage_ticks: u32,
    #[serde(default = "default_max_repeg_retries")]
    pub max_repeg_retries: u32,
    #[serde(default)]
    pub tranche_ladder_ticks: u32,
    #[serde(default = "default_daily_dd_limit_pct")]
    pub daily_dd_limit_pct: Decimal,
    #[serde(default = "default_reference_equity")]
    pub reference_equity_usdt: Decimal,
    #[serde(default = "default_max_consec_losses")]
    pub max_consec_losses: u32,
    #[serde(default = "default_cooldown_min")]
    pub cooldown_min: u64,
    #[serde(default = "default_max_loss_per_symbol")]
    pub max_loss_per_symbol_usdt: Decimal,
    #[serde(default)]
    pub cluster_map: ClusterMap,
    #[serde(default = "default_cluster_max_exposure")]
    pub cluster_max_exposure: Decimal,
    #[serde(default = "default_stale_data_ms")]
    pub stale_data_ms: u64,
    #[serde(default = "default_throttle_at_ratio")]
    pub throttle_at_ratio: Decimal,
    #[serde(default = "default_throttle_scale")]
    pub throttle_scale: Decimal,
    #[serde(default = "default_throttle_regimes", with = "deserializer::comma_list")]
    pub throttle_regimes: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            order_value_usdt: default_order_value(),
            req_score_floor: default_score_floor(),
            inst_q: default_quantile(),
            inst_window: default_window(),
            inst_min_samples: default_min_samples(),
            post_only_default: true,
            pegmid_split: SplitRatios::default(),
            tick_default: default_tick(),
            tick_sizes: HashMap::new(),
            queue_threshold: default_queue_threshold(),
            requote_cooldown_ms: default_requote_cooldown_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            use_ioc_fallback: true,
            fallback_slippage_ticks: default_fallback_slippage_ticks(),
            max_repeg_retries: default_max_repeg_retries(),
            tranche_ladder_ticks: 0,
            daily_dd_limit_pct: default_daily_dd_limit_pct(),
            reference_equity_usdt: default_reference_equity(),
            max_consec_losses: default_max_consec_losses(),
            cooldown_min: default_cooldown_min(),
            max_loss_per_symbol_usdt: default_max_loss_per_symbol(),
            cluster_map: ClusterMap::default(),
            cluster_max_exposure: default_cluster_max_exposure(),
            stale_data_ms: default_stale_data_ms(),
            throttle_at_ratio: default_throttle_at_ratio(),
            throttle_scale: default_throttle_scale(),
            throttle_regimes: default_throttle_regimes(),
            log_level: default_log_level(),
            log_path: None,
        }
    }
}

/// Settings consumed by the adaptive threshold estimator.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdSettings {
    pub quantile: f64,
    pub window: usize,
    pub floor: f64,
    pub min_samples: usize,
}

/// Settings consumed by the smart fill engine.
#[derive(Clone, Debug, PartialEq)]
pub struct SfiSettings {
    pub split: SplitRatios,
    pub post_only: bool,
    pub tick_default: Decimal,
    pub tick_sizes: HashMap<String, Decimal>,
    pub queue_threshold: Decimal,
    pub requote_cooldown_ms: u64,
    pub fallback_timeout_ms: u64,
    pub use_ioc_fallback: bool,
    pub fallback_slippage_ticks: u32,
    pub max_repeg_retries: u32,
    pub ladder_ticks: u32,
}

impl SfiSettings {
    /// Tick size for `symbol`, falling back to the default tick.
    #[must_use]
    pub fn tick_for(&self, symbol: &str) -> Decimal {
        self.tick_sizes
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(self.tick_default)
    }
}

/// Settings consumed by the risk guard.
#[derive(Clone, Debug, PartialEq)]
pub struct RiskSettings {
    pub daily_dd_limit_pct: Decimal,
    pub reference_equity: Decimal,
    pub max_consec_losses: u32,
    pub cooldown_min: u64,
    pub max_loss_per_symbol: Decimal,
    pub clusters: ClusterMap,
    pub cluster_max_exposure: Decimal,
    pub stale_data_ms: u64,
    pub throttle_at_ratio: Decimal,
    pub throttle_scale: Decimal,
    pub throttle_regimes: Vec<String>,
}

impl AppConfig {
    /// Check cross-field invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inst_window == 0 {
            return Err(ConfigError::InvalidWindow);
        }
        if !(self.inst_q > 0.0 && self.inst_q <= 1.0) {
            return Err(ConfigError::InvalidQuantile(self.inst_q));
        }
        positive("ORDER_VALUE_USDT", self.order_value_usdt)?;
        positive("TICK_DEFAULT", self.tick_default)?;
        positive("REFERENCE_EQUITY_USDT", self.reference_equity_usdt)?;
        positive("CLUSTER_MAX_EXPOSURE", self.cluster_max_exposure)?;
        if let Some((symbol, tick)) = self.tick_sizes.iter().find(|(_, t)| **t <= Decimal::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "TICK_SIZES",
                reason: format!("tick for {symbol} must be positive (got {tick})"),
            });
        }
        if self.throttle_scale <= Decimal::ZERO || self.throttle_scale > Decimal::ONE {
            return Err(ConfigError::InvalidValue {
                key: "THROTTLE_SCALE",
                reason: format!("must lie within (0, 1] (got {})", self.throttle_scale),
            });
        }
        if self.throttle_at_ratio <= Decimal::ZERO || self.throttle_at_ratio > Decimal::ONE {
            return Err(ConfigError::InvalidValue {
                key: "THROTTLE_AT_RATIO",
                reason: format!("must lie within (0, 1] (got {})", self.throttle_at_ratio),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn threshold(&self) -> ThresholdSettings {
        ThresholdSettings {
            quantile: self.inst_q,
            window: self.inst_window,
            floor: self.req_score_floor,
            min_samples: self.inst_min_samples.max(1),
        }
    }

    #[must_use]
    pub fn sfi(&self) -> SfiSettings {
        SfiSettings {
            split: self.pegmid_split.clone(),
            post_only: self.post_only_default,
            tick_default: self.tick_default,
            tick_sizes: self.tick_sizes.clone(),
            queue_threshold: self.queue_threshold,
            requote_cooldown_ms: self.requote_cooldown_ms,
            fallback_timeout_ms: self.fallback_timeout_ms,
            use_ioc_fallback: self.use_ioc_fallback,
            fallback_slippage_ticks: self.fallback_slippage_ticks,
            max_repeg_retries: self.max_repeg_retries,
            ladder_ticks: self.tranche_ladder_ticks,
        }
    }

    #[must_use]
    pub fn risk(&self) -> RiskSettings {
        RiskSettings {
            daily_dd_limit_pct: self.daily_dd_limit_pct,
            reference_equity: self.reference_equity_usdt,
            max_consec_losses: self.max_consec_losses,
            cooldown_min: self.cooldown_min,
            max_loss_per_symbol: self.max_loss_per_symbol_usdt,
            clusters: self.cluster_map.clone(),
            cluster_max_exposure: self.cluster_max_exposure,
            stale_data_ms: self.stale_data_ms,
            throttle_at_ratio: self.throttle_at_ratio,
            throttle_scale: self.throttle_scale,
            throttle_regimes: self.throttle_regimes.clone(),
        }
    }

    /// Parse a configuration from an inline TOML document (defaults fill the gaps).
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?;
        finish(config)
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<26} {}", "ORDER_VALUE_USDT", self.order_value_usdt)?;
        writeln!(f, "{:<26} {}", "REQ_SCORE_FLOOR", self.req_score_floor)?;
        writeln!(f, "{:<26} {}", "INST_Q", self.inst_q)?;
        writeln!(f, "{:<26} {}", "INST_WINDOW", self.inst_window)?;
        writeln!(f, "{:<26} {}", "POST_ONLY_DEFAULT", self.post_only_default)?;
        let split = self
            .pegmid_split
            .ratios()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        writeln!(f, "{:<26} {}", "PEGMID_SPLIT", split)?;
        writeln!(f, "{:<26} {}", "TICK_DEFAULT", self.tick_default)?;
        writeln!(f, "{:<26} {}", "QUEUE_THRESHOLD", self.queue_threshold)?;
        writeln!(f, "{:<26} {}", "REQUOTE_COOLDOWN_MS", self.requote_cooldown_ms)?;
        writeln!(f, "{:<26} {}", "FALLBACK_TIMEOUT_MS", self.fallback_timeout_ms)?;
        writeln!(f, "{:<26} {}", "USE_IOC_FALLBACK", self.use_ioc_fallback)?;
        writeln!(f, "{:<26} {}", "DAILY_DD_LIMIT_PCT", self.daily_dd_limit_pct)?;
        writeln!(f, "{:<26} {}", "MAX_CONSEC_LOSSES", self.max_consec_losses)?;
        writeln!(f, "{:<26} {}", "COOLDOWN_MIN", self.cooldown_min)?;
        writeln!(
            f,
            "{:<26} {}",
            "MAX_LOSS_PER_SYMBOL_USDT", self.max_loss_per_symbol_usdt
        )?;
        writeln!(f, "{:<26} {} entries", "CLUSTER_MAP", self.cluster_map.len())?;
        write!(
            f,
            "{:<26} {}",
            "CLUSTER_MAX_EXPOSURE", self.cluster_max_exposure
        )
    }
}

fn positive(key: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO {
        return Err(ConfigError::InvalidValue {
            key,
            reason: format!("must be positive (got {value})"),
        });
    }
    Ok(())
}

fn finish(config: Config) -> Result<AppConfig, ConfigError> {
    let app: AppConfig = config.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

fn default_true() -> bool {
    true
}

fn default_order_value() -> Decimal {
    Decimal::from(20)
}

fn default_score_floor() -> f64 {
    1.2
}

fn default_quantile() -> f64 {
    0.70
}

fn default_window() -> usize {
    200
}

fn default_min_samples() -> usize {
    1
}

fn default_tick() -> Decimal {
    Decimal::new(1, 2)
}

fn default_queue_threshold() -> Decimal {
    Decimal::from(2_000)
}

fn default_requote_cooldown_ms() -> u64 {
    800
}

fn default_fallback_timeout_ms() -> u64 {
    3_000
}

fn default_fallback_slippage_ticks() -> u32 {
    1
}

fn default_max_repeg_retries() -> u32 {
    2
}

fn default_daily_dd_limit_pct() -> Decimal {
    Decimal::from(3)
}

fn default_reference_equity() -> Decimal {
    Decimal::from(1_000)
}

fn default_max_consec_losses() -> u32 {
    3
}

fn default_cooldown_min() -> u64 {
    30
}

fn default_max_loss_per_symbol() -> Decimal {
    Decimal::from(50)
}

fn default_cluster_max_exposure() -> Decimal {
    Decimal::from(60)
}

fn default_stale_data_ms() -> u64 {
    120_000
}

fn default_throttle_at_ratio() -> Decimal {
    Decimal::new(8, 1)
}

fn default_throttle_scale() -> Decimal {
    Decimal::new(5, 1)
}

fn default_throttle_regimes() -> Vec<String> {
    vec!["risk_off".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `TRANCHE_` (e.g. `TRANCHE_INST_Q`)
/// 5. The bare option names listed in [`ENV_KEYS`] (e.g. `INST_Q`)
pub fn load_config(env: Option<&str>) -> Result<AppConfig, ConfigError> {
    load_config_from(Path::new("config"), env)
}

/// Same as [`load_config`] but rooted at an arbitrary directory.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("TRANCHE")
            .prefix_separator("_")
            .ignore_empty(true),
    );

    for key in ENV_KEYS {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                builder = builder.set_override(key.to_lowercase(), value)?;
            }
        }
    }

    finish(builder.build()?)
}
