use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use prometheus::{Encoder, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use rust_decimal::prelude::ToPrimitive;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use tranche_broker::ExchangeAdapter;
use tranche_execution::{EngineStats, Scheduler};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    match log_path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {dir:?}"))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_GUARD.set(guard);
            let file_layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .with_filter(EnvFilter::new(filter));
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(stdout_layer)
                .try_init()?;
        }
    }
    Ok(())
}

/// Prometheus view of the engine counters.
///
/// [`EngineStats`] holds running totals, so counters advance by the delta
/// since the previous [`EngineMetrics::observe`] call.
pub struct EngineMetrics {
    registry: Registry,
    signals_seen: IntCounter,
    signals_gated: IntCounter,
    signals_admitted: IntCounter,
    signals_throttled: IntCounter,
    signals_blocked: IntCounter,
    orders_placed: IntCounter,
    requotes: IntCounter,
    fallbacks: IntCounter,
    handler_failures: IntCounter,
    dropped_acks: IntCounter,
    kill_switch_activations: IntCounter,
    active_intents: IntGauge,
    open_positions: IntGauge,
    kill_switch_active: IntGauge,
    cluster_exposure: GaugeVec,
    last: EngineStats,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let signals_seen = counter("tranche_signals_total", "Signals received")?;
        let signals_gated = counter(
            "tranche_signals_gated_total",
            "Signals below the adaptive score cutoff",
        )?;
        let signals_admitted =
            counter("tranche_signals_admitted_total", "Signals turned into intents")?;
        let signals_throttled = counter(
            "tranche_signals_throttled_total",
            "Signals admitted with a reduced notional",
        )?;
        let signals_blocked =
            counter("tranche_signals_blocked_total", "Signals refused by the risk guard")?;
        let orders_placed = counter("tranche_orders_total", "Child orders submitted")?;
        let requotes = counter("tranche_requotes_total", "Passive quotes replaced")?;
        let fallbacks = counter("tranche_fallbacks_total", "IOC fallback orders sent")?;
        let handler_failures = counter(
            "tranche_handler_failures_total",
            "Intent handlers that failed and were cancelled",
        )?;
        let dropped_acks = counter(
            "tranche_dropped_acks_total",
            "Acknowledgments for orders no intent owns",
        )?;
        let kill_switch_activations = counter(
            "tranche_kill_switch_activations_total",
            "Kill switch activations after loss streaks",
        )?;

        let active_intents = IntGauge::new("tranche_active_intents", "Intents still working")?;
        registry.register(Box::new(active_intents.clone()))?;
        let open_positions = IntGauge::new("tranche_open_positions", "Open positions")?;
        registry.register(Box::new(open_positions.clone()))?;
        let kill_switch_active =
            IntGauge::new("tranche_kill_switch_active", "1 while the kill switch is engaged")?;
        registry.register(Box::new(kill_switch_active.clone()))?;
        let cluster_exposure = GaugeVec::new(
            Opts::new(
                "tranche_cluster_exposure_usdt",
                "Reserved plus open notional per correlation cluster",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(cluster_exposure.clone()))?;

        Ok(Self {
            registry,
            signals_seen,
            signals_gated,
            signals_admitted,
            signals_throttled,
            signals_blocked,
            orders_placed,
            requotes,
            fallbacks,
            handler_failures,
            dropped_acks,
            kill_switch_activations,
            active_intents,
            open_positions,
            kill_switch_active,
            cluster_exposure,
            last: EngineStats::default(),
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Fold the latest counters into the registry.
    pub fn observe(&mut self, stats: &EngineStats) {
        let last = self.last;
        let pairs = [
            (&self.signals_seen, stats.signals_seen, last.signals_seen),
            (&self.signals_gated, stats.signals_gated, last.signals_gated),
            (&self.signals_admitted, stats.signals_admitted, last.signals_admitted),
            (&self.signals_throttled, stats.signals_throttled, last.signals_throttled),
            (&self.signals_blocked, stats.signals_blocked, last.signals_blocked),
            (&self.orders_placed, stats.orders_placed, last.orders_placed),
            (&self.requotes, stats.requotes, last.requotes),
            (&self.fallbacks, stats.fallbacks, last.fallbacks),
            (&self.handler_failures, stats.handler_failures, last.handler_failures),
            (&self.dropped_acks, stats.dropped_acks, last.dropped_acks),
            (
                &self.kill_switch_activations,
                stats.kill_switch_activations,
                last.kill_switch_activations,
            ),
        ];
        for (counter, current, previous) in pairs {
            counter.inc_by(current.saturating_sub(previous));
        }
        self.last = *stats;
    }

    /// Refresh gauges and counters from a running scheduler.
    pub fn observe_scheduler<A: ExchangeAdapter>(
        &mut self,
        scheduler: &Scheduler<A>,
        now: DateTime<Utc>,
    ) {
        self.observe(&scheduler.stats());
        self.active_intents
            .set(scheduler.orchestrator().active_count() as i64);
        self.open_positions.set(scheduler.positions().len() as i64);
        self.kill_switch_active
            .set(i64::from(scheduler.risk().kill_switch_until(now).is_some()));
        for (cluster, exposure) in &scheduler.risk().state().exposure {
            self.cluster_exposure
                .with_label_values(&[cluster.as_str()])
                .set(exposure.to_f64().unwrap_or_default());
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Launch a lightweight HTTP server that exposes Prometheus metrics.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
                            error!(error = %err, "failed to encode Prometheus metrics");
                            let mut response = Response::new(Body::from("failed to encode metrics"));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            return Ok::<_, Infallible>(response);
                        }
                        let mut response = Response::new(Body::from(buffer));
                        if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                            response.headers_mut().insert(CONTENT_TYPE, value);
                        }
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        info!(%addr, "serving Prometheus metrics");
        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}
