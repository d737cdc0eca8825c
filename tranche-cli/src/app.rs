use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn};
use tranche_config::{load_config, load_config_from, AppConfig};
use tranche_execution::{IntentOutcome, Scheduler, TrancheState};
use tranche_paper::PaperExchange;
use tranche_portfolio::{MetricsSink, TracingSink};

use crate::replay::{run_replay, spawn_reader, JsonlSink, ReplaySummary};
use crate::telemetry::{init_tracing, spawn_metrics_server, EngineMetrics};

#[derive(Parser)]
#[command(author, version, about = "Tranche order execution engine")]
pub struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    /// Directory holding default.toml and the environment overlays
    #[arg(long)]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the resolved configuration after validation
    CheckConfig,
    /// Replay a JSON-lines event file against the paper exchange
    Replay(ReplayArgs),
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to the JSON-lines event file
    #[arg(long)]
    events: PathBuf,
    /// Append finalized trade records to this JSON-lines file
    #[arg(long)]
    records: Option<PathBuf>,
    /// Serve Prometheus metrics on this address until Ctrl-C
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
    #[arg(long, default_value_t = 1024)]
    channel_capacity: usize,
}

impl ReplayArgs {
    async fn run(&self, config: &AppConfig) -> Result<()> {
        let sink: Box<dyn MetricsSink> = match &self.records {
            Some(path) => Box::new(JsonlSink::create(path)?),
            None => Box::new(TracingSink),
        };
        let mut scheduler = Scheduler::new(config, PaperExchange::new("paper"), sink)
            .context("failed to build scheduler")?;
        let mut metrics = EngineMetrics::new()?;
        let server = self
            .metrics_addr
            .map(|addr| spawn_metrics_server(metrics.registry(), addr));

        info!(events = %self.events.display(), "starting replay");
        let (events, reader) = spawn_reader(self.events.clone(), self.channel_capacity);
        let summary = run_replay(&mut scheduler, events, Some(&mut metrics)).await;
        let sent = reader.await.context("event reader panicked")??;
        if sent != summary.events {
            warn!(sent, received = summary.events, "event count mismatch");
        }
        print_summary(&summary);

        if let Some(server) = server {
            info!("replay done; serving metrics until Ctrl-C");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            server.abort();
        }
        Ok(())
    }
}

fn print_summary(summary: &ReplaySummary) {
    let stats = &summary.stats;
    println!("events processed : {}", summary.events);
    println!(
        "signals          : {} seen, {} gated, {} admitted ({} throttled), {} blocked",
        stats.signals_seen,
        stats.signals_gated,
        stats.signals_admitted,
        stats.signals_throttled,
        stats.signals_blocked
    );
    println!(
        "orders           : {} placed, {} cancels, {} requotes, {} re-pegs, {} fallbacks",
        stats.orders_placed, stats.cancels_sent, stats.requotes, stats.repegs, stats.fallbacks
    );
    println!(
        "positions        : {} opened, {} closed, {} still open",
        stats.positions_opened, stats.positions_closed, summary.open_positions
    );
    println!(
        "intents          : {} completed, {} still active",
        summary.outcomes.len(),
        summary.active_intents
    );
    println!(
        "kill switch      : {} activations",
        stats.kill_switch_activations
    );
    for outcome in &summary.outcomes {
        println!("  {}", describe_outcome(outcome));
    }
}

fn describe_outcome(outcome: &IntentOutcome) -> String {
    let states = outcome
        .states
        .iter()
        .map(|state| format!("{state:?}"))
        .collect::<Vec<_>>()
        .join("/");
    let price = outcome
        .avg_fill_price
        .map(|price| price.to_string())
        .unwrap_or_else(|| "-".to_string());
    let fill_pct = if outcome.requested > Decimal::ZERO {
        (outcome.filled / outcome.requested * Decimal::from(100)).round_dp(1)
    } else {
        Decimal::ZERO
    };
    let passive = outcome
        .states
        .iter()
        .all(|state| *state == TrancheState::Filled);
    format!(
        "{} {:?} filled {}/{} ({fill_pct}%) @ {price} [{states}]{}",
        outcome.symbol,
        outcome.side,
        outcome.filled,
        outcome.requested,
        if passive { " passive" } else { "" }
    )
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config_dir {
        Some(dir) => load_config_from(dir, Some(&cli.env)),
        None => load_config(Some(&cli.env)),
    }
    .context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    init_tracing(&filter, config.log_path.as_deref()).context("failed to initialize logging")?;

    match &cli.command {
        Commands::CheckConfig => println!("{config}"),
        Commands::Replay(args) => args.run(&config).await?,
    }
    Ok(())
}
