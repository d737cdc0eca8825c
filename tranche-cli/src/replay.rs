//! Replay of recorded JSON-lines event files through the scheduler.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tranche_broker::ExchangeAdapter;
use tranche_execution::{EngineStats, Event, IntentOutcome, Scheduler};
use tranche_portfolio::{MetricsRecord, MetricsSink};

use crate::telemetry::EngineMetrics;

/// Parse one line of an event file. Blank lines and `#` comments yield `None`.
pub fn parse_event(line: &str) -> Result<Option<Event>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("invalid event")?;
    Ok(Some(event))
}

/// Stream events from `path` into a bounded channel on a background task.
///
/// The task resolves to the number of events sent.
pub fn spawn_reader(path: PathBuf, capacity: usize) -> (mpsc::Receiver<Event>, JoinHandle<Result<usize>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;
        let mut sent = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let Some(event) = parse_event(&line)
                .with_context(|| format!("{}:{line_no}", path.display()))?
            else {
                continue;
            };
            if tx.send(event).await.is_err() {
                debug!("event consumer closed early");
                break;
            }
            sent += 1;
        }
        Ok(sent)
    });
    (rx, handle)
}

/// Totals reported once a replay finishes.
#[derive(Debug)]
pub struct ReplaySummary {
    pub events: usize,
    pub stats: EngineStats,
    pub outcomes: Vec<IntentOutcome>,
    pub open_positions: usize,
    pub active_intents: usize,
}

/// Drive `scheduler` with every event received on `events` until the channel closes.
pub async fn run_replay<A: ExchangeAdapter>(
    scheduler: &mut Scheduler<A>,
    mut events: mpsc::Receiver<Event>,
    mut metrics: Option<&mut EngineMetrics>,
) -> ReplaySummary {
    let mut received = 0;
    let mut outcomes = Vec::new();
    while let Some(event) = events.recv().await {
        received += 1;
        scheduler.push(event);
        scheduler.run_until_idle();
        outcomes.extend(scheduler.take_outcomes());
        if let (Some(metrics), Some(now)) = (metrics.as_deref_mut(), scheduler.now()) {
            metrics.observe_scheduler(scheduler, now);
        }
    }
    let summary = ReplaySummary {
        events: received,
        stats: scheduler.stats(),
        outcomes,
        open_positions: scheduler.positions().len(),
        active_intents: scheduler.orchestrator().active_count(),
    };
    info!(
        events = summary.events,
        intents = summary.outcomes.len(),
        open_positions = summary.open_positions,
        active_intents = summary.active_intents,
        "replay finished"
    );
    summary
}

/// Appends every finalized trade record as one JSON line.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, record: MetricsRecord) {
        let result = serde_json::to_writer(&mut self.writer, &record)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                self.writer.write_all(b"\n")?;
                self.writer.flush()?;
                Ok(())
            });
        if let Err(err) = result {
            error!(symbol = %record.symbol, error = %err, "failed to persist trade record");
        }
    }
}
