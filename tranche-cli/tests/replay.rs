use std::io::Write;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::NamedTempFile;
use tranche_cli::replay::{run_replay, spawn_reader, JsonlSink};
use tranche_cli::telemetry::EngineMetrics;
use tranche_config::AppConfig;
use tranche_core::{MarketSnapshot, Side, Signal};
use tranche_execution::{Event, Scheduler};
use tranche_paper::PaperExchange;
use tranche_portfolio::MetricsRecord;

fn at(ms: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap() + Duration::milliseconds(ms)
}

fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

fn market(bid: i64, ask: i64, ms: i64) -> Event {
    Event::Market(MarketSnapshot::new(
        "BTCUSDT",
        cents(bid),
        cents(ask),
        Decimal::from(10),
        at(ms),
    ))
}

fn write_events(events: &[Event]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# recorded session").unwrap();
    for event in events {
        writeln!(file, "{}", serde_json::to_string(event).unwrap()).unwrap();
        writeln!(file).unwrap();
    }
    file
}

#[tokio::test]
async fn replays_file_and_persists_trade_records() {
    let events = write_events(&[
        market(9_999, 10_001, 0),
        Event::Signal(Signal::new("BTCUSDT", Side::Buy, 2.0, Decimal::from(20), at(10))),
        market(9_998, 10_000, 100),
        market(10_049, 10_051, 200),
        Event::PositionClosed {
            symbol: "BTCUSDT".into(),
            exit_price: cents(10_020),
            timestamp: at(300),
        },
    ]);
    let records = NamedTempFile::new().unwrap();

    let sink = JsonlSink::create(records.path()).unwrap();
    let mut scheduler =
        Scheduler::new(&AppConfig::default(), PaperExchange::new("paper"), Box::new(sink)).unwrap();
    let mut metrics = EngineMetrics::new().unwrap();
    let (rx, reader) = spawn_reader(events.path().to_path_buf(), 2);
    let summary = run_replay(&mut scheduler, rx, Some(&mut metrics)).await;

    assert_eq!(reader.await.unwrap().unwrap(), 5);
    assert_eq!(summary.events, 5);
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.outcomes[0].filled, Decimal::from(20));
    assert_eq!(summary.stats.positions_opened, 1);
    assert_eq!(summary.stats.positions_closed, 1);
    assert_eq!(summary.open_positions, 0);
    assert_eq!(summary.active_intents, 0);

    let text = std::fs::read_to_string(records.path()).unwrap();
    let lines: Vec<MetricsRecord> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].side, Side::Buy);
    assert_eq!(lines[0].mfe, cents(50));
    assert_eq!(lines[0].pnl, cents(4));

    let exported = metrics.encode().unwrap();
    assert!(exported.contains("tranche_signals_admitted_total 1"));
    assert!(exported.contains("tranche_open_positions 0"));
}

#[tokio::test]
async fn malformed_line_reports_its_position() {
    let mut file = write_events(&[market(9_999, 10_001, 0)]);
    writeln!(file, "{{\"type\":\"market\"").unwrap();
    writeln!(file, "{}", serde_json::to_string(&market(9_999, 10_001, 50)).unwrap()).unwrap();

    let mut scheduler = Scheduler::new(
        &AppConfig::default(),
        PaperExchange::new("paper"),
        Box::new(tranche_portfolio::MemorySink::new()),
    )
    .unwrap();
    let (rx, reader) = spawn_reader(file.path().to_path_buf(), 8);
    let summary = run_replay(&mut scheduler, rx, None).await;

    let err = reader.await.unwrap().unwrap_err();
    assert!(format!("{err:#}").contains(":4"));
    assert_eq!(summary.events, 1);
}

#[tokio::test]
async fn missing_file_fails_the_reader() {
    let dir = tempfile::tempdir().unwrap();
    let (mut rx, reader) = spawn_reader(dir.path().join("absent.jsonl"), 8);
    assert!(rx.recv().await.is_none());
    assert!(reader.await.unwrap().is_err());
}
