mod common;

use chrono::Duration;
use rust_decimal::Decimal;
use tranche_core::{OrderAck, Side, TimeInForce};
use tranche_execution::{Event, Scheduler, TrancheState};

use common::*;

#[test]
fn requote_respects_cooldown_and_defers_instead_of_dropping() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 0));
    sched.run_until_idle();

    let placed = &sched.adapter().placed;
    assert_eq!(placed.len(), 2);
    assert!(placed
        .iter()
        .all(|(_, request)| request.price == Some(cents(10_000))));
    assert!(placed
        .iter()
        .all(|(_, request)| request.time_in_force == Some(TimeInForce::PostOnly)));
    assert_eq!(placed[0].1.size, Decimal::from(12));
    assert_eq!(placed[1].1.size, Decimal::from(8));

    // First drift re-quotes immediately.
    sched.push(market("BTCUSDT", 10_004, 10_006, 100));
    sched.run_until_idle();
    assert_eq!(sched.adapter().placed.len(), 4);
    assert_eq!(sched.adapter().cancelled, vec!["mock-1", "mock-2"]);
    assert_eq!(sched.adapter().placed[2].1.price, Some(cents(10_005)));

    // Inside the cooldown: deferred, and armed only once.
    sched.push(market("BTCUSDT", 10_009, 10_011, 200));
    sched.push(market("BTCUSDT", 10_009, 10_011, 300));
    sched.run_until_idle();
    assert_eq!(sched.adapter().placed.len(), 4);
    // Two fallback timers plus one deferred check per tranche.
    assert_eq!(sched.pending_timers(), 4);

    sched.push(Event::Clock { timestamp: at(900) });
    sched.run_until_idle();
    assert_eq!(sched.adapter().placed.len(), 6);
    assert_eq!(sched.adapter().placed[4].1.price, Some(cents(10_010)));
    assert_eq!(sched.stats().requotes, 4);
}

#[test]
fn fill_arriving_before_cancel_confirmation_wins() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 0));
    sched.run_until_idle();
    let (intent_id, _) = sched.orchestrator().active_on("BTCUSDT")[0];

    sched.push(Event::CancelIntent { intent_id });
    sched.run_until_idle();
    assert_eq!(sched.adapter().cancelled.len(), 2);
    // Still waiting on the venue.
    assert_eq!(sched.orchestrator().active_count(), 1);

    let orders = sched.adapter().placed.clone();
    sched.push(fill(&orders[0], cents(10_000), 50));
    sched.push(canceled(&orders[1].0, 60));
    sched.run_until_idle();

    let outcomes = sched.take_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].states,
        vec![TrancheState::Filled, TrancheState::Cancelled]
    );
    assert_eq!(outcomes[0].filled, Decimal::from(12));
    let position = sched.positions().position("BTCUSDT").unwrap();
    assert_eq!(position.notional, Decimal::from(12));
    assert_eq!(position.entry_price, Decimal::from(100));
}

#[test]
fn late_fill_on_requoted_order_reaches_the_position() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 0));
    sched.push(market("BTCUSDT", 10_004, 10_006, 100));
    sched.run_until_idle();
    assert_eq!(sched.adapter().cancelled, vec!["mock-1", "mock-2"]);

    let orders = sched.adapter().placed.clone();
    sched.push(fill(&orders[2], cents(10_005), 150));
    sched.push(fill(&orders[3], cents(10_005), 150));
    sched.run_until_idle();
    // Both tranches are done, but the replaced quotes are not confirmed yet.
    assert!(sched.take_outcomes().is_empty());
    assert_eq!(sched.risk().exposure_for("BTCUSDT"), Decimal::from(20));

    sched.push(fill(&orders[0], cents(10_000), 160));
    sched.push(canceled(&orders[1].0, 170));
    sched.run_until_idle();

    let outcomes = sched.take_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].filled, Decimal::from(32));
    assert_eq!(sched.stats().dropped_acks, 0);
    let position = sched.positions().position("BTCUSDT").unwrap();
    assert_eq!(position.notional, Decimal::from(32));
    assert_eq!(sched.risk().exposure_for("BTCUSDT"), Decimal::from(32));
    assert_eq!(sched.orchestrator().active_count(), 0);
}

#[test]
fn passive_timeout_without_fallback_cancels_and_waits_for_the_venue() {
    let mut config = config();
    config.use_ioc_fallback = false;
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 0));
    sched.run_until_idle();
    let (intent_id, _) = sched.orchestrator().active_on("BTCUSDT")[0];

    sched.push(Event::Clock { timestamp: at(3_000) });
    sched.run_until_idle();
    assert_eq!(sched.adapter().cancelled, vec!["mock-1", "mock-2"]);
    assert_eq!(sched.adapter().placed.len(), 2);
    let intent = sched.orchestrator().intent(&intent_id).unwrap();
    assert!(intent
        .tranches
        .iter()
        .all(|tranche| !tranche.state.is_terminal()));
    assert!(sched.take_outcomes().is_empty());

    sched.push(canceled("mock-1", 3_050));
    sched.push(canceled("mock-2", 3_060));
    sched.run_until_idle();

    let outcomes = sched.take_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].states,
        vec![TrancheState::Cancelled, TrancheState::Cancelled]
    );
    assert_eq!(outcomes[0].filled, Decimal::ZERO);
    // No IOC order was ever sent.
    assert_eq!(sched.adapter().placed.len(), 2);
    assert_eq!(sched.stats().fallbacks, 0);
    assert!(sched.positions().position("BTCUSDT").is_none());
}

#[test]
fn duplicate_acks_do_not_double_count() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 0));
    sched.run_until_idle();
    let orders = sched.adapter().placed.clone();

    let partial = OrderAck::partially_filled(orders[0].0.clone(), Decimal::from(5), cents(10_000), at(10));
    sched.push(Event::OrderAck(partial.clone()));
    sched.push(Event::OrderAck(partial));
    sched.run_until_idle();
    let (intent_id, _) = sched.orchestrator().active_on("BTCUSDT")[0];
    let intent = sched.orchestrator().intent(&intent_id).unwrap();
    assert_eq!(intent.tranches[0].filled(), Decimal::from(5));

    sched.push(fill(&orders[0], cents(10_000), 20));
    sched.push(fill(&orders[1], cents(10_000), 20));
    sched.push(fill(&orders[1], cents(10_000), 30));
    sched.run_until_idle();
    let outcomes = sched.take_outcomes();
    assert_eq!(outcomes[0].filled, Decimal::from(20));
    // The replay after completion is dropped.
    assert_eq!(sched.stats().dropped_acks, 1);
}

#[test]
fn cluster_exposure_blocks_until_reservation_settles() {
    let mut config = config();
    config.cluster_max_exposure = Decimal::from(30);
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(market("ETHUSDT", 299_999, 300_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 10));
    sched.push(signal("ETHUSDT", Side::Buy, 20, 20));
    sched.run_until_idle();
    assert_eq!(sched.stats().signals_blocked, 1);
    assert_eq!(sched.risk().exposure_for("ETHUSDT"), Decimal::from(20));

    let orders = sched.adapter().orders_for("BTCUSDT");
    sched.push(fill(&orders[0], cents(10_000), 30));
    sched.push(fill(&orders[1], cents(10_000), 30));
    sched.push(signal("ETHUSDT", Side::Buy, 10, 40));
    sched.run_until_idle();
    assert_eq!(sched.stats().signals_admitted, 2);
    assert_eq!(sched.risk().exposure_for("BTCUSDT"), Decimal::from(30));

    sched.push(Event::PositionClosed {
        symbol: "BTCUSDT".into(),
        exit_price: cents(10_100),
        timestamp: at(50),
    });
    sched.run_until_idle();
    assert_eq!(sched.risk().exposure_for("BTCUSDT"), Decimal::from(10));
}

#[test]
fn kill_switch_cancels_live_intents_and_clears_after_cooldown() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(market("ETHUSDT", 299_999, 300_001, 0));

    for round in 0..3 {
        let base = round * 10_000;
        sched.push(signal("BTCUSDT", Side::Buy, 20, base));
        sched.run_until_idle();
        let orders = sched.adapter().orders_for("BTCUSDT");
        let n = orders.len();
        sched.push(fill(&orders[n - 2], cents(10_000), base + 1_000));
        sched.push(fill(&orders[n - 1], cents(10_000), base + 1_000));
        if round == 2 {
            sched.push(signal("ETHUSDT", Side::Sell, 20, base + 1_500));
        }
        sched.push(Event::PositionClosed {
            symbol: "BTCUSDT".into(),
            exit_price: Decimal::from(99),
            timestamp: at(base + 2_000),
        });
        sched.run_until_idle();
    }

    assert_eq!(sched.stats().kill_switch_activations, 1);
    let eth_orders: Vec<String> = sched
        .adapter()
        .orders_for("ETHUSDT")
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(eth_orders.len(), 2);
    assert!(eth_orders
        .iter()
        .all(|id| sched.adapter().cancelled.contains(id)));
    for id in &eth_orders {
        sched.push(canceled(id, 22_100));
    }
    sched.push(signal("BTCUSDT", Side::Buy, 20, 23_000));
    sched.run_until_idle();
    assert_eq!(sched.orchestrator().active_count(), 0);
    assert_eq!(sched.stats().signals_blocked, 1);

    let later = 22_000 + Duration::minutes(30).num_milliseconds();
    sched.push(market("BTCUSDT", 9_999, 10_001, later));
    sched.push(signal("BTCUSDT", Side::Buy, 20, later));
    sched.run_until_idle();
    assert_eq!(sched.risk().state().consecutive_losses, 0);
    assert_eq!(sched.orchestrator().active_count(), 1);
}

#[test]
fn stale_or_missing_data_blocks_admission() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(signal("SOLUSDT", Side::Buy, 20, 0));
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 120_001));
    sched.run_until_idle();
    assert_eq!(sched.stats().signals_blocked, 2);
    assert!(sched.adapter().placed.is_empty());
}

#[test]
fn handler_failure_is_isolated_to_its_intent() {
    let config = config();
    let mut sched = Scheduler::new(
        &config,
        MockExchange::failing_on(4),
        Box::new(tranche_portfolio::MemorySink::new()),
    )
    .unwrap();
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(market("ETHUSDT", 299_999, 300_001, 0));
    sched.push(signal("ETHUSDT", Side::Buy, 20, 10));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 20));
    sched.run_until_idle();

    assert_eq!(sched.stats().handler_failures, 1);
    assert_eq!(sched.adapter().cancelled, vec!["mock-3"]);
    assert_eq!(sched.orchestrator().active_count(), 1);
    assert_eq!(sched.orchestrator().active_on("ETHUSDT").len(), 1);
    let outcomes = sched.take_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].symbol, "BTCUSDT");
    assert!(outcomes[0]
        .states
        .iter()
        .all(|state| *state == TrancheState::Cancelled));
    // Only the surviving ETH reservation remains in the shared cluster.
    assert_eq!(sched.risk().exposure_for("BTCUSDT"), Decimal::from(20));

    // The loop keeps going.
    sched.push(market("ETHUSDT", 300_004, 300_006, 30));
    assert!(sched.step());
}

#[test]
fn unknown_acks_are_dropped() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(Event::OrderAck(OrderAck::accepted("ghost", at(0))));
    sched.run_until_idle();
    assert_eq!(sched.stats().dropped_acks, 1);
}

#[test]
fn low_scores_are_gated_and_regime_throttles() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(Event::Signal(tranche_core::Signal::new(
        "BTCUSDT",
        Side::Buy,
        1.0,
        Decimal::from(20),
        at(0),
    )));
    sched.push(Event::Regime {
        tag: "risk_off".into(),
    });
    sched.push(signal("BTCUSDT", Side::Buy, 20, 10));
    sched.run_until_idle();

    let stats = sched.stats();
    assert_eq!(stats.signals_seen, 2);
    assert_eq!(stats.signals_gated, 1);
    assert_eq!(stats.signals_throttled, 1);
    let sizes: Vec<Decimal> = sched
        .adapter()
        .placed
        .iter()
        .map(|(_, request)| request.size)
        .collect();
    assert_eq!(sizes, vec![Decimal::from(6), Decimal::from(4)]);
}

#[test]
fn opposite_signal_supersedes_active_intent() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 0));
    sched.push(signal("BTCUSDT", Side::Buy, 20, 0));
    sched.push(signal("BTCUSDT", Side::Sell, 20, 10));
    sched.run_until_idle();

    assert_eq!(sched.adapter().cancelled, vec!["mock-1", "mock-2"]);
    let placed = &sched.adapter().placed;
    assert_eq!(placed.len(), 4);
    assert_eq!(placed[2].1.side, Side::Sell);
    assert_eq!(placed[2].1.price, Some(cents(10_000)));
}

#[test]
fn out_of_order_snapshots_are_dropped() {
    let config = config();
    let mut sched = scheduler(&config);
    sched.push(market("BTCUSDT", 9_999, 10_001, 100));
    sched.push(market("BTCUSDT", 9_000, 9_002, 50));
    sched.run_until_idle();
    assert_eq!(sched.stats().snapshots_dropped, 1);
    assert_eq!(sched.snapshot("BTCUSDT").unwrap().best_bid, cents(9_999));
}
