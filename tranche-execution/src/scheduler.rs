//! Single-threaded event loop tying the threshold estimator, risk guard,
//! smart fill orchestrator, position book and metrics recorder together.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tranche_broker::{ExchangeAdapter, SnapshotSource};
use tranche_config::{AppConfig, SplitRatios};
use tranche_core::{
    IntentId, MarketSnapshot, OrderAck, Price, Quantity, Signal, Symbol,
};
use tranche_indicators::ThresholdEstimator;
use tranche_portfolio::{MetricsRecorder, MetricsSink, Position, PositionBook};

use crate::intent::{ExecutionIntent, IntentOutcome};
use crate::orchestrator::OrderOrchestrator;
use crate::risk::{RiskDecision, RiskGuard};
use crate::sfi::{SmartFill, TimerRequest};
use crate::{ExecutionError, ExecutionResult};

/// Inputs accepted by the [`Scheduler`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Market(MarketSnapshot),
    Score {
        symbol: Symbol,
        score: f64,
        timestamp: DateTime<Utc>,
    },
    Signal(Signal),
    OrderAck(OrderAck),
    PositionClosed {
        symbol: Symbol,
        exit_price: Price,
        timestamp: DateTime<Utc>,
    },
    CancelIntent {
        intent_id: IntentId,
    },
    /// Advance the logical clock, firing due timers.
    Clock {
        timestamp: DateTime<Utc>,
    },
    Regime {
        tag: String,
    },
}

impl Event {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Market(snapshot) => Some(snapshot.timestamp),
            Self::Score { timestamp, .. }
            | Self::PositionClosed { timestamp, .. }
            | Self::Clock { timestamp } => Some(*timestamp),
            Self::Signal(signal) => Some(signal.timestamp),
            Self::OrderAck(ack) => Some(ack.timestamp),
            Self::CancelIntent { .. } | Self::Regime { .. } => None,
        }
    }
}

/// Counters exported for telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub events: u64,
    pub signals_seen: u64,
    pub signals_gated: u64,
    pub signals_admitted: u64,
    pub signals_throttled: u64,
    pub signals_blocked: u64,
    pub snapshots_dropped: u64,
    pub timers_fired: u64,
    pub orders_placed: u64,
    pub cancels_sent: u64,
    pub requotes: u64,
    pub repegs: u64,
    pub fallbacks: u64,
    pub handler_failures: u64,
    pub dropped_acks: u64,
    pub intents_completed: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub kill_switch_activations: u64,
}

#[derive(Debug)]
struct ScheduledTimer {
    seq: u64,
    request: TimerRequest,
}

impl ScheduledTimer {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.request.at, self.seq)
    }
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Cooperative event loop. All state lives here and is only touched inside [`Scheduler::step`].
pub struct Scheduler<A> {
    order_value: Quantity,
    split: SplitRatios,
    threshold: ThresholdEstimator,
    risk: RiskGuard,
    orchestrator: OrderOrchestrator<A>,
    positions: PositionBook,
    recorder: MetricsRecorder,
    queue: VecDeque<Event>,
    timers: BinaryHeap<Reverse<ScheduledTimer>>,
    timer_seq: u64,
    snapshots: HashMap<Symbol, MarketSnapshot>,
    reserved: HashMap<IntentId, (Symbol, Quantity)>,
    outcomes: Vec<IntentOutcome>,
    now: Option<DateTime<Utc>>,
    stats: EngineStats,
}

impl<A> Scheduler<A>
where
    A: ExchangeAdapter,
{
    pub fn new(
        config: &AppConfig,
        adapter: A,
        sink: Box<dyn MetricsSink>,
    ) -> ExecutionResult<Self> {
        config.validate()?;
        let threshold = ThresholdEstimator::new(config.threshold())?;
        let sfi = SmartFill::new(config.sfi());
        Ok(Self {
            order_value: config.order_value_usdt,
            split: config.pegmid_split.clone(),
            threshold,
            risk: RiskGuard::new(config.risk()),
            orchestrator: OrderOrchestrator::new(adapter, sfi),
            positions: PositionBook::new(),
            recorder: MetricsRecorder::new(sink),
            queue: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            snapshots: HashMap::new(),
            reserved: HashMap::new(),
            outcomes: Vec::new(),
            now: None,
            stats: EngineStats::default(),
        })
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Drain every ready snapshot from `source` into the queue.
    pub fn pump(&mut self, source: &mut impl SnapshotSource) -> usize {
        let mut pushed = 0;
        while let Some(snapshot) = source.next_snapshot() {
            self.push(Event::Market(snapshot));
            pushed += 1;
        }
        pushed
    }

    /// Dispatch a single queued event. Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some(event) = self.queue.pop_front() else {
            return false;
        };
        self.stats.events += 1;
        if let Some(timestamp) = event.timestamp() {
            self.advance_to(timestamp);
        }
        let now = self.clock();
        self.risk.refresh(now);
        self.dispatch(event, now);
        true
    }

    /// Run until the queue is empty, returning the number of events dispatched.
    pub fn run_until_idle(&mut self) -> usize {
        let mut dispatched = 0;
        while self.step() {
            dispatched += 1;
        }
        dispatched
    }

    /// Fire every timer due at or before `timestamp` and move the clock forward.
    pub fn advance_to(&mut self, timestamp: DateTime<Utc>) {
        while self
            .timers
            .peek()
            .is_some_and(|Reverse(timer)| timer.request.at <= timestamp)
        {
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            let at = timer.request.at;
            self.now = Some(self.now.map_or(at, |now| now.max(at)));
            let now = self.clock();
            self.risk.refresh(now);
            self.stats.timers_fired += 1;
            match self
                .orchestrator
                .on_timer(&timer.request, &self.snapshots, now)
            {
                Ok(requested) => self.schedule(requested),
                Err(err) => debug!(
                    intent = %timer.request.intent_id,
                    kind = ?timer.request.kind,
                    error = %err,
                    "timer handler failed"
                ),
            }
            self.process_adapter_acks(now);
            self.collect_completions();
        }
        self.now = Some(self.now.map_or(timestamp, |now| now.max(timestamp)));
    }

    /// Logical time: the latest timestamp observed so far.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.now
    }

    fn clock(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    pub fn stats(&self) -> EngineStats {
        let orch = self.orchestrator.stats();
        EngineStats {
            orders_placed: orch.orders_placed,
            cancels_sent: orch.cancels_sent,
            requotes: orch.requotes,
            repegs: orch.repegs,
            fallbacks: orch.fallbacks,
            handler_failures: orch.handler_failures,
            dropped_acks: orch.unknown_acks,
            intents_completed: orch.intents_completed,
            ..self.stats
        }
    }

    pub fn threshold(&self) -> &ThresholdEstimator {
        &self.threshold
    }

    pub fn threshold_mut(&mut self) -> &mut ThresholdEstimator {
        &mut self.threshold
    }

    pub fn risk(&self) -> &RiskGuard {
        &self.risk
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn orchestrator(&self) -> &OrderOrchestrator<A> {
        &self.orchestrator
    }

    pub fn adapter(&self) -> &A {
        self.orchestrator.adapter()
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        self.orchestrator.adapter_mut()
    }

    pub fn snapshot(&self, symbol: &str) -> Option<&MarketSnapshot> {
        self.snapshots.get(symbol)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Intent outcomes collected since the last call.
    pub fn take_outcomes(&mut self) -> Vec<IntentOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    fn dispatch(&mut self, event: Event, now: DateTime<Utc>) {
        match event {
            Event::Market(snapshot) => self.on_market(snapshot, now),
            Event::Score {
                symbol,
                score,
                timestamp,
            } => self.threshold.observe(&symbol, score, timestamp),
            Event::Signal(signal) => self.on_signal(signal, now),
            Event::OrderAck(ack) => {
                self.on_ack(&ack, now);
                self.process_adapter_acks(now);
                self.collect_completions();
            }
            Event::PositionClosed {
                symbol,
                exit_price,
                timestamp,
            } => self.on_position_closed(&symbol, exit_price, timestamp, now),
            Event::CancelIntent { intent_id } => {
                match self
                    .orchestrator
                    .cancel_intent(intent_id, "operator request", now)
                {
                    Ok(requested) => self.schedule(requested),
                    Err(err) => warn!(intent = %intent_id, error = %err, "cancel request failed"),
                }
                self.process_adapter_acks(now);
                self.collect_completions();
            }
            Event::Clock { .. } => {}
            Event::Regime { tag } => self.risk.set_regime(&tag),
        }
    }

    fn on_market(&mut self, snapshot: MarketSnapshot, now: DateTime<Utc>) {
        if let Some(last) = self.snapshots.get(&snapshot.symbol) {
            if snapshot.timestamp < last.timestamp {
                self.stats.snapshots_dropped += 1;
                debug!(
                    symbol = %snapshot.symbol,
                    timestamp = %snapshot.timestamp,
                    last = %last.timestamp,
                    "dropping out-of-order snapshot"
                );
                return;
            }
        }
        self.risk.on_snapshot(&snapshot.symbol, snapshot.timestamp);
        self.recorder.on_price(&snapshot.symbol, snapshot.mid);
        self.orchestrator.observe_market(&snapshot);
        // Fills triggered by this snapshot land before any re-quote decision.
        self.process_adapter_acks(now);
        let requested = self.orchestrator.on_snapshot(&snapshot, now);
        self.snapshots.insert(snapshot.symbol.clone(), snapshot);
        self.schedule(requested);
        self.process_adapter_acks(now);
        self.collect_completions();
    }

    fn on_signal(&mut self, signal: Signal, now: DateTime<Utc>) {
        self.stats.signals_seen += 1;
        self.threshold
            .observe(&signal.symbol, signal.score, signal.timestamp);
        let cutoff = self.threshold.cutoff(&signal.symbol);
        if signal.score.is_nan() || signal.score < cutoff {
            self.stats.signals_gated += 1;
            debug!(
                signal = %signal.id,
                symbol = %signal.symbol,
                score = signal.score,
                cutoff,
                "signal below adaptive cutoff"
            );
            return;
        }

        let notional = if signal.notional > Decimal::ZERO {
            signal.notional
        } else {
            self.order_value
        };
        let intent = ExecutionIntent::new(&signal, notional, &self.split, now);
        let intent = match self.risk.check(&intent, now) {
            RiskDecision::Allow => intent,
            RiskDecision::Throttle { scale, reason } => {
                self.stats.signals_throttled += 1;
                info!(signal = %signal.id, symbol = %signal.symbol, %scale, %reason, "signal throttled");
                intent.scaled(scale)
            }
            RiskDecision::Block(reason) => {
                self.stats.signals_blocked += 1;
                warn!(signal = %signal.id, symbol = %signal.symbol, %reason, "signal blocked by risk guard");
                return;
            }
        };

        for (id, side) in self.orchestrator.active_on(&intent.symbol) {
            if side != intent.side {
                info!(intent = %id, by = %intent.id, "superseding opposite-side intent");
                match self.orchestrator.cancel_intent(id, "superseded", now) {
                    Ok(requested) => self.schedule(requested),
                    Err(err) => warn!(intent = %id, error = %err, "failed to supersede intent"),
                }
            }
        }

        self.stats.signals_admitted += 1;
        self.risk.reserve_exposure(&intent.symbol, intent.notional);
        self.reserved
            .insert(intent.id, (intent.symbol.clone(), intent.notional));
        let snapshot = self.snapshots.get(&intent.symbol).cloned();
        match self
            .orchestrator
            .start_intent(intent, snapshot.as_ref(), now)
        {
            Ok(requested) => self.schedule(requested),
            Err(err) => warn!(signal = %signal.id, error = %err, "intent failed to start"),
        }
        self.process_adapter_acks(now);
        self.collect_completions();
    }

    fn on_ack(&mut self, ack: &OrderAck, now: DateTime<Utc>) {
        match self.orchestrator.on_ack(ack, &self.snapshots, now) {
            Ok(requested) => self.schedule(requested),
            Err(ExecutionError::OrderNotFound(order_id)) => {
                debug!(%order_id, status = ?ack.status, "dropping ack for unknown order");
            }
            Err(err) => debug!(order_id = %ack.order_id, error = %err, "ack handler failed"),
        }
    }

    fn on_position_closed(
        &mut self,
        symbol: &str,
        exit_price: Price,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let closed = match self.positions.close(symbol, exit_price, timestamp) {
            Ok(closed) => closed,
            Err(err) => {
                warn!(symbol, error = %err, "position close ignored");
                return;
            }
        };
        self.stats.positions_closed += 1;
        self.risk
            .on_position_closed(symbol, closed.position.notional);
        self.recorder.on_close(&closed);
        if self.risk.on_trade_closed(symbol, closed.pnl, timestamp) {
            self.stats.kill_switch_activations += 1;
            let requested = self.orchestrator.cancel_all("kill switch", now);
            self.schedule(requested);
            self.process_adapter_acks(now);
            self.collect_completions();
        }
    }

    fn process_adapter_acks(&mut self, now: DateTime<Utc>) {
        loop {
            let acks = self.orchestrator.poll_acks();
            if acks.is_empty() {
                break;
            }
            for ack in acks {
                self.on_ack(&ack, now);
            }
        }
    }

    fn schedule(&mut self, requests: Vec<TimerRequest>) {
        for request in requests {
            self.timer_seq += 1;
            self.timers.push(Reverse(ScheduledTimer {
                seq: self.timer_seq,
                request,
            }));
        }
    }

    fn collect_completions(&mut self) {
        for outcome in self.orchestrator.take_completed() {
            if let Some((symbol, notional)) = self.reserved.remove(&outcome.intent_id) {
                self.risk.release_exposure(&symbol, notional);
            }
            if outcome.filled > Decimal::ZERO {
                match outcome.avg_fill_price {
                    Some(entry_price) => self.open_position(&outcome, entry_price),
                    None => error!(intent = %outcome.intent_id, "filled intent without fill price"),
                }
            }
            self.outcomes.push(outcome);
        }
    }

    fn open_position(&mut self, outcome: &IntentOutcome, entry_price: Price) {
        let position = Position {
            symbol: outcome.symbol.clone(),
            side: outcome.side,
            notional: outcome.filled,
            entry_price,
            opened_at: outcome.completed_at,
            intent_id: Some(outcome.intent_id),
        };
        match self.positions.open(position) {
            Ok(position) => {
                self.recorder.on_open(position);
                self.risk
                    .on_position_opened(&outcome.symbol, outcome.filled);
                self.stats.positions_opened += 1;
            }
            Err(err) => error!(intent = %outcome.intent_id, error = %err, "failed to open position"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn events_deserialize_from_tagged_json() {
        let raw = r#"{"type":"clock","timestamp":"2024-01-01T00:00:00Z"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, Event::Clock { .. }));

        let raw = r#"{"type":"regime","tag":"risk_off"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(event.timestamp().is_none());
    }

    #[test]
    fn timers_order_by_due_time_then_sequence() {
        let now = Utc::now();
        let mut heap = BinaryHeap::new();
        for (seq, offset) in [(1, 5), (2, 1), (3, 1)] {
            heap.push(Reverse(ScheduledTimer {
                seq,
                request: TimerRequest {
                    at: now + Duration::milliseconds(offset),
                    intent_id: IntentId::nil(),
                    tranche: 0,
                    kind: crate::sfi::TimerKind::RequoteCheck,
                },
            }));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(t)| t.seq)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
