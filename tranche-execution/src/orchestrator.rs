//! Order orchestrator: routes events to live intents and executes the
//! side effects requested by the smart fill engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tranche_broker::{BrokerError, ExchangeAdapter};
use tranche_core::{IntentId, MarketSnapshot, OrderAck, OrderId, Side, Symbol};

use crate::intent::{ExecutionIntent, IntentOutcome};
use crate::sfi::{PlacePurpose, SfiAction, SmartFill, TimerRequest};
use crate::{ExecutionError, ExecutionResult};

/// Maps exchange order ids to the intent and tranche that own them.
type OrderToTrancheMap = HashMap<OrderId, (IntentId, usize)>;

/// Counters describing orchestrator activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub orders_placed: u64,
    pub cancels_sent: u64,
    pub requotes: u64,
    pub repegs: u64,
    pub fallbacks: u64,
    pub handler_failures: u64,
    pub unknown_acks: u64,
    pub intents_completed: u64,
}

/// Owns every live [`ExecutionIntent`] and the exchange adapter they trade through.
///
/// Each handler runs against a working copy of its intent. If the handler or
/// any exchange call it triggers fails, the intent is restored to its prior
/// state, orders placed during the failed run are cancelled and the intent
/// itself is cancelled. Other intents are never touched.
pub struct OrderOrchestrator<A> {
    adapter: A,
    sfi: SmartFill,
    intents: HashMap<IntentId, ExecutionIntent>,
    order_mapping: OrderToTrancheMap,
    completed: Vec<IntentOutcome>,
    stats: OrchestratorStats,
}

impl<A> OrderOrchestrator<A>
where
    A: ExchangeAdapter,
{
    pub fn new(adapter: A, sfi: SmartFill) -> Self {
        Self {
            adapter,
            sfi,
            intents: HashMap::new(),
            order_mapping: HashMap::new(),
            completed: Vec::new(),
            stats: OrchestratorStats::default(),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn smart_fill(&self) -> &SmartFill {
        &self.sfi
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    pub fn intent(&self, id: &IntentId) -> Option<&ExecutionIntent> {
        self.intents.get(id)
    }

    pub fn active_count(&self) -> usize {
        self.intents.len()
    }

    /// Live intents on `symbol` as `(id, side)` pairs.
    ///
    /// Intents whose tranches are all terminal but which still wait on cancel
    /// confirmations are not reported.
    pub fn active_on(&self, symbol: &str) -> Vec<(IntentId, Side)> {
        self.intents
            .values()
            .filter(|intent| intent.symbol == symbol && !intent.is_complete())
            .map(|intent| (intent.id, intent.side))
            .collect()
    }

    /// Outcomes of intents that finished since the last call.
    pub fn take_completed(&mut self) -> Vec<IntentOutcome> {
        std::mem::take(&mut self.completed)
    }

    /// Acknowledgments the adapter produced since the last poll.
    pub fn poll_acks(&mut self) -> Vec<OrderAck> {
        self.adapter.poll_acks()
    }

    /// Forward a snapshot to the adapter so simulated venues can match.
    pub fn observe_market(&mut self, snapshot: &MarketSnapshot) {
        self.adapter.observe_market(snapshot);
    }

    /// Register `intent` and quote its tranches.
    pub fn start_intent(
        &mut self,
        intent: ExecutionIntent,
        snapshot: Option<&MarketSnapshot>,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<TimerRequest>> {
        let id = intent.id;
        info!(
            intent = %id,
            symbol = %intent.symbol,
            side = %intent.side,
            notional = %intent.notional,
            tranches = intent.tranches.len(),
            "starting execution intent"
        );
        self.intents.insert(id, intent);
        self.run_isolated(id, now, |sfi, intent| sfi.start(intent, snapshot, now))
    }

    /// Re-evaluate every intent trading `snapshot.symbol`.
    pub fn on_snapshot(
        &mut self,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<TimerRequest> {
        let ids: Vec<IntentId> = self
            .intents
            .values()
            .filter(|intent| intent.symbol == snapshot.symbol)
            .map(|intent| intent.id)
            .collect();
        let mut timers = Vec::new();
        for id in ids {
            match self.run_isolated(id, now, |sfi, intent| {
                sfi.on_snapshot(intent, snapshot, now)
            }) {
                Ok(requested) => timers.extend(requested),
                Err(err) => debug!(intent = %id, error = %err, "snapshot handler failed"),
            }
        }
        timers
    }

    /// Fire a tranche timer. Timers for finished intents are ignored.
    pub fn on_timer(
        &mut self,
        timer: &TimerRequest,
        snapshots: &HashMap<Symbol, MarketSnapshot>,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<TimerRequest>> {
        let Some(intent) = self.intents.get(&timer.intent_id) else {
            debug!(intent = %timer.intent_id, kind = ?timer.kind, "timer for inactive intent");
            return Ok(Vec::new());
        };
        let snapshot = snapshots.get(&intent.symbol);
        self.run_isolated(timer.intent_id, now, |sfi, intent| {
            sfi.on_timer(intent, timer.tranche, timer.kind, snapshot, now)
        })
    }

    /// Route an acknowledgment to the tranche that owns the order.
    pub fn on_ack(
        &mut self,
        ack: &OrderAck,
        snapshots: &HashMap<Symbol, MarketSnapshot>,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<TimerRequest>> {
        let Some(&(intent_id, tranche)) = self.order_mapping.get(&ack.order_id) else {
            self.stats.unknown_acks += 1;
            return Err(ExecutionError::OrderNotFound(ack.order_id.clone()));
        };
        let Some(intent) = self.intents.get(&intent_id) else {
            self.order_mapping.remove(&ack.order_id);
            self.stats.unknown_acks += 1;
            return Err(ExecutionError::OrderNotFound(ack.order_id.clone()));
        };
        debug!(
            intent = %intent_id,
            tranche,
            order_id = %ack.order_id,
            status = ?ack.status,
            filled = %ack.filled_size,
            "routing order ack"
        );
        let snapshot = snapshots.get(&intent.symbol);
        self.run_isolated(intent_id, now, |sfi, intent| sfi.on_ack(intent, ack, snapshot))
    }

    /// Request cancellation of one intent.
    pub fn cancel_intent(
        &mut self,
        id: IntentId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<TimerRequest>> {
        if !self.intents.contains_key(&id) {
            return Err(ExecutionError::IntentNotFound(id));
        }
        self.run_isolated(id, now, |sfi, intent| Ok(sfi.cancel(intent, reason)))
    }

    /// Request cancellation of every live intent.
    pub fn cancel_all(&mut self, reason: &str, now: DateTime<Utc>) -> Vec<TimerRequest> {
        let ids: Vec<IntentId> = self.intents.keys().copied().collect();
        let mut timers = Vec::new();
        for id in ids {
            match self.cancel_intent(id, reason, now) {
                Ok(requested) => timers.extend(requested),
                Err(err) => warn!(intent = %id, error = %err, "failed to cancel intent"),
            }
        }
        timers
    }

    fn run_isolated<F>(
        &mut self,
        id: IntentId,
        now: DateTime<Utc>,
        handler: F,
    ) -> ExecutionResult<Vec<TimerRequest>>
    where
        F: FnOnce(&SmartFill, &mut ExecutionIntent) -> ExecutionResult<Vec<SfiAction>>,
    {
        let mut intent = self
            .intents
            .remove(&id)
            .ok_or(ExecutionError::IntentNotFound(id))?;
        let backup = intent.clone();
        let mut placed = Vec::new();
        let mut timers = Vec::new();

        let result = handler(&self.sfi, &mut intent)
            .and_then(|actions| self.apply(&mut intent, actions, &mut placed, &mut timers));

        match result {
            Ok(()) => {
                self.settle(intent, now);
                Ok(timers)
            }
            Err(err) => {
                self.stats.handler_failures += 1;
                error!(intent = %id, error = %err, "intent handler failed, cancelling intent");
                for order_id in placed {
                    self.order_mapping.remove(&order_id);
                    self.stats.cancels_sent += 1;
                    if let Err(cancel_err) = self.adapter.cancel_order(&order_id) {
                        warn!(%order_id, error = %cancel_err, "failed to cancel orphaned order");
                    }
                }

                let mut intent = backup;
                let actions = self.sfi.cancel(&mut intent, "handler failure");
                let mut cleanup = Vec::new();
                timers.clear();
                if let Err(cancel_err) =
                    self.apply(&mut intent, actions, &mut cleanup, &mut timers)
                {
                    error!(intent = %id, error = %cancel_err, "cancel failed, abandoning intent");
                    self.sfi.abandon(&mut intent);
                }
                self.settle(intent, now);
                Err(err)
            }
        }
    }

    fn apply(
        &mut self,
        intent: &mut ExecutionIntent,
        actions: Vec<SfiAction>,
        placed: &mut Vec<OrderId>,
        timers: &mut Vec<TimerRequest>,
    ) -> ExecutionResult<()> {
        for action in actions {
            match action {
                SfiAction::Place {
                    tranche,
                    child,
                    request,
                    purpose,
                } => {
                    let order_id = self.adapter.place_order(&request).map_err(|err| match err {
                        BrokerError::Exchange(reason) | BrokerError::InvalidRequest(reason) => {
                            ExecutionError::ExchangeRejection {
                                order_id: request.client_order_id.clone().unwrap_or_default(),
                                reason,
                            }
                        }
                        other => ExecutionError::Broker(other),
                    })?;
                    self.stats.orders_placed += 1;
                    match purpose {
                        PlacePurpose::Initial => {}
                        PlacePurpose::Requote => self.stats.requotes += 1,
                        PlacePurpose::Repeg => self.stats.repegs += 1,
                        PlacePurpose::Fallback => self.stats.fallbacks += 1,
                    }
                    if let Some(slot) = intent.tranches.get_mut(tranche) {
                        if let Some(order) = slot.children.get_mut(child) {
                            order.order_id = Some(order_id.clone());
                        }
                        slot.order_id = Some(order_id.clone());
                    }
                    debug!(
                        intent = %intent.id,
                        tranche,
                        %order_id,
                        ?purpose,
                        price = ?request.price,
                        size = %request.size,
                        "child order placed"
                    );
                    self.order_mapping
                        .insert(order_id.clone(), (intent.id, tranche));
                    placed.push(order_id);
                }
                SfiAction::Cancel { tranche, order_id } => {
                    self.stats.cancels_sent += 1;
                    match self.adapter.cancel_order(&order_id) {
                        Ok(()) => {}
                        Err(BrokerError::UnknownOrder(_)) => {
                            // Already final at the venue; its last ack is still in flight.
                            debug!(intent = %intent.id, tranche, %order_id, "cancel for closed order");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                SfiAction::Timer(timer) => timers.push(timer),
            }
        }
        Ok(())
    }

    /// Emit the outcome once every tranche is terminal and the venue has
    /// closed every child order. Until then the intent and its order mappings
    /// stay registered so late fills on voided orders are still counted.
    fn settle(&mut self, intent: ExecutionIntent, now: DateTime<Utc>) {
        if !intent.is_complete() {
            self.intents.insert(intent.id, intent);
            return;
        }
        if intent.has_open_orders() {
            debug!(intent = %intent.id, "tranches settled, awaiting final acks for voided orders");
            self.intents.insert(intent.id, intent);
            return;
        }
        for tranche in &intent.tranches {
            for child in &tranche.children {
                if let Some(order_id) = &child.order_id {
                    self.order_mapping.remove(order_id);
                }
            }
        }
        let outcome = intent.outcome(now);
        info!(
            intent = %outcome.intent_id,
            symbol = %outcome.symbol,
            requested = %outcome.requested,
            filled = %outcome.filled,
            avg_price = ?outcome.avg_fill_price,
            states = ?outcome.states,
            reason = ?intent.cancel_reason,
            "execution intent completed"
        );
        self.stats.intents_completed += 1;
        self.completed.push(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tranche_broker::BrokerResult;
    use tranche_config::AppConfig;
    use tranche_core::{OrderRequest, Signal};

    use crate::intent::TrancheState;

    #[derive(Default)]
    struct Recording {
        placed: Vec<OrderRequest>,
        cancelled: Vec<OrderId>,
        fail_after: Option<usize>,
    }

    impl ExchangeAdapter for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn place_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderId> {
            if self.fail_after == Some(self.placed.len()) {
                return Err(BrokerError::Transport("link down".into()));
            }
            self.placed.push(request.clone());
            Ok(format!("ord-{}", self.placed.len()))
        }

        fn cancel_order(&mut self, order_id: &OrderId) -> BrokerResult<()> {
            self.cancelled.push(order_id.clone());
            Ok(())
        }
    }

    fn snapshot(now: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot::new(
            "BTCUSDT",
            Decimal::new(9_999, 2),
            Decimal::new(10_001, 2),
            Decimal::from(10),
            now,
        )
    }

    fn intent(now: DateTime<Utc>) -> ExecutionIntent {
        let signal = Signal::new("BTCUSDT", Side::Buy, 2.0, Decimal::from(20), now);
        ExecutionIntent::new(&signal, Decimal::from(20), &Default::default(), now)
    }

    fn orchestrator(adapter: Recording) -> OrderOrchestrator<Recording> {
        let mut sfi = AppConfig::default().sfi();
        sfi.tick_sizes.clear();
        OrderOrchestrator::new(adapter, SmartFill::new(sfi))
    }

    #[test]
    fn start_places_one_order_per_tranche() {
        let now = Utc::now();
        let mut orch = orchestrator(Recording::default());
        let timers = orch
            .start_intent(intent(now), Some(&snapshot(now)), now)
            .unwrap();
        assert_eq!(orch.adapter().placed.len(), 2);
        assert_eq!(timers.len(), 2);
        assert_eq!(orch.stats().orders_placed, 2);
        assert_eq!(orch.active_count(), 1);
    }

    #[test]
    fn failed_placement_cancels_orphans_and_intent() {
        let now = Utc::now();
        let mut orch = orchestrator(Recording {
            fail_after: Some(1),
            ..Recording::default()
        });
        let err = orch
            .start_intent(intent(now), Some(&snapshot(now)), now)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Broker(_)));
        assert_eq!(orch.adapter().cancelled, vec!["ord-1".to_string()]);
        assert_eq!(orch.active_count(), 0);
        let outcomes = orch.take_completed();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0]
            .states
            .iter()
            .all(|state| *state == TrancheState::Cancelled));
        assert_eq!(orch.stats().handler_failures, 1);
    }

    #[test]
    fn unknown_ack_is_reported() {
        let now = Utc::now();
        let mut orch = orchestrator(Recording::default());
        let err = orch
            .on_ack(&OrderAck::accepted("ghost", now), &HashMap::new(), now)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::OrderNotFound(id) if id == "ghost"));
        assert_eq!(orch.stats().unknown_acks, 1);
    }

    #[test]
    fn fill_completes_and_releases_mapping() {
        let now = Utc::now();
        let mut orch = orchestrator(Recording::default());
        orch.start_intent(intent(now), Some(&snapshot(now)), now)
            .unwrap();
        let book = HashMap::new();
        orch.on_ack(
            &OrderAck::filled("ord-1", Decimal::from(12), Decimal::from(100), now),
            &book,
            now,
        )
        .unwrap();
        orch.on_ack(
            &OrderAck::filled("ord-2", Decimal::from(8), Decimal::from(100), now),
            &book,
            now,
        )
        .unwrap();
        let outcomes = orch.take_completed();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].filled, Decimal::from(20));
        assert_eq!(outcomes[0].avg_fill_price, Some(Decimal::from(100)));
        // Replayed fill after completion is unknown.
        assert!(orch
            .on_ack(
                &OrderAck::filled("ord-1", Decimal::from(12), Decimal::from(100), now),
                &book,
                now,
            )
            .is_err());
    }

    #[test]
    fn voided_orders_stay_routable_until_the_venue_closes_them() {
        let now = Utc::now();
        let mut orch = orchestrator(Recording::default());
        orch.start_intent(intent(now), Some(&snapshot(now)), now)
            .unwrap();
        let later = now + chrono::Duration::milliseconds(100);
        let drifted = MarketSnapshot::new(
            "BTCUSDT",
            Decimal::new(10_004, 2),
            Decimal::new(10_006, 2),
            Decimal::from(10),
            later,
        );
        orch.on_snapshot(&drifted, later);
        assert_eq!(orch.adapter().cancelled, vec!["ord-1", "ord-2"]);
        assert_eq!(orch.adapter().placed.len(), 4);

        let book = HashMap::new();
        let price = Decimal::new(10_005, 2);
        orch.on_ack(&OrderAck::filled("ord-3", Decimal::from(12), price, later), &book, later)
            .unwrap();
        orch.on_ack(&OrderAck::filled("ord-4", Decimal::from(8), price, later), &book, later)
            .unwrap();
        assert!(orch.take_completed().is_empty());
        assert!(orch.active_on("BTCUSDT").is_empty());
        assert_eq!(orch.active_count(), 1);

        orch.on_ack(
            &OrderAck::filled("ord-1", Decimal::from(12), Decimal::from(100), later),
            &book,
            later,
        )
        .unwrap();
        assert!(orch.take_completed().is_empty());
        orch.on_ack(&OrderAck::canceled("ord-2", Decimal::ZERO, later), &book, later)
            .unwrap();

        let outcomes = orch.take_completed();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].filled, Decimal::from(32));
        assert_eq!(
            outcomes[0].states,
            vec![TrancheState::Filled, TrancheState::Filled]
        );
        assert_eq!(orch.active_count(), 0);
        assert_eq!(orch.stats().unknown_acks, 0);
    }
}
