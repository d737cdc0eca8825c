//! Smart fill state machine: pegging, re-quoting, fallback and cancellation.
//!
//! The engine never talks to the exchange directly. Every handler mutates the
//! intent in place and returns [`SfiAction`]s for the orchestrator to execute.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tranche_config::SfiSettings;
use tranche_core::{
    round_passive, IntentId, MarketSnapshot, OrderAck, OrderId, OrderRequest, OrderStatus,
    OrderType, Price, Quantity, RejectReason, Side, TimeInForce,
};

use crate::intent::{ChildOrder, ChildRole, ChildStatus, ExecutionIntent, Tranche, TrancheState};
use crate::{ExecutionError, ExecutionResult};

/// Why a child order is being placed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlacePurpose {
    Initial,
    Requote,
    Repeg,
    Fallback,
}

/// Timer kinds owned by a tranche.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum TimerKind {
    /// Re-evaluate re-quote triggers once the cooldown expires.
    RequoteCheck,
    /// Give up on passive execution.
    FallbackTimeout,
}

/// Request to fire [`TimerKind`] for a tranche at `at`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimerRequest {
    pub at: DateTime<Utc>,
    pub intent_id: IntentId,
    pub tranche: usize,
    pub kind: TimerKind,
}

/// Side effect requested by the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum SfiAction {
    Place {
        tranche: usize,
        child: usize,
        request: OrderRequest,
        purpose: PlacePurpose,
    },
    Cancel {
        tranche: usize,
        order_id: OrderId,
    },
    Timer(TimerRequest),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RequoteTrigger {
    /// Too much size queued ahead of our price.
    Queue,
    /// Mid moved more than one tick away from the peg.
    Drift,
}

/// Shared per-intent context passed to tranche-level helpers.
struct IntentCtx<'a> {
    id: IntentId,
    symbol: &'a str,
    side: Side,
}

/// Smart fill engine configured once at startup.
#[derive(Clone, Debug)]
pub struct SmartFill {
    settings: SfiSettings,
}

impl SmartFill {
    pub fn new(settings: SfiSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SfiSettings {
        &self.settings
    }

    pub fn tick_for(&self, symbol: &str) -> Price {
        self.settings.tick_for(symbol)
    }

    fn cooldown(&self) -> Duration {
        Duration::milliseconds(self.settings.requote_cooldown_ms as i64)
    }

    /// Passive peg for `side`: mid rounded toward the passive side, kept off the
    /// opposite touch, then moved `passive_ticks` further away from the market.
    pub fn peg_price(
        &self,
        snapshot: &MarketSnapshot,
        side: Side,
        passive_ticks: u32,
    ) -> ExecutionResult<Price> {
        let tick = self.tick_for(&snapshot.symbol);
        let mut peg = round_passive(snapshot.mid, tick, side);
        match side {
            Side::Buy if peg >= snapshot.best_ask => peg = snapshot.best_ask - tick,
            Side::Sell if peg <= snapshot.best_bid => peg = snapshot.best_bid + tick,
            _ => {}
        }
        peg -= side.sign() * tick * Decimal::from(passive_ticks);
        if peg <= Decimal::ZERO {
            return Err(ExecutionError::InvalidPrice {
                symbol: snapshot.symbol.clone(),
                price: peg,
            });
        }
        Ok(peg)
    }

    fn ladder_ticks(&self, tranche: &Tranche) -> u32 {
        self.settings.ladder_ticks * tranche.index as u32
    }

    /// Quote every pending tranche. A missing snapshot fails the whole start.
    pub fn start(
        &self,
        intent: &mut ExecutionIntent,
        snapshot: Option<&MarketSnapshot>,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<SfiAction>> {
        let snapshot =
            snapshot.ok_or_else(|| ExecutionError::MissingSnapshot(intent.symbol.clone()))?;
        let ExecutionIntent {
            id,
            symbol,
            side,
            tranches,
            ..
        } = intent;
        let ctx = IntentCtx {
            id: *id,
            symbol: symbol.as_str(),
            side: *side,
        };
        let mut actions = Vec::new();
        for tranche in tranches.iter_mut() {
            if tranche.state != TrancheState::Pending {
                continue;
            }
            if tranche.target <= Decimal::ZERO {
                tranche.state = TrancheState::Cancelled;
                continue;
            }
            let price = self.peg_price(snapshot, ctx.side, self.ladder_ticks(tranche))?;
            let target = tranche.target;
            actions.push(self.quote(&ctx, tranche, price, target, PlacePurpose::Initial));
            tranche.state = TrancheState::Quoted;
            tranche.quoted_at = Some(now);
            if self.settings.fallback_timeout_ms > 0 {
                actions.push(SfiAction::Timer(TimerRequest {
                    at: now + Duration::milliseconds(self.settings.fallback_timeout_ms as i64),
                    intent_id: ctx.id,
                    tranche: tranche.index,
                    kind: TimerKind::FallbackTimeout,
                }));
            }
            debug!(
                intent = %ctx.id,
                tranche = tranche.index,
                %price,
                target = %tranche.target,
                "tranche quoted"
            );
        }
        Ok(actions)
    }

    /// Evaluate re-quote triggers for every quoting tranche.
    pub fn on_snapshot(
        &self,
        intent: &mut ExecutionIntent,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<SfiAction>> {
        let ExecutionIntent {
            id,
            symbol,
            side,
            tranches,
            ..
        } = intent;
        let ctx = IntentCtx {
            id: *id,
            symbol: symbol.as_str(),
            side: *side,
        };
        let mut actions = Vec::new();
        for tranche in tranches.iter_mut() {
            actions.extend(self.evaluate_requote(&ctx, tranche, snapshot, now)?);
        }
        Ok(actions)
    }

    /// Handle a tranche timer. Stale timers (tranche moved on) are ignored.
    pub fn on_timer(
        &self,
        intent: &mut ExecutionIntent,
        tranche_index: usize,
        kind: TimerKind,
        snapshot: Option<&MarketSnapshot>,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<SfiAction>> {
        let ExecutionIntent {
            id,
            symbol,
            side,
            tranches,
            ..
        } = intent;
        let ctx = IntentCtx {
            id: *id,
            symbol: symbol.as_str(),
            side: *side,
        };
        let Some(tranche) = tranches.get_mut(tranche_index) else {
            return Ok(Vec::new());
        };
        match kind {
            TimerKind::RequoteCheck => {
                tranche.requote_check_at = None;
                match snapshot {
                    Some(snapshot) => self.evaluate_requote(&ctx, tranche, snapshot, now),
                    None => Ok(Vec::new()),
                }
            }
            TimerKind::FallbackTimeout => Ok(self.fallback(&ctx, tranche, snapshot)),
        }
    }

    /// Apply an exchange acknowledgment to the tranche that owns the order.
    pub fn on_ack(
        &self,
        intent: &mut ExecutionIntent,
        ack: &OrderAck,
        snapshot: Option<&MarketSnapshot>,
    ) -> ExecutionResult<Vec<SfiAction>> {
        let (t, c) = intent
            .locate(&ack.order_id)
            .ok_or_else(|| ExecutionError::OrderNotFound(ack.order_id.clone()))?;
        let ExecutionIntent {
            id,
            symbol,
            side,
            tranches,
            ..
        } = intent;
        let ctx = IntentCtx {
            id: *id,
            symbol: symbol.as_str(),
            side: *side,
        };
        let tranche = &mut tranches[t];
        let child = &mut tranche.children[c];

        // Cumulative sizes make replays harmless.
        if ack.filled_size > child.filled {
            child.filled = ack.filled_size;
            if ack.avg_fill_price.is_some() {
                child.avg_fill_price = ack.avg_fill_price;
            }
        } else if child.avg_fill_price.is_none() && child.filled > Decimal::ZERO {
            child.avg_fill_price = ack.avg_fill_price;
        }
        if ack.status.is_final() {
            child.status = ChildStatus::Done;
        }
        let role = child.role;
        let child_filled = child.filled;

        if tranche.state.is_terminal() {
            debug!(intent = %ctx.id, order_id = %ack.order_id, status = ?ack.status, "ack for terminal tranche");
            return Ok(Vec::new());
        }

        let is_current = tranche.current_child == Some(c);
        let mut actions = Vec::new();

        if role == ChildRole::Fallback && ack.status.is_final() {
            let state = if child_filled > Decimal::ZERO {
                TrancheState::FallbackFilled
            } else if tranche.is_complete() {
                TrancheState::Filled
            } else {
                TrancheState::Cancelled
            };
            info!(
                intent = %ctx.id,
                tranche = tranche.index,
                filled = %tranche.filled(),
                target = %tranche.target,
                ?state,
                "fallback finished"
            );
            self.finish(&ctx, tranche, state, &mut actions);
            return Ok(actions);
        }

        match ack.status {
            OrderStatus::Canceled
                if is_current && tranche.state.is_quoting() && !tranche.cancel_requested =>
            {
                warn!(intent = %ctx.id, order_id = %ack.order_id, "quote cancelled by venue");
                let state = if tranche.is_complete() {
                    TrancheState::Filled
                } else {
                    TrancheState::Cancelled
                };
                self.finish(&ctx, tranche, state, &mut actions);
                return Ok(actions);
            }
            OrderStatus::Rejected
                if is_current && tranche.state.is_quoting() && !tranche.cancel_requested =>
            {
                let would_cross = matches!(
                    ack.reject_reason,
                    Some(RejectReason::PostOnlyWouldCross)
                );
                if would_cross && tranche.repeg_attempts < self.settings.max_repeg_retries {
                    tranche.repeg_attempts += 1;
                    let price = match snapshot {
                        Some(snapshot) => self.peg_price(
                            snapshot,
                            ctx.side,
                            self.ladder_ticks(tranche) + tranche.repeg_attempts,
                        )?,
                        None => {
                            let tick = self.tick_for(ctx.symbol);
                            let last = tranche.peg.ok_or_else(|| {
                                ExecutionError::MissingSnapshot(ctx.symbol.to_string())
                            })?;
                            last - ctx.side.sign() * tick
                        }
                    };
                    let remaining = tranche.remaining();
                    info!(
                        intent = %ctx.id,
                        tranche = tranche.index,
                        attempt = tranche.repeg_attempts,
                        %price,
                        "post-only rejected, re-pegging"
                    );
                    actions.push(self.quote(&ctx, tranche, price, remaining, PlacePurpose::Repeg));
                } else {
                    warn!(
                        intent = %ctx.id,
                        tranche = tranche.index,
                        reason = ?ack.reject_reason,
                        attempts = tranche.repeg_attempts,
                        "quote rejected, giving up on tranche"
                    );
                    let state = if tranche.is_complete() {
                        TrancheState::Filled
                    } else {
                        TrancheState::Cancelled
                    };
                    self.finish(&ctx, tranche, state, &mut actions);
                }
                return Ok(actions);
            }
            _ => {}
        }

        if tranche.is_complete() {
            let state = if tranche.state == TrancheState::Fallback {
                TrancheState::FallbackFilled
            } else {
                TrancheState::Filled
            };
            self.finish(&ctx, tranche, state, &mut actions);
        } else if tranche.cancel_requested && tranche.open_children().next().is_none() {
            self.finish(&ctx, tranche, TrancheState::Cancelled, &mut actions);
        }
        Ok(actions)
    }

    /// Request cancellation of every non-terminal tranche.
    ///
    /// Tranches become `Cancelled` once the venue confirms; fills that arrive
    /// first still count.
    pub fn cancel(&self, intent: &mut ExecutionIntent, reason: &str) -> Vec<SfiAction> {
        if intent.cancel_reason.is_none() {
            intent.cancel_reason = Some(reason.to_string());
        }
        let mut actions = Vec::new();
        for tranche in intent.tranches.iter_mut() {
            if tranche.state.is_terminal() {
                continue;
            }
            tranche.cancel_requested = true;
            let before = actions.len();
            request_cancels(tranche, &mut actions);
            let waiting = tranche
                .open_children()
                .any(|(_, child)| child.status == ChildStatus::CancelRequested);
            if actions.len() == before && !waiting {
                tranche.state = if tranche.is_complete() {
                    TrancheState::Filled
                } else {
                    TrancheState::Cancelled
                };
            }
        }
        info!(intent = %intent.id, reason, "intent cancellation requested");
        actions
    }

    /// Force every non-terminal tranche to `Cancelled` without waiting for the venue.
    pub fn abandon(&self, intent: &mut ExecutionIntent) {
        for tranche in intent.tranches.iter_mut() {
            if tranche.state.is_terminal() {
                continue;
            }
            for child in tranche.children.iter_mut() {
                child.status = ChildStatus::Done;
            }
            tranche.state = if tranche.is_complete() {
                TrancheState::Filled
            } else {
                TrancheState::Cancelled
            };
        }
    }

    fn evaluate_requote(
        &self,
        ctx: &IntentCtx<'_>,
        tranche: &mut Tranche,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<SfiAction>> {
        if !tranche.state.is_quoting() || tranche.cancel_requested {
            return Ok(Vec::new());
        }
        let Some(peg) = tranche.peg else {
            return Ok(Vec::new());
        };
        let Some(trigger) = self.requote_trigger(snapshot, ctx.side, peg) else {
            return Ok(Vec::new());
        };
        if let Some(last) = tranche.last_requote_at {
            let due = last + self.cooldown();
            if now < due {
                if tranche.requote_check_at.is_none() {
                    tranche.requote_check_at = Some(due);
                    debug!(
                        intent = %ctx.id,
                        tranche = tranche.index,
                        ?trigger,
                        %due,
                        "re-quote deferred by cooldown"
                    );
                    return Ok(vec![SfiAction::Timer(TimerRequest {
                        at: due,
                        intent_id: ctx.id,
                        tranche: tranche.index,
                        kind: TimerKind::RequoteCheck,
                    })]);
                }
                return Ok(Vec::new());
            }
        }
        self.requote(ctx, tranche, snapshot, trigger, now)
    }

    fn requote_trigger(
        &self,
        snapshot: &MarketSnapshot,
        side: Side,
        peg: Price,
    ) -> Option<RequoteTrigger> {
        let tick = self.tick_for(&snapshot.symbol);
        if queue_ahead(snapshot, side, peg) > self.settings.queue_threshold {
            return Some(RequoteTrigger::Queue);
        }
        if (snapshot.mid - peg).abs() > tick {
            return Some(RequoteTrigger::Drift);
        }
        None
    }

    fn requote(
        &self,
        ctx: &IntentCtx<'_>,
        tranche: &mut Tranche,
        snapshot: &MarketSnapshot,
        trigger: RequoteTrigger,
        now: DateTime<Utc>,
    ) -> ExecutionResult<Vec<SfiAction>> {
        let Some(current_peg) = tranche.peg else {
            return Ok(Vec::new());
        };
        let tick = self.tick_for(ctx.symbol);
        let mut price = self.peg_price(snapshot, ctx.side, self.ladder_ticks(tranche))?;
        if price == current_peg {
            if trigger != RequoteTrigger::Queue {
                return Ok(Vec::new());
            }
            let improved = current_peg + ctx.side.sign() * tick;
            let crosses = match ctx.side {
                Side::Buy => improved >= snapshot.best_ask,
                Side::Sell => improved <= snapshot.best_bid,
            };
            if crosses {
                debug!(intent = %ctx.id, tranche = tranche.index, "queue re-quote would cross, holding");
                return Ok(Vec::new());
            }
            price = improved;
        }
        let remaining = tranche.remaining();
        if remaining <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        if let Some(idx) = tranche.current_child {
            let child = &mut tranche.children[idx];
            if child.status == ChildStatus::Live {
                if let Some(order_id) = child.order_id.clone() {
                    child.status = ChildStatus::CancelRequested;
                    actions.push(SfiAction::Cancel {
                        tranche: tranche.index,
                        order_id,
                    });
                }
            }
        }
        info!(
            intent = %ctx.id,
            tranche = tranche.index,
            ?trigger,
            from = %current_peg,
            to = %price,
            %remaining,
            "re-quoting tranche"
        );
        actions.push(self.quote(ctx, tranche, price, remaining, PlacePurpose::Requote));
        tranche.state = TrancheState::Requoted;
        tranche.last_requote_at = Some(now);
        tranche.requote_check_at = None;
        tranche.requotes += 1;
        Ok(actions)
    }

    fn fallback(
        &self,
        ctx: &IntentCtx<'_>,
        tranche: &mut Tranche,
        snapshot: Option<&MarketSnapshot>,
    ) -> Vec<SfiAction> {
        if !tranche.state.is_quoting() || tranche.cancel_requested {
            return Vec::new();
        }
        let mut actions = Vec::new();
        let snapshot = match snapshot {
            Some(snapshot) if self.settings.use_ioc_fallback => snapshot,
            _ => {
                info!(
                    intent = %ctx.id,
                    tranche = tranche.index,
                    "passive timeout, cancelling tranche"
                );
                tranche.cancel_requested = true;
                request_cancels(tranche, &mut actions);
                if tranche.open_children().next().is_none() {
                    self.finish(ctx, tranche, TrancheState::Cancelled, &mut actions);
                }
                return actions;
            }
        };

        request_cancels(tranche, &mut actions);
        let remaining = tranche.remaining();
        if remaining <= Decimal::ZERO {
            return actions;
        }
        let tick = self.tick_for(ctx.symbol);
        let slippage = tick * Decimal::from(self.settings.fallback_slippage_ticks);
        let price = snapshot.opposite_best(ctx.side) + ctx.side.sign() * slippage;
        let seq = tranche.children.len() + 1;
        let request = OrderRequest {
            symbol: ctx.symbol.to_string(),
            side: ctx.side,
            order_type: OrderType::Limit,
            price: Some(price),
            size: remaining,
            time_in_force: Some(TimeInForce::ImmediateOrCancel),
            client_order_id: Some(client_order_id(ctx.id, tranche.index, seq)),
        };
        tranche.children.push(ChildOrder {
            order_id: None,
            client_order_id: request.client_order_id.clone().unwrap_or_default(),
            role: ChildRole::Fallback,
            price,
            size: remaining,
            filled: Decimal::ZERO,
            avg_fill_price: None,
            status: ChildStatus::Live,
        });
        let child = tranche.children.len() - 1;
        tranche.current_child = Some(child);
        tranche.order_id = None;
        tranche.state = TrancheState::Fallback;
        info!(
            intent = %ctx.id,
            tranche = tranche.index,
            %price,
            %remaining,
            "passive timeout, sending IOC fallback"
        );
        actions.push(SfiAction::Place {
            tranche: tranche.index,
            child,
            request,
            purpose: PlacePurpose::Fallback,
        });
        actions
    }

    fn quote(
        &self,
        ctx: &IntentCtx<'_>,
        tranche: &mut Tranche,
        price: Price,
        size: Quantity,
        purpose: PlacePurpose,
    ) -> SfiAction {
        let seq = tranche.children.len() + 1;
        let request = OrderRequest {
            symbol: ctx.symbol.to_string(),
            side: ctx.side,
            order_type: OrderType::Limit,
            price: Some(price),
            size,
            time_in_force: Some(if self.settings.post_only {
                TimeInForce::PostOnly
            } else {
                TimeInForce::GoodTilCanceled
            }),
            client_order_id: Some(client_order_id(ctx.id, tranche.index, seq)),
        };
        tranche.children.push(ChildOrder {
            order_id: None,
            client_order_id: request.client_order_id.clone().unwrap_or_default(),
            role: ChildRole::Quote,
            price,
            size,
            filled: Decimal::ZERO,
            avg_fill_price: None,
            status: ChildStatus::Live,
        });
        let child = tranche.children.len() - 1;
        tranche.current_child = Some(child);
        tranche.order_id = None;
        tranche.peg = Some(price);
        SfiAction::Place {
            tranche: tranche.index,
            child,
            request,
            purpose,
        }
    }

    fn finish(
        &self,
        ctx: &IntentCtx<'_>,
        tranche: &mut Tranche,
        state: TrancheState,
        actions: &mut Vec<SfiAction>,
    ) {
        // Anything still resting is void once the tranche is settled.
        request_cancels(tranche, actions);
        tranche.state = state;
        info!(
            intent = %ctx.id,
            tranche = tranche.index,
            ?state,
            filled = %tranche.filled(),
            target = %tranche.target,
            requotes = tranche.requotes,
            "tranche finished"
        );
    }
}

/// Size resting ahead of an order at `peg`: nothing when we improve on the
/// same-side best, otherwise the depth at the touch.
fn queue_ahead(snapshot: &MarketSnapshot, side: Side, peg: Price) -> Quantity {
    let improves = match side {
        Side::Buy => peg > snapshot.best_bid,
        Side::Sell => peg < snapshot.best_ask,
    };
    if improves {
        Decimal::ZERO
    } else {
        snapshot.queue_depth
    }
}

fn request_cancels(tranche: &mut Tranche, actions: &mut Vec<SfiAction>) {
    let index = tranche.index;
    for child in tranche.children.iter_mut() {
        if child.status != ChildStatus::Live {
            continue;
        }
        match child.order_id.clone() {
            Some(order_id) => {
                child.status = ChildStatus::CancelRequested;
                actions.push(SfiAction::Cancel {
                    tranche: index,
                    order_id,
                });
            }
            None => child.status = ChildStatus::Done,
        }
    }
}

fn client_order_id(intent: IntentId, tranche: usize, seq: usize) -> String {
    format!("sfi-{}-{}-{}", intent.simple(), tranche, seq)
}
