//! Ordered plan execution: sells, settlement wait, then buys.
//!
//! The state machine per plan is
//! `PLANNED → SELLING → AWAITING_SETTLEMENT → BUYING → DONE`, with `FAILED`
//! absorbing from any stage. Sells are best-effort (one failure does not
//! abort its siblings); settlement is a bounded poll with exponential
//! backoff; every buy re-checks the freshly fetched stable balance rather
//! than trusting the plan's estimate, because failed sells mean the money
//! never arrived.

use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::Error;
use crate::events::{Event, EventSink};
use crate::gateway::{self, MarketGateway, Side};
use crate::ledger::PnlLedger;
use crate::planner::{RebalancePlan, TradeIntent};

/// Lifecycle of one plan through the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Planned,
    Selling,
    AwaitingSettlement,
    Buying,
    Done,
    Failed,
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanState::Planned => write!(f, "PLANNED"),
            PlanState::Selling => write!(f, "SELLING"),
            PlanState::AwaitingSettlement => write!(f, "AWAITING_SETTLEMENT"),
            PlanState::Buying => write!(f, "BUYING"),
            PlanState::Done => write!(f, "DONE"),
            PlanState::Failed => write!(f, "FAILED"),
        }
    }
}

/// How one intent ended.
#[derive(Debug, Clone)]
pub enum IntentOutcome {
    Executed { order_id: u64 },
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct IntentResult {
    pub intent: TradeIntent,
    pub outcome: IntentOutcome,
}

/// Terminal summary of a plan run. Zero successful trades is a normal
/// outcome, not a fault.
#[derive(Debug)]
pub struct ExecutionSummary {
    pub state: PlanState,
    pub results: Vec<IntentResult>,
    /// Estimated proceeds of the sells that were accepted.
    pub sell_proceeds: f64,
    pub failure: Option<Error>,
}

impl ExecutionSummary {
    pub fn executed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, IntentOutcome::Executed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, IntentOutcome::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, IntentOutcome::Skipped { .. }))
            .count()
    }

    /// Notional actually moved by executed intents.
    pub fn executed_notional(&self) -> f64 {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, IntentOutcome::Executed { .. }))
            .map(|r| r.intent.notional)
            .sum()
    }
}

/// Executes one plan against the gateway.
pub struct Sequencer<'a> {
    pub gateway: &'a dyn MarketGateway,
    pub ledger: &'a PnlLedger,
    pub sink: &'a dyn EventSink,
    pub execution: &'a ExecutionConfig,
    pub instance: &'a str,
    /// Asset buys are funded from (the primary quote).
    pub stable_asset: &'a str,
    pub reserved_floor: f64,
}

impl Sequencer<'_> {
    /// Run the plan to a terminal state.
    pub fn execute(&self, plan: &RebalancePlan) -> ExecutionSummary {
        let mut results = Vec::with_capacity(plan.intents.len());
        let mut sell_orders: Vec<(String, u64)> = Vec::new();
        let mut sell_proceeds = 0.0;

        // The planner emits sells first, but the ordering is a hard
        // contract here, so partition rather than trust.
        let sells: Vec<&TradeIntent> = plan.sells().collect();
        let buys: Vec<&TradeIntent> = plan.buys().collect();

        let mut state = PlanState::Planned;

        if !sells.is_empty() {
            state = self.transition(state, PlanState::Selling);
            for intent in &sells {
                match self.submit(intent) {
                    Ok(ack) if !ack.status.is_dead() => {
                        info!(
                            "[{}] SELL {} {:.8} accepted (order {})",
                            self.instance, intent.pair, intent.quantity, ack.order_id
                        );
                        self.ledger.record_sell(&intent.asset, intent.quantity);
                        sell_proceeds += intent.notional;
                        sell_orders.push((intent.pair.clone(), ack.order_id));
                        self.emit_executed(intent, ack.order_id);
                        results.push(IntentResult {
                            intent: (*intent).clone(),
                            outcome: IntentOutcome::Executed {
                                order_id: ack.order_id,
                            },
                        });
                    }
                    Ok(ack) => {
                        // Rejected at the exchange: the money never moves,
                        // so later buys will find less stable available.
                        warn!(
                            "[{}] SELL {} rejected by exchange (order {})",
                            self.instance, intent.pair, ack.order_id
                        );
                        results.push(self.failed(intent, "rejected by exchange"));
                    }
                    Err(e) => {
                        error!("[{}] SELL {} failed: {e}", self.instance, intent.pair);
                        results.push(self.failed(intent, &e.to_string()));
                    }
                }
                self.pace();
            }
        }

        if !sell_orders.is_empty() {
            state = self.transition(state, PlanState::AwaitingSettlement);
            if let Err(e) = self.await_settlement(&sell_orders) {
                self.transition(state, PlanState::Failed);
                error!("[{}] settlement failed: {e}", self.instance);
                for intent in &buys {
                    results.push(IntentResult {
                        intent: (*intent).clone(),
                        outcome: IntentOutcome::Skipped {
                            reason: "plan failed awaiting settlement".into(),
                        },
                    });
                }
                return ExecutionSummary {
                    state: PlanState::Failed,
                    results,
                    sell_proceeds,
                    failure: Some(e),
                };
            }
        }

        if !buys.is_empty() {
            state = self.transition(state, PlanState::Buying);
            for intent in &buys {
                match self.stable_free() {
                    Ok(stable_free) => {
                        let available = stable_free - self.reserved_floor;
                        if intent.notional > available + 1e-9 {
                            let reason = format!(
                                "insufficient stable: need ${:.2}, ${:.2} above the ${:.2} floor",
                                intent.notional,
                                available.max(0.0),
                                self.reserved_floor
                            );
                            warn!("[{}] BUY {} skipped: {reason}", self.instance, intent.pair);
                            self.sink.emit(&Event::TradeBlocked {
                                instance: self.instance.to_string(),
                                pair: intent.pair.clone(),
                                side: Side::Buy,
                                reason: reason.clone(),
                            });
                            results.push(IntentResult {
                                intent: (*intent).clone(),
                                outcome: IntentOutcome::Skipped { reason },
                            });
                            continue;
                        }
                    }
                    Err(e) => {
                        let reason = format!("balance re-check failed: {e}");
                        warn!("[{}] BUY {} skipped: {reason}", self.instance, intent.pair);
                        results.push(IntentResult {
                            intent: (*intent).clone(),
                            outcome: IntentOutcome::Skipped { reason },
                        });
                        continue;
                    }
                }

                match self.submit(intent) {
                    Ok(ack) if !ack.status.is_dead() => {
                        info!(
                            "[{}] BUY {} {:.8} accepted (order {})",
                            self.instance, intent.pair, intent.quantity, ack.order_id
                        );
                        let unit_price = intent.notional / intent.quantity;
                        self.ledger
                            .record_buy(&intent.asset, intent.quantity, unit_price);
                        self.emit_executed(intent, ack.order_id);
                        results.push(IntentResult {
                            intent: (*intent).clone(),
                            outcome: IntentOutcome::Executed {
                                order_id: ack.order_id,
                            },
                        });
                    }
                    Ok(ack) => {
                        warn!(
                            "[{}] BUY {} rejected by exchange (order {})",
                            self.instance, intent.pair, ack.order_id
                        );
                        results.push(self.failed(intent, "rejected by exchange"));
                    }
                    Err(e) => {
                        error!("[{}] BUY {} failed: {e}", self.instance, intent.pair);
                        results.push(self.failed(intent, &e.to_string()));
                    }
                }
                self.pace();
            }
        }

        self.transition(state, PlanState::Done);
        ExecutionSummary {
            state: PlanState::Done,
            results,
            sell_proceeds,
            failure: None,
        }
    }

    fn transition(&self, from: PlanState, to: PlanState) -> PlanState {
        log::debug!("[{}] plan {from} → {to}", self.instance);
        to
    }

    fn submit(&self, intent: &TradeIntent) -> crate::error::Result<crate::gateway::OrderAck> {
        self.gateway
            .place_order(&intent.pair, intent.side, intent.quantity, None)
    }

    fn failed(&self, intent: &TradeIntent, reason: &str) -> IntentResult {
        self.sink.emit(&Event::TradeBlocked {
            instance: self.instance.to_string(),
            pair: intent.pair.clone(),
            side: intent.side,
            reason: reason.to_string(),
        });
        IntentResult {
            intent: intent.clone(),
            outcome: IntentOutcome::Failed {
                reason: reason.to_string(),
            },
        }
    }

    fn emit_executed(&self, intent: &TradeIntent, order_id: u64) {
        self.sink.emit(&Event::TradeExecuted {
            instance: self.instance.to_string(),
            pair: intent.pair.clone(),
            side: intent.side,
            quantity: intent.quantity,
            notional: intent.notional,
            order_id,
        });
    }

    /// Poll every accepted sell until its proceeds have posted.
    ///
    /// Bounded attempts with exponential backoff; exhausting them surfaces
    /// the typed settlement timeout and fails the plan. Buys issued against
    /// unsettled proceeds would only bounce off the exchange anyway.
    fn await_settlement(&self, orders: &[(String, u64)]) -> crate::error::Result<()> {
        for (pair, order_id) in orders {
            let started = Instant::now();
            let mut delay = Duration::from_millis(self.execution.settle_backoff_ms);
            let mut attempts = 0u32;

            loop {
                attempts += 1;
                match self.gateway.order_status(pair, *order_id) {
                    Ok(status) if status.is_settled() => break,
                    Ok(status) if status.is_dead() => {
                        // The sell died after acceptance; its proceeds are
                        // gone, which the per-buy balance check absorbs.
                        warn!(
                            "[{}] sell order {order_id} on {pair} ended {status:?} before settling",
                            self.instance
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        "[{}] settlement poll {attempts} for {pair} order {order_id} failed: {e}",
                        self.instance
                    ),
                }

                if attempts >= self.execution.settle_poll_attempts {
                    return Err(Error::SettlementTimeout {
                        pair: pair.clone(),
                        order_id: *order_id,
                        attempts,
                        waited: started.elapsed(),
                    });
                }

                thread::sleep(delay);
                delay = Duration::from_millis(
                    (delay.as_millis() as f64 * self.execution.settle_backoff_multiplier) as u64,
                );
            }
        }
        Ok(())
    }

    fn stable_free(&self) -> crate::error::Result<f64> {
        let balances = self.gateway.balances()?;
        Ok(gateway::free_of(&balances, self.stable_asset))
    }

    fn pace(&self) {
        if self.execution.order_interval_ms > 0 {
            thread::sleep(Duration::from_millis(self.execution.order_interval_ms));
        }
    }
}
