//! Cycle orchestration: valuation → deviation → plan → guard → execution.
//!
//! One [`Rebalancer`] per configured instance. Each owns its targets,
//! cooldown state and counters explicitly; instances share the exchange
//! account and the stable buffer, and the floor check against freshly
//! fetched balances is what keeps overlapping cycles from draining it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use rustc_hash::FxHashMap;

use crate::class::AssetClass;
use crate::config::{Config, ExecutionConfig, GatewayConfig, GuardConfig, InstanceConfig, LotConfig};
use crate::deviation::{self, Assessment, SkipReason};
use crate::error::Error;
use crate::events::{Event, EventSink, IntentRecord};
use crate::gateway::{self, MarketGateway};
use crate::guard::{self, OperationRecord};
use crate::ledger::PnlLedger;
use crate::planner::{self, PlanContext, PlanOutcome, RebalancePlan};
use crate::sequencer::{ExecutionSummary, Sequencer};
use crate::valuation;

/// How a cycle is allowed to act once it has a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// Execute without asking (the loop).
    Auto,
    /// Compute and report the plan, never execute.
    DryRun,
    /// Ask interactively before executing (one-shot CLI runs).
    Confirm,
}

/// Terminal state of one cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// A plan ran to a terminal sequencer state.
    Completed(ExecutionSummary),
    /// A plan was computed but not executed (dry run or declined).
    Planned(RebalancePlan),
    /// A gate said no; normal outcome with a reason.
    Skipped(SkipReason),
    /// Observability failure; retry next cycle.
    Aborted(Error),
}

/// One rebalancer instance.
pub struct Rebalancer {
    instance: InstanceConfig,
    gateway_config: GatewayConfig,
    guard_config: GuardConfig,
    execution: ExecutionConfig,
    lots: LotConfig,
    record: OperationRecord,
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<PnlLedger>,
    sink: Arc<dyn EventSink>,
}

impl Rebalancer {
    pub fn new(
        instance: InstanceConfig,
        config: &Config,
        gateway: Arc<dyn MarketGateway>,
        ledger: Arc<PnlLedger>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            instance,
            gateway_config: config.gateway.clone(),
            guard_config: config.guard.clone(),
            execution: config.execution.clone(),
            lots: config.lots.clone(),
            record: OperationRecord::new(),
            gateway,
            ledger,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.instance.interval_secs)
    }

    /// Run one full decision cycle to a terminal state.
    pub fn run_cycle(&mut self, approval: Approval) -> CycleOutcome {
        let now = Instant::now();
        if let Err(reason) = guard::check_cooldown(
            &self.record,
            Duration::from_secs(self.instance.cooldown_secs),
            now,
        ) {
            return self.skip(reason);
        }

        let snapshot = match valuation::value_portfolio(self.gateway.as_ref(), &self.gateway_config)
        {
            Ok(snapshot) => snapshot,
            Err(e) => return self.abort(e),
        };
        if snapshot.unobservable() {
            return self.skip(SkipReason::Unobservable);
        }

        let assessment = deviation::assess(
            &snapshot,
            &self.instance.legs,
            &self.instance,
            &self.guard_config,
        );
        let (overweight, underweight, reports) = match assessment {
            Assessment::Actionable {
                overweight,
                underweight,
                reports,
            } => (overweight, underweight, reports),
            Assessment::Blocked(reason) => return self.skip(reason),
        };

        let prices = self.collect_prices(&snapshot, underweight);
        let quote_free = snapshot.quote_free(&self.gateway_config.quote_asset);

        let outcome = planner::plan(&PlanContext {
            snapshot: &snapshot,
            legs: &self.instance.legs,
            overweight,
            underweight,
            reports: &reports,
            ledger: self.ledger.as_ref(),
            stable_free: quote_free,
            reserved_floor: self.guard_config.reserved_stable_floor,
            prices: &prices,
            instance: &self.instance,
            lots: &self.lots,
            quote_asset: &self.gateway_config.quote_asset,
        });
        let plan = match outcome {
            PlanOutcome::Plan(plan) => plan,
            PlanOutcome::Deferred(reason) => return self.skip(reason),
        };

        info!(
            "[{}] plan: {} intents, ${:.2} buy notional",
            self.name(),
            plan.intents.len(),
            plan.buy_notional
        );
        self.sink.emit(&Event::PlanComputed {
            instance: self.name().to_string(),
            buy_notional: plan.buy_notional,
            intents: plan.intents.iter().map(IntentRecord::from).collect(),
        });

        match approval {
            Approval::DryRun => return CycleOutcome::Planned(plan),
            Approval::Confirm => {
                display_plan(&plan);
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt("Execute?")
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if !confirmed {
                    info!("[{}] execution declined", self.name());
                    return CycleOutcome::Planned(plan);
                }
            }
            Approval::Auto => {}
        }

        // Last gate: floor against freshly fetched balances. Funds can move
        // between planning and execution (other instances, external buyers).
        let fresh = match self.gateway.balances() {
            Ok(balances) => balances,
            Err(e) => return self.abort(e),
        };
        let fresh_quote_free = gateway::free_of(&fresh, &self.gateway_config.quote_asset);
        if let Err(reason) = guard::check_floor(
            &plan,
            fresh_quote_free,
            self.guard_config.reserved_stable_floor,
        ) {
            return self.skip(reason);
        }

        let sequencer = Sequencer {
            gateway: self.gateway.as_ref(),
            ledger: self.ledger.as_ref(),
            sink: self.sink.as_ref(),
            execution: &self.execution,
            instance: &self.instance.name,
            stable_asset: &self.gateway_config.quote_asset,
            reserved_floor: self.guard_config.reserved_stable_floor,
        };
        let summary = sequencer.execute(&plan);

        self.record.record(Instant::now(), summary.executed_notional());
        self.sink.emit(&Event::OperationCompleted {
            instance: self.name().to_string(),
            submitted: summary.results.len(),
            executed: summary.executed(),
            failed: summary.failed(),
            skipped: summary.skipped(),
            notional: summary.executed_notional(),
        });
        info!(
            "[{}] operation complete: {} executed, {} failed, {} skipped (${:.2} moved, state {})",
            self.name(),
            summary.executed(),
            summary.failed(),
            summary.skipped(),
            summary.executed_notional(),
            summary.state,
        );

        CycleOutcome::Completed(summary)
    }

    /// Periodic loop: one cycle per interval. The stop flag is observed
    /// between cycles only; a running cycle always reaches its terminal
    /// state first.
    pub fn run_loop(&mut self, stop: &AtomicBool) {
        info!(
            "[{}] starting: every {}s, cooldown {}s, deviation >= {:.0}%",
            self.name(),
            self.instance.interval_secs,
            self.instance.cooldown_secs,
            self.instance.min_deviation_pct * 100.0,
        );
        self.sink.emit(&Event::EngineStarted {
            instance: self.name().to_string(),
            interval_secs: self.instance.interval_secs,
        });

        while !stop.load(Ordering::Relaxed) {
            match self.run_cycle(Approval::Auto) {
                CycleOutcome::Completed(_) | CycleOutcome::Planned(_) => {}
                CycleOutcome::Skipped(reason) => {
                    info!("[{}] no action: {reason}", self.name());
                }
                CycleOutcome::Aborted(e) => {
                    error!("[{}] cycle aborted: {e}; retrying next interval", self.name());
                }
            }

            let mut remaining = self.instance.interval_secs;
            while remaining > 0 && !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                remaining -= 1;
            }
        }
        info!("[{}] stopped", self.name());
    }

    /// Prices for every pair the planner may touch: marks from the
    /// snapshot, plus live lookups for buy targets not currently held.
    fn collect_prices(
        &self,
        snapshot: &valuation::PortfolioSnapshot,
        underweight: usize,
    ) -> FxHashMap<String, f64> {
        let quote = &self.gateway_config.quote_asset;
        let mut prices: FxHashMap<String, f64> = snapshot
            .holdings
            .iter()
            .filter(|h| h.class != AssetClass::Stable)
            .map(|h| (format!("{}{}", h.asset, quote), h.price))
            .collect();

        let leg = &self.instance.legs[underweight];
        let mut targets: Vec<&str> = Vec::new();
        for class in &leg.classes {
            match class {
                AssetClass::Btc => targets.push("BTC"),
                AssetClass::Eth => targets.push("ETH"),
                AssetClass::Alts => {
                    targets.extend(self.instance.alt_buy_assets.iter().map(String::as_str))
                }
                AssetClass::Stable => {}
            }
        }
        for asset in targets {
            let pair = format!("{asset}{quote}");
            if prices.contains_key(&pair) {
                continue;
            }
            match self.gateway.price(&pair) {
                Ok(price) if price > 0.0 => {
                    prices.insert(pair, price);
                }
                Ok(price) => warn!("ignoring non-positive price {price} for {pair}"),
                Err(e) => warn!("price lookup for buy target {pair} failed: {e}"),
            }
        }
        prices
    }

    fn skip(&self, reason: SkipReason) -> CycleOutcome {
        self.sink.emit(&Event::CycleSkipped {
            instance: self.name().to_string(),
            code: reason.code().to_string(),
            reason: reason.to_string(),
        });
        CycleOutcome::Skipped(reason)
    }

    fn abort(&self, e: Error) -> CycleOutcome {
        error!("[{}] observability failure: {e}", self.name());
        self.sink.emit(&Event::CycleSkipped {
            instance: self.name().to_string(),
            code: "observability_failure".to_string(),
            reason: e.to_string(),
        });
        CycleOutcome::Aborted(e)
    }
}

/// Print a plan the way an operator wants to read it before confirming.
pub fn display_plan(plan: &RebalancePlan) {
    println!("\nREBALANCE PLAN (${:.2} buy notional):", plan.buy_notional);
    println!(
        "  {:>3}  {:5} {:10} {:>14} {:>12}  {}",
        "#", "Side", "Pair", "Quantity", "Notional", "Rationale"
    );
    for (i, intent) in plan.intents.iter().enumerate() {
        println!(
            "  {:>3}  {:5} {:10} {:>14.8} {:>11.2}  {}",
            i + 1,
            format!("{}", intent.side),
            intent.pair,
            intent.quantity,
            intent.notional,
            intent.rationale,
        );
    }
}
