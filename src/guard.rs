//! Balance guard: the last gate before execution.
//!
//! Two standing checks, always re-evaluated against freshly fetched
//! balances rather than the planning snapshot: the stable-coin buffer must
//! stay at or above its reserved floor after any accepted plan, and
//! completed operations of one instance must be spaced by a cooldown.

use std::time::{Duration, Instant};

use crate::deviation::SkipReason;
use crate::planner::RebalancePlan;

/// Per-instance operation state. Explicit and owned by the instance so
/// multiple rebalancers stay isolated and tests stay deterministic.
#[derive(Debug, Clone, Default)]
pub struct OperationRecord {
    pub last_operation: Option<Instant>,
    pub operations: u64,
    pub notional_moved: f64,
}

impl OperationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an operation attempt. Counters move once per attempt, never per
    /// individual leg.
    pub fn record(&mut self, now: Instant, executed_notional: f64) {
        self.last_operation = Some(now);
        self.operations += 1;
        self.notional_moved += executed_notional;
    }
}

/// Reject the cycle while the instance cooldown has not elapsed.
pub fn check_cooldown(
    record: &OperationRecord,
    cooldown: Duration,
    now: Instant,
) -> Result<(), SkipReason> {
    let Some(last) = record.last_operation else {
        return Ok(());
    };
    let elapsed = now.saturating_duration_since(last);
    if elapsed < cooldown {
        let remaining = cooldown - elapsed;
        return Err(SkipReason::CooldownActive {
            remaining_secs: remaining.as_secs().max(1),
        });
    }
    Ok(())
}

/// Fail-closed floor check against a fresh stable free balance.
///
/// Simulates the whole plan: projected stable after execution is
/// `free + sell proceeds − buy notional`. If that lands under the floor,
/// the entire plan is rejected, with no partial acceptance.
pub fn check_floor(
    plan: &RebalancePlan,
    stable_free: f64,
    floor: f64,
) -> Result<(), SkipReason> {
    let sells = plan.sell_notional();
    let buys: f64 = plan.buys().map(|i| i.notional).sum();
    let projected = stable_free + sells - buys;
    if projected < floor - 1e-9 {
        return Err(SkipReason::FloorBreached {
            required: buys - sells,
            available: (stable_free - floor).max(0.0),
            floor,
        });
    }
    Ok(())
}
