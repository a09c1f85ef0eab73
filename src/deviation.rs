//! Deviation detection against target ratios, and the gate-outcome
//! vocabulary shared by the whole decision pipeline.

use serde::Serialize;

use crate::class::Leg;
use crate::config::{GuardConfig, InstanceConfig};
use crate::valuation::PortfolioSnapshot;

/// Why a cycle produced no trades. These are normal outcomes with reason
/// codes, never errors; every variant renders a human-readable explanation
/// carrying the numbers that drove the decision.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Portfolio value is zero or negative; nothing can be decided.
    Unobservable,
    PortfolioTooSmall {
        total: f64,
        min: f64,
    },
    /// A required leg holds nothing at all; a sell/buy split between two
    /// legs cannot be computed.
    LegAbsent {
        leg: String,
    },
    BelowThreshold {
        max_deviation_pct: f64,
        threshold: f64,
    },
    AdjustmentTooSmall {
        implied: f64,
        min: f64,
    },
    /// Both legs read overweight against their own targets (rounding
    /// artifact); wait for the next cycle.
    BothLegsOverweight,
    /// The would-be funding sell sits at a loss or has no known cost basis.
    PnlGated {
        leg: String,
        detail: String,
    },
    CooldownActive {
        remaining_secs: u64,
    },
    /// Executing the plan would push the stable buffer below its floor.
    FloorBreached {
        required: f64,
        available: f64,
        floor: f64,
    },
}

impl SkipReason {
    /// Stable identifier for structured events.
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::Unobservable => "unobservable",
            SkipReason::PortfolioTooSmall { .. } => "portfolio_too_small",
            SkipReason::LegAbsent { .. } => "leg_absent",
            SkipReason::BelowThreshold { .. } => "below_threshold",
            SkipReason::AdjustmentTooSmall { .. } => "adjustment_too_small",
            SkipReason::BothLegsOverweight => "both_legs_overweight",
            SkipReason::PnlGated { .. } => "pnl_gated",
            SkipReason::CooldownActive { .. } => "cooldown_active",
            SkipReason::FloorBreached { .. } => "floor_breached",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unobservable => {
                write!(f, "portfolio value is zero or negative; skipping cycle")
            }
            SkipReason::PortfolioTooSmall { total, min } => {
                write!(f, "portfolio too small: ${total:.2} < ${min:.2} minimum")
            }
            SkipReason::LegAbsent { leg } => write!(
                f,
                "leg '{leg}' holds nothing; rebalancing needs both legs present"
            ),
            SkipReason::BelowThreshold {
                max_deviation_pct,
                threshold,
            } => write!(
                f,
                "deviation {:.1}% below {:.1}% threshold",
                max_deviation_pct * 100.0,
                threshold * 100.0
            ),
            SkipReason::AdjustmentTooSmall { implied, min } => {
                write!(f, "implied adjustment ${implied:.2} < ${min:.2} minimum")
            }
            SkipReason::BothLegsOverweight => {
                write!(f, "both legs read overweight; waiting for next cycle")
            }
            SkipReason::PnlGated { leg, detail } => {
                write!(f, "sell of leg '{leg}' blocked by PnL gate: {detail}")
            }
            SkipReason::CooldownActive { remaining_secs } => {
                write!(f, "cooldown active: {remaining_secs}s remaining")
            }
            SkipReason::FloorBreached {
                required,
                available,
                floor,
            } => write!(
                f,
                "plan needs ${required:.2} of stable but only ${available:.2} is above the ${floor:.2} floor"
            ),
        }
    }
}

/// Per-leg deviation figures.
#[derive(Debug, Clone, Serialize)]
pub struct LegReport {
    pub leg: String,
    pub current_value: f64,
    pub target_value: f64,
    pub current_ratio: f64,
    pub target_ratio: f64,
    /// `current_value - target_value`; positive means overweight.
    pub deviation_value: f64,
    /// `|current_ratio - target_ratio| / target_ratio`.
    pub deviation_pct: f64,
}

/// Outcome of deviation detection.
#[derive(Debug, Clone)]
pub enum Assessment {
    Blocked(SkipReason),
    Actionable {
        /// Index into the instance's legs / `reports`.
        overweight: usize,
        underweight: usize,
        reports: Vec<LegReport>,
    },
}

/// Compare current leg ratios to targets and decide whether rebalancing is
/// warranted.
///
/// Ratios are computed over the instance's own tracked value (the sum of
/// its leg values); the stable buffer is funding, not a rebalanced leg.
pub fn assess(
    snapshot: &PortfolioSnapshot,
    legs: &[Leg],
    instance: &InstanceConfig,
    guard: &GuardConfig,
) -> Assessment {
    if snapshot.unobservable() {
        return Assessment::Blocked(SkipReason::Unobservable);
    }

    let leg_values: Vec<f64> = legs.iter().map(|l| snapshot.leg_value(l)).collect();
    let tracked: f64 = leg_values.iter().sum();

    if tracked < guard.min_portfolio_notional {
        return Assessment::Blocked(SkipReason::PortfolioTooSmall {
            total: tracked,
            min: guard.min_portfolio_notional,
        });
    }

    // A leg with no holdings at all blocks the operation outright: there is
    // no meaningful split to compute, and this must read differently from
    // "no deviation".
    for (leg, value) in legs.iter().zip(&leg_values) {
        if *value <= 0.0 {
            return Assessment::Blocked(SkipReason::LegAbsent {
                leg: leg.name.clone(),
            });
        }
    }

    let reports: Vec<LegReport> = legs
        .iter()
        .zip(&leg_values)
        .map(|(leg, value)| {
            let current_ratio = value / tracked;
            let target_value = tracked * leg.target;
            LegReport {
                leg: leg.name.clone(),
                current_value: *value,
                target_value,
                current_ratio,
                target_ratio: leg.target,
                deviation_value: value - target_value,
                deviation_pct: (current_ratio - leg.target).abs() / leg.target,
            }
        })
        .collect();

    let implied = reports
        .iter()
        .map(|r| r.deviation_value.abs())
        .fold(0.0_f64, f64::max);
    if implied < instance.min_trade_notional {
        return Assessment::Blocked(SkipReason::AdjustmentTooSmall {
            implied,
            min: instance.min_trade_notional,
        });
    }

    let max_deviation_pct = reports
        .iter()
        .map(|r| r.deviation_pct)
        .fold(0.0_f64, f64::max);
    if max_deviation_pct < instance.min_deviation_pct {
        return Assessment::Blocked(SkipReason::BelowThreshold {
            max_deviation_pct,
            threshold: instance.min_deviation_pct,
        });
    }

    // Two legs and targets summing to one make deviations symmetric; treat
    // anything else as a rounding artifact and stand down.
    let mut overweight = 0;
    let mut underweight = 0;
    for (i, report) in reports.iter().enumerate() {
        if report.deviation_value > reports[overweight].deviation_value {
            overweight = i;
        }
        if report.deviation_value < reports[underweight].deviation_value {
            underweight = i;
        }
    }

    if overweight == underweight
        || reports[overweight].deviation_value <= 0.0
        || reports[underweight].deviation_value >= 0.0
    {
        return Assessment::Blocked(SkipReason::BothLegsOverweight);
    }

    Assessment::Actionable {
        overweight,
        underweight,
        reports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::paper::PaperGateway;
    use crate::valuation::value_portfolio;

    fn test_config() -> Config {
        let toml_str = r#"
[[instance]]
name = "alts-btceth"
min_deviation_pct = 0.10
min_trade_notional = 5.0

[[instance.legs]]
name = "alts"
classes = ["alts"]
target = 0.5

[[instance.legs]]
name = "btceth"
classes = ["btc", "eth"]
target = 0.5
"#;
        let mut config: Config = toml::from_str(toml_str).unwrap();
        config.instances[0].alt_buy_assets = vec!["ADA".into()];
        config.validate().unwrap();
        config
    }

    fn snapshot(alts_value: f64, btc_value: f64, eth_value: f64) -> PortfolioSnapshot {
        let ada_qty = alts_value / 0.5;
        let gateway = PaperGateway::builder()
            .with_balance("ADA", ada_qty, 0.0)
            .with_balance("BTC", btc_value / 50_000.0, 0.0)
            .with_balance("ETH", eth_value / 2_000.0, 0.0)
            .with_price("ADAUSDT", 0.50)
            .with_price("BTCUSDC", 50_000.0)
            .with_price("ETHUSDC", 2_000.0)
            .with_price("USDCUSDT", 1.0)
            .build();
        value_portfolio(&gateway, &Default::default()).unwrap()
    }

    #[test]
    fn overweight_alts_is_actionable() {
        let config = test_config();
        let instance = &config.instances[0];
        // $600 alts vs $400 btc/eth, target 50/50 → 20% deviation
        let snap = snapshot(600.0, 240.0, 160.0);
        match assess(&snap, &instance.legs, instance, &config.guard) {
            Assessment::Actionable {
                overweight,
                underweight,
                reports,
            } => {
                assert_eq!(reports[overweight].leg, "alts");
                assert_eq!(reports[underweight].leg, "btceth");
                assert!((reports[overweight].deviation_pct - 0.2).abs() < 1e-9);
                assert!((reports[underweight].deviation_value - (-100.0)).abs() < 1e-9);
            }
            Assessment::Blocked(r) => panic!("expected actionable, got {r}"),
        }
    }

    #[test]
    fn balanced_portfolio_blocks_below_threshold() {
        let config = test_config();
        let instance = &config.instances[0];
        // $10 of drift: over the adjustment minimum, far under the threshold
        let snap = snapshot(510.0, 290.0, 200.0);
        match assess(&snap, &instance.legs, instance, &config.guard) {
            Assessment::Blocked(SkipReason::BelowThreshold { .. }) => {}
            other => panic!("expected below-threshold block, got {other:?}"),
        }
    }

    #[test]
    fn absent_leg_blocks_regardless_of_deviation() {
        let config = test_config();
        let instance = &config.instances[0];
        let snap = snapshot(1_000.0, 0.0, 0.0);
        match assess(&snap, &instance.legs, instance, &config.guard) {
            Assessment::Blocked(SkipReason::LegAbsent { leg }) => assert_eq!(leg, "btceth"),
            other => panic!("expected leg-absent block, got {other:?}"),
        }
    }

    #[test]
    fn tiny_portfolio_blocks() {
        let config = test_config();
        let instance = &config.instances[0];
        let snap = snapshot(4.0, 2.0, 2.0);
        match assess(&snap, &instance.legs, instance, &config.guard) {
            Assessment::Blocked(SkipReason::PortfolioTooSmall { .. }) => {}
            other => panic!("expected too-small block, got {other:?}"),
        }
    }

    #[test]
    fn small_adjustment_blocks_even_over_threshold() {
        let mut config = test_config();
        config.guard.min_portfolio_notional = 1.0;
        let instance = &config.instances[0];
        // $12 vs $8: deviation 20% but implied adjustment only $2
        let snap = snapshot(12.0, 5.0, 3.0);
        match assess(&snap, &instance.legs, instance, &config.guard) {
            Assessment::Blocked(SkipReason::AdjustmentTooSmall { implied, .. }) => {
                assert!((implied - 2.0).abs() < 1e-9)
            }
            other => panic!("expected adjustment-too-small block, got {other:?}"),
        }
    }

    #[test]
    fn skip_reason_codes_are_stable() {
        assert_eq!(SkipReason::Unobservable.code(), "unobservable");
        assert_eq!(
            SkipReason::CooldownActive { remaining_secs: 5 }.code(),
            "cooldown_active"
        );
    }

    #[test]
    fn reasons_render_their_numbers() {
        let reason = SkipReason::BelowThreshold {
            max_deviation_pct: 0.034,
            threshold: 0.10,
        };
        let text = format!("{reason}");
        assert!(text.contains("3.4%"));
        assert!(text.contains("10.0%"));
    }
}
