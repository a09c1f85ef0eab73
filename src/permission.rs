//! Permission broker: lets independent buying agents ask whether spending
//! stable-coin on an asset class is currently allowed.
//!
//! Every query recomputes the portfolio snapshot synchronously, so the
//! answer reflects live balances. The broker only reads; it can race with
//! an in-flight rebalance, which the caller accepts by design.

use std::sync::Arc;

use serde::Serialize;

use crate::class::{AssetClass, Leg};
use crate::config::{GatewayConfig, InstanceConfig};
use crate::events::{Event, EventSink};
use crate::gateway::MarketGateway;
use crate::valuation;

/// The answer to one permission query. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: String,
    pub ratios: Vec<LegRatio>,
}

/// A leg's current vs target ratio at decision time.
#[derive(Debug, Clone, Serialize)]
pub struct LegRatio {
    pub leg: String,
    pub current: f64,
    pub target: f64,
}

impl std::fmt::Display for PermissionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{}: {}",
            if self.allowed { "ALLOWED" } else { "BLOCKED" },
            self.reason
        )?;
        for ratio in &self.ratios {
            writeln!(
                f,
                "  {:10} {:>5.1}% (target {:>5.1}%)",
                ratio.leg,
                ratio.current * 100.0,
                ratio.target * 100.0,
            )?;
        }
        Ok(())
    }
}

/// Read-only query interface over one rebalancer instance's targets.
pub struct PermissionBroker {
    gateway: Arc<dyn MarketGateway>,
    sink: Arc<dyn EventSink>,
    gateway_config: GatewayConfig,
    legs: Vec<Leg>,
    min_deviation_pct: f64,
}

impl PermissionBroker {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        sink: Arc<dyn EventSink>,
        gateway_config: GatewayConfig,
        instance: &InstanceConfig,
    ) -> Self {
        Self {
            gateway,
            sink,
            gateway_config,
            legs: instance.legs.clone(),
            min_deviation_pct: instance.min_deviation_pct,
        }
    }

    /// Decide whether a purchase of `amount` into `class` is allowed now.
    ///
    /// Denied when the portfolio cannot be observed or when the class's leg
    /// already sits at or above its target, where buying more would deepen an
    /// existing overweight.
    pub fn request(&self, amount: f64, class: AssetClass) -> PermissionDecision {
        let decision = self.decide(amount, class);
        self.sink.emit(&Event::PermissionDecided {
            class: class.to_string(),
            amount,
            allowed: decision.allowed,
            reason: decision.reason.clone(),
        });
        decision
    }

    fn decide(&self, _amount: f64, class: AssetClass) -> PermissionDecision {
        let snapshot = match valuation::value_portfolio(self.gateway.as_ref(), &self.gateway_config)
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return PermissionDecision {
                    allowed: false,
                    reason: format!("portfolio unobservable: {e}"),
                    ratios: Vec::new(),
                };
            }
        };

        let leg_values: Vec<f64> = self.legs.iter().map(|l| snapshot.leg_value(l)).collect();
        let tracked: f64 = leg_values.iter().sum();
        if tracked <= 0.0 {
            return PermissionDecision {
                allowed: false,
                reason: "portfolio is empty or unobservable".into(),
                ratios: Vec::new(),
            };
        }

        let ratios: Vec<LegRatio> = self
            .legs
            .iter()
            .zip(&leg_values)
            .map(|(leg, value)| LegRatio {
                leg: leg.name.clone(),
                current: value / tracked,
                target: leg.target,
            })
            .collect();

        let Some(queried) = self
            .legs
            .iter()
            .position(|l| l.contains(class))
        else {
            // Classes this instance does not track are none of its business
            return PermissionDecision {
                allowed: true,
                reason: format!("class {class} is not governed by this rebalancer"),
                ratios,
            };
        };

        let all_within_threshold = ratios.iter().all(|r| {
            (r.current - r.target).abs() / r.target < self.min_deviation_pct
        });
        if all_within_threshold {
            return PermissionDecision {
                allowed: true,
                reason: format!(
                    "ratios balanced ({})",
                    summarize(&ratios)
                ),
                ratios,
            };
        }

        let queried_ratio = &ratios[queried];
        if queried_ratio.current >= queried_ratio.target {
            return PermissionDecision {
                allowed: false,
                reason: format!(
                    "{} already {:.1}% >= {:.1}% target; buying more would deepen the overweight",
                    queried_ratio.leg,
                    queried_ratio.current * 100.0,
                    queried_ratio.target * 100.0,
                ),
                ratios,
            };
        }

        PermissionDecision {
            allowed: true,
            reason: format!(
                "{} underweight at {:.1}% of {:.1}% target ({})",
                queried_ratio.leg,
                queried_ratio.current * 100.0,
                queried_ratio.target * 100.0,
                summarize(&ratios),
            ),
            ratios,
        }
    }
}

fn summarize(ratios: &[LegRatio]) -> String {
    ratios
        .iter()
        .map(|r| format!("{} {:.1}%", r.leg, r.current * 100.0))
        .collect::<Vec<_>>()
        .join(", ")
}
