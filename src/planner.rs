//! Trade planning: turn a detected deviation into an ordered list of
//! sell-then-buy intents, gated by PnL and funded stable-coin-first.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::class::{AssetClass, Leg};
use crate::config::{InstanceConfig, LotConfig};
use crate::deviation::{LegReport, SkipReason};
use crate::gateway::Side;
use crate::ledger::{CostBasis, PnlLedger};
use crate::valuation::PortfolioSnapshot;

/// Where the money for a buy comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Funding {
    Stable,
    AssetSale,
}

impl std::fmt::Display for Funding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Funding::Stable => write!(f, "STABLE"),
            Funding::AssetSale => write!(f, "ASSET_SALE"),
        }
    }
}

/// A single planned trade, consumed by the execution sequencer.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub side: Side,
    pub pair: String,
    pub asset: String,
    pub quantity: f64,
    /// Estimated notional in quote units at planning-time prices.
    pub notional: f64,
    pub funding: Option<Funding>,
    pub rationale: String,
}

/// An ordered set of trade intents computed from one portfolio snapshot.
/// Valid only against that snapshot; executors re-validate balances
/// immediately before acting on it.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub intents: Vec<TradeIntent>,
    pub snapshot_ts: DateTime<Utc>,
    /// Total buy-side notional the plan aims to move.
    pub buy_notional: f64,
}

impl RebalancePlan {
    pub fn sells(&self) -> impl Iterator<Item = &TradeIntent> {
        self.intents.iter().filter(|i| i.side == Side::Sell)
    }

    pub fn buys(&self) -> impl Iterator<Item = &TradeIntent> {
        self.intents.iter().filter(|i| i.side == Side::Buy)
    }

    pub fn sell_notional(&self) -> f64 {
        self.sells().map(|i| i.notional).sum()
    }
}

/// Result of a planning pass. `Deferred` is a valid terminal state for the
/// cycle, not an error.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    Plan(RebalancePlan),
    Deferred(SkipReason),
}

/// Everything the planner reads. Prices are keyed by trading pair in the
/// primary quote (planning and execution both run on primary-quote pairs,
/// whatever pair the valuation sourced its marks from).
pub struct PlanContext<'a> {
    pub snapshot: &'a PortfolioSnapshot,
    pub legs: &'a [Leg],
    pub overweight: usize,
    pub underweight: usize,
    pub reports: &'a [LegReport],
    pub ledger: &'a PnlLedger,
    /// Free stable value in quote units, from the planning snapshot.
    pub stable_free: f64,
    pub reserved_floor: f64,
    pub prices: &'a FxHashMap<String, f64>,
    pub instance: &'a InstanceConfig,
    pub lots: &'a LotConfig,
    pub quote_asset: &'a str,
}

/// Floor a quantity to the asset's minimum tradable lot.
pub fn floor_to_lot(quantity: f64, lot: f64) -> f64 {
    if lot <= 0.0 {
        return quantity;
    }
    (quantity / lot).floor() * lot
}

fn pair_for(asset: &str, quote: &str) -> String {
    format!("{asset}{quote}")
}

/// Compute the rebalance plan for one detected deviation.
///
/// The buy notional is the deviation-capped operation size; funding comes
/// from stable-coin above the reserved floor first, then from selling the
/// overweight leg's PnL-positive holdings sized to the remaining shortfall.
/// A shortfall that cannot be covered defers the whole operation: no
/// partial trades against a losing position, ever.
pub fn plan(ctx: &PlanContext) -> PlanOutcome {
    let over = &ctx.reports[ctx.overweight];
    let under = &ctx.reports[ctx.underweight];
    let over_leg = &ctx.legs[ctx.overweight];
    let under_leg = &ctx.legs[ctx.underweight];

    let desired = (under.deviation_value.abs() * ctx.instance.deviation_spend_fraction)
        .min(ctx.instance.max_operation_notional);

    if desired < ctx.instance.min_trade_notional {
        return PlanOutcome::Deferred(SkipReason::AdjustmentTooSmall {
            implied: desired,
            min: ctx.instance.min_trade_notional,
        });
    }

    let stable_available = (ctx.stable_free - ctx.reserved_floor).max(0.0);
    let stable_contrib = stable_available.min(desired);
    let shortfall = desired - stable_contrib;

    let mut intents = Vec::new();
    let mut sell_total = 0.0;

    if shortfall > 1e-9 {
        match plan_funding_sells(ctx, over_leg, over, shortfall, &mut intents) {
            Ok(total) => sell_total = total,
            Err(reason) => return PlanOutcome::Deferred(reason),
        }
    }

    let funded = stable_contrib + sell_total;
    let funding_tag = if sell_total > 0.0 {
        Funding::AssetSale
    } else {
        Funding::Stable
    };

    let buys = plan_buys(ctx, under_leg, under, over, funded, funding_tag);
    if buys.is_empty() {
        // Selling without the buy leg would just raise stable; stand down.
        return PlanOutcome::Deferred(SkipReason::AdjustmentTooSmall {
            implied: funded,
            min: ctx.instance.min_trade_notional,
        });
    }

    intents.extend(buys);
    // Contract: every SELL precedes every BUY, computation order preserved
    // within each group. plan_funding_sells ran first, so the order holds;
    // assert the shape anyway in debug builds.
    debug_assert!(is_sells_before_buys(&intents));

    PlanOutcome::Plan(RebalancePlan {
        buy_notional: funded,
        snapshot_ts: ctx.snapshot.ts,
        intents,
    })
}

/// Generate SELL intents against the overweight leg covering `shortfall`.
///
/// Candidates are the leg's holdings ordered by unrealized PnL, best first;
/// only non-negative PnL positions qualify. Returns the planned proceeds or
/// the gate reason when nothing can be sold.
fn plan_funding_sells(
    ctx: &PlanContext,
    over_leg: &Leg,
    over: &LegReport,
    shortfall: f64,
    intents: &mut Vec<TradeIntent>,
) -> Result<f64, SkipReason> {
    let mut candidates: Vec<(&crate::valuation::Holding, CostBasis)> = ctx
        .snapshot
        .holdings
        .iter()
        .filter(|h| over_leg.contains(h.class) && h.free > 0.0)
        .map(|h| {
            let basis = ctx
                .ledger
                .cost_basis(&h.asset, h.total_quantity(), h.price);
            (h, basis)
        })
        .collect();
    candidates.sort_by(|a, b| {
        let ua = a.1.unrealized().unwrap_or(f64::NEG_INFINITY);
        let ub = b.1.unrealized().unwrap_or(f64::NEG_INFINITY);
        ub.partial_cmp(&ua).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut remaining = shortfall;
    let mut blocked: Vec<String> = Vec::new();

    for (holding, basis) in &candidates {
        if remaining <= 1e-9 {
            break;
        }
        if !basis.is_sellable() {
            blocked.push(match basis {
                CostBasis::Known { unrealized, .. } => {
                    format!("{} at a loss (${unrealized:.2})", holding.asset)
                }
                CostBasis::Unknown => format!("{} has no known cost basis", holding.asset),
            });
            continue;
        }
        let lot = ctx.lots.lot_for(&holding.asset);
        let sell_value = remaining.min(holding.free * holding.price);
        let quantity = floor_to_lot(sell_value / holding.price, lot);
        let notional = quantity * holding.price;
        if quantity <= 0.0 || notional < ctx.instance.min_trade_notional {
            continue;
        }
        let unrealized = basis.unrealized().unwrap_or(0.0);
        intents.push(TradeIntent {
            side: Side::Sell,
            pair: pair_for(&holding.asset, ctx.quote_asset),
            asset: holding.asset.clone(),
            quantity,
            notional,
            funding: None,
            rationale: format!(
                "{} {:.1}% > target {:.1}%; selling ${:.2} of {} (PnL ${:+.2}) to fund the buy",
                over.leg,
                over.current_ratio * 100.0,
                over.target_ratio * 100.0,
                notional,
                holding.asset,
                unrealized,
            ),
        });
        remaining -= notional;
    }

    let planned: f64 = intents.iter().map(|i| i.notional).sum();
    if planned <= 0.0 {
        let detail = if blocked.is_empty() {
            "nothing sellable above the minimum trade size".to_string()
        } else {
            blocked.join("; ")
        };
        return Err(SkipReason::PnlGated {
            leg: over.leg.clone(),
            detail,
        });
    }
    Ok(planned)
}

/// Generate BUY intents for the underweight leg from the funded notional.
fn plan_buys(
    ctx: &PlanContext,
    under_leg: &Leg,
    under: &LegReport,
    over: &LegReport,
    funded: f64,
    funding: Funding,
) -> Vec<TradeIntent> {
    let mut buys = Vec::new();

    for class in &under_leg.classes {
        let class_notional = funded * under_leg.split_for(*class);
        if class_notional <= 0.0 {
            continue;
        }
        let targets: Vec<&str> = match class {
            AssetClass::Btc => vec!["BTC"],
            AssetClass::Eth => vec!["ETH"],
            AssetClass::Alts => ctx
                .instance
                .alt_buy_assets
                .iter()
                .map(String::as_str)
                .collect(),
            AssetClass::Stable => continue,
        };
        if targets.is_empty() {
            continue;
        }

        let mut per_asset = class_notional / targets.len() as f64;
        let mut targets = targets;
        if per_asset < ctx.instance.min_trade_notional && targets.len() > 1 {
            // Too thin to spread: put the whole class allocation into the
            // first asset instead of dropping the buy.
            targets.truncate(1);
            per_asset = class_notional;
        }

        for asset in targets {
            let pair = pair_for(asset, ctx.quote_asset);
            let Some(&price) = ctx.prices.get(&pair) else {
                log::warn!("no price for buy target {pair}; dropping that buy");
                continue;
            };
            if price <= 0.0 {
                continue;
            }
            let quantity = floor_to_lot(per_asset / price, ctx.lots.lot_for(asset));
            let notional = quantity * price;
            if quantity <= 0.0 || notional < ctx.instance.min_trade_notional {
                continue;
            }
            buys.push(TradeIntent {
                side: Side::Buy,
                pair,
                asset: asset.to_string(),
                quantity,
                notional,
                funding: Some(funding),
                rationale: format!(
                    "{} {:.1}% < target {:.1}% ({} {:.1}% over); buying ${:.2} of {asset}",
                    under.leg,
                    under.current_ratio * 100.0,
                    under.target_ratio * 100.0,
                    over.leg,
                    over.current_ratio * 100.0,
                    notional,
                ),
            });
        }
    }

    buys
}

fn is_sells_before_buys(intents: &[TradeIntent]) -> bool {
    let first_buy = intents.iter().position(|i| i.side == Side::Buy);
    let last_sell = intents.iter().rposition(|i| i.side == Side::Sell);
    match (first_buy, last_sell) {
        (Some(b), Some(s)) => s < b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::deviation::{self, Assessment};
    use crate::paper::PaperGateway;
    use crate::valuation::value_portfolio;

    fn test_config() -> Config {
        let toml_str = r#"
[guard]
reserved_stable_floor = 20.0
min_portfolio_notional = 10.0

[lots]
default_lot = 0.000001
[lots.sizes]
BTC = 0.0001
ETH = 0.001

[[instance]]
name = "btc-eth"
min_deviation_pct = 0.05
min_trade_notional = 5.0
max_operation_notional = 100.0
deviation_spend_fraction = 1.0

[[instance.legs]]
name = "btc"
classes = ["btc"]
target = 0.6

[[instance.legs]]
name = "eth"
classes = ["eth"]
target = 0.4
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        config
    }

    struct Fixture {
        config: Config,
        snapshot: crate::valuation::PortfolioSnapshot,
        ledger: PnlLedger,
        prices: FxHashMap<String, f64>,
    }

    /// BTC overweight vs ETH at 60/40 targets: BTC $700, ETH $300 of a
    /// $1000 tracked portfolio → ETH is $100 underweight.
    fn fixture(usdc_free: f64) -> Fixture {
        let gateway = PaperGateway::builder()
            .with_balance("USDC", usdc_free, 0.0)
            .with_balance("BTC", 0.014, 0.0)
            .with_balance("ETH", 0.15, 0.0)
            .with_price("BTCUSDC", 50_000.0)
            .with_price("ETHUSDC", 2_000.0)
            .with_price("USDCUSDT", 1.0)
            .build();
        let snapshot = value_portfolio(&gateway, &Default::default()).unwrap();
        let mut prices = FxHashMap::default();
        prices.insert("BTCUSDC".to_string(), 50_000.0);
        prices.insert("ETHUSDC".to_string(), 2_000.0);
        Fixture {
            config: test_config(),
            snapshot,
            ledger: PnlLedger::new(),
            prices,
        }
    }

    fn plan_for(fx: &Fixture) -> PlanOutcome {
        let instance = &fx.config.instances[0];
        let assessment = deviation::assess(
            &fx.snapshot,
            &instance.legs,
            instance,
            &fx.config.guard,
        );
        let (overweight, underweight, reports) = match assessment {
            Assessment::Actionable {
                overweight,
                underweight,
                reports,
            } => (overweight, underweight, reports),
            Assessment::Blocked(reason) => panic!("fixture should be actionable: {reason}"),
        };
        plan(&PlanContext {
            snapshot: &fx.snapshot,
            legs: &instance.legs,
            overweight,
            underweight,
            reports: &reports,
            ledger: &fx.ledger,
            stable_free: fx.snapshot.stable_free_value(),
            reserved_floor: fx.config.guard.reserved_stable_floor,
            prices: &fx.prices,
            instance,
            lots: &fx.config.lots,
            quote_asset: "USDC",
        })
    }

    #[test]
    fn stable_funding_covers_whole_buy() {
        // $120 free stable, $20 floor → $100 available ≥ $100 deviation
        let fx = fixture(120.0);
        match plan_for(&fx) {
            PlanOutcome::Plan(plan) => {
                assert_eq!(plan.sells().count(), 0);
                let buys: Vec<_> = plan.buys().collect();
                assert_eq!(buys.len(), 1);
                assert_eq!(buys[0].asset, "ETH");
                assert_eq!(buys[0].funding, Some(Funding::Stable));
                assert!((buys[0].notional - 100.0).abs() < 2.0 + 1e-9); // lot flooring
            }
            PlanOutcome::Deferred(r) => panic!("expected plan, got {r}"),
        }
    }

    #[test]
    fn shortfall_sells_profitable_overweight() {
        // $25 free stable → $5 available; shortfall $95 sold out of BTC
        let mut fx = fixture(25.0);
        fx.ledger.record_buy("BTC", 0.014, 40_000.0); // bought cheaper: in profit
        match plan_for(&fx) {
            PlanOutcome::Plan(plan) => {
                let sells: Vec<_> = plan.sells().collect();
                assert_eq!(sells.len(), 1);
                assert_eq!(sells[0].asset, "BTC");
                // 95 / 50_000 floored to 0.0001 lot → 0.0019 BTC = $95
                assert!((sells[0].notional - 95.0).abs() < 5.0 + 1e-9);
                let buys: Vec<_> = plan.buys().collect();
                assert_eq!(buys.len(), 1);
                assert_eq!(buys[0].funding, Some(Funding::AssetSale));
            }
            PlanOutcome::Deferred(r) => panic!("expected plan, got {r}"),
        }
    }

    #[test]
    fn losing_overweight_defers_everything() {
        let mut fx = fixture(25.0);
        fx.ledger.record_buy("BTC", 0.014, 60_000.0); // bought higher: at a loss
        match plan_for(&fx) {
            PlanOutcome::Deferred(SkipReason::PnlGated { leg, .. }) => assert_eq!(leg, "btc"),
            other => panic!("expected PnL gate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_cost_basis_defers_everything() {
        // No ledger entries at all: held BTC has no cost basis
        let fx = fixture(25.0);
        match plan_for(&fx) {
            PlanOutcome::Deferred(SkipReason::PnlGated { detail, .. }) => {
                assert!(detail.contains("no known cost basis"))
            }
            other => panic!("expected PnL gate, got {other:?}"),
        }
    }

    #[test]
    fn sells_always_precede_buys() {
        let mut fx = fixture(25.0);
        fx.ledger.record_buy("BTC", 0.014, 40_000.0);
        if let PlanOutcome::Plan(plan) = plan_for(&fx) {
            assert!(is_sells_before_buys(&plan.intents));
            assert_eq!(plan.intents[0].side, Side::Sell);
            assert_eq!(plan.intents.last().unwrap().side, Side::Buy);
        } else {
            panic!("expected plan");
        }
    }

    #[test]
    fn quantities_are_floored_to_lots() {
        let fx = fixture(120.0);
        if let PlanOutcome::Plan(plan) = plan_for(&fx) {
            for intent in &plan.intents {
                let lot = fx.config.lots.lot_for(&intent.asset);
                let lots = intent.quantity / lot;
                assert!(
                    (lots - lots.round()).abs() < 1e-6,
                    "{} quantity {} is not a lot multiple of {}",
                    intent.asset,
                    intent.quantity,
                    lot
                );
            }
        } else {
            panic!("expected plan");
        }
    }

    #[test]
    fn floor_to_lot_rounds_down() {
        assert!((floor_to_lot(0.00519, 0.0001) - 0.0051).abs() < 1e-12);
        assert!((floor_to_lot(123.456, 0.01) - 123.45).abs() < 1e-9);
        assert_eq!(floor_to_lot(5.0, 0.0), 5.0);
    }

    #[test]
    fn multi_class_leg_splits_buys() {
        let toml_str = r#"
[lots.sizes]
BTC = 0.0001
ETH = 0.001

[[instance]]
name = "alts-btceth"
min_deviation_pct = 0.10
min_trade_notional = 5.0
max_operation_notional = 100.0
deviation_spend_fraction = 0.5
alt_buy_assets = ["ADA"]

[[instance.legs]]
name = "alts"
classes = ["alts"]
target = 0.5

[[instance.legs]]
name = "btceth"
classes = ["btc", "eth"]
target = 0.5
[instance.legs.buy_split]
btc = 0.6
eth = 0.4
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        let instance = &config.instances[0];

        // Alts $600, BTC $240, ETH $160 → btceth $100 under target; spend
        // fraction 0.5 caps the buy at $50.
        let gateway = PaperGateway::builder()
            .with_balance("USDC", 200.0, 0.0)
            .with_balance("ADA", 1_200.0, 0.0)
            .with_balance("BTC", 0.0048, 0.0)
            .with_balance("ETH", 0.08, 0.0)
            .with_price("ADAUSDT", 0.50)
            .with_price("BTCUSDC", 50_000.0)
            .with_price("ETHUSDC", 2_000.0)
            .with_price("USDCUSDT", 1.0)
            .build();
        let snapshot = value_portfolio(&gateway, &Default::default()).unwrap();

        let Assessment::Actionable {
            overweight,
            underweight,
            reports,
        } = deviation::assess(&snapshot, &instance.legs, instance, &Default::default())
        else {
            panic!("expected actionable");
        };

        let mut prices = FxHashMap::default();
        prices.insert("BTCUSDC".to_string(), 50_000.0);
        prices.insert("ETHUSDC".to_string(), 2_000.0);
        let ledger = PnlLedger::new();

        let outcome = plan(&PlanContext {
            snapshot: &snapshot,
            legs: &instance.legs,
            overweight,
            underweight,
            reports: &reports,
            ledger: &ledger,
            stable_free: snapshot.stable_free_value(),
            reserved_floor: 20.0,
            prices: &prices,
            instance,
            lots: &config.lots,
            quote_asset: "USDC",
        });

        let plan = match outcome {
            PlanOutcome::Plan(plan) => plan,
            PlanOutcome::Deferred(reason) => panic!("expected plan, got deferral: {reason}"),
        };
        let buys: Vec<_> = plan.buys().collect();
        assert_eq!(buys.len(), 2);
        let btc = buys.iter().find(|b| b.asset == "BTC").unwrap();
        let eth = buys.iter().find(|b| b.asset == "ETH").unwrap();
        // $50 split 60/40, modulo lot flooring
        assert!((btc.notional - 30.0).abs() < 5.0 + 1e-9);
        assert!((eth.notional - 20.0).abs() < 2.0 + 1e-9);
    }
}
