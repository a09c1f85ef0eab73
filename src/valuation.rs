//! Portfolio valuation: raw balances + prices → a classed snapshot.

use chrono::{DateTime, Utc};
use log::warn;
use rustc_hash::FxHashMap;

use crate::class::{self, AssetClass, Leg};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::gateway::MarketGateway;

/// One held asset, valued in the primary quote currency.
#[derive(Debug, Clone)]
pub struct Holding {
    pub asset: String,
    pub class: AssetClass,
    pub free: f64,
    pub locked: f64,
    /// Unit price in the primary quote (conversion already folded in).
    pub price: f64,
    pub value: f64,
}

impl Holding {
    pub fn total_quantity(&self) -> f64 {
        self.free + self.locked
    }
}

/// Immutable view of the portfolio at one instant. Created fresh on every
/// decision cycle, never mutated, discarded after use.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub ts: DateTime<Utc>,
    pub holdings: Vec<Holding>,
    /// Assets whose price lookup failed; they contribute no value.
    pub degraded: Vec<String>,
    /// Set when the alt-quote conversion rate fell back to unity.
    pub conversion_flagged: bool,
    class_values: FxHashMap<AssetClass, f64>,
    /// Sum of all classed values, stable buffer included.
    pub total: f64,
}

impl PortfolioSnapshot {
    pub fn class_value(&self, class: AssetClass) -> f64 {
        self.class_values.get(&class).copied().unwrap_or(0.0)
    }

    /// Combined value of a leg's classes.
    pub fn leg_value(&self, leg: &Leg) -> f64 {
        leg.classes.iter().map(|c| self.class_value(*c)).sum()
    }

    /// Free balance of the primary quote asset itself: the pot buys are
    /// actually funded from.
    pub fn quote_free(&self, quote_asset: &str) -> f64 {
        self.holdings
            .iter()
            .find(|h| h.asset == quote_asset)
            .map(|h| h.free)
            .unwrap_or(0.0)
    }

    /// Free (tradable) stable-coin value in quote units.
    pub fn stable_free_value(&self) -> f64 {
        self.holdings
            .iter()
            .filter(|h| h.class == AssetClass::Stable)
            .map(|h| h.free * h.price)
            .sum()
    }

    /// True when the portfolio cannot be meaningfully observed; callers
    /// must abort the cycle without side effects.
    pub fn unobservable(&self) -> bool {
        self.total <= 0.0
    }
}

/// Fetch the alt-quote → primary-quote conversion rate, defaulting to unity
/// on failure (flagged in the snapshot).
fn conversion_rate(gateway: &dyn MarketGateway, config: &GatewayConfig) -> (f64, bool) {
    match gateway.price(&config.conversion_pair) {
        Ok(rate) if rate > 0.0 => (rate, false),
        Ok(rate) => {
            warn!(
                "conversion pair {} returned non-positive rate {rate}; using 1.0",
                config.conversion_pair
            );
            (1.0, true)
        }
        Err(e) => {
            warn!(
                "conversion pair {} lookup failed ({e}); using 1.0",
                config.conversion_pair
            );
            (1.0, true)
        }
    }
}

/// Value the whole account into a classed snapshot.
///
/// BTC/ETH and stable assets are priced directly in the primary quote; the
/// alt basket is priced in the alt quote and folded in multiplicatively via
/// the conversion pair. An asset whose price lookup fails is excluded from
/// the classed values and surfaced in `degraded`.
pub fn value_portfolio(
    gateway: &dyn MarketGateway,
    config: &GatewayConfig,
) -> Result<PortfolioSnapshot> {
    let balances = gateway.balances()?;
    let (rate, conversion_flagged) = conversion_rate(gateway, config);

    let mut holdings = Vec::new();
    let mut degraded = Vec::new();
    let mut class_values: FxHashMap<AssetClass, f64> = FxHashMap::default();

    for balance in &balances {
        let quantity = balance.total();
        if quantity <= 0.0 {
            continue;
        }
        let class = class::classify(&balance.asset, &config.stable_assets);
        let price = if balance.asset == config.quote_asset {
            Some(1.0)
        } else {
            match class {
                // Non-primary stables carry the inverse conversion rate
                AssetClass::Stable => Some(1.0 / rate),
                AssetClass::Btc | AssetClass::Eth => {
                    let pair = format!("{}{}", balance.asset, config.quote_asset);
                    match gateway.price(&pair) {
                        Ok(p) if p > 0.0 => Some(p),
                        Ok(_) | Err(_) => None,
                    }
                }
                AssetClass::Alts => {
                    let pair = format!("{}{}", balance.asset, config.alt_quote_asset);
                    match gateway.price(&pair) {
                        Ok(p) if p > 0.0 => Some(p / rate),
                        Ok(_) | Err(_) => None,
                    }
                }
            }
        };

        match price {
            Some(price) => {
                let value = quantity * price;
                *class_values.entry(class).or_insert(0.0) += value;
                holdings.push(Holding {
                    asset: balance.asset.clone(),
                    class,
                    free: balance.free,
                    locked: balance.locked,
                    price,
                    value,
                });
            }
            None => {
                warn!("no usable price for held asset {}; degraded", balance.asset);
                degraded.push(balance.asset.clone());
            }
        }
    }

    let total = class_values.values().sum();

    Ok(PortfolioSnapshot {
        ts: Utc::now(),
        holdings,
        degraded,
        conversion_flagged,
        class_values,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::AssetClass;
    use crate::paper::PaperGateway;

    fn config() -> GatewayConfig {
        GatewayConfig::default()
    }

    fn gateway() -> PaperGateway {
        PaperGateway::builder()
            .with_balance("USDC", 100.0, 0.0)
            .with_balance("USDT", 50.0, 0.0)
            .with_balance("BTC", 0.01, 0.0)
            .with_balance("ETH", 0.5, 0.5)
            .with_balance("ADA", 1000.0, 0.0)
            .with_price("BTCUSDC", 50_000.0)
            .with_price("ETHUSDC", 2_000.0)
            .with_price("ADAUSDT", 0.50)
            .with_price("USDCUSDT", 1.0)
            .build()
    }

    #[test]
    fn classed_values() {
        let snapshot = value_portfolio(&gateway(), &config()).unwrap();
        assert!((snapshot.class_value(AssetClass::Btc) - 500.0).abs() < 1e-9);
        assert!((snapshot.class_value(AssetClass::Eth) - 2_000.0).abs() < 1e-9);
        assert!((snapshot.class_value(AssetClass::Alts) - 500.0).abs() < 1e-9);
        assert!((snapshot.class_value(AssetClass::Stable) - 150.0).abs() < 1e-9);
        assert!((snapshot.total - 3_150.0).abs() < 1e-9);
        assert!(!snapshot.conversion_flagged);
        assert!(snapshot.degraded.is_empty());
        assert!(!snapshot.unobservable());
    }

    #[test]
    fn locked_quantities_count_toward_value_not_free() {
        let snapshot = value_portfolio(&gateway(), &config()).unwrap();
        let eth = snapshot
            .holdings
            .iter()
            .find(|h| h.asset == "ETH")
            .unwrap();
        assert_eq!(eth.total_quantity(), 1.0);
        // stable free value excludes nothing here, but ETH locked half is
        // still valued
        assert!((eth.value - 2_000.0).abs() < 1e-9);
        assert!((snapshot.stable_free_value() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn failed_price_degrades_asset() {
        let gateway = PaperGateway::builder()
            .with_balance("USDC", 100.0, 0.0)
            .with_balance("XYZ", 10.0, 0.0)
            .with_price("USDCUSDT", 1.0)
            .build();
        let snapshot = value_portfolio(&gateway, &config()).unwrap();
        assert_eq!(snapshot.degraded, vec!["XYZ".to_string()]);
        assert!((snapshot.total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn conversion_failure_defaults_to_unity() {
        let gateway = PaperGateway::builder()
            .with_balance("USDT", 50.0, 0.0)
            .with_balance("ADA", 100.0, 0.0)
            .with_price("ADAUSDT", 0.50)
            .build(); // no USDCUSDT price
        let snapshot = value_portfolio(&gateway, &config()).unwrap();
        assert!(snapshot.conversion_flagged);
        assert!((snapshot.class_value(AssetClass::Stable) - 50.0).abs() < 1e-9);
        assert!((snapshot.class_value(AssetClass::Alts) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn empty_account_is_unobservable() {
        let gateway = PaperGateway::builder().with_price("USDCUSDT", 1.0).build();
        let snapshot = value_portfolio(&gateway, &config()).unwrap();
        assert!(snapshot.unobservable());
    }

    #[test]
    fn leg_value_sums_classes() {
        let snapshot = value_portfolio(&gateway(), &config()).unwrap();
        let leg = Leg {
            name: "btceth".into(),
            classes: vec![AssetClass::Btc, AssetClass::Eth],
            target: 0.5,
            buy_split: None,
        };
        assert!((snapshot.leg_value(&leg) - 2_500.0).abs() < 1e-9);
    }
}
