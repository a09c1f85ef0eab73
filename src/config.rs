//! TOML configuration loading and validation.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::class::Leg;
use crate::error::{Error, Result};

/// Top-level configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub lots: LotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(rename = "instance")]
    pub instances: Vec<InstanceConfig>,
}

/// Quote-currency and pricing conventions for the exchange gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Primary quote asset: trades and valuations are denominated in it.
    #[serde(default = "default_quote")]
    pub quote_asset: String,
    /// Quote asset alt-basket market data lives on.
    #[serde(default = "default_alt_quote")]
    pub alt_quote_asset: String,
    /// Pair used to fold alt-quote values into the primary quote.
    #[serde(default = "default_conversion_pair")]
    pub conversion_pair: String,
    /// Assets counted as the stable-coin buffer.
    #[serde(default = "default_stables")]
    pub stable_assets: Vec<String>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

fn default_quote() -> String {
    "USDC".into()
}
fn default_alt_quote() -> String {
    "USDT".into()
}
fn default_conversion_pair() -> String {
    "USDCUSDT".into()
}
fn default_stables() -> Vec<String> {
    vec!["USDC".into(), "USDT".into()]
}
fn default_timeout() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            quote_asset: default_quote(),
            alt_quote_asset: default_alt_quote(),
            conversion_pair: default_conversion_pair(),
            stable_assets: default_stables(),
            request_timeout_secs: default_timeout(),
        }
    }
}

/// The standing balance protections.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    /// Stable-coin free balance (in quote units) that must survive any
    /// planned operation.
    #[serde(default = "default_floor")]
    pub reserved_stable_floor: f64,
    /// Portfolios valued below this are left alone entirely.
    #[serde(default = "default_min_portfolio")]
    pub min_portfolio_notional: f64,
}

fn default_floor() -> f64 {
    20.0
}
fn default_min_portfolio() -> f64 {
    10.0
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            reserved_stable_floor: default_floor(),
            min_portfolio_notional: default_min_portfolio(),
        }
    }
}

/// Order pacing and settlement polling.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_interval_ms")]
    pub order_interval_ms: u64,
    /// Bounded settlement polls per sell order before the plan fails.
    #[serde(default = "default_settle_attempts")]
    pub settle_poll_attempts: u32,
    /// Initial delay between settlement polls; doubles per attempt by
    /// default.
    #[serde(default = "default_settle_backoff")]
    pub settle_backoff_ms: u64,
    #[serde(default = "default_settle_multiplier")]
    pub settle_backoff_multiplier: f64,
}

fn default_interval_ms() -> u64 {
    100
}
fn default_settle_attempts() -> u32 {
    6
}
fn default_settle_backoff() -> u64 {
    500
}
fn default_settle_multiplier() -> f64 {
    2.0
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_interval_ms: default_interval_ms(),
            settle_poll_attempts: default_settle_attempts(),
            settle_backoff_ms: default_settle_backoff(),
            settle_backoff_multiplier: default_settle_multiplier(),
        }
    }
}

/// Minimum tradable lot sizes per base asset.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LotConfig {
    #[serde(default = "default_lot")]
    pub default_lot: f64,
    #[serde(default)]
    pub sizes: FxHashMap<String, f64>,
}

fn default_lot() -> f64 {
    0.000_001
}

impl LotConfig {
    pub fn lot_for(&self, asset: &str) -> f64 {
        self.sizes.get(asset).copied().unwrap_or_else(|| {
            if self.default_lot > 0.0 {
                self.default_lot
            } else {
                default_lot()
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_events_file")]
    pub events_file: String,
    /// Append-only FIFO-lot journal; set to empty to disable persistence.
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,
}

fn default_log_dir() -> String {
    "./logs".into()
}
fn default_events_file() -> String {
    "events.jsonl".into()
}
fn default_ledger_file() -> String {
    "ledger.jsonl".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            events_file: default_events_file(),
            ledger_file: default_ledger_file(),
        }
    }
}

/// One rebalancer instance: a pair of legs with its own thresholds,
/// cooldown, and pacing. Instances share the account but own their state.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    #[serde(default = "default_cycle_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Minimum deviation as a fraction of the leg's own target (0.10 means
    /// "10% away from target"), not a share of the whole portfolio.
    #[serde(default = "default_deviation")]
    pub min_deviation_pct: f64,
    #[serde(default = "default_min_trade")]
    pub min_trade_notional: f64,
    #[serde(default = "default_max_operation")]
    pub max_operation_notional: f64,
    /// Fraction of the detected deviation to correct per operation, to
    /// avoid overshooting on stale snapshots.
    #[serde(default = "default_spend_fraction")]
    pub deviation_spend_fraction: f64,
    /// Assets bought when this instance buys into its alt leg.
    #[serde(default)]
    pub alt_buy_assets: Vec<String>,
    pub legs: Vec<Leg>,
}

fn default_cycle_interval() -> u64 {
    60
}
fn default_cooldown() -> u64 {
    60
}
fn default_deviation() -> f64 {
    0.10
}
fn default_min_trade() -> f64 {
    5.0
}
fn default_max_operation() -> f64 {
    100.0
}
fn default_spend_fraction() -> f64 {
    0.5
}

impl Config {
    /// Load config from a TOML file. The only process-fatal error path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants.
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(Error::Config("no [[instance]] configured".into()));
        }
        if self.guard.reserved_stable_floor < 0.0 {
            return Err(Error::Config("reserved_stable_floor must be >= 0".into()));
        }
        if self.guard.min_portfolio_notional < 0.0 {
            return Err(Error::Config("min_portfolio_notional must be >= 0".into()));
        }
        if self.execution.settle_poll_attempts == 0 {
            return Err(Error::Config("settle_poll_attempts must be > 0".into()));
        }
        if self.execution.settle_backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "settle_backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.gateway.stable_assets.is_empty() {
            return Err(Error::Config("stable_assets must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            if !seen.insert(&instance.name) {
                return Err(Error::Config(format!(
                    "duplicate instance name '{}'",
                    instance.name
                )));
            }
            instance.validate()?;
        }
        Ok(())
    }

    pub fn events_path(&self) -> std::path::PathBuf {
        Path::new(&self.logging.dir).join(&self.logging.events_file)
    }

    pub fn ledger_path(&self) -> Option<std::path::PathBuf> {
        if self.logging.ledger_file.is_empty() {
            None
        } else {
            Some(Path::new(&self.logging.dir).join(&self.logging.ledger_file))
        }
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.name == name)
    }
}

impl InstanceConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("instance name must not be empty".into()));
        }
        if self.legs.len() != 2 {
            return Err(Error::Config(format!(
                "instance '{}' must define exactly two legs, found {}",
                self.name,
                self.legs.len()
            )));
        }
        for leg in &self.legs {
            leg.validate()?;
        }
        let sum: f64 = self.legs.iter().map(|l| l.target).sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "instance '{}' leg targets sum to {sum:.4}, expected 1.0",
                self.name
            )));
        }
        if self.min_deviation_pct <= 0.0 {
            return Err(Error::Config(format!(
                "instance '{}' min_deviation_pct must be > 0",
                self.name
            )));
        }
        if self.min_trade_notional <= 0.0 {
            return Err(Error::Config(format!(
                "instance '{}' min_trade_notional must be > 0",
                self.name
            )));
        }
        if self.max_operation_notional <= 0.0 {
            return Err(Error::Config(format!(
                "instance '{}' max_operation_notional must be > 0",
                self.name
            )));
        }
        if !(self.deviation_spend_fraction > 0.0 && self.deviation_spend_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "instance '{}' deviation_spend_fraction must be in (0, 1]",
                self.name
            )));
        }
        let buys_alts = self
            .legs
            .iter()
            .any(|l| l.contains(crate::class::AssetClass::Alts));
        if buys_alts && self.alt_buy_assets.is_empty() {
            return Err(Error::Config(format!(
                "instance '{}' has an alt leg but no alt_buy_assets",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_toml() -> &'static str {
        r#"
[gateway]
quote_asset = "USDC"
alt_quote_asset = "USDT"
conversion_pair = "USDCUSDT"
stable_assets = ["USDC", "USDT"]
request_timeout_secs = 10

[guard]
reserved_stable_floor = 20.0
min_portfolio_notional = 10.0

[execution]
order_interval_ms = 100
settle_poll_attempts = 6
settle_backoff_ms = 500
settle_backoff_multiplier = 2.0

[lots]
default_lot = 0.000001
[lots.sizes]
BTC = 0.0001
ETH = 0.001

[logging]
dir = "./logs"
events_file = "events.jsonl"
ledger_file = "ledger.jsonl"

[[instance]]
name = "alts-btceth"
interval_secs = 60
cooldown_secs = 60
min_deviation_pct = 0.10
min_trade_notional = 5.0
max_operation_notional = 100.0
deviation_spend_fraction = 0.5
alt_buy_assets = ["ADA", "DOT", "LINK"]

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

[[instance]]
name = "btc-eth"
interval_secs = 3600
cooldown_secs = 1800
min_deviation_pct = 0.05
min_trade_notional = 5.0
max_operation_notional = 200.0
deviation_spend_fraction = 1.0

[[instance.legs]]
name = "btc"
classes = ["btc"]
target = 0.6

[[instance.legs]]
name = "eth"
classes = ["eth"]
target = 0.4
"#
    }

    #[test]
    fn parse_example_config() {
        let config: Config = toml::from_str(example_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.gateway.quote_asset, "USDC");
        assert_eq!(config.lots.lot_for("BTC"), 0.0001);
        assert_eq!(config.lots.lot_for("ADA"), 0.000_001);
        let first = &config.instances[0];
        assert_eq!(first.legs[1].split_for(crate::class::AssetClass::Btc), 0.6);
    }

    #[test]
    fn defaults_fill_in() {
        let minimal = r#"
[[instance]]
name = "btc-eth"

[[instance.legs]]
name = "btc"
classes = ["btc"]
target = 0.6

[[instance.legs]]
name = "eth"
classes = ["eth"]
target = 0.4
"#;
        let config: Config = toml::from_str(minimal).unwrap();
        config.validate().unwrap();
        assert_eq!(config.guard.reserved_stable_floor, 20.0);
        assert_eq!(config.instances[0].interval_secs, 60);
        assert_eq!(config.instances[0].min_deviation_pct, 0.10);
    }

    #[test]
    fn reject_bad_target_sum() {
        let toml_str = example_toml().replace("target = 0.4", "target = 0.5");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_single_leg() {
        let bad = r#"
[[instance]]
name = "solo"

[[instance.legs]]
name = "btc"
classes = ["btc"]
target = 1.0
"#;
        let config: std::result::Result<Config, _> = toml::from_str(bad);
        // target 1.0 is outside (0,1); even if parsed, validation must fail
        if let Ok(config) = config {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn reject_alt_leg_without_buy_assets() {
        let toml_str = example_toml().replace("alt_buy_assets = [\"ADA\", \"DOT\", \"LINK\"]", "");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn paths() {
        let config: Config = toml::from_str(example_toml()).unwrap();
        assert_eq!(
            config.events_path(),
            std::path::PathBuf::from("./logs/events.jsonl")
        );
        assert_eq!(
            config.ledger_path(),
            Some(std::path::PathBuf::from("./logs/ledger.jsonl"))
        );
    }

    #[test]
    fn ledger_persistence_can_be_disabled() {
        let toml_str = example_toml().replace("ledger_file = \"ledger.jsonl\"", "ledger_file = \"\"");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.ledger_path(), None);
    }
}
