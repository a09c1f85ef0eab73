//! Asset classes and the leg structure of a rebalancer instance.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A logical portfolio bucket with a target share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Stable,
    Alts,
    Btc,
    Eth,
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetClass::Stable => write!(f, "STABLE"),
            AssetClass::Alts => write!(f, "ALTS"),
            AssetClass::Btc => write!(f, "BTC"),
            AssetClass::Eth => write!(f, "ETH"),
        }
    }
}

impl AssetClass {
    /// Parse a class name as used in config files and CLI arguments.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Ok(AssetClass::Stable),
            "alts" => Ok(AssetClass::Alts),
            "btc" => Ok(AssetClass::Btc),
            "eth" => Ok(AssetClass::Eth),
            other => Err(Error::Config(format!("unknown asset class '{other}'"))),
        }
    }
}

/// Classify an asset symbol into its portfolio bucket.
///
/// Anything that is neither a configured stable-coin nor BTC/ETH counts as
/// part of the alt basket.
pub fn classify(asset: &str, stable_assets: &[String]) -> AssetClass {
    if stable_assets.iter().any(|s| s == asset) {
        AssetClass::Stable
    } else if asset == "BTC" {
        AssetClass::Btc
    } else if asset == "ETH" {
        AssetClass::Eth
    } else {
        AssetClass::Alts
    }
}

/// One side of a rebalancer instance: a named set of non-stable classes with
/// a target ratio of the instance's tracked value.
#[derive(Debug, Clone, Deserialize)]
pub struct Leg {
    pub name: String,
    pub classes: Vec<AssetClass>,
    pub target: f64,
    /// How a buy of this leg is split across its classes. Defaults to an
    /// equal split when absent.
    #[serde(default)]
    pub buy_split: Option<FxHashMap<AssetClass, f64>>,
}

impl Leg {
    pub fn contains(&self, class: AssetClass) -> bool {
        self.classes.contains(&class)
    }

    /// Fraction of a leg buy allocated to `class`.
    pub fn split_for(&self, class: AssetClass) -> f64 {
        match &self.buy_split {
            Some(split) => split.get(&class).copied().unwrap_or(0.0),
            None => {
                if self.classes.is_empty() {
                    0.0
                } else {
                    1.0 / self.classes.len() as f64
                }
            }
        }
    }

    /// Validate a single leg definition.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("leg name must not be empty".into()));
        }
        if self.classes.is_empty() {
            return Err(Error::Config(format!("leg '{}' has no classes", self.name)));
        }
        if self.classes.contains(&AssetClass::Stable) {
            return Err(Error::Config(format!(
                "leg '{}' includes the stable class; the stable buffer is not a rebalanced leg",
                self.name
            )));
        }
        if !(self.target > 0.0 && self.target < 1.0) {
            return Err(Error::Config(format!(
                "leg '{}' target {} must be in (0, 1)",
                self.name, self.target
            )));
        }
        if let Some(split) = &self.buy_split {
            let sum: f64 = split.values().sum();
            if (sum - 1.0).abs() > 1e-6 {
                return Err(Error::Config(format!(
                    "leg '{}' buy_split sums to {sum:.4}, expected 1.0",
                    self.name
                )));
            }
            for class in split.keys() {
                if !self.classes.contains(class) {
                    return Err(Error::Config(format!(
                        "leg '{}' buy_split names class {class} outside the leg",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}
