//! Error types for the rebalancing engine.

use std::path::PathBuf;
use std::time::Duration;

/// All errors that can occur during engine operation.
///
/// Gate outcomes (deviation below threshold, cooldown active, PnL-blocked
/// sells, floor protection) are *not* errors; they are normal "no action"
/// results carried as [`crate::deviation::SkipReason`]. Only
/// configuration-load failure is fatal to the process; everything else is
/// handled within the cycle that hit it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to read scenario file {path}: {source}")]
    ScenarioRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse scenario JSON: {0}")]
    ScenarioParse(#[from] serde_json::Error),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("gateway call '{call}' timed out after {timeout:?}")]
    GatewayTimeout {
        call: &'static str,
        timeout: Duration,
    },

    #[error("order error: {0}")]
    Order(String),

    #[error(
        "settlement timeout: order {order_id} on {pair} not filled after {attempts} polls ({waited:?})"
    )]
    SettlementTimeout {
        pair: String,
        order_id: u64,
        attempts: u32,
        waited: Duration,
    },

    #[error("event log error: {0}")]
    Audit(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
