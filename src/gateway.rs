//! Market data gateway contract: balances, prices, order placement.
//!
//! The engine treats the exchange as a black box behind this trait. Every
//! call is fallible and must be bounded by the implementation's request
//! timeout; a failed or timed-out call is a failure for that step of the
//! cycle, never a silent retry loop.

use serde::Serialize;

use crate::error::Result;

/// A single asset balance. Only the free quantity is tradable.
#[derive(Debug, Clone)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Exchange-reported order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
}

impl OrderStatus {
    /// True once funds from the order have posted.
    pub fn is_settled(self) -> bool {
        matches!(self, OrderStatus::Filled)
    }

    /// True when the order will never fill.
    pub fn is_dead(self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Canceled)
    }
}

/// Acknowledgement returned by order placement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    pub status: OrderStatus,
}

/// Best-effort exchange access used by every component that touches the
/// market. Implementations must be safe to share across the rebalancer
/// loops and the permission broker.
pub trait MarketGateway: Send + Sync {
    /// All account balances, including zero-value dust.
    fn balances(&self) -> Result<Vec<Balance>>;

    /// Last price for a trading pair such as `BTCUSDC`.
    fn price(&self, pair: &str) -> Result<f64>;

    /// Place an order. `price` of `None` means a market order.
    fn place_order(
        &self,
        pair: &str,
        side: Side,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<OrderAck>;

    /// Status of a previously placed order.
    fn order_status(&self, pair: &str, order_id: u64) -> Result<OrderStatus>;
}

/// Free balance of one asset, zero when absent.
pub fn free_of(balances: &[Balance], asset: &str) -> f64 {
    balances
        .iter()
        .find(|b| b.asset == asset)
        .map(|b| b.free)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_total() {
        let b = Balance {
            asset: "BTC".into(),
            free: 0.5,
            locked: 0.25,
        };
        assert_eq!(b.total(), 0.75);
    }

    #[test]
    fn status_predicates() {
        assert!(OrderStatus::Filled.is_settled());
        assert!(!OrderStatus::New.is_settled());
        assert!(OrderStatus::Rejected.is_dead());
        assert!(OrderStatus::Canceled.is_dead());
        assert!(!OrderStatus::PartiallyFilled.is_dead());
    }

    #[test]
    fn free_of_missing_asset() {
        let balances = vec![Balance {
            asset: "USDC".into(),
            free: 100.0,
            locked: 0.0,
        }];
        assert_eq!(free_of(&balances, "USDC"), 100.0);
        assert_eq!(free_of(&balances, "USDT"), 0.0);
    }

    #[test]
    fn side_display() {
        assert_eq!(format!("{}", Side::Buy), "BUY");
        assert_eq!(format!("{}", Side::Sell), "SELL");
    }
}
