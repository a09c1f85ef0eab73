//! Deterministic in-memory gateway for tests and offline runs.
//!
//! Implements [`MarketGateway`] against a simulated account: balances and
//! prices come from a builder or a JSON scenario file, orders mutate the
//! simulated balances, and a configurable settlement delay makes sells
//! report `New` for the first N status polls so the sequencer's settlement
//! path can be exercised without an exchange.

use std::path::Path;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::gateway::{Balance, MarketGateway, OrderAck, OrderStatus, Side};

/// How the simulated exchange treats submitted orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill everything that the simulated balances can cover.
    FillAll,
    RejectSells,
    RejectBuys,
    RejectAll,
}

/// A recorded submission, for assertions in tests.
#[derive(Debug, Clone)]
pub struct RecordedOrder {
    pub pair: String,
    pub side: Side,
    pub quantity: f64,
    pub price: Option<f64>,
}

/// JSON scenario: starting balances and prices for an offline run.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub balances: Vec<ScenarioBalance>,
    pub prices: FxHashMap<String, f64>,
    #[serde(default)]
    pub settlement_polls: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioBalance {
    pub asset: String,
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

struct PendingSell {
    polls_left: u32,
    quote: String,
    proceeds: f64,
}

struct PaperState {
    balances: FxHashMap<String, Balance>,
    prices: FxHashMap<String, f64>,
    failing_prices: Vec<String>,
    fill_mode: FillMode,
    settlement_polls: u32,
    pending: FxHashMap<u64, PendingSell>,
    recorded: Vec<RecordedOrder>,
    next_order_id: u64,
}

/// The simulated exchange.
pub struct PaperGateway {
    state: Mutex<PaperState>,
    /// Known quote assets, longest first, used to split pair symbols.
    quotes: Vec<String>,
}

pub struct PaperGatewayBuilder {
    balances: Vec<Balance>,
    prices: FxHashMap<String, f64>,
    failing_prices: Vec<String>,
    fill_mode: FillMode,
    settlement_polls: u32,
    quotes: Vec<String>,
}

impl PaperGatewayBuilder {
    pub fn with_balance(mut self, asset: &str, free: f64, locked: f64) -> Self {
        self.balances.push(Balance {
            asset: asset.to_string(),
            free,
            locked,
        });
        self
    }

    pub fn with_price(mut self, pair: &str, price: f64) -> Self {
        self.prices.insert(pair.to_string(), price);
        self
    }

    /// Make one pair's price lookup fail, simulating degraded market data.
    pub fn failing_price(mut self, pair: &str) -> Self {
        self.failing_prices.push(pair.to_string());
        self
    }

    pub fn fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = mode;
        self
    }

    /// Sells report `New` for this many status polls before filling.
    pub fn settlement_polls(mut self, polls: u32) -> Self {
        self.settlement_polls = polls;
        self
    }

    pub fn build(self) -> PaperGateway {
        PaperGateway {
            state: Mutex::new(PaperState {
                balances: self
                    .balances
                    .into_iter()
                    .map(|b| (b.asset.clone(), b))
                    .collect(),
                prices: self.prices,
                failing_prices: self.failing_prices,
                fill_mode: self.fill_mode,
                settlement_polls: self.settlement_polls,
                pending: FxHashMap::default(),
                recorded: Vec::new(),
                next_order_id: 1,
            }),
            quotes: self.quotes,
        }
    }
}

impl PaperGateway {
    pub fn builder() -> PaperGatewayBuilder {
        PaperGatewayBuilder {
            balances: Vec::new(),
            prices: FxHashMap::default(),
            failing_prices: Vec::new(),
            fill_mode: FillMode::FillAll,
            settlement_polls: 0,
            quotes: vec!["USDC".into(), "USDT".into()],
        }
    }

    /// Load a scenario file and build the gateway from it.
    pub fn from_scenario_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ScenarioRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let scenario: Scenario = serde_json::from_str(&contents)?;
        let mut builder = Self::builder().settlement_polls(scenario.settlement_polls);
        for balance in &scenario.balances {
            builder = builder.with_balance(&balance.asset, balance.free, balance.locked);
        }
        for (pair, price) in &scenario.prices {
            builder = builder.with_price(pair, *price);
        }
        Ok(builder.build())
    }

    /// Orders seen so far, in submission order.
    pub fn recorded_orders(&self) -> Vec<RecordedOrder> {
        self.state.lock().unwrap().recorded.clone()
    }

    /// Current simulated `(free, locked)` for an asset.
    pub fn balance_of(&self, asset: &str) -> (f64, f64) {
        let state = self.state.lock().unwrap();
        state
            .balances
            .get(asset)
            .map(|b| (b.free, b.locked))
            .unwrap_or((0.0, 0.0))
    }

    /// Overwrite a price mid-test.
    pub fn set_price(&self, pair: &str, price: f64) {
        self.state
            .lock()
            .unwrap()
            .prices
            .insert(pair.to_string(), price);
    }

    /// Overwrite a balance mid-test.
    pub fn set_balance(&self, asset: &str, free: f64, locked: f64) {
        self.state.lock().unwrap().balances.insert(
            asset.to_string(),
            Balance {
                asset: asset.to_string(),
                free,
                locked,
            },
        );
    }

    /// Split a pair like `BTCUSDC` into `(base, quote)`.
    fn split_pair(&self, pair: &str) -> Result<(String, String)> {
        for quote in &self.quotes {
            if let Some(base) = pair.strip_suffix(quote.as_str()) {
                if !base.is_empty() {
                    return Ok((base.to_string(), quote.clone()));
                }
            }
        }
        Err(Error::Order(format!("unknown pair symbol '{pair}'")))
    }
}

impl MarketGateway for PaperGateway {
    fn balances(&self) -> Result<Vec<Balance>> {
        let state = self.state.lock().unwrap();
        let mut balances: Vec<Balance> = state.balances.values().cloned().collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    fn price(&self, pair: &str) -> Result<f64> {
        let state = self.state.lock().unwrap();
        if state.failing_prices.iter().any(|p| p == pair) {
            return Err(Error::Gateway(format!("price feed down for {pair}")));
        }
        state
            .prices
            .get(pair)
            .copied()
            .ok_or_else(|| Error::Gateway(format!("no ticker for {pair}")))
    }

    fn place_order(
        &self,
        pair: &str,
        side: Side,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<OrderAck> {
        let (base, quote) = self.split_pair(pair)?;
        let mut state = self.state.lock().unwrap();
        state.recorded.push(RecordedOrder {
            pair: pair.to_string(),
            side,
            quantity,
            price,
        });
        let order_id = state.next_order_id;
        state.next_order_id += 1;

        let rejected = match state.fill_mode {
            FillMode::FillAll => false,
            FillMode::RejectSells => side == Side::Sell,
            FillMode::RejectBuys => side == Side::Buy,
            FillMode::RejectAll => true,
        };
        if rejected {
            return Ok(OrderAck {
                order_id,
                status: OrderStatus::Rejected,
            });
        }

        let unit_price = match price {
            Some(p) => p,
            None => state
                .prices
                .get(pair)
                .copied()
                .ok_or_else(|| Error::Order(format!("no market price for {pair}")))?,
        };
        let gross = quantity * unit_price;

        match side {
            Side::Buy => {
                let quote_free = state.balances.get(&quote).map(|b| b.free).unwrap_or(0.0);
                if quote_free + 1e-9 < gross {
                    // Exchange-side insufficient balance: the last line of
                    // defense the engine is allowed to lean on.
                    return Ok(OrderAck {
                        order_id,
                        status: OrderStatus::Rejected,
                    });
                }
                credit(&mut state.balances, &quote, -gross);
                credit(&mut state.balances, &base, quantity);
                Ok(OrderAck {
                    order_id,
                    status: OrderStatus::Filled,
                })
            }
            Side::Sell => {
                let base_free = state.balances.get(&base).map(|b| b.free).unwrap_or(0.0);
                if base_free + 1e-9 < quantity {
                    return Ok(OrderAck {
                        order_id,
                        status: OrderStatus::Rejected,
                    });
                }
                credit(&mut state.balances, &base, -quantity);
                if state.settlement_polls > 0 {
                    // Proceeds post only once the order is polled to Filled
                    let polls = state.settlement_polls;
                    state.pending.insert(
                        order_id,
                        PendingSell {
                            polls_left: polls,
                            quote: quote.clone(),
                            proceeds: gross,
                        },
                    );
                    Ok(OrderAck {
                        order_id,
                        status: OrderStatus::New,
                    })
                } else {
                    credit(&mut state.balances, &quote, gross);
                    Ok(OrderAck {
                        order_id,
                        status: OrderStatus::Filled,
                    })
                }
            }
        }
    }

    fn order_status(&self, _pair: &str, order_id: u64) -> Result<OrderStatus> {
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.pending.get_mut(&order_id) else {
            return Ok(OrderStatus::Filled);
        };
        if pending.polls_left > 1 {
            pending.polls_left -= 1;
            return Ok(OrderStatus::New);
        }
        let quote = pending.quote.clone();
        let proceeds = pending.proceeds;
        state.pending.remove(&order_id);
        credit(&mut state.balances, &quote, proceeds);
        Ok(OrderStatus::Filled)
    }
}

fn credit(balances: &mut FxHashMap<String, Balance>, asset: &str, delta: f64) {
    let entry = balances.entry(asset.to_string()).or_insert_with(|| Balance {
        asset: asset.to_string(),
        free: 0.0,
        locked: 0.0,
    });
    entry.free = (entry.free + delta).max(0.0);
}
