//! # driftgate
//!
//! Continuous portfolio-rebalancing control loop for a multi-asset crypto
//! holding traded against a single exchange.
//!
//! Keeps asset-class proportions near configured targets by planning and
//! executing sell-then-buy trades, while never draining a reserved
//! stable-coin buffer below its floor and never selling a position that is
//! currently at a loss. Independent purchasing agents can query the engine
//! for permission before spending stable-coin on a given asset class.
//!
//! The decision pipeline per cycle: valuation → deviation detection →
//! PnL-gated trade planning (with a stable-coin-first funding cascade) →
//! balance-guard checks against fresh balances → ordered execution with a
//! settlement wait between sells and dependent buys.

pub mod class;
pub mod config;
pub mod deviation;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod guard;
pub mod ledger;
pub mod paper;
pub mod permission;
pub mod planner;
pub mod sequencer;
pub mod valuation;
