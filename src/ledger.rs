//! FIFO cost-basis ledger and unrealized PnL.
//!
//! Buy lots are kept in arrival order per asset; every observed sell
//! consumes quantity from the oldest lots first. The average cost of the
//! currently remaining quantity decides whether a position is sellable for
//! rebalancing: only non-negative unrealized PnL unlocks a sell. A held
//! balance with no known lots is explicitly *unknown* and blocks selling
//! until a lot is seeded; profit is never assumed.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use log::warn;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One historical buy, net of quantity already consumed by later sells.
#[derive(Debug, Clone, PartialEq)]
pub struct CostLot {
    pub quantity: f64,
    pub unit_price: f64,
    pub seq: u64,
}

/// Cost basis of the currently held quantity of one asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CostBasis {
    Known { avg_cost: f64, unrealized: f64 },
    /// Held balance with no recorded lots (pre-tracking position or journal
    /// gap). Conservatively unsellable.
    Unknown,
}

impl CostBasis {
    /// Whether the position may fund a rebalancing sell.
    pub fn is_sellable(&self) -> bool {
        matches!(self, CostBasis::Known { unrealized, .. } if *unrealized >= 0.0)
    }

    pub fn unrealized(&self) -> Option<f64> {
        match self {
            CostBasis::Known { unrealized, .. } => Some(*unrealized),
            CostBasis::Unknown => None,
        }
    }
}

/// Ordered lots for a single asset.
#[derive(Debug, Default)]
struct AssetBook {
    lots: VecDeque<CostLot>,
    next_seq: u64,
}

impl AssetBook {
    fn buy(&mut self, quantity: f64, unit_price: f64) {
        if quantity <= 0.0 {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.lots.push_back(CostLot {
            quantity,
            unit_price,
            seq,
        });
    }

    /// Consume `quantity` from the oldest lots first.
    fn sell(&mut self, quantity: f64) {
        let mut remaining = quantity;
        while remaining > 0.0 {
            let Some(front) = self.lots.front_mut() else {
                // Sold more than tracked; the book is simply empty now.
                break;
            };
            if front.quantity > remaining + f64::EPSILON {
                front.quantity -= remaining;
                remaining = 0.0;
            } else {
                remaining -= front.quantity;
                self.lots.pop_front();
            }
        }
    }

    fn remaining_quantity(&self) -> f64 {
        self.lots.iter().map(|l| l.quantity).sum()
    }

    /// Average cost of the remaining lots, `None` when no lots are left.
    fn avg_cost(&self) -> Option<f64> {
        let qty = self.remaining_quantity();
        if qty <= 0.0 {
            return None;
        }
        let cost: f64 = self.lots.iter().map(|l| l.quantity * l.unit_price).sum();
        Some(cost / qty)
    }
}

/// One journalled lot event.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LotEvent {
    ts: DateTime<Utc>,
    kind: LotEventKind,
    asset: String,
    quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LotEventKind {
    Buy,
    Sell,
    Seed,
}

/// Per-asset PnL report row for the CLI.
#[derive(Debug, Clone)]
pub struct AssetPnl {
    pub asset: String,
    pub held: f64,
    pub price: f64,
    pub basis: CostBasis,
}

/// Shared FIFO ledger for all tracked assets.
///
/// Writers append lots atomically relative to readers: each asset book sits
/// behind its own mutex, with an outer read-write lock only for map growth.
pub struct PnlLedger {
    books: RwLock<FxHashMap<String, Arc<Mutex<AssetBook>>>>,
    journal: Option<Mutex<BufWriter<std::fs::File>>>,
    journal_path: Option<PathBuf>,
}

impl PnlLedger {
    /// In-memory ledger with no persistence.
    pub fn new() -> Self {
        Self {
            books: RwLock::new(FxHashMap::default()),
            journal: None,
            journal_path: None,
        }
    }

    /// Ledger backed by an append-only JSONL journal. Existing entries are
    /// replayed on open; later write failures degrade to warnings.
    pub fn with_journal(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let ledger = Self::new();
        if path.exists() {
            let file = std::fs::File::open(path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LotEvent>(&line) {
                    Ok(event) => ledger.apply(&event),
                    Err(e) => warn!("skipping malformed ledger journal line: {e}"),
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            journal: Some(Mutex::new(BufWriter::new(file))),
            journal_path: Some(path.to_path_buf()),
            ..ledger
        })
    }

    fn book(&self, asset: &str) -> Arc<Mutex<AssetBook>> {
        if let Some(book) = self.books.read().unwrap().get(asset) {
            return Arc::clone(book);
        }
        let mut books = self.books.write().unwrap();
        Arc::clone(books.entry(asset.to_string()).or_default())
    }

    fn apply(&self, event: &LotEvent) {
        let book = self.book(&event.asset);
        let mut book = book.lock().unwrap();
        match event.kind {
            LotEventKind::Buy | LotEventKind::Seed => {
                book.buy(event.quantity, event.unit_price.unwrap_or(0.0));
            }
            LotEventKind::Sell => book.sell(event.quantity),
        }
    }

    fn journal_write(&self, event: &LotEvent) {
        let Some(journal) = &self.journal else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode ledger event: {e}");
                return;
            }
        };
        let mut writer = journal.lock().unwrap();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!(
                "failed to append ledger journal {}: {e}",
                self.journal_path
                    .as_deref()
                    .unwrap_or_else(|| Path::new("?"))
                    .display()
            );
        }
    }

    fn record(&self, kind: LotEventKind, asset: &str, quantity: f64, unit_price: Option<f64>) {
        if quantity <= 0.0 {
            return;
        }
        let event = LotEvent {
            ts: Utc::now(),
            kind,
            asset: asset.to_string(),
            quantity,
            unit_price,
        };
        self.apply(&event);
        self.journal_write(&event);
    }

    /// Record an observed buy fill.
    pub fn record_buy(&self, asset: &str, quantity: f64, unit_price: f64) {
        self.record(LotEventKind::Buy, asset, quantity, Some(unit_price));
    }

    /// Record an observed sell fill; consumes the oldest lots first.
    pub fn record_sell(&self, asset: &str, quantity: f64) {
        self.record(LotEventKind::Sell, asset, quantity, None);
    }

    /// Manually seed a lot for a balance held before tracking began.
    pub fn seed(&self, asset: &str, quantity: f64, unit_price: f64) {
        self.record(LotEventKind::Seed, asset, quantity, Some(unit_price));
    }

    /// Cost basis for the currently held quantity at the given price.
    ///
    /// `held_qty` comes from the live balance rather than the lot sum: the
    /// lots are best-effort and can drift when external sells go unseen.
    pub fn cost_basis(&self, asset: &str, held_qty: f64, current_price: f64) -> CostBasis {
        if held_qty <= 0.0 {
            return CostBasis::Known {
                avg_cost: 0.0,
                unrealized: 0.0,
            };
        }
        let book = self.book(asset);
        let book = book.lock().unwrap();
        match book.avg_cost() {
            Some(avg_cost) => CostBasis::Known {
                avg_cost,
                unrealized: held_qty * (current_price - avg_cost),
            },
            None => CostBasis::Unknown,
        }
    }

    /// Sum of remaining lot quantities for an asset (best-effort mirror of
    /// the live balance).
    pub fn tracked_quantity(&self, asset: &str) -> f64 {
        let book = self.book(asset);
        let book = book.lock().unwrap();
        book.remaining_quantity()
    }

    /// Per-asset PnL rows for every `(asset, held, price)` input.
    pub fn report(&self, holdings: &[(String, f64, f64)]) -> Vec<AssetPnl> {
        let mut rows: Vec<AssetPnl> = holdings
            .iter()
            .map(|(asset, held, price)| AssetPnl {
                asset: asset.clone(),
                held: *held,
                price: *price,
                basis: self.cost_basis(asset, *held, *price),
            })
            .collect();
        rows.sort_by(|a, b| {
            let ua = a.basis.unrealized().unwrap_or(f64::NEG_INFINITY);
            let ub = b.basis.unrealized().unwrap_or(f64::NEG_INFINITY);
            ub.partial_cmp(&ua).unwrap_or(std::cmp::Ordering::Equal)
        });
        rows
    }
}

impl Default for PnlLedger {
    fn default() -> Self {
        Self::new()
    }
}
