//! Structured event emission: one timestamped JSON object per line.
//!
//! The engine narrates everything it decides (plans, trades, blocks,
//! completions) through an [`EventSink`]. Delivery is best-effort by
//! contract: a sink that cannot write logs a warning and the cycle carries
//! on. A notification layer tails the JSONL file; the core never waits on
//! it.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use crate::error::Result;
use crate::gateway::Side;

/// Compact view of a planned intent for event payloads.
#[derive(Debug, Clone, Serialize)]
pub struct IntentRecord {
    pub side: Side,
    pub pair: String,
    pub quantity: f64,
    pub notional: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding: Option<String>,
}

impl From<&crate::planner::TradeIntent> for IntentRecord {
    fn from(intent: &crate::planner::TradeIntent) -> Self {
        Self {
            side: intent.side,
            pair: intent.pair.clone(),
            quantity: intent.quantity,
            notional: intent.notional,
            funding: intent.funding.map(|f| f.to_string()),
        }
    }
}

/// Everything the engine reports outward.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    EngineStarted {
        instance: String,
        interval_secs: u64,
    },
    CycleSkipped {
        instance: String,
        code: String,
        reason: String,
    },
    PlanComputed {
        instance: String,
        buy_notional: f64,
        intents: Vec<IntentRecord>,
    },
    TradeExecuted {
        instance: String,
        pair: String,
        side: Side,
        quantity: f64,
        notional: f64,
        order_id: u64,
    },
    TradeBlocked {
        instance: String,
        pair: String,
        side: Side,
        reason: String,
    },
    OperationCompleted {
        instance: String,
        submitted: usize,
        executed: usize,
        failed: usize,
        skipped: usize,
        notional: f64,
    },
    PermissionDecided {
        class: String,
        amount: f64,
        allowed: bool,
        reason: String,
    },
}

#[derive(Serialize)]
struct Envelope<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a Event,
}

/// Best-effort event delivery.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Sink that drops everything; used in tests and dry runs.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}

/// Append-only JSONL sink. Write failures are logged and swallowed;
/// rebalancing decisions never depend on the notification path.
pub struct JsonlSink {
    writer: Mutex<BufWriter<std::fs::File>>,
    path: PathBuf,
}

impl JsonlSink {
    /// Open (or create) the event file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &Event) {
        let envelope = Envelope {
            ts: Utc::now(),
            event,
        };
        let line = match serde_json::to_string(&envelope) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode event: {e}");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!("failed to append event log {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let sink = JsonlSink::open(&path).unwrap();
        sink.emit(&Event::EngineStarted {
            instance: "btc-eth".into(),
            interval_secs: 60,
        });
        sink.emit(&Event::CycleSkipped {
            instance: "btc-eth".into(),
            code: "below_threshold".into(),
            reason: "deviation 1.0% below 10.0% threshold".into(),
        });
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("ts").is_some());
            assert!(value.get("event").is_some());
        }
        assert!(lines[0].contains("\"event\":\"engine_started\""));
        assert!(lines[1].contains("below_threshold"));
    }

    #[test]
    fn jsonl_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("deep").join("events.jsonl");
        let sink = JsonlSink::open(&path).unwrap();
        sink.emit(&Event::PermissionDecided {
            class: "ALTS".into(),
            amount: 25.0,
            allowed: false,
            reason: "already overweight".into(),
        });
        assert!(path.exists());
    }

    #[test]
    fn null_sink_is_silent() {
        NullSink.emit(&Event::EngineStarted {
            instance: "x".into(),
            interval_secs: 1,
        });
    }
}
