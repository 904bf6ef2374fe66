//! Append-only JSONL transaction log for label operations.
//!
//! Every purchase failure, purchase, void, print and bulk-run summary is
//! written as one JSON line so the history of an order can be replayed for
//! audit.
//!
//! # Example
//!
//! ```
//! use labelship_events::TransactionLog;
//! use labelship_types::{EventType, LabelEvent};
//! use chrono::Utc;
//!
//! let mut log = TransactionLog::new();
//! log.record(LabelEvent {
//!     timestamp: Utc::now(),
//!     event_type: EventType::LabelVoided { label_id: "L-1".to_string() },
//!     order_id: Some(7),
//!     actor: "ops".to_string(),
//! });
//! assert_eq!(log.len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use labelship_types::{LabelEvent, OrderId};

/// Default transaction log file name
pub const TRANSACTIONS_FILE: &str = "transactions.jsonl";

/// Get the transaction log path for a store directory
pub fn transactions_path(store_dir: &Path) -> PathBuf {
    store_dir.join(TRANSACTIONS_FILE)
}

/// Buffered transaction log.
#[derive(Debug, Default)]
pub struct TransactionLog {
    events: Vec<LabelEvent>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: LabelEvent) {
        self.events.push(event);
    }

    /// Append all buffered events to `path` in JSONL format.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open transaction log {}", path.display()))?;

        // One write per flush keeps lines from concurrent appenders intact.
        let mut buf = String::new();
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let mut writer = std::io::BufWriter::new(file);
        writer
            .write_all(buf.as_bytes())
            .context("failed to write transaction log")?;
        writer.flush().context("failed to flush transaction log")?;

        Ok(())
    }

    /// Append the buffered events and clear the buffer.
    pub fn flush_to(&mut self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        self.write_to_file(path)?;
        self.events.clear();
        Ok(())
    }

    /// Read every event from a JSONL file. A missing file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open transaction log {}", path.display()))?;

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| {
                format!("failed to read line from transaction log {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: LabelEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_order(&self, order_id: OrderId) -> Vec<&LabelEvent> {
        self.events
            .iter()
            .filter(|e| e.order_id == Some(order_id))
            .collect()
    }

    pub fn all_events(&self) -> &[LabelEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
