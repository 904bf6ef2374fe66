//! Append-only audit trail shared by the pipeline components.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use labelship_events::{TransactionLog, transactions_path};
use labelship_types::{EventType, LabelEvent, OrderId};

use crate::reporter::Reporter;

/// Writes [`LabelEvent`]s to `transactions.jsonl`, one append per event.
///
/// A disabled log drops events; in-memory tests use it.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn in_dir(store_dir: &Path) -> Self {
        Self {
            path: Some(transactions_path(store_dir)),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, event: LabelEvent) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut log = TransactionLog::new();
        log.record(event);
        log.flush_to(path)
    }

    /// Append, downgrading failures to a warning.
    pub fn record(
        &self,
        event_type: EventType,
        order_id: Option<OrderId>,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) {
        let event = LabelEvent {
            timestamp: Utc::now(),
            event_type,
            order_id,
            actor: actor.to_string(),
        };
        if let Err(e) = self.append(event) {
            reporter.warn(&format!("failed to write transaction log: {e:#}"));
        }
    }

    /// Every event written so far.
    pub fn read_all(&self) -> Result<Vec<LabelEvent>> {
        match &self.path {
            Some(path) => Ok(TransactionLog::read_from_file(path)?.all_events().to_vec()),
            None => Ok(Vec::new()),
        }
    }
}
