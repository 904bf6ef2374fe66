//! Bulk-run records: assembled during a batch, persisted once at its end.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use labelship_types::{BulkRun, OrderId, OrderOutcome, OrderResult, RunStatus};

use crate::store::{LabelStore, StoreError};

/// Accumulates per-order results into a [`BulkRun`].
///
/// Every recorded result lands in exactly one of the success or failure
/// lists, so the counts always add up to `processed_count`.
#[derive(Debug)]
pub struct BulkRunBuilder {
    id: String,
    created_by: String,
    started_at: DateTime<Utc>,
    requested: Vec<OrderId>,
    results: Vec<OrderResult>,
    providers_used: Vec<String>,
    locked_out: Vec<OrderId>,
    merged_artifact_url: Option<String>,
    deadline_exceeded: bool,
}

impl BulkRunBuilder {
    pub fn new(id: &str, created_by: &str, started_at: DateTime<Utc>, requested: &[OrderId]) -> Self {
        Self {
            id: id.to_string(),
            created_by: created_by.to_string(),
            started_at,
            requested: requested.to_vec(),
            results: Vec::new(),
            providers_used: Vec::new(),
            locked_out: Vec::new(),
            merged_artifact_url: None,
            deadline_exceeded: false,
        }
    }

    pub fn record(&mut self, result: OrderResult) {
        self.results.push(result);
    }

    pub fn provider_used(&mut self, source: &str) {
        if !self.providers_used.iter().any(|p| p == source) {
            self.providers_used.push(source.to_string());
        }
    }

    pub fn locked_out(&mut self, ids: &[OrderId]) {
        self.locked_out.extend_from_slice(ids);
    }

    pub fn deadline_exceeded(&mut self) {
        self.deadline_exceeded = true;
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline_exceeded
    }

    pub fn merged_artifact(&mut self, url: String) {
        self.merged_artifact_url = Some(url);
    }

    pub fn results(&self) -> &[OrderResult] {
        &self.results
    }

    pub fn finish(self, finished_at: DateTime<Utc>) -> BulkRun {
        let (success, failed): (Vec<&OrderResult>, Vec<&OrderResult>) =
            self.results.iter().partition(|r| r.outcome.is_success());
        let success_order_ids: Vec<OrderId> = success.iter().map(|r| r.order_id).collect();
        let failed_order_ids: Vec<OrderId> = failed.iter().map(|r| r.order_id).collect();
        let status = if failed_order_ids.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        BulkRun {
            id: self.id,
            created_by: self.created_by,
            started_at: self.started_at,
            finished_at,
            requested_order_ids: self.requested,
            order_ids: self.results.iter().map(|r| r.order_id).collect(),
            providers_used: self.providers_used,
            processed_count: self.results.len(),
            success_count: success_order_ids.len(),
            failed_count: failed_order_ids.len(),
            success_order_ids,
            failed_order_ids,
            locked_out_order_ids: self.locked_out,
            results: self.results,
            merged_artifact_url: self.merged_artifact_url,
            status,
            mail_sent: false,
            deadline_exceeded: self.deadline_exceeded,
        }
    }
}

/// Read side of the bulk-run history.
pub struct BulkHistory {
    store: Arc<dyn LabelStore>,
}

impl BulkHistory {
    pub fn new(store: Arc<dyn LabelStore>) -> Self {
        Self { store }
    }

    /// Runs, newest first.
    pub fn list_runs(&self, limit: Option<usize>) -> Result<Vec<BulkRun>, StoreError> {
        let mut runs = self.store.list_bulk_runs()?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<BulkRun>, StoreError> {
        self.store.get_bulk_run(id)
    }

    pub fn mark_mail_sent(&self, id: &str) -> Result<(), StoreError> {
        self.store.mark_mail_sent(id)
    }

    /// Per-order results of a run that failed.
    pub fn failures(&self, id: &str) -> Result<Vec<OrderResult>, StoreError> {
        let run = self
            .store
            .get_bulk_run(id)?
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))?;
        Ok(run
            .results
            .into_iter()
            .filter(|r| matches!(r.outcome, OrderOutcome::Failed { .. }))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeDelta;
    use labelship_types::FailureKind;

    fn purchased(order_id: OrderId) -> OrderResult {
        OrderResult {
            order_id,
            outcome: OrderOutcome::Purchased {
                shipment_id: order_id,
                source: "alpha".into(),
                tracking_number: format!("T{order_id}"),
                carrier: "usps".into(),
                label_url: format!("https://l/{order_id}.pdf"),
                cost: 5.0,
                retries_attempted: 0,
                sync_warning: None,
                notified: false,
            },
        }
    }

    fn failed(order_id: OrderId) -> OrderResult {
        OrderResult {
            order_id,
            outcome: OrderOutcome::Failed {
                kind: FailureKind::NoRateFound,
                message: "no rate found".into(),
                retries_attempted: 0,
                raw: None,
            },
        }
    }

    #[test]
    fn finish_partitions_results() {
        let mut builder = BulkRunBuilder::new("run-1", "ops", Utc::now(), &[1, 2, 3, 4]);
        builder.record(purchased(1));
        builder.record(failed(2));
        builder.record(OrderResult {
            order_id: 3,
            outcome: OrderOutcome::Skipped {
                reason: "already labeled".into(),
                tracking_number: None,
            },
        });
        builder.locked_out(&[4]);
        builder.provider_used("alpha");
        builder.provider_used("alpha");

        let run = builder.finish(Utc::now());
        assert_eq!(run.processed_count, 3);
        assert_eq!(run.success_order_ids, vec![1, 3]);
        assert_eq!(run.failed_order_ids, vec![2]);
        assert_eq!(run.success_count + run.failed_count, run.processed_count);
        assert_eq!(run.locked_out_order_ids, vec![4]);
        assert_eq!(run.providers_used, vec!["alpha".to_string()]);
        assert_eq!(run.status, RunStatus::Partial);
        assert!(!run.all_failed());
    }

    #[test]
    fn empty_run_is_completed() {
        let run = BulkRunBuilder::new("run-0", "ops", Utc::now(), &[]).finish(Utc::now());
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.processed_count, 0);
    }

    #[test]
    fn history_lists_newest_first_and_marks_mail() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        for (i, id) in ["old", "new"].iter().enumerate() {
            let mut builder =
                BulkRunBuilder::new(id, "ops", t0 + TimeDelta::seconds(i as i64), &[9]);
            builder.record(failed(9));
            store.save_bulk_run(&builder.finish(t0)).expect("save");
        }

        let history = BulkHistory::new(store);
        let runs = history.list_runs(None).expect("list");
        assert_eq!(runs[0].id, "new");
        assert_eq!(history.list_runs(Some(1)).expect("list").len(), 1);

        history.mark_mail_sent("old").expect("mark");
        assert!(history.get_run("old").expect("get").expect("run").mail_sent);
        assert!(history.mark_mail_sent("missing").is_err());
        assert_eq!(history.failures("new").expect("failures").len(), 1);
    }
}
