//! Bulk label purchase.
//!
//! `create_labels` leases the requested orders, buys the cheapest persisted
//! rate for each one in turn, and records a [`BulkRun`] at the end. Per-order
//! problems become failed results; only store errors abort the invocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use labelship_retry::{ErrorClass, RetryExecutor};
use labelship_types::{
    BulkRun, EventType, FailureKind, Order, OrderId, OrderOutcome, OrderResult, Rate, Shipment,
    ShipmentLabelStatus, VoidStatus,
};

use crate::audit::AuditLog;
use crate::history::BulkRunBuilder;
use crate::lease::{DEFAULT_LEASE_TIMEOUT, LeaseManager, dedupe};
use crate::merge::{MergeMode, PrintDocument, PrintTracker};
use crate::notify::{MultiSkuNotice, NoopNotifier, Notifier};
use crate::provider::{LabelResult, ProviderAdapter, ProviderRegistry, PurchaseRequest};
use crate::reporter::Reporter;
use crate::store::{LabelStore, PurchaseCommit, StoreError};
use crate::sync::{MarketplaceSync, NoopSync, TrackingUpdate};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Leases older than this are reclaimed when acquiring
    pub lease_timeout: Duration,
    /// Orders not started within this budget fail with `DeadlineExceeded`
    pub deadline: Option<Duration>,
    /// Merge the run's purchased labels into one PDF at the end
    pub merge_labels: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            deadline: None,
            merge_labels: false,
        }
    }
}

/// What processing one order produced, plus the provider it talked to.
struct Processed {
    result: OrderResult,
    provider: Option<String>,
}

impl Processed {
    fn new(result: OrderResult, provider: Option<String>) -> Self {
        Self { result, provider }
    }
}

fn failed(
    order_id: OrderId,
    kind: FailureKind,
    message: String,
    retries_attempted: u32,
    raw: Option<String>,
) -> OrderResult {
    OrderResult {
        order_id,
        outcome: OrderOutcome::Failed {
            kind,
            message,
            retries_attempted,
            raw,
        },
    }
}

fn skipped(order_id: OrderId, tracking_number: Option<String>) -> OrderResult {
    OrderResult {
        order_id,
        outcome: OrderOutcome::Skipped {
            reason: "already labeled".to_string(),
            tracking_number,
        },
    }
}

/// `run-<UTC timestamp>-<nonce>`.
pub fn new_run_id(started_at: DateTime<Utc>) -> String {
    format!(
        "run-{}-{:06x}",
        started_at.format("%Y%m%dT%H%M%S"),
        rand::random::<u32>() & 0x00ff_ffff
    )
}

fn no_sleep(_: Duration) {}

pub struct LabelOrchestrator {
    store: Arc<dyn LabelStore>,
    registry: Arc<ProviderRegistry>,
    leases: LeaseManager,
    sync: Arc<dyn MarketplaceSync>,
    notifier: Arc<dyn Notifier>,
    audit: AuditLog,
    printer: Option<Arc<PrintTracker>>,
    options: OrchestratorOptions,
    retry_sleep: fn(Duration),
}

impl LabelOrchestrator {
    pub fn new(
        store: Arc<dyn LabelStore>,
        registry: Arc<ProviderRegistry>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            leases: LeaseManager::new(store.clone()),
            store,
            registry,
            sync: Arc::new(NoopSync),
            notifier: Arc::new(NoopNotifier),
            audit: AuditLog::disabled(),
            printer: None,
            options,
            retry_sleep: std::thread::sleep,
        }
    }

    pub fn with_sync(mut self, sync: Arc<dyn MarketplaceSync>) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_print_tracker(mut self, printer: Arc<PrintTracker>) -> Self {
        self.printer = Some(printer);
        self
    }

    /// Replace the lease manager, e.g. to pin the holder token.
    pub fn with_lease_manager(mut self, leases: LeaseManager) -> Self {
        self.leases = leases;
        self
    }

    /// Skip real sleeps between purchase retries.
    pub fn without_retry_delays(mut self) -> Self {
        self.retry_sleep = no_sleep;
        self
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Buy labels for `order_ids` and record the run.
    pub fn create_labels(
        &self,
        order_ids: &[OrderId],
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<BulkRun> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let requested = dedupe(order_ids);
        let run_id = new_run_id(started_at);
        let mut builder = BulkRunBuilder::new(&run_id, actor, started_at, &requested);
        reporter.info(&format!("{run_id}: {} order(s) requested", requested.len()));

        let acquisition = self
            .leases
            .acquire(&requested, self.options.lease_timeout)
            .context("failed to acquire order leases")?;

        for lease in &acquisition.recovered {
            reporter.warn(&format!(
                "order {}: recovered stale lease held by {}",
                lease.order_id,
                lease.holder.as_deref().unwrap_or("unknown holder")
            ));
            self.audit.record(
                EventType::LeaseRecovered {
                    holder: lease.holder.clone(),
                },
                Some(lease.order_id),
                actor,
                reporter,
            );
        }
        if !acquisition.already_locked.is_empty() {
            reporter.warn(&format!(
                "{} order(s) locked by another worker, not processed: {:?}",
                acquisition.already_locked.len(),
                acquisition.already_locked
            ));
            builder.locked_out(&acquisition.already_locked);
        }
        for &order_id in &acquisition.missing {
            reporter.error(&format!("order {order_id}: not found"));
            builder.record(failed(
                order_id,
                FailureKind::OrderNotFound,
                format!("order {order_id} not found"),
                0,
                None,
            ));
        }

        let mut pending = acquisition.acquired.iter().copied();
        while let Some(order_id) = pending.next() {
            if let Some(deadline) = self.options.deadline
                && clock.elapsed() >= deadline
            {
                if !builder.is_deadline_exceeded() {
                    reporter.warn(&format!("{run_id}: batch deadline of {deadline:?} passed"));
                }
                builder.deadline_exceeded();
                builder.record(failed(
                    order_id,
                    FailureKind::DeadlineExceeded,
                    "batch deadline exceeded before the order was started".to_string(),
                    0,
                    None,
                ));
                self.release_one(order_id, reporter);
                continue;
            }

            // Orders late in a long batch would otherwise look abandoned.
            match self.leases.renew(order_id) {
                Ok(true) => {}
                Ok(false) => {
                    reporter.warn(&format!(
                        "order {order_id}: lease lost before processing, skipped"
                    ));
                    builder.locked_out(&[order_id]);
                    continue;
                }
                Err(e) => {
                    reporter.warn(&format!("order {order_id}: failed to renew lease: {e}"));
                }
            }

            let processed = self.process_order(order_id, actor, reporter);
            self.release_one(order_id, reporter);
            match processed {
                Ok(processed) => {
                    if let Some(source) = &processed.provider {
                        builder.provider_used(source);
                    }
                    builder.record(processed.result);
                }
                Err(e) => {
                    let remaining: Vec<OrderId> = pending.collect();
                    if let Err(release_err) = self.leases.release(&remaining) {
                        reporter.warn(&format!(
                            "failed to release {} lease(s): {release_err}",
                            remaining.len()
                        ));
                    }
                    return Err(anyhow::Error::new(e)
                        .context(format!("{run_id}: store failure while processing order {order_id}")));
                }
            }
        }

        if self.options.merge_labels {
            self.merge_run_labels(&run_id, &mut builder, actor, reporter);
        }

        let run = builder.finish(Utc::now());
        self.store
            .save_bulk_run(&run)
            .with_context(|| format!("failed to persist bulk run {run_id}"))?;
        self.audit.record(
            EventType::BulkRunRecorded {
                run_id: run.id.clone(),
                status: run.status,
                success_count: run.success_count,
                failed_count: run.failed_count,
            },
            None,
            actor,
            reporter,
        );
        reporter.info(&format!(
            "{}: {} ({} succeeded, {} failed, {} locked out)",
            run.id,
            run.status,
            run.success_count,
            run.failed_count,
            run.locked_out_order_ids.len()
        ));
        Ok(run)
    }

    fn release_one(&self, order_id: OrderId, reporter: &mut dyn Reporter) {
        if let Err(e) = self.leases.release(&[order_id]) {
            reporter.warn(&format!("order {order_id}: failed to release lease: {e}"));
        }
    }

    fn process_order(
        &self,
        order_id: OrderId,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<Processed, StoreError> {
        let Some(order) = self.store.get_order(order_id)? else {
            return Ok(Processed::new(
                failed(
                    order_id,
                    FailureKind::OrderNotFound,
                    format!("order {order_id} not found"),
                    0,
                    None,
                ),
                None,
            ));
        };

        if let Some(existing) = self.store.active_shipment(order_id)? {
            reporter.info(&format!(
                "order {order_id}: already labeled ({})",
                existing.tracking_number
            ));
            return Ok(Processed::new(
                skipped(order_id, Some(existing.tracking_number)),
                None,
            ));
        }

        let Some(rate) = self.store.cheapest_rate(order_id)? else {
            let message = "no rate found".to_string();
            reporter.error(&format!("order {order_id}: {message}"));
            self.audit.record(
                EventType::LabelFailed {
                    source: None,
                    kind: FailureKind::NoRateFound,
                    message: message.clone(),
                    raw: None,
                },
                Some(order_id),
                actor,
                reporter,
            );
            return Ok(Processed::new(
                failed(order_id, FailureKind::NoRateFound, message, 0, None),
                None,
            ));
        };

        let Some(adapter) = self.registry.get(&rate.source) else {
            let message = format!("provider {} is not registered", rate.source);
            self.store.record_failure(order_id)?;
            reporter.error(&format!("order {order_id}: {message}"));
            self.audit.record(
                EventType::LabelFailed {
                    source: Some(rate.source.clone()),
                    kind: FailureKind::UnknownProvider,
                    message: message.clone(),
                    raw: None,
                },
                Some(order_id),
                actor,
                reporter,
            );
            return Ok(Processed::new(
                failed(order_id, FailureKind::UnknownProvider, message, 0, None),
                None,
            ));
        };

        let policy = adapter.retry_policy();
        let max_attempts = policy.max_attempts.max(1);
        let request = PurchaseRequest::for_rate(&order, &rate);
        let executor = RetryExecutor::new(policy.clone()).with_sleep(self.retry_sleep);
        let report = executor.run_classified(
            |attempt| {
                if attempt > 1 {
                    reporter.warn(&format!(
                        "order {order_id}: retrying purchase with {} (attempt {attempt}/{max_attempts})",
                        rate.source
                    ));
                }
                adapter.purchase_label(&request)
            },
            |e| e.classify(&policy),
        );
        let retries_attempted = report.failed_attempts;

        let label = match report.result {
            Ok(label) => label,
            Err(err) => {
                let (kind, mut message) = if report.exhausted {
                    (
                        FailureKind::RetriesExhausted,
                        format!("retries exhausted after {} attempts: {err}", report.attempts),
                    )
                } else {
                    (FailureKind::Provider, err.to_string())
                };
                if err.classify(&policy) == ErrorClass::Ambiguous {
                    message.push_str(" (the provider may have issued the label; check before retrying)");
                }
                let raw = err.raw().map(str::to_string);

                self.store.record_failure(order_id)?;
                reporter.error(&format!("order {order_id}: {message}"));
                self.audit.record(
                    EventType::LabelFailed {
                        source: Some(rate.source.clone()),
                        kind,
                        message: message.clone(),
                        raw: raw.clone(),
                    },
                    Some(order_id),
                    actor,
                    reporter,
                );
                return Ok(Processed::new(
                    failed(order_id, kind, message, retries_attempted, raw),
                    Some(rate.source),
                ));
            }
        };

        let result = self.commit_purchase(
            &order,
            &rate,
            adapter.as_ref(),
            label,
            retries_attempted,
            actor,
            reporter,
        )?;
        Ok(Processed::new(result, Some(rate.source)))
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_purchase(
        &self,
        order: &Order,
        rate: &Rate,
        adapter: &dyn ProviderAdapter,
        label: LabelResult,
        retries_attempted: u32,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<OrderResult, StoreError> {
        let order_id = order.id;
        let shipment = Shipment {
            id: 0,
            order_id,
            source: adapter.id().to_string(),
            tracking_number: label.tracking_number,
            carrier: label.carrier.unwrap_or_else(|| rate.carrier.clone()),
            service: rate.service.clone(),
            label_id: label.label_id,
            label_url: label.label_url,
            label_status: ShipmentLabelStatus::Active,
            void_status: VoidStatus::Active,
            cost: label.cost.unwrap_or(rate.price),
            currency: label.currency.unwrap_or_else(|| rate.currency.clone()),
            created_by: actor.to_string(),
            created_at: Utc::now(),
        };
        let bought_label_id = shipment.label_id.clone();

        let shipment = match self.store.record_purchase(shipment)? {
            PurchaseCommit::Committed(shipment) => shipment,
            PurchaseCommit::AlreadyLabeled(existing) => {
                reporter.warn(&format!(
                    "order {order_id}: labeled concurrently ({}); voiding duplicate label {bought_label_id}",
                    existing.tracking_number
                ));
                match adapter.void_label(&bought_label_id) {
                    Ok(true) => {}
                    Ok(false) => reporter.warn(&format!(
                        "order {order_id}: {} refused to void duplicate label {bought_label_id}",
                        adapter.id()
                    )),
                    Err(e) => reporter.warn(&format!(
                        "order {order_id}: failed to void duplicate label {bought_label_id}: {e}"
                    )),
                }
                return Ok(skipped(order_id, Some(existing.tracking_number)));
            }
        };

        reporter.info(&format!(
            "order {order_id}: purchased {} {} label {} ({:.2} {})",
            shipment.source, shipment.carrier, shipment.tracking_number, shipment.cost, shipment.currency
        ));
        self.audit.record(
            EventType::LabelPurchased {
                source: shipment.source.clone(),
                tracking_number: shipment.tracking_number.clone(),
                cost: shipment.cost,
                retries_attempted,
            },
            Some(order_id),
            actor,
            reporter,
        );

        let sync_warning = match self.sync.push_tracking(&TrackingUpdate::new(order, &shipment)) {
            Ok(true) => None,
            Ok(false) => Some("marketplace did not accept the tracking update".to_string()),
            Err(e) => Some(format!("tracking sync failed: {e:#}")),
        };
        if let Some(warning) = &sync_warning {
            reporter.warn(&format!("order {order_id}: {warning}"));
            self.audit.record(
                EventType::TrackingSyncFailed {
                    message: warning.clone(),
                },
                Some(order_id),
                actor,
                reporter,
            );
        }

        let notified = order.is_multi_sku() && {
            let notice = MultiSkuNotice {
                order_id,
                marketplace: order.marketplace.clone(),
                marketplace_order_id: order.marketplace_order_id.clone(),
                skus: order.distinct_skus().into_iter().map(str::to_string).collect(),
                tracking_number: shipment.tracking_number.clone(),
                carrier: shipment.carrier.clone(),
                label_url: shipment.label_url.clone(),
            };
            match self.notifier.send_multi_sku_notice(&notice) {
                Ok(()) => true,
                Err(e) => {
                    reporter.warn(&format!("order {order_id}: multi-SKU notice not sent: {e:#}"));
                    false
                }
            }
        };

        Ok(OrderResult {
            order_id,
            outcome: OrderOutcome::Purchased {
                shipment_id: shipment.id,
                source: shipment.source,
                tracking_number: shipment.tracking_number,
                carrier: shipment.carrier,
                label_url: shipment.label_url,
                cost: shipment.cost,
                retries_attempted,
                sync_warning,
                notified,
            },
        })
    }

    fn merge_run_labels(
        &self,
        run_id: &str,
        builder: &mut BulkRunBuilder,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) {
        let Some(printer) = &self.printer else {
            reporter.warn("label merge requested but no print tracker is configured");
            return;
        };
        let documents: Vec<PrintDocument> = builder
            .results()
            .iter()
            .filter_map(|r| match &r.outcome {
                OrderOutcome::Purchased { label_url, .. } => Some(PrintDocument {
                    order_id: Some(r.order_id),
                    url: label_url.clone(),
                }),
                _ => None,
            })
            .collect();
        match printer.merge_documents(run_id, documents, MergeMode::Preview, actor, reporter) {
            Ok(outcome) => {
                if let Some(url) = outcome.url() {
                    builder.merged_artifact(url.to_string());
                }
            }
            Err(e) => reporter.warn(&format!("{run_id}: label merge failed: {e}")),
        }
    }

    /// Void the active label of `order_id` with the provider that sold it.
    pub fn void_shipment(
        &self,
        order_id: OrderId,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<Shipment> {
        let acquisition = self
            .leases
            .acquire(&[order_id], self.options.lease_timeout)
            .context("failed to acquire order lease")?;
        if !acquisition.missing.is_empty() {
            bail!("order {order_id} not found");
        }
        if acquisition.acquired.is_empty() {
            bail!("order {order_id} is locked by another worker");
        }

        let result = self.void_leased(order_id, actor, reporter);
        self.release_one(order_id, reporter);
        result
    }

    fn void_leased(
        &self,
        order_id: OrderId,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<Shipment> {
        let shipment = self
            .store
            .active_shipment(order_id)?
            .with_context(|| format!("order {order_id} has no active label to void"))?;
        let adapter = self
            .registry
            .get(&shipment.source)
            .with_context(|| format!("provider {} is not registered", shipment.source))?;

        let accepted = adapter.void_label(&shipment.label_id).with_context(|| {
            format!(
                "provider {} failed to void label {}",
                shipment.source, shipment.label_id
            )
        })?;
        if !accepted {
            bail!(
                "provider {} refused to void label {}",
                shipment.source,
                shipment.label_id
            );
        }

        let voided = self.store.void_shipment(order_id)?;
        reporter.info(&format!(
            "order {order_id}: voided label {} ({})",
            voided.label_id, voided.tracking_number
        ));
        self.audit.record(
            EventType::LabelVoided {
                label_id: voided.label_id.clone(),
            },
            Some(order_id),
            actor,
            reporter,
        );
        Ok(voided)
    }
}
