//! Wiring of the pipeline components from a [`LabelshipConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use labelship_config::LabelshipConfig;

use crate::audit::AuditLog;
use crate::file_store::FileStore;
use crate::history::BulkHistory;
use crate::http_provider::HttpProviderAdapter;
use crate::lease::LeaseManager;
use crate::merge::{PrintTracker, UrlFetcher};
use crate::notify::{NoopNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::{LabelOrchestrator, OrchestratorOptions};
use crate::provider::ProviderRegistry;
use crate::rates::RateShopper;
use crate::store::LabelStore;
use crate::sync::{HttpMarketplaceSync, MarketplaceSync, NoopSync};

/// Timeout for downloading label documents to merge.
pub const DOCUMENT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Every component of one labelship process, sharing one store.
pub struct Runtime {
    config: LabelshipConfig,
    store: Arc<dyn LabelStore>,
    registry: Arc<ProviderRegistry>,
    audit: AuditLog,
    printer: Arc<PrintTracker>,
    orchestrator: LabelOrchestrator,
}

impl Runtime {
    pub fn from_config(config: LabelshipConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let store: Arc<dyn LabelStore> = Arc::new(
            FileStore::new(&config.store.dir)
                .with_lock_timing(config.store.lock_wait, config.store.lock_stale_after),
        );
        let audit = AuditLog::in_dir(&config.store.dir);

        let mut registry = ProviderRegistry::new();
        for provider in &config.providers {
            let adapter = HttpProviderAdapter::from_config(provider)
                .with_context(|| format!("failed to set up provider {}", provider.id))?;
            registry.register(Arc::new(adapter))?;
        }
        let registry = Arc::new(registry);

        let sync: Arc<dyn MarketplaceSync> = if config.marketplace.enabled {
            Arc::new(HttpMarketplaceSync::from_config(&config.marketplace)?)
        } else {
            Arc::new(NoopSync)
        };
        let notifier: Arc<dyn Notifier> = if config.notify.enabled {
            Arc::new(WebhookNotifier::from_config(&config.notify)?)
        } else {
            Arc::new(NoopNotifier)
        };

        let printer = Arc::new(
            PrintTracker::new(
                store.clone(),
                Arc::new(UrlFetcher::new(DOCUMENT_FETCH_TIMEOUT)?),
                config.merge_output_dir(),
            )
            .with_public_base_url(config.merge.public_base_url.clone())
            .with_audit(audit.clone()),
        );

        let options = OrchestratorOptions {
            lease_timeout: config.leases.acquire_timeout,
            deadline: Some(config.batch.deadline),
            merge_labels: config.batch.merge_labels,
        };
        let orchestrator = LabelOrchestrator::new(store.clone(), registry.clone(), options)
            .with_sync(sync)
            .with_notifier(notifier)
            .with_audit(audit.clone())
            .with_print_tracker(printer.clone());

        Ok(Self {
            config,
            store,
            registry,
            audit,
            printer,
            orchestrator,
        })
    }

    pub fn config(&self) -> &LabelshipConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LabelStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn orchestrator(&self) -> &LabelOrchestrator {
        &self.orchestrator
    }

    pub fn printer(&self) -> &PrintTracker {
        &self.printer
    }

    pub fn leases(&self) -> &LeaseManager {
        self.orchestrator.leases()
    }

    pub fn shopper(&self) -> RateShopper {
        RateShopper::new(self.store.clone(), self.registry.clone())
            .with_max_eta_days(self.config.batch.max_eta_days)
            .with_audit(self.audit.clone())
    }

    pub fn history(&self) -> BulkHistory {
        BulkHistory::new(self.store.clone())
    }
}
