//! # labelship
//!
//! Multi-carrier shipping-label fulfillment for marketplace orders.
//!
//! labelship quotes every configured rate provider for an order, keeps the
//! cheapest quote that arrives in time, buys labels in bulk under per-order
//! leases so concurrent workers never buy twice, pushes tracking numbers back
//! to the marketplace, and merges the day's labels into one printable PDF.
//!
//! ## Pipeline
//!
//! 1. [`rates::RateShopper::shop`] asks every provider in the
//!    [`provider::ProviderRegistry`] for quotes, drops the ones over the
//!    transit ceiling and flags the cheapest.
//! 2. [`orchestrator::LabelOrchestrator::create_labels`] leases the batch,
//!    buys each order's cheapest rate with the provider's retry policy,
//!    syncs tracking and records a [`types::BulkRun`].
//! 3. [`merge::PrintTracker::merge_for_print`] collects a day's labels and
//!    produces one artifact for the print station.
//!
//! ## Example
//!
//! ```ignore
//! use labelship::config::LabelshipConfig;
//! use labelship::reporter::NullReporter;
//! use labelship::runtime::Runtime;
//!
//! let config = LabelshipConfig::load_or_default("labelship.toml".as_ref())?;
//! let runtime = Runtime::from_config(config)?;
//! runtime.shopper().shop(42, "ops", &mut NullReporter)?;
//! let run = runtime.orchestrator().create_labels(&[42], "ops", &mut NullReporter)?;
//! println!("{}: {}", run.id, run.status);
//! ```
//!
//! ## Modules
//!
//! - [`store`]: `LabelStore` contract and the in-memory store
//! - [`file_store`]: Directory-backed store shared across processes
//! - [`provider`]: Provider adapter contract and registry
//! - [`http_provider`]: Generic JSON-over-HTTP provider adapter
//! - [`rates`]: Rate shopping and cheapest-rate selection
//! - [`lease`]: Order leases with stale-lease recovery
//! - [`orchestrator`]: Bulk label purchase and voids
//! - [`history`]: Bulk-run records
//! - [`sync`]: Marketplace tracking push
//! - [`notify`]: Multi-SKU webhook notices
//! - [`merge`]: Label merge and print tracking
//! - [`audit`]: Transaction log writer
//! - [`runtime`]: Component wiring from configuration

/// Transaction log writer.
pub mod audit;

/// Directory-backed store.
pub mod file_store;

/// Bulk-run records and history queries.
pub mod history;

/// Generic JSON-over-HTTP provider adapter.
pub mod http_provider;

/// Order leases.
pub mod lease;

/// Label merge and print tracking.
pub mod merge;

/// Multi-SKU notifications.
pub mod notify;

/// Bulk label purchase.
pub mod orchestrator;

/// Provider adapter contract and registry.
pub mod provider;

/// Rate shopping.
pub mod rates;

/// Progress reporting sink.
pub mod reporter;

/// Component wiring from configuration.
pub mod runtime;

/// Persistence contract and the in-memory store.
pub mod store;

/// Marketplace tracking push.
pub mod sync;

/// Configuration file (`labelship.toml`) loading and validation.
/// Re-exported from labelship-config.
pub use labelship_config as config;

/// Append-only JSONL transaction log.
/// Re-exported from labelship-events.
pub use labelship_events as events;

/// Cross-process directory lock.
/// Re-exported from labelship-lock.
pub use labelship_lock as lock;

/// Retry strategies with backoff and jitter.
/// Re-exported from labelship-retry.
pub use labelship_retry as retry;

/// Domain types: orders, rates, shipments, bulk runs, events.
/// Re-exported from labelship-types.
pub use labelship_types as types;

#[cfg(test)]
mod test_support;
