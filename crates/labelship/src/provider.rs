//! Rate/label provider contract and the registry of configured adapters.

use std::sync::Arc;

use anyhow::{Result, bail};
use labelship_retry::{ErrorClass, RetryStrategyConfig};
use labelship_types::{Address, Order, OrderId, Parcel, Rate, RawQuote};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything a provider needs to quote an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRequest {
    pub order_id: OrderId,
    pub marketplace_order_id: String,
    pub ship_from: Address,
    pub ship_to: Address,
    pub parcel: Parcel,
}

impl RateRequest {
    pub fn for_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            marketplace_order_id: order.marketplace_order_id.clone(),
            ship_from: order.ship_from.clone(),
            ship_to: order.ship_to.clone(),
            parcel: order.parcel.clone(),
        }
    }
}

/// Purchase of one previously quoted rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub order_id: OrderId,
    pub marketplace_order_id: String,
    pub rate_handle: String,
    pub carrier: String,
    pub service: String,
}

impl PurchaseRequest {
    pub fn for_rate(order: &Order, rate: &Rate) -> Self {
        Self {
            order_id: order.id,
            marketplace_order_id: order.marketplace_order_id.clone(),
            rate_handle: rate.rate_handle.clone(),
            carrier: rate.carrier.clone(),
            service: rate.service.clone(),
        }
    }
}

/// A bought label as the provider described it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResult {
    pub tracking_number: String,
    pub label_id: String,
    pub label_url: String,
    /// Overrides the quoted carrier when present
    pub carrier: Option<String>,
    /// Final charged amount, when it differs from the quote
    pub cost: Option<f64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Provider call failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        raw: Option<String>,
    },
    /// The request never reached the provider
    #[error("connection failed: {0}")]
    Connect(String),
    /// The request may have been processed; the answer never arrived
    #[error("request timed out: {0}")]
    Timeout(String),
    /// A success status with a body we cannot use
    #[error("malformed response: {message}")]
    Malformed {
        message: String,
        raw: Option<String>,
    },
    /// The provider answered but refused the operation
    #[error("declined: {message}")]
    Declined {
        message: String,
        raw: Option<String>,
    },
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw provider payload, kept for the audit trail.
    pub fn raw(&self) -> Option<&str> {
        match self {
            ProviderError::Http { raw, .. }
            | ProviderError::Malformed { raw, .. }
            | ProviderError::Declined { raw, .. } => raw.as_deref(),
            ProviderError::Connect(_) | ProviderError::Timeout(_) => None,
        }
    }

    /// Retry class under `policy`.
    ///
    /// Timeouts are ambiguous: the provider may already have charged for the
    /// label, so they are never retried automatically.
    pub fn classify(&self, policy: &RetryStrategyConfig) -> ErrorClass {
        match self {
            ProviderError::Http { status, .. } => policy.classify_status(Some(*status)),
            ProviderError::Connect(_) => ErrorClass::Retryable,
            ProviderError::Timeout(_) => ErrorClass::Ambiguous,
            ProviderError::Malformed { .. } | ProviderError::Declined { .. } => {
                ErrorClass::Permanent
            }
        }
    }
}

/// One rate/label provider.
pub trait ProviderAdapter: Send + Sync {
    /// Identifier stored on rates as `source`.
    fn id(&self) -> &str;

    fn get_rates(&self, request: &RateRequest) -> Result<Vec<RawQuote>, ProviderError>;

    fn purchase_label(&self, request: &PurchaseRequest) -> Result<LabelResult, ProviderError>;

    /// `Ok(false)` means the provider refused to void.
    fn void_label(&self, label_id: &str) -> Result<bool, ProviderError>;

    /// Retry policy applied around `purchase_label`.
    fn retry_policy(&self) -> RetryStrategyConfig {
        RetryStrategyConfig::fail_fast()
    }
}

/// Adapters in registration order. Registration order breaks price ties.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        if self.get(adapter.id()).is_some() {
            bail!("provider {} is already registered", adapter.id());
        }
        self.adapters.push(adapter);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
