//! Rate aggregation: quote every provider, normalize, filter by transit time,
//! and persist the cheapest.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use labelship_types::{EventType, OrderId, Rate, RawQuote};

use crate::audit::AuditLog;
use crate::provider::{ProviderRegistry, RateRequest};
use crate::reporter::Reporter;
use crate::store::LabelStore;

/// Default transit-time ceiling, in days.
pub const DEFAULT_MAX_ETA_DAYS: u32 = 7;

/// Result of shopping one order.
#[derive(Debug, Clone, PartialEq)]
pub enum ShopResult {
    /// `best` is also present (flagged) in `all`
    Best { best: Rate, all: Vec<Rate> },
    /// Quotes may exist, but none met the transit ceiling
    NoRateAvailable { all: Vec<Rate> },
}

impl ShopResult {
    pub fn best(&self) -> Option<&Rate> {
        match self {
            ShopResult::Best { best, .. } => Some(best),
            ShopResult::NoRateAvailable { .. } => None,
        }
    }

    pub fn all(&self) -> &[Rate] {
        match self {
            ShopResult::Best { all, .. } | ShopResult::NoRateAvailable { all } => all,
        }
    }
}

/// Fill defaults for a provider quote.
///
/// Missing price becomes 0 and missing currency `USD`; an unknown ETA stays
/// unknown, which keeps the quote out of the ranking.
pub fn normalize(source: &str, order_id: OrderId, quote: RawQuote, now: DateTime<Utc>) -> Rate {
    Rate {
        id: 0,
        order_id,
        source: source.to_string(),
        carrier: quote.carrier.unwrap_or_else(|| "unknown".to_string()),
        service: quote.service.unwrap_or_default(),
        price: quote.price.unwrap_or(0.0),
        currency: quote.currency.unwrap_or_else(|| "USD".to_string()),
        eta_days: quote.eta_days,
        rate_handle: quote.rate_handle.unwrap_or_default(),
        is_cheapest: false,
        raw: quote.raw,
        created_at: now,
    }
}

/// Fields [`normalize`] fills with a placeholder that a purchase depends on.
pub fn defaulted_fields(quote: &RawQuote) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if quote.price.is_none() {
        missing.push("price");
    }
    if quote.rate_handle.as_deref().is_none_or(str::is_empty) {
        missing.push("rate_handle");
    }
    missing
}

/// Index of the winning rate: lowest price among rates with a known ETA
/// within `max_eta_days`. Ties go to the earliest entry.
pub fn pick_cheapest(rates: &[Rate], max_eta_days: u32) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, rate) in rates.iter().enumerate() {
        if !rate.eta_days.is_some_and(|eta| eta <= max_eta_days) {
            continue;
        }
        // Strictly-less keeps the first of equal prices.
        if best.is_none_or(|b| rate.price.total_cmp(&rates[b].price).is_lt()) {
            best = Some(idx);
        }
    }
    best
}

/// Shops orders across every registered provider.
pub struct RateShopper {
    store: Arc<dyn LabelStore>,
    registry: Arc<ProviderRegistry>,
    audit: AuditLog,
    max_eta_days: u32,
}

impl RateShopper {
    pub fn new(store: Arc<dyn LabelStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            registry,
            audit: AuditLog::disabled(),
            max_eta_days: DEFAULT_MAX_ETA_DAYS,
        }
    }

    pub fn with_max_eta_days(mut self, days: u32) -> Self {
        self.max_eta_days = days;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn max_eta_days(&self) -> u32 {
        self.max_eta_days
    }

    /// Quote `order_id` everywhere, persist the quotes and flag the winner.
    ///
    /// Provider failures are reported and skipped; only store failures and
    /// unknown orders are errors.
    pub fn shop(
        &self,
        order_id: OrderId,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<ShopResult> {
        self.shop_with_limit(order_id, self.max_eta_days, actor, reporter)
    }

    pub fn shop_with_limit(
        &self,
        order_id: OrderId,
        max_eta_days: u32,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<ShopResult> {
        let order = self
            .store
            .get_order(order_id)?
            .with_context(|| format!("order {order_id} not found"))?;
        let request = RateRequest::for_order(&order);
        let now = Utc::now();

        let mut rates = Vec::new();
        let mut defaulted = Vec::new();
        for adapter in self.registry.iter() {
            match adapter.get_rates(&request) {
                Ok(quotes) => {
                    reporter.info(&format!(
                        "{}: {} quote(s) for order {}",
                        adapter.id(),
                        quotes.len(),
                        order_id
                    ));
                    for quote in quotes {
                        defaulted.push(defaulted_fields(&quote));
                        rates.push(normalize(adapter.id(), order_id, quote, now));
                    }
                }
                Err(e) => reporter.warn(&format!(
                    "{}: rate request for order {} failed: {}",
                    adapter.id(),
                    order_id,
                    e
                )),
            }
        }

        let winner = pick_cheapest(&rates, max_eta_days);
        let mut winner_defaults = Vec::new();
        if let Some(idx) = winner {
            rates[idx].is_cheapest = true;
            winner_defaults = defaulted[idx].iter().map(|f| f.to_string()).collect();
        }
        if let Some(idx) = winner
            && !winner_defaults.is_empty()
        {
            reporter.warn(&format!(
                "order {order_id}: cheapest quote from {} is missing {}; its purchase may be rejected",
                rates[idx].source,
                winner_defaults.join(", ")
            ));
        }

        let stored = self
            .store
            .replace_rates(order_id, rates)
            .with_context(|| format!("failed to persist rates for order {order_id}"))?;
        let best = winner.map(|idx| stored[idx].clone());

        self.audit.record(
            EventType::RatesShopped {
                candidates: stored.len(),
                cheapest_source: best.as_ref().map(|r| r.source.clone()),
                cheapest_price: best.as_ref().map(|r| r.price),
                defaulted_fields: winner_defaults,
            },
            Some(order_id),
            actor,
            reporter,
        );

        Ok(match best {
            Some(best) => {
                reporter.info(&format!(
                    "order {}: cheapest {} {} {:.2} {} via {}",
                    order_id, best.carrier, best.service, best.price, best.currency, best.source
                ));
                ShopResult::Best { best, all: stored }
            }
            None => {
                reporter.warn(&format!(
                    "order {order_id}: no rate within {max_eta_days} day(s)"
                ));
                ShopResult::NoRateAvailable { all: stored }
            }
        })
    }
}
