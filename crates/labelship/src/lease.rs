//! Order leases: exclusive, expiring claims that keep concurrent workers off
//! the same order.
//!
//! A lease is a set of fields on the order row (`locked`, `lock_started_at`,
//! `lock_holder`), so it is visible to every process sharing the store and
//! survives the worker that took it. Leases left behind by a crashed worker
//! are reclaimed once they are older than the configured timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use labelship_types::OrderId;

use crate::store::{LabelStore, ReleasedLease, StoreError};

/// Default age after which the acquisition path reclaims a lease.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default age after which `sweep` reclaims a lease.
pub const DEFAULT_SWEEP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// What one `acquire` call got.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acquisition {
    pub acquired: Vec<OrderId>,
    /// Held by another live worker
    pub already_locked: Vec<OrderId>,
    /// Stale leases that were force-released before acquiring
    pub recovered: Vec<ReleasedLease>,
    pub missing: Vec<OrderId>,
}

/// Unique token for this process: `hostname:pid:nonce`.
pub fn holder_token() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    format!("{}:{}:{:08x}", host, std::process::id(), rand::random::<u32>())
}

/// `now - age`, saturating at the earliest representable instant.
pub fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Acquires and releases leases on behalf of one holder.
pub struct LeaseManager {
    store: Arc<dyn LabelStore>,
    holder: String,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LabelStore>) -> Self {
        Self::with_holder(store, &holder_token())
    }

    pub fn with_holder(store: Arc<dyn LabelStore>, holder: &str) -> Self {
        Self {
            store,
            holder: holder.to_string(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Reclaim stale leases among `ids`, then lock every unlocked one.
    ///
    /// IDs are processed once each, in first-seen order.
    pub fn acquire(
        &self,
        ids: &[OrderId],
        lease_timeout: Duration,
    ) -> Result<Acquisition, StoreError> {
        self.acquire_at(ids, lease_timeout, Utc::now())
    }

    pub fn acquire_at(
        &self,
        ids: &[OrderId],
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Acquisition, StoreError> {
        let ids = dedupe(ids);
        let recovered = self
            .store
            .release_stale_leases(Some(&ids), cutoff(now, lease_timeout))?;
        let grant = self.store.try_acquire_leases(&ids, &self.holder, now)?;
        Ok(Acquisition {
            acquired: grant.acquired,
            already_locked: grant.already_locked,
            recovered,
            missing: grant.missing,
        })
    }

    /// Restart the clock on a lease this holder still owns, so a long batch
    /// does not age out the orders it has not reached yet. `false` means the
    /// lease was lost.
    pub fn renew(&self, id: OrderId) -> Result<bool, StoreError> {
        self.renew_at(id, Utc::now())
    }

    pub fn renew_at(&self, id: OrderId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(!self.store.renew_leases(&[id], &self.holder, now)?.is_empty())
    }

    /// Release leases this holder owns. Releasing twice is harmless.
    pub fn release(&self, ids: &[OrderId]) -> Result<usize, StoreError> {
        self.store.release_leases(ids, Some(&self.holder))
    }

    /// Release leases whoever holds them.
    pub fn force_release(&self, ids: &[OrderId]) -> Result<usize, StoreError> {
        self.store.release_leases(ids, None)
    }

    pub fn status(&self, ids: &[OrderId]) -> Result<BTreeMap<OrderId, bool>, StoreError> {
        self.store.lease_status(ids)
    }

    /// Release every lease in the store older than `stale_after`.
    pub fn sweep(&self, stale_after: Duration) -> Result<Vec<ReleasedLease>, StoreError> {
        self.store
            .release_stale_leases(None, cutoff(Utc::now(), stale_after))
    }
}

pub(crate) fn dedupe(ids: &[OrderId]) -> Vec<OrderId> {
    let mut seen = std::collections::BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
