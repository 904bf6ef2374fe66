//! Persistence for orders, rates, shipments, leases, bulk runs and documents.
//!
//! Every mutating operation is a single transaction over [`Tables`]: the
//! backend hands the closure exclusive access, and a closure that returns an
//! error leaves the tables unchanged. Check-then-write rules (one active
//! shipment per order, lease acquisition only on unlocked rows) are enforced
//! inside those closures, never by callers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use labelship_types::{
    BulkRun, FulfillmentStatus, LabelDocument, LabelStatus, Order, OrderId, PrintingStatus, Rate,
    Shipment, ShipmentLabelStatus, UNSHIPPED_ORDER_STATUS, VoidStatus, utc_day,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store failures. These abort an invocation; per-order problems never
/// surface as a `StoreError`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
    #[error("order {0} has no active shipment")]
    NoActiveShipment(OrderId),
    #[error("bulk run {0} not found")]
    RunNotFound(String),
    #[error("store mutex poisoned")]
    Poisoned,
    #[error("store backend failure: {0:#}")]
    Backend(#[source] anyhow::Error),
}

/// Result of a lease acquisition attempt over a set of IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Leases this call took
    pub acquired: Vec<OrderId>,
    /// Already held by someone (including the caller)
    pub already_locked: Vec<OrderId>,
    /// Not present in the store
    pub missing: Vec<OrderId>,
}

/// A lease that was force-released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedLease {
    pub order_id: OrderId,
    pub holder: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Outcome of the transactional purchase write.
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseCommit {
    /// The shipment was inserted and the order updated
    Committed(Shipment),
    /// Another active shipment already existed; nothing was written
    AlreadyLabeled(Shipment),
}

/// The persistence contract used by the pipeline.
pub trait LabelStore: Send + Sync {
    fn upsert_order(&self, order: Order) -> Result<(), StoreError>;
    /// Insert `incoming`, or refresh the marketplace fields of the stored row
    /// while keeping its label, lease and print state. Returns `true` when
    /// the order already existed.
    fn refresh_order(&self, incoming: Order) -> Result<bool, StoreError>;
    fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;
    fn list_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Force-release locked rows whose lease started before `cutoff`.
    /// `ids = None` considers every order.
    fn release_stale_leases(
        &self,
        ids: Option<&[OrderId]>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ReleasedLease>, StoreError>;
    /// Lock every unlocked row in `ids` for `holder`, in one transaction.
    fn try_acquire_leases(
        &self,
        ids: &[OrderId],
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant, StoreError>;
    /// Unlock rows in `ids`; with `holder` set only rows that holder owns.
    fn release_leases(&self, ids: &[OrderId], holder: Option<&str>)
    -> Result<usize, StoreError>;
    /// Restart the lease clock of rows `holder` still holds. Returns the IDs
    /// that were renewed.
    fn renew_leases(
        &self,
        ids: &[OrderId],
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, StoreError>;
    fn lease_status(&self, ids: &[OrderId]) -> Result<BTreeMap<OrderId, bool>, StoreError>;
    fn locked_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Append freshly shopped rates and clear the order's older cheapest flags.
    fn replace_rates(&self, order_id: OrderId, rates: Vec<Rate>) -> Result<Vec<Rate>, StoreError>;
    fn cheapest_rate(&self, order_id: OrderId) -> Result<Option<Rate>, StoreError>;
    fn rates_for_order(&self, order_id: OrderId) -> Result<Vec<Rate>, StoreError>;

    fn active_shipment(&self, order_id: OrderId) -> Result<Option<Shipment>, StoreError>;
    /// Insert `shipment` and mark its order purchased, unless the order
    /// already has an active shipment.
    fn record_purchase(&self, shipment: Shipment) -> Result<PurchaseCommit, StoreError>;
    fn record_failure(&self, order_id: OrderId) -> Result<(), StoreError>;
    fn void_shipment(&self, order_id: OrderId) -> Result<Shipment, StoreError>;
    fn shipments_for_order(&self, order_id: OrderId) -> Result<Vec<Shipment>, StoreError>;
    fn shipments_created_on(&self, day: NaiveDate) -> Result<Vec<Shipment>, StoreError>;

    fn save_bulk_run(&self, run: &BulkRun) -> Result<(), StoreError>;
    fn get_bulk_run(&self, id: &str) -> Result<Option<BulkRun>, StoreError>;
    fn list_bulk_runs(&self) -> Result<Vec<BulkRun>, StoreError>;
    fn mark_mail_sent(&self, id: &str) -> Result<(), StoreError>;

    fn add_label_document(&self, document: LabelDocument) -> Result<LabelDocument, StoreError>;
    fn label_documents_on(
        &self,
        day: NaiveDate,
        kind: &str,
    ) -> Result<Vec<LabelDocument>, StoreError>;
    /// `Default -> AwaitingPrint`; other states are left alone.
    fn mark_awaiting_print(&self, order_id: OrderId) -> Result<bool, StoreError>;
    /// Advance each order to `Printed`. `print_count` goes 0 -> 1 only.
    fn mark_printed(&self, ids: &[OrderId]) -> Result<usize, StoreError>;
}

/// All persisted rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tables {
    pub orders: BTreeMap<OrderId, Order>,
    pub rates: Vec<Rate>,
    pub shipments: Vec<Shipment>,
    pub bulk_runs: Vec<BulkRun>,
    pub documents: Vec<LabelDocument>,
    pub next_rate_id: u64,
    pub next_shipment_id: u64,
    pub next_document_id: u64,
}

impl Tables {
    fn order_mut(&mut self, id: OrderId) -> Result<&mut Order, StoreError> {
        self.orders.get_mut(&id).ok_or(StoreError::OrderNotFound(id))
    }

    fn active_shipment(&self, order_id: OrderId) -> Option<&Shipment> {
        self.shipments
            .iter()
            .find(|s| s.order_id == order_id && s.is_active())
    }

    fn advance_to_awaiting(order: &mut Order) -> bool {
        if order.printing_status == PrintingStatus::Default {
            order.printing_status = PrintingStatus::AwaitingPrint;
            true
        } else {
            false
        }
    }
}

fn clear_lease(order: &mut Order) {
    order.locked = false;
    order.lock_started_at = None;
    order.lock_holder = None;
}

/// A place [`Tables`] live. Implementing this is enough to get a
/// [`LabelStore`].
pub trait TableBackend: Send + Sync {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError>;

    /// Run `f` as one transaction.
    ///
    /// `f` checks its preconditions before it mutates anything, so an error
    /// return leaves the tables as they were. Backends may apply the changes
    /// in place.
    fn write<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, StoreError>,
    ) -> Result<R, StoreError>;
}

impl<B: TableBackend> LabelStore for B {
    fn upsert_order(&self, order: Order) -> Result<(), StoreError> {
        self.write(|t| {
            t.orders.insert(order.id, order);
            Ok(())
        })
    }

    fn refresh_order(&self, incoming: Order) -> Result<bool, StoreError> {
        self.write(|t| match t.orders.get_mut(&incoming.id) {
            Some(existing) => {
                existing.refresh_from(incoming);
                Ok(true)
            }
            None => {
                t.orders.insert(incoming.id, incoming);
                Ok(false)
            }
        })
    }

    fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.read(|t| t.orders.get(&id).cloned())
    }

    fn list_orders(&self) -> Result<Vec<Order>, StoreError> {
        self.read(|t| t.orders.values().cloned().collect())
    }

    fn release_stale_leases(
        &self,
        ids: Option<&[OrderId]>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ReleasedLease>, StoreError> {
        let scope: Option<BTreeSet<OrderId>> = ids.map(|ids| ids.iter().copied().collect());
        self.write(|t| {
            let mut released = Vec::new();
            for order in t.orders.values_mut() {
                if !order.locked {
                    continue;
                }
                if scope.as_ref().is_some_and(|s| !s.contains(&order.id)) {
                    continue;
                }
                // A locked row without a start time cannot be proven fresh.
                let stale = order.lock_started_at.is_none_or(|at| at < cutoff);
                if stale {
                    released.push(ReleasedLease {
                        order_id: order.id,
                        holder: order.lock_holder.clone(),
                        started_at: order.lock_started_at,
                    });
                    clear_lease(order);
                }
            }
            Ok(released)
        })
    }

    fn try_acquire_leases(
        &self,
        ids: &[OrderId],
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant, StoreError> {
        self.write(|t| {
            let mut grant = LeaseGrant::default();
            for &id in ids {
                match t.orders.get_mut(&id) {
                    None => grant.missing.push(id),
                    Some(order) if order.locked => grant.already_locked.push(id),
                    Some(order) => {
                        order.locked = true;
                        order.lock_started_at = Some(now);
                        order.lock_holder = Some(holder.to_string());
                        grant.acquired.push(id);
                    }
                }
            }
            Ok(grant)
        })
    }

    fn release_leases(
        &self,
        ids: &[OrderId],
        holder: Option<&str>,
    ) -> Result<usize, StoreError> {
        self.write(|t| {
            let mut released = 0;
            for id in ids {
                let Some(order) = t.orders.get_mut(id) else {
                    continue;
                };
                if !order.locked {
                    continue;
                }
                if holder.is_some_and(|h| order.lock_holder.as_deref() != Some(h)) {
                    continue;
                }
                clear_lease(order);
                released += 1;
            }
            Ok(released)
        })
    }

    fn renew_leases(
        &self,
        ids: &[OrderId],
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, StoreError> {
        self.write(|t| {
            let mut renewed = Vec::new();
            for id in ids {
                let Some(order) = t.orders.get_mut(id) else {
                    continue;
                };
                if order.locked && order.lock_holder.as_deref() == Some(holder) {
                    order.lock_started_at = Some(now);
                    renewed.push(*id);
                }
            }
            Ok(renewed)
        })
    }

    fn lease_status(&self, ids: &[OrderId]) -> Result<BTreeMap<OrderId, bool>, StoreError> {
        self.read(|t| {
            ids.iter()
                .filter_map(|id| t.orders.get(id).map(|o| (*id, o.locked)))
                .collect()
        })
    }

    fn locked_orders(&self) -> Result<Vec<Order>, StoreError> {
        self.read(|t| t.orders.values().filter(|o| o.locked).cloned().collect())
    }

    fn replace_rates(&self, order_id: OrderId, rates: Vec<Rate>) -> Result<Vec<Rate>, StoreError> {
        self.write(|t| {
            if !t.orders.contains_key(&order_id) {
                return Err(StoreError::OrderNotFound(order_id));
            }
            for existing in t.rates.iter_mut().filter(|r| r.order_id == order_id) {
                existing.is_cheapest = false;
            }
            let mut stored = Vec::with_capacity(rates.len());
            for mut rate in rates {
                t.next_rate_id += 1;
                rate.id = t.next_rate_id;
                rate.order_id = order_id;
                t.rates.push(rate.clone());
                stored.push(rate);
            }
            Ok(stored)
        })
    }

    fn cheapest_rate(&self, order_id: OrderId) -> Result<Option<Rate>, StoreError> {
        self.read(|t| {
            t.rates
                .iter()
                .rev()
                .find(|r| r.order_id == order_id && r.is_cheapest)
                .cloned()
        })
    }

    fn rates_for_order(&self, order_id: OrderId) -> Result<Vec<Rate>, StoreError> {
        self.read(|t| {
            t.rates
                .iter()
                .filter(|r| r.order_id == order_id)
                .cloned()
                .collect()
        })
    }

    fn active_shipment(&self, order_id: OrderId) -> Result<Option<Shipment>, StoreError> {
        self.read(|t| t.active_shipment(order_id).cloned())
    }

    fn record_purchase(&self, shipment: Shipment) -> Result<PurchaseCommit, StoreError> {
        self.write(|t| {
            let order_id = shipment.order_id;
            if !t.orders.contains_key(&order_id) {
                return Err(StoreError::OrderNotFound(order_id));
            }
            if let Some(existing) = t.active_shipment(order_id) {
                return Ok(PurchaseCommit::AlreadyLabeled(existing.clone()));
            }

            let order = t.order_mut(order_id)?;
            order.label_status = LabelStatus::Purchased;
            order.order_status = "Shipped".to_string();
            order.fulfillment_status = FulfillmentStatus::Shipped;
            order.tracking_number = Some(shipment.tracking_number.clone());
            order.shipping_carrier = Some(shipment.carrier.clone());
            order.shipping_cost = Some(shipment.cost);
            Tables::advance_to_awaiting(order);

            let mut shipment = shipment;
            t.next_shipment_id += 1;
            shipment.id = t.next_shipment_id;
            shipment.label_status = ShipmentLabelStatus::Active;
            shipment.void_status = VoidStatus::Active;
            t.shipments.push(shipment.clone());
            Ok(PurchaseCommit::Committed(shipment))
        })
    }

    fn record_failure(&self, order_id: OrderId) -> Result<(), StoreError> {
        self.write(|t| {
            let order = t.order_mut(order_id)?;
            order.label_status = LabelStatus::Failed;
            order.order_status = UNSHIPPED_ORDER_STATUS.to_string();
            order.fulfillment_status = FulfillmentStatus::Pending;
            Ok(())
        })
    }

    fn void_shipment(&self, order_id: OrderId) -> Result<Shipment, StoreError> {
        self.write(|t| {
            if !t.orders.contains_key(&order_id) {
                return Err(StoreError::OrderNotFound(order_id));
            }
            let shipment = t
                .shipments
                .iter_mut()
                .find(|s| s.order_id == order_id && s.is_active())
                .ok_or(StoreError::NoActiveShipment(order_id))?;
            shipment.label_status = ShipmentLabelStatus::Voided;
            shipment.void_status = VoidStatus::Cancelled;
            let voided = shipment.clone();

            let order = t.order_mut(order_id)?;
            order.label_status = LabelStatus::Voided;
            order.order_status = UNSHIPPED_ORDER_STATUS.to_string();
            order.fulfillment_status = FulfillmentStatus::Pending;
            Ok(voided)
        })
    }

    fn shipments_for_order(&self, order_id: OrderId) -> Result<Vec<Shipment>, StoreError> {
        self.read(|t| {
            t.shipments
                .iter()
                .filter(|s| s.order_id == order_id)
                .cloned()
                .collect()
        })
    }

    fn shipments_created_on(&self, day: NaiveDate) -> Result<Vec<Shipment>, StoreError> {
        self.read(|t| {
            t.shipments
                .iter()
                .filter(|s| utc_day(s.created_at) == day)
                .cloned()
                .collect()
        })
    }

    fn save_bulk_run(&self, run: &BulkRun) -> Result<(), StoreError> {
        self.write(|t| {
            match t.bulk_runs.iter_mut().find(|r| r.id == run.id) {
                Some(existing) => *existing = run.clone(),
                None => t.bulk_runs.push(run.clone()),
            }
            Ok(())
        })
    }

    fn get_bulk_run(&self, id: &str) -> Result<Option<BulkRun>, StoreError> {
        self.read(|t| t.bulk_runs.iter().find(|r| r.id == id).cloned())
    }

    fn list_bulk_runs(&self) -> Result<Vec<BulkRun>, StoreError> {
        self.read(|t| t.bulk_runs.clone())
    }

    fn mark_mail_sent(&self, id: &str) -> Result<(), StoreError> {
        self.write(|t| {
            let run = t
                .bulk_runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::RunNotFound(id.to_string()))?;
            run.mail_sent = true;
            Ok(())
        })
    }

    fn add_label_document(&self, document: LabelDocument) -> Result<LabelDocument, StoreError> {
        self.write(|t| {
            if let Some(order_id) = document.order_id
                && !t.orders.contains_key(&order_id)
            {
                return Err(StoreError::OrderNotFound(order_id));
            }
            let mut document = document;
            t.next_document_id += 1;
            document.id = t.next_document_id;
            t.documents.push(document.clone());
            Ok(document)
        })
    }

    fn label_documents_on(
        &self,
        day: NaiveDate,
        kind: &str,
    ) -> Result<Vec<LabelDocument>, StoreError> {
        self.read(|t| {
            t.documents
                .iter()
                .filter(|d| d.kind == kind && utc_day(d.uploaded_at) == day)
                .cloned()
                .collect()
        })
    }

    fn mark_awaiting_print(&self, order_id: OrderId) -> Result<bool, StoreError> {
        self.write(|t| Ok(Tables::advance_to_awaiting(t.order_mut(order_id)?)))
    }

    fn mark_printed(&self, ids: &[OrderId]) -> Result<usize, StoreError> {
        self.write(|t| {
            let mut changed = 0;
            for id in ids {
                let Some(order) = t.orders.get_mut(id) else {
                    continue;
                };
                if order.printing_status != PrintingStatus::Printed {
                    order.printing_status = PrintingStatus::Printed;
                    changed += 1;
                }
                if order.print_count == 0 {
                    order.print_count = 1;
                }
            }
            Ok(changed)
        })
    }
}

/// In-process store. Writes are serialized by a mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orders(orders: impl IntoIterator<Item = Order>) -> Self {
        let mut tables = Tables::default();
        for order in orders {
            tables.orders.insert(order.id, order);
        }
        Self {
            tables: Mutex::new(tables),
        }
    }
}

impl TableBackend for MemoryStore {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
        let guard = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard))
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn store_with(ids: &[OrderId]) -> MemoryStore {
        MemoryStore::with_orders(ids.iter().map(|id| Order::new(*id, "amazon", &format!("A-{id}"))))
    }

    fn shipment(order_id: OrderId, tracking: &str) -> Shipment {
        Shipment {
            id: 0,
            order_id,
            source: "alpha".into(),
            tracking_number: tracking.into(),
            carrier: "usps".into(),
            service: "priority".into(),
            label_id: format!("L-{tracking}"),
            label_url: format!("https://labels.example/{tracking}.pdf"),
            label_status: ShipmentLabelStatus::Active,
            void_status: VoidStatus::Active,
            cost: 7.25,
            currency: "USD".into(),
            created_by: "tester".into(),
            created_at: Utc::now(),
        }
    }

    fn rate(order_id: OrderId, price: f64, cheapest: bool) -> Rate {
        Rate {
            id: 0,
            order_id,
            source: "alpha".into(),
            carrier: "usps".into(),
            service: "ground".into(),
            price,
            currency: "USD".into(),
            eta_days: Some(3),
            rate_handle: format!("h-{price}"),
            is_cheapest: cheapest,
            raw: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn acquire_partitions_ids() {
        let store = store_with(&[1, 2, 3]);
        let now = Utc::now();
        let first = store.try_acquire_leases(&[1, 2], "w1", now).expect("acquire");
        assert_eq!(first.acquired, vec![1, 2]);

        let second = store
            .try_acquire_leases(&[2, 3, 9], "w2", now)
            .expect("acquire");
        assert_eq!(second.acquired, vec![3]);
        assert_eq!(second.already_locked, vec![2]);
        assert_eq!(second.missing, vec![9]);

        let order = store.get_order(3).expect("get").expect("order");
        assert_eq!(order.lock_holder.as_deref(), Some("w2"));
        assert_eq!(order.lock_started_at, Some(now));
    }

    #[test]
    fn release_respects_holder_and_is_idempotent() {
        let store = store_with(&[1, 2]);
        store
            .try_acquire_leases(&[1, 2], "w1", Utc::now())
            .expect("acquire");

        assert_eq!(store.release_leases(&[1, 2], Some("w2")).expect("release"), 0);
        assert_eq!(store.release_leases(&[1], Some("w1")).expect("release"), 1);
        assert_eq!(store.release_leases(&[1], Some("w1")).expect("release"), 0);
        assert_eq!(store.release_leases(&[2], None).expect("force"), 1);

        let status = store.lease_status(&[1, 2, 42]).expect("status");
        assert_eq!(status.get(&1), Some(&false));
        assert_eq!(status.get(&2), Some(&false));
        assert!(!status.contains_key(&42));
    }

    #[test]
    fn stale_leases_are_released_by_cutoff() {
        let store = store_with(&[1, 2, 3]);
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let fresh = old + ChronoDuration::minutes(30);
        store.try_acquire_leases(&[1], "crashed", old).expect("acquire");
        store.try_acquire_leases(&[2], "alive", fresh).expect("acquire");

        let cutoff = old + ChronoDuration::minutes(5);
        let released = store.release_stale_leases(None, cutoff).expect("sweep");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].order_id, 1);
        assert_eq!(released[0].holder.as_deref(), Some("crashed"));

        let status = store.lease_status(&[1, 2]).expect("status");
        assert!(!status[&1]);
        assert!(status[&2]);
    }

    #[test]
    fn stale_release_honours_scope() {
        let store = store_with(&[1, 2]);
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        store.try_acquire_leases(&[1, 2], "crashed", old).expect("acquire");

        let released = store
            .release_stale_leases(Some(&[2]), old + ChronoDuration::hours(1))
            .expect("release");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].order_id, 2);
        assert_eq!(store.locked_orders().expect("locked").len(), 1);
    }

    #[test]
    fn record_purchase_enforces_single_active_shipment() {
        let store = store_with(&[1]);
        let first = store.record_purchase(shipment(1, "T1")).expect("purchase");
        let PurchaseCommit::Committed(committed) = first else {
            panic!("expected commit");
        };
        assert_eq!(committed.id, 1);

        let second = store.record_purchase(shipment(1, "T2")).expect("purchase");
        match second {
            PurchaseCommit::AlreadyLabeled(existing) => assert_eq!(existing.tracking_number, "T1"),
            other => panic!("expected AlreadyLabeled, got {other:?}"),
        }
        assert_eq!(store.shipments_for_order(1).expect("list").len(), 1);

        let order = store.get_order(1).expect("get").expect("order");
        assert_eq!(order.label_status, LabelStatus::Purchased);
        assert_eq!(order.fulfillment_status, FulfillmentStatus::Shipped);
        assert_eq!(order.tracking_number.as_deref(), Some("T1"));
        assert_eq!(order.printing_status, PrintingStatus::AwaitingPrint);
    }

    #[test]
    fn void_allows_a_new_purchase() {
        let store = store_with(&[1]);
        store.record_purchase(shipment(1, "T1")).expect("purchase");
        let voided = store.void_shipment(1).expect("void");
        assert_eq!(voided.void_status, VoidStatus::Cancelled);
        assert_eq!(
            store.get_order(1).expect("get").expect("order").label_status,
            LabelStatus::Voided
        );
        assert!(store.active_shipment(1).expect("active").is_none());
        assert!(matches!(
            store.void_shipment(1),
            Err(StoreError::NoActiveShipment(1))
        ));

        let again = store.record_purchase(shipment(1, "T2")).expect("purchase");
        assert!(matches!(again, PurchaseCommit::Committed(_)));
    }

    #[test]
    fn record_failure_resets_fulfillment() {
        let store = store_with(&[1]);
        store.record_failure(1).expect("failure");
        let order = store.get_order(1).expect("get").expect("order");
        assert_eq!(order.label_status, LabelStatus::Failed);
        assert_eq!(order.order_status, "unshipped");
        assert_eq!(order.fulfillment_status, FulfillmentStatus::Pending);
        assert!(matches!(
            store.record_failure(99),
            Err(StoreError::OrderNotFound(99))
        ));
    }

    #[test]
    fn replace_rates_keeps_one_cheapest_flag() {
        let store = store_with(&[1]);
        store
            .replace_rates(1, vec![rate(1, 5.0, true), rate(1, 6.0, false)])
            .expect("rates");
        let stored = store
            .replace_rates(1, vec![rate(1, 4.0, true)])
            .expect("rates");
        assert_eq!(stored[0].id, 3);

        let all = store.rates_for_order(1).expect("rates");
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().filter(|r| r.is_cheapest).count(), 1);
        assert_eq!(store.cheapest_rate(1).expect("cheapest").map(|r| r.price), Some(4.0));

        store.replace_rates(1, Vec::new()).expect("rates");
        assert!(store.cheapest_rate(1).expect("cheapest").is_none());
    }

    #[test]
    fn failed_operations_leave_tables_untouched() {
        let store = store_with(&[1]);
        let before = store.read(|t| t.clone()).expect("read");

        assert!(matches!(
            store.void_shipment(1),
            Err(StoreError::NoActiveShipment(1))
        ));
        assert!(matches!(
            store.record_purchase(shipment(9, "T9")),
            Err(StoreError::OrderNotFound(9))
        ));
        assert!(matches!(
            store.replace_rates(9, vec![rate(9, 1.0, true)]),
            Err(StoreError::OrderNotFound(9))
        ));
        let orphan = LabelDocument {
            id: 0,
            order_id: Some(9),
            url: "https://docs.example/9.pdf".into(),
            kind: "shipping".into(),
            uploaded_at: Utc::now(),
        };
        assert!(store.add_label_document(orphan).is_err());

        store
            .read(|t| {
                assert_eq!(t.orders, before.orders);
                assert!(t.shipments.is_empty());
                assert!(t.rates.is_empty());
                assert!(t.documents.is_empty());
                assert_eq!(t.next_shipment_id, 0);
                assert_eq!(t.next_rate_id, 0);
                assert_eq!(t.next_document_id, 0);
            })
            .expect("read");
    }

    #[test]
    fn refresh_keeps_a_lease_taken_after_the_import_read() {
        let store = store_with(&[7]);
        // The importer's copy is read before another worker leases the row.
        let mut incoming = store.get_order(7).expect("get").expect("order");
        let grant = store
            .try_acquire_leases(&[7], "w2", Utc::now())
            .expect("acquire");
        assert_eq!(grant.acquired, vec![7]);

        incoming.store_id = "store-9".into();
        assert!(store.refresh_order(incoming).expect("refresh"));

        let after = store.get_order(7).expect("get").expect("order");
        assert!(after.locked);
        assert_eq!(after.lock_holder.as_deref(), Some("w2"));
        assert_eq!(after.store_id, "store-9");
    }

    #[test]
    fn refresh_inserts_unknown_orders() {
        let store = store_with(&[]);
        assert!(!store.refresh_order(Order::new(3, "ebay", "E-3")).expect("refresh"));
        assert!(store.get_order(3).expect("get").is_some());
    }

    #[test]
    fn print_state_only_moves_forward() {
        let store = store_with(&[1, 2]);
        assert!(store.mark_awaiting_print(1).expect("awaiting"));
        assert_eq!(store.mark_printed(&[1, 2, 77]).expect("printed"), 2);
        assert!(!store.mark_awaiting_print(1).expect("awaiting"));

        let order = store.get_order(1).expect("get").expect("order");
        assert_eq!(order.printing_status, PrintingStatus::Printed);
        assert_eq!(order.print_count, 1);

        assert_eq!(store.mark_printed(&[1]).expect("printed"), 0);
        assert_eq!(
            store.get_order(1).expect("get").expect("order").print_count,
            1
        );
    }

    #[test]
    fn mark_mail_sent_requires_known_run() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.mark_mail_sent("nope"),
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[test]
    fn documents_filter_by_day_and_kind() {
        let store = store_with(&[1]);
        let day = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        for (kind, at) in [
            ("shipping", day),
            ("packing_slip", day),
            ("shipping", day + ChronoDuration::days(1)),
        ] {
            store
                .add_label_document(LabelDocument {
                    id: 0,
                    order_id: Some(1),
                    url: format!("file:///tmp/{kind}.pdf"),
                    kind: kind.into(),
                    uploaded_at: at,
                })
                .expect("add");
        }
        let docs = store
            .label_documents_on(day.date_naive(), "shipping")
            .expect("docs");
        assert_eq!(docs.len(), 1);

        let orphan = LabelDocument {
            id: 0,
            order_id: Some(404),
            url: "file:///tmp/x.pdf".into(),
            kind: "shipping".into(),
            uploaded_at: day,
        };
        assert!(store.add_label_document(orphan).is_err());
    }
}
