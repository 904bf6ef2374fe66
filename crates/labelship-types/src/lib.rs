//! Core domain types for labelship.
//!
//! This crate provides the records shared across the labelship workspace:
//! orders and their lease fields, normalized rates, purchased shipments,
//! bulk-run audit records, and the transaction-log event shapes.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned order identity.
pub type OrderId = u64;

/// Label lifecycle of an order, owned by the purchase pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelStatus {
    /// No label has been purchased yet
    #[default]
    Unshipped,
    /// A label was purchased and is active
    Purchased,
    /// The last purchase attempt failed
    Failed,
    /// The purchased label was voided
    Voided,
}

impl std::fmt::Display for LabelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelStatus::Unshipped => write!(f, "unshipped"),
            LabelStatus::Purchased => write!(f, "purchased"),
            LabelStatus::Failed => write!(f, "failed"),
            LabelStatus::Voided => write!(f, "voided"),
        }
    }
}

/// Marketplace-facing fulfillment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    #[default]
    Pending,
    Shipped,
}

/// Print state machine: `Default|AwaitingPrint -> Printed`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintingStatus {
    #[default]
    Default,
    AwaitingPrint,
    Printed,
}

impl PrintingStatus {
    /// Numeric code used by reports (0, 1, 2).
    pub fn code(self) -> u8 {
        match self {
            PrintingStatus::Default => 0,
            PrintingStatus::AwaitingPrint => 1,
            PrintingStatus::Printed => 2,
        }
    }
}

/// Postal address. Every field is optional upstream, so everything defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    pub name: String,
    pub company: String,
    pub street1: String,
    pub street2: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub phone: String,
}

/// Physical package dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parcel {
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub weight: f64,
    /// Distance unit for length/width/height (e.g. "in", "cm")
    pub distance_unit: String,
    /// Mass unit for weight (e.g. "lb", "oz", "kg")
    pub mass_unit: String,
}

impl Default for Parcel {
    fn default() -> Self {
        Self {
            length: 0.0,
            width: 0.0,
            height: 0.0,
            weight: 0.0,
            distance_unit: "in".to_string(),
            mass_unit: "lb".to_string(),
        }
    }
}

/// One line of a marketplace order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub title: String,
}

fn default_quantity() -> u32 {
    1
}

/// One purchasable shipment unit.
///
/// Created by marketplace ingestion; the label, lease and print fields are
/// owned by this workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub marketplace: String,
    pub marketplace_order_id: String,
    #[serde(default)]
    pub store_id: String,
    #[serde(default)]
    pub ship_from: Address,
    #[serde(default)]
    pub ship_to: Address,
    #[serde(default)]
    pub parcel: Parcel,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub label_status: LabelStatus,
    #[serde(default = "default_order_status")]
    pub order_status: String,
    #[serde(default)]
    pub fulfillment_status: FulfillmentStatus,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub shipping_carrier: Option<String>,
    #[serde(default)]
    pub shipping_cost: Option<f64>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub lock_started_at: Option<DateTime<Utc>>,
    /// Token of the worker holding the lease, if any
    #[serde(default)]
    pub lock_holder: Option<String>,
    #[serde(default)]
    pub printing_status: PrintingStatus,
    #[serde(default)]
    pub print_count: u32,
}

/// `order_status` of an order that still needs a label.
pub const UNSHIPPED_ORDER_STATUS: &str = "unshipped";

fn default_order_status() -> String {
    UNSHIPPED_ORDER_STATUS.to_string()
}

impl Order {
    /// Minimal order for a marketplace reference; everything else defaults.
    pub fn new(id: OrderId, marketplace: &str, marketplace_order_id: &str) -> Self {
        Self {
            id,
            marketplace: marketplace.to_string(),
            marketplace_order_id: marketplace_order_id.to_string(),
            store_id: String::new(),
            ship_from: Address::default(),
            ship_to: Address::default(),
            parcel: Parcel::default(),
            items: Vec::new(),
            label_status: LabelStatus::Unshipped,
            order_status: default_order_status(),
            fulfillment_status: FulfillmentStatus::Pending,
            tracking_number: None,
            shipping_carrier: None,
            shipping_cost: None,
            locked: false,
            lock_started_at: None,
            lock_holder: None,
            printing_status: PrintingStatus::Default,
            print_count: 0,
        }
    }

    /// Distinct SKUs across the order's line items (blank SKUs ignored).
    pub fn distinct_skus(&self) -> BTreeSet<&str> {
        self.items
            .iter()
            .map(|item| item.sku.trim())
            .filter(|sku| !sku.is_empty())
            .collect()
    }

    pub fn is_multi_sku(&self) -> bool {
        self.distinct_skus().len() > 1
    }

    /// Take the marketplace-owned fields from a re-ingested copy of this
    /// order. Label, lease and print state stay as they are.
    pub fn refresh_from(&mut self, incoming: Order) {
        self.marketplace = incoming.marketplace;
        self.marketplace_order_id = incoming.marketplace_order_id;
        self.store_id = incoming.store_id;
        self.ship_from = incoming.ship_from;
        self.ship_to = incoming.ship_to;
        self.parcel = incoming.parcel;
        self.items = incoming.items;
    }
}

/// A quote exactly as one provider adapter reported it.
///
/// Every field may be missing; normalization into [`Rate`] fills defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawQuote {
    pub carrier: Option<String>,
    pub service: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub eta_days: Option<u32>,
    pub rate_handle: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// A normalized, persisted quote for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    /// Store-assigned identity (0 until persisted)
    #[serde(default)]
    pub id: u64,
    pub order_id: OrderId,
    /// Provider identifier the quote came from
    pub source: String,
    pub carrier: String,
    pub service: String,
    pub price: f64,
    pub currency: String,
    /// Transit estimate; `None` when the provider did not say
    pub eta_days: Option<u32>,
    /// Opaque provider token needed to purchase this quote
    pub rate_handle: String,
    pub is_cheapest: bool,
    #[serde(default)]
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Label state of a shipment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentLabelStatus {
    #[default]
    Active,
    Voided,
}

/// Void state of a shipment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidStatus {
    #[default]
    Active,
    Cancelled,
}

/// A purchased label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    #[serde(default)]
    pub id: u64,
    pub order_id: OrderId,
    /// Provider that sold the label
    pub source: String,
    pub tracking_number: String,
    pub carrier: String,
    #[serde(default)]
    pub service: String,
    pub label_id: String,
    pub label_url: String,
    #[serde(default)]
    pub label_status: ShipmentLabelStatus,
    #[serde(default)]
    pub void_status: VoidStatus,
    pub cost: f64,
    pub currency: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Shipment {
    /// Active and not voided: the only shape the one-per-order rule counts.
    pub fn is_active(&self) -> bool {
        self.label_status == ShipmentLabelStatus::Active && self.void_status == VoidStatus::Active
    }
}

/// A manually uploaded label document that participates in print merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDocument {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    pub url: String,
    /// Document kind tag; purchased shipment labels are `shipping`
    #[serde(default = "default_document_kind")]
    pub kind: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Kind tag carried by purchased shipment labels.
pub const SHIPPING_KIND: &str = "shipping";

fn default_document_kind() -> String {
    SHIPPING_KIND.to_string()
}

/// Why one order of a batch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The order ID does not exist in the store
    OrderNotFound,
    /// No persisted cheapest rate for the order
    NoRateFound,
    /// The rate names a provider that is not registered
    UnknownProvider,
    /// The provider rejected the purchase or answered with garbage
    Provider,
    /// Transient provider errors outlasted the retry policy
    RetriesExhausted,
    /// The batch deadline passed before the order was started
    DeadlineExceeded,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::OrderNotFound => write!(f, "order_not_found"),
            FailureKind::NoRateFound => write!(f, "no_rate_found"),
            FailureKind::UnknownProvider => write!(f, "unknown_provider"),
            FailureKind::Provider => write!(f, "provider"),
            FailureKind::RetriesExhausted => write!(f, "retries_exhausted"),
            FailureKind::DeadlineExceeded => write!(f, "deadline_exceeded"),
        }
    }
}

/// Per-order result of a bulk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OrderOutcome {
    /// A new label was bought and recorded
    Purchased {
        shipment_id: u64,
        source: String,
        tracking_number: String,
        carrier: String,
        label_url: String,
        cost: f64,
        retries_attempted: u32,
        /// Set when the marketplace tracking push failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_warning: Option<String>,
        #[serde(default)]
        notified: bool,
    },
    /// The order already had an active label; no provider was called
    Skipped {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_number: Option<String>,
    },
    /// The order could not be labeled in this run
    Failed {
        kind: FailureKind,
        message: String,
        #[serde(default)]
        retries_attempted: u32,
        /// Provider's raw error payload, kept for audit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
}

impl OrderOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, OrderOutcome::Failed { .. })
    }
}

/// Outcome of one order within a bulk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: OrderId,
    #[serde(flatten)]
    pub outcome: OrderOutcome,
}

/// Summary status of a bulk run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every processed order succeeded (purchased or skipped)
    Completed,
    /// At least one processed order failed
    Partial,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Partial => write!(f, "partial"),
        }
    }
}

/// Audit record of one orchestrator invocation.
///
/// `order_ids` lists the orders this run processed; orders another worker
/// held a lease on are reported in `locked_out_order_ids` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRun {
    pub id: String,
    pub created_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested_order_ids: Vec<OrderId>,
    pub order_ids: Vec<OrderId>,
    pub providers_used: Vec<String>,
    pub processed_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub success_order_ids: Vec<OrderId>,
    pub failed_order_ids: Vec<OrderId>,
    #[serde(default)]
    pub locked_out_order_ids: Vec<OrderId>,
    pub results: Vec<OrderResult>,
    #[serde(default)]
    pub merged_artifact_url: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub mail_sent: bool,
    #[serde(default)]
    pub deadline_exceeded: bool,
}

impl BulkRun {
    /// Every processed order failed and nothing else happened.
    pub fn all_failed(&self) -> bool {
        self.processed_count > 0 && self.success_count == 0
    }
}

/// Transaction-log event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    /// Rates were shopped for an order
    RatesShopped {
        candidates: usize,
        cheapest_source: Option<String>,
        cheapest_price: Option<f64>,
        /// Fields of the winning quote the provider left out
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        defaulted_fields: Vec<String>,
    },
    /// A stale lease was force-released
    LeaseRecovered { holder: Option<String> },
    /// A label was bought
    LabelPurchased {
        source: String,
        tracking_number: String,
        cost: f64,
        retries_attempted: u32,
    },
    /// A purchase attempt failed
    LabelFailed {
        source: Option<String>,
        kind: FailureKind,
        message: String,
        raw: Option<String>,
    },
    /// Marketplace tracking push failed (label still valid)
    TrackingSyncFailed { message: String },
    /// A label was voided
    LabelVoided { label_id: String },
    /// Labels were merged or printed
    LabelsPrinted {
        artifact_url: String,
        documents: usize,
    },
    /// A bulk run finished
    BulkRunRecorded {
        run_id: String,
        status: RunStatus,
        success_count: usize,
        failed_count: usize,
    },
}

/// One row of the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Order this event relates to (`None` for batch-level events)
    #[serde(default)]
    pub order_id: Option<OrderId>,
    /// Who or what triggered the event
    #[serde(default)]
    pub actor: String,
}

/// Calendar day a timestamp falls on, in UTC.
pub fn utc_day(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}
