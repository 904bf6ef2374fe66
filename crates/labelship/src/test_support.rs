//! Scripted collaborators shared by the unit, property and stress tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use labelship_retry::RetryStrategyConfig;
use labelship_types::{LineItem, Order, OrderId, RawQuote};
use lopdf::{Document, Object, Stream, dictionary};

use crate::provider::{LabelResult, ProviderAdapter, ProviderError, PurchaseRequest, RateRequest};

pub(crate) fn quote(carrier: &str, price: f64, eta_days: Option<u32>) -> RawQuote {
    RawQuote {
        carrier: Some(carrier.to_string()),
        service: Some("ground".to_string()),
        price: Some(price),
        currency: Some("USD".to_string()),
        eta_days,
        rate_handle: Some(format!("{carrier}-{price}")),
        raw: serde_json::json!({ "carrier": carrier, "amount": price }),
    }
}

pub(crate) fn order_with_skus(id: OrderId, skus: &[&str]) -> Order {
    let mut order = Order::new(id, "amazon", &format!("AMZ-{id}"));
    order.items = skus
        .iter()
        .map(|sku| LineItem {
            sku: sku.to_string(),
            quantity: 1,
            title: String::new(),
        })
        .collect();
    order
}

pub(crate) fn http_error(status: u16) -> ProviderError {
    ProviderError::Http {
        status,
        message: format!("status {status}"),
        raw: Some(format!("{{\"status\":{status}}}")),
    }
}

/// A one-page PDF whose MediaBox lives on the page tree root.
pub(crate) fn one_page_pdf() -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(dictionary! {}, b"BT ET".to_vec()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), 288.into(), 432.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save pdf");
    bytes
}

type PurchaseHook = Box<dyn Fn(OrderId) + Send + Sync>;

/// In-process provider with scripted answers and call counters.
pub(crate) struct ScriptedProvider {
    id: String,
    quotes: Vec<RawQuote>,
    rates_fail: bool,
    purchases: Mutex<VecDeque<Result<LabelResult, ProviderError>>>,
    void_answer: bool,
    retry: RetryStrategyConfig,
    latency: Duration,
    purchase_hook: Option<PurchaseHook>,
    rate_calls: AtomicUsize,
    purchase_calls: AtomicUsize,
    void_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            quotes: Vec::new(),
            rates_fail: false,
            purchases: Mutex::new(VecDeque::new()),
            void_answer: true,
            retry: RetryStrategyConfig::fail_fast(),
            latency: Duration::ZERO,
            purchase_hook: None,
            rate_calls: AtomicUsize::new(0),
            purchase_calls: AtomicUsize::new(0),
            void_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_quote(mut self, quote: RawQuote) -> Self {
        self.quotes.push(quote);
        self
    }

    pub(crate) fn failing_rates(mut self) -> Self {
        self.rates_fail = true;
        self
    }

    /// Queue one purchase answer; once the queue drains purchases succeed.
    pub(crate) fn then_purchase(self, answer: Result<LabelResult, ProviderError>) -> Self {
        self.purchases
            .lock()
            .expect("purchase script")
            .push_back(answer);
        self
    }

    pub(crate) fn refusing_void(mut self) -> Self {
        self.void_answer = false;
        self
    }

    pub(crate) fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Run `hook` while a purchase is in flight, after the order was checked
    /// for an existing label and before the answer is returned.
    pub(crate) fn on_purchase(mut self, hook: impl Fn(OrderId) + Send + Sync + 'static) -> Self {
        self.purchase_hook = Some(Box::new(hook));
        self
    }

    pub(crate) fn rate_calls(&self) -> usize {
        self.rate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn purchase_calls(&self) -> usize {
        self.purchase_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn void_calls(&self) -> usize {
        self.void_calls.load(Ordering::SeqCst)
    }
}

impl ProviderAdapter for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_rates(&self, _request: &RateRequest) -> Result<Vec<RawQuote>, ProviderError> {
        self.rate_calls.fetch_add(1, Ordering::SeqCst);
        if self.rates_fail {
            return Err(http_error(500));
        }
        Ok(self.quotes.clone())
    }

    fn purchase_label(&self, request: &PurchaseRequest) -> Result<LabelResult, ProviderError> {
        let n = self.purchase_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if let Some(hook) = &self.purchase_hook {
            hook(request.order_id);
        }
        if let Some(answer) = self.purchases.lock().expect("purchase script").pop_front() {
            return answer;
        }
        Ok(LabelResult {
            tracking_number: format!("{}-TRK-{}-{n}", self.id, request.order_id),
            label_id: format!("{}-L-{}-{n}", self.id, request.order_id),
            label_url: format!("https://labels.example/{}/{}-{n}.pdf", self.id, request.order_id),
            carrier: None,
            cost: None,
            currency: None,
            raw: serde_json::Value::Null,
        })
    }

    fn void_label(&self, _label_id: &str) -> Result<bool, ProviderError> {
        self.void_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.void_answer)
    }

    fn retry_policy(&self) -> RetryStrategyConfig {
        self.retry.clone()
    }
}
