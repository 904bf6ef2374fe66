//! Tracking-number push back to the marketplace.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use labelship_config::{MarketplaceConfig, resolve_secret};
use labelship_types::{Order, OrderId, Shipment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingUpdate {
    pub order_id: OrderId,
    pub marketplace: String,
    pub marketplace_order_id: String,
    pub store_id: String,
    pub tracking_number: String,
    pub carrier: String,
    pub service: String,
    pub shipped_at: DateTime<Utc>,
}

impl TrackingUpdate {
    pub fn new(order: &Order, shipment: &Shipment) -> Self {
        Self {
            order_id: order.id,
            marketplace: order.marketplace.clone(),
            marketplace_order_id: order.marketplace_order_id.clone(),
            store_id: order.store_id.clone(),
            tracking_number: shipment.tracking_number.clone(),
            carrier: shipment.carrier.clone(),
            service: shipment.service.clone(),
            shipped_at: shipment.created_at,
        }
    }
}

pub trait MarketplaceSync: Send + Sync {
    /// `Ok(false)` means the marketplace answered but did not accept the update.
    fn push_tracking(&self, update: &TrackingUpdate) -> Result<bool>;
}

/// Used when no marketplace endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

impl MarketplaceSync for NoopSync {
    fn push_tracking(&self, _update: &TrackingUpdate) -> Result<bool> {
        Ok(true)
    }
}

/// POSTs each update as JSON to one endpoint.
#[derive(Debug, Clone)]
pub struct HttpMarketplaceSync {
    client: reqwest::blocking::Client,
    url: String,
    token: Option<String>,
}

impl HttpMarketplaceSync {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build marketplace HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            token,
        })
    }

    pub fn from_config(config: &MarketplaceConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("marketplace.url is required when marketplace sync is enabled")?;
        let token = config.token.as_deref().map(resolve_secret).transpose()?;
        Self::new(url, token, config.timeout)
    }
}

#[derive(Deserialize)]
struct SyncAnswer {
    #[serde(default = "accepted_by_default")]
    accepted: bool,
}

fn accepted_by_default() -> bool {
    true
}

impl MarketplaceSync for HttpMarketplaceSync {
    fn push_tracking(&self, update: &TrackingUpdate) -> Result<bool> {
        let mut request = self.client.post(&self.url).json(update);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .context("failed to send tracking update")?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        if !status.is_success() {
            bail!("marketplace returned {}: {}", status, text.trim());
        }
        if text.trim().is_empty() {
            return Ok(true);
        }
        let answer: SyncAnswer =
            serde_json::from_str(&text).context("failed to parse marketplace answer")?;
        Ok(answer.accepted)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::thread;

    use labelship_types::{ShipmentLabelStatus, VoidStatus};
    use tiny_http::{Response, Server, StatusCode};

    use super::*;

    fn update() -> TrackingUpdate {
        let order = Order::new(3, "walmart", "W-3");
        let shipment = Shipment {
            id: 1,
            order_id: 3,
            source: "alpha".into(),
            tracking_number: "1Z999".into(),
            carrier: "ups".into(),
            service: "ground".into(),
            label_id: "L1".into(),
            label_url: "https://l/1.pdf".into(),
            label_status: ShipmentLabelStatus::Active,
            void_status: VoidStatus::Active,
            cost: 8.0,
            currency: "USD".into(),
            created_by: "ops".into(),
            created_at: Utc::now(),
        };
        TrackingUpdate::new(&order, &shipment)
    }

    fn serve(answers: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<String>>) {
        let server = Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}/tracking", server.server_addr());
        let handle = thread::spawn(move || {
            let mut bodies = Vec::new();
            for (status, body) in answers {
                let mut req = server.recv().expect("request");
                let mut content = String::new();
                req.as_reader().read_to_string(&mut content).expect("body");
                bodies.push(content);
                req.respond(Response::from_string(body).with_status_code(StatusCode(status)))
                    .expect("respond");
            }
            bodies
        });
        (url, handle)
    }

    #[test]
    fn pushes_tracking_and_reads_acceptance() {
        let (url, handle) = serve(vec![(200, ""), (200, r#"{"accepted": false}"#)]);
        let sync =
            HttpMarketplaceSync::new(&url, Some("tok".into()), Duration::from_secs(5)).expect("sync");
        assert!(sync.push_tracking(&update()).expect("push"));
        assert!(!sync.push_tracking(&update()).expect("push"));
        let bodies = handle.join().expect("join");
        assert!(bodies[0].contains("\"tracking_number\":\"1Z999\""));
        assert!(bodies[0].contains("\"marketplace_order_id\":\"W-3\""));
    }

    #[test]
    fn error_status_is_an_error() {
        let (url, handle) = serve(vec![(500, "boom")]);
        let sync = HttpMarketplaceSync::new(&url, None, Duration::from_secs(5)).expect("sync");
        let err = sync.push_tracking(&update()).unwrap_err();
        handle.join().expect("join");
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn noop_always_accepts() {
        assert!(NoopSync.push_tracking(&update()).expect("push"));
    }
}
