//! Multi-SKU notifications.
//!
//! Orders with more than one distinct SKU need a human to check the packing,
//! so a notice with the label link goes out when one is labeled. Delivery is
//! synchronous and bounded by the configured timeout; a failed notice is
//! reported back to the caller but never fails the order.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use labelship_config::NotifyConfig;
use labelship_types::OrderId;
use serde::{Deserialize, Serialize};

/// Header carrying `sha256=<hex hmac>` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Labelship-Signature";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSkuNotice {
    pub order_id: OrderId,
    pub marketplace: String,
    pub marketplace_order_id: String,
    pub skus: Vec<String>,
    pub tracking_number: String,
    pub carrier: String,
    pub label_url: String,
}

/// Webhook body.
#[derive(Debug, Serialize, Deserialize)]
pub struct NoticePayload {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub notice: MultiSkuNotice,
}

pub trait Notifier: Send + Sync {
    /// Deliver a notice. `Ok` means the receiver accepted it.
    fn send_multi_sku_notice(&self, notice: &MultiSkuNotice) -> Result<()>;
}

/// Used when notifications are not configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send_multi_sku_notice(&self, _notice: &MultiSkuNotice) -> Result<()> {
        Ok(())
    }
}

/// Posts signed JSON to a webhook and waits for the response.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            secret,
        })
    }

    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("webhook URL is required when notifications are enabled")?;
        Self::new(url, config.resolve_secret()?, config.timeout)
    }
}

impl Notifier for WebhookNotifier {
    fn send_multi_sku_notice(&self, notice: &MultiSkuNotice) -> Result<()> {
        let payload = NoticePayload {
            timestamp: Utc::now(),
            event: "multi_sku_label".to_string(),
            notice: notice.clone(),
        };
        let body = serde_json::to_string(&payload).context("failed to serialize notice")?;
        let signature = self
            .secret
            .as_deref()
            .map(|secret| sign_payload(secret, body.as_bytes()))
            .transpose()?;

        deliver(&self.client, &self.url, signature.as_deref(), body)
            .with_context(|| format!("multi-SKU notice for order {} not delivered", notice.order_id))?;
        tracing::debug!(order_id = notice.order_id, url = %self.url, "multi-SKU notice delivered");
        Ok(())
    }
}

fn deliver(
    client: &reqwest::blocking::Client,
    url: &str,
    signature: Option<&str>,
    body: String,
) -> Result<()> {
    let mut request = client.post(url).header("Content-Type", "application/json");
    if let Some(signature) = signature {
        request = request.header(SIGNATURE_HEADER, signature);
    }
    let response = request
        .body(body)
        .send()
        .context("failed to send webhook request")?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().unwrap_or_default();
        anyhow::bail!("webhook returned error status {}: {}", status, text);
    }
    Ok(())
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid webhook secret: {e}"))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
