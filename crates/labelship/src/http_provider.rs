//! Provider adapter speaking a generic JSON-over-HTTP contract.
//!
//! | call | request | success body |
//! |---|---|---|
//! | rates | `POST {base}/rates` with a [`RateRequest`] | `{"rates": [...]}` or a bare array |
//! | purchase | `POST {base}/labels` | `{"tracking_number", "label_id", "label_url", ...}` |
//! | void | `POST {base}/labels/{label_id}/void` | `{"voided": bool}` (empty body means yes) |
//!
//! Quote fields are read leniently: providers disagree on names
//! (`amount`/`price`/`rate`) and on whether numbers arrive as strings.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use labelship_config::ProviderConfig;
use labelship_retry::RetryStrategyConfig;
use labelship_types::RawQuote;
use reqwest::Url;
use serde_json::{Value, json};

use crate::provider::{LabelResult, ProviderAdapter, ProviderError, PurchaseRequest, RateRequest};

/// User agent sent to providers.
pub const USER_AGENT: &str = concat!("labelship/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error body kept in messages (the full body goes to `raw`).
const MESSAGE_BODY_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpProviderAdapter {
    id: String,
    base_url: Url,
    token: Option<String>,
    label_format: String,
    retry: RetryStrategyConfig,
    client: reqwest::blocking::Client,
}

impl HttpProviderAdapter {
    pub fn new(id: &str, base_url: &str) -> Result<Self> {
        Self::build(
            id,
            base_url,
            Duration::from_secs(10),
            Duration::from_secs(120),
        )
    }

    fn build(id: &str, base_url: &str, connect: Duration, request: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid base URL for provider {id}: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            bail!("base URL for provider {id} cannot carry a path: {base_url}");
        }
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build provider HTTP client")?;
        Ok(Self {
            id: id.to_string(),
            base_url,
            token: None,
            label_format: "PDF_4x6".to_string(),
            retry: RetryStrategyConfig::fail_fast(),
            client,
        })
    }

    /// Build from a `[[providers]]` entry, resolving its token.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let mut adapter = Self::build(
            &config.id,
            &config.base_url,
            config.connect_timeout,
            config.request_timeout,
        )?;
        adapter.token = config
            .resolve_token()
            .with_context(|| format!("failed to resolve token for provider {}", config.id))?;
        adapter.label_format = config.label_format.clone();
        adapter.retry = config.retry.to_strategy();
        Ok(adapter)
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    /// `base_url` with `segments` appended, each one percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Never fails: `build` rejects cannot-be-a-base URLs.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn post(&self, segments: &[&str], body: &Value) -> Result<Value, ProviderError> {
        let mut request = self.client.post(self.endpoint(segments)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(transport_error)?;
        let status = response.status();
        let text = response.text().map_err(transport_error)?;

        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: error_message(&text),
                raw: Some(text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::Malformed {
            message: format!("invalid JSON from {}: {e}", self.id),
            raw: Some(text.clone()),
        })
    }
}

impl ProviderAdapter for HttpProviderAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_rates(&self, request: &RateRequest) -> Result<Vec<RawQuote>, ProviderError> {
        let body = serde_json::to_value(request).map_err(|e| ProviderError::Malformed {
            message: format!("failed to encode rate request: {e}"),
            raw: None,
        })?;
        let response = self.post(&["rates"], &body)?;

        let list = match &response {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => match map.get("rates") {
                Some(Value::Array(items)) => items.as_slice(),
                _ => {
                    return Err(ProviderError::Malformed {
                        message: "rates response has no `rates` array".to_string(),
                        raw: Some(response.to_string()),
                    });
                }
            },
            _ => {
                return Err(ProviderError::Malformed {
                    message: "rates response is not a JSON object or array".to_string(),
                    raw: Some(response.to_string()),
                });
            }
        };

        Ok(list.iter().map(parse_quote).collect())
    }

    fn purchase_label(&self, request: &PurchaseRequest) -> Result<LabelResult, ProviderError> {
        let body = json!({
            "rate_handle": request.rate_handle,
            "order_id": request.order_id,
            "reference": request.marketplace_order_id,
            "carrier": request.carrier,
            "service": request.service,
            "label_format": self.label_format,
        });
        let response = self.post(&["labels"], &body)?;

        if let Some(message) = declined_message(&response) {
            return Err(ProviderError::Declined {
                message,
                raw: Some(response.to_string()),
            });
        }

        let tracking_number = string_field(&response, &["tracking_number", "tracking"]);
        let label_url = string_field(&response, &["label_url", "url"]);
        let (Some(tracking_number), Some(label_url)) = (tracking_number, label_url) else {
            return Err(ProviderError::Malformed {
                message: "label response lacks tracking_number or label_url".to_string(),
                raw: Some(response.to_string()),
            });
        };
        let label_id = string_field(&response, &["label_id", "object_id", "id"])
            .unwrap_or_else(|| tracking_number.clone());

        Ok(LabelResult {
            tracking_number,
            label_id,
            label_url,
            carrier: string_field(&response, &["carrier", "provider"]),
            cost: number_field(&response, &["cost", "amount", "price"]),
            currency: string_field(&response, &["currency"]),
            raw: response,
        })
    }

    fn void_label(&self, label_id: &str) -> Result<bool, ProviderError> {
        let response = self.post(&["labels", label_id, "void"], &json!({}))?;
        Ok(match &response {
            Value::Null => true,
            other => other
                .get("voided")
                .or_else(|| other.get("success"))
                .and_then(Value::as_bool)
                .unwrap_or(true),
        })
    }

    fn retry_policy(&self) -> RetryStrategyConfig {
        self.retry.clone()
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_connect() {
        ProviderError::Connect(err.to_string())
    } else {
        ProviderError::Malformed {
            message: err.to_string(),
            raw: None,
        }
    }
}

fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = string_field(&value, &["message", "error", "detail"])
    {
        return message;
    }
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MESSAGE_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn declined_message(value: &Value) -> Option<String> {
    let status = value.get("status").and_then(Value::as_str)?;
    if status.eq_ignore_ascii_case("error") || status.eq_ignore_ascii_case("declined") {
        Some(
            string_field(value, &["message", "error", "detail"])
                .unwrap_or_else(|| format!("provider reported status {status}")),
        )
    } else {
        None
    }
}

fn parse_quote(value: &Value) -> RawQuote {
    RawQuote {
        carrier: string_field(value, &["carrier", "provider"]),
        service: string_field(value, &["service", "servicelevel", "service_level"]),
        price: number_field(value, &["amount", "price", "rate"]),
        currency: string_field(value, &["currency"]),
        eta_days: number_field(value, &["estimated_days", "eta_days", "days"])
            .filter(|d| *d >= 0.0)
            .map(|d| d.ceil() as u32),
        rate_handle: string_field(value, &["rate_id", "object_id", "id", "handle"]),
        raw: value.clone(),
    }
}

/// First non-empty string (or number rendered as string) under `keys`.
fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// First number (or numeric string) under `keys`.
fn number_field(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
