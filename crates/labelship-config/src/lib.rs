//! Configuration file support for labelship (`labelship.toml`).
//!
//! ```toml
//! [store]
//! dir = ".labelship"
//!
//! [leases]
//! acquire_timeout = "5m"
//! sweep_timeout = "10m"
//!
//! [[providers]]
//! id = "parcelbridge"
//! base_url = "https://api.parcelbridge.example"
//! token = "env:PARCELBRIDGE_TOKEN"
//!
//! [providers.retry]
//! policy = "transient"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use labelship_retry::{RetryPolicy, RetryStrategyConfig};
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "labelship.toml";

/// Where the file-backed store lives and how writers queue for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// How long a writer waits for the store lock before giving up
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
    /// Age after which a store lock left by a crashed writer is taken over
    #[serde(with = "humantime_serde")]
    pub lock_stale_after: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".labelship"),
            lock_wait: Duration::from_secs(30),
            lock_stale_after: Duration::from_secs(120),
        }
    }
}

/// Order lease timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Leases older than this are reclaimed when a batch acquires
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Leases older than this are reclaimed by `locks sweep`
    #[serde(with = "humantime_serde")]
    pub sweep_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5 * 60),
            sweep_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Bulk-run limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Orders not started before this much time has passed are failed
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Quotes with a longer (or unknown) transit estimate are never chosen
    pub max_eta_days: u32,
    /// Merge the run's labels into one printable artifact
    pub merge_labels: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(200 * 60),
            max_eta_days: 7,
            merge_labels: false,
        }
    }
}

/// Retry settings of one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRetryConfig {
    /// Preset: fail_fast (default), transient, aggressive or custom
    #[serde(default)]
    pub policy: RetryPolicy,
    /// Explicit strategy, used when `policy = "custom"`
    #[serde(default)]
    pub strategy: Option<RetryStrategyConfig>,
}

impl ProviderRetryConfig {
    pub fn to_strategy(&self) -> RetryStrategyConfig {
        match self.policy {
            RetryPolicy::Custom => self.strategy.clone().unwrap_or_default(),
            preset => preset.to_config(),
        }
    }
}

/// One rate/label provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Identifier stored on rates as `source`
    pub id: String,
    pub base_url: String,
    /// `env:VAR`, `file:/path`, or the raw token
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_label_format")]
    pub label_format: String,
    #[serde(default)]
    pub retry: ProviderRetryConfig,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_label_format() -> String {
    "PDF_4x6".to_string()
}

impl ProviderConfig {
    /// Token from `LABELSHIP_<ID>_TOKEN`, falling back to the configured value.
    pub fn resolve_token(&self) -> Result<Option<String>> {
        let env_key = format!(
            "LABELSHIP_{}_TOKEN",
            self.id.to_ascii_uppercase().replace(['-', '.'], "_")
        );
        if let Ok(value) = std::env::var(&env_key)
            && !value.is_empty()
        {
            return Ok(Some(value));
        }
        self.token.as_deref().map(resolve_secret).transpose()
    }
}

/// Marketplace tracking push endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub token: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Webhook used for multi-SKU notices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub url: Option<String>,
    /// HMAC secret; `LABELSHIP_WEBHOOK_SECRET` overrides it
    pub secret: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            secret: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl NotifyConfig {
    pub fn resolve_secret(&self) -> Result<Option<String>> {
        if let Ok(value) = std::env::var("LABELSHIP_WEBHOOK_SECRET")
            && !value.is_empty()
        {
            return Ok(Some(value));
        }
        self.secret.as_deref().map(resolve_secret).transpose()
    }
}

/// Where merged print artifacts go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Defaults to `<store.dir>/merged`
    pub output_dir: Option<PathBuf>,
    /// Public URL prefix for artifacts; `file://` URLs are used when unset
    pub public_base_url: Option<String>,
}

/// Configuration loaded from `labelship.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelshipConfig {
    pub store: StoreConfig,
    pub leases: LeaseConfig,
    pub batch: BatchConfig,
    pub providers: Vec<ProviderConfig>,
    pub marketplace: MarketplaceConfig,
    pub notify: NotifyConfig,
    pub merge: MergeConfig,
}

/// CLI overrides for merging with config file values.
///
/// `None` means "flag not passed".
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub store_dir: Option<PathBuf>,
    pub lease_timeout: Option<Duration>,
    pub deadline: Option<Duration>,
    pub max_eta_days: Option<u32>,
    pub merge_labels: bool,
}

impl LabelshipConfig {
    /// Load `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: LabelshipConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.lock_wait.is_zero() {
            bail!("store.lock_wait must be greater than 0");
        }

        if self.leases.acquire_timeout.is_zero() {
            bail!("leases.acquire_timeout must be greater than 0");
        }

        if self.leases.sweep_timeout.is_zero() {
            bail!("leases.sweep_timeout must be greater than 0");
        }

        if self.batch.max_eta_days == 0 {
            bail!("batch.max_eta_days must be greater than 0");
        }

        if self.batch.deadline.is_zero() {
            bail!("batch.deadline must be greater than 0");
        }

        let mut seen = BTreeSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                bail!("providers[].id cannot be empty");
            }
            if !seen.insert(provider.id.as_str()) {
                bail!("duplicate provider id: {}", provider.id);
            }
            if provider.base_url.trim().is_empty() {
                bail!("providers[{}].base_url cannot be empty", provider.id);
            }
            // A lease that expires mid-request would let a second worker buy the same label.
            let worst_case = provider.request_timeout.saturating_mul(
                provider.retry.to_strategy().max_attempts.max(1),
            );
            if self.leases.acquire_timeout <= worst_case {
                bail!(
                    "leases.acquire_timeout ({:?}) must exceed provider {} worst-case request time ({:?})",
                    self.leases.acquire_timeout,
                    provider.id,
                    worst_case
                );
            }
            let strategy = provider.retry.to_strategy();
            if strategy.max_attempts == 0 {
                bail!("providers[{}].retry max_attempts must be greater than 0", provider.id);
            }
            if !(0.0..=1.0).contains(&strategy.jitter) {
                bail!("providers[{}].retry jitter must be between 0.0 and 1.0", provider.id);
            }
        }

        if self.marketplace.enabled && self.marketplace.url.as_deref().unwrap_or("").is_empty() {
            bail!("marketplace.url is required when marketplace sync is enabled");
        }

        if self.notify.enabled && self.notify.url.as_deref().unwrap_or("").is_empty() {
            bail!("notify.url is required when notifications are enabled");
        }

        Ok(())
    }

    /// Merge CLI overrides into this configuration; CLI values win.
    pub fn with_overrides(mut self, cli: CliOverrides) -> Self {
        if let Some(dir) = cli.store_dir {
            self.store.dir = dir;
        }
        if let Some(timeout) = cli.lease_timeout {
            self.leases.acquire_timeout = timeout;
        }
        if let Some(deadline) = cli.deadline {
            self.batch.deadline = deadline;
        }
        if let Some(days) = cli.max_eta_days {
            self.batch.max_eta_days = days;
        }
        self.batch.merge_labels = self.batch.merge_labels || cli.merge_labels;
        self
    }

    /// Effective merge output directory.
    pub fn merge_output_dir(&self) -> PathBuf {
        self.merge
            .output_dir
            .clone()
            .unwrap_or_else(|| self.store.dir.join("merged"))
    }
}

/// Resolve a secret reference.
///
/// - `env:VAR_NAME` reads an environment variable
/// - `file:/path/to/token` reads a file (trimmed)
/// - anything else is the secret itself
pub fn resolve_secret(value: &str) -> Result<String> {
    if let Some(var) = value.strip_prefix("env:") {
        return std::env::var(var).with_context(|| format!("environment variable {var} is not set"));
    }
    if let Some(path) = value.strip_prefix("file:") {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secret file {path}"))?;
        return Ok(content.trim().to_string());
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelship_retry::RetryStrategyType;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[store]
dir = "/var/lib/labelship"

[leases]
acquire_timeout = "15m"

[batch]
max_eta_days = 5

[[providers]]
id = "parcelbridge"
base_url = "https://api.parcelbridge.example"
token = "raw-token"
request_timeout = "90s"

[providers.retry]
policy = "transient"

[[providers]]
id = "shipquote"
base_url = "https://shipquote.example/v2"

[notify]
enabled = true
url = "https://hooks.example/labels"
"#;

    #[test]
    fn parses_sample_config() {
        let config: LabelshipConfig = toml::from_str(SAMPLE).expect("parse");
        assert_eq!(config.store.dir, PathBuf::from("/var/lib/labelship"));
        assert_eq!(config.leases.acquire_timeout, Duration::from_secs(900));
        assert_eq!(config.leases.sweep_timeout, Duration::from_secs(600));
        assert_eq!(config.batch.max_eta_days, 5);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].request_timeout, Duration::from_secs(90));
        assert_eq!(config.providers[0].retry.to_strategy().max_attempts, 3);
        assert_eq!(config.providers[1].retry.to_strategy().max_attempts, 1);
        assert_eq!(config.providers[1].label_format, "PDF_4x6");
        config.validate().expect("valid");
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = LabelshipConfig::default();
        assert_eq!(config.leases.acquire_timeout, Duration::from_secs(300));
        assert_eq!(config.leases.sweep_timeout, Duration::from_secs(600));
        assert_eq!(config.batch.max_eta_days, 7);
        assert_eq!(config.batch.deadline, Duration::from_secs(12_000));
        assert_eq!(config.merge_output_dir(), PathBuf::from(".labelship/merged"));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_lease_shorter_than_provider_worst_case() {
        let mut config: LabelshipConfig = toml::from_str(SAMPLE).expect("parse");
        // transient policy: 3 attempts * 90s = 270s
        config.leases.acquire_timeout = Duration::from_secs(200);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worst-case"));
    }

    #[test]
    fn rejects_duplicate_provider_ids() {
        let mut config: LabelshipConfig = toml::from_str(SAMPLE).expect("parse");
        config.providers[1].id = "parcelbridge".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_enabled_notify_without_url() {
        let mut config = LabelshipConfig::default();
        config.notify.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_retry_uses_explicit_strategy() {
        let toml_src = r#"
[[providers]]
id = "flaky"
base_url = "http://localhost:1"

[providers.retry]
policy = "custom"

[providers.retry.strategy]
strategy = "constant"
max_attempts = 4
base_delay = "100ms"
retryable_statuses = [503]
"#;
        let config: LabelshipConfig = toml::from_str(toml_src).expect("parse");
        let strategy = config.providers[0].retry.to_strategy();
        assert_eq!(strategy.strategy, RetryStrategyType::Constant);
        assert_eq!(strategy.max_attempts, 4);
        assert!(!strategy.is_retryable_status(429));
    }

    #[test]
    fn cli_overrides_win() {
        let config = LabelshipConfig::default().with_overrides(CliOverrides {
            store_dir: Some(PathBuf::from("/tmp/x")),
            lease_timeout: Some(Duration::from_secs(42)),
            deadline: None,
            max_eta_days: Some(3),
            merge_labels: true,
        });
        assert_eq!(config.store.dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.leases.acquire_timeout, Duration::from_secs(42));
        assert_eq!(config.batch.max_eta_days, 3);
        assert!(config.batch.merge_labels);
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let td = tempdir().expect("tempdir");
        let config = LabelshipConfig::load_or_default(&td.path().join(CONFIG_FILE)).expect("load");
        assert!(config.providers.is_empty());

        let path = td.path().join(CONFIG_FILE);
        std::fs::write(&path, SAMPLE).expect("write");
        let config = LabelshipConfig::load_or_default(&path).expect("load");
        assert_eq!(config.providers.len(), 2);
    }

    #[test]
    fn resolve_secret_reads_file_and_raw() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("token");
        std::fs::write(&path, "s3cret\n").expect("write");

        let reference = format!("file:{}", path.display());
        assert_eq!(resolve_secret(&reference).expect("file"), "s3cret");
        assert_eq!(resolve_secret("plain").expect("raw"), "plain");
        assert!(resolve_secret("env:LABELSHIP_TEST_SURELY_UNSET_VAR").is_err());
    }
}
