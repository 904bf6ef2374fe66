//! Per-provider retry policies for carrier API calls.
//!
//! Every provider adapter owns a [`RetryStrategyConfig`]. Most providers fail
//! fast on the first error; providers known to return transient 5xx bursts
//! opt into retries for a configurable set of HTTP statuses.
//!
//! # Example
//!
//! ```
//! use labelship_retry::{RetryPolicy, RetryExecutor, ErrorClass};
//!
//! let config = RetryPolicy::Transient.to_config();
//! assert_eq!(config.max_attempts, 3);
//! assert!(config.is_retryable_status(503));
//!
//! let executor = RetryExecutor::new(RetryPolicy::FailFast.to_config());
//! let report = executor.run_classified(
//!     |_attempt| Err::<(), _>("boom"),
//!     |_err| ErrorClass::Retryable,
//! );
//! assert_eq!(report.attempts, 1);
//! assert!(!report.exhausted);
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP statuses treated as transient by the `transient` preset.
pub const TRANSIENT_HTTP_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default)
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt
    Linear,
    /// Constant delay: same delay every attempt
    Constant,
}

/// Predefined retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Single attempt; any error is final
    #[default]
    FailFast,
    /// Three attempts, 2s doubling backoff, on 429/502/503/504
    Transient,
    /// More attempts with shorter delays, same transient statuses
    Aggressive,
    /// Fully custom configuration via the provider's retry settings
    Custom,
}

impl RetryPolicy {
    /// Get the retry configuration for this policy.
    pub fn to_config(&self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::FailFast => RetryStrategyConfig::fail_fast(),
            RetryPolicy::Transient => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                jitter: 0.0,
                retryable_statuses: default_retryable_statuses(),
            },
            RetryPolicy::Aggressive => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(20),
                jitter: 0.3,
                retryable_statuses: default_retryable_statuses(),
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay cap for backoff.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter).
    #[serde(default)]
    pub jitter: f64,
    /// HTTP statuses that count as transient.
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: BTreeSet<u16>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_retryable_statuses() -> BTreeSet<u16> {
    TRANSIENT_HTTP_STATUSES.into_iter().collect()
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self::fail_fast()
    }
}

impl RetryStrategyConfig {
    /// One attempt, no retries.
    pub fn fail_fast() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 1,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.0,
            retryable_statuses: default_retryable_statuses(),
        }
    }

    /// Whether an HTTP status is in this policy's transient set.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Classify an optional HTTP status against this policy.
    pub fn classify_status(&self, status: Option<u16>) -> ErrorClass {
        match status {
            Some(code) if self.is_retryable_status(code) => ErrorClass::Retryable,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Error classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Error is transient and should be retried
    #[default]
    Retryable,
    /// Error outcome is unknown (the label may have been bought)
    Ambiguous,
    /// Error is permanent and should not be retried
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Ambiguous => write!(f, "ambiguous"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Calculate the delay for the next retry attempt based on the strategy configuration.
///
/// `attempt` is the attempt that just failed (1-indexed).
///
/// ```
/// use labelship_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig {
///     strategy: RetryStrategyType::Exponential,
///     base_delay: Duration::from_secs(2),
///     max_delay: Duration::from_secs(60),
///     jitter: 0.0,
///     max_attempts: 3,
///     ..Default::default()
/// };
///
/// assert_eq!(calculate_delay(&config, 1), Duration::from_secs(2));
/// assert_eq!(calculate_delay(&config, 2), Duration::from_secs(4));
/// ```
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter_range = 2.0 * jitter;
    let random_value: f64 = rand::rng().random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// What happened across all attempts of one retried operation.
#[derive(Debug)]
pub struct RetryReport<T, E> {
    /// Final result: the first success, or the last error.
    pub result: Result<T, E>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Attempts that returned an error.
    pub failed_attempts: u32,
    /// True when the last error was retryable but `max_attempts` ran out.
    pub exhausted: bool,
}

/// A retry executor that runs a fallible operation with configured retry behavior.
pub struct RetryExecutor {
    config: RetryStrategyConfig,
    sleep: fn(Duration),
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration.
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self {
            config,
            sleep: std::thread::sleep,
        }
    }

    /// Create a retry executor from a predefined policy.
    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self::new(policy.to_config())
    }

    /// Replace the sleep function (tests use a no-op).
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn config(&self) -> &RetryStrategyConfig {
        &self.config
    }

    /// Execute a fallible operation, retrying only errors `classify` marks
    /// [`ErrorClass::Retryable`].
    ///
    /// The operation receives the current attempt number (starting at 1).
    pub fn run_classified<T, E, F, C>(&self, mut operation: F, classify: C) -> RetryReport<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> ErrorClass,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        let mut failed_attempts = 0;

        loop {
            match operation(attempt) {
                Ok(value) => {
                    return RetryReport {
                        result: Ok(value),
                        attempts: attempt,
                        failed_attempts,
                        exhausted: false,
                    };
                }
                Err(e) => {
                    failed_attempts += 1;
                    let class = classify(&e);
                    if class != ErrorClass::Retryable || attempt >= max_attempts {
                        return RetryReport {
                            result: Err(e),
                            attempts: attempt,
                            failed_attempts,
                            exhausted: class == ErrorClass::Retryable && max_attempts > 1,
                        };
                    }

                    (self.sleep)(calculate_delay(&self.config, attempt));
                    attempt += 1;
                }
            }
        }
    }

    /// Execute a fallible operation, retrying every error.
    pub fn run<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_classified(operation, |_| ErrorClass::Retryable)
            .result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_sleep(_: Duration) {}

    fn immediate(max_attempts: u32) -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            retryable_statuses: default_retryable_statuses(),
        }
    }

    #[test]
    fn fail_fast_is_the_default_policy() {
        let config = RetryPolicy::default().to_config();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(RetryStrategyConfig::default(), config);
    }

    #[test]
    fn transient_policy_matches_documented_knobs() {
        let config = RetryPolicy::Transient.to_config();
        assert_eq!(config.strategy, RetryStrategyType::Exponential);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_secs(2));
        for status in [429, 502, 503, 504] {
            assert!(config.is_retryable_status(status));
        }
        assert!(!config.is_retryable_status(500));
        assert!(!config.is_retryable_status(400));
    }

    #[test]
    fn classify_status_treats_missing_status_as_permanent() {
        let config = RetryPolicy::Transient.to_config();
        assert_eq!(config.classify_status(Some(503)), ErrorClass::Retryable);
        assert_eq!(config.classify_status(Some(422)), ErrorClass::Permanent);
        assert_eq!(config.classify_status(None), ErrorClass::Permanent);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 10,
            ..Default::default()
        };

        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(60));
    }

    #[test]
    fn test_calculate_delay_linear_and_constant() {
        let mut config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
            ..Default::default()
        };
        assert_eq!(calculate_delay(&config, 5), Duration::from_secs(5));
        assert_eq!(calculate_delay(&config, 15), Duration::from_secs(10));

        config.strategy = RetryStrategyType::Constant;
        assert_eq!(calculate_delay(&config, 7), Duration::from_secs(1));

        config.strategy = RetryStrategyType::Immediate;
        assert_eq!(calculate_delay(&config, 3), Duration::ZERO);
    }

    #[test]
    fn test_jitter_applied_correctly() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
            max_attempts: 10,
            ..Default::default()
        };

        for _ in 0..100 {
            let delay = calculate_delay(&config, 1);
            assert!(delay >= Duration::from_millis(5000));
            assert!(delay <= Duration::from_millis(15000));
        }
    }

    #[test]
    fn success_on_third_attempt_reports_two_failures() {
        let executor = RetryExecutor::new(immediate(3)).with_sleep(no_sleep);
        let report = executor.run_classified(
            |attempt| if attempt < 3 { Err(503) } else { Ok("label") },
            |_| ErrorClass::Retryable,
        );

        assert_eq!(report.result, Ok("label"));
        assert_eq!(report.attempts, 3);
        assert_eq!(report.failed_attempts, 2);
        assert!(!report.exhausted);
    }

    #[test]
    fn retryable_errors_exhaust_after_max_attempts() {
        let executor = RetryExecutor::new(immediate(3)).with_sleep(no_sleep);
        let report =
            executor.run_classified(|_| Err::<(), _>(503), |_| ErrorClass::Retryable);

        assert_eq!(report.result, Err(503));
        assert_eq!(report.attempts, 3);
        assert_eq!(report.failed_attempts, 3);
        assert!(report.exhausted);
    }

    #[test]
    fn permanent_errors_stop_immediately() {
        let executor = RetryExecutor::new(immediate(3)).with_sleep(no_sleep);
        let mut calls = 0;
        let report = executor.run_classified(
            |_| {
                calls += 1;
                Err::<(), _>(400)
            },
            |_| ErrorClass::Permanent,
        );

        assert_eq!(calls, 1);
        assert_eq!(report.failed_attempts, 1);
        assert!(!report.exhausted);
    }

    #[test]
    fn fail_fast_never_reports_exhaustion() {
        let executor = RetryExecutor::from_policy(RetryPolicy::FailFast).with_sleep(no_sleep);
        let report = executor.run_classified(|_| Err::<(), _>(503), |_| ErrorClass::Retryable);
        assert_eq!(report.attempts, 1);
        assert!(!report.exhausted);
    }

    #[test]
    fn zero_max_attempts_still_runs_once() {
        let executor = RetryExecutor::new(immediate(0)).with_sleep(no_sleep);
        assert_eq!(executor.run(|_| Ok::<_, ()>(1)), Ok(1));
    }

    proptest::proptest! {
        #[test]
        fn delay_bounded_without_jitter(
            base_ms in 1u64..10_000,
            max_ms in 100u64..300_000,
            attempt in 1u32..100,
        ) {
            let max_delay = Duration::from_millis(max_ms);
            let config = RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 100,
                base_delay: Duration::from_millis(base_ms.min(max_ms)),
                max_delay,
                jitter: 0.0,
                ..Default::default()
            };
            proptest::prop_assert!(calculate_delay(&config, attempt) <= max_delay);
        }

        #[test]
        fn failed_attempts_never_exceed_max(max_attempts in 1u32..8, succeed_at in 1u32..12) {
            let executor = RetryExecutor::new(immediate(max_attempts)).with_sleep(no_sleep);
            let report = executor.run_classified(
                |attempt| if attempt >= succeed_at { Ok(attempt) } else { Err(503) },
                |_| ErrorClass::Retryable,
            );
            proptest::prop_assert!(report.attempts <= max_attempts);
            proptest::prop_assert!(report.failed_attempts <= max_attempts);
            proptest::prop_assert_eq!(report.result.is_ok(), succeed_at <= max_attempts);
        }
    }

    #[test]
    fn config_deserializes_humantime_and_status_set() {
        let json = r#"{"strategy":"constant","max_attempts":4,"base_delay":"250ms","retryable_statuses":[503]}"#;
        let config: RetryStrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.is_retryable_status(503));
        assert!(!config.is_retryable_status(429));
    }
}
