//! Stage retry policy with configurable backoff and jitter.
//!
//! A failing stage is retried in place up to `max_retries` additional
//! attempts. Delays between attempts go through a [`Sleeper`] so tests can
//! substitute [`NoDelay`].

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for stage retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of additional attempts.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Retry bookkeeping for one stage.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries performed so far.
    pub retries: u32,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the retry budget is used up.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.retries >= config.max_retries
    }

    /// Calculates the delay before the next retry.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base
                .saturating_mul(2u64.saturating_pow(self.retries))
                .min(max),
            BackoffStrategy::Linear => base
                .saturating_mul(u64::from(self.retries) + 1)
                .min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay_ms = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
}

/// Decides whether to retry and advances the state if so.
#[must_use]
pub fn should_retry(state: &mut RetryState, config: &RetryConfig) -> RetryDecision {
    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }
    let delay = state.calculate_delay(config);
    state.retries += 1;
    RetryDecision::Retry(delay)
}

/// Waits between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspends for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately; for deterministic tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

#[async_trait]
impl Sleeper for NoDelay {
    async fn sleep(&self, _duration: Duration) {}
}

/// Result of running an operation under a retry policy.
#[derive(Debug)]
pub struct Attempted<T, E> {
    /// The final outcome.
    pub result: Result<T, E>,
    /// Retries performed; attempts made is `retries + 1`.
    pub retries: u32,
}

/// Runs `operation` until it succeeds or the retry budget is exhausted.
///
/// `operation` receives the 1-based attempt number. `on_retry` is called
/// with the retry number, the error and the delay before each retry.
pub async fn run_with_retry<T, E, F, Fut, R>(
    config: &RetryConfig,
    sleeper: &dyn Sleeper,
    mut on_retry: R,
    mut operation: F,
) -> Attempted<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(u32, &E, Duration),
{
    let mut state = RetryState::new();

    loop {
        match operation(state.retries + 1).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    retries: state.retries,
                }
            }
            Err(e) => match should_retry(&mut state, config) {
                RetryDecision::Retry(delay) => {
                    debug!(
                        retry = state.retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying after error"
                    );
                    on_retry(state.retries, &e, delay);
                    sleeper.sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return Attempted {
                        result: Err(e),
                        retries: state.retries,
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().push(duration);
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.jitter_strategy, JitterStrategy::Full);
    }

    #[test]
    fn test_retry_config_deserializes_with_defaults() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_retries": 1, "backoff_strategy": "linear"}"#).unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn test_calculate_delay_exponential_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(100));
        state.retries = 2;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(400));
    }

    #[test]
    fn test_calculate_delay_linear_and_constant() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);
        let constant = linear.clone().with_backoff(BackoffStrategy::Constant);
        let mut state = RetryState::new();
        state.retries = 2;

        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();
        state.retries = 10;

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_stays_below_delay() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        let mut state = RetryState::new();

        for _ in 0..10 {
            assert!(state.calculate_delay(&config) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_should_retry_gives_up_after_budget() {
        let config = RetryConfig::new()
            .with_max_retries(2)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        assert!(matches!(should_retry(&mut state, &config), RetryDecision::Retry(_)));
        assert!(matches!(should_retry(&mut state, &config), RetryDecision::Retry(_)));
        assert_eq!(should_retry(&mut state, &config), RetryDecision::GiveUp);
        assert_eq!(state.retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_attempted_n_plus_one_times() {
        let config = RetryConfig::new()
            .with_max_retries(3)
            .with_base_delay_ms(10)
            .with_jitter(JitterStrategy::None);
        let sleeper = RecordingSleeper::default();
        let mut attempts = Vec::new();
        let mut retries_seen = Vec::new();

        let outcome: Attempted<(), String> = run_with_retry(
            &config,
            &sleeper,
            |retry, _err: &String, _delay| retries_seen.push(retry),
            |attempt| {
                attempts.push(attempt);
                async { Err("boom".to_string()) }
            },
        )
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.retries, 3);
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert_eq!(retries_seen, vec![1, 2, 3]);
        assert_eq!(
            *sleeper.delays.lock(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let config = RetryConfig::new().with_max_retries(5);
        let mut calls = 0;

        let outcome: Attempted<i32, String> = run_with_retry(
            &config,
            &NoDelay,
            |_, _, _| {},
            |attempt| {
                calls += 1;
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt}"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_once() {
        let config = RetryConfig::new().with_max_retries(0);
        let outcome: Attempted<(), &str> =
            run_with_retry(&config, &NoDelay, |_, _, _| {}, |_| async { Err("no") }).await;

        assert_eq!(outcome.retries, 0);
        assert_eq!(outcome.result, Err("no"));
    }
}
