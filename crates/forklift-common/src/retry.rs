//! Retry with exponential backoff and jitter.
//!
//! Used around inventory calls, which can fail transiently while a
//! provider's collector is restarting. Only failures classified as retryable
//! are retried; a permanent failure is returned on the first attempt.
//!
//! ```ignore
//! let vm = retry_with_backoff(&RetryConfig::inventory(), "get_vm", Error::is_retryable, || {
//!     inventory.get(InventoryKind::Vm, "vm-42")
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Retries after the first attempt for inventory calls
pub const INVENTORY_MAX_RETRIES: u32 = 3;

/// Backoff settings for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Settings for inventory lookups: three retries, delay capped at 30s
    pub fn inventory() -> Self {
        Self::with_max_attempts(INVENTORY_MAX_RETRIES + 1)
    }

    /// Delay that precedes retry number `retry` (1-based), before jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation, retrying failures accepted by `should_retry`.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&err) {
            warn!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed with a permanent error"
            );
            return Err(err);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        // 0.5x to 1.5x jitter
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(config.delay_for(attempt).as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}
