//! Retry utilities for calls against the registry, secret store and driver.
//!
//! Two policies are used in the worker:
//! - exponential backoff with jitter for polling (e.g. waiting on a host IP),
//!   bounded by the caller's deadline rather than an attempt count
//! - a fixed, jitter-free schedule for bounded bootstraps (the shared
//!   secret is read at most 5 times, 3 seconds apart)
//!
//! # Example
//!
//! ```ignore
//! use windlass::retry::{retry_with_backoff, RetryConfig};
//!
//! let secret = retry_with_backoff(
//!     &RetryConfig::fixed(5, Duration::from_secs(3)),
//!     "fetch_shared_secret",
//!     || async { registry.kv_get("windlass/secret").await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed delay)
    pub backoff_multiplier: f64,
    /// Randomise each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Retry forever; the caller bounds the operation with a deadline
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Exactly `attempts` tries separated by `delay`, no jitter
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Execute an async operation until it succeeds or `max_attempts` is reached.
///
/// No delay follows the final failed attempt; the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        limit = config.max_attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep_for = if config.jitter {
                    let factor = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * factor)
                } else {
                    delay
                };

                warn!(
                    operation = %operation_name,
                    attempt,
                    limit = config.max_attempts,
                    error = %e,
                    delay_ms = sleep_for.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
