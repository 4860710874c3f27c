//! Exponential-backoff retry for remote calls.
//!
//! Every remote call the gateway makes funnels through [`retry`]. An attempt
//! that fails is logged at `warn`; after `initial_delay * 2^attempt` the call
//! is attempted again, up to `max_retries` attempts in total. There is no
//! sleep after the final attempt. Exhaustion is logged at `error` and
//! surfaces as [`GatewayError::OperationFailed`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default 3).
    pub max_retries: u32,
    /// Sleep after the first failure; doubles after each subsequent one (default 1s).
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the zero-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, GatewayError>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %last_error,
                    "Remote call failed"
                );
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }

    tracing::error!(
        operation = label,
        attempts,
        error = %last_error,
        "Remote call failed after all retries"
    );
    Err(GatewayError::OperationFailed {
        operation: label.to_string(),
        attempts,
        last_error,
    })
}
