//! Retry policy for reference service calls
//!
//! Exponential backoff without jitter: 1 s base, doubling, at most 3
//! attempts. Only `FetchError::Transient` is retried; NotFound and Permanent
//! bubble out on the first attempt. The breaker sees every attempt: transport
//! failures count against it, answered calls (including 404/4xx) count as
//! successes.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::breaker::CircuitBreaker;
use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

/// Run `op` under the retry policy, consulting `breaker` before each attempt.
/// An open breaker short-circuits the attempt into a synthetic transient
/// failure without touching the network.
pub async fn retry_fetch<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1u32;

    loop {
        if !breaker.allow() {
            return Err(FetchError::Transient(format!(
                "{label}: circuit breaker open"
            )));
        }

        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) if err.is_transient() => {
                breaker.record_failure();
                if attempt >= policy.max_attempts {
                    return Err(FetchError::Transient(format!(
                        "{label}: retries exhausted after {attempt} attempts: {err}"
                    )));
                }
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    label, attempt, policy.max_attempts, err, delay
                );
                sleep(delay).await;
                delay *= policy.factor;
                attempt += 1;
            }
            Err(err) => {
                // The service answered; not a breaker failure.
                breaker.record_success();
                return Err(err);
            }
        }
    }
}
