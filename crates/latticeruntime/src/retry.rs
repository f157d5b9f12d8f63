//! Failure/retry policy shared by every dispatch.
//!
//! Transient failures are retried with exponential backoff plus jitter until
//! the attempt budget runs out. Permanent and fatal failures return at once.
//! Attempts of one dispatch are strictly sequential.

use chrono::{DateTime, Utc};
use latticecore::{AttemptEvent, ErrorDescriptor, NodeError, NodeId, RetryPolicy};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, NodeError>,
    /// Number of the final attempt, starting at 1.
    pub attempt: u32,
    pub failed_attempts: Vec<AttemptEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<T> RetryOutcome<T> {
    /// The final error was transient and the budget is spent. A transient
    /// error only ends the loop once the last attempt has failed.
    pub fn exhausted(&self) -> bool {
        matches!(&self.result, Err(e) if e.is_retryable())
    }
}

/// Delay before the attempt following failed attempt number `attempt`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let jitter = if policy.max_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.max_jitter_ms)
    } else {
        0
    };
    Duration::from_millis(backoff_delay_ms(policy, attempt, jitter))
}

fn backoff_delay_ms(policy: &RetryPolicy, attempt: u32, jitter_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1) as i32;
    let scaled = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let with_jitter = scaled + jitter_ms as f64;
    if with_jitter >= policy.max_delay_ms as f64 {
        policy.max_delay_ms
    } else {
        with_jitter as u64
    }
}

/// Run `op` under `policy`.
///
/// `op` receives the attempt number. `on_retry` is called for every failed
/// attempt that will be followed by another one. Cancellation is observed
/// between attempts and while backing off.
pub async fn execute_with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    node_id: NodeId,
    cancellation: &CancellationToken,
    mut on_retry: R,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
    R: FnMut(&AttemptEvent),
{
    let max_attempts = policy.max_attempts.max(1);
    let started_at = Utc::now();
    let mut failed_attempts = Vec::new();
    let mut attempt = 1;

    loop {
        let attempt_started = Utc::now();
        let result = op(attempt).await;

        let error = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempt,
                    failed_attempts,
                    started_at,
                    finished_at: Utc::now(),
                }
            }
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= max_attempts {
            return RetryOutcome {
                result: Err(error),
                attempt,
                failed_attempts,
                started_at,
                finished_at: Utc::now(),
            };
        }
        if cancellation.is_cancelled() {
            return RetryOutcome {
                result: Err(NodeError::Cancelled),
                attempt,
                failed_attempts,
                started_at,
                finished_at: Utc::now(),
            };
        }

        let delay = backoff_delay(policy, attempt);
        let event = AttemptEvent {
            attempt,
            started_at: attempt_started,
            finished_at: Utc::now(),
            error: ErrorDescriptor::from_node_error(node_id, &error),
            retry_delay_ms: delay.as_millis() as u64,
        };
        tracing::warn!(
            "Node {} attempt {}/{} failed: {}; retrying in {}ms",
            node_id,
            attempt,
            max_attempts,
            error,
            event.retry_delay_ms
        );
        on_retry(&event);
        failed_attempts.push(event);

        tokio::select! {
            _ = cancellation.cancelled() => {
                return RetryOutcome {
                    result: Err(NodeError::Cancelled),
                    attempt,
                    failed_attempts,
                    started_at,
                    finished_at: Utc::now(),
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
