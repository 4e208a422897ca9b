//! Bounded retry with exponential backoff and a deadline per attempt.

use std::time::Duration;

use tracing::{debug, warn};

use crate::gateway::{EntityGateway, GatewayError, GatewayRequest};
use crate::model::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first. Zero behaves as one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single gateway call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no backoff: every failure is final.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Result of [`submit`] with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted {
    pub result: Result<Option<Row>, GatewayError>,
    pub attempts: u32,
}

/// Send `request`, retrying transient failures according to `policy`.
pub async fn submit<G: EntityGateway + ?Sized>(
    gateway: &G,
    request: &GatewayRequest,
    policy: &RetryPolicy,
) -> Attempted {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.call_timeout, request.send(gateway)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(policy.call_timeout)),
        };
        match result {
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff_after(attempt);
                warn!(
                    kind = %request.kind(),
                    attempt,
                    ?delay,
                    error = %err,
                    "transient gateway failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => {
                debug!(kind = %request.kind(), attempts = attempt, ok = result.is_ok(), "gateway call settled");
                return Attempted {
                    result,
                    attempts: attempt,
                };
            }
        }
    }
}
