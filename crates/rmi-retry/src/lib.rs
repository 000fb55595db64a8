// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff for operations that should be retried forever on a
//! transient failure but must propagate anything else immediately.
//!
//! This is the policy the broker adapter's reliability wrapper runs on top
//! of: a dropped connection is retried without end (a message-bus restart
//! is expected to recover eventually), while a malformed request or a
//! rejected send is returned to the caller right away.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with a cap, no jitter beyond what the caller adds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// `200ms` initial, doubling up to a `30s` cap — the broker adapter's
    /// default for connection-loss retries.
    #[must_use]
    pub fn broker_default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// The delay to sleep before the `attempt`-th retry (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::broker_default()
    }
}

/// Run `op` until it succeeds or returns a non-transient error.
///
/// `is_transient` classifies each error: `true` sleeps per `policy` and
/// retries without limit, `false` returns the error to the caller
/// immediately. There is no maximum attempt count — callers that need one
/// should classify an error as non-transient once they choose to give up.
pub async fn retry_forever<T, E, F, Fut>(
    policy: &BackoffPolicy,
    mut is_transient: impl FnMut(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
            Err(err) => return Err(err),
        }
    }
}
