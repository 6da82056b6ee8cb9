//! Retry policy for external-capability calls.
//!
//! Every call the orchestrator makes to a generation, evidence, or
//! embedding capability goes through [`RetryPolicy::run`]. An error whose
//! [`ErrorKind`] (looking through `ComputationFailed`) is in the retryable
//! set is retried up to `max_attempts` total attempts; anything else
//! returns immediately.
//!
//! # Backoff
//!
//! - `fixed`: `base` before every retry.
//! - `exponential`: `base × factor^(n-1)` before retry `n`, capped at `cap`.
//!   With the defaults (1s, ×2, 32s cap) this is 1s, 2s, 4s, … 32s.
//!
//! Waiting between attempts is cancellable.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use excuse_harness_core::{ErrorKind, PipelineError, PipelineResult};

use crate::config::{BackoffKind, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        base: Duration,
        factor: f64,
        cap: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, factor, cap } => {
                let exp = retry.saturating_sub(1).min(32) as i32;
                let secs = base.as_secs_f64() * factor.powi(exp);
                if !secs.is_finite() || secs >= cap.as_secs_f64() {
                    cap
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retryable: Vec<ErrorKind>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let base = Duration::from_millis(config.base_ms);
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                factor: config.factor,
                cap: Duration::from_millis(config.cap_ms),
            },
        };
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff,
            retryable: config.retryable.clone(),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
            retryable: Vec::new(),
        }
    }

    pub fn is_retryable(&self, err: &PipelineError) -> bool {
        self.retryable.contains(&err.root_kind())
    }

    /// Delays that would be slept between attempts, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.backoff.delay(n)).collect()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. Returns the last error together with the
    /// number of retries performed.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), (PipelineError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok((v, retries)),
                Err(e) => {
                    let attempt = retries + 1;
                    if !self.is_retryable(&e) || attempt >= self.max_attempts {
                        return Err((e, retries));
                    }
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        capability = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying capability call"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err((PipelineError::Cancelled, retries)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retries += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
