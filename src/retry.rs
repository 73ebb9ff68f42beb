//! Backoff for instances that cannot currently be polled
//!
//! [`Backoff`] hands out growing delays without sleeping: the poller records
//! the next permitted attempt and keeps ticking for every other instance in the
//! meantime. [`IsRetryable`] decides which failures go through the backoff at
//! all and which are simply retried on the next tick.

use crate::config::RetryConfig;
use crate::error::ClientError;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, refused connections, 5xx) return `true`.
/// Permanent failures (rejected credentials, TLS, bad configuration) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for ClientError {
    fn is_retryable(&self) -> bool {
        match self {
            ClientError::TransientConnection { .. } => true,
            // A changed payload shape will not fix itself within a retry loop
            ClientError::Decode { .. } => false,
            ClientError::PermanentAuth { .. }
            | ClientError::Tls { .. }
            | ClientError::InvalidConfig { .. }
            | ClientError::UnknownBackend(_)
            | ClientError::DuplicateBackend(_) => false,
        }
    }
}

/// Stateful exponential backoff
///
/// Each call to [`next_delay`](Backoff::next_delay) grows the delay by the
/// configured multiplier, capped at `max_delay` before jitter is applied.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff starting at `initial_delay`
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Base delay for the next attempt, without jitter
    pub fn peek_base(&self) -> Duration {
        let factor = self
            .config
            .backoff_multiplier
            .max(1.0)
            .powi(self.attempts.min(32) as i32);
        let secs = self.config.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.config.max_delay.as_secs_f64()))
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.peek_base();
        self.attempts = self.attempts.saturating_add(1);
        if self.config.jitter {
            add_jitter(base)
        } else {
            base
        }
    }

    /// Start over from `initial_delay`
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `1.5 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=0.5);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
