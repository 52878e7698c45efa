//! Bounded exponential backoff for establishing and resuming relay sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::duration_secs;

/// How long to wait between attempts, and how many attempts to make
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// `None` keeps retrying until cancelled
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(8),
        }
    }
}

impl ReconnectConfig {
    /// Delay preceding the given 1-based retry
    pub fn delay_for(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as usize) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError {
    #[error("gave up after {0} retries")]
    Exhausted(usize),

    #[error("backoff cancelled")]
    Cancelled,
}

/// Retry counter for one establishment or resumption
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    retries: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Number of retries granted so far
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Claim the next retry, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if matches!(self.config.max_attempts, Some(max) if self.retries >= max) {
            return None;
        }
        self.retries += 1;
        Some(self.config.delay_for(self.retries))
    }

    /// Sleep until the next retry is due
    pub async fn pause(&mut self, cancel: &CancellationToken) -> Result<(), BackoffError> {
        let delay = self
            .next_delay()
            .ok_or(BackoffError::Exhausted(self.retries))?;
        trace!(retry = self.retries, ?delay, "backing off");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackoffError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
