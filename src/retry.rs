//! Backoff policies for connection attempts and apply retries.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Per-subscription apply retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: f64,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            backoff: BackoffKind::default(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Backoff {
        Backoff {
            kind: self.backoff,
            initial: Duration::from_secs_f64(self.backoff_secs.max(0.0)),
            max_delay: Duration::from_secs_f64(self.max_backoff_secs.max(0.0)),
            max_attempts: self.max_attempts.max(1),
        }
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    /// Exponential schedule used for lazy connects: 200ms doubling up to 30s.
    pub fn connect(max_attempts: u32) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
                self.initial.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// the attempts are used up. Returns the last error on exhaustion.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed: {}",
                        what,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(attempt, "{} gave up: {}", what, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Maps a connect failure to the taxonomy's connection error.
pub(crate) fn connection_error(datastore: &str, error: Error) -> Error {
    match error {
        Error::Connection(_) => error,
        other => Error::Connection(format!("{}: {}", datastore, other)),
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_secs() -> f64 {
    1.0
}

fn default_max_backoff_secs() -> f64 {
    60.0
}
