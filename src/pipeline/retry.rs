//! Bounded sequential retries around a single unit of work.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_RETRY_THRESHOLD,
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Total attempts per unit. A threshold of zero still allows one.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.threshold.max(1)
        } else {
            1
        }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Attempts are strictly sequential with no delay between them. When
    /// every attempt fails the error from the last one is returned.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(unit = label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < attempts => {
                    warn!(unit = label, attempt, attempts, error = %e, "Attempt failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    warn!(unit = label, attempt, attempts, error = %e, "Attempts exhausted");
                    return Err(e);
                }
            }
        }
    }
}
