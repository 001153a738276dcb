//! Bounded-time connectivity checks.
//!
//! A probe runs one connection attempt as its own task and races it against a deadline.
//! When the deadline wins, the attempt's [`CancellationToken`] is cancelled and the task
//! is detached; whatever it later produces is discarded.

use crate::config::DEFAULT_CONNECTION_TIMEOUT_MS;
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-call probe options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeOptions {
    /// Overrides the probe's default deadline.
    pub timeout: Option<Duration>,
    /// Surface failures as errors instead of `Ok(false)`.
    pub rethrow_errors: bool,
}

impl ProbeOptions {
    pub fn rethrowing() -> Self {
        Self {
            timeout: None,
            rethrow_errors: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runs connection attempts under a hard deadline.
#[derive(Debug, Clone, Copy)]
pub struct ConnectivityProbe {
    default_timeout: Duration,
}

impl ConnectivityProbe {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `attempt` and return its result, or fail once the deadline passes.
    ///
    /// The attempt's own boolean is returned as-is. Failures become `Ok(false)` unless
    /// `options.rethrow_errors` is set; then attempt errors are wrapped with the text
    /// `humanize` produces from their raw message, and a missed deadline is a
    /// [`DbError::Timeout`].
    pub async fn run<F, Fut, H>(
        &self,
        attempt: F,
        options: &ProbeOptions,
        humanize: H,
    ) -> DbResult<bool>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = DbResult<bool>> + Send + 'static,
        H: FnOnce(&str) -> String,
    {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let token = CancellationToken::new();
        let mut task = tokio::spawn(attempt(token.clone()));

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(DbError::internal(format!("Connectivity probe task failed: {}", e))),
            },
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                // Detached; the attempt sees the cancelled token and its result is dropped
                drop(task);
                warn!(timeout_ms, "Connectivity probe timed out");
                return if options.rethrow_errors {
                    Err(DbError::timeout("connectivity probe", timeout_ms))
                } else {
                    Ok(false)
                };
            }
        };

        match outcome {
            Ok(reachable) => {
                debug!(reachable, "Connectivity probe finished");
                Ok(reachable)
            }
            Err(e) if options.rethrow_errors => Err(e.humanize(humanize)),
            Err(e) => {
                warn!(error = %e, "Connectivity probe failed");
                Ok(false)
            }
        }
    }
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS))
    }
}
