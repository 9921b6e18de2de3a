//! Polling of asynchronous platform operations.
//!
//! `poll_until` is the one polling loop of the crate; the job waiter, build
//! polling, package readiness and start waiting are all built on it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{DeployerError, PlatformError, Result};

use super::platform::Platform;
use super::types::JobState;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default budget for operations without a dedicated timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Polls `check` every `interval` until it yields a value.
///
/// `check` returns `Ok(None)` while the operation is still in progress.
/// `cancel` is observed between polls; a check in flight always completes.
///
/// # Errors
///
/// Returns the first error raised by `check`, a `Timeout` error naming
/// `operation` once `timeout` has elapsed, or `Cancelled` once `cancel`
/// fires.
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let polling = async {
        loop {
            if let Some(value) = check().await? {
                return Ok::<T, DeployerError>(value);
            }
            trace!("{operation} still in progress, next poll in {interval:?}");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PlatformError::cancelled(operation).into()),
                () = tokio::time::sleep(interval) => {}
            }
        }
    };

    tokio::time::timeout(timeout, polling)
        .await
        .map_err(|_| PlatformError::timeout(operation, timeout))?
}

/// Waits for platform jobs to reach a terminal state.
#[derive(Clone)]
pub struct JobWaiter {
    /// Platform used to read jobs.
    platform: Arc<dyn Platform>,
    /// Stops waiting between polls.
    cancel: CancellationToken,
}

impl std::fmt::Debug for JobWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWaiter").finish_non_exhaustive()
    }
}

impl JobWaiter {
    /// Creates a new job waiter.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops waiting when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Waits for a job to complete.
    ///
    /// # Errors
    ///
    /// Returns `JobFailed` with the platform's error list when the job
    /// fails, `Timeout` when it is still running after `timeout`, or
    /// `Cancelled` when the waiter's token fires first.
    pub async fn wait(&self, job_url: &str, interval: Duration, timeout: Duration) -> Result<()> {
        debug!("Waiting for job {job_url}");

        let operation = format!("job {job_url}");
        poll_until(&operation, interval, timeout, &self.cancel, move || async move {
            let job = self.platform.get_job(job_url).await?;
            let outcome: Result<Option<()>> = match job.state {
                JobState::Complete => Ok(Some(())),
                JobState::Failed => Err(PlatformError::JobFailed {
                    job: job_url.to_string(),
                    errors: job.errors,
                }
                .into()),
                JobState::Processing | JobState::Polling => Ok(None),
            };
            outcome
        })
        .await
    }

    /// Waits for an optional job; `None` means the operation was synchronous.
    ///
    /// # Errors
    ///
    /// See [`JobWaiter::wait`].
    pub async fn wait_optional(
        &self,
        job_url: Option<&str>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        match job_url {
            Some(url) => self.wait(url, interval, timeout).await,
            None => Ok(()),
        }
    }
}
