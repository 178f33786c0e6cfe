//! Error classification and retry policy
//!
//! This module contains:
//! - `FetchError`: the error type of every network-facing collaborator
//! - `classify`: the pure error → class mapping
//! - `RetryPolicy`: a fixed-interval, uncapped, cancellable retry loop

mod classify;

pub use classify::{classify, ErrorClass, FetchError};

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retries transient failures at a fixed interval
///
/// There is no retry ceiling at this layer: a retryable operation is attempted
/// until it succeeds, fails in a non-retryable way, or the cancellation token
/// fires.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    wait: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy sleeping `wait` between attempts
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }

    /// Runs `op` until it succeeds or fails with a non-retryable error
    ///
    /// # Arguments
    ///
    /// * `cancel` - Aborts an in-flight attempt or back-off immediately
    /// * `what` - Short description used in log lines
    /// * `op` - Produces one attempt per call
    ///
    /// # Returns
    ///
    /// * `Ok(T)` - The first successful attempt
    /// * `Err(FetchError::Cancelled)` - Cancelled while attempting or waiting
    /// * `Err(FetchError)` - The first fatal or non-retryable failure
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut retries: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if classify(&err) != ErrorClass::Retryable {
                return Err(err);
            }

            retries += 1;
            tracing::warn!(
                "{} failed: {}; retrying ({}) in {:?}",
                what,
                err,
                retries,
                self.wait
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.wait) => {}
            }
        }
    }
}
