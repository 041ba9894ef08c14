//! Cancellation and deadline helpers
//!
//! Every blocking wait in the crate goes through [`until`] so that a
//! caller-supplied [`CancellationToken`] and a deadline are honored the
//! same way everywhere.

use crate::{LinkError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Await `fut` unless `cancel` fires first or `deadline` passes.
///
/// Cancellation wins over a simultaneously expiring deadline.
pub async fn until<F, T>(
    cancel: &CancellationToken,
    deadline: Instant,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LinkError::OperationCanceled),
        res = tokio::time::timeout_at(deadline, fut) => {
            res.map_err(|_| LinkError::Timeout(what.to_string()))
        }
    }
}

/// Same as [`until`] with a relative timeout.
pub async fn within<F, T>(
    cancel: &CancellationToken,
    timeout: Duration,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = T>,
{
    until(cancel, Instant::now() + timeout, what, fut).await
}

/// Sleep that returns `OperationCanceled` if the token fires first.
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LinkError::OperationCanceled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
