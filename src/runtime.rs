//! A thin wrapper around the async runtime primitives the rest of the crate relies on, so
//! that pool code calls `runtime::spawn` rather than `tokio::spawn` directly.

mod join_handle;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use join_handle::AsyncJoinHandle;
pub(crate) use worker_handle::{WorkerHandle, WorkerHandleListener};

use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
///
/// Must be called from within a context running on a tokio runtime.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Await a future for at most `duration`, failing with `ErrorKind::DeadlineExceeded` if it
/// does not complete in time.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::deadline_exceeded(None))
}

/// Suspend the current task for `duration`.
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}
