//! A single pending request for a stream, queued while no connection has capacity.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    pool::{
        channel::{PooledChannel, StreamEvent},
        ConnectionId,
    },
    runtime,
    transport::{Multiplexer, StreamInitializer},
};

pub(crate) type WaiterId = u64;

/// A deadline-bound promise for a stream.
///
/// Constructed by a [`super::cpool::ConnectionPoolWorker`] and either `succeed`ed, `fail`ed,
/// or left to its own scheduled timeout. The promise is guarded by a mutex shared with the
/// timeout task so that whichever of the two fires first wins and the other is a no-op:
/// exactly one resolution happens regardless of the race between capacity becoming available
/// and the deadline elapsing.
pub(crate) struct Waiter {
    id: WaiterId,
    deadline: Instant,
    initializer: Arc<dyn StreamInitializer>,
    promise: Arc<Mutex<Option<oneshot::Sender<Result<PooledChannel>>>>>,
    timeout: Option<runtime::AsyncJoinHandle<()>>,
}

impl Waiter {
    pub(crate) fn new(
        id: WaiterId,
        deadline: Instant,
        initializer: Arc<dyn StreamInitializer>,
        promise: oneshot::Sender<Result<PooledChannel>>,
    ) -> Self {
        Self {
            id,
            deadline,
            initializer,
            promise: Arc::new(Mutex::new(Some(promise))),
            timeout: None,
        }
    }

    pub(crate) fn id(&self) -> WaiterId {
        self.id
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn deadline_is_after(&self, t: Instant) -> bool {
        self.deadline > t
    }

    /// Arms a one-shot timeout task that fails the promise with `DeadlineExceeded { cause }`
    /// once the deadline elapses, then calls `on_expiry(id)` so the pool can drop this waiter
    /// from its deque. Also races the deadline against the caller abandoning the receiving
    /// end (e.g. by dropping the future awaiting it): whichever happens first prunes the
    /// waiter, so a cancelled caller doesn't keep occupying a `max_waiters` slot until its
    /// deadline would otherwise have elapsed. Must be called exactly once, before the waiter
    /// is enqueued for servicing. `cause` is a snapshot of the pool's most recent connect
    /// error at enqueue time, not re-read when the timer fires.
    pub(crate) fn schedule_timeout<F>(&mut self, cause: Option<Error>, on_expiry: F)
    where
        F: FnOnce(WaiterId) + Send + 'static,
    {
        debug_assert!(self.timeout.is_none(), "schedule_timeout called twice");
        const CANCELLATION_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

        let id = self.id;
        let deadline = self.deadline;
        let promise = self.promise.clone();
        self.timeout = Some(runtime::spawn(async move {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let cancelled = tokio::time::timeout(remaining, async {
                loop {
                    let closed = match promise.lock().unwrap().as_ref() {
                        Some(sender) => sender.is_closed(),
                        None => true,
                    };
                    if closed {
                        return;
                    }
                    tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
                }
            })
            .await
            .is_ok();

            if let Some(sender) = promise.lock().unwrap().take() {
                if !cancelled {
                    let _ = sender.send(Err(Error::deadline_exceeded(cause)));
                }
            }
            on_expiry(id);
        }));
    }

    /// Cancels the timeout and resolves the promise with a freshly opened stream on
    /// `connection_id`'s multiplexer.
    pub(crate) fn succeed(
        mut self,
        connection_id: ConnectionId,
        multiplexer: Arc<dyn Multiplexer>,
        events: mpsc::Sender<StreamEvent>,
    ) {
        self.cancel_timeout();
        let Some(sender) = self.promise.lock().unwrap().take() else {
            return;
        };
        let initializer = self.initializer.clone();
        runtime::spawn(async move {
            match multiplexer.open_stream(initializer).await {
                Ok(channel) => {
                    let _ = events.send(StreamEvent::Opened { connection_id }).await;
                    let _ = sender.send(Ok(PooledChannel::new(channel, connection_id, events)));
                }
                Err(e) => {
                    let _ = events.send(StreamEvent::OpenFailed { connection_id }).await;
                    let _ = sender.send(Err(e));
                }
            }
        });
    }

    /// Cancels the timeout and fails the promise with `error`.
    pub(crate) fn fail(mut self, error: Error) {
        self.cancel_timeout();
        if let Some(sender) = self.promise.lock().unwrap().take() {
            let _ = sender.send(Err(error));
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}
