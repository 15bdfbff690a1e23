use tokio::sync::mpsc;

/// Handle to a worker task. Once all handles have been dropped, the worker may stop waiting
/// for new requests and exit.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

impl WorkerHandle {
    #[cfg(test)]
    pub(crate) fn new_mocked() -> Self {
        let (handle, _listener) = WorkerHandleListener::channel();
        handle
    }
}

/// Listener used by a worker task to determine when all of its [`WorkerHandle`]s have been
/// dropped.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    /// Resolves once every [`WorkerHandle`] for this listener has been dropped. Only ever
    /// polled via `select!` or alongside a timeout, since it otherwise never returns.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }

    /// Returns whether at least one handle is still alive.
    pub(crate) fn is_alive(&mut self) -> bool {
        !matches!(
            self.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }

    /// Constructs a new handle/listener pair for a worker task.
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (WorkerHandle { _sender: sender }, WorkerHandleListener { receiver })
    }
}
