//! A mock transport for exercising the pool without a real HTTP/2 stack.
//!
//! [`MockDialer`] hands out [`MockConnection`]s whose lifecycle a test drives explicitly
//! through a [`MockConnectionHandle`]: push a SETTINGS update, a GOAWAY, an I/O error, or just
//! let [`MockMultiplexer::open_stream`] fail on command. Every dialed connection's handle is
//! recoverable from the [`MockDialer`] itself, keyed by dial order, so a test can reach in and
//! drive connection N's state machine after the pool has already started using it.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::{mpsc, Notify};

use crate::{
    error::{Error, Result},
    options::{Endpoint, ShutdownMode, TlsConfig},
    transport::{BoxFuture, Channel, Connection, ConnectOptions, ConnectionEvent, Dialer, Multiplexer, StreamInitializer},
};

/// Dials [`MockConnection`]s instead of a real transport.
///
/// By default every dial succeeds immediately. Call [`MockDialer::fail_next_dial`] to make a
/// specific future dial fail instead, e.g. to exercise backoff after a handshake failure.
pub struct MockDialer {
    handles: Mutex<Vec<MockConnectionHandle>>,
    dial_count: AtomicUsize,
    pending_failures: Mutex<VecDeque<Error>>,
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDialer {
    /// Creates a dialer with no connections dialed yet.
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            dial_count: AtomicUsize::new(0),
            pending_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// The next `dial_count` calls to [`Dialer::dial`] fail with `error` instead of succeeding,
    /// one failure consumed per call, in order.
    pub fn fail_next_dial(&self, error: Error) {
        self.pending_failures.lock().unwrap().push_back(error);
    }

    /// A handle to the `n`th connection dialed so far (0-indexed), if it has been dialed yet.
    pub fn connection(&self, n: usize) -> Option<MockConnectionHandle> {
        self.handles.lock().unwrap().get(n).cloned()
    }

    /// The number of successful dials so far.
    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }
}

impl Dialer for MockDialer {
    fn dial(
        &self,
        _endpoint: &Endpoint,
        _tls_config: Option<&TlsConfig>,
        _connect_options: ConnectOptions,
    ) -> BoxFuture<'static, Result<Box<dyn Connection>>> {
        let failure = self.pending_failures.lock().unwrap().pop_front();
        let result = match failure {
            Some(error) => Err(error),
            None => {
                self.dial_count.fetch_add(1, Ordering::SeqCst);
                let (connection, handle) = MockConnection::new();
                self.handles.lock().unwrap().push(handle);
                Ok(Box::new(connection) as Box<dyn Connection>)
            }
        };
        Box::pin(async move { result })
    }
}

enum Driven {
    Event(ConnectionEvent),
    Shutdown,
}

/// Drives the lifecycle of a connection a [`MockDialer`] produced.
///
/// Cloning a handle shares the same underlying connection; every clone can push events or
/// observe the open-stream/shutdown counters.
#[derive(Clone)]
pub struct MockConnectionHandle {
    events: mpsc::UnboundedSender<Driven>,
    state: Arc<MockConnectionState>,
}

struct MockConnectionState {
    streams_opened: AtomicUsize,
    fail_next_open_stream: Mutex<Option<Error>>,
    shutdown_called: Notify,
    shutdown_count: AtomicUsize,
}

impl Default for MockConnectionState {
    fn default() -> Self {
        Self {
            streams_opened: AtomicUsize::new(0),
            fail_next_open_stream: Mutex::new(None),
            shutdown_called: Notify::new(),
            shutdown_count: AtomicUsize::new(0),
        }
    }
}

impl MockConnectionHandle {
    /// Pushes a SETTINGS event advertising `max_concurrent_streams`.
    pub fn push_settings(&self, max_concurrent_streams: u32) {
        let _ = self.events.send(Driven::Event(ConnectionEvent::Settings { max_concurrent_streams }));
    }

    /// Pushes a GOAWAY event, optionally carrying `error`.
    pub fn push_goaway(&self, error: Option<Error>) {
        let _ = self.events.send(Driven::Event(ConnectionEvent::GoAway { error }));
    }

    /// Pushes an I/O error event.
    pub fn push_io_error(&self, error: Error) {
        let _ = self.events.send(Driven::Event(ConnectionEvent::IoError(error)));
    }

    /// Pushes a clean-close event.
    pub fn push_closed(&self) {
        let _ = self.events.send(Driven::Event(ConnectionEvent::Closed));
    }

    /// The next call to [`Multiplexer::open_stream`] on this connection fails with `error`.
    pub fn fail_next_open_stream(&self, error: Error) {
        *self.state.fail_next_open_stream.lock().unwrap() = Some(error);
    }

    /// How many streams have been successfully opened on this connection.
    pub fn streams_opened(&self) -> usize {
        self.state.streams_opened.load(Ordering::SeqCst)
    }

    /// How many times [`Connection::shutdown`] has been called on this connection.
    pub fn shutdown_count(&self) -> usize {
        self.state.shutdown_count.load(Ordering::SeqCst)
    }

    /// Resolves once [`Connection::shutdown`] has been called at least once.
    pub async fn wait_for_shutdown(&self) {
        if self.shutdown_count() > 0 {
            return;
        }
        self.state.shutdown_called.notified().await;
    }
}

/// A connection produced by a [`MockDialer`], driven externally via [`MockConnectionHandle`].
pub struct MockConnection {
    events: mpsc::UnboundedReceiver<Driven>,
    state: Arc<MockConnectionState>,
    multiplexer: Arc<MockMultiplexer>,
}

impl MockConnection {
    fn new() -> (Self, MockConnectionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockConnectionState::default());
        let handle = MockConnectionHandle {
            events: tx,
            state: state.clone(),
        };
        let connection = Self {
            events: rx,
            state: state.clone(),
            multiplexer: Arc::new(MockMultiplexer { state }),
        };
        (connection, handle)
    }
}

impl Connection for MockConnection {
    fn multiplexer(&self) -> Arc<dyn Multiplexer> {
        self.multiplexer.clone()
    }

    fn next_event(&mut self) -> BoxFuture<'_, ConnectionEvent> {
        Box::pin(async move {
            match self.events.recv().await {
                Some(Driven::Event(event)) => event,
                Some(Driven::Shutdown) | None => ConnectionEvent::Closed,
            }
        })
    }

    fn shutdown(&mut self, _mode: ShutdownMode) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.shutdown_count.fetch_add(1, Ordering::SeqCst);
            self.state.shutdown_called.notify_waiters();
        })
    }
}

struct MockMultiplexer {
    state: Arc<MockConnectionState>,
}

impl std::fmt::Debug for MockMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMultiplexer").finish_non_exhaustive()
    }
}

impl Multiplexer for MockMultiplexer {
    fn open_stream(&self, initializer: Arc<dyn StreamInitializer>) -> BoxFuture<'static, Result<Channel>> {
        let state = self.state.clone();
        Box::pin(async move {
            if let Some(error) = state.fail_next_open_stream.lock().unwrap().take() {
                return Err(error);
            }
            state.streams_opened.fetch_add(1, Ordering::SeqCst);
            let channel = Channel::new(());
            initializer.init(&channel);
            Ok(channel)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn dial_succeeds_by_default_and_opens_streams() {
        let dialer = MockDialer::new();
        let mut connection = dialer.dial(&test_endpoint(), None, ConnectOptions::default()).await.unwrap();
        let handle = dialer.connection(0).unwrap();

        let multiplexer = connection.multiplexer();
        struct NoopInit;
        impl StreamInitializer for NoopInit {
            fn init(&self, _channel: &Channel) {}
        }
        multiplexer.open_stream(Arc::new(NoopInit)).await.unwrap();
        assert_eq!(handle.streams_opened(), 1);

        handle.push_settings(50);
        let event = connection.next_event().await;
        assert!(matches!(event, ConnectionEvent::Settings { max_concurrent_streams: 50 }));
    }

    #[tokio::test]
    async fn fail_next_dial_is_consumed_once() {
        let dialer = MockDialer::new();
        dialer.fail_next_dial(Error::internal("handshake failed"));
        assert!(dialer.dial(&test_endpoint(), None, ConnectOptions::default()).await.is_err());
        assert!(dialer.dial(&test_endpoint(), None, ConnectOptions::default()).await.is_ok());
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_is_observable() {
        let dialer = MockDialer::new();
        let mut connection = dialer.dial(&test_endpoint(), None, ConnectOptions::default()).await.unwrap();
        let handle = dialer.connection(0).unwrap();
        connection.shutdown(ShutdownMode::Forceful).await;
        assert_eq!(handle.shutdown_count(), 1);
    }

    fn test_endpoint() -> Endpoint {
        Endpoint::builder().host("localhost").port(1).build()
    }
}
