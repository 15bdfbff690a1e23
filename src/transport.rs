//! The small set of object-safe traits a real transport crate (or the mock transport in
//! [`crate::testing`]) implements to plug into the pool.
//!
//! TLS, HTTP/2 framing, and record encoding are assumed to live behind these traits; the pool
//! only ever calls through them.

use std::{any::Any, fmt, sync::Arc, time::Duration};

use crate::{
    error::Result,
    options::{Endpoint, ShutdownMode, TlsConfig},
};

pub(crate) use futures_core::future::BoxFuture;

/// Connection-level settings forwarded verbatim from [`crate::options::ConnectionPoolOptions`]
/// to the transport at dial time. The core never interprets these itself; it has no hook to act
/// on an idle connection or send a keepalive PING, since that lives entirely behind
/// [`Connection`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOptions {
    /// How long a connection may sit idle (no open streams) before the transport should
    /// consider closing it, e.g. by sending GOAWAY.
    pub idle_timeout: Option<Duration>,
    /// The transport-level keepalive interval, e.g. an HTTP/2 PING cadence.
    pub keepalive: Option<Duration>,
}

/// Dials a new connection to an [`Endpoint`].
pub trait Dialer: Send + Sync + 'static {
    /// Establishes a new connection, including TLS and the HTTP/2 handshake.
    fn dial(
        &self,
        endpoint: &Endpoint,
        tls_config: Option<&TlsConfig>,
        connect_options: ConnectOptions,
    ) -> BoxFuture<'static, Result<Box<dyn Connection>>>;
}

/// A single dialed HTTP/2 connection.
///
/// The connection manager owns exactly one of these at a time and drains its event stream in
/// a loop until it closes or errors.
pub trait Connection: Send + 'static {
    /// Returns a handle that can open new HTTP/2 streams on this connection.
    fn multiplexer(&self) -> Arc<dyn Multiplexer>;

    /// Waits for the next lifecycle event on this connection (a SETTINGS update, a GOAWAY, an
    /// I/O error, or a clean close). Must be called in a loop; once it yields
    /// [`ConnectionEvent::Closed`] or an error it will not be called again.
    fn next_event(&mut self) -> BoxFuture<'_, ConnectionEvent>;

    /// Shuts the connection down. Forceful cancels in-flight streams; graceful drains them.
    fn shutdown(&mut self, mode: ShutdownMode) -> BoxFuture<'_, ()>;
}

/// A lifecycle event emitted by a [`Connection`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The peer sent a SETTINGS frame advertising a concurrent-stream limit.
    Settings {
        /// The peer's advertised `max_concurrent_streams`.
        max_concurrent_streams: u32,
    },
    /// The peer sent a GOAWAY frame. `error` is `Some` if the GOAWAY carried an error code.
    GoAway {
        /// The error the peer reported, if any.
        error: Option<crate::error::Error>,
    },
    /// An I/O error occurred on the connection.
    IoError(crate::error::Error),
    /// The connection closed cleanly with no error.
    Closed,
}

/// Opens new HTTP/2 streams on an already-established connection.
pub trait Multiplexer: Send + Sync + fmt::Debug + 'static {
    /// Opens one new HTTP/2 stream, invoking `initializer` once it is open.
    fn open_stream(&self, initializer: Arc<dyn StreamInitializer>) -> BoxFuture<'static, Result<Channel>>;
}

/// Initializes a freshly opened [`Channel`] before it is handed to the caller, e.g. to attach
/// request metadata.
pub trait StreamInitializer: Send + Sync + 'static {
    /// Called once the stream is open, before the channel is returned to the caller.
    fn init(&self, channel: &Channel);
}

/// Wraps a `std::io::Error` as a pool [`Error`](crate::error::Error), for transport
/// implementations to use when surfacing an I/O failure through [`ConnectionEvent::IoError`]
/// or a [`Dialer::dial`]/[`Multiplexer::open_stream`] result.
pub fn io_error(source: std::io::Error) -> crate::error::Error {
    crate::error::Error::io(source)
}

/// An opaque handle to one open HTTP/2 stream, as produced by a [`Multiplexer`].
///
/// The pool never interprets the contents; it is transport-specific and downcast by callers
/// that know the concrete transport in use.
pub struct Channel(pub Box<dyn Any + Send>);

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Channel {
    /// Wraps a transport-specific stream handle.
    pub fn new(inner: impl Any + Send) -> Self {
        Self(Box::new(inner))
    }

    /// Attempts to downcast to the concrete stream handle type a transport crate produces.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}
