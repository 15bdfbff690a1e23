use std::sync::Arc;

use crate::{error::Error, pool::ConnectionId};

/// Event emitted when a connection manager is added to a pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionAddedEvent {
    /// The id of the connection manager that was added.
    pub connection_id: ConnectionId,
}

/// Event emitted when a connection manager is removed from a pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionRemovedEvent {
    /// The id of the connection manager that was removed.
    pub connection_id: ConnectionId,
}

/// Event emitted when a connection manager begins dialing.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct StartedConnectingEvent {
    /// The id of the connection manager.
    pub connection_id: ConnectionId,
}

/// Event emitted when a connection attempt fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectFailedEvent {
    /// The id of the connection manager.
    pub connection_id: ConnectionId,
    /// The error the attempt failed with.
    pub error: Error,
}

/// Event emitted when a connection becomes ready to serve streams.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectSucceededEvent {
    /// The id of the connection manager.
    pub connection_id: ConnectionId,
    /// The peer's advertised concurrent-stream capacity.
    pub stream_capacity: u32,
}

/// Event emitted when a connection's stream utilization changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionUtilizationChangedEvent {
    /// The id of the connection manager.
    pub connection_id: ConnectionId,
    /// The number of streams currently open on the connection.
    pub streams_used: u32,
    /// The peer's advertised concurrent-stream capacity.
    pub stream_capacity: u32,
}

/// Event emitted when a connection starts quiescing after receiving GOAWAY.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionQuiescingEvent {
    /// The id of the connection manager.
    pub connection_id: ConnectionId,
}

/// Event emitted when a connection closes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The id of the connection manager.
    pub connection_id: ConnectionId,
    /// The error that caused the close, if any.
    pub error: Option<Error>,
}

/// Observes pool lifecycle events.
///
/// Every method has a no-op default: implementors override only the events they care about.
/// Methods are invoked on the owning pool's executor and must not block.
pub trait PoolDelegate: Send + Sync {
    /// A connection manager was added to a pool.
    fn connection_added(&self, _event: ConnectionAddedEvent) {}

    /// A connection manager was removed from a pool.
    fn connection_removed(&self, _event: ConnectionRemovedEvent) {}

    /// A connection manager began dialing.
    fn started_connecting(&self, _event: StartedConnectingEvent) {}

    /// A connection attempt failed.
    fn connect_failed(&self, _event: ConnectFailedEvent) {}

    /// A connection became ready to serve streams.
    fn connect_succeeded(&self, _event: ConnectSucceededEvent) {}

    /// A connection's stream utilization changed.
    fn connection_utilization_changed(&self, _event: ConnectionUtilizationChangedEvent) {}

    /// A connection started quiescing.
    fn connection_quiescing(&self, _event: ConnectionQuiescingEvent) {}

    /// A connection closed.
    fn connection_closed(&self, _event: ConnectionClosedEvent) {}
}

/// A delegate that does nothing; the default when no delegate is configured.
pub(crate) struct NoopDelegate;

impl PoolDelegate for NoopDelegate {}

/// Forwards pool lifecycle events both to `tracing` and to a user-supplied [`PoolDelegate`].
#[derive(Clone)]
pub(crate) struct PoolEventEmitter {
    delegate: Arc<dyn PoolDelegate>,
}

impl PoolEventEmitter {
    pub(crate) fn new(delegate: Option<Arc<dyn PoolDelegate>>) -> Self {
        Self {
            delegate: delegate.unwrap_or_else(|| Arc::new(NoopDelegate)),
        }
    }

    pub(crate) fn connection_added(&self, connection_id: ConnectionId) {
        tracing::debug!(connection_id, "connection added");
        self.delegate
            .connection_added(ConnectionAddedEvent { connection_id });
    }

    pub(crate) fn connection_removed(&self, connection_id: ConnectionId) {
        tracing::debug!(connection_id, "connection removed");
        self.delegate
            .connection_removed(ConnectionRemovedEvent { connection_id });
    }

    pub(crate) fn started_connecting(&self, connection_id: ConnectionId) {
        tracing::debug!(connection_id, "connecting");
        self.delegate
            .started_connecting(StartedConnectingEvent { connection_id });
    }

    pub(crate) fn connect_failed(&self, connection_id: ConnectionId, error: Error) {
        tracing::warn!(connection_id, %error, "connect failed");
        self.delegate
            .connect_failed(ConnectFailedEvent { connection_id, error });
    }

    pub(crate) fn connect_succeeded(&self, connection_id: ConnectionId, stream_capacity: u32) {
        tracing::debug!(connection_id, stream_capacity, "connect succeeded");
        self.delegate.connect_succeeded(ConnectSucceededEvent {
            connection_id,
            stream_capacity,
        });
    }

    pub(crate) fn utilization_changed(
        &self,
        connection_id: ConnectionId,
        streams_used: u32,
        stream_capacity: u32,
    ) {
        tracing::trace!(connection_id, streams_used, stream_capacity, "utilization changed");
        self.delegate
            .connection_utilization_changed(ConnectionUtilizationChangedEvent {
                connection_id,
                streams_used,
                stream_capacity,
            });
    }

    pub(crate) fn quiescing(&self, connection_id: ConnectionId) {
        tracing::debug!(connection_id, "quiescing");
        self.delegate
            .connection_quiescing(ConnectionQuiescingEvent { connection_id });
    }

    pub(crate) fn connection_closed(&self, connection_id: ConnectionId, error: Option<Error>) {
        tracing::debug!(connection_id, error = ?error, "connection closed");
        self.delegate
            .connection_closed(ConnectionClosedEvent { connection_id, error });
    }
}
