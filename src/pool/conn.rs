//! Connection Manager: drives one HTTP/2 connection's lifecycle from dial through shutdown.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    backoff::{Backoff, BackoffPolicy},
    error::{Error, ErrorKind},
    event::PoolEventEmitter,
    options::{Endpoint, ShutdownMode, TlsConfig},
    pool::{ConnectionId, LoopId},
    runtime::{self},
    transport::{Connection, ConnectOptions, ConnectionEvent, Dialer, Multiplexer},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// The connectivity state of a [`ConnectionManager`], without the payload carried by
/// `TransientFailure`. Used for comparisons and for the pool's idle-CM scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnStateKind {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Events a connection manager reports to its owning pool. Sent over a channel the pool
/// drains on its own executor, per the cyclic-reference guidance in the design notes: the CM
/// never holds a reference back into the pool.
pub(crate) enum CmEvent {
    StateChanged {
        id: ConnectionId,
        old: ConnStateKind,
        new: ConnStateKind,
        error: Option<Error>,
    },
    Settings {
        id: ConnectionId,
        max_concurrent_streams: u32,
        multiplexer: Arc<dyn Multiplexer>,
    },
    Quiescing {
        id: ConnectionId,
    },
}

enum CmCommand {
    Start,
    Shutdown(ShutdownMode, oneshot::Sender<()>),
}

/// A handle to a running connection manager task.
pub(crate) struct ConnectionManagerHandle {
    id: ConnectionId,
    executor: LoopId,
    commands: mpsc::Sender<CmCommand>,
    state: watch::Receiver<ConnStateKind>,
}

impl ConnectionManagerHandle {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn executor(&self) -> LoopId {
        self.executor
    }

    pub(crate) fn state(&self) -> ConnStateKind {
        *self.state.borrow()
    }

    /// Idempotent request to begin dialing if currently idle; ignored otherwise.
    pub(crate) fn start(&self) {
        let _ = self.commands.try_send(CmCommand::Start);
    }

    pub(crate) async fn shutdown(&self, mode: ShutdownMode) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(CmCommand::Shutdown(mode, tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Requests shutdown without waiting for it to complete; completion is instead observed
    /// via the `CmEvent::StateChanged` transition to `Shutdown` on the events channel. Used by
    /// the owning pool, which already drains that channel and would otherwise deadlock waiting
    /// on every connection manager's shutdown in turn.
    pub(crate) fn request_shutdown(&self, mode: ShutdownMode) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.commands.try_send(CmCommand::Shutdown(mode, tx));
    }
}

/// Spawns a new connection manager in the `idle` state and returns a handle to it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    id: ConnectionId,
    executor: LoopId,
    dialer: Arc<dyn Dialer>,
    endpoint: Endpoint,
    tls_config: Option<TlsConfig>,
    backoff_policy: BackoffPolicy,
    connect_options: ConnectOptions,
    events: mpsc::Sender<CmEvent>,
    delegate: PoolEventEmitter,
) -> ConnectionManagerHandle {
    let (commands_tx, commands_rx) = mpsc::channel(8);
    let (state_tx, state_rx) = watch::channel(ConnStateKind::Idle);

    let worker = ConnectionManagerWorker {
        id,
        executor,
        dialer,
        endpoint,
        tls_config,
        connect_options,
        backoff: Backoff::new(backoff_policy),
        events,
        delegate,
        commands: commands_rx,
        commands_closed: false,
        state: state_tx,
        connection: None,
    };
    runtime::spawn(worker.run());

    ConnectionManagerHandle {
        id,
        executor,
        commands: commands_tx,
        state: state_rx,
    }
}

struct ConnectionManagerWorker {
    id: ConnectionId,
    executor: LoopId,
    dialer: Arc<dyn Dialer>,
    endpoint: Endpoint,
    tls_config: Option<TlsConfig>,
    connect_options: ConnectOptions,
    backoff: Backoff,
    events: mpsc::Sender<CmEvent>,
    delegate: PoolEventEmitter,
    commands: mpsc::Receiver<CmCommand>,
    commands_closed: bool,
    state: watch::Sender<ConnStateKind>,
    connection: Option<Box<dyn Connection>>,
}

impl ConnectionManagerWorker {
    async fn run(mut self) {
        loop {
            let kind = *self.state.borrow();
            match kind {
                ConnStateKind::Idle => {
                    if !self.run_idle().await {
                        return;
                    }
                }
                ConnStateKind::Connecting => {
                    if !self.run_connecting().await {
                        return;
                    }
                }
                ConnStateKind::Ready => {
                    if !self.run_ready().await {
                        return;
                    }
                }
                ConnStateKind::TransientFailure => {
                    if !self.run_transient_failure().await {
                        return;
                    }
                }
                ConnStateKind::Shutdown => return,
            }
        }
    }

    fn transition(&mut self, new: ConnStateKind, error: Option<Error>) {
        let old = *self.state.borrow();
        if old == new {
            return;
        }
        let _ = self.state.send(new);
        let _ = self.events.try_send(CmEvent::StateChanged {
            id: self.id,
            old,
            new,
            error,
        });
    }

    /// Waits for a command. Returns `false` once the worker should exit.
    async fn run_idle(&mut self) -> bool {
        let cmd = self.commands.recv().await;
        self.handle_command_or_exit(cmd, ConnStateKind::Idle).await
    }

    async fn run_connecting(&mut self) -> bool {
        self.delegate.started_connecting(self.id);
        let dial = self
            .dialer
            .dial(&self.endpoint, self.tls_config.as_ref(), self.connect_options);
        let dial_result = tokio::select! {
            biased;
            cmd = self.commands.recv() => {
                return self.handle_command_or_exit(cmd, ConnStateKind::Connecting).await;
            }
            result = dial => result,
        };

        let mut connection = match dial_result {
            Ok(connection) => connection,
            Err(e) => return self.handle_connect_failure(e),
        };

        match connection.next_event().await {
            ConnectionEvent::Settings {
                max_concurrent_streams,
            } => {
                self.connection = Some(connection);
                self.backoff.reset();
                self.transition(ConnStateKind::Ready, None);
                let multiplexer = self.connection.as_ref().unwrap().multiplexer();
                self.delegate.connect_succeeded(self.id, max_concurrent_streams);
                let _ = self
                    .events
                    .send(CmEvent::Settings {
                        id: self.id,
                        max_concurrent_streams,
                        multiplexer,
                    })
                    .await;
                true
            }
            ConnectionEvent::IoError(e) => self.handle_connect_failure(e),
            ConnectionEvent::GoAway { error } => self.handle_connect_failure(
                error.unwrap_or_else(|| Error::internal("GOAWAY during handshake")),
            ),
            ConnectionEvent::Closed => {
                self.handle_connect_failure(Error::internal("connection closed during handshake"))
            }
        }
    }

    fn handle_connect_failure(&mut self, error: Error) -> bool {
        self.delegate.connect_failed(self.id, error.clone());
        if matches!(*error.kind, ErrorKind::Fatal { .. }) {
            self.transition(ConnStateKind::Shutdown, Some(error));
            false
        } else {
            self.transition(ConnStateKind::TransientFailure, Some(error));
            true
        }
    }

    /// Dropping the handle while `Ready` (e.g. after a quiescing hand-off, per the design
    /// notes on replacing a quiescing CM with a fresh idle one) must not forcefully kill
    /// streams still open on this connection, unlike every other state. Once the commands
    /// channel closes here we stop selecting on it and just keep draining connection events
    /// until the connection itself closes.
    async fn run_ready(&mut self) -> bool {
        if self.commands_closed {
            let event = self
                .connection
                .as_mut()
                .expect("ready state without a connection")
                .next_event()
                .await;
            return self.handle_ready_event(event).await;
        }
        tokio::select! {
            biased;
            cmd = self.commands.recv() => {
                match cmd {
                    Some(CmCommand::Start) => true,
                    Some(CmCommand::Shutdown(mode, ack)) => {
                        self.finish_shutdown(mode, Some(ack)).await;
                        false
                    }
                    None => {
                        self.commands_closed = true;
                        true
                    }
                }
            }
            event = self.connection.as_mut().expect("ready state without a connection").next_event() => {
                self.handle_ready_event(event).await
            }
        }
    }

    async fn handle_ready_event(&mut self, event: ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Settings {
                max_concurrent_streams,
            } => {
                self.backoff.reset();
                let multiplexer = self.connection.as_ref().unwrap().multiplexer();
                let _ = self
                    .events
                    .send(CmEvent::Settings {
                        id: self.id,
                        max_concurrent_streams,
                        multiplexer,
                    })
                    .await;
                true
            }
            ConnectionEvent::GoAway { error: None } => {
                self.delegate.quiescing(self.id);
                let _ = self.events.send(CmEvent::Quiescing { id: self.id }).await;
                true
            }
            ConnectionEvent::GoAway { error: Some(e) } => {
                self.transition(ConnStateKind::TransientFailure, Some(e));
                true
            }
            ConnectionEvent::IoError(e) => {
                self.transition(ConnStateKind::TransientFailure, Some(e));
                true
            }
            ConnectionEvent::Closed => {
                self.transition(ConnStateKind::Idle, None);
                true
            }
        }
    }

    async fn run_transient_failure(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        tokio::select! {
            biased;
            cmd = self.commands.recv() => self.handle_command_or_exit(cmd, ConnStateKind::TransientFailure).await,
            _ = runtime::sleep(delay) => {
                self.transition(ConnStateKind::Connecting, None);
                true
            }
        }
    }

    /// Handles a command received while in `from`. Returns `false` once the worker should
    /// exit (a command channel close or an explicit shutdown).
    async fn handle_command_or_exit(
        &mut self,
        cmd: Option<CmCommand>,
        from: ConnStateKind,
    ) -> bool {
        match cmd {
            Some(CmCommand::Start) => {
                if from == ConnStateKind::Idle {
                    self.transition(ConnStateKind::Connecting, None);
                }
                true
            }
            Some(CmCommand::Shutdown(mode, ack)) => {
                self.finish_shutdown(mode, Some(ack)).await;
                false
            }
            None => {
                self.finish_shutdown(ShutdownMode::Forceful, None).await;
                false
            }
        }
    }

    async fn finish_shutdown(&mut self, mode: ShutdownMode, ack: Option<oneshot::Sender<()>>) {
        if let Some(connection) = self.connection.as_mut() {
            connection.shutdown(mode).await;
        }
        self.transition(ConnStateKind::Shutdown, None);
        self.delegate.connection_closed(self.id, None);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}
