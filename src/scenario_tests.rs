//! End-to-end tests driving [`crate::PoolManager`] through the mock transport in
//! [`crate::testing`], exercising the same paths a real transport crate would.
//!
//! Background workers make progress on their own tokio tasks; these tests poll for observable
//! state with short real sleeps rather than hand-synchronizing with the worker internals.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;

use crate::{
    error::StatusCode,
    event::{
        ConnectFailedEvent,
        ConnectSucceededEvent,
        ConnectionAddedEvent,
        ConnectionClosedEvent,
        ConnectionQuiescingEvent,
        ConnectionRemovedEvent,
        ConnectionUtilizationChangedEvent,
        PoolDelegate,
        StartedConnectingEvent,
    },
    options::{ConnectionPoolOptions, Endpoint, PoolManagerOptions, ShutdownMode},
    pool::ConnectionId,
    testing::MockDialer,
    transport::{Channel, StreamInitializer},
    BackoffPolicy,
    PoolManager,
};

fn endpoint() -> Endpoint {
    Endpoint::builder().host("localhost").port(4443).build()
}

struct NoopInit;

impl StreamInitializer for NoopInit {
    fn init(&self, _channel: &Channel) {}
}

async fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordedEvent {
    Added(ConnectionId),
    Removed(ConnectionId),
    Connecting(ConnectionId),
    ConnectFailed(ConnectionId),
    ConnectSucceeded(ConnectionId, u32),
    Utilization(ConnectionId, u32, u32),
    Quiescing(ConnectionId),
    Closed(ConnectionId),
}

struct RecordingDelegate {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingDelegate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn count(&self, pred: impl Fn(&RecordedEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl PoolDelegate for RecordingDelegate {
    fn connection_added(&self, event: ConnectionAddedEvent) {
        self.events.lock().unwrap().push(RecordedEvent::Added(event.connection_id));
    }

    fn connection_removed(&self, event: ConnectionRemovedEvent) {
        self.events.lock().unwrap().push(RecordedEvent::Removed(event.connection_id));
    }

    fn started_connecting(&self, event: StartedConnectingEvent) {
        self.events.lock().unwrap().push(RecordedEvent::Connecting(event.connection_id));
    }

    fn connect_failed(&self, event: ConnectFailedEvent) {
        self.events.lock().unwrap().push(RecordedEvent::ConnectFailed(event.connection_id));
    }

    fn connect_succeeded(&self, event: ConnectSucceededEvent) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::ConnectSucceeded(event.connection_id, event.stream_capacity));
    }

    fn connection_utilization_changed(&self, event: ConnectionUtilizationChangedEvent) {
        self.events.lock().unwrap().push(RecordedEvent::Utilization(
            event.connection_id,
            event.streams_used,
            event.stream_capacity,
        ));
    }

    fn connection_quiescing(&self, event: ConnectionQuiescingEvent) {
        self.events.lock().unwrap().push(RecordedEvent::Quiescing(event.connection_id));
    }

    fn connection_closed(&self, event: ConnectionClosedEvent) {
        self.events.lock().unwrap().push(RecordedEvent::Closed(event.connection_id));
    }
}

#[tokio::test]
async fn happy_path_single_stream() {
    let dialer = Arc::new(MockDialer::new());
    let options = PoolManagerOptions::builder()
        .endpoint(endpoint())
        .pool_options(
            ConnectionPoolOptions::builder()
                .connections_per_pool(1)
                // A single request shouldn't need to pile up waiters to cross the default
                // 0.8 load threshold before the only connection manager starts dialing.
                .reservation_load_threshold(0.0)
                .assumed_max_concurrent_streams(100)
                .build(),
        )
        .build();
    let manager = Arc::new(PoolManager::new([0u64], dialer.clone(), options, None).unwrap());

    let deadline = Instant::now() + Duration::from_secs(30);
    let request = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };

    wait_for(|| dialer.connection(0).is_some(), "dial to start").await;
    let handle = dialer.connection(0).unwrap();
    handle.push_settings(100);

    let (channel, executor) = request.await.unwrap().unwrap();
    assert_eq!(executor, 0);
    assert_eq!(handle.streams_opened(), 1);

    drop(channel);
    wait_for(|| handle.streams_opened() == 1, "stream accounting settles").await;
}

#[tokio::test]
async fn saturation_enqueues_a_waiter_that_resolves_on_release() {
    let dialer = Arc::new(MockDialer::new());
    let options = PoolManagerOptions::builder()
        .endpoint(endpoint())
        .pool_options(
            ConnectionPoolOptions::builder()
                .connections_per_pool(1)
                .reservation_load_threshold(0.0)
                .build(),
        )
        .build();
    let manager = Arc::new(PoolManager::new([0u64], dialer.clone(), options, None).unwrap());

    let deadline = Instant::now() + Duration::from_secs(30);
    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    wait_for(|| dialer.connection(0).is_some(), "dial to start").await;
    let handle = dialer.connection(0).unwrap();
    handle.push_settings(1);
    let (first_channel, _) = first.await.unwrap().unwrap();

    let second = {
        let manager = manager.clone();
        let deadline = Instant::now() + Duration::from_secs(5);
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    // Give the second request a moment to find the connection saturated and enqueue as a
    // waiter rather than racing ahead of the drop below.
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(first_channel);

    let (second_channel, _) = second.await.unwrap().unwrap();
    assert_eq!(handle.streams_opened(), 2);
    drop(second_channel);
}

#[tokio::test]
async fn too_many_waiters_fails_the_caller_immediately() {
    let dialer = Arc::new(MockDialer::new());
    let options = PoolManagerOptions::builder()
        .endpoint(endpoint())
        .pool_options(ConnectionPoolOptions::builder().connections_per_pool(1).max_waiters(2).build())
        .build();
    let manager = Arc::new(PoolManager::new([0u64], dialer, options, None).unwrap());
    let deadline = Instant::now() + Duration::from_secs(30);

    // Nothing ever receives SETTINGS here, so every request below finds the sole connection
    // manager unavailable and queues as a waiter instead of resolving.
    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let third = manager.make_stream(None, deadline, Arc::new(NoopInit)).await;
    let err = third.unwrap_err();
    assert_eq!(err.to_status_code(), StatusCode::ResourceExhausted);

    first.abort();
    second.abort();
}

#[tokio::test]
async fn cancelling_a_waiter_frees_its_queue_slot_before_its_deadline() {
    let dialer = Arc::new(MockDialer::new());
    let options = PoolManagerOptions::builder()
        .endpoint(endpoint())
        .pool_options(ConnectionPoolOptions::builder().connections_per_pool(1).max_waiters(1).build())
        .build();
    let manager = Arc::new(PoolManager::new([0u64], dialer, options, None).unwrap());

    // Nothing ever receives SETTINGS, so this enqueues as a waiter with a deadline far in the
    // future rather than resolving.
    let long_deadline = Instant::now() + Duration::from_secs(60);
    let cancelled = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, long_deadline, Arc::new(NoopInit)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancelled.abort();

    // Give the cancellation race in the waiter's scheduled timeout a chance to notice the
    // abandoned receiver and prune it from the queue.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // With the slot freed, a second request queues instead of being rejected outright; it then
    // times out on its own short deadline rather than failing with a full-queue error.
    let short_deadline = Instant::now() + Duration::from_millis(50);
    let err = manager.make_stream(None, short_deadline, Arc::new(NoopInit)).await.unwrap_err();
    assert_eq!(err.to_status_code(), StatusCode::DeadlineExceeded);
}

#[tokio::test]
async fn goaway_quiescing_keeps_existing_streams_and_replaces_the_connection() {
    let dialer = Arc::new(MockDialer::new());
    let delegate = RecordingDelegate::new();
    let options = PoolManagerOptions::builder()
        .endpoint(endpoint())
        .pool_options(
            ConnectionPoolOptions::builder()
                .connections_per_pool(1)
                .reservation_load_threshold(0.0)
                .build(),
        )
        .build();
    let manager = Arc::new(
        PoolManager::new([0u64], dialer.clone(), options, Some(delegate.clone() as Arc<dyn PoolDelegate>)).unwrap(),
    );

    let deadline = Instant::now() + Duration::from_secs(30);
    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    wait_for(|| dialer.connection(0).is_some(), "first dial").await;
    let original = dialer.connection(0).unwrap();
    original.push_settings(2);
    let (channel_a, _) = first.await.unwrap().unwrap();
    let (channel_b, _) = manager.make_stream(None, deadline, Arc::new(NoopInit)).await.unwrap();
    assert_eq!(original.streams_opened(), 2);

    original.push_goaway(None);
    wait_for(
        || delegate.count(|e| matches!(e, RecordedEvent::Quiescing(_))) == 1,
        "quiescing observed",
    )
    .await;

    // A fresh request is routed to the replacement connection manager, not the quiescing one.
    let replacement_request = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    wait_for(|| dialer.connection(1).is_some(), "replacement dial").await;
    let replacement = dialer.connection(1).unwrap();
    replacement.push_settings(5);
    let (channel_c, _) = replacement_request.await.unwrap().unwrap();
    assert_eq!(replacement.streams_opened(), 1);
    assert_eq!(original.streams_opened(), 2);

    drop(channel_a);
    drop(channel_b);
    drop(channel_c);
}

#[tokio::test]
async fn deadline_exceeded_while_backing_off_carries_the_connect_failure_as_cause() {
    let dialer = Arc::new(MockDialer::new());
    dialer.fail_next_dial(crate::Error::internal("handshake failed"));
    let delegate = RecordingDelegate::new();
    let options = PoolManagerOptions::builder()
        .endpoint(endpoint())
        .pool_options(
            ConnectionPoolOptions::builder()
                .connections_per_pool(1)
                .reservation_load_threshold(0.0)
                .backoff_policy(BackoffPolicy::builder().initial(Duration::from_secs(60)).build())
                .build(),
        )
        .build();
    let manager = Arc::new(
        PoolManager::new([0u64], dialer, options, Some(delegate.clone() as Arc<dyn PoolDelegate>)).unwrap(),
    );

    let first_deadline = Instant::now() + Duration::from_millis(50);
    let first_err = manager.make_stream(None, first_deadline, Arc::new(NoopInit)).await.unwrap_err();
    assert_eq!(first_err.to_status_code(), StatusCode::DeadlineExceeded);

    wait_for(
        || delegate.count(|e| matches!(e, RecordedEvent::ConnectFailed(_))) == 1,
        "connect failure recorded",
    )
    .await;

    // With a 60s backoff in effect the connection manager won't retry before this waiter's
    // own short deadline elapses, and by now the pool has a recorded connect failure to
    // attach as the cause.
    let second_deadline = Instant::now() + Duration::from_millis(50);
    let second_err = manager.make_stream(None, second_deadline, Arc::new(NoopInit)).await.unwrap_err();
    assert_eq!(second_err.to_status_code(), StatusCode::DeadlineExceeded);
    assert!(second_err.cause().is_some());
}

#[tokio::test]
async fn graceful_shutdown_fails_waiters_immediately_and_closes_connections() {
    let dialer = Arc::new(MockDialer::new());
    let options = PoolManagerOptions::builder()
        .endpoint(endpoint())
        .pool_options(
            ConnectionPoolOptions::builder()
                .connections_per_pool(1)
                .reservation_load_threshold(0.0)
                .build(),
        )
        .build();
    let manager = Arc::new(PoolManager::new([0u64], dialer.clone(), options, None).unwrap());

    let deadline = Instant::now() + Duration::from_secs(30);
    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    wait_for(|| dialer.connection(0).is_some(), "dial").await;
    let handle = dialer.connection(0).unwrap();
    handle.push_settings(1);
    let (channel, _) = first.await.unwrap().unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.make_stream(None, deadline, Arc::new(NoopInit)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let shutdown = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .shutdown(ShutdownMode::Graceful {
                    deadline: Duration::from_secs(10),
                })
                .await
        })
    };

    let waiter_err = waiter.await.unwrap().unwrap_err();
    assert_eq!(waiter_err.to_status_code(), StatusCode::Unavailable);

    drop(channel);
    shutdown.await.unwrap();
    assert_eq!(handle.shutdown_count(), 1);

    let after_shutdown = manager.make_stream(None, deadline, Arc::new(NoopInit)).await;
    assert_eq!(after_shutdown.unwrap_err().to_status_code(), StatusCode::Unavailable);
}
