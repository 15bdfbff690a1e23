//! Observability: the [`PoolDelegate`] trait applications implement to observe pool
//! lifecycle events, and the `tracing`-backed emitter the pool uses internally.

mod delegate;

pub use delegate::{
    ConnectionAddedEvent,
    ConnectionClosedEvent,
    ConnectionQuiescingEvent,
    ConnectionRemovedEvent,
    ConnectionUtilizationChangedEvent,
    ConnectFailedEvent,
    ConnectSucceededEvent,
    PoolDelegate,
    StartedConnectingEvent,
};
pub(crate) use delegate::PoolEventEmitter;
