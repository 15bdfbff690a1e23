//! Configuration types for the pool manager, its per-executor pools, and the connection
//! managers they own.
//!
//! Every optional field is a [`TypedBuilder`] field with `#[builder(default)]`, so callers
//! only set what they care about.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::backoff::BackoffPolicy;

/// The remote endpoint a [`crate::pool::PoolManager`] connects to.
///
/// The pool targets exactly one endpoint; multi-endpoint load balancing is out of scope.
#[derive(Clone, Debug, TypedBuilder)]
pub struct Endpoint {
    /// The host to dial.
    #[builder(setter(into))]
    pub host: String,

    /// The port to dial.
    pub port: u16,

    /// An authority override to present during the handshake (e.g. for SNI or `:authority`
    /// pseudo-header purposes) instead of `host`.
    #[builder(default, setter(into, strip_option))]
    pub authority_override: Option<String>,
}

impl Endpoint {
    /// The authority to present in the handshake: the override if set, else `host:port`.
    pub fn authority(&self) -> String {
        self.authority_override
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

/// An opaque TLS configuration handle. The pool never interprets its contents; it is handed
/// verbatim to [`crate::transport::Dialer::dial`].
#[derive(Clone, Debug)]
pub struct TlsConfig(pub(crate) std::sync::Arc<dyn std::any::Any + Send + Sync>);

impl TlsConfig {
    /// Wraps an arbitrary transport-specific TLS configuration value.
    pub fn new(inner: impl std::any::Any + Send + Sync) -> Self {
        Self(std::sync::Arc::new(inner))
    }

    /// Attempts to downcast back to the concrete TLS configuration type a transport crate
    /// expects.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// How a connection, pool, or manager should shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Close immediately, cancelling in-flight streams.
    Forceful,
    /// Stop accepting new work, wait for in-flight streams to finish (up to the deadline), then
    /// close.
    Graceful {
        /// How long to wait for in-flight streams before closing anyway.
        deadline: Duration,
    },
}

/// Options for a single per-executor [`crate::pool::ConnectionPool`].
#[derive(Clone, Debug, TypedBuilder)]
pub struct ConnectionPoolOptions {
    /// Upper bound on concurrent connection managers in the pool.
    #[builder(default = 4)]
    pub connections_per_pool: u32,

    /// Upper bound on queued waiters.
    #[builder(default = 64)]
    pub max_waiters: usize,

    /// If `(reserved + waiters) / capacity >= threshold`, the pool attempts to wake an idle
    /// connection manager. Must be in `[0.0, 1.0]`.
    #[builder(default = 0.8)]
    pub reservation_load_threshold: f64,

    /// Used for a connection manager's capacity while it has not yet received a SETTINGS
    /// frame.
    #[builder(default = 100)]
    pub assumed_max_concurrent_streams: u32,

    /// How long a caller's `make_stream` request waits before failing with
    /// `DeadlineExceeded`, when the caller does not supply an explicit deadline.
    #[builder(default = Duration::from_secs(10))]
    pub max_wait_time: Duration,

    /// Forwarded to every connection manager in the pool.
    #[builder(default)]
    pub backoff_policy: BackoffPolicy,

    /// Forwarded to every connection manager; how long a `ready`, unused connection may sit
    /// idle before the pool considers replacing it.
    #[builder(default, setter(strip_option))]
    pub idle_timeout: Option<Duration>,

    /// Forwarded to every connection manager; transport-level keepalive interval.
    #[builder(default, setter(strip_option))]
    pub keepalive: Option<Duration>,
}

/// Options for a [`crate::pool::PoolManager`] and the fleet of pools it owns.
#[derive(Clone, Debug, TypedBuilder)]
pub struct PoolManagerOptions {
    /// The endpoint every pool in the fleet connects to.
    pub endpoint: Endpoint,

    /// Opaque TLS configuration, if the transport should use TLS.
    #[builder(default, setter(strip_option))]
    pub tls_config: Option<TlsConfig>,

    /// Options applied to every per-executor pool in the fleet.
    #[builder(default)]
    pub pool_options: ConnectionPoolOptions,
}

impl Default for ConnectionPoolOptions {
    fn default() -> Self {
        ConnectionPoolOptions::builder().build()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_pool_options_defaults() {
        let opts = ConnectionPoolOptions::default();
        assert_eq!(opts.connections_per_pool, 4);
        assert_eq!(opts.max_waiters, 64);
        assert!((opts.reservation_load_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(opts.assumed_max_concurrent_streams, 100);
        assert_eq!(opts.max_wait_time, Duration::from_secs(10));
        assert!(opts.idle_timeout.is_none());
        assert!(opts.keepalive.is_none());
    }

    #[test]
    fn endpoint_authority_defaults_to_host_port() {
        let endpoint = Endpoint::builder().host("example.test").port(443).build();
        assert_eq!(endpoint.authority(), "example.test:443");
    }

    #[test]
    fn endpoint_authority_override_wins() {
        let endpoint = Endpoint::builder()
            .host("10.0.0.1")
            .port(443)
            .authority_override("example.test")
            .build();
        assert_eq!(endpoint.authority(), "example.test");
    }
}
