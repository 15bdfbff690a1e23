#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod backoff;
pub mod error;
pub mod event;
pub mod options;
mod pool;
mod runtime;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod scenario_tests;

pub use backoff::BackoffPolicy;
pub use error::{Error, ErrorKind, Result, StatusCode};
pub use options::{ConnectionPoolOptions, Endpoint, PoolManagerOptions, ShutdownMode, TlsConfig};
pub use pool::{PoolManager, PooledChannel};
