//! Contains the [`Error`] and [`Result`] types that this crate uses.

use thiserror::Error as ThisError;

use crate::pool::{ConnectionId, LoopId};

/// The result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A status code a pool error can be mapped to for surfacing over the wire, mirroring the
/// subset of gRPC status codes a connection pool can produce on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum StatusCode {
    /// The pool (or the connection manager serving the request) has shut down.
    #[display("UNAVAILABLE")]
    Unavailable,
    /// The pool's waiter queue is full.
    #[display("RESOURCE_EXHAUSTED")]
    ResourceExhausted,
    /// The caller's deadline elapsed before a stream could be reserved.
    #[display("DEADLINE_EXCEEDED")]
    DeadlineExceeded,
    /// A value supplied by the caller was invalid.
    #[display("INVALID_ARGUMENT")]
    InvalidArgument,
    /// An error whose cause lies outside the pool (I/O, handshake, transport).
    #[display("INTERNAL")]
    Internal,
}

/// An error that can occur while using this crate.
///
/// The inner [`ErrorKind`] is boxed to keep `Error` small to move around; a `source` chain
/// lets a `TooManyWaiters` or `DeadlineExceeded` failure carry the pool's last known connect
/// error as its cause.
#[derive(Debug, ThisError)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: Box<ErrorKind>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            source: self.source.clone(),
        }
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    pub(crate) fn with_cause(kind: ErrorKind, cause: Option<Error>) -> Self {
        Self {
            kind: Box::new(kind),
            source: cause.map(Box::new),
        }
    }

    /// The pool (or the connection manager serving the request) has shut down.
    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown)
    }

    pub(crate) fn too_many_waiters(cause: Option<Error>) -> Self {
        Self::with_cause(ErrorKind::TooManyWaiters, cause)
    }

    pub(crate) fn deadline_exceeded(cause: Option<Error>) -> Self {
        Self::with_cause(ErrorKind::DeadlineExceeded, cause)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            message: message.into(),
        })
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            message: message.into(),
        })
    }

    /// Wraps a `std::io::Error` observed on an established connection.
    pub fn io(source: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(source.to_string()))
    }

    pub(crate) fn unknown_connection(id: ConnectionId) -> Self {
        Self::new(ErrorKind::UnknownConnection { id })
    }

    pub(crate) fn duplicate_executor(id: LoopId) -> Self {
        Self::new(ErrorKind::DuplicateExecutor { id })
    }

    /// The most specific [`StatusCode`] this error maps to.
    pub fn to_status_code(&self) -> StatusCode {
        self.kind.to_status_code()
    }

    /// The innermost cause of this error, if any was recorded.
    pub fn cause(&self) -> Option<&Error> {
        self.source.as_deref()
    }
}

/// The specific kind of error that occurred.
#[derive(Clone, Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The pool has shut down, or is shutting down, and can no longer serve requests.
    #[error("the connection pool has shut down")]
    Shutdown,

    /// The pool's waiter queue was full when a stream was requested.
    #[error("too many requests are already waiting for a stream")]
    TooManyWaiters,

    /// The caller's deadline elapsed before a stream could be reserved.
    #[error("deadline exceeded while waiting for a stream")]
    DeadlineExceeded,

    /// A configuration value supplied by the caller was invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// A human-readable description of what was invalid.
        message: String,
    },

    /// Dialing or handshaking with the remote endpoint failed.
    #[error("failed to connect: {message}")]
    Connect {
        /// A human-readable description of the failure.
        message: String,
    },

    /// The remote endpoint rejected the connection for reasons that cannot be retried, e.g. a
    /// TLS verification failure or a transport-level configuration error.
    #[error("unrecoverable connection error: {message}")]
    Fatal {
        /// A human-readable description of the failure.
        message: String,
    },

    /// An I/O error occurred on an established connection.
    #[error("i/o error: {0}")]
    Io(String),

    /// A request referenced a connection id the pool does not recognize. This indicates a
    /// programming error.
    #[error("unknown connection id {id}")]
    UnknownConnection {
        /// The unrecognized id.
        id: ConnectionId,
    },

    /// Construction of a [`crate::pool::PoolManager`] was attempted with two pools bound to
    /// the same executor.
    #[error("duplicate executor id {id} in pool manager configuration")]
    DuplicateExecutor {
        /// The duplicated executor id.
        id: LoopId,
    },

    /// An internal invariant was violated. Only ever produced in release builds; debug builds
    /// assert instead.
    #[error("internal error: {message}")]
    Internal {
        /// A human-readable description of the violated invariant.
        message: String,
    },
}

impl ErrorKind {
    fn to_status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Shutdown => StatusCode::Unavailable,
            ErrorKind::TooManyWaiters => StatusCode::ResourceExhausted,
            ErrorKind::DeadlineExceeded => StatusCode::DeadlineExceeded,
            ErrorKind::InvalidArgument { .. } => StatusCode::InvalidArgument,
            ErrorKind::Connect { .. } | ErrorKind::Fatal { .. } | ErrorKind::Io(_) => {
                StatusCode::Internal
            }
            ErrorKind::UnknownConnection { .. } | ErrorKind::DuplicateExecutor { .. } => {
                StatusCode::Internal
            }
            ErrorKind::Internal { .. } => StatusCode::Internal,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_code_mapping_is_exhaustive() {
        let cases = [
            (ErrorKind::Shutdown, StatusCode::Unavailable),
            (ErrorKind::TooManyWaiters, StatusCode::ResourceExhausted),
            (ErrorKind::DeadlineExceeded, StatusCode::DeadlineExceeded),
            (
                ErrorKind::InvalidArgument {
                    message: "x".into(),
                },
                StatusCode::InvalidArgument,
            ),
            (
                ErrorKind::Connect {
                    message: "x".into(),
                },
                StatusCode::Internal,
            ),
            (
                ErrorKind::Fatal {
                    message: "x".into(),
                },
                StatusCode::Internal,
            ),
            (ErrorKind::Io("x".into()), StatusCode::Internal),
            (
                ErrorKind::UnknownConnection { id: 0 },
                StatusCode::Internal,
            ),
            (
                ErrorKind::DuplicateExecutor { id: 0 },
                StatusCode::Internal,
            ),
            (
                ErrorKind::Internal {
                    message: "x".into(),
                },
                StatusCode::Internal,
            ),
        ];
        for (kind, expected) in cases {
            assert_eq!(kind.to_status_code(), expected, "{kind:?}");
        }
    }

    #[test]
    fn too_many_waiters_carries_cause() {
        let cause = Error::internal("dial failed");
        let err = Error::too_many_waiters(Some(cause));
        assert_eq!(err.to_status_code(), StatusCode::ResourceExhausted);
        assert!(err.cause().is_some());
    }
}
