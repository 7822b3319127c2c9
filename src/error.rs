//! Contains the `Error` and `Result` types used throughout the routing core.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::config::ServerAddress;

/// The result type returned by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while routing an operation to a node.
///
/// The inner [`ErrorKind`] is wrapped in an `Arc` so that `Error` can be cheaply cloned and
/// handed to multiple waiters (e.g. every thread blocked in [`crate::pool::ConnectionPool::acquire`]
/// when the pool is cleared because of a single failure).
#[derive(Clone, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    pub kind: Arc<ErrorKind>,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    /// Returns `true` if this error represents the operation having timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Timeout { .. })
    }

    /// Returns `true` if this error represents cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Cancelled { .. })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// The category of failure that occurred. New variants may be added in minor releases, so
/// callers should not exhaustively match on this enum without a wildcard arm.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An operation was attempted against a [`crate::cluster::Cluster`] that is not in the
    /// `Connected` state.
    #[error("cluster is not connected")]
    ClusterNotConnected,

    /// No node matching the given selection criteria could be found within the allotted time.
    #[error("server selection timed out: {message}")]
    NoNodeSelected { message: String },

    /// A node that a [`crate::session::Session`] had pinned has drifted out of the criteria
    /// that selected it (e.g. it stepped down from primary).
    #[error("pinned node {address} is no longer acceptable: {message}")]
    NodeNoLongerAcceptable {
        address: ServerAddress,
        message: String,
    },

    /// The node that a session had pinned no longer matches the read preference supplied for
    /// the current operation. The caller (the retry layer above this core) decides whether to
    /// retry with a fresh session.
    #[error("node selection lost for pinned node {address}")]
    NodeSelectionLost { address: ServerAddress },

    /// The [`crate::pool::ConnectionPool`] has been closed or is closing.
    #[error("connection pool for {address} is closed")]
    PoolClosed { address: ServerAddress },

    /// A blocking wait exceeded its configured timeout.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The caller's cancellation signal fired before the operation completed.
    #[error("operation was cancelled")]
    Cancelled,

    /// A network-level connect attempt to a node failed.
    #[error("failed to connect to {address}: {message}")]
    ConnectFailed {
        address: ServerAddress,
        message: String,
    },

    /// A method was called on a [`crate::session::Session`] or
    /// [`crate::channel::ChannelProvider`] after it was disposed.
    #[error("object has already been disposed")]
    Disposed,

    /// A node's reported wire-version range is incompatible with this driver.
    #[error("server at {address} is incompatible: {message}")]
    IncompatibleServer {
        address: ServerAddress,
        message: String,
    },

    /// An argument supplied by the caller was invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An invariant internal to the core was violated. Seeing this indicates a bug in the core
    /// itself rather than misuse by a caller.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ErrorKind {
    pub(crate) fn timeout(duration: std::time::Duration) -> ErrorKind {
        ErrorKind::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }
}
