//! Single-operation source of connections, enforcing pinning and dispose-chaining.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerAddress,
    error::{Error, ErrorKind, Result},
    node::NodeDescription,
    pool::{Connection, ConnectionPool},
};

/// A non-owning back-reference a [`ChannelProvider`] uses to (optionally) dispose the
/// [`crate::session::Session`] that created it, without the two holding a real ownership cycle.
pub(crate) trait SessionDisposer: Send + Sync {
    fn dispose(&self);
}

/// What a [`ChannelProvider`] hands its caller for one operation.
///
/// The `Pinned` variant is the "disposal-guard" described for a session that has committed to a
/// connection: dropping it never returns the connection to the pool, because the `Arc` it wraps
/// is also held by the session. Only the session's own final drop of its `Arc` actually checks
/// the connection back in. The `Owned` variant is a plain leased connection; dropping it returns
/// it to the pool immediately, same as any other [`Connection`].
pub enum Channel {
    Owned(Connection),
    Pinned(ServerAddress, Arc<AsyncMutex<Connection>>),
}

impl Channel {
    pub fn address(&self) -> ServerAddress {
        match self {
            Channel::Owned(conn) => conn.address().clone(),
            Channel::Pinned(address, _) => address.clone(),
        }
    }

    /// Runs `f` against the underlying connection, locking it first if it's shared.
    pub async fn with_connection<R>(&mut self, f: impl FnOnce(&mut Connection) -> R) -> R {
        match self {
            Channel::Owned(conn) => f(conn),
            Channel::Pinned(_, conn) => {
                let mut guard = conn.lock().await;
                f(&mut guard)
            }
        }
    }
}

/// Scoped acquisition of a [`Channel`] for one operation.
///
/// Constructed by a [`crate::session::Session`] with a node already selected; disposing it
/// releases whatever it owns exactly once, in any order of repeated calls.
pub struct ChannelProvider {
    node: NodeDescription,
    pool: ConnectionPool,
    pinned: Option<Arc<AsyncMutex<Connection>>>,
    session: Option<Weak<dyn SessionDisposer>>,
    dispose_session_on_close: bool,
    disposed: bool,
}

impl ChannelProvider {
    /// A provider that leases a fresh connection from `pool` on every `get_channel` call.
    pub(crate) fn leased(
        node: NodeDescription,
        pool: ConnectionPool,
        session: Option<Weak<dyn SessionDisposer>>,
        dispose_session_on_close: bool,
    ) -> Self {
        Self {
            node,
            pool,
            pinned: None,
            session,
            dispose_session_on_close,
            disposed: false,
        }
    }

    /// A provider wrapping a connection the session has already pinned.
    pub(crate) fn pinned(
        node: NodeDescription,
        pool: ConnectionPool,
        connection: Arc<AsyncMutex<Connection>>,
        session: Option<Weak<dyn SessionDisposer>>,
        dispose_session_on_close: bool,
    ) -> Self {
        Self {
            node,
            pool,
            pinned: Some(connection),
            session,
            dispose_session_on_close,
            disposed: false,
        }
    }

    pub fn server(&self) -> Result<&NodeDescription> {
        if self.disposed {
            return Err(Error::from(ErrorKind::Disposed));
        }
        Ok(&self.node)
    }

    /// Returns the channel for this operation: the pinned connection (consumer's drop is a
    /// no-op) or a freshly leased one (consumer owns disposal).
    pub async fn get_channel(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<Channel> {
        if self.disposed {
            return Err(Error::from(ErrorKind::Disposed));
        }

        match &self.pinned {
            Some(conn) => Ok(Channel::Pinned(self.node.address().clone(), conn.clone())),
            None => {
                let conn = self.pool.acquire(timeout, cancel).await?;
                Ok(Channel::Owned(conn))
            }
        }
    }

    /// Idempotent: releases the borrowed connection this provider itself leased (a pinned
    /// connection is left alone; the session owns disposing that), then optionally disposes the
    /// session.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if self.dispose_session_on_close {
            if let Some(session) = self.session.as_ref().and_then(Weak::upgrade) {
                session.dispose();
            }
        }
    }
}

impl Drop for ChannelProvider {
    fn drop(&mut self) {
        self.dispose();
    }
}
