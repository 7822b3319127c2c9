//! The pool-managed [`Connection`] handle and the out-of-scope transport it wraps.

use std::{fmt, time::Instant};

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;

use crate::{config::ServerAddress, error::Result};

use super::manager::PoolManager;

/// The actual wire-protocol socket. Establishing, framing, and driving OP_MSG traffic over this
/// is entirely out of this core's scope; it only needs something it can open, hand out, and
/// close.
pub trait Transport: Send + fmt::Debug {
    /// A cheap, non-blocking liveness check (e.g. a socket error flag), consulted before a
    /// connection is handed back out of the idle set.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens a [`Transport`] to a node. Production callers implement this on top of their
/// wire-protocol and handshake/authentication stack; tests implement it against an in-memory
/// fake.
#[async_trait]
pub trait ConnectionEstablisher: Send + Sync + fmt::Debug {
    async fn establish(&self, address: &ServerAddress) -> Result<Box<dyn Transport>>;
}

/// A leased or idle connection to one node.
///
/// Carries a reference to the pool that created it so it can self-return when dropped, per the
/// disposal model described for [`crate::channel::ChannelProvider`]: releasing a `Connection` is
/// just letting it go out of scope.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u64,
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) time_created: Instant,
    pub(super) pool_manager: Option<PoolManager>,
    pub(super) permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    pub(super) fn new(
        id: u64,
        address: ServerAddress,
        generation: u64,
        transport: Box<dyn Transport>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            transport: Some(transport),
            time_created: Instant::now(),
            pool_manager: None,
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.transport.as_deref().map(Transport::is_healthy).unwrap_or(false)
    }

    pub(super) fn mark_checked_out(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
    }

    /// Detaches this connection from its pool and drops its transport without checking it back
    /// in, used when the pool discards a stale or unhealthy connection.
    pub(super) fn close(mut self) {
        self.pool_manager.take();
        self.transport.take();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(pool_manager) = self.pool_manager.take() {
            let returning = Connection {
                id: self.id,
                address: self.address.clone(),
                generation: self.generation,
                transport: self.transport.take(),
                time_created: self.time_created,
                pool_manager: None,
                permit: self.permit.take(),
            };
            pool_manager.check_in(returning);
        }
    }
}
