//! Per-node pool of live connections: lease, release, and a background health sweep.

mod connection;
mod manager;

pub use connection::{Connection, ConnectionEstablisher, Transport};

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerAddress,
    error::{Error, ErrorKind, Result},
};

use manager::{PoolManagementRequest, PoolManager};

struct Shared {
    address: ServerAddress,
    establisher: Arc<dyn ConnectionEstablisher>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    generation: AtomicU64,
    next_id: AtomicU64,
    closed: AtomicBool,
    slot_available: Notify,
    manager: PoolManager,
}

/// Bounded pool of connections to a single node.
///
/// Cheaply cloneable; clones share the same idle set, generation counter, and background
/// check-in worker.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(
        address: ServerAddress,
        max_pool_size: u32,
        establisher: Arc<dyn ConnectionEstablisher>,
    ) -> Self {
        let (manager, receiver) = PoolManager::new();
        let shared = Arc::new(Shared {
            address,
            establisher,
            semaphore: Arc::new(Semaphore::new(max_pool_size.max(1) as usize)),
            idle: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            slot_available: Notify::new(),
            manager,
        });

        tokio::spawn(run_worker(shared.clone(), receiver));

        Self { shared }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.shared.address
    }

    /// Leases a connection: reused from the idle set if one is healthy and current, otherwise
    /// freshly established, otherwise an error. Waiters are served in roughly the order they
    /// started waiting, since `Notify::notified` futures are woken in registration order.
    pub async fn acquire(&self, timeout: Duration, cancel: &CancellationToken) -> Result<Connection> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(Error::from(ErrorKind::PoolClosed {
                    address: self.shared.address.clone(),
                }));
            }

            if let Some(conn) = self.try_take_idle().await {
                return Ok(conn);
            }

            if let Ok(permit) = self.shared.semaphore.clone().try_acquire_owned() {
                return self.establish(permit).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::from(ErrorKind::timeout(timeout)));
            }

            let notified = self.shared.slot_available.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(Error::from(ErrorKind::timeout(timeout)));
                }
                _ = cancel.cancelled() => {
                    return Err(Error::from(ErrorKind::Cancelled));
                }
            }
        }
    }

    async fn try_take_idle(&self) -> Option<Connection> {
        let current_generation = self.shared.generation.load(Ordering::SeqCst);
        let mut idle = self.shared.idle.lock().await;
        while let Some(conn) = idle.pop_front() {
            if conn.generation != current_generation || !conn.is_healthy() {
                conn.close();
                continue;
            }
            let mut conn = conn;
            conn.mark_checked_out(self.shared.manager.clone());
            return Some(conn);
        }
        None
    }

    async fn establish(&self, permit: tokio::sync::OwnedSemaphorePermit) -> Result<Connection> {
        match self.shared.establisher.establish(&self.shared.address).await {
            Ok(transport) => {
                let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
                let generation = self.shared.generation.load(Ordering::SeqCst);
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(address = %self.shared.address, id, "connection established");
                let mut conn = Connection::new(id, self.shared.address.clone(), generation, transport, permit);
                conn.mark_checked_out(self.shared.manager.clone());
                Ok(conn)
            }
            Err(e) => {
                drop(permit);
                self.shared.slot_available.notify_one();
                Err(e)
            }
        }
    }

    /// Bumps the generation so idle and in-flight connections are discarded as they're next
    /// encountered, without forcibly severing connections currently in use.
    pub fn clear(&self) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(address = %self.shared.address, "clearing pool");
        self.shared.manager.clear();
    }

    /// Refuses further acquires and closes every idle connection; connections currently checked
    /// out are closed as they're checked back in. Idempotent.
    pub fn close(&self) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(address = %self.shared.address, "closing pool");
        self.shared.manager.close();
    }
}

async fn run_worker(shared: Arc<Shared>, mut receiver: tokio::sync::mpsc::UnboundedReceiver<PoolManagementRequest>) {
    while let Some(request) = receiver.recv().await {
        match request {
            PoolManagementRequest::CheckIn(conn) => {
                let current_generation = shared.generation.load(Ordering::SeqCst);
                let stale = shared.closed.load(Ordering::SeqCst)
                    || conn.generation != current_generation
                    || !conn.is_healthy();
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(address = %shared.address, id = conn.id(), stale, "connection checked in");
                if stale {
                    conn.close();
                } else {
                    shared.idle.lock().await.push_back(conn);
                }
                shared.slot_available.notify_one();
            }
            PoolManagementRequest::Clear => {
                shared.generation.fetch_add(1, Ordering::SeqCst);
                let mut idle = shared.idle.lock().await;
                for conn in idle.drain(..) {
                    conn.close();
                }
                drop(idle);
                shared.slot_available.notify_waiters();
            }
            PoolManagementRequest::Close => {
                shared.closed.store(true, Ordering::SeqCst);
                let mut idle = shared.idle.lock().await;
                for conn in idle.drain(..) {
                    conn.close();
                }
                drop(idle);
                shared.slot_available.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::pool::connection::Transport;

    #[derive(Debug)]
    struct FakeTransport;
    impl Transport for FakeTransport {}

    #[derive(Debug, Default)]
    struct FakeEstablisher {
        established: AtomicU32,
    }

    #[async_trait]
    impl ConnectionEstablisher for FakeEstablisher {
        async fn establish(&self, _address: &ServerAddress) -> Result<Box<dyn Transport>> {
            self.established.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeTransport))
        }
    }

    fn pool(max_pool_size: u32) -> (ConnectionPool, Arc<FakeEstablisher>) {
        let establisher = Arc::new(FakeEstablisher::default());
        let pool = ConnectionPool::new(
            ServerAddress::new("localhost", 27017),
            max_pool_size,
            establisher.clone(),
        );
        (pool, establisher)
    }

    #[tokio::test]
    async fn acquire_reuses_checked_in_connection() {
        let (pool, establisher) = pool(1);
        let cancel = CancellationToken::new();

        let conn = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        let id = conn.id();
        drop(conn);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let conn2 = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(conn2.id(), id);
        assert_eq!(establisher.established.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let (pool, _establisher) = pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let err = pool
            .acquire(Duration::from_millis(20), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn acquire_after_close_fails() {
        let (pool, _establisher) = pool(1);
        pool.close();
        tokio::task::yield_now().await;

        let cancel = CancellationToken::new();
        let err = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap_err();
        assert!(matches!(&*err.kind, ErrorKind::PoolClosed { .. }));
    }

    #[tokio::test]
    async fn cancel_wakes_a_blocked_waiter() {
        let (pool, _establisher) = pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            pool.acquire(Duration::from_secs(5), &waiter_cancel).await
        });
        tokio::task::yield_now().await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }
}
