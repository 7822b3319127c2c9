//! The operation-scoped router: consults a [`SessionMode`] to decide how aggressively to pin a
//! node or connection across a sequence of operations.

use std::{
    sync::{Arc, Mutex as SyncMutex, Weak},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{ChannelProvider, SessionDisposer},
    cluster::Cluster,
    error::{Error, ErrorKind, Result},
    node::NodeDescription,
    pool::Connection,
    selection::{NodeSelector, ReadPreference},
};

/// The consistency mode a [`Session`] enforces across its lifetime. See the module-level
/// behavioural description in [`Session::create_channel_provider`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionMode {
    /// No pinning; every operation re-selects according to its own read preference.
    #[default]
    EventuallyConsistent,
    /// Reads may go anywhere until the first write, after which every subsequent operation
    /// (read or write) is pinned to the primary.
    Monotonic,
    /// Pins a single connection, shared between reads and writes when they resolve to the same
    /// node (notably: a mongos under `Nearest`).
    SingleChannel,
    /// Pins exactly one node (not connection) on the first operation, of either kind.
    SingleNode,
    /// Pins one node for reads and a (possibly different) node for writes; no connection
    /// pinning.
    DualNode,
}

/// Caller-supplied parameters for one operation.
pub struct OperationOptions {
    pub read_preference: ReadPreference,
    pub is_query: bool,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub dispose_session_on_close: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Fresh,
    Pinned,
    Disposed,
}

struct State {
    lifecycle: Lifecycle,
    query_node: Option<NodeDescription>,
    write_node: Option<NodeDescription>,
    query_connection: Option<Arc<AsyncMutex<Connection>>>,
    write_connection: Option<Arc<AsyncMutex<Connection>>>,
    bound_to_primary: bool,
}

impl State {
    fn fresh() -> Self {
        Self {
            lifecycle: Lifecycle::Fresh,
            query_node: None,
            write_node: None,
            query_connection: None,
            write_connection: None,
            bound_to_primary: false,
        }
    }
}

struct Inner {
    cluster: Cluster,
    mode: SessionMode,
    state: SyncMutex<State>,
}

impl SessionDisposer for Inner {
    fn dispose(&self) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        dispose_locked(&mut state);
    }
}

/// A single-operation-at-a-time router from `(read preference, operation kind)` to a
/// [`ChannelProvider`], per the session's [`SessionMode`].
///
/// Not safe to share across concurrently running operations: the contract is one operation in
/// flight per `Session` at a time. Cloning a `Session` hands out another handle to the same
/// underlying state (useful for holding onto a disposer reference) but does not grant concurrent
/// access.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(cluster: Cluster, mode: SessionMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                mode,
                state: SyncMutex::new(State::fresh()),
            }),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.mode
    }

    fn disposer(&self) -> Weak<dyn SessionDisposer> {
        let weak: Weak<dyn SessionDisposer> = Arc::downgrade(&self.inner);
        weak
    }

    /// The central state-machine entry point. See each [`SessionMode`] variant's doc comment for
    /// the pinning rule it applies.
    pub async fn create_channel_provider(
        &self,
        opts: OperationOptions,
    ) -> Result<ChannelProvider> {
        {
            let state = self.inner.state.lock().expect("session state lock poisoned");
            if state.lifecycle == Lifecycle::Disposed {
                return Err(Error::from(ErrorKind::Disposed));
            }
        }

        let provider = match self.inner.mode {
            SessionMode::EventuallyConsistent => self.create_eventually_consistent(opts).await,
            SessionMode::Monotonic => self.create_monotonic(opts).await,
            SessionMode::SingleChannel => self.create_single_channel(opts).await,
            SessionMode::SingleNode => self.create_single_node(opts).await,
            SessionMode::DualNode => self.create_dual_node(opts).await,
        }?;

        Ok(provider)
    }

    async fn select(
        &self,
        read_preference: &ReadPreference,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(NodeDescription, NodeSelector)> {
        let selector = NodeSelector::from_read_preference(read_preference.clone());
        let node = self.inner.cluster.select_node(&selector, timeout, cancel).await?;
        Ok((node, selector))
    }

    async fn leased_provider(
        &self,
        node: NodeDescription,
        dispose_session_on_close: bool,
    ) -> Result<ChannelProvider> {
        let pool = self.inner.cluster.pool_for(node.address()).await;
        Ok(ChannelProvider::leased(
            node,
            pool,
            Some(self.disposer()),
            dispose_session_on_close,
        ))
    }

    async fn create_eventually_consistent(&self, opts: OperationOptions) -> Result<ChannelProvider> {
        let (node, _selector) = self
            .select(&opts.read_preference, opts.timeout, &opts.cancel)
            .await?;
        self.leased_provider(node, opts.dispose_session_on_close).await
    }

    async fn create_monotonic(&self, opts: OperationOptions) -> Result<ChannelProvider> {
        let pinned = {
            let state = self.inner.state.lock().expect("session state lock poisoned");
            state.write_node.clone()
        };

        let node = match pinned {
            // Once bound, every later operation (read or write) is re-validated against the same
            // primary pin rather than re-selected: a primary that has since stepped down must
            // surface as `NodeNoLongerAcceptable`, not silently swap in the new one.
            Some(node) => {
                self.inner
                    .cluster
                    .ensure_acceptable(&NodeSelector::Primary, &node)?;
                node
            }
            None if !opts.is_query => {
                let (node, selector) = self
                    .select(&ReadPreference::Primary, opts.timeout, &opts.cancel)
                    .await?;
                self.inner.cluster.ensure_acceptable(&selector, &node)?;

                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(address = %node.address(), "monotonic session pinned to primary");
                let mut state = self.inner.state.lock().expect("session state lock poisoned");
                state.bound_to_primary = true;
                state.lifecycle = Lifecycle::Pinned;
                state.write_node = Some(node.clone());
                node
            }
            None => {
                let (node, selector) = self
                    .select(&opts.read_preference, opts.timeout, &opts.cancel)
                    .await?;
                self.inner.cluster.ensure_acceptable(&selector, &node)?;
                node
            }
        };

        self.leased_provider(node, opts.dispose_session_on_close).await
    }

    async fn create_single_node(&self, opts: OperationOptions) -> Result<ChannelProvider> {
        let pinned = {
            let state = self.inner.state.lock().expect("session state lock poisoned");
            state.query_node.clone()
        };

        let node = match pinned {
            Some(node) => {
                let selector = NodeSelector::from_read_preference(opts.read_preference.clone());
                self.inner.cluster.ensure_acceptable(&selector, &node)?;
                node
            }
            None => {
                let (node, _selector) = self
                    .select(&opts.read_preference, opts.timeout, &opts.cancel)
                    .await?;
                let mut state = self.inner.state.lock().expect("session state lock poisoned");
                state.lifecycle = Lifecycle::Pinned;
                state.query_node = Some(node.clone());
                node
            }
        };

        self.leased_provider(node, opts.dispose_session_on_close).await
    }

    async fn create_dual_node(&self, opts: OperationOptions) -> Result<ChannelProvider> {
        let pinned = {
            let state = self.inner.state.lock().expect("session state lock poisoned");
            if opts.is_query {
                state.query_node.clone()
            } else {
                state.write_node.clone()
            }
        };

        let node = match pinned {
            Some(node) => {
                let selector = NodeSelector::from_read_preference(opts.read_preference.clone());
                self.inner.cluster.ensure_acceptable(&selector, &node)?;
                node
            }
            None => {
                let (node, _selector) = self
                    .select(&opts.read_preference, opts.timeout, &opts.cancel)
                    .await?;
                let mut state = self.inner.state.lock().expect("session state lock poisoned");
                state.lifecycle = Lifecycle::Pinned;
                if opts.is_query {
                    state.query_node = Some(node.clone());
                } else {
                    state.write_node = Some(node.clone());
                }
                node
            }
        };

        self.leased_provider(node, opts.dispose_session_on_close).await
    }

    /// Implements the full reuse rule from the session's consistency contract: a write reuses
    /// an already-pinned query connection iff the query node is the primary, and vice versa for
    /// reads; after the first write, reads transparently move to the write-pinned connection.
    ///
    /// Every reuse of an already-pinned node is re-validated against the current topology first
    /// (the same `ensure_acceptable` cross-check every other [`SessionMode`] applies): a pinned
    /// write node that has since stepped down fails the call with `NodeNoLongerAcceptable`, and a
    /// pinned query node that no longer satisfies this operation's read preference fails with
    /// `NodeSelectionLost` rather than silently picking a different node out from under the
    /// session's single-channel guarantee.
    async fn create_single_channel(&self, opts: OperationOptions) -> Result<ChannelProvider> {
        enum Plan {
            ReuseQuery,
            ReuseWrite,
            Fresh(NodeDescription, NodeSelector),
        }

        enum Pinned {
            Write(NodeDescription),
            QueryForRead(NodeDescription),
            QueryForPromotion(NodeDescription),
        }

        let pinned = {
            let state = self.inner.state.lock().expect("session state lock poisoned");

            if opts.is_query && state.bound_to_primary && state.write_connection.is_some() {
                Some(Pinned::Write(
                    state.write_node.clone().expect("write node must be pinned alongside write_connection"),
                ))
            } else if opts.is_query {
                match (&state.query_connection, &state.query_node) {
                    (Some(_), Some(node)) => Some(Pinned::QueryForRead(node.clone())),
                    _ => None,
                }
            } else if state.bound_to_primary && state.write_connection.is_some() {
                Some(Pinned::Write(
                    state.write_node.clone().expect("write node must be pinned alongside write_connection"),
                ))
            } else {
                state
                    .query_node
                    .clone()
                    .filter(|n| n.node_type().is_writable())
                    .map(Pinned::QueryForPromotion)
            }
        };

        let plan = match pinned {
            Some(Pinned::Write(node)) => {
                self.inner.cluster.ensure_acceptable(&NodeSelector::Primary, &node)?;
                Plan::ReuseWrite
            }
            Some(Pinned::QueryForPromotion(node)) => {
                self.inner.cluster.ensure_acceptable(&NodeSelector::Primary, &node)?;
                Plan::ReuseQuery
            }
            Some(Pinned::QueryForRead(node)) => {
                let selector = NodeSelector::from_read_preference(opts.read_preference.clone());
                if self.inner.cluster.ensure_acceptable(&selector, &node).is_ok() {
                    Plan::ReuseQuery
                } else {
                    return Err(Error::from(ErrorKind::NodeSelectionLost {
                        address: node.address().clone(),
                    }));
                }
            }
            None => {
                let target_read_preference = if opts.is_query {
                    opts.read_preference.clone()
                } else {
                    ReadPreference::Primary
                };
                let (node, selector) = self
                    .select(&target_read_preference, opts.timeout, &opts.cancel)
                    .await?;
                Plan::Fresh(node, selector)
            }
        };

        match plan {
            Plan::ReuseWrite => {
                let (node, conn) = {
                    let state = self.inner.state.lock().expect("session state lock poisoned");
                    (
                        state.write_node.clone().expect("write node must be pinned"),
                        state
                            .write_connection
                            .clone()
                            .expect("write connection must be pinned"),
                    )
                };
                let pool = self.inner.cluster.pool_for(node.address()).await;
                Ok(ChannelProvider::pinned(
                    node,
                    pool,
                    conn,
                    Some(self.disposer()),
                    opts.dispose_session_on_close,
                ))
            }
            Plan::ReuseQuery => {
                let (node, conn) = {
                    let state = self.inner.state.lock().expect("session state lock poisoned");
                    (
                        state.query_node.clone().expect("query node must be pinned"),
                        state
                            .query_connection
                            .clone()
                            .expect("query connection must be pinned"),
                    )
                };
                let pool = self.inner.cluster.pool_for(node.address()).await;
                if !opts.is_query {
                    let mut state = self.inner.state.lock().expect("session state lock poisoned");
                    state.write_node = Some(node.clone());
                    state.write_connection = Some(conn.clone());
                    state.bound_to_primary = true;
                }
                Ok(ChannelProvider::pinned(
                    node,
                    pool,
                    conn,
                    Some(self.disposer()),
                    opts.dispose_session_on_close,
                ))
            }
            Plan::Fresh(node, selector) => {
                self.inner.cluster.ensure_acceptable(&selector, &node)?;
                let pool = self.inner.cluster.pool_for(node.address()).await;
                let leased = pool.acquire(opts.timeout, &opts.cancel).await?;
                let shared = Arc::new(AsyncMutex::new(leased));

                let mut state = self.inner.state.lock().expect("session state lock poisoned");
                state.lifecycle = Lifecycle::Pinned;
                if opts.is_query {
                    state.query_node = Some(node.clone());
                    state.query_connection = Some(shared.clone());
                } else {
                    state.write_node = Some(node.clone());
                    state.write_connection = Some(shared.clone());
                    state.bound_to_primary = true;
                    // Monotonic-on-top: once bound to the primary, future reads move to the
                    // write-pinned connection, so the old query pin (if distinct) can free its
                    // pool slot now instead of idling for the rest of the session.
                    state.query_node.take();
                    state.query_connection.take();
                }
                drop(state);

                Ok(ChannelProvider::pinned(
                    node,
                    pool,
                    shared,
                    Some(self.disposer()),
                    opts.dispose_session_on_close,
                ))
            }
        }
    }

    /// Idempotent; releases every pinned connection/node reference exactly once, query before
    /// write.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock().expect("session state lock poisoned");
        dispose_locked(&mut state);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().expect("session state lock poisoned").lifecycle == Lifecycle::Disposed
    }
}

fn dispose_locked(state: &mut State) {
    if state.lifecycle == Lifecycle::Disposed {
        return;
    }
    #[cfg(feature = "tracing-unstable")]
    tracing::debug!("session disposed");
    state.lifecycle = Lifecycle::Disposed;
    state.query_connection.take();
    state.write_connection.take();
    state.query_node.take();
    state.write_node.take();
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::{ClusterConfig, ServerAddress},
        node::{HelloReply, HeartbeatSource, NodeType},
        pool::{ConnectionEstablisher, Transport},
    };

    #[derive(Debug)]
    struct FixedHeartbeatSource {
        node_type: NodeType,
    }

    #[async_trait]
    impl HeartbeatSource for FixedHeartbeatSource {
        async fn check(&self, _address: &ServerAddress) -> Result<(HelloReply, Duration)> {
            Ok((
                HelloReply {
                    node_type: self.node_type,
                    ..HelloReply::standalone()
                },
                Duration::from_millis(1),
            ))
        }
    }

    #[derive(Debug)]
    struct FakeTransport;
    impl Transport for FakeTransport {}

    #[derive(Debug, Default)]
    struct FakeEstablisher {
        count: AtomicU32,
    }

    #[async_trait]
    impl ConnectionEstablisher for FakeEstablisher {
        async fn establish(&self, _address: &ServerAddress) -> Result<Box<dyn Transport>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeTransport))
        }
    }

    async fn standalone_cluster() -> Cluster {
        let config = ClusterConfig::builder()
            .seeds(vec![ServerAddress::new("localhost", 27017)])
            .heartbeat_frequency(Duration::from_millis(30))
            .min_heartbeat_frequency(Duration::from_millis(5))
            .build();
        let cluster = Cluster::new(
            config,
            Arc::new(FixedHeartbeatSource {
                node_type: NodeType::Standalone,
            }),
            Arc::new(FakeEstablisher::default()),
        );
        let cancel = CancellationToken::new();
        cluster
            .connect(Duration::from_secs(2), &ReadPreference::nearest(), &cancel)
            .await
            .expect("standalone cluster should connect");
        cluster
    }

    fn opts(read_preference: ReadPreference, is_query: bool) -> OperationOptions {
        OperationOptions {
            read_preference,
            is_query,
            timeout: Duration::from_secs(2),
            cancel: CancellationToken::new(),
            dispose_session_on_close: false,
        }
    }

    #[tokio::test]
    async fn eventually_consistent_never_pins() {
        let cluster = standalone_cluster().await;
        let session = Session::new(cluster, SessionMode::EventuallyConsistent);

        let mut provider = session
            .create_channel_provider(opts(ReadPreference::nearest(), true))
            .await
            .unwrap();
        assert!(!session.is_disposed());
        provider.dispose();

        let state = session.inner.state.lock().unwrap();
        assert!(state.query_node.is_none());
    }

    #[tokio::test]
    async fn single_node_pins_first_node_for_every_operation() {
        let cluster = standalone_cluster().await;
        let session = Session::new(cluster, SessionMode::SingleNode);

        let first = session
            .create_channel_provider(opts(ReadPreference::nearest(), true))
            .await
            .unwrap();
        let first_address = first.server().unwrap().address().clone();

        let second = session
            .create_channel_provider(opts(ReadPreference::nearest(), false))
            .await
            .unwrap();
        assert_eq!(second.server().unwrap().address(), &first_address);
    }

    #[tokio::test]
    async fn single_channel_reuses_connection_when_write_targets_same_node() {
        let cluster = standalone_cluster().await;
        let session = Session::new(cluster, SessionMode::SingleChannel);

        let mut query_provider = session
            .create_channel_provider(opts(ReadPreference::nearest(), true))
            .await
            .unwrap();
        let query_channel = query_provider
            .get_channel(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        let query_id = match &query_channel {
            crate::channel::Channel::Pinned(_, conn) => conn.try_lock().unwrap().id(),
            crate::channel::Channel::Owned(conn) => conn.id(),
        };

        let mut write_provider = session
            .create_channel_provider(opts(ReadPreference::Primary, false))
            .await
            .unwrap();
        let write_channel = write_provider
            .get_channel(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        let write_id = match &write_channel {
            crate::channel::Channel::Pinned(_, conn) => conn.try_lock().unwrap().id(),
            crate::channel::Channel::Owned(conn) => conn.id(),
        };

        assert_eq!(query_id, write_id);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let cluster = standalone_cluster().await;
        let session = Session::new(cluster, SessionMode::SingleNode);
        let _ = session
            .create_channel_provider(opts(ReadPreference::nearest(), true))
            .await
            .unwrap();

        session.dispose();
        session.dispose();
        assert!(session.is_disposed());
    }
}
