//! The `Cluster` component: owns the current topology snapshot, runs one heartbeat monitor per
//! known node, and answers `select_node` calls against the latest snapshot.

mod description;
mod message;
mod monitor;

pub use description::{ClusterDescription, ClusterKind};

use std::{collections::HashMap, sync::Arc, time::{Duration, Instant}};

use tokio::sync::{watch, Mutex};

use crate::{
    config::{ClusterConfig, ServerAddress},
    error::{Error, ErrorKind, Result},
    node::{HeartbeatSource, NodeDescription},
    pool::{ConnectionEstablisher, ConnectionPool},
    selection::{NodeSelector, ReadPreference},
};

use message::ClusterMessageManager;
use monitor::Monitor;

/// Whether a [`Cluster`] currently believes it has a live connection to its deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClusterState {
    Connecting,
    Connected,
    Disconnected,
}

struct Shared {
    config: ClusterConfig,
    heartbeat_source: Arc<dyn HeartbeatSource>,
    connection_establisher: Arc<dyn ConnectionEstablisher>,
    descriptions: watch::Sender<ClusterDescription>,
    messages: ClusterMessageManager,
    state: Mutex<ClusterState>,
    monitors: Mutex<HashMap<ServerAddress, monitor::Handle>>,
    pools: Mutex<HashMap<ServerAddress, ConnectionPool>>,
}

/// Owns topology discovery for a single deployment.
///
/// Cheaply cloneable: every clone shares the same background monitors and the same snapshot, so
/// handing a `Cluster` to multiple callers (e.g. one per [`crate::session::Session`]) is the
/// intended usage.
#[derive(Clone)]
pub struct Cluster {
    shared: Arc<Shared>,
}

impl Cluster {
    /// Builds a `Cluster` in the `Connecting` state. No monitors are started until
    /// [`Cluster::connect`] is called.
    pub fn new(
        config: ClusterConfig,
        heartbeat_source: Arc<dyn HeartbeatSource>,
        connection_establisher: Arc<dyn ConnectionEstablisher>,
    ) -> Self {
        // A deployment configured with exactly one seed *and no replica set name* is addressed
        // directly: whatever that node turns out to be (standalone, a replica set member reached
        // without discovery, anything) it's the only candidate server selection ever considers,
        // so the topology kind is pinned to `Direct` from the start rather than derived from the
        // node's role. A single seed paired with a replica set name is a replica-set deployment
        // that just happens to start from one host, not a direct connection, so it's seeded as
        // `Unknown` like any other multi-seed deployment and classified once the node reports in.
        let initial = match config.seeds.as_slice() {
            [only] if config.replica_set_name.is_none() => {
                ClusterDescription::direct(NodeDescription::unknown(only.clone()))
            }
            _ => ClusterDescription::unknown(),
        };
        let (descriptions, _) = watch::channel(initial);

        Self {
            shared: Arc::new(Shared {
                config,
                heartbeat_source,
                connection_establisher,
                descriptions,
                messages: ClusterMessageManager::new(),
                state: Mutex::new(ClusterState::Connecting),
                monitors: Mutex::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the connection pool for `address`, creating it on first use.
    pub(crate) async fn pool_for(&self, address: &ServerAddress) -> ConnectionPool {
        let mut pools = self.shared.pools.lock().await;
        pools
            .entry(address.clone())
            .or_insert_with(|| {
                ConnectionPool::new(
                    address.clone(),
                    self.shared.config.max_pool_size,
                    self.shared.connection_establisher.clone(),
                )
            })
            .clone()
    }

    /// Starts a monitor for every configured seed, then blocks until a node satisfies
    /// `initial_read_preference` or `timeout`/`cancel` fires, per spec's
    /// `Connect(timeout, initialReadPreference)`. Only transitions to `Connected` once that
    /// selection succeeds; a timeout or cancellation leaves the cluster `Connecting`, with its
    /// monitors left running so a later `connect` call can pick up where this one left off.
    /// Idempotent: returns immediately if already `Connected`.
    pub async fn connect(
        &self,
        timeout: Duration,
        initial_read_preference: &ReadPreference,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        if self.state().await == ClusterState::Connected {
            return Ok(());
        }

        let seeds = self.shared.config.seeds.clone();
        for address in seeds {
            self.ensure_monitor(address).await;
        }

        let selector = NodeSelector::from_read_preference(initial_read_preference.clone());
        self.wait_for_selector(&selector, timeout, cancel).await?;

        *self.shared.state.lock().await = ClusterState::Connected;
        Ok(())
    }

    /// Stops every monitor and transitions to `Disconnected`. A disconnected `Cluster` rejects
    /// further `select_node` calls with [`ErrorKind::ClusterNotConnected`].
    pub async fn disconnect(&self) {
        let mut monitors = self.shared.monitors.lock().await;
        for (_, handle) in monitors.drain() {
            handle.stop();
        }
        drop(monitors);

        let pools = self.shared.pools.lock().await;
        for pool in pools.values() {
            pool.close();
        }
        drop(pools);

        *self.shared.state.lock().await = ClusterState::Disconnected;
    }

    pub async fn state(&self) -> ClusterState {
        *self.shared.state.lock().await
    }

    /// The most recently published topology snapshot.
    pub fn current_description(&self) -> ClusterDescription {
        self.shared.descriptions.borrow().clone()
    }

    /// Blocks (without holding up the executor) until `selector` matches a node in the topology,
    /// or `timeout` elapses. Requires the cluster to already be `Connected`; [`Cluster::connect`]
    /// uses the same retry loop directly, before that state transition has happened.
    pub async fn select_node(
        &self,
        selector: &NodeSelector,
        timeout: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<NodeDescription> {
        if self.state().await != ClusterState::Connected {
            return Err(Error::from(ErrorKind::ClusterNotConnected));
        }

        self.wait_for_selector(selector, timeout, cancel).await
    }

    /// The retry loop shared by `select_node` and `connect`: asks every monitor to recheck its
    /// node ahead of its normal schedule on every failed attempt, then waits for either a fresh
    /// snapshot or the remaining timeout, whichever comes first.
    async fn wait_for_selector(
        &self,
        selector: &NodeSelector,
        timeout: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<NodeDescription> {
        let deadline = Instant::now() + timeout;
        let mut subscriber = self.shared.messages.subscribe_to_topology_changes();

        loop {
            let snapshot = self.current_description();
            if let Some((address, message)) = snapshot.compatibility_error() {
                return Err(Error::from(ErrorKind::IncompatibleServer {
                    address: address.clone(),
                    message: message.to_owned(),
                }));
            }
            if let Some(node) = selector.select_node(&snapshot) {
                return Ok(node.clone());
            }

            self.shared.messages.request_immediate_check();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::from(ErrorKind::NoNodeSelected {
                    message: format!("no node matched selector {selector:?} within the timeout"),
                }));
            }

            tokio::select! {
                _ = subscriber.wait_for_message(remaining) => {}
                _ = cancel.cancelled() => return Err(Error::from(ErrorKind::Cancelled)),
            }
        }
    }

    /// Re-checks that a previously selected node is still acceptable against the latest snapshot,
    /// used by a pinned [`crate::session::Session`] before reusing a cached node.
    pub(crate) fn ensure_acceptable(&self, selector: &NodeSelector, node: &NodeDescription) -> Result<()> {
        let snapshot = self.current_description();
        let bypasses_role_matching = matches!(snapshot.kind(), ClusterKind::Direct | ClusterKind::Sharded)
            && !matches!(selector, NodeSelector::Bound(_));
        match snapshot.node(node.address()) {
            Some(current) if bypasses_role_matching => {
                if current.is_available() {
                    Ok(())
                } else {
                    Err(Error::from(ErrorKind::NodeNoLongerAcceptable {
                        address: current.address().clone(),
                        message: "node is no longer available".into(),
                    }))
                }
            }
            Some(current) => selector.ensure_acceptable(current),
            None => Err(Error::from(ErrorKind::NodeSelectionLost {
                address: node.address().clone(),
            })),
        }
    }

    /// Forces a synchronous heartbeat round: asks every monitor to recheck immediately and waits
    /// for a resulting snapshot change (or `connect_timeout`, whichever comes first).
    pub async fn verify_state(&self) -> Result<()> {
        if self.state().await != ClusterState::Connected {
            return Err(Error::from(ErrorKind::ClusterNotConnected));
        }

        let mut subscriber = self.shared.messages.subscribe_to_topology_changes();
        self.shared.messages.request_immediate_check();
        subscriber
            .wait_for_message(self.shared.config.connect_timeout)
            .await;
        Ok(())
    }

    /// Starts monitors for any addresses a heartbeat reply mentioned that aren't already being
    /// watched, so a replica set discovered from a partial seed list gets every member without
    /// the caller needing to list them up front. Direct deployments never discover peers: the
    /// one seed is the only node that's ever selectable, regardless of what it reports about
    /// other hosts in its replica set.
    pub(crate) async fn discover_hosts(&self, hosts: &[ServerAddress]) {
        if self.current_description().kind() == ClusterKind::Direct {
            return;
        }
        for address in hosts {
            self.ensure_monitor(address.clone()).await;
        }
    }

    async fn ensure_monitor(&self, address: ServerAddress) {
        let mut monitors = self.shared.monitors.lock().await;
        if monitors.contains_key(&address) {
            return;
        }

        let initial = NodeDescription::unknown(address.clone());
        self.apply_update(initial);

        let handle = Monitor::start(
            address.clone(),
            self.shared.heartbeat_source.clone(),
            self.clone(),
            self.shared.config.heartbeat_frequency,
            self.shared.config.min_heartbeat_frequency,
            self.shared.config.heartbeat_failure_threshold,
        );
        monitors.insert(address, handle);
    }

    /// Applies a fresh [`NodeDescription`] produced by a monitor, publishing a new snapshot and
    /// waking anyone blocked in `select_node` iff anything actually changed.
    pub(crate) fn apply_update(&self, node: NodeDescription) {
        let replica_set_name = node.set_name().map(str::to_owned);
        let changed = self.shared.descriptions.send_if_modified(|current| {
            let next = current.with_node(node.clone(), replica_set_name.clone());
            let diff = current.diff(&next);
            *current = next;
            !diff.is_empty()
        });
        if changed {
            #[cfg(feature = "tracing-unstable")]
            tracing::debug!(description = %self.current_description(), "topology snapshot replaced");
            self.shared.messages.notify_topology_changed();
        }
    }

    pub(crate) fn check_request_subscriber(&self) -> message::ClusterMessageSubscriber {
        self.shared.messages.subscribe_to_check_requests()
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("description", &self.current_description())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::node::{HelloReply, NodeType};

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
    struct NullEstablisher;

    #[async_trait]
    impl ConnectionEstablisher for NullEstablisher {
        async fn establish(
            &self,
            _address: &ServerAddress,
        ) -> Result<Box<dyn crate::pool::Transport>> {
            Err(Error::from(ErrorKind::ConnectFailed {
                address: ServerAddress::new("unused", 0),
                message: "not implemented in this test".into(),
            }))
        }
    }

    #[tokio::test]
    async fn select_node_succeeds_once_a_monitor_reports_in() {
        let config = ClusterConfig::builder()
            .seeds(vec![ServerAddress::new("localhost", 27017)])
            .heartbeat_frequency(Duration::from_millis(50))
            .min_heartbeat_frequency(Duration::from_millis(5))
            .build();
        let source = Arc::new(FixedHeartbeatSource {
            node_type: NodeType::Standalone,
        });
        let cluster = Cluster::new(config, source, Arc::new(NullEstablisher));
        let cancel = tokio_util::sync::CancellationToken::new();
        cluster
            .connect(Duration::from_secs(2), &crate::selection::ReadPreference::nearest(), &cancel)
            .await
            .expect("standalone should connect");

        let node = cluster
            .select_node(
                &NodeSelector::from_read_preference(crate::selection::ReadPreference::nearest()),
                Duration::from_secs(2),
                &cancel,
            )
            .await
            .expect("standalone should satisfy nearest");
        assert_eq!(node.node_type(), NodeType::Standalone);

        cluster.disconnect().await;
    }

    #[tokio::test]
    async fn select_node_rejects_when_disconnected() {
        let config = ClusterConfig::builder()
            .seeds(vec![ServerAddress::new("localhost", 27017)])
            .build();
        let source = Arc::new(FixedHeartbeatSource {
            node_type: NodeType::Standalone,
        });
        let cluster = Cluster::new(config, source, Arc::new(NullEstablisher));

        let cancel = tokio_util::sync::CancellationToken::new();
        let err = cluster
            .select_node(&NodeSelector::Primary, Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(&*err.kind, ErrorKind::ClusterNotConnected));
    }
}
