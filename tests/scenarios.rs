//! End-to-end scenarios exercising the full stack (Session → Cluster → ConnectionPool) against
//! a scripted in-memory heartbeat source and a fake transport, with no real sockets involved.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mongodb_routing_core::{
    cluster::{Cluster, ClusterDescription},
    config::{ClusterConfig, ServerAddress},
    error::ErrorKind,
    node::{HeartbeatSource, HelloReply, NodeType},
    pool::{ConnectionEstablisher, ConnectionPool, Transport},
    selection::ReadPreference,
    session::{OperationOptions, Session, SessionMode},
    Result,
};

/// A heartbeat source whose reported node type per address can be changed mid-test, to script
/// topology transitions like a primary stepping down.
#[derive(Debug, Clone)]
struct ScriptedWorld {
    nodes: Arc<Mutex<HashMap<ServerAddress, NodeType>>>,
    set_name: Option<String>,
}

impl ScriptedWorld {
    fn new(set_name: Option<&str>) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            set_name: set_name.map(String::from),
        }
    }

    fn set(&self, address: ServerAddress, node_type: NodeType) {
        self.nodes.lock().unwrap().insert(address, node_type);
    }
}

#[async_trait]
impl HeartbeatSource for ScriptedWorld {
    async fn check(&self, address: &ServerAddress) -> Result<(HelloReply, Duration)> {
        let node_type = *self
            .nodes
            .lock()
            .unwrap()
            .get(address)
            .unwrap_or(&NodeType::Unknown);
        Ok((
            HelloReply {
                node_type,
                set_name: self.set_name.clone(),
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
    established: AtomicU32,
}

#[async_trait]
impl ConnectionEstablisher for FakeEstablisher {
    async fn establish(&self, _address: &ServerAddress) -> Result<Box<dyn Transport>> {
        self.established.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport))
    }
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

fn config(seeds: Vec<ServerAddress>) -> ClusterConfig {
    ClusterConfig::builder()
        .seeds(seeds)
        .heartbeat_frequency(Duration::from_millis(30))
        .min_heartbeat_frequency(Duration::from_millis(5))
        .build()
}

async fn wait_until(cluster: &Cluster, mut pred: impl FnMut(&ClusterDescription) -> bool) {
    for _ in 0..300 {
        if pred(&cluster.current_description()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true within the test's patience");
}

/// S1 — single-standalone read: a Direct cluster with one standalone node, read under
/// EventuallyConsistent with ReadPreference::Primary. Expect a provider bound to that node, one
/// connection leased and returned on dispose.
#[tokio::test]
async fn s1_single_standalone_read() {
    let address = ServerAddress::new("a", 27017);
    let world = ScriptedWorld::new(None);
    world.set(address.clone(), NodeType::Standalone);

    let establisher = Arc::new(FakeEstablisher::default());
    let cluster = Cluster::new(config(vec![address.clone()]), Arc::new(world), establisher.clone());
    cluster
        .connect(Duration::from_secs(2), &ReadPreference::Primary, &CancellationToken::new())
        .await
        .unwrap();
    wait_until(&cluster, |d| d.node(&address).is_some_and(|n| n.is_available())).await;

    let session = Session::new(cluster.clone(), SessionMode::EventuallyConsistent);
    let mut provider = session
        .create_channel_provider(opts(ReadPreference::Primary, true))
        .await
        .expect("standalone satisfies a direct connection regardless of read preference");
    assert_eq!(provider.server().unwrap().address(), &address);

    let _channel = provider
        .get_channel(Duration::from_secs(1), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(establisher.established.load(Ordering::SeqCst), 1);
    provider.dispose();

    cluster.disconnect().await;
}

/// S2 — replica set read then write under Monotonic: a read before any write may land on a
/// secondary; the first write pins the primary; a subsequent read under the same preference is
/// now served from the primary instead.
#[tokio::test]
async fn s2_replica_set_monotonic_pins_primary_after_write() {
    let primary = ServerAddress::new("p", 27017);
    let secondary1 = ServerAddress::new("s1", 27017);
    let secondary2 = ServerAddress::new("s2", 27017);

    let world = ScriptedWorld::new(Some("rs0"));
    world.set(primary.clone(), NodeType::Primary);
    world.set(secondary1.clone(), NodeType::Secondary);
    world.set(secondary2.clone(), NodeType::Secondary);

    let establisher = Arc::new(FakeEstablisher::default());
    let cluster = Cluster::new(
        config(vec![primary.clone(), secondary1.clone(), secondary2.clone()]),
        Arc::new(world),
        establisher,
    );
    cluster
        .connect(Duration::from_secs(2), &ReadPreference::nearest(), &CancellationToken::new())
        .await
        .unwrap();
    wait_until(&cluster, |d| d.primary().is_some() && d.nodes().count() == 3).await;

    let session = Session::new(cluster.clone(), SessionMode::Monotonic);

    let read1 = session
        .create_channel_provider(opts(ReadPreference::secondary_preferred(), true))
        .await
        .unwrap();
    let read1_address = read1.server().unwrap().address().clone();
    assert_ne!(read1_address, primary);

    let write = session
        .create_channel_provider(opts(ReadPreference::Primary, false))
        .await
        .unwrap();
    assert_eq!(write.server().unwrap().address(), &primary);

    let read2 = session
        .create_channel_provider(opts(ReadPreference::secondary_preferred(), true))
        .await
        .expect("pinned to primary after the write");
    assert_eq!(
        read2.server().unwrap().address(),
        &primary,
        "a read after a write must not return to a secondary under Monotonic"
    );

    cluster.disconnect().await;
}

/// S3 — SingleChannel with two mongos: the first read pins one mongos and a connection; the
/// first write resolves to the same mongos (it presents as primary-like) and reuses the same
/// connection rather than opening a second one.
#[tokio::test]
async fn s3_single_channel_reuses_connection_across_mongos() {
    let mongos1 = ServerAddress::new("m1", 27017);
    let mongos2 = ServerAddress::new("m2", 27017);

    let world = ScriptedWorld::new(None);
    world.set(mongos1.clone(), NodeType::Mongos);
    world.set(mongos2.clone(), NodeType::Mongos);

    let establisher = Arc::new(FakeEstablisher::default());
    let cluster = Cluster::new(
        config(vec![mongos1.clone(), mongos2.clone()]),
        Arc::new(world),
        establisher.clone(),
    );
    cluster
        .connect(Duration::from_secs(2), &ReadPreference::nearest(), &CancellationToken::new())
        .await
        .unwrap();
    wait_until(&cluster, |d| d.nodes().count() == 2).await;

    let session = Session::new(cluster.clone(), SessionMode::SingleChannel);

    let mut read_provider = session
        .create_channel_provider(opts(ReadPreference::nearest(), true))
        .await
        .unwrap();
    let read_channel = read_provider
        .get_channel(Duration::from_secs(1), &CancellationToken::new())
        .await
        .unwrap();
    let read_id = match &read_channel {
        mongodb_routing_core::channel::Channel::Pinned(_, conn) => conn.try_lock().unwrap().id(),
        mongodb_routing_core::channel::Channel::Owned(conn) => conn.id(),
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
        mongodb_routing_core::channel::Channel::Pinned(_, conn) => conn.try_lock().unwrap().id(),
        mongodb_routing_core::channel::Channel::Owned(conn) => conn.id(),
    };

    assert_eq!(read_id, write_id, "mongos qualifies as primary, so the write reuses the read pin");
    assert_eq!(establisher.established.load(Ordering::SeqCst), 1);
}

/// S4 — primary fails over: a session with a pinned primary issues a write, the primary then
/// steps down and a different node is promoted; the next write on the same session surfaces
/// `NodeNoLongerAcceptable` rather than silently following the new primary. A fresh session
/// against the same cluster succeeds.
#[tokio::test]
async fn s4_primary_failover_rejects_stale_pin() {
    let p1 = ServerAddress::new("p1", 27017);
    let p2 = ServerAddress::new("p2", 27017);

    let world = ScriptedWorld::new(Some("rs0"));
    world.set(p1.clone(), NodeType::Primary);
    world.set(p2.clone(), NodeType::Secondary);

    let establisher = Arc::new(FakeEstablisher::default());
    let cluster = Cluster::new(config(vec![p1.clone(), p2.clone()]), Arc::new(world.clone()), establisher);
    cluster
        .connect(Duration::from_secs(2), &ReadPreference::nearest(), &CancellationToken::new())
        .await
        .unwrap();
    wait_until(&cluster, |d| d.primary().is_some()).await;

    let session = Session::new(cluster.clone(), SessionMode::Monotonic);
    let first_write = session
        .create_channel_provider(opts(ReadPreference::Primary, false))
        .await
        .unwrap();
    assert_eq!(first_write.server().unwrap().address(), &p1);
    drop(first_write);

    world.set(p1.clone(), NodeType::Secondary);
    world.set(p2.clone(), NodeType::Primary);
    wait_until(&cluster, |d| d.primary().is_some_and(|n| n.address() == &p2)).await;

    let err = session
        .create_channel_provider(opts(ReadPreference::Primary, false))
        .await
        .unwrap_err();
    assert!(matches!(&*err.kind, ErrorKind::NodeNoLongerAcceptable { .. }));

    let fresh_session = Session::new(cluster.clone(), SessionMode::Monotonic);
    let second_write = fresh_session
        .create_channel_provider(opts(ReadPreference::Primary, false))
        .await
        .expect("a fresh session re-selects and finds the new primary");
    assert_eq!(second_write.server().unwrap().address(), &p2);

    cluster.disconnect().await;
}

/// S5 — selection timeout: no node carries the requested tag, so `select_node` fails with
/// `NoNodeSelected` after roughly the requested timeout, not immediately and not drastically
/// later.
#[tokio::test]
async fn s5_selection_times_out_when_no_node_matches() {
    let secondary1 = ServerAddress::new("s1", 27017);
    let secondary2 = ServerAddress::new("s2", 27017);
    let world = ScriptedWorld::new(Some("rs0"));
    world.set(secondary1.clone(), NodeType::Secondary);
    world.set(secondary2.clone(), NodeType::Secondary);

    let establisher = Arc::new(FakeEstablisher::default());
    let cluster = Cluster::new(
        config(vec![secondary1.clone(), secondary2.clone()]),
        Arc::new(world),
        establisher,
    );
    cluster
        .connect(Duration::from_secs(2), &ReadPreference::secondary_preferred(), &CancellationToken::new())
        .await
        .unwrap();
    wait_until(&cluster, |d| d.nodes().count() == 2).await;
    assert_eq!(
        cluster.current_description().kind(),
        mongodb_routing_core::cluster::ClusterKind::ReplicaSet,
        "two seeds bound to a replica set name must not be classified as Direct"
    );

    let mut east_tags = HashMap::new();
    east_tags.insert("dc".to_string(), "east".to_string());
    let read_preference = ReadPreference::secondary().with_tag_sets(vec![east_tags]);
    let selector = mongodb_routing_core::selection::NodeSelector::from_read_preference(read_preference);

    let start = Instant::now();
    let err = cluster
        .select_node(&selector, Duration::from_millis(50), &CancellationToken::new())
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(&*err.kind, ErrorKind::NoNodeSelected { .. }));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}, selection should fail close to the timeout");

    cluster.disconnect().await;
}

/// S6 — cancellation: a caller blocked in `ConnectionPool::acquire` wakes promptly on
/// cancellation without disturbing an unrelated blocked waiter.
#[tokio::test]
async fn s6_cancellation_wakes_only_the_cancelled_waiter() {
    let establisher = Arc::new(FakeEstablisher::default());
    let pool = ConnectionPool::new(ServerAddress::new("a", 27017), 1, establisher);

    let held = pool
        .acquire(Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();

    let cancelled_token = CancellationToken::new();
    let cancelled_waiter = {
        let pool = pool.clone();
        let token = cancelled_token.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5), &token).await })
    };

    let patient_token = CancellationToken::new();
    let patient_waiter = {
        let pool = pool.clone();
        let token = patient_token.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5), &token).await })
    };

    tokio::task::yield_now().await;
    cancelled_token.cancel();

    let cancelled_result = cancelled_waiter.await.unwrap();
    assert!(cancelled_result.unwrap_err().is_cancelled());
    assert!(
        !patient_waiter.is_finished(),
        "the other waiter must remain blocked after an unrelated cancellation"
    );

    drop(held);
    let patient_result = patient_waiter.await.unwrap();
    assert!(patient_result.is_ok());
}
