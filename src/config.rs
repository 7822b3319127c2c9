//! The configuration structure injected into a [`crate::cluster::Cluster`].
//!
//! The core never parses a `mongodb://` connection string itself (that belongs to a layer
//! above this one, per the URI-parsing collaborator this core assumes); callers hand it an
//! already-resolved [`ClusterConfig`]. There is no process-wide mutable configuration
//! singleton, so multiple [`crate::cluster::Cluster`]s may coexist independently in one
//! process.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::selection::ReadPreference;

/// The network address of a single node.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    /// The hostname or IP address of the node.
    pub host: String,

    /// The TCP port the node listens on. Defaults to the standard MongoDB port.
    pub port: u16,
}

impl ServerAddress {
    pub const DEFAULT_PORT: u16 = 27017;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Supplies credentials lazily, just before a connection handshake. The core calls this but
/// never inspects the returned value; authentication itself is out of this core's scope.
pub trait CredentialSupplier: Send + Sync + fmt::Debug {
    /// Returns an opaque credential blob to hand to the (out-of-scope) authentication
    /// handshake collaborator.
    fn credential(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>>;
}

/// Configuration for a [`crate::cluster::Cluster`], supplied by the caller instead of being
/// parsed from a connection string by this core.
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ClusterConfig {
    /// The seed list of nodes to contact when establishing the topology.
    pub seeds: Vec<ServerAddress>,

    /// The replica set name, if the deployment is expected to be a replica set.
    #[builder(default)]
    pub replica_set_name: Option<String>,

    /// The read preference to use when one isn't supplied for a given operation.
    #[builder(default = ReadPreference::Primary)]
    pub default_read_preference: ReadPreference,

    /// The maximum number of connections a node's pool may have checked out or idle at once.
    #[builder(default = 100)]
    pub max_pool_size: u32,

    /// The minimum number of idle connections a node's pool tries to maintain.
    #[builder(default)]
    pub min_pool_size: Option<u32>,

    /// How long a caller will wait to check out a connection before failing with `Timeout`.
    #[builder(default)]
    pub wait_queue_timeout: Option<Duration>,

    /// How long a TCP connect attempt may take before failing.
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    /// How long a socket operation may take before failing. Enforced by the wire-protocol
    /// collaborator, not this core, but carried here since it's part of the settings structure
    /// the core is handed.
    #[builder(default)]
    pub socket_timeout: Option<Duration>,

    /// The interval between heartbeats against a healthy node.
    #[builder(default = Duration::from_secs(10))]
    pub heartbeat_frequency: Duration,

    /// The minimum interval enforced between heartbeats even when rechecks are requested.
    #[builder(default = Duration::from_millis(500))]
    pub min_heartbeat_frequency: Duration,

    /// The width of the latency window used when choosing among otherwise-equal nodes.
    #[builder(default = Duration::from_millis(15))]
    pub local_threshold: Duration,

    /// Number of consecutive failed heartbeats before a node is marked `ConnectionFailed`.
    #[builder(default = 1)]
    pub heartbeat_failure_threshold: u32,

    /// Whether connections to nodes should be established over TLS. The core does not
    /// implement TLS itself; it forwards this flag to the (out-of-scope) connection
    /// establisher.
    #[builder(default)]
    pub tls: bool,

    /// An optional credential supplier consulted by the (out-of-scope) handshake collaborator.
    #[builder(default, setter(strip_option))]
    pub credential_supplier: Option<Arc<dyn CredentialSupplier>>,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("seeds", &self.seeds)
            .field("replica_set_name", &self.replica_set_name)
            .field("default_read_preference", &self.default_read_preference)
            .field("max_pool_size", &self.max_pool_size)
            .field("min_pool_size", &self.min_pool_size)
            .field("wait_queue_timeout", &self.wait_queue_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("heartbeat_frequency", &self.heartbeat_frequency)
            .field("min_heartbeat_frequency", &self.min_heartbeat_frequency)
            .field("local_threshold", &self.local_threshold)
            .field(
                "heartbeat_failure_threshold",
                &self.heartbeat_failure_threshold,
            )
            .field("tls", &self.tls)
            .field("credential_supplier", &self.credential_supplier.is_some())
            .finish()
    }
}

/// Per-session configuration governing its consistency mode.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// The consistency mode the session should enforce. See
    /// [`crate::session::SessionMode`] for the semantics of each variant.
    pub mode: crate::session::SessionMode,
}
