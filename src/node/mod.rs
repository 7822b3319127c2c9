//! Immutable snapshots of a single node's role, liveness, and build info.

mod heartbeat;

pub use heartbeat::{HeartbeatSource, HelloReply};

use std::{collections::HashMap, time::Duration};

use crate::config::ServerAddress;
use heartbeat::{DRIVER_MAX_WIRE_VERSION, DRIVER_MIN_WIRE_VERSION};

/// A read-preference tag set: an ordered list of these is matched against a node's tags,
/// first-match-wins.
pub type TagSet = HashMap<String, String>;

/// The role a node reported in its most recent heartbeat.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum NodeType {
    /// A single, non-replica-set node.
    Standalone,
    /// The primary node in a replica set.
    Primary,
    /// A data-bearing, read-only member of a replica set.
    Secondary,
    /// A voting-only, non-data-bearing member of a replica set.
    Arbiter,
    /// A hidden, delayed, or otherwise non-voting data-bearing member, selectable as a
    /// secondary but never as a primary.
    Passive,
    /// A sharded-cluster router presenting a primary-like face to the driver.
    Mongos,
    /// A node the cluster hasn't yet heard from, or can't reach.
    Unknown,
}

impl NodeType {
    /// Arbiters never serve data and are never selectable for an operation.
    pub fn is_data_bearing(self) -> bool {
        !matches!(self, NodeType::Arbiter | NodeType::Unknown)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, NodeType::Standalone | NodeType::Primary | NodeType::Mongos)
    }

    /// Secondary-read eligible: ordinary secondaries plus passive (hidden/delayed) members.
    /// Passive members are never selectable as primary, but the spec calls them out as
    /// selectable wherever a secondary is.
    pub fn is_secondary_selectable(self) -> bool {
        matches!(self, NodeType::Secondary | NodeType::Passive)
    }
}

/// The most recently observed connectivity state of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Liveness {
    Connected,
    Disconnected,
    Connecting,
    ConnectionFailed,
}

/// Build-version information reported by a node, as `(major, minor, patch)`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct BuildVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// An immutable snapshot of everything the cluster knows about one node. A new heartbeat never
/// mutates an existing `NodeDescription`; it produces a new one that atomically replaces the
/// old one in the owning [`crate::cluster::ClusterDescription`].
#[derive(Clone, Debug)]
pub struct NodeDescription {
    address: ServerAddress,
    node_type: NodeType,
    liveness: Liveness,
    build_version: BuildVersion,
    max_document_size: u64,
    max_message_size: u64,
    tags: TagSet,
    average_round_trip_time: Option<Duration>,
    set_name: Option<String>,
    error_message: Option<String>,
    compatibility_error: Option<String>,
}

pub(crate) const DEFAULT_MAX_DOCUMENT_SIZE: u64 = 16 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: u64 = 48 * 1024 * 1024;

impl NodeDescription {
    /// The description of a node that hasn't been reached yet.
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            node_type: NodeType::Unknown,
            liveness: Liveness::Connecting,
            build_version: BuildVersion::default(),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tags: TagSet::new(),
            average_round_trip_time: None,
            set_name: None,
            error_message: None,
            compatibility_error: None,
        }
    }

    /// Builds a new description from a successful heartbeat reply.
    pub(crate) fn from_reply(
        address: ServerAddress,
        reply: &HelloReply,
        round_trip_time: Duration,
    ) -> Self {
        Self {
            compatibility_error: compatibility_error_message(&address, reply),
            address,
            node_type: reply.node_type,
            liveness: Liveness::Connected,
            build_version: reply.build_version,
            max_document_size: reply.max_document_size,
            max_message_size: reply.max_message_size,
            tags: reply.tags.clone(),
            average_round_trip_time: Some(round_trip_time),
            set_name: reply.set_name.clone(),
            error_message: None,
        }
    }

    /// Builds a description recording a failed heartbeat.
    pub(crate) fn failed(address: ServerAddress, message: String, still_connecting: bool) -> Self {
        Self {
            address,
            node_type: NodeType::Unknown,
            liveness: if still_connecting {
                Liveness::Connecting
            } else {
                Liveness::ConnectionFailed
            },
            build_version: BuildVersion::default(),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tags: TagSet::new(),
            average_round_trip_time: None,
            set_name: None,
            error_message: Some(message),
            compatibility_error: None,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn is_available(&self) -> bool {
        self.liveness == Liveness::Connected
    }

    pub fn build_version(&self) -> BuildVersion {
        self.build_version
    }

    pub fn max_document_size(&self) -> u64 {
        self.max_document_size
    }

    pub fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// `Some` if this node's reported wire-version range doesn't overlap what this core
    /// supports, per [`crate::node::heartbeat::DRIVER_MIN_WIRE_VERSION`]/`DRIVER_MAX_WIRE_VERSION`.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_deref()
    }

    /// Standard MongoDB tag-matching rule: a node matches a tag set `T` iff every `k -> v` pair
    /// in `T` is present in the node's own tags. An empty tag set matches every node.
    pub fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        tag_set.iter().all(|(k, v)| self.tags.get(k) == Some(v))
    }

    /// Tag sets are tried in order; the first one that yields a non-empty match across a slice
    /// of candidates "wins" and the others are not considered. This helper just answers whether
    /// `self` matches according to that rule applied to a single tag set list.
    pub fn matches_any_tag_set(&self, tag_sets: &[TagSet]) -> bool {
        if tag_sets.is_empty() {
            return true;
        }
        tag_sets.iter().any(|ts| self.matches_tag_set(ts))
    }
}

fn compatibility_error_message(address: &ServerAddress, reply: &HelloReply) -> Option<String> {
    if reply.min_wire_version > DRIVER_MAX_WIRE_VERSION {
        return Some(format!(
            "server at {address} requires wire version {}, but this core only supports up to {}",
            reply.min_wire_version, DRIVER_MAX_WIRE_VERSION,
        ));
    }
    if reply.max_wire_version < DRIVER_MIN_WIRE_VERSION {
        return Some(format!(
            "server at {address} reports wire version {}, but this core requires at least {}",
            reply.max_wire_version, DRIVER_MIN_WIRE_VERSION,
        ));
    }
    None
}
