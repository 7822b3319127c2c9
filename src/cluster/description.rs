//! Immutable topology snapshots.

use std::{collections::HashMap, fmt};

use crate::{
    config::ServerAddress,
    node::{NodeDescription, NodeType},
};

/// The kind of deployment a [`super::Cluster`] believes it is talking to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClusterKind {
    /// A single node addressed directly, regardless of its actual role.
    Direct,
    /// A replica set.
    ReplicaSet,
    /// A sharded cluster, reached through one or more `mongos` routers.
    Sharded,
    /// Not yet classified.
    Unknown,
}

/// An immutable snapshot of a cluster's topology.
///
/// Invariants (enforced by construction, never by a caller): at most one node has role
/// `Primary`; every node appears exactly once; if `kind` is `Direct` there is exactly one node.
#[derive(Clone, Debug)]
pub struct ClusterDescription {
    pub(crate) version: u64,
    kind: ClusterKind,
    replica_set_name: Option<String>,
    nodes: HashMap<ServerAddress, NodeDescription>,
    order: Vec<ServerAddress>,
}

impl ClusterDescription {
    pub(crate) fn unknown() -> Self {
        Self {
            version: 0,
            kind: ClusterKind::Unknown,
            replica_set_name: None,
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub(crate) fn direct(node: NodeDescription) -> Self {
        let address = node.address().clone();
        let mut nodes = HashMap::new();
        nodes.insert(address.clone(), node);
        Self {
            version: 0,
            kind: ClusterKind::Direct,
            replica_set_name: None,
            nodes,
            order: vec![address],
        }
    }

    pub fn kind(&self) -> ClusterKind {
        self.kind
    }

    pub fn replica_set_name(&self) -> Option<&str> {
        self.replica_set_name.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Every node currently known, in discovery order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescription> {
        self.order.iter().filter_map(move |addr| self.nodes.get(addr))
    }

    pub fn node(&self, address: &ServerAddress) -> Option<&NodeDescription> {
        self.nodes.get(address)
    }

    pub fn primary(&self) -> Option<&NodeDescription> {
        self.nodes().find(|n| n.node_type() == NodeType::Primary)
    }

    pub fn has_available_nodes(&self) -> bool {
        self.nodes().any(NodeDescription::is_available)
    }

    /// The first node reporting an incompatible wire-version range, if any. A non-`None` result
    /// here means selection should fail outright rather than return a node that can't actually
    /// be spoken to.
    pub fn compatibility_error(&self) -> Option<(&ServerAddress, &str)> {
        self.nodes()
            .find_map(|n| n.compatibility_error().map(|msg| (n.address(), msg)))
    }

    /// Returns the addresses present in `self` but not in `other`, and vice versa, to decide
    /// whether a replacement snapshot is worth waking readers for and to keep log lines short.
    pub(crate) fn diff(&self, other: &ClusterDescription) -> ClusterDescriptionDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for addr in &other.order {
            if !self.nodes.contains_key(addr) {
                added.push(addr.clone());
            }
        }
        for addr in &self.order {
            match (self.nodes.get(addr), other.nodes.get(addr)) {
                (Some(_), None) => removed.push(addr.clone()),
                (Some(before), Some(after)) => {
                    if before.node_type() != after.node_type()
                        || before.liveness() != after.liveness()
                    {
                        changed.push(addr.clone());
                    }
                }
                _ => {}
            }
        }

        ClusterDescriptionDiff {
            added,
            removed,
            changed,
        }
    }

    /// Returns a copy of this description with `node` inserted or replacing the existing entry
    /// for its address, deriving the cluster kind from the accumulated node roles.
    pub(crate) fn with_node(
        &self,
        node: NodeDescription,
        replica_set_name: Option<String>,
    ) -> ClusterDescription {
        let mut nodes = self.nodes.clone();
        let mut order = self.order.clone();
        let address = node.address().clone();
        if !nodes.contains_key(&address) {
            order.push(address.clone());
        }
        nodes.insert(address, node);

        let kind = if self.kind == ClusterKind::Direct {
            ClusterKind::Direct
        } else if nodes.values().any(|n| n.node_type() == NodeType::Mongos) {
            ClusterKind::Sharded
        } else if replica_set_name.is_some()
            || nodes
                .values()
                .any(|n| matches!(n.node_type(), NodeType::Primary | NodeType::Secondary | NodeType::Arbiter | NodeType::Passive))
        {
            ClusterKind::ReplicaSet
        } else {
            ClusterKind::Unknown
        };

        ClusterDescription {
            version: self.version + 1,
            kind,
            replica_set_name: replica_set_name.or_else(|| self.replica_set_name.clone()),
            nodes,
            order,
        }
    }

    pub(crate) fn with_removed(&self, address: &ServerAddress) -> ClusterDescription {
        let mut nodes = self.nodes.clone();
        let mut order = self.order.clone();
        nodes.remove(address);
        order.retain(|a| a != address);
        ClusterDescription {
            version: self.version + 1,
            kind: self.kind,
            replica_set_name: self.replica_set_name.clone(),
            nodes,
            order,
        }
    }
}

impl fmt::Display for ClusterDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {{ ", self.kind)?;
        for node in self.nodes() {
            write!(f, "{}: {:?}, ", node.address(), node.node_type())?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Default)]
pub(crate) struct ClusterDescriptionDiff {
    pub(crate) added: Vec<ServerAddress>,
    pub(crate) removed: Vec<ServerAddress>,
    pub(crate) changed: Vec<ServerAddress>,
}

impl ClusterDescriptionDiff {
    pub(crate) fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::HelloReply;

    fn addr(n: u16) -> ServerAddress {
        ServerAddress::new("localhost", n)
    }

    #[test]
    fn direct_has_exactly_one_node() {
        let desc = ClusterDescription::direct(NodeDescription::unknown(addr(27017)));
        assert_eq!(desc.nodes().count(), 1);
        assert_eq!(desc.kind(), ClusterKind::Direct);
    }

    #[test]
    fn with_node_tracks_primary_uniquely() {
        let desc = ClusterDescription::unknown();
        let primary = NodeDescription::from_reply(
            addr(1),
            &HelloReply {
                node_type: NodeType::Primary,
                ..HelloReply::standalone()
            },
            std::time::Duration::from_millis(1),
        );
        let desc = desc.with_node(primary, Some("rs0".into()));
        assert_eq!(desc.kind(), ClusterKind::ReplicaSet);
        assert!(desc.primary().is_some());
        assert_eq!(desc.nodes().filter(|n| n.node_type() == NodeType::Primary).count(), 1);
    }

    #[test]
    fn compatibility_error_surfaces_from_a_single_node() {
        let desc = ClusterDescription::unknown();
        let incompatible = NodeDescription::from_reply(
            addr(1),
            &HelloReply {
                max_wire_version: 1,
                min_wire_version: 0,
                ..HelloReply::standalone()
            },
            std::time::Duration::from_millis(1),
        );
        let desc = desc.with_node(incompatible, None);
        assert!(desc.compatibility_error().is_some());
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let a = ClusterDescription::unknown();
        let b = a.with_node(NodeDescription::unknown(addr(1)), None);
        let diff = a.diff(&b);
        assert_eq!(diff.added, vec![addr(1)]);
        assert!(diff.removed.is_empty());

        let c = b.with_removed(&addr(1));
        let diff2 = b.diff(&c);
        assert_eq!(diff2.removed, vec![addr(1)]);
    }
}
