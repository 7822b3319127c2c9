//! Turns a [`super::ReadPreference`] (or a pin) into an actual node pick against a topology
//! snapshot.

use rand::seq::SliceRandom;

use crate::{
    cluster::ClusterDescription,
    error::{Error, ErrorKind, Result},
    node::{NodeDescription, NodeType},
    selection::ReadPreference,
};

/// How many otherwise-tied candidates are considered before falling back to the
/// lowest-round-trip-time one. Mirrors the "choose 2, pick the least loaded" shape used by
/// drivers that track in-flight operation counts; this core has no operation-count signal, so it
/// narrows to the single lowest-latency node instead.
const LATENCY_WINDOW_SAMPLE: usize = 2;

/// A policy for picking a node out of a [`ClusterDescription`].
///
/// Built from either a [`ReadPreference`] (the common case: dispatched fresh against the current
/// topology on every call) or a single pinned node (used by a session that has committed to a
/// specific member for the lifetime of a transaction-like sequence of operations).
#[derive(Clone, Debug)]
pub enum NodeSelector {
    /// Only the primary is acceptable.
    Primary,
    /// Dispatch according to a read preference.
    ReadPreference(ReadPreference),
    /// Only the node at this address is acceptable; used once a session has pinned.
    Bound(crate::config::ServerAddress),
}

impl NodeSelector {
    pub fn from_read_preference(read_preference: ReadPreference) -> Self {
        match read_preference {
            ReadPreference::Primary => NodeSelector::Primary,
            other => NodeSelector::ReadPreference(other),
        }
    }

    /// Picks a node out of `snapshot`, or returns `None` if nothing currently qualifies.
    ///
    /// A `Direct` topology has exactly one node and no peers to route around, so every selector
    /// bypasses its usual role/read-preference matching there: the single node is returned
    /// outright as long as it's available, the same way a directly connected client sends every
    /// operation to the one node it was pointed at regardless of that node's actual role. A
    /// `Sharded` topology gets a narrower version of the same bypass: every mongos presents a
    /// primary-like face to the driver and applies the read preference itself server-side, so
    /// (outside of `Bound`) any available router is an acceptable pick.
    pub fn select_node<'a>(&self, snapshot: &'a ClusterDescription) -> Option<&'a NodeDescription> {
        use crate::cluster::ClusterKind;

        if snapshot.kind() == ClusterKind::Direct {
            return snapshot.nodes().find(|n| n.is_available());
        }
        if snapshot.kind() == ClusterKind::Sharded && !matches!(self, NodeSelector::Bound(_)) {
            let routers: Vec<&NodeDescription> = snapshot.nodes().filter(|n| n.is_available()).collect();
            return select_in_latency_window(routers, snapshot.kind());
        }
        match self {
            NodeSelector::Primary => snapshot.primary().filter(|n| n.is_available()),
            NodeSelector::Bound(address) => {
                snapshot.node(address).filter(|n| n.is_available())
            }
            NodeSelector::ReadPreference(read_preference) => {
                select_by_read_preference(snapshot, read_preference)
            }
        }
    }

    /// Re-validates a previously selected (and typically pinned) node against a newer snapshot.
    /// A `Bound` selector always accepts its own address: by the time a session has pinned, the
    /// only remaining question is whether the node still exists, which is the caller's job to
    /// check via `select_node`.
    pub fn ensure_acceptable(&self, node: &NodeDescription) -> Result<()> {
        match self {
            NodeSelector::Primary => {
                let acceptable = node.is_available()
                    && matches!(node.node_type(), NodeType::Primary | NodeType::Mongos);
                if acceptable {
                    Ok(())
                } else {
                    Err(Error::from(ErrorKind::NodeNoLongerAcceptable {
                        address: node.address().clone(),
                        message: "node is no longer the primary".into(),
                    }))
                }
            }
            NodeSelector::Bound(_) => Ok(()),
            NodeSelector::ReadPreference(read_preference) => {
                if matches_read_preference(node, read_preference) {
                    Ok(())
                } else {
                    Err(Error::from(ErrorKind::NodeNoLongerAcceptable {
                        address: node.address().clone(),
                        message: "node no longer satisfies the read preference".into(),
                    }))
                }
            }
        }
    }
}

fn matches_read_preference(node: &NodeDescription, read_preference: &ReadPreference) -> bool {
    if !node.is_available() {
        return false;
    }
    // A mongos applies the read preference itself once the operation reaches it; from the
    // driver's perspective it's an acceptable target under every mode.
    if node.node_type() == NodeType::Mongos {
        return true;
    }
    match read_preference {
        ReadPreference::Primary => node.node_type() == NodeType::Primary,
        ReadPreference::Secondary(opts) => {
            node.node_type().is_secondary_selectable() && node.matches_any_tag_set(&opts.tag_sets)
        }
        ReadPreference::PrimaryPreferred(opts) => {
            node.node_type() == NodeType::Primary
                || (node.node_type().is_secondary_selectable()
                    && node.matches_any_tag_set(&opts.tag_sets))
        }
        ReadPreference::SecondaryPreferred(opts) => {
            node.node_type() == NodeType::Primary
                || (node.node_type().is_secondary_selectable()
                    && node.matches_any_tag_set(&opts.tag_sets))
        }
        ReadPreference::Nearest(opts) => {
            (node.node_type() == NodeType::Primary || node.node_type().is_secondary_selectable())
                && node.matches_any_tag_set(&opts.tag_sets)
        }
    }
}

/// Implements the per-mode candidate rules from the read-preference spec: `Secondary` only ever
/// considers secondaries; `PrimaryPreferred`/`SecondaryPreferred` prefer one role but fall back to
/// the other when it's empty; `Nearest` pools both roles together.
fn select_by_read_preference<'a>(
    snapshot: &'a ClusterDescription,
    read_preference: &ReadPreference,
) -> Option<&'a NodeDescription> {
    match read_preference {
        ReadPreference::Primary => snapshot.primary().filter(|n| n.is_available()),
        ReadPreference::Secondary(opts) => {
            let candidates = secondaries(snapshot, &opts.tag_sets);
            select_in_latency_window(candidates, snapshot.kind())
        }
        ReadPreference::PrimaryPreferred(opts) => {
            if let Some(primary) = snapshot.primary().filter(|n| n.is_available()) {
                Some(primary)
            } else {
                let candidates = secondaries(snapshot, &opts.tag_sets);
                select_in_latency_window(candidates, snapshot.kind())
            }
        }
        ReadPreference::SecondaryPreferred(opts) => {
            let candidates = secondaries(snapshot, &opts.tag_sets);
            if let Some(node) = select_in_latency_window(candidates, snapshot.kind()) {
                Some(node)
            } else {
                snapshot.primary().filter(|n| n.is_available())
            }
        }
        ReadPreference::Nearest(opts) => {
            let candidates: Vec<&NodeDescription> = snapshot
                .nodes()
                .filter(|n| {
                    n.is_available()
                        && (n.node_type() == NodeType::Primary || n.node_type().is_secondary_selectable())
                        && n.matches_any_tag_set(&opts.tag_sets)
                })
                .collect();
            select_in_latency_window(candidates, snapshot.kind())
        }
    }
}

fn secondaries<'a>(
    snapshot: &'a ClusterDescription,
    tag_sets: &[crate::node::TagSet],
) -> Vec<&'a NodeDescription> {
    snapshot
        .nodes()
        .filter(|n| {
            n.is_available() && n.node_type().is_secondary_selectable() && n.matches_any_tag_set(tag_sets)
        })
        .collect()
}

/// Narrows `candidates` to those within [`crate::config::ClusterConfig::local_threshold`] of the
/// fastest one, then breaks ties by randomly sampling a handful and keeping the lowest latency of
/// the sample. A `Direct` topology (single seed, no peers to compare against) always returns its
/// one node outright regardless of latency.
fn select_in_latency_window<'a>(
    mut candidates: Vec<&'a NodeDescription>,
    kind: crate::cluster::ClusterKind,
) -> Option<&'a NodeDescription> {
    if candidates.is_empty() {
        return None;
    }
    if matches!(kind, crate::cluster::ClusterKind::Direct) || candidates.len() == 1 {
        return candidates.into_iter().next();
    }

    candidates.sort_by_key(|n| n.average_round_trip_time().unwrap_or(std::time::Duration::MAX));
    let fastest = candidates[0].average_round_trip_time().unwrap_or_default();
    let window = fastest + super::DEFAULT_LATENCY_WINDOW;
    let within_window: Vec<&NodeDescription> = candidates
        .into_iter()
        .take_while(|n| n.average_round_trip_time().unwrap_or_default() <= window)
        .collect();

    let mut rng = rand::thread_rng();
    let mut sample: Vec<&NodeDescription> = within_window
        .choose_multiple(&mut rng, LATENCY_WINDOW_SAMPLE.min(within_window.len()))
        .copied()
        .collect();
    sample.sort_by_key(|n| n.average_round_trip_time().unwrap_or(std::time::Duration::MAX));
    sample.into_iter().next()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::node::HelloReply;

    fn node(port: u16, node_type: NodeType, rtt_ms: u64) -> NodeDescription {
        NodeDescription::from_reply(
            crate::config::ServerAddress::new("localhost", port),
            &HelloReply {
                node_type,
                ..HelloReply::standalone()
            },
            Duration::from_millis(rtt_ms),
        )
    }

    fn snapshot_with(nodes: Vec<NodeDescription>) -> ClusterDescription {
        let mut desc = ClusterDescription::unknown();
        for n in nodes {
            desc = desc.with_node(n, Some("rs0".into()));
        }
        desc
    }

    #[test]
    fn primary_selector_requires_primary() {
        let snapshot = snapshot_with(vec![node(1, NodeType::Secondary, 1)]);
        assert!(NodeSelector::Primary.select_node(&snapshot).is_none());

        let snapshot = snapshot_with(vec![node(1, NodeType::Primary, 1)]);
        assert!(NodeSelector::Primary.select_node(&snapshot).is_some());
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let snapshot = snapshot_with(vec![node(1, NodeType::Primary, 1)]);
        let selector = NodeSelector::from_read_preference(ReadPreference::secondary_preferred());
        let picked = selector.select_node(&snapshot).expect("fallback to primary");
        assert_eq!(picked.node_type(), NodeType::Primary);
    }

    #[test]
    fn nearest_picks_lowest_latency_node() {
        let snapshot = snapshot_with(vec![
            node(1, NodeType::Primary, 100),
            node(2, NodeType::Secondary, 1),
        ]);
        let selector = NodeSelector::from_read_preference(ReadPreference::nearest());
        let picked = selector.select_node(&snapshot).expect("some node");
        assert_eq!(picked.address().port, 2);
    }

    #[test]
    fn ensure_acceptable_rejects_stale_primary_pin() {
        let secondary = node(1, NodeType::Secondary, 1);
        let err = NodeSelector::Primary.ensure_acceptable(&secondary).unwrap_err();
        assert!(matches!(&*err.kind, ErrorKind::NodeNoLongerAcceptable { .. }));
    }
}
