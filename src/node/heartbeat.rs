//! The external heartbeat collaborator (spec §6: "Heartbeat").
//!
//! The core does not speak the wire protocol; it is handed something that can run an "isMaster"
//! / "hello"-equivalent probe against an address and report back a parsed reply. Production
//! callers implement [`HeartbeatSource`] on top of their wire-protocol stack; tests implement it
//! against an in-memory fixture.

use std::time::Duration;

use async_trait::async_trait;

use crate::{config::ServerAddress, error::Result, node::{BuildVersion, NodeType, TagSet}};

/// The lowest wire-protocol version this core supports on a connected node.
pub const DRIVER_MIN_WIRE_VERSION: i32 = 6;
/// The highest wire-protocol version this core supports on a connected node.
pub const DRIVER_MAX_WIRE_VERSION: i32 = 21;

/// A parsed heartbeat reply, as produced by the out-of-scope wire-protocol collaborator.
#[derive(Clone, Debug)]
pub struct HelloReply {
    pub node_type: NodeType,
    pub build_version: BuildVersion,
    pub max_document_size: u64,
    pub max_message_size: u64,
    pub tags: TagSet,
    pub set_name: Option<String>,
    /// Other hosts the replying node reports as part of the same deployment; used to discover
    /// nodes not present in the original seed list.
    pub hosts: Vec<ServerAddress>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
}

impl HelloReply {
    /// A minimal reply for a standalone node, useful in tests.
    pub fn standalone() -> Self {
        Self {
            node_type: NodeType::Standalone,
            build_version: BuildVersion {
                major: 7,
                minor: 0,
                patch: 0,
            },
            max_document_size: crate::node::DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: crate::node::DEFAULT_MAX_MESSAGE_SIZE,
            tags: TagSet::new(),
            set_name: None,
            hosts: Vec::new(),
            min_wire_version: 6,
            max_wire_version: 21,
        }
    }
}

/// Issues a single heartbeat probe against a node.
///
/// Implementations are responsible for the wire protocol and any handshake; the core only needs
/// a parsed result back, along with how long the round trip took.
#[async_trait]
pub trait HeartbeatSource: Send + Sync + std::fmt::Debug {
    async fn check(&self, address: &ServerAddress) -> Result<(HelloReply, Duration)>;
}
