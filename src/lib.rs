//! Session routing and server-selection core for a MongoDB-style client driver.
//!
//! Given a cluster of one or more nodes, this crate chooses which node an operation runs
//! against, acquires a connection to it, enforces per-session consistency guarantees, and
//! releases resources when the session and the operation finish. It does not speak the wire
//! protocol, encode BSON, or parse a `mongodb://` connection string; those are external
//! collaborators whose interfaces this crate depends on (see [`pool::Transport`],
//! [`pool::ConnectionEstablisher`], [`node::HeartbeatSource`]).
//!
//! The six components, leaves first: [`node::NodeDescription`], [`pool::ConnectionPool`],
//! [`cluster::Cluster`], [`selection::NodeSelector`], [`channel::ChannelProvider`],
//! [`session::Session`].

pub mod channel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod pool;
pub mod selection;
pub mod session;

pub use error::{Error, ErrorKind, Result};
