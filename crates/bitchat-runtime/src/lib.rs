//! Tokio runtime for the bitchat mesh.
//!
//! Production "glue" around [`bitchat_core`]'s Sans-IO driver: the
//! byte-duplex [`link::Link`] contract with a TCP reference
//! implementation, a redb-backed secure store, and the [`node::Node`]
//! task set (link readers/writers, inbound dispatch, maintenance
//! timer). The radio driver for real deployments implements
//! [`link::Link`] and plugs into [`node::Node::attach_link`] unchanged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod link;
pub mod node;
pub mod store;

pub use link::{Link, LinkError, MAX_FRAME_LEN, TcpLink};
pub use node::{MeshDelegate, Node, NodeConfig, now_ms};
pub use store::RedbSecureStore;
