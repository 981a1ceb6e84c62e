//! Sans-IO mesh logic for bitchat.
//!
//! Everything between the wire codec and the runtime lives here: the
//! flood router with duplicate suppression, fragment reassembly, the
//! per-peer Noise session manager, the peer directory that survives
//! peer-id rotation, the store-and-forward cache, channel membership,
//! the persistent identity store, and the [`mesh::MeshService`] driver
//! that orchestrates them.
//!
//! Nothing in this crate performs I/O or reads a clock: events carry
//! their own timestamps, and the driver returns actions instead of
//! executing them. The runtime crate supplies links, timers, and the
//! platform secure store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod chat;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fragment;
pub mod identity;
pub mod mesh;
pub mod peer_directory;
pub mod router;
pub mod secure_store;
pub mod session;
pub mod store_forward;

pub use channel::{ChannelRegistry, JoinOutcome};
pub use chat::{ChatMessage, Command, DeliveryStatus};
pub use config::MeshConfig;
pub use error::{MeshError, Result, StoreError};
pub use identity::IdentityStore;
pub use mesh::{AppEvent, LinkId, MeshAction, MeshCommand, MeshEvent, MeshService, SendTarget};
pub use peer_directory::{PeerDirectory, PeerRecord};
pub use router::{DropCounters, RouteOutcome, Router};
pub use secure_store::{MemorySecureStore, Preferences, SecureStore};
pub use session::{SendOutcome, SessionManager, SessionState};
pub use store_forward::StoreForwardCache;
