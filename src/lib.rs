//! Core of an outbound P2P client for an EOS-family chain node: wire
//! codec and framing, per-peer connections, a single dispatcher, a peer
//! supervisor with reconnect/backoff, and a per-peer sync engine that
//! catches up on irreversible blocks before settling into live mode.
//!
//! Block validation, signature verification, transaction execution,
//! fork resolution, producer scheduling and serving inbound peers are
//! out of scope: this crate is an outbound client only.

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod peer;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod wire;

pub use client::{Client, ClientOptions};
pub use dispatcher::{Dispatcher, Envelope, Handler};
pub use error::{Error, Result};
pub use peer::{HandshakeInfo, Peer, PeerConfig};
pub use store::{BlockStore, BlockStoreState, InMemoryBlockStore};
pub use supervisor::{PeerEvent, PeerStatus, Supervisor};
pub use sync::SyncEngine;
