//! The peer-message engine: per-peer protocol state machines, the shared
//! block-download scheduler, headers-first chain discovery and the message
//! pumps that tie them together.
//!
//! Validation, the UTXO set, the block store, the mempool, the address
//! manager and the ban manager are collaborators behind the traits in
//! [`external`]; this crate owns everything between the socket and those
//! seams.

pub mod block_service;
pub mod bloom;
pub mod chain;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod external;
pub mod frame;
pub mod header_ingest;
pub mod inv;
pub mod message;
pub mod partition;
pub mod peer;
pub mod peer_state;
pub mod reindex;
pub mod relay;
pub mod request_manager;
pub mod send_pump;
pub mod thin;

pub use context::{Config, NodeContext};
pub use error::NetError;
pub use peer::{Peer, PeerId, PeerRegistry};
