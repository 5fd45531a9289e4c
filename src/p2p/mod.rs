//! P2P networking layer - libp2p transport, command protocol and content routing
//!
//! Handles:
//! - Multi-transport (QUIC + TCP with Noise/Yamux)
//! - Command protocol codec (status object followed by raw payload)
//! - Peer discovery (mDNS, Kademlia, identify) and peer-set tracking
//! - Provider advertisement and lookup, gossip broadcast

pub mod content;
pub mod coordinator;
pub mod handle;
pub mod peers;
pub mod protocols;
pub mod transport;

pub use content::ContentRouter;
pub use coordinator::Coordinator;
pub use handle::{P2pHandle, PeerTransport};
pub use transport::build_swarm;
