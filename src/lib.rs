//! Weft: a peer-to-peer virtual network router.
//!
//! Captures Ethernet frames from a local interface, forwards them across
//! an overlay mesh of encrypted UDP tunnels, and keeps every instance's
//! view of the topology converged through gossip.

pub mod capture;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod ethernet;
pub mod gossip;
pub mod maccache;
pub mod name;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod routes;

// Re-export identity types
pub use name::{NameError, PeerName};

// Re-export config types
pub use config::{Config, ConfigError, ConnectionConfig, GossipConfig, MacCacheConfig, RouterConfig};

// Re-export capture types
pub use capture::{MemoryDevice, MemorySink, PacketSink, PacketSource};

// Re-export peer/topology types
pub use peer::{Peer, PeerError, PeerNameSet, Peers, PeerSummary};
pub use routes::Routes;

// Re-export connection types
pub use connection::{
    cross_connection_winner, maker::ConnectionMaker, ConnEvent, Connection, ConnectionError,
    ConnectionState, CrossWinner,
};

// Re-export gossip types
pub use gossip::{GossipChannel, GossipError, Gossiper};

// Re-export cache types
pub use maccache::MacCache;

// Re-export router types
pub use router::{Router, RouterError, TOPOLOGY_TOPIC};
