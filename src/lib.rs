// streamnet forms and maintains a peer-to-peer overlay used to relay
// publish/subscribe traffic for many independent stream partitions. A tracker
// observes what every participant reports and hands out neighbour sets that
// shape a bounded-degree mesh per partition; participants open direct QUIC
// connections to each other, negotiated through the tracker, and relay data
// along that mesh.
//
// Every process runs a single control loop. Network IO happens in small
// per-connection tasks that only move frames between sockets and channels, so
// overlay state and connection records are owned by exactly one task and are
// never locked.

pub mod config;
pub mod error;
mod hex;
pub mod identity;
pub mod metrics;
pub mod net;
pub mod protocol;
pub mod registry;

#[cfg(feature = "node")]
pub mod node;
#[cfg(feature = "tracker")]
pub mod tracker;

pub use error::Error;
pub use identity::{Location, PeerId, PeerInfo, PeerRole};
pub use protocol::messages::StreamPartitionKey;
